//! Empfangs-Pipeline: Wire-Paket -> Klartext-Frame
//!
//! Der Decryptor haelt eine geordnete Liste von `CipherManager`n
//! (vorn = aeltester). Waehrend einer Ratchet-Transition leben alter und
//! neuer Manager nebeneinander, damit verspaetete Frames der alten
//! Epoche noch entschluesseln; abgelaufene Manager werden vorn
//! abgeraeumt. Versuche laufen newest-first.
//!
//! Klartext-Pakete werden nur innerhalb des Passthrough-Fensters
//! durchgereicht; das Opus-Silence-Paket umgeht die Entschluesselung
//! grundsaetzlich.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use sotto_protocol::codec::MediaType;
use sotto_protocol::frame::{
    AES_GCM_128_NONCE_BYTES, AES_GCM_128_TRUNCATED_SYNC_NONCE_OFFSET, OPUS_SILENCE_PACKET,
    RATCHET_GENERATION_SHIFT_BITS,
};
use sotto_protocol::inbound::InboundFrameParser;

use crate::cipher_manager::CipherManager;
use crate::clock::{MonotonicClock, TimePoint, TIME_MAX};
use crate::ratchet::KeyRatchet;
use crate::stats::{MediaStats, MediaStatsSnapshot};

/// Standard-Gnadenfrist fuer Transitionen
pub const DEFAULT_TRANSITION_EXPIRY: Duration = Duration::from_secs(10);

const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Entschluesselt empfangene Medien-Frames
pub struct Decryptor {
    clock: Arc<dyn MonotonicClock>,
    /// Vorn der aelteste, hinten der aktive Manager
    managers: Mutex<VecDeque<CipherManager>>,
    allow_passthrough_until: Mutex<TimePoint>,
    parser_pool: Mutex<Vec<InboundFrameParser>>,
    stats: [MediaStats; 2],
    last_stats_time: Mutex<TimePoint>,
}

impl Decryptor {
    pub fn new(clock: Arc<dyn MonotonicClock>) -> Self {
        let last_stats_time = clock.now();
        Self {
            clock,
            managers: Mutex::new(VecDeque::new()),
            allow_passthrough_until: Mutex::new(Duration::ZERO),
            parser_pool: Mutex::new(Vec::new()),
            stats: [MediaStats::default(), MediaStats::default()],
            last_stats_time: Mutex::new(last_stats_time),
        }
    }

    /// Leitet den Wechsel auf einen neuen Key-Ratchet ein.
    ///
    /// Alle vorhandenen Manager bekommen `now + transition_expiry` als
    /// Ablauf (nie spaeter als ihr bisheriger); ein neuer Manager wird
    /// hinten angehaengt. `None` raeumt nur ab (geordneter Abbau).
    pub fn transition_to_key_ratchet(
        &self,
        ratchet: Option<Box<dyn KeyRatchet>>,
        transition_expiry: Duration,
    ) {
        info!(
            expiry_secs = transition_expiry.as_secs(),
            neuer_ratchet = ratchet.is_some(),
            "Ratchet-Transition"
        );

        let expiry = self.clock.now().saturating_add(transition_expiry);
        let mut managers = self.managers.lock();
        for manager in managers.iter_mut() {
            manager.update_expiry(expiry);
        }
        if let Some(ratchet) = ratchet {
            managers.push_back(CipherManager::new(Arc::clone(&self.clock), ratchet));
        }
    }

    /// Oeffnet bzw. schliesst das Fenster fuer unverschluesselte Frames.
    pub fn transition_to_passthrough_mode(&self, passthrough: bool, transition_expiry: Duration) {
        let mut until = self.allow_passthrough_until.lock();
        if passthrough {
            *until = TIME_MAX;
        } else {
            let max_expiry = self.clock.now().saturating_add(transition_expiry);
            *until = (*until).min(max_expiry);
        }
    }

    /// Obergrenze fuer die Klartextgroesse (kein Wachstum beim
    /// Entschluesseln)
    pub fn max_plaintext_byte_size(_media: MediaType, encrypted_size: usize) -> usize {
        encrypted_size
    }

    pub fn stats(&self, media: MediaType) -> MediaStatsSnapshot {
        self.stats[media.index()].snapshot()
    }

    /// Entschluesselt `encrypted` nach `out`; 0 bedeutet Fehlschlag.
    pub fn decrypt(&self, media: MediaType, encrypted: &[u8], out: &mut [u8]) -> usize {
        let start = self.clock.now();
        let stats = &self.stats[media.index()];

        // Silence-Frames umgehen die Entschluesselung
        if media == MediaType::Audio && encrypted == OPUS_SILENCE_PACKET {
            trace!("Silence-Paket wird durchgereicht");
            if out.len() < encrypted.len() {
                return 0;
            }
            out[..encrypted.len()].copy_from_slice(encrypted);
            return encrypted.len();
        }

        self.cleanup_expired_managers();

        let mut parser = self.get_or_create_parser();
        parser.parse_frame(encrypted);

        let can_passthrough = *self.allow_passthrough_until.lock() > start;
        if !parser.is_encrypted() {
            let written = if can_passthrough && out.len() >= encrypted.len() {
                out[..encrypted.len()].copy_from_slice(encrypted);
                stats.passthrough_count.fetch_add(1, Ordering::Relaxed);
                encrypted.len()
            } else {
                info!("Klartext-Frame ausserhalb des Passthrough-Fensters verworfen");
                stats.failure_count.fetch_add(1, Ordering::Relaxed);
                0
            };
            self.return_parser(parser);
            return written;
        }

        // Newest-first: der aktive Manager sitzt hinten
        let mut success = false;
        {
            let mut managers = self.managers.lock();
            for manager in managers.iter_mut().rev() {
                if self.decrypt_with_manager(manager, media, &mut parser) {
                    success = true;
                    break;
                }
            }
        }

        let written = if success {
            stats.success_count.fetch_add(1, Ordering::Relaxed);
            parser.reconstruct_frame(out)
        } else {
            stats.failure_count.fetch_add(1, Ordering::Relaxed);
            warn!(
                ?media,
                groesse = encrypted.len(),
                manager = self.managers.lock().len(),
                passthrough = can_passthrough,
                "Kein Manager konnte den Frame entschluesseln"
            );
            0
        };

        let end = self.clock.now();
        stats.duration_us.fetch_add(
            end.saturating_sub(start).as_micros() as u64,
            Ordering::Relaxed,
        );
        self.maybe_log_stats(end);
        self.return_parser(parser);
        written
    }

    fn decrypt_with_manager(
        &self,
        manager: &mut CipherManager,
        media: MediaType,
        parser: &mut InboundFrameParser,
    ) -> bool {
        let truncated_nonce = parser.truncated_nonce();
        let generation =
            manager.compute_wrapped_generation(truncated_nonce >> RATCHET_GENERATION_SHIFT_BITS);

        if !manager.can_process_nonce(generation, truncated_nonce) {
            debug!(truncated_nonce, "Nonce bereits verarbeitet");
            return false;
        }

        let Some(cipher) = manager.get_cipher(generation) else {
            debug!(generation, "Kein Cipher fuer diese Generation");
            return false;
        };

        // Die trunkierte Nonce sitzt am Ende des 12-Byte-Puffers
        let mut nonce_buffer = [0u8; AES_GCM_128_NONCE_BYTES];
        nonce_buffer[AES_GCM_128_TRUNCATED_SYNC_NONCE_OFFSET..]
            .copy_from_slice(&truncated_nonce.to_be_bytes());

        let tag = *parser.tag();
        let (ciphertext, authenticated, plaintext) = parser.decrypt_buffers();
        let ok = cipher
            .decrypt(plaintext, ciphertext, &tag, &nonce_buffer, authenticated)
            .is_ok();
        self.stats[media.index()]
            .attempts
            .fetch_add(1, Ordering::Relaxed);

        if ok {
            manager.report_cipher_success(generation, truncated_nonce);
        }
        ok
    }

    fn cleanup_expired_managers(&self) {
        let mut managers = self.managers.lock();
        while managers.front().is_some_and(|manager| manager.is_expired()) {
            info!("Abgelaufener Cipher-Manager entfernt");
            managers.pop_front();
        }
    }

    fn get_or_create_parser(&self) -> InboundFrameParser {
        self.parser_pool.lock().pop().unwrap_or_default()
    }

    fn return_parser(&self, parser: InboundFrameParser) {
        self.parser_pool.lock().push(parser);
    }

    fn maybe_log_stats(&self, now: TimePoint) {
        {
            let mut last = self.last_stats_time.lock();
            if now <= last.saturating_add(STATS_INTERVAL) {
                return;
            }
            *last = now;
        }
        info!(
            audio = %self.stats[MediaType::Audio.index()].snapshot().zusammenfassung(),
            video = %self.stats[MediaType::Video.index()].snapshot().zusammenfassung(),
            "Entschluesselungs-Statistik"
        );
    }
}

impl std::fmt::Debug for Decryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decryptor")
            .field("managers", &self.managers.lock().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratchet::ChainKeyRatchet;

    fn test_decryptor() -> (Arc<ManualClock>, Decryptor) {
        let clock = Arc::new(ManualClock::new());
        let decryptor = Decryptor::new(clock.clone());
        (clock, decryptor)
    }

    #[test]
    fn silence_paket_wird_durchgereicht() {
        let (_clock, decryptor) = test_decryptor();
        let mut out = [0u8; 8];
        let written = decryptor.decrypt(MediaType::Audio, &OPUS_SILENCE_PACKET, &mut out);
        assert_eq!(written, 3);
        assert_eq!(&out[..3], &OPUS_SILENCE_PACKET);
    }

    #[test]
    fn silence_nur_fuer_audio() {
        let (_clock, decryptor) = test_decryptor();
        let mut out = [0u8; 8];
        // Fuer Video ist das Muster ein gewoehnlicher (ungueltiger) Frame
        let written = decryptor.decrypt(MediaType::Video, &OPUS_SILENCE_PACKET, &mut out);
        assert_eq!(written, 0);
    }

    #[test]
    fn klartext_ohne_fenster_wird_verworfen() {
        let (_clock, decryptor) = test_decryptor();
        let mut out = [0u8; 32];
        assert_eq!(decryptor.decrypt(MediaType::Audio, b"klartext", &mut out), 0);
        assert_eq!(decryptor.stats(MediaType::Audio).failure_count, 1);
    }

    #[test]
    fn klartext_im_fenster_wird_durchgereicht() {
        let (_clock, decryptor) = test_decryptor();
        decryptor.transition_to_passthrough_mode(true, DEFAULT_TRANSITION_EXPIRY);
        let mut out = [0u8; 32];
        let written = decryptor.decrypt(MediaType::Audio, b"klartext", &mut out);
        assert_eq!(written, 8);
        assert_eq!(&out[..8], b"klartext");
        assert_eq!(decryptor.stats(MediaType::Audio).passthrough_count, 1);
    }

    #[test]
    fn passthrough_fenster_schliesst() {
        let (clock, decryptor) = test_decryptor();
        decryptor.transition_to_passthrough_mode(true, DEFAULT_TRANSITION_EXPIRY);
        decryptor.transition_to_passthrough_mode(false, Duration::from_secs(3));

        let mut out = [0u8; 32];
        assert!(decryptor.decrypt(MediaType::Audio, b"klartext", &mut out) > 0);

        clock.advance(Duration::from_secs(4));
        assert_eq!(decryptor.decrypt(MediaType::Audio, b"klartext", &mut out), 0);
    }

    #[test]
    fn passthrough_ende_ohne_frist() {
        let (_clock, decryptor) = test_decryptor();
        decryptor.transition_to_passthrough_mode(true, DEFAULT_TRANSITION_EXPIRY);
        decryptor.transition_to_passthrough_mode(false, Duration::ZERO);
        // `until == now` - das Fenster ist sofort zu
        let mut out = [0u8; 32];
        assert_eq!(decryptor.decrypt(MediaType::Audio, b"klartext", &mut out), 0);
    }

    #[test]
    fn ohne_manager_schlaegt_alles_fehl() {
        let (_clock, decryptor) = test_decryptor();
        let mut out = [0u8; 64];
        // Ein syntaktisch gueltiger, aber nicht entschluesselbarer Frame:
        // 7 Byte Body, Null-Tag, Nonce 0, keine Ranges
        let mut frame = vec![0u8; 20];
        frame[17] = 13;
        frame[18..20].copy_from_slice(&sotto_protocol::frame::MARKER_BYTES.to_be_bytes());
        assert_eq!(decryptor.decrypt(MediaType::Audio, &frame, &mut out), 0);
        assert_eq!(decryptor.stats(MediaType::Audio).failure_count, 1);
    }

    #[test]
    fn graceful_teardown_ohne_neuen_ratchet() {
        let (clock, decryptor) = test_decryptor();
        decryptor.transition_to_key_ratchet(
            Some(Box::new(ChainKeyRatchet::new(&[0x33; 32]))),
            DEFAULT_TRANSITION_EXPIRY,
        );
        assert_eq!(decryptor.managers.lock().len(), 1);

        // Abbau: nur Ablauf klemmen, kein neuer Manager
        decryptor.transition_to_key_ratchet(None, Duration::from_secs(2));
        assert_eq!(decryptor.managers.lock().len(), 1);

        clock.advance(Duration::from_secs(3));
        decryptor.cleanup_expired_managers();
        assert!(decryptor.managers.lock().is_empty());
    }

    #[test]
    fn transition_haengt_neuen_manager_hinten_an() {
        let (_clock, decryptor) = test_decryptor();
        decryptor.transition_to_key_ratchet(
            Some(Box::new(ChainKeyRatchet::new(&[0x33; 32]))),
            DEFAULT_TRANSITION_EXPIRY,
        );
        decryptor.transition_to_key_ratchet(
            Some(Box::new(ChainKeyRatchet::new(&[0x44; 32]))),
            DEFAULT_TRANSITION_EXPIRY,
        );
        assert_eq!(decryptor.managers.lock().len(), 2);
    }
}
