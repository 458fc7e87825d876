//! Sende-Pipeline: Frame -> verschluesseltes Wire-Paket
//!
//! Der Encryptor haelt den aktuellen Key-Ratchet und einen gecachten
//! Cipher, rollt die trunkierte Sync-Nonce monoton vor und baut um den
//! Ciphertext den Frame-Trailer. Weil manche Packetizer (H.26x)
//! bestimmte Byte-Folgen nicht vertragen, wird der fertige Frame gegen
//! den Codec-Guard geprueft und bei einem Treffer mit der naechsten
//! Nonce neu verschluesselt - ein Nonce-Inkrement veraendert Ciphertext,
//! Tag und die hinteren Nonce-Bytes.
//!
//! Threading: `key_gen`-Mutex schuetzt Ratchet, Generation, Cipher und
//! Nonce; er wird nie ueber den AEAD-Aufruf gehalten. Der Builder-Pool
//! haelt seinen Mutex nur fuer push/pop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use sotto_protocol::codec::{Codec, MediaType};
use sotto_protocol::frame::{
    TruncatedSyncNonce, AES_GCM_128_NONCE_BYTES, AES_GCM_128_TRUNCATED_SYNC_NONCE_OFFSET,
    AES_GCM_128_TRUNCATED_TAG_BYTES, MARKER_BYTES, RATCHET_GENERATION_SHIFT_BITS,
    SUPPLEMENTAL_BYTES, TRANSFORM_PADDING_BYTES,
};
use sotto_protocol::guard::validate_encrypted_frame;
use sotto_protocol::leb128::{leb128_size, write_leb128};
use sotto_protocol::outbound::OutboundFrameBuilder;
use sotto_protocol::{serialize_unencrypted_ranges, unencrypted_ranges_size};

use crate::cipher::AeadCipher;
use crate::cipher_manager::compute_wrapped_generation;
use crate::clock::{MonotonicClock, TimePoint};
use crate::error::{CryptoError, CryptoResult};
use crate::ratchet::{KeyGeneration, KeyRatchet};
use crate::stats::{MediaStats, MediaStatsSnapshot};

/// Protokollversion auf dem Kontrollkanal
pub type ProtocolVersion = u16;

/// Hoechste von dieser Implementierung getragene Protokollversion
pub const MAX_SUPPORTED_PROTOCOL_VERSION: ProtocolVersion = 1;

/// Gemeldete Version im Passthrough-Betrieb
pub const DISABLED_VERSION: ProtocolVersion = 0;

/// Wie oft ein Frame bei Codec-Guard-Treffern neu verschluesselt wird
pub const MAX_CIPHERTEXT_VALIDATION_RETRIES: u32 = 10;

const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Vom `key_gen`-Mutex geschuetzter Zustand
struct KeyGenState {
    ratchet: Option<Box<dyn KeyRatchet>>,
    generation: KeyGeneration,
    cipher: Option<Arc<AeadCipher>>,
    truncated_nonce: TruncatedSyncNonce,
}

/// Verschluesselt Medien-Frames fuer den Versand
pub struct Encryptor {
    clock: Arc<dyn MonotonicClock>,
    key_gen: Mutex<KeyGenState>,
    passthrough_mode: AtomicBool,
    protocol_version: Mutex<ProtocolVersion>,
    version_changed: Mutex<Option<Box<dyn Fn(ProtocolVersion) + Send + Sync>>>,
    ssrc_codecs: DashMap<u32, Codec>,
    builder_pool: Mutex<Vec<OutboundFrameBuilder>>,
    stats: [MediaStats; 2],
    last_stats_time: Mutex<TimePoint>,
}

impl Encryptor {
    pub fn new(clock: Arc<dyn MonotonicClock>) -> Self {
        let last_stats_time = clock.now();
        Self {
            clock,
            key_gen: Mutex::new(KeyGenState {
                ratchet: None,
                generation: 0,
                cipher: None,
                truncated_nonce: 0,
            }),
            passthrough_mode: AtomicBool::new(false),
            protocol_version: Mutex::new(MAX_SUPPORTED_PROTOCOL_VERSION),
            version_changed: Mutex::new(None),
            ssrc_codecs: DashMap::new(),
            builder_pool: Mutex::new(Vec::new()),
            stats: [MediaStats::default(), MediaStats::default()],
            last_stats_time: Mutex::new(last_stats_time),
        }
    }

    /// Installiert einen neuen Ratchet und setzt Generation, Nonce und
    /// Cipher-Cache zurueck.
    pub fn set_key_ratchet(&self, ratchet: Box<dyn KeyRatchet>) {
        let mut state = self.key_gen.lock();
        state.ratchet = Some(ratchet);
        state.cipher = None;
        state.generation = 0;
        state.truncated_nonce = 0;
    }

    /// Schaltet den unverschluesselten Durchreich-Betrieb um und passt
    /// die gemeldete Protokollversion an.
    pub fn set_passthrough_mode(&self, passthrough: bool) {
        self.passthrough_mode.store(passthrough, Ordering::Relaxed);
        let version = if passthrough {
            DISABLED_VERSION
        } else {
            MAX_SUPPORTED_PROTOCOL_VERSION
        };
        self.update_protocol_version(version);
    }

    pub fn passthrough_mode(&self) -> bool {
        self.passthrough_mode.load(Ordering::Relaxed)
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        *self.protocol_version.lock()
    }

    /// Wird gerufen, wenn sich die gemeldete Protokollversion aendert
    /// (z. B. zum Neuaushandeln auf dem Kontrollkanal).
    pub fn set_protocol_version_changed_callback(
        &self,
        callback: impl Fn(ProtocolVersion) + Send + Sync + 'static,
    ) {
        *self.version_changed.lock() = Some(Box::new(callback));
    }

    /// Ordnet einer SSRC ihren Codec zu
    pub fn assign_ssrc_to_codec(&self, ssrc: u32, codec: Codec) {
        self.ssrc_codecs.insert(ssrc, codec);
    }

    pub fn codec_for_ssrc(&self, ssrc: u32) -> Codec {
        self.ssrc_codecs
            .get(&ssrc)
            .map(|eintrag| *eintrag)
            .unwrap_or(Codec::Unknown)
    }

    /// Obergrenze fuer die Groesse eines verschluesselten Frames
    pub fn max_ciphertext_byte_size(_media: MediaType, frame_size: usize) -> usize {
        frame_size + SUPPLEMENTAL_BYTES + TRANSFORM_PADDING_BYTES
    }

    pub fn stats(&self, media: MediaType) -> MediaStatsSnapshot {
        self.stats[media.index()].snapshot()
    }

    /// Verschluesselt `frame` nach `out` und gibt die geschriebene
    /// Laenge zurueck.
    pub fn encrypt(
        &self,
        media: MediaType,
        ssrc: u32,
        frame: &[u8],
        out: &mut [u8],
    ) -> CryptoResult<usize> {
        self.encrypt_with_validator(media, ssrc, frame, out, &mut validate_encrypted_frame)
    }

    /// Wie `encrypt`, aber mit austauschbarer Frame-Validierung - so
    /// laesst sich der Retry-Pfad deterministisch treiben.
    pub(crate) fn encrypt_with_validator(
        &self,
        media: MediaType,
        ssrc: u32,
        frame: &[u8],
        out: &mut [u8],
        validator: &mut dyn FnMut(&OutboundFrameBuilder, &[u8]) -> bool,
    ) -> CryptoResult<usize> {
        let stats = &self.stats[media.index()];

        if self.passthrough_mode() {
            if out.len() < frame.len() {
                return Err(CryptoError::PufferZuKlein {
                    benoetigt: frame.len(),
                    vorhanden: out.len(),
                });
            }
            out[..frame.len()].copy_from_slice(frame);
            stats.passthrough_count.fetch_add(1, Ordering::Relaxed);
            return Ok(frame.len());
        }

        if self.key_gen.lock().ratchet.is_none() {
            stats.failure_count.fetch_add(1, Ordering::Relaxed);
            return Err(CryptoError::KeinRatchet);
        }

        let start = self.clock.now();
        let codec = self.codec_for_ssrc(ssrc);
        let mut builder = self.get_or_create_builder();
        let result = self.encrypt_inner(media, codec, frame, out, &mut builder, validator);
        self.return_builder(builder);

        let now = self.clock.now();
        stats
            .duration_us
            .fetch_add(now.saturating_sub(start).as_micros() as u64, Ordering::Relaxed);
        match result {
            Ok(_) => stats.success_count.fetch_add(1, Ordering::Relaxed),
            Err(_) => stats.failure_count.fetch_add(1, Ordering::Relaxed),
        };

        self.maybe_log_stats(now, media, ssrc, frame.len());
        result
    }

    fn encrypt_inner(
        &self,
        media: MediaType,
        codec: Codec,
        frame: &[u8],
        out: &mut [u8],
        builder: &mut OutboundFrameBuilder,
        validator: &mut dyn FnMut(&OutboundFrameBuilder, &[u8]) -> bool,
    ) -> CryptoResult<usize> {
        builder.process_frame(frame, codec);

        let frame_size = builder.encrypted_bytes().len() + builder.unencrypted_bytes().len();
        let ranges_size = unencrypted_ranges_size(builder.unencrypted_ranges());

        for attempt in 1..=MAX_CIPHERTEXT_VALIDATION_RETRIES {
            let Some((cipher, truncated_nonce)) = self.get_next_cipher_and_nonce() else {
                return Err(CryptoError::KeinRatchet);
            };

            // Die trunkierte Nonce sitzt am Ende des 12-Byte-Puffers
            let mut nonce_buffer = [0u8; AES_GCM_128_NONCE_BYTES];
            nonce_buffer[AES_GCM_128_TRUNCATED_SYNC_NONCE_OFFSET..]
                .copy_from_slice(&truncated_nonce.to_be_bytes());

            let mut tag = [0u8; AES_GCM_128_TRUNCATED_TAG_BYTES];
            {
                let (ciphertext, plaintext, additional_data) = builder.cipher_buffers();
                cipher.encrypt(ciphertext, plaintext, &nonce_buffer, additional_data, &mut tag)?;
            }
            self.stats[media.index()].record_attempt(u64::from(attempt));

            let nonce_size = leb128_size(u64::from(truncated_nonce));
            let total = frame_size
                + AES_GCM_128_TRUNCATED_TAG_BYTES
                + nonce_size
                + ranges_size
                + 1
                + 2;
            if out.len() < total {
                return Err(CryptoError::PufferZuKlein {
                    benoetigt: total,
                    vorhanden: out.len(),
                });
            }

            let written = builder.reconstruct_frame(out);
            debug_assert_eq!(written, frame_size);

            // Trailer: Tag, Nonce, Ranges, Supplemental-Size, Magic
            let mut cursor = frame_size;
            out[cursor..cursor + AES_GCM_128_TRUNCATED_TAG_BYTES].copy_from_slice(&tag);
            cursor += AES_GCM_128_TRUNCATED_TAG_BYTES;
            cursor += write_leb128(u64::from(truncated_nonce), &mut out[cursor..]);
            cursor += serialize_unencrypted_ranges(builder.unencrypted_ranges(), &mut out[cursor..])?;
            out[cursor] = (SUPPLEMENTAL_BYTES + nonce_size + ranges_size) as u8;
            cursor += 1;
            out[cursor..cursor + 2].copy_from_slice(&MARKER_BYTES.to_be_bytes());
            cursor += 2;
            debug_assert_eq!(cursor, total);

            if validator(builder, &out[..total]) {
                return Ok(total);
            }
            if attempt >= MAX_CIPHERTEXT_VALIDATION_RETRIES {
                warn!(attempt, "Codec-Validierung endgueltig fehlgeschlagen");
                break;
            }
            trace!(attempt, "Frame enthaelt Codec-Startcode, Nonce wird neu gerollt");
        }

        Err(CryptoError::Verschluesselung(
            "Codec-Validierung nach allen Versuchen fehlgeschlagen".to_string(),
        ))
    }

    /// Rueckt die Nonce vor und liefert den passenden Cipher; bei einem
    /// Generationswechsel (oder leerem Cache) wird der Schluessel frisch
    /// vom Ratchet geholt.
    fn get_next_cipher_and_nonce(&self) -> Option<(Arc<AeadCipher>, TruncatedSyncNonce)> {
        let mut state = self.key_gen.lock();
        let state = &mut *state;
        let ratchet = state.ratchet.as_mut()?;

        state.truncated_nonce = state.truncated_nonce.wrapping_add(1);
        let generation = compute_wrapped_generation(
            state.generation,
            state.truncated_nonce >> RATCHET_GENERATION_SHIFT_BITS,
        );

        if generation != state.generation || state.cipher.is_none() {
            state.generation = generation;
            let key = match ratchet.get_key(generation) {
                Ok(key) => key,
                Err(fehler) => {
                    warn!(generation, %fehler, "Ratchet liefert keinen Sende-Schluessel");
                    state.cipher = None;
                    return None;
                }
            };
            debug!(generation, "Sende-Cipher neu abgeleitet");
            state.cipher = Some(Arc::new(AeadCipher::new(&key)));
        }

        state
            .cipher
            .clone()
            .map(|cipher| (cipher, state.truncated_nonce))
    }

    fn update_protocol_version(&self, version: ProtocolVersion) {
        {
            let mut current = self.protocol_version.lock();
            if *current == version {
                return;
            }
            *current = version;
        }
        if let Some(callback) = self.version_changed.lock().as_ref() {
            callback(version);
        }
    }

    fn get_or_create_builder(&self) -> OutboundFrameBuilder {
        self.builder_pool.lock().pop().unwrap_or_default()
    }

    fn return_builder(&self, builder: OutboundFrameBuilder) {
        self.builder_pool.lock().push(builder);
    }

    fn maybe_log_stats(&self, now: TimePoint, media: MediaType, ssrc: u32, frame_len: usize) {
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
            "Verschluesselungs-Statistik"
        );
        debug!(?media, ssrc, groesse = frame_len, "Zuletzt verschluesselter Frame");
    }
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryptor")
            .field("passthrough", &self.passthrough_mode())
            .field("protocol_version", &self.protocol_version())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
