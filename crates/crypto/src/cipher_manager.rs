//! Generation -> Cipher-Cache mit Replay-Fenster
//!
//! Ein `CipherManager` gehoert zu genau einem Key-Ratchet und haelt die
//! AEAD-Cipher der zuletzt gesehenen Generationen vor. Er entscheidet,
//! welche Nonces noch verarbeitet werden duerfen (Replay-Schutz unter
//! Out-of-Order-Lieferung), wickelt die auf dem Draht verkuerzten
//! Generationsbits wieder aus und altert Schluessel sicher aus.
//!
//! Der Manager ist nicht intern synchronisiert; der Decryptor haelt die
//! Manager-Liste hinter einem Mutex.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use sotto_protocol::frame::{
    TruncatedSyncNonce, GENERATION_WRAP, RATCHET_GENERATION_SHIFT_BITS,
};

use crate::cipher::AeadCipher;
use crate::clock::{MonotonicClock, TimePoint, TIME_MAX};
use crate::ratchet::{KeyGeneration, KeyRatchet};

/// 64-Bit-Nonce fuer das Replay-Fenster: volle Generation plus
/// In-Generation-Zaehler.
pub type BigNonce = u64;

/// Wie weit eine Generation vor der neuesten liegen darf
pub const MAX_GENERATION_GAP: u32 = 250;

/// Obergrenze fuer gemerkte Luecken im Replay-Fenster
pub const MAX_MISSING_NONCES: u64 = 10_000;

/// 50 Audio-Pakete/s plus zwei 60-fps-Videostreams
pub const MAX_FRAMES_PER_SECOND: u64 = 50 + 2 * 60;

/// Lebensdauer eines Ciphers, dessen Generation abgeloest wurde
pub const CIPHER_EXPIRY: Duration = Duration::from_secs(10);

/// Wickelt die auf 8 Bit verkuerzten Generationsbits wieder aus.
///
/// Nimmt monotonen Fortschritt ab `oldest` an: ein low8 knapp unter
/// `oldest % 256` gilt als eine Runde weiter. Bewusst veraltete Werte
/// landen dadurch eine Wrap-Runde in der Zukunft und bleiben am
/// Gap-/Oldest-Gate haengen.
pub fn compute_wrapped_generation(oldest: KeyGeneration, generation: KeyGeneration) -> KeyGeneration {
    let generation = generation & (GENERATION_WRAP - 1);
    let remainder = oldest % GENERATION_WRAP;
    let factor = oldest / GENERATION_WRAP + u32::from(generation < remainder);
    factor * GENERATION_WRAP + generation
}

/// Kombiniert volle Generation und In-Generation-Zaehler zu einer
/// numerisch vergleichbaren 64-Bit-Nonce.
pub fn compute_wrapped_big_nonce(generation: KeyGeneration, nonce: TruncatedSyncNonce) -> BigNonce {
    let masked = u64::from(nonce) & ((1u64 << RATCHET_GENERATION_SHIFT_BITS) - 1);
    (u64::from(generation) << RATCHET_GENERATION_SHIFT_BITS) | masked
}

struct ExpiringCipher {
    cipher: AeadCipher,
    expiry: TimePoint,
}

/// Cipher-Cache eines einzelnen Key-Ratchets
pub struct CipherManager {
    clock: Arc<dyn MonotonicClock>,
    ratchet: Box<dyn KeyRatchet>,
    cryptors: HashMap<KeyGeneration, ExpiringCipher>,

    ratchet_creation: TimePoint,
    ratchet_expiry: TimePoint,
    oldest_generation: KeyGeneration,
    newest_generation: KeyGeneration,

    newest_processed_nonce: Option<BigNonce>,
    /// Streng aufsteigend; alle Eintraege < `newest_processed_nonce`
    missing_nonces: VecDeque<BigNonce>,
}

impl CipherManager {
    pub fn new(clock: Arc<dyn MonotonicClock>, ratchet: Box<dyn KeyRatchet>) -> Self {
        let ratchet_creation = clock.now();
        Self {
            clock,
            ratchet,
            cryptors: HashMap::new(),
            ratchet_creation,
            ratchet_expiry: TIME_MAX,
            oldest_generation: 0,
            newest_generation: 0,
            newest_processed_nonce: None,
            missing_nonces: VecDeque::new(),
        }
    }

    /// Zieht den Ratchet-Ablauf auf `expiry` herunter (nie hinauf)
    pub fn update_expiry(&mut self, expiry: TimePoint) {
        self.ratchet_expiry = self.ratchet_expiry.min(expiry);
    }

    pub fn is_expired(&self) -> bool {
        self.clock.now() > self.ratchet_expiry
    }

    /// Darf diese Nonce noch verarbeitet werden?
    ///
    /// Ja, wenn noch nie eine Nonce verarbeitet wurde, wenn sie neuer als
    /// die neueste ist oder wenn sie eine bekannte Luecke schliesst.
    pub fn can_process_nonce(
        &self,
        generation: KeyGeneration,
        nonce: TruncatedSyncNonce,
    ) -> bool {
        let Some(newest) = self.newest_processed_nonce else {
            return true;
        };
        let big_nonce = compute_wrapped_big_nonce(generation, nonce);
        big_nonce > newest || self.missing_nonces.binary_search(&big_nonce).is_ok()
    }

    /// Wickelt die Generationsbits einer empfangenen Nonce relativ zur
    /// aeltesten lebenden Generation aus.
    pub fn compute_wrapped_generation(&self, generation: KeyGeneration) -> KeyGeneration {
        compute_wrapped_generation(self.oldest_generation, generation)
    }

    /// Liefert den Cipher fuer `generation`, bei Bedarf frisch vom
    /// Ratchet abgeleitet.
    ///
    /// `None` fuer veraltete Generationen, zu weit in der Zukunft
    /// liegende Generationen und Generationen jenseits des
    /// Lebenszeit-Budgets des Ratchets.
    pub fn get_cipher(&mut self, generation: KeyGeneration) -> Option<&AeadCipher> {
        self.cleanup_expired_ciphers();

        if generation < self.oldest_generation {
            info!(
                generation,
                oldest = self.oldest_generation,
                "Frame mit veralteter Generation"
            );
            return None;
        }

        if generation > self.newest_generation.saturating_add(MAX_GENERATION_GAP) {
            info!(
                generation,
                newest = self.newest_generation,
                "Frame mit zu weit entfernter Generation"
            );
            return None;
        }

        // Mehr Generationen, als der Ratchet in seiner Lebenszeit
        // hergeben kann, akzeptieren wir nicht
        let lifetime_secs = self.clock.now().saturating_sub(self.ratchet_creation).as_secs();
        let max_lifetime_generations =
            (MAX_FRAMES_PER_SECOND * lifetime_secs) >> RATCHET_GENERATION_SHIFT_BITS;
        if u64::from(generation) > max_lifetime_generations {
            info!(
                generation,
                max_lifetime_generations,
                lifetime_secs,
                "Generation jenseits des Ratchet-Lebenszeit-Budgets"
            );
            return None;
        }

        if !self.cryptors.contains_key(&generation) {
            let entry = self.make_expiring_cipher(generation)?;
            self.cryptors.insert(generation, entry);
        }
        self.cryptors.get(&generation).map(|entry| &entry.cipher)
    }

    /// Nur nach einem erfolgreichen AEAD-Decrypt aufrufen: aktualisiert
    /// das Replay-Fenster und hebt ggf. die neueste Generation an.
    pub fn report_cipher_success(
        &mut self,
        generation: KeyGeneration,
        nonce: TruncatedSyncNonce,
    ) {
        let big_nonce = compute_wrapped_big_nonce(generation, nonce);

        match self.newest_processed_nonce {
            None => {
                self.newest_processed_nonce = Some(big_nonce);
            }
            Some(newest) if big_nonce > newest => {
                // Frueher Stream: unterhalb von MAX_MISSING_NONCES beginnt
                // das Fenster bei 0
                let oldest_missing = big_nonce.saturating_sub(MAX_MISSING_NONCES);

                while let Some(&front) = self.missing_nonces.front() {
                    if front >= oldest_missing {
                        break;
                    }
                    self.missing_nonces.pop_front();
                }

                for fehlend in oldest_missing.max(newest + 1)..big_nonce {
                    self.missing_nonces.push_back(fehlend);
                }

                self.newest_processed_nonce = Some(big_nonce);
            }
            Some(_) => {
                // Eine Luecke wurde geschlossen
                if let Ok(index) = self.missing_nonces.binary_search(&big_nonce) {
                    self.missing_nonces.remove(index);
                }
            }
        }

        if generation <= self.newest_generation || !self.cryptors.contains_key(&generation) {
            return;
        }
        debug!(generation, "Neueste Generation angehoben");
        self.newest_generation = generation;

        // Alle aelteren Cipher bekommen jetzt ein Ablaufdatum
        let expiry = self.clock.now() + CIPHER_EXPIRY;
        for (&gen, cryptor) in self.cryptors.iter_mut() {
            if gen < self.newest_generation {
                debug!(generation = gen, "Ablauf fuer abgeloesten Cipher gesetzt");
                cryptor.expiry = cryptor.expiry.min(expiry);
            }
        }
    }

    fn make_expiring_cipher(&mut self, generation: KeyGeneration) -> Option<ExpiringCipher> {
        let key = match self.ratchet.get_key(generation) {
            Ok(key) => key,
            Err(fehler) => {
                warn!(generation, %fehler, "Ratchet liefert keinen Schluessel");
                return None;
            }
        };

        // Out-of-Order kann einen Cipher fuer eine bereits abgeloeste
        // Generation verlangen - der bekommt sofort ein Ablaufdatum
        let expiry = if generation < self.newest_generation {
            debug!(generation, "Cipher fuer alte Generation erzeugt");
            self.clock.now() + CIPHER_EXPIRY
        } else {
            debug!(generation, "Cipher fuer neue Generation erzeugt");
            TIME_MAX
        };

        Some(ExpiringCipher {
            cipher: AeadCipher::new(&key),
            expiry,
        })
    }

    fn cleanup_expired_ciphers(&mut self) {
        let now = self.clock.now();
        self.cryptors.retain(|&generation, cryptor| {
            let expired = cryptor.expiry < now;
            if expired {
                debug!(generation, "Abgelaufener Cipher entfernt");
            }
            !expired
        });

        while self.oldest_generation < self.newest_generation
            && !self.cryptors.contains_key(&self.oldest_generation)
        {
            debug!(
                generation = self.oldest_generation,
                "Schluessel der aeltesten Generation geloescht"
            );
            self.ratchet.delete_key(self.oldest_generation);
            self.oldest_generation += 1;
        }
    }
}

impl std::fmt::Debug for CipherManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherManager")
            .field("oldest_generation", &self.oldest_generation)
            .field("newest_generation", &self.newest_generation)
            .field("cryptors", &self.cryptors.len())
            .field("missing_nonces", &self.missing_nonces.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
