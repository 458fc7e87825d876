//! # sotto-crypto
//!
//! Ende-zu-Ende-Verschluesselung fuer Echtzeit-Medien-Frames. Die
//! Gruppensitzung (MLS) liefert pro Epoche einen Key-Ratchet; dieses
//! Crate verwandelt damit Klartext-Frames in authentifizierte,
//! forward-secret Wire-Pakete und zurueck.
//!
//! ## Module
//! - `cipher` - AES-128-GCM AEAD-Primitiv mit trunkiertem Tag
//! - `ratchet` - Key-Ratchet-Schnittstelle und HKDF-Kettenratsche
//! - `clock` - injizierbare monotone Uhr
//! - `cipher_manager` - Generation->Cipher-Cache mit Replay-Fenster
//! - `encryptor` - Sende-Pipeline (Nonce-Rollen, Codec-Retry)
//! - `decryptor` - Empfangs-Pipeline (Ratchet-Transitionen, Passthrough)
//! - `stats` - Zaehler je Medientyp
//! - `error` - Fehlertypen

pub mod cipher;
pub mod cipher_manager;
pub mod clock;
pub mod decryptor;
pub mod encryptor;
pub mod error;
pub mod ratchet;
pub mod stats;

// Bequeme Re-Exports
pub use cipher::{AeadCipher, EncryptionKey};
pub use cipher_manager::{
    compute_wrapped_big_nonce, compute_wrapped_generation, BigNonce, CipherManager,
};
pub use clock::{ManualClock, MonotonicClock, SystemClock, TimePoint, TIME_MAX};
pub use decryptor::{Decryptor, DEFAULT_TRANSITION_EXPIRY};
pub use encryptor::{
    Encryptor, ProtocolVersion, DISABLED_VERSION, MAX_CIPHERTEXT_VALIDATION_RETRIES,
    MAX_SUPPORTED_PROTOCOL_VERSION,
};
pub use error::{CryptoError, CryptoResult};
pub use ratchet::{ChainKeyRatchet, KeyGeneration, KeyRatchet};
pub use stats::{MediaStats, MediaStatsSnapshot};
