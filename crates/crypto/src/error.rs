//! Fehlertypen fuer die Krypto-Pipeline

use thiserror::Error;

/// Fehler in der E2EE-Pipeline
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Ausgabepuffer zu klein: benoetigt {benoetigt}, vorhanden {vorhanden}")]
    PufferZuKlein { benoetigt: usize, vorhanden: usize },

    #[error("Ungueltige Schluessel-Laenge: erwartet {erwartet}, erhalten {erhalten}")]
    UngueltigeSchluesselLaenge { erwartet: usize, erhalten: usize },

    #[error("Kein Key-Ratchet gesetzt")]
    KeinRatchet,

    #[error("Kein Schluessel fuer Generation {generation}")]
    KeinSchluessel { generation: u32 },

    #[error("Ratchet bereits hinter Generation {generation}")]
    RatchetVorbei { generation: u32 },

    #[error("Ratchet-Sprung zu gross: von {von} nach {nach}")]
    RatchetSprung { von: u32, nach: u32 },

    #[error("Verschluesselung fehlgeschlagen: {0}")]
    Verschluesselung(String),

    #[error("Entschluesselung fehlgeschlagen: {0}")]
    Entschluesselung(String),

    #[error("Framing-Fehler: {0}")]
    Framing(#[from] sotto_protocol::FrameError),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
