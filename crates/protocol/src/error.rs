//! Fehlertypen fuer das Framing

use thiserror::Error;

/// Fehler beim (De-)Serialisieren eines Frames
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Puffer zu klein: benoetigt {benoetigt}, vorhanden {vorhanden}")]
    PufferZuKlein { benoetigt: usize, vorhanden: usize },

    #[error("Ungueltige LEB128-Sequenz")]
    UngueltigeLeb128,

    #[error("Ungueltige unverschluesselte Ranges")]
    UngueltigeRanges,
}

pub type FrameResult<T> = Result<T, FrameError>;
