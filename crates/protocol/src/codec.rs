//! Codec- und Medientyp-Definitionen
//!
//! Der Codec bestimmt, welche Bytes eines Frames unverschluesselt bleiben
//! muessen (Packetizer-sichtbare Header) und welche Byte-Muster im
//! fertigen Frame verboten sind (siehe `guard`).

/// Medientyp eines Frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MediaType {
    /// Audio (Opus)
    Audio = 0,
    /// Video (VP8/VP9/H26x/AV1)
    Video = 1,
}

impl MediaType {
    /// Index fuer Statistik-Arrays (`[MediaStats; 2]`)
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Konvertiert ein Byte in einen `MediaType`.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Audio),
            1 => Some(Self::Video),
            _ => None,
        }
    }
}

/// Vom Transport getragener Medien-Codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Codec {
    /// Unbekannt - kompletter Frame wird verschluesselt
    #[default]
    Unknown = 0,
    /// Opus - Standard-Codec fuer Sprache
    Opus = 1,
    Vp8 = 2,
    Vp9 = 3,
    H264 = 4,
    H265 = 5,
    Av1 = 6,
}

impl Codec {
    /// Konvertiert ein Byte in einen `Codec`.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Unknown),
            1 => Some(Self::Opus),
            2 => Some(Self::Vp8),
            3 => Some(Self::Vp9),
            4 => Some(Self::H264),
            5 => Some(Self::H265),
            6 => Some(Self::Av1),
            _ => None,
        }
    }

    /// H.264 oder H.265 - Codecs mit Annex-B-Startcodes
    pub fn ist_h26x(self) -> bool {
        matches!(self, Self::H264 | Self::H265)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_type_round_trip() {
        assert_eq!(MediaType::from_u8(0), Some(MediaType::Audio));
        assert_eq!(MediaType::from_u8(1), Some(MediaType::Video));
        assert_eq!(MediaType::from_u8(7), None);
    }

    #[test]
    fn codec_round_trip() {
        for byte in 0..=6u8 {
            let codec = Codec::from_u8(byte).unwrap();
            assert_eq!(codec as u8, byte);
        }
        assert_eq!(Codec::from_u8(200), None);
    }

    #[test]
    fn h26x_erkennung() {
        assert!(Codec::H264.ist_h26x());
        assert!(Codec::H265.ist_h26x());
        assert!(!Codec::Opus.ist_h26x());
        assert!(!Codec::Av1.ist_h26x());
    }

    #[test]
    fn standard_codec_ist_unknown() {
        assert_eq!(Codec::default(), Codec::Unknown);
    }
}
