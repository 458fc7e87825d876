//! Framing-Konstanten und unverschluesselte Ranges
//!
//! Ein verschluesselter Frame haengt hinter den rekonstruierten Frame-Body
//! einen Trailer an:
//!
//! ```text
//! +-----------------------------+---------------------------------------+
//! | Body                        | Ciphertext mit unverschluesselten     |
//! |                             | Abschnitten laut Ranges               |
//! | Tag (8 Bytes)               | erste 8 Bytes des AES-GCM-Tags        |
//! | Nonce (LEB128, 1..10 B)     | trunkierte Sync-Nonce                 |
//! | Ranges (LEB128)             | Anzahl, dann (Offset, Laenge)-Paare   |
//! | Supplemental-Size (1 Byte)  | 11 + |Nonce| + |Ranges|               |
//! | Magic (2 Bytes)             | 0xFAFA                                |
//! +-----------------------------+---------------------------------------+
//! ```
//!
//! Endet ein Paket nicht auf den Magic-Marker, gilt es als Klartext.

use crate::error::{FrameError, FrameResult};
use crate::leb128::{leb128_size, read_leb128, write_leb128};

/// Trunkierte Sync-Nonce: untere 8 Bit rotieren innerhalb einer
/// Generation, die hoeheren Bits schalten die Generation weiter.
pub type TruncatedSyncNonce = u32;

/// Magic-Marker am Frame-Ende
pub type MagicMarker = u16;

/// Supplemental-Size-Byte im Trailer
pub type SupplementalBytesSize = u8;

/// Fester Marker, der einen verschluesselten Frame kennzeichnet
pub const MARKER_BYTES: MagicMarker = 0xFAFA;

// Layout-Konstanten
pub const AES_GCM_128_KEY_BYTES: usize = 16;
pub const AES_GCM_128_NONCE_BYTES: usize = 12;
pub const AES_GCM_128_TRUNCATED_SYNC_NONCE_BYTES: usize = 4;
pub const AES_GCM_128_TRUNCATED_SYNC_NONCE_OFFSET: usize =
    AES_GCM_128_NONCE_BYTES - AES_GCM_128_TRUNCATED_SYNC_NONCE_BYTES;
pub const AES_GCM_128_TRUNCATED_TAG_BYTES: usize = 8;

/// Breite des Generationsanteils im Nonce (in Bytes bzw. Bits)
pub const RATCHET_GENERATION_BYTES: usize = 1;
pub const RATCHET_GENERATION_SHIFT_BITS: u32 = 8 * RATCHET_GENERATION_BYTES as u32;

/// Generationen wickeln alle 256 Einheiten um
pub const GENERATION_WRAP: u32 = 1 << RATCHET_GENERATION_SHIFT_BITS;

/// Fester Trailer-Anteil: Tag + Supplemental-Size-Byte + Magic
pub const SUPPLEMENTAL_BYTES: usize =
    AES_GCM_128_TRUNCATED_TAG_BYTES + std::mem::size_of::<SupplementalBytesSize>()
        + std::mem::size_of::<MagicMarker>();

/// Reserve fuer den variablen Trailer-Anteil (Nonce + Ranges)
pub const TRANSFORM_PADDING_BYTES: usize = 64;

/// Opus-Silence-Paket (DTX) - wird nie verschluesselt
pub const OPUS_SILENCE_PACKET: [u8; 3] = [0xF8, 0xFF, 0xFE];

// ---------------------------------------------------------------------------
// Unverschluesselte Ranges
// ---------------------------------------------------------------------------

/// Ein unverschluesselter Abschnitt im rekonstruierten Frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnencryptedRange {
    /// Offset im Frame-Body
    pub offset: usize,
    /// Laenge des Abschnitts in Bytes
    pub size: usize,
}

pub type UnencryptedRanges = Vec<UnencryptedRange>;

/// Anzahl Bytes, die der serialisierte Range-Deskriptor belegt
pub fn unencrypted_ranges_size(ranges: &[UnencryptedRange]) -> usize {
    let mut size = leb128_size(ranges.len() as u64);
    for range in ranges {
        size += leb128_size(range.offset as u64);
        size += leb128_size(range.size as u64);
    }
    size
}

/// Serialisiert die Ranges: Anzahl, dann (Offset, Laenge)-Paare, alles LEB128
pub fn serialize_unencrypted_ranges(
    ranges: &[UnencryptedRange],
    buffer: &mut [u8],
) -> FrameResult<usize> {
    let benoetigt = unencrypted_ranges_size(ranges);
    if buffer.len() < benoetigt {
        return Err(FrameError::PufferZuKlein {
            benoetigt,
            vorhanden: buffer.len(),
        });
    }

    let mut cursor = write_leb128(ranges.len() as u64, buffer);
    for range in ranges {
        cursor += write_leb128(range.offset as u64, &mut buffer[cursor..]);
        cursor += write_leb128(range.size as u64, &mut buffer[cursor..]);
    }
    Ok(cursor)
}

/// Deserialisiert einen Range-Deskriptor vom Anfang von `buffer`
///
/// Gibt die Ranges und die Anzahl verbrauchter Bytes zurueck.
pub fn deserialize_unencrypted_ranges(
    buffer: &[u8],
) -> FrameResult<(UnencryptedRanges, usize)> {
    let (count, mut cursor) = read_leb128(buffer).ok_or(FrameError::UngueltigeLeb128)?;
    // Jedes Paar belegt mindestens 2 Bytes - grob gegen absurde Anzahlen sichern
    if count > (buffer.len() as u64) / 2 {
        return Err(FrameError::UngueltigeRanges);
    }

    let mut ranges = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (offset, verbraucht) =
            read_leb128(&buffer[cursor..]).ok_or(FrameError::UngueltigeLeb128)?;
        cursor += verbraucht;
        let (size, verbraucht) =
            read_leb128(&buffer[cursor..]).ok_or(FrameError::UngueltigeLeb128)?;
        cursor += verbraucht;
        ranges.push(UnencryptedRange {
            offset: offset as usize,
            size: size as usize,
        });
    }
    Ok((ranges, cursor))
}

/// Prueft, dass die Ranges geordnet sind, nicht ueberlappen und in den
/// Frame passen.
pub fn validate_unencrypted_ranges(ranges: &[UnencryptedRange], frame_size: usize) -> bool {
    let mut vorheriges_ende = 0usize;
    for range in ranges {
        let Some(ende) = range.offset.checked_add(range.size) else {
            return false;
        };
        if range.offset < vorheriges_ende || ende > frame_size {
            return false;
        }
        vorheriges_ende = ende;
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_konstanten() {
        assert_eq!(AES_GCM_128_TRUNCATED_SYNC_NONCE_OFFSET, 8);
        assert_eq!(SUPPLEMENTAL_BYTES, 11);
        assert_eq!(GENERATION_WRAP, 256);
    }

    #[test]
    fn ranges_round_trip() {
        let ranges = vec![
            UnencryptedRange { offset: 0, size: 1 },
            UnencryptedRange { offset: 10, size: 300 },
        ];
        let mut buffer = [0u8; 32];
        let geschrieben = serialize_unencrypted_ranges(&ranges, &mut buffer).unwrap();
        assert_eq!(geschrieben, unencrypted_ranges_size(&ranges));

        let (gelesen, verbraucht) = deserialize_unencrypted_ranges(&buffer[..geschrieben]).unwrap();
        assert_eq!(verbraucht, geschrieben);
        assert_eq!(gelesen, ranges);
    }

    #[test]
    fn leere_ranges_ein_byte() {
        let ranges: UnencryptedRanges = Vec::new();
        assert_eq!(unencrypted_ranges_size(&ranges), 1);
        let mut buffer = [0u8; 4];
        assert_eq!(serialize_unencrypted_ranges(&ranges, &mut buffer).unwrap(), 1);
        assert_eq!(buffer[0], 0);
    }

    #[test]
    fn opus_toc_deskriptor_bytes() {
        // Szenario: 1 Range (Offset 0, Laenge 1) ergibt 0x01 0x00 0x01
        let ranges = vec![UnencryptedRange { offset: 0, size: 1 }];
        let mut buffer = [0u8; 8];
        let geschrieben = serialize_unencrypted_ranges(&ranges, &mut buffer).unwrap();
        assert_eq!(&buffer[..geschrieben], &[0x01, 0x00, 0x01]);
    }

    #[test]
    fn validierung_ueberlappung() {
        let ranges = vec![
            UnencryptedRange { offset: 0, size: 5 },
            UnencryptedRange { offset: 4, size: 2 },
        ];
        assert!(!validate_unencrypted_ranges(&ranges, 100));
    }

    #[test]
    fn validierung_ausserhalb_des_frames() {
        let ranges = vec![UnencryptedRange { offset: 90, size: 20 }];
        assert!(!validate_unencrypted_ranges(&ranges, 100));
    }

    #[test]
    fn validierung_geordnet_ok() {
        let ranges = vec![
            UnencryptedRange { offset: 0, size: 4 },
            UnencryptedRange { offset: 4, size: 2 },
            UnencryptedRange { offset: 20, size: 10 },
        ];
        assert!(validate_unencrypted_ranges(&ranges, 30));
    }

    #[test]
    fn deserialisierung_abgeschnitten() {
        // Anzahl 2, aber nur ein halbes Paar vorhanden
        let buffer = [0x02u8, 0x00];
        assert!(deserialize_unencrypted_ranges(&buffer).is_err());
    }

    #[test]
    fn deserialisierung_absurde_anzahl() {
        let buffer = [0xFFu8, 0xFF, 0x03];
        assert!(deserialize_unencrypted_ranges(&buffer).is_err());
    }
}
