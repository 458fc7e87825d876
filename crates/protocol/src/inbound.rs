//! Frame-Parser fuer die Empfangsseite
//!
//! Liest den Trailer eines verschluesselten Frames rueckwaerts (Magic,
//! Supplemental-Size, dann Tag, Nonce und Ranges) und teilt den Body in
//! den AAD-Strom (unverschluesselte Bytes) und den Ciphertext-Strom.
//! Fehlt der Magic-Marker oder ist der Trailer unplausibel, gilt das
//! Paket als Klartext (`is_encrypted() == false`).
//!
//! Parser sind wiederverwendbar (`parse_frame` raeumt auf, Puffer
//! behalten ihre Kapazitaet; Pooling im Decryptor).

use tracing::warn;

use crate::frame::{
    deserialize_unencrypted_ranges, validate_unencrypted_ranges, TruncatedSyncNonce,
    UnencryptedRanges, AES_GCM_128_TRUNCATED_TAG_BYTES, MARKER_BYTES, SUPPLEMENTAL_BYTES,
};
use crate::leb128::read_leb128;

/// Parst und rekonstruiert Frames auf der Empfangsseite
#[derive(Debug, Default)]
pub struct InboundFrameParser {
    is_encrypted: bool,
    original_size: usize,
    tag: [u8; AES_GCM_128_TRUNCATED_TAG_BYTES],
    truncated_nonce: TruncatedSyncNonce,
    unencrypted_ranges: UnencryptedRanges,
    authenticated: Vec<u8>,
    ciphertext: Vec<u8>,
    plaintext: Vec<u8>,
}

impl InboundFrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parst `frame`; danach zeigt `is_encrypted()`, ob ein gueltiger
    /// Trailer gefunden wurde.
    pub fn parse_frame(&mut self, frame: &[u8]) {
        self.clear();

        if frame.len() < SUPPLEMENTAL_BYTES {
            return;
        }

        // Magic-Marker am Frame-Ende?
        let marker_start = frame.len() - 2;
        if frame[marker_start..] != MARKER_BYTES.to_be_bytes() {
            return;
        }

        // Supplemental-Size direkt vor dem Marker
        let supplemental_size = frame[marker_start - 1] as usize;
        if supplemental_size > frame.len() {
            warn!(
                supplemental_size,
                frame = frame.len(),
                "Frame zu klein fuer die angegebene Supplemental-Groesse"
            );
            return;
        }
        // Mindestens Tag + 1 Nonce-Byte + 1 Ranges-Byte + Size-Byte + Magic
        if supplemental_size < SUPPLEMENTAL_BYTES + 2 {
            warn!(supplemental_size, "Supplemental-Groesse unplausibel klein");
            return;
        }

        let trailer = &frame[frame.len() - supplemental_size..];
        self.tag.copy_from_slice(&trailer[..AES_GCM_128_TRUNCATED_TAG_BYTES]);

        // Nonce und Ranges liegen zwischen Tag und Size-Byte
        let variabel = &trailer[AES_GCM_128_TRUNCATED_TAG_BYTES..supplemental_size - 3];
        let Some((nonce, verbraucht)) = read_leb128(variabel) else {
            warn!("Trunkierte Nonce nicht lesbar");
            return;
        };
        let Ok(nonce) = TruncatedSyncNonce::try_from(nonce) else {
            warn!(nonce, "Trunkierte Nonce ausserhalb des Wertebereichs");
            return;
        };
        self.truncated_nonce = nonce;

        let ranges_region = &variabel[verbraucht..];
        let (ranges, verbraucht) = match deserialize_unencrypted_ranges(ranges_region) {
            Ok(ergebnis) => ergebnis,
            Err(fehler) => {
                warn!(%fehler, "Unverschluesselte Ranges nicht lesbar");
                return;
            }
        };
        if verbraucht != ranges_region.len() {
            warn!("Range-Deskriptor laesst Bytes uebrig");
            return;
        }

        let body_size = frame.len() - supplemental_size;
        if !validate_unencrypted_ranges(&ranges, body_size) {
            warn!("Ungueltige unverschluesselte Ranges");
            return;
        }
        self.unencrypted_ranges = ranges;

        // Body in AAD- und Ciphertext-Strom aufteilen
        self.authenticated.reserve(body_size);
        self.ciphertext.reserve(body_size);
        let mut frame_index = 0;
        for range in &self.unencrypted_ranges {
            if range.offset > frame_index {
                self.ciphertext.extend_from_slice(&frame[frame_index..range.offset]);
            }
            self.authenticated
                .extend_from_slice(&frame[range.offset..range.offset + range.size]);
            frame_index = range.offset + range.size;
        }
        if frame_index < body_size {
            self.ciphertext.extend_from_slice(&frame[frame_index..body_size]);
        }

        self.plaintext.resize(self.ciphertext.len(), 0);
        self.original_size = frame.len();
        self.is_encrypted = true;
    }

    /// Baut den Klartext-Frame aus entschluesseltem Plaintext und den
    /// unverschluesselten Bytes zusammen.
    ///
    /// Gibt die Anzahl geschriebener Bytes zurueck; 0 wenn der Frame
    /// ungueltig oder `out` zu klein ist.
    pub fn reconstruct_frame(&self, out: &mut [u8]) -> usize {
        if !self.is_encrypted {
            warn!("Rekonstruktion eines ungueltigen Frames");
            return 0;
        }
        let total = self.authenticated.len() + self.plaintext.len();
        if out.len() < total {
            warn!(
                benoetigt = total,
                vorhanden = out.len(),
                "Ausgabepuffer zu klein fuer den Klartext-Frame"
            );
            return 0;
        }

        let mut frame_index = 0;
        let mut authenticated_index = 0;
        let mut plaintext_index = 0;
        for range in &self.unencrypted_ranges {
            let encrypted_bytes = range.offset - frame_index;
            if encrypted_bytes > 0 {
                out[frame_index..range.offset].copy_from_slice(
                    &self.plaintext[plaintext_index..plaintext_index + encrypted_bytes],
                );
                plaintext_index += encrypted_bytes;
            }
            out[range.offset..range.offset + range.size].copy_from_slice(
                &self.authenticated[authenticated_index..authenticated_index + range.size],
            );
            authenticated_index += range.size;
            frame_index = range.offset + range.size;
        }
        if plaintext_index < self.plaintext.len() {
            let rest = self.plaintext.len() - plaintext_index;
            out[frame_index..frame_index + rest].copy_from_slice(&self.plaintext[plaintext_index..]);
        }
        total
    }

    pub fn is_encrypted(&self) -> bool {
        self.is_encrypted
    }

    /// Laenge des urspruenglichen Pakets inklusive Trailer
    pub fn size(&self) -> usize {
        self.original_size
    }

    pub fn tag(&self) -> &[u8; AES_GCM_128_TRUNCATED_TAG_BYTES] {
        &self.tag
    }

    pub fn truncated_nonce(&self) -> TruncatedSyncNonce {
        self.truncated_nonce
    }

    pub fn authenticated_data(&self) -> &[u8] {
        &self.authenticated
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Puffer fuer die AEAD-Operation: (Ciphertext, AAD, Plaintext-Ziel)
    pub fn decrypt_buffers(&mut self) -> (&[u8], &[u8], &mut [u8]) {
        (&self.ciphertext, &self.authenticated, &mut self.plaintext)
    }

    fn clear(&mut self) {
        self.is_encrypted = false;
        self.original_size = 0;
        self.tag = [0; AES_GCM_128_TRUNCATED_TAG_BYTES];
        self.truncated_nonce = 0;
        self.unencrypted_ranges.clear();
        self.authenticated.clear();
        self.ciphertext.clear();
        self.plaintext.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::UnencryptedRange;

    /// Baut einen Frame von Hand: Body, Tag, Nonce (1 Byte), Ranges,
    /// Size-Byte, Magic.
    fn baue_frame(body: &[u8], nonce: u8, ranges_bytes: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(body);
        frame.extend_from_slice(&[0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7]); // Tag
        frame.push(nonce);
        frame.extend_from_slice(ranges_bytes);
        frame.push((SUPPLEMENTAL_BYTES + 1 + ranges_bytes.len()) as u8);
        frame.extend_from_slice(&MARKER_BYTES.to_be_bytes());
        frame
    }

    #[test]
    fn klartext_ohne_marker() {
        let mut parser = InboundFrameParser::new();
        parser.parse_frame(b"nur klartext ohne trailer");
        assert!(!parser.is_encrypted());
    }

    #[test]
    fn zu_kurzer_frame_ist_klartext() {
        let mut parser = InboundFrameParser::new();
        parser.parse_frame(&[0xFA, 0xFA]);
        assert!(!parser.is_encrypted());
    }

    #[test]
    fn parse_opus_frame() {
        // Body: 1 unverschluesseltes TOC-Byte + 4 Bytes Ciphertext
        let frame = baue_frame(b"hABCD", 0x01, &[0x01, 0x00, 0x01]);
        let mut parser = InboundFrameParser::new();
        parser.parse_frame(&frame);

        assert!(parser.is_encrypted());
        assert_eq!(parser.truncated_nonce(), 1);
        assert_eq!(parser.authenticated_data(), b"h");
        assert_eq!(parser.ciphertext(), b"ABCD");
        assert_eq!(parser.tag(), &[0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7]);
        assert_eq!(parser.size(), frame.len());
    }

    #[test]
    fn parse_ohne_ranges() {
        let frame = baue_frame(b"XYZ", 0x07, &[0x00]);
        let mut parser = InboundFrameParser::new();
        parser.parse_frame(&frame);

        assert!(parser.is_encrypted());
        assert!(parser.authenticated_data().is_empty());
        assert_eq!(parser.ciphertext(), b"XYZ");
    }

    #[test]
    fn supplemental_groesser_als_frame() {
        let mut frame = baue_frame(b"hABCD", 0x01, &[0x01, 0x00, 0x01]);
        let size_index = frame.len() - 3;
        frame[size_index] = 0xFF;
        let mut parser = InboundFrameParser::new();
        parser.parse_frame(&frame);
        assert!(!parser.is_encrypted());
    }

    #[test]
    fn ranges_ausserhalb_des_bodys() {
        // Range (Offset 10, Laenge 5) passt nicht in einen 5-Byte-Body
        let frame = baue_frame(b"hABCD", 0x01, &[0x01, 0x0A, 0x05]);
        let mut parser = InboundFrameParser::new();
        parser.parse_frame(&frame);
        assert!(!parser.is_encrypted());
    }

    #[test]
    fn rekonstruktion_nach_entschluesselung() {
        let frame = baue_frame(b"hABCD", 0x01, &[0x01, 0x00, 0x01]);
        let mut parser = InboundFrameParser::new();
        parser.parse_frame(&frame);
        assert_eq!(
            parser.unencrypted_ranges,
            vec![UnencryptedRange { offset: 0, size: 1 }]
        );

        // "Entschluesselung" simulieren
        let (_, _, plaintext) = parser.decrypt_buffers();
        plaintext.copy_from_slice(b"ello");

        let mut out = [0u8; 5];
        let geschrieben = parser.reconstruct_frame(&mut out);
        assert_eq!(geschrieben, 5);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn rekonstruktion_puffer_zu_klein() {
        let frame = baue_frame(b"hABCD", 0x01, &[0x01, 0x00, 0x01]);
        let mut parser = InboundFrameParser::new();
        parser.parse_frame(&frame);
        let mut out = [0u8; 2];
        assert_eq!(parser.reconstruct_frame(&mut out), 0);
    }

    #[test]
    fn wiederverwendung_setzt_zustand_zurueck() {
        let mut parser = InboundFrameParser::new();
        let frame = baue_frame(b"hABCD", 0x05, &[0x01, 0x00, 0x01]);
        parser.parse_frame(&frame);
        assert!(parser.is_encrypted());

        parser.parse_frame(b"klartext");
        assert!(!parser.is_encrypted());
        assert_eq!(parser.truncated_nonce(), 0);
        assert!(parser.ciphertext().is_empty());
    }

    #[test]
    fn mehrbyte_nonce() {
        // Nonce 300 = LEB128 [0xAC, 0x02]
        let mut frame = Vec::new();
        frame.extend_from_slice(b"QRS");
        frame.extend_from_slice(&[0u8; 8]);
        frame.extend_from_slice(&[0xAC, 0x02]);
        frame.push(0x00); // keine Ranges
        frame.push((SUPPLEMENTAL_BYTES + 2 + 1) as u8);
        frame.extend_from_slice(&MARKER_BYTES.to_be_bytes());

        let mut parser = InboundFrameParser::new();
        parser.parse_frame(&frame);
        assert!(parser.is_encrypted());
        assert_eq!(parser.truncated_nonce(), 300);
    }
}
