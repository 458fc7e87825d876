//! Frame-Builder fuer die Sendeseite
//!
//! Zerlegt einen Klartext-Frame nach Codec in unverschluesselte Bytes
//! (Packetizer-sichtbare Header) und zu verschluesselnde Bytes, und baut
//! nach der AEAD-Operation den Frame-Body aus Ciphertext und
//! unverschluesselten Abschnitten wieder zusammen.
//!
//! Builder sind wiederverwendbar: `process_frame` setzt den Zustand
//! zurueck, die internen Puffer behalten ihre Kapazitaet (Pooling im
//! Encryptor).

use tracing::trace;

use crate::codec::Codec;
use crate::frame::{UnencryptedRange, UnencryptedRanges};

/// Zerlegt und rekonstruiert Frames auf der Sendeseite
#[derive(Debug, Default)]
pub struct OutboundFrameBuilder {
    codec: Codec,
    frame_index: usize,
    unencrypted_bytes: Vec<u8>,
    encrypted_bytes: Vec<u8>,
    ciphertext_bytes: Vec<u8>,
    unencrypted_ranges: UnencryptedRanges,
}

impl OutboundFrameBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zerlegt `frame` nach den Regeln von `codec`
    ///
    /// Schlaegt der Codec-Splitter fehl (z. B. H.264 ohne Startcode),
    /// wird der komplette Frame als verschluesselt markiert.
    pub fn process_frame(&mut self, frame: &[u8], codec: Codec) {
        self.reset();
        self.codec = codec;
        self.unencrypted_bytes.reserve(frame.len());
        self.encrypted_bytes.reserve(frame.len());

        let ok = match codec {
            Codec::Opus | Codec::Vp8 | Codec::Vp9 | Codec::Av1 => {
                self.split_leading_header(frame, 1)
            }
            Codec::H264 => self.split_h26x(frame, 1),
            Codec::H265 => self.split_h26x(frame, 2),
            Codec::Unknown => false,
        };

        if !ok {
            trace!(?codec, groesse = frame.len(), "Codec-Split fehlgeschlagen, Frame wird komplett verschluesselt");
            self.frame_index = 0;
            self.unencrypted_bytes.clear();
            self.encrypted_bytes.clear();
            self.unencrypted_ranges.clear();
            self.add_encrypted_bytes(frame);
        }

        self.ciphertext_bytes.resize(self.encrypted_bytes.len(), 0);
    }

    /// Baut den Frame-Body aus Ciphertext und unverschluesselten Bytes
    ///
    /// Gibt die Anzahl geschriebener Bytes zurueck; 0 wenn `out` zu
    /// klein ist.
    pub fn reconstruct_frame(&self, out: &mut [u8]) -> usize {
        let total = self.unencrypted_bytes.len() + self.ciphertext_bytes.len();
        if out.len() < total {
            tracing::warn!(
                benoetigt = total,
                vorhanden = out.len(),
                "Ausgabepuffer zu klein fuer den rekonstruierten Frame"
            );
            return 0;
        }

        let mut frame_index = 0;
        let mut unencrypted_index = 0;
        let mut ciphertext_index = 0;
        for range in &self.unencrypted_ranges {
            let encrypted_bytes = range.offset - frame_index;
            if encrypted_bytes > 0 {
                out[frame_index..range.offset].copy_from_slice(
                    &self.ciphertext_bytes[ciphertext_index..ciphertext_index + encrypted_bytes],
                );
                ciphertext_index += encrypted_bytes;
            }
            out[range.offset..range.offset + range.size].copy_from_slice(
                &self.unencrypted_bytes[unencrypted_index..unencrypted_index + range.size],
            );
            unencrypted_index += range.size;
            frame_index = range.offset + range.size;
        }
        if ciphertext_index < self.ciphertext_bytes.len() {
            let rest = self.ciphertext_bytes.len() - ciphertext_index;
            out[frame_index..frame_index + rest]
                .copy_from_slice(&self.ciphertext_bytes[ciphertext_index..]);
        }
        total
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Unverschluesselte Bytes in Range-Reihenfolge (die AAD)
    pub fn unencrypted_bytes(&self) -> &[u8] {
        &self.unencrypted_bytes
    }

    /// Zu verschluesselnde Bytes (der AEAD-Klartext)
    pub fn encrypted_bytes(&self) -> &[u8] {
        &self.encrypted_bytes
    }

    pub fn unencrypted_ranges(&self) -> &[UnencryptedRange] {
        &self.unencrypted_ranges
    }

    /// Puffer fuer die AEAD-Operation: (Ciphertext-Ziel, Klartext, AAD)
    pub fn cipher_buffers(&mut self) -> (&mut [u8], &[u8], &[u8]) {
        (
            &mut self.ciphertext_bytes,
            &self.encrypted_bytes,
            &self.unencrypted_bytes,
        )
    }

    /// Setzt den Builder fuer den naechsten Frame zurueck
    pub fn reset(&mut self) {
        self.codec = Codec::Unknown;
        self.frame_index = 0;
        self.unencrypted_bytes.clear();
        self.encrypted_bytes.clear();
        self.ciphertext_bytes.clear();
        self.unencrypted_ranges.clear();
    }

    /// Haengt unverschluesselte Bytes an und fuehrt die Ranges nach;
    /// direkt angrenzende Ranges werden verschmolzen.
    pub fn add_unencrypted_bytes(&mut self, bytes: &[u8]) {
        if let Some(letzte) = self.unencrypted_ranges.last_mut() {
            if letzte.offset + letzte.size == self.frame_index {
                letzte.size += bytes.len();
                self.unencrypted_bytes.extend_from_slice(bytes);
                self.frame_index += bytes.len();
                return;
            }
        }
        self.unencrypted_ranges.push(UnencryptedRange {
            offset: self.frame_index,
            size: bytes.len(),
        });
        self.unencrypted_bytes.extend_from_slice(bytes);
        self.frame_index += bytes.len();
    }

    /// Haengt zu verschluesselnde Bytes an
    pub fn add_encrypted_bytes(&mut self, bytes: &[u8]) {
        self.encrypted_bytes.extend_from_slice(bytes);
        self.frame_index += bytes.len();
    }

    // -----------------------------------------------------------------------
    // Codec-Splitter
    // -----------------------------------------------------------------------

    /// Opus-TOC bzw. 1-Byte-Payload-Deskriptor (VP8/VP9) bzw. OBU-Header
    /// (AV1) bleibt unverschluesselt, der Rest wird verschluesselt.
    fn split_leading_header(&mut self, frame: &[u8], header_bytes: usize) -> bool {
        if frame.len() < header_bytes {
            return false;
        }
        self.add_unencrypted_bytes(&frame[..header_bytes]);
        self.add_encrypted_bytes(&frame[header_bytes..]);
        true
    }

    /// H.26x: jeder Annex-B-Startcode plus NAL-Header bleibt
    /// unverschluesselt, die NAL-Payloads werden verschluesselt.
    fn split_h26x(&mut self, frame: &[u8], nal_header_bytes: usize) -> bool {
        if !beginnt_mit_startcode(frame) {
            return false;
        }

        let mut index = 0;
        while index < frame.len() {
            let startcode_len = if frame[index..].starts_with(&[0, 0, 0, 1]) { 4 } else { 3 };
            let header_ende = (index + startcode_len + nal_header_bytes).min(frame.len());
            self.add_unencrypted_bytes(&frame[index..header_ende]);

            let naechster = naechster_startcode(frame, header_ende);
            let payload_ende = naechster.unwrap_or(frame.len());
            if payload_ende > header_ende {
                self.add_encrypted_bytes(&frame[header_ende..payload_ende]);
            }
            match naechster {
                Some(position) => index = position,
                None => break,
            }
        }
        true
    }
}

fn beginnt_mit_startcode(frame: &[u8]) -> bool {
    frame.starts_with(&[0, 0, 1]) || frame.starts_with(&[0, 0, 0, 1])
}

/// Position des naechsten Annex-B-Startcodes ab `von`, inklusive der
/// fuehrenden Null bei 4-Byte-Codes.
fn naechster_startcode(frame: &[u8], von: usize) -> Option<usize> {
    let mut index = von;
    while index + 3 <= frame.len() {
        if frame[index] == 0 && frame[index + 1] == 0 && frame[index + 2] == 1 {
            if index > von && frame[index - 1] == 0 {
                return Some(index - 1);
            }
            return Some(index);
        }
        index += 1;
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opus_toc_bleibt_unverschluesselt() {
        let mut builder = OutboundFrameBuilder::new();
        builder.process_frame(b"hello", Codec::Opus);

        assert_eq!(builder.unencrypted_bytes(), b"h");
        assert_eq!(builder.encrypted_bytes(), b"ello");
        assert_eq!(
            builder.unencrypted_ranges(),
            &[UnencryptedRange { offset: 0, size: 1 }]
        );
    }

    #[test]
    fn unbekannter_codec_verschluesselt_alles() {
        let mut builder = OutboundFrameBuilder::new();
        builder.process_frame(b"abcdef", Codec::Unknown);

        assert!(builder.unencrypted_bytes().is_empty());
        assert_eq!(builder.encrypted_bytes(), b"abcdef");
        assert!(builder.unencrypted_ranges().is_empty());
    }

    #[test]
    fn h264_startcodes_und_nal_header() {
        // Zwei NAL-Units: 4-Byte-Startcode, dann 3-Byte-Startcode
        let frame = [
            0, 0, 0, 1, 0x65, 0xAA, 0xBB, 0xCC, // IDR mit Payload
            0, 0, 1, 0x41, 0xDD, 0xEE, // Non-IDR mit Payload
        ];
        let mut builder = OutboundFrameBuilder::new();
        builder.process_frame(&frame, Codec::H264);

        assert_eq!(
            builder.unencrypted_ranges(),
            &[
                UnencryptedRange { offset: 0, size: 5 },
                UnencryptedRange { offset: 8, size: 4 },
            ]
        );
        assert_eq!(builder.unencrypted_bytes(), &[0, 0, 0, 1, 0x65, 0, 0, 1, 0x41]);
        assert_eq!(builder.encrypted_bytes(), &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);
    }

    #[test]
    fn h265_zwei_byte_nal_header() {
        let frame = [0, 0, 1, 0x40, 0x01, 0x11, 0x22];
        let mut builder = OutboundFrameBuilder::new();
        builder.process_frame(&frame, Codec::H265);

        assert_eq!(
            builder.unencrypted_ranges(),
            &[UnencryptedRange { offset: 0, size: 5 }]
        );
        assert_eq!(builder.encrypted_bytes(), &[0x11, 0x22]);
    }

    #[test]
    fn h264_ohne_startcode_faellt_zurueck() {
        let mut builder = OutboundFrameBuilder::new();
        builder.process_frame(&[0x65, 0xAA, 0xBB], Codec::H264);

        assert!(builder.unencrypted_bytes().is_empty());
        assert_eq!(builder.encrypted_bytes(), &[0x65, 0xAA, 0xBB]);
    }

    #[test]
    fn rekonstruktion_interleaved() {
        let frame = [
            0, 0, 0, 1, 0x65, 0xAA, 0xBB, 0xCC, //
            0, 0, 1, 0x41, 0xDD, 0xEE,
        ];
        let mut builder = OutboundFrameBuilder::new();
        builder.process_frame(&frame, Codec::H264);

        // Ciphertext-Puffer mit dem "Klartext" fuellen - die Rekonstruktion
        // muss dann den Original-Frame ergeben
        let plaintext = builder.encrypted_bytes().to_vec();
        let (ciphertext, _, _) = builder.cipher_buffers();
        ciphertext.copy_from_slice(&plaintext);

        let mut out = [0u8; 14];
        let geschrieben = builder.reconstruct_frame(&mut out);
        assert_eq!(geschrieben, frame.len());
        assert_eq!(out, frame);
    }

    #[test]
    fn rekonstruktion_puffer_zu_klein() {
        let mut builder = OutboundFrameBuilder::new();
        builder.process_frame(b"hello", Codec::Opus);
        let mut out = [0u8; 3];
        assert_eq!(builder.reconstruct_frame(&mut out), 0);
    }

    #[test]
    fn angrenzende_ranges_verschmelzen() {
        let mut builder = OutboundFrameBuilder::new();
        builder.add_unencrypted_bytes(&[1, 2]);
        builder.add_unencrypted_bytes(&[3]);
        assert_eq!(
            builder.unencrypted_ranges(),
            &[UnencryptedRange { offset: 0, size: 3 }]
        );
    }

    #[test]
    fn wiederverwendung_nach_reset() {
        let mut builder = OutboundFrameBuilder::new();
        builder.process_frame(b"erster frame", Codec::Opus);
        builder.process_frame(b"xy", Codec::Opus);

        assert_eq!(builder.unencrypted_bytes(), b"x");
        assert_eq!(builder.encrypted_bytes(), b"y");
        assert_eq!(builder.unencrypted_ranges().len(), 1);
    }

    #[test]
    fn leerer_opus_frame_faellt_zurueck() {
        let mut builder = OutboundFrameBuilder::new();
        builder.process_frame(&[], Codec::Opus);
        assert!(builder.unencrypted_bytes().is_empty());
        assert!(builder.encrypted_bytes().is_empty());
    }
}
