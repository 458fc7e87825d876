//! Codec-Guard gegen illegale Byte-Muster
//!
//! H.26x-Packetizer interpretieren die Annex-B-Startcodes `00 00 01` und
//! `00 00 00 01` strukturell. Taucht ein solches Muster im Ciphertext,
//! im Tag oder in den Nonce-Bytes auf, verschiebt der Packetizer den
//! Frame und die Gegenseite kann nicht mehr entschluesseln. Der Guard
//! prueft deshalb nach dem Zusammenbau alle Nicht-Codec-Regionen; der
//! Encryptor rollt bei einem Treffer die Nonce neu.

use crate::frame::unencrypted_ranges_size;
use crate::outbound::OutboundFrameBuilder;

/// Ein Startcode kann ueber eine Abschnittsgrenze hinweg entstehen;
/// deshalb werden 2 Bytes der Nachbarregion mitgeprueft.
const BOUNDARY_PADDING: usize = 2;

/// Prueft den fertig zusammengebauten Frame (`Body + Trailer`) auf
/// codec-illegale Byte-Muster.
///
/// Fuer Codecs ohne Startcode-Semantik ist jeder Frame gueltig. Bei
/// H.26x werden die verschluesselten Abschnitte (jeweils um
/// `BOUNDARY_PADDING` in die Nachbarschaft erweitert) sowie Tag und
/// Nonce-Bytes des Trailers durchsucht - genau die Bytes, die ein
/// Nonce-Neuwurf veraendert.
pub fn validate_encrypted_frame(builder: &OutboundFrameBuilder, frame: &[u8]) -> bool {
    if !builder.codec().ist_h26x() {
        return true;
    }

    let ranges = builder.unencrypted_ranges();
    // Nach der Nonce folgen nur noch Ranges-Deskriptor, Size-Byte und
    // Magic - alles konstante, vom Sender kontrollierte Bytes.
    let statischer_rest = unencrypted_ranges_size(ranges) + 1 + 2;
    let scan_ende = frame.len().saturating_sub(statischer_rest);

    let mut abschnitt_start = 0usize;
    for range in ranges {
        if abschnitt_start < range.offset {
            let von = abschnitt_start.saturating_sub(BOUNDARY_PADDING);
            let bis = (range.offset + BOUNDARY_PADDING).min(scan_ende);
            if enthaelt_startcode(&frame[von..bis]) {
                return false;
            }
        }
        abschnitt_start = range.offset + range.size;
    }

    // Letzter verschluesselter Abschnitt plus Tag- und Nonce-Bytes
    if abschnitt_start < scan_ende {
        let von = abschnitt_start.saturating_sub(BOUNDARY_PADDING);
        if enthaelt_startcode(&frame[von..scan_ende]) {
            return false;
        }
    }

    true
}

/// Sucht das 3-Byte-Muster `00 00 01` (deckt auch 4-Byte-Startcodes ab)
fn enthaelt_startcode(bytes: &[u8]) -> bool {
    bytes.windows(3).any(|fenster| fenster == [0, 0, 1])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
