//! # sotto-protocol
//!
//! Wire-Framing fuer den Ende-zu-Ende verschluesselten Medientransport.
//! Dieses Crate kennt keine Kryptografie: es zerlegt Medien-Frames in
//! verschluesselbare und unverschluesselte Abschnitte, baut den Trailer
//! (Tag, Nonce, Ranges, Magic) und parst ihn auf der Gegenseite wieder.
//!
//! ## Module
//! - `codec` - Codec- und Medientyp-Enums
//! - `leb128` - Unsigned-LEB128 Kodierung (Nonce und Ranges)
//! - `frame` - Framing-Konstanten und unverschluesselte Ranges
//! - `outbound` - Frame-Builder fuer die Sendeseite
//! - `inbound` - Frame-Parser fuer die Empfangsseite
//! - `guard` - Codec-Guard gegen illegale Byte-Muster (H.26x)
//! - `error` - Fehlertypen

pub mod codec;
pub mod error;
pub mod frame;
pub mod guard;
pub mod inbound;
pub mod leb128;
pub mod outbound;

// Bequeme Re-Exports
pub use codec::{Codec, MediaType};
pub use error::{FrameError, FrameResult};
pub use frame::{
    deserialize_unencrypted_ranges, serialize_unencrypted_ranges, unencrypted_ranges_size,
    validate_unencrypted_ranges, TruncatedSyncNonce, UnencryptedRange, UnencryptedRanges,
};
pub use guard::validate_encrypted_frame;
pub use inbound::InboundFrameParser;
pub use outbound::OutboundFrameBuilder;
