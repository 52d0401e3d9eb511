//! Frame encoding between the TCP byte stream and WebSocket messages.
//!
//! The encoding is chosen once per session from the subprotocol negotiated
//! during the WebSocket handshake:
//!
//! | Subprotocol        | TCP → WebSocket          | WebSocket → TCP          |
//! |--------------------|--------------------------|--------------------------|
//! | `base64`           | one text frame, base64   | payload base64-decoded   |
//! | anything / none    | one binary frame, raw    | payload written verbatim |
//!
//! No framing is added in either direction: one TCP read becomes one
//! WebSocket message and one WebSocket message becomes one TCP write.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::{DecodeError, Engine as _};

/// Subprotocol name that selects base64 text framing.
pub const BASE64_SUBPROTOCOL: &str = "base64";

/// Decoder for client payloads: padding optional, stray trailing bits tolerated.
const LENIENT_DECODER: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// How payloads are carried inside WebSocket messages for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEncoding {
    /// Raw bytes in binary frames.
    Binary,
    /// Standard-alphabet base64 in text frames.
    Base64,
}

/// A WebSocket payload ready to be sent, independent of the WebSocket crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl FrameEncoding {
    /// Selects the encoding for a negotiated subprotocol.
    ///
    /// Only the exact string `base64` selects [`FrameEncoding::Base64`];
    /// every other value, including no subprotocol at all, means binary.
    ///
    /// ```rust
    /// use ws2tcp_bridge::domain::FrameEncoding;
    ///
    /// assert_eq!(FrameEncoding::from_subprotocol(Some("base64")), FrameEncoding::Base64);
    /// assert_eq!(FrameEncoding::from_subprotocol(Some("binary")), FrameEncoding::Binary);
    /// assert_eq!(FrameEncoding::from_subprotocol(None), FrameEncoding::Binary);
    /// ```
    pub fn from_subprotocol(subprotocol: Option<&str>) -> Self {
        match subprotocol {
            Some(BASE64_SUBPROTOCOL) => Self::Base64,
            _ => Self::Binary,
        }
    }

    /// Wraps one chunk read from TCP into exactly one WebSocket payload.
    pub fn encode(self, chunk: &[u8]) -> EncodedFrame {
        match self {
            Self::Binary => EncodedFrame::Binary(chunk.to_vec()),
            Self::Base64 => EncodedFrame::Text(STANDARD.encode(chunk)),
        }
    }

    /// Unwraps one WebSocket payload into the bytes to write to TCP.
    ///
    /// In base64 mode ASCII whitespace is skipped and padding is optional.
    ///
    /// # Errors
    ///
    /// Returns the decoder's error when a base64 payload is malformed.
    /// Binary mode never fails.
    pub fn decode(self, payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
        match self {
            Self::Binary => Ok(payload.to_vec()),
            Self::Base64 => {
                if payload.iter().any(u8::is_ascii_whitespace) {
                    let compact: Vec<u8> = payload
                        .iter()
                        .copied()
                        .filter(|b| !b.is_ascii_whitespace())
                        .collect();
                    LENIENT_DECODER.decode(compact)
                } else {
                    LENIENT_DECODER.decode(payload)
                }
            }
        }
    }

    /// Short label for log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Base64 => BASE64_SUBPROTOCOL,
        }
    }
}

impl std::fmt::Display for FrameEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subprotocol_base64_selects_base64() {
        assert_eq!(
            FrameEncoding::from_subprotocol(Some("base64")),
            FrameEncoding::Base64
        );
    }

    #[test]
    fn test_subprotocol_match_is_exact() {
        // Case and surrounding text matter: only the literal name switches modes.
        assert_eq!(
            FrameEncoding::from_subprotocol(Some("BASE64")),
            FrameEncoding::Binary
        );
        assert_eq!(
            FrameEncoding::from_subprotocol(Some("base64x")),
            FrameEncoding::Binary
        );
        assert_eq!(FrameEncoding::from_subprotocol(Some("")), FrameEncoding::Binary);
    }

    #[test]
    fn test_base64_encode_abc_produces_single_text_frame() {
        // Arrange
        let chunk = [0x41, 0x42, 0x43];

        // Act
        let frame = FrameEncoding::Base64.encode(&chunk);

        // Assert
        assert_eq!(frame, EncodedFrame::Text("QUJD".to_string()));
    }

    #[test]
    fn test_binary_encode_passes_bytes_through() {
        let chunk = [0x00, 0xff, 0x10, 0x80];
        assert_eq!(
            FrameEncoding::Binary.encode(&chunk),
            EncodedFrame::Binary(chunk.to_vec())
        );
    }

    #[test]
    fn test_base64_encoded_frame_decodes_back_to_input() {
        // Every byte value, so padding and high bits are both exercised.
        let chunk: Vec<u8> = (0..=255u8).collect();
        let EncodedFrame::Text(text) = FrameEncoding::Base64.encode(&chunk) else {
            panic!("base64 mode must produce a text frame");
        };
        assert_eq!(FrameEncoding::Base64.decode(text.as_bytes()).unwrap(), chunk);
    }

    #[test]
    fn test_base64_decode_accepts_missing_padding() {
        assert_eq!(FrameEncoding::Base64.decode(b"QQ").unwrap(), b"A");
        assert_eq!(FrameEncoding::Base64.decode(b"QQ==").unwrap(), b"A");
    }

    #[test]
    fn test_base64_decode_skips_whitespace() {
        assert_eq!(FrameEncoding::Base64.decode(b"QU\r\nJD ").unwrap(), b"ABC");
    }

    #[test]
    fn test_base64_decode_rejects_invalid_symbols() {
        assert!(FrameEncoding::Base64.decode(b"QU*D").is_err());
    }

    #[test]
    fn test_binary_decode_never_fails() {
        assert_eq!(
            FrameEncoding::Binary.decode(&[0x01, 0x02, 0x03, 0x04]).unwrap(),
            vec![0x01, 0x02, 0x03, 0x04]
        );
    }

    #[test]
    fn test_empty_chunk_encodes_to_empty_payload() {
        assert_eq!(
            FrameEncoding::Base64.encode(&[]),
            EncodedFrame::Text(String::new())
        );
        assert_eq!(FrameEncoding::Base64.decode(b"").unwrap(), Vec::<u8>::new());
    }
}
