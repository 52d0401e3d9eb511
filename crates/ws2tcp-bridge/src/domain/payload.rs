//! Human-readable previews of relayed payloads for verbose logging.

use std::fmt::Write as _;

/// Number of leading bytes shown in a preview.
pub const PREVIEW_LEN: usize = 32;

/// Formats the first [`PREVIEW_LEN`] bytes of `data` as lowercase hex,
/// followed by the same bytes as ASCII with non-printable bytes dropped.
///
/// ```rust
/// use ws2tcp_bridge::domain::payload::preview;
///
/// assert_eq!(preview(b"AB\x00C"), "41420043 ABC");
/// ```
pub fn preview(data: &[u8]) -> String {
    let head = &data[..data.len().min(PREVIEW_LEN)];

    let mut out = String::with_capacity(head.len() * 3 + 1);
    for byte in head {
        // Writing to a String cannot fail.
        let _ = write!(out, "{byte:02x}");
    }
    out.push(' ');
    out.extend(
        head.iter()
            .filter(|b| b.is_ascii_graphic() || **b == b' ')
            .map(|b| char::from(*b)),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_of_empty_payload_is_single_space() {
        assert_eq!(preview(&[]), " ");
    }

    #[test]
    fn test_preview_drops_control_and_high_bytes_from_ascii_part() {
        assert_eq!(preview(&[0x41, 0x0a, 0xff, 0x42]), "410aff42 AB");
    }

    #[test]
    fn test_preview_is_truncated_to_32_bytes() {
        let data = vec![b'x'; 100];
        let text = preview(&data);
        let (hex, ascii) = text.split_once(' ').unwrap();
        assert_eq!(hex.len(), 64);
        assert_eq!(ascii.len(), 32);
    }
}
