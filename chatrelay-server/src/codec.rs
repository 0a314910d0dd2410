//! Message codec
//!
//! Pure conversion between raw transport bytes and text. One transport read is
//! one message; there is no framing and no reassembly of codepoints split
//! across reads.

use bytes::Bytes;

/// Text that ends the sender's session
pub const QUIT_TOKEN: &str = "quit";

/// Decode a byte span as UTF-8, replacing malformed sequences with U+FFFD
pub fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Encode text as UTF-8 bytes
pub fn encode(text: &str) -> Bytes {
    Bytes::copy_from_slice(text.as_bytes())
}

/// Build the wire text relayed to peers: `<name>:<text>`
pub fn format_broadcast(sender_name: &str, text: &str) -> String {
    format!("{}:{}", sender_name, text)
}

/// Whether `text` is exactly the quit token
///
/// Case-sensitive and whole-message: `"quit\n"` from a line-oriented client is
/// relayed as ordinary text and does not end the session.
pub fn is_quit(text: &str) -> bool {
    text == QUIT_TOKEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_utf8() {
        assert_eq!(decode("héllo 世界".as_bytes()), "héllo 世界");
    }

    #[test]
    fn test_decode_empty() {
        assert_eq!(decode(&[]), "");
    }

    #[test]
    fn test_decode_malformed_uses_replacement() {
        let text = decode(&[b'h', b'i', 0xff, b'!']);
        assert_eq!(text, "hi\u{FFFD}!");
    }

    #[test]
    fn test_decode_torn_codepoint_is_not_fatal() {
        // First two bytes of a three-byte sequence
        let bytes = &"世".as_bytes()[..2];
        assert_eq!(decode(bytes), "\u{FFFD}");
    }

    #[test]
    fn test_encode_is_utf8() {
        assert_eq!(&encode("Client[1]:héllo")[..], "Client[1]:héllo".as_bytes());
    }

    #[test]
    fn test_format_broadcast() {
        assert_eq!(format_broadcast("Client[5000]", "hi"), "Client[5000]:hi");
        assert_eq!(format_broadcast("Client[5000]", "a:b"), "Client[5000]:a:b");
    }

    #[test]
    fn test_is_quit_exact() {
        assert!(is_quit("quit"));
    }

    #[test]
    fn test_is_quit_line_terminator_is_not_quit() {
        assert!(!is_quit("quit\n"));
        assert!(!is_quit("quit\r\n"));
    }

    #[test]
    fn test_is_quit_case_sensitive() {
        assert!(!is_quit("Quit"));
        assert!(!is_quit("QUIT"));
    }

    #[test]
    fn test_is_quit_rejects_other_text() {
        assert!(!is_quit(" quit"));
        assert!(!is_quit("quit now"));
        assert!(!is_quit(""));
    }
}
