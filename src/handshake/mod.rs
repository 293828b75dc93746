//! WebSocket handshake machinery shared between client and server.

pub mod client;
pub mod server;

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};

use crate::error::Result;

// Limit the number of header lines.
pub(crate) const MAX_HEADERS: usize = 124;

/// Turns a Sec-WebSocket-Key into a Sec-WebSocket-Accept.
pub fn derive_accept_key(key: &[u8]) -> String {
    // ... field is constructed by concatenating /key/ ...
    // ... with the string "258EAFA5-E914-47DA-95CA-C5AB0DC85B11" (RFC 6455)
    const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WS_GUID);
    STANDARD.encode(sha1.finalize())
}

/// Generate a random key for the `Sec-WebSocket-Key` header.
pub fn generate_key() -> String {
    // a base64-encoded (see Section 4 of [RFC4648]) value that,
    // when decoded, is 16 bytes in length (RFC 6455)
    let r: [u8; 16] = rand::random();
    STANDARD.encode(r)
}

/// Check a comma-separated header value for a token, ASCII
/// case-insensitively.
pub(crate) fn header_contains_token(value: &str, token: &str) -> bool {
    value.split(',').any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Store headers under their lowercased names. Later duplicates win, and
/// malformed (non-UTF-8) values fail the handshake.
pub(crate) fn lower_headers(raw: &[httparse::Header<'_>]) -> Result<HashMap<String, String>> {
    let mut headers = HashMap::with_capacity(raw.len());
    for header in raw {
        let value = std::str::from_utf8(header.value)?.trim().to_string();
        headers.insert(header.name.to_ascii_lowercase(), value);
    }
    Ok(headers)
}

/// What a completed handshake hands back to the connection.
#[derive(Debug)]
pub(crate) struct Handshaken {
    /// All peer headers, keyed by lowercased name.
    pub headers: HashMap<String, String>,
    /// The negotiated subprotocol.
    pub protocol: Option<String>,
    /// The request target (server side only).
    pub path: Option<String>,
    /// The client's `Sec-WebSocket-Key` (server side only).
    pub key: Option<String>,
    /// The client's offered subprotocols (server side only).
    pub protocols: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::{derive_accept_key, generate_key, header_contains_token};

    #[test]
    fn key_conversion() {
        // example from RFC 6455
        assert_eq!(
            derive_accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn random_keys() {
        let k1 = generate_key();
        let k2 = generate_key();
        assert_ne!(k1, k2);
        assert_eq!(k1.len(), k2.len());
        assert_eq!(k1.len(), 24);
        assert!(k1.ends_with("=="));
        assert!(k1[..22].find('=').is_none());
    }

    #[test]
    fn connection_header_tokens() {
        assert!(header_contains_token("Upgrade", "upgrade"));
        assert!(header_contains_token("keep-alive, Upgrade", "upgrade"));
        assert!(header_contains_token("keep-alive,Upgrade", "upgrade"));
        assert!(!header_contains_token("keep-alive", "upgrade"));
        assert!(!header_contains_token("upgrade2", "upgrade"));
    }
}
