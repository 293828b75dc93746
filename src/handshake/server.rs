//! Server side of the HTTP upgrade handshake.

use std::fmt;
use std::fmt::Write as FmtWrite;
use std::sync::Arc;

use httparse::Status;
use log::*;

use super::{derive_accept_key, header_contains_token, lower_headers, Handshaken, MAX_HEADERS};
use crate::error::{Error, ProtocolError, Result};

/// The reply sent when an upgrade request is rejected.
pub(crate) const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";

/// How a server picks at most one of the subprotocols offered by a client.
#[derive(Clone, Default)]
pub enum SubprotocolPolicy {
    /// No negotiation: client offers are ignored.
    #[default]
    None,
    /// Choose the first client-offered protocol present in this list.
    Allowed(Vec<String>),
    /// Custom selector; receives the client's offer in order.
    Select(Arc<dyn Fn(&[String]) -> Option<String> + Send + Sync>),
}

impl SubprotocolPolicy {
    /// Apply the policy to the client's offered list.
    pub fn select(&self, offered: &[String]) -> Option<String> {
        match self {
            SubprotocolPolicy::None => None,
            SubprotocolPolicy::Allowed(valid) => {
                offered.iter().find(|p| valid.contains(p)).cloned()
            }
            SubprotocolPolicy::Select(select) => select(offered),
        }
    }
}

impl fmt::Debug for SubprotocolPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubprotocolPolicy::None => f.write_str("None"),
            SubprotocolPolicy::Allowed(valid) => f.debug_tuple("Allowed").field(valid).finish(),
            SubprotocolPolicy::Select(_) => f.write_str("Select(..)"),
        }
    }
}

/// Try to parse and validate a client upgrade request from the buffered
/// bytes. Returns `Ok(None)` while the HTTP head is still incomplete.
///
/// The request line must read `GET <path> HTTP/1.1`, and `Host`,
/// `Sec-WebSocket-Key`, `Upgrade: websocket`, `Connection: upgrade` and
/// `Sec-WebSocket-Version: 13` must all be present.
pub(crate) fn parse_request(
    buf: &[u8],
    policy: &SubprotocolPolicy,
) -> Result<Option<(usize, Handshaken)>> {
    let mut hbuffer = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut hbuffer);
    let size = match request.parse(buf)? {
        Status::Partial => return Ok(None),
        Status::Complete(size) => size,
    };

    if request.method.expect("Bug: no method in header") != "GET" {
        return Err(Error::Protocol(ProtocolError::WrongHttpMethod));
    }
    if request.version.expect("Bug: no HTTP version") < 1 {
        return Err(Error::Protocol(ProtocolError::WrongHttpVersion));
    }
    let path = request.path.expect("Bug: no path in header").to_string();
    trace!("upgrade request for {path}");

    let headers = lower_headers(request.headers)?;

    if !headers.contains_key("host") {
        return Err(Error::Protocol(ProtocolError::MissingHostHeader));
    }
    match headers.get("upgrade") {
        Some(value) if value.eq_ignore_ascii_case("websocket") => {}
        _ => return Err(Error::Protocol(ProtocolError::MissingUpgradeWebSocketHeader)),
    }
    match headers.get("connection") {
        Some(value) if header_contains_token(value, "upgrade") => {}
        _ => return Err(Error::Protocol(ProtocolError::MissingConnectionUpgradeHeader)),
    }
    match headers.get("sec-websocket-version") {
        Some(value) if value == "13" => {}
        _ => return Err(Error::Protocol(ProtocolError::MissingSecWebSocketVersionHeader)),
    }
    let key = match headers.get("sec-websocket-key") {
        Some(key) if !key.is_empty() => key.clone(),
        _ => return Err(Error::Protocol(ProtocolError::MissingSecWebSocketKey)),
    };

    let protocols: Vec<String> = headers
        .get("sec-websocket-protocol")
        .map(|list| {
            list.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect()
        })
        .unwrap_or_default();
    let protocol = policy.select(&protocols);
    if let Some(chosen) = &protocol {
        debug!("selected subprotocol {chosen:?} from {protocols:?}");
    }

    Ok(Some((size, Handshaken { headers, protocol, path: Some(path), key: Some(key), protocols })))
}

/// Format the `101 Switching Protocols` reply for the given client key.
pub(crate) fn accept_response(key: &str, protocol: Option<&str>) -> Vec<u8> {
    let mut reply = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        derive_accept_key(key.as_bytes())
    );
    if let Some(protocol) = protocol {
        write!(reply, "Sec-WebSocket-Protocol: {protocol}\r\n")
            .expect("Bug: can't write to string");
    }
    reply.push_str("\r\n");
    reply.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ProtocolError};

    const REQUEST: &str = "GET /script.ws HTTP/1.1\r\n\
        Host: foo.com\r\n\
        Connection: keep-alive, Upgrade\r\n\
        Upgrade: websocket\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        \r\n";

    #[test]
    fn request_parsing() {
        let (size, outcome) =
            parse_request(REQUEST.as_bytes(), &SubprotocolPolicy::None).unwrap().unwrap();
        assert_eq!(size, REQUEST.len());
        assert_eq!(outcome.path.as_deref(), Some("/script.ws"));
        assert_eq!(outcome.key.as_deref(), Some("dGhlIHNhbXBsZSBub25jZQ=="));
        assert_eq!(outcome.headers.get("host").unwrap(), "foo.com");
        assert!(outcome.protocol.is_none());
    }

    #[test]
    fn request_incomplete() {
        assert!(parse_request(&REQUEST.as_bytes()[..40], &SubprotocolPolicy::None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn request_replying() {
        // canonical pair from RFC 6455 section 1.3
        let reply = accept_response("dGhlIHNhbXBsZSBub25jZQ==", None);
        let text = String::from_utf8(reply).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(!text.contains("Sec-WebSocket-Protocol"));
        assert!(text.ends_with("\r\n\r\n"));

        let reply = accept_response("dGhlIHNhbXBsZSBub25jZQ==", Some("superchat"));
        let text = String::from_utf8(reply).unwrap();
        assert!(text.contains("Sec-WebSocket-Protocol: superchat\r\n"));
    }

    #[test]
    fn wrong_method_is_rejected() {
        let request = REQUEST.replace("GET", "POST");
        assert!(matches!(
            parse_request(request.as_bytes(), &SubprotocolPolicy::None),
            Err(Error::Protocol(ProtocolError::WrongHttpMethod))
        ));
    }

    #[test]
    fn strict_header_checks() {
        for (pattern, expected) in [
            ("Host: foo.com\r\n", ProtocolError::MissingHostHeader),
            ("Upgrade: websocket\r\n", ProtocolError::MissingUpgradeWebSocketHeader),
            ("Connection: keep-alive, Upgrade\r\n", ProtocolError::MissingConnectionUpgradeHeader),
            ("Sec-WebSocket-Version: 13\r\n", ProtocolError::MissingSecWebSocketVersionHeader),
            (
                "Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n",
                ProtocolError::MissingSecWebSocketKey,
            ),
        ] {
            let request = REQUEST.replace(pattern, "");
            match parse_request(request.as_bytes(), &SubprotocolPolicy::None) {
                Err(Error::Protocol(err)) => assert_eq!(err, expected),
                other => panic!("dropping {pattern:?} gave {other:?}"),
            }
        }
    }

    #[test]
    fn wrong_version_is_rejected() {
        let request = REQUEST.replace("Version: 13", "Version: 12");
        assert!(matches!(
            parse_request(request.as_bytes(), &SubprotocolPolicy::None),
            Err(Error::Protocol(ProtocolError::MissingSecWebSocketVersionHeader))
        ));
    }

    #[test]
    fn allow_list_takes_first_client_offer() {
        let request =
            REQUEST.replace("\r\n\r\n", "\r\nSec-WebSocket-Protocol: chat, superchat\r\n\r\n");
        let policy =
            SubprotocolPolicy::Allowed(vec!["superchat".to_string(), "chat".to_string()]);
        let (_, outcome) = parse_request(request.as_bytes(), &policy).unwrap().unwrap();
        // first protocol of the *client's* list that the server allows
        assert_eq!(outcome.protocol.as_deref(), Some("chat"));
        assert_eq!(outcome.protocols, vec!["chat".to_string(), "superchat".to_string()]);
    }

    #[test]
    fn allow_list_mismatch_selects_nothing() {
        let request = REQUEST.replace("\r\n\r\n", "\r\nSec-WebSocket-Protocol: other\r\n\r\n");
        let policy = SubprotocolPolicy::Allowed(vec!["chat".to_string()]);
        let (_, outcome) = parse_request(request.as_bytes(), &policy).unwrap().unwrap();
        assert!(outcome.protocol.is_none());
    }

    #[test]
    fn custom_selector_is_applied() {
        let request =
            REQUEST.replace("\r\n\r\n", "\r\nSec-WebSocket-Protocol: a, b, c\r\n\r\n");
        let policy = SubprotocolPolicy::Select(std::sync::Arc::new(|offered: &[String]| {
            offered.last().cloned()
        }));
        let (_, outcome) = parse_request(request.as_bytes(), &policy).unwrap().unwrap();
        assert_eq!(outcome.protocol.as_deref(), Some("c"));
    }
}
