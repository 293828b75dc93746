//! Client side of the HTTP upgrade handshake.

use std::io::Write;

use httparse::Status;
use log::*;
use url::Url;

use super::{header_contains_token, lower_headers, Handshaken, MAX_HEADERS};
use crate::error::{Error, ProtocolError, Result, SubProtocolError, UrlError};

/// Parameters of the client upgrade request.
#[derive(Debug, Clone)]
pub struct Request {
    /// `Host` header value.
    pub host: String,
    /// Request target (path, plus query if any).
    pub path: String,
    /// Subprotocols to offer, in preference order.
    pub protocols: Vec<String>,
    /// Additional headers to send with the request.
    pub extra_headers: Vec<(String, String)>,
}

impl Request {
    /// Build a request from a parsed `ws:`/`wss:` URL.
    pub fn from_url(url: &Url) -> Result<Self> {
        let host = url.host_str().ok_or(UrlError::NoHostName)?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        Ok(Request { host, path, protocols: Vec::new(), extra_headers: Vec::new() })
    }
}

/// Write the HTTP upgrade request for the given key.
pub(crate) fn write_request(stream: &mut impl Write, request: &Request, key: &str) -> Result<()> {
    let mut req = Vec::new();
    write!(
        req,
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: {key}\r\n",
        path = request.path,
        host = request.host,
    )
    .expect("Bug: can't write to vector");
    if !request.protocols.is_empty() {
        write!(req, "Sec-WebSocket-Protocol: {}\r\n", request.protocols.join(", "))
            .expect("Bug: can't write to vector");
    }
    for (name, value) in &request.extra_headers {
        write!(req, "{name}: {value}\r\n").expect("Bug: can't write to vector");
    }
    req.extend_from_slice(b"\r\n");
    stream.write_all(&req)?;
    Ok(())
}

/// Try to parse and validate the server's reply from the buffered bytes.
/// Returns `Ok(None)` while the HTTP head is still incomplete, otherwise
/// the parsed size and the handshake outcome.
pub(crate) fn parse_response(
    buf: &[u8],
    accept_key: &str,
    offered: &[String],
) -> Result<Option<(usize, Handshaken)>> {
    let mut hbuffer = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut hbuffer);
    let size = match response.parse(buf)? {
        Status::Partial => return Ok(None),
        Status::Complete(size) => size,
    };

    // 1. If the status code received from the server is not 101, the client
    //    handles the response per HTTP procedures. (RFC 6455)
    let code = response.code.expect("Bug: no HTTP response code");
    if code != 101 {
        return Err(Error::Http(code));
    }
    if response.version.expect("Bug: no HTTP version") < 1 {
        return Err(Error::Protocol(ProtocolError::WrongHttpVersion));
    }
    trace!("server answered 101, validating headers");

    let headers = lower_headers(response.headers)?;

    // 2. If the response lacks an |Upgrade| header field or the |Upgrade|
    //    header field contains a value that is not an ASCII case-insensitive
    //    match for the value "websocket", the client MUST _Fail the
    //    WebSocket Connection_. (RFC 6455)
    match headers.get("upgrade") {
        Some(value) if value.eq_ignore_ascii_case("websocket") => {}
        _ => return Err(Error::Protocol(ProtocolError::MissingUpgradeWebSocketHeader)),
    }

    // 3. If the response lacks a |Connection| header field or the
    //    |Connection| header field doesn't contain a token that is an ASCII
    //    case-insensitive match for the value "Upgrade", the client MUST
    //    _Fail the WebSocket Connection_. (RFC 6455)
    match headers.get("connection") {
        Some(value) if header_contains_token(value, "upgrade") => {}
        _ => return Err(Error::Protocol(ProtocolError::MissingConnectionUpgradeHeader)),
    }

    // 4. If the response lacks a |Sec-WebSocket-Accept| header field or the
    //    |Sec-WebSocket-Accept| contains a value other than the
    //    base64-encoded SHA-1 of the concatenation of the |Sec-WebSocket-
    //    Key| with "258EAFA5-E914-47DA-95CA-C5AB0DC85B11", the client MUST
    //    _Fail the WebSocket Connection_. (RFC 6455)
    match headers.get("sec-websocket-accept") {
        Some(value) if value == accept_key => {}
        _ => return Err(Error::Protocol(ProtocolError::SecWebSocketAcceptKeyMismatch)),
    }

    // 6. If the response includes a |Sec-WebSocket-Protocol| header field
    //    and this header field indicates the use of a subprotocol that was
    //    not present in the client's handshake, the client MUST _Fail the
    //    WebSocket Connection_. (RFC 6455)
    let protocol = match headers.get("sec-websocket-protocol") {
        Some(protocol) if offered.is_empty() => {
            debug!("server chose {protocol:?} but none was offered");
            return Err(Error::Protocol(ProtocolError::SecWebSocketSubProtocolError(
                SubProtocolError::ServerSentSubProtocolNoneRequested,
            )));
        }
        Some(protocol) => {
            if !offered.iter().any(|p| p == protocol) {
                debug!("server chose {protocol:?}, not among the offered {offered:?}");
                return Err(Error::Protocol(ProtocolError::SecWebSocketSubProtocolError(
                    SubProtocolError::InvalidSubProtocol,
                )));
            }
            Some(protocol.clone())
        }
        None => None,
    };

    Ok(Some((
        size,
        Handshaken { headers, protocol, path: None, key: None, protocols: Vec::new() },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ProtocolError, SubProtocolError};

    const ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    fn ok_response() -> String {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Accept: {ACCEPT}\r\n\
             \r\n"
        )
    }

    #[test]
    fn request_format() {
        let request = Request {
            host: "foo.com:8080".into(),
            path: "/chat?x=1".into(),
            protocols: vec!["chat".into(), "superchat".into()],
            extra_headers: vec![("X-Trace".into(), "1".into())],
        };
        let mut out = Vec::new();
        write_request(&mut out, &request, "dGhlIHNhbXBsZSBub25jZQ==").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("GET /chat?x=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: foo.com:8080\r\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(text.contains("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: chat, superchat\r\n"));
        assert!(text.contains("X-Trace: 1\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn request_from_url() {
        let url = url::Url::parse("ws://example.com:3000/socket?room=2").unwrap();
        let request = Request::from_url(&url).unwrap();
        assert_eq!(request.host, "example.com:3000");
        assert_eq!(request.path, "/socket?room=2");

        let bare = url::Url::parse("wss://example.com").unwrap();
        let request = Request::from_url(&bare).unwrap();
        assert_eq!(request.host, "example.com");
        assert_eq!(request.path, "/");
    }

    #[test]
    fn response_incomplete() {
        let response = ok_response();
        let partial = &response.as_bytes()[..20];
        assert!(parse_response(partial, ACCEPT, &[]).unwrap().is_none());
    }

    #[test]
    fn response_accepted() {
        let (size, outcome) = parse_response(ok_response().as_bytes(), ACCEPT, &[])
            .unwrap()
            .unwrap();
        assert_eq!(size, ok_response().len());
        assert_eq!(outcome.headers.get("upgrade").unwrap(), "websocket");
        assert!(outcome.protocol.is_none());
    }

    #[test]
    fn response_with_wrong_status() {
        let response = b"HTTP/1.1 404 Not Found\r\n\r\n";
        assert!(matches!(parse_response(response, ACCEPT, &[]), Err(Error::Http(404))));
    }

    #[test]
    fn response_with_wrong_accept() {
        let response = ok_response().replace(ACCEPT, "bm90IHRoZSByaWdodCBrZXk=");
        assert!(matches!(
            parse_response(response.as_bytes(), ACCEPT, &[]),
            Err(Error::Protocol(ProtocolError::SecWebSocketAcceptKeyMismatch))
        ));
    }

    #[test]
    fn response_missing_upgrade_header() {
        let response = ok_response().replace("Upgrade: websocket\r\n", "");
        assert!(matches!(
            parse_response(response.as_bytes(), ACCEPT, &[]),
            Err(Error::Protocol(ProtocolError::MissingUpgradeWebSocketHeader))
        ));
    }

    #[test]
    fn unrequested_subprotocol_is_rejected() {
        let response =
            ok_response().replace("\r\n\r\n", "\r\nSec-WebSocket-Protocol: chat\r\n\r\n");
        assert!(matches!(
            parse_response(response.as_bytes(), ACCEPT, &[]),
            Err(Error::Protocol(ProtocolError::SecWebSocketSubProtocolError(
                SubProtocolError::ServerSentSubProtocolNoneRequested
            )))
        ));
    }

    #[test]
    fn unoffered_subprotocol_is_rejected() {
        let response =
            ok_response().replace("\r\n\r\n", "\r\nSec-WebSocket-Protocol: other\r\n\r\n");
        assert!(matches!(
            parse_response(response.as_bytes(), ACCEPT, &["chat".to_string()]),
            Err(Error::Protocol(ProtocolError::SecWebSocketSubProtocolError(
                SubProtocolError::InvalidSubProtocol
            )))
        ));
    }

    #[test]
    fn offered_subprotocol_is_accepted() {
        let response =
            ok_response().replace("\r\n\r\n", "\r\nSec-WebSocket-Protocol: chat\r\n\r\n");
        let (_, outcome) = parse_response(
            response.as_bytes(),
            ACCEPT,
            &["chat".to_string(), "superchat".to_string()],
        )
        .unwrap()
        .unwrap();
        assert_eq!(outcome.protocol.as_deref(), Some("chat"));
    }
}
