//! Methods to connect to a WebSocket server as a client.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use log::*;
use url::Url;

use crate::error::{Error, Result, UrlError};
use crate::handshake::client::Request;
use crate::protocol::{Connection, ConnectionConfig};
use crate::stream::Stream;

#[cfg(feature = "tls")]
use native_tls::{HandshakeError as TlsHandshakeError, TlsConnector};

/// A stream that might be protected with TLS.
pub type AutoStream = Stream;

/// Connection mode, plain or TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Plain TCP (`ws:`).
    Plain,
    /// TCP wrapped in TLS (`wss:`).
    Tls,
}

/// Options for [`connect_with`].
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Subprotocols to offer, in preference order.
    pub protocols: Vec<String>,
    /// Additional headers to send with the upgrade request.
    pub extra_headers: Vec<(String, String)>,
    /// Connection configuration; `None` for the defaults.
    pub config: Option<ConnectionConfig>,
}

/// Connect to the given WebSocket URL in blocking mode.
///
/// The URL may be either `ws://host[:port][/path]` or `wss://...`; the
/// scheme selects TLS and the default port (80 or 443). To support `wss`
/// URLs, the `tls` feature must be turned on.
///
/// The returned connection has sent its upgrade request and is still
/// `Connecting`; the first [`recv`](Connection::recv) validates the server's
/// reply and yields [`Event::Open`](crate::Event::Open).
pub fn connect(url: &str) -> Result<Connection<AutoStream>> {
    connect_with(url, ClientOptions::default())
}

/// [`connect`] with subprotocols, extra headers and configuration.
pub fn connect_with(url: &str, options: ClientOptions) -> Result<Connection<AutoStream>> {
    let url = Url::parse(url).map_err(UrlError::Parse)?;
    let mode = url_mode(&url)?;
    let host = url.host_str().ok_or(UrlError::NoHostName)?;
    let port = url.port().unwrap_or(match mode {
        Mode::Plain => 80,
        Mode::Tls => 443,
    });
    let addrs = (host, port).to_socket_addrs()?;
    let stream = connect_to_some(addrs, &url, mode)?;

    let mut request = Request::from_url(&url)?;
    request.protocols = options.protocols;
    request.extra_headers = options.extra_headers;
    Connection::client(stream, request, options.config)
}

/// Get the mode of the given URL.
///
/// This function may be used to ease the creation of custom TLS streams or
/// for use with TLS libraries other than `native_tls`.
pub fn url_mode(url: &Url) -> Result<Mode> {
    match url.scheme() {
        "ws" => Ok(Mode::Plain),
        "wss" => Ok(Mode::Tls),
        _ => Err(Error::Url(UrlError::UnsupportedScheme)),
    }
}

fn connect_to_some(
    addrs: impl Iterator<Item = SocketAddr>,
    url: &Url,
    mode: Mode,
) -> Result<Stream> {
    let domain = url.host_str().ok_or(UrlError::NoHostName)?;
    for addr in addrs {
        debug!("trying to contact {url} at {addr}...");
        if let Ok(raw_stream) = TcpStream::connect(addr) {
            if let Ok(stream) = wrap_stream(raw_stream, domain, mode) {
                return Ok(stream);
            }
        }
    }
    Err(Error::Url(UrlError::UnableToConnect(url.to_string())))
}

#[cfg(feature = "tls")]
fn wrap_stream(stream: TcpStream, domain: &str, mode: Mode) -> Result<Stream> {
    match mode {
        Mode::Plain => Ok(Stream::Plain(stream)),
        Mode::Tls => {
            let connector = TlsConnector::new()?;
            connector.connect(domain, stream).map(Stream::Tls).map_err(|e| match e {
                TlsHandshakeError::Failure(f) => Error::Tls(f),
                TlsHandshakeError::WouldBlock(_) => panic!("Bug: TLS handshake not blocked"),
            })
        }
    }
}

#[cfg(not(feature = "tls"))]
fn wrap_stream(stream: TcpStream, _domain: &str, mode: Mode) -> Result<Stream> {
    match mode {
        Mode::Plain => Ok(Stream::Plain(stream)),
        Mode::Tls => Err(Error::Url(UrlError::TlsFeatureNotEnabled)),
    }
}

#[cfg(test)]
mod tests {
    use super::{url_mode, Mode};
    use crate::error::{Error, UrlError};
    use url::Url;

    #[test]
    fn scheme_selects_mode() {
        assert_eq!(url_mode(&Url::parse("ws://example.com").unwrap()).unwrap(), Mode::Plain);
        assert_eq!(url_mode(&Url::parse("wss://example.com").unwrap()).unwrap(), Mode::Tls);
        assert!(matches!(
            url_mode(&Url::parse("http://example.com").unwrap()),
            Err(Error::Url(UrlError::UnsupportedScheme))
        ));
    }
}
