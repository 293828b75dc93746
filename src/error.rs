//! Error handling.

use std::{io, str};

use crate::protocol::frame::coding::Data;

/// Result type of all WebSocket library calls.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Possible WebSocket errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// WebSocket connection closed normally. This informs you of the close.
    /// It's not an error as such and nothing wrong happened.
    ///
    /// Returned once the close handshake initiated by us is complete, at
    /// which point it is safe to drop the underlying connection.
    #[error("Connection closed normally")]
    ConnectionClosed,
    /// Trying to work with already closed connection.
    ///
    /// As opposed to [`Error::ConnectionClosed`], this indicates your code
    /// tries to operate on a connection whose close was already delivered.
    #[error("Trying to work with closed connection")]
    AlreadyClosed,
    /// Input-output error. Apart from `WouldBlock`, these are generally
    /// errors with the underlying connection and you should probably
    /// consider them fatal.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// TLS error.
    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),
    /// Buffer capacity exhausted.
    #[error("Space limit exceeded: {0}")]
    Capacity(#[from] CapacityError),
    /// Protocol violation.
    #[error("WebSocket protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Invalid URL.
    #[error("URL error: {0}")]
    Url(#[from] UrlError),
    /// The peer answered the upgrade request with a non-101 HTTP status.
    #[error("HTTP error: {0}")]
    Http(u16),
}

impl From<str::Utf8Error> for Error {
    fn from(_: str::Utf8Error) -> Self {
        Error::Protocol(ProtocolError::InvalidUtf8)
    }
}

impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Self {
        match err {
            httparse::Error::TooManyHeaders => Error::Capacity(CapacityError::TooManyHeaders),
            e => Error::Protocol(ProtocolError::HttparseError(e)),
        }
    }
}

/// Indicates the specific type/cause of a capacity error.
#[derive(Debug, PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum CapacityError {
    /// Too many headers provided (see [`httparse::Error::TooManyHeaders`]).
    #[error("Too many headers")]
    TooManyHeaders,
    /// The HTTP upgrade head did not terminate within the receive buffer cap.
    #[error("Handshake longer than the receive buffer cap: {size} > {max}")]
    HandshakeTooLong {
        /// The bytes buffered so far.
        size: usize,
        /// The receive buffer cap.
        max: usize,
    },
    /// Message is bigger than the maximum allowed size.
    #[error("Message too long: {size} > {max}")]
    MessageTooLong {
        /// The size of the message.
        size: usize,
        /// The maximum allowed message size.
        max: usize,
    },
}

/// Indicates the specific type/cause of a subprotocol header error.
#[derive(Debug, PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum SubProtocolError {
    /// The server sent a subprotocol to a client handshake request that did not request one.
    #[error("Server sent a subprotocol but none was requested")]
    ServerSentSubProtocolNoneRequested,
    /// The server sent a subprotocol the client did not offer.
    #[error("Server sent a subprotocol the client did not request")]
    InvalidSubProtocol,
}

/// Indicates the specific type/cause of a protocol error.
#[derive(Debug, PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum ProtocolError {
    /// Use of the wrong HTTP method (the WebSocket protocol requires the GET method be used).
    #[error("Unsupported HTTP method used, only GET is allowed")]
    WrongHttpMethod,
    /// Wrong HTTP version used (the WebSocket protocol requires version 1.1 or higher).
    #[error("HTTP version must be 1.1 or higher")]
    WrongHttpVersion,
    /// Missing `Connection: upgrade` HTTP header.
    #[error("No \"Connection: upgrade\" header")]
    MissingConnectionUpgradeHeader,
    /// Missing `Upgrade: websocket` HTTP header.
    #[error("No \"Upgrade: websocket\" header")]
    MissingUpgradeWebSocketHeader,
    /// Missing `Sec-WebSocket-Version: 13` HTTP header.
    #[error("No \"Sec-WebSocket-Version: 13\" header")]
    MissingSecWebSocketVersionHeader,
    /// Missing `Sec-WebSocket-Key` HTTP header.
    #[error("No \"Sec-WebSocket-Key\" header")]
    MissingSecWebSocketKey,
    /// Missing `Host` HTTP header.
    #[error("No \"Host\" header")]
    MissingHostHeader,
    /// The `Sec-WebSocket-Accept` header is either not present or does not
    /// specify the correct key value.
    #[error("Key mismatch in \"Sec-WebSocket-Accept\" header")]
    SecWebSocketAcceptKeyMismatch,
    /// The `Sec-WebSocket-Protocol` header was invalid.
    #[error("SubProtocol error: {0}")]
    SecWebSocketSubProtocolError(SubProtocolError),
    /// Wrapper around a [`httparse::Error`] value.
    #[error("httparse error: {0}")]
    HttparseError(httparse::Error),
    /// Not allowed to send on a connection that is not open.
    #[error("Trying to send on a connection that is not open")]
    SendWhileNotOpen,
    /// Reserved bits in frame header are non-zero.
    #[error("Reserved bits are non-zero")]
    NonZeroReservedBits,
    /// The server must close the connection when an unmasked frame is received.
    #[error("Received an unmasked frame from client")]
    UnmaskedFrameFromClient,
    /// The client must close the connection when a masked frame is received.
    #[error("Received a masked frame from server")]
    MaskedFrameFromServer,
    /// Control frames must not be fragmented.
    #[error("Fragmented control frame")]
    FragmentedControlFrame,
    /// Control frames must have a payload of 125 bytes or less.
    #[error("Control frame too big (payload must be 125 bytes or less)")]
    ControlFrameTooBig,
    /// Type of control frame not recognised.
    #[error("Unknown control frame type: {0}")]
    UnknownControlFrameType(u8),
    /// Type of data frame not recognised.
    #[error("Unknown data frame type: {0}")]
    UnknownDataFrameType(u8),
    /// Received a continue frame despite there being nothing to continue.
    #[error("Continue frame but nothing to continue")]
    UnexpectedContinueFrame,
    /// Received data while waiting for more fragments.
    #[error("While waiting for more fragments received: {0}")]
    ExpectedFragment(Data),
    /// The payload for the closing frame is invalid.
    #[error("Invalid close sequence")]
    InvalidCloseSequence,
    /// A handshake header value contained invalid UTF-8.
    #[error("Invalid UTF-8 sequence")]
    InvalidUtf8,
}

/// Indicates the specific type/cause of URL error.
#[derive(Debug, PartialEq, Eq, Clone, thiserror::Error)]
pub enum UrlError {
    /// The URL does not parse.
    #[error("URL parse error: {0}")]
    Parse(#[from] url::ParseError),
    /// The URL scheme is not `ws` or `wss`.
    #[error("URL scheme not supported")]
    UnsupportedScheme,
    /// No host name in the URL.
    #[error("No host name in the URL")]
    NoHostName,
    /// Failed to connect with this URL.
    #[error("Unable to connect to {0}")]
    UnableToConnect(String),
    /// The URL requires TLS but the `tls` feature is not enabled.
    #[error("TLS support not compiled in")]
    TlsFeatureNotEnabled,
}
