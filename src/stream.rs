//! The transport stream, either plain TCP or TLS.

use std::io::{Read, Result as IoResult, Write};
use std::net::TcpStream;

#[cfg(feature = "tls")]
use native_tls::TlsStream;

/// Stream, either plain TCP or TLS.
#[derive(Debug)]
pub enum Stream {
    /// Unencrypted socket.
    Plain(TcpStream),
    /// Encrypted socket.
    #[cfg(feature = "tls")]
    Tls(TlsStream<TcpStream>),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        match self {
            Stream::Plain(s) => s.read(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        match self {
            Stream::Plain(s) => s.write(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> IoResult<()> {
        match self {
            Stream::Plain(s) => s.flush(),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.flush(),
        }
    }
}
