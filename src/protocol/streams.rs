//! Lazy byte-sequence adapters for fragmented binary messages.
//!
//! An [`InStream`] delivers an incoming fragmented binary message to the
//! consumer as a finite byte sequence that ends when the final fragment
//! arrives. An [`OutStream`] accepts writes and emits outgoing binary
//! fragments, buffering until the fragmentation threshold is crossed.
//!
//! Both borrow the [`Connection`] exclusively for their lifetime, so a
//! second concurrent send or a `recv()` racing a stream read cannot be
//! expressed at all.

use std::fmt;
use std::io::{self, Read, Write};
use std::mem;

use bytes::{Buf, Bytes};
use log::*;

use crate::error::Result;
use crate::protocol::Connection;

/// An incoming fragmented binary message, readable as a finite byte stream.
///
/// Returned inside [`Event::Binary`](crate::Event::Binary). Reading pulls
/// continuation fragments from the transport lazily; `Ok(0)` marks the end
/// of the message. Interleaved control frames are handled transparently
/// (pings are answered, pongs surface from the next `recv()` call).
///
/// Dropping the stream early abandons the message; the connection drains
/// the remaining fragments on subsequent `recv()` calls.
pub struct InStream<'a, Stream: Read + Write> {
    conn: &'a mut Connection<Stream>,
    chunk: Bytes,
    ended: bool,
}

impl<'a, Stream: Read + Write> InStream<'a, Stream> {
    pub(crate) fn new(conn: &'a mut Connection<Stream>, chunk: Bytes, fin: bool) -> Self {
        InStream { conn, chunk, ended: fin }
    }
}

impl<Stream: Read + Write> Read for InStream<'_, Stream> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if !self.chunk.is_empty() {
                let n = self.chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&self.chunk[..n]);
                self.chunk.advance(n);
                return Ok(n);
            }
            if self.ended {
                return Ok(0);
            }
            match self.conn.next_binary_chunk() {
                // a fragment may legitimately be empty, hence the loop
                Ok(Some(chunk)) => self.chunk = chunk,
                Ok(None) => {
                    self.ended = true;
                    return Ok(0);
                }
                Err(err) => return Err(io::Error::new(io::ErrorKind::Other, err)),
            }
        }
    }
}

impl<Stream: Read + Write> fmt::Debug for InStream<'_, Stream> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InStream")
            .field("buffered", &self.chunk.len())
            .field("ended", &self.ended)
            .finish()
    }
}

/// One outgoing fragmented binary message.
///
/// Returned by [`Connection::begin_binary`](crate::Connection::begin_binary).
/// Writes accumulate in an internal buffer; once the buffer reaches the
/// configured fragmentation threshold it is emitted as a non-final fragment.
/// [`finish`](OutStream::finish) emits the final fragment, which may be
/// empty.
///
/// If the connection is no longer open when the stream finishes, the
/// buffered bytes are dropped silently. An unfinished stream that already
/// put fragments on the wire is terminated with an empty final fragment on
/// drop, so the peer is not left waiting mid-message.
pub struct OutStream<'a, Stream: Read + Write> {
    conn: &'a mut Connection<Stream>,
    buffer: Vec<u8>,
    threshold: usize,
    fragments_sent: bool,
    finished: bool,
}

impl<'a, Stream: Read + Write> OutStream<'a, Stream> {
    pub(crate) fn new(conn: &'a mut Connection<Stream>, threshold: usize) -> Self {
        OutStream { conn, buffer: Vec::new(), threshold, fragments_sent: false, finished: false }
    }

    /// Emit everything buffered so far as one fragment.
    fn emit(&mut self, fin: bool) -> Result<()> {
        let first = !self.fragments_sent;
        self.fragments_sent = true;
        let data = mem::take(&mut self.buffer);
        self.conn.write_fragment(first, fin, &data)
    }

    /// Send the final fragment and release the connection.
    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        if !self.conn.is_open() {
            debug!("binary stream finished on a connection that is not open, dropping bytes");
            self.buffer.clear();
            return Ok(());
        }
        self.emit(true)
    }
}

impl<Stream: Read + Write> Write for OutStream<'_, Stream> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.conn.is_open() {
            self.buffer.clear();
            return Ok(buf.len());
        }
        self.buffer.extend_from_slice(buf);
        if self.buffer.len() >= self.threshold {
            self.emit(false)
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // fragments below the threshold wait for finish(); only push what
        // was already framed down the transport
        self.conn.socket.flush()
    }
}

impl<Stream: Read + Write> Drop for OutStream<'_, Stream> {
    fn drop(&mut self) {
        if !self.finished && self.fragments_sent && self.conn.is_open() {
            // don't leave the peer waiting mid-message
            if let Err(err) = self.emit(true) {
                warn!("failed to terminate abandoned binary stream: {err}");
            }
        }
    }
}

impl<Stream: Read + Write> fmt::Debug for OutStream<'_, Stream> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutStream")
            .field("buffered", &self.buffer.len())
            .field("threshold", &self.threshold)
            .field("fragments_sent", &self.fragments_sent)
            .finish()
    }
}
