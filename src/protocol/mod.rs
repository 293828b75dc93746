//! Generic WebSocket connection state machine.

pub mod frame;
pub mod streams;

mod message;

pub use self::frame::CloseFrame;
pub use self::message::Message;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{Read, Write};

use bytes::{Bytes, BytesMut};
use log::*;

use self::frame::coding::{CloseCode, Control as OpCtl, Data as OpData, OpCode};
use self::frame::{Frame, FrameCodec};
use self::streams::{InStream, OutStream};
use crate::error::{CapacityError, Error, ProtocolError, Result};
use crate::handshake::client::{self, Request};
use crate::handshake::server::{self, SubprotocolPolicy};
use crate::handshake::{derive_accept_key, generate_key, Handshaken};

/// Read chunk size while accumulating the HTTP upgrade head.
const HANDSHAKE_READ: usize = 4096;

/// Indicates a Client or Server role of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This side is a server.
    Server,
    /// This side is a client.
    Client,
}

/// The lifecycle state of a [`Connection`].
///
/// States only ever advance: `Connecting` → `Open` → `Closing` → `Closed`,
/// or straight to `Closed` when the transport is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    /// The opening handshake is in progress.
    Connecting = 0,
    /// The connection is established and data can flow.
    Open = 1,
    /// We sent a close frame and await the peer's reply.
    Closing = 2,
    /// The connection is down.
    Closed = 3,
}

/// The configuration for a WebSocket connection.
///
/// # Example
/// ```
/// # use scheelite::ConnectionConfig;
/// let conf = ConnectionConfig::default()
///     .binary_fragmentation(64 * 1024)
///     .max_buffer_len(1024 * 1024);
/// ```
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct ConnectionConfig {
    /// Threshold in bytes at which an [`OutStream`] emits a fragment.
    /// The default value is 512 KiB.
    pub binary_fragmentation: usize,
    /// Cap on the receive buffer, applied both to a single incoming frame
    /// (and assembled text message) and to the HTTP upgrade head. A frame
    /// over the cap closes the connection with code 1009; an oversized
    /// upgrade head is rejected. The default value is 2 MiB.
    pub max_buffer_len: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { binary_fragmentation: 512 * 1024, max_buffer_len: 2 * 1024 * 1024 }
    }
}

impl ConnectionConfig {
    /// Set [`Self::binary_fragmentation`].
    pub fn binary_fragmentation(mut self, binary_fragmentation: usize) -> Self {
        self.binary_fragmentation = binary_fragmentation;
        self
    }

    /// Set [`Self::max_buffer_len`].
    pub fn max_buffer_len(mut self, max_buffer_len: usize) -> Self {
        self.max_buffer_len = max_buffer_len;
        self
    }
}

/// An event produced by [`Connection::recv`].
///
/// `Open` arrives exactly once, before any data event. `Close` arrives at
/// most once; after it, `recv` returns [`Error::AlreadyClosed`]. A close
/// initiated locally via [`Connection::close`] is not reported again as an
/// event: the call itself is the notification, and `recv` drives the close
/// handshake to [`Error::ConnectionClosed`].
pub enum Event<'a, Stream: Read + Write> {
    /// The opening handshake completed.
    Open,
    /// A complete text message arrived.
    Text(String),
    /// A binary message started to arrive; read it from the stream.
    Binary(InStream<'a, Stream>),
    /// The peer answered a ping of ours.
    Pong(String),
    /// The connection closed: either the peer sent a close frame, a
    /// protocol/capacity violation forced a local close (codes 1002/1009),
    /// or the transport was lost (code 1006).
    Close(CloseFrame),
}

impl<Stream: Read + Write> fmt::Debug for Event<'_, Stream> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Open => f.write_str("Open"),
            Event::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Event::Binary(stream) => f.debug_tuple("Binary").field(stream).finish(),
            Event::Pong(data) => f.debug_tuple("Pong").field(data).finish(),
            Event::Close(frame) => f.debug_tuple("Close").field(frame).finish(),
        }
    }
}

/// Receive-side assembly slot for a fragmented message.
#[derive(Debug)]
enum Assembly {
    /// Accumulated text fragments, validated as one string when complete.
    Text(BytesMut),
    /// A fragmented binary message is in flight; its payload goes through
    /// the [`InStream`] (or is drained if the stream was dropped).
    Binary,
}

/// Handshake-in-progress state, present while `Connecting`.
#[derive(Debug)]
enum Handshake {
    Client { accept_key: String, buf: BytesMut },
    Server { policy: SubprotocolPolicy, buf: BytesMut },
}

/// Owned precursor of [`Event`], so the borrow for `Event::Binary` is only
/// taken once a frame actually produced an event.
enum Emit {
    Text(String),
    BinaryStart { chunk: Bytes, fin: bool },
    BinaryChunk { chunk: Bytes },
    Pong(String),
    Close(CloseFrame),
}

/// A WebSocket connection over a generic blocking byte stream.
///
/// One per live peer. All state transitions happen inside `&mut self`
/// methods, so a connection pinned to one thread needs no further
/// synchronization and no operation is re-entrant.
#[derive(Debug)]
pub struct Connection<Stream> {
    /// The underlying transport.
    pub(crate) socket: Stream,
    role: Role,
    state: ReadyState,
    /// Encoder/decoder of frames, owns the receive buffer.
    codec: FrameCodec,
    config: ConnectionConfig,
    /// Receive: the fragmented message being assembled, if any.
    assembly: Option<Assembly>,
    /// Present while the opening handshake is incomplete.
    handshake: Option<Handshake>,
    /// Headers of the peer's handshake message, lowercased names.
    headers: HashMap<String, String>,
    /// Request target: requested (client) or parsed from the request line (server).
    path: String,
    /// The `Sec-WebSocket-Key` nonce: generated (client) or echoed (server).
    key: String,
    /// The negotiated subprotocol, if any.
    protocol: Option<String>,
    /// Subprotocols offered by the client.
    protocols: Vec<String>,
    /// Pongs observed while an `InStream` was draining fragments.
    deferred_pongs: VecDeque<String>,
    /// A close event waiting to be delivered by the next `recv`.
    pending_close: Option<CloseFrame>,
    /// The one-per-lifetime close notification went out.
    close_delivered: bool,
    /// Server registry slot, freed on drop.
    pub(crate) registration: Option<crate::server::Registration>,
}

impl<Stream: Read + Write> Connection<Stream> {
    /// Initiate a client connection over an established transport.
    ///
    /// The HTTP upgrade request is written immediately; the connection is
    /// left `Connecting` and the first [`recv`](Self::recv) validates the
    /// server's reply, yielding [`Event::Open`].
    pub fn client(
        mut socket: Stream,
        request: Request,
        config: Option<ConnectionConfig>,
    ) -> Result<Self> {
        let key = generate_key();
        client::write_request(&mut socket, &request, &key)?;
        socket.flush()?;
        debug!("client handshake request sent for {}", request.path);
        let accept_key = derive_accept_key(key.as_bytes());
        Ok(Connection {
            socket,
            role: Role::Client,
            state: ReadyState::Connecting,
            codec: FrameCodec::new(),
            config: config.unwrap_or_default(),
            assembly: None,
            handshake: Some(Handshake::Client { accept_key, buf: BytesMut::new() }),
            headers: HashMap::new(),
            path: request.path,
            key,
            protocol: None,
            protocols: request.protocols,
            deferred_pongs: VecDeque::new(),
            pending_close: None,
            close_delivered: false,
            registration: None,
        })
    }

    /// Accept a server connection over an established transport.
    ///
    /// Nothing is read yet; the first [`recv`](Self::recv) parses and
    /// answers the client's upgrade request, yielding [`Event::Open`].
    pub fn server(
        socket: Stream,
        policy: SubprotocolPolicy,
        config: Option<ConnectionConfig>,
    ) -> Self {
        Connection {
            socket,
            role: Role::Server,
            state: ReadyState::Connecting,
            codec: FrameCodec::new(),
            config: config.unwrap_or_default(),
            assembly: None,
            handshake: Some(Handshake::Server { policy, buf: BytesMut::new() }),
            headers: HashMap::new(),
            path: String::new(),
            key: String::new(),
            protocol: None,
            protocols: Vec::new(),
            deferred_pongs: VecDeque::new(),
            pending_close: None,
            close_delivered: false,
            registration: None,
        }
    }

    /// Convert a raw socket into a WebSocket connection without performing a
    /// handshake. Use this when another HTTP layer already performed the
    /// upgrade. The connection starts `Open` and emits no `Open` event.
    pub fn from_raw_socket(socket: Stream, role: Role, config: Option<ConnectionConfig>) -> Self {
        Self::from_partially_read(socket, Vec::new(), role, config)
    }

    /// Like [`from_raw_socket`](Self::from_raw_socket), with bytes that were
    /// already read off the transport by the upgrade layer.
    pub fn from_partially_read(
        socket: Stream,
        part: Vec<u8>,
        role: Role,
        config: Option<ConnectionConfig>,
    ) -> Self {
        Connection {
            socket,
            role,
            state: ReadyState::Open,
            codec: FrameCodec::from_partially_read(part),
            config: config.unwrap_or_default(),
            assembly: None,
            handshake: None,
            headers: HashMap::new(),
            path: String::new(),
            key: String::new(),
            protocol: None,
            protocols: Vec::new(),
            deferred_pongs: VecDeque::new(),
            pending_close: None,
            close_delivered: false,
            registration: None,
        }
    }
}

impl<Stream> Connection<Stream> {
    /// Returns a shared reference to the inner stream.
    pub fn get_ref(&self) -> &Stream {
        &self.socket
    }

    /// Returns a mutable reference to the inner stream.
    pub fn get_mut(&mut self) -> &mut Stream {
        &mut self.socket
    }

    /// Which side of the connection this is.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The current lifecycle state.
    pub fn ready_state(&self) -> ReadyState {
        self.state
    }

    /// Headers of the peer's handshake message, keyed by lowercased name.
    /// Empty until the handshake completed.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// The request target of the upgrade request.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The `Sec-WebSocket-Key` nonce of this connection.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The negotiated subprotocol, if any.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// The subprotocols the client offered.
    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    /// Read the configuration.
    pub fn get_config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Change the configuration.
    pub fn set_config(&mut self, set_func: impl FnOnce(&mut ConnectionConfig)) {
        set_func(&mut self.config);
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state == ReadyState::Open
    }
}

impl<Stream: Read + Write> Connection<Stream> {
    /// Receive the next event from the peer, blocking until one is
    /// available.
    ///
    /// Pings are answered internally and produce no event. After the single
    /// [`Event::Close`] of a connection's lifetime, this returns
    /// [`Error::AlreadyClosed`]. After a close initiated locally with
    /// [`close`](Self::close), this drives the close handshake and returns
    /// [`Error::ConnectionClosed`] once the peer confirmed.
    pub fn recv(&mut self) -> Result<Event<'_, Stream>> {
        let emit = loop {
            if let Some(pong) = self.deferred_pongs.pop_front() {
                break Emit::Pong(pong);
            }
            if let Some(close) = self.pending_close.take() {
                self.close_delivered = true;
                break Emit::Close(close);
            }
            if self.close_delivered {
                return Err(Error::AlreadyClosed);
            }
            match self.state {
                ReadyState::Connecting => {
                    if self.finish_handshake()? {
                        debug!("connection open");
                        return Ok(Event::Open);
                    }
                    // transport lost mid-handshake: the 1006 close is pending
                }
                ReadyState::Closed => {
                    // close() was called locally; its return was the notification
                    self.close_delivered = true;
                    return Err(Error::ConnectionClosed);
                }
                ReadyState::Open | ReadyState::Closing => match self.step()? {
                    // a fragment of an abandoned InStream, drain it
                    Some(Emit::BinaryChunk { .. }) => {}
                    Some(emit) => break emit,
                    None => {}
                },
            }
        };
        Ok(match emit {
            Emit::Text(text) => Event::Text(text),
            Emit::Pong(data) => Event::Pong(data),
            Emit::Close(frame) => Event::Close(frame),
            Emit::BinaryStart { chunk, fin } => Event::Binary(InStream::new(self, chunk, fin)),
            Emit::BinaryChunk { .. } => unreachable!("Bug: binary chunk outside stream read"),
        })
    }

    /// Send a text message. The connection must be `Open`.
    pub fn send_text(&mut self, text: &str) -> Result<()> {
        self.check_open()?;
        self.send_frame(Frame::message(
            Bytes::copy_from_slice(text.as_bytes()),
            OpCode::Data(OpData::Text),
            true,
        ))
    }

    /// Send a binary message as a single frame. The connection must be
    /// `Open`. For a streamed, fragmented send use
    /// [`begin_binary`](Self::begin_binary).
    pub fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        self.check_open()?;
        self.send_frame(Frame::message(
            Bytes::copy_from_slice(data),
            OpCode::Data(OpData::Binary),
            true,
        ))
    }

    /// Send a message, dispatching on its type.
    pub fn send(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Text(text) => self.send_text(&text),
            Message::Binary(data) => self.send_binary(&data),
        }
    }

    /// Send a ping frame. The peer will answer with a pong carrying the
    /// same payload, surfaced as [`Event::Pong`].
    pub fn send_ping(&mut self, data: &[u8]) -> Result<()> {
        self.check_open()?;
        self.send_frame(Frame::ping(Bytes::copy_from_slice(data)))
    }

    /// Start a streamed binary message.
    ///
    /// The returned [`OutStream`] borrows the connection exclusively until
    /// it is finished or dropped, so a second in-flight send cannot exist.
    pub fn begin_binary(&mut self) -> Result<OutStream<'_, Stream>> {
        self.check_open()?;
        let threshold = self.config.binary_fragmentation;
        Ok(OutStream::new(self, threshold))
    }

    /// Close the connection.
    ///
    /// While `Open`, this sends a close frame and moves to `Closing`; keep
    /// calling [`recv`](Self::recv) to drive the close handshake until it
    /// returns [`Error::ConnectionClosed`]. In any other non-`Closed` state
    /// the connection is torn down immediately. This call is the local close
    /// notification; no additional `Close` event follows.
    pub fn close(&mut self, close: Option<CloseFrame>) -> Result<()> {
        match self.state {
            ReadyState::Open => {
                debug!("closing connection: {close:?}");
                self.send_frame(Frame::close(close))?;
                self.state = ReadyState::Closing;
                Ok(())
            }
            ReadyState::Closed => Ok(()),
            _ => {
                // Connecting or Closing: give up on the transport
                self.state = ReadyState::Closed;
                self.assembly = None;
                self.handshake = None;
                let _ = self.socket.flush();
                Ok(())
            }
        }
    }

    /// Emit one binary fragment; used by [`OutStream`].
    pub(crate) fn write_fragment(&mut self, first: bool, fin: bool, data: &[u8]) -> Result<()> {
        let opcode = OpCode::Data(if first { OpData::Binary } else { OpData::Continue });
        self.send_frame(Frame::message(Bytes::copy_from_slice(data), opcode, fin))
    }

    /// Pull the next fragment of the binary message being assembled; used by
    /// [`InStream`]. Returns `None` once the message is complete or the
    /// connection went down (in which case the close event is left pending).
    pub(crate) fn next_binary_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.assembly.is_none() {
                return Ok(None);
            }
            match self.step() {
                Ok(Some(Emit::BinaryChunk { chunk })) => return Ok(Some(chunk)),
                Ok(Some(Emit::Pong(data))) => self.deferred_pongs.push_back(data),
                Ok(Some(Emit::Close(frame))) => {
                    self.assembly = None;
                    self.pending_close = Some(frame);
                    return Ok(None);
                }
                Ok(Some(Emit::Text(_)) | Some(Emit::BinaryStart { .. })) => {
                    unreachable!("Bug: data message started during assembly")
                }
                Ok(None) => {}
                Err(err) => {
                    self.assembly = None;
                    return Err(err);
                }
            }
        }
    }

    fn check_open(&self) -> Result<()> {
        match self.state {
            ReadyState::Open => Ok(()),
            _ => Err(Error::Protocol(ProtocolError::SendWhileNotOpen)),
        }
    }

    /// Mask the frame if our role requires it. Masking happens into a copy
    /// at write time; the caller's payload is never mutated.
    fn masked(&self, mut frame: Frame) -> Frame {
        if self.role == Role::Client {
            // The client MUST mask all frames sent to the server. (RFC 6455)
            frame.set_random_mask();
        }
        frame
    }

    fn send_frame(&mut self, frame: Frame) -> Result<()> {
        let frame = self.masked(frame);
        self.codec.buffer_frame(frame);
        self.codec.write_out_buffer(&mut self.socket)?;
        self.socket.flush()?;
        Ok(())
    }

    /// Read and process one frame. `Ok(None)` means the frame produced no
    /// event (a ping, or a mid-message fragment of an abandoned stream).
    fn step(&mut self) -> Result<Option<Emit>> {
        let frame =
            match self.codec.read_frame(&mut self.socket, self.config.max_buffer_len, self.role) {
                Ok(frame) => frame,
                Err(err) => return self.fail_connection(err).map(Some),
            };
        match frame {
            Some(frame) => self.process_frame(frame),
            None => match self.state {
                ReadyState::Closing => {
                    // the peer dropped the transport instead of answering our
                    // close frame; the close() call already notified locally
                    trace!("transport ended while closing");
                    self.state = ReadyState::Closed;
                    self.close_delivered = true;
                    Err(Error::ConnectionClosed)
                }
                _ => {
                    warn!("connection lost without closing handshake");
                    self.state = ReadyState::Closed;
                    self.assembly = None;
                    Ok(Some(Emit::Close(CloseFrame {
                        code: CloseCode::Abnormal,
                        reason: String::new(),
                    })))
                }
            },
        }
    }

    /// Dispatch on the frame's opcode, upholding the control-frame and
    /// fragmentation rules.
    fn process_frame(&mut self, frame: Frame) -> Result<Option<Emit>> {
        let hdr = *frame.header();

        // MUST be 0 unless an extension is negotiated that defines meanings
        // for non-zero values. (RFC 6455)
        if hdr.rsv1 || hdr.rsv2 || hdr.rsv3 {
            return self
                .fail_connection(Error::Protocol(ProtocolError::NonZeroReservedBits))
                .map(Some);
        }

        match hdr.opcode {
            OpCode::Control(ctl) => {
                // All control frames MUST have a payload length of 125 bytes
                // or less and MUST NOT be fragmented. (RFC 6455)
                if !hdr.is_final {
                    return self
                        .fail_connection(Error::Protocol(ProtocolError::FragmentedControlFrame))
                        .map(Some);
                }
                if frame.payload().len() > 125 {
                    return self
                        .fail_connection(Error::Protocol(ProtocolError::ControlFrameTooBig))
                        .map(Some);
                }
                match ctl {
                    OpCtl::Close => self.process_close(frame),
                    OpCtl::Reserved(i) => self
                        .fail_connection(Error::Protocol(ProtocolError::UnknownControlFrameType(i)))
                        .map(Some),
                    OpCtl::Ping => {
                        if self.state == ReadyState::Open {
                            trace!("answering ping with pong");
                            let pong = self.masked(Frame::pong(frame.into_payload()));
                            self.codec.buffer_frame(pong);
                            self.codec.write_out_buffer(&mut self.socket)?;
                            self.socket.flush()?;
                        }
                        // pings raise no event
                        Ok(None)
                    }
                    OpCtl::Pong => Ok(Some(Emit::Pong(
                        String::from_utf8_lossy(frame.payload()).into_owned(),
                    ))),
                }
            }

            OpCode::Data(data) => {
                let fin = hdr.is_final;
                match data {
                    OpData::Continue => match self.assembly.take() {
                        None => self
                            .fail_connection(Error::Protocol(ProtocolError::UnexpectedContinueFrame))
                            .map(Some),
                        Some(Assembly::Text(mut buf)) => {
                            let max = self.config.max_buffer_len;
                            if buf.len() + frame.payload().len() > max {
                                return self
                                    .fail_connection(Error::Capacity(
                                        CapacityError::MessageTooLong {
                                            size: buf.len().saturating_add(frame.payload().len()),
                                            max,
                                        },
                                    ))
                                    .map(Some);
                            }
                            buf.extend_from_slice(frame.payload());
                            if fin {
                                Ok(Some(Emit::Text(String::from_utf8_lossy(&buf).into_owned())))
                            } else {
                                self.assembly = Some(Assembly::Text(buf));
                                Ok(None)
                            }
                        }
                        Some(Assembly::Binary) => {
                            if !fin {
                                self.assembly = Some(Assembly::Binary);
                            }
                            Ok(Some(Emit::BinaryChunk { chunk: frame.into_payload() }))
                        }
                    },
                    _ if self.assembly.is_some() => self
                        .fail_connection(Error::Protocol(ProtocolError::ExpectedFragment(data)))
                        .map(Some),
                    OpData::Text => {
                        if fin {
                            Ok(Some(Emit::Text(
                                String::from_utf8_lossy(frame.payload()).into_owned(),
                            )))
                        } else {
                            self.assembly =
                                Some(Assembly::Text(BytesMut::from(frame.payload())));
                            Ok(None)
                        }
                    }
                    OpData::Binary => {
                        if !fin {
                            self.assembly = Some(Assembly::Binary);
                        }
                        Ok(Some(Emit::BinaryStart { chunk: frame.into_payload(), fin }))
                    }
                    OpData::Reserved(i) => self
                        .fail_connection(Error::Protocol(ProtocolError::UnknownDataFrameType(i)))
                        .map(Some),
                }
            }
        }
    }

    /// Handle a received close frame.
    fn process_close(&mut self, frame: Frame) -> Result<Option<Emit>> {
        let close = match frame.into_close() {
            Ok(close) => close,
            Err(err) => return self.fail_connection(err).map(Some),
        };
        match self.state {
            ReadyState::Closing => {
                // the peer acknowledged our close
                debug!("close handshake complete: {close:?}");
                self.state = ReadyState::Closed;
                self.assembly = None;
                self.close_delivered = true;
                Err(Error::ConnectionClosed)
            }
            ReadyState::Open => {
                debug!("received close frame: {close:?}");
                let event = close.clone().unwrap_or(CloseFrame {
                    code: CloseCode::Status,
                    reason: String::new(),
                });
                // echo the close frame before surfacing the event
                let reply = self.masked(Frame::close(close));
                self.codec.buffer_frame(reply);
                self.codec.write_out_buffer(&mut self.socket)?;
                self.socket.flush()?;
                self.state = ReadyState::Closed;
                self.assembly = None;
                Ok(Some(Emit::Close(event)))
            }
            _ => Ok(None),
        }
    }

    /// Turn a receive-path failure into the close it mandates: protocol
    /// violations close with 1002, capacity violations with 1009, and
    /// transport errors propagate with an abnormal close (1006) left
    /// pending for the next `recv`.
    fn fail_connection(&mut self, err: Error) -> Result<Emit> {
        match &err {
            Error::Protocol(e) => {
                warn!("protocol violation: {e}");
                Ok(Emit::Close(self.abort_with(CloseCode::Protocol)))
            }
            Error::Capacity(e) => {
                warn!("capacity exceeded: {e}");
                Ok(Emit::Close(self.abort_with(CloseCode::Size)))
            }
            _ => {
                if self.state != ReadyState::Closed {
                    self.state = ReadyState::Closed;
                    self.assembly = None;
                    self.pending_close =
                        Some(CloseFrame { code: CloseCode::Abnormal, reason: String::new() });
                }
                Err(err)
            }
        }
    }

    /// Send a close frame with the given code (best effort) and tear the
    /// connection down.
    fn abort_with(&mut self, code: CloseCode) -> CloseFrame {
        let close = CloseFrame { code, reason: String::new() };
        if matches!(self.state, ReadyState::Open | ReadyState::Closing) {
            let frame = self.masked(Frame::close(Some(close.clone())));
            self.codec.buffer_frame(frame);
            if let Err(err) = self.codec.write_out_buffer(&mut self.socket) {
                debug!("could not send close frame: {err}");
            }
            let _ = self.socket.flush();
        }
        self.state = ReadyState::Closed;
        self.assembly = None;
        close
    }

    /// Drive the opening handshake. Returns `true` once open, `false` if
    /// the transport was lost first (the 1006 close is left pending).
    fn finish_handshake(&mut self) -> Result<bool> {
        loop {
            let parsed = match &self.handshake {
                Some(Handshake::Client { accept_key, buf }) => {
                    client::parse_response(buf, accept_key, &self.protocols)
                }
                Some(Handshake::Server { policy, buf }) => server::parse_request(buf, policy),
                None => unreachable!("Bug: connecting without handshake state"),
            };
            let complete = match parsed {
                Ok(complete) => complete,
                Err(err) => return Err(self.fail_handshake(err)),
            };

            if let Some((size, outcome)) = complete {
                self.accept_handshake(size, outcome)?;
                return Ok(true);
            }

            // no complete HTTP head yet, read more
            let max = self.config.max_buffer_len;
            let buf = match self.handshake.as_mut().expect("Bug: handshake state vanished") {
                Handshake::Client { buf, .. } | Handshake::Server { buf, .. } => buf,
            };
            if buf.len() > max {
                let size = buf.len();
                let err = Error::Capacity(CapacityError::HandshakeTooLong { size, max });
                return Err(self.fail_handshake(err));
            }
            let len = buf.len();
            buf.resize(len + HANDSHAKE_READ, 0);
            let read = self.socket.read(&mut buf[len..]);
            let n = match read {
                Ok(n) => n,
                Err(err) => {
                    buf.truncate(len);
                    return Err(self.fail_handshake(err.into()));
                }
            };
            buf.truncate(len + n);
            if n == 0 {
                // transport lost before OPEN
                warn!("transport lost during handshake");
                self.state = ReadyState::Closed;
                self.handshake = None;
                self.pending_close =
                    Some(CloseFrame { code: CloseCode::Abnormal, reason: String::new() });
                return Ok(false);
            }
        }
    }

    /// Adopt the parsed handshake: record headers, answer it (server side),
    /// and feed any pipelined bytes to the frame codec.
    fn accept_handshake(&mut self, size: usize, outcome: Handshaken) -> Result<()> {
        let handshake = self.handshake.take().expect("Bug: handshake state vanished");
        let buf = match handshake {
            Handshake::Client { buf, .. } | Handshake::Server { buf, .. } => buf,
        };
        self.codec = FrameCodec::from_partially_read(buf[size..].to_vec());
        self.headers = outcome.headers;
        self.protocol = outcome.protocol;
        if let Some(path) = outcome.path {
            self.path = path;
        }
        if let Some(key) = outcome.key {
            self.key = key;
        }
        if !outcome.protocols.is_empty() {
            self.protocols = outcome.protocols;
        }
        if self.role == Role::Server {
            let response = server::accept_response(&self.key, self.protocol.as_deref());
            self.socket.write_all(&response)?;
            self.socket.flush()?;
        }
        self.state = ReadyState::Open;
        Ok(())
    }

    /// Reject the handshake: answer 400 (server side), tear down, and hand
    /// the underlying error back to the caller.
    fn fail_handshake(&mut self, err: Error) -> Error {
        warn!("handshake failed: {err}");
        if self.role == Role::Server {
            let _ = self.socket.write_all(server::BAD_REQUEST);
        }
        let _ = self.socket.flush();
        self.state = ReadyState::Closed;
        self.handshake = None;
        self.close_delivered = true;
        err
    }
}
