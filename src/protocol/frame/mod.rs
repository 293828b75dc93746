//! Utilities to work with raw WebSocket frames.

pub mod coding;

pub(crate) mod mask;

use std::fmt;
use std::io::{Cursor, Error as IoError, ErrorKind as IoErrorKind, Read, Write};

use byteorder::{ByteOrder, NetworkEndian, WriteBytesExt};
use bytes::{Buf, Bytes, BytesMut};
use log::*;

use self::coding::{CloseCode, Control, OpCode};
use self::mask::{apply_mask, generate_mask};
use crate::error::{CapacityError, Error, ProtocolError, Result};
use crate::protocol::Role;

/// Read chunk size for the receive buffer when no frame header is pending.
const MIN_READ: usize = 4096;

/// A struct representing the close command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// The reason as a code.
    pub code: CloseCode,
    /// The reason as text string.
    pub reason: String,
}

impl fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.reason, self.code)
    }
}

/// A struct representing a WebSocket frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Indicates that the frame is the last one of a possibly fragmented message.
    pub is_final: bool,
    /// Reserved for protocol extensions.
    pub rsv1: bool,
    /// Reserved for protocol extensions.
    pub rsv2: bool,
    /// Reserved for protocol extensions.
    pub rsv3: bool,
    /// WebSocket protocol opcode.
    pub opcode: OpCode,
    /// A frame mask, if any.
    pub mask: Option<[u8; 4]>,
}

impl Default for FrameHeader {
    fn default() -> Self {
        FrameHeader {
            is_final: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode: OpCode::Control(Control::Close),
            mask: None,
        }
    }
}

impl FrameHeader {
    /// Parse a header from the cursor, along with the announced payload
    /// length. Returns `None` and leaves the cursor untouched if the buffer
    /// does not yet hold a complete header.
    ///
    /// Payload lengths are handled as native 64-bit integers for the whole
    /// value range (lengths announced above 2^53 are not a special case).
    pub fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Option<(Self, u64)>> {
        let initial = cursor.position();
        let ret = Self::parse_internal(cursor);
        if !matches!(ret, Ok(Some(_))) {
            cursor.set_position(initial);
        }
        ret
    }

    fn parse_internal(cursor: &mut Cursor<&[u8]>) -> Result<Option<(Self, u64)>> {
        let mut head = [0u8; 2];
        if cursor.read(&mut head)? != 2 {
            return Ok(None);
        }

        trace!("parsed headers {head:?}");

        let first = head[0];
        let second = head[1];

        let is_final = first & 0x80 != 0;
        let rsv1 = first & 0x40 != 0;
        let rsv2 = first & 0x20 != 0;
        let rsv3 = first & 0x10 != 0;
        let opcode = OpCode::from(first & 0x0F);
        let masked = second & 0x80 != 0;

        let length = match second & 0x7F {
            126 => {
                let mut bytes = [0u8; 2];
                if cursor.read(&mut bytes)? != 2 {
                    return Ok(None);
                }
                u64::from(NetworkEndian::read_u16(&bytes))
            }
            127 => {
                let mut bytes = [0u8; 8];
                if cursor.read(&mut bytes)? != 8 {
                    return Ok(None);
                }
                NetworkEndian::read_u64(&bytes)
            }
            len => u64::from(len),
        };

        let mask = if masked {
            let mut mask_bytes = [0u8; 4];
            if cursor.read(&mut mask_bytes)? != 4 {
                return Ok(None);
            }
            Some(mask_bytes)
        } else {
            None
        };

        let header = FrameHeader { is_final, rsv1, rsv2, rsv3, opcode, mask };
        Ok(Some((header, length)))
    }

    /// The number of bytes this header occupies on the wire for the given
    /// payload length.
    pub fn len(&self, length: u64) -> usize {
        let extended = match length {
            0..=125 => 0,
            126..=65535 => 2,
            _ => 8,
        };
        2 + extended + if self.mask.is_some() { 4 } else { 0 }
    }

    /// Write the header for a payload of the given length.
    pub fn format(&self, length: u64, output: &mut impl Write) -> Result<()> {
        let code: u8 = self.opcode.into();
        let one = code
            | if self.is_final { 0x80 } else { 0 }
            | if self.rsv1 { 0x40 } else { 0 }
            | if self.rsv2 { 0x20 } else { 0 }
            | if self.rsv3 { 0x10 } else { 0 };

        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };
        if length < 126 {
            output.write_all(&[one, mask_bit | length as u8])?;
        } else if length < 65536 {
            output.write_all(&[one, mask_bit | 126])?;
            output.write_u16::<NetworkEndian>(length as u16)?;
        } else {
            output.write_all(&[one, mask_bit | 127])?;
            output.write_u64::<NetworkEndian>(length)?;
        }

        if let Some(mask) = self.mask {
            output.write_all(&mask)?;
        }

        Ok(())
    }
}

/// A struct representing a WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: FrameHeader,
    payload: Bytes,
}

impl Frame {
    /// Get the length of the frame.
    /// This is the length of the header + the length of the payload.
    #[inline]
    pub fn len(&self) -> usize {
        self.header.len(self.payload.len() as u64) + self.payload.len()
    }

    /// Check if the frame is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a reference to the frame's header.
    #[inline]
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// Get a reference to the frame's payload.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Test whether the frame is masked.
    #[inline]
    pub(crate) fn is_masked(&self) -> bool {
        self.header.mask.is_some()
    }

    /// Generate a random mask for the frame.
    ///
    /// This just generates and stores the mask, the payload is masked while
    /// the frame is formatted onto the wire, into a copy. The stored payload
    /// is never mutated.
    #[inline]
    pub(crate) fn set_random_mask(&mut self) {
        self.header.mask = Some(generate_mask());
    }

    /// Consume the frame into its payload.
    #[inline]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Create a frame from a header and its payload.
    #[inline]
    pub fn from_payload(header: FrameHeader, payload: Bytes) -> Self {
        Frame { header, payload }
    }

    /// Consume the frame into a closing frame. An empty payload means no
    /// status code; a single-byte payload is malformed.
    #[inline]
    pub fn into_close(self) -> Result<Option<CloseFrame>> {
        match self.payload.len() {
            0 => Ok(None),
            1 => Err(Error::Protocol(ProtocolError::InvalidCloseSequence)),
            _ => {
                let code = NetworkEndian::read_u16(&self.payload[0..2]).into();
                let reason = String::from_utf8_lossy(&self.payload[2..]).into_owned();
                Ok(Some(CloseFrame { code, reason }))
            }
        }
    }

    /// Create a new data frame.
    #[inline]
    pub fn message(data: impl Into<Bytes>, opcode: OpCode, is_final: bool) -> Frame {
        debug_assert!(matches!(opcode, OpCode::Data(_)), "Invalid opcode for data frame.");
        Frame {
            header: FrameHeader { is_final, opcode, ..FrameHeader::default() },
            payload: data.into(),
        }
    }

    /// Create a new Ping control frame.
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Frame {
        Frame {
            header: FrameHeader { opcode: OpCode::Control(Control::Ping), ..FrameHeader::default() },
            payload: data.into(),
        }
    }

    /// Create a new Pong control frame.
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Frame {
        Frame {
            header: FrameHeader { opcode: OpCode::Control(Control::Pong), ..FrameHeader::default() },
            payload: data.into(),
        }
    }

    /// Create a new Close control frame. A `Status` (1005) code produces an
    /// empty payload, like the absence of a code.
    #[inline]
    pub fn close(msg: Option<CloseFrame>) -> Frame {
        let payload = match msg {
            Some(CloseFrame { code, reason }) if code != CloseCode::Status => {
                let mut p = Vec::with_capacity(reason.len() + 2);
                p.write_u16::<NetworkEndian>(code.into()).expect("Bug: can't write to vector");
                p.extend_from_slice(reason.as_bytes());
                p
            }
            _ => Vec::new(),
        };
        Frame { header: FrameHeader::default(), payload: payload.into() }
    }

    /// Write the whole frame into the buffer. A masked frame is masked while
    /// being copied; the frame's own payload is left untouched.
    pub(crate) fn format_into_buf(&self, buf: &mut Vec<u8>) {
        self.header
            .format(self.payload.len() as u64, buf)
            .expect("Bug: can't write to vector");
        match self.header.mask {
            Some(mask) => {
                let start = buf.len();
                buf.extend_from_slice(&self.payload);
                apply_mask(&mut buf[start..], mask);
            }
            None => buf.extend_from_slice(&self.payload),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<FRAME final: {} opcode: {} length: {} payload length: {}>",
            self.header.is_final,
            self.header.opcode,
            self.len(),
            self.payload.len(),
        )
    }
}

/// A codec for WebSocket frames: accumulates transport bytes into an input
/// buffer, extracts complete frames from it, and stages outgoing frames in
/// an output buffer.
#[derive(Debug)]
pub(crate) struct FrameCodec {
    /// Buffer to read data from the stream.
    in_buffer: BytesMut,
    /// Buffer to send packets to the network.
    out_buffer: Vec<u8>,
    /// Header and announced payload size of the incoming frame being processed.
    header: Option<(FrameHeader, u64)>,
}

impl FrameCodec {
    /// Create a new frame codec.
    pub(crate) fn new() -> Self {
        Self { in_buffer: BytesMut::with_capacity(MIN_READ), out_buffer: Vec::new(), header: None }
    }

    /// Create a new frame codec from partially read data.
    pub(crate) fn from_partially_read(part: Vec<u8>) -> Self {
        Self { in_buffer: BytesMut::from(&part[..]), out_buffer: Vec::new(), header: None }
    }

    /// Read a frame from the provided stream.
    ///
    /// Returns `Ok(None)` when the transport signals end-of-stream. The
    /// announced payload length is checked against `max_size` before any
    /// space is reserved, so an attacker announcing a huge frame does not
    /// cause an allocation. Masking discipline is enforced by `role`: a
    /// server unmasks every frame and rejects unmasked ones, a client
    /// rejects masked ones.
    pub(crate) fn read_frame(
        &mut self,
        stream: &mut impl Read,
        max_size: usize,
        role: Role,
    ) -> Result<Option<Frame>> {
        let mut payload = loop {
            if self.header.is_none() {
                let mut cursor = Cursor::new(&self.in_buffer[..]);
                if let Some((header, len)) = FrameHeader::parse(&mut cursor)? {
                    let advanced = cursor.position() as usize;
                    self.in_buffer.advance(advanced);
                    self.header = Some((header, len));
                }
            }

            if let Some((_, len)) = &self.header {
                // Enforce the cap before reserving space for the payload.
                if *len > max_size as u64 {
                    return Err(Error::Capacity(CapacityError::MessageTooLong {
                        size: usize::try_from(*len).unwrap_or(usize::MAX),
                        max: max_size,
                    }));
                }
                let len = *len as usize;
                if len <= self.in_buffer.len() {
                    break self.in_buffer.split_to(len);
                }
            }

            // Not enough data in the buffer.
            let needed = self
                .header
                .as_ref()
                .map(|(_, len)| (*len as usize).saturating_sub(self.in_buffer.len()))
                .unwrap_or(0)
                .max(MIN_READ);
            self.in_buffer.reserve(needed);
            if self.read_in(stream)? == 0 {
                trace!("no frame received");
                return Ok(None);
            }
        };

        let (mut header, length) = self.header.take().expect("Bug: no frame header");
        debug_assert_eq!(payload.len() as u64, length);

        // A server MUST remove masking for data frames received from a client
        // and MUST close the connection upon receiving an unmasked frame.
        // A client MUST close a connection if it detects a masked frame.
        // (RFC 6455)
        match role {
            Role::Server => match header.mask.take() {
                Some(mask) => apply_mask(&mut payload, mask),
                None => return Err(Error::Protocol(ProtocolError::UnmaskedFrameFromClient)),
            },
            Role::Client => {
                if header.mask.is_some() {
                    return Err(Error::Protocol(ProtocolError::MaskedFrameFromServer));
                }
            }
        }

        let frame = Frame::from_payload(header, payload.freeze());
        trace!("received frame {frame}");
        Ok(Some(frame))
    }

    /// Read into available `in_buffer` capacity.
    fn read_in(&mut self, stream: &mut impl Read) -> std::io::Result<usize> {
        let len = self.in_buffer.len();
        debug_assert!(self.in_buffer.capacity() > len);
        self.in_buffer.resize(self.in_buffer.capacity(), 0);
        let size = stream.read(&mut self.in_buffer[len..]);
        self.in_buffer.truncate(len + size.as_ref().copied().unwrap_or(0));
        size
    }

    /// Write a frame into the `out_buffer`.
    pub(crate) fn buffer_frame(&mut self, frame: Frame) {
        trace!("writing frame {frame}");
        self.out_buffer.reserve(frame.len());
        frame.format_into_buf(&mut self.out_buffer);
    }

    /// Write the out_buffer to the provided stream.
    ///
    /// Does **not** flush.
    pub(crate) fn write_out_buffer(&mut self, stream: &mut impl Write) -> Result<()> {
        while !self.out_buffer.is_empty() {
            let len = stream.write(&self.out_buffer)?;
            if len == 0 {
                // This is the same as "Connection reset by peer"
                return Err(IoError::new(
                    IoErrorKind::ConnectionReset,
                    "Connection reset while sending",
                )
                .into());
            }
            self.out_buffer.drain(0..len);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::coding::{CloseCode, Data, OpCode};
    use super::{CloseFrame, Frame, FrameCodec, FrameHeader};
    use crate::error::{CapacityError, Error, ProtocolError};
    use crate::protocol::Role;

    use std::io::Cursor;

    #[test]
    fn read_frames() {
        let mut raw = Cursor::new(vec![
            0x82, 0x07, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x82, 0x03, 0x03, 0x02, 0x01,
        ]);
        let mut codec = FrameCodec::new();

        assert_eq!(
            codec
                .read_frame(&mut raw, usize::MAX, Role::Client)
                .unwrap()
                .unwrap()
                .into_payload(),
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07][..]
        );
        assert_eq!(
            codec
                .read_frame(&mut raw, usize::MAX, Role::Client)
                .unwrap()
                .unwrap()
                .into_payload(),
            &[0x03, 0x02, 0x01][..]
        );
        assert!(codec.read_frame(&mut raw, usize::MAX, Role::Client).unwrap().is_none());
    }

    #[test]
    fn from_partially_read() {
        let mut raw = Cursor::new(vec![0x02, 0x03, 0x04, 0x05, 0x06, 0x07]);
        let mut codec = FrameCodec::from_partially_read(vec![0x82, 0x07, 0x01]);
        assert_eq!(
            codec
                .read_frame(&mut raw, usize::MAX, Role::Client)
                .unwrap()
                .unwrap()
                .into_payload(),
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07][..]
        );
    }

    #[test]
    fn byte_at_a_time_header() {
        // a header split across reads parses once enough bytes arrived
        let data = [0x82u8, 0x7E, 0x00, 0x02, 0xAA, 0xBB];
        for split in 1..data.len() {
            let mut codec = FrameCodec::from_partially_read(data[..split].to_vec());
            let mut rest = Cursor::new(data[split..].to_vec());
            let frame =
                codec.read_frame(&mut rest, usize::MAX, Role::Client).unwrap().unwrap();
            assert_eq!(frame.into_payload(), &[0xAA, 0xBB][..]);
        }
    }

    #[test]
    fn server_unmasks() {
        let mut raw = Cursor::new(vec![
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ]);
        let mut codec = FrameCodec::new();
        let frame = codec.read_frame(&mut raw, usize::MAX, Role::Server).unwrap().unwrap();
        assert_eq!(frame.payload(), b"Hello");
    }

    #[test]
    fn server_rejects_unmasked() {
        let mut raw = Cursor::new(vec![0x82, 0x03, 0x01, 0x02, 0x03]);
        let mut codec = FrameCodec::new();
        assert!(matches!(
            codec.read_frame(&mut raw, usize::MAX, Role::Server),
            Err(Error::Protocol(ProtocolError::UnmaskedFrameFromClient))
        ));
    }

    #[test]
    fn client_rejects_masked() {
        let mut raw = Cursor::new(vec![0x82, 0x83, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]);
        let mut codec = FrameCodec::new();
        assert!(matches!(
            codec.read_frame(&mut raw, usize::MAX, Role::Client),
            Err(Error::Protocol(ProtocolError::MaskedFrameFromServer))
        ));
    }

    #[test]
    fn huge_announced_length_is_rejected_without_allocation() {
        // 5 GiB announced in a single frame
        let mut raw = Cursor::new(vec![
            0x82, 0x7F, 0x00, 0x00, 0x00, 0x01, 0x40, 0x00, 0x00, 0x00,
        ]);
        let mut codec = FrameCodec::new();
        assert!(matches!(
            codec.read_frame(&mut raw, 2 * 1024 * 1024, Role::Client),
            Err(Error::Capacity(CapacityError::MessageTooLong { .. }))
        ));
    }

    #[test]
    fn parse_overflow() {
        let mut raw = Cursor::new(vec![
            0x83, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00,
        ]);
        let mut codec = FrameCodec::new();
        let _ = codec.read_frame(&mut raw, usize::MAX, Role::Client); // should not crash
    }

    #[test]
    fn write_frames() {
        let mut codec = FrameCodec::new();
        let mut out = Vec::new();

        codec.buffer_frame(Frame::ping(vec![0x04, 0x05]));
        codec.buffer_frame(Frame::pong(vec![0x01]));
        codec.write_out_buffer(&mut out).unwrap();

        assert_eq!(out, vec![0x89, 0x02, 0x04, 0x05, 0x8a, 0x01, 0x01]);
    }

    #[test]
    fn format_close_with_code_and_reason() {
        let frame =
            Frame::close(Some(CloseFrame { code: CloseCode::Normal, reason: "bye".into() }));
        let mut buf = Vec::new();
        frame.format_into_buf(&mut buf);
        assert_eq!(buf, vec![0x88, 0x05, 0x03, 0xE8, b'b', b'y', b'e']);
    }

    #[test]
    fn format_close_without_code() {
        let mut buf = Vec::new();
        Frame::close(None).format_into_buf(&mut buf);
        assert_eq!(buf, vec![0x88, 0x00]);

        // 1005 must never appear on the wire either
        buf.clear();
        Frame::close(Some(CloseFrame { code: CloseCode::Status, reason: "x".into() }))
            .format_into_buf(&mut buf);
        assert_eq!(buf, vec![0x88, 0x00]);
    }

    #[test]
    fn length_thresholds() {
        for (len, header_len) in [(125u64, 2), (126, 4), (65535, 4), (65536, 10)] {
            let header = FrameHeader { opcode: OpCode::Data(Data::Binary), ..Default::default() };
            let mut buf = Vec::new();
            header.format(len, &mut buf).unwrap();
            assert_eq!(buf.len(), header_len, "header length for payload of {len}");
            assert_eq!(header.len(len), header_len);

            // the parsed length must round-trip
            let mut cursor = Cursor::new(&buf[..]);
            let (_, parsed) = FrameHeader::parse(&mut cursor).unwrap().unwrap();
            assert_eq!(parsed, len);
        }
    }

    #[test]
    fn close_payload_of_one_byte_is_malformed() {
        let frame = Frame::from_payload(
            FrameHeader::default(),
            vec![0x03].into(),
        );
        assert!(matches!(
            frame.into_close(),
            Err(Error::Protocol(ProtocolError::InvalidCloseSequence))
        ));
    }

    #[test]
    fn close_payload_parsing() {
        let frame = Frame::from_payload(
            FrameHeader::default(),
            vec![0x03, 0xE8, b'b', b'y', b'e'].into(),
        );
        let close = frame.into_close().unwrap().unwrap();
        assert_eq!(close.code, CloseCode::Normal);
        assert_eq!(close.reason, "bye");

        let empty = Frame::from_payload(FrameHeader::default(), vec![].into());
        assert!(empty.into_close().unwrap().is_none());
    }

    #[test]
    fn masking_copies_instead_of_mutating() {
        let payload = bytes::Bytes::from_static(b"payload");
        let mut frame = Frame::message(payload.clone(), OpCode::Data(Data::Binary), true);
        frame.set_random_mask();
        let mut buf = Vec::new();
        frame.format_into_buf(&mut buf);
        assert!(frame.is_masked());
        // the caller-visible payload is untouched
        assert_eq!(frame.payload(), b"payload");
        assert_eq!(payload, &b"payload"[..]);
    }
}
