//! Wire frame encoding/decoding (RFC 6455 §5) and the reference-counted
//! [`Frame`] type carried across the inbound/outbound boundary.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;

use crate::error::{Error, Result};

/// A frame's opcode (RFC 6455 §5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(Error::new_protocol_error().with(format!("reserved opcode 0x{other:x}"))),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    pub fn is_data(self) -> bool {
        !self.is_control()
    }
}

/// A single WebSocket frame. The payload is handed over exactly once: both
/// [`Frame::into_payload`] and [`Frame::release`] consume `self`, so the
/// type system rules out a double release the way a reference-counted
/// buffer would need a runtime check for.
///
/// `Clone` is cheap (an opcode/flag pair plus a refcounted [`Bytes`]) and is
/// used by the connection engine to hand a control frame to both its
/// internal PING/PONG auto-reply and an active `frames()` subscriber.
#[derive(Debug, Clone)]
pub struct Frame {
    opcode: OpCode,
    fin: bool,
    payload: Bytes,
}

impl Frame {
    pub fn new(opcode: OpCode, fin: bool, payload: Bytes) -> Self {
        Self { opcode, fin, payload }
    }

    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, true, payload.into())
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, true, payload.into())
    }

    pub fn ping(payload: Bytes) -> Result<Self> {
        check_control_len(&payload)?;
        Ok(Self::new(OpCode::Ping, true, payload))
    }

    pub fn pong(payload: Bytes) -> Result<Self> {
        check_control_len(&payload)?;
        Ok(Self::new(OpCode::Pong, true, payload))
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub fn is_final(&self) -> bool {
        self.fin
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Take ownership of the payload buffer, releasing this frame.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Discard the frame without inspecting its payload.
    pub fn release(self) {}
}

/// Control frame payloads (PING/PONG/CLOSE) are capped at 125 bytes
/// (RFC 6455 §5.5).
pub const MAX_CONTROL_FRAME_LEN: usize = 125;

fn check_control_len(payload: &Bytes) -> Result<()> {
    if payload.len() > MAX_CONTROL_FRAME_LEN {
        return Err(Error::new_protocol_error()
            .with(format!("control frame payload {} exceeds 125 bytes", payload.len())));
    }
    Ok(())
}

/// Encode a frame for transmission. `mask` is `Some` for a client (every
/// client-to-server frame must be masked); `None` for a server.
pub fn encode_frame(opcode: OpCode, fin: bool, payload: &[u8], mask: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 14);
    let first_byte = (if fin { 0x80 } else { 0x00 }) | opcode.to_byte();
    buf.put_u8(first_byte);

    let mask_bit = if mask { 0x80 } else { 0x00 };
    let len = payload.len();
    if len < 126 {
        buf.put_u8(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(len as u64);
    }

    if mask {
        let mut key = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut key);
        buf.put_slice(&key);
        let start = buf.len();
        buf.put_slice(payload);
        for (i, byte) in buf[start..].iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    } else {
        buf.put_slice(payload);
    }

    buf.freeze()
}

/// The outcome of attempting to decode one frame header + payload from a
/// buffer, distinguishing "need more bytes" from a hard parse failure.
pub enum Decoded {
    Incomplete,
    Frame { frame: Frame, masked: bool, consumed: usize },
}

/// Parse one frame from the front of `buf` without consuming it; the
/// caller advances `buf` by `consumed` bytes once it accepts the result.
/// `expect_masked` enforces RFC 6455 §5.1's masking direction: `true` when
/// this side is a server (inbound frames must be masked), `false` when a
/// client (inbound frames must not be masked).
pub fn try_decode_frame(buf: &[u8], max_frame_size: Option<usize>, expect_masked: bool) -> Result<Decoded> {
    if buf.len() < 2 {
        return Ok(Decoded::Incomplete);
    }
    let first = buf[0];
    let second = buf[1];
    let fin = first & 0x80 != 0;
    if first & 0x70 != 0 {
        return Err(Error::new_protocol_error().with("reserved bits set"));
    }
    let opcode = OpCode::from_byte(first & 0x0F)?;
    let masked = second & 0x80 != 0;
    if masked != expect_masked {
        return Err(Error::new_protocol_error().with(if expect_masked {
            "client frame was not masked"
        } else {
            "server frame was masked"
        }));
    }

    let mut offset = 2usize;
    let base_len = (second & 0x7F) as u64;
    let payload_len: u64 = if base_len < 126 {
        base_len
    } else if base_len == 126 {
        if buf.len() < offset + 2 {
            return Ok(Decoded::Incomplete);
        }
        let len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as u64;
        offset += 2;
        len
    } else {
        if buf.len() < offset + 8 {
            return Ok(Decoded::Incomplete);
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&buf[offset..offset + 8]);
        offset += 8;
        u64::from_be_bytes(len_bytes)
    };

    if opcode.is_control() && (payload_len > MAX_CONTROL_FRAME_LEN as u64 || !fin) {
        return Err(Error::new_protocol_error().with("control frame too large or fragmented"));
    }
    if let Some(max) = max_frame_size {
        if payload_len > max as u64 {
            return Err(Error::new_too_long_frame()
                .with(format!("frame payload {payload_len} exceeds max_frame_size {max}")));
        }
    }

    let mask_key = if masked {
        if buf.len() < offset + 4 {
            return Ok(Decoded::Incomplete);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let payload_len = payload_len as usize;
    if buf.len() < offset + payload_len {
        return Ok(Decoded::Incomplete);
    }

    let mut payload = BytesMut::from(&buf[offset..offset + payload_len]);
    if let Some(key) = mask_key {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }
    offset += payload_len;

    Ok(Decoded::Frame {
        frame: Frame::new(opcode, fin, payload.freeze()),
        masked,
        consumed: offset,
    })
}

/// Advance `buf` past a previously-decoded frame.
pub fn advance(buf: &mut BytesMut, consumed: usize) {
    buf.advance(consumed);
}
