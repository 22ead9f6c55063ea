//! Message assembly: grouping a TEXT or BINARY frame with the
//! CONTINUATION frames that follow it until a final-flagged frame closes
//! the sequence (RFC 6455 §5.4).

use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::frame::{Frame, OpCode};

/// Inline capacity for [`Message::into_frames`]'s return value: the common
/// case (a message within `max_frame_size`) is exactly one frame, so that
/// case never spills to the heap.
const INLINE_FRAMES: usize = 1;

/// A complete inbound or outbound WebSocket message: the reduced-text or
/// reduced-binary view of one or more frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    /// Split this message into the frame sequence that carries it. A
    /// message larger than `max_frame_size` is split across CONTINUATION
    /// frames; one that fits is sent as a single final frame.
    pub fn into_frames(self, max_frame_size: Option<usize>) -> SmallVec<[Frame; INLINE_FRAMES]> {
        let (initial_opcode, bytes): (OpCode, Bytes) = match self {
            Message::Text(s) => (OpCode::Text, Bytes::from(s)),
            Message::Binary(b) => (OpCode::Binary, b),
        };
        let chunk_len = max_frame_size.unwrap_or(bytes.len()).max(1);
        if bytes.len() <= chunk_len {
            let mut frames = SmallVec::new();
            frames.push(Frame::new(initial_opcode, true, bytes));
            return frames;
        }

        let mut frames = SmallVec::new();
        let mut remaining = bytes;
        let mut opcode = initial_opcode;
        while !remaining.is_empty() {
            let take = chunk_len.min(remaining.len());
            let chunk = remaining.split_to(take);
            let fin = remaining.is_empty();
            frames.push(Frame::new(opcode, fin, chunk));
            opcode = OpCode::Continuation;
        }
        frames
    }
}

/// Accumulates a data frame sequence (one TEXT/BINARY frame plus zero or
/// more CONTINUATION frames) into a [`Message`] once the final frame
/// arrives.
pub struct MessageAssembler {
    kind: Option<OpCode>,
    buffer: BytesMut,
    max_message_size: Option<usize>,
}

impl MessageAssembler {
    pub fn new(max_message_size: Option<usize>) -> Self {
        Self {
            kind: None,
            buffer: BytesMut::new(),
            max_message_size,
        }
    }

    /// Feed one data frame (never a control frame) into the assembler.
    /// Returns `Some(message)` once `frame.is_final()` completes the
    /// sequence.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        let opcode = frame.opcode();
        match (self.kind, opcode) {
            (None, OpCode::Text) | (None, OpCode::Binary) => {
                self.kind = Some(opcode);
            }
            (Some(_), OpCode::Continuation) => {}
            (None, OpCode::Continuation) => {
                return Err(Error::new_protocol_error()
                    .with("continuation frame with no initial data frame"));
            }
            (Some(_), _) => {
                return Err(Error::new_protocol_error()
                    .with("new data frame while a fragmented message is in progress"));
            }
        }

        let fin = frame.is_final();
        let payload = frame.into_payload();
        self.buffer.extend_from_slice(&payload);
        if let Some(max) = self.max_message_size {
            if self.buffer.len() > max {
                let size = self.buffer.len();
                self.buffer.clear();
                self.kind = None;
                return Err(Error::new_too_long_frame()
                    .with(format!("assembled message {size} exceeds max_message_size {max}")));
            }
        }

        if !fin {
            return Ok(None);
        }

        let kind = self.kind.take().unwrap_or(OpCode::Binary);
        let bytes = self.buffer.split().freeze();
        let message = match kind {
            OpCode::Text => {
                let text = String::from_utf8(bytes.to_vec())
                    .map_err(|_| Error::new_invalid_payload_data().with("text frame was not valid UTF-8"))?;
                Message::Text(text)
            }
            _ => Message::Binary(bytes),
        };
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_fragmented_text_across_continuations() {
        let mut assembler = MessageAssembler::new(None);
        assert!(assembler
            .push(Frame::new(OpCode::Text, false, Bytes::from_static(b"Hello, ")))
            .unwrap()
            .is_none());
        let message = assembler
            .push(Frame::new(OpCode::Continuation, true, Bytes::from_static(b"World!")))
            .unwrap()
            .unwrap_or_else(|| panic!("expected completed message"));
        assert_eq!(message, Message::Text("Hello, World!".to_string()));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut assembler = MessageAssembler::new(None);
        let err = assembler
            .push(Frame::new(OpCode::Text, true, Bytes::from_static(&[0xff, 0xfe])))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::Kind::InvalidPayloadData);
    }

    #[test]
    fn message_over_limit_is_rejected() {
        let mut assembler = MessageAssembler::new(Some(4));
        let err = assembler
            .push(Frame::new(OpCode::Binary, true, Bytes::from_static(b"12345")))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::Kind::TooLongFrame);
    }

    #[test]
    fn message_splits_into_frames_above_max_frame_size() {
        let frames = Message::Binary(Bytes::from_static(b"abcdef")).into_frames(Some(2));
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].opcode(), OpCode::Binary);
        assert_eq!(frames[1].opcode(), OpCode::Continuation);
        assert!(frames[2].is_final());
    }
}
