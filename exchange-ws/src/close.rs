//! Close status codes (RFC 6455 §7.4) and the close frame codec.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::frame::{Frame, MAX_CONTROL_FRAME_LEN};

/// Normal closure; the purpose for which the connection was established
/// has been fulfilled.
pub const NORMAL_CLOSURE: u16 = 1000;
pub const GOING_AWAY: u16 = 1001;
pub const PROTOCOL_ERROR: u16 = 1002;
pub const UNSUPPORTED_DATA: u16 = 1003;
/// Reserved: must not be set as a status code in a close frame sent over
/// the wire. Only meaningful locally, to report "no status code was
/// present".
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// Reserved: must not be set as a status code in a close frame sent over
/// the wire. Only meaningful locally, to report an abnormal closure (no
/// close frame was received at all).
pub const ABNORMAL_CLOSURE: u16 = 1006;
pub const INVALID_PAYLOAD_DATA: u16 = 1007;
pub const POLICY_VIOLATION: u16 = 1008;
pub const MESSAGE_TOO_BIG: u16 = 1009;
pub const MANDATORY_EXTENSION: u16 = 1010;
pub const INTERNAL_ERROR: u16 = 1011;
/// IANA registry extension (not in the base RFC): the server is
/// restarting.
pub const SERVICE_RESTART: u16 = 1012;
/// IANA registry extension: the server is overloaded and the client
/// should reconnect later.
pub const TRY_AGAIN_LATER: u16 = 1013;
/// IANA registry extension: a gateway or proxy received an invalid
/// response from the upstream server.
pub const BAD_GATEWAY: u16 = 1014;
/// Reserved: must not be set as a status code in a close frame sent over
/// the wire.
pub const TLS_HANDSHAKE_FAILURE: u16 = 1015;

/// Whether `code` may legally appear as the status code of a close frame
/// placed on the wire (RFC 6455 §7.4.1/§7.4.2).
pub fn is_sendable(code: u16) -> bool {
    match code {
        NO_STATUS_RECEIVED | ABNORMAL_CLOSURE | TLS_HANDSHAKE_FAILURE => false,
        1000..=2999 => !(1004..=1006).contains(&code),
        3000..=4999 => true,
        _ => false,
    }
}

/// Build a close frame payload: the 2-byte big-endian status code
/// followed by a UTF-8 reason, truncated so the total payload stays
/// within the 125-byte control frame cap.
pub fn build_close_frame(code: u16, reason: &str) -> Result<Frame> {
    if !is_sendable(code) {
        return Err(Error::new_protocol_error().with(format!("{code} is not a sendable close code")));
    }
    let mut reason_bytes = reason.as_bytes();
    let budget = MAX_CONTROL_FRAME_LEN - 2;
    if reason_bytes.len() > budget {
        reason_bytes = &reason_bytes[..truncate_at_char_boundary(reason_bytes, budget)];
    }

    Ok(Frame::new(crate::frame::OpCode::Close, true, payload_from(code, reason_bytes)))
}

fn payload_from(code: u16, reason_bytes: &[u8]) -> Bytes {
    let mut payload = BytesMut::with_capacity(2 + reason_bytes.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason_bytes);
    payload.freeze()
}

fn truncate_at_char_boundary(bytes: &[u8], max: usize) -> usize {
    let mut end = max.min(bytes.len());
    while end > 0 && std::str::from_utf8(&bytes[..end]).is_err() {
        end -= 1;
    }
    end
}

/// Parse a received close frame's payload into `(code, reason)`. An empty
/// payload means no status code was sent (`NO_STATUS_RECEIVED` locally).
pub fn parse_close_payload(payload: &Bytes) -> Result<(u16, String)> {
    if payload.is_empty() {
        return Ok((NO_STATUS_RECEIVED, String::new()));
    }
    if payload.len() < 2 {
        return Err(Error::new_protocol_error().with("close frame payload shorter than 2 bytes"));
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = std::str::from_utf8(&payload[2..])
        .map_err(|_| Error::new_invalid_payload_data().with("close reason was not valid UTF-8"))?
        .to_string();
    Ok((code, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_frame_payload_is_code_then_reason() {
        let frame = build_close_frame(NORMAL_CLOSURE, "bye").unwrap_or_else(|_| panic!("build failed"));
        let payload = frame.into_payload();
        assert_eq!(&payload[..2], &1000u16.to_be_bytes());
        assert_eq!(&payload[2..], b"bye");
    }

    #[test]
    fn reason_is_truncated_to_fit_125_bytes() {
        let long_reason = "x".repeat(200);
        let frame = build_close_frame(NORMAL_CLOSURE, &long_reason).unwrap_or_else(|_| panic!("build failed"));
        assert!(frame.payload().len() <= MAX_CONTROL_FRAME_LEN);
    }

    #[test]
    fn reserved_codes_are_rejected_for_sending() {
        assert!(build_close_frame(ABNORMAL_CLOSURE, "").is_err());
        assert!(build_close_frame(NO_STATUS_RECEIVED, "").is_err());
    }

    #[test]
    fn empty_payload_parses_as_no_status_received() {
        let (code, reason) = parse_close_payload(&Bytes::new()).unwrap_or_else(|_| panic!("parse failed"));
        assert_eq!(code, NO_STATUS_RECEIVED);
        assert!(reason.is_empty());
    }
}
