//! A WebSocket (RFC 6455) exchange engine, constructed on top of an
//! already-upgraded HTTP/1.1 connection.
//!
//! [`handshake`] performs (client-side) the opening handshake's request
//! construction and `101` response verification; [`ConnectionDriver`] then
//! takes over the same duplex to run the frame/message engine: inbound
//! frame and message subscription (exclusive across `frames`/`messages`/
//! `text_messages`/`binary_messages`), outbound frame/message publishers,
//! PING/PONG auto-reply, and the close handshake.

#![warn(clippy::print_stdout, clippy::dbg_macro)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod close;
pub mod config;
pub mod conn;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;

pub use close::{
    build_close_frame, is_sendable, parse_close_payload, ABNORMAL_CLOSURE, BAD_GATEWAY, GOING_AWAY,
    INTERNAL_ERROR, INVALID_PAYLOAD_DATA, MANDATORY_EXTENSION, MESSAGE_TOO_BIG, NO_STATUS_RECEIVED,
    NORMAL_CLOSURE, POLICY_VIOLATION, PROTOCOL_ERROR, SERVICE_RESTART, TLS_HANDSHAKE_FAILURE,
    TRY_AGAIN_LATER, UNSUPPORTED_DATA,
};
pub use config::WsConfig;
pub use conn::{
    BinaryMessages, ConnectionDriver, Duplex, FrameFactory, Frames, Messages, TextMessages,
    WebSocketConnection,
};
pub use error::{Error, Kind, Result};
pub use frame::{encode_frame, try_decode_frame, Decoded, Frame, OpCode, MAX_CONTROL_FRAME_LEN};
pub use handshake::{build_client_request, verify_server_response, ClientHandshake};
pub use message::{Message, MessageAssembler};
