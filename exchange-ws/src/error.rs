//! Error and result types for the WebSocket engine.

use std::fmt;

use xc_error::BoxError;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    cause: Option<BoxError>,
}

/// Error kinds, as named in this crate's error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// The opening handshake's response was not a valid `101 Switching
    /// Protocols: websocket` (missing/incorrect `Upgrade`, `Connection` or
    /// `Sec-WebSocket-Accept`).
    HandshakeFailed,
    /// A subprotocol was offered but the server's response did not select
    /// one of the offered values.
    SubprotocolNegotiationFailed,
    /// A second inbound subscription was attempted after one was already
    /// installed.
    AlreadySubscribed,
    /// A decoder failure: a reserved opcode, a masked frame from a server,
    /// an unmasked frame from a client, a control frame over 125 bytes, or
    /// similar framing violations.
    ProtocolError,
    /// A text frame or text message did not contain valid UTF-8.
    InvalidPayloadData,
    /// An inbound frame or assembled message exceeded a configured size
    /// limit.
    TooLongFrame,
    /// The connection is closed or closing; the write never reached the
    /// wire.
    ConnectionClosed,
    /// The remote closed the connection mid-exchange.
    ConnectionResetByPeer,
}

impl Kind {
    fn as_str(self) -> &'static str {
        match self {
            Self::HandshakeFailed => "websocket handshake failed",
            Self::SubprotocolNegotiationFailed => "subprotocol negotiation failed",
            Self::AlreadySubscribed => "inbound already subscribed",
            Self::ProtocolError => "protocol error",
            Self::InvalidPayloadData => "invalid payload data",
            Self::TooLongFrame => "frame too long",
            Self::ConnectionClosed => "connection closed",
            Self::ConnectionResetByPeer => "connection reset by peer",
        }
    }
}

impl Error {
    fn new(kind: Kind) -> Self {
        Self {
            inner: Box::new(Inner { kind, cause: None }),
        }
    }

    /// Attach a cause, used as this error's `source()`.
    #[must_use]
    pub fn with<C: Into<BoxError>>(mut self, cause: C) -> Self {
        self.inner.cause = Some(cause.into());
        self
    }

    pub fn kind(&self) -> Kind {
        self.inner.kind
    }

    pub fn new_handshake_failed() -> Self {
        Self::new(Kind::HandshakeFailed)
    }

    pub fn new_subprotocol_negotiation_failed() -> Self {
        Self::new(Kind::SubprotocolNegotiationFailed)
    }

    pub fn new_already_subscribed() -> Self {
        Self::new(Kind::AlreadySubscribed)
    }

    pub fn new_protocol_error() -> Self {
        Self::new(Kind::ProtocolError)
    }

    pub fn new_invalid_payload_data() -> Self {
        Self::new(Kind::InvalidPayloadData)
    }

    pub fn new_too_long_frame() -> Self {
        Self::new(Kind::TooLongFrame)
    }

    pub fn new_connection_closed() -> Self {
        Self::new(Kind::ConnectionClosed)
    }

    pub fn new_connection_reset_by_peer() -> Self {
        Self::new(Kind::ConnectionResetByPeer)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.inner.kind.as_str())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Error");
        d.field("kind", &self.inner.kind);
        if let Some(cause) = &self.inner.cause {
            d.field("cause", cause);
        }
        d.finish()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.cause.as_deref().map(|c| c as _)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                Error::new_connection_reset_by_peer().with(e)
            }
            _ => Error::new_protocol_error().with(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prints_kind_only() {
        let err = Error::new_protocol_error().with("reserved opcode 0xb");
        assert_eq!(format!("{err}"), "protocol error");
    }

    #[test]
    fn source_chain_is_reachable() {
        use std::error::Error as _;
        let err = Error::new_handshake_failed().with("missing Sec-WebSocket-Accept");
        assert!(err.source().is_some());
    }
}
