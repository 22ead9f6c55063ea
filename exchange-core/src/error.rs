//! Error and result types for the exchange engine.
//!
//! # Formatting
//!
//! The `Display` impl of [`Error`] only prints this level of detail, even
//! though it may wrap another error as its `source()`. Use `{:#}` (via
//! `xc_error::ErrorExt::backtrace` upstream, or `std::error::Report`) to walk
//! the full chain.

use std::fmt;

use xc_error::BoxError;

/// Result type used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Taxonomy of errors the engine can surface to a caller.
///
/// See `Error::kind` for inspecting which variant produced a given error.
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    cause: Option<BoxError>,
}

/// Error kinds, as named in the engine's error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// The connection is `closing`/`closed`; the exchange never reached the wire.
    ConnectionClosed,
    /// The remote closed the connection mid-exchange.
    ConnectionResetByPeer,
    /// The per-exchange deadline was exceeded.
    RequestTimeout,
    /// A malformed upgrade response, or a second upgrade attempt.
    HttpClientUpgrade,
    /// An explicit local reset, carrying a short application-defined code.
    ExchangeReset,
    /// A decoder failure or unsupported protocol version.
    ProtocolError,
    /// The H2C upgrade buffer exceeded its 64 KiB cap.
    MessageBufferOverflow,
    /// An inbound protocol frame exceeded a configured size limit.
    TooLongFrame,
    /// A body resource (e.g. a file region source) could not be opened.
    ResourceNotReadable,
    /// The server rejected an upgrade (non-101); the response is still
    /// delivered to the caller as an ordinary HTTP/1.x response.
    UpgradeRejected,
}

impl Kind {
    fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionClosed => "connection closed",
            Self::ConnectionResetByPeer => "connection reset by peer",
            Self::RequestTimeout => "request timeout",
            Self::HttpClientUpgrade => "http client upgrade error",
            Self::ExchangeReset => "exchange reset",
            Self::ProtocolError => "protocol error",
            Self::MessageBufferOverflow => "message buffer overflow",
            Self::TooLongFrame => "frame too long",
            Self::ResourceNotReadable => "resource not readable",
            Self::UpgradeRejected => "upgrade rejected",
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

    /// The taxonomy kind that classifies this error.
    pub fn kind(&self) -> Kind {
        self.inner.kind
    }

    pub fn is_closed(&self) -> bool {
        self.inner.kind == Kind::ConnectionClosed
    }

    pub fn is_timeout(&self) -> bool {
        self.inner.kind == Kind::RequestTimeout
    }

    pub fn new_connection_closed() -> Self {
        Self::new(Kind::ConnectionClosed)
    }

    pub fn new_connection_reset_by_peer() -> Self {
        Self::new(Kind::ConnectionResetByPeer)
    }

    pub fn new_request_timeout() -> Self {
        Self::new(Kind::RequestTimeout)
    }

    pub fn new_http_client_upgrade() -> Self {
        Self::new(Kind::HttpClientUpgrade)
    }

    /// An explicit local reset with the given application-defined code.
    pub fn new_exchange_reset(code: u32) -> Self {
        Self::new(Kind::ExchangeReset).with(format!("reset code {code}"))
    }

    pub fn new_protocol_error() -> Self {
        Self::new(Kind::ProtocolError)
    }

    pub fn new_message_buffer_overflow() -> Self {
        Self::new(Kind::MessageBufferOverflow)
    }

    pub fn new_too_long_frame() -> Self {
        Self::new(Kind::TooLongFrame)
    }

    pub fn new_resource_not_readable() -> Self {
        Self::new(Kind::ResourceNotReadable)
    }

    pub fn new_upgrade_rejected() -> Self {
        Self::new(Kind::UpgradeRejected)
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
