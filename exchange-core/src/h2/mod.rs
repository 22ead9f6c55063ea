//! The HTTP/2 connection engine, at interface level.
//!
//! Stream multiplexing and framing reuse the same exchange contract as the
//! HTTP/1.x engine, but the wire-level state machine (HPACK, flow control,
//! stream lifecycle) is a collaborator this crate only describes the seam
//! for; building one is out of scope here.

use tokio::sync::oneshot;

use crate::error::Result;
use crate::exchange::{Exchange, RequestHandle};

mod settings;

pub use settings::Http2Settings;

/// Tunables for an HTTP/2 connection.
#[derive(Debug, Clone)]
pub struct Http2Config {
    pub max_concurrent_streams: usize,
    pub initial_settings: Http2Settings,
}

impl Default for Http2Config {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 100,
            initial_settings: Http2Settings::default(),
        }
    }
}

/// The seam an H2C upgrade coordinator (or a direct `h2://` dialer) hands
/// control to once a connection is multiplexed. Mirrors
/// [`crate::h1::Http1Connection`]'s shape so a pool can treat HTTP/1.x and
/// HTTP/2 connections uniformly: register an exchange, observe
/// termination, shut down.
///
/// HTTP/2 exchanges are independent of one another (no pipelining order to
/// preserve); only per-stream ordering applies.
pub trait Http2Connection: Send + Sync {
    /// Register a request as a new stream. Resolves to the [`Exchange`]
    /// handle once a stream id has been assigned, or to a registration
    /// error (e.g. `max_concurrent_streams` exhausted).
    fn send(&self, request: RequestHandle) -> oneshot::Receiver<Result<Exchange>>;

    /// Tear every open stream down and close the connection.
    fn shutdown(&self) -> oneshot::Receiver<Result<()>>;

    /// The negotiated (or configured) concurrent-stream cap.
    fn max_concurrent_streams(&self) -> usize;
}

/// Callback surface an `Http2Connection` implementation invokes on its pool,
/// reusing the same contract as the HTTP/1.x engine rather than a parallel
/// one.
pub type Http2PoolCallbacks = dyn crate::pool::PoolCallbacks;

/// Identifies a stream within an `Http2Connection`; kept distinct from
/// [`ExchangeId`] (a connection-local slab index) even though both are
/// small integers, since a full implementation's stream ids follow RFC 7540
/// framing rules (odd for client-initiated streams) that an
/// [`ExchangeId`] carries no such constraint for.
pub type StreamId = u32;

/// What an H2C upgrade handoff gives a concrete `Http2Connection`
/// implementation to resume from: the duplex (handed separately, since this
/// crate leaves transport ownership to the caller) plus any bytes the
/// HTTP/1.x engine had already read past the `101` response before the
/// upgrade was accepted.
pub struct H2PrefaceHandoff {
    pub buffered: bytes::Bytes,
    pub config: Http2Config,
}

#[allow(dead_code)]
fn _assert_object_safe(_: &dyn Http2Connection) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_standard_stream_cap() {
        let config = Http2Config::default();
        assert_eq!(config.max_concurrent_streams, 100);
    }
}
