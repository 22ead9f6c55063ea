//! Hook points the H2C upgrade coordinator intercepts on the underlying
//! HTTP/1.x engine, per the design note on modeling upgrade-as-subclass as
//! a wrapping state machine instead of inheritance.

use http::HeaderMap;

use crate::error::Error;
use crate::exchange::ExchangeId;
use crate::h1::codec::ResponseHead;

/// What the engine should do after a hook ran.
#[derive(Debug, Default)]
pub enum HookAction {
    /// Proceed with normal HTTP/1.x handling.
    #[default]
    Continue,
    /// The hook has taken ownership of the connection's remaining inbound
    /// bytes (used by the upgrade coordinator once it starts buffering raw
    /// bytes after a 101 response); the engine stops parsing response
    /// objects and forwards every subsequent inbound chunk to
    /// [`Http1Hooks::on_raw_bytes`] instead.
    Intercepted,
    /// The hook detected a fatal, connection-wide error (e.g. a malformed
    /// upgrade response); the engine tears the connection down with this
    /// cause instead of continuing.
    Fail(Error),
}

/// Interception points a wrapping state machine can use to observe (and
/// occasionally redirect) the HTTP/1.x engine without subclassing it.
pub trait Http1Hooks: Send {
    /// Called once per inbound response head, before it is attached to the
    /// responding exchange.
    fn on_response_head(&mut self, _id: ExchangeId, _head: &ResponseHead) -> HookAction {
        HookAction::Continue
    }

    /// Called once an exchange's request (head + body) has been fully
    /// written to the transport.
    fn on_request_complete(&mut self, _id: ExchangeId) {}

    /// Called when writing or framing an exchange's request failed.
    fn on_request_error(&mut self, _id: ExchangeId, _err: &Error) {}

    /// Called when a new exchange is about to be registered; lets the
    /// coordinator inject headers before the request line is rendered.
    fn on_create_exchange(&mut self, _headers: &mut HeaderMap) {}

    /// Raw bytes arriving while the hook owns the connection (post-101,
    /// pre-handoff). Returning `Err` tears the connection down.
    fn on_raw_bytes(&mut self, _bytes: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    /// Whether a write/framing error on one exchange should be treated as
    /// fatal to the whole connection rather than recovered locally. The
    /// plain HTTP/1.x engine recovers (disposes the exchange, keeps the
    /// pipeline going); the upgrade coordinator overrides this to `true`
    /// while a negotiation is in flight, since any request error during
    /// upgrade should close the connection rather than continue pipelining.
    fn abort_connection_on_request_error(&self) -> bool {
        false
    }
}

/// The default, no-op hook set used by a plain HTTP/1.x connection.
#[derive(Default)]
pub struct NoopHooks;

impl Http1Hooks for NoopHooks {}
