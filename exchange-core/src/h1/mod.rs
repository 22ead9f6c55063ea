//! The HTTP/1.x connection engine: a pipeline of exchanges over a single
//! byte duplex, with read/flush coalescing, per-exchange timeout
//! supervision, chunked/length body framing, and graceful/forceful
//! shutdown.

mod codec;
mod conn;
mod hooks;

pub use codec::{response_body_length, BodyLength, ResponseHead};
pub use conn::{ConnectionDriver, Http1Config, Http1Connection};
pub use hooks::{HookAction, Http1Hooks, NoopHooks};
