//! Per-connection HTTP/1.x, H2C upgrade and HTTP/2 exchange engine.
//!
//! This crate is the protocol core an endpoint connection pool drives: it
//! owns the wire-level state machines (request/response framing, the H2C
//! upgrade handshake, a minimal HTTP/2 collaborator) and exposes a small
//! handle-based API so a pool, a redirect layer or a caller can register
//! requests and observe responses without reaching into connection
//! internals. Socket I/O, TLS, DNS, retries and the header/body service
//! facade that higher layers build on top all live outside this crate.

#![warn(clippy::print_stdout, clippy::dbg_macro)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod exchange;
pub mod h1;
pub mod h2;
pub mod pool;
pub mod transport;
pub mod upgrade;

pub use error::{Error, Kind, Result};
pub use exchange::{
    Authority, EndpointExchange, Exchange, ExchangeId, FileRegion, FileRegionBody, PathBuilder,
    RequestBody, RequestHandle, ResponseHandle, StatusCategory, MAX_FILE_REGION_LEN,
};
pub use h1::{Http1Config, Http1Connection, Http1Hooks, NoopHooks};
pub use h2::{Http2Config, Http2Connection, Http2Settings};
pub use transport::{Duplex, TransportInfo};
pub use upgrade::{UpgradeConfig, UpgradeCoordinator, UpgradeOutcome, UpgradeState};
