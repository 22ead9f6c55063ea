//! The byte-duplex / executor contract the engine is driven over.
//!
//! TLS establishment, socket I/O and the event loop live outside the
//! engine, owned by external collaborators. What the engine needs from a
//! transport is: an async read/write duplex, a way to learn whether the
//! channel is secured, and the addressing metadata used to build the
//! `Host` header and to populate the request handle.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};

/// Minimal duplex bound required to drive a connection engine.
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Duplex for T {}

/// Peer and security metadata surfaced by the transport.
///
/// A `None` peer certificate chain on a TLS transport simply means the peer
/// didn't present one (not all TLS configurations require client certs); it
/// is distinct from `is_tls == false`.
#[derive(Debug, Clone, Default)]
pub struct TransportInfo {
    pub is_tls: bool,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub peer_certificates: Vec<Vec<u8>>,
}

impl TransportInfo {
    pub fn plaintext(local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Self {
        Self {
            is_tls: false,
            local_addr: local,
            remote_addr: remote,
            peer_certificates: Vec::new(),
        }
    }

    pub fn tls(
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        peer_certificates: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            is_tls: true,
            local_addr: local,
            remote_addr: remote,
            peer_certificates,
        }
    }

    /// Default scheme implied by whether this transport is secured.
    pub fn http_scheme(&self) -> &'static str {
        if self.is_tls { "https" } else { "http" }
    }

    pub fn ws_scheme(&self) -> &'static str {
        if self.is_tls { "wss" } else { "ws" }
    }
}
