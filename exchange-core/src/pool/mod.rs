//! The endpoint-level connection pool contract.
//!
//! This crate implements the engines the pool drives; the pool itself
//! (per-host connection set, dispatch-by-capacity, eviction policy) is an
//! external collaborator elsewhere in the client. What lives here is the
//! callback contract engines invoke, plus a small reference pool suitable
//! for tests and simple embedders.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::error::Error;
use crate::exchange::ExchangeId;

/// Callbacks a connection engine invokes on its owning pool.
pub trait PoolCallbacks: Send + Sync {
    /// The connection became unusable (shut down cleanly).
    fn on_close(&self) {}

    /// The connection failed; the pool should evict it.
    fn on_error(&self, _cause: &Error) {}

    /// An H2C upgrade completed; `new_max_concurrent_requests` replaces the
    /// capacity this connection previously counted for (jumps from 1 to the
    /// negotiated HTTP/2 stream cap).
    fn on_upgrade(&self, _new_max_concurrent_requests: usize) {}

    /// An exchange completed (successfully or not); the pool may recycle
    /// the slot it occupied.
    fn on_exchange_terminate(&self, _id: ExchangeId) {}
}

/// A callback set that does nothing; useful for tests driving a connection
/// in isolation.
#[derive(Default)]
pub struct NoopPoolCallbacks;

impl PoolCallbacks for NoopPoolCallbacks {}

/// Configuration recognized by the pool façade.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub pool_max_size: usize,
    pub http1_max_concurrent_requests: usize,
    pub http2_max_concurrent_streams: usize,
    pub request_timeout: Duration,
    pub graceful_shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_max_size: 2,
            http1_max_concurrent_requests: 10,
            http2_max_concurrent_streams: 100,
            request_timeout: Duration::from_secs(60),
            graceful_shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// A capacity slot a connection currently contributes to the pool, tracked
/// so `on_upgrade` and `on_exchange_terminate` can adjust availability
/// without the pool needing connection-internal state. `_permit` is the
/// dispatch slot `pool_max_size` bounds; dropping it (on eviction) is what
/// lets a blocked `register` proceed.
struct ManagedConnection<C> {
    conn: C,
    available: usize,
    _permit: OwnedSemaphorePermit,
}

/// A minimal per-endpoint connection set: holds up to `pool_max_size`
/// connections, dispatches by available capacity, and recycles slots on
/// exchange termination.
///
/// `C` is left generic over the concrete connection handle type (an
/// `Http1Connection`, an upgraded HTTP/2 connection, ...); this façade only
/// tracks capacity bookkeeping and leaves dialing, health checks and
/// eviction policy to the embedder.
pub struct EndpointPool<C> {
    config: PoolConfig,
    connections: Mutex<VecDeque<ManagedConnection<C>>>,
    dispatch_permits: Arc<Semaphore>,
}

impl<C: Clone + Send + Sync + 'static> EndpointPool<C> {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let permits = config.pool_max_size.max(1);
        Arc::new(Self {
            config,
            connections: Mutex::new(VecDeque::new()),
            dispatch_permits: Arc::new(Semaphore::new(permits)),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Register a freshly established connection with its initial capacity
    /// (1 during H2C upgrade negotiation, `http1_max_concurrent_requests`
    /// for a plain HTTP/1.x connection, `http2_max_concurrent_streams` for
    /// HTTP/2). Waits for a free dispatch permit first, so the pool never
    /// holds more than `pool_max_size` connections at once; the caller
    /// should dial a new connection only once this resolves.
    pub async fn register(&self, conn: C, initial_capacity: usize) {
        trace!("waiting for a dispatch permit to register a connection");
        let Ok(permit) = self.dispatch_permits.clone().acquire_owned().await else {
            // The semaphore is only ever closed by dropping the pool
            // itself, at which point no `register` call can still be
            // running against it.
            return;
        };
        let mut guard = self.connections.lock().await;
        guard.push_back(ManagedConnection {
            conn,
            available: initial_capacity,
            _permit: permit,
        });
        debug!(pool_size = guard.len(), "registered connection");
    }

    /// Borrow the least-loaded connection with spare capacity, if any.
    pub async fn acquire(&self) -> Option<C> {
        let mut guard = self.connections.lock().await;
        let idx = guard
            .iter()
            .enumerate()
            .filter(|(_, c)| c.available > 0)
            .max_by_key(|(_, c)| c.available)
            .map(|(i, _)| i)?;
        guard[idx].available -= 1;
        Some(guard[idx].conn.clone())
    }

    /// Remove every registered connection matching `matches` (typically
    /// called once its `on_close`/`on_error` callback has already fired),
    /// returning its dispatch permit to the pool so a blocked `register` can
    /// proceed.
    pub async fn evict(&self, matches: impl Fn(&C) -> bool) {
        let mut guard = self.connections.lock().await;
        let before = guard.len();
        guard.retain(|c| !matches(&c.conn));
        let evicted = before - guard.len();
        if evicted > 0 {
            debug!(evicted, pool_size = guard.len(), "evicted connection(s)");
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_prefers_least_loaded_connection() {
        let pool = EndpointPool::<&'static str>::new(PoolConfig {
            pool_max_size: 2,
            ..PoolConfig::default()
        });
        pool.register("a", 1).await;
        pool.register("b", 10).await;

        let got = pool.acquire().await;
        assert_eq!(got, Some("b"));
    }

    #[tokio::test]
    async fn acquire_returns_none_when_no_capacity() {
        let pool = EndpointPool::<&'static str>::new(PoolConfig::default());
        pool.register("a", 0).await;
        assert_eq!(pool.acquire().await, None);
    }

    #[tokio::test]
    async fn register_blocks_at_pool_max_size_until_an_eviction_frees_a_permit() {
        let pool = EndpointPool::<&'static str>::new(PoolConfig {
            pool_max_size: 1,
            ..PoolConfig::default()
        });
        pool.register("a", 1).await;
        assert_eq!(pool.len().await, 1);

        let pool_clone = pool.clone();
        let register_b = tokio::spawn(async move {
            pool_clone.register("b", 1).await;
        });

        tokio::task::yield_now().await;
        assert!(
            !register_b.is_finished(),
            "register should block while the pool is already at pool_max_size"
        );

        pool.evict(|c| *c == "a").await;
        register_b.await.expect("registration task completes");
        assert_eq!(pool.len().await, 1);
        assert_eq!(pool.acquire().await, Some("b"));
    }
}
