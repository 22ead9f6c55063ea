//! The H2C upgrade coordinator: wraps the HTTP/1.x engine for its first
//! exchange, injects the upgrade headers, observes the response, and
//! either hands the connection back as a plain HTTP/1.x connection
//! (rejected) or buffers subsequent bytes for handoff to an HTTP/2 engine
//! (accepted).
//!
//! Subclassing the HTTP/1.x engine would tangle upgrade bookkeeping into
//! its pipeline logic; instead this wraps it via the [`Http1Hooks`] seam and
//! tracks its own state as the tagged enum [`UpgradeState`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, trace, warn};

use crate::error::Error;
use crate::exchange::ExchangeId;
use crate::h1::{HookAction, Http1Hooks, ResponseHead};
use crate::h2::Http2Settings;
use crate::pool::PoolCallbacks;

/// The upgrade negotiation's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    Started,
    Received,
    FullyReceived,
    Prepared,
    Completed,
}

/// What the negotiation resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// The server answered with something other than `101 Switching
    /// Protocols: h2c`; the exchange is delivered to the caller as an
    /// ordinary HTTP/1.x response and the connection stays HTTP/1.x, now at
    /// its full configured capacity.
    Rejected,
    /// The server accepted the upgrade. The 101 head is parsed (and this
    /// outcome sent) before any bytes past it have necessarily arrived, so
    /// the buffered preface itself is not carried on this variant: call
    /// [`UpgradeCoordinator::take_buffered`] after observing `Accepted` to
    /// drain whatever the coordinator has collected via `on_raw_bytes` so
    /// far, and feed it to the HTTP/2 engine before any further socket
    /// reads.
    Accepted,
}

/// Tunables for an upgrade negotiation.
#[derive(Debug, Clone)]
pub struct UpgradeConfig {
    /// Capacity reported while negotiating: `max_concurrent_requests = 1`
    /// until the negotiation completes, so no second request is admitted
    /// ahead of the upgrading one.
    pub pending_max_concurrent_requests: usize,
    /// Capacity reported once rejected: the plain HTTP/1.x connection's
    /// normal pipeline depth.
    pub http1_max_concurrent_requests: usize,
    /// Capacity reported once accepted: the negotiated HTTP/2 stream cap.
    pub http2_max_concurrent_streams: usize,
    /// The SETTINGS payload advertised via the `HTTP2-Settings` header.
    pub settings: Http2Settings,
    /// Bound on bytes buffered while the coordinator still holds the
    /// connection. Overflow is reported as `MessageBufferOverflow`.
    pub max_buffered_bytes: usize,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            pending_max_concurrent_requests: 1,
            http1_max_concurrent_requests: 10,
            http2_max_concurrent_streams: 100,
            settings: Http2Settings::default(),
            max_buffered_bytes: 64 * 1024,
        }
    }
}

/// A handle to a running upgrade negotiation. Constructed alongside the
/// [`Http1Hooks`] implementation that actually drives the state machine, the
/// way [`crate::h1::Http1Connection`] is constructed alongside its
/// `ConnectionDriver`.
pub struct UpgradeCoordinator {
    state_rx: watch::Receiver<UpgradeState>,
    outcome_rx: Mutex<Option<oneshot::Receiver<UpgradeOutcome>>>,
    reported_max_concurrent_requests: Arc<AtomicUsize>,
    buffered: Arc<Mutex<BytesMut>>,
}

impl UpgradeCoordinator {
    /// Build a coordinator and the hook set a `ConnectionDriver` should be
    /// constructed with. The caller is responsible for constructing that
    /// driver's [`crate::h1::Http1Config`] with
    /// `max_concurrent_requests: 1` for the duration of the negotiation —
    /// this type only tracks and reports the state, it does not reach into
    /// the engine's own admission check.
    pub fn new(
        config: UpgradeConfig,
        pool: Arc<dyn PoolCallbacks>,
    ) -> (Self, Box<dyn Http1Hooks>) {
        let (state_tx, state_rx) = watch::channel(UpgradeState::Started);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let reported_max_concurrent_requests =
            Arc::new(AtomicUsize::new(config.pending_max_concurrent_requests));
        let buffered = Arc::new(Mutex::new(BytesMut::new()));

        let hooks = UpgradeHooks {
            config,
            pool,
            state_tx,
            outcome_tx: Mutex::new(Some(outcome_tx)),
            injected: AtomicBool::new(false),
            buffered: buffered.clone(),
            reported_max_concurrent_requests: reported_max_concurrent_requests.clone(),
        };

        (
            Self {
                state_rx,
                outcome_rx: Mutex::new(Some(outcome_rx)),
                reported_max_concurrent_requests,
                buffered,
            },
            Box::new(hooks),
        )
    }

    pub fn state(&self) -> UpgradeState {
        *self.state_rx.borrow()
    }

    /// Reports `max_concurrent_requests = 1` until the negotiation
    /// completes; afterwards reflects whichever cap the outcome settled on
    /// (the HTTP/1.x pipeline depth if rejected, the HTTP/2 stream cap if
    /// accepted).
    pub fn max_concurrent_requests(&self) -> usize {
        self.reported_max_concurrent_requests.load(Ordering::Acquire)
    }

    /// Resolves once the negotiation reaches `COMPLETED`. A second call
    /// (after the first consumed the outcome) returns `None`.
    pub async fn completed(&self) -> Option<UpgradeOutcome> {
        let rx = self
            .outcome_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        rx.await.ok()
    }

    /// Drain whatever bytes `on_raw_bytes` has collected so far: the
    /// server's HTTP/2 preface/SETTINGS, read past the `101` response head
    /// before (or after) the caller observed [`UpgradeOutcome::Accepted`].
    /// These must reach the HTTP/2 engine before any further reads off the
    /// same transport, per spec §4.2's "completing HTTP/2 upgrade with the
    /// buffered bytes" handoff. Returns empty once nothing new has arrived
    /// since the last call.
    pub fn take_buffered(&self) -> Bytes {
        let mut buf = self.buffered.lock().unwrap_or_else(|e| e.into_inner());
        buf.split().freeze()
    }
}

struct UpgradeHooks {
    config: UpgradeConfig,
    pool: Arc<dyn PoolCallbacks>,
    state_tx: watch::Sender<UpgradeState>,
    outcome_tx: Mutex<Option<oneshot::Sender<UpgradeOutcome>>>,
    injected: AtomicBool,
    buffered: Arc<Mutex<BytesMut>>,
    reported_max_concurrent_requests: Arc<AtomicUsize>,
}

impl UpgradeHooks {
    fn set_state(&self, state: UpgradeState) {
        trace!(?state, "upgrade state transition");
        let _ = self.state_tx.send(state);
    }

    fn complete(&self, outcome: UpgradeOutcome, new_cap: usize) {
        self.set_state(UpgradeState::Prepared);
        self.reported_max_concurrent_requests
            .store(new_cap, Ordering::Release);
        self.pool.on_upgrade(new_cap);
        self.set_state(UpgradeState::Completed);
        if let Some(tx) = self.outcome_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(outcome);
        }
    }
}

impl Http1Hooks for UpgradeHooks {
    fn on_create_exchange(&mut self, headers: &mut HeaderMap) {
        // Only the first exchange carries the upgrade headers; any later
        // one (impossible while capacity is pinned to 1, but cheap to
        // guard) goes out unmodified.
        if self.injected.swap(true, Ordering::AcqRel) {
            return;
        }
        headers.insert(http::header::UPGRADE, http::HeaderValue::from_static("h2c"));
        headers.insert(
            http::header::CONNECTION,
            http::HeaderValue::from_static("Upgrade, HTTP2-Settings"),
        );
        if let Ok(value) = http::HeaderValue::from_str(&self.config.settings.to_base64url()) {
            headers.insert("http2-settings", value);
        }
    }

    fn on_response_head(&mut self, _id: ExchangeId, head: &ResponseHead) -> HookAction {
        if *self.state_tx.borrow() != UpgradeState::Started {
            return HookAction::Continue;
        }

        if head.status != http::StatusCode::SWITCHING_PROTOCOLS {
            // Rejected: fall back to treating this (and every later)
            // exchange as ordinary HTTP/1.x, and hand capacity back.
            debug!(status = head.status.as_u16(), "h2c upgrade rejected, falling back to http1");
            self.complete(UpgradeOutcome::Rejected, self.config.http1_max_concurrent_requests);
            return HookAction::Continue;
        }

        let upgrade_ok = head
            .headers
            .get(http::header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("h2c"));
        if !upgrade_ok {
            error!("101 response missing Upgrade: h2c, aborting connection");
            return HookAction::Fail(
                Error::new_http_client_upgrade().with("101 response missing Upgrade: h2c"),
            );
        }

        self.set_state(UpgradeState::Received);
        // The request that carried the upgrade headers was written
        // synchronously and in full before any response could arrive:
        // `max_concurrent_requests` is pinned to 1 for the duration of the
        // negotiation, so there is no partially sent pipelined request to
        // wait on. Accept immediately; any bytes that arrive bundled with
        // or after the 101 head still flow through `on_raw_bytes` below,
        // since the engine now routes all inbound chunks there once
        // `Intercepted` is returned.
        self.set_state(UpgradeState::FullyReceived);
        debug!(
            max_concurrent_streams = self.config.http2_max_concurrent_streams,
            "h2c upgrade accepted"
        );
        self.complete(
            UpgradeOutcome::Accepted,
            self.config.http2_max_concurrent_streams,
        );
        HookAction::Intercepted
    }

    fn on_raw_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let mut buf = self.buffered.lock().unwrap_or_else(|e| e.into_inner());
        buf.extend_from_slice(bytes);
        trace!(bytes = bytes.len(), buffered = buf.len(), "buffered post-101 bytes");
        if buf.len() > self.config.max_buffered_bytes {
            error!(
                buffered = buf.len(),
                max = self.config.max_buffered_bytes,
                "h2c upgrade buffer overflowed"
            );
            return Err(Error::new_message_buffer_overflow()
                .with(format!("h2c upgrade buffer exceeded {}", self.config.max_buffered_bytes)));
        }
        Ok(())
    }

    fn abort_connection_on_request_error(&self) -> bool {
        // Any request error during upgrade closes the connection; partial
        // upgrade state is unrecoverable.
        *self.state_tx.borrow() != UpgradeState::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::NoopPoolCallbacks;
    use http::{HeaderValue, StatusCode, Version};

    fn head(status: StatusCode, upgrade: Option<&str>) -> ResponseHead {
        let mut headers = HeaderMap::new();
        if let Some(u) = upgrade {
            headers.insert(http::header::UPGRADE, HeaderValue::from_str(u).unwrap());
        }
        ResponseHead {
            version: Version::HTTP_11,
            status,
            headers,
        }
    }

    #[test]
    fn injects_upgrade_headers_once() {
        let (_coord, mut hooks) = UpgradeCoordinator::new(
            UpgradeConfig::default(),
            Arc::new(NoopPoolCallbacks),
        );
        let mut first = HeaderMap::new();
        hooks.on_create_exchange(&mut first);
        assert_eq!(first.get(http::header::UPGRADE).unwrap(), "h2c");
        assert!(first.get("http2-settings").is_some());

        let mut second = HeaderMap::new();
        hooks.on_create_exchange(&mut second);
        assert!(second.get(http::header::UPGRADE).is_none());
    }

    #[test]
    fn rejects_non_101_and_reports_full_http1_capacity() {
        let (coord, mut hooks) = UpgradeCoordinator::new(
            UpgradeConfig::default(),
            Arc::new(NoopPoolCallbacks),
        );
        assert_eq!(coord.max_concurrent_requests(), 1);
        let action = hooks.on_response_head(0, &head(StatusCode::OK, None));
        assert!(matches!(action, HookAction::Continue));
        assert_eq!(coord.state(), UpgradeState::Completed);
        assert_eq!(coord.max_concurrent_requests(), 10);
    }

    #[test]
    fn rejects_101_without_matching_upgrade_header() {
        let (_coord, mut hooks) = UpgradeCoordinator::new(
            UpgradeConfig::default(),
            Arc::new(NoopPoolCallbacks),
        );
        let action = hooks.on_response_head(0, &head(StatusCode::SWITCHING_PROTOCOLS, Some("websocket")));
        assert!(matches!(action, HookAction::Fail(_)));
    }

    #[tokio::test]
    async fn accepts_101_h2c_and_reports_h2_capacity() {
        let (coord, mut hooks) = UpgradeCoordinator::new(
            UpgradeConfig::default(),
            Arc::new(NoopPoolCallbacks),
        );
        let action = hooks.on_response_head(0, &head(StatusCode::SWITCHING_PROTOCOLS, Some("h2c")));
        assert!(matches!(action, HookAction::Intercepted));
        assert_eq!(coord.max_concurrent_requests(), 100);
        let outcome = coord.completed().await.expect("outcome sent");
        assert_eq!(outcome, UpgradeOutcome::Accepted);
    }

    #[tokio::test]
    async fn buffered_preface_bytes_survive_past_the_accepted_outcome() {
        let (coord, mut hooks) = UpgradeCoordinator::new(
            UpgradeConfig::default(),
            Arc::new(NoopPoolCallbacks),
        );
        let action = hooks.on_response_head(0, &head(StatusCode::SWITCHING_PROTOCOLS, Some("h2c")));
        assert!(matches!(action, HookAction::Intercepted));

        // The outcome resolves before the preface bytes are read; a caller
        // must still be able to retrieve them afterwards rather than lose
        // them, since they were already handed to `on_raw_bytes` by then.
        let outcome = coord.completed().await.expect("outcome sent");
        assert_eq!(outcome, UpgradeOutcome::Accepted);

        hooks.on_raw_bytes(b"PRI * HTTP/2.0\r\n\r\n").expect("buffered ok");
        assert_eq!(&coord.take_buffered()[..], b"PRI * HTTP/2.0\r\n\r\n");
        // Draining is destructive: a second call with nothing new sees
        // nothing.
        assert!(coord.take_buffered().is_empty());
    }

    #[test]
    fn buffer_overflow_past_cap_is_reported() {
        let (_coord, mut hooks) = UpgradeCoordinator::new(
            UpgradeConfig {
                max_buffered_bytes: 8,
                ..UpgradeConfig::default()
            },
            Arc::new(NoopPoolCallbacks),
        );
        let _ = hooks.on_response_head(0, &head(StatusCode::SWITCHING_PROTOCOLS, Some("h2c")));
        let err = hooks.on_raw_bytes(b"0123456789").unwrap_err();
        assert_eq!(err.kind(), crate::error::Kind::MessageBufferOverflow);
    }
}
