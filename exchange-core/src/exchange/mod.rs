//! The exchange object model: one request/response pair bound to one
//! connection.

pub mod body;
pub mod request;
pub mod response;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

pub use body::{FileRegion, FileRegionBody, RequestBody, MAX_FILE_REGION_LEN};
pub use request::{Authority, PathBuilder, RequestHandle};
pub use response::{body_channel, BodySink, BodyStream, ResponseHandle, StatusCategory};

/// Identifies an exchange within its connection's pipeline. Connections own
/// their exchanges in a `slab::Slab<ExchangeSlot>`; exchange handles only
/// hold this id plus a channel back to the connection, avoiding the
/// connection <-> exchange reference cycle the design notes call out.
pub type ExchangeId = usize;

/// What the caller hands to a connection: a method/path/headers/body plus a
/// one-shot channel that resolves to the started exchange or an error.
pub struct EndpointExchange {
    pub request: RequestHandle,
    pub response_tx: oneshot::Sender<Result<Exchange>>,
}

/// Commands an [`Exchange`] handle may post back to its connection. The
/// connection drains these on its own task, keeping connection state
/// mutated from a single place: off-executor calls are marshalled through
/// this channel instead of mutating shared state directly.
pub(crate) enum ExchangeCommand {
    Reset { id: ExchangeId, code: u32 },
    Dispose { id: ExchangeId, cause: Error },
}

/// A handle to a registered exchange, returned once it has been admitted
/// into a connection's pipeline.
///
/// Cloning is cheap (an id plus a channel sender); the connection is the
/// sole owner of exchange state.
#[derive(Clone)]
pub struct Exchange {
    id: ExchangeId,
    cmd_tx: mpsc::UnboundedSender<ExchangeCommand>,
    response_rx: std::sync::Arc<Mutex<Option<oneshot::Receiver<Result<std::sync::Arc<ResponseHandle>>>>>>,
    cancel_cause: std::sync::Arc<Mutex<Option<String>>>,
    disposed: std::sync::Arc<AtomicBool>,
    pub created_at: Instant,
}

impl Exchange {
    pub(crate) fn new(
        id: ExchangeId,
        cmd_tx: mpsc::UnboundedSender<ExchangeCommand>,
        response_rx: oneshot::Receiver<Result<std::sync::Arc<ResponseHandle>>>,
    ) -> Self {
        Self {
            id,
            cmd_tx,
            response_rx: std::sync::Arc::new(Mutex::new(Some(response_rx))),
            cancel_cause: std::sync::Arc::new(Mutex::new(None)),
            disposed: std::sync::Arc::new(AtomicBool::new(false)),
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ExchangeId {
        self.id
    }

    /// Resolves once when the response head arrives, or once with an error
    /// if the exchange is disposed first. A second call returns a "consumed
    /// elsewhere" error rather than panicking.
    pub async fn response(&self) -> Result<std::sync::Arc<ResponseHandle>> {
        let rx = self
            .response_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match rx {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| Err(Error::new_connection_closed().with("exchange dropped"))),
            None => Err(Error::new_protocol_error().with("response already awaited")),
        }
    }

    /// Mark this exchange reset with `code`, dispose it with
    /// `ExchangeReset(code)`, and close the owning connection. Always
    /// dispatched onto the connection's task via the command channel, even
    /// when called from that same task: posting to an unbounded channel the
    /// connection itself drains next tick is cheap and keeps a single code
    /// path rather than a synchronous fast path plus an async one.
    pub fn reset(&self, code: u32) {
        let _ = self.cmd_tx.send(ExchangeCommand::Reset { id: self.id, code });
    }

    pub fn dispose(&self, cause: Error) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.cancel_cause.lock().unwrap_or_else(|e| e.into_inner()) = Some(cause.to_string());
        let _ = self
            .cmd_tx
            .send(ExchangeCommand::Dispose { id: self.id, cause });
    }

    pub fn cancel_cause(&self) -> Option<String> {
        self.cancel_cause.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn response_future_resolves_exactly_once() {
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        let (resp_tx, resp_rx) = oneshot::channel();
        let exchange = Exchange::new(0, cmd_tx, resp_rx);
        drop(resp_tx);
        let err = exchange.response().await.unwrap_err();
        assert!(err.is_closed());
        let second = exchange.response().await.unwrap_err();
        assert_eq!(format!("{second}"), "protocol error");
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let (_resp_tx, resp_rx) = oneshot::channel();
        let exchange = Exchange::new(0, cmd_tx, resp_rx);
        exchange.dispose(Error::new_connection_closed());
        exchange.dispose(Error::new_connection_closed());
        let mut count = 0;
        while cmd_rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 1);
    }
}
