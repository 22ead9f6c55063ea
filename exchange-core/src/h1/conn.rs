//! The HTTP/1.x connection driver: a pipeline of exchanges over a single
//! byte duplex.
//!
//! Some HTTP libraries drive a connection with a hand-rolled `Future`/`Poll`
//! state machine so one task can multiplex reading, writing and timers
//! without blocking on any of them. Here the same requirement (reads must
//! never stall behind an in-flight write) is met by splitting the duplex and
//! running the read half on its own task, forwarding decoded byte chunks
//! into the driver's `tokio::select!` loop over a bounded channel. The
//! driver itself is a plain `async fn` rather than a manual `Future` impl.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderMap, Method, Version};
use slab::Slab;
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn, Instrument};

use crate::error::{Error, Kind, Result};
use crate::exchange::{
    body_channel, BodySink, Exchange, ExchangeCommand, ExchangeId, FileRegionBody, RequestBody,
    RequestHandle, ResponseHandle,
};
use crate::pool::PoolCallbacks;
use crate::transport::Duplex;

use super::codec::{
    content_length_header, encode_chunk, encode_chunked_trailer, encode_request_head,
    try_parse_response_head, CHUNKED_TRANSFER_ENCODING_HEADER,
};
use super::hooks::{HookAction, Http1Hooks};
use super::{response_body_length, BodyLength};

/// Tunables for a single HTTP/1.x connection.
#[derive(Debug, Clone)]
pub struct Http1Config {
    pub max_concurrent_requests: usize,
    /// Deadline armed when an exchange is admitted. `Duration::ZERO` disables
    /// the timeout entirely.
    pub request_timeout: Duration,
    pub graceful_shutdown_timeout: Duration,
    pub supports_file_region: bool,
}

impl Default for Http1Config {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            request_timeout: Duration::from_secs(60),
            graceful_shutdown_timeout: Duration::from_secs(5),
            supports_file_region: true,
        }
    }
}

struct ConnState {
    closing: AtomicBool,
    closed: AtomicBool,
}

pub(crate) enum DriverCommand {
    Send(crate::exchange::EndpointExchange),
    Shutdown { ack: oneshot::Sender<Result<()>> },
    ShutdownGraceful { ack: oneshot::Sender<Result<()>> },
}

/// A cheaply cloneable handle to a running connection. The connection state
/// itself lives on the [`ConnectionDriver`] task; this handle only posts
/// commands to it.
#[derive(Clone)]
pub struct Http1Connection {
    cmd_tx: mpsc::UnboundedSender<DriverCommand>,
    state: Arc<ConnState>,
}

impl Http1Connection {
    /// Register a request. Resolves to the [`Exchange`] handle once
    /// admitted, or to a registration error (connection closing, at
    /// capacity, or the driver task is gone).
    pub fn send(&self, request: RequestHandle) -> oneshot::Receiver<Result<Exchange>> {
        let (tx, rx) = oneshot::channel();
        if self.state.closing.load(Ordering::Acquire) || self.state.closed.load(Ordering::Acquire)
        {
            let _ = tx.send(Err(Error::new_connection_closed()
                .with("connection is closing or already closed")));
            return rx;
        }
        let endpoint_exchange = crate::exchange::EndpointExchange {
            request,
            response_tx: tx,
        };
        if let Err(e) = self.cmd_tx.send(DriverCommand::Send(endpoint_exchange)) {
            if let DriverCommand::Send(crate::exchange::EndpointExchange { response_tx, .. }) = e.0
            {
                let _ = response_tx.send(Err(
                    Error::new_connection_closed().with("connection driver task is gone")
                ));
            }
        }
        rx
    }

    /// Tear the connection down immediately: every pending and in-flight
    /// exchange is disposed with `ConnectionClosed`.
    pub fn shutdown(&self) -> oneshot::Receiver<Result<()>> {
        self.state.closing.store(true, Ordering::Release);
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(DriverCommand::Shutdown { ack: tx }).is_err() {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Ok(()));
            return rx;
        }
        rx
    }

    /// Stop admitting new requests and close once the current queue drains
    /// or `graceful_shutdown_timeout` elapses, whichever comes first.
    pub fn shutdown_gracefully(&self) -> oneshot::Receiver<Result<()>> {
        self.state.closing.store(true, Ordering::Release);
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(DriverCommand::ShutdownGraceful { ack: tx })
            .is_err()
        {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Ok(()));
            return rx;
        }
        rx
    }

    pub fn is_closing(&self) -> bool {
        self.state.closing.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }
}

enum ReadEvent {
    Data(Bytes),
    Eof,
    Err(std::io::Error),
}

fn spawn_reader<R>(mut read_half: R) -> mpsc::Receiver<ReadEvent>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    let _ = tx.send(ReadEvent::Eof).await;
                    break;
                }
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if tx.send(ReadEvent::Data(chunk)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(ReadEvent::Err(e)).await;
                    break;
                }
            }
        }
    });
    rx
}

#[derive(Debug, Clone, Copy)]
enum ChunkParseState {
    Size,
    Data(u64),
    DataCrlf,
    Trailer,
    Done,
}

struct ExchangeSlot {
    request: RequestHandle,
    response_tx: Option<oneshot::Sender<Result<Arc<ResponseHandle>>>>,
    response_handle: Option<Arc<ResponseHandle>>,
    body_sink: Option<BodySink>,
    body_length: Option<BodyLength>,
    body_remaining: u64,
    chunk_state: ChunkParseState,
    #[allow(dead_code)]
    created_at: Instant,
    deadline: Option<tokio::time::Instant>,
    headers_written: bool,
    #[allow(dead_code)]
    request_complete: bool,
}

/// The task that owns a connection's mutable state. Spawn [`Self::run`] and
/// drive the connection through the paired [`Http1Connection`] handle.
pub struct ConnectionDriver<IO> {
    cmd_rx: mpsc::UnboundedReceiver<DriverCommand>,
    exchange_cmd_rx: mpsc::UnboundedReceiver<ExchangeCommand>,
    exchange_cmd_tx: mpsc::UnboundedSender<ExchangeCommand>,
    read_rx: mpsc::Receiver<ReadEvent>,
    write_half: WriteHalf<IO>,
    state: Arc<ConnState>,
    config: Http1Config,
    hooks: Box<dyn Http1Hooks>,
    pool: Arc<dyn PoolCallbacks>,
    exchanges: Slab<ExchangeSlot>,
    queue: VecDeque<ExchangeId>,
    responding: Option<ExchangeId>,
    read_buf: BytesMut,
    /// Set once a hook returns [`HookAction::Intercepted`] (the H2C upgrade
    /// coordinator, after a `101` response with `Upgrade: h2c`). While set,
    /// every inbound chunk is forwarded to `hooks.on_raw_bytes` instead of
    /// being parsed as a response object.
    intercepted: bool,
    /// Set once a response asks for `Connection: close`: no further
    /// exchanges are admitted and the connection shuts down once the
    /// responding exchange completes.
    close_after_current: bool,
}

impl<IO> ConnectionDriver<IO>
where
    IO: Duplex,
{
    pub fn new(
        io: IO,
        config: Http1Config,
        hooks: Box<dyn Http1Hooks>,
        pool: Arc<dyn PoolCallbacks>,
    ) -> (Http1Connection, Self) {
        let (read_half, write_half) = split(io);
        let read_rx = spawn_reader(read_half);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (exchange_cmd_tx, exchange_cmd_rx) = mpsc::unbounded_channel();
        let state = Arc::new(ConnState {
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let handle = Http1Connection {
            cmd_tx,
            state: state.clone(),
        };
        let driver = Self {
            cmd_rx,
            exchange_cmd_rx,
            exchange_cmd_tx,
            read_rx,
            write_half,
            state,
            config,
            hooks,
            pool,
            exchanges: Slab::new(),
            queue: VecDeque::new(),
            responding: None,
            read_buf: BytesMut::new(),
            intercepted: false,
            close_after_current: false,
        };
        (handle, driver)
    }

    /// Drive the connection until it closes, for any reason. Always returns
    /// `Ok(())`; failures are reported to the pool callbacks and to the
    /// exchanges in flight, not via this future's result.
    pub async fn run(mut self) -> Result<()> {
        let span = tracing::debug_span!("h1_connection");
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&mut self) -> Result<()> {
        loop {
            let sleep = match self.next_deadline() {
                Some(deadline) => tokio::time::sleep_until(deadline),
                None => tokio::time::sleep(Duration::from_secs(3600)),
            };
            tokio::pin!(sleep);

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(DriverCommand::Send(ex)) => self.admit(ex),
                        Some(DriverCommand::Shutdown { ack }) => {
                            self.fail_all(Error::new_connection_closed()).await;
                            self.close();
                            let _ = ack.send(Ok(()));
                            return Ok(());
                        }
                        Some(DriverCommand::ShutdownGraceful { ack }) => {
                            let drained = self.drain_with_timeout(self.config.graceful_shutdown_timeout).await;
                            self.fail_all(Error::new_connection_closed()).await;
                            self.close();
                            if drained {
                                let _ = ack.send(Ok(()));
                            } else {
                                let _ = ack.send(Err(Error::new_request_timeout()
                                    .with("graceful shutdown timed out with requests in flight")));
                            }
                            return Ok(());
                        }
                        None => {
                            self.close();
                            return Ok(());
                        }
                    }
                }
                cmd = self.exchange_cmd_rx.recv() => {
                    match cmd {
                        Some(ExchangeCommand::Reset { id, code }) => {
                            self.dispose_exchange(id, Error::new_exchange_reset(code));
                            self.fail_all(Error::new_exchange_reset(code)).await;
                            self.close();
                            return Ok(());
                        }
                        Some(ExchangeCommand::Dispose { id, cause }) => {
                            self.dispose_exchange(id, cause);
                        }
                        None => {}
                    }
                }
                event = self.read_rx.recv() => {
                    match event {
                        Some(ReadEvent::Data(chunk)) => {
                            trace!(bytes = chunk.len(), "read chunk from transport");
                            if let Err(e) = self.handle_inbound(chunk).await {
                                error!(error = %e, "inbound parse failed, tearing connection down");
                                self.pool.on_error(&e);
                                self.fail_all(e).await;
                                self.close();
                                return Ok(());
                            }
                        }
                        Some(ReadEvent::Eof) | None => {
                            debug!("peer closed the connection");
                            let cause = Error::new_connection_reset_by_peer();
                            self.pool.on_error(&cause);
                            self.fail_all(cause).await;
                            self.close();
                            return Ok(());
                        }
                        Some(ReadEvent::Err(e)) => {
                            error!(error = %e, "transport read failed, tearing connection down");
                            let cause = Error::from(e);
                            self.pool.on_error(&cause);
                            self.fail_all(cause).await;
                            self.close();
                            return Ok(());
                        }
                    }
                }
                _ = &mut sleep => {
                    if let Err(timed_out) = self.handle_timeout().await {
                        // Headers for this exchange already reached the wire:
                        // the connection's protocol state is unrecoverable.
                        // The timed-out exchange itself is reported as
                        // `RequestTimeout`; every other exchange still
                        // in-flight on this connection (pipelined ahead of
                        // or behind it) never timed out on its own account;
                        // it is only a casualty of the connection closing,
                        // so it is reported as a peer reset instead.
                        error!(exchange = ?timed_out, "exchange timed out with headers already written, closing connection");
                        self.dispose_exchange(timed_out, Error::new_request_timeout());
                        let reset = Error::new_connection_reset_by_peer()
                            .with("connection closed after previous request timed out");
                        self.pool.on_error(&reset);
                        self.fail_all(reset).await;
                        self.close();
                        return Ok(());
                    }
                }
            }

            if let Err(e) = self.try_advance_queue().await {
                error!(error = %e, "write failure aborted the connection, tearing down");
                self.pool.on_error(&e);
                self.fail_all(e).await;
                self.close();
                return Ok(());
            }

            if self.queue.is_empty() && self.state.closing.load(Ordering::Acquire) {
                self.close();
                return Ok(());
            }
        }
    }

    fn close(&mut self) {
        if !self.state.closed.swap(true, Ordering::AcqRel) {
            debug!("connection closed");
            self.pool.on_close();
        }
    }

    fn admit(&mut self, ex: crate::exchange::EndpointExchange) {
        if self.state.closing.load(Ordering::Acquire) || self.close_after_current {
            debug!("rejecting admission: connection is closing");
            let _ = ex.response_tx.send(Err(Error::new_connection_closed()
                .with("connection is closing")));
            return;
        }
        if self.queue.len() >= self.config.max_concurrent_requests {
            debug!(
                queued = self.queue.len(),
                "rejecting admission: at max_concurrent_requests"
            );
            let _ = ex.response_tx.send(Err(Error::new_connection_closed()
                .with("connection is at max_concurrent_requests")));
            return;
        }

        let mut request = ex.request;
        let _ = request.with_headers_mut(|h| self.hooks.on_create_exchange(h));

        let (response_tx, response_rx) = oneshot::channel();
        let deadline = if self.config.request_timeout.is_zero() {
            None
        } else {
            Some(tokio::time::Instant::now() + self.config.request_timeout)
        };

        let id = self.exchanges.insert(ExchangeSlot {
            request,
            response_tx: Some(response_tx),
            response_handle: None,
            body_sink: None,
            body_length: None,
            body_remaining: 0,
            chunk_state: ChunkParseState::Size,
            created_at: Instant::now(),
            deadline,
            headers_written: false,
            request_complete: false,
        });

        trace!(exchange = ?id, "admitting exchange");
        let exchange = Exchange::new(id, self.exchange_cmd_tx.clone(), response_rx);
        let _ = ex.response_tx.send(Ok(exchange));
        self.queue.push_back(id);
    }

    async fn try_advance_queue(&mut self) -> Result<()> {
        let pending: Vec<ExchangeId> = self
            .queue
            .iter()
            .copied()
            .filter(|id| {
                self.exchanges
                    .get(*id)
                    .map(|s| !s.headers_written)
                    .unwrap_or(false)
            })
            .collect();

        for id in pending {
            if let Err(e) = self.write_request(id).await {
                warn!(exchange = ?id, error = %e, "failed to write request");
                self.hooks.on_request_error(id, &e);
                let abort = self.hooks.abort_connection_on_request_error();
                self.dispose_exchange(id, reclassify(&e));
                if abort {
                    return Err(e);
                }
                continue;
            }
            trace!(exchange = ?id, "request written");
            self.hooks.on_request_complete(id);
            if self.responding.is_none() {
                self.responding = Some(id);
            }
        }
        Ok(())
    }

    async fn write_request(&mut self, id: ExchangeId) -> Result<()> {
        let (method, path, authority, headers) = {
            let slot = self
                .exchanges
                .get(id)
                .ok_or_else(|| Error::new_protocol_error().with("exchange vanished before write"))?;
            (
                slot.request.method.clone(),
                slot.request.path_builder().build(),
                slot.request.authority().clone(),
                slot.request.headers().clone(),
            )
        };

        let body = self
            .exchanges
            .get_mut(id)
            .and_then(|slot| slot.request.take_body());

        match body {
            None => {
                // A request with no body still gets an explicit zero length,
                // never an omitted framing header.
                self.write_head_and_framing(&method, &path, &authority, &headers, 0, None)
                    .await?;
            }
            Some(RequestBody::FileRegion(file_body)) => {
                self.write_head_and_framing(
                    &method,
                    &path,
                    &authority,
                    &headers,
                    file_body.len,
                    None,
                )
                .await?;
                write_file_region(&mut self.write_half, &file_body).await?;
            }
            Some(RequestBody::Chunks {
                content_length: Some(len),
                mut source,
            }) => {
                self.write_head_and_framing(&method, &path, &authority, &headers, len, None)
                    .await?;
                self.write_raw_chunk_stream(&mut source).await?;
            }
            Some(RequestBody::Chunks {
                content_length: None,
                mut source,
            }) => {
                self.write_unknown_length_body(&method, &path, &authority, &headers, &mut source)
                    .await?;
            }
        }

        if let Some(slot) = self.exchanges.get_mut(id) {
            slot.request.mark_headers_written();
            slot.headers_written = true;
            slot.request_complete = true;
        }
        Ok(())
    }

    /// Render the request line + header block with an explicit
    /// `Content-Length`, or with `framing` verbatim when the length is not
    /// yet known (the chunked case).
    async fn write_head_and_framing(
        &mut self,
        method: &Method,
        path: &str,
        authority: &crate::exchange::Authority,
        headers: &HeaderMap,
        content_length: u64,
        framing_override: Option<&str>,
    ) -> Result<()> {
        let framing = framing_override
            .map(str::to_string)
            .unwrap_or_else(|| content_length_header(content_length));
        let head = encode_request_head(
            method,
            path,
            Version::HTTP_11,
            authority,
            headers,
            Some(&framing),
        );
        self.write_half.write_all(&head).await?;
        Ok(())
    }

    /// Stream every chunk verbatim (the body's length is already known and
    /// framed via `Content-Length`).
    async fn write_raw_chunk_stream(
        &mut self,
        source: &mut std::pin::Pin<Box<dyn futures_core::Stream<Item = std::io::Result<Bytes>> + Send>>,
    ) -> Result<()> {
        use futures_util::StreamExt;
        while let Some(item) = source.next().await {
            let chunk = item.map_err(Error::from)?;
            self.write_half.write_all(&chunk).await?;
        }
        Ok(())
    }

    /// A body with no known length buffers its first chunk. If the source
    /// completes with zero chunks, emit an empty full message. If it
    /// completes with exactly one, emit a full message with
    /// `Content-Length` set to that chunk's size. Only once a *second*
    /// chunk arrives does the request switch to `Transfer-Encoding:
    /// chunked`, with the first two chunks flushed as the head is written.
    async fn write_unknown_length_body(
        &mut self,
        method: &Method,
        path: &str,
        authority: &crate::exchange::Authority,
        headers: &HeaderMap,
        source: &mut std::pin::Pin<Box<dyn futures_core::Stream<Item = std::io::Result<Bytes>> + Send>>,
    ) -> Result<()> {
        use futures_util::StreamExt;

        let Some(first) = source.next().await else {
            self.write_head_and_framing(method, path, authority, headers, 0, None)
                .await?;
            return Ok(());
        };
        let first = first.map_err(Error::from)?;

        let Some(second) = source.next().await else {
            self.write_head_and_framing(
                method,
                path,
                authority,
                headers,
                first.len() as u64,
                None,
            )
            .await?;
            self.write_half.write_all(&first).await?;
            return Ok(());
        };
        let second = second.map_err(Error::from)?;

        self.write_head_and_framing(
            method,
            path,
            authority,
            headers,
            0,
            Some(CHUNKED_TRANSFER_ENCODING_HEADER),
        )
        .await?;
        self.write_half.write_all(&encode_chunk(&first)).await?;
        self.write_half.write_all(&encode_chunk(&second)).await?;
        while let Some(item) = source.next().await {
            let chunk = item.map_err(Error::from)?;
            self.write_half.write_all(&encode_chunk(&chunk)).await?;
        }
        self.write_half
            .write_all(&encode_chunked_trailer(None))
            .await?;
        Ok(())
    }

    async fn handle_inbound(&mut self, chunk: Bytes) -> Result<()> {
        self.read_buf.extend_from_slice(&chunk);
        if self.intercepted {
            let bytes = self.read_buf.split_to(self.read_buf.len()).freeze();
            if !bytes.is_empty() {
                self.hooks.on_raw_bytes(&bytes)?;
            }
            return Ok(());
        }
        loop {
            let Some(id) = self.responding else {
                break;
            };
            let has_head = match self.exchanges.get(id) {
                Some(slot) => slot.response_handle.is_some(),
                None => {
                    self.responding = self.queue.front().copied();
                    continue;
                }
            };

            if !has_head {
                match try_parse_response_head(&self.read_buf)? {
                    None => break,
                    Some((head, consumed)) => {
                        self.read_buf.advance(consumed);
                        match self.hooks.on_response_head(id, &head) {
                            HookAction::Continue => {
                                trace!(exchange = ?id, status = head.status.as_u16(), "response head parsed");
                                self.install_response_head(id, head)?;
                            }
                            HookAction::Intercepted => {
                                debug!(exchange = ?id, "response head intercepted, switching to raw byte forwarding");
                                self.intercepted = true;
                                if !self.read_buf.is_empty() {
                                    let leftover = self.read_buf.split_to(self.read_buf.len()).freeze();
                                    self.hooks.on_raw_bytes(&leftover)?;
                                }
                                return Ok(());
                            }
                            HookAction::Fail(e) => {
                                error!(exchange = ?id, error = %e, "response head rejected by hooks");
                                return Err(e);
                            }
                        }
                    }
                }
            } else if !self.feed_body(id).await? {
                break;
            }
        }
        Ok(())
    }

    fn install_response_head(&mut self, id: ExchangeId, head: super::ResponseHead) -> Result<()> {
        let method = self
            .exchanges
            .get(id)
            .map(|s| s.request.method.clone())
            .unwrap_or(Method::GET);
        let length = response_body_length(&method, &head);
        let (sink, stream) = body_channel();
        let handle = Arc::new(ResponseHandle::new(head.status, head.headers, stream));
        if handle.requests_close() {
            // A `Connection: close` response evicts the connection from the
            // pool's rotation; no further exchanges are admitted, and the
            // connection shuts down once this one drains.
            debug!(exchange = ?id, "response requested Connection: close, draining");
            self.close_after_current = true;
        }

        let mut terminate = false;
        if let Some(slot) = self.exchanges.get_mut(id) {
            slot.body_length = Some(length);
            slot.body_remaining = match length {
                BodyLength::Known(n) => n,
                _ => 0,
            };
            slot.response_handle = Some(handle.clone());
            if let Some(tx) = slot.response_tx.take() {
                let _ = tx.send(Ok(handle));
            }
            if matches!(length, BodyLength::Empty) {
                terminate = true;
            } else {
                slot.body_sink = Some(sink);
            }
        }
        if terminate {
            self.terminate_exchange(id);
        }
        Ok(())
    }

    async fn feed_body(&mut self, id: ExchangeId) -> Result<bool> {
        let length = match self.exchanges.get(id) {
            Some(s) => s.body_length,
            None => return Ok(false),
        };
        match length {
            None | Some(BodyLength::Empty) => {
                self.terminate_exchange(id);
                Ok(true)
            }
            Some(BodyLength::Known(_)) => self.feed_known_body(id).await,
            Some(BodyLength::Chunked) => self.feed_chunked_body(id).await,
            Some(BodyLength::UntilClose) => self.feed_until_close_body(id).await,
        }
    }

    async fn feed_known_body(&mut self, id: ExchangeId) -> Result<bool> {
        let remaining = match self.exchanges.get(id) {
            Some(s) => s.body_remaining,
            None => return Ok(false),
        };
        if remaining == 0 {
            self.terminate_exchange(id);
            return Ok(true);
        }
        if self.read_buf.is_empty() {
            return Ok(false);
        }
        let take = remaining.min(self.read_buf.len() as u64) as usize;
        let chunk = self.read_buf.split_to(take).freeze();
        let remaining_after = remaining - take as u64;

        let mut sink_fut = None;
        if let Some(slot) = self.exchanges.get_mut(id) {
            slot.body_remaining = remaining_after;
            if let Some(sink) = slot.body_sink.as_mut() {
                sink_fut = Some(sink.send(chunk));
            }
        }
        if let Some(fut) = sink_fut {
            fut.await?;
        }

        if remaining_after == 0 {
            self.terminate_exchange(id);
        }
        Ok(true)
    }

    async fn feed_until_close_body(&mut self, id: ExchangeId) -> Result<bool> {
        if self.read_buf.is_empty() {
            return Ok(false);
        }
        let chunk = self.read_buf.split_to(self.read_buf.len()).freeze();
        if let Some(slot) = self.exchanges.get_mut(id) {
            if let Some(sink) = slot.body_sink.as_mut() {
                sink.send(chunk).await?;
            }
        }
        Ok(false)
    }

    async fn feed_chunked_body(&mut self, id: ExchangeId) -> Result<bool> {
        loop {
            let state = match self.exchanges.get(id) {
                Some(s) => s.chunk_state,
                None => return Ok(false),
            };
            match state {
                ChunkParseState::Size => {
                    let Some(pos) = find_crlf(&self.read_buf) else {
                        return Ok(false);
                    };
                    let line = self.read_buf.split_to(pos + 2);
                    let size_field = std::str::from_utf8(&line[..pos])
                        .map_err(|e| Error::new_protocol_error().with(e))?;
                    let size_field = size_field.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size_field, 16)
                        .map_err(|e| Error::new_protocol_error().with(e))?;
                    if let Some(slot) = self.exchanges.get_mut(id) {
                        slot.chunk_state = if size == 0 {
                            ChunkParseState::Trailer
                        } else {
                            ChunkParseState::Data(size)
                        };
                    }
                }
                ChunkParseState::Data(remaining) => {
                    if self.read_buf.is_empty() {
                        return Ok(false);
                    }
                    let take = remaining.min(self.read_buf.len() as u64) as usize;
                    let chunk = self.read_buf.split_to(take).freeze();
                    let remaining_after = remaining - take as u64;
                    let mut sink_fut = None;
                    if let Some(slot) = self.exchanges.get_mut(id) {
                        slot.chunk_state = if remaining_after == 0 {
                            ChunkParseState::DataCrlf
                        } else {
                            ChunkParseState::Data(remaining_after)
                        };
                        if let Some(sink) = slot.body_sink.as_mut() {
                            sink_fut = Some(sink.send(chunk));
                        }
                    }
                    if let Some(fut) = sink_fut {
                        fut.await?;
                    }
                }
                ChunkParseState::DataCrlf => {
                    if self.read_buf.len() < 2 {
                        return Ok(false);
                    }
                    self.read_buf.advance(2);
                    if let Some(slot) = self.exchanges.get_mut(id) {
                        slot.chunk_state = ChunkParseState::Size;
                    }
                }
                ChunkParseState::Trailer => {
                    let Some(pos) = find_double_crlf(&self.read_buf) else {
                        return Ok(false);
                    };
                    let block = self.read_buf.split_to(pos + 4);
                    let trailers = parse_trailer_headers(&block[..pos])?;
                    if let Some(slot) = self.exchanges.get(id) {
                        if !trailers.is_empty() {
                            if let Some(handle) = &slot.response_handle {
                                handle.set_trailers(trailers);
                            }
                        }
                    }
                    if let Some(slot) = self.exchanges.get_mut(id) {
                        slot.chunk_state = ChunkParseState::Done;
                    }
                    self.terminate_exchange(id);
                    return Ok(true);
                }
                ChunkParseState::Done => return Ok(true),
            }
        }
    }

    fn terminate_exchange(&mut self, id: ExchangeId) {
        if let Some(slot) = self.exchanges.get_mut(id) {
            slot.body_sink = None;
        }
        self.queue.retain(|&qid| qid != id);
        self.exchanges.try_remove(id);
        self.pool.on_exchange_terminate(id);
        if self.responding == Some(id) {
            self.responding = self.queue.front().copied();
        }
        if self.close_after_current {
            // A `Connection: close` response on the responding exchange
            // forces an immediate shutdown, not a graceful drain: any other
            // pipelined exchange still queued never gets its response and
            // is disposed with `ConnectionClosed`.
            self.state.closing.store(true, Ordering::Release);
            let remaining: Vec<ExchangeId> = self.exchanges.iter().map(|(id, _)| id).collect();
            for rid in remaining {
                self.dispose_exchange(rid, Error::new_connection_closed()
                    .with("connection closed after a Connection: close response"));
            }
            self.queue.clear();
            self.responding = None;
        }
    }

    fn dispose_exchange(&mut self, id: ExchangeId, cause: Error) {
        if let Some(mut slot) = self.exchanges.try_remove(id) {
            if let Some(tx) = slot.response_tx.take() {
                let _ = tx.send(Err(cause));
            }
            slot.body_sink = None;
        }
        self.queue.retain(|&qid| qid != id);
        if self.responding == Some(id) {
            self.responding = self.queue.front().copied();
        }
        self.pool.on_exchange_terminate(id);
    }

    async fn fail_all(&mut self, cause: Error) {
        let ids: Vec<ExchangeId> = self.exchanges.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.dispose_exchange(id, reclassify(&cause));
        }
        self.queue.clear();
        self.responding = None;
    }

    fn earliest_deadline(&self) -> Option<(ExchangeId, tokio::time::Instant)> {
        self.exchanges
            .iter()
            .filter_map(|(id, slot)| slot.deadline.map(|d| (id, d)))
            .min_by_key(|(_, d)| *d)
    }

    fn next_deadline(&self) -> Option<tokio::time::Instant> {
        self.earliest_deadline().map(|(_, d)| d)
    }

    /// Returns `Ok(())` when the tick was a no-op or resolved locally (a
    /// not-yet-written pipelined exchange timing out), or `Err` carrying
    /// the timed-out exchange's id when the connection is unrecoverable
    /// (its request headers had already reached the wire).
    async fn handle_timeout(&mut self) -> std::result::Result<(), ExchangeId> {
        let Some((id, deadline)) = self.earliest_deadline() else {
            return Ok(());
        };
        if deadline > tokio::time::Instant::now() {
            return Ok(());
        }
        let headers_written = self
            .exchanges
            .get(id)
            .map(|s| s.headers_written)
            .unwrap_or(false);
        if headers_written {
            Err(id)
        } else {
            self.dispose_exchange(id, Error::new_request_timeout());
            Ok(())
        }
    }

    async fn drain_with_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.queue.is_empty() {
            tokio::select! {
                cmd = self.exchange_cmd_rx.recv() => {
                    match cmd {
                        Some(ExchangeCommand::Dispose { id, cause }) => self.dispose_exchange(id, cause),
                        Some(ExchangeCommand::Reset { id, code }) => {
                            self.dispose_exchange(id, Error::new_exchange_reset(code));
                        }
                        None => break,
                    }
                }
                event = self.read_rx.recv() => {
                    match event {
                        Some(ReadEvent::Data(chunk)) => {
                            let _ = self.handle_inbound(chunk).await;
                        }
                        _ => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return false;
                }
            }
        }
        true
    }
}

fn reclassify(cause: &Error) -> Error {
    let msg = cause.to_string();
    let fresh = match cause.kind() {
        Kind::ConnectionClosed => Error::new_connection_closed(),
        Kind::ConnectionResetByPeer => Error::new_connection_reset_by_peer(),
        Kind::RequestTimeout => Error::new_request_timeout(),
        Kind::HttpClientUpgrade => Error::new_http_client_upgrade(),
        Kind::ExchangeReset => Error::new_exchange_reset(0),
        Kind::ProtocolError => Error::new_protocol_error(),
        Kind::MessageBufferOverflow => Error::new_message_buffer_overflow(),
        Kind::TooLongFrame => Error::new_too_long_frame(),
        Kind::ResourceNotReadable => Error::new_resource_not_readable(),
        Kind::UpgradeRejected => Error::new_upgrade_rejected(),
    };
    fresh.with(msg)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_trailer_headers(buf: &[u8]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in buf.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let Some(pos) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let name = http::HeaderName::from_bytes(&line[..pos])
            .map_err(|e| Error::new_protocol_error().with(e))?;
        let value = http::HeaderValue::from_bytes(line[pos + 1..].trim_ascii())
            .map_err(|e| Error::new_protocol_error().with(e))?;
        headers.append(name, value);
    }
    Ok(headers)
}

async fn write_file_region<W>(write: &mut W, body: &FileRegionBody) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    use std::io::{Read, Seek, SeekFrom};
    for region in body.regions() {
        let file = body.file.clone();
        let buf = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut f = &*file;
            f.seek(SeekFrom::Start(region.offset))?;
            let mut data = vec![0u8; region.len as usize];
            f.read_exact(&mut data)?;
            Ok(data)
        })
        .await
        .map_err(|e| Error::new_resource_not_readable().with(e))?
        .map_err(|e| Error::new_resource_not_readable().with(e))?;
        write.write_all(&buf).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Authority, PathBuilder};
    use crate::h1::NoopHooks;
    use crate::pool::NoopPoolCallbacks;
    use crate::transport::TransportInfo;
    use http::{Method, StatusCode};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn start_test_connection() -> (Http1Connection, DuplexStream) {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let (handle, driver) = ConnectionDriver::new(
            client_io,
            Http1Config::default(),
            Box::new(NoopHooks),
            Arc::new(NoopPoolCallbacks),
        );
        tokio::spawn(driver.run());
        (handle, server_io)
    }

    fn get_request() -> RequestHandle {
        let authority = Authority::new("example.com", None, "http");
        let handle = RequestHandle::new(
            Method::GET,
            authority,
            PathBuilder::new("/"),
            TransportInfo::plaintext(None, None),
            None,
        );
        Arc::try_unwrap(handle).unwrap_or_else(|_| unreachable!())
    }

    #[tokio::test]
    async fn roundtrip_without_body_resolves_response() {
        let (conn, mut server) = start_test_connection();
        let rx = conn.send(get_request());

        let mut buf = vec![0u8; 1024];
        let n = server.read(&mut buf).await.expect("read request");
        let sent = String::from_utf8_lossy(&buf[..n]);
        assert!(sent.starts_with("GET / HTTP/1.1\r\n"));
        assert!(sent.contains("host: example.com\r\n"));

        server
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .expect("write response");

        let exchange = rx.await.expect("oneshot alive").expect("registered");
        let response = exchange.response().await.expect("response resolves");
        assert_eq!(response.status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn chunked_body_is_delivered_and_trailers_captured() {
        let (conn, mut server) = start_test_connection();
        let rx = conn.send(get_request());

        let mut buf = vec![0u8; 1024];
        let _ = server.read(&mut buf).await.expect("read request");

        server
            .write_all(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                  5\r\nhello\r\n0\r\nx-trailer: done\r\n\r\n",
            )
            .await
            .expect("write chunked response");

        let exchange = rx.await.expect("oneshot alive").expect("registered");
        let response = exchange.response().await.expect("response resolves");
        let mut body = response.take_body().expect("body not yet taken");
        let chunk = body.next().await.expect("one chunk");
        assert_eq!(&chunk[..], b"hello");
        assert!(body.next().await.is_none());
        let trailers = response.trailers().expect("trailers captured");
        assert_eq!(trailers.get("x-trailer").unwrap(), "done");
    }

    #[tokio::test]
    async fn shutdown_rejects_new_sends() {
        let (conn, _server) = start_test_connection();
        conn.shutdown().await.expect("ack alive").expect("shuts down");
        let result = conn.send(get_request()).await.expect("oneshot alive");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn at_capacity_rejects_registration() {
        let (conn, _server) = {
            let (client_io, server_io) = tokio::io::duplex(8192);
            let config = Http1Config {
                max_concurrent_requests: 1,
                ..Http1Config::default()
            };
            let (handle, driver) = ConnectionDriver::new(
                client_io,
                config,
                Box::new(NoopHooks),
                Arc::new(NoopPoolCallbacks),
            );
            tokio::spawn(driver.run());
            (handle, server_io)
        };

        let _first = conn.send(get_request());
        // give the driver a tick to admit the first exchange
        tokio::task::yield_now().await;
        let second = conn.send(get_request()).await.expect("oneshot alive");
        assert!(second.is_err());
    }
}
