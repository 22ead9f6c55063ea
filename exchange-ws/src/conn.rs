//! The WebSocket connection engine: frame/message assembly, exclusive
//! inbound subscription, outbound publishers, and the close handshake.
//!
//! Constructed the same way `exchange_core::h1::ConnectionDriver` is: a
//! cheaply cloneable handle posts commands to a task that owns all mutable
//! state, with the duplex's read half running on its own task so reads are
//! never blocked behind an in-flight write (see that module's doc comment
//! for the rationale). The connection is handed an already-upgraded duplex
//! plus whatever bytes were read past the `101` response during the
//! opening handshake (mirroring `UpgradeOutcome::Accepted`'s `buffered`
//! field in the H2C coordinator) — performing the handshake itself is
//! [`crate::handshake`]'s job, not this module's.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn, Instrument};

use crate::close::{self, NORMAL_CLOSURE};
use crate::config::WsConfig;
use crate::error::{Error, Kind, Result};
use crate::frame::{encode_frame, try_decode_frame, Decoded, Frame, OpCode, MAX_CONTROL_FRAME_LEN};
use crate::message::{Message, MessageAssembler};

/// Minimal duplex bound required to drive a WebSocket connection. Mirrors
/// `exchange_core::transport::Duplex` without pulling in a dependency on
/// that crate, since a WebSocket engine may equally be handed a duplex that
/// never went through `exchange-core` at all (a raw TLS stream dialed
/// directly, say).
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Duplex for T {}

enum ReadEvent {
    Data(Bytes),
    Eof,
    Err(std::io::Error),
}

fn spawn_reader<R>(mut read_half: R) -> mpsc::Receiver<ReadEvent>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    use tokio::io::AsyncReadExt;
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

struct ConnState {
    closed: AtomicBool,
    subscribed: AtomicBool,
}

enum DriverCommand {
    SubscribeFrames(oneshot::Sender<Result<mpsc::Receiver<Frame>>>),
    SubscribeMessages(oneshot::Sender<Result<mpsc::Receiver<Message>>>),
    SendFrames(Pin<Box<dyn Stream<Item = Frame> + Send>>),
    SendMessages(Pin<Box<dyn Stream<Item = Message> + Send>>),
    Close {
        code: u16,
        reason: String,
        ack: oneshot::Sender<Result<()>>,
    },
}

/// A cheaply cloneable handle to a running WebSocket connection. All
/// mutable state lives on the [`ConnectionDriver`] task; this handle only
/// posts commands to it.
#[derive(Clone)]
pub struct WebSocketConnection {
    cmd_tx: mpsc::UnboundedSender<DriverCommand>,
    state: Arc<ConnState>,
    sub_protocol: Option<String>,
    max_frame_size: Option<usize>,
}

/// A stream of every inbound frame, control and data alike, exactly as
/// they arrived. PING/PONG/CLOSE are still handled internally by the
/// engine (auto-pong, close handshake) even while subscribed here — this
/// is a visibility tap, not a takeover of control-frame handling.
pub struct Frames {
    inner: mpsc::Receiver<Frame>,
}

impl Frames {
    pub async fn next(&mut self) -> Option<Frame> {
        self.inner.recv().await
    }
}

/// A stream of assembled messages (a TEXT or BINARY frame plus any
/// CONTINUATION frames that complete it).
pub struct Messages {
    inner: mpsc::Receiver<Message>,
}

impl Messages {
    pub async fn next(&mut self) -> Option<Message> {
        self.inner.recv().await
    }
}

/// [`Messages`] filtered to only the `Text` variant.
pub struct TextMessages {
    inner: mpsc::Receiver<Message>,
}

impl TextMessages {
    pub async fn next(&mut self) -> Option<String> {
        loop {
            match self.inner.recv().await? {
                Message::Text(text) => return Some(text),
                Message::Binary(_) => continue,
            }
        }
    }
}

/// [`Messages`] filtered to only the `Binary` variant.
pub struct BinaryMessages {
    inner: mpsc::Receiver<Message>,
}

impl BinaryMessages {
    pub async fn next(&mut self) -> Option<Bytes> {
        loop {
            match self.inner.recv().await? {
                Message::Binary(bytes) => return Some(bytes),
                Message::Text(_) => continue,
            }
        }
    }
}

/// Builds frames for the outbound publisher, enforcing `max_frame_size`
/// (and, for PING/PONG, the unconditional 125-byte control-frame cap).
#[derive(Debug, Clone, Copy)]
pub struct FrameFactory {
    max_frame_size: Option<usize>,
}

impl FrameFactory {
    pub(crate) fn new(max_frame_size: Option<usize>) -> Self {
        Self { max_frame_size }
    }

    fn check_data_len(&self, len: usize) -> Result<()> {
        if let Some(max) = self.max_frame_size {
            if len > max {
                return Err(Error::new_too_long_frame()
                    .with(format!("frame payload {len} exceeds max_frame_size {max}")));
            }
        }
        Ok(())
    }

    pub fn text(&self, payload: impl Into<Bytes>) -> Result<Frame> {
        let payload = payload.into();
        self.check_data_len(payload.len())?;
        Ok(Frame::text(payload))
    }

    pub fn binary(&self, payload: impl Into<Bytes>) -> Result<Frame> {
        let payload = payload.into();
        self.check_data_len(payload.len())?;
        Ok(Frame::binary(payload))
    }

    pub fn ping(&self, payload: Bytes) -> Result<Frame> {
        Frame::ping(payload)
    }

    pub fn pong(&self, payload: Bytes) -> Result<Frame> {
        Frame::pong(payload)
    }
}

impl WebSocketConnection {
    /// The subprotocol negotiated during the opening handshake, if any.
    pub fn sub_protocol(&self) -> Option<&str> {
        self.sub_protocol.as_deref()
    }

    fn claim_subscription(&self) -> Result<()> {
        if self.state.subscribed.swap(true, Ordering::AcqRel) {
            return Err(Error::new_already_subscribed());
        }
        Ok(())
    }

    /// Subscribe to every inbound frame as-is. Fails if any of
    /// `frames`/`messages`/`text_messages`/`binary_messages` was already
    /// subscribed.
    pub async fn frames(&self) -> Result<Frames> {
        self.claim_subscription()?;
        let (tx, rx) = oneshot::channel();
        self.send_cmd(DriverCommand::SubscribeFrames(tx))?;
        let inner = rx
            .await
            .unwrap_or_else(|_| Err(Error::new_connection_closed().with("driver task is gone")))?;
        Ok(Frames { inner })
    }

    /// Subscribe to assembled TEXT/BINARY messages.
    pub async fn messages(&self) -> Result<Messages> {
        self.claim_subscription()?;
        let (tx, rx) = oneshot::channel();
        self.send_cmd(DriverCommand::SubscribeMessages(tx))?;
        let inner = rx
            .await
            .unwrap_or_else(|_| Err(Error::new_connection_closed().with("driver task is gone")))?;
        Ok(Messages { inner })
    }

    pub async fn text_messages(&self) -> Result<TextMessages> {
        self.claim_subscription()?;
        let (tx, rx) = oneshot::channel();
        self.send_cmd(DriverCommand::SubscribeMessages(tx))?;
        let inner = rx
            .await
            .unwrap_or_else(|_| Err(Error::new_connection_closed().with("driver task is gone")))?;
        Ok(TextMessages { inner })
    }

    pub async fn binary_messages(&self) -> Result<BinaryMessages> {
        self.claim_subscription()?;
        let (tx, rx) = oneshot::channel();
        self.send_cmd(DriverCommand::SubscribeMessages(tx))?;
        let inner = rx
            .await
            .unwrap_or_else(|_| Err(Error::new_connection_closed().with("driver task is gone")))?;
        Ok(BinaryMessages { inner })
    }

    /// Install an outbound frame publisher, built from the given
    /// [`FrameFactory`]. Replaces any previously installed outbound
    /// publisher (frames or messages).
    pub fn send_frames<F, S>(&self, build: F) -> Result<()>
    where
        F: FnOnce(FrameFactory) -> S,
        S: Stream<Item = Frame> + Send + 'static,
    {
        let factory = FrameFactory::new(self.max_frame_size);
        let stream = build(factory);
        self.send_cmd(DriverCommand::SendFrames(Box::pin(stream)))
    }

    /// Install an outbound message publisher.
    pub fn send_messages<S>(&self, source: S) -> Result<()>
    where
        S: Stream<Item = Message> + Send + 'static,
    {
        self.send_cmd(DriverCommand::SendMessages(Box::pin(source)))
    }

    /// `close(NORMAL_CLOSURE, "Normal Closure")`.
    pub async fn close(&self) -> Result<()> {
        self.close_with(NORMAL_CLOSURE, "Normal Closure").await
    }

    /// Send a CLOSE frame carrying `code`/`reason` (the reason is
    /// truncated so the total payload stays within 125 bytes) and wait for
    /// it to reach the wire. Does not block on the peer's answering CLOSE
    /// frame. A no-op, returning `Ok(())` immediately, if this socket was
    /// already closed.
    pub async fn close_with(&self, code: u16, reason: &str) -> Result<()> {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send_cmd(DriverCommand::Close {
            code,
            reason: reason.to_string(),
            ack: ack_tx,
        })?;
        ack_rx
            .await
            .unwrap_or(Err(Error::new_connection_closed().with("driver task is gone")))
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    fn send_cmd(&self, cmd: DriverCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| Error::new_connection_closed().with("driver task is gone"))
    }
}

enum Inbound {
    Frames(mpsc::Sender<Frame>),
    Messages(mpsc::Sender<Message>),
}

enum Outbound {
    None,
    Frames(Pin<Box<dyn Stream<Item = Frame> + Send>>),
    Messages(Pin<Box<dyn Stream<Item = Message> + Send>>),
}

/// The task that owns a WebSocket connection's mutable state. Spawn
/// [`Self::run`] and drive the connection through the paired
/// [`WebSocketConnection`] handle.
pub struct ConnectionDriver<IO> {
    cmd_rx: mpsc::UnboundedReceiver<DriverCommand>,
    read_rx: mpsc::Receiver<ReadEvent>,
    write_half: WriteHalf<IO>,
    state: Arc<ConnState>,
    config: WsConfig,
    read_buf: BytesMut,
    inbound: Option<Inbound>,
    assembler: MessageAssembler,
    outbound: Outbound,
    close_sent: bool,
    close_received: bool,
}

impl<IO> ConnectionDriver<IO>
where
    IO: Duplex,
{
    /// Build a connection over an already-upgraded duplex. `buffered` is
    /// whatever bytes were read past the `101` response during the opening
    /// handshake and must be fed in before any further socket reads.
    pub fn new(
        io: IO,
        config: WsConfig,
        buffered: Bytes,
        sub_protocol: Option<String>,
    ) -> (WebSocketConnection, Self) {
        let (read_half, write_half) = split(io);
        let read_rx = spawn_reader(read_half);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let state = Arc::new(ConnState {
            closed: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
        });

        let mut read_buf = BytesMut::new();
        read_buf.extend_from_slice(&buffered);

        let handle = WebSocketConnection {
            cmd_tx,
            state: state.clone(),
            sub_protocol,
            max_frame_size: config.max_frame_size,
        };
        let max_message_size = config.max_message_size;
        let driver = Self {
            cmd_rx,
            read_rx,
            write_half,
            state,
            config,
            read_buf,
            inbound: None,
            assembler: MessageAssembler::new(max_message_size),
            outbound: Outbound::None,
            close_sent: false,
            close_received: false,
        };
        (handle, driver)
    }

    /// Drive the connection until the close handshake completes or the
    /// transport fails. Always returns `Ok(())`; failures tear inbound
    /// subscribers down by dropping their channel rather than surfacing
    /// through this future's result.
    pub async fn run(mut self) -> Result<()> {
        let span = tracing::debug_span!("ws_connection");
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await?,
                        None => {
                            self.teardown();
                            return Ok(());
                        }
                    }
                }
                event = self.read_rx.recv() => {
                    match event {
                        Some(ReadEvent::Data(chunk)) => {
                            if self.handle_inbound(chunk).await.is_err() {
                                self.teardown();
                                return Ok(());
                            }
                        }
                        _ => {
                            self.teardown();
                            return Ok(());
                        }
                    }
                }
                item = next_outbound(&mut self.outbound) => {
                    match item {
                        OutboundItem::Frame(frame) => {
                            if self.write_frame(frame).await.is_err() {
                                self.teardown();
                                return Ok(());
                            }
                        }
                        OutboundItem::Message(message) => {
                            let frames = message.into_frames(self.config.max_frame_size);
                            let mut failed = false;
                            for frame in frames {
                                if self.write_frame(frame).await.is_err() {
                                    failed = true;
                                    break;
                                }
                            }
                            if failed {
                                self.teardown();
                                return Ok(());
                            }
                        }
                        OutboundItem::Done => {
                            self.outbound = Outbound::None;
                            if self.config.close_on_complete {
                                let _ = self.initiate_close(NORMAL_CLOSURE, "Normal Closure").await;
                            }
                        }
                    }
                }
            }

            if self.close_sent && self.close_received {
                self.teardown();
                return Ok(());
            }
        }
    }

    fn teardown(&mut self) {
        debug!("connection torn down");
        self.state.closed.store(true, Ordering::Release);
        self.inbound = None;
    }

    async fn handle_command(&mut self, cmd: DriverCommand) -> Result<()> {
        match cmd {
            DriverCommand::SubscribeFrames(ack) => {
                if self.inbound.is_some() {
                    let _ = ack.send(Err(Error::new_already_subscribed()));
                } else {
                    let (tx, rx) = mpsc::channel(32);
                    self.inbound = Some(Inbound::Frames(tx));
                    let _ = ack.send(Ok(rx));
                }
            }
            DriverCommand::SubscribeMessages(ack) => {
                if self.inbound.is_some() {
                    let _ = ack.send(Err(Error::new_already_subscribed()));
                } else {
                    let (tx, rx) = mpsc::channel(32);
                    self.inbound = Some(Inbound::Messages(tx));
                    let _ = ack.send(Ok(rx));
                }
            }
            DriverCommand::SendFrames(stream) => {
                self.outbound = Outbound::Frames(stream);
            }
            DriverCommand::SendMessages(stream) => {
                self.outbound = Outbound::Messages(stream);
            }
            DriverCommand::Close { code, reason, ack } => {
                let result = self.initiate_close(code, &reason).await;
                let _ = ack.send(result);
            }
        }
        Ok(())
    }

    async fn handle_inbound(&mut self, chunk: Bytes) -> Result<()> {
        self.read_buf.extend_from_slice(&chunk);
        loop {
            let expect_masked = false; // client: inbound server frames are never masked
            let decoded = match try_decode_frame(&self.read_buf, self.config.max_frame_size, expect_masked) {
                Ok(decoded) => decoded,
                Err(e) => {
                    let code = close_code_for(e.kind());
                    error!(error = %e, close_code = code, "inbound frame decode failed, closing");
                    let _ = self.initiate_close(code, "").await;
                    return Err(e);
                }
            };
            let (frame, consumed) = match decoded {
                Decoded::Incomplete => return Ok(()),
                Decoded::Frame { frame, consumed, .. } => (frame, consumed),
            };
            self.read_buf.advance(consumed);
            self.dispatch_frame(frame).await?;
        }
    }

    async fn dispatch_frame(&mut self, frame: Frame) -> Result<()> {
        match frame.opcode() {
            OpCode::Close => {
                let peer_code_sendable_default = NORMAL_CLOSURE;
                let payload = frame.payload().clone();
                let (peer_code, _peer_reason) =
                    close::parse_close_payload(&payload).unwrap_or((peer_code_sendable_default, String::new()));
                debug!(peer_code, "received close frame");
                self.close_received = true;
                if !self.close_sent {
                    let code = if close::is_sendable(peer_code) {
                        peer_code
                    } else {
                        NORMAL_CLOSURE
                    };
                    self.initiate_close(code, "").await?;
                }
            }
            OpCode::Ping => {
                trace!("received ping, replying with pong");
                if let Some(Inbound::Frames(tx)) = &self.inbound {
                    let _ = tx.send(frame.clone()).await;
                }
                let payload = frame.into_payload();
                let pong = Frame::pong(payload)?;
                self.write_frame(pong).await?;
            }
            OpCode::Pong => {
                trace!("received pong");
                if let Some(Inbound::Frames(tx)) = &self.inbound {
                    let _ = tx.send(frame).await;
                }
            }
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                self.dispatch_data_frame(frame).await?;
            }
        }
        Ok(())
    }

    async fn dispatch_data_frame(&mut self, frame: Frame) -> Result<()> {
        match &self.inbound {
            Some(Inbound::Frames(tx)) => {
                let _ = tx.send(frame).await;
            }
            Some(Inbound::Messages(_)) => {
                match self.assembler.push(frame) {
                    Ok(Some(message)) => {
                        trace!("assembled message complete");
                        if let Some(Inbound::Messages(tx)) = &self.inbound {
                            let _ = tx.send(message).await;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let code = close_code_for(e.kind());
                        error!(error = %e, close_code = code, "message assembly failed, closing");
                        let _ = self.initiate_close(code, "").await;
                        return Err(e);
                    }
                }
            }
            None => {
                // No subscriber yet: data frames arriving before a
                // subscription is installed are dropped rather than
                // buffered, matching the "never buffer an unbounded
                // queue" design note. Control frames are still handled
                // above regardless of subscription state.
                trace!("dropping data frame, no inbound subscription installed yet");
            }
        }
        Ok(())
    }

    async fn initiate_close(&mut self, code: u16, reason: &str) -> Result<()> {
        if self.close_sent {
            return Ok(());
        }
        debug!(code, "sending close frame");
        self.close_sent = true;
        let frame = match close::build_close_frame(code, reason) {
            Ok(frame) => frame,
            Err(_) => close::build_close_frame(NORMAL_CLOSURE, "")?,
        };
        self.write_frame(frame).await
    }

    async fn write_frame(&mut self, frame: Frame) -> Result<()> {
        let opcode = frame.opcode();
        let fin = frame.is_final();
        let payload = frame.into_payload();
        if payload.len() > MAX_CONTROL_FRAME_LEN && opcode.is_control() {
            return Err(Error::new_protocol_error().with("control frame payload exceeds 125 bytes"));
        }
        let encoded = encode_frame(opcode, fin, &payload, true);
        self.write_half.write_all(&encoded).await.map_err(Error::from)
    }
}

fn close_code_for(kind: Kind) -> u16 {
    match kind {
        Kind::InvalidPayloadData => close::INVALID_PAYLOAD_DATA,
        Kind::TooLongFrame => close::MESSAGE_TOO_BIG,
        _ => close::PROTOCOL_ERROR,
    }
}

enum OutboundItem {
    Frame(Frame),
    Message(Message),
    Done,
}

/// Poll whichever outbound publisher (if any) is installed. Pends forever
/// when none is, so this is always safe to race in a `select!` alongside
/// inbound reads and commands.
async fn next_outbound(outbound: &mut Outbound) -> OutboundItem {
    match outbound {
        Outbound::Frames(stream) => match stream.next().await {
            Some(frame) => OutboundItem::Frame(frame),
            None => OutboundItem::Done,
        },
        Outbound::Messages(stream) => match stream.next().await {
            Some(message) => OutboundItem::Message(message),
            None => OutboundItem::Done,
        },
        Outbound::None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn start_test_connection(config: WsConfig) -> (WebSocketConnection, DuplexStream) {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let (handle, driver) = ConnectionDriver::new(client_io, config, Bytes::new(), None);
        tokio::spawn(driver.run());
        (handle, server_io)
    }

    #[tokio::test]
    async fn text_messages_round_trip_and_filter_binary() {
        let (conn, mut server) = start_test_connection(WsConfig::default());
        let mut text = conn.text_messages().await.expect("subscribe text");

        server
            .write_all(&encode_frame(OpCode::Binary, true, b"ignored", false))
            .await
            .expect("write binary");
        server
            .write_all(&encode_frame(OpCode::Text, true, b"hello", false))
            .await
            .expect("write text");

        let got = text.next().await.expect("one text message");
        assert_eq!(got, "hello");
    }

    #[tokio::test]
    async fn second_subscription_is_rejected() {
        let (conn, _server) = start_test_connection(WsConfig::default());
        let _first = conn.frames().await.expect("first subscription");
        let second = conn.messages().await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (conn, mut server) = start_test_connection(WsConfig::default());
        let _frames = conn.frames().await.expect("subscribe frames");

        server
            .write_all(&encode_frame(OpCode::Ping, true, b"hi", false))
            .await
            .expect("write ping");

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.expect("read pong");
        let decoded = try_decode_frame(&buf[..n], None, true).expect("decode");
        match decoded {
            Decoded::Frame { frame, .. } => {
                assert_eq!(frame.opcode(), OpCode::Pong);
                assert_eq!(frame.payload().as_ref(), b"hi");
            }
            Decoded::Incomplete => panic!("expected a complete pong frame"),
        }
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (conn, mut server) = start_test_connection(WsConfig::default());
        // Drain the close frame the first call writes so the driver task
        // doesn't block forever on a full duplex buffer.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 256];
            loop {
                if server.read(&mut buf).await.unwrap_or(0) == 0 {
                    break;
                }
            }
        });

        let first = conn.close().await;
        assert!(first.is_ok());
        let second = conn.close().await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn outbound_messages_are_framed_and_written() {
        let (conn, mut server) = start_test_connection(WsConfig::default());
        conn.send_messages(stream::iter(vec![Message::Text("hi".to_string())]))
            .expect("install outbound");

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.expect("read frame");
        let decoded = try_decode_frame(&buf[..n], None, true).expect("decode");
        match decoded {
            Decoded::Frame { frame, .. } => {
                assert_eq!(frame.opcode(), OpCode::Text);
                assert_eq!(frame.into_payload().as_ref(), b"hi");
            }
            Decoded::Incomplete => panic!("expected a complete frame"),
        }
    }
}
