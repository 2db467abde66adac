use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError, OwnedPermit};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Maximum close-reason length allowed by RFC 6455 (125 minus the code).
const MAX_CLOSE_REASON: usize = 123;

/// Anything that reads and writes WebSocket messages the way a
/// `tokio_tungstenite::WebSocketStream` does.
pub trait FrameStream:
    Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send
{
}

impl<T> FrameStream for T where
    T: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send
{
}

/// Per-session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Client frames that may wait for the upstream to open. One more
    /// terminates the session.
    pub buffer_capacity: usize,
    /// Frames queued toward each side while its writer catches up. A full
    /// queue pauses reading from the opposite side only.
    pub write_queue_depth: usize,
    /// Interval between upstream pings while open. `None` disables them.
    pub keepalive_interval: Option<Duration>,
    /// Upper bound for draining a side and sending its close frame during
    /// teardown.
    pub close_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 256,
            write_queue_depth: 64,
            keepalive_interval: Some(Duration::from_secs(30)),
            close_timeout: Duration::from_secs(2),
        }
    }
}

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Upstream dial in progress; client frames are buffered.
    Connecting,
    /// Both legs open; frames are forwarded directly.
    Open,
    /// Both legs released.
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// The client sent a close frame.
    ClientClosed(Option<CloseFrame>),
    ClientError(String),
    /// The upstream sent a close frame.
    UpstreamClosed(Option<CloseFrame>),
    UpstreamError(String),
    /// More frames arrived before the upstream opened than the buffer holds.
    BufferOverflow { capacity: usize },
    /// Resolution or dial of the upstream failed.
    DialFailed(String),
}

impl CloseCause {
    /// Close frames to send to the client and to the upstream, in that
    /// order. `None` means the side needs no frame of its own: it either
    /// initiated the close (the protocol layer answers it) or is gone.
    fn close_frames(&self) -> (Option<CloseFrame>, Option<CloseFrame>) {
        match self {
            Self::ClientClosed(frame) => (None, Some(mirror(frame))),
            Self::ClientError(_) => (None, Some(close_frame(CloseCode::Away, "client went away"))),
            Self::UpstreamClosed(frame) => (Some(mirror(frame)), None),
            Self::UpstreamError(_) => (
                Some(close_frame(CloseCode::Error, "upstream connection lost")),
                None,
            ),
            Self::BufferOverflow { .. } => (
                Some(close_frame(
                    CloseCode::Again,
                    "upstream not ready: relay buffer full",
                )),
                None,
            ),
            Self::DialFailed(reason) => (Some(close_frame(CloseCode::Error, reason)), None),
        }
    }
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClosed(_) => f.write_str("client closed"),
            Self::ClientError(err) => write!(f, "client error: {err}"),
            Self::UpstreamClosed(_) => f.write_str("upstream closed"),
            Self::UpstreamError(err) => write!(f, "upstream error: {err}"),
            Self::BufferOverflow { capacity } => {
                write!(f, "buffer overflow ({capacity} frames)")
            }
            Self::DialFailed(err) => write!(f, "dial failed: {err}"),
        }
    }
}

type Frame = Option<Result<Message, WsError>>;

#[derive(Debug, Clone, Copy)]
enum Side {
    Client,
    Upstream,
}

/// One input to the state machine. A frame read while a queue slot toward
/// the opposite side was free carries the reserved slot with it.
enum Event<U> {
    Client(Option<OwnedPermit<Message>>, Frame),
    Upstream(Option<OwnedPermit<Message>>, Frame),
    Dialed(Result<U, String>),
    WriterEnded(Side, Result<(), String>),
    Keepalive,
}

/// The write half of one leg, drained by its own task.
struct Writer {
    queue: mpsc::Sender<Message>,
    task: Option<JoinHandle<Result<(), String>>>,
}

impl Writer {
    fn spawn<S>(id: uuid::Uuid, side: Side, sink: SplitSink<S, Message>, depth: usize) -> Self
    where
        S: FrameStream + 'static,
    {
        let (queue, outbox) = mpsc::channel(depth.max(1));
        Self {
            queue,
            task: Some(tokio::spawn(pump(id, side, sink, outbox))),
        }
    }

    /// Queue the close frame behind any pending frames, let the writer
    /// drain and close its sink. A writer that cannot finish within
    /// `timeout` is aborted.
    async fn shutdown(self, frame: Option<CloseFrame>, timeout: Duration) {
        let Self { queue, task } = self;
        let Some(mut task) = task else {
            return;
        };

        let drain = async {
            if let Some(frame) = frame {
                let _ = queue.send(Message::Close(Some(frame))).await;
            }
            drop(queue);
            let _ = (&mut task).await;
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            task.abort();
        }
    }
}

/// Write every queued frame to `sink`, in order.
///
/// Returns `Err` only when the side has disconnected. Other write failures
/// drop that frame. Keepalive pings never end the writer.
async fn pump<S>(
    id: uuid::Uuid,
    side: Side,
    mut sink: SplitSink<S, Message>,
    mut outbox: mpsc::Receiver<Message>,
) -> Result<(), String>
where
    S: FrameStream,
{
    while let Some(message) = outbox.recv().await {
        let closing = message.is_close();
        let keepalive = message.is_ping();

        if let Err(err) = sink.send(message).await {
            if keepalive {
                tracing::warn!(session_id = %id, ?side, %err, "keepalive ping failed");
            } else if is_disconnect(&err) {
                return Err(err.to_string());
            } else {
                tracing::debug!(session_id = %id, ?side, %err, "frame dropped");
            }
        }
        if closing {
            break;
        }
    }

    let _ = sink.close().await;
    Ok(())
}

/// The live pairing of one client connection and one upstream connection.
///
/// One task owns the session state: every event (client frame, upstream
/// frame, dial completion, writer exit, keepalive tick) is handled in turn
/// by [`RelaySession::run`], so the buffer and the lifecycle are never
/// touched concurrently. Writes go through a bounded queue per side,
/// drained by that side's writer task, so a slow side only pauses reading
/// from the side that feeds it.
pub struct RelaySession<C, D> {
    id: uuid::Uuid,
    config: SessionConfig,
    client: C,
    dial: D,
}

impl<C, D, U, E> RelaySession<C, D>
where
    C: FrameStream + 'static,
    U: FrameStream + 'static,
    D: Future<Output = Result<U, E>> + Send,
    E: fmt::Display + Send,
{
    /// Create a session in the `Connecting` state. `dial` is polled
    /// alongside the client from the first call to [`run`](Self::run).
    pub fn new(id: uuid::Uuid, client: C, dial: D, config: SessionConfig) -> Self {
        Self {
            id,
            config,
            client,
            dial,
        }
    }

    /// Drive the session to completion and report why it ended. Both legs
    /// have been sent a close (best effort) when this returns.
    pub async fn run(self) -> CloseCause {
        let (sink, frames) = self.client.split();
        let client_writer = Writer::spawn(
            self.id,
            Side::Client,
            sink,
            self.config.write_queue_depth,
        );

        Running {
            id: self.id,
            config: self.config,
            state: SessionState::Connecting,
            client: frames,
            client_writer,
            upstream: None,
            upstream_writer: None,
            dial: Some(Box::pin(self.dial)),
            pending: VecDeque::new(),
        }
        .run()
        .await
    }
}

struct Running<C, U, D>
where
    C: FrameStream,
    U: FrameStream,
{
    id: uuid::Uuid,
    config: SessionConfig,
    state: SessionState,
    client: SplitStream<C>,
    client_writer: Writer,
    upstream: Option<SplitStream<U>>,
    upstream_writer: Option<Writer>,
    dial: Option<Pin<Box<D>>>,
    pending: VecDeque<Message>,
}

impl<C, U, D, E> Running<C, U, D>
where
    C: FrameStream + 'static,
    U: FrameStream + 'static,
    D: Future<Output = Result<U, E>> + Send,
    E: fmt::Display + Send,
{
    async fn run(mut self) -> CloseCause {
        let mut keepalive = self.config.keepalive_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        let cause = loop {
            let event = self.next_event(&mut keepalive).await;
            if let Some(cause) = self.handle(event) {
                break cause;
            }
        };

        self.teardown(&cause).await;
        cause
    }

    async fn next_event(&mut self, keepalive: &mut Option<Interval>) -> Event<U> {
        let open = self.state == SessionState::Open;
        let toward_upstream = self.upstream_writer.as_ref().map(|w| w.queue.clone());
        let toward_client = self.client_writer.queue.clone();

        tokio::select! {
            (permit, frame) = reserve_then_read(&mut self.client, toward_upstream) => {
                Event::Client(permit, frame)
            }
            dialed = poll_dial(&mut self.dial) => Event::Dialed(dialed.map_err(|err| err.to_string())),
            (permit, frame) = next_upstream(&mut self.upstream, toward_client) => {
                Event::Upstream(permit, frame)
            }
            end = writer_end(Some(&mut self.client_writer)) => Event::WriterEnded(Side::Client, end),
            end = writer_end(self.upstream_writer.as_mut()) => Event::WriterEnded(Side::Upstream, end),
            () = tick(keepalive), if open => Event::Keepalive,
        }
    }

    /// Apply one event. Returns the cause when the session must close.
    fn handle(&mut self, event: Event<U>) -> Option<CloseCause> {
        match event {
            Event::Client(_, None) => Some(CloseCause::ClientError("stream ended".to_string())),
            Event::Client(_, Some(Err(err))) => Some(CloseCause::ClientError(err.to_string())),
            Event::Client(_, Some(Ok(Message::Close(frame)))) => {
                Some(CloseCause::ClientClosed(frame))
            }
            Event::Client(permit, Some(Ok(message))) => self.on_client_frame(permit, message),

            Event::Dialed(Ok(upstream)) => {
                self.on_upstream_open(upstream);
                None
            }
            Event::Dialed(Err(err)) => {
                self.dial = None;
                Some(CloseCause::DialFailed(err))
            }

            Event::Upstream(_, None) => {
                Some(CloseCause::UpstreamError("stream ended".to_string()))
            }
            Event::Upstream(_, Some(Err(err))) => Some(CloseCause::UpstreamError(err.to_string())),
            Event::Upstream(_, Some(Ok(Message::Close(frame)))) => {
                Some(CloseCause::UpstreamClosed(frame))
            }
            Event::Upstream(permit, Some(Ok(message))) => {
                if let (Some(permit), true) = (permit, is_data(&message)) {
                    permit.send(message);
                }
                None
            }

            Event::WriterEnded(side, result) => {
                let reason = result.err().unwrap_or_else(|| "writer stopped".to_string());
                match side {
                    Side::Client => {
                        self.client_writer.task = None;
                        Some(CloseCause::ClientError(reason))
                    }
                    Side::Upstream => {
                        if let Some(writer) = self.upstream_writer.as_mut() {
                            writer.task = None;
                        }
                        Some(CloseCause::UpstreamError(reason))
                    }
                }
            }

            Event::Keepalive => {
                self.ping_upstream();
                None
            }
        }
    }

    fn on_client_frame(
        &mut self,
        permit: Option<OwnedPermit<Message>>,
        message: Message,
    ) -> Option<CloseCause> {
        if !is_data(&message) {
            return None;
        }

        match (self.state, permit) {
            (SessionState::Connecting, _) => {
                if self.pending.len() >= self.config.buffer_capacity {
                    return Some(CloseCause::BufferOverflow {
                        capacity: self.config.buffer_capacity,
                    });
                }
                self.pending.push_back(message);
                None
            }
            (SessionState::Open, Some(permit)) => {
                permit.send(message);
                None
            }
            _ => None,
        }
    }

    /// `Connecting -> Open`: queue the buffer in arrival order ahead of any
    /// live frame, then drop it.
    fn on_upstream_open(&mut self, upstream: U) {
        self.dial = None;

        let (sink, frames) = upstream.split();
        // Room for the whole buffer plus the usual queue depth.
        let depth = self.config.buffer_capacity + self.config.write_queue_depth;
        let writer = Writer::spawn(self.id, Side::Upstream, sink, depth);

        let flushed = self.pending.len();
        for message in self.pending.drain(..) {
            // Only fails once the writer has exited, which is reported as
            // its own event.
            if writer.queue.try_send(message).is_err() {
                break;
            }
        }

        self.upstream = Some(frames);
        self.upstream_writer = Some(writer);
        self.state = SessionState::Open;
        tracing::info!(session_id = %self.id, flushed, "upstream open");
    }

    /// Queue a ping toward the upstream. Skipped when the queue is full:
    /// frames in flight already prove liveness.
    fn ping_upstream(&mut self) {
        let Some(writer) = self.upstream_writer.as_ref() else {
            return;
        };
        match writer.queue.try_send(Message::Ping(Bytes::new())) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::debug!(session_id = %self.id, "keepalive skipped; upstream queue full");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Enter `Closed` and send each side its close frame. Errors are
    /// ignored: a side that is already closed stays closed.
    async fn teardown(mut self, cause: &CloseCause) {
        self.state = SessionState::Closed;
        self.dial = None;
        self.pending.clear();

        let (to_client, to_upstream) = cause.close_frames();
        let timeout = self.config.close_timeout;

        let upstream_writer = self.upstream_writer.take();
        let upstream = async move {
            if let Some(writer) = upstream_writer {
                writer.shutdown(to_upstream, timeout).await;
            }
        };
        tokio::join!(self.client_writer.shutdown(to_client, timeout), upstream);

        tracing::info!(session_id = %self.id, %cause, "session closed");
    }
}

/// Wait for a free slot toward the opposite side, then read one frame.
/// Without a queue (upstream not open yet) the frame is read directly.
async fn reserve_then_read<S>(
    frames: &mut S,
    queue: Option<mpsc::Sender<Message>>,
) -> (Option<OwnedPermit<Message>>, Frame)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let permit = match queue {
        Some(queue) => match queue.reserve_owned().await {
            Ok(permit) => Some(permit),
            // The writer is gone; its exit is reported separately.
            Err(_) => std::future::pending().await,
        },
        None => None,
    };
    (permit, frames.next().await)
}

async fn next_upstream<S>(
    frames: &mut Option<SplitStream<S>>,
    toward_client: mpsc::Sender<Message>,
) -> (Option<OwnedPermit<Message>>, Frame)
where
    S: FrameStream,
{
    match frames {
        Some(frames) => reserve_then_read(frames, Some(toward_client)).await,
        None => std::future::pending().await,
    }
}

async fn writer_end(writer: Option<&mut Writer>) -> Result<(), String> {
    match writer.and_then(|w| w.task.as_mut()) {
        Some(task) => match task.await {
            Ok(result) => result,
            Err(err) => Err(err.to_string()),
        },
        None => std::future::pending().await,
    }
}

async fn poll_dial<D: Future>(dial: &mut Option<Pin<Box<D>>>) -> D::Output {
    match dial {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Text and binary frames are relayed; ping/pong belong to each leg.
fn is_data(message: &Message) -> bool {
    matches!(message, Message::Text(_) | Message::Binary(_))
}

fn is_disconnect(err: &WsError) -> bool {
    matches!(
        err,
        WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Io(_)
    )
}

fn mirror(frame: &Option<CloseFrame>) -> CloseFrame {
    frame
        .clone()
        .unwrap_or_else(|| close_frame(CloseCode::Normal, ""))
}

fn close_frame(code: CloseCode, reason: &str) -> CloseFrame {
    CloseFrame {
        code,
        reason: crate::verifier::truncate(reason, MAX_CLOSE_REASON).into(),
    }
}
