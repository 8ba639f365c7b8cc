//! Typed message channel with concurrent dispatch and two-phase shutdown.
//!
//! One dedicated task runs the blocking frame-read loop for the lifetime of
//! the connection. Control messages are routed inline; every application
//! message is handed to the injected handler on its own task, tracked in the
//! in-flight set so shutdown can drain before the pipes go away. Relayed log
//! messages are delivered synchronously, in arrival order — reordered
//! diagnostics would confuse a human reader.
//!
//! Send and receive never interleave a frame: all writers funnel through one
//! lock around the framed output. The in-flight set has its own lock so a
//! handler's slow send cannot block unrelated bookkeeping.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::Notify;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{Frame, FrameCodec};
use crate::bridge::protocol::{AboutToStop, LogEntry, LogLevel, Parameters, Stop};
use crate::bridge::registry::{Inbound, Message, MessageRegistry, ProtocolError};
use crate::bridge::transport::{BoxRead, BoxWrite, ChannelEndpoint, PipeDirGuard};

/// Callback invoked for every relayed [`LogEntry`], in arrival order.
pub type LogSink = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Default sink: route relayed diagnostics to the local `tracing` subscriber.
pub fn tracing_log_sink() -> LogSink {
    Arc::new(|level, text| match level {
        LogLevel::Error => tracing::error!(target: "hostlet::relay", "{text}"),
        LogLevel::Warning => tracing::warn!(target: "hostlet::relay", "{text}"),
        LogLevel::Informational => tracing::info!(target: "hostlet::relay", "{text}"),
        LogLevel::Detailed => tracing::debug!(target: "hostlet::relay", "{text}"),
        LogLevel::Verbose | LogLevel::None => {
            tracing::trace!(target: "hostlet::relay", "{text}")
        }
    })
}

/// Connection lifecycle. `StopRequested → Stopped` requires the in-flight
/// set to drain; a remote disconnect may jump straight to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Active,
    StopRequested,
    Stopped,
}

/// Handler for inbound application messages. One invocation runs per message
/// on its own task; completions are unordered. Errors (and panics) are
/// logged and swallowed — one bad message must not take down the channel.
#[async_trait::async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn handle(&self, message: Inbound, ctx: HandlerContext) -> anyhow::Result<()>;
}

/// Cloneable handle for pushing messages into the channel from outside the
/// read loop (handler tasks, unsolicited child→parent streaming).
#[derive(Clone)]
pub struct MessageSender {
    core: Arc<ChannelCore>,
}

impl MessageSender {
    /// Send a registered message. Silently does nothing once local shutdown
    /// has begun or the peer is gone.
    pub async fn send<M: Message>(&self, message: &M) -> Result<(), ProtocolError> {
        self.core.send_message(message).await
    }

    /// Relay a diagnostic to the peer, subject to the peer-set threshold.
    pub async fn log(&self, level: LogLevel, text: &str) {
        self.core.relay_log(level, text).await;
    }
}

/// Everything a handler invocation needs: a way to send responses, a way to
/// relay diagnostics, and the shared cancellation signal.
#[derive(Clone)]
pub struct HandlerContext {
    sender: MessageSender,
    cancellation: CancellationToken,
}

impl HandlerContext {
    pub fn sender(&self) -> MessageSender {
        self.sender.clone()
    }

    pub async fn send<M: Message>(&self, message: &M) -> Result<(), ProtocolError> {
        self.sender.send(message).await
    }

    pub async fn log(&self, level: LogLevel, text: &str) {
        self.sender.log(level, text).await;
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

struct InFlight {
    next_seq: u64,
    active: HashMap<u64, &'static str>,
    stop_ack_due: bool,
}

struct ChannelCore {
    registry: Arc<MessageRegistry>,
    writer: tokio::sync::Mutex<Option<FramedWrite<BoxWrite, FrameCodec>>>,
    state: StdMutex<ShutdownState>,
    in_flight: StdMutex<InFlight>,
    drained: Notify,
    stopped: Notify,
    cancellation: CancellationToken,
    log_sink: LogSink,
    log_threshold: AtomicU8,
    cleanup: StdMutex<Option<PipeDirGuard>>,
}

fn relock<'a, T>(mutex: &'a StdMutex<T>) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ChannelCore {
    fn state(&self) -> ShutdownState {
        *relock(&self.state)
    }

    fn threshold(&self) -> LogLevel {
        LogLevel::from(self.log_threshold.load(Ordering::Relaxed))
    }

    fn set_threshold(&self, level: LogLevel) {
        self.log_threshold.store(level.into(), Ordering::Relaxed);
    }

    fn emit_sink(&self, level: LogLevel, text: &str) {
        (self.log_sink)(level, text);
    }

    /// Write one frame, flushing immediately. Returns `false` when the
    /// output is already gone (disposed or broken pipe).
    async fn write_frame(&self, kind: u32, payload: Vec<u8>) -> bool {
        let mut writer = self.writer.lock().await;
        let Some(framed) = writer.as_mut() else {
            tracing::trace!(kind, "dropping send, output already disposed");
            return false;
        };
        match framed.send(Frame::new(Bytes::from(payload), kind)).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, kind, "send failed, treating peer as gone");
                // Stop trying: the reader will observe the same failure and
                // run the normal shutdown path.
                *writer = None;
                false
            }
        }
    }

    /// Application-level send: refused for unregistered types, silently
    /// skipped once shutdown has begun (concurrent callers race shutdown).
    async fn send_message<M: Message>(&self, message: &M) -> Result<(), ProtocolError> {
        let Some(kind) = self.registry.kind_of::<M>() else {
            return Err(ProtocolError::UnregisteredType(std::any::type_name::<M>()));
        };
        if self.state() != ShutdownState::Active {
            tracing::trace!(kind, "skipping send after shutdown began");
            return Ok(());
        }
        let payload = serde_json::to_vec(message).map_err(|source| ProtocolError::Encode {
            type_name: std::any::type_name::<M>(),
            source,
        })?;
        self.write_frame(kind, payload).await;
        Ok(())
    }

    /// Control-level send: bypasses the shutdown gate so stop notices and
    /// acknowledgements still go out while the channel is winding down.
    async fn send_control<M: Message>(&self, message: &M) {
        let Some(kind) = self.registry.kind_of::<M>() else {
            tracing::warn!(
                type_name = std::any::type_name::<M>(),
                "control message type missing from registry"
            );
            return;
        };
        match serde_json::to_vec(message) {
            Ok(payload) => {
                self.write_frame(kind, payload).await;
            }
            Err(e) => tracing::error!(error = %e, "failed to serialize control message"),
        }
    }

    async fn relay_log(&self, level: LogLevel, text: &str) {
        if level < self.threshold() {
            return;
        }
        let _ = self
            .send_message(&LogEntry::new(level, text.to_string()))
            .await;
    }

    /// Remove a finished handler task from the in-flight set; send the
    /// deferred stop acknowledgement if this was the last one.
    async fn finish_task(&self, seq: u64) {
        let ack = {
            let mut in_flight = relock(&self.in_flight);
            in_flight.active.remove(&seq);
            if in_flight.active.is_empty() {
                self.drained.notify_waiters();
                std::mem::take(&mut in_flight.stop_ack_due)
            } else {
                false
            }
        };
        if ack {
            tracing::debug!("in-flight set drained, acknowledging stop");
            self.send_control(&Stop { abort: false }).await;
        }
    }

    async fn wait_for_drain(&self) {
        loop {
            let notified = self.drained.notified();
            if relock(&self.in_flight).active.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Release the pipes exactly once; later calls are no-ops.
    async fn dispose(&self) {
        *relock(&self.state) = ShutdownState::Stopped;
        let framed = self.writer.lock().await.take();
        if framed.is_some() {
            tracing::debug!("channel output disposed");
        }
        drop(framed);
        relock(&self.cleanup).take();
        self.stopped.notify_waiters();
    }

    async fn wait_stopped(&self) {
        loop {
            let notified = self.stopped.notified();
            if self.state() == ShutdownState::Stopped {
                return;
            }
            notified.await;
        }
    }
}

/// One end of a connection: owns the pipes, the read loop and the in-flight
/// bookkeeping. Role-specific behavior (spawning, cancel, attach) lives in
/// [`crate::launcher::Launcher`] and [`crate::testhost::TestHost`].
pub struct Communicator {
    core: Arc<ChannelCore>,
    read_loop: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Communicator {
    /// Take ownership of an endpoint and start the read loop.
    pub fn start(
        endpoint: ChannelEndpoint,
        separator: impl Into<String>,
        registry: Arc<MessageRegistry>,
        handler: Arc<dyn InboundHandler>,
        log_sink: LogSink,
    ) -> Self {
        let separator = separator.into();
        let ChannelEndpoint {
            input,
            output,
            cleanup,
        } = endpoint;
        let reader = FramedRead::new(input, FrameCodec::new(separator.clone()));
        let writer = FramedWrite::new(output, FrameCodec::new(separator));

        let core = Arc::new(ChannelCore {
            registry,
            writer: tokio::sync::Mutex::new(Some(writer)),
            state: StdMutex::new(ShutdownState::Active),
            in_flight: StdMutex::new(InFlight {
                next_seq: 0,
                active: HashMap::new(),
                stop_ack_due: false,
            }),
            drained: Notify::new(),
            stopped: Notify::new(),
            cancellation: CancellationToken::new(),
            log_sink,
            log_threshold: AtomicU8::new(LogLevel::default().into()),
            cleanup: StdMutex::new(cleanup),
        });

        let loop_core = Arc::clone(&core);
        let read_loop = tokio::spawn(async move {
            run_read_loop(loop_core, reader, handler).await;
        });

        Self {
            core,
            read_loop: StdMutex::new(Some(read_loop)),
        }
    }

    pub fn state(&self) -> ShutdownState {
        self.core.state()
    }

    /// The shared cancellation signal, set by an inbound abort.
    pub fn cancellation(&self) -> CancellationToken {
        self.core.cancellation.clone()
    }

    pub fn sender(&self) -> MessageSender {
        MessageSender {
            core: Arc::clone(&self.core),
        }
    }

    pub async fn send<M: Message>(&self, message: &M) -> Result<(), ProtocolError> {
        self.core.send_message(message).await
    }

    /// Relay a diagnostic to the peer, subject to the peer-set threshold.
    pub async fn log(&self, level: LogLevel, text: &str) {
        self.core.relay_log(level, text).await;
    }

    /// Request cooperative abort on the peer. Does not wait for any
    /// acknowledgement; in-flight peer handlers observe the signal and wind
    /// down on their own schedule.
    pub(crate) async fn send_abort(&self) {
        tracing::debug!("requesting abort");
        self.core.send_control(&Stop { abort: true }).await;
    }

    /// Initiating-side shutdown: announce that no more application messages
    /// are coming, then wait for the peer to drain and the read loop to
    /// finish before releasing the pipes. Idempotent; later calls just wait.
    pub async fn initiate_stop_and_wait(&self) {
        let announce = {
            let mut state = relock(&self.core.state);
            if *state == ShutdownState::Active {
                *state = ShutdownState::StopRequested;
                true
            } else {
                false
            }
        };
        if announce {
            tracing::debug!("announcing stop to peer");
            self.core.send_control(&AboutToStop {}).await;
        }
        self.join_read_loop().await;
        self.core.dispose().await;
    }

    /// Passive-side shutdown: wait for the read loop to finish (the peer
    /// decides when), then release the pipes.
    pub async fn wait_for_shutdown(&self) {
        self.join_read_loop().await;
        self.core.dispose().await;
    }

    /// Release the pipes without waiting for anything. Safe to call any
    /// number of times, concurrently with a remote disconnect.
    pub async fn dispose(&self) {
        self.core.dispose().await;
    }

    async fn join_read_loop(&self) {
        let handle = relock(&self.read_loop).take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "read loop task failed");
                }
            }
            // Someone else is (or was) joining; wait for the terminal state.
            None => self.core.wait_stopped().await,
        }
    }
}

async fn run_read_loop(
    core: Arc<ChannelCore>,
    mut reader: FramedRead<BoxRead, FrameCodec>,
    handler: Arc<dyn InboundHandler>,
) {
    while let Some(next) = reader.next().await {
        let frame = match next {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "channel read failed, treating peer as gone");
                break;
            }
        };
        let inbound = match core.registry.decode(frame.kind, &frame.payload) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::error!(error = %e, kind = frame.kind, "dropping undecodable frame");
                core.emit_sink(LogLevel::Error, &e.to_string());
                continue;
            }
        };

        if let Some(stop) = inbound.get::<Stop>() {
            tracing::debug!(abort = stop.abort, "stop received");
            if stop.abort {
                core.cancellation.cancel();
            }
            break;
        }

        if inbound.is::<AboutToStop>() {
            let ack_now = {
                let mut in_flight = relock(&core.in_flight);
                if in_flight.active.is_empty() {
                    true
                } else {
                    in_flight.stop_ack_due = true;
                    false
                }
            };
            if ack_now {
                tracing::debug!("nothing in flight, acknowledging stop");
                core.send_control(&Stop { abort: false }).await;
            }
            continue;
        }

        if let Some(entry) = inbound.get::<LogEntry>() {
            // Synchronous and in arrival order, unlike application messages.
            core.emit_sink(entry.level, &entry.text);
            continue;
        }

        if let Some(level) = core.registry.request_level(&inbound) {
            tracing::trace!(level = level.as_str(), "outbound log threshold updated");
            core.set_threshold(level);
        }
        if inbound.is::<Parameters>() {
            continue;
        }

        let seq = {
            let mut in_flight = relock(&core.in_flight);
            let seq = in_flight.next_seq;
            in_flight.next_seq += 1;
            in_flight.active.insert(seq, inbound.type_name());
            seq
        };
        let ctx = HandlerContext {
            sender: MessageSender {
                core: Arc::clone(&core),
            },
            cancellation: core.cancellation.clone(),
        };
        let task_core = Arc::clone(&core);
        let task_handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(task_handler.handle(inbound, ctx))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(seq, error = %e, "message handler failed"),
                Err(_) => tracing::error!(seq, "message handler panicked"),
            }
            task_core.finish_task(seq).await;
        });
    }

    // Never abandon a handler mid-flight just because the pipe closed.
    core.wait_for_drain().await;
    core.dispose().await;
    tracing::debug!("read loop exited");
}
