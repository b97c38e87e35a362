//! Per-connection protocol engine.
//!
//! A [`Communicator`] owns one client stream. It reads the header chunks
//! synchronously via [`Communicator::read_command_context`], then moves all
//! further reads (stdin, stdin EOF, heartbeats) to a background reader task
//! that also detects dead clients. Output chunks from any number of callers
//! are serialized through a single write lock.
//!
//! # Shutdown order
//!
//! [`Communicator::exit`] stops input first, then writes the `EXIT` chunk,
//! then shuts down the write half. [`Communicator::close`] tears everything
//! down and waits up to [`TERMINATION_TIMEOUT`] for the reader task.

pub mod listener;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Buf, Bytes};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

pub use listener::{DisconnectListener, DisconnectReason, HeartbeatListener, ListenerId};

use crate::protocol::{Chunk, ChunkCodec, ChunkType, CommandContext};
use crate::transport::{ClientStream, DuplexStream, PeerAddr};
use crate::{AppError, Result};

/// Grace period for the reader task after [`Communicator::close`].
pub const TERMINATION_TIMEOUT: Duration = Duration::from_millis(1000);

type ChunkReader = FramedRead<ReadHalf<Box<dyn DuplexStream>>, ChunkCodec>;
type ChunkWriter = FramedWrite<WriteHalf<Box<dyn DuplexStream>>, ChunkCodec>;

/// Single-slot stdin staging buffer.
#[derive(Default)]
struct StdinState {
    staged: Bytes,
    eof: bool,
    input_requested: bool,
}

#[derive(Default)]
struct Listeners {
    disconnect: Vec<(ListenerId, Arc<dyn DisconnectListener>)>,
    heartbeat: Vec<(ListenerId, Arc<dyn HeartbeatListener>)>,
}

/// State shared between the communicator handle and its reader task.
struct Shared {
    writer: tokio::sync::Mutex<Option<ChunkWriter>>,
    stdin: Mutex<StdinState>,
    stdin_ready: Notify,
    listeners: Mutex<Listeners>,
    listeners_changed: Notify,
    next_listener_id: AtomicU64,
    client_connected: AtomicBool,
    input_closed: AtomicBool,
    /// Cancelled once input stops; ends the reader loop.
    input_stop: CancellationToken,
}

enum ReadOutcome {
    Chunk(Chunk),
    Closed,
    Elapsed,
    Failed(AppError),
}

/// Protocol engine for one client connection.
pub struct Communicator {
    shared: Arc<Shared>,
    reader: Option<ChunkReader>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    read_timeout: Option<Duration>,
    peer: PeerAddr,
    exited: AtomicBool,
    output_closed: AtomicBool,
    closed: AtomicBool,
}

impl Communicator {
    /// Take ownership of `stream`.
    ///
    /// A zero `heartbeat_timeout` disables the software read timeout.
    #[must_use]
    pub fn new(stream: ClientStream, heartbeat_timeout: Duration) -> Self {
        let (read_half, write_half) = tokio::io::split(stream.io);
        let read_timeout = if heartbeat_timeout.is_zero() {
            None
        } else {
            // Leave room for a transport-level timeout to fire first.
            Some(heartbeat_timeout + heartbeat_timeout / 10)
        };

        Self {
            shared: Arc::new(Shared {
                writer: tokio::sync::Mutex::new(Some(FramedWrite::new(
                    write_half,
                    ChunkCodec::new(),
                ))),
                stdin: Mutex::new(StdinState::default()),
                stdin_ready: Notify::new(),
                listeners: Mutex::new(Listeners::default()),
                listeners_changed: Notify::new(),
                next_listener_id: AtomicU64::new(1),
                client_connected: AtomicBool::new(true),
                input_closed: AtomicBool::new(false),
                input_stop: CancellationToken::new(),
            }),
            reader: Some(FramedRead::new(read_half, ChunkCodec::new())),
            reader_task: Mutex::new(None),
            read_timeout,
            peer: stream.peer,
            exited: AtomicBool::new(false),
            output_closed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Remote end of the connection.
    #[must_use]
    pub fn peer(&self) -> PeerAddr {
        self.peer
    }

    /// Bounded wait applied to every chunk read, if any.
    #[must_use]
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// Read header chunks up to and including `COMMAND`, then start the
    /// background reader.
    ///
    /// Heartbeats sent before the command are ignored.
    ///
    /// # Errors
    ///
    /// - `AppError::Protocol` on a non-header chunk or a second call.
    /// - `AppError::Timeout` if the client goes silent.
    /// - `AppError::Io` if the stream ends before `COMMAND`.
    pub async fn read_command_context(&mut self) -> Result<CommandContext> {
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| AppError::Protocol("command context already read".into()))?;
        let mut context = CommandContext::default();

        loop {
            let chunk = match next_chunk(&mut reader, self.read_timeout).await {
                ReadOutcome::Chunk(chunk) => chunk,
                ReadOutcome::Closed => {
                    return Err(AppError::Io(
                        "client closed the connection before sending a command".into(),
                    ))
                }
                ReadOutcome::Elapsed => {
                    return Err(AppError::Timeout(
                        "client went silent while sending the command header".into(),
                    ))
                }
                ReadOutcome::Failed(err) => return Err(err),
            };

            match chunk.kind {
                ChunkType::Argument => context.arguments.push(chunk.payload_text()),
                ChunkType::Environment => {
                    context.environment.apply_entry(&chunk.payload_text());
                }
                ChunkType::WorkingDirectory => context.working_directory = chunk.payload_text(),
                ChunkType::Command => {
                    context.command = chunk.payload_text();
                    break;
                }
                ChunkType::Heartbeat => debug!("heartbeat during command header"),
                other => {
                    return Err(AppError::Protocol(format!(
                        "unexpected {other} chunk before COMMAND"
                    )))
                }
            }
        }

        debug!(
            command = %context.command,
            arguments = context.arguments.len(),
            "command header read"
        );
        self.start_reader(reader);
        Ok(context)
    }

    fn start_reader(&self, reader: ChunkReader) {
        let task = tokio::spawn(
            run_reader(Arc::clone(&self.shared), reader, self.read_timeout).in_current_span(),
        );
        *lock(&self.reader_task) = Some(task);
    }

    /// Read stdin into `buf`, returning the number of bytes copied.
    ///
    /// Returns `Ok(0)` at end of input, whether the client sent `STDIN_EOF`,
    /// disconnected, or input was stopped. When nothing is staged a single
    /// `SEND_INPUT` is sent and the call waits for the client's answer.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` leaves room for transports that
    /// can report read failures to the caller.
    pub async fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let ready = self.shared.stdin_ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            let request_input = {
                let mut state = lock(&self.shared.stdin);
                if !state.staged.is_empty() {
                    let n = buf.len().min(state.staged.len());
                    buf[..n].copy_from_slice(&state.staged[..n]);
                    state.staged.advance(n);
                    return Ok(n);
                }
                if state.eof {
                    return Ok(0);
                }
                !std::mem::replace(&mut state.input_requested, true)
            };

            if request_input {
                if let Err(err) = self.send(ChunkType::SendInput, Bytes::new()).await {
                    debug!(%err, "failed to request input; treating stdin as closed");
                    self.shared.set_eof();
                    return Ok(0);
                }
            }

            ready.await;
        }
    }

    /// Bytes staged and readable without waiting.
    #[must_use]
    pub fn available(&self) -> usize {
        lock(&self.shared.stdin).staged.len()
    }

    /// Write one output chunk under the connection write lock.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if output is closed or the write fails.
    pub async fn send(&self, kind: ChunkType, payload: impl Into<Bytes>) -> Result<()> {
        let mut guard = self.shared.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| AppError::Io("output stream is closed".into()))?;
        writer.send(Chunk::new(kind, payload)).await
    }

    /// Send the exit code and shut the connection down. Repeat calls are
    /// no-ops.
    pub async fn exit(&self, code: i32) {
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }

        self.stop_input();

        if let Err(err) = self.send(ChunkType::Exit, code.to_string()).await {
            debug!(%err, exit_code = code, "exit code not delivered; client is gone");
        }

        self.stop_output().await;
    }

    /// Whether [`exit`](Self::exit) has been called.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Tear down the connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.stop_input();
        self.stop_output().await;

        let task = lock(&self.reader_task).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(TERMINATION_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                warn!(
                    timeout = ?TERMINATION_TIMEOUT,
                    "reader task did not stop in time; aborting"
                );
                task.abort();
            }
        }
    }

    fn stop_input(&self) {
        if self.shared.input_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("stopping input");
        self.shared.set_eof();
        self.shared.input_stop.cancel();
    }

    async fn stop_output(&self) {
        if self.output_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("stopping output");
        let writer = self.shared.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(err) = writer.close().await {
                debug!(%err, "failed to shut down write half");
            }
        }
    }

    /// Whether the client is still considered connected.
    #[must_use]
    pub fn is_client_connected(&self) -> bool {
        self.shared.client_connected.load(Ordering::SeqCst)
    }

    /// Register a disconnect listener.
    ///
    /// A listener added after the disconnect was detected is invoked right
    /// away by the reader task.
    pub fn add_disconnect_listener(
        &self,
        listener: impl DisconnectListener + 'static,
    ) -> ListenerId {
        let id = self.shared.next_id();
        lock(&self.shared.listeners)
            .disconnect
            .push((id, Arc::new(listener)));
        self.shared.listeners_changed.notify_one();
        id
    }

    /// Remove a disconnect listener; returns whether it was still registered.
    pub fn remove_disconnect_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.shared.listeners);
        let before = listeners.disconnect.len();
        listeners.disconnect.retain(|(existing, _)| *existing != id);
        listeners.disconnect.len() != before
    }

    /// Register a heartbeat listener.
    pub fn add_heartbeat_listener(&self, listener: impl HeartbeatListener + 'static) -> ListenerId {
        let id = self.shared.next_id();
        lock(&self.shared.listeners)
            .heartbeat
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a heartbeat listener; returns whether it was still registered.
    pub fn remove_heartbeat_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.shared.listeners);
        let before = listeners.heartbeat.len();
        listeners.heartbeat.retain(|(existing, _)| *existing != id);
        listeners.heartbeat.len() != before
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        self.shared.input_stop.cancel();
    }
}

impl Shared {
    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed))
    }

    fn set_eof(&self) {
        {
            let mut state = lock(&self.stdin);
            state.eof = true;
            state.input_requested = false;
        }
        self.stdin_ready.notify_waiters();
    }

    /// Route one streaming chunk; `Err` ends the reader with that reason.
    fn dispatch(&self, chunk: Chunk) -> std::result::Result<(), DisconnectReason> {
        match chunk.kind {
            ChunkType::Stdin => {
                {
                    let mut state = lock(&self.stdin);
                    if !state.staged.is_empty() {
                        warn!(
                            pending = state.staged.len(),
                            received = chunk.payload.len(),
                            "STDIN chunk arrived before previous input was consumed"
                        );
                        return Err(DisconnectReason::InternalError);
                    }
                    state.staged = chunk.payload;
                    state.input_requested = false;
                }
                self.stdin_ready.notify_waiters();
            }
            ChunkType::StdinEof => self.set_eof(),
            ChunkType::Heartbeat => {
                let listeners: Vec<Arc<dyn HeartbeatListener>> = lock(&self.listeners)
                    .heartbeat
                    .iter()
                    .map(|(_, listener)| Arc::clone(listener))
                    .collect();
                for listener in listeners {
                    listener.on_heartbeat();
                }
            }
            other => {
                warn!(chunk_type = %other, "unexpected chunk from client");
                return Err(DisconnectReason::InternalError);
            }
        }
        Ok(())
    }

    /// Notify disconnect listeners until input is stopped.
    ///
    /// Listeners are drained and invoked outside the lock; late
    /// registrations wake the loop and are notified on the next pass.
    async fn notify_disconnect(&self, mut reason: DisconnectReason) {
        loop {
            let changed = self.listeners_changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if self.input_stop.is_cancelled() {
                reason = DisconnectReason::SessionShutdown;
            }

            let drained = std::mem::take(&mut lock(&self.listeners).disconnect);
            for (_, listener) in drained {
                listener.on_disconnect(reason);
            }

            if !lock(&self.listeners).disconnect.is_empty() {
                continue;
            }
            if self.input_stop.is_cancelled() {
                return;
            }

            tokio::select! {
                biased;
                () = self.input_stop.cancelled() => {}
                () = &mut changed => {}
            }
        }
    }
}

async fn next_chunk(reader: &mut ChunkReader, limit: Option<Duration>) -> ReadOutcome {
    let next = match limit {
        Some(limit) => match tokio::time::timeout(limit, reader.next()).await {
            Ok(next) => next,
            Err(_) => return ReadOutcome::Elapsed,
        },
        None => reader.next().await,
    };
    match next {
        Some(Ok(chunk)) => ReadOutcome::Chunk(chunk),
        Some(Err(err)) => ReadOutcome::Failed(err),
        None => ReadOutcome::Closed,
    }
}

/// Background reader: stdin, stdin EOF and heartbeats until the client
/// goes away or input is stopped.
async fn run_reader(shared: Arc<Shared>, mut reader: ChunkReader, limit: Option<Duration>) {
    debug!("reader task started");

    let reason = loop {
        let outcome = tokio::select! {
            biased;
            () = shared.input_stop.cancelled() => break DisconnectReason::SessionShutdown,
            outcome = next_chunk(&mut reader, limit) => outcome,
        };

        match outcome {
            ReadOutcome::Chunk(chunk) => {
                if let Err(reason) = shared.dispatch(chunk) {
                    break reason;
                }
            }
            ReadOutcome::Closed => {
                debug!("client closed the stream");
                break DisconnectReason::SocketError;
            }
            ReadOutcome::Elapsed => {
                warn!(
                    timeout = ?limit,
                    "no chunk from client within the heartbeat window"
                );
                break DisconnectReason::HeartbeatTimeout;
            }
            ReadOutcome::Failed(AppError::Timeout(msg)) => {
                warn!(error = %msg, "client socket timed out");
                break DisconnectReason::SocketTimeout;
            }
            ReadOutcome::Failed(err) => {
                warn!(%err, "client read failed");
                break DisconnectReason::InternalError;
            }
        }
    };

    drop(reader);
    debug!(%reason, "client disconnected");

    shared.client_connected.store(false, Ordering::SeqCst);
    shared.set_eof();
    shared.notify_disconnect(reason).await;

    debug!("reader task finished");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
