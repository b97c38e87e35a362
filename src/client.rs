//! Client side of the protocol.
//!
//! [`run_command`] drives one invocation over an already connected stream:
//! it sends the header chunks, keeps the connection alive with heartbeats,
//! answers `SEND_INPUT` with stdin, copies stdout/stderr, and returns the
//! exit code from the server's `EXIT` chunk.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::protocol::{Chunk, ChunkCodec, ChunkType};
use crate::transport::ClientStream;

pub use crate::transport::connect;
use crate::{AppError, Result};

/// Exit code when the connection broke before `EXIT`.
pub const CLIENT_CONNECTION_BROKEN: i32 = 227;

/// Exit code when the server sent a chunk the client does not expect.
pub const CLIENT_UNEXPECTED_CHUNK: i32 = 229;

/// Exit code when the server could not be reached.
pub const CLIENT_CONNECT_FAILED: i32 = 230;

const STDIN_CHUNK_LEN: usize = 64 * 1024;

/// What to run on the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandRequest {
    /// Command name or alias.
    pub command: String,
    /// Command-line arguments.
    pub arguments: Vec<String>,
    /// Environment entries sent as `NAME=VALUE`.
    pub environment: Vec<(String, String)>,
    /// Client working directory.
    pub working_directory: String,
}

impl CommandRequest {
    /// Request for `command` with no arguments or environment.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Header chunks in wire order, ending with `COMMAND`.
    #[must_use]
    pub fn header_chunks(&self) -> Vec<Chunk> {
        let mut chunks = Vec::with_capacity(self.arguments.len() + self.environment.len() + 2);
        chunks.extend(
            self.arguments
                .iter()
                .map(|arg| Chunk::text(ChunkType::Argument, arg)),
        );
        chunks.extend(
            self.environment
                .iter()
                .map(|(key, value)| Chunk::text(ChunkType::Environment, &format!("{key}={value}"))),
        );
        chunks.push(Chunk::text(
            ChunkType::WorkingDirectory,
            &self.working_directory,
        ));
        chunks.push(Chunk::text(ChunkType::Command, &self.command));
        chunks
    }
}

/// Run `request` over `stream`, returning the server's exit code.
///
/// A zero `heartbeat_interval` disables heartbeats.
///
/// # Errors
///
/// - `AppError::Io` if the connection breaks before `EXIT`.
/// - `AppError::Protocol` on an unexpected chunk or a malformed exit code.
pub async fn run_command<I, O, E>(
    stream: ClientStream,
    request: &CommandRequest,
    heartbeat_interval: Duration,
    stdin: I,
    mut stdout: O,
    mut stderr: E,
) -> Result<i32>
where
    I: AsyncRead + Send + Unpin + 'static,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let (read_half, write_half) = tokio::io::split(stream.io);
    let mut reader = FramedRead::new(read_half, ChunkCodec::new());

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    for chunk in request.header_chunks() {
        let _ = out_tx.send(chunk);
    }

    let mut tasks: Vec<JoinHandle<()>> = vec![tokio::spawn(write_chunks(
        FramedWrite::new(write_half, ChunkCodec::new()),
        out_rx,
    ))];
    if !heartbeat_interval.is_zero() {
        tasks.push(tokio::spawn(send_heartbeats(
            out_tx.clone(),
            heartbeat_interval,
        )));
    }
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    tasks.push(tokio::spawn(forward_stdin(stdin, input_rx, out_tx)));

    let outcome = loop {
        let chunk = match reader.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => break Err(err),
            None => {
                break Err(AppError::Io(
                    "connection closed before the exit code arrived".into(),
                ))
            }
        };

        match chunk.kind {
            ChunkType::Stdout => {
                if let Err(err) = write_output(&mut stdout, &chunk.payload).await {
                    break Err(err);
                }
            }
            ChunkType::Stderr => {
                if let Err(err) = write_output(&mut stderr, &chunk.payload).await {
                    break Err(err);
                }
            }
            ChunkType::SendInput => {
                let _ = input_tx.send(());
            }
            ChunkType::Exit => break parse_exit_code(&chunk.payload_text()),
            other => {
                break Err(AppError::Protocol(format!(
                    "unexpected {other} chunk from server"
                )))
            }
        }
    };

    for task in tasks {
        task.abort();
    }
    outcome
}

/// Parse the decimal payload of an `EXIT` chunk.
///
/// # Errors
///
/// Returns `AppError::Protocol` if the payload is not an integer.
pub fn parse_exit_code(text: &str) -> Result<i32> {
    text.trim()
        .parse()
        .map_err(|err| AppError::Protocol(format!("invalid exit code '{}': {err}", text.trim())))
}

async fn write_output<W: AsyncWrite + Unpin>(out: &mut W, bytes: &[u8]) -> Result<()> {
    out.write_all(bytes).await?;
    out.flush().await?;
    Ok(())
}

async fn write_chunks<W: AsyncWrite + Unpin>(
    mut writer: FramedWrite<W, ChunkCodec>,
    mut chunks: mpsc::UnboundedReceiver<Chunk>,
) {
    while let Some(chunk) = chunks.recv().await {
        if let Err(err) = writer.send(chunk).await {
            debug!(%err, "client write failed");
            return;
        }
    }
}

async fn send_heartbeats(out: mpsc::UnboundedSender<Chunk>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if out.send(Chunk::empty(ChunkType::Heartbeat)).is_err() {
            return;
        }
    }
}

/// Answer each `SEND_INPUT` with one `STDIN` chunk, or `STDIN_EOF` at end.
async fn forward_stdin<I: AsyncRead + Unpin>(
    mut stdin: I,
    mut requests: mpsc::UnboundedReceiver<()>,
    out: mpsc::UnboundedSender<Chunk>,
) {
    let mut buf = vec![0_u8; STDIN_CHUNK_LEN];
    while requests.recv().await.is_some() {
        let chunk = match stdin.read(&mut buf).await {
            Ok(0) => Chunk::empty(ChunkType::StdinEof),
            Ok(n) => Chunk::new(ChunkType::Stdin, bytes::Bytes::copy_from_slice(&buf[..n])),
            Err(err) => {
                warn!(%err, "failed to read stdin; sending end of input");
                Chunk::empty(ChunkType::StdinEof)
            }
        };
        let eof = chunk.kind == ChunkType::StdinEof;
        if out.send(chunk).is_err() || eof {
            return;
        }
    }
}
