//! Shared helpers for protocol-level integration tests.
//!
//! [`FakeClient`] speaks raw chunks over an in-memory duplex pipe so tests
//! can drive a [`Communicator`](nailgun::communicator::Communicator) or a
//! pooled session without a real socket.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use nailgun::nail::CommandRegistry;
use nailgun::protocol::{Chunk, ChunkCodec, ChunkType};
use nailgun::server::ServerControl;
use nailgun::session::{SessionDeps, SessionPool};
use nailgun::transport::{ClientStream, PeerAddr};
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

/// Upper bound for any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(5);

/// Client end of an in-memory connection.
pub struct FakeClient {
    framed: Framed<DuplexStream, ChunkCodec>,
}

/// Create a connected `(server stream, fake client)` pair.
pub fn connection() -> (ClientStream, FakeClient) {
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    (
        ClientStream::new(server_io, PeerAddr::Unknown),
        FakeClient {
            framed: Framed::new(client_io, ChunkCodec::new()),
        },
    )
}

impl FakeClient {
    /// Send one chunk.
    pub async fn send(&mut self, kind: ChunkType, payload: &str) {
        self.framed
            .send(Chunk::text(kind, payload))
            .await
            .expect("fake client send");
    }

    /// Send arguments, working directory and the command.
    pub async fn send_header(&mut self, command: &str, arguments: &[&str]) {
        for arg in arguments {
            self.send(ChunkType::Argument, arg).await;
        }
        self.send(ChunkType::WorkingDirectory, "/tmp").await;
        self.send(ChunkType::Command, command).await;
    }

    /// Next chunk from the server; `None` at end of stream.
    pub async fn next(&mut self) -> Option<Chunk> {
        tokio::time::timeout(WAIT, self.framed.next())
            .await
            .expect("server chunk within timeout")
            .map(|chunk| chunk.expect("well-formed chunk"))
    }

    /// Next chunk if one arrives within `wait`.
    pub async fn try_next(&mut self, wait: Duration) -> Option<Chunk> {
        tokio::time::timeout(wait, self.framed.next())
            .await
            .ok()
            .flatten()
            .map(|chunk| chunk.expect("well-formed chunk"))
    }

    /// Answer `SEND_INPUT` with `stdin` once, then with `STDIN_EOF`, and
    /// collect every other chunk up to and including `EXIT`.
    ///
    /// Also asserts that the server closes the stream after `EXIT`.
    pub async fn run_to_exit(&mut self, stdin: &str) -> Transcript {
        let mut transcript = Transcript::default();
        let mut pending = Some(stdin.to_owned()).filter(|input| !input.is_empty());

        loop {
            let chunk = self.next().await.expect("stream ended before EXIT");
            match chunk.kind {
                ChunkType::SendInput => {
                    transcript.input_requests += 1;
                    match pending.take() {
                        Some(input) => self.send(ChunkType::Stdin, &input).await,
                        None => self.send(ChunkType::StdinEof, "").await,
                    }
                }
                ChunkType::Exit => {
                    transcript.chunks.push(chunk);
                    break;
                }
                _ => transcript.chunks.push(chunk),
            }
        }

        assert!(self.next().await.is_none(), "stream must end after EXIT");
        transcript
    }
}

/// Server output seen by a [`FakeClient`].
#[derive(Debug, Default)]
pub struct Transcript {
    /// Chunks other than `SEND_INPUT`, in arrival order.
    pub chunks: Vec<Chunk>,
    /// Number of `SEND_INPUT` requests answered.
    pub input_requests: usize,
}

impl Transcript {
    /// Decoded `(type, payload)` pairs.
    pub fn pairs(&self) -> Vec<(ChunkType, String)> {
        self.chunks
            .iter()
            .map(|chunk| (chunk.kind, chunk.payload_text()))
            .collect()
    }

    /// Exit code from the final `EXIT` chunk.
    pub fn exit_code(&self) -> i32 {
        let last = self.chunks.last().expect("at least one chunk");
        assert_eq!(last.kind, ChunkType::Exit);
        last.payload_text().parse().expect("numeric exit code")
    }
}

/// Pool over `registry` with the given idle cap and termination timeout.
pub fn test_pool(
    registry: CommandRegistry,
    max_idle: usize,
    termination_timeout: Duration,
) -> (SessionPool, ServerControl) {
    let control = ServerControl::new();
    let deps = SessionDeps::new(Arc::new(registry), Duration::ZERO, control.clone());
    (SessionPool::new(max_idle, termination_timeout, deps), control)
}

/// Poll `condition` until it holds or [`WAIT`] elapses.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition reached within timeout");
}
