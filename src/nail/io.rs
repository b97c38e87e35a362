//! Stdio handles backed by a [`Communicator`].

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::communicator::Communicator;
use crate::protocol::ChunkType;
use crate::Result;

const READ_BUF_LEN: usize = 8 * 1024;

/// Client stdin.
pub struct NailInput {
    comm: Arc<Communicator>,
    cancel: CancellationToken,
}

impl NailInput {
    pub(crate) fn new(comm: Arc<Communicator>, cancel: CancellationToken) -> Self {
        Self { comm, cancel }
    }

    /// Read into `buf`; `Ok(0)` means end of input.
    ///
    /// A session shutdown also ends input, so a nail parked on stdin
    /// finishes instead of holding the session.
    ///
    /// # Errors
    ///
    /// Propagates [`Communicator::receive`] failures.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                debug!("stdin read cancelled by session shutdown");
                Ok(0)
            }
            read = self.comm.receive(buf) => read,
        }
    }

    /// Read until end of input, appending to `out`.
    ///
    /// # Errors
    ///
    /// Propagates [`Communicator::receive`] failures.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let mut buf = vec![0_u8; READ_BUF_LEN];
        let mut total = 0;
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&buf[..n]);
            total += n;
        }
    }

    /// Read until end of input as (lossy) UTF-8.
    ///
    /// # Errors
    ///
    /// Propagates [`Communicator::receive`] failures.
    pub async fn read_to_string(&mut self) -> Result<String> {
        let mut out = Vec::new();
        self.read_to_end(&mut out).await?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Bytes readable without waiting.
    #[must_use]
    pub fn available(&self) -> usize {
        self.comm.available()
    }
}

/// Client stdout or stderr.
#[derive(Clone)]
pub struct NailOutput {
    comm: Arc<Communicator>,
    kind: ChunkType,
}

impl NailOutput {
    pub(crate) fn new(comm: Arc<Communicator>, kind: ChunkType) -> Self {
        Self { comm, kind }
    }

    /// Send `bytes` as one chunk. Empty writes send nothing.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` once the connection's output is closed.
    pub async fn write_all(&self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.comm
            .send(self.kind, Bytes::copy_from_slice(bytes))
            .await
    }

    /// Send `text` followed by a newline.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` once the connection's output is closed.
    pub async fn write_line(&self, text: &str) -> Result<()> {
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');
        self.write_all(line.as_bytes()).await
    }
}
