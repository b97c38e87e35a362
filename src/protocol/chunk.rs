//! Chunk type tags and the owned chunk frame.

use std::fmt::{Display, Formatter};

use bytes::Bytes;

use crate::AppError;

/// Largest payload a chunk may carry: the length prefix is a signed 31-bit value.
pub const MAX_PAYLOAD_LEN: usize = 0x7fff_ffff;

/// Size of the fixed chunk header (length + type tag).
pub const HEADER_LEN: usize = 5;

/// Type tag of a chunk.
///
/// The first four variants make up the header phase sent by the client,
/// terminated by [`ChunkType::Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkType {
    /// One command-line argument.
    Argument,
    /// One `NAME=VALUE` environment entry.
    Environment,
    /// The client's working directory.
    WorkingDirectory,
    /// The command name or alias; ends the header phase.
    Command,
    /// Raw stdin bytes.
    Stdin,
    /// End of the client's stdin.
    StdinEof,
    /// Client liveness signal.
    Heartbeat,
    /// Raw stdout bytes.
    Stdout,
    /// Raw stderr bytes.
    Stderr,
    /// Decimal exit code; the last chunk the server sends.
    Exit,
    /// Server request for more stdin.
    SendInput,
}

impl ChunkType {
    /// Wire tag byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Argument => b'A',
            Self::Environment => b'E',
            Self::WorkingDirectory => b'D',
            Self::Command => b'C',
            Self::Stdin => b'0',
            Self::StdinEof => b'.',
            Self::Heartbeat => b'H',
            Self::Stdout => b'1',
            Self::Stderr => b'2',
            Self::Exit => b'X',
            Self::SendInput => b'S',
        }
    }

    /// Whether this type may appear in the client's header phase.
    #[must_use]
    pub const fn is_header(self) -> bool {
        matches!(
            self,
            Self::Argument | Self::Environment | Self::WorkingDirectory | Self::Command
        )
    }
}

impl TryFrom<u8> for ChunkType {
    type Error = AppError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        let kind = match tag {
            b'A' => Self::Argument,
            b'E' => Self::Environment,
            b'D' => Self::WorkingDirectory,
            b'C' => Self::Command,
            b'0' => Self::Stdin,
            b'.' => Self::StdinEof,
            b'H' => Self::Heartbeat,
            b'1' => Self::Stdout,
            b'2' => Self::Stderr,
            b'X' => Self::Exit,
            b'S' => Self::SendInput,
            other => {
                return Err(AppError::Protocol(format!(
                    "unknown chunk type 0x{other:02x}"
                )))
            }
        };
        Ok(kind)
    }
}

impl Display for ChunkType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Argument => "ARGUMENT",
            Self::Environment => "ENVIRONMENT",
            Self::WorkingDirectory => "WORKING_DIRECTORY",
            Self::Command => "COMMAND",
            Self::Stdin => "STDIN",
            Self::StdinEof => "STDIN_EOF",
            Self::Heartbeat => "HEARTBEAT",
            Self::Stdout => "STDOUT",
            Self::Stderr => "STDERR",
            Self::Exit => "EXIT",
            Self::SendInput => "SEND_INPUT",
        };
        f.write_str(name)
    }
}

/// One decoded or to-be-encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Type tag.
    pub kind: ChunkType,
    /// Payload bytes; the wire length is `payload.len()`.
    pub payload: Bytes,
}

impl Chunk {
    /// Build a chunk from any byte source.
    #[must_use]
    pub fn new(kind: ChunkType, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Build a chunk with no payload (`STDIN_EOF`, `HEARTBEAT`, `SEND_INPUT`).
    #[must_use]
    pub fn empty(kind: ChunkType) -> Self {
        Self {
            kind,
            payload: Bytes::new(),
        }
    }

    /// Build a chunk carrying UTF-8 text.
    #[must_use]
    pub fn text(kind: ChunkType, text: &str) -> Self {
        Self::new(kind, Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Payload decoded as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}
