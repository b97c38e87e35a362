//! Nailgun wire protocol.
//!
//! Every frame on the wire is a chunk: a 4-byte big-endian payload length,
//! a 1-byte type tag, then the payload itself.
//!
//! - `chunk`: [`ChunkType`] tags and the owned [`Chunk`] frame.
//! - `codec`: [`ChunkCodec`] for use with
//!   [`FramedRead`](tokio_util::codec::FramedRead) and
//!   [`FramedWrite`](tokio_util::codec::FramedWrite).
//! - `context`: the [`CommandContext`] assembled from the header chunks.

pub mod chunk;
pub mod codec;
pub mod context;

pub use chunk::{Chunk, ChunkType};
pub use codec::ChunkCodec;
pub use context::{CommandContext, Environment};
