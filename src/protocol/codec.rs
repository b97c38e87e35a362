//! Length-prefixed chunk codec.
//!
//! Use [`ChunkCodec`] as the codec parameter for
//! [`tokio_util::codec::FramedRead`] (inbound) and
//! [`tokio_util::codec::FramedWrite`] (outbound). Encoding a chunk produces
//! one contiguous `length + type + payload` unit in the write buffer, so a
//! single `send` on the framed sink never interleaves with another chunk.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tokio_util::codec::FramedRead;
//! use nailgun::protocol::ChunkCodec;
//!
//! let reader = FramedRead::new(read_half, ChunkCodec::new());
//! ```

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::protocol::chunk::{Chunk, ChunkType, HEADER_LEN, MAX_PAYLOAD_LEN};
use crate::{AppError, Result};

/// Decoder/encoder for nailgun chunks.
///
/// # Decoder
///
/// Returns `Ok(None)` until a whole chunk is buffered. A length prefix
/// larger than [`MAX_PAYLOAD_LEN`] or an unknown type tag returns
/// [`AppError::Protocol`]. A stream that ends partway through a chunk is
/// treated as a clean end-of-stream, not an error.
///
/// # Encoder
///
/// Writes the big-endian length, the type tag and the payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChunkCodec {
    _priv: (),
}

impl ChunkCodec {
    /// Create a new codec.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for ChunkCodec {
    type Item = Chunk;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = &src[..HEADER_LEN];
        let len = header.get_u32() as usize;
        let tag = header.get_u8();

        if len > MAX_PAYLOAD_LEN {
            return Err(AppError::Protocol(format!(
                "chunk length {len} exceeds {MAX_PAYLOAD_LEN} bytes"
            )));
        }
        let kind = ChunkType::try_from(tag)?;

        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Chunk { kind, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(chunk) => Ok(Some(chunk)),
            None => {
                if !src.is_empty() {
                    debug!(buffered = src.len(), "stream ended inside a chunk");
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Chunk> for ChunkCodec {
    type Error = AppError;

    fn encode(&mut self, item: Chunk, dst: &mut BytesMut) -> Result<()> {
        let len = item.payload.len();
        let wire_len = u32::try_from(len)
            .ok()
            .filter(|n| *n as usize <= MAX_PAYLOAD_LEN)
            .ok_or_else(|| {
                AppError::Protocol(format!("chunk length {len} exceeds {MAX_PAYLOAD_LEN} bytes"))
            })?;

        dst.reserve(HEADER_LEN + len);
        dst.put_u32(wire_len);
        dst.put_u8(item.kind.as_byte());
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}
