//! Deflate compression plumbing for message bodies.
//!
//! Compression wraps only the payload portion of frames 2..N plus the
//! property-block-following bytes of frame 1 — the property block itself is
//! always sent uncompressed so the receiver can read it with a bounded peek.
//! Both sides use raw (headerless) deflate, matching the `flate2`/zlib
//! `Compress`/`Decompress` streaming API so bodies can be produced and
//! consumed incrementally across frame boundaries.

use crate::error::BlipError;
use bytes::{Bytes, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Wraps a full, already-assembled body in a one-shot deflate stream used as
/// the source for an outgoing compressed message's frames.
pub struct Deflator {
    compress: Compress,
}

impl Deflator {
    pub fn new() -> Self {
        Deflator {
            compress: Compress::new(Compression::default(), false),
        }
    }

    /// Compress the entire body in one call, producing the full compressed
    /// byte stream that `Message::next_frame` then slices into frames.
    pub fn compress_all(input: &[u8]) -> Bytes {
        let mut deflator = Deflator::new();
        let mut out = Vec::with_capacity(input.len() / 2 + 16);
        let mut buf = vec![0u8; 64 * 1024];
        let mut offset = 0;
        loop {
            let before_in = deflator.compress.total_in() as usize;
            let before_out = deflator.compress.total_out() as usize;
            let remaining = &input[offset..];
            let flush = if remaining.is_empty() {
                FlushCompress::Finish
            } else {
                FlushCompress::None
            };
            let status = deflator
                .compress
                .compress(remaining, &mut buf, flush)
                .expect("deflate compression cannot fail on in-memory buffers");
            let produced = deflator.compress.total_out() as usize - before_out;
            out.extend_from_slice(&buf[..produced]);
            offset += deflator.compress.total_in() as usize - before_in;
            if status == Status::StreamEnd {
                break;
            }
            if offset >= input.len() && produced == 0 {
                break;
            }
        }
        Bytes::from(out)
    }
}

/// Incremental raw-deflate decompressor fed one arriving chunk at a time as
/// frames for a compressed incoming message are received.
pub struct Inflator {
    decompress: Decompress,
}

impl Inflator {
    pub fn new() -> Self {
        Inflator {
            decompress: Decompress::new(false),
        }
    }

    /// Feed another chunk of compressed bytes, appending any newly produced
    /// plaintext to `out`. Returns an error if the deflate stream is corrupt.
    pub fn feed(&mut self, chunk: &[u8], out: &mut BytesMut) -> Result<(), BlipError> {
        let mut buf = [0u8; 64 * 1024];
        let mut offset = 0;
        loop {
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self
                .decompress
                .decompress(&chunk[offset..], &mut buf, FlushDecompress::None)
                .map_err(|e| BlipError::BadData(format!("deflate decompression failed: {e}")))?;
            let produced = (self.decompress.total_out() - before_out) as usize;
            let consumed = (self.decompress.total_in() - before_in) as usize;
            out.extend_from_slice(&buf[..produced]);
            offset += consumed;

            if status == Status::StreamEnd || offset >= chunk.len() {
                break;
            }
            if consumed == 0 && produced == 0 {
                // No forward progress with input remaining: the stream is
                // stalled, which `flate2` should never do for `None` flush
                // on valid input, but guard against looping forever.
                return Err(BlipError::BadData(
                    "deflate decompression made no progress".into(),
                ));
            }
        }
        Ok(())
    }
}

impl Default for Deflator {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for Inflator {
    fn default() -> Self {
        Self::new()
    }
}
