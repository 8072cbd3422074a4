//! # Payload Generation
//!
//! Download payloads are served from a pool of pseudo-random bytes generated
//! once at startup. Chunks are `Bytes` slices into that pool, so streaming
//! costs no copying and no per-chunk randomness. The pool is larger than the
//! history window of common HTTP compressors, which keeps compressing
//! middleboxes from inflating the measured rate.
//!
//! Uploads go the other way through [`sink`], which counts incoming bytes
//! and discards them without buffering the body.

use crate::throughput::TransferCounter;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Source of the bytes the payload pool is built from
///
/// Abstracted so tests can pin the payload contents.
pub trait ByteSource: Send {
    fn fill(&mut self, buf: &mut [u8]);
}

/// `ByteSource` backed by a seedable PRNG
pub struct SeededByteSource {
    rng: StdRng,
}

impl SeededByteSource {
    /// Deterministic source: equal seeds produce equal payloads
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl ByteSource for SeededByteSource {
    fn fill(&mut self, buf: &mut [u8]) {
        self.rng.fill_bytes(buf);
    }
}

/// Pre-generated payload pool and the chunking policy over it
#[derive(Debug, Clone)]
pub struct PayloadGenerator {
    pool: Bytes,
    chunk_size: usize,
}

impl PayloadGenerator {
    pub fn new(source: &mut dyn ByteSource, pool_size: usize, chunk_size: usize) -> Self {
        let mut pool = vec![0u8; pool_size.max(1)];
        source.fill(&mut pool);
        let chunk_size = chunk_size.clamp(1, pool.len());
        Self {
            pool: Bytes::from(pool),
            chunk_size,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Fill `buffer` with exactly `size` payload bytes, reusing its allocation
    pub fn fill(&self, buffer: &mut Vec<u8>, size: usize) {
        buffer.clear();
        buffer.reserve(size);
        let mut remaining = size;
        while remaining > 0 {
            let n = remaining.min(self.pool.len());
            buffer.extend_from_slice(&self.pool[..n]);
            remaining -= n;
        }
    }

    /// Endless sequence of chunks cycling through the pool
    pub fn chunks(&self) -> PayloadChunks {
        PayloadChunks {
            pool: self.pool.clone(),
            chunk_size: self.chunk_size,
            offset: 0,
        }
    }

    /// Stream chunks until `stop` is cancelled, counting what was handed out.
    ///
    /// If the stream is dropped before `stop` fires, e.g. because the client
    /// disconnected, `disconnect` is cancelled.
    pub fn download_stream(
        &self,
        counter: TransferCounter,
        stop: CancellationToken,
        disconnect: CancellationToken,
    ) -> DownloadStream {
        DownloadStream {
            chunks: self.chunks(),
            counter,
            stopped: Box::pin(stop.cancelled_owned()),
            disconnect,
            finished: false,
        }
    }
}

/// Iterator over pool slices, see [`PayloadGenerator::chunks`]
#[derive(Debug, Clone)]
pub struct PayloadChunks {
    pool: Bytes,
    chunk_size: usize,
    offset: usize,
}

impl Iterator for PayloadChunks {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.offset >= self.pool.len() {
            self.offset = 0;
        }
        let end = (self.offset + self.chunk_size).min(self.pool.len());
        let chunk = self.pool.slice(self.offset..end);
        self.offset = end;
        Some(chunk)
    }
}

/// Response body of a download phase
pub struct DownloadStream {
    chunks: PayloadChunks,
    counter: TransferCounter,
    stopped: Pin<Box<WaitForCancellationFutureOwned>>,
    disconnect: CancellationToken,
    finished: bool,
}

impl std::fmt::Debug for DownloadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadStream")
            .field("chunks", &self.chunks)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Stream for DownloadStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        if self.stopped.as_mut().poll(cx).is_ready() {
            self.finished = true;
            return Poll::Ready(None);
        }
        match self.chunks.next() {
            Some(chunk) => {
                self.counter.add(chunk.len() as u64);
                Poll::Ready(Some(Ok(chunk)))
            }
            None => {
                self.finished = true;
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for DownloadStream {
    fn drop(&mut self) {
        if !self.finished {
            self.disconnect.cancel();
        }
    }
}

/// Drain an upload body, counting its bytes into `counter`.
///
/// The counter is closed once the body ends cleanly. Returns the number of
/// bytes read, or the body's error.
pub async fn sink<S, E>(mut body: S, counter: &TransferCounter) -> Result<u64, E>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    let mut total = 0u64;
    while let Some(chunk) = body.next().await {
        let len = chunk?.len() as u64;
        counter.add(len);
        total += len;
    }
    counter.close();
    Ok(total)
}
