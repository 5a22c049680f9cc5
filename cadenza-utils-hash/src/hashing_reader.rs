// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! An async reader adapter that hashes everything it reads.
//!
//! The digest state lives behind an `Arc<Mutex<…>>` so the caller can
//! extract the final hash and byte count even after the reader has been
//! moved into a consumer that does not hand it back (the NAR parser, a
//! decompressor, …).

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

use pin_project_lite::pin_project;
use tokio::io::AsyncRead;

use crate::{Algorithm, Context, Hash};

/// Shared accumulator for the incremental hash and byte count.
pub struct HashState {
    ctx: Context,
    /// Total number of bytes read through the reader so far.
    pub bytes_read: u64,
}

impl HashState {
    fn new(algorithm: Algorithm) -> Self {
        Self {
            ctx: Context::new(algorithm),
            bytes_read: 0,
        }
    }

    fn update(&mut self, data: &[u8]) {
        self.ctx.update(data);
        self.bytes_read += data.len() as u64;
    }

    /// Consume the state and return the final digest.
    pub fn finish(self) -> Hash {
        self.ctx.finish()
    }
}

impl std::fmt::Debug for HashState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashState")
            .field("algorithm", &self.ctx.algorithm())
            .field("bytes_read", &self.bytes_read)
            .finish_non_exhaustive()
    }
}

pin_project! {
    /// Wraps an [`AsyncRead`] and incrementally hashes every byte that
    /// passes through.
    pub struct HashingReader<R> {
        #[pin]
        inner: R,
        state: Arc<Mutex<HashState>>,
    }
}

impl<R> HashingReader<R> {
    /// Create a SHA-256 hashing reader. Returns the reader and a shared
    /// handle to the hash state.
    pub fn new(inner: R) -> (Self, Arc<Mutex<HashState>>) {
        Self::with_algorithm(inner, Algorithm::SHA256)
    }

    pub fn with_algorithm(inner: R, algorithm: Algorithm) -> (Self, Arc<Mutex<HashState>>) {
        let state = Arc::new(Mutex::new(HashState::new(algorithm)));
        let reader = Self {
            inner,
            state: Arc::clone(&state),
        };
        (reader, state)
    }
}

impl<R: AsyncRead> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let new_bytes = &buf.filled()[before..];
            if !new_bytes.is_empty() {
                this.state.lock().unwrap().update(new_bytes);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;

    #[tokio::test]
    async fn hashes_what_it_reads() {
        let data = b"hello, world";
        let (mut reader, state) = HashingReader::new(std::io::Cursor::new(data));

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, data);

        drop(reader);
        let state = Arc::try_unwrap(state).unwrap().into_inner().unwrap();
        assert_eq!(state.bytes_read, data.len() as u64);
        assert_eq!(state.finish(), Algorithm::SHA256.digest(data));
    }

    #[tokio::test]
    async fn empty_stream() {
        let (mut reader, state) = HashingReader::new(std::io::Cursor::new(b""));
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();

        drop(reader);
        let state = Arc::try_unwrap(state).unwrap().into_inner().unwrap();
        assert_eq!(state.bytes_read, 0);
        assert_eq!(state.finish(), Algorithm::SHA256.digest(b""));
    }
}
