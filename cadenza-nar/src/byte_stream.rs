// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! A NAR serialisation as a `Stream` of byte chunks.
//!
//! A background task walks the filesystem and encodes into a bounded
//! channel, so the encoder can run ahead of a slow consumer (an uploader,
//! a compressor) without unbounded memory growth; a full channel
//! back-pressures the walk.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::dump;

/// Default chunk size (64 KiB).
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered in the channel before the encoder blocks.
const CHANNEL_CAPACITY: usize = 4;

/// An [`AsyncWrite`] that freezes its buffer into [`Bytes`] chunks and
/// sends them through a bounded channel.
struct ChannelWriter {
    sender: PollSender<io::Result<Bytes>>,
    buffer: BytesMut,
    chunk_size: usize,
}

impl ChannelWriter {
    fn new(sender: PollSender<io::Result<Bytes>>, chunk_size: usize) -> Self {
        Self {
            sender,
            buffer: BytesMut::with_capacity(chunk_size),
            chunk_size,
        }
    }

    fn poll_emit(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.buffer.is_empty() {
            return Poll::Ready(Ok(()));
        }
        ready!(self.sender.poll_reserve(cx))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "consumer went away"))?;
        let chunk = std::mem::replace(&mut self.buffer, BytesMut::with_capacity(self.chunk_size));
        self.sender
            .send_item(Ok(chunk.freeze()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "consumer went away"))?;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.buffer.len() >= self.chunk_size {
            ready!(self.as_mut().poll_emit(cx))?;
        }
        let n = buf.len().min(self.chunk_size - self.buffer.len());
        self.buffer.extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_emit(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_emit(cx)
    }
}

/// A [`Stream`] of NAR bytes for a filesystem path.
pub struct NarByteStream {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl NarByteStream {
    pub fn new(path: PathBuf) -> Self {
        Self::with_chunk_size(path, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(path: PathBuf, chunk_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::task::spawn(async move {
            let sender = PollSender::new(tx.clone());
            let mut writer = ChannelWriter::new(sender, chunk_size);
            if let Err(e) = dump::dump_to_writer(&path, &mut writer).await {
                let _ = tx.send(Err(io::Error::other(e))).await;
                return;
            }
            // Flush the final partial chunk.
            if let Err(e) = tokio::io::AsyncWriteExt::shutdown(&mut writer).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        Self { rx }
    }
}

impl Stream for NarByteStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
