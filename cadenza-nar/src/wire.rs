// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! The NAR wire primitive: length-prefixed, zero-padded strings.
//!
//! Every atom in a NAR is a string framed as a little-endian `u64` length,
//! the raw bytes, and zero bytes padding the total to a multiple of eight.
//! Tags (`(`, `type`, `regular`, …) are just strings containing ASCII.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::BadArchive;

/// Upper bound on any string we are willing to frame in memory. File
/// contents are streamed separately and not subject to this limit.
pub const MAX_STRING_LEN: u64 = 1024 * 1024;

pub(crate) const ZEROES: [u8; 8] = [0u8; 8];

/// Number of padding bytes after `len` content bytes.
#[inline]
pub const fn pad_len(len: u64) -> usize {
    ((8 - (len % 8)) % 8) as usize
}

/// Write one framed string.
pub async fn write_bytes<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    writer.write_u64_le(data.len() as u64).await?;
    writer.write_all(data).await?;
    writer.write_all(&ZEROES[..pad_len(data.len() as u64)]).await?;
    Ok(())
}

/// Read one framed string of bounded length.
pub async fn read_bytes<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, BadArchive> {
    let len = reader.read_u64_le().await.map_err(BadArchive::truncated)?;
    if len > MAX_STRING_LEN {
        return Err(BadArchive::Corrupt(format!(
            "string of length {len} exceeds limit"
        )));
    }
    let mut data = vec![0u8; len as usize];
    reader
        .read_exact(&mut data)
        .await
        .map_err(BadArchive::truncated)?;
    read_padding(reader, len).await?;
    Ok(data)
}

/// Consume and verify the zero padding after `len` content bytes.
pub async fn read_padding<R: AsyncRead + Unpin>(
    reader: &mut R,
    len: u64,
) -> Result<(), BadArchive> {
    let pad = pad_len(len);
    if pad == 0 {
        return Ok(());
    }
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf[..pad])
        .await
        .map_err(BadArchive::truncated)?;
    if buf[..pad].iter().any(|&b| b != 0) {
        return Err(BadArchive::Corrupt("non-zero padding".to_owned()));
    }
    Ok(())
}

/// Read a string and require it to equal `expected`.
pub async fn expect_tag<R: AsyncRead + Unpin>(
    reader: &mut R,
    expected: &str,
) -> Result<(), BadArchive> {
    let actual = read_bytes(reader).await?;
    if actual != expected.as_bytes() {
        return Err(BadArchive::Corrupt(format!(
            "expected tag '{expected}', got '{}'",
            String::from_utf8_lossy(&actual)
        )));
    }
    Ok(())
}
