// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Filesystem → NAR serialisation.
//!
//! The dump is deterministic: directory entries are emitted in ascending
//! raw-byte order, a regular file is `executable` iff its owner-execute
//! bit is set, and nothing else about the on-disk metadata (timestamps,
//! ownership, other permission bits) is represented at all. Sockets,
//! fifos and devices are refused.

use std::io;
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::wire::{pad_len, write_bytes, ZEROES};
use crate::{BadArchive, NAR_VERSION_MAGIC};

/// Filter deciding which paths enter the archive. Returning `false`
/// omits the entry (and its subtree) entirely.
pub type PathFilter = dyn Fn(&Path) -> bool + Send + Sync;

/// Options for dumping a path.
#[derive(Default)]
pub struct DumpOptions {
    filter: Option<Box<PathFilter>>,
}

impl DumpOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: impl Fn(&Path) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Serialise `path` into `writer`.
    pub async fn dump<W: AsyncWrite + Unpin + Send>(
        &self,
        path: impl AsRef<Path>,
        writer: &mut W,
    ) -> Result<(), BadArchive> {
        write_bytes(writer, NAR_VERSION_MAGIC.as_bytes()).await?;
        dump_node(path.as_ref(), writer, self.filter.as_deref()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Serialise `path` into `writer` without filtering.
pub async fn dump_to_writer<W: AsyncWrite + Unpin + Send>(
    path: impl AsRef<Path>,
    writer: &mut W,
) -> Result<(), BadArchive> {
    DumpOptions::new().dump(path, writer).await
}

/// Serialise `path` into memory. Intended for small trees and tests.
pub async fn dump_to_vec(path: impl AsRef<Path>) -> Result<Vec<u8>, BadArchive> {
    let mut buf = Vec::new();
    dump_to_writer(path, &mut buf).await?;
    Ok(buf)
}

fn dump_node<'a, W: AsyncWrite + Unpin + Send>(
    path: &'a Path,
    writer: &'a mut W,
    filter: Option<&'a PathFilter>,
) -> futures::future::BoxFuture<'a, Result<(), BadArchive>> {
    Box::pin(async move {
        let meta = tokio::fs::symlink_metadata(path).await?;
        let file_type = meta.file_type();

        write_bytes(writer, b"(").await?;
        write_bytes(writer, b"type").await?;

        if file_type.is_file() {
            write_bytes(writer, b"regular").await?;
            if meta.permissions().mode() & 0o100 != 0 {
                write_bytes(writer, b"executable").await?;
                write_bytes(writer, b"").await?;
            }
            write_bytes(writer, b"contents").await?;
            let file = tokio::fs::File::open(path).await?;
            dump_contents(file, meta.len(), path, writer).await?;
        } else if file_type.is_symlink() {
            write_bytes(writer, b"symlink").await?;
            write_bytes(writer, b"target").await?;
            let target = tokio::fs::read_link(path).await?;
            write_bytes(writer, target.as_os_str().as_bytes()).await?;
        } else if file_type.is_dir() {
            write_bytes(writer, b"directory").await?;

            let mut names: Vec<PathBuf> = Vec::new();
            let mut entries = tokio::fs::read_dir(path).await?;
            while let Some(entry) = entries.next_entry().await? {
                names.push(PathBuf::from(entry.file_name()));
            }
            // Canonical order is ascending over the raw bytes of the name.
            names.sort_by(|a, b| a.as_os_str().as_bytes().cmp(b.as_os_str().as_bytes()));

            for name in names {
                let child = path.join(&name);
                if let Some(filter) = filter
                    && !filter(&child)
                {
                    continue;
                }
                write_bytes(writer, b"entry").await?;
                write_bytes(writer, b"(").await?;
                write_bytes(writer, b"name").await?;
                write_bytes(writer, name.as_os_str().as_bytes()).await?;
                write_bytes(writer, b"node").await?;
                dump_node(&child, writer, filter).await?;
                write_bytes(writer, b")").await?;
            }
        } else {
            return Err(BadArchive::UnsupportedType(path.to_owned()));
        }

        write_bytes(writer, b")").await?;
        Ok(())
    })
}

/// Stream exactly `size` bytes of file contents plus padding.
async fn dump_contents<R, W>(
    mut file: R,
    size: u64,
    path: &Path,
    writer: &mut W,
) -> Result<(), BadArchive>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_u64_le(size).await?;

    let mut remaining = size;
    let mut buf = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let got = file.read(&mut buf[..want]).await?;
        if got == 0 {
            // The file shrank while we were copying it.
            return Err(BadArchive::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file '{}' changed while reading", path.display()),
            )));
        }
        writer.write_all(&buf[..got]).await?;
        remaining -= got as u64;
    }

    writer.write_all(&ZEROES[..pad_len(size)]).await?;
    Ok(())
}
