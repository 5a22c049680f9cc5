// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Pull parser for NAR streams.
//!
//! [`NarParser`] yields a flat stream of [`NarEvent`]s and validates the
//! canonical-form rules as it goes: directory entries must be strictly
//! sorted, names must be plain (no `/`, NUL, `.`, `..` or the case-hack
//! suffix), padding must be zero. Anything else is [`BadArchive`].
//!
//! [`NarEncoder`] is the inverse: feeding it the event stream of a valid
//! archive reproduces the original bytes exactly, which is what makes NAR
//! hashes stable across parse/serialise round trips.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::wire::{self, expect_tag, read_bytes, read_padding, write_bytes};
use crate::{BadArchive, CASE_HACK_SUFFIX, NAR_VERSION_MAGIC};

/// Read granularity for file contents.
const CHUNK_SIZE: u64 = 64 * 1024;

/// One step of a NAR stream, in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NarEvent {
    /// A directory node begins. The root directory has an empty name.
    DirectoryStart { name: Bytes },
    DirectoryEnd,
    /// A regular file node begins; `size` bytes of [`NarEvent::FileData`]
    /// follow, then [`NarEvent::FileEnd`].
    FileStart {
        name: Bytes,
        executable: bool,
        size: u64,
    },
    FileData { chunk: Bytes },
    FileEnd,
    Symlink { name: Bytes, target: Bytes },
}

enum State {
    Start,
    /// Parse a node header; `name` is empty for the root.
    Node { name: Bytes },
    /// Streaming file contents.
    FileData { remaining: u64, total: u64 },
    /// Inside a directory, before the next `entry` or the closing `)`.
    DirectoryNext,
    /// A node just closed; unwind entry/EOF bookkeeping.
    AfterNode,
    Eof,
}

/// Validating pull parser over any [`AsyncRead`].
pub struct NarParser<R> {
    reader: R,
    state: State,
    /// Last entry name seen in each open directory, for sort checking.
    dir_stack: Vec<Option<Vec<u8>>>,
}

impl<R: AsyncRead + Unpin> NarParser<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            state: State::Start,
            dir_stack: Vec::new(),
        }
    }

    /// Recover the underlying reader (e.g. to check for trailing bytes).
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Next event, or `None` at the well-formed end of the archive.
    pub async fn next_event(&mut self) -> Result<Option<NarEvent>, BadArchive> {
        loop {
            match &mut self.state {
                State::Start => {
                    expect_tag(&mut self.reader, NAR_VERSION_MAGIC).await?;
                    self.state = State::Node { name: Bytes::new() };
                }

                State::Node { name } => {
                    let name = std::mem::take(name);
                    expect_tag(&mut self.reader, "(").await?;
                    expect_tag(&mut self.reader, "type").await?;
                    let node_type = read_bytes(&mut self.reader).await?;
                    match node_type.as_slice() {
                        b"regular" => {
                            let tag = read_bytes(&mut self.reader).await?;
                            let executable = match tag.as_slice() {
                                b"executable" => {
                                    expect_tag(&mut self.reader, "").await?;
                                    expect_tag(&mut self.reader, "contents").await?;
                                    true
                                }
                                b"contents" => false,
                                other => {
                                    return Err(BadArchive::Corrupt(format!(
                                        "unexpected tag '{}' in regular node",
                                        String::from_utf8_lossy(other)
                                    )));
                                }
                            };
                            let size = self
                                .reader
                                .read_u64_le()
                                .await
                                .map_err(BadArchive::truncated)?;
                            self.state = State::FileData {
                                remaining: size,
                                total: size,
                            };
                            return Ok(Some(NarEvent::FileStart {
                                name,
                                executable,
                                size,
                            }));
                        }
                        b"symlink" => {
                            expect_tag(&mut self.reader, "target").await?;
                            let target = read_bytes(&mut self.reader).await?;
                            if target.is_empty() {
                                return Err(BadArchive::Corrupt("empty symlink target".into()));
                            }
                            expect_tag(&mut self.reader, ")").await?;
                            self.state = State::AfterNode;
                            return Ok(Some(NarEvent::Symlink {
                                name,
                                target: target.into(),
                            }));
                        }
                        b"directory" => {
                            self.dir_stack.push(None);
                            self.state = State::DirectoryNext;
                            return Ok(Some(NarEvent::DirectoryStart { name }));
                        }
                        other => {
                            return Err(BadArchive::Corrupt(format!(
                                "unknown node type '{}'",
                                String::from_utf8_lossy(other)
                            )));
                        }
                    }
                }

                State::FileData { remaining, total } => {
                    if *remaining > 0 {
                        let want = (*remaining).min(CHUNK_SIZE) as usize;
                        let mut chunk = vec![0u8; want];
                        self.reader
                            .read_exact(&mut chunk)
                            .await
                            .map_err(BadArchive::truncated)?;
                        *remaining -= want as u64;
                        return Ok(Some(NarEvent::FileData {
                            chunk: chunk.into(),
                        }));
                    }
                    let total = *total;
                    read_padding(&mut self.reader, total).await?;
                    expect_tag(&mut self.reader, ")").await?;
                    self.state = State::AfterNode;
                    return Ok(Some(NarEvent::FileEnd));
                }

                State::DirectoryNext => {
                    let tag = read_bytes(&mut self.reader).await?;
                    match tag.as_slice() {
                        b"entry" => {
                            expect_tag(&mut self.reader, "(").await?;
                            expect_tag(&mut self.reader, "name").await?;
                            let name = read_bytes(&mut self.reader).await?;
                            validate_name(&name)?;
                            let last = self
                                .dir_stack
                                .last_mut()
                                .expect("DirectoryNext implies an open directory");
                            if let Some(prev) = last
                                && prev.as_slice() >= name.as_slice()
                            {
                                return Err(BadArchive::Unsorted {
                                    prev: String::from_utf8_lossy(prev).into_owned(),
                                    new: String::from_utf8_lossy(&name).into_owned(),
                                });
                            }
                            *last = Some(name.clone());
                            expect_tag(&mut self.reader, "node").await?;
                            self.state = State::Node { name: name.into() };
                        }
                        b")" => {
                            self.dir_stack.pop();
                            self.state = State::AfterNode;
                            return Ok(Some(NarEvent::DirectoryEnd));
                        }
                        other => {
                            return Err(BadArchive::Corrupt(format!(
                                "expected 'entry' or ')' in directory, got '{}'",
                                String::from_utf8_lossy(other)
                            )));
                        }
                    }
                }

                State::AfterNode => {
                    if self.dir_stack.is_empty() {
                        // Root node finished; require EOF.
                        let mut probe = [0u8; 1];
                        match self.reader.read(&mut probe).await {
                            Ok(0) => {
                                self.state = State::Eof;
                                return Ok(None);
                            }
                            Ok(_) => {
                                return Err(BadArchive::Corrupt(
                                    "trailing bytes after archive".into(),
                                ));
                            }
                            Err(e) => return Err(BadArchive::Io(e)),
                        }
                    }
                    // Close the `entry` wrapper around the finished node.
                    expect_tag(&mut self.reader, ")").await?;
                    self.state = State::DirectoryNext;
                }

                State::Eof => return Ok(None),
            }
        }
    }

    /// Drain the remaining events into a vector (small archives, tests).
    pub async fn collect_events(mut self) -> Result<Vec<NarEvent>, BadArchive> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await? {
            events.push(event);
        }
        Ok(events)
    }
}

fn validate_name(name: &[u8]) -> Result<(), BadArchive> {
    let printable = || String::from_utf8_lossy(name).into_owned();
    if name.is_empty() || name.len() > 255 {
        return Err(BadArchive::BadName(printable()));
    }
    if name == b"." || name == b".." {
        return Err(BadArchive::BadName(printable()));
    }
    if name.contains(&b'/') || name.contains(&0) {
        return Err(BadArchive::BadName(printable()));
    }
    if bstr::ByteSlice::contains_str(name, CASE_HACK_SUFFIX) {
        return Err(BadArchive::BadName(printable()));
    }
    Ok(())
}

/// Serialises an event stream back into NAR bytes.
///
/// Feeding the unmodified events of a parsed archive reproduces it byte
/// for byte.
pub struct NarEncoder<W> {
    writer: W,
    started: bool,
    depth: usize,
    /// Size declared by the open file node, for padding at `FileEnd`.
    file_size: u64,
}

impl<W: AsyncWrite + Unpin> NarEncoder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            started: false,
            depth: 0,
            file_size: 0,
        }
    }

    async fn open_node(&mut self, name: &[u8]) -> Result<(), BadArchive> {
        if !self.started {
            write_bytes(&mut self.writer, NAR_VERSION_MAGIC.as_bytes()).await?;
            self.started = true;
        }
        if self.depth > 0 {
            write_bytes(&mut self.writer, b"entry").await?;
            write_bytes(&mut self.writer, b"(").await?;
            write_bytes(&mut self.writer, b"name").await?;
            write_bytes(&mut self.writer, name).await?;
            write_bytes(&mut self.writer, b"node").await?;
        }
        write_bytes(&mut self.writer, b"(").await?;
        write_bytes(&mut self.writer, b"type").await?;
        Ok(())
    }

    async fn close_node(&mut self) -> Result<(), BadArchive> {
        write_bytes(&mut self.writer, b")").await?;
        if self.depth > 0 {
            // Close the `entry` wrapper.
            write_bytes(&mut self.writer, b")").await?;
        }
        Ok(())
    }

    pub async fn feed(&mut self, event: &NarEvent) -> Result<(), BadArchive> {
        match event {
            NarEvent::DirectoryStart { name } => {
                self.open_node(name).await?;
                write_bytes(&mut self.writer, b"directory").await?;
                self.depth += 1;
            }
            NarEvent::DirectoryEnd => {
                self.depth -= 1;
                self.close_node().await?;
            }
            NarEvent::FileStart {
                name,
                executable,
                size,
            } => {
                self.open_node(name).await?;
                write_bytes(&mut self.writer, b"regular").await?;
                if *executable {
                    write_bytes(&mut self.writer, b"executable").await?;
                    write_bytes(&mut self.writer, b"").await?;
                }
                write_bytes(&mut self.writer, b"contents").await?;
                self.writer.write_u64_le(*size).await?;
                self.file_size = *size;
            }
            NarEvent::FileData { chunk } => {
                self.writer.write_all(chunk).await?;
            }
            NarEvent::FileEnd => {
                let pad = wire::pad_len(self.file_size);
                self.writer.write_all(&wire::ZEROES[..pad]).await?;
                self.close_node().await?;
            }
            NarEvent::Symlink { name, target } => {
                self.open_node(name).await?;
                write_bytes(&mut self.writer, b"symlink").await?;
                write_bytes(&mut self.writer, b"target").await?;
                write_bytes(&mut self.writer, target).await?;
                self.close_node().await?;
            }
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Copy a parsed archive into an encoder, returning the byte-identical
/// serialisation. Mostly useful for validating untrusted streams while
/// forwarding them.
pub async fn reserialize<R, W>(mut parser: NarParser<R>, writer: W) -> Result<W, BadArchive>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut encoder = NarEncoder::new(writer);
    while let Some(event) = parser.next_event().await? {
        encoder.feed(&event).await?;
    }
    Ok(encoder.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::dump_to_vec;
    use crate::wire::write_bytes;

    async fn tag(buf: &mut Vec<u8>, s: &[u8]) {
        write_bytes(buf, s).await.unwrap();
    }

    /// Hand-build a directory NAR with the given entry names in order.
    async fn dir_nar(entries: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        tag(&mut buf, b"nix-archive-1").await;
        tag(&mut buf, b"(").await;
        tag(&mut buf, b"type").await;
        tag(&mut buf, b"directory").await;
        for name in entries {
            tag(&mut buf, b"entry").await;
            tag(&mut buf, b"(").await;
            tag(&mut buf, b"name").await;
            tag(&mut buf, name.as_bytes()).await;
            tag(&mut buf, b"node").await;
            tag(&mut buf, b"(").await;
            tag(&mut buf, b"type").await;
            tag(&mut buf, b"symlink").await;
            tag(&mut buf, b"target").await;
            tag(&mut buf, b"t").await;
            tag(&mut buf, b")").await;
            tag(&mut buf, b")").await;
        }
        tag(&mut buf, b")").await;
        buf
    }

    #[tokio::test]
    async fn parses_sorted_directory() {
        let nar = dir_nar(&["a", "b", "c"]).await;
        let events = NarParser::new(std::io::Cursor::new(nar))
            .collect_events()
            .await
            .unwrap();
        assert!(matches!(events[0], NarEvent::DirectoryStart { .. }));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, NarEvent::Symlink { .. }))
                .count(),
            3
        );
        assert!(matches!(events.last(), Some(NarEvent::DirectoryEnd)));
    }

    #[tokio::test]
    async fn rejects_unsorted_entries() {
        let nar = dir_nar(&["b", "a"]).await;
        let err = NarParser::new(std::io::Cursor::new(nar))
            .collect_events()
            .await
            .unwrap_err();
        assert!(matches!(err, BadArchive::Unsorted { .. }));
    }

    #[tokio::test]
    async fn rejects_duplicate_entries() {
        let nar = dir_nar(&["a", "a"]).await;
        let err = NarParser::new(std::io::Cursor::new(nar))
            .collect_events()
            .await
            .unwrap_err();
        assert!(matches!(err, BadArchive::Unsorted { .. }));
    }

    #[rstest::rstest]
    #[case::slash("a/b")]
    #[case::dot(".")]
    #[case::dotdot("..")]
    #[case::nul("a\0b")]
    #[case::case_hack("foo~nix~case~hack~1")]
    #[tokio::test]
    async fn rejects_bad_names(#[case] name: &str) {
        let nar = dir_nar(&[name]).await;
        let err = NarParser::new(std::io::Cursor::new(nar))
            .collect_events()
            .await
            .unwrap_err();
        assert!(matches!(err, BadArchive::BadName(_)), "{err}");
    }

    #[tokio::test]
    async fn rejects_bad_magic() {
        let mut buf = Vec::new();
        tag(&mut buf, b"not-an-archive").await;
        let err = NarParser::new(std::io::Cursor::new(buf))
            .collect_events()
            .await
            .unwrap_err();
        assert!(matches!(err, BadArchive::Corrupt(_)));
    }

    #[tokio::test]
    async fn rejects_trailing_garbage() {
        let mut nar = dir_nar(&[]).await;
        nar.push(0);
        let err = NarParser::new(std::io::Cursor::new(nar))
            .collect_events()
            .await
            .unwrap_err();
        assert!(matches!(err, BadArchive::Corrupt(_)));
    }

    /// Property 4 in concrete form: parse → re-serialise is the identity
    /// on a real dumped tree.
    #[tokio::test]
    async fn reserialize_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("file.txt"), b"contents\n").unwrap();
        std::fs::create_dir(root.join("sub")).unwrap();
        std::fs::write(root.join("sub").join("inner"), vec![7u8; 100_000]).unwrap();
        std::os::unix::fs::symlink("file.txt", root.join("link")).unwrap();

        let nar = dump_to_vec(&root).await.unwrap();
        let parser = NarParser::new(std::io::Cursor::new(&nar));
        let out = reserialize(parser, Vec::new()).await.unwrap();
        assert_eq!(out, nar);
    }
}
