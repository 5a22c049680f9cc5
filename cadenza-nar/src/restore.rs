// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! NAR → filesystem restoration.
//!
//! Restoration only ever *creates* entries: files are opened with
//! `O_CREAT|O_EXCL`, directories with `mkdir`, symlinks with `symlink`,
//! all of which fail if the target already exists. Combined with the
//! parser's name validation this means a hostile archive cannot overwrite
//! or escape the destination, even on filesystems that fold case or
//! normalise Unicode — a colliding name simply fails the restore instead
//! of silently clobbering a sibling (see the parser for the rejected name
//! forms).
//!
//! On case-folding filesystems the optional case hack renames colliding
//! entries by appending `~nix~case~hack~<n>`, which the dumper on such a
//! system strips again.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use bstr::ByteSlice as _;
use tokio::io::{AsyncRead, AsyncWriteExt as _};
use tracing::debug;

use crate::parse::{NarEvent, NarParser};
use crate::{BadArchive, CASE_HACK_SUFFIX};

#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error(transparent)]
    BadArchive(#[from] BadArchive),

    #[error("while creating '{path}': {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("entry name '{0}' is not representable on this system")]
    UnrepresentableName(String),
}

impl RestoreError {
    fn create(path: PathBuf, source: io::Error) -> Self {
        RestoreError::Create { path, source }
    }
}

/// Restoration options.
pub struct RestoreOptions {
    use_case_hack: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl RestoreOptions {
    pub fn new() -> Self {
        Self {
            // Darwin's default filesystems fold case.
            use_case_hack: cfg!(target_os = "macos"),
        }
    }

    pub fn use_case_hack(mut self, on: bool) -> Self {
        self.use_case_hack = on;
        self
    }

    /// Restore the archive read from `reader` to `dest`, which must not
    /// exist yet.
    pub async fn restore<R: AsyncRead + Unpin>(
        &self,
        reader: R,
        dest: impl Into<PathBuf>,
    ) -> Result<(), RestoreError> {
        let mut restorer = Restorer {
            path: dest.into(),
            use_case_hack: self.use_case_hack,
            seen: Vec::new(),
            current_file: None,
        };
        let mut parser = NarParser::new(reader);
        while let Some(event) = parser.next_event().await? {
            restorer.apply(event).await?;
        }
        Ok(())
    }
}

/// Restore with default options.
pub async fn restore<R: AsyncRead + Unpin>(
    reader: R,
    dest: impl Into<PathBuf>,
) -> Result<(), RestoreError> {
    RestoreOptions::new().restore(reader, dest).await
}

struct Restorer {
    /// Current target path; descends and ascends with directory events.
    path: PathBuf,
    use_case_hack: bool,
    /// Case-folded names seen per open directory.
    seen: Vec<HashMap<String, u32>>,
    current_file: Option<tokio::fs::File>,
}

impl Restorer {
    async fn apply(&mut self, event: NarEvent) -> Result<(), RestoreError> {
        match event {
            NarEvent::DirectoryStart { name } => {
                self.descend(&name)?;
                tokio::fs::create_dir(&self.path)
                    .await
                    .map_err(|e| RestoreError::create(self.path.clone(), e))?;
                self.seen.push(HashMap::new());
            }
            NarEvent::DirectoryEnd => {
                self.seen.pop();
                self.path.pop();
            }
            NarEvent::FileStart {
                name, executable, ..
            } => {
                self.descend(&name)?;
                let mut options = tokio::fs::OpenOptions::new();
                options.write(true).create_new(true);
                #[cfg(unix)]
                options.mode(if executable { 0o777 } else { 0o666 });
                let file = options
                    .open(&self.path)
                    .await
                    .map_err(|e| RestoreError::create(self.path.clone(), e))?;
                self.current_file = Some(file);
            }
            NarEvent::FileData { chunk } => {
                let file = self
                    .current_file
                    .as_mut()
                    .expect("FileData outside of a file node");
                file.write_all(&chunk)
                    .await
                    .map_err(|e| RestoreError::create(self.path.clone(), e))?;
            }
            NarEvent::FileEnd => {
                let mut file = self
                    .current_file
                    .take()
                    .expect("FileEnd outside of a file node");
                file.flush()
                    .await
                    .map_err(|e| RestoreError::create(self.path.clone(), e))?;
                self.path.pop();
            }
            NarEvent::Symlink { name, target } => {
                self.descend(&name)?;
                let target = target
                    .to_os_str()
                    .map_err(|_| {
                        RestoreError::UnrepresentableName(
                            String::from_utf8_lossy(&target).into_owned(),
                        )
                    })?
                    .to_owned();
                tokio::fs::symlink(&target, &self.path)
                    .await
                    .map_err(|e| RestoreError::create(self.path.clone(), e))?;
                self.path.pop();
            }
        }
        Ok(())
    }

    /// Append `name` to the current path, applying the case hack when
    /// enabled. The root node has an empty name and keeps the path as-is.
    fn descend(&mut self, name: &[u8]) -> Result<(), RestoreError> {
        if name.is_empty() {
            // Root node: restore directly to the destination. The matching
            // pop after the node lands on the parent, which is fine because
            // the archive ends there.
            return Ok(());
        }

        let mut name = name.to_vec();
        if self.use_case_hack
            && let Some(folded) = self.fold(&name)
        {
            debug!(
                "case collision on '{}'",
                String::from_utf8_lossy(&name)
            );
            name.extend_from_slice(format!("{CASE_HACK_SUFFIX}{folded}").as_bytes());
        }

        let os_name = name
            .to_os_str()
            .map_err(|_| {
                RestoreError::UnrepresentableName(String::from_utf8_lossy(&name).into_owned())
            })?
            .to_owned();
        self.path.push(os_name);
        Ok(())
    }

    /// Track case-folded names in the innermost directory; returns the
    /// collision index when `name` folds onto an earlier entry.
    fn fold(&mut self, name: &[u8]) -> Option<u32> {
        let table = self.seen.last_mut()?;
        let folded = String::from_utf8_lossy(name).to_lowercase();
        match table.get_mut(&folded) {
            Some(count) => {
                *count += 1;
                Some(*count)
            }
            None => {
                table.insert(folded, 0);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::dump_to_vec;
    use std::fs;
    use std::os::unix::fs::PermissionsExt as _;

    /// Build a tree, dump it, restore it elsewhere, dump again: the two
    /// archives are identical bytes.
    #[tokio::test]
    async fn dump_restore_dump_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("orig");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("file"), b"data\n").unwrap();
        fs::write(root.join("tool"), b"#!/bin/sh\n").unwrap();
        fs::set_permissions(root.join("tool"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::create_dir(root.join("nested")).unwrap();
        fs::write(root.join("nested/inner"), vec![1u8; 70_000]).unwrap();
        std::os::unix::fs::symlink("../file", root.join("nested/up")).unwrap();

        let nar = dump_to_vec(&root).await.unwrap();

        let copy = dir.path().join("copy");
        restore(std::io::Cursor::new(&nar), &copy).await.unwrap();

        // Executable bit survived.
        let mode = fs::metadata(copy.join("tool")).unwrap().permissions().mode();
        assert_ne!(mode & 0o100, 0);

        let nar2 = dump_to_vec(&copy).await.unwrap();
        assert_eq!(nar, nar2);
    }

    #[tokio::test]
    async fn refuses_existing_destination_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("orig");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("file"), b"data").unwrap();
        let nar = dump_to_vec(&root).await.unwrap();

        let dest = dir.path().join("dest");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("file"), b"theirs").unwrap();

        // The directory itself already exists, so the root create fails.
        let err = restore(std::io::Cursor::new(&nar), &dest).await.unwrap_err();
        assert!(matches!(err, RestoreError::Create { .. }));
        // The pre-existing file is untouched.
        assert_eq!(fs::read(dest.join("file")).unwrap(), b"theirs");
    }

    #[tokio::test]
    async fn restores_single_file_root() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("single");
        fs::write(&file, b"alone").unwrap();
        let nar = dump_to_vec(&file).await.unwrap();

        let dest = dir.path().join("restored");
        restore(std::io::Cursor::new(&nar), &dest).await.unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"alone");
    }

    /// With the case hack on, entries whose names differ only by case are
    /// both restored, the latter under the hack suffix.
    #[tokio::test]
    async fn case_hack_disambiguates() {
        use crate::wire::write_bytes;

        // Hand-build a directory with "foo" and "Foo": valid NAR (ASCII
        // sort puts "Foo" first), colliding only under case folding.
        let mut nar = Vec::new();
        for part in [&b"nix-archive-1"[..], b"(", b"type", b"directory"] {
            write_bytes(&mut nar, part).await.unwrap();
        }
        for name in [&b"Foo"[..], b"foo"] {
            for part in [&b"entry"[..], b"(", b"name", name, b"node", b"(", b"type", b"regular", b"contents"] {
                write_bytes(&mut nar, part).await.unwrap();
            }
            nar.extend_from_slice(&1u64.to_le_bytes());
            nar.extend_from_slice(b"x\0\0\0\0\0\0\0");
            for part in [&b")"[..], b")"] {
                write_bytes(&mut nar, part).await.unwrap();
            }
        }
        write_bytes(&mut nar, b")").await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        RestoreOptions::new()
            .use_case_hack(true)
            .restore(std::io::Cursor::new(&nar), &dest)
            .await
            .unwrap();

        let mut names: Vec<String> = fs::read_dir(&dest)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, ["Foo", format!("foo{CASE_HACK_SUFFIX}1")]);
    }
}
