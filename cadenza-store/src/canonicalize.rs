// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Metadata canonicalisation for store objects.
//!
//! Store objects are immutable and identical across machines, so their
//! metadata must carry no information beyond the NAR serialisation:
//! permissions collapse to `0444` (`0555` with owner-execute), every
//! timestamp becomes epoch + 1, and, when running privileged, ownership
//! goes to the store's owner.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::fs::{MetadataExt as _, PermissionsExt as _};
use std::path::Path;

use nix::unistd::{Gid, Uid, geteuid};

/// The canonical mtime of everything in the store.
pub const CANONICAL_MTIME: i64 = 1;

/// Set atime and mtime without following symlinks
/// (`utimensat(AT_SYMLINK_NOFOLLOW)`).
#[allow(unsafe_code)]
fn set_timestamp(path: &Path, seconds: i64) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let times = [
        libc::timespec {
            tv_sec: seconds,
            tv_nsec: 0,
        },
        libc::timespec {
            tv_sec: seconds,
            tv_nsec: 0,
        },
    ];
    // SAFETY: c_path is a valid NUL-terminated string and times a valid
    // 2-element array; AT_SYMLINK_NOFOLLOW keeps symlinks untouched.
    let ret = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Canonicalise all metadata under `path` recursively.
///
/// Runs the blocking walk on the blocking pool.
pub async fn canonicalise_path_metadata(path: &Path) -> io::Result<()> {
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || canonicalise_sync(&path))
        .await
        .map_err(io::Error::other)?
}

fn canonicalise_sync(path: &Path) -> io::Result<()> {
    canonicalise_entry(path)?;
    if path.is_dir() && !fs::symlink_metadata(path)?.is_symlink() {
        for entry in fs::read_dir(path)? {
            canonicalise_sync(&entry?.path())?;
        }
    }
    Ok(())
}

fn canonicalise_entry(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;

    if !metadata.is_symlink() {
        // 0444, plus execute bits when the owner could execute. This also
        // strips setuid/setgid/sticky.
        let mode = metadata.permissions().mode();
        let canonical = if mode & 0o100 != 0 { 0o555 } else { 0o444 };
        if mode & 0o7777 != canonical {
            fs::set_permissions(path, fs::Permissions::from_mode(canonical))?;
        }

        if metadata.mtime() != CANONICAL_MTIME {
            set_timestamp(path, CANONICAL_MTIME)?;
        }

        // Only root may change ownership; for everyone else the files
        // already belong to the invoking user.
        if geteuid().is_root() && (metadata.uid() != 0 || metadata.gid() != 0) {
            nix::unistd::chown(path, Some(Uid::from_raw(0)), Some(Gid::from_raw(0)))
                .map_err(io::Error::other)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_file_becomes_0444() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, "x").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o664)).unwrap();

        canonicalise_path_metadata(&file).await.unwrap();

        let mode = fs::metadata(&file).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o444);
        assert_eq!(fs::metadata(&file).unwrap().mtime(), CANONICAL_MTIME);
    }

    #[tokio::test]
    async fn executable_file_becomes_0555() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("tool");
        fs::write(&file, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o2755)).unwrap();

        canonicalise_path_metadata(&file).await.unwrap();

        let mode = fs::metadata(&file).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o555, "setgid stripped, execute preserved");
    }

    #[tokio::test]
    async fn recurses_into_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("inner"), "x").unwrap();

        canonicalise_path_metadata(&root).await.unwrap();

        assert_eq!(
            fs::metadata(root.join("inner")).unwrap().permissions().mode() & 0o7777,
            0o444
        );
        assert_eq!(
            fs::metadata(&root).unwrap().permissions().mode() & 0o7777,
            0o555,
            "directories keep their search bit"
        );
        assert_eq!(fs::metadata(&root).unwrap().mtime(), CANONICAL_MTIME);
    }

    #[tokio::test]
    async fn symlinks_are_left_alone() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir(&root).unwrap();
        std::os::unix::fs::symlink("missing-target", root.join("link")).unwrap();

        canonicalise_path_metadata(&root).await.unwrap();
    }
}
