// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Filesystem locks for cross-process coordination.
//!
//! A store path `<p>` under construction is protected by an exclusive
//! `flock()` on `<p>.lock`, so two daemons (or a daemon and a GC) never
//! race on the same output. The garbage collector itself serialises
//! against writers through a multiple-reader/single-writer lock on one
//! global `gc.lock` file: ingestion and registration take the shared
//! side, collection takes the exclusive side.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

/// An exclusive lock on one store path, backed by `<path>.lock`.
///
/// Released on drop.
pub struct PathLock {
    _flock: Flock<File>,
    lock_path: PathBuf,
}

impl PathLock {
    /// Acquire, blocking until the holder releases.
    pub fn lock(path: &Path) -> io::Result<Self> {
        Self::acquire(path, FlockArg::LockExclusive).map(|lock| {
            lock.expect("blocking flock cannot report contention")
        })
    }

    /// Try to acquire without blocking; `None` when held elsewhere.
    pub fn try_lock(path: &Path) -> io::Result<Option<Self>> {
        Self::acquire(path, FlockArg::LockExclusiveNonblock)
    }

    fn acquire(path: &Path, arg: FlockArg) -> io::Result<Option<Self>> {
        let lock_path = PathBuf::from(format!("{}.lock", path.display()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        match Flock::lock(file, arg) {
            Ok(flock) => Ok(Some(Self {
                _flock: flock,
                lock_path,
            })),
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(io::Error::from_raw_os_error(errno as i32)),
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

/// Probe whether an exclusive lock on an existing file is free, releasing
/// it immediately. Used by the collector to detect temp-root files whose
/// owning process has died (a live owner holds the lock).
pub fn probe_lock_free(path: &Path) -> io::Result<bool> {
    let file = OpenOptions::new().read(true).open(path)?;
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(_flock) => Ok(true),
        Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(false),
        Err((_, errno)) => Err(io::Error::from_raw_os_error(errno as i32)),
    }
}

/// Which side of the reader/writer file lock to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Writers to the store: ingestion, registration, temp-root creation.
    Shared,
    /// The collector: excludes all writers.
    Exclusive,
}

/// The global GC lock.
pub struct GcLock {
    _flock: Flock<File>,
}

impl GcLock {
    /// Acquire the lock file at `lock_path`, blocking.
    pub fn acquire(lock_path: &Path, mode: LockMode) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;
        let arg = match mode {
            LockMode::Shared => FlockArg::LockShared,
            LockMode::Exclusive => FlockArg::LockExclusive,
        };
        let flock = Flock::lock(file, arg)
            .map_err(|(_, errno)| io::Error::from_raw_os_error(errno as i32))?;
        Ok(Self { _flock: flock })
    }
}
