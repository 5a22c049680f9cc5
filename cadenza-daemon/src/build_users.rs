// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Build-user UID allocation.
//!
//! Each concurrent sandboxed build runs under its own UID, taken from a
//! configured range. A slot is claimed by holding an exclusive lock on
//! `<pool>/<slot>` for the duration of the build, so allocation works
//! across daemon processes and slots free themselves when a holder dies.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

/// UIDs reserved per build slot (a contiguous range for builds that want
/// their own subordinate users).
pub const IDS_PER_BUILD: u32 = 1;

/// A claimed build-user slot; the UID stays ours until drop.
pub struct UserLock {
    uid: u32,
    _flock: Flock<std::fs::File>,
    _lock_path: PathBuf,
}

impl UserLock {
    pub fn uid(&self) -> u32 {
        self.uid
    }
}

/// Claim a free slot in `[start_id, start_id + id_count)`.
///
/// Returns `None` when every slot is taken.
pub fn acquire_user_lock(
    pool_dir: &Path,
    start_id: u32,
    id_count: u32,
) -> io::Result<Option<UserLock>> {
    std::fs::create_dir_all(pool_dir)?;

    let slots = id_count / IDS_PER_BUILD;
    for slot in 0..slots {
        let lock_path = pool_dir.join(slot.to_string());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => {
                return Ok(Some(UserLock {
                    uid: start_id + slot * IDS_PER_BUILD,
                    _flock: flock,
                    _lock_path: lock_path,
                }));
            }
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => continue,
            Err((_, errno)) => return Err(io::Error::from_raw_os_error(errno as i32)),
        }
    }
    Ok(None)
}
