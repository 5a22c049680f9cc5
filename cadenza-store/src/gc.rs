// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Garbage collection: roots, temp roots and the collector.
//!
//! The live set is the closure of three root kinds:
//!
//! - permanent roots: symlinks under `<state>/gcroots` (the `auto`
//!   subdirectory holds indirect roots pointing at user symlinks),
//! - temp roots: per-process files under `<state>/temproots`, exclusively
//!   locked while their owner lives,
//! - runtime roots: store paths held open by any running process — its
//!   executable, working directory, open file descriptors, mapped files
//!   or environment — scanned from `/proc` on Linux;
//!
//! a path not reachable from these is dead.
//!
//! The collector holds the exclusive side of the GC lock, so no writer
//! can register paths or add temp roots while the live set is computed
//! and the dead set deleted. Deletion is referrer-first, which both keeps
//! the database's foreign keys satisfied and preserves the "no dangling
//! references among valid paths" invariant at every step.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use cadenza_store_core::store_path::{StoreDir, StorePath};
use cadenza_utils_hash::Algorithm;

use crate::error::{Result, StoreError};
use crate::local::{LocalStore, remove_path_forcibly};
use crate::pathlocks::{GcLock, LockMode};
use crate::store::Store as _;

/// What the collector should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcAction {
    /// Report the dead set without deleting anything.
    ReturnDead,
    /// Delete everything dead.
    DeleteDead,
    /// Delete exactly these paths, failing if any is alive.
    DeleteSpecific(BTreeSet<StorePath>),
}

#[derive(Debug, Clone)]
pub struct GcOptions {
    pub action: GcAction,
    /// Stop after freeing this many bytes.
    pub max_freed: Option<u64>,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            action: GcAction::DeleteDead,
            max_freed: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct GcResults {
    /// Paths deleted (or that would be deleted), in deletion order.
    pub paths: Vec<StorePath>,
    pub bytes_freed: u64,
}

impl LocalStore {
    /// Pin `path` against collection for the lifetime of this process.
    ///
    /// The pin is durable (written and flushed) before this returns, so a
    /// caller may rely on the path surviving a concurrent GC afterwards.
    pub async fn add_temp_root(&self, path: &StorePath) -> Result<()> {
        // Writers may not race the collector's live-set computation.
        let _writer = self.writer_lock().await?;

        let line = format!("{}\0", self.display_path(path));
        let temproots_file = self.temproots_dir().join(std::process::id().to_string());

        let mut guard = self.temp_roots.lock().expect("temp roots lock poisoned");
        if guard.is_none() {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&temproots_file)?;
            // Hold an exclusive lock for as long as we live; the collector
            // treats a lockable file as a dead process's leftovers.
            let flock =
                nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusiveNonblock)
                    .map_err(|(_, errno)| {
                        StoreError::Io(std::io::Error::from_raw_os_error(errno as i32))
                    })?;
            *guard = Some(flock);
        }
        let file = guard.as_mut().expect("just initialised");
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Create a permanent root `gcroots/<name>` pointing at `path`.
    pub async fn add_root(&self, name: &str, path: &StorePath) -> Result<PathBuf> {
        let root = self.gcroots_dir().join(name);
        let target = self.display_path(path);
        let _ = tokio::fs::remove_file(&root).await;
        tokio::fs::symlink(&target, &root).await?;
        Ok(root)
    }

    /// Register `symlink` (a user-owned symlink to a store path) as an
    /// indirect root under `gcroots/auto/<hash>`.
    pub async fn add_indirect_root(&self, symlink: &Path) -> Result<()> {
        let canonical = symlink.to_string_lossy();
        let hash = Algorithm::SHA256.digest(canonical.as_bytes()).to_base32();
        let auto_link = self.gcroots_dir().join("auto").join(hash);
        let _ = tokio::fs::remove_file(&auto_link).await;
        tokio::fs::symlink(symlink, &auto_link).await?;
        Ok(())
    }

    /// Enumerate permanent roots: a map from root location to target.
    ///
    /// Stale indirect roots (whose user symlink disappeared) are pruned
    /// as a side effect.
    pub async fn find_roots(&self) -> Result<BTreeMap<PathBuf, StorePath>> {
        let mut roots = BTreeMap::new();
        let gcroots = self.gcroots_dir();
        self.scan_roots_dir(&gcroots, &mut roots).await?;
        Ok(roots)
    }

    async fn scan_roots_dir(
        &self,
        dir: &Path,
        roots: &mut BTreeMap<PathBuf, StorePath>,
    ) -> Result<()> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let entry_path = entry.path();
            let meta = tokio::fs::symlink_metadata(&entry_path).await?;
            if meta.is_dir() {
                Box::pin(self.scan_roots_dir(&entry_path, roots)).await?;
                continue;
            }
            if !meta.is_symlink() {
                continue;
            }
            let target = tokio::fs::read_link(&entry_path).await?;
            match self.resolve_root(&entry_path, &target).await {
                Some(store_path) => {
                    roots.insert(entry_path, store_path);
                }
                None => {
                    // Indirect roots whose user symlink is gone are dead.
                    if entry_path.starts_with(self.gcroots_dir().join("auto")) {
                        debug!(root = %entry_path.display(), "removing stale indirect root");
                        let _ = tokio::fs::remove_file(&entry_path).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve a root symlink to a store path: either it points into the
    /// store directly, or (indirect root) at a user symlink that does.
    async fn resolve_root(&self, _link: &Path, target: &Path) -> Option<StorePath> {
        let target_str = target.to_string_lossy();
        if let Ok(path) = self.store_dir_ref().to_store_path(&target_str) {
            return Some(path);
        }
        let user_target = tokio::fs::read_link(target).await.ok()?;
        self.store_dir_ref()
            .to_store_path(&user_target.to_string_lossy())
            .ok()
    }

    fn store_dir_ref(&self) -> &cadenza_store_core::StoreDir {
        &self.config().store_dir
    }

    /// Roots held by running processes.
    ///
    /// A store path mapped into a process's address space, open as a
    /// file descriptor, serving as its executable or working directory,
    /// or present in its environment is in use no matter what the root
    /// directories say. Only Linux exposes this through `/proc`; on
    /// other platforms the scan is empty and temp roots carry the load.
    /// Processes that vanish mid-scan are skipped, not errors.
    pub async fn find_runtime_roots(&self) -> Result<BTreeSet<StorePath>> {
        let store_dir = self.config().store_dir.clone();
        tokio::task::spawn_blocking(move || scan_proc_roots(&store_dir))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }

    /// Read every live process's temp roots.
    async fn read_temp_roots(&self) -> Result<BTreeSet<StorePath>> {
        let mut out = BTreeSet::new();
        let dir = self.temproots_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(out),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_path = entry.path();
            let lockable = {
                let file_path = file_path.clone();
                tokio::task::spawn_blocking(move || crate::pathlocks::probe_lock_free(&file_path))
                    .await
                    .map_err(|e| StoreError::Io(std::io::Error::other(e)))??
            };
            if lockable {
                // Nobody holds the lock: the owning process is gone.
                debug!(file = %file_path.display(), "removing stale temp roots file");
                let _ = tokio::fs::remove_file(&file_path).await;
                continue;
            }
            let contents = tokio::fs::read(&file_path).await?;
            for chunk in contents.split(|&b| b == 0) {
                if chunk.is_empty() {
                    continue;
                }
                let text = String::from_utf8_lossy(chunk);
                if let Ok(path) = self.store_dir_ref().parse_path(&text) {
                    out.insert(path);
                }
            }
        }
        Ok(out)
    }

    /// Run the collector.
    pub async fn collect_garbage(&self, options: GcOptions) -> Result<GcResults> {
        // Exclude every writer for the whole collection.
        let lock_path = self.gc_lock_path();
        let _exclusive =
            tokio::task::spawn_blocking(move || GcLock::acquire(&lock_path, LockMode::Exclusive))
                .await
                .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
                .map_err(StoreError::Io)?;

        let mut root_set: BTreeSet<StorePath> =
            self.find_roots().await?.into_values().collect();
        root_set.extend(self.read_temp_roots().await?);
        root_set.extend(self.find_runtime_roots().await?);
        let live = self.compute_fs_closure(root_set, false).await?;

        let valid = self.all_valid_paths().await?;
        let dead: BTreeSet<StorePath> = match &options.action {
            GcAction::DeleteSpecific(requested) => {
                for path in requested {
                    if live.contains(path) {
                        return Err(StoreError::PathInUse(self.display_path(path)));
                    }
                }
                requested.intersection(&valid).cloned().collect()
            }
            _ => valid.difference(&live).cloned().collect(),
        };

        let mut results = GcResults::default();
        if options.action == GcAction::ReturnDead {
            results.paths = dead.into_iter().collect();
            return Ok(results);
        }

        // Delete referrers before their references.
        let mut deleted: BTreeSet<StorePath> = BTreeSet::new();
        for path in &dead {
            if self
                .delete_with_referrers(path, &dead, &mut deleted, &mut results, &options)
                .await?
            {
                break;
            }
        }

        info!(
            paths = results.paths.len(),
            bytes = results.bytes_freed,
            "garbage collection finished"
        );
        Ok(results)
    }

    /// Delete `path`, recursing into its dead referrers first. Returns
    /// true when the byte budget is exhausted.
    fn delete_with_referrers<'a>(
        &'a self,
        path: &'a StorePath,
        dead: &'a BTreeSet<StorePath>,
        deleted: &'a mut BTreeSet<StorePath>,
        results: &'a mut GcResults,
        options: &'a GcOptions,
    ) -> futures::future::BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            if deleted.contains(path) {
                return Ok(false);
            }
            if let Some(max) = options.max_freed
                && results.bytes_freed >= max
            {
                return Ok(true);
            }
            deleted.insert(path.clone());

            for referrer in self.query_referrers(path).await? {
                if referrer != *path && dead.contains(&referrer) && !deleted.contains(&referrer) {
                    if self
                        .delete_with_referrers(&referrer, dead, deleted, results, options)
                        .await?
                    {
                        return Ok(true);
                    }
                }
            }

            let size = self
                .query_path_info(path)
                .await?
                .map(|info| info.nar_size)
                .unwrap_or(0);

            // Database first: a path must never be valid without being
            // present on disk.
            self.invalidate_path(path).await?;
            let real = self.real_path(path);
            if tokio::fs::symlink_metadata(&real).await.is_ok() {
                remove_path_forcibly(&real).await?;
            }
            let _ = tokio::fs::remove_file(format!("{}.lock", real.display())).await;

            debug!(path = %path, "deleted");
            results.paths.push(path.clone());
            results.bytes_freed += size;
            Ok(false)
        })
    }

    /// Run a GC when free space on the store filesystem has dropped below
    /// the configured minimum. `sync` callers wait for a running GC;
    /// others return immediately.
    pub async fn auto_gc(&self, sync: bool) -> Result<()> {
        let min_free = self.config().min_free;
        if min_free == 0 {
            return Ok(());
        }

        let avail = free_space(self.config().store_dir.to_path())?;
        if avail >= min_free {
            return Ok(());
        }

        let guard = match self.auto_gc_running.try_lock() {
            Ok(guard) => guard,
            Err(_) if sync => {
                // A collection is running; waiting for the lock is
                // equivalent to waiting for it to finish.
                drop(self.auto_gc_running.lock().await);
                return Ok(());
            }
            Err(_) => return Ok(()),
        };

        let goal = self.config().max_free.saturating_sub(avail);
        warn!(avail, goal, "free space low, starting automatic GC");
        let result = self
            .collect_garbage(GcOptions {
                action: GcAction::DeleteDead,
                max_freed: Some(goal),
            })
            .await;
        drop(guard);
        result.map(drop)
    }
}

fn free_space(path: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

/// Walk `/proc/<pid>` for every process and collect the store paths it
/// holds: `exe`, `cwd`, the `fd` directory, the mapped files in `maps`,
/// and store paths embedded in `environ`.
#[cfg(target_os = "linux")]
fn scan_proc_roots(store_dir: &StoreDir) -> Result<BTreeSet<StorePath>> {
    let mut roots = BTreeSet::new();
    let entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(_) => return Ok(roots),
    };

    for entry in entries.flatten() {
        // Only numeric entries are processes.
        if entry
            .file_name()
            .to_str()
            .is_none_or(|name| name.parse::<u32>().is_err())
        {
            continue;
        }
        let proc_dir = entry.path();

        let mut links = vec![proc_dir.join("exe"), proc_dir.join("cwd")];
        if let Ok(fds) = std::fs::read_dir(proc_dir.join("fd")) {
            links.extend(fds.flatten().map(|fd| fd.path()));
        }
        for link in links {
            if let Ok(target) = std::fs::read_link(&link)
                && let Ok(path) = store_dir.to_store_path(&target.to_string_lossy())
            {
                roots.insert(path);
            }
        }

        // Mapped files: the path starts at the first slash of each line.
        if let Ok(maps) = std::fs::read_to_string(proc_dir.join("maps")) {
            for line in maps.lines() {
                if let Some(idx) = line.find('/')
                    && let Ok(path) = store_dir.to_store_path(&line[idx..])
                {
                    roots.insert(path);
                }
            }
        }

        // Store paths smuggled through the environment (PATH entries,
        // NIX_* variables) pin too.
        if let Ok(environ) = std::fs::read(proc_dir.join("environ")) {
            scan_for_store_paths(&String::from_utf8_lossy(&environ), store_dir, &mut roots);
        }
    }
    Ok(roots)
}

#[cfg(not(target_os = "linux"))]
fn scan_proc_roots(_store_dir: &StoreDir) -> Result<BTreeSet<StorePath>> {
    Ok(BTreeSet::new())
}

/// Find every `<storeDir>/<base>` occurrence in free-form text.
#[cfg(target_os = "linux")]
fn scan_for_store_paths(text: &str, store_dir: &StoreDir, roots: &mut BTreeSet<StorePath>) {
    let prefix = format!("{store_dir}/");
    let mut rest = text;
    while let Some(idx) = rest.find(&prefix) {
        let base: String = rest[idx + prefix.len()..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || "+-._?=".contains(*c))
            .collect();
        if let Ok(path) = StorePath::from_base_path(&base) {
            roots.insert(path);
        }
        rest = &rest[idx + prefix.len()..];
    }
}
