// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Store deduplication by hardlinking.
//!
//! Identical regular files across store objects are collapsed onto a
//! single inode under `<store>/.links/<sha256>`. The swap is
//! link-then-rename: the replacement link is created under a temporary
//! name and renamed over the original, so the file never disappears from
//! its path. Races with concurrent builds are tolerated by skipping any
//! file that changes under our feet rather than failing the whole pass.

use std::io;
use std::os::unix::fs::{MetadataExt as _, PermissionsExt as _};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use cadenza_utils_hash::Algorithm;

use crate::error::{Result, StoreError};
use crate::local::LocalStore;

/// Statistics of one optimiser pass.
#[derive(Debug, Default, Clone)]
pub struct OptimiseStats {
    pub files_linked: u64,
    pub bytes_freed: u64,
    pub skipped: u64,
}

impl LocalStore {
    /// Deduplicate the whole store.
    pub async fn optimise_store(&self) -> Result<OptimiseStats> {
        // Hold the writer side: the collector must not remove `.links`
        // entries between our link and rename.
        let _writer = self.writer_lock().await?;

        let links_dir = self.links_dir();
        tokio::fs::create_dir_all(&links_dir).await?;

        let store_dir = self.config().store_dir.to_path().to_owned();
        let paths = self.all_valid_paths().await?;
        let roots: Vec<PathBuf> = paths
            .iter()
            .map(|p| self.real_path(p))
            .collect();

        tokio::task::spawn_blocking(move || {
            let mut stats = OptimiseStats::default();
            for root in roots {
                optimise_tree(&root, &links_dir, &store_dir, &mut stats)?;
            }
            Ok::<_, StoreError>(stats)
        })
        .await
        .map_err(|e| StoreError::Io(io::Error::other(e)))?
    }
}

fn optimise_tree(
    root: &Path,
    links_dir: &Path,
    store_dir: &Path,
    stats: &mut OptimiseStats,
) -> Result<()> {
    for entry in walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Err(e) = optimise_file(entry.path(), links_dir, store_dir, stats) {
            // A build may be mutating this path concurrently; losing one
            // candidate is fine, losing the pass is not.
            warn!(file = %entry.path().display(), "skipping during optimise: {e}");
            stats.skipped += 1;
        }
    }
    Ok(())
}

fn optimise_file(
    file: &Path,
    links_dir: &Path,
    store_dir: &Path,
    stats: &mut OptimiseStats,
) -> Result<()> {
    let meta = std::fs::symlink_metadata(file)?;

    // Already maximally shared, or mutable (a build in progress writes
    // with write bits still set): leave it alone.
    if meta.size() == 0 || meta.permissions().mode() & 0o222 != 0 {
        return Ok(());
    }

    let contents = std::fs::read(file)?;
    let hash = Algorithm::SHA256.digest(&contents).to_base32();
    let link_path = links_dir.join(hash);

    match std::fs::hard_link(file, &link_path) {
        Ok(()) => {
            // First occurrence: this file becomes the canonical inode.
            return Ok(());
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e.into()),
    }

    let link_meta = std::fs::symlink_metadata(&link_path)?;
    if link_meta.ino() == meta.ino() {
        return Ok(());
    }

    // Contents must really match; a hash collision or a mutated links
    // entry would otherwise corrupt the store.
    if std::fs::read(&link_path)? != contents {
        warn!(link = %link_path.display(), "links entry does not match its name; ignoring");
        return Ok(());
    }

    // Link the canonical inode next to the victim, then rename over it.
    // The containing directory is canonicalised read-only; toggle it
    // writable around the rename (but never the store dir itself).
    let parent = file.parent().unwrap_or(store_dir);
    let must_toggle = parent != store_dir;
    if must_toggle {
        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o755))?;
    }
    let temp = store_dir.join(format!(".tmp-link-{}-{}", std::process::id(), meta.ino()));
    std::fs::hard_link(&link_path, &temp)?;
    let renamed = std::fs::rename(&temp, file);
    if must_toggle {
        let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o555));
    }
    if let Err(e) = renamed {
        let _ = std::fs::remove_file(&temp);
        return Err(e.into());
    }

    stats.files_linked += 1;
    stats.bytes_freed += meta.size();
    debug!(file = %file.display(), "linked to shared inode");
    Ok(())
}
