// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! The substitution goal: fetch one path from the substituter list.
//!
//! The drive through one path's life:
//!
//! ```text
//! Init → TryNext → GotInfo → ReferencesDone → Fetching → Done
//!           │         │            │              │
//!           └─ NoInfo ┴─ BadInfo ──┴──────────────┴→ TryNext
//! ```
//!
//! An already-valid path succeeds immediately without touching any
//! substituter. Substituters are consulted in priority order; a failure
//! at any stage moves on to the next one, and running out of candidates
//! is the distinct `NoSubstituters` outcome (which is not a build
//! failure). References are realised before the path itself so the
//! store's no-dangling-references invariant holds at registration time.

use std::sync::Arc;

use tracing::{debug, info, warn};

use cadenza_store::{CheckSigs, Store};
use cadenza_store_core::content_address::ContentAddress;
use cadenza_store_core::store_path::StorePath;
use cadenza_store_core::ValidPathInfo;

use crate::goal::{ExitCode, GoalResult};
use crate::worker::Worker;

pub(crate) async fn run_substitution(
    worker: &Arc<Worker>,
    path: StorePath,
    expected_ca: Option<ContentAddress>,
) -> GoalResult {
    // Init: substituting a valid path is a no-op.
    match worker.store.is_valid_path(&path).await {
        Ok(true) => return GoalResult::success(),
        Ok(false) => {}
        Err(e) => return GoalResult::failed(format!("cannot query '{path}': {e}")),
    }

    worker
        .progress
        .add(&worker.progress.substitutions_expected, 1);

    let mut incomplete_closure = false;

    for substituter in &worker.substituters {
        if worker.interrupted() {
            return GoalResult::failed("interrupted");
        }

        // GotInfo.
        let info = match substituter.query_path_info(&path).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                debug!(substituter = %substituter.uri(), path = %path, "path not available");
                continue;
            }
            Err(e) => {
                debug!(substituter = %substituter.uri(), path = %path, "query failed: {e}");
                continue;
            }
        };

        // BadInfo: reject inconsistent metadata before spending traffic.
        if info.path != path {
            warn!(substituter = %substituter.uri(), "narinfo describes the wrong path");
            continue;
        }
        if let Some(expected) = &expected_ca
            && let Some(actual) = &info.ca
            && actual != expected
        {
            warn!(
                substituter = %substituter.uri(),
                "content address mismatch: expected {expected}, got {actual}"
            );
            continue;
        }

        worker
            .progress
            .add(&worker.progress.nar_bytes_expected, info.nar_size);
        worker
            .progress
            .add(&worker.progress.download_bytes_expected, info.nar_size);

        // ReferencesDone: realise the references first (sharing goals
        // with anyone else who wants them).
        let mut reference_goals = Vec::new();
        for reference in &info.references {
            if *reference == path {
                continue;
            }
            reference_goals.push(worker.make_substitution_goal(reference.clone(), None));
        }
        let mut references_ok = true;
        for goal in reference_goals {
            let result = goal.await;
            if !result.is_success() {
                references_ok = false;
            }
        }
        if !references_ok {
            // No substituter can help if the closure cannot be
            // completed; remember it for the final verdict but still try
            // the rest (another cache may advertise fewer references).
            incomplete_closure = true;
            continue;
        }

        // Fetching: hold a substitution slot only for the transfer.
        let permit = match worker.substitution_slots.acquire().await {
            Ok(permit) => permit,
            Err(_) => return GoalResult::failed("substitution slots closed"),
        };
        let fetch = fetch_into_store(worker, substituter.as_ref(), &info).await;
        drop(permit);

        match fetch {
            Ok(()) => {
                // Pin against a concurrent GC until this process exits;
                // whoever asked for the path is about to use it.
                if let Err(e) = worker.store.add_temp_root(&path).await {
                    warn!(path = %path, "could not add temp root: {e}");
                }
                worker
                    .progress
                    .add(&worker.progress.substitutions_done, 1);
                worker
                    .progress
                    .add(&worker.progress.nar_bytes_done, info.nar_size);
                worker
                    .progress
                    .add(&worker.progress.download_bytes_done, info.nar_size);
                info!(path = %path, substituter = %substituter.uri(), "substituted");
                return GoalResult::success();
            }
            Err(message) => {
                warn!(
                    path = %path,
                    substituter = %substituter.uri(),
                    "substitution failed: {message}"
                );
                continue;
            }
        }
    }

    let code = if incomplete_closure {
        ExitCode::IncompleteClosure
    } else {
        ExitCode::NoSubstituters
    };
    GoalResult::failed(format!(
        "no substituter could provide '{}'",
        worker.store.display_path(&path)
    ))
    .with_code(code)
}

/// Stream the NAR from `substituter` into the local store, verifying
/// hash and size on the way in.
async fn fetch_into_store(
    worker: &Arc<Worker>,
    substituter: &dyn Store,
    info: &ValidPathInfo,
) -> Result<(), String> {
    let (reader, mut writer) = tokio::io::duplex(64 * 1024);

    let path = info.path.clone();
    let uri = substituter.uri();

    let add = worker.store.add_to_store(
        info,
        Box::pin(reader),
        false,
        if worker.config.require_sigs {
            CheckSigs::Require
        } else {
            CheckSigs::Skip
        },
    );

    let stream = async {
        // The writer must be shut down so the reader sees EOF.
        let pinned_writer: std::pin::Pin<&mut tokio::io::DuplexStream> =
            std::pin::Pin::new(&mut writer);
        let result = substituter.nar_from_path(&path, pinned_writer).await;
        use tokio::io::AsyncWriteExt as _;
        let _ = writer.shutdown().await;
        result
    };

    let (stream_result, add_result) = tokio::join!(stream, add);
    match (stream_result, add_result) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), _) => Err(format!("transfer from '{uri}': {e}")),
        (Ok(()), Err(e)) => Err(format!("import into local store: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::BuildMode;
    use crate::config::DaemonConfig;
    use cadenza_cache::{BinaryCacheConfig, BinaryCacheStore, Compression, FileTransport};
    use cadenza_store::{LocalStore, LocalStoreConfig};
    use cadenza_store_core::derived_path::DerivedPath;
    use cadenza_store_core::store_path::{StorePathName, StoreReferences};
    use cadenza_utils_hash::NarHash;
    use std::collections::BTreeSet;

    /// Build a file:// binary cache holding the closure of one path
    /// (`pkg` referencing `dep`), by exporting from a scratch store.
    async fn populated_cache(
        root: &std::path::Path,
    ) -> (Arc<dyn Store>, StorePath, StorePath) {
        let source_store = LocalStore::open(LocalStoreConfig::under_root(&root.join("src")))
            .await
            .unwrap();

        let dep = source_store
            .add_text_to_store(
                &StorePathName::new("dep").unwrap(),
                b"the dependency",
                &StoreReferences::default(),
            )
            .await
            .unwrap();
        let pkg = source_store
            .add_text_to_store(
                &StorePathName::new("pkg").unwrap(),
                b"the package",
                &StoreReferences {
                    others: BTreeSet::from([dep.clone()]),
                    self_ref: false,
                },
            )
            .await
            .unwrap();

        let cache = BinaryCacheStore::new(
            BinaryCacheConfig {
                store_dir: source_store.store_dir().clone(),
                require_sigs: false,
                compression: Compression::Zstd,
                ..Default::default()
            },
            Box::new(FileTransport::new(root.join("cache"))),
        );
        cache.init().await.unwrap();

        for path in [&dep, &pkg] {
            let info = source_store.query_path_info(path).await.unwrap().unwrap();
            let mut nar = Vec::new();
            let pinned_nar: std::pin::Pin<&mut Vec<u8>> = std::pin::Pin::new(&mut nar);
            source_store
                .nar_from_path(path, pinned_nar)
                .await
                .unwrap();
            cache
                .add_to_store(
                    &info,
                    Box::pin(std::io::Cursor::new(nar)),
                    false,
                    CheckSigs::Skip,
                )
                .await
                .unwrap();
        }

        (Arc::new(cache), pkg, dep)
    }

    async fn worker_with(
        root: &std::path::Path,
        substituters: Vec<Arc<dyn Store>>,
        store_dir: cadenza_store_core::StoreDir,
    ) -> Arc<Worker> {
        // The destination store must share the cache's store dir so the
        // paths transfer unchanged.
        let dest_root = root.join("dest");
        std::fs::create_dir_all(&dest_root).unwrap();
        let config = LocalStoreConfig {
            store_dir,
            state_dir: dest_root.join("var"),
            require_sigs: false,
            ..Default::default()
        };
        let store = Arc::new(LocalStore::open(config).await.unwrap());
        Worker::new(
            store,
            substituters,
            Arc::new(DaemonConfig {
                sandbox: false,
                require_sigs: false,
                ..Default::default()
            }),
        )
    }

    /// The full pipeline: narinfo → references first → NAR transfer →
    /// local registration, for a path with one dependency.
    #[tokio::test]
    async fn substitutes_path_and_references() {
        let dir = tempfile::TempDir::new().unwrap();
        let (cache, pkg, dep) = populated_cache(dir.path()).await;
        let store_dir = cache.store_dir().clone();
        let worker = worker_with(dir.path(), vec![cache], store_dir).await;

        let result = worker
            .make_substitution_goal(pkg.clone(), None)
            .await;
        assert!(result.is_success(), "{:?}", result.error);

        // Both the path and its reference are now valid locally, with
        // intact metadata.
        assert!(worker.store().is_valid_path(&pkg).await.unwrap());
        assert!(worker.store().is_valid_path(&dep).await.unwrap());
        let info = worker
            .store()
            .query_path_info(&pkg)
            .await
            .unwrap()
            .unwrap();
        assert!(info.references.contains(&dep));
        assert!(!info.ultimate, "substituted paths are not ultimately trusted");
    }

    /// Priority order: the higher-priority cache is consulted first; a
    /// 404 there falls back to the lower-priority one (S3 scenario).
    #[tokio::test]
    async fn falls_back_across_substituters() {
        let dir = tempfile::TempDir::new().unwrap();
        let (cache_b, pkg, _dep) = populated_cache(dir.path()).await;
        let store_dir = cache_b.store_dir().clone();

        // Cache A: higher priority (lower number), but empty.
        let empty = BinaryCacheStore::new(
            BinaryCacheConfig {
                store_dir: store_dir.clone(),
                require_sigs: false,
                priority: 10,
                ..Default::default()
            },
            Box::new(FileTransport::new(dir.path().join("empty-cache"))),
        );
        empty.init().await.unwrap();

        let worker = worker_with(
            dir.path(),
            vec![Arc::new(empty), cache_b],
            store_dir,
        )
        .await;

        let result = worker.make_substitution_goal(pkg.clone(), None).await;
        assert!(result.is_success(), "{:?}", result.error);
        assert!(worker.store().is_valid_path(&pkg).await.unwrap());
    }

    /// Both substituters missing the path: `NoSubstituters`, reported
    /// through the realise-level exit mask without the build-failed bit.
    #[tokio::test]
    async fn no_substituters_outcome() {
        let dir = tempfile::TempDir::new().unwrap();
        let store_dir = cadenza_store_core::StoreDir::new(
            dir.path().join("src").join("store").to_string_lossy().into_owned(),
        )
        .unwrap();

        let empty = BinaryCacheStore::new(
            BinaryCacheConfig {
                store_dir: store_dir.clone(),
                require_sigs: false,
                ..Default::default()
            },
            Box::new(FileTransport::new(dir.path().join("empty"))),
        );
        empty.init().await.unwrap();

        let worker = worker_with(dir.path(), vec![Arc::new(empty)], store_dir.clone()).await;
        let missing =
            StorePath::from_base_path("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-absent").unwrap();

        let results = worker
            .realise(
                vec![DerivedPath::Opaque(missing)],
                BuildMode::Normal,
            )
            .await;
        assert_eq!(results.goals[0].1.code, ExitCode::NoSubstituters);
        assert_ne!(
            results.failing_exit_status & crate::worker::exit_mask::NO_SUBSTITUTERS,
            0
        );
        assert_eq!(
            results.failing_exit_status & crate::worker::exit_mask::BUILD_FAILED,
            0
        );
    }

    /// A substituter whose NAR does not match the narinfo hash must not
    /// poison the local store.
    #[tokio::test]
    async fn corrupt_nar_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let (cache, pkg, _dep) = populated_cache(dir.path()).await;
        let store_dir = cache.store_dir().clone();

        // Corrupt the narinfo's hash in place so the transfer cannot
        // match it.
        let narinfo_file = dir
            .path()
            .join("cache")
            .join(format!("{}.narinfo", pkg.hash_part()));
        let text = std::fs::read_to_string(&narinfo_file).unwrap();
        let bogus = NarHash::digest(b"not the real nar");
        let text: String = text
            .lines()
            .map(|line| {
                if line.starts_with("NarHash: ") {
                    format!("NarHash: sha256:{}\n", bogus.to_base32())
                } else {
                    format!("{line}\n")
                }
            })
            .collect();
        std::fs::write(&narinfo_file, text).unwrap();

        let worker = worker_with(dir.path(), vec![cache], store_dir).await;
        let result = worker.make_substitution_goal(pkg.clone(), None).await;
        assert!(!result.is_success());
        assert!(!worker.store().is_valid_path(&pkg).await.unwrap());
    }
}
