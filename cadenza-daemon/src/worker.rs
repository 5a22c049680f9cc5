// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! The worker: goal creation, deduplication and result aggregation.
//!
//! Goals are cooperative tasks keyed by derivation path or store path.
//! Creating a goal that already exists returns the existing goal's
//! shared result future — for derivation goals the wanted-output set is
//! widened instead of starting a second build, so two concurrent
//! requests for different outputs of one derivation observe a single
//! build covering their union.
//!
//! Concurrency is bounded by two independent semaphores: local builds
//! (`max-jobs`) and substitutions (`max-substitution-jobs`), each at
//! least one. A goal holds at most one permit while doing its own work
//! and never while waiting on subgoals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cadenza_store::{LocalStore, Store};
use cadenza_store_core::content_address::ContentAddress;
use cadenza_store_core::derived_path::{DerivedPath, OutputSpec};
use cadenza_store_core::store_path::StorePath;

use crate::build::BuildMode;
use crate::config::DaemonConfig;
use crate::goal::{ExitCode, GoalResult, Progress};
use crate::{derivation_goal, substitution};

/// Exit-status bits, folded into a process exit code by front-ends.
pub mod exit_mask {
    /// Some build failed (permanently, by timeout, or by hash mismatch).
    pub const BUILD_FAILED: u32 = 0x04;
    pub const TIMED_OUT: u32 = 0x01;
    pub const HASH_MISMATCH: u32 = 0x02;
    pub const CHECK_MISMATCH: u32 = 0x08;
    /// A wanted path had no willing substituter.
    pub const NO_SUBSTITUTERS: u32 = 0x10;
    /// High bits marking "this is a worker status", keeping codes out of
    /// the reserved 0–2 range.
    pub const BASE: u32 = 0x60;
}

type SharedGoal = Shared<BoxFuture<'static, GoalResult>>;

pub(crate) struct DerivationGoalHandle {
    pub(crate) wanted: Arc<StdMutex<OutputSpec>>,
    future: SharedGoal,
}

#[derive(Default)]
struct GoalMaps {
    substitutions: HashMap<StorePath, SharedGoal>,
    derivations: HashMap<StorePath, DerivationGoalHandle>,
}

/// Failure classification accumulated across all goals of a run.
#[derive(Default)]
pub(crate) struct FailureFlags {
    pub permanent_failure: AtomicBool,
    pub timed_out: AtomicBool,
    pub hash_mismatch: AtomicBool,
    pub check_mismatch: AtomicBool,
}

/// Results of one [`Worker::realise`] call.
#[derive(Debug)]
pub struct WorkerResults {
    /// Per-target results, in target order.
    pub goals: Vec<(DerivedPath, GoalResult)>,
    /// 0 on success, otherwise the failure bitmask (with
    /// [`exit_mask::BASE`] set), or 1 for failures outside the mask.
    pub failing_exit_status: u32,
}

pub struct Worker {
    pub(crate) store: Arc<LocalStore>,
    /// Substituters in priority order (priority, then configuration
    /// order — the sort is stable).
    pub(crate) substituters: Vec<Arc<dyn Store>>,
    pub(crate) config: Arc<DaemonConfig>,
    pub(crate) build_slots: Arc<Semaphore>,
    pub(crate) substitution_slots: Arc<Semaphore>,
    pub(crate) progress: Progress,
    pub(crate) flags: FailureFlags,
    cancel: CancellationToken,
    state: StdMutex<GoalMaps>,
}

impl Worker {
    pub fn new(
        store: Arc<LocalStore>,
        mut substituters: Vec<Arc<dyn Store>>,
        config: Arc<DaemonConfig>,
    ) -> Arc<Self> {
        // Stable by priority; ties keep configuration order.
        substituters.sort_by_key(|s| s.priority());
        Arc::new(Self {
            store,
            substituters,
            build_slots: Arc::new(Semaphore::new(config.max_jobs.max(1))),
            substitution_slots: Arc::new(Semaphore::new(config.max_substitution_jobs.max(1))),
            config,
            progress: Progress::default(),
            flags: FailureFlags::default(),
            cancel: CancellationToken::new(),
            state: StdMutex::new(GoalMaps::default()),
        })
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn progress(&self) -> crate::goal::ProgressSnapshot {
        self.progress.snapshot()
    }

    /// Request cancellation of all outstanding goals.
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Create (or join) the substitution goal for `path`.
    pub fn make_substitution_goal(
        self: &Arc<Self>,
        path: StorePath,
        expected_ca: Option<ContentAddress>,
    ) -> SharedGoal {
        let mut state = self.state.lock().expect("goal map lock poisoned");
        if let Some(existing) = state.substitutions.get(&path) {
            return existing.clone();
        }

        let worker = Arc::clone(self);
        let key = path.clone();
        let task = tokio::spawn(async move {
            let result = substitution::run_substitution(&worker, path.clone(), expected_ca).await;
            worker.note_result(&result);
            worker
                .state
                .lock()
                .expect("goal map lock poisoned")
                .substitutions
                .remove(&path);
            result
        });
        let future: SharedGoal = async move {
            task.await
                .unwrap_or_else(|e| GoalResult::failed(format!("substitution goal panicked: {e}")))
        }
        .boxed()
        .shared();
        state.substitutions.insert(key, future.clone());
        future
    }

    /// Create (or join, widening the wanted outputs) the derivation goal
    /// for `drv_path`.
    pub fn make_derivation_goal(
        self: &Arc<Self>,
        drv_path: StorePath,
        wanted: OutputSpec,
        mode: BuildMode,
    ) -> SharedGoal {
        let mut state = self.state.lock().expect("goal map lock poisoned");
        if let Some(existing) = state.derivations.get(&drv_path) {
            existing
                .wanted
                .lock()
                .expect("wanted outputs lock poisoned")
                .union_with(&wanted);
            return existing.future.clone();
        }

        let wanted = Arc::new(StdMutex::new(wanted));
        let worker = Arc::clone(self);
        let key = drv_path.clone();
        let goal_wanted = Arc::clone(&wanted);
        let task = tokio::spawn(async move {
            let result =
                derivation_goal::run_derivation(&worker, drv_path.clone(), goal_wanted, mode)
                    .await;
            worker.note_result(&result);
            worker
                .state
                .lock()
                .expect("goal map lock poisoned")
                .derivations
                .remove(&drv_path);
            result
        });
        let future: SharedGoal = async move {
            task.await
                .unwrap_or_else(|e| GoalResult::failed(format!("derivation goal panicked: {e}")))
        }
        .boxed()
        .shared();
        state
            .derivations
            .insert(key, DerivationGoalHandle { wanted, future: future.clone() });
        future
    }

    fn note_result(&self, result: &GoalResult) {
        if result.permanent_failure {
            self.flags.permanent_failure.store(true, Ordering::Relaxed);
        }
        if result.timed_out {
            self.flags.timed_out.store(true, Ordering::Relaxed);
        }
        if result.hash_mismatch {
            self.flags.hash_mismatch.store(true, Ordering::Relaxed);
        }
        if result.check_mismatch {
            self.flags.check_mismatch.store(true, Ordering::Relaxed);
        }
    }

    /// Realise a set of derived paths.
    ///
    /// With `keep-going` unset, the first top-level failure interrupts
    /// every other goal; otherwise unrelated goals continue and failures
    /// are reported collectively.
    pub async fn realise(
        self: &Arc<Self>,
        targets: Vec<DerivedPath>,
        mode: BuildMode,
    ) -> WorkerResults {
        use futures::stream::{FuturesOrdered, StreamExt as _};

        let mut futures = FuturesOrdered::new();
        for target in targets {
            let goal = match &target {
                DerivedPath::Opaque(path) => self.make_substitution_goal(path.clone(), None),
                DerivedPath::Built { drv_path, outputs } => {
                    self.make_derivation_goal(drv_path.clone(), outputs.clone(), mode)
                }
            };
            futures.push_back(async move { (target, goal.await) });
        }

        let mut goals = Vec::new();
        let mut no_substituters = false;
        while let Some((target, result)) = futures.next().await {
            if !result.is_success() {
                warn!(
                    target = %target.display(self.store.store_dir()),
                    error = %result.error.as_deref().map(String::as_str).unwrap_or("unknown"),
                    "goal failed"
                );
                if result.code == ExitCode::NoSubstituters {
                    no_substituters = true;
                }
                if !self.config.keep_going {
                    debug!("keep-going is off: interrupting remaining goals");
                    self.interrupt();
                }
            }
            goals.push((target, result));
        }

        let failing_exit_status = self.failing_exit_status(&goals, no_substituters);
        WorkerResults {
            goals,
            failing_exit_status,
        }
    }

    fn failing_exit_status(
        &self,
        goals: &[(DerivedPath, GoalResult)],
        no_substituters: bool,
    ) -> u32 {
        if goals.iter().all(|(_, r)| r.is_success()) {
            return 0;
        }

        let permanent = self.flags.permanent_failure.load(Ordering::Relaxed);
        let timed_out = self.flags.timed_out.load(Ordering::Relaxed);
        let hash_mismatch = self.flags.hash_mismatch.load(Ordering::Relaxed);
        let check_mismatch = self.flags.check_mismatch.load(Ordering::Relaxed);

        let mut mask = 0;
        if permanent || timed_out || hash_mismatch {
            mask |= exit_mask::BUILD_FAILED;
        }
        if timed_out {
            mask |= exit_mask::TIMED_OUT;
        }
        if hash_mismatch {
            mask |= exit_mask::HASH_MISMATCH;
        }
        if check_mismatch {
            mask |= exit_mask::CHECK_MISMATCH;
        }
        if no_substituters {
            mask |= exit_mask::NO_SUBSTITUTERS;
        }
        if mask != 0 { mask | exit_mask::BASE } else { 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_store::LocalStoreConfig;
    use cadenza_store_core::store_path::{StorePathName, StoreReferences};

    async fn temp_worker(substituters: Vec<Arc<dyn Store>>) -> (tempfile::TempDir, Arc<Worker>) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(
            LocalStore::open(LocalStoreConfig::under_root(dir.path()))
                .await
                .unwrap(),
        );
        let config = Arc::new(DaemonConfig {
            store_dir: store.config().store_dir.to_path().to_owned(),
            state_dir: store.config().state_dir.clone(),
            sandbox: false,
            ..Default::default()
        });
        (dir, Worker::new(store, substituters, config))
    }

    /// Substituting an already-valid path succeeds without a substituter
    /// in sight.
    #[tokio::test]
    async fn valid_path_substitution_is_noop() {
        let (_dir, worker) = temp_worker(Vec::new()).await;
        let path = worker
            .store
            .add_text_to_store(
                &StorePathName::new("present").unwrap(),
                b"already here",
                &StoreReferences::default(),
            )
            .await
            .unwrap();

        let result = worker.make_substitution_goal(path, None).await;
        assert!(result.is_success());
    }

    /// A missing path with no substituters fails with the dedicated
    /// no-substituters code, and the exit mask carries its bit but not
    /// the build-failed bit.
    #[tokio::test]
    async fn missing_path_without_substituters() {
        let (_dir, worker) = temp_worker(Vec::new()).await;
        let path = StorePath::from_base_path("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-gone").unwrap();

        let results = worker
            .realise(vec![DerivedPath::Opaque(path)], BuildMode::Normal)
            .await;
        assert_eq!(results.goals[0].1.code, ExitCode::NoSubstituters);

        let status = results.failing_exit_status;
        assert_ne!(status & exit_mask::NO_SUBSTITUTERS, 0);
        assert_eq!(status & exit_mask::BUILD_FAILED, 0);
        assert_ne!(status & exit_mask::BASE, 0);
    }

    /// Two concurrent goals for the same path share one underlying goal.
    #[tokio::test]
    async fn substitution_goals_are_deduplicated() {
        let (_dir, worker) = temp_worker(Vec::new()).await;
        let path = StorePath::from_base_path("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-dedup").unwrap();

        let a = worker.make_substitution_goal(path.clone(), None);
        let b = worker.make_substitution_goal(path.clone(), None);
        // Shared futures compare by pointer identity.
        assert!(a.ptr_eq(&b));

        let (ra, rb) = tokio::join!(a, b);
        assert_eq!(ra.code, rb.code);
    }

    /// Creating a second goal for the same derivation widens the first
    /// goal's wanted-output set to the union.
    #[tokio::test]
    async fn derivation_goals_merge_wanted_outputs() {
        let (_dir, worker) = temp_worker(Vec::new()).await;
        let drv_path =
            StorePath::from_base_path("cccccccccccccccccccccccccccccccc-x.drv").unwrap();

        let out = cadenza_store_core::OutputName::new("out").unwrap();
        let dev = cadenza_store_core::OutputName::new("dev").unwrap();

        let a = worker.make_derivation_goal(
            drv_path.clone(),
            OutputSpec::just(out.clone()),
            BuildMode::Normal,
        );
        let b = worker.make_derivation_goal(
            drv_path.clone(),
            OutputSpec::just(dev.clone()),
            BuildMode::Normal,
        );
        assert!(a.ptr_eq(&b));

        // Peek at the widened set before the goal finishes (the goal will
        // fail eventually — the drv doesn't exist — but the handle lives
        // while it runs).
        {
            let state = worker.state.lock().unwrap();
            if let Some(handle) = state.derivations.get(&drv_path) {
                let wanted = handle.wanted.lock().unwrap();
                assert!(wanted.contains(&out));
                assert!(wanted.contains(&dev));
            }
        }

        let (ra, rb) = tokio::join!(a, b);
        assert_eq!(ra.code, rb.code);
    }

    #[tokio::test]
    async fn progress_counts_substitutions() {
        let (_dir, worker) = temp_worker(Vec::new()).await;
        let path = StorePath::from_base_path("dddddddddddddddddddddddddddddddd-p").unwrap();
        let _ = worker.make_substitution_goal(path, None).await;
        let snapshot = worker.progress();
        assert_eq!(snapshot.substitutions_expected, 1);
    }
}
