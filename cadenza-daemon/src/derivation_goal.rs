// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! The derivation goal: realise the wanted outputs of one derivation.
//!
//! The stations, in order:
//!
//! 1. have the `.drv` itself (substituting it if necessary),
//! 2. succeed early when every wanted output is already valid,
//! 3. try to substitute the missing outputs,
//! 4. realise all inputs (recursive derivation goals, substitution goals
//!    for opaque sources),
//! 5. take the per-output path locks, re-check validity (someone else
//!    may have built meanwhile),
//! 6. offer the build to the external hook, falling back to a local
//!    sandboxed build when it declines,
//! 7. register the outputs and sanity-check their closure.
//!
//! The goal holds a build slot only during step 6's local build, never
//! while waiting on children.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};

use tracing::{debug, info, warn};

use cadenza_store::Store as _;
use cadenza_store_core::derivation::{BasicDerivation, DerivationOutput, OutputName};
use cadenza_store_core::derived_path::OutputSpec;
use cadenza_store_core::store_path::StorePath;

use crate::build::{BuildError, BuildMode, run_build};
use crate::goal::{ExitCode, GoalResult};
use crate::hook::{HookInstance, HookReply};
use crate::worker::Worker;

pub(crate) async fn run_derivation(
    worker: &Arc<Worker>,
    drv_path: StorePath,
    wanted: Arc<StdMutex<OutputSpec>>,
    mode: BuildMode,
) -> GoalResult {
    let store = Arc::clone(&worker.store);

    // Step 1: the derivation itself must be present.
    match store.is_valid_path(&drv_path).await {
        Ok(true) => {}
        Ok(false) => {
            let fetched = worker
                .make_substitution_goal(drv_path.clone(), None)
                .await;
            if !fetched.is_success() {
                return GoalResult::failed(format!(
                    "derivation '{}' is not available",
                    store.display_path(&drv_path)
                ));
            }
        }
        Err(e) => return GoalResult::failed(format!("cannot query '{drv_path}': {e}")),
    }

    // Pin the derivation for the lifetime of this process so the
    // collector cannot take it out from under the build.
    if let Err(e) = store.add_temp_root(&drv_path).await {
        warn!(drv = %drv_path, "could not add temp root: {e}");
    }

    let drv = match load_derivation(&store, &drv_path).await {
        Ok(drv) => drv,
        Err(message) => return GoalResult::failed(message),
    };

    let output_paths = match drv.output_paths(store.store_dir()) {
        Ok(paths) => paths,
        Err(e) => return GoalResult::failed(format!("bad output in '{drv_path}': {e}")),
    };

    // The wanted set may have been widened while we were waiting; from
    // here on use a stable copy (later wideners re-enter through the
    // valid-output check below, which re-reads it).
    let wanted_now = |drv: &BasicDerivation| -> Vec<OutputName> {
        let spec = wanted.lock().expect("wanted lock poisoned").clone();
        drv.outputs
            .keys()
            .filter(|name| spec.contains(name))
            .cloned()
            .collect()
    };

    // Step 2: nothing to do?
    if mode == BuildMode::Normal
        && all_outputs_valid(worker, &drv, &output_paths, &wanted_now(&drv)).await
    {
        return GoalResult::success();
    }

    // Step 3: substitution of individual outputs (only those with
    // predetermined paths; floating outputs need a realisation, which a
    // future substituter interface may serve).
    if mode == BuildMode::Normal {
        let mut output_goals = Vec::new();
        for name in wanted_now(&drv) {
            let Some(Some(path)) = output_paths.get(&name) else {
                continue;
            };
            let valid = worker.store.is_valid_path(path).await.unwrap_or(false);
            if valid {
                continue;
            }
            let expected_ca = match drv.outputs.get(&name) {
                Some(DerivationOutput::CaFixed { ca }) => Some(*ca),
                _ => None,
            };
            output_goals.push(worker.make_substitution_goal(path.clone(), expected_ca));
        }
        for goal in output_goals {
            // Substitution failures here are expected; building is the
            // fallback.
            let _ = goal.await;
        }
        if all_outputs_valid(worker, &drv, &output_paths, &wanted_now(&drv)).await {
            debug!(drv = %drv_path, "all outputs substituted");
            return GoalResult::success();
        }
    }

    if worker.interrupted() {
        return GoalResult::failed("interrupted");
    }

    // Step 4: inputs.
    let mut input_goals = Vec::new();
    for (input_drv, outputs) in &drv.input_drvs {
        input_goals.push(worker.make_derivation_goal(
            input_drv.clone(),
            OutputSpec::Names(outputs.clone()),
            BuildMode::Normal,
        ));
    }
    for source in &drv.input_srcs {
        input_goals.push(worker.make_substitution_goal(source.clone(), None));
    }
    let mut failed_inputs = 0usize;
    for goal in input_goals {
        if !goal.await.is_success() {
            failed_inputs += 1;
        }
    }
    if failed_inputs > 0 {
        return GoalResult::failed(format!(
            "{failed_inputs} dependencies of derivation '{}' failed to build",
            store.display_path(&drv_path)
        ))
        .with_code(ExitCode::IncompleteClosure);
    }

    if worker.interrupted() {
        return GoalResult::failed("interrupted");
    }

    // Step 5: exclude concurrent builders of the same outputs. Locks are
    // taken in path order so two goals wanting overlapping output sets
    // cannot deadlock.
    let mut lock_paths: Vec<_> = output_paths
        .values()
        .flatten()
        .map(|p| store.real_path(p))
        .collect();
    lock_paths.sort();
    let mut locks = Vec::new();
    for lock_path in lock_paths {
        match tokio::task::spawn_blocking(move || {
            cadenza_store::PathLock::lock(&lock_path)
        })
        .await
        {
            Ok(Ok(lock)) => locks.push(lock),
            Ok(Err(e)) => return GoalResult::failed(format!("output lock: {e}")),
            Err(e) => return GoalResult::failed(format!("output lock: {e}")),
        }
    }

    // Someone else may have produced the outputs while we waited for
    // the locks.
    if mode == BuildMode::Normal
        && all_outputs_valid(worker, &drv, &output_paths, &wanted_now(&drv)).await
    {
        debug!(drv = %drv_path, "outputs appeared while waiting for locks");
        return GoalResult::success();
    }

    worker.progress.add(&worker.progress.builds_expected, 1);

    // Step 6: the hook gets the first offer.
    if let Some(hook_program) = &worker.config.build_hook
        && mode == BuildMode::Normal
    {
        match offer_to_hook(worker, hook_program.clone(), &drv_path, &drv).await {
            Ok(Some(())) => {
                worker.progress.add(&worker.progress.builds_done, 1);
                if all_outputs_valid(worker, &drv, &output_paths, &wanted_now(&drv)).await {
                    return GoalResult::success();
                }
                return GoalResult::failed(format!(
                    "build hook claimed success but outputs of '{drv_path}' are not valid"
                ));
            }
            Ok(None) => {} // declined or postponed: build locally
            Err(message) => {
                worker.progress.add(&worker.progress.builds_done, 1);
                let mut result = GoalResult::failed(message);
                result.permanent_failure = true;
                return result;
            }
        }
    }

    // Local build, bounded by the build slots.
    let permit = match worker.build_slots.acquire().await {
        Ok(permit) => permit,
        Err(_) => return GoalResult::failed("build slots closed"),
    };
    let build_result = run_build(&store, &worker.config, &drv_path, &drv, mode).await;
    drop(permit);
    worker.progress.add(&worker.progress.builds_done, 1);

    let outcome = match build_result {
        Ok(outcome) => outcome,
        Err(e) => return build_error_result(&store, &drv_path, e),
    };

    // Step 7: the registered outputs must form a complete closure.
    let output_set: std::collections::BTreeSet<StorePath> =
        outcome.outputs.values().map(|info| info.path.clone()).collect();
    if mode != BuildMode::Check
        && let Err(e) = store.compute_fs_closure(output_set, false).await
    {
        return GoalResult::failed(format!(
            "closure of outputs of '{drv_path}' is inconsistent: {e}"
        ));
    }

    // Pin the freshly registered outputs like any other live result.
    for info in outcome.outputs.values() {
        if let Err(e) = store.add_temp_root(&info.path).await {
            warn!(path = %info.path, "could not add temp root: {e}");
        }
    }

    info!(drv = %drv_path, outputs = outcome.outputs.len(), "built");
    GoalResult::success()
}

async fn load_derivation(
    store: &cadenza_store::LocalStore,
    drv_path: &StorePath,
) -> Result<BasicDerivation, String> {
    let bytes = tokio::fs::read(store.real_path(drv_path))
        .await
        .map_err(|e| format!("cannot read '{}': {e}", store.display_path(drv_path)))?;
    BasicDerivation::from_json(&bytes)
        .map_err(|e| format!("cannot parse derivation '{drv_path}': {e}"))
}

/// Are all wanted outputs realised? Floating outputs count when a
/// realisation is recorded and its path is valid.
async fn all_outputs_valid(
    worker: &Arc<Worker>,
    drv: &BasicDerivation,
    output_paths: &BTreeMap<OutputName, Option<StorePath>>,
    wanted: &[OutputName],
) -> bool {
    for name in wanted {
        match output_paths.get(name) {
            Some(Some(path)) => {
                if !worker.store.is_valid_path(path).await.unwrap_or(false) {
                    return false;
                }
            }
            Some(None) => {
                let id = cadenza_store_core::DrvOutput {
                    drv_hash: drv.derivation_hash(),
                    output_name: name.clone(),
                };
                match worker.store.query_realisation(&id).await {
                    Ok(Some(realisation)) => {
                        if !worker
                            .store
                            .is_valid_path(&realisation.out_path)
                            .await
                            .unwrap_or(false)
                        {
                            return false;
                        }
                    }
                    _ => return false,
                }
            }
            None => return false,
        }
    }
    true
}

/// One offer/answer round with the external hook. `Ok(Some(()))` means
/// the hook built it; `Ok(None)` means build locally.
async fn offer_to_hook(
    worker: &Arc<Worker>,
    program: std::path::PathBuf,
    drv_path: &StorePath,
    drv: &BasicDerivation,
) -> Result<Option<()>, String> {
    let settings = BTreeMap::from([
        ("max-jobs".to_owned(), worker.config.max_jobs.to_string()),
        (
            "store-dir".to_owned(),
            worker.store.store_dir().to_string(),
        ),
    ]);
    let mut hook = HookInstance::start(&program, &settings)
        .await
        .map_err(|e| e.to_string())?;

    let wanted: Vec<String> = drv.outputs.keys().map(ToString::to_string).collect();
    let reply = hook
        .offer(drv_path, drv, &wanted)
        .await
        .map_err(|e| e.to_string())?;

    match reply {
        HookReply::Decline | HookReply::Postpone => {
            hook.close().await;
            debug!(drv = %drv_path, "hook declined; building locally");
            Ok(None)
        }
        HookReply::Accept => {
            info!(drv = %drv_path, "build accepted by hook");
            let sink: std::sync::Arc<std::sync::Mutex<dyn std::io::Write + Send>> =
                std::sync::Arc::new(std::sync::Mutex::new(HookLogForwarder));
            let result = hook.run_accepted(&sink).await;
            hook.close().await;
            match result {
                Ok(()) => Ok(Some(())),
                Err(e) => Err(format!("remote build of '{drv_path}' failed: {e}")),
            }
        }
    }
}

/// Forwards hook log lines into tracing.
struct HookLogForwarder;

impl std::io::Write for HookLogForwarder {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let line = String::from_utf8_lossy(buf);
        info!(target: "hook", "{}", line.trim_end());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn build_error_result(
    store: &cadenza_store::LocalStore,
    drv_path: &StorePath,
    error: BuildError,
) -> GoalResult {
    let mut result = GoalResult::failed(format!(
        "builder for '{}' failed: {error}",
        store.display_path(drv_path)
    ));
    match &error {
        BuildError::Timeout => result.timed_out = true,
        BuildError::HashMismatch { .. } => {
            result.hash_mismatch = true;
            warn!(drv = %drv_path, "{error}");
        }
        BuildError::CheckMismatch(_) => result.check_mismatch = true,
        _ => {}
    }
    result.permanent_failure = error.is_permanent();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use cadenza_store::{LocalStore, LocalStoreConfig};
    use cadenza_store_core::content_address::{ContentAddress, FileIngestionMethod};
    use cadenza_store_core::derived_path::DerivedPath;
    use cadenza_store_core::store_path::{StorePathName, StoreReferences};
    use cadenza_utils_hash::Algorithm;
    use std::collections::{BTreeMap, BTreeSet};

    async fn temp_worker() -> (tempfile::TempDir, Arc<Worker>) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(
            LocalStore::open(LocalStoreConfig::under_root(dir.path()))
                .await
                .unwrap(),
        );
        let config = Arc::new(DaemonConfig {
            store_dir: store.config().store_dir.to_path().to_owned(),
            state_dir: store.config().state_dir.clone(),
            build_dir: dir.path().join("builds"),
            log_dir: None,
            sandbox: false,
            require_sigs: false,
            ..Default::default()
        });
        (dir, Worker::new(store, Vec::new(), config))
    }

    /// Store a derivation as a `.drv` text object, the way the front-end
    /// would, and return its path.
    async fn store_drv(worker: &Arc<Worker>, drv: &BasicDerivation) -> StorePath {
        worker
            .store()
            .add_text_to_store(
                &drv.drv_name().unwrap(),
                &drv.to_json(),
                &StoreReferences::default(),
            )
            .await
            .unwrap()
    }

    fn shell_drv(
        worker: &Arc<Worker>,
        name: &str,
        script: &str,
        out_path: StorePath,
    ) -> BasicDerivation {
        BasicDerivation {
            name: StorePathName::new(name).unwrap(),
            platform: "builtin".to_owned(),
            builder: "/bin/sh".to_owned(),
            args: vec!["-c".to_owned(), script.to_owned()],
            env: BTreeMap::from([(
                "out".to_owned(),
                worker.store().display_path(&out_path),
            )]),
            input_srcs: BTreeSet::new(),
            input_drvs: BTreeMap::new(),
            outputs: BTreeMap::from([(
                OutputName::out(),
                DerivationOutput::InputAddressed { path: out_path },
            )]),
        }
    }

    fn out_path_for(name: &str) -> StorePath {
        // Tests use fixed input-addressed outputs; the exact hash does
        // not matter, only that it is well-formed and unique per test.
        let hash = cadenza_store_core::StorePathHash::compress(
            &Algorithm::SHA256.digest(format!("test-output:{name}")),
        );
        StorePath::new(hash, StorePathName::new(name).unwrap())
    }

    #[tokio::test]
    async fn builds_a_simple_derivation() {
        let (_dir, worker) = temp_worker().await;
        let out = out_path_for("hello");
        let drv = shell_drv(&worker, "hello", "printf 'hello world' > \"$out\"", out.clone());
        let drv_path = store_drv(&worker, &drv).await;

        let result = worker
            .make_derivation_goal(drv_path, OutputSpec::All, BuildMode::Normal)
            .await;
        assert!(result.is_success(), "{:?}", result.error);

        assert!(worker.store().is_valid_path(&out).await.unwrap());
        let real = worker.store().real_path(&out);
        assert_eq!(std::fs::read(&real).unwrap(), b"hello world");

        let info = worker.store().query_path_info(&out).await.unwrap().unwrap();
        assert!(info.ultimate);
        assert!(info.deriver.is_some());
    }

    #[tokio::test]
    async fn second_build_is_a_no_op() {
        let (_dir, worker) = temp_worker().await;
        let out = out_path_for("once");
        let drv = shell_drv(
            &worker,
            "once",
            "printf 'ran at %s' \"$$\" > \"$out\"",
            out.clone(),
        );
        let drv_path = store_drv(&worker, &drv).await;

        let first = worker
            .make_derivation_goal(drv_path.clone(), OutputSpec::All, BuildMode::Normal)
            .await;
        assert!(first.is_success());
        let contents = std::fs::read(worker.store().real_path(&out)).unwrap();

        let second = worker
            .make_derivation_goal(drv_path, OutputSpec::All, BuildMode::Normal)
            .await;
        assert!(second.is_success());
        assert_eq!(
            std::fs::read(worker.store().real_path(&out)).unwrap(),
            contents,
            "output untouched by the second goal"
        );
    }

    #[tokio::test]
    async fn failing_builder_reports_permanent_failure() {
        let (_dir, worker) = temp_worker().await;
        let out = out_path_for("broken");
        let drv = shell_drv(&worker, "broken", "exit 3", out.clone());
        let drv_path = store_drv(&worker, &drv).await;

        let result = worker
            .make_derivation_goal(drv_path.clone(), OutputSpec::All, BuildMode::Normal)
            .await;
        assert!(!result.is_success());
        assert!(result.permanent_failure);
        assert!(!worker.store().is_valid_path(&out).await.unwrap());

        // The worker-level mask flags a build failure (S4-adjacent).
        let results = worker
            .realise(
                vec![DerivedPath::Built {
                    drv_path,
                    outputs: OutputSpec::All,
                }],
                BuildMode::Normal,
            )
            .await;
        assert_ne!(
            results.failing_exit_status & crate::worker::exit_mask::BUILD_FAILED,
            0
        );
    }

    /// S4: a fixed-output derivation whose builder produces the wrong
    /// content fails with a hash mismatch and registers nothing.
    #[tokio::test]
    async fn fixed_output_hash_mismatch() {
        let (_dir, worker) = temp_worker().await;

        // Declare the hash of "expected", build "something else".
        let declared = Algorithm::SHA256.digest("expected");
        let ca = ContentAddress::Fixed(FileIngestionMethod::Flat, declared);
        let out = DerivationOutput::CaFixed { ca }
            .path(
                worker.store().store_dir(),
                &StorePathName::new("fetched").unwrap(),
                &OutputName::out(),
            )
            .unwrap()
            .unwrap();

        let mut drv = shell_drv(
            &worker,
            "fetched",
            "printf 'something else' > \"$out\"",
            out.clone(),
        );
        drv.outputs =
            BTreeMap::from([(OutputName::out(), DerivationOutput::CaFixed { ca })]);
        let drv_path = store_drv(&worker, &drv).await;

        let result = worker
            .make_derivation_goal(drv_path, OutputSpec::All, BuildMode::Normal)
            .await;
        assert!(!result.is_success());
        assert!(result.hash_mismatch);
        let message = result.error.as_ref().unwrap();
        assert!(message.contains("sha256-"), "both hashes in SRI form: {message}");

        // The output was not registered; querying it reports invalid.
        assert!(!worker.store().is_valid_path(&out).await.unwrap());
        assert!(
            worker
                .store()
                .query_path_info(&out)
                .await
                .unwrap()
                .is_none()
        );
    }

    /// A dependency chain: the depender's goal realises the dependency
    /// derivation first and may then reference its output.
    #[tokio::test]
    async fn input_derivations_are_built_first() {
        let (_dir, worker) = temp_worker().await;

        let dep_out = out_path_for("libdep");
        let dep_drv = shell_drv(&worker, "libdep", "printf 'library' > \"$out\"", dep_out.clone());
        let dep_drv_path = store_drv(&worker, &dep_drv).await;

        let app_out = out_path_for("app");
        let mut app_drv = shell_drv(
            &worker,
            "app",
            // Copies the dependency's contents, creating a real reference.
            "{ cat \"$libdep\"; printf ' + app'; } > \"$out\"",
            app_out.clone(),
        );
        app_drv.env.insert(
            "libdep".to_owned(),
            worker.store().display_path(&dep_out),
        );
        app_drv.input_drvs.insert(
            dep_drv_path.clone(),
            BTreeSet::from([OutputName::out()]),
        );
        let app_drv_path = store_drv(&worker, &app_drv).await;

        let result = worker
            .make_derivation_goal(app_drv_path, OutputSpec::All, BuildMode::Normal)
            .await;
        assert!(result.is_success(), "{:?}", result.error);

        assert!(worker.store().is_valid_path(&dep_out).await.unwrap());
        assert_eq!(
            std::fs::read(worker.store().real_path(&app_out)).unwrap(),
            b"library + app"
        );

        // The reference scanner found the dependency's path in the output.
        let info = worker
            .store()
            .query_path_info(&app_out)
            .await
            .unwrap()
            .unwrap();
        assert!(info.references.contains(&dep_out));
    }

    /// A floating content-addressed output lands on a path derived from
    /// its contents and records a realisation.
    #[tokio::test]
    async fn floating_output_gets_content_address() {
        let (_dir, worker) = temp_worker().await;

        let mut drv = shell_drv(
            &worker,
            "floaty",
            "printf 'determined by content' > \"$out\"",
            out_path_for("unused"),
        );
        drv.outputs = BTreeMap::from([(
            OutputName::out(),
            DerivationOutput::CaFloating {
                method: FileIngestionMethod::Recursive,
                hash_algo: Algorithm::SHA256,
            },
        )]);
        drv.env.clear();
        let drv_path = store_drv(&worker, &drv).await;

        let result = worker
            .make_derivation_goal(drv_path, OutputSpec::All, BuildMode::Normal)
            .await;
        assert!(result.is_success(), "{:?}", result.error);

        // The realisation binds the floating output to a concrete path.
        let id = cadenza_store_core::DrvOutput {
            drv_hash: drv.derivation_hash(),
            output_name: OutputName::out(),
        };
        let realisation = worker
            .store()
            .query_realisation(&id)
            .await
            .unwrap()
            .expect("realisation recorded");
        assert!(
            worker
                .store()
                .is_valid_path(&realisation.out_path)
                .await
                .unwrap()
        );
        let info = worker
            .store()
            .query_path_info(&realisation.out_path)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            info.ca,
            Some(ContentAddress::Fixed(FileIngestionMethod::Recursive, _))
        ));
    }

    /// `disallowedReferences` rejects an output that smuggles in a
    /// dependency path.
    #[tokio::test]
    async fn disallowed_reference_fails_build() {
        let (_dir, worker) = temp_worker().await;

        let dep_out = out_path_for("contraband");
        let dep_drv =
            shell_drv(&worker, "contraband", "printf 'x' > \"$out\"", dep_out.clone());
        let dep_drv_path = store_drv(&worker, &dep_drv).await;

        let app_out = out_path_for("smuggler");
        let mut app_drv = shell_drv(
            &worker,
            "smuggler",
            "printf '%s' \"$contraband\" > \"$out\"",
            app_out.clone(),
        );
        app_drv
            .env
            .insert("contraband".to_owned(), worker.store().display_path(&dep_out));
        app_drv.env.insert(
            "disallowedReferences".to_owned(),
            worker.store().display_path(&dep_out),
        );
        app_drv
            .input_drvs
            .insert(dep_drv_path, BTreeSet::from([OutputName::out()]));
        let app_drv_path = store_drv(&worker, &app_drv).await;

        let result = worker
            .make_derivation_goal(app_drv_path, OutputSpec::All, BuildMode::Normal)
            .await;
        assert!(!result.is_success());
        assert!(result.permanent_failure);
        assert!(!worker.store().is_valid_path(&app_out).await.unwrap());
    }

    /// Check mode on a deterministic build succeeds; on a
    /// non-deterministic one it reports a check mismatch.
    #[tokio::test]
    async fn check_mode_detects_nondeterminism() {
        let (_dir, worker) = temp_worker().await;

        // Deterministic derivation.
        let stable_out = out_path_for("stable");
        let stable = shell_drv(&worker, "stable", "printf 'same' > \"$out\"", stable_out.clone());
        let stable_path = store_drv(&worker, &stable).await;
        assert!(
            worker
                .make_derivation_goal(stable_path.clone(), OutputSpec::All, BuildMode::Normal)
                .await
                .is_success()
        );
        let check = worker
            .make_derivation_goal(stable_path, OutputSpec::All, BuildMode::Check)
            .await;
        assert!(check.is_success(), "{:?}", check.error);

        // Non-deterministic derivation (embeds its own PID).
        let flaky_out = out_path_for("flaky");
        let flaky = shell_drv(&worker, "flaky", "printf '%s' $$ > \"$out\"", flaky_out.clone());
        let flaky_path = store_drv(&worker, &flaky).await;
        assert!(
            worker
                .make_derivation_goal(flaky_path.clone(), OutputSpec::All, BuildMode::Normal)
                .await
                .is_success()
        );
        let check = worker
            .make_derivation_goal(flaky_path, OutputSpec::All, BuildMode::Check)
            .await;
        assert!(!check.is_success());
        assert!(check.check_mismatch);
        // The original output is untouched.
        assert!(worker.store().is_valid_path(&flaky_out).await.unwrap());
    }
}
