// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Local build execution.
//!
//! One call to [`run_build`] takes a derivation whose inputs are already
//! realised and produces registered outputs: it prepares the scratch
//! directory and environment, spawns the builder in a sandbox, streams
//! its log with silence/wall-clock limits, then canonicalises, scans,
//! checks and registers every output.
//!
//! Outputs whose final path is unknown before the build (floating
//! content-addressed outputs) — and every output in `Check` mode — are
//! built at *scratch paths*: store-path-shaped locations whose hash part
//! is random. After the build the real path is derived from the
//! contents, and occurrences of the scratch hash part inside the outputs
//! are rewritten to the final one (an equal-length substitution).

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncBufReadExt as _;
use tracing::{debug, info, warn};

use cadenza_store::{LocalStore, Store as _, StoreError};
use cadenza_store_core::content_address::{ContentAddress, FileIngestionMethod};
use cadenza_store_core::derivation::{
    BasicDerivation, DerivationOptions, DerivationOutput, OutputName,
};
use cadenza_store_core::placeholder::hash_placeholder;
use cadenza_store_core::realisation::{DrvOutput, Realisation};
use cadenza_store_core::references::RefScanSink;
use cadenza_store_core::store_path::{StorePath, StorePathHash};
use cadenza_store_core::ValidPathInfo;
use cadenza_utils_hash::{Algorithm, Hash, NarHash};

use crate::config::DaemonConfig;
use crate::sandbox::{Sandbox, SandboxChild, make_sandbox};

/// How the outputs are to be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    Normal,
    /// Rebuild and replace existing outputs.
    Repair,
    /// Rebuild at scratch paths and compare against existing outputs.
    Check,
}

/// A build failure, classified for the worker's exit mask.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("build timed out")]
    Timeout,

    #[error("builder failed with exit code {0}")]
    ExitCode(i32),

    #[error("hash mismatch in fixed-output derivation: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("check of derivation found non-determinism: {0}")]
    CheckMismatch(String),

    #[error("output violates reference constraints: {0}")]
    OutputRejected(String),

    #[error("builder failed to produce output '{0}'")]
    MissingOutput(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Other(String),
}

impl BuildError {
    /// Whether retrying can possibly succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            BuildError::ExitCode(_)
                | BuildError::HashMismatch { .. }
                | BuildError::OutputRejected(_)
                | BuildError::MissingOutput(_)
        )
    }
}

/// Everything a successful build registered.
#[derive(Debug, Default)]
pub struct BuildOutcome {
    pub outputs: BTreeMap<OutputName, ValidPathInfo>,
    /// Bindings recorded for floating outputs.
    pub realisations: Vec<Realisation>,
}

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

/// Execute `drv` locally and register its outputs.
pub async fn run_build(
    store: &LocalStore,
    config: &DaemonConfig,
    drv_path: &StorePath,
    drv: &BasicDerivation,
    mode: BuildMode,
) -> Result<BuildOutcome, BuildError> {
    let options = DerivationOptions::from_derivation(drv);
    let store_dir = store.store_dir().clone();

    // Where each output will be written by the builder: the final path
    // when it is known and usable, a scratch path otherwise.
    let mut build_paths: BTreeMap<OutputName, StorePath> = BTreeMap::new();
    for (name, output) in &drv.outputs {
        let declared = output
            .path(&store_dir, &drv.name, name)
            .map_err(|e| BuildError::Other(format!("invalid output path: {e}")))?;
        match declared {
            Some(path) if mode != BuildMode::Check => {
                build_paths.insert(name.clone(), path);
            }
            _ => {
                let path = scratch_path(&store_dir, drv, name)
                    .map_err(|e| BuildError::Other(format!("scratch path: {e}")))?;
                build_paths.insert(name.clone(), path);
            }
        }
    }

    // Repair wipes the old outputs so the builder starts clean.
    if mode == BuildMode::Repair {
        for path in build_paths.values() {
            let real = store.real_path(path);
            if tokio::fs::symlink_metadata(&real).await.is_ok() {
                remove_forcibly(&real).await?;
            }
        }
    }

    // Leftovers from an interrupted earlier attempt.
    for path in build_paths.values() {
        let real = store.real_path(path);
        if tokio::fs::symlink_metadata(&real).await.is_ok() && mode != BuildMode::Repair {
            if store.is_valid_path(path).await? {
                continue;
            }
            remove_forcibly(&real).await?;
        }
    }

    tokio::fs::create_dir_all(&config.build_dir)
        .await
        .map_err(|e| BuildError::Other(format!("create build dir: {e}")))?;
    let build_tmp = tempfile::Builder::new()
        .prefix("cadenza-build-")
        .tempdir_in(&config.build_dir)
        .map_err(|e| BuildError::Other(format!("create build tmp dir: {e}")))?;

    let env = build_environment(store, drv, &options, build_tmp.path(), &build_paths)
        .map_err(|e| BuildError::Other(format!("set up environment: {e}")))?;

    let log_sink = open_build_log(drv_path, config);

    // The sandbox may only see the closure of the inputs.
    let input_closure = input_closure(store, drv, &build_paths).await?;

    let network = drv.is_fixed_output();
    let mut sandbox = make_sandbox(
        config,
        build_tmp.path(),
        input_closure.iter().map(|p| store.real_path(p)).collect(),
        &options
            .required_system_features
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>(),
        network,
    )
    .map_err(|e| BuildError::Other(e.to_string()))?;
    sandbox
        .prepare()
        .await
        .map_err(|e| BuildError::Other(e.to_string()))?;

    let args: Vec<&str> = drv.args.iter().map(String::as_str).collect();
    info!(drv = %drv_path, builder = %drv.builder, "starting build");
    let spawn_result = sandbox
        .spawn(&drv.builder, &args, &env, build_tmp.path())
        .await;

    let mut build_result = match spawn_result {
        Ok(child) => monitor_child(child, config, &log_sink).await,
        Err(e) => Err(BuildError::Other(e.to_string())),
    };
    // Outputs written to a chroot store live under the staging tree;
    // pull them into the real store before teardown removes it.
    if build_result.is_ok()
        && let Some(staging) = sandbox.output_staging_dir()
        && let Err(e) = collect_staged_outputs(store, &staging, &build_paths).await
    {
        build_result = Err(e);
    }
    sandbox
        .teardown()
        .await
        .map_err(|e| BuildError::Other(e.to_string()))?;
    drop(log_sink);

    if let Err(e) = build_result {
        cleanup_failed(store, config, drv, &build_paths).await;
        keep_or_drop_tmp(config, drv, build_tmp);
        return Err(e);
    }

    let outcome =
        register_outputs(store, drv_path, drv, &options, mode, &build_paths).await;
    if outcome.is_err() {
        cleanup_failed(store, config, drv, &build_paths).await;
        keep_or_drop_tmp(config, drv, build_tmp);
    }
    outcome
}

/// With `keep-failed`, retain the scratch directory for debugging — but
/// never for builtin builders, which may have written credentials into
/// it.
fn keep_or_drop_tmp(config: &DaemonConfig, drv: &BasicDerivation, build_tmp: tempfile::TempDir) {
    let is_builtin = drv.builder.starts_with("builtin:");
    if config.keep_failed && !is_builtin {
        let kept = build_tmp.keep();
        info!("keeping failed build directory '{}'", kept.display());
    }
}

/// The closure of the build's inputs: the declared source paths plus
/// every store path surfacing through the environment (resolved input
/// derivation outputs), closed over references. The build's own output
/// paths are excluded — they do not exist yet.
async fn input_closure(
    store: &LocalStore,
    drv: &BasicDerivation,
    build_paths: &BTreeMap<OutputName, StorePath>,
) -> Result<BTreeSet<StorePath>, BuildError> {
    let mut inputs: BTreeSet<StorePath> = drv.input_srcs.clone();
    for value in drv.env.values() {
        if let Ok(path) = store.store_dir().to_store_path(value) {
            inputs.insert(path);
        }
    }
    for path in build_paths.values() {
        inputs.remove(path);
    }
    Ok(store.compute_fs_closure(inputs, false).await?)
}

/// Move outputs the builder created in the chroot's store directory
/// onto their real paths. Falls back to a copy when the staging tree
/// lives on a different filesystem.
async fn collect_staged_outputs(
    store: &LocalStore,
    staging: &Path,
    build_paths: &BTreeMap<OutputName, StorePath>,
) -> Result<(), BuildError> {
    for path in build_paths.values() {
        let real = store.real_path(path);
        if tokio::fs::symlink_metadata(&real).await.is_ok() {
            continue;
        }
        let display_path = store.display_path(path);
        let staged = staging.join(display_path.trim_start_matches('/'));
        if tokio::fs::symlink_metadata(&staged).await.is_err() {
            // The builder may legitimately not have produced this
            // output; register_outputs reports that with context.
            continue;
        }
        move_path(&staged, &real).await.map_err(|e| {
            BuildError::Other(format!("move output '{display_path}' out of sandbox: {e}"))
        })?;
        debug!(path = %display_path, "collected output from sandbox");
    }
    Ok(())
}

/// Rename, or copy-and-delete across filesystem boundaries.
async fn move_path(from: &Path, to: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            let from = from.to_owned();
            let to = to.to_owned();
            tokio::task::spawn_blocking(move || {
                copy_tree(&from, &to)?;
                let meta = std::fs::symlink_metadata(&from)?;
                if meta.is_dir() {
                    std::fs::remove_dir_all(&from)
                } else {
                    std::fs::remove_file(&from)
                }
            })
            .await
            .map_err(std::io::Error::other)?
        }
        Err(e) => Err(e),
    }
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt as _;

    let meta = std::fs::symlink_metadata(from)?;
    if meta.is_symlink() {
        std::os::unix::fs::symlink(std::fs::read_link(from)?, to)?;
    } else if meta.is_dir() {
        std::fs::create_dir(to)?;
        for entry in std::fs::read_dir(from)? {
            let entry = entry?;
            copy_tree(&entry.path(), &to.join(entry.file_name()))?;
        }
        std::fs::set_permissions(to, meta.permissions())?;
    } else {
        std::fs::copy(from, to)?;
        std::fs::set_permissions(to, std::fs::Permissions::from_mode(meta.permissions().mode()))?;
    }
    Ok(())
}

/// A store-path-shaped location with a random hash part. Illegal as a
/// real store path hash (it is not derived from anything) but exactly as
/// long, so post-build rewriting preserves file sizes.
fn scratch_path(
    store_dir: &cadenza_store_core::StoreDir,
    drv: &BasicDerivation,
    output: &OutputName,
) -> Result<StorePath, cadenza_store_core::BadStorePath> {
    let seq = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
    let seed = format!(
        "scratch:{}:{}:{}:{}",
        drv.name,
        output,
        std::process::id(),
        seq
    );
    let hash = StorePathHash::compress(&Algorithm::SHA256.digest(seed));
    let name = cadenza_store_core::derivation::output_path_name(&drv.name, output)?;
    Ok(StorePath::new(hash, name))
}

/// Builder environment, in the canonical ordering: overridable defaults,
/// then derivation variables (with `passAsFile` spilled to disk), then
/// the fixed system variables nothing may override.
fn build_environment(
    store: &LocalStore,
    drv: &BasicDerivation,
    options: &DerivationOptions,
    build_dir: &Path,
    build_paths: &BTreeMap<OutputName, StorePath>,
) -> std::io::Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    let build_dir_str = build_dir.to_string_lossy().into_owned();
    let structured = drv.structured_attrs();

    env.insert("PATH".to_owned(), "/path-not-set".to_owned());
    env.insert("HOME".to_owned(), "/homeless-shelter".to_owned());
    env.insert(
        "NIX_STORE".to_owned(),
        store.store_dir().as_str().to_owned(),
    );
    env.insert(
        "NIX_BUILD_CORES".to_owned(),
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .to_string(),
    );

    if let Some(attrs) = &structured {
        // Structured attrs: everything goes through one JSON file.
        let mut json = attrs.clone();
        let mut outputs_json = serde_json::Map::new();
        for (name, path) in build_paths {
            outputs_json.insert(
                name.to_string(),
                serde_json::Value::String(store.display_path(path)),
            );
        }
        json.insert("outputs".to_owned(), serde_json::Value::Object(outputs_json));
        let json_path = build_dir.join(".attrs.json");
        std::fs::write(&json_path, serde_json::to_vec(&json)?)?;
        env.insert(
            "NIX_ATTRS_JSON_FILE".to_owned(),
            json_path.to_string_lossy().into_owned(),
        );
    } else {
        for (key, value) in &drv.env {
            if key == "passAsFile" {
                continue;
            }
            if options.pass_as_file.contains(key) {
                let name_hash = Algorithm::SHA256.digest(key.as_bytes()).to_base32();
                let file_path = build_dir.join(format!(".attr-{name_hash}"));
                std::fs::write(&file_path, value)?;
                env.insert(
                    format!("{key}Path"),
                    file_path.to_string_lossy().into_owned(),
                );
            } else {
                env.insert(key.clone(), value.clone());
            }
        }
    }

    env.insert("NIX_BUILD_TOP".to_owned(), build_dir_str.clone());
    for tmp in ["TMPDIR", "TEMPDIR", "TMP", "TEMP"] {
        env.insert(tmp.to_owned(), build_dir_str.clone());
    }
    env.insert("PWD".to_owned(), build_dir_str);

    let mut output_names = Vec::new();
    for (name, path) in build_paths {
        env.insert(name.to_string(), store.display_path(path));
        output_names.push(name.to_string());
    }
    env.insert("outputs".to_owned(), output_names.join(" "));

    if drv.is_fixed_output() {
        env.insert("NIX_OUTPUT_CHECKED".to_owned(), "1".to_owned());
        for var in &options.impure_env_vars {
            if let Ok(value) = std::env::var(var) {
                env.insert(var.clone(), value);
            }
        }
    }

    env.insert("NIX_LOG_FD".to_owned(), "2".to_owned());
    env.insert("TERM".to_owned(), "xterm-256color".to_owned());

    // Floating outputs appear in the derivation's own env as opaque
    // placeholders; resolve them to the scratch locations now.
    let mut placeholder_map = BTreeMap::new();
    for (name, output) in &drv.outputs {
        if output.is_floating() {
            placeholder_map.insert(
                hash_placeholder(name),
                store.display_path(&build_paths[name]),
            );
        }
    }
    if !placeholder_map.is_empty() {
        for value in env.values_mut() {
            for (placeholder, path) in &placeholder_map {
                if value.contains(placeholder.as_str()) {
                    *value = value.replace(placeholder.as_str(), path);
                }
            }
        }
    }

    Ok(env)
}

type LogSink = Arc<std::sync::Mutex<dyn std::io::Write + Send>>;

/// Open the bzip2-compressed build log at
/// `<log-dir>/drvs/<xx>/<rest>.bz2`; a missing log dir just discards.
fn open_build_log(drv_path: &StorePath, config: &DaemonConfig) -> LogSink {
    let Some(log_dir) = &config.log_dir else {
        return Arc::new(std::sync::Mutex::new(std::io::sink()));
    };
    let base_name = drv_path.to_string();
    let (prefix, rest) = base_name.split_at(2);
    let dir = log_dir.join("drvs").join(prefix);
    let open = || -> std::io::Result<_> {
        std::fs::create_dir_all(&dir)?;
        let file = std::fs::File::create(dir.join(format!("{rest}.bz2")))?;
        Ok(bzip2::write::BzEncoder::new(file, bzip2::Compression::default()))
    };
    match open() {
        Ok(writer) => Arc::new(std::sync::Mutex::new(writer)),
        Err(e) => {
            warn!("failed to open build log for {drv_path}: {e}");
            Arc::new(std::sync::Mutex::new(std::io::sink()))
        }
    }
}

/// Drain the builder's output into the log sink while enforcing the
/// wall-clock and max-silent limits. Timeouts kill the whole process
/// group.
pub(crate) async fn monitor_child(
    mut child: SandboxChild,
    config: &DaemonConfig,
    log_sink: &LogSink,
) -> Result<(), BuildError> {
    let pid = child.pid();
    let last_output = Arc::new(std::sync::Mutex::new(tokio::time::Instant::now()));

    let mut drain_tasks = Vec::new();
    let streams: [Option<Box<dyn tokio::io::AsyncRead + Send + Unpin>>; 2] = [
        child
            .take_stdout()
            .map(|s| Box::new(s) as Box<dyn tokio::io::AsyncRead + Send + Unpin>),
        child
            .take_stderr()
            .map(|s| Box::new(s) as Box<dyn tokio::io::AsyncRead + Send + Unpin>),
    ];
    for stream in streams.into_iter().flatten() {
        let last = Arc::clone(&last_output);
        let sink = Arc::clone(log_sink);
        drain_tasks.push(tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                *last.lock().unwrap() = tokio::time::Instant::now();
                let mut sink = sink.lock().unwrap();
                let _ = writeln!(sink, "{line}");
            }
        }));
    }

    let wall_deadline = config
        .build_timeout()
        .map(|d| tokio::time::Instant::now() + d);
    let max_silent = config.max_silent_time();

    let status = loop {
        let poll_interval = if max_silent.is_some() {
            std::time::Duration::from_millis(100)
        } else if let Some(deadline) = wall_deadline {
            deadline.saturating_duration_since(tokio::time::Instant::now())
        } else {
            match child.wait().await {
                Ok(status) => break status,
                Err(e) => return Err(BuildError::Other(format!("wait: {e}"))),
            }
        };

        tokio::select! {
            result = child.wait() => match result {
                Ok(status) => break status,
                Err(e) => return Err(BuildError::Other(format!("wait: {e}"))),
            },
            _ = tokio::time::sleep(poll_interval) => {
                let wall_expired = wall_deadline
                    .is_some_and(|deadline| tokio::time::Instant::now() >= deadline);
                let silent_expired = max_silent
                    .is_some_and(|limit| last_output.lock().unwrap().elapsed() >= limit);
                if wall_expired || silent_expired {
                    kill_process_group(pid);
                    let _ = child.kill().await;
                    for task in drain_tasks {
                        let _ = task.await;
                    }
                    return Err(BuildError::Timeout);
                }
            }
        }
    };

    for task in drain_tasks {
        let _ = task.await;
    }

    if status.success() {
        Ok(())
    } else {
        Err(BuildError::ExitCode(status.code().unwrap_or(-1)))
    }
}

/// SIGKILL the process group rooted at `pid`.
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        let _ = nix::sys::signal::killpg(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        );
    }
}

/// Post-build pipeline: canonicalise, scan, check, finalise floating
/// outputs, register.
async fn register_outputs(
    store: &LocalStore,
    drv_path: &StorePath,
    drv: &BasicDerivation,
    options: &DerivationOptions,
    mode: BuildMode,
    build_paths: &BTreeMap<OutputName, StorePath>,
) -> Result<BuildOutcome, BuildError> {
    // Reference candidates: declared inputs plus this derivation's other
    // outputs (including the scratch names, which get rewritten later).
    let mut candidates: BTreeSet<StorePath> = drv.input_srcs.clone();
    for input_drv in drv.input_drvs.keys() {
        // Input derivation outputs were realised by the caller; their
        // concrete paths appear in the env, but the scan works on hash
        // parts, so the drv path itself is also a fine candidate.
        candidates.insert(input_drv.clone());
    }
    for (name, value) in &drv.env {
        // Input output paths surface through the environment.
        if name.starts_with("__") {
            continue;
        }
        if let Ok(path) = store.store_dir().to_store_path(value) {
            candidates.insert(path);
        }
    }
    candidates.extend(build_paths.values().cloned());

    let mut outcome = BuildOutcome::default();

    for (name, built_path) in build_paths {
        let real = store.real_path(built_path);
        if tokio::fs::symlink_metadata(&real).await.is_err() {
            return Err(BuildError::MissingOutput(name.to_string()));
        }

        cadenza_store::canonicalize::canonicalise_path_metadata(&real)
            .await
            .map_err(|e| BuildError::Other(format!("canonicalise {built_path}: {e}")))?;

        let (nar_hash, nar_size, references) =
            hash_and_scan(&real, &candidates, built_path).await?;

        // Fixed-output: the declared hash must match what was produced.
        if let Some(DerivationOutput::CaFixed { ca }) = drv.outputs.get(name) {
            let actual = match ca.ingestion_method() {
                FileIngestionMethod::Recursive => {
                    nar_content_hash(&real, ca.hash().algorithm()).await?
                }
                FileIngestionMethod::Flat => {
                    let bytes = tokio::fs::read(&real)
                        .await
                        .map_err(|e| BuildError::Other(format!("read output: {e}")))?;
                    ca.hash().algorithm().digest(&bytes)
                }
            };
            if actual != *ca.hash() {
                remove_forcibly(&real).await?;
                return Err(BuildError::HashMismatch {
                    expected: ca.hash().to_sri(),
                    actual: actual.to_sri(),
                });
            }
        }

        let is_floating = drv
            .outputs
            .get(name)
            .is_some_and(DerivationOutput::is_floating);

        let (final_path, final_info, realisation) = if is_floating {
            finalise_floating_output(store, drv, name, built_path, &references).await?
        } else {
            let mut info = ValidPathInfo::new(built_path.clone(), nar_hash, nar_size);
            info.references = references;
            (built_path.clone(), info, None)
        };

        check_output_constraints(store, options, &final_info).await?;

        if mode == BuildMode::Check {
            verify_check_build(store, drv, name, built_path, &final_info).await?;
            continue;
        }

        let mut info = final_info;
        info.deriver = Some(drv_path.clone());
        info.ultimate = true;
        if let Some(DerivationOutput::CaFixed { ca }) = drv.outputs.get(name) {
            info.ca = Some(*ca);
        }
        outcome.outputs.insert(name.clone(), info);
        if let Some(realisation) = realisation {
            outcome.realisations.push(realisation);
        }
        debug!(output = %name, path = %final_path, "output ready");
    }

    if mode == BuildMode::Check {
        return Ok(outcome);
    }

    store
        .register_valid_paths(outcome.outputs.values().cloned().collect())
        .await?;
    for realisation in &outcome.realisations {
        store.register_realisation(realisation).await?;
    }
    Ok(outcome)
}

/// One pass over the output's NAR: SHA-256, size, and reference scan.
async fn hash_and_scan(
    real: &Path,
    candidates: &BTreeSet<StorePath>,
    self_path: &StorePath,
) -> Result<(NarHash, u64, BTreeSet<StorePath>), BuildError> {
    use futures::StreamExt as _;

    let mut hasher = cadenza_utils_hash::Context::new(Algorithm::SHA256);
    let mut sink = RefScanSink::new(candidates, Some(self_path));
    let mut size = 0u64;

    let mut stream = cadenza_nar::NarByteStream::new(real.to_owned());
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| BuildError::Other(format!("NAR stream: {e}")))?;
        hasher.update(&chunk);
        sink.feed(&chunk);
        size += chunk.len() as u64;
    }

    let hash = hasher.finish();
    let nar_hash = NarHash::try_from(hash).expect("context algorithm is SHA-256");
    Ok((nar_hash, size, sink.found_paths()))
}

/// NAR hash of `real` under an arbitrary algorithm (fixed-output checks
/// may declare sha1/sha512).
async fn nar_content_hash(real: &Path, algorithm: Algorithm) -> Result<Hash, BuildError> {
    let mut sink = cadenza_utils_hash::HashSink::new(algorithm);
    cadenza_nar::dump_to_writer(real, &mut sink)
        .await
        .map_err(|e| BuildError::Other(format!("NAR dump: {e}")))?;
    let (_, hash) = sink.finish();
    Ok(hash)
}

/// Derive the real path of a floating output from its contents, rewrite
/// the scratch hash part, move the tree, and produce the realisation.
async fn finalise_floating_output(
    store: &LocalStore,
    drv: &BasicDerivation,
    name: &OutputName,
    scratch_path: &StorePath,
    references: &BTreeSet<StorePath>,
) -> Result<(StorePath, ValidPathInfo, Option<Realisation>), BuildError> {
    let DerivationOutput::CaFloating { method, hash_algo } = &drv.outputs[name] else {
        unreachable!("caller checked is_floating");
    };
    let scratch_real = store.real_path(scratch_path);

    // Hash modulo the scratch hash part, so self-references do not make
    // the path depend on itself.
    let modulus = scratch_path.hash_part();
    let content_hash = match method {
        FileIngestionMethod::Recursive => {
            let nar = cadenza_nar::dump_to_vec(&scratch_real)
                .await
                .map_err(|e| BuildError::Other(format!("NAR dump: {e}")))?;
            let (hash, _len) = cadenza_nar::compute_hash_modulo(
                *hash_algo,
                modulus.as_bytes(),
                std::io::Cursor::new(nar),
            )
            .await
            .map_err(|e| BuildError::Other(format!("hash modulo: {e}")))?;
            hash
        }
        FileIngestionMethod::Flat => {
            let bytes = tokio::fs::read(&scratch_real)
                .await
                .map_err(|e| BuildError::Other(format!("read output: {e}")))?;
            hash_algo.digest(&bytes)
        }
    };

    let self_referenced = references.contains(scratch_path);
    let refs = cadenza_store_core::StoreReferences {
        others: references
            .iter()
            .filter(|r| *r != scratch_path)
            .cloned()
            .collect(),
        self_ref: self_referenced,
    };
    let final_path = store
        .store_dir()
        .make_fixed_output_path(*method, &content_hash, scratch_path.name(), &refs)
        .map_err(|e| BuildError::Other(format!("derive CA path: {e}")))?;

    // Rewrite scratch → final inside the tree (equal-length hash parts),
    // then move it onto the real location.
    rewrite_tree_in_place(&scratch_real, &modulus, &final_path.hash_part())
        .await
        .map_err(|e| BuildError::Other(format!("rewrite self references: {e}")))?;
    let final_real = store.real_path(&final_path);
    if tokio::fs::symlink_metadata(&final_real).await.is_ok() {
        // Another build beat us to identical contents; ours is redundant.
        remove_forcibly(&scratch_real).await?;
    } else {
        tokio::fs::rename(&scratch_real, &final_real)
            .await
            .map_err(|e| BuildError::Other(format!("move output into place: {e}")))?;
    }

    let (nar_hash, nar_size) = cadenza_nar::hash_modulo::nar_hash_and_size(&final_real)
        .await
        .map_err(|e| BuildError::Other(format!("NAR hash: {e}")))?;

    let mut info = ValidPathInfo::new(final_path.clone(), nar_hash, nar_size);
    info.references = refs.others.clone();
    if refs.self_ref {
        info.references.insert(final_path.clone());
    }
    info.ca = Some(ContentAddress::Fixed(*method, content_hash));

    let realisation = Realisation::new(
        DrvOutput {
            drv_hash: drv.derivation_hash(),
            output_name: name.clone(),
        },
        final_path.clone(),
    );
    Ok((final_path, info, Some(realisation)))
}

/// Apply the derivation's `allowedReferences` / `disallowedReferences`
/// (and the requisite closure variants) to one output.
async fn check_output_constraints(
    store: &LocalStore,
    options: &DerivationOptions,
    info: &ValidPathInfo,
) -> Result<(), BuildError> {
    let display = |p: &StorePath| store.display_path(p);

    if let Some(allowed) = &options.allowed_references {
        for reference in &info.references {
            let ok = allowed.contains(&display(reference))
                || allowed.contains(reference.name().as_str())
                || *reference == info.path;
            if !ok {
                return Err(BuildError::OutputRejected(format!(
                    "output '{}' references '{}', which is not allowed",
                    info.path, reference
                )));
            }
        }
    }
    for reference in &info.references {
        if options.disallowed_references.contains(&display(reference)) {
            return Err(BuildError::OutputRejected(format!(
                "output '{}' references '{}', which is disallowed",
                info.path, reference
            )));
        }
    }

    if options.allowed_requisites.is_some() || !options.disallowed_requisites.is_empty() {
        let start: BTreeSet<StorePath> = info
            .references
            .iter()
            .filter(|r| **r != info.path)
            .cloned()
            .collect();
        let closure = store.compute_fs_closure(start, false).await?;
        if let Some(allowed) = &options.allowed_requisites {
            for path in &closure {
                if !allowed.contains(&display(path)) {
                    return Err(BuildError::OutputRejected(format!(
                        "output '{}' requires '{}', which is not allowed",
                        info.path, path
                    )));
                }
            }
        }
        for path in &closure {
            if options.disallowed_requisites.contains(&display(path)) {
                return Err(BuildError::OutputRejected(format!(
                    "output '{}' requires '{}', which is disallowed",
                    info.path, path
                )));
            }
        }
    }
    Ok(())
}

/// Compare a check-mode rebuild at its scratch path against the
/// registered output.
async fn verify_check_build(
    store: &LocalStore,
    drv: &BasicDerivation,
    name: &OutputName,
    scratch_path: &StorePath,
    rebuilt: &ValidPathInfo,
) -> Result<(), BuildError> {
    let declared = drv.outputs[name]
        .path(store.store_dir(), &drv.name, name)
        .map_err(|e| BuildError::Other(format!("output path: {e}")))?;
    let scratch_real = store.real_path(scratch_path);

    let result = if let Some(declared) = declared {
        match store.query_path_info(&declared).await? {
            Some(existing) if existing.nar_hash != rebuilt.nar_hash => {
                Err(BuildError::CheckMismatch(format!(
                    "output '{declared}' differs from previous build: {} vs {}",
                    Hash::from(existing.nar_hash),
                    Hash::from(rebuilt.nar_hash),
                )))
            }
            Some(_) => Ok(()),
            None => Err(BuildError::CheckMismatch(format!(
                "output '{declared}' is not valid, nothing to check against"
            ))),
        }
    } else {
        Ok(())
    };

    // Scratch rebuilds are never kept.
    if tokio::fs::symlink_metadata(&scratch_real).await.is_ok() {
        let _ = remove_forcibly(&scratch_real).await;
    }
    result
}

/// Rewrite every occurrence of `from` to `to` in file contents and
/// symlink targets under `root`. Both must have equal length.
async fn rewrite_tree_in_place(root: &Path, from: &str, to: &str) -> std::io::Result<()> {
    let root = root.to_owned();
    let from = from.as_bytes().to_vec();
    let to = to.as_bytes().to_vec();
    tokio::task::spawn_blocking(move || {
        use std::os::unix::fs::PermissionsExt as _;

        let rewrites = BTreeMap::from([(from.clone(), to.clone())]);
        for entry in walkdir::WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if entry.file_type().is_file() {
                let contents = std::fs::read(path)?;
                let rewritten = cadenza_nar::rewrite::rewrite_bytes(rewrites.clone(), &contents);
                if rewritten != contents {
                    let mode = std::fs::metadata(path)?.permissions().mode();
                    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
                    std::fs::write(path, rewritten)?;
                    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
                }
            } else if entry.file_type().is_symlink() {
                let target = std::fs::read_link(path)?;
                let target_bytes = target.as_os_str().as_encoded_bytes();
                let rewritten =
                    cadenza_nar::rewrite::rewrite_bytes(rewrites.clone(), target_bytes);
                if rewritten != target_bytes {
                    let new_target = PathBuf::from(String::from_utf8_lossy(&rewritten).into_owned());
                    std::fs::remove_file(path)?;
                    std::os::unix::fs::symlink(new_target, path)?;
                }
            }
        }
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)?
}

async fn cleanup_failed(
    store: &LocalStore,
    config: &DaemonConfig,
    drv: &BasicDerivation,
    build_paths: &BTreeMap<OutputName, StorePath>,
) {
    let is_builtin = drv.builder.starts_with("builtin:");
    for path in build_paths.values() {
        let real = store.real_path(path);
        if store.is_valid_path(path).await.unwrap_or(false) {
            continue;
        }
        if config.keep_failed && !is_builtin {
            let failed = real.with_file_name(format!("{path}.failed"));
            let _ = tokio::fs::rename(&real, &failed).await;
        } else if tokio::fs::symlink_metadata(&real).await.is_ok() {
            let _ = remove_forcibly(&real).await;
        }
    }
}

async fn remove_forcibly(path: &Path) -> Result<(), BuildError> {
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || {
        fn make_writable(path: &Path) -> std::io::Result<()> {
            use std::os::unix::fs::PermissionsExt as _;
            let meta = std::fs::symlink_metadata(path)?;
            if meta.is_dir() {
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
                for entry in std::fs::read_dir(path)? {
                    make_writable(&entry?.path())?;
                }
            }
            Ok(())
        }
        let meta = std::fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            make_writable(&path)?;
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        }
    })
    .await
    .map_err(|e| BuildError::Other(format!("join: {e}")))?
    .map_err(|e| BuildError::Other(format!("remove failed output: {e}")))
}
