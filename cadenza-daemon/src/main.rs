// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Thin daemon front-end: load the configuration, open the store and
//! substituters, realise the derived paths given on the command line,
//! and exit with the worker's failure mask.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};

use cadenza_daemon::{BuildMode, DaemonConfig, Worker, stores};
use cadenza_store::store::Store as _;
use cadenza_store_core::derived_path::DerivedPath;

fn usage() -> ! {
    eprintln!("usage: cadenza-daemon [--config FILE] [--check] PATHS...");
    eprintln!("  PATHS are store paths or '<drv>!<outputs>' derived paths");
    std::process::exit(2);
}

#[tokio::main]
async fn main() {
    let mut config_path: Option<PathBuf> = None;
    let mut mode = BuildMode::Normal;
    let mut targets = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => match args.next() {
                Some(path) => config_path = Some(PathBuf::from(path)),
                None => usage(),
            },
            "--check" => mode = BuildMode::Check,
            "--repair" => mode = BuildMode::Repair,
            "--help" => usage(),
            _ => targets.push(arg),
        }
    }

    let config = match &config_path {
        Some(path) => match DaemonConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("cadenza-daemon: {e}");
                std::process::exit(1);
            }
        },
        None => DaemonConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone())),
        )
        .init();

    if targets.is_empty() {
        usage();
    }

    if config.sandbox {
        let support = cadenza_daemon::helpers::check_namespace_support(&config.libexec).await;
        if !support.user {
            tracing::warn!(
                "user namespaces appear unusable; sandboxed builds will fail \
                 (set sandbox = false to build without isolation)"
            );
        }
    }

    let store = match stores::open_local_store(&config).await {
        Ok(store) => store,
        Err(e) => {
            error!("cannot open store: {e}");
            std::process::exit(1);
        }
    };
    let substituters = stores::open_substituters(&config).await;
    info!(
        substituters = substituters.len(),
        max_jobs = config.max_jobs,
        "daemon ready"
    );

    let worker = Worker::new(store.clone(), substituters, Arc::new(config));

    let mut derived = Vec::new();
    for target in &targets {
        match DerivedPath::parse(store.store_dir(), target) {
            Ok(path) => derived.push(path),
            Err(e) => {
                error!("bad path '{target}': {e}");
                std::process::exit(1);
            }
        }
    }

    // Ctrl-C cancels all goals cooperatively.
    let interrupt_worker = Arc::clone(&worker);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("interrupted; cancelling goals");
            interrupt_worker.interrupt();
        }
    });

    let results = worker.realise(derived, mode).await;
    for (target, result) in &results.goals {
        if result.is_success() {
            info!("done: {}", target.display(store.store_dir()));
        } else {
            error!(
                "failed: {}: {}",
                target.display(store.store_dir()),
                result.error.as_deref().map(String::as_str).unwrap_or("unknown error")
            );
        }
    }

    std::process::exit(results.failing_exit_status as i32);
}
