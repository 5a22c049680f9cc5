// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Daemon configuration, loaded from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, IoContext};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Store directory (usually `/nix/store`).
    pub store_dir: PathBuf,

    /// State directory holding the database, roots and locks.
    pub state_dir: PathBuf,

    /// Maximum concurrent local builds. At least 1.
    pub max_jobs: usize,

    /// Maximum concurrent substitutions. At least 1.
    pub max_substitution_jobs: usize,

    /// Substituter store URIs, in configuration order.
    pub substituters: Vec<String>,

    /// Public keys substituted paths must be signed with.
    pub trusted_public_keys: Vec<String>,

    /// Require signatures on substituted paths.
    pub require_sigs: bool,

    /// Keep building unrelated goals after a failure.
    pub keep_going: bool,

    /// Retain failed build directories for debugging.
    pub keep_failed: bool,

    /// Try the next substituter after a transport failure (also enables
    /// the failing cache's cool-down).
    pub try_fallback: bool,

    /// Enable the build sandbox.
    pub sandbox: bool,

    /// Extra host paths bind-mounted read-only into every sandbox.
    pub sandbox_paths: Vec<PathBuf>,

    /// Directory for build-user UID lock files.
    pub pool_dir: PathBuf,

    /// First UID of the auto-allocated build user range.
    pub start_id: u32,

    /// Number of UIDs in the range.
    pub id_count: u32,

    /// Parent directory for build scratch directories.
    pub build_dir: PathBuf,

    /// Directory for compressed build logs; `None` disables persistence.
    pub log_dir: Option<PathBuf>,

    /// Wall-clock limit per build, in seconds. 0 = unlimited.
    pub build_timeout: u64,

    /// Kill a build after this long without log output. 0 = unlimited.
    pub max_silent_time: u64,

    /// External build hook program offered every derivation first.
    pub build_hook: Option<PathBuf>,

    /// The libexec helper binary (namespace probe, kill-user, …).
    /// Resolved through `PATH` when not absolute.
    pub libexec: PathBuf,

    /// Auto-GC low-water mark in bytes. 0 disables auto-GC.
    pub min_free: u64,

    /// Auto-GC target free space in bytes.
    pub max_free: u64,

    /// Log filter (`info`, `debug`, …).
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("/nix/store"),
            state_dir: PathBuf::from("/nix/var/nix"),
            max_jobs: 1,
            max_substitution_jobs: 16,
            substituters: Vec::new(),
            trusted_public_keys: Vec::new(),
            require_sigs: true,
            keep_going: false,
            keep_failed: false,
            try_fallback: true,
            sandbox: cfg!(target_os = "linux"),
            sandbox_paths: Vec::new(),
            pool_dir: PathBuf::from("/nix/var/nix/userpool"),
            start_id: 872_415_232,
            id_count: 65_536,
            build_dir: PathBuf::from("/nix/var/nix/builds"),
            log_dir: Some(PathBuf::from("/nix/var/log/nix")),
            build_timeout: 0,
            max_silent_time: 0,
            build_hook: None,
            libexec: PathBuf::from("cadenza-libexec"),
            min_free: 0,
            max_free: u64::MAX,
            log_level: "info".to_owned(),
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> Result<Self, DaemonError> {
        let contents = std::fs::read_to_string(path)
            .io_context(|| format!("failed to read config file at {}", path.display()))?;
        let mut config: DaemonConfig = toml::from_str(&contents)?;
        config.max_jobs = config.max_jobs.max(1);
        config.max_substitution_jobs = config.max_substitution_jobs.max(1);
        Ok(config)
    }

    pub fn build_timeout(&self) -> Option<Duration> {
        (self.build_timeout > 0).then(|| Duration::from_secs(self.build_timeout))
    }

    pub fn max_silent_time(&self) -> Option<Duration> {
        (self.max_silent_time > 0).then(|| Duration::from_secs(self.max_silent_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_sane_limits() {
        let config = DaemonConfig::default();
        assert!(config.max_jobs >= 1);
        assert!(config.max_substitution_jobs >= 1);
        assert_eq!(config.build_timeout(), None);
    }

    #[test]
    fn parses_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.toml");
        std::fs::write(
            &path,
            r#"
            max_jobs = 0
            substituters = ["https://cache.example.org"]
            build_timeout = 3600
            "#,
        )
        .unwrap();

        let config = DaemonConfig::from_file(&path).unwrap();
        // Clamped to at least one: a zero would deadlock the scheduler.
        assert_eq!(config.max_jobs, 1);
        assert_eq!(config.substituters.len(), 1);
        assert_eq!(
            config.build_timeout(),
            Some(Duration::from_secs(3600))
        );
        // Untouched fields keep their defaults.
        assert!(config.require_sigs);
    }
}
