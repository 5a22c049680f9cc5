// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Sandbox abstraction for build isolation.
//!
//! The executor talks to a [`Sandbox`]; the concrete policy comes from
//! the platform and configuration:
//!
//! - [`crate::linux_sandbox::LinuxSandbox`] — user/mount/net namespaces
//! - [`NoSandbox`] — no isolation, the portable fallback
//!
//! A platform without sandbox support must *refuse* a build that
//! requested sandboxing rather than silently running it open; that
//! decision is made in [`make_sandbox`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use crate::config::DaemonConfig;

/// A mount entry in the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxMount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
    /// Missing sources are tolerated.
    pub optional: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox setup failed: {0}")]
    Setup(String),
    #[error("sandbox spawn failed: {0}")]
    Spawn(String),
    #[error("sandboxing was requested but is not supported on this platform")]
    Unsupported,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Isolation around one builder process.
pub trait Sandbox: Send + Sync {
    /// Allocate resources (build user, scratch mounts) before spawning.
    fn prepare(&mut self) -> impl Future<Output = Result<(), SandboxError>> + Send;

    /// Spawn the builder inside the sandbox.
    fn spawn(
        &self,
        builder: &str,
        args: &[&str],
        env: &BTreeMap<String, String>,
        work_dir: &Path,
    ) -> impl Future<Output = Result<SandboxChild, SandboxError>> + Send;

    /// Release resources after the build.
    fn teardown(&mut self) -> impl Future<Output = Result<(), SandboxError>> + Send;

    /// Paths that will be visible inside the sandbox. For the Linux
    /// sandbox this is the mount list `spawn` assembles the chroot
    /// from; `NoSandbox` hides nothing and reports none.
    fn bind_mount_paths(&self) -> Vec<SandboxMount> {
        Vec::new()
    }
}

/// A running builder process.
pub struct SandboxChild {
    inner: tokio::process::Child,
}

impl SandboxChild {
    pub fn from_child(inner: tokio::process::Child) -> Self {
        Self { inner }
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, SandboxError> {
        Ok(self.inner.wait().await?)
    }

    pub async fn kill(&mut self) -> Result<(), SandboxError> {
        Ok(self.inner.kill().await?)
    }

    pub fn take_stdout(&mut self) -> Option<impl tokio::io::AsyncRead + Send + Unpin + use<>> {
        self.inner.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<impl tokio::io::AsyncRead + Send + Unpin + use<>> {
        self.inner.stderr.take()
    }

    /// Process id, for process-group kills.
    pub fn pid(&self) -> Option<u32> {
        self.inner.id()
    }
}

/// No isolation: the builder runs directly as a child of the daemon.
pub struct NoSandbox;

impl Default for NoSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl NoSandbox {
    pub fn new() -> Self {
        NoSandbox
    }
}

impl Sandbox for NoSandbox {
    async fn prepare(&mut self) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn spawn(
        &self,
        builder: &str,
        args: &[&str],
        env: &BTreeMap<String, String>,
        work_dir: &Path,
    ) -> Result<SandboxChild, SandboxError> {
        use std::process::Stdio;

        let mut cmd = tokio::process::Command::new(builder);
        cmd.args(args)
            .current_dir(work_dir)
            .env_clear()
            .envs(env.iter())
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("failed to spawn '{builder}': {e}")))?;
        Ok(SandboxChild::from_child(child))
    }

    async fn teardown(&mut self) -> Result<(), SandboxError> {
        Ok(())
    }
}

/// Either of the two concrete sandboxes, picked per build.
pub enum AnySandbox {
    None(NoSandbox),
    #[cfg(target_os = "linux")]
    Linux(crate::linux_sandbox::LinuxSandbox),
}

impl Sandbox for AnySandbox {
    async fn prepare(&mut self) -> Result<(), SandboxError> {
        match self {
            AnySandbox::None(s) => s.prepare().await,
            #[cfg(target_os = "linux")]
            AnySandbox::Linux(s) => s.prepare().await,
        }
    }

    async fn spawn(
        &self,
        builder: &str,
        args: &[&str],
        env: &BTreeMap<String, String>,
        work_dir: &Path,
    ) -> Result<SandboxChild, SandboxError> {
        match self {
            AnySandbox::None(s) => s.spawn(builder, args, env, work_dir).await,
            #[cfg(target_os = "linux")]
            AnySandbox::Linux(s) => s.spawn(builder, args, env, work_dir).await,
        }
    }

    async fn teardown(&mut self) -> Result<(), SandboxError> {
        match self {
            AnySandbox::None(s) => s.teardown().await,
            #[cfg(target_os = "linux")]
            AnySandbox::Linux(s) => s.teardown().await,
        }
    }

    fn bind_mount_paths(&self) -> Vec<SandboxMount> {
        match self {
            AnySandbox::None(s) => s.bind_mount_paths(),
            #[cfg(target_os = "linux")]
            AnySandbox::Linux(s) => s.bind_mount_paths(),
        }
    }
}

impl AnySandbox {
    /// Where builder-created store entries land on the host, for
    /// sandboxes that redirect the store into a chroot. `None` means
    /// the builder wrote to the real store directly.
    pub fn output_staging_dir(&self) -> Option<PathBuf> {
        match self {
            AnySandbox::None(_) => None,
            #[cfg(target_os = "linux")]
            AnySandbox::Linux(s) => s.chroot_root().map(Path::to_owned),
        }
    }
}

/// Pick the sandbox for one build.
///
/// `input_paths` is the closure the builder may see; `network` is true
/// for fixed-output derivations, which are allowed outbound
/// connectivity.
pub fn make_sandbox(
    config: &DaemonConfig,
    build_dir: &Path,
    input_paths: Vec<PathBuf>,
    required_system_features: &std::collections::BTreeSet<String>,
    network: bool,
) -> Result<AnySandbox, SandboxError> {
    if !config.sandbox {
        return Ok(AnySandbox::None(NoSandbox::new()));
    }

    #[cfg(target_os = "linux")]
    {
        let sandbox_config = crate::linux_sandbox::LinuxSandboxConfig {
            store_dir: config.store_dir.clone(),
            build_dir: build_dir.to_owned(),
            input_paths,
            required_system_features: required_system_features.clone(),
            extra_sandbox_paths: config.sandbox_paths.clone(),
            network,
        };
        Ok(AnySandbox::Linux(crate::linux_sandbox::LinuxSandbox::new(
            sandbox_config,
            config.pool_dir.clone(),
            config.start_id,
            config.id_count,
        )))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = (build_dir, input_paths, required_system_features, network);
        // Requested but unavailable: refusing beats quietly running open.
        Err(SandboxError::Unsupported)
    }
}
