// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! The external build hook.
//!
//! Remote building is delegated to a single hook process. The wire
//! protocol over its stdin/stdout:
//!
//! 1. On startup the daemon sends a framed stream of
//!    `(setting-name, setting-value)` pairs, terminated by a pair with an
//!    empty name. Frames use the store wire format (u64-le length,
//!    bytes, zero padding).
//! 2. For each proposed build the daemon sends one framed string,
//!    `<drv-path> <platform> <wanted-outputs>`.
//! 3. The hook answers a line: `accept`, `decline`, or `postpone`.
//! 4. After `accept` the hook performs the build; its stderr is
//!    forwarded to the build log until the offer completes, signalled by
//!    a final `done` or `failed` line.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tracing::{debug, info, warn};

use cadenza_nar::wire::write_bytes;
use cadenza_store_core::derivation::BasicDerivation;
use cadenza_store_core::store_path::StorePath;

/// The hook's verdict on one offered build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookReply {
    Accept,
    Decline,
    /// Busy now; re-offer later (treated as decline by the scheduler,
    /// which falls back to a local build).
    Postpone,
}

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("failed to start build hook: {0}")]
    Spawn(std::io::Error),
    #[error("build hook protocol error: {0}")]
    Protocol(String),
    #[error("build hook reported failure: {0}")]
    BuildFailed(String),
    #[error("I/O error talking to build hook: {0}")]
    Io(#[from] std::io::Error),
}

/// A running build hook instance.
pub struct HookInstance {
    child: tokio::process::Child,
    stdin: tokio::process::ChildStdin,
    stdout: BufReader<tokio::process::ChildStdout>,
}

impl HookInstance {
    /// Start the hook and send the settings preamble.
    pub async fn start(
        program: &Path,
        settings: &BTreeMap<String, String>,
    ) -> Result<Self, HookError> {
        let mut child = tokio::process::Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(HookError::Spawn)?;

        let mut stdin = child.stdin.take().expect("stdin piped");
        let stdout = BufReader::new(child.stdout.take().expect("stdout piped"));

        for (name, value) in settings {
            write_bytes(&mut stdin, name.as_bytes()).await?;
            write_bytes(&mut stdin, value.as_bytes()).await?;
        }
        // Empty name ends the settings stream.
        write_bytes(&mut stdin, b"").await?;
        write_bytes(&mut stdin, b"").await?;
        stdin.flush().await?;

        debug!(hook = %program.display(), "build hook started");
        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }

    /// Offer one derivation; returns the hook's verdict.
    pub async fn offer(
        &mut self,
        drv_path: &StorePath,
        drv: &BasicDerivation,
        wanted_outputs: &[String],
    ) -> Result<HookReply, HookError> {
        let offer = format!("{drv_path} {} {}", drv.platform, wanted_outputs.join(","));
        write_bytes(&mut self.stdin, offer.as_bytes()).await?;
        self.stdin.flush().await?;

        let mut reply = String::new();
        self.stdout.read_line(&mut reply).await?;
        match reply.trim_end() {
            "accept" => Ok(HookReply::Accept),
            "decline" => Ok(HookReply::Decline),
            "postpone" => Ok(HookReply::Postpone),
            other => Err(HookError::Protocol(format!(
                "expected accept/decline/postpone, got '{other}'"
            ))),
        }
    }

    /// After an accepted offer: forward hook log lines until it reports
    /// the build finished.
    pub async fn run_accepted(
        &mut self,
        log_sink: &std::sync::Arc<std::sync::Mutex<dyn std::io::Write + Send>>,
    ) -> Result<(), HookError> {
        loop {
            let mut line = String::new();
            let n = self.stdout.read_line(&mut line).await?;
            if n == 0 {
                return Err(HookError::Protocol(
                    "hook exited before reporting a result".to_owned(),
                ));
            }
            let line = line.trim_end();
            match line {
                "done" => {
                    info!("build hook finished remote build");
                    return Ok(());
                }
                failed if failed.starts_with("failed") => {
                    return Err(HookError::BuildFailed(
                        failed.strip_prefix("failed").unwrap_or("").trim().to_owned(),
                    ));
                }
                log_line => {
                    use std::io::Write as _;
                    let mut sink = log_sink.lock().expect("log sink poisoned");
                    let _ = writeln!(sink, "{log_line}");
                }
            }
        }
    }

    /// Shut the hook down.
    pub async fn close(mut self) {
        drop(self.stdin);
        if let Err(e) = self.child.wait().await {
            warn!("build hook did not exit cleanly: {e}");
        }
    }
}
