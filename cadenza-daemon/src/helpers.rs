// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! The libexec helper calling convention.
//!
//! Privileged or fork-sensitive actions run in tiny exec'd helper
//! processes with a fixed contract:
//!
//! - `argv[1]` is the file-descriptor number of a one-way error pipe.
//!   Any bytes written there before exit are a fatal message regardless
//!   of exit code; a single `\n` signals a successful handshake.
//! - Remaining arguments are positional; extra ones are allowed, missing
//!   ones exit 254.
//! - Exit codes: 0 success, 252 self-reported fatal, 253/254 argv
//!   protocol errors; anything else belongs to the helper.
//!
//! The individual helpers are merged into one multi-call binary
//! (`cadenza-libexec <helper> <errfd> args…`); this module carries both
//! the parent-side spawn logic and the helper implementations it
//! dispatches to.

use std::io::Read as _;
use std::os::fd::{AsRawFd as _, OwnedFd};
use std::path::Path;
use std::process::Stdio;

use tracing::debug;

/// Exit code for a helper-reported fatal error.
pub const EXIT_FATAL: i32 = 252;
/// Exit code for an unparsable error-pipe fd argument.
pub const EXIT_BAD_FD: i32 = 253;
/// Exit code for missing positional arguments.
pub const EXIT_BAD_ARGV: i32 = 254;

#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    #[error("failed to spawn helper '{0}': {1}")]
    Spawn(String, std::io::Error),
    #[error("helper '{helper}' failed: {message}")]
    Failed { helper: String, message: String },
    #[error("helper '{0}' violated the argv protocol (exit {1})")]
    Protocol(String, i32),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a completed helper.
#[derive(Debug)]
pub struct HelperOutput {
    pub stdout: Vec<u8>,
}

/// Spawn `cadenza-libexec <helper> <errfd> <args…>` and interpret the
/// error-pipe protocol.
pub async fn run_helper(
    libexec: &Path,
    helper: &str,
    args: &[&str],
) -> Result<HelperOutput, HelperError> {
    let (read_fd, write_fd) = nix::unistd::pipe().map_err(std::io::Error::from)?;

    let child = spawn_with_err_fd(libexec, helper, args, write_fd)?;
    // The parent's copy must close so EOF arrives when the helper exits.
    // (`spawn_with_err_fd` consumed it.)

    let helper_name = helper.to_owned();
    let err_reader = tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::from(read_fd);
        let mut message = Vec::new();
        let _ = file.read_to_end(&mut message);
        message
    });

    let output = child.wait_with_output().await?;
    let err_bytes = err_reader.await.map_err(std::io::Error::other)?;

    // Strip the success handshake; anything left is a fatal message.
    let message: &[u8] = match err_bytes.split_first() {
        Some((b'\n', rest)) => rest,
        _ => &err_bytes,
    };
    if !message.is_empty() {
        return Err(HelperError::Failed {
            helper: helper_name,
            message: String::from_utf8_lossy(message).into_owned(),
        });
    }

    match output.status.code() {
        Some(0) => Ok(HelperOutput {
            stdout: output.stdout,
        }),
        Some(code @ (EXIT_BAD_FD | EXIT_BAD_ARGV)) => {
            Err(HelperError::Protocol(helper_name, code))
        }
        Some(EXIT_FATAL) => Err(HelperError::Failed {
            helper: helper_name,
            message: "helper died without a message".to_owned(),
        }),
        Some(code) => Err(HelperError::Failed {
            helper: helper_name,
            message: format!("exit code {code}"),
        }),
        None => Err(HelperError::Failed {
            helper: helper_name,
            message: "killed by signal".to_owned(),
        }),
    }
}

fn spawn_with_err_fd(
    libexec: &Path,
    helper: &str,
    args: &[&str],
    write_fd: OwnedFd,
) -> Result<tokio::process::Child, HelperError> {
    // `pipe()` fds are not close-on-exec, so the raw number stays valid
    // in the child; the OwnedFd is dropped (closing the parent copy)
    // right after spawn.
    let fd_arg = write_fd.as_raw_fd().to_string();
    let mut cmd = tokio::process::Command::new(libexec);
    cmd.arg(helper)
        .arg(&fd_arg)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    let child = cmd
        .spawn()
        .map_err(|e| HelperError::Spawn(helper.to_owned(), e))?;
    drop(write_fd);
    debug!(helper, "spawned libexec helper");
    Ok(child)
}

/// Which namespace features the probe helper found usable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NamespaceSupport {
    pub user: bool,
    pub mount_pid: bool,
}

/// Run the namespace probe and parse its stdout tokens.
pub async fn check_namespace_support(libexec: &Path) -> NamespaceSupport {
    match run_helper(libexec, "check-namespace-support", &[]).await {
        Ok(output) => {
            let text = String::from_utf8_lossy(&output.stdout);
            NamespaceSupport {
                user: text.split_whitespace().any(|t| t == "user"),
                mount_pid: text.split_whitespace().any(|t| t == "mount-pid"),
            }
        }
        Err(_) => NamespaceSupport::default(),
    }
}

/// Helper implementations, dispatched from the multi-call binary.
pub mod implementations {
    use std::io::Write as _;
    use std::os::fd::{FromRawFd as _, RawFd};

    use super::{EXIT_BAD_ARGV, EXIT_BAD_FD, EXIT_FATAL};

    /// Parse the error-pipe fd and run `body`; on `Err` the message goes
    /// down the pipe and the process exits 252.
    ///
    /// Never returns.
    pub fn helper_main(
        min_args: usize,
        run: impl FnOnce(&[String], &mut dyn FnMut(&str)) -> Result<(), String>,
    ) -> ! {
        let argv: Vec<String> = std::env::args().collect();
        // argv = [program, helper-name, errfd, args...]
        if argv.len() < min_args + 3 {
            std::process::exit(EXIT_BAD_ARGV);
        }
        let Ok(err_fd) = argv[2].parse::<RawFd>() else {
            std::process::exit(EXIT_BAD_FD);
        };
        // The fd was inherited from the parent for exactly this purpose.
        #[allow(unsafe_code)]
        let mut err_pipe = unsafe { std::fs::File::from_raw_fd(err_fd) };

        // Successful handshake.
        let _ = err_pipe.write_all(b"\n");

        let mut emit = |line: &str| {
            println!("{line}");
        };
        match run(&argv[3..], &mut emit) {
            Ok(()) => std::process::exit(0),
            Err(message) => {
                let _ = err_pipe.write_all(message.as_bytes());
                std::process::exit(EXIT_FATAL);
            }
        }
    }

    /// `kill-user <uid>`: become `uid`, then kill everything that user
    /// owns until nothing is left.
    pub fn kill_user(args: &[String]) -> Result<(), String> {
        let uid: u32 = args[0].parse().map_err(|_| "invalid uid".to_owned())?;
        nix::unistd::setuid(nix::unistd::Uid::from_raw(uid))
            .map_err(|e| format!("setuid({uid}): {e}"))?;
        loop {
            match nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(-1),
                nix::sys::signal::Signal::SIGKILL,
            ) {
                Ok(()) => continue,
                Err(nix::errno::Errno::ESRCH) | Err(nix::errno::Errno::EPERM) => break,
                Err(e) => return Err(format!("kill(-1): {e}")),
            }
        }
        Ok(())
    }

    /// `run-build-hook <prog> <args…>`: detach and exec the hook.
    pub fn run_build_hook(args: &[String]) -> Result<(), String> {
        use std::os::unix::process::CommandExt as _;
        std::env::set_current_dir("/").map_err(|e| format!("chdir /: {e}"))?;
        nix::unistd::setsid().map_err(|e| format!("setsid: {e}"))?;
        let err = std::process::Command::new(&args[0])
            .args(&args[1..])
            .stdin(std::process::Stdio::null())
            .exec();
        Err(format!("exec {}: {err}", args[0]))
    }

    /// `run-diff-hook <uid> <gid> <prog> <args…>`: drop privileges, exec.
    pub fn run_diff_hook(args: &[String]) -> Result<(), String> {
        use std::os::unix::process::CommandExt as _;
        let uid: u32 = args[0].parse().map_err(|_| "invalid uid".to_owned())?;
        let gid: u32 = args[1].parse().map_err(|_| "invalid gid".to_owned())?;
        nix::unistd::setgid(nix::unistd::Gid::from_raw(gid))
            .map_err(|e| format!("setgid({gid}): {e}"))?;
        nix::unistd::setuid(nix::unistd::Uid::from_raw(uid))
            .map_err(|e| format!("setuid({uid}): {e}"))?;
        let err = std::process::Command::new(&args[2]).args(&args[3..]).exec();
        Err(format!("exec {}: {err}", args[2]))
    }

    /// `unix-bind-connect <fd> bind|connect <dir> <name>`: operate on an
    /// `AF_UNIX` socket after `chdir(dir)`, defeating `sun_path` length
    /// limits for long store paths.
    pub fn unix_bind_connect(args: &[String]) -> Result<(), String> {
        use nix::sys::socket::{UnixAddr, bind, connect};
        use std::os::fd::{AsRawFd as _, BorrowedFd, RawFd};

        let fd: RawFd = args[0].parse().map_err(|_| "invalid fd".to_owned())?;
        let mode = args[1].as_str();
        let dir = &args[2];
        let name = &args[3];

        std::env::set_current_dir(dir).map_err(|e| format!("chdir {dir}: {e}"))?;
        let addr = UnixAddr::new(name.as_str()).map_err(|e| format!("socket address: {e}"))?;
        // The socket fd was inherited from the parent for this call.
        #[allow(unsafe_code)]
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        match mode {
            "bind" => bind(fd.as_raw_fd(), &addr).map_err(|e| format!("bind {name}: {e}")),
            "connect" => {
                connect(fd.as_raw_fd(), &addr).map_err(|e| format!("connect {name}: {e}"))
            }
            other => Err(format!("unknown mode '{other}'")),
        }
    }

    /// `check-namespace-support`: probe which sandbox namespaces are
    /// usable; emits `user` and `mount-pid` tokens on stdout.
    pub fn check_namespace_support(
        _args: &[String],
        emit: &mut dyn FnMut(&str),
    ) -> Result<(), String> {
        let have = |ns: &str| std::path::Path::new(&format!("/proc/self/ns/{ns}")).exists();

        let max_user_ns = std::fs::read_to_string("/proc/sys/user/max_user_namespaces")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);
        if have("user") && max_user_ns > 0 {
            emit("user");
        }
        if have("mnt") && have("pid") {
            emit("mount-pid");
        }
        Ok(())
    }
}
