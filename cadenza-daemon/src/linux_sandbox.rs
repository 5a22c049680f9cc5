// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Linux build isolation via namespaces and a private chroot.
//!
//! Each build gets private user, mount, PID, IPC and UTS namespaces,
//! and (unless the derivation is fixed-output) a private network
//! namespace with only a loopback device. The build user's UID is
//! claimed from the configured range through [`crate::build_users`] and
//! mapped to root inside the user namespace.
//!
//! The builder's filesystem view is assembled from scratch: every entry
//! of [`LinuxSandboxConfig::bind_mounts`] is bind-mounted into a fresh
//! root directory (the store read-only, the build directory writable,
//! selected `/dev` nodes), `/proc` and `/tmp` are mounted fresh, and
//! the process pivots into that tree before exec. Nothing of the host
//! filesystem outside the mount list is reachable.
//!
//! `unshare(CLONE_NEWPID)` only affects subsequently created children,
//! so after unsharing the child forks once more: the intermediate
//! process stays behind as a status relay while the grandchild — PID 1
//! of the new namespace — sets up the chroot and becomes the builder.
//!
//! Unprivileged user namespaces must be enabled on the host
//! (`kernel.unprivileged_userns_clone = 1`); the namespace probe helper
//! reports whether they are.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::build_users::{self, UserLock};
use crate::sandbox::{Sandbox, SandboxChild, SandboxError, SandboxMount};

/// Per-build sandbox parameters.
pub struct LinuxSandboxConfig {
    pub store_dir: PathBuf,
    pub build_dir: PathBuf,
    /// The closure of the build's inputs: exactly these store paths are
    /// visible (read-only) under the store directory inside the sandbox.
    pub input_paths: Vec<PathBuf>,
    /// System features the derivation requires (e.g. `kvm`).
    pub required_system_features: BTreeSet<String>,
    /// Extra host paths made visible read-only.
    pub extra_sandbox_paths: Vec<PathBuf>,
    /// Fixed-output builds keep the host network.
    pub network: bool,
}

impl LinuxSandboxConfig {
    /// The paths visible inside the sandbox; everything else is hidden.
    ///
    /// The store directory itself is *not* in this list: it exists in
    /// the chroot as a plain writable directory (so the builder can
    /// create its outputs there) holding one read-only bind per input
    /// closure path.
    pub fn bind_mounts(&self) -> Vec<SandboxMount> {
        let mut mounts = vec![SandboxMount {
            source: self.build_dir.clone(),
            target: self.build_dir.clone(),
            read_only: false,
            optional: false,
        }];

        for input in &self.input_paths {
            mounts.push(SandboxMount {
                source: input.clone(),
                target: input.clone(),
                read_only: true,
                optional: false,
            });
        }

        for dev in ["null", "zero", "full", "random", "urandom", "ptmx", "pts"] {
            let path = PathBuf::from(format!("/dev/{dev}"));
            mounts.push(SandboxMount {
                source: path.clone(),
                target: path,
                read_only: false,
                optional: true,
            });
        }

        if self.required_system_features.contains("kvm") {
            mounts.push(SandboxMount {
                source: PathBuf::from("/dev/kvm"),
                target: PathBuf::from("/dev/kvm"),
                read_only: false,
                optional: false,
            });
        }

        if self.network {
            // Fixed-output builds resolve names through the host.
            mounts.push(SandboxMount {
                source: PathBuf::from("/etc/resolv.conf"),
                target: PathBuf::from("/etc/resolv.conf"),
                read_only: true,
                optional: true,
            });
        }

        for path in &self.extra_sandbox_paths {
            mounts.push(SandboxMount {
                source: path.clone(),
                target: path.clone(),
                read_only: true,
                optional: false,
            });
        }

        mounts
    }
}

/// Namespace sandbox with a pooled build user.
pub struct LinuxSandbox {
    config: LinuxSandboxConfig,
    pool_dir: PathBuf,
    start_id: u32,
    id_count: u32,
    user_lock: Option<UserLock>,
    /// Staging directory the chroot tree is assembled in.
    chroot_root: Option<PathBuf>,
}

impl LinuxSandbox {
    pub fn new(
        config: LinuxSandboxConfig,
        pool_dir: PathBuf,
        start_id: u32,
        id_count: u32,
    ) -> Self {
        Self {
            config,
            pool_dir,
            start_id,
            id_count,
            user_lock: None,
            chroot_root: None,
        }
    }

    /// The UID claimed for this build, once prepared.
    pub fn build_uid(&self) -> Option<u32> {
        self.user_lock.as_ref().map(UserLock::uid)
    }

    /// Host-side location of the chroot tree, once prepared. Outputs
    /// the builder creates under the store directory materialise here
    /// and are moved into the real store after the build.
    pub fn chroot_root(&self) -> Option<&Path> {
        self.chroot_root.as_deref()
    }
}

impl Sandbox for LinuxSandbox {
    async fn prepare(&mut self) -> Result<(), SandboxError> {
        let pool_dir = self.pool_dir.clone();
        let start_id = self.start_id;
        let id_count = self.id_count;
        let lock = tokio::task::spawn_blocking(move || {
            build_users::acquire_user_lock(&pool_dir, start_id, id_count)
        })
        .await
        .map_err(|e| SandboxError::Setup(format!("join: {e}")))?
        .map_err(|e| SandboxError::Setup(format!("acquire build user: {e}")))?
        .ok_or_else(|| SandboxError::Setup("no free build user slots".into()))?;
        self.user_lock = Some(lock);

        // A sibling of the build directory, so bind-mounting the build
        // directory into the tree does not pull the tree into itself.
        let chroot_root = PathBuf::from(format!("{}.sandbox", self.config.build_dir.display()));
        // The chroot's store directory: writable, so the builder can
        // create its outputs; the inputs get bind-mounted read-only on
        // top of it during spawn.
        let store_stub = chroot_root.join(
            self.config
                .store_dir
                .strip_prefix("/")
                .unwrap_or(&self.config.store_dir),
        );
        tokio::fs::create_dir_all(&store_stub)
            .await
            .map_err(|e| SandboxError::Setup(format!("create chroot root: {e}")))?;
        self.chroot_root = Some(chroot_root);
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    async fn spawn(
        &self,
        builder: &str,
        args: &[&str],
        env: &BTreeMap<String, String>,
        work_dir: &Path,
    ) -> Result<SandboxChild, SandboxError> {
        use std::os::unix::process::CommandExt as _;
        use std::process::Stdio;

        if self.user_lock.is_none() {
            return Err(SandboxError::Spawn("prepare() not called".into()));
        }
        let chroot_root = self
            .chroot_root
            .clone()
            .ok_or_else(|| SandboxError::Spawn("prepare() not called".into()))?;

        let mounts = self.config.bind_mounts();
        let network = self.config.network;
        let work_dir_inside = work_dir.to_owned();

        // The uid/gid maps must name the IDs as seen from the *parent*
        // namespace; capture them before the child unshares.
        let real_uid = nix::unistd::getuid();
        let real_gid = nix::unistd::getgid();

        // Build with std Command for pre_exec, convert to tokio for the
        // async child handle.
        let mut cmd = std::process::Command::new(builder);
        cmd.args(args)
            .current_dir(work_dir)
            .env_clear()
            .envs(env.iter())
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // SAFETY: the closure runs in the post-fork child, which is
        // single-threaded; it only calls fork/unshare/mount/pivot_root
        // and plain file operations before exec, never returning to the
        // runtime.
        unsafe {
            cmd.pre_exec(move || {
                use nix::sched::{CloneFlags, unshare};
                use nix::sys::wait::{WaitStatus, waitpid};
                use nix::unistd::{ForkResult, fork};

                let mut flags = CloneFlags::CLONE_NEWUSER
                    | CloneFlags::CLONE_NEWNS
                    | CloneFlags::CLONE_NEWPID
                    | CloneFlags::CLONE_NEWIPC
                    | CloneFlags::CLONE_NEWUTS;
                if !network {
                    flags |= CloneFlags::CLONE_NEWNET;
                }

                unshare(flags).map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        format!("unshare({flags:?}): {e}"),
                    )
                })?;

                // Map our outside identity to root inside. Must happen
                // before any mount: only a mapped user holds
                // CAP_SYS_ADMIN over the new mount namespace.
                std::fs::write("/proc/self/uid_map", format!("0 {real_uid} 1\n"))?;
                // The kernel requires setgroups to be denied before an
                // unprivileged gid_map write.
                std::fs::write("/proc/self/setgroups", "deny\n")?;
                std::fs::write("/proc/self/gid_map", format!("0 {real_gid} 1\n"))?;

                // The PID namespace only applies to children created
                // after the unshare: fork, let the grandchild (PID 1 in
                // there) become the builder, and stay behind to relay
                // its exit status.
                //
                // SAFETY: fork in a single-threaded child; the relay
                // branch only calls waitpid/close_range/_exit and never
                // returns into the runtime.
                match unsafe { fork() }.map_err(std::io::Error::from)? {
                    ForkResult::Child => {}
                    ForkResult::Parent { child } => {
                        // Drop every inherited descriptor above stderr —
                        // in particular the close-on-exec pipe the
                        // standard library watches to learn that exec
                        // happened; a copy held here would stall the
                        // daemon's spawn until the build finished.
                        unsafe {
                            if libc::close_range(3, libc::c_uint::MAX, 0) != 0 {
                                for fd in 3..=4096 {
                                    libc::close(fd);
                                }
                            }
                        }
                        loop {
                            match waitpid(child, None) {
                                Ok(WaitStatus::Exited(_, code)) => unsafe { libc::_exit(code) },
                                Ok(WaitStatus::Signaled(_, signal, _)) => unsafe {
                                    libc::_exit(128 + signal as i32)
                                },
                                Ok(_) => continue,
                                Err(nix::errno::Errno::EINTR) => continue,
                                Err(_) => unsafe { libc::_exit(1) },
                            }
                        }
                    }
                }

                enter_chroot(&chroot_root, &mounts, &work_dir_inside)?;
                Ok(())
            });
        }

        let mut tokio_cmd = tokio::process::Command::from(cmd);
        let child = tokio_cmd
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("spawn '{builder}' in sandbox: {e}")))?;
        Ok(SandboxChild::from_child(child))
    }

    #[cfg(not(target_os = "linux"))]
    async fn spawn(
        &self,
        _builder: &str,
        _args: &[&str],
        _env: &BTreeMap<String, String>,
        _work_dir: &Path,
    ) -> Result<SandboxChild, SandboxError> {
        Err(SandboxError::Unsupported)
    }

    async fn teardown(&mut self) -> Result<(), SandboxError> {
        self.user_lock.take();
        // The mounts lived only in the build's namespace; what remains
        // on the host side is the stub tree.
        if let Some(chroot_root) = self.chroot_root.take() {
            let _ = tokio::fs::remove_dir_all(&chroot_root).await;
        }
        Ok(())
    }

    fn bind_mount_paths(&self) -> Vec<SandboxMount> {
        self.config.bind_mounts()
    }
}

/// Assemble the chroot tree from the mount list and pivot into it.
///
/// Runs in the grandchild, pre-exec: PID 1 of the new namespaces, root
/// inside the user namespace, on a private mount propagation so nothing
/// here leaks back to the host.
#[cfg(target_os = "linux")]
fn enter_chroot(
    chroot_root: &Path,
    mounts: &[SandboxMount],
    work_dir: &Path,
) -> std::io::Result<()> {
    use nix::mount::{MntFlags, MsFlags, mount, umount2};

    let io_err = |what: &str| {
        let what = what.to_owned();
        move |e: nix::errno::Errno| std::io::Error::other(format!("{what}: {e}"))
    };

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(io_err("remount / private"))?;

    // pivot_root needs the new root to be a mount point.
    mount(
        Some(chroot_root),
        chroot_root,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(io_err("self-bind chroot root"))?;

    for entry in mounts {
        // Follow symlinks: mount(2) resolves them too, and on merged-/usr
        // systems the usual source paths are links.
        let meta = match std::fs::metadata(&entry.source) {
            Ok(meta) => meta,
            Err(_) if entry.optional => continue,
            Err(e) => {
                return Err(std::io::Error::other(format!(
                    "sandbox path '{}' is missing: {e}",
                    entry.source.display()
                )));
            }
        };

        let relative = entry.target.strip_prefix("/").unwrap_or(&entry.target);
        let target = chroot_root.join(relative);
        if meta.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::File::create(&target)?;
        }

        mount(
            Some(&entry.source),
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(io_err(&format!("bind {}", entry.source.display())))?;

        if entry.read_only {
            remount_read_only(&target)?;
        }
    }

    // Fresh /proc (ours: we are PID 1 of the namespace) and /tmp.
    let proc_dir = chroot_root.join("proc");
    std::fs::create_dir_all(&proc_dir)?;
    mount(
        Some("proc"),
        &proc_dir,
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(io_err("mount /proc"))?;

    let tmp_dir = chroot_root.join("tmp");
    std::fs::create_dir_all(&tmp_dir)?;
    mount(
        Some("tmpfs"),
        &tmp_dir,
        Some("tmpfs"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(io_err("mount /tmp"))?;

    // Conventional /dev symlinks next to the bound device nodes.
    let dev_dir = chroot_root.join("dev");
    std::fs::create_dir_all(&dev_dir)?;
    for (link, target) in [
        ("fd", "/proc/self/fd"),
        ("stdin", "/proc/self/fd/0"),
        ("stdout", "/proc/self/fd/1"),
        ("stderr", "/proc/self/fd/2"),
    ] {
        match std::os::unix::fs::symlink(target, dev_dir.join(link)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }

    // Swap roots and drop the old one.
    let old_root = chroot_root.join(".old-root");
    std::fs::create_dir_all(&old_root)?;
    nix::unistd::pivot_root(chroot_root, &old_root).map_err(io_err("pivot_root"))?;
    nix::unistd::chdir("/").map_err(io_err("chdir /"))?;
    umount2("/.old-root", MntFlags::MNT_DETACH).map_err(io_err("unmount old root"))?;
    let _ = std::fs::remove_dir("/.old-root");

    // The pre-pivot working directory is gone with the old root.
    nix::unistd::chdir(work_dir).map_err(io_err("chdir into build dir"))?;
    Ok(())
}

/// Remount a bind read-only, preserving whatever restriction flags the
/// source filesystem already carries (a remount that drops them is
/// rejected by the kernel).
#[cfg(target_os = "linux")]
fn remount_read_only(target: &Path) -> std::io::Result<()> {
    use nix::mount::{MsFlags, mount};

    let base = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY;
    let mut last_err = None;
    for extra in [
        MsFlags::empty(),
        MsFlags::MS_NOSUID,
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOATIME,
    ] {
        match mount(
            None::<&str>,
            target,
            None::<&str>,
            base | extra,
            None::<&str>,
        ) {
            Ok(()) => return Ok(()),
            Err(e) => last_err = Some(e),
        }
    }
    Err(std::io::Error::other(format!(
        "remount '{}' read-only: {}",
        target.display(),
        last_err.expect("at least one attempt was made")
    )))
}
