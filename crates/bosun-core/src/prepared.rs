//! Typed description of a prepared child process
//!
//! A [`PreparedChild`] is the parameter block built from one EXEC
//! message: exec target, argument and environment vectors, stdio
//! wiring, namespaces, mounts, cgroup placement, resource limits and
//! credentials.  The wire parser in [`crate::protocol`] populates it;
//! the engine in [`crate::spawn`] consumes it.

use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::os::fd::OwnedFd;
use std::path::PathBuf;

/// Upper bound on argv and env entries per request.
pub const MAX_ARGS: usize = 16384;

/// Upper bound on supplementary groups in a UID_GID block.
pub const MAX_GROUPS: usize = 32;

/// What to execute, exactly one per request.
#[derive(Debug)]
pub enum ExecTarget {
    /// `execve` of an absolute path.
    Path(PathBuf),
    /// `fexecve` of a descriptor drawn from the message's fd list.
    Fd(OwnedFd),
    /// An in-process helper entry point.  Only reachable for embedders
    /// that build a [`PreparedChild`] directly; the wire parser rejects
    /// it because a function pointer cannot cross a process boundary.
    Function(fn() -> !),
}

/// One stdio slot of the child.
#[derive(Debug, Default)]
pub enum Stdio {
    /// Keep the supervisor's descriptor.
    #[default]
    Inherit,
    /// A descriptor drawn from the message's fd list.
    Fd(OwnedFd),
    /// Share whatever stdin was set to.
    AliasStdin,
    /// Open the named file for appending (stderr only).
    Path(PathBuf),
}

impl Stdio {
    #[must_use]
    pub fn is_set(&self) -> bool {
        !matches!(self, Self::Inherit)
    }
}

/// Credentials applied to the child.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidGid {
    pub uid: u32,
    pub gid: u32,
    /// Supplementary groups, at most [`MAX_GROUPS`].
    pub groups: Vec<u32>,
}

impl UidGid {
    /// An all-zero block means "no credentials specified"; the server
    /// substitutes its configured defaults.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.uid == 0 && self.gid == 0
    }

    pub fn supplementary_groups(&self) -> impl Iterator<Item = &u32> {
        self.groups.iter()
    }
}

/// One ordered mount directive, applied inside the child's mount
/// namespace in declaration order.
#[derive(Debug)]
pub enum MountDirective {
    Tmpfs {
        target: PathBuf,
        writable: bool,
    },
    /// The source names an instance managed by the tmpfs manager; the
    /// parent resolves it to `source_fd` before forking.  `exec` is
    /// part of the instance cache key.
    NamedTmpfs {
        source: String,
        target: PathBuf,
        writable: bool,
        exec: bool,
        source_fd: Option<OwnedFd>,
    },
    Bind {
        source: PathBuf,
        target: PathBuf,
        writable: bool,
        exec: bool,
        optional: bool,
    },
    BindFile {
        source: PathBuf,
        target: PathBuf,
        optional: bool,
    },
    FdBind {
        source_fd: OwnedFd,
        target: PathBuf,
        writable: bool,
        exec: bool,
        optional: bool,
    },
    FdBindFile {
        source_fd: OwnedFd,
        target: PathBuf,
        optional: bool,
    },
    WriteFile {
        path: PathBuf,
        contents: Vec<u8>,
        optional: bool,
    },
}

/// Mount namespace configuration: the ordered directive list plus the
/// special filesystems applied after it.
#[derive(Debug, Default)]
pub struct MountOptions {
    pub directives: Vec<MountDirective>,

    pub mount_proc: bool,
    pub writable_proc: bool,
    pub mount_dev: bool,
    pub mount_pts: bool,
    pub bind_mount_pts: bool,

    /// Pivot into this directory as the new root.
    pub pivot_root: Option<PathBuf>,
    /// Start from an empty tmpfs as the new root.
    pub mount_root_tmpfs: bool,
    /// Mount a dedicated tmpfs on this path (the sanctioned way to get
    /// a private `/tmp`).
    pub mount_tmp_tmpfs: Option<PathBuf>,

    /// Mode for intermediate mount-point directories.
    pub dir_mode: u32,
}

impl MountOptions {
    /// Whether a mount namespace is needed at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.directives.is_empty()
            || self.mount_proc
            || self.mount_dev
            || self.mount_pts
            || self.bind_mount_pts
            || self.pivot_root.is_some()
            || self.mount_root_tmpfs
            || self.mount_tmp_tmpfs.is_some()
    }
}

/// Namespace configuration: per-kind enable flags or pinned names,
/// mutually exclusive per kind.
#[derive(Debug, Default)]
pub struct NamespaceOptions {
    pub enable_user: bool,
    pub enable_pid: bool,
    pub enable_cgroup: bool,
    pub enable_network: bool,
    pub enable_ipc: bool,

    /// Join the pinned PID namespace `/run/pidns/<name>`.
    pub pid_namespace: Option<String>,
    /// Join the pinned network namespace `/run/netns/<name>`.
    pub network_namespace: Option<String>,

    /// Implies a UTS namespace.
    pub hostname: Option<String>,

    /// Uid visible inside the user namespace (defaults to the outer uid).
    pub mapped_uid: Option<u32>,

    pub mount: MountOptions,
}

impl NamespaceOptions {
    /// The `CLONE_NEW*` set for the clone call.  Pinned namespaces are
    /// entered with `setns` after the fork and do not appear here.
    #[must_use]
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();

        if self.enable_user {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if self.enable_pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.enable_cgroup {
            flags |= CloneFlags::CLONE_NEWCGROUP;
        }
        if self.enable_network {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.enable_ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.mount.is_enabled() {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.hostname.is_some() {
            flags |= CloneFlags::CLONE_NEWUTS;
        }

        flags
    }
}

/// Per-controller cgroup placement for one child.
#[derive(Debug, Default)]
pub struct CgroupOptions {
    /// Group name under the supervisor's cgroup root.
    pub name: String,
    /// Optional per-session subgroup underneath `name`.
    pub session: Option<String>,
    /// `<controller>.<key>` attribute assignments written after the
    /// group is created.
    pub set: Vec<(String, String)>,
    /// Extended attributes applied to the group directory.
    pub xattr: Vec<(String, String)>,
}

/// Resource limits indexed by `RLIMIT_*` resource id.
#[derive(Debug, Default)]
pub struct ResourceLimits {
    values: Vec<(u8, libc::rlimit)>,
}

impl ResourceLimits {
    pub fn set(&mut self, resource: u8, limit: libc::rlimit) {
        self.values.push((resource, limit));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u8, libc::rlimit)> {
        self.values.iter()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The full parameter block for one spawn request.
#[derive(Debug, Default)]
pub struct PreparedChild {
    pub exec: Option<ExecTarget>,
    pub args: Vec<CString>,
    pub env: Vec<CString>,

    pub stdin: Stdio,
    pub stdout: Stdio,
    pub stderr: Stdio,

    /// Socket on which the parent sends the read end of a stderr
    /// capture pipe.
    pub return_stderr: Option<OwnedFd>,
    /// Socket on which the parent sends a duplicate of the child's
    /// pidfd.
    pub return_pidfd: Option<OwnedFd>,
    /// Socket on which the parent sends the child's cgroup directory.
    pub return_cgroup: Option<OwnedFd>,

    pub ns: NamespaceOptions,
    pub cgroup: Option<CgroupOptions>,
    pub uid_gid: UidGid,
    pub rlimits: ResourceLimits,

    pub sched_idle: bool,
    pub ioprio_idle: bool,
    pub forbid_user_ns: bool,
    pub forbid_multicast: bool,
    pub forbid_bind: bool,
    pub cap_sys_resource: bool,
    pub no_new_privs: bool,
    pub tty: bool,

    /// Nice value.
    pub priority: i32,
    pub umask: Option<u16>,
    pub chroot: Option<PathBuf>,
    pub chdir: Option<PathBuf>,
    /// Opaque cookie passed through to the verify hook.
    pub hook_info: Option<String>,
}

impl PreparedChild {
    /// Append an argv entry.
    pub fn append_arg(&mut self, arg: CString) {
        self.args.push(arg);
    }

    /// Append a `NAME=VALUE` environment entry.
    pub fn put_env(&mut self, entry: CString) {
        self.env.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_uid_gid_detected() {
        assert!(UidGid::default().is_empty());
        assert!(!UidGid {
            uid: 1000,
            gid: 0,
            groups: vec![]
        }
        .is_empty());
    }

    #[test]
    fn clone_flags_follow_namespace_options() {
        let mut ns = NamespaceOptions::default();
        assert!(ns.clone_flags().is_empty());

        ns.enable_pid = true;
        ns.enable_network = true;
        let flags = ns.clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn hostname_implies_uts_namespace() {
        let ns = NamespaceOptions {
            hostname: Some("sandbox".into()),
            ..NamespaceOptions::default()
        };
        assert!(ns.clone_flags().contains(CloneFlags::CLONE_NEWUTS));
    }

    #[test]
    fn mount_directives_imply_mount_namespace() {
        let mut ns = NamespaceOptions::default();
        ns.mount.directives.push(MountDirective::Tmpfs {
            target: "/scratch".into(),
            writable: true,
        });
        assert!(ns.clone_flags().contains(CloneFlags::CLONE_NEWNS));
    }
}
