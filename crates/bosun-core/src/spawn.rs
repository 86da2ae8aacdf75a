//! The spawn engine
//!
//! Converts a [`PreparedChild`] into a running process.  The parent
//! resolves deferred resources (named tmpfs instances, the cgroup
//! leaf, the stderr capture pipe), verifies credentials and forks with
//! `clone3(CLONE_PIDFD)`.  The child then runs a strict sequence:
//! pinned namespaces, cgroup migration, user namespace handshake,
//! mounts, hostname, rlimits, scheduler, credentials, chroot/chdir,
//! stdio plumbing, seccomp, no_new_privs, capability drop, exec.
//! Any failure aborts the child with exit code 0xff, which the parent
//! surfaces as a raw wait status of 0xff00.

use crate::cgroup::CgroupState;
use crate::config::{SpawnConfig, VerifyHook};
use crate::isolation::seccomp::SeccompOptions;
use crate::isolation::{capabilities, clone3, mounts, namespace, rlimits};
use crate::prepared::{ExecTarget, MountDirective, PreparedChild, Stdio};
use crate::tmpfs::{TmpfsLease, TmpfsManager};
use crate::{Result, SpawnError};
use nix::errno::Errno;
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use nix::unistd::{Gid, Uid};
use std::convert::Infallible;
use std::ffi::CString;
use std::io::IoSlice;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

/// A successfully forked child, as seen by the parent.
#[derive(Debug)]
pub struct SpawnedChild {
    pub pid: libc::pid_t,
    pub pidfd: OwnedFd,
    /// Cgroup leaf relative to the supervisor's root group, if the
    /// request asked for placement.
    pub cgroup_path: Option<String>,
    /// Pins on every tmpfs instance the child depends on.
    pub leases: Vec<TmpfsLease>,
}

struct ChildSetup {
    prepared: PreparedChild,
    cgroup_leaf: Option<OwnedFd>,
    userns_sync: Option<OwnedFd>,
}

/// Resolve every `NAMED_TMPFS` directive to a mount fd, collecting the
/// leases that keep the instances alive until the child exits.
fn prepare_named_tmpfs(
    prepared: &mut PreparedChild,
    tmpfs: Option<&mut TmpfsManager>,
) -> Result<Vec<TmpfsLease>> {
    let mut leases = Vec::new();

    let needs_tmpfs = prepared
        .ns
        .mount
        .directives
        .iter()
        .any(|d| matches!(d, MountDirective::NamedTmpfs { source_fd: None, .. }));
    if !needs_tmpfs {
        return Ok(leases);
    }

    let Some(manager) = tmpfs else {
        return Err(SpawnError::Tmpfs(
            "named tmpfs requested but the manager is disabled".into(),
        ));
    };

    for directive in &mut prepared.ns.mount.directives {
        if let MountDirective::NamedTmpfs {
            source,
            exec,
            source_fd: source_fd @ None,
            ..
        } = directive
        {
            let (fd, lease) = manager.make_tmpfs(source, *exec)?;
            *source_fd = Some(fd);
            leases.push(lease);
        }
    }

    Ok(leases)
}

/// Substitute default credentials and enforce the authorization
/// policy.
fn verify_credentials(
    prepared: &mut PreparedChild,
    config: &SpawnConfig,
    hook: Option<&dyn VerifyHook>,
) -> Result<()> {
    if !prepared.uid_gid.is_empty() {
        if !hook.is_some_and(|h| h.verify(prepared)) {
            config.verify_uid_gid(&prepared.uid_gid)?;
        }
        return Ok(());
    }

    if config.default_uid_gid.is_empty() {
        return Err(SpawnError::AuthorizationDenied(
            "no uid/gid specified".into(),
        ));
    }

    prepared.uid_gid = config.default_uid_gid.clone();
    Ok(())
}

/// `inside outside count` line for `/proc/<pid>/uid_map`.
fn id_map_line(inside: u32, outside: u32) -> String {
    format!("{inside} {outside} 1\n")
}

fn write_id_maps(pid: libc::pid_t, uid: u32, gid: u32, mapped_uid: u32) -> Result<()> {
    let proc_dir = format!("/proc/{pid}");

    std::fs::write(format!("{proc_dir}/setgroups"), "deny\n")
        .map_err(|e| SpawnError::Namespace(format!("failed to deny setgroups: {e}")))?;
    std::fs::write(format!("{proc_dir}/uid_map"), id_map_line(mapped_uid, uid))
        .map_err(|e| SpawnError::Namespace(format!("failed to write uid_map: {e}")))?;
    std::fs::write(format!("{proc_dir}/gid_map"), id_map_line(gid, gid))
        .map_err(|e| SpawnError::Namespace(format!("failed to write gid_map: {e}")))?;

    Ok(())
}

/// Send one descriptor over a stream/seqpacket unix socket.
fn send_fd(socket: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> Result<()> {
    let iov = [IoSlice::new(&[0u8])];
    let fds = [fd.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];

    sendmsg::<UnixAddr>(
        socket.as_raw_fd(),
        &iov,
        &cmsg,
        MsgFlags::MSG_NOSIGNAL,
        None,
    )?;
    Ok(())
}

/// Fork and isolate one child.
///
/// `prepared` is consumed: every descriptor it carries is either
/// installed into the child or closed in the parent once the clone has
/// happened.
pub fn spawn_child(
    mut prepared: PreparedChild,
    config: &SpawnConfig,
    hook: Option<&dyn VerifyHook>,
    cgroup_state: &CgroupState,
    tmpfs: Option<&mut TmpfsManager>,
) -> Result<SpawnedChild> {
    verify_credentials(&mut prepared, config, hook)?;

    let leases = prepare_named_tmpfs(&mut prepared, tmpfs)?;

    // capture pipe: RETURN_STDERR is the sole gate
    let return_stderr = prepared.return_stderr.take();
    let capture_read = if return_stderr.is_some() && !prepared.stderr.is_set() {
        let (read, write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?;
        prepared.stderr = Stdio::Fd(write);
        Some(read)
    } else {
        None
    };

    let cgroup = match &prepared.cgroup {
        Some(options) => {
            let (leaf, rel_path) = cgroup_state.realize(options)?;
            Some((leaf, rel_path))
        }
        None => None,
    };
    let (cgroup_leaf, cgroup_path) = match cgroup {
        Some((leaf, path)) => (Some(leaf), Some(path)),
        None => (None, None),
    };

    let user_ns = prepared.ns.enable_user;
    let uid = prepared.uid_gid.uid;
    let gid = prepared.uid_gid.gid;
    let mapped_uid = prepared.ns.mapped_uid.unwrap_or(uid);

    let (sync_read, sync_write) = if user_ns {
        let (read, write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?;
        (Some(read), Some(write))
    } else {
        (None, None)
    };

    let return_pidfd = prepared.return_pidfd.take();
    let return_cgroup = prepared.return_cgroup.take();

    let clone_flags = prepared.ns.clone_flags().bits() as u64;

    let setup = ChildSetup {
        prepared,
        cgroup_leaf,
        userns_sync: sync_read,
    };

    let (pid, pidfd) = clone3::clone_child(clone_flags, move || child_main(setup))?;

    tracing::debug!(pid, "child forked");

    if user_ns {
        if let Err(e) = write_id_maps(pid, uid, gid, mapped_uid) {
            // the child is blocked on the handshake and unusable
            let _ = clone3::pidfd_send_signal(pidfd.as_raw_fd(), libc::SIGKILL);
            return Err(e);
        }
        if let Some(sync) = &sync_write {
            nix::unistd::write(sync, b"x")?;
        }
    }
    drop(sync_write);

    if let (Some(socket), Some(read)) = (&return_stderr, &capture_read) {
        send_fd(socket.as_fd(), read.as_fd())?;
    }
    drop(capture_read);

    if let Some(socket) = &return_pidfd {
        send_fd(socket.as_fd(), pidfd.as_fd())?;
    }

    if let (Some(socket), Some(path)) = (&return_cgroup, &cgroup_path) {
        match cgroup_state.open_group(path) {
            Ok(leaf) => send_fd(socket.as_fd(), leaf.as_fd())?,
            Err(e) => tracing::warn!(group = %path, error = %e, "cgroup fd not returned"),
        }
    }

    Ok(SpawnedChild {
        pid,
        pidfd,
        cgroup_path,
        leases,
    })
}

fn child_main(setup: ChildSetup) -> Infallible {
    match run_child(setup) {
        Ok(never) => never,
        Err(e) => {
            let message = format!("{e}\n");
            // SAFETY: plain write to stderr; the buffer outlives the call
            unsafe {
                libc::write(
                    libc::STDERR_FILENO,
                    message.as_ptr().cast(),
                    message.len(),
                );
                libc::_exit(0xff)
            }
        }
    }
}

/// The child-side sequence.  Order matters: cgroup migration before
/// credentials, mounts after the user namespace handshake, seccomp
/// after mounts, capability reduction last.
fn run_child(setup: ChildSetup) -> Result<Infallible> {
    let ChildSetup {
        prepared: p,
        cgroup_leaf,
        userns_sync,
    } = setup;

    namespace::enter_pinned(&p.ns)?;

    if let Some(leaf) = &cgroup_leaf {
        CgroupState::migrate_into(leaf.as_fd())?;
    }
    drop(cgroup_leaf);

    let uid = p.uid_gid.uid;
    let gid = p.uid_gid.gid;

    if let Some(sync) = userns_sync {
        let mut byte = [0u8; 1];
        let n = nix::unistd::read(sync.as_raw_fd(), &mut byte)?;
        if n != 1 {
            return Err(SpawnError::Namespace(
                "user namespace handshake aborted".into(),
            ));
        }

        let mapped_uid = p.ns.mapped_uid.unwrap_or(uid);
        nix::unistd::setgid(Gid::from_raw(gid))?;
        nix::unistd::setuid(Uid::from_raw(mapped_uid))?;
    }

    if p.ns.mount.is_enabled() {
        mounts::apply(&p.ns.mount)?;
    }

    if let Some(hostname) = &p.ns.hostname {
        nix::unistd::sethostname(hostname)
            .map_err(|e| SpawnError::Namespace(format!("sethostname failed: {e}")))?;
    }

    rlimits::apply(&p.rlimits)?;

    apply_scheduler(&p)?;

    if let Some(umask) = p.umask {
        // SAFETY: umask cannot fail
        unsafe { libc::umask(libc::mode_t::from(umask)) };
    }

    let retained = capabilities::retained_set(p.cap_sys_resource);

    if !p.ns.enable_user {
        capabilities::limit_bounding(&retained)?;

        let groups: Vec<Gid> = p.uid_gid.groups.iter().map(|&g| Gid::from_raw(g)).collect();
        nix::unistd::setgroups(&groups)
            .map_err(|e| SpawnError::Execution(format!("setgroups failed: {e}")))?;
        nix::unistd::setgid(Gid::from_raw(gid))
            .map_err(|e| SpawnError::Execution(format!("setgid failed: {e}")))?;
        nix::unistd::setuid(Uid::from_raw(uid))
            .map_err(|e| SpawnError::Execution(format!("setuid failed: {e}")))?;
    }

    if let Some(chroot) = &p.chroot {
        nix::unistd::chroot(chroot.as_path())
            .map_err(|e| SpawnError::Execution(format!("chroot failed: {e}")))?;
        nix::unistd::chdir("/")
            .map_err(|e| SpawnError::Execution(format!("chdir failed: {e}")))?;
    }

    if let Some(chdir) = &p.chdir {
        nix::unistd::chdir(chdir.as_path())
            .map_err(|e| SpawnError::Execution(format!("chdir failed: {e}")))?;
    }

    setup_stdio(&p)?;

    SeccompOptions {
        forbid_user_ns: p.forbid_user_ns,
        forbid_multicast: p.forbid_multicast,
        forbid_bind: p.forbid_bind,
    }
    .apply()?;

    if p.no_new_privs {
        // SAFETY: plain prctl with immediate arguments
        let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if ret != 0 {
            return Err(SpawnError::Execution(format!(
                "PR_SET_NO_NEW_PRIVS failed: {}",
                std::io::Error::last_os_error()
            )));
        }
    }

    capabilities::finish_drop(&retained)?;

    exec(p)
}

fn apply_scheduler(p: &PreparedChild) -> Result<()> {
    if p.sched_idle {
        let param = libc::sched_param { sched_priority: 0 };
        // SAFETY: sched_setscheduler on ourselves with a zeroed param
        let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_IDLE, &param) };
        if ret != 0 {
            return Err(SpawnError::Execution(format!(
                "SCHED_IDLE failed: {}",
                std::io::Error::last_os_error()
            )));
        }
    }

    if p.ioprio_idle {
        const IOPRIO_WHO_PROCESS: libc::c_int = 1;
        const IOPRIO_CLASS_IDLE: libc::c_int = 3;
        const IOPRIO_CLASS_SHIFT: libc::c_int = 13;

        // SAFETY: ioprio_set on ourselves
        let ret = unsafe {
            libc::syscall(
                libc::SYS_ioprio_set,
                IOPRIO_WHO_PROCESS,
                0,
                IOPRIO_CLASS_IDLE << IOPRIO_CLASS_SHIFT,
            )
        };
        if ret != 0 {
            return Err(SpawnError::Execution(format!(
                "ioprio_set failed: {}",
                std::io::Error::last_os_error()
            )));
        }
    }

    if p.priority != 0 {
        // SAFETY: setpriority on ourselves
        let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, p.priority) };
        if ret != 0 {
            return Err(SpawnError::Execution(format!(
                "setpriority failed: {}",
                std::io::Error::last_os_error()
            )));
        }
    }

    Ok(())
}

fn dup2_checked(fd: &OwnedFd, target: libc::c_int) -> Result<()> {
    // dup2 clears close-on-exec on the new descriptor
    nix::unistd::dup2(fd.as_raw_fd(), target)
        .map_err(|e| SpawnError::Execution(format!("dup2 failed: {e}")))?;
    Ok(())
}

fn dup2_alias(source: libc::c_int, target: libc::c_int) -> Result<()> {
    nix::unistd::dup2(source, target)
        .map_err(|e| SpawnError::Execution(format!("dup2 failed: {e}")))?;
    Ok(())
}

fn setup_stdio(p: &PreparedChild) -> Result<()> {
    if let Stdio::Fd(fd) = &p.stdin {
        dup2_checked(fd, libc::STDIN_FILENO)?;
    }

    match &p.stdout {
        Stdio::Fd(fd) => dup2_checked(fd, libc::STDOUT_FILENO)?,
        Stdio::AliasStdin => dup2_alias(libc::STDIN_FILENO, libc::STDOUT_FILENO)?,
        _ => {}
    }

    match &p.stderr {
        Stdio::Fd(fd) => dup2_checked(fd, libc::STDERR_FILENO)?,
        Stdio::AliasStdin => dup2_alias(libc::STDIN_FILENO, libc::STDERR_FILENO)?,
        Stdio::Path(path) => {
            let path_c = CString::new(path.to_string_lossy().into_owned())
                .map_err(|_| SpawnError::Execution("invalid stderr path".into()))?;

            // SAFETY: open with a valid NUL-terminated path
            let fd = unsafe {
                libc::open(
                    path_c.as_ptr(),
                    libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND,
                    0o666,
                )
            };
            if fd < 0 {
                return Err(SpawnError::Execution(format!(
                    "failed to open {}: {}",
                    path.display(),
                    std::io::Error::last_os_error()
                )));
            }

            if fd != libc::STDERR_FILENO {
                nix::unistd::dup2(fd, libc::STDERR_FILENO)
                    .map_err(|e| SpawnError::Execution(format!("dup2 failed: {e}")))?;
                // SAFETY: closing the temporary descriptor we just duped
                unsafe { libc::close(fd) };
            }
        }
        Stdio::Inherit => {}
    }

    if p.tty {
        nix::unistd::setsid()
            .map_err(|e| SpawnError::Execution(format!("setsid failed: {e}")))?;
        // SAFETY: claim stdin as the controlling terminal
        let ret = unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 0) };
        if ret != 0 {
            return Err(SpawnError::Execution(format!(
                "TIOCSCTTY failed: {}",
                std::io::Error::last_os_error()
            )));
        }
    }

    Ok(())
}

fn exec(mut p: PreparedChild) -> Result<Infallible> {
    let target = p.exec.take().ok_or_else(|| {
        SpawnError::Execution("no exec target specified".into())
    })?;

    // argv[0] defaults to the exec target when the request carried no
    // ARG tags, regardless of how the target was given
    if p.args.is_empty() {
        p.args.push(
            CString::new(default_argv0(&target))
                .map_err(|_| SpawnError::Execution("invalid exec path".into()))?,
        );
    }

    match target {
        ExecTarget::Path(path) => {
            let path_c = CString::new(path.to_string_lossy().into_owned())
                .map_err(|_| SpawnError::Execution("invalid exec path".into()))?;

            match nix::unistd::execve(&path_c, &p.args, &p.env) {
                Ok(never) => Ok(never),
                Err(e) => Err(exec_error(e)),
            }
        }

        ExecTarget::Fd(fd) => match nix::unistd::fexecve(fd.as_raw_fd(), &p.args, &p.env) {
            Ok(never) => Ok(never),
            Err(e) => Err(exec_error(e)),
        },

        ExecTarget::Function(f) => f(),
    }
}

fn default_argv0(target: &ExecTarget) -> String {
    match target {
        ExecTarget::Path(path) => path.to_string_lossy().into_owned(),
        _ => "child".to_owned(),
    }
}

fn exec_error(errno: Errno) -> SpawnError {
    SpawnError::Execution(format!("execve: {}", errno.desc()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prepared::UidGid;

    #[test]
    fn id_map_line_format() {
        assert_eq!(id_map_line(0, 1000), "0 1000 1\n");
        assert_eq!(id_map_line(1000, 1000), "1000 1000 1\n");
    }

    #[test]
    fn missing_credentials_fall_back_to_defaults() {
        let config = SpawnConfig {
            default_uid_gid: UidGid {
                uid: 65534,
                gid: 65534,
                groups: vec![],
            },
            ..SpawnConfig::default()
        };

        let mut p = PreparedChild::default();
        verify_credentials(&mut p, &config, None).unwrap();
        assert_eq!(p.uid_gid.uid, 65534);
    }

    #[test]
    fn missing_credentials_without_defaults_are_denied() {
        let config = SpawnConfig::default();
        let mut p = PreparedChild::default();
        assert!(matches!(
            verify_credentials(&mut p, &config, None),
            Err(SpawnError::AuthorizationDenied(_))
        ));
    }

    #[test]
    fn hook_approval_bypasses_allow_lists() {
        struct AcceptAll;
        impl VerifyHook for AcceptAll {
            fn verify(&self, _prepared: &PreparedChild) -> bool {
                true
            }
        }

        let config = SpawnConfig::default();
        let mut p = PreparedChild {
            uid_gid: UidGid {
                uid: 1234,
                gid: 1234,
                groups: vec![],
            },
            ..PreparedChild::default()
        };

        verify_credentials(&mut p, &config, Some(&AcceptAll)).unwrap();
        assert_eq!(p.uid_gid.uid, 1234);
    }

    #[test]
    fn denied_hook_falls_back_to_allow_lists() {
        struct RejectAll;
        impl VerifyHook for RejectAll {
            fn verify(&self, _prepared: &PreparedChild) -> bool {
                false
            }
        }

        let config = SpawnConfig::default();
        let mut p = PreparedChild {
            uid_gid: UidGid {
                uid: 1234,
                gid: 1234,
                groups: vec![],
            },
            ..PreparedChild::default()
        };

        assert!(verify_credentials(&mut p, &config, Some(&RejectAll)).is_err());
    }

    #[test]
    fn exec_error_message_names_the_syscall() {
        let e = exec_error(Errno::ENOENT);
        assert!(e.to_string().contains("execve: No such file or directory"));
    }

    #[test]
    fn argv0_defaults_for_every_target_kind() {
        assert_eq!(
            default_argv0(&ExecTarget::Path("/bin/echo".into())),
            "/bin/echo"
        );

        fn never() -> ! {
            unreachable!()
        }
        assert_eq!(default_argv0(&ExecTarget::Function(never)), "child");
    }
}
