//! clone3 syscall wrapper with CLONE_PIDFD

use crate::{Result, SpawnError};
use libc::pid_t;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// clone3 clone_args structure (from linux/sched.h)
#[repr(C)]
#[derive(Debug, Default)]
pub struct CloneArgs {
    /// Flags for the new process
    pub flags: u64,
    /// Where the kernel stores the pidfd
    pub pidfd: u64,
    /// Signal to deliver on child termination
    pub exit_signal: u64,
    /// Stack pointer (0 = copy parent stack)
    pub stack: u64,
    /// Stack size (0 if using parent stack)
    pub stack_size: u64,
    /// TLS pointer
    pub tls: u64,
    /// Pointer to set_tid array
    pub set_tid: u64,
    /// Size of set_tid array
    pub set_tid_size: u64,
    /// File descriptor for cgroup (CLONE_INTO_CGROUP)
    pub cgroup: u64,
}

/// CLONE_PIDFD flag (Linux >= 5.2)
pub const CLONE_PIDFD: u64 = 0x1000;

/// Wrapper around the clone3 syscall.
///
/// # Safety
/// This function makes a raw syscall and forks the process.
pub unsafe fn clone3(args: &CloneArgs) -> Result<pid_t> {
    // SAFETY: clone3 syscall with a valid clone_args block
    let ret = unsafe {
        libc::syscall(
            libc::SYS_clone3,
            args as *const CloneArgs,
            std::mem::size_of::<CloneArgs>(),
        )
    };

    if ret == -1 {
        return Err(SpawnError::Clone(format!(
            "clone3 failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(ret as pid_t)
}

/// Fork a child with the given `CLONE_NEW*` namespace flags and run
/// `child_fn` in it.  The closure must not return; it either execs or
/// exits.  The parent receives the child pid and its pidfd.
pub fn clone_child(
    namespace_flags: u64,
    child_fn: impl FnOnce() -> std::convert::Infallible,
) -> Result<(pid_t, OwnedFd)> {
    let mut pidfd: RawFd = -1;

    // exit_signal stays 0: these children report termination through
    // their pidfd only, so a waitpid(-1) zombie sweep elsewhere in the
    // process cannot steal their exit status
    let args = CloneArgs {
        flags: namespace_flags | CLONE_PIDFD,
        pidfd: std::ptr::addr_of_mut!(pidfd) as u64,
        ..Default::default()
    };

    // SAFETY: forking with clone3; the child never returns from
    // child_fn
    let pid = unsafe { clone3(&args)? };

    if pid == 0 {
        // Child process
        let _ = child_fn();
        // SAFETY: unreachable, but never fall through into the parent
        unsafe { libc::_exit(0xff) };
    }

    // SAFETY: the kernel stored a fresh pidfd for us
    let pidfd = unsafe { OwnedFd::from_raw_fd(pidfd) };

    Ok((pid, pidfd))
}

/// Send a signal through a pidfd, race-free against pid reuse.
pub fn pidfd_send_signal(pidfd: RawFd, signo: i32) -> Result<()> {
    // SAFETY: pidfd_send_signal with a null siginfo and no flags
    let ret = unsafe {
        libc::syscall(
            libc::SYS_pidfd_send_signal,
            pidfd,
            signo,
            std::ptr::null::<libc::siginfo_t>(),
            0,
        )
    };

    if ret == -1 {
        return Err(SpawnError::Execution(format!(
            "pidfd_send_signal failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}
