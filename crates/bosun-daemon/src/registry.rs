//! Child records, exit demultiplexing and the zombie reaper
//!
//! Each connection owns a map of request id to [`ChildRecord`].  The
//! record's pidfd is registered with the reactor; readability means
//! the child has terminated and `waitid(P_PIDFD)` yields its status.
//! A process-global [`ZombieReaper`] consumes SIGCHLD for legacy
//! children without a pidfd.

use bosun_core::isolation::clone3;
use bosun_core::tmpfs::TmpfsLease;
use bosun_core::CgroupState;
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::os::fd::{AsRawFd, OwnedFd};

/// One running child, owned by the connection that spawned it.
#[derive(Debug)]
pub struct ChildRecord {
    pub id: u32,
    pub name: String,
    pub pidfd: OwnedFd,
    /// Pins on the tmpfs instances the child depends on; dropped with
    /// the record.
    pub leases: Vec<TmpfsLease>,
    /// Cgroup leaf relative to the supervisor's root, if placed.
    pub cgroup_path: Option<String>,
    /// A KILL was already dispatched; later KILLs for this id are
    /// ignored.
    pub killed: bool,
}

impl ChildRecord {
    /// Deliver `signo`.  SIGKILL against a placed child uses
    /// `cgroup.kill` when available, taking the whole group down
    /// atomically; everything else goes through the pidfd.
    pub fn kill(&mut self, cgroup_state: &CgroupState, signo: i32) {
        self.killed = true;

        if signo == libc::SIGKILL {
            if let Some(path) = &self.cgroup_path {
                if cgroup_state.kill_group(path) {
                    tracing::debug!(id = self.id, name = %self.name, group = %path, "cgroup killed");
                    return;
                }
            }
        }

        if let Err(e) = clone3::pidfd_send_signal(self.pidfd.as_raw_fd(), signo) {
            tracing::warn!(id = self.id, name = %self.name, error = %e, "kill failed");
        }
    }
}

/// Rebuild the raw `wait`-family status encoding from a `waitid`
/// siginfo.
fn raw_wait_status(si_code: libc::c_int, si_status: libc::c_int) -> i32 {
    match si_code {
        libc::CLD_EXITED => (si_status & 0xff) << 8,
        libc::CLD_DUMPED => (si_status & 0x7f) | 0x80,
        // killed, trapped, stopped: the low bits carry the signal
        _ => si_status & 0x7f,
    }
}

/// Reap a terminated child through its pidfd and return the raw wait
/// status.
pub fn wait_pidfd(pidfd: &OwnedFd) -> std::io::Result<i32> {
    // SAFETY: an all-zero siginfo_t is a valid value
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };

    // SAFETY: waitid with a valid pidfd and siginfo buffer
    let ret = unsafe {
        libc::waitid(
            libc::P_PIDFD,
            pidfd.as_raw_fd() as libc::id_t,
            &mut info,
            libc::WEXITED,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }

    // SAFETY: si_status is valid for CLD_* codes
    let status = unsafe { info.si_status() };
    Ok(raw_wait_status(info.si_code, status))
}

/// Consumes SIGCHLD and reaps any zombie the pidfd path does not
/// cover.  Children spawned by the engine are cloned with no exit
/// signal, so the `waitpid(-1)` sweep here can never steal their
/// status.
pub struct ZombieReaper {
    signalfd: SignalFd,
}

impl ZombieReaper {
    pub fn new() -> std::io::Result<Self> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        mask.thread_block()?;

        let signalfd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;
        Ok(Self { signalfd })
    }

    #[must_use]
    pub fn fd(&self) -> std::os::fd::RawFd {
        self.signalfd.as_raw_fd()
    }

    /// Drain pending SIGCHLDs and reap until no zombies remain.
    pub fn on_readable(&mut self) {
        while let Ok(Some(_)) = self.signalfd.read_signal() {}

        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    tracing::debug!(?status, "reaped zombie");
                }
                Err(_) => break,
            }
        }
    }

    /// Stop consuming SIGCHLD.
    pub fn disable(self) {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        let _ = mask.thread_unblock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_encoding() {
        assert_eq!(raw_wait_status(libc::CLD_EXITED, 0), 0x0000);
        assert_eq!(raw_wait_status(libc::CLD_EXITED, 1), 0x0100);
        // spawn failure convention: exit code 0xff
        assert_eq!(raw_wait_status(libc::CLD_EXITED, 0xff), 0xff00);
    }

    #[test]
    fn signal_status_encoding() {
        assert_eq!(
            raw_wait_status(libc::CLD_KILLED, libc::SIGTERM),
            libc::SIGTERM
        );
        assert_eq!(
            raw_wait_status(libc::CLD_DUMPED, libc::SIGSEGV),
            libc::SIGSEGV | 0x80
        );
    }
}
