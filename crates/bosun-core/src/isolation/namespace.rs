//! Entering pinned namespaces
//!
//! A pinned namespace is kept alive by a bind mount under
//! `/run/<kind>/<name>` (`ip netns` convention).  The child joins it
//! with `setns` before any other isolation step.

use crate::prepared::NamespaceOptions;
use crate::{Result, SpawnError};
use nix::sched::{setns, CloneFlags};
use std::os::fd::{FromRawFd, OwnedFd};

fn open_pinned(kind: &str, name: &str) -> Result<OwnedFd> {
    let path = format!("/run/{kind}/{name}");
    let path_c = std::ffi::CString::new(path.as_str())
        .map_err(|_| SpawnError::Namespace(format!("invalid namespace name {name:?}")))?;

    // SAFETY: open with a valid NUL-terminated path
    let fd = unsafe { libc::open(path_c.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(SpawnError::Namespace(format!(
            "failed to open {path}: {}",
            std::io::Error::last_os_error()
        )));
    }

    // SAFETY: open just returned this descriptor
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn join_pinned(kind: &str, name: &str, flag: CloneFlags) -> Result<()> {
    let fd = open_pinned(kind, name)?;
    setns(&fd, flag)
        .map_err(|e| SpawnError::Namespace(format!("failed to join {kind} {name:?}: {e}")))?;
    Ok(())
}

/// Join every pinned namespace named in the options.  For a PID
/// namespace, `setns` affects the processes the caller creates from
/// now on, which is exactly what the exec'd program's children need.
pub fn enter_pinned(ns: &NamespaceOptions) -> Result<()> {
    if let Some(name) = &ns.network_namespace {
        join_pinned("netns", name, CloneFlags::CLONE_NEWNET)?;
    }

    if let Some(name) = &ns.pid_namespace {
        join_pinned("pidns", name, CloneFlags::CLONE_NEWPID)?;
    }

    Ok(())
}
