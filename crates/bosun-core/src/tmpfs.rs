//! Named tmpfs instances shared between children
//!
//! The manager owns a parent directory (`/tmp/tmpfs` by default) and a
//! cache of mounted tmpfs filesystems keyed by `(name, exec)`.  A
//! lookup returns a duplicated O_PATH descriptor of the mount point
//! plus a [`TmpfsLease`]; the entry stays mounted while any lease is
//! alive and for an idle grace period afterwards.

use crate::{Result, SpawnError};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// How long an unused instance survives before the expiration sweep
/// unmounts it.
pub const IDLE_THRESHOLD: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TmpfsKey {
    name: String,
    exec: bool,
}

#[derive(Debug)]
struct TmpfsEntry {
    dir: PathBuf,
    mount_fd: OwnedFd,
    refcount: usize,
    last_released: Instant,
}

/// Whether an entry may be unmounted by the sweep.
fn expired(refcount: usize, last_released: Instant, now: Instant, idle: Duration) -> bool {
    refcount == 0 && now.duration_since(last_released) >= idle
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<TmpfsKey, TmpfsEntry>,
}

/// Pins one tmpfs instance.  Dropping the lease decrements the entry's
/// refcount and stamps its release time.
#[derive(Debug)]
pub struct TmpfsLease {
    key: TmpfsKey,
    inner: Weak<RefCell<Inner>>,
}

impl Drop for TmpfsLease {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut inner = inner.borrow_mut();
        if let Some(entry) = inner.entries.get_mut(&self.key) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                entry.last_released = Instant::now();
            }
        }
    }
}

fn dup_cloexec(fd: &OwnedFd) -> std::io::Result<OwnedFd> {
    // SAFETY: F_DUPFD_CLOEXEC on a descriptor we own
    let dup = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 3) };
    if dup < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: fcntl just returned this descriptor
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

fn open_path_dir(path: &Path) -> std::io::Result<OwnedFd> {
    let path_c = {
        use std::os::unix::ffi::OsStrExt;
        std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?
    };

    // SAFETY: open with a valid NUL-terminated path
    let fd = unsafe {
        libc::open(
            path_c.as_ptr(),
            libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: open just returned this descriptor
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Cache of named tmpfs instances.  Single-threaded; the supervisor
/// drives the expiration sweep from its timer.
#[derive(Debug)]
pub struct TmpfsManager {
    root: PathBuf,
    idle_threshold: Duration,
    next_dir: u64,
    inner: Rc<RefCell<Inner>>,
}

impl TmpfsManager {
    /// Create the manager, creating the parent directory with mode
    /// 0100 if it does not exist.  Failure here is fatal at startup.
    pub fn new(root: PathBuf) -> Result<Self> {
        match std::fs::create_dir(&root) {
            Ok(()) => {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o100);
                std::fs::set_permissions(&root, perms).map_err(|e| {
                    SpawnError::Tmpfs(format!("failed to chmod {}: {e}", root.display()))
                })?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(SpawnError::Tmpfs(format!(
                    "failed to create {}: {e}",
                    root.display()
                )));
            }
        }

        Ok(Self {
            root,
            idle_threshold: IDLE_THRESHOLD,
            next_dir: 0,
            inner: Rc::new(RefCell::new(Inner::default())),
        })
    }

    /// Look up (or mount) the instance for `(name, exec)`.  Returns a
    /// duplicated mount-point descriptor and the lease pinning the
    /// entry.
    pub fn make_tmpfs(&mut self, name: &str, exec: bool) -> Result<(OwnedFd, TmpfsLease)> {
        let key = TmpfsKey {
            name: name.to_owned(),
            exec,
        };

        {
            let mut inner = self.inner.borrow_mut();
            if let Some(entry) = inner.entries.get_mut(&key) {
                entry.refcount += 1;
                let fd = dup_cloexec(&entry.mount_fd)
                    .map_err(|e| SpawnError::Tmpfs(format!("failed to dup mount fd: {e}")))?;
                return Ok((
                    fd,
                    TmpfsLease {
                        key,
                        inner: Rc::downgrade(&self.inner),
                    },
                ));
            }
        }

        let dir = self.root.join(format!("{}.{}", self.next_dir, name));
        self.next_dir += 1;

        std::fs::create_dir(&dir)
            .map_err(|e| SpawnError::Tmpfs(format!("failed to create {}: {e}", dir.display())))?;

        let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
        if !exec {
            flags |= MsFlags::MS_NOEXEC;
        }

        mount(
            Some("tmpfs"),
            &dir,
            Some("tmpfs"),
            flags,
            None::<&str>,
        )
        .map_err(|e| SpawnError::Tmpfs(format!("failed to mount tmpfs at {}: {e}", dir.display())))?;

        let mount_fd = open_path_dir(&dir)
            .map_err(|e| SpawnError::Tmpfs(format!("failed to open {}: {e}", dir.display())))?;
        let fd = dup_cloexec(&mount_fd)
            .map_err(|e| SpawnError::Tmpfs(format!("failed to dup mount fd: {e}")))?;

        tracing::debug!(name, exec, dir = %dir.display(), "tmpfs mounted");

        self.inner.borrow_mut().entries.insert(
            key.clone(),
            TmpfsEntry {
                dir,
                mount_fd,
                refcount: 1,
                last_released: Instant::now(),
            },
        );

        Ok((
            fd,
            TmpfsLease {
                key,
                inner: Rc::downgrade(&self.inner),
            },
        ))
    }

    /// Unmount instances that have been idle past the threshold.
    /// Unmounting is best-effort: a busy mount stays cached and is
    /// retried on the next sweep.
    pub fn expire(&mut self) {
        let now = Instant::now();
        let mut inner = self.inner.borrow_mut();

        inner.entries.retain(|key, entry| {
            if !expired(entry.refcount, entry.last_released, now, self.idle_threshold) {
                return true;
            }

            if let Err(e) = umount2(&entry.dir, MntFlags::empty()) {
                tracing::debug!(name = %key.name, error = %e, "tmpfs unmount deferred");
                return true;
            }

            if let Err(e) = std::fs::remove_dir(&entry.dir) {
                tracing::warn!(dir = %entry.dir.display(), error = %e, "failed to remove tmpfs dir");
            }

            tracing::debug!(name = %key.name, exec = key.exec, "tmpfs expired");
            false
        });
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiration_eligibility() {
        let now = Instant::now();
        let old = now - Duration::from_secs(200);
        let fresh = now - Duration::from_secs(10);

        assert!(expired(0, old, now, IDLE_THRESHOLD));
        assert!(!expired(0, fresh, now, IDLE_THRESHOLD));
        assert!(!expired(1, old, now, IDLE_THRESHOLD));
    }

    #[test]
    fn lease_drop_releases_entry() {
        let inner = Rc::new(RefCell::new(Inner::default()));
        let key = TmpfsKey {
            name: "build-cache".into(),
            exec: true,
        };

        let dir = std::env::temp_dir();
        let fd = open_path_dir(&dir).unwrap();
        inner.borrow_mut().entries.insert(
            key.clone(),
            TmpfsEntry {
                dir,
                mount_fd: fd,
                refcount: 2,
                last_released: Instant::now() - Duration::from_secs(1000),
            },
        );

        let lease = TmpfsLease {
            key: key.clone(),
            inner: Rc::downgrade(&inner),
        };
        drop(lease);

        let guard = inner.borrow();
        let entry = guard.entries.get(&key).unwrap();
        assert_eq!(entry.refcount, 1);
        // release time only stamped when the count reaches zero
        assert!(entry.last_released.elapsed() > Duration::from_secs(500));
    }

    #[test]
    fn final_lease_drop_stamps_release_time() {
        let inner = Rc::new(RefCell::new(Inner::default()));
        let key = TmpfsKey {
            name: "scratch".into(),
            exec: false,
        };

        let dir = std::env::temp_dir();
        let fd = open_path_dir(&dir).unwrap();
        inner.borrow_mut().entries.insert(
            key.clone(),
            TmpfsEntry {
                dir,
                mount_fd: fd,
                refcount: 1,
                last_released: Instant::now() - Duration::from_secs(1000),
            },
        );

        drop(TmpfsLease {
            key: key.clone(),
            inner: Rc::downgrade(&inner),
        });

        let guard = inner.borrow();
        let entry = guard.entries.get(&key).unwrap();
        assert_eq!(entry.refcount, 0);
        assert!(entry.last_released.elapsed() < Duration::from_secs(10));
    }
}
