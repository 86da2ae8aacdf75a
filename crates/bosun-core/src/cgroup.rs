//! Cgroup v2 state and per-child placement
//!
//! At startup the supervisor resolves its own group from
//! `/proc/self/cgroup`, opens it under `/sys/fs/cgroup` and enables the
//! advertised controllers for its subtree.  Children are placed into
//! `<root>/<name>[/<session>]` leaf groups with per-controller
//! attribute writes and optional xattrs.

use crate::{Result, SpawnError};
use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Process-wide cgroup state, read-only after startup.
#[derive(Debug)]
pub struct CgroupState {
    /// The supervisor's own group, e.g. `/system.slice/bosun.service`.
    group_path: String,
    /// Directory descriptor for `group_path` under `/sys/fs/cgroup`.
    group_fd: OwnedFd,
    /// Whether the kernel offers `cgroup.kill` (atomic group kill).
    cgroup_kill: bool,
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        SpawnError::Cgroup(format!("invalid path {}", path.display()))
    })
}

fn open_dir_at(dir: Option<BorrowedFd<'_>>, path: &Path) -> std::io::Result<OwnedFd> {
    let path_c = path_to_cstring(path)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    let dirfd = dir.map_or(libc::AT_FDCWD, |fd| fd.as_raw_fd());

    // SAFETY: openat with a valid NUL-terminated path
    let fd = unsafe {
        libc::openat(
            dirfd,
            path_c.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }

    // SAFETY: openat just returned this descriptor
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn mkdir_at(dir: BorrowedFd<'_>, name: &str, mode: u32) -> std::io::Result<()> {
    let name_c = CString::new(name)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;

    // SAFETY: mkdirat with a valid NUL-terminated name
    let ret = unsafe { libc::mkdirat(dir.as_raw_fd(), name_c.as_ptr(), mode) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::AlreadyExists {
            return Err(err);
        }
    }
    Ok(())
}

fn write_file_at(dir: BorrowedFd<'_>, path: &str, data: &str) -> std::io::Result<()> {
    let path_c = CString::new(path)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;

    // SAFETY: openat with a valid NUL-terminated path
    let fd = unsafe {
        libc::openat(
            dir.as_raw_fd(),
            path_c.as_ptr(),
            libc::O_WRONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: openat just returned this descriptor
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let n = nix::unistd::write(&fd, data.as_bytes())?;
    if n != data.len() {
        return Err(std::io::Error::from(std::io::ErrorKind::WriteZero));
    }
    Ok(())
}

fn read_file_at(dir: BorrowedFd<'_>, path: &str) -> std::io::Result<String> {
    let path_c = CString::new(path)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;

    // SAFETY: openat with a valid NUL-terminated path
    let fd = unsafe {
        libc::openat(
            dir.as_raw_fd(),
            path_c.as_ptr(),
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: openat just returned this descriptor
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut buf = [0u8; 4096];
    let n = nix::unistd::read(fd.as_raw_fd(), &mut buf)?;
    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}

fn file_exists_at(dir: BorrowedFd<'_>, path: &str) -> bool {
    let Ok(path_c) = CString::new(path) else {
        return false;
    };
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();

    // SAFETY: fstatat with a valid NUL-terminated path and stat buffer
    unsafe { libc::fstatat(dir.as_raw_fd(), path_c.as_ptr(), st.as_mut_ptr(), 0) == 0 }
}

/// Extract the v2 entry (`0::<path>`) from `/proc/<pid>/cgroup`
/// contents.
fn parse_proc_cgroup(contents: &str) -> Option<&str> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .filter(|path| path.starts_with('/'))
}

/// Assemble the `cgroup.subtree_control` enable line from a
/// `cgroup.controllers` listing.  `cpuset` is skipped: its
/// `cpuset_css_online()` adds about 70ms to every group creation.
fn subtree_control_line(controllers: &str) -> String {
    let mut line = String::new();
    for controller in controllers.split_ascii_whitespace() {
        if controller == "cpuset" {
            continue;
        }
        if !line.is_empty() {
            line.push(' ');
        }
        line.push('+');
        line.push_str(controller);
    }
    line
}

/// A valid group (or session) name is a single non-empty path
/// component.
#[must_use]
pub fn is_valid_group_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && name != "." && name != ".."
}

/// A settable attribute is `<controller>.<key>` where the controller is
/// lowercase letters and underscores (and not `cgroup`), and the key is
/// letters, digits, dots and underscores.
#[must_use]
pub fn is_valid_attribute_name(name: &str) -> bool {
    let Some((controller, key)) = name.split_once('.') else {
        return false;
    };

    if controller == "cgroup" || controller.is_empty() || key.is_empty() {
        return false;
    }

    controller
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b == b'_')
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_')
}

/// Attribute values may not contain path separators.
#[must_use]
pub fn is_valid_attribute_value(value: &str) -> bool {
    !value.contains('/')
}

impl CgroupState {
    /// Resolve the calling process's own v2 group.
    pub fn from_self() -> Result<Self> {
        let contents = std::fs::read_to_string("/proc/self/cgroup")
            .map_err(|e| SpawnError::Cgroup(format!("failed to read /proc/self/cgroup: {e}")))?;

        let group_path = parse_proc_cgroup(&contents)
            .ok_or_else(|| SpawnError::Cgroup("no cgroup2 entry in /proc/self/cgroup".into()))?
            .to_owned();

        Self::from_group_path(group_path)
    }

    /// Open an already-known group path under `/sys/fs/cgroup`.
    pub fn from_group_path(group_path: String) -> Result<Self> {
        let sys_fs_cgroup = open_dir_at(None, Path::new("/sys/fs/cgroup"))
            .map_err(|e| SpawnError::Cgroup(format!("failed to open /sys/fs/cgroup: {e}")))?;

        let relative = group_path.trim_start_matches('/');
        let group_fd = if relative.is_empty() {
            sys_fs_cgroup
        } else {
            open_dir_at(Some(sys_fs_cgroup.as_fd()), Path::new(relative)).map_err(|e| {
                SpawnError::Cgroup(format!("failed to open cgroup {group_path}: {e}"))
            })?
        };

        let cgroup_kill = file_exists_at(group_fd.as_fd(), "cgroup.kill");

        tracing::debug!(group = %group_path, cgroup_kill, "cgroup state resolved");

        Ok(Self {
            group_path,
            group_fd,
            cgroup_kill,
        })
    }

    #[must_use]
    pub fn group_path(&self) -> &str {
        &self.group_path
    }

    #[must_use]
    pub fn has_cgroup_kill(&self) -> bool {
        self.cgroup_kill
    }

    /// Enable all advertised controllers for the subtree.
    ///
    /// The supervisor must first move itself out of the root into a
    /// `_` leaf, otherwise the kernel refuses the
    /// `cgroup.subtree_control` write.  The leaf gets the highest
    /// weights the controllers accept; the spawner matters more than
    /// its children.
    pub fn enable_all_controllers(&self) -> Result<()> {
        let group = self.group_fd.as_fd();

        mkdir_at(group, "_", 0o700)
            .map_err(|e| SpawnError::Cgroup(format!("failed to create leaf cgroup: {e}")))?;
        let leaf = open_dir_at(Some(group), Path::new("_"))
            .map_err(|e| SpawnError::Cgroup(format!("failed to open leaf cgroup: {e}")))?;
        write_file_at(leaf.as_fd(), "cgroup.procs", "0")
            .map_err(|e| SpawnError::Cgroup(format!("failed to join leaf cgroup: {e}")))?;

        let controllers = read_file_at(group, "cgroup.controllers")
            .map_err(|e| SpawnError::Cgroup(format!("failed to read controllers: {e}")))?;

        let line = subtree_control_line(&controllers);
        if !line.is_empty() {
            write_file_at(group, "cgroup.subtree_control", &line).map_err(|e| {
                SpawnError::Cgroup(format!("failed to enable controllers '{line}': {e}"))
            })?;
        }

        for (attr, value) in [
            ("cpu.weight", "10000"),
            ("io.weight", "10000"),
            ("io.bfq.weight", "1000"),
        ] {
            if let Err(e) = write_file_at(leaf.as_fd(), attr, value) {
                tracing::debug!(attr, error = %e, "leaf weight not applied");
            }
        }

        tracing::info!(group = %self.group_path, controllers = %line, "controllers enabled");
        Ok(())
    }

    /// Create (or reuse) `<root>/<name>[/<session>]`, apply attribute
    /// writes and xattrs, and return the leaf directory together with
    /// its path relative to the root group.
    pub fn realize(&self, options: &crate::prepared::CgroupOptions) -> Result<(OwnedFd, String)> {
        let group = self.group_fd.as_fd();

        mkdir_at(group, &options.name, 0o755)
            .map_err(|e| SpawnError::Cgroup(format!("failed to create '{}': {e}", options.name)))?;

        let mut rel_path = options.name.clone();
        let named = open_dir_at(Some(group), Path::new(&options.name))
            .map_err(|e| SpawnError::Cgroup(format!("failed to open '{rel_path}': {e}")))?;

        let leaf = if let Some(session) = &options.session {
            // the session leaf needs the parent's controllers enabled
            let controllers = read_file_at(named.as_fd(), "cgroup.controllers")
                .map_err(|e| SpawnError::Cgroup(format!("failed to read controllers: {e}")))?;
            let line = subtree_control_line(&controllers);
            if !line.is_empty() {
                if let Err(e) = write_file_at(named.as_fd(), "cgroup.subtree_control", &line) {
                    tracing::debug!(group = %rel_path, error = %e, "subtree enable skipped");
                }
            }

            mkdir_at(named.as_fd(), session, 0o755)
                .map_err(|e| SpawnError::Cgroup(format!("failed to create '{session}': {e}")))?;
            rel_path.push('/');
            rel_path.push_str(session);
            open_dir_at(Some(named.as_fd()), Path::new(session))
                .map_err(|e| SpawnError::Cgroup(format!("failed to open '{rel_path}': {e}")))?
        } else {
            named
        };

        for (attr, value) in &options.set {
            write_file_at(leaf.as_fd(), attr, value).map_err(|e| {
                SpawnError::Cgroup(format!("failed to set {attr}={value}: {e}"))
            })?;
        }

        for (name, value) in &options.xattr {
            set_xattr(leaf.as_fd(), name, value)?;
        }

        Ok((leaf, rel_path))
    }

    /// Reopen a previously realized leaf by its path relative to the
    /// root group.
    pub fn open_group(&self, rel_path: &str) -> Result<OwnedFd> {
        open_dir_at(Some(self.group_fd.as_fd()), Path::new(rel_path))
            .map_err(|e| SpawnError::Cgroup(format!("failed to open '{rel_path}': {e}")))
    }

    /// Migrate the calling process into the given leaf.
    pub fn migrate_into(leaf: BorrowedFd<'_>) -> Result<()> {
        write_file_at(leaf, "cgroup.procs", "0")
            .map_err(|e| SpawnError::Cgroup(format!("failed to join cgroup: {e}")))?;
        Ok(())
    }

    /// Atomically kill every process in the group, if the kernel
    /// supports `cgroup.kill`.  Returns false when the caller must fall
    /// back to pidfd signalling.
    pub fn kill_group(&self, rel_path: &str) -> bool {
        if !self.cgroup_kill {
            return false;
        }

        let Ok(leaf) = open_dir_at(Some(self.group_fd.as_fd()), Path::new(rel_path)) else {
            return false;
        };

        match write_file_at(leaf.as_fd(), "cgroup.kill", "1") {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(group = rel_path, error = %e, "cgroup.kill failed");
                false
            }
        }
    }
}

fn set_xattr(dir: BorrowedFd<'_>, name: &str, value: &str) -> Result<()> {
    let name_c = CString::new(name).map_err(|_| SpawnError::MalformedPayload)?;

    // SAFETY: fsetxattr with a valid name and value buffer
    let ret = unsafe {
        libc::fsetxattr(
            dir.as_raw_fd(),
            name_c.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
        )
    };
    if ret != 0 {
        return Err(SpawnError::Cgroup(format!(
            "failed to set xattr {name}: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_cgroup_selects_v2_entry() {
        let contents = "12:pids:/init.scope\n1:name=systemd:/init.scope\n0::/system.slice/bosun.service\n";
        assert_eq!(
            parse_proc_cgroup(contents),
            Some("/system.slice/bosun.service")
        );
    }

    #[test]
    fn proc_cgroup_without_v2_entry() {
        assert_eq!(parse_proc_cgroup("12:pids:/init.scope\n"), None);
        assert_eq!(parse_proc_cgroup(""), None);
    }

    #[test]
    fn subtree_control_skips_cpuset() {
        assert_eq!(
            subtree_control_line("cpuset cpu io memory pids\n"),
            "+cpu +io +memory +pids"
        );
        assert_eq!(subtree_control_line("cpuset\n"), "");
        assert_eq!(subtree_control_line(""), "");
    }

    #[test]
    fn group_name_validation() {
        assert!(is_valid_group_name("web"));
        assert!(is_valid_group_name("batch-2"));
        assert!(!is_valid_group_name(""));
        assert!(!is_valid_group_name("a/b"));
        assert!(!is_valid_group_name("."));
        assert!(!is_valid_group_name(".."));
    }

    #[test]
    fn attribute_name_validation() {
        assert!(is_valid_attribute_name("memory.max"));
        assert!(is_valid_attribute_name("io.bfq.weight"));
        assert!(is_valid_attribute_name("cpu.weight"));
        assert!(!is_valid_attribute_name("cgroup.procs"));
        assert!(!is_valid_attribute_name("memory"));
        assert!(!is_valid_attribute_name("Memory.max"));
        assert!(!is_valid_attribute_name(".max"));
        assert!(!is_valid_attribute_name("memory."));
        assert!(!is_valid_attribute_name("mem ory.max"));
    }

    #[test]
    fn attribute_value_validation() {
        assert!(is_valid_attribute_value("64M"));
        assert!(is_valid_attribute_value("max 100"));
        assert!(!is_valid_attribute_value("../escape"));
    }
}
