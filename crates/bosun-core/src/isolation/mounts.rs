//! Mount namespace population
//!
//! Applies the ordered mount directive list of a [`MountOptions`]
//! inside the child's fresh mount namespace: root establishment
//! (pivot_root or an empty root tmpfs), bind mounts, tmpfs mounts,
//! written files, then the special filesystems (proc, dev, pts).

use crate::prepared::{MountDirective, MountOptions};
use crate::{Result, SpawnError};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

const DEFAULT_DIR_MODE: u32 = 0o755;

fn mkdir_all(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .map_err(|e| SpawnError::Mount(format!("failed to create {}: {e}", path.display())))
}

/// Make sure the mount target exists: a directory, or for file binds
/// an empty file.
fn prepare_target(target: &Path, is_file: bool, dir_mode: u32) -> Result<()> {
    if is_file {
        if let Some(parent) = target.parent() {
            mkdir_all(parent, dir_mode)?;
        }
        if !target.exists() {
            std::fs::File::create(target).map_err(|e| {
                SpawnError::Mount(format!("failed to create {}: {e}", target.display()))
            })?;
        }
        Ok(())
    } else {
        mkdir_all(target, dir_mode)
    }
}

fn bind_mount(
    source: &Path,
    target: &Path,
    writable: bool,
    exec: bool,
    optional: bool,
    is_file: bool,
    dir_mode: u32,
) -> Result<()> {
    if optional && !source.exists() {
        return Ok(());
    }

    prepare_target(target, is_file, dir_mode)?;

    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| {
        SpawnError::Mount(format!(
            "failed to bind {} to {}: {e}",
            source.display(),
            target.display()
        ))
    })?;

    // access flags only take effect on a remount of the bind
    let mut flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
    if !writable {
        flags |= MsFlags::MS_RDONLY;
    }
    if !exec {
        flags |= MsFlags::MS_NOEXEC;
    }

    mount(None::<&str>, target, None::<&str>, flags, None::<&str>).map_err(|e| {
        SpawnError::Mount(format!("failed to remount {}: {e}", target.display()))
    })
}

fn mount_tmpfs(target: &Path, writable: bool, dir_mode: u32) -> Result<()> {
    mkdir_all(target, dir_mode)?;

    let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
    if !writable {
        flags |= MsFlags::MS_RDONLY;
    }

    mount(
        Some("tmpfs"),
        target,
        Some("tmpfs"),
        flags,
        Some("mode=1777"),
    )
    .map_err(|e| SpawnError::Mount(format!("failed to mount tmpfs at {}: {e}", target.display())))
}

fn write_file(path: &Path, contents: &[u8], optional: bool, dir_mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        mkdir_all(parent, dir_mode)?;
    }

    match std::fs::write(path, contents) {
        Ok(()) => Ok(()),
        Err(_) if optional => Ok(()),
        Err(e) => Err(SpawnError::Mount(format!(
            "failed to write {}: {e}",
            path.display()
        ))),
    }
}

fn proc_fd_path(fd: &OwnedFd) -> PathBuf {
    PathBuf::from(format!("/proc/self/fd/{}", fd.as_raw_fd()))
}

fn pivot_root(new_root: &Path) -> Result<()> {
    let put_old = new_root.join(".pivot_old");
    mkdir_all(&put_old, 0o700)?;

    let new_root_c = std::ffi::CString::new(new_root.to_string_lossy().into_owned())
        .map_err(|_| SpawnError::Mount("invalid pivot_root path".into()))?;
    let put_old_c = std::ffi::CString::new(put_old.to_string_lossy().into_owned())
        .map_err(|_| SpawnError::Mount("invalid put_old path".into()))?;

    // SAFETY: pivot_root syscall with valid NUL-terminated paths
    let ret = unsafe { libc::syscall(libc::SYS_pivot_root, new_root_c.as_ptr(), put_old_c.as_ptr()) };
    if ret != 0 {
        return Err(SpawnError::Mount(format!(
            "pivot_root failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    std::env::set_current_dir("/")
        .map_err(|e| SpawnError::Mount(format!("failed to chdir to new root: {e}")))?;

    umount2("/.pivot_old", MntFlags::MNT_DETACH)
        .map_err(|e| SpawnError::Mount(format!("failed to detach old root: {e}")))?;
    std::fs::remove_dir("/.pivot_old")
        .map_err(|e| SpawnError::Mount(format!("failed to remove put_old: {e}")))?;

    Ok(())
}

/// Start from a completely empty root.
fn mount_root_tmpfs() -> Result<()> {
    let staging = Path::new("/mnt");

    mount(
        Some("tmpfs"),
        staging,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("mode=755"),
    )
    .map_err(|e| SpawnError::Mount(format!("failed to mount root tmpfs: {e}")))?;

    pivot_root(staging)
}

fn mount_proc(writable: bool) -> Result<()> {
    mkdir_all(Path::new("/proc"), DEFAULT_DIR_MODE)?;

    let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV;
    if !writable {
        flags |= MsFlags::MS_RDONLY;
    }

    mount(Some("proc"), "/proc", Some("proc"), flags, None::<&str>)
        .map_err(|e| SpawnError::Mount(format!("failed to mount /proc: {e}")))
}

fn mknod_chr(path: &str, major: u64, minor: u64) -> Result<()> {
    use nix::sys::stat::{mknod, Mode, SFlag};

    mknod(
        path,
        SFlag::S_IFCHR,
        Mode::from_bits_truncate(0o666),
        libc::makedev(major as _, minor as _),
    )
    .map_err(|e| SpawnError::Mount(format!("failed to create {path}: {e}")))
}

/// A minimal /dev: tmpfs with the standard character devices and the
/// /proc/self/fd convenience links.
fn mount_dev() -> Result<()> {
    mkdir_all(Path::new("/dev"), DEFAULT_DIR_MODE)?;

    mount(
        Some("tmpfs"),
        "/dev",
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("mode=755"),
    )
    .map_err(|e| SpawnError::Mount(format!("failed to mount /dev: {e}")))?;

    mknod_chr("/dev/null", 1, 3)?;
    mknod_chr("/dev/zero", 1, 5)?;
    mknod_chr("/dev/full", 1, 7)?;
    mknod_chr("/dev/random", 1, 8)?;
    mknod_chr("/dev/urandom", 1, 9)?;
    mknod_chr("/dev/tty", 5, 0)?;

    for (link, target) in [
        ("/dev/fd", "/proc/self/fd"),
        ("/dev/stdin", "/proc/self/fd/0"),
        ("/dev/stdout", "/proc/self/fd/1"),
        ("/dev/stderr", "/proc/self/fd/2"),
    ] {
        std::os::unix::fs::symlink(target, link)
            .map_err(|e| SpawnError::Mount(format!("failed to symlink {link}: {e}")))?;
    }

    Ok(())
}

/// A private devpts instance.
fn mount_pts() -> Result<()> {
    mkdir_all(Path::new("/dev/pts"), DEFAULT_DIR_MODE)?;

    mount(
        Some("devpts"),
        "/dev/pts",
        Some("devpts"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("newinstance,ptmxmode=0666,mode=0620"),
    )
    .map_err(|e| SpawnError::Mount(format!("failed to mount /dev/pts: {e}")))?;

    match std::os::unix::fs::symlink("pts/ptmx", "/dev/ptmx") {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(SpawnError::Mount(format!("failed to symlink /dev/ptmx: {e}"))),
    }
}

fn open_path(path: &Path) -> Result<OwnedFd> {
    let path_c = std::ffi::CString::new(path.to_string_lossy().into_owned())
        .map_err(|_| SpawnError::Mount(format!("invalid path {}", path.display())))?;

    // SAFETY: open with a valid NUL-terminated path
    let fd = unsafe {
        libc::open(
            path_c.as_ptr(),
            libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(SpawnError::Mount(format!(
            "failed to open {}: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }
    // SAFETY: open just returned this descriptor
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn apply_directive(directive: &MountDirective, dir_mode: u32) -> Result<()> {
    match directive {
        MountDirective::Tmpfs { target, writable } => mount_tmpfs(target, *writable, dir_mode),

        MountDirective::NamedTmpfs {
            source,
            target,
            writable,
            exec,
            source_fd,
        } => {
            let fd = source_fd.as_ref().ok_or_else(|| {
                SpawnError::Tmpfs(format!("tmpfs {source:?} was not resolved"))
            })?;
            bind_mount(&proc_fd_path(fd), target, *writable, *exec, false, false, dir_mode)
        }

        MountDirective::Bind {
            source,
            target,
            writable,
            exec,
            optional,
        } => bind_mount(source, target, *writable, *exec, *optional, false, dir_mode),

        MountDirective::BindFile {
            source,
            target,
            optional,
        } => bind_mount(source, target, false, false, *optional, true, dir_mode),

        MountDirective::FdBind {
            source_fd,
            target,
            writable,
            exec,
            optional,
        } => bind_mount(
            &proc_fd_path(source_fd),
            target,
            *writable,
            *exec,
            *optional,
            false,
            dir_mode,
        ),

        MountDirective::FdBindFile {
            source_fd,
            target,
            optional,
        } => bind_mount(
            &proc_fd_path(source_fd),
            target,
            false,
            false,
            *optional,
            true,
            dir_mode,
        ),

        MountDirective::WriteFile {
            path,
            contents,
            optional,
        } => write_file(path, contents, *optional, dir_mode),
    }
}

/// Apply the whole mount phase inside the child.
pub fn apply(options: &MountOptions) -> Result<()> {
    let dir_mode = if options.dir_mode == 0 {
        DEFAULT_DIR_MODE
    } else {
        options.dir_mode
    };

    // keep mount events from leaking back to the host
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| SpawnError::Mount(format!("failed to make / private: {e}")))?;

    // the host's pts instance must be pinned before the root changes
    let host_pts = if options.bind_mount_pts && !options.mount_pts {
        Some(open_path(Path::new("/dev/pts"))?)
    } else {
        None
    };

    if options.mount_root_tmpfs {
        mount_root_tmpfs()?;
    } else if let Some(new_root) = &options.pivot_root {
        pivot_root(new_root)?;
    }

    for directive in &options.directives {
        apply_directive(directive, dir_mode)?;
    }

    if let Some(tmp) = &options.mount_tmp_tmpfs {
        mount_tmpfs(tmp, true, dir_mode)?;
    }

    if options.mount_proc {
        mount_proc(options.writable_proc)?;
    }

    if options.mount_dev {
        mount_dev()?;
    }

    if options.mount_pts {
        mount_pts()?;
    } else if let Some(pts) = &host_pts {
        bind_mount(
            &proc_fd_path(pts),
            Path::new("/dev/pts"),
            true,
            false,
            false,
            false,
            dir_mode,
        )?;
    }

    Ok(())
}
