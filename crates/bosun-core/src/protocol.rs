//! Wire protocol for the spawn control socket
//!
//! A message is one datagram: a byte payload plus an ordered list of
//! file descriptors carried as `SCM_RIGHTS` ancillary data.  The first
//! payload byte selects the request or response command; EXEC requests
//! carry a TLV stream after the `(id, name)` header.
//!
//! Integers are native-endian (the socket never leaves the host).
//! Request strings are NUL-terminated; response strings are
//! length-prefixed.

use crate::cgroup;
use crate::prepared::{
    ExecTarget, MountDirective, PreparedChild, Stdio, UidGid, MAX_ARGS, MAX_GROUPS,
};
use crate::{Result, SpawnError};
use std::collections::VecDeque;
use std::ffi::CString;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

/// Largest payload accepted in one datagram.
pub const MAX_PAYLOAD: usize = 8192;

/// Largest number of descriptors accepted in one datagram.
pub const MAX_FDS: usize = 32;

/// Response batches are cut after this many items per datagram.
pub const MAX_BATCH: usize = 64;

/// Request commands (first payload byte, client to server).
pub mod request {
    /// Adopt the single carried fd as an additional connection.
    pub const CONNECT: u8 = 0x01;
    /// Spawn a child; payload is the EXEC TLV stream.
    pub const EXEC: u8 = 0x02;
    /// Signal children; payload is a sequence of `(id, signo)` pairs.
    pub const KILL: u8 = 0x03;
}

/// Response commands (first payload byte, server to client).
pub mod response {
    /// Batch of `(id, error)` items; an empty error means success.
    pub const EXEC_COMPLETE: u8 = 0x01;
    /// Batch of `(id, wait-status)` items.
    pub const EXIT: u8 = 0x02;
}

/// EXEC TLV tags.
pub mod exec {
    pub const EXEC_PATH: u8 = 0x01;
    pub const EXEC_FD: u8 = 0x02;
    pub const ARG: u8 = 0x03;
    pub const SETENV: u8 = 0x04;
    pub const STDIN: u8 = 0x05;
    pub const STDERR_PATH: u8 = 0x06;
    pub const STDOUT: u8 = 0x07;
    pub const STDERR: u8 = 0x08;
    pub const STDOUT_IS_STDIN: u8 = 0x09;
    pub const STDERR_IS_STDIN: u8 = 0x0a;
    pub const RETURN_STDERR: u8 = 0x0b;
    pub const RETURN_PIDFD: u8 = 0x0c;
    pub const RETURN_CGROUP: u8 = 0x0d;
    pub const TTY: u8 = 0x0e;
    pub const UMASK: u8 = 0x0f;

    pub const USER_NS: u8 = 0x10;
    pub const PID_NS: u8 = 0x11;
    pub const CGROUP_NS: u8 = 0x12;
    pub const NETWORK_NS: u8 = 0x13;
    pub const IPC_NS: u8 = 0x14;
    pub const PID_NS_NAME: u8 = 0x15;
    pub const NETWORK_NS_NAME: u8 = 0x16;
    pub const HOSTNAME: u8 = 0x17;
    pub const MAPPED_UID: u8 = 0x18;

    pub const MOUNT_TMPFS: u8 = 0x20;
    pub const MOUNT_NAMED_TMPFS: u8 = 0x21;
    pub const BIND_MOUNT: u8 = 0x22;
    pub const BIND_MOUNT_FILE: u8 = 0x23;
    pub const FD_BIND_MOUNT: u8 = 0x24;
    pub const FD_BIND_MOUNT_FILE: u8 = 0x25;
    pub const WRITE_FILE: u8 = 0x26;
    pub const MOUNT_PROC: u8 = 0x27;
    pub const MOUNT_DEV: u8 = 0x28;
    pub const MOUNT_PTS: u8 = 0x29;
    pub const BIND_MOUNT_PTS: u8 = 0x2a;
    pub const PIVOT_ROOT: u8 = 0x2b;
    pub const MOUNT_ROOT_TMPFS: u8 = 0x2c;
    pub const MOUNT_TMP_TMPFS: u8 = 0x2d;
    pub const DIR_MODE: u8 = 0x2e;

    pub const RLIMIT: u8 = 0x30;
    pub const UID_GID: u8 = 0x31;

    pub const SCHED_IDLE: u8 = 0x38;
    pub const IOPRIO_IDLE: u8 = 0x39;
    pub const FORBID_USER_NS: u8 = 0x3a;
    pub const FORBID_MULTICAST: u8 = 0x3b;
    pub const FORBID_BIND: u8 = 0x3c;
    pub const CAP_SYS_RESOURCE: u8 = 0x3d;
    pub const NO_NEW_PRIVS: u8 = 0x3e;
    pub const PRIORITY: u8 = 0x3f;

    pub const CGROUP: u8 = 0x40;
    pub const CGROUP_SESSION: u8 = 0x41;
    pub const CGROUP_SET: u8 = 0x42;
    pub const CGROUP_XATTR: u8 = 0x43;

    pub const CHROOT: u8 = 0x44;
    pub const CHDIR: u8 = 0x45;
    pub const HOOK_INFO: u8 = 0x46;
}

/// Cursor over a received payload.  Every read checks bounds and
/// reports [`SpawnError::MalformedPayload`] on truncation.
pub struct Payload<'a> {
    data: &'a [u8],
}

impl<'a> Payload<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let (&first, rest) = self.data.split_first().ok_or(SpawnError::MalformedPayload)?;
        self.data = rest;
        Ok(first)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(SpawnError::MalformedPayload),
        }
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        if self.data.len() < N {
            return Err(SpawnError::MalformedPayload);
        }
        let (head, rest) = self.data.split_at(N);
        self.data = rest;
        let mut out = [0u8; N];
        out.copy_from_slice(head);
        Ok(out)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_ne_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_ne_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_ne_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_ne_bytes(self.read_array()?))
    }

    /// Read a NUL-terminated string.
    pub fn read_str(&mut self) -> Result<&'a str> {
        let nul = self
            .data
            .iter()
            .position(|&b| b == 0)
            .ok_or(SpawnError::MalformedPayload)?;
        let (head, rest) = self.data.split_at(nul);
        self.data = &rest[1..];
        std::str::from_utf8(head).map_err(|_| SpawnError::MalformedPayload)
    }

    /// Read a length-prefixed string (response framing).
    pub fn read_lp_str(&mut self) -> Result<&'a str> {
        let len = self.read_u32()? as usize;
        if self.data.len() < len {
            return Err(SpawnError::MalformedPayload);
        }
        let (head, rest) = self.data.split_at(len);
        self.data = rest;
        std::str::from_utf8(head).map_err(|_| SpawnError::MalformedPayload)
    }
}

/// The ordered fd list carried by one message.  Descriptors are
/// consumed strictly left to right; asking for more than the message
/// carried is a malformed payload.
#[derive(Debug, Default)]
pub struct FdList {
    fds: VecDeque<OwnedFd>,
}

impl FdList {
    #[must_use]
    pub fn new(fds: Vec<OwnedFd>) -> Self {
        Self { fds: fds.into() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Take ownership of the next descriptor.
    pub fn next(&mut self) -> Result<OwnedFd> {
        self.fds.pop_front().ok_or(SpawnError::MalformedPayload)
    }
}

/// Builder for outgoing messages, requests and responses alike.
#[derive(Debug, Default)]
pub struct Serializer {
    data: Vec<u8>,
    fds: Vec<std::os::fd::RawFd>,
}

impl Serializer {
    #[must_use]
    pub fn new(command: u8) -> Self {
        Self {
            data: vec![command],
            fds: Vec::new(),
        }
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.data.push(value);
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_u8(u8::from(value))
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.data.extend_from_slice(&value.to_ne_bytes());
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.data.extend_from_slice(&value.to_ne_bytes());
        self
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.data.extend_from_slice(&value.to_ne_bytes());
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.data.extend_from_slice(&value.to_ne_bytes());
        self
    }

    /// Write a NUL-terminated string (request framing).
    pub fn write_str(&mut self, value: &str) -> &mut Self {
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        self
    }

    /// Write a length-prefixed string (response framing).
    pub fn write_lp_str(&mut self, value: &str) -> &mut Self {
        self.write_u32(value.len() as u32);
        self.data.extend_from_slice(value.as_bytes());
        self
    }

    /// Attach a descriptor to the message's fd list.
    pub fn add_fd(&mut self, fd: std::os::fd::RawFd) -> &mut Self {
        self.fds.push(fd);
        self
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn fds(&self) -> &[std::os::fd::RawFd] {
        &self.fds
    }
}

fn absolute(s: &str) -> Result<PathBuf> {
    let path = PathBuf::from(s);
    if path.is_absolute() {
        Ok(path)
    } else {
        Err(SpawnError::MalformedPayload)
    }
}

/// A tmpfs instance name is a cache key, not a path.
fn tmpfs_name(s: &str) -> Result<String> {
    if s.is_empty() || s.contains('/') {
        return Err(SpawnError::MalformedPayload);
    }
    Ok(s.to_owned())
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| SpawnError::MalformedPayload)
}

/// Option fields accept their tag at most once.
fn set_once<T>(slot: &mut Option<T>, value: T) -> Result<()> {
    if slot.is_some() {
        return Err(SpawnError::MalformedPayload);
    }
    *slot = Some(value);
    Ok(())
}

fn set_stdio_once(slot: &mut Stdio, value: Stdio) -> Result<()> {
    if slot.is_set() {
        return Err(SpawnError::MalformedPayload);
    }
    *slot = value;
    Ok(())
}

fn read_uid_gid(payload: &mut Payload<'_>) -> Result<UidGid> {
    let uid = payload.read_i32()? as u32;
    let gid = payload.read_i32()? as u32;

    let n_groups = payload.read_u8()? as usize;
    if n_groups > MAX_GROUPS {
        return Err(SpawnError::MalformedPayload);
    }

    let mut groups = Vec::with_capacity(n_groups);
    for _ in 0..n_groups {
        groups.push(payload.read_i32()? as u32);
    }

    Ok(UidGid { uid, gid, groups })
}

fn read_rlimit(payload: &mut Payload<'_>) -> Result<(u8, libc::rlimit)> {
    let resource = payload.read_u8()?;
    if u32::from(resource) >= libc::RLIM_NLIMITS as u32 {
        return Err(SpawnError::MalformedPayload);
    }

    let rlim_cur = payload.read_u64()?;
    let rlim_max = payload.read_u64()?;
    Ok((resource, libc::rlimit { rlim_cur, rlim_max }))
}

/// Decode one EXEC message into `(id, name, PreparedChild)`.
///
/// Validation happens during parsing: bounds on argv/env, boolean
/// decoding, absolute paths where required, tag ordering for the
/// cgroup group, and the per-namespace flag/pinned-name exclusivity.
pub fn parse_exec(
    mut payload: Payload<'_>,
    fds: &mut FdList,
) -> Result<(u32, String, PreparedChild)> {
    let id = payload.read_u32()?;
    let name = payload.read_str()?.to_owned();

    let mut p = PreparedChild::default();

    while !payload.is_empty() {
        let tag = payload.read_u8()?;
        match tag {
            exec::EXEC_PATH => {
                let path = absolute(payload.read_str()?)?;
                set_once(&mut p.exec, ExecTarget::Path(path))?;
            }

            exec::EXEC_FD => {
                set_once(&mut p.exec, ExecTarget::Fd(fds.next()?))?;
            }

            exec::ARG => {
                if p.args.len() >= MAX_ARGS {
                    return Err(SpawnError::MalformedPayload);
                }
                let arg = cstring(payload.read_str()?)?;
                p.append_arg(arg);
            }

            exec::SETENV => {
                if p.env.len() >= MAX_ARGS {
                    return Err(SpawnError::MalformedPayload);
                }
                let entry = payload.read_str()?;
                if !entry.contains('=') {
                    return Err(SpawnError::MalformedPayload);
                }
                p.put_env(cstring(entry)?);
            }

            exec::STDIN => set_stdio_once(&mut p.stdin, Stdio::Fd(fds.next()?))?,
            exec::STDOUT => set_stdio_once(&mut p.stdout, Stdio::Fd(fds.next()?))?,
            exec::STDERR => set_stdio_once(&mut p.stderr, Stdio::Fd(fds.next()?))?,
            exec::STDOUT_IS_STDIN => set_stdio_once(&mut p.stdout, Stdio::AliasStdin)?,
            exec::STDERR_IS_STDIN => set_stdio_once(&mut p.stderr, Stdio::AliasStdin)?,

            exec::STDERR_PATH => {
                let path = absolute(payload.read_str()?)?;
                set_stdio_once(&mut p.stderr, Stdio::Path(path))?;
            }

            exec::RETURN_STDERR => set_once(&mut p.return_stderr, fds.next()?)?,
            exec::RETURN_PIDFD => set_once(&mut p.return_pidfd, fds.next()?)?,
            exec::RETURN_CGROUP => set_once(&mut p.return_cgroup, fds.next()?)?,

            exec::TTY => p.tty = true,

            exec::UMASK => {
                let value = payload.read_u16()?;
                if value > 0o777 {
                    return Err(SpawnError::MalformedPayload);
                }
                set_once(&mut p.umask, value)?;
            }

            exec::USER_NS => p.ns.enable_user = true,

            exec::PID_NS => {
                if p.ns.pid_namespace.is_some() {
                    return Err(SpawnError::MalformedPayload);
                }
                p.ns.enable_pid = true;
            }

            exec::CGROUP_NS => p.ns.enable_cgroup = true,

            exec::NETWORK_NS => {
                if p.ns.network_namespace.is_some() {
                    return Err(SpawnError::MalformedPayload);
                }
                p.ns.enable_network = true;
            }

            exec::IPC_NS => p.ns.enable_ipc = true,

            exec::PID_NS_NAME => {
                if p.ns.enable_pid {
                    return Err(SpawnError::MalformedPayload);
                }
                set_once(&mut p.ns.pid_namespace, tmpfs_name(payload.read_str()?)?)?;
            }

            exec::NETWORK_NS_NAME => {
                if p.ns.enable_network {
                    return Err(SpawnError::MalformedPayload);
                }
                set_once(&mut p.ns.network_namespace, tmpfs_name(payload.read_str()?)?)?;
            }

            exec::HOSTNAME => {
                set_once(&mut p.ns.hostname, payload.read_str()?.to_owned())?;
            }

            exec::MAPPED_UID => {
                set_once(&mut p.ns.mapped_uid, payload.read_u32()?)?;
            }

            exec::MOUNT_TMPFS => {
                let target = absolute(payload.read_str()?)?;
                let writable = payload.read_bool()?;
                if target == Path::new("/tmp") {
                    // /tmp has a dedicated directive
                    return Err(SpawnError::MalformedPayload);
                }
                p.ns.mount.directives.push(MountDirective::Tmpfs { target, writable });
            }

            exec::MOUNT_NAMED_TMPFS => {
                let source = tmpfs_name(payload.read_str()?)?;
                let target = absolute(payload.read_str()?)?;
                let writable = payload.read_bool()?;
                let exec = payload.read_bool()?;
                p.ns.mount.directives.push(MountDirective::NamedTmpfs {
                    source,
                    target,
                    writable,
                    exec,
                    source_fd: None,
                });
            }

            exec::BIND_MOUNT => {
                let source = absolute(payload.read_str()?)?;
                let target = absolute(payload.read_str()?)?;
                let writable = payload.read_bool()?;
                let exec = payload.read_bool()?;
                let optional = payload.read_bool()?;
                p.ns.mount.directives.push(MountDirective::Bind {
                    source,
                    target,
                    writable,
                    exec,
                    optional,
                });
            }

            exec::BIND_MOUNT_FILE => {
                let source = absolute(payload.read_str()?)?;
                let target = absolute(payload.read_str()?)?;
                let optional = payload.read_bool()?;
                p.ns.mount.directives.push(MountDirective::BindFile {
                    source,
                    target,
                    optional,
                });
            }

            exec::FD_BIND_MOUNT => {
                let target = absolute(payload.read_str()?)?;
                let writable = payload.read_bool()?;
                let exec = payload.read_bool()?;
                let optional = payload.read_bool()?;
                p.ns.mount.directives.push(MountDirective::FdBind {
                    source_fd: fds.next()?,
                    target,
                    writable,
                    exec,
                    optional,
                });
            }

            exec::FD_BIND_MOUNT_FILE => {
                let target = absolute(payload.read_str()?)?;
                let optional = payload.read_bool()?;
                p.ns.mount.directives.push(MountDirective::FdBindFile {
                    source_fd: fds.next()?,
                    target,
                    optional,
                });
            }

            exec::WRITE_FILE => {
                let path = absolute(payload.read_str()?)?;
                let contents = payload.read_str()?.as_bytes().to_vec();
                let optional = payload.read_bool()?;
                p.ns.mount.directives.push(MountDirective::WriteFile {
                    path,
                    contents,
                    optional,
                });
            }

            exec::MOUNT_PROC => {
                p.ns.mount.mount_proc = true;
                p.ns.mount.writable_proc = payload.read_bool()?;
            }

            exec::MOUNT_DEV => p.ns.mount.mount_dev = true,
            exec::MOUNT_PTS => p.ns.mount.mount_pts = true,
            exec::BIND_MOUNT_PTS => p.ns.mount.bind_mount_pts = true,

            exec::PIVOT_ROOT => {
                if p.ns.mount.mount_root_tmpfs {
                    return Err(SpawnError::MalformedPayload);
                }
                set_once(&mut p.ns.mount.pivot_root, absolute(payload.read_str()?)?)?;
            }

            exec::MOUNT_ROOT_TMPFS => {
                if p.ns.mount.pivot_root.is_some() {
                    return Err(SpawnError::MalformedPayload);
                }
                p.ns.mount.mount_root_tmpfs = true;
            }

            exec::MOUNT_TMP_TMPFS => {
                set_once(
                    &mut p.ns.mount.mount_tmp_tmpfs,
                    absolute(payload.read_str()?)?,
                )?;
            }

            exec::DIR_MODE => {
                let mode = payload.read_u16()?;
                if mode > 0o777 {
                    return Err(SpawnError::MalformedPayload);
                }
                p.ns.mount.dir_mode = u32::from(mode);
            }

            exec::RLIMIT => {
                let (resource, limit) = read_rlimit(&mut payload)?;
                p.rlimits.set(resource, limit);
            }

            exec::UID_GID => {
                if !p.uid_gid.is_empty() {
                    return Err(SpawnError::MalformedPayload);
                }
                p.uid_gid = read_uid_gid(&mut payload)?;
            }

            exec::SCHED_IDLE => p.sched_idle = true,
            exec::IOPRIO_IDLE => p.ioprio_idle = true,
            exec::FORBID_USER_NS => p.forbid_user_ns = true,
            exec::FORBID_MULTICAST => p.forbid_multicast = true,
            exec::FORBID_BIND => p.forbid_bind = true,
            exec::CAP_SYS_RESOURCE => p.cap_sys_resource = true,
            exec::NO_NEW_PRIVS => p.no_new_privs = true,

            exec::PRIORITY => {
                let priority = payload.read_i32()?;
                if !(-20..=19).contains(&priority) {
                    return Err(SpawnError::MalformedPayload);
                }
                p.priority = priority;
            }

            exec::CGROUP => {
                if p.cgroup.is_some() {
                    return Err(SpawnError::MalformedPayload);
                }
                let name = payload.read_str()?;
                if !cgroup::is_valid_group_name(name) {
                    return Err(SpawnError::MalformedPayload);
                }
                p.cgroup = Some(crate::prepared::CgroupOptions {
                    name: name.to_owned(),
                    ..Default::default()
                });
            }

            exec::CGROUP_SESSION => {
                let options = p.cgroup.as_mut().ok_or(SpawnError::MalformedPayload)?;
                let session = payload.read_str()?;
                if !cgroup::is_valid_group_name(session) {
                    return Err(SpawnError::MalformedPayload);
                }
                set_once(&mut options.session, session.to_owned())?;
            }

            exec::CGROUP_SET => {
                let options = p.cgroup.as_mut().ok_or(SpawnError::MalformedPayload)?;
                let set_name = payload.read_str()?;
                let set_value = payload.read_str()?;
                if !cgroup::is_valid_attribute_name(set_name)
                    || !cgroup::is_valid_attribute_value(set_value)
                {
                    return Err(SpawnError::MalformedPayload);
                }
                options.set.push((set_name.to_owned(), set_value.to_owned()));
            }

            exec::CGROUP_XATTR => {
                let options = p.cgroup.as_mut().ok_or(SpawnError::MalformedPayload)?;
                let xattr_name = payload.read_str()?.to_owned();
                let xattr_value = payload.read_str()?.to_owned();
                if xattr_name.is_empty() {
                    return Err(SpawnError::MalformedPayload);
                }
                options.xattr.push((xattr_name, xattr_value));
            }

            exec::CHROOT => set_once(&mut p.chroot, absolute(payload.read_str()?)?)?,
            exec::CHDIR => set_once(&mut p.chdir, absolute(payload.read_str()?)?)?,
            exec::HOOK_INFO => set_once(&mut p.hook_info, payload.read_str()?.to_owned())?,

            _ => return Err(SpawnError::MalformedPayload),
        }
    }

    Ok((id, name, p))
}

/// Decode one `(id, signo)` pair of a KILL payload.
pub fn parse_one_kill(payload: &mut Payload<'_>) -> Result<(u32, i32)> {
    let id = payload.read_u32()?;
    let signo = payload.read_i32()?;
    Ok((id, signo))
}

/// One decoded EXEC_COMPLETE item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCompleteItem {
    pub id: u32,
    /// Empty on success.
    pub error: String,
}

/// One decoded EXIT item; `status` uses the raw `wait` encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitItem {
    pub id: u32,
    pub status: i32,
}

/// Decode an EXEC_COMPLETE batch body (everything after the command
/// byte).
pub fn parse_exec_complete(mut payload: Payload<'_>) -> Result<Vec<ExecCompleteItem>> {
    let mut items = Vec::new();
    while !payload.is_empty() {
        let id = payload.read_u32()?;
        let error = payload.read_lp_str()?.to_owned();
        items.push(ExecCompleteItem { id, error });
    }
    Ok(items)
}

/// Decode an EXIT batch body (everything after the command byte).
pub fn parse_exit(mut payload: Payload<'_>) -> Result<Vec<ExitItem>> {
    let mut items = Vec::new();
    while !payload.is_empty() {
        let id = payload.read_u32()?;
        let status = payload.read_i32()?;
        items.push(ExitItem { id, status });
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_payload(build: impl FnOnce(&mut Serializer)) -> Vec<u8> {
        let mut s = Serializer::new(request::EXEC);
        s.write_u32(7).write_str("test");
        build(&mut s);
        // skip the command byte, HandleMessage consumes it
        s.payload()[1..].to_vec()
    }

    fn parse(body: &[u8]) -> Result<(u32, String, PreparedChild)> {
        parse_exec(Payload::new(body), &mut FdList::default())
    }

    #[test]
    fn minimal_exec_round_trip() {
        let body = exec_payload(|s| {
            s.write_u8(exec::EXEC_PATH).write_str("/bin/echo");
            s.write_u8(exec::ARG).write_str("/bin/echo");
            s.write_u8(exec::ARG).write_str("hi");
            s.write_u8(exec::SETENV).write_str("PATH=/bin");
        });

        let (id, name, p) = parse(&body).unwrap();
        assert_eq!(id, 7);
        assert_eq!(name, "test");
        assert!(matches!(p.exec, Some(ExecTarget::Path(ref path)) if path == Path::new("/bin/echo")));
        assert_eq!(p.args.len(), 2);
        assert_eq!(p.env.len(), 1);
    }

    #[test]
    fn truncated_header_is_malformed() {
        assert!(matches!(
            parse(&[0x07, 0x00]),
            Err(SpawnError::MalformedPayload)
        ));
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let body = exec_payload(|s| {
            s.write_u8(0xee);
        });
        assert!(parse(&body).is_err());
    }

    #[test]
    fn missing_string_terminator_is_malformed() {
        let mut body = exec_payload(|s| {
            s.write_u8(exec::EXEC_PATH).write_str("/bin/echo");
        });
        body.pop(); // strip the NUL
        assert!(parse(&body).is_err());
    }

    #[test]
    fn relative_exec_path_is_malformed() {
        let body = exec_payload(|s| {
            s.write_u8(exec::EXEC_PATH).write_str("bin/echo");
        });
        assert!(parse(&body).is_err());
    }

    #[test]
    fn exec_fd_without_carried_fd_is_malformed() {
        let body = exec_payload(|s| {
            s.write_u8(exec::EXEC_FD);
        });
        assert!(parse(&body).is_err());
    }

    #[test]
    fn duplicate_exec_target_is_malformed() {
        let body = exec_payload(|s| {
            s.write_u8(exec::EXEC_PATH).write_str("/bin/a");
            s.write_u8(exec::EXEC_PATH).write_str("/bin/b");
        });
        assert!(parse(&body).is_err());
    }

    #[test]
    fn arg_count_boundary() {
        let at_limit = exec_payload(|s| {
            for _ in 0..MAX_ARGS {
                s.write_u8(exec::ARG).write_str("x");
            }
        });
        assert!(parse(&at_limit).is_ok());

        let over_limit = exec_payload(|s| {
            for _ in 0..=MAX_ARGS {
                s.write_u8(exec::ARG).write_str("x");
            }
        });
        assert!(parse(&over_limit).is_err());
    }

    #[test]
    fn setenv_requires_assignment() {
        let body = exec_payload(|s| {
            s.write_u8(exec::SETENV).write_str("NOT_AN_ASSIGNMENT");
        });
        assert!(parse(&body).is_err());
    }

    #[test]
    fn bad_bool_encoding_is_malformed() {
        let body = exec_payload(|s| {
            s.write_u8(exec::MOUNT_TMPFS).write_str("/scratch").write_u8(2);
        });
        assert!(parse(&body).is_err());
    }

    #[test]
    fn group_count_boundary() {
        let write_uid_gid = |s: &mut Serializer, n: usize| {
            s.write_u8(exec::UID_GID).write_i32(1000).write_i32(1000);
            s.write_u8(n as u8);
            for _ in 0..n {
                s.write_i32(100);
            }
        };

        let at_limit = exec_payload(|s| write_uid_gid(s, MAX_GROUPS));
        let (_, _, p) = parse(&at_limit).unwrap();
        assert_eq!(p.uid_gid.groups.len(), MAX_GROUPS);

        let over_limit = exec_payload(|s| write_uid_gid(s, MAX_GROUPS + 1));
        assert!(parse(&over_limit).is_err());
    }

    #[test]
    fn tmpfs_on_tmp_is_rejected_but_tmp_tmpfs_succeeds() {
        let rejected = exec_payload(|s| {
            s.write_u8(exec::MOUNT_TMPFS).write_str("/tmp").write_bool(true);
        });
        assert!(parse(&rejected).is_err());

        let accepted = exec_payload(|s| {
            s.write_u8(exec::MOUNT_TMP_TMPFS).write_str("/tmp");
        });
        let (_, _, p) = parse(&accepted).unwrap();
        assert_eq!(p.ns.mount.mount_tmp_tmpfs.as_deref(), Some(Path::new("/tmp")));
    }

    #[test]
    fn pivot_root_and_root_tmpfs_are_mutually_exclusive() {
        let body = exec_payload(|s| {
            s.write_u8(exec::PIVOT_ROOT).write_str("/newroot");
            s.write_u8(exec::MOUNT_ROOT_TMPFS);
        });
        assert!(parse(&body).is_err());

        let body = exec_payload(|s| {
            s.write_u8(exec::MOUNT_ROOT_TMPFS);
            s.write_u8(exec::PIVOT_ROOT).write_str("/newroot");
        });
        assert!(parse(&body).is_err());
    }

    #[test]
    fn pinned_namespace_excludes_enable_flag() {
        let body = exec_payload(|s| {
            s.write_u8(exec::NETWORK_NS);
            s.write_u8(exec::NETWORK_NS_NAME).write_str("lab");
        });
        assert!(parse(&body).is_err());

        let body = exec_payload(|s| {
            s.write_u8(exec::PID_NS_NAME).write_str("lab");
            s.write_u8(exec::PID_NS);
        });
        assert!(parse(&body).is_err());
    }

    #[test]
    fn cgroup_tags_require_cgroup_first() {
        let body = exec_payload(|s| {
            s.write_u8(exec::CGROUP_SESSION).write_str("s1");
        });
        assert!(parse(&body).is_err());

        let body = exec_payload(|s| {
            s.write_u8(exec::CGROUP).write_str("web");
            s.write_u8(exec::CGROUP_SESSION).write_str("s1");
            s.write_u8(exec::CGROUP_SET).write_str("memory.max").write_str("64M");
        });
        let (_, _, p) = parse(&body).unwrap();
        let cg = p.cgroup.unwrap();
        assert_eq!(cg.name, "web");
        assert_eq!(cg.session.as_deref(), Some("s1"));
        assert_eq!(cg.set, vec![("memory.max".to_owned(), "64M".to_owned())]);
    }

    #[test]
    fn second_cgroup_tag_is_malformed() {
        let body = exec_payload(|s| {
            s.write_u8(exec::CGROUP).write_str("web");
            s.write_u8(exec::CGROUP).write_str("batch");
        });
        assert!(parse(&body).is_err());
    }

    #[test]
    fn cgroup_set_on_cgroup_controller_is_malformed() {
        let body = exec_payload(|s| {
            s.write_u8(exec::CGROUP).write_str("web");
            s.write_u8(exec::CGROUP_SET).write_str("cgroup.procs").write_str("0");
        });
        assert!(parse(&body).is_err());
    }

    #[test]
    fn rlimit_round_trip() {
        let body = exec_payload(|s| {
            s.write_u8(exec::RLIMIT).write_u8(libc::RLIMIT_NOFILE as u8);
            s.write_u64(1024).write_u64(4096);
        });
        let (_, _, p) = parse(&body).unwrap();
        let (resource, limit) = p.rlimits.iter().next().unwrap();
        assert_eq!(*resource, libc::RLIMIT_NOFILE as u8);
        assert_eq!(limit.rlim_cur, 1024);
        assert_eq!(limit.rlim_max, 4096);
    }

    #[test]
    fn mount_order_is_preserved() {
        let body = exec_payload(|s| {
            s.write_u8(exec::BIND_MOUNT)
                .write_str("/usr")
                .write_str("/usr")
                .write_bool(false)
                .write_bool(true)
                .write_bool(false);
            s.write_u8(exec::MOUNT_TMPFS).write_str("/scratch").write_bool(true);
            s.write_u8(exec::WRITE_FILE)
                .write_str("/etc/hostname")
                .write_str("sandbox")
                .write_bool(false);
        });
        let (_, _, p) = parse(&body).unwrap();
        let d = &p.ns.mount.directives;
        assert_eq!(d.len(), 3);
        assert!(matches!(d[0], MountDirective::Bind { .. }));
        assert!(matches!(d[1], MountDirective::Tmpfs { .. }));
        assert!(matches!(d[2], MountDirective::WriteFile { .. }));
    }

    #[test]
    fn named_tmpfs_round_trip() {
        let body = exec_payload(|s| {
            s.write_u8(exec::MOUNT_NAMED_TMPFS)
                .write_str("build-cache")
                .write_str("/cache")
                .write_bool(true)
                .write_bool(true);
        });
        let (_, _, p) = parse(&body).unwrap();
        match &p.ns.mount.directives[0] {
            MountDirective::NamedTmpfs {
                source,
                target,
                writable,
                exec,
                source_fd,
            } => {
                assert_eq!(source, "build-cache");
                assert_eq!(target, Path::new("/cache"));
                assert!(*writable && *exec);
                assert!(source_fd.is_none());
            }
            other => panic!("unexpected directive {other:?}"),
        }
    }

    #[test]
    fn named_tmpfs_source_is_a_name_not_a_path() {
        let body = exec_payload(|s| {
            s.write_u8(exec::MOUNT_NAMED_TMPFS)
                .write_str("../escape")
                .write_str("/cache")
                .write_bool(true)
                .write_bool(false);
        });
        assert!(parse(&body).is_err());
    }

    #[test]
    fn umask_bounds() {
        let ok = exec_payload(|s| {
            s.write_u8(exec::UMASK).write_u16(0o027);
        });
        assert_eq!(parse(&ok).unwrap().2.umask, Some(0o027));

        let bad = exec_payload(|s| {
            s.write_u8(exec::UMASK).write_u16(0o1000);
        });
        assert!(parse(&bad).is_err());
    }

    #[test]
    fn kill_pairs_decode_in_order() {
        let mut s = Serializer::new(request::KILL);
        s.write_u32(10).write_i32(libc::SIGTERM);
        s.write_u32(11).write_i32(libc::SIGKILL);

        let mut payload = Payload::new(&s.payload()[1..]);
        assert_eq!(parse_one_kill(&mut payload).unwrap(), (10, libc::SIGTERM));
        assert_eq!(parse_one_kill(&mut payload).unwrap(), (11, libc::SIGKILL));
        assert!(payload.is_empty());
    }

    #[test]
    fn response_batches_round_trip() {
        let mut s = Serializer::new(response::EXEC_COMPLETE);
        s.write_u32(7).write_lp_str("");
        s.write_u32(8).write_lp_str("clone failed");

        let items = parse_exec_complete(Payload::new(&s.payload()[1..])).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], ExecCompleteItem { id: 7, error: String::new() });
        assert_eq!(items[1].error, "clone failed");

        let mut s = Serializer::new(response::EXIT);
        s.write_u32(7).write_i32(0);
        s.write_u32(8).write_i32(0xff00);
        let items = parse_exit(Payload::new(&s.payload()[1..])).unwrap();
        assert_eq!(items[1], ExitItem { id: 8, status: 0xff00 });
    }

    #[test]
    fn hostname_tag_sets_uts_namespace() {
        let body = exec_payload(|s| {
            s.write_u8(exec::HOSTNAME).write_str("sandbox");
        });
        let (_, _, p) = parse(&body).unwrap();
        assert_eq!(p.ns.hostname.as_deref(), Some("sandbox"));
        assert!(p
            .ns
            .clone_flags()
            .contains(nix::sched::CloneFlags::CLONE_NEWUTS));
    }
}
