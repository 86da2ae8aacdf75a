//! bosun - command line client for the spawn daemon
//!
//! Builds EXEC requests out of its own stdio descriptors, sends them
//! over the control socket and relays the child's exit status.

use anyhow::{bail, Context};
use bosun_core::protocol::{self, exec, request, response, Payload, Serializer};
use clap::Parser;
use nix::sys::socket::{
    connect, recvmsg, sendmsg, socket, AddressFamily, ControlMessage, ControlMessageOwned,
    MsgFlags, SockFlag, SockType, UnixAddr,
};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bosun")]
#[command(about = "Run a program through the bosun spawn daemon")]
struct Args {
    /// Socket path (defaults to BOSUN_SOCKET or /run/bosun/bosun.sock)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Request name shown in daemon logs
    #[arg(long, default_value = "bosun-cli")]
    name: String,

    /// NAME=VALUE environment entries for the child (repeatable)
    #[arg(short = 'e', long = "env")]
    env: Vec<String>,

    /// Credentials for the child; without them the daemon's defaults
    /// apply
    #[arg(long)]
    uid: Option<u32>,

    #[arg(long)]
    gid: Option<u32>,

    /// Cgroup name under the daemon's root group
    #[arg(long)]
    cgroup: Option<String>,

    /// Per-connection cgroup session under --cgroup
    #[arg(long)]
    cgroup_session: Option<String>,

    /// Cgroup attribute assignment, e.g. memory.max=64M (repeatable)
    #[arg(long = "cgroup-set")]
    cgroup_set: Vec<String>,

    /// Mount a private tmpfs at the given path (repeatable)
    #[arg(long = "tmpfs")]
    tmpfs: Vec<PathBuf>,

    /// Mount a shared named tmpfs, NAME:TARGET (repeatable)
    #[arg(long = "named-tmpfs")]
    named_tmpfs: Vec<String>,

    /// New PID namespace
    #[arg(long)]
    pid_ns: bool,

    /// New network namespace
    #[arg(long)]
    net_ns: bool,

    /// New IPC namespace
    #[arg(long)]
    ipc_ns: bool,

    /// Set the child's hostname (implies a UTS namespace)
    #[arg(long)]
    hostname: Option<String>,

    /// Mount /proc in the child
    #[arg(long)]
    mount_proc: bool,

    /// Apply PR_SET_NO_NEW_PRIVS
    #[arg(long)]
    no_new_privs: bool,

    /// Run with SCHED_IDLE
    #[arg(long)]
    sched_idle: bool,

    /// Send SIGKILL if the child outlives this many seconds
    #[arg(long)]
    kill_after: Option<u32>,

    /// Program to execute (absolute path)
    program: PathBuf,

    /// Arguments after the program
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

const REQUEST_ID: u32 = 1;

fn build_exec(args: &Args) -> anyhow::Result<Serializer> {
    let program = args
        .program
        .to_str()
        .context("program path is not valid UTF-8")?;

    let mut s = Serializer::new(request::EXEC);
    s.write_u32(REQUEST_ID).write_str(&args.name);

    s.write_u8(exec::EXEC_PATH).write_str(program);
    s.write_u8(exec::ARG).write_str(program);
    for arg in &args.args {
        s.write_u8(exec::ARG).write_str(arg);
    }
    for entry in &args.env {
        s.write_u8(exec::SETENV).write_str(entry);
    }

    // hand the child our own stdio
    s.write_u8(exec::STDIN).add_fd(libc::STDIN_FILENO);
    s.write_u8(exec::STDOUT).add_fd(libc::STDOUT_FILENO);
    s.write_u8(exec::STDERR).add_fd(libc::STDERR_FILENO);

    if let (Some(uid), Some(gid)) = (args.uid, args.gid) {
        s.write_u8(exec::UID_GID)
            .write_i32(uid as i32)
            .write_i32(gid as i32)
            .write_u8(0);
    }

    if let Some(cgroup) = &args.cgroup {
        s.write_u8(exec::CGROUP).write_str(cgroup);
        if let Some(session) = &args.cgroup_session {
            s.write_u8(exec::CGROUP_SESSION).write_str(session);
        }
        for assignment in &args.cgroup_set {
            let (name, value) = assignment
                .split_once('=')
                .context("--cgroup-set takes NAME=VALUE")?;
            s.write_u8(exec::CGROUP_SET).write_str(name).write_str(value);
        }
    }

    for target in &args.tmpfs {
        let target = target.to_str().context("tmpfs path is not valid UTF-8")?;
        s.write_u8(exec::MOUNT_TMPFS).write_str(target).write_bool(true);
    }

    for spec in &args.named_tmpfs {
        let (name, target) = spec
            .split_once(':')
            .context("--named-tmpfs takes NAME:TARGET")?;
        s.write_u8(exec::MOUNT_NAMED_TMPFS)
            .write_str(name)
            .write_str(target)
            .write_bool(true)
            .write_bool(false);
    }

    if args.pid_ns {
        s.write_u8(exec::PID_NS);
    }
    if args.net_ns {
        s.write_u8(exec::NETWORK_NS);
    }
    if args.ipc_ns {
        s.write_u8(exec::IPC_NS);
    }
    if let Some(hostname) = &args.hostname {
        s.write_u8(exec::HOSTNAME).write_str(hostname);
    }
    if args.mount_proc {
        s.write_u8(exec::MOUNT_PROC).write_bool(false);
    }
    if args.no_new_privs {
        s.write_u8(exec::NO_NEW_PRIVS);
    }
    if args.sched_idle {
        s.write_u8(exec::SCHED_IDLE);
    }

    Ok(s)
}

fn send_message(socket: &OwnedFd, payload: &[u8], fds: &[RawFd]) -> anyhow::Result<()> {
    let iov = [IoSlice::new(payload)];
    let cmsg;
    let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() {
        &[]
    } else {
        cmsg = [ControlMessage::ScmRights(fds)];
        &cmsg
    };

    sendmsg::<UnixAddr>(socket.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)
        .context("failed to send request")?;
    Ok(())
}

fn receive_message(socket: &OwnedFd) -> anyhow::Result<Vec<u8>> {
    let mut buf = vec![0u8; protocol::MAX_PAYLOAD];
    let mut cmsg = nix::cmsg_space!([RawFd; protocol::MAX_FDS]);

    let bytes = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let msg = recvmsg::<UnixAddr>(
            socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::empty(),
        )
        .context("failed to receive response")?;

        // drop any descriptors the daemon sent back; this client never
        // asks for them
        if let Ok(cmsgs) = msg.cmsgs() {
            for cmsg in cmsgs {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    for fd in fds {
                        // SAFETY: freshly installed descriptor we own
                        drop(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                }
            }
        }

        msg.bytes
    };

    if bytes == 0 {
        bail!("daemon closed the connection");
    }

    buf.truncate(bytes);
    Ok(buf)
}

/// Wait for readability, or time out.
fn wait_readable(socket: &OwnedFd, timeout_ms: i32) -> anyhow::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd: socket.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };

    // SAFETY: poll on one valid descriptor
    let ret = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if ret < 0 {
        bail!(
            "poll failed: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(ret > 0)
}

fn send_kill(socket: &OwnedFd, id: u32, signo: i32) -> anyhow::Result<()> {
    let mut s = Serializer::new(request::KILL);
    s.write_u32(id).write_i32(signo);
    send_message(socket, s.payload(), &[])
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let path = args
        .socket
        .clone()
        .unwrap_or_else(bosun_core::config::default_socket_path);

    let sock = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .context("failed to create socket")?;
    let addr = UnixAddr::new(path.as_path()).context("invalid socket path")?;
    connect(sock.as_raw_fd(), &addr)
        .with_context(|| format!("failed to connect to {}", path.display()))?;

    let message = build_exec(&args)?;
    send_message(&sock, message.payload(), message.fds())?;

    let deadline = args
        .kill_after
        .map(|secs| i32::try_from(u64::from(secs) * 1000).unwrap_or(i32::MAX));
    let mut kill_sent = false;

    loop {
        if let Some(timeout_ms) = deadline {
            if !kill_sent && !wait_readable(&sock, timeout_ms)? {
                eprintln!("bosun: deadline exceeded, sending SIGKILL");
                send_kill(&sock, REQUEST_ID, libc::SIGKILL)?;
                kill_sent = true;
                continue;
            }
        }

        let message = receive_message(&sock)?;
        let mut payload = Payload::new(&message);
        let command = payload
            .read_u8()
            .map_err(|_| anyhow::anyhow!("empty response"))?;

        match command {
            response::EXEC_COMPLETE => {
                let items = protocol::parse_exec_complete(payload)
                    .map_err(|_| anyhow::anyhow!("unparseable EXEC_COMPLETE"))?;
                for item in items {
                    if !item.error.is_empty() {
                        eprintln!("bosun: spawn failed: {}", item.error);
                    }
                }
            }

            response::EXIT => {
                let items = protocol::parse_exit(payload)
                    .map_err(|_| anyhow::anyhow!("unparseable EXIT"))?;
                for item in items {
                    if item.id != REQUEST_ID {
                        continue;
                    }
                    let status = item.status;
                    if status & 0x7f == 0 {
                        std::process::exit((status >> 8) & 0xff);
                    }
                    let signo = status & 0x7f;
                    eprintln!("bosun: child killed by signal {signo}");
                    std::process::exit(128 + signo);
                }
            }

            _ => bail!("unknown response command {command:#x}"),
        }
    }
}
