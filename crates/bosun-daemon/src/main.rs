//! bosun-daemon - privileged process-spawning supervisor
//!
//! Accepts framed requests (with `SCM_RIGHTS` descriptors) on a local
//! `SOCK_SEQPACKET` socket and launches children inside configurable
//! isolation environments: namespaces, seccomp filters, capability
//! drops, resource limits, cgroup placement and tmpfs overlays.

use anyhow::Context;
use bosun_core::prepared::UidGid;
use bosun_core::{CgroupState, SpawnConfig, TmpfsManager};
use clap::Parser;
use nix::sys::socket::{bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;
mod connection;
mod reactor;
mod registry;
mod supervisor;

use config::DaemonConfig;
use supervisor::{Shared, Supervisor};

#[derive(Parser)]
#[command(name = "bosun-daemon")]
#[command(about = "Privileged process-spawning supervisor")]
struct Args {
    /// Control socket path (defaults to BOSUN_SOCKET or /run/bosun/bosun.sock)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Credentials substituted when a request carries none
    #[arg(long, default_value_t = 65534)]
    default_uid: u32,

    #[arg(long, default_value_t = 65534)]
    default_gid: u32,

    /// Uid allowed for requests that carry explicit credentials (repeatable)
    #[arg(long = "allow-uid")]
    allowed_uids: Vec<u32>,

    /// Gid allowed for requests that carry explicit credentials (repeatable)
    #[arg(long = "allow-gid")]
    allowed_gids: Vec<u32>,

    /// Parent directory for managed tmpfs instances
    #[arg(long, default_value = "/tmp/tmpfs")]
    tmpfs_root: PathBuf,

    /// Disable the tmpfs manager (no private mount tree)
    #[arg(long)]
    no_tmpfs: bool,

    /// Skip enabling cgroup controllers at startup
    #[arg(long)]
    skip_controller_setup: bool,
}

fn bind_control_socket(path: &PathBuf) -> anyhow::Result<OwnedFd> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let _ = std::fs::remove_file(path);

    let fd = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        None,
    )
    .context("failed to create control socket")?;

    let addr = UnixAddr::new(path.as_path()).context("invalid socket path")?;
    bind(fd.as_raw_fd(), &addr)
        .with_context(|| format!("failed to bind {}", path.display()))?;
    listen(&fd, Backlog::new(16).context("invalid backlog")?)
        .context("failed to listen on control socket")?;

    Ok(fd)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("bosun=info".parse()?))
        .init();

    let args = Args::parse();

    let config = DaemonConfig {
        socket_path: args
            .socket
            .unwrap_or_else(bosun_core::config::default_socket_path),
        private_mounts: !args.no_tmpfs,
        setup_controllers: !args.skip_controller_setup,
        spawn: SpawnConfig {
            default_uid_gid: UidGid {
                uid: args.default_uid,
                gid: args.default_gid,
                groups: Vec::new(),
            },
            allowed_uids: args.allowed_uids,
            allowed_gids: args.allowed_gids,
            tmpfs_root: args.tmpfs_root,
        },
    };

    tracing::info!(socket = ?config.socket_path, "bosun-daemon starting");

    let cgroup = CgroupState::from_self().context("cgroup discovery failed")?;
    if config.setup_controllers {
        cgroup
            .enable_all_controllers()
            .context("controller setup failed")?;
    }
    tracing::info!(group = %cgroup.group_path(), kill = cgroup.has_cgroup_kill(), "cgroup ready");

    let tmpfs = if config.private_mounts {
        Some(TmpfsManager::new(config.spawn.tmpfs_root.clone()).context("tmpfs setup failed")?)
    } else {
        None
    };

    let listener = bind_control_socket(&config.socket_path)?;
    tracing::info!(socket = ?config.socket_path, "listening");

    let shared = Shared {
        config: config.spawn,
        cgroup,
        tmpfs,
        hook: None,
    };

    let mut supervisor = Supervisor::new(listener, shared).context("reactor setup failed")?;
    supervisor.run().context("event loop failed")?;

    Ok(())
}
