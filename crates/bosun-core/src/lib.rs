//! # bosun-core
//!
//! Process isolation primitives and the spawn protocol for the bosun
//! supervisor daemon.
//!
//! This crate provides the building blocks the daemon composes:
//! - the control-socket wire protocol (binary TLV plus `SCM_RIGHTS`
//!   descriptor lists)
//! - the [`prepared::PreparedChild`] parameter block
//! - Linux isolation via clone3/pidfd, namespaces, ordered mount
//!   directives, seccomp deny filters, rlimits and capability drops
//! - cgroup v2 discovery, controller enablement and per-child
//!   placement
//! - a cache of named tmpfs instances with lease-counted lifetimes

#![warn(clippy::all)]

pub mod cgroup;
pub mod config;
pub mod error;
pub mod isolation;
pub mod prepared;
pub mod protocol;
pub mod spawn;
pub mod tmpfs;

pub use cgroup::CgroupState;
pub use config::SpawnConfig;
pub use error::SpawnError;
pub use prepared::PreparedChild;
pub use tmpfs::TmpfsManager;

/// Crate-level result type
pub type Result<T> = std::result::Result<T, SpawnError>;
