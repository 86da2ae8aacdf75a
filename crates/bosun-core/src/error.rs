//! Error types for bosun-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpawnError {
    /// A request payload that could not be decoded: truncation, an
    /// unknown tag, an exhausted fd list, or an out-of-bounds count.
    /// The connection logs this and keeps serving other requests.
    #[error("malformed spawn payload")]
    MalformedPayload,

    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("cgroup error: {0}")]
    Cgroup(String),

    #[error("tmpfs error: {0}")]
    Tmpfs(String),

    #[error("namespace error: {0}")]
    Namespace(String),

    #[error("mount error: {0}")]
    Mount(String),

    #[error("seccomp error: {0}")]
    Seccomp(String),

    #[error("clone error: {0}")]
    Clone(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
}

impl SpawnError {
    /// True for client-fault decoding errors, which must not tear down
    /// the connection.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedPayload)
    }
}
