//! Daemon configuration

use bosun_core::SpawnConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path of the control socket
    pub socket_path: PathBuf,

    /// Whether the daemon runs in a private mount namespace; gates the
    /// tmpfs manager
    pub private_mounts: bool,

    /// Enable cgroup controllers for the subtree at startup
    pub setup_controllers: bool,

    /// Spawn policy handed to bosun-core
    pub spawn: SpawnConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: bosun_core::config::default_socket_path(),
            private_mounts: true,
            setup_controllers: true,
            spawn: SpawnConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_the_full_stack() {
        let config = DaemonConfig::default();
        assert!(config.private_mounts);
        assert!(config.setup_controllers);
        assert_eq!(config.spawn.tmpfs_root, PathBuf::from("/tmp/tmpfs"));
    }
}
