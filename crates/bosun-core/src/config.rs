//! Spawner configuration and the credential verification hook

use crate::prepared::{PreparedChild, UidGid};
use crate::{Result, SpawnError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Server-wide spawn policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnConfig {
    /// Credentials substituted when a request carries none.
    pub default_uid_gid: UidGid,

    /// Explicitly permitted uids for requests that carry credentials.
    pub allowed_uids: Vec<u32>,

    /// Explicitly permitted gids for requests that carry credentials.
    pub allowed_gids: Vec<u32>,

    /// Parent directory for managed tmpfs instances.
    pub tmpfs_root: PathBuf,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            default_uid_gid: UidGid::default(),
            allowed_uids: Vec::new(),
            allowed_gids: Vec::new(),
            tmpfs_root: PathBuf::from("/tmp/tmpfs"),
        }
    }
}

impl SpawnConfig {
    /// Check explicitly requested credentials against the allow lists.
    pub fn verify_uid_gid(&self, uid_gid: &UidGid) -> Result<()> {
        if !self.allowed_uids.contains(&uid_gid.uid) {
            return Err(SpawnError::AuthorizationDenied(format!(
                "uid {} is not allowed",
                uid_gid.uid
            )));
        }

        if !self.allowed_gids.contains(&uid_gid.gid) {
            return Err(SpawnError::AuthorizationDenied(format!(
                "gid {} is not allowed",
                uid_gid.gid
            )));
        }

        for group in uid_gid.supplementary_groups() {
            if !self.allowed_gids.contains(group) {
                return Err(SpawnError::AuthorizationDenied(format!(
                    "supplementary gid {group} is not allowed"
                )));
            }
        }

        Ok(())
    }
}

/// Host-provided authorization hook consulted for requests with unusual
/// credentials.  Returning `true` accepts the request as-is; returning
/// `false` falls back to the [`SpawnConfig`] allow lists.
pub trait VerifyHook {
    fn verify(&self, prepared: &PreparedChild) -> bool;
}

/// Get the control socket path from `BOSUN_SOCKET` or the system default.
pub fn default_socket_path() -> PathBuf {
    std::env::var("BOSUN_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/bosun/bosun.sock"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SpawnConfig {
        SpawnConfig {
            allowed_uids: vec![1000, 1001],
            allowed_gids: vec![1000],
            ..SpawnConfig::default()
        }
    }

    #[test]
    fn allowed_credentials_pass() {
        let uid_gid = UidGid {
            uid: 1000,
            gid: 1000,
            groups: vec![1000],
        };
        assert!(config().verify_uid_gid(&uid_gid).is_ok());
    }

    #[test]
    fn unlisted_uid_is_denied() {
        let uid_gid = UidGid {
            uid: 4242,
            gid: 1000,
            groups: vec![],
        };
        assert!(matches!(
            config().verify_uid_gid(&uid_gid),
            Err(SpawnError::AuthorizationDenied(_))
        ));
    }

    #[test]
    fn unlisted_supplementary_group_is_denied() {
        let uid_gid = UidGid {
            uid: 1000,
            gid: 1000,
            groups: vec![4242],
        };
        assert!(config().verify_uid_gid(&uid_gid).is_err());
    }
}
