//! Seccomp-BPF deny filters
//!
//! The spawner only installs narrow deny lists requested per child:
//! everything is allowed except the specific operations a flag forbids.
//! User namespace creation is matched on the clone/unshare flag
//! argument; multicast is enforced by denying the group-membership
//! socket options, since classic BPF cannot dereference the sockaddr
//! passed to bind.

use crate::{Result, SpawnError};
use seccompiler::{
    BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition, SeccompFilter,
    SeccompRule, TargetArch,
};
use std::collections::BTreeMap;

const CLONE_NEWUSER: u64 = libc::CLONE_NEWUSER as u64;

/// The deny flags of one spawn request.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompOptions {
    /// Deny creating user namespaces.
    pub forbid_user_ns: bool,
    /// Deny joining multicast groups.
    pub forbid_multicast: bool,
    /// Deny bind entirely.
    pub forbid_bind: bool,
}

impl SeccompOptions {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.forbid_user_ns || self.forbid_multicast || self.forbid_bind
    }

    /// Build the deny filter.  Pure; the syscall happens in
    /// [`Self::apply`].
    pub fn build_filter(&self) -> Result<SeccompFilter> {
        let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();

        if self.forbid_user_ns {
            for syscall in [libc::SYS_clone, libc::SYS_unshare] {
                let condition = SeccompCondition::new(
                    0,
                    SeccompCmpArgLen::Qword,
                    SeccompCmpOp::MaskedEq(CLONE_NEWUSER),
                    CLONE_NEWUSER,
                )
                .map_err(|e| SpawnError::Seccomp(format!("failed to build condition: {e}")))?;

                rules.insert(
                    syscall,
                    vec![SeccompRule::new(vec![condition])
                        .map_err(|e| SpawnError::Seccomp(format!("failed to build rule: {e}")))?],
                );
            }
        }

        if self.forbid_bind {
            // an empty rule list matches every invocation
            rules.insert(libc::SYS_bind, vec![]);
        }

        if self.forbid_multicast {
            let memberships: &[(u64, u64)] = &[
                (libc::IPPROTO_IP as u64, libc::IP_ADD_MEMBERSHIP as u64),
                (libc::IPPROTO_IP as u64, libc::MCAST_JOIN_GROUP as u64),
                (libc::IPPROTO_IP as u64, libc::MCAST_JOIN_SOURCE_GROUP as u64),
                (libc::IPPROTO_IPV6 as u64, libc::IPV6_ADD_MEMBERSHIP as u64),
                (libc::IPPROTO_IPV6 as u64, libc::MCAST_JOIN_GROUP as u64),
                (
                    libc::IPPROTO_IPV6 as u64,
                    libc::MCAST_JOIN_SOURCE_GROUP as u64,
                ),
            ];

            let mut setsockopt_rules = Vec::with_capacity(memberships.len());
            for &(level, optname) in memberships {
                let conditions = vec![
                    SeccompCondition::new(1, SeccompCmpArgLen::Qword, SeccompCmpOp::Eq, level)
                        .map_err(|e| {
                            SpawnError::Seccomp(format!("failed to build condition: {e}"))
                        })?,
                    SeccompCondition::new(2, SeccompCmpArgLen::Qword, SeccompCmpOp::Eq, optname)
                        .map_err(|e| {
                            SpawnError::Seccomp(format!("failed to build condition: {e}"))
                        })?,
                ];
                setsockopt_rules.push(
                    SeccompRule::new(conditions)
                        .map_err(|e| SpawnError::Seccomp(format!("failed to build rule: {e}")))?,
                );
            }

            rules.insert(libc::SYS_setsockopt, setsockopt_rules);
        }

        SeccompFilter::new(
            rules,
            SeccompAction::Allow,
            SeccompAction::Errno(libc::EPERM as u32),
            target_arch(),
        )
        .map_err(|e| SpawnError::Seccomp(format!("failed to create filter: {e}")))
    }

    /// Compile and load the filter into the current process.
    pub fn apply(&self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let filter = self.build_filter()?;
        let program: BpfProgram = filter
            .try_into()
            .map_err(|e| SpawnError::Seccomp(format!("failed to compile filter: {e}")))?;

        seccompiler::apply_filter(&program)
            .map_err(|e| SpawnError::Seccomp(format!("failed to apply filter: {e}")))
    }
}

fn target_arch() -> TargetArch {
    #[cfg(target_arch = "x86_64")]
    return TargetArch::x86_64;

    #[cfg(target_arch = "aarch64")]
    return TargetArch::aarch64;

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    compile_error!("Unsupported architecture for seccomp");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_options_build_nothing() {
        assert!(!SeccompOptions::default().is_enabled());
    }

    #[test]
    fn filters_compile_to_bpf() {
        let options = SeccompOptions {
            forbid_user_ns: true,
            forbid_multicast: true,
            forbid_bind: true,
        };

        let program: BpfProgram = options.build_filter().unwrap().try_into().unwrap();
        assert!(!program.is_empty());
    }

    #[test]
    fn single_flag_filters_compile() {
        for options in [
            SeccompOptions {
                forbid_user_ns: true,
                ..Default::default()
            },
            SeccompOptions {
                forbid_multicast: true,
                ..Default::default()
            },
            SeccompOptions {
                forbid_bind: true,
                ..Default::default()
            },
        ] {
            let program: BpfProgram = options.build_filter().unwrap().try_into().unwrap();
            assert!(!program.is_empty());
        }
    }
}
