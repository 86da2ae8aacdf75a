//! Capability drop before exec
//!
//! The spawner runs with full privileges; children keep nothing except
//! an explicitly retained set.  The drop is split around the uid
//! switch: the bounding/inheritable/ambient work needs CAP_SETPCAP and
//! must happen while still privileged, while the permitted/effective
//! reduction is the last step before exec.

use crate::{Result, SpawnError};
use caps::{CapSet, Capability, CapsHashSet};

fn caps_err(what: &str, e: caps::errors::CapsError) -> SpawnError {
    SpawnError::Execution(format!("{what}: {e}"))
}

/// First phase, before the uid switch: limit the bounding set to
/// `retained`, make the retained capabilities inheritable and ambient
/// so they survive both setuid and execve, and ask the kernel to keep
/// the permitted set across setuid.
pub fn limit_bounding(retained: &CapsHashSet) -> Result<()> {
    let bounding = caps::read(None, CapSet::Bounding)
        .map_err(|e| caps_err("failed to read bounding set", e))?;
    for cap in bounding {
        if !retained.contains(&cap) {
            caps::drop(None, CapSet::Bounding, cap)
                .map_err(|e| caps_err("failed to drop bounding capability", e))?;
        }
    }

    caps::set(None, CapSet::Inheritable, retained)
        .map_err(|e| caps_err("failed to set inheritable capabilities", e))?;

    for cap in retained {
        caps::raise(None, CapSet::Ambient, *cap)
            .map_err(|e| caps_err("failed to raise ambient capability", e))?;
    }

    // SAFETY: plain prctl with immediate arguments
    let ret = unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(SpawnError::Execution(format!(
            "PR_SET_KEEPCAPS failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Second phase, after the uid switch: reduce the permitted and
/// effective sets to `retained`.  Lowering one's own sets needs no
/// privilege.
pub fn finish_drop(retained: &CapsHashSet) -> Result<()> {
    caps::set(None, CapSet::Effective, retained)
        .map_err(|e| caps_err("failed to set effective capabilities", e))?;
    caps::set(None, CapSet::Permitted, retained)
        .map_err(|e| caps_err("failed to set permitted capabilities", e))?;
    Ok(())
}

/// The retained set for one spawn request.
#[must_use]
pub fn retained_set(cap_sys_resource: bool) -> CapsHashSet {
    let mut retained = CapsHashSet::new();
    if cap_sys_resource {
        retained.insert(Capability::CAP_SYS_RESOURCE);
    }
    retained
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retained_set_reflects_flags() {
        assert!(retained_set(false).is_empty());

        let retained = retained_set(true);
        assert_eq!(retained.len(), 1);
        assert!(retained.contains(&Capability::CAP_SYS_RESOURCE));
    }
}
