//! Resource limit application

use crate::prepared::ResourceLimits;
use crate::{Result, SpawnError};

/// Apply every configured limit to the current process.
pub fn apply(rlimits: &ResourceLimits) -> Result<()> {
    for (resource, limit) in rlimits.iter() {
        // SAFETY: setrlimit with a resource id bounds-checked at parse
        // time and a valid rlimit value
        let ret = unsafe { libc::setrlimit(libc::c_int::from(*resource) as _, limit) };
        if ret != 0 {
            return Err(SpawnError::Execution(format!(
                "setrlimit({resource}) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
    }

    Ok(())
}
