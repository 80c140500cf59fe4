//! Elevation checks for interface and route management

use crate::error::PivotError;

/// Whether the process runs with an effective uid of 0
#[cfg(unix)]
pub fn is_elevated() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub fn is_elevated() -> bool {
    false
}

/// Fail unless the process can create tun devices and edit routes
pub fn check_privileges() -> Result<(), PivotError> {
    if is_elevated() {
        return Ok(());
    }
    Err(PivotError::Privilege(
        "run with sudo or as root to manage interfaces and routes".to_string(),
    ))
}

/// The operator behind the run, even when invoked through sudo
///
/// Used as the owner of the tun device so the console can open it without
/// keeping root.
pub fn invoking_user() -> String {
    std::env::var("SUDO_USER")
        .ok()
        .filter(|user| !user.is_empty())
        .unwrap_or_else(whoami::username)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_matches_euid() {
        assert_eq!(check_privileges().is_ok(), is_elevated());
    }

    #[test]
    fn test_invoking_user_is_not_empty() {
        assert!(!invoking_user().is_empty());
    }
}
