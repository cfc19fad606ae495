//! Error types for the permissions module.

use thiserror::Error;

use covalue_core::CoId;

use crate::role::Role;

/// Errors that can occur during group operations.
#[derive(Debug, Error)]
pub enum PermsError {
    /// The acting agent's role does not allow the requested assignment.
    #[error("cannot grant role {requested} while holding role {}", display_role(.actual))]
    RoleNotGrantable {
        requested: Role,
        actual: Option<Role>,
    },

    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The CoValue is not a group.
    #[error("not a group: {0}")]
    NotAGroup(CoId),

    /// A referenced CoValue is not loaded in the arena.
    #[error("covalue not loaded: {0}")]
    NotLoaded(CoId),

    /// No readable key for the group.
    #[error("no readable key in group {0}")]
    KeyUnavailable(CoId),

    /// The invite secret does not hold an invite role.
    #[error("invalid invite: {0}")]
    InvalidInvite(String),

    /// Core error.
    #[error("core error: {0}")]
    Core(#[from] covalue_core::CoreError),
}

fn display_role(role: &Option<Role>) -> &'static str {
    role.as_ref().map_or("none", Role::as_str)
}

/// Result type for permission operations.
pub type Result<T> = std::result::Result<T, PermsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_not_grantable_names_both_roles() {
        let err = PermsError::RoleNotGrantable {
            requested: Role::SuperAdmin,
            actual: Some(Role::Admin),
        };
        let msg = err.to_string();
        assert!(msg.contains("superAdmin"));
        assert!(msg.contains("admin"));

        let err = PermsError::RoleNotGrantable {
            requested: Role::Reader,
            actual: None,
        };
        assert!(err.to_string().contains("none"));
    }
}
