//! Roles and the permission lattice.
//!
//! `superAdmin > admin > writer > {reader, writeOnly}`. `reader` and
//! `writeOnly` are incomparable. Invite roles sit outside the lattice: they
//! never inherit and may only hand out their matching role.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A role as stored in a group map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    SuperAdmin,
    Admin,
    Writer,
    Reader,
    WriteOnly,
    Revoked,
    SuperAdminInvite,
    AdminInvite,
    WriterInvite,
    ReaderInvite,
    WriteOnlyInvite,
}

impl Role {
    /// Parse the string form used in group maps.
    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SuperAdmin => "superAdmin",
            Role::Admin => "admin",
            Role::Writer => "writer",
            Role::Reader => "reader",
            Role::WriteOnly => "writeOnly",
            Role::Revoked => "revoked",
            Role::SuperAdminInvite => "superAdminInvite",
            Role::AdminInvite => "adminInvite",
            Role::WriterInvite => "writerInvite",
            Role::ReaderInvite => "readerInvite",
            Role::WriteOnlyInvite => "writeOnlyInvite",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::SuperAdmin | Role::Admin)
    }

    /// Roles allowed to write to CoValues owned by the group.
    pub fn can_write(&self) -> bool {
        matches!(
            self,
            Role::SuperAdmin | Role::Admin | Role::Writer | Role::WriteOnly
        )
    }

    /// Roles that receive the group read key.
    pub fn can_read(&self) -> bool {
        matches!(
            self,
            Role::SuperAdmin
                | Role::Admin
                | Role::Writer
                | Role::Reader
                | Role::SuperAdminInvite
                | Role::AdminInvite
                | Role::WriterInvite
                | Role::ReaderInvite
        )
    }

    pub fn is_invite(&self) -> bool {
        self.invited_role().is_some()
    }

    /// The role an invite of this kind may grant.
    pub fn invited_role(&self) -> Option<Role> {
        match self {
            Role::SuperAdminInvite => Some(Role::SuperAdmin),
            Role::AdminInvite => Some(Role::Admin),
            Role::WriterInvite => Some(Role::Writer),
            Role::ReaderInvite => Some(Role::Reader),
            Role::WriteOnlyInvite => Some(Role::WriteOnly),
            _ => None,
        }
    }

    /// The invite role that grants `self`.
    pub fn invite_for(&self) -> Option<Role> {
        match self {
            Role::SuperAdmin => Some(Role::SuperAdminInvite),
            Role::Admin => Some(Role::AdminInvite),
            Role::Writer => Some(Role::WriterInvite),
            Role::Reader => Some(Role::ReaderInvite),
            Role::WriteOnly => Some(Role::WriteOnlyInvite),
            _ => None,
        }
    }

    /// Whether members holding this role in a parent group carry it into children.
    pub fn is_inheritable(&self) -> bool {
        matches!(
            self,
            Role::SuperAdmin | Role::Admin | Role::Writer | Role::Reader | Role::WriteOnly
        )
    }

    /// Roles `everyone` may hold.
    pub fn is_valid_for_everyone(&self) -> bool {
        matches!(
            self,
            Role::Reader | Role::Writer | Role::WriteOnly | Role::Revoked
        )
    }

    fn rank(&self) -> Option<u8> {
        match self {
            Role::SuperAdmin => Some(4),
            Role::Admin => Some(3),
            Role::Writer => Some(2),
            Role::Reader | Role::WriteOnly => Some(1),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `a` is strictly more permissive than `b`.
///
/// A missing or revoked `b` is beaten by any lattice role. Invite and revoked
/// roles are never higher than anything.
pub fn is_higher_role(a: Role, b: Option<Role>) -> bool {
    let Some(rank_a) = a.rank() else {
        return false;
    };
    match b.and_then(|b| b.rank()) {
        None => true,
        Some(rank_b) => rank_a > rank_b,
    }
}

/// How a child group refers to a parent: plain `extend` or a fixed role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentRole {
    Extend,
    Role(Role),
}

impl ParentRole {
    pub fn parse(s: &str) -> Option<Self> {
        if s == "extend" {
            Some(ParentRole::Extend)
        } else {
            Role::parse(s).map(ParentRole::Role)
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParentRole::Extend => "extend",
            ParentRole::Role(role) => role.as_str(),
        }
    }

    pub fn is_revoked(&self) -> bool {
        matches!(self, ParentRole::Role(Role::Revoked))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_lattice_order() {
        assert!(is_higher_role(Role::SuperAdmin, Some(Role::Admin)));
        assert!(is_higher_role(Role::Admin, Some(Role::Writer)));
        assert!(is_higher_role(Role::Writer, Some(Role::Reader)));
        assert!(is_higher_role(Role::Writer, Some(Role::WriteOnly)));
        assert!(!is_higher_role(Role::Reader, Some(Role::WriteOnly)));
        assert!(!is_higher_role(Role::WriteOnly, Some(Role::Reader)));
        assert!(!is_higher_role(Role::Admin, Some(Role::Admin)));
    }

    #[test]
    fn test_missing_and_revoked_are_lowest() {
        assert!(is_higher_role(Role::Reader, None));
        assert!(is_higher_role(Role::WriteOnly, Some(Role::Revoked)));
        assert!(!is_higher_role(Role::Revoked, None));
        assert!(!is_higher_role(Role::AdminInvite, None));
    }

    #[test]
    fn test_string_forms() {
        assert_eq!(Role::parse("writeOnlyInvite"), Some(Role::WriteOnlyInvite));
        assert_eq!(Role::parse("owner"), None);
        assert_eq!(
            serde_json::to_value(Role::SuperAdmin).unwrap(),
            serde_json::json!("superAdmin")
        );
        assert_eq!(ParentRole::parse("extend"), Some(ParentRole::Extend));
        assert!(ParentRole::parse("revoked").unwrap().is_revoked());
    }

    #[test]
    fn test_invites_map_to_roles() {
        for role in [
            Role::SuperAdmin,
            Role::Admin,
            Role::Writer,
            Role::Reader,
            Role::WriteOnly,
        ] {
            let invite = role.invite_for().unwrap();
            assert!(invite.is_invite());
            assert!(!invite.is_inheritable());
            assert_eq!(invite.invited_role(), Some(role));
        }
    }

    fn any_role() -> impl Strategy<Value = Role> {
        prop::sample::select(vec![
            Role::SuperAdmin,
            Role::Admin,
            Role::Writer,
            Role::Reader,
            Role::WriteOnly,
            Role::Revoked,
            Role::SuperAdminInvite,
            Role::AdminInvite,
            Role::WriterInvite,
            Role::ReaderInvite,
            Role::WriteOnlyInvite,
        ])
    }

    proptest! {
        #[test]
        fn prop_higher_role_is_asymmetric(a in any_role(), b in any_role()) {
            prop_assert!(!(is_higher_role(a, Some(b)) && is_higher_role(b, Some(a))));
        }

        #[test]
        fn prop_role_string_roundtrip(role in any_role()) {
            prop_assert_eq!(Role::parse(role.as_str()), Some(role));
        }
    }
}
