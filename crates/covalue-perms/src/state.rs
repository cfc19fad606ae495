//! Group state computation.
//!
//! Group state is computed by replaying the group's transactions in `madeAt`
//! order. Each transaction is validated against the member state built so
//! far; only valid ones contribute entries. Parent groups are replayed
//! recursively so inherited roles can be resolved.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use covalue_core::{
    AgentId, CoId, CoValueCore, KeyId, LoggedTransaction, MapOp, Ruleset, Transaction,
    TransactionId,
};

use crate::arena::CoValueArena;
use crate::error::{PermsError, Result};
use crate::keys::{
    is_key_for_account_field, is_key_for_key_field, revealed_key_id, CHILD_PREFIX, EVERYONE,
    PARENT_PREFIX, WRITE_KEY_PREFIX,
};
use crate::role::{is_higher_role, ParentRole, Role};

/// One accepted `set` in a group map.
#[derive(Debug, Clone)]
pub struct GroupEntry {
    /// The value that was set.
    pub value: Value,

    /// When the transaction was made.
    pub made_at: u64,

    /// Who made it.
    pub author: AgentId,

    /// Where it lives.
    pub tx_id: TransactionId,
}

impl GroupEntry {
    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }
}

/// Replayed state of one group.
#[derive(Debug, Clone)]
pub struct GroupState {
    /// The group's id.
    id: CoId,

    /// Admin named in the group header.
    initial_admin: AgentId,

    /// Accepted values per key, oldest first.
    entries: BTreeMap<String, Vec<GroupEntry>>,

    /// Roles used for validation, including those merged from parents.
    member_state: BTreeMap<String, Role>,

    /// Replayed parents, keyed by id. Cyclic or unloaded parents are absent.
    parents: BTreeMap<CoId, GroupState>,

    /// Transactions rejected during replay.
    invalid: BTreeSet<TransactionId>,
}

/// Why a role assignment was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentDenial {
    InvalidForEveryone,
    NotGrantable,
}

/// Decide whether `actor` (holding `actor_role`) may set `target` to `requested`.
///
/// `target_role` is the target's current role. Shared by replay and by the
/// write path so a locally accepted assignment always validates remotely.
pub fn check_role_assignment(
    actor: &str,
    actor_role: Option<Role>,
    initial_admin: &str,
    target: &str,
    target_role: Option<Role>,
    requested: Role,
) -> std::result::Result<(), AssignmentDenial> {
    if target == EVERYONE && !requested.is_valid_for_everyone() {
        return Err(AssignmentDenial::InvalidForEveryone);
    }

    // First self-promotion of the group's creator.
    if actor_role.is_none()
        && actor == initial_admin
        && target == actor
        && matches!(requested, Role::Admin | Role::SuperAdmin)
    {
        return Ok(());
    }

    if target == actor && requested == Role::Revoked {
        return Ok(());
    }

    match actor_role {
        Some(Role::SuperAdmin) => Ok(()),
        Some(Role::Admin) => {
            let denied = requested == Role::SuperAdmin
                || requested == Role::SuperAdminInvite
                || target_role == Some(Role::SuperAdmin)
                || (target_role == Some(Role::Admin) && requested != Role::Admin && target != actor);
            if denied {
                Err(AssignmentDenial::NotGrantable)
            } else {
                Ok(())
            }
        }
        Some(invite) if invite.is_invite() => {
            if invite.invited_role() == Some(requested) {
                Ok(())
            } else {
                Err(AssignmentDenial::NotGrantable)
            }
        }
        _ => Err(AssignmentDenial::NotGrantable),
    }
}

impl GroupState {
    /// Replay `core`, which must be a group, resolving parents from `arena`.
    pub fn replay<A: CoValueArena + ?Sized>(core: &CoValueCore, arena: &A) -> Result<Self> {
        let mut path = vec![core.id().clone()];
        let (state, _) = Self::replay_with_path(core, arena, &mut path)?;
        Ok(state)
    }

    /// Replay the group at `id` from the arena.
    pub fn load<A: CoValueArena + ?Sized>(arena: &A, id: &CoId) -> Result<Self> {
        let core = arena.get(id).ok_or_else(|| PermsError::NotLoaded(id.clone()))?;
        Self::replay(core, arena)
    }

    /// Returns the state plus the ids at which an extend cycle was cut.
    fn replay_with_path<A: CoValueArena + ?Sized>(
        core: &CoValueCore,
        arena: &A,
        path: &mut Vec<CoId>,
    ) -> Result<(Self, BTreeSet<CoId>)> {
        let Ruleset::Group { initial_admin } = &core.header().ruleset else {
            return Err(PermsError::NotAGroup(core.id().clone()));
        };

        let mut state = GroupState {
            id: core.id().clone(),
            initial_admin: initial_admin.clone(),
            entries: BTreeMap::new(),
            member_state: BTreeMap::new(),
            parents: BTreeMap::new(),
            invalid: BTreeSet::new(),
        };
        let mut cycles = BTreeSet::new();
        let mut write_only_keys: BTreeMap<String, String> = BTreeMap::new();

        for logged in core.transactions() {
            let accepted =
                state.apply(&logged, arena, path, &mut cycles, &mut write_only_keys);
            if !accepted {
                state.invalid.insert(logged.id.clone());
            }
        }

        Ok((state, cycles))
    }

    fn apply<A: CoValueArena + ?Sized>(
        &mut self,
        logged: &LoggedTransaction,
        arena: &A,
        path: &mut Vec<CoId>,
        cycles: &mut BTreeSet<CoId>,
        write_only_keys: &mut BTreeMap<String, String>,
    ) -> bool {
        let author = logged.author.as_str();
        let author_role = self.member_state.get(author).copied();

        let changes = match &logged.tx {
            Transaction::Private(_) => {
                if !author_role.map_or(false, |r| r.is_admin()) {
                    tracing::debug!(group = %self.id, "Only admins can make private transactions in groups");
                    return false;
                }
                return true;
            }
            Transaction::Trusting(tx) => tx.changes.as_str(),
        };

        let ops: Vec<MapOp> = match serde_json::from_str(changes) {
            Ok(ops) => ops,
            Err(_) => {
                tracing::debug!(group = %self.id, "Invalid JSON in group transaction");
                return false;
            }
        };
        let [MapOp::Set { key, value }] = ops.as_slice() else {
            tracing::debug!(group = %self.id, "Group transaction must be exactly one set");
            return false;
        };

        let is_admin = author_role.map_or(false, |r| r.is_admin());

        let valid = if matches!(key.as_str(), "readKey" | "profile" | "root") {
            is_admin
        } else if is_key_for_key_field(key) || is_key_for_account_field(key) {
            let own_write_key = write_only_keys
                .get(author)
                .map_or(false, |k| revealed_key_id(key) == Some(k.as_str()));
            is_admin || author_role.map_or(false, |r| r.is_invite()) || own_write_key
        } else if let Some(parent) = key.strip_prefix(PARENT_PREFIX) {
            is_admin && self.apply_parent(CoId::new_unchecked(parent), value, arena, path, cycles)
        } else if key.starts_with(CHILD_PREFIX) {
            true
        } else if let Some(member) = key.strip_prefix(WRITE_KEY_PREFIX) {
            let may_set = is_admin
                || matches!(
                    author_role,
                    Some(Role::SuperAdminInvite) | Some(Role::WriteOnlyInvite)
                )
                || member == author;
            let overrides = self.entries.contains_key(key.as_str()) && !is_admin;
            if may_set && !overrides {
                if let Some(key_id) = value.as_str() {
                    write_only_keys.insert(member.to_string(), key_id.to_string());
                }
                true
            } else {
                false
            }
        } else {
            let Some(requested) = value.as_str().and_then(Role::parse) else {
                tracing::debug!(group = %self.id, "Group transaction must set a valid role");
                return false;
            };
            let target_role = self.member_state.get(key.as_str()).copied();
            match check_role_assignment(
                author,
                author_role,
                self.initial_admin.as_str(),
                key,
                target_role,
                requested,
            ) {
                Ok(()) => {
                    self.member_state.insert(key.clone(), requested);
                    true
                }
                Err(denial) => {
                    tracing::debug!(group = %self.id, ?denial, "Role assignment rejected");
                    false
                }
            }
        };

        if valid {
            self.entries.entry(key.clone()).or_default().push(GroupEntry {
                value: value.clone(),
                made_at: logged.made_at(),
                author: logged.author.clone(),
                tx_id: logged.id.clone(),
            });
        }
        valid
    }

    fn apply_parent<A: CoValueArena + ?Sized>(
        &mut self,
        parent_id: CoId,
        value: &Value,
        arena: &A,
        path: &mut Vec<CoId>,
        cycles: &mut BTreeSet<CoId>,
    ) -> bool {
        let Some(mapping) = value.as_str().and_then(ParentRole::parse) else {
            return false;
        };
        if path.contains(&parent_id) {
            tracing::debug!(group = %self.id, parent = %parent_id, "Circular extend detected, dropping the transaction");
            cycles.insert(parent_id);
            return false;
        }
        let Some(parent_core) = arena.get(&parent_id) else {
            return true;
        };

        path.push(parent_id.clone());
        let replayed = Self::replay_with_path(parent_core, arena, path);
        path.pop();

        let Ok((parent, parent_cycles)) = replayed else {
            return false;
        };
        if parent_cycles.contains(&self.id) {
            tracing::debug!(group = %self.id, parent = %parent_id, "Circular extend detected, dropping the transaction");
            cycles.extend(parent_cycles.into_iter().filter(|c| *c != self.id));
            return false;
        }
        cycles.extend(parent_cycles);

        if !mapping.is_revoked() {
            for (member, parent_role) in &parent.member_state {
                let Some(effective) = inherited_role(*parent_role, mapping) else {
                    continue;
                };
                let current = self.member_state.get(member).copied();
                if is_higher_role(effective, current) {
                    self.member_state.insert(member.clone(), effective);
                }
            }
        }
        self.parents.insert(parent_id, parent);
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn id(&self) -> &CoId {
        &self.id
    }

    pub fn initial_admin(&self) -> &AgentId {
        &self.initial_admin
    }

    /// Latest accepted entry for `key`.
    pub fn entry(&self, key: &str) -> Option<&GroupEntry> {
        self.entries.get(key)?.last()
    }

    /// Latest accepted value for `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entry(key).map(|e| &e.value)
    }

    /// Latest accepted entry for `key` made at or before `at`.
    pub fn entry_at(&self, key: &str, at: Option<u64>) -> Option<&GroupEntry> {
        let history = self.entries.get(key)?;
        match at {
            None => history.last(),
            Some(at) => history.iter().rev().find(|e| e.made_at <= at),
        }
    }

    /// Latest entries of every key starting with `prefix`.
    pub fn entries_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a GroupEntry)> + 'a {
        self.entries
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .filter_map(|(k, history)| history.last().map(|e| (k.as_str(), e)))
    }

    pub fn read_key_id(&self) -> Option<KeyId> {
        self.get("readKey")
            .and_then(Value::as_str)
            .map(KeyId::new_unchecked)
    }

    /// Role of `member` as written in this group, ignoring parents.
    pub fn direct_role_at(&self, member: &str, at: Option<u64>) -> Option<Role> {
        self.entry_at(member, at)
            .and_then(GroupEntry::as_str)
            .and_then(Role::parse)
    }

    /// Role used when validating transactions authored by `member`.
    pub fn validation_role(&self, member: &str) -> Option<Role> {
        self.member_state.get(member).copied()
    }

    /// Effective role of `member`, resolving parents and `everyone`.
    pub fn role_of(&self, member: &AgentId) -> Option<Role> {
        self.role_of_at(member.as_str(), None)
    }

    /// Effective role of `member` at time `at` (`None` for now).
    ///
    /// A revoked local role counts as none. Parent roles are inherited only
    /// when strictly more permissive; `everyone` is the fallback.
    pub fn role_of_at(&self, member: &str, at: Option<u64>) -> Option<Role> {
        let mut visited = BTreeSet::new();
        self.role_of_inner(member, at, &mut visited)
    }

    fn role_of_inner(
        &self,
        member: &str,
        at: Option<u64>,
        visited: &mut BTreeSet<CoId>,
    ) -> Option<Role> {
        visited.insert(self.id.clone());
        let mut role = self
            .direct_role_at(member, at)
            .filter(|r| *r != Role::Revoked);

        for (parent_id, mapping) in self.parent_refs_at(at) {
            if mapping.is_revoked() || visited.contains(&parent_id) {
                continue;
            }
            let Some(parent) = self.parents.get(&parent_id) else {
                continue;
            };
            let Some(parent_role) = parent.role_of_inner(member, at, visited) else {
                continue;
            };
            if let Some(effective) = inherited_role(parent_role, mapping) {
                if is_higher_role(effective, role) {
                    role = Some(effective);
                }
            }
        }

        if role.is_none() {
            role = self
                .direct_role_at(EVERYONE, at)
                .filter(|r| *r != Role::Revoked);
        }
        role
    }

    pub fn everyone_role(&self) -> Option<Role> {
        self.direct_role_at(EVERYONE, None)
            .filter(|r| *r != Role::Revoked)
    }

    /// Agents with a direct, non-revoked role.
    pub fn members(&self) -> Vec<(AgentId, Role)> {
        self.entries
            .keys()
            .filter_map(|key| AgentId::parse(key).ok())
            .filter_map(|agent| {
                let role = self.direct_role_at(agent.as_str(), None)?;
                (role != Role::Revoked).then_some((agent, role))
            })
            .collect()
    }

    /// Parent references in effect at `at`, including revoked ones.
    pub fn parent_refs_at(&self, at: Option<u64>) -> Vec<(CoId, ParentRole)> {
        self.entries
            .keys()
            .filter_map(|key| key.strip_prefix(PARENT_PREFIX))
            .filter_map(|parent| {
                let key = format!("{}{}", PARENT_PREFIX, parent);
                let mapping = self
                    .entry_at(&key, at)?
                    .as_str()
                    .and_then(ParentRole::parse)?;
                Some((CoId::new_unchecked(parent), mapping))
            })
            .collect()
    }

    /// Non-revoked parent references, current.
    pub fn active_parents(&self) -> Vec<(CoId, ParentRole)> {
        self.parent_refs_at(None)
            .into_iter()
            .filter(|(_, mapping)| !mapping.is_revoked())
            .collect()
    }

    pub fn parent_state(&self, id: &CoId) -> Option<&GroupState> {
        self.parents.get(id)
    }

    /// Every replayed parent, revoked references included.
    pub fn parent_states(&self) -> impl Iterator<Item = &GroupState> {
        self.parents.values()
    }

    /// Whether `id` is this group or one of its ancestors.
    pub fn has_ancestor(&self, id: &CoId) -> bool {
        if self.id == *id {
            return true;
        }
        self.parents.values().any(|p| p.has_ancestor(id))
    }

    /// Children currently extending this group.
    pub fn children(&self) -> Vec<CoId> {
        self.entries_with_prefix(CHILD_PREFIX)
            .filter(|(_, entry)| entry.as_str() == Some("extend"))
            .filter_map(|(key, _)| key.strip_prefix(CHILD_PREFIX))
            .map(CoId::new_unchecked)
            .collect()
    }

    /// Write-only keys per member, current.
    pub fn write_keys(&self) -> Vec<(String, KeyId)> {
        self.entries_with_prefix(WRITE_KEY_PREFIX)
            .filter_map(|(key, entry)| {
                let member = key.strip_prefix(WRITE_KEY_PREFIX)?;
                Some((member.to_string(), KeyId::new_unchecked(entry.as_str()?)))
            })
            .collect()
    }

    pub fn write_key_for(&self, member: &str) -> Option<KeyId> {
        self.get(&format!("{}{}", WRITE_KEY_PREFIX, member))
            .and_then(Value::as_str)
            .map(KeyId::new_unchecked)
    }

    /// Whether the transaction was accepted during replay.
    pub fn is_valid(&self, tx_id: &TransactionId) -> bool {
        !self.invalid.contains(tx_id)
    }

    pub fn invalid_transactions(&self) -> &BTreeSet<TransactionId> {
        &self.invalid
    }
}

/// The role a parent member carries into the child, if any.
fn inherited_role(parent_role: Role, mapping: ParentRole) -> Option<Role> {
    if !parent_role.is_inheritable() {
        return None;
    }
    let effective = match mapping {
        ParentRole::Extend => parent_role,
        ParentRole::Role(role) => role,
    };
    effective.is_inheritable().then_some(effective)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADMIN: &str = "admin_agent";

    #[test]
    fn test_initial_admin_self_promotion() {
        assert!(check_role_assignment(ADMIN, None, ADMIN, ADMIN, None, Role::Admin).is_ok());
        assert!(check_role_assignment("other", None, ADMIN, "other", None, Role::Admin).is_err());
    }

    #[test]
    fn test_admin_limits() {
        let admin = Some(Role::Admin);
        assert!(check_role_assignment(ADMIN, admin, ADMIN, "b", None, Role::Writer).is_ok());
        assert_eq!(
            check_role_assignment(ADMIN, admin, ADMIN, "b", None, Role::SuperAdmin),
            Err(AssignmentDenial::NotGrantable)
        );
        assert!(
            check_role_assignment(ADMIN, admin, ADMIN, "b", None, Role::SuperAdminInvite).is_err()
        );
        assert!(check_role_assignment(
            ADMIN,
            admin,
            ADMIN,
            "b",
            Some(Role::SuperAdmin),
            Role::Reader
        )
        .is_err());
        assert!(
            check_role_assignment(ADMIN, admin, ADMIN, "b", Some(Role::Admin), Role::Reader)
                .is_err()
        );
        // Self-downgrade is fine.
        assert!(
            check_role_assignment(ADMIN, admin, ADMIN, ADMIN, Some(Role::Admin), Role::Reader)
                .is_ok()
        );
    }

    #[test]
    fn test_non_admins_cannot_grant() {
        for role in [Role::Writer, Role::Reader, Role::WriteOnly] {
            assert!(
                check_role_assignment("w", Some(role), ADMIN, "b", None, Role::Reader).is_err()
            );
            assert!(
                check_role_assignment("w", Some(role), ADMIN, "w", Some(role), Role::Revoked)
                    .is_ok()
            );
        }
    }

    #[test]
    fn test_invites_grant_only_matching_role() {
        let invite = Some(Role::WriterInvite);
        assert!(check_role_assignment("i", invite, ADMIN, "b", None, Role::Writer).is_ok());
        assert!(check_role_assignment("i", invite, ADMIN, "b", None, Role::Admin).is_err());
    }

    #[test]
    fn test_everyone_roles_restricted() {
        let sa = Some(Role::SuperAdmin);
        assert!(check_role_assignment(ADMIN, sa, ADMIN, EVERYONE, None, Role::Writer).is_ok());
        assert_eq!(
            check_role_assignment(ADMIN, sa, ADMIN, EVERYONE, None, Role::Admin),
            Err(AssignmentDenial::InvalidForEveryone)
        );
    }

    #[test]
    fn test_inherited_role_mapping() {
        assert_eq!(
            inherited_role(Role::Admin, ParentRole::Extend),
            Some(Role::Admin)
        );
        assert_eq!(
            inherited_role(Role::Admin, ParentRole::Role(Role::Reader)),
            Some(Role::Reader)
        );
        assert_eq!(inherited_role(Role::AdminInvite, ParentRole::Extend), None);
    }
}
