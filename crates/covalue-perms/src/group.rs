//! Group operations.
//!
//! Every operation replays the group first, checks that the acting agent
//! may perform it, gathers every key it will need, and only then writes.
//! A rejected operation leaves the group untouched.

use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

use covalue_core::{
    AgentId, AgentSecret, CoId, CoValueCore, CoValueHeader, CryptoProvider, Identity, KeyId,
    KeySecret, LoggedTransaction, Ruleset, TransactionConfig,
};

use crate::arena::CoValueArena;
use crate::error::{PermsError, Result};
use crate::keys::{
    current_read_key, read_key_by_id, reveal_to_agent, reveal_to_everyone, reveal_under_key,
    set_entry, CHILD_PREFIX, EVERYONE, PARENT_PREFIX, WRITE_KEY_PREFIX,
};
use crate::role::{is_higher_role, ParentRole, Role};
use crate::state::{check_role_assignment, AssignmentDenial, GroupState};

/// Who a role assignment targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Member {
    Agent(AgentId),
    Everyone,
}

impl Member {
    /// The group map key for this member.
    pub fn key(&self) -> &str {
        match self {
            Member::Agent(agent) => agent.as_str(),
            Member::Everyone => EVERYONE,
        }
    }
}

fn core_mut<'a, A: CoValueArena + ?Sized>(
    arena: &'a mut A,
    id: &CoId,
) -> Result<&'a mut CoValueCore> {
    arena.get_mut(id).ok_or_else(|| PermsError::NotLoaded(id.clone()))
}

fn crypto_of<A: CoValueArena + ?Sized>(arena: &A, id: &CoId) -> Result<Arc<dyn CryptoProvider>> {
    arena
        .get(id)
        .map(|core| Arc::clone(core.crypto()))
        .ok_or_else(|| PermsError::NotLoaded(id.clone()))
}

fn require_admin(state: &GroupState, identity: &Identity, action: &str) -> Result<Option<Role>> {
    let role = state.validation_role(identity.agent_id().as_str());
    if role.map_or(false, |r| r.is_admin()) {
        Ok(role)
    } else {
        Err(PermsError::PermissionDenied(format!(
            "{} requires admin in {}, have {}",
            action,
            state.id(),
            role.map_or("none", |r| r.as_str())
        )))
    }
}

/// Secrets of every write-only key the identity can read.
fn readable_write_keys(
    state: &GroupState,
    crypto: &dyn CryptoProvider,
    identity: &Identity,
) -> Vec<(KeyId, KeySecret)> {
    state
        .write_keys()
        .into_iter()
        .filter_map(|(_, key_id)| {
            let secret = read_key_by_id(state, crypto, identity, &key_id)?;
            Some((key_id, secret))
        })
        .collect()
}

/// Current read keys of every active parent the identity can read.
fn readable_parent_keys(
    state: &GroupState,
    crypto: &dyn CryptoProvider,
    identity: &Identity,
) -> Vec<(KeyId, KeySecret)> {
    state
        .active_parents()
        .into_iter()
        .filter_map(|(parent_id, _)| {
            let parent = state.parent_state(&parent_id)?;
            let key = current_read_key(parent, crypto, identity);
            if key.is_none() {
                tracing::warn!(group = %state.id(), parent = %parent_id, "Parent read key not readable, skipping revelation");
            }
            key
        })
        .collect()
}

fn reading_members(state: &GroupState, except: Option<&str>) -> Vec<AgentId> {
    state
        .members()
        .into_iter()
        .filter(|(agent, role)| role.can_read() && Some(agent.as_str()) != except)
        .map(|(agent, _)| agent)
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Creation
// ─────────────────────────────────────────────────────────────────────────────

/// Create a group administered by `identity` and insert it into the arena.
pub fn create_group<A: CoValueArena + ?Sized>(
    arena: &mut A,
    identity: &Identity,
    crypto: Arc<dyn CryptoProvider>,
    config: &TransactionConfig,
    made_at: u64,
) -> Result<CoId> {
    let uniqueness = crypto.short_hash(&crypto.random_bytes(32));
    let header = CoValueHeader::group(identity.agent_id().clone(), uniqueness.as_str())
        .with_created_at(made_at);
    let mut core = CoValueCore::new(header, Arc::clone(&crypto), config)?;

    let me = identity.agent_id();
    set_entry(&mut core, identity, me.as_str(), json!(Role::Admin), made_at)?;
    let (key_id, secret) = crypto.new_random_key_secret();
    reveal_to_agent(&mut core, identity, (&key_id, &secret), me, made_at)?;
    set_entry(&mut core, identity, "readKey", json!(key_id), made_at)?;

    let id = core.id().clone();
    tracing::debug!(group = %id, "Created group");
    arena.insert(core);
    Ok(id)
}

// ─────────────────────────────────────────────────────────────────────────────
// Membership
// ─────────────────────────────────────────────────────────────────────────────

/// Assign `role` to `member`, revealing the keys that role is entitled to.
pub fn add_member<A: CoValueArena + ?Sized>(
    arena: &mut A,
    identity: &Identity,
    group_id: &CoId,
    member: &Member,
    role: Role,
    made_at: u64,
) -> Result<()> {
    let state = GroupState::load(arena, group_id)?;
    let crypto = crypto_of(arena, group_id)?;
    let me = identity.agent_id();
    let actor_role = state.validation_role(me.as_str());
    let target_role = state.validation_role(member.key());

    check_role_assignment(
        me.as_str(),
        actor_role,
        state.initial_admin().as_str(),
        member.key(),
        target_role,
        role,
    )
    .map_err(|denial| match denial {
        AssignmentDenial::InvalidForEveryone => PermsError::PermissionDenied(format!(
            "everyone can only be reader, writer or writeOnly, not {}",
            role
        )),
        AssignmentDenial::NotGrantable => PermsError::RoleNotGrantable {
            requested: role,
            actual: actor_role,
        },
    })?;

    let was_reading = target_role.map_or(false, |r| r.can_read());
    let read_key = if role.can_read() {
        Some(
            current_read_key(&state, crypto.as_ref(), identity)
                .ok_or_else(|| PermsError::KeyUnavailable(group_id.clone()))?,
        )
    } else {
        None
    };
    let write_keys = if role.can_read() {
        readable_write_keys(&state, crypto.as_ref(), identity)
    } else {
        Vec::new()
    };

    {
        let core = core_mut(arena, group_id)?;
        set_entry(core, identity, member.key(), json!(role), made_at)?;

        if let Some((key_id, secret)) = &read_key {
            match member {
                Member::Everyone => reveal_to_everyone(core, identity, (key_id, secret), made_at)?,
                Member::Agent(agent) => {
                    reveal_to_agent(core, identity, (key_id, secret), agent, made_at)?;
                    for (write_id, write_secret) in &write_keys {
                        reveal_to_agent(core, identity, (write_id, write_secret), agent, made_at)?;
                    }
                }
            }
        }
    }

    if role == Role::WriteOnly {
        if was_reading {
            rotate_read_key(arena, identity, group_id, Some(member), made_at)?;
        }
        if let Member::Agent(agent) = member {
            create_write_key(arena, identity, group_id, agent, made_at)?;
        }
    }

    tracing::debug!(group = %group_id, member = member.key(), %role, "Added member");
    Ok(())
}

/// Give a write-only member a dedicated key, revealed to them, to readers
/// and to parent groups.
fn create_write_key<A: CoValueArena + ?Sized>(
    arena: &mut A,
    identity: &Identity,
    group_id: &CoId,
    agent: &AgentId,
    made_at: u64,
) -> Result<()> {
    let state = GroupState::load(arena, group_id)?;
    let crypto = crypto_of(arena, group_id)?;
    let readers = reading_members(&state, Some(agent.as_str()));
    let parent_keys = readable_parent_keys(&state, crypto.as_ref(), identity);

    let (key_id, secret) = crypto.new_random_key_secret();
    let core = core_mut(arena, group_id)?;
    set_entry(
        core,
        identity,
        &format!("{}{}", WRITE_KEY_PREFIX, agent),
        json!(key_id),
        made_at,
    )?;
    reveal_to_agent(core, identity, (&key_id, &secret), agent, made_at)?;
    for reader in &readers {
        reveal_to_agent(core, identity, (&key_id, &secret), reader, made_at)?;
    }
    for (parent_key, parent_secret) in &parent_keys {
        reveal_under_key(core, identity, (&key_id, &secret), (parent_key, parent_secret), made_at)?;
    }
    Ok(())
}

/// Revoke `member`. Admins rotate the read key first; anyone may revoke themselves.
pub fn remove_member<A: CoValueArena + ?Sized>(
    arena: &mut A,
    identity: &Identity,
    group_id: &CoId,
    member: &Member,
    made_at: u64,
) -> Result<()> {
    let state = GroupState::load(arena, group_id)?;
    let me = identity.agent_id();
    let actor_role = state.validation_role(me.as_str());

    check_role_assignment(
        me.as_str(),
        actor_role,
        state.initial_admin().as_str(),
        member.key(),
        state.validation_role(member.key()),
        Role::Revoked,
    )
    .map_err(|_| PermsError::RoleNotGrantable {
        requested: Role::Revoked,
        actual: actor_role,
    })?;

    if actor_role.map_or(false, |r| r.is_admin()) {
        rotate_read_key(arena, identity, group_id, Some(member), made_at)?;
    }

    let core = core_mut(arena, group_id)?;
    set_entry(core, identity, member.key(), json!(Role::Revoked), made_at)?;
    tracing::debug!(group = %group_id, member = member.key(), "Removed member");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Key rotation
// ─────────────────────────────────────────────────────────────────────────────

/// Replace the read key, excluding `removed` from the new one.
///
/// A no-op while `everyone` can read, unless `everyone` is being removed.
/// Rotation recurses into child groups so their keys stop being reachable
/// through the old parent key.
pub fn rotate_read_key<A: CoValueArena + ?Sized>(
    arena: &mut A,
    identity: &Identity,
    group_id: &CoId,
    removed: Option<&Member>,
    made_at: u64,
) -> Result<()> {
    let mut visited = BTreeSet::new();
    rotate_inner(arena, identity, group_id, removed, made_at, &mut visited)
}

fn rotate_inner<A: CoValueArena + ?Sized>(
    arena: &mut A,
    identity: &Identity,
    group_id: &CoId,
    removed: Option<&Member>,
    made_at: u64,
    visited: &mut BTreeSet<CoId>,
) -> Result<()> {
    if !visited.insert(group_id.clone()) {
        return Ok(());
    }

    let state = GroupState::load(arena, group_id)?;
    let removing_everyone = removed == Some(&Member::Everyone);
    if state.everyone_role().map_or(false, |r| r.can_read()) && !removing_everyone {
        return Ok(());
    }
    require_admin(&state, identity, "key rotation")?;

    let crypto = crypto_of(arena, group_id)?;
    let (old_id, old_secret) = current_read_key(&state, crypto.as_ref(), identity)
        .ok_or_else(|| PermsError::KeyUnavailable(group_id.clone()))?;
    let removed_key = removed.map(Member::key);
    let readers = reading_members(&state, removed_key);
    let write_only: Vec<AgentId> = state
        .members()
        .into_iter()
        .filter(|(agent, role)| *role == Role::WriteOnly && Some(agent.as_str()) != removed_key)
        .map(|(agent, _)| agent)
        .collect();
    let parent_keys = readable_parent_keys(&state, crypto.as_ref(), identity);
    let children = state.children();

    let (new_id, new_secret) = crypto.new_random_key_secret();
    {
        let core = core_mut(arena, group_id)?;
        for reader in &readers {
            reveal_to_agent(core, identity, (&new_id, &new_secret), reader, made_at)?;
        }
        reveal_under_key(core, identity, (&old_id, &old_secret), (&new_id, &new_secret), made_at)?;
        set_entry(core, identity, "readKey", json!(new_id), made_at)?;
        for (parent_key, parent_secret) in &parent_keys {
            reveal_under_key(
                core,
                identity,
                (&new_id, &new_secret),
                (parent_key, parent_secret),
                made_at,
            )?;
        }

        for member in &write_only {
            let (write_id, write_secret) = crypto.new_random_key_secret();
            set_entry(
                core,
                identity,
                &format!("{}{}", WRITE_KEY_PREFIX, member),
                json!(write_id),
                made_at,
            )?;
            reveal_to_agent(core, identity, (&write_id, &write_secret), member, made_at)?;
            for reader in &readers {
                reveal_to_agent(core, identity, (&write_id, &write_secret), reader, made_at)?;
            }
            for (parent_key, parent_secret) in &parent_keys {
                reveal_under_key(
                    core,
                    identity,
                    (&write_id, &write_secret),
                    (parent_key, parent_secret),
                    made_at,
                )?;
            }
        }
    }
    tracing::debug!(group = %group_id, key = %new_id, "Rotated read key");

    for child in children {
        if child == *group_id {
            continue;
        }
        if arena.get(&child).is_none() {
            tracing::warn!(group = %group_id, %child, "Child group not loaded, skipping rotation");
            continue;
        }
        if let Err(e) = rotate_inner(arena, identity, &child, None, made_at, visited) {
            tracing::warn!(group = %group_id, %child, error = %e, "Child key rotation skipped");
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Extension
// ─────────────────────────────────────────────────────────────────────────────

/// Make `child` inherit members of `parent`, optionally capped at `role`.
pub fn extend<A: CoValueArena + ?Sized>(
    arena: &mut A,
    identity: &Identity,
    child_id: &CoId,
    parent_id: &CoId,
    role: Option<Role>,
    made_at: u64,
) -> Result<()> {
    if child_id == parent_id {
        return Ok(());
    }
    let parent = GroupState::load(arena, parent_id)?;
    if parent.has_ancestor(child_id) {
        tracing::debug!(child = %child_id, parent = %parent_id, "Extension would create a cycle, ignoring");
        return Ok(());
    }
    let child = GroupState::load(arena, child_id)?;
    require_admin(&child, identity, "extending")?;
    if parent.role_of(identity.agent_id()).is_none() {
        return Err(PermsError::PermissionDenied(format!(
            "extending requires membership in {}",
            parent_id
        )));
    }

    let mapping = match role {
        None => ParentRole::Extend,
        Some(role) if role.is_inheritable() => ParentRole::Role(role),
        Some(role) => {
            return Err(PermsError::PermissionDenied(format!(
                "{} cannot be inherited",
                role
            )))
        }
    };

    let crypto = crypto_of(arena, child_id)?;
    let (child_key, child_secret) = current_read_key(&child, crypto.as_ref(), identity)
        .ok_or_else(|| PermsError::KeyUnavailable(child_id.clone()))?;
    let (parent_key, parent_secret) = current_read_key(&parent, crypto.as_ref(), identity)
        .ok_or_else(|| PermsError::KeyUnavailable(parent_id.clone()))?;
    let write_keys = readable_write_keys(&child, crypto.as_ref(), identity);

    {
        let core = core_mut(arena, child_id)?;
        set_entry(
            core,
            identity,
            &format!("{}{}", PARENT_PREFIX, parent_id),
            json!(mapping.as_str()),
            made_at,
        )?;
        reveal_under_key(
            core,
            identity,
            (&child_key, &child_secret),
            (&parent_key, &parent_secret),
            made_at,
        )?;
        for (write_id, write_secret) in &write_keys {
            reveal_under_key(
                core,
                identity,
                (write_id, write_secret),
                (&parent_key, &parent_secret),
                made_at,
            )?;
        }
    }

    let core = core_mut(arena, parent_id)?;
    set_entry(
        core,
        identity,
        &format!("{}{}", CHILD_PREFIX, child_id),
        json!("extend"),
        made_at,
    )?;
    tracing::debug!(child = %child_id, parent = %parent_id, "Extended group");
    Ok(())
}

/// Cut the link between `child` and `parent` and rotate the child's key.
pub fn revoke_extend<A: CoValueArena + ?Sized>(
    arena: &mut A,
    identity: &Identity,
    child_id: &CoId,
    parent_id: &CoId,
    made_at: u64,
) -> Result<()> {
    let child = GroupState::load(arena, child_id)?;
    require_admin(&child, identity, "revoking an extension")?;
    if !child
        .active_parents()
        .iter()
        .any(|(parent, _)| parent == parent_id)
    {
        return Ok(());
    }

    set_entry(
        core_mut(arena, child_id)?,
        identity,
        &format!("{}{}", PARENT_PREFIX, parent_id),
        json!(Role::Revoked),
        made_at,
    )?;
    if let Some(parent) = arena.get_mut(parent_id) {
        set_entry(
            parent,
            identity,
            &format!("{}{}", CHILD_PREFIX, child_id),
            json!(Role::Revoked),
            made_at,
        )?;
    }
    rotate_read_key(arena, identity, child_id, None, made_at)
}

// ─────────────────────────────────────────────────────────────────────────────
// Invites
// ─────────────────────────────────────────────────────────────────────────────

/// Create an invite for `role`. The returned secret lets its holder join.
pub fn create_invite<A: CoValueArena + ?Sized>(
    arena: &mut A,
    identity: &Identity,
    group_id: &CoId,
    role: Role,
    made_at: u64,
) -> Result<AgentSecret> {
    let invite_role = role
        .invite_for()
        .ok_or_else(|| PermsError::InvalidInvite(format!("no invite for role {}", role)))?;
    let crypto = crypto_of(arena, group_id)?;
    let secret = crypto.new_agent_secret();
    let invite_agent = crypto.agent_id(&secret)?;
    add_member(
        arena,
        identity,
        group_id,
        &Member::Agent(invite_agent),
        invite_role,
        made_at,
    )?;
    Ok(secret)
}

/// Join `group_id` using an invite secret, writing as the invite agent.
pub fn accept_invite<A: CoValueArena + ?Sized>(
    arena: &mut A,
    invitee: &Identity,
    group_id: &CoId,
    invite_secret: &AgentSecret,
    made_at: u64,
) -> Result<()> {
    let crypto = crypto_of(arena, group_id)?;
    let invite = Identity::new(crypto.as_ref(), invite_secret.clone())?;
    let state = GroupState::load(arena, group_id)?;

    let invite_key = invite.agent_id().as_str();
    let (invite_role, granted) = state
        .validation_role(invite_key)
        .and_then(|r| Some((r, r.invited_role()?)))
        .ok_or_else(|| PermsError::InvalidInvite(format!("{} holds no invite", invite_key)))?;

    let me = invitee.agent_id();
    let current = state.role_of(me);
    if current == Some(granted) || current.map_or(false, |c| is_higher_role(c, Some(granted))) {
        return Ok(());
    }

    // Replay orders by madeAt; stay after the invite's own assignment.
    let made_at = state
        .entry(invite_key)
        .map_or(made_at, |e| made_at.max(e.made_at + 1));

    let read_key = if granted.can_read() {
        Some(
            current_read_key(&state, crypto.as_ref(), &invite)
                .ok_or_else(|| PermsError::KeyUnavailable(group_id.clone()))?,
        )
    } else {
        None
    };
    let write_keys = if granted.can_read() {
        readable_write_keys(&state, crypto.as_ref(), &invite)
    } else {
        Vec::new()
    };
    let readers = reading_members(&state, Some(invite_key));

    let core = core_mut(arena, group_id)?;
    set_entry(core, &invite, me.as_str(), json!(granted), made_at)?;
    if let Some((key_id, secret)) = &read_key {
        reveal_to_agent(core, &invite, (key_id, secret), me, made_at)?;
        for (write_id, write_secret) in &write_keys {
            reveal_to_agent(core, &invite, (write_id, write_secret), me, made_at)?;
        }
    }
    if granted == Role::WriteOnly {
        let (key_id, secret) = crypto.new_random_key_secret();
        set_entry(
            core,
            &invite,
            &format!("{}{}", WRITE_KEY_PREFIX, me),
            json!(key_id),
            made_at,
        )?;
        reveal_to_agent(core, &invite, (&key_id, &secret), me, made_at)?;
        for reader in &readers {
            reveal_to_agent(core, &invite, (&key_id, &secret), reader, made_at)?;
        }
    }
    tracing::debug!(group = %group_id, member = %me, role = %granted, invite = %invite_role, "Accepted invite");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Queries and validation
// ─────────────────────────────────────────────────────────────────────────────

/// Effective role of `agent` in the group.
pub fn role_of<A: CoValueArena + ?Sized>(
    arena: &A,
    group_id: &CoId,
    agent: &AgentId,
) -> Result<Option<Role>> {
    Ok(GroupState::load(arena, group_id)?.role_of(agent))
}

/// The group's current read key, if `identity` can reach it.
pub fn get_read_key<A: CoValueArena + ?Sized>(
    arena: &A,
    identity: &Identity,
    group_id: &CoId,
) -> Result<Option<(KeyId, KeySecret)>> {
    let state = GroupState::load(arena, group_id)?;
    let crypto = crypto_of(arena, group_id)?;
    Ok(current_read_key(&state, crypto.as_ref(), identity))
}

/// The transactions of `core` that its ruleset accepts.
///
/// Owned values accept a transaction when its author was `admin`,
/// `superAdmin`, `writer` or `writeOnly` in the owning group at `madeAt`.
/// Delete markers additionally require an admin.
pub fn valid_transactions<A: CoValueArena + ?Sized>(
    arena: &A,
    core: &CoValueCore,
) -> Result<Vec<LoggedTransaction>> {
    match &core.header().ruleset {
        Ruleset::UnsafeAllowAll => Ok(core.transactions()),
        Ruleset::Group { .. } => {
            let state = GroupState::replay(core, arena)?;
            Ok(core
                .transactions()
                .into_iter()
                .filter(|tx| state.is_valid(&tx.id))
                .collect())
        }
        Ruleset::OwnedByGroup { group, .. } => {
            let state = GroupState::load(arena, group)?;
            Ok(core
                .transactions()
                .into_iter()
                .filter(|tx| {
                    let role = state.role_of_at(tx.author.as_str(), Some(tx.made_at()));
                    if tx.id.session_id.is_delete_session() {
                        role.map_or(false, |r| r.is_admin())
                    } else {
                        role.map_or(false, |r| r.can_write())
                    }
                })
                .collect())
        }
    }
}

/// Whether `agent` may delete `core`. Groups are never deletable.
pub fn can_delete<A: CoValueArena + ?Sized>(
    arena: &A,
    core: &CoValueCore,
    agent: &AgentId,
) -> Result<bool> {
    match &core.header().ruleset {
        Ruleset::Group { .. } => Ok(false),
        Ruleset::UnsafeAllowAll => Ok(true),
        Ruleset::OwnedByGroup { group, .. } => Ok(role_of(arena, group, agent)?
            .map_or(false, |r| r.is_admin())),
    }
}
