//! Key revelations and key lineage.
//!
//! A group never stores a read key in the clear, except for the
//! `everyone` revelation. Keys are revealed by sealing them to a member's
//! sealer (`{key}_for_{agent}`), or by encrypting them under another key
//! (`{key}_for_{otherKey}`), which covers both rotation lineage and
//! revelations to parent groups.

use serde_json::{json, Value};
use std::collections::BTreeSet;

use covalue_core::{
    stable_bytes, AgentId, CoId, CoValueCore, CryptoProvider, Encrypted, Identity, KeyId,
    KeySecret, Privacy, Sealed, TransactionId,
};

use crate::error::Result;
use crate::role::Role;
use crate::state::{GroupEntry, GroupState};

pub const EVERYONE: &str = "everyone";
pub const PARENT_PREFIX: &str = "parent_";
pub const CHILD_PREFIX: &str = "child_";
pub const WRITE_KEY_PREFIX: &str = "writeKeyFor_";

const FOR: &str = "_for_";

/// `{key}_for_{keyOrAgent}` revelation field.
pub fn revelation_field(key_id: &KeyId, target: &str) -> String {
    format!("{}{}{}", key_id, FOR, target)
}

/// Key encrypted under another key.
pub fn is_key_for_key_field(field: &str) -> bool {
    field.starts_with("key_") && field.contains("_for_key")
}

/// Key sealed to an agent, or revealed to everyone.
pub fn is_key_for_account_field(field: &str) -> bool {
    (field.starts_with("key_") && (field.contains("_for_sealer") || field.contains("_for_co")))
        || field.contains("_for_everyone")
}

/// The key id a revelation field reveals.
pub fn revealed_key_id(field: &str) -> Option<&str> {
    field.find(FOR).map(|idx| &field[..idx])
}

fn revelation_nonce_material(group: &CoId, tx_id: &TransactionId) -> Result<Vec<u8>> {
    Ok(stable_bytes(&json!({ "in": group, "tx": tx_id }))?)
}

// ─────────────────────────────────────────────────────────────────────────────
// Writing
// ─────────────────────────────────────────────────────────────────────────────

/// Write a single `set` into a group.
pub(crate) fn set_entry(
    core: &mut CoValueCore,
    identity: &Identity,
    key: &str,
    value: Value,
    made_at: u64,
) -> Result<()> {
    let op = json!({ "op": "set", "key": key, "value": value });
    core.make_transaction(identity, &[op], Privacy::Trusting, None, made_at)?;
    Ok(())
}

/// Seal `key` to `to`, bound to the position of the transaction carrying it.
pub(crate) fn reveal_to_agent(
    core: &mut CoValueCore,
    identity: &Identity,
    key: (&KeyId, &KeySecret),
    to: &AgentId,
    made_at: u64,
) -> Result<()> {
    let tx_id = TransactionId {
        session_id: identity.session_id().clone(),
        tx_index: core.sessions().transaction_count(identity.session_id()),
    };
    let nonce = revelation_nonce_material(core.id(), &tx_id)?;
    let sealed = core.crypto().seal(
        key.1.as_str().as_bytes(),
        identity.secret(),
        &to.sealer_id(),
        &nonce,
    )?;
    set_entry(
        core,
        identity,
        &revelation_field(key.0, to.as_str()),
        json!(sealed),
        made_at,
    )
}

pub(crate) fn reveal_to_everyone(
    core: &mut CoValueCore,
    identity: &Identity,
    key: (&KeyId, &KeySecret),
    made_at: u64,
) -> Result<()> {
    set_entry(
        core,
        identity,
        &revelation_field(key.0, EVERYONE),
        json!(key.1.as_str()),
        made_at,
    )
}

/// Encrypt `key` under `encrypting` and store it as `{key}_for_{encrypting}`.
pub(crate) fn reveal_under_key(
    core: &mut CoValueCore,
    identity: &Identity,
    key: (&KeyId, &KeySecret),
    encrypting: (&KeyId, &KeySecret),
    made_at: u64,
) -> Result<()> {
    let encrypted = core.crypto().encrypt_key_secret(key, encrypting)?;
    set_entry(
        core,
        identity,
        &revelation_field(key.0, encrypting.0.as_str()),
        json!(encrypted),
        made_at,
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Reading
// ─────────────────────────────────────────────────────────────────────────────

/// Secret of `key_id`, as far as `identity` can reach it.
///
/// Tries the everyone revelation, then a sealed revelation to the reader,
/// then any key it was encrypted under (in this group or an ancestor).
pub fn read_key_by_id(
    state: &GroupState,
    crypto: &dyn CryptoProvider,
    identity: &Identity,
    key_id: &KeyId,
) -> Option<KeySecret> {
    let mut visited = BTreeSet::new();
    find_key(state, crypto, identity, key_id, &mut visited)
}

fn find_key(
    state: &GroupState,
    crypto: &dyn CryptoProvider,
    identity: &Identity,
    key_id: &KeyId,
    visited: &mut BTreeSet<(CoId, KeyId)>,
) -> Option<KeySecret> {
    if !visited.insert((state.id().clone(), key_id.clone())) {
        return None;
    }

    if let Some(secret) = state
        .get(&revelation_field(key_id, EVERYONE))
        .and_then(Value::as_str)
        .and_then(|s| KeySecret::parse(s).ok())
    {
        return Some(secret);
    }

    if let Some(entry) = state.entry(&revelation_field(key_id, identity.agent_id().as_str())) {
        if let Some(secret) = unseal_entry(state.id(), entry, crypto, identity) {
            return Some(secret);
        }
    }

    let prefix = revelation_field(key_id, "key_");
    for (field, entry) in state.entries_with_prefix(&prefix) {
        let Some(encrypting_id) = field.strip_prefix(&format!("{}{}", key_id, FOR)) else {
            continue;
        };
        let encrypting_id = KeyId::new_unchecked(encrypting_id);
        let Some(encrypting) = find_key(state, crypto, identity, &encrypting_id, visited) else {
            continue;
        };
        let Some(encrypted) = entry.as_str().map(Encrypted::new_unchecked) else {
            continue;
        };
        if let Ok(secret) =
            crypto.decrypt_key_secret(&encrypted, key_id, (&encrypting_id, &encrypting))
        {
            return Some(secret);
        }
    }

    state
        .parent_states()
        .find_map(|parent| find_key(parent, crypto, identity, key_id, visited))
}

fn unseal_entry(
    group: &CoId,
    entry: &GroupEntry,
    crypto: &dyn CryptoProvider,
    identity: &Identity,
) -> Option<KeySecret> {
    let sealed = Sealed::new_unchecked(entry.as_str()?);
    let nonce = revelation_nonce_material(group, &entry.tx_id).ok()?;
    let bytes = crypto
        .unseal(&sealed, identity.secret(), &entry.author.sealer_id(), &nonce)
        .ok()?;
    KeySecret::parse(&String::from_utf8(bytes).ok()?).ok()
}

/// The group's current read key.
pub fn current_read_key(
    state: &GroupState,
    crypto: &dyn CryptoProvider,
    identity: &Identity,
) -> Option<(KeyId, KeySecret)> {
    let key_id = state.read_key_id()?;
    let secret = read_key_by_id(state, crypto, identity, &key_id)?;
    Some((key_id, secret))
}

/// Key to encrypt new private transactions with.
///
/// Write-only members use their dedicated write key; everyone else the read key.
pub fn current_write_key(
    state: &GroupState,
    crypto: &dyn CryptoProvider,
    identity: &Identity,
) -> Option<(KeyId, KeySecret)> {
    let me = identity.agent_id();
    if state.role_of(me) == Some(Role::WriteOnly) {
        let key_id = state.write_key_for(me.as_str())?;
        let secret = read_key_by_id(state, crypto, identity, &key_id)?;
        return Some((key_id, secret));
    }
    current_read_key(state, crypto, identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_classification() {
        assert!(is_key_for_key_field("key_zA_for_key_zB"));
        assert!(is_key_for_account_field("key_zA_for_sealer_zX/signer_zY"));
        assert!(is_key_for_account_field("key_zA_for_everyone"));
        assert!(!is_key_for_account_field("readKey"));
        assert!(!is_key_for_key_field("parent_co_zP"));
    }

    #[test]
    fn test_revealed_key_id() {
        let field = revelation_field(&KeyId::new_unchecked("key_zA"), "sealer_zX/signer_zY");
        assert_eq!(revealed_key_id(&field), Some("key_zA"));
        assert_eq!(revealed_key_id("readKey"), None);
    }
}
