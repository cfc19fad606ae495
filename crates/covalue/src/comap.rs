//! Materialized CoMap contents.
//!
//! A CoMap is the last-writer-wins fold of its valid transactions in
//! `madeAt` order. Private transactions are decrypted with whatever key
//! the reading identity can reach; ones it cannot decrypt are skipped.

use std::collections::BTreeMap;

use covalue_core::{AgentId, CoId, CoValueCore, Identity, MapOp, Transaction};
use covalue_perms::{read_key_by_id, valid_transactions, CoValueArena, GroupState};
use serde_json::Value;

use crate::error::Result;

/// One key of a CoMap with its winning write.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEntry {
    pub value: Value,
    pub made_at: u64,
    pub author: AgentId,
}

/// Read-only snapshot of a CoMap.
#[derive(Debug, Clone, PartialEq)]
pub struct CoMapView {
    id: CoId,
    entries: BTreeMap<String, MapEntry>,
    skipped: usize,
}

impl CoMapView {
    /// Fold the valid transactions of `core` as seen by `identity`.
    pub fn materialize<A: CoValueArena + ?Sized>(
        arena: &A,
        core: &CoValueCore,
        identity: &Identity,
    ) -> Result<Self> {
        let owner = match core.header().owner_group() {
            Some(group) => Some(GroupState::load(arena, group)?),
            None => None,
        };

        let mut view = Self {
            id: core.id().clone(),
            entries: BTreeMap::new(),
            skipped: 0,
        };

        for logged in valid_transactions(arena, core)? {
            let key = match (&logged.tx, &owner) {
                (Transaction::Trusting(_), _) => None,
                (Transaction::Private(tx), Some(owner)) => {
                    match read_key_by_id(owner, core.crypto().as_ref(), identity, &tx.key_used) {
                        Some(secret) => Some(secret),
                        None => {
                            view.skipped += 1;
                            continue;
                        }
                    }
                }
                (Transaction::Private(_), None) => {
                    view.skipped += 1;
                    continue;
                }
            };

            let changes = match core.sessions().decrypt_transaction(
                &logged.id.session_id,
                logged.id.tx_index,
                key.as_ref(),
            ) {
                Ok(changes) => changes,
                Err(e) => {
                    tracing::debug!(id = %core.id(), error = %e, "Skipping undecryptable transaction");
                    view.skipped += 1;
                    continue;
                }
            };
            let Ok(ops) = serde_json::from_str::<Vec<MapOp>>(&changes) else {
                view.skipped += 1;
                continue;
            };
            for op in ops {
                view.apply(op, logged.made_at(), &logged.author);
            }
        }
        Ok(view)
    }

    fn apply(&mut self, op: MapOp, made_at: u64, author: &AgentId) {
        match op {
            MapOp::Set { key, value } => {
                self.entries.insert(
                    key,
                    MapEntry {
                        value,
                        made_at,
                        author: author.clone(),
                    },
                );
            }
            MapOp::Del { key } => {
                self.entries.remove(&key);
            }
        }
    }

    pub fn id(&self) -> &CoId {
        &self.id
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn entry(&self, key: &str) -> Option<&MapEntry> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Transactions that could not be read by this identity.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// The map as a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(k, e)| (k.clone(), e.value.clone()))
                .collect(),
        )
    }
}
