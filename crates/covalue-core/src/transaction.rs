//! Transactions: the entries of a session log.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::crypto::{Encrypted, KeySecret};
use crate::error::Result;
use crate::ids::{CoId, KeyId, SessionId};
use crate::stable::stable_bytes;

/// One entry in a session log.
///
/// Trusting transactions carry plaintext stable JSON. Private ones carry the
/// same JSON encrypted under a group read key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "privacy", rename_all = "camelCase")]
pub enum Transaction {
    Private(PrivateTransaction),
    Trusting(TrustingTransaction),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateTransaction {
    pub made_at: u64,
    pub key_used: KeyId,
    pub encrypted_changes: Encrypted,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Encrypted>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustingTransaction {
    pub made_at: u64,
    pub changes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<String>,
}

impl Transaction {
    pub fn made_at(&self) -> u64 {
        match self {
            Transaction::Private(tx) => tx.made_at,
            Transaction::Trusting(tx) => tx.made_at,
        }
    }

    /// Bytes counted towards the signature checkpoint threshold.
    pub fn size(&self) -> usize {
        match self {
            Transaction::Private(tx) => {
                tx.encrypted_changes.as_str().len()
                    + tx.meta.as_ref().map_or(0, |m| m.as_str().len())
            }
            Transaction::Trusting(tx) => {
                tx.changes.len() + tx.meta.as_ref().map_or(0, String::len)
            }
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, Transaction::Private(_))
    }

    /// Plaintext meta of a trusting transaction.
    pub fn trusting_meta(&self) -> Option<Value> {
        match self {
            Transaction::Trusting(tx) => tx
                .meta
                .as_deref()
                .and_then(|m| serde_json::from_str(m).ok()),
            Transaction::Private(_) => None,
        }
    }
}

/// How a new transaction should be written.
#[derive(Debug, Clone)]
pub enum Privacy {
    Trusting,
    Private { key_id: KeyId, key_secret: KeySecret },
}

/// Nonce material binding a private transaction to its position.
pub fn transaction_nonce_material(id: &CoId, session_id: &SessionId, idx: usize) -> Result<Vec<u8>> {
    stable_bytes(&json!({
        "in": id,
        "tx": { "sessionID": session_id, "txIndex": idx },
    }))
}

/// Nonce material for the encrypted meta of a private transaction.
pub fn meta_nonce_material(id: &CoId, session_id: &SessionId, idx: usize) -> Result<Vec<u8>> {
    stable_bytes(&json!({
        "in": id,
        "tx": { "sessionID": session_id, "txIndex": idx },
        "meta": true,
    }))
}

/// A single CoMap operation. Groups are CoMaps too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum MapOp {
    Set { key: String, value: Value },
    Del { key: String },
}

impl MapOp {
    pub fn key(&self) -> &str {
        match self {
            MapOp::Set { key, .. } | MapOp::Del { key } => key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trusting_wire_shape() {
        let tx = Transaction::Trusting(TrustingTransaction {
            made_at: 42,
            changes: r#"[{"op":"set","key":"a","value":1}]"#.into(),
            meta: None,
        });
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["privacy"], "trusting");
        assert_eq!(json["madeAt"], 42);
        assert!(json.get("meta").is_none());
    }

    #[test]
    fn test_size_counts_payload_and_meta() {
        let tx = Transaction::Trusting(TrustingTransaction {
            made_at: 0,
            changes: "12345".into(),
            meta: Some("678".into()),
        });
        assert_eq!(tx.size(), 8);
    }

    #[test]
    fn test_map_op_shape() {
        let op: MapOp = serde_json::from_str(r#"{"op":"set","key":"k","value":"v"}"#).unwrap();
        assert_eq!(op.key(), "k");
        let del: MapOp = serde_json::from_str(r#"{"op":"del","key":"k"}"#).unwrap();
        assert_eq!(del, MapOp::Del { key: "k".into() });
    }
}
