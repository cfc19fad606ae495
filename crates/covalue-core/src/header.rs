//! CoValue headers and content-derived ids.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::CryptoProvider;
use crate::error::Result;
use crate::ids::{AgentId, CoId, CO_ID_PREFIX};
use crate::stable::stable_bytes;

/// The collaborative data type a CoValue holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoValueType {
    Comap,
    Colist,
    Costream,
    Coplaintext,
}

/// Who may write to a CoValue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Ruleset {
    /// The CoValue is itself a group.
    #[serde(rename_all = "camelCase")]
    Group { initial_admin: AgentId },

    /// Writes are authorized by the roles of `group`.
    #[serde(rename_all = "camelCase")]
    OwnedByGroup {
        group: CoId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        restrict_deletion: Option<bool>,
    },

    UnsafeAllowAll,
}

/// Immutable description of a CoValue. Its stable hash is the CoValue id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoValueHeader {
    #[serde(rename = "type")]
    pub kind: CoValueType,
    pub ruleset: Ruleset,
    pub meta: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
    pub uniqueness: Value,
}

impl CoValueHeader {
    /// Header for a new group administered by `initial_admin`.
    pub fn group(initial_admin: AgentId, uniqueness: impl Into<Value>) -> Self {
        Self {
            kind: CoValueType::Comap,
            ruleset: Ruleset::Group { initial_admin },
            meta: Some(serde_json::json!({ "type": "group" })),
            created_at: None,
            uniqueness: uniqueness.into(),
        }
    }

    /// Header for a CoValue whose writes are governed by `group`.
    pub fn owned_by(
        kind: CoValueType,
        group: CoId,
        meta: Option<Value>,
        uniqueness: impl Into<Value>,
    ) -> Self {
        Self {
            kind,
            ruleset: Ruleset::OwnedByGroup {
                group,
                restrict_deletion: None,
            },
            meta,
            created_at: None,
            uniqueness: uniqueness.into(),
        }
    }

    pub fn with_created_at(mut self, created_at: u64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Compute the content-derived id: `co_z` + short hash of the stable header.
    pub fn id(&self, crypto: &dyn CryptoProvider) -> Result<CoId> {
        let short = crypto.short_hash(&stable_bytes(self)?);
        let suffix = short
            .as_str()
            .strip_prefix("shortHash_z")
            .unwrap_or(short.as_str());
        Ok(CoId::new_unchecked(format!("{}{}", CO_ID_PREFIX, suffix)))
    }

    pub fn is_group(&self) -> bool {
        matches!(self.ruleset, Ruleset::Group { .. })
    }

    /// The owning group, for `ownedByGroup` CoValues.
    pub fn owner_group(&self) -> Option<&CoId> {
        match &self.ruleset {
            Ruleset::OwnedByGroup { group, .. } => Some(group),
            _ => None,
        }
    }

    fn meta_type(&self) -> Option<&str> {
        self.meta.as_ref()?.get("type")?.as_str()
    }

    pub fn is_account(&self) -> bool {
        self.meta_type() == Some("account")
    }

    pub fn is_binary_stream(&self) -> bool {
        self.kind == CoValueType::Costream && self.meta_type() == Some("binary")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AgentSecret, DefaultCrypto};

    fn admin() -> AgentId {
        DefaultCrypto
            .agent_id(&AgentSecret::from_seed(&[1; 32]))
            .unwrap()
    }

    #[test]
    fn test_id_is_deterministic() {
        let crypto = DefaultCrypto;
        let a = CoValueHeader::group(admin(), "u1");
        let b = CoValueHeader::group(admin(), "u1");
        assert_eq!(a.id(&crypto).unwrap(), b.id(&crypto).unwrap());
        assert!(a.id(&crypto).unwrap().as_str().starts_with("co_z"));
    }

    #[test]
    fn test_uniqueness_changes_id() {
        let crypto = DefaultCrypto;
        let a = CoValueHeader::group(admin(), "u1");
        let b = CoValueHeader::group(admin(), "u2");
        assert_ne!(a.id(&crypto).unwrap(), b.id(&crypto).unwrap());
    }

    #[test]
    fn test_ruleset_wire_shape() {
        let group = CoId::new_unchecked("co_zgroup");
        let header = CoValueHeader::owned_by(CoValueType::Comap, group, None, "x");
        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(json["ruleset"]["type"], "ownedByGroup");
        assert_eq!(json["ruleset"]["group"], "co_zgroup");
        assert_eq!(json["type"], "comap");

        let back: CoValueHeader = serde_json::from_value(json).unwrap();
        assert_eq!(back, header);
    }
}
