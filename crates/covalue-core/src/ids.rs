//! Strong type definitions for covalue identifiers.
//!
//! All identifiers are string newtypes so they serialize exactly as they
//! appear on the wire and inside group maps.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a string without validating its prefix.
            pub fn new_unchecked(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Borrow the string form.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $label, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}

string_id!(
    /// Content-derived CoValue identifier: `co_z<base58>`.
    CoId,
    "CoId"
);
string_id!(
    /// Identifies one append-only log: `{agent}_session_z<suffix>`.
    ///
    /// Delete sessions use `{agent}_session_d<suffix>$`.
    SessionId,
    "SessionId"
);
string_id!(
    /// An acting principal: `sealer_z<base58>/signer_z<base58>`.
    AgentId,
    "AgentId"
);
string_id!(
    /// Ed25519 verifying key: `signer_z<base58>`.
    SignerId,
    "SignerId"
);
string_id!(
    /// X25519 public key: `sealer_z<base58>`.
    SealerId,
    "SealerId"
);
string_id!(
    /// Symmetric read key identifier: `key_z<base58>`.
    KeyId,
    "KeyId"
);

pub(crate) const CO_ID_PREFIX: &str = "co_z";
const SESSION_MARKER: &str = "_session_";
const DELETE_SESSION_MARKER: &str = "_session_d";

impl CoId {
    /// Parse a CoValue id, checking the prefix.
    pub fn parse(s: &str) -> Result<Self> {
        if s.starts_with(CO_ID_PREFIX) && s.len() > CO_ID_PREFIX.len() {
            Ok(Self(s.to_string()))
        } else {
            Err(CoreError::InvalidId(s.to_string()))
        }
    }
}

impl SessionId {
    /// Create a regular session for `agent` with an encoded random suffix.
    pub fn new(agent: &AgentId, suffix: &[u8]) -> Self {
        Self(format!(
            "{}{}z{}",
            agent,
            SESSION_MARKER,
            bs58::encode(suffix).into_string()
        ))
    }

    /// Create a delete session for `agent`.
    pub fn new_delete(agent: &AgentId, suffix: &[u8]) -> Self {
        Self(format!(
            "{}{}{}$",
            agent,
            DELETE_SESSION_MARKER,
            bs58::encode(suffix).into_string()
        ))
    }

    /// Parse a session id, checking that it names an agent.
    pub fn parse(s: &str) -> Result<Self> {
        let id = Self(s.to_string());
        id.agent_id()?;
        Ok(id)
    }

    /// The agent that owns this session.
    pub fn agent_id(&self) -> Result<AgentId> {
        let idx = self
            .0
            .find(SESSION_MARKER)
            .ok_or_else(|| CoreError::InvalidId(self.0.clone()))?;
        AgentId::parse(&self.0[..idx])
    }

    /// Whether this session may write to a deleted CoValue.
    pub fn is_delete_session(&self) -> bool {
        is_delete_session_id(&self.0)
    }
}

/// Delete sessions carry a `_session_d` marker and a trailing `$`.
pub fn is_delete_session_id(s: &str) -> bool {
    s.contains(DELETE_SESSION_MARKER) && s.ends_with('$')
}

impl AgentId {
    /// Build an agent id from its two public halves.
    pub fn from_parts(sealer: &SealerId, signer: &SignerId) -> Self {
        Self(format!("{}/{}", sealer, signer))
    }

    /// Parse an agent id, checking both halves.
    pub fn parse(s: &str) -> Result<Self> {
        let (sealer, signer) = s
            .split_once('/')
            .ok_or_else(|| CoreError::InvalidId(s.to_string()))?;
        if !sealer.starts_with("sealer_z") || !signer.starts_with("signer_z") {
            return Err(CoreError::InvalidId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// The X25519 half.
    pub fn sealer_id(&self) -> SealerId {
        let sealer = self.0.split('/').next().unwrap_or_default();
        SealerId(sealer.to_string())
    }

    /// The Ed25519 half.
    pub fn signer_id(&self) -> SignerId {
        let signer = self.0.split('/').nth(1).unwrap_or_default();
        SignerId(signer.to_string())
    }
}

impl SignerId {
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(format!("signer_z{}", bs58::encode(bytes).into_string()))
    }

    pub fn to_bytes(&self) -> Result<[u8; 32]> {
        decode_prefixed(&self.0, "signer_z")
    }
}

impl SealerId {
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(format!("sealer_z{}", bs58::encode(bytes).into_string()))
    }

    pub fn to_bytes(&self) -> Result<[u8; 32]> {
        decode_prefixed(&self.0, "sealer_z")
    }
}

impl KeyId {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(format!("key_z{}", bs58::encode(bytes).into_string()))
    }
}

/// Decode a `<prefix><base58>` string into a fixed 32-byte array.
pub(crate) fn decode_prefixed(s: &str, prefix: &str) -> Result<[u8; 32]> {
    let encoded = s
        .strip_prefix(prefix)
        .ok_or_else(|| CoreError::InvalidKey(s.to_string()))?;
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| CoreError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| CoreError::InvalidKey(format!("expected 32 bytes in {}", s)))
}

/// Position of one transaction: session plus index within it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionId {
    pub session_id: SessionId,
    pub tx_index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> AgentId {
        AgentId::from_parts(
            &SealerId::from_bytes(&[0x11; 32]),
            &SignerId::from_bytes(&[0x22; 32]),
        )
    }

    #[test]
    fn test_session_agent_roundtrip() {
        let agent = agent();
        let session = SessionId::new(&agent, &[1, 2, 3]);
        assert_eq!(session.agent_id().unwrap(), agent);
        assert!(!session.is_delete_session());
    }

    #[test]
    fn test_delete_session_marker() {
        let agent = agent();
        let session = SessionId::new_delete(&agent, &[9, 9]);
        assert!(session.is_delete_session());
        assert!(session.as_str().ends_with('$'));
        assert_eq!(session.agent_id().unwrap(), agent);
    }

    #[test]
    fn test_agent_halves() {
        let agent = agent();
        assert_eq!(agent.signer_id().to_bytes().unwrap(), [0x22; 32]);
        assert_eq!(agent.sealer_id().to_bytes().unwrap(), [0x11; 32]);
    }

    #[test]
    fn test_invalid_ids_rejected() {
        assert!(AgentId::parse("nobody").is_err());
        assert!(SessionId::parse("co_zabc").is_err());
        assert!(CoId::parse("co_z").is_err());
        assert!(CoId::parse("co_zabc").is_ok());
    }
}
