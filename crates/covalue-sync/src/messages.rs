//! Sync protocol message types.
//!
//! These messages are exchanged between peers to reconcile known states.
//! On the wire each message is a JSON object tagged by `action`; batched
//! frames join several objects with newlines.

use std::fmt;

use serde::{Deserialize, Serialize};

use covalue_core::{CoId, CoValuePriority, KnownSessions, KnownState, NewContent};

use crate::error::Result;

/// Identifier of a connected peer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random peer ID.
    pub fn random() -> Self {
        use rand::Rng;
        let suffix: u64 = rand::thread_rng().gen();
        Self(format!("peer_{:016x}", suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Body of LOAD and KNOWN messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownStateMessage {
    pub id: CoId,
    pub header: bool,
    pub sessions: KnownSessions,
    /// Set on KNOWN messages that ask the peer to resend from this state.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_correction: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl KnownStateMessage {
    pub fn from_known(known: &KnownState) -> Self {
        Self {
            id: known.id.clone(),
            header: known.header,
            sessions: known.sessions.clone(),
            is_correction: false,
        }
    }

    /// "I have nothing of `id`."
    pub fn not_found(id: CoId) -> Self {
        Self::from_known(&KnownState::empty(id))
    }

    pub fn correction(known: &KnownState) -> Self {
        Self {
            is_correction: true,
            ..Self::from_known(known)
        }
    }

    pub fn known_state(&self) -> KnownState {
        KnownState {
            id: self.id.clone(),
            header: self.header,
            sessions: self.sessions.clone(),
        }
    }
}

/// Sync protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum SyncMessage {
    /// Ask a peer for content, declaring what we have.
    Load(KnownStateMessage),

    /// Acknowledge or declare a known state.
    Known(KnownStateMessage),

    /// New transactions, possibly one piece of a stream.
    Content(NewContent),

    /// The peer is done with a CoValue.
    Done { id: CoId },
}

impl SyncMessage {
    pub fn id(&self) -> &CoId {
        match self {
            SyncMessage::Load(msg) | SyncMessage::Known(msg) => &msg.id,
            SyncMessage::Content(content) => &content.id,
            SyncMessage::Done { id } => id,
        }
    }

    /// Delivery priority. Only content can be deferred.
    pub fn priority(&self) -> CoValuePriority {
        match self {
            SyncMessage::Content(content) => content.priority,
            _ => CoValuePriority::High,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            SyncMessage::Load(_) => "load",
            SyncMessage::Known(_) => "known",
            SyncMessage::Content(_) => "content",
            SyncMessage::Done { .. } => "done",
        }
    }

    /// Serialize as a single wire frame.
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a frame holding one or more newline-joined messages.
    pub fn parse_frame(frame: &str) -> Result<Vec<SyncMessage>> {
        frame
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| Ok(serde_json::from_str(line)?))
            .collect()
    }
}

/// What a peer channel delivers or accepts: a message, or the end of the link.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    Sync(SyncMessage),
    Disconnected,
}

impl From<SyncMessage> for PeerMessage {
    fn from(msg: SyncMessage) -> Self {
        PeerMessage::Sync(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalue_core::SessionId;
    use serde_json::json;

    fn known(id: &str) -> KnownStateMessage {
        KnownStateMessage {
            id: CoId::new_unchecked(id),
            header: true,
            sessions: [(SessionId::new_unchecked("s1"), 3)].into_iter().collect(),
            is_correction: false,
        }
    }

    #[test]
    fn test_messages_are_tagged_by_action() {
        let value = serde_json::to_value(SyncMessage::Load(known("co_za"))).unwrap();
        assert_eq!(
            value,
            json!({"action": "load", "id": "co_za", "header": true, "sessions": {"s1": 3}})
        );

        let done = serde_json::to_value(SyncMessage::Done {
            id: CoId::new_unchecked("co_za"),
        })
        .unwrap();
        assert_eq!(done, json!({"action": "done", "id": "co_za"}));
    }

    #[test]
    fn test_correction_flag_roundtrips() {
        let msg = SyncMessage::Known(KnownStateMessage::correction(&known("co_zb").known_state()));
        let frame = msg.to_frame().unwrap();
        assert!(frame.contains("\"isCorrection\":true"));

        let parsed = SyncMessage::parse_frame(&frame).unwrap();
        assert_eq!(parsed, vec![msg]);
    }

    #[test]
    fn test_parse_batched_frame() {
        let a = SyncMessage::Known(known("co_za"));
        let b = SyncMessage::Done {
            id: CoId::new_unchecked("co_zb"),
        };
        let frame = format!("{}\n{}", a.to_frame().unwrap(), b.to_frame().unwrap());

        let parsed = SyncMessage::parse_frame(&frame).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].id().as_str(), "co_za");
        assert_eq!(parsed[1].action(), "done");
    }

    #[test]
    fn test_content_priority_drives_delivery() {
        let content = NewContent::new(CoId::new_unchecked("co_zc"), CoValuePriority::Low);
        assert_eq!(SyncMessage::Content(content).priority(), CoValuePriority::Low);
        assert_eq!(
            SyncMessage::Load(known("co_zc")).priority(),
            CoValuePriority::High
        );
    }

    #[test]
    fn test_garbage_frame_is_rejected() {
        assert!(SyncMessage::parse_frame("{\"action\":\"nope\"}").is_err());
    }
}
