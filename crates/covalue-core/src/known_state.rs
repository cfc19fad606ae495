//! Known state: how much of a CoValue a node holds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::{CoId, SessionId};

/// Transaction count per session.
pub type KnownSessions = BTreeMap<SessionId, u32>;

/// Compact summary of what a node has of one CoValue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownState {
    pub id: CoId,
    pub header: bool,
    pub sessions: KnownSessions,
}

impl KnownState {
    /// Nothing known: no header, no sessions.
    pub fn empty(id: CoId) -> Self {
        Self {
            id,
            header: false,
            sessions: BTreeMap::new(),
        }
    }

    /// Per-session maximum of both states. The header flag is or-ed.
    pub fn combine(&mut self, other: &KnownState) {
        self.header |= other.header;
        combine_sessions(&mut self.sessions, &other.sessions);
    }

    /// Whether every session count in `self` is covered by `other`.
    pub fn is_subset_of(&self, other: &KnownState) -> bool {
        is_sessions_subset(&self.sessions, &other.sessions)
    }

    /// Total transactions known across sessions.
    pub fn total(&self) -> u64 {
        self.sessions.values().map(|c| u64::from(*c)).sum()
    }
}

/// Merge `from` into `into`, keeping the larger count per session.
pub fn combine_sessions(into: &mut KnownSessions, from: &KnownSessions) {
    for (session, count) in from {
        let entry = into.entry(session.clone()).or_insert(0);
        if *count > *entry {
            *entry = *count;
        }
    }
}

pub fn is_sessions_subset(a: &KnownSessions, b: &KnownSessions) -> bool {
    a.iter()
        .all(|(session, count)| b.get(session).copied().unwrap_or(0) >= *count)
}

/// Sessions where `target` is ahead of `current`, with the target counts.
pub fn sessions_to_send(current: &KnownSessions, target: &KnownSessions) -> KnownSessions {
    target
        .iter()
        .filter(|(session, count)| current.get(*session).copied().unwrap_or(0) < **count)
        .map(|(session, count)| (session.clone(), *count))
        .collect()
}

/// Whether a peer at `peer` already has everything in `ours`.
pub fn peer_has_all_content(ours: &KnownState, peer: &KnownState) -> bool {
    if ours.header && !peer.header {
        return false;
    }
    ours.is_subset_of(peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::new_unchecked(s)
    }

    fn state(header: bool, sessions: &[(&str, u32)]) -> KnownState {
        KnownState {
            id: CoId::new_unchecked("co_ztest"),
            header,
            sessions: sessions.iter().map(|(s, c)| (sid(s), *c)).collect(),
        }
    }

    #[test]
    fn test_combine_takes_max() {
        let mut a = state(false, &[("s1", 3), ("s2", 1)]);
        let b = state(true, &[("s1", 2), ("s2", 5), ("s3", 1)]);
        a.combine(&b);
        assert!(a.header);
        assert_eq!(a.sessions[&sid("s1")], 3);
        assert_eq!(a.sessions[&sid("s2")], 5);
        assert_eq!(a.sessions[&sid("s3")], 1);
    }

    #[test]
    fn test_subset() {
        let a = state(true, &[("s1", 2)]);
        let b = state(true, &[("s1", 2), ("s2", 1)]);
        assert!(a.is_subset_of(&b));
        assert!(!b.is_subset_of(&a));
    }

    #[test]
    fn test_sessions_to_send() {
        let current = state(true, &[("s1", 2)]);
        let target = state(true, &[("s1", 2), ("s2", 4)]);
        let diff = sessions_to_send(&current.sessions, &target.sessions);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[&sid("s2")], 4);
    }

    #[test]
    fn test_peer_has_all_content_needs_header() {
        let ours = state(true, &[]);
        let peer = state(false, &[]);
        assert!(!peer_has_all_content(&ours, &peer));
        assert!(peer_has_all_content(&ours, &state(true, &[])));
    }
}
