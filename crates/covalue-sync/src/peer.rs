//! What we know about one connected peer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use covalue_core::{CoId, KnownState};

use crate::batching::{BatchedOutgoingMessages, OutgoingConfig};
use crate::channel::OutgoingChannel;
use crate::load_queue::{LoadMode, LoadQueueConfig, OutgoingLoadQueue, TimeoutHook};
use crate::messages::{KnownStateMessage, PeerId, PeerMessage, SyncMessage};

/// Servers are asked for CoValues; clients are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Server,
    Client,
}

/// Per-peer sync bookkeeping.
///
/// `known_states` is what the peer told us; `optimistic` additionally counts
/// what we sent and assume arrived.
pub struct PeerState {
    id: PeerId,
    role: PeerRole,
    known_states: HashMap<CoId, KnownState>,
    optimistic: HashMap<CoId, KnownState>,
    told_known: HashSet<CoId>,
    outgoing: BatchedOutgoingMessages,
    load_queue: OutgoingLoadQueue,
    closed: bool,
}

impl PeerState {
    pub fn new(
        id: PeerId,
        role: PeerRole,
        channel: Arc<dyn OutgoingChannel>,
        outgoing: OutgoingConfig,
        loads: LoadQueueConfig,
        on_load_timeout: TimeoutHook,
    ) -> Self {
        Self {
            load_queue: OutgoingLoadQueue::new(id.clone(), loads, on_load_timeout),
            outgoing: BatchedOutgoingMessages::new(channel, outgoing),
            id,
            role,
            known_states: HashMap::new(),
            optimistic: HashMap::new(),
            told_known: HashSet::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn is_server(&self) -> bool {
        self.role == PeerRole::Server
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn outgoing(&self) -> &BatchedOutgoingMessages {
        &self.outgoing
    }

    pub fn load_queue(&self) -> &OutgoingLoadQueue {
        &self.load_queue
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Known states
    // ─────────────────────────────────────────────────────────────────────────

    pub fn known_state(&self, id: &CoId) -> Option<&KnownState> {
        self.known_states.get(id)
    }

    pub fn optimistic_known_state(&self, id: &CoId) -> Option<&KnownState> {
        self.optimistic.get(id)
    }

    /// Replace both views with what the peer claims.
    pub fn set_known_state(&mut self, known: KnownState) {
        self.optimistic.insert(known.id.clone(), known.clone());
        self.known_states.insert(known.id.clone(), known);
    }

    /// Merge a confirmed state into both views.
    pub fn combine_with(&mut self, known: &KnownState) {
        combine_into(&mut self.known_states, known);
        combine_into(&mut self.optimistic, known);
    }

    /// Record content we sent but the peer has not acknowledged.
    pub fn combine_optimistic_with(&mut self, known: &KnownState) {
        combine_into(&mut self.optimistic, known);
    }

    pub fn track_told_known_state(&mut self, id: &CoId) {
        self.told_known.insert(id.clone());
    }

    pub fn has_told_known_state(&self, id: &CoId) -> bool {
        self.told_known.contains(id)
    }

    /// The peer has talked about `id`, so it wants updates.
    pub fn is_subscribed(&self, id: &CoId) -> bool {
        self.known_states.contains_key(id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Egress
    // ─────────────────────────────────────────────────────────────────────────

    pub fn push(&self, msg: SyncMessage) {
        if self.closed {
            return;
        }
        self.outgoing.push(msg);
    }

    /// Queue a LOAD for `id` declaring `known`.
    pub fn send_load_request(&self, known: &KnownState, mode: LoadMode) {
        if self.closed {
            return;
        }
        let outgoing = self.outgoing.clone();
        let msg = SyncMessage::Load(KnownStateMessage::from_known(known));
        self.load_queue
            .enqueue(&known.id, move || outgoing.push(msg), mode);
    }

    /// Drop pending loads and close egress. Idempotent.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.load_queue.clear();
        self.outgoing.push(PeerMessage::Disconnected);
    }
}

fn combine_into(states: &mut HashMap<CoId, KnownState>, known: &KnownState) {
    match states.get_mut(&known.id) {
        Some(existing) => existing.combine(known),
        None => {
            states.insert(known.id.clone(), known.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::memory_channel;
    use covalue_core::SessionId;

    fn peer() -> (PeerState, crate::channel::memory::MemoryReceiver) {
        let (channel, receiver) = memory_channel(true);
        let state = PeerState::new(
            PeerId::new("p1"),
            PeerRole::Client,
            channel,
            OutgoingConfig::default(),
            LoadQueueConfig::default(),
            Arc::new(|_: &CoId| {}),
        );
        (state, receiver)
    }

    fn known(count: u32) -> KnownState {
        let mut known = KnownState::empty(CoId::new_unchecked("co_za"));
        known.header = true;
        known.sessions.insert(SessionId::new_unchecked("s"), count);
        known
    }

    #[tokio::test]
    async fn test_optimistic_runs_ahead_of_confirmed() {
        let (mut peer, _rx) = peer();
        let id = CoId::new_unchecked("co_za");
        assert!(!peer.is_subscribed(&id));

        peer.combine_with(&known(2));
        peer.combine_optimistic_with(&known(5));
        assert_eq!(peer.known_state(&id), Some(&known(2)));
        assert_eq!(peer.optimistic_known_state(&id), Some(&known(5)));

        peer.set_known_state(known(1));
        assert_eq!(peer.optimistic_known_state(&id), Some(&known(1)));
        assert!(peer.is_subscribed(&id));
    }

    #[tokio::test]
    async fn test_shutdown_stops_egress() {
        let (mut peer, mut rx) = peer();
        peer.push(SyncMessage::Done {
            id: CoId::new_unchecked("co_za"),
        });
        peer.shutdown();
        peer.push(SyncMessage::Done {
            id: CoId::new_unchecked("co_zb"),
        });

        let received = rx.drain_messages();
        assert_eq!(received.len(), 1);
        assert!(peer.outgoing().is_closed());
    }
}
