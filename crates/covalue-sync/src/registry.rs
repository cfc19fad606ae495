//! Arena of CoValues held by a node, with their load progress.
//!
//! Every CoValue the node has heard of gets an entry. The entry holds the
//! verified core once a header is known, and per source (storage or a peer)
//! whether a load is pending, succeeded, or came back empty.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use covalue_core::{CoId, CoValueCore, CryptoProvider, KnownState, TransactionConfig};
use covalue_perms::CoValueArena;

use crate::messages::PeerId;

/// Where a load was attempted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadSource {
    Storage,
    Peer(PeerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLoad {
    Pending,
    Found,
    NotFound,
}

/// Overall state of a CoValue's load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Available,
    Deleted,
    Loading,
    Unavailable,
}

#[derive(Default)]
pub struct CoValueEntry {
    core: Option<CoValueCore>,
    sources: BTreeMap<LoadSource, SourceLoad>,
    errored_in: BTreeSet<PeerId>,
}

impl CoValueEntry {
    pub fn core(&self) -> Option<&CoValueCore> {
        self.core.as_ref()
    }

    pub fn status(&self) -> LoadStatus {
        match &self.core {
            Some(core) if core.is_deleted() => LoadStatus::Deleted,
            Some(_) => LoadStatus::Available,
            None if self.sources.values().any(|s| *s == SourceLoad::Pending) => LoadStatus::Loading,
            None => LoadStatus::Unavailable,
        }
    }

    pub fn source(&self, source: &LoadSource) -> Option<SourceLoad> {
        self.sources.get(source).copied()
    }
}

/// All CoValues of a node, keyed by id.
pub struct CoValueRegistry {
    entries: BTreeMap<CoId, CoValueEntry>,
    crypto: Arc<dyn CryptoProvider>,
    config: TransactionConfig,
}

impl CoValueRegistry {
    pub fn new(crypto: Arc<dyn CryptoProvider>, config: TransactionConfig) -> Self {
        Self {
            entries: BTreeMap::new(),
            crypto,
            config,
        }
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoProvider> {
        &self.crypto
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn entry(&self, id: &CoId) -> Option<&CoValueEntry> {
        self.entries.get(id)
    }

    fn entry_mut(&mut self, id: &CoId) -> &mut CoValueEntry {
        self.entries.entry(id.clone()).or_default()
    }

    pub fn is_available(&self, id: &CoId) -> bool {
        self.entries.get(id).map_or(false, |e| e.core.is_some())
    }

    pub fn status(&self, id: &CoId) -> LoadStatus {
        self.entries
            .get(id)
            .map_or(LoadStatus::Unavailable, CoValueEntry::status)
    }

    /// Known state of `id`; empty when nothing is held.
    pub fn known_state(&self, id: &CoId) -> KnownState {
        self.entries
            .get(id)
            .and_then(|e| e.core.as_ref())
            .map_or_else(|| KnownState::empty(id.clone()), |c| c.known_state().clone())
    }

    /// Ids of every CoValue with a core.
    pub fn available_ids(&self) -> Vec<CoId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.core.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn mark_pending(&mut self, id: &CoId, source: LoadSource) {
        let entry = self.entry_mut(id);
        if entry.core.is_none() {
            entry.sources.insert(source, SourceLoad::Pending);
        }
    }

    pub fn mark_found(&mut self, id: &CoId, source: LoadSource) {
        self.entry_mut(id).sources.insert(source, SourceLoad::Found);
    }

    /// The source has nothing for `id`. Ignored once the CoValue is available.
    pub fn mark_not_found(&mut self, id: &CoId, source: LoadSource) {
        let entry = self.entry_mut(id);
        if entry.core.is_none() {
            entry.sources.insert(source, SourceLoad::NotFound);
        }
    }

    /// Pending loads from `peer` will never complete.
    pub fn peer_disconnected(&mut self, peer: &PeerId) {
        let source = LoadSource::Peer(peer.clone());
        for entry in self.entries.values_mut() {
            if entry.sources.get(&source) == Some(&SourceLoad::Pending) {
                entry.sources.insert(source.clone(), SourceLoad::NotFound);
            }
        }
    }

    pub fn mark_errored(&mut self, id: &CoId, peer: &PeerId) {
        self.entry_mut(id).errored_in.insert(peer.clone());
    }

    pub fn is_errored_in(&self, id: &CoId, peer: &PeerId) -> bool {
        self.entries
            .get(id)
            .map_or(false, |e| e.errored_in.contains(peer))
    }
}

impl CoValueArena for CoValueRegistry {
    fn get(&self, id: &CoId) -> Option<&CoValueCore> {
        self.entries.get(id).and_then(|e| e.core.as_ref())
    }

    fn get_mut(&mut self, id: &CoId) -> Option<&mut CoValueCore> {
        self.entries.get_mut(id).and_then(|e| e.core.as_mut())
    }

    fn insert(&mut self, core: CoValueCore) {
        let id = core.id().clone();
        self.entry_mut(&id).core = Some(core);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalue_core::{AgentSecret, CoValueHeader, CoValueType, DefaultCrypto, Identity};

    fn registry() -> CoValueRegistry {
        CoValueRegistry::new(Arc::new(DefaultCrypto), TransactionConfig::default())
    }

    fn core() -> CoValueCore {
        let header = CoValueHeader::owned_by(
            CoValueType::Comap,
            CoId::new_unchecked("co_zgroup"),
            None,
            "r",
        );
        CoValueCore::new(header, Arc::new(DefaultCrypto), &TransactionConfig::default()).unwrap()
    }

    #[test]
    fn test_unavailable_once_every_source_misses() {
        let mut reg = registry();
        let id = CoId::new_unchecked("co_zmissing");
        let peer = PeerId::new("server");
        assert_eq!(reg.status(&id), LoadStatus::Unavailable);

        reg.mark_pending(&id, LoadSource::Storage);
        reg.mark_pending(&id, LoadSource::Peer(peer.clone()));
        reg.mark_not_found(&id, LoadSource::Storage);
        assert_eq!(reg.status(&id), LoadStatus::Loading);

        reg.peer_disconnected(&peer);
        assert_eq!(reg.status(&id), LoadStatus::Unavailable);
    }

    #[test]
    fn test_inserted_core_is_available_and_deletable() {
        let mut reg = registry();
        let mut core = core();
        let id = core.id().clone();
        let me = Identity::new(&DefaultCrypto, AgentSecret::from_seed(&[3; 32])).unwrap();
        reg.insert(core.clone());
        assert_eq!(reg.status(&id), LoadStatus::Available);
        assert_eq!(reg.available_ids(), vec![id.clone()]);

        core.delete(&me, 1).unwrap();
        reg.insert(core);
        assert_eq!(reg.status(&id), LoadStatus::Deleted);

        reg.mark_not_found(&id, LoadSource::Storage);
        assert_eq!(reg.entry(&id).unwrap().source(&LoadSource::Storage), None);
    }
}
