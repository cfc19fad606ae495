//! Sync manager: known-state reconciliation between this node, its storage
//! and its peers.
//!
//! All CoValues and peer bookkeeping live behind one mutex. Handlers lock
//! it, do their synchronous work, and release it before any storage or
//! peer wait; outgoing messages are queued on each peer's batched egress,
//! which never blocks.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use covalue_core::{
    peer_has_all_content, CoId, CoValueCore, CryptoProvider, KnownState, NewContent,
    SessionNewContent, TransactionConfig,
};
use covalue_perms::CoValueArena;
use covalue_store::{CorrectionCallback, StorageApi, SyncStateUpdate};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::batching::OutgoingConfig;
use crate::channel::memory::MemoryReceiver;
use crate::channel::OutgoingChannel;
use crate::error::{Result, SyncError};
use crate::load_queue::{LoadMode, LoadQueueConfig, TimeoutHook};
use crate::messages::{KnownStateMessage, PeerId, PeerMessage, SyncMessage};
use crate::peer::{PeerRole, PeerState};
use crate::registry::{CoValueRegistry, LoadSource, LoadStatus};

/// Peer id recorded for local writes made while no server peer is connected.
const NO_PEER: &str = "";

/// Sync tuning.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub load_queue: LoadQueueConfig,
    pub outgoing: OutgoingConfig,
    /// How long [`SyncManager::load`] waits for server peers.
    pub load_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            load_queue: LoadQueueConfig::default(),
            outgoing: OutgoingConfig::default(),
            load_timeout: Duration::from_secs(60),
        }
    }
}

/// Result of [`SyncManager::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Available,
    Unavailable,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ContentSource {
    Storage,
    Peer(PeerId),
}

impl ContentSource {
    fn load_source(&self) -> LoadSource {
        match self {
            ContentSource::Storage => LoadSource::Storage,
            ContentSource::Peer(peer) => LoadSource::Peer(peer.clone()),
        }
    }
}

struct SyncState {
    registry: CoValueRegistry,
    peers: BTreeMap<PeerId, PeerState>,
}

struct Inner {
    state: Mutex<SyncState>,
    /// Bumped whenever a load may have settled.
    changes: watch::Sender<u64>,
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, SyncState>> {
        self.state
            .lock()
            .map_err(|e| SyncError::Poisoned(e.to_string()))
    }

    fn notify(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// Coordinates CoValues, storage and peers for one node.
pub struct SyncManager {
    inner: Arc<Inner>,
    storage: Option<Arc<StorageApi>>,
    config: SyncConfig,
}

impl SyncManager {
    pub fn new(
        crypto: Arc<dyn CryptoProvider>,
        tx_config: TransactionConfig,
        storage: Option<Arc<StorageApi>>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (changes, _) = watch::channel(0);
        Arc::new(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SyncState {
                    registry: CoValueRegistry::new(crypto, tx_config),
                    peers: BTreeMap::new(),
                }),
                changes,
            }),
            storage,
            config,
        })
    }

    pub fn storage(&self) -> Option<&Arc<StorageApi>> {
        self.storage.as_ref()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run `f` against the registry under the state lock.
    ///
    /// `f` must not block; nothing is sent to peers on its behalf.
    pub fn with_registry<R>(&self, f: impl FnOnce(&mut CoValueRegistry) -> R) -> Result<R> {
        let mut state = self.inner.lock()?;
        Ok(f(&mut state.registry))
    }

    pub fn status(&self, id: &CoId) -> Result<LoadStatus> {
        Ok(self.inner.lock()?.registry.status(id))
    }

    pub fn peer_ids(&self) -> Result<Vec<PeerId>> {
        Ok(self.inner.lock()?.peers.keys().cloned().collect())
    }

    pub fn peer_role(&self, peer: &PeerId) -> Result<Option<PeerRole>> {
        Ok(self.inner.lock()?.peers.get(peer).map(PeerState::role))
    }

    /// What `peer` has confirmed about `id`.
    pub fn peer_known_state(&self, peer: &PeerId, id: &CoId) -> Result<Option<KnownState>> {
        let state = self.inner.lock()?;
        let peer = state
            .peers
            .get(peer)
            .ok_or_else(|| SyncError::PeerNotConnected(peer.clone()))?;
        Ok(peer.known_state(id).cloned())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a peer. A peer with the same id is shut down and replaced.
    ///
    /// Server peers are asked, at low priority, about every CoValue held
    /// locally, and unsynced CoValues are reloaded from storage so they
    /// reach the new server.
    pub fn add_peer(
        self: &Arc<Self>,
        id: PeerId,
        role: PeerRole,
        channel: Arc<dyn OutgoingChannel>,
    ) -> Result<()> {
        let peer = PeerState::new(
            id.clone(),
            role,
            channel,
            self.config.outgoing.clone(),
            self.config.load_queue.clone(),
            self.load_timeout_hook(id.clone()),
        );

        {
            let mut state = self.inner.lock()?;
            if let Some(mut old) = state.peers.remove(&id) {
                old.shutdown();
            }
            if peer.is_server() {
                for co_id in state.registry.available_ids() {
                    peer.send_load_request(&state.registry.known_state(&co_id), LoadMode::LowPriority);
                }
            }
            state.peers.insert(id.clone(), peer);
        }
        debug!(peer = %id, ?role, "Peer added");

        if role == PeerRole::Server && self.storage.is_some() {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.resume_unsynced().await {
                    warn!(error = %e, "Failed to resume unsynced CoValues");
                }
            });
        }
        Ok(())
    }

    /// Shut down and forget a peer.
    pub fn remove_peer(&self, id: &PeerId) -> Result<()> {
        {
            let mut state = self.inner.lock()?;
            if let Some(mut peer) = state.peers.remove(id) {
                peer.shutdown();
            }
            state.registry.peer_disconnected(id);
        }
        self.inner.notify();
        Ok(())
    }

    fn load_timeout_hook(&self, peer: PeerId) -> TimeoutHook {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move |id: &CoId| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            match inner.lock() {
                Ok(mut state) => {
                    if state.registry.is_available(id) {
                        warn!(id = %id, peer = %peer, "Load timed out while streaming");
                    } else {
                        warn!(id = %id, peer = %peer, "Load timed out");
                        state.registry.mark_not_found(id, LoadSource::Peer(peer.clone()));
                    }
                }
                Err(e) => error!(error = %e, "Sync state poisoned"),
            }
            inner.notify();
        })
    }

    /// Feed frames from `receiver` into [`Self::handle_message`] until the
    /// sending side goes away, then report the peer disconnected.
    pub fn spawn_receiver(self: &Arc<Self>, peer: PeerId, mut receiver: MemoryReceiver) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = receiver.recv().await {
                let messages = match SyncMessage::parse_frame(&frame) {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "Dropping unparseable frame");
                        continue;
                    }
                };
                for msg in messages {
                    if let Err(e) = this.handle_message(&peer, msg.into()).await {
                        warn!(peer = %peer, error = %e, "Failed to handle message");
                    }
                }
            }
            if let Err(e) = this.handle_message(&peer, PeerMessage::Disconnected).await {
                debug!(peer = %peer, error = %e, "Disconnect after removal");
            }
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Incoming messages
    // ─────────────────────────────────────────────────────────────────────────

    /// Handle one message from `from`.
    pub async fn handle_message(self: &Arc<Self>, from: &PeerId, msg: PeerMessage) -> Result<()> {
        let msg = match msg {
            PeerMessage::Disconnected => return self.remove_peer(from),
            PeerMessage::Sync(msg) => msg,
        };

        {
            let state = self.inner.lock()?;
            if !state.peers.contains_key(from) {
                return Err(SyncError::PeerNotConnected(from.clone()));
            }
            if state.registry.is_errored_in(msg.id(), from) {
                warn!(id = %msg.id(), peer = %from, action = msg.action(), "Skipping message for errored CoValue");
                return Ok(());
            }
        }

        match msg {
            SyncMessage::Load(known) => self.handle_load(from, known),
            SyncMessage::Known(known) if known.is_correction => self.handle_correction(from, known),
            SyncMessage::Known(known) => self.handle_known(from, known),
            SyncMessage::Content(content) => self.handle_new_content(from, content).await,
            SyncMessage::Done { .. } => Ok(()),
        }
    }

    fn handle_load(self: &Arc<Self>, from: &PeerId, msg: KnownStateMessage) -> Result<()> {
        let id = msg.id.clone();
        {
            let mut state = self.inner.lock()?;
            let SyncState { registry, peers } = &mut *state;
            let peer = peer_mut(peers, from)?;
            peer.set_known_state(msg.known_state());
            if registry.is_available(&id) {
                send_new_content(registry, peer, &id, true);
                return Ok(());
            }
        }

        // Resolve in the background so the peer's other messages keep flowing.
        let this = Arc::clone(self);
        let from = from.clone();
        tokio::spawn(async move {
            if let Err(e) = this.load_and_respond(&from, &id).await {
                warn!(id = %id, peer = %from, error = %e, "Failed to answer load");
            }
        });
        Ok(())
    }

    async fn load_and_respond(self: &Arc<Self>, from: &PeerId, id: &CoId) -> Result<()> {
        if !self.load_from_storage(id).await? {
            let asked = {
                let mut state = self.inner.lock()?;
                let SyncState { registry, peers } = &mut *state;
                let known = registry.known_state(id);
                let mut asked = false;
                for (peer_id, peer) in peers.iter() {
                    if peer_id == from || !peer.is_server() || peer.is_closed() {
                        continue;
                    }
                    registry.mark_pending(id, LoadSource::Peer(peer_id.clone()));
                    peer.send_load_request(&known, LoadMode::Immediate);
                    asked = true;
                }
                asked
            };
            if asked {
                self.wait_until_settled(id, self.config.load_timeout).await?;
            }
        }

        let mut state = self.inner.lock()?;
        let SyncState { registry, peers } = &mut *state;
        let Some(peer) = peers.get_mut(from) else {
            return Ok(());
        };
        if registry.is_available(id) {
            send_new_content(registry, peer, id, true);
        } else {
            peer.push(SyncMessage::Known(KnownStateMessage::not_found(id.clone())));
            peer.track_told_known_state(id);
        }
        Ok(())
    }

    fn handle_known(&self, from: &PeerId, msg: KnownStateMessage) -> Result<()> {
        let id = msg.id.clone();
        let mut synced = None;
        {
            let mut state = self.inner.lock()?;
            let SyncState { registry, peers } = &mut *state;
            let peer = peer_mut(peers, from)?;
            peer.combine_with(&msg.known_state());

            let on_peer = peer.known_state(&id).map_or(false, |k| k.header);
            if !on_peer {
                registry.mark_not_found(&id, LoadSource::Peer(from.clone()));
            }

            let mut streaming = false;
            if let Some(core) = registry.get(&id) {
                streaming = core.is_streaming();
                send_new_content(registry, peer, &id, false);
                if peer.is_server() {
                    if let Some(theirs) = peer.known_state(&id) {
                        if peer_has_all_content(core.known_state(), theirs) {
                            synced = Some(id.clone());
                        }
                    }
                }
            }
            if !on_peer || registry.is_available(&id) {
                peer.load_queue().track_complete(&id, streaming);
            }
        }

        if let Some(id) = synced {
            self.track_sync_state(vec![
                SyncStateUpdate {
                    id: id.clone(),
                    peer_id: from.as_str().to_string(),
                    synced: true,
                },
                SyncStateUpdate {
                    id,
                    peer_id: NO_PEER.to_string(),
                    synced: true,
                },
            ]);
        }
        self.inner.notify();
        Ok(())
    }

    fn handle_correction(&self, from: &PeerId, msg: KnownStateMessage) -> Result<()> {
        let id = msg.id.clone();
        let mut state = self.inner.lock()?;
        let SyncState { registry, peers } = &mut *state;
        let peer = peer_mut(peers, from)?;
        debug!(id = %id, peer = %from, "Peer sent a correction");
        peer.set_known_state(msg.known_state());
        send_new_content(registry, peer, &id, false);
        Ok(())
    }

    async fn handle_new_content(self: &Arc<Self>, from: &PeerId, content: NewContent) -> Result<()> {
        let id = content.id.clone();
        let needs_header = content.header.is_none() && !self.inner.lock()?.registry.is_available(&id);
        if needs_header && !self.load_from_storage(&id).await? {
            let mut state = self.inner.lock()?;
            let peer = peer_mut(&mut state.peers, from)?;
            debug!(id = %id, peer = %from, "Content without header, asking for everything");
            peer.load_queue().track_update(&id);
            peer.push(SyncMessage::Known(KnownStateMessage::correction(&KnownState::empty(id.clone()))));
            peer.track_told_known_state(&id);
            return Ok(());
        }
        self.apply_content(ContentSource::Peer(from.clone()), content)
    }

    /// Ingest one CONTENT piece.
    fn apply_content(&self, source: ContentSource, mut content: NewContent) -> Result<()> {
        let id = content.id.clone();
        let from_storage = source == ContentSource::Storage;
        let peer_id = match &source {
            ContentSource::Peer(peer) => Some(peer.clone()),
            ContentSource::Storage => None,
        };

        let mut state = self.inner.lock()?;
        let SyncState { registry, peers } = &mut *state;

        if let Some(from) = &peer_id {
            let peer = peer_mut(peers, from)?;
            if !peer.is_server() {
                // Clients do not get to announce future content.
                content.expect_content_until = None;
            }
            peer.load_queue().track_update(&id);
        }

        if !registry.is_available(&id) {
            let Some(header) = content.header.clone() else {
                match &peer_id {
                    None => warn!(id = %id, "Stored content without header"),
                    Some(from) => {
                        let peer = peer_mut(peers, from)?;
                        peer.push(SyncMessage::Known(KnownStateMessage::correction(&KnownState::empty(
                            id.clone(),
                        ))));
                        peer.track_told_known_state(&id);
                    }
                }
                return Ok(());
            };
            match CoValueCore::from_received_header(
                id.clone(),
                header,
                Arc::clone(registry.crypto()),
                registry.config(),
            ) {
                Ok(core) => registry.insert(core),
                Err(e) => {
                    error!(id = %id, error = %e, "Rejected header");
                    return Ok(());
                }
            }
            registry.mark_found(&id, source.load_source());
        }

        let Some(core) = registry.get_mut(&id) else {
            return Ok(());
        };
        if let Some(until) = &content.expect_content_until {
            core.set_streaming_known_state(until);
        }

        let before = core.known_state().clone();
        let mut deleted = core.is_deleted();
        let mut valid = NewContent::new(id.clone(), content.priority);
        valid.header = content.header.clone();
        let mut invalid = false;
        let mut errored = false;

        for (session_id, session) in &content.new {
            if deleted && !session_id.is_delete_session() {
                continue;
            }
            let have = before.sessions.get(session_id).copied().unwrap_or(0);
            if have < session.after {
                invalid = true;
                continue;
            }
            let skip = (have - session.after) as usize;
            let new_txs = match session.new_transactions.get(skip..) {
                Some(txs) if !txs.is_empty() => txs,
                _ => continue,
            };
            if let Err(e) =
                core.try_add_transactions(session_id, new_txs, &session.last_signature, from_storage)
            {
                error!(id = %id, session = %session_id, error = %e, "Failed to add transactions");
                errored = true;
                continue;
            }
            if !deleted && core.is_deleted() {
                deleted = true;
                valid.new.clear();
            }
            valid.new.insert(
                session_id.clone(),
                SessionNewContent {
                    after: have,
                    new_transactions: new_txs.to_vec(),
                    last_signature: session.last_signature.clone(),
                },
            );
        }

        let ours = core.known_state().clone();
        let streaming = core.is_streaming();

        match &peer_id {
            Some(from) => {
                if errored {
                    registry.mark_errored(&id, from);
                }
                let peer = peer_mut(peers, from)?;
                let mut theirs = content_known_state(if deleted { &content } else { &valid });
                theirs.header = true;
                peer.combine_with(&theirs);

                if invalid {
                    peer.push(SyncMessage::Known(KnownStateMessage::correction(&ours)));
                } else if deleted {
                    // The peer keeps the rest of its history; stop it resending.
                    let mut stop = ours.clone();
                    if let Some(known) = peer.known_state(&id) {
                        stop.combine(known);
                    }
                    peer.push(SyncMessage::Known(KnownStateMessage::from_known(&stop)));
                } else {
                    peer.push(SyncMessage::Known(KnownStateMessage::from_known(&ours)));
                }
                peer.track_told_known_state(&id);
                peer.load_queue().track_complete(&id, streaming);
            }
            None if invalid => error!(id = %id, "Stored content does not follow the held state"),
            None => {}
        }

        if !from_storage && (valid.header.is_some() || !valid.new.is_empty()) {
            self.store_content(registry, valid);
        }

        for (other_id, peer) in peers.iter_mut() {
            if peer.is_closed() || registry.is_errored_in(&id, other_id) {
                continue;
            }
            if peer.is_subscribed(&id) {
                send_new_content(registry, peer, &id, false);
            } else if peer.is_server() {
                peer.send_load_request(&registry.known_state(&id), LoadMode::LowPriority);
            }
        }

        drop(state);
        self.inner.notify();
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local writes and loads
    // ─────────────────────────────────────────────────────────────────────────

    /// Persist locally produced pieces and push them to server peers and
    /// subscribed clients.
    pub fn sync_local_content(&self, pieces: Vec<NewContent>) -> Result<()> {
        let mut unsynced = Vec::new();
        {
            let mut state = self.inner.lock()?;
            let SyncState { registry, peers } = &mut *state;
            for content in pieces {
                let id = content.id.clone();
                self.store_content(registry, content.clone());

                let servers: Vec<&PeerId> = peers
                    .iter()
                    .filter(|(_, p)| p.is_server() && !p.is_closed())
                    .map(|(peer_id, _)| peer_id)
                    .collect();
                if servers.is_empty() {
                    unsynced.push(SyncStateUpdate {
                        id: id.clone(),
                        peer_id: NO_PEER.to_string(),
                        synced: false,
                    });
                }
                unsynced.extend(servers.into_iter().map(|peer_id| SyncStateUpdate {
                    id: id.clone(),
                    peer_id: peer_id.as_str().to_string(),
                    synced: false,
                }));

                let mut sent = content_known_state(&content);
                sent.header = true;
                for (peer_id, peer) in peers.iter_mut() {
                    if peer.is_closed() || registry.is_errored_in(&id, peer_id) {
                        continue;
                    }
                    if !peer.is_server() && !peer.is_subscribed(&id) {
                        continue;
                    }
                    peer.push(SyncMessage::Content(content.clone()));
                    peer.combine_optimistic_with(&sent);
                    peer.track_told_known_state(&id);
                }
            }
        }
        self.track_sync_state(unsynced);
        self.inner.notify();
        Ok(())
    }

    /// Make `id` available locally, from storage or server peers.
    pub async fn load(self: &Arc<Self>, id: &CoId) -> Result<LoadOutcome> {
        if let Some(outcome) = settled(self.status(id)?) {
            if outcome != LoadOutcome::Unavailable {
                return Ok(outcome);
            }
        }
        if self.load_from_storage(id).await? {
            return Ok(settled(self.status(id)?).unwrap_or(LoadOutcome::Available));
        }

        let asked = {
            let mut state = self.inner.lock()?;
            let SyncState { registry, peers } = &mut *state;
            let known = registry.known_state(id);
            let mut asked = false;
            for (peer_id, peer) in peers.iter() {
                if !peer.is_server() || peer.is_closed() {
                    continue;
                }
                registry.mark_pending(id, LoadSource::Peer(peer_id.clone()));
                peer.send_load_request(&known, LoadMode::Normal);
                asked = true;
            }
            asked
        };
        if !asked {
            return Ok(LoadOutcome::Unavailable);
        }
        self.wait_until_settled(id, self.config.load_timeout).await
    }

    /// Wait until `peer` has confirmed everything held locally for `id`.
    pub async fn wait_for_peer_sync(&self, peer: &PeerId, id: &CoId, timeout: Duration) -> Result<()> {
        let mut changes = self.inner.changes.subscribe();
        let deadline = Instant::now() + timeout;
        loop {
            let done = {
                let state = self.inner.lock()?;
                let ours = state.registry.known_state(id);
                state
                    .peers
                    .get(peer)
                    .ok_or_else(|| SyncError::PeerNotConnected(peer.clone()))?
                    .known_state(id)
                    .map_or(false, |theirs| peer_has_all_content(&ours, theirs))
            };
            if done {
                return Ok(());
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(SyncError::Closed),
                Err(_) => return Err(SyncError::Timeout(id.clone())),
            }
        }
    }

    /// Try storage for `id`; true when it is available afterwards.
    async fn load_from_storage(&self, id: &CoId) -> Result<bool> {
        let Some(storage) = &self.storage else {
            return Ok(self.inner.lock()?.registry.is_available(id));
        };
        {
            let mut state = self.inner.lock()?;
            if state.registry.is_available(id) {
                return Ok(true);
            }
            state.registry.mark_pending(id, LoadSource::Storage);
        }

        let inner = Arc::clone(&self.inner);
        let in_memory = move |dep: &CoId| {
            inner
                .lock()
                .map_or(false, |state| state.registry.is_available(dep))
        };
        let pieces = storage.load_co_value(id, &in_memory).await;

        for piece in pieces.into_iter().flatten() {
            self.apply_content(ContentSource::Storage, piece)?;
        }

        let available = {
            let mut state = self.inner.lock()?;
            let available = state.registry.is_available(id);
            if !available {
                state.registry.mark_not_found(id, LoadSource::Storage);
            }
            available
        };
        self.inner.notify();
        Ok(available)
    }

    async fn wait_until_settled(&self, id: &CoId, timeout: Duration) -> Result<LoadOutcome> {
        let mut changes = self.inner.changes.subscribe();
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.status(id)?;
            if let Some(outcome) = settled(status) {
                return Ok(outcome);
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Ok(LoadOutcome::Unavailable),
                Err(_) => {
                    debug!(id = %id, "Load wait timed out");
                    return Ok(LoadOutcome::Unavailable);
                }
            }
        }
    }

    /// Reload CoValues whose local writes never reached a server.
    async fn resume_unsynced(&self) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let ids = storage.get_unsynced_co_value_ids().await?;
        for id in ids {
            if !self.load_from_storage(&id).await? {
                storage.stop_tracking_sync_state(&id).await?;
                continue;
            }
            let mut state = self.inner.lock()?;
            let SyncState { registry, peers } = &mut *state;
            for peer in peers.values_mut().filter(|p| p.is_server() && !p.is_closed()) {
                if !peer.is_subscribed(&id) {
                    peer.send_load_request(&registry.known_state(&id), LoadMode::LowPriority);
                }
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Storage
    // ─────────────────────────────────────────────────────────────────────────

    fn store_content(&self, registry: &CoValueRegistry, content: NewContent) {
        let Some(storage) = &self.storage else {
            return;
        };
        let id = content.id.clone();
        if registry.get(&id).map_or(false, CoValueCore::is_deleted) {
            storage.mark_delete_as_valid(&id);
        }

        let inner = Arc::downgrade(&self.inner);
        let correction_id = id.clone();
        let correction: CorrectionCallback = Arc::new(move |known: &KnownState| {
            let inner = inner.upgrade()?;
            let state = inner.lock().ok()?;
            state.registry.get(&correction_id)?.new_content_since(Some(known))
        });
        if let Err(e) = storage.store(content, correction) {
            warn!(id = %id, error = %e, "Failed to queue content for storage");
        }
    }

    fn track_sync_state(&self, updates: Vec<SyncStateUpdate>) {
        let Some(storage) = &self.storage else {
            return;
        };
        if updates.is_empty() {
            return;
        }
        let storage = Arc::clone(storage);
        tokio::spawn(async move {
            if let Err(e) = storage.track_co_values_sync_state(&updates).await {
                warn!(error = %e, "Failed to track sync state");
            }
        });
    }
}

fn peer_mut<'a>(peers: &'a mut BTreeMap<PeerId, PeerState>, id: &PeerId) -> Result<&'a mut PeerState> {
    peers
        .get_mut(id)
        .ok_or_else(|| SyncError::PeerNotConnected(id.clone()))
}

fn settled(status: LoadStatus) -> Option<LoadOutcome> {
    match status {
        LoadStatus::Available => Some(LoadOutcome::Available),
        LoadStatus::Deleted => Some(LoadOutcome::Deleted),
        LoadStatus::Unavailable => Some(LoadOutcome::Unavailable),
        LoadStatus::Loading => None,
    }
}

/// State a peer reaches after ingesting `content`.
fn content_known_state(content: &NewContent) -> KnownState {
    let mut known = KnownState::empty(content.id.clone());
    known.header = content.header.is_some();
    for (session_id, session) in &content.new {
        let end = u32::try_from(session.new_transactions.len())
            .ok()
            .and_then(|n| session.after.checked_add(n));
        match end {
            Some(end) => {
                known.sessions.insert(session_id.clone(), end);
            }
            None => warn!(id = %content.id, session = %session_id, "Ignoring session with out-of-range index"),
        }
    }
    known
}

/// Push what `peer` lacks of `id`, dependencies first.
fn send_new_content(registry: &CoValueRegistry, peer: &mut PeerState, id: &CoId, force_known: bool) {
    let mut seen = HashSet::new();
    send_content_with_deps(registry, peer, id, force_known, &mut seen);
}

fn send_content_with_deps(
    registry: &CoValueRegistry,
    peer: &mut PeerState,
    id: &CoId,
    force_known: bool,
    seen: &mut HashSet<CoId>,
) {
    if !seen.insert(id.clone()) {
        return;
    }
    let Some(core) = registry.get(id) else {
        return;
    };

    // Servers resolve dependencies through their own loads.
    if !peer.is_server() {
        for dep in core.depended_on_co_values() {
            send_content_with_deps(registry, peer, &dep, false, seen);
        }
    }

    match core.new_content_since(peer.optimistic_known_state(id)) {
        Some(pieces) => {
            for piece in pieces {
                peer.push(SyncMessage::Content(piece));
            }
            peer.combine_optimistic_with(core.known_state());
        }
        None if force_known || !peer.has_told_known_state(id) => {
            let known = if core.is_deleted() {
                let mut stop = core.known_state().clone();
                if let Some(theirs) = peer.known_state(id) {
                    stop.combine(theirs);
                }
                stop
            } else {
                core.known_state_with_streaming().clone()
            };
            peer.push(SyncMessage::Known(KnownStateMessage::from_known(&known)));
        }
        None => {}
    }
    peer.track_told_known_state(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::memory_channel;
    use covalue_core::{AgentSecret, CoValueHeader, CoValueType, DefaultCrypto, Identity, Privacy};
    use covalue_store::StorageConfig;
    use serde_json::json;

    fn identity(seed: u8) -> Identity {
        Identity::new(&DefaultCrypto, AgentSecret::from_seed(&[seed; 32])).unwrap()
    }

    fn manager(storage: Option<Arc<StorageApi>>) -> Arc<SyncManager> {
        SyncManager::new(
            Arc::new(DefaultCrypto),
            TransactionConfig::default(),
            storage,
            SyncConfig::default(),
        )
    }

    /// A group CoValue with `count` trusting writes by `me`.
    fn group_with_writes(me: &Identity, count: u64) -> CoValueCore {
        let header = CoValueHeader::group(me.agent_id().clone(), "g");
        let mut core =
            CoValueCore::new(header, Arc::new(DefaultCrypto), &TransactionConfig::default()).unwrap();
        for i in 0..count {
            core.make_transaction(me, &[json!({"op": "set", "key": format!("k{i}"), "value": i})], Privacy::Trusting, None, i + 1)
                .unwrap();
        }
        core
    }

    fn all_content(core: &CoValueCore) -> Vec<NewContent> {
        core.new_content_since(None).unwrap()
    }

    #[tokio::test]
    async fn test_load_of_held_value_answers_with_content() {
        let me = identity(1);
        let sync = manager(None);
        let core = group_with_writes(&me, 2);
        let id = core.id().clone();
        sync.with_registry(|r| r.insert(core)).unwrap();

        let client = PeerId::new("client");
        let (channel, mut rx) = memory_channel(true);
        sync.add_peer(client.clone(), PeerRole::Client, channel).unwrap();
        sync.handle_message(&client, SyncMessage::Load(KnownStateMessage::not_found(id.clone())).into())
            .await
            .unwrap();

        let out = rx.drain_messages();
        assert!(matches!(&out[..], [SyncMessage::Content(c)] if c.header.is_some() && c.transaction_count() == 2));
    }

    #[tokio::test]
    async fn test_load_of_unknown_value_replies_not_found() {
        let sync = manager(None);
        let client = PeerId::new("client");
        let (channel, mut rx) = memory_channel(true);
        sync.add_peer(client.clone(), PeerRole::Client, channel).unwrap();

        let id = CoId::new_unchecked("co_zmissing");
        sync.handle_message(&client, SyncMessage::Load(KnownStateMessage::not_found(id.clone())).into())
            .await
            .unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(SyncMessage::parse_frame(&frame).unwrap(), vec![SyncMessage::Known(KnownStateMessage::not_found(id))]);
    }

    #[tokio::test]
    async fn test_content_is_applied_and_acknowledged() {
        let me = identity(2);
        let core = group_with_writes(&me, 3);
        let id = core.id().clone();

        let sync = manager(None);
        let server = PeerId::new("server");
        let (channel, mut rx) = memory_channel(true);
        sync.add_peer(server.clone(), PeerRole::Server, channel).unwrap();

        for piece in all_content(&core) {
            sync.handle_message(&server, SyncMessage::Content(piece).into()).await.unwrap();
        }

        assert_eq!(sync.status(&id).unwrap(), LoadStatus::Available);
        let held = sync.with_registry(|r| r.known_state(&id)).unwrap();
        assert_eq!(&held, core.known_state());

        let out = rx.drain_messages();
        assert!(out.contains(&SyncMessage::Known(KnownStateMessage::from_known(core.known_state()))));
    }

    #[tokio::test]
    async fn test_gap_in_content_triggers_correction() {
        let me = identity(3);
        let mut core = group_with_writes(&me, 1);
        let id = core.id().clone();

        let sync = manager(None);
        let server = PeerId::new("server");
        let (channel, mut rx) = memory_channel(true);
        sync.add_peer(server.clone(), PeerRole::Server, channel).unwrap();
        for piece in all_content(&core) {
            sync.handle_message(&server, SyncMessage::Content(piece).into()).await.unwrap();
        }
        rx.drain_messages();

        // Two more writes, but only the last one is delivered.
        let known_one = core.known_state().clone();
        core.make_transaction(&me, &[json!({"op": "set", "key": "a", "value": 1})], Privacy::Trusting, None, 10)
            .unwrap();
        let known_two = core.known_state().clone();
        core.make_transaction(&me, &[json!({"op": "set", "key": "b", "value": 2})], Privacy::Trusting, None, 11)
            .unwrap();
        let tail = core.new_content_since(Some(&known_two)).unwrap();
        sync.handle_message(&server, SyncMessage::Content(tail[0].clone()).into())
            .await
            .unwrap();

        let out = rx.drain_messages();
        assert!(out.contains(&SyncMessage::Known(KnownStateMessage::correction(&known_one))));
        assert_eq!(sync.with_registry(|r| r.known_state(&id)).unwrap(), known_one);
    }

    #[tokio::test]
    async fn test_local_content_reaches_servers_only_when_unsubscribed() {
        let me = identity(4);
        let core = group_with_writes(&me, 1);
        let id = core.id().clone();
        let sync = manager(None);
        sync.with_registry(|r| r.insert(core.clone())).unwrap();

        let (server_channel, mut server_rx) = memory_channel(true);
        let (client_channel, mut client_rx) = memory_channel(true);
        sync.add_peer(PeerId::new("server"), PeerRole::Server, server_channel).unwrap();
        sync.add_peer(PeerId::new("client"), PeerRole::Client, client_channel).unwrap();
        server_rx.drain_messages();

        sync.sync_local_content(all_content(&core)).unwrap();

        let to_server = server_rx.drain_messages();
        assert!(to_server.iter().any(|m| matches!(m, SyncMessage::Content(c) if c.id == id)));
        assert!(client_rx.drain_messages().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_settles_pending_load() {
        let sync = manager(None);
        let server = PeerId::new("server");
        let (channel, mut rx) = memory_channel(true);
        sync.add_peer(server.clone(), PeerRole::Server, channel).unwrap();

        let id = CoId::new_unchecked("co_zfar");
        let loading = {
            let sync = Arc::clone(&sync);
            let id = id.clone();
            tokio::spawn(async move { sync.load(&id).await })
        };
        // The LOAD goes out before the peer drops.
        let frame = rx.recv().await.unwrap();
        assert_eq!(SyncMessage::parse_frame(&frame).unwrap()[0].action(), "load");

        sync.handle_message(&server, PeerMessage::Disconnected).await.unwrap();
        assert_eq!(loading.await.unwrap().unwrap(), LoadOutcome::Unavailable);
        assert!(sync.peer_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_reads_storage_before_peers() {
        let me = identity(5);
        let core = group_with_writes(&me, 2);
        let id = core.id().clone();

        let storage = Arc::new(StorageApi::in_memory(StorageConfig::default()));
        for piece in all_content(&core) {
            let noop: CorrectionCallback = Arc::new(|_: &KnownState| None);
            assert!(storage.store_and_wait(piece, noop).await);
        }

        let sync = manager(Some(Arc::clone(&storage)));
        assert_eq!(sync.load(&id).await.unwrap(), LoadOutcome::Available);
        assert_eq!(&sync.with_registry(|r| r.known_state(&id)).unwrap(), core.known_state());
        storage.close().await;
    }

    #[tokio::test]
    async fn test_content_from_peer_is_stored() {
        let me = identity(6);
        let core = group_with_writes(&me, 2);
        let id = core.id().clone();
        let storage = Arc::new(StorageApi::in_memory(StorageConfig::default()));
        let sync = manager(Some(Arc::clone(&storage)));

        let client = PeerId::new("client");
        let (channel, _rx) = memory_channel(true);
        sync.add_peer(client.clone(), PeerRole::Client, channel).unwrap();
        for piece in all_content(&core) {
            sync.handle_message(&client, SyncMessage::Content(piece).into()).await.unwrap();
        }

        storage.close().await;
        assert_eq!(storage.get_known_state(&id).sessions, core.known_state().sessions);
    }

    #[tokio::test]
    async fn test_load_sends_owner_group_before_the_map() {
        let me = identity(7);
        let group = group_with_writes(&me, 1);
        let group_id = group.id().clone();
        let header = CoValueHeader::owned_by(CoValueType::Comap, group_id.clone(), None, "m");
        let mut map =
            CoValueCore::new(header, Arc::new(DefaultCrypto), &TransactionConfig::default()).unwrap();
        map.make_transaction(&me, &[json!({"op": "set", "key": "a", "value": 1})], Privacy::Trusting, None, 5)
            .unwrap();
        let map_id = map.id().clone();

        let sync = manager(None);
        sync.with_registry(|r| {
            r.insert(group);
            r.insert(map);
        })
        .unwrap();

        let client = PeerId::new("client");
        let (channel, mut rx) = memory_channel(true);
        sync.add_peer(client.clone(), PeerRole::Client, channel).unwrap();
        sync.handle_message(&client, SyncMessage::Load(KnownStateMessage::not_found(map_id.clone())).into())
            .await
            .unwrap();

        let ids: Vec<CoId> = rx
            .drain_messages()
            .into_iter()
            .filter_map(|msg| match msg {
                SyncMessage::Content(c) => Some(c.id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![group_id, map_id]);
    }

    #[tokio::test]
    async fn test_out_of_range_index_on_deleted_value_keeps_node_usable() {
        let me = identity(8);
        let header = CoValueHeader::owned_by(CoValueType::Comap, CoId::new_unchecked("co_zgroup"), None, "m");
        let mut map =
            CoValueCore::new(header, Arc::new(DefaultCrypto), &TransactionConfig::default()).unwrap();
        map.make_transaction(&me, &[json!({"op": "set", "key": "a", "value": 1})], Privacy::Trusting, None, 1)
            .unwrap();
        let id = map.id().clone();
        let mut piece = all_content(&map).remove(0);
        for session in piece.new.values_mut() {
            session.after = u32::MAX;
        }
        map.delete(&me, 2).unwrap();

        let sync = manager(None);
        sync.with_registry(|r| r.insert(map)).unwrap();
        let client = PeerId::new("client");
        let (channel, mut rx) = memory_channel(true);
        sync.add_peer(client.clone(), PeerRole::Client, channel).unwrap();

        sync.handle_message(&client, SyncMessage::Content(piece).into())
            .await
            .unwrap();

        assert_eq!(sync.status(&id).unwrap(), LoadStatus::Deleted);
        let known = sync.peer_known_state(&client, &id).unwrap().unwrap();
        assert!(known.sessions.values().all(|n| *n != u32::MAX));
        assert!(matches!(rx.drain_messages().last(), Some(SyncMessage::Known(_))));
    }
}
