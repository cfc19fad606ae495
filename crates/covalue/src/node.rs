//! The local node: one identity, its CoValues, storage and peers.
//!
//! Every mutation runs against the shared registry; whatever it changed is
//! diffed against the known states from before and handed to sync as
//! CONTENT, which stores it and pushes it to peers.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use covalue_core::{
    AgentId, AgentSecret, CoId, CoValueCore, CoValueHeader, CoValueType, CryptoProvider,
    DefaultCrypto, Identity, KnownState, MapOp, NewContent, Privacy, TransactionConfig,
};
use covalue_perms::{self as perms, CoValueArena, GroupState, Member, PermsError, Role};
use covalue_store::{StorageApi, StorageConfig};
use covalue_sync::channel::memory::memory_channel;
use covalue_sync::{CoValueRegistry, LoadOutcome, PeerId, PeerRole, SyncConfig, SyncManager};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::comap::CoMapView;
use crate::error::{NodeError, Result};

/// Configuration for a node.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub transactions: TransactionConfig,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
}

impl NodeConfig {
    /// Use `bytes` as the signature checkpoint threshold everywhere.
    pub fn with_max_recommended_tx_size(mut self, bytes: usize) -> Self {
        self.transactions.max_recommended_tx_size = bytes;
        self.storage.max_recommended_tx_size = bytes;
        self
    }
}

/// A node acting for one identity.
pub struct LocalNode {
    identity: Identity,
    crypto: Arc<dyn CryptoProvider>,
    peer_id: PeerId,
    sync: Arc<SyncManager>,
    config: NodeConfig,
}

impl LocalNode {
    /// Create a node over `storage`, or without persistence.
    pub fn new(identity: Identity, storage: Option<Arc<StorageApi>>, config: NodeConfig) -> Self {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(DefaultCrypto);
        let sync = SyncManager::new(
            Arc::clone(&crypto),
            config.transactions.clone(),
            storage,
            config.sync.clone(),
        );
        Self {
            peer_id: PeerId::new(identity.session_id().as_str()),
            identity,
            crypto,
            sync,
            config,
        }
    }

    /// A node backed by in-memory storage.
    pub fn in_memory(identity: Identity, config: NodeConfig) -> Self {
        let storage = Arc::new(StorageApi::in_memory(config.storage.clone()));
        Self::new(identity, Some(storage), config)
    }

    /// A node backed by the SQLite database at `path`.
    pub fn open(identity: Identity, path: impl AsRef<Path>, config: NodeConfig) -> Result<Self> {
        let storage = Arc::new(StorageApi::open_sqlite(path, config.storage.clone())?);
        Ok(Self::new(identity, Some(storage), config))
    }

    /// Identity for `secret` with a fresh session.
    pub fn identity_from_secret(secret: AgentSecret) -> Result<Identity> {
        Ok(Identity::new(&DefaultCrypto, secret)?)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn agent_id(&self) -> &AgentId {
        self.identity.agent_id()
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local mutations
    // ─────────────────────────────────────────────────────────────────────────

    /// Run `f` on the registry and sync whatever it wrote.
    fn with_local_changes<R>(
        &self,
        f: impl FnOnce(&mut TouchedArena<'_>) -> Result<R>,
    ) -> Result<R> {
        let (result, pieces) = self.sync.with_registry(|registry| {
            let mut arena = TouchedArena::new(registry);
            let result = f(&mut arena)?;
            Ok::<_, NodeError>((result, arena.into_new_content()))
        })??;

        self.sync.sync_local_content(pieces)?;
        Ok(result)
    }

    /// Create a group with this node's agent as admin.
    pub fn create_group(&self) -> Result<CoId> {
        let made_at = now_millis();
        self.with_local_changes(|registry| {
            Ok(perms::create_group(
                registry,
                &self.identity,
                Arc::clone(&self.crypto),
                &self.config.transactions,
                made_at,
            )?)
        })
    }

    /// Create an empty CoMap owned by `group`.
    pub fn create_map(&self, group: &CoId, meta: Option<Value>) -> Result<CoId> {
        let made_at = now_millis();
        let uniqueness = self
            .crypto
            .short_hash(&self.crypto.random_bytes(32))
            .as_str()
            .to_string();
        self.with_local_changes(|registry| {
            let role = perms::role_of(&*registry, group, self.agent_id())?;
            if !role.map_or(false, |r| r.can_write()) {
                return Err(NodeError::Unauthorized(group.clone()));
            }
            let header = CoValueHeader::owned_by(CoValueType::Comap, group.clone(), meta, uniqueness)
                .with_created_at(made_at);
            let core = CoValueCore::new(header, Arc::clone(&self.crypto), &self.config.transactions)?;
            let id = core.id().clone();
            registry.insert(core);
            Ok(id)
        })
    }

    /// Set `key` of a CoMap.
    pub fn set(&self, map: &CoId, key: &str, value: Value) -> Result<()> {
        self.write_map(
            map,
            MapOp::Set {
                key: key.to_string(),
                value,
            },
        )
    }

    /// Remove `key` from a CoMap.
    pub fn remove_key(&self, map: &CoId, key: &str) -> Result<()> {
        self.write_map(map, MapOp::Del { key: key.to_string() })
    }

    fn write_map(&self, map: &CoId, op: MapOp) -> Result<()> {
        let made_at = now_millis();
        let change =
            serde_json::to_value(&op).map_err(|e| NodeError::InvalidOperation(e.to_string()))?;
        self.with_local_changes(|registry| {
            let core = registry
                .get(map)
                .ok_or_else(|| NodeError::Unavailable(map.clone()))?;
            if core.is_deleted() {
                return Err(NodeError::Deleted(map.clone()));
            }
            let privacy = match core.header().owner_group().cloned() {
                Some(group) => {
                    let state = GroupState::load(&*registry, &group)?;
                    if !state.role_of(self.agent_id()).map_or(false, |r| r.can_write()) {
                        return Err(NodeError::Unauthorized(map.clone()));
                    }
                    let (key_id, key_secret) =
                        perms::current_write_key(&state, self.crypto.as_ref(), &self.identity)
                            .ok_or(PermsError::KeyUnavailable(group))?;
                    Privacy::Private { key_id, key_secret }
                }
                None if core.header().is_group() => {
                    return Err(NodeError::InvalidOperation(
                        "groups change through membership operations".into(),
                    ))
                }
                None => Privacy::Trusting,
            };
            let core = registry
                .get_mut(map)
                .ok_or_else(|| NodeError::Unavailable(map.clone()))?;
            core.make_transaction(&self.identity, &[change], privacy, None, made_at)?;
            Ok(())
        })
    }

    /// Read a CoMap held locally.
    pub fn read_map(&self, map: &CoId) -> Result<CoMapView> {
        self.sync.with_registry(|registry| {
            let core = registry
                .get(map)
                .ok_or_else(|| NodeError::Unavailable(map.clone()))?;
            if core.is_deleted() {
                return Err(NodeError::Deleted(map.clone()));
            }
            CoMapView::materialize(&*registry, core, &self.identity)
        })?
    }

    /// Delete a CoValue. Only admins of the owning group may.
    pub fn delete(&self, id: &CoId) -> Result<()> {
        let made_at = now_millis();
        self.with_local_changes(|registry| {
            let core = registry
                .get(id)
                .ok_or_else(|| NodeError::Unavailable(id.clone()))?;
            if !perms::can_delete(&*registry, core, self.agent_id())? {
                return Err(NodeError::Unauthorized(id.clone()));
            }
            let core = registry
                .get_mut(id)
                .ok_or_else(|| NodeError::Unavailable(id.clone()))?;
            core.delete(&self.identity, made_at)?;
            Ok(())
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_member(&self, group: &CoId, member: &Member, role: Role) -> Result<()> {
        let made_at = now_millis();
        self.with_local_changes(|registry| {
            Ok(perms::add_member(registry, &self.identity, group, member, role, made_at)?)
        })
    }

    pub fn remove_member(&self, group: &CoId, member: &Member) -> Result<()> {
        let made_at = now_millis();
        self.with_local_changes(|registry| {
            Ok(perms::remove_member(registry, &self.identity, group, member, made_at)?)
        })
    }

    pub fn rotate_read_key(&self, group: &CoId) -> Result<()> {
        let made_at = now_millis();
        self.with_local_changes(|registry| {
            Ok(perms::rotate_read_key(registry, &self.identity, group, None, made_at)?)
        })
    }

    /// Let `child` inherit the members of `parent`, optionally capped at `role`.
    pub fn extend(&self, child: &CoId, parent: &CoId, role: Option<Role>) -> Result<()> {
        let made_at = now_millis();
        self.with_local_changes(|registry| {
            Ok(perms::extend(registry, &self.identity, child, parent, role, made_at)?)
        })
    }

    pub fn revoke_extend(&self, child: &CoId, parent: &CoId) -> Result<()> {
        let made_at = now_millis();
        self.with_local_changes(|registry| {
            Ok(perms::revoke_extend(registry, &self.identity, child, parent, made_at)?)
        })
    }

    pub fn create_invite(&self, group: &CoId, role: Role) -> Result<AgentSecret> {
        let made_at = now_millis();
        self.with_local_changes(|registry| {
            Ok(perms::create_invite(registry, &self.identity, group, role, made_at)?)
        })
    }

    /// Join `group` with an invite secret. The group must be loaded.
    pub fn accept_invite(&self, group: &CoId, invite: &AgentSecret) -> Result<()> {
        let made_at = now_millis();
        self.with_local_changes(|registry| {
            Ok(perms::accept_invite(registry, &self.identity, group, invite, made_at)?)
        })
    }

    pub fn role_of(&self, group: &CoId, agent: &AgentId) -> Result<Option<Role>> {
        self.sync
            .with_registry(|registry| perms::role_of(&*registry, group, agent))?
            .map_err(NodeError::from)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loading and peers
    // ─────────────────────────────────────────────────────────────────────────

    /// Make `id` available and readable by this node.
    pub async fn load(&self, id: &CoId) -> Result<()> {
        match self.sync.load(id).await? {
            LoadOutcome::Unavailable => return Err(NodeError::Unavailable(id.clone())),
            LoadOutcome::Deleted => return Err(NodeError::Deleted(id.clone())),
            LoadOutcome::Available => {}
        }

        let owner = self
            .sync
            .with_registry(|r| r.get(id).and_then(|c| c.header().owner_group().cloned()))?;
        let Some(group) = owner else {
            return Ok(());
        };
        if self.sync.load(&group).await? != LoadOutcome::Available {
            return Err(NodeError::Unauthorized(id.clone()));
        }
        match self.role_of(&group, self.agent_id())? {
            Some(role) if role.can_read() => Ok(()),
            _ => Err(NodeError::Unauthorized(id.clone())),
        }
    }

    /// Wait until every connected server has everything held for `id`.
    pub async fn wait_for_sync(&self, id: &CoId, timeout: Duration) -> Result<()> {
        for peer in self.sync.peer_ids()? {
            if self.sync.peer_role(&peer)? == Some(PeerRole::Server) {
                self.sync.wait_for_peer_sync(&peer, id, timeout).await?;
            }
        }
        Ok(())
    }

    /// Connect in-process to `server`, which serves this node.
    pub fn connect_to(&self, server: &LocalNode) -> Result<Connection> {
        let (to_server, server_inbox) = memory_channel(true);
        let (to_client, client_inbox) = memory_channel(true);

        server
            .sync
            .add_peer(self.peer_id.clone(), PeerRole::Client, to_client)?;
        let server_task = server
            .sync
            .spawn_receiver(self.peer_id.clone(), server_inbox);
        let client_task = self
            .sync
            .spawn_receiver(server.peer_id.clone(), client_inbox);
        self.sync
            .add_peer(server.peer_id.clone(), PeerRole::Server, to_server)?;

        Ok(Connection {
            client: Arc::clone(&self.sync),
            client_id: self.peer_id.clone(),
            server: Arc::clone(&server.sync),
            server_id: server.peer_id.clone(),
            tasks: vec![server_task, client_task],
        })
    }

    /// Flush pending writes and stop background work.
    pub async fn shutdown(&self) -> Result<()> {
        for peer in self.sync.peer_ids()? {
            self.sync.remove_peer(&peer)?;
        }
        if let Some(storage) = self.sync.storage() {
            storage.close().await;
        }
        Ok(())
    }
}

/// Registry view that records the known state of every CoValue a mutation
/// may change, before it changes.
struct TouchedArena<'a> {
    registry: &'a mut CoValueRegistry,
    before: BTreeMap<CoId, Option<KnownState>>,
}

impl<'a> TouchedArena<'a> {
    fn new(registry: &'a mut CoValueRegistry) -> Self {
        Self {
            registry,
            before: BTreeMap::new(),
        }
    }

    fn touch(&mut self, id: &CoId) {
        if !self.before.contains_key(id) {
            let known = self.registry.get(id).map(|core| core.known_state().clone());
            self.before.insert(id.clone(), known);
        }
    }

    /// CONTENT for every touched CoValue that changed, groups first so peers
    /// can check writes against them.
    fn into_new_content(self) -> Vec<NewContent> {
        let registry: &CoValueRegistry = self.registry;
        let mut changed: Vec<(&CoValueCore, Option<&KnownState>)> = self
            .before
            .iter()
            .filter_map(|(id, known)| registry.get(id).map(|core| (core, known.as_ref())))
            .filter(|(core, known)| *known != Some(core.known_state()))
            .collect();
        changed.sort_by_key(|(core, _)| !core.header().is_group());

        let mut pieces = Vec::new();
        for (core, known) in changed {
            if let Some(new) = core.new_content_since(known) {
                pieces.extend(new);
            }
        }
        pieces
    }
}

impl CoValueArena for TouchedArena<'_> {
    fn get(&self, id: &CoId) -> Option<&CoValueCore> {
        self.registry.get(id)
    }

    fn get_mut(&mut self, id: &CoId) -> Option<&mut CoValueCore> {
        self.touch(id);
        self.registry.get_mut(id)
    }

    fn insert(&mut self, core: CoValueCore) {
        self.touch(core.id());
        self.registry.insert(core);
    }
}

/// An in-process link between two nodes.
pub struct Connection {
    client: Arc<SyncManager>,
    client_id: PeerId,
    server: Arc<SyncManager>,
    server_id: PeerId,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    /// Drop the link on both sides.
    pub fn disconnect(self) -> Result<()> {
        self.client.remove_peer(&self.server_id)?;
        self.server.remove_peer(&self.client_id)?;
        for task in self.tasks {
            task.abort();
        }
        Ok(())
    }
}

/// Current time in milliseconds.
fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(seed: u8) -> LocalNode {
        let secret = AgentSecret::from_seed(&[seed; 32]);
        LocalNode::in_memory(
            LocalNode::identity_from_secret(secret).unwrap(),
            NodeConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_map_writes_are_private_and_readable_locally() {
        let node = node(1);
        let group = node.create_group().unwrap();
        let map = node.create_map(&group, None).unwrap();
        node.set(&map, "a", json!(1)).unwrap();
        node.set(&map, "b", json!("two")).unwrap();
        node.remove_key(&map, "a").unwrap();

        let view = node.read_map(&map).unwrap();
        assert_eq!(view.to_json(), json!({"b": "two"}));
        assert_eq!(view.entry("b").unwrap().author, *node.agent_id());

        let private = node
            .sync()
            .with_registry(|r| {
                let core = r.get(&map).unwrap();
                core.sessions()
                    .iter()
                    .flat_map(|(_, log)| log.transactions().iter())
                    .all(|tx| matches!(tx, covalue_core::Transaction::Private(_)))
            })
            .unwrap();
        assert!(private);
    }

    #[tokio::test]
    async fn test_groups_reject_map_writes() {
        let node = node(2);
        let group = node.create_group().unwrap();
        let err = node.set(&group, "k", json!(1)).unwrap_err();
        assert!(matches!(err, NodeError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_deleted_map_refuses_reads_and_writes() {
        let node = node(3);
        let group = node.create_group().unwrap();
        let map = node.create_map(&group, None).unwrap();
        node.set(&map, "k", json!(1)).unwrap();
        node.delete(&map).unwrap();

        assert!(matches!(node.read_map(&map), Err(NodeError::Deleted(_))));
        assert!(matches!(node.set(&map, "k", json!(2)), Err(NodeError::Deleted(_))));
        assert!(matches!(node.delete(&group), Err(NodeError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_load_without_peers_is_unavailable() {
        let node = node(4);
        let missing = CoId::new_unchecked("co_zmissing");
        assert!(matches!(node.load(&missing).await, Err(NodeError::Unavailable(_))));
    }

    #[test]
    fn test_only_changed_values_produce_content() {
        let me = LocalNode::identity_from_secret(AgentSecret::from_seed(&[6; 32])).unwrap();
        let crypto: Arc<dyn CryptoProvider> = Arc::new(DefaultCrypto);
        let config = TransactionConfig::default();
        let mut registry = CoValueRegistry::new(Arc::clone(&crypto), config.clone());
        let group = perms::create_group(&mut registry, &me, Arc::clone(&crypto), &config, 1).unwrap();
        let mut maps = Vec::new();
        for uniqueness in ["a", "b"] {
            let header = CoValueHeader::owned_by(CoValueType::Comap, group.clone(), None, uniqueness);
            let core = CoValueCore::new(header, Arc::clone(&crypto), &config).unwrap();
            maps.push(core.id().clone());
            registry.insert(core);
        }

        let mut arena = TouchedArena::new(&mut registry);
        assert!(arena.get(&group).is_some());
        assert!(arena.get_mut(&maps[1]).is_some());
        arena
            .get_mut(&maps[0])
            .unwrap()
            .make_transaction(&me, &[json!({"op": "set", "key": "k", "value": 1})], Privacy::Trusting, None, 2)
            .unwrap();

        let pieces = arena.into_new_content();
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].id, maps[0]);
        assert_eq!(pieces[0].transaction_count(), 1);
        assert!(pieces[0].header.is_none());
    }

    #[tokio::test]
    async fn test_local_writes_reach_storage() {
        let node = node(5);
        let group = node.create_group().unwrap();
        let map = node.create_map(&group, None).unwrap();
        node.set(&map, "k", json!(true)).unwrap();
        let storage = Arc::clone(node.sync().storage().unwrap());
        node.shutdown().await.unwrap();

        let held = node.sync().with_registry(|r| r.known_state(&map)).unwrap();
        assert_eq!(storage.get_known_state(&map).sessions, held.sessions);
    }
}
