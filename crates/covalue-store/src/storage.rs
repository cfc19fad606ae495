//! Storage API: the durable mirror of in-memory SessionMaps.
//!
//! Writes are serialized through the [`StoreQueue`]; content that assumes
//! more than storage holds is repaired through a correction callback.
//! Reads stream a CoValue back in the same checkpoint-bounded pieces peers
//! exchange, dependencies first.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use covalue_core::{
    assemble_pieces, dependencies_of, exceeds_recommended_size, CoId, CoValuePriority,
    KnownSessions, KnownState, NewContent, SessionId, SessionNewContent, Transaction,
    MAX_RECOMMENDED_TX_SIZE,
};

use crate::eraser::{self, ErasePass, EraserSignal};
use crate::error::{Result, StoreError};
use crate::memory::MemoryClient;
use crate::queue::StoreQueue;
use crate::sqlite::SqliteClient;
use crate::traits::{
    DbClient, DbClientExt, DbTransaction, SessionUpdate, StoredSessionRow, SyncStateUpdate,
};

/// Storage tuning.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Wall-clock budget of one erasure pass on bounded clients.
    pub erase_budget: Duration,

    /// Quiet period required before an erasure pass starts.
    pub erase_idle_delay: Duration,

    /// Checkpoint threshold for stored sessions.
    pub max_recommended_tx_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            erase_budget: Duration::from_millis(100),
            erase_idle_delay: Duration::from_millis(50),
            max_recommended_tx_size: MAX_RECOMMENDED_TX_SIZE,
        }
    }
}

/// Produces the content storage is missing, given what storage knows.
pub type CorrectionCallback = Arc<dyn Fn(&KnownState) -> Option<Vec<NewContent>> + Send + Sync>;

/// Predicate telling the loader which CoValues are already in memory.
pub type InMemory<'a> = &'a (dyn Fn(&CoId) -> bool + Send + Sync);

enum StoreOutcome {
    Stored,
    /// Storage lacks what the content assumed; carries what storage has.
    Invalid(KnownState),
}

/// State shared by the API, the store worker and the eraser.
pub(crate) struct StorageShared {
    pub(crate) client: Arc<dyn DbClient>,
    pub(crate) config: StorageConfig,
    pub(crate) eraser: EraserSignal,
    known_states: Mutex<HashMap<CoId, KnownState>>,
    deletes_marked_valid: Mutex<HashSet<CoId>>,
}

impl StorageShared {
    fn cache_known_state(&self, known: &KnownState) {
        if let Ok(mut cache) = self.known_states.lock() {
            cache.insert(known.id.clone(), known.clone());
        }
    }

    pub(crate) fn forget_known_state(&self, id: &CoId) {
        if let Ok(mut cache) = self.known_states.lock() {
            cache.remove(id);
        }
    }

    fn is_delete_marked_valid(&self, id: &CoId) -> bool {
        self.deletes_marked_valid
            .lock()
            .map_or(false, |marked| marked.contains(id))
    }

    async fn load_known_state(&self, id: &CoId) -> Result<Option<KnownState>> {
        let Some(row) = self.client.get_co_value(id).await? else {
            return Ok(None);
        };
        let sessions = self.client.get_co_value_sessions(row.row_id).await?;
        let known = KnownState {
            id: id.clone(),
            header: row.header.is_some(),
            sessions: sessions
                .into_iter()
                .map(|s| (s.session_id, s.last_idx))
                .collect(),
        };
        self.cache_known_state(&known);
        Ok(Some(known))
    }

    /// Store `content`, running `correction` once if storage is behind.
    pub(crate) async fn store(
        &self,
        content: NewContent,
        correction: Option<CorrectionCallback>,
    ) -> bool {
        self.eraser.interrupt();
        let id = content.id.clone();

        let known = match self.store_once(content).await {
            Ok(StoreOutcome::Stored) => return true,
            Ok(StoreOutcome::Invalid(known)) => known,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Failed to store content");
                return false;
            }
        };

        let Some(correction) = correction else {
            tracing::warn!(id = %id, "Storage is behind and no correction is available");
            return false;
        };
        tracing::debug!(id = %id, "Storage is behind, requesting correction");
        let Some(pieces) = correction(&known) else {
            tracing::warn!(id = %id, "No correction content available");
            return false;
        };

        for piece in pieces {
            match self.store_once(piece).await {
                Ok(StoreOutcome::Stored) => {}
                Ok(StoreOutcome::Invalid(_)) => {
                    tracing::error!(id = %id, "Double correction requested, giving up");
                    return false;
                }
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "Failed to store correction");
                    return false;
                }
            }
        }
        true
    }

    async fn store_once(&self, content: NewContent) -> Result<StoreOutcome> {
        let id = content.id.clone();
        let existing = self.client.get_co_value(&id).await?;
        let row_id = match (existing, &content.header) {
            (Some(row), _) if row.header.is_some() => row.row_id,
            (_, Some(header)) => self.client.upsert_co_value(&id, Some(header)).await?,
            _ => return Ok(StoreOutcome::Invalid(KnownState::empty(id))),
        };

        let mark_deleted = content.new.keys().any(SessionId::is_delete_session)
            && self.is_delete_marked_valid(&id);
        let max_size = self.config.max_recommended_tx_size;
        let sessions = content.new;
        let marker = id.clone();

        let invalid = self
            .client
            .transaction(move |db| {
                let mut invalid = false;
                for (session_id, session) in &sessions {
                    let existing = db.get_single_co_value_session(row_id, session_id)?;
                    let last_idx = existing.as_ref().map_or(0, |s| s.last_idx);
                    if last_idx < session.after {
                        invalid = true;
                        continue;
                    }
                    put_new_txs(db, row_id, session_id, session, existing.as_ref(), max_size)?;
                }
                if mark_deleted {
                    db.mark_co_value_as_deleted(&marker)?;
                }
                Ok(invalid)
            })
            .await?;

        if mark_deleted {
            self.eraser.schedule();
        }

        let known = self
            .load_known_state(&id)
            .await?
            .unwrap_or_else(|| KnownState::empty(id.clone()));
        if invalid {
            Ok(StoreOutcome::Invalid(known))
        } else {
            Ok(StoreOutcome::Stored)
        }
    }

    /// Read one CoValue back as checkpoint-bounded pieces.
    async fn read_pieces(&self, id: &CoId) -> Result<Option<Vec<NewContent>>> {
        let Some(row) = self.client.get_co_value(id).await? else {
            return Ok(None);
        };
        let Some(header) = row.header else {
            return Ok(None);
        };

        let sessions = self.client.get_co_value_sessions(row.row_id).await?;
        let mut spans = BTreeMap::new();
        let mut until = KnownSessions::new();
        let mut has_checkpoint = false;

        for session in &sessions {
            until.insert(session.session_id.clone(), session.last_idx);
            let session_spans = self.read_session_spans(session).await?;
            has_checkpoint |= session_spans.len() > 1
                || session_spans
                    .first()
                    .map_or(false, |s| s.last_signature != session.last_signature);
            if !session_spans.is_empty() {
                spans.insert(session.session_id.clone(), session_spans);
            }
        }

        self.cache_known_state(&KnownState {
            id: id.clone(),
            header: true,
            sessions: until.clone(),
        });

        let priority = CoValuePriority::from_header(&header);
        Ok(Some(assemble_pieces(
            id,
            Some(&header),
            priority,
            spans,
            Some(until),
            has_checkpoint,
        )))
    }

    async fn read_session_spans(&self, session: &StoredSessionRow) -> Result<Vec<SessionNewContent>> {
        let checkpoints = self.client.get_signatures(session.row_id, 0).await?;
        let mut spans = Vec::new();
        let mut start = 0u32;

        for checkpoint in checkpoints {
            if checkpoint.idx >= session.last_idx {
                break;
            }
            let txs = self
                .client
                .get_new_transaction_in_session(session.row_id, start, checkpoint.idx)
                .await?;
            spans.push(SessionNewContent {
                after: start,
                new_transactions: txs,
                last_signature: checkpoint.signature,
            });
            start = checkpoint.idx + 1;
        }
        if start < session.last_idx {
            let txs = self
                .client
                .get_new_transaction_in_session(session.row_id, start, session.last_idx - 1)
                .await?;
            spans.push(SessionNewContent {
                after: start,
                new_transactions: txs,
                last_signature: session.last_signature.clone(),
            });
        }

        let stored: usize = spans.iter().map(|s| s.new_transactions.len()).sum();
        if stored != session.last_idx as usize {
            return Err(StoreError::InvalidData(format!(
                "session {} has {} of {} transactions",
                session.session_id, stored, session.last_idx
            )));
        }
        Ok(spans)
    }

    /// Depth-first: dependencies land in `out` before the CoValue itself.
    fn collect_pieces<'a>(
        &'a self,
        id: &'a CoId,
        in_memory: InMemory<'a>,
        seen: &'a mut HashSet<CoId>,
        out: &'a mut Vec<NewContent>,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            if !seen.insert(id.clone()) {
                return Ok(true);
            }
            let Some(pieces) = self.read_pieces(id).await? else {
                return Ok(false);
            };

            let deps = match pieces.first().and_then(|p| p.header.as_ref()) {
                Some(header) => dependencies_of(
                    header,
                    pieces
                        .iter()
                        .flat_map(|p| p.new.values().map(|s| s.new_transactions.as_slice())),
                ),
                None => Vec::new(),
            };
            for dep in deps {
                if dep == *id || in_memory(&dep) {
                    continue;
                }
                if !self.collect_pieces(&dep, in_memory, seen, out).await? {
                    tracing::debug!(id = %id, dependency = %dep, "Dependency not in storage");
                }
            }

            out.extend(pieces);
            Ok(true)
        })
    }
}

/// Append the genuinely new tail of `content` to a session.
///
/// `existing` is the stored session, if any; its `last_idx` must be at least
/// `content.after`. A checkpoint is written at the new head when the bytes
/// since the previous one exceed `max_recommended_tx_size`. Returns the new
/// `last_idx`.
pub fn put_new_txs(
    db: &mut dyn DbTransaction,
    co_value: i64,
    session_id: &SessionId,
    content: &SessionNewContent,
    existing: Option<&StoredSessionRow>,
    max_recommended_tx_size: usize,
) -> Result<u32> {
    let last_idx = existing.map_or(0, |s| s.last_idx);
    if last_idx < content.after {
        return Err(StoreError::InvalidData(format!(
            "session {} holds {} transactions, content starts after {}",
            session_id, last_idx, content.after
        )));
    }

    let skip = (last_idx - content.after) as usize;
    let new_txs = content.new_transactions.get(skip..).unwrap_or(&[]);
    if new_txs.is_empty() {
        return Ok(last_idx);
    }

    let new_size: usize = new_txs.iter().map(Transaction::size).sum();
    let bytes_since = existing.map_or(0, |s| s.bytes_since_last_signature);
    let checkpoint = exceeds_recommended_size(bytes_since, new_size, max_recommended_tx_size);
    let new_last_idx = last_idx + new_txs.len() as u32;

    let session_row = db.add_session_update(&SessionUpdate {
        co_value,
        session_id: session_id.clone(),
        last_idx: new_last_idx,
        last_signature: content.last_signature.clone(),
        bytes_since_last_signature: if checkpoint { 0 } else { bytes_since + new_size },
    })?;
    if checkpoint {
        db.add_signature_after(session_row, new_last_idx - 1, &content.last_signature)?;
    }
    for (offset, tx) in new_txs.iter().enumerate() {
        db.add_transaction(session_row, last_idx + offset as u32, tx)?;
    }
    Ok(new_last_idx)
}

// ─────────────────────────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────────────────────────

/// The storage layer used by a node.
///
/// Must be created inside a tokio runtime: it spawns the store worker and
/// the eraser scheduler.
pub struct StorageApi {
    shared: Arc<StorageShared>,
    queue: StoreQueue,
    shutdown: CancellationToken,
    eraser_task: Mutex<Option<JoinHandle<()>>>,
}

impl StorageApi {
    pub fn new(client: Arc<dyn DbClient>, config: StorageConfig) -> Self {
        let shared = Arc::new(StorageShared {
            client,
            config,
            eraser: EraserSignal::new(),
            known_states: Mutex::new(HashMap::new()),
            deletes_marked_valid: Mutex::new(HashSet::new()),
        });
        let shutdown = CancellationToken::new();
        let eraser_task = eraser::spawn_scheduler(Arc::clone(&shared), shutdown.clone());
        shared.eraser.schedule();

        Self {
            queue: StoreQueue::spawn(Arc::clone(&shared)),
            shared,
            shutdown,
            eraser_task: Mutex::new(Some(eraser_task)),
        }
    }

    /// Storage backed by a SQLite file.
    pub fn open_sqlite(path: impl AsRef<Path>, config: StorageConfig) -> Result<Self> {
        Ok(Self::new(Arc::new(SqliteClient::open(path)?), config))
    }

    /// Storage kept in memory.
    pub fn in_memory(config: StorageConfig) -> Self {
        Self::new(Arc::new(MemoryClient::new()), config)
    }

    pub fn client(&self) -> &Arc<dyn DbClient> {
        &self.shared.client
    }

    pub fn config(&self) -> &StorageConfig {
        &self.shared.config
    }

    /// Queue `content` for storage. The receiver yields whether it was stored.
    pub fn store(
        &self,
        content: NewContent,
        correction: CorrectionCallback,
    ) -> Result<oneshot::Receiver<bool>> {
        self.queue.push(content, Some(correction))
    }

    /// Queue `content` and wait for the outcome.
    pub async fn store_and_wait(&self, content: NewContent, correction: CorrectionCallback) -> bool {
        match self.store(content, correction) {
            Ok(done) => done.await.unwrap_or(false),
            Err(e) => {
                tracing::warn!(error = %e, "Store request rejected");
                false
            }
        }
    }

    /// Load `id` and any dependency not `in_memory`, dependencies first.
    ///
    /// `None` when `id` is not stored. Read failures are logged and treated
    /// as not found.
    pub async fn load_co_value(&self, id: &CoId, in_memory: InMemory<'_>) -> Option<Vec<NewContent>> {
        self.shared.eraser.interrupt();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        match self
            .shared
            .collect_pieces(id, in_memory, &mut seen, &mut out)
            .await
        {
            Ok(true) => Some(out),
            Ok(false) => None,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Failed to load from storage");
                None
            }
        }
    }

    /// Cached known state of `id`; empty when storage has not seen it.
    pub fn get_known_state(&self, id: &CoId) -> KnownState {
        self.shared
            .known_states
            .lock()
            .ok()
            .and_then(|cache| cache.get(id).cloned())
            .unwrap_or_else(|| KnownState::empty(id.clone()))
    }

    /// Known state of `id` read from the database.
    pub async fn load_known_state(&self, id: &CoId) -> Option<KnownState> {
        match self.shared.load_known_state(id).await {
            Ok(known) => known,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Failed to load known state");
                None
            }
        }
    }

    /// Replace the stored history of one session.
    ///
    /// `spans` must be contiguous from index 0; each span ends at a signature.
    pub async fn replace_session_history(
        &self,
        id: &CoId,
        session_id: &SessionId,
        spans: Vec<SessionNewContent>,
    ) -> Result<()> {
        let mut expected = 0u32;
        for span in &spans {
            if span.after != expected {
                return Err(StoreError::InvalidData(format!(
                    "session {} span starts after {}, expected {}",
                    session_id, span.after, expected
                )));
            }
            expected += span.new_transactions.len() as u32;
        }

        let row = self
            .shared
            .client
            .get_co_value(id)
            .await?
            .ok_or_else(|| StoreError::InvalidData(format!("unknown covalue {}", id)))?;
        let co_value = row.row_id;
        let session_id = session_id.clone();
        let max_size = self.shared.config.max_recommended_tx_size;

        self.shared
            .client
            .transaction(move |db| {
                if let Some(existing) = db.get_single_co_value_session(co_value, &session_id)? {
                    db.delete_session(existing.row_id)?;
                }
                let mut current: Option<StoredSessionRow> = None;
                for span in &spans {
                    put_new_txs(db, co_value, &session_id, span, current.as_ref(), max_size)?;
                    current = db.get_single_co_value_session(co_value, &session_id)?;
                }
                Ok(())
            })
            .await?;

        self.shared.load_known_state(id).await?;
        Ok(())
    }

    /// Allow the next delete session stored for `id` to queue it for erasure.
    pub fn mark_delete_as_valid(&self, id: &CoId) {
        if let Ok(mut marked) = self.shared.deletes_marked_valid.lock() {
            marked.insert(id.clone());
        }
        self.shared.eraser.schedule();
    }

    /// Erase every queued CoValue now, ignoring the budget.
    pub async fn erase_all_deleted_co_values(&self) -> Result<usize> {
        let token = CancellationToken::new();
        match eraser::erase_pass(&self.shared, &token, None).await? {
            ErasePass::Complete(erased) | ErasePass::Interrupted(erased) => Ok(erased),
        }
    }

    pub async fn track_co_values_sync_state(&self, updates: &[SyncStateUpdate]) -> Result<()> {
        self.shared.client.track_co_values_sync_state(updates).await
    }

    pub async fn get_unsynced_co_value_ids(&self) -> Result<Vec<CoId>> {
        self.shared.client.get_unsynced_co_value_ids().await
    }

    pub async fn stop_tracking_sync_state(&self, id: &CoId) -> Result<()> {
        self.shared.client.stop_tracking_sync_state(id).await
    }

    /// Drain queued writes and stop background work.
    pub async fn close(&self) {
        self.queue.close().await;
        self.shutdown.cancel();
        let task = self.eraser_task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Eraser task failed");
            }
        }
    }
}

impl Drop for StorageApi {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalue_core::{
        AgentSecret, CoValueCore, CoValueHeader, CoValueType, DefaultCrypto, Identity, Privacy,
        TransactionConfig,
    };
    use serde_json::{json, Value};

    fn identity(seed: u8) -> Identity {
        Identity::new(&DefaultCrypto, AgentSecret::from_seed(&[seed; 32])).unwrap()
    }

    fn set(key: &str, value: Value) -> Value {
        json!({"op": "set", "key": key, "value": value})
    }

    fn map_owned_by(group: &str, config: &TransactionConfig) -> CoValueCore {
        let header = CoValueHeader::owned_by(
            CoValueType::Comap,
            CoId::new_unchecked(group),
            None,
            "u",
        );
        CoValueCore::new(header, Arc::new(DefaultCrypto), config).unwrap()
    }

    fn small_config() -> (TransactionConfig, StorageConfig) {
        (
            TransactionConfig {
                max_recommended_tx_size: 100,
            },
            StorageConfig {
                max_recommended_tx_size: 100,
                ..StorageConfig::default()
            },
        )
    }

    fn no_correction() -> CorrectionCallback {
        Arc::new(|_| None)
    }

    fn nothing_in_memory() -> impl Fn(&CoId) -> bool + Send + Sync {
        |_: &CoId| false
    }

    fn replay(pieces: &[NewContent], config: &TransactionConfig) -> CoValueCore {
        let header = pieces[0].header.clone().unwrap();
        let mut core = CoValueCore::from_received_header(
            pieces[0].id.clone(),
            header,
            Arc::new(DefaultCrypto),
            config,
        )
        .unwrap();
        for piece in pieces {
            for (session, content) in &piece.new {
                core.try_add_transactions(
                    session,
                    &content.new_transactions,
                    &content.last_signature,
                    false,
                )
                .unwrap();
            }
        }
        core
    }

    #[tokio::test]
    async fn test_checkpointed_history_streams_back_in_pieces() {
        let (tx_config, config) = small_config();
        let me = identity(1);
        let mut core = map_owned_by("co_zgroup", &tx_config);
        for i in 0..5 {
            core.make_transaction(&me, &[set("k", json!("x".repeat(40)))], Privacy::Trusting, None, i)
                .unwrap();
        }

        let sent = core.new_content_since(None).unwrap();
        assert!(sent.len() > 1);
        let storage = StorageApi::in_memory(config);
        for piece in sent.clone() {
            assert!(storage.store_and_wait(piece, no_correction()).await);
        }

        let in_memory = nothing_in_memory();
        let pieces = storage.load_co_value(core.id(), &in_memory).await.unwrap();
        let counts = |pieces: &[NewContent]| -> Vec<usize> {
            pieces.iter().map(NewContent::transaction_count).collect()
        };
        assert_eq!(counts(&pieces), counts(&sent));
        assert!(pieces[0].expect_content_until.is_some());

        let restored = replay(&pieces, &tx_config);
        assert_eq!(restored.known_state(), core.known_state());
        assert_eq!(storage.get_known_state(core.id()), core.known_state().clone());
    }

    #[tokio::test]
    async fn test_out_of_order_content_is_corrected() {
        let (tx_config, config) = small_config();
        let me = identity(2);
        let mut core = map_owned_by("co_zgroup", &tx_config);
        for i in 0..5 {
            core.make_transaction(&me, &[set("k", json!("y".repeat(60)))], Privacy::Trusting, None, i)
                .unwrap();
        }
        let pieces = core.new_content_since(None).unwrap();
        let late = pieces[1].clone();

        let all = pieces.clone();
        let asked = Arc::new(Mutex::new(Vec::new()));
        let asked_in_callback = Arc::clone(&asked);
        let correction: CorrectionCallback = Arc::new(move |known: &KnownState| {
            asked_in_callback.lock().unwrap().push(known.clone());
            Some(all.clone())
        });

        assert!(storage_store(&config, late, correction, &core).await);
        let asked = asked.lock().unwrap();
        assert_eq!(asked.len(), 1);
        assert!(!asked[0].header);
    }

    async fn storage_store(
        config: &StorageConfig,
        content: NewContent,
        correction: CorrectionCallback,
        core: &CoValueCore,
    ) -> bool {
        let storage = StorageApi::in_memory(config.clone());
        let stored = storage.store_and_wait(content, correction).await;
        let known = storage.load_known_state(core.id()).await.unwrap();
        assert_eq!(&known, core.known_state());
        stored
    }

    #[tokio::test]
    async fn test_second_correction_is_fatal() {
        let (tx_config, config) = small_config();
        let me = identity(3);
        let mut core = map_owned_by("co_zgroup", &tx_config);
        for i in 0..5 {
            core.make_transaction(&me, &[set("k", json!("z".repeat(60)))], Privacy::Trusting, None, i)
                .unwrap();
        }
        let pieces = core.new_content_since(None).unwrap();
        let late = pieces[2].clone();
        let still_late = vec![pieces[1].clone()];

        let storage = StorageApi::in_memory(config);
        let stored = storage
            .store_and_wait(late, Arc::new(move |_| Some(still_late.clone())))
            .await;
        assert!(!stored);
    }

    #[tokio::test]
    async fn test_dependencies_load_first() {
        let config = TransactionConfig::default();
        let me = identity(4);
        let mut group = CoValueCore::new(
            CoValueHeader::group(me.agent_id().clone(), "g"),
            Arc::new(DefaultCrypto),
            &config,
        )
        .unwrap();
        group
            .make_transaction(&me, &[set(me.agent_id().as_str(), json!("admin"))], Privacy::Trusting, None, 1)
            .unwrap();
        let mut map = map_owned_by(group.id().as_str(), &config);
        map.make_transaction(&me, &[set("a", json!(1))], Privacy::Trusting, None, 2)
            .unwrap();

        let storage = StorageApi::in_memory(StorageConfig::default());
        for piece in map
            .new_content_since(None)
            .unwrap()
            .into_iter()
            .chain(group.new_content_since(None).unwrap())
        {
            assert!(storage.store_and_wait(piece, no_correction()).await);
        }

        let in_memory = nothing_in_memory();
        let pieces = storage.load_co_value(map.id(), &in_memory).await.unwrap();
        let order: Vec<&CoId> = pieces.iter().map(|p| &p.id).collect();
        assert_eq!(order, vec![group.id(), map.id()]);

        let group_id = group.id().clone();
        let group_loaded = move |id: &CoId| *id == group_id;
        let pieces = storage.load_co_value(map.id(), &group_loaded).await.unwrap();
        assert_eq!(pieces.len(), 1);
        assert_eq!(&pieces[0].id, map.id());

        let unknown = CoId::new_unchecked("co_zmissing");
        assert!(storage.load_co_value(&unknown, &in_memory).await.is_none());
    }

    async fn stored_deleted_map(storage: &StorageApi) -> CoValueCore {
        let config = TransactionConfig::default();
        let me = identity(5);
        let mut map = map_owned_by("co_zgroup", &config);
        map.make_transaction(&me, &[set("a", json!(1))], Privacy::Trusting, None, 1)
            .unwrap();
        map.delete(&me, 2).unwrap();

        storage.mark_delete_as_valid(map.id());
        for piece in map.new_content_since(None).unwrap() {
            assert!(storage.store_and_wait(piece, no_correction()).await);
        }
        map
    }

    #[tokio::test]
    async fn test_erasure_keeps_tombstone() {
        let storage = StorageApi::in_memory(StorageConfig::default());
        let map = stored_deleted_map(&storage).await;

        storage.erase_all_deleted_co_values().await.unwrap();

        let in_memory = nothing_in_memory();
        let pieces = storage.load_co_value(map.id(), &in_memory).await.unwrap();
        assert_eq!(pieces.len(), 1);
        assert!(pieces[0].header.is_some());
        assert!(pieces[0].new.keys().all(SessionId::is_delete_session));
        assert_eq!(pieces[0].new.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eraser_runs_once_quiet() {
        let storage = StorageApi::in_memory(StorageConfig::default());
        let map = stored_deleted_map(&storage).await;

        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(storage
            .client()
            .get_all_co_values_waiting_for_delete()
            .await
            .unwrap()
            .is_empty());
        let known = storage.load_known_state(map.id()).await.unwrap();
        assert_eq!(known.sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_replace_session_history_enforces_continuity() {
        let config = TransactionConfig::default();
        let me = identity(6);
        let mut map = map_owned_by("co_zgroup", &config);
        for i in 0..3 {
            map.make_transaction(&me, &[set("k", json!(i))], Privacy::Trusting, None, i)
                .unwrap();
        }
        let piece = map.new_content_since(None).unwrap().remove(0);
        let span = piece.new[me.session_id()].clone();

        let storage = StorageApi::in_memory(StorageConfig::default());
        assert!(storage.store_and_wait(piece.clone(), no_correction()).await);

        let gap = SessionNewContent {
            after: 1,
            ..span.clone()
        };
        assert!(matches!(
            storage
                .replace_session_history(map.id(), me.session_id(), vec![gap])
                .await,
            Err(StoreError::InvalidData(_))
        ));

        let shorter = SessionNewContent {
            new_transactions: span.new_transactions[..1].to_vec(),
            ..span.clone()
        };
        storage
            .replace_session_history(map.id(), me.session_id(), vec![shorter])
            .await
            .unwrap();
        let known = storage.load_known_state(map.id()).await.unwrap();
        assert_eq!(known.sessions[me.session_id()], 1);
    }

    #[tokio::test]
    async fn test_restart_replays_identical_pieces() {
        let (tx_config, config) = small_config();
        let me = identity(7);
        let mut core = map_owned_by("co_zgroup", &tx_config);
        for i in 0..7 {
            core.make_transaction(&me, &[set("k", json!("w".repeat(45)))], Privacy::Trusting, None, i)
                .unwrap();
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("covalue.db");

        {
            let storage = StorageApi::open_sqlite(&path, config.clone()).unwrap();
            for piece in core.new_content_since(None).unwrap() {
                assert!(storage.store_and_wait(piece, no_correction()).await);
            }
            storage.close().await;
        }

        let in_memory = nothing_in_memory();
        let first = StorageApi::open_sqlite(&path, config.clone()).unwrap();
        let once = first.load_co_value(core.id(), &in_memory).await.unwrap();
        first.close().await;
        let second = StorageApi::open_sqlite(&path, config).unwrap();
        let twice = second.load_co_value(core.id(), &in_memory).await.unwrap();

        assert_eq!(once, twice);
        let restored = replay(&twice, &tx_config);
        assert_eq!(restored.known_state(), core.known_state());
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_stores() {
        let storage = StorageApi::in_memory(StorageConfig::default());
        storage.close().await;
        let map = map_owned_by("co_zgroup", &TransactionConfig::default());
        let piece = NewContent::new(map.id().clone(), CoValuePriority::Medium);
        assert!(matches!(
            storage.store(piece, no_correction()),
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_retransmitted_older_content_never_moves_known_state_back() {
        let config = TransactionConfig::default();
        let me = identity(8);
        let mut map = map_owned_by("co_zgroup", &config);
        for i in 0..3 {
            map.make_transaction(&me, &[set("k", json!(i))], Privacy::Trusting, None, i)
                .unwrap();
        }
        let older = map.new_content_since(None).unwrap().remove(0);
        for i in 3..5 {
            map.make_transaction(&me, &[set("k", json!(i))], Privacy::Trusting, None, i)
                .unwrap();
        }
        let later = map.new_content_since(None).unwrap().remove(0);

        let storage = StorageApi::in_memory(StorageConfig::default());
        assert!(storage.store_and_wait(later, no_correction()).await);
        assert!(storage.store_and_wait(older.clone(), no_correction()).await);

        let known = storage.load_known_state(map.id()).await.unwrap();
        assert_eq!(known.sessions[me.session_id()], 5);
        assert_eq!(storage.get_known_state(map.id()), known);

        let row = storage.client().get_co_value(map.id()).await.unwrap().unwrap().row_id;
        let session = me.session_id().clone();
        let span = older.new[&session].clone();
        let last_idx = storage
            .client()
            .transaction(move |db| {
                let existing = db.get_single_co_value_session(row, &session)?;
                put_new_txs(db, row, &session, &span, existing.as_ref(), MAX_RECOMMENDED_TX_SIZE)
            })
            .await
            .unwrap();
        assert_eq!(last_idx, 5);

        let in_memory = nothing_in_memory();
        let pieces = storage.load_co_value(map.id(), &in_memory).await.unwrap();
        let stored: usize = pieces.iter().map(NewContent::transaction_count).sum();
        assert_eq!(stored, 5);
        assert_eq!(replay(&pieces, &config).known_state(), map.known_state());
    }

    #[tokio::test]
    async fn test_read_failure_loads_as_not_found() {
        let me = identity(9);
        let config = TransactionConfig::default();
        let mut map = map_owned_by("co_zgroup", &config);
        map.make_transaction(&me, &[set("a", json!(1))], Privacy::Trusting, None, 1)
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("covalue.db");

        {
            let storage = StorageApi::open_sqlite(&path, StorageConfig::default()).unwrap();
            for piece in map.new_content_since(None).unwrap() {
                assert!(storage.store_and_wait(piece, no_correction()).await);
            }
            storage.close().await;
        }
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE transactions")
            .unwrap();

        let storage = StorageApi::open_sqlite(&path, StorageConfig::default()).unwrap();
        let in_memory = nothing_in_memory();
        assert!(storage.load_co_value(map.id(), &in_memory).await.is_none());
        assert!(storage.load_known_state(map.id()).await.is_some());
    }
}
