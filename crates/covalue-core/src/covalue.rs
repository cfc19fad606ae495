//! CoValueCore: header plus session map, the unit of replication.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::content::{assemble_pieces, CoValuePriority, NewContent, SessionNewContent};
use crate::crypto::{CryptoProvider, Signature};
use crate::error::{CoreError, Result};
use crate::header::{CoValueHeader, Ruleset};
use crate::identity::Identity;
use crate::ids::{AgentId, CoId, SessionId, TransactionId};
use crate::known_state::{sessions_to_send, KnownSessions, KnownState};
use crate::session_log::{SessionLog, MAX_RECOMMENDED_TX_SIZE};
use crate::session_map::SessionMap;
use crate::transaction::{MapOp, Privacy, Transaction};

/// Configuration for transaction bookkeeping.
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Bytes after which a signature checkpoint is recorded.
    pub max_recommended_tx_size: usize,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_recommended_tx_size: MAX_RECOMMENDED_TX_SIZE,
        }
    }
}

/// A transaction together with its position and author.
#[derive(Debug, Clone)]
pub struct LoggedTransaction {
    pub id: TransactionId,
    pub author: AgentId,
    pub tx: Transaction,
}

impl LoggedTransaction {
    pub fn made_at(&self) -> u64 {
        self.tx.made_at()
    }
}

#[derive(Debug, Clone)]
pub struct CoValueCore {
    id: CoId,
    header: CoValueHeader,
    sessions: SessionMap,
    crypto: Arc<dyn CryptoProvider>,
}

impl CoValueCore {
    /// Create a CoValue from a header, deriving its id.
    pub fn new(
        header: CoValueHeader,
        crypto: Arc<dyn CryptoProvider>,
        config: &TransactionConfig,
    ) -> Result<Self> {
        let id = header.id(crypto.as_ref())?;
        Ok(Self::with_id(id, header, crypto, config))
    }

    /// Create a CoValue from a header received under `id`.
    pub fn from_received_header(
        id: CoId,
        header: CoValueHeader,
        crypto: Arc<dyn CryptoProvider>,
        config: &TransactionConfig,
    ) -> Result<Self> {
        if header.id(crypto.as_ref())? != id {
            return Err(CoreError::HeaderMismatch(id));
        }
        Ok(Self::with_id(id, header, crypto, config))
    }

    fn with_id(
        id: CoId,
        header: CoValueHeader,
        crypto: Arc<dyn CryptoProvider>,
        config: &TransactionConfig,
    ) -> Self {
        let sessions = SessionMap::new(
            id.clone(),
            Arc::clone(&crypto),
            config.max_recommended_tx_size,
        );
        Self {
            id,
            header,
            sessions,
            crypto,
        }
    }

    pub fn id(&self) -> &CoId {
        &self.id
    }

    pub fn header(&self) -> &CoValueHeader {
        &self.header
    }

    pub fn sessions(&self) -> &SessionMap {
        &self.sessions
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoProvider> {
        &self.crypto
    }

    pub fn priority(&self) -> CoValuePriority {
        CoValuePriority::from_header(&self.header)
    }

    pub fn known_state(&self) -> &KnownState {
        self.sessions.known_state()
    }

    pub fn known_state_with_streaming(&self) -> &KnownState {
        self.sessions.known_state_with_streaming()
    }

    pub fn is_streaming(&self) -> bool {
        self.sessions.is_streaming()
    }

    pub fn is_deleted(&self) -> bool {
        self.sessions.is_deleted()
    }

    pub fn set_streaming_known_state(&mut self, sessions: &KnownSessions) {
        self.sessions.set_streaming_known_state(sessions);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply transactions produced elsewhere.
    ///
    /// A batch in a delete session must be a single well-formed delete
    /// marker; accepting it turns the CoValue into a tombstone.
    pub fn try_add_transactions(
        &mut self,
        session_id: &SessionId,
        txs: &[Transaction],
        signature: &Signature,
        skip_verify: bool,
    ) -> Result<()> {
        if txs.is_empty() {
            return Ok(());
        }

        let is_delete = if session_id.is_delete_session() {
            self.check_delete_batch(session_id, txs)?;
            true
        } else {
            false
        };

        self.sessions
            .add_transactions(session_id, None, txs, signature, skip_verify)?;

        if is_delete {
            self.sessions.mark_as_deleted();
        }
        Ok(())
    }

    fn check_delete_batch(&self, session_id: &SessionId, txs: &[Transaction]) -> Result<()> {
        if self.header.is_group() {
            return Err(CoreError::InvalidDelete("groups cannot be deleted".into()));
        }
        if self.sessions.transaction_count(session_id) > 0 || txs.len() > 1 {
            return Err(CoreError::InvalidDelete(
                "delete transaction must be the only transaction in its session".into(),
            ));
        }
        match delete_marker(&txs[0]) {
            Some(target) if target == self.id.as_str() => Ok(()),
            Some(target) => Err(CoreError::InvalidDelete(format!(
                "delete marker for {} applied to {}",
                target, self.id
            ))),
            None => Err(CoreError::InvalidDelete("missing delete marker".into())),
        }
    }

    /// Write a new local transaction in the identity's session.
    pub fn make_transaction(
        &mut self,
        identity: &Identity,
        changes: &[Value],
        privacy: Privacy,
        meta: Option<&Value>,
        made_at: u64,
    ) -> Result<Transaction> {
        let (tx, _) = match privacy {
            Privacy::Trusting => self.sessions.make_new_trusting_transaction(
                identity.session_id(),
                identity.secret(),
                changes,
                meta,
                made_at,
            )?,
            Privacy::Private { key_id, key_secret } => {
                self.sessions.make_new_private_transaction(
                    identity.session_id(),
                    identity.secret(),
                    changes,
                    &key_id,
                    &key_secret,
                    meta,
                    made_at,
                )?
            }
        };
        Ok(tx)
    }

    /// Record a delete marker in a fresh delete session and tombstone the value.
    ///
    /// Permission checks belong to the caller, which knows the owning group.
    pub fn delete(&mut self, identity: &Identity, made_at: u64) -> Result<SessionId> {
        if self.header.is_group() {
            return Err(CoreError::InvalidDelete("groups cannot be deleted".into()));
        }
        let delete_session = self.crypto.new_delete_session_id(identity.agent_id());
        if self.is_deleted() {
            return Ok(delete_session);
        }
        let meta = json!({ "deleted": self.id });
        self.sessions.make_new_trusting_transaction(
            &delete_session,
            identity.secret(),
            &[],
            Some(&meta),
            made_at,
        )?;
        self.sessions.mark_as_deleted();
        Ok(delete_session)
    }

    /// An independent copy rebuilt by replaying every session unverified.
    pub fn clone_verified(&self, config: &TransactionConfig) -> Result<Self> {
        let mut copy = Self::with_id(
            self.id.clone(),
            self.header.clone(),
            Arc::clone(&self.crypto),
            config,
        );
        for (session_id, log) in self.sessions.iter() {
            // Span by span, so the copy records the same checkpoints.
            for span in split_at_checkpoints(log, 0) {
                copy.sessions.add_transactions(
                    session_id,
                    Some(log.signer_id().clone()),
                    &span.new_transactions,
                    &span.last_signature,
                    true,
                )?;
            }
        }
        if self.is_deleted() {
            copy.sessions.mark_as_deleted();
        }
        Ok(copy)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Every transaction, ordered by `madeAt`, then session, then index.
    pub fn transactions(&self) -> Vec<LoggedTransaction> {
        let mut all = Vec::new();
        for (session_id, log) in self.sessions.iter() {
            let Ok(author) = session_id.agent_id() else {
                continue;
            };
            for (idx, tx) in log.transactions().iter().enumerate() {
                all.push(LoggedTransaction {
                    id: TransactionId {
                        session_id: session_id.clone(),
                        tx_index: idx,
                    },
                    author: author.clone(),
                    tx: tx.clone(),
                });
            }
        }
        all.sort_by(|a, b| {
            a.made_at()
                .cmp(&b.made_at())
                .then_with(|| a.id.cmp(&b.id))
        });
        all
    }

    /// CoValues that must reach a peer before this one.
    pub fn depended_on_co_values(&self) -> Vec<CoId> {
        let mut deps = Vec::new();
        match &self.header.ruleset {
            Ruleset::OwnedByGroup { group, .. } => deps.push(group.clone()),
            Ruleset::Group { .. } => {
                for (_, log) in self.sessions.iter() {
                    collect_parent_refs(log.transactions(), &mut deps);
                }
            }
            Ruleset::UnsafeAllowAll => {}
        }
        deps
    }

    /// Build the CONTENT pieces a peer at `known` is missing.
    ///
    /// Each session is split at its signature checkpoints; piece `k` carries
    /// the k-th span of every session. The header rides in the first piece
    /// when the peer lacks it. When more than one piece is produced, or this
    /// CoValue is itself still streaming in, the first piece announces the
    /// final state through `expectContentUntil`.
    pub fn new_content_since(&self, known: Option<&KnownState>) -> Option<Vec<NewContent>> {
        let empty = BTreeMap::new();
        let known_sessions = known.map_or(&empty, |k| &k.sessions);
        let send_header = !known.map_or(false, |k| k.header);

        let mut spans = BTreeMap::new();
        for (session_id, log) in self.sessions.iter() {
            let from = known_sessions.get(session_id).copied().unwrap_or(0) as usize;
            if from >= log.len() {
                continue;
            }
            let session_spans = split_at_checkpoints(log, from);
            if !session_spans.is_empty() {
                spans.insert(session_id.clone(), session_spans);
            }
        }

        let until = sessions_to_send(known_sessions, &self.known_state_with_streaming().sessions);
        let pieces = assemble_pieces(
            &self.id,
            send_header.then_some(&self.header),
            self.priority(),
            spans,
            Some(until),
            self.is_streaming(),
        );

        if pieces.is_empty() {
            None
        } else {
            Some(pieces)
        }
    }
}

/// Spans of `log` from `from`, each ending at a checkpoint or at the head.
fn split_at_checkpoints(log: &SessionLog, from: usize) -> Vec<SessionNewContent> {
    let mut spans = Vec::new();
    let mut start = from;
    for (&idx, signature) in log.signature_after().range(from..) {
        spans.push(SessionNewContent {
            after: start as u32,
            new_transactions: log.transactions()[start..=idx].to_vec(),
            last_signature: signature.clone(),
        });
        start = idx + 1;
    }
    if start < log.len() {
        if let Some(signature) = log.last_signature() {
            spans.push(SessionNewContent {
                after: start as u32,
                new_transactions: log.transactions()[start..].to_vec(),
                last_signature: signature.clone(),
            });
        }
    }
    spans
}

/// The CoValue a delete marker points at, if `tx` is one.
pub fn delete_marker(tx: &Transaction) -> Option<String> {
    let meta = tx.trusting_meta()?;
    meta.get("deleted")?.as_str().map(str::to_string)
}

fn collect_parent_refs(txs: &[Transaction], deps: &mut Vec<CoId>) {
    for tx in txs {
        let Transaction::Trusting(tx) = tx else {
            continue;
        };
        let Ok(ops) = serde_json::from_str::<Vec<MapOp>>(&tx.changes) else {
            continue;
        };
        for op in ops {
            if let Some(parent) = op.key().strip_prefix("parent_") {
                let parent = CoId::new_unchecked(parent);
                if !deps.contains(&parent) {
                    deps.push(parent);
                }
            }
        }
    }
}

/// Dependencies visible in a CONTENT piece before the CoValue is known locally.
pub fn content_dependencies(content: &NewContent) -> Vec<CoId> {
    match &content.header {
        Some(header) => dependencies_of(
            header,
            content.new.values().map(|s| s.new_transactions.as_slice()),
        ),
        None => Vec::new(),
    }
}

/// The owning group, or for groups the parents referenced in `txs`.
pub fn dependencies_of<'a>(
    header: &CoValueHeader,
    txs: impl IntoIterator<Item = &'a [Transaction]>,
) -> Vec<CoId> {
    let mut deps = Vec::new();
    if let Some(group) = header.owner_group() {
        deps.push(group.clone());
    }
    if header.is_group() {
        for batch in txs {
            collect_parent_refs(batch, &mut deps);
        }
    }
    deps
}
