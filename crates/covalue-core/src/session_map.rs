//! SessionMap: every session log of one CoValue.
//!
//! Keeps the known state in step with the logs. Derived state (the known
//! state including streaming expectations) is held in explicit cache fields
//! recomputed by [`SessionMap::invalidate_caches`] after every mutation.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::crypto::{AgentSecret, CryptoProvider, KeySecret, Signature};
use crate::error::{CoreError, Result};
use crate::ids::{CoId, KeyId, SessionId, SignerId};
use crate::known_state::{combine_sessions, is_sessions_subset, KnownSessions, KnownState};
use crate::session_log::SessionLog;
use crate::stable::stable_stringify;
use crate::transaction::{
    meta_nonce_material, transaction_nonce_material, PrivateTransaction, Transaction,
    TrustingTransaction,
};

#[derive(Debug, Clone)]
pub struct SessionMap {
    id: CoId,
    sessions: BTreeMap<SessionId, SessionLog>,
    known_state: KnownState,
    streaming_known_state: Option<KnownSessions>,
    known_state_with_streaming: KnownState,
    is_deleted: bool,
    max_recommended_tx_size: usize,
    crypto: Arc<dyn CryptoProvider>,
}

impl SessionMap {
    pub fn new(id: CoId, crypto: Arc<dyn CryptoProvider>, max_recommended_tx_size: usize) -> Self {
        let mut known_state = KnownState::empty(id.clone());
        known_state.header = true;
        Self {
            id,
            sessions: BTreeMap::new(),
            known_state_with_streaming: known_state.clone(),
            known_state,
            streaming_known_state: None,
            is_deleted: false,
            max_recommended_tx_size,
            crypto,
        }
    }

    /// Append a batch received from elsewhere.
    ///
    /// `signer` defaults to the signer of the agent that owns the session.
    pub fn add_transactions(
        &mut self,
        session_id: &SessionId,
        signer: Option<SignerId>,
        txs: &[Transaction],
        signature: &Signature,
        skip_verify: bool,
    ) -> Result<()> {
        if self.is_deleted && !session_id.is_delete_session() {
            return Err(CoreError::DeletedCoValue(self.id.clone()));
        }
        if txs.is_empty() {
            return Ok(());
        }

        match self.sessions.get_mut(session_id) {
            Some(log) => log.try_add(self.crypto.as_ref(), &self.id, txs, signature, skip_verify)?,
            None => {
                let signer = match signer {
                    Some(signer) => signer,
                    None => session_id.agent_id()?.signer_id(),
                };
                let mut log = SessionLog::new(
                    session_id.clone(),
                    signer,
                    self.crypto.as_ref(),
                    self.max_recommended_tx_size,
                );
                log.try_add(self.crypto.as_ref(), &self.id, txs, signature, skip_verify)?;
                self.sessions.insert(session_id.clone(), log);
            }
        }

        self.update_known(session_id);
        Ok(())
    }

    pub fn make_new_trusting_transaction(
        &mut self,
        session_id: &SessionId,
        secret: &AgentSecret,
        changes: &[Value],
        meta: Option<&Value>,
        made_at: u64,
    ) -> Result<(Transaction, Signature)> {
        self.guard_local_write(session_id)?;
        let tx = Transaction::Trusting(TrustingTransaction {
            made_at,
            changes: stable_stringify(changes)?,
            meta: meta.map(stable_stringify).transpose()?,
        });
        self.append_local(session_id, secret, tx)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn make_new_private_transaction(
        &mut self,
        session_id: &SessionId,
        secret: &AgentSecret,
        changes: &[Value],
        key_id: &KeyId,
        key_secret: &KeySecret,
        meta: Option<&Value>,
        made_at: u64,
    ) -> Result<(Transaction, Signature)> {
        self.guard_local_write(session_id)?;
        let idx = self.sessions.get(session_id).map_or(0, SessionLog::len);
        let nonce = transaction_nonce_material(&self.id, session_id, idx)?;
        let encrypted_changes = self.crypto.encrypt(
            stable_stringify(changes)?.as_bytes(),
            key_secret,
            &nonce,
        )?;
        let meta = match meta {
            Some(meta) => {
                let nonce = meta_nonce_material(&self.id, session_id, idx)?;
                Some(self.crypto.encrypt(stable_stringify(meta)?.as_bytes(), key_secret, &nonce)?)
            }
            None => None,
        };
        let tx = Transaction::Private(PrivateTransaction {
            made_at,
            key_used: key_id.clone(),
            encrypted_changes,
            meta,
        });
        self.append_local(session_id, secret, tx)
    }

    fn guard_local_write(&self, session_id: &SessionId) -> Result<()> {
        if self.is_deleted && !session_id.is_delete_session() {
            return Err(CoreError::DeletedCoValue(self.id.clone()));
        }
        Ok(())
    }

    fn append_local(
        &mut self,
        session_id: &SessionId,
        secret: &AgentSecret,
        tx: Transaction,
    ) -> Result<(Transaction, Signature)> {
        let crypto = Arc::clone(&self.crypto);
        if !self.sessions.contains_key(session_id) {
            let signer = crypto.agent_id(secret)?.signer_id();
            self.sessions.insert(
                session_id.clone(),
                SessionLog::new(
                    session_id.clone(),
                    signer,
                    crypto.as_ref(),
                    self.max_recommended_tx_size,
                ),
            );
        }
        let log = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CoreError::InvalidId(session_id.to_string()))?;
        let signature = log.add_new_transaction(crypto.as_ref(), secret, tx.clone())?;
        self.update_known(session_id);
        Ok((tx, signature))
    }

    /// Plaintext changes of the transaction at `idx`.
    ///
    /// Trusting transactions need no key. Private ones are decrypted with
    /// `key_secret`; a wrong key is an error, never garbage.
    pub fn decrypt_transaction(
        &self,
        session_id: &SessionId,
        idx: usize,
        key_secret: Option<&KeySecret>,
    ) -> Result<String> {
        match self.transaction(session_id, idx)? {
            Transaction::Trusting(tx) => Ok(tx.changes.clone()),
            Transaction::Private(tx) => {
                let key = key_secret.ok_or_else(|| {
                    CoreError::Decryption(format!("no key for {}", tx.key_used))
                })?;
                let nonce = transaction_nonce_material(&self.id, session_id, idx)?;
                let bytes = self.crypto.decrypt(&tx.encrypted_changes, key, &nonce)?;
                String::from_utf8(bytes).map_err(|e| CoreError::Decryption(e.to_string()))
            }
        }
    }

    /// Plaintext meta of the transaction at `idx`, if it has any.
    pub fn decrypt_transaction_meta(
        &self,
        session_id: &SessionId,
        idx: usize,
        key_secret: Option<&KeySecret>,
    ) -> Result<Option<String>> {
        match self.transaction(session_id, idx)? {
            Transaction::Trusting(tx) => Ok(tx.meta.clone()),
            Transaction::Private(tx) => {
                let Some(meta) = &tx.meta else {
                    return Ok(None);
                };
                let key = key_secret.ok_or_else(|| {
                    CoreError::Decryption(format!("no key for {}", tx.key_used))
                })?;
                let nonce = meta_nonce_material(&self.id, session_id, idx)?;
                let bytes = self.crypto.decrypt(meta, key, &nonce)?;
                String::from_utf8(bytes)
                    .map(Some)
                    .map_err(|e| CoreError::Decryption(e.to_string()))
            }
        }
    }

    fn transaction(&self, session_id: &SessionId, idx: usize) -> Result<&Transaction> {
        self.sessions
            .get(session_id)
            .and_then(|log| log.transactions().get(idx))
            .ok_or_else(|| CoreError::TransactionNotFound {
                session: session_id.clone(),
                idx,
            })
    }

    fn update_known(&mut self, session_id: &SessionId) {
        let count = self.sessions.get(session_id).map_or(0, SessionLog::len) as u32;
        self.known_state.sessions.insert(session_id.clone(), count);
        self.invalidate_caches();
    }

    /// Recompute derived state after a mutation.
    ///
    /// Streaming expectations are dropped once the real known state covers them.
    pub fn invalidate_caches(&mut self) {
        if let Some(streaming) = &self.streaming_known_state {
            if is_sessions_subset(streaming, &self.known_state.sessions) {
                self.streaming_known_state = None;
            }
        }
        let mut with_streaming = self.known_state.clone();
        if let Some(streaming) = &self.streaming_known_state {
            combine_sessions(&mut with_streaming.sessions, streaming);
        }
        self.known_state_with_streaming = with_streaming;
    }

    /// Record sessions announced by `expectContentUntil`.
    pub fn set_streaming_known_state(&mut self, sessions: &KnownSessions) {
        if self.is_deleted || is_sessions_subset(sessions, &self.known_state.sessions) {
            return;
        }
        let streaming = self.streaming_known_state.get_or_insert_with(BTreeMap::new);
        combine_sessions(streaming, sessions);
        self.invalidate_caches();
    }

    /// Forget every non-delete session; only the tombstone remains.
    pub fn mark_as_deleted(&mut self) {
        self.is_deleted = true;
        self.sessions.retain(|id, _| id.is_delete_session());
        self.known_state
            .sessions
            .retain(|id, _| id.is_delete_session());
        self.streaming_known_state = None;
        self.invalidate_caches();
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming_known_state.is_some()
    }

    pub fn known_state(&self) -> &KnownState {
        &self.known_state
    }

    pub fn known_state_with_streaming(&self) -> &KnownState {
        &self.known_state_with_streaming
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&SessionLog> {
        self.sessions.get(session_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SessionId, &SessionLog)> {
        self.sessions.iter()
    }

    pub fn transaction_count(&self, session_id: &SessionId) -> usize {
        self.sessions.get(session_id).map_or(0, SessionLog::len)
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoProvider> {
        &self.crypto
    }
}
