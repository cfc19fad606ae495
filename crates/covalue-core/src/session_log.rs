//! SessionLog: one append-only, hash-chained, signed transaction sequence.
//!
//! Every accepted batch extends a running BLAKE3 hash and is covered by an
//! Ed25519 signature over that hash. Signature checkpoints are kept once the
//! bytes since the previous checkpoint exceed `max_recommended_tx_size`, so
//! long histories can later be streamed in verifiable chunks.

use std::collections::BTreeMap;

use crate::crypto::{AgentSecret, CryptoProvider, Signature, StreamingHash};
use crate::error::{CoreError, Result};
use crate::ids::{CoId, SessionId, SignerId};
use crate::stable::stable_bytes;
use crate::transaction::Transaction;

/// Default checkpoint threshold in bytes.
pub const MAX_RECOMMENDED_TX_SIZE: usize = 100 * 1024;

/// Whether adding `add` bytes to `base` crosses the checkpoint threshold.
pub fn exceeds_recommended_size(base: usize, add: usize, max: usize) -> bool {
    base + add > max
}

#[derive(Debug, Clone)]
pub struct SessionLog {
    session_id: SessionId,
    signer_id: SignerId,
    transactions: Vec<Transaction>,
    last_signature: Option<Signature>,
    signature_after: BTreeMap<usize, Signature>,
    hasher: StreamingHash,
    bytes_since_last_signature: usize,
    max_recommended_tx_size: usize,
}

impl SessionLog {
    pub fn new(
        session_id: SessionId,
        signer_id: SignerId,
        crypto: &dyn CryptoProvider,
        max_recommended_tx_size: usize,
    ) -> Self {
        Self {
            session_id,
            signer_id,
            transactions: Vec::new(),
            last_signature: None,
            signature_after: BTreeMap::new(),
            hasher: crypto.new_streaming_hash(),
            bytes_since_last_signature: 0,
            max_recommended_tx_size,
        }
    }

    /// Append a verified batch.
    ///
    /// The hash is advanced on a copy and only committed once the signature
    /// checks out, so a rejected batch leaves the log untouched.
    pub fn try_add(
        &mut self,
        crypto: &dyn CryptoProvider,
        co_id: &CoId,
        txs: &[Transaction],
        signature: &Signature,
        skip_verify: bool,
    ) -> Result<()> {
        let mut next = self.hasher.clone();
        for tx in txs {
            next.update(&stable_bytes(tx)?);
        }

        if !skip_verify {
            let digest = next.digest();
            let valid = crypto.verify(&self.signer_id, digest.as_str().as_bytes(), signature)?;
            if !valid {
                tracing::warn!(id = %co_id, session = %self.session_id, "Signature verification failed");
                return Err(CoreError::SignatureVerification {
                    id: co_id.clone(),
                    session: self.session_id.clone(),
                });
            }
        }

        self.hasher = next;
        let added: usize = txs.iter().map(Transaction::size).sum();
        self.transactions.extend_from_slice(txs);
        self.record_signature(added, signature.clone());
        Ok(())
    }

    /// Append a locally produced transaction and sign the new hash.
    pub fn add_new_transaction(
        &mut self,
        crypto: &dyn CryptoProvider,
        secret: &AgentSecret,
        tx: Transaction,
    ) -> Result<Signature> {
        let mut next = self.hasher.clone();
        next.update(&stable_bytes(&tx)?);
        let signature = crypto.sign(secret, next.digest().as_str().as_bytes())?;

        self.hasher = next;
        let size = tx.size();
        self.transactions.push(tx);
        self.record_signature(size, signature.clone());
        Ok(signature)
    }

    fn record_signature(&mut self, added: usize, signature: Signature) {
        if exceeds_recommended_size(
            self.bytes_since_last_signature,
            added,
            self.max_recommended_tx_size,
        ) {
            if let Some(last) = self.transactions.len().checked_sub(1) {
                self.signature_after.insert(last, signature.clone());
            }
            self.bytes_since_last_signature = 0;
        } else {
            self.bytes_since_last_signature += added;
        }
        self.last_signature = Some(signature);
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn signer_id(&self) -> &SignerId {
        &self.signer_id
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn last_signature(&self) -> Option<&Signature> {
        self.last_signature.as_ref()
    }

    /// Checkpoint signatures, keyed by the index of the last covered transaction.
    pub fn signature_after(&self) -> &BTreeMap<usize, Signature> {
        &self.signature_after
    }

    pub fn bytes_since_last_signature(&self) -> usize {
        self.bytes_since_last_signature
    }

    /// Current head of the hash chain.
    pub fn current_hash(&self) -> crate::crypto::Hash {
        self.hasher.digest()
    }
}
