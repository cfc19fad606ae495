//! Serialized write queue.
//!
//! Every store goes through one worker so writes for a CoValue land in the
//! order they were queued and a correction never races the write it repairs.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use covalue_core::NewContent;

use crate::error::{Result, StoreError};
use crate::storage::{CorrectionCallback, StorageShared};

struct StoreRequest {
    content: NewContent,
    correction: Option<CorrectionCallback>,
    done: oneshot::Sender<bool>,
}

pub struct StoreQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<StoreRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StoreQueue {
    pub(crate) fn spawn(shared: Arc<StorageShared>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<StoreRequest>();
        let worker = tokio::spawn(async move {
            while let Some(request) = receiver.recv().await {
                let stored = shared.store(request.content, request.correction).await;
                // The caller may have stopped waiting.
                let _ = request.done.send(stored);
            }
            tracing::debug!("Store queue drained");
        });

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue a store. Fails with [`StoreError::Closed`] after [`close`](Self::close).
    pub fn push(
        &self,
        content: NewContent,
        correction: Option<CorrectionCallback>,
    ) -> Result<oneshot::Receiver<bool>> {
        let sender = self
            .sender
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        let sender = sender.as_ref().ok_or(StoreError::Closed)?;

        let (done, receiver) = oneshot::channel();
        sender
            .send(StoreRequest {
                content,
                correction,
                done,
            })
            .map_err(|_| StoreError::Closed)?;
        Ok(receiver)
    }

    /// Stop accepting stores and wait for queued ones to finish.
    pub async fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let worker = self.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Store worker failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{CorrectionCallback, StorageApi, StorageConfig};
    use covalue_core::{
        AgentSecret, CoId, CoValueCore, CoValueHeader, CoValueType, DefaultCrypto, Identity,
        Privacy, TransactionConfig,
    };
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_close_drains_queued_stores() {
        let me = Identity::new(&DefaultCrypto, AgentSecret::from_seed(&[9; 32])).unwrap();
        let header = CoValueHeader::owned_by(
            CoValueType::Comap,
            CoId::new_unchecked("co_zgroup"),
            None,
            "q",
        );
        let mut core =
            CoValueCore::new(header, Arc::new(DefaultCrypto), &TransactionConfig::default())
                .unwrap();

        let storage = StorageApi::in_memory(StorageConfig::default());
        let none: CorrectionCallback = Arc::new(|_| None);
        let mut pending = Vec::new();
        let mut known = None;
        for i in 0..4u64 {
            core.make_transaction(
                &me,
                &[json!({"op": "set", "key": "n", "value": i})],
                Privacy::Trusting,
                None,
                i,
            )
            .unwrap();
            for piece in core.new_content_since(known.as_ref()).unwrap() {
                pending.push(storage.store(piece, Arc::clone(&none)).unwrap());
            }
            known = Some(core.known_state().clone());
        }

        storage.close().await;
        for done in pending {
            assert!(done.await.unwrap());
        }
        let stored = storage.load_known_state(core.id()).await.unwrap();
        assert_eq!(&stored, core.known_state());
    }
}
