//! Background erasure of deleted CoValues.
//!
//! Erasure keeps the header and delete sessions as a tombstone and drops
//! everything else. Passes start only after a quiet period, stop at a
//! wall-clock budget on bounded clients, and yield to any store or load
//! that arrives mid-pass. Leftover work is rescheduled.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::storage::StorageShared;

/// How a pass ended, with the number of CoValues erased.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErasePass {
    Complete(usize),
    Interrupted(usize),
}

/// Wakes the scheduler and cancels the running pass.
pub(crate) struct EraserSignal {
    wake: Notify,
    activity: Notify,
    current: Mutex<Option<CancellationToken>>,
}

impl EraserSignal {
    pub(crate) fn new() -> Self {
        Self {
            wake: Notify::new(),
            activity: Notify::new(),
            current: Mutex::new(None),
        }
    }

    /// Request a pass. Coalesces with any pending request.
    pub(crate) fn schedule(&self) {
        self.wake.notify_one();
    }

    /// Storage activity: cancel the running pass and restart the quiet period.
    pub(crate) fn interrupt(&self) {
        if let Ok(current) = self.current.lock() {
            if let Some(token) = current.as_ref() {
                token.cancel();
            }
        }
        self.activity.notify_waiters();
    }

    fn begin_pass(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut current) = self.current.lock() {
            *current = Some(token.clone());
        }
        token
    }

    fn end_pass(&self) {
        if let Ok(mut current) = self.current.lock() {
            *current = None;
        }
    }
}

/// Erase queued CoValues until done, cancelled, or out of `budget`.
pub(crate) async fn erase_pass(
    shared: &StorageShared,
    token: &CancellationToken,
    budget: Option<Duration>,
) -> Result<ErasePass> {
    let started = Instant::now();
    let queued = shared.client.get_all_co_values_waiting_for_delete().await?;
    let mut erased = 0;

    for id in queued {
        if token.is_cancelled() || budget.map_or(false, |b| started.elapsed() >= b) {
            tracing::debug!(erased, "Erasure pass interrupted");
            return Ok(ErasePass::Interrupted(erased));
        }
        shared.client.erase_co_value_but_keep_tombstone(&id).await?;
        shared.forget_known_state(&id);
        erased += 1;
    }

    if erased > 0 {
        tracing::info!(erased, "Erased deleted covalues");
    }
    Ok(ErasePass::Complete(erased))
}

/// Run passes whenever scheduled, until `shutdown`.
pub(crate) fn spawn_scheduler(
    shared: Arc<StorageShared>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = shared.eraser.wake.notified() => {}
            }

            // Quiet period: any activity restarts it.
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = shared.eraser.activity.notified() => continue,
                    _ = tokio::time::sleep(shared.config.erase_idle_delay) => break,
                }
            }

            let budget = shared
                .client
                .bounded_erasure()
                .then_some(shared.config.erase_budget);
            let token = shared.eraser.begin_pass();
            let outcome = erase_pass(&shared, &token, budget).await;
            shared.eraser.end_pass();

            match outcome {
                Ok(ErasePass::Complete(_)) => {}
                Ok(ErasePass::Interrupted(_)) => shared.eraser.schedule(),
                Err(e) => tracing::warn!(error = %e, "Erasure pass failed"),
            }
        }
    })
}
