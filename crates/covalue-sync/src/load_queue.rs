//! Outgoing load queue.
//!
//! Limits how many LOAD requests are in flight towards one peer. Pending
//! requests wait in two FIFO tiers: high priority for CoValues the caller is
//! blocked on, low priority for refreshing data already usable. A single
//! timer expires in-flight loads that get no answer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use covalue_core::CoId;

use crate::messages::PeerId;

/// Load queue tuning.
#[derive(Debug, Clone)]
pub struct LoadQueueConfig {
    pub max_in_flight_loads_per_peer: usize,

    /// Time an in-flight load may go without any answer.
    pub timeout: Duration,
}

impl Default for LoadQueueConfig {
    fn default() -> Self {
        Self {
            max_in_flight_loads_per_peer: 10,
            timeout: Duration::from_secs(30),
        }
    }
}

/// How to enqueue a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    #[default]
    Normal,
    /// Processed after every normal request.
    LowPriority,
    /// Sent at once, ignoring the in-flight cap.
    Immediate,
}

/// Sends the LOAD request once the queue admits it.
pub type SendLoad = Box<dyn FnOnce() + Send>;

/// Called for each load that timed out.
pub type TimeoutHook = Arc<dyn Fn(&CoId) + Send + Sync>;

struct PendingLoad {
    id: CoId,
    send: SendLoad,
}

#[derive(Default)]
struct QueueState {
    in_flight: HashMap<CoId, Instant>,
    high: VecDeque<PendingLoad>,
    low: VecDeque<PendingLoad>,
    requested: HashSet<CoId>,
    timer: Option<JoinHandle<()>>,
}

struct Shared {
    peer: PeerId,
    config: LoadQueueConfig,
    on_timeout: TimeoutHook,
    state: Mutex<QueueState>,
}

/// Per-peer load throttle.
#[derive(Clone)]
pub struct OutgoingLoadQueue {
    shared: Arc<Shared>,
}

impl OutgoingLoadQueue {
    pub fn new(peer: PeerId, config: LoadQueueConfig, on_timeout: TimeoutHook) -> Self {
        Self {
            shared: Arc::new(Shared {
                peer,
                config,
                on_timeout,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Queue a load of `id`; `send` runs when it is admitted.
    ///
    /// A load already pending or in flight is not queued again. A normal or
    /// immediate enqueue upgrades a pending low-priority one.
    pub fn enqueue(&self, id: &CoId, send: impl FnOnce() + Send + 'static, mode: LoadMode) {
        let mut admitted = Vec::new();
        {
            let mut state = self.shared.lock();
            if state.in_flight.contains_key(id) || state.requested.contains(id) {
                if mode != LoadMode::LowPriority {
                    if let Some(pos) = state.low.iter().position(|p| p.id == *id) {
                        if let Some(pending) = state.low.remove(pos) {
                            if mode == LoadMode::Immediate {
                                self.shared.track_sent(&mut state, &pending.id);
                                admitted.push(pending.send);
                            } else {
                                state.high.push_back(pending);
                                self.shared.admit(&mut state, &mut admitted);
                            }
                        }
                    }
                }
            } else {
                state.requested.insert(id.clone());
                let pending = PendingLoad {
                    id: id.clone(),
                    send: Box::new(send),
                };
                match mode {
                    LoadMode::Immediate => {
                        self.shared.track_sent(&mut state, id);
                        admitted.push(pending.send);
                    }
                    LoadMode::LowPriority => {
                        state.low.push_back(pending);
                        self.shared.admit(&mut state, &mut admitted);
                    }
                    LoadMode::Normal => {
                        state.high.push_back(pending);
                        self.shared.admit(&mut state, &mut admitted);
                    }
                }
            }
        }
        run_all(admitted);
    }

    /// The peer answered part of an in-flight load; restart its timeout.
    pub fn track_update(&self, id: &CoId) {
        let mut state = self.shared.lock();
        if let Some(sent_at) = state.in_flight.get_mut(id) {
            *sent_at = Instant::now();
        }
    }

    /// The load finished. Streaming loads keep their slot until the last piece.
    pub fn track_complete(&self, id: &CoId, still_streaming: bool) {
        if still_streaming {
            return;
        }
        let mut admitted = Vec::new();
        {
            let mut state = self.shared.lock();
            if state.in_flight.remove(id).is_none() {
                return;
            }
            state.requested.remove(id);
            self.shared.admit(&mut state, &mut admitted);
        }
        run_all(admitted);
    }

    /// Drop everything without firing any callback.
    pub fn clear(&self) {
        let mut state = self.shared.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        *state = QueueState::default();
    }

    pub fn in_flight_count(&self) -> usize {
        self.shared.lock().in_flight.len()
    }

    pub fn pending_count(&self) -> usize {
        let state = self.shared.lock();
        state.high.len() + state.low.len()
    }

    pub fn is_in_flight(&self, id: &CoId) -> bool {
        self.shared.lock().in_flight.contains_key(id)
    }
}

fn run_all(sends: Vec<SendLoad>) {
    for send in sends {
        send();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Queue state is plain data; a panic mid-update leaves it usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn can_send(&self, state: &QueueState) -> bool {
        state.in_flight.len() < self.config.max_in_flight_loads_per_peer
    }

    /// Move pending loads into flight while there is room.
    fn admit(self: &Arc<Self>, state: &mut QueueState, admitted: &mut Vec<SendLoad>) {
        while self.can_send(state) {
            let Some(next) = state.high.pop_front().or_else(|| state.low.pop_front()) else {
                break;
            };
            self.track_sent(state, &next.id);
            admitted.push(next.send);
        }
    }

    fn track_sent(self: &Arc<Self>, state: &mut QueueState, id: &CoId) {
        state.in_flight.insert(id.clone(), Instant::now());
        let timer_running = state.timer.as_ref().map_or(false, |t| !t.is_finished());
        if !timer_running {
            let shared = Arc::clone(self);
            state.timer = Some(tokio::spawn(async move { shared.run_timer().await }));
        }
    }

    async fn run_timer(self: Arc<Self>) {
        loop {
            let deadline = {
                let mut state = self.lock();
                match state.in_flight.values().min().copied() {
                    Some(sent_at) => sent_at + self.config.timeout,
                    None => {
                        state.timer = None;
                        return;
                    }
                }
            };
            tokio::time::sleep_until(deadline).await;

            let now = Instant::now();
            let mut timed_out = Vec::new();
            let mut admitted = Vec::new();
            {
                let mut state = self.lock();
                let expired: Vec<CoId> = state
                    .in_flight
                    .iter()
                    .filter(|(_, sent_at)| now >= **sent_at + self.config.timeout)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in expired {
                    state.in_flight.remove(&id);
                    state.requested.remove(&id);
                    timed_out.push(id);
                }
                self.admit(&mut state, &mut admitted);
            }

            for id in &timed_out {
                tracing::warn!(id = %id, peer = %self.peer, "Load request timed out");
                (self.on_timeout)(id);
            }
            run_all(admitted);
        }
    }
}
