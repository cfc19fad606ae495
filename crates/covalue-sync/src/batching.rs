//! Batched outgoing messages.
//!
//! Egress to one peer. When the channel is open and idle a message is sent
//! on the spot. Otherwise it is queued by priority and a single drain task
//! sends it once the channel is open and its buffer has room, joining small
//! messages into newline-separated frames.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use covalue_core::CoValuePriority;

use crate::channel::OutgoingChannel;
use crate::messages::{PeerMessage, SyncMessage};

/// Egress tuning.
#[derive(Debug, Clone)]
pub struct OutgoingConfig {
    /// Join queued messages into one frame.
    pub batching: bool,

    /// Upper bound for a joined frame.
    pub max_chunk_bytes: usize,

    /// Delay before a drain starts, so a burst can be prioritized and batched.
    pub chunk_delay: Duration,

    /// Buffered bytes above which the channel counts as congested.
    pub buffer_limit: usize,
}

impl Default for OutgoingConfig {
    fn default() -> Self {
        Self {
            batching: true,
            max_chunk_bytes: 25_000,
            chunk_delay: Duration::from_millis(5),
            buffer_limit: 100_000,
        }
    }
}

type CloseListener = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct PriorityQueue {
    high: VecDeque<SyncMessage>,
    medium: VecDeque<SyncMessage>,
    low: VecDeque<SyncMessage>,
}

impl PriorityQueue {
    fn push(&mut self, msg: SyncMessage) {
        match msg.priority() {
            CoValuePriority::High => self.high.push_back(msg),
            CoValuePriority::Medium => self.medium.push_back(msg),
            CoValuePriority::Low => self.low.push_back(msg),
        }
    }

    fn pull(&mut self) -> Option<SyncMessage> {
        self.high
            .pop_front()
            .or_else(|| self.medium.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn is_empty(&self) -> bool {
        self.high.is_empty() && self.medium.is_empty() && self.low.is_empty()
    }
}

struct EgressState {
    queue: PriorityQueue,
    backlog: String,
    processing: bool,
    closed: bool,
    batching: bool,
    close_listeners: Vec<CloseListener>,
}

struct Shared {
    channel: Arc<dyn OutgoingChannel>,
    config: OutgoingConfig,
    state: Mutex<EgressState>,
}

/// Prioritized, batched egress for one peer.
#[derive(Clone)]
pub struct BatchedOutgoingMessages {
    shared: Arc<Shared>,
}

impl BatchedOutgoingMessages {
    pub fn new(channel: Arc<dyn OutgoingChannel>, config: OutgoingConfig) -> Self {
        let state = EgressState {
            queue: PriorityQueue::default(),
            backlog: String::new(),
            processing: false,
            closed: false,
            batching: config.batching,
            close_listeners: Vec::new(),
        };
        Self {
            shared: Arc::new(Shared {
                channel,
                config,
                state: Mutex::new(state),
            }),
        }
    }

    /// Send or queue `msg`. [`PeerMessage::Disconnected`] closes the egress.
    ///
    /// Must be called inside a tokio runtime when the slow path is taken.
    pub fn push(&self, msg: impl Into<PeerMessage>) {
        let msg = match msg.into() {
            PeerMessage::Sync(msg) => msg,
            PeerMessage::Disconnected => {
                self.close();
                return;
            }
        };

        let mut state = self.shared.lock();
        if state.closed {
            tracing::debug!(id = %msg.id(), action = msg.action(), "Dropping message pushed after close");
            return;
        }

        if !state.processing && state.queue.is_empty() && self.shared.can_send_now() {
            self.shared.send_frame(&msg);
            return;
        }

        state.queue.push(msg);
        if !state.processing {
            state.processing = true;
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move { shared.drain().await });
        }
    }

    pub fn set_batching(&self, enabled: bool) {
        self.shared.lock().batching = enabled;
    }

    /// Run `listener` once the egress closes.
    pub fn on_close(&self, listener: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.lock();
        if state.closed {
            drop(state);
            listener();
            return;
        }
        state.close_listeners.push(Box::new(listener));
    }

    /// Process everything still queued, flush, and stop accepting messages.
    pub fn close(&self) {
        let listeners = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            while let Some(msg) = state.queue.pull() {
                self.shared.process_message(&mut state, &msg);
            }
            state.closed = true;
            self.shared.flush(&mut state);
            std::mem::take(&mut state.close_listeners)
        };
        for listener in listeners {
            listener();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Messages waiting for the drain task.
    pub fn queued(&self) -> usize {
        let state = self.shared.lock();
        state.queue.high.len() + state.queue.medium.len() + state.queue.low.len()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, EgressState> {
        // Egress state is plain data; a panic mid-update leaves it usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn can_send_now(&self) -> bool {
        self.channel.is_open() && self.channel.buffered_amount() < self.config.buffer_limit
    }

    fn send_frame(&self, msg: &SyncMessage) {
        match msg.to_frame() {
            Ok(frame) => self.send_raw(frame),
            Err(e) => tracing::error!(id = %msg.id(), error = %e, "Failed to encode message"),
        }
    }

    fn send_raw(&self, frame: String) {
        if let Err(e) = self.channel.send(frame) {
            tracing::warn!(error = %e, "Failed to send frame");
        }
    }

    fn process_message(&self, state: &mut EgressState, msg: &SyncMessage) {
        let frame = match msg.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(id = %msg.id(), error = %e, "Failed to encode message");
                return;
            }
        };

        if !state.batching {
            self.send_raw(frame);
            return;
        }

        let limit = self.config.max_chunk_bytes;
        if !state.backlog.is_empty() && state.backlog.len() + frame.len() > limit {
            self.flush(state);
        }
        let oversized = frame.len() >= limit;
        if state.backlog.is_empty() {
            state.backlog = frame;
        } else {
            state.backlog.push('\n');
            state.backlog.push_str(&frame);
        }
        if oversized {
            self.flush(state);
        }
    }

    fn flush(&self, state: &mut EgressState) {
        if !state.backlog.is_empty() && self.channel.is_open() {
            let frame = std::mem::take(&mut state.backlog);
            self.send_raw(frame);
        }
    }

    async fn drain(self: Arc<Self>) {
        tokio::time::sleep(self.config.chunk_delay).await;

        loop {
            {
                let mut state = self.lock();
                if state.closed {
                    return;
                }
                if state.queue.is_empty() {
                    self.flush(&mut state);
                    state.processing = false;
                    return;
                }
            }
            if !self.channel.is_open() && self.channel.wait_open().await.is_err() {
                tracing::debug!("Channel closed while draining");
                let mut state = self.lock();
                state.queue = PriorityQueue::default();
                state.processing = false;
                return;
            }
            if self.channel.buffered_amount() >= self.config.buffer_limit {
                self.channel.wait_buffer_below(self.config.buffer_limit).await;
            }

            // The head stays queued across the waits above so close() still sends it.
            let mut state = self.lock();
            if state.closed || !self.channel.is_open() {
                continue;
            }
            if let Some(msg) = state.queue.pull() {
                self.process_message(&mut state, &msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::{memory_channel, MemoryChannel, MemoryReceiver};
    use crate::messages::KnownStateMessage;
    use covalue_core::{CoId, NewContent};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn known(id: &str) -> SyncMessage {
        SyncMessage::Known(KnownStateMessage::not_found(CoId::new_unchecked(id)))
    }

    fn content(id: &str, priority: CoValuePriority) -> SyncMessage {
        SyncMessage::Content(NewContent::new(CoId::new_unchecked(id), priority))
    }

    fn egress(open: bool, config: OutgoingConfig) -> (BatchedOutgoingMessages, Arc<MemoryChannel>, MemoryReceiver) {
        let (channel, receiver) = memory_channel(open);
        let out = BatchedOutgoingMessages::new(Arc::clone(&channel) as Arc<dyn OutgoingChannel>, config);
        (out, channel, receiver)
    }

    #[tokio::test]
    async fn test_fast_path_sends_immediately() {
        let (out, _channel, mut receiver) = egress(true, OutgoingConfig::default());
        out.push(known("co_za"));
        out.push(known("co_zb"));

        assert_eq!(out.queued(), 0);
        let frames: Vec<String> = std::iter::from_fn(|| receiver.try_recv()).collect();
        assert_eq!(frames.len(), 2);
        assert!(!frames[0].contains('\n'));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_messages_batch_once_open() {
        let (out, channel, mut receiver) = egress(false, OutgoingConfig::default());
        for id in ["co_za", "co_zb", "co_zc"] {
            out.push(known(id));
        }
        assert_eq!(out.queued(), 3);

        channel.set_open(true);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let frame = receiver.try_recv().unwrap();
        assert_eq!(frame.lines().count(), 3);
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_priority_drains_first() {
        let (out, channel, mut receiver) = egress(
            false,
            OutgoingConfig {
                batching: false,
                ..OutgoingConfig::default()
            },
        );
        out.push(content("co_zlow", CoValuePriority::Low));
        out.push(content("co_zmid", CoValuePriority::Medium));
        out.push(known("co_zhigh"));

        channel.set_open(true);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let ids: Vec<String> = receiver
            .drain_messages()
            .iter()
            .map(|m| m.id().to_string())
            .collect();
        assert_eq!(ids, vec!["co_zhigh", "co_zmid", "co_zlow"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_message_flushes_alone() {
        let small = known("co_za").to_frame().unwrap().len();
        let (out, channel, mut receiver) = egress(
            false,
            OutgoingConfig {
                max_chunk_bytes: small * 2 + 1,
                ..OutgoingConfig::default()
            },
        );
        out.push(known("co_za"));
        out.push(known("co_zb"));
        out.push(known("co_zc"));

        channel.set_open(true);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let frames: Vec<String> = std::iter::from_fn(|| receiver.try_recv()).collect();
        let lines: Vec<usize> = frames.iter().map(|f| f.lines().count()).collect();
        assert_eq!(lines, vec![2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_congestion_defers_until_buffer_drains() {
        let (out, channel, mut receiver) = egress(true, OutgoingConfig::default());
        channel.set_buffered_amount(200_000);
        out.push(known("co_za"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(receiver.try_recv().is_none());

        channel.set_buffered_amount(0);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(receiver.drain_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_close_flushes_and_discards_later_pushes() {
        let (out, channel, mut receiver) = egress(false, OutgoingConfig::default());
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        out.on_close(move || flag.store(true, Ordering::SeqCst));

        out.push(known("co_za"));
        out.push(known("co_zb"));
        channel.set_open(true);
        out.push(PeerMessage::Disconnected);

        assert!(out.is_closed());
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(receiver.drain_messages().len(), 2);

        out.push(known("co_zc"));
        assert!(receiver.try_recv().is_none());
        assert_eq!(out.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_drain_waits_sends_everything_in_order() {
        let (out, channel, mut receiver) = egress(false, OutgoingConfig::default());
        out.push(known("co_za"));
        out.push(known("co_zb"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        channel.set_open(true);
        out.close();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let ids: Vec<String> = receiver
            .drain_messages()
            .iter()
            .map(|m| m.id().to_string())
            .collect();
        assert_eq!(ids, vec!["co_za", "co_zb"]);
    }
}
