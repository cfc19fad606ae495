//! Outgoing channel abstraction.
//!
//! The channel carries serialized frames to one peer. Implementations may
//! use WebSockets or any other transport; [`memory`] provides an in-process
//! channel for tests.

use async_trait::async_trait;

use crate::error::Result;

/// Transport-side view of one outgoing link.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait OutgoingChannel: Send + Sync {
    /// Whether frames can be sent right now.
    fn is_open(&self) -> bool;

    /// Bytes accepted by the transport but not yet flushed.
    fn buffered_amount(&self) -> usize;

    /// Hand one frame to the transport.
    fn send(&self, frame: String) -> Result<()>;

    /// Wait until the channel is open.
    ///
    /// Fails with [`SyncError::Closed`](crate::SyncError::Closed) if it was
    /// closed for good instead.
    async fn wait_open(&self) -> Result<()>;

    /// Wait until fewer than `limit` bytes are buffered.
    async fn wait_buffer_below(&self, limit: usize);

    /// Close the channel. Idempotent.
    fn close(&self);
}

/// A simple in-memory channel for testing.
///
/// Frames land in an unbounded queue read by [`MemoryReceiver`]. Tests
/// drive the open and congestion state by hand.
pub mod memory {
    use super::*;
    use crate::error::SyncError;
    use crate::messages::SyncMessage;
    use std::sync::Arc;
    use tokio::sync::{mpsc, watch};

    #[derive(Debug, Clone, Copy, Default)]
    struct LinkState {
        open: bool,
        closed: bool,
        buffered: usize,
    }

    /// Sending half.
    pub struct MemoryChannel {
        state: watch::Sender<LinkState>,
        frames: mpsc::UnboundedSender<String>,
    }

    /// Receiving half.
    pub struct MemoryReceiver {
        frames: mpsc::UnboundedReceiver<String>,
    }

    /// Create a linked channel/receiver pair.
    pub fn memory_channel(open: bool) -> (Arc<MemoryChannel>, MemoryReceiver) {
        let (frames, receiver) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(LinkState {
            open,
            ..LinkState::default()
        });
        (
            Arc::new(MemoryChannel { state, frames }),
            MemoryReceiver { frames: receiver },
        )
    }

    impl MemoryChannel {
        pub fn set_open(&self, open: bool) {
            self.state.send_modify(|s| s.open = open && !s.closed);
        }

        /// Pretend the transport holds `bytes` unflushed bytes.
        pub fn set_buffered_amount(&self, bytes: usize) {
            self.state.send_modify(|s| s.buffered = bytes);
        }

        pub fn is_closed(&self) -> bool {
            self.state.borrow().closed
        }
    }

    #[async_trait]
    impl OutgoingChannel for MemoryChannel {
        fn is_open(&self) -> bool {
            let state = self.state.borrow();
            state.open && !state.closed
        }

        fn buffered_amount(&self) -> usize {
            self.state.borrow().buffered
        }

        fn send(&self, frame: String) -> Result<()> {
            if !self.is_open() {
                return Err(SyncError::Channel("channel not open".into()));
            }
            self.frames.send(frame).map_err(|_| SyncError::Closed)
        }

        async fn wait_open(&self) -> Result<()> {
            let mut rx = self.state.subscribe();
            let state = *rx
                .wait_for(|s| s.open || s.closed)
                .await
                .map_err(|_| SyncError::Closed)?;
            if state.closed {
                Err(SyncError::Closed)
            } else {
                Ok(())
            }
        }

        async fn wait_buffer_below(&self, limit: usize) {
            let mut rx = self.state.subscribe();
            // The sender lives in `self`, so this only ends when the condition holds.
            let _ = rx.wait_for(|s| s.buffered < limit || s.closed).await;
        }

        fn close(&self) {
            self.state.send_modify(|s| {
                s.open = false;
                s.closed = true;
            });
        }
    }

    impl MemoryReceiver {
        /// Next frame, or `None` once the sending half is gone.
        pub async fn recv(&mut self) -> Option<String> {
            self.frames.recv().await
        }

        /// Next frame if one is already queued.
        pub fn try_recv(&mut self) -> Option<String> {
            self.frames.try_recv().ok()
        }

        /// Every queued frame, parsed. Unparseable frames are skipped.
        pub fn drain_messages(&mut self) -> Vec<SyncMessage> {
            let mut out = Vec::new();
            while let Some(frame) = self.try_recv() {
                match SyncMessage::parse_frame(&frame) {
                    Ok(messages) => out.extend(messages),
                    Err(e) => tracing::warn!(error = %e, "Dropping unparseable frame"),
                }
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::memory_channel;
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_memory_channel_send_recv() {
        let (channel, mut receiver) = memory_channel(true);
        channel.send("hello".into()).unwrap();
        assert_eq!(receiver.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_send_requires_open() {
        let (channel, mut receiver) = memory_channel(false);
        assert!(channel.send("early".into()).is_err());
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_open_resumes_when_opened() {
        let (channel, _receiver) = memory_channel(false);
        let opener = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                channel.set_open(true);
            })
        };
        channel.wait_open().await.unwrap();
        assert!(channel.is_open());
        opener.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_open_fails_once_closed() {
        let (channel, _receiver) = memory_channel(false);
        channel.close();
        assert!(channel.wait_open().await.is_err());
        channel.set_open(true);
        assert!(!channel.is_open());
    }
}
