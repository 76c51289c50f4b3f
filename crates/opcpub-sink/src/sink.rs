//! Message sink seam and an in-memory implementation.

use crate::error::SinkError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;

/// An encoded network message ready for transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Writer group id
    pub group_id: String,
    /// Message id written into the payload
    pub message_id: String,
    /// MIME content type of `payload`
    pub content_type: &'static str,
    /// Encoded bytes
    pub payload: Vec<u8>,
    /// `(writer_id, sequence_number)` of the carried datasets, in order
    pub datasets: Vec<(u16, u64)>,
}

/// Receives encoded network messages from writer groups.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Deliver one message.
    async fn publish(&self, message: OutboundMessage) -> Result<(), SinkError>;
}

/// Sink that keeps messages in memory.
#[derive(Default)]
pub struct MemorySink {
    messages: Mutex<Vec<OutboundMessage>>,
    failures: Mutex<VecDeque<SinkError>>,
    published: Notify,
}

impl MemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages received so far.
    #[must_use]
    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.messages.lock().clone()
    }

    /// Number of messages received so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// Returns `true` if nothing was received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail the next publish with `err`.
    pub fn fail_next(&self, err: SinkError) {
        self.failures.lock().push_back(err);
    }

    /// Wait until at least `count` messages arrived or `timeout` passes.
    ///
    /// Returns `true` if the count was reached.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let published = self.published.notified();
                if self.len() >= count {
                    return;
                }
                published.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn publish(&self, message: OutboundMessage) -> Result<(), SinkError> {
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        self.messages.lock().push(message);
        self.published.notify_waiters();
        Ok(())
    }
}
