use std::collections::VecDeque;

use tokio::sync::Mutex;

use super::peer::InboundMessage;

/// How many received messages are kept by default.
pub const DEFAULT_RECENT_MESSAGE_CAPACITY: usize = 50;

/// Bounded, append-only log of received messages. Once full, the oldest
/// entry is evicted for every new one.
#[derive(Debug)]
pub struct MessageLog {
    capacity: usize,
    entries: Mutex<VecDeque<InboundMessage>>,
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RECENT_MESSAGE_CAPACITY)
    }
}

impl MessageLog {
    /// A capacity of zero is treated as one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn push(&self, message: InboundMessage) {
        let mut entries = self.entries.lock().await;
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(message);
    }

    /// The newest `limit` messages, oldest first.
    pub async fn recent(&self, limit: usize) -> Vec<InboundMessage> {
        let entries = self.entries.lock().await;
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
