// =============================================================================
// Tick Bus — bounded broadcast fan-out from the ingestor to consumers
// =============================================================================
//
// Publishing never blocks the WebSocket read loop. When a consumer falls
// behind the bounded buffer, the oldest ticks are skipped for that consumer
// and the shared drop counter records how many were lost.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::types::Tick;

/// Default bus capacity; at QUOTE-mode rates this is a few seconds of
/// headroom per consumer.
const DEFAULT_CAPACITY: usize = 8192;

pub struct TickBus {
    sender: broadcast::Sender<Tick>,
    published: AtomicU64,
    dropped: Arc<AtomicU64>,
}

impl TickBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self {
            sender,
            published: AtomicU64::new(0),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish a tick. Returns the number of consumers that will see it.
    pub fn publish(&self, tick: Tick) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        // An Err simply means no consumer is subscribed right now.
        self.sender.send(tick).unwrap_or(0)
    }

    pub fn subscribe(&self) -> TickReceiver {
        TickReceiver {
            receiver: self.sender.subscribe(),
            dropped: self.dropped.clone(),
        }
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for TickBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TickBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickBus")
            .field("published", &self.published_count())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

/// Consumer handle. `recv` transparently skips over lagged ticks while
/// accounting for them in the shared drop counter.
pub struct TickReceiver {
    receiver: broadcast::Receiver<Tick>,
    dropped: Arc<AtomicU64>,
}

impl TickReceiver {
    /// Receive the next tick, or `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<Tick> {
        loop {
            match self.receiver.recv().await {
                Ok(tick) => return Some(tick),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.dropped.fetch_add(skipped, Ordering::Relaxed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
