//! Event Exchange
//!
//! At-least-once replication between cohort members over a shared topic.
//!
//! # Features
//!
//! - **Outbound**: one publisher task per server drains a queue in commit
//!   order, retrying transient topic failures with backoff
//! - **Inbound**: a router hashes every event onto a fixed pool of workers by
//!   (origin, subject), so one instance's history is applied in order while
//!   different instances proceed concurrently
//! - **Sequencing**: version gaps are buffered and closed by re-fetching the
//!   instance from its home
//! - **Dispatch**: one exhaustive match over the event variants

pub mod dispatch;
pub mod inbound;
pub mod outbound;
pub mod sequencer;
pub mod topic;

pub use dispatch::EventDispatcher;
pub use inbound::InboundRouter;
pub use outbound::{OutboundPublisher, OutboundQueue};
pub use sequencer::InstanceSequencer;
pub use topic::InMemoryTopic;

use std::sync::Arc;
use tokio::sync::watch;

/// Counts work in flight and lets callers wait until it drains
#[derive(Clone)]
pub struct InFlight {
    count: Arc<watch::Sender<usize>>,
}

impl InFlight {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }

    pub fn begin(&self) {
        self.count.send_modify(|n| *n += 1);
    }

    pub fn end(&self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Resolve once nothing is in flight
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for InFlight {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_idle_resolves_after_end() {
        let in_flight = InFlight::new();
        in_flight.begin();
        in_flight.begin();
        assert_eq!(in_flight.count(), 2);

        let waiter = {
            let in_flight = in_flight.clone();
            tokio::spawn(async move { in_flight.wait_idle().await })
        };

        in_flight.end();
        in_flight.end();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(in_flight.count(), 0);
    }
}
