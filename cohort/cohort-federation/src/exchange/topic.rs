//! In-process event topic shared by the members of one cohort.

use async_trait::async_trait;
use cohort_core::error::{CohortError, Result};
use cohort_core::event::ReplicationEvent;
use cohort_core::traits::EventTopic;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Fan-out topic over unbounded channels.
///
/// Each subscriber gets its own queue, so a slow reader never holds up a
/// publisher. Availability can be toggled to simulate an outage.
pub struct InMemoryTopic {
    name: String,
    subscribers: RwLock<Vec<mpsc::UnboundedSender<ReplicationEvent>>>,
    available: AtomicBool,
    published: AtomicU64,
}

impl InMemoryTopic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: RwLock::new(Vec::new()),
            available: AtomicBool::new(true),
            published: AtomicU64::new(0),
        }
    }

    /// Accept or refuse publications
    pub fn set_available(&self, available: bool) {
        debug!(topic = %self.name, available, "Topic availability changed");
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of events accepted so far
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

#[async_trait]
impl EventTopic for InMemoryTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, event: ReplicationEvent) -> Result<()> {
        if !self.is_available() {
            return Err(CohortError::topic_unavailable(&self.name));
        }

        trace!(topic = %self.name, kind = event.kind(), origin = %event.origin(), "Publishing event");
        // Closed subscriptions are dropped on the way
        self.subscribers
            .write()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<ReplicationEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(tx);
        Ok(rx)
    }
}
