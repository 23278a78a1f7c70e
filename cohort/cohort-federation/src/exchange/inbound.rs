//! Inbound routing.
//!
//! A router task reads the topic subscription and hashes each event's
//! partition key onto one of a fixed number of worker queues. Each worker
//! processes its queue strictly in order, so all events for one
//! (origin, instance) pair are applied one at a time.
//!
//! Registration events change membership for every partition. The router
//! waits for the workers to drain before handling one inline, so instance
//! events already received from a departing member land before its copies
//! are purged.

use super::InFlight;
use super::dispatch::EventDispatcher;
use crate::stats::ExchangeStats;
use cohort_core::event::ReplicationEvent;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handle to the running inbound pipeline
pub struct InboundRouter {
    pending: InFlight,
    tasks: Vec<JoinHandle<()>>,
}

impl InboundRouter {
    /// Start the router and `workers` partition workers
    pub fn spawn(
        subscription: mpsc::UnboundedReceiver<ReplicationEvent>,
        dispatcher: Arc<EventDispatcher>,
        workers: usize,
        stats: Arc<ExchangeStats>,
        cancel: CancellationToken,
    ) -> Self {
        let workers = workers.max(1);
        let pending = InFlight::new();
        let queued = InFlight::new();
        let mut tasks = Vec::with_capacity(workers + 1);
        let mut queues = Vec::with_capacity(workers);

        for worker in 0..workers {
            let (tx, mut rx) = mpsc::unbounded_channel::<ReplicationEvent>();
            queues.push(tx);

            let dispatcher = dispatcher.clone();
            let pending = pending.clone();
            let queued = queued.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = rx.recv() => next,
                    };
                    let Some(event) = next else { break };
                    dispatcher.dispatch(event).await;
                    queued.end();
                    pending.end();
                }
                debug!(worker, "Inbound worker stopped");
            }));
        }

        let router_pending = pending.clone();
        tasks.push(tokio::spawn(route(
            subscription,
            queues,
            dispatcher,
            router_pending,
            queued,
            stats,
            cancel,
        )));

        Self { pending, tasks }
    }

    /// Events received but not yet processed
    pub fn pending(&self) -> usize {
        self.pending.count()
    }

    pub async fn wait_idle(&self) {
        self.pending.wait_idle().await;
    }

    /// Shared handle on the pending count
    pub fn tracker(&self) -> InFlight {
        self.pending.clone()
    }

    /// Wait for the router and workers to exit after cancellation
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn route(
    mut subscription: mpsc::UnboundedReceiver<ReplicationEvent>,
    queues: Vec<mpsc::UnboundedSender<ReplicationEvent>>,
    dispatcher: Arc<EventDispatcher>,
    pending: InFlight,
    queued: InFlight,
    stats: Arc<ExchangeStats>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = subscription.recv() => next,
        };
        let Some(event) = next else { break };

        stats.record_received();
        pending.begin();

        if matches!(event, ReplicationEvent::Registration(_)) {
            queued.wait_idle().await;
            dispatcher.dispatch(event).await;
            pending.end();
            continue;
        }

        let slot = partition(&event, queues.len());
        queued.begin();
        if queues[slot].send(event).is_err() {
            queued.end();
            pending.end();
        }
    }
    debug!("Inbound router stopped");
}

fn partition(event: &ReplicationEvent, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    event.partition_key().hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_core::event::InstanceAction;
    use cohort_core::id::Guid;
    use cohort_core::types::{EntityDetail, TypeDef, TypeDefCategory};

    #[test]
    fn test_same_instance_same_partition() {
        let def = TypeDef::new("Asset", TypeDefCategory::Entity);
        let entity = EntityDetail::new(&def, "repo-a".into()).with_guid(Guid::from_u128(42));
        let mut later = entity.clone();
        later.header.version = 9;

        let first = ReplicationEvent::entity("repo-a".into(), InstanceAction::Created, entity);
        let second = ReplicationEvent::entity("repo-a".into(), InstanceAction::Updated, later);
        for workers in 1..8 {
            assert_eq!(partition(&first, workers), partition(&second, workers));
            assert!(partition(&first, workers) < workers);
        }
    }
}
