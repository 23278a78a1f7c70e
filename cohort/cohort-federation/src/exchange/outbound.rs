//! Outbound publication.
//!
//! Local mutations hand their event to [`OutboundPublisher::publish`], which
//! only enqueues. A single publisher task takes events off the queue in order
//! and pushes them to the topic under the retry policy. An event that still
//! fails once the budget is spent is reported and dropped; the local commit
//! stands.

use super::InFlight;
use crate::retry::RetryPolicy;
use crate::stats::ExchangeStats;
use cohort_core::audit::AuditReport;
use cohort_core::event::ReplicationEvent;
use cohort_core::traits::{AuditSink, EventTopic};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Receiving end of the outbound queue, consumed by [`OutboundPublisher::spawn`]
pub struct OutboundQueue {
    rx: mpsc::UnboundedReceiver<ReplicationEvent>,
}

/// Non-blocking handle for queueing outbound events
#[derive(Clone)]
pub struct OutboundPublisher {
    tx: mpsc::UnboundedSender<ReplicationEvent>,
    pending: InFlight,
}

impl OutboundPublisher {
    /// Create the publisher handle and its queue.
    ///
    /// Events queued before the publisher task starts are sent once it does.
    pub fn channel() -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                pending: InFlight::new(),
            },
            OutboundQueue { rx },
        )
    }

    /// Queue an event for publication; never blocks
    pub fn publish(&self, event: ReplicationEvent) {
        self.pending.begin();
        if let Err(rejected) = self.tx.send(event) {
            self.pending.end();
            warn!(
                kind = rejected.0.kind(),
                "Outbound queue closed, event not published"
            );
        }
    }

    /// Events queued or being published
    pub fn pending(&self) -> usize {
        self.pending.count()
    }

    pub async fn wait_idle(&self) {
        self.pending.wait_idle().await;
    }

    /// Start the publisher task
    pub fn spawn(
        &self,
        queue: OutboundQueue,
        topic: Arc<dyn EventTopic>,
        policy: RetryPolicy,
        stats: Arc<ExchangeStats>,
        audit: Arc<dyn AuditSink>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pending = self.pending.clone();
        let mut rx = queue.rx;

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => next,
                };
                let Some(event) = next else { break };

                publish_one(topic.as_ref(), &policy, &stats, audit.as_ref(), event).await;
                pending.end();
            }

            let mut dropped = 0usize;
            while rx.try_recv().is_ok() {
                pending.end();
                dropped += 1;
            }
            if dropped > 0 {
                warn!(dropped, "Publisher stopped with events still queued");
            }
            debug!(topic = topic.name(), "Outbound publisher stopped");
        })
    }
}

async fn publish_one(
    topic: &dyn EventTopic,
    policy: &RetryPolicy,
    stats: &ExchangeStats,
    audit: &dyn AuditSink,
    event: ReplicationEvent,
) {
    let attempted = policy
        .execute_with_retry("event publication", || topic.publish(event.clone()))
        .await;

    stats.record_publish_retries(u64::from(attempted.attempts.saturating_sub(1)));

    match attempted.result {
        Ok(()) => {
            stats.record_published();
            debug!(
                kind = event.kind(),
                subject = %subject(&event),
                version = event.version(),
                attempts = attempted.attempts,
                "Published event"
            );
        }
        Err(e) => {
            stats.record_abandoned();
            error!(
                kind = event.kind(),
                subject = %subject(&event),
                attempts = attempted.attempts,
                "Abandoned event publication: {}", e
            );
            audit.report(AuditReport::PublicationAbandoned {
                event_kind: event.kind().to_string(),
                subject: subject(&event),
                attempts: attempted.attempts,
                reason: e.to_string(),
            });
        }
    }
}

/// What an event is about, for logs and reports
fn subject(event: &ReplicationEvent) -> String {
    match event {
        ReplicationEvent::Registration(e) => e.member.metadata_collection_id.to_string(),
        ReplicationEvent::TypeDef(e) => format!("{} ({})", e.type_def.name, e.type_def.guid),
        ReplicationEvent::InstanceEntity(e) => e.instance.header.guid.to_string(),
        ReplicationEvent::InstanceRelationship(e) => e.instance.header.guid.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::exchange::InMemoryTopic;
    use cohort_core::event::TypeDefAction;
    use cohort_core::types::{TypeDef, TypeDefCategory};

    fn event() -> ReplicationEvent {
        ReplicationEvent::type_def(
            "repo-a".into(),
            TypeDefAction::Added,
            TypeDef::new("Asset", TypeDefCategory::Entity),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_topic_abandons_after_budget() {
        let topic = Arc::new(InMemoryTopic::new("cohort"));
        topic.set_available(false);
        let stats = Arc::new(ExchangeStats::new());
        let audit = Arc::new(AuditLog::new("server-a", 16));
        let cancel = CancellationToken::new();

        let (publisher, queue) = OutboundPublisher::channel();
        let handle = publisher.spawn(
            queue,
            topic.clone(),
            RetryPolicy::default(),
            stats.clone(),
            audit.clone(),
            cancel.clone(),
        );

        publisher.publish(event());
        publisher.wait_idle().await;

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.abandoned, 1);
        assert_eq!(snapshot.publish_retries, 4);
        assert_eq!(snapshot.published, 0);
        assert_eq!(
            audit
                .reports_matching(|r| matches!(r, AuditReport::PublicationAbandoned { .. }))
                .len(),
            1
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_events_queued_before_start_are_sent() {
        let topic = Arc::new(InMemoryTopic::new("cohort"));
        let mut subscription = topic.subscribe().unwrap();
        let stats = Arc::new(ExchangeStats::new());
        let cancel = CancellationToken::new();

        let (publisher, queue) = OutboundPublisher::channel();
        publisher.publish(event());
        assert_eq!(publisher.pending(), 1);

        let handle = publisher.spawn(
            queue,
            topic.clone(),
            RetryPolicy::default(),
            stats.clone(),
            Arc::new(AuditLog::new("server-a", 16)),
            cancel.clone(),
        );
        publisher.wait_idle().await;

        assert_eq!(subscription.recv().await.unwrap().kind(), "type_def");
        assert_eq!(stats.snapshot().published, 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
