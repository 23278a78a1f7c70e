//! Per-instance sequencing of inbound instance events.
//!
//! Events that skip ahead of the held reference copy are parked in a gap
//! buffer keyed by (origin, guid) and the instance is re-fetched from its
//! home. Once the copy catches up, contiguous buffered events are drained in
//! version order.
//!
//! Callers must not run two `handle` calls for the same (origin, guid) at the
//! same time; the inbound router guarantees this by partitioning.

use crate::refcopy::{ApplyOutcome, ReferenceCopyManager, ReplicatedInstance};
use crate::registry::{CohortRegistry, MembershipListener};
use crate::stats::ExchangeStats;
use cohort_core::event::{InstanceEvent, ReplicationEvent};
use cohort_core::id::{Guid, MetadataCollectionId};
use cohort_core::traits::{ConnectorResolver, MetadataCollection};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

type GapKey = (MetadataCollectionId, Guid);

pub struct InstanceSequencer {
    local: Arc<dyn MetadataCollection>,
    copies: Arc<ReferenceCopyManager>,
    registry: Arc<CohortRegistry>,
    resolver: Arc<dyn ConnectorResolver>,
    stats: Arc<ExchangeStats>,
    reconciliation_timeout: Duration,

    /// Events parked behind a gap, by version
    gaps: DashMap<GapKey, BTreeMap<u64, ReplicationEvent>>,
}

impl InstanceSequencer {
    pub fn new(
        local: Arc<dyn MetadataCollection>,
        copies: Arc<ReferenceCopyManager>,
        registry: Arc<CohortRegistry>,
        resolver: Arc<dyn ConnectorResolver>,
        stats: Arc<ExchangeStats>,
        reconciliation_timeout: Duration,
    ) -> Self {
        Self {
            local,
            copies,
            registry,
            resolver,
            stats,
            reconciliation_timeout,
            gaps: DashMap::new(),
        }
    }

    /// Apply one inbound instance event
    pub async fn handle<T: ReplicatedInstance>(&self, event: InstanceEvent<T>) {
        let guid = event.instance.guid();

        if T::fetch(self.local.as_ref(), guid).await.is_ok() {
            let outcome = self.copies.reject_locally_owned(&event.origin, event.instance);
            self.record(outcome);
            return;
        }

        let key = (event.origin.clone(), guid);
        match self.copies.apply(&event) {
            ApplyOutcome::Gap { stored, incoming } => {
                debug!(%guid, origin = %event.origin, stored, incoming, "Version gap, buffering event");
                self.stats.record_gap_buffered();
                self.gaps
                    .entry(key.clone())
                    .or_default()
                    .insert(incoming, T::wrap_event(event));
                self.reconcile::<T>(&key).await;
            }
            outcome => {
                self.record(outcome);
                if outcome.is_applied() {
                    self.drain::<T>(&key);
                }
            }
        }
    }

    /// Events currently parked behind gaps
    pub fn buffered(&self) -> usize {
        self.gaps.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn clear(&self) {
        self.gaps.clear();
    }

    /// Drop every gap buffer for events from `origin`
    pub fn forget_origin(&self, origin: &MetadataCollectionId) -> usize {
        let before = self.buffered();
        self.gaps.retain(|(from, _), _| from != origin);
        before - self.buffered()
    }

    /// Fetch the instance from its home and catch the copy up
    async fn reconcile<T: ReplicatedInstance>(&self, key: &GapKey) {
        let (origin, guid) = key;

        let Some(status) = self.registry.get(origin) else {
            debug!(%guid, origin = %origin, "Origin not registered, gap stays buffered");
            return;
        };

        let connector = match self.resolver.resolve(&status.member) {
            Ok(connector) => connector,
            Err(e) => {
                self.registry.record_failure(origin, &e.to_string());
                return;
            }
        };

        let fetched =
            tokio::time::timeout(self.reconciliation_timeout, T::fetch(connector.as_ref(), *guid)).await;

        match fetched {
            Ok(Ok(snapshot)) => {
                self.registry.record_success(origin);
                let outcome = self.copies.apply_reconciled(snapshot);
                if outcome.is_applied() {
                    self.stats.record_reconciled();
                    debug!(%guid, origin = %origin, "Reconciled reference copy from home");
                } else {
                    self.record(outcome);
                }
                self.drain::<T>(key);
            }
            Ok(Err(e)) if e.is_not_found() => {
                self.registry.record_success(origin);
                self.copies.purge_copy::<T>(*guid, origin);
                self.gaps.remove(key);
                self.stats.record_reconciled();
                debug!(%guid, origin = %origin, "Instance gone at home, dropped reference copy");
            }
            Ok(Err(e)) => {
                warn!(%guid, origin = %origin, "Reconciliation fetch failed: {}", e);
                self.registry.record_failure(origin, &e.to_string());
            }
            Err(_) => {
                warn!(%guid, origin = %origin, "Reconciliation fetch timed out");
                self.registry.record_failure(origin, "reconciliation fetch timed out");
            }
        }
    }

    /// Apply buffered events that no longer leave a gap
    fn drain<T: ReplicatedInstance>(&self, key: &GapKey) {
        loop {
            let next = match self.gaps.get_mut(key) {
                Some(mut buffer) => buffer.pop_first(),
                None => return,
            };
            let Some((version, buffered)) = next else {
                self.gaps.remove_if(key, |_, buffer| buffer.is_empty());
                return;
            };
            let Some(event) = T::unwrap_event(buffered) else {
                continue;
            };

            match self.copies.apply(&event) {
                ApplyOutcome::Gap { .. } => {
                    self.gaps
                        .entry(key.clone())
                        .or_default()
                        .insert(version, T::wrap_event(event));
                    return;
                }
                outcome => self.record(outcome),
            }
        }
    }

    fn record(&self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Duplicate => self.stats.record_duplicate(),
            ApplyOutcome::Conflict => self.stats.record_conflict(),
            ApplyOutcome::Gap { .. } => self.stats.record_gap_buffered(),
            _ => self.stats.record_applied(),
        }
    }
}

impl MembershipListener for InstanceSequencer {
    fn on_member_removed(&self, member: &MetadataCollectionId) {
        let dropped = self.forget_origin(member);
        if dropped > 0 {
            debug!(origin = %member, dropped, "Dropped buffered events of departed member");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::connector::InProcessDirectory;
    use chrono::Utc;
    use cohort_core::event::InstanceAction;
    use cohort_core::types::{
        CohortMember, ConnectionDescriptor, EntityDetail, InstanceProperties, TypeDef, TypeDefCategory,
    };
    use cohort_repository::InMemoryRepository;

    struct Fixture {
        sequencer: Arc<InstanceSequencer>,
        registry: Arc<CohortRegistry>,
        copies: Arc<ReferenceCopyManager>,
        remote: Arc<InMemoryRepository>,
        directory: Arc<InProcessDirectory>,
        stats: Arc<ExchangeStats>,
        def: TypeDef,
    }

    async fn fixture() -> Fixture {
        let audit = Arc::new(AuditLog::new("server-b", 64));
        let def = TypeDef::new("Asset", TypeDefCategory::Entity);

        let remote = Arc::new(InMemoryRepository::new("repo-a".into()));
        remote.add_type_def(def.clone()).await.unwrap();
        let directory = Arc::new(InProcessDirectory::new());
        directory.register("repo-a", remote.clone());

        let registry = Arc::new(CohortRegistry::new("repo-b".into(), audit.clone(), 3));
        registry.register(CohortMember::new(
            "repo-a".into(),
            "server-a",
            ConnectionDescriptor::in_process("repo-a"),
        ));

        let copies = Arc::new(ReferenceCopyManager::new("repo-b".into(), audit.clone()));
        let stats = Arc::new(ExchangeStats::new());
        let sequencer = Arc::new(InstanceSequencer::new(
            Arc::new(InMemoryRepository::new("repo-b".into())),
            copies.clone(),
            registry.clone(),
            directory.clone(),
            stats.clone(),
            Duration::from_millis(200),
        ));
        registry.add_listener(sequencer.clone());

        Fixture {
            sequencer,
            registry,
            copies,
            remote,
            directory,
            stats,
            def,
        }
    }

    fn event(action: InstanceAction, entity: &EntityDetail) -> InstanceEvent<EntityDetail> {
        InstanceEvent {
            origin: "repo-a".into(),
            action,
            instance: entity.clone(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_gap_is_reconciled_from_home() {
        let f = fixture().await;
        let guid = Guid::from_u128(42);
        let v1 = f
            .remote
            .create_entity(EntityDetail::new(&f.def, "repo-a".into()).with_guid(guid))
            .await
            .unwrap();
        let v2 = f
            .remote
            .update_entity(guid, 1, InstanceProperties::new().with_string("name", "two"))
            .await
            .unwrap();
        let v3 = f
            .remote
            .update_entity(guid, 2, InstanceProperties::new().with_string("name", "three"))
            .await
            .unwrap();

        f.sequencer.handle(event(InstanceAction::Created, &v1)).await;
        f.sequencer.handle(event(InstanceAction::Updated, &v3)).await;

        let copy = f.copies.get_entity(&guid).unwrap();
        assert_eq!(copy.header.version, 3);
        assert_eq!(f.sequencer.buffered(), 0);

        f.sequencer.handle(event(InstanceAction::Updated, &v2)).await;
        let snapshot = f.stats.snapshot();
        assert_eq!(snapshot.reconciled, 1);
        assert_eq!(snapshot.duplicates, 2);
    }

    #[tokio::test]
    async fn test_unreachable_home_keeps_events_buffered() {
        let f = fixture().await;
        let guid = Guid::from_u128(7);
        let mut entity = EntityDetail::new(&f.def, "repo-a".into()).with_guid(guid);

        f.sequencer.handle(event(InstanceAction::Created, &entity)).await;
        f.directory.set_reachable("repo-a", false);

        entity.header.version = 3;
        f.sequencer.handle(event(InstanceAction::Updated, &entity)).await;
        assert_eq!(f.sequencer.buffered(), 1);
        assert_eq!(f.copies.get_entity(&guid).unwrap().header.version, 1);

        entity.header.version = 2;
        f.sequencer.handle(event(InstanceAction::Updated, &entity)).await;
        assert_eq!(f.sequencer.buffered(), 0);
        assert_eq!(f.copies.get_entity(&guid).unwrap().header.version, 3);
    }

    #[tokio::test]
    async fn test_departed_origin_drops_buffered_events() {
        let f = fixture().await;
        let guid = Guid::from_u128(9);
        let mut entity = EntityDetail::new(&f.def, "repo-a".into()).with_guid(guid);

        f.sequencer.handle(event(InstanceAction::Created, &entity)).await;
        f.directory.set_reachable("repo-a", false);
        entity.header.version = 4;
        f.sequencer.handle(event(InstanceAction::Updated, &entity)).await;
        assert_eq!(f.sequencer.buffered(), 1);

        f.registry.deregister(&"repo-a".into());
        assert_eq!(f.sequencer.buffered(), 0);
    }
}
