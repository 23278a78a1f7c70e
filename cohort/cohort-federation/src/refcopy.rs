//! Reference Copy Manager
//!
//! Keeps read-only shadow copies of instances homed in other members of the
//! cohort, fed by inbound instance events.
//!
//! # Apply rules
//!
//! - An absent copy is created at whatever version the event carries
//! - A newer version replaces the copy when it is exactly one step ahead
//! - A version not newer than the copy is discarded as already applied
//! - A version more than one step ahead is reported as a gap for the caller
//!   to reconcile
//! - A purge removes the copy regardless of gaps and leaves a tombstone that
//!   discards late events for the same guid
//! - A copy whose home differs from the incoming one is a home collection
//!   conflict: the held copy stays, the incoming state is quarantined. The
//!   quarantine keeps the newest state per home and a redelivered state is
//!   neither quarantined nor reported twice

use crate::registry::MembershipListener;
use async_trait::async_trait;
use chrono::Utc;
use cohort_core::audit::AuditReport;
use cohort_core::error::{CohortError, Result};
use cohort_core::event::{InstanceAction, InstanceEvent, ReplicationEvent};
use cohort_core::id::{Guid, MetadataCollectionId};
use cohort_core::traits::{AuditSink, MetadataCollection};
use cohort_core::types::{EntityDetail, Instance, Relationship, SearchCriteria};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ============================================================================
// Outcomes
// ============================================================================

/// What applying one inbound state did to the copy store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Deleted,
    Restored,
    Purged,
    /// Not newer than the held copy, or the guid was purged
    Duplicate,
    /// The incoming version skips past `stored + 1`
    Gap { stored: u64, incoming: u64 },
    /// Home collection conflict; nothing applied
    Conflict,
}

impl ApplyOutcome {
    /// True when the copy store changed
    pub fn is_applied(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Updated | Self::Deleted | Self::Restored | Self::Purged
        )
    }

    fn from_action(action: InstanceAction) -> Self {
        match action {
            InstanceAction::Created => Self::Created,
            InstanceAction::Updated => Self::Updated,
            InstanceAction::Deleted => Self::Deleted,
            InstanceAction::Restored => Self::Restored,
            InstanceAction::Purged => Self::Purged,
        }
    }
}

/// Marker left behind by a purge
#[derive(Debug, Clone, PartialEq, Eq)]
struct Tombstone {
    home: MetadataCollectionId,
    version: u64,
}

// ============================================================================
// Per-kind copy store
// ============================================================================

/// Copies of one instance kind, keyed by guid
pub struct CopyStore<T> {
    copies: DashMap<Guid, T>,
    tombstones: DashMap<Guid, Tombstone>,
    /// States held back by a home collection conflict, one per home
    quarantine: DashMap<Guid, Vec<T>>,
}

impl<T: Instance> CopyStore<T> {
    fn new() -> Self {
        Self {
            copies: DashMap::new(),
            tombstones: DashMap::new(),
            quarantine: DashMap::new(),
        }
    }

    pub fn get(&self, guid: &Guid) -> Option<T> {
        self.copies.get(guid).map(|copy| copy.value().clone())
    }

    pub fn len(&self) -> usize {
        self.copies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }

    pub fn is_purged(&self, guid: &Guid) -> bool {
        self.tombstones.contains_key(guid)
    }

    /// Quarantined states for `guid`, in the order their homes first appeared
    pub fn quarantined(&self, guid: &Guid) -> Vec<T> {
        self.quarantine
            .get(guid)
            .map(|held| held.value().clone())
            .unwrap_or_default()
    }

    /// Hold back `instance`; false when the quarantine already has this or a
    /// newer state from the same home
    fn quarantine(&self, instance: T) -> bool {
        let mut held = self.quarantine.entry(instance.guid()).or_default();
        match held.iter().position(|copy| copy.home() == instance.home()) {
            Some(index) if held[index].version() >= instance.version() => false,
            Some(index) => {
                held[index] = instance;
                true
            }
            None => {
                held.push(instance);
                true
            }
        }
    }

    fn values(&self) -> Vec<T> {
        self.copies.iter().map(|copy| copy.value().clone()).collect()
    }

    fn remove_home(&self, home: &MetadataCollectionId) -> usize {
        let before = self.copies.len();
        self.copies.retain(|_, copy| copy.home() != home);
        self.tombstones.retain(|_, tombstone| &tombstone.home != home);
        self.quarantine.retain(|_, held| {
            held.retain(|copy| copy.home() != home);
            !held.is_empty()
        });
        before - self.copies.len()
    }

    fn clear(&self) {
        self.copies.clear();
        self.tombstones.clear();
        self.quarantine.clear();
    }
}

// ============================================================================
// Instance kinds
// ============================================================================

/// Glue between an instance kind and its copy store, event variant and
/// connector calls.
#[async_trait]
pub trait ReplicatedInstance: Instance {
    fn copy_store(manager: &ReferenceCopyManager) -> &CopyStore<Self>;

    fn not_known(guid: Guid) -> CohortError;

    fn wrap_event(event: InstanceEvent<Self>) -> ReplicationEvent;

    fn unwrap_event(event: ReplicationEvent) -> Option<InstanceEvent<Self>>;

    /// Read the current state from a connector
    async fn fetch(collection: &dyn MetadataCollection, guid: Guid) -> Result<Self>;
}

#[async_trait]
impl ReplicatedInstance for EntityDetail {
    fn copy_store(manager: &ReferenceCopyManager) -> &CopyStore<Self> {
        &manager.entities
    }

    fn not_known(guid: Guid) -> CohortError {
        CohortError::entity_not_known(guid)
    }

    fn wrap_event(event: InstanceEvent<Self>) -> ReplicationEvent {
        ReplicationEvent::InstanceEntity(event)
    }

    fn unwrap_event(event: ReplicationEvent) -> Option<InstanceEvent<Self>> {
        match event {
            ReplicationEvent::InstanceEntity(event) => Some(event),
            _ => None,
        }
    }

    async fn fetch(collection: &dyn MetadataCollection, guid: Guid) -> Result<Self> {
        collection.get_entity(guid).await
    }
}

#[async_trait]
impl ReplicatedInstance for Relationship {
    fn copy_store(manager: &ReferenceCopyManager) -> &CopyStore<Self> {
        &manager.relationships
    }

    fn not_known(guid: Guid) -> CohortError {
        CohortError::relationship_not_known(guid)
    }

    fn wrap_event(event: InstanceEvent<Self>) -> ReplicationEvent {
        ReplicationEvent::InstanceRelationship(event)
    }

    fn unwrap_event(event: ReplicationEvent) -> Option<InstanceEvent<Self>> {
        match event {
            ReplicationEvent::InstanceRelationship(event) => Some(event),
            _ => None,
        }
    }

    async fn fetch(collection: &dyn MetadataCollection, guid: Guid) -> Result<Self> {
        collection.get_relationship(guid).await
    }
}

// ============================================================================
// Manager
// ============================================================================

pub struct ReferenceCopyManager {
    local_id: MetadataCollectionId,
    entities: CopyStore<EntityDetail>,
    relationships: CopyStore<Relationship>,
    audit: Arc<dyn AuditSink>,
}

impl ReferenceCopyManager {
    pub fn new(local_id: MetadataCollectionId, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            local_id,
            entities: CopyStore::new(),
            relationships: CopyStore::new(),
            audit,
        }
    }

    pub fn entities(&self) -> &CopyStore<EntityDetail> {
        &self.entities
    }

    pub fn relationships(&self) -> &CopyStore<Relationship> {
        &self.relationships
    }

    /// Apply an inbound instance event
    pub fn apply<T: ReplicatedInstance>(&self, event: &InstanceEvent<T>) -> ApplyOutcome {
        self.apply_state(&event.origin, event.action, event.instance.clone(), true)
    }

    /// Apply a state fetched from the home collection to close a gap.
    ///
    /// The snapshot may be any number of versions ahead of the held copy.
    pub fn apply_reconciled<T: ReplicatedInstance>(&self, snapshot: T) -> ApplyOutcome {
        let origin = snapshot.home().clone();
        self.apply_state(&origin, InstanceAction::Updated, snapshot, false)
    }

    /// Drop the copy of an instance its home no longer knows
    pub fn purge_copy<T: ReplicatedInstance>(&self, guid: Guid, home: &MetadataCollectionId) -> bool {
        let store = T::copy_store(self);
        let removed = store
            .copies
            .remove_if(&guid, |_, copy| copy.home() == home)
            .map(|(_, copy)| copy.version());
        match removed {
            Some(version) => {
                store.tombstones.insert(
                    guid,
                    Tombstone {
                        home: home.clone(),
                        version,
                    },
                );
                debug!(%guid, home = %home, "Purged reference copy missing at home");
                true
            }
            None => false,
        }
    }

    /// Quarantine and report a state naming a guid this server owns.
    ///
    /// Returns `Duplicate` for a redelivered state, `Conflict` otherwise.
    pub fn reject_locally_owned<T: ReplicatedInstance>(
        &self,
        origin: &MetadataCollectionId,
        instance: T,
    ) -> ApplyOutcome {
        let guid = instance.guid();
        let incoming_home = instance.home().clone();
        if !T::copy_store(self).quarantine(instance) {
            return ApplyOutcome::Duplicate;
        }
        self.audit.report(AuditReport::HomeCollectionConflict {
            guid,
            existing_home: self.local_id.clone(),
            incoming_home,
            detail: format!("{} event from {} names a locally owned guid", T::CATEGORY, origin),
        });
        ApplyOutcome::Conflict
    }

    fn apply_state<T: ReplicatedInstance>(
        &self,
        origin: &MetadataCollectionId,
        action: InstanceAction,
        mut incoming: T,
        detect_gaps: bool,
    ) -> ApplyOutcome {
        let store = T::copy_store(self);
        let guid = incoming.guid();

        if incoming.home() != origin {
            let home = incoming.home().clone();
            if !store.quarantine(incoming) {
                return ApplyOutcome::Duplicate;
            }
            self.report_conflict(
                guid,
                home,
                origin.clone(),
                format!("{} event published by a collection other than its home", T::CATEGORY),
            );
            return ApplyOutcome::Conflict;
        }

        if let Some(tombstone) = store.tombstones.get(&guid) {
            if &tombstone.home == incoming.home() {
                debug!(
                    %guid,
                    version = incoming.version(),
                    purged_at = tombstone.version,
                    "Discarded event for purged instance"
                );
                return ApplyOutcome::Duplicate;
            }
        }

        incoming.header_mut().replicated_at = Some(Utc::now());

        match store.copies.entry(guid) {
            Entry::Occupied(mut held) => {
                if held.get().home() != incoming.home() {
                    let existing_home = held.get().home().clone();
                    drop(held);
                    let incoming_home = incoming.home().clone();
                    if !store.quarantine(incoming) {
                        return ApplyOutcome::Duplicate;
                    }
                    self.report_conflict(
                        guid,
                        existing_home,
                        incoming_home,
                        format!("{} copy already held for another home", T::CATEGORY),
                    );
                    return ApplyOutcome::Conflict;
                }

                let stored = held.get().version();
                if action == InstanceAction::Purged {
                    held.remove();
                    store.tombstones.insert(
                        guid,
                        Tombstone {
                            home: origin.clone(),
                            version: incoming.version().max(stored),
                        },
                    );
                    debug!(%guid, home = %origin, "Purged reference copy");
                    return ApplyOutcome::Purged;
                }

                let version = incoming.version();
                if version <= stored {
                    return ApplyOutcome::Duplicate;
                }
                if detect_gaps && version > stored + 1 {
                    return ApplyOutcome::Gap {
                        stored,
                        incoming: version,
                    };
                }

                held.insert(incoming);
                debug!(%guid, home = %origin, version, "Updated reference copy");
                if detect_gaps {
                    ApplyOutcome::from_action(action)
                } else {
                    ApplyOutcome::Updated
                }
            }
            Entry::Vacant(slot) => {
                if action == InstanceAction::Purged {
                    store.tombstones.insert(
                        guid,
                        Tombstone {
                            home: origin.clone(),
                            version: incoming.version(),
                        },
                    );
                    return ApplyOutcome::Purged;
                }

                debug!(%guid, home = %origin, version = incoming.version(), "Created reference copy");
                slot.insert(incoming);
                ApplyOutcome::Created
            }
        }
    }

    fn report_conflict(
        &self,
        guid: Guid,
        existing_home: MetadataCollectionId,
        incoming_home: MetadataCollectionId,
        detail: String,
    ) {
        warn!(%guid, existing = %existing_home, incoming = %incoming_home, "Home collection conflict");
        self.audit.report(AuditReport::HomeCollectionConflict {
            guid,
            existing_home,
            incoming_home,
            detail,
        });
    }

    // ========================================================================
    // Administration
    // ========================================================================

    /// Settle a home collection conflict in favour of `home`.
    ///
    /// When `home` is the quarantined side its newest quarantined state
    /// replaces the held copy. The quarantine for `guid` is cleared either way.
    pub fn resolve_home_conflict<T: ReplicatedInstance>(
        &self,
        guid: Guid,
        home: &MetadataCollectionId,
    ) -> Result<Option<T>> {
        let store = T::copy_store(self);
        let held = store.quarantine.remove(&guid).map(|(_, held)| held).unwrap_or_default();

        if held.is_empty() && store.copies.get(&guid).is_none() {
            return Err(T::not_known(guid));
        }

        let winner = held
            .into_iter()
            .filter(|copy| copy.home() == home)
            .max_by_key(|copy| copy.version());

        if let Some(winner) = winner {
            info!(%guid, home = %home, "Resolved home collection conflict");
            store.tombstones.remove(&guid);
            store.copies.insert(guid, winner.clone());
            return Ok(Some(winner));
        }

        Ok(store.get(&guid).filter(|copy| copy.home() == home))
    }

    /// Remove every copy homed in `home`
    pub fn purge_home(&self, home: &MetadataCollectionId) -> usize {
        let removed = self.entities.remove_home(home) + self.relationships.remove_home(home);
        info!(home = %home, removed, "Purged reference copies of departed member");
        removed
    }

    pub fn get_entity(&self, guid: &Guid) -> Option<EntityDetail> {
        self.entities.get(guid)
    }

    pub fn get_relationship(&self, guid: &Guid) -> Option<Relationship> {
        self.relationships.get(guid)
    }

    /// Entity copies matching `criteria`, ordered by creation time
    pub fn search_entities(&self, criteria: &SearchCriteria) -> Vec<EntityDetail> {
        let mut found: Vec<EntityDetail> = self
            .entities
            .values()
            .into_iter()
            .filter(|entity| criteria.matches(entity))
            .collect();
        found.sort_by(|a, b| {
            a.header
                .created_at
                .cmp(&b.header.created_at)
                .then(a.header.guid.cmp(&b.header.guid))
        });
        if let Some(limit) = criteria.limit {
            found.truncate(limit);
        }
        found
    }

    pub fn clear(&self) {
        self.entities.clear();
        self.relationships.clear();
    }
}

impl MembershipListener for ReferenceCopyManager {
    fn on_member_removed(&self, member: &MetadataCollectionId) {
        self.purge_home(member);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use cohort_core::types::{InstanceProperties, InstanceStatus, TypeDef, TypeDefCategory};

    fn manager() -> (ReferenceCopyManager, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::new("server-b", 32));
        (ReferenceCopyManager::new("repo-b".into(), audit.clone()), audit)
    }

    fn entity(home: &str, version: u64) -> EntityDetail {
        let def = TypeDef::new("Asset", TypeDefCategory::Entity);
        let mut entity = EntityDetail::new(&def, home.into())
            .with_guid(Guid::from_u128(42))
            .with_properties(InstanceProperties::new().with_int("revision", version as i64));
        entity.header.version = version;
        entity
    }

    fn event(origin: &str, action: InstanceAction, instance: EntityDetail) -> InstanceEvent<EntityDetail> {
        InstanceEvent {
            origin: origin.into(),
            action,
            instance,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_apply_in_order_and_duplicates() {
        let (manager, _) = manager();
        let created = event("repo-a", InstanceAction::Created, entity("repo-a", 1));
        assert_eq!(manager.apply(&created), ApplyOutcome::Created);
        assert_eq!(manager.apply(&created), ApplyOutcome::Duplicate);

        let updated = event("repo-a", InstanceAction::Updated, entity("repo-a", 2));
        assert_eq!(manager.apply(&updated), ApplyOutcome::Updated);

        let copy = manager.get_entity(&Guid::from_u128(42)).unwrap();
        assert_eq!(copy.header.version, 2);
        assert_eq!(copy.header.home.as_str(), "repo-a");
        assert!(copy.header.replicated_at.is_some());
    }

    #[test]
    fn test_gap_detected_and_reconciled() {
        let (manager, _) = manager();
        manager.apply(&event("repo-a", InstanceAction::Created, entity("repo-a", 1)));

        let ahead = event("repo-a", InstanceAction::Updated, entity("repo-a", 3));
        assert_eq!(manager.apply(&ahead), ApplyOutcome::Gap { stored: 1, incoming: 3 });
        assert_eq!(manager.get_entity(&Guid::from_u128(42)).unwrap().header.version, 1);

        assert_eq!(manager.apply_reconciled(entity("repo-a", 3)), ApplyOutcome::Updated);
        assert_eq!(manager.apply(&ahead), ApplyOutcome::Duplicate);
    }

    #[test]
    fn test_home_conflict_keeps_first_copy() {
        let (manager, audit) = manager();
        manager.apply(&event("repo-a", InstanceAction::Created, entity("repo-a", 1)));
        let outcome = manager.apply(&event("repo-c", InstanceAction::Created, entity("repo-c", 1)));

        assert_eq!(outcome, ApplyOutcome::Conflict);
        assert_eq!(
            manager.get_entity(&Guid::from_u128(42)).unwrap().header.home.as_str(),
            "repo-a"
        );
        assert_eq!(manager.entities().quarantined(&Guid::from_u128(42)).len(), 1);
        let conflicts =
            audit.reports_matching(|r| matches!(r, AuditReport::HomeCollectionConflict { .. }));
        assert_eq!(conflicts.len(), 1);

        let resolved = manager
            .resolve_home_conflict::<EntityDetail>(Guid::from_u128(42), &"repo-c".into())
            .unwrap()
            .unwrap();
        assert_eq!(resolved.header.home.as_str(), "repo-c");
        assert!(manager.entities().quarantined(&Guid::from_u128(42)).is_empty());
    }

    #[test]
    fn test_origin_must_be_home() {
        let (manager, _) = manager();
        let outcome = manager.apply(&event("repo-c", InstanceAction::Created, entity("repo-a", 1)));
        assert_eq!(outcome, ApplyOutcome::Conflict);
        assert!(manager.get_entity(&Guid::from_u128(42)).is_none());
    }

    #[test]
    fn test_purge_leaves_tombstone() {
        let (manager, _) = manager();
        manager.apply(&event("repo-a", InstanceAction::Created, entity("repo-a", 1)));

        let mut purged = entity("repo-a", 4);
        purged.header.status = InstanceStatus::Purged;
        assert_eq!(
            manager.apply(&event("repo-a", InstanceAction::Purged, purged)),
            ApplyOutcome::Purged
        );
        assert!(manager.get_entity(&Guid::from_u128(42)).is_none());

        let late = event("repo-a", InstanceAction::Updated, entity("repo-a", 2));
        assert_eq!(manager.apply(&late), ApplyOutcome::Duplicate);
        assert!(manager.entities().is_purged(&Guid::from_u128(42)));
    }

    #[test]
    fn test_member_removal_purges_its_copies() {
        let (manager, _) = manager();
        manager.apply(&event("repo-a", InstanceAction::Created, entity("repo-a", 1)));
        let other = entity("repo-c", 1).with_guid(Guid::from_u128(7));
        manager.apply(&event("repo-c", InstanceAction::Created, other));

        manager.on_member_removed(&"repo-a".into());
        assert!(manager.get_entity(&Guid::from_u128(42)).is_none());
        assert!(manager.get_entity(&Guid::from_u128(7)).is_some());
        assert!(manager.search_entities(&SearchCriteria::new()).len() == 1);
    }

    #[test]
    fn test_redelivered_conflict_is_held_and_reported_once() {
        let (manager, audit) = manager();
        manager.apply(&event("repo-a", InstanceAction::Created, entity("repo-a", 1)));

        let rival = event("repo-c", InstanceAction::Created, entity("repo-c", 1));
        assert_eq!(manager.apply(&rival), ApplyOutcome::Conflict);
        for _ in 0..4 {
            assert_eq!(manager.apply(&rival), ApplyOutcome::Duplicate);
        }
        let guid = Guid::from_u128(42);
        assert_eq!(manager.entities().quarantined(&guid).len(), 1);
        let conflicts =
            audit.reports_matching(|r| matches!(r, AuditReport::HomeCollectionConflict { .. }));
        assert_eq!(conflicts.len(), 1);

        // A newer rival state replaces the held one
        let newer = event("repo-c", InstanceAction::Updated, entity("repo-c", 2));
        assert_eq!(manager.apply(&newer), ApplyOutcome::Conflict);
        let held = manager.entities().quarantined(&guid);
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].header.version, 2);
    }

    #[test]
    fn test_member_removal_drops_its_tombstones() {
        let (manager, _) = manager();
        let mut purged = entity("repo-a", 2);
        purged.header.status = InstanceStatus::Purged;
        manager.apply(&event("repo-a", InstanceAction::Purged, purged));
        assert!(manager.entities().is_purged(&Guid::from_u128(42)));

        manager.purge_home(&"repo-a".into());
        assert!(!manager.entities().is_purged(&Guid::from_u128(42)));
    }
}
