//! Cohort Registry - the members of a cohort as seen by one server
//!
//! Tracks which remote repositories belong to the cohort, how to reach them
//! and how recently they answered.
//!
//! # Features
//!
//! - Idempotent registration keyed by metadata collection id
//! - Contact tracking with consecutive-failure counting
//! - Degraded-member warnings once the failure budget is spent
//! - Removal listeners for reference copy cleanup
//! - Departed members remembered until they register again
//!
//! A member is only ever removed by an explicit deregistration. Timeouts mark
//! it degraded but keep it, and its reference copies, in place.

use chrono::{DateTime, Utc};
use cohort_core::audit::AuditReport;
use cohort_core::id::MetadataCollectionId;
use cohort_core::traits::AuditSink;
use cohort_core::types::CohortMember;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ============================================================================
// Member records
// ============================================================================

/// A known member annotated with contact history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberStatus {
    pub member: CohortMember,

    /// Last successful call or event from the member
    pub last_contact: Option<DateTime<Utc>>,

    /// Failed calls since the last success
    pub consecutive_failures: u32,

    /// Set once the failure budget is spent, cleared on the next success
    pub degraded: bool,
}

/// Outcome of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationOutcome {
    Added,
    Refreshed,
    /// The registration named the local collection
    IgnoredSelf,
}

/// Notified when a member leaves the cohort
pub trait MembershipListener: Send + Sync {
    fn on_member_removed(&self, member: &MetadataCollectionId);
}

// ============================================================================
// Registry
// ============================================================================

pub struct CohortRegistry {
    local_id: MetadataCollectionId,

    /// Members indexed by metadata collection id
    members: RwLock<HashMap<MetadataCollectionId, MemberStatus>>,

    /// Members removed by deregistration and not registered since
    departed: RwLock<HashSet<MetadataCollectionId>>,

    listeners: RwLock<Vec<Arc<dyn MembershipListener>>>,

    audit: Arc<dyn AuditSink>,

    /// Consecutive failures before a member is reported degraded
    degraded_after: u32,
}

impl CohortRegistry {
    pub fn new(local_id: MetadataCollectionId, audit: Arc<dyn AuditSink>, degraded_after: u32) -> Self {
        Self {
            local_id,
            members: RwLock::new(HashMap::new()),
            departed: RwLock::new(HashSet::new()),
            listeners: RwLock::new(Vec::new()),
            audit,
            degraded_after: degraded_after.max(1),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.listeners.write().push(listener);
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Insert or refresh a member
    pub fn register(&self, mut member: CohortMember) -> RegistrationOutcome {
        if member.metadata_collection_id == self.local_id {
            return RegistrationOutcome::IgnoredSelf;
        }

        let now = Utc::now();
        member.last_seen = Some(now);
        self.departed.write().remove(&member.metadata_collection_id);

        let mut members = self.members.write();
        match members.get_mut(&member.metadata_collection_id) {
            Some(status) => {
                debug!(member = %member.metadata_collection_id, "Refreshed cohort member");
                status.member = member;
                status.last_contact = Some(now);
                status.consecutive_failures = 0;
                status.degraded = false;
                RegistrationOutcome::Refreshed
            }
            None => {
                info!(
                    member = %member.metadata_collection_id,
                    server = %member.server_name,
                    protocol = %member.protocol_version,
                    "Registered cohort member"
                );
                members.insert(
                    member.metadata_collection_id.clone(),
                    MemberStatus {
                        member,
                        last_contact: Some(now),
                        consecutive_failures: 0,
                        degraded: false,
                    },
                );
                RegistrationOutcome::Added
            }
        }
    }

    /// Remove a member and notify listeners so its reference copies are purged
    pub fn deregister(&self, id: &MetadataCollectionId) -> Option<CohortMember> {
        let removed = self.members.write().remove(id)?;
        self.departed.write().insert(id.clone());
        info!(member = %id, "Deregistered cohort member");

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_member_removed(id);
        }
        Some(removed.member)
    }

    pub fn get(&self, id: &MetadataCollectionId) -> Option<MemberStatus> {
        self.members.read().get(id).cloned()
    }

    pub fn contains(&self, id: &MetadataCollectionId) -> bool {
        self.members.read().contains_key(id)
    }

    /// True when `id` was deregistered and has not registered again
    pub fn is_departed(&self, id: &MetadataCollectionId) -> bool {
        self.departed.read().contains(id)
    }

    /// Every known member with its last successful contact, ordered by id
    pub fn list_reachable_members(&self) -> Vec<MemberStatus> {
        let mut members: Vec<MemberStatus> = self.members.read().values().cloned().collect();
        members.sort_by(|a, b| {
            a.member
                .metadata_collection_id
                .cmp(&b.member.metadata_collection_id)
        });
        members
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    // ========================================================================
    // Contact tracking
    // ========================================================================

    /// Record a successful call or event
    pub fn record_success(&self, id: &MetadataCollectionId) {
        if let Some(status) = self.members.write().get_mut(id) {
            let now = Utc::now();
            status.last_contact = Some(now);
            status.member.last_seen = Some(now);
            if status.degraded {
                info!(member = %id, "Cohort member recovered");
            }
            status.consecutive_failures = 0;
            status.degraded = false;
        }
    }

    /// Record a failed call; reports a degraded member once the budget is spent
    pub fn record_failure(&self, id: &MetadataCollectionId, reason: &str) {
        let crossed = {
            let mut members = self.members.write();
            let Some(status) = members.get_mut(id) else {
                return;
            };
            status.consecutive_failures += 1;
            let crossed = !status.degraded && status.consecutive_failures >= self.degraded_after;
            if crossed {
                status.degraded = true;
            }
            crossed.then_some(status.consecutive_failures)
        };

        self.audit.report(AuditReport::MemberUnreachable {
            member: id.clone(),
            reason: reason.to_string(),
        });

        if let Some(consecutive_failures) = crossed {
            warn!(member = %id, consecutive_failures, "Cohort member degraded");
            self.audit.report(AuditReport::DegradedMember {
                member: id.clone(),
                consecutive_failures,
            });
        }
    }

    /// Forget all members without notifying listeners
    pub fn clear(&self) {
        self.members.write().clear();
        self.departed.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use cohort_core::types::ConnectionDescriptor;
    use parking_lot::Mutex;

    fn member(id: &str) -> CohortMember {
        CohortMember::new(id.into(), format!("server-{}", id), ConnectionDescriptor::in_process(id))
    }

    fn registry() -> (CohortRegistry, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::new("server-a", 32));
        (CohortRegistry::new("repo-a".into(), audit.clone(), 3), audit)
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<MetadataCollectionId>>);

    impl MembershipListener for Recorder {
        fn on_member_removed(&self, member: &MetadataCollectionId) {
            self.0.lock().push(member.clone());
        }
    }

    #[test]
    fn test_register_is_idempotent() {
        let (registry, _) = registry();
        assert_eq!(registry.register(member("repo-b")), RegistrationOutcome::Added);
        assert_eq!(registry.register(member("repo-b")), RegistrationOutcome::Refreshed);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.register(member("repo-a")), RegistrationOutcome::IgnoredSelf);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_failures_degrade_but_never_remove() {
        let (registry, audit) = registry();
        registry.register(member("repo-b"));

        for _ in 0..5 {
            registry.record_failure(&"repo-b".into(), "timeout");
        }

        let status = registry.get(&"repo-b".into()).unwrap();
        assert!(status.degraded);
        assert_eq!(status.consecutive_failures, 5);
        let degraded = audit.reports_matching(|r| matches!(r, AuditReport::DegradedMember { .. }));
        assert_eq!(degraded.len(), 1);

        registry.record_success(&"repo-b".into());
        let status = registry.get(&"repo-b".into()).unwrap();
        assert!(!status.degraded);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[test]
    fn test_deregister_notifies_listeners() {
        let (registry, _) = registry();
        let recorder = Arc::new(Recorder::default());
        registry.add_listener(recorder.clone());
        registry.register(member("repo-b"));

        assert!(registry.deregister(&"repo-b".into()).is_some());
        assert!(registry.deregister(&"repo-b".into()).is_none());
        assert_eq!(recorder.0.lock().as_slice(), &["repo-b".into()]);
        assert!(registry.list_reachable_members().is_empty());
    }

    #[test]
    fn test_departed_until_registered_again() {
        let (registry, _) = registry();
        registry.register(member("repo-b"));
        assert!(!registry.is_departed(&"repo-b".into()));

        registry.deregister(&"repo-b".into());
        assert!(registry.is_departed(&"repo-b".into()));
        assert!(!registry.is_departed(&"repo-c".into()));

        registry.register(member("repo-b"));
        assert!(!registry.is_departed(&"repo-b".into()));
    }
}
