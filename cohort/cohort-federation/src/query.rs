//! Enterprise Query Engine - answers queries across the whole cohort
//!
//! Every query runs against the local repository and the reference copies,
//! and concurrently against each registered member's connector.
//!
//! # Features
//!
//! - One task per member, bounded by the configured fan-out limit
//! - Per-member timeout inside a global deadline; a slow member only costs
//!   its own contribution
//! - Merge by guid, preferring the answer that came from the instance's home
//! - Home collection conflicts and diverging content are reported, never
//!   silently overwritten
//! - A per-member status map and a completeness flag on every answer

use crate::refcopy::{ReferenceCopyManager, ReplicatedInstance};
use crate::registry::CohortRegistry;
use cohort_core::audit::AuditReport;
use cohort_core::config::QueryConfig;
use cohort_core::error::{CohortError, Result};
use cohort_core::id::{Guid, MetadataCollectionId};
use cohort_core::traits::{AuditSink, ConnectorResolver, MetadataCollection};
use cohort_core::types::{EntityDetail, Instance, Relationship, SearchCriteria};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

// ============================================================================
// Result types
// ============================================================================

/// Where an answer came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "member", rename_all = "snake_case")]
pub enum Provenance {
    /// The local repository
    Local,
    /// A reference copy held locally
    ReferenceCopy,
    /// A remote member's connector
    Member(MetadataCollectionId),
}

/// An instance tagged with its home and provenance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sourced<T> {
    pub instance: T,
    pub home: MetadataCollectionId,
    pub provenance: Provenance,
    /// Answered by the instance's home collection
    pub authoritative: bool,
}

impl<T: Instance> Sourced<T> {
    fn new(instance: T, provenance: Provenance, authoritative: bool) -> Self {
        Self {
            home: instance.home().clone(),
            instance,
            provenance,
            authoritative,
        }
    }

    fn rank(&self) -> u8 {
        match (&self.provenance, self.authoritative) {
            (_, true) => 0,
            (Provenance::ReferenceCopy, false) => 1,
            _ => 2,
        }
    }
}

/// How one member contributed to a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum MemberOutcome {
    Success,
    Timeout,
    Error(String),
}

/// A merged answer with per-member status
#[derive(Debug, Clone, Serialize)]
pub struct EnterpriseResult<R> {
    pub value: R,
    pub member_status: BTreeMap<MetadataCollectionId, MemberOutcome>,
    /// Every member answered
    pub complete: bool,
}

impl<R> EnterpriseResult<R> {
    fn new(value: R, member_status: BTreeMap<MetadataCollectionId, MemberOutcome>) -> Self {
        let complete = member_status
            .values()
            .all(|outcome| *outcome == MemberOutcome::Success);
        Self {
            value,
            member_status,
            complete,
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.complete
    }
}

type MemberAnswers<R> = (
    Vec<(MetadataCollectionId, R)>,
    BTreeMap<MetadataCollectionId, MemberOutcome>,
);

// ============================================================================
// Engine
// ============================================================================

pub struct EnterpriseQueryEngine {
    local: Arc<dyn MetadataCollection>,
    copies: Arc<ReferenceCopyManager>,
    registry: Arc<CohortRegistry>,
    resolver: Arc<dyn ConnectorResolver>,
    audit: Arc<dyn AuditSink>,
    config: QueryConfig,
}

impl EnterpriseQueryEngine {
    pub fn new(
        local: Arc<dyn MetadataCollection>,
        copies: Arc<ReferenceCopyManager>,
        registry: Arc<CohortRegistry>,
        resolver: Arc<dyn ConnectorResolver>,
        audit: Arc<dyn AuditSink>,
        config: QueryConfig,
    ) -> Self {
        Self {
            local,
            copies,
            registry,
            resolver,
            audit,
            config,
        }
    }

    pub async fn find_entity_by_guid(&self, guid: Guid) -> Result<EnterpriseResult<Sourced<EntityDetail>>> {
        self.find_by_guid(guid).await
    }

    pub async fn find_relationship_by_guid(
        &self,
        guid: Guid,
    ) -> Result<EnterpriseResult<Sourced<Relationship>>> {
        self.find_by_guid(guid).await
    }

    /// Search every source; an empty result is not an error
    pub async fn search_entities(
        &self,
        criteria: &SearchCriteria,
    ) -> Result<EnterpriseResult<Vec<Sourced<EntityDetail>>>> {
        let local = async {
            let mut candidates: Vec<Sourced<EntityDetail>> = self
                .local
                .find_entities_by_property(criteria)
                .await?
                .into_iter()
                .map(|entity| Sourced::new(entity, Provenance::Local, true))
                .collect();
            candidates.extend(
                self.copies
                    .search_entities(criteria)
                    .into_iter()
                    .map(|entity| Sourced::new(entity, Provenance::ReferenceCopy, false)),
            );
            Ok::<_, CohortError>(candidates)
        };

        let shared = Arc::new(criteria.clone());
        let remote = self.fan_out("search_entities", move |connector| {
            let criteria = shared.clone();
            async move { connector.find_entities_by_property(&criteria).await }
        });

        let (local, (answers, member_status)) = tokio::join!(local, remote);
        let mut candidates = local?;
        for (member, entities) in answers {
            for entity in entities {
                let authoritative = entity.home() == &member;
                candidates.push(Sourced::new(entity, Provenance::Member(member.clone()), authoritative));
            }
        }

        let mut merged = self.merge(candidates);
        merged.sort_by(|a, b| {
            a.instance
                .header
                .created_at
                .cmp(&b.instance.header.created_at)
                .then(a.instance.header.guid.cmp(&b.instance.header.guid))
        });
        if let Some(limit) = criteria.limit {
            merged.truncate(limit);
        }

        Ok(EnterpriseResult::new(merged, member_status))
    }

    async fn find_by_guid<T: ReplicatedInstance>(&self, guid: Guid) -> Result<EnterpriseResult<Sourced<T>>> {
        let local = async {
            let mut candidates = Vec::new();
            match T::fetch(self.local.as_ref(), guid).await {
                Ok(found) => candidates.push(Sourced::new(found, Provenance::Local, true)),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            if let Some(copy) = T::copy_store(&self.copies).get(&guid) {
                candidates.push(Sourced::new(copy, Provenance::ReferenceCopy, false));
            }
            Ok(candidates)
        };

        let remote = self.fan_out("find_by_guid", move |connector| async move {
            match T::fetch(connector.as_ref(), guid).await {
                Ok(found) => Ok(Some(found)),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            }
        });

        let (local, (answers, member_status)) = tokio::join!(local, remote);
        let mut candidates = local?;
        for (member, found) in answers {
            if let Some(instance) = found {
                let authoritative = instance.home() == &member;
                candidates.push(Sourced::new(instance, Provenance::Member(member), authoritative));
            }
        }

        match self.merge(candidates).into_iter().next() {
            Some(value) => Ok(EnterpriseResult::new(value, member_status)),
            None => Err(T::not_known(guid)),
        }
    }

    // ========================================================================
    // Fan-out
    // ========================================================================

    /// Run `call` against every registered member concurrently
    async fn fan_out<R, F, Fut>(&self, operation: &'static str, call: F) -> MemberAnswers<R>
    where
        R: Send + 'static,
        F: Fn(Arc<dyn MetadataCollection>) -> Fut,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let members = self.registry.list_reachable_members();
        let semaphore = Arc::new(Semaphore::new(self.config.max_fan_out.max(1)));
        let member_timeout = self.config.member_timeout();
        let deadline = Instant::now() + self.config.global_timeout();

        let mut member_status = BTreeMap::new();
        let mut ids = Vec::with_capacity(members.len());
        let mut handles = Vec::with_capacity(members.len());

        for status in members {
            let id = status.member.metadata_collection_id.clone();
            let connector = match self.resolver.resolve(&status.member) {
                Ok(connector) => connector,
                Err(e) => {
                    self.registry.record_failure(&id, &e.to_string());
                    member_status.insert(id, MemberOutcome::Error(e.to_string()));
                    continue;
                }
            };

            let semaphore = semaphore.clone();
            let request = call(connector);
            ids.push(id);
            handles.push(tokio::spawn(async move {
                let bounded = async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| CohortError::internal("fan-out limiter closed"))?;
                    match tokio::time::timeout(member_timeout, request).await {
                        Ok(result) => result,
                        Err(_) => Err(CohortError::timeout(format!(
                            "{} exceeded {:?}",
                            operation, member_timeout
                        ))),
                    }
                };
                tokio::time::timeout_at(deadline, bounded)
                    .await
                    .unwrap_or_else(|_| {
                        Err(CohortError::timeout(format!("{} exceeded global deadline", operation)))
                    })
            }));
        }

        let joined = join_all(handles).await;
        let mut answers = Vec::with_capacity(joined.len());

        for (id, joined) in ids.into_iter().zip(joined) {
            let outcome = joined
                .unwrap_or_else(|e| Err(CohortError::internal(format!("query task failed: {}", e))));
            match outcome {
                Ok(answer) => {
                    self.registry.record_success(&id);
                    member_status.insert(id.clone(), MemberOutcome::Success);
                    answers.push((id, answer));
                }
                Err(CohortError::Timeout(reason)) => {
                    debug!(member = %id, operation, "Member timed out");
                    self.registry.record_failure(&id, &reason);
                    member_status.insert(id, MemberOutcome::Timeout);
                }
                Err(e) => {
                    if e.is_transient() {
                        self.registry.record_failure(&id, &e.to_string());
                    } else {
                        self.registry.record_success(&id);
                    }
                    member_status.insert(id, MemberOutcome::Error(e.to_string()));
                }
            }
        }

        (answers, member_status)
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// Collapse candidates sharing a guid into one entry each
    fn merge<T: Instance>(&self, candidates: Vec<Sourced<T>>) -> Vec<Sourced<T>> {
        let mut groups: BTreeMap<Guid, Vec<Sourced<T>>> = BTreeMap::new();
        for candidate in candidates {
            groups.entry(candidate.instance.guid()).or_default().push(candidate);
        }

        let mut merged = Vec::with_capacity(groups.len());
        for (guid, group) in groups {
            let best = group
                .iter()
                .enumerate()
                .min_by_key(|(position, candidate)| {
                    (candidate.rank(), Reverse(candidate.instance.version()), *position)
                })
                .map(|(position, _)| position)
                .unwrap_or(0);

            for (position, other) in group.iter().enumerate() {
                if position != best {
                    self.check_divergence(guid, &group[best], other);
                }
            }

            if let Some(chosen) = group.into_iter().nth(best) {
                merged.push(chosen);
            }
        }
        merged
    }

    fn check_divergence<T: Instance>(&self, guid: Guid, chosen: &Sourced<T>, other: &Sourced<T>) {
        let detail = if chosen.home != other.home {
            format!("{:?} and {:?} disagree on the home collection", chosen.provenance, other.provenance)
        } else if chosen.instance.version() == other.instance.version()
            && chosen.instance.fingerprint() != other.instance.fingerprint()
        {
            format!(
                "{:?} and {:?} hold different content at version {}",
                chosen.provenance,
                other.provenance,
                chosen.instance.version()
            )
        } else {
            return;
        };

        warn!(%guid, "{}", detail);
        self.audit.report(AuditReport::HomeCollectionConflict {
            guid,
            existing_home: chosen.home.clone(),
            incoming_home: other.home.clone(),
            detail,
        });
    }
}
