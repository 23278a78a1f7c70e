//! In-process connector directory.
//!
//! Stands in for a network transport: members advertise an `in-process`
//! endpoint at registration and the directory hands out connectors that call
//! the registered repository directly. Each endpoint carries a link state so
//! tests and simulations can cut a member off or slow it down.

use async_trait::async_trait;
use cohort_core::error::{CohortError, Result};
use cohort_core::id::{Guid, MetadataCollectionId};
use cohort_core::traits::{ConnectorResolver, MetadataCollection};
use cohort_core::types::*;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// Simulated network conditions for one endpoint
#[derive(Debug)]
pub struct LinkState {
    reachable: AtomicBool,
    latency_ms: AtomicU64,
}

impl LinkState {
    fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms.load(Ordering::SeqCst))
    }
}

struct Endpoint {
    collection: Arc<dyn MetadataCollection>,
    link: Arc<LinkState>,
}

/// Endpoint name to repository map
#[derive(Default)]
pub struct InProcessDirectory {
    endpoints: DashMap<String, Endpoint>,
}

impl InProcessDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose `collection` under `endpoint`, replacing any previous binding
    pub fn register(&self, endpoint: impl Into<String>, collection: Arc<dyn MetadataCollection>) {
        let endpoint = endpoint.into();
        debug!(endpoint = %endpoint, collection = %collection.metadata_collection_id(), "Registered in-process endpoint");
        self.endpoints.insert(
            endpoint,
            Endpoint {
                collection,
                link: Arc::new(LinkState::new()),
            },
        );
    }

    pub fn unregister(&self, endpoint: &str) -> bool {
        self.endpoints.remove(endpoint).is_some()
    }

    pub fn contains(&self, endpoint: &str) -> bool {
        self.endpoints.contains_key(endpoint)
    }

    /// Cut off or restore an endpoint
    pub fn set_reachable(&self, endpoint: &str, reachable: bool) {
        if let Some(entry) = self.endpoints.get(endpoint) {
            debug!(endpoint, reachable, "Link state changed");
            entry.link.reachable.store(reachable, Ordering::SeqCst);
        }
    }

    /// Delay every call to an endpoint
    pub fn set_latency(&self, endpoint: &str, latency: Duration) {
        if let Some(entry) = self.endpoints.get(endpoint) {
            entry
                .link
                .latency_ms
                .store(latency.as_millis() as u64, Ordering::SeqCst);
        }
    }

    pub fn link(&self, endpoint: &str) -> Option<Arc<LinkState>> {
        self.endpoints.get(endpoint).map(|entry| entry.link.clone())
    }
}

impl ConnectorResolver for InProcessDirectory {
    fn resolve(&self, member: &CohortMember) -> Result<Arc<dyn MetadataCollection>> {
        if member.connection.transport != ConnectionDescriptor::IN_PROCESS {
            return Err(CohortError::invalid_parameter(
                "connection.transport",
                "resolve",
                format!("unsupported transport {}", member.connection.transport),
            ));
        }

        let entry = self.endpoints.get(&member.connection.endpoint).ok_or_else(|| {
            CohortError::member_unreachable(
                member.metadata_collection_id.clone(),
                format!("no endpoint {}", member.connection.endpoint),
            )
        })?;

        Ok(Arc::new(InProcessConnector {
            member: member.metadata_collection_id.clone(),
            inner: entry.collection.clone(),
            link: entry.link.clone(),
        }))
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Connector that applies the endpoint's link state before every call
pub struct InProcessConnector {
    member: MetadataCollectionId,
    inner: Arc<dyn MetadataCollection>,
    link: Arc<LinkState>,
}

impl InProcessConnector {
    async fn gate(&self, operation: &str) -> Result<()> {
        let latency = self.link.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !self.link.is_reachable() {
            trace!(member = %self.member, operation, "Call refused, member unreachable");
            return Err(CohortError::member_unreachable(
                self.member.clone(),
                format!("{} refused: link down", operation),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataCollection for InProcessConnector {
    fn metadata_collection_id(&self) -> &MetadataCollectionId {
        &self.member
    }

    async fn get_type_def(&self, guid: Guid) -> Result<TypeDef> {
        self.gate("get_type_def").await?;
        self.inner.get_type_def(guid).await
    }

    async fn find_type_def_by_name(&self, name: &str) -> Result<TypeDef> {
        self.gate("find_type_def_by_name").await?;
        self.inner.find_type_def_by_name(name).await
    }

    async fn add_type_def(&self, type_def: TypeDef) -> Result<TypeDef> {
        self.gate("add_type_def").await?;
        self.inner.add_type_def(type_def).await
    }

    async fn list_type_defs(&self) -> Result<Vec<TypeDef>> {
        self.gate("list_type_defs").await?;
        self.inner.list_type_defs().await
    }

    async fn create_entity(&self, entity: EntityDetail) -> Result<EntityDetail> {
        self.gate("create_entity").await?;
        self.inner.create_entity(entity).await
    }

    async fn get_entity(&self, guid: Guid) -> Result<EntityDetail> {
        self.gate("get_entity").await?;
        self.inner.get_entity(guid).await
    }

    async fn update_entity(
        &self,
        guid: Guid,
        expected_version: u64,
        properties: InstanceProperties,
    ) -> Result<EntityDetail> {
        self.gate("update_entity").await?;
        self.inner.update_entity(guid, expected_version, properties).await
    }

    async fn classify_entity(
        &self,
        guid: Guid,
        expected_version: u64,
        classification: Classification,
    ) -> Result<EntityDetail> {
        self.gate("classify_entity").await?;
        self.inner
            .classify_entity(guid, expected_version, classification)
            .await
    }

    async fn declassify_entity(
        &self,
        guid: Guid,
        expected_version: u64,
        classification_name: &str,
    ) -> Result<EntityDetail> {
        self.gate("declassify_entity").await?;
        self.inner
            .declassify_entity(guid, expected_version, classification_name)
            .await
    }

    async fn delete_entity(&self, guid: Guid, expected_version: u64) -> Result<EntityDetail> {
        self.gate("delete_entity").await?;
        self.inner.delete_entity(guid, expected_version).await
    }

    async fn restore_entity(&self, guid: Guid) -> Result<EntityDetail> {
        self.gate("restore_entity").await?;
        self.inner.restore_entity(guid).await
    }

    async fn purge_entity(&self, guid: Guid) -> Result<EntityDetail> {
        self.gate("purge_entity").await?;
        self.inner.purge_entity(guid).await
    }

    async fn create_relationship(&self, relationship: Relationship) -> Result<Relationship> {
        self.gate("create_relationship").await?;
        self.inner.create_relationship(relationship).await
    }

    async fn get_relationship(&self, guid: Guid) -> Result<Relationship> {
        self.gate("get_relationship").await?;
        self.inner.get_relationship(guid).await
    }

    async fn update_relationship(
        &self,
        guid: Guid,
        expected_version: u64,
        properties: InstanceProperties,
    ) -> Result<Relationship> {
        self.gate("update_relationship").await?;
        self.inner
            .update_relationship(guid, expected_version, properties)
            .await
    }

    async fn delete_relationship(&self, guid: Guid, expected_version: u64) -> Result<Relationship> {
        self.gate("delete_relationship").await?;
        self.inner.delete_relationship(guid, expected_version).await
    }

    async fn restore_relationship(&self, guid: Guid) -> Result<Relationship> {
        self.gate("restore_relationship").await?;
        self.inner.restore_relationship(guid).await
    }

    async fn purge_relationship(&self, guid: Guid) -> Result<Relationship> {
        self.gate("purge_relationship").await?;
        self.inner.purge_relationship(guid).await
    }

    async fn find_entities_by_property(&self, criteria: &SearchCriteria) -> Result<Vec<EntityDetail>> {
        self.gate("find_entities_by_property").await?;
        self.inner.find_entities_by_property(criteria).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_repository::InMemoryRepository;

    fn member() -> CohortMember {
        CohortMember::new("repo-a".into(), "server-a", ConnectionDescriptor::in_process("repo-a"))
    }

    #[tokio::test]
    async fn test_link_down_refuses_calls() {
        let directory = InProcessDirectory::new();
        directory.register("repo-a", Arc::new(InMemoryRepository::new("repo-a".into())));

        let connector = directory.resolve(&member()).unwrap();
        assert!(connector.list_type_defs().await.unwrap().is_empty());

        directory.set_reachable("repo-a", false);
        let err = connector.list_type_defs().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unknown_endpoint_and_transport() {
        let directory = InProcessDirectory::new();
        assert!(directory.resolve(&member()).err().unwrap().is_transient());

        let mut remote = member();
        remote.connection.transport = "https".to_string();
        assert!(matches!(
            directory.resolve(&remote),
            Err(CohortError::InvalidParameter { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_applied() {
        let directory = InProcessDirectory::new();
        directory.register("repo-a", Arc::new(InMemoryRepository::new("repo-a".into())));
        directory.set_latency("repo-a", Duration::from_secs(3));

        let connector = directory.resolve(&member()).unwrap();
        let started = tokio::time::Instant::now();
        connector.list_type_defs().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));
    }
}
