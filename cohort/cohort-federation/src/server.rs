//! Federation server: one cohort member and all of its process-scoped state.
//!
//! A [`FederationServer`] owns
//! - the TypeDef Store and the local repository
//! - the Cohort Registry and the Reference Copy Manager
//! - the Enterprise Query Engine
//! - the event exchange workers, the audit log and exchange counters
//!
//! Local mutations are validated against the TypeDef Store, committed to the
//! local repository and then handed to the outbound publisher. The commit
//! never waits on replication.

use crate::audit::{AuditLog, DEFAULT_AUDIT_CAPACITY};
use crate::connector::InProcessDirectory;
use crate::exchange::{
    EventDispatcher, InFlight, InboundRouter, InstanceSequencer, OutboundPublisher, OutboundQueue,
};
use crate::query::{EnterpriseQueryEngine, EnterpriseResult, Sourced};
use crate::refcopy::{ReferenceCopyManager, ReplicatedInstance};
use crate::registry::CohortRegistry;
use crate::retry::RetryPolicy;
use crate::stats::{ExchangeStatistics, ExchangeStats};
use crate::typedef_store::{TypeDefApplied, TypeDefStore};
use chrono::Utc;
use cohort_core::config::CohortConfig;
use cohort_core::error::{CohortError, Result};
use cohort_core::event::{
    InstanceAction, InstanceEvent, RegistrationAction, ReplicationEvent, TypeDefAction,
};
use cohort_core::id::{Guid, MetadataCollectionId};
use cohort_core::traits::{AuditSink, ConnectorResolver, EventTopic, MetadataCollection};
use cohort_core::types::*;
use cohort_repository::InMemoryRepository;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long shutdown waits for queued events to reach the topic
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

struct Running {
    cancel: CancellationToken,
    publisher: JoinHandle<()>,
    inbound: InboundRouter,
    dispatcher: Arc<EventDispatcher>,
}

enum Lifecycle {
    Created(OutboundQueue),
    Running(Running),
    Stopped,
}

/// Point-in-time view of a server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub server_name: String,
    pub metadata_collection_id: MetadataCollectionId,
    pub running: bool,
    pub members: usize,
    pub type_defs: usize,
    pub local_entities: usize,
    pub local_relationships: usize,
    pub entity_copies: usize,
    pub relationship_copies: usize,
    pub exchange: ExchangeStatistics,
}

pub struct FederationServer {
    config: CohortConfig,
    local_member: CohortMember,
    type_defs: Arc<TypeDefStore>,
    repository: Arc<InMemoryRepository>,
    registry: Arc<CohortRegistry>,
    copies: Arc<ReferenceCopyManager>,
    query: EnterpriseQueryEngine,
    audit: Arc<AuditLog>,
    stats: Arc<ExchangeStats>,
    topic: Arc<dyn EventTopic>,
    resolver: Arc<dyn ConnectorResolver>,
    outbound: OutboundPublisher,
    /// Serializes TypeDef Store and repository writes with their publication
    type_def_writes: Arc<tokio::sync::Mutex<()>>,
    lifecycle: Mutex<Lifecycle>,
}

impl FederationServer {
    /// Build a server that advertises `connection` to the cohort
    pub fn new(
        config: CohortConfig,
        topic: Arc<dyn EventTopic>,
        resolver: Arc<dyn ConnectorResolver>,
        connection: ConnectionDescriptor,
    ) -> Result<Self> {
        config.validate()?;

        let local_id = config.metadata_collection_id();
        let server_name = config.general.server_name.clone();
        let local_member = CohortMember::new(local_id.clone(), server_name.clone(), connection);

        let audit = Arc::new(AuditLog::new(server_name, DEFAULT_AUDIT_CAPACITY));
        let sink: Arc<dyn AuditSink> = audit.clone();

        let type_defs = Arc::new(TypeDefStore::new(local_id.clone(), sink.clone()));
        let repository = Arc::new(InMemoryRepository::new(local_id.clone()));
        let registry = Arc::new(CohortRegistry::new(
            local_id.clone(),
            sink.clone(),
            config.retry.degraded_after_failures,
        ));
        let copies = Arc::new(ReferenceCopyManager::new(local_id, sink.clone()));
        registry.add_listener(copies.clone());

        let query = EnterpriseQueryEngine::new(
            repository.clone(),
            copies.clone(),
            registry.clone(),
            resolver.clone(),
            sink,
            config.query.clone(),
        );
        let (outbound, queue) = OutboundPublisher::channel();

        Ok(Self {
            config,
            local_member,
            type_defs,
            repository,
            registry,
            copies,
            query,
            audit,
            stats: Arc::new(ExchangeStats::new()),
            topic,
            resolver,
            outbound,
            type_def_writes: Arc::new(tokio::sync::Mutex::new(())),
            lifecycle: Mutex::new(Lifecycle::Created(queue)),
        })
    }

    /// Build a server reachable through `directory` under its server name
    pub fn in_process(
        config: CohortConfig,
        topic: Arc<dyn EventTopic>,
        directory: &Arc<InProcessDirectory>,
    ) -> Result<Self> {
        let endpoint = config.general.server_name.clone();
        let server = Self::new(
            config,
            topic,
            directory.clone(),
            ConnectionDescriptor::in_process(endpoint.clone()),
        )?;
        directory.register(endpoint, server.repository.clone());
        Ok(server)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the exchange workers and announce this server to the cohort
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        let queue = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Created(queue) => queue,
            other => {
                *lifecycle = other;
                return Err(CohortError::internal(format!(
                    "server {} cannot be started twice",
                    self.server_name()
                )));
            }
        };

        let subscription = match self.topic.subscribe() {
            Ok(subscription) => subscription,
            Err(e) => {
                *lifecycle = Lifecycle::Created(queue);
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let sink: Arc<dyn AuditSink> = self.audit.clone();

        let publisher = self.outbound.spawn(
            queue,
            self.topic.clone(),
            RetryPolicy::from(&self.config.retry),
            self.stats.clone(),
            sink.clone(),
            cancel.child_token(),
        );

        let sequencer = Arc::new(InstanceSequencer::new(
            self.repository.clone(),
            self.copies.clone(),
            self.registry.clone(),
            self.resolver.clone(),
            self.stats.clone(),
            self.config.exchange.reconciliation_timeout(),
        ));
        self.registry.add_listener(sequencer.clone());
        let dispatcher = Arc::new(EventDispatcher::new(
            self.local_member.clone(),
            self.type_defs.clone(),
            self.repository.clone(),
            self.registry.clone(),
            sequencer,
            self.outbound.clone(),
            sink,
            self.stats.clone(),
            self.type_def_writes.clone(),
        ));
        let inbound = InboundRouter::spawn(
            subscription,
            dispatcher.clone(),
            self.config.exchange.inbound_workers,
            self.stats.clone(),
            cancel.child_token(),
        );

        *lifecycle = Lifecycle::Running(Running {
            cancel,
            publisher,
            inbound,
            dispatcher,
        });
        drop(lifecycle);

        self.announce(RegistrationAction::Register);
        info!(
            server = %self.server_name(),
            collection = %self.metadata_collection_id(),
            cohort = %self.topic.name(),
            "Federation server started"
        );
        Ok(())
    }

    /// Leave the cohort, stop the workers and clear process-scoped caches
    pub async fn shutdown(&self) -> Result<()> {
        let running = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(running) => running,
                Lifecycle::Created(_) | Lifecycle::Stopped => return Ok(()),
            }
        };

        self.announce(RegistrationAction::Unregister);
        if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, self.outbound.wait_idle())
            .await
            .is_err()
        {
            warn!(
                server = %self.server_name(),
                pending = self.outbound.pending(),
                "Shutdown flush timed out"
            );
        }

        running.cancel.cancel();
        let _ = running.publisher.await;
        running.inbound.join().await;
        running.dispatcher.sequencer().clear();

        self.registry.clear();
        self.copies.clear();
        self.type_defs.clear();

        info!(server = %self.server_name(), "Federation server stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running(_))
    }

    /// Wait until queued outbound events are published and received events
    /// are processed
    pub async fn wait_idle(&self) {
        self.outbound.wait_idle().await;
        let inbound: Option<InFlight> = match &*self.lifecycle.lock() {
            Lifecycle::Running(running) => Some(running.inbound.tracker()),
            _ => None,
        };
        if let Some(inbound) = inbound {
            inbound.wait_idle().await;
        }
    }

    /// Outbound plus inbound events still in flight
    pub fn in_flight(&self) -> usize {
        let inbound = match &*self.lifecycle.lock() {
            Lifecycle::Running(running) => running.inbound.pending(),
            _ => 0,
        };
        self.outbound.pending() + inbound
    }

    fn announce(&self, action: RegistrationAction) {
        self.outbound.publish(ReplicationEvent::registration(
            self.metadata_collection_id().clone(),
            action,
            self.local_member.clone(),
        ));
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn server_name(&self) -> &str {
        &self.local_member.server_name
    }

    pub fn metadata_collection_id(&self) -> &MetadataCollectionId {
        &self.local_member.metadata_collection_id
    }

    pub fn member(&self) -> &CohortMember {
        &self.local_member
    }

    pub fn config(&self) -> &CohortConfig {
        &self.config
    }

    pub fn type_defs(&self) -> &TypeDefStore {
        &self.type_defs
    }

    pub fn repository(&self) -> &Arc<InMemoryRepository> {
        &self.repository
    }

    pub fn registry(&self) -> &CohortRegistry {
        &self.registry
    }

    pub fn copies(&self) -> &ReferenceCopyManager {
        &self.copies
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn statistics(&self) -> ExchangeStatistics {
        self.stats.snapshot()
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            server_name: self.server_name().to_string(),
            metadata_collection_id: self.metadata_collection_id().clone(),
            running: self.is_running(),
            members: self.registry.len(),
            type_defs: self.type_defs.len(),
            local_entities: self.repository.entity_count(),
            local_relationships: self.repository.relationship_count(),
            entity_copies: self.copies.entities().len(),
            relationship_copies: self.copies.relationships().len(),
            exchange: self.stats.snapshot(),
        }
    }

    // ========================================================================
    // Type definitions
    // ========================================================================

    /// Add a type definition and replicate it
    pub async fn add_type_def(&self, def: TypeDef) -> Result<TypeDefApplied> {
        let _writes = self.type_def_writes.lock().await;
        let applied = self.type_defs.add_type_def(def.clone())?;
        if applied != TypeDefApplied::Duplicate {
            self.repository.add_type_def(def.clone()).await?;
            self.outbound.publish(ReplicationEvent::type_def(
                self.metadata_collection_id().clone(),
                TypeDefAction::Added,
                def,
            ));
        }
        Ok(applied)
    }

    /// Extend a type definition and replicate the patched version
    pub async fn patch_type_def(&self, patch: &TypeDefPatch) -> Result<TypeDef> {
        let _writes = self.type_def_writes.lock().await;
        let patched = self.type_defs.patch_type_def(patch)?;
        self.repository.add_type_def(patched.clone()).await?;
        self.outbound.publish(ReplicationEvent::type_def(
            self.metadata_collection_id().clone(),
            TypeDefAction::Patched,
            patched.clone(),
        ));
        Ok(patched)
    }

    pub fn get_type_def(&self, guid: Guid) -> Result<TypeDef> {
        self.type_defs.get_type_def(guid)
    }

    pub fn find_type_def_by_name(&self, name: &str) -> Result<TypeDef> {
        self.type_defs.find_type_def_by_name(name)
    }

    pub fn list_type_defs(&self) -> Vec<TypeDef> {
        self.type_defs.list()
    }

    // ========================================================================
    // Entities
    // ========================================================================

    pub async fn create_entity(&self, type_name: &str, properties: InstanceProperties) -> Result<EntityDetail> {
        self.create_entity_with_guid(Guid::new(), type_name, properties)
            .await
    }

    /// Create an entity under a caller-chosen guid
    pub async fn create_entity_with_guid(
        &self,
        guid: Guid,
        type_name: &str,
        properties: InstanceProperties,
    ) -> Result<EntityDetail> {
        const OPERATION: &str = "create_entity";
        let def = self
            .type_defs
            .resolve_instance_type(type_name, TypeDefCategory::Entity, OPERATION)?;
        self.type_defs.validate_properties(&def, &properties, OPERATION)?;
        self.check_guid_free::<EntityDetail>(guid)?;

        let entity = self
            .repository
            .create_entity(
                EntityDetail::new(&def, self.metadata_collection_id().clone())
                    .with_guid(guid)
                    .with_properties(properties),
            )
            .await?;
        self.emit(InstanceAction::Created, &entity);
        Ok(entity)
    }

    pub async fn update_entity(
        &self,
        guid: Guid,
        expected_version: u64,
        properties: InstanceProperties,
    ) -> Result<EntityDetail> {
        let current: EntityDetail = self.ensure_owned(guid).await?;
        let def = self.type_defs.get_type_def(current.header.instance_type.type_def_guid)?;
        self.type_defs
            .validate_properties(&def, &properties, "update_entity")?;

        let entity = self
            .repository
            .update_entity(guid, expected_version, properties)
            .await?;
        self.emit(InstanceAction::Updated, &entity);
        Ok(entity)
    }

    pub async fn classify_entity(
        &self,
        guid: Guid,
        expected_version: u64,
        classification: Classification,
    ) -> Result<EntityDetail> {
        self.ensure_owned::<EntityDetail>(guid).await?;
        self.type_defs
            .validate_classification(&classification, "classify_entity")?;

        let entity = self
            .repository
            .classify_entity(guid, expected_version, classification)
            .await?;
        self.emit(InstanceAction::Updated, &entity);
        Ok(entity)
    }

    pub async fn declassify_entity(
        &self,
        guid: Guid,
        expected_version: u64,
        classification_name: &str,
    ) -> Result<EntityDetail> {
        self.ensure_owned::<EntityDetail>(guid).await?;
        let entity = self
            .repository
            .declassify_entity(guid, expected_version, classification_name)
            .await?;
        self.emit(InstanceAction::Updated, &entity);
        Ok(entity)
    }

    pub async fn delete_entity(&self, guid: Guid, expected_version: u64) -> Result<EntityDetail> {
        self.ensure_owned::<EntityDetail>(guid).await?;
        let entity = self.repository.delete_entity(guid, expected_version).await?;
        self.emit(InstanceAction::Deleted, &entity);
        Ok(entity)
    }

    pub async fn restore_entity(&self, guid: Guid) -> Result<EntityDetail> {
        self.ensure_owned::<EntityDetail>(guid).await?;
        let entity = self.repository.restore_entity(guid).await?;
        self.emit(InstanceAction::Restored, &entity);
        Ok(entity)
    }

    pub async fn purge_entity(&self, guid: Guid) -> Result<EntityDetail> {
        self.ensure_owned::<EntityDetail>(guid).await?;
        let entity = self.repository.purge_entity(guid).await?;
        self.emit(InstanceAction::Purged, &entity);
        Ok(entity)
    }

    // ========================================================================
    // Relationships
    // ========================================================================

    pub async fn create_relationship(
        &self,
        type_name: &str,
        end_one: Guid,
        end_two: Guid,
        properties: InstanceProperties,
    ) -> Result<Relationship> {
        const OPERATION: &str = "create_relationship";
        let def = self.type_defs.resolve_instance_type(
            type_name,
            TypeDefCategory::Relationship,
            OPERATION,
        )?;
        self.type_defs.validate_properties(&def, &properties, OPERATION)?;
        for end in [end_one, end_two] {
            if !self.entity_known(end).await {
                return Err(CohortError::entity_not_known(end));
            }
        }

        let relationship = self
            .repository
            .create_relationship(
                Relationship::new(&def, self.metadata_collection_id().clone(), end_one, end_two)
                    .with_properties(properties),
            )
            .await?;
        self.emit(InstanceAction::Created, &relationship);
        Ok(relationship)
    }

    pub async fn update_relationship(
        &self,
        guid: Guid,
        expected_version: u64,
        properties: InstanceProperties,
    ) -> Result<Relationship> {
        let current: Relationship = self.ensure_owned(guid).await?;
        let def = self.type_defs.get_type_def(current.header.instance_type.type_def_guid)?;
        self.type_defs
            .validate_properties(&def, &properties, "update_relationship")?;

        let relationship = self
            .repository
            .update_relationship(guid, expected_version, properties)
            .await?;
        self.emit(InstanceAction::Updated, &relationship);
        Ok(relationship)
    }

    pub async fn delete_relationship(&self, guid: Guid, expected_version: u64) -> Result<Relationship> {
        self.ensure_owned::<Relationship>(guid).await?;
        let relationship = self
            .repository
            .delete_relationship(guid, expected_version)
            .await?;
        self.emit(InstanceAction::Deleted, &relationship);
        Ok(relationship)
    }

    pub async fn restore_relationship(&self, guid: Guid) -> Result<Relationship> {
        self.ensure_owned::<Relationship>(guid).await?;
        let relationship = self.repository.restore_relationship(guid).await?;
        self.emit(InstanceAction::Restored, &relationship);
        Ok(relationship)
    }

    pub async fn purge_relationship(&self, guid: Guid) -> Result<Relationship> {
        self.ensure_owned::<Relationship>(guid).await?;
        let relationship = self.repository.purge_relationship(guid).await?;
        self.emit(InstanceAction::Purged, &relationship);
        Ok(relationship)
    }

    // ========================================================================
    // Enterprise queries
    // ========================================================================

    pub async fn find_entity_by_guid(&self, guid: Guid) -> Result<EnterpriseResult<Sourced<EntityDetail>>> {
        self.query.find_entity_by_guid(guid).await
    }

    pub async fn find_relationship_by_guid(
        &self,
        guid: Guid,
    ) -> Result<EnterpriseResult<Sourced<Relationship>>> {
        self.query.find_relationship_by_guid(guid).await
    }

    pub async fn search_entities(
        &self,
        criteria: &SearchCriteria,
    ) -> Result<EnterpriseResult<Vec<Sourced<EntityDetail>>>> {
        self.query.search_entities(criteria).await
    }

    // ========================================================================
    // Administration
    // ========================================================================

    /// Remove a member by administrator action; its reference copies are purged
    pub fn deregister_member(&self, id: &MetadataCollectionId) -> Result<CohortMember> {
        self.registry.deregister(id).ok_or_else(|| {
            CohortError::invalid_parameter("metadata_collection_id", "deregister_member", format!("{} is not a cohort member", id))
        })
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn emit<T: ReplicatedInstance>(&self, action: InstanceAction, instance: &T) {
        self.outbound.publish(T::wrap_event(InstanceEvent {
            origin: self.metadata_collection_id().clone(),
            action,
            instance: instance.clone(),
            timestamp: Utc::now(),
        }));
    }

    /// Fetch a locally homed instance; a reference copy is `InstanceNotOwned`
    async fn ensure_owned<T: ReplicatedInstance>(&self, guid: Guid) -> Result<T> {
        match T::fetch(self.repository.as_ref(), guid).await {
            Err(e) if e.is_not_found() => match T::copy_store(&self.copies).get(&guid) {
                Some(copy) => Err(CohortError::InstanceNotOwned {
                    guid,
                    home: copy.home().clone(),
                    caller: self.metadata_collection_id().clone(),
                }),
                None => Err(e),
            },
            result => result,
        }
    }

    /// A guid already held as a reference copy belongs to another home
    fn check_guid_free<T: ReplicatedInstance>(&self, guid: Guid) -> Result<()> {
        match T::copy_store(&self.copies).get(&guid) {
            Some(copy) => Err(CohortError::home_collection_conflict(
                guid,
                copy.home().clone(),
                self.metadata_collection_id().clone(),
            )),
            None => Ok(()),
        }
    }

    async fn entity_known(&self, guid: Guid) -> bool {
        self.repository.get_entity(guid).await.is_ok() || self.copies.get_entity(&guid).is_some()
    }
}

// ============================================================================
// Server instances
// ============================================================================

/// Running servers by server name
#[derive(Default)]
pub struct ServerInstances {
    servers: DashMap<String, Arc<FederationServer>>,
}

impl ServerInstances {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, server: Arc<FederationServer>) -> Result<()> {
        match self.servers.entry(server.server_name().to_string()) {
            Entry::Occupied(entry) => Err(CohortError::invalid_parameter(
                "server_name",
                "insert",
                format!("a server named {} is already active", entry.key()),
            )),
            Entry::Vacant(entry) => {
                entry.insert(server);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<FederationServer>> {
        self.servers.get(name).map(|server| server.value().clone())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<FederationServer>> {
        self.servers.remove(name).map(|(_, server)| server)
    }

    /// Server names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Shut down and forget every server
    pub async fn shutdown_all(&self) -> Result<()> {
        for name in self.names() {
            if let Some(server) = self.remove(&name) {
                server.shutdown().await?;
            }
        }
        Ok(())
    }
}
