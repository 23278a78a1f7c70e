//! Interfaces between the federation engine and its collaborators.

use crate::audit::AuditReport;
use crate::error::Result;
use crate::event::ReplicationEvent;
use crate::id::{Guid, MetadataCollectionId};
use crate::types::*;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Repository connector: the local repository and every remote member expose
/// this shape.
///
/// Mutations take the version the caller last read and fail with
/// `VersionMismatch` if the stored instance moved on.
#[async_trait]
pub trait MetadataCollection: Send + Sync {
    /// Id of the metadata collection served by this connector
    fn metadata_collection_id(&self) -> &MetadataCollectionId;

    /// Get a type definition by guid
    async fn get_type_def(&self, guid: Guid) -> Result<TypeDef>;

    /// Get a type definition by name
    async fn find_type_def_by_name(&self, name: &str) -> Result<TypeDef>;

    /// Store a type definition, replacing an older version
    async fn add_type_def(&self, type_def: TypeDef) -> Result<TypeDef>;

    /// List all stored type definitions
    async fn list_type_defs(&self) -> Result<Vec<TypeDef>>;

    /// Create an entity homed in this collection
    async fn create_entity(&self, entity: EntityDetail) -> Result<EntityDetail>;

    /// Get an entity by guid
    async fn get_entity(&self, guid: Guid) -> Result<EntityDetail>;

    /// Replace the properties of an active entity
    async fn update_entity(
        &self,
        guid: Guid,
        expected_version: u64,
        properties: InstanceProperties,
    ) -> Result<EntityDetail>;

    /// Attach or replace a classification
    async fn classify_entity(
        &self,
        guid: Guid,
        expected_version: u64,
        classification: Classification,
    ) -> Result<EntityDetail>;

    /// Remove a classification by name
    async fn declassify_entity(
        &self,
        guid: Guid,
        expected_version: u64,
        classification_name: &str,
    ) -> Result<EntityDetail>;

    /// Soft-delete an entity
    async fn delete_entity(&self, guid: Guid, expected_version: u64) -> Result<EntityDetail>;

    /// Restore a soft-deleted entity
    async fn restore_entity(&self, guid: Guid) -> Result<EntityDetail>;

    /// Permanently remove a soft-deleted entity, returning its final state
    async fn purge_entity(&self, guid: Guid) -> Result<EntityDetail>;

    /// Create a relationship homed in this collection
    async fn create_relationship(&self, relationship: Relationship) -> Result<Relationship>;

    /// Get a relationship by guid
    async fn get_relationship(&self, guid: Guid) -> Result<Relationship>;

    /// Replace the properties of an active relationship
    async fn update_relationship(
        &self,
        guid: Guid,
        expected_version: u64,
        properties: InstanceProperties,
    ) -> Result<Relationship>;

    /// Soft-delete a relationship
    async fn delete_relationship(&self, guid: Guid, expected_version: u64) -> Result<Relationship>;

    /// Restore a soft-deleted relationship
    async fn restore_relationship(&self, guid: Guid) -> Result<Relationship>;

    /// Permanently remove a soft-deleted relationship, returning its final state
    async fn purge_relationship(&self, guid: Guid) -> Result<Relationship>;

    /// Search entities held by this collection
    async fn find_entities_by_property(&self, criteria: &SearchCriteria) -> Result<Vec<EntityDetail>>;
}

/// Publish/subscribe channel shared by a cohort.
///
/// Publication is fire-and-forget; subscribers receive every event at least
/// once, in publication order per publisher.
#[async_trait]
pub trait EventTopic: Send + Sync {
    /// Topic name, usually the cohort name
    fn name(&self) -> &str;

    /// Publish an event to all subscribers
    async fn publish(&self, event: ReplicationEvent) -> Result<()>;

    /// Open a new subscription
    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<ReplicationEvent>>;
}

/// Resolves a member's advertised connection into a connector.
pub trait ConnectorResolver: Send + Sync {
    fn resolve(&self, member: &CohortMember) -> Result<Arc<dyn MetadataCollection>>;
}

/// Administrative notification sink.
pub trait AuditSink: Send + Sync {
    fn report(&self, report: AuditReport);
}
