//! In-memory local repository.
//!
//! Holds the instances homed in one metadata collection plus the type
//! definitions it has adopted. Reference copies of remote instances live in the
//! federation layer, never here.

use crate::kv::VersionedStore;
use async_trait::async_trait;
use chrono::Utc;
use cohort_core::error::{CohortError, Result};
use cohort_core::id::{Guid, MetadataCollectionId};
use cohort_core::traits::MetadataCollection;
use cohort_core::types::*;
use tracing::debug;

/// Local repository backed by versioned in-memory stores
pub struct InMemoryRepository {
    metadata_collection_id: MetadataCollectionId,
    type_defs: VersionedStore<TypeDef>,
    entities: VersionedStore<EntityDetail>,
    relationships: VersionedStore<Relationship>,
}

impl InMemoryRepository {
    pub fn new(metadata_collection_id: MetadataCollectionId) -> Self {
        Self {
            metadata_collection_id,
            type_defs: VersionedStore::new("type_def", |guid| {
                CohortError::type_def_not_known(guid.to_string())
            }),
            entities: VersionedStore::new("entity", CohortError::entity_not_known),
            relationships: VersionedStore::new("relationship", CohortError::relationship_not_known),
        }
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    /// Stamp a new instance header with local ownership
    fn prepare_header(
        &self,
        header: &mut InstanceHeader,
        category: TypeDefCategory,
        operation: &str,
    ) -> Result<()> {
        if header.instance_type.category != category {
            return Err(CohortError::invalid_parameter(
                "instance_type",
                operation,
                format!(
                    "type {} is a {} type",
                    header.instance_type.type_def_name, header.instance_type.category
                ),
            ));
        }
        if header.guid.is_nil() {
            return Err(CohortError::invalid_parameter("guid", operation, "guid must not be nil"));
        }
        if header.home != self.metadata_collection_id {
            return Err(CohortError::InstanceNotOwned {
                guid: header.guid,
                home: header.home.clone(),
                caller: self.metadata_collection_id.clone(),
            });
        }

        let now = Utc::now();
        header.version = 1;
        header.status = InstanceStatus::Active;
        header.created_at = now;
        header.updated_at = now;
        header.replicated_at = None;
        Ok(())
    }
}

fn ensure_active(header: &InstanceHeader, operation: &str) -> Result<()> {
    match header.status {
        InstanceStatus::Active => Ok(()),
        status => Err(CohortError::invalid_parameter(
            "guid",
            operation,
            format!("instance {} is {:?}", header.guid, status),
        )),
    }
}

fn ensure_deleted(header: &InstanceHeader, operation: &str) -> Result<()> {
    match header.status {
        InstanceStatus::Deleted => Ok(()),
        status => Err(CohortError::invalid_parameter(
            "guid",
            operation,
            format!("instance {} is {:?}, not deleted", header.guid, status),
        )),
    }
}

fn restore(header: &mut InstanceHeader) -> Result<()> {
    ensure_deleted(header, "restore")?;
    header.status = InstanceStatus::Active;
    header.advance();
    Ok(())
}

fn soft_delete(header: &mut InstanceHeader) -> Result<()> {
    ensure_active(header, "delete")?;
    header.status = InstanceStatus::Deleted;
    header.advance();
    Ok(())
}

/// Final state of a purged instance
fn purged<T: Instance>(mut instance: T) -> T {
    let header = instance.header_mut();
    header.status = InstanceStatus::Purged;
    header.advance();
    instance
}

#[async_trait]
impl MetadataCollection for InMemoryRepository {
    fn metadata_collection_id(&self) -> &MetadataCollectionId {
        &self.metadata_collection_id
    }

    async fn get_type_def(&self, guid: Guid) -> Result<TypeDef> {
        self.type_defs.get(&guid)
    }

    async fn find_type_def_by_name(&self, name: &str) -> Result<TypeDef> {
        self.type_defs
            .values()
            .into_iter()
            .find(|def| def.name == name)
            .ok_or_else(|| CohortError::type_def_not_known(name))
    }

    async fn add_type_def(&self, type_def: TypeDef) -> Result<TypeDef> {
        if !self.type_defs.put_newer(type_def.clone()) {
            let stored = self.type_defs.get(&type_def.guid)?;
            return Err(CohortError::type_def_conflict(
                &type_def.name,
                format!(
                    "version {} does not replace stored version {}",
                    type_def.version, stored.version
                ),
            ));
        }
        debug!(type_def = %type_def.name, version = type_def.version, "Stored type definition");
        Ok(type_def)
    }

    async fn list_type_defs(&self) -> Result<Vec<TypeDef>> {
        let mut defs = self.type_defs.values();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs)
    }

    async fn create_entity(&self, mut entity: EntityDetail) -> Result<EntityDetail> {
        self.prepare_header(&mut entity.header, TypeDefCategory::Entity, "create_entity")?;
        self.entities.insert_new(entity.clone(), "create_entity")?;
        debug!(guid = %entity.header.guid, type_name = %entity.header.instance_type.type_def_name, "Created entity");
        Ok(entity)
    }

    async fn get_entity(&self, guid: Guid) -> Result<EntityDetail> {
        self.entities.get(&guid)
    }

    async fn update_entity(
        &self,
        guid: Guid,
        expected_version: u64,
        properties: InstanceProperties,
    ) -> Result<EntityDetail> {
        self.entities.update(guid, expected_version, |entity| {
            ensure_active(&entity.header, "update_entity")?;
            entity.properties = properties;
            entity.header.advance();
            Ok(())
        })
    }

    async fn classify_entity(
        &self,
        guid: Guid,
        expected_version: u64,
        classification: Classification,
    ) -> Result<EntityDetail> {
        self.entities.update(guid, expected_version, |entity| {
            ensure_active(&entity.header, "classify_entity")?;
            entity.classifications.retain(|c| c.name != classification.name);
            entity.classifications.push(classification);
            entity.header.advance();
            Ok(())
        })
    }

    async fn declassify_entity(
        &self,
        guid: Guid,
        expected_version: u64,
        classification_name: &str,
    ) -> Result<EntityDetail> {
        self.entities.update(guid, expected_version, |entity| {
            ensure_active(&entity.header, "declassify_entity")?;
            let before = entity.classifications.len();
            entity.classifications.retain(|c| c.name != classification_name);
            if entity.classifications.len() == before {
                return Err(CohortError::invalid_parameter(
                    "classification_name",
                    "declassify_entity",
                    format!("entity {} is not classified as {}", guid, classification_name),
                ));
            }
            entity.header.advance();
            Ok(())
        })
    }

    async fn delete_entity(&self, guid: Guid, expected_version: u64) -> Result<EntityDetail> {
        self.entities
            .update(guid, expected_version, |entity| soft_delete(&mut entity.header))
    }

    async fn restore_entity(&self, guid: Guid) -> Result<EntityDetail> {
        self.entities.modify(guid, |entity| restore(&mut entity.header))
    }

    async fn purge_entity(&self, guid: Guid) -> Result<EntityDetail> {
        let removed = self
            .entities
            .remove_checked(guid, |entity| ensure_deleted(&entity.header, "purge_entity"))?;
        debug!(guid = %guid, "Purged entity");
        Ok(purged(removed))
    }

    async fn create_relationship(&self, mut relationship: Relationship) -> Result<Relationship> {
        self.prepare_header(
            &mut relationship.header,
            TypeDefCategory::Relationship,
            "create_relationship",
        )?;
        if relationship.end_one.is_nil() || relationship.end_two.is_nil() {
            return Err(CohortError::invalid_parameter(
                "end",
                "create_relationship",
                "both relationship ends are required",
            ));
        }
        self.relationships
            .insert_new(relationship.clone(), "create_relationship")?;
        debug!(guid = %relationship.header.guid, "Created relationship");
        Ok(relationship)
    }

    async fn get_relationship(&self, guid: Guid) -> Result<Relationship> {
        self.relationships.get(&guid)
    }

    async fn update_relationship(
        &self,
        guid: Guid,
        expected_version: u64,
        properties: InstanceProperties,
    ) -> Result<Relationship> {
        self.relationships.update(guid, expected_version, |relationship| {
            ensure_active(&relationship.header, "update_relationship")?;
            relationship.properties = properties;
            relationship.header.advance();
            Ok(())
        })
    }

    async fn delete_relationship(&self, guid: Guid, expected_version: u64) -> Result<Relationship> {
        self.relationships
            .update(guid, expected_version, |relationship| {
                soft_delete(&mut relationship.header)
            })
    }

    async fn restore_relationship(&self, guid: Guid) -> Result<Relationship> {
        self.relationships
            .modify(guid, |relationship| restore(&mut relationship.header))
    }

    async fn purge_relationship(&self, guid: Guid) -> Result<Relationship> {
        let removed = self.relationships.remove_checked(guid, |relationship| {
            ensure_deleted(&relationship.header, "purge_relationship")
        })?;
        debug!(guid = %guid, "Purged relationship");
        Ok(purged(removed))
    }

    async fn find_entities_by_property(&self, criteria: &SearchCriteria) -> Result<Vec<EntityDetail>> {
        let mut matches: Vec<EntityDetail> = self
            .entities
            .values()
            .into_iter()
            .filter(|entity| criteria.matches(entity))
            .collect();
        matches.sort_by(|a, b| {
            a.header
                .created_at
                .cmp(&b.header.created_at)
                .then(a.header.guid.cmp(&b.header.guid))
        });
        if let Some(limit) = criteria.limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }
}
