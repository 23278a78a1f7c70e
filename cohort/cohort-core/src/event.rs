//! Replication events exchanged between cohort members.
//!
//! Every event carries the metadata collection id of its origin and a logical
//! version used for ordering and idempotent re-application:
//!
//! - Registration events are versioned by their registration timestamp
//! - TypeDef events by the type definition version
//! - Instance events by the instance version

use crate::id::{Guid, MetadataCollectionId};
use crate::types::{CohortMember, EntityDetail, Instance, Relationship, TypeDef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a registration event announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationAction {
    /// A member joins the cohort and asks the others to introduce themselves
    Register,
    /// Reply to a `Register`; never answered
    ReRegister,
    /// A member leaves the cohort
    Unregister,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationEvent {
    pub origin: MetadataCollectionId,
    pub action: RegistrationAction,
    pub member: CohortMember,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeDefAction {
    Added,
    Patched,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDefEvent {
    pub origin: MetadataCollectionId,
    pub action: TypeDefAction,
    pub type_def: TypeDef,
    pub timestamp: DateTime<Utc>,
}

/// Mutation that produced an instance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceAction {
    Created,
    Updated,
    Deleted,
    Restored,
    Purged,
}

/// Instance event payload carrying the post-mutation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceEvent<T> {
    pub origin: MetadataCollectionId,
    pub action: InstanceAction,
    pub instance: T,
    pub timestamp: DateTime<Utc>,
}

pub type EntityEvent = InstanceEvent<EntityDetail>;
pub type RelationshipEvent = InstanceEvent<Relationship>;

/// A replication event: one case per payload kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplicationEvent {
    Registration(RegistrationEvent),
    TypeDef(TypeDefEvent),
    InstanceEntity(EntityEvent),
    InstanceRelationship(RelationshipEvent),
}

/// Subject that orders a stream of events: events sharing a key must be
/// processed one at a time, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PartitionKey {
    Member(MetadataCollectionId),
    TypeDef(MetadataCollectionId, Guid),
    Instance(MetadataCollectionId, Guid),
}

impl ReplicationEvent {
    pub fn registration(
        origin: MetadataCollectionId,
        action: RegistrationAction,
        member: CohortMember,
    ) -> Self {
        Self::Registration(RegistrationEvent {
            origin,
            action,
            member,
            timestamp: Utc::now(),
        })
    }

    pub fn type_def(origin: MetadataCollectionId, action: TypeDefAction, type_def: TypeDef) -> Self {
        Self::TypeDef(TypeDefEvent {
            origin,
            action,
            type_def,
            timestamp: Utc::now(),
        })
    }

    pub fn entity(origin: MetadataCollectionId, action: InstanceAction, entity: EntityDetail) -> Self {
        Self::InstanceEntity(InstanceEvent {
            origin,
            action,
            instance: entity,
            timestamp: Utc::now(),
        })
    }

    pub fn relationship(
        origin: MetadataCollectionId,
        action: InstanceAction,
        relationship: Relationship,
    ) -> Self {
        Self::InstanceRelationship(InstanceEvent {
            origin,
            action,
            instance: relationship,
            timestamp: Utc::now(),
        })
    }

    /// Metadata collection that published the event
    pub fn origin(&self) -> &MetadataCollectionId {
        match self {
            Self::Registration(e) => &e.origin,
            Self::TypeDef(e) => &e.origin,
            Self::InstanceEntity(e) => &e.origin,
            Self::InstanceRelationship(e) => &e.origin,
        }
    }

    /// Logical version used for ordering and duplicate detection
    pub fn version(&self) -> u64 {
        match self {
            Self::Registration(e) => e.timestamp.timestamp_millis().max(0) as u64,
            Self::TypeDef(e) => e.type_def.version,
            Self::InstanceEntity(e) => e.instance.version(),
            Self::InstanceRelationship(e) => e.instance.version(),
        }
    }

    pub fn partition_key(&self) -> PartitionKey {
        match self {
            Self::Registration(e) => PartitionKey::Member(e.origin.clone()),
            Self::TypeDef(e) => PartitionKey::TypeDef(e.origin.clone(), e.type_def.guid),
            Self::InstanceEntity(e) => PartitionKey::Instance(e.origin.clone(), e.instance.guid()),
            Self::InstanceRelationship(e) => {
                PartitionKey::Instance(e.origin.clone(), e.instance.guid())
            }
        }
    }

    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Registration(_) => "registration",
            Self::TypeDef(_) => "type_def",
            Self::InstanceEntity(_) => "entity",
            Self::InstanceRelationship(_) => "relationship",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConnectionDescriptor, TypeDefCategory};

    #[test]
    fn test_entity_event_identity() {
        let def = TypeDef::new("Asset", TypeDefCategory::Entity);
        let entity = EntityDetail::new(&def, "repo-a".into()).with_guid(Guid::from_u128(42));
        let event = ReplicationEvent::entity("repo-a".into(), InstanceAction::Created, entity);

        assert_eq!(event.origin().as_str(), "repo-a");
        assert_eq!(event.version(), 1);
        assert_eq!(event.kind(), "entity");
        assert_eq!(
            event.partition_key(),
            PartitionKey::Instance("repo-a".into(), Guid::from_u128(42))
        );
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let member = CohortMember::new("repo-a".into(), "server-a", ConnectionDescriptor::in_process("repo-a"));
        let event = ReplicationEvent::registration("repo-a".into(), RegistrationAction::Register, member);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "registration");
        let back: ReplicationEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
