//! Entities, relationships and their lifecycle headers.

use crate::id::{Guid, MetadataCollectionId};
use crate::types::properties::InstanceProperties;
use crate::types::typedef::{TypeDef, TypeDefCategory};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Active,
    /// Soft-deleted; retained until purged
    Deleted,
    /// Removed permanently; only ever seen on the final replication event
    Purged,
}

/// Type reference carried by every instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceType {
    pub type_def_guid: Guid,
    pub type_def_name: String,
    pub category: TypeDefCategory,
    pub type_def_version: u64,
}

impl From<&TypeDef> for InstanceType {
    fn from(def: &TypeDef) -> Self {
        Self {
            type_def_guid: def.guid,
            type_def_name: def.name.clone(),
            category: def.category,
            type_def_version: def.version,
        }
    }
}

/// Identity and lifecycle metadata shared by entities and relationships.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHeader {
    pub guid: Guid,
    pub instance_type: InstanceType,
    /// Monotonic per-instance counter, advanced only by the home collection
    pub version: u64,
    pub status: InstanceStatus,
    /// Metadata collection that owns the instance
    pub home: MetadataCollectionId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When this copy was last received through replication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicated_at: Option<DateTime<Utc>>,
}

impl InstanceHeader {
    pub fn new(instance_type: InstanceType, home: MetadataCollectionId) -> Self {
        let now = Utc::now();
        Self {
            guid: Guid::new(),
            instance_type,
            version: 1,
            status: InstanceStatus::Active,
            home,
            created_at: now,
            updated_at: now,
            replicated_at: None,
        }
    }

    pub fn is_homed_in(&self, collection: &MetadataCollectionId) -> bool {
        &self.home == collection
    }

    /// Record a mutation by the home collection
    pub fn advance(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

/// A classification attached to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub name: String,
    #[serde(default)]
    pub properties: InstanceProperties,
}

impl Classification {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: InstanceProperties::new(),
        }
    }
}

/// An entity with its properties and classifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDetail {
    pub header: InstanceHeader,
    #[serde(default)]
    pub properties: InstanceProperties,
    #[serde(default)]
    pub classifications: Vec<Classification>,
}

impl EntityDetail {
    /// Build a new entity of `type_def` homed in `home`
    pub fn new(type_def: &TypeDef, home: MetadataCollectionId) -> Self {
        Self {
            header: InstanceHeader::new(InstanceType::from(type_def), home),
            properties: InstanceProperties::new(),
            classifications: Vec::new(),
        }
    }

    pub fn with_guid(mut self, guid: Guid) -> Self {
        self.header.guid = guid;
        self
    }

    pub fn with_properties(mut self, properties: InstanceProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_classification(mut self, classification: Classification) -> Self {
        self.classifications.push(classification);
        self
    }
}

/// A relationship between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub header: InstanceHeader,
    #[serde(default)]
    pub properties: InstanceProperties,
    pub end_one: Guid,
    pub end_two: Guid,
}

impl Relationship {
    pub fn new(type_def: &TypeDef, home: MetadataCollectionId, end_one: Guid, end_two: Guid) -> Self {
        Self {
            header: InstanceHeader::new(InstanceType::from(type_def), home),
            properties: InstanceProperties::new(),
            end_one,
            end_two,
        }
    }

    pub fn with_guid(mut self, guid: Guid) -> Self {
        self.header.guid = guid;
        self
    }

    pub fn with_properties(mut self, properties: InstanceProperties) -> Self {
        self.properties = properties;
        self
    }
}

// ============================================================================
// Common instance behaviour
// ============================================================================

/// Behaviour shared by entities and relationships.
pub trait Instance: Clone + Send + Sync + 'static {
    /// Category the instance's type must have
    const CATEGORY: TypeDefCategory;

    fn header(&self) -> &InstanceHeader;

    fn header_mut(&mut self) -> &mut InstanceHeader;

    fn properties(&self) -> &InstanceProperties;

    fn properties_mut(&mut self) -> &mut InstanceProperties;

    /// Content that participates in the fingerprint besides the properties
    fn extra_content(&self) -> serde_json::Value;

    fn guid(&self) -> Guid {
        self.header().guid
    }

    fn version(&self) -> u64 {
        self.header().version
    }

    fn home(&self) -> &MetadataCollectionId {
        &self.header().home
    }

    /// blake3 digest of the type, status and content of this instance.
    ///
    /// Two copies of the same guid and version must carry equal fingerprints;
    /// a difference means the copies diverged.
    fn fingerprint(&self) -> String {
        let header = self.header();
        let content = serde_json::json!({
            "type": header.instance_type.type_def_guid,
            "status": header.status,
            "properties": self.properties(),
            "extra": self.extra_content(),
        });
        let bytes = serde_json::to_vec(&content).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }
}

impl Instance for EntityDetail {
    const CATEGORY: TypeDefCategory = TypeDefCategory::Entity;

    fn header(&self) -> &InstanceHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut InstanceHeader {
        &mut self.header
    }

    fn properties(&self) -> &InstanceProperties {
        &self.properties
    }

    fn properties_mut(&mut self) -> &mut InstanceProperties {
        &mut self.properties
    }

    fn extra_content(&self) -> serde_json::Value {
        serde_json::to_value(&self.classifications).unwrap_or_default()
    }
}

impl Instance for Relationship {
    const CATEGORY: TypeDefCategory = TypeDefCategory::Relationship;

    fn header(&self) -> &InstanceHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut InstanceHeader {
        &mut self.header
    }

    fn properties(&self) -> &InstanceProperties {
        &self.properties
    }

    fn properties_mut(&mut self) -> &mut InstanceProperties {
        &mut self.properties
    }

    fn extra_content(&self) -> serde_json::Value {
        serde_json::json!([self.end_one, self.end_two])
    }
}
