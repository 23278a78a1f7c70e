//! Type definitions: versioned schemas for entities, relationships,
//! classifications and enumerations.

use crate::id::Guid;
use serde::{Deserialize, Serialize};

/// Category of a type definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeDefCategory {
    Classification,
    Entity,
    Relationship,
    Enum,
}

impl TypeDefCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Classification => "classification",
            Self::Entity => "entity",
            Self::Relationship => "relationship",
            Self::Enum => "enum",
        }
    }
}

impl std::fmt::Display for TypeDefCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primitive and collection types a property may take.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "of")]
pub enum PropertyType {
    String,
    Int,
    Float,
    Boolean,
    Date,
    StringArray,
    StringMap,
    Map,
    /// Value drawn from the valid values of the named enum type definition
    Enum(String),
}

impl std::fmt::Display for PropertyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enum(name) => write!(f, "enum<{}>", name),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Whether a property must be supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    #[default]
    Optional,
    Required,
}

/// A single property declared by a type definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDef {
    pub name: String,
    pub property_type: PropertyType,
    #[serde(default)]
    pub cardinality: Cardinality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PropertyDef {
    pub fn new(name: impl Into<String>, property_type: PropertyType) -> Self {
        Self {
            name: name.into(),
            property_type,
            cardinality: Cardinality::Optional,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.cardinality = Cardinality::Required;
        self
    }
}

/// Reference from one type definition to another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeDefLink {
    pub guid: Guid,
    pub name: String,
}

/// A versioned type definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
    pub guid: Guid,
    pub name: String,
    pub version: u64,
    pub category: TypeDefCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: Vec<PropertyDef>,
    #[serde(default)]
    pub supertypes: Vec<TypeDefLink>,
    /// Element names of an enum type definition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub valid_values: Vec<String>,
}

impl TypeDef {
    /// Create version 1 of a new type definition with a fresh guid
    pub fn new(name: impl Into<String>, category: TypeDefCategory) -> Self {
        Self {
            guid: Guid::new(),
            name: name.into(),
            version: 1,
            category,
            description: None,
            properties: Vec::new(),
            supertypes: Vec::new(),
            valid_values: Vec::new(),
        }
    }

    pub fn with_guid(mut self, guid: Guid) -> Self {
        self.guid = guid;
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_property(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    pub fn with_supertype(mut self, supertype: &TypeDef) -> Self {
        self.supertypes.push(supertype.link());
        self
    }

    pub fn with_valid_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.valid_values = values.into_iter().map(Into::into).collect();
        self
    }

    /// Link usable as a supertype or instance type reference
    pub fn link(&self) -> TypeDefLink {
        TypeDefLink {
            guid: self.guid,
            name: self.name.clone(),
        }
    }

    /// Look up a property declared directly on this type
    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Name of the first property declared more than once, if any
    pub fn duplicate_property(&self) -> Option<&str> {
        let mut seen = std::collections::HashSet::new();
        self.properties
            .iter()
            .find(|p| !seen.insert(p.name.as_str()))
            .map(|p| p.name.as_str())
    }

    /// Check that `incoming` may replace `self`.
    ///
    /// Compatible iff same guid, same category, and the incoming property list
    /// is a superset of the stored one with unchanged types for shared
    /// properties. Returns the reason on incompatibility.
    pub fn check_replacement(&self, incoming: &TypeDef) -> std::result::Result<(), String> {
        if incoming.guid != self.guid {
            return Err(format!(
                "name '{}' is already bound to guid {}, not {}",
                self.name, self.guid, incoming.guid
            ));
        }
        if incoming.name != self.name {
            return Err(format!(
                "guid {} is already named '{}', cannot rename to '{}'",
                self.guid, self.name, incoming.name
            ));
        }
        if incoming.category != self.category {
            return Err(format!(
                "category changed from {} to {}",
                self.category, incoming.category
            ));
        }
        if incoming.version <= self.version {
            return Err(format!(
                "version {} does not supersede stored version {}",
                incoming.version, self.version
            ));
        }
        for stored in &self.properties {
            match incoming.property(&stored.name) {
                None => return Err(format!("property '{}' removed", stored.name)),
                Some(p) if p.property_type != stored.property_type => {
                    return Err(format!(
                        "property '{}' changed type from {} to {}",
                        stored.name, stored.property_type, p.property_type
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// An incremental change to an existing type definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDefPatch {
    pub type_def_guid: Guid,
    /// Version the patch was written against
    pub applies_to_version: u64,
    pub new_version: u64,
    #[serde(default)]
    pub add_properties: Vec<PropertyDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TypeDefPatch {
    pub fn new(target: &TypeDef) -> Self {
        Self {
            type_def_guid: target.guid,
            applies_to_version: target.version,
            new_version: target.version + 1,
            add_properties: Vec::new(),
            description: None,
        }
    }

    pub fn add_property(mut self, property: PropertyDef) -> Self {
        self.add_properties.push(property);
        self
    }

    /// Produce the patched definition, or the reason the patch does not
    /// strictly extend `current`.
    pub fn apply_to(&self, current: &TypeDef) -> std::result::Result<TypeDef, String> {
        if self.applies_to_version != current.version {
            return Err(format!(
                "patch written against version {} but stored version is {}",
                self.applies_to_version, current.version
            ));
        }
        if self.new_version <= current.version {
            return Err(format!(
                "new version {} does not supersede {}",
                self.new_version, current.version
            ));
        }
        if self.add_properties.is_empty() {
            return Err("patch adds no properties".to_string());
        }
        let mut patched = current.clone();
        for property in &self.add_properties {
            if patched.property(&property.name).is_some() {
                return Err(format!("property '{}' already exists", property.name));
            }
            patched.properties.push(property.clone());
        }
        if let Some(description) = &self.description {
            patched.description = Some(description.clone());
        }
        patched.version = self.new_version;
        Ok(patched)
    }
}
