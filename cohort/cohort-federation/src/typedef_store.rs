//! TypeDef Store: the validating cache of active type definitions.
//!
//! # Features
//!
//! - Name and guid indexes under one reader/writer lock
//! - Compatibility checks for replacements and patches
//! - Supertype resolution and inherited property sets
//! - Instance property validation against declared types
//! - Every conflict is reported to the audit sink before it is returned

use cohort_core::audit::AuditReport;
use cohort_core::error::{CohortError, Result};
use cohort_core::id::{Guid, MetadataCollectionId};
use cohort_core::traits::AuditSink;
use cohort_core::types::*;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// What happened to a definition offered to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeDefApplied {
    /// First definition under this guid and name
    Added,
    /// A newer compatible version replaced the stored one
    Replaced,
    /// The stored definition is the same or newer
    Duplicate,
}

#[derive(Default)]
struct TypeDefIndex {
    by_guid: HashMap<Guid, TypeDef>,
    by_name: HashMap<String, Guid>,
}

impl TypeDefIndex {
    fn insert(&mut self, def: TypeDef) {
        self.by_name.insert(def.name.clone(), def.guid);
        self.by_guid.insert(def.guid, def);
    }

    fn by_name(&self, name: &str) -> Option<&TypeDef> {
        self.by_name.get(name).and_then(|guid| self.by_guid.get(guid))
    }

    /// Declared plus inherited properties, nearest declaration first
    fn effective_properties(&self, def: &TypeDef) -> Vec<PropertyDef> {
        let mut properties = Vec::new();
        let mut seen_names = HashSet::new();
        let mut visited = HashSet::new();
        let mut pending = vec![def.clone()];

        while let Some(current) = pending.pop() {
            if !visited.insert(current.guid) {
                continue;
            }
            for property in &current.properties {
                if seen_names.insert(property.name.clone()) {
                    properties.push(property.clone());
                }
            }
            for link in current.supertypes.iter().rev() {
                if let Some(supertype) = self.by_guid.get(&link.guid) {
                    pending.push(supertype.clone());
                }
            }
        }
        properties
    }
}

/// Process-scoped store of active type definitions
pub struct TypeDefStore {
    local_id: MetadataCollectionId,
    index: RwLock<TypeDefIndex>,
    audit: Arc<dyn AuditSink>,
}

impl TypeDefStore {
    pub fn new(local_id: MetadataCollectionId, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            local_id,
            index: RwLock::new(TypeDefIndex::default()),
            audit,
        }
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    pub fn get_type_def(&self, guid: Guid) -> Result<TypeDef> {
        self.index
            .read()
            .by_guid
            .get(&guid)
            .cloned()
            .ok_or_else(|| CohortError::type_def_not_known(guid.to_string()))
    }

    pub fn find_type_def_by_name(&self, name: &str) -> Result<TypeDef> {
        self.index
            .read()
            .by_name(name)
            .cloned()
            .ok_or_else(|| CohortError::type_def_not_known(name))
    }

    /// All definitions, ordered by name
    pub fn list(&self) -> Vec<TypeDef> {
        let mut defs: Vec<TypeDef> = self.index.read().by_guid.values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.index.read().by_guid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().by_guid.is_empty()
    }

    /// Properties declared by `def` and its supertypes
    pub fn effective_properties(&self, def: &TypeDef) -> Vec<PropertyDef> {
        self.index.read().effective_properties(def)
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Add a definition from a local request.
    ///
    /// Fails with `TypeDefConflict` when a definition with the same name exists
    /// with incompatible properties or an equal-or-lower version.
    pub fn add_type_def(&self, def: TypeDef) -> Result<TypeDefApplied> {
        let mut index = self.index.write();
        Self::check_structure(&index, &def, true)?;

        if let Some(stored) = Self::stored_for(&index, &def) {
            if stored == def {
                return Ok(TypeDefApplied::Duplicate);
            }
            if let Err(reason) = stored.check_replacement(&def) {
                return Err(self.conflict(&def, None, reason));
            }
            info!(type_def = %def.name, version = def.version, "Replaced type definition");
            index.insert(def);
            return Ok(TypeDefApplied::Replaced);
        }

        info!(type_def = %def.name, version = def.version, "Added type definition");
        index.insert(def);
        Ok(TypeDefApplied::Added)
    }

    /// Apply a patch; fails with `TypeDefNotKnown` when the target is absent
    /// and `TypeDefConflict` when the patch does not strictly extend it
    pub fn patch_type_def(&self, patch: &TypeDefPatch) -> Result<TypeDef> {
        let mut index = self.index.write();
        let current = index
            .by_guid
            .get(&patch.type_def_guid)
            .cloned()
            .ok_or_else(|| CohortError::type_def_not_known(patch.type_def_guid.to_string()))?;

        let patched = match patch.apply_to(&current) {
            Ok(patched) => patched,
            Err(reason) => return Err(self.conflict(&current, None, reason)),
        };
        if let Err(e) = Self::check_structure(&index, &patched, true) {
            if e.is_conflict() {
                self.report_conflict(&patched, None, e.to_string());
            }
            return Err(e);
        }

        info!(type_def = %patched.name, version = patched.version, "Patched type definition");
        index.insert(patched.clone());
        Ok(patched)
    }

    /// Apply a definition received from another member.
    ///
    /// Older versions are discarded as already applied. A different definition
    /// at the stored version, or an incompatible newer one, is a conflict.
    pub fn apply_remote(&self, def: TypeDef, origin: &MetadataCollectionId) -> Result<TypeDefApplied> {
        let mut index = self.index.write();

        if let Err(e) = Self::check_structure(&index, &def, false) {
            if e.is_conflict() {
                self.report_conflict(&def, Some(origin), e.to_string());
            }
            return Err(e);
        }

        let Some(stored) = Self::stored_for(&index, &def) else {
            debug!(type_def = %def.name, origin = %origin, "Adopted remote type definition");
            index.insert(def);
            return Ok(TypeDefApplied::Added);
        };

        if stored.guid == def.guid && stored.name == def.name {
            if def.version < stored.version {
                return Ok(TypeDefApplied::Duplicate);
            }
            if def.version == stored.version {
                if stored == def {
                    return Ok(TypeDefApplied::Duplicate);
                }
                return Err(self.conflict(
                    &def,
                    Some(origin),
                    format!("diverging content at version {}", def.version),
                ));
            }
        }

        if let Err(reason) = stored.check_replacement(&def) {
            return Err(self.conflict(&def, Some(origin), reason));
        }

        debug!(type_def = %def.name, version = def.version, origin = %origin, "Replaced type definition from remote");
        index.insert(def);
        Ok(TypeDefApplied::Replaced)
    }

    /// Drop every cached definition
    pub fn clear(&self) {
        let mut index = self.index.write();
        index.by_guid.clear();
        index.by_name.clear();
    }

    // ========================================================================
    // Instance validation
    // ========================================================================

    /// Resolve the active definition for a new instance of `type_name`
    pub fn resolve_instance_type(
        &self,
        type_name: &str,
        category: TypeDefCategory,
        operation: &str,
    ) -> Result<TypeDef> {
        let def = self.find_type_def_by_name(type_name)?;
        if def.category != category {
            return Err(CohortError::invalid_parameter(
                "type_name",
                operation,
                format!("{} is a {} type, expected {}", type_name, def.category, category),
            ));
        }
        Ok(def)
    }

    /// Check instance properties against `def` and its supertypes
    pub fn validate_properties(
        &self,
        def: &TypeDef,
        properties: &InstanceProperties,
        operation: &str,
    ) -> Result<()> {
        let index = self.index.read();
        let declared = index.effective_properties(def);

        for (name, value) in properties.iter() {
            let Some(property) = declared.iter().find(|p| &p.name == name) else {
                return Err(CohortError::invalid_parameter(
                    name,
                    operation,
                    format!("property is not declared by type {}", def.name),
                ));
            };
            if !value.conforms_to(&property.property_type) {
                return Err(CohortError::invalid_parameter(
                    name,
                    operation,
                    format!(
                        "expected {} value, found {}",
                        property.property_type,
                        value.type_name()
                    ),
                ));
            }
            if let (PropertyType::Enum(enum_name), PropertyValue::Enum(element)) =
                (&property.property_type, value)
            {
                let valid = index
                    .by_name(enum_name)
                    .is_some_and(|e| e.valid_values.iter().any(|v| v == element));
                if !valid {
                    return Err(CohortError::invalid_parameter(
                        name,
                        operation,
                        format!("'{}' is not a valid value of {}", element, enum_name),
                    ));
                }
            }
        }

        if let Some(missing) = declared
            .iter()
            .find(|p| p.cardinality == Cardinality::Required && !properties.contains(&p.name))
        {
            return Err(CohortError::invalid_parameter(
                &missing.name,
                operation,
                format!("required by type {}", def.name),
            ));
        }
        Ok(())
    }

    /// Check a classification against its definition
    pub fn validate_classification(&self, classification: &Classification, operation: &str) -> Result<()> {
        let def = self.resolve_instance_type(
            &classification.name,
            TypeDefCategory::Classification,
            operation,
        )?;
        self.validate_properties(&def, &classification.properties, operation)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Stored definition sharing the incoming name or guid
    fn stored_for(index: &TypeDefIndex, def: &TypeDef) -> Option<TypeDef> {
        index
            .by_name(&def.name)
            .or_else(|| index.by_guid.get(&def.guid))
            .cloned()
    }

    /// Structural checks independent of any stored version
    fn check_structure(index: &TypeDefIndex, def: &TypeDef, require_supertypes: bool) -> Result<()> {
        if def.name.trim().is_empty() {
            return Err(CohortError::invalid_parameter("name", "add_type_def", "name must not be empty"));
        }
        if def.version == 0 {
            return Err(CohortError::invalid_parameter("version", "add_type_def", "versions start at 1"));
        }
        if let Some(duplicate) = def.duplicate_property() {
            return Err(CohortError::invalid_parameter(
                "properties",
                "add_type_def",
                format!("property '{}' declared twice", duplicate),
            ));
        }

        for link in &def.supertypes {
            if link.guid == def.guid {
                return Err(CohortError::invalid_parameter(
                    "supertypes",
                    "add_type_def",
                    format!("{} cannot be its own supertype", def.name),
                ));
            }
            let Some(supertype) = index.by_guid.get(&link.guid) else {
                if require_supertypes {
                    return Err(CohortError::type_def_not_known(&link.name));
                }
                continue;
            };
            if supertype.category != def.category {
                return Err(CohortError::invalid_parameter(
                    "supertypes",
                    "add_type_def",
                    format!(
                        "{} supertype {} cannot extend a {} type",
                        supertype.category, supertype.name, def.category
                    ),
                ));
            }
            for inherited in index.effective_properties(supertype) {
                if let Some(own) = def.property(&inherited.name) {
                    if own.property_type != inherited.property_type {
                        return Err(CohortError::type_def_conflict(
                            &def.name,
                            format!(
                                "property '{}' redeclared as {} but supertype {} declares {}",
                                own.name, own.property_type, supertype.name, inherited.property_type
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn conflict(&self, def: &TypeDef, origin: Option<&MetadataCollectionId>, reason: String) -> CohortError {
        self.report_conflict(def, origin, reason.clone());
        CohortError::type_def_conflict(&def.name, reason)
    }

    fn report_conflict(&self, def: &TypeDef, origin: Option<&MetadataCollectionId>, reason: String) {
        self.audit.report(AuditReport::TypeDefConflict {
            type_name: def.name.clone(),
            type_def_guid: def.guid,
            origin: origin.filter(|o| **o != self.local_id).cloned(),
            reason,
        });
    }
}
