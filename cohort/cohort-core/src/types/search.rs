//! Entity search criteria.

use crate::types::instance::{EntityDetail, InstanceStatus};
use crate::types::properties::{InstanceProperties, PropertyValue};
use serde::{Deserialize, Serialize};

/// How string property values are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringMatch {
    #[default]
    Exact,
    /// Case-insensitive substring match
    Contains,
}

/// Whether all or any of the property conditions must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    All,
    Any,
}

/// Criteria for `find_entities_by_property` and enterprise searches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchCriteria {
    /// Restrict to instances of this type name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub properties: InstanceProperties,
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default)]
    pub string_match: StringMatch,
    /// Soft-deleted instances are skipped unless set
    #[serde(default)]
    pub include_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl SearchCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_type(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.set(name, value);
        self
    }

    pub fn contains(mut self) -> Self {
        self.string_match = StringMatch::Contains;
        self
    }

    pub fn any(mut self) -> Self {
        self.match_mode = MatchMode::Any;
        self
    }

    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check an entity against these criteria
    pub fn matches(&self, entity: &EntityDetail) -> bool {
        match entity.header.status {
            InstanceStatus::Purged => return false,
            InstanceStatus::Deleted if !self.include_deleted => return false,
            _ => {}
        }
        if let Some(type_name) = &self.type_name {
            if &entity.header.instance_type.type_def_name != type_name {
                return false;
            }
        }
        if self.properties.is_empty() {
            return true;
        }
        let mut results = self
            .properties
            .iter()
            .map(|(name, wanted)| {
                entity
                    .properties
                    .get(name)
                    .is_some_and(|actual| self.value_matches(wanted, actual))
            });
        match self.match_mode {
            MatchMode::All => results.all(|m| m),
            MatchMode::Any => results.any(|m| m),
        }
    }

    fn value_matches(&self, wanted: &PropertyValue, actual: &PropertyValue) -> bool {
        match (self.string_match, wanted, actual) {
            (StringMatch::Contains, PropertyValue::String(w), PropertyValue::String(a)) => {
                a.to_lowercase().contains(&w.to_lowercase())
            }
            _ => wanted == actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::typedef::{TypeDef, TypeDefCategory};

    fn entity(name: &str) -> EntityDetail {
        let def = TypeDef::new("Table", TypeDefCategory::Entity);
        EntityDetail::new(&def, "repo-a".into())
            .with_properties(InstanceProperties::new().with_string("name", name).with_int("rows", 5))
    }

    #[test]
    fn test_exact_match() {
        let criteria = SearchCriteria::new()
            .with_property("name", PropertyValue::String("orders".into()));
        assert!(criteria.matches(&entity("orders")));
        assert!(!criteria.matches(&entity("orders_archive")));
    }

    #[test]
    fn test_contains_match() {
        let criteria = SearchCriteria::new()
            .with_property("name", PropertyValue::String("ORDER".into()))
            .contains();
        assert!(criteria.matches(&entity("orders_archive")));
    }

    #[test]
    fn test_any_mode() {
        let criteria = SearchCriteria::new()
            .with_property("name", PropertyValue::String("nope".into()))
            .with_property("rows", PropertyValue::Int(5))
            .any();
        assert!(criteria.matches(&entity("orders")));
    }

    #[test]
    fn test_deleted_excluded_by_default() {
        let mut e = entity("orders");
        e.header.status = InstanceStatus::Deleted;
        assert!(!SearchCriteria::new().matches(&e));
        assert!(SearchCriteria::new().including_deleted().matches(&e));
    }

    #[test]
    fn test_type_filter() {
        assert!(SearchCriteria::new().of_type("Table").matches(&entity("orders")));
        assert!(!SearchCriteria::new().of_type("Column").matches(&entity("orders")));
    }
}
