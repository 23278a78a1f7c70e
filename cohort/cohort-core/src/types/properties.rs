//! Instance property values and typed accessors.
//!
//! Accessors follow one rule: an absent property yields `None` (or the type's
//! zero value for `int`/`bool`), while a present property of the wrong type is
//! an `InvalidParameter` error naming the property and the calling operation.

use crate::error::{CohortError, Result};
use crate::types::typedef::PropertyType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum PropertyValue {
    String(String),
    Int(i64),
    Float(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
    StringArray(Vec<String>),
    StringMap(BTreeMap<String, String>),
    Map(InstanceProperties),
    /// Symbolic name of an enum element
    Enum(String),
}

impl PropertyValue {
    /// Short name of the value's type, for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Boolean(_) => "boolean",
            Self::Date(_) => "date",
            Self::StringArray(_) => "string_array",
            Self::StringMap(_) => "string_map",
            Self::Map(_) => "map",
            Self::Enum(_) => "enum",
        }
    }

    /// Whether this value may be stored in a property declared as `declared`
    pub fn conforms_to(&self, declared: &PropertyType) -> bool {
        matches!(
            (self, declared),
            (Self::String(_), PropertyType::String)
                | (Self::Int(_), PropertyType::Int)
                | (Self::Float(_), PropertyType::Float)
                | (Self::Int(_), PropertyType::Float)
                | (Self::Boolean(_), PropertyType::Boolean)
                | (Self::Date(_), PropertyType::Date)
                | (Self::StringArray(_), PropertyType::StringArray)
                | (Self::StringMap(_), PropertyType::StringMap)
                | (Self::Map(_), PropertyType::Map)
                | (Self::Enum(_), PropertyType::Enum(_))
        )
    }

    /// Convert to a plain JSON value
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::String(s) | Self::Enum(s) => serde_json::Value::String(s.clone()),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Value::from(*f),
            Self::Boolean(b) => serde_json::Value::Bool(*b),
            Self::Date(d) => serde_json::Value::String(d.to_rfc3339()),
            Self::StringArray(values) => serde_json::Value::from(values.clone()),
            Self::StringMap(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                    .collect(),
            ),
            Self::Map(props) => serde_json::Value::Object(props.to_json_map()),
        }
    }
}

/// The named property values of an instance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceProperties(BTreeMap<String, PropertyValue>);

impl InstanceProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Set a property, replacing any previous value
    pub fn set(&mut self, name: impl Into<String>, value: PropertyValue) {
        self.0.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        self.0.remove(name)
    }

    /// Overlay `other` onto these properties
    pub fn merge(&mut self, other: InstanceProperties) {
        self.0.extend(other.0);
    }

    // ========================================================================
    // Builders
    // ========================================================================

    pub fn with(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.set(name, value);
        self
    }

    pub fn with_string(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with(name, PropertyValue::String(value.into()))
    }

    pub fn with_int(self, name: impl Into<String>, value: i64) -> Self {
        self.with(name, PropertyValue::Int(value))
    }

    pub fn with_bool(self, name: impl Into<String>, value: bool) -> Self {
        self.with(name, PropertyValue::Boolean(value))
    }

    pub fn with_date(self, name: impl Into<String>, value: DateTime<Utc>) -> Self {
        self.with(name, PropertyValue::Date(value))
    }

    pub fn with_string_array<I, S>(self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with(
            name,
            PropertyValue::StringArray(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn with_string_map(self, name: impl Into<String>, map: BTreeMap<String, String>) -> Self {
        self.with(name, PropertyValue::StringMap(map))
    }

    // ========================================================================
    // Typed accessors
    // ========================================================================

    pub fn get_string(&self, name: &str, operation: &str) -> Result<Option<String>> {
        match self.0.get(name) {
            None => Ok(None),
            Some(PropertyValue::String(s)) | Some(PropertyValue::Enum(s)) => Ok(Some(s.clone())),
            Some(other) => Err(wrong_type(name, operation, "string", other)),
        }
    }

    pub fn remove_string(&mut self, name: &str, operation: &str) -> Result<Option<String>> {
        let value = self.get_string(name, operation)?;
        self.0.remove(name);
        Ok(value)
    }

    /// Integer property, or 0 when absent
    pub fn get_int(&self, name: &str, operation: &str) -> Result<i64> {
        match self.0.get(name) {
            None => Ok(0),
            Some(PropertyValue::Int(i)) => Ok(*i),
            Some(other) => Err(wrong_type(name, operation, "int", other)),
        }
    }

    pub fn remove_int(&mut self, name: &str, operation: &str) -> Result<i64> {
        let value = self.get_int(name, operation)?;
        self.0.remove(name);
        Ok(value)
    }

    /// Boolean property, or false when absent
    pub fn get_bool(&self, name: &str, operation: &str) -> Result<bool> {
        match self.0.get(name) {
            None => Ok(false),
            Some(PropertyValue::Boolean(b)) => Ok(*b),
            Some(other) => Err(wrong_type(name, operation, "boolean", other)),
        }
    }

    pub fn remove_bool(&mut self, name: &str, operation: &str) -> Result<bool> {
        let value = self.get_bool(name, operation)?;
        self.0.remove(name);
        Ok(value)
    }

    pub fn get_date(&self, name: &str, operation: &str) -> Result<Option<DateTime<Utc>>> {
        match self.0.get(name) {
            None => Ok(None),
            Some(PropertyValue::Date(d)) => Ok(Some(*d)),
            Some(other) => Err(wrong_type(name, operation, "date", other)),
        }
    }

    pub fn remove_date(&mut self, name: &str, operation: &str) -> Result<Option<DateTime<Utc>>> {
        let value = self.get_date(name, operation)?;
        self.0.remove(name);
        Ok(value)
    }

    pub fn get_string_array(&self, name: &str, operation: &str) -> Result<Option<Vec<String>>> {
        match self.0.get(name) {
            None => Ok(None),
            Some(PropertyValue::StringArray(values)) => Ok(Some(values.clone())),
            Some(other) => Err(wrong_type(name, operation, "string_array", other)),
        }
    }

    pub fn remove_string_array(
        &mut self,
        name: &str,
        operation: &str,
    ) -> Result<Option<Vec<String>>> {
        let value = self.get_string_array(name, operation)?;
        self.0.remove(name);
        Ok(value)
    }

    pub fn get_string_map(
        &self,
        name: &str,
        operation: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        match self.0.get(name) {
            None => Ok(None),
            Some(PropertyValue::StringMap(map)) => Ok(Some(map.clone())),
            Some(other) => Err(wrong_type(name, operation, "string_map", other)),
        }
    }

    pub fn remove_string_map(
        &mut self,
        name: &str,
        operation: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let value = self.get_string_map(name, operation)?;
        self.0.remove(name);
        Ok(value)
    }

    /// Nested property map
    pub fn get_map(&self, name: &str, operation: &str) -> Result<Option<InstanceProperties>> {
        match self.0.get(name) {
            None => Ok(None),
            Some(PropertyValue::Map(props)) => Ok(Some(props.clone())),
            Some(other) => Err(wrong_type(name, operation, "map", other)),
        }
    }

    /// Flatten into a JSON object
    pub fn to_json_map(&self) -> serde_json::Map<String, serde_json::Value> {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }
}

impl FromIterator<(String, PropertyValue)> for InstanceProperties {
    fn from_iter<T: IntoIterator<Item = (String, PropertyValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn wrong_type(name: &str, operation: &str, expected: &str, found: &PropertyValue) -> CohortError {
    CohortError::invalid_parameter(
        name,
        operation,
        format!("expected {} property, found {}", expected, found.type_name()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn sample() -> InstanceProperties {
        InstanceProperties::new()
            .with_string("name", "orders")
            .with_int("rows", 120)
            .with_bool("certified", true)
            .with_string_array("tags", ["pii", "gold"])
    }

    #[test]
    fn test_typed_getters() {
        let props = sample();
        assert_eq!(props.get_string("name", "test").unwrap().as_deref(), Some("orders"));
        assert_eq!(props.get_int("rows", "test").unwrap(), 120);
        assert!(props.get_bool("certified", "test").unwrap());
        assert_eq!(
            props.get_string_array("tags", "test").unwrap(),
            Some(vec!["pii".to_string(), "gold".to_string()])
        );
    }

    #[test]
    fn test_absent_properties_default() {
        let props = InstanceProperties::new();
        assert_eq!(props.get_string("name", "test").unwrap(), None);
        assert_eq!(props.get_int("rows", "test").unwrap(), 0);
        assert!(!props.get_bool("certified", "test").unwrap());
        assert_eq!(props.get_date("created", "test").unwrap(), None);
    }

    #[test]
    fn test_wrong_type_is_invalid_parameter() {
        let props = sample();
        let err = props.get_int("name", "lookupRows").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
        assert!(err.to_string().contains("lookupRows"));
    }

    #[test]
    fn test_remove_takes_property_out() {
        let mut props = sample();
        assert_eq!(props.remove_int("rows", "test").unwrap(), 120);
        assert!(!props.contains("rows"));
        assert_eq!(props.len(), 3);
    }

    #[test]
    fn test_conformance() {
        assert!(PropertyValue::Int(3).conforms_to(&PropertyType::Float));
        assert!(!PropertyValue::Float(3.0).conforms_to(&PropertyType::Int));
        assert!(PropertyValue::Enum("GOLD".into()).conforms_to(&PropertyType::Enum("Tier".into())));
    }

    #[test]
    fn test_json_map() {
        let json = sample().to_json_map();
        assert_eq!(json["name"], serde_json::json!("orders"));
        assert_eq!(json["rows"], serde_json::json!(120));
    }
}
