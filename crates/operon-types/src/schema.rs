//! Parameter-schema subset used by templates.
//!
//! This is a deliberately small slice of JSON Schema: `object` roots with
//! `string | number | boolean | array | object` properties, `required`,
//! `enum`, and `default`. The coercer interprets it; the registry embeds its
//! serialized form into the template's composite embedding text.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The value types the schema subset supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    /// UTF-8 string.
    String,
    /// Finite double-precision number.
    Number,
    /// Boolean.
    Boolean,
    /// Homogeneous array; item shape in [`PropertySchema::items`].
    Array,
    /// Nested object; field shapes in [`PropertySchema::properties`].
    Object,
}

impl SchemaType {
    /// Whether `value` already has this type without coercion.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

/// Shape of a single parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    /// Expected value type.
    #[serde(rename = "type")]
    pub kind: SchemaType,
    /// Human-readable description, surfaced to the LLM extractor as a hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Closed set of allowed values.
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    /// Default filled in for absent optional parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Item shape for `array` parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertySchema>>,
    /// Field shapes for `object` parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, PropertySchema>>,
}

impl PropertySchema {
    /// Shorthand constructor for a bare typed property.
    pub fn of(kind: SchemaType) -> Self {
        Self { kind, description: None, enum_values: None, default: None, items: None, properties: None }
    }

    /// Attach a default value.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Attach an enum constraint.
    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }
}

/// Root schema for a template's parameters. Always an object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Named parameter shapes.
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
    /// Names that must be present after coercion.
    #[serde(default)]
    pub required: Vec<String>,
}

impl ParameterSchema {
    /// An empty schema accepting `{}` only.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builder-style property insertion.
    pub fn with_property(mut self, name: &str, prop: PropertySchema) -> Self {
        self.properties.insert(name.to_string(), prop);
        self
    }

    /// Builder-style required marker.
    pub fn with_required(mut self, name: &str) -> Self {
        self.required.push(name.to_string());
        self
    }

    /// Whether `name` is a required parameter.
    pub fn is_required(&self, name: &str) -> bool {
        self.required.iter().any(|r| r == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_round_trips_through_json() {
        let schema = ParameterSchema::empty()
            .with_property("limit", PropertySchema::of(SchemaType::Number).with_default(json!(50)))
            .with_property(
                "format",
                PropertySchema::of(SchemaType::String).with_enum(vec![json!("HTML"), json!("CSV")]),
            )
            .with_required("limit");

        let encoded = serde_json::to_string(&schema).unwrap();
        assert!(encoded.contains("\"type\":\"number\""));
        assert!(encoded.contains("\"enum\""));

        let decoded: ParameterSchema = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, schema);
        assert!(decoded.is_required("limit"));
        assert!(!decoded.is_required("format"));
    }

    #[test]
    fn schema_type_matches_json_values() {
        assert!(SchemaType::Number.matches(&json!(5)));
        assert!(!SchemaType::Number.matches(&json!("5")));
        assert!(SchemaType::Object.matches(&json!({"a": 1})));
        assert!(SchemaType::Array.matches(&json!([1, 2])));
    }
}
