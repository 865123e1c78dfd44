#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **operon-coerce** – Schema validation with typed coercion for task
//! parameters.
//!
//! Parameters arrive as free-form strings more often than not: an LLM
//! extractor quotes numbers, a chat surface stringifies JSON objects.
//! Instead of bouncing those back, [`validate`] attempts a fixed set of
//! safe coercions before reporting a type mismatch:
//!
//! - string → number, when the string parses to a finite number
//! - number → string
//! - string → boolean (`"true"`/`"false"`, case-insensitive); number →
//!   boolean (`x != 0`)
//! - string → object or array, via strict JSON parsing with a top-level
//!   type check
//! - `{start, end}` date-range objects are checked against ISO-8601
//!   calendar dates (natural-language ranges are the upstream extractor's
//!   job and are rejected here)
//!
//! Missing required fields are hard errors; schema defaults fill missing
//! optional fields; unknown keys are reported, never silently dropped. The
//! whole pass is idempotent: re-validating its own output is the identity.

use chrono::NaiveDate;
use serde_json::{Map, Value};
use tracing::debug;

use operon_types::{EngineError, EngineResult, ParameterSchema, PropertySchema, SchemaType};

/// Validate `params` against `schema`, returning the coerced parameters or
/// a [`EngineError::ParameterValidation`] enumerating every violation.
pub fn validate(params: &Value, schema: &ParameterSchema) -> EngineResult<Value> {
    let mut violations = Vec::new();

    let input = match params {
        Value::Null => Map::new(),
        Value::Object(map) => map.clone(),
        other => {
            return Err(EngineError::ParameterValidation {
                violations: vec![format!("parameters must be an object, got {}", type_name(other))],
            })
        }
    };

    let mut output = Map::new();

    for (name, prop) in &schema.properties {
        match input.get(name) {
            Some(value) => match coerce_value(value, prop, name) {
                Ok(coerced) => {
                    output.insert(name.clone(), coerced);
                }
                Err(mut errs) => violations.append(&mut errs),
            },
            None => {
                if let Some(default) = &prop.default {
                    debug!(field = %name, "filling schema default");
                    output.insert(name.clone(), default.clone());
                } else if schema.is_required(name) {
                    violations.push(format!("{name}: required field is missing"));
                }
            }
        }
    }

    for name in input.keys() {
        if !schema.properties.contains_key(name) {
            violations.push(format!("{name}: unknown field not in schema"));
        }
    }

    if violations.is_empty() {
        Ok(Value::Object(output))
    } else {
        Err(EngineError::ParameterValidation { violations })
    }
}

fn coerce_value(value: &Value, prop: &PropertySchema, path: &str) -> Result<Value, Vec<String>> {
    let coerced = if prop.kind.matches(value) {
        value.clone()
    } else {
        match attempt_coercion(value, prop.kind) {
            Some(coerced) => coerced,
            None => {
                return Err(vec![format!(
                    "{path}: expected {}, got {}",
                    kind_name(prop.kind),
                    type_name(value)
                )])
            }
        }
    };

    if let Some(allowed) = &prop.enum_values {
        if !allowed.contains(&coerced) {
            return Err(vec![format!(
                "{path}: value {coerced} not in enum {}",
                Value::Array(allowed.clone())
            )]);
        }
    }

    match prop.kind {
        SchemaType::Array => coerce_array(&coerced, prop, path),
        SchemaType::Object => coerce_object(&coerced, prop, path),
        _ => Ok(coerced),
    }
}

fn coerce_array(value: &Value, prop: &PropertySchema, path: &str) -> Result<Value, Vec<String>> {
    let Some(items) = &prop.items else {
        return Ok(value.clone());
    };
    let arr = value.as_array().cloned().unwrap_or_default();
    let mut out = Vec::with_capacity(arr.len());
    let mut errs = Vec::new();
    for (i, item) in arr.iter().enumerate() {
        match coerce_value(item, items, &format!("{path}[{i}]")) {
            Ok(coerced) => out.push(coerced),
            Err(mut e) => errs.append(&mut e),
        }
    }
    if errs.is_empty() {
        Ok(Value::Array(out))
    } else {
        Err(errs)
    }
}

fn coerce_object(value: &Value, prop: &PropertySchema, path: &str) -> Result<Value, Vec<String>> {
    let Some(obj) = value.as_object() else {
        return Ok(value.clone());
    };

    // Date-range intent: an object of exactly {start, end} strings must be
    // ISO-8601 calendar dates.
    if is_date_range_shape(obj) {
        let mut errs = Vec::new();
        for key in ["start", "end"] {
            let date = obj.get(key).and_then(Value::as_str).unwrap_or_default();
            if NaiveDate::parse_from_str(date, "%Y-%m-%d").is_err() {
                errs.push(format!("{path}.{key}: '{date}' is not an ISO-8601 calendar date"));
            }
        }
        if !errs.is_empty() {
            return Err(errs);
        }
        return Ok(value.clone());
    }

    let Some(props) = &prop.properties else {
        return Ok(value.clone());
    };

    let mut out = obj.clone();
    let mut errs = Vec::new();
    for (name, sub) in props {
        if let Some(v) = obj.get(name) {
            match coerce_value(v, sub, &format!("{path}.{name}")) {
                Ok(coerced) => {
                    out.insert(name.clone(), coerced);
                }
                Err(mut e) => errs.append(&mut e),
            }
        } else if let Some(default) = &sub.default {
            out.insert(name.clone(), default.clone());
        }
    }
    if errs.is_empty() {
        Ok(Value::Object(out))
    } else {
        Err(errs)
    }
}

fn is_date_range_shape(obj: &Map<String, Value>) -> bool {
    obj.len() == 2
        && obj.get("start").is_some_and(Value::is_string)
        && obj.get("end").is_some_and(Value::is_string)
}

fn attempt_coercion(value: &Value, target: SchemaType) -> Option<Value> {
    match (target, value) {
        (SchemaType::Number, Value::String(s)) => {
            if let Ok(i) = s.trim().parse::<i64>() {
                return Some(Value::from(i));
            }
            let f = s.trim().parse::<f64>().ok()?;
            if f.is_finite() {
                Some(Value::from(f))
            } else {
                None
            }
        }
        (SchemaType::String, Value::Number(n)) => Some(Value::String(n.to_string())),
        (SchemaType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        (SchemaType::Boolean, Value::Number(n)) => {
            Some(Value::Bool(n.as_f64().is_some_and(|f| f != 0.0)))
        }
        (SchemaType::Object, Value::String(s)) => {
            let parsed: Value = serde_json::from_str(s).ok()?;
            parsed.is_object().then_some(parsed)
        }
        (SchemaType::Array, Value::String(s)) => {
            let parsed: Value = serde_json::from_str(s).ok()?;
            parsed.is_array().then_some(parsed)
        }
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn kind_name(kind: SchemaType) -> &'static str {
    match kind {
        SchemaType::String => "string",
        SchemaType::Number => "number",
        SchemaType::Boolean => "boolean",
        SchemaType::Array => "array",
        SchemaType::Object => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use operon_types::{ParameterSchema, PropertySchema, SchemaType};
    use serde_json::json;

    fn report_schema() -> ParameterSchema {
        ParameterSchema::empty()
            .with_property("limit", PropertySchema::of(SchemaType::Number))
            .with_property("filter", PropertySchema::of(SchemaType::Object))
            .with_property(
                "tags",
                PropertySchema {
                    items: Some(Box::new(PropertySchema::of(SchemaType::String))),
                    ..PropertySchema::of(SchemaType::Array)
                },
            )
            .with_required("limit")
    }

    #[test]
    fn stringly_typed_input_coerces() {
        let schema = report_schema();
        let input = json!({
            "limit": "50",
            "filter": "{\"status\":\"open\"}",
            "tags": "[\"a\",\"b\"]",
        });
        let out = validate(&input, &schema).unwrap();
        assert_eq!(out, json!({"limit": 50, "filter": {"status": "open"}, "tags": ["a", "b"]}));
    }

    #[test]
    fn non_numeric_string_fails_with_field_named() {
        let schema = report_schema();
        let err = validate(&json!({"limit": "abc"}), &schema).unwrap_err();
        let EngineError::ParameterValidation { violations } = err else {
            panic!("wrong error kind");
        };
        assert!(violations.iter().any(|v| v.starts_with("limit:")));
    }

    #[test]
    fn missing_required_is_hard_error_and_all_violations_reported() {
        let schema = report_schema();
        let err = validate(&json!({"tags": [1], "extra": true}), &schema).unwrap_err();
        let EngineError::ParameterValidation { violations } = err else {
            panic!("wrong error kind");
        };
        assert!(violations.iter().any(|v| v.contains("limit: required")));
        assert!(violations.iter().any(|v| v.contains("tags[0]")));
        assert!(violations.iter().any(|v| v.contains("extra: unknown")));
        assert_eq!(violations.len(), 3);
    }

    #[test]
    fn defaults_fill_missing_optionals() {
        let schema = ParameterSchema::empty()
            .with_property(
                "format",
                PropertySchema::of(SchemaType::String).with_default(json!("HTML")),
            )
            .with_property("limit", PropertySchema::of(SchemaType::Number).with_default(json!(100)));
        let out = validate(&json!({}), &schema).unwrap();
        assert_eq!(out, json!({"format": "HTML", "limit": 100}));
    }

    #[test]
    fn enums_are_enforced_after_coercion() {
        let schema = ParameterSchema::empty().with_property(
            "format",
            PropertySchema::of(SchemaType::String).with_enum(vec![json!("HTML"), json!("CSV")]),
        );
        assert!(validate(&json!({"format": "HTML"}), &schema).is_ok());
        let err = validate(&json!({"format": "PDF"}), &schema).unwrap_err();
        assert!(err.to_string().contains("not in enum"));
    }

    #[test]
    fn date_ranges_require_iso_calendar_dates() {
        let schema = ParameterSchema::empty()
            .with_property("dateRange", PropertySchema::of(SchemaType::Object));

        let ok = validate(
            &json!({"dateRange": {"start": "2026-04-01", "end": "2026-06-30"}}),
            &schema,
        )
        .unwrap();
        assert_eq!(ok["dateRange"]["start"], "2026-04-01");

        let err = validate(
            &json!({"dateRange": {"start": "last quarter", "end": "2026-06-30"}}),
            &schema,
        )
        .unwrap_err();
        assert!(err.to_string().contains("ISO-8601"));
    }

    #[test]
    fn string_to_object_requires_matching_top_level_type() {
        let schema =
            ParameterSchema::empty().with_property("filter", PropertySchema::of(SchemaType::Object));
        // Parses as JSON, but to an array - refused.
        let err = validate(&json!({"filter": "[1,2]"}), &schema).unwrap_err();
        assert!(err.to_string().contains("expected object"));
    }

    #[test]
    fn booleans_coerce_from_strings_and_numbers() {
        let schema = ParameterSchema::empty()
            .with_property("verbose", PropertySchema::of(SchemaType::Boolean));
        assert_eq!(validate(&json!({"verbose": "TRUE"}), &schema).unwrap()["verbose"], json!(true));
        assert_eq!(validate(&json!({"verbose": 0}), &schema).unwrap()["verbose"], json!(false));
        assert_eq!(validate(&json!({"verbose": 2}), &schema).unwrap()["verbose"], json!(true));
        assert!(validate(&json!({"verbose": "yes"}), &schema).is_err());
    }

    #[test]
    fn validation_is_idempotent() {
        let schema = report_schema();
        let input = json!({
            "limit": "50",
            "filter": "{\"status\":\"open\"}",
            "tags": ["a", 1],
        });
        let once = validate(&input, &schema).unwrap();
        assert_eq!(once["tags"], json!(["a", "1"]));
        let twice = validate(&once, &schema).unwrap();
        assert_eq!(once, twice);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn coercion_is_idempotent_for_arbitrary_scalars(
                limit in prop_oneof![
                    any::<i32>().prop_map(|n| json!(n)),
                    any::<i32>().prop_map(|n| json!(n.to_string())),
                    any::<bool>().prop_map(|b| json!(b)),
                    "[a-z]{1,8}".prop_map(|s| json!(s)),
                ]
            ) {
                let schema = ParameterSchema::empty()
                    .with_property("limit", PropertySchema::of(SchemaType::Number));
                if let Ok(once) = validate(&json!({ "limit": limit }), &schema) {
                    let twice = validate(&once, &schema).unwrap();
                    prop_assert_eq!(once, twice);
                }
            }
        }
    }
}
