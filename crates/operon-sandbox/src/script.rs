//! The script dialect: declarative JSON step programs.
//!
//! A template's `execution_script` is the JSON serialisation of a
//! [`ScriptProgram`]. Steps run in order; `{{path}}` placeholders in
//! prompts, parameters, and artefact content interpolate task parameters
//! (`params.…`) and the bindings earlier steps produced.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use operon_types::{EngineError, EngineResult};

/// One step of a script program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptStep {
    /// Method-addressed call against the primary data source.
    DataSource {
        /// Method name, e.g. `crm.invoice.list`.
        method: String,
        /// Call parameters; string leaves may carry placeholders.
        #[serde(default)]
        params: Value,
        /// Binding name the result is stored under.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bind: Option<String>,
    },
    /// Bounded text generation.
    Llm {
        /// Prompt template with placeholders.
        prompt: String,
        /// Binding name the generated text is stored under.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bind: Option<String>,
        /// Token cap for this generation.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_tokens: Option<u32>,
    },
    /// Report task progress.
    Progress {
        /// Completion percentage 0..=100.
        percentage: u8,
        /// Progress message; may carry placeholders.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Upload an artefact to the object store.
    Emit {
        /// Artefact kind tag (`html_report`, `diagram`, `image`).
        kind: String,
        /// Artefact filename.
        name: String,
        /// Content template with placeholders.
        content: String,
    },
    /// Explicit cooperative-cancellation checkpoint.
    Checkpoint,
}

impl ScriptStep {
    /// Operation tag for trajectories and logging.
    pub fn op(&self) -> &'static str {
        match self {
            Self::DataSource { .. } => "data_source",
            Self::Llm { .. } => "llm",
            Self::Progress { .. } => "progress",
            Self::Emit { .. } => "emit",
            Self::Checkpoint => "checkpoint",
        }
    }

    /// Short step detail for trajectories (method, artefact name, ...).
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::DataSource { method, .. } => Some(method.clone()),
            Self::Emit { name, .. } => Some(name.clone()),
            _ => None,
        }
    }
}

/// A parsed script program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptProgram {
    /// Steps in execution order.
    pub steps: Vec<ScriptStep>,
}

impl ScriptProgram {
    /// Parse script source text, refusing anything that is not a valid step
    /// program.
    pub fn parse(source: &str) -> EngineResult<Self> {
        let program: ScriptProgram =
            serde_json::from_str(source).map_err(|e| EngineError::ScriptInvalid {
                reason: format!("not a valid step program: {e}"),
            })?;
        if program.steps.is_empty() {
            return Err(EngineError::ScriptInvalid {
                reason: "program has no steps".to_string(),
            });
        }
        Ok(program)
    }

    /// Serialise back to script source text.
    pub fn to_source(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"steps\":[]}".to_string())
    }
}

//─────────────────────────────
//  Placeholder interpolation
//─────────────────────────────

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("static regex"));

/// Interpolate `{{path}}` placeholders in a template string.
///
/// Paths resolve against `scope`, an object whose keys are `params` plus
/// the bindings of earlier steps. String values substitute raw; everything
/// else substitutes as compact JSON. The pseudo-segment `count` resolves to
/// an array's length. Unresolvable placeholders are a typed script error.
pub fn interpolate(template: &str, scope: &Map<String, Value>) -> EngineResult<String> {
    let mut unresolved: Option<String> = None;
    let out = PLACEHOLDER.replace_all(template, |caps: &regex::Captures<'_>| {
        let path = &caps[1];
        match resolve_path(scope, path) {
            Some(value) => render(&value),
            None => {
                unresolved.get_or_insert_with(|| path.to_string());
                String::new()
            }
        }
    });
    if let Some(path) = unresolved {
        return Err(EngineError::ScriptInvalid {
            reason: format!("unresolvable placeholder: {{{{{path}}}}}"),
        });
    }
    Ok(out.into_owned())
}

/// Interpolate placeholders inside every string leaf of a JSON value.
pub fn interpolate_value(value: &Value, scope: &Map<String, Value>) -> EngineResult<Value> {
    Ok(match value {
        Value::String(s) => Value::String(interpolate(s, scope)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| interpolate_value(v, scope))
                .collect::<EngineResult<_>>()?,
        ),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), interpolate_value(v, scope)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

fn resolve_path(scope: &Map<String, Value>, path: &str) -> Option<Value> {
    let mut segments = path.split('.');
    let mut current = scope.get(segments.next()?)?.clone();
    for segment in segments {
        current = match (&current, segment) {
            (Value::Array(items), "count") => Value::from(items.len()),
            (Value::Object(map), key) => map.get(key)?.clone(),
            _ => return None,
        };
    }
    Some(current)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
