//! Candidate parsing and validation.
//!
//! Extraction prompts ask the model for a JSON array of candidate objects.
//! Everything that comes back is treated as hostile until it passes the
//! whitelist: plain object, known keys only (extras dropped with a
//! warning), length caps, a valid category, and no banned patterns in the
//! title or content. Validation failures are warnings at the call site,
//! never task failures.

use serde_json::Value;
use tracing::warn;

use operon_sandbox::ScriptPolicy;
use operon_types::{
    MemoryCategory, MEMORY_CONTENT_MAX, MEMORY_DESCRIPTION_MAX, MEMORY_TITLE_MAX,
};

/// The keys a candidate object may carry.
const ALLOWED_KEYS: &[&str] = &["title", "description", "content", "category"];

/// A validated memory candidate, ready to be stamped with provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Lesson title.
    pub title: String,
    /// One-paragraph summary.
    pub description: String,
    /// Full lesson body.
    pub content: String,
    /// Lesson category.
    pub category: MemoryCategory,
}

/// Pull a JSON array out of a model response, tolerating code fences.
pub fn parse_candidate_array(response: &str) -> Result<Vec<Value>, String> {
    let trimmed = response.trim();
    let body = match (trimmed.find('['), trimmed.rfind(']')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => return Err("response contains no JSON array".to_string()),
    };
    let parsed: Value =
        serde_json::from_str(body).map_err(|e| format!("candidate array does not parse: {e}"))?;
    match parsed {
        Value::Array(items) => Ok(items),
        _ => Err("candidate payload is not an array".to_string()),
    }
}

/// Validate one candidate object against the whitelist.
pub fn validate_candidate(raw: &Value, policy: &ScriptPolicy) -> Result<Candidate, String> {
    let obj = raw
        .as_object()
        .ok_or_else(|| "candidate is not a plain object".to_string())?;

    for key in obj.keys() {
        if !ALLOWED_KEYS.contains(&key.as_str()) {
            warn!(key = %key, "dropping unexpected candidate key");
        }
    }

    let field = |name: &str| -> Result<String, String> {
        obj.get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| format!("candidate is missing '{name}'"))
    };

    let title = field("title")?;
    let description = field("description")?;
    let content = field("content")?;
    let category_tag = field("category")?;

    if title.chars().count() > MEMORY_TITLE_MAX {
        return Err(format!("title exceeds {MEMORY_TITLE_MAX} chars"));
    }
    if description.chars().count() > MEMORY_DESCRIPTION_MAX {
        return Err(format!("description exceeds {MEMORY_DESCRIPTION_MAX} chars"));
    }
    if content.chars().count() > MEMORY_CONTENT_MAX {
        return Err(format!("content exceeds {MEMORY_CONTENT_MAX} chars"));
    }

    let category = MemoryCategory::parse(&category_tag)
        .ok_or_else(|| format!("'{category_tag}' is not a valid category"))?;

    for (name, text) in [("title", &title), ("content", &content)] {
        if let Some(pattern) = policy.find_banned(text) {
            return Err(format!("{name} matches banned pattern: {pattern}"));
        }
    }

    Ok(Candidate { title, description, content, category })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> ScriptPolicy {
        ScriptPolicy::new()
    }

    #[test]
    fn fenced_arrays_parse() {
        let response = "Here are the lessons:\n```json\n[{\"title\":\"t\"}]\n```";
        let items = parse_candidate_array(response).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn non_arrays_are_rejected() {
        assert!(parse_candidate_array("just text").is_err());
        assert!(parse_candidate_array("{\"title\":\"t\"}").is_err());
    }

    #[test]
    fn valid_candidates_pass() {
        let raw = json!({
            "title": "Invoice lists need a status filter",
            "description": "Unfiltered invoice.list calls are refused upstream.",
            "content": "Always pass filter: {STATUS: ...} when listing invoices.",
            "category": "error_pattern",
            "confidence": 0.9
        });
        let candidate = validate_candidate(&raw, &policy()).unwrap();
        assert_eq!(candidate.category, MemoryCategory::ErrorPattern);
    }

    #[test]
    fn credential_bearing_content_is_rejected() {
        let raw = json!({
            "title": "Key handling",
            "description": "d",
            "content": "script read process.env.GEMINI_API_KEY and crashed",
            "category": "error_pattern"
        });
        let err = validate_candidate(&raw, &policy()).unwrap_err();
        assert!(err.contains("banned pattern"));
    }

    #[test]
    fn length_caps_are_enforced() {
        let raw = json!({
            "title": "t".repeat(MEMORY_TITLE_MAX + 1),
            "description": "d",
            "content": "c",
            "category": "api_usage"
        });
        assert!(validate_candidate(&raw, &policy()).unwrap_err().contains("title"));

        let raw = json!({
            "title": "t",
            "description": "d",
            "content": "c".repeat(MEMORY_CONTENT_MAX + 1),
            "category": "api_usage"
        });
        assert!(validate_candidate(&raw, &policy()).unwrap_err().contains("content"));
    }

    #[test]
    fn unknown_categories_are_rejected() {
        let raw = json!({
            "title": "t", "description": "d", "content": "c", "category": "vibes"
        });
        assert!(validate_candidate(&raw, &policy()).unwrap_err().contains("not a valid category"));
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(validate_candidate(&json!("just a string"), &policy()).is_err());
        assert!(validate_candidate(&json!(42), &policy()).is_err());
    }
}
