//! Cost estimation at task creation.
//!
//! Starts from the template's declared metadata and adjusts for parameter
//! magnitudes: long date ranges scale duration linearly, and large row
//! limits raise complexity. The estimate is advisory bookkeeping stored on
//! the task; the sandbox enforces the actual limits.

use chrono::NaiveDate;
use serde_json::Value;

use operon_types::{TaskEstimate, Template};

/// Row-limit magnitude at which complexity starts scaling.
const BASELINE_LIMIT: f64 = 100.0;

/// Estimate the cost of running `template` with `params`.
pub fn estimate(template: &Template, params: &Value) -> TaskEstimate {
    let mut duration_ms = template.estimated_duration_ms.max(1);
    let mut complexity = 1.0;

    if let Some(years) = date_range_years(params) {
        if years > 1.0 {
            duration_ms = (duration_ms as f64 * years) as u64;
            complexity *= years;
        }
    }

    if let Some(limit) = find_numeric(params, "limit") {
        if limit > BASELINE_LIMIT {
            complexity *= limit / BASELINE_LIMIT;
        }
    }

    TaskEstimate {
        steps: template.estimated_steps,
        duration_ms,
        complexity,
        memory_tier_mb: template.memory_tier_mb,
    }
}

/// Span of a `{start, end}` date range in years, when present anywhere at
/// the top level of the parameters.
fn date_range_years(params: &Value) -> Option<f64> {
    let obj = params.as_object()?;
    for value in obj.values() {
        let Some(range) = value.as_object() else {
            continue;
        };
        let (Some(start), Some(end)) = (range.get("start"), range.get("end")) else {
            continue;
        };
        let start = NaiveDate::parse_from_str(start.as_str()?, "%Y-%m-%d").ok()?;
        let end = NaiveDate::parse_from_str(end.as_str()?, "%Y-%m-%d").ok()?;
        let days = (end - start).num_days().max(0) as f64;
        return Some(days / 365.0);
    }
    None
}

fn find_numeric(params: &Value, key: &str) -> Option<f64> {
    params.as_object()?.get(key)?.as_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use operon_types::ParameterSchema;
    use serde_json::json;

    fn template() -> Template {
        let mut t = Template::new(
            "tmpl-1".into(),
            "report".into(),
            "desc".into(),
            ParameterSchema::empty(),
            r#"{"steps":[{"op":"checkpoint"}]}"#.into(),
        );
        t.estimated_duration_ms = 60_000;
        t.estimated_steps = 4;
        t
    }

    #[test]
    fn baseline_estimate_uses_template_metadata() {
        let e = estimate(&template(), &json!({}));
        assert_eq!(e.duration_ms, 60_000);
        assert_eq!(e.steps, 4);
        assert_eq!(e.complexity, 1.0);
        assert_eq!(e.memory_tier_mb, 512);
    }

    #[test]
    fn multi_year_ranges_scale_duration_linearly() {
        let e = estimate(
            &template(),
            &json!({"dateRange": {"start": "2023-01-01", "end": "2026-01-01"}}),
        );
        // Three years: duration roughly triples.
        assert!(e.duration_ms >= 179_000 && e.duration_ms <= 181_000, "{}", e.duration_ms);
        assert!(e.complexity > 2.9);
    }

    #[test]
    fn sub_year_ranges_do_not_scale() {
        let e = estimate(
            &template(),
            &json!({"dateRange": {"start": "2026-04-01", "end": "2026-06-30"}}),
        );
        assert_eq!(e.duration_ms, 60_000);
    }

    #[test]
    fn large_row_limits_raise_complexity() {
        let e = estimate(&template(), &json!({"limit": 500}));
        assert!((e.complexity - 5.0).abs() < 1e-9);
    }
}
