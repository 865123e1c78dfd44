//! Task identifier grammar and retry-depth accounting.
//!
//! Grammar: `task_<decimal_ms>_<[a-z0-9_]{3,20}>(_retry_<decimal>_<decimal_ms>)*`
//!
//! Retry depth is the number of `_retry_` occurrences in the id and is hard
//! capped at [`MAX_RETRY_DEPTH`]. Retry ids are minted by appending to the
//! origin id, so the whole ancestry stays readable from the id alone.

use chrono::Utc;
use rand::Rng;

/// Marker separating retry segments inside a task id.
pub const RETRY_MARKER: &str = "_retry_";

/// Hard cap on the number of retry segments a task id may carry.
pub const MAX_RETRY_DEPTH: u32 = 3;

/// Minimum length of the contextual suffix tag.
pub const SUFFIX_MIN_LEN: usize = 3;

/// Maximum length of the contextual suffix tag.
pub const SUFFIX_MAX_LEN: usize = 20;

/// Mint a fresh task id from a contextual suffix tag.
///
/// The suffix is normalised to the `[a-z0-9_]{3,20}` alphabet: uppercase is
/// lowered, runs of other characters collapse to single underscores, and the
/// result is clamped to the length bounds. A suffix that normalises to
/// nothing usable falls back to `task`.
pub fn mint(suffix: &str) -> String {
    format!("task_{}_{}", Utc::now().timestamp_millis(), normalise_suffix(suffix))
}

/// Mint the id of a retry child for `origin` at the given attempt number.
pub fn retry_child(origin: &str, attempt: u32) -> String {
    format!("{origin}{RETRY_MARKER}{attempt}_{}", Utc::now().timestamp_millis())
}

/// Count the retry segments in a task id.
pub fn retry_depth(id: &str) -> u32 {
    id.matches(RETRY_MARKER).count() as u32
}

/// Fallback suffix from a template category: `<category>_<rand6>`.
pub fn fallback_suffix(category: &str) -> String {
    let mut rng = rand::thread_rng();
    let rand6: String = (0..6)
        .map(|_| {
            let n = rng.gen_range(0..36u32);
            char::from_digit(n, 36).unwrap_or('0')
        })
        .collect();
    normalise_suffix(&format!("{category}_{rand6}"))
}

/// Whether `id` conforms to the task id grammar.
pub fn is_valid(id: &str) -> bool {
    let Some(rest) = id.strip_prefix("task_") else {
        return false;
    };

    // Split off retry segments first; each must be `<decimal>_<decimal>`.
    let mut parts = rest.split(RETRY_MARKER);
    let head = match parts.next() {
        Some(h) => h,
        None => return false,
    };
    for segment in parts {
        let mut nums = segment.splitn(2, '_');
        let attempt_ok = nums.next().is_some_and(is_decimal);
        let ts_ok = nums.next().is_some_and(is_decimal);
        if !attempt_ok || !ts_ok {
            return false;
        }
    }

    // Head is `<decimal_ms>_<suffix>`.
    let Some((ts, suffix)) = head.split_once('_') else {
        return false;
    };
    is_decimal(ts)
        && (SUFFIX_MIN_LEN..=SUFFIX_MAX_LEN).contains(&suffix.len())
        && suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn is_decimal(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

fn normalise_suffix(raw: &str) -> String {
    let mut out = String::with_capacity(SUFFIX_MAX_LEN);
    let mut last_underscore = true; // suppress leading underscores
    for c in raw.chars() {
        let mapped = if c.is_ascii_alphanumeric() {
            last_underscore = false;
            Some(c.to_ascii_lowercase())
        } else if last_underscore {
            None
        } else {
            last_underscore = true;
            Some('_')
        };
        if let Some(m) = mapped {
            out.push(m);
            if out.len() == SUFFIX_MAX_LEN {
                break;
            }
        }
    }
    let trimmed = out.trim_end_matches('_').to_string();
    if trimmed.len() < SUFFIX_MIN_LEN {
        "task".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_are_valid() {
        let id = mint("revenue report");
        assert!(is_valid(&id), "{id}");
        assert_eq!(retry_depth(&id), 0);
    }

    #[test]
    fn suffix_is_normalised() {
        let id = mint("Missed REVENUE!! report Q3 and more words beyond");
        let suffix = id.splitn(3, '_').nth(2).unwrap();
        assert!(suffix.len() <= SUFFIX_MAX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
    }

    #[test]
    fn retry_children_accumulate_depth() {
        let origin = mint("report");
        let r1 = retry_child(&origin, 1);
        let r2 = retry_child(&r1, 2);
        let r3 = retry_child(&r2, 3);
        assert_eq!(retry_depth(&origin), 0);
        assert_eq!(retry_depth(&r1), 1);
        assert_eq!(retry_depth(&r2), 2);
        assert_eq!(retry_depth(&r3), 3);
        assert!(is_valid(&r3), "{r3}");
    }

    #[test]
    fn invalid_shapes_are_rejected() {
        assert!(!is_valid("job_1700000000000_report"));
        assert!(!is_valid("task_abc_report"));
        assert!(!is_valid("task_1700000000000_AB"));
        assert!(!is_valid("task_1700000000000_ok_retry_x_123"));
    }

    #[test]
    fn fallback_suffix_fits_grammar() {
        let s = fallback_suffix("finance");
        assert!((SUFFIX_MIN_LEN..=SUFFIX_MAX_LEN).contains(&s.len()));
        let id = format!("task_1700000000000_{s}");
        assert!(is_valid(&id), "{id}");
    }
}
