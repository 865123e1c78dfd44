//! Fuzzy id/name resolution for the management surface.
//!
//! Builds a keyword-expansion set from the user string (normalised,
//! word-split, synonym-expanded) and scores every template by weighted
//! hits. Deliberately cheap: this path backs human-facing management
//! commands, not the hot matching path.

use std::collections::HashSet;

use operon_types::Template;

/// Score floor below which no fuzzy match is returned.
pub const FUZZY_SCORE_FLOOR: f64 = 0.5;

const EXACT_NAME_WEIGHT: f64 = 15.0;
const EXACT_ID_WEIGHT: f64 = 10.0;
const NAME_WORD_WEIGHT: f64 = 0.5;
const ENABLED_BONUS: f64 = 0.1;

/// Hand-crafted synonym map used to expand user keywords.
const SYNONYMS: &[(&str, &[&str])] = &[
    ("missed", &["lost", "unpaid", "overdue"]),
    ("lost", &["missed", "unpaid"]),
    ("revenue", &["income", "sales"]),
    ("report", &["summary", "overview"]),
    ("create", &["generate", "build", "make"]),
    ("generate", &["create", "build"]),
    ("remove", &["delete", "drop"]),
    ("delete", &["remove", "drop"]),
    ("show", &["list", "display"]),
    ("invoice", &["bill", "billing"]),
];

/// Normalise a user string into lowercase alphanumeric words.
pub fn normalise(input: &str) -> Vec<String> {
    input
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Keyword set: normalised words plus their synonyms.
pub fn expand_keywords(input: &str) -> HashSet<String> {
    let mut keywords: HashSet<String> = normalise(input).into_iter().collect();
    let mut expanded: Vec<String> = Vec::new();
    for word in &keywords {
        if let Some((_, synonyms)) = SYNONYMS.iter().find(|(k, _)| k == word) {
            expanded.extend(synonyms.iter().map(|s| s.to_string()));
        }
    }
    keywords.extend(expanded);
    keywords
}

/// Weighted score of one template against a user string.
pub fn score(template: &Template, input: &str) -> f64 {
    let normalised_input = normalise(input).join("_");
    let keywords = expand_keywords(input);

    let mut total = 0.0;
    if template.name.to_lowercase() == normalised_input
        || normalise(&template.name).join("_") == normalised_input
    {
        total += EXACT_NAME_WEIGHT;
    }
    if template.template_id.to_lowercase() == input.trim().to_lowercase() {
        total += EXACT_ID_WEIGHT;
    }

    let name_words: HashSet<String> = normalise(&template.name).into_iter().collect();
    let overlap = name_words.iter().filter(|w| keywords.contains(*w)).count();
    total += overlap as f64 * NAME_WORD_WEIGHT;

    if template.enabled {
        total += ENABLED_BONUS;
    }
    total
}

/// Best-scoring template above the floor, if any.
pub fn resolve<'a>(templates: &'a [Template], input: &str) -> Option<(&'a Template, f64)> {
    templates
        .iter()
        .map(|t| (t, score(t, input)))
        .filter(|(_, s)| *s > FUZZY_SCORE_FLOOR)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
}
