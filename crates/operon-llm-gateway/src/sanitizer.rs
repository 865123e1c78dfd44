//! Outbound prompt sanitization.
//!
//! Prompts assembled by the engine routinely interpolate user utterances,
//! captured error messages, and retrieved memory content. Any of those can
//! carry injection attempts or leaked credential material, so every prompt
//! is scanned before it leaves the process. Injection sentinels block the
//! request outright; credential-shaped material is scrubbed in place.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::CompletionRequest;

/// Placeholder substituted for scrubbed spans.
const SCRUBBED: &str = "[SCRUBBED]";

struct PromptPattern {
    pattern: &'static Lazy<Regex>,
    description: &'static str,
    blocks: bool,
}

static INJECTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(ignore\s+(all\s+)?previous|forget\s+(your\s+)?instructions|new\s+instructions:|system\s+prompt|you\s+are\s+now\s+)",
    )
    .expect("static regex")
});

static CREDENTIALS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(api[_\s-]?key|secret[_\s-]?key|access[_\s-]?token|password|private[_\s-]?key)\s*[:=]\s*\S+")
        .expect("static regex")
});

static ENV_ACCESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)process\.env\.[A-Z0-9_]+").expect("static regex")
});

static PATTERNS: &[PromptPattern] = &[
    PromptPattern { pattern: &INJECTION, description: "prompt injection attempt", blocks: true },
    PromptPattern { pattern: &CREDENTIALS, description: "credential material", blocks: false },
    PromptPattern { pattern: &ENV_ACCESS, description: "environment credential reference", blocks: false },
];

/// Scans and scrubs outbound prompts.
#[derive(Debug, Default)]
pub struct PromptSanitizer {
    _private: (),
}

impl PromptSanitizer {
    /// Create a sanitizer with the built-in pattern set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sanitize a request, returning the scrubbed request or the refusal
    /// reason when a blocking pattern matched.
    pub fn sanitize(&self, request: CompletionRequest) -> Result<CompletionRequest, String> {
        let mut prompt = request.prompt.clone();

        for pattern in PATTERNS {
            if !pattern.pattern.is_match(&prompt) {
                continue;
            }
            if pattern.blocks {
                warn!(pattern = pattern.description, "blocking outbound prompt");
                return Err(format!("prompt blocked: {}", pattern.description));
            }
            debug!(pattern = pattern.description, "scrubbing outbound prompt");
            prompt = pattern.pattern.replace_all(&prompt, SCRUBBED).into_owned();
        }

        if prompt.trim().is_empty() {
            return Err("prompt empty after scrubbing".to_string());
        }

        Ok(CompletionRequest { prompt, ..request })
    }

    /// Whether `prompt` would be blocked outright (for tests and policy
    /// introspection).
    pub fn would_block(&self, prompt: &str) -> bool {
        PATTERNS
            .iter()
            .any(|p| p.blocks && p.pattern.is_match(prompt))
    }
}
