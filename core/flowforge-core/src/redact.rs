//! Secret redaction for captured output.
//!
//! Rules run in a fixed order; later rules see the output of earlier ones.
//! Prefixed env assignments are masked before bare credential names so a
//! named secret is rewritten exactly once.

use once_cell::sync::Lazy;
use regex::Regex;

struct Rule {
    pattern: Regex,
    replacement: &'static str,
}

static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    [
        (r"(?i)\bBearer\s+[A-Za-z0-9\-._~+/]+=*", "Bearer <REDACTED>"),
        (
            r"(?i)\b[A-Z0-9_]*_(API[_-]?KEY|TOKEN|SECRET|PASSWORD)\s*=\s*[^\s,;]+",
            "<REDACTED_SECRET_ENV>",
        ),
        (
            r"(?i)\b(api[_-]?key|key|token|secret|password)\b\s*[:=]\s*[^\s,;<][^\s,;]*",
            "${1}=<REDACTED>",
        ),
        (r"\bAKIA[0-9A-Z]{16}\b", "<REDACTED_AWS_KEY>"),
        (r"\b(?:0[xX])?[0-9a-fA-F]{32,}\b", "<REDACTED_HEX>"),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| {
        Regex::new(pattern).ok().map(|pattern| Rule {
            pattern,
            replacement,
        })
    })
    .collect()
});

/// Returns `line` with bearer tokens, named credentials, secret env
/// assignments, AWS access keys and long hex runs masked.
pub fn redact(line: &str) -> String {
    let mut out = line.to_string();
    for rule in RULES.iter() {
        if rule.pattern.is_match(&out) {
            out = rule
                .pattern
                .replace_all(&out, rule.replacement)
                .into_owned();
        }
    }
    out
}
