//! Line normalization for the stagnation classifier.
//!
//! Volatile tokens (hex literals, timestamps, numbers) are collapsed into
//! placeholders so that lines differing only by counters compare equal.

use once_cell::sync::Lazy;
use regex::Regex;

static HEX_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"0x[0-9a-fA-F]+").expect("hex literal pattern"));
static ISO_TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[T\s]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?")
        .expect("iso timestamp pattern")
});
static CLOCK_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{2}:\d{2}:\d{2}\b").expect("clock time pattern"));
static NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d+(\.\d+)?\b").expect("number pattern"));

pub fn normalize(line: &str) -> String {
    let out = HEX_LITERAL.replace_all(line, "<HEX>");
    let out = ISO_TIMESTAMP.replace_all(&out, "<TIME>");
    let out = CLOCK_TIME.replace_all(&out, "<TIME>");
    let out = NUMBER.replace_all(&out, "<NUM>");
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_volatile_tokens() {
        assert_eq!(
            normalize("2024-05-01T12:30:45.123Z retry 17 at 0xdeadbeef"),
            "<TIME> retry <NUM> at <HEX>"
        );
        assert_eq!(normalize("tick 12:00:01 took 3.5 ms"), "tick <TIME> took <NUM> ms");
    }

    #[test]
    fn counters_normalize_to_same_line() {
        assert_eq!(normalize("attempt 1 failed"), normalize("attempt 2 failed"));
    }
}
