//! Semantic stagnation metrics over a window of recent output.
//!
//! All functions take lines oldest first. Normalized lines feed the
//! repetition and entropy metrics; raw (redacted) lines feed the progress
//! guard so counters that normalization erases still register as movement.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

pub const SIMILARITY_THRESHOLD: f64 = 0.9;

static PROGRESS_HINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(\b\d+\s*/\s*\d+\b|\b\d+(\.\d+)?\s*%|\b(step|epoch|iteration|progress|processed|downloaded|uploaded|completed)\b)",
    )
    .expect("progress hint pattern")
});

/// Two-row Levenshtein distance over chars.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// `1 - distance / max_len`, in `[0, 1]`. Two empty strings are identical.
pub fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

/// Fraction of lines after the first that are near-duplicates of it.
/// Zero until at least `window` lines are available.
pub fn log_repetition(normalized: &[String], window: usize) -> f64 {
    if window < 2 || normalized.len() < window {
        return 0.0;
    }
    let lines = &normalized[normalized.len() - window..];
    let first = &lines[0];
    let similar = lines[1..]
        .iter()
        .filter(|line| similarity(first, line) >= SIMILARITY_THRESHOLD)
        .count();
    similar as f64 / (lines.len() - 1) as f64
}

/// True when a full window is pairwise similar to its first line.
pub fn is_stagnant(normalized: &[String], window: usize) -> bool {
    window >= 2 && normalized.len() >= window && log_repetition(normalized, window) >= 1.0
}

/// Unique lines over total, scaled to `[0, 100]`; 100 for an empty window.
pub fn entropy_score(normalized: &[String]) -> f64 {
    if normalized.is_empty() {
        return 100.0;
    }
    let unique: HashSet<&str> = normalized.iter().map(String::as_str).collect();
    (unique.len() as f64 / normalized.len() as f64 * 100.0).clamp(0.0, 100.0)
}

/// Unique raw lines over total; 0 for an empty window.
pub fn raw_diversity(raw: &[String]) -> f64 {
    if raw.is_empty() {
        return 0.0;
    }
    let unique: HashSet<&str> = raw.iter().map(String::as_str).collect();
    unique.len() as f64 / raw.len() as f64
}

/// True when most lines look like progress reporting.
pub fn progress_like(raw: &[String]) -> bool {
    if raw.is_empty() {
        return false;
    }
    let hits = raw.iter().filter(|line| PROGRESS_HINT.is_match(line)).count();
    hits * 2 > raw.len()
}
