//! Hashing and normalization

use sha2::{Digest, Sha256};

/// SHA-256 of content as a hex string
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Collapse internal whitespace, trim, lower-case.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Dedup key for a fact's text.
pub fn fact_hash(fact_text: &str) -> String {
    content_hash(&normalize_text(fact_text))
}

/// Identity of an exact step sequence. Steps are joined with a unit
/// separator so ["a b", "c"] and ["a", "b c"] hash differently.
pub fn steps_hash(steps: &[String]) -> String {
    content_hash(&steps.join("\u{1f}"))
}
