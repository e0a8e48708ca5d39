//! Content preprocessing for embedding generation.
//!
//! Prepares a catalogue entity's descriptive fields for embedding:
//! 1. Trim whitespace, drop empty fields
//! 2. Skip if everything is empty
//! 3. Concatenate with separator
//! 4. Truncate to max length with ellipsis

use sha2::{Digest, Sha256};

/// Maximum content length for embedding input (characters, not tokens)
const MAX_CONTENT_LENGTH: usize = 512;

/// Ellipsis suffix when content is truncated
const TRUNCATION_SUFFIX: &str = "...";

/// Join the descriptive fields of an entity into one embedding input.
///
/// Returns `None` if every field is empty after trimming.
pub fn preprocess_content(fields: &[&str]) -> Option<String> {
    let parts: Vec<&str> = fields
        .iter()
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .collect();

    if parts.is_empty() {
        return None;
    }

    Some(truncate_content(&parts.join(" - ")))
}

/// Truncate content to MAX_CONTENT_LENGTH characters, adding ellipsis if truncated.
fn truncate_content(content: &str) -> String {
    if content.chars().count() <= MAX_CONTENT_LENGTH {
        return content.to_string();
    }

    // count chars, not bytes, so UTF-8 sequences are never split
    let max_chars = MAX_CONTENT_LENGTH - TRUNCATION_SUFFIX.len();
    let truncated: String = content.chars().take(max_chars).collect();

    format!("{}{}", truncated, TRUNCATION_SUFFIX)
}

/// Stable hash of the embedding input, persisted next to the embedding so an
/// unchanged entity is not re-embedded.
pub fn content_hash(content: &str) -> u64 {
    let digest = Sha256::digest(content.trim().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}
