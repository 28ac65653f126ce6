//! Attribute key rules.

use crate::domain::errors::AttributeError;

/// Validate an attribute key and return it trimmed.
///
/// Keys are non-empty after trimming and start with an ASCII alphanumeric
/// character.
pub fn validate_key(key: &str) -> Result<&str, AttributeError> {
    let trimmed = key.trim();
    match trimmed.chars().next() {
        Some(first) if first.is_ascii_alphanumeric() => Ok(trimmed),
        _ => Err(AttributeError::InvalidKey(key.to_string())),
    }
}
