//! Name validation for bricks and events.

use crate::error::{EngineError, Result};

/// Normalize a user supplied name.
///
/// Surrounding whitespace is trimmed and internal whitespace runs collapse to
/// a single `_`. The result must start with a letter and contain only word
/// characters. Normalizing an already valid name returns it unchanged.
pub fn valid_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if !trimmed.chars().next().is_some_and(char::is_alphabetic) {
        return None;
    }

    let collapsed = trimmed.split_whitespace().collect::<Vec<_>>().join("_");
    if collapsed.chars().all(is_word_char) {
        Some(collapsed)
    } else {
        None
    }
}

/// Like [`valid_name`] but reports why a name was rejected.
pub fn validate_name(raw: &str) -> Result<String> {
    if raw.trim().is_empty() {
        return Err(EngineError::invalid_name(raw, "name is required"));
    }
    if !raw.trim().starts_with(char::is_alphabetic) {
        return Err(EngineError::invalid_name(raw, "name must start with a letter"));
    }
    valid_name(raw).ok_or_else(|| {
        EngineError::invalid_name(raw, "name may contain only letters, digits and '_'")
    })
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}
