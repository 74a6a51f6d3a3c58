//! Lightweight input validation helpers. Keep logic minimal and deterministic.

use crate::CoreError;

/// Longest question accepted; matches the CRM multi-line text column.
pub const MAX_QUESTION_CHARS: usize = 2000;

/// Validate a submitted question: required and bounded.
pub fn validate_question(s: &str) -> Result<(), CoreError> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(CoreError::Validation {
            field: "question",
            message: "is required".into(),
        });
    }
    if trimmed.chars().count() > MAX_QUESTION_CHARS {
        return Err(CoreError::Validation {
            field: "question",
            message: format!("must be at most {} characters", MAX_QUESTION_CHARS),
        });
    }
    Ok(())
}
