//! Shared HTTP utilities for the Inquiries workspace.
//!
//! Framework-agnostic error bodies and small request helpers used by the
//! api-server handlers.

// ============================================================================
// JSON Response Helpers (framework-agnostic)
// ============================================================================

/// Create a structured error JSON with a default message based on the code.
///
/// Returns: `{"error": {"code": "<code>", "message": "<default message>"}}`
pub fn json_err(code: &str) -> serde_json::Value {
    let message = match code {
        "not_found" => "Resource not found",
        "bad_request" => "Bad request",
        "invalid_antiforgery_token" => "Missing or invalid anti-forgery token",
        "validation_failed" => "Submitted values are not valid",
        "unauthorized" => "Authentication required",
        "forbidden" => "Access denied",
        "conflict" => "Resource already exists",
        "error" | "internal" => "Internal server error",
        _ => code, // Fallback to code as message for unknown codes
    };
    serde_json::json!({"error": {"code": code, "message": message}})
}

/// Create a structured error JSON with a custom message.
///
/// Returns: `{"error": {"code": "<code>", "message": "<message>"}}`
pub fn json_error_with_message(code: &str, message: &str) -> serde_json::Value {
    serde_json::json!({"error": {"code": code, "message": message}})
}

// ============================================================================
// Request Helpers
// ============================================================================

/// Pick the anti-forgery token from a form field or request header.
///
/// The form field wins when both are present; blank values count as absent.
pub fn pick_verification_token<'a>(
    form_value: Option<&'a str>,
    header_value: Option<&'a str>,
) -> Option<&'a str> {
    let non_blank = |v: &&str| !v.trim().is_empty();
    form_value
        .filter(non_blank)
        .or_else(|| header_value.filter(non_blank))
}

/// Interpret an environment-style boolean flag (`1`, `true`, `yes`, `on`).
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_err() {
        let err = json_err("not_found");
        assert_eq!(err, serde_json::json!({"error": {"code": "not_found", "message": "Resource not found"}}));

        // Unknown code falls back to code as message
        let err = json_err("custom_error");
        assert_eq!(err, serde_json::json!({"error": {"code": "custom_error", "message": "custom_error"}}));
    }

    #[test]
    fn test_json_error_with_message() {
        let err = json_error_with_message("bad_request", "Invalid input");
        assert_eq!(
            err,
            serde_json::json!({"error": {"code": "bad_request", "message": "Invalid input"}})
        );
    }

    #[test]
    fn test_pick_verification_token() {
        assert_eq!(pick_verification_token(Some("form"), Some("hdr")), Some("form"));
        assert_eq!(pick_verification_token(None, Some("hdr")), Some("hdr"));
        assert_eq!(pick_verification_token(Some("  "), Some("hdr")), Some("hdr"));
        assert_eq!(pick_verification_token(Some(""), None), None);
        assert_eq!(pick_verification_token(None, None), None);
    }

    #[test]
    fn test_is_truthy() {
        assert!(is_truthy("1"));
        assert!(is_truthy("TRUE"));
        assert!(is_truthy(" yes "));
        assert!(!is_truthy("0"));
        assert!(!is_truthy(""));
        assert!(!is_truthy("nope"));
    }
}
