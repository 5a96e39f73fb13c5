//! Shared JSON bodies for the shard API
//!
//! Errors carry a typed kind so clients can tell a rejected request from a
//! corrupted shard without parsing the message text.

use serde::{Deserialize, Serialize};

/// Class of failure a shard can report.
///
/// Unknown ids are deliberately not an error kind: they answer 200 with a
/// null payload. Unreachable peers never appear here either; only the
/// orchestrator sees those.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing mandatory field or malformed predicate; rejected at the
    /// boundary.
    BadInput,
    /// A fatal storage invariant violation (corrupt tag, short read,
    /// non-terminating walk), surfaced unmodified.
    InvariantViolation,
}

/// JSON error body emitted with a non-200 status.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorKind,
    pub message: String,
}

impl ErrorResponse {
    pub fn bad_input(message: impl Into<String>) -> Self {
        Self {
            error: ErrorKind::BadInput,
            message: message.into(),
        }
    }

    pub fn invariant_violation(message: impl Into<String>) -> Self {
        Self {
            error: ErrorKind::InvariantViolation,
            message: message.into(),
        }
    }
}

/// Body returned by operations that only acknowledge success
#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub status: String,
}

impl AckResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_distinguishable() {
        let rejected = ErrorResponse::bad_input("node_id was not provided");
        let corrupt = ErrorResponse::invariant_violation("unknown property type tag -9");
        assert_eq!(rejected.error, ErrorKind::BadInput);
        assert_eq!(corrupt.error, ErrorKind::InvariantViolation);
        assert_ne!(rejected.error, corrupt.error);
    }

    #[test]
    fn test_error_kind_wire_form_is_snake_case() {
        let body = ErrorResponse::bad_input("missing query_id");
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"error\":\"bad_input\""));

        let back: ErrorResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.error, ErrorKind::BadInput);
        assert_eq!(back.message, "missing query_id");
    }

    #[test]
    fn test_ack_body() {
        let json = serde_json::to_string(&AckResponse::ok()).unwrap();
        assert_eq!(json, "{\"status\":\"ok\"}");
    }
}
