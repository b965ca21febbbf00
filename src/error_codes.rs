//! Error codes returned in run API error bodies.
//!
//! Codes serialize as `SCREAMING_SNAKE_CASE` strings (e.g. `"RUN_NOT_FOUND"`)
//! and each one maps onto exactly one HTTP status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured error codes for the run API.
///
/// Use [`description()`](ErrorCode::description) for a human-readable
/// explanation and [`http_status()`](ErrorCode::http_status) for the status
/// line the HTTP surface answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Authentication errors
    Unauthorized,
    InvalidRunToken,

    // Validation errors
    InvalidInput,
    PayloadTooLarge,

    // Run errors
    RunNotFound,

    // Server errors
    InternalError,
    StorageError,
}

impl ErrorCode {
    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Unauthorized => "No verified caller identity was supplied with this request.",
            Self::InvalidRunToken => {
                "The run token does not match this run. Use the token returned when the run started."
            }
            Self::InvalidInput => {
                "The request body is malformed or a field is out of range. Check the field named in the error."
            }
            Self::PayloadTooLarge => {
                "The run state blob exceeds the maximum allowed size. Send a smaller state."
            }
            Self::RunNotFound => {
                "No in-progress run with this id exists for the caller. It may have ended already."
            }
            Self::InternalError => "An internal server error occurred. Please retry the request.",
            Self::StorageError => {
                "A storage error occurred while processing your request. Please retry the request."
            }
        }
    }

    /// HTTP status code carried by responses with this error code.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::InvalidRunToken => 403,
            Self::InvalidInput => 400,
            Self::PayloadTooLarge => 413,
            Self::RunNotFound => 404,
            Self::InternalError | Self::StorageError => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::InvalidRunToken).unwrap();
        assert_eq!(json, "\"INVALID_RUN_TOKEN\"");
        let json = serde_json::to_string(&ErrorCode::RunNotFound).unwrap();
        assert_eq!(json, "\"RUN_NOT_FOUND\"");
    }

    #[test]
    fn statuses_follow_the_error_taxonomy() {
        assert_eq!(ErrorCode::Unauthorized.http_status(), 401);
        assert_eq!(ErrorCode::InvalidInput.http_status(), 400);
        assert_eq!(ErrorCode::RunNotFound.http_status(), 404);
        assert_eq!(ErrorCode::InvalidRunToken.http_status(), 403);
        assert_eq!(ErrorCode::PayloadTooLarge.http_status(), 413);
        assert_eq!(ErrorCode::StorageError.http_status(), 500);
    }

    #[test]
    fn display_uses_description() {
        let code = ErrorCode::PayloadTooLarge;
        assert_eq!(code.to_string(), code.description());
    }
}
