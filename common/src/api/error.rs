//! The typed error surface of every public operation.
//!
//! Validation and precondition failures travel to the client unchanged as a
//! structured [`ErrorResponse`]. Internal failures are logged where they are
//! converted and surface only a generic message.

use std::fmt::{self, Display};

use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

/// Every public operation fails with exactly one of these kinds.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Malformed or out-of-range input (400-equivalent).
    Validation,
    /// Missing or invalid credentials (401).
    Unauthenticated,
    /// Authenticated but not allowed to act on this resource (403).
    Forbidden,
    /// The referenced entity does not exist (404).
    NotFound,
    /// Lost a race or hit a uniqueness constraint (409).
    Conflict,
    /// The entity exists but is in a state that forbids this operation (412).
    PreconditionFailed,
    /// Database, key-value, or transient store failure (500).
    Internal,
    /// A required collaborator (driver presence, location) is offline (503).
    Unavailable,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::PreconditionFailed => "PRECONDITION_FAILED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Get the HTTP status code returned for a particular error.
pub trait ToHttpStatus {
    fn to_http_status(&self) -> StatusCode;
}

impl ToHttpStatus for ErrorKind {
    fn to_http_status(&self) -> StatusCode {
        match self {
            Self::Validation => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Specific condition codes carried on top of the generic kind, so clients
/// can branch without string-matching messages.
pub mod codes {
    /// Another acceptor currently holds the trip lock.
    pub const TRIP_LOCKED: &str = "TRIP_LOCKED";
    /// The trip was already matched to some driver.
    pub const TRIP_ALREADY_ACCEPTED: &str = "TRIP_ALREADY_ACCEPTED";
    /// The trip is no longer in a state where it can be accepted.
    pub const TRIP_NOT_AVAILABLE: &str = "TRIP_NOT_AVAILABLE";
    /// The accepting driver has no known location.
    pub const DRIVER_LOCATION_MISSING: &str = "DRIVER_LOCATION_MISSING";
    /// The driver is not in the online set.
    pub const DRIVER_OFFLINE: &str = "DRIVER_OFFLINE";
    /// The caller already has an active trip.
    pub const ACTIVE_TRIP_EXISTS: &str = "ACTIVE_TRIP_EXISTS";
    /// The caller is not a participant of this trip.
    pub const ACCESS_DENIED: &str = "ACCESS_DENIED";
}

/// A typed operation error: a kind, an optional specific code, a message,
/// and optional structured data for the client.
#[derive(Clone, Debug, Error)]
#[error("{kind}: {msg}")]
pub struct ApiError {
    pub kind: ErrorKind,
    /// A specific condition code; defaults to the kind's name on the wire.
    pub code: Option<&'static str>,
    pub msg: String,
    pub data: Option<serde_json::Value>,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            msg: msg.into(),
            data: None,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, msg)
    }

    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthenticated, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self {
            code: Some(codes::ACCESS_DENIED),
            ..Self::new(ErrorKind::Forbidden, msg)
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn conflict(code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            ..Self::new(ErrorKind::Conflict, msg)
        }
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::PreconditionFailed, msg)
    }

    pub fn unavailable(code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            ..Self::new(ErrorKind::Unavailable, msg)
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The specific code if set, otherwise the kind's name.
    pub fn code_str(&self) -> &'static str {
        self.code.unwrap_or(self.kind.as_str())
    }
}

impl ToHttpStatus for ApiError {
    fn to_http_status(&self) -> StatusCode {
        self.kind.to_http_status()
    }
}

/// Internal failures (store errors, poisoned invariants) are logged with
/// their full chain at the conversion point and surface a generic message.
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        error!("internal error: {err:#}");
        Self::new(ErrorKind::Internal, "internal error")
    }
}

/// The JSON-serialized representation sent across the wire. It is the only
/// error struct clients ever see.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorKind,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl From<ApiError> for ErrorResponse {
    fn from(err: ApiError) -> Self {
        Self {
            error: err.kind,
            code: err.code_str().to_string(),
            message: err.msg,
            data: err.data,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ErrorKind::Validation.to_http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ErrorKind::Conflict.to_http_status(), StatusCode::CONFLICT);
        assert_eq!(
            ErrorKind::Unavailable.to_http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn conflict_response_carries_specific_code() {
        let err = ApiError::conflict(
            codes::TRIP_ALREADY_ACCEPTED,
            "trip already accepted by another driver",
        );
        let resp = ErrorResponse::from(err);
        assert_eq!(resp.error, ErrorKind::Conflict);
        assert_eq!(resp.code, "TRIP_ALREADY_ACCEPTED");

        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["error"], "CONFLICT");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn internal_conversion_hides_details() {
        let err: ApiError =
            anyhow::anyhow!("connection refused (os error 111)").into();
        let resp = ErrorResponse::from(err);
        assert_eq!(resp.message, "internal error");
    }
}
