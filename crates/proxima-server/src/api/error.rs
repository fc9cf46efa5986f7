//! API error types and response handling.
//!
//! Every handler returns [`ApiResult`]; engine errors convert through
//! [`ProximaError::http_status_code`] into a JSON [`ErrorResponse`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use proxima_core::ProximaError;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Unified API error type.
#[derive(Debug, Clone)]
pub enum ApiError {
    /// 400 Bad Request - malformed input from the caller.
    BadRequest {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 404 Not Found - nothing to return yet.
    NotFound {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 410 Gone - a delayed delivery missed its window.
    Gone {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 422 Unprocessable Entity - well-formed but semantically invalid.
    UnprocessableEntity {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 500 Internal Server Error - persistence or I/O failure.
    InternalError {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Optional details for the log.
        details: Option<String>,
    },

    /// 502 Bad Gateway - the resolver misbehaved.
    BadGateway {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 503 Service Unavailable - resolver unreachable and nothing cached.
    ServiceUnavailable {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Whether the caller should retry later.
        retryable: bool,
    },
}

/// Standard JSON error response body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "NO_CACHE_AVAILABLE",
    "message": "No layout available: the resolver could not be reached and nothing is cached",
    "details": null
}))]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g., "INVALID_BEACON_ID").
    #[schema(example = "INVALID_BEACON_ID")]
    pub error: String,

    /// Human-readable error message.
    #[schema(example = "Invalid beacon id: lobby")]
    pub message: String,

    /// Optional additional details.
    #[schema(nullable)]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    fn new(error: String, message: String) -> Self {
        Self {
            error,
            message,
            details: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::BadRequest { error_code, message } => {
                (StatusCode::BAD_REQUEST, ErrorResponse::new(error_code, message))
            }
            Self::NotFound { error_code, message } => {
                (StatusCode::NOT_FOUND, ErrorResponse::new(error_code, message))
            }
            Self::Gone { error_code, message } => {
                (StatusCode::GONE, ErrorResponse::new(error_code, message))
            }
            Self::UnprocessableEntity { error_code, message } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorResponse::new(error_code, message),
            ),
            Self::InternalError {
                error_code,
                message,
                details,
            } => {
                tracing::error!(
                    error_code = %error_code,
                    message = %message,
                    details = ?details,
                    "Internal server error"
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse {
                        error: error_code,
                        message,
                        details: details.map(|d| serde_json::json!(d)),
                    },
                )
            }
            Self::BadGateway { error_code, message } => {
                (StatusCode::BAD_GATEWAY, ErrorResponse::new(error_code, message))
            }
            Self::ServiceUnavailable {
                error_code,
                message,
                retryable,
            } => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorResponse {
                    error: error_code,
                    message,
                    details: Some(serde_json::json!({ "retryable": retryable })),
                },
            ),
        };

        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest { message, .. } => write!(f, "Bad Request: {message}"),
            Self::NotFound { message, .. } => write!(f, "Not Found: {message}"),
            Self::Gone { message, .. } => write!(f, "Gone: {message}"),
            Self::UnprocessableEntity { message, .. } => {
                write!(f, "Unprocessable Entity: {message}")
            }
            Self::InternalError { message, .. } => write!(f, "Internal Error: {message}"),
            Self::BadGateway { message, .. } => write!(f, "Bad Gateway: {message}"),
            Self::ServiceUnavailable { message, .. } => {
                write!(f, "Service Unavailable: {message}")
            }
        }
    }
}

impl std::error::Error for ApiError {}

impl From<ProximaError> for ApiError {
    fn from(err: ProximaError) -> Self {
        let error_code = err.error_code().to_string();
        let message = err.to_string();

        match err.http_status_code() {
            400 => Self::BadRequest { error_code, message },
            404 => Self::NotFound { error_code, message },
            410 => Self::Gone { error_code, message },
            422 => Self::UnprocessableEntity { error_code, message },
            502 => Self::BadGateway { error_code, message },
            503 => Self::ServiceUnavailable {
                error_code,
                message,
                retryable: err.is_recoverable() || err.is_surfaced(),
            },
            _ => Self::InternalError {
                error_code,
                message,
                details: None,
            },
        }
    }
}

impl From<proxima_core::BeaconIdError> for ApiError {
    fn from(err: proxima_core::BeaconIdError) -> Self {
        Self::from(ProximaError::from(err))
    }
}
