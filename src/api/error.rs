/*!
JSON error responses
*/
use crate::error::{Error, ProviderError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// The body of every error response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    /// Machine readable error code, e.g. `NOT_FOUND`
    pub code: String,
    /// Human readable message
    pub message: String,
    /// Unix timestamp of the failure
    pub timestamp: i64,
}

impl ApiErrorResponse {
    /// An error response stamped with the current time
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// An error on its way to becoming a response
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status
    pub status: StatusCode,
    /// Body
    pub body: ApiErrorResponse,
}

impl ApiError {
    /// An error with an explicit status and code
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ApiErrorResponse::new(code, message),
        }
    }
}

/// Result type of handlers
pub type ApiResult<T> = Result<T, ApiError>;

/// The status and code a pipeline error maps to
pub fn classify(err: &Error) -> (StatusCode, &'static str) {
    match err {
        Error::Provider(provider) => match provider {
            ProviderError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
            ProviderError::InvalidSymbol(_) => (StatusCode::BAD_REQUEST, "INVALID_SYMBOL"),
            ProviderError::InvalidInterval(_) => (StatusCode::BAD_REQUEST, "INVALID_INTERVAL"),
            ProviderError::MissingApiKey => (StatusCode::INTERNAL_SERVER_ERROR, "API_KEY_MISSING"),
            ProviderError::Malformed(_)
            | ProviderError::Http(_)
            | ProviderError::Csv(_)
            | ProviderError::Io(_) => (StatusCode::BAD_GATEWAY, "PROVIDER_ERROR"),
        },
        Error::InsufficientData { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "INSUFFICIENT_DATA"),
        Error::ModelNotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        Error::TrainingConflict(_) => (StatusCode::CONFLICT, "TRAINING_IN_PROGRESS"),
        Error::DeletionInProgress(_) => (StatusCode::CONFLICT, "DELETE_IN_PROGRESS"),
        Error::ArtifactsChanged(_) => (StatusCode::CONFLICT, "MODEL_UPDATING"),
        Error::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
        Error::MissingColumn(_)
        | Error::FeatureMismatch(_)
        | Error::IncompleteArtifacts { .. }
        | Error::NonFiniteLoss { .. }
        | Error::NonFiniteMetrics(_)
        | Error::Indicator(_)
        | Error::Torch(_)
        | Error::Io(_)
        | Error::Serde(_)
        | Error::Task(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let (status, code) = classify(&err);
        if status.is_server_error() {
            error!(%err, code, "request failed");
        } else {
            warn!(%err, code, "request rejected");
        }
        ApiError::new(status, code, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
