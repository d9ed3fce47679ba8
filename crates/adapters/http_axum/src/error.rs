//! HTTP error response mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use sporekeeper_domain::error::SporeKeeperError;

/// JSON error body returned by API endpoints.
#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Maps [`SporeKeeperError`] to an HTTP response with appropriate status code.
#[derive(Debug)]
pub struct ApiError(SporeKeeperError);

impl<E: Into<SporeKeeperError>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            SporeKeeperError::Validation(err) => (StatusCode::BAD_REQUEST, err.to_string()),
            SporeKeeperError::NotFound(err) => (StatusCode::NOT_FOUND, err.to_string()),
            SporeKeeperError::Transition(err) => (StatusCode::CONFLICT, err.to_string()),
            SporeKeeperError::Sensor(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
            SporeKeeperError::Actuator(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
            SporeKeeperError::Network(err) => {
                tracing::warn!(error = %err, "network error");
                (StatusCode::SERVICE_UNAVAILABLE, "service unavailable".to_string())
            }
            SporeKeeperError::Storage(err) => {
                tracing::error!(error = %err, "storage error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
            SporeKeeperError::Protocol(err) => {
                tracing::error!(error = %err, "stored payload could not be decoded");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}
