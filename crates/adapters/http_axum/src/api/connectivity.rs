//! JSON handlers for connectivity state and reset.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use sporekeeper_app::ports::{CommandLog, ConnectivityLog, Journal};
use sporekeeper_app::services::diagnostics::ConnectivityReport;

use crate::error::ApiError;
use crate::state::AppState;

/// Possible responses from the connectivity endpoint.
pub enum GetResponse {
    Ok(Json<ConnectivityReport>),
}

impl IntoResponse for GetResponse {
    fn into_response(self) -> Response {
        match self {
            Self::Ok(json) => json.into_response(),
        }
    }
}

/// Possible responses from the reset endpoint.
pub enum ResetResponse {
    NoContent,
}

impl IntoResponse for ResetResponse {
    fn into_response(self) -> Response {
        match self {
            Self::NoContent => StatusCode::NO_CONTENT.into_response(),
        }
    }
}

/// `GET /api/connectivity`: current state and recent transitions.
pub async fn get<J, L, C>(
    State(state): State<AppState<J, L, C>>,
) -> Result<GetResponse, ApiError>
where
    J: Journal + 'static,
    L: ConnectivityLog + 'static,
    C: CommandLog + 'static,
{
    let report = state.diagnostics.connectivity().await?;
    Ok(GetResponse::Ok(Json(report)))
}

/// `POST /api/connectivity/reset`: forget the network, back to provisioning.
pub async fn reset<J, L, C>(
    State(state): State<AppState<J, L, C>>,
) -> Result<ResetResponse, ApiError>
where
    J: Journal + 'static,
    L: ConnectivityLog + 'static,
    C: CommandLog + 'static,
{
    state.diagnostics.reset_connectivity().await?;
    Ok(ResetResponse::NoContent)
}
