//! JSON handlers for the device snapshot.

use axum::Json;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use sporekeeper_app::ports::{CommandLog, ConnectivityLog, Journal};
use sporekeeper_app::services::diagnostics::{ActuatorReport, StatusReport};
use sporekeeper_domain::command::Command;

use crate::error::ApiError;
use crate::state::AppState;

/// Possible responses from the status endpoint.
pub enum StatusResponse {
    Ok(Json<StatusReport>),
}

impl IntoResponse for StatusResponse {
    fn into_response(self) -> Response {
        match self {
            Self::Ok(json) => json.into_response(),
        }
    }
}

/// Possible responses from the actuators endpoint.
pub enum ActuatorsResponse {
    Ok(Json<Vec<ActuatorReport>>),
}

impl IntoResponse for ActuatorsResponse {
    fn into_response(self) -> Response {
        match self {
            Self::Ok(json) => json.into_response(),
        }
    }
}

/// Possible responses from the commands endpoint.
pub enum CommandsResponse {
    Ok(Json<Vec<Command>>),
}

impl IntoResponse for CommandsResponse {
    fn into_response(self) -> Response {
        match self {
            Self::Ok(json) => json.into_response(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// `GET /api/status`: phase, mode, connectivity, faults and sync backlog.
pub async fn status<J, L, C>(
    State(state): State<AppState<J, L, C>>,
) -> Result<StatusResponse, ApiError>
where
    J: Journal + 'static,
    L: ConnectivityLog + 'static,
    C: CommandLog + 'static,
{
    let report = state.diagnostics.status().await?;
    Ok(StatusResponse::Ok(Json(report)))
}

/// `GET /api/actuators`
pub async fn actuators<J, L, C>(State(state): State<AppState<J, L, C>>) -> ActuatorsResponse
where
    J: Journal + 'static,
    L: ConnectivityLog + 'static,
    C: CommandLog + 'static,
{
    ActuatorsResponse::Ok(Json(state.diagnostics.actuators()))
}

/// `GET /api/commands?limit=`: most recent commands, newest first.
pub async fn commands<J, L, C>(
    State(state): State<AppState<J, L, C>>,
    Query(query): Query<LimitQuery>,
) -> Result<CommandsResponse, ApiError>
where
    J: Journal + 'static,
    L: ConnectivityLog + 'static,
    C: CommandLog + 'static,
{
    let commands = state.diagnostics.commands(query.limit).await?;
    Ok(CommandsResponse::Ok(Json(commands)))
}
