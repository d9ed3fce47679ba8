//! JSON handlers for manual actuator overrides.
//!
//! The controller answers every override with a delivery state. `applied`
//! maps to 200, `received` (still queued) to 202, `rejected` to 409 and
//! `dropped` (never reached the controller) to 503.

use std::str::FromStr;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use sporekeeper_app::ports::{CommandLog, ConnectivityLog, Journal};
use sporekeeper_app::queue::CommandOutcome;
use sporekeeper_domain::actuator::Actuator;
use sporekeeper_domain::command::DeliveryState;

use crate::error::ApiError;
use crate::state::AppState;

/// Request body for forcing an actuator.
#[derive(Debug, Deserialize)]
pub struct CreateOverrideRequest {
    pub actuator: Actuator,
    pub state: bool,
    pub ttl_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct OutcomeBody {
    pub state: DeliveryState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Possible responses from both override endpoints.
pub enum OverrideResponse {
    Applied(Json<OutcomeBody>),
    Queued(Json<OutcomeBody>),
    Rejected(Json<OutcomeBody>),
    Dropped(Json<OutcomeBody>),
}

impl From<CommandOutcome> for OverrideResponse {
    fn from(outcome: CommandOutcome) -> Self {
        let body = Json(OutcomeBody {
            state: outcome.state,
            reason: outcome.reason,
        });
        match outcome.state {
            DeliveryState::Applied => Self::Applied(body),
            DeliveryState::Received => Self::Queued(body),
            DeliveryState::Rejected | DeliveryState::Duplicate => Self::Rejected(body),
            DeliveryState::Dropped => Self::Dropped(body),
        }
    }
}

impl IntoResponse for OverrideResponse {
    fn into_response(self) -> Response {
        match self {
            Self::Applied(json) => json.into_response(),
            Self::Queued(json) => (StatusCode::ACCEPTED, json).into_response(),
            Self::Rejected(json) => (StatusCode::CONFLICT, json).into_response(),
            Self::Dropped(json) => (StatusCode::SERVICE_UNAVAILABLE, json).into_response(),
        }
    }
}

/// `POST /api/overrides`
pub async fn create<J, L, C>(
    State(state): State<AppState<J, L, C>>,
    Json(req): Json<CreateOverrideRequest>,
) -> Result<OverrideResponse, ApiError>
where
    J: Journal + 'static,
    L: ConnectivityLog + 'static,
    C: CommandLog + 'static,
{
    let outcome = state
        .diagnostics
        .set_override(req.actuator, req.state, req.ttl_secs)
        .await?;
    Ok(outcome.into())
}

/// `DELETE /api/overrides/{actuator}`: hand the actuator back to automation.
pub async fn release<J, L, C>(
    State(state): State<AppState<J, L, C>>,
    Path(actuator): Path<String>,
) -> Result<OverrideResponse, ApiError>
where
    J: Journal + 'static,
    L: ConnectivityLog + 'static,
    C: CommandLog + 'static,
{
    let actuator = Actuator::from_str(&actuator)?;
    Ok(state.diagnostics.release_override(actuator).await.into())
}
