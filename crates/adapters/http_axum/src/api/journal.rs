//! JSON handlers for journal queries and dead-letter requeue.

use axum::Json;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use sporekeeper_app::ports::{CommandLog, ConnectivityLog, Journal};
use sporekeeper_domain::decision::Decision;
use sporekeeper_domain::error::ValidationError;
use sporekeeper_domain::sync::{EntityType, JournalEntry};
use sporekeeper_domain::time::{Timestamp, now};

use crate::error::ApiError;
use crate::state::AppState;

const MAX_LIMIT: usize = 1_000;

/// Possible responses from the decisions endpoint.
pub enum DecisionsResponse {
    Ok(Json<Vec<Decision>>),
}

impl IntoResponse for DecisionsResponse {
    fn into_response(self) -> Response {
        match self {
            Self::Ok(json) => json.into_response(),
        }
    }
}

/// Possible responses from the dead-letters endpoint.
pub enum DeadLettersResponse {
    Ok(Json<Vec<JournalEntry>>),
}

impl IntoResponse for DeadLettersResponse {
    fn into_response(self) -> Response {
        match self {
            Self::Ok(json) => json.into_response(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RequeueBody {
    pub requeued: u64,
}

/// Possible responses from the requeue endpoint.
pub enum RequeueResponse {
    Ok(Json<RequeueBody>),
}

impl IntoResponse for RequeueResponse {
    fn into_response(self) -> Response {
        match self {
            Self::Ok(json) => json.into_response(),
        }
    }
}

/// `from` defaults to one day before `to`, `to` defaults to now.
#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub from: Option<Timestamp>,
    pub to: Option<Timestamp>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct RequeueQuery {
    pub entity_type: Option<EntityType>,
}

/// `GET /api/decisions?from=&to=&limit=`: decisions in `[from, to)`.
pub async fn decisions<J, L, C>(
    State(state): State<AppState<J, L, C>>,
    Query(query): Query<RangeQuery>,
) -> Result<DecisionsResponse, ApiError>
where
    J: Journal + 'static,
    L: ConnectivityLog + 'static,
    C: CommandLog + 'static,
{
    let to = query.to.unwrap_or_else(now);
    let from = query.from.unwrap_or(to - chrono::Duration::days(1));
    if from > to {
        return Err(ValidationError::InvertedRange.into());
    }
    let limit = query.limit.unwrap_or(MAX_LIMIT).min(MAX_LIMIT);
    let decisions = state.diagnostics.decisions(from, to, limit).await?;
    Ok(DecisionsResponse::Ok(Json(decisions)))
}

/// `GET /api/dead-letters?limit=`
pub async fn dead_letters<J, L, C>(
    State(state): State<AppState<J, L, C>>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<DeadLettersResponse, ApiError>
where
    J: Journal + 'static,
    L: ConnectivityLog + 'static,
    C: CommandLog + 'static,
{
    let limit = query.limit.unwrap_or(MAX_LIMIT).min(MAX_LIMIT);
    let entries = state.diagnostics.dead_letters(limit).await?;
    Ok(DeadLettersResponse::Ok(Json(entries)))
}

/// `POST /api/dead-letters/requeue?entity_type=`: back to `pending`.
pub async fn requeue<J, L, C>(
    State(state): State<AppState<J, L, C>>,
    Query(query): Query<RequeueQuery>,
) -> Result<RequeueResponse, ApiError>
where
    J: Journal + 'static,
    L: ConnectivityLog + 'static,
    C: CommandLog + 'static,
{
    let requeued = state
        .diagnostics
        .requeue_dead_letters(query.entity_type)
        .await?;
    Ok(RequeueResponse::Ok(Json(RequeueBody { requeued })))
}
