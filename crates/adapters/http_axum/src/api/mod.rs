//! JSON diagnostic API handler modules.

#[allow(clippy::missing_errors_doc)]
pub mod connectivity;
#[allow(clippy::missing_errors_doc)]
pub mod journal;
#[allow(clippy::missing_errors_doc)]
pub mod overrides;
#[allow(clippy::missing_errors_doc)]
pub mod status;

use axum::Router;
use axum::routing::{delete, get, post};

use sporekeeper_app::ports::{CommandLog, ConnectivityLog, Journal};

use crate::state::AppState;

/// Build the `/api` sub-router.
pub fn routes<J, L, C>() -> Router<AppState<J, L, C>>
where
    J: Journal + 'static,
    L: ConnectivityLog + 'static,
    C: CommandLog + 'static,
{
    Router::new()
        // Device
        .route("/status", get(status::status::<J, L, C>))
        .route("/actuators", get(status::actuators::<J, L, C>))
        .route("/commands", get(status::commands::<J, L, C>))
        // Journal
        .route("/decisions", get(journal::decisions::<J, L, C>))
        .route("/dead-letters", get(journal::dead_letters::<J, L, C>))
        .route(
            "/dead-letters/requeue",
            post(journal::requeue::<J, L, C>),
        )
        // Connectivity
        .route("/connectivity", get(connectivity::get::<J, L, C>))
        .route(
            "/connectivity/reset",
            post(connectivity::reset::<J, L, C>),
        )
        // Overrides
        .route("/overrides", post(overrides::create::<J, L, C>))
        .route(
            "/overrides/{actuator}",
            delete(overrides::release::<J, L, C>),
        )
}
