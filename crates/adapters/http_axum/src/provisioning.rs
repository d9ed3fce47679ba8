//! Soft-AP provisioning channel.
//!
//! While the device has no usable network it raises a temporary access point
//! and serves a configuration endpoint on it:
//!
//! ```text
//! POST /provision  { "ssid": "...", "passphrase": "...", "controller": { ... } }
//!   202 { "status": "accepted" }
//!   400 { "status": "rejected", "reason": "..." }
//! ```
//!
//! The endpoint never interprets the payload itself. It hands it to the
//! connectivity manager and relays the verdict, so a malformed payload is
//! never partially applied.
//!
//! With local control enabled the same access point also accepts manual
//! overrides, so an operator standing next to an offline chamber can still
//! drive it:
//!
//! ```text
//! POST   /control/overrides             { "actuator": "heater", "state": true, "ttl_secs": 600 }
//! DELETE /control/overrides/{actuator}
//! ```
//!
//! Both are queued for the controller as manual commands and answer like the
//! diagnostic API's override routes.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use sporekeeper_app::ports::{AccessPoint, ProvisioningChannel, ProvisioningReply, ProvisioningRequest};
use sporekeeper_app::queue::ControlQueue;
use sporekeeper_domain::actuator::{Actuator, ControlSource};
use sporekeeper_domain::command::{Command, CommandKind};
use sporekeeper_domain::credentials::ProvisioningPayload;
use sporekeeper_domain::error::SporeKeeperError;
use sporekeeper_domain::time::now;

use crate::api::overrides::{CreateOverrideRequest, OverrideResponse};
use crate::error::ApiError;

/// Where and how the temporary endpoint is served.
#[derive(Debug, Clone)]
pub struct SoftApSettings {
    /// Network name of the temporary access point.
    pub ssid: String,
    pub bind: SocketAddr,
    /// How long a request waits for the connectivity manager's verdict.
    pub reply_timeout: Duration,
}

struct Running {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// [`ProvisioningChannel`] over a temporary access point plus HTTP endpoint.
pub struct SoftApProvisioning<A> {
    access_point: A,
    settings: SoftApSettings,
    local_control: Option<ControlQueue>,
    running: Mutex<Option<Running>>,
}

impl<A: AccessPoint> SoftApProvisioning<A> {
    pub fn new(access_point: A, settings: SoftApSettings) -> Self {
        Self {
            access_point,
            settings,
            local_control: None,
            running: Mutex::new(None),
        }
    }

    /// Also serve the manual override routes, feeding `queue`.
    #[must_use]
    pub fn with_local_control(mut self, queue: ControlQueue) -> Self {
        self.local_control = Some(queue);
        self
    }

    fn is_open(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl<A: AccessPoint> ProvisioningChannel for SoftApProvisioning<A> {
    fn kind(&self) -> &'static str {
        "soft_ap"
    }

    async fn open(&self, requests: mpsc::Sender<ProvisioningRequest>) -> Result<(), SporeKeeperError> {
        if self.is_open() {
            return Ok(());
        }
        self.access_point.start(&self.settings.ssid).await?;
        let listener = match TcpListener::bind(self.settings.bind).await {
            Ok(listener) => listener,
            Err(err) => {
                if let Err(stop_err) = self.access_point.stop().await {
                    tracing::warn!(error = %stop_err, "failed to stop access point");
                }
                return Err(SporeKeeperError::network(err));
            }
        };

        let app = routes(
            requests,
            self.settings.reply_timeout,
            self.local_control.clone(),
        );
        let (shutdown, signal) = oneshot::channel();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                signal.await.ok();
            });
            if let Err(err) = server.await {
                tracing::error!(error = %err, "provisioning endpoint failed");
            }
        });
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Running { shutdown, task });

        tracing::info!(
            ssid = %self.settings.ssid,
            addr = %self.settings.bind,
            local_control = self.local_control.is_some(),
            "provisioning endpoint open"
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), SporeKeeperError> {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            return Ok(());
        };
        running.shutdown.send(()).ok();
        if let Err(err) = running.task.await {
            tracing::warn!(error = %err, "provisioning endpoint task ended abnormally");
        }
        self.access_point.stop().await?;
        tracing::info!("provisioning endpoint closed");
        Ok(())
    }
}

#[derive(Clone)]
struct ProvisioningContext {
    requests: mpsc::Sender<ProvisioningRequest>,
    reply_timeout: Duration,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ProvisionBody {
    Accepted,
    Rejected { reason: String },
    Unavailable { reason: String },
}

/// Possible responses from the provisioning endpoint.
enum ProvisionResponse {
    Accepted,
    Rejected(String),
    Unavailable(&'static str),
}

impl IntoResponse for ProvisionResponse {
    fn into_response(self) -> Response {
        match self {
            Self::Accepted => (StatusCode::ACCEPTED, Json(ProvisionBody::Accepted)).into_response(),
            Self::Rejected(reason) => {
                (StatusCode::BAD_REQUEST, Json(ProvisionBody::Rejected { reason })).into_response()
            }
            Self::Unavailable(reason) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ProvisionBody::Unavailable {
                    reason: reason.to_string(),
                }),
            )
                .into_response(),
        }
    }
}

#[derive(Clone)]
struct ControlContext {
    queue: ControlQueue,
    reply_timeout: Duration,
}

impl ControlContext {
    async fn submit(&self, kind: CommandKind) -> OverrideResponse {
        tracing::info!(command = kind.name(), "manual command over provisioning endpoint");
        self.queue
            .submit(
                Command::local(kind, now()),
                ControlSource::Manual,
                self.reply_timeout,
            )
            .await
            .into()
    }
}

fn routes(
    requests: mpsc::Sender<ProvisioningRequest>,
    reply_timeout: Duration,
    local_control: Option<ControlQueue>,
) -> Router {
    let router = Router::new()
        .route("/provision", post(provision))
        .with_state(ProvisioningContext {
            requests,
            reply_timeout,
        });
    let router = match local_control {
        Some(queue) => router.merge(
            Router::new()
                .route("/control/overrides", post(set_override))
                .route("/control/overrides/{actuator}", delete(release_override))
                .with_state(ControlContext {
                    queue,
                    reply_timeout,
                }),
        ),
        None => router,
    };
    router.layer(TraceLayer::new_for_http())
}

/// `POST /provision`
async fn provision(
    State(ctx): State<ProvisioningContext>,
    Json(payload): Json<ProvisioningPayload>,
) -> ProvisionResponse {
    let (reply, verdict) = oneshot::channel();
    if ctx
        .requests
        .send(ProvisioningRequest { payload, reply })
        .await
        .is_err()
    {
        return ProvisionResponse::Unavailable("provisioning is closed");
    }
    match tokio::time::timeout(ctx.reply_timeout, verdict).await {
        Ok(Ok(ProvisioningReply::Accepted)) => ProvisionResponse::Accepted,
        Ok(Ok(ProvisioningReply::Rejected(reason))) => ProvisionResponse::Rejected(reason),
        Ok(Err(_)) => ProvisionResponse::Unavailable("provisioning is closed"),
        Err(_) => ProvisionResponse::Unavailable("no verdict in time"),
    }
}

/// `POST /control/overrides`
async fn set_override(
    State(ctx): State<ControlContext>,
    Json(req): Json<CreateOverrideRequest>,
) -> Result<OverrideResponse, ApiError> {
    let kind = CommandKind::SetOverride {
        actuator: req.actuator,
        state: req.state,
        ttl_secs: req.ttl_secs,
    };
    kind.validate()?;
    Ok(ctx.submit(kind).await)
}

/// `DELETE /control/overrides/{actuator}`
async fn release_override(
    State(ctx): State<ControlContext>,
    Path(actuator): Path<String>,
) -> Result<OverrideResponse, ApiError> {
    let actuator = Actuator::from_str(&actuator)?;
    Ok(ctx.submit(CommandKind::ReleaseOverride { actuator }).await)
}
