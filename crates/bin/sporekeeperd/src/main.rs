//! # sporekeeperd: chamber agent daemon
//!
//! Composition root that wires all adapters together and runs the agent.
//!
//! ## Responsibilities
//! - Load configuration (file plus env overrides) and initialise tracing
//! - Open the `SQLite` store, run migrations and recover in-flight sync records
//! - Restore actuator states, phase, credentials and connectivity history
//! - Spawn the long-running loops: acquisition, control, sync, connectivity
//!   and the command channel
//! - Serve the local diagnostic API
//! - Stop every loop on SIGINT/SIGTERM and close the store cleanly
//!
//! ## Dependency rule
//! This is the **only** crate that depends on all other crates.
//! It is the wiring layer; no domain logic belongs here.

mod config;
mod provisioning;

use std::future::IntoFuture;

use anyhow::Context;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use sporekeeper_adapter_http_axum::router;
use sporekeeper_adapter_http_axum::state::AppState;
use sporekeeper_adapter_ingest_reqwest::IngestClient;
use sporekeeper_adapter_mqtt::MqttTransport;
use sporekeeper_adapter_storage_sqlite_sqlx::{
    Config as StorageConfig, SqliteActuatorStateRepository, SqliteCommandLog,
    SqliteConnectivityLog, SqliteJournal, SqliteSettingsStore,
};
use sporekeeper_adapter_virtual::{Chamber, VirtualActuators, VirtualNetwork, VirtualSensors};
use sporekeeper_app::ports::{Journal, SettingsStore};
use sporekeeper_app::queue::ControlQueue;
use sporekeeper_app::services::acquisition::SensorAcquisition;
use sporekeeper_app::services::actuator_service::ActuatorService;
use sporekeeper_app::services::command_channel::CommandChannel;
use sporekeeper_app::services::connectivity_manager::ConnectivityManager;
use sporekeeper_app::services::controller::AutomationController;
use sporekeeper_app::services::diagnostics::DiagnosticsService;
use sporekeeper_app::services::sync_manager::SyncManager;
use sporekeeper_app::shutdown;
use sporekeeper_app::state::{DeviceStatus, StateHolder};
use sporekeeper_domain::time::now;

use config::Config;
use provisioning::Provisioning;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;

    let filter = EnvFilter::try_new(&config.logging.filter)
        .with_context(|| format!("invalid log filter {:?}", config.logging.filter))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let device_id = config.device_id();
    tracing::info!(device = %device_id, version = env!("CARGO_PKG_VERSION"), "sporekeeperd starting");

    // Storage
    let db = StorageConfig {
        database_url: config.database.url.clone(),
        busy_timeout: std::time::Duration::from_millis(config.database.busy_timeout_ms),
    }
    .build()
    .await
    .context("failed to open the local store")?;
    db.ping().await.context("local store is not answering")?;
    let pool = db.pool().clone();

    let journal = SqliteJournal::new(pool.clone());
    let actuator_repo = SqliteActuatorStateRepository::new(pool.clone());
    let settings_store = SqliteSettingsStore::new(pool.clone());
    let connectivity_log = SqliteConnectivityLog::new(pool.clone());
    let command_log = SqliteCommandLog::new(pool);

    let recovered = journal.recover_in_flight().await?;
    if recovered > 0 {
        tracing::info!(recovered, "in-flight sync records returned to pending");
    }

    // Shared in-process state
    let phase = settings_store
        .phase()
        .await?
        .unwrap_or(config.control.initial_phase);
    let state = StateHolder::new(DeviceStatus::new(device_id.clone(), phase));
    let queue = ControlQueue::new(config.control.queue_capacity);
    let (trigger, stop) = shutdown::channel();

    // Hardware
    let chamber = Chamber::default();
    let sensors =
        VirtualSensors::new(chamber.clone()).with_noise(config.acquisition.noise_percent);
    let relays = VirtualActuators::new(chamber);
    let network = VirtualNetwork::default();

    // Remote
    let remote = IngestClient::new(&config.remote, device_id.clone())
        .context("failed to build the remote client")?;
    let transport = MqttTransport::new(config.command_channel.mqtt.clone(), device_id);

    // Services
    let actuators = ActuatorService::restore(
        relays,
        actuator_repo,
        journal.clone(),
        state.clone(),
        config.actuator_settings(),
        now(),
    )
    .await?;
    let controller = AutomationController::new(
        config.controller_settings(),
        phase,
        actuators,
        journal.clone(),
        settings_store.clone(),
        queue.clone(),
        state.clone(),
    );
    let acquisition = SensorAcquisition::new(
        sensors,
        journal.clone(),
        queue.clone(),
        state.clone(),
        config.acquisition_settings(),
    );
    let sync = SyncManager::new(
        journal.clone(),
        remote.clone(),
        state.clone(),
        config.sync_settings(),
    );
    let (connectivity, connectivity_handle) = ConnectivityManager::new(
        network,
        remote,
        Provisioning::from_config(&config, queue.clone())?,
        settings_store,
        connectivity_log.clone(),
        state.clone(),
        config.connectivity_settings(),
    );
    let channel = CommandChannel::new(
        transport,
        command_log.clone(),
        queue.clone(),
        connectivity_handle.clone(),
        state.clone(),
        config.channel_settings(),
    );
    let diagnostics = DiagnosticsService::new(
        journal,
        connectivity_log,
        command_log,
        state,
        queue,
        connectivity_handle,
    );

    let mut loops = JoinSet::new();
    loops.spawn(controller.run(stop.clone()));
    loops.spawn(acquisition.run(stop.clone()));
    loops.spawn(sync.run(stop.clone()));
    loops.spawn(connectivity.run(stop.clone()));
    loops.spawn(channel.run(stop.clone()));

    // HTTP
    let app = router::build(AppState::new(diagnostics));
    let addr = config.diagnostics_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind diagnostic API on {addr}"))?;
    tracing::info!(%addr, "diagnostic API listening");
    let mut http_stop = stop;
    let server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_stop.wait().await })
            .into_future(),
    );

    shutdown_signal().await;
    tracing::info!("shutdown requested");
    trigger.trigger();

    while let Some(result) = loops.join_next().await {
        if let Err(err) = result {
            tracing::error!(%err, "background loop panicked");
        }
    }
    if let Err(err) = server.await.context("diagnostic API task panicked")? {
        tracing::error!(%err, "diagnostic API failed");
    }
    db.close().await;
    tracing::info!("sporekeeperd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
