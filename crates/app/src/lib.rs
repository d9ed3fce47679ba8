//! # sporekeeper-app
//!
//! Application layer: the edge agent's loops and **port definitions** (traits).
//!
//! ## Responsibilities
//! - Define **port traits** that adapters must implement (driven/outbound ports):
//!   - `Journal`: durable append-only log of readings, decisions and transitions
//!   - `ActuatorStateRepository`, `SettingsStore`, `ConnectivityLog`, `CommandLog`
//!   - `ActuatorDriver`, `SensorSource`: the chamber hardware
//!   - `NetworkInterface`, `HealthProbe`, `AccessPoint`, `ProvisioningChannel`
//!   - `IngestionClient`, `CommandTransport`: the remote service
//! - Provide the **services** that drive the device:
//!   - `AutomationController`: serialized, deterministic threshold control
//!   - `ActuatorService`: dwell-time debouncing and fault retry
//!   - `SensorAcquisition`: fixed-interval sampling
//!   - `SyncManager`: journal reconciliation with the remote store
//!   - `ConnectivityManager`: provisioning, reachability and fallback
//!   - `CommandChannel`: remote commands and heartbeats
//!   - `DiagnosticsService`: operator queries and interventions
//! - Provide **in-process infrastructure** that needs no IO: the bounded
//!   control queue, the authoritative state holder, backoff and shutdown.
//!
//! ## Dependency rule
//! Depends on `sporekeeper-domain` only (plus `tokio` sync/time and `rand`).
//! Never imports adapter crates. Adapters depend on *this* crate, not the reverse.

pub mod backoff;
pub mod ports;
pub mod queue;
pub mod services;
pub mod shutdown;
pub mod state;

#[cfg(test)]
mod testing;
