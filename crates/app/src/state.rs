//! Authoritative device state holder.
//!
//! Current actuator states, the active phase, the control mode and the
//! connectivity state live in one [`DeviceStatus`] behind a `watch` channel.
//! Loops mutate it only through [`StateHolder::update`] (a single short
//! critical section) and everyone else reads snapshots.

use std::collections::BTreeMap;

use serde::Serialize;
use sporekeeper_domain::actuator::{Actuator, ActuatorState, ControlSource};
use sporekeeper_domain::connectivity::ConnectivityState;
use sporekeeper_domain::decision::SnapshotValue;
use sporekeeper_domain::id::DeviceId;
use sporekeeper_domain::phase::Phase;
use sporekeeper_domain::reading::Metric;
use sporekeeper_domain::time::{Timestamp, now};
use tokio::sync::watch;

/// Whether the controller runs normally or in protected minimal-control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    #[default]
    Normal,
    Protected,
}

/// An active override as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverrideStatus {
    pub on: bool,
    pub until: Timestamp,
    pub source: ControlSource,
}

/// Sync loop health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub consecutive_failures: u32,
    /// Whether the loop is on its slow, degraded cadence.
    pub degraded: bool,
    pub last_success: Option<Timestamp>,
    pub dead_lettered: u64,
}

/// Command channel health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    pub connected: bool,
    pub last_heartbeat_ack: Option<Timestamp>,
    pub duplicates_discarded: u64,
}

/// Fault counters surfaced through diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FaultCounters {
    pub queue_dropped: u64,
    pub sensor_faults: u64,
    pub actuator_faults: u64,
    pub storage_failures: u64,
    /// Storage failures since the last successful durable write.
    pub consecutive_storage_failures: u32,
}

/// Durable writes made by one unit of work: a sampling round, a handled
/// input or a tick. Counts as at most one storage failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSession {
    attempted: bool,
    failed: bool,
}

impl WriteSession {
    pub fn record<T, E>(&mut self, result: &Result<T, E>) {
        self.attempted = true;
        self.failed |= result.is_err();
    }

    pub fn merge(&mut self, other: Self) {
        self.attempted |= other.attempted;
        self.failed |= other.failed;
    }

    #[must_use]
    pub fn failed(&self) -> bool {
        self.failed
    }
}

/// Snapshot of everything other loops need to know about the device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub device_id: DeviceId,
    pub phase: Phase,
    pub mode: ControlMode,
    pub actuators: BTreeMap<Actuator, ActuatorState>,
    pub overrides: BTreeMap<Actuator, OverrideStatus>,
    pub latest: BTreeMap<Metric, SnapshotValue>,
    /// Metrics currently forced to safe defaults because they went stale.
    pub fail_safe: Vec<Metric>,
    pub connectivity: ConnectivityState,
    pub connectivity_since: Timestamp,
    pub sync: SyncStatus,
    pub channel: ChannelStatus,
    pub faults: FaultCounters,
    pub started_at: Timestamp,
}

impl DeviceStatus {
    /// Initial status of a freshly booted device.
    #[must_use]
    pub fn new(device_id: DeviceId, phase: Phase) -> Self {
        let at = now();
        Self {
            device_id,
            phase,
            mode: ControlMode::Normal,
            actuators: Actuator::ALL
                .into_iter()
                .map(|a| (a, ActuatorState::off(a, at)))
                .collect(),
            overrides: BTreeMap::new(),
            latest: BTreeMap::new(),
            fail_safe: Vec::new(),
            connectivity: ConnectivityState::Unprovisioned,
            connectivity_since: at,
            sync: SyncStatus::default(),
            channel: ChannelStatus::default(),
            faults: FaultCounters::default(),
            started_at: at,
        }
    }
}

/// Cloneable handle on the authoritative [`DeviceStatus`].
#[derive(Debug, Clone)]
pub struct StateHolder {
    sender: watch::Sender<DeviceStatus>,
}

impl StateHolder {
    #[must_use]
    pub fn new(initial: DeviceStatus) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    /// Copy of the current status.
    #[must_use]
    pub fn snapshot(&self) -> DeviceStatus {
        self.sender.borrow().clone()
    }

    /// Read one field without cloning the whole status.
    pub fn read<T>(&self, f: impl FnOnce(&DeviceStatus) -> T) -> T {
        f(&self.sender.borrow())
    }

    /// Apply a change request atomically and notify subscribers.
    pub fn update(&self, f: impl FnOnce(&mut DeviceStatus)) {
        self.sender.send_modify(f);
    }

    /// Receive a notification on every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DeviceStatus> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn connectivity(&self) -> ConnectivityState {
        self.read(|s| s.connectivity)
    }

    /// Count a failed durable write; returns the consecutive failure count.
    pub fn record_storage_failure(&self) -> u32 {
        let mut consecutive = 0;
        self.update(|s| {
            s.faults.storage_failures += 1;
            s.faults.consecutive_storage_failures += 1;
            consecutive = s.faults.consecutive_storage_failures;
        });
        consecutive
    }

    /// Reset the consecutive storage failure count after a durable write.
    pub fn record_storage_success(&self) {
        if self.read(|s| s.faults.consecutive_storage_failures) > 0 {
            self.update(|s| s.faults.consecutive_storage_failures = 0);
        }
    }

    /// Count a unit of work: one failure if any write failed, a success if
    /// every attempted write went through, nothing if none was attempted.
    pub fn finish_write_session(&self, session: WriteSession) {
        if !session.attempted {
            return;
        }
        if session.failed {
            self.record_storage_failure();
        } else {
            self.record_storage_success();
        }
    }

    #[must_use]
    pub fn mode(&self) -> ControlMode {
        self.read(|s| s.mode)
    }
}
