//! # sporekeeper-adapter-virtual
//!
//! A simulated growing chamber for demos and end-to-end tests.
//!
//! ## Provided adapters
//!
//! | Adapter | Port | Behaviour |
//! |---------|------|-----------|
//! | [`VirtualSensors`] | `SensorSource` | Samples the shared [`Chamber`] model with noise, failures can be injected |
//! | [`VirtualActuators`] | `ActuatorDriver` | Switches the chamber's outputs, relays can be jammed |
//! | [`VirtualNetwork`] | `NetworkInterface`, `HealthProbe` | Link and remote reachability toggled by hand |
//! | [`VirtualAccessPoint`] | `AccessPoint` | Remembers which SSID it is broadcasting |
//! | [`VirtualProvisioning`] | `ProvisioningChannel` | Delivers payloads handed to it in-process |
//!
//! ## Dependency rule
//!
//! Depends on `sporekeeper-app` (port traits) and `sporekeeper-domain` only.

mod chamber;
mod devices;
mod network;
mod provisioning;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use chamber::{Ambient, Chamber};
pub use devices::{VirtualActuators, VirtualSensors};
pub use network::{VirtualAccessPoint, VirtualNetwork};
pub use provisioning::VirtualProvisioning;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
