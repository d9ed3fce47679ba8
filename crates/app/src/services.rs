//! Application services: the device's long-running loops and use-cases.
//!
//! Each service accepts port implementations through generic parameters
//! (constructor injection), keeping this layer free of concrete adapters.

pub mod acquisition;
pub mod actuator_service;
pub mod command_channel;
pub mod connectivity_manager;
pub mod controller;
pub mod diagnostics;
pub mod sync_manager;
