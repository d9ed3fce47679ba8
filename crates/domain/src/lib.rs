//! # sporekeeper-domain
//!
//! Pure domain model for the sporekeeper cultivation-chamber edge agent.
//!
//! ## Responsibilities
//! - Foundational types: typed identifiers, error taxonomy, timestamps
//! - Define **Readings** (immutable environment samples with a quality flag)
//! - Define **Phases** and their per-metric threshold bands
//! - Define **Rules** and the hysteresis latch evaluated by the controller
//! - Define **ActuatorState** and journaled actuator transitions
//! - Define **Decisions** (audit records with their input snapshot)
//! - Define **SyncRecords** and the forward-only sync state graph
//! - Define the **connectivity** state graph and session history
//! - Define **Commands** and the command/heartbeat channel wire messages
//! - Validate provisioning **credentials**
//!
//! ## Dependency rule
//! This crate has **no internal dependencies**.
//! It must never import anything from `app`, adapters, or external IO crates.
//! All IO boundaries are expressed as traits in the `app` crate (ports).

pub mod error;
pub mod id;
pub mod time;

pub mod actuator;
pub mod command;
pub mod connectivity;
pub mod credentials;
pub mod decision;
pub mod phase;
pub mod reading;
pub mod rule;
pub mod sync;
