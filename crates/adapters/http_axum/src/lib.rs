//! # sporekeeper-adapter-http-axum
//!
//! HTTP adapter built on [axum](https://docs.rs/axum).
//!
//! ## Responsibilities
//! - Serve the **local diagnostic interface** under `/api`: device status,
//!   actuators, decisions, dead letters, connectivity history, plus the two
//!   operator interventions (manual override and dead-letter requeue) and a
//!   connectivity reset
//! - Serve the **soft-AP provisioning endpoint** while the device has no
//!   usable network, see [`provisioning::SoftApProvisioning`]
//! - Map application results into HTTP responses (JSON)
//!
//! ## Dependency rule
//! Depends on `sporekeeper-app` (for port traits and services) and
//! `sporekeeper-domain` (for domain types used in request/response mapping).
//! Never leaks axum types into the domain.

pub mod api;
pub mod error;
pub mod provisioning;
pub mod router;
pub mod state;
