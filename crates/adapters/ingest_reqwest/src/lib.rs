//! # sporekeeper-adapter-ingest-reqwest
//!
//! HTTP client for the remote canonical store, built on
//! [reqwest](https://docs.rs/reqwest) with rustls.
//!
//! ## Responsibilities
//! - Implement [`IngestionClient`](sporekeeper_app::ports::IngestionClient):
//!   `POST {remote}/api/v1/devices/{device}/ingest/{entity_type}` with
//!   `{ "items": [...] }`, answered by `{ "results": [...] }` with one
//!   verdict per item id
//! - Implement [`HealthProbe`](sporekeeper_app::ports::HealthProbe):
//!   `GET {remote}/health` with a short timeout
//! - Authenticate every request with the per-device bearer token
//!
//! ## Dependency rule
//! Same as other adapters: depends on `sporekeeper-app` and `sporekeeper-domain`.

pub mod client;
pub mod config;
pub mod error;

pub use client::IngestClient;
pub use config::IngestConfig;
pub use error::IngestError;
