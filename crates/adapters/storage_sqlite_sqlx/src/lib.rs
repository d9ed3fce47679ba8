//! # sporekeeper-adapter-storage-sqlite-sqlx
//!
//! `SQLite` persistence adapter using [sqlx](https://docs.rs/sqlx).
//!
//! ## Responsibilities
//! - Implement the [`Journal`](sporekeeper_app::ports::Journal) and durable
//!   state ports defined in `sporekeeper-app::ports`
//! - Manage the `SQLite` connection pool lifecycle (WAL, `synchronous=FULL`)
//! - Run database migrations (using sqlx embedded migrations)
//! - Map between domain types and database rows
//!
//! ## Dependency rule
//! Depends on `sporekeeper-app` (for port traits) and `sporekeeper-domain`
//! (for domain types). The `app` and `domain` crates must never reference
//! this adapter.

mod actuator_repo;
mod command_log;
mod connectivity_log;
mod error;
mod journal;
mod pool;
mod settings_repo;
mod time;

pub use actuator_repo::SqliteActuatorStateRepository;
pub use command_log::SqliteCommandLog;
pub use connectivity_log::SqliteConnectivityLog;
pub use error::StorageError;
pub use journal::SqliteJournal;
pub use pool::{Config, Database};
pub use settings_repo::SqliteSettingsStore;
