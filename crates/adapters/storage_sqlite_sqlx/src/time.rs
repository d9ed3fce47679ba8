//! Timestamp column encoding.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings so that `SQLite`'s
//! text comparison orders them chronologically.

use chrono::SecondsFormat;
use sporekeeper_domain::time::Timestamp;

pub(crate) fn encode(at: Timestamp) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn decode(raw: &str) -> Result<Timestamp, sqlx::Error> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|at| at.to_utc())
        .map_err(|err| sqlx::Error::Decode(Box::new(err)))
}

/// Parse a column holding a snake_case serde enum name.
pub(crate) fn decode_name<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, sqlx::Error> {
    serde_json::from_str(&format!("\"{raw}\"")).map_err(|err| sqlx::Error::Decode(Box::new(err)))
}
