//! Remote service configuration.

use serde::Deserialize;

/// Where the remote service lives and how to talk to it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Base URL, e.g. `https://api.example.com`.
    pub base_url: String,
    /// Per-device bearer credential.
    pub device_token: Option<String>,
    /// Timeout for one ingestion batch, in seconds.
    pub request_timeout_secs: u64,
    /// Timeout for one health probe, in seconds.
    pub probe_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            base_url: "https://localhost:8443".to_string(),
            device_token: None,
            request_timeout_secs: 30,
            probe_timeout_secs: 5,
        }
    }
}
