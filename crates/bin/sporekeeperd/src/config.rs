//! Configuration loading: TOML file with environment variable overrides.
//!
//! Looks for `sporekeeper.toml` in the working directory, or at the path in
//! `SPOREKEEPER_CONFIG`. Every field has a sensible default so the file is
//! optional. Environment variables take precedence over file values.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use sporekeeper_adapter_ingest_reqwest::IngestConfig;
use sporekeeper_adapter_mqtt::MqttConfig;
use sporekeeper_app::backoff::Backoff;
use sporekeeper_app::services::acquisition::AcquisitionSettings;
use sporekeeper_app::services::actuator_service::ActuatorSettings;
use sporekeeper_app::services::command_channel::ChannelSettings;
use sporekeeper_app::services::connectivity_manager::ConnectivitySettings;
use sporekeeper_app::services::controller::{ControllerSettings, default_safe_states};
use sporekeeper_app::services::sync_manager::SyncSettings;
use sporekeeper_domain::actuator::Actuator;
use sporekeeper_domain::id::DeviceId;
use sporekeeper_domain::phase::{Phase, PhaseProfile, ThresholdBand};
use sporekeeper_domain::reading::Metric;
use sporekeeper_domain::rule::Rule;

const DEFAULT_PATH: &str = "sporekeeper.toml";

/// Provisioning transports that can be selected.
pub const TRANSPORTS: [&str; 2] = ["soft_ap", "virtual"];

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub control: ControlConfig,
    pub phases: PhasesConfig,
    pub acquisition: AcquisitionConfig,
    pub sync: SyncConfig,
    pub dead_letter: DeadLetterConfig,
    pub connectivity: ConnectivityConfig,
    pub provisioning: ProvisioningConfig,
    pub command_channel: CommandChannelConfig,
    pub remote: IngestConfig,
    pub diagnostics: DiagnosticsConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Identity reported to the remote service.
    pub id: String,
}

/// `SQLite` database configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `SQLite` connection URL or file path.
    pub url: String,
    pub busy_timeout_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`RUST_LOG` syntax).
    pub filter: String,
}

/// Automation controller and actuator policy.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub queue_capacity: usize,
    pub tick_ms: u64,
    pub stale_after_secs: u64,
    pub grace_secs: u64,
    pub max_override_ttl_secs: u64,
    pub min_on_secs: u64,
    pub min_off_secs: u64,
    /// Failed storage restart attempts before protected mode.
    pub storage_restart_attempts: u32,
    pub storage_retry_base_secs: u64,
    pub storage_retry_max_secs: u64,
    /// Phase used until one has been persisted.
    pub initial_phase: Phase,
    pub safe_defaults: BTreeMap<Actuator, bool>,
    pub rules: Vec<Rule>,
}

/// Threshold bands per growth phase.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PhasesConfig {
    pub spawning: BTreeMap<Metric, ThresholdBand>,
    pub fruiting: BTreeMap<Metric, ThresholdBand>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub interval_secs: u64,
    pub read_timeout_ms: u64,
    /// Noise of the simulated probes, in percent of the true value.
    pub noise_percent: f64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub interval_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub degraded_after: u32,
    pub degraded_interval_secs: u64,
    pub max_attempts: u32,
    /// Acked entries older than this are pruned. Kept forever when unset.
    pub retention_days: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// Requeue dead letters automatically after this cooldown. Manual only
    /// when unset.
    pub auto_requeue_after_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub associate_timeout_secs: u64,
    pub degraded_after: u32,
    pub fallback_after_secs: u64,
    pub flap_window_secs: u64,
    pub flap_threshold: usize,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// `soft_ap` or `virtual`.
    pub transport: String,
    /// SSID of the temporary access point.
    pub ssid: String,
    /// Where the configuration endpoint listens while provisioning.
    pub bind: String,
    pub reply_timeout_secs: u64,
    /// Credentials the `virtual` transport delivers on its own.
    pub preset_ssid: Option<String>,
    pub preset_passphrase: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CommandChannelConfig {
    pub heartbeat_interval_secs: u64,
    pub heartbeat_miss_limit: u32,
    pub ack_timeout_secs: u64,
    pub recent_capacity: usize,
    pub mqtt: MqttConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub bind: String,
}

impl Config {
    /// Load configuration from the config file (if present) then apply
    /// environment-variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML file exists but is malformed, or if the
    /// resulting configuration is invalid.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("SPOREKEEPER_CONFIG").unwrap_or_else(|_| DEFAULT_PATH.to_string());
        let mut config = Self::from_file(&path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SPOREKEEPER_DEVICE_ID") {
            self.device.id = val;
        }
        if let Ok(val) = std::env::var("SPOREKEEPER_DATABASE_URL") {
            self.database.url = val;
        }
        if let Ok(val) = std::env::var("SPOREKEEPER_BIND") {
            self.diagnostics.bind = val;
        }
        if let Ok(val) = std::env::var("SPOREKEEPER_REMOTE_URL") {
            self.remote.base_url = val;
        }
        if let Ok(val) = std::env::var("SPOREKEEPER_DEVICE_TOKEN") {
            self.remote.device_token = Some(val);
        }
        if let Ok(val) = std::env::var("SPOREKEEPER_MQTT_HOST") {
            self.command_channel.mqtt.broker_host = val;
        }
        if let Ok(val) = std::env::var("SPOREKEEPER_LOG") {
            self.logging.filter = val;
        }
        if let Ok(val) = std::env::var("RUST_LOG") {
            self.logging.filter = val;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.device.id.trim().is_empty() {
            return Err(invalid("device.id must not be empty"));
        }
        if self.control.queue_capacity == 0 {
            return Err(invalid("control.queue_capacity must be non-zero"));
        }
        for (name, value) in [
            ("control.tick_ms", self.control.tick_ms),
            ("control.stale_after_secs", self.control.stale_after_secs),
            ("control.max_override_ttl_secs", self.control.max_override_ttl_secs),
            ("acquisition.interval_secs", self.acquisition.interval_secs),
            ("acquisition.read_timeout_ms", self.acquisition.read_timeout_ms),
            ("sync.interval_secs", self.sync.interval_secs),
            ("connectivity.probe_interval_secs", self.connectivity.probe_interval_secs),
            ("connectivity.fallback_after_secs", self.connectivity.fallback_after_secs),
            ("command_channel.heartbeat_interval_secs", self.command_channel.heartbeat_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{name} must be non-zero")));
            }
        }
        if self.sync.batch_size == 0 {
            return Err(invalid("sync.batch_size must be non-zero"));
        }
        if self.command_channel.mqtt.broker_port == 0 {
            return Err(invalid("command_channel.mqtt.broker_port must be non-zero"));
        }
        for profile in self.profiles().values() {
            profile
                .validate()
                .map_err(|err| ConfigError::Validation(format!("phases.{}: {err}", profile.phase)))?;
        }
        if !TRANSPORTS.contains(&self.provisioning.transport.as_str()) {
            return Err(ConfigError::Validation(format!(
                "unknown provisioning transport {:?}, expected one of {TRANSPORTS:?}",
                self.provisioning.transport
            )));
        }
        self.diagnostics_addr()?;
        self.provisioning_addr()?;
        Ok(())
    }

    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(self.device.id.trim())
    }

    /// # Errors
    ///
    /// Returns a validation error if `diagnostics.bind` is not `host:port`.
    pub fn diagnostics_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr("diagnostics.bind", &self.diagnostics.bind)
    }

    /// # Errors
    ///
    /// Returns a validation error if `provisioning.bind` is not `host:port`.
    pub fn provisioning_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr("provisioning.bind", &self.provisioning.bind)
    }

    #[must_use]
    pub fn profiles(&self) -> BTreeMap<Phase, PhaseProfile> {
        BTreeMap::from([
            (
                Phase::Spawning,
                PhaseProfile {
                    phase: Phase::Spawning,
                    bands: self.phases.spawning.clone(),
                },
            ),
            (
                Phase::Fruiting,
                PhaseProfile {
                    phase: Phase::Fruiting,
                    bands: self.phases.fruiting.clone(),
                },
            ),
        ])
    }

    #[must_use]
    pub fn controller_settings(&self) -> ControllerSettings {
        let control = &self.control;
        ControllerSettings {
            rules: control.rules.clone(),
            profiles: self.profiles(),
            stale_after: Duration::from_secs(control.stale_after_secs),
            grace: Duration::from_secs(control.grace_secs),
            max_override_ttl: Duration::from_secs(control.max_override_ttl_secs),
            safe_defaults: control.safe_defaults.clone(),
            storage_restart_attempts: control.storage_restart_attempts,
            storage_retry: Backoff::new(
                Duration::from_secs(control.storage_retry_base_secs),
                Duration::from_secs(control.storage_retry_max_secs),
            ),
            tick: Duration::from_millis(control.tick_ms),
            ..ControllerSettings::new(self.device_id())
        }
    }

    #[must_use]
    pub fn actuator_settings(&self) -> ActuatorSettings {
        ActuatorSettings {
            min_on: Duration::from_secs(self.control.min_on_secs),
            min_off: Duration::from_secs(self.control.min_off_secs),
            ..ActuatorSettings::default()
        }
    }

    #[must_use]
    pub fn acquisition_settings(&self) -> AcquisitionSettings {
        AcquisitionSettings {
            interval: Duration::from_secs(self.acquisition.interval_secs),
            read_timeout: Duration::from_millis(self.acquisition.read_timeout_ms),
            ..AcquisitionSettings::new(self.device_id())
        }
    }

    #[must_use]
    pub fn sync_settings(&self) -> SyncSettings {
        let sync = &self.sync;
        SyncSettings {
            batch_size: sync.batch_size,
            interval: Duration::from_secs(sync.interval_secs),
            backoff: Backoff::new(
                Duration::from_secs(sync.backoff_base_secs),
                Duration::from_secs(sync.backoff_max_secs),
            ),
            degraded_after: sync.degraded_after,
            degraded_interval: Duration::from_secs(sync.degraded_interval_secs),
            max_attempts: sync.max_attempts,
            auto_requeue_after: self.dead_letter.auto_requeue_after_secs.map(Duration::from_secs),
            retention: sync
                .retention_days
                .map(|days| Duration::from_secs(days * 24 * 3600)),
        }
    }

    #[must_use]
    pub fn connectivity_settings(&self) -> ConnectivitySettings {
        let c = &self.connectivity;
        ConnectivitySettings {
            probe_interval: Duration::from_secs(c.probe_interval_secs),
            probe_timeout: Duration::from_secs(c.probe_timeout_secs),
            associate_timeout: Duration::from_secs(c.associate_timeout_secs),
            degraded_after: c.degraded_after,
            fallback_after: Duration::from_secs(c.fallback_after_secs),
            flap_window: Duration::from_secs(c.flap_window_secs),
            flap_threshold: c.flap_threshold,
            flap_backoff: Backoff::new(
                Duration::from_secs(c.probe_interval_secs),
                Duration::from_secs(c.flap_window_secs.max(c.probe_interval_secs)),
            ),
        }
    }

    #[must_use]
    pub fn channel_settings(&self) -> ChannelSettings {
        let c = &self.command_channel;
        ChannelSettings {
            heartbeat_interval: Duration::from_secs(c.heartbeat_interval_secs),
            heartbeat_miss_limit: c.heartbeat_miss_limit,
            ack_timeout: Duration::from_secs(c.ack_timeout_secs),
            recent_capacity: c.recent_capacity,
            ..ChannelSettings::default()
        }
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Validation(message.to_string())
}

fn parse_addr(name: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Validation(format!("{name} must be host:port, got {value:?}")))
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "chamber-01".to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:sporekeeper.db?mode=rwc".to_string(),
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "sporekeeper=info,tower_http=info".to_string(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            tick_ms: 1000,
            stale_after_secs: 120,
            grace_secs: 60,
            max_override_ttl_secs: 3600,
            min_on_secs: 30,
            min_off_secs: 30,
            storage_restart_attempts: 3,
            storage_retry_base_secs: 2,
            storage_retry_max_secs: 60,
            initial_phase: Phase::Spawning,
            safe_defaults: default_safe_states(),
            rules: Rule::defaults(),
        }
    }
}

impl Default for PhasesConfig {
    fn default() -> Self {
        Self {
            spawning: PhaseProfile::default_spawning().bands,
            fruiting: PhaseProfile::default_fruiting().bands,
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            interval_secs: 12,
            read_timeout_ms: 2000,
            noise_percent: 1.0,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            interval_secs: 10,
            backoff_base_secs: 2,
            backoff_max_secs: 120,
            degraded_after: 5,
            degraded_interval_secs: 300,
            max_attempts: 5,
            retention_days: Some(30),
        }
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 15,
            probe_timeout_secs: 5,
            associate_timeout_secs: 30,
            degraded_after: 3,
            fallback_after_secs: 300,
            flap_window_secs: 600,
            flap_threshold: 4,
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            transport: "soft_ap".to_string(),
            ssid: "sporekeeper-setup".to_string(),
            bind: "0.0.0.0:8080".to_string(),
            reply_timeout_secs: 30,
            preset_ssid: None,
            preset_passphrase: None,
        }
    }
}

impl Default for CommandChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            heartbeat_miss_limit: 3,
            ack_timeout_secs: 10,
            recent_capacity: 256,
            mqtt: MqttConfig::default(),
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parse failure.
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
    /// File I/O failure.
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    /// Semantic validation failure.
    #[error("invalid configuration: {0}")]
    Validation(String),
}
