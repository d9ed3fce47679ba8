//! Provisioning transport selected at configuration time.

use std::time::Duration;

use tokio::sync::mpsc;

use sporekeeper_adapter_http_axum::provisioning::{SoftApProvisioning, SoftApSettings};
use sporekeeper_adapter_virtual::{VirtualAccessPoint, VirtualProvisioning};
use sporekeeper_app::ports::{ProvisioningChannel, ProvisioningRequest};
use sporekeeper_app::queue::ControlQueue;
use sporekeeper_domain::credentials::ProvisioningPayload;
use sporekeeper_domain::error::SporeKeeperError;

use crate::config::{Config, ConfigError};

/// Exactly one provisioning channel, chosen by `provisioning.transport`.
pub enum Provisioning {
    SoftAp(SoftApProvisioning<VirtualAccessPoint>),
    Virtual(VirtualProvisioning),
}

impl Provisioning {
    /// The soft-AP transport also serves manual overrides into `queue`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unknown transport or bind address.
    pub fn from_config(config: &Config, queue: ControlQueue) -> Result<Self, ConfigError> {
        let provisioning = &config.provisioning;
        match provisioning.transport.as_str() {
            "soft_ap" => Ok(Self::SoftAp(
                SoftApProvisioning::new(
                    VirtualAccessPoint::default(),
                    SoftApSettings {
                        ssid: provisioning.ssid.clone(),
                        bind: config.provisioning_addr()?,
                        reply_timeout: Duration::from_secs(provisioning.reply_timeout_secs),
                    },
                )
                .with_local_control(queue),
            )),
            "virtual" => {
                let channel = VirtualProvisioning::default();
                Ok(Self::Virtual(match &provisioning.preset_ssid {
                    Some(ssid) => channel.with_preset(ProvisioningPayload {
                        ssid: ssid.clone(),
                        passphrase: provisioning.preset_passphrase.clone().unwrap_or_default(),
                        controller: None,
                    }),
                    None => channel,
                }))
            }
            other => Err(ConfigError::Validation(format!(
                "unknown provisioning transport {other:?}"
            ))),
        }
    }
}

impl ProvisioningChannel for Provisioning {
    fn kind(&self) -> &'static str {
        match self {
            Self::SoftAp(channel) => channel.kind(),
            Self::Virtual(channel) => channel.kind(),
        }
    }

    async fn open(
        &self,
        requests: mpsc::Sender<ProvisioningRequest>,
    ) -> Result<(), SporeKeeperError> {
        match self {
            Self::SoftAp(channel) => channel.open(requests).await,
            Self::Virtual(channel) => channel.open(requests).await,
        }
    }

    async fn close(&self) -> Result<(), SporeKeeperError> {
        match self {
            Self::SoftAp(channel) => channel.close().await,
            Self::Virtual(channel) => channel.close().await,
        }
    }
}
