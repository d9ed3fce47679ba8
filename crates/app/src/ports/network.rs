//! Network ports: primary-network association, remote health probing and
//! the local provisioning channel.

use std::future::Future;

use sporekeeper_domain::credentials::{NetworkCredentials, ProvisioningPayload};
use sporekeeper_domain::error::SporeKeeperError;
use tokio::sync::{mpsc, oneshot};

/// The device's primary network interface.
pub trait NetworkInterface: Send + Sync {
    /// Join the network described by `credentials`. Resolves once an address
    /// has been acquired.
    fn associate(
        &self,
        credentials: &NetworkCredentials,
    ) -> impl Future<Output = Result<(), SporeKeeperError>> + Send;

    /// Whether the link is currently up with an address.
    fn link_up(&self) -> impl Future<Output = bool> + Send;

    /// Leave the current network.
    fn disconnect(&self) -> impl Future<Output = Result<(), SporeKeeperError>> + Send;
}

/// Reachability check against the remote service's health surface.
pub trait HealthProbe: Send + Sync {
    fn probe(&self) -> impl Future<Output = Result<(), SporeKeeperError>> + Send;
}

/// A temporary self-hosted network for soft-AP provisioning.
pub trait AccessPoint: Send + Sync {
    fn start(&self, ssid: &str) -> impl Future<Output = Result<(), SporeKeeperError>> + Send;

    fn stop(&self) -> impl Future<Output = Result<(), SporeKeeperError>> + Send;
}

/// Answer given to whoever delivered a provisioning payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningReply {
    Accepted,
    Rejected(String),
}

/// A credential payload waiting for the connectivity manager's verdict.
#[derive(Debug)]
pub struct ProvisioningRequest {
    pub payload: ProvisioningPayload,
    pub reply: oneshot::Sender<ProvisioningReply>,
}

/// One way of delivering credentials to an unprovisioned device (temporary
/// access point plus configuration endpoint, short-range pairing, …).
///
/// Exactly one implementation is selected at configuration time.
pub trait ProvisioningChannel: Send + Sync {
    /// Short transport name used in logs (e.g. `"soft_ap"`).
    fn kind(&self) -> &'static str;

    /// Open the channel; received payloads are forwarded to `requests`.
    fn open(
        &self,
        requests: mpsc::Sender<ProvisioningRequest>,
    ) -> impl Future<Output = Result<(), SporeKeeperError>> + Send;

    /// Tear the channel down. Closing a closed channel is a no-op.
    fn close(&self) -> impl Future<Output = Result<(), SporeKeeperError>> + Send;
}
