//! In-process provisioning channel.

use std::sync::{Arc, Mutex};

use sporekeeper_app::ports::{ProvisioningChannel, ProvisioningReply, ProvisioningRequest};
use sporekeeper_domain::credentials::ProvisioningPayload;
use sporekeeper_domain::error::SporeKeeperError;
use tokio::sync::{mpsc, oneshot};

use crate::lock;

fn closed() -> SporeKeeperError {
    SporeKeeperError::network(std::io::Error::other("provisioning channel is closed"))
}

/// Provisioning without a radio: payloads are handed over by code.
///
/// An optional preset payload is delivered every time the channel opens,
/// which lets a demo device provision itself. Clones share the channel.
#[derive(Debug, Clone, Default)]
pub struct VirtualProvisioning {
    requests: Arc<Mutex<Option<mpsc::Sender<ProvisioningRequest>>>>,
    preset: Option<ProvisioningPayload>,
}

impl VirtualProvisioning {
    #[must_use]
    pub fn with_preset(mut self, payload: ProvisioningPayload) -> Self {
        self.preset = Some(payload);
        self
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        lock(&self.requests).is_some()
    }

    /// Deliver a payload and wait for the verdict.
    ///
    /// # Errors
    ///
    /// Fails when the channel is closed or the receiver went away.
    pub async fn deliver(
        &self,
        payload: ProvisioningPayload,
    ) -> Result<ProvisioningReply, SporeKeeperError> {
        let sender = lock(&self.requests).clone().ok_or_else(closed)?;
        submit(&sender, payload).await
    }
}

async fn submit(
    sender: &mpsc::Sender<ProvisioningRequest>,
    payload: ProvisioningPayload,
) -> Result<ProvisioningReply, SporeKeeperError> {
    let (reply, verdict) = oneshot::channel();
    sender
        .send(ProvisioningRequest { payload, reply })
        .await
        .map_err(|_| closed())?;
    verdict.await.map_err(|_| closed())
}

impl ProvisioningChannel for VirtualProvisioning {
    fn kind(&self) -> &'static str {
        "virtual"
    }

    async fn open(
        &self,
        requests: mpsc::Sender<ProvisioningRequest>,
    ) -> Result<(), SporeKeeperError> {
        *lock(&self.requests) = Some(requests.clone());
        if let Some(payload) = self.preset.clone() {
            tokio::spawn(async move {
                match submit(&requests, payload).await {
                    Ok(ProvisioningReply::Accepted) => {
                        tracing::info!("preset credentials accepted");
                    }
                    Ok(ProvisioningReply::Rejected(reason)) => {
                        tracing::warn!(%reason, "preset credentials rejected");
                    }
                    Err(err) => tracing::debug!(%err, "preset credentials not delivered"),
                }
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SporeKeeperError> {
        lock(&self.requests).take();
        Ok(())
    }
}
