//! reqwest-backed [`IngestionClient`] and [`HealthProbe`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use sporekeeper_app::ports::{HealthProbe, IngestItem, IngestionClient, ItemOutcome};
use sporekeeper_domain::error::{ProtocolFault, SporeKeeperError};
use sporekeeper_domain::id::DeviceId;
use sporekeeper_domain::sync::EntityType;

use crate::config::IngestConfig;
use crate::error::IngestError;

#[derive(Serialize)]
struct IngestRequest<'a> {
    items: &'a [IngestItem],
}

#[derive(Deserialize)]
struct IngestResponse {
    results: Vec<ItemOutcome>,
}

/// Client for one device's slice of the remote service. Cheap to clone.
#[derive(Debug, Clone)]
pub struct IngestClient {
    http: reqwest::Client,
    base_url: String,
    device_id: DeviceId,
    token: Option<String>,
    probe_timeout: Duration,
}

impl IngestClient {
    /// # Errors
    ///
    /// Returns [`IngestError::Http`] if the TLS backend cannot be initialised.
    pub fn new(config: &IngestConfig, device_id: DeviceId) -> Result<Self, IngestError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("sporekeeper/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            device_id,
            token: config.device_token.clone(),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
        })
    }

    fn ingest_url(&self, entity_type: EntityType) -> String {
        format!(
            "{}/api/v1/devices/{}/ingest/{}",
            self.base_url,
            self.device_id.as_str(),
            entity_type.as_str()
        )
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post_batch(
        &self,
        entity_type: EntityType,
        items: &[IngestItem],
    ) -> Result<Vec<ItemOutcome>, IngestError> {
        let response = self
            .authorized(self.http.post(self.ingest_url(entity_type)))
            .json(&IngestRequest { items })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::Status {
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await?;
        let decoded: IngestResponse = serde_json::from_slice(&body)
            .map_err(|err| IngestError::Response(ProtocolFault::Malformed(err.to_string())))?;
        Ok(decoded.results)
    }
}

impl IngestionClient for IngestClient {
    async fn send_batch(
        &self,
        entity_type: EntityType,
        items: Vec<IngestItem>,
    ) -> Result<Vec<ItemOutcome>, SporeKeeperError> {
        let started = std::time::Instant::now();
        let results = self.post_batch(entity_type, &items).await?;
        tracing::debug!(
            %entity_type,
            sent = items.len(),
            answered = results.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "ingestion batch answered"
        );
        Ok(results)
    }
}

impl HealthProbe for IngestClient {
    async fn probe(&self) -> Result<(), SporeKeeperError> {
        let response = self
            .authorized(self.http.get(format!("{}/health", self.base_url)))
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(IngestError::from)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(IngestError::Status {
                status: status.as_u16(),
            }
            .into())
        }
    }
}
