//! Sensor acquisition loop.
//!
//! Samples every configured metric on a fixed interval, each read bounded by
//! its own timeout so a hung sensor cannot stall the others. Readings are
//! classified, journaled and then handed to the control queue. A failed read
//! produces no reading at all; the controller notices the gap through
//! staleness.

use std::collections::BTreeMap;
use std::time::Duration;

use sporekeeper_domain::error::{SensorFault, SporeKeeperError};
use sporekeeper_domain::id::DeviceId;
use sporekeeper_domain::reading::{Metric, PlausibleRange, QualityFlag, Reading};
use sporekeeper_domain::time::{Timestamp, now};

use crate::ports::{Journal, SensorSource};
use crate::queue::{ControlInput, ControlQueue};
use crate::shutdown::Shutdown;
use crate::state::{ControlMode, StateHolder, WriteSession};

/// Sampling configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSettings {
    pub device_id: DeviceId,
    pub interval: Duration,
    pub read_timeout: Duration,
    pub metrics: Vec<Metric>,
    pub ranges: BTreeMap<Metric, PlausibleRange>,
}

impl AcquisitionSettings {
    #[must_use]
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            interval: Duration::from_secs(12),
            read_timeout: Duration::from_secs(2),
            metrics: Metric::ALL.to_vec(),
            ranges: Metric::ALL
                .into_iter()
                .map(|m| (m, PlausibleRange::default_for(m)))
                .collect(),
        }
    }

    fn range(&self, metric: Metric) -> PlausibleRange {
        self.ranges
            .get(&metric)
            .copied()
            .unwrap_or_else(|| PlausibleRange::default_for(metric))
    }
}

/// Periodic sampler feeding the journal and the control queue.
pub struct SensorAcquisition<S, J> {
    sensors: S,
    journal: J,
    queue: ControlQueue,
    state: StateHolder,
    settings: AcquisitionSettings,
}

impl<S, J> SensorAcquisition<S, J>
where
    S: SensorSource,
    J: Journal,
{
    pub fn new(
        sensors: S,
        journal: J,
        queue: ControlQueue,
        state: StateHolder,
        settings: AcquisitionSettings,
    ) -> Self {
        Self {
            sensors,
            journal,
            queue,
            state,
            settings,
        }
    }

    /// Sample on the configured interval until shutdown.
    pub async fn run(self, mut shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = self.settings.interval.as_millis(),
            metrics = self.settings.metrics.len(),
            "sensor acquisition started"
        );

        loop {
            tokio::select! {
                () = shutdown.wait() => break,
                _ = ticker.tick() => {
                    self.sample_all(now()).await;
                }
            }
        }
        tracing::info!("sensor acquisition stopped");
    }

    /// Take one sample of every metric. Returns the readings produced.
    pub async fn sample_all(&self, at: Timestamp) -> Vec<Reading> {
        let mut readings = Vec::with_capacity(self.settings.metrics.len());
        for metric in &self.settings.metrics {
            match self.sample(*metric, at).await {
                Ok(reading) => readings.push(reading),
                Err(err) => {
                    tracing::warn!(%err, %metric, "sensor read failed, no reading produced");
                    self.state.update(|s| s.faults.sensor_faults += 1);
                }
            }
        }
        self.record(&readings).await;
        readings
    }

    async fn sample(&self, metric: Metric, at: Timestamp) -> Result<Reading, SporeKeeperError> {
        let value = tokio::time::timeout(self.settings.read_timeout, self.sensors.sample(metric))
            .await
            .map_err(|_| SensorFault::Timeout { metric })??;

        let quality = self.settings.range(metric).classify(value);
        if quality == QualityFlag::Invalid {
            tracing::warn!(%metric, value, "implausible sensor value flagged invalid");
            self.state.update(|s| s.faults.sensor_faults += 1);
        }
        Ok(Reading::new(self.settings.device_id.clone(), metric, value, at).with_quality(quality))
    }

    /// Journal first, then hand to the controller. Control continues even
    /// when the journal write fails; a failed round counts once toward
    /// protected mode. Nothing is journaled while the controller is protected.
    async fn record(&self, readings: &[Reading]) {
        if self.state.mode() == ControlMode::Normal {
            let mut writes = WriteSession::default();
            for reading in readings {
                let result = self.journal.append_reading(reading).await;
                if let Err(err) = &result {
                    tracing::error!(%err, metric = %reading.metric, "failed to journal reading");
                }
                writes.record(&result);
            }
            self.state.finish_write_session(writes);
        }
        for reading in readings {
            self.queue.push(ControlInput::Reading(reading.clone()));
        }
    }
}
