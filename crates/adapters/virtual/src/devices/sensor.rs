//! Virtual sensor bank: reads the chamber model with measurement noise.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use rand::Rng;
use sporekeeper_app::ports::SensorSource;
use sporekeeper_domain::error::{SensorFault, SporeKeeperError};
use sporekeeper_domain::reading::Metric;

use crate::chamber::Chamber;
use crate::lock;

/// Simulated temperature, humidity and CO2 probes. Clones share fault state.
#[derive(Clone)]
pub struct VirtualSensors {
    chamber: Chamber,
    noise: f64,
    failing: Arc<Mutex<BTreeSet<Metric>>>,
}

impl VirtualSensors {
    #[must_use]
    pub fn new(chamber: Chamber) -> Self {
        Self {
            chamber,
            noise: 0.0,
            failing: Arc::default(),
        }
    }

    /// Add uniform noise of up to `amplitude` percent of the true value.
    #[must_use]
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise = amplitude.abs() / 100.0;
        self
    }

    /// Make every read of `metric` fail until [`Self::recover`].
    pub fn fail(&self, metric: Metric) {
        lock(&self.failing).insert(metric);
    }

    pub fn recover(&self, metric: Metric) {
        lock(&self.failing).remove(&metric);
    }
}

impl SensorSource for VirtualSensors {
    async fn sample(&self, metric: Metric) -> Result<f64, SporeKeeperError> {
        if lock(&self.failing).contains(&metric) {
            return Err(SensorFault::ReadFailed {
                metric,
                reason: "simulated probe failure".to_string(),
            }
            .into());
        }
        let value = self.chamber.observe(metric);
        if self.noise == 0.0 {
            return Ok(value);
        }
        let factor = rand::thread_rng().gen_range(-self.noise..=self.noise);
        Ok(value * (1.0 + factor))
    }
}
