//! Hardware ports: the chamber's sensors and actuators.

use std::future::Future;

use sporekeeper_domain::actuator::Actuator;
use sporekeeper_domain::error::SporeKeeperError;
use sporekeeper_domain::reading::Metric;

/// Drives physical actuators. Applying the current state again is a no-op.
pub trait ActuatorDriver: Send + Sync {
    /// Switch `actuator` on or off.
    ///
    /// Fails with [`SporeKeeperError::Actuator`] when the commanded state was
    /// not reached.
    fn apply(
        &self,
        actuator: Actuator,
        on: bool,
    ) -> impl Future<Output = Result<(), SporeKeeperError>> + Send;

    /// Read back the physical state.
    fn read(&self, actuator: Actuator) -> impl Future<Output = Result<bool, SporeKeeperError>> + Send;
}

/// Produces raw sensor values.
pub trait SensorSource: Send + Sync {
    /// Sample one metric. Fails with [`SporeKeeperError::Sensor`].
    fn sample(&self, metric: Metric) -> impl Future<Output = Result<f64, SporeKeeperError>> + Send;
}
