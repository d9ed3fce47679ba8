//! Virtual actuator bank: switches the chamber's outputs.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use sporekeeper_app::ports::ActuatorDriver;
use sporekeeper_domain::actuator::Actuator;
use sporekeeper_domain::error::{ActuatorFault, SporeKeeperError};

use crate::chamber::Chamber;
use crate::lock;

/// Relays for the exhaust fan, humidifier and heater. Clones share jam state.
#[derive(Clone)]
pub struct VirtualActuators {
    chamber: Chamber,
    jammed: Arc<Mutex<BTreeSet<Actuator>>>,
}

impl VirtualActuators {
    #[must_use]
    pub fn new(chamber: Chamber) -> Self {
        Self {
            chamber,
            jammed: Arc::default(),
        }
    }

    /// Make the relay of `actuator` ignore commands until [`Self::free`].
    pub fn jam(&self, actuator: Actuator) {
        lock(&self.jammed).insert(actuator);
    }

    pub fn free(&self, actuator: Actuator) {
        lock(&self.jammed).remove(&actuator);
    }
}

impl ActuatorDriver for VirtualActuators {
    async fn apply(&self, actuator: Actuator, on: bool) -> Result<(), SporeKeeperError> {
        if self.chamber.output(actuator) == on {
            return Ok(());
        }
        if lock(&self.jammed).contains(&actuator) {
            return Err(ActuatorFault {
                actuator,
                target: on,
                reason: "relay did not switch".to_string(),
            }
            .into());
        }
        self.chamber.set_output(actuator, on);
        tracing::debug!(%actuator, on, "virtual relay switched");
        Ok(())
    }

    async fn read(&self, actuator: Actuator) -> Result<bool, SporeKeeperError> {
        Ok(self.chamber.output(actuator))
    }
}
