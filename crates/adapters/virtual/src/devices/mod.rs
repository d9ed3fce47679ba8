//! Simulated chamber hardware.
//!
//! Both devices share one [`Chamber`](crate::Chamber): what the actuators
//! switch is what the sensors later measure.

mod actuator;
mod sensor;

pub use actuator::VirtualActuators;
pub use sensor::VirtualSensors;
