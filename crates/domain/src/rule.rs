//! Threshold rules with hysteresis.
//!
//! A rule ties one metric to one actuator. An `above` rule latches on when the
//! value exceeds the band maximum and releases only once the value falls below
//! `max - hysteresis`; a `below` rule mirrors this around the minimum. Inside
//! the dead-band the latch keeps its previous value, which is what prevents
//! actuator chatter.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::actuator::Actuator;
use crate::phase::ThresholdBand;
use crate::reading::Metric;

/// Which side of the band switches the actuator on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Above,
    Below,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Above => f.write_str("above"),
            Self::Below => f.write_str("below"),
        }
    }
}

/// A configured metric → actuator mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub metric: Metric,
    pub actuator: Actuator,
    pub trigger: Trigger,
}

impl Rule {
    #[must_use]
    pub fn new(metric: Metric, actuator: Actuator, trigger: Trigger) -> Self {
        Self {
            metric,
            actuator,
            trigger,
        }
    }

    /// Next latch value given the current latch and a fresh sample.
    #[must_use]
    pub fn next_latch(&self, band: &ThresholdBand, value: f64, latched: bool) -> bool {
        match self.trigger {
            Trigger::Above => {
                if value > band.max {
                    true
                } else if value < band.max - band.hysteresis {
                    false
                } else {
                    latched
                }
            }
            Trigger::Below => {
                if value < band.min {
                    true
                } else if value > band.min + band.hysteresis {
                    false
                } else {
                    latched
                }
            }
        }
    }

    /// The band edge this rule watches.
    #[must_use]
    pub fn bound(&self, band: &ThresholdBand) -> f64 {
        match self.trigger {
            Trigger::Above => band.max,
            Trigger::Below => band.min,
        }
    }

    /// Default rule set for a single-zone fruiting chamber.
    #[must_use]
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new(Metric::Co2, Actuator::ExhaustFan, Trigger::Above),
            Self::new(Metric::Humidity, Actuator::Humidifier, Trigger::Below),
            Self::new(Metric::Humidity, Actuator::ExhaustFan, Trigger::Above),
            Self::new(Metric::Temperature, Actuator::Heater, Trigger::Below),
            Self::new(Metric::Temperature, Actuator::ExhaustFan, Trigger::Above),
        ]
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}->{}", self.metric, self.trigger, self.actuator)
    }
}
