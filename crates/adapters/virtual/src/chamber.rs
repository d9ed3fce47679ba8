//! A coarse physical model of the chamber air.
//!
//! Each quantity relaxes towards the room ambient and is pushed by whichever
//! outputs are on. Time only advances when the model is observed, by the
//! wall-clock time elapsed since the previous observation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sporekeeper_domain::actuator::Actuator;
use sporekeeper_domain::reading::Metric;

use crate::lock;

/// Room conditions the chamber relaxes towards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ambient {
    pub temperature: f64,
    pub humidity: f64,
    pub co2: f64,
}

impl Default for Ambient {
    fn default() -> Self {
        Self {
            temperature: 19.0,
            humidity: 55.0,
            co2: 420.0,
        }
    }
}

// Per-second rates.
const RELAX: f64 = 0.002;
const HEATER_GAIN: f64 = 0.03;
const HUMIDIFIER_GAIN: f64 = 0.2;
const FAN_DRYING: f64 = 0.05;
const FAN_EXCHANGE: f64 = 0.02;
const RESPIRATION: f64 = 1.5;

#[derive(Debug)]
struct Model {
    ambient: Ambient,
    temperature: f64,
    humidity: f64,
    co2: f64,
    outputs: BTreeMap<Actuator, bool>,
    observed_at: Instant,
}

impl Model {
    fn on(&self, actuator: Actuator) -> bool {
        self.outputs.get(&actuator).copied().unwrap_or(false)
    }

    fn step(&mut self, seconds: f64) {
        let fan = self.on(Actuator::ExhaustFan);
        let heater = self.on(Actuator::Heater);
        let humidifier = self.on(Actuator::Humidifier);

        self.temperature += seconds * RELAX * (self.ambient.temperature - self.temperature);
        if heater {
            self.temperature += seconds * HEATER_GAIN;
        }

        self.humidity += seconds * RELAX * (self.ambient.humidity - self.humidity);
        if humidifier {
            self.humidity += seconds * HUMIDIFIER_GAIN;
        }
        if fan {
            self.humidity -= seconds * FAN_DRYING;
        }
        self.humidity = self.humidity.clamp(0.0, 100.0);

        self.co2 += seconds * RESPIRATION;
        if fan {
            let exchange = (seconds * FAN_EXCHANGE).min(1.0);
            self.co2 -= exchange * (self.co2 - self.ambient.co2);
        }
        self.co2 = self.co2.max(self.ambient.co2);
    }

    fn value(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Temperature => self.temperature,
            Metric::Humidity => self.humidity,
            Metric::Co2 => self.co2,
        }
    }
}

/// Shared handle to the simulated chamber. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Chamber {
    model: Arc<Mutex<Model>>,
}

impl Default for Chamber {
    fn default() -> Self {
        Self::new(Ambient::default())
    }
}

impl Chamber {
    /// A chamber that starts at ambient conditions with every output off.
    #[must_use]
    pub fn new(ambient: Ambient) -> Self {
        let model = Model {
            ambient,
            temperature: ambient.temperature,
            humidity: ambient.humidity,
            co2: ambient.co2,
            outputs: Actuator::ALL.into_iter().map(|a| (a, false)).collect(),
            observed_at: Instant::now(),
        };
        Self {
            model: Arc::new(Mutex::new(model)),
        }
    }

    /// Current value of `metric`, after advancing the model to now.
    #[must_use]
    pub fn observe(&self, metric: Metric) -> f64 {
        let mut model = lock(&self.model);
        let now = Instant::now();
        let elapsed = now.duration_since(model.observed_at);
        model.observed_at = now;
        model.step(elapsed.as_secs_f64());
        model.value(metric)
    }

    /// Advance the model by `duration` without waiting for it.
    pub fn advance(&self, duration: Duration) {
        lock(&self.model).step(duration.as_secs_f64());
    }

    /// Overwrite one quantity, e.g. to stage a scenario.
    pub fn set(&self, metric: Metric, value: f64) {
        let mut model = lock(&self.model);
        match metric {
            Metric::Temperature => model.temperature = value,
            Metric::Humidity => model.humidity = value,
            Metric::Co2 => model.co2 = value,
        }
    }

    #[must_use]
    pub fn output(&self, actuator: Actuator) -> bool {
        lock(&self.model).on(actuator)
    }

    pub(crate) fn set_output(&self, actuator: Actuator, on: bool) {
        lock(&self.model).outputs.insert(actuator, on);
    }
}
