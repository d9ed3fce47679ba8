//! Cultivation phase and its threshold bands.
//!
//! The phase is selected by an operator or remote command only; nothing in the
//! controller moves between phases on its own.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::reading::Metric;

/// Operator-selected cultivation stage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Spawning,
    Fruiting,
}

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Fruiting => "fruiting",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spawning" => Ok(Self::Spawning),
            "fruiting" => Ok(Self::Fruiting),
            other => Err(ValidationError::UnknownName {
                kind: "phase",
                value: other.to_string(),
            }),
        }
    }
}

/// Acceptable range for one metric plus the dead-band used to release a
/// latched actuator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdBand {
    pub min: f64,
    pub max: f64,
    pub hysteresis: f64,
}

impl ThresholdBand {
    #[must_use]
    pub fn new(min: f64, max: f64, hysteresis: f64) -> Self {
        Self {
            min,
            max,
            hysteresis,
        }
    }

    /// Check that the band is well formed for `metric`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvertedBand`] when `min >= max`, or
    /// [`ValidationError::InvalidHysteresis`] when the gap is negative or not
    /// narrower than the band.
    pub fn validate(&self, metric: Metric) -> Result<(), ValidationError> {
        if self.min.is_nan() || self.max.is_nan() || self.min >= self.max {
            return Err(ValidationError::InvertedBand {
                metric,
                min: self.min,
                max: self.max,
            });
        }
        if self.hysteresis.is_nan()
            || self.hysteresis < 0.0
            || self.hysteresis >= self.max - self.min
        {
            return Err(ValidationError::InvalidHysteresis { metric });
        }
        Ok(())
    }
}

/// Threshold bands active while a given [`Phase`] is selected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseProfile {
    pub phase: Phase,
    pub bands: BTreeMap<Metric, ThresholdBand>,
}

impl PhaseProfile {
    /// Band for `metric`, if this phase regulates it.
    #[must_use]
    pub fn band(&self, metric: Metric) -> Option<&ThresholdBand> {
        self.bands.get(&metric)
    }

    /// Validate every band of the profile.
    ///
    /// # Errors
    ///
    /// Returns the first band validation failure.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (metric, band) in &self.bands {
            band.validate(*metric)?;
        }
        Ok(())
    }

    /// Typical bands for colonisation: warm, humid, tolerant of CO2.
    #[must_use]
    pub fn default_spawning() -> Self {
        Self {
            phase: Phase::Spawning,
            bands: BTreeMap::from([
                (Metric::Temperature, ThresholdBand::new(22.0, 26.0, 0.5)),
                (Metric::Humidity, ThresholdBand::new(85.0, 95.0, 2.0)),
                (Metric::Co2, ThresholdBand::new(300.0, 5000.0, 250.0)),
            ]),
        }
    }

    /// Typical bands for fruiting: cooler, humid, fresh air.
    #[must_use]
    pub fn default_fruiting() -> Self {
        Self {
            phase: Phase::Fruiting,
            bands: BTreeMap::from([
                (Metric::Temperature, ThresholdBand::new(16.0, 20.0, 0.5)),
                (Metric::Humidity, ThresholdBand::new(85.0, 95.0, 2.0)),
                (Metric::Co2, ThresholdBand::new(300.0, 1000.0, 50.0)),
            ]),
        }
    }
}
