//! Reading: an immutable environment sample.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::id::{DeviceId, ReadingId};
use crate::time::Timestamp;

/// Environment quantity measured inside the chamber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Temperature,
    Humidity,
    Co2,
}

impl Metric {
    /// Every metric, in a stable order.
    pub const ALL: [Self; 3] = [Self::Temperature, Self::Humidity, Self::Co2];

    /// The unit this metric is always reported in.
    #[must_use]
    pub fn unit(self) -> Unit {
        match self {
            Self::Temperature => Unit::Celsius,
            Self::Humidity => Unit::Percent,
            Self::Co2 => Unit::Ppm,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Co2 => "co2",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temperature" => Ok(Self::Temperature),
            "humidity" => Ok(Self::Humidity),
            "co2" => Ok(Self::Co2),
            other => Err(ValidationError::UnknownName {
                kind: "metric",
                value: other.to_string(),
            }),
        }
    }
}

/// Measurement unit attached to a [`Reading`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Celsius,
    Percent,
    Ppm,
}

/// Acquisition-time assessment of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    #[default]
    Good,
    /// Plausible but flagged by the driver (e.g. sensor warming up).
    Suspect,
    /// Non-finite or outside the physically plausible range.
    Invalid,
}

/// One sample of one metric. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub id: ReadingId,
    pub device_id: DeviceId,
    pub metric: Metric,
    /// Raw sample. Non-finite values serialize as `"NaN"`, `"inf"` or `"-inf"`.
    #[serde(with = "raw_value")]
    pub value: f64,
    pub unit: Unit,
    pub timestamp: Timestamp,
    pub quality: QualityFlag,
}

impl Reading {
    /// Create a good-quality reading with a fresh id.
    #[must_use]
    pub fn new(device_id: DeviceId, metric: Metric, value: f64, timestamp: Timestamp) -> Self {
        Self {
            id: ReadingId::new(),
            device_id,
            metric,
            value,
            unit: metric.unit(),
            timestamp,
            quality: QualityFlag::Good,
        }
    }

    /// Return a copy carrying the given quality flag.
    #[must_use]
    pub fn with_quality(mut self, quality: QualityFlag) -> Self {
        self.quality = quality;
        self
    }

    /// Whether the controller may act on this reading.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.quality != QualityFlag::Invalid && self.value.is_finite()
    }

    /// Check domain invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::NonFiniteValue`] for NaN or infinite values
    /// that were not already flagged invalid.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.value.is_finite() && self.quality != QualityFlag::Invalid {
            return Err(ValidationError::NonFiniteValue);
        }
        Ok(())
    }
}

/// Physically plausible range for a metric; values outside are flagged invalid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlausibleRange {
    pub min: f64,
    pub max: f64,
}

impl PlausibleRange {
    /// Default plausible range for common chamber sensors.
    #[must_use]
    pub fn default_for(metric: Metric) -> Self {
        match metric {
            Metric::Temperature => Self {
                min: -20.0,
                max: 60.0,
            },
            Metric::Humidity => Self {
                min: 0.0,
                max: 100.0,
            },
            Metric::Co2 => Self {
                min: 0.0,
                max: 10_000.0,
            },
        }
    }

    /// Classify a raw value.
    #[must_use]
    pub fn classify(&self, value: f64) -> QualityFlag {
        if !value.is_finite() || value < self.min || value > self.max {
            QualityFlag::Invalid
        } else {
            QualityFlag::Good
        }
    }
}

/// JSON has no NaN or infinity, so invalid samples keep their raw value as text.
mod raw_value {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_sign_positive() {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Number(value) => Ok(value),
            Raw::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("invalid reading value {other:?}"))),
            },
        }
    }
}
