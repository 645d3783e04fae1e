//! Live measurement samples.

use chrono::{DateTime, Utc};

use crate::protocol::LiveValues;
use crate::utils::scale_raw;

/// Where a live sample came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SampleOrigin {
    /// Decoded from a passive advertisement.
    Advertising,
    /// Read over an active connection.
    Polling,
}

impl std::fmt::Display for SampleOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Advertising => write!(f, "Advertising"),
            Self::Polling => write!(f, "Polling"),
        }
    }
}

/// An instantaneous vibration reading.
///
/// Values are already scaled from the raw int16 fields (hundredths).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LiveSample {
    /// When the sample was taken on this host.
    pub timestamp: DateTime<Utc>,
    /// Vibration velocity.
    pub velocity: f64,
    /// Vibration acceleration.
    pub acceleration: f64,
    /// Kurtosis of the acceleration signal.
    pub kurtosis: f64,
    /// Surface temperature.
    pub temperature: f64,
    /// Address of the source device.
    pub device: String,
    /// How the sample was obtained.
    pub origin: SampleOrigin,
}

impl LiveSample {
    /// Build a sample from the four raw fields in velocity, acceleration,
    /// kurtosis, temperature order, stamped with the current time.
    pub fn from_raw(device: impl Into<String>, raw: [i16; 4], origin: SampleOrigin) -> Self {
        let [velocity, acceleration, kurtosis, temperature] = raw;
        Self {
            timestamp: Utc::now(),
            velocity: scale_raw(velocity),
            acceleration: scale_raw(acceleration),
            kurtosis: scale_raw(kurtosis),
            temperature: scale_raw(temperature),
            device: device.into(),
            origin,
        }
    }

    /// Build a polling sample from a live-value read.
    pub fn from_live_values(device: impl Into<String>, values: &LiveValues) -> Self {
        Self::from_raw(device, values.raw_values(), SampleOrigin::Polling)
    }
}
