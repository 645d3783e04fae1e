//! Advertising data parsing.
//!
//! Parses manufacturer-specific advertising data from ViPen devices. The pen
//! broadcasts its latest readings, so a passive scanner can produce live
//! samples without ever connecting.

use bytes::Buf;

use crate::data::{LiveSample, SampleOrigin};
use crate::error::{Error, Result};

/// Parsed advertising payload from a ViPen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdvertisingData {
    /// Raw velocity.
    pub velocity: i16,
    /// Raw acceleration.
    pub acceleration: i16,
    /// Raw kurtosis.
    pub kurtosis: i16,
    /// Raw temperature.
    pub temperature: i16,
}

impl AdvertisingData {
    /// Reserved bytes preceding the readings.
    const RESERVED: usize = 7;

    /// Minimum size of advertising data payload.
    pub const MIN_SIZE: usize = Self::RESERVED + 8;

    /// Parse advertising data from raw bytes.
    ///
    /// # Arguments
    ///
    /// * `data` - Raw manufacturer-specific advertising data
    ///
    /// # Returns
    ///
    /// Parsed advertising data or an error.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE {
            return Err(Error::InvalidData {
                context: format!(
                    "Advertising data too short: {} bytes (need at least {})",
                    data.len(),
                    Self::MIN_SIZE
                ),
            });
        }

        // Bytes 0-6: reserved
        let mut buf = &data[Self::RESERVED..];

        // Bytes 7-14: four little-endian int16 readings
        Ok(Self {
            velocity: buf.get_i16_le(),
            acceleration: buf.get_i16_le(),
            kurtosis: buf.get_i16_le(),
            temperature: buf.get_i16_le(),
        })
    }

    /// The four readings in velocity, acceleration, kurtosis, temperature order.
    pub fn raw_values(&self) -> [i16; 4] {
        [
            self.velocity,
            self.acceleration,
            self.kurtosis,
            self.temperature,
        ]
    }

    /// Convert to a live sample attributed to `device`.
    pub fn to_sample(&self, device: impl Into<String>) -> LiveSample {
        LiveSample::from_raw(device, self.raw_values(), SampleOrigin::Advertising)
    }
}
