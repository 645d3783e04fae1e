//! Live-value characteristic parsing.

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

/// Instantaneous readings from the live-value characteristic.
///
/// Layout (15 bytes, little-endian, packed):
/// - Byte 0: Device address
/// - Bytes 1-2: Record id (u16)
/// - Bytes 3-6: Device timestamp (u32)
/// - Bytes 7-14: Velocity, acceleration, kurtosis, temperature (4 × i16)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LiveValues {
    /// Device address byte.
    pub address: u8,
    /// Record id.
    pub id: u16,
    /// Device timestamp.
    pub timestamp: u32,
    /// Raw velocity.
    pub velocity: i16,
    /// Raw acceleration.
    pub acceleration: i16,
    /// Raw kurtosis.
    pub kurtosis: i16,
    /// Raw temperature.
    pub temperature: i16,
}

impl LiveValues {
    /// Encoded size in bytes.
    pub const SIZE: usize = 15;

    /// Parse live values from characteristic data.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::InvalidData {
                context: format!(
                    "Live data too short: {} bytes (need {})",
                    data.len(),
                    Self::SIZE
                ),
            });
        }

        let mut buf = data;
        Ok(Self {
            address: buf.get_u8(),
            id: buf.get_u16_le(),
            timestamp: buf.get_u32_le(),
            velocity: buf.get_i16_le(),
            acceleration: buf.get_i16_le(),
            kurtosis: buf.get_i16_le(),
            temperature: buf.get_i16_le(),
        })
    }

    /// Encode to the on-wire layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.put_u8(self.address);
        buf.put_u16_le(self.id);
        buf.put_u32_le(self.timestamp);
        buf.put_i16_le(self.velocity);
        buf.put_i16_le(self.acceleration);
        buf.put_i16_le(self.kurtosis);
        buf.put_i16_le(self.temperature);
        buf
    }

    /// The four measurement fields in velocity, acceleration, kurtosis, temperature order.
    pub fn raw_values(&self) -> [i16; 4] {
        [
            self.velocity,
            self.acceleration,
            self.kurtosis,
            self.temperature,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_live_values() {
        let data = [
            0x07, // address
            0x34, 0x12, // id
            0x78, 0x56, 0x34, 0x12, // timestamp
            0xFA, 0x00, // 250
            0x32, 0x00, // 50
            0xF6, 0xFF, // -10
            0xC8, 0x00, // 200
        ];

        let values = LiveValues::parse(&data).unwrap();
        assert_eq!(
            values,
            LiveValues {
                address: 7,
                id: 0x1234,
                timestamp: 0x1234_5678,
                velocity: 250,
                acceleration: 50,
                kurtosis: -10,
                temperature: 200,
            }
        );
        assert_eq!(values.raw_values(), [250, 50, -10, 200]);
        assert_eq!(values.to_bytes(), data.to_vec());
    }

    #[test]
    fn test_parse_live_values_too_short() {
        let result = LiveValues::parse(&[0u8; 14]);
        assert!(matches!(result, Err(Error::InvalidData { .. })));
    }
}
