//! Control characteristic commands and status.
//!
//! Commands are 16-bit little-endian opcodes written to the control
//! characteristic. Reading the same characteristic returns a 16-bit status
//! bitfield.

use bytes::Buf;

use crate::error::{Error, Result};

/// Payload written to the waveform control characteristic to request velocity data.
pub const WAVEFORM_GET_VELOCITY: [u8; 2] = [0x01, 0x00];

/// Control command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    /// Return to idle without powering down.
    Idle = 0x0000,
    /// Start measuring.
    Start = 0x0001,
    /// Stop measuring.
    Stop = 0x0002,
    /// Power the pen off.
    Off = 0x0003,
}

impl Command {
    /// Create from raw opcode.
    pub fn from_raw(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::Idle),
            0x0001 => Some(Self::Start),
            0x0002 => Some(Self::Stop),
            0x0003 => Some(Self::Off),
            _ => None,
        }
    }

    /// Raw opcode value.
    pub fn opcode(&self) -> u16 {
        *self as u16
    }

    /// Encode for writing to the control characteristic.
    pub fn to_bytes(&self) -> [u8; 2] {
        self.opcode().to_le_bytes()
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Start => write!(f, "Start"),
            Self::Stop => write!(f, "Stop"),
            Self::Off => write!(f, "Off"),
        }
    }
}

/// Status bitfield read back from the control characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceStatus(pub u16);

impl DeviceStatus {
    /// Bit 0: measurement started.
    pub const STARTED: u16 = 0x0001;
    /// Bit 1: data available.
    pub const DATA_AVAILABLE: u16 = 0x0002;

    /// Parse status from characteristic data.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(Error::InvalidData {
                context: format!("Status data too short: {} bytes (need 2)", data.len()),
            });
        }
        let mut buf = data;
        Ok(Self(buf.get_u16_le()))
    }

    /// Whether the pen reports a running measurement.
    pub fn is_started(&self) -> bool {
        self.0 & Self::STARTED != 0
    }

    /// Whether the pen has data ready to read.
    pub fn has_data(&self) -> bool {
        self.0 & Self::DATA_AVAILABLE != 0
    }

    /// Raw status word.
    pub fn raw(&self) -> u16 {
        self.0
    }

    /// Encode the status word.
    pub fn to_bytes(&self) -> [u8; 2] {
        self.0.to_le_bytes()
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}, {}",
            if self.is_started() { "started" } else { "stopped" },
            if self.has_data() { "data available" } else { "no data" }
        )
    }
}
