//! Error types for the vipen-ble crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// No peripheral with the given address is known to the adapter.
    #[error("Device not found: {address}")]
    DeviceNotFound {
        /// The address that was searched for.
        address: String,
    },

    /// Operation requires a ready link but the device is not connected.
    #[error("Device not connected")]
    NotConnected,

    /// Failed to establish a connection to the device.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The connection dropped while an operation was waiting on it.
    #[error("Connection lost")]
    ConnectionLost,

    /// A bounded wait expired without the expected confirmation.
    #[error("Operation timed out")]
    Timeout,

    /// The platform rejected a read, write or descriptor request.
    #[error("Transient I/O failure during {operation}")]
    TransientIo {
        /// The operation the platform refused.
        operation: String,
    },

    /// Invalid data was received from the device.
    #[error("Invalid data received: {context}")]
    InvalidData {
        /// Description of what was invalid about the data.
        context: String,
    },

    /// A waveform block belongs to a different capture than its header.
    #[error("Waveform block {index} has wave id {block}, header has {header}")]
    WaveIdMismatch {
        /// Wave id from the header.
        header: u8,
        /// Wave id carried by the offending block.
        block: u8,
        /// Position of the offending block in the transfer.
        index: usize,
    },

    /// A later operation of the same kind took over the tracking slot.
    #[error("Operation superseded by a newer request")]
    Superseded,

    /// The operation was cancelled through its progress token.
    #[error("Operation cancelled")]
    Cancelled,

    /// The requested operation is not supported by the platform.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// The requested operation conflicts with one already running.
    #[error("Busy: {reason}")]
    Busy {
        /// What the device or orchestrator is currently doing.
        reason: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },
}

impl Error {
    /// Whether this error is a recoverable timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::TransientIo { .. } | Self::Superseded | Self::Bluetooth(_)
        )
    }

    pub(crate) fn transient(operation: impl Into<String>) -> Self {
        Self::TransientIo {
            operation: operation.into(),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::Timeout.is_timeout());
        assert!(Error::Timeout.is_transient());
        assert!(Error::transient("read").is_transient());
        assert!(!Error::NotConnected.is_transient());
        assert!(!Error::NotConnected.is_timeout());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = Error::WaveIdMismatch {
            header: 4,
            block: 5,
            index: 7,
        };
        assert_eq!(
            err.to_string(),
            "Waveform block 7 has wave id 5, header has 4"
        );
        assert_eq!(Error::NotConnected.to_string(), "Device not connected");
    }
}
