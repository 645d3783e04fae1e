//! Platform boundary between the BLE stack and the transport link.
//!
//! Platform stacks report GATT completions through callbacks. Here every
//! completion is a [`GattEvent`] published on a broadcast channel owned by
//! the [`GattDevice`]; request methods only say whether the stack accepted
//! the request. The transport link turns those events into its own state
//! and never cares whether they came from a callback, a future or a test.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;

/// An asynchronous completion reported by the platform for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    /// The physical link went up or down.
    ConnectionStateChanged {
        /// Whether the device is now connected.
        connected: bool,
    },
    /// Service discovery finished.
    ServicesDiscovered {
        /// Whether discovery succeeded.
        success: bool,
    },
    /// MTU negotiation finished.
    MtuChanged {
        /// The negotiated MTU.
        mtu: u16,
        /// Whether the negotiation succeeded.
        success: bool,
    },
    /// A characteristic read finished.
    CharacteristicRead {
        /// Characteristic that was read.
        uuid: Uuid,
        /// Value read (empty on failure).
        value: Vec<u8>,
        /// Whether the read succeeded.
        success: bool,
    },
    /// A characteristic write was acknowledged.
    CharacteristicWritten {
        /// Characteristic that was written.
        uuid: Uuid,
        /// Whether the write succeeded.
        success: bool,
    },
    /// A descriptor write was acknowledged.
    DescriptorWritten {
        /// Characteristic owning the descriptor.
        characteristic: Uuid,
        /// Descriptor that was written.
        descriptor: Uuid,
        /// Whether the write succeeded.
        success: bool,
    },
    /// A notification or indication arrived.
    CharacteristicChanged {
        /// Characteristic that changed.
        uuid: Uuid,
        /// The pushed value.
        value: Vec<u8>,
    },
}

/// Requested connection interval class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionPriority {
    /// Platform default.
    #[default]
    Balanced,
    /// Short connection interval, higher throughput.
    High,
    /// Long connection interval, lower power.
    LowPower,
}

/// One BLE peripheral as seen by the platform stack.
///
/// Request methods return `Err` only when the stack refuses the request
/// outright; the outcome of an accepted request is reported later through
/// [`GattDevice::events`].
pub trait GattDevice: Send + Sync {
    /// Address string identifying the peripheral.
    fn address(&self) -> &str;

    /// Subscribe to completion events for this device.
    fn events(&self) -> broadcast::Receiver<GattEvent>;

    /// Service UUIDs known after discovery.
    fn services(&self) -> Vec<Uuid>;

    /// Start a connection attempt.
    fn request_connect(&self, prefer_direct: bool) -> Result<()>;

    /// Start a disconnect.
    fn request_disconnect(&self) -> Result<()>;

    /// Release the platform handle of an in-progress or finished connection.
    fn close(&self);

    /// Start service discovery.
    fn request_discover_services(&self) -> Result<()>;

    /// Ask for a larger MTU.
    fn request_mtu(&self, size: u16) -> Result<()>;

    /// Start a characteristic read.
    fn request_read(&self, characteristic: Uuid) -> Result<()>;

    /// Start a characteristic write.
    fn request_write(&self, characteristic: Uuid, value: &[u8]) -> Result<()>;

    /// Enable or disable local delivery of notifications for a characteristic.
    fn set_characteristic_notification(&self, characteristic: Uuid, enable: bool) -> Result<()>;

    /// Start a descriptor write.
    fn request_descriptor_write(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()>;

    /// Ask for a different connection interval class.
    fn request_connection_priority(&self, priority: ConnectionPriority) -> Result<()>;
}

/// A received advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Advertisement {
    /// Address of the advertiser.
    pub address: String,
    /// Advertised local name.
    pub local_name: Option<String>,
    /// Manufacturer-specific data keyed by company id.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

/// Event emitted by the adapter while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// An advertisement was received.
    Advertisement(Advertisement),
    /// The platform reported a scan failure.
    ScanFailed {
        /// Platform error code.
        code: i32,
    },
}

/// Handle to the host's BLE adapter.
///
/// Owned explicitly by whoever needs the radio and passed in at
/// construction, so its lifecycle follows the application's.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GattAdapter: Send + Sync {
    /// Resolve a device by address.
    async fn device(&self, address: &str) -> Result<Arc<dyn GattDevice>>;

    /// Start passive advertisement scanning.
    async fn start_scan(&self) -> Result<()>;

    /// Stop passive advertisement scanning.
    async fn stop_scan(&self) -> Result<()>;

    /// Power the radio on or off.
    async fn set_radio_enabled(&self, enabled: bool) -> Result<()>;

    /// Subscribe to scan events.
    fn events(&self) -> broadcast::Receiver<AdapterEvent>;
}
