//! BLE communication module.
//!
//! This module provides the transport link and scanning layers used to
//! discover ViPen devices and exchange GATT traffic with them.

pub mod advertising;
pub mod block_reader;
pub mod btleplug_backend;
pub mod characteristics;
pub mod connection;
pub mod platform;
pub mod scanner;
pub mod uuids;

pub use advertising::AdvertisingData;
pub use block_reader::ProgressToken;
pub use btleplug_backend::{BtleplugAdapter, BtleplugDevice};
pub use characteristics::SubscriptionMode;
pub use connection::{LinkState, TransportLink};
pub use platform::{
    AdapterEvent, Advertisement, ConnectionPriority, GattAdapter, GattDevice, GattEvent,
};
pub use scanner::{AdvertisementFilter, ScanEvent, Scanner, ViPenAdvertisement};
pub use uuids::*;
