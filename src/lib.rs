// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # vipen-ble
//!
//! A cross-platform Rust library for talking to ViPen wireless vibration
//! pens over Bluetooth Low Energy.
//!
//! ## Features
//!
//! - **Passive Monitoring**: Decode velocity, acceleration, kurtosis and
//!   temperature straight from advertisements, without connecting
//! - **Live Polling**: Connect to a pen and read live values in a loop with
//!   automatic reconnect
//! - **Waveform Download**: Fetch a full velocity waveform as a sequence of
//!   indications, with progress reporting and cancellation
//! - **Scan Recovery**: Power-cycle the radio when the platform keeps
//!   failing to scan
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vipen_ble::{BtleplugAdapter, MonitorEvent, PollingOrchestrator, Result, ViPenConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let adapter = Arc::new(BtleplugAdapter::new().await?);
//!     let orchestrator = PollingOrchestrator::new(adapter, ViPenConfig::default());
//!     let mut events = orchestrator.subscribe();
//!
//!     // Listen to advertisements until a pen shows up
//!     orchestrator.initialize().await?;
//!     while orchestrator.last_seen_device().is_none() {
//!         tokio::time::sleep(std::time::Duration::from_millis(100)).await;
//!     }
//!
//!     // Switch to connected polling
//!     orchestrator.start_polling().await;
//!     for _ in 0..10 {
//!         if let Ok(MonitorEvent::Sample(sample)) = events.recv().await {
//!             println!("{:.2} mm/s", sample.velocity);
//!         }
//!     }
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! btleplug negotiates the MTU itself and cannot set connection priority or
//! radio power; those requests are reported as unsupported and skipped.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod config;
pub mod data;
pub mod device;
pub mod error;
pub mod orchestrator;
pub mod protocol;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use config::{LinkConfig, PollingConfig, ProtocolConfig, ScanFilterConfig, ViPenConfig};
pub use device::ViPen;
pub use error::{Error, Result};
pub use orchestrator::{CallbackHandle, MonitorEvent, OrchestratorState, PollingOrchestrator};
pub use utils::{scale_raw, scale_sample};

// Re-export commonly used types from submodules
pub use ble::{
    BtleplugAdapter, GattAdapter, GattDevice, LinkState, ProgressToken, Scanner, TransportLink,
};
pub use data::{LiveSample, SampleOrigin, WaveformSample};
pub use protocol::{Command, DeviceStatus, LiveValues};
