//! BLE scanning functionality.
//!
//! Provides the passive scanner for discovering ViPen devices and decoding
//! their advertised readings.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::ble::advertising::AdvertisingData;
use crate::ble::platform::{AdapterEvent, Advertisement, GattAdapter};
use crate::config::ScanFilterConfig;
use crate::error::Result;

/// A ViPen advertisement that passed the filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViPenAdvertisement {
    /// Address of the advertiser.
    pub address: String,
    /// Decoded readings.
    pub data: AdvertisingData,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

/// Event emitted by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// A ViPen advertisement was received.
    Discovered(ViPenAdvertisement),
    /// The platform reported a scan failure.
    ScanFailed {
        /// Platform error code.
        code: i32,
    },
}

/// Decides which advertisements belong to ViPen devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementFilter {
    config: ScanFilterConfig,
}

impl AdvertisementFilter {
    /// Create a filter from its configuration.
    pub fn new(config: ScanFilterConfig) -> Self {
        Self { config }
    }

    /// Check whether an advertisement carries the manufacturer id and device name.
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        advertisement
            .manufacturer_data
            .contains_key(&self.config.manufacturer_id)
            && advertisement.local_name.as_deref() == Some(self.config.device_name.as_str())
    }

    /// Filter and decode an advertisement.
    pub fn decode(&self, advertisement: &Advertisement) -> Option<ViPenAdvertisement> {
        if !self.matches(advertisement) {
            return None;
        }

        let payload = advertisement
            .manufacturer_data
            .get(&self.config.manufacturer_id)?;

        match AdvertisingData::parse(payload) {
            Ok(data) => Some(ViPenAdvertisement {
                address: advertisement.address.clone(),
                data,
                rssi: advertisement.rssi,
            }),
            Err(e) => {
                trace!("Ignoring advertisement from {}: {}", advertisement.address, e);
                None
            }
        }
    }
}

/// BLE scanner for discovering ViPen devices.
pub struct Scanner {
    /// The adapter to scan with.
    adapter: Arc<dyn GattAdapter>,
    /// Which advertisements count as ViPens.
    filter: AdvertisementFilter,
    /// Whether scanning is currently active.
    is_scanning: Arc<RwLock<bool>>,
    /// Latest advertisement per device.
    discovered: Arc<RwLock<HashMap<String, ViPenAdvertisement>>>,
    /// Channel for scan events.
    event_tx: broadcast::Sender<ScanEvent>,
    /// Handle to the adapter event task.
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Scanner {
    /// Create a new scanner on an adapter.
    pub fn new(adapter: Arc<dyn GattAdapter>, filter: ScanFilterConfig) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            adapter,
            filter: AdvertisementFilter::new(filter),
            is_scanning: Arc::new(RwLock::new(false)),
            discovered: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            pump: Mutex::new(None),
        }
    }

    /// Start the task translating adapter events, once.
    fn ensure_pump(&self) {
        let mut pump = self.pump.lock();
        if pump.is_some() {
            return;
        }

        let mut events = self.adapter.events();
        let filter = self.filter.clone();
        let discovered = self.discovered.clone();
        let event_tx = self.event_tx.clone();

        *pump = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(AdapterEvent::Advertisement(advertisement)) => {
                        if let Some(vipen) = filter.decode(&advertisement) {
                            trace!("ViPen advertisement from {}", vipen.address);
                            discovered
                                .write()
                                .insert(vipen.address.clone(), vipen.clone());
                            let _ = event_tx.send(ScanEvent::Discovered(vipen));
                        }
                    }
                    Ok(AdapterEvent::ScanFailed { code }) => {
                        debug!("Scan failed with code {}", code);
                        let _ = event_tx.send(ScanEvent::ScanFailed { code });
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Scanner lagged, {} adapter events dropped", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Scan event loop ended");
        }));
    }

    /// Start scanning for ViPens.
    ///
    /// # Errors
    ///
    /// Returns an error if scanning cannot be started.
    pub async fn start_scanning(&self) -> Result<()> {
        if *self.is_scanning.read() {
            debug!("Already scanning, ignoring start request");
            return Ok(());
        }

        self.ensure_pump();

        info!("Starting BLE scan for ViPen devices");
        self.adapter.start_scan().await?;
        *self.is_scanning.write() = true;

        Ok(())
    }

    /// Stop scanning.
    pub async fn stop_scanning(&self) -> Result<()> {
        if !*self.is_scanning.read() {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE scan");
        *self.is_scanning.write() = false;
        self.adapter.stop_scan().await
    }

    /// Stop scanning, power-cycle the radio and scan again.
    ///
    /// Every step is attempted even if an earlier one fails; the first
    /// failure is returned.
    pub async fn restart_with_radio_cycle(&self, delay: Duration) -> Result<()> {
        info!("Restarting scan with a radio power cycle");

        let stopped = self.stop_scanning().await;
        let disabled = self.adapter.set_radio_enabled(false).await;
        if let Err(e) = &disabled {
            warn!("Failed to disable radio: {}", e);
        }
        tokio::time::sleep(delay).await;
        let enabled = self.adapter.set_radio_enabled(true).await;
        if let Err(e) = &enabled {
            warn!("Failed to enable radio: {}", e);
        }
        let started = self.start_scanning().await;

        stopped.and(started)
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        *self.is_scanning.read()
    }

    /// Latest advertisement per discovered device.
    pub fn discovered_devices(&self) -> HashMap<String, ViPenAdvertisement> {
        self.discovered.read().clone()
    }

    /// Subscribe to scan events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.event_tx.subscribe()
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Arc<dyn GattAdapter> {
        &self.adapter
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        *self.is_scanning.write() = false;
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}
