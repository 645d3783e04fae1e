//! [`GattAdapter`] and [`GattDevice`] on top of btleplug.
//!
//! btleplug exposes futures rather than callbacks, so every request spawns a
//! task that awaits the btleplug call and publishes the matching
//! [`GattEvent`]. Things btleplug cannot do (MTU requests, connection
//! priority, radio power) are refused with [`Error::NotSupported`].

use async_trait::async_trait;
use btleplug::api::{
    CentralEvent, CharPropFlags, Characteristic, Central, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::platform::{
    AdapterEvent, Advertisement, ConnectionPriority, GattAdapter, GattDevice, GattEvent,
};
use crate::ble::uuids::CLIENT_CHARACTERISTIC_CONFIG_UUID;
use crate::error::{Error, Result};

/// Whether a CCCD value turns notifications or indications on.
fn cccd_enables(value: &[u8]) -> bool {
    value.iter().any(|b| *b != 0)
}

/// Prefer acknowledged writes when the characteristic supports them.
fn write_type_for(properties: CharPropFlags) -> WriteType {
    if properties.contains(CharPropFlags::WRITE) {
        WriteType::WithResponse
    } else {
        WriteType::WithoutResponse
    }
}

/// Connected device instances by address, for routing adapter-level disconnects.
///
/// An entry exists from a successful connect until that instance is closed,
/// so a disconnect reported for an earlier connection never reaches a newer
/// instance that is still connecting.
#[derive(Default)]
struct DisconnectRoutes {
    routes: RwLock<HashMap<String, (u64, broadcast::Sender<GattEvent>)>>,
}

impl DisconnectRoutes {
    fn register(&self, address: &str, instance: u64, tx: broadcast::Sender<GattEvent>) {
        self.routes
            .write()
            .insert(address.to_string(), (instance, tx));
    }

    /// Remove the entry for `address` if it still belongs to `instance`.
    fn unregister(&self, address: &str, instance: u64) {
        let mut routes = self.routes.write();
        if routes.get(address).is_some_and(|(owner, _)| *owner == instance) {
            routes.remove(address);
        }
    }

    /// Deliver a disconnect to the connected instance, consuming its entry.
    fn route_disconnect(&self, address: &str) -> bool {
        let Some((instance, tx)) = self.routes.write().remove(address) else {
            return false;
        };
        trace!("Routing disconnect of {} to instance {}", address, instance);
        let _ = tx.send(GattEvent::ConnectionStateChanged { connected: false });
        true
    }
}

/// Host adapter backed by btleplug.
pub struct BtleplugAdapter {
    adapter: Adapter,
    event_tx: broadcast::Sender<AdapterEvent>,
    routes: Arc<DisconnectRoutes>,
    next_instance: AtomicU64,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugAdapter {
    /// Use the first Bluetooth adapter of the host.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Self::with_adapter(adapter).await
    }

    /// Wrap a specific btleplug adapter.
    pub async fn with_adapter(adapter: Adapter) -> Result<Self> {
        let (event_tx, _) = broadcast::channel(256);
        let routes = Arc::new(DisconnectRoutes::default());

        let mut events = adapter.events().await.map_err(Error::Bluetooth)?;
        let pump_adapter = adapter.clone();
        let pump_tx = event_tx.clone();
        let pump_routes = routes.clone();

        let pump = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                Self::handle_event(event, &pump_adapter, &pump_tx, &pump_routes).await;
            }
            debug!("Adapter event loop ended");
        });

        Ok(Self {
            adapter,
            event_tx,
            routes,
            next_instance: AtomicU64::new(0),
            pump: Mutex::new(Some(pump)),
        })
    }

    /// Get the underlying btleplug adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn handle_event(
        event: CentralEvent,
        adapter: &Adapter,
        event_tx: &broadcast::Sender<AdapterEvent>,
        routes: &DisconnectRoutes,
    ) {
        match event {
            CentralEvent::ManufacturerDataAdvertisement {
                id,
                manufacturer_data,
            } => {
                let peripheral = match adapter.peripheral(&id).await {
                    Ok(p) => p,
                    Err(e) => {
                        trace!("Failed to get peripheral: {}", e);
                        return;
                    }
                };
                let properties = peripheral.properties().await.ok().flatten();

                let advertisement = Advertisement {
                    address: id.to_string(),
                    local_name: properties.as_ref().and_then(|p| p.local_name.clone()),
                    manufacturer_data,
                    rssi: properties.as_ref().and_then(|p| p.rssi),
                };
                let _ = event_tx.send(AdapterEvent::Advertisement(advertisement));
            }
            CentralEvent::DeviceDisconnected(id) => {
                let address = id.to_string();
                if !routes.route_disconnect(&address) {
                    debug!("Disconnect of {} has no connected instance", address);
                }
            }
            CentralEvent::DeviceConnected(id) => {
                debug!("Device connected: {:?}", id);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl GattAdapter for BtleplugAdapter {
    async fn device(&self, address: &str) -> Result<Arc<dyn GattDevice>> {
        let peripherals = self.adapter.peripherals().await?;
        let peripheral = peripherals
            .into_iter()
            .find(|p| p.id().to_string() == address)
            .ok_or_else(|| Error::DeviceNotFound {
                address: address.to_string(),
            })?;

        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(BtleplugDevice::new(
            peripheral,
            address.to_string(),
            instance,
            self.routes.clone(),
        )))
    }

    async fn start_scan(&self) -> Result<()> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn set_radio_enabled(&self, enabled: bool) -> Result<()> {
        Err(Error::NotSupported {
            operation: format!("setting radio power to {}", enabled),
        })
    }

    fn events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.event_tx.subscribe()
    }
}

impl Drop for BtleplugAdapter {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

/// One peripheral driven through btleplug.
pub struct BtleplugDevice {
    peripheral: Peripheral,
    address: String,
    instance: u64,
    routes: Arc<DisconnectRoutes>,
    event_tx: broadcast::Sender<GattEvent>,
    /// Forwards btleplug notifications while connected.
    notifications: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl BtleplugDevice {
    fn new(
        peripheral: Peripheral,
        address: String,
        instance: u64,
        routes: Arc<DisconnectRoutes>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            peripheral,
            address,
            instance,
            routes,
            event_tx,
            notifications: Arc::new(Mutex::new(None)),
        }
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            })
    }

    fn stop_notifications(&self) {
        if let Some(task) = self.notifications.lock().take() {
            task.abort();
        }
    }
}

impl GattDevice for BtleplugDevice {
    fn address(&self) -> &str {
        &self.address
    }

    fn events(&self) -> broadcast::Receiver<GattEvent> {
        self.event_tx.subscribe()
    }

    fn services(&self) -> Vec<Uuid> {
        self.peripheral.services().iter().map(|s| s.uuid).collect()
    }

    fn request_connect(&self, prefer_direct: bool) -> Result<()> {
        trace!(
            "Connecting to {} (direct preference {} not configurable)",
            self.address,
            prefer_direct
        );
        let peripheral = self.peripheral.clone();
        let tx = self.event_tx.clone();
        let notifications = self.notifications.clone();
        let routes = self.routes.clone();
        let address = self.address.clone();
        let instance = self.instance;

        tokio::spawn(async move {
            if let Err(e) = peripheral.connect().await {
                warn!("Connect failed: {}", e);
                let _ = tx.send(GattEvent::ConnectionStateChanged { connected: false });
                return;
            }
            routes.register(&address, instance, tx.clone());

            match peripheral.notifications().await {
                Ok(mut stream) => {
                    let forward_tx = tx.clone();
                    let task = tokio::spawn(async move {
                        while let Some(notification) = stream.next().await {
                            trace!(
                                "Notification from {}: {} bytes",
                                notification.uuid,
                                notification.value.len()
                            );
                            let _ = forward_tx.send(GattEvent::CharacteristicChanged {
                                uuid: notification.uuid,
                                value: notification.value,
                            });
                        }
                        debug!("Notification stream ended");
                    });
                    if let Some(old) = notifications.lock().replace(task) {
                        old.abort();
                    }
                }
                Err(e) => error!("Failed to get notifications stream: {}", e),
            }

            let _ = tx.send(GattEvent::ConnectionStateChanged { connected: true });
        });
        Ok(())
    }

    fn request_disconnect(&self) -> Result<()> {
        let peripheral = self.peripheral.clone();
        let tx = self.event_tx.clone();

        tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Disconnect failed: {}", e);
            }
            let _ = tx.send(GattEvent::ConnectionStateChanged { connected: false });
        });
        Ok(())
    }

    fn close(&self) {
        self.routes.unregister(&self.address, self.instance);
        self.stop_notifications();
    }

    fn request_discover_services(&self) -> Result<()> {
        let peripheral = self.peripheral.clone();
        let tx = self.event_tx.clone();

        tokio::spawn(async move {
            let success = match peripheral.discover_services().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Service discovery failed: {}", e);
                    false
                }
            };
            let _ = tx.send(GattEvent::ServicesDiscovered { success });
        });
        Ok(())
    }

    fn request_mtu(&self, size: u16) -> Result<()> {
        Err(Error::NotSupported {
            operation: format!("MTU request of {}", size),
        })
    }

    fn request_read(&self, characteristic: Uuid) -> Result<()> {
        let target = self.characteristic(characteristic)?;
        let peripheral = self.peripheral.clone();
        let tx = self.event_tx.clone();

        tokio::spawn(async move {
            let event = match peripheral.read(&target).await {
                Ok(value) => GattEvent::CharacteristicRead {
                    uuid: target.uuid,
                    value,
                    success: true,
                },
                Err(e) => {
                    debug!("Read of {} failed: {}", target.uuid, e);
                    GattEvent::CharacteristicRead {
                        uuid: target.uuid,
                        value: Vec::new(),
                        success: false,
                    }
                }
            };
            let _ = tx.send(event);
        });
        Ok(())
    }

    fn request_write(&self, characteristic: Uuid, value: &[u8]) -> Result<()> {
        let target = self.characteristic(characteristic)?;
        let write_type = write_type_for(target.properties);
        let value = value.to_vec();
        let peripheral = self.peripheral.clone();
        let tx = self.event_tx.clone();

        tokio::spawn(async move {
            let success = match peripheral.write(&target, &value, write_type).await {
                Ok(()) => true,
                Err(e) => {
                    debug!("Write to {} failed: {}", target.uuid, e);
                    false
                }
            };
            let _ = tx.send(GattEvent::CharacteristicWritten {
                uuid: target.uuid,
                success,
            });
        });
        Ok(())
    }

    fn set_characteristic_notification(&self, characteristic: Uuid, enable: bool) -> Result<()> {
        // btleplug routes every notification through one stream; only check
        // that the characteristic exists.
        self.characteristic(characteristic)?;
        trace!("Local notification delivery for {}: {}", characteristic, enable);
        Ok(())
    }

    fn request_descriptor_write(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()> {
        if descriptor != CLIENT_CHARACTERISTIC_CONFIG_UUID {
            return Err(Error::NotSupported {
                operation: format!("writing descriptor {}", descriptor),
            });
        }

        let target = self.characteristic(characteristic)?;
        let enable = cccd_enables(value);
        let peripheral = self.peripheral.clone();
        let tx = self.event_tx.clone();

        tokio::spawn(async move {
            let result = if enable {
                peripheral.subscribe(&target).await
            } else {
                peripheral.unsubscribe(&target).await
            };
            if let Err(e) = &result {
                debug!("CCCD write on {} failed: {}", target.uuid, e);
            }
            let _ = tx.send(GattEvent::DescriptorWritten {
                characteristic: target.uuid,
                descriptor,
                success: result.is_ok(),
            });
        });
        Ok(())
    }

    fn request_connection_priority(&self, priority: ConnectionPriority) -> Result<()> {
        Err(Error::NotSupported {
            operation: format!("connection priority {:?}", priority),
        })
    }
}

impl Drop for BtleplugDevice {
    fn drop(&mut self) {
        self.stop_notifications();
    }
}

impl std::fmt::Debug for BtleplugDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugDevice")
            .field("address", &self.address)
            .field("instance", &self.instance)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cccd_enables() {
        assert!(cccd_enables(&[0x01, 0x00]));
        assert!(cccd_enables(&[0x02, 0x00]));
        assert!(!cccd_enables(&[0x00, 0x00]));
        assert!(!cccd_enables(&[]));
    }

    #[test]
    fn test_disconnect_routed_to_connected_instance_only() {
        let routes = DisconnectRoutes::default();
        let (old_tx, mut old_rx) = broadcast::channel(4);
        let (new_tx, mut new_rx) = broadcast::channel(4);

        // The old instance closes before the new one has connected.
        routes.register("AA:BB", 1, old_tx);
        routes.unregister("AA:BB", 1);
        assert!(!routes.route_disconnect("AA:BB"));
        assert!(old_rx.try_recv().is_err());

        // Closing a stale instance leaves the current entry alone.
        routes.register("AA:BB", 2, new_tx);
        routes.unregister("AA:BB", 1);
        assert!(routes.route_disconnect("AA:BB"));
        assert_eq!(
            new_rx.try_recv().unwrap(),
            GattEvent::ConnectionStateChanged { connected: false }
        );

        // One report per connection.
        assert!(!routes.route_disconnect("AA:BB"));
    }

    #[test]
    fn test_write_type_for() {
        assert!(matches!(
            write_type_for(CharPropFlags::WRITE | CharPropFlags::READ),
            WriteType::WithResponse
        ));
        assert!(matches!(
            write_type_for(CharPropFlags::WRITE_WITHOUT_RESPONSE),
            WriteType::WithoutResponse
        ));
    }
}
