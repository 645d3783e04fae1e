//! In-memory platform fakes for tests.
//!
//! [`FakeDevice`] answers every accepted request with the matching
//! [`GattEvent`] and models just enough of the pen to drive the protocol:
//! a status word toggled by Start/Stop, a live-value characteristic and a
//! waveform transfer streamed as indications once subscribed.

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ble::platform::{
    AdapterEvent, Advertisement, ConnectionPriority, GattAdapter, GattDevice, GattEvent,
};
use crate::ble::uuids::*;
use crate::error::{Error, Result};
use crate::protocol::{Command, WAVEFORM_GET_VELOCITY};

/// A request seen by a [`FakeDevice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FakeCall {
    Connect,
    Disconnect,
    Close,
    Discover,
    Mtu(u16),
    Read(Uuid),
    Write(Uuid, Vec<u8>),
    Notify(Uuid, bool),
    Descriptor(Uuid, Vec<u8>),
    Priority(ConnectionPriority),
}

/// Knobs controlling how a [`FakeDevice`] answers.
#[derive(Debug)]
pub(crate) struct FakeBehavior {
    pub respond_connect: bool,
    pub respond_disconnect: bool,
    pub respond_discovery: bool,
    pub respond_mtu: bool,
    pub respond_reads: bool,
    pub reject_reads: bool,
    pub fail_live_reads: bool,
    pub reject_writes: bool,
    pub respond_writes: bool,
    pub respond_descriptors: bool,
    /// Waveform chunks streamed before the transfer goes quiet.
    pub waveform_chunk_limit: Option<usize>,
    /// Leading control writes answered with a failure.
    pub failing_control_writes: u32,
    pub reject_priority: bool,
    pub mtu: u16,
    /// Status word reported after a Start command.
    pub status_after_start: u16,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            respond_connect: true,
            respond_disconnect: true,
            respond_discovery: true,
            respond_mtu: true,
            respond_reads: true,
            reject_reads: false,
            fail_live_reads: false,
            reject_writes: false,
            respond_writes: true,
            respond_descriptors: true,
            waveform_chunk_limit: None,
            failing_control_writes: 0,
            reject_priority: false,
            mtu: 512,
            status_after_start: DEVICE_STARTED_WITH_DATA,
        }
    }
}

const DEVICE_STARTED_WITH_DATA: u16 = 0x0003;

#[derive(Debug, Default)]
struct FakeState {
    connected: bool,
    status: u16,
    values: HashMap<Uuid, Vec<u8>>,
    subscribed: HashMap<Uuid, bool>,
    waveform: Option<Vec<u8>>,
    mtu: u16,
}

/// Scripted in-memory peripheral.
pub(crate) struct FakeDevice {
    address: String,
    services: Vec<Uuid>,
    tx: broadcast::Sender<GattEvent>,
    behavior: Mutex<FakeBehavior>,
    state: Mutex<FakeState>,
    calls: Mutex<Vec<FakeCall>>,
}

impl FakeDevice {
    pub fn new(address: &str, services: Vec<Uuid>) -> Arc<Self> {
        let (tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            address: address.to_string(),
            services,
            tx,
            behavior: Mutex::new(FakeBehavior::default()),
            state: Mutex::new(FakeState {
                mtu: 23,
                ..Default::default()
            }),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// A device exposing the ViPen service.
    pub fn vipen(address: &str) -> Arc<Self> {
        Self::new(address, vec![VIPEN_SERVICE_UUID])
    }

    pub fn behavior(&self) -> MutexGuard<'_, FakeBehavior> {
        self.behavior.lock()
    }

    pub fn set_value(&self, uuid: Uuid, value: Vec<u8>) {
        self.state.lock().values.insert(uuid, value);
    }

    pub fn set_status(&self, status: u16) {
        self.state.lock().status = status;
    }

    pub fn status(&self) -> u16 {
        self.state.lock().status
    }

    /// Bytes streamed on the waveform characteristic after a velocity request.
    pub fn set_waveform(&self, transfer: Vec<u8>) {
        self.state.lock().waveform = Some(transfer);
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Publish an event as if the platform reported it.
    pub fn emit(&self, event: GattEvent) {
        if let GattEvent::ConnectionStateChanged { connected } = event {
            self.state.lock().connected = connected;
        }
        let _ = self.tx.send(event);
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&FakeCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| predicate(c)).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: FakeCall) {
        self.calls.lock().push(call);
    }

    fn require_connected(&self) -> Result<()> {
        if self.state.lock().connected {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    fn handle_control_write(&self, value: &[u8]) -> bool {
        {
            let mut behavior = self.behavior.lock();
            if behavior.failing_control_writes > 0 {
                behavior.failing_control_writes -= 1;
                return false;
            }
        }

        let opcode = match value {
            [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
            _ => return false,
        };
        let status_after_start = self.behavior.lock().status_after_start;
        let mut state = self.state.lock();
        match Command::from_raw(opcode) {
            Some(Command::Start) => state.status = status_after_start,
            Some(_) => state.status = 0,
            None => return false,
        }
        true
    }

    fn stream_waveform(&self) {
        let (chunks, subscribed) = {
            let state = self.state.lock();
            let subscribed = state
                .subscribed
                .get(&WAVEFORM_READ_CHARACTERISTIC_UUID)
                .copied()
                .unwrap_or(false);
            let chunk_size = usize::from(state.mtu.saturating_sub(3).max(1));
            let chunks: Vec<Vec<u8>> = state
                .waveform
                .as_deref()
                .map(|data| data.chunks(chunk_size).map(<[u8]>::to_vec).collect())
                .unwrap_or_default();
            (chunks, subscribed)
        };

        if !subscribed {
            return;
        }
        let limit = self.behavior.lock().waveform_chunk_limit.unwrap_or(usize::MAX);
        for chunk in chunks.into_iter().take(limit) {
            let _ = self.tx.send(GattEvent::CharacteristicChanged {
                uuid: WAVEFORM_READ_CHARACTERISTIC_UUID,
                value: chunk,
            });
        }
    }
}

impl GattDevice for FakeDevice {
    fn address(&self) -> &str {
        &self.address
    }

    fn events(&self) -> broadcast::Receiver<GattEvent> {
        self.tx.subscribe()
    }

    fn services(&self) -> Vec<Uuid> {
        self.services.clone()
    }

    fn request_connect(&self, _prefer_direct: bool) -> Result<()> {
        self.record(FakeCall::Connect);
        if self.behavior.lock().respond_connect {
            self.emit(GattEvent::ConnectionStateChanged { connected: true });
        }
        Ok(())
    }

    fn request_disconnect(&self) -> Result<()> {
        self.record(FakeCall::Disconnect);
        if self.behavior.lock().respond_disconnect {
            self.emit(GattEvent::ConnectionStateChanged { connected: false });
        }
        Ok(())
    }

    fn close(&self) {
        self.record(FakeCall::Close);
    }

    fn request_discover_services(&self) -> Result<()> {
        self.record(FakeCall::Discover);
        self.require_connected()?;
        if self.behavior.lock().respond_discovery {
            let _ = self.tx.send(GattEvent::ServicesDiscovered { success: true });
        }
        Ok(())
    }

    fn request_mtu(&self, size: u16) -> Result<()> {
        self.record(FakeCall::Mtu(size));
        self.require_connected()?;
        let (respond, supported) = {
            let behavior = self.behavior.lock();
            (behavior.respond_mtu, behavior.mtu)
        };
        if respond {
            let mtu = size.min(supported);
            self.state.lock().mtu = mtu;
            let _ = self.tx.send(GattEvent::MtuChanged { mtu, success: true });
        }
        Ok(())
    }

    fn request_read(&self, characteristic: Uuid) -> Result<()> {
        self.record(FakeCall::Read(characteristic));
        self.require_connected()?;

        let (respond, reject, fail_live) = {
            let behavior = self.behavior.lock();
            (
                behavior.respond_reads,
                behavior.reject_reads,
                behavior.fail_live_reads,
            )
        };
        if reject {
            return Err(Error::transient("read"));
        }
        if !respond {
            return Ok(());
        }

        let event = if fail_live && characteristic == LIVE_READ_CHARACTERISTIC_UUID {
            GattEvent::CharacteristicRead {
                uuid: characteristic,
                value: Vec::new(),
                success: false,
            }
        } else {
            let state = self.state.lock();
            let value = if characteristic == CONTROL_CHARACTERISTIC_UUID {
                state.status.to_le_bytes().to_vec()
            } else {
                state.values.get(&characteristic).cloned().unwrap_or_default()
            };
            GattEvent::CharacteristicRead {
                uuid: characteristic,
                value,
                success: true,
            }
        };
        let _ = self.tx.send(event);
        Ok(())
    }

    fn request_write(&self, characteristic: Uuid, value: &[u8]) -> Result<()> {
        self.record(FakeCall::Write(characteristic, value.to_vec()));
        self.require_connected()?;
        let (reject, respond) = {
            let behavior = self.behavior.lock();
            (behavior.reject_writes, behavior.respond_writes)
        };
        if reject {
            return Err(Error::transient("write"));
        }
        if !respond {
            return Ok(());
        }

        let success = if characteristic == CONTROL_CHARACTERISTIC_UUID {
            self.handle_control_write(value)
        } else {
            true
        };

        if characteristic == WAVEFORM_CONTROL_CHARACTERISTIC_UUID && value == WAVEFORM_GET_VELOCITY
        {
            self.stream_waveform();
        }

        let _ = self.tx.send(GattEvent::CharacteristicWritten {
            uuid: characteristic,
            success,
        });
        Ok(())
    }

    fn set_characteristic_notification(&self, characteristic: Uuid, enable: bool) -> Result<()> {
        self.record(FakeCall::Notify(characteristic, enable));
        self.require_connected()
    }

    fn request_descriptor_write(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()> {
        self.record(FakeCall::Descriptor(characteristic, value.to_vec()));
        self.require_connected()?;
        if !self.behavior.lock().respond_descriptors {
            return Ok(());
        }
        let enabled = value.first().copied().unwrap_or(0) != 0;
        self.state
            .lock()
            .subscribed
            .insert(characteristic, enabled);
        let _ = self.tx.send(GattEvent::DescriptorWritten {
            characteristic,
            descriptor,
            success: true,
        });
        Ok(())
    }

    fn request_connection_priority(&self, priority: ConnectionPriority) -> Result<()> {
        self.record(FakeCall::Priority(priority));
        if self.behavior.lock().reject_priority {
            return Err(Error::NotSupported {
                operation: "connection priority".to_string(),
            });
        }
        Ok(())
    }
}

/// Scan-side call seen by a [`FakeAdapter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AdapterCall {
    StartScan,
    StopScan,
    Radio(bool),
}

/// In-memory adapter resolving addresses to [`FakeDevice`]s.
pub(crate) struct FakeAdapter {
    devices: Mutex<HashMap<String, Arc<FakeDevice>>>,
    tx: broadcast::Sender<AdapterEvent>,
    calls: Mutex<Vec<AdapterCall>>,
}

impl FakeAdapter {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(256);
        Arc::new(Self {
            devices: Mutex::new(HashMap::new()),
            tx,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn add_device(&self, device: Arc<FakeDevice>) {
        self.devices
            .lock()
            .insert(device.address().to_string(), device);
    }

    pub fn advertise(&self, advertisement: Advertisement) {
        let _ = self.tx.send(AdapterEvent::Advertisement(advertisement));
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: AdapterCall) -> usize {
        self.calls.lock().iter().filter(|c| **c == call).count()
    }
}

#[async_trait]
impl GattAdapter for FakeAdapter {
    async fn device(&self, address: &str) -> Result<Arc<dyn GattDevice>> {
        self.devices
            .lock()
            .get(address)
            .cloned()
            .map(|device| device as Arc<dyn GattDevice>)
            .ok_or_else(|| Error::DeviceNotFound {
                address: address.to_string(),
            })
    }

    async fn start_scan(&self) -> Result<()> {
        self.calls.lock().push(AdapterCall::StartScan);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.calls.lock().push(AdapterCall::StopScan);
        Ok(())
    }

    async fn set_radio_enabled(&self, enabled: bool) -> Result<()> {
        self.calls.lock().push(AdapterCall::Radio(enabled));
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.tx.subscribe()
    }
}

/// Advertisement carrying the ViPen name, manufacturer id 13 and the given readings.
pub(crate) fn vipen_advertisement(address: &str, raw: [i16; 4]) -> Advertisement {
    let mut payload = vec![0u8; 7];
    for value in raw {
        payload.extend_from_slice(&value.to_le_bytes());
    }
    Advertisement {
        address: address.to_string(),
        local_name: Some("ViPen".to_string()),
        manufacturer_data: HashMap::from([(13u16, payload)]),
        rssi: Some(-60),
    }
}
