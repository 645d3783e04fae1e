//! BLE transport link.
//!
//! A [`TransportLink`] owns one physical connection to one device. It turns
//! the platform's [`GattEvent`]s into link state (connection flag, discovery
//! and MTU results, per-operation completions, the block accumulator) and
//! offers bounded waits on top of that state. Every wait re-checks for a
//! dropped connection, so a disconnect aborts it at the next tick instead of
//! letting it run into its own timeout.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::block_reader::{ProgressToken, ReadAccumulator};
use crate::ble::characteristics::{
    OpKind, OpOutcome, OpTicket, OpTracker, SubscriptionMode, TicketState,
};
use crate::ble::platform::{ConnectionPriority, GattDevice, GattEvent};
use crate::ble::uuids::CLIENT_CHARACTERISTIC_CONFIG_UUID;
use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::utils::hex_preview;

/// Lifecycle of a transport link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LinkState {
    /// No connection.
    #[default]
    Disconnected,
    /// Waiting for the platform to report the connection.
    Connecting,
    /// Connected, services not yet discovered.
    Connected,
    /// Service discovery in progress.
    DiscoveringServices,
    /// Connected with services discovered.
    Ready,
    /// Waiting for the platform to confirm a disconnect.
    Disconnecting,
}

impl LinkState {
    /// Check if the physical link is up.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::Connected | Self::DiscoveringServices | Self::Ready
        )
    }

    /// Check if services have been discovered.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::DiscoveringServices | Self::Disconnecting
        )
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::DiscoveringServices => write!(f, "DiscoveringServices"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Mutable link state written by the event pump and read by waiters.
#[derive(Debug)]
struct LinkInner {
    state: LinkState,
    discovery_result: Option<bool>,
    mtu_result: Option<(u16, bool)>,
    mtu: u16,
    ops: OpTracker,
    accumulator: Option<ReadAccumulator>,
}

struct LinkShared {
    inner: Mutex<LinkInner>,
    changed: Notify,
    state_tx: broadcast::Sender<LinkState>,
}

impl LinkShared {
    fn set_state(&self, inner: &mut LinkInner, new_state: LinkState) {
        let old_state = std::mem::replace(&mut inner.state, new_state);
        if old_state != new_state {
            debug!("Link state changed: {} -> {}", old_state, new_state);
            let _ = self.state_tx.send(new_state);
        }
    }

    fn apply(&self, event: GattEvent) {
        let mut inner = self.inner.lock();

        match event {
            GattEvent::ConnectionStateChanged { connected: true } => {
                if !inner.state.is_connected() {
                    self.set_state(&mut inner, LinkState::Connected);
                }
            }
            GattEvent::ConnectionStateChanged { connected: false } => {
                if inner.state != LinkState::Disconnected {
                    info!("Device reported disconnection");
                }
                inner.ops.clear();
                inner.discovery_result = None;
                self.set_state(&mut inner, LinkState::Disconnected);
            }
            GattEvent::ServicesDiscovered { success } => {
                inner.discovery_result = Some(success);
            }
            GattEvent::MtuChanged { mtu, success } => {
                inner.mtu_result = Some((mtu, success));
                if success {
                    inner.mtu = mtu;
                }
            }
            GattEvent::CharacteristicRead {
                uuid,
                value,
                success,
            } => {
                let outcome = if success {
                    OpOutcome::Value(value)
                } else {
                    OpOutcome::Failed
                };
                inner.ops.complete(OpKind::Read, uuid, outcome);
            }
            GattEvent::CharacteristicWritten { uuid, success } => {
                let outcome = if success {
                    OpOutcome::Done
                } else {
                    OpOutcome::Failed
                };
                inner.ops.complete(OpKind::Write, uuid, outcome);
            }
            GattEvent::DescriptorWritten {
                characteristic,
                descriptor,
                success,
            } => {
                if descriptor == CLIENT_CHARACTERISTIC_CONFIG_UUID {
                    let outcome = if success {
                        OpOutcome::Done
                    } else {
                        OpOutcome::Failed
                    };
                    inner.ops.complete(OpKind::Descriptor, characteristic, outcome);
                }
            }
            GattEvent::CharacteristicChanged { uuid, value } => {
                trace!(
                    "Notification from {}: {} bytes [{}]",
                    uuid,
                    value.len(),
                    hex_preview(&value, 20)
                );
                if let Some(acc) = inner.accumulator.as_mut() {
                    acc.append(&uuid, &value);
                }
            }
        }

        drop(inner);
        self.changed.notify_waiters();
    }
}

/// One physical BLE connection to one device.
///
/// Must be created inside a Tokio runtime: construction spawns the task
/// that drains the device's event channel.
pub struct TransportLink {
    device: Arc<dyn GattDevice>,
    shared: Arc<LinkShared>,
    pump: Option<JoinHandle<()>>,
    config: LinkConfig,
}

impl TransportLink {
    /// Create a link for a device and start consuming its events.
    pub fn new(device: Arc<dyn GattDevice>, config: LinkConfig) -> Self {
        let (state_tx, _) = broadcast::channel(16);

        let shared = Arc::new(LinkShared {
            inner: Mutex::new(LinkInner {
                state: LinkState::Disconnected,
                discovery_result: None,
                mtu_result: None,
                mtu: config.default_mtu,
                ops: OpTracker::default(),
                accumulator: None,
            }),
            changed: Notify::new(),
            state_tx,
        });

        let mut events = device.events();
        let pump_shared = shared.clone();
        let pump = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => pump_shared.apply(event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Link event pump lagged, {} events dropped", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Link event pump stopped");
        });

        Self {
            device,
            shared,
            pump: Some(pump),
            config,
        }
    }

    /// Address of the device this link drives.
    pub fn address(&self) -> &str {
        self.device.address()
    }

    /// Get the current link state.
    pub fn state(&self) -> LinkState {
        self.shared.inner.lock().state
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Currently negotiated MTU.
    pub fn mtu(&self) -> u16 {
        self.shared.inner.lock().mtu
    }

    /// Service UUIDs reported by the platform.
    pub fn services(&self) -> Vec<Uuid> {
        self.device.services()
    }

    /// Subscribe to link state changes.
    pub fn subscribe_state(&self) -> broadcast::Receiver<LinkState> {
        self.shared.state_tx.subscribe()
    }

    fn set_state(&self, new_state: LinkState) {
        let mut inner = self.shared.inner.lock();
        self.shared.set_state(&mut inner, new_state);
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Re-run `check` on every link change and at least every poll interval
    /// until it yields a value or `deadline` passes.
    async fn wait_for<T>(
        &self,
        deadline: Instant,
        mut check: impl FnMut(&mut LinkInner) -> Option<T>,
    ) -> Option<T> {
        loop {
            let notified = self.shared.changed.notified();
            if let Some(value) = check(&mut self.shared.inner.lock()) {
                return Some(value);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let tick = (deadline - now).min(self.config.poll_interval);
            let _ = tokio::time::timeout(tick, notified).await;
        }
    }

    /// Connect to the device.
    ///
    /// Returns `true` immediately if the link is already up. On timeout the
    /// in-progress connection is torn down and `false` is returned.
    pub async fn connect(&self, timeout: Duration, prefer_direct: bool) -> bool {
        let current_state = self.state();

        if current_state.is_connected() {
            debug!("Already connected to {}", self.address());
            return true;
        }

        if current_state.is_transitioning() {
            warn!(
                "Connect requested while link is {}, refusing",
                current_state
            );
            return false;
        }

        self.set_state(LinkState::Connecting);

        if let Err(e) = self.device.request_connect(prefer_direct) {
            warn!("Platform refused connect to {}: {}", self.address(), e);
            self.set_state(LinkState::Disconnected);
            return false;
        }

        let deadline = Instant::now() + timeout;
        let outcome = self
            .wait_for(deadline, |inner| match inner.state {
                state if state.is_connected() => Some(true),
                LinkState::Disconnected => Some(false),
                _ => None,
            })
            .await;

        match outcome {
            Some(true) => {
                info!("Connected to {}", self.address());
                true
            }
            Some(false) => {
                warn!("Connection to {} dropped while connecting", self.address());
                self.device.close();
                false
            }
            None => {
                warn!(
                    "Connection to {} timed out after {:?}",
                    self.address(),
                    timeout
                );
                let _ = self.device.request_disconnect();
                self.device.close();
                self.set_state(LinkState::Disconnected);
                false
            }
        }
    }

    /// Disconnect from the device.
    ///
    /// Returns whether the platform confirmed the disconnect within `timeout`.
    /// Safe to call when already disconnected.
    pub async fn disconnect(&self, timeout: Duration) -> bool {
        if self.state() == LinkState::Disconnected {
            return true;
        }

        self.set_state(LinkState::Disconnecting);
        self.shared.inner.lock().accumulator = None;

        if let Err(e) = self.device.request_disconnect() {
            warn!("Platform refused disconnect from {}: {}", self.address(), e);
            self.device.close();
            self.set_state(LinkState::Disconnected);
            return false;
        }

        let deadline = Instant::now() + timeout;
        let confirmed = self
            .wait_for(deadline, |inner| {
                (inner.state == LinkState::Disconnected).then_some(())
            })
            .await
            .is_some();

        self.device.close();
        if confirmed {
            info!("Disconnected from {}", self.address());
        } else {
            warn!("Disconnect from {} not confirmed", self.address());
            let mut inner = self.shared.inner.lock();
            inner.ops.clear();
            self.shared.set_state(&mut inner, LinkState::Disconnected);
        }
        confirmed
    }

    /// Discover services.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if the link is not up.
    pub async fn discover_services(&self, timeout: Duration) -> Result<bool> {
        self.ensure_connected()?;

        {
            let mut inner = self.shared.inner.lock();
            inner.discovery_result = None;
            self.shared
                .set_state(&mut inner, LinkState::DiscoveringServices);
        }

        if let Err(e) = self.device.request_discover_services() {
            warn!("Platform refused service discovery: {}", e);
            self.set_state(LinkState::Connected);
            return Ok(false);
        }

        let deadline = Instant::now() + timeout;
        let outcome = self
            .wait_for(deadline, |inner| {
                if !inner.state.is_connected() {
                    return Some(false);
                }
                inner.discovery_result
            })
            .await;

        let discovered = outcome == Some(true);
        let mut inner = self.shared.inner.lock();
        if inner.state.is_connected() {
            let next = if discovered {
                LinkState::Ready
            } else {
                LinkState::Connected
            };
            self.shared.set_state(&mut inner, next);
        }
        drop(inner);

        if outcome.is_none() {
            warn!("Service discovery timed out after {:?}", timeout);
        }
        Ok(discovered)
    }

    /// Request a larger MTU.
    ///
    /// Returns the negotiated size, or `None` if the request failed or timed
    /// out; callers keep using the default frame size in that case.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if the link is not up.
    pub async fn change_mtu(&self, timeout: Duration, requested: u16) -> Result<Option<u16>> {
        self.ensure_connected()?;

        self.shared.inner.lock().mtu_result = None;

        if let Err(e) = self.device.request_mtu(requested) {
            debug!("Platform refused MTU request: {}", e);
            return Ok(None);
        }

        let deadline = Instant::now() + timeout;
        let outcome = self
            .wait_for(deadline, |inner| {
                if !inner.state.is_connected() {
                    return Some(None);
                }
                inner.mtu_result.map(|(mtu, success)| success.then_some(mtu))
            })
            .await
            .flatten();

        match outcome {
            Some(mtu) => debug!("MTU negotiated: {}", mtu),
            None => debug!("MTU negotiation to {} failed", requested),
        }
        Ok(outcome)
    }

    /// Ask the platform for a different connection interval class.
    pub fn request_connection_priority(&self, priority: ConnectionPriority) -> Result<()> {
        self.ensure_connected()?;
        self.device.request_connection_priority(priority)
    }

    async fn await_ticket(&self, ticket: OpTicket, timeout: Duration) -> Result<OpOutcome> {
        let deadline = Instant::now() + timeout;
        let outcome = self
            .wait_for(deadline, |inner| {
                if !inner.state.is_connected() {
                    return Some(Err(Error::ConnectionLost));
                }
                match inner.ops.poll(&ticket) {
                    TicketState::Pending => None,
                    TicketState::Ready(OpOutcome::Failed) => {
                        Some(Err(Error::transient(ticket.kind.to_string())))
                    }
                    TicketState::Ready(outcome) => Some(Ok(outcome)),
                    TicketState::Superseded => Some(Err(Error::Superseded)),
                }
            })
            .await;

        match outcome {
            Some(result) => result,
            None => {
                self.shared.inner.lock().ops.release(&ticket);
                debug!("{} on {} timed out", ticket.kind, ticket.uuid);
                Err(Error::Timeout)
            }
        }
    }

    /// Read a characteristic value.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] if no confirmation arrives in time,
    /// [`Error::TransientIo`] if the platform rejects or fails the read,
    /// [`Error::NotConnected`] / [`Error::ConnectionLost`] for link problems.
    pub async fn read_characteristic(&self, uuid: Uuid, timeout: Duration) -> Result<Vec<u8>> {
        self.ensure_connected()?;

        let ticket = self.shared.inner.lock().ops.begin(OpKind::Read, uuid);
        if let Err(e) = self.device.request_read(uuid) {
            self.shared.inner.lock().ops.release(&ticket);
            debug!("Platform refused read of {}: {}", uuid, e);
            return Err(Error::transient("read"));
        }

        match self.await_ticket(ticket, timeout).await? {
            OpOutcome::Value(data) => {
                trace!("Read {} bytes from characteristic {}", data.len(), uuid);
                Ok(data)
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Write to a characteristic and wait for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Same as [`TransportLink::read_characteristic`].
    pub async fn write_characteristic(
        &self,
        data: &[u8],
        uuid: Uuid,
        timeout: Duration,
    ) -> Result<()> {
        self.ensure_connected()?;

        let ticket = self.shared.inner.lock().ops.begin(OpKind::Write, uuid);
        if let Err(e) = self.device.request_write(uuid, data) {
            self.shared.inner.lock().ops.release(&ticket);
            debug!("Platform refused write to {}: {}", uuid, e);
            return Err(Error::transient("write"));
        }

        self.await_ticket(ticket, timeout).await?;
        trace!("Wrote {} bytes to characteristic {}", data.len(), uuid);
        Ok(())
    }

    /// Enable or disable pushes for a characteristic via its configuration descriptor.
    ///
    /// # Errors
    ///
    /// Same as [`TransportLink::read_characteristic`].
    pub async fn subscribe(
        &self,
        uuid: Uuid,
        enable: bool,
        timeout: Duration,
        use_indication: bool,
    ) -> Result<()> {
        self.ensure_connected()?;

        let mode = SubscriptionMode::from_flags(enable, use_indication);
        debug!("Setting {:?} on characteristic {}", mode, uuid);

        if let Err(e) = self.device.set_characteristic_notification(uuid, enable) {
            debug!("Platform refused notification change on {}: {}", uuid, e);
            return Err(Error::transient("set notification"));
        }

        let ticket = self
            .shared
            .inner
            .lock()
            .ops
            .begin(OpKind::Descriptor, uuid);
        if let Err(e) = self.device.request_descriptor_write(
            uuid,
            CLIENT_CHARACTERISTIC_CONFIG_UUID,
            &mode.cccd_value(),
        ) {
            self.shared.inner.lock().ops.release(&ticket);
            debug!("Platform refused descriptor write on {}: {}", uuid, e);
            return Err(Error::transient("descriptor write"));
        }

        self.await_ticket(ticket, timeout).await?;
        Ok(())
    }

    /// Install a fresh accumulator for notifications on `uuid`.
    ///
    /// Any previous accumulator is discarded. Used when the transfer must be
    /// armed before the command that triggers it.
    pub(crate) fn begin_block_read(&self, uuid: Uuid, min_total_bytes: usize) {
        let mut inner = self.shared.inner.lock();
        if inner.accumulator.is_some() {
            debug!("Discarding unfinished block read");
        }
        inner.accumulator = Some(ReadAccumulator::new(uuid, min_total_bytes));
    }

    /// Drop the current accumulator, if any.
    pub(crate) fn abort_block_read(&self) {
        self.shared.inner.lock().accumulator = None;
    }

    /// Wait for the armed accumulator to reach its target size.
    ///
    /// `stall_timeout` is measured from the last time new bytes arrived.
    /// Returns `Ok(None)` if the token is cancelled.
    pub(crate) async fn wait_block_read(
        &self,
        stall_timeout: Duration,
        token: &ProgressToken,
    ) -> Result<Option<Vec<u8>>> {
        let mut last_len = 0usize;
        let mut last_progress = Instant::now();

        loop {
            let notified = self.shared.changed.notified();

            {
                let mut inner = self.shared.inner.lock();

                if token.is_cancelled() {
                    inner.accumulator = None;
                    debug!("Block read cancelled after {} bytes", last_len);
                    return Ok(None);
                }

                if !inner.state.is_connected() {
                    inner.accumulator = None;
                    return Err(Error::ConnectionLost);
                }

                // Dropped by a disconnect or a newer transfer.
                let Some(acc) = inner.accumulator.as_ref() else {
                    return Err(Error::Cancelled);
                };

                let len = acc.len();
                if len != last_len {
                    last_len = len;
                    last_progress = Instant::now();
                    token.report(len, acc.target());
                }

                if acc.is_complete() {
                    let bytes = inner
                        .accumulator
                        .take()
                        .map(ReadAccumulator::into_bytes)
                        .unwrap_or_default();
                    debug!("Block read complete: {} bytes", bytes.len());
                    return Ok(Some(bytes));
                }
            }

            let now = Instant::now();
            let stall_deadline = last_progress + stall_timeout;
            if now >= stall_deadline {
                self.abort_block_read();
                warn!(
                    "Block read stalled at {} bytes for {:?}",
                    last_len, stall_timeout
                );
                return Err(Error::Timeout);
            }

            let tick = (stall_deadline - now).min(self.config.poll_interval);
            tokio::select! {
                _ = notified => {}
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }

    /// Collect notifications on `uuid` until at least `min_total_bytes` arrived.
    ///
    /// The stall timer restarts whenever new bytes arrive, so a slow but
    /// steady transfer may run far longer than `timeout` in total.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] if no bytes arrive for `timeout`,
    /// [`Error::NotConnected`] / [`Error::ConnectionLost`] for link problems.
    pub async fn read_block_with_notification(
        &self,
        uuid: Uuid,
        timeout: Duration,
        token: &ProgressToken,
        min_total_bytes: usize,
    ) -> Result<Option<Vec<u8>>> {
        self.ensure_connected()?;
        self.begin_block_read(uuid, min_total_bytes);
        token.report(0, min_total_bytes);
        self.wait_block_read(timeout, token).await
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink")
            .field("address", &self.address())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::*;
    use crate::testing::{FakeCall, FakeDevice};
    use tokio_test::{assert_err, assert_ok};

    fn link_for(device: &Arc<FakeDevice>) -> TransportLink {
        TransportLink::new(device.clone(), LinkConfig::default())
    }

    async fn connected_link(device: &Arc<FakeDevice>) -> TransportLink {
        let link = link_for(device);
        assert!(link.connect(Duration::from_secs(1), false).await);
        link
    }

    #[test]
    fn test_link_state() {
        assert!(!LinkState::Disconnected.is_connected());
        assert!(LinkState::Connected.is_connected());
        assert!(LinkState::Ready.is_connected());
        assert!(LinkState::Ready.is_ready());
        assert!(!LinkState::Connecting.is_connected());

        assert!(LinkState::Connecting.is_transitioning());
        assert!(LinkState::Disconnecting.is_transitioning());
        assert!(!LinkState::Ready.is_transitioning());
        assert_eq!(format!("{}", LinkState::Ready), "Ready");
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let device = FakeDevice::vipen("AA:BB");
        let link = link_for(&device);

        assert!(link.connect(Duration::from_secs(1), false).await);
        assert!(link.connect(Duration::from_secs(1), false).await);
        assert_eq!(device.count(|c| matches!(c, FakeCall::Connect)), 1);
    }

    #[tokio::test]
    async fn test_connect_timeout_tears_down() {
        let device = FakeDevice::vipen("AA:BB");
        device.behavior().respond_connect = false;
        let link = link_for(&device);

        let started = std::time::Instant::now();
        assert!(!link.connect(Duration::from_millis(50), true).await);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(link.state(), LinkState::Disconnected);
        assert_eq!(device.count(|c| matches!(c, FakeCall::Close)), 1);
    }

    #[tokio::test]
    async fn test_disconnect_when_already_disconnected() {
        let device = FakeDevice::vipen("AA:BB");
        let link = link_for(&device);
        assert!(link.disconnect(Duration::from_millis(50)).await);
        assert_eq!(device.count(|c| matches!(c, FakeCall::Disconnect)), 0);
    }

    #[tokio::test]
    async fn test_disconnect_confirmed() {
        let device = FakeDevice::vipen("AA:BB");
        let link = connected_link(&device).await;
        assert!(link.disconnect(Duration::from_secs(1)).await);
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_discover_services_requires_connection() {
        let device = FakeDevice::vipen("AA:BB");
        let link = link_for(&device);
        let result = link.discover_services(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_discover_services_reaches_ready() {
        let device = FakeDevice::vipen("AA:BB");
        let link = connected_link(&device).await;
        assert!(assert_ok!(link.discover_services(Duration::from_secs(1)).await));
        assert_eq!(link.state(), LinkState::Ready);
        assert!(link.services().contains(&VIPEN_SERVICE_UUID));
    }

    #[tokio::test]
    async fn test_change_mtu() {
        let device = FakeDevice::vipen("AA:BB");
        let link = connected_link(&device).await;
        assert_eq!(link.mtu(), 23);
        let mtu = assert_ok!(link.change_mtu(Duration::from_secs(1), 512).await);
        assert_eq!(mtu, Some(512));
        assert_eq!(link.mtu(), 512);

        device.behavior().respond_mtu = false;
        let mtu = assert_ok!(link.change_mtu(Duration::from_millis(30), 512).await);
        assert_eq!(mtu, None);
    }

    #[tokio::test]
    async fn test_read_characteristic() {
        let device = FakeDevice::vipen("AA:BB");
        device.set_value(LIVE_READ_CHARACTERISTIC_UUID, vec![1, 2, 3]);
        let link = connected_link(&device).await;

        let data = assert_ok!(
            link.read_characteristic(LIVE_READ_CHARACTERISTIC_UUID, Duration::from_secs(1))
                .await
        );
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_read_times_out_within_bound() {
        let device = FakeDevice::vipen("AA:BB");
        device.behavior().respond_reads = false;
        let link = connected_link(&device).await;

        let timeout = Duration::from_millis(60);
        let started = std::time::Instant::now();
        let result = link
            .read_characteristic(CONTROL_CHARACTERISTIC_UUID, timeout)
            .await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(Error::Timeout)));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_write_times_out_within_bound() {
        let device = FakeDevice::vipen("AA:BB");
        device.behavior().respond_writes = false;
        let link = connected_link(&device).await;

        let timeout = Duration::from_millis(60);
        let started = std::time::Instant::now();
        let result = link
            .write_characteristic(&[0x01, 0x00], CONTROL_CHARACTERISTIC_UUID, timeout)
            .await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(Error::Timeout)));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_subscribe_times_out_within_bound() {
        let device = FakeDevice::vipen("AA:BB");
        device.behavior().respond_descriptors = false;
        let link = connected_link(&device).await;

        let timeout = Duration::from_millis(60);
        let started = std::time::Instant::now();
        let result = link
            .subscribe(WAVEFORM_READ_CHARACTERISTIC_UUID, true, timeout, true)
            .await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(Error::Timeout)));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_discover_services_times_out_within_bound() {
        let device = FakeDevice::vipen("AA:BB");
        device.behavior().respond_discovery = false;
        let link = connected_link(&device).await;

        let timeout = Duration::from_millis(60);
        let started = std::time::Instant::now();
        let discovered = assert_ok!(link.discover_services(timeout).await);
        let elapsed = started.elapsed();

        assert!(!discovered);
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(200));
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_unconfirmed_forces_disconnected() {
        let device = FakeDevice::vipen("AA:BB");
        device.behavior().respond_disconnect = false;
        let link = connected_link(&device).await;

        let timeout = Duration::from_millis(60);
        let started = std::time::Instant::now();
        assert!(!link.disconnect(timeout).await);
        let elapsed = started.elapsed();

        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(200));
        assert_eq!(link.state(), LinkState::Disconnected);
        assert_eq!(device.count(|c| matches!(c, FakeCall::Close)), 1);

        let result = link
            .read_characteristic(CONTROL_CHARACTERISTIC_UUID, Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_read_rejected_is_transient() {
        let device = FakeDevice::vipen("AA:BB");
        device.behavior().reject_reads = true;
        let link = connected_link(&device).await;

        let err = assert_err!(
            link.read_characteristic(CONTROL_CHARACTERISTIC_UUID, Duration::from_secs(1))
                .await
        );
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_read_requires_connection() {
        let device = FakeDevice::vipen("AA:BB");
        let link = link_for(&device);
        let result = link
            .read_characteristic(CONTROL_CHARACTERISTIC_UUID, Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_disconnect_aborts_pending_read() {
        let device = FakeDevice::vipen("AA:BB");
        device.behavior().respond_reads = false;
        let link = connected_link(&device).await;

        let dropper = {
            let device = device.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                device.emit(GattEvent::ConnectionStateChanged { connected: false });
            })
        };

        let started = std::time::Instant::now();
        let result = link
            .read_characteristic(CONTROL_CHARACTERISTIC_UUID, Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(Error::ConnectionLost)));
        assert!(started.elapsed() < Duration::from_secs(1));
        dropper.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_characteristic() {
        let device = FakeDevice::vipen("AA:BB");
        let link = connected_link(&device).await;

        assert_ok!(
            link.write_characteristic(&[0x01, 0x00], CONTROL_CHARACTERISTIC_UUID, Duration::from_secs(1))
                .await
        );
        assert_eq!(
            device.count(|c| matches!(c, FakeCall::Write(uuid, data)
                if *uuid == CONTROL_CHARACTERISTIC_UUID && data == &[0x01, 0x00])),
            1
        );
    }

    #[tokio::test]
    async fn test_subscribe_writes_cccd() {
        let device = FakeDevice::vipen("AA:BB");
        let link = connected_link(&device).await;

        assert_ok!(
            link.subscribe(WAVEFORM_READ_CHARACTERISTIC_UUID, true, Duration::from_secs(1), true)
                .await
        );
        assert_ok!(
            link.subscribe(WAVEFORM_READ_CHARACTERISTIC_UUID, false, Duration::from_secs(1), true)
                .await
        );

        let writes: Vec<Vec<u8>> = device
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                FakeCall::Descriptor(uuid, value) if uuid == WAVEFORM_READ_CHARACTERISTIC_UUID => {
                    Some(value)
                }
                _ => None,
            })
            .collect();
        assert_eq!(writes, vec![vec![0x02, 0x00], vec![0x00, 0x00]]);
    }

    #[tokio::test]
    async fn test_block_read_completes() {
        let device = FakeDevice::vipen("AA:BB");
        let link = connected_link(&device).await;
        let token = ProgressToken::new();

        let feeder = {
            let device = device.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                for chunk in [vec![1u8; 4], vec![2u8; 4], vec![3u8; 4]] {
                    device.emit(GattEvent::CharacteristicChanged {
                        uuid: WAVEFORM_READ_CHARACTERISTIC_UUID,
                        value: chunk,
                    });
                }
            })
        };

        let data = assert_ok!(
            link.read_block_with_notification(
                WAVEFORM_READ_CHARACTERISTIC_UUID,
                Duration::from_secs(1),
                &token,
                12,
            )
            .await
        );
        feeder.await.unwrap();
        assert_eq!(data.map(|d| d.len()), Some(12));
        assert_eq!(token.bytes_received(), 12);
    }

    #[tokio::test]
    async fn test_indications_outside_block_read_are_dropped() {
        let device = FakeDevice::vipen("AA:BB");
        let link = connected_link(&device).await;
        let token = ProgressToken::new();

        device.emit(GattEvent::CharacteristicChanged {
            uuid: WAVEFORM_READ_CHARACTERISTIC_UUID,
            value: vec![9u8; 4],
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let feeder = {
            let device = device.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                device.emit(GattEvent::CharacteristicChanged {
                    uuid: WAVEFORM_READ_CHARACTERISTIC_UUID,
                    value: vec![1u8; 4],
                });
            })
        };

        let data = assert_ok!(
            link.read_block_with_notification(
                WAVEFORM_READ_CHARACTERISTIC_UUID,
                Duration::from_secs(1),
                &token,
                4,
            )
            .await
        );
        feeder.await.unwrap();
        assert_eq!(data, Some(vec![1u8; 4]));
    }

    #[tokio::test]
    async fn test_block_read_stall_timer_resets_on_progress() {
        let device = FakeDevice::vipen("AA:BB");
        let link = connected_link(&device).await;
        let token = ProgressToken::new();

        // 8 chunks, 40ms apart: 320ms in total against a 150ms stall timeout.
        let feeder = {
            let device = device.clone();
            tokio::spawn(async move {
                for _ in 0..8 {
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    device.emit(GattEvent::CharacteristicChanged {
                        uuid: WAVEFORM_READ_CHARACTERISTIC_UUID,
                        value: vec![0xAA; 10],
                    });
                }
            })
        };

        let data = assert_ok!(
            link.read_block_with_notification(
                WAVEFORM_READ_CHARACTERISTIC_UUID,
                Duration::from_millis(150),
                &token,
                80,
            )
            .await
        );
        feeder.await.unwrap();
        assert_eq!(data.map(|d| d.len()), Some(80));
    }

    #[tokio::test]
    async fn test_block_read_stalls() {
        let device = FakeDevice::vipen("AA:BB");
        let link = connected_link(&device).await;
        let token = ProgressToken::new();

        device.emit(GattEvent::CharacteristicChanged {
            uuid: WAVEFORM_READ_CHARACTERISTIC_UUID,
            value: vec![0; 4],
        });

        let started = std::time::Instant::now();
        let result = link
            .read_block_with_notification(
                WAVEFORM_READ_CHARACTERISTIC_UUID,
                Duration::from_millis(60),
                &token,
                100,
            )
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_block_read_cancelled() {
        let device = FakeDevice::vipen("AA:BB");
        let link = connected_link(&device).await;
        let token = ProgressToken::new();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel();
            })
        };

        let result = link
            .read_block_with_notification(
                WAVEFORM_READ_CHARACTERISTIC_UUID,
                Duration::from_secs(5),
                &token,
                100,
            )
            .await;
        canceller.await.unwrap();
        assert!(matches!(result, Ok(None)));
    }
}
