//! ViPen device protocol.
//!
//! [`ViPen`] drives the pen's command set on top of a [`TransportLink`].
//! Every public operation holds one device-wide lock for its whole
//! duration, so commands never interleave with each other or with
//! connect and disconnect.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::ble::block_reader::ProgressToken;
use crate::ble::connection::TransportLink;
use crate::ble::platform::{ConnectionPriority, GattAdapter};
use crate::ble::uuids::*;
use crate::config::{LinkConfig, ProtocolConfig};
use crate::data::WaveformSample;
use crate::error::{Error, Result};
use crate::protocol::{
    decode_transfer, Command, DeviceStatus, LiveValues, TRANSFER_SIZE, WAVEFORM_GET_VELOCITY,
};

/// A ViPen reached through an adapter.
pub struct ViPen {
    adapter: Arc<dyn GattAdapter>,
    link_config: LinkConfig,
    config: ProtocolConfig,
    /// Exclusive-access lock around the current link.
    link: Mutex<Option<TransportLink>>,
}

impl ViPen {
    /// Create a protocol driver on an adapter.
    pub fn new(adapter: Arc<dyn GattAdapter>, link_config: LinkConfig, config: ProtocolConfig) -> Self {
        Self {
            adapter,
            link_config,
            config,
            link: Mutex::new(None),
        }
    }

    /// Protocol settings in use.
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Address of the currently linked device, if any.
    pub async fn address(&self) -> Option<String> {
        self.link
            .lock()
            .await
            .as_ref()
            .map(|link| link.address().to_string())
    }

    /// Check if the link is up.
    pub async fn is_connected(&self) -> bool {
        self.link
            .lock()
            .await
            .as_ref()
            .map(TransportLink::is_connected)
            .unwrap_or(false)
    }

    fn ready_link(slot: &Option<TransportLink>) -> Result<&TransportLink> {
        slot.as_ref()
            .filter(|link| link.is_connected())
            .ok_or(Error::NotConnected)
    }

    /// Connect to a pen by address.
    ///
    /// Retries the transport connect, discovers services and verifies the
    /// ViPen service is present. The MTU and connection-priority bumps that
    /// follow are best-effort. Returns `true` right away if already
    /// connected to `address`.
    #[instrument(skip(self))]
    pub async fn connect(&self, address: &str) -> bool {
        let mut slot = self.link.lock().await;
        match self.connect_locked(&mut slot, address).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to connect to {}: {}", address, e);
                false
            }
        }
    }

    async fn connect_locked(&self, slot: &mut Option<TransportLink>, address: &str) -> Result<()> {
        if let Some(link) = slot.as_ref() {
            if link.address() == address && link.state().is_ready() {
                debug!("Already connected to {}", address);
                return Ok(());
            }
            link.disconnect(self.config.disconnect_timeout).await;
            *slot = None;
        }

        let device = self.adapter.device(address).await?;
        let link = TransportLink::new(device, self.link_config.clone());

        let mut connected = false;
        for attempt in 1..=self.config.connect_attempts {
            if link.connect(self.config.connect_timeout, true).await {
                connected = true;
                break;
            }
            warn!(
                "Connect attempt {}/{} to {} failed",
                attempt, self.config.connect_attempts, address
            );
            if attempt < self.config.connect_attempts {
                tokio::time::sleep(self.config.retry_delay * attempt).await;
            }
        }
        if !connected {
            return Err(Error::ConnectionFailed {
                reason: format!(
                    "no connection after {} attempts",
                    self.config.connect_attempts
                ),
            });
        }

        if !link.discover_services(self.config.discovery_timeout).await? {
            link.disconnect(self.config.disconnect_timeout).await;
            return Err(Error::ConnectionFailed {
                reason: "service discovery failed".to_string(),
            });
        }

        if !link.services().contains(&VIPEN_SERVICE_UUID) {
            link.disconnect(self.config.disconnect_timeout).await;
            return Err(Error::ServiceNotFound {
                uuid: VIPEN_SERVICE_UUID.to_string(),
            });
        }

        match link
            .change_mtu(self.config.mtu_timeout, self.config.requested_mtu)
            .await
        {
            Ok(Some(mtu)) => debug!("Using MTU {}", mtu),
            Ok(None) => warn!("MTU negotiation failed, falling back to short frames"),
            Err(e) => warn!("MTU negotiation failed: {}", e),
        }

        if let Err(e) = link.request_connection_priority(ConnectionPriority::High) {
            debug!("Connection priority not raised: {}", e);
        }

        info!("ViPen {} ready", address);
        *slot = Some(link);
        Ok(())
    }

    /// Disconnect from the current pen.
    ///
    /// Returns whether the disconnect was confirmed; `true` if nothing was connected.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> bool {
        let mut slot = self.link.lock().await;
        match slot.take() {
            Some(link) => link.disconnect(self.config.disconnect_timeout).await,
            None => true,
        }
    }

    async fn write_command(&self, link: &TransportLink, command: Command) -> Result<()> {
        debug!("Sending {} command", command);
        link.write_characteristic(
            &command.to_bytes(),
            CONTROL_CHARACTERISTIC_UUID,
            self.config.io_timeout,
        )
        .await
    }

    async fn write_command_with_retry(&self, link: &TransportLink, command: Command) -> Result<()> {
        let attempts = self.config.command_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.write_command(link, command).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < attempts => {
                    debug!(
                        "{} command attempt {}/{} failed: {}",
                        command, attempt, attempts, e
                    );
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_status_from(&self, link: &TransportLink, timeout: Duration) -> Result<DeviceStatus> {
        let data = link
            .read_characteristic(CONTROL_CHARACTERISTIC_UUID, timeout)
            .await?;
        DeviceStatus::parse(&data)
    }

    /// Read the status bitfield.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] without a link, transport errors otherwise.
    #[instrument(skip(self), level = "debug")]
    pub async fn read_status(&self) -> Result<DeviceStatus> {
        let slot = self.link.lock().await;
        let link = Self::ready_link(&slot)?;
        self.read_status_from(link, self.config.io_timeout).await
    }

    /// Check whether data becomes available after a Start, within the
    /// configured measurement timeout.
    pub async fn start_measurement(&self) -> bool {
        self.start_measurement_with_timeout(self.config.measurement_timeout)
            .await
    }

    /// Check whether data becomes available after a Start.
    ///
    /// Writes Start, polls the status until the data-available bit is set or
    /// `timeout` passes, and always writes Stop afterwards.
    #[instrument(skip(self))]
    pub async fn start_measurement_with_timeout(&self, timeout: Duration) -> bool {
        let slot = self.link.lock().await;
        let link = match Self::ready_link(&slot) {
            Ok(link) => link,
            Err(e) => {
                warn!("Cannot start measurement: {}", e);
                return false;
            }
        };

        let result = self.await_data_available(link, timeout).await;

        if let Err(e) = self.write_command(link, Command::Stop).await {
            warn!("Failed to stop after measurement check: {}", e);
        }

        match result {
            Ok(available) => available,
            Err(e) => {
                warn!("Measurement check failed: {}", e);
                false
            }
        }
    }

    async fn await_data_available(&self, link: &TransportLink, timeout: Duration) -> Result<bool> {
        self.write_command(link, Command::Start).await?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("No data within {:?}", timeout);
                return Ok(false);
            }

            match self
                .read_status_from(link, self.config.status_read_timeout.min(remaining))
                .await
            {
                Ok(status) if status.has_data() => return Ok(true),
                Ok(status) => debug!("Status: {}", status),
                Err(e) if e.is_transient() => debug!("Status read failed: {}", e),
                Err(e) => return Err(e),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.config.retry_delay.min(remaining)).await;
        }
    }

    /// Start measuring, unless the pen already reports a running measurement.
    #[instrument(skip(self))]
    pub async fn start(&self) -> bool {
        let slot = self.link.lock().await;
        let link = match Self::ready_link(&slot) {
            Ok(link) => link,
            Err(e) => {
                warn!("Cannot start: {}", e);
                return false;
            }
        };

        match self.read_status_from(link, self.config.io_timeout).await {
            Ok(status) if status.is_started() => {
                debug!("Measurement already running");
                return true;
            }
            Ok(_) => {}
            Err(e) => debug!("Status read before start failed: {}", e),
        }

        match self.write_command_with_retry(link, Command::Start).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Start failed: {}", e);
                false
            }
        }
    }

    /// Stop measuring. Failures are logged, never returned.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let slot = self.link.lock().await;
        let result = match Self::ready_link(&slot) {
            Ok(link) => self.write_command_with_retry(link, Command::Stop).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Stop failed: {}", e);
        }
    }

    async fn send(&self, command: Command) -> bool {
        let slot = self.link.lock().await;
        let result = match Self::ready_link(&slot) {
            Ok(link) => self.write_command_with_retry(link, command).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("{} command failed: {}", command, e);
                false
            }
        }
    }

    /// Power the pen off.
    #[instrument(skip(self))]
    pub async fn power_off(&self) -> bool {
        self.send(Command::Off).await
    }

    /// Return the pen to idle.
    #[instrument(skip(self))]
    pub async fn set_idle(&self) -> bool {
        self.send(Command::Idle).await
    }

    /// Read the instantaneous values.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] without a link, transport or decode errors otherwise.
    #[instrument(skip(self), level = "debug")]
    pub async fn read_live_values(&self) -> Result<LiveValues> {
        let slot = self.link.lock().await;
        let link = Self::ready_link(&slot)?;
        let data = link
            .read_characteristic(LIVE_READ_CHARACTERISTIC_UUID, self.config.io_timeout)
            .await?;
        LiveValues::parse(&data)
    }

    /// Download the buffered velocity waveform.
    ///
    /// Returns `Ok(None)` if `token` is cancelled. The waveform
    /// characteristic is unsubscribed again whatever the outcome.
    ///
    /// # Errors
    ///
    /// Fails if the request write fails, the transfer stalls, or the
    /// blocks do not decode into one capture.
    #[instrument(skip(self, token))]
    pub async fn download_waveform(&self, token: &ProgressToken) -> Result<Option<WaveformSample>> {
        let slot = self.link.lock().await;
        let link = Self::ready_link(&slot)?;

        let result = self.download_from(link, token).await;

        if let Err(e) = link
            .subscribe(
                WAVEFORM_READ_CHARACTERISTIC_UUID,
                false,
                self.config.io_timeout,
                true,
            )
            .await
        {
            debug!("Failed to unsubscribe from waveform data: {}", e);
        }

        result
    }

    async fn download_from(
        &self,
        link: &TransportLink,
        token: &ProgressToken,
    ) -> Result<Option<WaveformSample>> {
        link.subscribe(
            WAVEFORM_READ_CHARACTERISTIC_UUID,
            true,
            self.config.io_timeout,
            true,
        )
        .await?;

        let target = TRANSFER_SIZE;
        link.begin_block_read(WAVEFORM_READ_CHARACTERISTIC_UUID, target);
        token.report(0, target);

        if let Err(e) = link
            .write_characteristic(
                &WAVEFORM_GET_VELOCITY,
                WAVEFORM_CONTROL_CHARACTERISTIC_UUID,
                self.config.io_timeout,
            )
            .await
        {
            link.abort_block_read();
            warn!("Waveform request failed: {}", e);
            return Err(e);
        }

        let Some(mut data) = link
            .wait_block_read(self.config.waveform_stall_timeout, token)
            .await?
        else {
            info!("Waveform download cancelled");
            return Ok(None);
        };

        data.truncate(target);
        let sample = decode_transfer(&data)?;
        info!(
            "Downloaded waveform {} ({} blocks)",
            sample.wave_id(),
            sample.blocks.len()
        );
        Ok(Some(sample))
    }
}

impl std::fmt::Debug for ViPen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViPen")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
