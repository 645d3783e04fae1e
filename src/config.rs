//! Timing, retry and filter configuration.
//!
//! Every knob has a default matching the pen's firmware behaviour; callers
//! normally only shorten timeouts in tests or widen them for flaky radios.

use std::time::Duration;

/// Transport link settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinkConfig {
    /// Granularity used when a wait re-checks the link for a dropped connection.
    pub poll_interval: Duration,
    /// ATT MTU assumed until a larger one is negotiated.
    pub default_mtu: u16,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            default_mtu: 23,
        }
    }
}

/// Device protocol settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProtocolConfig {
    /// Timeout for a single transport connect attempt.
    pub connect_timeout: Duration,
    /// Number of transport connect attempts.
    pub connect_attempts: u32,
    /// Delay between connect attempts and between command retries.
    pub retry_delay: Duration,
    /// Timeout for service discovery.
    pub discovery_timeout: Duration,
    /// Timeout for disconnect confirmation.
    pub disconnect_timeout: Duration,
    /// MTU requested after connecting.
    pub requested_mtu: u16,
    /// Timeout for the MTU negotiation.
    pub mtu_timeout: Duration,
    /// Timeout for a single characteristic read or write.
    pub io_timeout: Duration,
    /// Write attempts for persistent start and stop.
    pub command_attempts: u32,
    /// Per-read budget while probing the status characteristic.
    pub status_read_timeout: Duration,
    /// Outer budget of the one-shot start-measurement check.
    pub measurement_timeout: Duration,
    /// Inactivity timeout while waveform blocks stream in.
    pub waveform_stall_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            connect_attempts: 2,
            retry_delay: Duration::from_millis(300),
            discovery_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(3),
            requested_mtu: 512,
            mtu_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_secs(2),
            command_attempts: 2,
            status_read_timeout: Duration::from_secs(1),
            measurement_timeout: Duration::from_secs(5),
            waveform_stall_timeout: Duration::from_secs(3),
        }
    }
}

impl ProtocolConfig {
    /// Shorten every timeout and delay, keeping counts and sizes.
    pub fn with_timeouts(mut self, io: Duration, connect: Duration, delay: Duration) -> Self {
        self.io_timeout = io;
        self.status_read_timeout = io;
        self.mtu_timeout = io;
        self.disconnect_timeout = io;
        self.connect_timeout = connect;
        self.discovery_timeout = connect;
        self.retry_delay = delay;
        self
    }

    /// Set the waveform stall timeout.
    pub fn with_waveform_stall_timeout(mut self, timeout: Duration) -> Self {
        self.waveform_stall_timeout = timeout;
        self
    }

    /// Set the start-measurement budget.
    pub fn with_measurement_timeout(mut self, timeout: Duration) -> Self {
        self.measurement_timeout = timeout;
        self
    }
}

/// Advertisement filter for the passive scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanFilterConfig {
    /// Manufacturer id the payload must be tagged with.
    pub manufacturer_id: u16,
    /// Advertised local name.
    pub device_name: String,
}

impl Default for ScanFilterConfig {
    fn default() -> Self {
        Self {
            manufacturer_id: 13,
            device_name: "ViPen".to_string(),
        }
    }
}

/// Polling orchestrator settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PollingConfig {
    /// Pause between live reads.
    pub poll_interval: Duration,
    /// Consecutive read failures tolerated before a reconnect.
    pub error_budget: u32,
    /// How long `stop_polling` waits for the loop before resuming scanning.
    pub stop_grace: Duration,
    /// Consecutive scan failures after which errors are ignored.
    pub scan_failure_threshold: u32,
    /// Pause between disabling and re-enabling the radio during scan recovery.
    pub radio_restart_delay: Duration,
    /// Which advertisements count as ViPen devices.
    pub filter: ScanFilterConfig,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(800),
            error_budget: 3,
            stop_grace: Duration::from_millis(200),
            scan_failure_threshold: 50,
            radio_restart_delay: Duration::from_millis(500),
            filter: ScanFilterConfig::default(),
        }
    }
}

impl PollingConfig {
    /// Set the pause between live reads.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the consecutive error budget.
    pub fn with_error_budget(mut self, budget: u32) -> Self {
        self.error_budget = budget;
        self
    }

    /// Set the radio restart delay used by scan recovery.
    pub fn with_radio_restart_delay(mut self, delay: Duration) -> Self {
        self.radio_restart_delay = delay;
        self
    }

    /// Set the stop grace period.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}

/// Complete configuration for a [`PollingOrchestrator`](crate::PollingOrchestrator).
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ViPenConfig {
    /// Transport link settings.
    pub link: LinkConfig,
    /// Device protocol settings.
    pub protocol: ProtocolConfig,
    /// Polling orchestrator settings.
    pub polling: PollingConfig,
}
