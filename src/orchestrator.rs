//! Polling orchestrator.
//!
//! Alternates between passive advertisement listening and active connected
//! polling of one pen. Passive mode turns every advertisement from the most
//! recently seen pen into a sample without connecting. Active mode takes the
//! device protocol exclusively, reads live values in a loop and falls back
//! to passive mode when stopped or when the consecutive-error budget runs out.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ble::block_reader::ProgressToken;
use crate::ble::platform::GattAdapter;
use crate::ble::scanner::{ScanEvent, Scanner};
use crate::config::{PollingConfig, ViPenConfig};
use crate::data::{LiveSample, WaveformSample};
use crate::device::ViPen;
use crate::error::{Error, Result};

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Event published by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// A live sample, passive or polled.
    Sample(LiveSample),
    /// Active polling started (`true`) or ended (`false`).
    PollingStateChanged(bool),
    /// Human-readable status for display.
    Status(String),
}

/// Orchestrator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OrchestratorState {
    /// Created, not scanning yet.
    #[default]
    Idle,
    /// Starting the scanner.
    Initializing,
    /// Decoding advertisements.
    PassiveListening,
    /// Connected and polling live values.
    ActivePolling,
    /// Shut down.
    Stopped,
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Initializing => write!(f, "Initializing"),
            Self::PassiveListening => write!(f, "PassiveListening"),
            Self::ActivePolling => write!(f, "ActivePolling"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Where the polling session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Idle,
    /// Claimed by `start_polling`, possibly still waiting for the session lock.
    Running,
    /// Asked to stop, tearing down.
    Stopping,
}

struct OrchestratorInner {
    scanner: Scanner,
    device: ViPen,
    config: PollingConfig,
    state: RwLock<OrchestratorState>,
    /// Held for the whole of a polling session or a manual download.
    polling_lock: Arc<tokio::sync::Mutex<()>>,
    session: Mutex<SessionPhase>,
    /// Signalled whenever a session returns to idle.
    session_ended: Notify,
    stop_notify: Notify,
    shutting_down: AtomicBool,
    last_seen: RwLock<Option<String>>,
    scan_failures: AtomicU32,
    recovering: AtomicBool,
    event_tx: broadcast::Sender<MonitorEvent>,
    callback_counter: AtomicU64,
    listener: Mutex<Option<JoinHandle<()>>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl OrchestratorInner {
    fn phase(&self) -> SessionPhase {
        *self.session.lock()
    }

    fn is_polling(&self) -> bool {
        self.phase() != SessionPhase::Idle
    }

    fn end_session(&self) {
        *self.session.lock() = SessionPhase::Idle;
        self.session_ended.notify_waiters();
    }

    /// Ask the current session to stop. Returns `false` if none is active.
    fn request_stop(&self) -> bool {
        let mut phase = self.session.lock();
        let current = *phase;
        match current {
            SessionPhase::Idle => false,
            SessionPhase::Stopping => true,
            SessionPhase::Running => {
                *phase = SessionPhase::Stopping;
                drop(phase);
                // Stores a permit if the loop is between waits.
                self.stop_notify.notify_one();
                true
            }
        }
    }

    fn set_state(&self, new_state: OrchestratorState) {
        let old_state = std::mem::replace(&mut *self.state.write(), new_state);
        if old_state != new_state {
            debug!("Orchestrator state changed: {} -> {}", old_state, new_state);
        }
    }

    fn status(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        let _ = self.event_tx.send(MonitorEvent::Status(message));
    }

    fn handle_scan_event(self: &Arc<Self>, event: ScanEvent) {
        match event {
            ScanEvent::Discovered(advertisement) => {
                self.scan_failures.store(0, Ordering::SeqCst);
                *self.last_seen.write() = Some(advertisement.address.clone());

                if self.is_polling() {
                    return;
                }
                let sample = advertisement.data.to_sample(advertisement.address);
                let _ = self.event_tx.send(MonitorEvent::Sample(sample));
            }
            ScanEvent::ScanFailed { code } => {
                let failures = self.scan_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures > self.config.scan_failure_threshold {
                    debug!("Ignoring scan failure {} (code {})", failures, code);
                    return;
                }
                warn!("Scan failed with code {} ({} in a row)", code, failures);

                if self
                    .recovering
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    debug!("Scan recovery already running");
                    return;
                }

                let inner = self.clone();
                tokio::spawn(async move {
                    inner.status("Scan failed, restarting Bluetooth");
                    if let Err(e) = inner
                        .scanner
                        .restart_with_radio_cycle(inner.config.radio_restart_delay)
                        .await
                    {
                        error!("Scan recovery failed: {}", e);
                    }
                    inner.recovering.store(false, Ordering::SeqCst);
                });
            }
        }
    }

    async fn connect_and_start(&self, address: &str) -> bool {
        if !self.device.connect(address).await {
            return false;
        }
        self.device.start().await
    }

    async fn poll_loop(&self, address: &str) {
        let budget = self.config.error_budget;
        let mut errors = 0u32;

        loop {
            if self.phase() != SessionPhase::Running {
                debug!("Polling stop requested");
                break;
            }

            let result = if self.device.is_connected().await {
                self.device.read_live_values().await
            } else {
                Err(Error::ConnectionLost)
            };

            match result {
                Ok(values) => {
                    errors = 0;
                    let sample = LiveSample::from_live_values(address, &values);
                    let _ = self.event_tx.send(MonitorEvent::Sample(sample));
                }
                Err(e) => {
                    errors += 1;
                    warn!("Live read failed ({}/{}): {}", errors, budget, e);

                    if errors > budget {
                        self.status(format!(
                            "Polling aborted after {} consecutive errors",
                            errors
                        ));
                        break;
                    }

                    if errors == budget {
                        self.status(format!("Reconnecting to {}", address));
                        self.device.disconnect().await;
                        if !self.connect_and_start(address).await {
                            self.status(format!("Reconnect to {} failed", address));
                            break;
                        }
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.stop_notify.notified() => {}
            }
        }
    }

    async fn run_polling(self: Arc<Self>, address: String, _session: OwnedMutexGuard<()>) {
        if self.connect_and_start(&address).await {
            self.status(format!("Polling {}", address));
            self.poll_loop(&address).await;
        } else {
            self.status(format!("Could not start polling {}", address));
        }

        self.device.stop().await;
        self.device.disconnect().await;

        self.end_session();
        let _ = self.event_tx.send(MonitorEvent::PollingStateChanged(false));

        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        self.set_state(OrchestratorState::PassiveListening);
        if let Err(e) = self.scanner.start_scanning().await {
            warn!("Failed to resume scanning: {}", e);
        }
    }
}

/// Drives one pen between passive listening and active polling.
pub struct PollingOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl PollingOrchestrator {
    /// Create an orchestrator on an adapter.
    ///
    /// Nothing happens on the radio until [`PollingOrchestrator::initialize`].
    pub fn new(adapter: Arc<dyn GattAdapter>, config: ViPenConfig) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let scanner = Scanner::new(adapter.clone(), config.polling.filter.clone());
        let device = ViPen::new(adapter, config.link, config.protocol);

        Self {
            inner: Arc::new(OrchestratorInner {
                scanner,
                device,
                config: config.polling,
                state: RwLock::new(OrchestratorState::Idle),
                polling_lock: Arc::new(tokio::sync::Mutex::new(())),
                session: Mutex::new(SessionPhase::Idle),
                session_ended: Notify::new(),
                stop_notify: Notify::new(),
                shutting_down: AtomicBool::new(false),
                last_seen: RwLock::new(None),
                scan_failures: AtomicU32::new(0),
                recovering: AtomicBool::new(false),
                event_tx,
                callback_counter: AtomicU64::new(0),
                listener: Mutex::new(None),
                poll_task: Mutex::new(None),
            }),
        }
    }

    /// Start passive scanning and listening for advertisements.
    ///
    /// Safe to call again; scanning and the listener are only started once.
    pub async fn initialize(&self) -> Result<()> {
        let inner = &self.inner;
        inner.shutting_down.store(false, Ordering::SeqCst);
        inner.set_state(OrchestratorState::Initializing);

        {
            let mut listener = inner.listener.lock();
            if listener.is_none() {
                let mut events = inner.scanner.subscribe();
                let task_inner = inner.clone();
                *listener = Some(tokio::spawn(async move {
                    loop {
                        match events.recv().await {
                            Ok(event) => task_inner.handle_scan_event(event),
                            Err(RecvError::Lagged(missed)) => {
                                warn!("Orchestrator lagged, {} scan events dropped", missed);
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                }));
            }
        }

        if let Err(e) = inner.scanner.start_scanning().await {
            inner.set_state(OrchestratorState::Idle);
            return Err(e);
        }

        if !inner.is_polling() {
            inner.set_state(OrchestratorState::PassiveListening);
        }
        Ok(())
    }

    /// Start active polling of the most recently seen pen.
    ///
    /// A session that is still winding down after a stop is waited for, then
    /// a new one is started. Returns `true` if a polling session is running
    /// after the call; `false` if no pen has been seen or the session was
    /// stopped before it got going.
    pub async fn start_polling(&self) -> bool {
        let inner = &self.inner;

        loop {
            let ended = inner.session_ended.notified();
            {
                let mut phase = inner.session.lock();
                let current = *phase;
                match current {
                    SessionPhase::Idle => {
                        *phase = SessionPhase::Running;
                        break;
                    }
                    SessionPhase::Running => {
                        debug!("Already polling");
                        return true;
                    }
                    SessionPhase::Stopping => {}
                }
            }
            debug!("Waiting for the previous polling session to end");
            ended.await;
        }

        let Some(address) = inner.last_seen.read().clone() else {
            inner.end_session();
            inner.status("No ViPen seen yet");
            return false;
        };

        // A manual download may hold the lock; stop_polling can run meanwhile.
        let session = inner.polling_lock.clone().lock_owned().await;
        if inner.phase() != SessionPhase::Running {
            debug!("Polling stopped before the session started");
            inner.end_session();
            return false;
        }

        inner.set_state(OrchestratorState::ActivePolling);
        let _ = inner.event_tx.send(MonitorEvent::PollingStateChanged(true));

        if let Err(e) = inner.scanner.stop_scanning().await {
            warn!("Failed to pause scanning: {}", e);
        }

        let task = tokio::spawn(inner.clone().run_polling(address, session));
        *inner.poll_task.lock() = Some(task);
        true
    }

    /// Ask the polling loop to stop and resume scanning.
    ///
    /// The loop notices the request at its next iteration boundary; this
    /// waits at most the configured grace period for it.
    pub async fn stop_polling(&self) {
        let inner = &self.inner;
        if !inner.request_stop() {
            return;
        }

        info!("Stopping polling");

        let task = inner.poll_task.lock().take();
        if let Some(mut task) = task {
            // A finished session has already resumed scanning itself.
            if tokio::time::timeout(inner.config.stop_grace, &mut task)
                .await
                .is_ok()
            {
                return;
            }
            debug!("Polling loop still winding down after grace period");
            inner.poll_task.lock().get_or_insert(task);
        }

        if let Err(e) = inner.scanner.start_scanning().await {
            warn!("Failed to resume scanning: {}", e);
        }
    }

    /// Download a waveform from the most recently seen pen.
    ///
    /// Scanning is paused for the connect, download and disconnect sequence.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] while polling, [`Error::DeviceNotFound`] if no pen has
    /// been seen, [`Error::ConnectionFailed`] if the pen cannot be reached,
    /// and any download error.
    pub async fn download_waveform(&self, token: &ProgressToken) -> Result<Option<WaveformSample>> {
        let inner = &self.inner;

        let _session = inner.polling_lock.try_lock().map_err(|_| Error::Busy {
            reason: "polling in progress".to_string(),
        })?;
        if inner.is_polling() {
            return Err(Error::Busy {
                reason: "polling in progress".to_string(),
            });
        }

        let address = inner
            .last_seen
            .read()
            .clone()
            .ok_or_else(|| Error::DeviceNotFound {
                address: "no ViPen seen yet".to_string(),
            })?;

        let was_scanning = inner.scanner.is_scanning();
        if let Err(e) = inner.scanner.stop_scanning().await {
            warn!("Failed to pause scanning: {}", e);
        }

        let result = if inner.device.connect(&address).await {
            inner.status(format!("Downloading waveform from {}", address));
            let result = inner.device.download_waveform(token).await;
            inner.device.disconnect().await;
            result
        } else {
            Err(Error::ConnectionFailed {
                reason: format!("could not connect to {}", address),
            })
        };

        if was_scanning && !inner.shutting_down.load(Ordering::SeqCst) {
            if let Err(e) = inner.scanner.start_scanning().await {
                warn!("Failed to resume scanning: {}", e);
            }
        }

        result
    }

    /// Stop polling and scanning and release background tasks.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        info!("Shutting down orchestrator");
        inner.shutting_down.store(true, Ordering::SeqCst);
        inner.request_stop();

        let poll_task = inner.poll_task.lock().take();
        if let Some(task) = poll_task {
            let _ = task.await;
        }

        if let Err(e) = inner.scanner.stop_scanning().await {
            warn!("Failed to stop scanning: {}", e);
        }

        let listener = inner.listener.lock().take();
        if let Some(task) = listener {
            task.abort();
            let _ = task.await;
        }

        inner.set_state(OrchestratorState::Stopped);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> OrchestratorState {
        *self.inner.state.read()
    }

    /// Check if a polling session is running.
    ///
    /// Stays `true` while a stopped session is still tearing down.
    pub fn is_polling(&self) -> bool {
        self.inner.is_polling()
    }

    /// Address of the most recently seen pen.
    pub fn last_seen_device(&self) -> Option<String> {
        self.inner.last_seen.read().clone()
    }

    /// Device protocol used for polling, for manual commands between sessions.
    pub fn device(&self) -> &ViPen {
        &self.inner.device
    }

    /// Subscribe to orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.inner.event_tx.subscribe()
    }

    fn register<F>(&self, mut callback: F) -> CallbackHandle
    where
        F: FnMut(&MonitorEvent) + Send + 'static,
    {
        let callback_id = self.inner.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.inner.event_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(&event),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Register a callback for live samples.
    pub fn on_sample<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&LiveSample) + Send + Sync + 'static,
    {
        self.register(move |event| {
            if let MonitorEvent::Sample(sample) = event {
                callback(sample);
            }
        })
    }

    /// Register a callback for status messages.
    pub fn on_status<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.register(move |event| {
            if let MonitorEvent::Status(message) = event {
                callback(message);
            }
        })
    }

    /// Register a callback for polling start and end.
    pub fn on_polling_state_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.register(move |event| {
            if let MonitorEvent::PollingStateChanged(polling) = event {
                callback(*polling);
            }
        })
    }
}

impl Drop for PollingOrchestrator {
    fn drop(&mut self) {
        if let Some(task) = self.inner.listener.lock().take() {
            task.abort();
        }
    }
}
