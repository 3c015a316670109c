//! Device Coordinator
//!
//! Public face of the crate for a host integration: owns the state store, the
//! transport session, the command dispatcher and the polling task for one
//! controller.

use crate::domain::error::{CommandError, PollError};
use crate::domain::models::{ConnectionStatus, DeviceIdentity, DeviceState};
use crate::domain::settings::{Settings, WireLayout};
use crate::domain::store::{StateStore, SubscriptionId};
use crate::infrastructure::bluetooth::{
    connection::{BleBackend, RetryPolicy, SessionManager},
    dispatcher::{CommandDispatcher, SharedSession},
    ingest::FrameIngest,
    poller::PollingScheduler,
    protocol::{self, GattProfile},
};
use crate::infrastructure::diagnostics::Diagnostics;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Immutable settings a coordinator is built from.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub identity: DeviceIdentity,
    pub port_count: u8,
    pub layout: WireLayout,
    pub block_telemetry: bool,
    pub profile: GattProfile,
    pub retry: RetryPolicy,
    /// Longest a command or poll waits for the device lock
    pub lock_timeout: Option<Duration>,
    /// `None` disables background polling
    pub poll_interval: Option<Duration>,
}

impl CoordinatorConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let device = &settings.device;
        if device.address.trim().is_empty() {
            anyhow::bail!("No device address configured");
        }
        if device.port_count == 0 {
            anyhow::bail!("Port count must be at least 1");
        }

        Ok(Self {
            identity: DeviceIdentity::new(device.address.trim(), device.name.clone()),
            port_count: device.port_count,
            layout: settings.profile.layout,
            block_telemetry: settings.profile.block_telemetry,
            profile: GattProfile::from_settings(&settings.profile)
                .context("Invalid GATT profile")?,
            retry: RetryPolicy::from_settings(&settings.connection),
            lock_timeout: settings.connection.lock_timeout_ms.map(Duration::from_millis),
            poll_interval: settings
                .polling
                .enabled
                .then(|| settings.polling.interval()),
        })
    }
}

struct PollTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct DeviceCoordinator {
    identity: DeviceIdentity,
    store: Arc<StateStore>,
    session: SharedSession,
    dispatcher: CommandDispatcher,
    poller: PollingScheduler,
    poll_interval: Option<Duration>,
    /// Set between a successful (or in-flight) `start` and the next `stop`
    started: AtomicBool,
    poll_task: Mutex<Option<PollTask>>,
    status: watch::Receiver<ConnectionStatus>,
}

impl DeviceCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        backend: Arc<dyn BleBackend>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        let store = Arc::new(StateStore::new(config.port_count));
        let codec: Arc<dyn protocol::PortCodec> = Arc::from(protocol::codec_for(
            config.layout,
            config.port_count,
            config.block_telemetry,
        ));
        debug!("{}: {:?} layout, {} ports", config.identity.address, codec.layout(), config.port_count);
        let ingest = Arc::new(FrameIngest::new(
            codec.clone(),
            store.clone(),
            diagnostics.clone(),
        ));

        let session = SessionManager::new(
            config.identity.clone(),
            config.profile,
            backend,
            config.retry,
            ingest.handler(),
        );
        let status = session.watch_status();
        let session: SharedSession = Arc::new(tokio::sync::Mutex::new(session));

        let dispatcher = CommandDispatcher::new(
            session.clone(),
            codec,
            store.clone(),
            diagnostics.clone(),
            config.lock_timeout,
        );
        let poller = PollingScheduler::new(
            session.clone(),
            ingest,
            diagnostics,
            config.poll_interval.unwrap_or(Duration::from_secs(30)),
            config.lock_timeout,
        );

        Self {
            identity: config.identity,
            store,
            session,
            dispatcher,
            poller,
            poll_interval: config.poll_interval,
            started: AtomicBool::new(false),
            poll_task: Mutex::new(None),
            status,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn poll_task(&self) -> std::sync::MutexGuard<'_, Option<PollTask>> {
        self.poll_task.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Connect, fetch the initial state and start background polling.
    ///
    /// Calling it again while running is a no-op. On error nothing is left
    /// running, but `stop()` is still safe to call.
    pub async fn start(&self) -> Result<(), PollError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Starting coordinator for {}", self.identity.name);
        if let Err(e) = self.poller.poll_once().await {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        if let Some(interval) = self.poll_interval {
            let mut task = self.poll_task();
            if task.is_none() {
                let (shutdown, rx) = watch::channel(false);
                let handle = self.poller.clone().spawn(rx);
                *task = Some(PollTask { shutdown, handle });
                debug!("Background refresh every {:?}", interval);
            }
        }
        Ok(())
    }

    /// Cancel polling and disconnect. Safe to call repeatedly and before `start`.
    pub async fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        let task = self.poll_task().take();
        if let Some(PollTask { shutdown, handle }) = task {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await {
                warn!("Polling task ended abnormally: {}", e);
            }
        }
        self.session.lock().await.disconnect().await;
        info!("Coordinator for {} stopped", self.identity.name);
    }

    pub fn get_state(&self) -> DeviceState {
        self.store.snapshot()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub async fn set_port_power(&self, port: u8, on: bool) -> Result<(), CommandError> {
        self.dispatcher.set_port_power(port, on).await
    }

    pub async fn set_port_speed(&self, port: u8, percent: i32) -> Result<(), CommandError> {
        self.dispatcher.set_port_speed(port, percent).await
    }

    /// Get the full snapshot after every state change.
    pub fn on_state_changed(
        &self,
        callback: impl Fn(&DeviceState) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.store.subscribe(callback)
    }

    pub fn remove_listener(&self, id: SubscriptionId) -> bool {
        self.store.unsubscribe(id)
    }
}

impl Drop for DeviceCoordinator {
    fn drop(&mut self) {
        // Dropped without stop(): at least do not leave the poller running.
        if let Some(task) = self.poll_task().take() {
            task.handle.abort();
        }
    }
}
