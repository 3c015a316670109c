//! Polling Scheduler
//!
//! Periodically asks the device for its full state so the store converges even
//! when notifications are sparse or were missed while the link was down.

use crate::domain::error::PollError;
use crate::domain::models::Direction;
use crate::domain::settings::RefreshStrategy;
use crate::infrastructure::bluetooth::dispatcher::{acquire, SharedSession};
use crate::infrastructure::bluetooth::ingest::FrameIngest;
use crate::infrastructure::diagnostics::Diagnostics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct PollingScheduler {
    session: SharedSession,
    ingest: Arc<FrameIngest>,
    diagnostics: Arc<Diagnostics>,
    interval: Duration,
    lock_timeout: Option<Duration>,
}

impl PollingScheduler {
    pub fn new(
        session: SharedSession,
        ingest: Arc<FrameIngest>,
        diagnostics: Arc<Diagnostics>,
        interval: Duration,
        lock_timeout: Option<Duration>,
    ) -> Self {
        Self {
            session,
            ingest,
            diagnostics,
            interval,
            lock_timeout,
        }
    }

    /// One refresh, through the same lock as commands.
    pub async fn poll_once(&self) -> Result<(), PollError> {
        let mut session = acquire(&self.session, self.lock_timeout).await?;
        session.ensure_connected().await?;

        match session.profile().refresh.clone() {
            RefreshStrategy::RequestFrame { bytes } => {
                debug!("Requesting full state");
                self.diagnostics.record(Direction::Outbound, &bytes);
                session.write(&bytes).await?;
            }
            RefreshStrategy::ReadCharacteristic => {
                let bytes = session.read().await?;
                drop(session);
                // Parse failures are already logged by the ingest path.
                let _ = self.ingest.handle(&bytes);
            }
        }
        Ok(())
    }

    /// Run until `shutdown` flips to `true` or its sender goes away. The first
    /// tick is one interval out; the coordinator does the initial refresh itself.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Polling every {:?}", self.interval);

            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.poll_once().await {
                            warn!("Poll failed: {}", e);
                        }
                    }
                }
            }
            debug!("Polling stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DeviceIdentity;
    use crate::domain::settings::{ProfileSettings, WireLayout};
    use crate::domain::store::StateStore;
    use crate::infrastructure::bluetooth::connection::{RetryPolicy, SessionManager};
    use crate::infrastructure::bluetooth::mock::MockBackend;
    use crate::infrastructure::bluetooth::protocol::{codec_for, GattProfile, REQUEST_FULL_STATE};
    use tokio::sync::Mutex;

    fn scheduler(
        backend: &MockBackend,
        profile: ProfileSettings,
        ports: u8,
    ) -> (PollingScheduler, Arc<StateStore>) {
        let store = Arc::new(StateStore::new(ports));
        let diagnostics = Arc::new(Diagnostics::disabled());
        let ingest = Arc::new(FrameIngest::new(
            Arc::from(codec_for(profile.layout, ports, false)),
            store.clone(),
            diagnostics.clone(),
        ));
        let policy = RetryPolicy {
            attempts: 1,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            connect_timeout: Duration::from_secs(1),
            io_timeout: Duration::from_secs(1),
        };
        let session = SessionManager::new(
            DeviceIdentity::new("AA:BB:CC:DD:EE:FF", "Tent"),
            GattProfile::from_settings(&profile).unwrap(),
            Arc::new(backend.clone()),
            policy,
            ingest.handler(),
        );
        let scheduler = PollingScheduler::new(
            Arc::new(Mutex::new(session)),
            ingest,
            diagnostics,
            Duration::from_secs(30),
            None,
        );
        (scheduler, store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_frame_refresh() {
        let backend = MockBackend::new();
        let (scheduler, _store) = scheduler(&backend, ProfileSettings::primary(), 8);

        scheduler.poll_once().await.unwrap();
        assert_eq!(backend.writes(), vec![REQUEST_FULL_STATE.to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_refresh_feeds_store() {
        let backend = MockBackend::new();
        backend.set_read_response(&[1, 0, 1, 0, 25, 0, 100, 0]);
        let profile = ProfileSettings::single_characteristic();
        assert_eq!(profile.layout, WireLayout::PortBlock);
        let (scheduler, store) = scheduler(&backend, profile, 4);

        scheduler.poll_once().await.unwrap();

        let snapshot = store.snapshot();
        assert_eq!(backend.reads(), 1);
        assert_eq!(snapshot.revision, 1);
        assert_eq!(snapshot.port(1).unwrap().speed, 25);
        assert!(snapshot.port(3).unwrap().power);
        assert!(!snapshot.port(4).unwrap().power);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_ticks() {
        let backend = MockBackend::new();
        backend.fail_next_connects(1);
        let (scheduler, _store) = scheduler(&backend, ProfileSettings::primary(), 8);

        let (tx, rx) = watch::channel(false);
        let handle = scheduler.spawn(rx);

        // Tick at 30s fails to connect, 60s and 90s succeed.
        tokio::time::sleep(Duration::from_secs(91)).await;
        assert_eq!(backend.connect_calls(), 2);
        assert_eq!(backend.writes().len(), 2);

        tx.send(true).unwrap();
        handle.await.unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(backend.writes().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_after_request_reach_store() {
        let backend = MockBackend::new();
        let (scheduler, store) = scheduler(&backend, ProfileSettings::primary(), 8);

        scheduler.poll_once().await.unwrap();
        backend.notify(&[0x01, 0x01, 60]);

        let port = *store.snapshot().port(2).unwrap();
        assert!(port.power);
        assert_eq!(port.speed, 60);
    }
}
