//! BLE Connection Module
//!
//! Owns the link to one device: connect with bounded retries, re-connect lazily
//! after a drop, perform writes and reads. Frames arriving on the notify
//! characteristic are handed to a callback untouched. A backend that sees the
//! link go away reports it at once, so the status leaves `Connected` without
//! waiting for the next operation.
//!
//! The radio stack itself sits behind [`BleBackend`] / [`GattLink`] so the
//! session logic can run against real hardware or a recording mock.

use crate::domain::error::{ConnectionError, LinkError, ReadError, TimeoutError, WriteError};
use crate::domain::models::{ConnectionStatus, DeviceIdentity};
use crate::domain::settings::ConnectionSettings;
use crate::infrastructure::bluetooth::protocol::GattProfile;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Callback receiving raw notification payloads.
pub type NotificationHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Callback a backend fires when a link it handed out is lost.
pub type LinkLostHandler = Arc<dyn Fn() + Send + Sync>;

/// Something that can open GATT links.
#[async_trait]
pub trait BleBackend: Send + Sync {
    /// Find the device, connect, discover the profile's characteristics and
    /// subscribe `on_notify` to the notify characteristic if there is one.
    /// `on_lost` fires when the peripheral drops the link on its own; it is
    /// not expected after [`GattLink::disconnect`].
    async fn connect(
        &self,
        identity: &DeviceIdentity,
        profile: &GattProfile,
        on_notify: NotificationHandler,
        on_lost: LinkLostHandler,
    ) -> Result<Box<dyn GattLink>, LinkError>;
}

/// One open link.
#[async_trait]
pub trait GattLink: Send + Sync {
    async fn is_connected(&self) -> bool;
    async fn write(&self, bytes: &[u8]) -> Result<(), LinkError>;
    async fn read(&self) -> Result<Vec<u8>, LinkError>;
    /// Best effort; errors are swallowed by the implementation.
    async fn disconnect(&self);
}

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Connection attempts before giving up
    pub attempts: u32,
    /// Delay after the first failed attempt, doubled after each further one
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Bound on a single connection attempt
    pub connect_timeout: Duration,
    /// Bound on a single write or read
    pub io_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&ConnectionSettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self {
            attempts: settings.connect_attempts.max(1),
            base_delay: Duration::from_millis(settings.backoff_base_ms),
            max_delay: Duration::from_millis(settings.backoff_max_ms),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            io_timeout: Duration::from_millis(settings.write_timeout_ms),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Transport Session Manager for a single device.
///
/// Not internally synchronized: the coordinator keeps it behind the per-device
/// command lock, which is what serializes every radio operation.
pub struct SessionManager {
    identity: DeviceIdentity,
    profile: GattProfile,
    backend: Arc<dyn BleBackend>,
    policy: RetryPolicy,
    on_notify: NotificationHandler,
    link: Option<Box<dyn GattLink>>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    /// Bumped whenever a link is opened or closed; loss reports carrying an
    /// older value are ignored.
    generation: Arc<AtomicU64>,
}

impl SessionManager {
    pub fn new(
        identity: DeviceIdentity,
        profile: GattProfile,
        backend: Arc<dyn BleBackend>,
        policy: RetryPolicy,
        on_notify: NotificationHandler,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            identity,
            profile,
            backend,
            policy,
            on_notify,
            link: None,
            status: Arc::new(status),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn profile(&self) -> &GattProfile {
        &self.profile
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    fn set_status(&self, next: ConnectionStatus) {
        let current = self.status();
        if !current.can_transition_to(next) {
            warn!(
                "Unexpected connection transition {:?} -> {:?} for {}",
                current, next, self.identity.address
            );
        }
        if current != next {
            debug!("{}: {:?} -> {:?}", self.identity.address, current, next);
            self.status.send_replace(next);
        }
    }

    /// Handler for the link about to be opened. Moves `Connected` to
    /// `Disconnected` unless the session has moved on to another link.
    fn lost_handler(&self) -> LinkLostHandler {
        let expected = self.generation.load(Ordering::SeqCst);
        let generation = self.generation.clone();
        let status = self.status.clone();
        let address = self.identity.address.clone();
        Arc::new(move || {
            if generation.load(Ordering::SeqCst) != expected {
                return;
            }
            let lost = status.send_if_modified(|current| {
                if *current == ConnectionStatus::Connected {
                    *current = ConnectionStatus::Disconnected;
                    true
                } else {
                    false
                }
            });
            if lost {
                info!("Link to {} lost", address);
            }
        })
    }

    /// Drop the current link after it was found dead or misbehaved.
    async fn mark_dropped(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(link) = self.link.take() {
            link.disconnect().await;
        }
        if self.status() == ConnectionStatus::Connected {
            info!("Link to {} dropped", self.identity.address);
            self.set_status(ConnectionStatus::Disconnected);
        }
    }

    /// Connect if not already connected.
    pub async fn ensure_connected(&mut self) -> Result<(), ConnectionError> {
        if let Some(link) = &self.link {
            if link.is_connected().await {
                return Ok(());
            }
            self.mark_dropped().await;
        }

        let mut last = LinkError::NotFound(self.identity.address.clone());
        for attempt in 1..=self.policy.attempts {
            self.set_status(ConnectionStatus::Connecting);
            info!(
                "Connecting to {} ({}) attempt {}/{}",
                self.identity.name, self.identity.address, attempt, self.policy.attempts
            );

            self.generation.fetch_add(1, Ordering::SeqCst);
            let connect = self.backend.connect(
                &self.identity,
                &self.profile,
                self.on_notify.clone(),
                self.lost_handler(),
            );
            let result = match tokio::time::timeout(self.policy.connect_timeout, connect).await {
                Ok(result) => result,
                Err(_) => Err(LinkError::Timeout(self.policy.connect_timeout)),
            };

            match result {
                Ok(link) => {
                    self.link = Some(link);
                    self.set_status(ConnectionStatus::Connected);
                    info!("Connected to {}", self.identity.address);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Connection attempt {} failed: {}", attempt, e);
                    self.set_status(ConnectionStatus::Disconnected);
                    last = e;
                    if attempt < self.policy.attempts {
                        tokio::time::sleep(self.policy.backoff(attempt)).await;
                    }
                }
            }
        }

        error!(
            "Giving up on {} after {} attempts",
            self.identity.address, self.policy.attempts
        );
        self.set_status(ConnectionStatus::Failed);
        Err(ConnectionError::DeviceUnavailable {
            address: self.identity.address.clone(),
            attempts: self.policy.attempts,
            last,
        })
    }

    /// Send one frame. Never retried here; a failure drops the link so the next
    /// operation reconnects.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), WriteError> {
        let link = self.link.as_ref().ok_or(WriteError::NotConnected)?;
        let result = match tokio::time::timeout(self.policy.io_timeout, link.write(bytes)).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout(self.policy.io_timeout)),
        };

        if let Err(e) = result {
            warn!("Write to {} failed: {}", self.identity.address, e);
            self.mark_dropped().await;
            return Err(WriteError::Link(e));
        }
        Ok(())
    }

    /// Read the profile's state characteristic.
    pub async fn read(&mut self) -> Result<Vec<u8>, ReadError> {
        let link = self.link.as_ref().ok_or(ReadError::NotConnected)?;
        let result = match tokio::time::timeout(self.policy.io_timeout, link.read()).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout(self.policy.io_timeout)),
        };

        match result {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                warn!("Read from {} failed: {}", self.identity.address, e);
                self.mark_dropped().await;
                Err(ReadError::Link(e))
            }
        }
    }

    /// Close the link. Safe to call at any time.
    pub async fn disconnect(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(link) = self.link.take() {
            link.disconnect().await;
            info!("Disconnected from {}", self.identity.address);
        }
        if self.status() != ConnectionStatus::Disconnected {
            self.set_status(ConnectionStatus::Disconnected);
        }
    }
}

/// Convert an elapsed bounded wait into the caller-facing error.
pub(crate) fn timed_out(operation: &'static str, after: Duration) -> TimeoutError {
    TimeoutError { operation, after }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::settings::ProfileSettings;
    use crate::infrastructure::bluetooth::mock::MockBackend;

    fn session(backend: &MockBackend) -> SessionManager {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(1),
            io_timeout: Duration::from_secs(1),
        };
        SessionManager::new(
            DeviceIdentity::new("AA:BB:CC:DD:EE:FF", "Grow Tent"),
            GattProfile::from_settings(&ProfileSettings::primary()).unwrap(),
            Arc::new(backend.clone()),
            policy,
            Arc::new(|_| {}),
        )
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(1500),
            connect_timeout: Duration::from_secs(1),
            io_timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(1500));
        assert_eq!(policy.backoff(40), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_connected_is_idempotent() {
        let backend = MockBackend::new();
        let mut session = session(&backend);

        session.ensure_connected().await.unwrap();
        session.ensure_connected().await.unwrap();

        assert_eq!(backend.connect_calls(), 1);
        assert_eq!(session.status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let backend = MockBackend::new();
        backend.fail_next_connects(2);
        let mut session = session(&backend);

        session.ensure_connected().await.unwrap();
        assert_eq!(backend.connect_calls(), 3);
        assert_eq!(session.status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_report_unavailable() {
        let backend = MockBackend::new();
        backend.fail_next_connects(10);
        let mut session = session(&backend);

        let err = session.ensure_connected().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::DeviceUnavailable { attempts: 3, .. }
        ));
        assert_eq!(backend.connect_calls(), 3);
        assert_eq!(session.status(), ConnectionStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_counts_as_attempt() {
        let backend = MockBackend::new();
        backend.set_connect_delay(Duration::from_secs(5));
        let mut session = session(&backend);

        let err = session.ensure_connected().await.unwrap_err();
        let ConnectionError::DeviceUnavailable { last, .. } = err;
        assert_eq!(last, LinkError::Timeout(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_requires_connection() {
        let backend = MockBackend::new();
        let mut session = session(&backend);
        assert_eq!(session.write(&[1, 2, 3]).await, Err(WriteError::NotConnected));
        assert!(backend.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_reconnects_lazily() {
        let backend = MockBackend::new();
        let mut session = session(&backend);
        session.ensure_connected().await.unwrap();

        backend.fail_next_writes(1);
        assert!(matches!(
            session.write(&[1, 2, 3]).await,
            Err(WriteError::Link(_))
        ));
        // Not resent, not reconnected yet
        assert!(backend.writes().is_empty());
        assert_eq!(backend.connect_calls(), 1);
        assert_eq!(session.status(), ConnectionStatus::Disconnected);

        session.ensure_connected().await.unwrap();
        session.write(&[4, 5, 6]).await.unwrap();
        assert_eq!(backend.connect_calls(), 2);
        assert_eq!(backend.writes(), vec![vec![4, 5, 6]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_link_reported_before_next_operation() {
        let backend = MockBackend::new();
        let mut session = session(&backend);
        session.ensure_connected().await.unwrap();
        let mut statuses = session.watch_status();
        statuses.borrow_and_update();

        backend.drop_link();
        assert!(statuses.has_changed().unwrap());
        assert_eq!(
            *statuses.borrow_and_update(),
            ConnectionStatus::Disconnected
        );
        assert_eq!(backend.connect_calls(), 1);

        session.ensure_connected().await.unwrap();
        assert_eq!(backend.connect_calls(), 2);
        assert_eq!(session.status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_of_a_replaced_link_is_ignored() {
        let backend = MockBackend::new();
        let mut session = session(&backend);
        session.ensure_connected().await.unwrap();
        let stale = backend.lost_handler().unwrap();

        session.disconnect().await;
        session.ensure_connected().await.unwrap();
        stale();

        assert_eq!(session.status(), ConnectionStatus::Connected);
        assert_eq!(backend.connect_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_always_safe() {
        let backend = MockBackend::new();
        let mut session = session(&backend);
        session.disconnect().await;
        session.ensure_connected().await.unwrap();
        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.status(), ConnectionStatus::Disconnected);
        assert!(!backend.is_connected());
    }
}
