//! Command Dispatcher
//!
//! Every outbound command goes through the device's single command lock, so
//! the radio only ever sees one complete frame at a time and frames leave in
//! the order callers acquired the lock.

use crate::domain::error::{CommandError, LinkError, TimeoutError, WriteError};
use crate::domain::models::{CommandRequest, Direction};
use crate::domain::store::StateStore;
use crate::infrastructure::bluetooth::connection::{timed_out, SessionManager};
use crate::infrastructure::bluetooth::protocol::PortCodec;
use crate::infrastructure::diagnostics::Diagnostics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// The per-device command lock and the session it guards.
pub type SharedSession = Arc<Mutex<SessionManager>>;

/// Take the command lock, waiting at most `bound` if one is set.
///
/// Tokio's mutex is fair, so waiters are served in arrival order.
pub async fn acquire(
    session: &SharedSession,
    bound: Option<Duration>,
) -> Result<MutexGuard<'_, SessionManager>, TimeoutError> {
    match bound {
        Some(after) => tokio::time::timeout(after, session.lock())
            .await
            .map_err(|_| timed_out("command lock", after)),
        None => Ok(session.lock().await),
    }
}

pub struct CommandDispatcher {
    session: SharedSession,
    codec: Arc<dyn PortCodec>,
    store: Arc<StateStore>,
    diagnostics: Arc<Diagnostics>,
    lock_timeout: Option<Duration>,
}

impl CommandDispatcher {
    pub fn new(
        session: SharedSession,
        codec: Arc<dyn PortCodec>,
        store: Arc<StateStore>,
        diagnostics: Arc<Diagnostics>,
        lock_timeout: Option<Duration>,
    ) -> Self {
        Self {
            session,
            codec,
            store,
            diagnostics,
            lock_timeout,
        }
    }

    pub async fn set_port_power(&self, port: u8, on: bool) -> Result<(), CommandError> {
        self.dispatch(CommandRequest::set_power(port, on)).await
    }

    /// `percent` is clamped into `0..=100`, never rejected.
    pub async fn set_port_speed(&self, port: u8, percent: i32) -> Result<(), CommandError> {
        self.dispatch(CommandRequest::set_speed(port, percent)).await
    }

    /// Send one command and, once the device accepted it, record the requested
    /// value in the store without waiting for the device to confirm.
    ///
    /// On any error the store keeps its last-known-good value.
    pub async fn dispatch(&self, request: CommandRequest) -> Result<(), CommandError> {
        let port_count = self.store.port_count();
        if !(1..=port_count).contains(&request.port) {
            return Err(CommandError::InvalidPort {
                port: request.port,
                port_count,
            });
        }

        let mut session = acquire(&self.session, self.lock_timeout).await?;
        session.ensure_connected().await?;

        let frame = self.codec.encode(&request, &self.store.snapshot());
        debug!("Sending {:?} as {:02X?}", request, frame);
        self.diagnostics.record(Direction::Outbound, &frame);

        if let Err(e) = session.write(&frame).await {
            warn!("Command {:?} failed: {}", request, e);
            return Err(match e {
                WriteError::Link(LinkError::Timeout(after)) => timed_out("write", after).into(),
                other => other.into(),
            });
        }

        self.store.apply(request.optimistic_update());
        Ok(())
    }
}
