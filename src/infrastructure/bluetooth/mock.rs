//! Recording in-memory backend for tests.

use crate::domain::error::LinkError;
use crate::domain::models::DeviceIdentity;
use crate::infrastructure::bluetooth::connection::{
    BleBackend, GattLink, LinkLostHandler, NotificationHandler,
};
use crate::infrastructure::bluetooth::protocol::GattProfile;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Start/end markers around every write, used to prove writes never overlap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteEvent {
    Begin(Vec<u8>),
    End(Vec<u8>),
}

#[derive(Default)]
struct MockState {
    connect_calls: u32,
    failing_connects: u32,
    connect_delay: Duration,
    failing_writes: u32,
    write_delay: Duration,
    connected: bool,
    generation: u64,
    writes: Vec<Vec<u8>>,
    events: Vec<WriteEvent>,
    read_response: Vec<u8>,
    reads: u32,
    handler: Option<NotificationHandler>,
    lost: Option<LinkLostHandler>,
}

#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn connect_calls(&self) -> u32 {
        self.with(|s| s.connect_calls)
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.with(|s| s.failing_connects = n);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.with(|s| s.connect_delay = delay);
    }

    pub fn fail_next_writes(&self, n: u32) {
        self.with(|s| s.failing_writes = n);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.with(|s| s.write_delay = delay);
    }

    pub fn set_read_response(&self, bytes: &[u8]) {
        self.with(|s| s.read_response = bytes.to_vec());
    }

    pub fn reads(&self) -> u32 {
        self.with(|s| s.reads)
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.with(|s| s.writes.clone())
    }

    pub fn events(&self) -> Vec<WriteEvent> {
        self.with(|s| s.events.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.with(|s| s.connected)
    }

    /// Simulate the peripheral going out of range. The loss is reported the
    /// way a radio stack would, outside any operation.
    pub fn drop_link(&self) {
        let lost = self.with(|s| {
            s.connected = false;
            s.handler = None;
            s.lost.take()
        });
        if let Some(lost) = lost {
            lost();
        }
    }

    /// Loss handler of the current link.
    pub fn lost_handler(&self) -> Option<LinkLostHandler> {
        self.with(|s| s.lost.clone())
    }

    /// Deliver a notification the way the radio would: on the caller's task,
    /// independent of any command in flight.
    pub fn notify(&self, bytes: &[u8]) {
        let handler = self.with(|s| if s.connected { s.handler.clone() } else { None });
        if let Some(handler) = handler {
            handler(bytes);
        }
    }
}

#[async_trait]
impl BleBackend for MockBackend {
    async fn connect(
        &self,
        identity: &DeviceIdentity,
        _profile: &GattProfile,
        on_notify: NotificationHandler,
        on_lost: LinkLostHandler,
    ) -> Result<Box<dyn GattLink>, LinkError> {
        let delay = self.with(|s| {
            s.connect_calls += 1;
            s.connect_delay
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.with(|s| {
            if s.failing_connects > 0 {
                s.failing_connects -= 1;
                return Err(LinkError::NotFound(identity.address.clone()));
            }
            s.connected = true;
            s.generation += 1;
            s.handler = Some(on_notify);
            s.lost = Some(on_lost);
            Ok(Box::new(MockLink {
                backend: self.clone(),
                generation: s.generation,
            }) as Box<dyn GattLink>)
        })
    }
}

struct MockLink {
    backend: MockBackend,
    generation: u64,
}

impl MockLink {
    fn alive(&self, s: &MockState) -> bool {
        s.connected && s.generation == self.generation
    }
}

#[async_trait]
impl GattLink for MockLink {
    async fn is_connected(&self) -> bool {
        self.backend.with(|s| self.alive(s))
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let delay = self.backend.with(|s| {
            s.events.push(WriteEvent::Begin(bytes.to_vec()));
            s.write_delay
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }

        self.backend.with(|s| {
            s.events.push(WriteEvent::End(bytes.to_vec()));
            if !self.alive(s) {
                return Err(LinkError::Dropped);
            }
            if s.failing_writes > 0 {
                s.failing_writes -= 1;
                return Err(LinkError::Backend("write rejected".to_string()));
            }
            s.writes.push(bytes.to_vec());
            Ok(())
        })
    }

    async fn read(&self) -> Result<Vec<u8>, LinkError> {
        self.backend.with(|s| {
            if !self.alive(s) {
                return Err(LinkError::Dropped);
            }
            s.reads += 1;
            Ok(s.read_response.clone())
        })
    }

    async fn disconnect(&self) {
        self.backend.with(|s| {
            if s.generation == self.generation {
                s.connected = false;
                s.handler = None;
                s.lost = None;
            }
        });
    }
}
