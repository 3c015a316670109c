//! btleplug backend
//!
//! Real radio implementation of [`BleBackend`] for BlueZ, WinRT and
//! CoreBluetooth.

use crate::domain::error::LinkError;
use crate::domain::models::DeviceIdentity;
use crate::infrastructure::bluetooth::connection::{
    BleBackend, GattLink, LinkLostHandler, NotificationHandler,
};
use crate::infrastructure::bluetooth::protocol::GattProfile;
use crate::infrastructure::bluetooth::scanner;
use anyhow::{Context, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

fn link_error(e: btleplug::Error) -> LinkError {
    match e {
        btleplug::Error::NotConnected => LinkError::Dropped,
        other => LinkError::Backend(other.to_string()),
    }
}

pub struct BtleplugBackend {
    adapter: Adapter,
    scan_timeout: Duration,
}

impl BtleplugBackend {
    /// Use the first Bluetooth adapter on the host.
    pub async fn new(scan_timeout: Duration) -> Result<Self> {
        let manager = Manager::new()
            .await
            .context("Failed to start Bluetooth manager")?;
        let adapter = manager
            .adapters()
            .await
            .context("Failed to list Bluetooth adapters")?
            .into_iter()
            .next()
            .ok_or(LinkError::NoAdapter)?;

        if let Ok(info) = adapter.adapter_info().await {
            info!("Using Bluetooth adapter {}", info);
        }
        Ok(Self {
            adapter,
            scan_timeout,
        })
    }
}

#[async_trait]
impl BleBackend for BtleplugBackend {
    async fn connect(
        &self,
        identity: &DeviceIdentity,
        profile: &GattProfile,
        on_notify: NotificationHandler,
        on_lost: LinkLostHandler,
    ) -> Result<Box<dyn GattLink>, LinkError> {
        let peripheral = scanner::find_peripheral(
            &self.adapter,
            &identity.address,
            profile.service,
            self.scan_timeout,
        )
        .await?;

        if !peripheral.is_connected().await.map_err(link_error)? {
            peripheral.connect().await.map_err(link_error)?;
        }
        peripheral.discover_services().await.map_err(link_error)?;

        let characteristics = peripheral.characteristics();
        let find = |uuid: Uuid| {
            characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or(LinkError::MissingCharacteristic(uuid))
        };
        let write = find(profile.write)?;
        let read = find(profile.read)?;

        let mut listeners = Vec::new();
        if let Some(uuid) = profile.notify {
            let notify = find(uuid)?;
            peripheral.subscribe(&notify).await.map_err(link_error)?;
            let mut stream = peripheral.notifications().await.map_err(link_error)?;
            debug!("Subscribed to {}", uuid);
            let on_lost = on_lost.clone();
            listeners.push(tokio::spawn(async move {
                while let Some(notification) = stream.next().await {
                    if notification.uuid == uuid {
                        on_notify(&notification.value);
                    }
                }
                debug!("Notification stream for {} ended", uuid);
                on_lost();
            }));
        }

        // Profiles without a notify characteristic still hear about drops here
        match self.adapter.events().await {
            Ok(mut events) => {
                let id = peripheral.id();
                listeners.push(tokio::spawn(async move {
                    while let Some(event) = events.next().await {
                        if matches!(&event, CentralEvent::DeviceDisconnected(gone) if *gone == id) {
                            on_lost();
                            break;
                        }
                    }
                }));
            }
            Err(e) => warn!("Adapter events unavailable, drops surface on next use: {}", e),
        }

        Ok(Box::new(BtleplugLink {
            peripheral,
            write,
            read,
            listeners,
        }))
    }
}

struct BtleplugLink {
    peripheral: Peripheral,
    write: Characteristic,
    read: Characteristic,
    listeners: Vec<JoinHandle<()>>,
}

impl BtleplugLink {
    fn write_type(&self) -> WriteType {
        if self.write.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        }
    }
}

#[async_trait]
impl GattLink for BtleplugLink {
    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), LinkError> {
        self.peripheral
            .write(&self.write, bytes, self.write_type())
            .await
            .map_err(link_error)
    }

    async fn read(&self) -> Result<Vec<u8>, LinkError> {
        self.peripheral.read(&self.read).await.map_err(link_error)
    }

    async fn disconnect(&self) {
        for listener in &self.listeners {
            listener.abort();
        }
        if let Err(e) = self.peripheral.disconnect().await {
            warn!("Disconnect failed: {}", e);
        }
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
    }
}
