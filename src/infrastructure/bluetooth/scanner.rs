//! BLE Scanner Module
//!
//! Resolves a configured address to a btleplug peripheral.

use crate::domain::error::LinkError;
use btleplug::api::{Central, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

const SCAN_POLL: Duration = Duration::from_millis(250);

/// Whether a peripheral answers to `address`.
///
/// Linux and Windows expose the MAC address; macOS only exposes an opaque
/// peripheral id, so both are compared.
fn matches(peripheral: &Peripheral, address: &str) -> bool {
    peripheral.address().to_string().eq_ignore_ascii_case(address)
        || peripheral.id().to_string().eq_ignore_ascii_case(address)
}

/// Scan until the peripheral shows up or `timeout` runs out.
///
/// Peripherals the adapter already knows are returned without scanning.
pub async fn find_peripheral(
    adapter: &Adapter,
    address: &str,
    service: Option<Uuid>,
    timeout: Duration,
) -> Result<Peripheral, LinkError> {
    if let Some(known) = lookup(adapter, address).await? {
        return Ok(known);
    }

    let filter = ScanFilter {
        services: service.into_iter().collect(),
    };
    info!("Scanning for {}", address);
    adapter
        .start_scan(filter)
        .await
        .map_err(|e| LinkError::Backend(e.to_string()))?;

    let deadline = Instant::now() + timeout;
    let found = loop {
        if let Some(peripheral) = lookup(adapter, address).await? {
            break Some(peripheral);
        }
        if Instant::now() >= deadline {
            break None;
        }
        tokio::time::sleep(SCAN_POLL).await;
    };

    if let Err(e) = adapter.stop_scan().await {
        debug!("stop_scan failed: {}", e);
    }
    found.ok_or_else(|| LinkError::NotFound(address.to_string()))
}

async fn lookup(adapter: &Adapter, address: &str) -> Result<Option<Peripheral>, LinkError> {
    let peripherals = adapter
        .peripherals()
        .await
        .map_err(|e| LinkError::Backend(e.to_string()))?;
    Ok(peripherals.into_iter().find(|p| matches(p, address)))
}
