use ac_infinity_ble::domain::settings::SettingsService;
use ac_infinity_ble::infrastructure::bluetooth::platform::BtleplugBackend;
use ac_infinity_ble::infrastructure::diagnostics::Diagnostics;
use ac_infinity_ble::infrastructure::logging::init_logger;
use ac_infinity_ble::{CoordinatorConfig, DeviceCoordinator};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings_service = SettingsService::new()?;
    // Optional address override: `ac_infinity_ble AA:BB:CC:DD:EE:FF`
    if let Some(address) = std::env::args().nth(1) {
        settings_service.get_mut().device.address = address;
    }
    let settings = settings_service.get().clone();

    let _log_guard = init_logger(&settings.log_settings, settings.diagnostics.packet_logging)?;
    info!("Starting AC Infinity BLE coordinator");
    info!("Settings: {}", settings_service.path().display());

    if settings.device.address.trim().is_empty() {
        anyhow::bail!(
            "No device address configured; set device.address in {} or pass it as an argument",
            settings_service.path().display()
        );
    }

    let config = CoordinatorConfig::from_settings(&settings)?;
    let diagnostics = Arc::new(
        Diagnostics::from_settings(&settings.diagnostics).context("Failed to set up diagnostics")?,
    );
    let backend = Arc::new(
        BtleplugBackend::new(Duration::from_millis(settings.connection.scan_timeout_ms)).await?,
    );
    let coordinator = DeviceCoordinator::new(config, backend, diagnostics);

    coordinator.on_state_changed(|state| {
        for port in state.ports.values() {
            info!(
                "port {}: {} {:>3}%",
                port.index,
                if port.power { "on " } else { "off" },
                port.speed
            );
        }
        if let Some(temperature) = state.telemetry.temperature {
            info!("temperature {:.2} C", temperature);
        }
        if let Some(humidity) = state.telemetry.humidity {
            info!("humidity {:.2} %", humidity);
        }
    });

    let mut status = coordinator.watch_connection();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            info!("Connection: {:?}", *status.borrow_and_update());
        }
    });

    if let Err(e) = coordinator.start().await {
        error!("Initial refresh failed: {}", e);
        coordinator.stop().await;
        return Err(e.into());
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    coordinator.stop().await;
    Ok(())
}
