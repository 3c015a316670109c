//! Bluetooth Module
//!
//! Drives one multi-port fan/outlet controller over BLE.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   DeviceCoordinator                      │
//! │  (Main coordinator - public API for the application)     │
//! └──────┬──────────────┬──────────────┬────────────────────┘
//!        │              │              │
//!        ▼              ▼              ▼
//! ┌────────────┐ ┌────────────┐ ┌────────────┐
//! │ Dispatcher │ │   Poller   │ │   Ingest   │◄── notifications
//! │ - commands │ │ - refresh  │ │ - decode   │
//! │ - optimism │ │   ticks    │ │ - apply    │
//! └─────┬──────┘ └─────┬──────┘ └─────┬──────┘
//!       │  command lock│              │
//!       ▼              ▼              ▼
//! ┌───────────────────────────┐ ┌────────────┐
//! │      SessionManager       │ │ StateStore │
//! │ - retries, reconnect      │ └────────────┘
//! │ - BleBackend / GattLink   │
//! └───────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Wire layouts, UUIDs and the frame codecs
//! - [`connection`] - Transport session, retry policy and backend traits
//! - [`dispatcher`] - Serialized command path and the device lock
//! - [`ingest`] - Inbound frame handling shared by notifications and reads
//! - [`poller`] - Periodic full-state refresh
//! - [`service`] - Main service coordinator
//! - `scanner` / `platform` - btleplug backend (feature `ble`)

pub mod connection;
pub mod dispatcher;
pub mod ingest;
pub mod poller;
pub mod protocol;
pub mod service;

#[cfg(feature = "ble")]
pub mod platform;
#[cfg(feature = "ble")]
pub mod scanner;

#[cfg(test)]
pub(crate) mod mock;

// Re-export main service for convenience
pub use service::{CoordinatorConfig, DeviceCoordinator};
