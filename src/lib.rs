//! Coordinator for AC Infinity style multi-port fan/outlet controllers over BLE.
//!
//! [`DeviceCoordinator`] is the entry point: it keeps a live [`DeviceState`]
//! for one controller, serializes commands to it and polls it in the
//! background.

pub mod domain;
pub mod infrastructure;

pub use domain::error::{CommandError, ConnectionError, ParseError, PollError, TimeoutError};
pub use domain::models::{ConnectionStatus, DeviceIdentity, DeviceState, PortState, Telemetry};
pub use domain::settings::{Settings, SettingsService};
pub use infrastructure::bluetooth::{CoordinatorConfig, DeviceCoordinator};
