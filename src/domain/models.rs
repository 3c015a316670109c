use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Highest speed a port accepts, in percent.
pub const MAX_SPEED: u8 = 100;

/// Who we are talking to. Fixed for the lifetime of a coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Transport address (MAC on Linux/Windows, peripheral UUID on macOS)
    pub address: String,
    pub name: String,
}

impl DeviceIdentity {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortState {
    /// 1-based port index
    pub index: u8,
    pub power: bool,
    /// 0..=100
    pub speed: u8,
}

impl PortState {
    pub fn off(index: u8) -> Self {
        Self {
            index,
            power: false,
            speed: 0,
        }
    }

    /// Merge an update into this port.
    ///
    /// A speed implies the power flag (`0` is off, anything else is on). An
    /// explicit power flag in the same update wins, which is how the device
    /// reports an outlet that is switched off but remembers its last speed.
    /// Switching off never clears the speed.
    pub fn merge(&mut self, update: &PortUpdate) {
        if let Some(speed) = update.speed {
            self.speed = speed.min(MAX_SPEED);
            self.power = self.speed > 0;
        }
        if let Some(power) = update.power {
            self.power = power;
        }
    }
}

/// Environmental readings some controller variants report alongside port state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Degrees Celsius
    pub temperature: Option<f32>,
    /// Relative humidity in percent
    pub humidity: Option<f32>,
}

impl Telemetry {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.humidity.is_none()
    }
}

/// Authoritative in-memory view of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Every index in `1..=port_count`, never more, never fewer
    pub ports: BTreeMap<u8, PortState>,
    pub telemetry: Telemetry,
    /// Bumped on every successful mutation
    pub revision: u64,
}

impl DeviceState {
    /// All ports off, revision zero.
    pub fn new(port_count: u8) -> Self {
        Self {
            ports: (1..=port_count).map(|i| (i, PortState::off(i))).collect(),
            telemetry: Telemetry::default(),
            revision: 0,
        }
    }

    pub fn port_count(&self) -> u8 {
        // Construction caps the map at u8::MAX entries.
        u8::try_from(self.ports.len()).unwrap_or(u8::MAX)
    }

    pub fn port(&self, index: u8) -> Option<&PortState> {
        self.ports.get(&index)
    }
}

/// Change to a single port. `None` fields are left as they are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortUpdate {
    pub port: u8,
    pub power: Option<bool>,
    pub speed: Option<u8>,
}

impl PortUpdate {
    pub fn power(port: u8, on: bool) -> Self {
        Self {
            port,
            power: Some(on),
            speed: None,
        }
    }

    pub fn speed(port: u8, speed: u8) -> Self {
        Self {
            port,
            power: None,
            speed: Some(speed),
        }
    }

    /// Full report as pushed by the device: both fields known.
    pub fn full(port: u8, power: bool, speed: u8) -> Self {
        Self {
            port,
            power: Some(power),
            speed: Some(speed),
        }
    }
}

/// Everything one decoded frame says about the device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDelta {
    pub ports: Vec<PortUpdate>,
    pub telemetry: Option<Telemetry>,
}

impl StateDelta {
    pub fn single(update: PortUpdate) -> Self {
        Self {
            ports: vec![update],
            telemetry: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty() && self.telemetry.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Retry budget exhausted; the next operation starts over.
    Failed,
}

impl ConnectionStatus {
    /// Whether the connection handle may move from `self` to `next`.
    ///
    /// A dropped link always passes through `Disconnected` before reconnecting.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::{Connected, Connecting, Disconnected, Failed};
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Disconnected, Failed)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Failed, Connecting)
                | (Failed, Disconnected)
        ) || self == next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortAction {
    SetPower(bool),
    /// Raw percentage from the caller, clamped by the codec
    SetSpeed(i32),
}

/// One outbound command. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandRequest {
    pub port: u8,
    pub action: PortAction,
}

impl CommandRequest {
    pub fn set_power(port: u8, on: bool) -> Self {
        Self {
            port,
            action: PortAction::SetPower(on),
        }
    }

    pub fn set_speed(port: u8, percent: i32) -> Self {
        Self {
            port,
            action: PortAction::SetSpeed(percent),
        }
    }

    /// The state change we assume once the device has accepted this command.
    pub fn optimistic_update(&self) -> PortUpdate {
        match self.action {
            PortAction::SetPower(on) => PortUpdate::power(self.port, on),
            PortAction::SetSpeed(percent) => PortUpdate::speed(self.port, clamp_percent(percent)),
        }
    }
}

/// Clamp a caller-supplied percentage into `0..=100`.
pub fn clamp_percent(percent: i32) -> u8 {
    u8::try_from(percent.clamp(0, i32::from(MAX_SPEED))).unwrap_or(MAX_SPEED)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Raw bytes seen on the link. Diagnostics only, never a source of state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketFrame {
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub bytes: Vec<u8>,
}

impl PacketFrame {
    pub fn now(direction: Direction, bytes: &[u8]) -> Self {
        Self {
            direction,
            timestamp: Utc::now(),
            bytes: bytes.to_vec(),
        }
    }

    pub fn hex(&self) -> String {
        self.bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
