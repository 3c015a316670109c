//! AC Infinity Controller Protocol
//!
//! The controller's wire format was never published and reverse-engineering
//! produced several incompatible layouts for the same family. Each layout lives
//! behind [`PortCodec`]; the active one is picked from configuration.
//!
//! # Layouts
//!
//! ```text
//! state_triplet   both  : [port0][power 0|1][speed 0-100]
//!
//! indexed_opcode  both  : [port0][0x01][on 0|1]   power
//!                         [port0][0x02][percent]  speed
//!
//! opcode_triplet  both  : [0xA5][port1][on 0|1]   power
//!                         [0xA6][port1][percent]  speed
//!
//! port_block      both  : [power_1 .. power_N][speed_1 .. speed_N]
//!                         optional trailer: [temp i16 BE x100][rh u16 BE x100]
//! ```
//!
//! Codecs are pure: no I/O, no shared state, and decoding never panics.

use crate::domain::error::ParseError;
use crate::domain::models::{
    clamp_percent, CommandRequest, DeviceState, PortAction, PortState, PortUpdate, StateDelta,
    Telemetry,
};
use crate::domain::settings::{ProfileSettings, RefreshStrategy, WireLayout};
use anyhow::{Context, Result};
use uuid::Uuid;

/// Primary family service UUID
pub const SERVICE_UUID: &str = "0000fe61-0000-1000-8000-00805f9b34fb";

/// Write Characteristic UUID - where commands are sent
pub const WRITE_CHAR_UUID: &str = "0000fe62-0000-1000-8000-00805f9b34fb";

/// Notify Characteristic UUID - where state reports arrive
pub const NOTIFY_CHAR_UUID: &str = "0000fe63-0000-1000-8000-00805f9b34fb";

/// Alternate family: one characteristic for both read and write
pub const BLOCK_CHAR_UUID: &str = "0000fff2-0000-1000-8000-00805f9b34fb";

/// Frame asking the primary family to push every port's state
pub const REQUEST_FULL_STATE: &[u8] = &[0xFF];

const TRIPLET_LEN: usize = 3;
const TELEMETRY_TRAILER_LEN: usize = 4;

/// Encode/decode contract every wire layout implements.
pub trait PortCodec: Send + Sync {
    fn layout(&self) -> WireLayout;

    /// Smallest frame `decode` will accept.
    fn min_frame_len(&self) -> usize;

    /// Encode one command. `current` is the last-known state, used by layouts
    /// that always write every port.
    fn encode(&self, request: &CommandRequest, current: &DeviceState) -> Vec<u8>;

    fn decode(&self, bytes: &[u8]) -> Result<StateDelta, ParseError>;

    fn encode_set_power(&self, port: u8, on: bool, current: &DeviceState) -> Vec<u8> {
        self.encode(&CommandRequest::set_power(port, on), current)
    }

    fn encode_set_speed(&self, port: u8, percent: i32, current: &DeviceState) -> Vec<u8> {
        self.encode(&CommandRequest::set_speed(port, percent), current)
    }
}

/// Build the codec for a layout.
pub fn codec_for(layout: WireLayout, port_count: u8, block_telemetry: bool) -> Box<dyn PortCodec> {
    match layout {
        WireLayout::StateTriplet => Box::new(StateTripletCodec::new(port_count)),
        WireLayout::IndexedOpcode => Box::new(IndexedOpcodeCodec::new(port_count)),
        WireLayout::OpcodeTriplet => Box::new(OpcodeTripletCodec::new(port_count)),
        WireLayout::PortBlock => Box::new(PortBlockCodec::new(port_count, block_telemetry)),
    }
}

fn check_len(bytes: &[u8], min: usize) -> Result<(), ParseError> {
    if bytes.len() < min {
        return Err(ParseError::TooShort {
            len: bytes.len(),
            min,
        });
    }
    Ok(())
}

fn check_port(port: u16, port_count: u8) -> Result<u8, ParseError> {
    match u8::try_from(port) {
        Ok(p) if (1..=port_count).contains(&p) => Ok(p),
        _ => Err(ParseError::PortOutOfRange { port, port_count }),
    }
}

/// `[port0, power, speed]` in both directions, as pushed by the 69 Pro family.
///
/// A command carries the whole port, so setting power resends the remembered
/// speed and setting a speed derives the power flag from it.
#[derive(Debug, Clone)]
pub struct StateTripletCodec {
    port_count: u8,
}

impl StateTripletCodec {
    pub fn new(port_count: u8) -> Self {
        Self { port_count }
    }
}

impl PortCodec for StateTripletCodec {
    fn layout(&self) -> WireLayout {
        WireLayout::StateTriplet
    }

    fn min_frame_len(&self) -> usize {
        TRIPLET_LEN
    }

    fn encode(&self, request: &CommandRequest, current: &DeviceState) -> Vec<u8> {
        let index = request.port.saturating_sub(1);
        match request.action {
            PortAction::SetPower(on) => {
                let speed = current.port(request.port).map_or(0, |p| p.speed);
                vec![index, u8::from(on), speed]
            }
            PortAction::SetSpeed(percent) => {
                let speed = clamp_percent(percent);
                vec![index, u8::from(speed > 0), speed]
            }
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<StateDelta, ParseError> {
        check_len(bytes, TRIPLET_LEN)?;
        let port = check_port(u16::from(bytes[0]) + 1, self.port_count)?;
        let power = bytes[1] != 0;
        let speed = bytes[2].min(100);
        Ok(StateDelta::single(PortUpdate::full(port, power, speed)))
    }
}

/// `[port0, opcode, value]` in both directions: the command form some 69 Pro
/// firmwares accept.
#[derive(Debug, Clone)]
pub struct IndexedOpcodeCodec {
    port_count: u8,
}

impl IndexedOpcodeCodec {
    pub const OP_POWER: u8 = 0x01;
    pub const OP_SPEED: u8 = 0x02;

    pub fn new(port_count: u8) -> Self {
        Self { port_count }
    }
}

impl PortCodec for IndexedOpcodeCodec {
    fn layout(&self) -> WireLayout {
        WireLayout::IndexedOpcode
    }

    fn min_frame_len(&self) -> usize {
        TRIPLET_LEN
    }

    fn encode(&self, request: &CommandRequest, _current: &DeviceState) -> Vec<u8> {
        let index = request.port.saturating_sub(1);
        match request.action {
            PortAction::SetPower(on) => vec![index, Self::OP_POWER, u8::from(on)],
            PortAction::SetSpeed(percent) => vec![index, Self::OP_SPEED, clamp_percent(percent)],
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<StateDelta, ParseError> {
        check_len(bytes, TRIPLET_LEN)?;
        let port = check_port(u16::from(bytes[0]) + 1, self.port_count)?;
        let update = match bytes[1] {
            Self::OP_POWER => PortUpdate::power(port, bytes[2] != 0),
            Self::OP_SPEED => PortUpdate::speed(port, bytes[2].min(100)),
            opcode => return Err(ParseError::UnknownOpcode(opcode)),
        };
        Ok(StateDelta::single(update))
    }
}

/// `[opcode, port1, value]` in both directions.
#[derive(Debug, Clone)]
pub struct OpcodeTripletCodec {
    port_count: u8,
}

impl OpcodeTripletCodec {
    pub const OP_POWER: u8 = 0xA5;
    pub const OP_SPEED: u8 = 0xA6;

    pub fn new(port_count: u8) -> Self {
        Self { port_count }
    }
}

impl PortCodec for OpcodeTripletCodec {
    fn layout(&self) -> WireLayout {
        WireLayout::OpcodeTriplet
    }

    fn min_frame_len(&self) -> usize {
        TRIPLET_LEN
    }

    fn encode(&self, request: &CommandRequest, _current: &DeviceState) -> Vec<u8> {
        match request.action {
            PortAction::SetPower(on) => vec![Self::OP_POWER, request.port, u8::from(on)],
            PortAction::SetSpeed(percent) => {
                vec![Self::OP_SPEED, request.port, clamp_percent(percent)]
            }
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<StateDelta, ParseError> {
        check_len(bytes, TRIPLET_LEN)?;
        let opcode = bytes[0];
        if opcode != Self::OP_POWER && opcode != Self::OP_SPEED {
            return Err(ParseError::UnknownOpcode(opcode));
        }
        let port = check_port(u16::from(bytes[1]), self.port_count)?;

        let update = if opcode == Self::OP_POWER {
            PortUpdate::power(port, bytes[2] != 0)
        } else {
            PortUpdate::speed(port, bytes[2].min(100))
        };
        Ok(StateDelta::single(update))
    }
}

/// Whole-device block: N power flags then N speeds, one characteristic.
#[derive(Debug, Clone)]
pub struct PortBlockCodec {
    port_count: u8,
    telemetry: bool,
}

impl PortBlockCodec {
    pub fn new(port_count: u8, telemetry: bool) -> Self {
        Self {
            port_count,
            telemetry,
        }
    }

    fn block_len(&self) -> usize {
        2 * usize::from(self.port_count)
    }
}

impl PortCodec for PortBlockCodec {
    fn layout(&self) -> WireLayout {
        WireLayout::PortBlock
    }

    fn min_frame_len(&self) -> usize {
        self.block_len()
    }

    fn encode(&self, request: &CommandRequest, current: &DeviceState) -> Vec<u8> {
        let n = usize::from(self.port_count);
        let mut frame = vec![0u8; 2 * n];
        for index in 1..=self.port_count {
            let mut port = current
                .port(index)
                .copied()
                .unwrap_or_else(|| PortState::off(index));
            if index == request.port {
                port.merge(&request.optimistic_update());
            }
            let slot = usize::from(index - 1);
            frame[slot] = u8::from(port.power);
            frame[n + slot] = port.speed;
        }
        frame
    }

    fn decode(&self, bytes: &[u8]) -> Result<StateDelta, ParseError> {
        check_len(bytes, self.block_len())?;
        let n = usize::from(self.port_count);

        let ports = (1..=self.port_count)
            .map(|index| {
                let slot = usize::from(index - 1);
                PortUpdate::full(index, bytes[slot] != 0, bytes[n + slot].min(100))
            })
            .collect();

        let trailer = &bytes[2 * n..];
        let telemetry = if self.telemetry && trailer.len() >= TELEMETRY_TRAILER_LEN {
            let temperature = i16::from_be_bytes([trailer[0], trailer[1]]);
            let humidity = u16::from_be_bytes([trailer[2], trailer[3]]);
            Some(Telemetry {
                temperature: Some(f32::from(temperature) / 100.0),
                humidity: Some(f32::from(humidity) / 100.0),
            })
        } else {
            None
        };

        Ok(StateDelta { ports, telemetry })
    }
}

/// Parsed GATT identifiers of the active profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattProfile {
    /// Advertised service, used to narrow scans
    pub service: Option<Uuid>,
    pub write: Uuid,
    pub notify: Option<Uuid>,
    pub read: Uuid,
    pub refresh: RefreshStrategy,
}

impl GattProfile {
    pub fn from_settings(settings: &ProfileSettings) -> Result<Self> {
        let service = settings
            .service_uuid
            .as_deref()
            .map(parse_uuid)
            .transpose()
            .context("Invalid service UUID")?;
        let write = parse_uuid(&settings.write_char_uuid).context("Invalid write UUID")?;
        let notify = settings
            .notify_char_uuid
            .as_deref()
            .map(parse_uuid)
            .transpose()
            .context("Invalid notify UUID")?;
        let read = match settings.read_char_uuid.as_deref() {
            Some(uuid) => parse_uuid(uuid).context("Invalid read UUID")?,
            None => write,
        };

        Ok(Self {
            service,
            write,
            notify,
            read,
            refresh: settings.refresh.clone(),
        })
    }
}

/// Parse a UUID string, with or without dashes
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str.trim()).with_context(|| format!("Invalid UUID format: {uuid_str}"))
}
