//! Error taxonomy for the device coordinator.
//!
//! Connection failures are retried with backoff and then surface as
//! [`ConnectionError::DeviceUnavailable`]. Write failures go straight back to the
//! caller. Parse failures never leave the inbound path.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Failure reported by a transport backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("device {0} not found")]
    NotFound(String),
    #[error("no Bluetooth adapter available")]
    NoAdapter,
    #[error("characteristic {0} not found on device")]
    MissingCharacteristic(Uuid),
    #[error("link dropped")]
    Dropped,
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("device {address} unavailable after {attempts} attempts: {last}")]
    DeviceUnavailable {
        address: String,
        attempts: u32,
        last: LinkError,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("not connected")]
    NotConnected,
    #[error("write failed: {0}")]
    Link(LinkError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("not connected")]
    NotConnected,
    #[error("read failed: {0}")]
    Link(LinkError),
}

/// A received frame that could not be decoded. Logged and dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("frame too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },
    #[error("port index {port} outside 1..={port_count}")]
    PortOutOfRange { port: u16, port_count: u8 },
    #[error("unknown opcode {0:#04X}")]
    UnknownOpcode(u8),
}

/// A bounded wait ran out. Nothing was changed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} timed out after {after:?}")]
pub struct TimeoutError {
    pub operation: &'static str,
    pub after: Duration,
}

/// Result of a port command.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("port {port} outside 1..={port_count}")]
    InvalidPort { port: u8, port_count: u8 },
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

/// Result of a single poll tick. Absorbed by the scheduler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PollError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}
