use std::io;
use thiserror::Error;

use crate::protocol::PinMode;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("capability error: {0}")]
    Capability(#[from] CapabilityError),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("device not ready: {0}")]
    NotReady(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection not established: {0}")]
    NotConnected(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

/// Problems found while decoding the inbound byte stream.
///
/// The decoder discards the partial frame and keeps going, so these are
/// reported rather than propagated as fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unknown command byte {0:#04X}")]
    UnknownCommand(u8),
    #[error("unexpected data byte {0:#04X} outside of a frame")]
    UnexpectedDataByte(u8),
    #[error("truncated frame for command {command:#04X}: interrupted by {interrupted_by:#04X}")]
    Truncated { command: u8, interrupted_by: u8 },
    #[error("truncated sysex frame ({received} bytes): interrupted by {interrupted_by:#04X}")]
    TruncatedSysex { received: usize, interrupted_by: u8 },
    #[error("sysex frame exceeds {limit} bytes")]
    SysexOverflow { limit: usize },
    #[error("empty sysex frame")]
    EmptySysex,
    #[error("malformed capability response: {0}")]
    MalformedCapability(String),
    #[error("malformed sysex {command:#04X} payload: {reason}")]
    MalformedSysex { command: u8, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("pin {pin} out of range (board has {total} pins)")]
    PinOutOfRange { pin: usize, total: usize },
    #[error("pin {pin} does not support mode {mode:?}")]
    ModeNotSupported { pin: u8, mode: PinMode },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;
