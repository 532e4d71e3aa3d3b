//! Firmata wire format.
//!
//! This module holds the command constants, the pin mode / pin state types,
//! the outbound frame encoders and the incremental inbound [`Decoder`].
//!
//! # Frame families
//!
//! - Plain commands: the high nibble selects the command, the low nibble carries
//!   a port or channel for digital, analog and report messages. Commands in the
//!   `0xF*` range carry no channel.
//! - SysEx commands: `START_SYSEX`, a subcommand byte, a 7-bit payload and
//!   `END_SYSEX`.
//!
//! Multi-byte values travel as 7-bit groups, least significant group first.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::capability::PinCapabilityTable;
use crate::errors::{CapabilityError, FrameError};

// ============================================================================
// Constants
// ============================================================================

// Plain commands
pub const DIGITAL_MESSAGE: u8 = 0x90;
pub const REPORT_ANALOG: u8 = 0xC0;
pub const REPORT_DIGITAL: u8 = 0xD0;
pub const ANALOG_MESSAGE: u8 = 0xE0;
pub const START_SYSEX: u8 = 0xF0;
pub const SET_PIN_MODE: u8 = 0xF4;
pub const SET_DIGITAL_PIN_VALUE: u8 = 0xF5;
pub const END_SYSEX: u8 = 0xF7;
pub const PROTOCOL_VERSION: u8 = 0xF9;
pub const SYSTEM_RESET: u8 = 0xFF;

/// SysEx subcommands (the byte right after `START_SYSEX`).
pub mod sysex {
    pub const ANALOG_MAPPING_QUERY: u8 = 0x69;
    pub const ANALOG_MAPPING_RESPONSE: u8 = 0x6A;
    pub const CAPABILITY_QUERY: u8 = 0x6B;
    pub const CAPABILITY_RESPONSE: u8 = 0x6C;
    pub const PIN_STATE_QUERY: u8 = 0x6D;
    pub const PIN_STATE_RESPONSE: u8 = 0x6E;
    pub const EXTENDED_ANALOG: u8 = 0x6F;
    pub const SERVO_CONFIG: u8 = 0x70;
    pub const STRING_DATA: u8 = 0x71;
    pub const I2C_REQUEST: u8 = 0x76;
    pub const I2C_REPLY: u8 = 0x77;
    pub const I2C_CONFIG: u8 = 0x78;
    pub const REPORT_FIRMWARE: u8 = 0x79;
    pub const SAMPLING_INTERVAL: u8 = 0x7A;
}

/// Terminates one pin's group inside a capability response.
pub const END_OF_PIN_GROUP: u8 = 0x7F;

/// Largest pin count addressable by the base protocol (16 ports of 8 pins).
pub const MAX_PINS: usize = 128;

/// Number of digital ports addressable through the command nibble.
pub const MAX_PORTS: usize = 16;

/// SysEx frames longer than this are dropped.
pub const MAX_SYSEX_LEN: usize = 4096;

// ============================================================================
// Pin modes and states
// ============================================================================

/// Operating role of a pin, with its Firmata mode code as discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum PinMode {
    Input = 0x00,
    Output = 0x01,
    Analog = 0x02,
    Pwm = 0x03,
    Servo = 0x04,
    Shift = 0x05,
    I2c = 0x06,
    OneWire = 0x07,
    Stepper = 0x08,
    Encoder = 0x09,
    Serial = 0x0A,
    Pullup = 0x0B,
    Ignored = 0x7F,
}

impl PinMode {
    /// Wire code for this mode.
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Map a wire code back to a mode. Unknown codes yield `None`.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => PinMode::Input,
            0x01 => PinMode::Output,
            0x02 => PinMode::Analog,
            0x03 => PinMode::Pwm,
            0x04 => PinMode::Servo,
            0x05 => PinMode::Shift,
            0x06 => PinMode::I2c,
            0x07 => PinMode::OneWire,
            0x08 => PinMode::Stepper,
            0x09 => PinMode::Encoder,
            0x0A => PinMode::Serial,
            0x0B => PinMode::Pullup,
            0x7F => PinMode::Ignored,
            _ => return None,
        })
    }

    /// Modes whose pins report through digital port messages.
    #[inline]
    pub fn is_digital_input(self) -> bool {
        matches!(self, PinMode::Input | PinMode::Pullup)
    }

    fn name(self) -> &'static str {
        match self {
            PinMode::Input => "input",
            PinMode::Output => "output",
            PinMode::Analog => "analog",
            PinMode::Pwm => "pwm",
            PinMode::Servo => "servo",
            PinMode::Shift => "shift",
            PinMode::I2c => "i2c",
            PinMode::OneWire => "onewire",
            PinMode::Stepper => "stepper",
            PinMode::Encoder => "encoder",
            PinMode::Serial => "serial",
            PinMode::Pullup => "pullup",
            PinMode::Ignored => "ignored",
        }
    }
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PinMode {
    type Err = CapabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mode = match s.trim().to_ascii_lowercase().as_str() {
            "input" => PinMode::Input,
            "output" => PinMode::Output,
            "analog" => PinMode::Analog,
            "pwm" => PinMode::Pwm,
            "servo" => PinMode::Servo,
            "shift" => PinMode::Shift,
            "i2c" => PinMode::I2c,
            "onewire" => PinMode::OneWire,
            "stepper" => PinMode::Stepper,
            "encoder" => PinMode::Encoder,
            "serial" => PinMode::Serial,
            "pullup" | "input_pullup" => PinMode::Pullup,
            "ignored" => PinMode::Ignored,
            other => {
                return Err(CapabilityError::InvalidArgument(format!(
                    "unknown pin mode '{other}'"
                )))
            }
        };
        Ok(mode)
    }
}

/// Logic level of a digital pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PinState {
    #[default]
    Low,
    High,
}

impl PinState {
    #[inline]
    pub fn is_high(self) -> bool {
        self == PinState::High
    }

    /// Cache representation (0 or 1).
    #[inline]
    pub fn value(self) -> u16 {
        match self {
            PinState::Low => 0,
            PinState::High => 1,
        }
    }
}

impl From<bool> for PinState {
    fn from(high: bool) -> Self {
        if high {
            PinState::High
        } else {
            PinState::Low
        }
    }
}

impl fmt::Display for PinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinState::Low => f.write_str("low"),
            PinState::High => f.write_str("high"),
        }
    }
}

impl FromStr for PinState {
    type Err = CapabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" | "1" | "on" => Ok(PinState::High),
            "low" | "0" | "off" => Ok(PinState::Low),
            other => Err(CapabilityError::InvalidArgument(format!(
                "unknown pin state '{other}' (expected high/low)"
            ))),
        }
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Port index and bit mask of a pin within its 8-pin port.
#[inline]
pub fn port_for_pin(pin: u8) -> (u8, u8) {
    (pin / 8, 1 << (pin % 8))
}

/// Set or clear `mask` in an aggregate port value.
#[inline]
pub fn apply_pin_state(port_value: u8, mask: u8, state: PinState) -> u8 {
    match state {
        PinState::High => port_value | mask,
        PinState::Low => port_value & !mask,
    }
}

/// Append `value` as two 7-bit bytes, low group first.
#[inline]
pub fn push_two_7bit(buf: &mut Vec<u8>, value: u16) {
    buf.push((value & 0x7F) as u8);
    buf.push(((value >> 7) & 0x7F) as u8);
}

/// `[SET_PIN_MODE][pin][mode]`. No capability check happens here.
pub fn encode_set_pin_mode(pin: u8, mode: PinMode) -> [u8; 3] {
    [SET_PIN_MODE, pin, mode.code()]
}

/// `[DIGITAL_MESSAGE | port][low 7 bits][bits 7..13]`.
///
/// The port number is confined to the low nibble, so only 16 ports are
/// addressable.
pub fn encode_digital_port(port: u8, value: u16) -> [u8; 3] {
    [
        DIGITAL_MESSAGE | (port & 0x0F),
        (value & 0x7F) as u8,
        ((value >> 7) & 0x7F) as u8,
    ]
}

/// Encode a single pin update against the caller-supplied aggregate port value.
///
/// Sibling bits are taken from `port_value` as-is.
pub fn encode_digital_write(pin: u8, state: PinState, port_value: u8) -> [u8; 3] {
    let (port, mask) = port_for_pin(pin);
    encode_digital_port(port, apply_pin_state(port_value, mask, state) as u16)
}

/// Analog (PWM/servo) output.
///
/// Pins 0-15 with values up to 14 bits use the compact analog message; anything
/// else goes through the extended-analog SysEx.
pub fn encode_analog_write(pin: u8, value: u16) -> Vec<u8> {
    if pin <= 0x0F && value <= 0x3FFF {
        let mut frame = Vec::with_capacity(3);
        frame.push(ANALOG_MESSAGE | pin);
        push_two_7bit(&mut frame, value);
        return frame;
    }

    let mut frame = vec![START_SYSEX, sysex::EXTENDED_ANALOG, pin & 0x7F];
    let mut remaining = value as u32;
    loop {
        frame.push((remaining & 0x7F) as u8);
        remaining >>= 7;
        if remaining == 0 {
            break;
        }
    }
    frame.push(END_SYSEX);
    frame
}

/// Enable or disable reporting for a whole digital port.
pub fn encode_report_digital(port: u8, enable: bool) -> [u8; 2] {
    [REPORT_DIGITAL | (port & 0x0F), enable as u8]
}

/// Enable or disable reporting for an analog channel.
pub fn encode_report_analog(channel: u8, enable: bool) -> [u8; 2] {
    [REPORT_ANALOG | (channel & 0x0F), enable as u8]
}

pub fn encode_capability_query() -> [u8; 3] {
    [START_SYSEX, sysex::CAPABILITY_QUERY, END_SYSEX]
}

pub fn encode_pin_state_query(pin: u8) -> [u8; 4] {
    [START_SYSEX, sysex::PIN_STATE_QUERY, pin & 0x7F, END_SYSEX]
}

pub fn encode_firmware_query() -> [u8; 3] {
    [START_SYSEX, sysex::REPORT_FIRMWARE, END_SYSEX]
}

pub fn encode_protocol_version_query() -> [u8; 1] {
    [PROTOCOL_VERSION]
}

pub fn encode_system_reset() -> [u8; 1] {
    [SYSTEM_RESET]
}

/// Wrap a raw payload in a SysEx envelope. Payload bytes are masked to 7 bits.
pub fn encode_sysex(command: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 3);
    frame.push(START_SYSEX);
    frame.push(command & 0x7F);
    frame.extend(payload.iter().map(|b| b & 0x7F));
    frame.push(END_SYSEX);
    frame
}

/// STRING_DATA SysEx; every byte of the text is sent as two 7-bit bytes.
pub fn encode_string(text: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(text.len() * 2 + 3);
    frame.push(START_SYSEX);
    frame.push(sysex::STRING_DATA);
    for byte in text.bytes() {
        push_two_7bit(&mut frame, byte as u16);
    }
    frame.push(END_SYSEX);
    frame
}

// ============================================================================
// Decoding
// ============================================================================

/// A complete inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    AnalogMessage { channel: u8, value: u16 },
    DigitalMessage { port: u8, value: u16 },
    ReportAnalog { channel: u8, enable: bool },
    ReportDigital { port: u8, enable: bool },
    /// `mode` stays a raw code so unknown modes survive decoding.
    SetPinMode { pin: u8, mode: u8 },
    SetDigitalPinValue { pin: u8, state: PinState },
    ProtocolVersion { major: u8, minor: u8 },
    SystemReset,
    Sysex(SysexMessage),
}

/// Decoded SysEx payload, dispatched on the subcommand byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SysexMessage {
    CapabilityQuery,
    CapabilityResponse(PinCapabilityTable),
    PinStateResponse { pin: u8, mode: u8, value: u32 },
    ExtendedAnalog { pin: u8, value: u32 },
    StringData(String),
    I2cReply { address: u16, register: u16, data: Vec<u8> },
    ReportFirmware { major: u8, minor: u8, name: String },
    Other { command: u8, payload: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Data {
        command: u8,
        channel: u8,
        needed: usize,
        data: [u8; 2],
        received: usize,
    },
    Sysex,
    /// Skipping the rest of an oversized SysEx frame.
    DiscardSysex,
    /// Skipping the data bytes of an unrecognised command.
    DiscardData,
}

/// Incremental decoder for the inbound byte stream.
///
/// Bytes are pushed one at a time; completed frames and frame errors are
/// appended to the caller's output vector in stream order. After an error the
/// partial frame is dropped and decoding continues with the next byte. A
/// status byte that interrupts a frame starts the next frame, which is the
/// only resynchronisation point the protocol offers.
#[derive(Debug)]
pub struct Decoder {
    state: State,
    sysex: Vec<u8>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            sysex: Vec::new(),
        }
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.sysex.clear();
    }

    /// True when no frame is partially decoded.
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    /// Decode a whole buffer.
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<Result<Frame, FrameError>> {
        let mut out = Vec::new();
        for &byte in bytes {
            self.push(byte, &mut out);
        }
        out
    }

    /// Feed one byte.
    pub fn push(&mut self, byte: u8, out: &mut Vec<Result<Frame, FrameError>>) {
        match self.state {
            State::Idle => self.start(byte, out),
            State::Data {
                command,
                channel,
                needed,
                mut data,
                received,
            } => {
                if byte & 0x80 != 0 {
                    self.state = State::Idle;
                    out.push(Err(FrameError::Truncated {
                        command,
                        interrupted_by: byte,
                    }));
                    self.start(byte, out);
                    return;
                }

                data[received] = byte;
                let received = received + 1;
                if received < needed {
                    self.state = State::Data {
                        command,
                        channel,
                        needed,
                        data,
                        received,
                    };
                } else {
                    self.state = State::Idle;
                    out.push(finish_command(command, channel, data));
                }
            }
            State::Sysex => {
                if byte == END_SYSEX {
                    self.state = State::Idle;
                    out.push(parse_sysex(&self.sysex));
                    self.sysex.clear();
                } else if byte & 0x80 != 0 {
                    out.push(Err(FrameError::TruncatedSysex {
                        received: self.sysex.len(),
                        interrupted_by: byte,
                    }));
                    self.reset();
                    self.start(byte, out);
                } else if self.sysex.len() >= MAX_SYSEX_LEN {
                    out.push(Err(FrameError::SysexOverflow {
                        limit: MAX_SYSEX_LEN,
                    }));
                    self.sysex.clear();
                    self.state = State::DiscardSysex;
                } else {
                    self.sysex.push(byte);
                }
            }
            State::DiscardSysex => {
                if byte == END_SYSEX {
                    self.state = State::Idle;
                } else if byte & 0x80 != 0 {
                    self.state = State::Idle;
                    self.start(byte, out);
                }
            }
            State::DiscardData => {
                if byte & 0x80 != 0 {
                    self.state = State::Idle;
                    self.start(byte, out);
                }
            }
        }
    }

    fn start(&mut self, byte: u8, out: &mut Vec<Result<Frame, FrameError>>) {
        if byte & 0x80 == 0 {
            out.push(Err(FrameError::UnexpectedDataByte(byte)));
            return;
        }

        // Commands below 0xF0 carry a port/channel in the low nibble
        let (command, channel) = if byte < 0xF0 {
            (byte & 0xF0, byte & 0x0F)
        } else {
            (byte, 0)
        };

        let needed = match command {
            ANALOG_MESSAGE | DIGITAL_MESSAGE | SET_PIN_MODE | SET_DIGITAL_PIN_VALUE
            | PROTOCOL_VERSION => 2,
            REPORT_ANALOG | REPORT_DIGITAL => 1,
            START_SYSEX => {
                self.sysex.clear();
                self.state = State::Sysex;
                return;
            }
            SYSTEM_RESET => {
                self.reset();
                out.push(Ok(Frame::SystemReset));
                return;
            }
            _ => {
                out.push(Err(FrameError::UnknownCommand(byte)));
                self.state = State::DiscardData;
                return;
            }
        };

        self.state = State::Data {
            command,
            channel,
            needed,
            data: [0; 2],
            received: 0,
        };
    }
}

fn finish_command(command: u8, channel: u8, data: [u8; 2]) -> Result<Frame, FrameError> {
    let value = data[0] as u16 | ((data[1] as u16) << 7);
    let frame = match command {
        ANALOG_MESSAGE => Frame::AnalogMessage { channel, value },
        DIGITAL_MESSAGE => Frame::DigitalMessage {
            port: channel,
            value,
        },
        REPORT_ANALOG => Frame::ReportAnalog {
            channel,
            enable: data[0] != 0,
        },
        REPORT_DIGITAL => Frame::ReportDigital {
            port: channel,
            enable: data[0] != 0,
        },
        SET_PIN_MODE => Frame::SetPinMode {
            pin: data[0],
            mode: data[1],
        },
        SET_DIGITAL_PIN_VALUE => Frame::SetDigitalPinValue {
            pin: data[0],
            state: PinState::from(data[1] != 0),
        },
        PROTOCOL_VERSION => Frame::ProtocolVersion {
            major: data[0],
            minor: data[1],
        },
        other => return Err(FrameError::UnknownCommand(other)),
    };
    Ok(frame)
}

/// Join 7-bit groups (low first) into one value; at most four groups are used.
fn join_7bit(groups: &[u8]) -> u32 {
    groups
        .iter()
        .take(4)
        .enumerate()
        .fold(0u32, |acc, (i, &b)| acc | ((b as u32 & 0x7F) << (7 * i)))
}

/// Reassemble values sent as two 7-bit bytes. A dangling odd byte is dropped.
fn join_pairs(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2)
        .map(|pair| pair[0] as u16 | ((pair[1] as u16) << 7))
        .collect()
}

fn pairs_to_text(data: &[u8]) -> String {
    let bytes: Vec<u8> = join_pairs(data)
        .into_iter()
        .map(|v| v as u8)
        .take_while(|&b| b != 0)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn parse_sysex(payload: &[u8]) -> Result<Frame, FrameError> {
    let (&command, data) = payload.split_first().ok_or(FrameError::EmptySysex)?;

    let message = match command {
        sysex::CAPABILITY_QUERY => SysexMessage::CapabilityQuery,
        sysex::CAPABILITY_RESPONSE => {
            SysexMessage::CapabilityResponse(PinCapabilityTable::from_response(data)?)
        }
        sysex::PIN_STATE_RESPONSE => {
            if data.len() < 2 {
                return Err(FrameError::MalformedSysex {
                    command,
                    reason: format!("expected pin and mode, got {} bytes", data.len()),
                });
            }
            SysexMessage::PinStateResponse {
                pin: data[0],
                mode: data[1],
                value: join_7bit(&data[2..]),
            }
        }
        sysex::EXTENDED_ANALOG => {
            let (&pin, value) = data.split_first().ok_or(FrameError::MalformedSysex {
                command,
                reason: "missing pin".into(),
            })?;
            SysexMessage::ExtendedAnalog {
                pin,
                value: join_7bit(value),
            }
        }
        sysex::STRING_DATA => SysexMessage::StringData(pairs_to_text(data)),
        sysex::I2C_REPLY => {
            let values = join_pairs(data);
            if values.len() < 2 {
                return Err(FrameError::MalformedSysex {
                    command,
                    reason: "expected address and register".into(),
                });
            }
            SysexMessage::I2cReply {
                address: values[0],
                register: values[1],
                data: values[2..].iter().map(|&v| v as u8).collect(),
            }
        }
        sysex::REPORT_FIRMWARE => {
            if data.len() < 2 {
                return Err(FrameError::MalformedSysex {
                    command,
                    reason: "expected major and minor version".into(),
                });
            }
            SysexMessage::ReportFirmware {
                major: data[0],
                minor: data[1],
                name: pairs_to_text(&data[2..]),
            }
        }
        _ => SysexMessage::Other {
            command,
            payload: data.to_vec(),
        },
    };
    Ok(Frame::Sysex(message))
}
