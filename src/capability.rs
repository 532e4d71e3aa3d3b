//! Per-pin capability table, built from a capability-response payload.

use serde::{Deserialize, Serialize};

use crate::errors::FrameError;
use crate::protocol::{sysex, PinMode, END_OF_PIN_GROUP, END_SYSEX, MAX_PINS, START_SYSEX};

/// Capability bitmask flags, one bit per classified mode.
pub mod mask {
    pub const INPUT: u8 = 0x01;
    pub const INPUT_PULLUP: u8 = 0x02;
    pub const OUTPUT: u8 = 0x04;
    pub const ANALOG: u8 = 0x08;
    pub const PWM: u8 = 0x10;
    pub const SERVO: u8 = 0x20;
    pub const I2C: u8 = 0x40;
}

/// One `(mode, resolution)` pair as declared by the board.
///
/// The mode is kept as its raw code; codes this crate does not know are still
/// listed but never classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capability {
    pub code: u8,
    pub resolution: u8,
}

impl Capability {
    pub fn new(mode: PinMode, resolution: u8) -> Self {
        Self {
            code: mode.code(),
            resolution,
        }
    }

    #[inline]
    pub fn mode(&self) -> Option<PinMode> {
        PinMode::from_code(self.code)
    }
}

/// Capabilities of a single pin, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinCapabilities {
    capabilities: Vec<Capability>,
}

impl PinCapabilities {
    pub fn new(capabilities: Vec<Capability>) -> Self {
        Self { capabilities }
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// A pin without any declared mode is disabled.
    pub fn is_disabled(&self) -> bool {
        self.capabilities.is_empty()
    }

    pub fn supports(&self, mode: PinMode) -> bool {
        self.capabilities.iter().any(|c| c.code == mode.code())
    }

    /// Resolution (bits) of the first declaration of `mode`.
    pub fn resolution(&self, mode: PinMode) -> Option<u8> {
        self.capabilities
            .iter()
            .find(|c| c.code == mode.code())
            .map(|c| c.resolution)
    }

    /// Bitmask built from the [`mask`] flags.
    pub fn bitmask(&self) -> u8 {
        self.capabilities
            .iter()
            .filter_map(Capability::mode)
            .fold(0, |acc, mode| {
                acc | match mode {
                    PinMode::Input => mask::INPUT,
                    PinMode::Pullup => mask::INPUT_PULLUP,
                    PinMode::Output => mask::OUTPUT,
                    PinMode::Analog => mask::ANALOG,
                    PinMode::Pwm => mask::PWM,
                    PinMode::Servo => mask::SERVO,
                    PinMode::I2c => mask::I2C,
                    _ => 0,
                }
            })
    }
}

/// Every pin's capabilities, indexed by pin number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinCapabilityTable {
    pins: Vec<PinCapabilities>,
}

impl PinCapabilityTable {
    pub fn new(pins: Vec<PinCapabilities>) -> Self {
        Self { pins }
    }

    /// Parse the bytes between the `CAPABILITY_RESPONSE` subcommand and
    /// `END_SYSEX`.
    ///
    /// Each pin is a run of `(mode, resolution)` pairs closed by `0x7F`. An
    /// empty payload yields an empty table.
    pub fn from_response(payload: &[u8]) -> Result<Self, FrameError> {
        let mut pins = Vec::new();
        let mut current = Vec::new();
        let mut bytes = payload.iter().copied();

        while let Some(code) = bytes.next() {
            if code == END_OF_PIN_GROUP {
                pins.push(PinCapabilities::new(std::mem::take(&mut current)));
                if pins.len() > MAX_PINS {
                    return Err(FrameError::MalformedCapability(format!(
                        "more than {MAX_PINS} pins declared"
                    )));
                }
                continue;
            }

            let resolution = bytes.next().ok_or_else(|| {
                FrameError::MalformedCapability(format!(
                    "pin {} mode {code:#04X} has no resolution byte",
                    pins.len()
                ))
            })?;
            current.push(Capability { code, resolution });
        }

        if !current.is_empty() {
            return Err(FrameError::MalformedCapability(format!(
                "pin {} group is not terminated",
                pins.len()
            )));
        }

        Ok(Self { pins })
    }

    /// Complete capability-response SysEx frame for this table.
    pub fn to_response_frame(&self) -> Vec<u8> {
        let mut frame = vec![START_SYSEX, sysex::CAPABILITY_RESPONSE];
        for pin in &self.pins {
            for cap in &pin.capabilities {
                frame.push(cap.code & 0x7F);
                frame.push(cap.resolution & 0x7F);
            }
            frame.push(END_OF_PIN_GROUP);
        }
        frame.push(END_SYSEX);
        frame
    }

    pub fn pin_count(&self) -> usize {
        self.pins.len()
    }

    pub fn pin(&self, pin: usize) -> Option<&PinCapabilities> {
        self.pins.get(pin)
    }

    pub fn pins(&self) -> &[PinCapabilities] {
        &self.pins
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &PinCapabilities)> {
        self.pins.iter().enumerate().map(|(i, p)| (i as u8, p))
    }
}
