//! I2C over Firmata SysEx.
//!
//! Replies come back asynchronously as [`DeviceEvent::I2cReply`](crate::DeviceEvent::I2cReply).

use log::debug;

use crate::device::RemoteDevice;
use crate::errors::{CapabilityError, Result};
use crate::protocol::{push_two_7bit, sysex, END_SYSEX, START_SYSEX};

/// Longest read delay the config message can carry (14 bits).
pub const MAX_READ_DELAY_US: u16 = 0x3FFF;

/// Read/write mode bits of an I2C request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum I2cMode {
    Write = 0x00,
    ReadOnce = 0x08,
    ReadContinuously = 0x10,
    StopReading = 0x18,
}

pub fn encode_i2c_config(read_delay_us: u16) -> Vec<u8> {
    let mut frame = vec![START_SYSEX, sysex::I2C_CONFIG];
    push_two_7bit(&mut frame, read_delay_us);
    frame.push(END_SYSEX);
    frame
}

/// `[START_SYSEX][I2C_REQUEST][address][mode]([register])?[data]*[END_SYSEX]`,
/// register and data as two 7-bit bytes each.
pub fn encode_i2c_request(address: u8, mode: I2cMode, register: Option<u8>, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(6 + 2 * data.len());
    frame.push(START_SYSEX);
    frame.push(sysex::I2C_REQUEST);
    frame.push(address & 0x7F);
    frame.push(mode as u8);
    if let Some(register) = register {
        push_two_7bit(&mut frame, register as u16);
    }
    for &byte in data {
        push_two_7bit(&mut frame, byte as u16);
    }
    frame.push(END_SYSEX);
    frame
}

/// I2C bus helper borrowed from a [`RemoteDevice`].
pub struct TwoWire<'a> {
    device: &'a RemoteDevice,
}

impl<'a> TwoWire<'a> {
    pub(crate) fn new(device: &'a RemoteDevice) -> Self {
        Self { device }
    }

    fn check_address(address: u8) -> Result<()> {
        if address > 0x7F {
            return Err(CapabilityError::InvalidArgument(format!(
                "I2C address {address:#04X} is not a 7-bit address"
            ))
            .into());
        }
        Ok(())
    }

    /// Turn on I2C on the board; `read_delay_us` is the pause between a
    /// register write and the following read.
    pub fn enable(&self, read_delay_us: u16) -> Result<()> {
        if read_delay_us > MAX_READ_DELAY_US {
            return Err(CapabilityError::InvalidArgument(format!(
                "I2C read delay {read_delay_us}us exceeds {MAX_READ_DELAY_US}us"
            ))
            .into());
        }
        self.device.write_frame(&encode_i2c_config(read_delay_us))
    }

    pub fn write(&self, address: u8, data: &[u8]) -> Result<()> {
        Self::check_address(address)?;
        debug!("I2C write to {:#04X}: {:02X?}", address, data);
        self.device
            .write_frame(&encode_i2c_request(address, I2cMode::Write, None, data))
    }

    /// Request `count` bytes, optionally starting at `register`.
    ///
    /// Continuous reads keep polling until [`stop`](Self::stop) and need a
    /// register.
    pub fn read(&self, address: u8, count: u8, register: Option<u8>, continuous: bool) -> Result<()> {
        Self::check_address(address)?;
        if continuous && register.is_none() {
            return Err(CapabilityError::InvalidArgument(
                "continuous I2C reads need a register".into(),
            )
            .into());
        }
        let mode = if continuous {
            I2cMode::ReadContinuously
        } else {
            I2cMode::ReadOnce
        };
        self.device
            .write_frame(&encode_i2c_request(address, mode, register, &[count]))
    }

    pub fn stop(&self, address: u8) -> Result<()> {
        Self::check_address(address)?;
        self.device
            .write_frame(&encode_i2c_request(address, I2cMode::StopReading, None, &[]))
    }
}
