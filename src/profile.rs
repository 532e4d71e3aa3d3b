//! Hardware profile: the capability table classified into pin categories.

use serde::{Deserialize, Serialize};

use crate::capability::PinCapabilityTable;
use crate::errors::{CapabilityError, FrameError};
use crate::protocol::PinMode;

/// Read-only view of what a board can do, derived once per capability table.
///
/// Category lists are ascending and may overlap (a pin is often both digital
/// and PWM). A pin without any declared mode is only listed as disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareProfile {
    table: PinCapabilityTable,
    analog_offset: Option<u8>,
    analog: Vec<u8>,
    digital_input: Vec<u8>,
    digital_input_pullup: Vec<u8>,
    digital_output: Vec<u8>,
    i2c: Vec<u8>,
    pwm: Vec<u8>,
    servo: Vec<u8>,
    disabled: Vec<u8>,
}

impl HardwareProfile {
    pub fn from_table(table: PinCapabilityTable) -> Self {
        let mut profile = Self::default();

        for (pin, caps) in table.iter() {
            if caps.is_disabled() {
                profile.disabled.push(pin);
                continue;
            }
            for mode in caps.capabilities().iter().filter_map(|c| c.mode()) {
                if let Some(list) = profile.category_mut(mode) {
                    // Pins arrive in order, so a repeat can only be the last entry
                    if list.last() != Some(&pin) {
                        list.push(pin);
                    }
                }
            }
        }

        profile.analog_offset = profile.analog.first().copied();
        profile.table = table;
        profile
    }

    /// Parse a capability-response payload and classify it.
    pub fn from_response(payload: &[u8]) -> Result<Self, FrameError> {
        PinCapabilityTable::from_response(payload).map(Self::from_table)
    }

    fn category_mut(&mut self, mode: PinMode) -> Option<&mut Vec<u8>> {
        match mode {
            PinMode::Analog => Some(&mut self.analog),
            PinMode::Input => Some(&mut self.digital_input),
            PinMode::Pullup => Some(&mut self.digital_input_pullup),
            PinMode::Output => Some(&mut self.digital_output),
            PinMode::I2c => Some(&mut self.i2c),
            PinMode::Pwm => Some(&mut self.pwm),
            PinMode::Servo => Some(&mut self.servo),
            _ => None,
        }
    }

    // ------------------------------------------------------------------------
    // Counts and categories
    // ------------------------------------------------------------------------

    pub fn total_pin_count(&self) -> usize {
        self.table.pin_count()
    }

    pub fn analog_pin_count(&self) -> usize {
        self.analog.len()
    }

    /// Lowest pin index that declares ANALOG.
    pub fn analog_offset(&self) -> Option<u8> {
        self.analog_offset
    }

    pub fn capability_table(&self) -> &PinCapabilityTable {
        &self.table
    }

    pub fn analog_pins(&self) -> &[u8] {
        &self.analog
    }

    pub fn digital_input_pins(&self) -> &[u8] {
        &self.digital_input
    }

    pub fn digital_input_pullup_pins(&self) -> &[u8] {
        &self.digital_input_pullup
    }

    pub fn digital_output_pins(&self) -> &[u8] {
        &self.digital_output
    }

    pub fn i2c_pins(&self) -> &[u8] {
        &self.i2c
    }

    pub fn pwm_pins(&self) -> &[u8] {
        &self.pwm
    }

    pub fn servo_pins(&self) -> &[u8] {
        &self.servo
    }

    pub fn disabled_pins(&self) -> &[u8] {
        &self.disabled
    }

    /// Union of the input, pullup and output categories.
    pub fn digital_pins(&self) -> Vec<u8> {
        let mut pins: Vec<u8> = self
            .digital_input
            .iter()
            .chain(&self.digital_input_pullup)
            .chain(&self.digital_output)
            .copied()
            .collect();
        pins.sort_unstable();
        pins.dedup();
        pins
    }

    /// Pin behind analog channel `channel` (the channel-th analog pin).
    pub fn analog_pin(&self, channel: u8) -> Option<u8> {
        self.analog.get(channel as usize).copied()
    }

    /// Inverse of [`analog_pin`](Self::analog_pin).
    pub fn analog_channel(&self, pin: u8) -> Option<u8> {
        self.analog.binary_search(&pin).ok().map(|i| i as u8)
    }

    // ------------------------------------------------------------------------
    // Per-pin queries
    // ------------------------------------------------------------------------

    /// Fail with `PinOutOfRange` unless `pin < total_pin_count()`.
    pub fn check_pin(&self, pin: u8) -> Result<(), CapabilityError> {
        let total = self.total_pin_count();
        if (pin as usize) < total {
            Ok(())
        } else {
            Err(CapabilityError::PinOutOfRange {
                pin: pin as usize,
                total,
            })
        }
    }

    fn in_category(&self, pin: u8, list: &[u8]) -> Result<bool, CapabilityError> {
        self.check_pin(pin)?;
        Ok(list.binary_search(&pin).is_ok())
    }

    pub fn is_analog_supported(&self, pin: u8) -> Result<bool, CapabilityError> {
        self.in_category(pin, &self.analog)
    }

    pub fn is_digital_input_supported(&self, pin: u8) -> Result<bool, CapabilityError> {
        self.in_category(pin, &self.digital_input)
    }

    pub fn is_digital_input_pullup_supported(&self, pin: u8) -> Result<bool, CapabilityError> {
        self.in_category(pin, &self.digital_input_pullup)
    }

    pub fn is_digital_output_supported(&self, pin: u8) -> Result<bool, CapabilityError> {
        self.in_category(pin, &self.digital_output)
    }

    pub fn is_i2c_supported(&self, pin: u8) -> Result<bool, CapabilityError> {
        self.in_category(pin, &self.i2c)
    }

    pub fn is_pwm_supported(&self, pin: u8) -> Result<bool, CapabilityError> {
        self.in_category(pin, &self.pwm)
    }

    pub fn is_servo_supported(&self, pin: u8) -> Result<bool, CapabilityError> {
        self.in_category(pin, &self.servo)
    }

    /// Whether `pin` declares `mode`, for any mode including unclassified ones.
    pub fn supports(&self, pin: u8, mode: PinMode) -> Result<bool, CapabilityError> {
        self.check_pin(pin)?;
        Ok(self
            .table
            .pin(pin as usize)
            .is_some_and(|caps| caps.supports(mode)))
    }

    pub fn resolution(&self, pin: u8, mode: PinMode) -> Result<Option<u8>, CapabilityError> {
        self.check_pin(pin)?;
        Ok(self
            .table
            .pin(pin as usize)
            .and_then(|caps| caps.resolution(mode)))
    }

    /// Capability bitmask of `pin`, see [`crate::capability::mask`].
    pub fn capability_mask(&self, pin: u8) -> Result<u8, CapabilityError> {
        self.check_pin(pin)?;
        Ok(self
            .table
            .pin(pin as usize)
            .map(|caps| caps.bitmask())
            .unwrap_or(0))
    }
}
