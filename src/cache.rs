//! Host-side mirror of every pin's mode and value.
//!
//! Values written by the host are recorded optimistically and stay
//! unconfirmed until the board reports them. Digital pins are additionally
//! tracked as 8-bit port values, which is what goes on the wire.

use serde::{Deserialize, Serialize};

use crate::errors::CapabilityError;
use crate::protocol::{apply_pin_state, port_for_pin, PinMode, PinState, MAX_PINS, MAX_PORTS};

/// Cached state of one pin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinEntry {
    /// `None` until the host sets a mode or the board reports one.
    pub mode: Option<PinMode>,
    pub value: u16,
    /// True only when the current value came from the board.
    pub confirmed: bool,
}

/// Observable change produced by applying a frame or a mode switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinUpdate {
    Digital { pin: u8, state: PinState },
    Analog { pin: u8, value: u16 },
    Mode { pin: u8, mode: PinMode },
    Reported { pin: u8, mode: Option<PinMode>, value: u32 },
}

#[derive(Debug, Clone)]
pub struct PinStateCache {
    pins: Vec<PinEntry>,
    ports: [u8; MAX_PORTS],
    subscribed: [u8; MAX_PORTS],
}

impl Default for PinStateCache {
    fn default() -> Self {
        Self::new(0)
    }
}

impl PinStateCache {
    pub fn new(pin_count: usize) -> Self {
        Self {
            pins: vec![PinEntry::default(); pin_count.min(MAX_PINS)],
            ports: [0; MAX_PORTS],
            subscribed: [0; MAX_PORTS],
        }
    }

    pub fn pin_count(&self) -> usize {
        self.pins.len()
    }

    /// Adjust to a new pin count, keeping mode, value and subscription of
    /// every pin still in range.
    pub fn resize(&mut self, pin_count: usize) {
        let pin_count = pin_count.min(MAX_PINS);
        self.pins.resize(pin_count, PinEntry::default());
        for (port, (value, subscribed)) in self
            .ports
            .iter_mut()
            .zip(self.subscribed.iter_mut())
            .enumerate()
        {
            let valid = match pin_count.saturating_sub(port * 8) {
                0 => 0,
                n if n >= 8 => 0xFF,
                n => (1u8 << n) - 1,
            };
            *value &= valid;
            *subscribed &= valid;
        }
    }

    pub fn entry(&self, pin: u8) -> Result<&PinEntry, CapabilityError> {
        self.pins
            .get(pin as usize)
            .ok_or(CapabilityError::PinOutOfRange {
                pin: pin as usize,
                total: self.pins.len(),
            })
    }

    fn entry_mut(&mut self, pin: u8) -> Result<&mut PinEntry, CapabilityError> {
        let total = self.pins.len();
        self.pins
            .get_mut(pin as usize)
            .ok_or(CapabilityError::PinOutOfRange {
                pin: pin as usize,
                total,
            })
    }

    pub fn mode(&self, pin: u8) -> Result<Option<PinMode>, CapabilityError> {
        self.entry(pin).map(|e| e.mode)
    }

    pub fn value(&self, pin: u8) -> Result<u16, CapabilityError> {
        self.entry(pin).map(|e| e.value)
    }

    pub fn is_confirmed(&self, pin: u8) -> Result<bool, CapabilityError> {
        self.entry(pin).map(|e| e.confirmed)
    }

    /// Digital level, read from the port value.
    pub fn digital_state(&self, pin: u8) -> Result<PinState, CapabilityError> {
        self.entry(pin)?;
        let (port, mask) = port_for_pin(pin);
        Ok(PinState::from(self.ports[port as usize] & mask != 0))
    }

    /// Aggregate value of a digital port; 0 for ports beyond the protocol range.
    pub fn port_value(&self, port: u8) -> u8 {
        self.ports.get(port as usize).copied().unwrap_or(0)
    }

    /// Port value to put on the wire: bits of reporting input pins are
    /// masked out so a write never toggles their pullups.
    pub fn output_port_value(&self, port: u8) -> u8 {
        let index = port as usize;
        match (self.ports.get(index), self.subscribed.get(index)) {
            (Some(value), Some(subscribed)) => value & !subscribed,
            _ => 0,
        }
    }

    /// Whether the board is asked to report `pin` through port messages.
    pub fn is_subscribed(&self, pin: u8) -> bool {
        let (port, mask) = port_for_pin(pin);
        self.subscribed
            .get(port as usize)
            .is_some_and(|bits| bits & mask != 0)
    }

    /// Port reporting toggle needed when `pin` moves to `mode`.
    ///
    /// Returns `Some((port, enable))` only when the port as a whole starts or
    /// stops having subscribed pins. Nothing is recorded.
    pub fn subscription_change(
        &self,
        pin: u8,
        mode: PinMode,
    ) -> Result<Option<(u8, bool)>, CapabilityError> {
        self.entry(pin)?;
        let (port, mask) = port_for_pin(pin);
        let current = self.subscribed[port as usize];
        let next = if mode.is_digital_input() {
            current | mask
        } else {
            current & !mask
        };
        Ok(((current != 0) != (next != 0)).then_some((port, next != 0)))
    }

    // ------------------------------------------------------------------------
    // Host-initiated changes
    // ------------------------------------------------------------------------

    /// Record a mode the host just sent. Returns an update only when the mode
    /// actually changed.
    pub fn set_mode(&mut self, pin: u8, mode: PinMode) -> Result<Option<PinUpdate>, CapabilityError> {
        let (port, mask) = port_for_pin(pin);
        let port = port as usize;
        let entry = self.entry_mut(pin)?;
        let previous = entry.mode;
        entry.mode = Some(mode);
        entry.confirmed = false;

        if mode == PinMode::Output && previous != Some(PinMode::Output) {
            entry.value = 0;
            self.ports[port] &= !mask;
        }

        if mode.is_digital_input() {
            self.subscribed[port] |= mask;
        } else {
            self.subscribed[port] &= !mask;
        }

        Ok((previous != Some(mode)).then_some(PinUpdate::Mode { pin, mode }))
    }

    /// Record a digital write; sibling bits of the port are untouched.
    /// Returns the new port value.
    pub fn set_digital(&mut self, pin: u8, state: PinState) -> Result<u8, CapabilityError> {
        let (port, mask) = port_for_pin(pin);
        let entry = self.entry_mut(pin)?;
        entry.value = state.value();
        entry.confirmed = false;

        let port = port as usize;
        self.ports[port] = apply_pin_state(self.ports[port], mask, state);
        Ok(self.ports[port])
    }

    /// Record an analog/PWM output value.
    pub fn set_value(&mut self, pin: u8, value: u16) -> Result<(), CapabilityError> {
        let entry = self.entry_mut(pin)?;
        entry.value = value;
        entry.confirmed = false;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Board reports
    // ------------------------------------------------------------------------

    /// Merge a digital port report.
    ///
    /// The report is authoritative for subscribed pins and for pins whose
    /// mode is still unknown. Every other bit keeps its cached level, so
    /// output pins driven HIGH are not cleared by a report that does not
    /// cover them. One update per pin whose level changed.
    pub fn apply_digital_report(&mut self, port: u8, reported: u16) -> Vec<PinUpdate> {
        let index = port as usize;
        if index >= MAX_PORTS {
            return Vec::new();
        }

        let first_pin = index * 8;
        let valid = match self.pins.len().saturating_sub(first_pin) {
            0 => return Vec::new(),
            n if n >= 8 => 0xFF,
            n => (1u8 << n) - 1,
        };

        let unknown = self.pins[first_pin..]
            .iter()
            .take(8)
            .enumerate()
            .filter(|(_, entry)| entry.mode.is_none())
            .fold(0u8, |bits, (bit, _)| bits | (1 << bit));
        let authoritative = self.subscribed[index] | unknown;
        let previous = self.ports[index];
        let merged = (((reported as u8) & authoritative) | (previous & !authoritative)) & valid;
        let changed = merged ^ previous;
        self.ports[index] = merged;

        let mut updates = Vec::new();
        for bit in 0..8u8 {
            let mask = 1u8 << bit;
            if valid & mask == 0 {
                break;
            }
            let pin = (first_pin as u8) + bit;
            let state = PinState::from(merged & mask != 0);
            let entry = &mut self.pins[pin as usize];
            if authoritative & mask != 0 {
                entry.value = state.value();
                entry.confirmed = true;
            }
            if changed & mask != 0 {
                updates.push(PinUpdate::Digital { pin, state });
            }
        }
        updates
    }

    /// Record an analog sample for `pin`.
    pub fn apply_analog(&mut self, pin: u8, value: u16) -> Result<PinUpdate, CapabilityError> {
        let entry = self.entry_mut(pin)?;
        entry.value = value;
        entry.confirmed = true;
        Ok(PinUpdate::Analog { pin, value })
    }

    /// Record a pin-state response; confirms both mode and value.
    pub fn apply_pin_state(
        &mut self,
        pin: u8,
        mode: Option<PinMode>,
        value: u32,
    ) -> Result<PinUpdate, CapabilityError> {
        let (port, mask) = port_for_pin(pin);
        let entry = self.entry_mut(pin)?;
        entry.mode = mode;
        entry.value = value.min(u16::MAX as u32) as u16;
        entry.confirmed = true;

        if matches!(
            mode,
            Some(PinMode::Input | PinMode::Pullup | PinMode::Output)
        ) {
            let state = PinState::from(value != 0);
            let port = port as usize;
            self.ports[port] = apply_pin_state(self.ports[port], mask, state);
        }

        Ok(PinUpdate::Reported { pin, mode, value })
    }
}
