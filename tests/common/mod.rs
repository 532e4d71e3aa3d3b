//! In-memory board for driving a `RemoteDevice` without hardware.
//!
//! The board decodes what the host flushes with the crate's own decoder,
//! answers capability queries and tracks pin modes and values, so tests can
//! assert on both the wire frames and the board-side effect.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use remote_wiring::protocol::{self, Decoder, Frame, SysexMessage};
use remote_wiring::{
    ByteStream, Capability, ConnectionConfig, HandshakeConfig, PinCapabilities,
    PinCapabilityTable, PinMode, PinState, RemoteDevice, Result, SerialConfig, TransportError,
    END_OF_STREAM,
};

#[derive(Debug, Clone, Default)]
pub struct BoardPin {
    pub capabilities: Vec<(PinMode, u8)>,
    pub mode: Option<PinMode>,
    pub value: u16,
}

#[derive(Default)]
struct BoardInner {
    pins: Vec<BoardPin>,
    answer_capabilities: bool,
    refuse_begin: bool,
    fail_reads: bool,
    open: bool,
    begun_with: Option<(u32, SerialConfig)>,
    pending: Vec<u8>,
    flushed: Vec<Vec<u8>>,
    inbound: VecDeque<u8>,
    reports: Vec<(u8, bool)>,
    decoder: Decoder,
}

/// Shared handle to the simulated board.
#[derive(Clone)]
pub struct MockBoard {
    inner: Arc<Mutex<BoardInner>>,
}

impl MockBoard {
    pub fn new(pins: Vec<Vec<(PinMode, u8)>>) -> Self {
        let pins = pins
            .into_iter()
            .map(|capabilities| BoardPin {
                capabilities,
                ..BoardPin::default()
            })
            .collect();
        Self {
            inner: Arc::new(Mutex::new(BoardInner {
                pins,
                answer_capabilities: true,
                ..BoardInner::default()
            })),
        }
    }

    /// Uno-like layout: 2-13 digital (3,5,6,9,10,11 PWM), 14-19 analog,
    /// 18/19 also I2C, 0/1 disabled (serial).
    pub fn uno() -> Self {
        let mut pins = vec![vec![]; 2];
        for pin in 2..14u8 {
            let mut caps = vec![
                (PinMode::Input, 1),
                (PinMode::Output, 1),
                (PinMode::Pullup, 1),
                (PinMode::Servo, 14),
            ];
            if matches!(pin, 3 | 5 | 6 | 9 | 10 | 11) {
                caps.push((PinMode::Pwm, 8));
            }
            pins.push(caps);
        }
        for pin in 14..20u8 {
            let mut caps = vec![
                (PinMode::Input, 1),
                (PinMode::Output, 1),
                (PinMode::Analog, 10),
                (PinMode::Pullup, 1),
            ];
            if pin >= 18 {
                caps.push((PinMode::I2c, 1));
            }
            pins.push(caps);
        }
        Self::new(pins)
    }

    pub fn stream(&self) -> MockStream {
        MockStream {
            inner: Arc::clone(&self.inner),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut BoardInner) -> R) -> R {
        f(&mut self.inner.lock().unwrap())
    }

    pub fn set_answer_capabilities(&self, answer: bool) {
        self.with(|b| b.answer_capabilities = answer);
    }

    pub fn set_refuse_begin(&self, refuse: bool) {
        self.with(|b| b.refuse_begin = refuse);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.with(|b| b.fail_reads = fail);
    }

    pub fn begun_with(&self) -> Option<(u32, SerialConfig)> {
        self.with(|b| b.begun_with)
    }

    pub fn pin_mode(&self, pin: u8) -> Option<PinMode> {
        self.with(|b| b.pins[pin as usize].mode)
    }

    pub fn pin_value(&self, pin: u8) -> u16 {
        self.with(|b| b.pins[pin as usize].value)
    }

    /// Every flushed write unit, oldest first.
    pub fn flushed(&self) -> Vec<Vec<u8>> {
        self.with(|b| b.flushed.clone())
    }

    pub fn clear_flushed(&self) {
        self.with(|b| b.flushed.clear());
    }

    /// Report toggles received, as `(command byte, enable)`.
    pub fn reports(&self) -> Vec<(u8, bool)> {
        self.with(|b| b.reports.clone())
    }

    /// Queue raw bytes for the host to read.
    pub fn send(&self, bytes: &[u8]) {
        self.with(|b| b.inbound.extend(bytes));
    }

    /// Send a capability response for the current pin table.
    pub fn send_capabilities(&self) {
        self.with(|b| {
            let frame = capability_frame(&b.pins);
            b.inbound.extend(frame);
        });
    }

    /// Set an input pin's level and send its port report.
    pub fn drive_input(&self, pin: u8, state: PinState) {
        self.with(|b| {
            b.pins[pin as usize].value = state.value();
            let port = pin / 8;
            let mut value = 0u16;
            for bit in 0..8u8 {
                let index = (port * 8 + bit) as usize;
                if let Some(p) = b.pins.get(index) {
                    if p.value != 0 {
                        value |= 1 << bit;
                    }
                }
            }
            b.inbound.extend(protocol::encode_digital_port(port, value));
        });
    }

    /// Send an analog sample on `channel`.
    pub fn send_analog(&self, channel: u8, value: u16) {
        let mut frame = vec![protocol::ANALOG_MESSAGE | channel];
        protocol::push_two_7bit(&mut frame, value);
        self.send(&frame);
    }
}

fn capability_frame(pins: &[BoardPin]) -> Vec<u8> {
    PinCapabilityTable::new(
        pins.iter()
            .map(|p| {
                PinCapabilities::new(
                    p.capabilities
                        .iter()
                        .map(|&(mode, res)| Capability::new(mode, res))
                        .collect(),
                )
            })
            .collect(),
    )
    .to_response_frame()
}

impl BoardInner {
    fn apply(&mut self, frame: Frame) {
        match frame {
            Frame::SetPinMode { pin, mode } => {
                if let Some(p) = self.pins.get_mut(pin as usize) {
                    p.mode = PinMode::from_code(mode);
                }
            }
            Frame::DigitalMessage { port, value } => {
                for bit in 0..8u8 {
                    let index = (port * 8 + bit) as usize;
                    if let Some(p) = self.pins.get_mut(index) {
                        if p.mode == Some(PinMode::Output) {
                            p.value = (value >> bit) & 1;
                        }
                    }
                }
            }
            Frame::AnalogMessage { channel, value } => {
                if let Some(p) = self.pins.get_mut(channel as usize) {
                    p.value = value;
                }
            }
            Frame::ReportDigital { port, enable } => {
                self.reports.push((protocol::REPORT_DIGITAL | port, enable))
            }
            Frame::ReportAnalog { channel, enable } => {
                self.reports.push((protocol::REPORT_ANALOG | channel, enable))
            }
            Frame::Sysex(SysexMessage::CapabilityQuery) => {
                if self.answer_capabilities {
                    let frame = capability_frame(&self.pins);
                    self.inbound.extend(frame);
                }
            }
            _ => {}
        }
    }
}

/// Host-side end of the mock board.
pub struct MockStream {
    inner: Arc<Mutex<BoardInner>>,
}

impl ByteStream for MockStream {
    fn begin(&mut self, baud: u32, config: SerialConfig) -> Result<()> {
        let mut board = self.inner.lock().unwrap();
        if board.refuse_begin {
            return Err(TransportError::ConnectionFailed("port busy".into()).into());
        }
        board.open = true;
        board.begun_with = Some((baud, config));
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        self.inner.lock().unwrap().open = false;
        Ok(())
    }

    fn connection_ready(&self) -> bool {
        self.inner.lock().unwrap().open
    }

    fn available(&mut self) -> Result<usize> {
        let board = self.inner.lock().unwrap();
        if board.fail_reads {
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "cable pulled").into());
        }
        Ok(board.inbound.len())
    }

    fn read(&mut self) -> Result<u16> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .inbound
            .pop_front()
            .map_or(END_OF_STREAM, u16::from))
    }

    fn write(&mut self, byte: u8) -> Result<usize> {
        self.inner.lock().unwrap().pending.push(byte);
        Ok(1)
    }

    fn flush(&mut self) -> Result<()> {
        let mut board = self.inner.lock().unwrap();
        let unit = std::mem::take(&mut board.pending);
        if unit.is_empty() {
            return Ok(());
        }
        let frames = board.decoder.decode(&unit);
        for frame in frames.into_iter().flatten() {
            board.apply(frame);
        }
        board.flushed.push(unit);
        Ok(())
    }
}

pub fn fast_handshake() -> HandshakeConfig {
    HandshakeConfig {
        max_attempts: 3,
        max_delay_loops: 3,
        initial_delay: Duration::from_millis(1),
    }
}

/// Connected and handshaken device on `board`.
pub fn ready_device(board: &MockBoard) -> RemoteDevice {
    let device = RemoteDevice::new(board.stream());
    device
        .connect(&ConnectionConfig::default())
        .expect("connect");
    device.handshake(&fast_handshake()).expect("handshake");
    board.clear_flushed();
    device
}
