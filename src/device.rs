//! Remote device driver.
//!
//! [`RemoteDevice`] owns a [`ByteStream`], decodes what the board sends,
//! keeps the [`PinStateCache`] and [`HardwareProfile`] up to date, and turns
//! pin operations into validated protocol frames.
//!
//! # Locking
//!
//! - decode mutex: held for one whole [`RemoteDevice::process_input`] pass;
//!   this is the single context in which board input is applied.
//! - stream mutex: held around compose + write + flush of one outbound unit,
//!   and briefly while draining available input.
//! - state mutex: profile, cache and firmware info.
//!
//! Writers take state then stream; the decode path never holds the stream
//! while waiting for state. Listeners run after the state lock is released
//! but inside the decode context, so a listener must not call
//! `process_input` itself.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::cache::{PinStateCache, PinUpdate};
use crate::errors::{CapabilityError, DriverError, Result, TransportError};
use crate::i2c::TwoWire;
use crate::profile::HardwareProfile;
use crate::protocol::{self, Frame, PinMode, PinState, SysexMessage};
use crate::stream::{ByteStream, SerialConfig, END_OF_STREAM};

// ============================================================================
// Configuration
// ============================================================================

pub const DEFAULT_BAUD_RATE: u32 = 57_600;

/// Parameters for opening the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub baud_rate: u32,
    pub serial_config: SerialConfig,
    /// Read timeout handed to stream constructors.
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            serial_config: SerialConfig::default(),
            timeout: Duration::from_secs(1),
        }
    }
}

/// Capability-query retry schedule used by [`RemoteDevice::handshake`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    pub max_attempts: u32,
    pub max_delay_loops: u32,
    /// First wait after each query; doubled on every loop.
    pub initial_delay: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            max_delay_loops: 5,
            initial_delay: Duration::from_millis(10),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Notifications raised by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DeviceEvent {
    ConnectionEstablished,
    ConnectionFailed(String),
    ConnectionLost(String),
    /// First capability response of a connection was decoded.
    Ready,
    DigitalPinChanged {
        pin: u8,
        state: PinState,
    },
    /// `channel` is `None` for extended-analog reports on pins without an
    /// analog channel.
    AnalogValueChanged {
        channel: Option<u8>,
        pin: u8,
        value: u16,
    },
    PinModeChanged {
        pin: u8,
        mode: PinMode,
    },
    PinStateReported {
        pin: u8,
        mode: Option<PinMode>,
        value: u32,
    },
    FirmwareReported {
        major: u8,
        minor: u8,
        name: String,
    },
    ProtocolVersion {
        major: u8,
        minor: u8,
    },
    StringReceived(String),
    SysexReceived {
        command: u8,
        payload: Vec<u8>,
    },
    I2cReply {
        address: u16,
        register: u16,
        data: Vec<u8>,
    },
}

/// Firmware name and version as reported by the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    pub major: u8,
    pub minor: u8,
    pub name: String,
}

/// Handle returned by [`RemoteDevice::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone)]
enum Listener {
    Callback(Arc<dyn Fn(&DeviceEvent) + Send + Sync>),
    /// Dropped once the receiving end is gone.
    Channel(Sender<DeviceEvent>),
}

// ============================================================================
// Device
// ============================================================================

#[derive(Default)]
struct DeviceState {
    profile: Option<HardwareProfile>,
    cache: PinStateCache,
    firmware: Option<FirmwareInfo>,
}

impl DeviceState {
    fn profile(&self) -> Result<&HardwareProfile> {
        self.profile
            .as_ref()
            .ok_or_else(|| DriverError::NotReady("capabilities not received yet".into()))
    }
}

struct Shared {
    stream: Mutex<Box<dyn ByteStream>>,
    decoder: Mutex<protocol::Decoder>,
    state: Mutex<DeviceState>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
    ready: AtomicBool,
    frame_errors: AtomicU64,
}

struct ListenerThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Host-side handle to a board speaking the Firmata protocol.
///
/// All methods take `&self`; the device can be shared between threads behind
/// an `Arc`.
pub struct RemoteDevice {
    shared: Arc<Shared>,
    listener: Mutex<Option<ListenerThread>>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RemoteDevice {
    pub fn new<S: ByteStream + 'static>(stream: S) -> Self {
        Self {
            shared: Arc::new(Shared {
                stream: Mutex::new(Box::new(stream)),
                decoder: Mutex::new(protocol::Decoder::new()),
                state: Mutex::new(DeviceState::default()),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                ready: AtomicBool::new(false),
                frame_errors: AtomicU64::new(0),
            }),
            listener: Mutex::new(None),
        }
    }

    // ------------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------------

    /// Open the stream and start a fresh session.
    ///
    /// Raises `ConnectionEstablished` on success, `ConnectionFailed` otherwise.
    pub fn connect(&self, config: &ConnectionConfig) -> Result<()> {
        let opened = {
            let mut stream = lock(&self.shared.stream);
            match stream.begin(config.baud_rate, config.serial_config) {
                Ok(()) if stream.connection_ready() => Ok(()),
                Ok(()) => Err("stream did not become ready".to_string()),
                Err(e) => Err(e.to_string()),
            }
        };

        if let Err(message) = opened {
            warn!("Connection failed: {}", message);
            self.shared.emit(&DeviceEvent::ConnectionFailed(message.clone()));
            return Err(TransportError::ConnectionFailed(message).into());
        }

        self.shared.reset_session();
        info!(
            "Connection established ({} baud, {})",
            config.baud_rate, config.serial_config
        );
        self.shared.emit(&DeviceEvent::ConnectionEstablished);
        Ok(())
    }

    /// Query capabilities until the board answers.
    ///
    /// Each attempt sends one capability query, then waits up to
    /// `max_delay_loops` times with a doubling delay, pumping input between
    /// waits. Returns the installed profile.
    pub fn handshake(&self, config: &HandshakeConfig) -> Result<HardwareProfile> {
        for attempt in 1..=config.max_attempts {
            debug!("Capability query, attempt {}/{}", attempt, config.max_attempts);
            self.request_capabilities()?;

            let mut delay = config.initial_delay;
            for _ in 0..config.max_delay_loops {
                thread::sleep(delay);
                self.process_input()?;
                if let Some(profile) = self.ready_profile() {
                    return Ok(profile);
                }
                delay = delay.saturating_mul(2);
            }
        }

        let message = format!(
            "no capability response after {} attempts; is StandardFirmata running on the board?",
            config.max_attempts
        );
        warn!("{}", message);
        self.shared.emit(&DeviceEvent::ConnectionFailed(message.clone()));
        Err(DriverError::Timeout(message))
    }

    fn ready_profile(&self) -> Option<HardwareProfile> {
        if !self.is_ready() {
            return None;
        }
        lock(&self.shared.state).profile.clone()
    }

    /// Stop the listener thread and close the stream.
    pub fn finish(&self) -> Result<()> {
        self.stop_listening();
        self.shared.ready.store(false, Ordering::SeqCst);
        let mut stream = lock(&self.shared.stream);
        stream.end()?;
        info!("Connection closed");
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared.stream).connection_ready()
    }

    /// Snapshot of the current profile, `None` before the first capability
    /// response.
    pub fn hardware_profile(&self) -> Option<HardwareProfile> {
        lock(&self.shared.state).profile.clone()
    }

    pub fn firmware(&self) -> Option<FirmwareInfo> {
        lock(&self.shared.state).firmware.clone()
    }

    /// Number of frame errors seen since the device was created.
    pub fn frame_errors(&self) -> u64 {
        self.shared.frame_errors.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Register a listener, called synchronously in decode order.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        self.shared.add_listener(Listener::Callback(Arc::new(listener)))
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.shared.listeners);
        let before = listeners.len();
        listeners.retain(|(key, _)| *key != id.0);
        listeners.len() != before
    }

    /// Channel receiving a copy of every event from now on. The
    /// registration ends with the first event sent after the receiver is
    /// dropped.
    pub fn events(&self) -> Receiver<DeviceEvent> {
        let (tx, rx) = mpsc::channel();
        self.shared.add_listener(Listener::Channel(tx));
        rx
    }

    /// Number of registered listeners and event channels.
    pub fn listener_count(&self) -> usize {
        lock(&self.shared.listeners).len()
    }

    // ------------------------------------------------------------------------
    // Input
    // ------------------------------------------------------------------------

    /// Decode whatever the stream currently holds. Returns the number of
    /// bytes consumed.
    pub fn process_input(&self) -> Result<usize> {
        self.shared.process_input()
    }

    /// Pump input on a background thread until [`finish`](Self::finish) or a
    /// transport error.
    pub fn start_listening(&self) -> Result<()> {
        let mut slot = lock(&self.listener);
        if slot.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let shared = Arc::clone(&self.shared);
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("remote-wiring-input".into())
            .spawn(move || {
                debug!("Input thread started");
                while !flag.load(Ordering::SeqCst) {
                    match shared.process_input() {
                        Ok(0) => thread::sleep(Duration::from_millis(1)),
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Input thread stopping: {}", e);
                            break;
                        }
                    }
                }
                debug!("Input thread stopped");
            })?;

        *slot = Some(ListenerThread { stop, handle });
        Ok(())
    }

    fn stop_listening(&self) {
        if let Some(thread) = lock(&self.listener).take() {
            thread.stop.store(true, Ordering::SeqCst);
            if thread.handle.join().is_err() {
                warn!("Input thread panicked");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Pin operations
    // ------------------------------------------------------------------------

    /// Set a pin's mode after checking the board declares it.
    ///
    /// Input and pullup modes turn on port reporting, `Analog` turns on
    /// reporting for the pin's analog channel.
    pub fn pin_mode(&self, pin: u8, mode: PinMode) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = lock(&self.shared.state);
            let profile = state.profile()?;
            if !profile.supports(pin, mode)? {
                return Err(CapabilityError::ModeNotSupported { pin, mode }.into());
            }
            let frame = mode_change_frame(&state, pin, mode)?;
            self.shared.write_frame(&frame)?;
            if let Some(update) = state.cache.set_mode(pin, mode)? {
                events.push(self.shared.to_event(&state, update));
            }
        }
        self.shared.emit_all(&events);
        Ok(())
    }

    pub fn get_pin_mode(&self, pin: u8) -> Result<Option<PinMode>> {
        let state = lock(&self.shared.state);
        state.profile()?;
        Ok(state.cache.mode(pin)?)
    }

    /// Drive a digital output, switching the pin to `Output` first if needed.
    pub fn digital_write(&self, pin: u8, value: PinState) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = lock(&self.shared.state);
            if !state.profile()?.is_digital_output_supported(pin)? {
                return Err(CapabilityError::ModeNotSupported {
                    pin,
                    mode: PinMode::Output,
                }
                .into());
            }

            let switch_mode = state.cache.mode(pin)? != Some(PinMode::Output);
            let mut frame = if switch_mode {
                mode_change_frame(&state, pin, PinMode::Output)?
            } else {
                Vec::new()
            };
            let (port, _) = protocol::port_for_pin(pin);
            frame.extend(protocol::encode_digital_write(
                pin,
                value,
                state.cache.output_port_value(port),
            ));
            self.shared.write_frame(&frame)?;

            if switch_mode {
                if let Some(update) = state.cache.set_mode(pin, PinMode::Output)? {
                    events.push(self.shared.to_event(&state, update));
                }
            }
            state.cache.set_digital(pin, value)?;
        }
        self.shared.emit_all(&events);
        Ok(())
    }

    /// Cached digital level; never touches the board.
    pub fn digital_read(&self, pin: u8) -> Result<PinState> {
        let state = lock(&self.shared.state);
        state.profile()?.check_pin(pin)?;
        Ok(state.cache.digital_state(pin)?)
    }

    /// PWM output, switching the pin to `Pwm` first if needed.
    pub fn analog_write(&self, pin: u8, value: u16) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = lock(&self.shared.state);
            if !state.profile()?.is_pwm_supported(pin)? {
                return Err(CapabilityError::ModeNotSupported {
                    pin,
                    mode: PinMode::Pwm,
                }
                .into());
            }

            let switch_mode = state.cache.mode(pin)? != Some(PinMode::Pwm);
            let mut frame = if switch_mode {
                mode_change_frame(&state, pin, PinMode::Pwm)?
            } else {
                Vec::new()
            };
            frame.extend(protocol::encode_analog_write(pin, value));
            self.shared.write_frame(&frame)?;

            if switch_mode {
                if let Some(update) = state.cache.set_mode(pin, PinMode::Pwm)? {
                    events.push(self.shared.to_event(&state, update));
                }
            }
            state.cache.set_value(pin, value)?;
        }
        self.shared.emit_all(&events);
        Ok(())
    }

    /// Last analog sample for an ANALOG-capable pin (0 until one arrives).
    pub fn analog_read(&self, pin: u8) -> Result<u16> {
        let state = lock(&self.shared.state);
        if !state.profile()?.is_analog_supported(pin)? {
            return Err(CapabilityError::ModeNotSupported {
                pin,
                mode: PinMode::Analog,
            }
            .into());
        }
        Ok(state.cache.value(pin)?)
    }

    /// Whether the cached value of `pin` was confirmed by the board.
    pub fn is_confirmed(&self, pin: u8) -> Result<bool> {
        let state = lock(&self.shared.state);
        state.profile()?.check_pin(pin)?;
        Ok(state.cache.is_confirmed(pin)?)
    }

    /// Toggle reporting for an analog channel.
    pub fn report_analog(&self, channel: u8, enable: bool) -> Result<()> {
        let state = lock(&self.shared.state);
        let count = state.profile()?.analog_pin_count();
        if (channel as usize) >= count || channel > 0x0F {
            return Err(CapabilityError::InvalidArgument(format!(
                "analog channel {channel} not available (board has {count})"
            ))
            .into());
        }
        self.shared
            .write_frame(&protocol::encode_report_analog(channel, enable))
    }

    /// Ask the board for the mode and value of `pin`; the answer arrives as a
    /// `PinStateReported` event.
    pub fn query_pin_state(&self, pin: u8) -> Result<()> {
        let state = lock(&self.shared.state);
        state.profile()?.check_pin(pin)?;
        self.shared
            .write_frame(&protocol::encode_pin_state_query(pin))
    }

    // ------------------------------------------------------------------------
    // Raw commands
    // ------------------------------------------------------------------------

    pub fn request_capabilities(&self) -> Result<()> {
        self.shared
            .write_frame(&protocol::encode_capability_query())
    }

    pub fn query_firmware(&self) -> Result<()> {
        self.shared.write_frame(&protocol::encode_firmware_query())
    }

    pub fn query_protocol_version(&self) -> Result<()> {
        self.shared
            .write_frame(&protocol::encode_protocol_version_query())
    }

    /// Send an arbitrary SysEx command; payload bytes are masked to 7 bits.
    pub fn send_sysex(&self, command: u8, payload: &[u8]) -> Result<()> {
        if command > 0x7F {
            return Err(CapabilityError::InvalidArgument(format!(
                "sysex command {command:#04X} is not a 7-bit value"
            ))
            .into());
        }
        self.shared
            .write_frame(&protocol::encode_sysex(command, payload))
    }

    pub fn send_string(&self, text: &str) -> Result<()> {
        self.shared.write_frame(&protocol::encode_string(text))
    }

    /// Reset the board. Cached pin state goes back to defaults.
    pub fn system_reset(&self) -> Result<()> {
        let mut state = lock(&self.shared.state);
        self.shared.write_frame(&protocol::encode_system_reset())?;
        let pins = state.cache.pin_count();
        state.cache = PinStateCache::new(pins);
        Ok(())
    }

    /// I2C helper bound to this device.
    pub fn i2c(&self) -> TwoWire<'_> {
        TwoWire::new(self)
    }

    pub(crate) fn write_frame(&self, frame: &[u8]) -> Result<()> {
        self.shared.write_frame(frame)
    }
}

impl Drop for RemoteDevice {
    fn drop(&mut self) {
        self.stop_listening();
        let mut stream = lock(&self.shared.stream);
        if stream.connection_ready() {
            if let Err(e) = stream.end() {
                debug!("Error closing stream on drop: {}", e);
            }
        }
    }
}

/// Frames that move `pin` to `mode`: the mode set, plus any reporting
/// toggles the switch implies. Nothing is recorded.
fn mode_change_frame(state: &DeviceState, pin: u8, mode: PinMode) -> Result<Vec<u8>> {
    let profile = state.profile()?;
    let mut frame = protocol::encode_set_pin_mode(pin, mode).to_vec();

    if let Some((port, enable)) = state.cache.subscription_change(pin, mode)? {
        frame.extend(protocol::encode_report_digital(port, enable));
    }

    let previous = state.cache.mode(pin)?;
    if let Some(channel) = profile.analog_channel(pin).filter(|&c| c <= 0x0F) {
        if mode == PinMode::Analog && previous != Some(PinMode::Analog) {
            frame.extend(protocol::encode_report_analog(channel, true));
        } else if mode != PinMode::Analog && previous == Some(PinMode::Analog) {
            frame.extend(protocol::encode_report_analog(channel, false));
        }
    }
    Ok(frame)
}

impl Shared {
    fn reset_session(&self) {
        self.ready.store(false, Ordering::SeqCst);
        lock(&self.decoder).reset();
        *lock(&self.state) = DeviceState::default();
    }

    fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let mut stream = lock(&self.stream);
        if !stream.connection_ready() {
            return Err(TransportError::NotConnected("stream is not open".into()).into());
        }
        stream.write_all(frame)?;
        stream.flush()?;
        debug!("Sent {:02X?}", frame);
        Ok(())
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        let key = self.next_listener.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).push((key, listener));
        ListenerId(key)
    }

    fn emit(&self, event: &DeviceEvent) {
        self.emit_all(std::slice::from_ref(event));
    }

    fn emit_all(&self, events: &[DeviceEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners = lock(&self.listeners).clone();
        let mut closed = Vec::new();
        for event in events {
            for (key, listener) in &listeners {
                match listener {
                    Listener::Callback(callback) => callback(event),
                    Listener::Channel(tx) => {
                        if !closed.contains(key) && tx.send(event.clone()).is_err() {
                            closed.push(*key);
                        }
                    }
                }
            }
        }
        if !closed.is_empty() {
            debug!("Dropping {} closed event channel(s)", closed.len());
            lock(&self.listeners).retain(|(key, _)| !closed.contains(key));
        }
    }

    fn connection_lost(&self, error: DriverError) -> DriverError {
        let message = error.to_string();
        warn!("Connection lost: {}", message);
        self.ready.store(false, Ordering::SeqCst);
        self.emit(&DeviceEvent::ConnectionLost(message.clone()));
        TransportError::ConnectionLost(message).into()
    }

    /// Pull currently available bytes off the stream without waiting.
    fn drain_stream(&self) -> Result<Vec<u8>> {
        let mut stream = lock(&self.stream);
        if !stream.connection_ready() {
            return Err(TransportError::NotConnected("stream is not open".into()).into());
        }
        let available = stream.available()?;
        let mut bytes = Vec::with_capacity(available);
        for _ in 0..available {
            match stream.read()? {
                END_OF_STREAM => break,
                byte => bytes.push(byte as u8),
            }
        }
        Ok(bytes)
    }

    fn process_input(&self) -> Result<usize> {
        let mut decoder = lock(&self.decoder);

        let bytes = match self.drain_stream() {
            Ok(bytes) => bytes,
            Err(e @ DriverError::Transport(TransportError::NotConnected(_))) => return Err(e),
            Err(e) => return Err(self.connection_lost(e)),
        };
        if bytes.is_empty() {
            return Ok(0);
        }

        let mut frames = Vec::new();
        for &byte in &bytes {
            decoder.push(byte, &mut frames);
        }

        let mut events = Vec::new();
        {
            let mut state = lock(&self.state);
            for frame in frames {
                match frame {
                    Ok(frame) => self.apply_frame(&mut state, frame, &mut events),
                    Err(e) => {
                        self.frame_errors.fetch_add(1, Ordering::Relaxed);
                        warn!("Dropped frame: {}", e);
                    }
                }
            }
        }
        self.emit_all(&events);
        Ok(bytes.len())
    }

    fn to_event(&self, state: &DeviceState, update: PinUpdate) -> DeviceEvent {
        match update {
            PinUpdate::Digital { pin, state: level } => DeviceEvent::DigitalPinChanged {
                pin,
                state: level,
            },
            PinUpdate::Analog { pin, value } => DeviceEvent::AnalogValueChanged {
                channel: state.profile.as_ref().and_then(|p| p.analog_channel(pin)),
                pin,
                value,
            },
            PinUpdate::Mode { pin, mode } => DeviceEvent::PinModeChanged { pin, mode },
            PinUpdate::Reported { pin, mode, value } => {
                DeviceEvent::PinStateReported { pin, mode, value }
            }
        }
    }

    fn apply_frame(&self, state: &mut DeviceState, frame: Frame, events: &mut Vec<DeviceEvent>) {
        match frame {
            Frame::DigitalMessage { port, value } => {
                if state.profile.is_none() {
                    debug!("Digital report for port {} before capabilities", port);
                    return;
                }
                for update in state.cache.apply_digital_report(port, value) {
                    events.push(self.to_event(state, update));
                }
            }
            Frame::AnalogMessage { channel, value } => {
                let Some(pin) = state.profile.as_ref().and_then(|p| p.analog_pin(channel)) else {
                    debug!("Analog report for unmapped channel {}", channel);
                    return;
                };
                if let Ok(update) = state.cache.apply_analog(pin, value) {
                    events.push(self.to_event(state, update));
                }
            }
            Frame::Sysex(SysexMessage::CapabilityResponse(table)) => {
                let profile = HardwareProfile::from_table(table);
                info!(
                    "Board reports {} pins ({} analog)",
                    profile.total_pin_count(),
                    profile.analog_pin_count()
                );
                // Modes and subscriptions survive a re-query; the board keeps them.
                state.cache.resize(profile.total_pin_count());
                state.profile = Some(profile);
                if !self.ready.swap(true, Ordering::SeqCst) {
                    events.push(DeviceEvent::Ready);
                }
            }
            Frame::Sysex(SysexMessage::PinStateResponse { pin, mode, value }) => {
                match state
                    .cache
                    .apply_pin_state(pin, PinMode::from_code(mode), value)
                {
                    Ok(update) => events.push(self.to_event(state, update)),
                    Err(e) => debug!("Ignoring pin state response: {}", e),
                }
            }
            Frame::Sysex(SysexMessage::ExtendedAnalog { pin, value }) => {
                let value = value.min(u16::MAX as u32) as u16;
                match state.cache.apply_analog(pin, value) {
                    Ok(update) => events.push(self.to_event(state, update)),
                    Err(e) => debug!("Ignoring extended analog report: {}", e),
                }
            }
            Frame::Sysex(SysexMessage::ReportFirmware { major, minor, name }) => {
                info!("Firmware {} {}.{}", name, major, minor);
                state.firmware = Some(FirmwareInfo {
                    major,
                    minor,
                    name: name.clone(),
                });
                events.push(DeviceEvent::FirmwareReported { major, minor, name });
            }
            Frame::Sysex(SysexMessage::StringData(text)) => {
                debug!("Board says: {}", text);
                events.push(DeviceEvent::StringReceived(text));
            }
            Frame::Sysex(SysexMessage::I2cReply {
                address,
                register,
                data,
            }) => events.push(DeviceEvent::I2cReply {
                address,
                register,
                data,
            }),
            Frame::Sysex(SysexMessage::Other { command, payload }) => {
                events.push(DeviceEvent::SysexReceived { command, payload })
            }
            Frame::ProtocolVersion { major, minor } => {
                events.push(DeviceEvent::ProtocolVersion { major, minor })
            }
            other => debug!("Ignoring {:?}", other),
        }
    }
}
