//! Firmata remote-wiring driver with optional Python bindings.
//!
//! This crate talks to a microcontroller running a Firmata firmware (such as
//! StandardFirmata) over any byte stream. It discovers what every pin can do,
//! keeps a host-side mirror of pin modes and values, and turns pin operations
//! into protocol frames.
//!
//! # Layers
//!
//! 1. [`protocol`]: wire constants, frame encoders and the incremental decoder.
//! 2. [`capability`] and [`profile`]: the board's capability table and the pin
//!    categories derived from it.
//! 3. [`cache`]: cached modes and values, per-port digital state.
//! 4. [`device`]: [`RemoteDevice`] ties a [`ByteStream`] to all of the above.
//!
//! # Session
//!
//! 1. `connect()` opens the stream.
//! 2. `handshake()` queries capabilities until the board answers; the device is
//!    ready once the first capability response is decoded.
//! 3. Pin operations are validated against the [`HardwareProfile`] before any
//!    byte is written.
//! 4. Board input is applied by `process_input()`, either called directly or
//!    pumped by `start_listening()`.
//!
//! Reads (`digital_read`, `analog_read`) only look at the cache. Whether a
//! cached value came from the board is reported by `is_confirmed()`.

pub mod cache;
pub mod capability;
pub mod device;
pub mod errors;
pub mod i2c;
pub mod logging;
pub mod profile;
pub mod protocol;
pub mod stream;

pub use cache::{PinEntry, PinStateCache};
pub use capability::{Capability, PinCapabilities, PinCapabilityTable};
pub use device::{
    ConnectionConfig, DeviceEvent, FirmwareInfo, HandshakeConfig, ListenerId, RemoteDevice,
    DEFAULT_BAUD_RATE,
};
pub use errors::*;
pub use i2c::TwoWire;
pub use profile::HardwareProfile;
pub use protocol::{PinMode, PinState};
pub use stream::{ByteStream, NetworkStream, Parity, SerialConfig, SerialStream, END_OF_STREAM};

// ============================================================================
// Python Bindings
// ============================================================================

#[cfg(feature = "python")]
mod python {
    use std::str::FromStr;

    use pyo3::exceptions::{PyConnectionError, PyIOError, PyRuntimeError, PyTimeoutError, PyValueError};
    use pyo3::prelude::*;
    use pyo3::types::PyDict;

    use log::debug;

    use crate::{
        ConnectionConfig, DeviceEvent, DriverError, HandshakeConfig, HardwareProfile, ListenerId,
        NetworkStream, PinMode, PinState, RemoteDevice, SerialConfig, SerialStream,
        DEFAULT_BAUD_RATE,
    };

    fn to_py_err(e: DriverError) -> PyErr {
        let message = e.to_string();
        match e {
            DriverError::Capability(_) => PyErr::new::<PyValueError, _>(message),
            DriverError::Transport(_) => PyErr::new::<PyConnectionError, _>(message),
            DriverError::Timeout(_) => PyErr::new::<PyTimeoutError, _>(message),
            DriverError::NotReady(_) => PyErr::new::<PyRuntimeError, _>(message),
            DriverError::Io(_) | DriverError::Serial(_) | DriverError::Frame(_) => {
                PyErr::new::<PyIOError, _>(message)
            }
        }
    }

    fn parse_mode(mode: &str) -> PyResult<PinMode> {
        PinMode::from_str(mode).map_err(|e| PyErr::new::<PyValueError, _>(e.to_string()))
    }

    fn event_to_dict<'py>(py: Python<'py>, event: &DeviceEvent) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        match event {
            DeviceEvent::ConnectionEstablished => dict.set_item("kind", "connection_established")?,
            DeviceEvent::ConnectionFailed(message) => {
                dict.set_item("kind", "connection_failed")?;
                dict.set_item("message", message)?;
            }
            DeviceEvent::ConnectionLost(message) => {
                dict.set_item("kind", "connection_lost")?;
                dict.set_item("message", message)?;
            }
            DeviceEvent::Ready => dict.set_item("kind", "ready")?,
            DeviceEvent::DigitalPinChanged { pin, state } => {
                dict.set_item("kind", "digital")?;
                dict.set_item("pin", *pin)?;
                dict.set_item("value", state.is_high())?;
            }
            DeviceEvent::AnalogValueChanged {
                channel,
                pin,
                value,
            } => {
                dict.set_item("kind", "analog")?;
                dict.set_item("channel", *channel)?;
                dict.set_item("pin", *pin)?;
                dict.set_item("value", *value)?;
            }
            DeviceEvent::PinModeChanged { pin, mode } => {
                dict.set_item("kind", "mode")?;
                dict.set_item("pin", *pin)?;
                dict.set_item("mode", mode.to_string())?;
            }
            DeviceEvent::PinStateReported { pin, mode, value } => {
                dict.set_item("kind", "pin_state")?;
                dict.set_item("pin", *pin)?;
                dict.set_item("mode", mode.map(|m| m.to_string()))?;
                dict.set_item("value", *value)?;
            }
            DeviceEvent::FirmwareReported { major, minor, name } => {
                dict.set_item("kind", "firmware")?;
                dict.set_item("version", (*major, *minor))?;
                dict.set_item("name", name)?;
            }
            DeviceEvent::ProtocolVersion { major, minor } => {
                dict.set_item("kind", "protocol_version")?;
                dict.set_item("version", (*major, *minor))?;
            }
            DeviceEvent::StringReceived(text) => {
                dict.set_item("kind", "string")?;
                dict.set_item("text", text)?;
            }
            DeviceEvent::SysexReceived { command, payload } => {
                dict.set_item("kind", "sysex")?;
                dict.set_item("command", *command)?;
                dict.set_item("payload", payload.clone())?;
            }
            DeviceEvent::I2cReply {
                address,
                register,
                data,
            } => {
                dict.set_item("kind", "i2c_reply")?;
                dict.set_item("address", *address)?;
                dict.set_item("register", *register)?;
                dict.set_item("data", data.clone())?;
            }
        }
        Ok(dict)
    }

    /// Pin categories of a connected board.
    ///
    /// Attributes:
    ///     total_pin_count: Number of pins reported by the board.
    ///     analog_offset: Lowest analog-capable pin, or None.
    ///     analog_pins, digital_pins, pwm_pins, servo_pins, i2c_pins, disabled_pins:
    ///         Ascending pin indices per category.
    #[pyclass(name = "HardwareProfile", frozen)]
    #[derive(Clone)]
    struct PyHardwareProfile {
        inner: HardwareProfile,
    }

    #[pymethods]
    impl PyHardwareProfile {
        #[getter]
        fn total_pin_count(&self) -> usize {
            self.inner.total_pin_count()
        }

        #[getter]
        fn analog_pin_count(&self) -> usize {
            self.inner.analog_pin_count()
        }

        #[getter]
        fn analog_offset(&self) -> Option<u8> {
            self.inner.analog_offset()
        }

        #[getter]
        fn analog_pins(&self) -> Vec<u8> {
            self.inner.analog_pins().to_vec()
        }

        #[getter]
        fn digital_pins(&self) -> Vec<u8> {
            self.inner.digital_pins()
        }

        #[getter]
        fn pwm_pins(&self) -> Vec<u8> {
            self.inner.pwm_pins().to_vec()
        }

        #[getter]
        fn servo_pins(&self) -> Vec<u8> {
            self.inner.servo_pins().to_vec()
        }

        #[getter]
        fn i2c_pins(&self) -> Vec<u8> {
            self.inner.i2c_pins().to_vec()
        }

        #[getter]
        fn disabled_pins(&self) -> Vec<u8> {
            self.inner.disabled_pins().to_vec()
        }

        /// Whether `pin` declares `mode` (e.g. "pwm").
        fn supports(&self, pin: u8, mode: &str) -> PyResult<bool> {
            self.inner
                .supports(pin, parse_mode(mode)?)
                .map_err(|e| to_py_err(e.into()))
        }

        fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
            let dict = PyDict::new(py);
            dict.set_item("total_pin_count", self.inner.total_pin_count())?;
            dict.set_item("analog_offset", self.inner.analog_offset())?;
            dict.set_item("analog_pins", self.inner.analog_pins().to_vec())?;
            dict.set_item("digital_pins", self.inner.digital_pins())?;
            dict.set_item("pwm_pins", self.inner.pwm_pins().to_vec())?;
            dict.set_item("servo_pins", self.inner.servo_pins().to_vec())?;
            dict.set_item("i2c_pins", self.inner.i2c_pins().to_vec())?;
            dict.set_item("disabled_pins", self.inner.disabled_pins().to_vec())?;
            Ok(dict)
        }

        fn __repr__(&self) -> String {
            format!(
                "HardwareProfile(pins={}, analog={}, analog_offset={:?})",
                self.inner.total_pin_count(),
                self.inner.analog_pin_count(),
                self.inner.analog_offset()
            )
        }
    }

    /// Firmata board connection.
    ///
    /// Example:
    ///     >>> board = RemoteDevice("/dev/ttyACM0")
    ///     >>> board.pin_mode(13, "output")
    ///     >>> board.digital_write(13, True)
    #[pyclass(name = "RemoteDevice", unsendable)]
    struct PyRemoteDevice {
        inner: RemoteDevice,
        listeners: Vec<ListenerId>,
    }

    impl PyRemoteDevice {
        fn open(py: Python<'_>, device: RemoteDevice, config: &ConnectionConfig) -> PyResult<Self> {
            py.detach(|| {
                device.connect(config)?;
                device.handshake(&HandshakeConfig::default())?;
                device.start_listening()
            })
            .map_err(to_py_err)?;
            Ok(Self {
                inner: device,
                listeners: Vec::new(),
            })
        }
    }

    impl Drop for PyRemoteDevice {
        // The input thread may be waiting for the GIL inside a callback.
        fn drop(&mut self) {
            let inner = &self.inner;
            if let Err(e) = Python::attach(|py| py.detach(|| inner.finish())) {
                debug!("Error closing device on drop: {}", e);
            }
        }
    }

    #[pymethods]
    impl PyRemoteDevice {
        /// Open a serial port, wait for the capability response and start
        /// listening for input.
        ///
        /// Raises:
        ///     ConnectionError: If the port cannot be opened.
        ///     TimeoutError: If the board never answers the capability query.
        #[new]
        #[pyo3(signature = (path, baud_rate=DEFAULT_BAUD_RATE, serial_config="8N1"))]
        fn new(py: Python<'_>, path: &str, baud_rate: u32, serial_config: &str) -> PyResult<Self> {
            let serial_config = SerialConfig::from_str(serial_config)
                .map_err(|e| PyErr::new::<PyValueError, _>(e.to_string()))?;
            let config = ConnectionConfig {
                baud_rate,
                serial_config,
                ..ConnectionConfig::default()
            };
            let stream = SerialStream::new(path, config.timeout);
            Self::open(py, RemoteDevice::new(stream), &config)
        }

        /// Connect to a board behind a TCP bridge (`host:port`).
        #[staticmethod]
        fn connect_tcp(py: Python<'_>, address: &str) -> PyResult<Self> {
            let config = ConnectionConfig::default();
            let stream = NetworkStream::new(address, config.timeout);
            Self::open(py, RemoteDevice::new(stream), &config)
        }

        #[getter]
        fn is_ready(&self) -> bool {
            self.inner.is_ready()
        }

        #[getter]
        fn hardware_profile(&self) -> Option<PyHardwareProfile> {
            self.inner
                .hardware_profile()
                .map(|inner| PyHardwareProfile { inner })
        }

        #[getter]
        fn frame_errors(&self) -> u64 {
            self.inner.frame_errors()
        }

        /// Set a pin mode by name ("input", "output", "analog", "pwm", ...).
        fn pin_mode(&self, pin: u8, mode: &str) -> PyResult<()> {
            self.inner
                .pin_mode(pin, parse_mode(mode)?)
                .map_err(to_py_err)
        }

        fn get_pin_mode(&self, pin: u8) -> PyResult<Option<String>> {
            self.inner
                .get_pin_mode(pin)
                .map(|mode| mode.map(|m| m.to_string()))
                .map_err(to_py_err)
        }

        fn digital_write(&self, pin: u8, value: bool) -> PyResult<()> {
            self.inner
                .digital_write(pin, PinState::from(value))
                .map_err(to_py_err)
        }

        fn digital_read(&self, pin: u8) -> PyResult<bool> {
            self.inner
                .digital_read(pin)
                .map(PinState::is_high)
                .map_err(to_py_err)
        }

        fn analog_write(&self, pin: u8, value: u16) -> PyResult<()> {
            self.inner.analog_write(pin, value).map_err(to_py_err)
        }

        fn analog_read(&self, pin: u8) -> PyResult<u16> {
            self.inner.analog_read(pin).map_err(to_py_err)
        }

        fn is_confirmed(&self, pin: u8) -> PyResult<bool> {
            self.inner.is_confirmed(pin).map_err(to_py_err)
        }

        fn query_firmware(&self) -> PyResult<()> {
            self.inner.query_firmware().map_err(to_py_err)
        }

        fn send_string(&self, text: &str) -> PyResult<()> {
            self.inner.send_string(text).map_err(to_py_err)
        }

        /// Call `callback(event: dict)` for every device event. The callback
        /// runs on the input thread; exceptions it raises are printed.
        ///
        /// Returns:
        ///     int: Handle for `remove_listener`.
        fn on_event(&mut self, callback: Py<PyAny>) -> usize {
            let id = self.inner.subscribe(move |event| {
                Python::attach(|py| {
                    let result = event_to_dict(py, event)
                        .and_then(|dict| callback.call1(py, (dict,)).map(|_| ()));
                    if let Err(e) = result {
                        e.print(py);
                    }
                });
            });
            self.listeners.push(id);
            self.listeners.len() - 1
        }

        /// Stop calling a callback registered with `on_event`.
        fn remove_listener(&mut self, handle: usize) -> bool {
            match self.listeners.get(handle) {
                Some(&id) => self.inner.unsubscribe(id),
                None => false,
            }
        }

        fn finish(&self, py: Python<'_>) -> PyResult<()> {
            py.detach(|| self.inner.finish()).map_err(to_py_err)
        }

        fn __repr__(&self) -> String {
            match self.inner.hardware_profile() {
                Some(profile) => format!("RemoteDevice(pins={})", profile.total_pin_count()),
                None => "RemoteDevice(not ready)".to_string(),
            }
        }
    }

    /// Route Rust logs into Python's `logging` at the given level
    /// (defaults to `REMOTE_WIRING_LOG`/`RUST_LOG`).
    #[pyfunction]
    #[pyo3(signature = (level=None))]
    fn init_logging(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        crate::logging::init_python_logging(py)?;
        crate::logging::set_python_log_level_str(py, level)
    }

    #[pyfunction]
    fn reset_logging_cache() {
        crate::logging::reset_python_logging_cache();
    }

    /// The Python module definition
    #[pymodule]
    fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
        m.add_class::<PyRemoteDevice>()?;
        m.add_class::<PyHardwareProfile>()?;
        m.add_function(wrap_pyfunction!(init_logging, m)?)?;
        m.add_function(wrap_pyfunction!(reset_logging_cache, m)?)?;

        m.add("DEFAULT_BAUD_RATE", DEFAULT_BAUD_RATE)?;
        m.add(
            "PIN_MODES",
            vec![
                "input", "output", "analog", "pwm", "servo", "shift", "i2c", "onewire",
                "stepper", "encoder", "serial", "pullup",
            ],
        )?;

        Ok(())
    }
}
