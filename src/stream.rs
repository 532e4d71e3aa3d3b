//! Byte-stream transports.
//!
//! The device only ever talks to a [`ByteStream`]. Two implementations ship
//! with the crate: [`SerialStream`] over a local serial port and
//! [`NetworkStream`] over TCP (for boards behind a serial-to-network bridge).

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::str::FromStr;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serialport::SerialPort;

use crate::errors::{CapabilityError, Result, TransportError};

/// Returned by [`ByteStream::read`] when no byte is available.
pub const END_OF_STREAM: u16 = 0xFFFF;

const READ_CHUNK: usize = 256;

// ============================================================================
// Serial line configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Data bits, parity and stop bits, written as e.g. `8N1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }
}

impl SerialConfig {
    fn to_serialport(
        self,
    ) -> Result<(serialport::DataBits, serialport::Parity, serialport::StopBits)> {
        let data_bits = match self.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            8 => serialport::DataBits::Eight,
            other => {
                return Err(CapabilityError::InvalidArgument(format!(
                    "unsupported data bits: {other}"
                ))
                .into())
            }
        };
        let parity = match self.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        };
        let stop_bits = match self.stop_bits {
            1 => serialport::StopBits::One,
            2 => serialport::StopBits::Two,
            other => {
                return Err(CapabilityError::InvalidArgument(format!(
                    "unsupported stop bits: {other}"
                ))
                .into())
            }
        };
        Ok((data_bits, parity, stop_bits))
    }
}

impl fmt::Display for SerialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        };
        write!(f, "{}{}{}", self.data_bits, parity, self.stop_bits)
    }
}

impl FromStr for SerialConfig {
    type Err = CapabilityError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || CapabilityError::InvalidArgument(format!("invalid serial config '{s}'"));
        let chars: Vec<char> = s.trim().chars().collect();
        let [data, parity, stop] = chars.as_slice() else {
            return Err(invalid());
        };

        let data_bits = match data {
            '5'..='8' => *data as u8 - b'0',
            _ => return Err(invalid()),
        };
        let parity = match parity.to_ascii_uppercase() {
            'N' => Parity::None,
            'E' => Parity::Even,
            'O' => Parity::Odd,
            _ => return Err(invalid()),
        };
        let stop_bits = match stop {
            '1' => 1,
            '2' => 2,
            _ => return Err(invalid()),
        };

        Ok(Self {
            data_bits,
            parity,
            stop_bits,
        })
    }
}

// ============================================================================
// ByteStream
// ============================================================================

/// Transport the device reads from and writes to.
///
/// Writes may be buffered until [`flush`](ByteStream::flush). `read` never
/// blocks longer than the transport's own timeout and yields
/// [`END_OF_STREAM`] when nothing arrived.
pub trait ByteStream: Send {
    /// Open the connection. `baud` and `config` only matter for serial lines.
    fn begin(&mut self, baud: u32, config: SerialConfig) -> Result<()>;

    fn end(&mut self) -> Result<()>;

    fn connection_ready(&self) -> bool;

    /// Bytes that can be read without blocking.
    fn available(&mut self) -> Result<usize>;

    /// Next byte, or [`END_OF_STREAM`].
    fn read(&mut self) -> Result<u16>;

    /// Queue one byte; returns how many bytes were accepted.
    fn write(&mut self, byte: u8) -> Result<usize>;

    fn flush(&mut self) -> Result<()>;

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        for &byte in bytes {
            self.write(byte)?;
        }
        Ok(())
    }
}

impl<S: ByteStream + ?Sized> ByteStream for Box<S> {
    fn begin(&mut self, baud: u32, config: SerialConfig) -> Result<()> {
        (**self).begin(baud, config)
    }
    fn end(&mut self) -> Result<()> {
        (**self).end()
    }
    fn connection_ready(&self) -> bool {
        (**self).connection_ready()
    }
    fn available(&mut self) -> Result<usize> {
        (**self).available()
    }
    fn read(&mut self) -> Result<u16> {
        (**self).read()
    }
    fn write(&mut self, byte: u8) -> Result<usize> {
        (**self).write(byte)
    }
    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

// ----------------------------------------------------------------------------
// Serial
// ----------------------------------------------------------------------------

/// Serial port transport backed by the `serialport` crate.
pub struct SerialStream {
    path: String,
    timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
}

impl SerialStream {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            port: None,
            inbound: VecDeque::new(),
            outbound: Vec::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| TransportError::NotConnected(self.path.clone()).into())
    }
}

impl fmt::Debug for SerialStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialStream")
            .field("path", &self.path)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl ByteStream for SerialStream {
    fn begin(&mut self, baud: u32, config: SerialConfig) -> Result<()> {
        let (data_bits, parity, stop_bits) = config.to_serialport()?;
        let port = serialport::new(&self.path, baud)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(self.timeout)
            .open()?;
        info!("Opened serial port {} at {} baud ({})", self.path, baud, config);
        self.port = Some(port);
        self.inbound.clear();
        self.outbound.clear();
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!("Closed serial port {}", self.path);
        }
        self.inbound.clear();
        self.outbound.clear();
        Ok(())
    }

    fn connection_ready(&self) -> bool {
        self.port.is_some()
    }

    fn available(&mut self) -> Result<usize> {
        let buffered = self.inbound.len();
        let pending = self.port()?.bytes_to_read()? as usize;
        Ok(buffered + pending)
    }

    fn read(&mut self) -> Result<u16> {
        if let Some(byte) = self.inbound.pop_front() {
            return Ok(byte as u16);
        }

        let mut buf = [0u8; READ_CHUNK];
        let n = match Read::read(self.port()?, &mut buf) {
            Ok(n) => n,
            Err(e) if is_timeout(&e) => return Ok(END_OF_STREAM),
            Err(e) => return Err(e.into()),
        };
        self.inbound.extend(&buf[..n]);
        Ok(self
            .inbound
            .pop_front()
            .map_or(END_OF_STREAM, |b| b as u16))
    }

    fn write(&mut self, byte: u8) -> Result<usize> {
        self.port()?;
        self.outbound.push(byte);
        Ok(1)
    }

    fn flush(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.outbound);
        let port = self.port()?;
        Write::write_all(port, &pending)?;
        Write::flush(port)?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// TCP
// ----------------------------------------------------------------------------

/// TCP transport. The baud rate and line settings passed to `begin` are
/// ignored.
#[derive(Debug)]
pub struct NetworkStream {
    address: String,
    timeout: Duration,
    socket: Option<TcpStream>,
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
}

impl NetworkStream {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
            socket: None,
            inbound: VecDeque::new(),
            outbound: Vec::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn socket(&mut self) -> Result<&mut TcpStream> {
        self.socket
            .as_mut()
            .ok_or_else(|| TransportError::NotConnected(self.address.clone()).into())
    }

    /// Pull whatever the socket holds into the inbound buffer.
    fn fill(&mut self, blocking: bool) -> Result<()> {
        let address = self.address.clone();
        let socket = self.socket()?;
        socket.set_nonblocking(!blocking)?;
        let mut buf = [0u8; READ_CHUNK];
        let result = socket.read(&mut buf);
        socket.set_nonblocking(false)?;

        match result {
            Ok(0) => {
                self.socket = None;
                Err(TransportError::ConnectionLost(format!("{address}: closed by peer")).into())
            }
            Ok(n) => {
                self.inbound.extend(&buf[..n]);
                Ok(())
            }
            Err(e) if is_timeout(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl ByteStream for NetworkStream {
    fn begin(&mut self, _baud: u32, _config: SerialConfig) -> Result<()> {
        let socket = TcpStream::connect(&self.address)?;
        socket.set_read_timeout(Some(self.timeout))?;
        socket.set_nodelay(true)?;
        info!("Connected to {}", self.address);
        self.socket = Some(socket);
        self.inbound.clear();
        self.outbound.clear();
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        if let Some(socket) = self.socket.take() {
            let _ = socket.shutdown(std::net::Shutdown::Both);
            debug!("Disconnected from {}", self.address);
        }
        self.inbound.clear();
        self.outbound.clear();
        Ok(())
    }

    fn connection_ready(&self) -> bool {
        self.socket.is_some()
    }

    fn available(&mut self) -> Result<usize> {
        if self.inbound.is_empty() {
            self.fill(false)?;
        }
        Ok(self.inbound.len())
    }

    fn read(&mut self) -> Result<u16> {
        if self.inbound.is_empty() {
            self.fill(true)?;
        }
        Ok(self
            .inbound
            .pop_front()
            .map_or(END_OF_STREAM, |b| b as u16))
    }

    fn write(&mut self, byte: u8) -> Result<usize> {
        self.socket()?;
        self.outbound.push(byte);
        Ok(1)
    }

    fn flush(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.outbound);
        let socket = self.socket()?;
        Write::write_all(socket, &pending)?;
        Write::flush(socket)?;
        Ok(())
    }
}
