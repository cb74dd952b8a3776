use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use tracing::info;
use typed_builder::TypedBuilder;

use super::{lock, map_read_error, map_write_error, not_connected, Stream, DEFAULT_READ_SIZE};
use crate::{Error, Result};

/// Port timeout used while waiting on a read with no timeout configured. Bounds how
/// long [SerialStream::disconnect] waits for a blocked reader.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_read_size() -> usize {
    DEFAULT_READ_SIZE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct SerialConfig {
    /// Device path, e.g., `/dev/ttyUSB0` or `COM3`.
    #[builder(setter(into))]
    pub port: String,
    pub baud_rate: u32,
    #[builder(default = 8)]
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[builder(default)]
    #[serde(default)]
    pub parity: Parity,
    #[builder(default = 1)]
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[builder(default)]
    #[serde(default)]
    pub flow_control: FlowControl,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub read_timeout: Option<Duration>,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub write_timeout: Option<Duration>,
    #[builder(default = DEFAULT_READ_SIZE)]
    #[serde(default = "default_read_size")]
    pub read_size: usize,
}

impl SerialConfig {
    /// # Errors
    /// [Error::Configuration] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.port.trim().is_empty() {
            return Err(Error::Configuration("serial port cannot be empty".to_string()));
        }
        if self.baud_rate == 0 {
            return Err(Error::Configuration("baud rate must be greater than 0".to_string()));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(Error::Configuration(format!(
                "data bits must be 5, 6, 7, or 8, got {}",
                self.data_bits
            )));
        }
        if ![1, 2].contains(&self.stop_bits) {
            return Err(Error::Configuration(format!(
                "stop bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        if self.read_size == 0 {
            return Err(Error::Configuration("read size must be greater than 0".to_string()));
        }
        Ok(())
    }

    fn data_bits(&self) -> serialport::DataBits {
        match self.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        }
    }

    fn stop_bits(&self) -> serialport::StopBits {
        match self.stop_bits {
            2 => serialport::StopBits::Two,
            _ => serialport::StopBits::One,
        }
    }

    fn parity(&self) -> serialport::Parity {
        match self.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        }
    }

    fn flow_control(&self) -> serialport::FlowControl {
        match self.flow_control {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Software => serialport::FlowControl::Software,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
        }
    }
}

/// Serial port stream. Reads and writes use separate handles to the same device.
pub struct SerialStream {
    config: SerialConfig,
    reader: Mutex<Option<Box<dyn SerialPort>>>,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
    connected: AtomicBool,
}

impl std::fmt::Debug for SerialStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialStream")
            .field("config", &self.config)
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}

impl SerialStream {
    /// # Errors
    /// [Error::Configuration] if `config` does not validate.
    pub fn new(config: SerialConfig) -> Result<Self> {
        config.validate()?;
        Ok(SerialStream {
            config,
            reader: Mutex::default(),
            writer: Mutex::default(),
            connected: AtomicBool::new(false),
        })
    }

    /// Read once with the port's current timeout.
    fn read_once(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let mut guard = lock(&self.reader);
        let port = guard.as_mut().ok_or_else(|| not_connected("serial port"))?;
        port.set_timeout(timeout)?;
        let mut buf = vec![0u8; self.config.read_size];
        match port.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(n) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Err(e) => map_read_error(e),
        }
    }
}

impl Stream for SerialStream {
    fn connect(&self) -> Result<()> {
        let reader = serialport::new(&self.config.port, self.config.baud_rate)
            .data_bits(self.config.data_bits())
            .parity(self.config.parity())
            .stop_bits(self.config.stop_bits())
            .flow_control(self.config.flow_control())
            .timeout(self.config.read_timeout.unwrap_or(POLL_INTERVAL))
            .open()
            .map_err(|e| Error::Connection(format!("{}: {e}", self.config.port)))?;
        let mut writer = reader.try_clone()?;
        if let Some(timeout) = self.config.write_timeout {
            writer.set_timeout(timeout)?;
        }
        *lock(&self.reader) = Some(reader);
        *lock(&self.writer) = Some(writer);
        self.connected.store(true, Ordering::SeqCst);
        info!(port = %self.config.port, baud_rate = self.config.baud_rate, "connected");
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn read(&self) -> Result<Option<Vec<u8>>> {
        if let Some(timeout) = self.config.read_timeout {
            return self.read_once(timeout);
        }
        // Without a timeout, poll so a disconnect can take the port between reads.
        loop {
            match self.read_once(POLL_INTERVAL) {
                Err(Error::Timeout) => continue,
                other => return other,
            }
        }
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        let mut guard = lock(&self.writer);
        let port = guard.as_mut().ok_or_else(|| not_connected("serial port"))?;
        port.write_all(data).map_err(map_write_error)?;
        port.flush().map_err(map_write_error)
    }

    fn disconnect(&self) {
        lock(&self.writer).take();
        lock(&self.reader).take();
        if self.connected.swap(false, Ordering::SeqCst) {
            info!(port = %self.config.port, "disconnected");
        }
    }
}
