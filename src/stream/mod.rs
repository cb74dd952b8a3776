//! Byte transports an interface reads from and writes to.
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

mod memory;
mod serial;
mod tcp;
mod udp;

pub use memory::MemoryStream;
pub use serial::{FlowControl, Parity, SerialConfig, SerialStream};
pub use tcp::{TcpConfig, TcpStream};
pub use udp::{UdpConfig, UdpStream};

/// Read size used when none is configured.
pub const DEFAULT_READ_SIZE: usize = 65535;

/// A connected byte transport.
///
/// Methods take `&self` so one reader and any number of writers can share a stream.
/// Writes are serialized internally. Reads are not, and only one thread may read.
pub trait Stream: Send + Sync {
    /// # Errors
    /// [Error::Connection] if the transport cannot be opened.
    fn connect(&self) -> Result<()>;

    fn connected(&self) -> bool;

    /// Block until data is available or the read timeout expires.
    ///
    /// Returns `Ok(None)` once the peer has closed the stream.
    ///
    /// # Errors
    /// [Error::Timeout] if the read timeout expires.
    fn read(&self) -> Result<Option<Vec<u8>>>;

    /// Write all of `data`.
    ///
    /// # Errors
    /// [Error::Timeout] if the write timeout expires, [Error::Connection] if not
    /// connected.
    fn write(&self, data: &[u8]) -> Result<()>;

    /// Close the transport, waking a blocked reader where the transport allows it.
    fn disconnect(&self);
}

/// Declarative stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamConfig {
    Tcp(TcpConfig),
    Udp(UdpConfig),
    Serial(SerialConfig),
}

impl StreamConfig {
    /// Create an unconnected stream.
    ///
    /// # Errors
    /// [Error::Configuration] for invalid settings.
    pub fn build(&self) -> Result<Arc<dyn Stream>> {
        Ok(match self {
            StreamConfig::Tcp(config) => Arc::new(TcpStream::new(config.clone())?),
            StreamConfig::Udp(config) => Arc::new(UdpStream::new(config.clone())?),
            StreamConfig::Serial(config) => Arc::new(SerialStream::new(config.clone())?),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Map read/write errors to stream semantics: timeouts become [Error::Timeout] and
/// resets become end of stream (`Ok(None)`).
fn map_read_error(err: io::Error) -> Result<Option<Vec<u8>>> {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Err(Error::Timeout),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => Ok(None),
        _ => Err(Error::Io(err)),
    }
}

fn map_write_error(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Timeout,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe => Error::Connection(err.to_string()),
        _ => Error::Io(err),
    }
}

fn not_connected(what: &str) -> Error {
    Error::Connection(format!("{what} not connected"))
}
