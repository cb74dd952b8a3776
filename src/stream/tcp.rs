use std::io::{Read, Write};
use std::net::{self, Shutdown, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use typed_builder::TypedBuilder;

use super::{lock, map_read_error, map_write_error, not_connected, Stream, DEFAULT_READ_SIZE};
use crate::{Error, Result};

fn default_read_size() -> usize {
    DEFAULT_READ_SIZE
}

/// TCP client settings. Equal read and write ports share one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct TcpConfig {
    #[builder(setter(into))]
    pub host: String,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub write_port: Option<u16>,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub read_port: Option<u16>,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub connect_timeout: Option<Duration>,
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

/// TCP client stream.
#[derive(Debug)]
pub struct TcpStream {
    config: TcpConfig,
    read_socket: Mutex<Option<Arc<net::TcpStream>>>,
    write_socket: Mutex<Option<net::TcpStream>>,
    connected: AtomicBool,
}

impl TcpStream {
    /// # Errors
    /// [Error::Configuration] if neither port is given.
    pub fn new(config: TcpConfig) -> Result<Self> {
        if config.read_port.is_none() && config.write_port.is_none() {
            return Err(Error::Configuration(
                "tcp stream needs a read or write port".to_string(),
            ));
        }
        Ok(TcpStream {
            config,
            read_socket: Mutex::default(),
            write_socket: Mutex::default(),
            connected: AtomicBool::new(false),
        })
    }

    fn open(&self, port: u16) -> Result<net::TcpStream> {
        let addr: SocketAddr = (self.config.host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| Error::Connection(format!("{}:{port}: {e}", self.config.host)))?
            .next()
            .ok_or_else(|| Error::Connection(format!("{}:{port} did not resolve", self.config.host)))?;
        let sock = match self.config.connect_timeout {
            Some(timeout) => net::TcpStream::connect_timeout(&addr, timeout),
            None => net::TcpStream::connect(addr),
        }
        .map_err(|e| Error::Connection(format!("{addr}: {e}")))?;
        sock.set_nodelay(true)?;
        sock.set_read_timeout(self.config.read_timeout)?;
        sock.set_write_timeout(self.config.write_timeout)?;
        debug!(%addr, "tcp connected");
        Ok(sock)
    }

    fn reader(&self) -> Result<Arc<net::TcpStream>> {
        lock(&self.read_socket)
            .clone()
            .ok_or_else(|| not_connected("tcp read socket"))
    }

    fn read_some(&self, sock: &net::TcpStream) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; self.config.read_size];
        loop {
            let mut reader = sock;
            return match reader.read(&mut buf) {
                Ok(0) => Ok(None),
                Ok(n) => {
                    buf.truncate(n);
                    Ok(Some(buf))
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => map_read_error(e),
            };
        }
    }
}

impl Stream for TcpStream {
    fn connect(&self) -> Result<()> {
        let (read, write) = match (self.config.read_port, self.config.write_port) {
            (Some(r), Some(w)) if r == w => {
                let sock = self.open(r)?;
                let write = sock.try_clone()?;
                (Some(sock), Some(write))
            }
            (r, w) => (
                r.map(|p| self.open(p)).transpose()?,
                w.map(|p| self.open(p)).transpose()?,
            ),
        };
        *lock(&self.read_socket) = read.map(Arc::new);
        *lock(&self.write_socket) = write;
        self.connected.store(true, Ordering::SeqCst);
        info!(host = %self.config.host, read_port = ?self.config.read_port, write_port = ?self.config.write_port, "connected");
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn read(&self) -> Result<Option<Vec<u8>>> {
        let sock = self.reader()?;
        self.read_some(&sock)
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        let mut guard = lock(&self.write_socket);
        let sock = guard.as_mut().ok_or_else(|| not_connected("tcp write socket"))?;
        sock.write_all(data).map_err(map_write_error)?;
        sock.flush().map_err(map_write_error)
    }

    fn disconnect(&self) {
        // Shutdown wakes a reader blocked on the shared socket with end of stream.
        if let Some(sock) = lock(&self.read_socket).take() {
            sock.shutdown(Shutdown::Both).ok();
        }
        if let Some(sock) = lock(&self.write_socket).take() {
            sock.shutdown(Shutdown::Both).ok();
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            info!(host = %self.config.host, "disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn loopback() -> (TcpStream, net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream = TcpStream::new(
            TcpConfig::builder()
                .host("127.0.0.1")
                .read_port(port)
                .write_port(port)
                .read_timeout(Duration::from_millis(200))
                .build(),
        )
        .unwrap();
        let accept = thread::spawn(move || listener.accept().unwrap().0);
        stream.connect().unwrap();
        (stream, accept.join().unwrap())
    }

    #[test]
    fn read_write_over_shared_socket() {
        let (stream, mut peer) = loopback();
        assert!(stream.connected());

        peer.write_all(&[1, 2, 3]).unwrap();
        assert_eq!(stream.read().unwrap(), Some(vec![1, 2, 3]));

        stream.write(&[9, 8]).unwrap();
        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [9, 8]);
    }

    #[test]
    fn read_timeout_and_eof() {
        let (stream, peer) = loopback();
        assert!(matches!(stream.read(), Err(Error::Timeout)));
        drop(peer);
        assert_eq!(stream.read().unwrap(), None);
    }

    #[test]
    fn disconnect_rejects_io() {
        let (stream, _peer) = loopback();
        stream.disconnect();
        assert!(!stream.connected());
        assert!(matches!(stream.write(&[1]), Err(Error::Connection(_))));
        assert!(matches!(stream.read(), Err(Error::Connection(_))));
    }

    #[test]
    fn connection_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let stream = TcpStream::new(TcpConfig::builder().host("127.0.0.1").read_port(port).build())
            .unwrap();
        assert!(matches!(stream.connect(), Err(Error::Connection(_))));
    }

    #[test]
    fn needs_a_port() {
        assert!(TcpStream::new(TcpConfig::builder().host("localhost").build()).is_err());
    }
}
