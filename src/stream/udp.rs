use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use typed_builder::TypedBuilder;

use super::{lock, map_read_error, map_write_error, not_connected, Stream, DEFAULT_READ_SIZE};
use crate::{Error, Result};

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_ttl() -> u32 {
    1
}

fn default_read_size() -> usize {
    DEFAULT_READ_SIZE
}

/// UDP settings. A multicast `host` is joined when reading and used as the
/// destination group when writing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct UdpConfig {
    #[builder(setter(into))]
    pub host: String,
    /// Destination port of written datagrams.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub write_dest_port: Option<u16>,
    /// Local port written datagrams are sent from. Ephemeral if unset.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub write_src_port: Option<u16>,
    /// Local port datagrams are received on.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub read_port: Option<u16>,
    #[builder(default = default_bind_address(), setter(into))]
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub read_timeout: Option<Duration>,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub write_timeout: Option<Duration>,
    /// Unicast TTL or multicast hop limit.
    #[builder(default = 1)]
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[builder(default = DEFAULT_READ_SIZE)]
    #[serde(default = "default_read_size")]
    pub read_size: usize,
}

#[derive(Debug)]
struct Writer {
    socket: UdpSocket,
    dest: SocketAddr,
}

/// Datagram stream. Each read returns one datagram.
///
/// Disconnecting does not wake a blocked reader; it returns once the read timeout
/// expires.
#[derive(Debug)]
pub struct UdpStream {
    config: UdpConfig,
    bind_ip: IpAddr,
    read_socket: Mutex<Option<Arc<UdpSocket>>>,
    writer: Mutex<Option<Writer>>,
    connected: AtomicBool,
}

impl UdpStream {
    /// # Errors
    /// [Error::Configuration] if neither port is given or the bind address is invalid.
    pub fn new(config: UdpConfig) -> Result<Self> {
        if config.read_port.is_none() && config.write_dest_port.is_none() {
            return Err(Error::Configuration(
                "udp stream needs a read port or write destination port".to_string(),
            ));
        }
        let bind_ip = config.bind_address.parse().map_err(|e| {
            Error::Configuration(format!("invalid bind address {}: {e}", config.bind_address))
        })?;
        Ok(UdpStream {
            config,
            bind_ip,
            read_socket: Mutex::default(),
            writer: Mutex::default(),
            connected: AtomicBool::new(false),
        })
    }

    fn host_addr(&self, port: u16) -> Result<SocketAddr> {
        (self.config.host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| Error::Connection(format!("{}:{port}: {e}", self.config.host)))?
            .next()
            .ok_or_else(|| Error::Connection(format!("{}:{port} did not resolve", self.config.host)))
    }

    fn multicast_group(&self) -> Option<Ipv4Addr> {
        match self.config.host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) if ip.is_multicast() => Some(ip),
            _ => None,
        }
    }

    fn open_reader(&self, port: u16) -> Result<UdpSocket> {
        let socket = UdpSocket::bind((self.bind_ip, port))
            .map_err(|e| Error::Connection(format!("bind {}:{port}: {e}", self.bind_ip)))?;
        if let Some(group) = self.multicast_group() {
            let interface = match self.bind_ip {
                IpAddr::V4(ip) => ip,
                IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            };
            socket.join_multicast_v4(&group, &interface)?;
            debug!(%group, %interface, "joined multicast group");
        }
        socket.set_read_timeout(self.config.read_timeout)?;
        Ok(socket)
    }

    fn open_writer(&self, dest_port: u16) -> Result<Writer> {
        let dest = self.host_addr(dest_port)?;
        let src_ip: IpAddr = if dest.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            std::net::Ipv6Addr::UNSPECIFIED.into()
        };
        let port = self.config.write_src_port.unwrap_or(0);
        let socket = UdpSocket::bind((src_ip, port))
            .map_err(|e| Error::Connection(format!("bind {src_ip}:{port}: {e}")))?;
        if self.multicast_group().is_some() {
            socket.set_multicast_ttl_v4(self.config.ttl)?;
        } else {
            socket.set_ttl(self.config.ttl)?;
        }
        socket.set_write_timeout(self.config.write_timeout)?;
        Ok(Writer { socket, dest })
    }

    fn reader(&self) -> Result<Arc<UdpSocket>> {
        lock(&self.read_socket)
            .clone()
            .ok_or_else(|| not_connected("udp read socket"))
    }

    fn recv(&self, socket: &UdpSocket) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; self.config.read_size];
        match socket.recv_from(&mut buf) {
            Ok((n, _)) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Err(e) => map_read_error(e),
        }
    }
}

impl Stream for UdpStream {
    fn connect(&self) -> Result<()> {
        let reader = self
            .config
            .read_port
            .map(|port| self.open_reader(port))
            .transpose()?;
        let writer = self
            .config
            .write_dest_port
            .map(|port| self.open_writer(port))
            .transpose()?;
        *lock(&self.read_socket) = reader.map(Arc::new);
        *lock(&self.writer) = writer;
        self.connected.store(true, Ordering::SeqCst);
        info!(host = %self.config.host, read_port = ?self.config.read_port, write_dest_port = ?self.config.write_dest_port, "connected");
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn read(&self) -> Result<Option<Vec<u8>>> {
        let socket = self.reader()?;
        self.recv(&socket)
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        let guard = lock(&self.writer);
        let writer = guard.as_ref().ok_or_else(|| not_connected("udp write socket"))?;
        let sent = writer
            .socket
            .send_to(data, writer.dest)
            .map_err(map_write_error)?;
        if sent != data.len() {
            return Err(Error::Connection(format!(
                "udp datagram truncated: sent {sent} of {} bytes",
                data.len()
            )));
        }
        Ok(())
    }

    fn disconnect(&self) {
        lock(&self.read_socket).take();
        lock(&self.writer).take();
        if self.connected.swap(false, Ordering::SeqCst) {
            info!(host = %self.config.host, "disconnected");
        }
    }
}
