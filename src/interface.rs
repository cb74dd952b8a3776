//! Packet I/O over a stream through protocol chains.
//!
//! An [Interface] owns one stream and the protocols that delineate it. Reading pulls
//! bytes from the stream until the read protocols produce a frame, then turns the
//! frame into an identified [Packet]. Writing runs a packet through the write
//! protocols and out the stream.
//!
//! [InterfaceThread] runs the read loop on a dedicated thread, reconnecting as needed,
//! and sends packets over a channel. [InterfaceWriter] handles can write from any
//! thread while the reader runs.
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use crossbeam::channel::{self, after, select, Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, trace, warn};
use typed_builder::TypedBuilder;

use crate::catalog::Catalog;
use crate::log::PacketLogWriter;
use crate::packet::{Packet, UNKNOWN};
use crate::protocol::{
    Direction, FrameHeader, OverrideHandle, PacketOutcome, Protocol, ProtocolConfig,
    ProtocolContext, ReadOutcome,
};
use crate::stream::{Stream, StreamConfig};
use crate::value::hex_summary;
use crate::{Error, Result};

/// Bytes of a dropped frame included in log messages.
const SUMMARY_BYTES: usize = 16;

/// A hook run on every received packet after the read protocols.
pub type PacketStage = Box<dyn FnMut(&mut Packet) + Send>;

type Protocols = Vec<Box<dyn Protocol>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A protocol and the chain(s) it is added to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolEntry {
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub direction: Direction,
}

/// Declarative interface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,
    pub stream: StreamConfig,
    #[serde(default)]
    pub protocols: Vec<ProtocolEntry>,
    /// Targets received packets are identified against. All targets if unset.
    #[serde(default)]
    pub target_names: Option<Vec<String>>,
}

/// Result of running bytes through the read chain.
enum Chain {
    Frame(Vec<u8>),
    Stop,
    /// A protocol reported a framing error and resynced.
    Resynced,
    Disconnect,
}

/// Writes packets through an interface's write protocols.
///
/// Clones share the protocols and stream. The protocol lock is held for the whole
/// write so concurrent writers never interleave.
#[derive(Clone)]
pub struct InterfaceWriter {
    name: Arc<str>,
    stream: Arc<dyn Stream>,
    protocols: Arc<Mutex<Protocols>>,
    write_count: Arc<AtomicU64>,
}

impl fmt::Debug for InterfaceWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceWriter")
            .field("name", &self.name)
            .field("write_count", &self.write_count())
            .finish_non_exhaustive()
    }
}

impl InterfaceWriter {
    /// Write `packet` through the write protocols.
    ///
    /// A protocol may drop the packet, in which case nothing is written and this
    /// returns `Ok`.
    ///
    /// # Errors
    /// Protocol errors, or stream errors such as [Error::Connection] and
    /// [Error::Timeout].
    pub fn write(&self, packet: Packet) -> Result<()> {
        let mut protocols = lock(&self.protocols);
        let mut packet = packet;
        for protocol in protocols.iter_mut() {
            match protocol.write_packet(packet)? {
                PacketOutcome::Packet(p) => packet = p,
                PacketOutcome::Stop => {
                    trace!(interface = %self.name, protocol = protocol.name(), "write dropped");
                    return Ok(());
                }
                PacketOutcome::Disconnect => {
                    info!(interface = %self.name, protocol = protocol.name(), "write_packet requested disconnect");
                    self.stream.disconnect();
                    return Ok(());
                }
            }
        }

        let mut data = packet.into_buffer();
        for protocol in protocols.iter_mut() {
            match protocol.write_data(data)? {
                ReadOutcome::Data(d) => data = d,
                ReadOutcome::Stop => {
                    trace!(interface = %self.name, protocol = protocol.name(), "write dropped");
                    return Ok(());
                }
                ReadOutcome::Disconnect => {
                    info!(interface = %self.name, protocol = protocol.name(), "write_data requested disconnect");
                    self.stream.disconnect();
                    return Ok(());
                }
            }
        }

        self.stream.write(&data)?;
        self.write_count.fetch_add(1, Ordering::Relaxed);
        trace!(interface = %self.name, bytes = data.len(), "wrote packet");
        Ok(())
    }

    /// Write `data` directly to the stream, bypassing the write protocols.
    ///
    /// # Errors
    /// Stream errors such as [Error::Connection] and [Error::Timeout].
    pub fn write_raw(&self, data: &[u8]) -> Result<()> {
        let _protocols = lock(&self.protocols);
        self.stream.write(data)?;
        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of successful writes.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }
}

/// A stream with read and write protocol chains.
pub struct Interface {
    name: String,
    stream: Arc<dyn Stream>,
    catalog: Arc<Catalog>,
    overrides: OverrideHandle,
    target_names: Option<Vec<String>>,
    read_protocols: Protocols,
    writer: InterfaceWriter,
    stages: Vec<PacketStage>,
    log_writer: Option<Box<dyn PacketLogWriter>>,
    read_count: u64,
    received_counts: HashMap<(String, String), u64>,
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |protocols: &[Box<dyn Protocol>]| {
            protocols.iter().map(|p| p.name()).collect::<Vec<_>>()
        };
        f.debug_struct("Interface")
            .field("name", &self.name)
            .field("read_protocols", &names(&self.read_protocols))
            .field("write_protocols", &names(&lock(&self.writer.protocols)[..]))
            .field("stages", &self.stages.len())
            .field("read_count", &self.read_count)
            .finish_non_exhaustive()
    }
}

impl Interface {
    pub fn new(name: &str, stream: Arc<dyn Stream>, catalog: Arc<Catalog>) -> Self {
        Interface {
            name: name.to_string(),
            writer: InterfaceWriter {
                name: Arc::from(name),
                stream: stream.clone(),
                protocols: Arc::default(),
                write_count: Arc::default(),
            },
            stream,
            catalog,
            overrides: OverrideHandle::default(),
            target_names: None,
            read_protocols: Vec::new(),
            stages: Vec::new(),
            log_writer: None,
            read_count: 0,
            received_counts: HashMap::new(),
        }
    }

    /// Build an interface, its stream, and its protocols from `config`.
    ///
    /// # Errors
    /// [Error::Configuration] for invalid stream or protocol settings.
    pub fn from_config(config: &InterfaceConfig, catalog: Arc<Catalog>) -> Result<Self> {
        let mut interface = Interface::new(&config.name, config.stream.build()?, catalog);
        interface.target_names = config.target_names.clone();
        for entry in &config.protocols {
            interface.add_protocol(&entry.protocol, entry.direction)?;
        }
        Ok(interface)
    }

    /// Restrict packet identification to `target_names`. Applies to protocols added
    /// afterwards.
    #[must_use]
    pub fn with_target_names(mut self, target_names: Vec<String>) -> Self {
        self.target_names = Some(target_names);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle to the overrides applied by override protocols on this interface.
    #[must_use]
    pub fn overrides(&self) -> OverrideHandle {
        self.overrides.clone()
    }

    #[must_use]
    pub fn writer(&self) -> InterfaceWriter {
        self.writer.clone()
    }

    #[must_use]
    pub fn stream(&self) -> Arc<dyn Stream> {
        self.stream.clone()
    }

    /// Number of packets returned by [Interface::read].
    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.read_count
    }

    /// Add a protocol built from `config`.
    ///
    /// Read protocols run in the order added. Write protocols run in the reverse
    /// order, so the protocol closest to the stream is the last to touch written data.
    /// [Direction::ReadWrite] adds separate instances to both chains.
    ///
    /// # Errors
    /// [Error::Configuration] for invalid protocol settings.
    pub fn add_protocol(&mut self, config: &ProtocolConfig, direction: Direction) -> Result<()> {
        let ctx = ProtocolContext {
            catalog: self.catalog.clone(),
            overrides: self.overrides.clone(),
            target_names: self.target_names.clone(),
        };
        if matches!(direction, Direction::Read | Direction::ReadWrite) {
            self.add_read_protocol(config.build(&ctx)?);
        }
        if matches!(direction, Direction::Write | Direction::ReadWrite) {
            self.add_write_protocol(config.build(&ctx)?);
        }
        debug!(interface = %self.name, ?direction, protocol = ?config, "added protocol");
        Ok(())
    }

    /// Append an already constructed protocol to the read chain.
    pub fn add_read_protocol(&mut self, protocol: Box<dyn Protocol>) {
        self.read_protocols.push(protocol);
        let last = self.read_protocols.len() - 1;
        for (idx, protocol) in self.read_protocols.iter_mut().enumerate() {
            protocol.set_last_read_protocol(idx == last);
        }
    }

    /// Insert an already constructed protocol at the front of the write chain.
    pub fn add_write_protocol(&mut self, protocol: Box<dyn Protocol>) {
        lock(&self.writer.protocols).insert(0, protocol);
    }

    /// Append a hook run on every received packet.
    pub fn add_stage<F>(&mut self, stage: F)
    where
        F: FnMut(&mut Packet) + Send + 'static,
    {
        self.stages.push(Box::new(stage));
    }

    pub fn set_log_writer(&mut self, writer: Box<dyn PacketLogWriter>) {
        self.log_writer = Some(writer);
    }

    /// # Errors
    /// Stream connection errors.
    pub fn connect(&mut self) -> Result<()> {
        self.stream.connect()?;
        for protocol in &mut self.read_protocols {
            protocol.connect_reset();
        }
        for protocol in lock(&self.writer.protocols).iter_mut() {
            protocol.connect_reset();
        }
        info!(interface = %self.name, "connected");
        Ok(())
    }

    #[must_use]
    pub fn connected(&self) -> bool {
        self.stream.connected()
    }

    pub fn disconnect(&mut self) {
        self.stream.disconnect();
        for protocol in &mut self.read_protocols {
            protocol.disconnect_reset();
        }
        for protocol in lock(&self.writer.protocols).iter_mut() {
            protocol.disconnect_reset();
        }
        if let Some(writer) = self.log_writer.as_mut() {
            if let Err(err) = writer.flush() {
                warn!(interface = %self.name, %err, "failed to flush packet log");
            }
        }
        debug!(interface = %self.name, "disconnected");
    }

    /// See [InterfaceWriter::write].
    ///
    /// # Errors
    /// See [InterfaceWriter::write].
    pub fn write(&self, packet: Packet) -> Result<()> {
        self.writer.write(packet)
    }

    /// See [InterfaceWriter::write_raw].
    ///
    /// # Errors
    /// See [InterfaceWriter::write_raw].
    pub fn write_raw(&self, data: &[u8]) -> Result<()> {
        self.writer.write_raw(data)
    }

    /// Read the next packet.
    ///
    /// Returns `Ok(None)` when the stream closes or a protocol requests a disconnect.
    /// Frames with recoverable errors are logged and dropped. Unidentified packets are
    /// returned named [UNKNOWN].
    ///
    /// # Errors
    /// [Error::Timeout] if the stream read times out, which leaves the interface
    /// connected. Any other error disconnects the interface.
    pub fn read(&mut self) -> Result<Option<Packet>> {
        let result = self.read_packet();
        match &result {
            Err(Error::Timeout) | Ok(_) => {}
            Err(err) => {
                error!(interface = %self.name, %err, "error reading from interface");
                self.disconnect();
            }
        }
        result
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        // Protocols may already hold a complete frame, so start with an empty pass.
        let mut inject_empty = !self.read_protocols.is_empty();
        loop {
            let data = if inject_empty {
                inject_empty = false;
                Vec::new()
            } else {
                let Some(data) = self.stream.read()? else {
                    info!(interface = %self.name, "stream closed");
                    return Ok(None);
                };
                trace!(interface = %self.name, bytes = data.len(), "read");
                data
            };
            let fed = !data.is_empty();

            let frame = match self.read_chain(data)? {
                Chain::Frame(frame) => frame,
                Chain::Stop => {
                    inject_empty = fed && !self.read_protocols.is_empty();
                    continue;
                }
                Chain::Resynced => {
                    inject_empty = true;
                    continue;
                }
                Chain::Disconnect => return Ok(None),
            };

            match self.packet_chain(Packet::from_buffer(frame))? {
                PacketOutcome::Packet(packet) => return Ok(Some(self.finish(packet))),
                PacketOutcome::Stop => inject_empty = !self.read_protocols.is_empty(),
                PacketOutcome::Disconnect => return Ok(None),
            }
        }
    }

    fn read_chain(&mut self, mut data: Vec<u8>) -> Result<Chain> {
        for protocol in &mut self.read_protocols {
            match protocol.read_data(&data) {
                Ok(ReadOutcome::Data(next)) => data = next,
                Ok(ReadOutcome::Stop) => return Ok(Chain::Stop),
                Ok(ReadOutcome::Disconnect) => {
                    info!(interface = %self.name, protocol = protocol.name(), "read_data requested disconnect");
                    return Ok(Chain::Disconnect);
                }
                Err(err) if err.is_recoverable() => {
                    warn!(
                        interface = %self.name,
                        protocol = protocol.name(),
                        %err,
                        bytes = %hex_summary(&data, SUMMARY_BYTES),
                        "dropping data and resyncing"
                    );
                    protocol.resync();
                    return Ok(Chain::Resynced);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(Chain::Frame(data))
    }

    fn packet_chain(&mut self, mut packet: Packet) -> Result<PacketOutcome> {
        for protocol in &mut self.read_protocols {
            let head = packet.buffer()[..packet.len().min(SUMMARY_BYTES + 1)].to_vec();
            match protocol.read_packet(packet) {
                Ok(PacketOutcome::Packet(p)) => packet = p,
                Ok(PacketOutcome::Stop) => {
                    trace!(interface = %self.name, protocol = protocol.name(), "packet dropped");
                    return Ok(PacketOutcome::Stop);
                }
                Ok(PacketOutcome::Disconnect) => {
                    info!(interface = %self.name, protocol = protocol.name(), "read_packet requested disconnect");
                    return Ok(PacketOutcome::Disconnect);
                }
                Err(err) if err.is_recoverable() => {
                    warn!(
                        interface = %self.name,
                        protocol = protocol.name(),
                        %err,
                        bytes = %hex_summary(&head, SUMMARY_BYTES),
                        "dropping packet"
                    );
                    return Ok(PacketOutcome::Stop);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(PacketOutcome::Packet(packet))
    }

    /// Identify, run stages, stamp, and log a received packet.
    fn finish(&mut self, packet: Packet) -> Packet {
        let mut packet = self
            .catalog
            .identify_and_define(packet, self.target_names.as_deref());
        if !packet.is_identified() {
            warn!(
                interface = %self.name,
                bytes = %hex_summary(packet.buffer(), SUMMARY_BYTES),
                len = packet.len(),
                "unknown packet"
            );
            packet.set_names(UNKNOWN, UNKNOWN);
        }

        for stage in &mut self.stages {
            stage(&mut packet);
        }

        if packet.received_time.is_none() {
            packet.received_time = Some(Utc::now());
        }
        let key = (
            packet.target_name().unwrap_or(UNKNOWN).to_string(),
            packet.packet_name().unwrap_or(UNKNOWN).to_string(),
        );
        let count = self.received_counts.entry(key).or_default();
        *count += 1;
        packet.received_count = *count;
        self.read_count += 1;

        if let Some(writer) = self.log_writer.as_mut() {
            let meta = FrameHeader::from_packet(&packet);
            if let Err(err) = writer.write_packet_log_entry(packet.buffer(), &meta) {
                warn!(interface = %self.name, %err, "failed to log packet");
            }
        }
        trace!(
            interface = %self.name,
            target_name = packet.target_name(),
            packet_name = packet.packet_name(),
            "received packet"
        );
        packet
    }
}

/// Settings for [InterfaceThread].
#[derive(Debug, Clone, TypedBuilder)]
pub struct ThreadOptions {
    /// Wait between reconnect attempts.
    #[builder(default = Duration::from_secs(5))]
    pub reconnect_delay: Duration,
    /// Consecutive read timeouts tolerated before reconnecting.
    #[builder(default = 3)]
    pub max_timeouts: u32,
    /// Reconnect after a disconnect rather than stopping the thread.
    #[builder(default = true)]
    pub auto_reconnect: bool,
    /// Packets buffered for the receiver. Unbounded if `None`.
    #[builder(default, setter(strip_option))]
    pub channel_capacity: Option<usize>,
}

impl Default for ThreadOptions {
    fn default() -> Self {
        ThreadOptions::builder().build()
    }
}

/// Runs an interface's read loop on its own thread.
pub struct InterfaceThread {
    handle: Option<JoinHandle<Interface>>,
    cancel: Sender<()>,
    stream: Arc<dyn Stream>,
    writer: InterfaceWriter,
}

impl fmt::Debug for InterfaceThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceThread")
            .field("writer", &self.writer)
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

impl InterfaceThread {
    /// Start the read loop. Received packets are sent on the returned channel.
    ///
    /// # Errors
    /// If the thread cannot be spawned.
    pub fn spawn(interface: Interface, options: ThreadOptions) -> Result<(Self, Receiver<Packet>)> {
        let (tx, rx) = match options.channel_capacity {
            Some(cap) => channel::bounded(cap),
            None => channel::unbounded(),
        };
        let (cancel_tx, cancel_rx) = channel::bounded(1);
        let stream = interface.stream();
        let writer = interface.writer();
        let handle = thread::Builder::new()
            .name(format!("interface-{}", interface.name()))
            .spawn(move || run(interface, &options, &tx, &cancel_rx))?;
        Ok((
            InterfaceThread {
                handle: Some(handle),
                cancel: cancel_tx,
                stream,
                writer,
            },
            rx,
        ))
    }

    #[must_use]
    pub fn writer(&self) -> InterfaceWriter {
        self.writer.clone()
    }

    /// Ask the read loop to stop. A reader blocked on the stream is woken by
    /// disconnecting it.
    pub fn cancel(&self) {
        self.cancel.try_send(()).ok();
        self.stream.disconnect();
    }

    /// Stop the thread and return the interface.
    ///
    /// # Errors
    /// [Error::Connection] if the read thread panicked.
    pub fn join(mut self) -> Result<Interface> {
        self.cancel();
        self.handle
            .take()
            .ok_or_else(|| Error::Connection("interface thread already joined".to_string()))?
            .join()
            .map_err(|_| Error::Connection("interface thread panicked".to_string()))
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for InterfaceThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancel();
            handle.join().ok();
        }
    }
}

fn cancelled(cancel: &Receiver<()>) -> bool {
    matches!(cancel.try_recv(), Ok(()) | Err(TryRecvError::Disconnected))
}

/// Wait for `delay`. Returns true if cancelled while waiting.
fn wait(cancel: &Receiver<()>, delay: Duration) -> bool {
    select! {
        recv(cancel) -> _ => true,
        recv(after(delay)) -> _ => false,
    }
}

fn run(
    mut interface: Interface,
    options: &ThreadOptions,
    tx: &Sender<Packet>,
    cancel: &Receiver<()>,
) -> Interface {
    let span = info_span!("interface", name = %interface.name());
    let _enter = span.enter();

    'connect: loop {
        if cancelled(cancel) {
            break;
        }
        if !interface.connected() {
            if let Err(err) = interface.connect() {
                warn!(%err, "connect failed");
                if !options.auto_reconnect || wait(cancel, options.reconnect_delay) {
                    break;
                }
                continue;
            }
        }

        let mut timeouts = 0;
        loop {
            if cancelled(cancel) {
                break 'connect;
            }
            match interface.read() {
                Ok(Some(packet)) => {
                    timeouts = 0;
                    select! {
                        send(tx, packet) -> res => {
                            if res.is_err() {
                                debug!("packet receiver dropped");
                                break 'connect;
                            }
                        }
                        recv(cancel) -> _ => break 'connect,
                    }
                }
                Ok(None) => break,
                Err(Error::Timeout) => {
                    timeouts += 1;
                    if timeouts >= options.max_timeouts {
                        warn!(timeouts, "too many read timeouts, reconnecting");
                        break;
                    }
                }
                // Already logged, and the interface has disconnected.
                Err(_) => break,
            }
        }

        interface.disconnect();
        if !options.auto_reconnect {
            break;
        }
        info!(delay = ?options.reconnect_delay, "reconnecting");
        if wait(cancel, options.reconnect_delay) {
            break;
        }
    }

    interface.disconnect();
    info!("interface thread stopped");
    interface
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLogWriter;
    use crate::packet::ValueType;
    use crate::protocol::{CrcConfig, LengthConfig, PreidentifiedConfig};
    use crate::stream::MemoryStream;
    use crate::Value;

    const CATALOG: &str = r#"{"targets": [{"name": "INST", "packets": [
        {"name": "HEALTH", "items": [
            {"name": "LEN", "bit_size": 8, "data_type": "UINT"},
            {"name": "ID", "bit_size": 8, "data_type": "UINT", "id_value": 1},
            {"name": "TEMP", "bit_size": 16, "data_type": "UINT"}
        ]},
        {"name": "STATUS", "items": [
            {"name": "LEN", "bit_size": 8, "data_type": "UINT"},
            {"name": "ID", "bit_size": 8, "data_type": "UINT", "id_value": 2},
            {"name": "MODE", "bit_size": 8, "data_type": "UINT"}
        ]}
    ]}]}"#;

    fn catalog() -> Arc<Catalog> {
        Arc::new(Catalog::from_json(CATALOG).unwrap())
    }

    fn length_protocol() -> ProtocolConfig {
        ProtocolConfig::Length(
            LengthConfig::builder()
                .bit_size(8)
                .fill_length_and_sync_pattern(true)
                .build(),
        )
    }

    fn interface(stream: &MemoryStream) -> Interface {
        let mut interface = Interface::new("TEST", Arc::new(stream.clone()), catalog());
        interface
            .add_protocol(&length_protocol(), Direction::ReadWrite)
            .unwrap();
        interface.connect().unwrap();
        interface
    }

    #[test]
    fn reads_frames_split_and_merged_across_reads() {
        let stream = MemoryStream::new();
        stream.push_read([4, 1]);
        stream.push_read([0, 7, 3, 2, 9]);
        let mut interface = interface(&stream);

        let packet = interface.read().unwrap().unwrap();
        assert_eq!(packet.packet_name(), Some("HEALTH"));
        assert_eq!(packet.read("TEMP", ValueType::Raw).unwrap(), Value::UInt(7));
        assert_eq!(packet.received_count, 1);
        assert!(packet.received_time.is_some());

        let packet = interface.read().unwrap().unwrap();
        assert_eq!(packet.packet_name(), Some("STATUS"));
        assert_eq!(packet.read("MODE", ValueType::Raw).unwrap(), Value::UInt(9));

        assert!(interface.read().unwrap().is_none());
        assert_eq!(interface.read_count(), 2);
    }

    #[test]
    fn unknown_packets_are_named_unknown() {
        let stream = MemoryStream::new();
        stream.push_read([3, 9, 9]);
        let mut interface = interface(&stream);
        let packet = interface.read().unwrap().unwrap();
        assert_eq!(packet.target_name(), Some(UNKNOWN));
        assert_eq!(packet.packet_name(), Some(UNKNOWN));
        assert_eq!(packet.buffer(), &[3, 9, 9]);
    }

    #[test]
    fn no_protocols_returns_each_read() {
        let stream = MemoryStream::new();
        stream.push_read([4, 1, 0, 1]);
        let mut interface = Interface::new("RAW", Arc::new(stream.clone()), catalog());
        interface.connect().unwrap();
        let packet = interface.read().unwrap().unwrap();
        assert_eq!(packet.packet_name(), Some("HEALTH"));
    }

    #[test]
    fn protocol_error_resyncs_and_continues() {
        let stream = MemoryStream::new();
        stream.push_read([0]);
        stream.push_read([4, 1, 0, 5]);
        let mut interface = interface(&stream);
        let packet = interface.read().unwrap().unwrap();
        assert_eq!(packet.read("TEMP", ValueType::Raw).unwrap(), Value::UInt(5));
    }

    #[test]
    fn crc_failures_are_dropped_without_stopping() {
        let stream = MemoryStream::new();
        let mut interface = Interface::new("CRC", Arc::new(stream.clone()), catalog());
        interface
            .add_protocol(&length_protocol(), Direction::ReadWrite)
            .unwrap();
        interface
            .add_protocol(
                &ProtocolConfig::Crc(CrcConfig::builder().bit_size(16).strip_crc(true).build()),
                Direction::ReadWrite,
            )
            .unwrap();
        interface.connect().unwrap();

        // The length field counts the CRC.
        let mut good = Packet::from_buffer(vec![6, 1, 0, 3]);
        good.set_names("INST", "HEALTH");
        interface.write(good.clone()).unwrap();
        interface.write(good).unwrap();
        let written = stream.written();
        assert_eq!(written.len(), 2);
        let mut corrupt = written[0].clone();
        corrupt[3] ^= 0xFF;
        stream.push_read(corrupt);
        stream.push_read(written[1].clone());

        let packet = interface.read().unwrap().unwrap();
        assert_eq!(packet.packet_name(), Some("HEALTH"));
        assert_eq!(packet.buffer(), &[6, 1, 0, 3]);
    }

    #[test]
    fn write_runs_protocols_in_reverse_order() {
        let stream = MemoryStream::new();
        let interface = interface(&stream);
        let mut packet = Packet::from_buffer(vec![0, 2, 1]);
        packet.set_names("INST", "STATUS");
        interface.write(packet).unwrap();
        interface.write_raw(&[0xAB]).unwrap();
        assert_eq!(stream.written(), vec![vec![3, 2, 1], vec![0xAB]]);
        assert_eq!(interface.writer().write_count(), 2);
    }

    #[test]
    fn stages_and_log_writer_see_packets() {
        let stream = MemoryStream::new();
        stream.push_read([4, 1, 0, 2]);
        let mut interface = interface(&stream);
        interface.add_stage(|packet| {
            packet.write("TEMP", 99, ValueType::Raw).unwrap();
        });
        let log = MemoryLogWriter::new();
        interface.set_log_writer(Box::new(log.clone()));

        let packet = interface.read().unwrap().unwrap();
        assert_eq!(packet.read("TEMP", ValueType::Raw).unwrap(), Value::UInt(99));
        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].header.packet_name, "HEALTH");
        assert_eq!(entries[0].buffer, vec![4, 1, 0, 99]);
    }

    #[test]
    fn overrides_apply_through_handle() {
        let stream = MemoryStream::new();
        stream.push_read([4, 1, 0, 2]);
        let mut interface = interface(&stream);
        interface
            .add_protocol(&ProtocolConfig::Override, Direction::Read)
            .unwrap();
        interface
            .overrides()
            .set("INST", "HEALTH", "TEMP", 42, ValueType::Raw)
            .unwrap();
        let packet = interface.read().unwrap().unwrap();
        assert_eq!(packet.read("TEMP", ValueType::Raw).unwrap(), Value::UInt(42));
    }

    #[test]
    fn timeout_keeps_connection() {
        let stream = MemoryStream::new();
        stream.push_timeout();
        stream.push_read([4, 1, 0, 2]);
        let mut interface = interface(&stream);
        assert!(matches!(interface.read(), Err(Error::Timeout)));
        assert!(interface.connected());
        assert!(interface.read().unwrap().is_some());
    }

    #[test]
    fn preidentified_names_are_kept() {
        let stream = MemoryStream::new();
        let mut interface = Interface::new("PRE", Arc::new(stream.clone()), catalog());
        interface
            .add_protocol(
                &ProtocolConfig::Preidentified(PreidentifiedConfig::default()),
                Direction::ReadWrite,
            )
            .unwrap();
        interface.connect().unwrap();

        let mut packet = Packet::from_buffer(vec![3, 2, 5]);
        packet.set_names("INST", "STATUS");
        packet.stored = true;
        interface.write(packet).unwrap();
        stream.push_read(stream.written()[0].clone());

        let packet = interface.read().unwrap().unwrap();
        assert_eq!(packet.packet_name(), Some("STATUS"));
        assert!(packet.stored);
        assert_eq!(packet.read("MODE", ValueType::Raw).unwrap(), Value::UInt(5));
    }

    #[test]
    fn from_config() {
        let json = r#"{
            "name": "INST_INT",
            "stream": {"type": "TCP", "host": "127.0.0.1", "read_port": 9999},
            "protocols": [
                {"protocol": {"type": "LENGTH", "bit_size": 8}},
                {"protocol": {"type": "OVERRIDE"}, "direction": "READ"}
            ],
            "target_names": ["INST"]
        }"#;
        let config: InterfaceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.protocols[0].direction, Direction::ReadWrite);
        let interface = Interface::from_config(&config, catalog()).unwrap();
        assert_eq!(interface.name(), "INST_INT");
        assert_eq!(interface.read_protocols.len(), 2);
        assert_eq!(lock(&interface.writer.protocols).len(), 1);
        assert!(!interface.connected());
    }

    #[test]
    fn thread_sends_packets_and_stops_on_cancel() {
        let stream = MemoryStream::new();
        stream.push_read([4, 1, 0, 1, 4, 1, 0, 2]);
        let mut interface = Interface::new("THREAD", Arc::new(stream.clone()), catalog());
        interface
            .add_protocol(&length_protocol(), Direction::Read)
            .unwrap();

        let (thread, rx) = InterfaceThread::spawn(
            interface,
            ThreadOptions::builder()
                .reconnect_delay(Duration::from_millis(10))
                .build(),
        )
        .unwrap();
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.read("TEMP", ValueType::Raw).unwrap(), Value::UInt(1));
        assert_eq!(second.read("TEMP", ValueType::Raw).unwrap(), Value::UInt(2));

        let interface = thread.join().unwrap();
        assert_eq!(interface.read_count(), 2);
        assert!(!interface.connected());
        assert!(stream.connects() >= 1);
    }

    #[test]
    fn thread_reconnects_after_timeouts() {
        let stream = MemoryStream::new();
        stream.push_timeout();
        stream.push_timeout();
        stream.push_read([4, 1, 0, 8]);
        let interface = Interface::new("RETRY", Arc::new(stream.clone()), catalog());

        let (thread, rx) = InterfaceThread::spawn(
            interface,
            ThreadOptions::builder()
                .max_timeouts(2)
                .reconnect_delay(Duration::from_millis(10))
                .build(),
        )
        .unwrap();
        let packet = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(packet.packet_name(), Some("HEALTH"));
        drop(rx);
        thread.cancel();
        thread.join().unwrap();
        assert!(stream.connects() >= 2);
    }
}
