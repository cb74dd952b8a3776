//! Packet logging and replay.
//!
//! Logs are streams of preidentified frames, so a log file can be replayed with
//! [PacketLogReader] or through an interface using a
//! [PreidentifiedProtocol](crate::protocol::PreidentifiedProtocol).
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::catalog::Catalog;
use crate::packet::Packet;
use crate::protocol::{
    FrameHeader, PacketOutcome, PreidentifiedConfig, PreidentifiedProtocol, Protocol,
    ReadOutcome,
};
use crate::Result;

/// Receives every packet an interface reads.
pub trait PacketLogWriter: Send {
    /// # Errors
    /// Implementation specific, generally I/O errors.
    fn write_packet_log_entry(&mut self, buffer: &[u8], meta: &FrameHeader) -> Result<()>;

    /// # Errors
    /// Implementation specific, generally I/O errors.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writes log entries as preidentified frames.
#[derive(Debug)]
pub struct PreidentifiedLogWriter<W: Write> {
    writer: W,
    sync_pattern: Option<Vec<u8>>,
    entries: u64,
}

impl PreidentifiedLogWriter<BufWriter<File>> {
    /// Create, or truncate, a log file at `path`.
    ///
    /// # Errors
    /// If the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "opened packet log");
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> PreidentifiedLogWriter<W> {
    pub fn new(writer: W) -> Self {
        PreidentifiedLogWriter {
            writer,
            sync_pattern: None,
            entries: 0,
        }
    }

    /// Prefix every frame with `sync_pattern`.
    #[must_use]
    pub fn with_sync_pattern(mut self, sync_pattern: Vec<u8>) -> Self {
        self.sync_pattern = Some(sync_pattern);
        self
    }

    /// Number of entries written.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> PacketLogWriter for PreidentifiedLogWriter<W> {
    fn write_packet_log_entry(&mut self, buffer: &[u8], meta: &FrameHeader) -> Result<()> {
        let frame = meta.encode(self.sync_pattern.as_deref(), buffer)?;
        self.writer.write_all(&frame)?;
        self.entries += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// A logged packet.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub header: FrameHeader,
    pub buffer: Vec<u8>,
}

/// Collects log entries in memory. Clones share entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogWriter {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl MemoryLogWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PacketLogWriter for MemoryLogWriter {
    fn write_packet_log_entry(&mut self, buffer: &[u8], meta: &FrameHeader) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LogEntry {
                header: meta.clone(),
                buffer: buffer.to_vec(),
            });
        Ok(())
    }
}

/// Reads packets back from a preidentified log.
pub struct PacketLogReader<R: Read> {
    reader: R,
    protocol: PreidentifiedProtocol,
    catalog: Option<Arc<Catalog>>,
    chunk: Vec<u8>,
}

impl PacketLogReader<BufReader<File>> {
    /// # Errors
    /// If the file cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?), None))
    }
}

impl<R: Read> PacketLogReader<R> {
    pub fn new(reader: R, sync_pattern: Option<Vec<u8>>) -> Self {
        let mut protocol = PreidentifiedProtocol::new(PreidentifiedConfig {
            sync_pattern,
            ..PreidentifiedConfig::default()
        });
        protocol.set_last_read_protocol(true);
        PacketLogReader {
            reader,
            protocol,
            catalog: None,
            chunk: vec![0u8; 8192],
        }
    }

    /// Define replayed packets with items from `catalog`.
    #[must_use]
    pub fn with_catalog(mut self, catalog: Arc<Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Return the next logged packet, or `None` at the end of the log.
    ///
    /// # Errors
    /// I/O errors, or [crate::Error::Protocol] for a corrupt log.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        let mut data: &[u8] = &[];
        loop {
            match self.protocol.read_data(data)? {
                ReadOutcome::Data(frame) => {
                    let PacketOutcome::Packet(mut packet) =
                        self.protocol.read_packet(Packet::from_buffer(frame))?
                    else {
                        continue;
                    };
                    if let Some(catalog) = &self.catalog {
                        packet = catalog.identify_and_define(packet, None);
                    }
                    return Ok(Some(packet));
                }
                ReadOutcome::Stop => {}
                ReadOutcome::Disconnect => return Ok(None),
            }
            let n = self.reader.read(&mut self.chunk)?;
            if n == 0 {
                return Ok(None);
            }
            data = &self.chunk[..n];
        }
    }
}

impl<R: Read> Iterator for PacketLogReader<R> {
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_packet().transpose()
    }
}
