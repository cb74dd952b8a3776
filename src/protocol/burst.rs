use serde::{Deserialize, Serialize};
use tracing::warn;
use typed_builder::TypedBuilder;

use super::{EmptyData, PacketOutcome, Protocol, ReadOutcome};
use crate::accessor::{self, DataType, Endianness, Overflow};
use crate::packet::Packet;
use crate::value::hex_summary;
use crate::{Result, Value};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct BurstConfig {
    /// Bytes removed from the front of every frame before it is passed on.
    #[builder(default)]
    #[serde(default)]
    pub discard_leading_bytes: usize,
    /// Pattern marking the start of every frame.
    #[builder(default, setter(strip_option))]
    #[serde(default, with = "super::hex_pattern")]
    pub sync_pattern: Option<Vec<u8>>,
    /// Write the sync pattern into outgoing data.
    #[builder(default)]
    #[serde(default)]
    pub fill_fields: bool,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub allow_empty_data: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    Searching,
    Found,
}

/// Byte accumulator with sync pattern search shared by the framing protocols.
///
/// Framing protocols supply a reduce function that removes at most one frame from the
/// front of the accumulator.
#[derive(Debug)]
pub(crate) struct Framer {
    pub data: Vec<u8>,
    sync_state: SyncState,
    pub discard_leading_bytes: usize,
    pub sync_pattern: Option<Vec<u8>>,
    pub fill_fields: bool,
    pub empty: EmptyData,
}

impl Framer {
    pub fn new(config: BurstConfig) -> Self {
        Framer {
            data: Vec::new(),
            sync_state: SyncState::Searching,
            discard_leading_bytes: config.discard_leading_bytes,
            sync_pattern: config.sync_pattern.filter(|p| !p.is_empty()),
            fill_fields: config.fill_fields,
            empty: EmptyData::new(config.allow_empty_data),
        }
    }

    pub fn reset(&mut self) {
        self.data.clear();
        self.sync_state = SyncState::Searching;
    }

    /// Skip past the current frame start. Without a sync pattern there is no way to
    /// find the next frame start, so everything buffered is dropped.
    pub fn resync(&mut self) {
        if self.sync_pattern.is_some() && !self.data.is_empty() {
            self.data.drain(..1);
            self.sync_state = SyncState::Searching;
        } else {
            self.reset();
        }
    }

    /// Buffer `data`, align to the sync pattern, and apply `reduce` to pull out a frame.
    pub fn read_data<F>(&mut self, data: &[u8], reduce: F) -> Result<ReadOutcome>
    where
        F: FnOnce(&mut Vec<u8>) -> Result<ReadOutcome>,
    {
        self.data.extend_from_slice(data);

        if !self.sync() {
            return Ok(self.stop(data));
        }

        match reduce(&mut self.data)? {
            ReadOutcome::Data(mut frame) => {
                self.sync_state = SyncState::Searching;
                if self.discard_leading_bytes > 0 {
                    frame.drain(..self.discard_leading_bytes.min(frame.len()));
                }
                Ok(ReadOutcome::Data(frame))
            }
            ReadOutcome::Stop => Ok(self.stop(data)),
            ReadOutcome::Disconnect => Ok(ReadOutcome::Disconnect),
        }
    }

    fn stop(&self, data: &[u8]) -> ReadOutcome {
        if data.is_empty() {
            self.empty.pass(data)
        } else {
            ReadOutcome::Stop
        }
    }

    /// Discard bytes until the accumulator starts with the sync pattern. Returns false
    /// if more data is needed.
    fn sync(&mut self) -> bool {
        let Some(pattern) = self.sync_pattern.as_deref() else {
            return true;
        };
        if self.sync_state == SyncState::Found {
            return true;
        }
        loop {
            if self.data.len() < pattern.len() {
                return false;
            }
            let Some(idx) = self.data.iter().position(|b| *b == pattern[0]) else {
                log_discard(&self.data, self.data.len(), false);
                self.data.clear();
                return false;
            };
            if self.data.len() < idx + pattern.len() {
                return false;
            }
            if self.data[idx..idx + pattern.len()] == *pattern {
                if idx != 0 {
                    log_discard(&self.data, idx, true);
                    self.data.drain(..idx);
                }
                self.sync_state = SyncState::Found;
                return true;
            }
            log_discard(&self.data, idx + 1, false);
            self.data.drain(..=idx);
        }
    }

    /// Write the sync pattern at the start of the packet when filling fields without
    /// leading discard bytes.
    pub fn write_packet(&self, mut packet: Packet) -> Result<PacketOutcome> {
        if self.fill_fields && self.discard_leading_bytes == 0 {
            if let Some(pattern) = &self.sync_pattern {
                write_pattern(pattern, packet.buffer_mut())?;
            }
        }
        Ok(PacketOutcome::Packet(packet))
    }

    /// Restore discarded leading bytes, filled with the sync pattern if there is one.
    pub fn write_data(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        if !self.fill_fields || self.discard_leading_bytes == 0 {
            return Ok(data);
        }
        let mut out = vec![0u8; self.discard_leading_bytes];
        out.extend_from_slice(&data);
        if let Some(pattern) = &self.sync_pattern {
            write_pattern(pattern, &mut out)?;
        }
        Ok(out)
    }
}

fn write_pattern(pattern: &[u8], buffer: &mut Vec<u8>) -> Result<()> {
    accessor::write(
        &Value::Block(pattern.to_vec()),
        0,
        (pattern.len() * 8) as i64,
        DataType::Block,
        buffer,
        Endianness::Big,
        Overflow::Error,
    )
}

fn log_discard(data: &[u8], len: usize, found: bool) {
    warn!(
        discarded = len,
        starting = %hex_summary(data, 6),
        "sync {}found, discarding bytes",
        if found { "" } else { "not " }
    );
}

/// Treats all currently buffered data as one frame.
#[derive(Debug)]
pub struct BurstProtocol {
    framer: Framer,
}

impl BurstProtocol {
    #[must_use]
    pub fn new(config: BurstConfig) -> Self {
        BurstProtocol {
            framer: Framer::new(config),
        }
    }
}

impl Protocol for BurstProtocol {
    fn name(&self) -> &'static str {
        "burst"
    }

    fn read_data(&mut self, data: &[u8]) -> Result<ReadOutcome> {
        self.framer.read_data(data, |buf| {
            if buf.is_empty() {
                return Ok(ReadOutcome::Stop);
            }
            Ok(ReadOutcome::Data(std::mem::take(buf)))
        })
    }

    fn write_packet(&mut self, packet: Packet) -> Result<PacketOutcome> {
        self.framer.write_packet(packet)
    }

    fn write_data(&mut self, data: Vec<u8>) -> Result<ReadOutcome> {
        Ok(ReadOutcome::Data(self.framer.write_data(data)?))
    }

    fn reset(&mut self) {
        self.framer.reset();
    }

    fn resync(&mut self) {
        self.framer.resync();
    }

    fn set_last_read_protocol(&mut self, last: bool) {
        self.framer.empty.last = last;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn sync_burst(discard: usize, fill: bool) -> BurstProtocol {
        let mut p = BurstProtocol::new(
            BurstConfig::builder()
                .discard_leading_bytes(discard)
                .sync_pattern(vec![0x12, 0x34, 0x56, 0x78])
                .fill_fields(fill)
                .build(),
        );
        p.set_last_read_protocol(true);
        p
    }

    #[test]
    fn passes_all_data() {
        let mut p = BurstProtocol::new(BurstConfig::default());
        p.set_last_read_protocol(true);
        assert_eq!(p.read_data(&[1, 2, 3]).unwrap(), ReadOutcome::Data(vec![1, 2, 3]));
        assert_eq!(p.read_data(&[]).unwrap(), ReadOutcome::Stop);
    }

    #[test]
    fn empty_data_passes_when_not_last() {
        let mut p = BurstProtocol::new(BurstConfig::default());
        p.set_last_read_protocol(false);
        assert_eq!(p.read_data(&[]).unwrap(), ReadOutcome::Data(vec![]));
    }

    #[test]
    fn discards_leading_bytes() {
        let mut p = BurstProtocol::new(BurstConfig::builder().discard_leading_bytes(2).build());
        assert_eq!(
            p.read_data(&[1, 2, 3, 4]).unwrap(),
            ReadOutcome::Data(vec![3, 4])
        );
    }

    #[test]
    fn sync_split_across_reads() {
        let mut p = sync_burst(0, false);
        assert_eq!(p.read_data(&[0x00, 0x12, 0x34]).unwrap(), ReadOutcome::Stop);
        assert_eq!(
            p.read_data(&[0x56, 0x78, 0xAA]).unwrap(),
            ReadOutcome::Data(vec![0x12, 0x34, 0x56, 0x78, 0xAA])
        );
    }

    #[test]
    fn sync_false_positive_is_skipped() {
        let mut p = sync_burst(4, false);
        assert_eq!(
            p.read_data(&[0x12, 0x34, 0x12, 0x34, 0x56, 0x78, 0xBB]).unwrap(),
            ReadOutcome::Data(vec![0xBB])
        );
    }

    #[test]
    fn no_sync_discards_everything() {
        let mut p = sync_burst(0, false);
        assert_eq!(p.read_data(&[0, 1, 2, 3, 4]).unwrap(), ReadOutcome::Stop);
        assert!(p.framer.data.is_empty());
    }

    #[test]
    fn fill_fields_writes_sync_into_packet() {
        let mut p = sync_burst(0, true);
        let packet = Packet::from_buffer(vec![0; 6]);
        let PacketOutcome::Packet(packet) = p.write_packet(packet).unwrap() else {
            panic!("expected packet");
        };
        assert_eq!(packet.buffer(), &[0x12, 0x34, 0x56, 0x78, 0, 0]);

        let short = Packet::from_buffer(vec![0; 2]);
        assert!(matches!(p.write_packet(short), Err(Error::Bounds(_))));
    }

    #[test]
    fn fill_fields_restores_discarded_sync() {
        let mut p = sync_burst(4, true);
        assert_eq!(
            p.write_data(vec![0xAA]).unwrap(),
            ReadOutcome::Data(vec![0x12, 0x34, 0x56, 0x78, 0xAA])
        );
    }

    #[test]
    fn resync_skips_one_byte() {
        let mut p = sync_burst(0, false);
        p.framer.data = vec![0x12, 0x34, 0x56, 0x78, 0x12, 0x34, 0x56, 0x78];
        p.framer.sync_state = SyncState::Found;
        p.resync();
        assert_eq!(p.framer.data.len(), 7);
        assert_eq!(
            p.read_data(&[]).unwrap(),
            ReadOutcome::Data(vec![0x12, 0x34, 0x56, 0x78])
        );
    }
}
