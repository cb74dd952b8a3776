//! Self describing frames carrying packet names, receive time and metadata.
//!
//! Frame layout, all integers big endian:
//!
//! | field        | size                              |
//! |--------------|-----------------------------------|
//! | sync pattern | optional, configured              |
//! | flags        | 1, `0x80` stored, `0x40` has extra |
//! | extra        | u32 length + JSON object, if flagged |
//! | seconds      | 4                                 |
//! | microseconds | 4                                 |
//! | target name  | u8 length + bytes                 |
//! | packet name  | u8 length + bytes                 |
//! | data         | u32 length + bytes                |
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use typed_builder::TypedBuilder;

use super::{BurstConfig, Framer, PacketOutcome, Protocol, ReadOutcome};
use crate::packet::{Packet, UNKNOWN};
use crate::{Error, Result};

const STORED_FLAG: u8 = 0x80;
const EXTRA_FLAG: u8 = 0x40;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct PreidentifiedConfig {
    #[builder(default, setter(strip_option))]
    #[serde(default, with = "super::hex_pattern")]
    pub sync_pattern: Option<Vec<u8>>,
    /// Largest accepted extra or data length.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub max_length: Option<u32>,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub allow_empty_data: Option<bool>,
}

/// Packet metadata carried by a preidentified frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameHeader {
    pub received_time: DateTime<Utc>,
    pub target_name: String,
    pub packet_name: String,
    pub stored: bool,
    pub extra: Option<Map<String, JsonValue>>,
}

impl FrameHeader {
    /// Header for `packet`, using the current time and [UNKNOWN] names where the packet
    /// has none.
    #[must_use]
    pub fn from_packet(packet: &Packet) -> Self {
        FrameHeader {
            received_time: packet.received_time.unwrap_or_else(Utc::now),
            target_name: packet.target_name().unwrap_or(UNKNOWN).to_string(),
            packet_name: packet.packet_name().unwrap_or(UNKNOWN).to_string(),
            stored: packet.stored,
            extra: packet.extra.clone(),
        }
    }

    /// Frame `data` with this header.
    ///
    /// # Errors
    /// [Error::Protocol] if a name is longer than 255 bytes or the data longer than
    /// `u32::MAX` bytes.
    pub fn encode(&self, sync_pattern: Option<&[u8]>, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() + 32);
        if let Some(sync) = sync_pattern {
            out.extend_from_slice(sync);
        }

        let mut flags = 0u8;
        if self.stored {
            flags |= STORED_FLAG;
        }
        if self.extra.is_some() {
            flags |= EXTRA_FLAG;
        }
        out.push(flags);
        if let Some(extra) = &self.extra {
            let json = serde_json::to_vec(extra)?;
            out.extend_from_slice(&u32_len(json.len())?.to_be_bytes());
            out.extend_from_slice(&json);
        }

        let secs = u32::try_from(self.received_time.timestamp()).map_err(|_| {
            Error::Protocol(format!("time {} not representable", self.received_time))
        })?;
        out.extend_from_slice(&secs.to_be_bytes());
        out.extend_from_slice(&self.received_time.timestamp_subsec_micros().to_be_bytes());

        for name in [&self.target_name, &self.packet_name] {
            let len = u8::try_from(name.len())
                .map_err(|_| Error::Protocol(format!("name too long: {name}")))?;
            out.push(len);
            out.extend_from_slice(name.as_bytes());
        }

        out.extend_from_slice(&u32_len(data.len())?.to_be_bytes());
        out.extend_from_slice(data);
        Ok(out)
    }
}

fn u32_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::Protocol(format!("length {len} exceeds u32")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    SyncRemoved,
    NeedExtra,
    FlagsRemoved,
    TimeRemoved,
    TargetNameRemoved,
    PacketNameRemoved,
}

/// Incremental frame parser. Each field is consumed only once complete, so progress
/// survives any number of short reads.
#[derive(Debug)]
struct Reader {
    state: State,
    sync_len: usize,
    max_length: Option<u32>,
    stored: bool,
    extra: Option<Map<String, JsonValue>>,
    received_time: Option<DateTime<Utc>>,
    target_name: Option<String>,
    packet_name: Option<String>,
}

impl Reader {
    fn reduce(&mut self, buf: &mut Vec<u8>) -> Result<ReadOutcome> {
        loop {
            match self.state {
                State::Start => {
                    if buf.len() < self.sync_len {
                        return Ok(ReadOutcome::Stop);
                    }
                    buf.drain(..self.sync_len);
                    self.state = State::SyncRemoved;
                }
                State::SyncRemoved => {
                    let Some(&flags) = buf.first() else {
                        return Ok(ReadOutcome::Stop);
                    };
                    buf.drain(..1);
                    self.stored = flags & STORED_FLAG != 0;
                    self.extra = None;
                    self.state = if flags & EXTRA_FLAG != 0 {
                        State::NeedExtra
                    } else {
                        State::FlagsRemoved
                    };
                }
                State::NeedExtra => {
                    let Some(json) = take_prefixed(buf, 4, self.max_length)? else {
                        return Ok(ReadOutcome::Stop);
                    };
                    match serde_json::from_slice(&json) {
                        Ok(JsonValue::Object(map)) => self.extra = Some(map),
                        Ok(other) => {
                            return Err(Error::Protocol(format!(
                                "extra data must be a JSON object, got {other}"
                            )))
                        }
                        Err(err) => return Err(Error::Protocol(format!("invalid extra data: {err}"))),
                    }
                    self.state = State::FlagsRemoved;
                }
                State::FlagsRemoved => {
                    if buf.len() < 8 {
                        return Ok(ReadOutcome::Stop);
                    }
                    let secs = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
                    let usecs = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
                    buf.drain(..8);
                    self.received_time = DateTime::from_timestamp(i64::from(secs), 0)
                        .map(|t| t + Duration::microseconds(i64::from(usecs)));
                    self.state = State::TimeRemoved;
                }
                State::TimeRemoved => {
                    let Some(name) = take_prefixed(buf, 1, None)? else {
                        return Ok(ReadOutcome::Stop);
                    };
                    self.target_name = Some(String::from_utf8_lossy(&name).into_owned());
                    self.state = State::TargetNameRemoved;
                }
                State::TargetNameRemoved => {
                    let Some(name) = take_prefixed(buf, 1, None)? else {
                        return Ok(ReadOutcome::Stop);
                    };
                    self.packet_name = Some(String::from_utf8_lossy(&name).into_owned());
                    self.state = State::PacketNameRemoved;
                }
                State::PacketNameRemoved => {
                    let Some(data) = take_prefixed(buf, 4, self.max_length)? else {
                        return Ok(ReadOutcome::Stop);
                    };
                    self.state = State::Start;
                    return Ok(ReadOutcome::Data(data));
                }
            }
        }
    }
}

/// Remove a length prefixed field of `width` length bytes from the front of `buf`.
fn take_prefixed(buf: &mut Vec<u8>, width: usize, max_length: Option<u32>) -> Result<Option<Vec<u8>>> {
    if buf.len() < width {
        return Ok(None);
    }
    let len = match width {
        1 => usize::from(buf[0]),
        _ => {
            let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
            if let Some(max) = max_length {
                if len > max {
                    return Err(Error::Protocol(format!(
                        "Length value received larger than max_length: {len} > {max}"
                    )));
                }
            }
            len as usize
        }
    };
    if buf.len() < width + len {
        return Ok(None);
    }
    let field = buf[width..width + len].to_vec();
    buf.drain(..width + len);
    Ok(Some(field))
}

/// Reads and writes preidentified frames, e.g., replayed packet logs.
#[derive(Debug)]
pub struct PreidentifiedProtocol {
    framer: Framer,
    reader: Reader,
    write_header: Option<FrameHeader>,
}

impl PreidentifiedProtocol {
    #[must_use]
    pub fn new(config: PreidentifiedConfig) -> Self {
        let sync_len = config.sync_pattern.as_ref().map_or(0, Vec::len);
        PreidentifiedProtocol {
            framer: Framer::new(BurstConfig {
                sync_pattern: config.sync_pattern,
                allow_empty_data: config.allow_empty_data,
                ..BurstConfig::default()
            }),
            reader: Reader {
                state: State::Start,
                sync_len,
                max_length: config.max_length,
                stored: false,
                extra: None,
                received_time: None,
                target_name: None,
                packet_name: None,
            },
            write_header: None,
        }
    }
}

impl Protocol for PreidentifiedProtocol {
    fn name(&self) -> &'static str {
        "preidentified"
    }

    fn read_data(&mut self, data: &[u8]) -> Result<ReadOutcome> {
        let reader = &mut self.reader;
        self.framer.read_data(data, |buf| reader.reduce(buf))
    }

    fn read_packet(&mut self, mut packet: Packet) -> Result<PacketOutcome> {
        let reader = &mut self.reader;
        if let (Some(target_name), Some(packet_name)) =
            (reader.target_name.take(), reader.packet_name.take())
        {
            packet.set_names(&target_name, &packet_name);
        }
        packet.received_time = reader.received_time.take();
        packet.stored = reader.stored;
        packet.extra = reader.extra.take();
        Ok(PacketOutcome::Packet(packet))
    }

    fn write_packet(&mut self, packet: Packet) -> Result<PacketOutcome> {
        self.write_header = Some(FrameHeader::from_packet(&packet));
        Ok(PacketOutcome::Packet(packet))
    }

    fn write_data(&mut self, data: Vec<u8>) -> Result<ReadOutcome> {
        let header = match self.write_header.take() {
            Some(header) => header,
            None => FrameHeader::from_packet(&Packet::from_buffer(Vec::new())),
        };
        Ok(ReadOutcome::Data(
            header.encode(self.framer.sync_pattern.as_deref(), &data)?,
        ))
    }

    fn reset(&mut self) {
        self.framer.reset();
        self.reader.state = State::Start;
    }

    fn resync(&mut self) {
        self.framer.resync();
        self.reader.state = State::Start;
    }

    fn set_last_read_protocol(&mut self, last: bool) {
        self.framer.empty.last = last;
    }
}
