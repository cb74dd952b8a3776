use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::{BurstConfig, Framer, PacketOutcome, Protocol, ReadOutcome};
use crate::packet::Packet;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct TerminatedConfig {
    /// Appended to every written frame.
    #[builder(default, setter(strip_option))]
    #[serde(default, with = "super::hex_pattern")]
    pub write_termination_characters: Option<Vec<u8>>,
    /// Marks the end of every received frame.
    #[builder(setter(strip_option))]
    #[serde(default, with = "super::hex_pattern")]
    pub read_termination_characters: Option<Vec<u8>>,
    /// Remove the read terminator from received frames.
    #[builder(default = true)]
    #[serde(default = "default_strip")]
    pub strip_read_termination: bool,
    /// Largest number of bytes buffered while looking for a terminator.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub max_length: Option<usize>,
    #[builder(default)]
    #[serde(default)]
    pub discard_leading_bytes: usize,
    #[builder(default, setter(strip_option))]
    #[serde(default, with = "super::hex_pattern")]
    pub sync_pattern: Option<Vec<u8>>,
    #[builder(default)]
    #[serde(default)]
    pub fill_fields: bool,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub allow_empty_data: Option<bool>,
}

fn default_strip() -> bool {
    true
}

#[derive(Debug)]
struct Terminator {
    read: Vec<u8>,
    strip: bool,
    max_length: Option<usize>,
    /// Bytes at the start of a frame not searched for the terminator.
    skip: usize,
}

impl Terminator {
    fn reduce(&self, buf: &mut Vec<u8>) -> Result<ReadOutcome> {
        let found = buf
            .get(self.skip..)
            .and_then(|tail| find(tail, &self.read))
            .map(|idx| idx + self.skip);
        let Some(idx) = found else {
            if let Some(max) = self.max_length {
                if buf.len() > max {
                    return Err(Error::Protocol(format!(
                        "no terminator found in {} bytes, max_length is {max}",
                        buf.len()
                    )));
                }
            }
            return Ok(ReadOutcome::Stop);
        };
        let end = idx + self.read.len();
        let mut frame: Vec<u8> = buf.drain(..end).collect();
        if self.strip {
            frame.truncate(idx);
        }
        Ok(ReadOutcome::Data(frame))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Frames ending in a terminator sequence, e.g., CRLF delimited lines.
#[derive(Debug)]
pub struct TerminatedProtocol {
    framer: Framer,
    terminator: Terminator,
    write_termination: Option<Vec<u8>>,
}

impl TerminatedProtocol {
    /// # Errors
    /// [Error::Configuration] if no read terminator is given.
    pub fn new(config: TerminatedConfig) -> Result<Self> {
        let read = config
            .read_termination_characters
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::Configuration("read_termination_characters are required".to_string())
            })?;
        let skip = config.sync_pattern.as_ref().map_or(0, Vec::len);
        Ok(TerminatedProtocol {
            framer: Framer::new(BurstConfig {
                discard_leading_bytes: config.discard_leading_bytes,
                sync_pattern: config.sync_pattern,
                fill_fields: config.fill_fields,
                allow_empty_data: config.allow_empty_data,
            }),
            terminator: Terminator {
                read,
                strip: config.strip_read_termination,
                max_length: config.max_length,
                skip,
            },
            write_termination: config.write_termination_characters.filter(|t| !t.is_empty()),
        })
    }
}

impl Protocol for TerminatedProtocol {
    fn name(&self) -> &'static str {
        "terminated"
    }

    fn read_data(&mut self, data: &[u8]) -> Result<ReadOutcome> {
        let terminator = &self.terminator;
        self.framer.read_data(data, |buf| terminator.reduce(buf))
    }

    fn write_packet(&mut self, packet: Packet) -> Result<PacketOutcome> {
        self.framer.write_packet(packet)
    }

    fn write_data(&mut self, data: Vec<u8>) -> Result<ReadOutcome> {
        let mut data = self.framer.write_data(data)?;
        if let Some(term) = &self.write_termination {
            if find(&data, term).is_some() {
                return Err(Error::Protocol(
                    "packet contains termination characters".to_string(),
                ));
            }
            data.extend_from_slice(term);
        }
        Ok(ReadOutcome::Data(data))
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

    fn crlf(strip: bool) -> TerminatedProtocol {
        let mut p = TerminatedProtocol::new(
            TerminatedConfig::builder()
                .read_termination_characters(b"\r\n".to_vec())
                .write_termination_characters(b"\r\n".to_vec())
                .strip_read_termination(strip)
                .max_length(16)
                .build(),
        )
        .unwrap();
        p.set_last_read_protocol(true);
        p
    }

    #[test]
    fn splits_on_terminator() {
        let mut p = crlf(true);
        assert_eq!(p.read_data(b"HEL").unwrap(), ReadOutcome::Stop);
        assert_eq!(p.read_data(b"LO\r").unwrap(), ReadOutcome::Stop);
        assert_eq!(p.read_data(b"\nAB\r\n").unwrap(), ReadOutcome::Data(b"HELLO".to_vec()));
        assert_eq!(p.read_data(b"").unwrap(), ReadOutcome::Data(b"AB".to_vec()));
        assert_eq!(p.read_data(b"").unwrap(), ReadOutcome::Stop);
    }

    #[test]
    fn keeps_terminator_when_not_stripping() {
        let mut p = crlf(false);
        assert_eq!(p.read_data(b"OK\r\n").unwrap(), ReadOutcome::Data(b"OK\r\n".to_vec()));
    }

    #[test]
    fn write_appends_terminator() {
        let mut p = crlf(true);
        assert_eq!(
            p.write_data(b"CMD".to_vec()).unwrap(),
            ReadOutcome::Data(b"CMD\r\n".to_vec())
        );
        assert!(matches!(p.write_data(b"A\r\nB".to_vec()), Err(Error::Protocol(_))));
    }

    #[test]
    fn missing_terminator_beyond_max_length() {
        let mut p = crlf(true);
        assert!(matches!(p.read_data(&[b'x'; 17]), Err(Error::Protocol(_))));
        p.resync();
        assert_eq!(p.read_data(b"ok\r\n").unwrap(), ReadOutcome::Data(b"ok".to_vec()));
    }

    #[test]
    fn terminator_inside_sync_is_ignored() {
        let mut p = TerminatedProtocol::new(
            TerminatedConfig::builder()
                .read_termination_characters(vec![0xFF])
                .sync_pattern(vec![0xFF, 0x00])
                .discard_leading_bytes(2)
                .build(),
        )
        .unwrap();
        assert_eq!(
            p.read_data(&[0xFF, 0x00, 1, 2, 0xFF]).unwrap(),
            ReadOutcome::Data(vec![1, 2])
        );
    }

    #[test]
    fn read_terminator_required() {
        let config: TerminatedConfig = serde_json::from_str("{}").unwrap();
        assert!(TerminatedProtocol::new(config).is_err());
    }
}
