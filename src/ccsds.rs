//! CCSDS space packet primary header and segmented packet reassembly.
//!
//! References:
//! * CCSDS Space Packet Protocol 133.0-B-2
//!     - <https://public.ccsds.org/Pubs/133x0b2e1.pdf>
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{Error, Result};

pub type Apid = u16;

/// Packet is the first packet in a packet group
pub const SEQ_FIRST: u8 = 1;
/// Packet is a part of a packet group, but not first and not last
pub const SEQ_CONTINUATION: u8 = 0;
/// Packet is the last packet in a packet group
pub const SEQ_LAST: u8 = 2;
/// Packet is not part of a packet group, i.e., standalone.
pub const SEQ_UNSEGMENTED: u8 = 3;

/// CCSDS Primary Header
///
/// The primary header format is common to all CCSDS space packets.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct PrimaryHeader {
    pub version: u8,
    pub type_flag: u8,
    pub has_secondary_header: bool,
    pub apid: Apid,
    /// Defines a packets grouping. See the `SEQ_*` values.
    pub sequence_flags: u8,
    pub sequence_id: u16,
    /// Number of bytes following the header minus 1.
    pub len_minus1: u16,
}

impl PrimaryHeader {
    /// Size of a ``PrimaryHeader``
    pub const LEN: usize = 6;
    pub const SEQ_MAX: u16 = 16383;

    /// Decode from bytes. Returns `None` if there are not enough bytes to construct the
    /// header.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN {
            return None;
        }
        let d1 = u16::from_be_bytes([buf[0], buf[1]]);
        let d2 = u16::from_be_bytes([buf[2], buf[3]]);
        let d3 = u16::from_be_bytes([buf[4], buf[5]]);

        Some(PrimaryHeader {
            version: (d1 >> 13 & 0x7) as u8,
            type_flag: (d1 >> 12 & 0x1) as u8,
            has_secondary_header: (d1 >> 11 & 0x1) == 1,
            apid: (d1 & 0x7ff),
            sequence_flags: (d2 >> 14 & 0x3) as u8,
            sequence_id: (d2 & 0x3fff),
            len_minus1: d3,
        })
    }

    /// Encode to bytes. Fields wider than their bit allocation are truncated.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        let d1 = (u16::from(self.version) & 0x7) << 13
            | (u16::from(self.type_flag) & 0x1) << 12
            | u16::from(self.has_secondary_header) << 11
            | (self.apid & 0x7ff);
        let d2 = (u16::from(self.sequence_flags) & 0x3) << 14 | (self.sequence_id & 0x3fff);
        let mut out = [0u8; Self::LEN];
        out[..2].copy_from_slice(&d1.to_be_bytes());
        out[2..4].copy_from_slice(&d2.to_be_bytes());
        out[4..].copy_from_slice(&self.len_minus1.to_be_bytes());
        out
    }
}

/// Calculate the number of missing sequence ids.
///
/// `cur` is the current sequence id. `last` is the sequence id seen before `cur`. Only
/// the low 14 bits of each are used.
#[must_use]
pub fn missing_packets(cur: u16, last: u16) -> u16 {
    let cur = cur & PrimaryHeader::SEQ_MAX;
    let expected = next_sequence(last);
    cur.wrapping_sub(expected) & PrimaryHeader::SEQ_MAX
}

fn next_sequence(seq: u16) -> u16 {
    seq.wrapping_add(1) & PrimaryHeader::SEQ_MAX
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParserState {
    /// No partial packet buffered.
    Ready,
    /// Accumulating the segments of a packet group.
    InProgress,
}

/// Reassembles CCSDS packet groups split across multiple segments.
///
/// The reassembled packet is the header of the first segment, with its length field
/// updated, followed by the user data of every segment in order.
///
/// # Example
/// ```
/// use cmdtlm::ccsds::CcsdsParser;
///
/// let mut parser = CcsdsParser::default();
/// // first, then last, apid 100, sequence counts 7 and 8
/// let first = [0x00, 100, 0x40, 7, 0, 0, 0xAA];
/// let last = [0x00, 100, 0x80, 8, 0, 0, 0xBB];
/// assert_eq!(parser.unsegment_packet(&first).unwrap(), None);
/// let packet = parser.unsegment_packet(&last).unwrap().unwrap();
/// assert_eq!(&packet[6..], &[0xAA, 0xBB]);
/// ```
#[derive(Debug, Clone)]
pub struct CcsdsParser {
    state: ParserState,
    in_progress_data: Vec<u8>,
    sequence_count: Option<u16>,
    unsegmented_data: Option<Vec<u8>>,
}

impl Default for CcsdsParser {
    fn default() -> Self {
        Self::new()
    }
}

impl CcsdsParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ParserState::Ready,
            in_progress_data: Vec::new(),
            sequence_count: None,
            unsegmented_data: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Sequence count of the last accepted segment.
    #[must_use]
    pub fn sequence_count(&self) -> Option<u16> {
        self.sequence_count
    }

    #[must_use]
    pub fn in_progress_data(&self) -> &[u8] {
        &self.in_progress_data
    }

    /// The most recent complete packet.
    #[must_use]
    pub fn unsegmented_data(&self) -> Option<&[u8]> {
        self.unsegmented_data.as_deref()
    }

    /// Drop any partial packet and return to [ParserState::Ready].
    pub fn reset(&mut self) {
        self.state = ParserState::Ready;
        self.in_progress_data.clear();
    }

    fn fail(&mut self, msg: String) -> Error {
        self.reset();
        debug!("{msg}");
        Error::Segmentation(msg)
    }

    /// Feed one segment. Returns the complete packet when `buffer` finishes a packet
    /// group or is standalone, or `None` while a group is still in progress.
    ///
    /// # Errors
    /// [Error::Segmentation] for out of order or missing segments. The parser is always
    /// reset to [ParserState::Ready] before an error is returned. A standalone packet that
    /// interrupts a group is an error, however it is still recorded as the most recent
    /// complete packet, see [CcsdsParser::unsegmented_data].
    pub fn unsegment_packet(&mut self, buffer: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(header) = PrimaryHeader::decode(buffer) else {
            return Err(self.fail(format!(
                "{} bytes is too short for a CCSDS primary header",
                buffer.len()
            )));
        };
        trace!(apid = header.apid, flags = header.sequence_flags, seq = header.sequence_id, "segment");

        match header.sequence_flags {
            SEQ_UNSEGMENTED => {
                let interrupted = self.state == ParserState::InProgress;
                self.reset();
                self.sequence_count = Some(header.sequence_id);
                self.unsegmented_data = Some(buffer.to_vec());
                if interrupted {
                    return Err(Error::Segmentation(
                        "standalone packet received while a packet group was in progress"
                            .to_string(),
                    ));
                }
                Ok(Some(buffer.to_vec()))
            }
            SEQ_FIRST => {
                if self.state == ParserState::InProgress {
                    return Err(self.fail("unexpected first segment".to_string()));
                }
                self.in_progress_data = buffer.to_vec();
                self.sequence_count = Some(header.sequence_id);
                self.state = ParserState::InProgress;
                Ok(None)
            }
            flags => {
                let kind = if flags == SEQ_LAST { "last" } else { "continuation" };
                if self.state != ParserState::InProgress {
                    return Err(self.fail(format!("unexpected {kind} segment")));
                }
                let expected = self.sequence_count.map_or(0, next_sequence);
                if header.sequence_id != expected {
                    return Err(self.fail(format!(
                        "{kind} segment with sequence count {} when {expected} was expected",
                        header.sequence_id
                    )));
                }
                self.sequence_count = Some(header.sequence_id);
                self.in_progress_data.extend_from_slice(&buffer[PrimaryHeader::LEN..]);
                if flags != SEQ_LAST {
                    return Ok(None);
                }

                let mut packet = std::mem::take(&mut self.in_progress_data);
                let data_len = packet.len() - PrimaryHeader::LEN;
                let Ok(len_minus1) = u16::try_from(data_len.saturating_sub(1)) else {
                    return Err(self.fail(format!(
                        "reassembled packet of {} bytes is too large",
                        packet.len()
                    )));
                };
                packet[4..6].copy_from_slice(&len_minus1.to_be_bytes());
                self.reset();
                self.unsegmented_data = Some(packet.clone());
                Ok(Some(packet))
            }
        }
    }
}
