use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;
use typed_builder::TypedBuilder;

use super::{BurstConfig, Framer, PacketOutcome, Protocol, ReadOutcome};
use crate::catalog::Catalog;
use crate::packet::Packet;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct FixedConfig {
    /// Packet bytes per frame, not counting discarded leading bytes. If unset, frames
    /// are sized by identifying the data against the catalog.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub length: Option<usize>,
    /// Bytes buffered, including leading bytes, before identification is attempted.
    /// Defaults to the leading bytes plus the furthest id item end among the candidate
    /// packets, so a read split inside an id field waits for more data.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub min_id_size: Option<usize>,
    /// Fail with a protocol error, rather than passing everything buffered as one
    /// frame, when the data cannot be identified.
    #[builder(default)]
    #[serde(default)]
    pub unknown_raise: bool,
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

#[derive(Debug)]
struct Identifier {
    catalog: Arc<Catalog>,
    target_names: Option<Vec<String>>,
    length: Option<usize>,
    min_id_size: usize,
    unknown_raise: bool,
    discard: usize,
    /// Names of the most recently framed packet.
    names: Option<(String, String)>,
}

impl Identifier {
    fn reduce(&mut self, buf: &mut Vec<u8>) -> Result<ReadOutcome> {
        self.names = None;
        if let Some(length) = self.length {
            let frame_length = length + self.discard;
            if buf.is_empty() || buf.len() < frame_length {
                return Ok(ReadOutcome::Stop);
            }
            return Ok(ReadOutcome::Data(buf.drain(..frame_length).collect()));
        }

        if buf.is_empty() || buf.len() < self.min_id_size {
            return Ok(ReadOutcome::Stop);
        }
        let data = buf.get(self.discard..).unwrap_or_default();
        let Some(packet) = self.find(data) else {
            if self.unknown_raise {
                return Err(Error::Protocol(format!(
                    "unknown data received, {} bytes buffered",
                    buf.len()
                )));
            }
            return Ok(ReadOutcome::Data(std::mem::take(buf)));
        };
        let frame_length = packet.defined_length() + self.discard;
        let names = (
            packet.target_name().unwrap_or_default().to_string(),
            packet.packet_name().unwrap_or_default().to_string(),
        );
        if buf.len() < frame_length {
            return Ok(ReadOutcome::Stop);
        }
        debug!(target_name = %names.0, packet_name = %names.1, frame_length, "fixed frame");
        self.names = Some(names);
        Ok(ReadOutcome::Data(buf.drain(..frame_length).collect()))
    }

    fn find(&self, data: &[u8]) -> Option<&Packet> {
        let targets: Vec<&str> = match &self.target_names {
            Some(names) => names.iter().map(String::as_str).collect(),
            None => self.catalog.target_names().collect(),
        };
        targets
            .into_iter()
            .filter_map(|t| self.catalog.packets(t).ok())
            .flat_map(|packets| packets.iter())
            .find(|p| p.identify(data))
    }
}

/// Bytes needed to read every id item of the candidate packets.
fn id_extent(catalog: &Catalog, target_names: Option<&[String]>) -> usize {
    let targets: Vec<&str> = match target_names {
        Some(names) => names.iter().map(String::as_str).collect(),
        None => catalog.target_names().collect(),
    };
    targets
        .into_iter()
        .filter_map(|t| catalog.packets(t).ok())
        .flat_map(|packets| packets.iter())
        .flat_map(|packet| {
            packet.id_items().into_iter().map(move |item| {
                let end = item.bit_offset() + item.total_bit_size();
                if item.bit_offset() < 0 || item.is_variable() {
                    // Position depends on the buffer length.
                    packet.defined_length()
                } else {
                    usize::try_from((end + 7) / 8).unwrap_or_default()
                }
            })
        })
        .max()
        .unwrap_or_default()
}

/// Frames of a fixed size, either configured or taken from the identified packet
/// definition.
#[derive(Debug)]
pub struct FixedProtocol {
    framer: Framer,
    ident: Identifier,
}

impl FixedProtocol {
    /// # Errors
    /// [Error::Configuration] for a zero `length`.
    pub fn new(config: FixedConfig, catalog: Arc<Catalog>) -> Result<Self> {
        Self::with_targets(config, catalog, None)
    }

    /// Identify frames only against the packets of `target_names`.
    ///
    /// # Errors
    /// See [FixedProtocol::new].
    pub fn with_targets(
        config: FixedConfig,
        catalog: Arc<Catalog>,
        target_names: Option<Vec<String>>,
    ) -> Result<Self> {
        if config.length == Some(0) {
            return Err(Error::Configuration("fixed length must be positive".to_string()));
        }
        let min_id_size = match config.min_id_size {
            Some(size) => size,
            None => {
                config.discard_leading_bytes + id_extent(&catalog, target_names.as_deref())
            }
        };
        Ok(FixedProtocol {
            ident: Identifier {
                catalog,
                target_names,
                length: config.length,
                min_id_size,
                unknown_raise: config.unknown_raise,
                discard: config.discard_leading_bytes,
                names: None,
            },
            framer: Framer::new(BurstConfig {
                discard_leading_bytes: config.discard_leading_bytes,
                sync_pattern: config.sync_pattern,
                fill_fields: config.fill_fields,
                allow_empty_data: config.allow_empty_data,
            }),
        })
    }
}

impl Protocol for FixedProtocol {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn read_data(&mut self, data: &[u8]) -> Result<ReadOutcome> {
        let ident = &mut self.ident;
        self.framer.read_data(data, |buf| ident.reduce(buf))
    }

    fn read_packet(&mut self, mut packet: Packet) -> Result<PacketOutcome> {
        if let Some((target_name, packet_name)) = self.ident.names.take() {
            packet.set_names(&target_name, &packet_name);
            packet.received_time = Some(Utc::now());
        }
        Ok(PacketOutcome::Packet(packet))
    }

    fn write_packet(&mut self, packet: Packet) -> Result<PacketOutcome> {
        self.framer.write_packet(packet)
    }

    fn write_data(&mut self, data: Vec<u8>) -> Result<ReadOutcome> {
        Ok(ReadOutcome::Data(self.framer.write_data(data)?))
    }

    fn reset(&mut self) {
        self.framer.reset();
        self.ident.names = None;
    }

    fn resync(&mut self) {
        self.framer.resync();
        self.ident.names = None;
    }

    fn set_last_read_protocol(&mut self, last: bool) {
        self.framer.empty.last = last;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{"targets": [{"name": "INST", "packets": [
        {"name": "SHORT", "items": [
            {"name": "ID", "bit_size": 8, "data_type": "UINT", "id_value": 1},
            {"name": "V", "bit_size": 8, "data_type": "UINT"}
        ]},
        {"name": "LONG", "items": [
            {"name": "ID", "bit_size": 8, "data_type": "UINT", "id_value": 2},
            {"name": "V", "bit_size": 32, "data_type": "UINT"}
        ]}
    ]}]}"#;

    fn catalog() -> Arc<Catalog> {
        Arc::new(Catalog::from_json(CATALOG).unwrap())
    }

    fn protocol(config: FixedConfig) -> FixedProtocol {
        let mut p = FixedProtocol::new(config, catalog()).unwrap();
        p.set_last_read_protocol(true);
        p
    }

    #[test]
    fn fixed_length_frames() {
        let mut p = protocol(FixedConfig::builder().length(3).build());
        assert_eq!(p.read_data(&[1, 2]).unwrap(), ReadOutcome::Stop);
        assert_eq!(p.read_data(&[3, 4]).unwrap(), ReadOutcome::Data(vec![1, 2, 3]));
        assert_eq!(p.read_data(&[5, 6]).unwrap(), ReadOutcome::Data(vec![4, 5, 6]));
    }

    #[test]
    fn frames_sized_by_identified_packet() {
        let mut p = protocol(FixedConfig::builder().min_id_size(1).build());
        assert_eq!(p.read_data(&[2, 0, 0]).unwrap(), ReadOutcome::Stop);
        assert_eq!(
            p.read_data(&[0, 9, 1, 5]).unwrap(),
            ReadOutcome::Data(vec![2, 0, 0, 0, 9])
        );
        let PacketOutcome::Packet(pkt) = p.read_packet(Packet::from_buffer(vec![])).unwrap() else {
            panic!("expected packet");
        };
        assert_eq!(pkt.packet_name(), Some("LONG"));
        assert!(pkt.received_time.is_some());

        assert_eq!(p.read_data(&[]).unwrap(), ReadOutcome::Data(vec![1, 5]));
        let PacketOutcome::Packet(pkt) = p.read_packet(Packet::from_buffer(vec![])).unwrap() else {
            panic!("expected packet");
        };
        assert_eq!(pkt.packet_name(), Some("SHORT"));
    }

    #[test]
    fn default_min_id_size_waits_for_id_field() {
        let catalog = Catalog::from_json(
            r#"{"targets": [{"name": "INST", "packets": [
                {"name": "WIDE", "items": [
                    {"name": "ID", "bit_size": 16, "data_type": "UINT", "id_value": 258},
                    {"name": "V", "bit_size": 16, "data_type": "UINT"}
                ]},
                {"name": "ANY", "items": [
                    {"name": "V", "bit_size": 8, "data_type": "UINT"}
                ]}
            ]}]}"#,
        )
        .unwrap();
        let mut p = FixedProtocol::new(FixedConfig::builder().build(), Arc::new(catalog)).unwrap();
        p.set_last_read_protocol(true);

        assert_eq!(p.read_data(&[0x01]).unwrap(), ReadOutcome::Stop);
        assert_eq!(
            p.read_data(&[0x02, 0xAA, 0xBB]).unwrap(),
            ReadOutcome::Data(vec![0x01, 0x02, 0xAA, 0xBB])
        );
        let PacketOutcome::Packet(pkt) = p.read_packet(Packet::from_buffer(vec![])).unwrap() else {
            panic!("expected packet");
        };
        assert_eq!(pkt.packet_name(), Some("WIDE"));
        assert_eq!(p.read_data(&[]).unwrap(), ReadOutcome::Stop);
    }

    #[test]
    fn default_min_id_size_counts_leading_bytes() {
        let p = FixedProtocol::new(
            FixedConfig::builder().discard_leading_bytes(2).build(),
            catalog(),
        )
        .unwrap();
        assert_eq!(p.ident.min_id_size, 3);
    }

    #[test]
    fn unknown_data_passed_as_one_frame() {
        let mut p = protocol(FixedConfig::builder().min_id_size(1).build());
        assert_eq!(p.read_data(&[7, 7, 7]).unwrap(), ReadOutcome::Data(vec![7, 7, 7]));
        let PacketOutcome::Packet(pkt) = p.read_packet(Packet::from_buffer(vec![])).unwrap() else {
            panic!("expected packet");
        };
        assert!(!pkt.is_identified());
    }

    #[test]
    fn unknown_data_raises_when_configured() {
        let mut p = protocol(
            FixedConfig::builder()
                .min_id_size(1)
                .unknown_raise(true)
                .sync_pattern(vec![0xEB])
                .discard_leading_bytes(1)
                .build(),
        );
        assert!(matches!(p.read_data(&[0xEB, 7, 0xEB, 1, 3]), Err(Error::Protocol(_))));
        p.resync();
        assert_eq!(p.read_data(&[]).unwrap(), ReadOutcome::Data(vec![1, 3]));
    }
}
