//! Immutable collection of packet definitions.
//!
//! A [Catalog] is built once at startup and then shared, typically as `Arc<Catalog>`,
//! with every interface that needs to identify or decode packets.
use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::packet::{Packet, PacketDef};
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetDef {
    pub name: String,
    #[serde(default)]
    pub packets: Vec<PacketDef>,
}

/// Configuration document describing a [Catalog].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogDef {
    pub targets: Vec<TargetDef>,
}

#[derive(Debug, Clone, Default)]
struct Target {
    name: String,
    packets: Vec<Packet>,
    index: HashMap<String, usize>,
}

/// Packet definitions grouped by target, in declared order.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    targets: Vec<Target>,
    index: HashMap<String, usize>,
}

/// Accumulates packet definitions for a [Catalog].
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    catalog: Catalog,
}

impl CatalogBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `packet` under its target. A packet with the same target and name as an
    /// existing one replaces it, keeping its original position.
    ///
    /// # Errors
    /// [Error::Configuration] if the packet has no names.
    pub fn packet(mut self, packet: Packet) -> Result<Self> {
        let (Some(target_name), Some(packet_name)) = (packet.target_name(), packet.packet_name())
        else {
            return Err(Error::Configuration(
                "catalog packets must have target and packet names".to_string(),
            ));
        };
        let target_name = target_name.to_string();
        let packet_name = packet_name.to_string();

        let catalog = &mut self.catalog;
        let tidx = match catalog.index.get(&target_name) {
            Some(idx) => *idx,
            None => {
                catalog.targets.push(Target {
                    name: target_name.clone(),
                    ..Target::default()
                });
                catalog.index.insert(target_name, catalog.targets.len() - 1);
                catalog.targets.len() - 1
            }
        };
        let target = &mut catalog.targets[tidx];
        match target.index.get(&packet_name) {
            Some(pidx) => target.packets[*pidx] = packet,
            None => {
                target.packets.push(packet);
                target.index.insert(packet_name, target.packets.len() - 1);
            }
        }
        Ok(self)
    }

    /// Add every packet in `def`.
    ///
    /// # Errors
    /// [Error::Configuration] for invalid packet definitions.
    pub fn def(mut self, def: &CatalogDef) -> Result<Self> {
        for target in &def.targets {
            for packet in &target.packets {
                let packet = Packet::from_def(&target.name, packet).map_err(|e| {
                    Error::Configuration(format!("{} {}: {e}", target.name, packet.name))
                })?;
                self = self.packet(packet)?;
            }
        }
        Ok(self)
    }

    #[must_use]
    pub fn build(self) -> Catalog {
        self.catalog
    }
}

impl Catalog {
    #[must_use]
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::new()
    }

    /// Build a catalog from a JSON [CatalogDef] document.
    ///
    /// # Errors
    /// [Error::Json] if the document does not parse, [Error::Configuration] for invalid
    /// definitions.
    pub fn from_json(json: &str) -> Result<Self> {
        let def: CatalogDef = serde_json::from_str(json)?;
        Ok(CatalogBuilder::new().def(&def)?.build())
    }

    /// Build a catalog from a JSON [CatalogDef] file.
    ///
    /// # Errors
    /// [Error::Io] if the file cannot be read, otherwise see [Catalog::from_json].
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Target names in declared order.
    pub fn target_names(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|t| t.name.as_str())
    }

    /// Packets of `target_name` in declared order.
    ///
    /// # Errors
    /// [Error::Configuration] if the target does not exist.
    pub fn packets(&self, target_name: &str) -> Result<&[Packet]> {
        Ok(&self.target(target_name)?.packets)
    }

    fn target(&self, target_name: &str) -> Result<&Target> {
        let key = target_name.trim().to_uppercase();
        self.index
            .get(&key)
            .map(|i| &self.targets[*i])
            .ok_or_else(|| Error::Configuration(format!("target {key} does not exist")))
    }

    /// The packet definition for `target_name` and `packet_name`.
    ///
    /// # Errors
    /// [Error::Configuration] if either does not exist.
    pub fn packet(&self, target_name: &str, packet_name: &str) -> Result<&Packet> {
        let target = self.target(target_name)?;
        let key = packet_name.trim().to_uppercase();
        target
            .index
            .get(&key)
            .map(|i| &target.packets[*i])
            .ok_or_else(|| {
                Error::Configuration(format!("packet {} {key} does not exist", target.name))
            })
    }

    /// Identify `buffer` against the packets of `target_names`, or all targets if `None`,
    /// returning a copy of the first matching definition holding `buffer`.
    ///
    /// Targets and packets are tried in declared order. Unknown target names are
    /// ignored.
    #[must_use]
    pub fn identify(&self, buffer: &[u8], target_names: Option<&[String]>) -> Option<Packet> {
        let found = match target_names {
            Some(names) => names
                .iter()
                .filter_map(|n| self.target(n).ok())
                .find_map(|t| t.packets.iter().find(|p| p.identify(buffer))),
            None => self
                .targets
                .iter()
                .find_map(|t| t.packets.iter().find(|p| p.identify(buffer))),
        }?;
        let mut packet = found.clone();
        packet.set_buffer(buffer.to_vec());
        debug!(
            target_name = packet.target_name(),
            packet_name = packet.packet_name(),
            "identified"
        );
        Some(packet)
    }

    /// Bind a received packet to its catalog definition, keeping its metadata.
    ///
    /// Packets already named, e.g., by a preidentified protocol, are looked up by name.
    /// Unnamed packets are identified against `target_names`. Packets that already
    /// have a definition, or that cannot be found, are returned unchanged.
    #[must_use]
    pub fn identify_and_define(&self, packet: Packet, target_names: Option<&[String]>) -> Packet {
        if !packet.items().is_empty() {
            return packet;
        }
        let defined = match (packet.target_name(), packet.packet_name()) {
            (Some(target_name), Some(packet_name)) => {
                match self.update(target_name, packet_name, packet.buffer()) {
                    Ok(defined) => Some(defined),
                    Err(err) => {
                        debug!(%err, "named packet not in catalog");
                        None
                    }
                }
            }
            _ => self.identify(packet.buffer(), target_names),
        };
        match defined {
            Some(mut defined) => {
                defined.received_time = packet.received_time;
                defined.received_count = packet.received_count;
                defined.stored = packet.stored;
                defined.extra = packet.extra;
                defined
            }
            None => packet,
        }
    }

    /// A copy of the named packet definition holding `buffer`.
    ///
    /// # Errors
    /// [Error::Configuration] if the packet does not exist.
    pub fn update(&self, target_name: &str, packet_name: &str, buffer: &[u8]) -> Result<Packet> {
        let mut packet = self.packet(target_name, packet_name)?.clone();
        packet.set_buffer(buffer.to_vec());
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::DataType;
    use crate::packet::ItemDef;
    use crate::{Value, ValueType};

    const CATALOG: &str = r#"{
        "targets": [
            {
                "name": "inst",
                "packets": [
                    {"name": "health", "items": [
                        {"name": "ID", "bit_size": 8, "data_type": "UINT", "id_value": 1},
                        {"name": "TEMP", "bit_size": 8, "data_type": "UINT"}
                    ]},
                    {"name": "event", "items": [
                        {"name": "ID", "bit_size": 8, "data_type": "UINT", "id_value": 2},
                        {"name": "MSG", "bit_size": 0, "data_type": "STRING"}
                    ]}
                ]
            },
            {
                "name": "inst2",
                "packets": [
                    {"name": "health", "items": [
                        {"name": "ID", "bit_size": 8, "data_type": "UINT", "id_value": 1}
                    ]}
                ]
            }
        ]
    }"#;

    #[test]
    fn identify_first_match_in_declared_order() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let pkt = catalog.identify(&[1, 42], None).unwrap();
        assert_eq!(pkt.target_name(), Some("INST"));
        assert_eq!(pkt.packet_name(), Some("HEALTH"));
        assert_eq!(pkt.read("TEMP", ValueType::Raw).unwrap(), Value::UInt(42));

        let pkt = catalog.identify(&[2, b'h', b'i'], None).unwrap();
        assert_eq!(pkt.packet_name(), Some("EVENT"));
        assert_eq!(pkt.read("MSG", ValueType::Raw).unwrap(), Value::from("hi"));

        assert!(catalog.identify(&[3], None).is_none());
    }

    #[test]
    fn identify_restricted_to_targets() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let targets = vec!["inst2".to_string()];
        let pkt = catalog.identify(&[1], Some(&targets)).unwrap();
        assert_eq!(pkt.target_name(), Some("INST2"));
    }

    #[test]
    fn identify_does_not_modify_catalog() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let _ = catalog.identify(&[1, 42], None).unwrap();
        let def = catalog.packet("INST", "HEALTH").unwrap();
        assert_eq!(def.read("TEMP", ValueType::Raw).unwrap(), Value::UInt(0));
    }

    #[test]
    fn update_and_lookup_errors() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let pkt = catalog.update("inst", "event", &[2, b'x']).unwrap();
        assert_eq!(pkt.read("MSG", ValueType::Raw).unwrap(), Value::from("x"));
        assert!(matches!(catalog.packet("nope", "health"), Err(Error::Configuration(_))));
        assert!(matches!(catalog.packet("inst", "nope"), Err(Error::Configuration(_))));
        assert_eq!(catalog.target_names().collect::<Vec<_>>(), vec!["INST", "INST2"]);
    }

    #[test]
    fn identify_and_define_keeps_metadata() {
        let catalog = Catalog::from_json(CATALOG).unwrap();

        let mut raw = Packet::from_buffer(vec![1, 7]);
        raw.stored = true;
        let pkt = catalog.identify_and_define(raw, None);
        assert_eq!(pkt.packet_name(), Some("HEALTH"));
        assert!(pkt.stored);

        let mut named = Packet::from_buffer(vec![1, 7]);
        named.set_names("INST2", "HEALTH");
        let pkt = catalog.identify_and_define(named, None);
        assert_eq!(pkt.target_name(), Some("INST2"));
        assert_eq!(pkt.items().len(), 1);

        let pkt = catalog.identify_and_define(Packet::from_buffer(vec![9]), None);
        assert!(!pkt.is_identified());
    }

    #[test]
    fn builder_replaces_same_named_packet() {
        let mut a = Packet::new("T", "P");
        a.define_item(&ItemDef::builder().name("X").bit_size(8).data_type(DataType::UInt).build())
            .unwrap();
        let b = Packet::new("T", "P");
        let catalog = Catalog::builder().packet(a).unwrap().packet(b).unwrap().build();
        assert_eq!(catalog.packets("T").unwrap().len(), 1);
        assert!(catalog.packet("T", "P").unwrap().items().is_empty());
    }

    #[test]
    fn overlapping_definition_is_err() {
        let json = r#"{"targets": [{"name": "T", "packets": [{"name": "P", "items": [
            {"name": "A", "bit_offset": 0, "bit_size": 16, "data_type": "UINT"},
            {"name": "B", "bit_offset": 8, "bit_size": 8, "data_type": "UINT"}
        ]}]}]}"#;
        assert!(matches!(Catalog::from_json(json), Err(Error::Configuration(_))));
    }
}
