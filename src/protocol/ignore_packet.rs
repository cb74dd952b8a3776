use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{EmptyData, PacketOutcome, Protocol, ReadOutcome};
use crate::catalog::Catalog;
use crate::packet::Packet;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnorePacketConfig {
    pub target_name: String,
    pub packet_name: String,
}

/// Drops one packet type on read and write.
#[derive(Debug)]
pub struct IgnorePacketProtocol {
    target_name: String,
    packet_name: String,
    catalog: Arc<Catalog>,
    target_names: Option<Vec<String>>,
    empty: EmptyData,
}

impl IgnorePacketProtocol {
    /// # Errors
    /// [crate::Error::Configuration] if the packet is not in `catalog`.
    pub fn new(
        config: IgnorePacketConfig,
        catalog: Arc<Catalog>,
        target_names: Option<Vec<String>>,
    ) -> Result<Self> {
        let packet = catalog.packet(&config.target_name, &config.packet_name)?;
        Ok(IgnorePacketProtocol {
            target_name: packet.target_name().unwrap_or_default().to_string(),
            packet_name: packet.packet_name().unwrap_or_default().to_string(),
            catalog,
            target_names,
            empty: EmptyData::default(),
        })
    }

    fn matches(&self, packet: &Packet) -> bool {
        packet.target_name() == Some(self.target_name.as_str())
            && packet.packet_name() == Some(self.packet_name.as_str())
    }
}

impl Protocol for IgnorePacketProtocol {
    fn name(&self) -> &'static str {
        "ignore_packet"
    }

    fn read_data(&mut self, data: &[u8]) -> Result<ReadOutcome> {
        Ok(self.empty.pass(data))
    }

    fn read_packet(&mut self, packet: Packet) -> Result<PacketOutcome> {
        let packet = self
            .catalog
            .identify_and_define(packet, self.target_names.as_deref());
        if self.matches(&packet) {
            trace!(target_name = %self.target_name, packet_name = %self.packet_name, "ignoring read");
            return Ok(PacketOutcome::Stop);
        }
        Ok(PacketOutcome::Packet(packet))
    }

    fn write_packet(&mut self, packet: Packet) -> Result<PacketOutcome> {
        if self.matches(&packet) {
            trace!(target_name = %self.target_name, packet_name = %self.packet_name, "ignoring write");
            return Ok(PacketOutcome::Stop);
        }
        Ok(PacketOutcome::Packet(packet))
    }

    fn reset(&mut self) {}

    fn set_last_read_protocol(&mut self, last: bool) {
        self.empty.last = last;
    }
}
