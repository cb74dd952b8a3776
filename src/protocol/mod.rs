//! Composable stream framing.
//!
//! An interface runs raw stream bytes through its read protocols in order. Each
//! protocol either yields a delineated frame for the next protocol, asks for more bytes
//! with [ReadOutcome::Stop], or requests a disconnect. Writes run through the write
//! protocols in the opposite direction.
//!
//! Protocols keep whatever bytes they have not fully consumed, so a frame split across
//! any number of stream reads is delivered exactly once.
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::packet::Packet;
use crate::{Error, Result};

mod burst;
mod crc;
mod fixed;
mod ignore_packet;
mod length;
mod overrides;
mod preidentified;
mod terminated;

pub use burst::{BurstConfig, BurstProtocol};
pub use crc::{BadCrcStrategy, CrcConfig, CrcProtocol};
pub use fixed::{FixedConfig, FixedProtocol};
pub use ignore_packet::{IgnorePacketConfig, IgnorePacketProtocol};
pub use length::{LengthConfig, LengthProtocol};
pub use overrides::{OverrideHandle, OverrideProtocol};
pub use preidentified::{FrameHeader, PreidentifiedConfig, PreidentifiedProtocol};
pub use terminated::{TerminatedConfig, TerminatedProtocol};

pub(crate) use burst::Framer;

/// Result of passing bytes through a protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A delineated frame, or transformed write data.
    Data(Vec<u8>),
    /// Not enough data yet; read more from the stream.
    Stop,
    /// Disconnect the interface.
    Disconnect,
}

/// Result of passing a packet through a protocol.
#[derive(Debug, Clone)]
pub enum PacketOutcome {
    Packet(Packet),
    /// Drop the packet.
    Stop,
    Disconnect,
}

/// A stream framing strategy.
///
/// Protocol instances hold per-connection state and are owned by a single reader or
/// writer.
pub trait Protocol: Send {
    /// Short name used in log messages.
    fn name(&self) -> &'static str;

    /// Add `data` to the protocol and return the next complete frame, if any.
    ///
    /// Interfaces pass empty data at the start of each read so protocols holding
    /// buffered frames can release them before blocking on the stream.
    ///
    /// # Errors
    /// [Error::Protocol] for malformed framing. The caller should [Protocol::resync].
    fn read_data(&mut self, data: &[u8]) -> Result<ReadOutcome>;

    /// Post-process a packet built from a frame.
    ///
    /// # Errors
    /// Implementation specific.
    fn read_packet(&mut self, packet: Packet) -> Result<PacketOutcome> {
        Ok(PacketOutcome::Packet(packet))
    }

    /// Pre-process a packet before it is serialized.
    ///
    /// # Errors
    /// Implementation specific.
    fn write_packet(&mut self, packet: Packet) -> Result<PacketOutcome> {
        Ok(PacketOutcome::Packet(packet))
    }

    /// Transform serialized packet data before it is written to the stream.
    ///
    /// # Errors
    /// Implementation specific.
    fn write_data(&mut self, data: Vec<u8>) -> Result<ReadOutcome> {
        Ok(ReadOutcome::Data(data))
    }

    /// Clear all buffered state.
    fn reset(&mut self);

    fn connect_reset(&mut self) {
        self.reset();
    }

    fn disconnect_reset(&mut self) {
        self.reset();
    }

    /// Recover from a framing error so the next read looks for a fresh frame start.
    fn resync(&mut self) {
        self.reset();
    }

    /// Tell the protocol whether it is the last protocol of the read chain, which
    /// decides automatic empty data handling.
    fn set_last_read_protocol(&mut self, _last: bool) {}
}

/// How empty input is handled by a protocol.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EmptyData {
    /// `None` passes empty data along unless this is the last read protocol.
    pub allow: Option<bool>,
    pub last: bool,
}

impl EmptyData {
    pub fn new(allow: Option<bool>) -> Self {
        Self { allow, last: false }
    }

    pub fn pass(&self, data: &[u8]) -> ReadOutcome {
        if data.is_empty() && !self.allow.unwrap_or(!self.last) {
            return ReadOutcome::Stop;
        }
        ReadOutcome::Data(data.to_vec())
    }
}

/// The chain direction(s) a protocol is added to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Read,
    Write,
    #[default]
    ReadWrite,
}

/// Declarative protocol configuration. Every supported protocol is a variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolConfig {
    Burst(BurstConfig),
    Fixed(FixedConfig),
    Length(LengthConfig),
    Terminated(TerminatedConfig),
    Preidentified(PreidentifiedConfig),
    Crc(CrcConfig),
    /// Applies the interface's overrides to received packets.
    Override,
    IgnorePacket(IgnorePacketConfig),
}

/// Shared resources protocols are built with.
#[derive(Debug, Clone)]
pub struct ProtocolContext {
    pub catalog: Arc<Catalog>,
    pub overrides: OverrideHandle,
    /// Targets received packets are identified against, or all targets if `None`.
    pub target_names: Option<Vec<String>>,
}

impl ProtocolConfig {
    /// Create a new protocol instance.
    ///
    /// # Errors
    /// [Error::Configuration] if the configuration is invalid or references packets
    /// that are not in the catalog.
    pub fn build(&self, ctx: &ProtocolContext) -> Result<Box<dyn Protocol>> {
        Ok(match self {
            ProtocolConfig::Burst(config) => Box::new(BurstProtocol::new(config.clone())),
            ProtocolConfig::Fixed(config) => Box::new(FixedProtocol::with_targets(
                config.clone(),
                ctx.catalog.clone(),
                ctx.target_names.clone(),
            )?),
            ProtocolConfig::Length(config) => Box::new(LengthProtocol::new(config.clone())?),
            ProtocolConfig::Terminated(config) => {
                Box::new(TerminatedProtocol::new(config.clone())?)
            }
            ProtocolConfig::Preidentified(config) => {
                Box::new(PreidentifiedProtocol::new(config.clone()))
            }
            ProtocolConfig::Crc(config) => Box::new(CrcProtocol::new(config.clone())?),
            ProtocolConfig::Override => Box::new(OverrideProtocol::new(
                ctx.overrides.clone(),
                ctx.catalog.clone(),
                ctx.target_names.clone(),
            )),
            ProtocolConfig::IgnorePacket(config) => Box::new(IgnorePacketProtocol::new(
                config.clone(),
                ctx.catalog.clone(),
                ctx.target_names.clone(),
            )?),
        })
    }
}

/// Parse a hex string such as `"0x1ACFFC1D"` or `"1acf fc1d"` into bytes.
///
/// # Errors
/// [Error::Configuration] for non-hex characters or an odd number of digits.
pub fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    let digits: Vec<u8> = s.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(Error::Configuration(format!("odd number of hex digits in {s:?}")));
    }
    digits
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|p| u8::from_str_radix(p, 16).ok())
                .ok_or_else(|| Error::Configuration(format!("invalid hex string {s:?}")))
        })
        .collect()
}

/// Serde adapter for optional byte patterns written as hex strings.
pub(crate) mod hex_pattern {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => {
                let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
                ser.serialize_str(&format!("0x{hex}"))
            }
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(de)?
            .map(|s| super::parse_hex(&s).map_err(D::Error::custom))
            .transpose()
    }
}
