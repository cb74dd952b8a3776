//! Packet definitions and typed access to packet buffers.
//!
//! A [Packet] pairs a layout of [Item]s with a byte buffer. Layouts are shared between
//! clones while buffers are always copied, so a cloned packet can be handed to another
//! consumer without either observing the other's writes.
mod conversion;
mod format;
mod item;
mod limits;

use std::collections::HashMap;
use std::fmt::{Display, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::accessor::{self, Endianness};
use crate::{Error, Result, Value};

pub use conversion::{Conversion, ConversionDef, FnConversion, PolynomialConversion};
pub use format::sprintf;
pub use item::{Item, ItemDef};
pub use limits::{Limits, LimitsState};
use limits::LimitsTracker;

/// Name used for packets that could not be identified.
pub const UNKNOWN: &str = "UNKNOWN";

/// How a value is presented on read or interpreted on write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    /// The value as stored in the buffer.
    Raw,
    /// States and read conversions applied.
    #[default]
    Converted,
    /// Converted value rendered with the item's format string.
    Formatted,
    /// Formatted value followed by the item's units.
    WithUnits,
}

/// Declarative definition of a packet, as found in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub endianness: Endianness,
    #[serde(default)]
    pub short_buffer_allowed: bool,
    #[serde(default)]
    pub items: Vec<ItemDef>,
}

#[derive(Debug, Clone, Default)]
struct Layout {
    description: Option<String>,
    default_endianness: Endianness,
    short_buffer_allowed: bool,
    /// Sorted by bit offset, positive offsets before negative.
    items: Vec<Item>,
    index: HashMap<String, usize>,
    pos_bit_size: i64,
    neg_bit_size: i64,
    fixed_size: bool,
}

impl Layout {
    fn defined_length_bits(&self) -> i64 {
        self.pos_bit_size + self.neg_bit_size
    }

    fn defined_length(&self) -> usize {
        usize::try_from((self.defined_length_bits() + 7) / 8).unwrap_or_default()
    }

    fn rebuild(&mut self) {
        self.items.sort_by_key(|item| (item.bit_offset < 0, item.bit_offset));
        self.index = self
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.name.clone(), i))
            .collect();
        self.pos_bit_size = 0;
        self.neg_bit_size = 0;
        self.fixed_size = true;
        for item in &self.items {
            let size = item.total_bit_size();
            if item.bit_offset >= 0 {
                let min_bits = if size > 0 {
                    item.bit_offset + size
                } else {
                    self.fixed_size = false;
                    item.bit_offset - size
                };
                self.pos_bit_size = self.pos_bit_size.max(min_bits);
            } else {
                self.neg_bit_size = self.neg_bit_size.max(-item.bit_offset);
            }
        }
    }
}

/// A schema bound binary record.
#[derive(Debug, Clone)]
pub struct Packet {
    target_name: Option<String>,
    packet_name: Option<String>,
    layout: Arc<Layout>,
    buffer: Vec<u8>,
    /// When the packet was received by an interface.
    pub received_time: Option<DateTime<Utc>>,
    /// Number of packets of this type received.
    pub received_count: u64,
    /// True for packets replayed from storage rather than received live.
    pub stored: bool,
    /// Metadata that travels with the packet, e.g., through preidentified framing.
    pub extra: Option<serde_json::Map<String, serde_json::Value>>,
    limits: HashMap<String, LimitsTracker>,
}

impl Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Packet{{target: {}, packet: {}, data:[len={}]}}",
            self.target_name().unwrap_or(UNKNOWN),
            self.packet_name().unwrap_or(UNKNOWN),
            self.buffer.len()
        )
    }
}

impl Packet {
    /// Create an empty packet definition with big endian default endianness.
    #[must_use]
    pub fn new(target_name: &str, packet_name: &str) -> Self {
        Self::with_endianness(target_name, packet_name, Endianness::Big)
    }

    #[must_use]
    pub fn with_endianness(target_name: &str, packet_name: &str, endianness: Endianness) -> Self {
        let layout = Layout {
            default_endianness: endianness,
            fixed_size: true,
            ..Layout::default()
        };
        Packet {
            target_name: Some(target_name.trim().to_uppercase()),
            packet_name: Some(packet_name.trim().to_uppercase()),
            layout: Arc::new(layout),
            buffer: Vec::new(),
            received_time: None,
            received_count: 0,
            stored: false,
            extra: None,
            limits: HashMap::default(),
        }
    }

    /// Create a packet with no names or items holding `buffer`, e.g., a freshly
    /// delineated frame that has not been identified.
    #[must_use]
    pub fn from_buffer(buffer: Vec<u8>) -> Self {
        Packet {
            target_name: None,
            packet_name: None,
            layout: Arc::new(Layout {
                fixed_size: true,
                ..Layout::default()
            }),
            buffer,
            received_time: None,
            received_count: 0,
            stored: false,
            extra: None,
            limits: HashMap::default(),
        }
    }

    /// Build a packet from its declarative definition.
    ///
    /// # Errors
    /// [Error::Configuration] for invalid or overlapping items.
    pub fn from_def(target_name: &str, def: &PacketDef) -> Result<Self> {
        let mut packet = Self::with_endianness(target_name, &def.name, def.endianness);
        {
            let layout = Arc::make_mut(&mut packet.layout);
            layout.description.clone_from(&def.description);
            layout.short_buffer_allowed = def.short_buffer_allowed;
        }
        for item in &def.items {
            packet.define_item(item)?;
        }
        packet.restore_defaults()?;
        Ok(packet)
    }

    #[must_use]
    pub fn target_name(&self) -> Option<&str> {
        self.target_name.as_deref()
    }

    #[must_use]
    pub fn packet_name(&self) -> Option<&str> {
        self.packet_name.as_deref()
    }

    /// Set both names, upper-casing them.
    pub fn set_names(&mut self, target_name: &str, packet_name: &str) {
        self.target_name = Some(target_name.trim().to_uppercase());
        self.packet_name = Some(packet_name.trim().to_uppercase());
    }

    /// True if the packet has been named, by identification or otherwise.
    #[must_use]
    pub fn is_identified(&self) -> bool {
        self.target_name.is_some() && self.packet_name.is_some()
    }

    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.layout.description.as_deref()
    }

    #[must_use]
    pub fn default_endianness(&self) -> Endianness {
        self.layout.default_endianness
    }

    /// Items in bit offset order.
    #[must_use]
    pub fn items(&self) -> &[Item] {
        &self.layout.items
    }

    #[must_use]
    pub fn id_items(&self) -> Vec<&Item> {
        self.layout.items.iter().filter(|i| i.id_value.is_some()).collect()
    }

    /// Look up an item by case insensitive name.
    ///
    /// # Errors
    /// [Error::Configuration] if no such item exists.
    pub fn item(&self, name: &str) -> Result<&Item> {
        let key = name.trim().to_uppercase();
        self.layout
            .index
            .get(&key)
            .map(|i| &self.layout.items[*i])
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "packet item {} {} {key} does not exist",
                    self.target_name().unwrap_or(UNKNOWN),
                    self.packet_name().unwrap_or(UNKNOWN),
                ))
            })
    }

    /// Minimum number of bytes needed to hold all fixed position items.
    #[must_use]
    pub fn defined_length(&self) -> usize {
        self.layout.defined_length()
    }

    /// False once a variably sized item has been defined.
    #[must_use]
    pub fn fixed_size(&self) -> bool {
        self.layout.fixed_size
    }

    /// Define `def`, replacing any existing item of the same name. Items without a
    /// `bit_offset` are appended.
    ///
    /// # Errors
    /// [Error::Configuration] for invalid definitions, for items that overlap existing
    /// ones unless either permits overlap, and for appending after a variably sized
    /// item.
    pub fn define_item(&mut self, def: &ItemDef) -> Result<&Item> {
        let bit_offset = match def.bit_offset {
            Some(offset) => offset,
            None => {
                if !self.layout.fixed_size {
                    return Err(Error::Configuration(format!(
                        "can't append {} after a variably sized item",
                        def.name
                    )));
                }
                self.layout.pos_bit_size
            }
        };
        let item = Item::from_def(def, bit_offset, self.layout.default_endianness)?;
        if let Some(other) = self
            .layout
            .items
            .iter()
            .filter(|other| other.name != item.name)
            .find(|other| !item.allow_overlap && !other.allow_overlap && item.overlaps(other))
        {
            return Err(Error::Configuration(format!(
                "{} {}: item {} at bit_offset {} overlaps item {} at bit_offset {}",
                self.target_name().unwrap_or(UNKNOWN),
                self.packet_name().unwrap_or(UNKNOWN),
                item.name,
                item.bit_offset,
                other.name,
                other.bit_offset
            )));
        }

        let name = item.name.clone();
        let layout = Arc::make_mut(&mut self.layout);
        layout.items.retain(|i| i.name != name);
        layout.items.push(item);
        layout.rebuild();

        let defined = layout.defined_length();
        if self.buffer.len() < defined {
            self.buffer.resize(defined, 0);
        }
        self.limits.remove(&name);
        self.item(&name)
    }

    /// Define `def` directly after the last defined bit, ignoring its `bit_offset`.
    ///
    /// # Errors
    /// As [Packet::define_item].
    pub fn append_item(&mut self, def: &ItemDef) -> Result<&Item> {
        let def = ItemDef {
            bit_offset: None,
            ..def.clone()
        };
        self.define_item(&def)
    }

    /// Replace the read conversion of an item.
    ///
    /// # Errors
    /// [Error::Configuration] if the item does not exist.
    pub fn set_read_conversion(&mut self, name: &str, conversion: Arc<dyn Conversion>) -> Result<()> {
        let idx = self.item_index(name)?;
        Arc::make_mut(&mut self.layout).items[idx].read_conversion = Some(conversion);
        Ok(())
    }

    /// Replace the write conversion of an item.
    ///
    /// # Errors
    /// [Error::Configuration] if the item does not exist.
    pub fn set_write_conversion(&mut self, name: &str, conversion: Arc<dyn Conversion>) -> Result<()> {
        let idx = self.item_index(name)?;
        Arc::make_mut(&mut self.layout).items[idx].write_conversion = Some(conversion);
        Ok(())
    }

    fn item_index(&self, name: &str) -> Result<usize> {
        let item = self.item(name)?;
        Ok(self.layout.index[&item.name])
    }

    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    #[must_use]
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }

    /// Mutable access to the raw buffer, bypassing item definitions.
    pub fn buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Replace the buffer. Buffers shorter than the defined length are zero filled
    /// unless short buffers are allowed.
    pub fn set_buffer(&mut self, buffer: Vec<u8>) {
        self.buffer = buffer;
        let defined = self.defined_length();
        if self.buffer.len() < defined {
            if !self.layout.short_buffer_allowed {
                warn!(
                    target_name = self.target_name().unwrap_or(UNKNOWN),
                    packet_name = self.packet_name().unwrap_or(UNKNOWN),
                    received = self.buffer.len(),
                    defined,
                    "buffer length less than defined length"
                );
                self.buffer.resize(defined, 0);
            }
        } else if self.buffer.len() > defined && self.layout.fixed_size && defined > 0 {
            warn!(
                target_name = self.target_name().unwrap_or(UNKNOWN),
                packet_name = self.packet_name().unwrap_or(UNKNOWN),
                received = self.buffer.len(),
                defined,
                "buffer length greater than defined length"
            );
        }
    }

    /// True if every id item read from `buffer` equals its id value. A packet without
    /// id items matches any buffer.
    #[must_use]
    pub fn identify(&self, buffer: &[u8]) -> bool {
        self.layout
            .items
            .iter()
            .filter_map(|item| item.id_value.as_ref().map(|id| (item, id)))
            .all(|(item, id)| match Self::read_raw(item, buffer) {
                Ok(raw) => raw == *id,
                Err(_) => false,
            })
    }

    fn read_raw(item: &Item, buffer: &[u8]) -> Result<Value> {
        match item.array_size {
            Some(array_size) => Ok(Value::Array(accessor::read_array(
                item.bit_offset,
                item.bit_size,
                item.data_type,
                array_size,
                buffer,
                item.endianness,
            )?)),
            None => accessor::read(
                item.bit_offset,
                item.bit_size,
                item.data_type,
                buffer,
                item.endianness,
            ),
        }
    }

    /// Read the item named `name`.
    ///
    /// # Errors
    /// [Error::Configuration] for unknown items, [Error::Bounds] if the buffer does not
    /// hold the item, or any error from a conversion.
    pub fn read(&self, name: &str, value_type: ValueType) -> Result<Value> {
        self.read_item(self.item(name)?, value_type)
    }

    /// Read `item` from this packet's buffer.
    ///
    /// # Errors
    /// See [Packet::read].
    pub fn read_item(&self, item: &Item, value_type: ValueType) -> Result<Value> {
        let raw = Self::read_raw(item, &self.buffer)?;
        if value_type == ValueType::Raw {
            return Ok(raw);
        }
        match raw {
            Value::Array(values) => {
                let converted = values
                    .iter()
                    .map(|v| self.present(item, v, value_type))
                    .collect::<Result<Vec<_>>>()?;
                if value_type == ValueType::Converted {
                    return Ok(Value::Array(converted));
                }
                let mut s = Value::Array(converted).to_string();
                if value_type == ValueType::WithUnits {
                    if let Some(units) = &item.units {
                        write!(s, " {units}").ok();
                    }
                }
                Ok(Value::String(s))
            }
            raw => self.present(item, &raw, value_type),
        }
    }

    fn present(&self, item: &Item, raw: &Value, value_type: ValueType) -> Result<Value> {
        if let Some(state) = item.state_name(raw) {
            return Ok(Value::String(state.to_string()));
        }
        let converted = match &item.read_conversion {
            Some(conversion) => conversion.call(raw, self)?,
            None => raw.clone(),
        };
        match value_type {
            ValueType::Raw | ValueType::Converted => Ok(converted),
            ValueType::Formatted | ValueType::WithUnits => {
                let mut s = match &item.format_string {
                    Some(fmt) => sprintf(fmt, &converted)?,
                    None => converted.to_string(),
                };
                if value_type == ValueType::WithUnits {
                    if let Some(units) = &item.units {
                        write!(s, " {units}").ok();
                    }
                }
                Ok(Value::String(s))
            }
        }
    }

    /// Write `value` to the item named `name`.
    ///
    /// # Errors
    /// [Error::Configuration] for unknown items or for `Formatted`/`WithUnits` writes,
    /// otherwise any accessor or conversion error.
    pub fn write(&mut self, name: &str, value: impl Into<Value>, value_type: ValueType) -> Result<()> {
        let idx = self.item_index(name)?;
        let layout = Arc::clone(&self.layout);
        self.write_item(&layout.items[idx], value.into(), value_type)
    }

    /// Write `value` to `item` in this packet's buffer.
    ///
    /// # Errors
    /// See [Packet::write].
    pub fn write_item(&mut self, item: &Item, value: Value, value_type: ValueType) -> Result<()> {
        let raw = match value_type {
            ValueType::Raw => value,
            ValueType::Converted => self.unconvert(item, value)?,
            ValueType::Formatted | ValueType::WithUnits => {
                return Err(Error::Configuration(format!(
                    "invalid value type on write: {value_type:?}"
                )))
            }
        };
        match (item.array_size, raw) {
            (Some(array_size), Value::Array(values)) => accessor::write_array(
                &values,
                item.bit_offset,
                item.bit_size,
                item.data_type,
                array_size,
                &mut self.buffer,
                item.endianness,
                item.overflow,
            ),
            (Some(_), other) => Err(Error::Configuration(format!(
                "{} is an array item, got {other}",
                item.name
            ))),
            (None, raw) => accessor::write(
                &raw,
                item.bit_offset,
                item.bit_size,
                item.data_type,
                &mut self.buffer,
                item.endianness,
                item.overflow,
            ),
        }
    }

    fn unconvert(&self, item: &Item, value: Value) -> Result<Value> {
        let value = match value {
            Value::Array(values) => {
                let values = values
                    .into_iter()
                    .map(|v| self.unconvert_one(item, v))
                    .collect::<Result<Vec<_>>>()?;
                return Ok(Value::Array(values));
            }
            other => other,
        };
        self.unconvert_one(item, value)
    }

    fn unconvert_one(&self, item: &Item, value: Value) -> Result<Value> {
        if let Value::String(s) = &value {
            if let Some(state_value) = item.state_value(s) {
                return Ok(state_value.clone());
            }
        }
        match &item.write_conversion {
            Some(conversion) => conversion.call(&value, self),
            None => Ok(value),
        }
    }

    /// Read every item, in bit offset order.
    ///
    /// # Errors
    /// The first error reading any item.
    pub fn read_all(&self, value_type: ValueType) -> Result<Vec<(String, Value)>> {
        self.layout
            .items
            .iter()
            .map(|item| Ok((item.name.clone(), self.read_item(item, value_type)?)))
            .collect()
    }

    /// Render every item as `NAME: value` lines.
    ///
    /// # Errors
    /// See [Packet::read_all].
    pub fn formatted(&self, value_type: ValueType) -> Result<String> {
        let mut out = String::new();
        for (name, value) in self.read_all(value_type)? {
            writeln!(out, "{name}: {value}").ok();
        }
        Ok(out)
    }

    /// Write all item default values into the buffer.
    ///
    /// # Errors
    /// If any default cannot be written.
    pub fn restore_defaults(&mut self) -> Result<()> {
        let layout = Arc::clone(&self.layout);
        for item in layout.items.iter().filter(|i| !i.is_variable()) {
            if let Some(default) = &item.default {
                self.write_item(item, default.clone(), ValueType::Converted)?;
            }
        }
        Ok(())
    }

    /// Evaluate limits for every item that has them and is enabled, returning each
    /// item's state after persistence.
    ///
    /// Items whose converted value is not numeric or cannot be read are skipped.
    pub fn check_limits(&mut self) -> Vec<(String, LimitsState)> {
        let layout = Arc::clone(&self.layout);
        let mut states = Vec::new();
        for item in &layout.items {
            let Some(limits) = item.limits.as_ref().filter(|l| l.enabled) else {
                continue;
            };
            let value = match self.read_item(item, ValueType::Converted) {
                Ok(v) if v.is_numeric() => v,
                Ok(_) => continue,
                Err(err) => {
                    debug!(item = %item.name, "limits check skipped: {err}");
                    continue;
                }
            };
            let Ok(v) = value.to_f64() else { continue };
            let tracker = self.limits.entry(item.name.clone()).or_default();
            if let Some(state) = tracker.update(limits, v) {
                states.push((item.name.clone(), state));
            }
        }
        states
    }

    /// Enable or disable limits checking of an item.
    ///
    /// # Errors
    /// [Error::Configuration] if the item does not exist or has no limits.
    pub fn set_limits_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        let idx = self.item_index(name)?;
        let layout = Arc::make_mut(&mut self.layout);
        let item = &mut layout.items[idx];
        match item.limits.as_mut() {
            Some(limits) => {
                limits.enabled = enabled;
                Ok(())
            }
            None => Err(Error::Configuration(format!("{} has no limits", item.name))),
        }
    }

    /// Current limits state of an item, if it has been checked.
    #[must_use]
    pub fn limits_state(&self, name: &str) -> Option<LimitsState> {
        self.limits.get(&name.trim().to_uppercase()).and_then(|t| t.state)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::accessor::DataType;

    fn uint(name: &str, offset: i64, size: i64) -> ItemDef {
        ItemDef::builder()
            .name(name)
            .bit_offset(offset)
            .bit_size(size)
            .data_type(DataType::UInt)
            .build()
    }

    fn id_packet() -> Packet {
        let mut pkt = Packet::new("inst", "health");
        pkt.define_item(
            &ItemDef::builder()
                .name("A")
                .bit_offset(0)
                .bit_size(8)
                .data_type(DataType::UInt)
                .id_value(5)
                .build(),
        )
        .unwrap();
        pkt.define_item(&uint("B", 8, 8)).unwrap();
        pkt
    }

    #[test]
    fn identify_by_id_items() {
        let pkt = id_packet();
        assert!(pkt.identify(&[0x05, 0xFF]));
        assert!(!pkt.identify(&[0x06, 0xFF]));
        // too short to read the id item
        assert!(!pkt.identify(&[]));
    }

    #[test]
    fn packet_without_id_items_identifies_anything() {
        let mut pkt = Packet::new("TGT", "ALL");
        pkt.define_item(&uint("B", 8, 8)).unwrap();
        assert!(pkt.identify(&[1, 2]));
    }

    #[test]
    fn names_are_uppercased() {
        let pkt = id_packet();
        assert_eq!(pkt.target_name(), Some("INST"));
        assert_eq!(pkt.packet_name(), Some("HEALTH"));
        assert_eq!(pkt.item("a").unwrap().name(), "A");
    }

    #[test]
    fn define_item_sizes_buffer() {
        let mut pkt = Packet::new("TGT", "PKT");
        pkt.define_item(&uint("A", 0, 8)).unwrap();
        pkt.define_item(&uint("B", -16, 16)).unwrap();
        assert_eq!(pkt.defined_length(), 3);
        assert_eq!(pkt.len(), 3);
        assert!(pkt.fixed_size());
    }

    #[test]
    fn overlapping_items_are_configuration_err() {
        let mut pkt = id_packet();
        let err = pkt.define_item(&uint("C", 4, 8)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)), "{err:?}");

        let mut def = uint("C", 4, 8);
        def.allow_overlap = true;
        pkt.define_item(&def).unwrap();
    }

    #[test]
    fn redefining_item_replaces_it() {
        let mut pkt = id_packet();
        pkt.define_item(&uint("B", 8, 16)).unwrap();
        assert_eq!(pkt.items().len(), 2);
        assert_eq!(pkt.item("B").unwrap().bit_size(), 16);
    }

    #[test]
    fn append_places_items_back_to_back() {
        let mut pkt = Packet::new("TGT", "PKT");
        pkt.define_item(&ItemDef::builder().name("A").bit_size(3).data_type(DataType::UInt).build())
            .unwrap();
        let b = pkt
            .define_item(&ItemDef::builder().name("B").bit_size(13).data_type(DataType::UInt).build())
            .unwrap();
        assert_eq!(b.bit_offset(), 3);
        pkt.define_item(&ItemDef::builder().name("DATA").bit_size(0).data_type(DataType::Block).build())
            .unwrap();
        assert!(!pkt.fixed_size());
        let err = pkt
            .define_item(&ItemDef::builder().name("C").bit_size(8).data_type(DataType::UInt).build())
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn append_item_ignores_offset() {
        let mut pkt = Packet::new("TGT", "PKT");
        pkt.define_item(&uint("A", 0, 8)).unwrap();
        let b = pkt.append_item(&uint("B", 40, 8)).unwrap();
        assert_eq!(b.bit_offset(), 8);
        assert_eq!(pkt.defined_length(), 2);
    }

    #[test]
    fn clone_copies_buffer() {
        let mut pkt = id_packet();
        pkt.set_buffer(vec![5, 1]);
        let mut copy = pkt.clone();
        copy.write("B", 9u8, ValueType::Raw).unwrap();
        assert_eq!(pkt.read("B", ValueType::Raw).unwrap(), Value::UInt(1));
        assert_eq!(copy.read("B", ValueType::Raw).unwrap(), Value::UInt(9));
    }

    #[test]
    fn short_buffer_is_padded() {
        let mut pkt = id_packet();
        pkt.set_buffer(vec![5]);
        assert_eq!(pkt.buffer(), &[5, 0]);
    }

    #[test]
    fn value_types() {
        let mut pkt = Packet::new("TGT", "PKT");
        pkt.define_item(
            &ItemDef::builder()
                .name("TEMP")
                .bit_offset(0)
                .bit_size(16)
                .data_type(DataType::UInt)
                .read_conversion(ConversionDef::Polynomial { coeffs: vec![-10.0, 0.5] })
                .write_conversion(ConversionDef::Polynomial { coeffs: vec![20.0, 2.0] })
                .format_string("%.1f")
                .units("C")
                .build(),
        )
        .unwrap();
        let mut states = BTreeMap::new();
        states.insert("ON".to_string(), Value::UInt(1));
        states.insert("OFF".to_string(), Value::UInt(0));
        pkt.define_item(
            &ItemDef::builder()
                .name("POWER")
                .bit_offset(16)
                .bit_size(8)
                .data_type(DataType::UInt)
                .states(states)
                .units("V")
                .build(),
        )
        .unwrap();

        pkt.write("TEMP", 25.0, ValueType::Converted).unwrap();
        assert_eq!(pkt.read("TEMP", ValueType::Raw).unwrap(), Value::UInt(70));
        assert_eq!(pkt.read("TEMP", ValueType::Converted).unwrap(), Value::Float(25.0));
        assert_eq!(pkt.read("TEMP", ValueType::Formatted).unwrap(), Value::from("25.0"));
        assert_eq!(pkt.read("TEMP", ValueType::WithUnits).unwrap(), Value::from("25.0 C"));

        pkt.write("POWER", "ON", ValueType::Converted).unwrap();
        assert_eq!(pkt.read("POWER", ValueType::Raw).unwrap(), Value::UInt(1));
        assert_eq!(pkt.read("POWER", ValueType::Converted).unwrap(), Value::from("ON"));
        // states are shown without units
        assert_eq!(pkt.read("POWER", ValueType::WithUnits).unwrap(), Value::from("ON"));

        assert!(pkt.write("POWER", "ON", ValueType::Formatted).is_err());
    }

    #[test]
    fn custom_conversion_can_read_other_items() {
        let mut pkt = id_packet();
        pkt.set_read_conversion(
            "B",
            Arc::new(FnConversion::new("sum", |v, p| {
                let a = p.read("A", ValueType::Raw)?.to_i128()?;
                Ok(Value::Int(i64::try_from(v.to_i128()? + a).unwrap_or_default()))
            })),
        )
        .unwrap();
        pkt.set_buffer(vec![5, 10]);
        assert_eq!(pkt.read("B", ValueType::Converted).unwrap(), Value::Int(15));
    }

    #[test]
    fn defaults_are_restored_from_def() {
        let def: PacketDef = serde_json::from_str(
            r#"{
                "name": "cmd",
                "items": [
                    {"name": "OPCODE", "bit_size": 8, "data_type": "UINT", "id_value": 3, "default": 3},
                    {"name": "ARG", "bit_size": 16, "data_type": "INT", "endianness": "LITTLE_ENDIAN", "default": -2}
                ]
            }"#,
        )
        .unwrap();
        let pkt = Packet::from_def("tgt", &def).unwrap();
        assert_eq!(pkt.buffer(), &[3, 0xFE, 0xFF]);
        assert!(pkt.identify(pkt.buffer()));
    }

    #[test]
    fn array_items() {
        let mut pkt = Packet::new("TGT", "PKT");
        pkt.define_item(
            &ItemDef::builder()
                .name("ARR")
                .bit_offset(0)
                .bit_size(8)
                .array_size(32)
                .data_type(DataType::UInt)
                .read_conversion(ConversionDef::Polynomial { coeffs: vec![0.0, 2.0] })
                .build(),
        )
        .unwrap();
        pkt.write("ARR", Value::Array(vec![1u8.into(), 2u8.into()]), ValueType::Raw).unwrap();
        assert_eq!(
            pkt.read("ARR", ValueType::Converted).unwrap(),
            Value::Array(vec![2.0.into(), 4.0.into(), 0.0.into(), 0.0.into()])
        );
    }

    #[test]
    fn limits_checked_on_converted_values() {
        let mut pkt = Packet::new("TGT", "PKT");
        pkt.define_item(
            &ItemDef::builder()
                .name("V")
                .bit_offset(0)
                .bit_size(8)
                .data_type(DataType::Int)
                .limits(Limits::new(-10.0, -5.0, 5.0, 10.0))
                .build(),
        )
        .unwrap();
        pkt.set_buffer(vec![12]);
        assert_eq!(pkt.check_limits(), vec![("V".to_string(), LimitsState::RedHigh)]);
        assert_eq!(pkt.limits_state("v"), Some(LimitsState::RedHigh));

        pkt.set_limits_enabled("V", false).unwrap();
        assert!(pkt.check_limits().is_empty());
    }

    #[test]
    fn formatted_lists_items() {
        let mut pkt = id_packet();
        pkt.set_buffer(vec![5, 7]);
        assert_eq!(pkt.formatted(ValueType::Raw).unwrap(), "A: 5\nB: 7\n");
    }
}
