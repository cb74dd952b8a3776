use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::conversion::{Conversion, ConversionDef};
use super::limits::Limits;
use crate::accessor::{DataType, Endianness, Overflow};
use crate::{Error, Result, Value};

/// Declarative definition of an [Item], as found in configuration.
///
/// A `bit_offset` of `None` appends the item directly after the last defined bit of the
/// packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct ItemDef {
    #[builder(setter(into))]
    pub name: String,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub bit_offset: Option<i64>,
    pub bit_size: i64,
    pub data_type: DataType,
    /// Overrides the packet default.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub endianness: Option<Endianness>,
    /// Total bits for array items. Zero or less is a variable sized array.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub array_size: Option<i64>,
    #[builder(default)]
    #[serde(default)]
    pub overflow: Overflow,
    #[builder(default, setter(strip_option, into))]
    #[serde(default)]
    pub description: Option<String>,
    #[builder(default, setter(strip_option, into))]
    #[serde(default)]
    pub format_string: Option<String>,
    #[builder(default, setter(strip_option, into))]
    #[serde(default)]
    pub units: Option<String>,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub states: Option<BTreeMap<String, Value>>,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub read_conversion: Option<ConversionDef>,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub write_conversion: Option<ConversionDef>,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub limits: Option<Limits>,
    /// Value that must be read for the packet to be identified.
    #[builder(default, setter(strip_option, into))]
    #[serde(default)]
    pub id_value: Option<Value>,
    #[builder(default, setter(strip_option, into))]
    #[serde(default)]
    pub default: Option<Value>,
    /// Permit this item to share bits with other items.
    #[builder(default)]
    #[serde(default)]
    pub allow_overlap: bool,
}

/// A named, typed field within a packet.
#[derive(Debug, Clone)]
pub struct Item {
    pub(crate) name: String,
    pub(crate) bit_offset: i64,
    pub(crate) bit_size: i64,
    pub(crate) data_type: DataType,
    pub(crate) endianness: Endianness,
    pub(crate) array_size: Option<i64>,
    pub(crate) overflow: Overflow,
    pub(crate) description: Option<String>,
    pub(crate) format_string: Option<String>,
    pub(crate) units: Option<String>,
    pub(crate) states: Option<BTreeMap<String, Value>>,
    pub(crate) read_conversion: Option<Arc<dyn Conversion>>,
    pub(crate) write_conversion: Option<Arc<dyn Conversion>>,
    pub(crate) limits: Option<Limits>,
    pub(crate) id_value: Option<Value>,
    pub(crate) default: Option<Value>,
    pub(crate) allow_overlap: bool,
}

impl Item {
    /// Resolve `def` into an item at `bit_offset` using `default_endianness` when the
    /// definition does not specify one.
    pub(crate) fn from_def(def: &ItemDef, bit_offset: i64, default_endianness: Endianness) -> Result<Self> {
        let name = def.name.trim().to_uppercase();
        if name.is_empty() {
            return Err(Error::Configuration("item name cannot be empty".to_string()));
        }
        let item = Item {
            name,
            bit_offset,
            bit_size: def.bit_size,
            data_type: def.data_type,
            endianness: def.endianness.unwrap_or(default_endianness),
            array_size: def.array_size,
            overflow: def.overflow,
            description: def.description.clone(),
            format_string: def.format_string.clone(),
            units: def.units.clone(),
            states: def.states.clone(),
            read_conversion: def.read_conversion.as_ref().map(ConversionDef::build),
            write_conversion: def.write_conversion.as_ref().map(ConversionDef::build),
            limits: def.limits.clone(),
            id_value: def.id_value.clone(),
            default: def.default.clone(),
            allow_overlap: def.allow_overlap,
        };
        item.validate()?;
        Ok(item)
    }

    fn validate(&self) -> Result<()> {
        let err = |msg: String| Err(Error::Configuration(format!("{}: {msg}", self.name)));
        match self.array_size {
            Some(array_size) => {
                if self.bit_size <= 0 {
                    return err(format!("array items must have a positive bit_size, got {}", self.bit_size));
                }
                if array_size > 0 && array_size % self.bit_size != 0 {
                    return err(format!(
                        "array_size {array_size} not a multiple of bit_size {}",
                        self.bit_size
                    ));
                }
                if self.bit_offset < 0 && array_size <= 0 {
                    return err(format!(
                        "negative or zero array_size ({array_size}) cannot be given with negative bit_offset ({})",
                        self.bit_offset
                    ));
                }
            }
            None => {
                if self.bit_size <= 0 && !self.data_type.is_bytes() {
                    return err(format!(
                        "bit_size {} must be positive for data types other than STRING and BLOCK",
                        self.bit_size
                    ));
                }
                if self.bit_size <= 0 && self.bit_offset < 0 {
                    return err(format!(
                        "negative or zero bit_sizes ({}) cannot be given with negative bit_offsets ({})",
                        self.bit_size, self.bit_offset
                    ));
                }
            }
        }
        if self.data_type == DataType::Float && !matches!(self.bit_size, 32 | 64) {
            return err(format!("bit_size is {} but must be 32 or 64 for data_type FLOAT", self.bit_size));
        }
        if self.data_type.is_integer() && self.bit_size > 64 {
            return err(format!("bit_size {} is greater than 64 for data_type {}", self.bit_size, self.data_type));
        }
        if matches!(self.data_type, DataType::Float | DataType::String | DataType::Block)
            && self.bit_offset % 8 != 0
        {
            return err(format!(
                "bit_offset {} is not byte aligned for data_type {}",
                self.bit_offset, self.data_type
            ));
        }
        if let Some(limits) = &self.limits {
            limits.validate()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn bit_offset(&self) -> i64 {
        self.bit_offset
    }

    #[must_use]
    pub fn bit_size(&self) -> i64 {
        self.bit_size
    }

    #[must_use]
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    #[must_use]
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    #[must_use]
    pub fn array_size(&self) -> Option<i64> {
        self.array_size
    }

    #[must_use]
    pub fn overflow(&self) -> Overflow {
        self.overflow
    }

    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    #[must_use]
    pub fn units(&self) -> Option<&str> {
        self.units.as_deref()
    }

    #[must_use]
    pub fn format_string(&self) -> Option<&str> {
        self.format_string.as_deref()
    }

    #[must_use]
    pub fn id_value(&self) -> Option<&Value> {
        self.id_value.as_ref()
    }

    #[must_use]
    pub fn limits(&self) -> Option<&Limits> {
        self.limits.as_ref()
    }

    /// Size in bits of the whole item, i.e., the array size for arrays. Zero or less for
    /// variable sized items.
    #[must_use]
    pub fn total_bit_size(&self) -> i64 {
        self.array_size.unwrap_or(self.bit_size)
    }

    #[must_use]
    pub fn is_variable(&self) -> bool {
        self.total_bit_size() <= 0
    }

    /// State name for `raw`, if any.
    pub(crate) fn state_name(&self, raw: &Value) -> Option<&str> {
        self.states
            .as_ref()?
            .iter()
            .find(|(_, v)| *v == raw)
            .map(|(k, _)| k.as_str())
    }

    /// State value for the state named `name`.
    pub(crate) fn state_value(&self, name: &str) -> Option<&Value> {
        let states = self.states.as_ref()?;
        states
            .get(name)
            .or_else(|| states.get(&name.to_uppercase()))
    }

    /// Bits this item occupies in offset space. Positive and negative offsets are
    /// separate spaces since their relationship depends on the buffer length. Variable
    /// items extend to `i64::MAX`.
    pub(crate) fn occupied_bits(&self) -> Vec<Range<i64>> {
        let start = self.bit_offset;
        if self.is_variable() {
            return vec![start..i64::MAX];
        }
        let size = self.total_bit_size();
        let le_bitfield = self.endianness == Endianness::Little
            && self.data_type.is_integer()
            && self.array_size.is_none()
            && !(start % 8 == 0 && matches!(size, 8 | 16 | 32 | 64));
        if !le_bitfield {
            return vec![start..start + size];
        }
        // The field's bits are contiguous when the bytes from the MSB byte downward
        // are viewed in reverse order; map each view byte back to its real byte.
        let msb_byte = start.div_euclid(8);
        let start_bits = start.rem_euclid(8);
        let mut ranges = Vec::new();
        let mut pos = start_bits;
        while pos < start_bits + size {
            let view_byte = pos / 8;
            let end = ((view_byte + 1) * 8).min(start_bits + size);
            let real_byte = msb_byte - view_byte;
            ranges.push(real_byte * 8 + pos % 8..real_byte * 8 + (end - 1) % 8 + 1);
            pos = end;
        }
        ranges
    }

    pub(crate) fn overlaps(&self, other: &Item) -> bool {
        if (self.bit_offset < 0) != (other.bit_offset < 0) {
            return false;
        }
        let mine = self.occupied_bits();
        let theirs = other.occupied_bits();
        mine.iter()
            .any(|a| theirs.iter().any(|b| a.start < b.end && b.start < a.end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(def: &ItemDef) -> Item {
        Item::from_def(def, def.bit_offset.unwrap_or(0), Endianness::Big).unwrap()
    }

    #[test]
    fn name_is_uppercased() {
        let def = ItemDef::builder().name(" temp ").bit_size(8).data_type(DataType::UInt).build();
        assert_eq!(item(&def).name(), "TEMP");
    }

    #[test]
    fn float_must_be_32_or_64() {
        let def = ItemDef::builder().name("F").bit_size(48).data_type(DataType::Float).build();
        let err = Item::from_def(&def, 0, Endianness::Big).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn array_size_not_a_multiple_is_err() {
        let def = ItemDef::builder()
            .name("ARR")
            .bit_size(16)
            .array_size(40)
            .data_type(DataType::UInt)
            .build();
        let err = Item::from_def(&def, 0, Endianness::Big).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn variable_int_is_err() {
        let def = ItemDef::builder().name("I").bit_size(0).data_type(DataType::Int).build();
        assert!(Item::from_def(&def, 0, Endianness::Big).is_err());
    }

    #[test]
    fn big_endian_overlap() {
        let a = item(&ItemDef::builder().name("A").bit_offset(0).bit_size(12).data_type(DataType::UInt).build());
        let b = item(&ItemDef::builder().name("B").bit_offset(12).bit_size(4).data_type(DataType::UInt).build());
        let c = item(&ItemDef::builder().name("C").bit_offset(8).bit_size(8).data_type(DataType::UInt).build());
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
    }

    #[test]
    fn little_endian_bitfields_sharing_bytes_do_not_overlap() {
        // A 16-bit little endian word at bytes 0..2 split into a 12 bit and a 4 bit field.
        // The MSB of the word is in byte 1.
        let hi = item(
            &ItemDef::builder()
                .name("HI")
                .bit_offset(8)
                .bit_size(12)
                .data_type(DataType::UInt)
                .endianness(Endianness::Little)
                .build(),
        );
        let lo = item(
            &ItemDef::builder()
                .name("LO")
                .bit_offset(4)
                .bit_size(4)
                .data_type(DataType::UInt)
                .endianness(Endianness::Little)
                .build(),
        );
        assert_eq!(hi.occupied_bits(), vec![8..16, 0..4]);
        assert!(!hi.overlaps(&lo));
    }

    #[test]
    fn negative_and_positive_never_overlap() {
        let a = item(&ItemDef::builder().name("A").bit_offset(0).bit_size(0).data_type(DataType::Block).build());
        let b = item(&ItemDef::builder().name("B").bit_offset(-16).bit_size(16).data_type(DataType::UInt).build());
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn states_lookup() {
        let mut states = BTreeMap::new();
        states.insert("ON".to_string(), Value::UInt(1));
        states.insert("OFF".to_string(), Value::UInt(0));
        let def = ItemDef::builder().name("S").bit_size(8).data_type(DataType::UInt).states(states).build();
        let i = item(&def);
        assert_eq!(i.state_name(&Value::Int(1)), Some("ON"));
        assert_eq!(i.state_value("off"), Some(&Value::UInt(0)));
        assert_eq!(i.state_name(&Value::Int(7)), None);
    }
}
