//! Bit level reads and writes of typed values in byte buffers.
//!
//! Offsets and sizes are in bits. A negative `bit_offset` is measured back from the end of
//! the buffer. A `bit_size` of zero or less is only valid for [DataType::String] and
//! [DataType::Block] and means the field runs to the end of the buffer minus `|bit_size|`
//! bits.
//!
//! For [Endianness::Little] bitfields the `bit_offset` identifies the most significant bit
//! of the field and the field extends toward lower addressed bytes.
use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    #[serde(rename = "INT")]
    Int,
    #[serde(rename = "UINT")]
    UInt,
    #[serde(rename = "FLOAT")]
    Float,
    #[serde(rename = "STRING")]
    String,
    #[serde(rename = "BLOCK")]
    Block,
}

impl DataType {
    #[must_use]
    pub fn is_bytes(self) -> bool {
        matches!(self, DataType::String | DataType::Block)
    }

    #[must_use]
    pub fn is_integer(self) -> bool {
        matches!(self, DataType::Int | DataType::UInt)
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DataType::Int => "INT",
            DataType::UInt => "UINT",
            DataType::Float => "FLOAT",
            DataType::String => "STRING",
            DataType::Block => "BLOCK",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endianness {
    #[default]
    #[serde(rename = "BIG_ENDIAN")]
    Big,
    #[serde(rename = "LITTLE_ENDIAN")]
    Little,
}

/// Policy applied when a written value does not fit its field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Overflow {
    /// Out of range values are an error.
    #[default]
    #[serde(rename = "ERROR")]
    Error,
    /// Like `Error`, but signed fields also accept values up to `2^bit_size - 1` so
    /// values given in hex can be written.
    #[serde(rename = "ERROR_ALLOW_HEX")]
    ErrorAllowHex,
    /// Keep only the low `bit_size` bits of the value.
    #[serde(rename = "TRUNCATE")]
    Truncate,
    /// Clamp to the closest representable value.
    #[serde(rename = "SATURATE")]
    Saturate,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Op {
    Read,
    Write,
}

impl Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::Read => write!(f, "read"),
            Op::Write => write!(f, "write"),
        }
    }
}

fn buffer_error(op: Op, len: usize, data_type: DataType, bit_offset: i64, bit_size: i64) -> Error {
    Error::Bounds(format!(
        "{len} byte buffer insufficient to {op} {data_type} at bit_offset {bit_offset} with bit_size {bit_size}"
    ))
}

fn not_aligned(bit_offset: i64, data_type: DataType) -> Error {
    Error::Configuration(format!(
        "bit_offset {bit_offset} is not byte aligned for data_type {data_type}"
    ))
}

fn is_whole_int(bit_offset: usize, bit_size: usize) -> bool {
    bit_offset % 8 == 0 && matches!(bit_size, 8 | 16 | 32 | 64)
}

/// Resolved field location within a buffer.
struct Field {
    offset: usize,
    size: usize,
}

/// Common handling of negative offsets and sizes plus the buffer bounds check.
///
/// Returns `None` for a variable sized field that resolves to zero bits.
fn locate(
    op: Op,
    bit_offset: i64,
    bit_size: i64,
    data_type: DataType,
    len: usize,
    endianness: Endianness,
) -> Result<Option<Field>> {
    let len_bits = i64::try_from(len).map_err(|_| buffer_error(op, len, data_type, bit_offset, bit_size))? * 8;
    let mut offset = bit_offset;
    if bit_offset < 0 {
        if bit_size <= 0 {
            return Err(Error::Configuration(format!(
                "negative or zero bit_sizes ({bit_size}) cannot be given with negative bit_offsets ({bit_offset})"
            )));
        }
        offset = len_bits + bit_offset;
        if offset < 0 {
            return Err(buffer_error(op, len, data_type, bit_offset, bit_size));
        }
    }
    let mut size = bit_size;
    if bit_size <= 0 {
        if !data_type.is_bytes() {
            return Err(Error::Configuration(format!(
                "bit_size {bit_size} must be positive for data types other than STRING and BLOCK"
            )));
        }
        size = len_bits - offset + bit_size;
        if size == 0 {
            return Ok(None);
        }
        if size < 0 {
            return Err(buffer_error(op, len, data_type, bit_offset, bit_size));
        }
    }

    // both are positive at this point
    let offset = usize::try_from(offset).unwrap_or_default();
    let size = usize::try_from(size).unwrap_or_default();
    let lower = offset / 8;
    let upper = (offset + size - 1) / 8;
    if upper >= len {
        // Little endian bitfields extend toward lower addresses so only the byte holding
        // the most significant bit must be present.
        let le_bitfield = endianness == Endianness::Little
            && data_type.is_integer()
            && !is_whole_int(offset, size)
            && lower < len;
        if !le_bitfield {
            return Err(buffer_error(op, len, data_type, bit_offset, bit_size));
        }
    }
    Ok(Some(Field { offset, size }))
}

/// Byte range `(lower, upper)`, inclusive, holding a bitfield.
fn bitfield_bounds(
    offset: usize,
    size: usize,
    endianness: Endianness,
    bit_offset: i64,
    bit_size: i64,
) -> Result<(usize, usize)> {
    match endianness {
        Endianness::Big => Ok((offset / 8, (offset + size - 1) / 8)),
        Endianness::Little => {
            let num_bytes = ((offset % 8) + size - 1) / 8 + 1;
            let upper = offset / 8;
            if num_bytes > upper + 1 {
                return Err(Error::Configuration(format!(
                    "LITTLE_ENDIAN bitfield with bit_offset {bit_offset} and bit_size {bit_size} is invalid"
                )));
            }
            Ok((upper + 1 - num_bytes, upper))
        }
    }
}

/// Bytes of a bitfield in most-significant-first order.
fn bitfield_bytes(buffer: &[u8], lower: usize, upper: usize, endianness: Endianness) -> Vec<u8> {
    let mut bytes = buffer[lower..=upper].to_vec();
    if endianness == Endianness::Little {
        bytes.reverse();
    }
    bytes
}

fn mask(size: usize) -> u128 {
    (1u128 << size) - 1
}

#[allow(clippy::cast_possible_truncation)]
fn read_bitfield(buffer: &[u8], field: &Field, endianness: Endianness, bit_offset: i64, bit_size: i64) -> Result<u64> {
    let (lower, upper) = bitfield_bounds(field.offset, field.size, endianness, bit_offset, bit_size)?;
    let bytes = bitfield_bytes(buffer, lower, upper, endianness);
    let acc = bytes.iter().fold(0u128, |acc, b| acc << 8 | u128::from(*b));
    let end_bits = bytes.len() * 8 - (field.offset % 8) - field.size;
    Ok(((acc >> end_bits) & mask(field.size)) as u64)
}

fn write_bitfield(
    raw: u64,
    buffer: &mut [u8],
    field: &Field,
    endianness: Endianness,
    bit_offset: i64,
    bit_size: i64,
) -> Result<()> {
    let (lower, upper) = bitfield_bounds(field.offset, field.size, endianness, bit_offset, bit_size)?;
    let bytes = bitfield_bytes(buffer, lower, upper, endianness);
    let acc = bytes.iter().fold(0u128, |acc, b| acc << 8 | u128::from(*b));
    let end_bits = bytes.len() * 8 - (field.offset % 8) - field.size;
    let field_mask = mask(field.size) << end_bits;
    let acc = (acc & !field_mask) | ((u128::from(raw) << end_bits) & field_mask);

    let num = bytes.len();
    let mut out: Vec<u8> = (0..num)
        .map(|i| {
            #[allow(clippy::cast_possible_truncation)]
            let b = (acc >> (8 * (num - 1 - i))) as u8;
            b
        })
        .collect();
    if endianness == Endianness::Little {
        out.reverse();
    }
    buffer[lower..=upper].copy_from_slice(&out);
    Ok(())
}

fn sign_extend(raw: u64, size: usize) -> i64 {
    if size > 1 && size < 64 && raw & (1 << (size - 1)) != 0 {
        #[allow(clippy::cast_possible_wrap)]
        let v = (raw | !((1u64 << size) - 1)) as i64;
        v
    } else {
        #[allow(clippy::cast_possible_wrap)]
        let v = raw as i64;
        v
    }
}

fn read_whole_int(buffer: &[u8], start: usize, size: usize, endianness: Endianness) -> u64 {
    let mut bytes = [0u8; 8];
    let n = size / 8;
    bytes[8 - n..].copy_from_slice(&buffer[start..start + n]);
    if endianness == Endianness::Little {
        bytes[8 - n..].reverse();
    }
    u64::from_be_bytes(bytes)
}

/// Read a value from `buffer`.
///
/// # Errors
/// [Error::Bounds] if the field is outside `buffer`. [Error::Configuration] for invalid
/// `data_type`/`bit_size` combinations, e.g., a 48-bit float or an unaligned string.
pub fn read(
    bit_offset: i64,
    bit_size: i64,
    data_type: DataType,
    buffer: &[u8],
    endianness: Endianness,
) -> Result<Value> {
    let Some(field) = locate(Op::Read, bit_offset, bit_size, data_type, buffer.len(), endianness)? else {
        return Ok(match data_type {
            DataType::String => Value::String(String::new()),
            _ => Value::Block(Vec::new()),
        });
    };
    let aligned = field.offset % 8 == 0;

    match data_type {
        DataType::String | DataType::Block => {
            if !aligned {
                return Err(not_aligned(bit_offset, data_type));
            }
            let lower = field.offset / 8;
            let upper = (field.offset + field.size - 1) / 8;
            let bytes = &buffer[lower..=upper];
            if data_type == DataType::String {
                let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
                Ok(Value::String(String::from_utf8_lossy(&bytes[..end]).into_owned()))
            } else {
                Ok(Value::Block(bytes.to_vec()))
            }
        }
        DataType::Int | DataType::UInt => {
            if field.size > 64 {
                return Err(Error::Configuration(format!(
                    "bit_size {bit_size} is greater than 64 for data_type {data_type}"
                )));
            }
            let raw = if is_whole_int(field.offset, field.size) {
                read_whole_int(buffer, field.offset / 8, field.size, endianness)
            } else {
                read_bitfield(buffer, &field, endianness, bit_offset, bit_size)?
            };
            if data_type == DataType::Int {
                Ok(Value::Int(sign_extend(raw, field.size)))
            } else {
                Ok(Value::UInt(raw))
            }
        }
        DataType::Float => {
            if !aligned {
                return Err(not_aligned(bit_offset, data_type));
            }
            let start = field.offset / 8;
            match field.size {
                32 => {
                    #[allow(clippy::cast_possible_truncation)]
                    let bits = read_whole_int(buffer, start, 32, endianness) as u32;
                    Ok(Value::Float(f64::from(f32::from_bits(bits))))
                }
                64 => Ok(Value::Float(f64::from_bits(read_whole_int(
                    buffer, start, 64, endianness,
                )))),
                _ => Err(Error::Configuration(format!(
                    "bit_size is {bit_size} but must be 32 or 64 for data_type {data_type}"
                ))),
            }
        }
    }
}

/// Integer range `(min, max, hex_max)` representable by a field.
fn int_range(bit_size: usize, data_type: DataType) -> (i128, i128, i128) {
    let hex_max = (1i128 << bit_size) - 1;
    match data_type {
        DataType::Int if bit_size > 1 => {
            let half = 1i128 << (bit_size - 1);
            (-half, half - 1, hex_max)
        }
        DataType::Int => (-1, 1, 1),
        _ => (0, hex_max, hex_max),
    }
}

/// Apply the overflow policy to `value` for a `bit_size` integer field, returning the
/// raw bits to store.
///
/// # Errors
/// [Error::Overflow] when the policy rejects the value.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
pub fn check_overflow(value: i128, bit_size: usize, data_type: DataType, overflow: Overflow) -> Result<u64> {
    let (min, max, hex_max) = int_range(bit_size, data_type);
    let invalid = || {
        Error::Overflow(format!(
            "value of {value} invalid for {bit_size}-bit {data_type}"
        ))
    };
    let value = match overflow {
        Overflow::Truncate => value,
        Overflow::Saturate => value.clamp(min, max),
        Overflow::Error | Overflow::ErrorAllowHex => {
            if value < min {
                return Err(invalid());
            }
            let limit = if overflow == Overflow::ErrorAllowHex { hex_max } else { max };
            if value > limit {
                return Err(invalid());
            }
            value
        }
    };
    Ok((value & mask(bit_size) as i128) as u64)
}

fn write_whole_int(raw: u64, buffer: &mut [u8], start: usize, size: usize, endianness: Endianness) {
    let n = size / 8;
    let bytes = raw.to_be_bytes();
    let dest = &mut buffer[start..start + n];
    dest.copy_from_slice(&bytes[8 - n..]);
    if endianness == Endianness::Little {
        dest.reverse();
    }
}

/// Write `value` into `buffer`.
///
/// Variable sized STRING and BLOCK fields (`bit_size <= 0`) resize `buffer` to hold the
/// value, keeping the trailing `|bit_size|` bits in place.
///
/// # Errors
/// [Error::Bounds] if the field is outside `buffer`, [Error::Overflow] if `overflow`
/// rejects the value, and [Error::Configuration] for invalid field definitions or values
/// that cannot be converted to `data_type`.
#[allow(clippy::too_many_arguments)]
pub fn write(
    value: &Value,
    bit_offset: i64,
    bit_size: i64,
    data_type: DataType,
    buffer: &mut Vec<u8>,
    endianness: Endianness,
    overflow: Overflow,
) -> Result<()> {
    if data_type.is_bytes() {
        return write_bytes(&value.to_bytes()?, bit_offset, bit_size, data_type, buffer, overflow);
    }

    let Some(field) = locate(Op::Write, bit_offset, bit_size, data_type, buffer.len(), endianness)? else {
        return Ok(());
    };
    match data_type {
        DataType::Int | DataType::UInt => {
            if field.size > 64 {
                return Err(Error::Configuration(format!(
                    "bit_size {bit_size} is greater than 64 for data_type {data_type}"
                )));
            }
            let raw = check_overflow(value.to_i128()?, field.size, data_type, overflow)?;
            if is_whole_int(field.offset, field.size) {
                write_whole_int(raw, buffer, field.offset / 8, field.size, endianness);
                Ok(())
            } else {
                write_bitfield(raw, buffer, &field, endianness, bit_offset, bit_size)
            }
        }
        DataType::Float => {
            if field.offset % 8 != 0 {
                return Err(not_aligned(bit_offset, data_type));
            }
            let v = value.to_f64()?;
            let start = field.offset / 8;
            match field.size {
                #[allow(clippy::cast_possible_truncation)]
                32 => write_whole_int(u64::from((v as f32).to_bits()), buffer, start, 32, endianness),
                64 => write_whole_int(v.to_bits(), buffer, start, 64, endianness),
                _ => {
                    return Err(Error::Configuration(format!(
                        "bit_size is {bit_size} but must be 32 or 64 for data_type {data_type}"
                    )))
                }
            }
            Ok(())
        }
        DataType::String | DataType::Block => unreachable!("handled above"),
    }
}

fn write_bytes(
    value: &[u8],
    bit_offset: i64,
    bit_size: i64,
    data_type: DataType,
    buffer: &mut Vec<u8>,
    overflow: Overflow,
) -> Result<()> {
    if bit_size <= 0 {
        if bit_offset < 0 {
            return Err(Error::Configuration(format!(
                "negative or zero bit_sizes ({bit_size}) cannot be given with negative bit_offsets ({bit_offset})"
            )));
        }
        if bit_offset % 8 != 0 {
            return Err(not_aligned(bit_offset, data_type));
        }
        let lower = usize::try_from(bit_offset / 8).unwrap_or_default();
        if lower > buffer.len() {
            return Err(buffer_error(Op::Write, buffer.len(), data_type, bit_offset, bit_size));
        }
        let end_bytes = usize::try_from(-bit_size / 8).unwrap_or_default();
        let region_end = buffer.len().saturating_sub(end_bytes).max(lower);
        buffer.splice(lower..region_end, value.iter().copied());
        return Ok(());
    }

    let field = locate(Op::Write, bit_offset, bit_size, data_type, buffer.len(), Endianness::Big)?
        .ok_or_else(|| buffer_error(Op::Write, buffer.len(), data_type, bit_offset, bit_size))?;
    if field.offset % 8 != 0 {
        return Err(not_aligned(bit_offset, data_type));
    }
    let byte_size = field.size / 8;
    if value.len() > byte_size && overflow != Overflow::Truncate {
        return Err(Error::Overflow(format!(
            "value of {} bytes does not fit into {byte_size} bytes for data_type {data_type}",
            value.len()
        )));
    }
    let lower = field.offset / 8;
    let n = value.len().min(byte_size);
    let dest = &mut buffer[lower..lower + byte_size];
    dest[..n].copy_from_slice(&value[..n]);
    dest[n..].fill(0);
    Ok(())
}

/// Resolve an array's starting bit and element count.
fn array_extent(
    op: Op,
    bit_offset: i64,
    bit_size: i64,
    data_type: DataType,
    array_size: i64,
    len: usize,
) -> Result<(i64, usize)> {
    if bit_size <= 0 {
        return Err(Error::Configuration(format!(
            "bit_size {bit_size} must be positive for arrays"
        )));
    }
    let len_bits = i64::try_from(len).unwrap_or(i64::MAX / 8) * 8;
    let mut offset = bit_offset;
    if bit_offset < 0 {
        if array_size <= 0 {
            return Err(Error::Configuration(format!(
                "negative or zero array_size ({array_size}) cannot be given with negative bit_offset ({bit_offset})"
            )));
        }
        offset = len_bits + bit_offset;
        if offset < 0 {
            return Err(buffer_error(op, len, data_type, bit_offset, bit_size));
        }
    }
    let array_bits = if array_size <= 0 {
        len_bits - offset + array_size
    } else {
        array_size
    };
    if array_bits < 0 {
        return Err(buffer_error(op, len, data_type, bit_offset, bit_size));
    }
    // A variable array being written is resized to fit, so only its new size matters.
    if array_bits % bit_size != 0 && (array_size > 0 || op == Op::Read) {
        return Err(Error::Configuration(format!(
            "array_size {array_size} not a multiple of bit_size {bit_size}"
        )));
    }
    Ok((offset, usize::try_from(array_bits / bit_size).unwrap_or_default()))
}

/// Read an array of `bit_size` elements spanning `array_size` bits.
///
/// An `array_size` of zero or less reads to the end of the buffer minus `|array_size|` bits.
///
/// # Errors
/// See [read].
pub fn read_array(
    bit_offset: i64,
    bit_size: i64,
    data_type: DataType,
    array_size: i64,
    buffer: &[u8],
    endianness: Endianness,
) -> Result<Vec<Value>> {
    let (offset, count) = array_extent(Op::Read, bit_offset, bit_size, data_type, array_size, buffer.len())?;
    (0..count)
        .map(|i| {
            let elem_offset = offset + i64::try_from(i).unwrap_or_default() * bit_size;
            read(elem_offset, bit_size, data_type, buffer, endianness)
        })
        .collect()
}

/// Write `values` as an array of `bit_size` elements spanning `array_size` bits.
///
/// A variable sized array (`array_size <= 0`) resizes `buffer` to hold exactly `values`,
/// keeping the trailing `|array_size|` bits in place.
///
/// # Errors
/// [Error::Overflow] if more values are given than fit a fixed size array, otherwise see
/// [write].
#[allow(clippy::too_many_arguments)]
pub fn write_array(
    values: &[Value],
    bit_offset: i64,
    bit_size: i64,
    data_type: DataType,
    array_size: i64,
    buffer: &mut Vec<u8>,
    endianness: Endianness,
    overflow: Overflow,
) -> Result<()> {
    let (offset, capacity) =
        array_extent(Op::Write, bit_offset, bit_size, data_type, array_size, buffer.len())?;
    let n = i64::try_from(values.len()).unwrap_or(i64::MAX);
    if array_size <= 0 {
        if (bit_size * n) % 8 != 0 || offset % 8 != 0 {
            return Err(Error::Configuration(
                "variable sized arrays must be byte aligned".to_string(),
            ));
        }
        let lower = usize::try_from(offset / 8).unwrap_or_default();
        let end_bytes = usize::try_from(-array_size / 8).unwrap_or_default();
        let region_end = buffer.len().saturating_sub(end_bytes).max(lower);
        let new_len = usize::try_from(bit_size * n / 8).unwrap_or_default();
        buffer.splice(lower..region_end, std::iter::repeat(0u8).take(new_len));
    } else if values.len() > capacity {
        return Err(Error::Overflow(format!(
            "too many values ({}) for array of {capacity} elements",
            values.len()
        )));
    }
    for (i, value) in values.iter().enumerate() {
        let elem_offset = offset + i64::try_from(i).unwrap_or_default() * bit_size;
        write(value, elem_offset, bit_size, data_type, buffer, endianness, overflow)?;
    }
    Ok(())
}
