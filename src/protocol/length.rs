use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::{BurstConfig, Framer, PacketOutcome, Protocol, ReadOutcome};
use crate::accessor::{self, DataType, Endianness, Overflow};
use crate::packet::Packet;
use crate::{Error, Result, Value};

fn default_bit_size() -> i64 {
    16
}

fn default_bytes_per_count() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct LengthConfig {
    /// Bit offset of the length field, counted from the start of the frame including
    /// any discarded leading bytes.
    #[builder(default)]
    #[serde(default)]
    pub bit_offset: i64,
    #[builder(default = 16)]
    #[serde(default = "default_bit_size")]
    pub bit_size: i64,
    /// Added to `length * bytes_per_count` to get the total frame length, e.g., 7 for a
    /// CCSDS packet length field.
    #[builder(default)]
    #[serde(default)]
    pub value_offset: i64,
    #[builder(default = 1)]
    #[serde(default = "default_bytes_per_count")]
    pub bytes_per_count: i64,
    #[builder(default)]
    #[serde(default)]
    pub endianness: Endianness,
    #[builder(default)]
    #[serde(default)]
    pub discard_leading_bytes: usize,
    #[builder(default, setter(strip_option))]
    #[serde(default, with = "super::hex_pattern")]
    pub sync_pattern: Option<Vec<u8>>,
    /// Largest accepted value of the length field.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub max_length: Option<u64>,
    /// Fill the length field and sync pattern on write.
    #[builder(default)]
    #[serde(default)]
    pub fill_length_and_sync_pattern: bool,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub allow_empty_data: Option<bool>,
}

#[derive(Debug)]
struct LengthField {
    bit_offset: i64,
    bit_size: i64,
    value_offset: i64,
    bytes_per_count: i64,
    endianness: Endianness,
    max_length: Option<u64>,
    bytes_needed: usize,
}

impl LengthField {
    fn reduce(&self, buf: &mut Vec<u8>) -> Result<ReadOutcome> {
        if buf.len() < self.bytes_needed {
            return Ok(ReadOutcome::Stop);
        }
        let length = accessor::read(
            self.bit_offset,
            self.bit_size,
            DataType::UInt,
            buf,
            self.endianness,
        )?
        .to_i128()?;
        if let Some(max) = self.max_length {
            if length > i128::from(max) {
                return Err(Error::Protocol(format!(
                    "Length value received larger than max_length: {length} > {max}"
                )));
            }
        }
        let frame_length = length * i128::from(self.bytes_per_count) + i128::from(self.value_offset);
        let frame_length = usize::try_from(frame_length)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "length value {length} gives invalid frame length {frame_length}"
                ))
            })?;
        if buf.len() < frame_length {
            return Ok(ReadOutcome::Stop);
        }
        Ok(ReadOutcome::Data(buf.drain(..frame_length).collect()))
    }

    /// Length field value for a frame of `frame_length` bytes.
    fn value_for(&self, frame_length: usize) -> Result<Value> {
        let length = frame_length as i64 / self.bytes_per_count - self.value_offset;
        if let Some(max) = self.max_length {
            if length > 0 && length as u64 > max {
                return Err(Error::Protocol(format!(
                    "Calculated length {length} larger than max_length {max}"
                )));
            }
        }
        Ok(Value::Int(length))
    }

    fn write(&self, value: &Value, bit_offset: i64, buffer: &mut Vec<u8>) -> Result<()> {
        accessor::write(
            value,
            bit_offset,
            self.bit_size,
            DataType::UInt,
            buffer,
            self.endianness,
            Overflow::Error,
        )
    }
}

/// Frames delineated by a length field in the frame header.
#[derive(Debug)]
pub struct LengthProtocol {
    framer: Framer,
    field: LengthField,
}

impl LengthProtocol {
    /// # Errors
    /// [Error::Configuration] for a length field that cannot be read as an unsigned
    /// integer or a non-positive `bytes_per_count`.
    pub fn new(config: LengthConfig) -> Result<Self> {
        if config.bit_offset < 0 || !(1..=64).contains(&config.bit_size) {
            return Err(Error::Configuration(format!(
                "invalid length field at bit_offset {} with bit_size {}",
                config.bit_offset, config.bit_size
            )));
        }
        if config.bytes_per_count <= 0 {
            return Err(Error::Configuration(format!(
                "bytes_per_count must be positive, got {}",
                config.bytes_per_count
            )));
        }

        let bytes_needed = if config.endianness == Endianness::Big || config.bit_offset % 8 == 0 {
            let mut bits = config.bit_offset + config.bit_size;
            if bits % 8 != 0 {
                bits += 8;
            }
            ((bits - 1) / 8 + 1) as usize
        } else {
            (config.bit_offset / 8 + 1) as usize
        };

        Ok(LengthProtocol {
            framer: Framer::new(BurstConfig {
                discard_leading_bytes: config.discard_leading_bytes,
                sync_pattern: config.sync_pattern,
                fill_fields: config.fill_length_and_sync_pattern,
                allow_empty_data: config.allow_empty_data,
            }),
            field: LengthField {
                bit_offset: config.bit_offset,
                bit_size: config.bit_size,
                value_offset: config.value_offset,
                bytes_per_count: config.bytes_per_count,
                endianness: config.endianness,
                max_length: config.max_length,
                bytes_needed,
            },
        })
    }

    fn discard_bits(&self) -> i64 {
        self.framer.discard_leading_bytes as i64 * 8
    }
}

impl Protocol for LengthProtocol {
    fn name(&self) -> &'static str {
        "length"
    }

    fn read_data(&mut self, data: &[u8]) -> Result<ReadOutcome> {
        let field = &self.field;
        self.framer.read_data(data, |buf| field.reduce(buf))
    }

    fn write_packet(&mut self, mut packet: Packet) -> Result<PacketOutcome> {
        // Length fields inside the packet are filled here; fields within discarded
        // leading bytes are filled in write_data.
        if self.framer.fill_fields && self.field.bit_offset >= self.discard_bits() {
            let value = self
                .field
                .value_for(packet.len() + self.framer.discard_leading_bytes)?;
            let offset = self.field.bit_offset - self.discard_bits();
            self.field.write(&value, offset, packet.buffer_mut())?;
        }
        self.framer.write_packet(packet)
    }

    fn write_data(&mut self, data: Vec<u8>) -> Result<ReadOutcome> {
        let mut data = self.framer.write_data(data)?;
        if self.framer.fill_fields && self.field.bit_offset < self.discard_bits() {
            let value = self.field.value_for(data.len())?;
            self.field.write(&value, self.field.bit_offset, &mut data)?;
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
    use test_case::test_case;

    fn protocol(config: LengthConfig) -> LengthProtocol {
        let mut p = LengthProtocol::new(config).unwrap();
        p.set_last_read_protocol(true);
        p
    }

    #[test]
    fn four_byte_length_field_waits_for_full_frame() {
        let mut p = protocol(LengthConfig::builder().bit_size(32).build());

        assert_eq!(
            p.read_data(&hex::decode("00000006AABB").unwrap()).unwrap(),
            ReadOutcome::Data(hex::decode("00000006AABB").unwrap())
        );

        assert_eq!(
            p.read_data(&hex::decode("00000006AA").unwrap()).unwrap(),
            ReadOutcome::Stop
        );
        assert_eq!(
            p.read_data(&[0xBB]).unwrap(),
            ReadOutcome::Data(hex::decode("00000006AABB").unwrap())
        );
    }

    #[test]
    fn stops_until_length_field_available() {
        let mut p = protocol(LengthConfig::builder().bit_size(32).build());
        assert_eq!(p.read_data(&[0, 0]).unwrap(), ReadOutcome::Stop);
        assert_eq!(p.read_data(&[0, 5, 1]).unwrap(), ReadOutcome::Data(vec![0, 0, 0, 5, 1]));
    }

    #[test]
    fn multiple_frames_in_one_read() {
        let mut p = protocol(LengthConfig::builder().bit_offset(8).bit_size(8).build());
        assert_eq!(
            p.read_data(&[0xA, 3, 1, 0xB, 2, 0xC]).unwrap(),
            ReadOutcome::Data(vec![0xA, 3, 1])
        );
        assert_eq!(p.read_data(&[]).unwrap(), ReadOutcome::Data(vec![0xB, 2]));
        assert_eq!(p.read_data(&[]).unwrap(), ReadOutcome::Stop);
        assert_eq!(p.read_data(&[2]).unwrap(), ReadOutcome::Data(vec![0xC, 2]));
    }

    #[test]
    fn ccsds_packet_length() {
        let mut p = protocol(
            LengthConfig::builder()
                .bit_offset(32)
                .bit_size(16)
                .value_offset(7)
                .build(),
        );
        let packet = [0x08, 0x01, 0xC0, 0x00, 0x00, 0x01, 0xAA, 0xBB];
        let mut input = packet.to_vec();
        input.extend_from_slice(&packet);
        assert_eq!(p.read_data(&input).unwrap(), ReadOutcome::Data(packet.to_vec()));
        assert_eq!(p.read_data(&[]).unwrap(), ReadOutcome::Data(packet.to_vec()));
    }

    #[test_case(2, 0, 8 ; "count in words")]
    #[test_case(1, 4, 8 ; "payload only count")]
    fn length_units(bytes_per_count: i64, value_offset: i64, expected: usize) {
        let mut p = protocol(
            LengthConfig::builder()
                .bit_size(8)
                .bytes_per_count(bytes_per_count)
                .value_offset(value_offset)
                .build(),
        );
        let frame = [4, 1, 2, 3, 4, 5, 6, 7];
        let ReadOutcome::Data(got) = p.read_data(&frame).unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(got.len(), expected);
    }

    #[test]
    fn max_length_exceeded_is_protocol_error() {
        let mut p = protocol(LengthConfig::builder().bit_size(8).max_length(10).build());
        let err = p.read_data(&[50, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err}");
        assert!(err.to_string().contains("larger than max_length"));
        p.resync();
        assert_eq!(p.read_data(&[2, 9]).unwrap(), ReadOutcome::Data(vec![2, 9]));
    }

    #[test]
    fn zero_length_is_protocol_error() {
        let mut p = protocol(LengthConfig::builder().bit_size(8).build());
        assert!(matches!(p.read_data(&[0, 1]), Err(Error::Protocol(_))));
    }

    #[test]
    fn sync_and_discard() {
        let mut p = protocol(
            LengthConfig::builder()
                .bit_offset(16)
                .bit_size(8)
                .sync_pattern(vec![0xCA, 0xFE])
                .discard_leading_bytes(2)
                .build(),
        );
        assert_eq!(
            p.read_data(&[0x00, 0xCA, 0xFE, 4, 0xEE, 0xFF]).unwrap(),
            ReadOutcome::Data(vec![4, 0xEE])
        );
    }

    #[test]
    fn fill_length_and_sync_on_write() {
        let mut p = protocol(
            LengthConfig::builder()
                .bit_offset(16)
                .bit_size(8)
                .sync_pattern(vec![0xCA, 0xFE])
                .discard_leading_bytes(2)
                .fill_length_and_sync_pattern(true)
                .build(),
        );
        let PacketOutcome::Packet(packet) = p.write_packet(Packet::from_buffer(vec![0, 1, 2])).unwrap()
        else {
            panic!("expected packet");
        };
        assert_eq!(packet.buffer(), &[5, 1, 2]);
        let out = p.write_data(packet.into_buffer()).unwrap();
        assert_eq!(out, ReadOutcome::Data(vec![0xCA, 0xFE, 5, 1, 2]));

        // what is written reads back
        let ReadOutcome::Data(out) = out else { unreachable!() };
        assert_eq!(p.read_data(&out).unwrap(), ReadOutcome::Data(vec![5, 1, 2]));
    }

    #[test]
    fn fill_length_in_discarded_bytes() {
        let mut p = protocol(
            LengthConfig::builder()
                .bit_size(16)
                .discard_leading_bytes(2)
                .fill_length_and_sync_pattern(true)
                .build(),
        );
        assert_eq!(
            p.write_data(vec![0xAA, 0xBB]).unwrap(),
            ReadOutcome::Data(vec![0, 4, 0xAA, 0xBB])
        );
    }

    #[test]
    fn invalid_config() {
        assert!(LengthProtocol::new(LengthConfig::builder().bit_size(0).build()).is_err());
        assert!(LengthProtocol::new(LengthConfig::builder().bytes_per_count(0).build()).is_err());
    }
}
