use std::fmt;
use std::sync::{Mutex, PoisonError};

use crc::{Algorithm, Crc, CRC_16_IBM_3740, CRC_32_ISO_HDLC, CRC_64_XZ};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::error;
use typed_builder::TypedBuilder;

use super::{EmptyData, PacketOutcome, Protocol, ReadOutcome};
use crate::accessor::{self, DataType, Endianness, Overflow};
use crate::packet::{Packet, ValueType};
use crate::{Error, Result, Value};

/// What to do with a frame whose CRC does not match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BadCrcStrategy {
    /// Log and drop the frame.
    #[default]
    Drop,
    /// Fail with a recoverable protocol error.
    Error,
    /// Pass the frame on with `extra["CRC_ERROR"] = true`.
    Flag,
    /// Disconnect the interface.
    Disconnect,
}

fn default_bit_size() -> u32 {
    32
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct CrcConfig {
    /// Item filled with the CRC of the preceding bytes on write. If unset, the CRC is
    /// appended to written data.
    #[builder(default, setter(strip_option, into))]
    #[serde(default)]
    pub write_item_name: Option<String>,
    /// Remove the CRC from received frames.
    #[builder(default)]
    #[serde(default)]
    pub strip_crc: bool,
    #[builder(default)]
    #[serde(default)]
    pub bad_strategy: BadCrcStrategy,
    /// Byte aligned offset of the CRC, negative from the end of the frame. Defaults to
    /// a trailing CRC.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub bit_offset: Option<i64>,
    /// 16, 32 or 64.
    #[builder(default = 32)]
    #[serde(default = "default_bit_size")]
    pub bit_size: u32,
    #[builder(default)]
    #[serde(default)]
    pub endianness: Endianness,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub poly: Option<u64>,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub seed: Option<u64>,
    /// Invert the final CRC.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub xor: Option<bool>,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub reflect: Option<bool>,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub allow_empty_data: Option<bool>,
}

enum Checksum {
    C16(Crc<u16>),
    C32(Crc<u32>),
    C64(Crc<u64>),
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checksum::C16(c) => write!(f, "Crc16(poly={:#06x})", c.algorithm.poly),
            Checksum::C32(c) => write!(f, "Crc32(poly={:#010x})", c.algorithm.poly),
            Checksum::C64(c) => write!(f, "Crc64(poly={:#018x})", c.algorithm.poly),
        }
    }
}

static CUSTOM_16: Mutex<Vec<&'static Algorithm<u16>>> = Mutex::new(Vec::new());
static CUSTOM_32: Mutex<Vec<&'static Algorithm<u32>>> = Mutex::new(Vec::new());
static CUSTOM_64: Mutex<Vec<&'static Algorithm<u64>>> = Mutex::new(Vec::new());

/// Return the cached algorithm equal to `alg`, leaking it on first use since `crc`
/// requires a `'static` algorithm. Each distinct parameter set is leaked once.
fn intern<W>(cache: &Mutex<Vec<&'static Algorithm<W>>>, alg: Algorithm<W>) -> &'static Algorithm<W>
where
    W: crc::Width + Copy + PartialEq + 'static,
{
    let mut cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
    let same = |a: &Algorithm<W>| {
        a.width == alg.width
            && a.poly == alg.poly
            && a.init == alg.init
            && a.refin == alg.refin
            && a.refout == alg.refout
            && a.xorout == alg.xorout
    };
    if let Some(&found) = cache.iter().find(|&&a| same(a)) {
        return found;
    }
    let leaked: &'static Algorithm<W> = Box::leak(Box::new(alg));
    cache.push(leaked);
    leaked
}

/// Build an algorithm from `base` with any of the configured parameters replaced.
///
/// Returns `base` untouched when nothing is customized.
macro_rules! algorithm {
    ($base:expr, $ty:ty, $cache:expr, $config:expr) => {{
        let base: &'static Algorithm<$ty> = $base;
        let c = $config;
        if c.poly.is_none() && c.seed.is_none() && c.xor.is_none() && c.reflect.is_none() {
            Ok(base)
        } else {
            let narrow = |v: u64, what: &str| {
                <$ty>::try_from(v).map_err(|_| {
                    Error::Configuration(format!("CRC {what} {v:#x} too wide for {} bits", <$ty>::BITS))
                })
            };
            let poly = match c.poly {
                Some(p) => narrow(p, "poly")?,
                None => base.poly,
            };
            let init = match c.seed {
                Some(s) => narrow(s, "seed")?,
                None => base.init,
            };
            let reflect = c.reflect.unwrap_or(base.refin);
            let xorout = match c.xor {
                Some(true) => <$ty>::MAX,
                Some(false) => 0,
                None => base.xorout,
            };
            let alg = intern(
                &$cache,
                Algorithm {
                    width: <$ty>::BITS as u8,
                    poly,
                    init,
                    refin: reflect,
                    refout: reflect,
                    xorout,
                    check: 0,
                    residue: 0,
                },
            );
            Ok::<_, Error>(alg)
        }
    }};
}

impl Checksum {
    fn new(config: &CrcConfig) -> Result<Self> {
        Ok(match config.bit_size {
            16 => Checksum::C16(Crc::<u16>::new(algorithm!(&CRC_16_IBM_3740, u16, CUSTOM_16, config)?)),
            32 => Checksum::C32(Crc::<u32>::new(algorithm!(&CRC_32_ISO_HDLC, u32, CUSTOM_32, config)?)),
            64 => Checksum::C64(Crc::<u64>::new(algorithm!(&CRC_64_XZ, u64, CUSTOM_64, config)?)),
            other => {
                return Err(Error::Configuration(format!(
                    "invalid CRC bit size {other}, must be 16, 32, or 64"
                )))
            }
        })
    }

    fn checksum(&self, data: &[u8]) -> u64 {
        match self {
            Checksum::C16(c) => u64::from(c.checksum(data)),
            Checksum::C32(c) => u64::from(c.checksum(data)),
            Checksum::C64(c) => c.checksum(data),
        }
    }
}

/// Validates, strips, and appends frame CRCs.
#[derive(Debug)]
pub struct CrcProtocol {
    checksum: Checksum,
    write_item_name: Option<String>,
    strip_crc: bool,
    bad_strategy: BadCrcStrategy,
    bit_offset: i64,
    bit_size: i64,
    endianness: Endianness,
    empty: EmptyData,
    flag_next: bool,
}

impl CrcProtocol {
    /// # Errors
    /// [Error::Configuration] for unsupported sizes, unaligned offsets, or parameters
    /// wider than the CRC.
    pub fn new(config: CrcConfig) -> Result<Self> {
        let checksum = Checksum::new(&config)?;
        let bit_size = i64::from(config.bit_size);
        let bit_offset = config.bit_offset.unwrap_or(-bit_size);
        if bit_offset % 8 != 0 {
            return Err(Error::Configuration(format!(
                "invalid CRC bit offset {bit_offset}, must be divisible by 8"
            )));
        }
        Ok(CrcProtocol {
            checksum,
            write_item_name: config.write_item_name,
            strip_crc: config.strip_crc,
            bad_strategy: config.bad_strategy,
            bit_offset,
            bit_size,
            endianness: config.endianness,
            empty: EmptyData::new(config.allow_empty_data),
            flag_next: false,
        })
    }

    /// Byte index of a CRC at `bit_offset` in a buffer of `len` bytes.
    fn crc_start(bit_offset: i64, len: usize) -> Option<usize> {
        let start = if bit_offset < 0 {
            len as i64 + bit_offset / 8
        } else {
            bit_offset / 8
        };
        usize::try_from(start).ok().filter(|s| *s <= len)
    }
}

impl Protocol for CrcProtocol {
    fn name(&self) -> &'static str {
        "crc"
    }

    fn read_data(&mut self, data: &[u8]) -> Result<ReadOutcome> {
        if data.is_empty() {
            return Ok(self.empty.pass(data));
        }

        let found = accessor::read(
            self.bit_offset,
            self.bit_size,
            DataType::UInt,
            data,
            self.endianness,
        )?
        .to_i128()? as u64;
        let start = Self::crc_start(self.bit_offset, data.len()).ok_or_else(|| {
            Error::Bounds(format!("{} byte frame too short for CRC", data.len()))
        })?;
        let calculated = self.checksum.checksum(&data[..start]);

        if calculated != found {
            error!(
                calculated = %format_args!("{calculated:#X}"),
                found = %format_args!("{found:#X}"),
                strategy = ?self.bad_strategy,
                "invalid CRC detected"
            );
            match self.bad_strategy {
                BadCrcStrategy::Drop => return Ok(ReadOutcome::Stop),
                BadCrcStrategy::Error => {
                    return Err(Error::Protocol(format!(
                        "invalid CRC, calculated {calculated:#X} vs found {found:#X}"
                    )))
                }
                BadCrcStrategy::Flag => self.flag_next = true,
                BadCrcStrategy::Disconnect => return Ok(ReadOutcome::Disconnect),
            }
        }

        if self.strip_crc {
            let end = start + (self.bit_size / 8) as usize;
            let mut out = data[..start].to_vec();
            if let Some(rest) = data.get(end..) {
                out.extend_from_slice(rest);
            }
            return Ok(ReadOutcome::Data(out));
        }
        Ok(ReadOutcome::Data(data.to_vec()))
    }

    fn read_packet(&mut self, mut packet: Packet) -> Result<PacketOutcome> {
        if std::mem::take(&mut self.flag_next) {
            packet
                .extra
                .get_or_insert_with(Default::default)
                .insert("CRC_ERROR".to_string(), JsonValue::Bool(true));
        }
        Ok(PacketOutcome::Packet(packet))
    }

    fn write_packet(&mut self, mut packet: Packet) -> Result<PacketOutcome> {
        if let Some(name) = &self.write_item_name {
            let bit_offset = packet.item(name)?.bit_offset();
            let end = Self::crc_start(bit_offset, packet.len()).ok_or_else(|| {
                Error::Bounds(format!("{} byte packet too short for CRC", packet.len()))
            })?;
            let crc = self.checksum.checksum(&packet.buffer()[..end]);
            packet.write(name, Value::UInt(crc), ValueType::Raw)?;
        }
        Ok(PacketOutcome::Packet(packet))
    }

    fn write_data(&mut self, mut data: Vec<u8>) -> Result<ReadOutcome> {
        if self.write_item_name.is_none() {
            let crc = self.checksum.checksum(&data);
            data.resize(data.len() + (self.bit_size / 8) as usize, 0);
            accessor::write(
                &Value::UInt(crc),
                -self.bit_size,
                self.bit_size,
                DataType::UInt,
                &mut data,
                self.endianness,
                Overflow::Error,
            )?;
        }
        Ok(ReadOutcome::Data(data))
    }

    fn reset(&mut self) {
        self.flag_next = false;
    }

    fn set_last_read_protocol(&mut self, last: bool) {
        self.empty.last = last;
    }
}
