#![doc = include_str!("../README.md")]

mod error;
mod value;

pub mod accessor;
pub mod catalog;
pub mod ccsds;
pub mod interface;
pub mod log;
pub mod packet;
pub mod protocol;
pub mod stream;

pub use catalog::Catalog;
pub use error::{Error, Result};
pub use packet::{Packet, ValueType};
pub use value::{hex_summary, Value};
