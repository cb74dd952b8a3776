#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use cmdtlm::Catalog;

pub fn fixture_path(name: &str) -> PathBuf {
    let mut path =
        PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set"));
    path.push("tests/fixtures");
    path.push(name);
    path
}

pub fn catalog() -> Arc<Catalog> {
    Arc::new(Catalog::from_path(fixture_path("catalog.json")).unwrap())
}

/// A HEALTH packet with a CCSDS header, in wire order.
pub fn health(seq: u16, temp_raw: i16, mode: u8) -> Vec<u8> {
    let mut buf = hex::decode("0864").unwrap();
    buf.extend_from_slice(&(0xC000 | seq).to_be_bytes());
    buf.extend_from_slice(&2u16.to_be_bytes());
    buf.extend_from_slice(&temp_raw.to_be_bytes());
    buf.push(mode);
    buf
}

/// An EVENT packet with a CCSDS header, in wire order.
pub fn event(seq: u16, code: u16) -> Vec<u8> {
    let mut buf = hex::decode("0865").unwrap();
    buf.extend_from_slice(&(0xC000 | seq).to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&code.to_be_bytes());
    buf
}
