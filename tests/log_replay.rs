mod common;

use std::fs;
use std::sync::Arc;

use cmdtlm::interface::Interface;
use cmdtlm::log::{PacketLogReader, PreidentifiedLogWriter};
use cmdtlm::protocol::{Direction, LengthConfig, PreidentifiedConfig, ProtocolConfig};
use cmdtlm::stream::MemoryStream;
use cmdtlm::{Packet, Value, ValueType};
use common::{catalog, event, health};

fn record(path: &std::path::Path) -> Vec<Packet> {
    let stream = MemoryStream::new();
    let mut wire = health(1, 60, 0);
    wire.extend(event(2, 0xBEEF));
    wire.extend(hex::decode("0999c003000000").unwrap());
    wire.extend(health(4, 80, 1));
    stream.push_read(wire);

    let mut interface = Interface::new("LIVE", Arc::new(stream), catalog());
    interface
        .add_protocol(
            &ProtocolConfig::Length(
                LengthConfig::builder()
                    .bit_offset(32)
                    .bit_size(16)
                    .value_offset(7)
                    .build(),
            ),
            Direction::Read,
        )
        .unwrap();
    interface.set_log_writer(Box::new(PreidentifiedLogWriter::create(path).unwrap()));
    interface.connect().unwrap();

    let mut packets = Vec::new();
    while let Some(packet) = interface.read().unwrap() {
        packets.push(packet);
    }
    // Flushes the log.
    interface.disconnect();
    packets
}

#[test]
fn logged_packets_replay_with_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tlm.bin");
    let live = record(&path);
    assert_eq!(live.len(), 4);
    assert_eq!(live[2].packet_name(), Some("UNKNOWN"));

    let replayed: Vec<Packet> = PacketLogReader::open(&path)
        .unwrap()
        .with_catalog(catalog())
        .collect::<cmdtlm::Result<_>>()
        .unwrap();
    assert_eq!(replayed.len(), live.len());
    for (live, replayed) in live.iter().zip(&replayed) {
        assert_eq!(replayed.target_name(), live.target_name());
        assert_eq!(replayed.packet_name(), live.packet_name());
        assert_eq!(replayed.buffer(), live.buffer());
        let live_time = live.received_time.unwrap();
        let replayed_time = replayed.received_time.unwrap();
        assert_eq!(replayed_time.timestamp(), live_time.timestamp());
        assert_eq!(
            replayed_time.timestamp_subsec_micros(),
            live_time.timestamp_subsec_micros()
        );
    }
    assert_eq!(
        replayed[1].read("CODE", ValueType::Raw).unwrap(),
        Value::UInt(0xBEEF)
    );
    assert_eq!(
        replayed[3].read("TEMP1", ValueType::Converted).unwrap(),
        Value::Float(30.0)
    );
}

#[test]
fn log_replays_through_an_interface() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tlm.bin");
    let live = record(&path);

    let stream = MemoryStream::new();
    for chunk in fs::read(&path).unwrap().chunks(5) {
        stream.push_read(chunk);
    }
    let mut interface = Interface::new("REPLAY", Arc::new(stream), catalog());
    interface
        .add_protocol(
            &ProtocolConfig::Preidentified(PreidentifiedConfig::default()),
            Direction::Read,
        )
        .unwrap();
    interface.connect().unwrap();

    let mut names = Vec::new();
    while let Some(packet) = interface.read().unwrap() {
        names.push(packet.packet_name().map(str::to_string));
        if packet.packet_name() == Some("HEALTH") {
            assert!(packet.read("MODE", ValueType::Converted).is_ok());
        }
    }
    let expected: Vec<_> = live
        .iter()
        .map(|p| p.packet_name().map(str::to_string))
        .collect();
    assert_eq!(names, expected);
}
