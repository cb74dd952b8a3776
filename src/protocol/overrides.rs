use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use super::{EmptyData, PacketOutcome, Protocol, ReadOutcome};
use crate::catalog::Catalog;
use crate::packet::{Packet, ValueType};
use crate::{Error, Result, Value};

type Key = (String, String);
type Overrides = HashMap<Key, BTreeMap<String, (Value, ValueType)>>;

fn key(target_name: &str, packet_name: &str) -> Key {
    (
        target_name.trim().to_uppercase(),
        packet_name.trim().to_uppercase(),
    )
}

/// Shared set of item values forced into received packets.
///
/// Clones share the same overrides, so a handle kept by a command layer updates
/// what the interface's [OverrideProtocol] applies.
#[derive(Debug, Clone, Default)]
pub struct OverrideHandle {
    inner: Arc<Mutex<Overrides>>,
}

impl OverrideHandle {
    fn lock(&self) -> MutexGuard<'_, Overrides> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Override `item_name` of every matching received packet with `value`.
    ///
    /// # Errors
    /// [Error::Configuration] for `Formatted` or `WithUnits` values, which cannot be
    /// written.
    pub fn set(
        &self,
        target_name: &str,
        packet_name: &str,
        item_name: &str,
        value: impl Into<Value>,
        value_type: ValueType,
    ) -> Result<()> {
        if !matches!(value_type, ValueType::Raw | ValueType::Converted) {
            return Err(Error::Configuration(format!(
                "cannot override with {value_type:?} values"
            )));
        }
        self.lock()
            .entry(key(target_name, packet_name))
            .or_default()
            .insert(item_name.trim().to_uppercase(), (value.into(), value_type));
        Ok(())
    }

    pub fn clear(&self, target_name: &str, packet_name: &str, item_name: &str) {
        let mut overrides = self.lock();
        let key = key(target_name, packet_name);
        if let Some(items) = overrides.get_mut(&key) {
            items.remove(&item_name.trim().to_uppercase());
            if items.is_empty() {
                overrides.remove(&key);
            }
        }
    }

    pub fn clear_all(&self) {
        self.lock().clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Current overrides for a packet as (item, value, value type).
    #[must_use]
    pub fn get(&self, target_name: &str, packet_name: &str) -> Vec<(String, Value, ValueType)> {
        self.lock()
            .get(&key(target_name, packet_name))
            .map(|items| {
                items
                    .iter()
                    .map(|(name, (value, vt))| (name.clone(), value.clone(), *vt))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Writes overridden item values into received packets.
#[derive(Debug)]
pub struct OverrideProtocol {
    handle: OverrideHandle,
    catalog: Arc<Catalog>,
    target_names: Option<Vec<String>>,
    empty: EmptyData,
}

impl OverrideProtocol {
    #[must_use]
    pub fn new(
        handle: OverrideHandle,
        catalog: Arc<Catalog>,
        target_names: Option<Vec<String>>,
    ) -> Self {
        OverrideProtocol {
            handle,
            catalog,
            target_names,
            empty: EmptyData::default(),
        }
    }
}

impl Protocol for OverrideProtocol {
    fn name(&self) -> &'static str {
        "override"
    }

    fn read_data(&mut self, data: &[u8]) -> Result<ReadOutcome> {
        Ok(self.empty.pass(data))
    }

    fn read_packet(&mut self, packet: Packet) -> Result<PacketOutcome> {
        if self.handle.is_empty() {
            return Ok(PacketOutcome::Packet(packet));
        }
        let mut packet = self
            .catalog
            .identify_and_define(packet, self.target_names.as_deref());
        let (Some(target_name), Some(packet_name)) = (packet.target_name(), packet.packet_name())
        else {
            return Ok(PacketOutcome::Packet(packet));
        };
        let overrides = self.handle.get(target_name, packet_name);
        for (item, value, value_type) in overrides {
            if let Err(err) = packet.write(&item, value, value_type) {
                warn!(
                    target_name = packet.target_name(),
                    packet_name = packet.packet_name(),
                    %item,
                    %err,
                    "override failed"
                );
            }
        }
        Ok(PacketOutcome::Packet(packet))
    }

    fn reset(&mut self) {}

    fn set_last_read_protocol(&mut self, last: bool) {
        self.empty.last = last;
    }
}
