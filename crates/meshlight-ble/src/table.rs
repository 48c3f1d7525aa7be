//! Sub-device address table
//!
//! Every logical light behind the gateway is identified by a one-byte mesh
//! address. The table keeps the last state each one reported, in
//! registration order. Reports from addresses nobody registered still land
//! here as *shadow* entries so their state is not lost.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use meshlight_protocol::BROADCAST_ADDRESS;
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::{MeshError, Result};

/// Last known state of one sub-device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubDevice {
    /// Mesh address
    pub address: u8,
    /// Human-readable label (empty for shadow entries)
    pub label: String,
    /// Power state
    pub power: bool,
    /// Brightness level
    pub brightness: u8,
    /// Time of the last state report
    pub last_updated: Option<DateTime<Utc>>,
    /// No report arrived within the freshness window
    pub stale: bool,
    /// Created by a report, never registered
    pub unregistered: bool,
}

impl SubDevice {
    fn new(address: u8, label: String, unregistered: bool) -> Self {
        Self {
            address,
            label,
            power: false,
            brightness: 0,
            last_updated: None,
            stale: false,
            unregistered,
        }
    }

    /// Coming back from stale counts as a change
    fn apply(&mut self, power: Option<bool>, brightness: Option<u8>, now: DateTime<Utc>) -> bool {
        let mut changed = self.stale;
        if let Some(power) = power {
            changed |= self.power != power;
            self.power = power;
        }
        if let Some(brightness) = brightness {
            changed |= self.brightness != brightness;
            self.brightness = brightness;
        }
        self.last_updated = Some(now);
        self.stale = false;
        changed
    }
}

/// Mapping from mesh address to sub-device state
#[derive(Debug, Default)]
pub struct AddressTable {
    devices: IndexMap<u8, SubDevice>,
}

impl AddressTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sub-device, promoting a shadow entry or relabeling an
    /// existing one
    pub fn register(&mut self, address: u8, label: impl Into<String>) -> Result<&SubDevice> {
        if address == BROADCAST_ADDRESS {
            return Err(MeshError::InvalidAddress(address));
        }
        let label = label.into();
        let device = self
            .devices
            .entry(address)
            .and_modify(|existing| {
                if existing.unregistered {
                    debug!(address, "Promoting shadow sub-device");
                }
                existing.unregistered = false;
            })
            .or_insert_with(|| SubDevice::new(address, String::new(), false));
        device.label = label;
        Ok(device)
    }

    /// Remove a sub-device, returning its last state
    pub fn unregister(&mut self, address: u8) -> Option<SubDevice> {
        self.devices.shift_remove(&address)
    }

    /// Look up a sub-device
    pub fn get(&self, address: u8) -> Option<&SubDevice> {
        self.devices.get(&address)
    }

    /// Check whether an address has an entry (registered or shadow)
    pub fn contains(&self, address: u8) -> bool {
        self.devices.contains_key(&address)
    }

    /// Apply a state report; returns whether anything observable changed
    ///
    /// An unknown address creates a shadow entry and always counts as a
    /// change. The broadcast address applies the report to every entry.
    pub fn update(&mut self, address: u8, power: Option<bool>, brightness: Option<u8>) -> bool {
        if address == BROADCAST_ADDRESS {
            return !self.update_all(power, brightness).is_empty();
        }
        let now = Utc::now();
        match self.devices.get_mut(&address) {
            Some(device) => {
                let changed = device.apply(power, brightness, now);
                trace!(address, changed, "Sub-device state updated");
                changed
            }
            None => {
                debug!(address, "State report from unknown address, creating shadow entry");
                let mut device = SubDevice::new(address, String::new(), true);
                device.apply(power, brightness, now);
                self.devices.insert(address, device);
                true
            }
        }
    }

    /// Apply a state report to every entry; returns the addresses that changed
    pub fn update_all(&mut self, power: Option<bool>, brightness: Option<u8>) -> Vec<u8> {
        let now = Utc::now();
        self.devices
            .values_mut()
            .filter_map(|device| {
                device
                    .apply(power, brightness, now)
                    .then_some(device.address)
            })
            .collect()
    }

    /// Mark one entry stale; returns whether the flag flipped
    pub fn mark_stale(&mut self, address: u8) -> bool {
        match self.devices.get_mut(&address) {
            Some(device) if !device.stale => {
                device.stale = true;
                true
            }
            _ => false,
        }
    }

    /// Mark every entry last updated before `cutoff` stale
    ///
    /// Entries that never reported are left alone. Returns the addresses
    /// whose flag flipped.
    pub fn mark_stale_before(&mut self, cutoff: DateTime<Utc>) -> Vec<u8> {
        self.devices
            .values_mut()
            .filter(|device| !device.stale)
            .filter(|device| device.last_updated.is_some_and(|at| at < cutoff))
            .map(|device| {
                device.stale = true;
                device.address
            })
            .collect()
    }

    /// Iterate over all entries in registration order
    pub fn all(&self) -> impl Iterator<Item = &SubDevice> {
        self.devices.values()
    }

    /// Number of entries, shadows included
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_register_and_get() {
        let mut table = AddressTable::new();
        table.register(3, "lamp1").unwrap();

        let device = table.get(3).unwrap();
        assert_eq!(device.label, "lamp1");
        assert!(!device.power);
        assert!(device.last_updated.is_none());
        assert!(!device.unregistered);
    }

    #[test]
    fn test_register_broadcast_rejected() {
        let mut table = AddressTable::new();
        assert!(matches!(
            table.register(0, "all"),
            Err(MeshError::InvalidAddress(0))
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn test_register_relabels() {
        let mut table = AddressTable::new();
        table.register(3, "lamp1").unwrap();
        table.register(3, "desk").unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(3).unwrap().label, "desk");
    }

    #[test]
    fn test_update_is_idempotent() {
        let mut table = AddressTable::new();
        table.register(3, "lamp1").unwrap();

        assert!(table.update(3, Some(true), Some(180)));
        assert!(!table.update(3, Some(true), Some(180)));
        assert!(table.update(3, None, Some(90)));
        assert_eq!(table.get(3).unwrap().brightness, 90);
        assert!(table.get(3).unwrap().power);
    }

    #[test]
    fn test_update_unknown_creates_shadow() {
        let mut table = AddressTable::new();
        assert!(table.update(9, Some(true), Some(10)));

        let shadow = table.get(9).unwrap();
        assert!(shadow.unregistered);
        assert!(shadow.label.is_empty());
        assert_eq!(shadow.brightness, 10);
    }

    #[test]
    fn test_register_promotes_shadow_in_place() {
        let mut table = AddressTable::new();
        table.register(1, "first").unwrap();
        table.update(9, Some(true), Some(10));
        table.register(2, "second").unwrap();

        table.register(9, "porch").unwrap();

        let order: Vec<u8> = table.all().map(|d| d.address).collect();
        assert_eq!(order, vec![1, 9, 2]);
        let promoted = table.get(9).unwrap();
        assert!(!promoted.unregistered);
        assert_eq!(promoted.label, "porch");
        assert_eq!(promoted.brightness, 10);
    }

    #[test]
    fn test_unregister_keeps_order() {
        let mut table = AddressTable::new();
        for addr in 1..=4 {
            table.register(addr, format!("lamp{}", addr)).unwrap();
        }
        assert!(table.unregister(2).is_some());
        assert!(table.unregister(2).is_none());

        let order: Vec<u8> = table.all().map(|d| d.address).collect();
        assert_eq!(order, vec![1, 3, 4]);
    }

    #[test]
    fn test_broadcast_update_applies_to_all() {
        let mut table = AddressTable::new();
        table.register(1, "a").unwrap();
        table.register(2, "b").unwrap();
        table.update(2, Some(true), Some(200));

        let changed = table.update_all(Some(true), Some(200));
        assert_eq!(changed, vec![1]);
        assert!(table.get(1).unwrap().last_updated.is_some());
        assert!(!table.update(0, Some(true), Some(200)));
    }

    #[test]
    fn test_stale_marking() {
        let mut table = AddressTable::new();
        table.register(1, "a").unwrap();
        table.register(2, "b").unwrap();
        table.update(1, Some(true), None);

        assert!(table.mark_stale_before(Utc::now() - Duration::hours(1)).is_empty());
        assert_eq!(
            table.mark_stale_before(Utc::now() + Duration::seconds(1)),
            vec![1]
        );
        assert!(table.get(1).unwrap().stale);

        assert!(table.mark_stale(2));
        assert!(!table.mark_stale(2));

        assert!(table.update(1, Some(true), None));
        assert!(!table.get(1).unwrap().stale);
        assert!(!table.update(1, Some(true), None));
    }
}
