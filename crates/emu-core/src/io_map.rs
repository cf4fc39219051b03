//! I/O address decode tables.
//!
//! The port space has `2^addr_bits` entries. Incoming addresses are masked
//! to that width, so partially decoded hardware aliases naturally. Read
//! and write tables are independent and every entry defaults to the
//! open-bus placeholder, which makes dispatch total.

use std::ops::RangeInclusive;

use crate::bus::Access;
use crate::component::{ComponentId, Handle};

/// What an address resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Nothing drives the bus: reads see `0xFF`, writes are dropped.
    Open,
    /// A component, addressed with [`MapEntry::addr`].
    Device(ComponentId),
    /// A constant read value (pull-ups, jumpers, ID latches).
    Value(u8),
}

/// One decode table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    pub target: Target,
    /// Address passed to the target.
    pub addr: u32,
    /// Extra wait cycles charged to the accessor.
    pub wait: u8,
}

impl MapEntry {
    const OPEN: Self = Self {
        target: Target::Open,
        addr: 0,
        wait: 0,
    };
}

/// Port decode tables for one machine.
#[derive(Debug, Clone)]
pub struct IoMap {
    mask: u32,
    read: Vec<MapEntry>,
    write: Vec<MapEntry>,
}

impl IoMap {
    /// An empty map covering `2^addr_bits` ports. `addr_bits` is clamped
    /// to `1..=16`.
    #[must_use]
    pub fn new(addr_bits: u8) -> Self {
        let bits = addr_bits.clamp(1, 16);
        let size = 1usize << bits;
        Self {
            mask: (size - 1) as u32,
            read: vec![MapEntry::OPEN; size],
            write: vec![MapEntry::OPEN; size],
        }
    }

    /// Number of distinct ports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read.is_empty()
    }

    #[must_use]
    pub const fn mask(&self) -> u32 {
        self.mask
    }

    /// Route every address in `range` to `handle`. The component sees the
    /// masked address. Later mappings override earlier ones.
    pub fn map<T>(&mut self, range: RangeInclusive<u32>, handle: Handle<T>, access: Access) -> &mut Self {
        let id = handle.id();
        self.update(range, access, |entry, addr| {
            entry.target = Target::Device(id);
            entry.addr = addr;
        })
    }

    /// Route `addr` to `handle`, which sees `alias` instead.
    pub fn map_alias<T>(&mut self, addr: u32, handle: Handle<T>, alias: u32, access: Access) -> &mut Self {
        let id = handle.id();
        self.update(addr..=addr, access, |entry, _| {
            entry.target = Target::Device(id);
            entry.addr = alias;
        })
    }

    /// Make `range` read back a constant.
    pub fn map_value(&mut self, range: RangeInclusive<u32>, value: u8) -> &mut Self {
        self.update(range, Access::Read, |entry, addr| {
            entry.target = Target::Value(value);
            entry.addr = addr;
        })
    }

    /// Charge `wait` extra cycles for accesses in `range`.
    pub fn set_wait(&mut self, range: RangeInclusive<u32>, wait: u8, access: Access) -> &mut Self {
        self.update(range, access, |entry, _| entry.wait = wait)
    }

    /// Return `range` to open bus.
    pub fn unmap(&mut self, range: RangeInclusive<u32>, access: Access) -> &mut Self {
        self.update(range, access, |entry, _| *entry = MapEntry::OPEN)
    }

    #[must_use]
    pub fn read_entry(&self, addr: u32) -> MapEntry {
        self.read[(addr & self.mask) as usize]
    }

    #[must_use]
    pub fn write_entry(&self, addr: u32) -> MapEntry {
        self.write[(addr & self.mask) as usize]
    }

    fn update(
        &mut self,
        range: RangeInclusive<u32>,
        access: Access,
        mut apply: impl FnMut(&mut MapEntry, u32),
    ) -> &mut Self {
        let size = self.read.len();
        // Ranges wider than the space wrap onto themselves; one pass covers them.
        for addr in range.take(size) {
            let masked = addr & self.mask;
            let index = masked as usize;
            if access.reads() {
                apply(&mut self.read[index], masked);
            }
            if access.writes() {
                apply(&mut self.write[index], masked);
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(n: u32) -> Handle<()> {
        Handle::new(ComponentId(n))
    }

    #[test]
    fn unmapped_is_open() {
        let map = IoMap::new(8);
        assert_eq!(map.read_entry(0x42).target, Target::Open);
        assert_eq!(map.write_entry(0xFFFF_FFFF).target, Target::Open);
    }

    #[test]
    fn addresses_alias_through_mask() {
        let mut map = IoMap::new(8);
        map.map(0x10..=0x11, handle(3), Access::ReadWrite);
        let entry = map.read_entry(0x1311);
        assert_eq!(entry.target, Target::Device(ComponentId(3)));
        assert_eq!(entry.addr, 0x11);
    }

    #[test]
    fn read_and_write_tables_are_independent() {
        let mut map = IoMap::new(8);
        map.map(0x20..=0x20, handle(1), Access::Read);
        map.map(0x20..=0x20, handle(2), Access::Write);
        assert_eq!(map.read_entry(0x20).target, Target::Device(ComponentId(1)));
        assert_eq!(map.write_entry(0x20).target, Target::Device(ComponentId(2)));
    }

    #[test]
    fn alias_normalises_sub_address() {
        let mut map = IoMap::new(8);
        map.map_alias(0xF8, handle(1), 0, Access::ReadWrite);
        map.map_alias(0xFA, handle(1), 1, Access::ReadWrite);
        assert_eq!(map.read_entry(0xFA).addr, 1);
        assert_eq!(map.write_entry(0xF8).addr, 0);
    }

    #[test]
    fn wait_survives_remap() {
        let mut map = IoMap::new(8);
        map.set_wait(0x30..=0x33, 2, Access::Read);
        map.map(0x30..=0x33, handle(1), Access::ReadWrite);
        assert_eq!(map.read_entry(0x31).wait, 2);
        assert_eq!(map.write_entry(0x31).wait, 0);
    }

    #[test]
    fn oversized_range_wraps() {
        let mut map = IoMap::new(4);
        map.map_value(0..=0xFFFF_FFFF, 0x5A);
        assert!((0..16).all(|a| map.read_entry(a).target == Target::Value(0x5A)));
        map.unmap(0..=0xFFFF, Access::ReadWrite);
        assert!((0..16).all(|a| map.read_entry(a).target == Target::Open));
    }
}
