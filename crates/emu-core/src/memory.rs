//! Banked memory.
//!
//! Memory is an arena of named regions (RAM, ROM, cartridge windows).
//! The address space is split into equal banks; each bank has a read
//! entry and a write entry naming a region and the offset of the bank
//! within it. Bank switching rewrites entries, never copies data.

use std::ops::RangeInclusive;

use crate::bus::{Access, OPEN_BUS, ReadResult};
use crate::component::Component;
use crate::machine::Ctx;

/// Index of a region inside a [`MemoryMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(usize);

#[derive(Debug)]
struct Region {
    name: String,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Bank {
    region: Option<RegionId>,
    offset: usize,
    wait: u8,
}

/// Bank-switched data bus target.
#[derive(Debug)]
pub struct MemoryMap {
    addr_mask: u32,
    bank_shift: u32,
    regions: Vec<Region>,
    read: Vec<Bank>,
    write: Vec<Bank>,
}

impl MemoryMap {
    /// `addr_bits` wide address space split into banks of `2^bank_bits`
    /// bytes.
    #[must_use]
    pub fn new(addr_bits: u8, bank_bits: u8) -> Self {
        let addr_bits = u32::from(addr_bits.clamp(1, 32));
        let bank_shift = u32::from(bank_bits).min(addr_bits);
        let banks = 1usize << (addr_bits - bank_shift);
        let addr_mask = if addr_bits == 32 {
            u32::MAX
        } else {
            (1u32 << addr_bits) - 1
        };
        Self {
            addr_mask,
            bank_shift,
            regions: Vec::new(),
            read: vec![Bank::default(); banks],
            write: vec![Bank::default(); banks],
        }
    }

    pub fn add_region(&mut self, name: &str, data: Vec<u8>) -> RegionId {
        self.regions.push(Region {
            name: name.to_string(),
            data,
        });
        RegionId(self.regions.len() - 1)
    }

    #[must_use]
    pub fn region(&self, id: RegionId) -> &[u8] {
        &self.regions[id.0].data
    }

    pub fn region_mut(&mut self, id: RegionId) -> &mut [u8] {
        &mut self.regions[id.0].data
    }

    #[must_use]
    pub fn region_name(&self, id: RegionId) -> &str {
        &self.regions[id.0].name
    }

    /// Resize a region. Banks pointing past the new end read open bus.
    pub fn resize_region(&mut self, id: RegionId, len: usize) {
        self.regions[id.0].data.resize(len, 0);
    }

    /// Map the banks covering `range` onto `region`, starting at `offset`.
    pub fn map(
        &mut self,
        range: RangeInclusive<u32>,
        region: RegionId,
        offset: usize,
        access: Access,
    ) -> &mut Self {
        let bank_size = usize::try_from(1u64 << self.bank_shift).unwrap_or(usize::MAX);
        let mut bank_offset = offset;
        for bank in self.banks(&range) {
            if access.reads() {
                self.read[bank].region = Some(region);
                self.read[bank].offset = bank_offset;
            }
            if access.writes() {
                self.write[bank].region = Some(region);
                self.write[bank].offset = bank_offset;
            }
            bank_offset = bank_offset.saturating_add(bank_size);
        }
        self
    }

    pub fn unmap(&mut self, range: RangeInclusive<u32>, access: Access) -> &mut Self {
        for bank in self.banks(&range) {
            if access.reads() {
                self.read[bank].region = None;
            }
            if access.writes() {
                self.write[bank].region = None;
            }
        }
        self
    }

    pub fn set_wait(&mut self, range: RangeInclusive<u32>, wait: u8, access: Access) -> &mut Self {
        for bank in self.banks(&range) {
            if access.reads() {
                self.read[bank].wait = wait;
            }
            if access.writes() {
                self.write[bank].wait = wait;
            }
        }
        self
    }

    /// Read without side effects.
    #[must_use]
    pub fn peek(&self, addr: u32) -> u8 {
        let (bank, index) = self.locate(&self.read, addr);
        bank.region
            .and_then(|r| self.regions[r.0].data.get(index))
            .copied()
            .unwrap_or(OPEN_BUS)
    }

    fn poke(&mut self, addr: u32, data: u8) -> u8 {
        let (bank, index) = self.locate(&self.write, addr);
        if let Some(region) = bank.region {
            if let Some(byte) = self.regions[region.0].data.get_mut(index) {
                *byte = data;
            }
        }
        bank.wait
    }

    fn locate(&self, table: &[Bank], addr: u32) -> (Bank, usize) {
        let bank = table[self.bank_of(addr)];
        let within = (u64::from(addr & self.addr_mask) & ((1u64 << self.bank_shift) - 1)) as usize;
        (bank, bank.offset.saturating_add(within))
    }

    /// Shifted in 64 bits: a single 4 GiB bank has a shift of 32.
    fn bank_of(&self, addr: u32) -> usize {
        (u64::from(addr & self.addr_mask) >> self.bank_shift) as usize
    }

    fn banks(&self, range: &RangeInclusive<u32>) -> RangeInclusive<usize> {
        let first = self.bank_of(*range.start());
        let last = self.bank_of(*range.end());
        first..=last.max(first)
    }
}

impl Component for MemoryMap {
    fn read_data8(&mut self, _ctx: &mut Ctx<'_>, addr: u32) -> u8 {
        self.peek(addr)
    }

    fn write_data8(&mut self, _ctx: &mut Ctx<'_>, addr: u32, data: u8) {
        self.poke(addr, data);
    }

    fn read_data8w(&mut self, _ctx: &mut Ctx<'_>, addr: u32) -> ReadResult {
        let (bank, _) = self.locate(&self.read, addr);
        ReadResult::with_wait(self.peek(addr), bank.wait)
    }

    fn write_data8w(&mut self, _ctx: &mut Ctx<'_>, addr: u32, data: u8) -> u8 {
        self.poke(addr, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spectrum_128_like() -> (MemoryMap, RegionId, RegionId) {
        let mut mem = MemoryMap::new(16, 14);
        let rom = mem.add_region("rom", vec![0xF3; 0x4000]);
        let ram = mem.add_region("ram", vec![0; 8 * 0x4000]);
        mem.map(0x0000..=0x3FFF, rom, 0, Access::Read);
        mem.map(0x4000..=0xFFFF, ram, 5 * 0x4000, Access::ReadWrite);
        (mem, rom, ram)
    }

    #[test]
    fn rom_is_read_only() {
        let (mut mem, rom, _) = spectrum_128_like();
        assert_eq!(mem.poke(0x0000, 0x00), 0);
        assert_eq!(mem.peek(0x0000), 0xF3);
        assert_eq!(mem.region(rom)[0], 0xF3);
    }

    #[test]
    fn bank_switch_changes_view_without_copy() {
        let (mut mem, _, ram) = spectrum_128_like();
        mem.poke(0xC000, 0x11);
        assert_eq!(mem.region(ram)[7 * 0x4000], 0x11);

        mem.map(0xC000..=0xFFFF, ram, 0, Access::ReadWrite);
        assert_eq!(mem.peek(0xC000), 0x00);
        mem.poke(0xC000, 0x22);
        assert_eq!(mem.region(ram)[0], 0x22);

        mem.map(0xC000..=0xFFFF, ram, 7 * 0x4000, Access::ReadWrite);
        assert_eq!(mem.peek(0xC000), 0x11);
    }

    #[test]
    fn unmapped_and_out_of_region_read_open_bus() {
        let (mut mem, rom, _) = spectrum_128_like();
        mem.unmap(0x4000..=0x7FFF, Access::ReadWrite);
        assert_eq!(mem.peek(0x4000), OPEN_BUS);
        mem.resize_region(rom, 0x100);
        assert_eq!(mem.peek(0x00FF), 0xF3);
        assert_eq!(mem.peek(0x0100), OPEN_BUS);
    }

    #[test]
    fn bank_wait_is_reported() {
        let (mut mem, _, _) = spectrum_128_like();
        mem.set_wait(0x4000..=0x7FFF, 3, Access::ReadWrite);
        let (bank, _) = mem.locate(&mem.read, 0x4001);
        assert_eq!(bank.wait, 3);
        assert_eq!(mem.poke(0x4001, 1), 3);
        assert_eq!(mem.poke(0x8001, 1), 0);
    }

    #[test]
    fn full_width_single_bank() {
        let mut mem = MemoryMap::new(32, 32);
        let ram = mem.add_region("ram", vec![0; 16]);
        mem.map(0..=15, ram, 0, Access::ReadWrite);
        mem.poke(0x0000_000F, 0x5A);
        assert_eq!(mem.peek(0x0000_000F), 0x5A);
        assert_eq!(mem.peek(0xFFFF_FFFF), OPEN_BUS);
    }
}
