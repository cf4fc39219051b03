//! MB8877 command decoding and execution.
//!
//! Writing the command register cancels everything the previous command
//! left scheduled, then starts the new one. Type I commands run on step
//! callbacks; type II and III commands search, then wait on the data
//! register.

use emu_core::Ctx;
use format_dsk::{SectorId, crc16};

use crate::status::{
    ST_BUSY, ST_CRC_ERROR, ST_HEAD_ENGAGED, ST_NOT_READY, ST_RECORD_NOT_FOUND, ST_RECORD_TYPE, ST_SEEK_ERROR,
};
use crate::{
    CommandType, EVENT_LOST, EVENT_SEARCH, EVENT_SEEK, EVENT_SEEK_END, EVENT_TYPE4, LOST_ADDRESS_USEC,
    LOST_SECTOR_USEC, LOST_TRACK_USEC, Mb8877, SEEK_END_USEC, SEEK_WAIT_USEC, TRACK_SIZE, TYPE4_USEC,
};

/// Commands, decoded from the high nibble of the command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Restore,
    Seek,
    Step,
    StepIn,
    StepOut,
    ReadData,
    WriteData,
    ReadAddress,
    ForceInterrupt,
    ReadTrack,
    WriteTrack,
}

impl Command {
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        match byte >> 4 {
            0x0 => Self::Restore,
            0x1 => Self::Seek,
            0x2 | 0x3 => Self::Step,
            0x4 | 0x5 => Self::StepIn,
            0x6 | 0x7 => Self::StepOut,
            0x8 | 0x9 => Self::ReadData,
            0xA | 0xB => Self::WriteData,
            0xC => Self::ReadAddress,
            0xD => Self::ForceInterrupt,
            0xE => Self::ReadTrack,
            _ => Self::WriteTrack,
        }
    }
}

/// ID address field as read address returns it: C H R N and the CRC.
#[must_use]
pub fn address_field(id: SectorId) -> [u8; 6] {
    let crc = crc16(&[0xA1, 0xA1, 0xA1, 0xFE, id.c, id.h, id.r, id.n]);
    let [hi, lo] = crc.to_be_bytes();
    [id.c, id.h, id.r, id.n, hi, lo]
}

/// Pull sector IDs and the data filler out of a raw track written by
/// write track. Data fields are skipped by the size of the preceding ID.
#[must_use]
pub fn decode_track(bytes: &[u8]) -> (Vec<SectorId>, Option<u8>) {
    let mut ids = Vec::new();
    let mut filler = None;
    let mut size = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            0xFE if i + 4 < bytes.len() => {
                let id = SectorId::new(bytes[i + 1], bytes[i + 2], bytes[i + 3], bytes[i + 4]);
                size = id.size();
                ids.push(id);
                i += 5;
                continue;
            }
            0xFB | 0xF8 if !ids.is_empty() => {
                if filler.is_none() {
                    filler = bytes.get(i + 1).copied();
                }
                i += 1 + size;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    (ids, filler)
}

impl Mb8877 {
    pub(crate) fn process_cmd(&mut self, ctx: &mut Ctx<'_>) {
        let command = Command::from_byte(self.command);
        log::debug!("MB8877: {command:?} ({:#04X})", self.command);

        self.cancel_all();
        self.set_irq(ctx, false);

        let cylinder = self.drives[self.drive].track;
        let max = self.config.max_track;
        match command {
            Command::Restore => {
                self.track = 0xFF;
                self.start_type1(ctx, 0, true);
            }
            Command::Seek => {
                let outward = self.data <= self.track;
                self.start_type1(ctx, self.data.min(max), outward);
            }
            Command::Step => {
                if self.step_out {
                    self.start_type1(ctx, cylinder.saturating_sub(1), true);
                } else {
                    self.start_type1(ctx, cylinder.saturating_add(1).min(max), false);
                }
            }
            Command::StepIn => self.start_type1(ctx, cylinder.saturating_add(1).min(max), false),
            Command::StepOut => self.start_type1(ctx, cylinder.saturating_sub(1), true),
            Command::ReadData => self.cmd_read_data(ctx),
            Command::WriteData => self.cmd_write_data(ctx),
            Command::ReadAddress => self.cmd_read_address(ctx),
            Command::ReadTrack => self.cmd_read_track(ctx),
            Command::WriteTrack => self.cmd_write_track(ctx),
            Command::ForceInterrupt => self.cmd_force_interrupt(ctx),
        }
    }

    fn start_type1(&mut self, ctx: &mut Ctx<'_>, target: u8, step_out: bool) {
        self.command_type = CommandType::TypeI;
        self.status = ST_HEAD_ENGAGED | ST_BUSY;
        self.seek_target = target;
        self.step_out = step_out;
        let rate = usize::from(self.command & 3);
        self.schedule(ctx, EVENT_SEEK, SEEK_WAIT_USEC[rate]);
        self.schedule(ctx, EVENT_SEEK_END, SEEK_END_USEC);
    }

    pub(crate) fn cmd_read_data(&mut self, ctx: &mut Ctx<'_>) {
        self.command_type = if self.command & 0x10 != 0 {
            CommandType::ReadMulti
        } else {
            CommandType::ReadSector
        };
        self.status = self.search_sector(ctx);
        self.start_search(ctx, LOST_SECTOR_USEC);
    }

    pub(crate) fn cmd_write_data(&mut self, ctx: &mut Ctx<'_>) {
        self.command_type = if self.command & 0x10 != 0 {
            CommandType::WriteMulti
        } else {
            CommandType::WriteSector
        };
        self.status = self.search_sector(ctx) & !ST_RECORD_TYPE;
        self.start_search(ctx, LOST_SECTOR_USEC);
    }

    fn cmd_read_address(&mut self, ctx: &mut Ctx<'_>) {
        self.command_type = CommandType::ReadAddress;
        self.status = self.search_address(ctx);
        self.start_search(ctx, LOST_ADDRESS_USEC);
    }

    fn cmd_read_track(&mut self, ctx: &mut Ctx<'_>) {
        self.command_type = CommandType::ReadTrack;
        self.status = 0;
        let drive = self.drive;
        let cylinder = self.drives[drive].track;
        self.buffer = self
            .disks
            .get(drive)
            .and_then(|d| d.raw_track(cylinder, self.side))
            .map_or_else(|| vec![0x4E; TRACK_SIZE], |raw| raw.bytes);
        self.drives[drive].index = 0;
        self.start_search(ctx, LOST_TRACK_USEC);
    }

    fn cmd_write_track(&mut self, ctx: &mut Ctx<'_>) {
        self.command_type = CommandType::WriteTrack;
        if !self.disk_inserted(self.drive) {
            log::debug!("MB8877: write track on empty drive {}", self.drive);
            self.status = ST_NOT_READY;
            self.finish(ctx);
            return;
        }
        self.status = 0;
        self.buffer = vec![0; TRACK_SIZE];
        self.drives[self.drive].index = 0;
        self.start_search(ctx, LOST_TRACK_USEC);
    }

    fn cmd_force_interrupt(&mut self, ctx: &mut Ctx<'_>) {
        if matches!(self.command_type, CommandType::None | CommandType::ForceInterrupt) {
            self.status = 0;
            self.command_type = CommandType::TypeI;
        }
        self.status &= !ST_BUSY;
        if self.command & 0x0F != 0 {
            self.set_irq(ctx, true);
        }
        self.schedule(ctx, EVENT_TYPE4, TYPE4_USEC);
    }

    /// Arm the search callback and the lost data timeout behind it. A
    /// failed search has already interrupted and arms nothing.
    fn start_search(&mut self, ctx: &mut Ctx<'_>, lost_usec: f64) {
        self.cancel(EVENT_LOST);
        if self.status & ST_RECORD_NOT_FOUND != 0 {
            return;
        }
        self.status |= ST_BUSY;
        let time = self.search_time();
        self.schedule(ctx, EVENT_SEARCH, time);
        self.schedule(ctx, EVENT_LOST, time + lost_usec);
    }

    /// Load the sector matching the sector register into the buffer.
    fn search_sector(&mut self, ctx: &mut Ctx<'_>) -> u8 {
        let drive = self.drive;
        let cylinder = self.drives[drive].track;
        // Side compare takes the side from the command instead of the line.
        let side = if self.command & 0x02 != 0 {
            (self.command >> 3) & 1
        } else {
            self.side
        };

        let found = self.disks.get(drive).and_then(|d| d.track(cylinder, side)).and_then(|track| {
            let count = track.sectors.len();
            let start = if self.cursor >= count { 0 } else { self.cursor };
            (0..count).map(|step| (start + step) % count).find_map(|index| {
                let sector = &track.sectors[index];
                (sector.r == self.sector).then(|| {
                    (index, count, sector.data.clone(), sector.deleted(), sector.data_error())
                })
            })
        });

        let Some((index, count, data, deleted, data_error)) = found else {
            log::debug!("MB8877: sector {} not found on {cylinder}/{side}", self.sector);
            self.buffer.clear();
            self.target = None;
            self.set_irq(ctx, true);
            return ST_RECORD_NOT_FOUND;
        };

        self.cursor = (index + 1) % count;
        self.drives[drive].index = 0;
        self.buffer = data;
        self.target = Some((cylinder, side, index));

        let mut status = 0;
        if deleted {
            status |= ST_RECORD_TYPE;
        }
        if data_error && !self.config.ignore_crc {
            status |= ST_CRC_ERROR;
        }
        status
    }

    /// Load the next ID field under the head into the buffer.
    fn search_address(&mut self, ctx: &mut Ctx<'_>) -> u8 {
        let drive = self.drive;
        let cylinder = self.drives[drive].track;
        let next = self.disks.get(drive).and_then(|d| d.track(cylinder, self.side)).and_then(|track| {
            let index = if self.cursor >= track.sectors.len() { 0 } else { self.cursor };
            track.sectors.get(index).map(|s| (index, s.id(), s.data_error()))
        });

        let Some((index, id, data_error)) = next else {
            self.buffer.clear();
            self.set_irq(ctx, true);
            return ST_RECORD_NOT_FOUND;
        };

        self.cursor = index + 1;
        self.drives[drive].index = 0;
        self.buffer = address_field(id).to_vec();
        self.sector = id.c;

        if data_error && !self.config.ignore_crc {
            ST_CRC_ERROR
        } else {
            0
        }
    }

    /// Type I verify: the head must be over a formatted track, and with
    /// the verify bit set some ID on it must match the track register.
    pub(crate) fn verify_track(&self) -> u8 {
        let cylinder = self.drives[self.drive].track;
        let Some(track) = self.disks.get(self.drive).and_then(|d| d.track(cylinder, self.side)) else {
            return ST_SEEK_ERROR;
        };
        if self.command & 0x04 == 0 || track.sectors.iter().any(|s| s.c == self.track) {
            0
        } else {
            ST_SEEK_ERROR
        }
    }

    pub(crate) fn commit_sector(&mut self) {
        let Some((cylinder, side, index)) = self.target else {
            return;
        };
        let drive = self.drive;
        let written = self
            .disks
            .get_mut(drive)
            .is_some_and(|d| d.write_sector(cylinder, side, index, &self.buffer, self.deleted_mark));
        if !written {
            log::warn!("MB8877: sector {index} of {cylinder}/{side} not written");
        }
    }

    pub(crate) fn format_from_track(&mut self) {
        let (ids, filler) = decode_track(&self.buffer);
        let drive = self.drive;
        let cylinder = self.drives[drive].track;
        let side = self.side;
        let filler = filler.unwrap_or(0xE5);
        let formatted = self
            .disks
            .get_mut(drive)
            .is_some_and(|d| d.format_track(cylinder, side, &ids, filler));
        log::debug!("MB8877: formatted {cylinder}/{side} with {} sectors", ids.len());
        if !formatted {
            log::warn!("MB8877: format of {cylinder}/{side} failed");
        }
        self.cursor = 0;
    }
}
