//! uPD765A command decoding and execution.
//!
//! Every command is a small phase machine. `process_cmd` is re-entered
//! each time the controller changes phase (parameters complete, a
//! scheduled phase event fires, a transfer ends, terminal count) and the
//! handler picks up from the current phase.

use emu_core::Ctx;
use format_dsk::SectorId;

use crate::status::{
    ST0_AT, ST0_AI, ST0_IC, ST0_NR, ST1_DE, ST1_EN, ST1_MA, ST1_ND, ST1_NW, ST2_BC, ST2_CM, ST2_DD,
    ST2_NC, ST2_SN, ST3_FT, ST3_HD, ST3_RY, ST3_T0, ST3_TS, ST3_WP,
};
use crate::{DRIVE_MASK, FdcPhase, IdleSense, Upd765};

/// Multi-track bit of the command byte.
const MT: u8 = 0x80;
/// Skip bit of the command byte.
const SK: u8 = 0x20;

/// Commands, decoded from the low 5 bits of the command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Read track.
    ReadDiagnostic,
    Specify,
    SenseDriveStatus,
    WriteData,
    ReadData,
    Recalibrate,
    SenseInterruptStatus,
    WriteDeletedData,
    ReadId,
    ReadDeletedData,
    /// Format a track.
    WriteId,
    Seek,
    ScanEqual,
    ScanLowOrEqual,
    ScanHighOrEqual,
    Invalid,
}

impl Command {
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        match byte & 0x1F {
            0x02 => Self::ReadDiagnostic,
            0x03 => Self::Specify,
            0x04 => Self::SenseDriveStatus,
            0x05 => Self::WriteData,
            0x06 => Self::ReadData,
            0x07 => Self::Recalibrate,
            0x08 => Self::SenseInterruptStatus,
            0x09 => Self::WriteDeletedData,
            0x0A => Self::ReadId,
            0x0C => Self::ReadDeletedData,
            0x0D => Self::WriteId,
            0x0F => Self::Seek,
            0x11 => Self::ScanEqual,
            0x19 => Self::ScanLowOrEqual,
            0x1D => Self::ScanHighOrEqual,
            _ => Self::Invalid,
        }
    }

    /// Parameter bytes following the command byte.
    #[must_use]
    pub fn parameter_count(self) -> usize {
        match self {
            Self::ReadDiagnostic
            | Self::WriteData
            | Self::ReadData
            | Self::WriteDeletedData
            | Self::ReadDeletedData
            | Self::ScanEqual
            | Self::ScanLowOrEqual
            | Self::ScanHighOrEqual => 8,
            Self::WriteId => 5,
            Self::Specify | Self::Seek => 2,
            Self::SenseDriveStatus | Self::Recalibrate | Self::ReadId => 1,
            Self::SenseInterruptStatus | Self::Invalid => 0,
        }
    }

    #[must_use]
    pub fn is_scan(self) -> bool {
        matches!(self, Self::ScanEqual | Self::ScanLowOrEqual | Self::ScanHighOrEqual)
    }

    /// Commands with a data transfer that terminal count can end.
    #[must_use]
    pub fn accepts_terminal_count(self) -> bool {
        matches!(
            self,
            Self::ReadDiagnostic
                | Self::WriteData
                | Self::ReadData
                | Self::WriteDeletedData
                | Self::ReadDeletedData
                | Self::WriteId
        ) || self.is_scan()
    }

    /// Whether a disk byte meets the scan condition for a host byte.
    #[must_use]
    pub fn scan_satisfied(self, disk: u8, host: u8) -> bool {
        match self {
            Self::ScanLowOrEqual => disk <= host,
            Self::ScanHighOrEqual => disk >= host,
            _ => disk == host,
        }
    }
}

impl Upd765 {
    pub(crate) fn process_cmd(&mut self, ctx: &mut Ctx<'_>) {
        match Command::from_byte(self.command) {
            Command::ReadDiagnostic => self.cmd_read_diagnostic(ctx),
            Command::Specify => self.cmd_specify(),
            Command::SenseDriveStatus => self.cmd_sense_drive_status(ctx),
            Command::WriteData | Command::WriteDeletedData => self.cmd_write_data(ctx),
            Command::ReadData | Command::ReadDeletedData => self.cmd_read_data(ctx),
            Command::Recalibrate => self.cmd_recalibrate(ctx),
            Command::SenseInterruptStatus => self.cmd_sense_interrupt_status(),
            Command::ReadId => self.cmd_read_id(ctx),
            Command::WriteId => self.cmd_write_id(ctx),
            Command::Seek => self.cmd_seek(ctx),
            Command::ScanEqual | Command::ScanLowOrEqual | Command::ScanHighOrEqual => self.cmd_scan(ctx),
            Command::Invalid => self.cmd_invalid(),
        }
    }

    fn begin(&mut self) {
        let params = Command::from_byte(self.command).parameter_count();
        self.shift_to_cmd(params);
    }

    // -----------------------------------------------------------------------
    // Control commands
    // -----------------------------------------------------------------------

    fn cmd_specify(&mut self) {
        match self.phase {
            FdcPhase::Idle => self.begin(),
            FdcPhase::Command => {
                // SRT in the top nibble; higher values step faster.
                self.step_rate = 3 - usize::from(self.buffer[0] >> 6);
                self.no_dma_mode = self.buffer[1] & 1 != 0;
                log::debug!("uPD765: specify step {} us, dma {}", crate::STEP_DELAY_USEC[self.step_rate], !self.no_dma_mode);
                self.shift_to_idle();
            }
            _ => {}
        }
    }

    fn cmd_sense_drive_status(&mut self, ctx: &mut Ctx<'_>) {
        match self.phase {
            FdcPhase::Idle => self.begin(),
            FdcPhase::Command => {
                let param = self.buffer[0];
                self.set_hdu(ctx, param);
                self.buffer[0] = self.drive_status(param);
                self.shift_to_result(1);
            }
            _ => {}
        }
    }

    /// ST3 for the drive and head selected by `param`.
    fn drive_status(&self, param: u8) -> u8 {
        let drive = usize::from(param & DRIVE_MASK);
        let select = param & (DRIVE_MASK | ST3_HD);
        match self.disks.get(drive) {
            None => ST3_FT | select,
            Some(disk) if !disk.inserted() => select,
            Some(disk) => {
                let mut st3 = ST3_RY | ST3_TS | select;
                if self.drives[drive].track == 0 {
                    st3 |= ST3_T0;
                }
                if disk.write_protected {
                    st3 |= ST3_WP;
                }
                st3
            }
        }
    }

    fn cmd_sense_interrupt_status(&mut self) {
        let pending = self.drives.iter_mut().find(|d| d.result != 0);
        if let Some(drive) = pending {
            self.buffer[0] = drive.result;
            self.buffer[1] = drive.track;
            drive.result = 0;
            self.shift_to_result(2);
        } else {
            self.buffer[0] = match self.config.sense_interrupt_idle {
                IdleSense::InvalidCommand => ST0_IC as u8,
                IdleSense::ReadyChanged => ST0_AI as u8,
            };
            self.shift_to_result(1);
        }
    }

    fn cmd_seek(&mut self, ctx: &mut Ctx<'_>) {
        match self.phase {
            FdcPhase::Idle => self.begin(),
            FdcPhase::Command => {
                let (drive, track) = (usize::from(self.buffer[0] & DRIVE_MASK), self.buffer[1]);
                self.seek(ctx, drive, track);
                self.shift_to_idle();
            }
            _ => {}
        }
    }

    fn cmd_recalibrate(&mut self, ctx: &mut Ctx<'_>) {
        match self.phase {
            FdcPhase::Idle => self.begin(),
            FdcPhase::Command => {
                let drive = usize::from(self.buffer[0] & DRIVE_MASK);
                self.seek(ctx, drive, 0);
                self.shift_to_idle();
            }
            _ => {}
        }
    }

    fn cmd_invalid(&mut self) {
        log::debug!("uPD765: invalid command {:#04X}", self.command);
        self.buffer[0] = ST0_IC as u8;
        self.shift_to_result(1);
    }

    // -----------------------------------------------------------------------
    // Data commands
    // -----------------------------------------------------------------------

    fn cmd_read_data(&mut self, ctx: &mut Ctx<'_>) {
        match self.phase {
            FdcPhase::Idle => self.begin(),
            FdcPhase::Command => {
                self.sector_params(ctx);
                self.schedule_phase(ctx, FdcPhase::Exec);
            }
            FdcPhase::Exec => {
                let deleted = Command::from_byte(self.command) == Command::ReadDeletedData;
                self.read_data(ctx, deleted, false);
            }
            FdcPhase::Read => self.next_sector(ctx),
            FdcPhase::Tc => {
                self.stop_transfer(ctx);
                self.shift_to_result7(ctx);
            }
            FdcPhase::Timer => {
                self.result = ST1_EN;
                self.shift_to_result7(ctx);
            }
            _ => {}
        }
    }

    fn cmd_write_data(&mut self, ctx: &mut Ctx<'_>) {
        let deleted = Command::from_byte(self.command) == Command::WriteDeletedData;
        match self.phase {
            FdcPhase::Idle => self.begin(),
            FdcPhase::Command => {
                self.sector_params(ctx);
                self.schedule_phase(ctx, FdcPhase::Exec);
            }
            FdcPhase::Exec => {
                self.result = self.check_condition(true);
                if self.result == 0 {
                    self.result = match self.find_sector() {
                        Ok(index) => {
                            self.sector_index = Some(index);
                            0
                        }
                        Err(code) => code,
                    };
                }
                if self.result != 0 {
                    self.shift_to_result7(ctx);
                    return;
                }
                let length = self.transfer_length(false);
                // N = 0 transfers DTL bytes of a 128-byte sector.
                if self.id[3] == 0 {
                    self.buffer[length..0x80].fill(0);
                }
                self.shift_to_write(ctx, length);
            }
            FdcPhase::Write => {
                self.write_data(deleted);
                self.next_sector(ctx);
            }
            FdcPhase::Tc => {
                self.stop_transfer(ctx);
                if self.prev_phase == FdcPhase::Write && self.count > 0 {
                    // Terminated mid-sector: the rest is written as zeros.
                    let end = (self.pos + self.count).min(self.buffer.len());
                    self.buffer[self.pos..end].fill(0);
                    self.write_data(deleted);
                }
                self.shift_to_result7(ctx);
            }
            FdcPhase::Timer => {
                self.result = ST1_EN;
                self.shift_to_result7(ctx);
            }
            _ => {}
        }
    }

    fn cmd_scan(&mut self, ctx: &mut Ctx<'_>) {
        match self.phase {
            FdcPhase::Idle => self.begin(),
            FdcPhase::Command => {
                self.sector_params(ctx);
                self.schedule_phase(ctx, FdcPhase::Exec);
            }
            FdcPhase::Exec => self.read_data(ctx, false, true),
            FdcPhase::Scan => self.next_sector(ctx),
            FdcPhase::Tc => {
                self.stop_transfer(ctx);
                self.shift_to_result7(ctx);
            }
            FdcPhase::Timer => {
                self.result = ST1_EN | ST2_SN;
                self.shift_to_result7(ctx);
            }
            _ => {}
        }
    }

    fn cmd_read_diagnostic(&mut self, ctx: &mut Ctx<'_>) {
        match self.phase {
            FdcPhase::Idle => self.begin(),
            FdcPhase::Command => {
                self.sector_params(ctx);
                self.schedule_phase(ctx, FdcPhase::Exec);
            }
            FdcPhase::Exec => self.read_diagnostic(ctx),
            FdcPhase::Read => self.next_sector(ctx),
            FdcPhase::Tc => {
                self.stop_transfer(ctx);
                self.shift_to_result7(ctx);
            }
            FdcPhase::Timer => {
                self.result = ST1_EN;
                self.shift_to_result7(ctx);
            }
            _ => {}
        }
    }

    fn cmd_read_id(&mut self, ctx: &mut Ctx<'_>) {
        match self.phase {
            FdcPhase::Idle => self.begin(),
            FdcPhase::Command => {
                let param = self.buffer[0];
                self.set_hdu(ctx, param);
                self.schedule_phase(ctx, FdcPhase::Timer);
            }
            FdcPhase::Timer => {
                self.result = self.check_condition(false);
                if self.result == 0 {
                    self.result = self.read_id();
                }
                self.shift_to_result7(ctx);
            }
            _ => {}
        }
    }

    fn cmd_write_id(&mut self, ctx: &mut Ctx<'_>) {
        match self.phase {
            FdcPhase::Idle => self.begin(),
            FdcPhase::Command => {
                let param = self.buffer[0];
                self.set_hdu(ctx, param);
                self.id[3] = self.buffer[1];
                self.eot = self.buffer[2];
                self.gpl = self.buffer[3];
                self.filler = self.buffer[4];
                self.result = self.check_condition(true);
                if self.result != 0 {
                    self.shift_to_result7(ctx);
                } else if self.eot == 0 {
                    self.pos = 0;
                    self.schedule_phase(ctx, FdcPhase::Timer);
                } else {
                    self.shift_to_write(ctx, 4 * usize::from(self.eot));
                }
            }
            FdcPhase::Tc if self.prev_phase == FdcPhase::Result => self.shift_to_result7(ctx),
            FdcPhase::Tc | FdcPhase::Write => {
                self.stop_transfer(ctx);
                self.schedule_phase(ctx, FdcPhase::Timer);
            }
            FdcPhase::Timer => {
                self.result = self.format_track();
                self.shift_to_result7(ctx);
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn sector_params(&mut self, ctx: &mut Ctx<'_>) {
        let param = self.buffer[0];
        self.set_hdu(ctx, param);
        self.hdue = param;
        self.id.copy_from_slice(&self.buffer[1..5]);
        self.eot = self.buffer[5];
        self.gpl = self.buffer[6];
        self.dtl = self.buffer[7];
        log::debug!(
            "uPD765: drive {} C={} H={} R={} N={} EOT={}",
            param & DRIVE_MASK,
            self.id[0],
            self.id[1],
            self.id[2],
            self.id[3],
            self.eot
        );
    }

    /// After a sector's data has moved: finish on error, otherwise go on to
    /// the next sector or end the cylinder.
    fn next_sector(&mut self, ctx: &mut Ctx<'_>) {
        if self.result != 0 {
            self.shift_to_result7(ctx);
        } else if self.advance_id(ctx) {
            self.schedule_phase(ctx, FdcPhase::Exec);
        } else {
            self.schedule_phase(ctx, FdcPhase::Timer);
        }
    }

    /// Step R to the next sector. Returns false when EOT was the sector just
    /// finished and the command should end.
    fn advance_id(&mut self, ctx: &mut Ctx<'_>) -> bool {
        let step = if Command::from_byte(self.command).is_scan() && self.dtl == 2 { 2 } else { 1 };
        let finished = self.id[2];
        self.id[2] = finished.wrapping_add(step);
        if finished < self.eot && self.id[2] <= self.eot {
            return true;
        }
        self.id[2] = 1;
        if self.command & MT != 0 {
            let hdu = self.hdu ^ ST3_HD;
            self.set_hdu(ctx, hdu);
            self.id[1] ^= 1;
            if self.id[1] & 1 != 0 {
                return true;
            }
        }
        self.id[0] = self.id[0].wrapping_add(1);
        false
    }

    /// Bytes moved per sector.
    fn transfer_length(&self, scan: bool) -> usize {
        match self.id[3] {
            0 if scan => 0x80,
            0 => usize::from(self.dtl).min(0x80),
            n => 0x80 << n.min(8),
        }
    }

    /// Drive selection and media checks common to every data command.
    fn check_condition(&mut self, write: bool) -> u32 {
        self.hdue = self.hdu;
        let drive = usize::from(self.hdu & DRIVE_MASK);
        match self.disks.get(drive) {
            Some(disk) if disk.inserted() => {
                if write && disk.write_protected {
                    ST0_AT | ST1_NW
                } else {
                    0
                }
            }
            _ => ST0_AT | ST0_NR,
        }
    }

    fn head_position(&self) -> (usize, u8, u8) {
        let drive = usize::from(self.hdu & DRIVE_MASK);
        (drive, self.drives[drive].track, (self.hdu >> 2) & 1)
    }

    /// Find the sector matching C/H/R/N on the track under the head,
    /// starting where the disk has rotated to.
    fn find_sector(&mut self) -> Result<usize, u32> {
        let (drive, cyl, head) = self.head_position();
        let Some(track) = self.disks.get(drive).and_then(|d| d.track(cyl, head)) else {
            return Err(ST0_AT | ST1_MA);
        };
        let count = track.sectors.len();
        if count == 0 {
            return Err(ST0_AT | ST1_MA);
        }
        let wanted = SectorId::new(self.id[0], self.id[1], self.id[2], self.id[3]);
        let start = self.drives[drive].cursor % count;
        let mut last_cylinder = None;
        let mut found = None;
        for step in 0..count {
            let index = (start + step) % count;
            let sector = &track.sectors[index];
            last_cylinder = Some(sector.c);
            if sector.id() == wanted {
                found = Some(index);
                break;
            }
        }
        match found {
            Some(index) => {
                self.drives[drive].cursor = index + 1;
                Ok(index)
            }
            None => {
                log::debug!("uPD765: sector {wanted:?} not found on track {cyl} side {head}");
                Err(match last_cylinder {
                    Some(0xFF) if self.id[0] != 0xFF => ST0_AT | ST1_ND | ST2_BC,
                    Some(c) if c != self.id[0] => ST0_AT | ST1_ND | ST2_NC,
                    _ => ST0_AT | ST1_ND,
                })
            }
        }
    }

    /// Locate the sector and load its data into the buffer.
    fn read_sector(&mut self) -> u32 {
        let index = match self.find_sector() {
            Ok(index) => index,
            Err(code) => return code,
        };
        let (drive, cyl, head) = self.head_position();
        let Some(sector) = self.disks[drive].sector(cyl, head, index) else {
            return ST0_AT | ST1_ND;
        };
        let len = sector.data.len().min(self.buffer.len());
        self.buffer[..len].copy_from_slice(&sector.data[..len]);
        if sector.data_error() {
            ST0_AT | ST1_DE | ST2_DD
        } else if sector.deleted() {
            ST2_CM
        } else {
            0
        }
    }

    fn read_data(&mut self, ctx: &mut Ctx<'_>, deleted: bool, scan: bool) {
        self.result = self.check_condition(false);
        if self.result != 0 {
            self.shift_to_result7(ctx);
            return;
        }
        self.result = self.read_sector();
        if deleted {
            // Reading deleted data: a normal mark is the unexpected one.
            self.result ^= ST2_CM;
        }
        if self.result & !ST2_CM != 0 && self.result & ST2_DD == 0 {
            self.shift_to_result7(ctx);
            return;
        }
        if self.result & ST2_CM != 0 && self.command & SK != 0 {
            log::trace!("uPD765: skipping sector R={}", self.id[2]);
            if self.advance_id(ctx) {
                self.schedule_phase(ctx, FdcPhase::Exec);
            } else {
                self.schedule_phase(ctx, FdcPhase::Timer);
            }
            return;
        }
        let length = self.transfer_length(scan);
        if scan {
            self.shift_to_scan(ctx, length);
        } else {
            self.shift_to_read(ctx, length);
        }
    }

    /// Commit the received sector to the medium.
    fn write_data(&mut self, deleted: bool) {
        self.result = self.check_condition(true);
        if self.result != 0 {
            return;
        }
        let (drive, cyl, head) = self.head_position();
        let size = (0x80usize << self.id[3].min(8)).min(self.buffer.len());
        let written = self
            .sector_index
            .is_some_and(|index| self.disks[drive].write_sector(cyl, head, index, &self.buffer[..size], deleted));
        if !written {
            self.result = ST0_AT | ST1_ND;
        }
    }

    fn read_diagnostic(&mut self, ctx: &mut Ctx<'_>) {
        self.result = self.check_condition(false);
        if self.result != 0 {
            self.shift_to_result7(ctx);
            return;
        }
        let (drive, cyl, head) = self.head_position();
        let Some(raw) = self.disks[drive]
            .raw_track(cyl, head)
            .filter(|r| !r.data_positions.is_empty())
        else {
            self.result = ST0_AT | ST1_ND;
            self.shift_to_result7(ctx);
            return;
        };
        let start = raw.data_positions[0];
        // Starts at the first data field and wraps round the track.
        let length = 0x80 << self.id[3].min(8);
        for (i, byte) in self.buffer[..length].iter_mut().enumerate() {
            *byte = raw.bytes[(start + i) % raw.bytes.len()];
        }
        self.shift_to_read(ctx, length);
    }

    /// Header under the head, in rotation order.
    fn read_id(&mut self) -> u32 {
        let (drive, cyl, head) = self.head_position();
        let Some(track) = self.disks.get(drive).and_then(|d| d.track(cyl, head)) else {
            return ST0_AT | ST1_MA;
        };
        let count = track.sectors.len();
        if count == 0 {
            return ST0_AT | ST1_MA;
        }
        let index = self.drives[drive].cursor % count;
        let sector = &track.sectors[index];
        self.id = [sector.c, sector.h, sector.r, sector.n];
        self.drives[drive].cursor = index + 1;
        0
    }

    /// Lay down the track from the ID quadruples received.
    fn format_track(&mut self) -> u32 {
        let result = self.check_condition(true);
        if result != 0 {
            return result;
        }
        let (drive, cyl, head) = self.head_position();
        let received = (self.pos / 4).min(usize::from(self.eot));
        let ids: Vec<SectorId> = self.buffer[..received * 4]
            .chunks_exact(4)
            .map(|q| SectorId::new(q[0], q[1], q[2], q[3]))
            .collect();
        log::debug!("uPD765: formatting track {cyl} side {head} with {} sectors", ids.len());
        self.disks[drive].format_track(cyl, head, &ids, self.filler);
        self.drives[drive].cursor = 0;
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_ignores_mode_bits() {
        assert_eq!(Command::from_byte(0x46), Command::ReadData);
        assert_eq!(Command::from_byte(0xE6), Command::ReadData);
        assert_eq!(Command::from_byte(0x4D), Command::WriteId);
        assert_eq!(Command::from_byte(0x1F), Command::Invalid);
        assert_eq!(Command::from_byte(0x00), Command::Invalid);
    }

    #[test]
    fn parameter_counts() {
        assert_eq!(Command::ReadData.parameter_count(), 8);
        assert_eq!(Command::ScanHighOrEqual.parameter_count(), 8);
        assert_eq!(Command::WriteId.parameter_count(), 5);
        assert_eq!(Command::Seek.parameter_count(), 2);
        assert_eq!(Command::ReadId.parameter_count(), 1);
        assert_eq!(Command::SenseInterruptStatus.parameter_count(), 0);
    }

    #[test]
    fn scan_conditions() {
        assert!(Command::ScanEqual.scan_satisfied(5, 5));
        assert!(!Command::ScanEqual.scan_satisfied(5, 6));
        assert!(Command::ScanLowOrEqual.scan_satisfied(5, 6));
        assert!(!Command::ScanLowOrEqual.scan_satisfied(7, 6));
        assert!(Command::ScanHighOrEqual.scan_satisfied(7, 6));
        assert!(!Command::ScanHighOrEqual.scan_satisfied(5, 6));
    }

    #[test]
    fn terminal_count_only_for_transfers() {
        assert!(Command::ReadData.accepts_terminal_count());
        assert!(Command::ScanEqual.accepts_terminal_count());
        assert!(!Command::ReadId.accepts_terminal_count());
        assert!(!Command::Seek.accepts_terminal_count());
    }
}
