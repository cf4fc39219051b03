//! Fujitsu MB8877 / MB8876 floppy disk controller.
//!
//! A WD179x-family controller modelled as a machine component. Type I
//! commands move the head one cylinder per step callback. Type II and III
//! commands search for their sector or track, raise DRQ, then move bytes
//! through the data register until the field is exhausted. Force
//! interrupt (type IV) cancels whatever is running.
//!
//! # Register interface
//!
//! `addr & 3` selects:
//! - **0**: command (write) / status (read)
//! - **1**: track
//! - **2**: sector
//! - **3**: data
//!
//! The MB8876 has an inverted data bus: every register access is
//! complemented on the way in and out.

mod commands;
pub mod status;

use std::path::Path;

use emu_core::{Component, Ctx, EventHandle, Observable, OutputPin, SignalInput, SignalOutput, Value};
use format_dsk::{DskError, DskImage, FloppyDisk};
use serde::{Deserialize, Serialize};

use status::{
    ST_BUSY, ST_DRQ, ST_INDEX, ST_LOST_DATA, ST_NOT_READY, ST_TRACK00, ST_WRITE_FAULT, ST_WRITE_PROTECT,
};

const EVENT_SEEK: u32 = 0;
const EVENT_SEEK_END: u32 = 1;
const EVENT_SEARCH: u32 = 2;
const EVENT_TYPE4: u32 = 3;
const EVENT_MULTI_STEP: u32 = 4;
const EVENT_MULTI_NEXT: u32 = 5;
const EVENT_LOST: u32 = 6;
const EVENT_COUNT: usize = 7;

/// Step time, indexed by the rate field (bits 0-1) of type I commands.
const SEEK_WAIT_USEC: [f64; 4] = [6_000.0, 12_000.0, 20_000.0, 30_000.0];
/// Type I completion check, for when no step is needed.
const SEEK_END_USEC: f64 = 300.0;
/// Head settle before the first search after a seek.
const SETTLE_SEARCH_USEC: f64 = 70_000.0;
const SEARCH_USEC: f64 = 200.0;
const LOST_SECTOR_USEC: f64 = 30_000.0;
const LOST_ADDRESS_USEC: f64 = 10_000.0;
const LOST_TRACK_USEC: f64 = 150_000.0;
/// Multi-sector: sector register bump, then the next search.
const MULTI_STEP_USEC: f64 = 30.0;
const MULTI_NEXT_USEC: f64 = 60.0;
const TYPE4_USEC: f64 = 100.0;

/// Bytes moved by write track, and by read track on an unformatted track.
const TRACK_SIZE: usize = 0x1800;
const MAX_DRIVES: usize = 4;
const DRIVE_MASK: u32 = MAX_DRIVES as u32 - 1;

const HIGH: u32 = u32::MAX;

/// Chip variant, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Variant {
    #[default]
    Mb8877,
    /// Inverted data bus.
    Mb8876,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mb8877Config {
    pub variant: Variant,
    /// Attached drives, 1..=4.
    pub drives: usize,
    /// Report sectors with a bad data CRC as good.
    pub ignore_crc: bool,
    /// Innermost cylinder the head can step to.
    pub max_track: u8,
}

impl Default for Mb8877Config {
    fn default() -> Self {
        Self {
            variant: Variant::Mb8877,
            drives: 4,
            ignore_crc: false,
            max_track: 83,
        }
    }
}

/// What the command register last started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    None,
    /// Restore, seek or step.
    TypeI,
    ReadSector,
    ReadMulti,
    WriteSector,
    WriteMulti,
    ReadAddress,
    ReadTrack,
    WriteTrack,
    /// Force interrupt has settled.
    ForceInterrupt,
}

/// Input lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mb8877Signal {
    /// Drive number in the low bits.
    DriveSelect,
    Side,
    Motor,
}

/// Output lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mb8877Output {
    Irq,
    Drq,
}

impl OutputPin for Mb8877Output {
    fn index(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DriveState {
    track: u8,
    /// Position within the field being transferred.
    index: usize,
    access: bool,
}

/// Fujitsu MB8877 floppy disk controller.
pub struct Mb8877 {
    config: Mb8877Config,
    disks: Vec<FloppyDisk>,
    drives: [DriveState; MAX_DRIVES],

    status: u8,
    command: u8,
    track: u8,
    sector: u8,
    data: u8,
    drive: usize,
    side: u8,
    motor: bool,
    command_type: CommandType,

    seek_target: u8,
    /// Direction of the last step; a plain step repeats it.
    step_out: bool,
    index_count: usize,
    /// Physical sector index where the next search starts.
    cursor: usize,
    seeking: bool,
    searching: bool,
    after_seek: bool,

    /// Sector data, address field or raw track being moved.
    buffer: Vec<u8>,
    /// Cylinder, side and physical index of the sector in `buffer`.
    target: Option<(u8, u8, usize)>,
    deleted_mark: bool,

    events: [Option<EventHandle>; EVENT_COUNT],
}

impl Mb8877 {
    #[must_use]
    pub fn new(config: Mb8877Config) -> Self {
        let drive_count = config.drives.clamp(1, MAX_DRIVES);
        Self {
            disks: (0..drive_count).map(|_| FloppyDisk::new()).collect(),
            config,
            drives: [DriveState::default(); MAX_DRIVES],
            status: 0,
            command: 0,
            track: 0,
            sector: 0,
            data: 0,
            drive: 0,
            side: 0,
            motor: false,
            command_type: CommandType::None,
            seek_target: 0,
            step_out: true,
            index_count: 0,
            cursor: 0,
            seeking: false,
            searching: false,
            after_seek: false,
            buffer: Vec::new(),
            target: None,
            deleted_mark: false,
            events: Default::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Mb8877Config {
        &self.config
    }

    #[must_use]
    pub fn command_type(&self) -> CommandType {
        self.command_type
    }

    /// Status register as last latched, without the side effects of a read.
    #[must_use]
    pub fn status(&self) -> u8 {
        self.status
    }

    #[must_use]
    pub fn busy(&self) -> bool {
        self.status & ST_BUSY != 0
    }

    #[must_use]
    pub fn track_register(&self) -> u8 {
        self.track
    }

    #[must_use]
    pub fn sector_register(&self) -> u8 {
        self.sector
    }

    #[must_use]
    pub fn data_register(&self) -> u8 {
        self.data
    }

    /// Cylinder the head of `drive` is over.
    #[must_use]
    pub fn cylinder(&self, drive: usize) -> Option<u8> {
        self.drives.get(drive).map(|d| d.track)
    }

    #[must_use]
    pub fn motor(&self) -> bool {
        self.motor
    }

    /// Drives touched by data transfers since the last call, one bit each.
    pub fn take_access_flags(&mut self) -> u8 {
        let mut flags = 0;
        for (i, drive) in self.drives.iter_mut().enumerate() {
            if drive.access {
                flags |= 1 << i;
            }
            drive.access = false;
        }
        flags
    }

    // -----------------------------------------------------------------------
    // Media
    // -----------------------------------------------------------------------

    pub fn open_disk(&mut self, drive: usize, path: &Path, offset: u64) -> Result<(), DskError> {
        match self.disks.get_mut(drive) {
            Some(disk) => disk.open(path, offset),
            None => {
                log::warn!("MB8877: no drive {drive} for {}", path.display());
                Ok(())
            }
        }
    }

    pub fn insert_disk(&mut self, drive: usize, image: DskImage) {
        match self.disks.get_mut(drive) {
            Some(disk) => disk.insert(image),
            None => log::warn!("MB8877: no drive {drive}"),
        }
    }

    /// Eject the medium in `drive`. Any command in progress is abandoned.
    pub fn close_disk(&mut self, drive: usize) -> Option<DskImage> {
        let image = self.disks.get_mut(drive)?.close();
        self.cancel_all();
        self.command_type = CommandType::None;
        image
    }

    #[must_use]
    pub fn disk_inserted(&self, drive: usize) -> bool {
        self.disks.get(drive).is_some_and(FloppyDisk::inserted)
    }

    #[must_use]
    pub fn disk(&self, drive: usize) -> Option<&FloppyDisk> {
        self.disks.get(drive)
    }

    pub fn disk_mut(&mut self, drive: usize) -> Option<&mut FloppyDisk> {
        self.disks.get_mut(drive)
    }

    // -----------------------------------------------------------------------
    // Output lines and timed events
    // -----------------------------------------------------------------------

    /// Apply the variant's bus polarity.
    fn bus(&self, value: u8) -> u8 {
        match self.config.variant {
            Variant::Mb8877 => value,
            Variant::Mb8876 => !value,
        }
    }

    fn set_irq(&mut self, ctx: &mut Ctx<'_>, value: bool) {
        ctx.publish(Mb8877Output::Irq, if value { HIGH } else { 0 });
    }

    fn set_drq(&mut self, ctx: &mut Ctx<'_>, value: bool) {
        ctx.publish(Mb8877Output::Drq, if value { HIGH } else { 0 });
    }

    fn schedule(&mut self, ctx: &mut Ctx<'_>, event: u32, usec: f64) {
        self.events[event as usize] = Some(ctx.schedule_usec(event, usec, false));
        match event {
            EVENT_SEEK => {
                self.seeking = true;
                self.after_seek = true;
            }
            EVENT_SEARCH => self.searching = true,
            _ => {}
        }
    }

    fn cancel(&mut self, event: u32) {
        self.events[event as usize] = None;
        match event {
            EVENT_SEEK => self.seeking = false,
            EVENT_SEARCH => self.searching = false,
            _ => {}
        }
    }

    fn cancel_all(&mut self) {
        for event in 0..EVENT_COUNT as u32 {
            self.cancel(event);
        }
    }

    /// The first search after a seek waits for the head to settle.
    fn search_time(&mut self) -> f64 {
        if self.after_seek {
            self.after_seek = false;
            SETTLE_SEARCH_USEC
        } else {
            SEARCH_USEC
        }
    }

    /// End the running command with an interrupt.
    fn finish(&mut self, ctx: &mut Ctx<'_>) {
        self.status &= !(ST_BUSY | ST_DRQ);
        self.command_type = CommandType::None;
        self.cancel(EVENT_LOST);
        self.set_irq(ctx, true);
    }

    fn ready(&self) -> bool {
        self.motor && self.disk_inserted(self.drive)
    }

    // -----------------------------------------------------------------------
    // Register access
    // -----------------------------------------------------------------------

    fn read_status(&mut self, ctx: &mut Ctx<'_>) -> u8 {
        let value = if self.command_type == CommandType::ForceInterrupt {
            self.status = if self.ready() { 0 } else { ST_NOT_READY };
            self.status
        } else if self.searching {
            ST_BUSY
        } else {
            if self.ready() {
                self.status &= !ST_NOT_READY;
            } else {
                self.status |= ST_NOT_READY;
            }

            let writes = matches!(
                self.command_type,
                CommandType::TypeI | CommandType::WriteSector | CommandType::WriteMulti | CommandType::WriteTrack
            );
            let protected = self
                .disks
                .get(self.drive)
                .is_some_and(|d| d.inserted() && d.write_protected);
            if writes && protected {
                self.status |= ST_WRITE_PROTECT;
            } else {
                self.status &= !ST_WRITE_PROTECT;
            }

            if self.command_type == CommandType::TypeI {
                let cylinder = self.drives[self.drive].track;
                if cylinder == 0 {
                    self.status |= ST_TRACK00;
                } else {
                    self.status &= !ST_TRACK00;
                }
                if self.status & ST_NOT_READY == 0 {
                    if self.index_count == 0 {
                        self.status |= ST_INDEX;
                    } else {
                        self.status &= !ST_INDEX;
                    }
                    // One index pulse per revolution's worth of sectors.
                    let sectors = self.disks.get(self.drive).map_or(0, |d| d.sector_count(cylinder, self.side));
                    self.index_count += 1;
                    if self.index_count >= if sectors == 0 { 16 } else { sectors } {
                        self.index_count = 0;
                    }
                }
            }

            let value = self.status;
            // Busy shows for one read after a type I command completes.
            if self.command_type == CommandType::TypeI && !self.seeking {
                self.status &= !ST_BUSY;
            }
            value
        };

        if self.status & ST_DRQ == 0 {
            self.set_drq(ctx, false);
        }
        self.set_irq(ctx, false);
        log::trace!("MB8877: status {value:#04X}");
        self.bus(value)
    }

    fn read_data(&mut self, ctx: &mut Ctx<'_>) -> u8 {
        if self.motor && self.status & ST_DRQ != 0 && !self.searching {
            let drive = self.drive;
            match self.command_type {
                CommandType::ReadSector
                | CommandType::ReadMulti
                | CommandType::ReadAddress
                | CommandType::ReadTrack => {
                    let index = self.drives[drive].index;
                    if let Some(&byte) = self.buffer.get(index) {
                        self.data = byte;
                        self.drives[drive].index = index + 1;
                    }
                    if self.drives[drive].index >= self.buffer.len() {
                        match self.command_type {
                            CommandType::ReadMulti => self.next_sector(ctx),
                            CommandType::ReadTrack => {
                                self.status |= ST_LOST_DATA;
                                self.finish(ctx);
                            }
                            _ => self.finish(ctx),
                        }
                    }
                    self.drives[drive].access = true;
                }
                _ => {}
            }
            if self.status & ST_DRQ == 0 {
                self.set_drq(ctx, false);
            }
        }
        self.bus(self.data)
    }

    fn write_data(&mut self, ctx: &mut Ctx<'_>, value: u8) {
        self.data = value;
        if !self.motor || self.status & ST_DRQ == 0 || self.searching {
            return;
        }
        let drive = self.drive;
        if !matches!(
            self.command_type,
            CommandType::WriteSector | CommandType::WriteMulti | CommandType::WriteTrack
        ) {
            return;
        }
        if self.disks.get(drive).is_none_or(|d| d.write_protected) {
            log::debug!("MB8877: write fault on drive {drive}");
            self.status |= ST_WRITE_FAULT;
            self.finish(ctx);
            self.set_drq(ctx, false);
            return;
        }

        let index = self.drives[drive].index;
        if let Some(slot) = self.buffer.get_mut(index) {
            *slot = value;
            self.drives[drive].index = index + 1;
        }
        if self.command_type != CommandType::WriteTrack {
            self.deleted_mark = self.command & 1 != 0;
        }
        if self.drives[drive].index >= self.buffer.len() {
            match self.command_type {
                CommandType::WriteTrack => {
                    self.format_from_track();
                    self.finish(ctx);
                }
                CommandType::WriteMulti => {
                    self.commit_sector();
                    self.next_sector(ctx);
                }
                _ => {
                    self.commit_sector();
                    self.finish(ctx);
                }
            }
        }
        self.drives[drive].access = true;
        if self.status & ST_DRQ == 0 {
            self.set_drq(ctx, false);
        }
    }

    /// Register writes that land while a sector command is still waiting
    /// for its first byte restart the search.
    fn restart_search(&mut self, ctx: &mut Ctx<'_>) {
        let sector_command = matches!(
            self.command_type,
            CommandType::ReadSector | CommandType::ReadMulti | CommandType::WriteSector | CommandType::WriteMulti
        );
        if self.status & ST_BUSY != 0 && self.drives[self.drive].index == 0 && sector_command {
            self.process_cmd(ctx);
        }
    }

    fn next_sector(&mut self, ctx: &mut Ctx<'_>) {
        self.status &= !ST_DRQ;
        self.schedule(ctx, EVENT_MULTI_STEP, MULTI_STEP_USEC);
        self.schedule(ctx, EVENT_MULTI_NEXT, MULTI_NEXT_USEC);
    }

    fn seek_done(&mut self, ctx: &mut Ctx<'_>) {
        let restore = self.command & 0xF0 == 0;
        if self.command & 0x10 != 0 || restore {
            self.track = self.drives[self.drive].track;
        }
        if restore {
            self.data = 0;
        }
        self.status |= self.verify_track();
        self.cancel(EVENT_SEEK);
        self.set_irq(ctx, true);
        log::debug!("MB8877: drive {} on cylinder {}", self.drive, self.drives[self.drive].track);
    }

    fn step(&mut self, ctx: &mut Ctx<'_>) {
        let drive = self.drive;
        let current = self.drives[drive].track;
        let next = match self.seek_target.cmp(&current) {
            std::cmp::Ordering::Greater => current + 1,
            std::cmp::Ordering::Less => current - 1,
            std::cmp::Ordering::Equal => current,
        };
        self.drives[drive].track = next;
        if self.command & 0x10 != 0 {
            self.track = next;
        } else if self.command & 0xF0 == 0 {
            self.track = self.track.wrapping_sub(1);
        }
        if next == self.seek_target {
            self.seek_done(ctx);
        } else {
            let rate = usize::from(self.command & 3);
            self.schedule(ctx, EVENT_SEEK, SEEK_WAIT_USEC[rate]);
        }
    }
}

impl Component for Mb8877 {
    fn initialize(&mut self, ctx: &mut Ctx<'_>) {
        self.set_irq(ctx, false);
        self.set_drq(ctx, false);
    }

    fn reset(&mut self, _ctx: &mut Ctx<'_>) {
        self.drives = [DriveState::default(); MAX_DRIVES];
        self.cancel_all();
        self.after_seek = false;
    }

    fn release(&mut self, _ctx: &mut Ctx<'_>) {
        for disk in &mut self.disks {
            disk.close();
        }
    }

    fn read_io8(&mut self, ctx: &mut Ctx<'_>, addr: u32) -> u8 {
        match addr & 3 {
            0 => self.read_status(ctx),
            1 => self.bus(self.track),
            2 => self.bus(self.sector),
            _ => self.read_data(ctx),
        }
    }

    fn write_io8(&mut self, ctx: &mut Ctx<'_>, addr: u32, data: u8) {
        let value = self.bus(data);
        match addr & 3 {
            0 => {
                self.command = value;
                self.process_cmd(ctx);
            }
            1 => {
                self.track = value;
                self.restart_search(ctx);
            }
            2 => {
                self.sector = value;
                self.restart_search(ctx);
            }
            _ => self.write_data(ctx, value),
        }
    }

    fn read_dma_io8(&mut self, ctx: &mut Ctx<'_>, _addr: u32) -> u8 {
        self.read_data(ctx)
    }

    fn write_dma_io8(&mut self, ctx: &mut Ctx<'_>, _addr: u32, data: u8) {
        let value = self.bus(data);
        self.write_data(ctx, value);
    }

    fn event_callback(&mut self, ctx: &mut Ctx<'_>, tag: u32, _late: u64) {
        if let Some(slot) = self.events.get_mut(tag as usize) {
            *slot = None;
        }
        match tag {
            EVENT_SEEK => self.step(ctx),
            EVENT_SEEK_END => {
                if self.seek_target == self.drives[self.drive].track {
                    self.seek_done(ctx);
                }
            }
            EVENT_SEARCH => {
                self.searching = false;
                if self.status & status::ST_RECORD_NOT_FOUND == 0 {
                    self.status |= ST_DRQ;
                    self.set_drq(ctx, true);
                }
            }
            EVENT_TYPE4 => self.command_type = CommandType::ForceInterrupt,
            EVENT_MULTI_STEP => self.sector = self.sector.wrapping_add(1),
            EVENT_MULTI_NEXT => match self.command_type {
                CommandType::ReadMulti => self.cmd_read_data(ctx),
                CommandType::WriteMulti => self.cmd_write_data(ctx),
                _ => {}
            },
            EVENT_LOST => {
                if self.status & ST_BUSY != 0 {
                    log::debug!("MB8877: data lost in {:?}", self.command_type);
                    self.status |= ST_LOST_DATA;
                    self.status &= !ST_BUSY;
                    self.set_irq(ctx, true);
                }
            }
            _ => {}
        }
    }
}

impl SignalInput for Mb8877 {
    type Signal = Mb8877Signal;

    fn write_signal(&mut self, _ctx: &mut Ctx<'_>, signal: Mb8877Signal, data: u32, mask: u32) {
        match signal {
            Mb8877Signal::DriveSelect => self.drive = ((data & mask) & DRIVE_MASK) as usize,
            Mb8877Signal::Side => self.side = u8::from(data & mask != 0),
            Mb8877Signal::Motor => self.motor = data & mask != 0,
        }
    }
}

impl SignalOutput for Mb8877 {
    type Output = Mb8877Output;
}

impl Observable for Mb8877 {
    fn query(&self, path: &str) -> Option<Value> {
        match path {
            "status" => Some(self.status.into()),
            "command" => Some(self.command.into()),
            "command_type" => Some(format!("{:?}", self.command_type).into()),
            "track" => Some(self.track.into()),
            "sector" => Some(self.sector.into()),
            "data" => Some(self.data.into()),
            "drive" => Some((self.drive as u8).into()),
            "side" => Some(self.side.into()),
            "motor" => Some(self.motor.into()),
            _ => {
                let (drive, field) = path.strip_prefix("drive")?.split_once('.')?;
                let drive: usize = drive.parse().ok()?;
                match field {
                    "cylinder" => self.cylinder(drive).map(Value::from),
                    "inserted" => Some(self.disk_inserted(drive).into()),
                    _ => None,
                }
            }
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &[
            "status",
            "command",
            "command_type",
            "track",
            "sector",
            "data",
            "drive",
            "side",
            "motor",
            "drive0.cylinder",
            "drive0.inserted",
            "drive1.cylinder",
            "drive1.inserted",
            "drive2.cylinder",
            "drive2.inserted",
            "drive3.cylinder",
            "drive3.inserted",
        ]
    }
}
