//! NEC uPD765A floppy disk controller.
//!
//! A scheduler-driven model of the uPD765A as a machine component. The
//! controller is a phase machine: the CPU writes a command byte and its
//! parameters, the command executes after a delay on the virtual clock,
//! data moves one byte per data request, and the CPU (or a DMA engine)
//! reads back the result bytes. Nothing happens between bus accesses
//! unless a callback is due.
//!
//! # Register interface
//!
//! Address bit 0 selects the register:
//! - **0: Main Status Register (MSR)**, read-only
//! - **1: Data Register**, read/write
//!
//! # State machine
//!
//! Idle → Command (parameter bytes) → Exec → Read / Write / Scan (data
//! transfer) → Result. Terminal count can end a transfer early, and a
//! fixed timer delays end-of-cylinder results.
//!
//! Disk faults never surface as host errors; they show up in ST0-ST3
//! exactly where a real controller reports them.

mod commands;
mod state;
pub mod status;

use std::path::Path;

use emu_core::{Component, Ctx, EventHandle, Observable, OutputPin, SignalInput, SignalOutput, Value};
use format_dsk::{DskError, DskImage, FloppyDisk, MediaType};
use serde::{Deserialize, Serialize};

pub use commands::Command;
pub use state::{DriveState, Upd765State};

use status::{MSR_CB, MSR_DIO, MSR_NDM, MSR_RQM, ST0_AI, ST0_AT, ST0_NR, ST0_SE, ST1_EN, ST1_OR, ST2_SH};

const EVENT_PHASE: u32 = 0;
const EVENT_DRQ: u32 = 1;
const EVENT_LOST: u32 = 2;
const EVENT_RESULT7: u32 = 3;
const EVENT_INDEX: u32 = 4;
const EVENT_SEEK: u32 = 5;

/// Delay before a scheduled phase change takes effect.
const PHASE_DELAY_USEC: f64 = 100.0;
/// An unserviced data request is lost after this long.
const LOST_USEC: f64 = 30_000.0;
const RESULT7_DELAY_USEC: f64 = 100.0;
/// Seek to the track the head is already on.
const SEEK_SAME_TRACK_USEC: f64 = 120.0;
const SEEK_SETTLE_USEC: f64 = 500.0;
/// Per-track step time, indexed by the SPECIFY step-rate field.
const STEP_DELAY_USEC: [f64; 4] = [40.0, 80.0, 120.0, 160.0];
/// 300 rpm, 256 ticks per revolution.
const INDEX_PERIOD_USEC: f64 = 1_000_000.0 / (300.0 / 60.0) / 256.0;

const DRIVE_MASK: u8 = 3;
const MAX_DRIVES: usize = 4;
/// Large enough for a read track of N = 8.
const BUFFER_SIZE: usize = 0x8000;

const HIGH: u32 = u32::MAX;

/// FDC state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FdcPhase {
    /// Waiting for a command byte.
    Idle,
    /// Receiving command parameter bytes.
    Command,
    /// Locating the sector.
    Exec,
    /// Sector data flowing to the host.
    Read,
    /// Sector data flowing from the host.
    Write,
    /// Host bytes compared against sector data.
    Scan,
    /// Terminal count received during a transfer.
    Tc,
    /// Fixed delay before an end-of-cylinder result.
    Timer,
    /// Host reads result bytes.
    Result,
}

/// What SENSE INTERRUPT STATUS returns when no drive has a result pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IdleSense {
    /// ST0 = `0x80`, as for an invalid command.
    #[default]
    InvalidCommand,
    /// ST0 = `0xC0`, ready line changed.
    ReadyChanged,
}

/// Board-specific behaviour of a uPD765A, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Upd765Config {
    /// Attached drives, 1..=4.
    pub drives: usize,
    /// Seeks take time; otherwise they complete as soon as issued.
    pub wait_seek: bool,
    /// Set ST0 AT as well as NR when a seek ends on a drive without media.
    pub st0_at_for_seek_not_ready: bool,
    pub sense_interrupt_idle: IdleSense,
    /// Delay 7-byte results by 100 µs.
    pub wait_result7: bool,
    /// Strip ST1 EN and OR from 7-byte results.
    pub mask_en_or: bool,
    /// Post an interrupt (ST0 = AI) when media is inserted or ejected.
    pub irq_on_media_change: bool,
}

impl Default for Upd765Config {
    fn default() -> Self {
        Self {
            drives: 4,
            wait_seek: true,
            st0_at_for_seek_not_ready: true,
            sense_interrupt_idle: IdleSense::InvalidCommand,
            wait_result7: false,
            mask_en_or: false,
            irq_on_media_change: false,
        }
    }
}

/// Input lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upd765Signal {
    /// Rising edge resets the controller.
    Reset,
    TerminalCount,
    Motor,
    /// Active-low motor line.
    MotorNeg,
    IrqMask,
    DrqMask,
    /// Treat every drive as ready during seeks.
    ForceReady,
}

/// Output lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upd765Output {
    Irq,
    Drq,
    /// Head and unit select, as the HDU byte.
    Hdu,
    Index,
}

impl OutputPin for Upd765Output {
    fn index(self) -> u8 {
        self as u8
    }
}

/// NEC uPD765A floppy disk controller.
pub struct Upd765 {
    config: Upd765Config,
    disks: Vec<FloppyDisk>,
    drives: [DriveState; MAX_DRIVES],

    phase: FdcPhase,
    prev_phase: FdcPhase,
    event_phase: FdcPhase,
    /// MSR bits other than the per-drive seek bits.
    status: u8,
    /// MSR D0B-D3B.
    seek_status: u8,
    command: u8,
    buffer: Vec<u8>,
    pos: usize,
    count: usize,
    /// Accumulated ST0/ST1/ST2 for the current command.
    result: u32,
    hdu: u8,
    /// HDU latched for the ST0 of the next result.
    hdue: u8,
    /// C, H, R, N.
    id: [u8; 4],
    eot: u8,
    gpl: u8,
    /// DTL, or STP for scans.
    dtl: u8,
    filler: u8,
    /// Index into [`STEP_DELAY_USEC`].
    step_rate: usize,
    /// Physical index of the sector being transferred.
    sector_index: Option<usize>,

    no_dma_mode: bool,
    motor: bool,
    force_ready: bool,
    reset_signal: bool,
    irq_masked: bool,
    drq_masked: bool,
    irq_request: bool,
    drq_request: bool,
    index_count: u8,

    phase_event: Option<EventHandle>,
    drq_event: Option<EventHandle>,
    lost_event: Option<EventHandle>,
    result7_event: Option<EventHandle>,
    seek_events: [Option<EventHandle>; MAX_DRIVES],
    index_event: Option<EventHandle>,
}

impl Upd765 {
    /// Create a controller with empty drives.
    #[must_use]
    pub fn new(config: Upd765Config) -> Self {
        let drive_count = config.drives.clamp(1, MAX_DRIVES);
        Self {
            disks: (0..drive_count).map(|_| FloppyDisk::new()).collect(),
            config,
            drives: [DriveState::default(); MAX_DRIVES],
            phase: FdcPhase::Idle,
            prev_phase: FdcPhase::Idle,
            event_phase: FdcPhase::Idle,
            status: MSR_RQM,
            seek_status: 0,
            command: 0,
            buffer: vec![0; BUFFER_SIZE],
            pos: 0,
            count: 0,
            result: 0,
            hdu: 0,
            hdue: 0,
            id: [0; 4],
            eot: 0,
            gpl: 0,
            dtl: 0,
            filler: 0,
            step_rate: 0,
            sector_index: None,
            no_dma_mode: false,
            motor: false,
            force_ready: false,
            reset_signal: true,
            irq_masked: false,
            drq_masked: false,
            irq_request: false,
            drq_request: false,
            index_count: 0,
            phase_event: None,
            drq_event: None,
            lost_event: None,
            result7_event: None,
            seek_events: Default::default(),
            index_event: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Upd765Config {
        &self.config
    }

    #[must_use]
    pub fn phase(&self) -> FdcPhase {
        self.phase
    }

    /// Main status register, without side effects.
    #[must_use]
    pub fn status(&self) -> u8 {
        self.seek_status | self.status
    }

    /// Level of the interrupt output.
    #[must_use]
    pub fn irq(&self) -> bool {
        self.irq_request && !self.irq_masked
    }

    /// Level of the DMA request output.
    #[must_use]
    pub fn drq(&self) -> bool {
        self.drq_request && !self.drq_masked
    }

    /// A data request or data-lost callback is armed.
    #[must_use]
    pub fn data_request_armed(&self) -> bool {
        self.drq_event.as_ref().is_some_and(EventHandle::is_pending)
            || self.lost_event.as_ref().is_some_and(EventHandle::is_pending)
    }

    /// Cylinder the head of `drive` is over.
    #[must_use]
    pub fn track(&self, drive: usize) -> Option<u8> {
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

    /// Open an image file in `drive`, skipping `offset` header bytes.
    pub fn open_disk(&mut self, ctx: &mut Ctx<'_>, drive: usize, path: &Path, offset: u64) -> Result<(), DskError> {
        let Some(disk) = self.disks.get_mut(drive) else {
            log::warn!("uPD765: no drive {drive} for {}", path.display());
            return Ok(());
        };
        let opened = disk.open(path, offset);
        if disk.changed() {
            self.media_changed(ctx, drive);
        }
        opened
    }

    /// Put an in-memory image into `drive`.
    pub fn insert_disk(&mut self, ctx: &mut Ctx<'_>, drive: usize, image: DskImage) {
        let Some(disk) = self.disks.get_mut(drive) else {
            log::warn!("uPD765: no drive {drive}");
            return;
        };
        disk.insert(image);
        self.media_changed(ctx, drive);
    }

    /// Eject the medium in `drive`, writing back a modified image file.
    pub fn close_disk(&mut self, ctx: &mut Ctx<'_>, drive: usize) -> Option<DskImage> {
        let disk = self.disks.get_mut(drive).filter(|d| d.inserted())?;
        let image = disk.close();
        log::debug!("uPD765: drive {drive} ejected");
        self.media_changed(ctx, drive);
        image
    }

    #[must_use]
    pub fn disk_inserted(&self, drive: usize) -> bool {
        self.disks.get(drive).is_some_and(FloppyDisk::inserted)
    }

    #[must_use]
    pub fn media_type(&self, drive: usize) -> MediaType {
        self.disks
            .get(drive)
            .filter(|d| d.inserted())
            .map_or(MediaType::Unknown, FloppyDisk::media_type)
    }

    #[must_use]
    pub fn disk(&self, drive: usize) -> Option<&FloppyDisk> {
        self.disks.get(drive)
    }

    /// Direct access to a drive's medium, e.g. to toggle write protect.
    pub fn disk_mut(&mut self, drive: usize) -> Option<&mut FloppyDisk> {
        self.disks.get_mut(drive)
    }

    fn media_changed(&mut self, ctx: &mut Ctx<'_>, drive: usize) {
        if self.config.irq_on_media_change {
            self.drives[drive].result = drive as u8 | ST0_AI as u8;
            self.set_irq(ctx, true);
        }
    }

    // -----------------------------------------------------------------------
    // Register access
    // -----------------------------------------------------------------------

    fn read_register(&mut self, ctx: &mut Ctx<'_>, addr: u32) -> u8 {
        if addr & 1 == 0 {
            return self.status();
        }
        if self.status & (MSR_RQM | MSR_DIO) != (MSR_RQM | MSR_DIO) {
            return 0xFF;
        }
        match self.phase {
            FdcPhase::Result => {
                self.status &= !MSR_RQM;
                let data = self.buffer[self.pos];
                self.pos += 1;
                self.count -= 1;
                if self.count > 0 {
                    self.status |= MSR_RQM;
                } else {
                    // Keep the interrupt while other drives still have
                    // seek results to collect.
                    let more = Command::from_byte(self.command) == Command::SenseInterruptStatus
                        && self.drives.iter().any(|d| d.result != 0);
                    if !more {
                        self.set_irq(ctx, false);
                    }
                    self.shift_to_idle();
                }
                log::trace!("uPD765: result byte {data:#04X}");
                data
            }
            FdcPhase::Read => {
                self.status &= !MSR_RQM;
                let data = self.buffer[self.pos];
                self.pos += 1;
                self.set_drq(ctx, false);
                self.count -= 1;
                if self.count > 0 {
                    self.arm_drq(ctx);
                } else {
                    self.process_cmd(ctx);
                }
                self.drives[usize::from(self.hdu & DRIVE_MASK)].access = true;
                data
            }
            _ => 0xFF,
        }
    }

    fn write_register(&mut self, ctx: &mut Ctx<'_>, addr: u32, data: u8) {
        if addr & 1 == 0 {
            return;
        }
        if self.status & (MSR_RQM | MSR_DIO) != MSR_RQM {
            return;
        }
        match self.phase {
            FdcPhase::Idle => {
                self.status &= !MSR_RQM;
                self.command = data;
                log::debug!("uPD765: command {data:#04X} {:?}", Command::from_byte(data));
                self.process_cmd(ctx);
            }
            FdcPhase::Command => {
                self.status &= !MSR_RQM;
                self.buffer[self.pos] = data;
                self.pos += 1;
                self.count -= 1;
                if self.count > 0 {
                    self.status |= MSR_RQM;
                } else {
                    self.process_cmd(ctx);
                }
            }
            FdcPhase::Write => {
                self.status &= !MSR_RQM;
                self.buffer[self.pos] = data;
                self.pos += 1;
                self.transfer_step(ctx);
            }
            FdcPhase::Scan => {
                self.status &= !MSR_RQM;
                if data != 0xFF && !Command::from_byte(self.command).scan_satisfied(self.buffer[self.pos], data) {
                    self.result &= !ST2_SH;
                }
                self.pos += 1;
                self.transfer_step(ctx);
            }
            _ => {}
        }
    }

    /// Bookkeeping after a host-to-controller data byte.
    fn transfer_step(&mut self, ctx: &mut Ctx<'_>) {
        self.set_drq(ctx, false);
        self.count -= 1;
        if self.count > 0 {
            self.arm_drq(ctx);
        } else {
            self.process_cmd(ctx);
        }
        self.drives[usize::from(self.hdu & DRIVE_MASK)].access = true;
    }

    // -----------------------------------------------------------------------
    // Output lines and timed events
    // -----------------------------------------------------------------------

    fn set_irq(&mut self, ctx: &mut Ctx<'_>, value: bool) {
        self.irq_request = value;
        ctx.publish(Upd765Output::Irq, if self.irq() { HIGH } else { 0 });
    }

    /// Raise or drop the data request. Raising it arms the data-lost timer;
    /// either way any pending request or data-lost callback is cancelled.
    fn set_drq(&mut self, ctx: &mut Ctx<'_>, value: bool) {
        self.drq_event = None;
        self.lost_event = None;
        if value {
            self.lost_event = Some(ctx.schedule_usec(EVENT_LOST, LOST_USEC, false));
        }
        if self.no_dma_mode {
            self.set_irq(ctx, value);
        } else {
            self.drq_request = value;
            ctx.publish(Upd765Output::Drq, if self.drq() { HIGH } else { 0 });
        }
    }

    /// Schedule the next byte's data request.
    fn arm_drq(&mut self, ctx: &mut Ctx<'_>) {
        let usec = if self.media_type(usize::from(self.hdu & DRIVE_MASK)) == MediaType::TwoHd {
            13.0
        } else {
            27.0
        };
        self.drq_event = Some(ctx.schedule_usec(EVENT_DRQ, usec, false));
    }

    fn set_hdu(&mut self, ctx: &mut Ctx<'_>, value: u8) {
        self.hdu = value;
        ctx.publish(Upd765Output::Hdu, u32::from(value));
    }

    /// Continue the current command in `phase` after the phase delay.
    fn schedule_phase(&mut self, ctx: &mut Ctx<'_>, phase: FdcPhase) {
        self.event_phase = phase;
        self.phase_event = Some(ctx.schedule_usec(EVENT_PHASE, PHASE_DELAY_USEC, false));
    }

    /// Cancel everything belonging to the command in progress.
    fn stop_transfer(&mut self, ctx: &mut Ctx<'_>) {
        self.phase_event = None;
        self.result7_event = None;
        self.set_drq(ctx, false);
    }

    // -----------------------------------------------------------------------
    // Seek
    // -----------------------------------------------------------------------

    fn seek(&mut self, ctx: &mut Ctx<'_>, drive: usize, track: u8) {
        if drive >= self.disks.len() {
            self.drives[drive].result = (drive as u8) | (ST0_SE | ST0_NR | ST0_AT) as u8;
            self.set_irq(ctx, true);
            return;
        }
        let distance = track.abs_diff(self.drives[drive].track);
        let usec = if distance == 0 {
            SEEK_SAME_TRACK_USEC
        } else {
            f64::from(distance) * STEP_DELAY_USEC[self.step_rate] + SEEK_SETTLE_USEC
        };
        log::debug!("uPD765: drive {drive} seek {} -> {track} ({usec} us)", self.drives[drive].track);
        self.drives[drive].track = track;
        if self.config.wait_seek {
            self.seek_events[drive] = Some(ctx.schedule_usec(EVENT_SEEK + drive as u32, usec, false));
            self.seek_status |= 1 << drive;
        } else {
            self.seek_end(ctx, drive);
        }
    }

    fn seek_end(&mut self, ctx: &mut Ctx<'_>, drive: usize) {
        let mut result = ST0_SE;
        match self.disks.get(drive) {
            None => result |= ST0_NR | ST0_AT,
            Some(disk) if !self.force_ready && !disk.inserted() => {
                result |= ST0_NR;
                if self.config.st0_at_for_seek_not_ready {
                    result |= ST0_AT;
                }
            }
            Some(_) => {}
        }
        self.drives[drive].result = drive as u8 | result as u8;
        self.seek_status &= !(1 << drive);
        self.set_irq(ctx, true);
        if let Some(disk) = self.disks.get_mut(drive) {
            disk.clear_changed();
        }
    }

    // -----------------------------------------------------------------------
    // Phase transitions
    // -----------------------------------------------------------------------

    fn shift_to_idle(&mut self) {
        self.phase = FdcPhase::Idle;
        self.status = MSR_RQM;
    }

    fn shift_to_cmd(&mut self, length: usize) {
        self.phase = FdcPhase::Command;
        self.status = MSR_RQM | MSR_CB;
        self.pos = 0;
        self.count = length;
    }

    fn shift_to_read(&mut self, ctx: &mut Ctx<'_>, length: usize) {
        self.phase = FdcPhase::Read;
        self.status = MSR_RQM | MSR_DIO | MSR_NDM | MSR_CB;
        self.pos = 0;
        self.count = length;
        self.set_drq(ctx, true);
    }

    fn shift_to_write(&mut self, ctx: &mut Ctx<'_>, length: usize) {
        self.phase = FdcPhase::Write;
        self.status = MSR_RQM | MSR_NDM | MSR_CB;
        self.pos = 0;
        self.count = length;
        self.set_drq(ctx, true);
    }

    fn shift_to_scan(&mut self, ctx: &mut Ctx<'_>, length: usize) {
        self.phase = FdcPhase::Scan;
        self.status = MSR_RQM | MSR_NDM | MSR_CB;
        self.result = ST2_SH;
        self.pos = 0;
        self.count = length;
        self.set_drq(ctx, true);
    }

    fn shift_to_result(&mut self, length: usize) {
        self.phase = FdcPhase::Result;
        self.status = MSR_RQM | MSR_CB | MSR_DIO;
        self.pos = 0;
        self.count = length;
    }

    fn shift_to_result7(&mut self, ctx: &mut Ctx<'_>) {
        if self.config.wait_result7 {
            self.result7_event = Some(ctx.schedule_usec(EVENT_RESULT7, RESULT7_DELAY_USEC, false));
        } else {
            self.post_result7(ctx);
        }
    }

    fn post_result7(&mut self, ctx: &mut Ctx<'_>) {
        if self.config.mask_en_or {
            self.result &= !(ST1_EN | ST1_OR);
        }
        log::debug!("uPD765: result {:#08X} C={} H={} R={} N={}", self.result, self.id[0], self.id[1], self.id[2], self.id[3]);
        self.buffer[0] = (self.result & 0xF8) as u8 | (self.hdue & 7);
        self.buffer[1] = (self.result >> 8) as u8;
        self.buffer[2] = (self.result >> 16) as u8;
        self.buffer[3..7].copy_from_slice(&self.id);
        self.set_irq(ctx, true);
        self.shift_to_result(7);
    }
}

impl Component for Upd765 {
    fn initialize(&mut self, ctx: &mut Ctx<'_>) {
        self.shift_to_idle();
        self.set_irq(ctx, false);
        self.set_drq(ctx, false);
        self.set_hdu(ctx, 0);
        if ctx.is_connected(Upd765Output::Index) {
            self.index_count = 0;
            self.index_event = Some(ctx.schedule_usec(EVENT_INDEX, INDEX_PERIOD_USEC, true));
        }
    }

    fn reset(&mut self, ctx: &mut Ctx<'_>) {
        self.shift_to_idle();
        self.phase_event = None;
        self.result7_event = None;
        self.seek_events = Default::default();
        self.seek_status = 0;
        self.set_irq(ctx, false);
        self.set_drq(ctx, false);
    }

    fn release(&mut self, _ctx: &mut Ctx<'_>) {
        for disk in &mut self.disks {
            disk.close();
        }
    }

    fn read_io8(&mut self, ctx: &mut Ctx<'_>, addr: u32) -> u8 {
        self.read_register(ctx, addr)
    }

    fn write_io8(&mut self, ctx: &mut Ctx<'_>, addr: u32, data: u8) {
        self.write_register(ctx, addr, data);
    }

    fn read_dma_io8(&mut self, ctx: &mut Ctx<'_>, _addr: u32) -> u8 {
        self.read_register(ctx, 1)
    }

    fn write_dma_io8(&mut self, ctx: &mut Ctx<'_>, _addr: u32, data: u8) {
        self.write_register(ctx, 1, data);
    }

    fn event_callback(&mut self, ctx: &mut Ctx<'_>, tag: u32, _late: u64) {
        match tag {
            EVENT_PHASE => {
                self.phase_event = None;
                self.phase = self.event_phase;
                self.process_cmd(ctx);
            }
            EVENT_DRQ => {
                self.drq_event = None;
                self.status |= MSR_RQM;
                self.set_drq(ctx, true);
            }
            EVENT_LOST => {
                log::debug!("uPD765: data lost in {:?}", self.phase);
                self.lost_event = None;
                self.result = ST1_OR;
                self.set_drq(ctx, false);
                self.shift_to_result7(ctx);
            }
            EVENT_RESULT7 => {
                self.result7_event = None;
                self.post_result7(ctx);
            }
            EVENT_INDEX => {
                let drive = usize::from(self.hdu & DRIVE_MASK);
                let level = if self.disk_inserted(drive) {
                    self.index_count = self.index_count.wrapping_add(1);
                    if self.index_count == 0 { HIGH } else { 0 }
                } else {
                    0
                };
                ctx.publish(Upd765Output::Index, level);
            }
            _ if (EVENT_SEEK..EVENT_SEEK + MAX_DRIVES as u32).contains(&tag) => {
                let drive = (tag - EVENT_SEEK) as usize;
                self.seek_events[drive] = None;
                self.seek_end(ctx, drive);
            }
            _ => {}
        }
    }
}

impl SignalInput for Upd765 {
    type Signal = Upd765Signal;

    fn write_signal(&mut self, ctx: &mut Ctx<'_>, signal: Upd765Signal, data: u32, mask: u32) {
        let level = data & mask != 0;
        match signal {
            Upd765Signal::Reset => {
                if !self.reset_signal && level {
                    log::debug!("uPD765: reset");
                    self.reset(ctx);
                }
                self.reset_signal = level;
            }
            Upd765Signal::TerminalCount => {
                let in_transfer = matches!(self.phase, FdcPhase::Read | FdcPhase::Write | FdcPhase::Scan)
                    || (self.phase == FdcPhase::Result && self.count == 7);
                if level && in_transfer && Command::from_byte(self.command).accepts_terminal_count() {
                    log::debug!("uPD765: terminal count in {:?}", self.phase);
                    self.prev_phase = self.phase;
                    self.phase = FdcPhase::Tc;
                    self.process_cmd(ctx);
                }
            }
            Upd765Signal::Motor => self.motor = level,
            Upd765Signal::MotorNeg => self.motor = !level,
            Upd765Signal::IrqMask => {
                self.irq_masked = level;
                ctx.publish(Upd765Output::Irq, if self.irq() { HIGH } else { 0 });
            }
            Upd765Signal::DrqMask => {
                self.drq_masked = level;
                ctx.publish(Upd765Output::Drq, if self.drq() { HIGH } else { 0 });
            }
            Upd765Signal::ForceReady => self.force_ready = level,
        }
    }
}

impl SignalOutput for Upd765 {
    type Output = Upd765Output;
}

impl Observable for Upd765 {
    fn query(&self, path: &str) -> Option<Value> {
        match path {
            "phase" => Some(format!("{:?}", self.phase).into()),
            "msr" => Some(self.status().into()),
            "command" => Some(self.command.into()),
            "hdu" => Some(self.hdu.into()),
            "irq" => Some(self.irq().into()),
            "drq" => Some(self.drq().into()),
            "motor" => Some(self.motor.into()),
            "step_rate" => Some((self.step_rate as u8).into()),
            _ => {
                let (drive, field) = path.strip_prefix("drive")?.split_once('.')?;
                let drive: usize = drive.parse().ok()?;
                match field {
                    "track" => self.track(drive).map(Value::from),
                    "inserted" => Some(self.disk_inserted(drive).into()),
                    "protected" => self.disk(drive).map(|d| d.write_protected.into()),
                    _ => None,
                }
            }
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &[
            "phase",
            "msr",
            "command",
            "hdu",
            "irq",
            "drq",
            "motor",
            "step_rate",
            "drive0.track",
            "drive0.inserted",
            "drive0.protected",
            "drive1.track",
            "drive1.inserted",
            "drive1.protected",
            "drive2.track",
            "drive2.inserted",
            "drive2.protected",
            "drive3.track",
            "drive3.inserted",
            "drive3.protected",
        ]
    }
}
