//! Register snapshots.
//!
//! A snapshot holds controller registers only. Disk contents belong to
//! the media and are saved with the image files.

use emu_core::Ctx;
use serde::{Deserialize, Serialize};

use crate::status::MSR_RQM;
use crate::{
    BUFFER_SIZE, EVENT_SEEK, FdcPhase, HIGH, MAX_DRIVES, SEEK_SAME_TRACK_USEC, Upd765, Upd765Output,
};

/// Per-drive registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveState {
    /// Cylinder under the head.
    pub track: u8,
    /// Pending SENSE INTERRUPT STATUS result, 0 if none.
    pub result: u8,
    /// Touched by a transfer since the host last asked.
    pub access: bool,
    /// Rotational position, as a physical sector index.
    pub cursor: usize,
}

/// Serialisable uPD765A register state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upd765State {
    pub phase: FdcPhase,
    pub prev_phase: FdcPhase,
    /// Phase a pending phase callback will switch to, if `phase_pending`.
    pub event_phase: FdcPhase,
    pub phase_pending: bool,
    pub status: u8,
    pub seek_status: u8,
    pub command: u8,
    pub buffer: Vec<u8>,
    pub pos: usize,
    pub count: usize,
    pub result: u32,
    pub hdu: u8,
    pub hdue: u8,
    pub id: [u8; 4],
    pub eot: u8,
    pub gpl: u8,
    pub dtl: u8,
    pub filler: u8,
    pub step_rate: usize,
    pub sector_index: Option<usize>,
    pub no_dma_mode: bool,
    pub motor: bool,
    pub force_ready: bool,
    pub reset_signal: bool,
    pub irq_masked: bool,
    pub drq_masked: bool,
    pub irq_request: bool,
    pub drives: [DriveState; MAX_DRIVES],
}

impl Upd765 {
    #[must_use]
    pub fn save_state(&self) -> Upd765State {
        Upd765State {
            phase: self.phase,
            prev_phase: self.prev_phase,
            event_phase: self.event_phase,
            phase_pending: self.phase_event.as_ref().is_some_and(|e| e.is_pending()),
            status: self.status,
            seek_status: self.seek_status,
            command: self.command,
            buffer: self.buffer.clone(),
            pos: self.pos,
            count: self.count,
            result: self.result,
            hdu: self.hdu,
            hdue: self.hdue,
            id: self.id,
            eot: self.eot,
            gpl: self.gpl,
            dtl: self.dtl,
            filler: self.filler,
            step_rate: self.step_rate,
            sector_index: self.sector_index,
            no_dma_mode: self.no_dma_mode,
            motor: self.motor,
            force_ready: self.force_ready,
            reset_signal: self.reset_signal,
            irq_masked: self.irq_masked,
            drq_masked: self.drq_masked,
            irq_request: self.irq_request,
            drives: self.drives,
        }
    }

    /// Restore registers and re-arm the callbacks the snapshot implies.
    ///
    /// Pending seeks complete after the same-track settle time; a transfer
    /// in progress gets its data request back.
    pub fn load_state(&mut self, ctx: &mut Ctx<'_>, state: &Upd765State) {
        self.phase_event = None;
        self.drq_event = None;
        self.lost_event = None;
        self.result7_event = None;
        self.seek_events = Default::default();

        self.phase = state.phase;
        self.prev_phase = state.prev_phase;
        self.event_phase = state.event_phase;
        self.status = state.status;
        self.seek_status = state.seek_status;
        self.command = state.command;
        self.buffer.clone_from(&state.buffer);
        self.buffer.resize(BUFFER_SIZE, 0);
        self.pos = state.pos.min(BUFFER_SIZE);
        self.count = state.count.min(BUFFER_SIZE - self.pos);
        self.result = state.result;
        self.hdu = state.hdu;
        self.hdue = state.hdue;
        self.id = state.id;
        self.eot = state.eot;
        self.gpl = state.gpl;
        self.dtl = state.dtl;
        self.filler = state.filler;
        self.step_rate = state.step_rate.min(3);
        self.sector_index = state.sector_index;
        self.no_dma_mode = state.no_dma_mode;
        self.motor = state.motor;
        self.force_ready = state.force_ready;
        self.reset_signal = state.reset_signal;
        self.irq_masked = state.irq_masked;
        self.drq_masked = state.drq_masked;
        self.drives = state.drives;

        if state.phase_pending {
            self.schedule_phase(ctx, state.event_phase);
        }
        for drive in 0..MAX_DRIVES {
            if self.seek_status & (1 << drive) != 0 {
                self.seek_events[drive] =
                    Some(ctx.schedule_usec(EVENT_SEEK + drive as u32, SEEK_SAME_TRACK_USEC, false));
            }
        }

        self.set_hdu(ctx, state.hdu);
        let transferring = matches!(self.phase, FdcPhase::Read | FdcPhase::Write | FdcPhase::Scan);
        if transferring && self.count > 0 {
            if self.status & MSR_RQM != 0 {
                self.set_drq(ctx, true);
            } else {
                self.set_drq(ctx, false);
                self.arm_drq(ctx);
            }
        } else {
            self.set_drq(ctx, false);
        }
        self.irq_request = state.irq_request;
        ctx.publish(Upd765Output::Irq, if self.irq() { HIGH } else { 0 });
        log::debug!("uPD765: state restored in {:?}", self.phase);
    }
}
