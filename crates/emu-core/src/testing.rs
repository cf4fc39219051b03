//! Stand-in components for tests.
//!
//! Only compiled with the `test-utils` feature. None of these model real
//! hardware; they exist so kernel behaviour and chip crates can be
//! exercised without a CPU core.

use std::cell::RefCell;
use std::rc::Rc;

use crate::component::{Component, VLine};
use crate::machine::Ctx;
use crate::scheduler::{EventHandle, FrameTiming};
use crate::signal::{OutputPin, SignalInput, SignalOutput};

/// Generic signal lines of a [`Recorder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    A,
    B,
    C,
    D,
}

impl OutputPin for Line {
    fn index(self) -> u8 {
        self as u8
    }
}

/// Something a [`Recorder`] saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Initialized,
    Reset,
    Released,
    Event { tag: u32, at: u64, late: u64 },
    Signal { line: Line, data: u32, mask: u32, at: u64 },
    PreFrame { at: u64 },
    Frame { at: u64 },
    VLine { index: u32, at: u64 },
    Timing { lines: u32 },
    IoWrite { addr: u32, data: u8 },
}

/// Records shared between several recorders, to check global ordering.
pub type Journal = Rc<RefCell<Vec<(&'static str, Record)>>>;

/// A component that records every hook it receives.
#[derive(Default)]
pub struct Recorder {
    name: &'static str,
    pub records: Vec<Record>,
    journal: Option<Journal>,
    handles: Vec<(u32, EventHandle)>,
    cancel_on_fire: Vec<(u32, u32)>,
    frame_hooks: bool,
    vline_hooks: bool,
    relay: Option<Line>,
    sample: i32,
    levels: [u32; 4],
    ports: [u8; 16],
}

impl Recorder {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_journal(mut self, journal: &Journal) -> Self {
        self.journal = Some(Rc::clone(journal));
        self
    }

    #[must_use]
    pub fn with_frame_hooks(mut self) -> Self {
        self.frame_hooks = true;
        self
    }

    #[must_use]
    pub fn with_vline_hooks(mut self) -> Self {
        self.vline_hooks = true;
        self
    }

    /// Re-publish every received signal on `line`.
    #[must_use]
    pub fn relaying(mut self, line: Line) -> Self {
        self.relay = Some(line);
        self
    }

    /// Contribute `sample` to both channels when mixed.
    #[must_use]
    pub fn with_sample(mut self, sample: i32) -> Self {
        self.sample = sample;
        self
    }

    pub fn schedule(&mut self, ctx: &mut Ctx<'_>, tag: u32, clocks: u64, periodic: bool) {
        let handle = ctx.schedule_clocks(tag, clocks, periodic);
        self.handles.push((tag, handle));
    }

    pub fn schedule_usec(&mut self, ctx: &mut Ctx<'_>, tag: u32, usec: f64, periodic: bool) {
        let handle = ctx.schedule_usec(tag, usec, periodic);
        self.handles.push((tag, handle));
    }

    /// Cancel every callback registered with `tag`.
    pub fn cancel(&mut self, tag: u32) {
        for (_, handle) in self.handles.iter_mut().filter(|(t, _)| *t == tag) {
            handle.cancel();
        }
    }

    /// When `fired` comes due, cancel `victim` from inside the callback.
    pub fn cancel_when_fired(&mut self, fired: u32, victim: u32) {
        self.cancel_on_fire.push((fired, victim));
    }

    pub fn publish(&self, ctx: &mut Ctx<'_>, line: Line, value: u32) {
        ctx.publish(line, value);
    }

    /// Tags of fired callbacks, in firing order.
    #[must_use]
    pub fn fired(&self) -> Vec<u32> {
        self.records
            .iter()
            .filter_map(|r| match r {
                Record::Event { tag, .. } => Some(*tag),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn level(&self, line: Line) -> u32 {
        self.levels[line as usize]
    }

    fn record(&mut self, record: Record) {
        if let Some(journal) = &self.journal {
            journal.borrow_mut().push((self.name, record.clone()));
        }
        self.records.push(record);
    }
}

impl Component for Recorder {
    fn initialize(&mut self, ctx: &mut Ctx<'_>) {
        if self.frame_hooks {
            ctx.register_frame_event();
        }
        if self.vline_hooks {
            ctx.register_vline_event();
        }
        self.record(Record::Initialized);
    }

    fn reset(&mut self, _ctx: &mut Ctx<'_>) {
        self.record(Record::Reset);
    }

    fn release(&mut self, _ctx: &mut Ctx<'_>) {
        self.record(Record::Released);
    }

    fn read_io8(&mut self, _ctx: &mut Ctx<'_>, addr: u32) -> u8 {
        self.ports[(addr & 0x0F) as usize]
    }

    fn write_io8(&mut self, _ctx: &mut Ctx<'_>, addr: u32, data: u8) {
        self.ports[(addr & 0x0F) as usize] = data;
        self.record(Record::IoWrite { addr, data });
    }

    fn event_callback(&mut self, ctx: &mut Ctx<'_>, tag: u32, late: u64) {
        self.record(Record::Event {
            tag,
            at: ctx.now().get(),
            late,
        });
        let victims: Vec<u32> = self
            .cancel_on_fire
            .iter()
            .filter(|(fired, _)| *fired == tag)
            .map(|(_, victim)| *victim)
            .collect();
        for victim in victims {
            self.cancel(victim);
        }
    }

    fn event_pre_frame(&mut self, ctx: &mut Ctx<'_>) {
        self.record(Record::PreFrame { at: ctx.now().get() });
    }

    fn event_frame(&mut self, ctx: &mut Ctx<'_>) {
        self.record(Record::Frame { at: ctx.now().get() });
    }

    fn event_vline(&mut self, ctx: &mut Ctx<'_>, line: VLine) {
        self.record(Record::VLine {
            index: line.index,
            at: ctx.now().get(),
        });
    }

    fn update_timing(&mut self, _ctx: &mut Ctx<'_>, timing: &FrameTiming) {
        self.record(Record::Timing {
            lines: timing.lines_per_frame,
        });
    }

    fn mix(&mut self, buffer: &mut [i32]) {
        for sample in buffer.iter_mut() {
            *sample += self.sample;
        }
    }
}

impl SignalInput for Recorder {
    type Signal = Line;

    fn write_signal(&mut self, ctx: &mut Ctx<'_>, line: Line, data: u32, mask: u32) {
        let level = &mut self.levels[line as usize];
        *level = (*level & !mask) | (data & mask);
        self.record(Record::Signal {
            line,
            data,
            mask,
            at: ctx.now().get(),
        });
        if let Some(relay) = self.relay {
            ctx.publish(relay, data & mask);
        }
    }
}

impl SignalOutput for Recorder {
    type Output = Line;
}

/// A CPU stand-in that burns clocks in fixed steps.
pub struct ScriptedCpu {
    step: u64,
    idle: bool,
    poll_port: Option<u32>,
    /// `(clock at entry, budget)` for every `run` call.
    pub runs: Vec<(u64, u64)>,
    /// Bytes read while polling.
    pub polled: Vec<u8>,
    /// Level of interrupt line 0.
    pub irq: bool,
}

impl ScriptedCpu {
    /// Consume `step` clocks per "instruction", overshooting budgets that
    /// are not a multiple of it.
    #[must_use]
    pub fn new(step: u64) -> Self {
        Self {
            step: step.max(1),
            idle: false,
            poll_port: None,
            runs: Vec::new(),
            polled: Vec::new(),
            irq: false,
        }
    }

    /// Report zero clocks consumed, like a halted CPU.
    #[must_use]
    pub fn idle() -> Self {
        Self {
            idle: true,
            ..Self::new(1)
        }
    }

    /// Read `port` once per instruction; its wait cycles are charged.
    #[must_use]
    pub fn polling(mut self, port: u32) -> Self {
        self.poll_port = Some(port);
        self
    }
}

impl Component for ScriptedCpu {
    fn run(&mut self, ctx: &mut Ctx<'_>, budget: u64) -> u64 {
        self.runs.push((ctx.now().get(), budget));
        if self.idle {
            return 0;
        }
        let mut consumed = 0;
        while consumed < budget {
            consumed += self.step;
            if let Some(port) = self.poll_port {
                let result = ctx.io_read(port);
                consumed += u64::from(result.wait);
                self.polled.push(result.data);
            }
        }
        consumed
    }

    fn set_intr_line(&mut self, line: bool, _pending: bool, _bit: u32) {
        self.irq = line;
    }
}

/// Signals accepted by a [`DmaChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaSignal {
    /// Data request from the device.
    Request,
}

/// Outputs of a [`DmaChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaOutput {
    /// Pulsed after the programmed byte count.
    TerminalCount,
}

impl OutputPin for DmaOutput {
    fn index(self) -> u8 {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Read bytes from the device port into the buffer.
    FromDevice,
    /// Write bytes from the buffer to the device port.
    ToDevice,
}

/// A single-channel DMA engine serving one I/O port.
///
/// A rising request is serviced on the next scheduler pass, one byte per
/// request, through the DMA bus entry points.
pub struct DmaChannel {
    port: u32,
    direction: DmaDirection,
    count: Option<usize>,
    request: bool,
    service: Option<EventHandle>,
    cursor: usize,
    pub buffer: Vec<u8>,
    pub transfers: usize,
}

impl DmaChannel {
    #[must_use]
    pub fn new(port: u32, direction: DmaDirection) -> Self {
        Self {
            port,
            direction,
            count: None,
            request: false,
            service: None,
            cursor: 0,
            buffer: Vec::new(),
            transfers: 0,
        }
    }

    /// Pulse terminal count after `count` bytes.
    #[must_use]
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Source bytes for [`DmaDirection::ToDevice`].
    #[must_use]
    pub fn with_source(mut self, data: Vec<u8>) -> Self {
        self.buffer = data;
        self
    }
}

impl Component for DmaChannel {
    fn event_callback(&mut self, ctx: &mut Ctx<'_>, _tag: u32, _late: u64) {
        self.service = None;
        if !self.request {
            return;
        }
        match self.direction {
            DmaDirection::FromDevice => {
                let data = ctx.dma_io_read(self.port);
                self.buffer.push(data);
            }
            DmaDirection::ToDevice => {
                let data = self.buffer.get(self.cursor).copied().unwrap_or(0);
                self.cursor += 1;
                ctx.dma_io_write(self.port, data);
            }
        }
        self.transfers += 1;
        if self.count == Some(self.transfers) {
            ctx.publish(DmaOutput::TerminalCount, 1);
            ctx.publish(DmaOutput::TerminalCount, 0);
        }
    }
}

impl SignalInput for DmaChannel {
    type Signal = DmaSignal;

    fn write_signal(&mut self, ctx: &mut Ctx<'_>, _signal: DmaSignal, data: u32, mask: u32) {
        self.request = data & mask != 0;
        if self.request && self.service.is_none() {
            self.service = Some(ctx.schedule_clocks(0, 0, false));
        }
    }
}

impl SignalOutput for DmaChannel {
    type Output = DmaOutput;
}
