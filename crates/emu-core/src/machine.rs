//! The component registry and the frame driver.
//!
//! A [`Machine`] owns every component in a slot, indexed by
//! [`ComponentId`] in creation order. While a component runs one of its
//! hooks it is taken out of its slot and handed a [`Ctx`], through which
//! it reaches the rest of the machine: buses, signals, the scheduler.
//!
//! Taking the component out makes re-entrancy explicit. A signal
//! addressed to a component that is already on the call stack is queued
//! on its slot and delivered as soon as its current hook returns; a bus
//! access to such a component sees open bus.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::bus::{OPEN_BUS, ReadResult};
use crate::clock::MasterClock;
use crate::component::{Component, ComponentId, Handle, Lifecycle, VLine};
use crate::config::MachineConfig;
use crate::error::EmuError;
use crate::io_map::{IoMap, Target};
use crate::observable::{Observable, Value};
use crate::scheduler::{EventHandle, FrameTiming, Scheduler};
use crate::signal::{OutputPin, SignalInput, SignalOutput, SignalTable, SignalTableBuilder, Subscription};
use crate::sound::{SoundBuffer, SoundChunk};
use crate::ticks::Ticks;

type Deferred = Box<dyn FnOnce(&mut dyn Component, &mut Ctx<'_>)>;

/// Id used when the host, not a component, touches the machine.
const HOST: ComponentId = ComponentId(u32::MAX);

struct Slot {
    name: String,
    device: Option<Box<dyn Component>>,
    lifecycle: Lifecycle,
    deferred: VecDeque<Deferred>,
}

struct Core {
    scheduler: Scheduler,
    signals: SignalTable,
    io: IoMap,
    cpu: Option<ComponentId>,
    memory: Option<ComponentId>,
    frame_hooks: Vec<ComponentId>,
    vline_hooks: Vec<ComponentId>,
    sound_sources: Vec<ComponentId>,
    sound: Option<SoundBuffer>,
}

/// Run `f` on component `id` with a context for it.
///
/// Returns `None` if the component does not exist or is already on the
/// call stack.
fn invoke<R>(
    slots: &mut Vec<Slot>,
    core: &mut Core,
    id: ComponentId,
    f: impl FnOnce(&mut dyn Component, &mut Ctx<'_>) -> R,
) -> Option<R> {
    let mut device = slots.get_mut(id.index())?.device.take()?;
    let result = f(
        device.as_mut(),
        &mut Ctx {
            slots: &mut *slots,
            core: &mut *core,
            current: id,
        },
    );
    slots[id.index()].device = Some(device);

    // Anything that arrived while the component was busy.
    while let Some(job) = slots[id.index()].deferred.pop_front() {
        invoke(slots, core, id, job);
    }
    Some(result)
}

/// A component's view of the machine while one of its hooks runs.
pub struct Ctx<'m> {
    slots: &'m mut Vec<Slot>,
    core: &'m mut Core,
    current: ComponentId,
}

impl Ctx<'_> {
    /// The component this context was handed to.
    #[must_use]
    pub fn current(&self) -> ComponentId {
        self.current
    }

    #[must_use]
    pub fn now(&self) -> Ticks {
        self.core.scheduler.now()
    }

    #[must_use]
    pub fn clock(&self) -> MasterClock {
        self.core.scheduler.clock()
    }

    #[must_use]
    pub fn timing(&self) -> FrameTiming {
        self.core.scheduler.timing()
    }

    // Scheduler

    /// Call back this component with `tag` after `clocks` CPU clocks.
    pub fn schedule_clocks(&mut self, tag: u32, clocks: u64, periodic: bool) -> EventHandle {
        self.core.scheduler.register(self.current, tag, clocks, periodic)
    }

    /// Call back this component with `tag` after `usec` microseconds.
    pub fn schedule_usec(&mut self, tag: u32, usec: f64, periodic: bool) -> EventHandle {
        let clocks = self.core.scheduler.usec_to_clocks(usec);
        self.core.scheduler.register(self.current, tag, clocks, periodic)
    }

    /// Receive `event_pre_frame` and `event_frame` every frame.
    pub fn register_frame_event(&mut self) {
        if !self.core.frame_hooks.contains(&self.current) {
            self.core.frame_hooks.push(self.current);
        }
    }

    /// Receive `event_vline` at every scanline start.
    pub fn register_vline_event(&mut self) {
        if !self.core.vline_hooks.contains(&self.current) {
            self.core.vline_hooks.push(self.current);
        }
    }

    /// Change the frame rate from the next frame on.
    pub fn set_frames_per_sec(&mut self, frames_per_sec: f64) {
        if frames_per_sec.is_finite() && frames_per_sec > 0.0 {
            let mut timing = self.core.scheduler.current_or_pending_timing();
            timing.frames_per_sec = frames_per_sec;
            self.core.scheduler.request_timing(timing);
        } else {
            log::warn!("{}: ignoring frame rate {frames_per_sec}", self.current);
        }
    }

    /// Change the number of scanlines from the next frame on.
    pub fn set_lines_per_frame(&mut self, lines: u32) {
        if lines == 0 {
            log::warn!("{}: ignoring zero lines per frame", self.current);
            return;
        }
        let mut timing = self.core.scheduler.current_or_pending_timing();
        timing.lines_per_frame = lines;
        self.core.scheduler.request_timing(timing);
    }

    // Signals

    /// Drive output `pin` of this component to `value`.
    pub fn publish<P: OutputPin>(&mut self, pin: P, value: u32) {
        let Some(subscribers) = self.core.signals.subscribers(self.current, pin.index()) else {
            return;
        };
        for subscription in subscribers.iter() {
            let target = subscription.target;
            let delivered = invoke(self.slots, self.core, target, |device, ctx| {
                subscription.deliver(device, ctx, value);
            });
            if delivered.is_none() {
                log::trace!("deferring {subscription:?} = {value:#X}");
                let subscription: Rc<Subscription> = Rc::clone(subscription);
                self.defer(
                    target,
                    Box::new(move |device: &mut dyn Component, ctx: &mut Ctx<'_>| {
                        subscription.deliver(device, ctx, value);
                    }),
                );
            }
        }
    }

    /// Whether anything listens to `pin`.
    #[must_use]
    pub fn is_connected<P: OutputPin>(&self, pin: P) -> bool {
        self.core.signals.is_connected(self.current, pin.index())
    }

    /// Drive an interrupt line of `target` (normally the CPU).
    pub fn set_intr_line<T: Component>(&mut self, target: Handle<T>, line: bool, pending: bool, bit: u32) {
        let id = target.id();
        let delivered = invoke(self.slots, self.core, id, |device, _| {
            device.set_intr_line(line, pending, bit);
        });
        if delivered.is_none() {
            self.defer(
                id,
                Box::new(move |device: &mut dyn Component, _: &mut Ctx<'_>| {
                    device.set_intr_line(line, pending, bit);
                }),
            );
        }
    }

    /// Call another component directly. `None` if it is busy.
    pub fn with<T: Component, R>(&mut self, handle: Handle<T>, f: impl FnOnce(&mut T, &mut Ctx<'_>) -> R) -> Option<R> {
        invoke(self.slots, self.core, handle.id(), |device, ctx| {
            device.as_any_mut().downcast_mut::<T>().map(|typed| f(typed, ctx))
        })
        .flatten()
    }

    // I/O bus

    pub fn io_read(&mut self, addr: u32) -> ReadResult {
        let entry = self.core.io.read_entry(addr);
        let data = match entry.target {
            Target::Open => OPEN_BUS,
            Target::Value(value) => value,
            Target::Device(id) => self
                .dispatch(id, |device, ctx| device.read_io8(ctx, entry.addr))
                .unwrap_or(OPEN_BUS),
        };
        ReadResult::with_wait(data, entry.wait)
    }

    /// Write an I/O port. Returns the wait cycles to charge.
    pub fn io_write(&mut self, addr: u32, data: u8) -> u8 {
        let entry = self.core.io.write_entry(addr);
        if let Target::Device(id) = entry.target {
            self.dispatch(id, |device, ctx| device.write_io8(ctx, entry.addr, data));
        }
        entry.wait
    }

    /// DMA read of an I/O port. Never charges wait cycles.
    pub fn dma_io_read(&mut self, addr: u32) -> u8 {
        let entry = self.core.io.read_entry(addr);
        match entry.target {
            Target::Open => OPEN_BUS,
            Target::Value(value) => value,
            Target::Device(id) => self
                .dispatch(id, |device, ctx| device.read_dma_io8(ctx, entry.addr))
                .unwrap_or(OPEN_BUS),
        }
    }

    pub fn dma_io_write(&mut self, addr: u32, data: u8) {
        let entry = self.core.io.write_entry(addr);
        if let Target::Device(id) = entry.target {
            self.dispatch(id, |device, ctx| device.write_dma_io8(ctx, entry.addr, data));
        }
    }

    // Data bus

    pub fn mem_read(&mut self, addr: u32) -> ReadResult {
        match self.core.memory {
            Some(id) => self
                .dispatch(id, |device, ctx| device.read_data8w(ctx, addr))
                .unwrap_or(ReadResult::new(OPEN_BUS)),
            None => ReadResult::new(OPEN_BUS),
        }
    }

    pub fn mem_write(&mut self, addr: u32, data: u8) -> u8 {
        match self.core.memory {
            Some(id) => self
                .dispatch(id, |device, ctx| device.write_data8w(ctx, addr, data))
                .unwrap_or(0),
            None => 0,
        }
    }

    pub fn dma_mem_read(&mut self, addr: u32) -> u8 {
        match self.core.memory {
            Some(id) => self
                .dispatch(id, |device, ctx| device.read_dma_data8(ctx, addr))
                .unwrap_or(OPEN_BUS),
            None => OPEN_BUS,
        }
    }

    pub fn dma_mem_write(&mut self, addr: u32, data: u8) {
        if let Some(id) = self.core.memory {
            self.dispatch(id, |device, ctx| device.write_dma_data8(ctx, addr, data));
        }
    }

    fn dispatch<R>(&mut self, id: ComponentId, f: impl FnOnce(&mut dyn Component, &mut Ctx<'_>) -> R) -> Option<R> {
        let result = invoke(self.slots, self.core, id, f);
        if result.is_none() {
            log::warn!("{} accessed {id} while it is busy; open bus", self.current);
        }
        result
    }

    fn defer(&mut self, target: ComponentId, job: Deferred) {
        if let Some(slot) = self.slots.get_mut(target.index()) {
            slot.deferred.push_back(job);
        }
    }
}

/// Wiring stage of a machine.
///
/// Components are added, connected and mapped here. [`Self::build`]
/// freezes the wiring and initializes every component in creation order.
pub struct MachineBuilder {
    config: MachineConfig,
    slots: Vec<Slot>,
    signals: SignalTableBuilder,
    io: IoMap,
    cpu: Option<ComponentId>,
    memory: Option<ComponentId>,
    sound_sources: Vec<ComponentId>,
}

impl MachineBuilder {
    pub fn new(config: MachineConfig) -> Result<Self, EmuError> {
        config.validate()?;
        Ok(Self {
            io: IoMap::new(config.io_addr_bits),
            config,
            slots: Vec::new(),
            signals: SignalTableBuilder::default(),
            cpu: None,
            memory: None,
            sound_sources: Vec::new(),
        })
    }

    pub fn add<T: Component>(&mut self, name: &str, component: T) -> Handle<T> {
        let id = ComponentId(self.slots.len() as u32);
        self.slots.push(Slot {
            name: name.to_string(),
            device: Some(Box::new(component)),
            lifecycle: Lifecycle::Uninitialized,
            deferred: VecDeque::new(),
        });
        log::debug!("added {name} as {id}");
        Handle::new(id)
    }

    /// Subscribe `to`'s `signal` to `from`'s output `pin`, masked by `mask`.
    pub fn connect<P: SignalOutput, C: SignalInput>(
        &mut self,
        from: Handle<P>,
        pin: P::Output,
        to: Handle<C>,
        signal: C::Signal,
        mask: u32,
    ) -> &mut Self {
        self.signals.subscribe::<C>(from.id(), pin, to.id(), signal, mask);
        self
    }

    pub fn io(&mut self) -> &mut IoMap {
        &mut self.io
    }

    /// The component driven by [`Machine::drive`]'s run loop.
    pub fn set_cpu<T: Component>(&mut self, cpu: Handle<T>) -> &mut Self {
        self.cpu = Some(cpu.id());
        self
    }

    /// The component answering data bus accesses.
    pub fn set_memory<T: Component>(&mut self, memory: Handle<T>) -> &mut Self {
        self.memory = Some(memory.id());
        self
    }

    pub fn add_sound_source<T: Component>(&mut self, source: Handle<T>) -> &mut Self {
        self.sound_sources.push(source.id());
        self
    }

    #[must_use]
    pub fn build(self) -> Machine {
        let mut machine = Machine {
            frame_boundary: 0,
            frame_count: 0,
            released: false,
            core: Core {
                scheduler: Scheduler::new(self.config.clock(), self.config.timing()),
                signals: self.signals.freeze(),
                io: self.io,
                cpu: self.cpu,
                memory: self.memory,
                frame_hooks: Vec::new(),
                vline_hooks: Vec::new(),
                sound_sources: self.sound_sources,
                sound: None,
            },
            slots: self.slots,
            config: self.config,
        };
        for index in 0..machine.slots.len() {
            let id = ComponentId(index as u32);
            invoke(&mut machine.slots, &mut machine.core, id, |device, ctx| device.initialize(ctx));
            machine.slots[index].lifecycle = Lifecycle::Initialized;
        }
        log::debug!("machine built with {} components", machine.slots.len());
        machine
    }
}

/// A wired, running machine.
pub struct Machine {
    config: MachineConfig,
    slots: Vec<Slot>,
    core: Core,
    /// Ideal clock at which the next frame starts.
    frame_boundary: u64,
    frame_count: u64,
    released: bool,
}

impl Machine {
    #[must_use]
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    #[must_use]
    pub fn now(&self) -> Ticks {
        self.core.scheduler.now()
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.core.scheduler
    }

    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    #[must_use]
    pub fn component_count(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn name(&self, id: impl Into<ComponentId>) -> Option<&str> {
        self.slots.get(id.into().index()).map(|slot| slot.name.as_str())
    }

    #[must_use]
    pub fn lifecycle(&self, id: impl Into<ComponentId>) -> Option<Lifecycle> {
        self.slots.get(id.into().index()).map(|slot| slot.lifecycle)
    }

    /// Borrow a component.
    #[must_use]
    pub fn get<T: Component>(&self, handle: Handle<T>) -> Option<&T> {
        self.slots
            .get(handle.id().index())?
            .device
            .as_deref()?
            .as_any()
            .downcast_ref::<T>()
    }

    /// Borrow a component mutably, without a context.
    pub fn get_mut<T: Component>(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.slots
            .get_mut(handle.id().index())?
            .device
            .as_deref_mut()?
            .as_any_mut()
            .downcast_mut::<T>()
    }

    /// Run `f` on a component with a context, as if from one of its hooks.
    pub fn with<T: Component, R>(&mut self, handle: Handle<T>, f: impl FnOnce(&mut T, &mut Ctx<'_>) -> R) -> Option<R> {
        invoke(&mut self.slots, &mut self.core, handle.id(), |device, ctx| {
            device.as_any_mut().downcast_mut::<T>().map(|typed| f(typed, ctx))
        })
        .flatten()
    }

    /// Reset every component in creation order.
    pub fn reset(&mut self) {
        log::debug!("machine reset at {}", self.now());
        for index in 0..self.slots.len() {
            let id = ComponentId(index as u32);
            invoke(&mut self.slots, &mut self.core, id, |device, ctx| device.reset(ctx));
            self.slots[index].lifecycle = Lifecycle::Reset;
        }
    }

    /// Run exactly one video frame.
    pub fn drive(&mut self) {
        let frame_hooks = self.core.frame_hooks.clone();
        for &id in &frame_hooks {
            invoke(&mut self.slots, &mut self.core, id, |device, ctx| device.event_pre_frame(ctx));
        }

        if let Some(timing) = self.core.scheduler.apply_timing() {
            log::debug!(
                "frame timing now {} fps, {} lines",
                timing.frames_per_sec,
                timing.lines_per_frame
            );
            for index in 0..self.slots.len() {
                let id = ComponentId(index as u32);
                invoke(&mut self.slots, &mut self.core, id, |device, ctx| {
                    device.update_timing(ctx, &timing);
                });
            }
        }

        let frame_clocks = self.core.scheduler.next_frame_clocks();
        let now = self.now().get();
        // Small CPU overshoot is carried; a host that ran time outside the
        // frame structure starts a fresh frame where it left off.
        if now.saturating_sub(self.frame_boundary) >= frame_clocks || now < self.frame_boundary {
            self.frame_boundary = now;
        }
        let frame_start = self.frame_boundary;
        self.frame_boundary += frame_clocks;

        for &id in &frame_hooks {
            invoke(&mut self.slots, &mut self.core, id, |device, ctx| device.event_frame(ctx));
        }

        let vline_hooks = self.core.vline_hooks.clone();
        let lines = u64::from(self.core.scheduler.timing().lines_per_frame.max(1));
        for v in 0..lines {
            let offset = frame_clocks * v / lines;
            let end = frame_clocks * (v + 1) / lines;
            let line = VLine {
                index: v as u32,
                offset,
                clocks: end - offset,
            };
            for &id in &vline_hooks {
                invoke(&mut self.slots, &mut self.core, id, |device, ctx| device.event_vline(ctx, line));
            }
            self.run_until(frame_start + end);
            self.update_sound(frame_start + end);
        }
        self.frame_count += 1;
    }

    /// Advance time by `clocks` without frame or scanline hooks.
    pub fn run_clocks(&mut self, clocks: u64) {
        let end = self.now().get() + clocks;
        self.run_until(end);
        self.update_sound(end);
    }

    pub fn run_usec(&mut self, usec: f64) {
        let clocks = self.core.scheduler.usec_to_clocks(usec);
        self.run_clocks(clocks);
    }

    /// Start producing `samples`-sample stereo chunks at `rate` Hz.
    ///
    /// A zero rate or chunk size disables sound output.
    pub fn initialize_sound(&mut self, rate: u32, samples: usize) {
        self.core.sound = SoundBuffer::new(rate, samples, self.config.cpu_clock_hz, self.now().get());
        if self.core.sound.is_some() {
            log::debug!("sound output {rate} Hz, {samples} samples per chunk");
        } else {
            log::warn!("sound output disabled: {rate} Hz, {samples} samples per chunk");
        }
    }

    /// Drive one frame and return the next chunk of samples.
    ///
    /// Further frames are driven only while the chunk is still short;
    /// their count is reported in [`SoundChunk::extra_frames`]. Samples
    /// beyond the chunk are kept for the next call. `None` if sound output
    /// is not initialized.
    pub fn create_sound(&mut self) -> Option<SoundChunk> {
        self.core.sound.as_ref()?;
        self.drive();
        let mut extra_frames = 0;
        while !self.core.sound.as_ref()?.is_full() {
            self.drive();
            extra_frames += 1;
        }
        let sound = self.core.sound.as_mut()?;
        log::trace!("sound chunk of {} samples, {extra_frames} extra frames", sound.chunk_samples());
        Some(SoundChunk {
            samples: sound.take(),
            extra_frames,
        })
    }

    // Host-side bus access, as an external bus master would see it.

    pub fn io_read(&mut self, addr: u32) -> ReadResult {
        self.host_ctx().io_read(addr)
    }

    pub fn io_write(&mut self, addr: u32, data: u8) -> u8 {
        self.host_ctx().io_write(addr, data)
    }

    pub fn dma_io_read(&mut self, addr: u32) -> u8 {
        self.host_ctx().dma_io_read(addr)
    }

    pub fn dma_io_write(&mut self, addr: u32, data: u8) {
        self.host_ctx().dma_io_write(addr, data);
    }

    pub fn mem_read(&mut self, addr: u32) -> ReadResult {
        self.host_ctx().mem_read(addr)
    }

    pub fn mem_write(&mut self, addr: u32, data: u8) -> u8 {
        self.host_ctx().mem_write(addr, data)
    }

    /// Release every component in reverse creation order. Also done on drop.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for index in (0..self.slots.len()).rev() {
            let id = ComponentId(index as u32);
            invoke(&mut self.slots, &mut self.core, id, |device, ctx| device.release(ctx));
            let slot = &mut self.slots[index];
            slot.lifecycle = Lifecycle::Released;
            // Dropping the component drops its event handles.
            slot.device = None;
            slot.deferred.clear();
            log::debug!("released {} ({id})", slot.name);
        }
    }

    fn host_ctx(&mut self) -> Ctx<'_> {
        Ctx {
            slots: &mut self.slots,
            core: &mut self.core,
            current: HOST,
        }
    }

    fn run_until(&mut self, end: u64) {
        loop {
            self.fire_due();
            let now = self.now().get();
            if now >= end {
                break;
            }
            let target = self
                .core
                .scheduler
                .next_due()
                .map_or(end, |due| due.min(end));
            let budget = target - now;
            let consumed = match self.core.cpu {
                Some(cpu) => invoke(&mut self.slots, &mut self.core, cpu, |device, ctx| {
                    device.run(ctx, budget)
                })
                .unwrap_or(0),
                None => 0,
            };
            // An idle CPU lets time jump to the next event.
            self.core.scheduler.advance(if consumed == 0 { budget } else { consumed });
        }
    }

    fn fire_due(&mut self) {
        while let Some(fired) = self.core.scheduler.pop_due() {
            let delivered = invoke(&mut self.slots, &mut self.core, fired.owner, |device, ctx| {
                device.event_callback(ctx, fired.tag, fired.late);
            });
            if delivered.is_none() {
                log::warn!("callback {} for {} has no live owner", fired.tag, fired.owner);
            }
        }
    }

    /// Mix the samples owed up to `boundary`. CPU overshoot past the
    /// boundary is accounted at the next one.
    fn update_sound(&mut self, boundary: u64) {
        let Some(count) = self.core.sound.as_ref().map(|sound| sound.due(boundary)) else {
            return;
        };
        if count == 0 {
            return;
        }
        let mut mix = vec![0i32; count * 2];
        for id in self.core.sound_sources.clone() {
            invoke(&mut self.slots, &mut self.core, id, |device, _| device.mix(&mut mix));
        }
        if let Some(sound) = self.core.sound.as_mut() {
            sound.push(&mix);
        }
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.release();
    }
}

impl Observable for Machine {
    fn query(&self, path: &str) -> Option<Value> {
        match path {
            "clock" => Some(self.now().get().into()),
            "frame" => Some(self.frame_count.into()),
            "pending_events" => Some((self.core.scheduler.pending() as u64).into()),
            "components" => Some(Value::Array(
                self.slots.iter().map(|slot| Value::from(slot.name.as_str())).collect(),
            )),
            "lines_per_frame" => Some(self.core.scheduler.timing().lines_per_frame.into()),
            _ => None,
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &["clock", "frame", "pending_events", "components", "lines_per_frame"]
    }
}
