//! The component capability interface.
//!
//! A machine is a set of components (CPU, memory, chips) owned by the
//! [`crate::Machine`]. Components never own each other: they hold
//! [`Handle`]s and reach one another only through the [`crate::Ctx`]
//! passed into every hook, which routes bus accesses, signals and
//! scheduler registrations.
//!
//! Every method has a default, so a chip implements only what it has.
//! Reads default to the open-bus value, writes are discarded.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

use crate::bus::{OPEN_BUS, ReadResult};
use crate::machine::Ctx;
use crate::scheduler::FrameTiming;

/// Index of a component in its machine's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentId(pub(crate) u32);

impl ComponentId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Typed, non-owning reference to a component of type `T`.
pub struct Handle<T> {
    id: ComponentId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub(crate) const fn new(id: ComponentId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub const fn id(self) -> ComponentId {
        self.id
    }
}

// Manual impls: derives would require `T: Clone` etc.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.id)
    }
}

impl<T> From<Handle<T>> for ComponentId {
    fn from(handle: Handle<T>) -> Self {
        handle.id
    }
}

/// Where a component is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Initialized,
    Reset,
    Released,
}

/// Scanline boundary passed to [`Component::event_vline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VLine {
    /// Line number within the frame, starting at 0.
    pub index: u32,
    /// Clock offset of the line start from the frame start.
    pub offset: u64,
    /// Length of this line in clocks.
    pub clocks: u64,
}

/// Downcasting support for boxed components.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A simulated chip or subsystem.
#[allow(unused_variables)]
pub trait Component: AsAny {
    /// One-time setup after the machine is wired. Register frame and
    /// scanline hooks and long-lived callbacks here.
    fn initialize(&mut self, ctx: &mut Ctx<'_>) {}

    /// Return to power-on state. Callbacks whose meaning depends on the
    /// old state must be cancelled here.
    fn reset(&mut self, ctx: &mut Ctx<'_>) {}

    /// Final teardown. Called once, in reverse creation order.
    fn release(&mut self, ctx: &mut Ctx<'_>) {}

    // Data bus

    fn read_data8(&mut self, ctx: &mut Ctx<'_>, addr: u32) -> u8 {
        OPEN_BUS
    }

    fn write_data8(&mut self, ctx: &mut Ctx<'_>, addr: u32, data: u8) {}

    /// Data read with wait cycles. Defaults to [`Self::read_data8`] with none.
    fn read_data8w(&mut self, ctx: &mut Ctx<'_>, addr: u32) -> ReadResult {
        ReadResult::new(self.read_data8(ctx, addr))
    }

    /// Data write returning wait cycles.
    fn write_data8w(&mut self, ctx: &mut Ctx<'_>, addr: u32, data: u8) -> u8 {
        self.write_data8(ctx, addr, data);
        0
    }

    fn read_dma_data8(&mut self, ctx: &mut Ctx<'_>, addr: u32) -> u8 {
        self.read_data8(ctx, addr)
    }

    fn write_dma_data8(&mut self, ctx: &mut Ctx<'_>, addr: u32, data: u8) {
        self.write_data8(ctx, addr, data);
    }

    // I/O bus

    fn read_io8(&mut self, ctx: &mut Ctx<'_>, addr: u32) -> u8 {
        OPEN_BUS
    }

    fn write_io8(&mut self, ctx: &mut Ctx<'_>, addr: u32, data: u8) {}

    fn read_dma_io8(&mut self, ctx: &mut Ctx<'_>, addr: u32) -> u8 {
        self.read_io8(ctx, addr)
    }

    fn write_dma_io8(&mut self, ctx: &mut Ctx<'_>, addr: u32, data: u8) {
        self.write_io8(ctx, addr, data);
    }

    // Clocked execution

    /// Run for up to `budget` clocks and return the clocks consumed,
    /// including bus wait cycles. May overshoot. Returning 0 means idle.
    fn run(&mut self, ctx: &mut Ctx<'_>, budget: u64) -> u64 {
        0
    }

    /// Drive a CPU interrupt line.
    fn set_intr_line(&mut self, line: bool, pending: bool, bit: u32) {}

    // Scheduler hooks

    /// A callback registered by this component came due. `late` is how
    /// many clocks after its due time it fired.
    fn event_callback(&mut self, ctx: &mut Ctx<'_>, tag: u32, late: u64) {}

    fn event_pre_frame(&mut self, ctx: &mut Ctx<'_>) {}

    fn event_frame(&mut self, ctx: &mut Ctx<'_>) {}

    fn event_vline(&mut self, ctx: &mut Ctx<'_>, line: VLine) {}

    /// Frame timing changed; takes effect from the current frame.
    fn update_timing(&mut self, ctx: &mut Ctx<'_>, timing: &FrameTiming) {}

    // Audio

    /// Add this component's output into `buffer` (interleaved stereo).
    fn mix(&mut self, buffer: &mut [i32]) {}
}
