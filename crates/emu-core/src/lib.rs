//! Shared simulation kernel for cycle-accurate machines.
//!
//! A machine is a set of [`Component`]s wired together by a
//! [`MachineBuilder`]: level signals between chips, an I/O decode map,
//! banked memory and a CPU. The [`Machine`] then drives everything from
//! one virtual clock counted in CPU ticks. Nothing advances unless the
//! scheduler calls it.

mod bus;
mod clock;
mod component;
mod config;
mod error;
mod io_map;
mod machine;
mod memory;
mod observable;
mod scheduler;
mod signal;
mod sound;
mod ticks;

#[cfg(feature = "test-utils")]
pub mod testing;

pub use bus::{Access, OPEN_BUS, ReadResult};
pub use clock::MasterClock;
pub use component::{AsAny, Component, ComponentId, Handle, Lifecycle, VLine};
pub use config::MachineConfig;
pub use error::EmuError;
pub use io_map::{IoMap, MapEntry, Target};
pub use machine::{Ctx, Machine, MachineBuilder};
pub use memory::{MemoryMap, RegionId};
pub use observable::{Observable, Value};
pub use scheduler::{EventHandle, FrameTiming, Scheduler};
pub use signal::{OutputPin, SignalInput, SignalOutput};
pub use sound::SoundChunk;
pub use ticks::Ticks;
