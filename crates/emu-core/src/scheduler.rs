//! Virtual-clock scheduler.
//!
//! Time is a monotonic count of CPU clocks. Components register one-shot
//! or periodic callbacks at `now + delay`; the scheduler hands them back
//! in ascending `(due, registration sequence)` order, so callbacks due at
//! the same clock fire in the order they were registered.
//!
//! Registration returns an [`EventHandle`]. The handle is the only way to
//! cancel, and dropping it cancels too, so a component that forgets its
//! callbacks (or is released) can never be called back.

use std::cell::Cell;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::clock::MasterClock;
use crate::component::ComponentId;
use crate::ticks::Ticks;

/// Frame structure of the video timing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameTiming {
    pub frames_per_sec: f64,
    pub lines_per_frame: u32,
}

/// Owner's grip on a registered callback.
#[must_use = "dropping an EventHandle cancels the callback"]
#[derive(Debug)]
pub struct EventHandle {
    live: Rc<Cell<bool>>,
    due: Ticks,
}

impl EventHandle {
    /// Cancel the callback. Idempotent; harmless after it fired.
    pub fn cancel(&mut self) {
        self.live.set(false);
    }

    /// Whether the callback will still fire. A periodic callback stays
    /// pending until cancelled.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.live.get()
    }

    /// First due time.
    #[must_use]
    pub fn due(&self) -> Ticks {
        self.due
    }
}

impl Drop for EventHandle {
    fn drop(&mut self) {
        self.live.set(false);
    }
}

#[derive(Debug)]
struct Pending {
    due: u64,
    seq: u64,
    owner: ComponentId,
    tag: u32,
    period: Option<u64>,
    live: Rc<Cell<bool>>,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

/// A callback that came due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fired {
    pub owner: ComponentId,
    pub tag: u32,
    pub late: u64,
}

/// The virtual clock and its callback queue.
#[derive(Debug)]
pub struct Scheduler {
    clock: MasterClock,
    now: u64,
    next_seq: u64,
    queue: BinaryHeap<Reverse<Pending>>,
    timing: FrameTiming,
    pending_timing: Option<FrameTiming>,
    /// Frames since the last timing change.
    epoch_frame: u64,
}

impl Scheduler {
    #[must_use]
    pub fn new(clock: MasterClock, timing: FrameTiming) -> Self {
        Self {
            clock,
            now: 0,
            next_seq: 0,
            queue: BinaryHeap::new(),
            timing,
            pending_timing: None,
            epoch_frame: 0,
        }
    }

    #[must_use]
    pub fn now(&self) -> Ticks {
        Ticks::new(self.now)
    }

    #[must_use]
    pub fn clock(&self) -> MasterClock {
        self.clock
    }

    #[must_use]
    pub fn timing(&self) -> FrameTiming {
        self.timing
    }

    /// Number of live callbacks still queued.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.iter().filter(|Reverse(p)| p.live.get()).count()
    }

    /// Register a callback `delay` clocks from now. A periodic callback
    /// re-arms every `delay` clocks (at least one).
    pub(crate) fn register(&mut self, owner: ComponentId, tag: u32, delay: u64, periodic: bool) -> EventHandle {
        let live = Rc::new(Cell::new(true));
        let due = self.now.saturating_add(delay);
        let seq = self.take_seq();
        self.queue.push(Reverse(Pending {
            due,
            seq,
            owner,
            tag,
            period: periodic.then(|| delay.max(1)),
            live: Rc::clone(&live),
        }));
        log::trace!("schedule {owner} tag {tag} at {due} (seq {seq}, periodic {periodic})");
        EventHandle {
            live,
            due: Ticks::new(due),
        }
    }

    /// Due time of the earliest live callback.
    pub(crate) fn next_due(&mut self) -> Option<u64> {
        self.discard_dead();
        self.queue.peek().map(|Reverse(p)| p.due)
    }

    /// Pop the earliest live callback due at or before now. Periodic
    /// callbacks are re-armed before being returned, so the owner may
    /// cancel them from inside the callback.
    pub(crate) fn pop_due(&mut self) -> Option<Fired> {
        self.discard_dead();
        if self.queue.peek().is_none_or(|Reverse(p)| p.due > self.now) {
            return None;
        }
        let Reverse(event) = self.queue.pop()?;
        let fired = Fired {
            owner: event.owner,
            tag: event.tag,
            late: self.now - event.due,
        };
        match event.period {
            Some(period) => {
                let seq = self.take_seq();
                self.queue.push(Reverse(Pending {
                    due: event.due.saturating_add(period),
                    seq,
                    ..event
                }));
            }
            None => event.live.set(false),
        }
        Some(fired)
    }

    pub(crate) fn advance(&mut self, clocks: u64) {
        self.now += clocks;
    }

    pub(crate) fn usec_to_clocks(&self, usec: f64) -> u64 {
        self.clock.usec_to_ticks(usec).get()
    }

    pub(crate) fn request_timing(&mut self, timing: FrameTiming) {
        self.pending_timing = Some(timing);
    }

    pub(crate) fn current_or_pending_timing(&self) -> FrameTiming {
        self.pending_timing.unwrap_or(self.timing)
    }

    /// Apply a requested timing change. Returns the new timing if one was
    /// pending.
    pub(crate) fn apply_timing(&mut self) -> Option<FrameTiming> {
        let timing = self.pending_timing.take()?;
        self.timing = timing;
        self.epoch_frame = 0;
        Some(timing)
    }

    /// Clocks in the frame about to run; advances the frame counter.
    pub(crate) fn next_frame_clocks(&mut self) -> u64 {
        let clocks = self
            .clock
            .ticks_in_frame(self.timing.frames_per_sec, self.epoch_frame)
            .get();
        self.epoch_frame += 1;
        clocks
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn discard_dead(&mut self) {
        while self.queue.peek().is_some_and(|Reverse(p)| !p.live.get()) {
            self.queue.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> Scheduler {
        Scheduler::new(
            MasterClock::new(1_000_000),
            FrameTiming {
                frames_per_sec: 50.0,
                lines_per_frame: 312,
            },
        )
    }

    fn drain(s: &mut Scheduler) -> Vec<u32> {
        let mut fired = Vec::new();
        while let Some(f) = s.pop_due() {
            fired.push(f.tag);
        }
        fired
    }

    #[test]
    fn equal_due_times_fire_in_registration_order() {
        let mut s = scheduler();
        let owner = ComponentId(0);
        let _a = s.register(owner, 1, 10, false);
        let _b = s.register(owner, 2, 10, false);
        let _c = s.register(owner, 3, 5, false);
        s.advance(10);
        assert_eq!(drain(&mut s), vec![3, 1, 2]);
    }

    #[test]
    fn huge_delay_saturates() {
        let mut s = scheduler();
        s.advance(100);
        let never = s.register(ComponentId(0), 1, u64::MAX, false);
        assert_eq!(never.due().get(), u64::MAX);
        s.advance(1_000_000);
        assert!(drain(&mut s).is_empty());
        assert!(never.is_pending());
    }

    #[test]
    fn dropped_handle_never_fires() {
        let mut s = scheduler();
        let owner = ComponentId(0);
        let keep = s.register(owner, 1, 10, false);
        drop(s.register(owner, 2, 10, false));
        s.advance(20);
        assert_eq!(drain(&mut s), vec![1]);
        assert!(!keep.is_pending());
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut s = scheduler();
        let mut handle = s.register(ComponentId(0), 1, 10, false);
        handle.cancel();
        handle.cancel();
        s.advance(10);
        assert!(drain(&mut s).is_empty());
        assert_eq!(s.pending(), 0);
    }

    #[test]
    fn periodic_rearms_and_reports_lateness() {
        let mut s = scheduler();
        let handle = s.register(ComponentId(0), 7, 4, true);
        s.advance(9);
        let first = s.pop_due().map(|f| f.late);
        let second = s.pop_due().map(|f| f.late);
        assert_eq!(first, Some(5));
        assert_eq!(second, Some(1));
        assert!(s.pop_due().is_none());
        assert_eq!(s.next_due(), Some(12));
        assert!(handle.is_pending());
    }

    #[test]
    fn timing_change_waits_for_apply() {
        let mut s = scheduler();
        assert_eq!(s.next_frame_clocks(), 20_000);
        s.request_timing(FrameTiming {
            frames_per_sec: 60.0,
            lines_per_frame: 262,
        });
        assert_eq!(s.timing().lines_per_frame, 312);
        assert!(s.apply_timing().is_some());
        assert_eq!(s.next_frame_clocks(), 16_666);
        assert_eq!(s.next_frame_clocks(), 16_667);
    }
}
