//! Property-based tests for scheduler and address-bus invariants.
//!
//! These tests use proptest to check ordering, cancellation, determinism
//! and dispatch totality across arbitrary inputs.

use emu_core::testing::{Record, Recorder, ScriptedCpu};
use emu_core::{Access, MachineBuilder, MachineConfig, Observable, ReadResult, Value};
use proptest::prelude::*;

fn config() -> MachineConfig {
    MachineConfig {
        cpu_clock_hz: 1_000_000,
        frames_per_sec: 50.0,
        lines_per_frame: 10,
        io_addr_bits: 8,
    }
}

/// Everything observable about a run once it stops.
#[derive(Debug, PartialEq)]
struct FinalState {
    /// Every record the timer journaled, hooks included.
    records: Vec<Record>,
    machine: Vec<(&'static str, Value)>,
    cpu_runs: Vec<(u64, u64)>,
}

/// Register one callback per delay (tag = index), optionally cancel some,
/// run past all of them and return what fired.
fn run_schedule(delays: &[u64], cancelled: &[bool], cpu_step: Option<u64>) -> Vec<Record> {
    run_to_end(delays, cancelled, cpu_step, 1_000)
        .records
        .into_iter()
        .filter(|r| matches!(r, Record::Event { .. }))
        .collect()
}

/// As [`run_schedule`], stopping after `clocks` and capturing everything.
fn run_to_end(delays: &[u64], cancelled: &[bool], cpu_step: Option<u64>, clocks: u64) -> FinalState {
    let mut b = MachineBuilder::new(config()).unwrap();
    let cpu = cpu_step.map(|step| {
        let cpu = b.add("cpu", ScriptedCpu::new(step));
        b.set_cpu(cpu);
        cpu
    });
    let timer = b.add("timer", Recorder::new("timer"));
    let mut m = b.build();

    m.with(timer, |t, ctx| {
        for (tag, &delay) in delays.iter().enumerate() {
            t.schedule(ctx, tag as u32, delay, false);
        }
        for (tag, _) in cancelled.iter().enumerate().filter(|(_, c)| **c) {
            t.cancel(tag as u32);
        }
    })
    .unwrap();
    m.run_clocks(clocks);

    FinalState {
        records: m.get(timer).unwrap().records.clone(),
        machine: m.snapshot(),
        cpu_runs: cpu.map(|cpu| m.get(cpu).unwrap().runs.clone()).unwrap_or_default(),
    }
}

fn fired_tags(records: &[Record]) -> Vec<u32> {
    records
        .iter()
        .filter_map(|r| match r {
            Record::Event { tag, .. } => Some(*tag),
            _ => None,
        })
        .collect()
}

proptest! {
    /// Callbacks fire in ascending due time, ties in registration order.
    #[test]
    fn fires_in_due_then_registration_order(delays in prop::collection::vec(0u64..50, 2..24)) {
        let fired = fired_tags(&run_schedule(&delays, &[], None));

        let mut expected: Vec<u32> = (0..delays.len() as u32).collect();
        expected.sort_by_key(|&tag| (delays[tag as usize], tag));
        prop_assert_eq!(fired, expected);
    }

    /// Cancelled callbacks never fire; the rest all do.
    #[test]
    fn cancelled_callbacks_never_fire(
        entries in prop::collection::vec((0u64..200, any::<bool>()), 1..24)
    ) {
        let delays: Vec<u64> = entries.iter().map(|(d, _)| *d).collect();
        let cancelled: Vec<bool> = entries.iter().map(|(_, c)| *c).collect();

        let mut fired = fired_tags(&run_schedule(&delays, &cancelled, None));
        fired.sort_unstable();
        let expected: Vec<u32> = (0..entries.len() as u32)
            .filter(|&tag| !cancelled[tag as usize])
            .collect();
        prop_assert_eq!(fired, expected);
    }

    /// The same inputs replay to the same final state: fired callbacks
    /// with their lateness, CPU slices, clock and pending queue.
    #[test]
    fn replay_is_deterministic(
        delays in prop::collection::vec(0u64..400, 1..16),
        step in 1u64..13,
        clocks in 1u64..500,
    ) {
        let first = run_to_end(&delays, &[], Some(step), clocks);
        let second = run_to_end(&delays, &[], Some(step), clocks);

        let fired = first.records.iter().filter(|r| matches!(r, Record::Event { .. })).count();
        let pending = first
            .machine
            .iter()
            .find(|(path, _)| *path == "pending_events")
            .map(|(_, value)| value.clone());
        prop_assert_eq!(pending, Some(Value::U64((delays.len() - fired) as u64)));
        prop_assert_eq!(first, second);
    }

    /// Every address resolves: mapped ports reach the component, the rest
    /// read open bus and swallow writes.
    #[test]
    fn io_dispatch_is_total(addr in any::<u32>(), data in any::<u8>(), mapped_low in 0u32..0xF0) {
        let mut b = MachineBuilder::new(config()).unwrap();
        let chip = b.add("chip", Recorder::new("chip"));
        b.io().map(mapped_low..=mapped_low + 0x0F, chip, Access::ReadWrite);
        let mut m = b.build();

        let port = addr & 0xFF;
        let is_mapped = (mapped_low..=mapped_low + 0x0F).contains(&port);

        m.io_write(addr, data);
        let read = m.io_read(addr);
        if is_mapped {
            prop_assert_eq!(read, ReadResult::new(data));
        } else {
            prop_assert_eq!(read, ReadResult::new(0xFF));
            prop_assert_eq!(m.dma_io_read(addr), 0xFF);
        }
    }
}
