//! Integration tests for the machine driver: frame structure, CPU
//! budgeting, lifecycle order, signal propagation, buses and audio.

use emu_core::testing::{Journal, Line, Record, Recorder, ScriptedCpu};
use emu_core::{
    Access, Lifecycle, Machine, MachineBuilder, MachineConfig, MemoryMap, Observable, ReadResult,
    Value,
};

/// 1 MHz, 50 fps, 10 lines: 20 000 clocks per frame, 2 000 per line.
fn config() -> MachineConfig {
    MachineConfig {
        cpu_clock_hz: 1_000_000,
        frames_per_sec: 50.0,
        lines_per_frame: 10,
        io_addr_bits: 8,
    }
}

fn builder() -> MachineBuilder {
    let _ = env_logger::builder().is_test(true).try_init();
    MachineBuilder::new(config()).unwrap()
}

fn recorder(machine: &Machine, handle: emu_core::Handle<Recorder>) -> &Recorder {
    machine.get(handle).unwrap()
}

// ---------------------------------------------------------------------------
// Frame structure
// ---------------------------------------------------------------------------

#[test]
fn frame_hooks_precede_scanlines() {
    let mut b = builder();
    let video = b.add("video", Recorder::new("video").with_frame_hooks().with_vline_hooks());
    let mut m = b.build();

    m.drive();

    let records = &recorder(&m, video).records;
    assert_eq!(records[0], Record::Initialized);
    assert_eq!(records[1], Record::PreFrame { at: 0 });
    assert_eq!(records[2], Record::Frame { at: 0 });
    let lines: Vec<(u32, u64)> = records
        .iter()
        .filter_map(|r| match r {
            Record::VLine { index, at } => Some((*index, *at)),
            _ => None,
        })
        .collect();
    assert_eq!(lines.len(), 10);
    assert_eq!(lines[0], (0, 0));
    assert_eq!(lines[9], (9, 18_000));
    assert_eq!(m.now().get(), 20_000);
    assert_eq!(m.frame_count(), 1);
}

#[test]
fn timing_change_applies_next_frame() {
    let mut b = builder();
    let video = b.add("video", Recorder::new("video").with_frame_hooks().with_vline_hooks());
    let mut m = b.build();

    m.with(video, |_, ctx| ctx.set_lines_per_frame(5)).unwrap();
    assert_eq!(m.query("lines_per_frame"), Some(Value::U32(10)));
    m.drive();

    let records = &recorder(&m, video).records;
    let timing = records.iter().position(|r| *r == Record::Timing { lines: 5 }).unwrap();
    let frame = records.iter().position(|r| matches!(r, Record::Frame { .. })).unwrap();
    assert!(timing < frame);
    let vlines = records.iter().filter(|r| matches!(r, Record::VLine { .. })).count();
    assert_eq!(vlines, 5);
    assert_eq!(m.now().get(), 20_000);
}

// ---------------------------------------------------------------------------
// CPU budgeting
// ---------------------------------------------------------------------------

#[test]
fn cpu_overshoot_makes_callbacks_late() {
    let mut b = builder();
    let cpu = b.add("cpu", ScriptedCpu::new(7));
    let timer = b.add("timer", Recorder::new("timer"));
    b.set_cpu(cpu);
    let mut m = b.build();

    m.with(timer, |t, ctx| t.schedule(ctx, 1, 100, false)).unwrap();
    m.run_clocks(200);

    let event = recorder(&m, timer)
        .records
        .iter()
        .find(|r| matches!(r, Record::Event { .. }))
        .cloned();
    assert_eq!(event, Some(Record::Event { tag: 1, at: 105, late: 5 }));
    // First budget stops at the callback's due time.
    assert_eq!(m.get(cpu).unwrap().runs[0], (0, 100));
}

#[test]
fn idle_cpu_lets_time_jump() {
    let mut b = builder();
    let cpu = b.add("cpu", ScriptedCpu::idle());
    let timer = b.add("timer", Recorder::new("timer"));
    b.set_cpu(cpu);
    let mut m = b.build();

    m.with(timer, |t, ctx| t.schedule(ctx, 9, 1_234, false)).unwrap();
    m.run_clocks(5_000);

    assert!(recorder(&m, timer).records.contains(&Record::Event { tag: 9, at: 1_234, late: 0 }));
    assert_eq!(m.now().get(), 5_000);
}

#[test]
fn io_wait_states_are_charged_to_the_cpu() {
    let mut b = builder();
    let cpu = b.add("cpu", ScriptedCpu::new(4).polling(0x10));
    let port = b.add("port", Recorder::new("port"));
    b.io().map(0x10..=0x1F, port, Access::ReadWrite).set_wait(0x10..=0x10, 3, Access::Read);
    b.set_cpu(cpu);
    let mut m = b.build();

    m.io_write(0x10, 0xA5);
    m.run_clocks(14);

    let cpu = m.get(cpu).unwrap();
    assert_eq!(cpu.runs, vec![(0, 14)]);
    assert_eq!(cpu.polled, vec![0xA5, 0xA5]);
    assert_eq!(m.now().get(), 14);
}

#[test]
fn periodic_callback_cancelled_from_inside() {
    let mut b = builder();
    let timer = b.add("timer", Recorder::new("timer"));
    let mut m = b.build();

    m.with(timer, |t, ctx| {
        t.schedule(ctx, 1, 300, true);
        t.schedule(ctx, 2, 1_000, false);
        t.cancel_when_fired(2, 1);
    })
    .unwrap();
    m.run_clocks(5_000);

    assert_eq!(recorder(&m, timer).fired(), vec![1, 1, 1, 2]);
    assert_eq!(m.scheduler().pending(), 0);
}

#[test]
fn zero_delay_callback_fires_in_same_pass() {
    let mut b = builder();
    let timer = b.add("timer", Recorder::new("timer"));
    let mut m = b.build();

    m.with(timer, |t, ctx| t.schedule(ctx, 4, 0, false)).unwrap();
    m.run_clocks(1);
    assert!(recorder(&m, timer).records.contains(&Record::Event { tag: 4, at: 0, late: 0 }));
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn release_runs_in_reverse_creation_order() {
    let journal = Journal::default();
    let mut b = builder();
    let first = b.add("first", Recorder::new("first").with_journal(&journal));
    b.add("second", Recorder::new("second").with_journal(&journal));
    let mut m = b.build();

    m.reset();
    assert_eq!(m.lifecycle(first), Some(Lifecycle::Reset));
    drop(m);

    let names: Vec<(&str, Record)> = journal.borrow().clone();
    assert_eq!(
        names,
        vec![
            ("first", Record::Initialized),
            ("second", Record::Initialized),
            ("first", Record::Reset),
            ("second", Record::Reset),
            ("second", Record::Released),
            ("first", Record::Released),
        ]
    );
}

#[test]
fn released_component_callbacks_never_fire() {
    let mut b = builder();
    let timer = b.add("timer", Recorder::new("timer"));
    let mut m = b.build();

    m.with(timer, |t, ctx| t.schedule(ctx, 1, 10, true)).unwrap();
    m.release();
    m.run_clocks(100);

    assert_eq!(m.lifecycle(timer), Some(Lifecycle::Released));
    assert!(m.get(timer).is_none());
    assert_eq!(m.scheduler().pending(), 0);
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[test]
fn fan_out_follows_subscription_order() {
    let journal = Journal::default();
    let mut b = builder();
    let source = b.add("source", Recorder::new("source"));
    let x = b.add("x", Recorder::new("x").with_journal(&journal));
    let y = b.add("y", Recorder::new("y").with_journal(&journal));
    b.connect(source, Line::A, y, Line::A, 0xFFFF_FFFF);
    b.connect(source, Line::A, x, Line::B, 0xFFFF_FFFF);
    let mut m = b.build();
    journal.borrow_mut().clear();

    m.with(source, |s, ctx| s.publish(ctx, Line::A, 1)).unwrap();

    let order: Vec<&str> = journal.borrow().iter().map(|(name, _)| *name).collect();
    assert_eq!(order, vec!["y", "x"]);
    assert_eq!(recorder(&m, x).level(Line::B), 1);
}

#[test]
fn masks_merge_levels_from_several_producers() {
    let mut b = builder();
    let low = b.add("low", Recorder::new("low"));
    let high = b.add("high", Recorder::new("high"));
    let sink = b.add("sink", Recorder::new("sink"));
    b.connect(low, Line::A, sink, Line::D, 0x0F);
    b.connect(high, Line::A, sink, Line::D, 0xF0);
    let mut m = b.build();

    m.with(low, |r, ctx| r.publish(ctx, Line::A, 0xFF)).unwrap();
    assert_eq!(recorder(&m, sink).level(Line::D), 0x0F);
    m.with(high, |r, ctx| r.publish(ctx, Line::A, 0x00)).unwrap();
    assert_eq!(recorder(&m, sink).level(Line::D), 0x0F);
    m.with(high, |r, ctx| r.publish(ctx, Line::A, 0xFF)).unwrap();
    assert_eq!(recorder(&m, sink).level(Line::D), 0xFF);
}

#[test]
fn feedback_to_busy_producer_is_delivered_after_it_returns() {
    let mut b = builder();
    let a = b.add("a", Recorder::new("a"));
    let relay = b.add("relay", Recorder::new("relay").relaying(Line::C));
    b.connect(a, Line::A, relay, Line::A, 0xFF);
    b.connect(relay, Line::C, a, Line::B, 0xFF);
    let mut m = b.build();

    let during = m
        .with(a, |rec, ctx| {
            rec.publish(ctx, Line::A, 0x1FF);
            rec.level(Line::B)
        })
        .unwrap();

    assert_eq!(during, 0);
    assert_eq!(recorder(&m, relay).level(Line::A), 0xFF);
    assert_eq!(recorder(&m, a).level(Line::B), 0xFF);
}

// ---------------------------------------------------------------------------
// Buses
// ---------------------------------------------------------------------------

#[test]
fn io_dispatch_covers_open_value_and_alias() {
    let mut b = builder();
    let chip = b.add("chip", Recorder::new("chip"));
    b.io()
        .map_alias(0x80, chip, 1, Access::ReadWrite)
        .map_value(0x90..=0x90, 0x5A);
    let mut m = b.build();

    m.io_write(0x180, 0x33);
    assert_eq!(recorder(&m, chip).records.last(), Some(&Record::IoWrite { addr: 1, data: 0x33 }));
    assert_eq!(m.io_read(0x80), ReadResult::new(0x33));
    assert_eq!(m.io_read(0x90), ReadResult::new(0x5A));
    assert_eq!(m.io_read(0x91), ReadResult::new(0xFF));
    assert_eq!(m.io_write(0x91, 0), 0);
}

#[test]
fn memory_banks_through_the_machine() {
    let mut b = builder();
    let mut memory = MemoryMap::new(16, 12);
    let ram = memory.add_region("ram", vec![0; 0x2000]);
    memory.map(0x0000..=0x1FFF, ram, 0, Access::ReadWrite);
    memory.set_wait(0x1000..=0x1FFF, 1, Access::Read);
    let mem = b.add("memory", memory);
    b.set_memory(mem);
    let mut m = b.build();

    assert_eq!(m.mem_write(0x1004, 0x77), 0);
    assert_eq!(m.mem_read(0x1004), ReadResult::with_wait(0x77, 1));
    assert_eq!(m.mem_read(0x8000).data, 0xFF);

    m.get_mut(mem).unwrap().map(0x0000..=0x0FFF, ram, 0x1000, Access::Read);
    assert_eq!(m.mem_read(0x0004).data, 0x77);
}

// ---------------------------------------------------------------------------
// Audio
// ---------------------------------------------------------------------------

#[test]
fn create_sound_drives_one_frame_per_chunk() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut b = MachineBuilder::new(MachineConfig::default()).unwrap();
    let beeper = b.add("beeper", Recorder::new("beeper").with_sample(100));
    b.add_sound_source(beeper);
    let mut m = b.build();

    // 4 MHz at 60 fps is 735 samples per frame at 44.1 kHz.
    m.initialize_sound(44_100, 735);
    for frame in 1..=6 {
        let chunk = m.create_sound().unwrap();
        assert_eq!(chunk.extra_frames, 0);
        assert_eq!(chunk.samples.len(), 735 * 2);
        assert!(chunk.samples.iter().all(|&s| s == 100));
        assert_eq!(m.frame_count(), frame);
    }
    assert_eq!(m.now().get(), 400_000);
}

#[test]
fn create_sound_catches_up_short_chunks() {
    let mut b = builder();
    let beeper = b.add("beeper", Recorder::new("beeper").with_sample(100));
    b.add_sound_source(beeper);
    let mut m = b.build();

    // 1 kHz output: 20 samples per 20 000-clock frame.
    m.initialize_sound(1_000, 30);
    let chunk = m.create_sound().unwrap();
    assert_eq!(chunk.extra_frames, 1);
    assert_eq!(chunk.samples.len(), 60);
    assert_eq!(m.frame_count(), 2);

    // The 10 left over plus one more frame fill the next chunk.
    let chunk = m.create_sound().unwrap();
    assert_eq!(chunk.extra_frames, 0);
    assert_eq!(chunk.samples.len(), 60);
    assert!(chunk.samples.iter().all(|&s| s == 100));
    assert_eq!(m.frame_count(), 3);
}

#[test]
fn zero_sample_rate_disables_sound() {
    let mut m = builder().build();
    m.initialize_sound(0, 16);
    assert!(m.create_sound().is_none());
    m.initialize_sound(44_100, 0);
    assert!(m.create_sound().is_none());
    assert_eq!(m.frame_count(), 0);
}

#[test]
fn create_sound_without_initialization_is_none() {
    let mut m = builder().build();
    assert!(m.create_sound().is_none());
    assert_eq!(m.frame_count(), 0);
}

#[test]
fn observable_reports_components() {
    let mut b = builder();
    b.add("one", Recorder::new("one"));
    b.add("two", Recorder::new("two"));
    let m = b.build();
    assert_eq!(m.query("components"), Some(Value::from(vec!["one", "two"])));
    assert_eq!(m.query("clock"), Some(Value::U64(0)));
}
