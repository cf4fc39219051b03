//! CPU clock configuration and time-unit conversion.

use crate::Ticks;

/// Clock of the primary CPU.
///
/// All kernel timing derives from this frequency. It is the single place
/// where microseconds become ticks, so every component agrees on rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterClock {
    /// CPU clock in Hz (e.g., `4_000_000` for a 4 MHz Z80).
    pub frequency_hz: u64,
}

impl MasterClock {
    #[must_use]
    pub const fn new(frequency_hz: u64) -> Self {
        Self { frequency_hz }
    }

    /// Convert a microsecond delay to ticks, rounding half up.
    ///
    /// Negative and non-finite delays clamp to zero.
    #[must_use]
    pub fn usec_to_ticks(&self, usec: f64) -> Ticks {
        if !usec.is_finite() || usec <= 0.0 {
            return Ticks::ZERO;
        }
        let ticks = self.frequency_hz as f64 * usec / 1_000_000.0;
        Ticks::new((ticks + 0.5) as u64)
    }

    /// Convert ticks back to microseconds.
    #[must_use]
    pub fn ticks_to_usec(&self, ticks: Ticks) -> f64 {
        ticks.get() as f64 * 1_000_000.0 / self.frequency_hz as f64
    }

    /// Ticks in frame number `frame` at `frames_per_sec`.
    ///
    /// The fractional part of `frequency / fps` is distributed across
    /// frames so that long runs do not drift.
    #[must_use]
    pub fn ticks_in_frame(&self, frames_per_sec: f64, frame: u64) -> Ticks {
        let per_frame = self.frequency_hz as f64 / frames_per_sec;
        let start = (frame as f64 * per_frame).floor() as u64;
        let end = ((frame + 1) as f64 * per_frame).floor() as u64;
        Ticks::new(end - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usec_rounds_half_up() {
        let clock = MasterClock::new(4_000_000);
        assert_eq!(clock.usec_to_ticks(120.0), Ticks::new(480));
        // 0.125 us at 4 MHz is exactly half a tick.
        assert_eq!(clock.usec_to_ticks(0.125), Ticks::new(1));
        assert_eq!(clock.usec_to_ticks(0.1), Ticks::new(0));
        assert_eq!(clock.usec_to_ticks(-5.0), Ticks::ZERO);
    }

    #[test]
    fn frame_lengths_distribute_remainder() {
        let clock = MasterClock::new(1_000_000);
        let lengths: Vec<u64> = (0..3).map(|n| clock.ticks_in_frame(3.0, n).get()).collect();
        assert_eq!(lengths.iter().sum::<u64>(), 1_000_000);
        assert!(lengths.iter().all(|&l| l == 333_333 || l == 333_334));
    }

    #[test]
    fn ticks_to_usec_inverts() {
        let clock = MasterClock::new(4_000_000);
        assert!((clock.ticks_to_usec(Ticks::new(8400)) - 2100.0).abs() < 1e-9);
    }
}
