//! Audio sample accumulation.
//!
//! The machine mixes sound sources at every scanline end, producing the
//! samples owed since sound output was initialised. The owed count is the
//! elapsed clocks scaled to the output rate and rounded to the nearest
//! sample, so the fractional remainder carries from line to line and the
//! samples per frame follow the clock without drifting.

/// Chunks of headroom kept before samples are dropped.
const RETAINED_CHUNKS: usize = 3;

/// A finished chunk of interleaved stereo samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoundChunk {
    /// `samples * 2` values, left then right.
    pub samples: Vec<i16>,
    /// Frames driven beyond the first to fill the chunk.
    pub extra_frames: u32,
}

#[derive(Debug)]
pub(crate) struct SoundBuffer {
    rate: u32,
    chunk_samples: usize,
    cpu_hz: u64,
    start_clock: u64,
    produced: u64,
    buffer: Vec<i16>,
}

impl SoundBuffer {
    /// `None` when either `rate` or `chunk_samples` is zero, since no
    /// chunk could ever fill.
    pub(crate) fn new(rate: u32, chunk_samples: usize, cpu_hz: u64, now: u64) -> Option<Self> {
        if rate == 0 || chunk_samples == 0 || cpu_hz == 0 {
            return None;
        }
        Some(Self {
            rate,
            chunk_samples,
            cpu_hz,
            start_clock: now,
            produced: 0,
            buffer: Vec::with_capacity(chunk_samples * 2 * RETAINED_CHUNKS),
        })
    }

    /// Samples owed at clock `now`.
    pub(crate) fn due(&self, now: u64) -> usize {
        let elapsed = u128::from(now.saturating_sub(self.start_clock));
        let hz = u128::from(self.cpu_hz);
        let target = (elapsed * u128::from(self.rate) * 2 + hz) / (2 * hz);
        (target as u64).saturating_sub(self.produced) as usize
    }

    /// Accept `mix.len() / 2` mixed stereo samples. Samples beyond the
    /// retained headroom are dropped but still count as produced.
    pub(crate) fn push(&mut self, mix: &[i32]) {
        self.produced += (mix.len() / 2) as u64;
        let room = (self.chunk_samples * 2 * RETAINED_CHUNKS).saturating_sub(self.buffer.len());
        if mix.len() > room {
            log::trace!("sound buffer full, dropping {} samples", (mix.len() - room) / 2);
        }
        self.buffer.extend(
            mix.iter()
                .take(room)
                .map(|&s| s.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16),
        );
    }

    pub(crate) fn is_full(&self) -> bool {
        self.buffer.len() >= self.chunk_samples * 2
    }

    /// Remove one chunk, keeping any surplus for the next.
    pub(crate) fn take(&mut self) -> Vec<i16> {
        let len = (self.chunk_samples * 2).min(self.buffer.len());
        let surplus = self.buffer.split_off(len);
        std::mem::replace(&mut self.buffer, surplus)
    }

    pub(crate) fn chunk_samples(&self) -> usize {
        self.chunk_samples
    }
}
