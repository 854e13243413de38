//! Minimum-of-trials reduction shared by every engine.
//!
//! The smallest sample of a repeated measurement is the one least disturbed by interrupts,
//! preemption and cold caches, so that is what gets reported.

/// Timed phases each harness worker runs
pub const PHASES: usize = 4;

/// Trials per latency measurement, the first one being warm-up
pub const TRIALS: usize = 5;

/// Which samples take part in the minimum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WarmupPolicy {
    /// Every sample counts, the warm-up pass included
    #[default]
    KeepAll,
    /// The first sample is taken but never reported
    DiscardFirst,
}

impl WarmupPolicy {
    fn skipped(self) -> usize {
        match self {
            WarmupPolicy::KeepAll => 0,
            WarmupPolicy::DiscardFirst => 1,
        }
    }
}

/// Smallest sample not excluded by `policy`, `None` if nothing is left
pub fn min_of(samples: &[u64], policy: WarmupPolicy) -> Option<u64> {
    samples.iter().skip(policy.skipped()).copied().min()
}

/// Run `trial` [`TRIALS`] times and keep the minimum of all but the first run
pub fn min_after_warmup<F: FnMut() -> u64>(mut trial: F) -> u64 {
    let mut min = u64::MAX;
    for p in 0..TRIALS {
        let diff = trial();
        if p > 0 && diff < min {
            min = diff;
        }
    }
    min
}
