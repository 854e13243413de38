//! # Timebase
//!
//! Every measurement is taken with the free-running cycle counter of the core. On aarch64 this
//! is the generic timer (`cntvct_el0`, a fixed-frequency counter independent of core clock), on
//! x86_64 the invariant TSC. Neither ticks in nanoseconds, so the counter is sampled once at
//! startup against the raw monotonic clock and the resulting ratio is reused everywhere.
use log::{debug, warn};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

/// Length of the calibration window
pub const CALIBRATION_INTERVAL: Duration = Duration::from_millis(100);

/// Source of cycle counter samples
pub trait CycleSource {
    fn cycles(&self) -> u64;
}

/// Monotonic nanosecond clock used as the calibration reference
pub trait WallClock {
    fn nanos(&self) -> u64;

    fn sleep(&self, interval: Duration) {
        thread::sleep(interval);
    }
}

/// The core's hardware cycle counter
#[derive(Debug, Default, Clone, Copy)]
pub struct HardwareCounter;

impl CycleSource for HardwareCounter {
    #[inline(always)]
    fn cycles(&self) -> u64 {
        now()
    }
}

/// `CLOCK_MONOTONIC_RAW`, unaffected by NTP slewing
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicRawClock;

impl WallClock for MonotonicRawClock {
    fn nanos(&self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid, writable timespec and the clock id is a constant known to Linux.
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts) };
        if rc != 0 {
            return fallback_nanos();
        }
        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
    }
}

/// Read the cycle counter, serialized against preceding instructions
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn now() -> u64 {
    let t: u64;
    // SAFETY: reading the virtual counter is permitted at EL0 on Linux. No `nomem` so the
    // compiler keeps memory accesses on their side of the sample.
    unsafe {
        std::arch::asm!(
            "isb",
            "mrs {t}, cntvct_el0",
            t = out(reg) t,
            options(nostack, preserves_flags),
        );
    }
    t
}

/// Read the cycle counter, serialized against preceding instructions
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn now() -> u64 {
    let lo: u32;
    let hi: u32;
    // SAFETY: `lfence; rdtsc` only writes eax/edx. No `nomem` so the compiler keeps memory
    // accesses on their side of the sample.
    unsafe {
        std::arch::asm!(
            "lfence",
            "rdtsc",
            out("eax") lo,
            out("edx") hi,
            options(nostack, preserves_flags),
        );
    }
    ((hi as u64) << 32) | lo as u64
}

/// Read the cycle counter (nanoseconds since first use on targets without a usable counter)
#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
#[inline(always)]
pub fn now() -> u64 {
    fallback_nanos()
}

fn fallback_nanos() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Calibrated conversion from counter ticks to nanoseconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timebase {
    cycles_per_ns: f64,
}

impl Timebase {
    /// Calibrate the hardware counter against `CLOCK_MONOTONIC_RAW`
    pub fn calibrate() -> Self {
        Self::calibrate_with(&HardwareCounter, &MonotonicRawClock)
    }

    /// Sample `counter` and `clock`, sleep for [`CALIBRATION_INTERVAL`], sample both again.
    ///
    /// An oversleep is not corrected, only reported.
    pub fn calibrate_with<C: CycleSource, W: WallClock>(counter: &C, clock: &W) -> Self {
        let c0 = counter.cycles();
        let t0 = clock.nanos();
        clock.sleep(CALIBRATION_INTERVAL);
        let c1 = counter.cycles();
        let t1 = clock.nanos();

        let cycles = c1.wrapping_sub(c0);
        let nanos = t1.saturating_sub(t0).max(1);
        if nanos > 2 * CALIBRATION_INTERVAL.as_nanos() as u64 {
            warn!(
                "Calibration slept {}ns instead of {}ns, counter rate may be skewed",
                nanos,
                CALIBRATION_INTERVAL.as_nanos()
            );
        }

        let timebase = Timebase {
            cycles_per_ns: cycles as f64 / nanos as f64,
        };
        debug!(
            "counter diff: {} clock diff: {} rate: {}",
            cycles, nanos, timebase.cycles_per_ns
        );
        timebase
    }

    /// Use a known counter rate instead of calibrating
    pub fn from_rate(cycles_per_ns: f64) -> Self {
        Timebase { cycles_per_ns }
    }

    pub fn cycles_per_ns(&self) -> f64 {
        self.cycles_per_ns
    }

    /// Convert a tick count into nanoseconds
    pub fn to_ns(&self, cycles: f64) -> f64 {
        cycles / self.cycles_per_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Counter that returns a scripted sequence
    struct ScriptedCounter {
        samples: Vec<u64>,
        next: Cell<usize>,
    }

    impl CycleSource for ScriptedCounter {
        fn cycles(&self) -> u64 {
            let i = self.next.get();
            self.next.set(i + 1);
            self.samples[i]
        }
    }

    /// Clock that only advances when asked to sleep
    struct SteppingClock {
        now: Cell<u64>,
        step: u64,
    }

    impl WallClock for SteppingClock {
        fn nanos(&self) -> u64 {
            self.now.get()
        }

        fn sleep(&self, _interval: Duration) {
            self.now.set(self.now.get() + self.step);
        }
    }

    #[test]
    fn calibration_ratio_is_exact() {
        let counter = ScriptedCounter {
            samples: vec![1_000, 300_001_000],
            next: Cell::new(0),
        };
        let clock = SteppingClock {
            now: Cell::new(5_000),
            step: 100_000_000,
        };

        let tb = Timebase::calibrate_with(&counter, &clock);
        assert_eq!(tb.cycles_per_ns(), 3.0);
        assert_eq!(tb.to_ns(3_000.0), 1_000.0);
    }

    #[test]
    fn calibration_survives_counter_wrap() {
        let counter = ScriptedCounter {
            samples: vec![u64::MAX - 9, 10],
            next: Cell::new(0),
        };
        let clock = SteppingClock {
            now: Cell::new(0),
            step: 20,
        };

        assert_eq!(Timebase::calibrate_with(&counter, &clock).cycles_per_ns(), 1.0);
    }

    #[test]
    fn hardware_counter_advances() {
        let a = now();
        thread::sleep(Duration::from_millis(2));
        let b = now();
        assert!(b > a);
    }

    #[test]
    fn raw_clock_is_monotonic() {
        let clock = MonotonicRawClock;
        let a = clock.nanos();
        let b = clock.nanos();
        assert!(b >= a);
    }
}
