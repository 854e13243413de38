pub mod c2c;
pub mod chase;
pub mod context;
pub mod error;
pub mod harness;
pub mod kernels;
pub mod primitives;
pub mod region;
pub mod rendezvous;
pub mod sequential;
pub mod suite;
pub mod timebase;
pub mod trials;
pub mod workers;

use std::fmt;

pub use context::{BenchConfig, BenchContext, CoreRange, MemoryKind};
pub use error::{BenchError, Result};
pub use timebase::Timebase;

const GB: u64 = 1024 * 1024 * 1024;
const MB: u64 = 1024 * 1024;
const KB: u64 = 1024;

/// Convert number of bytes to formatted string
pub fn format_size(bytes: f32) -> String {
    const GB: f32 = 1024.0 * 1024.0 * 1024.0;
    const MB: f32 = 1024.0 * 1024.0;
    const KB: f32 = 1024.0;

    if bytes >= GB {
        format!("{:.2} GiB", bytes / GB)
    } else if bytes >= MB {
        format!("{:.2} MiB", bytes / MB)
    } else if bytes >= KB {
        format!("{:.2} KiB", bytes / KB)
    } else {
        format!("{:.2} B", bytes)
    }
}

/// Convert number of bytes to a right-aligned integer with a `k`/`M`/`G` suffix
pub fn nice_size(bytes: u64) -> String {
    if bytes < KB {
        format!("{:>9}", bytes)
    } else if bytes < MB {
        format!("{:>9}k", bytes / KB)
    } else if bytes < GB {
        format!("{:>9}M", bytes / MB)
    } else {
        format!("{:>9}G", bytes / GB)
    }
}

/// Convert nanoseconds to a string in the largest unit below 1000
pub fn nice_time(ns: f64) -> String {
    if ns < 1_000.0 {
        format!("{:.3}ns", ns)
    } else if ns < 1_000_000.0 {
        format!("{:.3}us", ns / 1_000.0)
    } else if ns < 1_000_000_000.0 {
        format!("{:.3}ms", ns / 1_000_000.0)
    } else {
        format!("{:.3}s", ns / 1_000_000_000.0)
    }
}

/// Bytes moved in `ns` nanoseconds, as GiB per second
pub fn gib_per_sec(bytes: f64, ns: f64) -> f64 {
    bytes * 1_000_000_000.0 / ns / GB as f64
}

/// Latency of one access at a given working-set size
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Latency {
    /// Working set in bytes
    pub size: u64,
    /// Net nanoseconds per access, loop overhead subtracted
    pub ns: f64,
    /// `ns` expressed in cycles of the nominal core clock
    pub core_cycles: u64,
}

impl Latency {
    /// Net latency from measured and baseline ticks over `accesses` accesses
    pub fn from_cycles(
        size: u64,
        measured: u64,
        baseline: u64,
        accesses: u64,
        timebase: &Timebase,
        core_ghz: f64,
    ) -> Self {
        let net = measured as f64 - baseline as f64;
        let ns = timebase.to_ns(net) / accesses as f64;
        Latency {
            size,
            ns,
            core_cycles: (ns * core_ghz + 0.5) as u64,
        }
    }
}

impl fmt::Display for Latency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Size:{}  Latency:{:4.1}ns  Cycles:{}",
            nice_size(self.size),
            self.ns,
            self.core_cycles
        )
    }
}
