//! The benchmark modes a run can select, each printing human-readable result lines to `out`.
use crate::c2c::{self, Peer};
use crate::chase;
use crate::context::{BenchContext, CoreRange};
use crate::error::Result;
use crate::kernels::{self, KernelKind};
use crate::nice_size;
use crate::sequential;
use crate::workers::pin_current;
use log::info;
use std::io::Write;
use std::ops::{ControlFlow, RangeInclusive};

/// Per-thread working sets of the throughput sweep, as powers of two (16 KiB to 32 MiB)
pub const THROUGHPUT_SWEEP: RangeInclusive<u32> = 14..=25;

/// Working sets of the latency sweeps, as powers of two (16 KiB to 64 MiB)
pub const LATENCY_SWEEP: RangeInclusive<u32> = 14..=26;

/// Per-thread working set of the overall benchmark and the stress modes
pub const LARGE_SLICE: usize = 32 << 20;

/// Iterations per timed pass in the stress modes
pub const STRESS_ITERATIONS: u64 = 100;

/// Working set of the latency reported by the overall benchmark
const OVERALL_LATENCY_LOG2: u32 = 26;

/// Iterations for a throughput sweep point, so every point moves about 4 MiB per thread
pub fn sweep_iterations(log2_size: u32) -> u64 {
    if log2_size > 22 { 1 } else { 1 << (22 - log2_size) }
}

/// What a stress run hammers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StressKind {
    Kernel(KernelKind),
    SequentialLatency,
}

impl StressKind {
    /// Parse the single-letter mode: `w`rite, `c`lear, `r`ead or sequential `l`atency
    pub fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'w' => Some(StressKind::Kernel(KernelKind::Write)),
            'c' => Some(StressKind::Kernel(KernelKind::Clear)),
            'r' => Some(StressKind::Kernel(KernelKind::Read)),
            'l' => Some(StressKind::SequentialLatency),
            _ => None,
        }
    }
}

/// Peer of the core-to-core test: the last core on CPU memory, the accelerator otherwise
pub fn c2c_peer(ctx: &BenchContext, cores: CoreRange) -> Peer {
    if ctx.region().backing().is_accelerator() {
        Peer::Accelerator
    } else {
        Peer::Core(cores.last)
    }
}

fn write_kernels(
    ctx: &BenchContext,
    cores: CoreRange,
    slice: usize,
    iterations: u64,
    out: &mut dyn Write,
) -> Result<()> {
    for kind in KernelKind::ALL {
        let t = kernels::measure(ctx, cores, kind, slice, iterations)?;
        write!(out, "{}\t", t)?;
        out.flush()?;
    }
    Ok(())
}

/// Two-core snapshot: throughput of every kernel, one core-to-core trip, 64 MiB latency
pub fn overall(ctx: &BenchContext, out: &mut dyn Write) -> Result<()> {
    let cores = CoreRange::new(0, 1);
    info!("Overall benchmark on cores {}..={}", cores.first, cores.last);

    write!(out, "Throughput:\t")?;
    out.flush()?;
    write_kernels(ctx, cores, LARGE_SLICE, 1, out)?;
    writeln!(out)?;

    let trip = c2c::c2c_latency(ctx, cores.first, c2c_peer(ctx, cores))?;
    writeln!(out, "Core-2-core (one trip, 3 hops) latency is {}ns", trip.whole_ns())?;

    pin_current(cores.first, ctx.config().pinning)?;
    write!(out, "Memory latency: ")?;
    writeln!(out, "{}", sequential::latency(ctx, OVERALL_LATENCY_LOG2)?)?;
    Ok(())
}

/// Write, clear and read throughput for every size of [`THROUGHPUT_SWEEP`]
pub fn throughput_sweep(ctx: &BenchContext, out: &mut dyn Write) -> Result<()> {
    for log2 in THROUGHPUT_SWEEP {
        write!(out, "Size: {}\t", nice_size(1 << log2))?;
        out.flush()?;
        write_kernels(ctx, ctx.cores(), 1 << log2, sweep_iterations(log2), out)?;
        writeln!(out)?;
    }
    Ok(())
}

/// Pointer-chasing latency for every size of [`LATENCY_SWEEP`], pinned to the first core
pub fn chase_sweep(ctx: &BenchContext, out: &mut dyn Write) -> Result<()> {
    pin_current(ctx.cores().first, ctx.config().pinning)?;
    for log2 in LATENCY_SWEEP {
        writeln!(out, "{}", chase::latency(ctx, log2)?)?;
    }
    Ok(())
}

/// Sequential latency for every size of [`LATENCY_SWEEP`], pinned to the first core
pub fn sequential_sweep(ctx: &BenchContext, out: &mut dyn Write) -> Result<()> {
    pin_current(ctx.cores().first, ctx.config().pinning)?;
    for log2 in LATENCY_SWEEP {
        writeln!(out, "{}", sequential::latency(ctx, log2)?)?;
    }
    Ok(())
}

/// Round trip between the first core and the last core (or the accelerator)
pub fn core_to_core(ctx: &BenchContext, out: &mut dyn Write) -> Result<()> {
    let cores = ctx.cores();
    let peer = c2c_peer(ctx, cores);
    writeln!(out, "Measuring the latency between core {} and {}...", cores.first, peer)?;
    let trip = c2c::c2c_latency(ctx, cores.first, peer)?;
    writeln!(out, "Core-2-core (one trip, 3 hops) latency: {}ns", trip.whole_ns())?;
    Ok(())
}

/// Run `kind` back to back, printing after every pass, while `keep_going(pass)` holds
pub fn stress<F>(
    ctx: &BenchContext,
    kind: StressKind,
    out: &mut dyn Write,
    mut keep_going: F,
) -> Result<()>
where
    F: FnMut(u64) -> bool,
{
    writeln!(out, "Stressing...")?;
    match kind {
        StressKind::Kernel(kernel) => {
            let mut pass = 0;
            while keep_going(pass) {
                let t =
                    kernels::measure(ctx, ctx.cores(), kernel, LARGE_SLICE, STRESS_ITERATIONS)?;
                writeln!(out, "{}", t)?;
                pass += 1;
            }
            Ok(())
        }
        StressKind::SequentialLatency => {
            pin_current(ctx.cores().first, ctx.config().pinning)?;
            let mut pass = 0;
            let mut written = Ok(());
            if !keep_going(pass) {
                return Ok(());
            }
            sequential::continuous(ctx, |latency| {
                written = writeln!(out, "{}", latency);
                pass += 1;
                if written.is_ok() && keep_going(pass) {
                    ControlFlow::Continue(())
                } else {
                    ControlFlow::Break(())
                }
            })?;
            Ok(written?)
        }
    }
}
