//! # Pointer chasing
//!
//! Latency of dependent loads. Every cache line of the working set holds, in slot 0, the index
//! of the next line to visit, so each load's address depends on the previous load's value and no
//! two loads can overlap. The visiting order comes from the recurrence
//! `next = (13 * cur + 7) mod L`, which for a power-of-two `L` is a single cycle through all
//! lines (increment odd, multiplier minus one divisible by 4). That order is fixed and
//! reproducible; it is checked before every run rather than assumed.
//!
//! A baseline pass of the same step count running only no-ops is subtracted to remove loop and
//! counter overhead.
use crate::context::BenchContext;
use crate::error::{BenchError, Result};
use crate::primitives::{CACHE_LINE_SIZE, CacheLine, keep_live, nop8};
use crate::timebase;
use crate::trials::min_after_warmup;
use crate::Latency;
use log::debug;
use std::ptr;

/// Accesses per loop step
pub const UNROLL: usize = 8;

/// Smallest working set: one unrolled step of lines
pub const MIN_LOG2_SIZE: u32 = 10;

/// Working sets below this are traversed repeatedly to get a measurable duration
pub const REPEAT_LOG2_SIZE: u32 = 12;

const MULTIPLIER: usize = 13;
const INCREMENT: usize = 7;

/// Line that follows `cur` in a table of `len` lines (`len` a power of two)
#[inline(always)]
pub fn next_line(cur: usize, len: usize) -> usize {
    cur.wrapping_mul(MULTIPLIER).wrapping_add(INCREMENT) & (len - 1)
}

/// Check that the recurrence visits all `len` lines before returning to line 0
pub fn verify_full_cycle(len: usize) -> Result<()> {
    let mut seen = vec![false; len];
    let mut cur = 0;
    for step in 0..len {
        if seen[cur] {
            return Err(BenchError::DegenerateCycle { len, visited: step });
        }
        seen[cur] = true;
        cur = next_line(cur, len);
    }
    if cur != 0 {
        return Err(BenchError::DegenerateCycle { len, visited: len });
    }
    Ok(())
}

/// Passes over the working set per trial
pub fn iterations_for(log2_size: u32) -> u64 {
    if log2_size < REPEAT_LOG2_SIZE {
        1 << (REPEAT_LOG2_SIZE - log2_size)
    } else {
        1
    }
}

/// Lines in a working set of `2^log2_size` bytes, validated against the region
fn working_set_lines(ctx: &BenchContext, log2_size: u32) -> Result<usize> {
    if log2_size < MIN_LOG2_SIZE {
        return Err(BenchError::invalid_working_set(
            log2_size,
            "smaller than one unrolled step of cache lines",
        ));
    }
    if log2_size >= usize::BITS {
        return Err(BenchError::invalid_working_set(log2_size, "wider than the address space"));
    }
    let bytes = 1usize << log2_size;
    ctx.region().range(0, bytes)?;
    Ok(bytes / CACHE_LINE_SIZE)
}

/// Link every line of `lines[..len]` to its successor
///
/// # Safety
/// `lines` must point to `len` writable cache lines.
pub unsafe fn build_chain(lines: *mut CacheLine, len: usize) {
    let mut cur = 0;
    for _ in 0..len {
        let next = next_line(cur, len);
        // SAFETY: cur < len.
        unsafe { ptr::write_volatile(CacheLine::slot(lines.add(cur), 0), next as u64) };
        cur = next;
    }
}

#[inline(always)]
unsafe fn follow(lines: *mut CacheLine, cur: usize) -> usize {
    // SAFETY: every slot 0 of the chain holds an index below its length.
    unsafe { ptr::read_volatile(CacheLine::slot(lines.add(cur), 0)) as usize }
}

/// Follow the chain for `steps` unrolled steps and return elapsed ticks
///
/// # Safety
/// `lines` must hold a chain built by [`build_chain`].
unsafe fn chase(lines: *mut CacheLine, steps: u64) -> u64 {
    let start = timebase::now();
    let mut o = 0;
    for _ in 0..steps {
        // SAFETY: forwarded caller guarantee.
        unsafe {
            o = follow(lines, o);
            o = follow(lines, o);
            o = follow(lines, o);
            o = follow(lines, o);
            o = follow(lines, o);
            o = follow(lines, o);
            o = follow(lines, o);
            o = follow(lines, o);
        }
        keep_live(o as u64);
    }
    timebase::now().wrapping_sub(start)
}

/// Ticks spent by `steps` steps of eight no-ops
pub(crate) fn baseline(steps: u64) -> u64 {
    let start = timebase::now();
    for _ in 0..steps {
        nop8();
    }
    timebase::now().wrapping_sub(start)
}

/// Dependent-load latency over a working set of `2^log2_size` bytes at the start of the region.
///
/// Runs on the calling thread, which the caller pins.
pub fn latency(ctx: &BenchContext, log2_size: u32) -> Result<Latency> {
    let len = working_set_lines(ctx, log2_size)?;
    verify_full_cycle(len)?;

    let its = iterations_for(log2_size);
    let accesses = its * len as u64;
    let steps = accesses / UNROLL as u64;

    let base = min_after_warmup(|| baseline(steps));

    let lines = ctx.region().as_ptr().cast::<CacheLine>();
    // SAFETY: the region holds at least `len` lines, checked above.
    unsafe { build_chain(lines, len) };
    // SAFETY: chain built just above.
    let measured = min_after_warmup(|| unsafe { chase(lines, steps) });

    debug!(
        "chase 2^{}: {} lines x {} its, base {} measured {}",
        log2_size, len, its, base, measured
    );
    Ok(Latency::from_cycles(
        1 << log2_size,
        measured,
        base,
        accesses,
        ctx.timebase(),
        ctx.config().core_ghz,
    ))
}
