//! # Sequential latency
//!
//! Latency of a linear scan over the working set, one 64-bit load per cache line. The loads of a
//! step are OR-ed together so they stay live without depending on each other: this measures
//! streaming latency, not dependent-load latency. Baseline correction and minimum-of-trials work
//! as in [`crate::chase`].
use crate::Latency;
use crate::chase::{MIN_LOG2_SIZE, UNROLL, baseline};
use crate::context::BenchContext;
use crate::error::{BenchError, Result};
use crate::primitives::{CACHE_LINE_SIZE, CacheLine, keep_live};
use crate::timebase;
use crate::trials::min_after_warmup;
use log::debug;
use std::ops::ControlFlow;
use std::ptr;

/// Window scanned by the continuous mode
pub const CONTINUOUS_LOG2_SIZE: u32 = 26;

/// A baseline-corrected scan over the first `len` lines of the region
struct Scan<'a> {
    ctx: &'a BenchContext,
    lines: *const CacheLine,
    log2_size: u32,
    len: usize,
    base: u64,
}

impl<'a> Scan<'a> {
    fn new(ctx: &'a BenchContext, log2_size: u32) -> Result<Self> {
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
        let lines = ctx.region().range(0, bytes)?.cast::<CacheLine>().as_ptr();
        let len = bytes / CACHE_LINE_SIZE;
        let base = min_after_warmup(|| baseline((len / UNROLL) as u64));
        Ok(Scan {
            ctx,
            lines,
            log2_size,
            len,
            base,
        })
    }

    fn pass(&self) -> u64 {
        let start = timebase::now();
        let mut o = 0u64;
        for i in (0..self.len).step_by(UNROLL) {
            // SAFETY: i + 7 < len because len is a multiple of UNROLL.
            unsafe {
                let c = self.lines.add(i).cast_mut();
                o |= ptr::read_volatile(CacheLine::slot(c, 0));
                o |= ptr::read_volatile(CacheLine::slot(c.add(1), 0));
                o |= ptr::read_volatile(CacheLine::slot(c.add(2), 0));
                o |= ptr::read_volatile(CacheLine::slot(c.add(3), 0));
                o |= ptr::read_volatile(CacheLine::slot(c.add(4), 0));
                o |= ptr::read_volatile(CacheLine::slot(c.add(5), 0));
                o |= ptr::read_volatile(CacheLine::slot(c.add(6), 0));
                o |= ptr::read_volatile(CacheLine::slot(c.add(7), 0));
            }
            keep_live(o);
        }
        timebase::now().wrapping_sub(start)
    }

    fn measure(&self) -> Latency {
        let measured = min_after_warmup(|| self.pass());
        debug!(
            "sequential 2^{}: {} lines, base {} measured {}",
            self.log2_size, self.len, self.base, measured
        );
        Latency::from_cycles(
            1 << self.log2_size,
            measured,
            self.base,
            self.len as u64,
            self.ctx.timebase(),
            self.ctx.config().core_ghz,
        )
    }
}

/// Streaming latency over a working set of `2^log2_size` bytes at the start of the region.
///
/// Runs on the calling thread, which the caller pins.
pub fn latency(ctx: &BenchContext, log2_size: u32) -> Result<Latency> {
    Ok(Scan::new(ctx, log2_size)?.measure())
}

/// Measure the [`CONTINUOUS_LOG2_SIZE`] window over and over, handing every result to
/// `on_result` until it breaks. The baseline is taken once.
pub fn continuous<F>(ctx: &BenchContext, mut on_result: F) -> Result<()>
where
    F: FnMut(&Latency) -> ControlFlow<()>,
{
    let scan = Scan::new(ctx, CONTINUOUS_LOG2_SIZE)?;
    loop {
        if on_result(&scan.measure()).is_break() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{BenchConfig, MemoryKind};
    use crate::region::MappedRegion;
    use crate::timebase::Timebase;
    use crate::workers::Pinning;

    fn context(len: usize) -> BenchContext {
        let config = BenchConfig {
            memory: MemoryKind::Anonymous,
            cpu_region_len: Some(len),
            pinning: Pinning::Skip,
            ..BenchConfig::default()
        };
        BenchContext::new(config, MappedRegion::anonymous(len).unwrap(), Timebase::calibrate())
    }

    #[test]
    fn scan_reports_requested_size() {
        let ctx = context(1 << 20);
        let lat = latency(&ctx, 16).unwrap();
        assert_eq!(lat.size, 1 << 16);
        assert!(lat.ns.is_finite());
    }

    #[test]
    fn scan_needs_region_and_minimum_size() {
        let ctx = context(1 << 20);
        assert!(matches!(latency(&ctx, 8), Err(BenchError::InvalidWorkingSet { .. })));
        assert!(matches!(latency(&ctx, 21), Err(BenchError::RegionTooSmall { .. })));
    }

    #[test]
    fn continuous_mode_repeats_until_told_to_stop() {
        let ctx = context(1 << CONTINUOUS_LOG2_SIZE);
        let mut seen = Vec::new();
        continuous(&ctx, |lat| {
            seen.push(lat.size);
            if seen.len() == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .unwrap();
        assert_eq!(seen, vec![1 << CONTINUOUS_LOG2_SIZE; 3]);
    }
}
