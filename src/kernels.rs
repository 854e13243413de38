//! # Memory access kernels
//!
//! Streaming write, clear and read over per-thread disjoint slices of the region. Each kernel is
//! a [`ThreadKernel`], so the harness times it on all cores at once. Throughput is derived from
//! the averaged minimum: `slice × threads × iterations / elapsed`.
use crate::context::{BenchContext, CoreRange};
use crate::error::{BenchError, Result};
use crate::harness::ThreadKernel;
use crate::primitives::{
    AccessPrimitives, CACHE_LINE_SIZE, CacheLevel, CacheLine, L1_PREFETCH_DISTANCE,
    L2_PREFETCH_DISTANCE, Native, PrefetchTier,
};
use crate::region::MappedRegion;
use crate::timebase::{self, Timebase};
use crate::{gib_per_sec, nice_time};
use log::debug;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Which access pattern a kernel drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelKind {
    /// Full-line vector stores
    Write,
    /// Hardware line zeroing
    Clear,
    /// Full-line vector loads with size-dependent prefetch
    Read,
}

impl KernelKind {
    pub const ALL: [KernelKind; 3] = [KernelKind::Write, KernelKind::Clear, KernelKind::Read];

    pub fn name(&self) -> &'static str {
        match self {
            KernelKind::Write => "write",
            KernelKind::Clear => "clear",
            KernelKind::Read => "read",
        }
    }
}

/// Equal-sized, disjoint slices of the region, one per worker rank
#[derive(Debug, Clone, Copy)]
pub struct SlicePlan<'a> {
    base: NonNull<CacheLine>,
    lines_per_thread: usize,
    threads: usize,
    _region: PhantomData<&'a MappedRegion>,
}

// SAFETY: ranks index disjoint slices, so workers never touch the same line.
unsafe impl Send for SlicePlan<'_> {}
unsafe impl Sync for SlicePlan<'_> {}

impl<'a> SlicePlan<'a> {
    /// Split the first `slice_bytes × threads` bytes of `region`
    pub fn new(region: &'a MappedRegion, slice_bytes: usize, threads: usize) -> Result<Self> {
        if slice_bytes == 0 || slice_bytes % CACHE_LINE_SIZE != 0 {
            return Err(BenchError::invalid_working_set(
                slice_bytes.max(1).ilog2(),
                "slice must be a non-zero multiple of the cache line size",
            ));
        }
        let total = slice_bytes
            .checked_mul(threads)
            .ok_or_else(|| BenchError::region_too_small(usize::MAX, region.len()))?;
        let base = region.range(0, total)?.cast::<CacheLine>();
        Ok(SlicePlan {
            base,
            lines_per_thread: slice_bytes / CACHE_LINE_SIZE,
            threads,
            _region: PhantomData,
        })
    }

    pub fn slice_bytes(&self) -> usize {
        self.lines_per_thread * CACHE_LINE_SIZE
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// `[start, end)` lines owned by `rank`
    pub fn slice(&self, rank: usize) -> (*mut CacheLine, *mut CacheLine) {
        assert!(rank < self.threads, "rank {} outside plan of {}", rank, self.threads);
        // SAFETY: rank < threads, so both ends lie inside the range checked in `new`.
        unsafe {
            let start = self.base.as_ptr().add(rank * self.lines_per_thread);
            (start, start.add(self.lines_per_thread))
        }
    }
}

/// One kernel bound to a slice plan
pub struct MemoryKernel<'a, P: AccessPrimitives = Native> {
    kind: KernelKind,
    plan: SlicePlan<'a>,
    iterations: u64,
    tier: PrefetchTier,
    _primitives: PhantomData<P>,
}

impl<'a, P: AccessPrimitives> MemoryKernel<'a, P> {
    /// `l2_capacity` is the per-thread share used to pick the read prefetch tier
    pub fn new(kind: KernelKind, plan: SlicePlan<'a>, iterations: u64, l2_capacity: usize) -> Self {
        MemoryKernel {
            kind,
            plan,
            iterations,
            tier: PrefetchTier::for_working_set(plan.slice_bytes(), l2_capacity),
            _primitives: PhantomData,
        }
    }

    pub fn tier(&self) -> PrefetchTier {
        self.tier
    }

    /// Bytes moved by all threads in one timed pass
    pub fn bytes_per_pass(&self) -> u64 {
        (self.plan.slice_bytes() * self.plan.threads()) as u64 * self.iterations
    }
}

impl<P: AccessPrimitives> ThreadKernel for MemoryKernel<'_, P> {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn timed_pass(&self, rank: usize) -> u64 {
        let (a, e) = self.plan.slice(rank);
        let start = timebase::now();
        // SAFETY: [a, e) is this rank's slice of a live mapping.
        unsafe {
            match self.kind {
                KernelKind::Write => write_pass::<P>(a, e, self.iterations),
                KernelKind::Clear => clear_pass::<P>(a, e, self.iterations),
                KernelKind::Read => read_pass::<P>(a, e, self.iterations, self.tier),
            }
        }
        timebase::now().wrapping_sub(start)
    }
}

unsafe fn write_pass<P: AccessPrimitives>(a: *mut CacheLine, e: *mut CacheLine, iterations: u64) {
    for _ in 0..iterations {
        let mut d = a;
        while d < e {
            // SAFETY: a <= d < e.
            unsafe {
                P::store_line(d);
                P::touched(d);
                d = d.add(1);
            }
        }
    }
}

unsafe fn clear_pass<P: AccessPrimitives>(a: *mut CacheLine, e: *mut CacheLine, iterations: u64) {
    for _ in 0..iterations {
        let mut d = a;
        while d < e {
            // SAFETY: a <= d < e.
            unsafe {
                P::zero_line(d);
                d = d.add(1);
            }
        }
    }
    P::zero_fence();
}

unsafe fn read_pass<P: AccessPrimitives>(
    a: *mut CacheLine,
    e: *mut CacheLine,
    iterations: u64,
    tier: PrefetchTier,
) {
    let (a, e) = (a.cast_const(), e.cast_const());
    // The tier is matched outside the loops so each variant runs a branch-free inner loop
    match tier {
        PrefetchTier::None => {
            for _ in 0..iterations {
                let mut s = a;
                while s < e {
                    // SAFETY: a <= s < e.
                    unsafe {
                        P::load_line(s);
                        s = s.add(1);
                    }
                }
            }
        }
        PrefetchTier::L1 => {
            for _ in 0..iterations {
                let mut s = a;
                while s < e {
                    P::prefetch(s.wrapping_add(L1_PREFETCH_DISTANCE), CacheLevel::L1);
                    // SAFETY: a <= s < e.
                    unsafe {
                        P::load_line(s);
                        s = s.add(1);
                    }
                }
            }
        }
        PrefetchTier::L1L2 => {
            for _ in 0..iterations {
                let mut s = a;
                while s < e {
                    P::prefetch(s.wrapping_add(L1_PREFETCH_DISTANCE), CacheLevel::L1);
                    P::prefetch(s.wrapping_add(L2_PREFETCH_DISTANCE), CacheLevel::L2);
                    // SAFETY: a <= s < e.
                    unsafe {
                        P::load_line(s);
                        s = s.add(1);
                    }
                }
            }
        }
    }
}

/// Outcome of one kernel run through the harness
#[derive(Debug, Clone, Copy)]
pub struct Throughput {
    pub kind: KernelKind,
    /// Averaged per-thread minimum, in counter ticks
    pub cycles: u64,
    pub elapsed_ns: f64,
    pub gib_per_sec: f64,
}

impl Throughput {
    pub fn new(kind: KernelKind, bytes: u64, cycles: u64, timebase: &Timebase) -> Self {
        let elapsed_ns = timebase.to_ns(cycles as f64);
        Throughput {
            kind,
            cycles,
            elapsed_ns,
            gib_per_sec: gib_per_sec(bytes as f64, elapsed_ns),
        }
    }
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:.3}GB/s",
            self.kind.name(),
            nice_time(self.elapsed_ns),
            self.gib_per_sec
        )
    }
}

/// Run `kind` over `slice_bytes` per thread on `cores`, `iterations` times per timed pass
pub fn measure(
    ctx: &BenchContext,
    cores: CoreRange,
    kind: KernelKind,
    slice_bytes: usize,
    iterations: u64,
) -> Result<Throughput> {
    measure_with::<Native>(ctx, cores, kind, slice_bytes, iterations)
}

/// [`measure`] with an explicit primitive set
pub fn measure_with<P: AccessPrimitives>(
    ctx: &BenchContext,
    cores: CoreRange,
    kind: KernelKind,
    slice_bytes: usize,
    iterations: u64,
) -> Result<Throughput> {
    let threads = cores.count();
    let plan = SlicePlan::new(ctx.region(), slice_bytes, threads)?;
    let l2_capacity = ctx.config().l2_per_thread(threads);
    let kernel = MemoryKernel::<P>::new(kind, plan, iterations, l2_capacity);
    debug!(
        "{} kernel: {} bytes x {} threads x {} iterations, prefetch {:?}",
        kind.name(),
        slice_bytes,
        threads,
        iterations,
        kernel.tier()
    );
    let cycles = ctx.harness().run_on_cores(cores, &kernel)?;
    Ok(Throughput::new(kind, kernel.bytes_per_pass(), cycles, ctx.timebase()))
}
