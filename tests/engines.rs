use membench_rs::c2c::{self, Peer};
use membench_rs::harness::{Harness, ThreadKernel};
use membench_rs::kernels::{self, KernelKind, MemoryKernel, SlicePlan};
use membench_rs::primitives::Native;
use membench_rs::region::MappedRegion;
use membench_rs::suite::{self, StressKind};
use membench_rs::trials::{PHASES, WarmupPolicy};
use membench_rs::workers::Pinning;
use membench_rs::{BenchConfig, BenchContext, CoreRange, MemoryKind, Timebase, chase, sequential};
use std::sync::Mutex;

fn anonymous_context(cores: CoreRange, len: usize) -> BenchContext {
    let config = BenchConfig {
        cores,
        memory: MemoryKind::Anonymous,
        cpu_region_len: Some(len),
        pinning: Pinning::Skip,
        c2c_rounds: 200,
        ..BenchConfig::default()
    };
    let region = MappedRegion::map(config.backing(), config.region_len()).unwrap();
    BenchContext::new(config, region, Timebase::calibrate())
}

#[test]
fn write_kernel_end_to_end() {
    let ctx = anonymous_context(CoreRange::single(0), 4 << 20);
    let t = kernels::measure(&ctx, ctx.cores(), KernelKind::Write, 1 << 20, 4).unwrap();
    assert!(t.cycles > 0);
    assert!(t.gib_per_sec.is_finite() && t.gib_per_sec > 0.0);

    // every lane of the slice holds the write pattern afterwards
    let base = ctx.region().as_ptr().cast::<f32>();
    let floats = unsafe { std::slice::from_raw_parts(base, (1 << 20) / 4) };
    for lane in floats.chunks_exact(4) {
        assert_eq!(lane, [1.0, 2.0, 3.0, 4.0]);
    }
}

/// Forwards to a real kernel and keeps every phase's ticks
struct Recorded<K> {
    inner: K,
    samples: Mutex<Vec<u64>>,
}

impl<K: ThreadKernel> ThreadKernel for Recorded<K> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn timed_pass(&self, rank: usize) -> u64 {
        let ticks = self.inner.timed_pass(rank);
        self.samples.lock().unwrap().push(ticks);
        ticks
    }
}

#[test]
fn single_write_thread_reports_minimum_after_warmup() {
    let region = MappedRegion::anonymous(16 << 20).unwrap();
    let plan = SlicePlan::new(&region, 16 << 20, 1).unwrap();
    let kernel = Recorded {
        inner: MemoryKernel::<Native>::new(KernelKind::Write, plan, 2, 16 << 20),
        samples: Mutex::new(Vec::new()),
    };
    let harness = Harness {
        warmup: WarmupPolicy::DiscardFirst,
        pinning: Pinning::Skip,
    };

    let cycles = harness.run_on_cores(CoreRange::single(0), &kernel).unwrap();

    let samples = kernel.samples.into_inner().unwrap();
    assert_eq!(samples.len(), PHASES);
    assert_eq!(Some(cycles), samples[1..].iter().copied().min());
}

#[test]
fn all_kernels_on_two_threads() {
    let ctx = anonymous_context(CoreRange::new(0, 1), 8 << 20);
    for kind in KernelKind::ALL {
        let t = kernels::measure(&ctx, ctx.cores(), kind, 1 << 20, 2).unwrap();
        assert_eq!(t.kind, kind);
        assert!(t.to_string().starts_with(kind.name()));
    }
}

#[test]
fn core_to_core_between_two_threads() {
    let ctx = anonymous_context(CoreRange::new(0, 1), 1 << 20);
    let trip = c2c::c2c_latency(&ctx, 0, Peer::Core(1)).unwrap();
    assert_eq!(trip.rounds, 200);
    assert!(trip.one_way_ns > 0.0);

    let mut out = Vec::new();
    suite::core_to_core(&ctx, &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("Measuring the latency between core 0 and core 1..."));
    assert!(text.contains("Core-2-core (one trip, 3 hops) latency: "));
}

#[test]
fn stress_stops_when_told() {
    let ctx = anonymous_context(CoreRange::single(0), 64 << 20);
    let mut out = Vec::new();
    suite::stress(&ctx, StressKind::Kernel(KernelKind::Read), &mut out, |pass| pass < 2).unwrap();
    suite::stress(&ctx, StressKind::SequentialLatency, &mut out, |pass| pass < 2).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines.len(), 6);
    assert_eq!(lines[0], "Stressing...");
    assert!(lines[1].starts_with("read "));
    assert_eq!(lines[3], "Stressing...");
    assert!(lines[4].starts_with("Size:"));
}

#[test]
#[ignore = "needs a quiet machine with a last-level cache well below 64 MiB"]
fn sequential_beats_chasing_beyond_the_cache() {
    let ctx = anonymous_context(CoreRange::single(0), 64 << 20);
    let seq = sequential::latency(&ctx, 26).unwrap();
    let dependent = chase::latency(&ctx, 26).unwrap();
    assert!(seq.ns <= dependent.ns, "sequential {} vs chasing {}", seq, dependent);
}
