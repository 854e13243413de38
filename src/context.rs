//! Run configuration and the immutable context every engine receives.
use crate::error::Result;
use crate::harness::Harness;
use crate::region::{Backing, GIB, MappedRegion};
use crate::timebase::Timebase;
use crate::trials::WarmupPolicy;
use crate::workers::Pinning;
use log::info;
use std::ops::RangeInclusive;
use std::path::PathBuf;

/// Largest working set a single thread is given
pub const MAX_SLICE: usize = 64 << 20;

/// Threads the CPU memory region is sized for by default
const DEFAULT_REGION_THREADS: usize = 48;

/// Inclusive range of logical cores, `first..=last`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreRange {
    pub first: usize,
    pub last: usize,
}

impl CoreRange {
    pub fn new(first: usize, last: usize) -> Self {
        CoreRange { first, last }
    }

    pub fn single(core: usize) -> Self {
        CoreRange::new(core, core)
    }

    /// Number of cores in the range (the caller keeps `last >= first`)
    pub fn count(&self) -> usize {
        self.last.saturating_sub(self.first) + 1
    }

    pub fn iter(&self) -> RangeInclusive<usize> {
        self.first..=self.last
    }
}

/// Which memory a run measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryKind {
    /// Accelerator memory window
    #[default]
    Accelerator,
    /// CPU memory on 1 GiB huge pages
    HugePages,
    /// CPU memory on regular pages
    Anonymous,
}

/// Everything a run is parameterized by
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub cores: CoreRange,
    pub memory: MemoryKind,
    /// Device node exposing the accelerator memory
    pub device: PathBuf,
    /// Virtual address the accelerator window is mapped at
    pub device_address: usize,
    /// Length of the accelerator window
    pub device_len: usize,
    /// Length of the CPU memory region, `None` sizes it from the thread count
    pub cpu_region_len: Option<usize>,
    /// L2 capacity shared by all measured cores
    pub l2_total: usize,
    /// Nominal core clock used to express latencies in core cycles
    pub core_ghz: f64,
    pub warmup: WarmupPolicy,
    pub pinning: Pinning,
    /// Round trips per core-to-core measurement
    pub c2c_rounds: u64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            cores: CoreRange::single(0),
            memory: MemoryKind::default(),
            device: PathBuf::from("/dev/fpgamem"),
            device_address: 0x1000_0000_0000,
            device_len: 1 << 40,
            cpu_region_len: None,
            l2_total: 16 << 20,
            core_ghz: 2.0,
            warmup: WarmupPolicy::default(),
            pinning: Pinning::default(),
            c2c_rounds: 1000,
        }
    }
}

impl BenchConfig {
    pub fn threads(&self) -> usize {
        self.cores.count()
    }

    /// L2 capacity left to each of `threads` threads sharing it
    pub fn l2_per_thread(&self, threads: usize) -> usize {
        self.l2_total / threads.max(1)
    }

    pub fn backing(&self) -> Backing {
        match self.memory {
            MemoryKind::Accelerator => Backing::Accelerator {
                device: self.device.clone(),
                address: self.device_address,
            },
            MemoryKind::HugePages => Backing::HugePages,
            MemoryKind::Anonymous => Backing::Anonymous,
        }
    }

    /// Bytes to map: the whole accelerator window, or [`MAX_SLICE`] per thread rounded up to
    /// whole gigabytes
    pub fn region_len(&self) -> usize {
        match self.memory {
            MemoryKind::Accelerator => self.device_len,
            _ => self.cpu_region_len.unwrap_or_else(|| {
                let threads = self.threads().max(DEFAULT_REGION_THREADS);
                (threads * MAX_SLICE).div_ceil(GIB) * GIB
            }),
        }
    }
}

/// Immutable state shared by every engine of a run: configuration, mapped region and timebase
#[derive(Debug)]
pub struct BenchContext {
    config: BenchConfig,
    region: MappedRegion,
    timebase: Timebase,
}

impl BenchContext {
    pub fn new(config: BenchConfig, region: MappedRegion, timebase: Timebase) -> Self {
        BenchContext {
            config,
            region,
            timebase,
        }
    }

    /// Map the configured region and calibrate the timebase
    pub fn provision(config: BenchConfig) -> Result<Self> {
        let region = MappedRegion::map(config.backing(), config.region_len())?;
        let timebase = Timebase::calibrate();
        info!(
            "Counter runs at {:.4} cycles/ns, {} thread(s) on cores {}..={}",
            timebase.cycles_per_ns(),
            config.threads(),
            config.cores.first,
            config.cores.last
        );
        Ok(BenchContext::new(config, region, timebase))
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn region(&self) -> &MappedRegion {
        &self.region
    }

    pub fn timebase(&self) -> &Timebase {
        &self.timebase
    }

    pub fn cores(&self) -> CoreRange {
        self.config.cores
    }

    pub fn harness(&self) -> Harness {
        Harness {
            warmup: self.config.warmup,
            pinning: self.config.pinning,
        }
    }
}
