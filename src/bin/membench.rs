//! Memory and core-to-core benchmark for the CPU and accelerator memory of a heterogeneous node.
//!
//! Runs every selected mode in a fixed order (overall, throughput, stress, core-to-core, chasing
//! latency, sequential latency) and prints one human-readable line per measurement.
use anyhow::{Context, Result, bail};
use clap::Parser;
use log::error;
use membench_rs::suite::{self, StressKind};
use membench_rs::trials::WarmupPolicy;
use membench_rs::{BenchConfig, BenchContext, CoreRange, MemoryKind};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;

// use faster/smaller `mimalloc` allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "membench", about = "Memory subsystem and core-to-core benchmark", version)]
struct Cli {
    /// Overall benchmark on cores 0 and 1
    #[arg(short = 'b', long)]
    overall: bool,

    /// First core to run on
    #[arg(short = 'f', long, default_value_t = 0)]
    first: usize,

    /// Last core to run on
    #[arg(short = 'l', long, default_value_t = 0)]
    last: usize,

    /// Sequential latency sweep
    #[arg(short = 's', long)]
    sequential: bool,

    /// Pointer-chasing latency sweep
    #[arg(short = 't', long)]
    chasing: bool,

    /// Write, clear and read throughput sweep
    #[arg(short = 'm', long)]
    throughput: bool,

    /// Core-to-core round-trip latency
    #[arg(short = 'c', long)]
    c2c: bool,

    /// Use CPU memory on 1 GiB huge pages instead of the accelerator window
    #[arg(short = 'p', long, conflicts_with = "anonymous")]
    hugepages: bool,

    /// Use CPU memory on regular pages instead of the accelerator window
    #[arg(long)]
    anonymous: bool,

    /// Loop one kernel forever: w(rite), c(lear), r(ead) or l(atency)
    #[arg(short = 'r', long, value_name = "KIND")]
    stress: Option<char>,

    /// Drop the first timed pass of every throughput measurement
    #[arg(long)]
    discard_warmup: bool,

    /// Device node of the accelerator memory
    #[arg(long, default_value = "/dev/fpgamem")]
    device: PathBuf,

    /// Nominal core clock in GHz, used to report latencies in core cycles
    #[arg(long, default_value_t = 2.0)]
    core_ghz: f64,

    /// L2 capacity shared by the measured cores, in MiB
    #[arg(long, default_value_t = 16)]
    l2_total_mib: usize,

    /// Round trips per core-to-core measurement
    #[arg(long, default_value_t = 1000)]
    rounds: u64,
}

impl Cli {
    fn config(&self) -> Result<BenchConfig> {
        if self.last < self.first {
            bail!("last core {} is below first core {}", self.last, self.first);
        }
        let memory = if self.hugepages {
            MemoryKind::HugePages
        } else if self.anonymous {
            MemoryKind::Anonymous
        } else {
            MemoryKind::Accelerator
        };
        Ok(BenchConfig {
            cores: CoreRange::new(self.first, self.last),
            memory,
            device: self.device.clone(),
            l2_total: self.l2_total_mib << 20,
            core_ghz: self.core_ghz,
            warmup: if self.discard_warmup {
                WarmupPolicy::DiscardFirst
            } else {
                WarmupPolicy::KeepAll
            },
            c2c_rounds: self.rounds,
            ..BenchConfig::default()
        })
    }

    fn stress_kind(&self) -> Result<Option<StressKind>> {
        self.stress
            .map(|letter| {
                StressKind::from_letter(letter).with_context(|| {
                    format!("unknown stress kind '{}', expected w, c, r or l", letter)
                })
            })
            .transpose()
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = cli.config()?;
    let stress = cli.stress_kind()?;
    let cores = config.cores;
    let ctx = BenchContext::provision(config).context("failed to provision benchmark memory")?;

    let stdout = io::stdout();
    let mut out = stdout.lock();

    if cli.throughput || stress.is_some() {
        writeln!(
            out,
            "Using {} thread(s), from CPU {} to CPU {}...",
            cores.count(),
            cores.first,
            cores.last
        )?;
    }
    if cli.overall {
        suite::overall(&ctx, &mut out).context("overall benchmark failed")?;
    }
    if cli.throughput {
        suite::throughput_sweep(&ctx, &mut out).context("throughput sweep failed")?;
    }
    if let Some(kind) = stress {
        suite::stress(&ctx, kind, &mut out, |_| true).context("stress run failed")?;
    }
    if cli.c2c {
        suite::core_to_core(&ctx, &mut out).context("core-to-core measurement failed")?;
    }
    if cli.chasing {
        suite::chase_sweep(&ctx, &mut out).context("chasing latency sweep failed")?;
    }
    if cli.sequential {
        suite::sequential_sweep(&ctx, &mut out).context("sequential latency sweep failed")?;
    }
    out.flush()?;
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        error!("{:#}", e);
        eprintln!("membench: {:#}", e);
        process::exit(1);
    }
}
