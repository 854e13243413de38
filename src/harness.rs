//! # Harness
//!
//! Runs a [`ThreadKernel`] on every core of a range at the same time. One worker is spawned and
//! pinned per core; the workers and the orchestrating thread share a rendezvous of
//! `threads + 1` parties. Each of the [`PHASES`] phases starts with everybody meeting at the
//! rendezvous, so no worker enters its timed region before all its peers are ready. Every worker
//! reduces its phases to a minimum and the orchestrator averages those minima.
use crate::context::CoreRange;
use crate::error::Result;
use crate::rendezvous::Rendezvous;
use crate::trials::{self, PHASES, WarmupPolicy};
use crate::workers::{Pinning, WorkerGroup, spawn_pinned};
use log::debug;
use std::thread;

/// Per-thread work function timed by the harness
pub trait ThreadKernel: Sync {
    /// Short name, used for worker thread names
    fn name(&self) -> &str;

    /// Run the whole timed body once for worker `rank` and return the elapsed counter ticks
    fn timed_pass(&self, rank: usize) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Harness {
    pub warmup: WarmupPolicy,
    pub pinning: Pinning,
}

impl Harness {
    /// Run `kernel` on every core of `cores` and return the average of the per-worker minima
    pub fn run_on_cores<K: ThreadKernel>(&self, cores: CoreRange, kernel: &K) -> Result<u64> {
        let rendezvous = Rendezvous::new(cores.count() + 1);
        debug!(
            "Running '{}' on cores {}..={} ({} parties)",
            kernel.name(),
            cores.first,
            cores.last,
            rendezvous.parties()
        );

        thread::scope(|s| {
            let mut workers = WorkerGroup::new();
            for (rank, core) in cores.iter().enumerate() {
                let rendezvous = &rendezvous;
                let spawned = spawn_pinned(
                    s,
                    format!("{}-{}", kernel.name(), core),
                    core,
                    self.pinning,
                    rendezvous,
                    move || self.worker(rank, kernel, rendezvous),
                );
                match spawned {
                    Ok(handle) => workers.add(core, handle),
                    Err(e) => {
                        rendezvous.cancel();
                        workers.wait();
                        return Err(e);
                    }
                }
            }

            let released = (0..PHASES).try_for_each(|_| rendezvous.wait());
            let average = workers.average()?;
            released.map(|()| average)
        })
    }

    fn worker<K: ThreadKernel>(
        &self,
        rank: usize,
        kernel: &K,
        rendezvous: &Rendezvous,
    ) -> Result<u64> {
        let mut samples = [0u64; PHASES];
        for sample in samples.iter_mut() {
            rendezvous.wait()?;
            *sample = kernel.timed_pass(rank);
        }
        Ok(trials::min_of(&samples, self.warmup).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BenchError;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Kernel returning a scripted cycle count per rank and phase
    struct ScriptedKernel {
        script: Vec<[u64; PHASES]>,
        phase: Vec<AtomicUsize>,
    }

    impl ScriptedKernel {
        fn new(script: Vec<[u64; PHASES]>) -> Self {
            let phase = script.iter().map(|_| AtomicUsize::new(0)).collect();
            ScriptedKernel { script, phase }
        }
    }

    impl ThreadKernel for ScriptedKernel {
        fn name(&self) -> &str {
            "scripted"
        }

        fn timed_pass(&self, rank: usize) -> u64 {
            let phase = self.phase[rank].fetch_add(1, Ordering::SeqCst);
            self.script[rank][phase]
        }
    }

    fn unpinned(warmup: WarmupPolicy) -> Harness {
        Harness {
            warmup,
            pinning: Pinning::Skip,
        }
    }

    #[test]
    fn single_thread_keeps_minimum_of_all_phases() {
        let kernel = ScriptedKernel::new(vec![[100, 400, 300, 350]]);
        let cycles = unpinned(WarmupPolicy::KeepAll)
            .run_on_cores(CoreRange::single(0), &kernel)
            .unwrap();
        assert_eq!(cycles, 100);
        assert_eq!(kernel.phase[0].load(Ordering::SeqCst), PHASES);
    }

    #[test]
    fn single_thread_can_exclude_warmup_phase() {
        let kernel = ScriptedKernel::new(vec![[100, 400, 300, 350]]);
        let cycles = unpinned(WarmupPolicy::DiscardFirst)
            .run_on_cores(CoreRange::single(0), &kernel)
            .unwrap();
        assert_eq!(cycles, 300);
    }

    #[test]
    fn per_thread_minima_are_averaged() {
        let kernel = ScriptedKernel::new(vec![
            [900, 100, 120, 130],
            [900, 205, 200, 210],
            [900, 301, 330, 340],
        ]);
        let cycles = unpinned(WarmupPolicy::KeepAll)
            .run_on_cores(CoreRange::new(4, 6), &kernel)
            .unwrap();
        // (100 + 200 + 301) / 3, truncated
        assert_eq!(cycles, 200);
    }

    /// Records, per phase, how many workers had entered it when each one started timing
    struct StartGate {
        threads: usize,
        entered: Vec<AtomicUsize>,
        phase: Vec<AtomicUsize>,
        violations: Mutex<Vec<(usize, usize)>>,
    }

    impl ThreadKernel for StartGate {
        fn name(&self) -> &str {
            "gate"
        }

        fn timed_pass(&self, rank: usize) -> u64 {
            let phase = self.phase[rank].fetch_add(1, Ordering::SeqCst);
            self.entered[phase].fetch_add(1, Ordering::SeqCst);
            // a peer still in the previous phase would mean the rendezvous let us through early
            for peer in &self.phase {
                if peer.load(Ordering::SeqCst) < phase {
                    self.violations.lock().unwrap().push((rank, phase));
                }
            }
            std::thread::yield_now();
            (self.threads * 10 + rank) as u64
        }
    }

    #[test]
    fn no_worker_runs_ahead_of_its_peers() {
        let threads = 4;
        let kernel = StartGate {
            threads,
            entered: (0..PHASES).map(|_| AtomicUsize::new(0)).collect(),
            phase: (0..threads).map(|_| AtomicUsize::new(0)).collect(),
            violations: Mutex::new(Vec::new()),
        };
        unpinned(WarmupPolicy::KeepAll)
            .run_on_cores(CoreRange::new(0, threads - 1), &kernel)
            .unwrap();
        assert!(kernel.violations.lock().unwrap().is_empty());
        assert!(
            kernel
                .entered
                .iter()
                .all(|n| n.load(Ordering::SeqCst) == threads)
        );
    }

    #[test]
    fn constant_time_kernel_scales_rate_with_threads() {
        struct Fixed;
        impl ThreadKernel for Fixed {
            fn name(&self) -> &str {
                "fixed"
            }
            fn timed_pass(&self, _rank: usize) -> u64 {
                1_000
            }
        }

        let harness = unpinned(WarmupPolicy::KeepAll);
        let slice = 1 << 20;
        let one = harness.run_on_cores(CoreRange::single(0), &Fixed).unwrap();
        let two = harness.run_on_cores(CoreRange::new(0, 1), &Fixed).unwrap();
        let rate = |threads: usize, cycles: u64| (slice * threads) as f64 / cycles as f64;
        assert!(rate(2, two) >= rate(1, one));
    }

    #[test]
    fn unpinnable_core_fails_without_hanging() {
        let kernel = ScriptedKernel::new(vec![[1; PHASES], [1; PHASES]]);
        let harness = Harness {
            warmup: WarmupPolicy::KeepAll,
            pinning: Pinning::Strict,
        };
        let result = harness.run_on_cores(CoreRange::new(1022, 1023), &kernel);
        assert!(matches!(result, Err(BenchError::Affinity { .. })));
    }
}
