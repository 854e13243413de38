//! Pinned worker threads and the group of handles a benchmark invocation waits on.
use crate::error::{BenchError, Result};
use crate::rendezvous::Rendezvous;
use log::{debug, warn};
use std::thread::{self, Scope, ScopedJoinHandle};

/// Whether worker threads must be bound to their core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pinning {
    /// Bind to exactly one logical core, failing the benchmark if the OS refuses
    #[default]
    Strict,
    /// Leave placement to the scheduler (tests, hosts with restricted cpusets)
    Skip,
}

/// Bind the calling thread to `core`
pub fn pin_current(core: usize, pinning: Pinning) -> Result<()> {
    if pinning == Pinning::Skip {
        return Ok(());
    }
    if core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
        Ok(())
    } else {
        Err(BenchError::Affinity { core })
    }
}

/// Spawn a named worker bound to `core`.
///
/// The worker pins itself before running `body`; if that fails it cancels `rendezvous` so that
/// no other party waits for it.
pub fn spawn_pinned<'scope, 'env, T, F>(
    scope: &'scope Scope<'scope, 'env>,
    name: String,
    core: usize,
    pinning: Pinning,
    rendezvous: &'env Rendezvous,
    body: F,
) -> Result<ScopedJoinHandle<'scope, Result<T>>>
where
    T: Send + 'scope,
    F: FnOnce() -> Result<T> + Send + 'scope,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn_scoped(scope, move || {
            if let Err(e) = pin_current(core, pinning) {
                rendezvous.cancel();
                return Err(e);
            }

            if thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max)
                .is_err()
            {
                warn!("Couldn't set worker '{}' to maximum thread priority", name);
            }

            debug!("Worker '{}' starting", name);
            let result = body();
            debug!("Worker '{}' stopping", name);
            result
        })
        .map_err(|source| BenchError::Spawn { core, source })
}

/// Handles of the workers spawned for one benchmark invocation
pub struct WorkerGroup<'scope, T> {
    handles: Vec<(usize, ScopedJoinHandle<'scope, Result<T>>)>,
}

impl<'scope, T> WorkerGroup<'scope, T> {
    pub fn new() -> Self {
        WorkerGroup {
            handles: Vec::new(),
        }
    }

    pub fn add(&mut self, core: usize, handle: ScopedJoinHandle<'scope, Result<T>>) {
        self.handles.push((core, handle));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Join every worker, in spawn order
    pub fn wait(self) -> Vec<Result<T>> {
        self.handles
            .into_iter()
            .map(|(core, handle)| {
                handle.join().unwrap_or_else(|_| {
                    warn!("Worker on core {} panicked", core);
                    Err(BenchError::WorkerPanicked { core })
                })
            })
            .collect()
    }
}

impl WorkerGroup<'_, u64> {
    /// Join every worker and average their results, truncating.
    ///
    /// A worker that failed on its own is reported ahead of the peers it cancelled.
    pub fn average(self) -> Result<u64> {
        let results = self.wait();
        let count = results.len().max(1) as u128;
        let mut sum = 0u128;
        let mut cancelled = None;
        for result in results {
            match result {
                Ok(cycles) => sum += cycles as u128,
                Err(BenchError::Cancelled) => cancelled = Some(BenchError::Cancelled),
                Err(e) => return Err(e),
            }
        }
        match cancelled {
            Some(e) => Err(e),
            None => Ok((sum / count) as u64),
        }
    }
}

impl<T> Default for WorkerGroup<'_, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_truncates() {
        let rendezvous = Rendezvous::new(1);
        let avg = thread::scope(|s| {
            let mut group = WorkerGroup::new();
            for (core, value) in [(0, 10u64), (1, 11), (2, 11)] {
                let name = format!("avg-{core}");
                let handle =
                    spawn_pinned(s, name, core, Pinning::Skip, &rendezvous, move || Ok(value))
                        .unwrap();
                group.add(core, handle);
            }
            assert_eq!(group.len(), 3);
            group.average()
        });
        assert_eq!(avg.unwrap(), 10);
    }

    #[test]
    fn worker_error_propagates() {
        let rendezvous = Rendezvous::new(1);
        let result = thread::scope(|s| {
            let mut group = WorkerGroup::new();
            let ok = spawn_pinned(s, "ok".into(), 0, Pinning::Skip, &rendezvous, || Ok(5u64));
            let bad = spawn_pinned(s, "bad".into(), 1, Pinning::Skip, &rendezvous, || {
                Err(BenchError::Affinity { core: 1 })
            });
            group.add(0, ok.unwrap());
            group.add(1, bad.unwrap());
            group.average()
        });
        assert!(matches!(result, Err(BenchError::Affinity { core: 1 })));
    }

    #[test]
    fn strict_pinning_to_an_allowed_core() {
        let Some(core) = core_affinity::get_core_ids().and_then(|ids| ids.first().copied()) else {
            return;
        };
        thread::spawn(move || pin_current(core.id, Pinning::Strict))
            .join()
            .unwrap()
            .unwrap();
    }

    #[test]
    fn pinning_failure_cancels_rendezvous() {
        let rendezvous = Rendezvous::new(2);
        let result = thread::scope(|s| {
            let handle = spawn_pinned(s, "nowhere".into(), 1023, Pinning::Strict, &rendezvous, || {
                Ok(0u64)
            })
            .unwrap();
            let waited = rendezvous.wait();
            assert!(matches!(waited, Err(BenchError::Cancelled)));
            handle.join().unwrap()
        });
        assert!(matches!(result, Err(BenchError::Affinity { core }) if core == 1023));
    }
}
