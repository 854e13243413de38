//! Reusable N-party rendezvous.
//!
//! Works like [`std::sync::Barrier`] (one generation per release, reusable for every phase) but
//! can be cancelled: a party that fails before it reaches the rendezvous, e.g. because its
//! thread could not be pinned or spawned, releases everyone else with an error instead of leaving
//! them blocked forever.
use crate::error::{BenchError, Result};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct State {
    arrived: usize,
    generation: u64,
    cancelled: bool,
}

#[derive(Debug)]
pub struct Rendezvous {
    parties: usize,
    state: Mutex<State>,
    released: Condvar,
}

impl Rendezvous {
    /// Create a rendezvous released once `parties` threads have called [`Rendezvous::wait`]
    pub fn new(parties: usize) -> Self {
        Rendezvous {
            parties,
            state: Mutex::new(State {
                arrived: 0,
                generation: 0,
                cancelled: false,
            }),
            released: Condvar::new(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until every party of the current generation has arrived
    pub fn wait(&self) -> Result<()> {
        let mut state = self.lock();
        if state.cancelled {
            return Err(BenchError::Cancelled);
        }

        let generation = state.generation;
        state.arrived += 1;
        if state.arrived >= self.parties {
            state.arrived = 0;
            state.generation = generation.wrapping_add(1);
            self.released.notify_all();
            return Ok(());
        }

        while state.generation == generation && !state.cancelled {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if state.generation == generation {
            Err(BenchError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Release all current and future waiters with [`BenchError::Cancelled`]
    pub fn cancel(&self) {
        let mut state = self.lock();
        state.cancelled = true;
        self.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn single_party_never_blocks() {
        let r = Rendezvous::new(1);
        for _ in 0..4 {
            r.wait().unwrap();
        }
    }

    #[test]
    fn no_party_passes_before_all_arrive() {
        const PARTIES: usize = 4;
        const PHASES: usize = 5;
        let r = Rendezvous::new(PARTIES);
        let arrivals = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..PARTIES {
                s.spawn(|| {
                    for phase in 0..PHASES {
                        arrivals.fetch_add(1, Ordering::SeqCst);
                        r.wait().unwrap();
                        // every party of this phase has arrived by now
                        assert!(arrivals.load(Ordering::SeqCst) >= (phase + 1) * PARTIES);
                        // and nobody can be a whole phase ahead
                        assert!(arrivals.load(Ordering::SeqCst) <= (phase + 2) * PARTIES);
                    }
                });
            }
        });
        assert_eq!(arrivals.into_inner(), PARTIES * PHASES);
    }

    #[test]
    fn cancel_releases_waiters() {
        let r = Rendezvous::new(3);
        thread::scope(|s| {
            let waiter = s.spawn(|| r.wait());
            thread::sleep(Duration::from_millis(20));
            r.cancel();
            assert!(matches!(waiter.join().unwrap(), Err(BenchError::Cancelled)));
        });
        assert!(matches!(r.wait(), Err(BenchError::Cancelled)));
    }
}
