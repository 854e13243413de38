//! # Core-to-core latency
//!
//! Two 64-bit mailboxes in different cache lines. The initiator writes a counter into `ping`,
//! fences, and spins until `pong` echoes it; the responder spins on `ping`, copies what it reads
//! into `pong`, fences, and stops after echoing 0. The initiator counts from `rounds` down to 0,
//! so the whole exchange is timed by the initiator alone.
//!
//! Against the accelerator, the mailboxes are two fixed lines of its memory window and the
//! accelerator itself echoes; no responder thread runs.
use crate::context::BenchContext;
use crate::error::{BenchError, Result};
use crate::primitives::CACHE_LINE_SIZE;
use crate::region::MappedRegion;
use crate::rendezvous::Rendezvous;
use crate::timebase::{self, Timebase};
use crate::workers::spawn_pinned;
use log::{debug, warn};
use std::fmt;
use std::hint::spin_loop;
use std::sync::atomic::{AtomicU64, Ordering, fence};
use std::thread;

/// Offset of the accelerator's echoing mailboxes in its memory window
pub const ACCELERATOR_MAILBOX_OFFSET: usize = 0x80_0000_0080;

/// Distance from `ping` to `pong`
const PONG_OFFSET: usize = CACHE_LINE_SIZE;

/// Value both mailboxes hold before the first round, never sent by the countdown
const PRIMED: u64 = u64::MAX;

/// The other end of the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    /// A responder thread pinned to this core
    Core(usize),
    /// The accelerator, echoing in hardware
    Accelerator,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Core(core) => write!(f, "core {}", core),
            Peer::Accelerator => write!(f, "the FPGA"),
        }
    }
}

/// The two mailboxes of a handshake
#[derive(Debug, Clone, Copy)]
pub struct Mailboxes<'a> {
    ping: &'a AtomicU64,
    pong: &'a AtomicU64,
}

impl<'a> Mailboxes<'a> {
    pub fn new(ping: &'a AtomicU64, pong: &'a AtomicU64) -> Self {
        Mailboxes { ping, pong }
    }

    /// Mailboxes at `offset` and `offset + 128` of `region`
    pub fn in_region(region: &'a MappedRegion, offset: usize) -> Result<Self> {
        let base = region.range(offset, PONG_OFFSET + size_of::<u64>())?;
        if base.as_ptr() as usize % align_of::<AtomicU64>() != 0 {
            return Err(BenchError::region_too_small(offset, region.len()));
        }
        // SAFETY: both words are inside the region, 8-byte aligned, live as long as the region,
        // and only ever accessed atomically while borrowed.
        unsafe {
            Ok(Mailboxes {
                ping: AtomicU64::from_ptr(base.as_ptr().cast()),
                pong: AtomicU64::from_ptr(base.as_ptr().add(PONG_OFFSET).cast()),
            })
        }
    }
}

/// Where the initiator is within one round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing sent yet
    Idle,
    /// Value written to `ping` and fenced
    Sent(u64),
    /// Spinning on `pong`
    Waiting(u64),
    /// `pong` echoed the value
    Acked(u64),
}

/// Timing side of the handshake
#[derive(Debug)]
pub struct Initiator<'a> {
    boxes: Mailboxes<'a>,
    rounds: u64,
    spin_limit: Option<u64>,
    state: HandshakeState,
}

impl<'a> Initiator<'a> {
    /// Count down from `rounds`; `spin_limit` bounds each wait, `None` waits forever
    pub fn new(boxes: Mailboxes<'a>, rounds: u64, spin_limit: Option<u64>) -> Self {
        Initiator {
            boxes,
            rounds,
            spin_limit,
            state: HandshakeState::Idle,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Put both mailboxes in their initial state
    pub fn prime(&self) {
        self.boxes.ping.store(PRIMED, Ordering::Relaxed);
        self.boxes.pong.store(PRIMED, Ordering::Relaxed);
        fence(Ordering::SeqCst);
    }

    /// Write `value` to `ping` and make it globally visible
    pub fn send(&mut self, value: u64) {
        self.boxes.ping.store(value, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.state = HandshakeState::Sent(value);
    }

    /// Read `pong` once; true when it echoes the value last sent
    pub fn poll(&mut self) -> bool {
        let value = match self.state {
            HandshakeState::Sent(v) | HandshakeState::Waiting(v) => v,
            HandshakeState::Acked(_) => return true,
            HandshakeState::Idle => return false,
        };
        if self.boxes.pong.load(Ordering::Relaxed) == value {
            self.state = HandshakeState::Acked(value);
            true
        } else {
            self.state = HandshakeState::Waiting(value);
            false
        }
    }

    fn round(&mut self, value: u64) -> Result<()> {
        self.send(value);
        let mut spins = 0u64;
        while !self.poll() {
            spins += 1;
            if self.spin_limit.is_some_and(|limit| spins > limit) {
                return Err(BenchError::HandshakeBound {
                    rounds: self.rounds - value,
                    spins,
                });
            }
            spin_loop();
        }
        Ok(())
    }

    /// Run every round and return the elapsed counter ticks
    pub fn run(&mut self) -> Result<u64> {
        let start = timebase::now();
        for value in (0..=self.rounds).rev() {
            self.round(value)?;
        }
        Ok(timebase::now().wrapping_sub(start))
    }
}

/// How a responder stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoOutcome {
    /// Echoed 0 after `rounds` distinct non-zero values
    Completed { rounds: u64 },
    /// Gave up on a round or spin bound before seeing 0
    Exhausted { rounds: u64 },
}

/// Echoing side of the handshake
#[derive(Debug)]
pub struct Responder<'a> {
    boxes: Mailboxes<'a>,
    max_rounds: u64,
    spin_limit: Option<u64>,
}

impl<'a> Responder<'a> {
    /// Stop after `max_rounds` distinct non-zero values, or after `spin_limit` reads of an
    /// unchanged value
    pub fn new(boxes: Mailboxes<'a>, max_rounds: u64, spin_limit: Option<u64>) -> Self {
        Responder {
            boxes,
            max_rounds,
            spin_limit,
        }
    }

    pub fn run(&self) -> EchoOutcome {
        let mut rounds = 0u64;
        let mut last = None;
        let mut spins = 0u64;
        loop {
            let v = self.boxes.ping.load(Ordering::Relaxed);
            self.boxes.pong.store(v, Ordering::Relaxed);
            fence(Ordering::SeqCst);
            if v == 0 {
                return EchoOutcome::Completed { rounds };
            }

            if last != Some(v) {
                last = Some(v);
                rounds += 1;
                spins = 0;
                if rounds > self.max_rounds {
                    return EchoOutcome::Exhausted { rounds };
                }
            } else {
                spins += 1;
                if self.spin_limit.is_some_and(|limit| spins > limit) {
                    return EchoOutcome::Exhausted { rounds };
                }
                spin_loop();
            }
        }
    }
}

/// One core-to-core measurement
#[derive(Debug, Clone, Copy)]
pub struct CoreToCore {
    pub peer: Peer,
    /// Ticks for the whole exchange
    pub cycles: u64,
    pub rounds: u64,
    /// Nanoseconds for one trip (half a round trip, 3 coherence hops)
    pub one_way_ns: f64,
}

impl CoreToCore {
    pub fn new(peer: Peer, cycles: u64, rounds: u64, timebase: &Timebase) -> Self {
        CoreToCore {
            peer,
            cycles,
            rounds,
            one_way_ns: timebase.to_ns(cycles as f64) / (2 * rounds.max(1)) as f64,
        }
    }

    /// Whole nanoseconds of one trip, truncated
    pub fn whole_ns(&self) -> u64 {
        self.one_way_ns as u64
    }
}

/// Time `rounds` handshakes between a thread on `core` and `peer`
pub fn c2c_latency(ctx: &BenchContext, core: usize, peer: Peer) -> Result<CoreToCore> {
    let offset = match peer {
        Peer::Core(_) => 0,
        Peer::Accelerator => ACCELERATOR_MAILBOX_OFFSET,
    };
    let boxes = Mailboxes::in_region(ctx.region(), offset)?;
    let rounds = ctx.config().c2c_rounds;
    let pinning = ctx.config().pinning;
    let rendezvous = Rendezvous::new(if matches!(peer, Peer::Core(_)) { 3 } else { 2 });
    debug!("c2c: core {} <-> {}, {} rounds", core, peer, rounds);

    let cycles = thread::scope(|s| {
        let rendezvous = &rendezvous;
        let initiator = spawn_pinned(s, format!("c2c-{core}"), core, pinning, rendezvous, move || {
            let mut initiator = Initiator::new(boxes, rounds, None);
            initiator.prime();
            rendezvous.wait()?;
            initiator.run()
        })?;

        let responder = match peer {
            Peer::Core(peer_core) => {
                let spawned = spawn_pinned(
                    s,
                    format!("c2c-echo-{peer_core}"),
                    peer_core,
                    pinning,
                    rendezvous,
                    move || {
                        rendezvous.wait()?;
                        // the primed value may be echoed once before the first real round
                        Ok(Responder::new(boxes, rounds + 1, None).run())
                    },
                );
                match spawned {
                    Ok(handle) => Some((peer_core, handle)),
                    Err(e) => {
                        rendezvous.cancel();
                        let _ = initiator.join();
                        return Err(e);
                    }
                }
            }
            Peer::Accelerator => None,
        };

        let released = rendezvous.wait();
        let timed = initiator
            .join()
            .unwrap_or(Err(BenchError::WorkerPanicked { core }));
        let echoed = responder.map(|(peer_core, handle)| {
            handle
                .join()
                .unwrap_or(Err(BenchError::WorkerPanicked { core: peer_core }))
        });

        // whichever side failed first cancelled the other, report the original error
        if matches!(timed, Err(BenchError::Cancelled)) {
            if let Some(Err(e)) = echoed {
                return Err(e);
            }
        }
        let cycles = timed?;
        match echoed {
            Some(Err(e)) => return Err(e),
            Some(Ok(EchoOutcome::Exhausted { rounds })) => {
                warn!("Responder stopped after {} rounds without seeing 0", rounds)
            }
            _ => {}
        }
        released?;
        Ok(cycles)
    })?;

    Ok(CoreToCore::new(peer, cycles, rounds, ctx.timebase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{BenchConfig, MemoryKind};
    use crate::primitives::CacheLine;
    use crate::workers::Pinning;
    use std::sync::atomic::AtomicBool;

    #[repr(C)]
    #[derive(Default)]
    struct Lines {
        ping: AtomicU64,
        _pad: [u64; 15],
        pong: AtomicU64,
    }

    #[test]
    fn pair_completes_every_round() {
        let lines = Lines::default();
        let boxes = Mailboxes::new(&lines.ping, &lines.pong);
        let mut initiator = Initiator::new(boxes, 1000, Some(1 << 32));
        initiator.prime();

        let outcome = thread::scope(|s| {
            let responder = s.spawn(|| Responder::new(boxes, 1001, None).run());
            initiator.run().unwrap();
            responder.join().unwrap()
        });

        assert_eq!(initiator.state(), HandshakeState::Acked(0));
        match outcome {
            EchoOutcome::Completed { rounds } => assert!(rounds <= 1001),
            other => panic!("responder did not complete: {:?}", other),
        }
        assert_eq!(lines.pong.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn responder_does_not_stop_before_zero() {
        let lines = Lines::default();
        let boxes = Mailboxes::new(&lines.ping, &lines.pong);
        let stop = AtomicBool::new(false);
        let mut acked = 0u64;
        Initiator::new(boxes, 0, None).prime();

        let outcome = thread::scope(|s| {
            // peer that keeps counting up and never sends 0
            let peer = s.spawn(|| {
                for v in 1..=5_000u64 {
                    lines.ping.store(v, Ordering::Relaxed);
                    fence(Ordering::SeqCst);
                    while lines.pong.load(Ordering::Relaxed) != v {
                        if stop.load(Ordering::Relaxed) {
                            return;
                        }
                        spin_loop();
                    }
                    acked += 1;
                }
            });
            let outcome = Responder::new(boxes, 1001, None).run();
            stop.store(true, Ordering::Relaxed);
            peer.join().unwrap();
            outcome
        });

        assert_eq!(outcome, EchoOutcome::Exhausted { rounds: 1002 });
        assert!(acked >= 1001);
    }

    #[test]
    fn silent_peer_trips_spin_bound() {
        let lines = Lines::default();
        let boxes = Mailboxes::new(&lines.ping, &lines.pong);
        let mut initiator = Initiator::new(boxes, 10, Some(10_000));
        assert!(matches!(
            initiator.run(),
            Err(BenchError::HandshakeBound { rounds: 0, .. })
        ));
        assert_eq!(initiator.state(), HandshakeState::Waiting(10));

        lines.ping.store(7, Ordering::SeqCst);
        assert_eq!(
            Responder::new(boxes, 100, Some(10_000)).run(),
            EchoOutcome::Exhausted { rounds: 1 }
        );
    }

    #[test]
    fn primed_mailboxes_do_not_ack_a_round() {
        let lines = Lines::default();
        let boxes = Mailboxes::new(&lines.ping, &lines.pong);
        let mut initiator = Initiator::new(boxes, 1, Some(10_000));
        initiator.prime();
        assert!(matches!(
            initiator.run(),
            Err(BenchError::HandshakeBound { rounds: 0, .. })
        ));
        assert_eq!(initiator.state(), HandshakeState::Waiting(1));
    }

    #[test]
    fn handshake_steps_through_every_state() {
        let lines = Lines::default();
        let boxes = Mailboxes::new(&lines.ping, &lines.pong);
        let mut initiator = Initiator::new(boxes, 5, None);
        initiator.prime();
        assert_eq!(initiator.state(), HandshakeState::Idle);
        assert!(!initiator.poll());

        initiator.send(5);
        assert_eq!(initiator.state(), HandshakeState::Sent(5));
        assert_eq!(lines.ping.load(Ordering::SeqCst), 5);

        assert!(!initiator.poll());
        assert_eq!(initiator.state(), HandshakeState::Waiting(5));

        lines.pong.store(5, Ordering::SeqCst);
        assert!(initiator.poll());
        assert_eq!(initiator.state(), HandshakeState::Acked(5));
    }

    #[test]
    fn mailboxes_sit_on_separate_lines() {
        let region = MappedRegion::anonymous(1 << 16).unwrap();
        let boxes = Mailboxes::in_region(&region, 0).unwrap();
        let ping = boxes.ping as *const AtomicU64 as usize;
        let pong = boxes.pong as *const AtomicU64 as usize;
        assert_eq!(pong - ping, size_of::<CacheLine>());
        assert!(Mailboxes::in_region(&region, ACCELERATOR_MAILBOX_OFFSET).is_err());
    }

    #[test]
    fn threads_measure_a_round_trip() {
        let config = BenchConfig {
            memory: MemoryKind::Anonymous,
            cpu_region_len: Some(1 << 16),
            pinning: Pinning::Skip,
            c2c_rounds: 200,
            ..BenchConfig::default()
        };
        let ctx = BenchContext::new(
            config,
            MappedRegion::anonymous(1 << 16).unwrap(),
            Timebase::from_rate(1.0),
        );
        let result = c2c_latency(&ctx, 0, Peer::Core(1)).unwrap();
        assert_eq!(result.rounds, 200);
        assert!(result.cycles > 0);
        assert_eq!(result.one_way_ns, result.cycles as f64 / 400.0);
    }

    #[test]
    fn one_way_time_matches_platform_divisor() {
        // 100 MHz counter, 1000 rounds: one trip is cycles / 200 ns
        let r = CoreToCore::new(Peer::Accelerator, 123_400, 1000, &Timebase::from_rate(0.1));
        assert!((r.one_way_ns - 617.0).abs() < 1e-9);
        let r = CoreToCore::new(Peer::Accelerator, 123_499, 1000, &Timebase::from_rate(0.1));
        assert_eq!(r.whole_ns(), 617);
    }
}
