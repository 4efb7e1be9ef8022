//! Deterministic network-condition simulation.
//!
//! A [`ChaosLink`] connects two [`DataChannel`] endpoints through an
//! in-memory link that drops, delays, and duplicates packets according to
//! a seeded PRNG. The same seed reproduces the same packet fate sequence
//! on every run, which makes loss- and latency-scenario tests exact
//! instead of flaky.
//!
//! Time is modeled in link ticks: the test advances the link clock in step
//! with the engines' tick loops, and delayed packets become visible to
//! `drain` once their delivery tick is reached.

use std::cell::RefCell;
use std::rc::Rc;

use crate::rng::Pcg32;
use crate::rollback::{ChannelFull, DataChannel};
use crate::IceState;

/// Network fault model for a [`ChaosLink`].
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    /// Probability a packet is silently dropped.
    pub drop_rate: f64,
    /// Delivery delay range in link ticks (uniform).
    pub delay_ticks: std::ops::Range<u32>,
    /// Probability a delivered packet is also duplicated.
    pub duplicate_rate: f64,
    /// PRNG seed; the same seed reproduces the same fate sequence.
    pub seed: u64,
}

impl ChaosConfig {
    /// A perfect link: no loss, no delay, no duplication.
    #[must_use]
    pub fn lossless() -> Self {
        Self {
            drop_rate: 0.0,
            delay_ticks: 0..1,
            duplicate_rate: 0.0,
            seed: 0,
        }
    }

    /// Sets the drop probability.
    #[must_use]
    pub fn with_drop_rate(mut self, rate: f64) -> Self {
        self.drop_rate = rate;
        self
    }

    /// Sets the delivery delay range in link ticks.
    #[must_use]
    pub fn with_delay(mut self, ticks: std::ops::Range<u32>) -> Self {
        self.delay_ticks = ticks;
        self
    }

    /// Sets the duplication probability.
    #[must_use]
    pub fn with_duplicate_rate(mut self, rate: f64) -> Self {
        self.duplicate_rate = rate;
        self
    }

    /// Sets the PRNG seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Link delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChaosStats {
    /// Packets handed to `try_send` on either side.
    pub sent: u64,
    /// Packets dropped by the fault model.
    pub dropped: u64,
    /// Packets delivered to a `drain` call.
    pub delivered: u64,
    /// Extra copies injected by duplication.
    pub duplicated: u64,
}

#[derive(Debug)]
struct InFlight {
    deliver_at: u64,
    bytes: Vec<u8>,
}

#[derive(Debug)]
struct LinkState {
    cfg: ChaosConfig,
    rng: Pcg32,
    tick: u64,
    /// Packets in flight toward endpoint A / endpoint B.
    to_a: Vec<InFlight>,
    to_b: Vec<InFlight>,
    stats: ChaosStats,
    open: bool,
    ice: IceState,
}

impl LinkState {
    fn enqueue(&mut self, to_a: bool, bytes: &[u8]) {
        self.stats.sent += 1;
        if self.rng.chance(self.cfg.drop_rate) {
            self.stats.dropped += 1;
            return;
        }
        let delay = u64::from(self.rng.gen_range(self.cfg.delay_ticks.clone()));
        let copies = if self.rng.chance(self.cfg.duplicate_rate) {
            self.stats.duplicated += 1;
            2
        } else {
            1
        };
        for copy in 0..copies {
            let packet = InFlight {
                deliver_at: self.tick + delay + copy,
                bytes: bytes.to_vec(),
            };
            if to_a {
                self.to_a.push(packet);
            } else {
                self.to_b.push(packet);
            }
        }
    }

    fn deliverable(&mut self, to_a: bool) -> Vec<Vec<u8>> {
        let tick = self.tick;
        let queue = if to_a { &mut self.to_a } else { &mut self.to_b };
        let mut out = Vec::new();
        let mut remaining = Vec::new();
        for packet in queue.drain(..) {
            if packet.deliver_at <= tick {
                out.push(packet.bytes);
            } else {
                remaining.push(packet);
            }
        }
        *queue = remaining;
        self.stats.delivered += out.len() as u64;
        out
    }
}

/// A simulated peer-to-peer link. Single-threaded by design: both engines
/// of a test run in the same thread, exactly like the real engines run in
/// their own browser event loops.
#[derive(Debug, Clone)]
pub struct ChaosLink {
    state: Rc<RefCell<LinkState>>,
}

impl ChaosLink {
    /// Creates a link with the given fault model.
    #[must_use]
    pub fn new(cfg: ChaosConfig) -> Self {
        let rng = Pcg32::seed_from_u64(cfg.seed);
        Self {
            state: Rc::new(RefCell::new(LinkState {
                cfg,
                rng,
                tick: 0,
                to_a: Vec::new(),
                to_b: Vec::new(),
                stats: ChaosStats::default(),
                open: true,
                ice: IceState::Connected,
            })),
        }
    }

    /// Returns the two endpoints of the link (A side, B side).
    #[must_use]
    pub fn endpoints(&self) -> (ChaosEndpoint, ChaosEndpoint) {
        (
            ChaosEndpoint {
                state: self.state.clone(),
                is_a: true,
            },
            ChaosEndpoint {
                state: self.state.clone(),
                is_a: false,
            },
        )
    }

    /// Advances the link clock by `ticks`.
    pub fn advance(&self, ticks: u64) {
        self.state.borrow_mut().tick += ticks;
    }

    /// Severs the link: nothing is delivered anymore and the ICE state
    /// turns terminal.
    pub fn sever(&self) {
        let mut state = self.state.borrow_mut();
        state.open = false;
        state.ice = IceState::Failed;
        state.to_a.clear();
        state.to_b.clear();
    }

    /// Current delivery counters.
    #[must_use]
    pub fn stats(&self) -> ChaosStats {
        self.state.borrow().stats
    }
}

/// One side of a [`ChaosLink`].
#[derive(Debug)]
pub struct ChaosEndpoint {
    state: Rc<RefCell<LinkState>>,
    is_a: bool,
}

impl DataChannel for ChaosEndpoint {
    fn try_send(&mut self, bytes: &[u8]) -> Result<(), ChannelFull> {
        let mut state = self.state.borrow_mut();
        if !state.open {
            // A severed link swallows packets like a closed DataChannel.
            return Ok(());
        }
        // A sends toward B and vice versa.
        let to_a = !self.is_a;
        state.enqueue(to_a, bytes);
        Ok(())
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        let mut state = self.state.borrow_mut();
        if !state.open {
            return Vec::new();
        }
        let is_a = self.is_a;
        state.deliverable(is_a)
    }

    fn is_open(&self) -> bool {
        self.state.borrow().open
    }

    fn ice_state(&self) -> IceState {
        self.state.borrow().ice
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lossless_link_delivers_in_same_tick() {
        let link = ChaosLink::new(ChaosConfig::lossless());
        let (mut a, mut b) = link.endpoints();
        a.try_send(&[1, 2, 3]).unwrap();
        assert_eq!(b.drain(), vec![vec![1, 2, 3]]);
        assert!(a.drain().is_empty());
    }

    #[test]
    fn delay_holds_packets_until_their_tick() {
        let link = ChaosLink::new(ChaosConfig::lossless().with_delay(3..4));
        let (mut a, mut b) = link.endpoints();
        a.try_send(&[9]).unwrap();
        assert!(b.drain().is_empty());
        link.advance(2);
        assert!(b.drain().is_empty());
        link.advance(1);
        assert_eq!(b.drain(), vec![vec![9]]);
    }

    #[test]
    fn drop_rate_one_drops_everything() {
        let link = ChaosLink::new(ChaosConfig::lossless().with_drop_rate(1.1));
        let (mut a, mut b) = link.endpoints();
        for _ in 0..10 {
            a.try_send(&[0]).unwrap();
        }
        link.advance(10);
        assert!(b.drain().is_empty());
        assert_eq!(link.stats().dropped, 10);
    }

    #[test]
    fn same_seed_same_fate() {
        let run = |seed: u64| {
            let link = ChaosLink::new(
                ChaosConfig::lossless()
                    .with_drop_rate(0.5)
                    .with_seed(seed),
            );
            let (mut a, mut b) = link.endpoints();
            for i in 0..50u8 {
                a.try_send(&[i]).unwrap();
            }
            link.advance(10);
            b.drain()
        };
        assert_eq!(run(7), run(7));
        assert_ne!(run(7), run(8));
    }

    #[test]
    fn severed_link_goes_terminal() {
        let link = ChaosLink::new(ChaosConfig::lossless());
        let (mut a, mut b) = link.endpoints();
        a.try_send(&[1]).unwrap();
        link.sever();
        assert!(b.drain().is_empty());
        assert!(!a.is_open());
        assert!(a.ice_state().is_terminal());
    }
}
