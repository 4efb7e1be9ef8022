//! RTT probing: short-lived peer-to-peer connections used only to measure
//! latency between waiting candidates.
//!
//! The server side ([`ProbeCoordinator`]) pairs a newly arrived candidate
//! with up to three of the oldest other candidates and orchestrates the
//! `probe_prepare` / `probe_ready` / `probe_start` handshake over the
//! regular signaling path (on a `probe_*` namespace). The measurement
//! itself runs in the initiating browser ([`ProbeRunner`]): five pings at
//! 100 ms cadence over a temporary DataChannel, each echoed as a pong,
//! with a 2-second per-ping timeout. The reported figure is the median
//! successful RTT, or null when every ping timed out.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;
use web_time::{Duration, Instant};

use crate::network::codec::{self, Packet};
use crate::rollback::DataChannel;
use crate::{ProbeId, SubjectId};

/// Maximum probe targets for a newly arrived candidate.
pub const PROBE_TARGETS: usize = 3;

/// Wall-clock deadline after which a probe session is torn down
/// unconditionally.
pub const PROBE_DEADLINE: Duration = Duration::from_secs(15);

/// Number of pings per probe.
const PING_COUNT: usize = 5;

/// Cadence between pings.
const PING_CADENCE: Duration = Duration::from_millis(100);

/// Per-ping timeout.
const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// One in-flight probe session.
#[derive(Debug, Clone)]
pub struct ProbeSession {
    /// Probe identifier (also the signaling namespace suffix).
    pub probe: ProbeId,
    /// The side that opens the DataChannel and sends the pings.
    pub initiator: SubjectId,
    /// The echoing side.
    pub responder: SubjectId,
    started: Instant,
    initiator_ready: bool,
    responder_ready: bool,
}

impl ProbeSession {
    /// Whether both browsers reported their channel set up.
    #[must_use]
    pub fn both_ready(&self) -> bool {
        self.initiator_ready && self.responder_ready
    }
}

/// Server-side bookkeeping for active probes.
#[derive(Debug, Default)]
pub struct ProbeCoordinator {
    active: Mutex<HashMap<ProbeId, ProbeSession>>,
}

impl ProbeCoordinator {
    /// Creates an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks probe targets for a newly arrived candidate: at most
    /// [`PROBE_TARGETS`] of the oldest *other* candidates.
    #[must_use]
    pub fn pick_targets(arrival: &SubjectId, waiting_in_order: &[SubjectId]) -> Vec<SubjectId> {
        waiting_in_order
            .iter()
            .filter(|subject| *subject != arrival)
            .take(PROBE_TARGETS)
            .cloned()
            .collect()
    }

    /// Opens a probe session between two candidates. The arriving
    /// candidate initiates.
    pub fn begin(&self, initiator: SubjectId, responder: SubjectId) -> ProbeId {
        let probe = ProbeId::fresh();
        self.active.lock().insert(
            probe,
            ProbeSession {
                probe,
                initiator,
                responder,
                started: Instant::now(),
                initiator_ready: false,
                responder_ready: false,
            },
        );
        probe
    }

    /// Records a `probe_ready` from one side. Returns the session once
    /// both sides are ready, at which point the caller sends `probe_start`
    /// to the initiator.
    pub fn mark_ready(&self, probe: ProbeId, subject: &SubjectId) -> Option<ProbeSession> {
        let mut active = self.active.lock();
        let session = active.get_mut(&probe)?;
        if &session.initiator == subject {
            session.initiator_ready = true;
        } else if &session.responder == subject {
            session.responder_ready = true;
        } else {
            debug!(%probe, %subject, "probe_ready from a subject outside the session");
            return None;
        }
        session.both_ready().then(|| session.clone())
    }

    /// Consumes a completed probe session.
    pub fn complete(&self, probe: ProbeId) -> Option<ProbeSession> {
        self.active.lock().remove(&probe)
    }

    /// Tears down every session past the 15-second deadline and returns
    /// them for cleanup messaging.
    pub fn expire(&self, now: Instant) -> Vec<ProbeSession> {
        let mut active = self.active.lock();
        let expired: Vec<ProbeId> = active
            .iter()
            .filter(|(_, s)| now.duration_since(s.started) >= PROBE_DEADLINE)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| active.remove(&id))
            .collect()
    }

    /// Number of probes currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.active.lock().len()
    }
}

/// Median of the successful samples; `None` when there are none.
#[must_use]
pub fn median_rtt(samples: &[u32]) -> Option<u32> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    Some(sorted[sorted.len() / 2])
}

/// Progress of a running probe measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeProgress {
    /// Pings are still in flight.
    Running,
    /// All pings resolved; the median successful RTT (or `None`).
    Done(Option<u32>),
}

#[derive(Debug)]
struct PingSlot {
    /// Millisecond timestamp carried in the ping; identifies the pong.
    timestamp_ms: u64,
    sent_at: Instant,
    rtt_ms: Option<u32>,
    timed_out: bool,
}

/// Initiator-side probe measurement over a temporary DataChannel.
///
/// Poll-driven like the game engine: the browser runtime calls
/// [`ProbeRunner::poll`] from its timer until `Done` comes back, then
/// reports the result to the server via `probe_result`.
pub struct ProbeRunner {
    channel: Box<dyn DataChannel>,
    epoch: Instant,
    slots: Vec<PingSlot>,
}

impl ProbeRunner {
    /// Creates a runner over the probe DataChannel. The first poll sends
    /// the first ping.
    #[must_use]
    pub fn new(channel: Box<dyn DataChannel>, now: Instant) -> Self {
        Self {
            channel,
            epoch: now,
            slots: Vec::with_capacity(PING_COUNT),
        }
    }

    /// Answers pings on the responder side. The responder runs only this.
    pub fn echo(channel: &mut dyn DataChannel) {
        for bytes in channel.drain() {
            if let Ok(Packet::Ping { timestamp_ms }) = codec::decode(&bytes) {
                let _ = channel.try_send(&codec::encode(&Packet::Pong { timestamp_ms }));
            }
        }
    }

    /// Drives the measurement forward.
    pub fn poll(&mut self, now: Instant) -> ProbeProgress {
        // Collect pongs; the echoed timestamp identifies the ping slot.
        for bytes in self.channel.drain() {
            if let Ok(Packet::Pong { timestamp_ms }) = codec::decode(&bytes) {
                if let Some(slot) = self.slots.iter_mut().find(|slot| {
                    slot.timestamp_ms == timestamp_ms && slot.rtt_ms.is_none() && !slot.timed_out
                }) {
                    slot.rtt_ms = Some(now.duration_since(slot.sent_at).as_millis() as u32);
                }
            }
        }

        // Time out stale pings.
        for slot in &mut self.slots {
            if slot.rtt_ms.is_none() && now.duration_since(slot.sent_at) >= PING_TIMEOUT {
                slot.timed_out = true;
            }
        }

        // Send the next ping at the 100 ms cadence.
        if self.slots.len() < PING_COUNT {
            let due = self
                .slots
                .last()
                .map_or(true, |last| now.duration_since(last.sent_at) >= PING_CADENCE);
            if due {
                let timestamp_ms = now.duration_since(self.epoch).as_millis() as u64;
                let _ = self
                    .channel
                    .try_send(&codec::encode(&Packet::Ping { timestamp_ms }));
                self.slots.push(PingSlot {
                    timestamp_ms,
                    sent_at: now,
                    rtt_ms: None,
                    timed_out: false,
                });
            }
        }

        let all_sent = self.slots.len() == PING_COUNT;
        let all_resolved = self
            .slots
            .iter()
            .all(|slot| slot.rtt_ms.is_some() || slot.timed_out);
        if all_sent && all_resolved {
            let successes: Vec<u32> = self.slots.iter().filter_map(|slot| slot.rtt_ms).collect();
            ProbeProgress::Done(median_rtt(&successes))
        } else {
            ProbeProgress::Running
        }
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::network::chaos::{ChaosConfig, ChaosLink};

    fn subject(name: &str) -> SubjectId {
        SubjectId::new(name)
    }

    #[test]
    fn targets_are_the_oldest_others() {
        let waiting = vec![
            subject("w1"),
            subject("w2"),
            subject("w3"),
            subject("w4"),
            subject("new"),
        ];
        let targets = ProbeCoordinator::pick_targets(&subject("new"), &waiting);
        assert_eq!(targets, vec![subject("w1"), subject("w2"), subject("w3")]);
    }

    #[test]
    fn ready_handshake_requires_both_sides() {
        let coord = ProbeCoordinator::new();
        let probe = coord.begin(subject("a"), subject("b"));
        assert!(coord.mark_ready(probe, &subject("a")).is_none());
        assert!(coord.mark_ready(probe, &subject("x")).is_none());
        let session = coord.mark_ready(probe, &subject("b")).unwrap();
        assert!(session.both_ready());
    }

    #[test]
    fn expiry_tears_down_stale_probes() {
        let coord = ProbeCoordinator::new();
        let _probe = coord.begin(subject("a"), subject("b"));
        assert!(coord.expire(Instant::now()).is_empty());
        let expired = coord.expire(Instant::now() + PROBE_DEADLINE);
        assert_eq!(expired.len(), 1);
        assert_eq!(coord.in_flight(), 0);
    }

    #[test]
    fn median_semantics() {
        assert_eq!(median_rtt(&[]), None);
        assert_eq!(median_rtt(&[40]), Some(40));
        assert_eq!(median_rtt(&[10, 50, 30]), Some(30));
        assert_eq!(median_rtt(&[10, 20, 30, 40]), Some(30));
    }

    #[test]
    fn probe_measures_over_a_clean_link() {
        let link = ChaosLink::new(ChaosConfig::lossless());
        let (a, mut b) = link.endpoints();
        let start = Instant::now();
        let mut runner = ProbeRunner::new(Box::new(a), start);

        let mut now = start;
        let mut result = None;
        for _ in 0..200 {
            ProbeRunner::echo(&mut b);
            match runner.poll(now) {
                ProbeProgress::Done(rtt) => {
                    result = Some(rtt);
                    break;
                }
                ProbeProgress::Running => {}
            }
            now += Duration::from_millis(50);
            link.advance(1);
        }
        // Same-tick echo: RTT resolves to the poll interval granularity.
        let rtt = result.expect("probe should complete").expect("pings succeeded");
        assert!(rtt <= 100, "rtt was {rtt}");
    }

    #[test]
    fn fully_lost_pings_produce_null_rtt() {
        let link = ChaosLink::new(ChaosConfig::lossless().with_drop_rate(1.1));
        let (a, mut b) = link.endpoints();
        let start = Instant::now();
        let mut runner = ProbeRunner::new(Box::new(a), start);

        let mut now = start;
        let mut outcome = ProbeProgress::Running;
        for _ in 0..200 {
            ProbeRunner::echo(&mut b);
            outcome = runner.poll(now);
            if matches!(outcome, ProbeProgress::Done(_)) {
                break;
            }
            now += Duration::from_millis(100);
            link.advance(1);
        }
        assert_eq!(outcome, ProbeProgress::Done(None));
    }
}
