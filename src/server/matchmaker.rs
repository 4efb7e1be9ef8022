//! Latency-gated FIFO matchmaking.
//!
//! The waiting pool is an insertion-ordered set of candidates keyed by
//! subject. Matching walks the pool in arrival order and pairs the oldest
//! candidate with the first later candidate whose combined probe RTT stays
//! under the configured bound. Candidates without an RTT estimate (probe
//! failed or gating disabled) match unconditionally — the gate fails open.

use std::collections::HashSet;

use tracing::debug;
use web_time::{Duration, Instant};

use crate::SubjectId;

/// Matches are always pairs.
pub const GROUP_SIZE: usize = 2;

/// A waiting participant and their RTT estimate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// The waiting subject.
    pub subject: SubjectId,
    /// Median probe RTT in milliseconds; `None` if unmeasured or all pings
    /// timed out.
    pub rtt_ms: Option<u32>,
    /// When the candidate entered the pool.
    pub enqueued_at: Instant,
}

/// The waiting pool and match policy.
#[derive(Debug)]
pub struct Matchmaker {
    pool: Vec<Candidate>,
    members: HashSet<SubjectId>,
    max_server_rtt_ms: Option<u32>,
}

impl Matchmaker {
    /// Creates a matchmaker. `max_server_rtt_ms = None` disables the
    /// latency gate.
    #[must_use]
    pub fn new(max_server_rtt_ms: Option<u32>) -> Self {
        Self {
            pool: Vec::new(),
            members: HashSet::new(),
            max_server_rtt_ms,
        }
    }

    /// Adds a candidate to the pool. Re-insertion is idempotent: the
    /// original arrival position and RTT are kept.
    pub fn enqueue(&mut self, subject: SubjectId) -> bool {
        if !self.members.insert(subject.clone()) {
            debug!(%subject, "duplicate waitroom insertion ignored");
            return false;
        }
        self.pool.push(Candidate {
            subject,
            rtt_ms: None,
            enqueued_at: Instant::now(),
        });
        true
    }

    /// Records a probe result for a waiting candidate.
    pub fn set_rtt(&mut self, subject: &SubjectId, rtt_ms: Option<u32>) {
        if let Some(candidate) = self.pool.iter_mut().find(|c| &c.subject == subject) {
            candidate.rtt_ms = rtt_ms;
        }
    }

    /// Removes a candidate (disconnect, wait timeout, exclusion).
    pub fn remove(&mut self, subject: &SubjectId) {
        if self.members.remove(subject) {
            self.pool.retain(|c| &c.subject != subject);
        }
    }

    /// Number of waiting candidates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    /// Whether the pool is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Whether a subject is waiting.
    #[must_use]
    pub fn contains(&self, subject: &SubjectId) -> bool {
        self.members.contains(subject)
    }

    /// Zero-based arrival position of a subject, for waiting-room UI.
    #[must_use]
    pub fn position_of(&self, subject: &SubjectId) -> Option<usize> {
        self.pool.iter().position(|c| &c.subject == subject)
    }

    /// Subjects in arrival order (oldest first), e.g. for probe-target
    /// selection.
    #[must_use]
    pub fn waiting_in_order(&self) -> Vec<SubjectId> {
        self.pool.iter().map(|c| c.subject.clone()).collect()
    }

    fn compatible(&self, a: &Candidate, b: &Candidate) -> bool {
        match (self.max_server_rtt_ms, a.rtt_ms, b.rtt_ms) {
            (Some(max), Some(a_rtt), Some(b_rtt)) => a_rtt + b_rtt <= max,
            // Gating disabled, or either estimate missing: fail open.
            _ => true,
        }
    }

    /// Removes and returns every candidate that has waited longer than
    /// `max_wait`. Callers terminate the returned subjects with a
    /// wait-timeout reason.
    pub fn expire_waiting(&mut self, now: Instant, max_wait: Duration) -> Vec<SubjectId> {
        let expired: Vec<SubjectId> = self
            .pool
            .iter()
            .filter(|c| now.saturating_duration_since(c.enqueued_at) >= max_wait)
            .map(|c| c.subject.clone())
            .collect();
        for subject in &expired {
            self.remove(subject);
        }
        expired
    }

    /// Attempts to form one match, oldest candidates first. Matched
    /// candidates leave the pool.
    pub fn try_match(&mut self) -> Option<[Candidate; GROUP_SIZE]> {
        for i in 0..self.pool.len() {
            for j in (i + 1)..self.pool.len() {
                if self.compatible(&self.pool[i], &self.pool[j]) {
                    // Remove the later index first so the earlier one stays
                    // valid.
                    let second = self.pool.remove(j);
                    let first = self.pool.remove(i);
                    self.members.remove(&first.subject);
                    self.members.remove(&second.subject);
                    debug!(
                        a = %first.subject,
                        b = %second.subject,
                        "match formed"
                    );
                    return Some([first, second]);
                }
            }
        }
        None
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn subject(name: &str) -> SubjectId {
        SubjectId::new(name)
    }

    #[test]
    fn fifo_pairs_oldest_first() {
        let mut mm = Matchmaker::new(None);
        mm.enqueue(subject("a"));
        mm.enqueue(subject("b"));
        mm.enqueue(subject("c"));
        let [first, second] = mm.try_match().unwrap();
        assert_eq!(first.subject, subject("a"));
        assert_eq!(second.subject, subject("b"));
        assert_eq!(mm.len(), 1);
    }

    #[test]
    fn reinsertion_is_idempotent_and_never_self_matches() {
        let mut mm = Matchmaker::new(None);
        assert!(mm.enqueue(subject("a")));
        assert!(!mm.enqueue(subject("a")));
        assert_eq!(mm.len(), 1);
        assert!(mm.try_match().is_none(), "a single subject must not match itself");
    }

    #[test]
    fn rtt_gate_blocks_slow_pairs() {
        let mut mm = Matchmaker::new(Some(150));
        mm.enqueue(subject("a"));
        mm.enqueue(subject("b"));
        mm.set_rtt(&subject("a"), Some(100));
        mm.set_rtt(&subject("b"), Some(100));
        // 100 + 100 > 150: no match.
        assert!(mm.try_match().is_none());

        mm.set_rtt(&subject("b"), Some(50));
        // 100 + 50 <= 150: match.
        assert!(mm.try_match().is_some());
    }

    #[test]
    fn rtt_gate_boundary_is_inclusive() {
        let mut mm = Matchmaker::new(Some(150));
        mm.enqueue(subject("a"));
        mm.enqueue(subject("b"));
        mm.set_rtt(&subject("a"), Some(75));
        mm.set_rtt(&subject("b"), Some(75));
        assert!(mm.try_match().is_some());
    }

    #[test]
    fn null_rtt_fails_open() {
        let mut mm = Matchmaker::new(Some(10));
        mm.enqueue(subject("a"));
        mm.enqueue(subject("b"));
        mm.set_rtt(&subject("a"), Some(500));
        // b's probe failed entirely: the pair is allowed anyway.
        mm.set_rtt(&subject("b"), None);
        assert!(mm.try_match().is_some());
    }

    #[test]
    fn gate_skips_to_a_compatible_later_candidate() {
        let mut mm = Matchmaker::new(Some(100));
        mm.enqueue(subject("a"));
        mm.enqueue(subject("b"));
        mm.enqueue(subject("c"));
        mm.set_rtt(&subject("a"), Some(60));
        mm.set_rtt(&subject("b"), Some(90));
        mm.set_rtt(&subject("c"), Some(30));
        let [first, second] = mm.try_match().unwrap();
        assert_eq!(first.subject, subject("a"));
        assert_eq!(second.subject, subject("c"));
        assert!(mm.contains(&subject("b")));
    }

    #[test]
    fn waiting_expiry_removes_only_overdue_candidates() {
        let mut mm = Matchmaker::new(None);
        mm.enqueue(subject("a"));
        mm.enqueue(subject("b"));
        let max_wait = Duration::from_secs(120);
        assert!(mm.expire_waiting(Instant::now(), max_wait).is_empty());
        let expired = mm.expire_waiting(Instant::now() + max_wait, max_wait);
        assert_eq!(expired.len(), 2);
        assert!(mm.is_empty());
    }

    #[test]
    fn removal_keeps_arrival_order() {
        let mut mm = Matchmaker::new(None);
        mm.enqueue(subject("a"));
        mm.enqueue(subject("b"));
        mm.enqueue(subject("c"));
        mm.remove(&subject("a"));
        assert_eq!(mm.position_of(&subject("b")), Some(0));
        let [first, second] = mm.try_match().unwrap();
        assert_eq!(first.subject, subject("b"));
        assert_eq!(second.subject, subject("c"));
    }
}
