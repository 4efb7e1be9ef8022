//! Episode-boundary agreement between peers.
//!
//! Peers can detect episode termination on different frames: one side may
//! still be speculating past the end the other side already saw. Before
//! either peer exports data or resets for the next episode, both must agree
//! on the *exact* termination frame — otherwise the exports disagree on row
//! count and the next episode starts from divergent states.
//!
//! The agreement rule is simple: each peer declares its locally detected
//! end frame; the agreed boundary is the maximum of the two (the peer that
//! detected later wins). Frames at or past the boundary are neither stored
//! nor exported.

use web_time::{Duration, Instant};

use crate::network::codec::Packet;
use crate::{Frame, IceState};

/// Where a session currently is in the episode cycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncPhase {
    /// The episode is in progress.
    Running,
    /// A local end was detected; waiting for the peer's declaration and
    /// for trailing inputs to confirm.
    NegotiatingEnd,
    /// The boundary is agreed and exports are in flight; the environment
    /// resets when this phase clears.
    Resetting,
}

/// Per-session episode synchronization state.
#[derive(Debug)]
pub struct EpisodeSync {
    episode: u32,
    phase: SyncPhase,
    has_remote: bool,
    local_end: Option<Frame>,
    remote_end: Option<Frame>,
    synced_termination_frame: Option<Frame>,
    confirmation_deadline: Option<Instant>,
    input_confirmation_timeout: Duration,
}

impl EpisodeSync {
    /// Creates sync state for episode 0.
    ///
    /// `has_remote` is `false` for single-player and bot-only sessions,
    /// where the local declaration is immediately authoritative.
    #[must_use]
    pub fn new(has_remote: bool, input_confirmation_timeout: Duration) -> Self {
        Self {
            episode: 0,
            phase: SyncPhase::Running,
            has_remote,
            local_end: None,
            remote_end: None,
            synced_termination_frame: None,
            confirmation_deadline: None,
            input_confirmation_timeout,
        }
    }

    /// The current episode index.
    #[must_use]
    pub fn episode(&self) -> u32 {
        self.episode
    }

    /// The current phase.
    #[must_use]
    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// The agreed termination frame, once both peers have declared.
    #[must_use]
    pub fn boundary(&self) -> Option<Frame> {
        self.synced_termination_frame
    }

    /// The locally declared end frame, if any.
    #[must_use]
    pub fn local_end(&self) -> Option<Frame> {
        self.local_end
    }

    /// Records the locally detected episode end and returns the declaration
    /// packet to broadcast to the peer.
    ///
    /// Re-declaring within the same episode keeps the first (and only)
    /// local end; detection is edge-triggered.
    pub fn declare_local_end(&mut self, end_frame: Frame) -> Option<Packet> {
        if self.local_end.is_some() {
            return None;
        }
        self.local_end = Some(end_frame);
        self.phase = SyncPhase::NegotiatingEnd;
        self.try_agree();
        Some(Packet::EpisodeReady {
            episode: self.episode,
            end_frame,
        })
    }

    /// The declaration packet to rebroadcast while the boundary exchange
    /// is unsettled. Episode-ready travels over the lossy channel, so the
    /// single edge-triggered send is repeated every tick until the next
    /// episode starts; the receiver de-duplicates.
    #[must_use]
    pub fn rebroadcast(&self) -> Option<Packet> {
        match (self.phase, self.local_end) {
            (SyncPhase::Running, _) | (_, None) => None,
            (_, Some(end_frame)) => Some(Packet::EpisodeReady {
                episode: self.episode,
                end_frame,
            }),
        }
    }

    /// Handles the peer's episode-ready declaration.
    ///
    /// Declarations for other episode indices are stale retransmissions and
    /// are dropped.
    pub fn on_remote_ready(&mut self, episode: u32, end_frame: Frame) {
        if episode != self.episode {
            tracing::debug!(
                got = episode,
                current = self.episode,
                "dropping stale episode-ready declaration"
            );
            return;
        }
        if self.remote_end.is_none() {
            self.remote_end = Some(end_frame);
            self.try_agree();
        }
    }

    fn try_agree(&mut self) {
        if self.synced_termination_frame.is_some() {
            return;
        }
        let agreed = match (self.local_end, self.remote_end, self.has_remote) {
            (Some(local), Some(remote), true) => Some(local.max(remote)),
            (Some(local), _, false) => Some(local),
            _ => None,
        };
        if let Some(boundary) = agreed {
            self.synced_termination_frame = Some(boundary);
            tracing::debug!(episode = self.episode, boundary = %boundary, "episode boundary agreed");
        }
    }

    /// Starts the bounded wait for trailing input confirmation, once the
    /// boundary is agreed.
    pub fn begin_confirmation_wait(&mut self, now: Instant) {
        if self.confirmation_deadline.is_none() {
            self.confirmation_deadline = Some(now + self.input_confirmation_timeout);
        }
    }

    /// Returns `true` once the confirmation wait has run out. Callers
    /// proceed anyway on expiry (force-promotion covers the gap) but log.
    #[must_use]
    pub fn confirmation_expired(&self, now: Instant) -> bool {
        self.confirmation_deadline.is_some_and(|d| now >= d)
    }

    /// Marks exports in flight; the boundary stays pinned until
    /// [`EpisodeSync::clear_after_export`].
    pub fn begin_reset(&mut self) {
        self.phase = SyncPhase::Resetting;
    }

    /// Clears the boundary and advances to the next episode. Must only be
    /// called after the episode export has been handed off — clearing
    /// earlier would let the next episode race the export window.
    pub fn clear_after_export(&mut self) {
        self.episode += 1;
        self.phase = SyncPhase::Running;
        self.local_end = None;
        self.remote_end = None;
        self.synced_termination_frame = None;
        self.confirmation_deadline = None;
    }
}

/// Deadline for the pre-round connection health check.
const HEALTH_GATE_DEADLINE: Duration = Duration::from_secs(10);

/// Outcome of polling the pre-round health gate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GateStatus {
    /// The connection is usable; the round may start.
    Ready,
    /// Still waiting for the connection to become usable.
    Waiting,
    /// The connection entered a terminal state; abort the round.
    Aborted,
    /// The deadline passed without a usable connection; abort the round.
    TimedOut,
}

/// Before each new episode in peer-to-peer mode, the round is gated on a
/// usable connection: ICE connected or completed *and* an open DataChannel.
/// Polled at the tick cadence with a 10-second deadline.
#[derive(Debug, Default)]
pub struct RoundHealthGate {
    started: Option<Instant>,
}

impl RoundHealthGate {
    /// Creates an idle gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Polls the gate. The first poll arms the deadline.
    pub fn poll(&mut self, now: Instant, ice: IceState, channel_open: bool) -> GateStatus {
        let started = *self.started.get_or_insert(now);
        if ice.is_usable() && channel_open {
            self.started = None;
            return GateStatus::Ready;
        }
        if ice.is_terminal() {
            self.started = None;
            return GateStatus::Aborted;
        }
        if now.duration_since(started) >= HEALTH_GATE_DEADLINE {
            self.started = None;
            return GateStatus::TimedOut;
        }
        GateStatus::Waiting
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sync() -> EpisodeSync {
        EpisodeSync::new(true, Duration::from_millis(2000))
    }

    #[test]
    fn boundary_is_max_of_both_declarations() {
        let mut s = sync();
        assert!(s.declare_local_end(Frame::new(448)).is_some());
        assert_eq!(s.boundary(), None);
        s.on_remote_ready(0, Frame::new(450));
        assert_eq!(s.boundary(), Some(Frame::new(450)));

        let mut s = sync();
        s.on_remote_ready(0, Frame::new(430));
        s.declare_local_end(Frame::new(450));
        assert_eq!(s.boundary(), Some(Frame::new(450)));
    }

    #[test]
    fn local_declaration_is_edge_triggered() {
        let mut s = sync();
        assert!(s.declare_local_end(Frame::new(10)).is_some());
        assert!(s.declare_local_end(Frame::new(99)).is_none());
        assert_eq!(s.local_end(), Some(Frame::new(10)));
    }

    #[test]
    fn stale_episode_declarations_are_dropped() {
        let mut s = sync();
        s.on_remote_ready(3, Frame::new(100));
        s.declare_local_end(Frame::new(50));
        assert_eq!(s.boundary(), None);
    }

    #[test]
    fn solo_sessions_agree_immediately() {
        let mut s = EpisodeSync::new(false, Duration::from_millis(2000));
        s.declare_local_end(Frame::new(200));
        assert_eq!(s.boundary(), Some(Frame::new(200)));
    }

    #[test]
    fn clear_advances_episode_and_resets_state() {
        let mut s = sync();
        s.declare_local_end(Frame::new(100));
        s.on_remote_ready(0, Frame::new(100));
        s.begin_reset();
        s.clear_after_export();
        assert_eq!(s.episode(), 1);
        assert_eq!(s.phase(), SyncPhase::Running);
        assert_eq!(s.boundary(), None);
        // The next episode negotiates independently.
        s.declare_local_end(Frame::new(80));
        s.on_remote_ready(1, Frame::new(90));
        assert_eq!(s.boundary(), Some(Frame::new(90)));
    }

    #[test]
    fn confirmation_wait_expires() {
        let mut s = sync();
        let start = Instant::now();
        s.begin_confirmation_wait(start);
        assert!(!s.confirmation_expired(start));
        assert!(s.confirmation_expired(start + Duration::from_millis(2001)));
    }

    #[test]
    fn health_gate_ready_and_terminal() {
        let mut gate = RoundHealthGate::new();
        let now = Instant::now();
        assert_eq!(
            gate.poll(now, IceState::Checking, false),
            GateStatus::Waiting
        );
        assert_eq!(
            gate.poll(now, IceState::Connected, false),
            GateStatus::Waiting
        );
        assert_eq!(gate.poll(now, IceState::Connected, true), GateStatus::Ready);

        let mut gate = RoundHealthGate::new();
        assert_eq!(gate.poll(now, IceState::Failed, false), GateStatus::Aborted);
    }

    #[test]
    fn health_gate_times_out_after_ten_seconds() {
        let mut gate = RoundHealthGate::new();
        let start = Instant::now();
        assert_eq!(gate.poll(start, IceState::New, false), GateStatus::Waiting);
        assert_eq!(
            gate.poll(start + Duration::from_secs(9), IceState::New, false),
            GateStatus::Waiting
        );
        assert_eq!(
            gate.poll(start + Duration::from_secs(10), IceState::New, false),
            GateStatus::TimedOut
        );
    }
}
