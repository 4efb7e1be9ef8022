//! The rollback-capable game engine.
//!
//! One `RollbackEngine` runs per human participant per session and drives a
//! deterministic, step-synchronous environment loop. Remote inputs arrive
//! late, so the engine steps *speculatively* with predicted actions and
//! rolls the simulator back when a real input contradicts a prediction.
//!
//! Every tick executes the same pipeline:
//!
//! 1. Drain staged network packets into the input buffers. Staging on
//!    arrival is mandatory — packets that land during rollback replay must
//!    not be applied mid-replay, or the replay itself would trigger a
//!    nested rollback.
//! 2. Resolve the earliest misprediction discovered while draining and
//!    execute the rollback (restore snapshot, replay forward in one
//!    synchronous batch).
//! 3. Advance the current frame: confirmed actions where available,
//!    predictions otherwise, bot inference locally.
//! 4. Record the frame speculatively.
//! 5. Promote frames whose actions are confirmed for every human, hashing
//!    each promoted frame's state.
//! 6. Flush queued state hashes to the peer and compare against received
//!    ones; mismatches escalate to the resync path, never crash.
//!
//! The engine is synchronous and poll-driven: ticks come from a
//! background-safe [`TickSource`](crate::focus::TickSource), and all
//! network I/O goes through the non-blocking [`DataChannel`] seam.

use std::collections::{BTreeMap, VecDeque};

use serde_json::Value;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};
use web_time::{Duration, Instant};

use crate::env::{Action, ActionMap, BotPolicy, Environment};
use crate::episode_sync::{EpisodeSync, GateStatus, RoundHealthGate, SyncPhase};
use crate::error::EngineError;
use crate::focus::{FocusTracker, FocusVerdict};
use crate::frame_info::{EpisodeExport, FrameRecord, SessionStatus, TerminationReason};
use crate::input_buffer::{InputBuffer, InsertResult};
use crate::network::codec::{self, InputPacket, Packet, INPUT_REDUNDANCY};
use crate::recorder::EpisodeRecorder;
use crate::state_hash::{hash_state, HashHistory, StateHash};
use crate::{Frame, IceState, PlayerId};

/// Frames of state history kept for rollback recovery. The window must
/// strictly exceed the deepest rollback the network can produce.
const SNAPSHOT_WINDOW: i32 = 150;

/// Ticks the stale-input fence stays up after an episode reset. Stragglers
/// from the previous episode arrive within a round trip; one second is
/// ample, and redundancy re-delivers anything legitimate dropped meanwhile.
const STALE_FENCE_TICKS: u32 = 20;

/// Error returned by [`DataChannel::try_send`] when the outbound buffer is
/// full. The caller decides whether the payload is droppable (inputs) or
/// must be requeued (state hashes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFull;

/// Non-blocking, unreliable peer-to-peer transport seam.
///
/// The browser runtime implements this over a WebRTC DataChannel; tests
/// use deterministic in-memory channels. Messages may be dropped,
/// duplicated, and reordered — the engine's protocol tolerates all three.
pub trait DataChannel {
    /// Attempts to send one packet. `Err(ChannelFull)` means the outbound
    /// buffer is congested; the packet was not sent.
    fn try_send(&mut self, bytes: &[u8]) -> Result<(), ChannelFull>;

    /// Returns all packets received since the last call.
    fn drain(&mut self) -> Vec<Vec<u8>>;

    /// Whether the underlying channel is open.
    fn is_open(&self) -> bool {
        true
    }

    /// Current ICE state of the peer connection.
    fn ice_state(&self) -> IceState {
        IceState::Connected
    }
}

/// Channel for sessions without a remote peer: sends vanish, nothing
/// arrives.
#[derive(Debug, Default)]
pub struct NullChannel;

impl DataChannel for NullChannel {
    fn try_send(&mut self, _bytes: &[u8]) -> Result<(), ChannelFull> {
        Ok(())
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        Vec::new()
    }
}

/// Static configuration of one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The player this engine runs for.
    pub local_player: PlayerId,
    /// The remote human, if any.
    pub remote_player: Option<PlayerId>,
    /// Action substituted when no input is available (backgrounded tabs,
    /// first-frame prediction).
    pub idle_action: Action,
    /// Episode truncation after this many steps, if set.
    pub max_steps: Option<u32>,
    /// How many episodes the session runs.
    pub num_episodes: u32,
    /// How long to wait for trailing input confirmation at an episode
    /// boundary before force-promoting.
    pub input_confirmation_timeout: Duration,
    /// Focus-loss timeout in milliseconds; `0` disables the check.
    pub focus_loss_timeout_ms: u64,
    /// Cadence of RTT pings, in frames.
    pub ping_interval_frames: u32,
}

impl EngineConfig {
    /// Config for a two-human session with the usual defaults.
    #[must_use]
    pub fn two_player(local_player: PlayerId, remote_player: PlayerId) -> Self {
        Self {
            local_player,
            remote_player: Some(remote_player),
            idle_action: 0,
            max_steps: None,
            num_episodes: 1,
            input_confirmation_timeout: Duration::from_millis(2000),
            focus_loss_timeout_ms: 30_000,
            ping_interval_frames: 60,
        }
    }

    /// Config for a single-human session (optionally against bots).
    #[must_use]
    pub fn single_player(local_player: PlayerId) -> Self {
        Self {
            local_player,
            remote_player: None,
            idle_action: 0,
            max_steps: None,
            num_episodes: 1,
            input_confirmation_timeout: Duration::from_millis(2000),
            focus_loss_timeout_ms: 30_000,
            ping_interval_frames: 60,
        }
    }
}

/// Notable things that happened during a tick. Handling them is up to the
/// session driver.
#[derive(Debug)]
pub enum EngineEvent {
    /// An episode reached its agreed boundary; the export must be delivered
    /// (acked) and then acknowledged via
    /// [`RollbackEngine::export_delivered`].
    EpisodeComplete {
        /// Episode index.
        episode: u32,
        /// The episode's export bundle.
        export: EpisodeExport,
    },
    /// All configured episodes completed; the session is over.
    SessionComplete {
        /// Number of cleanly completed episodes.
        completed_episodes: u32,
    },
    /// Peer state hashes disagreed at a confirmed frame.
    HashMismatch {
        /// The frame whose hashes differ.
        frame: Frame,
        /// This peer's hash.
        local: StateHash,
        /// The remote peer's hash.
        remote: StateHash,
    },
    /// The confirmation wait at an episode boundary expired; trailing
    /// frames were force-promoted.
    ConfirmationTimeout {
        /// The agreed boundary.
        boundary: Frame,
    },
    /// Frames below the boundary were force-promoted without peer
    /// acknowledgment.
    ForcePromoted {
        /// How many records were promoted.
        count: u32,
    },
    /// A rollback could not be executed (no snapshot, or snapshots
    /// unsupported); the session is marked divergent.
    RollbackFailed {
        /// The rollback target that could not be reached.
        target: Frame,
    },
    /// The local player exceeded the focus-loss timeout. The driver must
    /// end the session with a partial export.
    FocusTimeout {
        /// The offending player.
        player: PlayerId,
    },
    /// The pre-round health check aborted; the session cannot continue.
    RoundAborted {
        /// `true` if the 10-second deadline expired, `false` if the
        /// connection reached a terminal state.
        timed_out: bool,
    },
}

/// Summary of one [`RollbackEngine::tick`] call.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Frames advanced during this tick (0 while backgrounded or between
    /// episodes; more than 1 during boundary catch-up).
    pub advanced: u32,
    /// Rollbacks executed during this tick.
    pub rollbacks: u32,
    /// Events for the session driver.
    pub events: Vec<EngineEvent>,
}

/// Engine counters surfaced in health reports.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct EngineStats {
    /// The current (speculative) frame.
    pub current_frame: i32,
    /// The newest frame confirmed for every human.
    pub confirmed_frame: i32,
    /// Total rollbacks executed this session.
    pub rollback_count: u32,
    /// Deepest rollback observed, in frames.
    pub max_rollback_depth: u32,
    /// Smoothed peer RTT estimate in milliseconds.
    pub rtt_ms: Option<u32>,
    /// Whether hash comparison has flagged divergence.
    pub divergence_detected: bool,
}

/// Bounded per-frame state history for rollback recovery and confirmed
/// state hashing.
#[derive(Debug)]
struct SnapshotStore<S> {
    cells: BTreeMap<Frame, S>,
}

impl<S: Clone> SnapshotStore<S> {
    fn new() -> Self {
        Self {
            cells: BTreeMap::new(),
        }
    }

    fn save(&mut self, frame: Frame, state: S) {
        self.cells.insert(frame, state);
        let horizon = frame - SNAPSHOT_WINDOW;
        self.cells.retain(|&f, _| f > horizon);
    }

    fn get(&self, frame: Frame) -> Option<S> {
        self.cells.get(&frame).cloned()
    }

    fn clear(&mut self) {
        self.cells.clear();
    }
}

/// The per-session rollback engine. See the module docs for the tick
/// pipeline.
pub struct RollbackEngine<E: Environment> {
    env: E,
    channel: Box<dyn DataChannel>,
    cfg: EngineConfig,
    bots: Vec<(PlayerId, Box<dyn BotPolicy>)>,
    rollback_enabled: bool,
    started: bool,

    current_frame: Frame,
    confirmed_frame: Frame,
    buffers: BTreeMap<PlayerId, InputBuffer>,
    /// Decoded packets staged on arrival, applied at the next tick start.
    staging: VecDeque<Packet>,
    /// Partner inputs that arrived while the local tab was backgrounded.
    background_staging: VecDeque<Packet>,
    pending_local_action: Option<Action>,
    pending_rollback: Option<Frame>,
    last_observations: BTreeMap<PlayerId, Value>,

    recorder: EpisodeRecorder,
    snapshots: SnapshotStore<E::State>,
    local_hashes: HashHistory,
    peer_hashes: HashHistory,
    outbound_hashes: VecDeque<(Frame, StateHash)>,
    rollback_in_progress: bool,

    episode_sync: EpisodeSync,
    health_gate: RoundHealthGate,
    focus: FocusTracker,
    export_delivered: bool,
    /// Drops confirmed inputs at or past a frame for a bounded number of
    /// ticks after an episode reset. The peer's boundary rebroadcasts can
    /// arrive after our frame numbering restarted; without the fence they
    /// would masquerade as inputs for the new episode's late frames.
    stale_input_fence: Option<(Frame, u32)>,

    completed_episodes: u32,
    divergence_detected: bool,
    rollback_count: u32,
    max_rollback_depth: u32,
    rtt_ms: Option<f64>,
    last_ping_frame: Frame,
    epoch: Instant,
}

impl<E: Environment> RollbackEngine<E> {
    /// Creates an engine. Call [`RollbackEngine::start`] to reset the
    /// environment and begin episode 0.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidRequest`] for contradictory player
    /// configurations or `num_episodes == 0`.
    pub fn new(
        env: E,
        cfg: EngineConfig,
        bots: Vec<(PlayerId, Box<dyn BotPolicy>)>,
        channel: Box<dyn DataChannel>,
    ) -> Result<Self, EngineError> {
        if cfg.remote_player == Some(cfg.local_player) {
            return Err(EngineError::InvalidRequest {
                info: "local and remote player ids must differ".to_owned(),
            });
        }
        if cfg.num_episodes == 0 {
            return Err(EngineError::InvalidRequest {
                info: "num_episodes must be at least 1".to_owned(),
            });
        }
        for (bot, _) in &bots {
            if *bot == cfg.local_player || Some(*bot) == cfg.remote_player {
                return Err(EngineError::InvalidRequest {
                    info: format!("bot player {bot} collides with a human slot"),
                });
            }
        }
        let mut buffers = BTreeMap::new();
        buffers.insert(
            cfg.local_player,
            InputBuffer::new(cfg.local_player, cfg.idle_action),
        );
        if let Some(remote) = cfg.remote_player {
            buffers.insert(remote, InputBuffer::new(remote, cfg.idle_action));
        }
        let episode_sync =
            EpisodeSync::new(cfg.remote_player.is_some(), cfg.input_confirmation_timeout);
        let focus = FocusTracker::new(cfg.local_player, cfg.focus_loss_timeout_ms);
        Ok(Self {
            env,
            channel,
            bots,
            rollback_enabled: false,
            started: false,
            current_frame: Frame::new(0),
            confirmed_frame: Frame::NULL,
            buffers,
            staging: VecDeque::new(),
            background_staging: VecDeque::new(),
            pending_local_action: None,
            pending_rollback: None,
            last_observations: BTreeMap::new(),
            recorder: EpisodeRecorder::new(),
            snapshots: SnapshotStore::new(),
            local_hashes: HashHistory::new(),
            peer_hashes: HashHistory::new(),
            outbound_hashes: VecDeque::new(),
            rollback_in_progress: false,
            episode_sync,
            health_gate: RoundHealthGate::new(),
            focus,
            export_delivered: true,
            stale_input_fence: None,
            completed_episodes: 0,
            divergence_detected: false,
            rollback_count: 0,
            max_rollback_depth: 0,
            rtt_ms: None,
            last_ping_frame: Frame::NULL,
            epoch: Instant::now(),
            cfg,
        })
    }

    /// Resets the environment and begins episode 0.
    pub fn start(&mut self) {
        self.last_observations = self.env.reset();
        self.rollback_enabled = self.env.get_state().is_some();
        if !self.rollback_enabled && self.cfg.remote_player.is_some() {
            warn!("environment exposes no snapshots; rollback and resync are disabled");
        }
        self.started = true;
        trace!(rollback_enabled = self.rollback_enabled, "engine started");
    }

    /// Registers the local player's action for the next advanced frame.
    /// Calling again before the tick overwrites the previous value.
    pub fn set_local_action(&mut self, action: Action) {
        self.pending_local_action = Some(action);
    }

    /// Records the partner's reported focus flag (delivered out of band).
    ///
    /// The notification trails the frames it describes, so the most recent
    /// stored record is patched as well; earlier frames keep whatever flag
    /// was known when they were written.
    pub fn set_partner_focused(&mut self, focused: bool) {
        self.focus.set_partner_focused(focused);
        if let Some(remote) = self.cfg.remote_player {
            let last = self.current_frame - 1;
            if last.is_valid() {
                self.recorder.set_focus_flag(last, remote, focused);
            }
        }
    }

    /// Handles a local visibility change. Restoring focus fast-forwards
    /// through the frames the partner played while this tab was hidden.
    ///
    /// # Errors
    /// Propagates rollback failures from the fast-forward batch.
    pub fn set_focused(&mut self, focused: bool, now: Instant) -> Result<TickReport, EngineError> {
        if focused && self.focus.is_backgrounded() {
            // Fast-forward runs while still marked hidden so the recovered
            // frames carry the idle action and an unfocused flag.
            let report = self.fast_forward(now)?;
            self.focus.set_focused(true, now);
            Ok(report)
        } else {
            if !focused {
                self.pending_local_action = None;
            }
            self.focus.set_focused(focused, now);
            Ok(TickReport::default())
        }
    }

    /// Acknowledges that the last episode's export was handed to the acked
    /// delivery path; unblocks the next episode.
    pub fn export_delivered(&mut self) {
        self.export_delivered = true;
    }

    /// Drives one tick of the engine.
    ///
    /// # Errors
    /// Returns an error only for unrecoverable misuse or environment
    /// failure; network faults and divergence degrade instead.
    pub fn tick(&mut self, now: Instant) -> Result<TickReport, EngineError> {
        if !self.started {
            return Err(EngineError::InvalidRequest {
                info: "tick called before start (or after session completion)".to_owned(),
            });
        }
        let mut report = TickReport::default();

        if let Some((fence, ticks_left)) = self.stale_input_fence {
            let ticks_left = ticks_left.saturating_sub(1);
            if ticks_left == 0 {
                trace!(fence = %fence, "stale-input fence lifted");
                self.stale_input_fence = None;
            } else {
                self.stale_input_fence = Some((fence, ticks_left));
            }
        }

        if let FocusVerdict::TimedOut { player, hidden_for } = self.focus.check_timeout(now) {
            warn!(%player, ?hidden_for, "focus-loss timeout exceeded");
            report.events.push(EngineEvent::FocusTimeout { player });
        }

        self.pump_network(now);
        if self.focus.is_backgrounded() {
            // Frames do not advance while hidden; partner traffic waits in
            // the background queue for fast-forward.
            return Ok(report);
        }
        self.drain_staging();
        if let Some(target) = self.pending_rollback.take() {
            self.execute_rollback(target, &mut report);
        }

        match self.episode_sync.phase() {
            SyncPhase::Running => {
                self.advance_one(&mut report)?;
                self.promote_confirmed();
                self.flush_hashes();
                self.compare_hashes(&mut report);
                self.maybe_ping(now);
                self.prune_buffers();
            }
            SyncPhase::NegotiatingEnd => {
                // Episode-ready and the trailing inputs travel over the
                // lossy channel; repeat them until the exchange settles.
                self.rebroadcast_boundary_state();
                if let Some(boundary) = self.episode_sync.boundary() {
                    // The peer that detected the end later wins: catch up
                    // to the agreed boundary in one batch.
                    while self.current_frame < boundary {
                        self.advance_one(&mut report)?;
                    }
                    self.promote_confirmed();
                    self.episode_sync.begin_confirmation_wait(now);
                    let all_confirmed = self.confirmed_frame >= boundary - 1;
                    if all_confirmed {
                        self.finish_episode(&mut report);
                    } else if self.episode_sync.confirmation_expired(now) {
                        warn!(
                            boundary = %boundary,
                            confirmed = %self.confirmed_frame,
                            "input confirmation timed out at episode boundary; proceeding"
                        );
                        report
                            .events
                            .push(EngineEvent::ConfirmationTimeout { boundary });
                        self.finish_episode(&mut report);
                    }
                } else {
                    self.promote_confirmed();
                }
                self.flush_hashes();
                self.compare_hashes(&mut report);
            }
            SyncPhase::Resetting => {
                self.rebroadcast_boundary_state();
                if self.export_delivered {
                    let gate = if self.cfg.remote_player.is_some() {
                        self.health_gate.poll(
                            now,
                            self.channel.ice_state(),
                            self.channel.is_open(),
                        )
                    } else {
                        GateStatus::Ready
                    };
                    match gate {
                        GateStatus::Ready => self.begin_next_episode(&mut report),
                        GateStatus::Waiting => {}
                        GateStatus::Aborted | GateStatus::TimedOut => {
                            warn!(?gate, "pre-round health check failed");
                            report.events.push(EngineEvent::RoundAborted {
                                timed_out: gate == GateStatus::TimedOut,
                            });
                        }
                    }
                }
            }
        }
        Ok(report)
    }

    /// Ends the session early and builds the partial export for whatever
    /// has been captured so far.
    pub fn end_partial(
        &mut self,
        reason: TerminationReason,
        offender: Option<PlayerId>,
    ) -> EpisodeExport {
        let boundary = self
            .episode_sync
            .boundary()
            .unwrap_or(self.current_frame);
        self.recorder.force_promote_below(boundary);
        self.started = false;
        EpisodeExport {
            episode: self.episode_sync.episode(),
            rows: self.recorder.export_rows(boundary),
            status: SessionStatus::partial(reason, offender, self.completed_episodes),
        }
    }

    /// Current engine counters for health reporting.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            current_frame: self.current_frame.as_i32(),
            confirmed_frame: self.confirmed_frame.as_i32(),
            rollback_count: self.rollback_count,
            max_rollback_depth: self.max_rollback_depth,
            rtt_ms: self.rtt_ms.map(|r| r.round() as u32),
            divergence_detected: self.divergence_detected,
        }
    }

    /// The current (speculative) frame.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.current_frame
    }

    /// The newest frame confirmed for every human player.
    #[must_use]
    pub fn confirmed_frame(&self) -> Frame {
        self.confirmed_frame
    }

    /// The current episode index.
    #[must_use]
    pub fn episode(&self) -> u32 {
        self.episode_sync.episode()
    }

    /// Whether the engine is between `start` and session completion.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.started
    }

    // ------------------------------------------------------------------
    // Network intake
    // ------------------------------------------------------------------

    fn pump_network(&mut self, now: Instant) {
        for bytes in self.channel.drain() {
            match codec::decode(&bytes) {
                Ok(Packet::Ping { timestamp_ms }) => {
                    let _ = self
                        .channel
                        .try_send(&codec::encode(&Packet::Pong { timestamp_ms }));
                }
                Ok(Packet::Pong { timestamp_ms }) => self.observe_rtt(now, timestamp_ms),
                Ok(packet @ Packet::Input(_)) if self.focus.is_backgrounded() => {
                    self.background_staging.push_back(packet);
                }
                Ok(packet) => self.staging.push_back(packet),
                Err(err) => debug!(%err, "dropping undecodable packet"),
            }
        }
    }

    fn drain_staging(&mut self) {
        while let Some(packet) = self.staging.pop_front() {
            match packet {
                Packet::Input(input) => self.apply_input_packet(input),
                Packet::StateHash { frame, hash } => {
                    // A legitimate peer hash is always for a frame below our
                    // current one (the peer cannot confirm a frame before
                    // receiving our input for it). Anything else is a stale
                    // straggler from the previous episode.
                    if frame < self.current_frame {
                        self.peer_hashes.insert(frame, hash);
                    } else {
                        debug!(frame = %frame, "dropping stale state hash");
                    }
                }
                Packet::EpisodeReady { episode, end_frame } => {
                    self.episode_sync.on_remote_ready(episode, end_frame);
                }
                Packet::Ping { .. } | Packet::Pong { .. } => {}
            }
        }
    }

    fn apply_input_packet(&mut self, input: InputPacket) {
        let Some(remote) = self.cfg.remote_player else {
            return;
        };
        if input.player != remote {
            debug!(player = %input.player, "ignoring input packet for unknown player");
            return;
        }
        let Some(buffer) = self.buffers.get_mut(&remote) else {
            return;
        };
        for (frame, action) in input.inputs {
            if !frame.is_valid() {
                continue;
            }
            if let Some((fence, _)) = self.stale_input_fence {
                // Boundary rebroadcasts from the previous episode may still
                // be in flight; the redundancy of later packets re-delivers
                // any legitimate entry dropped here.
                if frame >= fence {
                    continue;
                }
            }
            if let InsertResult::Mispredicted { predicted } = buffer.insert_confirmed(frame, action)
            {
                trace!(frame = %frame, predicted, actual = action, "misprediction detected");
                if frame < self.current_frame {
                    self.pending_rollback = Some(match self.pending_rollback {
                        Some(existing) => existing.min(frame),
                        None => frame,
                    });
                }
            }
        }
    }

    fn observe_rtt(&mut self, now: Instant, sent_ms: u64) {
        let sample = self.timestamp_ms(now).saturating_sub(sent_ms) as f64;
        self.rtt_ms = Some(match self.rtt_ms {
            Some(prev) => prev * 0.8 + sample * 0.2,
            None => sample,
        });
    }

    fn timestamp_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    fn maybe_ping(&mut self, now: Instant) {
        if self.cfg.remote_player.is_none() {
            return;
        }
        let due = self.last_ping_frame.is_null()
            || self.current_frame - self.last_ping_frame >= self.cfg.ping_interval_frames as i32;
        if due {
            self.last_ping_frame = self.current_frame;
            let _ = self.channel.try_send(&codec::encode(&Packet::Ping {
                timestamp_ms: self.timestamp_ms(now),
            }));
        }
    }

    // ------------------------------------------------------------------
    // Frame advancement
    // ------------------------------------------------------------------

    fn advance_one(&mut self, report: &mut TickReport) -> Result<(), EngineError> {
        let frame = self.current_frame;
        if let Some(boundary) = self.episode_sync.boundary() {
            if frame >= boundary {
                return Ok(());
            }
        }

        let mut actions = ActionMap::new();

        // Local human: the pending action, or idle while hidden / absent.
        let local = self.cfg.local_player;
        let local_action = if self.focus.is_backgrounded() {
            self.cfg.idle_action
        } else {
            self.pending_local_action
                .take()
                .unwrap_or(self.cfg.idle_action)
        };
        if let Some(buffer) = self.buffers.get_mut(&local) {
            buffer.insert_confirmed(frame, local_action);
        }
        actions.insert(local, local_action);

        // Remote human: confirmed action if it arrived, prediction
        // otherwise.
        if let Some(remote) = self.cfg.remote_player {
            if let Some(buffer) = self.buffers.get_mut(&remote) {
                let action = match buffer.get(frame) {
                    Some(entry) if entry.confirmed => entry.action,
                    _ => {
                        let predicted = buffer.predict();
                        buffer.record_prediction(frame, predicted);
                        predicted
                    }
                };
                actions.insert(remote, action);
            }
        }

        // Bots run their inference locally on every peer.
        for (bot, policy) in &mut self.bots {
            let obs = self.last_observations.get(bot);
            actions.insert(*bot, policy.act(frame, obs));
        }

        if self.rollback_enabled {
            if let Some(state) = self.env.get_state() {
                self.snapshots.save(frame, state);
            }
        }

        let outcome = self.env.step(&actions);
        let terminal = outcome.any_terminal();
        self.last_observations = outcome.observations;

        self.send_local_input(frame);

        let mut focused = BTreeMap::new();
        focused.insert(local, self.focus.is_focused());
        if let Some(remote) = self.cfg.remote_player {
            focused.insert(remote, self.focus.partner_focused());
        }
        let store = self
            .episode_sync
            .boundary()
            .is_none_or(|boundary| frame < boundary);
        if store {
            self.recorder.record_speculative(FrameRecord {
                frame,
                actions,
                rewards: outcome.rewards,
                terminated: outcome.terminated,
                truncated: outcome.truncated,
                infos: outcome.infos,
                focused,
                was_speculative: true,
            });
        }

        self.current_frame += 1;
        report.advanced += 1;

        let max_reached = self
            .cfg
            .max_steps
            .is_some_and(|max| self.current_frame.as_i32() >= max as i32);
        if terminal || max_reached {
            if let Some(packet) = self.episode_sync.declare_local_end(self.current_frame) {
                debug!(end_frame = %self.current_frame, "local episode end detected");
                let _ = self.channel.try_send(&codec::encode(&packet));
            }
        }
        Ok(())
    }

    fn send_local_input(&mut self, frame: Frame) {
        if self.cfg.remote_player.is_none() {
            return;
        }
        let Some(buffer) = self.buffers.get(&self.cfg.local_player) else {
            return;
        };
        let mut inputs: SmallVec<[(Frame, Action); INPUT_REDUNDANCY]> = SmallVec::new();
        let mut f = frame;
        while f.is_valid() && inputs.len() < INPUT_REDUNDANCY {
            match buffer.get(f) {
                Some(entry) => inputs.push((f, entry.action)),
                None => break,
            }
            f = f - 1;
        }
        let packet = Packet::Input(InputPacket {
            player: self.cfg.local_player,
            frame,
            inputs,
        });
        if self.channel.try_send(&codec::encode(&packet)).is_err() {
            // Droppable: redundancy in later packets recovers the loss.
            trace!(frame = %frame, "input packet dropped on congested channel");
        }
    }

    // ------------------------------------------------------------------
    // Rollback
    // ------------------------------------------------------------------

    fn execute_rollback(&mut self, target: Frame, report: &mut TickReport) {
        if self.rollback_in_progress {
            // New triggers during replay are impossible by construction
            // (inputs are staged); this is a belt-and-braces guard.
            return;
        }
        if target >= self.current_frame {
            return;
        }
        if !self.rollback_enabled {
            warn!("misprediction with rollback disabled; session marked divergent");
            self.divergence_detected = true;
            report.events.push(EngineEvent::RollbackFailed { target });
            return;
        }
        let Some(state) = self.snapshots.get(target) else {
            warn!(target = %target, "no snapshot for rollback target; session marked divergent");
            self.divergence_detected = true;
            report.events.push(EngineEvent::RollbackFailed { target });
            return;
        };

        let depth = (self.current_frame - target) as u32;
        trace!(target = %target, depth, "executing rollback");
        self.rollback_in_progress = true;
        self.env.set_state(&state);
        self.recorder.discard_speculative_from(target);

        // Replay the whole span synchronously. Yielding between replay
        // steps would admit racing network inputs and diverge the peers.
        let end = self.current_frame;
        let mut frame = target;
        while frame < end {
            let mut actions = ActionMap::new();
            for (player, buffer) in &mut self.buffers {
                let action = match buffer.get(frame) {
                    Some(entry) if entry.confirmed => entry.action,
                    _ => {
                        // Re-predict from the refreshed confirmation basis.
                        let predicted = buffer.predict();
                        buffer.overwrite_prediction(frame, predicted);
                        predicted
                    }
                };
                actions.insert(*player, action);
            }
            for (bot, policy) in &mut self.bots {
                let obs = self.last_observations.get(bot);
                actions.insert(*bot, policy.act(frame, obs));
            }

            if let Some(state) = self.env.get_state() {
                self.snapshots.save(frame, state);
            }
            let outcome = self.env.step(&actions);
            self.last_observations = outcome.observations;

            let mut focused = BTreeMap::new();
            focused.insert(self.cfg.local_player, self.focus.is_focused());
            if let Some(remote) = self.cfg.remote_player {
                focused.insert(remote, self.focus.partner_focused());
            }
            let store = self
                .episode_sync
                .boundary()
                .is_none_or(|boundary| frame < boundary);
            if store {
                self.recorder.record_speculative(FrameRecord {
                    frame,
                    actions,
                    rewards: outcome.rewards,
                    terminated: outcome.terminated,
                    truncated: outcome.truncated,
                    infos: outcome.infos,
                    focused,
                    was_speculative: true,
                });
            }
            frame += 1;
        }

        self.local_hashes.invalidate_from(target);
        self.rollback_in_progress = false;
        self.rollback_count += 1;
        self.max_rollback_depth = self.max_rollback_depth.max(depth);
        report.rollbacks += 1;
    }

    // ------------------------------------------------------------------
    // Confirmation, hashing, comparison
    // ------------------------------------------------------------------

    fn promote_confirmed(&mut self) {
        loop {
            let next = if self.confirmed_frame.is_null() {
                Frame::new(0)
            } else {
                self.confirmed_frame + 1
            };
            if next >= self.current_frame {
                break;
            }
            if let Some(boundary) = self.episode_sync.boundary() {
                if next >= boundary {
                    break;
                }
            }
            let all_confirmed = self.buffers.values().all(|b| b.is_confirmed(next));
            if !all_confirmed {
                break;
            }
            self.confirmed_frame = next;
            self.recorder.promote(next);
            self.hash_confirmed(next);
        }
    }

    fn hash_confirmed(&mut self, frame: Frame) {
        if self.cfg.remote_player.is_none() || !self.rollback_enabled {
            return;
        }
        // The state after stepping `frame` is the state at the start of
        // `frame + 1` — the live state if that is the current frame.
        let after = frame + 1;
        let state = if after == self.current_frame {
            self.env.get_state()
        } else {
            self.snapshots.get(after)
        };
        let Some(state) = state else {
            debug!(frame = %frame, "no state available to hash at confirmation");
            return;
        };
        match hash_state(&state) {
            Ok(hash) => {
                self.local_hashes.insert(frame, hash);
                self.outbound_hashes.push_back((frame, hash));
            }
            Err(err) => warn!(%err, frame = %frame, "state hashing failed"),
        }
    }

    fn flush_hashes(&mut self) {
        debug_assert!(!self.rollback_in_progress);
        while let Some((frame, hash)) = self.outbound_hashes.pop_front() {
            let bytes = codec::encode(&Packet::StateHash { frame, hash });
            if self.channel.try_send(&bytes).is_err() {
                // Hashes are not droppable: requeue and retry next tick.
                self.outbound_hashes.push_front((frame, hash));
                break;
            }
        }
    }

    fn compare_hashes(&mut self, report: &mut TickReport) {
        let comparable: Vec<Frame> = self
            .peer_hashes
            .iter()
            .filter_map(|(frame, _)| self.local_hashes.get(frame).map(|_| frame))
            .collect();
        for frame in comparable {
            // Consume the peer hash either way so each frame is compared at
            // most once.
            let Some(remote) = self.peer_hashes.remove(frame) else {
                continue;
            };
            let Some(local) = self.local_hashes.get(frame) else {
                continue;
            };
            if local != remote {
                warn!(frame = %frame, %local, %remote, "state hash mismatch");
                self.divergence_detected = true;
                report.events.push(EngineEvent::HashMismatch {
                    frame,
                    local,
                    remote,
                });
            }
        }
    }

    fn prune_buffers(&mut self) {
        for buffer in self.buffers.values_mut() {
            buffer.prune(self.current_frame, self.confirmed_frame);
        }
    }

    // ------------------------------------------------------------------
    // Episode boundaries
    // ------------------------------------------------------------------

    fn rebroadcast_boundary_state(&mut self) {
        if let Some(packet) = self.episode_sync.rebroadcast() {
            let _ = self.channel.try_send(&codec::encode(&packet));
        }
        // The peer may still be missing trailing inputs; the redundancy
        // block of one repeated packet covers the tail.
        let last_stepped = self.current_frame - 1;
        if last_stepped.is_valid() {
            self.send_local_input(last_stepped);
        }
    }

    fn finish_episode(&mut self, report: &mut TickReport) {
        let Some(boundary) = self.episode_sync.boundary() else {
            return;
        };
        let promoted = self.recorder.force_promote_below(boundary);
        if promoted > 0 {
            report
                .events
                .push(EngineEvent::ForcePromoted { count: promoted });
        }
        let status = if self.divergence_detected {
            SessionStatus::partial(
                TerminationReason::StateDivergence,
                None,
                self.completed_episodes,
            )
        } else {
            SessionStatus::complete(self.completed_episodes + 1)
        };
        let export = EpisodeExport {
            episode: self.episode_sync.episode(),
            rows: self.recorder.export_rows(boundary),
            status,
        };
        debug!(
            episode = self.episode_sync.episode(),
            rows = export.rows.len(),
            "episode complete"
        );
        report.events.push(EngineEvent::EpisodeComplete {
            episode: self.episode_sync.episode(),
            export,
        });
        self.completed_episodes += 1;
        self.export_delivered = false;
        self.episode_sync.begin_reset();
    }

    fn begin_next_episode(&mut self, report: &mut TickReport) {
        // Arm the stale-input fence: the peer's boundary rebroadcasts for
        // the finished episode may still be in flight once our frame
        // numbering restarts.
        if let Some(boundary) = self.episode_sync.boundary() {
            let fence = (boundary - INPUT_REDUNDANCY as i32).max(Frame::new(0));
            self.stale_input_fence = Some((fence, STALE_FENCE_TICKS));
        }
        // The boundary is cleared only here, strictly after the export was
        // handed off.
        self.episode_sync.clear_after_export();
        if self.completed_episodes >= self.cfg.num_episodes {
            self.started = false;
            report.events.push(EngineEvent::SessionComplete {
                completed_episodes: self.completed_episodes,
            });
            return;
        }
        self.last_observations = self.env.reset();
        self.recorder.reset();
        for buffer in self.buffers.values_mut() {
            buffer.reset();
        }
        self.snapshots.clear();
        self.local_hashes.clear();
        self.peer_hashes.clear();
        self.outbound_hashes.clear();
        self.current_frame = Frame::new(0);
        self.confirmed_frame = Frame::NULL;
        self.pending_rollback = None;
        self.last_ping_frame = Frame::NULL;
        debug!(episode = self.episode_sync.episode(), "next episode started");
    }

    // ------------------------------------------------------------------
    // Fast-forward
    // ------------------------------------------------------------------

    fn fast_forward(&mut self, now: Instant) -> Result<TickReport, EngineError> {
        let mut report = TickReport::default();
        while let Some(packet) = self.background_staging.pop_front() {
            self.staging.push_back(packet);
        }
        self.drain_staging();
        if let Some(target) = self.pending_rollback.take() {
            self.execute_rollback(target, &mut report);
        }
        let Some(remote) = self.cfg.remote_player else {
            return Ok(report);
        };
        let Some(lead) = self.buffers.get(&remote).and_then(InputBuffer::max_frame) else {
            return Ok(report);
        };
        // The partner has stepped through its newest sent input, so catch
        // up to the frame after it — but never past the agreed episode end.
        let mut target = lead + 1;
        if let Some(boundary) = self.episode_sync.boundary() {
            target = target.min(boundary);
        }
        while self.current_frame < target && self.episode_sync.phase() != SyncPhase::Resetting {
            self.advance_one(&mut report)?;
        }
        self.promote_confirmed();
        self.flush_hashes();
        self.compare_hashes(&mut report);
        self.maybe_ping(now);
        Ok(report)
    }
}

// #########
// # TESTS #
// #########
