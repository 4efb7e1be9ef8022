//! Server ↔ client message channel types.
//!
//! Everything that travels over a browser's duplex server connection is one
//! of these two enums, serialized as JSON tagged by event name. Per-frame
//! game traffic never goes through here — that is the binary peer-to-peer
//! protocol in [`codec`](crate::network::codec). This channel carries
//! lifecycle, signaling, probes, admin streams, and the acked episode-data
//! export path.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::frame_info::EpisodeExport;
use crate::{PlayerId, ProbeId, SessionId, SessionMode, SubjectId};

/// One player slot of a starting game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSlot {
    /// The slot's player id.
    pub player: PlayerId,
    /// The subject occupying the slot; `None` for bots.
    pub subject: Option<SubjectId>,
}

/// Acknowledgment outcome for acked emits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// The payload was received and processed.
    Ok,
    /// The receiver could not process the payload.
    Error,
}

/// Messages the server sends to a browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The experiment configuration for this participant.
    ExperimentConfig {
        /// Serialized configuration.
        config: Value,
    },
    /// The participant entered a waiting room.
    WaitingRoom {
        /// Position in the arrival order.
        position: usize,
        /// Number of subjects currently waiting.
        subjects_waiting: usize,
    },
    /// Registry state did not match reality; the client should re-enter
    /// the waiting room.
    WaitingRoomError {
        /// Human-readable description.
        message: String,
    },
    /// A match formed; the game starts after the countdown.
    MatchFoundCountdown {
        /// Countdown length in seconds.
        seconds: u32,
    },
    /// The session is starting.
    StartGame {
        /// The session identifier.
        session: SessionId,
        /// How the session is driven.
        mode: SessionMode,
        /// The receiving participant's slot.
        player_slot: PlayerId,
        /// All slots of the session, in player order.
        players: Vec<PlayerSlot>,
    },
    /// Rendered state broadcast (server-authoritative mode only).
    ServerRenderState {
        /// Render payload from the environment.
        state: Value,
    },
    /// The session ended.
    EndGame {
        /// Overlay message, if the end was abnormal.
        message: Option<String>,
    },
    /// The partner was excluded mid-game.
    PartnerExcluded {
        /// Overlay message for the surviving participant.
        message: String,
    },
    /// The client should export whatever episode data it holds.
    TriggerDataExport,
    /// The peer-to-peer game ended on the other side.
    P2pGameEnded,
    /// Prepare a probe DataChannel with the given peer.
    ProbePrepare {
        /// Probe session identifier.
        probe: ProbeId,
        /// Whether this side initiates the connection and sends the pings.
        initiator: bool,
        /// The peer being probed.
        peer: SubjectId,
    },
    /// Both sides are ready; the initiator starts pinging.
    ProbeStart {
        /// Probe session identifier.
        probe: ProbeId,
    },
    /// Relayed WebRTC signaling payload.
    WebrtcSignal {
        /// The subject the payload originates from.
        from: SubjectId,
        /// Opaque SDP/ICE payload.
        payload: Value,
    },
    /// Throttled admin state snapshot.
    StateUpdate {
        /// Serialized summary.
        snapshot: Value,
    },
    /// Incremental admin activity event.
    ActivityEvent {
        /// Serialized activity entry.
        event: Value,
    },
    /// Acknowledgment of an acked client emit.
    Ack {
        /// Correlates with the client's `ack_id`.
        ack_id: u64,
        /// Outcome.
        status: AckStatus,
    },
    /// Wrapper for server emits that require a client acknowledgment.
    Acked {
        /// Identifier the client echoes back.
        ack_id: u64,
        /// The wrapped message.
        inner: Box<ServerMessage>,
    },
}

/// Messages a browser sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the current scene's game (entering matchmaking if needed).
    JoinGame {
        /// The joining subject.
        subject: SubjectId,
        /// The scene being entered.
        scene: String,
    },
    /// A per-frame action (server-authoritative mode only).
    PlayerAction {
        /// The action code.
        action: i32,
    },
    /// Relayed WebRTC signaling payload.
    WebrtcSignal {
        /// The subject the payload is addressed to.
        target: SubjectId,
        /// Opaque SDP/ICE payload.
        payload: Value,
    },
    /// The probe DataChannel is set up on this side.
    ProbeReady {
        /// Probe session identifier.
        probe: ProbeId,
    },
    /// Signaling payload scoped to a probe session.
    ProbeSignal {
        /// Probe session identifier.
        probe: ProbeId,
        /// Opaque SDP/ICE payload.
        payload: Value,
    },
    /// Measured probe outcome from the initiator.
    ProbeResult {
        /// Probe session identifier.
        probe: ProbeId,
        /// Median round-trip time, or `None` if every ping timed out.
        rtt_ms: Option<u32>,
    },
    /// Periodic engine health report (2-second cadence).
    P2pHealthReport {
        /// The reporting session.
        session: SessionId,
        /// Serialized engine stats.
        report: Value,
    },
    /// Acked episode-data export.
    EmitEpisodeData {
        /// Identifier echoed in the server's ack.
        ack_id: u64,
        /// The exporting subject.
        subject: SubjectId,
        /// The episode bundle.
        export: EpisodeExport,
    },
    /// Aggregate multiplayer metrics at session end.
    EmitMultiplayerMetrics {
        /// The reporting session.
        session: SessionId,
        /// Serialized metrics.
        metrics: Value,
    },
    /// A continuous eligibility callback excluded this participant.
    MidGameExclusion {
        /// The excluded subject.
        subject: SubjectId,
        /// Message shown to the participant.
        message: Option<String>,
    },
    /// Rejoin a server-authoritative session after a transport drop.
    RejoinServerAuth {
        /// The session being rejoined.
        session: SessionId,
        /// The rejoining subject.
        subject: SubjectId,
    },
    /// Captured console/error line from the browser.
    ConsoleEvent {
        /// Severity (`log`, `warn`, `error`).
        level: String,
        /// The captured text.
        message: String,
    },
    /// Acknowledgment of an acked server emit.
    Ack {
        /// Correlates with the server's `ack_id`.
        ack_id: u64,
        /// Outcome.
        status: AckStatus,
    },
}

// #########
// # TESTS #
// #########
