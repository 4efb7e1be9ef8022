//! # dyad
//!
//! `dyad` is the session engine of a browser-based research platform for
//! real-time, multi-participant interactive-environment experiments.
//! Participants are admitted, routed through a scene sequence, matched under
//! a round-trip-time gate, and paired into game sessions that run a
//! deterministic, step-synchronous environment loop across an unreliable
//! peer-to-peer channel.
//!
//! The crate splits into two halves:
//!
//! - The **client-side engine** ([`rollback::RollbackEngine`] and its
//!   supporting modules) runs one tick loop per session. It queues inputs,
//!   steps speculatively, rolls back on misprediction, exchanges state
//!   hashes, and records every frame into a dual-buffer store so that both
//!   peers export byte-identical, gap-free per-frame data — even under
//!   packet loss, tab backgrounding, and mid-game disconnects.
//! - The **server side** ([`server`]) owns participant lifecycle, RTT-probed
//!   matchmaking, session supervision, acked message delivery, and the
//!   read-only admin aggregator.
//!
//! The engine is intentionally synchronous and poll-driven: the only
//! suspension points on the client are the simulator step and the tick
//! source. The server side runs on tokio with one task per session.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use serde::{Deserialize, Serialize};

pub use env::{ActionMap, BotPolicy, Environment, StepOutcome};
pub use error::EngineError;
pub use focus::{FocusTracker, TickSource};
pub use rollback::{EngineConfig, EngineEvent, RollbackEngine, TickReport};
pub use state_hash::StateHash;

pub mod env;
pub mod episode_sync;
pub mod error;
pub mod focus;
pub mod frame_info;
pub mod hash;
pub mod input_buffer;
pub mod prelude;
pub mod recorder;
pub mod rng;
pub mod rollback;
pub mod state_hash;

/// Peer-to-peer wire protocol, transport hub, and message channel types.
pub mod network {
    pub mod chaos;
    pub mod codec;
    pub mod hub;
    pub mod messages;
}

/// Server-side subsystems: registry, matchmaker, supervisor, admin, export.
pub mod server {
    pub mod admin;
    pub mod config;
    pub mod export;
    pub mod matchmaker;
    pub mod probe;
    pub mod registry;
    pub mod supervisor;
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// A frame is a single step of environment execution.
///
/// Frames are the fundamental unit of time in the session engine: frame
/// numbers start at 0 on each episode reset and increment sequentially. The
/// special value [`NULL_FRAME`] (-1) represents "no frame".
///
/// `Frame` is a newtype wrapper around `i32` so that frame indices cannot be
/// accidentally mixed with other integers (player ids, episode counters).
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame constant, representing "no frame".
    pub const NULL: Frame = Frame(NULL_FRAME);

    /// Creates a new `Frame` from an `i32` value without validation.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this frame is the null frame.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is valid (non-negative).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Returns `Some(self)` if the frame is valid, `None` otherwise.
    #[inline]
    #[must_use]
    pub const fn to_option(self) -> Option<Frame> {
        if self.is_valid() {
            Some(self)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Frame(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Frame(self.0 - rhs)
    }
}

impl std::ops::Sub<Frame> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Frame) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Frame(value)
    }
}

impl From<Frame> for i32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl PartialEq<i32> for Frame {
    #[inline]
    fn eq(&self, other: &i32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i32> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &i32) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// A unique identifier for a player slot in a session.
///
/// Player ids are small integers assigned in session order: humans first,
/// then bots. They key every per-player column of the exported data and the
/// action maps handed to the environment.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PlayerId(usize);

impl PlayerId {
    /// Creates a new `PlayerId` from a `usize` value.
    #[inline]
    #[must_use]
    pub const fn new(id: usize) -> Self {
        PlayerId(id)
    }

    /// Returns the underlying `usize` value.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for PlayerId {
    #[inline]
    fn from(value: usize) -> Self {
        PlayerId(value)
    }
}

/// An opaque subject identifier, supplied by the experimenter's URL scheme.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    /// Creates a subject id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        SubjectId(id.into())
    }

    /// Returns the subject id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubjectId {
    fn from(value: &str) -> Self {
        SubjectId(value.to_owned())
    }
}

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Generates a fresh random identifier.
            #[must_use]
            pub fn fresh() -> Self {
                $name(uuid::Uuid::new_v4())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a game session, assigned by the session supervisor.
    SessionId
);
uuid_id!(
    /// Identifier of a transport-layer connection (one per browser tab).
    ConnectionId
);
uuid_id!(
    /// Identifier of a short-lived RTT probe session.
    ProbeId
);

// #############
// #   ENUMS   #
// #############

/// How a game session is driven.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Inputs flow peer-to-peer; each browser runs its own rollback engine
    /// and the server acts only as signaling and acked-delivery relay.
    P2p,
    /// The server steps the environment itself and clients are thin
    /// renderers.
    ServerAuthoritative,
}

/// Whether an action used when stepping a frame was received or predicted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputStatus {
    /// The action for this frame is an actual received input.
    Confirmed,
    /// The action for this frame is predicted and may be rolled back.
    Predicted,
}

/// ICE connection state of the peer-to-peer channel, as reported by the
/// browser. The engine only distinguishes usable, pending, and terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceState {
    /// Negotiation has not produced a candidate pair yet.
    New,
    /// Candidate pairs are being checked.
    Checking,
    /// A working candidate pair exists.
    Connected,
    /// Checks finished with a working pair.
    Completed,
    /// The connection is temporarily interrupted.
    Disconnected,
    /// Negotiation failed; the connection will not recover.
    Failed,
    /// The connection was closed.
    Closed,
}

impl IceState {
    /// A connection is usable when a working candidate pair exists.
    #[must_use]
    pub const fn is_usable(self) -> bool {
        matches!(self, IceState::Connected | IceState::Completed)
    }

    /// Terminal states abort the round rather than waiting out the deadline.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, IceState::Failed | IceState::Closed)
    }
}

// #########
// # TESTS #
// #########
