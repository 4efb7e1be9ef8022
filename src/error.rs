//! Error types for the client-side session engine.
//!
//! Engine errors are structured enums rather than string messages: hot-path
//! variants store numeric context directly (no allocation on construction)
//! and format lazily in their `Display` impls. Server-side modules define
//! their own error types next to the code that raises them.

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{Frame, PlayerId};

/// Represents why a frame argument was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum InvalidFrameReason {
    /// Frame is NULL_FRAME (-1).
    NullFrame,
    /// Frame must be non-negative.
    MustBeNonNegative,
    /// Frame is not in the past (must roll back to a frame before current).
    NotInPast {
        /// The current frame.
        current_frame: Frame,
    },
    /// Frame is older than the snapshot window, so no recovery state exists.
    OutsideSnapshotWindow {
        /// The oldest frame with a recovery snapshot.
        oldest_snapshot: Frame,
    },
    /// Frame is at or past the agreed episode termination boundary.
    PastTerminationBoundary {
        /// The agreed termination frame.
        boundary: Frame,
    },
}

impl Display for InvalidFrameReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NullFrame => write!(f, "frame is NULL_FRAME"),
            Self::MustBeNonNegative => write!(f, "frame must be non-negative"),
            Self::NotInPast { current_frame } => {
                write!(f, "frame is not in the past (current: {current_frame})")
            }
            Self::OutsideSnapshotWindow { oldest_snapshot } => write!(
                f,
                "frame is older than the snapshot window (oldest snapshot: {oldest_snapshot})"
            ),
            Self::PastTerminationBoundary { boundary } => write!(
                f,
                "frame is at or past the episode termination boundary ({boundary})"
            ),
        }
    }
}

/// Errors raised by the rollback engine and its supporting modules.
#[derive(Debug)]
#[non_exhaustive]
pub enum EngineError {
    /// A player id did not refer to a player of this session.
    InvalidPlayer {
        /// The offending id.
        player: PlayerId,
        /// Number of players in the session.
        num_players: usize,
    },
    /// A frame argument was rejected.
    InvalidFrame {
        /// The offending frame.
        frame: Frame,
        /// Why the frame was rejected.
        reason: InvalidFrameReason,
    },
    /// Rollback was requested but the environment does not expose
    /// `get_state` / `set_state`.
    RollbackUnavailable,
    /// A peer-to-peer packet could not be decoded.
    Decode(crate::network::codec::CodecError),
    /// The environment signalled a failure from which the session cannot
    /// continue.
    Environment {
        /// Human-readable description from the simulator boundary.
        info: String,
    },
    /// The operation does not make sense in the engine's current state.
    InvalidRequest {
        /// Human-readable description of the misuse.
        info: String,
    },
}

impl Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPlayer {
                player,
                num_players,
            } => write!(
                f,
                "player {player} is not part of this session ({num_players} players)"
            ),
            Self::InvalidFrame { frame, reason } => {
                write!(f, "invalid frame {frame}: {reason}")
            }
            Self::RollbackUnavailable => write!(
                f,
                "environment exposes no get_state/set_state; rollback is disabled"
            ),
            Self::Decode(err) => write!(f, "failed to decode packet: {err}"),
            Self::Environment { info } => write!(f, "environment failure: {info}"),
            Self::InvalidRequest { info } => write!(f, "invalid request: {info}"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Decode(err) => Some(err),
            _ => None,
        }
    }
}

impl From<crate::network::codec::CodecError> for EngineError {
    fn from(err: crate::network::codec::CodecError) -> Self {
        Self::Decode(err)
    }
}
