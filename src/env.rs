//! The simulator boundary.
//!
//! The platform is agnostic to what the environment simulates: it only
//! requires a step-based interface with per-player action, reward, and
//! termination maps. Observation and info shapes are opaque JSON beyond
//! serializability.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::{Frame, PlayerId};

/// Discrete action code for a single player on a single frame.
///
/// The original key/press input surface maps onto small integers, which is
/// also what travels in the binary input packets.
pub type Action = i32;

/// Map from player id to the action chosen for one frame.
///
/// `BTreeMap` keeps iteration order deterministic, which matters everywhere
/// the map feeds serialization or hashing.
pub type ActionMap = BTreeMap<PlayerId, Action>;

/// Everything a single environment step returns, keyed by player.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    /// Per-player observations. Not exported; consumed by renderers and bots.
    pub observations: BTreeMap<PlayerId, Value>,
    /// Per-player scalar rewards.
    pub rewards: BTreeMap<PlayerId, f64>,
    /// Per-player terminated flags.
    pub terminated: BTreeMap<PlayerId, bool>,
    /// Per-player truncated flags.
    pub truncated: BTreeMap<PlayerId, bool>,
    /// Per-player info dictionaries (flattened one level on export).
    pub infos: BTreeMap<PlayerId, Value>,
}

impl StepOutcome {
    /// Returns `true` if any player's terminated or truncated flag is set.
    #[must_use]
    pub fn any_terminal(&self) -> bool {
        self.terminated.values().any(|t| *t) || self.truncated.values().any(|t| *t)
    }
}

/// The abstract environment the session engine drives.
///
/// Implementations must be deterministic: stepping the same state with the
/// same action map must produce the same outcome on every peer, or rollback
/// replay and state-hash comparison will report divergence.
///
/// `get_state` / `set_state` are optional. If [`Environment::get_state`]
/// returns `None` the engine disables rollback (and resync) and runs purely
/// speculation-free, which only makes sense for single-player scenes.
pub trait Environment {
    /// Snapshot of the full simulator state, cheap to clone and
    /// serializable for canonical state hashing.
    type State: Clone + Serialize;

    /// Resets the environment to the start of a fresh episode and returns
    /// the per-player initial observations.
    fn reset(&mut self) -> BTreeMap<PlayerId, Value>;

    /// Advances the simulation by one step with the given actions.
    fn step(&mut self, actions: &ActionMap) -> StepOutcome;

    /// Returns a snapshot of the current state, or `None` if the
    /// environment cannot snapshot (disables rollback).
    fn get_state(&self) -> Option<Self::State> {
        None
    }

    /// Restores a previously captured snapshot.
    ///
    /// Only called with states obtained from [`Environment::get_state`] on
    /// the same environment; the default is a no-op for environments that
    /// never produce snapshots.
    fn set_state(&mut self, state: &Self::State) {
        let _ = state;
    }

    /// Renders the current state for thin clients.
    ///
    /// Required in server-authoritative mode; the default returns `None`.
    fn render(&self) -> Option<Value> {
        None
    }
}

/// Object-safe environment surface for server-authoritative sessions.
///
/// The server loop never rolls back, so snapshots are not part of this
/// trait; rendering is, because thin clients draw whatever the server
/// broadcasts.
pub trait ServerEnvironment: Send {
    /// See [`Environment::reset`].
    fn reset(&mut self) -> BTreeMap<PlayerId, Value>;
    /// See [`Environment::step`].
    fn step(&mut self, actions: &ActionMap) -> StepOutcome;
    /// See [`Environment::render`].
    fn render(&self) -> Option<Value>;
}

impl<E: Environment + Send> ServerEnvironment for E {
    fn reset(&mut self) -> BTreeMap<PlayerId, Value> {
        Environment::reset(self)
    }

    fn step(&mut self, actions: &ActionMap) -> StepOutcome {
        Environment::step(self, actions)
    }

    fn render(&self) -> Option<Value> {
        Environment::render(self)
    }
}

/// Decision procedure for a scripted opponent.
///
/// Bots occupy player slots like humans but their actions are computed
/// locally on every peer from confirmed state, so they never travel over
/// the network. Implementations must be deterministic for the same reason
/// the environment must be.
pub trait BotPolicy {
    /// Chooses the bot's action for `frame` given its latest observation.
    fn act(&mut self, frame: Frame, observation: Option<&Value>) -> Action;
}

/// Bot that always plays a fixed action. Useful as a default opponent and
/// in tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedActionBot(pub Action);

impl BotPolicy for FixedActionBot {
    fn act(&mut self, _frame: Frame, _observation: Option<&Value>) -> Action {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_outcome_terminal_detection() {
        let mut outcome = StepOutcome::default();
        assert!(!outcome.any_terminal());

        outcome.terminated.insert(PlayerId::new(0), false);
        outcome.truncated.insert(PlayerId::new(1), false);
        assert!(!outcome.any_terminal());

        outcome.truncated.insert(PlayerId::new(1), true);
        assert!(outcome.any_terminal());
    }

    #[test]
    fn fixed_bot_repeats_action() {
        let mut bot = FixedActionBot(4);
        assert_eq!(bot.act(Frame::new(0), None), 4);
        assert_eq!(bot.act(Frame::new(99), None), 4);
    }
}
