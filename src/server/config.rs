//! Experiment configuration surface.
//!
//! The experimenter supplies a configuration per gym scene; everything not
//! set falls back to the defaults below. Eligibility callbacks are code,
//! not data — they are installed on the
//! [`ParticipantRegistry`](crate::server::registry::ParticipantRegistry)
//! programmatically, while this struct carries only the declarative
//! options.

use serde::{Deserialize, Serialize};

use crate::SessionMode;

/// How the browser translates keyboard state into actions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// The set of currently held keys is sampled every frame.
    PressedKeys,
    /// One action per discrete keystroke.
    SingleKeystroke,
}

impl Default for InputMode {
    fn default() -> Self {
        Self::PressedKeys
    }
}

/// Multiplayer options for a gym scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplayerConfig {
    /// How the session is driven.
    pub mode: SessionMode,
    /// Upper bound on the candidates' combined probe RTTs; `None` disables
    /// the latency gate.
    pub max_server_rtt_ms: Option<u32>,
    /// How long to wait for trailing input confirmation at an episode
    /// boundary.
    pub input_confirmation_timeout_ms: u64,
    /// Reconnection window after a transport drop.
    pub reconnection_timeout_ms: u64,
    /// Focus-loss timeout; `0` disables the check.
    pub focus_loss_timeout_ms: u64,
    /// Overlay message when a player exceeds the focus-loss timeout.
    pub focus_loss_message: String,
    /// Overlay message for the surviving peer of a disconnect.
    pub partner_disconnect_message: String,
    /// Number of episodes per session.
    pub num_episodes: u32,
}

impl Default for MultiplayerConfig {
    fn default() -> Self {
        Self {
            mode: SessionMode::P2p,
            max_server_rtt_ms: None,
            input_confirmation_timeout_ms: 2000,
            reconnection_timeout_ms: 5000,
            focus_loss_timeout_ms: 30_000,
            focus_loss_message: "The game ended because your tab was inactive too long."
                .to_owned(),
            partner_disconnect_message: "Your partner has disconnected. \
                Please wait while we save your data."
                .to_owned(),
            num_episodes: 1,
        }
    }
}

/// Top-level per-scene experiment configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Keyboard-to-action translation mode.
    pub input_mode: InputMode,
    /// Multiplayer options.
    pub multiplayer: MultiplayerConfig,
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let cfg = MultiplayerConfig::default();
        assert_eq!(cfg.mode, SessionMode::P2p);
        assert_eq!(cfg.max_server_rtt_ms, None);
        assert_eq!(cfg.input_confirmation_timeout_ms, 2000);
        assert_eq!(cfg.reconnection_timeout_ms, 5000);
        assert_eq!(cfg.focus_loss_timeout_ms, 30_000);
        assert_eq!(cfg.num_episodes, 1);
    }

    #[test]
    fn partial_configs_fill_from_defaults() {
        let cfg: ExperimentConfig = serde_json::from_str(
            r#"{
                "input_mode": "single_keystroke",
                "multiplayer": { "mode": "server_authoritative", "num_episodes": 3 }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.input_mode, InputMode::SingleKeystroke);
        assert_eq!(cfg.multiplayer.mode, SessionMode::ServerAuthoritative);
        assert_eq!(cfg.multiplayer.num_episodes, 3);
        assert_eq!(cfg.multiplayer.reconnection_timeout_ms, 5000);
    }

    #[test]
    fn zero_focus_timeout_parses_as_disabled() {
        let cfg: MultiplayerConfig =
            serde_json::from_str(r#"{ "focus_loss_timeout_ms": 0 }"#).unwrap();
        assert_eq!(cfg.focus_loss_timeout_ms, 0);
    }
}
