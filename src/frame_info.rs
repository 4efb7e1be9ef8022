//! Per-frame records and episode status blocks.
//!
//! A [`FrameRecord`] is the canonical unit of captured data: one row of the
//! eventual per-episode export. Records live in exactly one of the two
//! recorder buffers (speculative or confirmed) at any time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Frame, PlayerId};

/// Everything captured for a single frame of a single episode.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    /// The frame this record belongs to.
    pub frame: Frame,
    /// Action submitted (or predicted) per player.
    pub actions: BTreeMap<PlayerId, i32>,
    /// Reward returned per player.
    pub rewards: BTreeMap<PlayerId, f64>,
    /// Terminated flag per player.
    pub terminated: BTreeMap<PlayerId, bool>,
    /// Truncated flag per player.
    pub truncated: BTreeMap<PlayerId, bool>,
    /// Info dictionary per player.
    pub infos: BTreeMap<PlayerId, Value>,
    /// Focus flag per player: self directly, partner as last received.
    pub focused: BTreeMap<PlayerId, bool>,
    /// `true` if this record was force-promoted at an episode boundary
    /// without ever being acknowledged by the peer.
    pub was_speculative: bool,
}

impl FrameRecord {
    /// Flattens the record into one export row.
    ///
    /// Scalar columns are keyed `action.<p>`, `reward.<p>`,
    /// `terminated.<p>`, `truncated.<p>`, `isFocused.<p>`; info objects are
    /// flattened one level into `info.<p>.<key>`. `serde_json`'s default
    /// map keeps keys sorted, so serializing a row is canonical.
    #[must_use]
    pub fn to_row(&self) -> Map<String, Value> {
        let mut row = Map::new();
        row.insert("frame".to_owned(), Value::from(self.frame.as_i32()));
        for (p, action) in &self.actions {
            row.insert(format!("action.{p}"), Value::from(*action));
        }
        for (p, reward) in &self.rewards {
            row.insert(format!("reward.{p}"), Value::from(*reward));
        }
        for (p, t) in &self.terminated {
            row.insert(format!("terminated.{p}"), Value::from(*t));
        }
        for (p, t) in &self.truncated {
            row.insert(format!("truncated.{p}"), Value::from(*t));
        }
        for (p, info) in &self.infos {
            match info {
                Value::Object(fields) => {
                    for (key, value) in fields {
                        row.insert(format!("info.{p}.{key}"), value.clone());
                    }
                }
                Value::Null => {}
                other => {
                    row.insert(format!("info.{p}"), other.clone());
                }
            }
        }
        for (p, focused) in &self.focused {
            row.insert(format!("isFocused.{p}"), Value::from(*focused));
        }
        if self.was_speculative {
            row.insert("wasSpeculative".to_owned(), Value::from(true));
        }
        row
    }
}

/// Why a session or episode stopped early.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// All configured episodes ran to completion.
    Completed,
    /// A player stayed backgrounded past the focus-loss timeout.
    FocusLossTimeout,
    /// A player's transport dropped and never reconnected in the window.
    PartnerDisconnected,
    /// An eligibility callback excluded a player mid-game.
    Excluded,
    /// State-hash comparison detected divergence the engines could not
    /// reconcile.
    StateDivergence,
    /// A waiting participant timed out before a match formed.
    WaitTimeout,
}

/// Status block attached to every episode export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// `true` if the export does not cover a full, cleanly terminated
    /// episode sequence.
    pub is_partial: bool,
    /// Why the session stopped, when it stopped early.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
    /// The player whose fault ended the session, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnected_player_id: Option<PlayerId>,
    /// Number of episodes that completed cleanly before the export.
    pub completed_episodes: u32,
}

impl SessionStatus {
    /// Status block for a cleanly completed session.
    #[must_use]
    pub fn complete(completed_episodes: u32) -> Self {
        Self {
            is_partial: false,
            termination_reason: None,
            disconnected_player_id: None,
            completed_episodes,
        }
    }

    /// Status block for a partial session.
    #[must_use]
    pub fn partial(
        reason: TerminationReason,
        disconnected_player_id: Option<PlayerId>,
        completed_episodes: u32,
    ) -> Self {
        Self {
            is_partial: true,
            termination_reason: Some(reason),
            disconnected_player_id,
            completed_episodes,
        }
    }
}

/// One episode's worth of exported data, as emitted by the engine and
/// persisted by the server (one file per subject per episode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeExport {
    /// Episode index within the session.
    pub episode: u32,
    /// Flattened per-frame rows, in frame order.
    pub rows: Vec<Map<String, Value>>,
    /// Session status block.
    pub status: SessionStatus,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> FrameRecord {
        let p0 = PlayerId::new(0);
        let p1 = PlayerId::new(1);
        FrameRecord {
            frame: Frame::new(3),
            actions: BTreeMap::from([(p0, 2), (p1, 0)]),
            rewards: BTreeMap::from([(p0, 1.0), (p1, -1.0)]),
            terminated: BTreeMap::from([(p0, false), (p1, false)]),
            truncated: BTreeMap::from([(p0, false), (p1, false)]),
            infos: BTreeMap::from([(p0, json!({"score": 5})), (p1, Value::Null)]),
            focused: BTreeMap::from([(p0, true), (p1, false)]),
            was_speculative: false,
        }
    }

    #[test]
    fn row_flattens_per_player_columns() {
        let row = record().to_row();
        assert_eq!(row["frame"], json!(3));
        assert_eq!(row["action.0"], json!(2));
        assert_eq!(row["reward.1"], json!(-1.0));
        assert_eq!(row["info.0.score"], json!(5));
        assert_eq!(row["isFocused.1"], json!(false));
        assert!(!row.contains_key("info.1"));
        assert!(!row.contains_key("wasSpeculative"));
    }

    #[test]
    fn force_promoted_rows_are_tagged() {
        let mut rec = record();
        rec.was_speculative = true;
        assert_eq!(rec.to_row()["wasSpeculative"], json!(true));
    }

    #[test]
    fn status_block_serialization_uses_camel_case() {
        let status = SessionStatus::partial(
            TerminationReason::FocusLossTimeout,
            Some(PlayerId::new(0)),
            2,
        );
        let v = serde_json::to_value(&status).unwrap();
        assert_eq!(v["isPartial"], json!(true));
        assert_eq!(v["terminationReason"], json!("focus_loss_timeout"));
        assert_eq!(v["disconnectedPlayerId"], json!(0));
        assert_eq!(v["completedEpisodes"], json!(2));
    }

    #[test]
    fn complete_status_omits_reason() {
        let v = serde_json::to_value(SessionStatus::complete(3)).unwrap();
        assert!(v.get("terminationReason").is_none());
        assert_eq!(v["isPartial"], json!(false));
    }
}
