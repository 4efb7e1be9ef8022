//! Per-player input buffering.
//!
//! Each human player of a session has one [`InputBuffer`] mapping frame
//! numbers to submitted actions. Entries are either *confirmed* (the actual
//! action was received) or *predicted* (a stand-in that may be rolled back
//! once the real action arrives).

use std::collections::BTreeMap;

use crate::env::Action;
use crate::{Frame, PlayerId};

/// Entries older than this many frames behind the current frame become
/// candidates for pruning — but only once they are also confirmed.
pub const PRUNE_HORIZON: i32 = 60;

/// A buffered action for one frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InputEntry {
    /// The action value.
    pub action: Action,
    /// Whether the action was actually received (as opposed to predicted).
    pub confirmed: bool,
}

/// Result of storing a confirmed action.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InsertResult {
    /// The frame already held this confirmed action; nothing changed.
    Duplicate,
    /// The action was stored (no prior entry, or it matched the prediction).
    Confirmed,
    /// The action contradicts a stored prediction; a rollback to this frame
    /// is required.
    Mispredicted {
        /// The action that was predicted and has now turned out wrong.
        predicted: Action,
    },
}

/// Frame-indexed action store for a single player.
#[derive(Debug, Clone)]
pub struct InputBuffer {
    player: PlayerId,
    idle_action: Action,
    entries: BTreeMap<Frame, InputEntry>,
    /// Highest frame with a confirmed entry, and that entry's action. Basis
    /// for prediction: repeat the last observed action.
    last_confirmed: Option<(Frame, Action)>,
}

impl InputBuffer {
    /// Creates an empty buffer for `player`. `idle_action` is the
    /// prediction used before any action has been observed.
    #[must_use]
    pub fn new(player: PlayerId, idle_action: Action) -> Self {
        Self {
            player,
            idle_action,
            entries: BTreeMap::new(),
            last_confirmed: None,
        }
    }

    /// The player this buffer belongs to.
    #[must_use]
    pub fn player(&self) -> PlayerId {
        self.player
    }

    /// Stores a confirmed action for `frame`.
    ///
    /// A later arrival replaces a stored prediction for the same frame;
    /// confirmed entries are never overwritten (packets are de-duplicated
    /// by (frame, player)).
    pub fn insert_confirmed(&mut self, frame: Frame, action: Action) -> InsertResult {
        let result = match self.entries.get_mut(&frame) {
            Some(entry) if entry.confirmed => return InsertResult::Duplicate,
            Some(entry) => {
                let predicted = entry.action;
                entry.action = action;
                entry.confirmed = true;
                if predicted == action {
                    InsertResult::Confirmed
                } else {
                    InsertResult::Mispredicted { predicted }
                }
            }
            None => {
                self.entries.insert(
                    frame,
                    InputEntry {
                        action,
                        confirmed: true,
                    },
                );
                InsertResult::Confirmed
            }
        };
        if self.last_confirmed.is_none_or(|(f, _)| frame > f) {
            self.last_confirmed = Some((frame, action));
        }
        result
    }

    /// Stores a predicted action for `frame`. Never overwrites an existing
    /// entry.
    pub fn record_prediction(&mut self, frame: Frame, action: Action) {
        self.entries.entry(frame).or_insert(InputEntry {
            action,
            confirmed: false,
        });
    }

    /// Replaces the prediction stored for `frame` (rollback replay
    /// re-predicts from the refreshed confirmation basis). Confirmed
    /// entries are left alone.
    pub fn overwrite_prediction(&mut self, frame: Frame, action: Action) {
        match self.entries.get_mut(&frame) {
            Some(entry) if !entry.confirmed => entry.action = action,
            Some(_) => {}
            None => {
                self.entries.insert(
                    frame,
                    InputEntry {
                        action,
                        confirmed: false,
                    },
                );
            }
        }
    }

    /// Returns the entry stored for `frame`, if any.
    #[must_use]
    pub fn get(&self, frame: Frame) -> Option<&InputEntry> {
        self.entries.get(&frame)
    }

    /// Returns `true` if `frame` holds a confirmed action.
    #[must_use]
    pub fn is_confirmed(&self, frame: Frame) -> bool {
        self.entries.get(&frame).is_some_and(|e| e.confirmed)
    }

    /// The action to assume for a frame with no received input: repeat the
    /// last observed action, or the idle action before anything arrived.
    #[must_use]
    pub fn predict(&self) -> Action {
        self.last_confirmed
            .map_or(self.idle_action, |(_, action)| action)
    }

    /// The action to use when replaying `frame` during rollback: the
    /// confirmed action where present, otherwise the previously stored
    /// prediction, otherwise a fresh prediction.
    #[must_use]
    pub fn replay_action(&self, frame: Frame) -> Action {
        self.entries
            .get(&frame)
            .map_or_else(|| self.predict(), |e| e.action)
    }

    /// Highest frame for which any entry exists (confirmed or predicted).
    #[must_use]
    pub fn max_frame(&self) -> Option<Frame> {
        self.entries.keys().next_back().copied()
    }

    /// Highest frame holding a confirmed action.
    #[must_use]
    pub fn max_confirmed_frame(&self) -> Option<Frame> {
        self.last_confirmed.map(|(f, _)| f)
    }

    /// Discards old entries.
    ///
    /// An entry is pruned only when it is both outside the retention
    /// horizon (`frame < current_frame - 60`) *and* already confirmed
    /// (`frame <= confirmed_frame`). Pruning unconfirmed frames would
    /// create permanent gaps that stall confirmation and silently corrupt
    /// the exported trace.
    pub fn prune(&mut self, current_frame: Frame, confirmed_frame: Frame) {
        let horizon = current_frame - PRUNE_HORIZON;
        self.entries
            .retain(|&frame, _| !(frame < horizon && frame <= confirmed_frame));
    }

    /// Number of buffered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no entries are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clears all per-episode state. Prediction history resets too: the
    /// first frame of a fresh episode predicts the idle action again.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.last_confirmed = None;
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn buffer() -> InputBuffer {
        InputBuffer::new(PlayerId::new(1), 0)
    }

    #[test]
    fn prediction_defaults_to_idle_then_repeats_last() {
        let mut buf = buffer();
        assert_eq!(buf.predict(), 0);
        buf.insert_confirmed(Frame::new(0), 7);
        assert_eq!(buf.predict(), 7);
        // An older confirmation does not move the prediction basis back.
        buf.insert_confirmed(Frame::new(5), 3);
        buf.insert_confirmed(Frame::new(2), 9);
        assert_eq!(buf.predict(), 3);
    }

    #[test]
    fn confirmation_over_matching_prediction_is_not_a_misprediction() {
        let mut buf = buffer();
        buf.record_prediction(Frame::new(4), 2);
        assert_eq!(
            buf.insert_confirmed(Frame::new(4), 2),
            InsertResult::Confirmed
        );
    }

    #[test]
    fn confirmation_over_divergent_prediction_reports_misprediction() {
        let mut buf = buffer();
        buf.record_prediction(Frame::new(4), 2);
        assert_eq!(
            buf.insert_confirmed(Frame::new(4), 5),
            InsertResult::Mispredicted { predicted: 2 }
        );
        assert_eq!(buf.get(Frame::new(4)).unwrap().action, 5);
        assert!(buf.is_confirmed(Frame::new(4)));
    }

    #[test]
    fn duplicate_confirmations_are_ignored() {
        let mut buf = buffer();
        buf.insert_confirmed(Frame::new(4), 5);
        assert_eq!(
            buf.insert_confirmed(Frame::new(4), 1),
            InsertResult::Duplicate
        );
        assert_eq!(buf.get(Frame::new(4)).unwrap().action, 5);
    }

    #[test]
    fn prediction_never_overwrites_confirmed() {
        let mut buf = buffer();
        buf.insert_confirmed(Frame::new(4), 5);
        buf.record_prediction(Frame::new(4), 1);
        assert_eq!(buf.get(Frame::new(4)).unwrap().action, 5);
    }

    #[test]
    fn pruning_never_removes_unconfirmed_frames() {
        let mut buf = buffer();
        // Old unconfirmed prediction, far outside the horizon.
        buf.record_prediction(Frame::new(0), 1);
        // Old confirmed entries.
        buf.insert_confirmed(Frame::new(1), 2);
        buf.insert_confirmed(Frame::new(2), 2);
        // Prune with a current frame far in the future but confirmation
        // lagging at frame 1.
        buf.prune(Frame::new(500), Frame::new(1));
        assert!(buf.get(Frame::new(0)).is_some(), "unconfirmed must survive");
        assert!(buf.get(Frame::new(1)).is_none(), "old confirmed pruned");
        assert!(
            buf.get(Frame::new(2)).is_some(),
            "frames past confirmed_frame must survive"
        );
    }

    #[test]
    fn pruning_keeps_recent_frames() {
        let mut buf = buffer();
        for f in 0..100 {
            buf.insert_confirmed(Frame::new(f), 1);
        }
        buf.prune(Frame::new(100), Frame::new(99));
        // Horizon is 100 - 60 = 40: frames 40.. stay.
        assert!(buf.get(Frame::new(39)).is_none());
        assert!(buf.get(Frame::new(40)).is_some());
        assert_eq!(buf.len(), 60);
    }

    #[test]
    fn replay_action_prefers_stored_entry() {
        let mut buf = buffer();
        buf.insert_confirmed(Frame::new(0), 9);
        buf.record_prediction(Frame::new(1), 4);
        assert_eq!(buf.replay_action(Frame::new(0)), 9);
        assert_eq!(buf.replay_action(Frame::new(1)), 4);
        // Nothing stored for frame 2: fresh prediction (last observed).
        assert_eq!(buf.replay_action(Frame::new(2)), 9);
    }

    #[test]
    fn reset_clears_prediction_basis() {
        let mut buf = buffer();
        buf.insert_confirmed(Frame::new(10), 6);
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.predict(), 0);
        assert_eq!(buf.max_confirmed_frame(), None);
    }
}
