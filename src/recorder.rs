//! Dual-buffer per-frame data recording.
//!
//! Every stepped frame is first written to the *speculative* buffer; once
//! all human actions for a frame are confirmed, its record moves to the
//! append-only *confirmed* buffer. Only the confirmed buffer ever feeds the
//! episode export, so a rollback can freely overwrite speculative records
//! without corrupting data already promised to disk.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::warn;

use crate::frame_info::FrameRecord;
use crate::Frame;

/// The per-episode frame store.
#[derive(Debug, Default)]
pub struct EpisodeRecorder {
    speculative: BTreeMap<Frame, FrameRecord>,
    confirmed: BTreeMap<Frame, FrameRecord>,
    force_promoted: u32,
}

impl EpisodeRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes (or overwrites, during rollback replay) a speculative record.
    ///
    /// A frame that has already been promoted is never touched again: the
    /// confirmed buffer is append-only.
    pub fn record_speculative(&mut self, record: FrameRecord) {
        if self.confirmed.contains_key(&record.frame) {
            warn!(frame = %record.frame, "ignoring speculative write for an already confirmed frame");
            return;
        }
        self.speculative.insert(record.frame, record);
    }

    /// Discards speculative records with `frame >= target`, as the first
    /// step of a rollback. Replay rewrites them.
    pub fn discard_speculative_from(&mut self, target: Frame) {
        self.speculative.retain(|&frame, _| frame < target);
    }

    /// Moves the speculative record for `frame` into the confirmed buffer.
    ///
    /// Returns `true` if a record was promoted. Promotion happens exactly
    /// once per frame, in frame order.
    pub fn promote(&mut self, frame: Frame) -> bool {
        match self.speculative.remove(&frame) {
            Some(mut record) => {
                record.was_speculative = false;
                self.confirmed.insert(frame, record);
                true
            }
            None => false,
        }
    }

    /// Force-promotes every remaining speculative record strictly below
    /// `boundary`.
    ///
    /// Used at the agreed episode end: both peers have executed identical
    /// steps by then, so unacknowledged records are correct, just never
    /// confirmed. Promoted records keep their `was_speculative` tag and the
    /// promotion is logged.
    pub fn force_promote_below(&mut self, boundary: Frame) -> u32 {
        let frames: Vec<Frame> = self
            .speculative
            .keys()
            .copied()
            .filter(|f| *f < boundary)
            .collect();
        let count = frames.len() as u32;
        if count > 0 {
            warn!(
                count,
                boundary = %boundary,
                "force-promoting unconfirmed frames at episode boundary"
            );
        }
        for frame in frames {
            if let Some(mut record) = self.speculative.remove(&frame) {
                record.was_speculative = true;
                self.confirmed.insert(frame, record);
            }
        }
        self.force_promoted += count;
        count
    }

    /// Returns the confirmed record for `frame`, if promoted.
    #[must_use]
    pub fn confirmed(&self, frame: Frame) -> Option<&FrameRecord> {
        self.confirmed.get(&frame)
    }

    /// Returns the speculative record for `frame`, if present.
    #[must_use]
    pub fn speculative(&self, frame: Frame) -> Option<&FrameRecord> {
        self.speculative.get(&frame)
    }

    /// Patches the focus flag of a player on an already stored speculative
    /// record (focus notifications may trail the frame they describe).
    pub fn set_focus_flag(&mut self, frame: Frame, player: crate::PlayerId, focused: bool) {
        if let Some(record) = self.speculative.get_mut(&frame) {
            record.focused.insert(player, focused);
        }
    }

    /// Export rows for all confirmed frames in `[0, boundary)`, in frame
    /// order.
    #[must_use]
    pub fn export_rows(&self, boundary: Frame) -> Vec<Map<String, Value>> {
        self.confirmed
            .values()
            .filter(|r| r.frame < boundary)
            .map(FrameRecord::to_row)
            .collect()
    }

    /// Number of confirmed records below `boundary`.
    #[must_use]
    pub fn confirmed_rows(&self, boundary: Frame) -> usize {
        self.confirmed.keys().filter(|f| **f < boundary).count()
    }

    /// Number of records force-promoted so far this episode.
    #[must_use]
    pub fn force_promoted(&self) -> u32 {
        self.force_promoted
    }

    /// Number of records still speculative.
    #[must_use]
    pub fn speculative_len(&self) -> usize {
        self.speculative.len()
    }

    /// Clears both buffers for the next episode.
    pub fn reset(&mut self) {
        self.speculative.clear();
        self.confirmed.clear();
        self.force_promoted = 0;
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::PlayerId;

    fn record(frame: i32, action: i32) -> FrameRecord {
        let p = PlayerId::new(0);
        FrameRecord {
            frame: Frame::new(frame),
            actions: BTreeMap::from([(p, action)]),
            rewards: BTreeMap::from([(p, 0.0)]),
            terminated: BTreeMap::from([(p, false)]),
            truncated: BTreeMap::from([(p, false)]),
            infos: BTreeMap::new(),
            focused: BTreeMap::from([(p, true)]),
            was_speculative: true,
        }
    }

    #[test]
    fn a_frame_is_never_in_both_buffers() {
        let mut rec = EpisodeRecorder::new();
        rec.record_speculative(record(0, 1));
        assert!(rec.speculative(Frame::new(0)).is_some());
        assert!(rec.confirmed(Frame::new(0)).is_none());

        assert!(rec.promote(Frame::new(0)));
        assert!(rec.speculative(Frame::new(0)).is_none());
        assert!(rec.confirmed(Frame::new(0)).is_some());
    }

    #[test]
    fn promotion_clears_speculative_tag() {
        let mut rec = EpisodeRecorder::new();
        rec.record_speculative(record(0, 1));
        rec.promote(Frame::new(0));
        assert!(!rec.confirmed(Frame::new(0)).unwrap().was_speculative);
    }

    #[test]
    fn confirmed_buffer_is_append_only() {
        let mut rec = EpisodeRecorder::new();
        rec.record_speculative(record(0, 1));
        rec.promote(Frame::new(0));
        // A late speculative write for the promoted frame is dropped.
        rec.record_speculative(record(0, 9));
        assert!(rec.speculative(Frame::new(0)).is_none());
        assert_eq!(
            rec.confirmed(Frame::new(0)).unwrap().actions[&PlayerId::new(0)],
            1
        );
    }

    #[test]
    fn rollback_discard_only_touches_target_and_later() {
        let mut rec = EpisodeRecorder::new();
        for f in 0..5 {
            rec.record_speculative(record(f, f));
        }
        rec.discard_speculative_from(Frame::new(3));
        assert!(rec.speculative(Frame::new(2)).is_some());
        assert!(rec.speculative(Frame::new(3)).is_none());
        assert!(rec.speculative(Frame::new(4)).is_none());
    }

    #[test]
    fn force_promote_respects_boundary_and_keeps_tag() {
        let mut rec = EpisodeRecorder::new();
        for f in 0..6 {
            rec.record_speculative(record(f, f));
        }
        let promoted = rec.force_promote_below(Frame::new(4));
        assert_eq!(promoted, 4);
        assert_eq!(rec.confirmed_rows(Frame::new(100)), 4);
        assert!(rec.confirmed(Frame::new(3)).unwrap().was_speculative);
        // Frames at or past the boundary stay behind and are never exported.
        assert!(rec.confirmed(Frame::new(4)).is_none());
        assert!(rec.speculative(Frame::new(4)).is_some());
    }

    #[test]
    fn export_rows_are_bounded_and_ordered() {
        let mut rec = EpisodeRecorder::new();
        for f in 0..5 {
            rec.record_speculative(record(f, f));
            rec.promote(Frame::new(f));
        }
        let rows = rec.export_rows(Frame::new(3));
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["frame"], serde_json::json!(0));
        assert_eq!(rows[2]["frame"], serde_json::json!(2));
    }
}
