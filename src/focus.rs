//! Background-safe timing and focus-loss accounting.
//!
//! Browsers throttle ordinary timers in background tabs, which would stall
//! the game loop and desynchronize the peers. The tick source is therefore
//! a seam: the browser runtime drives it from an off-main-thread worker
//! timer (with a `MessageChannel` watchdog) that keeps counting elapsed
//! time regardless of tab visibility; tests drive it manually.
//!
//! While a tab is backgrounded the local side stops advancing frames and
//! substitutes the idle action; the partner's inputs are buffered
//! separately and replayed by fast-forward on refocus. The focus tracker
//! also enforces the bounded-absence timeout that ends a session whose
//! player stays hidden too long.

use web_time::{Duration, Instant};

use crate::PlayerId;

/// Source of game-loop ticks that must keep measuring time while the tab
/// is backgrounded.
pub trait TickSource {
    /// Number of whole ticks elapsed since the last call. A backgrounded
    /// implementation keeps counting; the driver decides what a tick does.
    fn drain_ticks(&mut self, now: Instant) -> u32;
}

/// Fixed-interval tick source backed by a monotonic clock.
///
/// Unlike a `setTimeout` chain, elapsed time is measured from the wall
/// clock on every poll, so ticks missed while throttled are reported in a
/// batch instead of being silently dropped.
#[derive(Debug)]
pub struct FixedStepTicks {
    interval: Duration,
    last: Option<Instant>,
}

impl FixedStepTicks {
    /// Creates a tick source with the given frame interval.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }
}

impl TickSource for FixedStepTicks {
    fn drain_ticks(&mut self, now: Instant) -> u32 {
        let last = *self.last.get_or_insert(now);
        let elapsed = now.saturating_duration_since(last);
        let ticks = (elapsed.as_nanos() / self.interval.as_nanos().max(1)) as u32;
        if ticks > 0 {
            self.last = Some(last + self.interval * ticks);
        }
        ticks
    }
}

/// What the bounded-absence check found.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FocusVerdict {
    /// The player is focused, or hidden within the allowed window.
    Ok,
    /// The player has been hidden longer than the configured timeout; the
    /// session must end with a partial export.
    TimedOut {
        /// The player that exceeded the timeout.
        player: PlayerId,
        /// How long they were hidden when the timeout fired.
        hidden_for: Duration,
    },
}

/// Tracks both players' focus flags and the local background duration.
#[derive(Debug)]
pub struct FocusTracker {
    local_player: PlayerId,
    focused: bool,
    background_since: Option<Instant>,
    /// Partner focus as last received; notification latency makes this
    /// column diverge between exports by design, so it is excluded from
    /// byte-parity comparison.
    partner_focused: bool,
    /// `None` disables the timeout (configured as `0`).
    timeout: Option<Duration>,
    timeout_reported: bool,
}

impl FocusTracker {
    /// Creates a tracker for `local_player`. `timeout_ms = 0` disables the
    /// bounded-absence check.
    #[must_use]
    pub fn new(local_player: PlayerId, timeout_ms: u64) -> Self {
        Self {
            local_player,
            focused: true,
            background_since: None,
            partner_focused: true,
            timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
            timeout_reported: false,
        }
    }

    /// Whether the local tab is currently focused.
    #[must_use]
    pub fn is_focused(&self) -> bool {
        self.focused
    }

    /// Whether the local tab is backgrounded.
    #[must_use]
    pub fn is_backgrounded(&self) -> bool {
        !self.focused
    }

    /// Partner focus flag as last received.
    #[must_use]
    pub fn partner_focused(&self) -> bool {
        self.partner_focused
    }

    /// Records a local visibility change.
    pub fn set_focused(&mut self, focused: bool, now: Instant) {
        if self.focused == focused {
            return;
        }
        self.focused = focused;
        self.background_since = (!focused).then_some(now);
        if focused {
            self.timeout_reported = false;
        }
    }

    /// Records the partner's reported focus flag.
    pub fn set_partner_focused(&mut self, focused: bool) {
        self.partner_focused = focused;
    }

    /// How long the local tab has been hidden, if it is.
    #[must_use]
    pub fn background_duration(&self, now: Instant) -> Option<Duration> {
        self.background_since
            .map(|since| now.saturating_duration_since(since))
    }

    /// Checks the bounded-absence timeout. Fires at most once per
    /// background interval.
    pub fn check_timeout(&mut self, now: Instant) -> FocusVerdict {
        let Some(timeout) = self.timeout else {
            return FocusVerdict::Ok;
        };
        if self.timeout_reported {
            return FocusVerdict::Ok;
        }
        match self.background_duration(now) {
            Some(hidden_for) if hidden_for >= timeout => {
                self.timeout_reported = true;
                FocusVerdict::TimedOut {
                    player: self.local_player,
                    hidden_for,
                }
            }
            _ => FocusVerdict::Ok,
        }
    }
}

// #########
// # TESTS #
// #########
