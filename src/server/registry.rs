//! The participant registry: the single source of truth for "who is
//! where".
//!
//! Every admitted participant moves through a fixed state machine; all
//! transitions happen here and each one appends an activity event to the
//! bounded ring the admin aggregator streams from. The registry also owns
//! the per-subject indexes (`subject → session`, `subject → waitroom`) and
//! cross-checks them against reality on every mutation, auto-cleaning
//! orphans instead of letting them wedge matchmaking.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::{SessionId, SubjectId};

/// Activity ring capacity.
const ACTIVITY_CAP: usize = 500;

/// Console/error tail capacity per participant.
const CONSOLE_TAIL_CAP: usize = 200;

/// Deadline for the entry eligibility callback.
const ENTRY_CALLBACK_DEADLINE: Duration = Duration::from_secs(5);

/// Lifecycle states of a participant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantState {
    /// Admitted, between scenes.
    Connected,
    /// Waiting for a match.
    InWaitroom,
    /// Playing a game session.
    InGame,
    /// Transport dropped; a reconnect inside the grace window resumes.
    DisconnectedReconnecting,
    /// Gone for good.
    DisconnectedTerminal,
    /// Finished the final scene.
    Completed,
}

/// Kinds of activity the registry records.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// A participant was admitted.
    Join,
    /// A participant advanced to the next scene.
    SceneAdvance,
    /// A transport drop.
    Disconnect,
    /// A reconnect inside the grace window.
    Reconnect,
    /// A game session started.
    GameStart,
    /// A game session ended.
    GameEnd,
    /// An eligibility callback excluded a participant.
    Exclude,
    /// A focus-loss timeout fired.
    FocusTimeout,
}

/// One append-only activity entry.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEvent {
    /// What happened.
    pub kind: ActivityKind,
    /// Who it happened to.
    pub subject: SubjectId,
    /// Milliseconds since the registry was created.
    pub timestamp_ms: u64,
    /// Kind-specific details.
    pub payload: Value,
}

/// A tracked participant.
#[derive(Debug)]
pub struct Participant {
    /// The participant's opaque subject id.
    pub subject: SubjectId,
    /// Current lifecycle state.
    pub state: ParticipantState,
    /// Current scene identifier.
    pub scene: String,
    /// Current transport connection.
    pub connection: crate::ConnectionId,
    /// When the transport dropped, if it did.
    pub disconnected_at: Option<Instant>,
    /// Capped tail of browser console/error lines.
    pub console_tail: VecDeque<String>,
    /// Accumulated time per scene, in milliseconds.
    pub scene_timing_ms: HashMap<String, u64>,
    scene_entered_at: Instant,
}

/// Admin-facing summary of a participant.
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantSummary {
    /// Subject id.
    pub subject: SubjectId,
    /// Lifecycle state.
    pub state: ParticipantState,
    /// Current scene.
    pub scene: String,
    /// Session the subject is in, if any.
    pub session: Option<SessionId>,
}

/// Outcome of an eligibility callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Let the participant proceed.
    Allow,
    /// Let them proceed but surface a warning message.
    Warn(String),
    /// Remove the participant with the given message.
    Exclude(String),
}

/// Context handed to the entry callback before a gym scene.
#[derive(Debug, Clone)]
pub struct EntryContext {
    /// Probe or health-report RTT, if known.
    pub ping_ms: Option<u32>,
    /// Browser user-agent string.
    pub browser: String,
    /// Device class reported by the client.
    pub device: String,
    /// The subject being admitted.
    pub subject: SubjectId,
    /// The scene being entered.
    pub scene: String,
}

/// Context handed to the continuous callback every N frames.
#[derive(Debug, Clone)]
pub struct FrameContext {
    /// Smoothed peer RTT, if known.
    pub ping_ms: Option<u32>,
    /// Whether the tab is focused.
    pub focused: bool,
    /// Current background duration in milliseconds.
    pub background_duration_ms: u64,
    /// Current frame.
    pub frame: i32,
    /// Current episode.
    pub episode: u32,
    /// The subject being checked.
    pub subject: SubjectId,
    /// The scene being played.
    pub scene: String,
}

/// Experimenter-supplied eligibility hooks. Absence of a hook is the
/// trivial always-allow implementation.
#[async_trait::async_trait]
pub trait EligibilityPolicy: Send + Sync {
    /// Called before admission to a gym scene (5-second deadline,
    /// fail-open).
    async fn on_entry(&self, ctx: EntryContext) -> Decision {
        let _ = ctx;
        Decision::Allow
    }

    /// Called during gameplay every N frames.
    async fn on_frame(&self, ctx: FrameContext) -> Decision {
        let _ = ctx;
        Decision::Allow
    }
}

/// The default policy: everyone is eligible.
#[derive(Debug, Default)]
pub struct AlwaysAllow;

#[async_trait::async_trait]
impl EligibilityPolicy for AlwaysAllow {}

#[derive(Debug, Default)]
struct RegistryInner {
    participants: HashMap<SubjectId, Participant>,
    subject_to_session: HashMap<SubjectId, SessionId>,
    waitroom: HashSet<SubjectId>,
    activity: VecDeque<ActivityEvent>,
}

/// Errors raised by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The subject is not tracked.
    #[error("unknown subject {0}")]
    UnknownSubject(SubjectId),
    /// The requested transition is not legal from the current state.
    #[error("illegal transition for {subject}: {from:?} cannot {operation}")]
    IllegalTransition {
        /// The subject whose transition was rejected.
        subject: SubjectId,
        /// The state they are in.
        from: ParticipantState,
        /// The operation that was attempted.
        operation: &'static str,
    },
}

/// The participant registry. Shared across the accept loop, the
/// matchmaker, and the session supervisor; the coarse lock is held only
/// over pure-mutation sections.
pub struct ParticipantRegistry {
    inner: Mutex<RegistryInner>,
    policy: Arc<dyn EligibilityPolicy>,
    epoch: Instant,
}

impl ParticipantRegistry {
    /// Creates a registry with the given eligibility policy.
    #[must_use]
    pub fn new(policy: Arc<dyn EligibilityPolicy>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            policy,
            epoch: Instant::now(),
        }
    }

    fn timestamp_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn log_activity_locked(
        &self,
        inner: &mut RegistryInner,
        kind: ActivityKind,
        subject: &SubjectId,
        payload: Value,
    ) {
        inner.activity.push_back(ActivityEvent {
            kind,
            subject: subject.clone(),
            timestamp_ms: self.timestamp_ms(),
            payload,
        });
        while inner.activity.len() > ACTIVITY_CAP {
            inner.activity.pop_front();
        }
    }

    /// Records an externally detected activity (game start/end, exclusion,
    /// focus timeout).
    pub fn log_activity(&self, kind: ActivityKind, subject: &SubjectId, payload: Value) {
        let mut inner = self.inner.lock();
        self.log_activity_locked(&mut inner, kind, subject, payload);
    }

    /// Admits a participant on first connection. Re-admission of a known
    /// subject updates the connection handle instead (page reload).
    pub fn admit(
        &self,
        subject: SubjectId,
        connection: crate::ConnectionId,
        scene: impl Into<String>,
    ) {
        let scene = scene.into();
        let mut inner = self.inner.lock();
        match inner.participants.get_mut(&subject) {
            Some(existing) => {
                existing.connection = connection;
                debug!(%subject, "re-admission updated connection handle");
            }
            None => {
                inner.participants.insert(
                    subject.clone(),
                    Participant {
                        subject: subject.clone(),
                        state: ParticipantState::Connected,
                        scene: scene.clone(),
                        connection,
                        disconnected_at: None,
                        console_tail: VecDeque::new(),
                        scene_timing_ms: HashMap::new(),
                        scene_entered_at: Instant::now(),
                    },
                );
                self.log_activity_locked(
                    &mut inner,
                    ActivityKind::Join,
                    &subject,
                    serde_json::json!({ "scene": scene }),
                );
                info!(%subject, "participant admitted");
            }
        }
    }

    /// Advances a participant to the next scene, banking the time spent on
    /// the previous one.
    ///
    /// # Errors
    /// [`RegistryError::UnknownSubject`] for untracked subjects.
    pub fn advance_scene(
        &self,
        subject: &SubjectId,
        next_scene: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let next_scene = next_scene.into();
        let mut inner = self.inner.lock();
        let participant = inner
            .participants
            .get_mut(subject)
            .ok_or_else(|| RegistryError::UnknownSubject(subject.clone()))?;
        let elapsed = participant.scene_entered_at.elapsed().as_millis() as u64;
        let previous = std::mem::replace(&mut participant.scene, next_scene.clone());
        *participant.scene_timing_ms.entry(previous).or_insert(0) += elapsed;
        participant.scene_entered_at = Instant::now();
        participant.state = ParticipantState::Connected;
        self.log_activity_locked(
            &mut inner,
            ActivityKind::SceneAdvance,
            subject,
            serde_json::json!({ "scene": next_scene }),
        );
        Ok(())
    }

    /// Marks a participant as waiting for a match.
    ///
    /// # Errors
    /// Rejects subjects that are mid-game or gone.
    pub fn enter_waitroom(&self, subject: &SubjectId) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        let participant = inner
            .participants
            .get_mut(subject)
            .ok_or_else(|| RegistryError::UnknownSubject(subject.clone()))?;
        match participant.state {
            ParticipantState::Connected | ParticipantState::InGame => {
                participant.state = ParticipantState::InWaitroom;
            }
            from => {
                return Err(RegistryError::IllegalTransition {
                    subject: subject.clone(),
                    from,
                    operation: "enter_waitroom",
                })
            }
        }
        inner.waitroom.insert(subject.clone());
        Ok(())
    }

    /// Moves a participant from the waitroom into a game session.
    ///
    /// # Errors
    /// Rejects subjects that are not waiting or playing single-player.
    pub fn enter_game(&self, subject: &SubjectId, session: SessionId) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        let participant = inner
            .participants
            .get_mut(subject)
            .ok_or_else(|| RegistryError::UnknownSubject(subject.clone()))?;
        match participant.state {
            ParticipantState::InWaitroom
            | ParticipantState::Connected
            | ParticipantState::DisconnectedReconnecting => {
                participant.state = ParticipantState::InGame;
                participant.disconnected_at = None;
            }
            from => {
                return Err(RegistryError::IllegalTransition {
                    subject: subject.clone(),
                    from,
                    operation: "enter_game",
                })
            }
        }
        inner.waitroom.remove(subject);
        inner.subject_to_session.insert(subject.clone(), session);
        Ok(())
    }

    /// Records a transport drop. In-game subjects get the grace window;
    /// everyone else is terminal.
    pub fn record_disconnect(&self, subject: &SubjectId) {
        let mut inner = self.inner.lock();
        let Some(participant) = inner.participants.get_mut(subject) else {
            return;
        };
        participant.disconnected_at = Some(Instant::now());
        participant.state = match participant.state {
            ParticipantState::InGame => ParticipantState::DisconnectedReconnecting,
            ParticipantState::Completed => ParticipantState::Completed,
            _ => ParticipantState::DisconnectedTerminal,
        };
        let state = participant.state;
        inner.waitroom.remove(subject);
        self.log_activity_locked(
            &mut inner,
            ActivityKind::Disconnect,
            subject,
            serde_json::json!({ "state": state }),
        );
    }

    /// Records a reconnect inside the grace window.
    ///
    /// # Errors
    /// Rejects subjects that were not in the reconnecting state.
    pub fn record_reconnect(
        &self,
        subject: &SubjectId,
        connection: crate::ConnectionId,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        let participant = inner
            .participants
            .get_mut(subject)
            .ok_or_else(|| RegistryError::UnknownSubject(subject.clone()))?;
        if participant.state != ParticipantState::DisconnectedReconnecting {
            return Err(RegistryError::IllegalTransition {
                subject: subject.clone(),
                from: participant.state,
                operation: "record_reconnect",
            });
        }
        participant.state = ParticipantState::InGame;
        participant.connection = connection;
        participant.disconnected_at = None;
        self.log_activity_locked(
            &mut inner,
            ActivityKind::Reconnect,
            subject,
            Value::Null,
        );
        Ok(())
    }

    /// Terminates a participant (timeout expiry, exclusion, completion).
    pub fn terminate(&self, subject: &SubjectId, completed: bool) {
        let mut inner = self.inner.lock();
        if let Some(participant) = inner.participants.get_mut(subject) {
            participant.state = if completed {
                ParticipantState::Completed
            } else {
                ParticipantState::DisconnectedTerminal
            };
        }
        inner.waitroom.remove(subject);
        inner.subject_to_session.remove(subject);
    }

    /// Clears the subject → session association on session teardown.
    pub fn leave_game(&self, subject: &SubjectId) {
        let mut inner = self.inner.lock();
        inner.subject_to_session.remove(subject);
        if let Some(participant) = inner.participants.get_mut(subject) {
            if participant.state == ParticipantState::InGame {
                participant.state = ParticipantState::Connected;
            }
        }
    }

    /// Cross-checks the per-subject indexes against the session registry.
    ///
    /// If the subject claims to be in a session that no longer exists, the
    /// orphaned entry is cleaned and `true` is returned so the caller can
    /// push a corrective `waiting_room_error` to the client.
    pub fn validate_subject(
        &self,
        subject: &SubjectId,
        session_exists: impl Fn(SessionId) -> bool,
    ) -> bool {
        let mut inner = self.inner.lock();
        let Some(session) = inner.subject_to_session.get(subject).copied() else {
            return false;
        };
        if session_exists(session) {
            return false;
        }
        warn!(%subject, %session, "state_validation: orphaned session index entry cleaned");
        inner.subject_to_session.remove(subject);
        if let Some(participant) = inner.participants.get_mut(subject) {
            if participant.state == ParticipantState::InGame {
                participant.state = ParticipantState::Connected;
            }
        }
        true
    }

    /// Runs the entry eligibility callback with its 5-second deadline.
    /// Timeouts and panics fail open.
    pub async fn check_entry(&self, ctx: EntryContext) -> Decision {
        let subject = ctx.subject.clone();
        match timeout(ENTRY_CALLBACK_DEADLINE, self.policy.on_entry(ctx)).await {
            Ok(decision) => decision,
            Err(_) => {
                warn!(%subject, "entry callback timed out; failing open");
                Decision::Allow
            }
        }
    }

    /// Runs the continuous eligibility callback (same fail-open contract).
    pub async fn check_frame(&self, ctx: FrameContext) -> Decision {
        let subject = ctx.subject.clone();
        match timeout(ENTRY_CALLBACK_DEADLINE, self.policy.on_frame(ctx)).await {
            Ok(decision) => decision,
            Err(_) => {
                warn!(%subject, "continuous callback timed out; failing open");
                Decision::Allow
            }
        }
    }

    /// Appends a captured console line to the participant's bounded tail.
    pub fn push_console_line(&self, subject: &SubjectId, line: impl Into<String>) {
        let mut inner = self.inner.lock();
        if let Some(participant) = inner.participants.get_mut(subject) {
            participant.console_tail.push_back(line.into());
            while participant.console_tail.len() > CONSOLE_TAIL_CAP {
                participant.console_tail.pop_front();
            }
        }
    }

    /// The participant's current state, if tracked.
    #[must_use]
    pub fn state_of(&self, subject: &SubjectId) -> Option<ParticipantState> {
        self.inner.lock().participants.get(subject).map(|p| p.state)
    }

    /// The session a subject is in, if any.
    #[must_use]
    pub fn session_of(&self, subject: &SubjectId) -> Option<SessionId> {
        self.inner.lock().subject_to_session.get(subject).copied()
    }

    /// The connection handle of a subject, if tracked.
    #[must_use]
    pub fn connection_of(&self, subject: &SubjectId) -> Option<crate::ConnectionId> {
        self.inner
            .lock()
            .participants
            .get(subject)
            .map(|p| p.connection)
    }

    /// Copy-on-snapshot summaries for the admin aggregator.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ParticipantSummary> {
        let inner = self.inner.lock();
        let mut summaries: Vec<ParticipantSummary> = inner
            .participants
            .values()
            .map(|p| ParticipantSummary {
                subject: p.subject.clone(),
                state: p.state,
                scene: p.scene.clone(),
                session: inner.subject_to_session.get(&p.subject).copied(),
            })
            .collect();
        summaries.sort_by(|a, b| a.subject.cmp(&b.subject));
        summaries
    }

    /// Activity entries recorded at or after `since_ms`.
    #[must_use]
    pub fn recent_activity(&self, since_ms: u64) -> Vec<ActivityEvent> {
        self.inner
            .lock()
            .activity
            .iter()
            .filter(|event| event.timestamp_ms >= since_ms)
            .cloned()
            .collect()
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ConnectionId;

    fn registry() -> ParticipantRegistry {
        ParticipantRegistry::new(Arc::new(AlwaysAllow))
    }

    fn subject(name: &str) -> SubjectId {
        SubjectId::new(name)
    }

    #[test]
    fn admission_and_waitroom_flow() {
        let reg = registry();
        let s = subject("s1");
        reg.admit(s.clone(), ConnectionId::fresh(), "intro");
        assert_eq!(reg.state_of(&s), Some(ParticipantState::Connected));

        reg.enter_waitroom(&s).unwrap();
        assert_eq!(reg.state_of(&s), Some(ParticipantState::InWaitroom));

        let session = SessionId::fresh();
        reg.enter_game(&s, session).unwrap();
        assert_eq!(reg.state_of(&s), Some(ParticipantState::InGame));
        assert_eq!(reg.session_of(&s), Some(session));
    }

    #[test]
    fn in_game_disconnect_gets_the_grace_window() {
        let reg = registry();
        let s = subject("s1");
        reg.admit(s.clone(), ConnectionId::fresh(), "gym");
        reg.enter_waitroom(&s).unwrap();
        reg.enter_game(&s, SessionId::fresh()).unwrap();

        reg.record_disconnect(&s);
        assert_eq!(
            reg.state_of(&s),
            Some(ParticipantState::DisconnectedReconnecting)
        );

        let conn = ConnectionId::fresh();
        reg.record_reconnect(&s, conn).unwrap();
        assert_eq!(reg.state_of(&s), Some(ParticipantState::InGame));
        assert_eq!(reg.connection_of(&s), Some(conn));
    }

    #[test]
    fn waitroom_disconnect_is_terminal() {
        let reg = registry();
        let s = subject("s1");
        reg.admit(s.clone(), ConnectionId::fresh(), "gym");
        reg.enter_waitroom(&s).unwrap();
        reg.record_disconnect(&s);
        assert_eq!(
            reg.state_of(&s),
            Some(ParticipantState::DisconnectedTerminal)
        );
        // No reconnect from terminal.
        assert!(reg.record_reconnect(&s, ConnectionId::fresh()).is_err());
    }

    #[test]
    fn orphaned_session_entries_are_cleaned() {
        let reg = registry();
        let s = subject("s1");
        reg.admit(s.clone(), ConnectionId::fresh(), "gym");
        reg.enter_waitroom(&s).unwrap();
        reg.enter_game(&s, SessionId::fresh()).unwrap();

        // The session registry no longer knows this session.
        let cleaned = reg.validate_subject(&s, |_| false);
        assert!(cleaned);
        assert_eq!(reg.session_of(&s), None);
        assert_eq!(reg.state_of(&s), Some(ParticipantState::Connected));

        // A consistent subject is left alone.
        assert!(!reg.validate_subject(&s, |_| true));
    }

    #[test]
    fn transitions_emit_activity_events() {
        let reg = registry();
        let s = subject("s1");
        reg.admit(s.clone(), ConnectionId::fresh(), "intro");
        reg.advance_scene(&s, "gym").unwrap();
        reg.record_disconnect(&s);

        let kinds: Vec<ActivityKind> = reg
            .recent_activity(0)
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&ActivityKind::Join));
        assert!(kinds.contains(&ActivityKind::SceneAdvance));
        assert!(kinds.contains(&ActivityKind::Disconnect));
    }

    #[test]
    fn activity_ring_is_bounded() {
        let reg = registry();
        let s = subject("s1");
        reg.admit(s.clone(), ConnectionId::fresh(), "intro");
        for _ in 0..(ACTIVITY_CAP + 100) {
            reg.log_activity(ActivityKind::GameStart, &s, Value::Null);
        }
        assert!(reg.recent_activity(0).len() <= ACTIVITY_CAP);
    }

    #[test]
    fn console_tail_is_capped() {
        let reg = registry();
        let s = subject("s1");
        reg.admit(s.clone(), ConnectionId::fresh(), "intro");
        for i in 0..(CONSOLE_TAIL_CAP + 50) {
            reg.push_console_line(&s, format!("line {i}"));
        }
        let inner = reg.inner.lock();
        assert_eq!(
            inner.participants[&s].console_tail.len(),
            CONSOLE_TAIL_CAP
        );
    }

    struct SlowPolicy;

    #[async_trait::async_trait]
    impl EligibilityPolicy for SlowPolicy {
        async fn on_entry(&self, _ctx: EntryContext) -> Decision {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Decision::Exclude("too slow to matter".to_owned())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_entry_callback_fails_open() {
        let reg = ParticipantRegistry::new(Arc::new(SlowPolicy));
        let decision = reg
            .check_entry(EntryContext {
                ping_ms: Some(40),
                browser: "firefox".to_owned(),
                device: "desktop".to_owned(),
                subject: subject("s1"),
                scene: "gym".to_owned(),
            })
            .await;
        assert_eq!(decision, Decision::Allow);
    }

    struct ExcludePolicy;

    #[async_trait::async_trait]
    impl EligibilityPolicy for ExcludePolicy {
        async fn on_entry(&self, _ctx: EntryContext) -> Decision {
            Decision::Exclude("mobile devices are not supported".to_owned())
        }
    }

    #[tokio::test]
    async fn entry_callback_can_exclude() {
        let reg = ParticipantRegistry::new(Arc::new(ExcludePolicy));
        let decision = reg
            .check_entry(EntryContext {
                ping_ms: None,
                browser: "safari".to_owned(),
                device: "mobile".to_owned(),
                subject: subject("s1"),
                scene: "gym".to_owned(),
            })
            .await;
        assert!(matches!(decision, Decision::Exclude(_)));
    }
}
