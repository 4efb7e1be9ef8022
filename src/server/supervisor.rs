//! Session supervision: one task per game session, owning all per-session
//! state from match-formed to torn-down.
//!
//! The supervisor creates sessions from matches, broadcasts the start
//! countdown off the critical path, routes commands into each session's
//! mailbox, and guarantees a single teardown path (game end, exclusion,
//! and disconnect timeout all converge on it).
//!
//! In peer-to-peer mode the task is thin: per-frame inputs never touch the
//! server, so the task only manages lifecycle, overlays, and the
//! reconnect window. In server-authoritative mode the task owns the
//! environment and drives the tick loop itself, broadcasting rendered
//! state to thin clients.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Duration, Instant, Sleep};
use tracing::{debug, info, warn};

use crate::env::{ActionMap, ServerEnvironment};
use crate::frame_info::{EpisodeExport, FrameRecord, SessionStatus, TerminationReason};
use crate::network::hub::TransportHub;
use crate::network::messages::{AckStatus, PlayerSlot, ServerMessage};
use crate::recorder::EpisodeRecorder;
use crate::server::config::MultiplayerConfig;
use crate::server::export::ExportSink;
use crate::server::registry::{ActivityKind, ParticipantRegistry};
use crate::{ConnectionId, Frame, PlayerId, SessionId, SessionMode, SubjectId};

/// Length of the match-found countdown.
const COUNTDOWN_SECONDS: u32 = 3;

/// Per-session runtime options, derived from the scene's multiplayer
/// config.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How the session is driven.
    pub mode: SessionMode,
    /// The gym scene this session belongs to.
    pub scene: String,
    /// Reconnection window after a transport drop.
    pub reconnection_timeout: Duration,
    /// Overlay message for the surviving peer of a disconnect.
    pub partner_disconnect_message: String,
    /// Episodes per session.
    pub num_episodes: u32,
    /// Episode truncation (server-authoritative loop).
    pub max_steps: Option<u32>,
    /// Idle action substituted for absent players.
    pub idle_action: i32,
    /// Tick interval of the server-authoritative loop.
    pub tick_interval: Duration,
}

impl SessionConfig {
    /// Builds session options from a scene's multiplayer config.
    #[must_use]
    pub fn from_multiplayer(cfg: &MultiplayerConfig, scene: impl Into<String>) -> Self {
        Self {
            mode: cfg.mode,
            scene: scene.into(),
            reconnection_timeout: Duration::from_millis(cfg.reconnection_timeout_ms),
            partner_disconnect_message: cfg.partner_disconnect_message.clone(),
            num_episodes: cfg.num_episodes,
            max_steps: None,
            idle_action: 0,
            tick_interval: Duration::from_millis(50),
        }
    }
}

/// Commands routed into a session's mailbox.
#[derive(Debug)]
pub enum SessionCommand {
    /// A per-frame action from a thin client (server-authoritative only).
    PlayerAction {
        /// The acting subject.
        subject: SubjectId,
        /// The action code.
        action: i32,
    },
    /// A participant's transport dropped.
    Disconnect {
        /// The dropped subject.
        subject: SubjectId,
    },
    /// A participant reconnected inside the grace window.
    Reconnect {
        /// The returning subject.
        subject: SubjectId,
        /// Their new connection.
        connection: ConnectionId,
    },
    /// An eligibility callback excluded a participant mid-game.
    Exclude {
        /// The excluded subject.
        subject: SubjectId,
        /// Overlay message for the excluded participant.
        message: String,
    },
    /// A peer-to-peer client finished its session cleanly.
    GameFinished {
        /// The finishing subject.
        subject: SubjectId,
    },
    /// Unconditional termination.
    Terminate {
        /// Why, if abnormal.
        reason: Option<TerminationReason>,
    },
}

/// Supervisor-side record of a live session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSummary {
    /// The session id.
    pub session: SessionId,
    /// How it is driven.
    pub mode: SessionMode,
    /// Ordered player slots.
    pub players: Vec<PlayerSlot>,
    /// The scene it belongs to.
    pub scene: String,
}

struct SessionHandle {
    summary: SessionSummary,
    mailbox: mpsc::UnboundedSender<SessionCommand>,
}

type SessionTable = Arc<Mutex<HashMap<SessionId, SessionHandle>>>;

/// Owns every live game session.
pub struct SessionSupervisor {
    hub: Arc<TransportHub>,
    registry: Arc<ParticipantRegistry>,
    export: Arc<ExportSink>,
    sessions: SessionTable,
}

/// The room a session broadcasts to.
#[must_use]
pub fn session_room(session: SessionId) -> String {
    format!("session_{session}")
}

impl SessionSupervisor {
    /// Creates a supervisor.
    #[must_use]
    pub fn new(
        hub: Arc<TransportHub>,
        registry: Arc<ParticipantRegistry>,
        export: Arc<ExportSink>,
    ) -> Self {
        Self {
            hub,
            registry,
            export,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Creates a session from a formed match and starts its task.
    ///
    /// Human subjects occupy the first player slots in the given order;
    /// `bot_count` bot slots follow. In server-authoritative mode the
    /// caller supplies the environment instance.
    pub fn create_session(
        &self,
        humans: Vec<SubjectId>,
        bot_count: usize,
        cfg: SessionConfig,
        env: Option<Box<dyn ServerEnvironment>>,
    ) -> SessionId {
        let session = SessionId::fresh();
        let room = session_room(session);

        let mut players = Vec::new();
        for (index, subject) in humans.iter().enumerate() {
            players.push(PlayerSlot {
                player: PlayerId::new(index),
                subject: Some(subject.clone()),
            });
        }
        for offset in 0..bot_count {
            players.push(PlayerSlot {
                player: PlayerId::new(humans.len() + offset),
                subject: None,
            });
        }

        for subject in &humans {
            if let Err(err) = self.registry.enter_game(subject, session) {
                warn!(%err, %subject, "subject could not enter game");
            }
            if let Some(connection) = self.registry.connection_of(subject) {
                self.hub.join_room(&room, connection);
            }
            self.registry.log_activity(
                ActivityKind::GameStart,
                subject,
                serde_json::json!({ "session": session.to_string() }),
            );
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let summary = SessionSummary {
            session,
            mode: cfg.mode,
            players: players.clone(),
            scene: cfg.scene.clone(),
        };
        self.sessions.lock().insert(
            session,
            SessionHandle {
                summary,
                mailbox: tx,
            },
        );

        let countdown = humans.len() > 1;
        if countdown {
            self.hub.broadcast(
                &room,
                &ServerMessage::MatchFoundCountdown {
                    seconds: COUNTDOWN_SECONDS,
                },
                None,
            );
        }

        let task = SessionTask {
            session,
            cfg,
            hub: self.hub.clone(),
            registry: self.registry.clone(),
            export: self.export.clone(),
            sessions: self.sessions.clone(),
            humans: humans
                .iter()
                .enumerate()
                .map(|(index, subject)| (PlayerId::new(index), subject.clone()))
                .collect(),
            players,
            rx,
            env,
            countdown,
        };
        tokio::spawn(task.run());
        info!(%session, humans = humans.len(), bot_count, "session created");
        session
    }

    /// Routes a command to a session. Returns `false` for unknown or
    /// already-terminated sessions.
    pub fn command(&self, session: SessionId, command: SessionCommand) -> bool {
        let sessions = self.sessions.lock();
        match sessions.get(&session) {
            Some(handle) => handle.mailbox.send(command).is_ok(),
            None => false,
        }
    }

    /// Routes a command to whatever session the subject is in.
    pub fn command_for_subject(&self, subject: &SubjectId, command: SessionCommand) -> bool {
        match self.registry.session_of(subject) {
            Some(session) => self.command(session, command),
            None => false,
        }
    }

    /// Whether a session is still live.
    #[must_use]
    pub fn session_exists(&self, session: SessionId) -> bool {
        self.sessions.lock().contains_key(&session)
    }

    /// Copy-on-snapshot summaries for the admin aggregator.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SessionSummary> {
        self.sessions
            .lock()
            .values()
            .map(|h| h.summary.clone())
            .collect()
    }

    /// Handles an acked `emit_episode_data` from a client: persists the
    /// bundle and acknowledges.
    pub fn on_episode_data(
        &self,
        connection: ConnectionId,
        ack_id: u64,
        subject: &SubjectId,
        export: &EpisodeExport,
    ) {
        let status = match self.export.write(subject, export) {
            Ok(_) => AckStatus::Ok,
            Err(err) => {
                warn!(%err, %subject, "episode export could not be persisted");
                AckStatus::Error
            }
        };
        if let Err(err) = self.hub.send(connection, ServerMessage::Ack { ack_id, status }) {
            warn!(%err, "ack for episode data could not be delivered");
        }
    }
}

struct SessionTask {
    session: SessionId,
    cfg: SessionConfig,
    hub: Arc<TransportHub>,
    registry: Arc<ParticipantRegistry>,
    export: Arc<ExportSink>,
    sessions: SessionTable,
    humans: Vec<(PlayerId, SubjectId)>,
    players: Vec<PlayerSlot>,
    rx: mpsc::UnboundedReceiver<SessionCommand>,
    env: Option<Box<dyn ServerEnvironment>>,
    countdown: bool,
}

impl SessionTask {
    async fn run(mut self) {
        if self.countdown {
            // The countdown sleeps on the session task, never on the
            // accept path.
            sleep(Duration::from_secs(u64::from(COUNTDOWN_SECONDS))).await;
        }
        self.broadcast_start();

        let termination = match self.cfg.mode {
            SessionMode::P2p => self.run_p2p().await,
            SessionMode::ServerAuthoritative => self.run_server_auth().await,
        };
        self.teardown(termination);
    }

    fn broadcast_start(&self) {
        for (player, subject) in &self.humans {
            let Some(connection) = self.registry.connection_of(subject) else {
                continue;
            };
            let message = ServerMessage::StartGame {
                session: self.session,
                mode: self.cfg.mode,
                player_slot: *player,
                players: self.players.clone(),
            };
            if let Err(err) = self.hub.send(connection, message) {
                warn!(%err, %subject, "start_game could not be delivered");
            }
        }
    }

    fn subject_of(&self, player: PlayerId) -> Option<&SubjectId> {
        self.humans
            .iter()
            .find(|(p, _)| *p == player)
            .map(|(_, s)| s)
    }

    fn player_of(&self, subject: &SubjectId) -> Option<PlayerId> {
        self.humans
            .iter()
            .find(|(_, s)| s == subject)
            .map(|(p, _)| *p)
    }

    /// Peer-to-peer mode: lifecycle only. Returns the abnormal
    /// termination, if any.
    async fn run_p2p(&mut self) -> Option<(TerminationReason, Option<SubjectId>)> {
        let room = session_room(self.session);
        let mut reconnect_deadline: Option<(SubjectId, Pin<Box<Sleep>>)> = None;
        let mut finished: HashSet<SubjectId> = HashSet::new();

        loop {
            let received = if let Some((_, deadline)) = reconnect_deadline.as_mut() {
                tokio::select! {
                    cmd = self.rx.recv() => Some(cmd),
                    () = deadline => None,
                }
            } else {
                Some(self.rx.recv().await)
            };

            let command = match received {
                // The reconnect window expired.
                None => {
                    let (subject, _) = reconnect_deadline
                        .take()
                        .unwrap_or_else(|| unreachable!("deadline fired without being armed"));
                    warn!(%subject, session = %self.session, "reconnect window expired");
                    self.registry.terminate(&subject, false);
                    return Some((TerminationReason::PartnerDisconnected, Some(subject)));
                }
                // Mailbox closed: the supervisor is shutting down.
                Some(None) => return None,
                Some(Some(command)) => command,
            };

            match command {
                SessionCommand::Disconnect { subject } => {
                    self.registry.record_disconnect(&subject);
                    // Surviving peers see an overlay and export everything
                    // before anything else happens; no redirect.
                    for (_, other) in self.humans.iter().filter(|(_, s)| s != &subject) {
                        if let Some(connection) = self.registry.connection_of(other) {
                            let _ = self.hub.send(connection, ServerMessage::TriggerDataExport);
                            let _ = self.hub.send(
                                connection,
                                ServerMessage::EndGame {
                                    message: Some(self.cfg.partner_disconnect_message.clone()),
                                },
                            );
                        }
                    }
                    reconnect_deadline = Some((
                        subject,
                        Box::pin(sleep(self.cfg.reconnection_timeout)),
                    ));
                }
                SessionCommand::Reconnect {
                    subject,
                    connection,
                } => {
                    if reconnect_deadline
                        .as_ref()
                        .is_some_and(|(pending, _)| pending == &subject)
                    {
                        reconnect_deadline = None;
                    }
                    if let Err(err) = self.registry.record_reconnect(&subject, connection) {
                        warn!(%err, "reconnect rejected");
                        continue;
                    }
                    self.hub.join_room(&room, connection);
                    debug!(%subject, "participant rejoined the session room");
                }
                SessionCommand::Exclude { subject, message } => {
                    if let Some(connection) = self.registry.connection_of(&subject) {
                        let _ = self.hub.send(
                            connection,
                            ServerMessage::EndGame {
                                message: Some(message.clone()),
                            },
                        );
                    }
                    for (_, other) in self.humans.iter().filter(|(_, s)| s != &subject) {
                        if let Some(connection) = self.registry.connection_of(other) {
                            let _ = self.hub.send(
                                connection,
                                ServerMessage::PartnerExcluded {
                                    message: message.clone(),
                                },
                            );
                        }
                    }
                    self.registry.log_activity(
                        ActivityKind::Exclude,
                        &subject,
                        serde_json::json!({ "message": message }),
                    );
                    return Some((TerminationReason::Excluded, Some(subject)));
                }
                SessionCommand::GameFinished { subject } => {
                    finished.insert(subject);
                    if finished.len() == self.humans.len() {
                        return None;
                    }
                }
                SessionCommand::Terminate { reason } => {
                    return reason.map(|r| (r, None));
                }
                SessionCommand::PlayerAction { .. } => {
                    // Inputs flow peer-to-peer; the supervisor never
                    // touches them.
                }
            }
        }
    }

    /// Server-authoritative mode: the task owns the environment and the
    /// tick loop.
    async fn run_server_auth(&mut self) -> Option<(TerminationReason, Option<SubjectId>)> {
        let Some(mut env) = self.env.take() else {
            warn!(session = %self.session, "server-authoritative session without an environment");
            return Some((TerminationReason::Excluded, None));
        };
        let room = session_room(self.session);
        let mut recorder = EpisodeRecorder::new();
        let mut latest: HashMap<PlayerId, i32> = HashMap::new();
        let mut absent: HashMap<SubjectId, Instant> = HashMap::new();
        let mut dropped: HashSet<SubjectId> = HashSet::new();
        let mut frame = Frame::new(0);
        let mut episode: u32 = 0;

        env.reset();
        let mut ticker = interval(self.cfg.tick_interval);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    None => return None,
                    Some(SessionCommand::PlayerAction { subject, action }) => {
                        if let Some(player) = self.player_of(&subject) {
                            latest.insert(player, action);
                        }
                    }
                    Some(SessionCommand::Disconnect { subject }) => {
                        self.registry.record_disconnect(&subject);
                        if let Some(player) = self.player_of(&subject) {
                            latest.remove(&player);
                        }
                        // The loop keeps stepping with the idle action for
                        // the missing player.
                        absent.insert(subject, Instant::now() + self.cfg.reconnection_timeout);
                    }
                    Some(SessionCommand::Reconnect { subject, connection }) => {
                        if dropped.contains(&subject) {
                            debug!(%subject, "slot already dropped; rejoin refused");
                            continue;
                        }
                        absent.remove(&subject);
                        if self.registry.record_reconnect(&subject, connection).is_ok() {
                            self.hub.join_room(&room, connection);
                        }
                    }
                    Some(SessionCommand::Exclude { subject, message }) => {
                        if let Some(connection) = self.registry.connection_of(&subject) {
                            let _ = self.hub.send(
                                connection,
                                ServerMessage::EndGame { message: Some(message) },
                            );
                        }
                        return Some((TerminationReason::Excluded, Some(subject)));
                    }
                    Some(SessionCommand::Terminate { reason }) => return reason.map(|r| (r, None)),
                    Some(SessionCommand::GameFinished { .. }) => {}
                },
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let expired: Vec<SubjectId> = absent
                        .iter()
                        .filter(|(_, deadline)| now >= **deadline)
                        .map(|(subject, _)| subject.clone())
                        .collect();
                    for subject in expired {
                        warn!(%subject, "reconnect window expired; slot dropped");
                        absent.remove(&subject);
                        dropped.insert(subject.clone());
                        self.registry.terminate(&subject, false);
                    }

                    let mut actions = ActionMap::new();
                    for slot in &self.players {
                        let action = latest
                            .get(&slot.player)
                            .copied()
                            .unwrap_or(self.cfg.idle_action);
                        actions.insert(slot.player, action);
                    }
                    let outcome = env.step(&actions);
                    let terminal = outcome.any_terminal();

                    let mut focused = std::collections::BTreeMap::new();
                    for (player, subject) in &self.humans {
                        focused.insert(*player, !absent.contains_key(subject) && !dropped.contains(subject));
                    }
                    recorder.record_speculative(FrameRecord {
                        frame,
                        actions,
                        rewards: outcome.rewards,
                        terminated: outcome.terminated,
                        truncated: outcome.truncated,
                        infos: outcome.infos,
                        focused,
                        was_speculative: true,
                    });
                    // The server is authoritative: every frame confirms
                    // immediately.
                    recorder.promote(frame);

                    if let Some(state) = env.render() {
                        self.hub.broadcast(
                            &room,
                            &ServerMessage::ServerRenderState { state },
                            None,
                        );
                    }

                    frame += 1;
                    let max_reached = self
                        .cfg
                        .max_steps
                        .is_some_and(|max| frame.as_i32() >= max as i32);
                    if terminal || max_reached {
                        let export = EpisodeExport {
                            episode,
                            rows: recorder.export_rows(frame),
                            status: SessionStatus::complete(episode + 1),
                        };
                        for (_, subject) in &self.humans {
                            if let Err(err) = self.export.write(subject, &export) {
                                warn!(%err, %subject, "server-side export failed");
                            }
                        }
                        episode += 1;
                        if episode >= self.cfg.num_episodes {
                            return None;
                        }
                        env.reset();
                        recorder.reset();
                        frame = Frame::new(0);
                    }
                }
            }
        }
    }

    /// The single teardown path.
    fn teardown(&self, termination: Option<(TerminationReason, Option<SubjectId>)>) {
        let room = session_room(self.session);
        self.sessions.lock().remove(&self.session);

        for (_, subject) in &self.humans {
            self.registry.leave_game(subject);
            self.registry.log_activity(
                ActivityKind::GameEnd,
                subject,
                serde_json::json!({
                    "session": self.session.to_string(),
                    "reason": termination.as_ref().map(|(r, _)| r),
                }),
            );
        }
        if termination.is_none() {
            self.hub
                .broadcast(&room, &ServerMessage::EndGame { message: None }, None);
        }
        self.hub.release_room(&room);
        info!(session = %self.session, ?termination, "session torn down");
    }
}

// #########
// # TESTS #
// #########
