//! End-to-end two-peer scenarios: both engines run over a simulated link
//! and must produce byte-identical, gap-free exports.
//!
//! The focus columns are excluded from parity comparison (notification
//! latency makes them diverge by design), as is the force-promotion tag;
//! every data column — actions, rewards, termination flags, infos — must
//! match byte for byte.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};
use web_time::{Duration, Instant};

use dyad::env::{ActionMap, Environment, StepOutcome};
use dyad::frame_info::{EpisodeExport, TerminationReason};
use dyad::network::chaos::{ChaosConfig, ChaosLink};
use dyad::rollback::{EngineConfig, EngineEvent, RollbackEngine};
use dyad::PlayerId;

/// Two players walking a line; rewards and infos carry floats so state
/// hashing and export parity exercise normalization.
#[derive(Debug)]
struct GridEnv {
    state: GridState,
}

#[derive(Debug, Clone, Serialize)]
struct GridState {
    positions: Vec<i64>,
    tick: u32,
    score: f64,
}

impl GridEnv {
    fn new() -> Self {
        Self {
            state: GridState {
                positions: vec![0, 10],
                tick: 0,
                score: 0.0,
            },
        }
    }
}

impl Environment for GridEnv {
    type State = GridState;

    fn reset(&mut self) -> BTreeMap<PlayerId, Value> {
        self.state = GridState {
            positions: vec![0, 10],
            tick: 0,
            score: 0.0,
        };
        BTreeMap::new()
    }

    fn step(&mut self, actions: &ActionMap) -> StepOutcome {
        for (player, action) in actions {
            let idx = player.as_usize();
            self.state.positions[idx] += i64::from(action.signum());
        }
        self.state.tick += 1;
        let distance = (self.state.positions[0] - self.state.positions[1]).abs();
        self.state.score += 1.0 / (1.0 + distance as f64);

        let mut outcome = StepOutcome::default();
        for player in actions.keys() {
            let idx = player.as_usize();
            outcome.rewards.insert(*player, -(distance as f64) / 10.0);
            outcome.terminated.insert(*player, false);
            outcome.truncated.insert(*player, false);
            outcome.infos.insert(
                *player,
                json!({ "pos": self.state.positions[idx], "score": self.state.score }),
            );
        }
        outcome
    }

    fn get_state(&self) -> Option<Self::State> {
        Some(self.state.clone())
    }

    fn set_state(&mut self, state: &Self::State) {
        self.state = state.clone();
    }
}

/// Per-tick action scripts for the two sides.
type Script = fn(usize, u32) -> i32;

fn active_script(player: usize, tick: u32) -> i32 {
    // Deterministic but non-constant, different per player.
    match (tick / 7 + player as u32) % 3 {
        0 => -1,
        1 => 0,
        _ => 1,
    }
}

fn idle_script(_player: usize, _tick: u32) -> i32 {
    0
}

struct Peer {
    engine: RollbackEngine<GridEnv>,
    exports: Vec<EpisodeExport>,
    mismatches: u32,
    done: bool,
}

impl Peer {
    fn handle(&mut self, events: Vec<EngineEvent>) {
        for event in events {
            match event {
                EngineEvent::EpisodeComplete { export, .. } => {
                    self.exports.push(export);
                    self.engine.export_delivered();
                }
                EngineEvent::SessionComplete { .. } => self.done = true,
                EngineEvent::HashMismatch { .. } => self.mismatches += 1,
                _ => {}
            }
        }
    }
}

struct Harness {
    link: ChaosLink,
    peers: [Peer; 2],
    now: Instant,
    tick: u32,
}

impl Harness {
    fn new(chaos: ChaosConfig, max_steps: u32, episodes: u32) -> Self {
        let link = ChaosLink::new(chaos);
        let (end_a, end_b) = link.endpoints();

        let mut cfg_a = EngineConfig::two_player(PlayerId::new(0), PlayerId::new(1));
        cfg_a.max_steps = Some(max_steps);
        cfg_a.num_episodes = episodes;
        let mut cfg_b = EngineConfig::two_player(PlayerId::new(1), PlayerId::new(0));
        cfg_b.max_steps = Some(max_steps);
        cfg_b.num_episodes = episodes;

        let mut engine_a =
            RollbackEngine::new(GridEnv::new(), cfg_a, Vec::new(), Box::new(end_a)).unwrap();
        let mut engine_b =
            RollbackEngine::new(GridEnv::new(), cfg_b, Vec::new(), Box::new(end_b)).unwrap();
        engine_a.start();
        engine_b.start();

        Self {
            link,
            peers: [
                Peer {
                    engine: engine_a,
                    exports: Vec::new(),
                    mismatches: 0,
                    done: false,
                },
                Peer {
                    engine: engine_b,
                    exports: Vec::new(),
                    mismatches: 0,
                    done: false,
                },
            ],
            now: Instant::now(),
            tick: 0,
        }
    }

    fn step_once(&mut self, script: Script) {
        for (index, peer) in self.peers.iter_mut().enumerate() {
            if !peer.engine.is_running() {
                continue;
            }
            peer.engine.set_local_action(script(index, self.tick));
            let report = peer.engine.tick(self.now).unwrap();
            peer.handle(report.events);
        }
        self.link.advance(1);
        self.now += Duration::from_millis(50);
        self.tick += 1;
    }

    fn run(&mut self, script: Script, limit: u32) {
        while self.tick < limit && self.peers.iter().any(|p| !p.done) {
            self.step_once(script);
        }
        assert!(
            self.peers.iter().all(|p| p.done),
            "session did not complete within {limit} ticks (a: frame {}, b: frame {})",
            self.peers[0].engine.current_frame(),
            self.peers[1].engine.current_frame(),
        );
    }
}

/// The data columns subject to byte parity: everything except the focus
/// flags and the force-promotion tag.
fn parity_view(export: &EpisodeExport) -> Vec<String> {
    export
        .rows
        .iter()
        .map(|row| {
            let filtered: serde_json::Map<String, Value> = row
                .iter()
                .filter(|(key, _)| !key.starts_with("isFocused.") && *key != "wasSpeculative")
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            serde_json::to_string(&filtered).unwrap()
        })
        .collect()
}

fn assert_parity(a: &EpisodeExport, b: &EpisodeExport, rows: usize) {
    assert_eq!(a.rows.len(), rows, "peer A row count");
    assert_eq!(b.rows.len(), rows, "peer B row count");
    let view_a = parity_view(a);
    let view_b = parity_view(b);
    for (frame, (row_a, row_b)) in view_a.iter().zip(view_b.iter()).enumerate() {
        assert_eq!(row_a, row_b, "data columns diverge at frame {frame}");
    }
}

fn assert_focus_columns(export: &EpisodeExport) {
    for row in &export.rows {
        assert!(row.contains_key("isFocused.0"));
        assert!(row.contains_key("isFocused.1"));
    }
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

#[test]
fn happy_path_p2p_450_frames() {
    let mut harness = Harness::new(ChaosConfig::lossless(), 450, 1);
    harness.run(active_script, 1200);

    let [a, b] = &harness.peers;
    assert_eq!(a.exports.len(), 1);
    assert_eq!(b.exports.len(), 1);
    assert_parity(&a.exports[0], &b.exports[0], 450);
    assert_focus_columns(&a.exports[0]);
    assert_focus_columns(&b.exports[0]);
    assert!(!a.exports[0].status.is_partial);
    assert_eq!(a.mismatches + b.mismatches, 0, "state hashes diverged");
}

#[test]
fn symmetric_latency_with_active_inputs() {
    // 200 ms each way at a 50 ms tick = 4 link ticks of delay.
    let chaos = ChaosConfig::lossless().with_delay(4..5).with_seed(11);
    let mut harness = Harness::new(chaos, 300, 1);
    harness.run(active_script, 1500);

    let [a, b] = &harness.peers;
    assert_parity(&a.exports[0], &b.exports[0], 300);
    assert_eq!(a.mismatches + b.mismatches, 0);
    // With divergent scripts under latency, speculation must have missed
    // at least once somewhere.
    let rollbacks =
        a.engine.stats().rollback_count + b.engine.stats().rollback_count;
    assert!(rollbacks > 0, "expected rollbacks under 200 ms latency");
}

#[test]
fn fifteen_percent_packet_loss_keeps_parity() {
    let chaos = ChaosConfig::lossless()
        .with_drop_rate(0.15)
        .with_delay(1..3)
        .with_seed(42);
    let mut harness = Harness::new(chaos, 300, 1);
    harness.run(active_script, 3000);

    let [a, b] = &harness.peers;
    assert_parity(&a.exports[0], &b.exports[0], 300);
    assert_eq!(a.mismatches + b.mismatches, 0);
    assert!(harness.link.stats().dropped > 0, "loss model was inert");
}

#[test]
fn multi_episode_session_stays_in_sync() {
    let chaos = ChaosConfig::lossless().with_delay(1..3).with_seed(3);
    let mut harness = Harness::new(chaos, 120, 3);
    harness.run(active_script, 4000);

    let [a, b] = &harness.peers;
    assert_eq!(a.exports.len(), 3);
    assert_eq!(b.exports.len(), 3);
    for episode in 0..3 {
        assert_eq!(a.exports[episode].episode, episode as u32);
        assert_parity(&a.exports[episode], &b.exports[episode], 120);
    }
    assert_eq!(a.exports[2].status.completed_episodes, 3);
}

#[test]
fn mid_episode_backgrounding_fast_forwards_and_completes() {
    let mut harness = Harness::new(ChaosConfig::lossless(), 450, 1);

    // Play normally to frame 180.
    while harness.tick < 180 {
        harness.step_once(idle_script);
    }
    let hide_at = harness.now;
    harness.peers[0].engine.set_focused(false, hide_at).unwrap();

    // Five seconds hidden (100 ticks at 50 ms).
    while harness.tick < 280 {
        harness.step_once(idle_script);
    }
    assert!(
        harness.peers[0].engine.current_frame().as_i32() <= 181,
        "hidden tab advanced"
    );

    let report = harness.peers[0]
        .engine
        .set_focused(true, harness.now)
        .unwrap();
    assert!(report.advanced > 50, "fast-forward recovered the gap");

    harness.run(idle_script, 2000);
    let [a, b] = &harness.peers;
    assert_parity(&a.exports[0], &b.exports[0], 450);

    // The hidden window shows as unfocused in the hidden peer's export.
    let hidden_row = &a.exports[0].rows[200];
    assert_eq!(hidden_row["isFocused.0"], json!(false));
    let visible_row = &a.exports[0].rows[100];
    assert_eq!(visible_row["isFocused.0"], json!(true));
}

#[test]
fn focus_loss_beyond_timeout_ends_partial() {
    let link = ChaosLink::new(ChaosConfig::lossless());
    let (end_a, end_b) = link.endpoints();

    let mut cfg_a = EngineConfig::two_player(PlayerId::new(0), PlayerId::new(1));
    cfg_a.max_steps = Some(450);
    cfg_a.focus_loss_timeout_ms = 10_000;
    let mut cfg_b = EngineConfig::two_player(PlayerId::new(1), PlayerId::new(0));
    cfg_b.max_steps = Some(450);

    let mut engine_a =
        RollbackEngine::new(GridEnv::new(), cfg_a, Vec::new(), Box::new(end_a)).unwrap();
    let mut engine_b =
        RollbackEngine::new(GridEnv::new(), cfg_b, Vec::new(), Box::new(end_b)).unwrap();
    engine_a.start();
    engine_b.start();

    let mut now = Instant::now();
    for _ in 0..100 {
        engine_a.tick(now).unwrap();
        engine_b.tick(now).unwrap();
        link.advance(1);
        now += Duration::from_millis(50);
    }
    engine_a.set_focused(false, now).unwrap();

    // Tick until the 10-second timeout fires on the hidden side.
    let mut timed_out_player = None;
    for _ in 0..400 {
        let report = engine_a.tick(now).unwrap();
        for event in report.events {
            if let EngineEvent::FocusTimeout { player } = event {
                timed_out_player = Some(player);
            }
        }
        engine_b.tick(now).unwrap();
        link.advance(1);
        now += Duration::from_millis(50);
        if timed_out_player.is_some() {
            break;
        }
    }
    let offender = timed_out_player.expect("focus timeout never fired");
    assert_eq!(offender, PlayerId::new(0));

    // The session driver ends both sides with the structured reason.
    let export_a = engine_a.end_partial(TerminationReason::FocusLossTimeout, Some(offender));
    let export_b = engine_b.end_partial(TerminationReason::FocusLossTimeout, Some(offender));
    for export in [&export_a, &export_b] {
        assert!(export.status.is_partial);
        assert_eq!(
            export.status.termination_reason,
            Some(TerminationReason::FocusLossTimeout)
        );
        assert_eq!(export.status.disconnected_player_id, Some(PlayerId::new(0)));
        assert!(!export.rows.is_empty(), "data up to termination is present");
    }
}

#[test]
fn mid_game_disconnect_exports_partial_for_survivor() {
    let mut harness = Harness::new(ChaosConfig::lossless(), 450, 1);
    while harness.tick < 300 {
        harness.step_once(active_script);
    }
    // The partner's transport drops and never comes back.
    harness.link.sever();
    for _ in 0..100 {
        harness.step_once(active_script);
    }

    // The reconnect window expired; the server ends the surviving side.
    let export = harness.peers[0]
        .engine
        .end_partial(TerminationReason::PartnerDisconnected, Some(PlayerId::new(1)));
    assert!(export.status.is_partial);
    assert_eq!(
        export.status.termination_reason,
        Some(TerminationReason::PartnerDisconnected)
    );
    assert_eq!(export.status.disconnected_player_id, Some(PlayerId::new(1)));
    // Everything confirmed before the drop is in the export.
    assert!(export.rows.len() >= 290, "rows: {}", export.rows.len());
}
