//! The authoritative quiz state machine.
//!
//! [`Engine`] owns the round phase, the active question and the team and
//! device rosters behind a single `RwLock`. Every mutation takes the write
//! lock, finishes its work, releases the lock and only then notifies the
//! observers, so an observer may call straight back into the engine.
//!
//! Operations never fail loudly. A rejected transition or an unknown device
//! is logged and reported through a `false`/`None` result. Score arithmetic
//! saturates at the `i64` bounds.

use crate::config::GameConfig;
use crate::model::{
    Device, DeviceInfo, GameEvent, GameSnapshot, Phase, Question, RosterSnapshot, RosterUpdate,
    RoundSnapshot, Team, Winner, BUZZED_STATUS, POINTS_AWARDED,
};
use log::{debug, info, warn};
use shared::now_micros;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Notified after every transition that changes the phase.
pub trait PhaseObserver: Send + Sync {
    fn phase_changed(&self, phase: Phase);
}

/// Notified after every countdown step with the seconds left.
pub trait TickObserver: Send + Sync {
    fn tick(&self, remaining: i64);
}

/// Notified when a buzz is accepted.
pub trait BuzzObserver: Send + Sync {
    fn buzz_accepted(&self, buzz: &Buzz);
}

/// An accepted buzz as reported to [`BuzzObserver`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buzz {
    pub device_id: String,
    pub team_id: Option<String>,
    pub timestamp: i64,
    pub button: String,
    /// Whether this buzz became its team's fastest.
    pub fastest_in_team: bool,
}

#[derive(Clone, Default)]
pub struct Observers {
    pub phase: Option<Arc<dyn PhaseObserver>>,
    pub tick: Option<Arc<dyn TickObserver>>,
    pub buzz: Option<Arc<dyn BuzzObserver>>,
}

impl Observers {
    /// Registers one value for all three notifications.
    pub fn all<O>(observer: Arc<O>) -> Self
    where
        O: PhaseObserver + TickObserver + BuzzObserver + 'static,
    {
        Self {
            phase: Some(observer.clone()),
            tick: Some(observer.clone()),
            buzz: Some(observer),
        }
    }
}

#[derive(Default)]
struct EngineState {
    phase: Phase,
    question: Option<Question>,
    delay: i64,
    remaining: i64,
    started_at: Option<i64>,
    remote: String,
    teams: BTreeMap<String, Team>,
    devices: BTreeMap<String, Device>,
    countdown: Option<AbortHandle>,
    // Bumped on every start so a countdown outliving its round stays inert.
    round: u64,
    history: VecDeque<GameEvent>,
}

impl EngineState {
    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        if let Some(question) = self.question.as_mut() {
            question.status = Some(phase);
        }
    }

    fn clear_round_fields(&mut self) {
        for device in self.devices.values_mut() {
            device.clear_round();
        }
        for team in self.teams.values_mut() {
            team.clear_round();
        }
    }

    fn cancel_countdown(&mut self) {
        if let Some(countdown) = self.countdown.take() {
            countdown.abort();
        }
    }

    fn countdown_alive(&self) -> bool {
        self.countdown
            .as_ref()
            .is_some_and(|countdown| !countdown.is_finished())
    }

    fn stop(&mut self) {
        self.cancel_countdown();
        self.set_phase(Phase::Stopped);
        self.remaining = 0;
    }

    /// Device ids on a team, ascending.
    fn members(&self, team_id: &str) -> Vec<String> {
        self.devices
            .iter()
            .filter(|(_, device)| device.belongs_to(team_id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn recompute_team_score(&mut self, team_id: &str) {
        let total = self
            .devices
            .values()
            .filter(|device| device.belongs_to(team_id))
            .fold(0i64, |total, device| total.saturating_add(device.score));

        if let Some(team) = self.teams.get_mut(team_id) {
            team.score = total;
        }
    }

    fn recompute_all_scores(&mut self) {
        let mut totals: HashMap<&str, i64> = HashMap::new();
        for device in self.devices.values() {
            if let Some(team) = device.team.as_deref() {
                let total = totals.entry(team).or_default();
                *total = total.saturating_add(device.score);
            }
        }

        for (id, team) in self.teams.iter_mut() {
            team.score = totals.get(id.as_str()).copied().unwrap_or(0);
        }
    }

    fn refresh_team_ready(&mut self) {
        // (members, ready members) per team
        let mut tally: HashMap<&str, (usize, usize)> = HashMap::new();
        for device in self.devices.values() {
            if let Some(team) = device.team.as_deref() {
                let entry = tally.entry(team).or_default();
                entry.0 += 1;
                if device.ready {
                    entry.1 += 1;
                }
            }
        }

        for (id, team) in self.teams.iter_mut() {
            team.ready = match tally.get(id.as_str()) {
                Some(&(members, ready)) => members > 0 && members == ready,
                None => false,
            };
        }
    }

    fn record_points(
        &mut self,
        limit: usize,
        winner: Winner,
        winner_id: &str,
        team: Option<String>,
        points: i64,
    ) {
        if limit == 0 {
            return;
        }
        while self.history.len() >= limit {
            self.history.pop_front();
        }
        self.history.push_back(GameEvent {
            timestamp: now_micros(),
            question_id: self.question.as_ref().map(|question| question.id.clone()),
            event_type: POINTS_AWARDED.to_string(),
            winner_id: winner_id.to_string(),
            winner,
            team,
            points,
        });
    }

    fn roster(&self) -> RosterSnapshot {
        RosterSnapshot {
            teams: self.teams.clone(),
            bumpers: self.devices.clone(),
        }
    }
}

struct Shared {
    state: RwLock<EngineState>,
    observers: Observers,
    tick_interval: Duration,
    history_limit: usize,
}

/// Cheap to clone; every clone drives the same game.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Shared>,
}

impl Engine {
    pub fn new(config: &GameConfig) -> Self {
        Self::with_observers(config, Observers::default())
    }

    pub fn with_observers(config: &GameConfig, observers: Observers) -> Self {
        Self {
            inner: Arc::new(Shared {
                state: RwLock::new(EngineState::default()),
                observers,
                tick_interval: config.tick_interval,
                history_limit: config.history_limit,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, EngineState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, EngineState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_phase(&self, phase: Phase) {
        if let Some(observer) = &self.inner.observers.phase {
            observer.phase_changed(phase);
        }
    }

    pub fn phase(&self) -> Phase {
        self.read().phase
    }

    /// Seconds left on the countdown.
    pub fn remaining_time(&self) -> i64 {
        self.read().remaining
    }

    pub fn active_question(&self) -> Option<Question> {
        self.read().question.clone()
    }

    pub fn team(&self, team_id: &str) -> Option<Team> {
        self.read().teams.get(team_id).cloned()
    }

    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.read().devices.get(device_id).cloned()
    }

    // Round transitions

    /// Loads the next question and clears last round's buzzes and ready flags.
    ///
    /// Only allowed while no round is running. Returns `false` when rejected.
    pub fn prepare(&self, question_id: &str, question: Option<Question>) -> bool {
        let mut state = self.write();
        if !matches!(
            state.phase,
            Phase::Stopped | Phase::Revealed | Phase::Prepare | Phase::Ready
        ) {
            warn!(
                "Cannot prepare question {} while {}",
                question_id, state.phase
            );
            return false;
        }

        state.question = question.map(|mut question| {
            question.id = question_id.to_string();
            question
        });
        state.clear_round_fields();
        state.set_phase(Phase::Prepare);
        drop(state);

        info!("Prepared question {}", question_id);
        self.notify_phase(Phase::Prepare);
        true
    }

    /// Records a device's PONG. Returns `false` for an unknown device.
    pub fn mark_device_ready(&self, device_id: &str) -> bool {
        let mut state = self.write();
        let Some(device) = state.devices.get_mut(device_id) else {
            warn!("Ready from unknown device {}", device_id);
            return false;
        };

        device.ready = true;
        state.refresh_team_ready();
        debug!("Device {} ready", device_id);
        true
    }

    /// `false` when there are no teams at all.
    pub fn all_teams_ready(&self) -> bool {
        let state = self.read();
        !state.teams.is_empty() && state.teams.values().all(|team| team.ready)
    }

    /// Moves `Prepare` to `Ready`. Returns `false` from any other phase.
    pub fn confirm_ready(&self) -> bool {
        let mut state = self.write();
        if state.phase != Phase::Prepare {
            warn!("Cannot confirm ready while {}", state.phase);
            return false;
        }

        state.set_phase(Phase::Ready);
        drop(state);

        info!("All teams ready");
        self.notify_phase(Phase::Ready);
        true
    }

    /// Marks every device and team ready and moves `Prepare` to `Ready`, for
    /// when a buzzer never answers the readiness check.
    pub fn force_ready(&self) -> bool {
        let mut state = self.write();
        if state.phase != Phase::Prepare {
            warn!("Cannot force ready while {}", state.phase);
            return false;
        }

        for device in state.devices.values_mut() {
            device.ready = true;
        }
        for team in state.teams.values_mut() {
            team.ready = true;
        }
        state.set_phase(Phase::Ready);
        drop(state);

        info!("Forced ready");
        self.notify_phase(Phase::Ready);
        true
    }

    /// Starts the countdown from any phase.
    ///
    /// The countdown runs on the ambient tokio runtime. Without one the round
    /// still starts and [`Engine::tick`] must be called by hand.
    pub fn start_round(&self, delay_seconds: i64) {
        let mut state = self.write();
        state.cancel_countdown();
        state.clear_round_fields();
        state.delay = delay_seconds;
        state.remaining = delay_seconds;
        state.started_at = Some(now_micros());
        state.round += 1;
        state.set_phase(Phase::Started);
        state.countdown = self.arm_countdown(state.round);
        drop(state);

        info!("Round started with {}s", delay_seconds);
        self.notify_phase(Phase::Started);
    }

    fn arm_countdown(&self, round: u64) -> Option<AbortHandle> {
        let Ok(runtime) = Handle::try_current() else {
            warn!("No async runtime, countdown will not run on its own");
            return None;
        };

        let shared: Weak<Shared> = Arc::downgrade(&self.inner);
        let period = self.inner.tick_interval;

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(inner) = shared.upgrade() else {
                    break;
                };
                if !(Engine { inner }).step(Some(round)) {
                    break;
                }
            }
        });

        Some(task.abort_handle())
    }

    /// Advances the countdown by one step. Time only runs while `Started`;
    /// `Paused` freezes it. Returns whether the countdown should keep going.
    pub fn tick(&self) -> bool {
        self.step(None)
    }

    fn step(&self, round: Option<u64>) -> bool {
        let mut state = self.write();
        if round.is_some_and(|round| round != state.round) {
            return false;
        }

        match state.phase {
            Phase::Started => {}
            Phase::Paused => return true,
            _ => return false,
        }

        state.remaining = state.remaining.saturating_sub(1);
        let remaining = state.remaining.max(0);
        let expired = state.remaining <= 0;
        if expired {
            state.stop();
        }
        drop(state);

        if let Some(observer) = &self.inner.observers.tick {
            observer.tick(remaining);
        }
        if expired {
            info!("Time is up");
            self.notify_phase(Phase::Stopped);
        }

        !expired
    }

    /// Ends the round from any phase. Stopping a stopped round does nothing.
    pub fn stop_round(&self) {
        let mut state = self.write();
        if state.phase == Phase::Stopped && state.countdown.is_none() {
            debug!("Round already stopped");
            return;
        }

        state.stop();
        drop(state);

        info!("Round stopped");
        self.notify_phase(Phase::Stopped);
    }

    /// Freezes the countdown without touching buzz data.
    pub fn pause(&self) {
        let mut state = self.write();
        if state.phase == Phase::Paused {
            return;
        }

        state.set_phase(Phase::Paused);
        drop(state);

        info!("Round paused");
        self.notify_phase(Phase::Paused);
    }

    /// Returns to `Started`, re-arming the countdown if none is running.
    pub fn resume(&self) {
        let mut state = self.write();
        if state.phase == Phase::Started {
            return;
        }

        state.set_phase(Phase::Started);
        if !state.countdown_alive() && state.remaining > 0 {
            state.round += 1;
            state.countdown = self.arm_countdown(state.round);
        }
        drop(state);

        info!("Round resumed");
        self.notify_phase(Phase::Started);
    }

    /// Moves `Stopped` to `Revealed` and returns the answer (empty when no
    /// question is loaded). Returns `None` from any other phase.
    pub fn reveal(&self) -> Option<String> {
        let mut state = self.write();
        if state.phase != Phase::Stopped {
            warn!("Cannot reveal while {}", state.phase);
            return None;
        }

        state.set_phase(Phase::Revealed);
        let answer = state
            .question
            .as_ref()
            .map(|question| question.answer.clone())
            .unwrap_or_default();
        drop(state);

        info!("Answer revealed");
        self.notify_phase(Phase::Revealed);
        Some(answer)
    }

    /// Accepts a buzz while `Started`, once per device per round.
    ///
    /// The owning team keeps whichever member buzzed earliest by timestamp;
    /// an equal timestamp does not displace the first one recorded.
    pub fn record_buzz(&self, device_id: &str, timestamp_micros: i64, button: &str) -> bool {
        let mut state = self.write();
        if state.phase != Phase::Started {
            debug!("Ignoring buzz from {} while {}", device_id, state.phase);
            return false;
        }

        let Some(device) = state.devices.get_mut(device_id) else {
            warn!("Buzz from unknown device {}", device_id);
            return false;
        };
        if device.buzz_time.is_some() {
            debug!("Device {} already buzzed", device_id);
            return false;
        }

        device.buzz_time = Some(timestamp_micros);
        device.button = Some(button.to_string());
        device.status = Some(BUZZED_STATUS.to_string());
        let team_id = device.team.clone();

        let mut fastest_in_team = false;
        if let Some(team) = team_id.as_deref().and_then(|id| state.teams.get_mut(id)) {
            if team.buzz_time.map_or(true, |fastest| timestamp_micros < fastest) {
                team.buzz_time = Some(timestamp_micros);
                team.buzzer = Some(device_id.to_string());
                team.status = Some(BUZZED_STATUS.to_string());
                fastest_in_team = true;
            }
        }
        drop(state);

        info!(
            "Buzz: device={} team={:?} button={} time={}",
            device_id, team_id, button, timestamp_micros
        );

        let buzz = Buzz {
            device_id: device_id.to_string(),
            team_id,
            timestamp: timestamp_micros,
            button: button.to_string(),
            fastest_in_team,
        };
        if let Some(observer) = &self.inner.observers.buzz {
            observer.buzz_accepted(&buzz);
        }
        true
    }

    // Scores

    /// Adds `delta` to a device and recomputes its team. Returns the device's
    /// new score, `None` for an unknown device.
    pub fn adjust_player_score(&self, device_id: &str, delta: i64) -> Option<i64> {
        let mut state = self.write();
        let Some(device) = state.devices.get_mut(device_id) else {
            warn!("Score change for unknown device {}", device_id);
            return None;
        };

        device.score = device.score.saturating_add(delta);
        let score = device.score;
        let team = device.team.clone();
        if let Some(team) = team.as_deref() {
            state.recompute_team_score(team);
        }
        state.record_points(self.inner.history_limit, Winner::Player, device_id, team, delta);

        info!("Device {} {:+} -> {}", device_id, delta, score);
        Some(score)
    }

    /// Splits `delta` over a team's members in ascending device-id order. The
    /// first `|delta % members|` members get one extra unit (of the sign of
    /// `delta`). Returns the team's new score, `None` for an unknown team.
    pub fn distribute_team_score(&self, team_id: &str, delta: i64) -> Option<i64> {
        let mut state = self.write();
        let Some(current) = state.teams.get(team_id).map(|team| team.score) else {
            warn!("Score change for unknown team {}", team_id);
            return None;
        };

        let members = state.members(team_id);
        if members.is_empty() {
            warn!("Team {} has no members, dropping {:+}", team_id, delta);
            return Some(current);
        }

        let count = members.len() as i64;
        let share = delta / count;
        let remainder = delta % count;
        for (index, id) in members.iter().enumerate() {
            let extra = if (index as i64) < remainder.abs() {
                remainder.signum()
            } else {
                0
            };
            if let Some(device) = state.devices.get_mut(id) {
                device.score = device.score.saturating_add(share.saturating_add(extra));
            }
        }

        state.recompute_team_score(team_id);
        let score = state.teams.get(team_id).map_or(current, |team| team.score);
        state.record_points(
            self.inner.history_limit,
            Winner::Team,
            team_id,
            Some(team_id.to_string()),
            delta,
        );

        info!("Team {} {:+} -> {}", team_id, delta, score);
        Some(score)
    }

    /// Zeroes every score and buzz time and clears the score history, in any
    /// phase.
    pub fn reset_all_scores(&self) {
        let mut state = self.write();
        state.history.clear();
        for device in state.devices.values_mut() {
            device.score = 0;
            device.buzz_time = None;
        }
        for team in state.teams.values_mut() {
            team.score = 0;
            team.buzz_time = None;
        }
        drop(state);

        info!("All scores reset");
    }

    // Roster

    /// Creates or updates a device from its HELLO.
    pub fn upsert_device(&self, device_id: &str, info: DeviceInfo) {
        let mut state = self.write();
        let created = !state.devices.contains_key(device_id);
        let device = state.devices.entry(device_id.to_string()).or_default();

        let old_team = device.team.clone();
        if let Some(name) = info.name {
            device.name = name;
        }
        if let Some(team) = info.team {
            device.team = (!team.is_empty()).then_some(team);
        }
        if let Some(version) = info.version {
            device.version = version;
        }
        if let Some(ip) = info.ip {
            device.ip = ip;
        }
        if device.name.is_empty() {
            device.name = device_id.to_string();
        }

        let new_team = device.team.clone();
        if old_team != new_team {
            for team in old_team.iter().chain(new_team.iter()) {
                state.recompute_team_score(team);
            }
            state.refresh_team_ready();
        }

        if created {
            info!("Device {} registered", device_id);
        } else {
            debug!("Device {} updated", device_id);
        }
    }

    pub fn remove_device(&self, device_id: &str) -> bool {
        let mut state = self.write();
        let Some(device) = state.devices.remove(device_id) else {
            return false;
        };

        if let Some(team) = device.team {
            state.recompute_team_score(&team);
        }
        state.refresh_team_ready();
        info!("Device {} removed", device_id);
        true
    }

    /// Replaces the collections present in `update` and recomputes every team
    /// score from its members.
    pub fn replace_roster(&self, update: RosterUpdate) {
        let mut state = self.write();
        if let Some(mut teams) = update.teams {
            for (id, team) in teams.iter_mut() {
                if team.name.is_empty() {
                    team.name = id.clone();
                }
            }
            state.teams = teams;
        }
        if let Some(devices) = update.bumpers {
            state.devices = devices;
        }
        state.recompute_all_scores();

        info!(
            "Roster replaced: {} teams, {} devices",
            state.teams.len(),
            state.devices.len()
        );
    }

    /// Sets the page the display screens should show.
    pub fn set_remote_page(&self, page: &str) {
        self.write().remote = page.to_string();
        debug!("Remote page set to {}", page);
    }

    // Snapshots

    pub fn current_state_snapshot(&self) -> GameSnapshot {
        let state = self.read();
        let roster = state.roster();

        GameSnapshot {
            game: RoundSnapshot {
                phase: state.phase,
                delay: state.delay,
                remaining: state.remaining,
                question: state.question.clone(),
                remote: state.remote.clone(),
                started_at: state.started_at,
            },
            teams: roster.teams,
            bumpers: roster.bumpers,
        }
    }

    pub fn current_roster_snapshot(&self) -> RosterSnapshot {
        self.read().roster()
    }

    /// Score events, oldest first.
    pub fn history(&self) -> Vec<GameEvent> {
        self.read().history.iter().cloned().collect()
    }
}
