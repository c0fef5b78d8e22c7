//! Turns inbound messages and engine events into engine calls and broadcasts.
//!
//! The [`Dispatcher`] is the only component that knows both the engine and
//! the transports. It runs as a single task: inbound messages, engine events
//! and client-count changes are handled one at a time in arrival order.

use crate::broadcast::DeviceBroadcaster;
use crate::client_manager::{ClientCounts, ClientKind};
use crate::config::GameConfig;
use crate::game::{Buzz, BuzzObserver, Engine, PhaseObserver, TickObserver};
use crate::hub::HubHandle;
use crate::model::{DeviceInfo, Phase, Question, RosterUpdate};
use crate::network::{Inbound, Transport};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shared::payload::{
    BumperPointsPayload, ButtonPayload, ClientsPayload, DeleteQuestionPayload, DevicePayload,
    HelloPayload, PointsPayload, ReadyPayload, RemotePayload, SetClientTypePayload,
    StartPayload, TeamPointsPayload,
};
use shared::{Action, Message};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Engine notifications, queued for the dispatcher task.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    PhaseChanged(Phase),
    Tick(i64),
    Buzz(Buzz),
}

/// Observer that forwards every engine notification into a channel.
///
/// Sending on an unbounded channel never blocks, so the engine can notify
/// from inside any operation.
#[derive(Debug, Clone)]
pub struct EventForwarder {
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl EventForwarder {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }

    fn send(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            debug!("Engine event dropped, dispatcher gone");
        }
    }
}

impl PhaseObserver for EventForwarder {
    fn phase_changed(&self, phase: Phase) {
        self.send(EngineEvent::PhaseChanged(phase));
    }
}

impl TickObserver for EventForwarder {
    fn tick(&self, remaining: i64) {
        self.send(EngineEvent::Tick(remaining));
    }
}

impl BuzzObserver for EventForwarder {
    fn buzz_accepted(&self, buzz: &Buzz) {
        self.send(EngineEvent::Buzz(buzz.clone()));
    }
}

/// Questions the admin can prepare, keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct QuestionBank {
    questions: BTreeMap<String, Question>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QuestionFile {
    Map(BTreeMap<String, Question>),
    List(Vec<Question>),
}

impl QuestionBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts either `{"id": {...}}` or `[{"ID": "id", ...}]`.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let questions = match serde_json::from_str(json)? {
            QuestionFile::Map(map) => map
                .into_iter()
                .map(|(id, mut question)| {
                    if question.id.is_empty() {
                        question.id = id.clone();
                    }
                    (id, question)
                })
                .collect(),
            QuestionFile::List(list) => list
                .into_iter()
                .map(|question| (question.id.clone(), question))
                .collect(),
        };
        Ok(Self { questions })
    }

    pub fn get(&self, id: &str) -> Option<&Question> {
        self.questions.get(id)
    }

    pub fn insert(&mut self, question: Question) {
        self.questions.insert(question.id.clone(), question);
    }

    pub fn remove(&mut self, id: &str) -> Option<Question> {
        self.questions.remove(id)
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}

/// Who a broadcast goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Audience {
    Web,
    Devices,
    Everyone,
}

pub struct Dispatcher {
    engine: Engine,
    web: HubHandle,
    devices: HubHandle,
    udp: Option<DeviceBroadcaster>,
    questions: QuestionBank,
    default_delay: i64,
    version: String,
}

impl Dispatcher {
    pub fn new(
        engine: Engine,
        web: HubHandle,
        devices: HubHandle,
        questions: QuestionBank,
        config: &GameConfig,
    ) -> Self {
        Self {
            engine,
            web,
            devices,
            udp: None,
            questions,
            default_delay: config.default_delay,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Sends device-bound messages over UDP instead of the device hub.
    pub fn with_udp(mut self, udp: DeviceBroadcaster) -> Self {
        self.udp = Some(udp);
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn questions(&self) -> &QuestionBank {
        &self.questions
    }

    /// Serves until the inbound queue closes.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Inbound>,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        let mut web_counts = self.web.subscribe_counts();
        let mut events_open = true;
        let mut counts_open = true;
        info!("Dispatcher started");

        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => self.dispatch(message).await,
                    None => break,
                },
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => events_open = false,
                },
                changed = web_counts.changed(), if counts_open => {
                    if changed.is_err() {
                        counts_open = false;
                        continue;
                    }
                    let counts = *web_counts.borrow_and_update();
                    self.announce_clients(counts);
                }
            }
        }

        info!("Dispatcher stopped");
    }

    pub async fn dispatch(&mut self, inbound: Inbound) {
        debug!(
            "{} from {} ({:?})",
            inbound.message.action, inbound.sender, inbound.transport
        );
        match inbound.transport {
            Transport::Device => self.from_device(inbound).await,
            Transport::Web => self.from_web(inbound).await,
        }
    }

    pub async fn handle_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::PhaseChanged(phase) => {
                debug!("Phase changed to {}", phase);
                if let Some(message) = self.snapshot(Action::Update) {
                    self.publish(&message.with_version(self.version.clone()), Audience::Web)
                        .await;
                }
            }
            EngineEvent::Tick(_) => {
                self.publish_snapshot(Action::UpdateTimer, Audience::Everyone)
                    .await;
            }
            EngineEvent::Buzz(buzz) => {
                info!(
                    "Buzz from {} (team {:?}, button {})",
                    buzz.device_id, buzz.team_id, buzz.button
                );
                self.publish_snapshot(Action::Pause, Audience::Everyone).await;
                self.publish_snapshot(Action::Update, Audience::Web).await;
            }
        }
    }

    async fn from_device(&mut self, inbound: Inbound) {
        match inbound.message.action {
            Action::Hello => {
                let Some(hello) = payload::<HelloPayload>(&inbound) else {
                    return;
                };
                let mut info = DeviceInfo::from(hello);
                if info.ip.is_none() {
                    info.ip = Some(inbound.connection.clone());
                }
                if info.version.is_none() {
                    info.version = inbound.message.version.clone();
                }
                self.engine.upsert_device(&inbound.sender, info);
                self.publish_snapshot(Action::Update, Audience::Web).await;
            }
            Action::Button => {
                if let Some(button) = payload::<ButtonPayload>(&inbound) {
                    self.buzz(&inbound, &inbound.sender, &button.button);
                }
            }
            Action::Pong => self.device_ready(&inbound.sender).await,
            ref other => debug!("Ignoring {} from device {}", other, inbound.sender),
        }
    }

    async fn from_web(&mut self, inbound: Inbound) {
        match inbound.message.action {
            Action::Hello => self.greet(&inbound.connection),
            Action::Full | Action::Update => {
                if let Some(update) = payload::<RosterUpdate>(&inbound) {
                    self.engine.replace_roster(update);
                    self.publish_snapshot(Action::Update, Audience::Web).await;
                }
            }
            Action::Ready => {
                let Some(ready) = payload::<ReadyPayload>(&inbound) else {
                    return;
                };
                let question = self.questions.get(&ready.question).cloned();
                if question.is_none() {
                    warn!("Question {} is not in the bank", ready.question);
                }
                if self.engine.prepare(&ready.question, question) {
                    self.publish(&Message::empty(Action::Ping), Audience::Devices)
                        .await;
                }
            }
            Action::Start => {
                let start = payload::<StartPayload>(&inbound).unwrap_or_default();
                let delay = if start.delay > 0 {
                    start.delay
                } else {
                    self.default_delay
                };
                self.engine.start_round(delay);
                self.publish_snapshot(Action::Start, Audience::Everyone).await;
            }
            Action::Stop => {
                self.engine.stop_round();
                self.publish_snapshot(Action::Stop, Audience::Everyone).await;
            }
            Action::Pause => {
                self.engine.pause();
                self.publish_snapshot(Action::Pause, Audience::Everyone).await;
            }
            Action::Continue => {
                self.engine.resume();
                self.publish_snapshot(Action::Continue, Audience::Everyone)
                    .await;
            }
            Action::Reveal => {
                let Some(answer) = self.engine.reveal() else {
                    return;
                };
                if let Some(message) = encode(Action::Reveal, &answer) {
                    self.publish(&message, Audience::Everyone).await;
                }
            }
            Action::Raz => {
                self.engine.reset_all_scores();
                self.publish_snapshot(Action::Update, Audience::Web).await;
            }
            Action::Reset => {
                self.engine.stop_round();
                self.publish(&Message::empty(Action::Reset), Audience::Everyone)
                    .await;
                self.publish(&Message::empty(Action::Hello), Audience::Everyone)
                    .await;
            }
            Action::Remote => {
                if let Some(remote) = payload::<RemotePayload>(&inbound) {
                    self.engine.set_remote_page(&remote.remote);
                    self.publish_snapshot(Action::Remote, Audience::Web).await;
                }
            }
            Action::Points => {
                if let Some(points) = payload::<PointsPayload>(&inbound) {
                    self.engine
                        .adjust_player_score(&points.device_id, points.points);
                    self.publish_snapshot(Action::Update, Audience::Web).await;
                }
            }
            Action::BumperPoints => {
                if let Some(points) = payload::<BumperPointsPayload>(&inbound) {
                    self.engine
                        .adjust_player_score(&points.device_id, points.points);
                    self.publish_snapshot(Action::Update, Audience::Web).await;
                }
            }
            Action::TeamPoints => {
                if let Some(points) = payload::<TeamPointsPayload>(&inbound) {
                    self.engine.distribute_team_score(&points.team, points.points);
                    self.publish_snapshot(Action::Update, Audience::Web).await;
                }
            }
            Action::SetClientType => {
                let Some(set) = payload::<SetClientTypePayload>(&inbound) else {
                    return;
                };
                match ClientKind::from_tag(&set.kind) {
                    Some(kind) => {
                        if let Err(e) = self.web.set_client_kind(&inbound.connection, kind).await {
                            warn!("Failed to reclassify {}: {}", inbound.connection, e);
                        }
                    }
                    None => warn!("Unknown client type {:?}", set.kind),
                }
            }
            Action::ForceReady => {
                if self.engine.force_ready() {
                    self.publish_roster(Action::Ready, Audience::Everyone).await;
                }
            }
            Action::DeleteBumper => {
                if let Some(device) = payload::<DevicePayload>(&inbound) {
                    if self.engine.remove_device(&device.device_id) {
                        self.publish_snapshot(Action::Update, Audience::Web).await;
                    }
                }
            }
            Action::Delete => {
                let Some(delete) = payload::<DeleteQuestionPayload>(&inbound) else {
                    return;
                };
                if delete.question_id.is_empty() {
                    warn!("DELETE without a question id");
                } else if self.questions.remove(&delete.question_id).is_some() {
                    info!("Question {} deleted", delete.question_id);
                    self.publish_questions(Audience::Web).await;
                } else {
                    warn!("DELETE for unknown question {}", delete.question_id);
                }
            }
            Action::Reboot => info!("Reboot requested by {}", inbound.connection),
            // Admin pages simulating a buzzer name it in the payload
            Action::Button => {
                let Some(button) = payload::<ButtonPayload>(&inbound) else {
                    return;
                };
                match button.device.as_deref() {
                    Some(device) => self.buzz(&inbound, device, &button.button),
                    None => warn!("Simulated BUTTON without a device id"),
                }
            }
            Action::Pong => {
                if let Some(device) = payload::<DevicePayload>(&inbound) {
                    self.device_ready(&device.device_id).await;
                }
            }
            ref other => debug!("Ignoring {} from {}", other, inbound.connection),
        }
    }

    /// Buzzes are ordered by the device's own timestamp when it sent one.
    fn buzz(&self, inbound: &Inbound, device_id: &str, button: &str) {
        let timestamp = inbound.message.time_event.unwrap_or(inbound.received_at);
        self.engine.record_buzz(device_id, timestamp, button);
    }

    async fn device_ready(&self, device_id: &str) {
        if self.engine.phase() != Phase::Prepare {
            debug!("PONG from {} outside of prepare", device_id);
            return;
        }

        self.engine.mark_device_ready(device_id);
        if self.engine.all_teams_ready() && self.engine.confirm_ready() {
            self.publish_roster(Action::Ready, Audience::Everyone).await;
        }
        self.publish_snapshot(Action::Update, Audience::Web).await;
    }

    /// Brings a freshly connected page up to date.
    fn greet(&self, connection: &str) {
        let counts = self.web.counts();
        let replies = [
            self.snapshot(Action::Update)
                .map(|message| message.with_version(self.version.clone())),
            encode(Action::Questions, &self.questions),
            encode(Action::Clients, &clients_payload(counts)),
        ];

        for message in replies.into_iter().flatten() {
            if let Err(e) = self.web.send_to(connection, &message) {
                warn!("Failed to greet {}: {}", connection, e);
                return;
            }
        }
    }

    fn announce_clients(&self, counts: ClientCounts) {
        let Some(message) = encode(Action::Clients, &clients_payload(counts)) else {
            return;
        };
        if let Err(e) = self.web.broadcast(&message) {
            warn!("Failed to announce clients: {}", e);
        }
    }

    fn snapshot(&self, action: Action) -> Option<Message> {
        encode(action, &self.engine.current_state_snapshot())
    }

    async fn publish_snapshot(&self, action: Action, audience: Audience) {
        if let Some(message) = self.snapshot(action) {
            self.publish(&message, audience).await;
        }
    }

    async fn publish_roster(&self, action: Action, audience: Audience) {
        if let Some(message) = encode(action, &self.engine.current_roster_snapshot()) {
            self.publish(&message, audience).await;
        }
    }

    async fn publish_questions(&self, audience: Audience) {
        if let Some(message) = encode(Action::Questions, &self.questions) {
            self.publish(&message, audience).await;
        }
    }

    async fn publish(&self, message: &Message, audience: Audience) {
        if matches!(audience, Audience::Web | Audience::Everyone) {
            if let Err(e) = self.web.broadcast(message) {
                warn!("Web broadcast of {} failed: {}", message.action, e);
            }
        }
        if matches!(audience, Audience::Devices | Audience::Everyone) {
            self.publish_to_devices(message).await;
        }
    }

    async fn publish_to_devices(&self, message: &Message) {
        match &self.udp {
            Some(udp) => {
                if let Err(e) = udp.broadcast(message).await {
                    warn!("UDP broadcast of {} failed: {}", message.action, e);
                }
            }
            None => {
                if let Err(e) = self.devices.broadcast(message) {
                    warn!("Device broadcast of {} failed: {}", message.action, e);
                }
            }
        }
    }
}

fn encode<P: Serialize>(action: Action, payload: &P) -> Option<Message> {
    match Message::new(action.clone(), payload) {
        Ok(message) => Some(message),
        Err(e) => {
            error!("Failed to encode {}: {}", action, e);
            None
        }
    }
}

fn clients_payload(counts: ClientCounts) -> ClientsPayload {
    ClientsPayload {
        admin_count: counts.admin,
        tv_count: counts.display,
    }
}

fn payload<T: DeserializeOwned>(inbound: &Inbound) -> Option<T> {
    match inbound.message.payload() {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(
                "Bad {} payload from {}: {}",
                inbound.message.action, inbound.sender, e
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_manager::Frame;
    use crate::game::Observers;
    use crate::hub::{Hub, Registration};
    use crate::model::{Device, Team};
    use serde_json::{json, Value};
    use shared::decode_single;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Fixture {
        dispatcher: Dispatcher,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        web: HubHandle,
        admin: Registration,
        buzzer: Registration,
    }

    async fn fixture() -> Fixture {
        let config = crate::config::ServerConfig::default();
        let (forwarder, events) = EventForwarder::channel();
        let engine = Engine::with_observers(&config.game, Observers::all(Arc::new(forwarder)));

        let web = Hub::spawn("web", &config.web_hub);
        let devices = Hub::spawn("devices", &config.device_hub);
        let admin = web.register("admin".to_string(), ClientKind::Admin).await.unwrap();
        let buzzer = devices.register("10.0.0.2".to_string(), ClientKind::Device).await.unwrap();

        let mut questions = QuestionBank::new();
        questions.insert(Question {
            id: "q1".to_string(),
            question: "Capital of France?".to_string(),
            answer: "Paris".to_string(),
            points: 10,
            time: 20,
            ..Question::default()
        });

        let dispatcher = Dispatcher::new(engine, web.clone(), devices, questions, &config.game);
        Fixture {
            dispatcher,
            events,
            web,
            admin,
            buzzer,
        }
    }

    fn seed_roster(engine: &Engine) {
        let mut teams = BTreeMap::new();
        teams.insert("red".to_string(), Team::new("Red"));
        teams.insert("blue".to_string(), Team::new("Blue"));
        let mut bumpers = BTreeMap::new();
        bumpers.insert("AA".to_string(), Device::new("Alice", Some("red")));
        bumpers.insert("BB".to_string(), Device::new("Bob", Some("blue")));
        engine.replace_roster(RosterUpdate {
            teams: Some(teams),
            bumpers: Some(bumpers),
        });
    }

    fn web(action: Action, msg: Value) -> Inbound {
        let mut message = Message::empty(action);
        message.msg = Some(msg);
        Inbound::new(Transport::Web, "admin", message)
    }

    fn device(id: &str, action: Action, msg: Value) -> Inbound {
        let mut message = Message::empty(action).with_id(id);
        message.msg = Some(msg);
        Inbound::new(Transport::Device, "10.0.0.2", message)
    }

    /// Skips frames until one with `action` arrives.
    async fn expect(outbound: &mut mpsc::Receiver<Frame>, action: Action) -> Message {
        loop {
            let frame = timeout(Duration::from_secs(1), outbound.recv())
                .await
                .unwrap_or_else(|_| panic!("no {} received", action))
                .expect("queue closed");
            let message = decode_single(frame.as_bytes()).unwrap();
            if message.action == action {
                return message;
            }
        }
    }

    #[tokio::test]
    async fn test_device_hello_registers_and_updates_web() {
        let mut f = fixture().await;
        f.dispatcher
            .dispatch(device("AA", Action::Hello, json!({"NAME": "Alice", "VERSION": "1.2"})))
            .await;

        let stored = f.dispatcher.engine().device("AA").unwrap();
        assert_eq!(stored.name, "Alice");
        assert_eq!(stored.version, "1.2");
        assert_eq!(stored.ip, "10.0.0.2");

        let update = expect(&mut f.admin.outbound, Action::Update).await;
        assert_eq!(update.msg.unwrap()["bumpers"]["AA"]["NAME"], "Alice");
    }

    #[tokio::test]
    async fn test_ready_prepares_and_pings_devices() {
        let mut f = fixture().await;
        f.dispatcher.dispatch(web(Action::Ready, json!({"QUESTION": "q1"}))).await;

        assert_eq!(f.dispatcher.engine().phase(), Phase::Prepare);
        assert_eq!(f.dispatcher.engine().active_question().unwrap().answer, "Paris");
        expect(&mut f.buzzer.outbound, Action::Ping).await;
        assert_eq!(f.events.recv().await, Some(EngineEvent::PhaseChanged(Phase::Prepare)));
    }

    #[tokio::test]
    async fn test_pongs_confirm_ready_once_every_team_answers() {
        let mut f = fixture().await;
        seed_roster(f.dispatcher.engine());
        f.dispatcher.dispatch(web(Action::Ready, json!({"QUESTION": "q1"}))).await;

        f.dispatcher.dispatch(device("AA", Action::Pong, json!({}))).await;
        assert_eq!(f.dispatcher.engine().phase(), Phase::Prepare);

        f.dispatcher.dispatch(device("BB", Action::Pong, json!({}))).await;
        assert_eq!(f.dispatcher.engine().phase(), Phase::Ready);

        let ready = expect(&mut f.admin.outbound, Action::Ready).await;
        assert!(ready.msg.unwrap()["teams"]["red"]["READY"].as_bool().unwrap());
        expect(&mut f.buzzer.outbound, Action::Ready).await;
    }

    #[tokio::test]
    async fn test_start_uses_default_delay_and_reaches_everyone() {
        let mut f = fixture().await;
        f.dispatcher.dispatch(web(Action::Start, json!({"DELAY": 0}))).await;

        assert_eq!(f.dispatcher.engine().phase(), Phase::Started);
        assert_eq!(f.dispatcher.engine().remaining_time(), 30);

        let start = expect(&mut f.admin.outbound, Action::Start).await;
        assert_eq!(start.msg.unwrap()["GAME"]["PHASE"], "STARTED");
        expect(&mut f.buzzer.outbound, Action::Start).await;
        f.dispatcher.engine().stop_round();
    }

    #[tokio::test]
    async fn test_button_uses_device_timestamp() {
        let mut f = fixture().await;
        seed_roster(f.dispatcher.engine());
        f.dispatcher.engine().start_round(10);

        let mut late = device("AA", Action::Button, json!({"button": "A"}));
        late.message.time_event = Some(2_000);
        let mut early = device("BB", Action::Button, json!({"button": "B"}));
        early.message.time_event = Some(1_000);
        // Arrival order is the reverse of press order
        f.dispatcher.dispatch(late).await;
        f.dispatcher.dispatch(early).await;

        assert_eq!(f.dispatcher.engine().device("AA").unwrap().buzz_time, Some(2_000));
        assert_eq!(f.dispatcher.engine().device("BB").unwrap().buzz_time, Some(1_000));
        assert_eq!(f.dispatcher.engine().team("blue").unwrap().buzz_time, Some(1_000));
        f.dispatcher.engine().stop_round();
    }

    #[tokio::test]
    async fn test_simulated_button_needs_device_id() {
        let mut f = fixture().await;
        seed_roster(f.dispatcher.engine());
        f.dispatcher.engine().start_round(10);

        f.dispatcher.dispatch(web(Action::Button, json!({"button": "A"}))).await;
        assert!(f.dispatcher.engine().device("AA").unwrap().buzz_time.is_none());

        f.dispatcher
            .dispatch(web(Action::Button, json!({"button": "A", "ID": "AA"})))
            .await;
        assert!(f.dispatcher.engine().device("AA").unwrap().buzz_time.is_some());
        f.dispatcher.engine().stop_round();
    }

    #[tokio::test]
    async fn test_reveal_sends_bare_answer() {
        let mut f = fixture().await;
        f.dispatcher.dispatch(web(Action::Ready, json!({"QUESTION": "q1"}))).await;
        f.dispatcher.dispatch(web(Action::Stop, json!({}))).await;
        f.dispatcher.dispatch(web(Action::Reveal, json!({}))).await;

        assert_eq!(f.dispatcher.engine().phase(), Phase::Revealed);
        let reveal = expect(&mut f.admin.outbound, Action::Reveal).await;
        assert_eq!(reveal.msg, Some(json!("Paris")));
        expect(&mut f.buzzer.outbound, Action::Reveal).await;
    }

    #[tokio::test]
    async fn test_score_messages() {
        let mut f = fixture().await;
        seed_roster(f.dispatcher.engine());

        f.dispatcher
            .dispatch(web(Action::Points, json!({"bumperId": "AA", "points": 3})))
            .await;
        f.dispatcher
            .dispatch(web(Action::BumperPoints, json!({"ID": "BB", "POINTS": 4})))
            .await;
        f.dispatcher
            .dispatch(web(Action::TeamPoints, json!({"TEAM": "red", "POINTS": 7})))
            .await;

        let engine = f.dispatcher.engine();
        assert_eq!(engine.device("AA").unwrap().score, 10);
        assert_eq!(engine.team("red").unwrap().score, 10);
        assert_eq!(engine.team("blue").unwrap().score, 4);
        assert_eq!(engine.history().len(), 3);

        f.dispatcher.dispatch(web(Action::Raz, json!({}))).await;
        assert_eq!(f.dispatcher.engine().team("red").unwrap().score, 0);
        assert!(f.dispatcher.engine().history().is_empty());
        expect(&mut f.admin.outbound, Action::Update).await;
    }

    #[tokio::test]
    async fn test_extreme_points_keep_dispatcher_alive() {
        let mut f = fixture().await;
        seed_roster(f.dispatcher.engine());

        for _ in 0..2 {
            f.dispatcher
                .dispatch(web(Action::BumperPoints, json!({"ID": "AA", "POINTS": i64::MAX})))
                .await;
            f.dispatcher
                .dispatch(web(Action::TeamPoints, json!({"TEAM": "blue", "POINTS": i64::MIN})))
                .await;
        }

        let engine = f.dispatcher.engine();
        assert_eq!(engine.team("red").unwrap().score, i64::MAX);
        assert_eq!(engine.team("blue").unwrap().score, i64::MIN);
        expect(&mut f.admin.outbound, Action::Update).await;
    }

    #[tokio::test]
    async fn test_reset_stops_and_asks_for_hello() {
        let mut f = fixture().await;
        f.dispatcher.engine().start_round(10);
        f.dispatcher.dispatch(web(Action::Reset, json!({}))).await;

        assert_eq!(f.dispatcher.engine().phase(), Phase::Stopped);
        expect(&mut f.buzzer.outbound, Action::Reset).await;
        expect(&mut f.buzzer.outbound, Action::Hello).await;
    }

    #[tokio::test]
    async fn test_web_hello_greets_only_that_client() {
        let mut f = fixture().await;
        let mut other = f.web.register("tv".to_string(), ClientKind::Display).await.unwrap();

        f.dispatcher.dispatch(web(Action::Hello, json!({}))).await;

        let update = expect(&mut f.admin.outbound, Action::Update).await;
        assert!(update.version.is_some());
        let questions = expect(&mut f.admin.outbound, Action::Questions).await;
        assert_eq!(questions.msg.unwrap()["q1"]["ANSWER"], "Paris");
        expect(&mut f.admin.outbound, Action::Clients).await;

        tokio::task::yield_now().await;
        assert!(other.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delete_bumper_and_question() {
        let mut f = fixture().await;
        seed_roster(f.dispatcher.engine());

        f.dispatcher.dispatch(web(Action::DeleteBumper, json!({"ID": "AA"}))).await;
        assert!(f.dispatcher.engine().device("AA").is_none());

        f.dispatcher.dispatch(web(Action::Delete, json!({"ID": "missing"}))).await;
        f.dispatcher.dispatch(web(Action::Delete, json!({}))).await;
        assert_eq!(f.dispatcher.questions().len(), 1);

        f.dispatcher.dispatch(web(Action::Delete, json!({"ID": "q1"}))).await;
        assert!(f.dispatcher.questions().is_empty());
    }

    #[tokio::test]
    async fn test_events_are_forwarded_to_web() {
        let mut f = fixture().await;
        f.dispatcher
            .handle_event(EngineEvent::PhaseChanged(Phase::Stopped))
            .await;
        let update = expect(&mut f.admin.outbound, Action::Update).await;
        assert_eq!(update.version.as_deref(), Some(env!("CARGO_PKG_VERSION")));

        f.dispatcher.handle_event(EngineEvent::Tick(5)).await;
        expect(&mut f.admin.outbound, Action::UpdateTimer).await;
        expect(&mut f.buzzer.outbound, Action::UpdateTimer).await;
    }

    #[tokio::test]
    async fn test_client_type_change_announces_counts() {
        let f = fixture().await;
        let Fixture {
            dispatcher,
            events,
            mut admin,
            ..
        } = f;
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        tokio::spawn(dispatcher.run(inbound_rx, events));

        inbound_tx
            .send(web(Action::SetClientType, json!({"TYPE": "tv"})))
            .await
            .unwrap();

        loop {
            let clients = expect(&mut admin.outbound, Action::Clients).await;
            let payload: ClientsPayload = clients.payload().unwrap();
            if payload.tv_count == 1 {
                assert_eq!(payload.admin_count, 0);
                break;
            }
        }
    }

    #[test]
    fn test_question_bank_formats() {
        let map = QuestionBank::from_json(r#"{"7": {"QUESTION": "?", "ANSWER": "42"}}"#).unwrap();
        assert_eq!(map.get("7").unwrap().id, "7");
        assert_eq!(map.get("7").unwrap().answer, "42");

        let list = QuestionBank::from_json(r#"[{"ID": "a"}, {"ID": "b"}]"#).unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.get("b").is_some());

        assert!(QuestionBank::from_json("42").is_err());
    }
}
