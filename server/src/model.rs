//! Game records and the snapshots broadcast to clients.
//!
//! Field names are the ones the admin and display pages read, so they are
//! fixed by the wire format rather than Rust conventions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// The round state held by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[default]
    Stopped,
    Prepare,
    Ready,
    Started,
    Paused,
    Revealed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Stopped => "STOPPED",
            Phase::Prepare => "PREPARE",
            Phase::Ready => "READY",
            Phase::Started => "STARTED",
            Phase::Paused => "PAUSED",
            Phase::Revealed => "REVEALED",
        };
        f.write_str(name)
    }
}

/// Status tag written on a device and its team when they buzz.
pub const BUZZED_STATUS: &str = "PAUSE";

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Team {
    #[serde(rename = "NAME")]
    pub name: String,
    /// RGB triple.
    #[serde(rename = "COLOR")]
    pub color: Vec<i32>,
    #[serde(rename = "SCORE")]
    pub score: i64,
    /// Fastest member buzz this round, epoch microseconds.
    #[serde(rename = "TIME", skip_serializing_if = "Option::is_none")]
    pub buzz_time: Option<i64>,
    #[serde(rename = "STATUS", skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Device holding the team's fastest buzz.
    #[serde(rename = "BUMPER", skip_serializing_if = "Option::is_none")]
    pub buzzer: Option<String>,
    #[serde(rename = "READY", skip_serializing_if = "is_false")]
    pub ready: bool,
}

impl Team {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub(crate) fn clear_round(&mut self) {
        self.buzz_time = None;
        self.status = None;
        self.buzzer = None;
        self.ready = false;
    }
}

/// A physical buzzer ("bumper"), keyed by its hardware address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Device {
    #[serde(rename = "NAME", skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Owning team key. May name a team that no longer exists.
    #[serde(rename = "TEAM", skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(rename = "SCORE")]
    pub score: i64,
    #[serde(rename = "TIME", skip_serializing_if = "Option::is_none")]
    pub buzz_time: Option<i64>,
    #[serde(rename = "BUTTON", skip_serializing_if = "Option::is_none")]
    pub button: Option<String>,
    #[serde(rename = "STATUS", skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(rename = "VERSION", skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(rename = "IP", skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(rename = "READY", skip_serializing_if = "is_false")]
    pub ready: bool,
}

impl Device {
    pub fn new(name: impl Into<String>, team: Option<&str>) -> Self {
        Self {
            name: name.into(),
            team: team.map(str::to_string),
            ..Self::default()
        }
    }

    pub(crate) fn clear_round(&mut self) {
        self.buzz_time = None;
        self.button = None;
        self.status = None;
        self.ready = false;
    }

    pub fn belongs_to(&self, team_id: &str) -> bool {
        self.team.as_deref() == Some(team_id)
    }
}

/// Fields a buzzer reports about itself in HELLO. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub name: Option<String>,
    pub team: Option<String>,
    pub version: Option<String>,
    pub ip: Option<String>,
}

impl From<shared::payload::HelloPayload> for DeviceInfo {
    fn from(hello: shared::payload::HelloPayload) -> Self {
        Self {
            name: hello.name,
            team: hello.team,
            version: hello.version,
            ip: hello.ip,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Question {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "QUESTION")]
    pub question: String,
    #[serde(rename = "ANSWER")]
    pub answer: String,
    #[serde(rename = "POINTS")]
    pub points: i64,
    /// Suggested countdown in seconds.
    #[serde(rename = "TIME")]
    pub time: i64,
    #[serde(rename = "MEDIA", skip_serializing_if = "Option::is_none")]
    pub media: Option<String>,
    #[serde(rename = "STATUS", skip_serializing_if = "Option::is_none")]
    pub status: Option<Phase>,
    /// Answer options for multiple-choice questions.
    #[serde(rename = "CHOICES", skip_serializing_if = "Option::is_none")]
    pub choices: Option<Value>,
}

/// The `GAME` block of a state snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundSnapshot {
    #[serde(rename = "PHASE")]
    pub phase: Phase,
    #[serde(rename = "DELAY")]
    pub delay: i64,
    #[serde(rename = "CURRENT_TIME")]
    pub remaining: i64,
    #[serde(rename = "QUESTION", skip_serializing_if = "Option::is_none")]
    pub question: Option<Question>,
    #[serde(rename = "REMOTE", skip_serializing_if = "String::is_empty")]
    pub remote: String,
    #[serde(rename = "STARTED_AT", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
}

/// Everything a display needs to redraw: round state plus the roster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameSnapshot {
    #[serde(rename = "GAME")]
    pub game: RoundSnapshot,
    pub teams: BTreeMap<String, Team>,
    pub bumpers: BTreeMap<String, Device>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RosterSnapshot {
    pub teams: BTreeMap<String, Team>,
    pub bumpers: BTreeMap<String, Device>,
}

/// Roster sent by the admin page with FULL or UPDATE. Missing collections are
/// left untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RosterUpdate {
    pub teams: Option<BTreeMap<String, Team>>,
    pub bumpers: Option<BTreeMap<String, Device>>,
}

/// Who received the points of a [`GameEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Winner {
    Player,
    Team,
}

/// One entry of the score history kept by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameEvent {
    /// Epoch microseconds.
    #[serde(rename = "TIMESTAMP")]
    pub timestamp: i64,
    #[serde(rename = "QUESTION_ID", skip_serializing_if = "Option::is_none")]
    pub question_id: Option<String>,
    #[serde(rename = "EVENT_TYPE")]
    pub event_type: String,
    /// Device or team key.
    #[serde(rename = "WINNER_ID")]
    pub winner_id: String,
    #[serde(rename = "WINNER_TYPE")]
    pub winner: Winner,
    #[serde(rename = "TEAM", skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(rename = "POINTS")]
    pub points: i64,
}

/// `EVENT_TYPE` of a score change.
pub const POINTS_AWARDED: &str = "POINTS_AWARDED";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_phase_wire_names() {
        assert_eq!(serde_json::to_value(Phase::Started).unwrap(), json!("STARTED"));
        assert_eq!(Phase::Revealed.to_string(), "REVEALED");
        let phase: Phase = serde_json::from_value(json!("PREPARE")).unwrap();
        assert_eq!(phase, Phase::Prepare);
    }

    #[test]
    fn test_idle_device_omits_round_fields() {
        let device = Device::new("Red 1", Some("red"));
        let value = serde_json::to_value(&device).unwrap();
        assert_eq!(value, json!({"NAME": "Red 1", "TEAM": "red", "SCORE": 0}));
    }

    #[test]
    fn test_team_decodes_from_admin_page() {
        let team: Team =
            serde_json::from_value(json!({"COLOR": [255, 0, 0], "SCORE": 4})).unwrap();
        assert_eq!(team.color, vec![255, 0, 0]);
        assert_eq!(team.score, 4);
        assert!(team.name.is_empty());
    }

    #[test]
    fn test_roster_update_is_partial() {
        let update: RosterUpdate =
            serde_json::from_value(json!({"teams": {"red": {"NAME": "Red"}}})).unwrap();
        assert!(update.bumpers.is_none());
        assert_eq!(update.teams.unwrap()["red"].name, "Red");
    }

    #[test]
    fn test_clear_round_keeps_score() {
        let mut device = Device::new("d", Some("red"));
        device.score = 7;
        device.buzz_time = Some(10);
        device.button = Some("RED".into());
        device.ready = true;
        device.clear_round();

        assert_eq!(device.score, 7);
        assert!(device.buzz_time.is_none());
        assert!(device.button.is_none());
        assert!(!device.ready);
    }
}
