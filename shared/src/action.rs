use serde::{Deserialize, Serialize};
use std::fmt;

/// The `ACTION` tag of a wire message.
///
/// Unknown tags survive a decode/encode cycle through [`Action::Other`] so a
/// newer buzzer firmware never breaks the server's parser.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    Hello,
    Button,
    Pong,
    Ping,
    Start,
    Stop,
    Pause,
    Continue,
    Update,
    UpdateTimer,
    Reset,
    Ready,
    Reveal,
    Points,
    Remote,
    Raz,
    BumperPoints,
    TeamPoints,

    // Housekeeping
    Full,
    Clients,
    SetClientType,
    ForceReady,
    Questions,
    Reboot,
    Delete,
    DeleteBumper,
    FsInfo,

    Other(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::Hello => "HELLO",
            Action::Button => "BUTTON",
            Action::Pong => "PONG",
            Action::Ping => "PING",
            Action::Start => "START",
            Action::Stop => "STOP",
            Action::Pause => "PAUSE",
            Action::Continue => "CONTINUE",
            Action::Update => "UPDATE",
            Action::UpdateTimer => "UPDATE_TIMER",
            Action::Reset => "RESET",
            Action::Ready => "READY",
            Action::Reveal => "REVEAL",
            Action::Points => "POINTS",
            Action::Remote => "REMOTE",
            Action::Raz => "RAZ",
            Action::BumperPoints => "BUMPER_POINTS",
            Action::TeamPoints => "TEAM_POINTS",
            Action::Full => "FULL",
            Action::Clients => "CLIENTS",
            Action::SetClientType => "SET_CLIENT_TYPE",
            Action::ForceReady => "FORCE_READY",
            Action::Questions => "QUESTIONS",
            Action::Reboot => "REBOOT",
            Action::Delete => "DELETE",
            Action::DeleteBumper => "DELETE_BUMPER",
            Action::FsInfo => "FSINFO",
            Action::Other(tag) => tag,
        }
    }
}

impl From<&str> for Action {
    fn from(tag: &str) -> Self {
        match tag {
            "HELLO" => Action::Hello,
            "BUTTON" => Action::Button,
            "PONG" => Action::Pong,
            "PING" => Action::Ping,
            "START" => Action::Start,
            "STOP" => Action::Stop,
            "PAUSE" => Action::Pause,
            "CONTINUE" => Action::Continue,
            "UPDATE" => Action::Update,
            "UPDATE_TIMER" => Action::UpdateTimer,
            "RESET" => Action::Reset,
            "READY" => Action::Ready,
            "REVEAL" => Action::Reveal,
            "POINTS" => Action::Points,
            "REMOTE" => Action::Remote,
            "RAZ" => Action::Raz,
            "BUMPER_POINTS" => Action::BumperPoints,
            "TEAM_POINTS" => Action::TeamPoints,
            "FULL" => Action::Full,
            "CLIENTS" => Action::Clients,
            "SET_CLIENT_TYPE" => Action::SetClientType,
            "FORCE_READY" => Action::ForceReady,
            "QUESTIONS" => Action::Questions,
            "REBOOT" => Action::Reboot,
            "DELETE" => Action::Delete,
            "DELETE_BUMPER" => Action::DeleteBumper,
            "FSINFO" => Action::FsInfo,
            other => Action::Other(other.to_string()),
        }
    }
}

impl From<String> for Action {
    fn from(tag: String) -> Self {
        match Action::from(tag.as_str()) {
            Action::Other(_) => Action::Other(tag),
            known => known,
        }
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        match action {
            Action::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
