//! Typed views of the `MSG` field, one per action that carries data.
//!
//! All shapes tolerate missing fields so a partially filled message from a
//! buzzer or an older admin page still decodes.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// `BUTTON`: which button a device pressed. Web clients simulating a device
/// also name the device through `ID`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ButtonPayload {
    pub button: String,
    #[serde(rename = "ID", skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

/// `HELLO` sent by a buzzer when it connects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelloPayload {
    #[serde(rename = "IP", skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(rename = "VERSION", skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "NAME", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "TEAM", skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartPayload {
    #[serde(rename = "DELAY")]
    pub delay: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadyPayload {
    #[serde(rename = "QUESTION", deserialize_with = "string_or_number")]
    pub question: String,
}

/// `POINTS`: adjust one device's score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PointsPayload {
    #[serde(rename = "bumperId")]
    pub device_id: String,
    pub points: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemotePayload {
    #[serde(rename = "REMOTE")]
    pub remote: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BumperPointsPayload {
    #[serde(rename = "ID")]
    pub device_id: String,
    #[serde(rename = "POINTS")]
    pub points: i64,
}

/// `TEAM_POINTS`: split points across the members of a team.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamPointsPayload {
    #[serde(rename = "TEAM")]
    pub team: String,
    #[serde(rename = "POINTS")]
    pub points: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientsPayload {
    #[serde(rename = "ADMIN_COUNT")]
    pub admin_count: usize,
    #[serde(rename = "TV_COUNT")]
    pub tv_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetClientTypePayload {
    #[serde(rename = "TYPE")]
    pub kind: String,
}

/// Names a device on behalf of a web client (simulated `PONG`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicePayload {
    #[serde(rename = "ID")]
    pub device_id: String,
}

/// Names the question removed by `DELETE`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteQuestionPayload {
    #[serde(rename = "ID", deserialize_with = "string_or_number")]
    pub question_id: String,
}

// Question ids arrive as strings from the admin page and as numbers from
// older question files.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}
