use crate::action::Action;
use crate::error::{ProtocolError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

/// Storage statistics some clients attach to their messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FsInfo {
    #[serde(rename = "USED", default)]
    pub used: u64,
    #[serde(rename = "FREE", default)]
    pub free: u64,
    #[serde(rename = "TOTAL", default)]
    pub total: u64,
    #[serde(rename = "P_USED", default)]
    pub percent_used: f64,
}

/// The wire envelope shared by every transport.
///
/// `msg` stays raw JSON until the dispatcher asks for a typed view with
/// [`Message::payload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "seq", default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(rename = "ACTION")]
    pub action: Action,
    #[serde(rename = "ID", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "VERSION", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "MSG", default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<Value>,
    #[serde(rename = "FSINFO", default, skip_serializing_if = "Option::is_none")]
    pub fs_info: Option<FsInfo>,
    #[serde(rename = "TIME_EVENT", default, skip_serializing_if = "Option::is_none")]
    pub time_event: Option<i64>,
}

impl Message {
    /// Builds an outbound message stamped with the current time.
    pub fn new<P: Serialize>(action: Action, payload: &P) -> Result<Self> {
        let msg = serde_json::to_value(payload)?;
        Ok(Self::with_raw_payload(action, msg))
    }

    /// Builds an outbound message carrying an empty `{}` payload.
    pub fn empty(action: Action) -> Self {
        Self::with_raw_payload(action, Value::Object(serde_json::Map::new()))
    }

    fn with_raw_payload(action: Action, msg: Value) -> Self {
        let msg = if msg.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            msg
        };

        Self {
            seq: None,
            action,
            id: None,
            version: None,
            msg: Some(msg),
            fs_info: None,
            time_event: Some(now_micros()),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn with_fs_info(mut self, fs_info: FsInfo) -> Self {
        self.fs_info = Some(fs_info);
        self
    }

    /// Decodes `MSG` into an action-specific shape. A missing payload decodes
    /// as `{}`, so shapes whose fields all have defaults always succeed.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        let raw = match &self.msg {
            Some(value) if !value.is_null() => value.clone(),
            _ => Value::Object(serde_json::Map::new()),
        };

        serde_json::from_value(raw).map_err(|source| ProtocolError::Payload {
            action: self.action.to_string(),
            source,
        })
    }

    /// Stream framing: JSON followed by `\n` and the `0x00` delimiter.
    pub fn encode_stream(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        bytes.push(crate::framing::FRAME_DELIMITER);
        Ok(bytes)
    }

    /// Frame framing: the bare JSON text, one message per transport frame.
    pub fn encode_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
