//! Wire types for the device's JSON-RPC-over-HTTP protocol and its push
//! event stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ParseError;

/// RPC procedure names used by the agent.
pub mod method {
    pub const LOGIN: &str = "global.login";
    pub const KEEP_ALIVE: &str = "global.keepAlive";
    pub const SET_CURRENT_TIME: &str = "global.setCurrentTime";
    pub const FILE_FIND_CREATE: &str = "mediaFileFind.factory.create";
    pub const FILE_FIND: &str = "mediaFileFind.findFile";
    pub const FILE_FIND_NEXT: &str = "mediaFileFind.findNextFile";
    pub const FILE_FIND_CLOSE: &str = "mediaFileFind.close";
    pub const FILE_FIND_DESTROY: &str = "mediaFileFind.destroy";
    pub const EVENT_INSTANCE: &str = "eventManager.factory.instance";
    pub const EVENT_ATTACH: &str = "eventManager.attach";
}

/// Endpoint paths relative to the device base URL.
pub mod endpoint {
    pub const LOGIN: &str = "/RPC2_Login";
    pub const RPC: &str = "/RPC2";
    pub const LOAD_FILE: &str = "/cgi-bin/RPC_Loadfile";
    pub const SUBSCRIBE: &str = "/SubscribeNotify.cgi";
}

/// Outgoing RPC request.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RequestEnvelope {
    pub method: String,
    pub params: Value,
    pub id: u64,
    pub session: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<i64>,
}

/// RPC response.  `result` is a boolean for ordinary calls and a numeric
/// handle for factory calls.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub id: Option<u64>,
}

impl ResponseEnvelope {
    /// Explicit boolean success flag; anything else counts as failure.
    pub fn succeeded(&self) -> bool {
        self.result.as_bool() == Some(true)
    }

    /// Object handle returned by a `*.factory.*` call.
    pub fn handle(&self) -> Option<i64> {
        self.result.as_i64().filter(|h| *h != 0)
    }

    /// String field under `params`.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// One entry of the device's media-file index.  Identity is `file_path`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RecordingDescriptor {
    #[serde(rename = "FilePath")]
    pub file_path: String,
    #[serde(rename = "Channel", default)]
    pub channel: i64,
    #[serde(rename = "StartTime", default)]
    pub start_time: String,
    #[serde(rename = "EndTime", default)]
    pub end_time: String,
}

/// `params` of a `mediaFileFind.findNextFile` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FindNextPage {
    #[serde(default)]
    pub found: u64,
    #[serde(default)]
    pub infos: Vec<RecordingDescriptor>,
}

impl FindNextPage {
    pub fn from_response(resp: &ResponseEnvelope) -> Result<Self, ParseError> {
        if resp.params.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(resp.params.clone())?)
    }
}

/// One alarm record from the push stream.  Equality is structural over
/// all four fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlarmEvent {
    pub method: String,
    pub action: String,
    pub code: String,
    pub locale_time: String,
}

#[derive(Deserialize)]
struct EventFrame {
    method: String,
    params: EventParams,
}

#[derive(Deserialize)]
struct EventParams {
    #[serde(rename = "eventList", default)]
    event_list: Vec<EventRecord>,
}

#[derive(Deserialize)]
struct EventRecord {
    #[serde(rename = "Action")]
    action: String,
    #[serde(rename = "Code")]
    code: String,
    #[serde(rename = "Data", default)]
    data: EventData,
}

#[derive(Deserialize, Default)]
struct EventData {
    #[serde(rename = "LocaleTime", default)]
    locale_time: String,
}

/// Decode one `var json=...` payload into its alarm events.
pub fn parse_event_frame(json: &str) -> Result<Vec<AlarmEvent>, ParseError> {
    let frame: EventFrame = serde_json::from_str(json)?;
    Ok(frame
        .params
        .event_list
        .into_iter()
        .map(|e| AlarmEvent {
            method: frame.method.clone(),
            action: e.action,
            code: e.code,
            locale_time: e.data.locale_time,
        })
        .collect())
}
