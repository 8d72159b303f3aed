//! Realtime protocol message types
//!
//! Phoenix channel frames exchanged with the realtime endpoint, JSON over
//! text frames.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::SyncError;
use crate::models::{RemoteFeature, RemoteId};
use crate::remote::RemoteChange;

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";

/// Topic of the connection-level heartbeat
const PHOENIX_TOPIC: &str = "phoenix";

/// One Phoenix channel frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl PhoenixMessage {
    /// Join a channel listening to every row change of `schema.table`
    pub fn join(topic: &str, schema: &str, table: &str, access_token: &str, reference: u64) -> Self {
        PhoenixMessage {
            topic: topic.to_string(),
            event: EVENT_JOIN.to_string(),
            payload: json!({
                "config": {
                    "broadcast": { "ack": false, "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [
                        { "event": "*", "schema": schema, "table": table }
                    ]
                },
                "access_token": access_token
            }),
            reference: Some(reference.to_string()),
        }
    }

    pub fn heartbeat(reference: u64) -> Self {
        PhoenixMessage {
            topic: PHOENIX_TOPIC.to_string(),
            event: EVENT_HEARTBEAT.to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Whether this is an `ok` reply to the frame sent with `reference`
    pub fn is_ok_reply(&self, reference: u64) -> bool {
        self.event == EVENT_REPLY
            && self.reference.as_deref() == Some(reference.to_string().as_str())
            && self.payload.get("status").and_then(Value::as_str) == Some("ok")
    }

    /// Whether this is an error reply to the frame sent with `reference`
    pub fn is_error_reply(&self, reference: u64) -> bool {
        self.event == EVENT_REPLY
            && self.reference.as_deref() == Some(reference.to_string().as_str())
            && self.payload.get("status").and_then(Value::as_str) == Some("error")
    }
}

#[derive(Debug, Deserialize)]
struct ChangesPayload {
    data: ChangeData,
}

#[derive(Debug, Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    kind: ChangeKind,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Extract a row change from a `postgres_changes` frame
///
/// Returns `Ok(None)` for frames of other events or other tables.
pub fn parse_change(message: &PhoenixMessage, table: &str) -> Result<Option<RemoteChange>, SyncError> {
    if message.event != EVENT_POSTGRES_CHANGES {
        return Ok(None);
    }

    let payload: ChangesPayload = serde_json::from_value(message.payload.clone())
        .map_err(|e| SyncError::malformed(format!("change payload: {}", e)))?;
    let data = payload.data;
    if data.table.as_deref().is_some_and(|t| t != table) {
        return Ok(None);
    }

    let change = match data.kind {
        ChangeKind::Insert => RemoteChange::Insert(record(data.record)?),
        ChangeKind::Update => RemoteChange::Update(record(data.record)?),
        ChangeKind::Delete => {
            let id = data
                .old_record
                .as_ref()
                .and_then(|old| old.get("id"))
                .cloned()
                .ok_or_else(|| SyncError::malformed("delete without old_record.id"))?;
            let id: RemoteId = serde_json::from_value(id)
                .map_err(|e| SyncError::malformed(format!("deleted row id: {}", e)))?;
            RemoteChange::Delete { id }
        }
    };
    Ok(Some(change))
}

fn record(record: Option<Value>) -> Result<RemoteFeature, SyncError> {
    let record = record.ok_or_else(|| SyncError::malformed("change without record"))?;
    serde_json::from_value(record).map_err(|e| SyncError::malformed(format!("changed row: {}", e)))
}
