//! JSON wire protocol spoken over the live connection.
//!
//! Envelope (one WebSocket text frame per message):
//! ```text
//! {
//!   "type":       "submit" | "op" | "presence" | …,
//!   "id":         request id, echoed on the response        (optional)
//!   "collection": "record_tbl1"                             (optional)
//!   "document":   "rec1"                                    (optional)
//!   "data":       type-specific payload                     (optional)
//!   "error":      { "code": 409, "message": "…" }           (optional)
//!   "timestamp":  RFC 3339
//! }
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::ot::OtOperation;
use crate::types::{CreateData, Projection, Query, Snapshot};

/// Message types. Unrecognised type strings decode to [`MessageType::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Connect,
    Connected,
    Disconnect,
    Error,
    Subscribe,
    Unsubscribe,
    Query,
    QueryResponse,
    Submit,
    SubmitResponse,
    Op,
    Presence,
    Cursor,
    Notification,
    Conflict,
    Ping,
    Pong,
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Connect => "connect",
            Self::Connected => "connected",
            Self::Disconnect => "disconnect",
            Self::Error => "error",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Query => "query",
            Self::QueryResponse => "queryResponse",
            Self::Submit => "submit",
            Self::SubmitResponse => "submitResponse",
            Self::Op => "op",
            Self::Presence => "presence",
            Self::Cursor => "cursor",
            Self::Notification => "notification",
            Self::Conflict => "conflict",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Unknown(s) => s,
        }
    }
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "connect" => Self::Connect,
            "connected" => Self::Connected,
            "disconnect" => Self::Disconnect,
            "error" => Self::Error,
            "subscribe" => Self::Subscribe,
            "unsubscribe" => Self::Unsubscribe,
            "query" => Self::Query,
            "queryResponse" => Self::QueryResponse,
            "submit" => Self::Submit,
            "submitResponse" => Self::SubmitResponse,
            "op" => Self::Op,
            "presence" => Self::Presence,
            "cursor" => Self::Cursor,
            "notification" => Self::Notification,
            "conflict" => Self::Conflict,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            _ => Self::Unknown(s),
        }
    }
}

impl From<MessageType> for String {
    fn from(t: MessageType) -> Self {
        match t {
            MessageType::Unknown(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload carried by `error` messages and failed responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: u16,
    pub message: String,
}

impl From<&SyncError> for WireError {
    fn from(e: &SyncError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

/// The message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl WireMessage {
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            id: None,
            collection: None,
            document: None,
            data: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Message carrying a serialized payload.
    pub fn with_data<T: Serialize>(msg_type: MessageType, data: &T) -> Result<Self> {
        let mut msg = Self::new(msg_type);
        msg.data = Some(serde_json::to_value(data)?);
        Ok(msg)
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageType::Error);
        msg.error = Some(WireError {
            code,
            message: message.into(),
        });
        msg
    }

    pub fn from_error(e: &SyncError) -> Self {
        let mut msg = Self::new(MessageType::Error);
        msg.error = Some(WireError::from(e));
        msg
    }

    pub fn pong() -> Self {
        Self::new(MessageType::Pong)
    }

    pub fn reply_to(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    pub fn on_document(mut self, collection: impl Into<String>, document: Option<String>) -> Self {
        self.collection = Some(collection.into());
        self.document = document;
        self
    }

    /// Decode `data` into `T`; a missing payload decodes from `null`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        let data = self.data.clone().unwrap_or(Value::Null);
        serde_json::from_value(data).map_err(|e| {
            SyncError::Protocol(format!("invalid {} payload: {e}", self.msg_type))
        })
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// ───────────────────────────────────────────────────────────────────
// Payloads
// ───────────────────────────────────────────────────────────────────

/// Payload of outbound `op` messages produced by the publish entry points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentOperation {
    pub op: Vec<OtOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// `subscribe` / `unsubscribe` acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionAck {
    pub channel: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub query: Query,
    #[serde(default)]
    pub projection: Projection,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResponse {
    pub data: Vec<Snapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// Inbound `submit` payload; collection and document come from the envelope.
///
/// When `v` is omitted the next version of the document is used.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<Vec<OtOperation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<CreateData>,
    #[serde(default)]
    pub del: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubmitResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// Inbound `presence` payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PresenceRequest {
    #[serde(default)]
    pub data: serde_json::Map<String, Value>,
    /// Leave the collection instead of updating.
    #[serde(default)]
    pub leave: bool,
}

/// Inbound `cursor` payload. A missing position removes the cursor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CursorRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_type_names() {
        let t: MessageType = serde_json::from_value(json!("queryResponse")).unwrap();
        assert_eq!(t, MessageType::QueryResponse);
        assert_eq!(serde_json::to_value(MessageType::SubmitResponse).unwrap(), json!("submitResponse"));

        let unknown: MessageType = serde_json::from_value(json!("teleport")).unwrap();
        assert_eq!(unknown, MessageType::Unknown("teleport".into()));
        assert_eq!(serde_json::to_value(unknown).unwrap(), json!("teleport"));
    }

    #[test]
    fn test_envelope_omits_empty_fields() {
        let msg = WireMessage::pong();
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj["type"], json!("pong"));
        assert!(obj.contains_key("timestamp"));
        assert!(!obj.contains_key("id"));
        assert!(!obj.contains_key("error"));
    }

    #[test]
    fn test_decode_without_timestamp() {
        let msg = WireMessage::decode(
            r#"{"type":"subscribe","id":"7","collection":"record_t1","document":"r1"}"#,
        )
        .unwrap();
        assert_eq!(msg.msg_type, MessageType::Subscribe);
        assert_eq!(msg.id.as_deref(), Some("7"));
        assert_eq!(msg.document.as_deref(), Some("r1"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(WireMessage::decode("{"), Err(SyncError::Protocol(_))));
        assert!(WireMessage::decode(r#"{"id":"1"}"#).is_err());
    }

    #[test]
    fn test_error_from_sync_error() {
        let msg = WireMessage::from_error(&SyncError::validation("collection is required"))
            .reply_to(Some("3".into()));
        let err = msg.error.unwrap();
        assert_eq!(err.code, 400);
        assert!(err.message.contains("collection is required"));
        assert_eq!(msg.id.as_deref(), Some("3"));
    }

    #[test]
    fn test_submit_request_payload() {
        let msg = WireMessage::decode(
            r#"{"type":"submit","collection":"record_t","document":"r",
                "data":{"v":2,"op":[{"p":["name"],"od":"a","oi":"b"}]}}"#,
        )
        .unwrap();
        let req: SubmitRequest = msg.data_as().unwrap();
        assert_eq!(req.v, Some(2));
        assert_eq!(req.op.unwrap().len(), 1);
        assert!(!req.del);
    }

    #[test]
    fn test_data_as_reports_type() {
        let mut msg = WireMessage::new(MessageType::Submit);
        msg.data = Some(json!({"v": "two"}));
        let err = msg.data_as::<SubmitRequest>().unwrap_err();
        assert!(err.to_string().contains("submit"));
    }
}
