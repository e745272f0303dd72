//! Wire envelope exchanged between shards.
//!
//! ```text
//! { "id": "3-1718000000000-9f2c41d07a1b",
//!   "type": "request" | "response" | "broadcast",
//!   "event": "ping",
//!   "sender": 3,
//!   "receiver": 1 | "all",            (optional)
//!   "data": <any JSON>,               (optional)
//!   "timestamp": 1718000000000 }
//! ```
//!
//! Responses carry a [`ResponsePayload`] in `data` and reuse the request id.

use crate::types::{Error, MessageId, Result, ShardId};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Broadcast,
}

/// Marker for the `"all"` receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllShards;

impl Serialize for AllShards {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("all")
    }
}

impl<'de> Deserialize<'de> for AllShards {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw == "all" {
            Ok(AllShards)
        } else {
            Err(serde::de::Error::custom(format!(
                "expected \"all\" or a shard id, got {:?}",
                raw
            )))
        }
    }
}

/// Addressee of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recipient {
    Shard(ShardId),
    All(AllShards),
}

/// Why a response reports failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    HandlerMissing,
    HandlerFailed,
}

/// Body of a `response` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<FailureCode>,
}

impl ResponsePayload {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            code: None,
        }
    }

    pub fn handler_missing(event: &str) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(format!("No handler registered for event: {}", event)),
            code: Some(FailureCode::HandlerMissing),
        }
    }

    pub fn handler_failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            code: Some(FailureCode::HandlerFailed),
        }
    }

    /// Turn the payload into the caller-facing result of a request for `event`.
    pub fn into_result(self, event: &str) -> Result<Value> {
        if self.success {
            return Ok(self.result.unwrap_or(Value::Null));
        }
        let message = self.error.unwrap_or_else(|| "unknown error".to_string());
        match self.code {
            Some(FailureCode::HandlerMissing) => Err(Error::handler_missing(event)),
            _ => Err(Error::handler_failed(message)),
        }
    }
}

/// The unit exchanged over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub event: String,
    pub sender: ShardId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<Recipient>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: i64,
}

impl Envelope {
    pub fn request(sender: ShardId, receiver: ShardId, event: &str, data: Value) -> Self {
        Self {
            id: MessageId::generate(sender),
            kind: MessageKind::Request,
            event: event.to_string(),
            sender,
            receiver: Some(Recipient::Shard(receiver)),
            data: Some(data),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn broadcast(sender: ShardId, event: &str, data: Value) -> Self {
        Self {
            id: MessageId::generate(sender),
            kind: MessageKind::Broadcast,
            event: event.to_string(),
            sender,
            receiver: Some(Recipient::All(AllShards)),
            data: Some(data),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Response to `request`, sent by `responder`, reusing the request id.
    pub fn response_to(request: &Envelope, responder: ShardId, payload: &ResponsePayload) -> Result<Self> {
        Ok(Self {
            id: request.id.clone(),
            kind: MessageKind::Response,
            event: request.event.clone(),
            sender: responder,
            receiver: Some(Recipient::Shard(request.sender)),
            data: Some(serde_json::to_value(payload)?),
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    /// Parse the response body carried in `data`.
    pub fn response_payload(&self) -> Result<ResponsePayload> {
        if self.kind != MessageKind::Response {
            return Err(Error::validation(format!(
                "envelope {} is a {:?}, not a response",
                self.id, self.kind
            )));
        }
        let data = self
            .data
            .clone()
            .ok_or_else(|| Error::validation(format!("response {} has no data", self.id)))?;
        Ok(serde_json::from_value(data)?)
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}
