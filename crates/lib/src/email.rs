//! Inbound "email received" webhook payload and the downstream agent request built from it.

use serde::{Deserialize, Deserializer, Serialize};

/// Treat an explicit `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Webhook notification body (POST /webhook).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub event_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub created_at: String,
    pub data: EmailData,
}

/// The received email. `email_id`, `from` and `subject` are required; the rest default to empty
/// when missing or null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailData {
    pub email_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub created_at: String,
    pub from: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub bcc: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub cc: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message_id: String,
    pub subject: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub filename: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content_disposition: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content_id: String,
}

/// Body POSTed to the downstream agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub start_event: StartEvent,
    pub context: serde_json::Map<String, serde_json::Value>,
    pub handler_id: String,
}

/// The workflow start event: who sent what.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartEvent {
    pub sender: String,
    pub subject: String,
    pub email_id: String,
}

impl InboundEvent {
    /// Decode a webhook body. Invalid JSON and missing required fields both fail here.
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

/// Map an inbound notification to the downstream request. Context and handler id start empty.
pub fn transform(event: &InboundEvent) -> OutboundRequest {
    OutboundRequest {
        start_event: StartEvent {
            sender: event.data.from.clone(),
            subject: event.data.subject.clone(),
            email_id: event.data.email_id.clone(),
        },
        context: serde_json::Map::new(),
        handler_id: String::new(),
    }
}

impl OutboundRequest {
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
