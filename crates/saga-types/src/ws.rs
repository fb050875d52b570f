//! WebSocket message protocol between observers and the server.
//!
//! Every frame is a JSON object `{ "event": <name>, "data": <payload> }`;
//! payload-less events omit `data`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{SessionInfo, StoryDetail};

/// Messages sent from server to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum WsServerMessage {
    /// Full current snapshot of worker sessions, newest first.
    #[serde(rename = "sessions-updated")]
    SessionsUpdated(Vec<SessionInfo>),
    /// A subscribed story changed.
    #[serde(rename = "story-updated")]
    StoryUpdated(StoryDetail),
    /// Output for a subscribed log stream.
    #[serde(rename = "logs-data")]
    LogsData(LogsData),
    /// A log subscription could not be served.
    #[serde(rename = "logs-error")]
    LogsError(LogsError),
    /// Reply to an application-level ping.
    #[serde(rename = "pong")]
    Pong,
}

/// A chunk of a session's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsData {
    pub entity_key: String,
    /// Parsed JSONL records, in file order.
    pub payload: Vec<Value>,
    /// First frame for this subscription: the whole file so far.
    pub is_initial: bool,
    /// No further frames will follow for this entity.
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsError {
    pub entity_key: String,
    pub error: String,
}

/// Messages sent from observers to the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum WsClientMessage {
    #[serde(rename = "subscribe:story")]
    SubscribeStory(StoryRef),
    #[serde(rename = "unsubscribe:story")]
    UnsubscribeStory(StoryRef),
    #[serde(rename = "subscribe:logs")]
    SubscribeLogs(LogsRef),
    #[serde(rename = "unsubscribe:logs")]
    UnsubscribeLogs(LogsRef),
    /// Liveness probe, answered with [`WsServerMessage::Pong`].
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoryRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsRef {
    pub entity_key: String,
}

impl WsClientMessage {
    pub fn subscribe_story(id: impl Into<String>) -> Self {
        WsClientMessage::SubscribeStory(StoryRef { id: id.into() })
    }

    pub fn unsubscribe_story(id: impl Into<String>) -> Self {
        WsClientMessage::UnsubscribeStory(StoryRef { id: id.into() })
    }

    pub fn subscribe_logs(entity_key: impl Into<String>) -> Self {
        WsClientMessage::SubscribeLogs(LogsRef {
            entity_key: entity_key.into(),
        })
    }

    pub fn unsubscribe_logs(entity_key: impl Into<String>) -> Self {
        WsClientMessage::UnsubscribeLogs(LogsRef {
            entity_key: entity_key.into(),
        })
    }
}
