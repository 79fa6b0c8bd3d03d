//! Normalized chat contract and the workspace event model.
//!
//! Every transport adapter translates its own wire format into
//! [`CoreChatRequest`] / [`CoreChatResponse`]; the pipeline never sees
//! adapter-specific shapes. Events are immutable observations — state lives
//! only in the digest store and the runtime state file.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

/// A single chat turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

/// Unified internal request shape. Unknown fields are rejected so adapter
/// bugs surface at the boundary instead of silently dropping data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_conversation_id")]
    pub conversation_id: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    /// Adapter tag for logging/debugging only.
    #[serde(default = "default_source_adapter")]
    pub source_adapter: String,
}

fn default_conversation_id() -> String {
    "global".to_string()
}

fn default_source_adapter() -> String {
    "unknown".to_string()
}

impl CoreChatRequest {
    /// Last user turn, or empty string when the history has none.
    pub fn last_user_message(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

/// Terminal outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    Stop,
    Blocked,
    Error,
    ConfirmationPending,
    ConfirmationExecuted,
}

impl fmt::Display for DoneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Blocked => write!(f, "blocked"),
            Self::Error => write!(f, "error"),
            Self::ConfirmationPending => write!(f, "confirmation_pending"),
            Self::ConfirmationExecuted => write!(f, "confirmation_executed"),
        }
    }
}

/// Unified internal response shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreChatResponse {
    pub model: String,
    pub content: String,
    pub conversation_id: String,
    pub done: bool,
    pub done_reason: DoneReason,
    pub memory_used: bool,
    pub validation_passed: Option<bool>,
}

impl CoreChatResponse {
    pub fn terminal(
        model: impl Into<String>,
        content: impl Into<String>,
        conversation_id: impl Into<String>,
        done_reason: DoneReason,
    ) -> Self {
        Self {
            model: model.into(),
            content: content.into(),
            conversation_id: conversation_id.into(),
            done: true,
            done_reason,
            memory_used: false,
            validation_passed: None,
        }
    }
}

/// One NDJSON line of the streaming response. `payload` is flattened so the
/// wire shape stays `{type, …fields…}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(rename = "type")]
    pub event_type: String,
    pub done: bool,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl StreamChunk {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            done: false,
            payload: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: serde_json::Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    pub fn terminal(mut self) -> Self {
        self.done = true;
        self
    }
}

/// Kind of workspace event. The set is open: CSV rows map their `action`
/// column here and external sources may emit kinds we have no variant for,
/// so unknown values round-trip through `Other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    UserMessage,
    AssistantMessage,
    ContainerStarted,
    ContainerStopped,
    ContainerTtlExpired,
    DailyDigest,
    WeeklyDigest,
    ArchiveDigest,
    Observation,
    Note,
    Task,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::UserMessage => "user_message",
            Self::AssistantMessage => "assistant_message",
            Self::ContainerStarted => "container_started",
            Self::ContainerStopped => "container_stopped",
            Self::ContainerTtlExpired => "container_ttl_expired",
            Self::DailyDigest => "daily_digest",
            Self::WeeklyDigest => "weekly_digest",
            Self::ArchiveDigest => "archive_digest",
            Self::Observation => "observation",
            Self::Note => "note",
            Self::Task => "task",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        match s {
            "user_message" => Self::UserMessage,
            "assistant_message" => Self::AssistantMessage,
            "container_started" => Self::ContainerStarted,
            "container_stopped" => Self::ContainerStopped,
            "container_ttl_expired" => Self::ContainerTtlExpired,
            "daily_digest" => Self::DailyDigest,
            "weekly_digest" => Self::WeeklyDigest,
            "archive_digest" => Self::ArchiveDigest,
            "observation" => Self::Observation,
            "note" => Self::Note,
            "task" => Self::Task,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Ok(EventType::from(s.as_str()))
    }
}

/// A workspace/conversation observation. Immutable once written.
///
/// `event_data` stays a free-form map: it must accept any field emitted by
/// external event sources (CSV fact attributes, container labels, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub conversation_id: String,
    pub event_type: EventType,
    /// RFC3339 UTC timestamp, preserved as the source string.
    pub created_at: String,
    #[serde(default)]
    pub event_data: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    /// Parse `created_at` into a UTC datetime. `None` on malformed input —
    /// callers treat such events as undated rather than failing the batch.
    pub fn created_at_utc(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        parse_rfc3339_utc(&self.created_at)
    }
}

/// Lenient RFC3339 parse: accepts a trailing `Z`, an explicit offset, or a
/// naive timestamp (assumed UTC, matching how rows were written).
pub fn parse_rfc3339_utc(ts: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    if ts.is_empty() {
        return None;
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(ts) {
        return Some(dt.with_timezone(&chrono::Utc));
    }
    chrono::NaiveDateTime::parse_from_str(ts.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Current UTC time as an RFC3339 string with `Z` suffix — the canonical
/// timestamp format for all files this runtime writes.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_user_message_picks_most_recent() {
        let req = CoreChatRequest {
            model: "m".into(),
            messages: vec![
                ChatMessage {
                    role: MessageRole::User,
                    content: "first".into(),
                },
                ChatMessage {
                    role: MessageRole::Assistant,
                    content: "reply".into(),
                },
                ChatMessage {
                    role: MessageRole::User,
                    content: "second".into(),
                },
            ],
            conversation_id: "c".into(),
            temperature: None,
            top_p: None,
            max_tokens: None,
            stream: false,
            source_adapter: "test".into(),
        };
        assert_eq!(req.last_user_message(), "second");
    }

    #[test]
    fn request_rejects_unknown_fields() {
        let raw = r#"{"model":"m","messages":[],"conversation_id":"c","bogus":1}"#;
        let parsed: std::result::Result<CoreChatRequest, _> = serde_json::from_str(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn event_type_round_trips_known_and_unknown() {
        for s in ["daily_digest", "container_started", "note", "custom_action"] {
            let et = EventType::from(s);
            assert_eq!(et.as_str(), s);
        }
        assert_eq!(EventType::from("weekly_digest"), EventType::WeeklyDigest);
    }

    #[test]
    fn parse_rfc3339_variants() {
        assert!(parse_rfc3339_utc("2026-02-20T10:00:00Z").is_some());
        assert!(parse_rfc3339_utc("2026-02-20T10:00:00+02:00").is_some());
        assert!(parse_rfc3339_utc("2026-02-20T10:00:00").is_some());
        assert!(parse_rfc3339_utc("").is_none());
        assert!(parse_rfc3339_utc("not a date").is_none());
    }

    #[test]
    fn stream_chunk_wire_shape() {
        let chunk = StreamChunk::new("tool_result")
            .with("tool", serde_json::json!("list_skills"))
            .with("success", serde_json::json!(true));
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["type"], "tool_result");
        assert_eq!(json["tool"], "list_skills");
        assert_eq!(json["done"], false);
    }
}
