//! UI-agnostic conversation types
//!
//! These are shared by the delivery client, the transcript store and every
//! presenter (TUI, console), and mirror the JSON the demo backend exchanges.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// A single turn of the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(default = "Utc::now", deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub source: MessageSource,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>, source: MessageSource) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            source,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content, MessageSource::Chat)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content, MessageSource::Chat)
    }
}

/// The role of a chat message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    /// Label used when the transcript is rendered as conversation context
    pub fn label(&self) -> &'static str {
        match self {
            ChatRole::User => "User",
            ChatRole::Assistant => "Assistant",
        }
    }
}

/// Where a message came from. Display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", from = "String")]
pub enum MessageSource {
    #[default]
    Chat,
    Voice,
    VoiceFunction,
}

impl MessageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageSource::Chat => "chat",
            MessageSource::Voice => "voice",
            MessageSource::VoiceFunction => "voice-function",
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            MessageSource::Chat => "chat",
            MessageSource::Voice => "voice",
            MessageSource::VoiceFunction => "system",
        }
    }
}

impl From<String> for MessageSource {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "voice" => MessageSource::Voice,
            // tool-call results pushed by the backend webhook
            "voice-function" | "voice_function" | "function" | "vapi-tool" => {
                MessageSource::VoiceFunction
            }
            _ => MessageSource::Chat,
        }
    }
}

/// Accepts RFC 3339 as well as the offset-less ISO strings the backend writes.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    let Some(raw) = raw else {
        return Ok(Utc::now());
    };

    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_backend_tool_message() {
        let json = r#"{
            "content": "Your appointment is booked",
            "role": "assistant",
            "timestamp": "2025-03-01T10:15:30.123456",
            "source": "vapi-tool",
            "icon": "📧"
        }"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.role, ChatRole::Assistant);
        assert_eq!(msg.source, MessageSource::VoiceFunction);
        assert_eq!(msg.timestamp.to_rfc3339(), "2025-03-01T10:15:30.123456+00:00");
    }

    #[test]
    fn test_missing_source_and_timestamp_default() {
        let json = r#"{"role": "user", "content": "hallo"}"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.source, MessageSource::Chat);
        assert!(msg.timestamp <= Utc::now());
    }

    #[test]
    fn test_source_serializes_kebab_case() {
        let msg = ChatMessage::new(ChatRole::Assistant, "ok", MessageSource::VoiceFunction);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["source"], "voice-function");
        assert_eq!(json["role"], "assistant");

        let back: ChatMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        let json = r#"{"role": "system", "content": "x"}"#;
        assert!(serde_json::from_str::<ChatMessage>(json).is_err());
    }
}
