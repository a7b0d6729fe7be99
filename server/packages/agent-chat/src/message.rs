use chrono::{DateTime, Utc};
use rand::Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 9;

/// Who produced a chat entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Agent,
    System,
    Error,
    Thinking,
    Debug,
    ToolCall,
    ToolOutput,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
            Self::Error => "error",
            Self::Thinking => "thinking",
            Self::Debug => "debug",
            Self::ToolCall => "tool_call",
            Self::ToolOutput => "tool_output",
        }
    }
}

/// One chat history entry. Built once and never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct Message {
    id: String,
    #[serde(rename = "type")]
    role: MessageRole,
    content: String,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<Value>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        let timestamp = Utc::now();
        Self {
            id: generate_id(timestamp),
            role,
            content: content.into(),
            timestamp,
            metadata: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Agent, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Error, content)
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> MessageRole {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.metadata.as_ref()
    }
}

/// Millisecond timestamp plus a random base36 suffix, so ids created within
/// the same millisecond still differ in practice.
fn generate_id(timestamp: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("{}{}", timestamp.timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_carry_time_prefix_and_differ() {
        let first = Message::agent("a");
        let second = Message::agent("b");
        let millis = first.timestamp().timestamp_millis().to_string();
        assert!(first.id().starts_with(&millis));
        assert_eq!(first.id().len(), millis.len() + ID_SUFFIX_LEN);
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn serializes_with_type_tag_and_rfc3339_timestamp() {
        let message = Message::new(MessageRole::ToolCall, "ls -la");
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value["type"], "tool_call");
        assert_eq!(value["content"], "ls -la");
        assert!(value.get("metadata").is_none());

        let raw = value["timestamp"].as_str().expect("timestamp string");
        let parsed = DateTime::parse_from_rfc3339(raw).expect("rfc3339");
        assert_eq!(parsed.with_timezone(&Utc), message.timestamp());

        let back: Message = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, message);
    }

    #[test]
    fn metadata_is_kept_verbatim() {
        let message = Message::system("hi").with_metadata(json!({ "anything": [1, 2] }));
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value["metadata"]["anything"][1], 2);
    }
}
