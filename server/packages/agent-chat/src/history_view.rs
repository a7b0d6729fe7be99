//! Tree-shaped summary of the history for side panels and the `history --tree`
//! command.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::message::{Message, MessageRole};

const LABEL_MAX_CHARS: usize = 50;
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HistoryNodeKind {
    Session,
    Message,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HistoryNode {
    pub kind: HistoryNodeKind,
    pub label: String,
    pub description: String,
    pub tooltip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<HistoryNode>,
}

/// One session node holding every message, or nothing for an empty history.
pub fn build_tree(history: &[Message]) -> Vec<HistoryNode> {
    let (Some(first), Some(last)) = (history.first(), history.last()) else {
        return Vec::new();
    };
    let count = history.len();
    vec![HistoryNode {
        kind: HistoryNodeKind::Session,
        label: format!("Session {}", format_time(first.timestamp())),
        description: format!("{count} messages"),
        tooltip: format!(
            "Started: {}\nLast message: {}\nMessages: {count}",
            format_time(first.timestamp()),
            format_time(last.timestamp())
        ),
        icon: None,
        message_id: None,
        children: history.iter().map(message_node).collect(),
    }]
}

fn message_node(message: &Message) -> HistoryNode {
    let role = message.role().as_str();
    HistoryNode {
        kind: HistoryNodeKind::Message,
        label: truncate(message.content()),
        description: role.to_string(),
        tooltip: format!(
            "{}\n{}\n\n{}",
            role.to_uppercase(),
            format_time(message.timestamp()),
            message.content()
        ),
        icon: icon_for(message.role()).map(str::to_string),
        message_id: Some(message.id().to_string()),
        children: Vec::new(),
    }
}

fn icon_for(role: MessageRole) -> Option<&'static str> {
    match role {
        MessageRole::User => Some("person"),
        MessageRole::Agent => Some("robot"),
        MessageRole::System => Some("gear"),
        MessageRole::Error => Some("error"),
        _ => None,
    }
}

fn truncate(content: &str) -> String {
    match content.char_indices().nth(LABEL_MAX_CHARS) {
        Some((end, _)) => format!("{}...", &content[..end]),
        None => content.to_string(),
    }
}

fn format_time(timestamp: DateTime<Utc>) -> String {
    timestamp.format(TIME_FORMAT).to_string()
}
