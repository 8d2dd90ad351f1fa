use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Handoff,
    Request,
    Response,
    Notification,
    Broadcast,
    StatusUpdate,
    TaskAssignment,
    TaskCompletion,
    Error,
    Heartbeat,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Handoff => "handoff",
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Notification => "notification",
            MessageType::Broadcast => "broadcast",
            MessageType::StatusUpdate => "status_update",
            MessageType::TaskAssignment => "task_assignment",
            MessageType::TaskCompletion => "task_completion",
            MessageType::Error => "error",
            MessageType::Heartbeat => "heartbeat",
        }
    }

    /// Replies never get replies of their own.
    pub fn is_reply(&self) -> bool {
        matches!(self, MessageType::Response | MessageType::Error)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Informational only; the bus delivers in FIFO order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl MessagePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessagePriority::Low => "low",
            MessagePriority::Normal => "normal",
            MessagePriority::High => "high",
            MessagePriority::Urgent => "urgent",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub message_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub message_type: MessageType,
    pub priority: MessagePriority,
    pub content: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub requires_response: bool,
    pub timestamp: DateTime<Utc>,
    /// Id of the message this one answers. Set on RESPONSE and ERROR replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
}

impl Message {
    pub fn new(from: &str, to: &str, message_type: MessageType, content: Value) -> Self {
        let mut msg = Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            from_agent: from.to_string(),
            to_agent: to.to_string(),
            message_type,
            priority: MessagePriority::Normal,
            content,
            metadata: Map::new(),
            requires_response: false,
            timestamp: Utc::now(),
            in_reply_to: None,
        };
        msg.mirror_priority();
        msg
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self.mirror_priority();
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata.extend(metadata);
        self.mirror_priority();
        self
    }

    pub fn requiring_response(mut self, requires: bool) -> Self {
        self.requires_response = requires;
        self
    }

    /// Builds a RESPONSE (or ERROR) addressed back to this message's sender.
    pub fn reply(&self, message_type: MessageType, content: Value, metadata: Map<String, Value>) -> Message {
        let mut reply = Message::new(&self.to_agent, &self.from_agent, message_type, content)
            .with_priority(self.priority)
            .with_metadata(metadata);
        reply.in_reply_to = Some(self.message_id.clone());
        reply
    }

    pub fn metadata_flag(&self, key: &str) -> bool {
        self.metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Plain text view of the content: the string itself, or a `response` field.
    pub fn content_text(&self) -> Option<&str> {
        match &self.content {
            Value::String(s) => Some(s),
            Value::Object(map) => map.get("response").and_then(Value::as_str),
            _ => None,
        }
    }

    fn mirror_priority(&mut self) {
        self.metadata
            .insert("priority".to_string(), Value::String(self.priority.as_str().to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_message_mirrors_priority() {
        let msg = Message::new("a", "b", MessageType::Request, json!("hi"))
            .with_priority(MessagePriority::High);
        assert_eq!(msg.metadata.get("priority"), Some(&json!("high")));
        assert!(!msg.requires_response);
        assert!(uuid::Uuid::parse_str(&msg.message_id).is_ok());
    }

    #[test]
    fn test_reply_is_correlated() {
        let msg = Message::new("a", "b", MessageType::Request, json!({"q": 1})).requiring_response(true);
        let mut meta = Map::new();
        meta.insert("error".to_string(), json!(true));
        let reply = msg.reply(MessageType::Error, json!("boom"), meta);
        assert_eq!(reply.from_agent, "b");
        assert_eq!(reply.to_agent, "a");
        assert_eq!(reply.in_reply_to.as_deref(), Some(msg.message_id.as_str()));
        assert!(reply.metadata_flag("error"));
        assert!(reply.message_type.is_reply());
    }

    #[test]
    fn test_content_text() {
        let msg = Message::new("a", "b", MessageType::Response, json!({"response": "done"}));
        assert_eq!(msg.content_text(), Some("done"));
        let msg = Message::new("a", "b", MessageType::Response, json!(42));
        assert_eq!(msg.content_text(), None);
    }

    #[test]
    fn test_serde_tags() {
        let msg = Message::new("a", "b", MessageType::StatusUpdate, Value::Null);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["message_type"], json!("status_update"));
        assert!(value.get("in_reply_to").is_none());
    }
}
