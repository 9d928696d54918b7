//! Conversation data model
//!
//! A [`Message`] is one turn-unit of conversation. Its `id` is stable across
//! every streamed snapshot of the same message, so consumers key off the id
//! rather than the position in history.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ToolError;

/// Metadata key holding a short human-readable summary of a tool message
pub const LABEL_KEY: &str = "label";

/// Metadata key recording which agent produced a message
pub const AGENT_ID_KEY: &str = "agent_id";

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlates the eventual tool response
    pub id: String,
    /// Name of the tool to run
    pub name: String,
    /// Arguments as the model produced them (usually JSON)
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Decode the argument blob into a typed structure
    pub fn parse_arguments<T: DeserializeOwned>(&self) -> Result<T, ToolError> {
        serde_json::from_str(&self.arguments)
            .map_err(|e| ToolError::InvalidArguments(format!("{}: {}", self.name, e)))
    }
}

/// Kind of binary payload carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    File,
}

/// Opaque binary payload attached to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn image(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind: AttachmentKind::Image,
            mime_type: mime_type.into(),
            data,
        }
    }

    pub fn file(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind: AttachmentKind::File,
            mime_type: mime_type.into(),
            data,
        }
    }
}

/// One message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique ID, stable across streamed snapshots
    pub id: String,
    /// Groups the messages produced by one logical turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub role: Role,
    /// Text body; rewritten wholesale by each snapshot
    #[serde(default)]
    pub content: String,
    /// Tool invocations requested by an assistant message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Present on tool messages, correlating to the originating call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name on tool messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// The model's own completion flag for this snapshot
    #[serde(default = "default_done")]
    pub done: bool,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

fn default_done() -> bool {
    true
}

impl Message {
    /// Create a new message with a fresh ID
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: None,
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            attachments: Vec::new(),
            metadata: BTreeMap::new(),
            done: true,
            created: now,
            modified: now,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a tool message answering `call`
    pub fn tool_response(call: &ToolCall, content: impl Into<String>) -> Self {
        let mut message = Self::new(Role::Tool, content);
        message.tool_call_id = Some(call.id.clone());
        message.name = Some(call.name.clone());
        message
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_done(mut self, done: bool) -> Self {
        self.done = done;
        self
    }

    /// Whether this message asks for at least one tool invocation
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// The run this message belongs to: its run ID, or its own ID when absent
    pub fn run_key(&self) -> &str {
        match self.run_id.as_deref() {
            Some(run_id) if !run_id.is_empty() => run_id,
            _ => &self.id,
        }
    }

    /// Human-readable tool summary, if any
    pub fn label(&self) -> Option<&str> {
        self.metadata.get(LABEL_KEY).map(String::as_str)
    }

    /// Replace this message's body with a newer snapshot of the same message
    ///
    /// Identity and creation time are preserved; everything else follows the
    /// snapshot. Metadata already present is kept unless the snapshot
    /// overrides the key.
    pub fn apply_snapshot(&mut self, snapshot: Message) {
        let Message {
            run_id,
            role,
            content,
            tool_calls,
            tool_call_id,
            name,
            attachments,
            metadata,
            done,
            ..
        } = snapshot;

        if run_id.is_some() {
            self.run_id = run_id;
        }
        self.role = role;
        self.content = content;
        self.tool_calls = tool_calls;
        self.tool_call_id = tool_call_id;
        self.name = name;
        self.attachments = attachments;
        self.metadata.extend(metadata);
        self.done = done;
        self.modified = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_response_correlates_call() {
        let call = ToolCall::new("call_1", "search_web", r#"{"query":"rust"}"#);
        let message = Message::tool_response(&call, "results");

        assert_eq!(message.role, Role::Tool);
        assert_eq!(message.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(message.name.as_deref(), Some("search_web"));
    }

    #[test]
    fn test_run_key_falls_back_to_id() {
        let message = Message::user("hi").with_id("m1");
        assert_eq!(message.run_key(), "m1");

        let message = message.with_run_id("");
        assert_eq!(message.run_key(), "m1");

        let message = message.with_run_id("r1");
        assert_eq!(message.run_key(), "r1");
    }

    #[test]
    fn test_apply_snapshot_preserves_identity() {
        let mut message = Message::assistant("Hel")
            .with_id("a1")
            .with_done(false)
            .with_metadata(AGENT_ID_KEY, "agent-1");
        let created = message.created;

        let snapshot = Message::assistant("Hello").with_id("a1");
        message.apply_snapshot(snapshot);

        assert_eq!(message.id, "a1");
        assert_eq!(message.content, "Hello");
        assert!(message.done);
        assert_eq!(message.created, created);
        assert_eq!(message.metadata.get(AGENT_ID_KEY).map(String::as_str), Some("agent-1"));
    }

    #[test]
    fn test_parse_arguments() {
        #[derive(Debug, Deserialize)]
        struct Args {
            query: String,
        }

        let call = ToolCall::new("1", "search_web", r#"{"query":"weather"}"#);
        let args: Args = call.parse_arguments().unwrap();
        assert_eq!(args.query, "weather");

        let bad = ToolCall::new("2", "search_web", "not json");
        let err = bad.parse_arguments::<Args>().unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn test_message_serde_defaults() {
        let json = r#"{
            "id": "m1",
            "role": "assistant",
            "content": "hello",
            "created": "2024-01-01T00:00:00Z",
            "modified": "2024-01-01T00:00:00Z"
        }"#;
        let message: Message = serde_json::from_str(json).unwrap();
        assert!(message.done);
        assert!(message.run_id.is_none());
        assert!(message.tool_calls.is_empty());
    }
}
