//! Tool handlers and the registry that resolves them
//!
//! The model asks for tools by name. A handler answers a [`ToolCall`] with the
//! messages to append to history and whether the model should get another
//! turn to read them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::ToolError;
use crate::message::{LABEL_KEY, Message, ToolCall};

/// Tool definition for LLM consumption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema for the arguments
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({ "type": "object", "properties": {} }),
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// What a handler produced for one call
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    /// Messages to append, normally a single tool message
    pub messages: Vec<Message>,
    /// Whether the model should be called again with these results
    pub should_continue: bool,
}

impl ToolResponse {
    pub fn new(messages: Vec<Message>, should_continue: bool) -> Self {
        Self {
            messages,
            should_continue,
        }
    }

    /// A single tool message answering `call`
    pub fn reply(call: &ToolCall, content: impl Into<String>, should_continue: bool) -> Self {
        Self::new(vec![Message::tool_response(call, content)], should_continue)
    }

    /// The answer synthesized when no handler is registered for `call`
    pub fn unknown_tool(call: &ToolCall) -> Self {
        let message = Message::tool_response(call, "Unknown tool.").with_metadata(LABEL_KEY, "Unknown tool");
        Self::new(vec![message], false)
    }
}

/// Handles calls to one tool
///
/// Failures the model should see belong in the returned messages. An `Err`
/// aborts the whole turn.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn handle(&self, call: &ToolCall) -> Result<ToolResponse, ToolError>;

    fn name(&self) -> String {
        self.definition().name
    }
}

/// Registry of available tool handlers
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    aliases: HashMap<String, String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its definition's name
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        self.tools.insert(handler.name(), handler);
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.register(handler);
        self
    }

    /// Resolve `alias` to the handler registered as `target`
    ///
    /// Used for names older conversations still request.
    pub fn register_alias(&mut self, alias: impl Into<String>, target: impl Into<String>) {
        self.aliases.insert(alias.into(), target.into());
    }

    /// Get a handler by name or alias
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools
            .get(name)
            .or_else(|| self.aliases.get(name).and_then(|target| self.tools.get(target)))
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Resolve a handler or report the dispatch failure
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ToolHandler>, ToolError> {
        self.get(name).ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    /// All definitions, sorted by name
    pub fn list(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<_> = self.tools.values().map(|t| t.definition()).collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Definitions for a conversation's tool allow-list, in the order given
    pub fn definitions_for<I>(&self, names: I) -> Vec<ToolDefinition>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        names
            .into_iter()
            .filter_map(|name| {
                let name = name.as_ref();
                let handler = self.get(name);
                if handler.is_none() {
                    warn!(tool = name, "Skipping unregistered tool");
                }
                handler.map(|h| h.definition())
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// A tool that answers every call with the same text
#[derive(Debug, Clone)]
pub struct StaticTool {
    definition: ToolDefinition,
    reply: String,
    should_continue: bool,
    label: Option<String>,
}

impl StaticTool {
    pub fn new(name: impl Into<String>, reply: impl Into<String>, should_continue: bool) -> Self {
        let name = name.into();
        Self {
            definition: ToolDefinition::new(name.clone(), format!("Returns a canned {name} result")),
            reply: reply.into(),
            should_continue,
            label: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.definition.description = description.into();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

#[async_trait]
impl ToolHandler for StaticTool {
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    async fn handle(&self, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        let mut message = Message::tool_response(call, self.reply.clone());
        if let Some(label) = &self.label {
            message.metadata.insert(LABEL_KEY.to_string(), label.clone());
        }
        Ok(ToolResponse::new(vec![message], self.should_continue))
    }
}
