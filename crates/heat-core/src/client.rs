//! Streaming chat client seam
//!
//! The orchestrator never talks to a model service directly. It opens a
//! [`ChatRequest`] through a [`StreamingChatClient`] and consumes the returned
//! stream of message snapshots. Every snapshot is a full, id-addressable copy
//! of the message so far.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::message::Message;
use crate::tools::ToolDefinition;

/// Stream of snapshots for one request
pub type MessageStream = BoxStream<'static, Result<Message, StreamError>>;

/// Everything a model needs to produce the next message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// System instructions, already rendered
    pub system: String,
    pub history: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    /// Name of a tool the model must call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

impl ChatRequest {
    pub fn new(system: impl Into<String>, history: Vec<Message>) -> Self {
        Self {
            system: system.into(),
            history,
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, tool_choice: Option<String>) -> Self {
        self.tool_choice = tool_choice;
        self
    }
}

/// A model service that answers with a stream of message snapshots
#[async_trait]
pub trait StreamingChatClient: Send + Sync {
    /// Open a request; the stream ends when the model is done or fails
    async fn stream(&self, request: ChatRequest) -> Result<MessageStream, StreamError>;
}

struct Script {
    items: Vec<Result<Message, StreamError>>,
    /// Never end after the last item
    hang: bool,
}

/// Client that replays canned responses, one per request
///
/// Every request is recorded so callers can inspect what was sent. Once the
/// script runs out, further requests fail with [`StreamError::Closed`].
#[derive(Default)]
pub struct ScriptedChatClient {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChatClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response made of these snapshots
    pub fn push_response(&self, snapshots: Vec<Message>) -> &Self {
        self.push_script(snapshots.into_iter().map(Ok).collect())
    }

    /// Queue a response with arbitrary items, errors included
    pub fn push_script(&self, items: Vec<Result<Message, StreamError>>) -> &Self {
        self.scripts.lock().push_back(Script { items, hang: false });
        self
    }

    /// Queue a response that stays open after its snapshots
    pub fn push_hanging(&self, snapshots: Vec<Message>) -> &Self {
        self.scripts.lock().push_back(Script {
            items: snapshots.into_iter().map(Ok).collect(),
            hang: true,
        });
        self
    }

    /// Queue an assistant reply streamed word by word under one message ID
    pub fn push_streamed_text(&self, text: &str) -> &Self {
        self.push_response(streamed_snapshots(text))
    }

    /// Queue a request that fails before any snapshot arrives
    pub fn push_error(&self, error: StreamError) -> &Self {
        self.push_script(vec![Err(error)])
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Responses not yet consumed
    pub fn remaining(&self) -> usize {
        self.scripts.lock().len()
    }
}

#[async_trait]
impl StreamingChatClient for ScriptedChatClient {
    async fn stream(&self, request: ChatRequest) -> Result<MessageStream, StreamError> {
        self.requests.lock().push(request);

        let script = self
            .scripts
            .lock()
            .pop_front()
            .ok_or_else(|| StreamError::Closed("no scripted response left".to_string()))?;

        let items = stream::iter(script.items);
        if script.hang {
            Ok(items.chain(stream::pending()).boxed())
        } else {
            Ok(items.boxed())
        }
    }
}

/// Progressive snapshots of an assistant message, the last one marked done
pub fn streamed_snapshots(text: &str) -> Vec<Message> {
    let id = uuid::Uuid::new_v4().to_string();
    let mut content = String::new();
    let mut snapshots: Vec<Message> = text
        .split_inclusive(' ')
        .map(|word| {
            content.push_str(word);
            Message::assistant(content.clone()).with_id(id.clone()).with_done(false)
        })
        .collect();

    match snapshots.last_mut() {
        Some(last) => last.done = true,
        None => snapshots.push(Message::assistant("").with_id(id)),
    }
    snapshots
}
