//! Conversation state
//!
//! A [`Conversation`] owns the message history and the turn state. The
//! orchestrator is its only writer; renderers read through
//! [`SharedConversation`] and should diff by message ID, since snapshots are
//! replaced in place.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::message::{Message, ToolCall};
use crate::runs::{Run, cluster};

/// Where a conversation is in its turn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    /// Idle; both the initial and the terminal state of a turn
    #[default]
    None,
    /// Waiting for the model's first snapshot
    Processing,
    /// Snapshots are arriving or tools are running
    Streaming,
    /// Generating suggested replies after a turn
    Suggesting,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::None => "none",
            ConversationState::Processing => "processing",
            ConversationState::Streaming => "streaming",
            ConversationState::Suggesting => "suggesting",
        }
    }

    pub fn is_idle(&self) -> bool {
        *self == ConversationState::None
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress notifications emitted while a conversation changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEvent {
    StateChanged { state: ConversationState },
    /// A message was appended (`inserted`) or replaced in place
    MessageUpserted { message: Message, inserted: bool },
    ToolStarted { call: ToolCall },
    ToolFinished {
        call_id: String,
        name: String,
        should_continue: bool,
    },
    SuggestionsUpdated { suggestions: Vec<String> },
    TitleUpdated { title: String },
}

/// One conversation: history plus everything shown around it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// System instructions, may contain template placeholders
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub history: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    /// Names of the tools this conversation may use
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(default)]
    pub state: ConversationState,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new("")
    }
}

impl Conversation {
    pub fn new(instructions: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: None,
            instructions: instructions.into(),
            history: Vec::new(),
            suggestions: Vec::new(),
            tools: Vec::new(),
            state: ConversationState::None,
            created: now,
            modified: now,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_tools<I>(mut self, tools: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    /// Replace the message with the same ID, or append
    ///
    /// Returns true when the message was appended.
    pub fn upsert_message(&mut self, message: Message) -> bool {
        self.upsert(message).1
    }

    /// [`upsert_message`](Self::upsert_message), also returning the stored message
    pub fn upsert(&mut self, message: Message) -> (&Message, bool) {
        self.modified = Utc::now();
        match self.history.iter().position(|m| m.id == message.id) {
            Some(index) => {
                self.history[index].apply_snapshot(message);
                (&self.history[index], false)
            }
            None => {
                let index = self.history.len();
                self.history.push(message);
                (&self.history[index], true)
            }
        }
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.history.iter().find(|m| m.id == id)
    }

    pub fn runs(&self) -> Vec<Run> {
        cluster(self.history.iter().cloned())
    }

    pub fn clear_suggestions(&mut self) {
        self.suggestions.clear();
    }

    /// History as `role:\ncontent\n\n` blocks, for single-purpose prompts
    pub fn plain_text_history(&self) -> String {
        plain_text_history(&self.history)
    }
}

/// Render messages as `role:\ncontent\n\n` blocks
pub fn plain_text_history(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}:\n{}\n\n", m.role, m.content))
        .collect()
}

/// A conversation readable while a turn is writing to it
#[derive(Debug, Clone, Default)]
pub struct SharedConversation {
    inner: Arc<RwLock<Conversation>>,
    follow_up: Arc<Mutex<Option<FollowUp>>>,
}

/// Background work a completed turn left running
#[derive(Debug)]
struct FollowUp {
    cancel: CancellationToken,
    /// Cancelled once the work has stopped
    done: CancellationToken,
}

impl SharedConversation {
    pub fn new(conversation: Conversation) -> Self {
        Self {
            inner: Arc::new(RwLock::new(conversation)),
            follow_up: Arc::default(),
        }
    }

    /// Record follow-up work for the latest turn
    ///
    /// The work must hold the returned guard until it stops writing.
    pub fn track_follow_up(&self, cancel: CancellationToken) -> DropGuard {
        let done = CancellationToken::new();
        let guard = done.clone().drop_guard();
        let previous = self.follow_up.lock().replace(FollowUp { cancel, done });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        guard
    }

    /// Cancel follow-up work from an earlier turn and wait until it has stopped
    pub async fn settle_follow_up(&self) {
        let previous = self.follow_up.lock().take();
        if let Some(previous) = previous {
            previous.cancel.cancel();
            previous.done.cancelled().await;
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Conversation> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Conversation> {
        self.inner.write()
    }

    /// A point-in-time copy
    pub fn snapshot(&self) -> Conversation {
        self.inner.read().clone()
    }

    pub fn id(&self) -> String {
        self.inner.read().id.clone()
    }

    pub fn state(&self) -> ConversationState {
        self.inner.read().state
    }

    pub fn set_state(&self, state: ConversationState) {
        self.inner.write().state = state;
    }

    pub fn history(&self) -> Vec<Message> {
        self.inner.read().history.clone()
    }

    pub fn runs(&self) -> Vec<Run> {
        self.inner.read().runs()
    }

    pub fn suggestions(&self) -> Vec<String> {
        self.inner.read().suggestions.clone()
    }

    pub fn title(&self) -> Option<String> {
        self.inner.read().title.clone()
    }

    pub fn upsert_message(&self, message: Message) -> bool {
        self.inner.write().upsert_message(message)
    }
}

impl From<Conversation> for SharedConversation {
    fn from(conversation: Conversation) -> Self {
        Self::new(conversation)
    }
}
