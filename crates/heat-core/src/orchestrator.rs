//! Conversation orchestrator - drives one user turn to completion
//!
//! A turn:
//! - appends the user message and clears stale suggestions
//! - streams the model's reply, replacing snapshots in place by message ID
//! - dispatches requested tools in call order and appends their messages
//! - asks the model again while any tool wants the results read
//! - then, in the background, refreshes suggested replies and the title
//!
//! Every message of the turn carries the same run ID, so the whole turn
//! clusters into one [`Run`](crate::runs::Run).
//!
//! Cancellation is cooperative: the turn stops at the next snapshot or tool
//! await and keeps whatever history it already wrote.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ChatRequest, StreamingChatClient};
use crate::config::OrchestratorConfig;
use crate::conversation::{ConversationEvent, ConversationState, SharedConversation};
use crate::error::{Error, Result, ToolError};
use crate::message::{AGENT_ID_KEY, Attachment, Message, ToolCall};
use crate::parser::ContentTree;
use crate::prompts::{SUGGESTIONS_INSTRUCTIONS, TITLE_INSTRUCTIONS};
use crate::template::{self, DATETIME_KEY, HISTORY_KEY, TemplateContext};
use crate::tools::{ToolHandler, ToolRegistry, ToolResponse};

const SUGGESTED_REPLIES_TAG: &str = "suggested_replies";
const TITLE_TAG: &str = "title";

/// What the user sent to start a turn
#[derive(Debug, Clone, Default)]
pub struct UserInput {
    /// Prompt text; may contain template placeholders
    pub prompt: String,
    pub attachments: Vec<Attachment>,
    /// Extra template values, often memories
    pub context: TemplateContext,
    /// Tool the model must call in its first response
    pub tool_choice: Option<String>,
    /// Recorded on every assistant snapshot of the turn
    pub agent_id: Option<String>,
}

impl UserInput {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_tool_choice(mut self, tool: impl Into<String>) -> Self {
        self.tool_choice = Some(tool.into());
        self
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

impl From<&str> for UserInput {
    fn from(prompt: &str) -> Self {
        Self::new(prompt)
    }
}

/// How a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model answered without asking for more tool rounds
    Completed,
    /// The caller cancelled; history keeps whatever arrived
    Cancelled,
    /// The prompt was empty, nothing happened
    Ignored,
    /// Tools kept asking to continue past `max_tool_rounds`
    RoundLimitReached,
}

/// Result of a finished turn
#[derive(Debug)]
pub struct TurnReport {
    pub outcome: TurnOutcome,
    /// Run ID stamped on the turn's messages
    pub run_id: Option<String>,
    /// Requests sent to the model
    pub rounds: usize,
    /// Background suggestion and title generation, if started
    pub follow_up: Option<JoinHandle<()>>,
}

impl TurnReport {
    fn new(outcome: TurnOutcome, run_id: Option<String>, rounds: usize) -> Self {
        Self {
            outcome,
            run_id,
            rounds,
            follow_up: None,
        }
    }

    /// Wait for the follow-up task, if any
    pub async fn wait_for_follow_up(&mut self) {
        if let Some(handle) = self.follow_up.take() {
            if let Err(e) = handle.await {
                warn!("Follow-up task failed: {}", e);
            }
        }
    }
}

/// A turn running in the background
#[derive(Debug)]
pub struct TurnHandle {
    cancel: CancellationToken,
    handle: JoinHandle<Result<TurnReport>>,
}

impl TurnHandle {
    /// Stop the turn at its next suspension point
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) -> Result<TurnReport> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::Task(e.to_string())),
        }
    }
}

enum Streamed {
    /// The stream ended; holds the last stored snapshot
    Finished(Option<Message>),
    Cancelled,
}

/// Drives turns of a conversation against a model and a tool registry
#[derive(Clone)]
pub struct ConversationOrchestrator {
    client: Arc<dyn StreamingChatClient>,
    tools: Arc<ToolRegistry>,
    config: OrchestratorConfig,
    events: Option<mpsc::UnboundedSender<ConversationEvent>>,
}

impl ConversationOrchestrator {
    pub fn new(client: Arc<dyn StreamingChatClient>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            client,
            tools,
            config: OrchestratorConfig::default(),
            events: None,
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Emit progress events on `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ConversationEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Run a turn as a background task
    pub fn spawn_turn(&self, conversation: &SharedConversation, input: UserInput) -> TurnHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let this = self.clone();
        let conversation = conversation.clone();
        let handle = tokio::spawn(async move { this.run_turn(&conversation, input, token).await });
        TurnHandle { cancel, handle }
    }

    /// Run one user turn until the model stops asking for tools
    ///
    /// Errors leave the conversation in [`ConversationState::None`].
    pub async fn run_turn(
        &self,
        conversation: &SharedConversation,
        input: UserInput,
        cancel: CancellationToken,
    ) -> Result<TurnReport> {
        if input.prompt.trim().is_empty() {
            debug!("Ignoring empty prompt");
            return Ok(TurnReport::new(TurnOutcome::Ignored, None, 0));
        }

        // Suggestions and titles from the previous turn must not land in this one
        conversation.settle_follow_up().await;

        let run_id = uuid::Uuid::new_v4().to_string();
        info!(conversation = %conversation.id(), run = %run_id, "Starting turn");

        let mut context = input.context;
        context
            .entry(DATETIME_KEY.to_string())
            .or_insert_with(template::current_datetime);

        let mut user_message = Message::user(template::render(&input.prompt, &context)).with_run_id(run_id.clone());
        user_message.attachments = input.attachments;

        let (instructions, tool_names) = {
            let mut conv = conversation.write();
            conv.clear_suggestions();
            (conv.instructions.clone(), conv.tools.clone())
        };
        self.emit(ConversationEvent::SuggestionsUpdated { suggestions: Vec::new() });
        self.upsert(conversation, user_message);
        self.set_state(conversation, ConversationState::Processing);

        let system = template::render(&instructions, &context);
        let tools = self.tools.definitions_for(&tool_names);
        let mut tool_choice = input.tool_choice;
        let mut rounds = 0;

        let outcome = loop {
            rounds += 1;
            let request = ChatRequest::new(system.clone(), conversation.history())
                .with_tools(tools.clone())
                .with_tool_choice(tool_choice.take());
            debug!(run = %run_id, round = rounds, messages = request.history.len(), "Sending request");

            let streamed = self
                .stream_into(conversation, request, &run_id, input.agent_id.as_deref(), &cancel)
                .await;
            let last = match streamed {
                Ok(Streamed::Finished(last)) => last,
                Ok(Streamed::Cancelled) => break TurnOutcome::Cancelled,
                Err(e) => return Err(self.fail(conversation, &run_id, e)),
            };

            let calls = last.map(|m| m.tool_calls).unwrap_or_default();
            if calls.is_empty() {
                break TurnOutcome::Completed;
            }

            let should_continue = match self.dispatch_tools(conversation, calls, &run_id, &cancel).await {
                Ok(Some(should_continue)) => should_continue,
                Ok(None) => break TurnOutcome::Cancelled,
                Err(e) => return Err(self.fail(conversation, &run_id, e)),
            };
            if !should_continue {
                break TurnOutcome::Completed;
            }
            if rounds > self.config.max_tool_rounds {
                warn!(run = %run_id, rounds, "Tool round limit reached");
                break TurnOutcome::RoundLimitReached;
            }

            self.set_state(conversation, ConversationState::Processing);
        };

        self.set_state(conversation, ConversationState::None);
        info!(run = %run_id, ?outcome, rounds, "Turn finished");

        let mut report = TurnReport::new(outcome, Some(run_id), rounds);
        if outcome == TurnOutcome::Completed {
            report.follow_up = self.spawn_follow_ups(conversation, cancel.child_token());
        }
        Ok(report)
    }

    /// Refresh the suggested replies from the current history
    ///
    /// State is `suggesting` while this runs and `none` afterwards, on
    /// failure too. Nothing is written when `cancel` has already fired.
    pub async fn generate_suggestions(
        &self,
        conversation: &SharedConversation,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        if cancel.is_cancelled() {
            return Ok(conversation.suggestions());
        }

        let prompt = follow_up_prompt(conversation, SUGGESTIONS_INSTRUCTIONS);
        let max = self.config.max_suggestions;

        self.set_state(conversation, ConversationState::Suggesting);
        let result = self
            .consume_follow_up(prompt, cancel, |content| {
                let Some(suggestions) = parse_suggestions(content, max) else {
                    return;
                };
                conversation.write().suggestions = suggestions.clone();
                self.emit(ConversationEvent::SuggestionsUpdated { suggestions });
            })
            .await;
        self.set_state(conversation, ConversationState::None);

        result?;
        Ok(conversation.suggestions())
    }

    /// Name the conversation if it has no title yet
    pub async fn generate_title(
        &self,
        conversation: &SharedConversation,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        if conversation.title().is_some() || cancel.is_cancelled() {
            return Ok(conversation.title());
        }

        let prompt = follow_up_prompt(conversation, TITLE_INSTRUCTIONS);
        self.consume_follow_up(prompt, cancel, |content| {
            let tree = ContentTree::parse_lossy(content, [TITLE_TAG]);
            let Some(tag) = tree.first_tag(TITLE_TAG) else {
                return;
            };
            let title = tag.content.trim();
            if title.is_empty() {
                return;
            }

            let changed = {
                let mut conv = conversation.write();
                let changed = conv.title.as_deref() != Some(title);
                conv.title = Some(title.to_string());
                changed
            };
            if changed {
                self.emit(ConversationEvent::TitleUpdated {
                    title: title.to_string(),
                });
            }
        })
        .await?;

        Ok(conversation.title())
    }

    /// Consume one response, storing every snapshot
    async fn stream_into(
        &self,
        conversation: &SharedConversation,
        request: ChatRequest,
        run_id: &str,
        agent_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Streamed> {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Streamed::Cancelled),
            opened = self.client.stream(request) => opened?,
        };

        let mut last = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Streamed::Cancelled),
                next = stream.next() => next,
            };
            let Some(snapshot) = next else {
                break;
            };

            let mut snapshot = snapshot?;
            snapshot.run_id = Some(run_id.to_string());
            if let Some(agent_id) = agent_id {
                snapshot.metadata.insert(AGENT_ID_KEY.to_string(), agent_id.to_string());
            }

            last = Some(self.upsert(conversation, snapshot));
            self.set_state(conversation, ConversationState::Streaming);
        }

        match &last {
            Some(message) if !message.done => {
                debug!(message = %message.id, "Stream ended before the message was marked done");
            }
            None => debug!(run = %run_id, "Stream ended without a snapshot"),
            _ => {}
        }
        Ok(Streamed::Finished(last))
    }

    /// Run the requested tools in call order
    ///
    /// Returns whether any handler asked to continue, or `None` when cancelled.
    async fn dispatch_tools(
        &self,
        conversation: &SharedConversation,
        calls: Vec<ToolCall>,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<bool>> {
        let mut should_continue = false;

        for call in calls {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            debug!(run = %run_id, tool = %call.name, call_id = %call.id, "Dispatching tool");
            self.emit(ConversationEvent::ToolStarted { call: call.clone() });

            let response = match self.tools.resolve(&call.name) {
                Ok(handler) => match self.run_handler(handler, &call, cancel).await? {
                    Some(response) => response,
                    None => return Ok(None),
                },
                Err(e) => {
                    warn!(run = %run_id, error = %e, "Tool dispatch failed");
                    ToolResponse::unknown_tool(&call)
                }
            };

            for mut message in response.messages {
                message.run_id = Some(run_id.to_string());
                self.upsert(conversation, message);
            }
            self.emit(ConversationEvent::ToolFinished {
                call_id: call.id.clone(),
                name: call.name.clone(),
                should_continue: response.should_continue,
            });
            should_continue |= response.should_continue;
        }

        Ok(Some(should_continue))
    }

    async fn run_handler(
        &self,
        handler: Arc<dyn ToolHandler>,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<Option<ToolResponse>> {
        let task_call = call.clone();
        // Detached so that cancelling the turn does not abort the handler
        let task = tokio::spawn(async move { handler.handle(&task_call).await });

        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            joined = task => joined,
        };

        match joined {
            Ok(Ok(response)) => Ok(Some(response)),
            Ok(Err(source)) => Err(Error::ToolHandler {
                tool: call.name.clone(),
                source,
            }),
            Err(e) => Err(Error::ToolHandler {
                tool: call.name.clone(),
                source: ToolError::ExecutionFailed(e.to_string()),
            }),
        }
    }

    fn spawn_follow_ups(&self, conversation: &SharedConversation, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let suggestions = self.config.generate_suggestions;
        let title = self.config.generate_title && conversation.title().is_none();
        if !suggestions && !title {
            return None;
        }

        let done = conversation.track_follow_up(cancel.clone());
        let this = self.clone();
        let conversation = conversation.clone();
        Some(tokio::spawn(async move {
            let _done = done;
            let suggest = async {
                if !suggestions {
                    return;
                }
                if let Err(e) = this.generate_suggestions(&conversation, &cancel).await {
                    warn!("Suggestion generation failed: {}", e);
                }
            };
            let name = async {
                if !title {
                    return;
                }
                if let Err(e) = this.generate_title(&conversation, &cancel).await {
                    warn!("Title generation failed: {}", e);
                }
            };
            tokio::join!(suggest, name);
        }))
    }

    /// Stream a tool-less request whose only input is `prompt` as the system
    /// prompt, handing each snapshot's text to `on_content`
    async fn consume_follow_up<F>(&self, prompt: String, cancel: &CancellationToken, mut on_content: F) -> Result<()>
    where
        F: FnMut(&str) + Send,
    {
        let request = ChatRequest::new(prompt, Vec::new());
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            opened = self.client.stream(request) => opened?,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = stream.next() => next,
            };
            match next {
                Some(snapshot) => on_content(&snapshot?.content),
                None => return Ok(()),
            }
        }
    }

    fn upsert(&self, conversation: &SharedConversation, message: Message) -> Message {
        let (stored, inserted) = {
            let mut conv = conversation.write();
            let (stored, inserted) = conv.upsert(message);
            (stored.clone(), inserted)
        };
        self.emit(ConversationEvent::MessageUpserted {
            message: stored.clone(),
            inserted,
        });
        stored
    }

    fn set_state(&self, conversation: &SharedConversation, state: ConversationState) {
        let previous = std::mem::replace(&mut conversation.write().state, state);
        if previous != state {
            debug!(from = %previous, to = %state, "Conversation state changed");
            self.emit(ConversationEvent::StateChanged { state });
        }
    }

    /// Reset to `none` before surfacing a turn error
    fn fail(&self, conversation: &SharedConversation, run_id: &str, error: Error) -> Error {
        self.set_state(conversation, ConversationState::None);
        warn!(run = %run_id, error = %error, "Turn failed");
        error
    }

    fn emit(&self, event: ConversationEvent) {
        if let Some(events) = &self.events {
            // Nobody listening is fine
            let _ = events.send(event);
        }
    }
}

fn follow_up_prompt(conversation: &SharedConversation, instructions: &str) -> String {
    let mut context = TemplateContext::new();
    context.insert(HISTORY_KEY.to_string(), conversation.read().plain_text_history());
    template::render(instructions, &context)
}

/// Suggested replies from one snapshot, or `None` while the tag is absent
fn parse_suggestions(content: &str, max: usize) -> Option<Vec<String>> {
    let tree = ContentTree::parse_lossy(content, [SUGGESTED_REPLIES_TAG]);
    let tag = tree.first_tag(SUGGESTED_REPLIES_TAG)?;
    Some(
        tag.content
            .trim()
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .take(max)
            .map(String::from)
            .collect(),
    )
}
