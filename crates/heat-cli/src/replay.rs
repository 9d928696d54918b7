//! Scripted conversation replay
//!
//! A replay script is a JSON file describing a conversation, the tools it may
//! call and the replies the model will give, in request order:
//!
//! ```json
//! {
//!   "instructions": "You are a weather bot. Today is {{DATETIME}}.",
//!   "tools": [{ "name": "search_web", "reply": "sunny, 21C", "should_continue": true }],
//!   "turns": [{ "prompt": "Weather in {{CITY}}?", "context": { "CITY": "Oslo" } }],
//!   "replies": [
//!     { "tool_calls": [{ "id": "c1", "name": "search_web", "arguments": "{}" }] },
//!     { "content": "<thinking>Easy.</thinking>It is sunny in Oslo.", "streamed": true }
//!   ]
//! }
//! ```
//!
//! Follow-up requests for suggestions and the title consume replies too when
//! they are enabled.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use heat_core::{
    CancellationToken, Conversation, ConversationEvent, ConversationOrchestrator, Message,
    OrchestratorConfig, ScriptedChatClient, SharedConversation, StaticTool, StreamError, ToolCall,
    ToolRegistry, TurnOutcome, UserInput,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct ReplayScript {
    #[serde(default)]
    pub instructions: String,
    pub title: Option<String>,
    #[serde(default)]
    pub tools: Vec<ScriptedTool>,
    /// Legacy tool names mapped to registered ones
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    /// Overrides the loaded orchestrator settings
    pub orchestrator: Option<OrchestratorConfig>,
    pub turns: Vec<ScriptedTurn>,
    #[serde(default)]
    pub replies: Vec<ScriptedReply>,
}

#[derive(Debug, Deserialize)]
pub struct ScriptedTool {
    pub name: String,
    pub reply: String,
    #[serde(default)]
    pub should_continue: bool,
    pub label: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScriptedTurn {
    pub prompt: String,
    #[serde(default)]
    pub context: HashMap<String, String>,
    pub tool_choice: Option<String>,
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScriptedReply {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Deliver the content word by word
    #[serde(default)]
    pub streamed: bool,
    /// Fail the request with this service error instead of replying
    pub error: Option<String>,
}

/// What a replay produced
pub struct ReplayOutcome {
    pub conversation: Conversation,
    /// One entry per scripted turn
    pub turns: Vec<heat_core::Result<TurnOutcome>>,
    /// Replies the script provided but no request consumed
    pub unused_replies: usize,
}

impl ReplayScript {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay script {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid replay script {}", path.display()))
    }

    fn registry(&self) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for tool in &self.tools {
            let mut handler = StaticTool::new(&tool.name, &tool.reply, tool.should_continue);
            if let Some(label) = &tool.label {
                handler = handler.with_label(label);
            }
            if let Some(description) = &tool.description {
                handler = handler.with_description(description);
            }
            registry.register(Arc::new(handler));
        }
        for (alias, target) in &self.aliases {
            registry.register_alias(alias, target);
        }
        registry
    }

    fn client(&self) -> ScriptedChatClient {
        let client = ScriptedChatClient::new();
        for reply in &self.replies {
            if let Some(error) = &reply.error {
                client.push_error(StreamError::Service(error.clone()));
            } else if reply.streamed && reply.tool_calls.is_empty() {
                client.push_streamed_text(&reply.content);
            } else {
                client.push_response(vec![
                    Message::assistant(reply.content.as_str()).with_tool_calls(reply.tool_calls.clone()),
                ]);
            }
        }
        client
    }

    fn conversation(&self) -> Conversation {
        let mut conversation =
            Conversation::new(self.instructions.as_str()).with_tools(self.tools.iter().map(|t| t.name.clone()));
        conversation.title = self.title.clone();
        conversation
    }
}

impl From<&ScriptedTurn> for UserInput {
    fn from(turn: &ScriptedTurn) -> Self {
        UserInput {
            prompt: turn.prompt.clone(),
            attachments: Vec::new(),
            context: turn.context.clone(),
            tool_choice: turn.tool_choice.clone(),
            agent_id: turn.agent_id.clone(),
        }
    }
}

/// Run every scripted turn in order, waiting for follow-ups between turns
///
/// A failed turn is recorded and the replay moves on to the next one.
pub async fn replay(
    script: &ReplayScript,
    config: OrchestratorConfig,
    events: Option<mpsc::UnboundedSender<ConversationEvent>>,
) -> Result<ReplayOutcome> {
    let client = Arc::new(script.client());
    let config = script.orchestrator.clone().unwrap_or(config);
    let mut orchestrator = ConversationOrchestrator::new(client.clone(), Arc::new(script.registry())).with_config(config);
    if let Some(events) = events {
        orchestrator = orchestrator.with_events(events);
    }

    let conversation = SharedConversation::new(script.conversation());
    let mut turns = Vec::with_capacity(script.turns.len());

    for (index, turn) in script.turns.iter().enumerate() {
        info!(turn = index + 1, "Replaying turn");
        match orchestrator
            .run_turn(&conversation, turn.into(), CancellationToken::new())
            .await
        {
            Ok(mut report) => {
                report.wait_for_follow_up().await;
                turns.push(Ok(report.outcome));
            }
            Err(e) => {
                warn!(turn = index + 1, error = %e, "Replayed turn failed");
                turns.push(Err(e));
            }
        }
    }

    Ok(ReplayOutcome {
        conversation: conversation.snapshot(),
        turns,
        unused_replies: client.remaining(),
    })
}
