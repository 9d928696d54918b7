//! Conversation orchestrator integration tests
//!
//! Drives whole turns against a scripted model and canned tools.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use heat_core::{
    CancellationToken, Conversation, ConversationEvent, ConversationOrchestrator, ConversationState,
    Error, Message, OrchestratorConfig, Role, ScriptedChatClient, SharedConversation, StaticTool,
    StreamError, ToolCall, ToolDefinition, ToolError, ToolHandler, ToolRegistry, ToolResponse,
    TurnOutcome, UserInput,
};
use heat_core::message::{AGENT_ID_KEY, LABEL_KEY};
use tokio::sync::{Notify, mpsc};

/// Config with the post-turn sub-tasks switched off
fn quiet_config() -> OrchestratorConfig {
    OrchestratorConfig {
        generate_suggestions: false,
        generate_title: false,
        ..Default::default()
    }
}

fn orchestrator(client: &Arc<ScriptedChatClient>, tools: ToolRegistry) -> ConversationOrchestrator {
    ConversationOrchestrator::new(client.clone(), Arc::new(tools)).with_config(quiet_config())
}

fn conversation_with_tools(tools: &[&str]) -> SharedConversation {
    SharedConversation::new(Conversation::new("You are helpful.").with_tools(tools.iter().copied()))
}

fn tool_request(id: &str, name: &str) -> Message {
    Message::assistant("").with_tool_call(ToolCall::new(id, name, r#"{"query":"weather"}"#))
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ConversationEvent>) -> Vec<ConversationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn state_changes(events: &[ConversationEvent]) -> Vec<ConversationState> {
    events
        .iter()
        .filter_map(|e| match e {
            ConversationEvent::StateChanged { state } => Some(*state),
            _ => None,
        })
        .collect()
}

struct FailingTool;

#[async_trait]
impl ToolHandler for FailingTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("generate_image", "Generate an image")
    }

    async fn handle(&self, _call: &ToolCall) -> Result<ToolResponse, ToolError> {
        Err(ToolError::ExecutionFailed("quota exceeded".to_string()))
    }
}

/// A tool that takes a while and records that it ran to completion
struct SlowTool {
    started: Arc<Notify>,
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl ToolHandler for SlowTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("generate_image", "Generate an image")
    }

    async fn handle(&self, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        self.started.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(ToolResponse::reply(call, "image ready", true))
    }
}

/// A search tool that notes the conversation state it was called in
struct StateRecordingTool {
    conversation: SharedConversation,
    seen: Arc<Mutex<Vec<ConversationState>>>,
}

#[async_trait]
impl ToolHandler for StateRecordingTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("search_web", "Search the web")
    }

    async fn handle(&self, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        self.seen.lock().unwrap().push(self.conversation.state());
        Ok(ToolResponse::reply(call, "sunny, 21C", true))
    }
}

mod turn_tests {
    use super::*;

    #[tokio::test]
    async fn test_plain_reply() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_response(vec![Message::assistant("hello")]);
        let conversation = conversation_with_tools(&[]);

        let report = orchestrator(&client, ToolRegistry::new())
            .run_turn(&conversation, UserInput::new("hi"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, TurnOutcome::Completed);
        assert_eq!(report.rounds, 1);
        assert_eq!(conversation.state(), ConversationState::None);

        let history = conversation.history();
        assert_eq!(history.len(), 2);
        assert_eq!((history[0].role, history[0].content.as_str()), (Role::User, "hi"));
        assert_eq!((history[1].role, history[1].content.as_str()), (Role::Assistant, "hello"));

        let runs = conversation.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].len(), 2);
        assert_eq!(Some(runs[0].id.clone()), report.run_id);
    }

    #[tokio::test]
    async fn test_tool_continue_issues_follow_up_request() {
        let client = Arc::new(ScriptedChatClient::new());
        client
            .push_response(vec![tool_request("call_1", "search_web")])
            .push_response(vec![Message::assistant("It will be sunny.")]);
        let tools = ToolRegistry::new().with(Arc::new(StaticTool::new("search_web", "sunny, 21C", true)));
        let conversation = conversation_with_tools(&["search_web"]);

        let report = orchestrator(&client, tools)
            .run_turn(&conversation, UserInput::new("Weather?"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, TurnOutcome::Completed);
        assert_eq!(client.request_count(), 2);
        assert_eq!(conversation.state(), ConversationState::None);

        let history = conversation.history();
        let roles: Vec<_> = history.iter().map(|m| m.role).collect();
        assert_eq!(roles, [Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(history[2].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(conversation.runs().len(), 1);

        // The follow-up request carries the tool result
        let second = &client.requests()[1];
        assert_eq!(second.history.len(), 3);
        assert_eq!(second.history[2].content, "sunny, 21C");
    }

    #[tokio::test]
    async fn test_snapshots_replace_in_place() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_response(vec![
            Message::assistant("Hel").with_id("a1").with_done(false),
            Message::assistant("Hello").with_id("a1").with_done(false),
            Message::assistant("Hello!").with_id("a1"),
        ]);
        let conversation = conversation_with_tools(&[]);

        orchestrator(&client, ToolRegistry::new())
            .run_turn(&conversation, UserInput::new("hi"), CancellationToken::new())
            .await
            .unwrap();

        let history = conversation.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].id, "a1");
        assert_eq!(history[1].content, "Hello!");
    }

    #[tokio::test]
    async fn test_streamed_text_yields_one_message() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_streamed_text("The quick brown fox");
        let conversation = conversation_with_tools(&[]);

        orchestrator(&client, ToolRegistry::new())
            .run_turn(&conversation, UserInput::new("hi"), CancellationToken::new())
            .await
            .unwrap();

        let history = conversation.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "The quick brown fox");
        assert!(history[1].done);
    }

    #[tokio::test]
    async fn test_tool_without_continue_ends_turn() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_response(vec![tool_request("call_1", "generate_image")]);
        let tools = ToolRegistry::new().with(Arc::new(StaticTool::new("generate_image", "done", false)));
        let conversation = conversation_with_tools(&["generate_image"]);

        let report = orchestrator(&client, tools)
            .run_turn(&conversation, UserInput::new("Draw a cat"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, TurnOutcome::Completed);
        assert_eq!(client.request_count(), 1);
        assert_eq!(conversation.history().len(), 3);
        assert_eq!(conversation.state(), ConversationState::None);
    }

    #[tokio::test]
    async fn test_any_continue_triggers_follow_up() {
        let client = Arc::new(ScriptedChatClient::new());
        client
            .push_response(vec![
                Message::assistant("")
                    .with_tool_call(ToolCall::new("c1", "generate_image", "{}"))
                    .with_tool_call(ToolCall::new("c2", "search_web", "{}")),
            ])
            .push_response(vec![Message::assistant("Here you go.")]);
        let tools = ToolRegistry::new()
            .with(Arc::new(StaticTool::new("generate_image", "image", false)))
            .with(Arc::new(StaticTool::new("search_web", "results", true)));
        let conversation = conversation_with_tools(&["generate_image", "search_web"]);

        orchestrator(&client, tools)
            .run_turn(&conversation, UserInput::new("go"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(client.request_count(), 2);
        let history = conversation.history();
        // Tool messages follow call order
        assert_eq!(history[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(history[3].tool_call_id.as_deref(), Some("c2"));
        assert_eq!(history[4].content, "Here you go.");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_reported_not_fatal() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_response(vec![tool_request("call_9", "browse")]);
        let conversation = conversation_with_tools(&[]);

        let report = orchestrator(&client, ToolRegistry::new())
            .run_turn(&conversation, UserInput::new("open the site"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, TurnOutcome::Completed);
        assert_eq!(client.request_count(), 1);

        let history = conversation.history();
        let tool_message = &history[2];
        assert_eq!(tool_message.role, Role::Tool);
        assert_eq!(tool_message.content, "Unknown tool.");
        assert_eq!(tool_message.metadata.get(LABEL_KEY).map(String::as_str), Some("Unknown tool"));
        assert_eq!(tool_message.tool_call_id.as_deref(), Some("call_9"));
    }

    #[tokio::test]
    async fn test_aliased_tool_is_dispatched() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_response(vec![tool_request("c1", "web_search")]);
        let mut tools = ToolRegistry::new().with(Arc::new(StaticTool::new("search_web", "results", false)));
        tools.register_alias("web_search", "search_web");
        let conversation = conversation_with_tools(&["search_web"]);

        orchestrator(&client, tools)
            .run_turn(&conversation, UserInput::new("search"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(conversation.history()[2].content, "results");
    }

    #[tokio::test]
    async fn test_empty_prompt_is_ignored() {
        let client = Arc::new(ScriptedChatClient::new());
        let conversation = conversation_with_tools(&[]);

        let report = orchestrator(&client, ToolRegistry::new())
            .run_turn(&conversation, UserInput::new("   "), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, TurnOutcome::Ignored);
        assert!(report.run_id.is_none());
        assert!(conversation.history().is_empty());
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn test_round_limit() {
        let client = Arc::new(ScriptedChatClient::new());
        for i in 0..3 {
            client.push_response(vec![tool_request(&format!("c{i}"), "search_web")]);
        }
        let tools = ToolRegistry::new().with(Arc::new(StaticTool::new("search_web", "more", true)));
        let conversation = conversation_with_tools(&["search_web"]);
        let config = OrchestratorConfig {
            max_tool_rounds: 2,
            ..quiet_config()
        };

        let report = ConversationOrchestrator::new(client.clone(), Arc::new(tools))
            .with_config(config)
            .run_turn(&conversation, UserInput::new("loop"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, TurnOutcome::RoundLimitReached);
        assert_eq!(report.rounds, 3);
        assert_eq!(client.request_count(), 3);
        assert_eq!(conversation.state(), ConversationState::None);
    }
}

mod request_tests {
    use super::*;

    #[tokio::test]
    async fn test_run_and_agent_ids_are_stamped() {
        let client = Arc::new(ScriptedChatClient::new());
        client
            .push_response(vec![tool_request("c1", "search_web")])
            .push_response(vec![Message::assistant("done")]);
        let tools = ToolRegistry::new().with(Arc::new(StaticTool::new("search_web", "results", true)));
        let conversation = conversation_with_tools(&["search_web"]);

        let report = orchestrator(&client, tools)
            .run_turn(
                &conversation,
                UserInput::new("go").with_agent_id("agent-7"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let run_id = report.run_id.unwrap();
        let history = conversation.history();
        assert!(history.iter().all(|m| m.run_id.as_deref() == Some(run_id.as_str())));
        for message in history.iter().filter(|m| m.role == Role::Assistant) {
            assert_eq!(message.metadata.get(AGENT_ID_KEY).map(String::as_str), Some("agent-7"));
        }
    }

    #[tokio::test]
    async fn test_tool_choice_applies_to_first_request_only() {
        let client = Arc::new(ScriptedChatClient::new());
        client
            .push_response(vec![tool_request("c1", "search_web")])
            .push_response(vec![Message::assistant("done")]);
        let tools = ToolRegistry::new().with(Arc::new(StaticTool::new("search_web", "results", true)));
        let conversation = conversation_with_tools(&["search_web"]);

        orchestrator(&client, tools)
            .run_turn(
                &conversation,
                UserInput::new("go").with_tool_choice("search_web"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let requests = client.requests();
        assert_eq!(requests[0].tool_choice.as_deref(), Some("search_web"));
        assert_eq!(requests[1].tool_choice, None);
    }

    #[tokio::test]
    async fn test_templates_are_rendered() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_response(vec![Message::assistant("ok")]);
        let conversation = SharedConversation::new(Conversation::new("Today is {{DATETIME}}. Be {{mood}}."));

        orchestrator(&client, ToolRegistry::new())
            .run_turn(
                &conversation,
                UserInput::new("Say something {{MOOD}}").with_context("MOOD", "terse"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let request = &client.requests()[0];
        assert!(request.system.ends_with("Be terse."));
        assert!(!request.system.contains("{{DATETIME}}"));
        assert_eq!(conversation.history()[0].content, "Say something terse");
    }

    #[tokio::test]
    async fn test_tool_allow_list_resolves_definitions() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_response(vec![Message::assistant("ok")]);
        let tools = ToolRegistry::new()
            .with(Arc::new(StaticTool::new("search_web", "results", true)))
            .with(Arc::new(StaticTool::new("generate_image", "image", false)));
        let conversation = conversation_with_tools(&["search_web", "browse"]);

        orchestrator(&client, tools)
            .run_turn(&conversation, UserInput::new("hi"), CancellationToken::new())
            .await
            .unwrap();

        let names: Vec<_> = client.requests()[0].tools.iter().map(|t| t.name.clone()).collect();
        assert_eq!(names, ["search_web"]);
    }

    #[tokio::test]
    async fn test_new_turn_clears_suggestions() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_response(vec![Message::assistant("ok")]);
        let conversation = conversation_with_tools(&[]);
        conversation.write().suggestions = vec!["old".to_string()];

        orchestrator(&client, ToolRegistry::new())
            .run_turn(&conversation, UserInput::new("hi"), CancellationToken::new())
            .await
            .unwrap();

        assert!(conversation.suggestions().is_empty());
    }

    #[tokio::test]
    async fn test_state_events() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_response(vec![
            Message::assistant("he").with_id("a1").with_done(false),
            Message::assistant("hello").with_id("a1"),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conversation = conversation_with_tools(&[]);

        orchestrator(&client, ToolRegistry::new())
            .with_events(tx)
            .run_turn(&conversation, UserInput::new("hi"), CancellationToken::new())
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert_eq!(
            state_changes(&events),
            [ConversationState::Processing, ConversationState::Streaming, ConversationState::None]
        );

        let upserts: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ConversationEvent::MessageUpserted { message, inserted } => Some((message.content.clone(), *inserted)),
                _ => None,
            })
            .collect();
        assert_eq!(
            upserts,
            [("hi".to_string(), true), ("he".to_string(), true), ("hello".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_state_events_across_tool_round() {
        let client = Arc::new(ScriptedChatClient::new());
        client
            .push_response(vec![tool_request("call_1", "search_web")])
            .push_response(vec![Message::assistant("It will be sunny.")]);
        let tools = ToolRegistry::new().with(Arc::new(StaticTool::new("search_web", "sunny, 21C", true)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conversation = conversation_with_tools(&["search_web"]);

        orchestrator(&client, tools)
            .with_events(tx)
            .run_turn(&conversation, UserInput::new("Weather?"), CancellationToken::new())
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert_eq!(
            state_changes(&events),
            [
                ConversationState::Processing,
                ConversationState::Streaming,
                ConversationState::Processing,
                ConversationState::Streaming,
                ConversationState::None,
            ]
        );

        // Tools run while the first reply is still the streaming state
        let timeline: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ConversationEvent::StateChanged { state } => Some(state.as_str()),
                ConversationEvent::ToolStarted { .. } => Some("tool_started"),
                ConversationEvent::ToolFinished { .. } => Some("tool_finished"),
                _ => None,
            })
            .collect();
        assert_eq!(
            timeline,
            ["processing", "streaming", "tool_started", "tool_finished", "processing", "streaming", "none"]
        );
    }

    #[tokio::test]
    async fn test_tool_runs_in_streaming_state() {
        let client = Arc::new(ScriptedChatClient::new());
        client
            .push_response(vec![tool_request("call_1", "search_web")])
            .push_response(vec![Message::assistant("It will be sunny.")]);
        let conversation = conversation_with_tools(&["search_web"]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let tool = StateRecordingTool {
            conversation: conversation.clone(),
            seen: seen.clone(),
        };

        orchestrator(&client, ToolRegistry::new().with(Arc::new(tool)))
            .run_turn(&conversation, UserInput::new("Weather?"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), [ConversationState::Streaming]);
        assert_eq!(conversation.state(), ConversationState::None);
    }
}

mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_handler_error_is_fatal() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_response(vec![tool_request("c1", "generate_image")]);
        let conversation = conversation_with_tools(&["generate_image"]);

        let err = orchestrator(&client, ToolRegistry::new().with(Arc::new(FailingTool)))
            .run_turn(&conversation, UserInput::new("draw"), CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            Error::ToolHandler { tool, source } => {
                assert_eq!(tool, "generate_image");
                assert_eq!(source, ToolError::ExecutionFailed("quota exceeded".to_string()));
            }
            other => panic!("Expected tool handler error, got {:?}", other),
        }
        assert_eq!(conversation.state(), ConversationState::None);
        assert_eq!(client.request_count(), 1);
    }

    #[tokio::test]
    async fn test_stream_error_resets_state() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_script(vec![
            Ok(Message::assistant("Partial").with_id("a1").with_done(false)),
            Err(StreamError::Network("connection reset".to_string())),
        ]);
        let conversation = conversation_with_tools(&[]);

        let err = orchestrator(&client, ToolRegistry::new())
            .run_turn(&conversation, UserInput::new("hi"), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Stream(StreamError::Network(_))));
        assert_eq!(conversation.state(), ConversationState::None);
        // What arrived before the failure stays
        assert_eq!(conversation.history()[1].content, "Partial");
    }

    #[tokio::test]
    async fn test_request_failure_resets_state() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_error(StreamError::Service("overloaded".to_string()));
        let conversation = conversation_with_tools(&[]);

        let err = orchestrator(&client, ToolRegistry::new())
            .run_turn(&conversation, UserInput::new("hi"), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Stream(StreamError::Service(_))));
        assert_eq!(conversation.state(), ConversationState::None);
        assert_eq!(conversation.history().len(), 1);
    }
}

mod cancellation_tests {
    use super::*;

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_response(vec![Message::assistant("never shown")]);
        let conversation = conversation_with_tools(&[]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = orchestrator(&client, ToolRegistry::new())
            .run_turn(&conversation, UserInput::new("hi"), cancel)
            .await
            .unwrap();

        assert_eq!(report.outcome, TurnOutcome::Cancelled);
        assert_eq!(conversation.history().len(), 1);
        assert_eq!(conversation.state(), ConversationState::None);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_keeps_partial_message() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_hanging(vec![Message::assistant("Thinking about").with_done(false)]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conversation = conversation_with_tools(&[]);

        let handle = orchestrator(&client, ToolRegistry::new())
            .with_events(tx)
            .spawn_turn(&conversation, UserInput::new("hi"));

        // Wait for the partial assistant snapshot
        while let Some(event) = rx.recv().await {
            if let ConversationEvent::MessageUpserted { message, .. } = event {
                if message.role == Role::Assistant {
                    break;
                }
            }
        }
        handle.cancel();
        let report = handle.join().await.unwrap();

        assert_eq!(report.outcome, TurnOutcome::Cancelled);
        assert_eq!(conversation.state(), ConversationState::None);
        let history = conversation.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "Thinking about");
        assert!(!history[1].done);
    }

    #[tokio::test]
    async fn test_cancel_during_tool_does_not_abort_handler() {
        let client = Arc::new(ScriptedChatClient::new());
        client
            .push_response(vec![tool_request("c1", "generate_image")])
            .push_response(vec![Message::assistant("never requested")]);
        let started = Arc::new(Notify::new());
        let finished = Arc::new(AtomicBool::new(false));
        let tools = ToolRegistry::new().with(Arc::new(SlowTool {
            started: started.clone(),
            finished: finished.clone(),
        }));
        let conversation = conversation_with_tools(&["generate_image"]);

        let handle = orchestrator(&client, tools).spawn_turn(&conversation, UserInput::new("draw"));
        started.notified().await;
        handle.cancel();
        let report = handle.join().await.unwrap();

        assert_eq!(report.outcome, TurnOutcome::Cancelled);
        assert_eq!(client.request_count(), 1);
        // The tool result arrived after cancellation and is not appended
        assert_eq!(conversation.history().len(), 2);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(finished.load(Ordering::SeqCst));
    }
}

mod follow_up_tests {
    use super::*;

    /// A reply usable by either sub-task, whichever request it answers
    const FOLLOW_UP_REPLY: &str =
        "<suggested_replies>\nTell me more\nWhat about tomorrow?\nThanks\nBye\n</suggested_replies>\n<title>Weather Check</title>";

    #[tokio::test]
    async fn test_suggestions_and_title_after_turn() {
        let client = Arc::new(ScriptedChatClient::new());
        client
            .push_response(vec![Message::assistant("It is sunny.")])
            .push_response(vec![Message::assistant(FOLLOW_UP_REPLY)])
            .push_response(vec![Message::assistant(FOLLOW_UP_REPLY)]);
        let conversation = conversation_with_tools(&[]);

        let mut report = ConversationOrchestrator::new(client.clone(), Arc::new(ToolRegistry::new()))
            .run_turn(&conversation, UserInput::new("Weather?"), CancellationToken::new())
            .await
            .unwrap();
        assert!(report.follow_up.is_some());
        report.wait_for_follow_up().await;

        assert_eq!(client.request_count(), 3);
        assert_eq!(conversation.suggestions(), ["Tell me more", "What about tomorrow?", "Thanks"]);
        assert_eq!(conversation.title().as_deref(), Some("Weather Check"));
        assert_eq!(conversation.state(), ConversationState::None);
        // Sub-task messages never enter the history
        assert_eq!(conversation.history().len(), 2);
    }

    #[tokio::test]
    async fn test_generate_suggestions_uses_history_prompt() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_response(vec![
            Message::assistant("<suggested_replies>\nOne").with_id("s").with_done(false),
            Message::assistant("<suggested_replies>\nOne\nTwo\n</suggested_replies>").with_id("s"),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conversation = SharedConversation::new(
            Conversation::new("").with_history(vec![Message::user("hi"), Message::assistant("hello")]),
        );

        let suggestions = orchestrator(&client, ToolRegistry::new())
            .with_events(tx)
            .generate_suggestions(&conversation, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(suggestions, ["One", "Two"]);
        assert_eq!(conversation.state(), ConversationState::None);

        // The rendered instructions are the whole request
        let request = &client.requests()[0];
        assert!(request.tools.is_empty());
        assert!(request.history.is_empty());
        assert!(request.system.contains("user:\nhi\n\nassistant:\nhello\n\n"));
        assert!(request.system.contains("<suggested_replies>"));

        let events = drain(&mut rx);
        assert!(events.contains(&ConversationEvent::StateChanged {
            state: ConversationState::Suggesting
        }));
        assert!(events.contains(&ConversationEvent::SuggestionsUpdated {
            suggestions: vec!["One".to_string()]
        }));
    }

    #[tokio::test]
    async fn test_next_turn_stops_previous_follow_ups() {
        let client = Arc::new(ScriptedChatClient::new());
        client
            .push_response(vec![Message::assistant("It is sunny today.")])
            .push_response(vec![tool_request("call_1", "search_web")])
            .push_response(vec![Message::assistant("Rain tomorrow.")])
            .push_response(vec![Message::assistant(
                "<suggested_replies>\nAnd the day after?\n</suggested_replies>",
            )]);
        let tools = ToolRegistry::new().with(Arc::new(StaticTool::new("search_web", "rain, 12C", true)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conversation = conversation_with_tools(&["search_web"]);
        let orchestrator = ConversationOrchestrator::new(client.clone(), Arc::new(tools))
            .with_config(OrchestratorConfig {
                generate_title: false,
                ..Default::default()
            })
            .with_events(tx);

        // The first turn's suggestions are left running
        let first = orchestrator
            .run_turn(&conversation, UserInput::new("Weather today?"), CancellationToken::new())
            .await
            .unwrap();
        assert!(first.follow_up.is_some());
        drain(&mut rx);

        let mut second = orchestrator
            .run_turn(&conversation, UserInput::new("And tomorrow?"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.outcome, TurnOutcome::Completed);

        let states = state_changes(&drain(&mut rx));
        assert!(!states.contains(&ConversationState::Suggesting));
        assert_eq!(
            states,
            [
                ConversationState::Processing,
                ConversationState::Streaming,
                ConversationState::Processing,
                ConversationState::Streaming,
                ConversationState::None,
            ]
        );
        assert!(conversation.suggestions().is_empty());

        second.wait_for_follow_up().await;
        assert_eq!(conversation.suggestions(), ["And the day after?"]);
        assert_eq!(conversation.state(), ConversationState::None);

        // Only the second turn asked for suggestions
        assert_eq!(client.request_count(), 4);
        assert!(client.requests()[3].system.contains("Rain tomorrow."));
    }

    #[tokio::test]
    async fn test_cancelled_follow_up_writes_nothing() {
        let client = Arc::new(ScriptedChatClient::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conversation = conversation_with_tools(&[]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let orchestrator = orchestrator(&client, ToolRegistry::new()).with_events(tx);
        let suggestions = orchestrator.generate_suggestions(&conversation, &cancel).await.unwrap();
        let title = orchestrator.generate_title(&conversation, &cancel).await.unwrap();

        assert!(suggestions.is_empty());
        assert!(title.is_none());
        assert_eq!(client.request_count(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_suggestion_failure_resets_state() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_error(StreamError::Network("offline".to_string()));
        let conversation = conversation_with_tools(&[]);

        let result = orchestrator(&client, ToolRegistry::new())
            .generate_suggestions(&conversation, &CancellationToken::new())
            .await;

        assert!(result.is_err());
        assert_eq!(conversation.state(), ConversationState::None);
    }

    #[tokio::test]
    async fn test_existing_title_is_kept() {
        let client = Arc::new(ScriptedChatClient::new());
        let conversation = SharedConversation::new(Conversation::new("").with_title("Trip Plans"));

        let title = orchestrator(&client, ToolRegistry::new())
            .generate_title(&conversation, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(title.as_deref(), Some("Trip Plans"));
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_title_tag_leaves_no_title() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_response(vec![Message::assistant("<title>  </title>")]);
        let conversation = conversation_with_tools(&[]);

        let title = orchestrator(&client, ToolRegistry::new())
            .generate_title(&conversation, &CancellationToken::new())
            .await
            .unwrap();

        assert!(title.is_none());
    }

    #[tokio::test]
    async fn test_no_follow_up_when_cancelled() {
        let client = Arc::new(ScriptedChatClient::new());
        let conversation = conversation_with_tools(&[]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = ConversationOrchestrator::new(client.clone(), Arc::new(ToolRegistry::new()))
            .run_turn(&conversation, UserInput::new("hi"), cancel)
            .await
            .unwrap();

        assert!(report.follow_up.is_none());
    }
}
