//! Streaming client backed by the genai multi-provider library
//!
//! genai reports a response as a series of chunk events. This adapter folds
//! them into id-stable message snapshots: every text chunk yields a fuller
//! copy of the same message, tool calls are collected as they arrive, and the
//! end event yields the final snapshot with `done` set.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use genai::chat::{
    ChatMessage, ChatRequest as GenAIRequest, ChatStreamEvent, Tool, ToolCall as GenAIToolCall,
    ToolResponse as GenAIToolResponse,
};
use genai::resolver::{AuthData, AuthResolver};
use genai::{Client, WebConfig};
use serde_json::Value;
use tracing::{debug, error};

use crate::client::{ChatRequest, MessageStream, StreamingChatClient};
use crate::config::ProviderConfig;
use crate::error::StreamError;
use crate::message::{Message, Role, ToolCall};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A [`StreamingChatClient`] talking to any provider genai supports
pub struct GenAIChatClient {
    client: Client,
    model: String,
}

impl GenAIChatClient {
    /// Create a client that resolves credentials from the environment
    pub fn new(model: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder().with_web_config(web_config(timeout)).build();
        Self {
            client,
            model: model.into(),
        }
    }

    /// Create a client with a specific API key
    pub fn with_api_key(model: impl Into<String>, api_key: &str, timeout: Duration) -> Self {
        let api_key = api_key.to_string();
        let auth_resolver = AuthResolver::from_resolver_fn(
            move |_model_iden| -> std::result::Result<Option<AuthData>, genai::resolver::Error> {
                Ok(Some(AuthData::from_single(api_key.clone())))
            },
        );

        let client = Client::builder()
            .with_web_config(web_config(timeout))
            .with_auth_resolver(auth_resolver)
            .build();

        Self {
            client,
            model: model.into(),
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs);
        match config.get_api_key() {
            Some(key) => Self::with_api_key(config.model.clone(), &key, timeout),
            None => Self::new(config.model.clone(), timeout),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn web_config(timeout: Duration) -> WebConfig {
    WebConfig::default()
        .with_timeout(timeout)
        .with_connect_timeout(CONNECT_TIMEOUT)
}

fn to_genai_tool_call(call: &ToolCall) -> GenAIToolCall {
    GenAIToolCall {
        call_id: call.id.clone(),
        fn_name: call.name.clone(),
        fn_arguments: serde_json::from_str(&call.arguments).unwrap_or_else(|_| Value::String(call.arguments.clone())),
        thought_signatures: None,
    }
}

fn from_genai_tool_call(call: GenAIToolCall) -> ToolCall {
    let arguments = match call.fn_arguments {
        Value::String(raw) => raw,
        other => other.to_string(),
    };
    ToolCall::new(call.call_id, call.fn_name, arguments)
}

fn to_genai_request(request: &ChatRequest) -> GenAIRequest {
    let mut req = GenAIRequest::default();
    if !request.system.is_empty() {
        req = req.with_system(request.system.as_str());
    }

    for message in &request.history {
        req = match message.role {
            Role::System => req.append_message(ChatMessage::system(message.content.as_str())),
            Role::User => req.append_message(ChatMessage::user(message.content.as_str())),
            Role::Assistant if message.has_tool_calls() => {
                // Tool calls must travel as a single assistant message
                let calls: Vec<GenAIToolCall> = message.tool_calls.iter().map(to_genai_tool_call).collect();
                req.append_message(calls)
            }
            Role::Assistant => req.append_message(ChatMessage::assistant(message.content.as_str())),
            Role::Tool => match &message.tool_call_id {
                Some(call_id) => req.append_message(GenAIToolResponse::new(call_id.clone(), message.content.clone())),
                None => req,
            },
        };
    }

    if !request.tools.is_empty() {
        let tools: Vec<Tool> = request
            .tools
            .iter()
            .map(|t| {
                Tool::new(&t.name)
                    .with_description(&t.description)
                    .with_schema(t.parameters.clone())
            })
            .collect();
        req = req.with_tools(tools);
    }

    req
}

#[async_trait]
impl StreamingChatClient for GenAIChatClient {
    async fn stream(&self, request: ChatRequest) -> Result<MessageStream, StreamError> {
        if let Some(tool) = &request.tool_choice {
            debug!(tool = %tool, "Forced tool choice is not forwarded to genai");
        }

        let response = self
            .client
            .exec_chat_stream(&self.model, to_genai_request(&request), None)
            .await
            .map_err(|e| {
                error!(error = ?e, model = %self.model, "LLM request failed");
                StreamError::Network(e.to_string())
            })?;

        let draft = Message::assistant("").with_done(false);
        let snapshots = stream::unfold(
            (response.stream, draft, false),
            |(mut events, mut message, finished)| async move {
                if finished {
                    return None;
                }
                loop {
                    match events.next().await {
                        Some(Ok(ChatStreamEvent::Chunk(chunk))) => {
                            message.content.push_str(&chunk.content);
                            let snapshot = message.clone();
                            return Some((Ok(snapshot), (events, message, false)));
                        }
                        Some(Ok(ChatStreamEvent::ToolCallChunk(chunk))) => {
                            message.tool_calls.push(from_genai_tool_call(chunk.tool_call));
                        }
                        Some(Ok(ChatStreamEvent::End(_))) | None => {
                            message.done = true;
                            let snapshot = message.clone();
                            return Some((Ok(snapshot), (events, message, true)));
                        }
                        // Start, reasoning and signature events carry nothing we store
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = ?e, "LLM stream error");
                            return Some((Err(StreamError::Service(e.to_string())), (events, message, true)));
                        }
                    }
                }
            },
        );

        Ok(snapshots.boxed())
    }
}
