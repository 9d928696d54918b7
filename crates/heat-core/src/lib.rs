//! Heat Core - tagged content parsing and tool-calling conversations
//!
//! This crate provides the core functionality behind the Heat chat client:
//! - A streaming-tolerant parser for `<tag>...</tag>` markup in model output
//! - The conversation orchestrator driving a turn through tool calls
//! - Run clustering for display
//! - Prompt templating, tool registry, configuration

pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
#[cfg(feature = "genai")]
pub mod genai_client;
pub mod message;
pub mod orchestrator;
pub mod parser;
pub mod prompts;
pub mod runs;
pub mod template;
pub mod tools;

pub use client::{ChatRequest, MessageStream, ScriptedChatClient, StreamingChatClient};
pub use config::{Config, OrchestratorConfig, ProviderConfig, RenderConfig};
pub use conversation::{Conversation, ConversationEvent, ConversationState, SharedConversation};
pub use error::{Error, Result, StreamError, ToolError};
#[cfg(feature = "genai")]
pub use genai_client::GenAIChatClient;
pub use message::{Attachment, AttachmentKind, Message, Role, ToolCall};
pub use orchestrator::{ConversationOrchestrator, TurnHandle, TurnOutcome, TurnReport, UserInput};
pub use parser::{Content, ContentTree, ParseError, Tag, TagParser};
pub use runs::{Run, cluster};
pub use template::{PromptTemplate, TemplateContext};
pub use tools::{StaticTool, ToolDefinition, ToolHandler, ToolRegistry, ToolResponse};

// Re-exported so handlers and callers share one token type
pub use tokio_util::sync::CancellationToken;
