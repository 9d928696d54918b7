//! Error types for Heat Core

use thiserror::Error;

use crate::parser::ParseError;

/// Result type alias using Heat Error
pub type Result<T> = std::result::Result<T, Error>;

/// Heat error types
///
/// Turn-level failures always leave the conversation in the `none` state
/// before they reach the caller.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Tool '{tool}' failed: {source}")]
    ToolHandler {
        tool: String,
        #[source]
        source: ToolError,
    },

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A spawned turn panicked or was aborted
    #[error("Task failed: {0}")]
    Task(String),
}

/// Failures reported by a streaming chat client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Decoding error: {0}")]
    Decode(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Stream closed: {0}")]
    Closed(String),
}

/// Tool-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// No handler is registered under the requested name
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}
