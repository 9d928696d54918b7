//! Configuration management for Heat
//!
//! One TOML file holds the orchestrator limits, the render allow-lists and
//! the model provider settings. Missing sections and keys take defaults.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::parser::{ContentTree, Tag};

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
}

impl Config {
    /// `heat/config.toml` under the platform config directory
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| Error::Config("No config directory on this platform".to_string()))?;
        Ok(config_dir.join("heat").join("config.toml"))
    }

    /// Read the config at `path`; a missing file means defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(Error::Config(format!("Failed to read config {}: {}", path.display(), e))),
        };
        toml::from_str(&content).map_err(|e| Error::Config(format!("Failed to parse config {}: {}", path.display(), e)))
    }

    pub fn load_default() -> Result<Self> {
        Self::load(&Self::default_path()?)
    }
}

/// Turn loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Follow-up requests allowed after tool calls within one turn
    pub max_tool_rounds: usize,
    /// Ask for suggested replies after each completed turn
    pub generate_suggestions: bool,
    /// Ask for a title while the conversation has none
    pub generate_title: bool,
    pub max_suggestions: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 25,
            generate_suggestions: true,
            generate_title: true,
            max_suggestions: 3,
        }
    }
}

/// Tag allow-lists used when displaying assistant output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Tags recognized at the top level of a message
    pub tags: Vec<String>,
    /// Tags recognized inside an `<artifact>`
    pub artifact_tags: Vec<String>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            tags: ["thinking", "artifact", "output", "image_search_query", "reflection"]
                .map(String::from)
                .to_vec(),
            artifact_tags: vec!["image_search_query".to_string()],
        }
    }
}

impl RenderConfig {
    /// Parse message content for display
    ///
    /// The whole input is trimmed once before parsing.
    pub fn parse(&self, content: &str) -> ContentTree {
        ContentTree::parse_lossy(content.trim(), &self.tags)
    }

    /// Parse the content of an `<artifact>` tag
    pub fn parse_artifact(&self, artifact: &Tag) -> ContentTree {
        ContentTree::parse_lossy(&artifact.content, &self.artifact_tags)
    }
}

/// Model provider settings for the genai-backed client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Model identifier, e.g. "gpt-4o-mini" or "claude-sonnet-4-20250514"
    pub model: String,
    /// API key (can be loaded from env)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable name for API key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            timeout_secs: 300,
        }
    }
}

impl ProviderConfig {
    /// Get API key from config or environment
    pub fn get_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            self.api_key_env
                .as_ref()
                .and_then(|env| std::env::var(env).ok())
        })
    }
}
