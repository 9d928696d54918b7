//! Prompt templating
//!
//! Instruction strings may embed `{{KEY}}` placeholders that are filled from a
//! context map before the request is sent.
//!
//! # Syntax
//!
//! ```text
//! Today is {{DATETIME}}. Conversation so far:
//! {{ history }}
//! ```
//!
//! Keys match case-insensitively and may be padded with whitespace inside the
//! braces. Placeholders with no value in the context are left as written.

use std::collections::HashMap;

/// Context key the orchestrator fills with the current local time
pub const DATETIME_KEY: &str = "DATETIME";

/// Context key carrying the plain-text transcript for follow-up prompts
pub const HISTORY_KEY: &str = "HISTORY";

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Values available to a template, keyed by placeholder name
pub type TemplateContext = HashMap<String, String>;

/// A `{{KEY}}` template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    template: String,
}

impl PromptTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Substitute every known placeholder
    pub fn render(&self, context: &TemplateContext) -> String {
        render(&self.template, context)
    }

    /// Placeholder names in order of appearance
    pub fn placeholders(&self) -> Vec<String> {
        extract_placeholders(&self.template)
    }
}

impl From<&str> for PromptTemplate {
    fn from(template: &str) -> Self {
        Self::new(template)
    }
}

impl From<String> for PromptTemplate {
    fn from(template: String) -> Self {
        Self::new(template)
    }
}

/// Render `template` against `context`
///
/// # Example
///
/// ```
/// use heat_core::template::{render, TemplateContext};
///
/// let mut context = TemplateContext::new();
/// context.insert("HISTORY".into(), "user:\nhi\n\n".into());
/// assert_eq!(render("{{history}}", &context), "user:\nhi\n\n");
/// assert_eq!(render("{{missing}}", &context), "{{missing}}");
/// ```
pub fn render(template: &str, context: &TemplateContext) -> String {
    if !has_placeholders(template) {
        return template.to_string();
    }

    let lookup: HashMap<String, &str> = context
        .iter()
        .map(|(k, v)| (k.trim().to_lowercase(), v.as_str()))
        .collect();

    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(OPEN) {
        result.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];

        let Some(end) = after_open.find(CLOSE) else {
            // Unterminated placeholder, kept verbatim
            result.push_str(&rest[start..]);
            return result;
        };

        let key = after_open[..end].trim();
        match lookup.get(&key.to_lowercase()) {
            Some(value) if !key.is_empty() => result.push_str(value),
            _ => result.push_str(&rest[start..start + OPEN.len() + end + CLOSE.len()]),
        }
        rest = &after_open[end + CLOSE.len()..];
    }

    result.push_str(rest);
    result
}

/// Extract placeholder names without rendering
pub fn extract_placeholders(template: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            break;
        };
        let key = after_open[..end].trim();
        if !key.is_empty() {
            keys.push(key.to_string());
        }
        rest = &after_open[end + CLOSE.len()..];
    }

    keys
}

/// Check if a string contains any placeholders
pub fn has_placeholders(template: &str) -> bool {
    template
        .find(OPEN)
        .is_some_and(|start| template[start + OPEN.len()..].contains(CLOSE))
}

/// The current local time in the form templates receive it
pub fn current_datetime() -> String {
    chrono::Local::now().to_rfc3339()
}
