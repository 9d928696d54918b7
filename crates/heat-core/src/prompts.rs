//! Built-in prompts for the post-turn sub-tasks
//!
//! Both are rendered with `{{HISTORY}}` set to the plain-text transcript and
//! sent as the system prompt of a tool-less request with no history.

/// Asks for likely next user messages inside `<suggested_replies>`
pub const SUGGESTIONS_INSTRUCTIONS: &str = r#"Suggest what the user might say next in the chat session below between a user and an AI assistant.

<chat_history>
{{HISTORY}}
</chat_history>

Guidelines:
- Keep each suggestion brief and conversational.
- Stay on the current topic and focus on the most recent messages.
- Mix questions, statements and requests for clarification.
- Do not repeat what the history already says.

Write exactly 3 suggestions, one per line, and wrap the whole list in <suggested_replies> tags. For example:

<suggested_replies>
Could you explain that in more detail?
How does it compare to the alternatives?
Show me an example.
</suggested_replies>"#;

/// Asks for a short topic title inside `<title>`, empty when there is no clear topic
pub const TITLE_INSTRUCTIONS: &str = r#"Read the conversation transcript below and decide whether it has a clear topic.

<chat_history>
{{HISTORY}}
</chat_history>

Ignore greetings, small talk and unrelated tangents. If there is a clear topic, write a descriptive title of at most 4 words inside <title> tags. If the conversation is only small talk or too unfocused to summarize, output an empty <title></title> tag."#;
