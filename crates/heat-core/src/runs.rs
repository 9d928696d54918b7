//! Run clustering
//!
//! A run is the display grouping of the messages produced by one logical
//! turn: the user message, every assistant snapshot, and every tool message
//! of its tool-call chain.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{Message, Role};

/// A contiguous slice of conversation sharing one run key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub messages: Vec<Message>,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
}

impl Run {
    fn open(first: Message) -> Self {
        Self {
            id: first.run_key().to_string(),
            started: first.created,
            ended: Some(first.modified),
            messages: vec![first],
        }
    }

    fn push(&mut self, message: Message) {
        self.ended = Some(message.modified);
        self.messages.push(message);
    }

    /// Every message leading up to the response
    pub fn steps(&self) -> &[Message] {
        match self.messages.split_last() {
            Some((_, steps)) => steps,
            None => &[],
        }
    }

    /// The final answer, when the run ended on one
    pub fn response(&self) -> Option<&Message> {
        self.messages
            .last()
            .filter(|m| m.role == Role::Assistant && !m.has_tool_calls())
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.ended.map(|ended| ended - self.started)
    }

    /// Elapsed time as "N seconds" or "M minutes, N seconds"
    pub fn elapsed_pretty(&self) -> Option<String> {
        let secs = self.elapsed()?.num_seconds().max(0);
        let (minutes, seconds) = (secs / 60, secs % 60);
        if minutes > 0 {
            Some(format!("{minutes} minutes, {seconds} seconds"))
        } else {
            Some(format!("{seconds} seconds"))
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Partition `messages` into runs, preserving order
///
/// A message joins the current run when its run ID equals the run's ID;
/// anything else starts a new run keyed by the message's run ID, or by its
/// own ID when it has none.
pub fn cluster<I>(messages: I) -> Vec<Run>
where
    I: IntoIterator<Item = Message>,
{
    let mut runs = Vec::new();
    let mut current: Option<Run> = None;

    for message in messages {
        match current.as_mut() {
            Some(run) if message.run_id.as_deref() == Some(run.id.as_str()) => run.push(message),
            _ => {
                if let Some(done) = current.replace(Run::open(message)) {
                    runs.push(done);
                }
            }
        }
    }

    runs.extend(current);
    runs
}
