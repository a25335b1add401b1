//! Session data model.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::router::RoutingDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-tool counters accumulated inside one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolUsageStats {
    pub invocations: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
}

impl ToolUsageStats {
    pub fn record(&mut self, success: bool, latency_ms: u64) {
        self.invocations += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        // Running mean over all invocations.
        self.avg_latency_ms +=
            (latency_ms as f64 - self.avg_latency_ms) / self.invocations as f64;
    }
}

/// One conversation's accumulated state. All writers go through the owning
/// [`super::SessionStore`], which serializes them per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub messages: VecDeque<ChatMessage>,
    /// Qualified tool name -> usage counters.
    pub tool_usage: HashMap<String, ToolUsageStats>,
    /// Qualified tool name -> co-selected tool -> count.
    pub co_occurrence: HashMap<String, HashMap<String, u64>>,
    #[serde(skip)]
    pub last_routing: Option<RoutingDecision>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            messages: VecDeque::new(),
            tool_usage: HashMap::new(),
            co_occurrence: HashMap::new(),
            last_routing: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message, evicting FIFO once the window is full.
    pub fn push_message(&mut self, message: ChatMessage, max_history: usize) {
        if max_history > 0 && self.messages.len() == max_history {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
        self.updated_at = Utc::now();
    }

    pub fn record_tool_outcome(&mut self, qualified_name: &str, success: bool, latency_ms: u64) {
        self.tool_usage
            .entry(qualified_name.to_string())
            .or_default()
            .record(success, latency_ms);
        self.updated_at = Utc::now();
    }

    /// Symmetric co-occurrence bump for one (a, b) pair.
    pub fn record_co_occurrence(&mut self, a: &str, b: &str) {
        if a == b {
            return;
        }
        *self
            .co_occurrence
            .entry(a.to_string())
            .or_default()
            .entry(b.to_string())
            .or_default() += 1;
        *self
            .co_occurrence
            .entry(b.to_string())
            .or_default()
            .entry(a.to_string())
            .or_default() += 1;
    }

    pub fn co_occurrence_count(&self, a: &str, b: &str) -> u64 {
        self.co_occurrence
            .get(a)
            .and_then(|m| m.get(b))
            .copied()
            .unwrap_or(0)
    }

    pub fn usage_count(&self, qualified_name: &str) -> u64 {
        self.tool_usage
            .get(qualified_name)
            .map(|s| s.invocations)
            .unwrap_or(0)
    }

    /// The most recent `n` messages in chronological order.
    pub fn recent_messages(&self, n: usize) -> Vec<&ChatMessage> {
        let skip = self.messages.len().saturating_sub(n);
        self.messages.iter().skip(skip).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(content: &str) -> ChatMessage {
        ChatMessage {
            role: MessageRole::User,
            content: content.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_message_window_evicts_fifo() {
        let mut session = Session::new("s");
        for i in 0..5 {
            session.push_message(msg(&format!("m{}", i)), 3);
        }
        assert_eq!(session.messages.len(), 3);
        assert_eq!(session.messages[0].content, "m2");
        assert_eq!(session.messages[2].content, "m4");
    }

    #[test]
    fn test_usage_invariant() {
        let mut session = Session::new("s");
        session.record_tool_outcome("fs.read_file", true, 10);
        session.record_tool_outcome("fs.read_file", false, 30);
        session.record_tool_outcome("fs.read_file", true, 20);

        let stats = &session.tool_usage["fs.read_file"];
        assert_eq!(stats.invocations, 3);
        assert!(stats.successes + stats.failures <= stats.invocations);
        assert!((stats.avg_latency_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_co_occurrence_symmetric() {
        let mut session = Session::new("s");
        session.record_co_occurrence("fs.read_file", "fs.list_directory");
        session.record_co_occurrence("fs.read_file", "fs.list_directory");
        assert_eq!(
            session.co_occurrence_count("fs.read_file", "fs.list_directory"),
            2
        );
        assert_eq!(
            session.co_occurrence_count("fs.list_directory", "fs.read_file"),
            2
        );
    }

    #[test]
    fn test_self_co_occurrence_ignored() {
        let mut session = Session::new("s");
        session.record_co_occurrence("fs.read_file", "fs.read_file");
        assert_eq!(session.co_occurrence_count("fs.read_file", "fs.read_file"), 0);
    }

    #[test]
    fn test_recent_messages_order() {
        let mut session = Session::new("s");
        for i in 0..4 {
            session.push_message(msg(&format!("m{}", i)), 10);
        }
        let recent: Vec<_> = session
            .recent_messages(2)
            .into_iter()
            .map(|m| m.content.clone())
            .collect();
        assert_eq!(recent, vec!["m2", "m3"]);
    }
}
