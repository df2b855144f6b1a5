//! Bounded ring buffer of recent live-chat messages.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Maximum retained messages.
pub const BUFFER_CAPACITY: usize = 100;

/// One stored chat message.
#[derive(Debug, Clone, Serialize)]
pub struct StoredChatMessage {
    pub user_id: String,
    pub user_login: String,
    pub display_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Thread-safe bounded deque of recent chat messages, used both to render
/// live-chat context blocks for chat pipelines and to snapshot the wish
/// session's chat-vote window.
pub struct ChatBuffer {
    messages: Mutex<VecDeque<StoredChatMessage>>,
}

impl Default for ChatBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatBuffer {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(VecDeque::with_capacity(BUFFER_CAPACITY)),
        }
    }

    pub fn add(&self, message: StoredChatMessage) {
        let mut messages = self.messages.lock().expect("chat buffer poisoned");
        if messages.len() == BUFFER_CAPACITY {
            messages.pop_front();
        }
        messages.push_back(message);
    }

    /// Messages newer than `now - seconds`.
    pub fn get_recent(&self, seconds: u32) -> Vec<StoredChatMessage> {
        let cutoff = Utc::now() - Duration::seconds(seconds as i64);
        self.messages
            .lock()
            .expect("chat buffer poisoned")
            .iter()
            .filter(|m| m.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.messages.lock().expect("chat buffer poisoned").clear();
    }

    /// Format messages for inclusion in an LLM prompt: the last
    /// `max_messages`, one `[display_name]: text` line each.
    pub fn format_for_prompt(messages: &[StoredChatMessage], max_messages: usize) -> String {
        if messages.is_empty() {
            return String::new();
        }
        let start = messages.len().saturating_sub(max_messages);
        messages[start..]
            .iter()
            .map(|m| format!("[{}]: {}", m.display_name, m.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Formatted context block for the last `seconds` of chat.
    pub fn context_block(&self, seconds: u32, max_messages: usize) -> String {
        Self::format_for_prompt(&self.get_recent(seconds), max_messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(name: &str, text: &str) -> StoredChatMessage {
        StoredChatMessage {
            user_id: format!("id-{}", name),
            user_login: name.to_lowercase(),
            display_name: name.to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_add_and_get_recent() {
        let buffer = ChatBuffer::new();
        buffer.add(message("Viewer", "hello"));
        let recent = buffer.get_recent(60);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].text, "hello");
    }

    #[test]
    fn test_time_window_excludes_old_messages() {
        let buffer = ChatBuffer::new();
        let mut old = message("Viewer", "ancient");
        old.timestamp = Utc::now() - Duration::seconds(120);
        buffer.add(old);
        buffer.add(message("Viewer", "fresh"));

        let recent = buffer.get_recent(60);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].text, "fresh");
    }

    #[test]
    fn test_capacity_bound() {
        let buffer = ChatBuffer::new();
        for i in 0..150 {
            buffer.add(message("Viewer", &format!("msg {}", i)));
        }
        let recent = buffer.get_recent(3600);
        assert_eq!(recent.len(), BUFFER_CAPACITY);
        assert_eq!(recent[0].text, "msg 50");
    }

    #[test]
    fn test_clear() {
        let buffer = ChatBuffer::new();
        buffer.add(message("Viewer", "hello"));
        buffer.clear();
        assert!(buffer.get_recent(60).is_empty());
    }

    #[test]
    fn test_format_for_prompt() {
        let messages = vec![message("Alice", "hi"), message("Bob", "hello")];
        let formatted = ChatBuffer::format_for_prompt(&messages, 20);
        assert_eq!(formatted, "[Alice]: hi\n[Bob]: hello");

        // Caps at the last max_messages
        let formatted = ChatBuffer::format_for_prompt(&messages, 1);
        assert_eq!(formatted, "[Bob]: hello");

        assert_eq!(ChatBuffer::format_for_prompt(&[], 20), "");
    }
}
