//! Conversation context for the LLM.
//!
//! Holds the message history sent on every generation: system prompt,
//! conversation turns, tool calls and results. Bounded by message count and
//! an approximate character budget; trimming drops the oldest non-system
//! messages first and never removes a system message.

use serde_json::Value;
use tracing::debug;

use crate::providers::{LlmToolCall, Message, Role};

const DEFAULT_MAX_MESSAGES: usize = 50;
const DEFAULT_MAX_CONTEXT_CHARS: usize = 32_000;

pub struct ConversationContext {
    max_messages: usize,
    max_context_chars: usize,
    tools: Vec<Value>,

    messages: Vec<Message>,
    total_input_tokens: u64,
    total_output_tokens: u64,
}

impl ConversationContext {
    /// Build a context seeded with the system prompt and, when configured,
    /// the agent's greeting as the first assistant message.
    pub fn new(system_prompt: &str, first_message: &str, tools: Vec<Value>) -> Self {
        let mut messages = Vec::new();
        if !system_prompt.is_empty() {
            messages.push(Message::new(Role::System, system_prompt));
        }
        if !first_message.is_empty() {
            messages.push(Message::new(Role::Assistant, first_message));
        }
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
            tools,
            messages,
            total_input_tokens: 0,
            total_output_tokens: 0,
        }
    }

    pub fn with_limits(mut self, max_messages: usize, max_context_chars: usize) -> Self {
        self.max_messages = max_messages;
        self.max_context_chars = max_context_chars;
        self.trim();
        self
    }

    // ─── Mutation ───────────────────────────────────────────────────────────

    pub fn add_user_message(&mut self, text: &str) {
        self.messages.push(Message::new(Role::User, text));
        self.trim();
    }

    pub fn add_assistant_message(&mut self, text: &str) {
        if !text.trim().is_empty() {
            self.messages.push(Message::new(Role::Assistant, text));
            self.trim();
        }
    }

    /// Replace the most recent user message (used to rewrite the final turn
    /// into a goodbye prompt).
    pub fn replace_last_user_message(&mut self, text: &str) {
        if let Some(msg) = self.messages.iter_mut().rev().find(|m| m.role == Role::User) {
            msg.content = text.to_string();
        }
    }

    pub fn add_assistant_tool_calls(&mut self, text: &str, tool_calls: Vec<LlmToolCall>) {
        let mut msg = Message::new(Role::Assistant, text);
        msg.tool_calls = tool_calls;
        self.messages.push(msg);
        self.trim();
    }

    pub fn add_tool_result(&mut self, tool_call_id: &str, tool_name: &str, result: &Value) {
        let content = match result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        self.messages.push(Message::tool_result(tool_call_id, tool_name, content));
        self.trim();
        debug!("context: added tool result for {tool_name}");
    }

    pub fn update_token_usage(&mut self, input_tokens: u32, output_tokens: u32) {
        self.total_input_tokens += input_tokens as u64;
        self.total_output_tokens += output_tokens as u64;
    }

    /// Drop everything except system messages.
    pub fn clear(&mut self) {
        self.messages.retain(|m| m.role == Role::System);
    }

    // ─── Access ─────────────────────────────────────────────────────────────

    pub fn messages(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn tools(&self) -> Option<Vec<Value>> {
        if self.tools.is_empty() { None } else { Some(self.tools.clone()) }
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_input_tokens + self.total_output_tokens
    }

    pub fn last_user_message(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    pub fn last_assistant_message(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    /// Simplified transcript: user/assistant turns only.
    pub fn transcript(&self) -> Vec<(String, String)> {
        self.messages
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant) && !m.content.is_empty())
            .map(|m| (m.role.as_str().to_string(), m.content.clone()))
            .collect()
    }

    // ─── Trimming ───────────────────────────────────────────────────────────

    fn trim(&mut self) {
        // By message count: keep system messages plus the most recent rest.
        if self.messages.len() > self.max_messages {
            let system: Vec<Message> =
                self.messages.iter().filter(|m| m.role == Role::System).cloned().collect();
            let non_system: Vec<Message> =
                self.messages.iter().filter(|m| m.role != Role::System).cloned().collect();
            let keep = self.max_messages.saturating_sub(system.len());
            let start = non_system.len().saturating_sub(keep);
            self.messages = system;
            self.messages.extend_from_slice(&non_system[start..]);
            debug!("context trimmed to {} messages", self.messages.len());
        }

        // By approximate character budget: evict oldest non-system first.
        let mut total_chars: usize = self.messages.iter().map(|m| m.content.len()).sum();
        while total_chars > self.max_context_chars && self.messages.len() > 2 {
            let Some(pos) = self.messages.iter().position(|m| m.role != Role::System) else {
                break;
            };
            let removed = self.messages.remove(pos);
            total_chars -= removed.content.len();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seeded_with_system_and_greeting() {
        let ctx = ConversationContext::new("prompt", "Hello!", Vec::new());
        let messages = ctx.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(ctx.last_assistant_message(), "Hello!");
    }

    #[test]
    fn test_trim_preserves_system_messages() {
        let mut ctx =
            ConversationContext::new("sys", "", Vec::new()).with_limits(5, usize::MAX);
        for i in 0..20 {
            ctx.add_user_message(&format!("turn {i}"));
        }
        assert_eq!(ctx.message_count(), 5);
        let messages = ctx.messages();
        assert_eq!(messages[0].role, Role::System, "system prompt must survive trimming");
        assert_eq!(messages.last().unwrap().content, "turn 19");
    }

    #[test]
    fn test_message_count_never_exceeds_max() {
        let mut ctx = ConversationContext::new("sys", "", Vec::new()).with_limits(10, usize::MAX);
        for i in 0..100 {
            ctx.add_user_message(&format!("u{i}"));
            ctx.add_assistant_message(&format!("a{i}"));
            assert!(ctx.message_count() <= 10);
        }
    }

    #[test]
    fn test_char_budget_evicts_oldest_non_system() {
        let mut ctx = ConversationContext::new("sys", "", Vec::new()).with_limits(50, 100);
        ctx.add_user_message(&"x".repeat(60));
        ctx.add_assistant_message(&"y".repeat(60));
        ctx.add_user_message("short");

        let messages = ctx.messages();
        assert_eq!(messages[0].role, Role::System);
        assert!(!messages.iter().any(|m| m.content.starts_with('x')), "oldest turn evicted");
        assert_eq!(ctx.last_user_message(), "short");
    }

    #[test]
    fn test_tool_cycle() {
        let mut ctx = ConversationContext::new("sys", "", vec![json!({"name": "t"})]);
        ctx.add_assistant_tool_calls(
            "on it",
            vec![LlmToolCall { id: "tc1".into(), name: "t".into(), arguments: json!({}) }],
        );
        ctx.add_tool_result("tc1", "t", &json!({"answer": 42}));

        let messages = ctx.messages();
        assert_eq!(messages.last().unwrap().role, Role::Tool);
        assert!(messages.last().unwrap().content.contains("42"));
        assert!(ctx.tools().is_some());
    }

    #[test]
    fn test_transcript_excludes_system_and_tools() {
        let mut ctx = ConversationContext::new("sys", "", Vec::new());
        ctx.add_user_message("hi");
        ctx.add_assistant_message("hello");
        ctx.add_tool_result("id", "t", &json!("r"));

        let transcript = ctx.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0], ("user".to_string(), "hi".to_string()));
    }

    #[test]
    fn test_replace_last_user_message() {
        let mut ctx = ConversationContext::new("sys", "", Vec::new());
        ctx.add_user_message("goodbye");
        ctx.replace_last_user_message("say a polite goodbye");
        assert_eq!(ctx.last_user_message(), "say a polite goodbye");
    }

    #[test]
    fn test_clear_keeps_system() {
        let mut ctx = ConversationContext::new("sys", "hi", Vec::new());
        ctx.add_user_message("u");
        ctx.clear();
        assert_eq!(ctx.message_count(), 1);
        assert_eq!(ctx.messages()[0].role, Role::System);
    }

    #[test]
    fn test_token_accounting() {
        let mut ctx = ConversationContext::new("", "", Vec::new());
        ctx.update_token_usage(100, 20);
        ctx.update_token_usage(50, 10);
        assert_eq!(ctx.total_tokens(), 180);
    }
}
