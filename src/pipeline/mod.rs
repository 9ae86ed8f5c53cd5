//! Built-in AI pipeline: real-time STT -> LLM -> TTS processing.
//!
//! When pipeline mode is enabled the bridge replaces the external bot
//! WebSocket with this internal chain: provider audio is transcribed, turn
//! boundaries are detected, the LLM generates a streamed response, and the
//! synthesized speech flows back through the session's outbound queue.

pub mod context;
pub mod escalation;
pub mod orchestrator;
pub mod turn_detector;

pub use context::ConversationContext;

/// Truncate a string to at most `max_bytes` at a char boundary. Transcripts
/// contain multi-byte characters and byte-slicing panics mid-char.
pub(crate) fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
pub use escalation::{EscalationDetector, EscalationResult, EscalationTrigger};
pub use orchestrator::{PipelineEvent, PipelineHandle, PipelineOrchestrator, ToolExecutor};
pub use turn_detector::{TurnDetector, TurnSignal};
