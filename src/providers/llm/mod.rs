//! Large-language-model providers.

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicLlm;
pub use openai::OpenAiLlm;

/// Incremental server-sent-events splitter. HTTP chunks arrive on arbitrary
/// byte boundaries; this buffers partial lines and returns complete `data:`
/// payloads as they materialise.
#[derive(Default)]
pub(crate) struct SseBuffer {
    buf: String,
}

impl SseBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(bytes));

        let mut payloads = Vec::new();
        while let Some(newline) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=newline).collect();
            let line = line.trim_end();
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}
