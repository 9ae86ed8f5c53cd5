//! AI provider abstractions for the built-in pipeline.
//!
//! The pipeline orchestrator works with these traits, never with concrete
//! implementations directly. Streaming output rides tokio mpsc channels:
//! providers run a background task that feeds the channel, consumers drain
//! the receiver. Reference implementations live in the submodules:
//!
//! - STT: Deepgram (streaming WebSocket)
//! - LLM: OpenAI, Anthropic (streaming HTTP/SSE)
//! - TTS: ElevenLabs (streaming WebSocket)

pub mod llm;
pub mod stt;
pub mod tts;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::events::Codec;

/// Provider errors.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("unknown {kind} provider '{name}'")]
    Unknown { kind: &'static str, name: String },

    #[error("missing provider config: {0}")]
    Config(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("provider not connected")]
    NotConnected,

    #[error("request failed: {0}")]
    Request(String),
}

// ---------------------------------------------------------------------------
// Streaming data types
// ---------------------------------------------------------------------------

/// A speech-to-text transcription result. An empty final result is an
/// utterance-end (endpointing) signal from the STT provider.
#[derive(Debug, Clone, Default)]
pub struct SttResult {
    pub text: String,
    pub is_final: bool,
    pub confidence: f32,
    /// Word-level timestamps when the provider supplies them.
    pub words: Vec<Value>,
}

impl SttResult {
    pub fn interim(text: impl Into<String>) -> Self {
        Self { text: text.into(), ..Default::default() }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self { text: text.into(), is_final: true, ..Default::default() }
    }

    /// Endpointing marker: empty final.
    pub fn utterance_end() -> Self {
        Self { is_final: true, ..Default::default() }
    }
}

/// A streaming chunk from an LLM response. Tool-call argument fragments are
/// JSON strings that accumulate across chunks per `tool_call_id`.
#[derive(Debug, Clone, Default)]
pub struct LlmChunk {
    pub text: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub tool_arguments: String,
    pub is_final: bool,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Set when the stream failed; the pipeline speaks a fallback instead.
    pub error: Option<String>,
}

impl LlmChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), ..Default::default() }
    }

    pub fn final_usage(input_tokens: u32, output_tokens: u32) -> Self {
        Self { is_final: true, input_tokens, output_tokens, ..Default::default() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { is_final: true, error: Some(message.into()), ..Default::default() }
    }
}

/// A completed tool call assembled from streamed fragments.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A chunk of synthesized audio from a TTS provider.
#[derive(Debug, Clone, Default)]
pub struct TtsChunk {
    pub audio: Vec<u8>,
    pub sample_rate: u32,
    pub is_final: bool,
}

/// Conversation message roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A conversation message for the LLM.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub tool_call_id: String,
    pub tool_calls: Vec<LlmToolCall>,
    /// Tool name, for tool-result messages.
    pub name: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: String::new(),
            tool_calls: Vec::new(),
            name: String::new(),
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: tool_call_id.into(),
            tool_calls: Vec::new(),
            name: name.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Provider traits
// ---------------------------------------------------------------------------

/// Streaming speech-to-text.
///
/// Lifecycle: `connect()`, feed audio with `send_audio()`, drain
/// `take_results()` (one receiver per session), `close()`.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn connect(&mut self) -> Result<(), ProviderError>;

    /// Send a chunk of audio in the provider's configured codec/rate.
    async fn send_audio(&self, audio: &[u8]) -> Result<(), ProviderError>;

    /// Take the result stream. Yields `None` after `connect()` has not run
    /// or the stream was already taken. The channel closes when the
    /// connection ends.
    fn take_results(&mut self) -> Option<mpsc::Receiver<SttResult>>;

    async fn close(&mut self);

    /// Expected input sample rate.
    fn sample_rate(&self) -> u32;

    /// Expected input codec.
    fn codec(&self) -> Codec;

    fn name(&self) -> &'static str;
}

/// Streaming large-language-model chat.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Stream a response. The returned channel yields text and tool-call
    /// chunks and ends with an `is_final` chunk carrying usage.
    async fn generate(
        &self,
        messages: Vec<Message>,
        tools: Option<Vec<Value>>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<mpsc::Receiver<LlmChunk>, ProviderError>;

    async fn close(&mut self) {}

    fn model(&self) -> &str;

    fn name(&self) -> &'static str;
}

/// Streaming text-to-speech.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn connect(&mut self) -> Result<(), ProviderError>;

    /// Synthesize one sentence. The returned channel yields audio chunks and
    /// closes when the sentence is done or its idle timeout lapses.
    async fn synthesize(&self, text: &str) -> Result<mpsc::Receiver<TtsChunk>, ProviderError>;

    /// Flush buffered audio at the end of an utterance.
    async fn flush(&self) -> Result<mpsc::Receiver<TtsChunk>, ProviderError>;

    async fn close(&mut self);

    /// Output sample rate.
    fn sample_rate(&self) -> u32;

    /// Output codec.
    fn codec(&self) -> Codec;

    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type SttFactory = Box<dyn Fn(&Value) -> Result<Box<dyn SpeechToText>, ProviderError> + Send + Sync>;
type LlmFactory = Box<dyn Fn(&Value) -> Result<Box<dyn LanguageModel>, ProviderError> + Send + Sync>;
type TtsFactory = Box<dyn Fn(&Value) -> Result<Box<dyn TextToSpeech>, ProviderError> + Send + Sync>;

/// Factory registry for AI providers, keyed by name. Built-ins are
/// registered up front; custom providers can be added before the bridge
/// starts.
pub struct ProviderRegistry {
    stt: HashMap<String, SttFactory>,
    llm: HashMap<String, LlmFactory>,
    tts: HashMap<String, TtsFactory>,
}

impl ProviderRegistry {
    pub fn with_builtins() -> Self {
        let mut registry =
            Self { stt: HashMap::new(), llm: HashMap::new(), tts: HashMap::new() };

        registry.register_stt("deepgram", |config| {
            Ok(Box::new(stt::deepgram::DeepgramStt::from_config(config)?))
        });
        registry.register_llm("openai", |config| {
            Ok(Box::new(llm::openai::OpenAiLlm::from_config(config)?))
        });
        registry.register_llm("anthropic", |config| {
            Ok(Box::new(llm::anthropic::AnthropicLlm::from_config(config)?))
        });
        registry.register_tts("elevenlabs", |config| {
            Ok(Box::new(tts::elevenlabs::ElevenLabsTts::from_config(config)?))
        });

        registry
    }

    pub fn register_stt(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(&Value) -> Result<Box<dyn SpeechToText>, ProviderError> + Send + Sync + 'static,
    ) {
        self.stt.insert(name.into(), Box::new(factory));
    }

    pub fn register_llm(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(&Value) -> Result<Box<dyn LanguageModel>, ProviderError> + Send + Sync + 'static,
    ) {
        self.llm.insert(name.into(), Box::new(factory));
    }

    pub fn register_tts(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(&Value) -> Result<Box<dyn TextToSpeech>, ProviderError> + Send + Sync + 'static,
    ) {
        self.tts.insert(name.into(), Box::new(factory));
    }

    pub fn create_stt(&self, name: &str, config: &Value) -> Result<Box<dyn SpeechToText>, ProviderError> {
        let factory = self.stt.get(name).ok_or_else(|| ProviderError::Unknown {
            kind: "stt",
            name: name.to_string(),
        })?;
        factory(config)
    }

    pub fn create_llm(&self, name: &str, config: &Value) -> Result<Box<dyn LanguageModel>, ProviderError> {
        let factory = self.llm.get(name).ok_or_else(|| ProviderError::Unknown {
            kind: "llm",
            name: name.to_string(),
        })?;
        factory(config)
    }

    pub fn create_tts(&self, name: &str, config: &Value) -> Result<Box<dyn TextToSpeech>, ProviderError> {
        let factory = self.tts.get(name).ok_or_else(|| ProviderError::Unknown {
            kind: "tts",
            name: name.to_string(),
        })?;
        factory(config)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Pull a required string out of a provider config value.
pub(crate) fn required_str(config: &Value, key: &str) -> Result<String, ProviderError> {
    config
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProviderError::Config(key.to_string()))
}

/// Pull an optional string with a default.
pub(crate) fn str_or(config: &Value, key: &str, default: &str) -> String {
    config
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

/// Pull an optional integer with a default.
pub(crate) fn u64_or(config: &Value, key: &str, default: u64) -> u64 {
    config.get(key).and_then(Value::as_u64).unwrap_or(default)
}
