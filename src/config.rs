//! Bridge configuration.
//!
//! Typed configuration with strict key checking: unrecognised keys are
//! rejected at every level (`deny_unknown_fields`), so a typo in a config
//! file fails at startup instead of silently defaulting. Loadable from a
//! JSON file, a `serde_json::Value`, or constructed in code.

use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

use crate::core::events::Codec;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Telephony provider side: which serializer to use and where to listen.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub provider_type: String,
    pub listen_host: String,
    pub listen_port: u16,
    pub listen_path: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_type: "twilio".into(),
            listen_host: "0.0.0.0".into(),
            listen_port: 8765,
            listen_path: "/media-stream".into(),
        }
    }
}

/// Voice bot side: the WebSocket endpoint dialed per call and the audio
/// format it speaks.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BotConfig {
    pub url: String,
    pub codec: Codec,
    pub sample_rate: u32,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:9000/ws".into(),
            codec: Codec::Pcm16,
            sample_rate: 16000,
        }
    }
}

/// Provider-side audio pipeline settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AudioConfig {
    pub input_codec: Codec,
    pub output_codec: Codec,
    pub sample_rate: u32,
    /// Inbound RMS at or above this arms barge-in detection.
    pub barge_in_rms_threshold: f32,
    /// Consecutive loud frames required before barge-in fires.
    pub barge_in_min_frames: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_codec: Codec::Mulaw,
            output_codec: Codec::Mulaw,
            sample_rate: 8000,
            barge_in_rms_threshold: 1000.0,
            barge_in_min_frames: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

/// One AI provider slot (STT, LLM, or TTS): a registered provider name plus
/// its free-form configuration (api_key, model, voice, ...).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipelineProviderConfig {
    pub provider: String,
    pub config: Value,
}

impl Default for PipelineProviderConfig {
    fn default() -> Self {
        Self { provider: String::new(), config: Value::Object(Default::default()) }
    }
}

impl PipelineProviderConfig {
    pub fn named(provider: &str) -> Self {
        Self { provider: provider.into(), ..Default::default() }
    }
}

/// Escalation detector settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EscalationConfig {
    pub keyword_triggers: Vec<String>,
    pub max_turns_before_escalation: u32,
    pub repeated_question_threshold: usize,
    pub transfer_number: String,
    pub transfer_message: String,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            keyword_triggers: [
                "speak to a human",
                "speak to an agent",
                "talk to a person",
                "talk to a human",
                "talk to an agent",
                "transfer me",
                "connect me to a person",
                "real person",
                "human agent",
                "representative",
                "operator",
                "supervisor",
                "manager",
                "let me speak to someone",
                "i want a human",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            max_turns_before_escalation: 15,
            repeated_question_threshold: 3,
            transfer_number: String::new(),
            transfer_message: "I'm transferring you to a human agent now. Please hold.".into(),
        }
    }
}

/// Built-in AI pipeline mode. When enabled the bridge runs the internal
/// STT -> LLM -> TTS chain instead of dialing `bot.url`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipelineConfig {
    pub enabled: bool,
    pub stt: PipelineProviderConfig,
    pub llm: PipelineProviderConfig,
    pub tts: PipelineProviderConfig,

    pub system_prompt: String,
    pub first_message: String,
    pub tools: Vec<Value>,
    pub end_call_phrases: Vec<String>,

    pub llm_temperature: f32,
    pub llm_max_tokens: u32,
    pub silence_threshold_ms: f64,
    pub interruption_enabled: bool,
    pub max_call_duration_seconds: u64,

    pub escalation_enabled: bool,
    pub escalation_config: EscalationConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            stt: PipelineProviderConfig::named("deepgram"),
            llm: PipelineProviderConfig::named("openai"),
            tts: PipelineProviderConfig::named("elevenlabs"),
            system_prompt: "You are a helpful AI assistant on a phone call. Be concise and conversational."
                .into(),
            first_message: String::new(),
            tools: Vec::new(),
            end_call_phrases: ["goodbye", "bye bye", "end the call", "hang up"]
                .into_iter()
                .map(String::from)
                .collect(),
            llm_temperature: 0.7,
            llm_max_tokens: 512,
            silence_threshold_ms: 700.0,
            interruption_enabled: true,
            max_call_duration_seconds: 1800,
            escalation_enabled: true,
            escalation_config: EscalationConfig::default(),
        }
    }
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BridgeConfig {
    pub provider: ProviderConfig,
    pub bot: BotConfig,
    pub audio: AudioConfig,
    pub logging: LoggingConfig,
    pub pipeline: PipelineConfig,
}

impl BridgeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Whether the bridge routes calls into the built-in AI pipeline.
    pub fn pipeline_mode(&self) -> bool {
        self.pipeline.enabled
    }
}
