//! VoxBridge: real-time telephony-to-voice-bot bridge.
//!
//! Accepts WebSocket connections from telephony providers (Twilio, Genesys,
//! Asterisk, FreeSWITCH, Amazon Connect, Avaya, Cisco, or a generic
//! protocol), converts each provider's wire format to a unified event model,
//! transcodes audio in both directions, and multiplexes the stream either to
//! an external voice-bot WebSocket or to the built-in STT -> LLM -> TTS
//! pipeline.
//!
//! Design principles:
//! - Serializers are pure translators; all I/O lives in the transports
//! - Message passing via Tokio channels between per-call tasks
//! - Codec conversion routes through PCM16 with table-driven G.711
//! - Per-call state is never shared across calls

pub mod audio;
pub mod bridge;
pub mod config;
pub mod core;
pub mod error;
pub mod pipeline;
pub mod providers;
pub mod serializers;
pub mod session;
pub mod transports;

pub use crate::bridge::VoxBridge;
pub use crate::config::BridgeConfig;
pub use crate::core::events::{Codec, Event};
pub use crate::error::BridgeError;
pub use crate::session::{CallSession, SessionStore};
