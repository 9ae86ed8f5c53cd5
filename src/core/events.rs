//! Unified event model.
//!
//! Every telephony serializer converts its platform-specific messages into
//! these canonical events, and the bridge orchestrator routes events between
//! the provider and bot sides using this common language. The event set is
//! closed: anything a provider sends that has no mapping becomes a
//! [`CustomEvent`].

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Process-monotonic anchor for event timestamps.
static CLOCK_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic seconds since process start. Used for every event timestamp.
pub fn monotonic_secs() -> f64 {
    CLOCK_START.elapsed().as_secs_f64()
}

/// Audio codecs the bridge can carry. PCM16 (little-endian mono) is the
/// canonical intermediate all conversions route through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Mulaw,
    Alaw,
    Pcm16,
    Opus,
}

impl Codec {
    pub const ALL: [Codec; 4] = [Codec::Mulaw, Codec::Alaw, Codec::Pcm16, Codec::Opus];

    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::Mulaw => "mulaw",
            Codec::Alaw => "alaw",
            Codec::Pcm16 => "pcm16",
            Codec::Opus => "opus",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mulaw" => Ok(Codec::Mulaw),
            "alaw" => Ok(Codec::Alaw),
            "pcm16" => Ok(Codec::Pcm16),
            "opus" => Ok(Codec::Opus),
            other => Err(format!("unknown codec: {other}")),
        }
    }
}

/// Call direction as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    #[default]
    Inbound,
    Outbound,
}

/// Blind vs attended transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    #[default]
    Blind,
    Attended,
}

impl TransferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferType::Blind => "blind",
            TransferType::Attended => "attended",
        }
    }
}

impl FromStr for TransferType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blind" => Ok(TransferType::Blind),
            "attended" => Ok(TransferType::Attended),
            other => Err(format!("unknown transfer type: {other}")),
        }
    }
}

/// Free-form provider metadata attached to events.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A chunk of audio flowing through the bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub call_id: String,
    pub timestamp: f64,
    pub codec: Codec,
    pub sample_rate: u32,
    pub channels: u16,
    pub data: Vec<u8>,
}

impl AudioFrame {
    pub fn new(call_id: impl Into<String>, codec: Codec, sample_rate: u32, data: Vec<u8>) -> Self {
        Self {
            call_id: call_id.into(),
            timestamp: monotonic_secs(),
            codec,
            sample_rate,
            channels: 1,
            data,
        }
    }
}

/// Fired when a new call is established.
#[derive(Debug, Clone, Default)]
pub struct CallStarted {
    pub call_id: String,
    pub timestamp: f64,
    pub from_number: String,
    pub to_number: String,
    pub provider: String,
    pub direction: CallDirection,
    /// Custom SIP headers surfaced by the provider.
    pub sip_headers: std::collections::HashMap<String, String>,
    pub metadata: Metadata,
}

impl CallStarted {
    pub fn new(call_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            timestamp: monotonic_secs(),
            provider: provider.into(),
            ..Default::default()
        }
    }
}

/// Fired when a call terminates.
#[derive(Debug, Clone)]
pub struct CallEnded {
    pub call_id: String,
    pub timestamp: f64,
    pub reason: String,
    pub duration_ms: u64,
}

impl CallEnded {
    pub fn new(call_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            timestamp: monotonic_secs(),
            reason: reason.into(),
            duration_ms: 0,
        }
    }
}

/// Fired when a DTMF tone is detected.
#[derive(Debug, Clone)]
pub struct DtmfReceived {
    pub call_id: String,
    pub timestamp: f64,
    pub digit: String,
    pub duration_ms: u64,
}

impl DtmfReceived {
    pub fn new(call_id: impl Into<String>, digit: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            timestamp: monotonic_secs(),
            digit: digit.into(),
            duration_ms: 250,
        }
    }
}

/// Fired when the call is placed on hold.
#[derive(Debug, Clone)]
pub struct HoldStarted {
    pub call_id: String,
    pub timestamp: f64,
}

impl HoldStarted {
    pub fn new(call_id: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), timestamp: monotonic_secs() }
    }
}

/// Fired when the call is taken off hold.
#[derive(Debug, Clone)]
pub struct HoldEnded {
    pub call_id: String,
    pub timestamp: f64,
}

impl HoldEnded {
    pub fn new(call_id: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), timestamp: monotonic_secs() }
    }
}

/// Fired when a call transfer is requested.
#[derive(Debug, Clone)]
pub struct TransferRequested {
    pub call_id: String,
    pub timestamp: f64,
    pub target: String,
    pub transfer_type: TransferType,
    pub metadata: Metadata,
}

impl TransferRequested {
    pub fn new(call_id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            timestamp: monotonic_secs(),
            target: target.into(),
            transfer_type: TransferType::Blind,
            metadata: Metadata::new(),
        }
    }
}

/// Fired when the caller interrupts bot playback.
///
/// On detection the bridge clears queued outbound audio, tells the provider
/// to flush its playback buffer, and notifies the bot to cancel TTS.
#[derive(Debug, Clone)]
pub struct BargeIn {
    pub call_id: String,
    pub timestamp: f64,
    /// RMS energy of the interrupting audio.
    pub audio_energy: f32,
}

impl BargeIn {
    pub fn new(call_id: impl Into<String>, audio_energy: f32) -> Self {
        Self { call_id: call_id.into(), timestamp: monotonic_secs(), audio_energy }
    }
}

/// Control event: instruct the provider to flush queued outbound audio.
#[derive(Debug, Clone)]
pub struct ClearAudio {
    pub call_id: String,
    pub timestamp: f64,
}

impl ClearAudio {
    pub fn new(call_id: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), timestamp: monotonic_secs() }
    }
}

/// Marker for tracking playback progress.
///
/// The bot sends a mark, it flows through the provider, and when the provider
/// reports playback the bridge fires this event back so the bot knows audio
/// up to that point has reached the caller.
#[derive(Debug, Clone)]
pub struct Mark {
    pub call_id: String,
    pub timestamp: f64,
    pub name: String,
}

impl Mark {
    pub fn new(call_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), timestamp: monotonic_secs(), name: name.into() }
    }
}

/// Provider-specific events with no standard mapping.
#[derive(Debug, Clone)]
pub struct CustomEvent {
    pub call_id: String,
    pub timestamp: f64,
    /// `<provider>.<wire message type>`
    pub custom_type: String,
    pub payload: Metadata,
}

impl CustomEvent {
    pub fn new(call_id: impl Into<String>, custom_type: impl Into<String>, payload: Metadata) -> Self {
        Self {
            call_id: call_id.into(),
            timestamp: monotonic_secs(),
            custom_type: custom_type.into(),
            payload,
        }
    }
}

/// Error signaling on the event stream.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub call_id: String,
    pub timestamp: f64,
    pub code: String,
    pub message: String,
    pub recoverable: bool,
}

impl ErrorEvent {
    pub fn recoverable(call_id: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            timestamp: monotonic_secs(),
            code: code.into(),
            message: message.into(),
            recoverable: true,
        }
    }
}

/// The closed event sum type. Serializers emit these; the orchestrator
/// dispatches on them exhaustively. Events are immutable once emitted; a
/// handler that rewrites an audio frame produces a new frame.
#[derive(Debug, Clone)]
pub enum Event {
    AudioFrame(AudioFrame),
    CallStarted(CallStarted),
    CallEnded(CallEnded),
    DtmfReceived(DtmfReceived),
    HoldStarted(HoldStarted),
    HoldEnded(HoldEnded),
    TransferRequested(TransferRequested),
    BargeIn(BargeIn),
    ClearAudio(ClearAudio),
    Mark(Mark),
    Custom(CustomEvent),
    Error(ErrorEvent),
}

impl Event {
    pub fn call_id(&self) -> &str {
        match self {
            Event::AudioFrame(e) => &e.call_id,
            Event::CallStarted(e) => &e.call_id,
            Event::CallEnded(e) => &e.call_id,
            Event::DtmfReceived(e) => &e.call_id,
            Event::HoldStarted(e) => &e.call_id,
            Event::HoldEnded(e) => &e.call_id,
            Event::TransferRequested(e) => &e.call_id,
            Event::BargeIn(e) => &e.call_id,
            Event::ClearAudio(e) => &e.call_id,
            Event::Mark(e) => &e.call_id,
            Event::Custom(e) => &e.call_id,
            Event::Error(e) => &e.call_id,
        }
    }

    pub fn timestamp(&self) -> f64 {
        match self {
            Event::AudioFrame(e) => e.timestamp,
            Event::CallStarted(e) => e.timestamp,
            Event::CallEnded(e) => e.timestamp,
            Event::DtmfReceived(e) => e.timestamp,
            Event::HoldStarted(e) => e.timestamp,
            Event::HoldEnded(e) => e.timestamp,
            Event::TransferRequested(e) => e.timestamp,
            Event::BargeIn(e) => e.timestamp,
            Event::ClearAudio(e) => e.timestamp,
            Event::Mark(e) => e.timestamp,
            Event::Custom(e) => e.timestamp,
            Event::Error(e) => e.timestamp,
        }
    }

    /// Stable tag used for logging and registry keys.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::AudioFrame(_) => "audio_frame",
            Event::CallStarted(_) => "call_started",
            Event::CallEnded(_) => "call_ended",
            Event::DtmfReceived(_) => "dtmf_received",
            Event::HoldStarted(_) => "hold_started",
            Event::HoldEnded(_) => "hold_ended",
            Event::TransferRequested(_) => "transfer_requested",
            Event::BargeIn(_) => "barge_in",
            Event::ClearAudio(_) => "clear_audio",
            Event::Mark(_) => "mark",
            Event::Custom(_) => "custom",
            Event::Error(_) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_parse_roundtrip() {
        for codec in Codec::ALL {
            assert_eq!(codec.as_str().parse::<Codec>().unwrap(), codec);
        }
        assert!("g729".parse::<Codec>().is_err());
    }

    #[test]
    fn test_monotonic_timestamps_increase() {
        let a = monotonic_secs();
        let b = monotonic_secs();
        assert!(b >= a);
    }

    #[test]
    fn test_event_accessors() {
        let frame = AudioFrame::new("call-1", Codec::Mulaw, 8000, vec![0x7f]);
        let event = Event::AudioFrame(frame);
        assert_eq!(event.call_id(), "call-1");
        assert_eq!(event.kind(), "audio_frame");
        assert!(event.timestamp() >= 0.0);
    }

    #[test]
    fn test_dtmf_default_duration() {
        let dtmf = DtmfReceived::new("c", "5");
        assert_eq!(dtmf.duration_ms, 250);
    }
}
