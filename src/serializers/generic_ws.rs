//! Generic WebSocket serializer.
//!
//! A minimal, configurable protocol for custom integrations: binary frames
//! carry raw audio in the configured codec/rate, JSON messages carry
//! `start`/`audio`/`dtmf`/`stop` control. Useful as a starting point for
//! bots that already speak a simple WebSocket protocol.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::core::events::{
    AudioFrame, CallEnded, CallStarted, Codec, CustomEvent, DtmfReceived, Event, Metadata,
};
use crate::serializers::{parse_json_message, str_field, u64_field, value_to_metadata, Serializer};
use crate::transports::WireMessage;

/// Codec and sample rate are chosen at construction; the only wire state is
/// the call id from `start`.
pub struct GenericWsSerializer {
    codec: Codec,
    sample_rate: u32,
    call_id: String,
}

impl GenericWsSerializer {
    pub fn new(codec: Codec, sample_rate: u32) -> Self {
        Self { codec, sample_rate, call_id: String::new() }
    }
}

impl Default for GenericWsSerializer {
    fn default() -> Self {
        Self::new(Codec::Pcm16, 16000)
    }
}

impl Serializer for GenericWsSerializer {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn native_codec(&self) -> Codec {
        self.codec
    }

    fn native_sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn deserialize(&mut self, raw: &WireMessage) -> Vec<Event> {
        if let WireMessage::Binary(data) = raw {
            return vec![Event::AudioFrame(AudioFrame::new(
                self.call_id.clone(),
                self.codec,
                self.sample_rate,
                data.clone(),
            ))];
        }

        let msg = match parse_json_message(raw, &self.call_id) {
            Ok(msg) => msg,
            Err(err_event) => return vec![err_event],
        };

        match str_field(&msg, "type").as_str() {
            "start" => {
                let id = str_field(&msg, "call_id");
                self.call_id = if id.is_empty() { Uuid::new_v4().to_string() } else { id };

                let mut started = CallStarted::new(self.call_id.clone(), "generic");
                started.from_number = str_field(&msg, "from");
                started.to_number = str_field(&msg, "to");
                started.metadata = msg
                    .get("metadata")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_else(Metadata::new);
                vec![Event::CallStarted(started)]
            }
            "audio" => {
                let data = msg
                    .get("data")
                    .and_then(Value::as_str)
                    .and_then(|b64| BASE64.decode(b64).ok())
                    .unwrap_or_default();
                let codec = msg
                    .get("codec")
                    .and_then(Value::as_str)
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(self.codec);
                let mut frame = AudioFrame::new(
                    self.call_id.clone(),
                    codec,
                    u64_field(&msg, "sample_rate", self.sample_rate as u64) as u32,
                    data,
                );
                frame.channels = u64_field(&msg, "channels", 1) as u16;
                vec![Event::AudioFrame(frame)]
            }
            "dtmf" => {
                let mut dtmf = DtmfReceived::new(self.call_id.clone(), str_field(&msg, "digit"));
                dtmf.duration_ms = u64_field(&msg, "duration_ms", 250);
                vec![Event::DtmfReceived(dtmf)]
            }
            "stop" => {
                let reason = match msg.get("reason").and_then(Value::as_str) {
                    Some(r) => r.to_string(),
                    None => "normal".to_string(),
                };
                vec![Event::CallEnded(CallEnded::new(self.call_id.clone(), reason))]
            }
            other => vec![Event::Custom(CustomEvent::new(
                self.call_id.clone(),
                format!("generic.{other}"),
                value_to_metadata(&msg),
            ))],
        }
    }

    fn serialize(&mut self, event: &Event) -> Option<WireMessage> {
        match event {
            Event::AudioFrame(frame) => Some(WireMessage::Binary(frame.data.clone())),
            Event::CallStarted(started) => Some(WireMessage::Text(
                json!({
                    "type": "start",
                    "call_id": started.call_id,
                    "from": started.from_number,
                    "to": started.to_number,
                    "provider": started.provider,
                    "metadata": started.metadata,
                })
                .to_string(),
            )),
            Event::CallEnded(ended) => Some(WireMessage::Text(
                json!({
                    "type": "stop",
                    "call_id": ended.call_id,
                    "reason": ended.reason,
                })
                .to_string(),
            )),
            Event::DtmfReceived(dtmf) => Some(WireMessage::Text(
                json!({
                    "type": "dtmf",
                    "call_id": dtmf.call_id,
                    "digit": dtmf.digit,
                })
                .to_string(),
            )),
            _ => None,
        }
    }

    fn handshake_response(&mut self, _msg: &Value) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_with_and_without_call_id() {
        let mut s = GenericWsSerializer::default();
        let events = s.deserialize(&WireMessage::Text(
            json!({"type": "start", "call_id": "g1", "from": "a", "to": "b"}).to_string(),
        ));
        assert!(matches!(&events[0], Event::CallStarted(e) if e.call_id == "g1"));

        let mut s = GenericWsSerializer::default();
        let events = s.deserialize(&WireMessage::Text(json!({"type": "start"}).to_string()));
        match &events[0] {
            Event::CallStarted(e) => assert!(!e.call_id.is_empty(), "call id should be generated"),
            other => panic!("expected CallStarted, got {other:?}"),
        }
    }

    #[test]
    fn test_binary_uses_configured_format() {
        let mut s = GenericWsSerializer::new(Codec::Alaw, 48000);
        let events = s.deserialize(&WireMessage::Binary(vec![1, 2]));
        match &events[0] {
            Event::AudioFrame(f) => {
                assert_eq!(f.codec, Codec::Alaw);
                assert_eq!(f.sample_rate, 48000);
            }
            other => panic!("expected AudioFrame, got {other:?}"),
        }
    }

    #[test]
    fn test_json_audio_base64_and_overrides() {
        let mut s = GenericWsSerializer::default();
        s.deserialize(&WireMessage::Text(json!({"type": "start", "call_id": "g1"}).to_string()));

        let events = s.deserialize(&WireMessage::Text(
            json!({
                "type": "audio",
                "data": BASE64.encode([0u8, 1, 2, 3]),
                "codec": "mulaw",
                "sample_rate": 8000
            })
            .to_string(),
        ));
        match &events[0] {
            Event::AudioFrame(f) => {
                assert_eq!(f.data, vec![0, 1, 2, 3]);
                assert_eq!(f.codec, Codec::Mulaw);
                assert_eq!(f.sample_rate, 8000);
            }
            other => panic!("expected AudioFrame, got {other:?}"),
        }
    }

    #[test]
    fn test_control_roundtrip() {
        let mut s = GenericWsSerializer::default();
        s.deserialize(&WireMessage::Text(json!({"type": "start", "call_id": "g1"}).to_string()));

        // dtmf out -> back in keeps the digit.
        let wire = s
            .serialize(&Event::DtmfReceived(DtmfReceived::new("g1", "7")))
            .unwrap();
        let events = s.deserialize(&WireMessage::Text(wire.as_text().unwrap().to_string()));
        assert!(matches!(&events[0], Event::DtmfReceived(e) if e.digit == "7"));

        // stop out -> back in keeps the reason.
        let wire = s
            .serialize(&Event::CallEnded(CallEnded::new("g1", "bot_done")))
            .unwrap();
        let events = s.deserialize(&WireMessage::Text(wire.as_text().unwrap().to_string()));
        assert!(matches!(&events[0], Event::CallEnded(e) if e.reason == "bot_done"));
    }

    #[test]
    fn test_unknown_type_becomes_custom() {
        let mut s = GenericWsSerializer::default();
        let events = s.deserialize(&WireMessage::Text(json!({"type": "metrics"}).to_string()));
        assert!(matches!(&events[0], Event::Custom(e) if e.custom_type == "generic.metrics"));
    }
}
