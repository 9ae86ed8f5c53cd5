//! Genesys Cloud AudioHook serializer.
//!
//! Genesys mixes JSON control messages (`open`, `ping`, `close`, `dtmf`,
//! `pause`, `resume`) with raw binary mu-law frames on a single WebSocket.
//! Control messages echo the session id the provider assigned in `open`.
//!
//! Protocol reference:
//!     https://developer.genesys.cloud/devapps/audiohook

use serde_json::{json, Value};

use crate::core::events::{
    AudioFrame, CallEnded, CallStarted, Codec, CustomEvent, DtmfReceived, Event, HoldEnded,
    HoldStarted,
};
use crate::serializers::{
    parse_json_message, prefixed_headers, str_field, value_to_metadata, Serializer,
};
use crate::transports::WireMessage;

/// State: the AudioHook session id (echoed in every control message) and the
/// Genesys conversation id used as the call id.
pub struct GenesysSerializer {
    session_id: String,
    conversation_id: String,
}

impl GenesysSerializer {
    pub fn new() -> Self {
        Self { session_id: String::new(), conversation_id: String::new() }
    }

    fn handle_open(&mut self, msg: &Value) -> Vec<Event> {
        self.session_id = str_field(msg, "id");
        let empty = json!({});
        let params = msg.get("parameters").unwrap_or(&empty);
        self.conversation_id = str_field(params, "conversationId");

        let participant = params.get("participant").cloned().unwrap_or_else(|| json!({}));
        let sip_headers = prefixed_headers(&participant, &["sip_", "x-", "X-"]);

        let mut started = CallStarted::new(self.conversation_id.clone(), "genesys");
        started.sip_headers = sip_headers;
        started.metadata.insert("session_id".into(), json!(self.session_id));
        started
            .metadata
            .insert("organization_id".into(), json!(str_field(params, "organizationId")));
        started.metadata.insert("participant".into(), participant);
        started.metadata.insert(
            "position".into(),
            msg.get("position").cloned().unwrap_or_else(|| json!(0)),
        );
        vec![Event::CallStarted(started)]
    }

    /// Control message instructing Genesys to tear down the stream from the
    /// integration side.
    pub fn build_disconnect(&self, reason: &str) -> String {
        json!({
            "type": "disconnect",
            "id": self.session_id,
            "parameters": { "reason": reason },
        })
        .to_string()
    }
}

impl Default for GenesysSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer for GenesysSerializer {
    fn name(&self) -> &'static str {
        "genesys"
    }

    fn native_codec(&self) -> Codec {
        Codec::Mulaw
    }

    fn native_sample_rate(&self) -> u32 {
        8000
    }

    fn deserialize(&mut self, raw: &WireMessage) -> Vec<Event> {
        // Binary frames are raw mu-law audio.
        if let WireMessage::Binary(data) = raw {
            return vec![Event::AudioFrame(AudioFrame::new(
                self.conversation_id.clone(),
                Codec::Mulaw,
                8000,
                data.clone(),
            ))];
        }

        let msg = match parse_json_message(raw, &self.conversation_id) {
            Ok(msg) => msg,
            Err(err_event) => return vec![err_event],
        };
        let empty = json!({});
        let params = msg.get("parameters").unwrap_or(&empty);

        match str_field(&msg, "type").as_str() {
            "open" => self.handle_open(&msg),
            // Keepalive, answered via handshake_response.
            "ping" => vec![],
            "close" => {
                let reason = match params.get("reason").and_then(Value::as_str) {
                    Some(r) => r.to_string(),
                    None => "normal".to_string(),
                };
                vec![Event::CallEnded(CallEnded::new(self.conversation_id.clone(), reason))]
            }
            "dtmf" => vec![Event::DtmfReceived(DtmfReceived::new(
                self.conversation_id.clone(),
                str_field(params, "digit"),
            ))],
            "pause" => vec![Event::HoldStarted(HoldStarted::new(self.conversation_id.clone()))],
            "resume" => vec![Event::HoldEnded(HoldEnded::new(self.conversation_id.clone()))],
            other => vec![Event::Custom(CustomEvent::new(
                self.conversation_id.clone(),
                format!("genesys.{other}"),
                value_to_metadata(&msg),
            ))],
        }
    }

    fn serialize(&mut self, event: &Event) -> Option<WireMessage> {
        match event {
            // Genesys expects raw binary audio on the wire.
            Event::AudioFrame(frame) => Some(WireMessage::Binary(frame.data.clone())),
            Event::ClearAudio(_) => Some(WireMessage::Text(
                json!({ "type": "discardAudio", "id": self.session_id }).to_string(),
            )),
            Event::Mark(mark) => Some(WireMessage::Text(
                json!({
                    "type": "position",
                    "id": self.session_id,
                    "parameters": { "name": mark.name },
                })
                .to_string(),
            )),
            _ => None,
        }
    }

    fn handshake_response(&mut self, msg: &Value) -> Option<String> {
        let msg_id = match msg.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => self.session_id.clone(),
        };

        match str_field(msg, "type").as_str() {
            "open" => {
                self.session_id = msg_id.clone();
                if let Some(params) = msg.get("parameters") {
                    self.conversation_id = str_field(params, "conversationId");
                }
                Some(
                    json!({
                        "type": "opened",
                        "id": msg_id,
                        "parameters": {
                            "startPaused": false,
                            "media": [{
                                "type": "audio",
                                "format": "PCMU",
                                "channels": ["external"],
                                "rate": 8000,
                            }],
                        },
                    })
                    .to_string(),
                )
            }
            "ping" => Some(json!({ "type": "pong", "id": msg_id }).to_string()),
            "close" => Some(json!({ "type": "closed", "id": msg_id }).to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_message() -> Value {
        json!({
            "type": "open",
            "id": "S1",
            "parameters": {
                "conversationId": "C1",
                "organizationId": "O1"
            }
        })
    }

    #[test]
    fn test_open_handshake_exact_response() {
        let mut s = GenesysSerializer::new();
        let response = s.handshake_response(&open_message()).unwrap();
        let parsed: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(
            parsed,
            json!({
                "type": "opened",
                "id": "S1",
                "parameters": {
                    "startPaused": false,
                    "media": [{
                        "type": "audio",
                        "format": "PCMU",
                        "channels": ["external"],
                        "rate": 8000
                    }]
                }
            })
        );
    }

    #[test]
    fn test_open_produces_call_started() {
        let mut s = GenesysSerializer::new();
        let events = s.deserialize(&WireMessage::Text(open_message().to_string()));
        match &events[0] {
            Event::CallStarted(e) => {
                assert_eq!(e.call_id, "C1");
                assert_eq!(e.provider, "genesys");
                assert_eq!(e.metadata["session_id"], json!("S1"));
                assert_eq!(e.metadata["organization_id"], json!("O1"));
            }
            other => panic!("expected CallStarted, got {other:?}"),
        }
    }

    #[test]
    fn test_sip_headers_from_participant() {
        let mut s = GenesysSerializer::new();
        let msg = json!({
            "type": "open",
            "id": "S1",
            "parameters": {
                "conversationId": "C1",
                "participant": {
                    "sip_call_id": "abc",
                    "X-Account": "42",
                    "name": "ignored"
                }
            }
        });
        let events = s.deserialize(&WireMessage::Text(msg.to_string()));
        match &events[0] {
            Event::CallStarted(e) => {
                assert_eq!(e.sip_headers["sip_call_id"], "abc");
                assert_eq!(e.sip_headers["X-Account"], "42");
                assert!(!e.sip_headers.contains_key("name"));
            }
            other => panic!("expected CallStarted, got {other:?}"),
        }
    }

    #[test]
    fn test_ping_pong() {
        let mut s = GenesysSerializer::new();
        s.handshake_response(&open_message());

        let ping = json!({"type": "ping", "id": "S1"});
        assert!(s.deserialize(&WireMessage::Text(ping.to_string())).is_empty());
        let pong: Value = serde_json::from_str(&s.handshake_response(&ping).unwrap()).unwrap();
        assert_eq!(pong, json!({"type": "pong", "id": "S1"}));
    }

    #[test]
    fn test_binary_audio_and_passthrough() {
        let mut s = GenesysSerializer::new();
        s.handshake_response(&open_message());

        let events = s.deserialize(&WireMessage::Binary(vec![1, 2, 3]));
        match &events[0] {
            Event::AudioFrame(f) => {
                assert_eq!(f.call_id, "C1");
                assert_eq!(f.codec, Codec::Mulaw);

                // Outbound audio stays raw binary, byte-for-byte.
                let wire = s.serialize(&Event::AudioFrame(f.clone())).unwrap();
                assert_eq!(wire, WireMessage::Binary(vec![1, 2, 3]));
            }
            other => panic!("expected AudioFrame, got {other:?}"),
        }
    }

    #[test]
    fn test_pause_resume_close() {
        let mut s = GenesysSerializer::new();
        s.handshake_response(&open_message());

        let events = s.deserialize(&WireMessage::Text(json!({"type": "pause"}).to_string()));
        assert!(matches!(events[0], Event::HoldStarted(_)));

        let events = s.deserialize(&WireMessage::Text(json!({"type": "resume"}).to_string()));
        assert!(matches!(events[0], Event::HoldEnded(_)));

        let events = s.deserialize(&WireMessage::Text(
            json!({"type": "close", "parameters": {"reason": "end"}}).to_string(),
        ));
        assert!(matches!(&events[0], Event::CallEnded(e) if e.reason == "end"));
    }

    #[test]
    fn test_clear_and_mark_messages() {
        let mut s = GenesysSerializer::new();
        s.handshake_response(&open_message());

        let wire = s
            .serialize(&Event::ClearAudio(crate::core::events::ClearAudio::new("C1")))
            .unwrap();
        let parsed: Value = serde_json::from_str(wire.as_text().unwrap()).unwrap();
        assert_eq!(parsed, json!({"type": "discardAudio", "id": "S1"}));

        let wire = s
            .serialize(&Event::Mark(crate::core::events::Mark::new("C1", "m1")))
            .unwrap();
        let parsed: Value = serde_json::from_str(wire.as_text().unwrap()).unwrap();
        assert_eq!(parsed, json!({"type": "position", "id": "S1", "parameters": {"name": "m1"}}));
    }

    #[test]
    fn test_unknown_type_becomes_custom() {
        let mut s = GenesysSerializer::new();
        let events =
            s.deserialize(&WireMessage::Text(json!({"type": "playback.report"}).to_string()));
        assert!(matches!(&events[0], Event::Custom(e) if e.custom_type == "genesys.playback.report"));
    }

    #[test]
    fn test_build_disconnect() {
        let mut s = GenesysSerializer::new();
        s.handshake_response(&open_message());
        let parsed: Value = serde_json::from_str(&s.build_disconnect("normal")).unwrap();
        assert_eq!(
            parsed,
            json!({"type": "disconnect", "id": "S1", "parameters": {"reason": "normal"}})
        );
    }
}
