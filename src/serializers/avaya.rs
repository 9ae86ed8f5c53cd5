//! Avaya OCSAPI serializer.
//!
//! Avaya uses dotted JSON control types (`session.start`, `session.end`,
//! `dtmf`, `hold`, `unhold`, `transfer.request`) and raw binary mu-law
//! frames at 8 kHz. Outbound control messages are keyed by the session id
//! assigned in `session.start`.

use serde_json::{json, Value};

use crate::core::events::{
    AudioFrame, CallEnded, CallStarted, Codec, CustomEvent, DtmfReceived, Event, HoldEnded,
    HoldStarted, TransferRequested, TransferType,
};
use crate::serializers::{
    parse_json_message, prefixed_headers, str_field, u64_field, value_to_metadata, Serializer,
};
use crate::transports::WireMessage;

/// State: the Avaya session id and the call id it carries.
pub struct AvayaSerializer {
    session_id: String,
    call_id: String,
}

impl AvayaSerializer {
    pub fn new() -> Self {
        Self { session_id: String::new(), call_id: String::new() }
    }

    fn handle_session_start(&mut self, msg: &Value) -> Vec<Event> {
        self.session_id = str_field(msg, "sessionId");
        self.call_id = {
            let id = str_field(msg, "callId");
            if id.is_empty() { self.session_id.clone() } else { id }
        };

        let empty = json!({});
        let params = msg.get("parameters").unwrap_or(&empty);
        let sip_headers = prefixed_headers(params, &["sip_", "x-", "X-"]);

        let mut started = CallStarted::new(self.call_id.clone(), "avaya");
        started.from_number = str_field(params, "callerNumber");
        started.to_number = str_field(params, "calledNumber");
        started.sip_headers = sip_headers;
        started.metadata.insert("session_id".into(), json!(self.session_id));
        started.metadata.insert("ucid".into(), json!(str_field(params, "ucid")));
        started
            .metadata
            .insert("station_extension".into(), json!(str_field(params, "stationExtension")));
        vec![Event::CallStarted(started)]
    }
}

impl Default for AvayaSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer for AvayaSerializer {
    fn name(&self) -> &'static str {
        "avaya"
    }

    fn native_codec(&self) -> Codec {
        Codec::Mulaw
    }

    fn native_sample_rate(&self) -> u32 {
        8000
    }

    fn deserialize(&mut self, raw: &WireMessage) -> Vec<Event> {
        if let WireMessage::Binary(data) = raw {
            return vec![Event::AudioFrame(AudioFrame::new(
                self.call_id.clone(),
                Codec::Mulaw,
                8000,
                data.clone(),
            ))];
        }

        let msg = match parse_json_message(raw, &self.call_id) {
            Ok(msg) => msg,
            Err(err_event) => return vec![err_event],
        };

        match str_field(&msg, "type").as_str() {
            "session.start" => self.handle_session_start(&msg),
            "session.end" => {
                let reason = match msg.get("reason").and_then(Value::as_str) {
                    Some(r) => r.to_string(),
                    None => "normal".to_string(),
                };
                vec![Event::CallEnded(CallEnded::new(self.call_id.clone(), reason))]
            }
            "dtmf" => {
                let mut dtmf = DtmfReceived::new(self.call_id.clone(), str_field(&msg, "digit"));
                dtmf.duration_ms = u64_field(&msg, "duration", 250);
                vec![Event::DtmfReceived(dtmf)]
            }
            "hold" => vec![Event::HoldStarted(HoldStarted::new(self.call_id.clone()))],
            "unhold" => vec![Event::HoldEnded(HoldEnded::new(self.call_id.clone()))],
            "transfer.request" => {
                let mut transfer =
                    TransferRequested::new(self.call_id.clone(), str_field(&msg, "target"));
                transfer.transfer_type = str_field(&msg, "transferType")
                    .parse()
                    .unwrap_or(TransferType::Blind);
                vec![Event::TransferRequested(transfer)]
            }
            other => vec![Event::Custom(CustomEvent::new(
                self.call_id.clone(),
                format!("avaya.{other}"),
                value_to_metadata(&msg),
            ))],
        }
    }

    fn serialize(&mut self, event: &Event) -> Option<WireMessage> {
        match event {
            Event::AudioFrame(frame) => Some(WireMessage::Binary(frame.data.clone())),
            Event::CallEnded(ended) => Some(WireMessage::Text(
                json!({
                    "type": "session.end",
                    "sessionId": self.session_id,
                    "reason": ended.reason,
                })
                .to_string(),
            )),
            Event::ClearAudio(_) => Some(WireMessage::Text(
                json!({ "type": "audio.clear", "sessionId": self.session_id }).to_string(),
            )),
            Event::Mark(mark) => Some(WireMessage::Text(
                json!({
                    "type": "audio.mark",
                    "sessionId": self.session_id,
                    "name": mark.name,
                })
                .to_string(),
            )),
            Event::TransferRequested(transfer) => Some(WireMessage::Text(
                json!({
                    "type": "transfer.initiate",
                    "sessionId": self.session_id,
                    "target": transfer.target,
                    "transferType": transfer.transfer_type.as_str(),
                })
                .to_string(),
            )),
            _ => None,
        }
    }

    fn handshake_response(&mut self, msg: &Value) -> Option<String> {
        if str_field(msg, "type") == "session.start" {
            self.session_id = str_field(msg, "sessionId");
            let call_id = str_field(msg, "callId");
            self.call_id = if call_id.is_empty() { self.session_id.clone() } else { call_id };
            return Some(
                json!({
                    "type": "session.accepted",
                    "sessionId": self.session_id,
                    "parameters": {
                        "media": { "format": "PCMU", "rate": 8000, "channels": 1 }
                    },
                })
                .to_string(),
            );
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_start() -> Value {
        json!({
            "type": "session.start",
            "sessionId": "av-sess-1",
            "callId": "av-call-1",
            "parameters": {
                "callerNumber": "+15550001",
                "calledNumber": "+15550002",
                "ucid": "UCID-9",
                "stationExtension": "4001",
                "x-division": "west"
            }
        })
    }

    #[test]
    fn test_session_start() {
        let mut s = AvayaSerializer::new();
        let events = s.deserialize(&WireMessage::Text(session_start().to_string()));
        match &events[0] {
            Event::CallStarted(e) => {
                assert_eq!(e.call_id, "av-call-1");
                assert_eq!(e.from_number, "+15550001");
                assert_eq!(e.sip_headers["x-division"], "west");
                assert_eq!(e.metadata["ucid"], json!("UCID-9"));
                assert_eq!(e.metadata["session_id"], json!("av-sess-1"));
            }
            other => panic!("expected CallStarted, got {other:?}"),
        }
    }

    #[test]
    fn test_handshake_session_accepted() {
        let mut s = AvayaSerializer::new();
        let response = s.handshake_response(&session_start()).unwrap();
        let parsed: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(
            parsed,
            json!({
                "type": "session.accepted",
                "sessionId": "av-sess-1",
                "parameters": {"media": {"format": "PCMU", "rate": 8000, "channels": 1}}
            })
        );
    }

    #[test]
    fn test_transfer_request_roundtrip() {
        let mut s = AvayaSerializer::new();
        s.deserialize(&WireMessage::Text(session_start().to_string()));

        let events = s.deserialize(&WireMessage::Text(
            json!({"type": "transfer.request", "target": "+15559999", "transferType": "attended"})
                .to_string(),
        ));
        let transfer = match &events[0] {
            Event::TransferRequested(t) => t.clone(),
            other => panic!("expected TransferRequested, got {other:?}"),
        };
        assert_eq!(transfer.transfer_type, TransferType::Attended);

        let wire = s.serialize(&Event::TransferRequested(transfer)).unwrap();
        let parsed: Value = serde_json::from_str(wire.as_text().unwrap()).unwrap();
        assert_eq!(
            parsed,
            json!({
                "type": "transfer.initiate",
                "sessionId": "av-sess-1",
                "target": "+15559999",
                "transferType": "attended"
            })
        );
    }

    #[test]
    fn test_holds_and_session_end() {
        let mut s = AvayaSerializer::new();
        s.deserialize(&WireMessage::Text(session_start().to_string()));

        let events = s.deserialize(&WireMessage::Text(json!({"type": "hold"}).to_string()));
        assert!(matches!(events[0], Event::HoldStarted(_)));

        let events = s.deserialize(&WireMessage::Text(json!({"type": "unhold"}).to_string()));
        assert!(matches!(events[0], Event::HoldEnded(_)));

        let events = s.deserialize(&WireMessage::Text(
            json!({"type": "session.end", "reason": "far_end"}).to_string(),
        ));
        assert!(matches!(&events[0], Event::CallEnded(e) if e.reason == "far_end"));
    }

    #[test]
    fn test_clear_and_mark() {
        let mut s = AvayaSerializer::new();
        s.deserialize(&WireMessage::Text(session_start().to_string()));

        let wire = s
            .serialize(&Event::ClearAudio(crate::core::events::ClearAudio::new("av-call-1")))
            .unwrap();
        let parsed: Value = serde_json::from_str(wire.as_text().unwrap()).unwrap();
        assert_eq!(parsed, json!({"type": "audio.clear", "sessionId": "av-sess-1"}));

        let wire = s
            .serialize(&Event::Mark(crate::core::events::Mark::new("av-call-1", "seg-3")))
            .unwrap();
        let parsed: Value = serde_json::from_str(wire.as_text().unwrap()).unwrap();
        assert_eq!(
            parsed,
            json!({"type": "audio.mark", "sessionId": "av-sess-1", "name": "seg-3"})
        );
    }

    #[test]
    fn test_session_start_without_call_id_falls_back() {
        let mut s = AvayaSerializer::new();
        let msg = json!({"type": "session.start", "sessionId": "av-sess-2"});
        let events = s.deserialize(&WireMessage::Text(msg.to_string()));
        assert!(matches!(&events[0], Event::CallStarted(e) if e.call_id == "av-sess-2"));
    }
}
