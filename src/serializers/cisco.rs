//! Cisco WebEx Contact Center serializer.
//!
//! Cisco signals with JSON (`call.new`, `call.ended`, `dtmf`, `call.held`,
//! `call.retrieved`) and carries mu-law audio as binary frames. The
//! integration acknowledges `call.new` with a `call.accepted` handshake.

use serde_json::{json, Value};

use crate::core::events::{
    AudioFrame, CallEnded, CallStarted, Codec, CustomEvent, DtmfReceived, Event, HoldEnded,
    HoldStarted,
};
use crate::serializers::{
    parse_json_message, prefixed_headers, str_field, value_to_metadata, Serializer,
};
use crate::transports::WireMessage;

/// State: the Cisco interaction id (the call id) and agent session id.
pub struct CiscoSerializer {
    interaction_id: String,
    agent_id: String,
}

impl CiscoSerializer {
    pub fn new() -> Self {
        Self { interaction_id: String::new(), agent_id: String::new() }
    }
}

impl Default for CiscoSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer for CiscoSerializer {
    fn name(&self) -> &'static str {
        "cisco"
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
                self.interaction_id.clone(),
                Codec::Mulaw,
                8000,
                data.clone(),
            ))];
        }

        let msg = match parse_json_message(raw, &self.interaction_id) {
            Ok(msg) => msg,
            Err(err_event) => return vec![err_event],
        };

        match str_field(&msg, "event").as_str() {
            "call.new" => {
                self.interaction_id = str_field(&msg, "interactionId");
                self.agent_id = str_field(&msg, "agentId");
                let data = msg.get("data").cloned().unwrap_or_else(|| json!({}));
                let sip_headers = prefixed_headers(&data, &["sip_", "x-", "X-"]);

                let mut started = CallStarted::new(self.interaction_id.clone(), "cisco");
                started.from_number = str_field(&data, "ani");
                started.to_number = str_field(&data, "dnis");
                started.sip_headers = sip_headers;
                started.metadata.insert("interaction_id".into(), json!(self.interaction_id));
                started.metadata.insert("agent_id".into(), json!(self.agent_id));
                started
                    .metadata
                    .insert("queue_name".into(), json!(str_field(&data, "queueName")));
                vec![Event::CallStarted(started)]
            }
            "call.ended" => {
                let reason = match msg.get("reason").and_then(Value::as_str) {
                    Some(r) => r.to_string(),
                    None => "normal".to_string(),
                };
                vec![Event::CallEnded(CallEnded::new(self.interaction_id.clone(), reason))]
            }
            "dtmf" => vec![Event::DtmfReceived(DtmfReceived::new(
                self.interaction_id.clone(),
                str_field(&msg, "digit"),
            ))],
            "call.held" => vec![Event::HoldStarted(HoldStarted::new(self.interaction_id.clone()))],
            "call.retrieved" => {
                vec![Event::HoldEnded(HoldEnded::new(self.interaction_id.clone()))]
            }
            other => vec![Event::Custom(CustomEvent::new(
                self.interaction_id.clone(),
                format!("cisco.{other}"),
                value_to_metadata(&msg),
            ))],
        }
    }

    fn serialize(&mut self, event: &Event) -> Option<WireMessage> {
        match event {
            Event::AudioFrame(frame) => Some(WireMessage::Binary(frame.data.clone())),
            Event::CallEnded(ended) => Some(WireMessage::Text(
                json!({
                    "event": "call.end",
                    "interactionId": self.interaction_id,
                    "reason": ended.reason,
                })
                .to_string(),
            )),
            Event::ClearAudio(_) => Some(WireMessage::Text(
                json!({ "event": "audio.clear", "interactionId": self.interaction_id })
                    .to_string(),
            )),
            Event::Mark(mark) => Some(WireMessage::Text(
                json!({
                    "event": "audio.mark",
                    "interactionId": self.interaction_id,
                    "name": mark.name,
                })
                .to_string(),
            )),
            _ => None,
        }
    }

    fn handshake_response(&mut self, msg: &Value) -> Option<String> {
        if str_field(msg, "event") == "call.new" {
            self.interaction_id = str_field(msg, "interactionId");
            return Some(
                json!({
                    "event": "call.accepted",
                    "interactionId": self.interaction_id,
                    "parameters": { "mediaFormat": "PCMU", "sampleRate": 8000 },
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

    fn call_new() -> Value {
        json!({
            "event": "call.new",
            "interactionId": "int-1",
            "agentId": "agent-7",
            "data": {
                "ani": "+15550001",
                "dnis": "+15550002",
                "queueName": "billing",
                "x-priority": "high"
            }
        })
    }

    #[test]
    fn test_call_new() {
        let mut s = CiscoSerializer::new();
        let events = s.deserialize(&WireMessage::Text(call_new().to_string()));
        match &events[0] {
            Event::CallStarted(e) => {
                assert_eq!(e.call_id, "int-1");
                assert_eq!(e.from_number, "+15550001");
                assert_eq!(e.to_number, "+15550002");
                assert_eq!(e.sip_headers["x-priority"], "high");
                assert_eq!(e.metadata["queue_name"], json!("billing"));
                assert_eq!(e.metadata["agent_id"], json!("agent-7"));
            }
            other => panic!("expected CallStarted, got {other:?}"),
        }
    }

    #[test]
    fn test_handshake_call_accepted() {
        let mut s = CiscoSerializer::new();
        let response = s.handshake_response(&call_new()).unwrap();
        let parsed: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(
            parsed,
            json!({
                "event": "call.accepted",
                "interactionId": "int-1",
                "parameters": {"mediaFormat": "PCMU", "sampleRate": 8000}
            })
        );
    }

    #[test]
    fn test_hold_retrieve_end() {
        let mut s = CiscoSerializer::new();
        s.deserialize(&WireMessage::Text(call_new().to_string()));

        let events = s.deserialize(&WireMessage::Text(json!({"event": "call.held"}).to_string()));
        assert!(matches!(events[0], Event::HoldStarted(_)));

        let events =
            s.deserialize(&WireMessage::Text(json!({"event": "call.retrieved"}).to_string()));
        assert!(matches!(events[0], Event::HoldEnded(_)));

        let events = s.deserialize(&WireMessage::Text(
            json!({"event": "call.ended", "reason": "agent_hangup"}).to_string(),
        ));
        assert!(matches!(&events[0], Event::CallEnded(e) if e.reason == "agent_hangup"));
    }

    #[test]
    fn test_outbound_control_messages() {
        let mut s = CiscoSerializer::new();
        s.deserialize(&WireMessage::Text(call_new().to_string()));

        let wire = s.serialize(&Event::CallEnded(CallEnded::new("int-1", "normal"))).unwrap();
        let parsed: Value = serde_json::from_str(wire.as_text().unwrap()).unwrap();
        assert_eq!(
            parsed,
            json!({"event": "call.end", "interactionId": "int-1", "reason": "normal"})
        );

        let wire = s
            .serialize(&Event::ClearAudio(crate::core::events::ClearAudio::new("int-1")))
            .unwrap();
        let parsed: Value = serde_json::from_str(wire.as_text().unwrap()).unwrap();
        assert_eq!(parsed, json!({"event": "audio.clear", "interactionId": "int-1"}));

        let wire = s
            .serialize(&Event::Mark(crate::core::events::Mark::new("int-1", "m-9")))
            .unwrap();
        let parsed: Value = serde_json::from_str(wire.as_text().unwrap()).unwrap();
        assert_eq!(
            parsed,
            json!({"event": "audio.mark", "interactionId": "int-1", "name": "m-9"})
        );
    }

    #[test]
    fn test_binary_audio() {
        let mut s = CiscoSerializer::new();
        s.deserialize(&WireMessage::Text(call_new().to_string()));
        let events = s.deserialize(&WireMessage::Binary(vec![0x55; 80]));
        assert!(matches!(&events[0], Event::AudioFrame(f) if f.call_id == "int-1"));
    }

    #[test]
    fn test_unknown_event_becomes_custom() {
        let mut s = CiscoSerializer::new();
        let events =
            s.deserialize(&WireMessage::Text(json!({"event": "agent.status"}).to_string()));
        assert!(matches!(&events[0], Event::Custom(e) if e.custom_type == "cisco.agent.status"));
    }
}
