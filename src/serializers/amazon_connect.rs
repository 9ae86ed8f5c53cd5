//! Amazon Connect streaming serializer.
//!
//! Connect delivers contact events as JSON (`STARTED`, `ENDED`, `DTMF`,
//! `HOLD`, `RESUME`) and audio as binary PCM16 frames at 8 kHz. The
//! integration acknowledges `STARTED` with an `ACCEPTED` handshake naming
//! the media format.

use serde_json::{json, Value};

use crate::core::events::{
    AudioFrame, CallEnded, CallStarted, Codec, CustomEvent, DtmfReceived, Event, HoldEnded,
    HoldStarted,
};
use crate::serializers::{parse_json_message, str_field, value_to_metadata, Serializer};
use crate::transports::WireMessage;

/// State: the Connect contact id (the call id) and instance id.
pub struct AmazonConnectSerializer {
    contact_id: String,
    instance_id: String,
}

impl AmazonConnectSerializer {
    pub fn new() -> Self {
        Self { contact_id: String::new(), instance_id: String::new() }
    }
}

impl Default for AmazonConnectSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer for AmazonConnectSerializer {
    fn name(&self) -> &'static str {
        "amazon_connect"
    }

    fn native_codec(&self) -> Codec {
        Codec::Pcm16
    }

    fn native_sample_rate(&self) -> u32 {
        8000
    }

    fn deserialize(&mut self, raw: &WireMessage) -> Vec<Event> {
        if let WireMessage::Binary(data) = raw {
            return vec![Event::AudioFrame(AudioFrame::new(
                self.contact_id.clone(),
                Codec::Pcm16,
                8000,
                data.clone(),
            ))];
        }

        let msg = match parse_json_message(raw, &self.contact_id) {
            Ok(msg) => msg,
            Err(err_event) => return vec![err_event],
        };

        match str_field(&msg, "event").as_str() {
            "STARTED" => {
                self.contact_id = str_field(&msg, "contactId");
                self.instance_id = str_field(&msg, "instanceId");
                let attributes =
                    msg.get("contactAttributes").cloned().unwrap_or_else(|| json!({}));

                let mut started = CallStarted::new(self.contact_id.clone(), "amazon_connect");
                started.from_number = str_field(&attributes, "customerNumber");
                started.to_number = str_field(&attributes, "systemNumber");
                started.metadata.insert("contact_id".into(), json!(self.contact_id));
                started.metadata.insert("instance_id".into(), json!(self.instance_id));
                started.metadata.insert("queue".into(), json!(str_field(&attributes, "queue")));
                started.metadata.insert("contact_attributes".into(), attributes);
                vec![Event::CallStarted(started)]
            }
            "ENDED" => {
                let reason = match msg.get("disconnectReason").and_then(Value::as_str) {
                    Some(r) => r.to_string(),
                    None => "normal".to_string(),
                };
                vec![Event::CallEnded(CallEnded::new(self.contact_id.clone(), reason))]
            }
            "DTMF" => vec![Event::DtmfReceived(DtmfReceived::new(
                self.contact_id.clone(),
                str_field(&msg, "digit"),
            ))],
            "HOLD" => vec![Event::HoldStarted(HoldStarted::new(self.contact_id.clone()))],
            "RESUME" => vec![Event::HoldEnded(HoldEnded::new(self.contact_id.clone()))],
            other => vec![Event::Custom(CustomEvent::new(
                self.contact_id.clone(),
                format!("amazon_connect.{other}"),
                value_to_metadata(&msg),
            ))],
        }
    }

    fn serialize(&mut self, event: &Event) -> Option<WireMessage> {
        match event {
            Event::AudioFrame(frame) => Some(WireMessage::Binary(frame.data.clone())),
            Event::CallEnded(ended) => Some(WireMessage::Text(
                json!({
                    "event": "END",
                    "contactId": self.contact_id,
                    "reason": ended.reason,
                })
                .to_string(),
            )),
            _ => None,
        }
    }

    fn handshake_response(&mut self, msg: &Value) -> Option<String> {
        if str_field(msg, "event") == "STARTED" {
            self.contact_id = str_field(msg, "contactId");
            self.instance_id = str_field(msg, "instanceId");
            return Some(
                json!({
                    "event": "ACCEPTED",
                    "contactId": self.contact_id,
                    "parameters": { "mediaFormat": "lpcm", "sampleRate": 8000 },
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

    fn started_message() -> Value {
        json!({
            "event": "STARTED",
            "contactId": "contact-1",
            "instanceId": "inst-1",
            "contactAttributes": {
                "customerNumber": "+15550001",
                "systemNumber": "+15550002",
                "queue": "support"
            }
        })
    }

    #[test]
    fn test_started() {
        let mut s = AmazonConnectSerializer::new();
        let events = s.deserialize(&WireMessage::Text(started_message().to_string()));
        match &events[0] {
            Event::CallStarted(e) => {
                assert_eq!(e.call_id, "contact-1");
                assert_eq!(e.from_number, "+15550001");
                assert_eq!(e.to_number, "+15550002");
                assert_eq!(e.metadata["queue"], json!("support"));
            }
            other => panic!("expected CallStarted, got {other:?}"),
        }
    }

    #[test]
    fn test_handshake_accepted() {
        let mut s = AmazonConnectSerializer::new();
        let response = s.handshake_response(&started_message()).unwrap();
        let parsed: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(
            parsed,
            json!({
                "event": "ACCEPTED",
                "contactId": "contact-1",
                "parameters": {"mediaFormat": "lpcm", "sampleRate": 8000}
            })
        );
    }

    #[test]
    fn test_binary_is_pcm16() {
        let mut s = AmazonConnectSerializer::new();
        s.deserialize(&WireMessage::Text(started_message().to_string()));
        let events = s.deserialize(&WireMessage::Binary(vec![1, 0, 2, 0]));
        match &events[0] {
            Event::AudioFrame(f) => {
                assert_eq!(f.codec, Codec::Pcm16);
                assert_eq!(f.sample_rate, 8000);
                assert_eq!(f.call_id, "contact-1");
            }
            other => panic!("expected AudioFrame, got {other:?}"),
        }
    }

    #[test]
    fn test_ended_dtmf_hold_resume() {
        let mut s = AmazonConnectSerializer::new();
        s.deserialize(&WireMessage::Text(started_message().to_string()));

        let events = s.deserialize(&WireMessage::Text(
            json!({"event": "DTMF", "digit": "9"}).to_string(),
        ));
        assert!(matches!(&events[0], Event::DtmfReceived(e) if e.digit == "9"));

        let events = s.deserialize(&WireMessage::Text(json!({"event": "HOLD"}).to_string()));
        assert!(matches!(events[0], Event::HoldStarted(_)));

        let events = s.deserialize(&WireMessage::Text(json!({"event": "RESUME"}).to_string()));
        assert!(matches!(events[0], Event::HoldEnded(_)));

        let events = s.deserialize(&WireMessage::Text(
            json!({"event": "ENDED", "disconnectReason": "CUSTOMER_DISCONNECT"}).to_string(),
        ));
        assert!(matches!(&events[0], Event::CallEnded(e) if e.reason == "CUSTOMER_DISCONNECT"));
    }

    #[test]
    fn test_outbound_end_message() {
        let mut s = AmazonConnectSerializer::new();
        s.deserialize(&WireMessage::Text(started_message().to_string()));

        let wire = s
            .serialize(&Event::CallEnded(CallEnded::new("contact-1", "normal")))
            .unwrap();
        let parsed: Value = serde_json::from_str(wire.as_text().unwrap()).unwrap();
        assert_eq!(parsed, json!({"event": "END", "contactId": "contact-1", "reason": "normal"}));
    }

    #[test]
    fn test_unknown_event_becomes_custom() {
        let mut s = AmazonConnectSerializer::new();
        let events =
            s.deserialize(&WireMessage::Text(json!({"event": "METRICS"}).to_string()));
        assert!(matches!(&events[0], Event::Custom(e) if e.custom_type == "amazon_connect.METRICS"));
    }
}
