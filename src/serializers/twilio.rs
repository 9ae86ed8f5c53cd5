//! Twilio Media Streams serializer.
//!
//! Twilio streams audio as base64-encoded mu-law at 8 kHz inside JSON
//! WebSocket messages with an `event` discriminator.
//!
//! Protocol reference:
//!     https://www.twilio.com/docs/voice/media-streams/websocket-messages

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};

use crate::core::events::{
    AudioFrame, CallEnded, CallStarted, Codec, CustomEvent, DtmfReceived, ErrorEvent, Event,
};
use crate::serializers::{parse_json_message, str_field, value_to_metadata, Serializer};
use crate::transports::WireMessage;

/// State kept across the lifetime of a single stream:
/// the media-stream SID and the Twilio Call SID it belongs to.
pub struct TwilioSerializer {
    stream_sid: String,
    call_sid: String,
}

impl TwilioSerializer {
    pub fn new() -> Self {
        Self { stream_sid: String::new(), call_sid: String::new() }
    }

    fn handle_start(&mut self, msg: &Value) -> Vec<Event> {
        let empty = json!({});
        let start = msg.get("start").unwrap_or(&empty);
        self.stream_sid = str_field(start, "streamSid");
        self.call_sid = str_field(start, "callSid");

        let mut started = CallStarted::new(self.call_sid.clone(), "twilio");
        started.metadata.insert("account_sid".into(), json!(str_field(start, "accountSid")));
        started.metadata.insert("stream_sid".into(), json!(self.stream_sid));
        started.metadata.insert(
            "custom_parameters".into(),
            start.get("customParameters").cloned().unwrap_or_else(|| json!({})),
        );
        started.metadata.insert(
            "media_format".into(),
            start.get("mediaFormat").cloned().unwrap_or_else(|| json!({})),
        );
        vec![Event::CallStarted(started)]
    }

    fn handle_media(&mut self, msg: &Value) -> Vec<Event> {
        if let Some(sid) = msg.get("streamSid").and_then(Value::as_str) {
            self.stream_sid = sid.to_string();
        }
        let payload = msg
            .get("media")
            .and_then(|m| m.get("payload"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        match BASE64.decode(payload) {
            Ok(data) => vec![Event::AudioFrame(AudioFrame::new(
                self.call_sid.clone(),
                Codec::Mulaw,
                8000,
                data,
            ))],
            Err(e) => vec![Event::Error(ErrorEvent::recoverable(
                self.call_sid.clone(),
                "parse_error",
                format!("bad media payload: {e}"),
            ))],
        }
    }

    fn handle_dtmf(&mut self, msg: &Value) -> Vec<Event> {
        if let Some(sid) = msg.get("streamSid").and_then(Value::as_str) {
            self.stream_sid = sid.to_string();
        }
        let empty = json!({});
        let dtmf = msg.get("dtmf").unwrap_or(&empty);
        vec![Event::DtmfReceived(DtmfReceived::new(
            self.call_sid.clone(),
            str_field(dtmf, "digit"),
        ))]
    }
}

impl Default for TwilioSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer for TwilioSerializer {
    fn name(&self) -> &'static str {
        "twilio"
    }

    fn native_codec(&self) -> Codec {
        Codec::Mulaw
    }

    fn native_sample_rate(&self) -> u32 {
        8000
    }

    fn deserialize(&mut self, raw: &WireMessage) -> Vec<Event> {
        let msg = match parse_json_message(raw, &self.call_sid) {
            Ok(msg) => msg,
            Err(err_event) => return vec![err_event],
        };

        match str_field(&msg, "event").as_str() {
            // Initial connection acknowledgement, no event.
            "connected" => vec![],
            "start" => self.handle_start(&msg),
            "media" => self.handle_media(&msg),
            "dtmf" => self.handle_dtmf(&msg),
            "stop" => {
                if let Some(sid) = msg.get("streamSid").and_then(Value::as_str) {
                    self.stream_sid = sid.to_string();
                }
                vec![Event::CallEnded(CallEnded::new(self.call_sid.clone(), "normal"))]
            }
            other => vec![Event::Custom(CustomEvent::new(
                self.call_sid.clone(),
                format!("twilio.{other}"),
                value_to_metadata(&msg),
            ))],
        }
    }

    fn serialize(&mut self, event: &Event) -> Option<WireMessage> {
        match event {
            Event::AudioFrame(frame) => {
                let msg = json!({
                    "event": "media",
                    "streamSid": self.stream_sid,
                    "media": { "payload": BASE64.encode(&frame.data) },
                });
                Some(WireMessage::Text(msg.to_string()))
            }
            Event::ClearAudio(_) => {
                let msg = json!({ "event": "clear", "streamSid": self.stream_sid });
                Some(WireMessage::Text(msg.to_string()))
            }
            _ => None,
        }
    }

    fn handshake_response(&mut self, _msg: &Value) -> Option<String> {
        // Twilio's `connected` event does not require a response.
        None
    }
}
