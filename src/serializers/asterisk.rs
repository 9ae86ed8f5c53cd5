//! Asterisk ARI serializer.
//!
//! ARI delivers channel events (`StasisStart`, `ChannelDtmfReceived`,
//! `StasisEnd`, `ChannelHold`, `ChannelUnhold`) as JSON and external-media
//! audio as raw binary mu-law frames on the same WebSocket. Most ARI
//! commands travel over the separate HTTP API; only the WebSocket side is
//! modeled here.

use serde_json::{json, Value};

use crate::core::events::{
    AudioFrame, CallEnded, CallStarted, Codec, CustomEvent, DtmfReceived, Event, HoldEnded,
    HoldStarted,
};
use crate::serializers::{
    parse_json_message, prefixed_headers, str_field, u64_field, value_to_metadata, Serializer,
};
use crate::transports::WireMessage;

/// State: the Asterisk channel id from `StasisStart`.
pub struct AsteriskSerializer {
    channel_id: String,
}

impl AsteriskSerializer {
    pub fn new() -> Self {
        Self { channel_id: String::new() }
    }

    fn channel_call_id(&self, msg: &Value) -> String {
        msg.get("channel")
            .and_then(|c| c.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.channel_id.clone())
    }

    fn handle_stasis_start(&mut self, msg: &Value) -> Vec<Event> {
        let empty = json!({});
        let channel = msg.get("channel").unwrap_or(&empty);
        self.channel_id = str_field(channel, "id");

        let caller = channel.get("caller").unwrap_or(&empty);
        let connected = channel.get("connected").unwrap_or(&empty);
        let chan_vars = channel.get("channelvars").cloned().unwrap_or_else(|| json!({}));
        let sip_headers = prefixed_headers(&chan_vars, &["PJSIP_HEADER", "SIP_HEADER"]);

        let mut started = CallStarted::new(self.channel_id.clone(), "asterisk");
        started.from_number = str_field(caller, "number");
        started.to_number = str_field(connected, "number");
        started.sip_headers = sip_headers;
        started.metadata.insert("channel_name".into(), json!(str_field(channel, "name")));
        started
            .metadata
            .insert("args".into(), msg.get("args").cloned().unwrap_or_else(|| json!([])));
        vec![Event::CallStarted(started)]
    }
}

impl Default for AsteriskSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer for AsteriskSerializer {
    fn name(&self) -> &'static str {
        "asterisk"
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
                self.channel_id.clone(),
                Codec::Mulaw,
                8000,
                data.clone(),
            ))];
        }

        let msg = match parse_json_message(raw, &self.channel_id) {
            Ok(msg) => msg,
            Err(err_event) => return vec![err_event],
        };

        match str_field(&msg, "type").as_str() {
            "StasisStart" => self.handle_stasis_start(&msg),
            "ChannelDtmfReceived" => {
                let mut dtmf =
                    DtmfReceived::new(self.channel_call_id(&msg), str_field(&msg, "digit"));
                dtmf.duration_ms = u64_field(&msg, "duration_ms", 250);
                vec![Event::DtmfReceived(dtmf)]
            }
            "StasisEnd" => vec![Event::CallEnded(CallEnded::new(
                self.channel_call_id(&msg),
                "stasis_end",
            ))],
            "ChannelHold" => vec![Event::HoldStarted(HoldStarted::new(self.channel_call_id(&msg)))],
            "ChannelUnhold" => vec![Event::HoldEnded(HoldEnded::new(self.channel_call_id(&msg)))],
            other => vec![Event::Custom(CustomEvent::new(
                self.channel_id.clone(),
                format!("asterisk.{other}"),
                value_to_metadata(&msg),
            ))],
        }
    }

    fn serialize(&mut self, event: &Event) -> Option<WireMessage> {
        match event {
            Event::AudioFrame(frame) => Some(WireMessage::Binary(frame.data.clone())),
            Event::ClearAudio(clear) => {
                let channel_id = if clear.call_id.is_empty() {
                    self.channel_id.clone()
                } else {
                    clear.call_id.clone()
                };
                Some(WireMessage::Text(
                    json!({
                        "type": "PlaybackControl",
                        "channel_id": channel_id,
                        "operation": "stop",
                    })
                    .to_string(),
                ))
            }
            Event::Mark(mark) => {
                let channel_id = if mark.call_id.is_empty() {
                    self.channel_id.clone()
                } else {
                    mark.call_id.clone()
                };
                Some(WireMessage::Text(
                    json!({ "type": "Mark", "channel_id": channel_id, "name": mark.name })
                        .to_string(),
                ))
            }
            _ => None,
        }
    }

    fn handshake_response(&mut self, _msg: &Value) -> Option<String> {
        // ARI's WebSocket needs no handshake response.
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stasis_start() -> Value {
        json!({
            "type": "StasisStart",
            "channel": {
                "id": "ch1",
                "name": "PJSIP/1001-00000001",
                "caller": {"number": "+15550001"},
                "connected": {"number": "+15550002"},
                "channelvars": {
                    "PJSIP_HEADER(X-Account)": "42",
                    "CDR_PROP": "ignored"
                }
            },
            "args": ["voicebot"]
        })
    }

    #[test]
    fn test_stasis_start() {
        let mut s = AsteriskSerializer::new();
        let events = s.deserialize(&WireMessage::Text(stasis_start().to_string()));
        match &events[0] {
            Event::CallStarted(e) => {
                assert_eq!(e.call_id, "ch1");
                assert_eq!(e.from_number, "+15550001");
                assert_eq!(e.to_number, "+15550002");
                assert_eq!(e.sip_headers["PJSIP_HEADER(X-Account)"], "42");
                assert!(!e.sip_headers.contains_key("CDR_PROP"));
                assert_eq!(e.metadata["channel_name"], json!("PJSIP/1001-00000001"));
            }
            other => panic!("expected CallStarted, got {other:?}"),
        }
    }

    #[test]
    fn test_dtmf_with_duration() {
        let mut s = AsteriskSerializer::new();
        s.deserialize(&WireMessage::Text(stasis_start().to_string()));

        let events = s.deserialize(&WireMessage::Text(
            json!({
                "type": "ChannelDtmfReceived",
                "channel_id": "ch1",
                "channel": {"id": "ch1"},
                "digit": "0",
                "duration_ms": 250
            })
            .to_string(),
        ));
        match &events[0] {
            Event::DtmfReceived(e) => {
                assert_eq!(e.digit, "0");
                assert_eq!(e.duration_ms, 250);
                assert_eq!(e.call_id, "ch1");
            }
            other => panic!("expected DtmfReceived, got {other:?}"),
        }
    }

    #[test]
    fn test_binary_audio_uses_channel_id() {
        let mut s = AsteriskSerializer::new();
        s.deserialize(&WireMessage::Text(stasis_start().to_string()));
        let events = s.deserialize(&WireMessage::Binary(vec![0xAA; 160]));
        assert!(matches!(&events[0], Event::AudioFrame(f) if f.call_id == "ch1"));
    }

    #[test]
    fn test_stasis_end_and_holds() {
        let mut s = AsteriskSerializer::new();
        s.deserialize(&WireMessage::Text(stasis_start().to_string()));

        let events = s.deserialize(&WireMessage::Text(
            json!({"type": "ChannelHold", "channel": {"id": "ch1"}}).to_string(),
        ));
        assert!(matches!(events[0], Event::HoldStarted(_)));

        let events = s.deserialize(&WireMessage::Text(
            json!({"type": "ChannelUnhold", "channel": {"id": "ch1"}}).to_string(),
        ));
        assert!(matches!(events[0], Event::HoldEnded(_)));

        let events = s.deserialize(&WireMessage::Text(
            json!({"type": "StasisEnd", "channel": {"id": "ch1"}}).to_string(),
        ));
        assert!(matches!(&events[0], Event::CallEnded(e) if e.reason == "stasis_end"));
    }

    #[test]
    fn test_playback_control_and_mark() {
        let mut s = AsteriskSerializer::new();
        s.deserialize(&WireMessage::Text(stasis_start().to_string()));

        let wire = s
            .serialize(&Event::ClearAudio(crate::core::events::ClearAudio::new("ch1")))
            .unwrap();
        let parsed: Value = serde_json::from_str(wire.as_text().unwrap()).unwrap();
        assert_eq!(
            parsed,
            json!({"type": "PlaybackControl", "channel_id": "ch1", "operation": "stop"})
        );

        let wire = s.serialize(&Event::Mark(crate::core::events::Mark::new("ch1", "m2"))).unwrap();
        let parsed: Value = serde_json::from_str(wire.as_text().unwrap()).unwrap();
        assert_eq!(parsed, json!({"type": "Mark", "channel_id": "ch1", "name": "m2"}));
    }

    #[test]
    fn test_unknown_event_becomes_custom() {
        let mut s = AsteriskSerializer::new();
        let events = s.deserialize(&WireMessage::Text(
            json!({"type": "ChannelVarset", "variable": "X"}).to_string(),
        ));
        assert!(matches!(&events[0], Event::Custom(e) if e.custom_type == "asterisk.ChannelVarset"));
    }
}
