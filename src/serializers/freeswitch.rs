//! FreeSWITCH mod_ws serializer.
//!
//! FreeSWITCH sends JSON signaling (`connect`, `dtmf`, `disconnect`) and raw
//! binary mu-law frames at 8 kHz. Outbound commands (`hangup`, `break`,
//! `mark`, `transfer`) are JSON keyed by the channel UUID.

use serde_json::{json, Value};

use crate::core::events::{
    AudioFrame, CallEnded, CallStarted, Codec, CustomEvent, DtmfReceived, Event,
};
use crate::serializers::{
    parse_json_message, prefixed_headers, str_field, u64_field, value_to_metadata, Serializer,
};
use crate::transports::WireMessage;

/// State: the FreeSWITCH channel UUID from `connect`.
pub struct FreeSwitchSerializer {
    uuid: String,
}

impl FreeSwitchSerializer {
    pub fn new() -> Self {
        Self { uuid: String::new() }
    }

    fn msg_uuid(&self, msg: &Value) -> String {
        let uuid = str_field(msg, "uuid");
        if uuid.is_empty() { self.uuid.clone() } else { uuid }
    }

    fn event_uuid(&self, call_id: &str) -> String {
        if call_id.is_empty() { self.uuid.clone() } else { call_id.to_string() }
    }
}

impl Default for FreeSwitchSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer for FreeSwitchSerializer {
    fn name(&self) -> &'static str {
        "freeswitch"
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
                self.uuid.clone(),
                Codec::Mulaw,
                8000,
                data.clone(),
            ))];
        }

        let msg = match parse_json_message(raw, &self.uuid) {
            Ok(msg) => msg,
            Err(err_event) => return vec![err_event],
        };

        match str_field(&msg, "event").as_str() {
            "connect" => {
                self.uuid = str_field(&msg, "uuid");
                let sip_headers = prefixed_headers(&msg, &["variable_sip_h_", "sip_"]);

                let mut started = CallStarted::new(self.uuid.clone(), "freeswitch");
                started.from_number = str_field(&msg, "caller_id");
                started.to_number = str_field(&msg, "destination");
                started.sip_headers = sip_headers;
                started.metadata.insert(
                    "sip_from_user".into(),
                    json!(str_field(&msg, "variable_sip_from_user")),
                );
                vec![Event::CallStarted(started)]
            }
            "dtmf" => {
                let mut dtmf = DtmfReceived::new(self.msg_uuid(&msg), str_field(&msg, "digit"));
                dtmf.duration_ms = u64_field(&msg, "duration", 250);
                vec![Event::DtmfReceived(dtmf)]
            }
            "disconnect" => {
                let cause = match msg.get("cause").and_then(Value::as_str) {
                    Some(c) => c.to_string(),
                    None => "NORMAL_CLEARING".to_string(),
                };
                vec![Event::CallEnded(CallEnded::new(self.msg_uuid(&msg), cause))]
            }
            other => vec![Event::Custom(CustomEvent::new(
                self.uuid.clone(),
                format!("freeswitch.{other}"),
                value_to_metadata(&msg),
            ))],
        }
    }

    fn serialize(&mut self, event: &Event) -> Option<WireMessage> {
        match event {
            Event::AudioFrame(frame) => Some(WireMessage::Binary(frame.data.clone())),
            Event::CallEnded(ended) => {
                let cause =
                    if ended.reason.is_empty() { "NORMAL_CLEARING" } else { ended.reason.as_str() };
                Some(WireMessage::Text(
                    json!({
                        "command": "hangup",
                        "uuid": self.event_uuid(&ended.call_id),
                        "cause": cause,
                    })
                    .to_string(),
                ))
            }
            // break stops whatever is currently playing on the channel.
            Event::ClearAudio(clear) => Some(WireMessage::Text(
                json!({ "command": "break", "uuid": self.event_uuid(&clear.call_id) }).to_string(),
            )),
            Event::Mark(mark) => Some(WireMessage::Text(
                json!({
                    "command": "mark",
                    "uuid": self.event_uuid(&mark.call_id),
                    "name": mark.name,
                })
                .to_string(),
            )),
            Event::TransferRequested(transfer) => Some(WireMessage::Text(
                json!({
                    "command": "transfer",
                    "uuid": self.event_uuid(&transfer.call_id),
                    "destination": transfer.target,
                })
                .to_string(),
            )),
            _ => None,
        }
    }

    fn handshake_response(&mut self, _msg: &Value) -> Option<String> {
        // mod_ws does not expect a handshake response.
        None
    }
}
