//! Provider wire-protocol serializers.
//!
//! A serializer is a pure translator between one telephony provider's wire
//! format and the canonical event model. Serializers perform no I/O; the
//! only state they keep is the session-identifying fields the provider's
//! protocol assigns after the handshake (stream SID, conversation id,
//! channel UUID).
//!
//! Every inbound wire message maps to zero or more events. Messages outside
//! a protocol's known set surface as `CustomEvent` with
//! `custom_type = "<provider>.<type>"`; malformed JSON surfaces as a
//! recoverable `ErrorEvent`. Outbound, `serialize` returns `None` for event
//! types the provider cannot accept.

pub mod amazon_connect;
pub mod asterisk;
pub mod avaya;
pub mod cisco;
pub mod freeswitch;
pub mod generic_ws;
pub mod genesys;
pub mod twilio;

use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use crate::core::events::{Codec, ErrorEvent, Event, Metadata};
use crate::transports::WireMessage;

pub use amazon_connect::AmazonConnectSerializer;
pub use asterisk::AsteriskSerializer;
pub use avaya::AvayaSerializer;
pub use cisco::CiscoSerializer;
pub use freeswitch::FreeSwitchSerializer;
pub use generic_ws::GenericWsSerializer;
pub use genesys::GenesysSerializer;
pub use twilio::TwilioSerializer;

#[derive(Error, Debug)]
pub enum SerializerError {
    #[error("no serializer registered for '{0}'")]
    UnknownProvider(String),
}

/// Translator between one provider's wire protocol and the event model.
pub trait Serializer: Send {
    /// Provider name (e.g. "twilio", "genesys").
    fn name(&self) -> &'static str;

    /// The audio codec this provider puts on the wire.
    fn native_codec(&self) -> Codec;

    /// The provider's native audio sample rate.
    fn native_sample_rate(&self) -> u32;

    /// Parse a raw provider message into events. A single message may
    /// produce multiple events; an ignorable message produces none.
    fn deserialize(&mut self, raw: &WireMessage) -> Vec<Event>;

    /// Convert an event to the provider's wire format, or `None` when the
    /// event type has no outbound mapping for this provider.
    fn serialize(&mut self, event: &Event) -> Option<WireMessage>;

    /// Response owed to a provider control message (e.g. Genesys `open` ->
    /// `opened`, `ping` -> `pong`). `None` when no response is needed.
    fn handshake_response(&mut self, msg: &Value) -> Option<String>;
}

// ---------------------------------------------------------------------------
// Shared parsing helpers
// ---------------------------------------------------------------------------

/// Normalise an inbound text/binary frame into parsed JSON, or produce the
/// recoverable parse error event for this call.
pub(crate) fn parse_json_message(raw: &WireMessage, call_id: &str) -> Result<Value, Event> {
    let text = match raw {
        WireMessage::Text(t) => t.as_str(),
        WireMessage::Binary(b) => std::str::from_utf8(b).map_err(|_| {
            Event::Error(ErrorEvent::recoverable(call_id, "parse_error", "non-utf8 message"))
        })?,
    };
    serde_json::from_str(text).map_err(|e| {
        Event::Error(ErrorEvent::recoverable(call_id, "parse_error", e.to_string()))
    })
}

pub(crate) fn str_field(msg: &Value, key: &str) -> String {
    msg.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

pub(crate) fn u64_field(msg: &Value, key: &str, default: u64) -> u64 {
    msg.get(key).and_then(Value::as_u64).unwrap_or(default)
}

/// Collect string-convertible entries whose keys start with any prefix.
/// Used to pull custom SIP headers out of provider metadata blobs.
pub(crate) fn prefixed_headers(obj: &Value, prefixes: &[&str]) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    if let Some(map) = obj.as_object() {
        for (key, val) in map {
            if prefixes.iter().any(|p| key.starts_with(p)) {
                let s = match val {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                headers.insert(key.clone(), s);
            }
        }
    }
    headers
}

/// The whole message as an event payload map.
pub(crate) fn value_to_metadata(msg: &Value) -> Metadata {
    match msg {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Metadata::new();
            map.insert("value".into(), other.clone());
            map
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Construction-time options passed to serializer factories. Only the
/// generic serializer reads them; the named providers pin their own formats.
#[derive(Debug, Clone, Copy)]
pub struct SerializerConfig {
    pub codec: Codec,
    pub sample_rate: u32,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self { codec: Codec::Pcm16, sample_rate: 16000 }
    }
}

type SerializerFactory = Box<dyn Fn(&SerializerConfig) -> Box<dyn Serializer> + Send + Sync>;

/// Maps provider names to serializer factories. Runtime-extensible; unknown
/// provider names fail construction.
pub struct SerializerRegistry {
    factories: HashMap<String, SerializerFactory>,
}

impl SerializerRegistry {
    /// Registry with all built-in providers registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self { factories: HashMap::new() };
        registry.register("twilio", |_| Box::new(TwilioSerializer::new()));
        registry.register("genesys", |_| Box::new(GenesysSerializer::new()));
        registry.register("asterisk", |_| Box::new(AsteriskSerializer::new()));
        registry.register("freeswitch", |_| Box::new(FreeSwitchSerializer::new()));
        registry.register("amazon_connect", |_| Box::new(AmazonConnectSerializer::new()));
        registry.register("avaya", |_| Box::new(AvayaSerializer::new()));
        registry.register("cisco", |_| Box::new(CiscoSerializer::new()));
        registry.register("generic", |cfg| {
            Box::new(GenericWsSerializer::new(cfg.codec, cfg.sample_rate))
        });
        registry
    }

    /// Register a custom serializer factory under `name`.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(&SerializerConfig) -> Box<dyn Serializer> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Create a serializer instance for `name`.
    pub fn create(
        &self,
        name: &str,
        config: &SerializerConfig,
    ) -> Result<Box<dyn Serializer>, SerializerError> {
        self.factories
            .get(name)
            .map(|f| f(config))
            .ok_or_else(|| SerializerError::UnknownProvider(name.to_string()))
    }

    /// Sorted provider names.
    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
