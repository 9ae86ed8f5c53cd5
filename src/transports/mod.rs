//! Transport layer: raw connection I/O for both sides of the bridge.
//!
//! Transports impose no framing above the WebSocket message boundary and
//! preserve the binary/text distinction. All protocol knowledge lives in the
//! serializers.

pub mod websocket;

pub use websocket::{
    Transport, TransportError, TransportSender, WireMessage, WsClientTransport, WsListener,
    WsServerTransport,
};
