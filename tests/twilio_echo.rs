//! End-to-end bridge tests over real WebSockets.
//!
//! A fake Twilio Media Streams peer connects to the bridge and a fake voice
//! bot listens on the other side; audio and control messages run the full
//! serializer -> codec -> transport path in both directions.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use voxbridge::audio::codecs::{mulaw_decode, mulaw_encode};
use voxbridge::audio::{bytes_to_i16, i16_to_bytes};
use voxbridge::config::BridgeConfig;
use voxbridge::transports::{
    Transport, WireMessage, WsClientTransport, WsListener, WsServerTransport,
};
use voxbridge::VoxBridge;

const WAIT: Duration = Duration::from_secs(5);

async fn recv(transport: &mut impl Transport) -> WireMessage {
    timeout(WAIT, transport.recv()).await.expect("recv timed out").expect("peer closed")
}

async fn recv_text(transport: &mut impl Transport) -> Value {
    loop {
        if let WireMessage::Text(text) = recv(transport).await {
            return serde_json::from_str(&text).expect("peer sent invalid JSON");
        }
    }
}

async fn recv_binary(transport: &mut impl Transport) -> Vec<u8> {
    loop {
        if let WireMessage::Binary(data) = recv(transport).await {
            return data;
        }
    }
}

/// Bridge + fake bot listener, both on ephemeral ports. Returns the
/// provider-side client, the accepted bot-side socket, and the bridge
/// itself for session inspection.
async fn start_twilio_bridge() -> (WsClientTransport, WsServerTransport, Arc<VoxBridge>) {
    let bot_listener = WsListener::bind("127.0.0.1", 0, "/").await.unwrap();
    let bot_addr = bot_listener.local_addr().unwrap();

    let config = BridgeConfig::from_value(json!({
        "provider": {"type": "twilio", "listen_host": "127.0.0.1", "listen_port": 0},
        "bot": {"url": format!("ws://{bot_addr}/"), "codec": "pcm16", "sample_rate": 8000},
        "audio": {
            "input_codec": "mulaw",
            "output_codec": "mulaw",
            "sample_rate": 8000,
            "barge_in_rms_threshold": 1000.0,
            "barge_in_min_frames": 3
        }
    }))
    .unwrap();

    let bridge = Arc::new(VoxBridge::new(config));
    let provider_listener = WsListener::bind("127.0.0.1", 0, "/media-stream").await.unwrap();
    let provider_addr = provider_listener.local_addr().unwrap();
    {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            let _ = bridge.serve(provider_listener).await;
        });
    }

    let bot_accept = tokio::spawn(async move { bot_listener.accept().await.unwrap() });
    let provider = WsClientTransport::connect(&format!("ws://{provider_addr}/media-stream"))
        .await
        .unwrap();
    let bot = timeout(WAIT, bot_accept).await.unwrap().unwrap();
    (provider, bot, bridge)
}

fn twilio_start_message() -> String {
    json!({
        "event": "start",
        "start": {
            "streamSid": "MZabc",
            "callSid": "CAxyz",
            "accountSid": "AC1",
            "customParameters": {},
            "mediaFormat": {}
        }
    })
    .to_string()
}

#[tokio::test]
async fn test_twilio_mulaw_echo() {
    let (mut provider, mut bot, bridge) = start_twilio_bridge().await;

    let sender = provider.sender();
    sender
        .send(WireMessage::Text(json!({"event": "connected"}).to_string()))
        .await
        .unwrap();
    sender.send(WireMessage::Text(twilio_start_message())).await.unwrap();

    // The bot learns about the call first.
    let start_msg = recv_text(&mut bot).await;
    assert_eq!(start_msg["type"], "start");
    assert_eq!(start_msg["call_id"], "CAxyz");
    assert_eq!(start_msg["provider"], "twilio");

    // "fw==" is base64 for the single mu-law byte 0x7F, which decodes to
    // PCM16 sample 0.
    sender
        .send(WireMessage::Text(
            json!({"event": "media", "media": {"payload": "fw=="}}).to_string(),
        ))
        .await
        .unwrap();

    let inbound = recv_binary(&mut bot).await;
    assert_eq!(inbound, vec![0u8, 0u8], "bot should see the PCM16 decoding of 0x7F");

    // Echo the same two bytes back; the provider gets a Twilio media
    // message whose payload decodes back to silence.
    bot.sender().send(WireMessage::Binary(inbound)).await.unwrap();

    let media = recv_text(&mut provider).await;
    assert_eq!(media["event"], "media");
    assert_eq!(media["streamSid"], "MZabc");
    let payload = media["media"]["payload"].as_str().unwrap();
    use base64::Engine;
    let mulaw_bytes = base64::engine::general_purpose::STANDARD.decode(payload).unwrap();
    assert_eq!(mulaw_bytes.len(), 1);
    let sample = bytes_to_i16(&mulaw_decode(&mulaw_bytes))[0];
    assert_eq!(sample, 0, "echoed audio should still be silence");

    // Byte counters: one inbound mu-law byte, two bot-side PCM bytes.
    let session = bridge.sessions.get_by_call_id("CAxyz").expect("session indexed by call id");
    assert_eq!(session.audio_bytes_in(), 1);
    assert_eq!(session.audio_bytes_out(), 2);

    // Hang up from the provider side.
    sender
        .send(WireMessage::Text(json!({"event": "stop"}).to_string()))
        .await
        .unwrap();
    let stop_msg = recv_text(&mut bot).await;
    assert_eq!(stop_msg["type"], "stop");
    assert_eq!(stop_msg["call_id"], "CAxyz");
}

#[tokio::test]
async fn test_barge_in_clears_playback() {
    let (mut provider, mut bot, _bridge) = start_twilio_bridge().await;

    let sender = provider.sender();
    sender
        .send(WireMessage::Text(json!({"event": "connected"}).to_string()))
        .await
        .unwrap();
    sender.send(WireMessage::Text(twilio_start_message())).await.unwrap();
    let start_msg = recv_text(&mut bot).await;
    assert_eq!(start_msg["type"], "start");

    // Bot starts "speaking": a PCM16 chunk flows out toward the caller.
    let tts_chunk = i16_to_bytes(&[2000i16; 160]);
    bot.sender().send(WireMessage::Binary(tts_chunk)).await.unwrap();
    let media = recv_text(&mut provider).await;
    assert_eq!(media["event"], "media", "bot audio should reach the provider");

    // Caller talks over it: loud mu-law frames above the RMS threshold for
    // the configured number of consecutive frames.
    let loud_frame = mulaw_encode(&i16_to_bytes(&[8000i16; 160]));
    use base64::Engine;
    let loud_payload = base64::engine::general_purpose::STANDARD.encode(&loud_frame);
    for _ in 0..4 {
        sender
            .send(WireMessage::Text(
                json!({"event": "media", "media": {"payload": loud_payload}}).to_string(),
            ))
            .await
            .unwrap();
    }

    // The provider is told to flush buffered playback.
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        assert!(tokio::time::Instant::now() < deadline, "no clear message before timeout");
        let msg = recv_text(&mut provider).await;
        if msg["event"] == "clear" {
            assert_eq!(msg["streamSid"], "MZabc");
            break;
        }
    }

    // The bot is told to cancel TTS (its inbound stream also carries the
    // caller's converted audio frames).
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        assert!(tokio::time::Instant::now() < deadline, "no barge_in message before timeout");
        match recv(&mut bot).await {
            WireMessage::Text(text) => {
                let msg: Value = serde_json::from_str(&text).unwrap();
                if msg["type"] == "barge_in" {
                    break;
                }
            }
            WireMessage::Binary(_) => continue,
        }
    }
}

#[tokio::test]
async fn test_bot_stop_hangs_up_cleanly() {
    let (mut provider, mut bot, _bridge) = start_twilio_bridge().await;

    let sender = provider.sender();
    sender.send(WireMessage::Text(twilio_start_message())).await.unwrap();
    recv_text(&mut bot).await;

    // The bot ends the call; Twilio has no outbound CallEnded mapping, so
    // the bridge simply closes the provider socket.
    bot.sender()
        .send(WireMessage::Text(json!({"type": "stop", "reason": "bot_done"}).to_string()))
        .await
        .unwrap();

    let closed = timeout(WAIT, provider.recv()).await.expect("provider close timed out");
    assert!(closed.is_none(), "provider connection should close after bot stop");
}

#[tokio::test]
async fn test_resample_identity_over_wire() {
    // Sanity: with equal rates the bridge carries PCM byte-for-byte; the
    // resampler identity path is exercised by unit tests, this covers the
    // end-to-end path with a non-trivial payload.
    let (mut provider, mut bot, _bridge) = start_twilio_bridge().await;

    let sender = provider.sender();
    sender.send(WireMessage::Text(twilio_start_message())).await.unwrap();
    recv_text(&mut bot).await;

    let samples: Vec<i16> = (0..160).map(|i| (i * 199 % 4000) as i16).collect();
    let mulaw_payload = mulaw_encode(&i16_to_bytes(&samples));
    use base64::Engine;
    let payload = base64::engine::general_purpose::STANDARD.encode(&mulaw_payload);
    sender
        .send(WireMessage::Text(
            json!({"event": "media", "media": {"payload": payload}}).to_string(),
        ))
        .await
        .unwrap();

    let inbound = recv_binary(&mut bot).await;
    assert_eq!(inbound, mulaw_decode(&mulaw_payload), "pcm16 at equal rates is untouched");
}
