//! ElevenLabs streaming text-to-speech.
//!
//! Uses the `stream-input` WebSocket API: a BOS message configures the
//! voice, sentences are pushed incrementally with `try_trigger_generation`,
//! and PCM audio streams back as base64 frames. A shared receive queue is
//! drained per sentence under an idle timeout; if no audio arrives within
//! the window the sentence is abandoned so the call never stalls.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info, warn};

use crate::core::events::Codec;
use crate::providers::{required_str, str_or, ProviderError, TextToSpeech, TtsChunk};

const BASE_WS_URL: &str = "wss://api.elevenlabs.io/v1/text-to-speech";
const DEFAULT_VOICE: &str = "21m00Tcm4TlvDq8ikWAM";

/// Per-sentence idle timeout: no audio for this long means the sentence is
/// done (or lost) and the stream for it is closed.
const SENTENCE_IDLE_TIMEOUT: Duration = Duration::from_secs(5);
/// Flush drains with a shorter window.
const FLUSH_IDLE_TIMEOUT: Duration = Duration::from_secs(3);

/// ElevenLabs stream-input TTS.
pub struct ElevenLabsTts {
    api_key: String,
    voice_id: String,
    model_id: String,
    output_format: String,
    stability: f64,
    similarity_boost: f64,
    sample_rate: u32,

    text_tx: Option<mpsc::Sender<String>>,
    audio_rx: Option<Arc<Mutex<mpsc::Receiver<TtsChunk>>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ElevenLabsTts {
    pub fn from_config(config: &Value) -> Result<Self, ProviderError> {
        let output_format = str_or(config, "output_format", "pcm_16000");
        let sample_rate = Self::parse_sample_rate(&output_format);
        Ok(Self {
            api_key: required_str(config, "api_key")?,
            voice_id: str_or(config, "voice_id", DEFAULT_VOICE),
            model_id: str_or(config, "model_id", "eleven_turbo_v2_5"),
            output_format,
            stability: config.get("stability").and_then(Value::as_f64).unwrap_or(0.5),
            similarity_boost: config.get("similarity_boost").and_then(Value::as_f64).unwrap_or(0.75),
            sample_rate,
            text_tx: None,
            audio_rx: None,
            tasks: Vec::new(),
        })
    }

    /// Extract the sample rate from an output format like `pcm_16000`.
    fn parse_sample_rate(output_format: &str) -> u32 {
        output_format
            .split('_')
            .filter_map(|part| part.parse::<u32>().ok())
            .find(|&rate| rate >= 8000)
            .unwrap_or(24000)
    }

    /// Forward chunks from the shared queue into a fresh per-call channel
    /// until a final marker or the idle timeout.
    fn drain_audio(&self, idle_timeout: Duration) -> Result<mpsc::Receiver<TtsChunk>, ProviderError> {
        let shared = self.audio_rx.clone().ok_or(ProviderError::NotConnected)?;
        let (tx, rx) = mpsc::channel::<TtsChunk>(64);

        spawn_forwarder(shared, tx, idle_timeout);
        Ok(rx)
    }
}

fn spawn_forwarder(
    shared: Arc<Mutex<mpsc::Receiver<TtsChunk>>>,
    tx: mpsc::Sender<TtsChunk>,
    idle_timeout: Duration,
) {
    tokio::spawn(async move {
        // The lock serialises sentences: one drain owns the queue at a time.
        let mut rx = shared.lock().await;
        loop {
            let chunk = match tokio::time::timeout(idle_timeout, rx.recv()).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(_) => {
                    warn!("tts audio idle timeout, abandoning sentence");
                    break;
                }
            };
            let is_final = chunk.is_final;
            if !chunk.audio.is_empty() && tx.send(chunk).await.is_err() {
                break;
            }
            if is_final {
                break;
            }
        }
    });
}

#[async_trait::async_trait]
impl TextToSpeech for ElevenLabsTts {
    async fn connect(&mut self) -> Result<(), ProviderError> {
        let url = format!(
            "{BASE_WS_URL}/{}/stream-input?model_id={}&output_format={}&optimize_streaming_latency=3",
            self.voice_id, self.model_id, self.output_format,
        );
        let mut request = url
            .into_client_request()
            .map_err(|e| ProviderError::Connect(e.to_string()))?;
        let key = HeaderValue::from_str(&self.api_key)
            .map_err(|e| ProviderError::Connect(e.to_string()))?;
        request.headers_mut().insert("xi-api-key", key);

        info!("connecting to elevenlabs tts (voice={})", self.voice_id);
        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| ProviderError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        // Beginning-of-stream message carries the voice settings.
        let bos = json!({
            "text": " ",
            "voice_settings": {
                "stability": self.stability,
                "similarity_boost": self.similarity_boost,
            },
        });
        sink.send(WsMessage::Text(bos.to_string()))
            .await
            .map_err(|e| ProviderError::Connect(e.to_string()))?;

        let (text_tx, mut text_rx) = mpsc::channel::<String>(64);
        self.tasks.push(tokio::spawn(async move {
            while let Some(msg) = text_rx.recv().await {
                if sink.send(WsMessage::Text(msg)).await.is_err() {
                    break;
                }
            }
            let _ = sink.send(WsMessage::Text(json!({"text": ""}).to_string())).await;
            let _ = sink.close().await;
        }));

        let sample_rate = self.sample_rate;
        let (audio_tx, audio_rx) = mpsc::channel::<TtsChunk>(256);
        self.tasks.push(tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let text = match msg {
                    Ok(WsMessage::Text(t)) => t,
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let data: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(_) => continue,
                };

                if let Some(audio_b64) = data.get("audio").and_then(Value::as_str) {
                    match BASE64.decode(audio_b64) {
                        Ok(audio) if !audio.is_empty() => {
                            let chunk = TtsChunk { audio, sample_rate, is_final: false };
                            if audio_tx.send(chunk).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => error!("elevenlabs sent undecodable audio: {e}"),
                    }
                }

                if data.get("isFinal").and_then(Value::as_bool).unwrap_or(false) {
                    let marker = TtsChunk { audio: Vec::new(), sample_rate, is_final: true };
                    if audio_tx.send(marker).await.is_err() {
                        break;
                    }
                }
            }
        }));

        self.text_tx = Some(text_tx);
        self.audio_rx = Some(Arc::new(Mutex::new(audio_rx)));
        info!("elevenlabs tts connected");
        Ok(())
    }

    async fn synthesize(&self, text: &str) -> Result<mpsc::Receiver<TtsChunk>, ProviderError> {
        let tx = self.text_tx.as_ref().ok_or(ProviderError::NotConnected)?;
        let msg = json!({"text": text, "try_trigger_generation": true});
        tx.send(msg.to_string())
            .await
            .map_err(|_| ProviderError::NotConnected)?;
        self.drain_audio(SENTENCE_IDLE_TIMEOUT)
    }

    async fn flush(&self) -> Result<mpsc::Receiver<TtsChunk>, ProviderError> {
        let tx = self.text_tx.as_ref().ok_or(ProviderError::NotConnected)?;
        tx.send(json!({"text": ""}).to_string())
            .await
            .map_err(|_| ProviderError::NotConnected)?;
        self.drain_audio(FLUSH_IDLE_TIMEOUT)
    }

    async fn close(&mut self) {
        // Dropping the text sender makes the writer send EOS and close.
        self.text_tx = None;
        self.audio_rx = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("elevenlabs tts closed");
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn codec(&self) -> Codec {
        Codec::Pcm16
    }

    fn name(&self) -> &'static str {
        "elevenlabs"
    }
}
