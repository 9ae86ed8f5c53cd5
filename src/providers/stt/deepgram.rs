//! Deepgram streaming speech-to-text.
//!
//! Connects to Deepgram's real-time WebSocket API and streams audio for
//! low-latency transcription with interim results, endpointing, and
//! word-level timestamps. `UtteranceEnd` messages surface as empty final
//! results, which the turn detector treats as endpointing signals.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info};

use crate::core::events::Codec;
use crate::providers::{required_str, str_or, u64_or, ProviderError, SpeechToText, SttResult};

const DEEPGRAM_WS_URL: &str = "wss://api.deepgram.com/v1/listen";

/// Deepgram live transcription over WebSocket.
pub struct DeepgramStt {
    api_key: String,
    model: String,
    language: String,
    sample_rate: u32,
    encoding: String,
    interim_results: bool,
    endpointing_ms: u64,
    smart_format: bool,
    vad_events: bool,
    utterance_end_ms: u64,

    audio_tx: Option<mpsc::Sender<Vec<u8>>>,
    results_rx: Option<mpsc::Receiver<SttResult>>,
    tasks: Vec<JoinHandle<()>>,
}

impl DeepgramStt {
    pub fn from_config(config: &Value) -> Result<Self, ProviderError> {
        Ok(Self {
            api_key: required_str(config, "api_key")?,
            model: str_or(config, "model", "nova-2"),
            language: str_or(config, "language", "en-US"),
            sample_rate: u64_or(config, "sample_rate", 16000) as u32,
            encoding: str_or(config, "encoding", "linear16"),
            interim_results: config.get("interim_results").and_then(Value::as_bool).unwrap_or(true),
            endpointing_ms: u64_or(config, "endpointing", 300),
            smart_format: config.get("smart_format").and_then(Value::as_bool).unwrap_or(true),
            vad_events: config.get("vad_events").and_then(Value::as_bool).unwrap_or(true),
            utterance_end_ms: u64_or(config, "utterance_end_ms", 1000),
            audio_tx: None,
            results_rx: None,
            tasks: Vec::new(),
        })
    }

    fn listen_url(&self) -> String {
        format!(
            "{DEEPGRAM_WS_URL}?model={}&language={}&sample_rate={}&encoding={}&channels=1\
             &interim_results={}&endpointing={}&smart_format={}&vad_events={}&utterance_end_ms={}",
            self.model,
            self.language,
            self.sample_rate,
            self.encoding,
            self.interim_results,
            self.endpointing_ms,
            self.smart_format,
            self.vad_events,
            self.utterance_end_ms,
        )
    }

    fn parse_result(data: &Value) -> Option<SttResult> {
        let alternatives = data.get("channel")?.get("alternatives")?.as_array()?;
        let best = alternatives.first()?;
        let transcript = best.get("transcript")?.as_str()?.trim();
        if transcript.is_empty() {
            return None;
        }

        let words = best
            .get("words")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Some(SttResult {
            text: transcript.to_string(),
            is_final: data.get("is_final").and_then(Value::as_bool).unwrap_or(false),
            confidence: best.get("confidence").and_then(Value::as_f64).unwrap_or(0.0) as f32,
            words,
        })
    }
}

#[async_trait::async_trait]
impl SpeechToText for DeepgramStt {
    async fn connect(&mut self) -> Result<(), ProviderError> {
        let mut request = self
            .listen_url()
            .into_client_request()
            .map_err(|e| ProviderError::Connect(e.to_string()))?;
        let token = HeaderValue::from_str(&format!("Token {}", self.api_key))
            .map_err(|e| ProviderError::Connect(e.to_string()))?;
        request.headers_mut().insert("Authorization", token);

        info!("connecting to deepgram stt (model={})", self.model);
        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| ProviderError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        // Writer: audio chunks in, CloseStream on channel end.
        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(64);
        self.tasks.push(tokio::spawn(async move {
            while let Some(chunk) = audio_rx.recv().await {
                if sink.send(WsMessage::Binary(chunk)).await.is_err() {
                    break;
                }
            }
            let close = json!({"type": "CloseStream"}).to_string();
            let _ = sink.send(WsMessage::Text(close)).await;
        }));

        // Reader: transcription results out.
        let (results_tx, results_rx) = mpsc::channel::<SttResult>(64);
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
                match data.get("type").and_then(Value::as_str).unwrap_or("") {
                    "Results" => {
                        if let Some(result) = DeepgramStt::parse_result(&data) {
                            if results_tx.send(result).await.is_err() {
                                break;
                            }
                        }
                    }
                    "UtteranceEnd" => {
                        if results_tx.send(SttResult::utterance_end()).await.is_err() {
                            break;
                        }
                    }
                    "Metadata" => debug!("deepgram metadata received"),
                    "Error" => error!("deepgram error: {data}"),
                    _ => {}
                }
            }
        }));

        self.audio_tx = Some(audio_tx);
        self.results_rx = Some(results_rx);
        info!("deepgram stt connected");
        Ok(())
    }

    async fn send_audio(&self, audio: &[u8]) -> Result<(), ProviderError> {
        let tx = self.audio_tx.as_ref().ok_or(ProviderError::NotConnected)?;
        tx.send(audio.to_vec())
            .await
            .map_err(|_| ProviderError::NotConnected)
    }

    fn take_results(&mut self) -> Option<mpsc::Receiver<SttResult>> {
        self.results_rx.take()
    }

    async fn close(&mut self) {
        // Dropping the audio sender makes the writer send CloseStream.
        self.audio_tx = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("deepgram stt closed");
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn codec(&self) -> Codec {
        if self.encoding == "linear16" { Codec::Pcm16 } else { Codec::Mulaw }
    }

    fn name(&self) -> &'static str {
        "deepgram"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_defaults() {
        let stt = DeepgramStt::from_config(&json!({"api_key": "dg"})).unwrap();
        assert_eq!(stt.model, "nova-2");
        assert_eq!(stt.sample_rate(), 16000);
        assert_eq!(stt.codec(), Codec::Pcm16);
        let url = stt.listen_url();
        assert!(url.contains("encoding=linear16"));
        assert!(url.contains("utterance_end_ms=1000"));
        assert!(url.contains("interim_results=true"));
    }

    #[test]
    fn test_missing_api_key() {
        assert!(matches!(
            DeepgramStt::from_config(&json!({})),
            Err(ProviderError::Config(k)) if k == "api_key"
        ));
    }

    #[test]
    fn test_parse_results_message() {
        let data = json!({
            "type": "Results",
            "is_final": true,
            "channel": {
                "alternatives": [{
                    "transcript": " hello world ",
                    "confidence": 0.97,
                    "words": [{"word": "hello", "start": 0.1, "end": 0.4}]
                }]
            }
        });
        let result = DeepgramStt::parse_result(&data).unwrap();
        assert_eq!(result.text, "hello world");
        assert!(result.is_final);
        assert!((result.confidence - 0.97).abs() < 1e-6);
        assert_eq!(result.words.len(), 1);
    }

    #[test]
    fn test_parse_skips_empty_transcript() {
        let data = json!({
            "type": "Results",
            "channel": {"alternatives": [{"transcript": "  "}]}
        });
        assert!(DeepgramStt::parse_result(&data).is_none());
    }
}
