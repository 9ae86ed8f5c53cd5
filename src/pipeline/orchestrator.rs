//! Pipeline orchestrator: the STT -> LLM -> TTS streaming loop.
//!
//! Each call in pipeline mode gets one orchestrator. Provider audio is fed
//! to STT; the turn detector decides when the caller has finished; the LLM
//! streams a response that is synthesized sentence-by-sentence so the first
//! audio leaves before the model has finished; tool calls execute and feed
//! back into a follow-up generation. Synthesized audio and control events
//! flow out over channels the bridge drains.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::pipeline::context::ConversationContext;
use crate::pipeline::escalation::{EscalationDetector, EscalationResult};
use crate::pipeline::turn_detector::{TurnDetector, TurnSignal};
use crate::providers::{
    LanguageModel, LlmToolCall, ProviderError, ProviderRegistry, SpeechToText, TextToSpeech,
};

/// Spoken when the LLM or TTS fails mid-turn; the pipeline then waits for
/// the caller instead of dying.
const FALLBACK_MESSAGE: &str = "I'm sorry, I had a brief issue. Could you repeat that?";

/// Consecutive generation failures before the pipeline gives up on the call.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Executes a tool call: `(name, arguments) -> result`.
pub type ToolExecutor =
    Arc<dyn Fn(String, Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Control events the pipeline reports to the bridge.
#[derive(Debug)]
pub enum PipelineEvent {
    /// Escalation fired; the transfer message has already been spoken.
    Escalated(EscalationResult),
    /// The pipeline wants the call to end (reason).
    EndCall(String),
    /// A finished transcript line (role, text).
    Transcript { role: &'static str, text: String },
}

struct PipelineInner {
    config: PipelineConfig,

    stt: AsyncMutex<Box<dyn SpeechToText>>,
    llm: AsyncMutex<Box<dyn LanguageModel>>,
    tts: AsyncMutex<Box<dyn TextToSpeech>>,

    turn_detector: Mutex<TurnDetector>,
    context: Mutex<ConversationContext>,
    escalation: Mutex<EscalationDetector>,

    audio_tx: mpsc::Sender<Vec<u8>>,
    events_tx: mpsc::Sender<PipelineEvent>,
    tool_executor: Option<ToolExecutor>,

    running: AtomicBool,
    is_speaking: AtomicBool,
    consecutive_failures: AtomicU32,
    started_at: Instant,

    listener_task: Mutex<Option<JoinHandle<()>>>,
    silence_task: Mutex<Option<JoinHandle<()>>>,
    generation_task: Mutex<Option<JoinHandle<()>>>,
}

/// The bridge's handle to a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    inner: Arc<PipelineInner>,
}

/// Builder/entry point for the pipeline.
pub struct PipelineOrchestrator;

impl PipelineOrchestrator {
    /// Create providers from the registry, connect them, and start the
    /// pipeline. Returns the control handle plus the synthesized-audio and
    /// control-event streams.
    pub async fn start(
        config: PipelineConfig,
        registry: &ProviderRegistry,
        tool_executor: Option<ToolExecutor>,
    ) -> Result<(PipelineHandle, mpsc::Receiver<Vec<u8>>, mpsc::Receiver<PipelineEvent>), ProviderError>
    {
        let stt = registry.create_stt(&config.stt.provider, &config.stt.config)?;
        let llm = registry.create_llm(&config.llm.provider, &config.llm.config)?;
        let tts = registry.create_tts(&config.tts.provider, &config.tts.config)?;
        Self::start_with_providers(config, stt, llm, tts, tool_executor).await
    }

    /// Start with already-constructed providers.
    pub async fn start_with_providers(
        config: PipelineConfig,
        mut stt: Box<dyn SpeechToText>,
        llm: Box<dyn LanguageModel>,
        mut tts: Box<dyn TextToSpeech>,
        tool_executor: Option<ToolExecutor>,
    ) -> Result<(PipelineHandle, mpsc::Receiver<Vec<u8>>, mpsc::Receiver<PipelineEvent>), ProviderError>
    {
        info!(
            "pipeline starting: stt={}, llm={}, tts={}",
            config.stt.provider, config.llm.provider, config.tts.provider
        );

        stt.connect().await?;
        tts.connect().await?;
        let results_rx = stt.take_results().ok_or(ProviderError::NotConnected)?;

        let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(256);
        let (events_tx, events_rx) = mpsc::channel::<PipelineEvent>(32);

        let context = ConversationContext::new(
            &config.system_prompt,
            &config.first_message,
            config.tools.clone(),
        );
        let turn_detector = TurnDetector::new(config.silence_threshold_ms);
        let escalation =
            EscalationDetector::new(config.escalation_enabled, config.escalation_config.clone());

        let inner = Arc::new(PipelineInner {
            stt: AsyncMutex::new(stt),
            llm: AsyncMutex::new(llm),
            tts: AsyncMutex::new(tts),
            turn_detector: Mutex::new(turn_detector),
            context: Mutex::new(context),
            escalation: Mutex::new(escalation),
            audio_tx,
            events_tx,
            tool_executor,
            running: AtomicBool::new(true),
            is_speaking: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            started_at: Instant::now(),
            listener_task: Mutex::new(None),
            silence_task: Mutex::new(None),
            generation_task: Mutex::new(None),
            config,
        });

        // Speak the greeting before any caller turn.
        if !inner.config.first_message.is_empty() {
            let greeting = inner.config.first_message.clone();
            inner.speak_text(&greeting).await;
            let _ = inner
                .events_tx
                .send(PipelineEvent::Transcript { role: "assistant", text: greeting })
                .await;
        }

        let listener = tokio::spawn(PipelineInner::stt_listener(inner.clone(), results_rx));
        *inner.listener_task.lock() = Some(listener);

        Ok((PipelineHandle { inner }, audio_rx, events_rx))
    }
}

impl PipelineHandle {
    /// Feed one chunk of caller audio (already in the pipeline's codec/rate).
    pub async fn feed_audio(&self, audio: &[u8]) {
        if !self.inner.running.load(Ordering::SeqCst) {
            return;
        }
        let stt = self.inner.stt.lock().await;
        if let Err(e) = stt.send_audio(audio).await {
            warn!("stt audio feed failed: {e}");
        }
    }

    /// Caller interrupted playback: cancel the in-flight generation and
    /// reset turn tracking. The bridge clears the session's outbound queue.
    pub async fn handle_barge_in(&self) {
        info!("pipeline: handling barge-in");
        self.inner.is_speaking.store(false, Ordering::SeqCst);
        self.inner.cancel_generation();
        self.inner.cancel_silence_timer();
        self.inner.turn_detector.lock().reset();
    }

    /// A DTMF digit arrived. `0` escalates; other digits are recorded as
    /// conversation context.
    pub async fn handle_dtmf(&self, digit: &str) {
        let result = self.inner.escalation.lock().check_dtmf(digit);
        if result.should_escalate {
            self.inner.handle_escalation(result).await;
            return;
        }
        self.inner.context.lock().add_user_message(&format!("[DTMF tone pressed: {digit}]"));
    }

    pub fn is_speaking(&self) -> bool {
        self.inner.is_speaking.load(Ordering::SeqCst)
    }

    pub fn interruption_enabled(&self) -> bool {
        self.inner.config.interruption_enabled
    }

    /// Stop the pipeline and release the providers.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("pipeline stopping");

        self.inner.cancel_generation();
        self.inner.cancel_silence_timer();
        if let Some(task) = self.inner.listener_task.lock().take() {
            task.abort();
        }

        self.inner.stt.lock().await.close().await;
        self.inner.tts.lock().await.close().await;
        self.inner.llm.lock().await.close().await;

        let (tokens, turns) = {
            let context = self.inner.context.lock();
            let escalation = self.inner.escalation.lock();
            (context.total_tokens(), escalation.turn_count())
        };
        info!(
            "pipeline stopped: duration={:.1}s, tokens={}, turns={}",
            self.inner.started_at.elapsed().as_secs_f64(),
            tokens,
            turns
        );
    }
}

impl PipelineInner {
    // ─── STT listening and turn boundaries ──────────────────────────────────

    async fn stt_listener(inner: Arc<Self>, results_rx: mpsc::Receiver<crate::providers::SttResult>) {
        use tokio_stream::StreamExt;
        let mut results = tokio_stream::wrappers::ReceiverStream::new(results_rx);
        while let Some(result) = results.next().await {
            if !inner.running.load(Ordering::SeqCst) {
                break;
            }

            // Max call duration gives a graceful end.
            let elapsed = inner.started_at.elapsed().as_secs();
            if elapsed > inner.config.max_call_duration_seconds {
                warn!("max call duration reached");
                let _ = inner.events_tx.send(PipelineEvent::EndCall("max_duration".into())).await;
                break;
            }

            let signal = inner.turn_detector.lock().on_stt_result(&result);
            match signal {
                TurnSignal::None => {}
                TurnSignal::RestartSilenceTimer => inner.clone().restart_silence_timer(),
                TurnSignal::EmitTurn(transcript) => inner.clone().process_turn(transcript).await,
            }
        }
    }

    fn restart_silence_timer(self: Arc<Self>) {
        self.cancel_silence_timer();
        let threshold = Duration::from_millis(self.config.silence_threshold_ms as u64);
        let inner = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(threshold).await;
            let turn = inner.turn_detector.lock().on_silence_elapsed();
            if let Some(transcript) = turn {
                inner.clone().process_turn(transcript).await;
            }
        });
        *self.silence_task.lock() = Some(task);
    }

    fn cancel_silence_timer(&self) {
        if let Some(task) = self.silence_task.lock().take() {
            task.abort();
        }
    }

    fn cancel_generation(&self) {
        if let Some(task) = self.generation_task.lock().take() {
            task.abort();
        }
    }

    // ─── Turn processing ────────────────────────────────────────────────────

    async fn process_turn(self: Arc<Self>, transcript: String) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        info!("processing turn: '{}'", crate::pipeline::truncate_str(&transcript, 80));

        self.context.lock().add_user_message(&transcript);
        let _ = self
            .events_tx
            .send(PipelineEvent::Transcript { role: "user", text: transcript.clone() })
            .await;

        // Escalation beats generation.
        let escalation_result = self.escalation.lock().check_user_message(&transcript);
        if escalation_result.should_escalate {
            self.handle_escalation(escalation_result).await;
            return;
        }

        // End-call phrases: let the model say goodbye, then hang up.
        let lowered = transcript.to_lowercase();
        for phrase in &self.config.end_call_phrases {
            if lowered.contains(&phrase.to_lowercase()) {
                let goodbye_prompt = format!(
                    "The caller said: '{transcript}'. \
                     Say a brief, polite goodbye and end the conversation."
                );
                self.context.lock().replace_last_user_message(&goodbye_prompt);
                self.clone().generate_and_speak().await;
                let _ =
                    self.events_tx.send(PipelineEvent::EndCall("caller_goodbye".into())).await;
                return;
            }
        }

        // A new turn supersedes any generation still in flight.
        self.cancel_generation();
        let inner = self.clone();
        let task = tokio::spawn(async move {
            inner.generate_and_speak().await;
        });
        *self.generation_task.lock() = Some(task);
    }

    /// Stream an LLM response, synthesizing complete sentences as they
    /// materialise, then run any tool calls and re-enter generation with
    /// the results.
    fn generate_and_speak(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            self.is_speaking.store(true, Ordering::SeqCst);

            let (messages, tools) = {
                let context = self.context.lock();
                (context.messages(), context.tools())
            };

            let generation = {
                let llm = self.llm.lock().await;
                llm.generate(
                    messages,
                    tools,
                    self.config.llm_temperature,
                    self.config.llm_max_tokens,
                )
                .await
            };
            let mut rx = match generation {
                Ok(rx) => rx,
                Err(e) => {
                    error!("llm generation failed: {e}");
                    self.speak_text(FALLBACK_MESSAGE).await;
                    self.record_generation_failure().await;
                    self.is_speaking.store(false, Ordering::SeqCst);
                    return;
                }
            };

            let mut full_response = String::new();
            let mut sentence_buffer = String::new();
            // tool_call_id -> (name, accumulated argument json)
            let mut pending_tool_calls: Vec<(String, String, String)> = Vec::new();
            let mut failed = false;

            while let Some(chunk) = rx.recv().await {
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }

                if let Some(message) = &chunk.error {
                    error!("generation error: {message}");
                    self.speak_text(FALLBACK_MESSAGE).await;
                    failed = true;
                    break;
                }

                if !chunk.text.is_empty() {
                    full_response.push_str(&chunk.text);
                    sentence_buffer.push_str(&chunk.text);

                    let mut sentences = split_sentences(&sentence_buffer);
                    sentence_buffer = sentences.pop().unwrap_or_default();
                    for sentence in sentences {
                        self.speak_text(&sentence).await;
                    }
                }

                if !chunk.tool_call_id.is_empty() {
                    match pending_tool_calls.iter_mut().find(|(id, _, _)| *id == chunk.tool_call_id)
                    {
                        Some(entry) => {
                            if !chunk.tool_name.is_empty() {
                                entry.1 = chunk.tool_name.clone();
                            }
                            entry.2 = chunk.tool_arguments.clone();
                        }
                        None => pending_tool_calls.push((
                            chunk.tool_call_id.clone(),
                            chunk.tool_name.clone(),
                            chunk.tool_arguments.clone(),
                        )),
                    }
                }

                if chunk.is_final {
                    self.context.lock().update_token_usage(chunk.input_tokens, chunk.output_tokens);
                }
            }

            // Flush whatever is left of the final sentence.
            let remainder = sentence_buffer.trim().to_string();
            if !failed && !remainder.is_empty() {
                self.speak_text(&remainder).await;
            }

            if failed {
                self.record_generation_failure().await;
            } else {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }

            if !failed && !pending_tool_calls.is_empty() {
                self.clone().run_tool_calls(full_response, pending_tool_calls).await;
                return;
            }

            if !full_response.trim().is_empty() {
                self.context.lock().add_assistant_message(&full_response);
                let _ = self
                    .events_tx
                    .send(PipelineEvent::Transcript { role: "assistant", text: full_response })
                    .await;
            }

            self.is_speaking.store(false, Ordering::SeqCst);
        }
        .boxed()
    }

    /// Execute accumulated tool calls and generate a follow-up response.
    async fn run_tool_calls(
        self: Arc<Self>,
        assistant_text: String,
        pending: Vec<(String, String, String)>,
    ) {
        let tool_calls: Vec<LlmToolCall> = pending
            .into_iter()
            .map(|(id, name, arguments)| LlmToolCall {
                id,
                name,
                arguments: serde_json::from_str(&arguments).unwrap_or(Value::Object(Default::default())),
            })
            .collect();

        self.context.lock().add_assistant_tool_calls(&assistant_text, tool_calls.clone());

        for tc in &tool_calls {
            info!("executing tool: {}({})", tc.name, tc.arguments);
            let result = match &self.tool_executor {
                Some(executor) => match executor(tc.name.clone(), tc.arguments.clone()).await {
                    Ok(value) => value,
                    Err(e) => {
                        error!("tool execution error: {e}");
                        Value::String(format!("Error: {e}"))
                    }
                },
                None => Value::String("Tool execution not configured".into()),
            };
            self.context.lock().add_tool_result(&tc.id, &tc.name, &result);
        }

        if self.running.load(Ordering::SeqCst) {
            self.generate_and_speak().await;
        }
    }

    // ─── Output ─────────────────────────────────────────────────────────────

    /// Synthesize one sentence and forward its audio to the bridge.
    async fn speak_text(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let synthesis = {
            let tts = self.tts.lock().await;
            tts.synthesize(text).await
        };
        let mut rx = match synthesis {
            Ok(rx) => rx,
            Err(e) => {
                error!("tts synthesis failed: {e}");
                return;
            }
        };
        while let Some(chunk) = rx.recv().await {
            if !chunk.audio.is_empty() && self.audio_tx.send(chunk.audio).await.is_err() {
                break;
            }
        }
    }

    /// Transient provider failures are tolerated; repeated failures end the
    /// call rather than leaving the caller with a looping apology.
    async fn record_generation_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= MAX_CONSECUTIVE_FAILURES {
            error!("{failures} consecutive generation failures, ending call");
            let _ = self.events_tx.send(PipelineEvent::EndCall("ai_provider_failure".into())).await;
        }
    }

    async fn handle_escalation(&self, result: EscalationResult) {
        info!("escalation: {}", result.reason);
        let transfer_message = self.escalation.lock().transfer_message().to_string();
        self.speak_text(&transfer_message).await;
        let _ = self.events_tx.send(PipelineEvent::Escalated(result)).await;
    }
}

/// Split text at sentence boundaries: `. ! ? : ;` followed by whitespace.
/// The last element is the (possibly incomplete, possibly empty) remainder.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?' | ':' | ';')
            && chars.peek().map(|n| n.is_whitespace()).unwrap_or(false)
        {
            while chars.peek().map(|n| n.is_whitespace()).unwrap_or(false) {
                chars.next();
            }
            sentences.push(std::mem::take(&mut current));
        }
    }
    sentences.push(current);
    sentences
}
