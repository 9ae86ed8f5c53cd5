//! The central bridge orchestrator.
//!
//! `VoxBridge` wires together the provider listener, the per-provider
//! serializer, the codec pipeline, the session store, and either an external
//! voice-bot WebSocket or the built-in AI pipeline. Each accepted call runs
//! two forwarding loops (provider->bot and bot->provider) plus an outbound
//! writer draining the session's audio queue; the first loop to finish
//! cancels the rest and tears the session down.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::audio::codecs::CodecRegistry;
use crate::config::BridgeConfig;
use crate::core::events::{AudioFrame, BargeIn, CallEnded, ClearAudio, Codec, Event, Mark};
use crate::error::BridgeError;
use crate::pipeline::{PipelineEvent, PipelineHandle, PipelineOrchestrator, ToolExecutor};
use crate::providers::ProviderRegistry;
use crate::serializers::{Serializer, SerializerConfig, SerializerRegistry};
use crate::session::{BargeInDetector, CallInfo, CallSession, OutboundChunk, SessionStore};
use crate::transports::{
    Transport, TransportSender, WireMessage, WsClientTransport, WsListener, WsServerTransport,
};

type SharedSerializer = Arc<Mutex<Box<dyn Serializer>>>;

type CallStartHandler = Arc<dyn Fn(Arc<CallSession>) -> BoxFuture<'static, ()> + Send + Sync>;
type CallEndHandler =
    Arc<dyn Fn(Arc<CallSession>, CallEnded) -> BoxFuture<'static, ()> + Send + Sync>;
type AudioHandler =
    Arc<dyn Fn(Arc<CallSession>, AudioFrame) -> BoxFuture<'static, Option<AudioFrame>> + Send + Sync>;
type DtmfHandler = Arc<dyn Fn(Arc<CallSession>, String) -> BoxFuture<'static, ()> + Send + Sync>;
type SessionHandler = Arc<dyn Fn(Arc<CallSession>) -> BoxFuture<'static, ()> + Send + Sync>;
type AnyEventHandler =
    Arc<dyn Fn(Arc<CallSession>, Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Per-event-type handler lists, invoked in registration order. Read-only
/// once the bridge starts serving.
#[derive(Default)]
struct Handlers {
    call_start: Vec<CallStartHandler>,
    call_end: Vec<CallEndHandler>,
    audio: Vec<AudioHandler>,
    dtmf: Vec<DtmfHandler>,
    hold_start: Vec<SessionHandler>,
    hold_end: Vec<SessionHandler>,
    event: Vec<AnyEventHandler>,
}

/// Where a call's bot side lives: an external WebSocket or the built-in
/// pipeline.
enum BotLink {
    External(TransportSender),
    Pipeline(PipelineHandle),
}

/// Universal telephony bridge for voice bots.
///
/// Register handlers, then `run()` (or `serve()` an already-bound listener).
pub struct VoxBridge {
    config: BridgeConfig,
    pub sessions: Arc<SessionStore>,
    codecs: Arc<CodecRegistry>,
    serializers: SerializerRegistry,
    providers: Arc<ProviderRegistry>,
    handlers: Handlers,
    tool_executor: Option<ToolExecutor>,
}

impl VoxBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(SessionStore::new()),
            codecs: Arc::new(CodecRegistry::new()),
            serializers: SerializerRegistry::with_builtins(),
            providers: Arc::new(ProviderRegistry::with_builtins()),
            handlers: Handlers::default(),
            tool_executor: None,
        }
    }

    /// Swap in a codec registry with extra codecs registered. Must happen
    /// before any session exists.
    pub fn with_codec_registry(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = Arc::new(codecs);
        self
    }

    pub fn serializers_mut(&mut self) -> &mut SerializerRegistry {
        &mut self.serializers
    }

    pub fn set_tool_executor(&mut self, executor: ToolExecutor) {
        self.tool_executor = Some(executor);
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    // ─── Handler registration ───────────────────────────────────────────────

    /// Called when a call is established.
    pub fn on_call_start<F, Fut>(&mut self, f: F)
    where
        F: Fn(Arc<CallSession>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.call_start.push(Arc::new(move |s| f(s).boxed()));
    }

    /// Called when a call ends, with the terminating event.
    pub fn on_call_end<F, Fut>(&mut self, f: F)
    where
        F: Fn(Arc<CallSession>, CallEnded) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.call_end.push(Arc::new(move |s, e| f(s, e).boxed()));
    }

    /// Called for every inbound audio frame (provider -> bot direction
    /// only). Return the frame to forward it, a different frame to
    /// substitute it, or `None` to drop it.
    pub fn on_audio<F, Fut>(&mut self, f: F)
    where
        F: Fn(Arc<CallSession>, AudioFrame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<AudioFrame>> + Send + 'static,
    {
        self.handlers.audio.push(Arc::new(move |s, frame| f(s, frame).boxed()));
    }

    /// Called when a DTMF digit arrives.
    pub fn on_dtmf<F, Fut>(&mut self, f: F)
    where
        F: Fn(Arc<CallSession>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.dtmf.push(Arc::new(move |s, d| f(s, d).boxed()));
    }

    pub fn on_hold_start<F, Fut>(&mut self, f: F)
    where
        F: Fn(Arc<CallSession>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.hold_start.push(Arc::new(move |s| f(s).boxed()));
    }

    pub fn on_hold_end<F, Fut>(&mut self, f: F)
    where
        F: Fn(Arc<CallSession>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.hold_end.push(Arc::new(move |s| f(s).boxed()));
    }

    /// Catch-all: called for every event, before the typed handlers.
    pub fn on_event<F, Fut>(&mut self, f: F)
    where
        F: Fn(Arc<CallSession>, Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.event.push(Arc::new(move |s, e| f(s, e).boxed()));
    }

    // ─── Serving ────────────────────────────────────────────────────────────

    /// Bind the configured listener and serve until cancelled.
    pub async fn run(self) -> Result<(), BridgeError> {
        let listener = WsListener::bind(
            &self.config.provider.listen_host,
            self.config.provider.listen_port,
            &self.config.provider.listen_path,
        )
        .await?;
        Arc::new(self).serve(listener).await
    }

    /// Serve provider connections on an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: WsListener) -> Result<(), BridgeError> {
        info!(
            "bridge serving: provider={}, pipeline_mode={}",
            self.config.provider.provider_type,
            self.config.pipeline_mode()
        );
        loop {
            let provider = listener.accept().await?;
            let bridge = self.clone();
            tokio::spawn(async move {
                bridge.handle_provider_connection(provider).await;
            });
        }
    }

    // ─── Connection handling ────────────────────────────────────────────────

    async fn handle_provider_connection(self: Arc<Self>, mut provider: WsServerTransport) {
        let serializer_config = SerializerConfig {
            codec: self.config.audio.input_codec,
            sample_rate: self.config.audio.sample_rate,
        };
        let serializer = match self
            .serializers
            .create(&self.config.provider.provider_type, &serializer_config)
        {
            Ok(s) => Arc::new(Mutex::new(s)),
            Err(e) => {
                error!("cannot serve connection: {e}");
                provider.disconnect().await;
                return;
            }
        };

        let session = Arc::new(CallSession::new(
            self.config.provider.provider_type.clone(),
            self.codecs.clone(),
            self.config.audio.sample_rate,
            self.config.bot.sample_rate,
        ));
        self.sessions.insert(session.clone());
        info!(session_id = %session.session_id, "new provider connection");

        let provider_sender = provider.sender();

        // Outbound writer: drains the session queue toward the provider.
        {
            let writer = tokio::spawn(outbound_writer(
                session.clone(),
                serializer.clone(),
                provider_sender.clone(),
                self.config.audio.output_codec,
                self.config.audio.sample_rate,
            ));
            session.track_task(writer);
        }

        if self.config.pipeline_mode() {
            self.clone()
                .run_pipeline_call(provider, provider_sender.clone(), session.clone(), serializer)
                .await;
        } else {
            self.clone()
                .run_bot_call(provider, provider_sender.clone(), session.clone(), serializer)
                .await;
        }
        provider_sender.close().await;

        // Common teardown: a vanished peer ends the call.
        if session.is_active() {
            session.end();
            let mut ended = CallEnded::new(session.call_id(), "peer_disconnect");
            ended.duration_ms = session.duration_ms();
            self.dispatch_event(&session, &Event::CallEnded(ended)).await;
        }
        info!(
            session_id = %session.session_id,
            duration_ms = session.duration_ms(),
            audio_bytes_in = session.audio_bytes_in(),
            audio_bytes_out = session.audio_bytes_out(),
            "call finished"
        );
        self.sessions.remove(&session.session_id);
    }

    /// External-bot mode: dial the bot and run both directions.
    async fn run_bot_call(
        self: Arc<Self>,
        provider: WsServerTransport,
        provider_sender: TransportSender,
        session: Arc<CallSession>,
        serializer: SharedSerializer,
    ) {
        let mut bot = match WsClientTransport::connect(&self.config.bot.url).await {
            Ok(bot) => bot,
            Err(e) => {
                error!("failed to connect to bot at {}: {e}", self.config.bot.url);
                provider_sender.close().await;
                return;
            }
        };
        let bot_sender = bot.sender();

        let mut provider_task = {
            let bridge = self.clone();
            let session = session.clone();
            let serializer = serializer.clone();
            let provider_sender = provider_sender.clone();
            let bot_link = BotLink::External(bot_sender.clone());
            tokio::spawn(async move {
                bridge
                    .provider_loop(provider, provider_sender, session, serializer, bot_link)
                    .await;
            })
        };

        let mut bot_task = {
            let bridge = self.clone();
            let session = session.clone();
            tokio::spawn(async move {
                bridge.bot_loop(bot, session, serializer, provider_sender).await;
            })
        };

        // First direction to finish cancels the other.
        tokio::select! {
            _ = &mut provider_task => bot_task.abort(),
            _ = &mut bot_task => provider_task.abort(),
        }
        bot_sender.close().await;
    }

    /// Pipeline mode: start the internal STT -> LLM -> TTS chain instead of
    /// dialing a bot.
    async fn run_pipeline_call(
        self: Arc<Self>,
        provider: WsServerTransport,
        provider_sender: TransportSender,
        session: Arc<CallSession>,
        serializer: SharedSerializer,
    ) {
        let started = PipelineOrchestrator::start(
            self.config.pipeline.clone(),
            &self.providers,
            self.tool_executor.clone(),
        )
        .await;
        let (pipeline, mut audio_rx, mut events_rx) = match started {
            Ok(parts) => parts,
            Err(e) => {
                error!("failed to start pipeline: {e}");
                provider_sender.close().await;
                return;
            }
        };

        // Pipeline audio (bot codec/rate) -> outbound queue.
        {
            let session = session.clone();
            let session_for_tracking = session.clone();
            let bot_codec = self.config.bot.codec;
            let provider_codec = self.config.audio.output_codec;
            let task = tokio::spawn(async move {
                while let Some(chunk) = audio_rx.recv().await {
                    session.add_audio_bytes_out(chunk.len());
                    session.set_bot_speaking(true);
                    match session.convert_outbound(&chunk, bot_codec, provider_codec) {
                        Ok(converted) => {
                            session.outbound_audio.push(OutboundChunk::Audio(converted))
                        }
                        Err(e) => {
                            error!("outbound codec error: {e}");
                            break;
                        }
                    }
                }
            });
            session_for_tracking.track_task(task);
        }

        // Pipeline control events.
        {
            let session = session.clone();
            let session_for_tracking = session.clone();
            let serializer = serializer.clone();
            let provider_sender = provider_sender.clone();
            let pipeline_for_events = pipeline.clone();
            let transfer_number =
                self.config.pipeline.escalation_config.transfer_number.clone();
            let task = tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    match event {
                        PipelineEvent::Escalated(result) => {
                            info!("call escalated: {}", result.reason);
                            if !transfer_number.is_empty() {
                                let transfer = crate::core::events::TransferRequested::new(
                                    session.call_id(),
                                    transfer_number.clone(),
                                );
                                let wire = serializer
                                    .lock()
                                    .serialize(&Event::TransferRequested(transfer));
                                if let Some(wire) = wire {
                                    let _ = provider_sender.send(wire).await;
                                }
                            }
                        }
                        PipelineEvent::EndCall(reason) => {
                            info!("pipeline ended call: {reason}");
                            pipeline_for_events.stop().await;
                            let ended = CallEnded::new(session.call_id(), reason);
                            let wire = serializer.lock().serialize(&Event::CallEnded(ended));
                            if let Some(wire) = wire {
                                let _ = provider_sender.send(wire).await;
                            }
                            session.end();
                            provider_sender.close().await;
                            break;
                        }
                        PipelineEvent::Transcript { role, text } => {
                            debug!("transcript [{role}]: {text}");
                        }
                    }
                }
            });
            session_for_tracking.track_task(task);
        }

        let bot_link = BotLink::Pipeline(pipeline.clone());
        self.provider_loop(provider, provider_sender, session, serializer, bot_link)
            .await;
        pipeline.stop().await;
    }

    // ─── Provider-to-bot loop (hot path) ────────────────────────────────────

    async fn provider_loop(
        self: Arc<Self>,
        mut provider: WsServerTransport,
        provider_sender: TransportSender,
        session: Arc<CallSession>,
        serializer: SharedSerializer,
        bot: BotLink,
    ) {
        let mut barge_in = BargeInDetector::new(
            self.config.audio.barge_in_rms_threshold,
            self.config.audio.barge_in_min_frames,
        );

        while session.is_active() {
            let Some(raw) = provider.recv().await else { break };

            let events = serializer.lock().deserialize(&raw);

            // Some providers owe a response to their control messages.
            if let WireMessage::Text(text) = &raw {
                if let Ok(msg) = serde_json::from_str::<Value>(text) {
                    let response = serializer.lock().handshake_response(&msg);
                    if let Some(response) = response {
                        if provider_sender.send(WireMessage::Text(response)).await.is_err() {
                            break;
                        }
                    }
                }
            }

            for event in events {
                let keep_going = self
                    .process_provider_event(event, &session, &serializer, &provider_sender, &bot, &mut barge_in)
                    .await;
                if !keep_going {
                    return;
                }
            }
        }
    }

    /// Handle one inbound event. Returns `false` when the loop should stop.
    async fn process_provider_event(
        self: &Arc<Self>,
        event: Event,
        session: &Arc<CallSession>,
        serializer: &SharedSerializer,
        provider_sender: &TransportSender,
        bot: &BotLink,
        barge_in: &mut BargeInDetector,
    ) -> bool {
        self.dispatch_event(session, &event).await;

        match event {
            Event::CallStarted(started) => {
                session.set_call_info(CallInfo {
                    call_id: started.call_id.clone(),
                    from_number: started.from_number.clone(),
                    to_number: started.to_number.clone(),
                    direction: started.direction,
                    sip_headers: started.sip_headers.clone(),
                    metadata: started.metadata.clone(),
                });
                self.sessions.bind_call_id(session, &started.call_id);

                if let BotLink::External(bot_sender) = bot {
                    let start_msg = json!({
                        "type": "start",
                        "call_id": started.call_id,
                        "from": started.from_number,
                        "to": started.to_number,
                        "provider": started.provider,
                        "metadata": started.metadata,
                    });
                    if bot_sender.send(WireMessage::Text(start_msg.to_string())).await.is_err() {
                        return false;
                    }
                }
                true
            }

            Event::AudioFrame(frame) => {
                self.forward_inbound_audio(frame, session, serializer, provider_sender, bot, barge_in)
                    .await
            }

            Event::DtmfReceived(dtmf) => {
                match bot {
                    BotLink::External(bot_sender) => {
                        let msg = json!({
                            "type": "dtmf",
                            "call_id": dtmf.call_id,
                            "digit": dtmf.digit,
                        });
                        let _ = bot_sender.send(WireMessage::Text(msg.to_string())).await;
                    }
                    BotLink::Pipeline(pipeline) => pipeline.handle_dtmf(&dtmf.digit).await,
                }
                true
            }

            Event::CallEnded(ended) => {
                session.end();
                if let BotLink::External(bot_sender) = bot {
                    let msg = json!({
                        "type": "stop",
                        "call_id": ended.call_id,
                        "reason": ended.reason,
                    });
                    let _ = bot_sender.send(WireMessage::Text(msg.to_string())).await;
                }
                false
            }

            Event::Mark(mark) => {
                // Provider reported playback of a mark we sent earlier.
                session.take_pending_mark(&mark.name);
                true
            }

            Event::Custom(custom) => {
                // Provider-specific playback reports arrive as custom
                // events; a pending mark with a matching name is resolved
                // and re-fired as a local Mark.
                if custom.custom_type.ends_with(".mark") {
                    if let Some(name) = mark_name_from_payload(&custom.payload) {
                        if session.take_pending_mark(&name) {
                            let mark = Mark::new(custom.call_id.clone(), name);
                            self.dispatch_event(session, &Event::Mark(mark)).await;
                        }
                    }
                }
                true
            }

            Event::Error(err) => {
                if err.recoverable {
                    warn!("recoverable provider error: {} ({})", err.message, err.code);
                    true
                } else {
                    error!("fatal provider error: {} ({})", err.message, err.code);
                    self.end_call_with_reason(session, serializer, provider_sender, bot, &err.code)
                        .await;
                    false
                }
            }

            // Hold state flips inside dispatch_event; nothing to forward.
            _ => true,
        }
    }

    async fn forward_inbound_audio(
        self: &Arc<Self>,
        frame: AudioFrame,
        session: &Arc<CallSession>,
        serializer: &SharedSerializer,
        provider_sender: &TransportSender,
        bot: &BotLink,
        barge_in: &mut BargeInDetector,
    ) -> bool {
        session.add_audio_bytes_in(frame.data.len());

        // Audio handlers may rewrite or drop the frame.
        let mut current = Some(frame);
        for handler in &self.handlers.audio {
            let Some(frame) = current.take() else { break };
            match run_audio_handler(handler, session.clone(), frame).await {
                Some(next) => current = Some(next),
                None => {
                    current = None;
                    break;
                }
            }
        }
        let Some(frame) = current else { return true };
        if frame.data.is_empty() {
            return true;
        }

        // Barge-in: caller speech while the bot is playing audio.
        if self.config.pipeline.interruption_enabled
            && session.barge_in_enabled()
            && session.is_bot_speaking()
        {
            if let Ok(pcm) = session.codecs().decode(&frame.data, frame.codec) {
                if let Some(energy) = barge_in.process_frame(&pcm) {
                    self.handle_barge_in(session, serializer, provider_sender, bot, energy).await;
                }
            }
        } else {
            barge_in.reset();
        }

        let converted =
            match session.convert_inbound(&frame.data, frame.codec, self.config.bot.codec) {
                Ok(converted) => converted,
                Err(e) => {
                    error!("inbound codec error: {e}");
                    self.end_call_with_reason(session, serializer, provider_sender, bot, "codec_error")
                        .await;
                    return false;
                }
            };

        match bot {
            BotLink::External(bot_sender) => {
                bot_sender.send(WireMessage::Binary(converted)).await.is_ok()
            }
            BotLink::Pipeline(pipeline) => {
                pipeline.feed_audio(&converted).await;
                true
            }
        }
    }

    /// The barge-in protocol: emit the event, flush queued audio, tell the
    /// provider to discard its buffer, tell the bot to cancel TTS.
    async fn handle_barge_in(
        self: &Arc<Self>,
        session: &Arc<CallSession>,
        serializer: &SharedSerializer,
        provider_sender: &TransportSender,
        bot: &BotLink,
        energy: f32,
    ) {
        let barge = BargeIn::new(session.call_id(), energy);
        self.dispatch_event(session, &Event::BargeIn(barge)).await;

        let cleared = session.clear_outbound_audio();
        info!(cleared, energy, "barge-in: cleared outbound audio queue");

        let clear = ClearAudio::new(session.call_id());
        let wire = serializer.lock().serialize(&Event::ClearAudio(clear));
        if let Some(wire) = wire {
            let _ = provider_sender.send(wire).await;
        }

        match bot {
            BotLink::External(bot_sender) => {
                let msg = json!({"type": "barge_in"});
                let _ = bot_sender.send(WireMessage::Text(msg.to_string())).await;
            }
            BotLink::Pipeline(pipeline) => pipeline.handle_barge_in().await,
        }
    }

    /// End the call cleanly toward both peers.
    async fn end_call_with_reason(
        self: &Arc<Self>,
        session: &Arc<CallSession>,
        serializer: &SharedSerializer,
        provider_sender: &TransportSender,
        bot: &BotLink,
        reason: &str,
    ) {
        let ended = CallEnded::new(session.call_id(), reason);
        self.dispatch_event(session, &Event::CallEnded(ended.clone())).await;

        if let BotLink::External(bot_sender) = bot {
            let msg = json!({"type": "stop", "call_id": ended.call_id, "reason": reason});
            let _ = bot_sender.send(WireMessage::Text(msg.to_string())).await;
        }
        let wire = serializer.lock().serialize(&Event::CallEnded(ended));
        if let Some(wire) = wire {
            let _ = provider_sender.send(wire).await;
        }
        session.end();
        provider_sender.close().await;
    }

    // ─── Bot-to-provider loop ───────────────────────────────────────────────

    async fn bot_loop(
        self: Arc<Self>,
        mut bot: WsClientTransport,
        session: Arc<CallSession>,
        serializer: SharedSerializer,
        provider_sender: TransportSender,
    ) {
        let bot_codec = self.config.bot.codec;
        let provider_codec = self.config.audio.output_codec;

        while session.is_active() {
            let Some(raw) = bot.recv().await else { break };

            match raw {
                WireMessage::Binary(bytes) => {
                    session.add_audio_bytes_out(bytes.len());
                    session.set_bot_speaking(true);
                    match session.convert_outbound(&bytes, bot_codec, provider_codec) {
                        Ok(converted) => {
                            session.outbound_audio.push(OutboundChunk::Audio(converted));
                        }
                        Err(e) => {
                            error!("outbound codec error: {e}");
                            let ended = CallEnded::new(session.call_id(), "codec_error");
                            self.dispatch_event(&session, &Event::CallEnded(ended.clone())).await;
                            let wire = serializer.lock().serialize(&Event::CallEnded(ended));
                            if let Some(wire) = wire {
                                let _ = provider_sender.send(wire).await;
                            }
                            session.end();
                            return;
                        }
                    }
                }
                WireMessage::Text(text) => {
                    let Ok(msg) = serde_json::from_str::<Value>(&text) else {
                        warn!("invalid JSON from bot: {}", crate::pipeline::truncate_str(&text, 100));
                        continue;
                    };
                    match msg.get("type").and_then(Value::as_str).unwrap_or("") {
                        "stop" => {
                            let reason = msg
                                .get("reason")
                                .and_then(Value::as_str)
                                .unwrap_or("normal")
                                .to_string();
                            session.end();
                            let ended = CallEnded::new(session.call_id(), reason);
                            let wire = serializer.lock().serialize(&Event::CallEnded(ended));
                            if let Some(wire) = wire {
                                let _ = provider_sender.send(wire).await;
                            }
                            return;
                        }
                        // Marks ride the queue so they stay ordered behind
                        // the audio that precedes them.
                        "mark" => {
                            let name = msg
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string();
                            if !name.is_empty() {
                                session.outbound_audio.push(OutboundChunk::Mark(name));
                            }
                        }
                        other => debug!("unhandled bot message type: {other}"),
                    }
                }
            }
        }
    }

    // ─── Event dispatch ─────────────────────────────────────────────────────

    /// Dispatch an event to the catch-all and typed handler lists. Handlers
    /// run in registration order; one panicking does not stop the rest.
    pub async fn dispatch_event(&self, session: &Arc<CallSession>, event: &Event) {
        for handler in &self.handlers.event {
            run_handler(handler(session.clone(), event.clone())).await;
        }

        match event {
            Event::CallStarted(_) => {
                for handler in &self.handlers.call_start {
                    run_handler(handler(session.clone())).await;
                }
            }
            Event::CallEnded(ended) => {
                for handler in &self.handlers.call_end {
                    run_handler(handler(session.clone(), ended.clone())).await;
                }
            }
            Event::DtmfReceived(dtmf) => {
                for handler in &self.handlers.dtmf {
                    run_handler(handler(session.clone(), dtmf.digit.clone())).await;
                }
            }
            Event::HoldStarted(_) => {
                session.set_on_hold(true);
                for handler in &self.handlers.hold_start {
                    run_handler(handler(session.clone())).await;
                }
            }
            Event::HoldEnded(_) => {
                session.set_on_hold(false);
                for handler in &self.handlers.hold_end {
                    run_handler(handler(session.clone())).await;
                }
            }
            _ => {}
        }
    }
}

/// Await a handler future, containing any panic so subsequent handlers of
/// the same event still run.
async fn run_handler(fut: BoxFuture<'static, ()>) {
    if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
        error!("event handler panicked");
    }
}

async fn run_audio_handler(
    handler: &AudioHandler,
    session: Arc<CallSession>,
    frame: AudioFrame,
) -> Option<AudioFrame> {
    let fallback = frame.clone();
    match AssertUnwindSafe(handler(session, frame)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            error!("audio handler panicked, forwarding original frame");
            Some(fallback)
        }
    }
}

/// Per-session writer: drains the outbound queue toward the provider in
/// order. Marks are serialized after the audio chunk that precedes them and
/// recorded as pending until the provider reports playback.
async fn outbound_writer(
    session: Arc<CallSession>,
    serializer: SharedSerializer,
    provider_sender: TransportSender,
    provider_codec: Codec,
    provider_rate: u32,
) {
    loop {
        let chunk = session.outbound_audio.pop().await;
        let epoch = session.outbound_audio.epoch();
        match chunk {
            OutboundChunk::Audio(bytes) => {
                let frame = AudioFrame::new(session.call_id(), provider_codec, provider_rate, bytes);
                let wire = serializer.lock().serialize(&Event::AudioFrame(frame));
                // A clear that raced the pop wins: stale audio must not
                // follow the provider's clear message.
                if session.outbound_audio.epoch() != epoch {
                    continue;
                }
                if let Some(wire) = wire {
                    if provider_sender.send(wire).await.is_err() {
                        break;
                    }
                }
            }
            OutboundChunk::Mark(name) => {
                let mark = Mark::new(session.call_id(), name.clone());
                let wire = serializer.lock().serialize(&Event::Mark(mark));
                if let Some(wire) = wire {
                    if provider_sender.send(wire).await.is_err() {
                        break;
                    }
                }
                session.add_pending_mark(name);
            }
        }
    }
}

/// Dig a mark name out of a provider-specific payload (`{"name": ...}` or
/// `{"mark": {"name": ...}}`).
fn mark_name_from_payload(payload: &crate::core::events::Metadata) -> Option<String> {
    if let Some(name) = payload.get("name").and_then(Value::as_str) {
        return Some(name.to_string());
    }
    payload
        .get("mark")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
