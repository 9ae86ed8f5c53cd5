//! Call session management.
//!
//! Each active call gets a [`CallSession`] tracking its identity, codec
//! pipeline, counters, and lifecycle. Sessions are shared between the two
//! forwarding loops of a call, so the mutable pieces are atomics and small
//! mutexes; the [`SessionStore`] is the only process-wide shared structure.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::codecs::{CodecError, CodecRegistry};
use crate::audio::resampler::Resampler;
use crate::audio::rms;
use crate::core::events::{CallDirection, Codec, Metadata};

/// Outbound audio queue capacity, in chunks. At 20 ms frames this is ten
/// seconds of buffered speech.
const OUTBOUND_QUEUE_CAPACITY: usize = 500;

/// An item on the outbound path: audio for the provider, or a playback mark
/// that must stay ordered behind the audio preceding it.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundChunk {
    Audio(Vec<u8>),
    Mark(String),
}

/// Bounded queue between the bot side and the provider-bound writer task.
/// When full, the oldest chunk is dropped so playback stays current rather
/// than accumulating backlog.
pub struct OutboundAudioQueue {
    items: Mutex<VecDeque<OutboundChunk>>,
    notify: Notify,
    /// Bumped on every clear so the writer can drop a chunk popped just
    /// before the flush, keeping the clear message ahead of stale audio.
    epoch: AtomicU64,
}

impl OutboundAudioQueue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn push(&self, chunk: OutboundChunk) {
        {
            let mut items = self.items.lock();
            if items.len() >= OUTBOUND_QUEUE_CAPACITY {
                items.pop_front();
                warn!("outbound audio queue full, dropped oldest chunk");
            }
            items.push_back(chunk);
        }
        self.notify.notify_one();
    }

    /// Pop the next chunk, waiting until one is available.
    pub async fn pop(&self) -> OutboundChunk {
        loop {
            if let Some(chunk) = self.items.lock().pop_front() {
                return chunk;
            }
            self.notify.notified().await;
        }
    }

    /// Drop everything queued. Returns the number of audio chunks cleared.
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let cleared = items
            .iter()
            .filter(|c| matches!(c, OutboundChunk::Audio(_)))
            .count();
        items.clear();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        cleared
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

/// Caller-identity fields assigned when `CallStarted` arrives.
#[derive(Debug, Default, Clone)]
pub struct CallInfo {
    pub call_id: String,
    pub from_number: String,
    pub to_number: String,
    pub direction: CallDirection,
    pub sip_headers: HashMap<String, String>,
    pub metadata: Metadata,
}

/// A single active call flowing through the bridge.
///
/// Owns the codec pipeline and the outbound audio queue; the transports and
/// serializer live with the per-connection loops that use them. Shared
/// between tasks behind an `Arc`.
pub struct CallSession {
    pub session_id: String,
    pub provider: String,
    codecs: Arc<CodecRegistry>,
    inbound_resampler: Option<Resampler>,
    outbound_resampler: Option<Resampler>,

    info: Mutex<CallInfo>,

    is_active: AtomicBool,
    is_on_hold: AtomicBool,
    is_bot_speaking: AtomicBool,
    barge_in_enabled: AtomicBool,

    audio_bytes_in: AtomicU64,
    audio_bytes_out: AtomicU64,

    started_at: Instant,
    /// Wall-clock start, for call records and status reporting.
    pub started_at_utc: DateTime<Utc>,
    ended_at: Mutex<Option<Instant>>,

    pub outbound_audio: OutboundAudioQueue,
    pending_marks: Mutex<Vec<String>>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CallSession {
    /// Create a session for `provider`. Resamplers are constructed only when
    /// the provider and bot rates differ: inbound provider->bot, outbound
    /// bot->provider.
    pub fn new(
        provider: impl Into<String>,
        codecs: Arc<CodecRegistry>,
        provider_rate: u32,
        bot_rate: u32,
    ) -> Self {
        let (inbound, outbound) = if provider_rate != bot_rate {
            (
                Some(Resampler::new(provider_rate, bot_rate)),
                Some(Resampler::new(bot_rate, provider_rate)),
            )
        } else {
            (None, None)
        };

        Self {
            session_id: Uuid::new_v4().to_string(),
            provider: provider.into(),
            codecs,
            inbound_resampler: inbound,
            outbound_resampler: outbound,
            info: Mutex::new(CallInfo::default()),
            is_active: AtomicBool::new(true),
            is_on_hold: AtomicBool::new(false),
            is_bot_speaking: AtomicBool::new(false),
            barge_in_enabled: AtomicBool::new(true),
            audio_bytes_in: AtomicU64::new(0),
            audio_bytes_out: AtomicU64::new(0),
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            ended_at: Mutex::new(None),
            outbound_audio: OutboundAudioQueue::new(),
            pending_marks: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    // ─── Identity ───────────────────────────────────────────────────────────

    pub fn set_call_info(&self, info: CallInfo) {
        *self.info.lock() = info;
    }

    pub fn call_info(&self) -> CallInfo {
        self.info.lock().clone()
    }

    pub fn call_id(&self) -> String {
        self.info.lock().call_id.clone()
    }

    // ─── Codec pipeline ─────────────────────────────────────────────────────

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    pub fn has_resamplers(&self) -> bool {
        self.inbound_resampler.is_some()
    }

    /// Provider -> bot: codec convert to the bot codec, then resample from
    /// the provider rate to the bot rate. The resample step runs on PCM16
    /// output of the conversion, which is the common bot format.
    pub fn convert_inbound(&self, data: &[u8], from: Codec, to: Codec) -> Result<Vec<u8>, CodecError> {
        let converted = self.codecs.convert(data, from, to)?;
        match &self.inbound_resampler {
            Some(r) => Ok(r.process(&converted).into_owned()),
            None => Ok(converted),
        }
    }

    /// Bot -> provider: resample first (the outbound resampler's input rate
    /// is the bot rate), then codec convert to the provider codec.
    pub fn convert_outbound(&self, data: &[u8], from: Codec, to: Codec) -> Result<Vec<u8>, CodecError> {
        let resampled = match &self.outbound_resampler {
            Some(r) => r.process(data).into_owned(),
            None => data.to_vec(),
        };
        self.codecs.convert(&resampled, from, to)
    }

    // ─── Flags and counters ─────────────────────────────────────────────────

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }

    pub fn is_on_hold(&self) -> bool {
        self.is_on_hold.load(Ordering::SeqCst)
    }

    pub fn set_on_hold(&self, on_hold: bool) {
        self.is_on_hold.store(on_hold, Ordering::SeqCst);
    }

    pub fn is_bot_speaking(&self) -> bool {
        self.is_bot_speaking.load(Ordering::SeqCst)
    }

    pub fn set_bot_speaking(&self, speaking: bool) {
        self.is_bot_speaking.store(speaking, Ordering::SeqCst);
    }

    pub fn barge_in_enabled(&self) -> bool {
        self.barge_in_enabled.load(Ordering::SeqCst)
    }

    pub fn set_barge_in_enabled(&self, enabled: bool) {
        self.barge_in_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn add_audio_bytes_in(&self, n: usize) {
        self.audio_bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_audio_bytes_out(&self, n: usize) {
        self.audio_bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn audio_bytes_in(&self) -> u64 {
        self.audio_bytes_in.load(Ordering::Relaxed)
    }

    pub fn audio_bytes_out(&self) -> u64 {
        self.audio_bytes_out.load(Ordering::Relaxed)
    }

    // ─── Barge-in support ───────────────────────────────────────────────────

    /// Flush queued outbound audio and mark the bot silent. Returns the
    /// number of audio chunks cleared.
    pub fn clear_outbound_audio(&self) -> usize {
        let cleared = self.outbound_audio.clear();
        self.set_bot_speaking(false);
        cleared
    }

    // ─── Marks ──────────────────────────────────────────────────────────────

    pub fn add_pending_mark(&self, name: impl Into<String>) {
        self.pending_marks.lock().push(name.into());
    }

    /// Resolve a provider playback report against the pending list.
    pub fn take_pending_mark(&self, name: &str) -> bool {
        let mut marks = self.pending_marks.lock();
        if let Some(pos) = marks.iter().position(|m| m == name) {
            marks.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn pending_mark_count(&self) -> usize {
        self.pending_marks.lock().len()
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    /// Track a per-session task so `end()` can cancel it.
    pub fn track_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Mark the session ended and cancel its tasks. Idempotent.
    pub fn end(&self) {
        if self.is_active.swap(false, Ordering::SeqCst) {
            *self.ended_at.lock() = Some(Instant::now());
            let tasks = std::mem::take(&mut *self.tasks.lock());
            for task in &tasks {
                task.abort();
            }
            debug!(session_id = %self.session_id, "session ended, {} tasks cancelled", tasks.len());
        }
    }

    pub fn ended_at(&self) -> Option<Instant> {
        *self.ended_at.lock()
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.ended_at().unwrap_or_else(Instant::now);
        end.duration_since(self.started_at).as_millis() as u64
    }
}

// ---------------------------------------------------------------------------
// Session store
// ---------------------------------------------------------------------------

/// Concurrent store of active sessions, keyed by session id with a secondary
/// call-id index. The canonical owner is the session-id map.
pub struct SessionStore {
    sessions: DashMap<String, Arc<CallSession>>,
    call_index: DashMap<String, String>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self { sessions: DashMap::new(), call_index: DashMap::new() }
    }

    pub fn insert(&self, session: Arc<CallSession>) {
        let call_id = session.call_id();
        if !call_id.is_empty() {
            self.call_index.insert(call_id, session.session_id.clone());
        }
        info!(session_id = %session.session_id, provider = %session.provider, "session created");
        self.sessions.insert(session.session_id.clone(), session);
    }

    /// Index a session under the call id the provider assigned.
    pub fn bind_call_id(&self, session: &CallSession, call_id: &str) {
        if !call_id.is_empty() {
            self.call_index.insert(call_id.to_string(), session.session_id.clone());
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<CallSession>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn get_by_call_id(&self, call_id: &str) -> Option<Arc<CallSession>> {
        let session_id = self.call_index.get(call_id)?.clone();
        self.get(&session_id)
    }

    /// End and remove a session. Idempotent.
    pub fn remove(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            session.end();
            self.call_index.remove(&session.call_id());
            info!(
                session_id = %session.session_id,
                started_at = %session.started_at_utc,
                duration_ms = session.duration_ms(),
                "session removed"
            );
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_active()).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove all ended sessions. Returns the count removed.
    pub fn cleanup(&self) -> usize {
        let ended: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| !s.is_active())
            .map(|s| s.session_id.clone())
            .collect();
        for session_id in &ended {
            self.remove(session_id);
        }
        ended.len()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Barge-in detection
// ---------------------------------------------------------------------------

/// RMS-energy barge-in detector over inbound PCM16 frames.
///
/// Arms after `min_frames` consecutive frames at or above `threshold`, then
/// rearms so a sustained utterance fires once.
pub struct BargeInDetector {
    threshold: f32,
    min_frames: u32,
    consecutive: u32,
}

impl BargeInDetector {
    pub fn new(threshold: f32, min_frames: u32) -> Self {
        Self { threshold, min_frames: min_frames.max(1), consecutive: 0 }
    }

    /// Feed one inbound PCM16 frame. Returns the frame's RMS energy when the
    /// consecutive-frame threshold is crossed.
    pub fn process_frame(&mut self, pcm: &[u8]) -> Option<f32> {
        let energy = rms(pcm);
        if energy >= self.threshold {
            self.consecutive += 1;
            if self.consecutive >= self.min_frames {
                self.consecutive = 0;
                return Some(energy);
            }
        } else {
            self.consecutive = 0;
        }
        None
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::i16_to_bytes;

    fn session() -> CallSession {
        CallSession::new("twilio", Arc::new(CodecRegistry::new()), 8000, 16000)
    }

    #[test]
    fn test_end_sets_invariants() {
        let s = session();
        assert!(s.is_active());
        assert!(s.ended_at().is_none());

        s.end();
        assert!(!s.is_active());
        assert!(s.ended_at().is_some(), "inactive session must have ended_at");
        let d1 = s.duration_ms();

        // Idempotent: a second end does not move ended_at.
        s.end();
        assert!(s.duration_ms() >= d1);
    }

    #[test]
    fn test_resamplers_only_when_rates_differ() {
        let same = CallSession::new("twilio", Arc::new(CodecRegistry::new()), 8000, 8000);
        assert!(!same.has_resamplers());
        assert!(session().has_resamplers());
    }

    #[test]
    fn test_convert_inbound_identity_codec_same_rate() {
        let s = CallSession::new("amazon_connect", Arc::new(CodecRegistry::new()), 8000, 8000);
        let data = vec![1u8, 2, 3, 4];
        assert_eq!(s.convert_inbound(&data, Codec::Pcm16, Codec::Pcm16).unwrap(), data);
    }

    #[test]
    fn test_convert_inbound_resamples_after_decode() {
        // mu-law 8k -> pcm16 16k: each mu-law byte becomes two samples of
        // two bytes each.
        let s = session();
        let out = s.convert_inbound(&[0x7f; 160], Codec::Mulaw, Codec::Pcm16).unwrap();
        assert_eq!(out.len(), 160 * 2 * 2);
    }

    #[test]
    fn test_convert_outbound_resamples_before_encode() {
        // pcm16 16k -> mu-law 8k: 320 samples become 160 mu-law bytes.
        let s = session();
        let pcm = i16_to_bytes(&[1000; 320]);
        let out = s.convert_outbound(&pcm, Codec::Pcm16, Codec::Mulaw).unwrap();
        assert_eq!(out.len(), 160);
    }

    #[test]
    fn test_outbound_queue_clear_reports_count() {
        let s = session();
        for _ in 0..10 {
            s.outbound_audio.push(OutboundChunk::Audio(vec![0u8; 320]));
        }
        s.outbound_audio.push(OutboundChunk::Mark("m1".into()));
        s.set_bot_speaking(true);

        let cleared = s.clear_outbound_audio();
        assert_eq!(cleared, 10, "marks do not count as cleared audio");
        assert!(s.outbound_audio.is_empty());
        assert!(!s.is_bot_speaking());
    }

    #[test]
    fn test_outbound_queue_pop_order() {
        tokio_test::block_on(async {
            let q = OutboundAudioQueue::new();
            q.push(OutboundChunk::Audio(vec![1]));
            q.push(OutboundChunk::Mark("m".into()));
            q.push(OutboundChunk::Audio(vec![2]));

            assert_eq!(q.pop().await, OutboundChunk::Audio(vec![1]));
            assert_eq!(q.pop().await, OutboundChunk::Mark("m".into()));
            assert_eq!(q.pop().await, OutboundChunk::Audio(vec![2]));
        });
    }

    #[test]
    fn test_pending_marks() {
        let s = session();
        s.add_pending_mark("m1");
        s.add_pending_mark("m2");
        assert!(s.take_pending_mark("m1"));
        assert!(!s.take_pending_mark("m1"));
        assert_eq!(s.pending_mark_count(), 1);
    }

    #[test]
    fn test_store_create_and_lookup() {
        let store = SessionStore::new();
        let s = Arc::new(session());
        s.set_call_info(CallInfo { call_id: "call-1".into(), ..Default::default() });
        store.insert(s.clone());

        assert!(store.get(&s.session_id).is_some());
        assert_eq!(store.get_by_call_id("call-1").unwrap().session_id, s.session_id);
        assert_eq!(store.active_count(), 1);
    }

    #[test]
    fn test_store_bind_call_id_later() {
        let store = SessionStore::new();
        let s = Arc::new(session());
        store.insert(s.clone());
        assert!(store.get_by_call_id("late-id").is_none());

        s.set_call_info(CallInfo { call_id: "late-id".into(), ..Default::default() });
        store.bind_call_id(&s, "late-id");
        assert!(store.get_by_call_id("late-id").is_some());
    }

    #[test]
    fn test_store_remove_ends_session() {
        let store = SessionStore::new();
        let s = Arc::new(session());
        let id = s.session_id.clone();
        store.insert(s.clone());

        store.remove(&id);
        assert!(store.get(&id).is_none());
        assert!(!s.is_active());
        assert_eq!(store.active_count(), 0);

        // Removing again is a no-op.
        store.remove(&id);
    }

    #[test]
    fn test_store_cleanup() {
        let store = SessionStore::new();
        let s1 = Arc::new(session());
        let s2 = Arc::new(session());
        store.insert(s1.clone());
        store.insert(s2);

        s1.end();
        assert_eq!(store.cleanup(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.active_count(), 1);
    }

    #[test]
    fn test_barge_in_requires_consecutive_frames() {
        let mut detector = BargeInDetector::new(500.0, 3);
        let loud = i16_to_bytes(&[8000; 160]);
        let quiet = i16_to_bytes(&[10; 160]);

        assert!(detector.process_frame(&loud).is_none());
        assert!(detector.process_frame(&loud).is_none());
        let energy = detector.process_frame(&loud);
        assert!(energy.is_some(), "third consecutive loud frame should trigger");
        assert!(energy.unwrap() > 500.0);

        // A quiet frame resets the streak.
        assert!(detector.process_frame(&loud).is_none());
        assert!(detector.process_frame(&quiet).is_none());
        assert!(detector.process_frame(&loud).is_none());
        assert!(detector.process_frame(&loud).is_none());
        assert!(detector.process_frame(&loud).is_some());
    }
}
