//! Turn detection.
//!
//! Decides when the caller has finished a conversational turn, combining
//! STT endpointing (final results) with silence timing. The detector is a
//! synchronous state machine; the orchestrator owns the actual silence
//! timer task and calls back in when it fires.
//!
//! States: `Idle` -> `Speaking` -> `AwaitingSilence` -> `TurnClosed`.

use std::time::Instant;
use tracing::{debug, info, warn};

use crate::providers::SttResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Speaking,
    AwaitingSilence,
    TurnClosed,
}

/// What the caller should do after feeding the detector.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnSignal {
    None,
    /// A final result landed: (re)start the silence timer.
    RestartSilenceTimer,
    /// A turn boundary was reached; process this transcript.
    EmitTurn(String),
}

/// How turn boundaries are decided: by the STT provider's endpointing plus a
/// silence window, or by silence alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointingMode {
    Stt,
    Silence,
}

pub struct TurnDetector {
    pub silence_threshold_ms: f64,
    pub min_turn_length: usize,
    pub max_turn_duration_ms: f64,
    pub endpointing_mode: EndpointingMode,

    state: TurnState,
    transcript: String,
    interim: String,
    last_speech: Option<Instant>,
    turn_start: Option<Instant>,
}

impl TurnDetector {
    pub fn new(silence_threshold_ms: f64) -> Self {
        Self {
            silence_threshold_ms,
            min_turn_length: 2,
            max_turn_duration_ms: 30_000.0,
            endpointing_mode: EndpointingMode::Stt,
            state: TurnState::Idle,
            transcript: String::new(),
            interim: String::new(),
            last_speech: None,
            turn_start: None,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn is_speaking(&self) -> bool {
        matches!(self.state, TurnState::Speaking | TurnState::AwaitingSilence)
    }

    /// The accumulated transcript including any uncommitted interim text.
    pub fn current_text(&self) -> String {
        let mut text = self.transcript.clone();
        if !self.interim.is_empty() {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&self.interim);
        }
        text.trim().to_string()
    }

    /// Feed an STT result and learn what to do next.
    pub fn on_stt_result(&mut self, result: &SttResult) -> TurnSignal {
        let now = Instant::now();

        // Empty final = utterance-end signal from the STT provider.
        if result.text.is_empty() && result.is_final {
            if !self.transcript.trim().is_empty() {
                return match self.close_turn() {
                    Some(t) => TurnSignal::EmitTurn(t),
                    None => TurnSignal::None,
                };
            }
            return TurnSignal::None;
        }

        let mut signal = TurnSignal::None;

        if !result.text.is_empty() {
            self.last_speech = Some(now);

            if matches!(self.state, TurnState::Idle | TurnState::TurnClosed) {
                self.state = TurnState::Speaking;
                self.turn_start = Some(now);
                debug!("turn started");
            }

            if result.is_final {
                if !self.transcript.is_empty() {
                    self.transcript.push(' ');
                }
                self.transcript.push_str(&result.text);
                self.interim.clear();

                if self.endpointing_mode == EndpointingMode::Stt {
                    self.state = TurnState::AwaitingSilence;
                    signal = TurnSignal::RestartSilenceTimer;
                }
            } else {
                self.interim = result.text.clone();
            }
        }

        // Runaway turns are force-closed.
        if let Some(start) = self.turn_start {
            if self.is_speaking()
                && start.elapsed().as_secs_f64() * 1000.0 > self.max_turn_duration_ms
            {
                warn!("max turn duration reached, forcing turn end");
                return match self.close_turn() {
                    Some(t) => TurnSignal::EmitTurn(t),
                    None => TurnSignal::None,
                };
            }
        }

        signal
    }

    /// The silence timer fired. Emits the turn when enough quiet time has
    /// actually passed since the last speech (a late timer from a superseded
    /// final is ignored).
    pub fn on_silence_elapsed(&mut self) -> Option<String> {
        if self.state != TurnState::AwaitingSilence {
            return None;
        }
        let elapsed_ms = self
            .last_speech
            .map(|t| t.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(f64::MAX);
        if elapsed_ms >= self.silence_threshold_ms * 0.8 {
            self.close_turn()
        } else {
            None
        }
    }

    /// Close the current turn. Returns the transcript, or `None` when it is
    /// under the minimum length (the turn is dropped either way).
    fn close_turn(&mut self) -> Option<String> {
        let transcript = self.current_text();
        self.state = TurnState::TurnClosed;
        self.transcript.clear();
        self.interim.clear();
        self.turn_start = None;

        if transcript.len() < self.min_turn_length {
            debug!("turn too short ({} chars), ignoring", transcript.len());
            return None;
        }
        info!("turn ended: '{}'", crate::pipeline::truncate_str(&transcript, 80));
        Some(transcript)
    }

    /// Reset for a new turn (e.g. after barge-in).
    pub fn reset(&mut self) {
        self.state = TurnState::Idle;
        self.transcript.clear();
        self.interim.clear();
        self.turn_start = None;
        self.last_speech = None;
    }
}
