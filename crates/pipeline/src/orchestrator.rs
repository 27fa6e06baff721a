//! Utterance lifecycle orchestrator
//!
//! Owns every live utterance and drives each one through the
//! STT → MT → TTS stages on the task queue. Admission is bounded: creation
//! fails once the configured number of utterances is active. Callbacks fire
//! on cloned snapshots, never while an internal lock is held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use speechbridge_core::{
    ErrorCategory, ErrorInfo, ErrorSeverity, SpeechSynthesizer, SpeechToText, Translator,
    Utterance, UtteranceId, UtteranceState,
};

use crate::queue::{TaskPriority, TaskQueue};
use crate::sim;

/// Transcript sentinel written when a SKIP recovery bypasses transcription
pub const SKIPPED_TRANSCRIPT: &str = "[Transcription unavailable]";

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Admission cap on concurrently active utterances
    pub max_concurrent_utterances: usize,
    /// Age after which terminal utterances are removed by the cleanup task
    pub utterance_timeout: Duration,
    pub cleanup_interval: Duration,
    pub enable_automatic_cleanup: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_utterances: 10,
            utterance_timeout: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
            enable_automatic_cleanup: true,
        }
    }
}

/// Pipeline stages an utterance is processed through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Stt,
    Mt,
    Tts,
}

impl Stage {
    /// The state an utterance is in while this stage runs
    pub fn state(self) -> UtteranceState {
        match self {
            Stage::Stt => UtteranceState::Transcribing,
            Stage::Mt => UtteranceState::Translating,
            Stage::Tts => UtteranceState::Synthesizing,
        }
    }

    /// Stage responsible for errors of the given category, if any
    pub fn for_category(category: ErrorCategory) -> Option<Stage> {
        match category {
            ErrorCategory::Stt => Some(Stage::Stt),
            ErrorCategory::Translation => Some(Stage::Mt),
            ErrorCategory::Tts => Some(Stage::Tts),
            _ => None,
        }
    }
}

/// Snapshot of orchestrator counters
#[derive(Debug, Clone)]
pub struct OrchestratorStats {
    pub total_created: u64,
    pub total_completed: u64,
    pub total_errors: u64,
    /// Utterances not yet terminal
    pub active: usize,
    /// Utterances currently in a processing stage
    pub concurrent: usize,
    /// Mean `last_updated - created_at` over completed utterances
    pub average_processing_time: Duration,
}

type StateCallback = Arc<dyn Fn(&Utterance) + Send + Sync>;
type CompleteCallback = Arc<dyn Fn(&Utterance) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&Utterance, &str) + Send + Sync>;

/// Function value through which engine failures reach the recovery
/// controller. Installed after construction; absent means errors finalize
/// immediately.
pub type FailureHook = Arc<dyn Fn(ErrorInfo, UtteranceId) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_state_change: Option<StateCallback>,
    on_complete: Option<CompleteCallback>,
    on_error: Option<ErrorCallback>,
}

struct Record {
    utterance: Utterance,
    complete_notified: bool,
    error_notified: bool,
}

struct Inner {
    config: OrchestratorConfig,
    queue: Arc<TaskQueue>,
    utterances: Mutex<HashMap<UtteranceId, Record>>,
    next_id: AtomicU64,

    stt: RwLock<Option<Arc<dyn SpeechToText>>>,
    mt: RwLock<Option<Arc<dyn Translator>>>,
    tts: RwLock<Option<Arc<dyn SpeechSynthesizer>>>,

    callbacks: RwLock<Callbacks>,
    failure_hook: RwLock<Option<FailureHook>>,

    total_created: AtomicU64,
    total_completed: AtomicU64,
    total_errors: AtomicU64,

    cleanup_shutdown: Mutex<Option<watch::Sender<bool>>>,
}

/// Concurrent utterance state machine with bounded admission.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct UtteranceOrchestrator {
    inner: Arc<Inner>,
}

impl UtteranceOrchestrator {
    pub fn new(config: OrchestratorConfig, queue: Arc<TaskQueue>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                queue,
                utterances: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                stt: RwLock::new(None),
                mt: RwLock::new(None),
                tts: RwLock::new(None),
                callbacks: RwLock::new(Callbacks::default()),
                failure_hook: RwLock::new(None),
                total_created: AtomicU64::new(0),
                total_completed: AtomicU64::new(0),
                total_errors: AtomicU64::new(0),
                cleanup_shutdown: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    // ---- engine hot-swap -------------------------------------------------

    /// Swap the STT engine. Takes effect for work submitted after the swap;
    /// a call in progress completes against the previous engine.
    pub fn set_stt_engine(&self, engine: Arc<dyn SpeechToText>) {
        *self.inner.stt.write() = Some(engine);
    }

    pub fn set_mt_engine(&self, engine: Arc<dyn Translator>) {
        *self.inner.mt.write() = Some(engine);
    }

    pub fn set_tts_engine(&self, engine: Arc<dyn SpeechSynthesizer>) {
        *self.inner.tts.write() = Some(engine);
    }

    // ---- callbacks -------------------------------------------------------

    /// Fires after every observable state transition
    pub fn on_state_change(&self, callback: impl Fn(&Utterance) + Send + Sync + 'static) {
        self.inner.callbacks.write().on_state_change = Some(Arc::new(callback));
    }

    /// Fires exactly once per utterance that reaches COMPLETE
    pub fn on_complete(&self, callback: impl Fn(&Utterance) + Send + Sync + 'static) {
        self.inner.callbacks.write().on_complete = Some(Arc::new(callback));
    }

    /// Fires exactly once per utterance whose ERROR state becomes final
    pub fn on_error(&self, callback: impl Fn(&Utterance, &str) + Send + Sync + 'static) {
        self.inner.callbacks.write().on_error = Some(Arc::new(callback));
    }

    /// Install the recovery delegation hook
    pub fn set_failure_hook(&self, hook: FailureHook) {
        *self.inner.failure_hook.write() = Some(hook);
    }

    // ---- lifecycle -------------------------------------------------------

    /// Create a new utterance in LISTENING.
    ///
    /// Returns `None` without blocking when the active count has reached
    /// the configured cap.
    pub fn create(&self, session_id: impl Into<String>) -> Option<UtteranceId> {
        let session_id = session_id.into();
        let snapshot = {
            let mut map = self.inner.utterances.lock();
            let active = map
                .values()
                .filter(|r| !r.utterance.state.is_terminal())
                .count();
            if active >= self.inner.config.max_concurrent_utterances {
                tracing::warn!(
                    session_id = %session_id,
                    active,
                    "utterance admission refused at capacity"
                );
                return None;
            }

            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let record = Record {
                utterance: Utterance::new(id, session_id),
                complete_notified: false,
                error_notified: false,
            };
            let snapshot = record.utterance.clone();
            map.insert(id, record);
            snapshot
        };

        self.inner.total_created.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Created utterance: {}", snapshot.id);
        self.inner.notify_state_change(&snapshot);
        Some(snapshot.id)
    }

    /// Append audio to an utterance. Ignored for unknown ids and terminal
    /// utterances.
    pub fn add_audio(&self, id: UtteranceId, samples: &[f32]) -> bool {
        let mut map = self.inner.utterances.lock();
        let Some(record) = map.get_mut(&id) else {
            return false;
        };
        if record.utterance.state.is_terminal() {
            return false;
        }
        record.utterance.audio_buffer.extend_from_slice(samples);
        record.utterance.last_updated = Instant::now();
        true
    }

    /// Configure languages and voice. Only allowed while LISTENING.
    pub fn set_language_config(
        &self,
        id: UtteranceId,
        source: impl Into<String>,
        target: impl Into<String>,
        voice_id: impl Into<String>,
    ) -> bool {
        let mut map = self.inner.utterances.lock();
        let Some(record) = map.get_mut(&id) else {
            return false;
        };
        if record.utterance.state != UtteranceState::Listening {
            return false;
        }
        record.utterance.source_language = source.into();
        record.utterance.target_language = target.into();
        record.utterance.voice_id = voice_id.into();
        record.utterance.last_updated = Instant::now();
        true
    }

    /// Start processing: enqueue the STT stage at HIGH priority.
    ///
    /// Ignored unless the utterance is LISTENING.
    pub fn process(&self, id: UtteranceId) -> bool {
        match self.state(id) {
            Some(UtteranceState::Listening) => {}
            _ => return false,
        }
        Inner::submit_stage(&self.inner, Stage::Stt, id)
    }

    // ---- accessors -------------------------------------------------------

    /// Thread-safe snapshot of an utterance
    pub fn utterance(&self, id: UtteranceId) -> Option<Utterance> {
        self.inner.snapshot(id)
    }

    pub fn state(&self, id: UtteranceId) -> Option<UtteranceState> {
        self.inner
            .utterances
            .lock()
            .get(&id)
            .map(|r| r.utterance.state)
    }

    /// Snapshots of every utterance belonging to a session
    pub fn session_utterances(&self, session_id: &str) -> Vec<Utterance> {
        self.inner
            .utterances
            .lock()
            .values()
            .filter(|r| r.utterance.session_id == session_id)
            .map(|r| r.utterance.clone())
            .collect()
    }

    /// Snapshots of every non-terminal utterance
    pub fn active_utterances(&self) -> Vec<Utterance> {
        self.inner
            .utterances
            .lock()
            .values()
            .filter(|r| !r.utterance.state.is_terminal())
            .map(|r| r.utterance.clone())
            .collect()
    }

    pub fn statistics(&self) -> OrchestratorStats {
        let map = self.inner.utterances.lock();
        let mut active = 0;
        let mut concurrent = 0;
        let mut completed_time = Duration::ZERO;
        let mut completed = 0u32;

        for record in map.values() {
            let u = &record.utterance;
            if !u.state.is_terminal() {
                active += 1;
            }
            if u.state.is_processing() {
                concurrent += 1;
            }
            if u.state == UtteranceState::Complete {
                completed_time += u.processing_time();
                completed += 1;
            }
        }

        OrchestratorStats {
            total_created: self.inner.total_created.load(Ordering::Relaxed),
            total_completed: self.inner.total_completed.load(Ordering::Relaxed),
            total_errors: self.inner.total_errors.load(Ordering::Relaxed),
            active,
            concurrent,
            average_processing_time: if completed > 0 {
                completed_time / completed
            } else {
                Duration::ZERO
            },
        }
    }

    // ---- state updates ---------------------------------------------------

    /// Apply a validated state transition.
    ///
    /// Returns false for unknown ids and transitions outside the allowed
    /// graph. COMPLETE fires the completion callback (at most once).
    pub fn update_state(&self, id: UtteranceId, new_state: UtteranceState) -> bool {
        self.inner.apply_transition(id, new_state)
    }

    /// Record the STT result
    pub fn set_transcription(&self, id: UtteranceId, transcript: &str, confidence: f32) -> bool {
        let mut map = self.inner.utterances.lock();
        let Some(record) = map.get_mut(&id) else {
            return false;
        };
        record.utterance.transcript = transcript.to_string();
        record.utterance.transcript_confidence = confidence;
        record.utterance.last_updated = Instant::now();
        true
    }

    /// Record the MT result
    pub fn set_translation(&self, id: UtteranceId, translation: &str) -> bool {
        let mut map = self.inner.utterances.lock();
        let Some(record) = map.get_mut(&id) else {
            return false;
        };
        record.utterance.translation = translation.to_string();
        record.utterance.last_updated = Instant::now();
        true
    }

    /// Record the TTS result
    pub fn set_synthesized_audio(&self, id: UtteranceId, audio: Vec<u8>) -> bool {
        let mut map = self.inner.utterances.lock();
        let Some(record) = map.get_mut(&id) else {
            return false;
        };
        record.utterance.synthesized_audio = audio;
        record.utterance.last_updated = Instant::now();
        true
    }

    // ---- recovery entry points -------------------------------------------

    /// Clear the error and re-enter the given stage, re-enqueueing its work
    /// at HIGH priority.
    pub fn resume_stage(&self, id: UtteranceId, stage: Stage) -> bool {
        {
            let mut map = self.inner.utterances.lock();
            let Some(record) = map.get_mut(&id) else {
                return false;
            };
            if !record.utterance.state.can_transition_to(stage.state()) {
                return false;
            }
            record.utterance.state = stage.state();
            record.utterance.error_message.clear();
            record.utterance.last_updated = Instant::now();
        }
        if let Some(u) = self.inner.snapshot(id) {
            self.inner.notify_state_change(&u);
        }
        tracing::info!(utterance_id = id, stage = ?stage, "resuming stage after recovery");
        Inner::submit_stage(&self.inner, stage, id)
    }

    /// Bypass a failed stage with placeholder output and advance.
    pub fn skip_stage(&self, id: UtteranceId, stage: Stage) -> bool {
        match stage {
            Stage::Stt => {
                {
                    let mut map = self.inner.utterances.lock();
                    let Some(record) = map.get_mut(&id) else {
                        return false;
                    };
                    record.utterance.transcript = SKIPPED_TRANSCRIPT.to_string();
                    record.utterance.transcript_confidence = 0.0;
                    record.utterance.error_message.clear();
                }
                if !self.inner.apply_transition(id, UtteranceState::Translating) {
                    return false;
                }
                Inner::submit_stage(&self.inner, Stage::Mt, id)
            }
            Stage::Mt => {
                {
                    let mut map = self.inner.utterances.lock();
                    let Some(record) = map.get_mut(&id) else {
                        return false;
                    };
                    record.utterance.translation = record.utterance.transcript.clone();
                    record.utterance.error_message.clear();
                }
                if !self.inner.apply_transition(id, UtteranceState::Synthesizing) {
                    return false;
                }
                Inner::submit_stage(&self.inner, Stage::Tts, id)
            }
            Stage::Tts => {
                // Step through SYNTHESIZING so the terminal transition stays
                // inside the allowed graph; only COMPLETE is observable.
                {
                    let mut map = self.inner.utterances.lock();
                    let Some(record) = map.get_mut(&id) else {
                        return false;
                    };
                    record.utterance.state = UtteranceState::Synthesizing;
                    record.utterance.error_message.clear();
                }
                self.inner.apply_transition(id, UtteranceState::Complete)
            }
        }
    }

    /// Clear all results and restart processing from transcription.
    pub fn restart(&self, id: UtteranceId) -> bool {
        {
            let mut map = self.inner.utterances.lock();
            let Some(record) = map.get_mut(&id) else {
                return false;
            };
            if !record
                .utterance
                .state
                .can_transition_to(UtteranceState::Transcribing)
            {
                return false;
            }
            record.utterance.transcript.clear();
            record.utterance.transcript_confidence = 0.0;
            record.utterance.translation.clear();
            record.utterance.synthesized_audio.clear();
            record.utterance.error_message.clear();
            record.utterance.state = UtteranceState::Transcribing;
            record.utterance.last_updated = Instant::now();
        }
        if let Some(u) = self.inner.snapshot(id) {
            self.inner.notify_state_change(&u);
        }
        tracing::info!(utterance_id = id, "restarting pipeline");
        Inner::submit_stage(&self.inner, Stage::Stt, id)
    }

    /// Declare an ERROR final: fires `on_error` (at most once per utterance).
    pub fn finalize_error(&self, id: UtteranceId) -> bool {
        let snapshot = {
            let mut map = self.inner.utterances.lock();
            let Some(record) = map.get_mut(&id) else {
                return false;
            };
            if record.utterance.state != UtteranceState::Error || record.error_notified {
                return false;
            }
            record.error_notified = true;
            record.utterance.clone()
        };
        self.inner.notify_error(&snapshot);
        true
    }

    // ---- cleanup ---------------------------------------------------------

    /// Remove terminal utterances older than `max_age`. Returns the count
    /// removed.
    pub fn cleanup_old(&self, max_age: Duration) -> usize {
        self.inner.cleanup_old(max_age)
    }

    /// Remove every utterance for a session, regardless of state.
    pub fn remove_session_utterances(&self, session_id: &str) -> usize {
        let mut map = self.inner.utterances.lock();
        let before = map.len();
        map.retain(|_, r| r.utterance.session_id != session_id);
        let removed = before - map.len();
        if removed > 0 {
            tracing::info!("Removed {} utterances for session: {}", removed, session_id);
        }
        removed
    }

    /// Start the periodic cleanup task, honoring `enable_automatic_cleanup`.
    ///
    /// Returns the shutdown sender, or `None` when automatic cleanup is
    /// disabled. `shutdown` also stops the task.
    pub fn start_cleanup_task(&self) -> Option<watch::Sender<bool>> {
        if !self.inner.config.enable_automatic_cleanup {
            return None;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let interval = self.inner.config.cleanup_interval;
        let max_age = self.inner.config.utterance_timeout;

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let removed = inner.cleanup_old(max_age);
                        if removed > 0 {
                            tracing::info!("Utterance cleanup removed {} terminal utterances", removed);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("Utterance cleanup task shutting down");
                            break;
                        }
                    }
                }
            }
        });

        *self.inner.cleanup_shutdown.lock() = Some(shutdown_tx.clone());
        Some(shutdown_tx)
    }

    /// Cooperative shutdown: stop the cleanup task and drop all utterances.
    ///
    /// The task queue is shared and shut down by its owner.
    pub fn shutdown(&self) {
        if let Some(tx) = self.inner.cleanup_shutdown.lock().take() {
            let _ = tx.send(true);
        }
        self.inner.utterances.lock().clear();
        tracing::info!("utterance orchestrator shut down");
    }
}

impl Inner {
    fn apply_transition(&self, id: UtteranceId, new_state: UtteranceState) -> bool {
        let (snapshot, fire_complete) = {
            let mut map = self.utterances.lock();
            let Some(record) = map.get_mut(&id) else {
                return false;
            };
            let old = record.utterance.state;
            if !old.can_transition_to(new_state) {
                tracing::warn!(
                    utterance_id = id,
                    from = %old,
                    to = %new_state,
                    "rejected state transition"
                );
                return false;
            }

            record.utterance.state = new_state;
            record.utterance.last_updated = Instant::now();

            if old == new_state {
                // Refresh only; nothing to observe
                return true;
            }

            if new_state == UtteranceState::Complete {
                self.total_completed.fetch_add(1, Ordering::Relaxed);
            }
            if new_state == UtteranceState::Error {
                self.total_errors.fetch_add(1, Ordering::Relaxed);
            }

            let fire_complete =
                new_state == UtteranceState::Complete && !record.complete_notified;
            if fire_complete {
                record.complete_notified = true;
            }
            (record.utterance.clone(), fire_complete)
        };

        self.notify_state_change(&snapshot);
        if fire_complete {
            self.notify_complete(&snapshot);
        }
        true
    }

    /// Record an engine failure: ERROR state + message, then hand the error
    /// to the recovery hook. Without a hook the error is final immediately.
    fn set_error(inner: &Arc<Inner>, id: UtteranceId, category: ErrorCategory, message: String) {
        let snapshot = {
            let mut map = inner.utterances.lock();
            let Some(record) = map.get_mut(&id) else {
                return;
            };
            let old = record.utterance.state;
            record.utterance.error_message = message.clone();
            record.utterance.state = UtteranceState::Error;
            record.utterance.last_updated = Instant::now();
            if old != UtteranceState::Error {
                inner.total_errors.fetch_add(1, Ordering::Relaxed);
            }
            record.utterance.clone()
        };

        tracing::error!(
            utterance_id = id,
            category = category.as_str(),
            "utterance failed: {}",
            message
        );
        inner.notify_state_change(&snapshot);

        let hook = inner.failure_hook.read().clone();
        match hook {
            Some(hook) => {
                let info = ErrorInfo::new(category, ErrorSeverity::Error, message)
                    .with_session(snapshot.session_id.clone());
                hook(info, id);
            }
            None => {
                inner.finalize_error_inner(id);
            }
        }
    }

    fn finalize_error_inner(&self, id: UtteranceId) {
        let snapshot = {
            let mut map = self.utterances.lock();
            let Some(record) = map.get_mut(&id) else {
                return;
            };
            if record.utterance.state != UtteranceState::Error || record.error_notified {
                return;
            }
            record.error_notified = true;
            record.utterance.clone()
        };
        self.notify_error(&snapshot);
    }

    fn cleanup_old(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut map = self.utterances.lock();
        let before = map.len();
        map.retain(|_, r| {
            !(r.utterance.state.is_terminal()
                && now.duration_since(r.utterance.last_updated) > max_age)
        });
        before - map.len()
    }

    fn submit_stage(inner: &Arc<Inner>, stage: Stage, id: UtteranceId) -> bool {
        let task_inner = Arc::clone(inner);
        inner.queue.submit(TaskPriority::High, async move {
            match stage {
                Stage::Stt => Inner::run_stt(task_inner, id).await,
                Stage::Mt => Inner::run_mt(task_inner, id).await,
                Stage::Tts => Inner::run_tts(task_inner, id).await,
            }
        })
    }

    // ---- stage execution -------------------------------------------------

    async fn run_stt(inner: Arc<Inner>, id: UtteranceId) {
        if !inner.apply_transition(id, UtteranceState::Transcribing) {
            return;
        }
        let Some(utterance) = inner.snapshot(id) else {
            return;
        };

        let engine = inner.stt.read().clone();
        let (text, confidence) = match engine {
            Some(engine) if engine.is_initialized() && !utterance.audio_buffer.is_empty() => {
                match engine.transcribe(&utterance.audio_buffer).await {
                    Ok(t) if !t.text.is_empty() => (t.text, t.confidence),
                    Ok(_) => {
                        tracing::warn!(
                            utterance_id = id,
                            "STT returned empty text, using simulation"
                        );
                        (sim::simulated_transcript(id), sim::SIMULATED_CONFIDENCE)
                    }
                    Err(e) => {
                        tracing::warn!(
                            utterance_id = id,
                            error = %e,
                            "STT engine failed, using simulation"
                        );
                        (sim::simulated_transcript(id), sim::SIMULATED_CONFIDENCE)
                    }
                }
            }
            _ => {
                tracing::warn!(utterance_id = id, "no usable STT engine, using simulation");
                (sim::simulated_transcript(id), sim::SIMULATED_CONFIDENCE)
            }
        };

        {
            let mut map = inner.utterances.lock();
            let Some(record) = map.get_mut(&id) else {
                return;
            };
            record.utterance.transcript = text;
            record.utterance.transcript_confidence = confidence;
            record.utterance.last_updated = Instant::now();
        }

        if inner.apply_transition(id, UtteranceState::Translating) {
            Inner::submit_stage(&inner, Stage::Mt, id);
        }
    }

    async fn run_mt(inner: Arc<Inner>, id: UtteranceId) {
        if !inner.apply_transition(id, UtteranceState::Translating) {
            return;
        }
        let Some(utterance) = inner.snapshot(id) else {
            return;
        };

        if utterance.transcript.is_empty() {
            Inner::set_error(
                &inner,
                id,
                ErrorCategory::Pipeline,
                "No transcript available for translation".into(),
            );
            return;
        }

        let src = utterance.source_language.as_str();
        let tgt = utterance.target_language.as_str();
        let engine = inner.mt.read().clone();

        let engine = match engine {
            Some(engine)
                if !src.is_empty() && !tgt.is_empty() && engine.supports(src, tgt) =>
            {
                engine
            }
            _ => {
                tracing::warn!(
                    utterance_id = id,
                    source = src,
                    target = tgt,
                    "no usable MT engine for pair, using simulation"
                );
                let text = sim::simulated_translation(&utterance.transcript, src, tgt);
                Inner::record_translation_and_advance(&inner, id, text);
                return;
            }
        };

        if !engine.is_initialized() {
            tracing::info!(
                utterance_id = id,
                "initializing MT engine for pair {} -> {}",
                src,
                tgt
            );
            if let Err(e) = engine.initialize(src, tgt).await {
                Inner::set_error(
                    &inner,
                    id,
                    ErrorCategory::ModelLoading,
                    format!("Failed to initialize translation engine: {e}"),
                );
                return;
            }
        }

        match engine.translate(&utterance.transcript).await {
            Ok(t) if !t.text.is_empty() => {
                Inner::record_translation_and_advance(&inner, id, t.text);
            }
            Ok(_) => {
                Inner::set_error(
                    &inner,
                    id,
                    ErrorCategory::Translation,
                    "Translation produced no text".into(),
                );
            }
            Err(e) => {
                Inner::set_error(&inner, id, ErrorCategory::Translation, e.to_string());
            }
        }
    }

    fn record_translation_and_advance(inner: &Arc<Inner>, id: UtteranceId, text: String) {
        {
            let mut map = inner.utterances.lock();
            let Some(record) = map.get_mut(&id) else {
                return;
            };
            record.utterance.translation = text;
            record.utterance.last_updated = Instant::now();
        }
        if inner.apply_transition(id, UtteranceState::Synthesizing) {
            Inner::submit_stage(inner, Stage::Tts, id);
        }
    }

    async fn run_tts(inner: Arc<Inner>, id: UtteranceId) {
        if !inner.apply_transition(id, UtteranceState::Synthesizing) {
            return;
        }
        let Some(utterance) = inner.snapshot(id) else {
            return;
        };

        if utterance.translation.is_empty() {
            Inner::set_error(
                &inner,
                id,
                ErrorCategory::Pipeline,
                "No translation available for synthesis".into(),
            );
            return;
        }

        let engine = inner.tts.read().clone();
        let engine = match engine {
            Some(engine) if engine.is_initialized() => engine,
            _ => {
                tracing::warn!(utterance_id = id, "no usable TTS engine, using simulation");
                let audio = sim::simulated_audio(id, &utterance.translation);
                inner.record_audio_and_complete(id, audio);
                return;
            }
        };

        let requested = utterance.voice_id.as_str();
        let voice = if !requested.is_empty()
            && engine.available_voices().iter().any(|v| v == requested)
        {
            requested.to_string()
        } else {
            if !requested.is_empty() {
                tracing::warn!(
                    utterance_id = id,
                    voice = requested,
                    "requested voice unavailable, using default"
                );
            }
            engine.default_voice()
        };

        match engine.synthesize(&utterance.translation, &voice).await {
            Ok(s) if !s.audio.is_empty() => {
                inner.record_audio_and_complete(id, s.audio);
            }
            Ok(_) => {
                Inner::set_error(
                    &inner,
                    id,
                    ErrorCategory::Tts,
                    "Synthesis produced no audio".into(),
                );
            }
            Err(e) => {
                Inner::set_error(&inner, id, ErrorCategory::Tts, e.to_string());
            }
        }
    }

    fn record_audio_and_complete(&self, id: UtteranceId, audio: Vec<u8>) {
        {
            let mut map = self.utterances.lock();
            let Some(record) = map.get_mut(&id) else {
                return;
            };
            record.utterance.synthesized_audio = audio;
            record.utterance.last_updated = Instant::now();
        }
        self.apply_transition(id, UtteranceState::Complete);
    }

    fn snapshot(&self, id: UtteranceId) -> Option<Utterance> {
        self.utterances.lock().get(&id).map(|r| r.utterance.clone())
    }

    // ---- callback delivery -----------------------------------------------

    fn notify_state_change(&self, utterance: &Utterance) {
        let cb = self.callbacks.read().on_state_change.clone();
        if let Some(cb) = cb {
            // Panicking callbacks are contained, matching the swallow-all
            // contract integrators rely on.
            let guarded =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(utterance)));
            if guarded.is_err() {
                tracing::error!(utterance_id = utterance.id, "state-change callback panicked");
            }
        }
    }

    fn notify_complete(&self, utterance: &Utterance) {
        let cb = self.callbacks.read().on_complete.clone();
        if let Some(cb) = cb {
            let guarded =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(utterance)));
            if guarded.is_err() {
                tracing::error!(utterance_id = utterance.id, "completion callback panicked");
            }
        }
    }

    fn notify_error(&self, utterance: &Utterance) {
        let cb = self.callbacks.read().on_error.clone();
        if let Some(cb) = cb {
            let message = utterance.error_message.clone();
            let guarded = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                cb(utterance, &message)
            }));
            if guarded.is_err() {
                tracing::error!(utterance_id = utterance.id, "error callback panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn orchestrator(cap: usize) -> (UtteranceOrchestrator, Arc<TaskQueue>) {
        let queue = TaskQueue::new(2);
        let config = OrchestratorConfig {
            max_concurrent_utterances: cap,
            enable_automatic_cleanup: false,
            ..OrchestratorConfig::default()
        };
        (UtteranceOrchestrator::new(config, Arc::clone(&queue)), queue)
    }

    async fn wait_for_state(
        orch: &UtteranceOrchestrator,
        id: UtteranceId,
        state: UtteranceState,
    ) {
        for _ in 0..200 {
            if orch.state(id) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "utterance {} never reached {:?}, last state {:?}",
            id,
            state,
            orch.state(id)
        );
    }

    #[tokio::test]
    async fn test_ids_monotonic_and_never_reused() {
        let (orch, _queue) = orchestrator(100);
        let mut last = 0;
        for _ in 0..20 {
            let id = orch.create("s").unwrap();
            assert!(id > last);
            last = id;
        }
        // Removing utterances does not recycle ids
        orch.remove_session_utterances("s");
        let id = orch.create("s").unwrap();
        assert!(id > last);
    }

    #[tokio::test]
    async fn test_admission_cap() {
        let (orch, _queue) = orchestrator(2);
        let a = orch.create("s").unwrap();
        let b = orch.create("s").unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert!(orch.create("s").is_none());

        // Completing one frees a slot; the counter keeps increasing
        assert!(orch.update_state(a, UtteranceState::Complete));
        assert_eq!(orch.create("s"), Some(3));
    }

    #[tokio::test]
    async fn test_language_config_only_while_listening() {
        let (orch, _queue) = orchestrator(10);
        let id = orch.create("s").unwrap();
        assert!(orch.set_language_config(id, "en", "es", "v1"));

        orch.update_state(id, UtteranceState::Transcribing);
        assert!(!orch.set_language_config(id, "en", "fr", "v2"));

        let u = orch.utterance(id).unwrap();
        assert_eq!(u.source_language, "en");
        assert_eq!(u.target_language, "es");
    }

    #[tokio::test]
    async fn test_add_audio_rules() {
        let (orch, _queue) = orchestrator(10);
        let id = orch.create("s").unwrap();
        assert!(orch.add_audio(id, &[0.1, 0.2]));
        assert!(!orch.add_audio(9999, &[0.1]));

        orch.update_state(id, UtteranceState::Complete);
        assert!(!orch.add_audio(id, &[0.3]));
        assert_eq!(orch.utterance(id).unwrap().audio_buffer.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_transitions_rejected() {
        let (orch, _queue) = orchestrator(10);
        let id = orch.create("s").unwrap();
        orch.update_state(id, UtteranceState::Translating);
        assert!(!orch.update_state(id, UtteranceState::Transcribing));
        assert_eq!(orch.state(id), Some(UtteranceState::Translating));
    }

    #[tokio::test]
    async fn test_unknown_ids_are_noops() {
        let (orch, _queue) = orchestrator(10);
        assert!(orch.utterance(42).is_none());
        assert!(!orch.update_state(42, UtteranceState::Complete));
        assert!(!orch.process(42));
    }

    #[tokio::test]
    async fn test_simulated_pipeline_without_engines() {
        let (orch, queue) = orchestrator(10);
        let id = orch.create("s2").unwrap();
        orch.add_audio(id, &vec![0.05; 1600]);
        assert!(orch.process(id));

        wait_for_state(&orch, id, UtteranceState::Complete).await;

        let u = orch.utterance(id).unwrap();
        assert!(u.transcript.starts_with("Simulated transcription"));
        assert_eq!(u.transcript_confidence, sim::SIMULATED_CONFIDENCE);
        assert!(u.translation.starts_with("Simulated translation"));
        assert!(!u.synthesized_audio.is_empty());

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_process_requires_listening() {
        let (orch, _queue) = orchestrator(10);
        let id = orch.create("s").unwrap();
        orch.update_state(id, UtteranceState::Complete);
        assert!(!orch.process(id));
    }

    #[tokio::test]
    async fn test_cleanup_with_infinite_age_is_noop() {
        let (orch, _queue) = orchestrator(10);
        let id = orch.create("s").unwrap();
        orch.update_state(id, UtteranceState::Complete);
        assert_eq!(orch.cleanup_old(Duration::MAX), 0);
        assert!(orch.utterance(id).is_some());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_old_terminal() {
        let (orch, _queue) = orchestrator(10);
        let done = orch.create("s").unwrap();
        let live = orch.create("s").unwrap();
        orch.update_state(done, UtteranceState::Complete);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(orch.cleanup_old(Duration::from_millis(1)), 1);
        assert!(orch.utterance(done).is_none());
        assert!(orch.utterance(live).is_some());
    }

    #[tokio::test]
    async fn test_remove_session_idempotent() {
        let (orch, _queue) = orchestrator(10);
        orch.create("a").unwrap();
        orch.create("a").unwrap();
        orch.create("b").unwrap();

        assert_eq!(orch.remove_session_utterances("a"), 2);
        assert_eq!(orch.remove_session_utterances("a"), 0);
        assert_eq!(orch.session_utterances("b").len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_callback_is_contained() {
        let (orch, queue) = orchestrator(10);
        orch.on_state_change(|_| panic!("listener bug"));

        let id = orch.create("s").unwrap();
        orch.add_audio(id, &[0.1; 160]);
        orch.process(id);
        wait_for_state(&orch, id, UtteranceState::Complete).await;
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_complete_callback_fires_once() {
        let (orch, _queue) = orchestrator(10);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        orch.on_complete(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        let id = orch.create("s").unwrap();
        orch.update_state(id, UtteranceState::Complete);
        // A redundant refresh must not re-fire
        orch.update_state(id, UtteranceState::Complete);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_without_hook_finalizes_immediately() {
        let (orch, queue) = orchestrator(10);
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_clone = Arc::clone(&errors);
        orch.on_error(move |u, message| {
            assert_eq!(u.state, UtteranceState::Error);
            assert!(!message.is_empty());
            errors_clone.fetch_add(1, Ordering::SeqCst);
        });

        let id = orch.create("s").unwrap();
        Inner::set_error(&orch.inner, id, ErrorCategory::Tts, "synthesis exploded".into());
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        // finalize_error is idempotent
        assert!(!orch.finalize_error(id));
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_skip_tts_completes_with_empty_audio() {
        let (orch, _queue) = orchestrator(10);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        orch.on_complete(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        let id = orch.create("s").unwrap();
        orch.set_transcription(id, "hello", 0.9);
        orch.set_translation(id, "hola");
        Inner::set_error(&orch.inner, id, ErrorCategory::Tts, "synth down".into());

        // ERROR was routed to finalize (no hook); skip afterwards is refused
        assert_eq!(orch.state(id), Some(UtteranceState::Error));

        // With a fresh utterance, skip from ERROR completes
        let id2 = orch.create("s").unwrap();
        orch.set_translation(id2, "hola");
        {
            let mut map = orch.inner.utterances.lock();
            let record = map.get_mut(&id2).unwrap();
            record.utterance.state = UtteranceState::Error;
            record.utterance.error_message = "synth down".into();
        }
        assert!(orch.skip_stage(id2, Stage::Tts));
        let u = orch.utterance(id2).unwrap();
        assert_eq!(u.state, UtteranceState::Complete);
        assert!(u.synthesized_audio.is_empty());
        assert!(u.error_message.is_empty());
    }

    #[tokio::test]
    async fn test_statistics() {
        let (orch, _queue) = orchestrator(10);
        let a = orch.create("s").unwrap();
        let b = orch.create("s").unwrap();
        let _c = orch.create("s").unwrap();
        orch.update_state(a, UtteranceState::Complete);
        orch.update_state(b, UtteranceState::Translating);

        let stats = orch.statistics();
        assert_eq!(stats.total_created, 3);
        assert_eq!(stats.total_completed, 1);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.concurrent, 1);
    }
}
