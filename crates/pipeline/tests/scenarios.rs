//! End-to-end pipeline scenarios with mock engines

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use speechbridge_core::{
    Error, Result, SpeechSynthesizer, SpeechToText, Synthesis, Transcription, Translation,
    Translator, UtteranceState,
};
use speechbridge_pipeline::{
    OrchestratorConfig, RecoveryConfig, RecoveryController, RecoveryStrategy, TaskQueue,
    UtteranceOrchestrator,
};

// ---- mock engines ----------------------------------------------------------

struct FixedStt {
    text: String,
    confidence: f32,
}

#[async_trait]
impl SpeechToText for FixedStt {
    async fn transcribe(&self, _samples: &[f32]) -> Result<Transcription> {
        Ok(Transcription::final_text(self.text.clone(), self.confidence))
    }

    fn is_initialized(&self) -> bool {
        true
    }
}

struct FixedMt {
    text: String,
    confidence: f32,
}

#[async_trait]
impl Translator for FixedMt {
    fn supports(&self, source: &str, target: &str) -> bool {
        !source.is_empty() && !target.is_empty()
    }

    async fn initialize(&self, _source: &str, _target: &str) -> Result<()> {
        Ok(())
    }

    async fn translate(&self, _text: &str) -> Result<Translation> {
        Ok(Translation {
            text: self.text.clone(),
            confidence: self.confidence,
        })
    }

    fn is_initialized(&self) -> bool {
        true
    }
}

struct FailingMt;

#[async_trait]
impl Translator for FailingMt {
    fn supports(&self, _source: &str, _target: &str) -> bool {
        true
    }

    async fn initialize(&self, _source: &str, _target: &str) -> Result<()> {
        Ok(())
    }

    async fn translate(&self, _text: &str) -> Result<Translation> {
        Err(Error::Translation("boom".into()))
    }

    fn is_initialized(&self) -> bool {
        true
    }
}

struct FixedTts {
    audio_len: usize,
}

#[async_trait]
impl SpeechSynthesizer for FixedTts {
    fn default_voice(&self) -> String {
        "default".into()
    }

    fn available_voices(&self) -> Vec<String> {
        vec!["default".into()]
    }

    async fn synthesize(&self, _text: &str, _voice_id: &str) -> Result<Synthesis> {
        Ok(Synthesis {
            audio: vec![0xABu8; self.audio_len],
            duration_secs: 0.5,
        })
    }

    fn is_initialized(&self) -> bool {
        true
    }
}

// ---- harness ---------------------------------------------------------------

fn pipeline(cap: usize) -> (UtteranceOrchestrator, Arc<TaskQueue>) {
    let queue = TaskQueue::new(4);
    let config = OrchestratorConfig {
        max_concurrent_utterances: cap,
        enable_automatic_cleanup: false,
        ..OrchestratorConfig::default()
    };
    (UtteranceOrchestrator::new(config, Arc::clone(&queue)), queue)
}

async fn wait_for(orch: &UtteranceOrchestrator, id: u64, state: UtteranceState, timeout: Duration) {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
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

// ---- scenarios -------------------------------------------------------------

#[tokio::test]
async fn happy_path_with_all_engines() {
    let (orch, queue) = pipeline(5);
    orch.set_stt_engine(Arc::new(FixedStt {
        text: "hello".into(),
        confidence: 0.9,
    }));
    orch.set_mt_engine(Arc::new(FixedMt {
        text: "hola".into(),
        confidence: 0.9,
    }));
    orch.set_tts_engine(Arc::new(FixedTts { audio_len: 256 }));

    let states = Arc::new(Mutex::new(Vec::new()));
    let states_sink = Arc::clone(&states);
    orch.on_state_change(move |u| {
        states_sink.lock().push(u.state);
    });

    let completions = Arc::new(Mutex::new(Vec::new()));
    let completions_sink = Arc::clone(&completions);
    orch.on_complete(move |u| {
        completions_sink.lock().push(u.clone());
    });

    let id = orch.create("s1").unwrap();
    assert_eq!(id, 1);
    orch.add_audio(id, &vec![0.01f32; 1600]);
    assert!(orch.set_language_config(id, "en", "es", "default"));
    assert!(orch.process(id));

    // Wait on the completion callback so every state event has been
    // delivered by the time we assert.
    let start = std::time::Instant::now();
    while completions.lock().is_empty() {
        assert!(start.elapsed() < Duration::from_secs(1), "never completed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let seen = states.lock().clone();
    assert_eq!(
        seen,
        vec![
            UtteranceState::Listening,
            UtteranceState::Transcribing,
            UtteranceState::Translating,
            UtteranceState::Synthesizing,
            UtteranceState::Complete,
        ]
    );

    let completed = completions.lock();
    assert_eq!(completed.len(), 1);
    let u = &completed[0];
    assert_eq!(u.transcript, "hello");
    assert_eq!(u.translation, "hola");
    assert_eq!(u.synthesized_audio.len(), 256);

    queue.shutdown().await;
}

#[tokio::test]
async fn missing_stt_engine_uses_simulated_transcript() {
    let (orch, queue) = pipeline(5);

    let id = orch.create("s2").unwrap();
    orch.add_audio(id, &vec![0.01f32; 800]);
    orch.process(id);

    wait_for(&orch, id, UtteranceState::Complete, Duration::from_secs(1)).await;

    let u = orch.utterance(id).unwrap();
    assert!(u.transcript.starts_with("Simulated transcription"));
    assert_eq!(u.transcript_confidence, 0.85);
    assert!(!u.synthesized_audio.is_empty());

    queue.shutdown().await;
}

#[tokio::test]
async fn failing_mt_exhausts_delayed_retries_then_errors() {
    let (orch, queue) = pipeline(5);
    orch.set_stt_engine(Arc::new(FixedStt {
        text: "hello".into(),
        confidence: 0.9,
    }));
    orch.set_mt_engine(Arc::new(FailingMt));
    orch.set_tts_engine(Arc::new(FixedTts { audio_len: 64 }));

    let recovery = RecoveryController::new(orch.clone());
    recovery.start();
    recovery.configure(
        speechbridge_core::ErrorCategory::Translation,
        RecoveryConfig {
            strategy: RecoveryStrategy::RetryWithDelay,
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(1000),
            exponential_backoff: true,
            ..RecoveryConfig::default()
        },
    );
    orch.set_failure_hook(recovery.failure_hook());

    let errors = Arc::new(AtomicUsize::new(0));
    let completions = Arc::new(AtomicUsize::new(0));
    let errors_sink = Arc::clone(&errors);
    let completions_sink = Arc::clone(&completions);
    let messages = Arc::new(Mutex::new(Vec::new()));
    let messages_sink = Arc::clone(&messages);
    orch.on_error(move |_, message| {
        errors_sink.fetch_add(1, Ordering::SeqCst);
        messages_sink.lock().push(message.to_string());
    });
    orch.on_complete(move |_| {
        completions_sink.fetch_add(1, Ordering::SeqCst);
    });

    let id = orch.create("s3").unwrap();
    orch.add_audio(id, &vec![0.01f32; 800]);
    orch.set_language_config(id, "en", "es", "");
    orch.process(id);

    // 3 delayed attempts at ~50/100/200 ms (with jitter), then terminal
    let start = std::time::Instant::now();
    loop {
        let errored = orch.state(id) == Some(UtteranceState::Error)
            && errors.load(Ordering::SeqCst) == 1;
        if errored {
            break;
        }
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "recovery never exhausted; state {:?}, errors {}",
            orch.state(id),
            errors.load(Ordering::SeqCst)
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let u = orch.utterance(id).unwrap();
    assert!(u.error_message.contains("boom"), "got: {}", u.error_message);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(completions.load(Ordering::SeqCst), 0);
    assert!(messages.lock()[0].contains("boom"));

    let stats = recovery.stats();
    assert_eq!(stats.total_attempts, 3);
    assert_eq!(stats.failed_recoveries, 1);

    recovery.shutdown().await;
    queue.shutdown().await;
}

#[tokio::test]
async fn admission_cap_frees_after_completion() {
    let (orch, queue) = pipeline(2);

    assert_eq!(orch.create("s"), Some(1));
    assert_eq!(orch.create("s"), Some(2));
    assert_eq!(orch.create("s"), None);

    assert!(orch.update_state(1, UtteranceState::Complete));
    assert_eq!(orch.create("s"), Some(3));

    queue.shutdown().await;
}

#[tokio::test]
async fn callbacks_fire_outside_locks() {
    // A callback that re-enters the orchestrator deadlocks if any internal
    // lock were held across delivery.
    let (orch, queue) = pipeline(5);

    let reentered = Arc::new(AtomicUsize::new(0));
    let reentered_sink = Arc::clone(&reentered);
    let orch_reentrant = orch.clone();
    orch.on_state_change(move |u| {
        let _ = orch_reentrant.utterance(u.id);
        let _ = orch_reentrant.statistics();
        reentered_sink.fetch_add(1, Ordering::SeqCst);
    });

    let id = orch.create("s").unwrap();
    orch.add_audio(id, &vec![0.01f32; 160]);
    orch.process(id);
    wait_for(&orch, id, UtteranceState::Complete, Duration::from_secs(1)).await;

    let start = std::time::Instant::now();
    while reentered.load(Ordering::SeqCst) < 5 {
        assert!(
            start.elapsed() < Duration::from_secs(1),
            "only {} callbacks re-entered",
            reentered.load(Ordering::SeqCst)
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    queue.shutdown().await;
}

#[tokio::test]
async fn hot_swapped_engine_applies_to_new_work() {
    let (orch, queue) = pipeline(5);
    orch.set_stt_engine(Arc::new(FixedStt {
        text: "first".into(),
        confidence: 0.9,
    }));

    let a = orch.create("s").unwrap();
    orch.add_audio(a, &vec![0.01f32; 160]);
    orch.process(a);
    wait_for(&orch, a, UtteranceState::Complete, Duration::from_secs(1)).await;
    assert_eq!(orch.utterance(a).unwrap().transcript, "first");

    orch.set_stt_engine(Arc::new(FixedStt {
        text: "second".into(),
        confidence: 0.9,
    }));

    let b = orch.create("s").unwrap();
    orch.add_audio(b, &vec![0.01f32; 160]);
    orch.process(b);
    wait_for(&orch, b, UtteranceState::Complete, Duration::from_secs(1)).await;
    assert_eq!(orch.utterance(b).unwrap().transcript, "second");

    queue.shutdown().await;
}
