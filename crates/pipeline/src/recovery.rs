//! Pipeline recovery controller
//!
//! Maps error categories to recovery strategies with bounded attempts.
//! Delayed retries live in a due-time-ordered heap drained by a dedicated
//! scheduler task. The controller holds the orchestrator; the orchestrator
//! only ever reaches back through a weak failure hook, so there is no
//! strong reference cycle.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use speechbridge_core::{ErrorCategory, ErrorInfo, UtteranceId};

use crate::orchestrator::{FailureHook, Stage, UtteranceOrchestrator};

/// Recovery strategies for pipeline failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    None,
    RetryImmediate,
    RetryWithDelay,
    FallbackModel,
    SkipStage,
    RestartPipeline,
    NotifyClientOnly,
}

/// Custom action run before strategy dispatch; returning true short-circuits
/// the recovery as successful.
pub type CustomAction = Arc<dyn Fn() -> bool + Send + Sync>;

/// Per-category recovery configuration
#[derive(Clone)]
pub struct RecoveryConfig {
    pub strategy: RecoveryStrategy,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_backoff: bool,
    pub fallback_model_path: Option<String>,
    pub custom_action: Option<CustomAction>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            strategy: RecoveryStrategy::RetryWithDelay,
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            exponential_backoff: true,
            fallback_model_path: None,
            custom_action: None,
        }
    }
}

impl std::fmt::Debug for RecoveryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryConfig")
            .field("strategy", &self.strategy)
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("exponential_backoff", &self.exponential_backoff)
            .field("fallback_model_path", &self.fallback_model_path)
            .field("custom_action", &self.custom_action.is_some())
            .finish()
    }
}

/// Default strategy table
fn default_configs() -> HashMap<ErrorCategory, RecoveryConfig> {
    let mut configs = HashMap::new();

    let engine_retry = RecoveryConfig::default();
    configs.insert(ErrorCategory::Stt, engine_retry.clone());
    configs.insert(ErrorCategory::Translation, engine_retry.clone());
    configs.insert(ErrorCategory::Tts, engine_retry);

    configs.insert(
        ErrorCategory::AudioProcessing,
        RecoveryConfig {
            strategy: RecoveryStrategy::RetryImmediate,
            max_attempts: 2,
            base_delay: Duration::from_millis(100),
            ..RecoveryConfig::default()
        },
    );

    configs.insert(
        ErrorCategory::ModelLoading,
        RecoveryConfig {
            strategy: RecoveryStrategy::FallbackModel,
            max_attempts: 1,
            ..RecoveryConfig::default()
        },
    );

    configs.insert(
        ErrorCategory::Pipeline,
        RecoveryConfig {
            strategy: RecoveryStrategy::RestartPipeline,
            max_attempts: 2,
            ..RecoveryConfig::default()
        },
    );

    configs.insert(
        ErrorCategory::Websocket,
        RecoveryConfig {
            strategy: RecoveryStrategy::NotifyClientOnly,
            max_attempts: 1,
            ..RecoveryConfig::default()
        },
    );

    configs
}

/// Outcome of one recovery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No configuration, unmapped category, or unknown utterance
    NotAttempted,
    /// A recovery action was carried out
    Recovered,
    /// A delayed retry was queued
    Scheduled,
    /// Attempts exhausted; the utterance error is final
    Exhausted,
}

/// Bookkeeping for one utterance under recovery
#[derive(Debug, Clone)]
struct RecoveryAttempt {
    category: ErrorCategory,
    attempt_count: u32,
    last_attempt: Instant,
}

/// Recovery statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    pub total_attempts: u64,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
    pub attempts_by_category: HashMap<ErrorCategory, u64>,
}

/// Delayed retry waiting for its due time
struct DueEntry {
    due: Instant,
    seq: u64,
    utterance_id: UtteranceId,
    category: ErrorCategory,
}

impl PartialEq for DueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for DueEntry {}
impl PartialOrd for DueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

/// Notification sink for client-facing recovery status. The final flag marks
/// the end of the recovery story for that utterance.
pub type ClientNotifier = Arc<dyn Fn(UtteranceId, &str, bool) + Send + Sync>;

struct ControllerInner {
    orchestrator: UtteranceOrchestrator,
    configs: Mutex<HashMap<ErrorCategory, RecoveryConfig>>,
    records: Mutex<HashMap<UtteranceId, RecoveryAttempt>>,
    stats: Mutex<RecoveryStats>,
    heap: Mutex<BinaryHeap<Reverse<DueEntry>>>,
    seq: AtomicU64,
    notify: Notify,
    running: AtomicBool,
    notifier: RwLock<Option<ClientNotifier>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

/// Per-error-category recovery with bounded attempts and a delayed-work
/// scheduler.
pub struct RecoveryController {
    inner: Arc<ControllerInner>,
}

impl RecoveryController {
    pub fn new(orchestrator: UtteranceOrchestrator) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                orchestrator,
                configs: Mutex::new(default_configs()),
                records: Mutex::new(HashMap::new()),
                stats: Mutex::new(RecoveryStats::default()),
                heap: Mutex::new(BinaryHeap::new()),
                seq: AtomicU64::new(0),
                notify: Notify::new(),
                running: AtomicBool::new(false),
                notifier: RwLock::new(None),
                scheduler: Mutex::new(None),
            }),
        }
    }

    /// Spawn the delayed-recovery scheduler task
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(ControllerInner::run_scheduler(inner));
        *self.inner.scheduler.lock() = Some(handle);
        tracing::info!("recovery controller started");
    }

    /// Cooperative shutdown: cancel pending delayed work and join the
    /// scheduler.
    pub async fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.notify.notify_waiters();
        let handle = self.inner.scheduler.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.heap.lock().clear();
        self.inner.records.lock().clear();
        tracing::info!("recovery controller shut down");
    }

    /// Replace the configuration for one error category
    pub fn configure(&self, category: ErrorCategory, config: RecoveryConfig) {
        tracing::info!(
            category = category.as_str(),
            strategy = ?config.strategy,
            "recovery configuration updated"
        );
        self.inner.configs.lock().insert(category, config);
    }

    /// Set the client notification sink
    pub fn set_client_notifier(&self, notifier: impl Fn(UtteranceId, &str, bool) + Send + Sync + 'static) {
        *self.inner.notifier.write() = Some(Arc::new(notifier));
    }

    /// The failure hook to install on the orchestrator.
    ///
    /// Holds only a weak reference; once the controller is dropped the hook
    /// degrades to finalizing errors directly.
    pub fn failure_hook(&self) -> FailureHook {
        let weak = Arc::downgrade(&self.inner);
        let orchestrator = self.inner.orchestrator.clone();
        Arc::new(move |error: ErrorInfo, utterance_id: UtteranceId| {
            match weak.upgrade() {
                Some(inner) => {
                    inner.attempt(&error, utterance_id);
                }
                None => {
                    orchestrator.finalize_error(utterance_id);
                }
            }
        })
    }

    /// Attempt recovery for an error on an utterance
    pub fn attempt(&self, error: &ErrorInfo, utterance_id: UtteranceId) -> RecoveryOutcome {
        self.inner.attempt(error, utterance_id)
    }

    /// Whether an utterance currently has a recovery record
    pub fn is_recovering(&self, utterance_id: UtteranceId) -> bool {
        self.inner.records.lock().contains_key(&utterance_id)
    }

    /// Drop records whose utterance is gone or has completed
    pub fn cleanup_settled(&self) -> usize {
        let orchestrator = self.inner.orchestrator.clone();
        let mut records = self.inner.records.lock();
        let before = records.len();
        records.retain(|id, _| match orchestrator.state(*id) {
            Some(state) => !matches!(state, speechbridge_core::UtteranceState::Complete),
            None => false,
        });
        before - records.len()
    }

    pub fn stats(&self) -> RecoveryStats {
        self.inner.stats.lock().clone()
    }
}

impl ControllerInner {
    fn attempt(&self, error: &ErrorInfo, utterance_id: UtteranceId) -> RecoveryOutcome {
        let Some(config) = self.configs.lock().get(&error.category).cloned() else {
            tracing::warn!(
                category = error.category.as_str(),
                "no recovery configuration for error category"
            );
            self.orchestrator.finalize_error(utterance_id);
            return RecoveryOutcome::NotAttempted;
        };

        // Notification-only strategies keep no retry bookkeeping
        if config.strategy == RecoveryStrategy::NotifyClientOnly {
            self.record_attempt_stat(error.category);
            self.notify_client(
                utterance_id,
                &format!("Error occurred: {}", error.message),
                false,
            );
            self.stats.lock().successful_recoveries += 1;
            return RecoveryOutcome::Recovered;
        }

        if config.strategy == RecoveryStrategy::None {
            self.orchestrator.finalize_error(utterance_id);
            return RecoveryOutcome::NotAttempted;
        }

        // Attempt accounting: the pre-increment count is checked against the
        // cap so max_attempts = 0 never recovers.
        let (attempt_number, since_last) = {
            let mut records = self.records.lock();
            let count = records
                .get(&utterance_id)
                .map(|r| r.attempt_count)
                .unwrap_or(0);
            if count >= config.max_attempts {
                if let Some(record) = records.remove(&utterance_id) {
                    tracing::error!(
                        utterance_id,
                        attempts = count,
                        category = record.category.as_str(),
                        "max recovery attempts exceeded"
                    );
                } else {
                    tracing::error!(utterance_id, "recovery disabled for this category");
                }
                drop(records);
                self.stats.lock().failed_recoveries += 1;
                self.notify_client(
                    utterance_id,
                    &format!("Recovery failed after {} attempts", config.max_attempts),
                    true,
                );
                self.orchestrator.finalize_error(utterance_id);
                return RecoveryOutcome::Exhausted;
            }

            let record = records.entry(utterance_id).or_insert(RecoveryAttempt {
                category: error.category,
                attempt_count: 0,
                last_attempt: Instant::now(),
            });
            let since_last = record.last_attempt.elapsed();
            record.category = error.category;
            record.attempt_count += 1;
            record.last_attempt = Instant::now();
            (record.attempt_count, since_last)
        };

        self.record_attempt_stat(error.category);
        tracing::info!(
            utterance_id,
            attempt = attempt_number,
            max = config.max_attempts,
            since_last_ms = since_last.as_millis() as u64,
            strategy = ?config.strategy,
            "attempting recovery"
        );

        if let Some(action) = &config.custom_action {
            if action() {
                self.stats.lock().successful_recoveries += 1;
                self.notify_client(utterance_id, "Recovery successful", false);
                return RecoveryOutcome::Recovered;
            }
        }

        match config.strategy {
            RecoveryStrategy::RetryImmediate => {
                self.execute_retry(utterance_id, error.category)
            }
            RecoveryStrategy::RetryWithDelay => {
                let delay = compute_delay(&config, attempt_number);
                self.schedule_delayed(utterance_id, error.category, delay);
                self.notify_client(
                    utterance_id,
                    &format!("Retry scheduled in {} ms", delay.as_millis()),
                    false,
                );
                RecoveryOutcome::Scheduled
            }
            RecoveryStrategy::FallbackModel => {
                match &config.fallback_model_path {
                    Some(path) => {
                        tracing::info!(utterance_id, fallback = %path, "switching to fallback model");
                        self.execute_retry(utterance_id, error.category)
                    }
                    None => {
                        self.records.lock().remove(&utterance_id);
                        self.stats.lock().failed_recoveries += 1;
                        self.notify_client(utterance_id, "No fallback model available", true);
                        self.orchestrator.finalize_error(utterance_id);
                        RecoveryOutcome::Exhausted
                    }
                }
            }
            RecoveryStrategy::SkipStage => {
                let Some(stage) = Stage::for_category(error.category) else {
                    return self.give_up(utterance_id);
                };
                if self.orchestrator.skip_stage(utterance_id, stage) {
                    // The failing stage is behind us; the record has served
                    // its purpose.
                    self.records.lock().remove(&utterance_id);
                    self.stats.lock().successful_recoveries += 1;
                    self.notify_client(utterance_id, "Stage skipped", false);
                    RecoveryOutcome::Recovered
                } else {
                    self.give_up(utterance_id)
                }
            }
            RecoveryStrategy::RestartPipeline => {
                if self.orchestrator.restart(utterance_id) {
                    self.stats.lock().successful_recoveries += 1;
                    self.notify_client(utterance_id, "Pipeline restarted", false);
                    RecoveryOutcome::Recovered
                } else {
                    self.give_up(utterance_id)
                }
            }
            RecoveryStrategy::None | RecoveryStrategy::NotifyClientOnly => {
                // Handled above
                RecoveryOutcome::NotAttempted
            }
        }
    }

    fn execute_retry(&self, utterance_id: UtteranceId, category: ErrorCategory) -> RecoveryOutcome {
        let Some(stage) = Stage::for_category(category) else {
            return self.give_up(utterance_id);
        };
        if self.orchestrator.resume_stage(utterance_id, stage) {
            self.stats.lock().successful_recoveries += 1;
            self.notify_client(utterance_id, "Retrying stage", false);
            RecoveryOutcome::Recovered
        } else {
            self.give_up(utterance_id)
        }
    }

    /// Recovery is impossible (unknown utterance, unmapped stage, invalid
    /// state): drop the record and finalize the error.
    fn give_up(&self, utterance_id: UtteranceId) -> RecoveryOutcome {
        self.records.lock().remove(&utterance_id);
        self.stats.lock().failed_recoveries += 1;
        self.notify_client(utterance_id, "Recovery not possible", true);
        self.orchestrator.finalize_error(utterance_id);
        RecoveryOutcome::NotAttempted
    }

    fn record_attempt_stat(&self, category: ErrorCategory) {
        let mut stats = self.stats.lock();
        stats.total_attempts += 1;
        *stats.attempts_by_category.entry(category).or_insert(0) += 1;
    }

    fn schedule_delayed(&self, utterance_id: UtteranceId, category: ErrorCategory, delay: Duration) {
        let entry = DueEntry {
            due: Instant::now() + delay,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            utterance_id,
            category,
        };
        tracing::info!(
            utterance_id,
            delay_ms = delay.as_millis() as u64,
            "scheduling delayed recovery"
        );
        self.heap.lock().push(Reverse(entry));
        self.notify.notify_one();
    }

    async fn run_scheduler(inner: Arc<ControllerInner>) {
        tracing::debug!("delayed-recovery scheduler started");
        loop {
            if !inner.running.load(Ordering::Acquire) {
                break;
            }

            let notified = inner.notify.notified();
            let next_due = inner.heap.lock().peek().map(|Reverse(e)| e.due);

            match next_due {
                None => notified.await,
                Some(due) => {
                    let now = Instant::now();
                    if due <= now {
                        // Drain everything that has come due
                        let ready: Vec<DueEntry> = {
                            let mut heap = inner.heap.lock();
                            let mut ready = Vec::new();
                            loop {
                                let is_due = matches!(
                                    heap.peek(),
                                    Some(Reverse(entry)) if entry.due <= now
                                );
                                if !is_due {
                                    break;
                                }
                                if let Some(Reverse(entry)) = heap.pop() {
                                    ready.push(entry);
                                }
                            }
                            ready
                        };

                        for entry in ready {
                            if !inner.running.load(Ordering::Acquire) {
                                break;
                            }
                            inner.execute_delayed(entry);
                        }
                    } else {
                        tokio::select! {
                            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(due)) => {}
                            _ = notified => {}
                        }
                    }
                }
            }
        }
        tracing::debug!("delayed-recovery scheduler stopped");
    }

    fn execute_delayed(&self, entry: DueEntry) {
        let Some(stage) = Stage::for_category(entry.category) else {
            self.records.lock().remove(&entry.utterance_id);
            self.stats.lock().failed_recoveries += 1;
            return;
        };
        if self.orchestrator.resume_stage(entry.utterance_id, stage) {
            self.stats.lock().successful_recoveries += 1;
            self.notify_client(entry.utterance_id, "Retrying stage", false);
        } else {
            // Utterance disappeared or moved on; nothing left to retry
            self.records.lock().remove(&entry.utterance_id);
        }
    }

    fn notify_client(&self, utterance_id: UtteranceId, status: &str, is_final: bool) {
        let notifier = self.notifier.read().clone();
        match notifier {
            Some(notifier) => notifier(utterance_id, status, is_final),
            None => {
                tracing::info!(
                    utterance_id,
                    is_final,
                    "recovery status: {}",
                    status
                );
            }
        }
    }
}

/// Retry delay with exponential backoff and ±25% jitter, capped at
/// `max_delay`.
fn compute_delay(config: &RecoveryConfig, attempt_number: u32) -> Duration {
    if !config.exponential_backoff {
        return config.base_delay;
    }
    let exponential =
        config.base_delay.as_millis() as f64 * 2f64.powi(attempt_number.saturating_sub(1) as i32);
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    let capped = (exponential * jitter).min(config.max_delay.as_millis() as f64);
    Duration::from_millis(capped as u64)
}
