//! A/B traffic routing with session-sticky model assignment
//!
//! While a test is active, a session's model is derived from a stable hash
//! bucket over the test's traffic split and cached for the life of the test.
//! A background sweep completes due tests, enforces metrics retention, and
//! raises degradation alerts.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::metrics::{MetricsStore, ModelMetrics, RankMetric, SelectionCriteria};

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Emit per-record callbacks and debug logging
    pub detailed_metrics: bool,
    /// Raise degradation alerts from the background sweep
    pub auto_rollback: bool,
    /// Failure-rate percentage above which a model is flagged
    pub auto_rollback_threshold: f32,
    /// Metrics rows unused for this long are removed
    pub retention_hours: i64,
    /// Background sweep cadence
    pub sweep_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            detailed_metrics: true,
            auto_rollback: false,
            auto_rollback_threshold: 15.0,
            retention_hours: 168,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// A/B test configuration
#[derive(Debug, Clone)]
pub struct AbTestConfig {
    pub test_id: String,
    pub name: String,
    pub description: String,
    pub model_ids: Vec<String>,
    /// Traffic percentages per model; must sum to 100
    pub traffic_split: Vec<f32>,
    pub primary_metric: RankMetric,
    /// Successful samples needed for the simplified significance rule
    pub minimum_sample_size: u64,
    pub duration: Duration,

    pub active: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

impl AbTestConfig {
    pub fn new(test_id: impl Into<String>, model_ids: Vec<String>, traffic_split: Vec<f32>) -> Self {
        Self {
            test_id: test_id.into(),
            name: String::new(),
            description: String::new(),
            model_ids,
            traffic_split,
            primary_metric: RankMetric::Quality,
            minimum_sample_size: 100,
            duration: Duration::from_secs(24 * 3600),
            active: false,
            started_at: None,
            ends_at: None,
        }
    }
}

/// Completed A/B test results
#[derive(Debug, Clone)]
pub struct AbTestResults {
    pub test_id: String,
    pub winning_model_id: String,
    pub confidence_level: f32,
    pub statistically_significant: bool,
    pub model_results: HashMap<String, ModelMetrics>,
    pub recommendation: String,
    pub completed_at: DateTime<Utc>,
}

/// Degradation alert raised by the background sweep
#[derive(Debug, Clone)]
pub struct DiagnosticIssue {
    pub model_id: String,
    pub language_pair: String,
    pub message: String,
}

type MetricsCallback = Arc<dyn Fn(&ModelMetrics) + Send + Sync>;
type TestCompleteCallback = Arc<dyn Fn(&AbTestResults) + Send + Sync>;
type AlertCallback = Arc<dyn Fn(&DiagnosticIssue) + Send + Sync>;

#[derive(Default)]
struct RouterCallbacks {
    on_metrics: Option<MetricsCallback>,
    on_test_complete: Option<TestCompleteCallback>,
    on_alert: Option<AlertCallback>,
}

struct RouterInner {
    config: RouterConfig,
    store: MetricsStore,
    tests: Mutex<HashMap<String, AbTestConfig>>,
    completed: Mutex<HashMap<String, AbTestResults>>,
    /// (session_id | language_pair) -> model id, for the life of a test
    assignments: DashMap<String, String>,
    callbacks: RwLock<RouterCallbacks>,
    sweep_shutdown: Mutex<Option<watch::Sender<bool>>>,
}

/// Records engine metrics and routes sessions to models.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct ModelRouter {
    inner: Arc<RouterInner>,
}

impl ModelRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                config,
                store: MetricsStore::new(),
                tests: Mutex::new(HashMap::new()),
                completed: Mutex::new(HashMap::new()),
                assignments: DashMap::new(),
                callbacks: RwLock::new(RouterCallbacks::default()),
                sweep_shutdown: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    /// The underlying metrics store (rank, select, compare, reports)
    pub fn metrics(&self) -> &MetricsStore {
        &self.inner.store
    }

    // ---- callbacks -------------------------------------------------------

    pub fn on_metrics(&self, callback: impl Fn(&ModelMetrics) + Send + Sync + 'static) {
        self.inner.callbacks.write().on_metrics = Some(Arc::new(callback));
    }

    pub fn on_test_complete(&self, callback: impl Fn(&AbTestResults) + Send + Sync + 'static) {
        self.inner.callbacks.write().on_test_complete = Some(Arc::new(callback));
    }

    pub fn on_alert(&self, callback: impl Fn(&DiagnosticIssue) + Send + Sync + 'static) {
        self.inner.callbacks.write().on_alert = Some(Arc::new(callback));
    }

    // ---- metrics ---------------------------------------------------------

    /// Record one engine call's observed metrics
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        model_id: &str,
        language_pair: &str,
        latency_ms: f32,
        word_error_rate: f32,
        confidence: f32,
        audio_quality: f32,
        success: bool,
    ) {
        let row = self.inner.store.record(
            model_id,
            language_pair,
            latency_ms,
            word_error_rate,
            confidence,
            audio_quality,
            success,
        );

        if self.inner.config.detailed_metrics {
            tracing::debug!(
                model_id,
                language_pair,
                latency_ms,
                word_error_rate,
                confidence,
                "recorded model metrics"
            );
            let cb = self.inner.callbacks.read().on_metrics.clone();
            if let Some(cb) = cb {
                cb(&row);
            }
        }
    }

    // ---- A/B lifecycle ---------------------------------------------------

    /// Register a test. Fails on duplicate ids, empty model lists,
    /// mismatched split lengths, or splits not summing to 100.
    pub fn create_test(&self, config: AbTestConfig) -> Result<(), String> {
        if config.test_id.is_empty() || config.model_ids.is_empty() {
            return Err("test id and model list must be non-empty".into());
        }
        if config.model_ids.len() != config.traffic_split.len() {
            return Err("model count does not match traffic split count".into());
        }
        let total: f32 = config.traffic_split.iter().sum();
        if (total - 100.0).abs() > 0.01 {
            return Err(format!("traffic split sums to {total}, expected 100"));
        }

        let mut tests = self.inner.tests.lock();
        if tests.contains_key(&config.test_id) {
            return Err(format!("test {} already exists", config.test_id));
        }
        tracing::info!(
            test_id = %config.test_id,
            models = config.model_ids.len(),
            "created A/B test"
        );
        tests.insert(config.test_id.clone(), config);
        Ok(())
    }

    /// Start a test: captures the start time and computes the end time
    pub fn start_test(&self, test_id: &str) -> bool {
        let mut tests = self.inner.tests.lock();
        let Some(test) = tests.get_mut(test_id) else {
            tracing::warn!(test_id, "A/B test not found");
            return false;
        };
        if test.active {
            return true;
        }
        let now = Utc::now();
        test.active = true;
        test.started_at = Some(now);
        test.ends_at = Some(
            now + chrono::Duration::from_std(test.duration).unwrap_or(chrono::Duration::hours(24)),
        );
        tracing::info!(test_id, "started A/B test");
        true
    }

    /// Stop a test early. The background sweep folds it into completed
    /// results on its next cycle.
    pub fn stop_test(&self, test_id: &str) -> bool {
        let mut tests = self.inner.tests.lock();
        let Some(test) = tests.get_mut(test_id) else {
            tracing::warn!(test_id, "A/B test not found");
            return false;
        };
        test.active = false;
        test.ends_at = Some(Utc::now());
        tracing::info!(test_id, "stopped A/B test");
        true
    }

    pub fn active_tests(&self) -> Vec<AbTestConfig> {
        self.inner
            .tests
            .lock()
            .values()
            .filter(|t| t.active)
            .cloned()
            .collect()
    }

    pub fn test_results(&self, test_id: &str) -> Option<AbTestResults> {
        self.inner.completed.lock().get(test_id).cloned()
    }

    pub fn completed_tests(&self) -> Vec<AbTestResults> {
        self.inner.completed.lock().values().cloned().collect()
    }

    pub fn is_test_significant(&self, test_id: &str) -> bool {
        self.test_results(test_id)
            .map(|r| r.statistically_significant)
            .unwrap_or(false)
    }

    // ---- routing ---------------------------------------------------------

    /// Model to use for a session on a language pair.
    ///
    /// With an active test: the session's hash bucket picks a model from
    /// the traffic split, and the assignment is cached until the test ends.
    /// Otherwise: `select_best` under default criteria.
    pub fn model_for(&self, language_pair: &str, session_id: &str) -> Option<String> {
        let assignment_key = format!("{session_id}|{language_pair}");

        {
            let tests = self.inner.tests.lock();
            if let Some(test) = tests.values().find(|t| t.active) {
                if let Some(model) = self.inner.assignments.get(&assignment_key) {
                    return Some(model.value().clone());
                }
                let model = assign_from_split(test, session_id);
                self.inner
                    .assignments
                    .insert(assignment_key, model.clone());
                tracing::debug!(
                    session_id,
                    language_pair,
                    model = %model,
                    "assigned session to A/B test model"
                );
                return Some(model);
            }
        }

        self.inner
            .store
            .select_best(language_pair, &SelectionCriteria::default())
    }

    // ---- background sweep ------------------------------------------------

    /// One sweep cycle: complete due tests, enforce retention, raise
    /// degradation alerts. Also callable directly from tests.
    pub fn sweep(&self) {
        self.complete_due_tests();
        let cutoff = Utc::now() - chrono::Duration::hours(self.inner.config.retention_hours);
        self.inner.store.retain_used_since(cutoff);
        if self.inner.config.auto_rollback {
            self.check_degradation();
        }
    }

    /// Spawn the periodic sweep task. Returns its shutdown sender.
    pub fn start_sweep_task(&self) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let router = self.clone();
        let interval = self.inner.config.sweep_interval;

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => router.sweep(),
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("router sweep task shutting down");
                            break;
                        }
                    }
                }
            }
        });

        *self.inner.sweep_shutdown.lock() = Some(shutdown_tx.clone());
        shutdown_tx
    }

    pub fn shutdown(&self) {
        if let Some(tx) = self.inner.sweep_shutdown.lock().take() {
            let _ = tx.send(true);
        }
    }

    fn complete_due_tests(&self) {
        let now = Utc::now();
        let due: Vec<AbTestConfig> = {
            let mut tests = self.inner.tests.lock();
            let due_ids: Vec<String> = tests
                .values()
                .filter(|t| {
                    t.started_at.is_some()
                        && t.ends_at.map(|end| now >= end).unwrap_or(false)
                })
                .map(|t| t.test_id.clone())
                .collect();
            due_ids
                .into_iter()
                .filter_map(|id| tests.remove(&id))
                .collect()
        };

        for test in due {
            let results = self.build_results(&test, now);
            tracing::info!(
                test_id = %test.test_id,
                winner = %results.winning_model_id,
                significant = results.statistically_significant,
                "A/B test completed"
            );

            let cb = self.inner.callbacks.read().on_test_complete.clone();
            if let Some(cb) = cb {
                cb(&results);
            }
            self.inner
                .completed
                .lock()
                .insert(test.test_id.clone(), results);

            // Sticky assignments die with the test
            self.inner.assignments.clear();
        }
    }

    fn build_results(&self, test: &AbTestConfig, now: DateTime<Utc>) -> AbTestResults {
        let mut model_results = HashMap::new();
        let mut winner = String::new();
        let mut best_score = f32::MIN;
        let mut successful_total = 0u64;

        for model_id in &test.model_ids {
            let Some(row) = self
                .inner
                .store
                .all()
                .into_iter()
                .find(|m| &m.model_id == model_id)
            else {
                continue;
            };
            successful_total += row.successful_samples;
            if row.quality_score > best_score {
                best_score = row.quality_score;
                winner = row.model_id.clone();
            }
            model_results.insert(model_id.clone(), row);
        }

        // Simplified significance rule: enough successful samples landed
        let statistically_significant = successful_total >= test.minimum_sample_size;

        AbTestResults {
            test_id: test.test_id.clone(),
            recommendation: if winner.is_empty() {
                "No model produced metrics during the test".to_string()
            } else {
                format!("Deploy model {winner}")
            },
            winning_model_id: winner,
            confidence_level: 0.95,
            statistically_significant,
            model_results,
            completed_at: now,
        }
    }

    fn check_degradation(&self) {
        let threshold = self.inner.config.auto_rollback_threshold;
        for row in self.inner.store.all() {
            // Only judge models with enough traffic to mean anything
            if row.total_samples < 20 {
                continue;
            }
            let failure_pct = (1.0 - row.success_rate()) * 100.0;
            if failure_pct > threshold || row.word_error_rate > 0.5 {
                let issue = DiagnosticIssue {
                    model_id: row.model_id.clone(),
                    language_pair: row.language_pair.clone(),
                    message: format!(
                        "model degradation: failure rate {:.1}%, WER {:.2}",
                        failure_pct, row.word_error_rate
                    ),
                };
                tracing::warn!(
                    model_id = %issue.model_id,
                    language_pair = %issue.language_pair,
                    "{}",
                    issue.message
                );
                let cb = self.inner.callbacks.read().on_alert.clone();
                if let Some(cb) = cb {
                    cb(&issue);
                }
            }
        }
    }
}

/// Deterministic bucket assignment: hash the session into [0, 100) and walk
/// the cumulative traffic split.
fn assign_from_split(test: &AbTestConfig, session_id: &str) -> String {
    let mut hasher = DefaultHasher::new();
    session_id.hash(&mut hasher);
    let bucket = (hasher.finish() % 10_000) as f32 / 100.0;

    let mut cumulative = 0.0;
    for (model_id, share) in test.model_ids.iter().zip(&test.traffic_split) {
        cumulative += share;
        if bucket < cumulative {
            return model_id.clone();
        }
    }
    // Rounding left the bucket past the last boundary
    test.model_ids[0].clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn router() -> ModelRouter {
        ModelRouter::new(RouterConfig {
            sweep_interval: Duration::from_millis(25),
            ..RouterConfig::default()
        })
    }

    fn split_test(id: &str) -> AbTestConfig {
        AbTestConfig::new(
            id,
            vec!["model-a".into(), "model-b".into()],
            vec![50.0, 50.0],
        )
    }

    #[test]
    fn test_create_test_validation() {
        let r = router();
        assert!(r.create_test(split_test("t1")).is_ok());
        // Duplicate id
        assert!(r.create_test(split_test("t1")).is_err());
        // Split does not sum to 100
        assert!(r
            .create_test(AbTestConfig::new(
                "t2",
                vec!["a".into(), "b".into()],
                vec![60.0, 60.0]
            ))
            .is_err());
        // Length mismatch
        assert!(r
            .create_test(AbTestConfig::new("t3", vec!["a".into()], vec![50.0, 50.0]))
            .is_err());
        // Empty models
        assert!(r.create_test(AbTestConfig::new("t4", vec![], vec![])).is_err());
    }

    #[test]
    fn test_assignment_sticky_for_session() {
        let r = router();
        r.create_test(split_test("t1")).unwrap();
        r.start_test("t1");

        let first = r.model_for("en-es", "sess-42").unwrap();
        for _ in 0..100 {
            assert_eq!(r.model_for("en-es", "sess-42").unwrap(), first);
        }
    }

    #[test]
    fn test_split_distributes_sessions() {
        let r = router();
        r.create_test(split_test("t1")).unwrap();
        r.start_test("t1");

        let mut counts: HashMap<String, usize> = HashMap::new();
        for i in 0..200 {
            let model = r.model_for("en-es", &format!("sess-{i}")).unwrap();
            *counts.entry(model).or_insert(0) += 1;
        }
        // Both arms see traffic under a 50/50 split
        assert!(counts.get("model-a").copied().unwrap_or(0) > 20);
        assert!(counts.get("model-b").copied().unwrap_or(0) > 20);
    }

    #[test]
    fn test_no_test_falls_back_to_best_model() {
        let r = router();
        for _ in 0..5 {
            r.record("solo", "en-es", 100.0, 0.05, 0.95, 0.9, true);
        }
        assert_eq!(r.model_for("en-es", "sess-1"), Some("solo".into()));
        // Unknown pair has no qualified model
        assert_eq!(r.model_for("fr-de", "sess-1"), None);
    }

    #[tokio::test]
    async fn test_stop_then_sweep_completes_test() {
        let r = router();
        r.create_test(split_test("t1")).unwrap();
        r.start_test("t1");

        for _ in 0..60 {
            r.record("model-a", "en-es", 100.0, 0.1, 0.9, 0.8, true);
            r.record("model-b", "en-es", 120.0, 0.05, 0.95, 0.9, true);
        }

        let completions = Arc::new(AtomicUsize::new(0));
        let completions_sink = Arc::clone(&completions);
        r.on_test_complete(move |_| {
            completions_sink.fetch_add(1, Ordering::SeqCst);
        });

        r.stop_test("t1");
        let shutdown = r.start_sweep_task();

        for _ in 0..100 {
            if r.test_results("t1").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let results = r.test_results("t1").expect("test never completed");
        assert_eq!(results.winning_model_id, "model-b");
        assert!(results.statistically_significant); // 120 successes >= 100
        assert_eq!(results.model_results.len(), 2);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert!(r.active_tests().is_empty());
        assert!(r.is_test_significant("t1"));

        let _ = shutdown.send(true);
    }

    #[test]
    fn test_insignificant_below_sample_size() {
        let r = router();
        let mut config = split_test("t1");
        config.minimum_sample_size = 1000;
        r.create_test(config).unwrap();
        r.start_test("t1");
        r.record("model-a", "en-es", 100.0, 0.1, 0.9, 0.8, true);

        r.stop_test("t1");
        r.sweep();

        let results = r.test_results("t1").unwrap();
        assert!(!results.statistically_significant);
    }

    #[test]
    fn test_assignments_cleared_after_completion() {
        let r = router();
        r.create_test(split_test("t1")).unwrap();
        r.start_test("t1");

        for _ in 0..5 {
            r.record("solo", "en-es", 100.0, 0.05, 0.95, 0.9, true);
        }
        let assigned = r.model_for("en-es", "sess-9").unwrap();
        assert!(["model-a", "model-b"].contains(&assigned.as_str()));

        r.stop_test("t1");
        r.sweep();

        // No active test anymore: routing reverts to best-model selection
        assert_eq!(r.model_for("en-es", "sess-9"), Some("solo".into()));
    }

    #[test]
    fn test_degradation_alert() {
        let r = ModelRouter::new(RouterConfig {
            auto_rollback: true,
            auto_rollback_threshold: 15.0,
            ..RouterConfig::default()
        });

        let alerts = Arc::new(Mutex::new(Vec::new()));
        let alerts_sink = Arc::clone(&alerts);
        r.on_alert(move |issue| {
            alerts_sink.lock().push(issue.clone());
        });

        // 25 samples, 40% failures: over the 15% threshold
        for i in 0..25 {
            r.record("shaky", "en-es", 100.0, 0.1, 0.9, 0.8, i % 5 > 1);
        }
        r.sweep();

        let seen = alerts.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].model_id, "shaky");
    }

    #[test]
    fn test_metrics_callback_gated_by_detailed_flag() {
        let r = ModelRouter::new(RouterConfig {
            detailed_metrics: false,
            ..RouterConfig::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_sink = Arc::clone(&calls);
        r.on_metrics(move |_| {
            calls_sink.fetch_add(1, Ordering::SeqCst);
        });

        r.record("m", "en-es", 100.0, 0.1, 0.9, 0.8, true);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
