//! Rolling per-model performance metrics
//!
//! Metrics are keyed by (model id, language pair). Running means only fold
//! in successful samples; failures increment the failure count and nothing
//! else.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Metrics a ranking or selection can be driven by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankMetric {
    /// Lower is better
    Latency,
    /// Lower is better
    WordErrorRate,
    /// Lower is better
    Memory,
    /// Higher is better
    Throughput,
    /// Higher is better
    Confidence,
    /// Higher is better
    Quality,
}

impl RankMetric {
    fn lower_is_better(self) -> bool {
        matches!(
            self,
            RankMetric::Latency | RankMetric::WordErrorRate | RankMetric::Memory
        )
    }
}

/// Cumulative metrics for one (model, language pair)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub model_id: String,
    pub language_pair: String,

    pub total_samples: u64,
    pub successful_samples: u64,
    pub failed_samples: u64,

    // Running means over successful samples
    pub average_latency_ms: f32,
    pub word_error_rate: f32,
    pub confidence: f32,
    pub audio_quality: f32,
    /// Composite: 0.6*(1-WER) + 0.3*confidence + 0.1*audio_quality
    pub quality_score: f32,

    // Resource-side metrics, updated separately
    pub throughput_wps: f32,
    pub memory_mb: f32,
    pub cpu_utilization: f32,

    pub first_used: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

impl ModelMetrics {
    fn new(model_id: &str, language_pair: &str) -> Self {
        let now = Utc::now();
        Self {
            model_id: model_id.to_string(),
            language_pair: language_pair.to_string(),
            total_samples: 0,
            successful_samples: 0,
            failed_samples: 0,
            average_latency_ms: 0.0,
            word_error_rate: 0.0,
            confidence: 0.0,
            audio_quality: 0.0,
            quality_score: 0.0,
            throughput_wps: 0.0,
            memory_mb: 0.0,
            cpu_utilization: 0.0,
            first_used: now,
            last_used: now,
        }
    }

    pub fn success_rate(&self) -> f32 {
        if self.total_samples == 0 {
            0.0
        } else {
            self.successful_samples as f32 / self.total_samples as f32
        }
    }

    /// The value this row exposes for a rank metric
    pub fn metric_value(&self, metric: RankMetric) -> f32 {
        match metric {
            RankMetric::Latency => self.average_latency_ms,
            RankMetric::WordErrorRate => self.word_error_rate,
            RankMetric::Memory => self.memory_mb,
            RankMetric::Throughput => self.throughput_wps,
            RankMetric::Confidence => self.confidence,
            RankMetric::Quality => self.quality_score,
        }
    }

    /// Normalized value in roughly [0, 1] where higher is always better
    fn normalized(&self, metric: RankMetric) -> f32 {
        match metric {
            RankMetric::WordErrorRate => 1.0 - self.word_error_rate,
            RankMetric::Latency => 1.0 / (1.0 + self.average_latency_ms / 1000.0),
            RankMetric::Memory => 1.0 / (1.0 + self.memory_mb / 1000.0),
            RankMetric::Throughput => self.throughput_wps / (1.0 + self.throughput_wps),
            RankMetric::Confidence => self.confidence,
            RankMetric::Quality => self.quality_score,
        }
    }
}

/// Hard caps and composite weights for `select_best`
#[derive(Debug, Clone)]
pub struct SelectionCriteria {
    pub max_latency_ms: f32,
    pub min_confidence: f32,
    pub max_memory_mb: f32,
    pub max_cpu_utilization: f32,
    /// Weighted metrics folded into the composite score
    pub weights: HashMap<RankMetric, f32>,
}

impl Default for SelectionCriteria {
    fn default() -> Self {
        let mut weights = HashMap::new();
        weights.insert(RankMetric::WordErrorRate, 0.4);
        weights.insert(RankMetric::Latency, 0.3);
        weights.insert(RankMetric::Confidence, 0.2);
        weights.insert(RankMetric::Memory, 0.1);
        Self {
            max_latency_ms: 1000.0,
            min_confidence: 0.8,
            max_memory_mb: 2048.0,
            max_cpu_utilization: 0.8,
            weights,
        }
    }
}

impl SelectionCriteria {
    fn passes_caps(&self, m: &ModelMetrics) -> bool {
        m.average_latency_ms <= self.max_latency_ms
            && m.confidence >= self.min_confidence
            && m.memory_mb <= self.max_memory_mb
            && m.cpu_utilization <= self.max_cpu_utilization
    }

    fn composite(&self, m: &ModelMetrics) -> f32 {
        self.weights
            .iter()
            .map(|(metric, weight)| m.normalized(*metric) * weight)
            .sum()
    }
}

fn key(model_id: &str, language_pair: &str) -> String {
    format!("{model_id}|{language_pair}")
}

/// Thread-safe store of per-model metrics
#[derive(Default)]
pub struct MetricsStore {
    rows: Mutex<HashMap<String, ModelMetrics>>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one engine call. Returns the updated row.
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
    ) -> ModelMetrics {
        let mut rows = self.rows.lock();
        let row = rows
            .entry(key(model_id, language_pair))
            .or_insert_with(|| ModelMetrics::new(model_id, language_pair));

        row.last_used = Utc::now();
        row.total_samples += 1;

        if success {
            row.successful_samples += 1;
            let n = row.successful_samples as f32;
            row.average_latency_ms = (row.average_latency_ms * (n - 1.0) + latency_ms) / n;
            row.word_error_rate = (row.word_error_rate * (n - 1.0) + word_error_rate) / n;
            row.confidence = (row.confidence * (n - 1.0) + confidence) / n;
            row.audio_quality = (row.audio_quality * (n - 1.0) + audio_quality) / n;
            row.quality_score = 0.6 * (1.0 - row.word_error_rate)
                + 0.3 * row.confidence
                + 0.1 * row.audio_quality;
        } else {
            row.failed_samples += 1;
        }

        row.clone()
    }

    /// Update the resource-side metrics for a model
    pub fn record_resources(
        &self,
        model_id: &str,
        language_pair: &str,
        memory_mb: f32,
        cpu_utilization: f32,
        throughput_wps: f32,
    ) {
        let mut rows = self.rows.lock();
        let row = rows
            .entry(key(model_id, language_pair))
            .or_insert_with(|| ModelMetrics::new(model_id, language_pair));
        row.memory_mb = memory_mb;
        row.cpu_utilization = cpu_utilization;
        row.throughput_wps = throughput_wps;
    }

    pub fn get(&self, model_id: &str, language_pair: &str) -> Option<ModelMetrics> {
        self.rows.lock().get(&key(model_id, language_pair)).cloned()
    }

    pub fn all(&self) -> Vec<ModelMetrics> {
        self.rows.lock().values().cloned().collect()
    }

    /// Rows matching one language pair
    pub fn for_pair(&self, language_pair: &str) -> Vec<ModelMetrics> {
        self.rows
            .lock()
            .values()
            .filter(|m| m.language_pair == language_pair)
            .cloned()
            .collect()
    }

    /// Signed comparison on one metric: positive when `model_a` is better.
    /// Zero when either row is missing.
    pub fn compare(
        &self,
        model_a: &str,
        model_b: &str,
        language_pair: &str,
        metric: RankMetric,
    ) -> f32 {
        let (Some(a), Some(b)) = (
            self.get(model_a, language_pair),
            self.get(model_b, language_pair),
        ) else {
            return 0.0;
        };
        let (va, vb) = (a.metric_value(metric), b.metric_value(metric));
        if metric.lower_is_better() {
            vb - va
        } else {
            va - vb
        }
    }

    /// Model ids for a language pair ordered best-first on one metric
    pub fn rank(&self, language_pair: &str, metric: RankMetric) -> Vec<String> {
        let mut scored: Vec<(String, f32)> = self
            .for_pair(language_pair)
            .into_iter()
            .map(|m| {
                let value = m.metric_value(metric);
                let score = if metric.lower_is_better() { -value } else { value };
                (m.model_id, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.into_iter().map(|(id, _)| id).collect()
    }

    /// Best model for a pair: drop rows violating the hard caps, then pick
    /// the highest weighted composite. `None` when nothing qualifies.
    pub fn select_best(
        &self,
        language_pair: &str,
        criteria: &SelectionCriteria,
    ) -> Option<String> {
        self.for_pair(language_pair)
            .into_iter()
            .filter(|m| criteria.passes_caps(m))
            .map(|m| {
                let score = criteria.composite(&m);
                (m.model_id, score)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
    }

    /// Drop rows whose last use predates the cutoff. Returns the count
    /// removed.
    pub fn retain_used_since(&self, cutoff: DateTime<Utc>) -> usize {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|_, m| m.last_used >= cutoff);
        let removed = before - rows.len();
        if removed > 0 {
            tracing::debug!("metrics retention removed {} stale rows", removed);
        }
        removed
    }

    /// JSON report of rows, optionally filtered by pair and recency
    pub fn report_json(
        &self,
        language_pair: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> serde_json::Value {
        let rows: Vec<ModelMetrics> = self
            .rows
            .lock()
            .values()
            .filter(|m| language_pair.map_or(true, |p| m.language_pair == p))
            .filter(|m| since.map_or(true, |cutoff| m.last_used >= cutoff))
            .cloned()
            .collect();

        serde_json::json!({
            "timestamp": Utc::now().timestamp(),
            "language_pair": language_pair.unwrap_or(""),
            "models": rows,
        })
    }
}
