//! Engine performance metrics and A/B model routing
//!
//! Records per-(model, language pair) metrics with running means, ranks and
//! selects models against hard caps and weighted composite scores, and
//! assigns models to sessions consistently with an active A/B traffic split.

pub mod metrics;
pub mod router;

pub use metrics::{MetricsStore, ModelMetrics, RankMetric, SelectionCriteria};
pub use router::{
    AbTestConfig, AbTestResults, DiagnosticIssue, ModelRouter, RouterConfig,
};
