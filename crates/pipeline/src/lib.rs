//! Utterance processing pipeline
//!
//! This crate provides the concurrent core of the backend:
//! - Priority task queue with a fixed worker pool
//! - Per-utterance state machine driving audio through STT → MT → TTS
//! - Recovery controller mapping error categories to retry strategies
//! - Deterministic simulation fallbacks for absent engines

pub mod orchestrator;
pub mod queue;
pub mod recovery;
pub mod sim;

// Queue exports
pub use queue::{QueueStats, TaskPriority, TaskQueue};

// Orchestrator exports
pub use orchestrator::{
    FailureHook, OrchestratorConfig, OrchestratorStats, Stage, UtteranceOrchestrator,
    SKIPPED_TRANSCRIPT,
};

// Recovery exports
pub use recovery::{
    ClientNotifier, RecoveryConfig, RecoveryController, RecoveryOutcome, RecoveryStats,
    RecoveryStrategy,
};
