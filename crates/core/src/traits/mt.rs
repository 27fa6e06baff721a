//! Machine translation capability

use async_trait::async_trait;

use crate::Result;

/// Result of translating a piece of text
#[derive(Debug, Clone)]
pub struct Translation {
    pub text: String,
    /// Model confidence in [0.0, 1.0], 0.0 when the backend does not score
    pub confidence: f32,
}

/// Machine translation interface
///
/// Engines are initialized lazily per language pair; `supports` answers
/// without loading anything.
#[async_trait]
pub trait Translator: Send + Sync + 'static {
    /// Whether the engine can translate this language pair at all
    fn supports(&self, source: &str, target: &str) -> bool;

    /// Load models for the language pair. Idempotent.
    async fn initialize(&self, source: &str, target: &str) -> Result<()>;

    /// Translate text using the currently initialized pair
    async fn translate(&self, text: &str) -> Result<Translation>;

    /// Whether a language pair has been initialized
    fn is_initialized(&self) -> bool;

    /// Engine name for logging
    fn engine_name(&self) -> &str {
        "mt"
    }
}
