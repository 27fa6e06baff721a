//! Text-to-Speech capability

use async_trait::async_trait;

use crate::Result;

/// Result of synthesizing text to audio
#[derive(Debug, Clone)]
pub struct Synthesis {
    /// Encoded audio; the format is an engine contract with the client
    pub audio: Vec<u8>,
    pub duration_secs: f32,
}

/// Text-to-Speech interface
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync + 'static {
    /// Voice used when the caller does not request one
    fn default_voice(&self) -> String;

    /// All voice ids this engine can synthesize with
    fn available_voices(&self) -> Vec<String>;

    /// Synthesize text with the given voice
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Synthesis>;

    /// Whether the engine has loaded its model and can serve calls
    fn is_initialized(&self) -> bool;

    /// Engine name for logging
    fn engine_name(&self) -> &str {
        "tts"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockTts;

    #[async_trait]
    impl SpeechSynthesizer for MockTts {
        fn default_voice(&self) -> String {
            "default".into()
        }

        fn available_voices(&self) -> Vec<String> {
            vec!["default".into(), "alto".into()]
        }

        async fn synthesize(&self, text: &str, _voice_id: &str) -> Result<Synthesis> {
            Ok(Synthesis {
                audio: vec![0u8; text.len() * 10],
                duration_secs: text.len() as f32 * 0.05,
            })
        }

        fn is_initialized(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_mock_synthesize() {
        let tts = MockTts;
        assert!(tts.available_voices().contains(&tts.default_voice()));

        let result = tts.synthesize("hola", "default").await.unwrap();
        assert_eq!(result.audio.len(), 40);
    }
}
