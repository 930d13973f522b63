//! Text to speech with a bounded clip cache

pub mod cache;
pub mod client;

use std::sync::Arc;

pub use cache::TtsCache;
pub use client::{HttpSpeechSynthesizer, SpeechSynthesizer};

/// Voice used when the caller does not pick one
pub const DEFAULT_VOICE: &str = "alloy";

/// Longest text accepted for one clip
pub const MAX_TEXT_CHARS: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum TtsError {
    #[error("Speech synthesis is not configured")]
    NotConfigured,
    #[error("Invalid speech request: {0}")]
    InvalidInput(String),
    #[error("Speech request failed: {0}")]
    Request(String),
    #[error("Speech endpoint returned {status}: {body}")]
    Upstream { status: u16, body: String },
}

/// A synthesized clip
#[derive(Debug, Clone)]
pub struct Speech {
    pub audio: Arc<Vec<u8>>,
    pub cached: bool,
}

/// Cache-fronted synthesizer
pub struct TtsService {
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    cache: TtsCache,
}

impl TtsService {
    pub fn new(synthesizer: Option<Arc<dyn SpeechSynthesizer>>, capacity: usize) -> Self {
        Self {
            synthesizer,
            cache: TtsCache::new(capacity),
        }
    }

    pub async fn speak(&self, text: &str, voice: Option<&str>) -> Result<Speech, TtsError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(TtsError::InvalidInput("text is required".to_string()));
        }
        if text.chars().count() > MAX_TEXT_CHARS {
            return Err(TtsError::InvalidInput(format!(
                "text must be at most {} characters",
                MAX_TEXT_CHARS
            )));
        }
        let voice = voice.map(str::trim).filter(|v| !v.is_empty()).unwrap_or(DEFAULT_VOICE);

        if let Some(audio) = self.cache.get(voice, text) {
            tracing::debug!(voice = %voice, "TTS cache hit");
            return Ok(Speech { audio, cached: true });
        }

        let synthesizer = self.synthesizer.as_ref().ok_or(TtsError::NotConfigured)?;
        let audio = Arc::new(synthesizer.synthesize(text, voice).await?);
        self.cache.insert(voice, text, audio.clone());
        tracing::info!(voice = %voice, bytes = audio.len(), "Speech synthesized");

        Ok(Speech { audio, cached: false })
    }
}
