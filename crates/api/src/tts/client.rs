//! Speech synthesis backends

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::TtsError;

/// Turns text into encoded audio
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, TtsError>;
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
}

/// Synthesizer backed by an OpenAI-compatible `/audio/speech` endpoint
#[derive(Clone)]
pub struct HttpSpeechSynthesizer {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpSpeechSynthesizer {
    pub fn new(url: String, api_key: Option<String>) -> Result<Self, TtsError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TtsError::Request(e.to_string()))?;
        Ok(Self {
            http,
            url,
            api_key,
            model: "tts-1".to_string(),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechSynthesizer {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, TtsError> {
        let mut request = self.http.post(&self.url).json(&SpeechRequest {
            model: &self.model,
            input: text,
            voice,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TtsError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(http_status = %status, body = %body, "Speech endpoint returned an error");
            return Err(TtsError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| TtsError::Request(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}
