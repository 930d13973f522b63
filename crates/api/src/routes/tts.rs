//! Cached speech synthesis

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{error::ApiResult, routes::json_body, state::AppState};

#[derive(Debug, Deserialize)]
pub struct TtsRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub voice: Option<String>,
}

pub async fn synthesize(
    State(state): State<AppState>,
    payload: Result<Json<TtsRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let req = json_body(payload)?;
    let speech = state.tts.speak(&req.text, req.voice.as_deref()).await?;
    Ok(Json(json!({
        "ok": true,
        "audio": STANDARD.encode(speech.audio.as_slice()),
        "cached": speech.cached,
    })))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::routes::{create_router, test_support::*};
    use crate::tts::{SpeechSynthesizer, TtsError};

    struct EchoSynth;

    #[async_trait]
    impl SpeechSynthesizer for EchoSynth {
        async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, TtsError> {
            Ok(format!("{}:{}", voice, text).into_bytes())
        }
    }

    #[tokio::test]
    async fn test_tts_returns_base64_and_caches() {
        let app = create_router(test_state().with_synthesizer(Arc::new(EchoSynth)));

        let (status, first) = send(&app, "POST", "/api/tts", Some(json!({"text": "hi", "voice": "nova"}))).await;
        assert_eq!(status, StatusCode::OK);
        // base64("nova:hi")
        assert_eq!(first["audio"], "bm92YTpoaQ==");
        assert_eq!(first["cached"], false);

        let (_, second) = send(&app, "POST", "/api/tts", Some(json!({"text": "hi", "voice": "nova"}))).await;
        assert_eq!(second["cached"], true);
    }

    #[tokio::test]
    async fn test_tts_without_backend_is_unavailable() {
        let app = create_router(test_state());
        let (status, _) = send(&app, "POST", "/api/tts", Some(json!({"text": "hi"}))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _) = send(&app, "POST", "/api/tts", Some(json!({"text": ""}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
