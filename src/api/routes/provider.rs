//! Meeting-bot provider callback endpoint.
//!
//! The provider pushes real-time transcript fragments here as
//! `{event, data}` envelopes. Only `bot.transcription` events are processed;
//! everything else is acknowledged and ignored.

use axum::{extract::State, response::Json, routing::post, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};

use crate::api::error::{ApiError, ApiResult};
use crate::db::transcripts::SpokenWord;
use crate::ingest::{IngestOutcome, TranscriptBatch, TranscriptIngestor};
use crate::trace::TraceContext;

const TRANSCRIPTION_EVENT: &str = "bot.transcription";

/// Shared state for provider routes.
#[derive(Clone)]
pub struct ProviderState {
    pub ingestor: Arc<TranscriptIngestor>,
}

/// The provider's callback envelope. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
pub struct ProviderCallback {
    pub event: String,
    pub data: ProviderEventData,
}

#[derive(Debug, Deserialize)]
pub struct ProviderEventData {
    pub bot_id: String,
    pub recording_id: String,
    pub transcript: ProviderTranscript,
}

#[derive(Debug, Deserialize)]
pub struct ProviderTranscript {
    pub speaker: Option<String>,
    pub speaker_id: i64,
    pub words: Vec<ProviderWord>,
}

#[derive(Debug, Deserialize)]
pub struct ProviderWord {
    pub text: String,
    pub start_time: f64,
    pub end_time: f64,
    pub confidence: f64,
}

pub fn router(state: ProviderState) -> Router {
    Router::new()
        .route("/callback/provider", post(handle_callback))
        .with_state(state)
}

async fn handle_callback(
    State(state): State<ProviderState>,
    Json(callback): Json<ProviderCallback>,
) -> ApiResult<Json<Value>> {
    let trace = TraceContext::new("provider-callback");

    if callback.event != TRANSCRIPTION_EVENT {
        info!(
            trace_id = %trace.trace_id,
            "Ignoring provider event \"{}\"", callback.event
        );
        return Ok(Json(json!({})));
    }

    let data = callback.data;
    let batch = TranscriptBatch {
        provider_bot_id: data.bot_id,
        recording_id: data.recording_id,
        speaker_id: data.transcript.speaker_id.to_string(),
        speaker_name: data.transcript.speaker,
        words: data
            .transcript
            .words
            .into_iter()
            .map(|word| SpokenWord {
                word: word.text,
                start_time: word.start_time,
                end_time: word.end_time,
                confidence: word.confidence,
            })
            .collect(),
    };

    match state.ingestor.ingest(batch, &trace).await {
        Ok(IngestOutcome::Stored { words }) => Ok(Json(json!({
            "success": true,
            "words": words,
        }))),
        Ok(IngestOutcome::Processed { words, summary }) => Ok(Json(json!({
            "success": true,
            "words": words,
            "summary": summary,
        }))),
        Err(e) => {
            error!(
                trace_id = %trace.trace_id,
                "Failed to process provider callback: {:#}", e
            );
            if e.to_string().starts_with("No session found") {
                Err(ApiError::not_found(e.to_string()))
            } else {
                Err(ApiError::internal("Failed to process provider callback"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_deserializes_provider_payload() {
        let callback: ProviderCallback = serde_json::from_str(
            r#"{
                "event": "bot.transcription",
                "data": {
                    "bot_id": "d2933f9c",
                    "recording_id": "367a96c0",
                    "transcript": {
                        "original_transcript_id": 7,
                        "speaker": "Gerry Saporito",
                        "speaker_id": 100,
                        "words": [
                            {"text": "Hey", "start_time": 1.0, "end_time": 1.3, "confidence": 0.98},
                            {"text": "joe", "start_time": 1.4, "end_time": 1.7, "confidence": 0.95}
                        ],
                        "is_final": true,
                        "language": "en",
                        "source": "meeting_audio"
                    }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(callback.event, "bot.transcription");
        assert_eq!(callback.data.transcript.speaker_id, 100);
        assert_eq!(callback.data.transcript.words.len(), 2);
        assert_eq!(callback.data.transcript.words[1].text, "joe");
    }

    #[test]
    fn test_callback_tolerates_missing_speaker() {
        let callback: ProviderCallback = serde_json::from_str(
            r#"{
                "event": "bot.transcription",
                "data": {
                    "bot_id": "b",
                    "recording_id": "r",
                    "transcript": {"speaker": null, "speaker_id": 3, "words": []}
                }
            }"#,
        )
        .unwrap();
        assert!(callback.data.transcript.speaker.is_none());
    }
}
