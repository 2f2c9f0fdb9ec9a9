//! Transcript ingestion and trigger-window detection.
//!
//! Words are stored unconditionally and never rejected; the wake-word scan
//! only decides whether downstream matching runs. Cross-speaker wake words
//! are not honored: the scan and the assembled window cover the speaker's own
//! words only.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::sessions::SessionRepository;
use crate::db::transcripts::{SpokenWord, TranscriptRepository};
use crate::db::Database;
use crate::notifier::MeetingNotifier;
use crate::trace::TraceContext;
use crate::trigger::{ProcessSummary, TriggerPipeline, WindowContext};

/// One provider callback's worth of words for a single speaker.
#[derive(Debug, Clone)]
pub struct TranscriptBatch {
    pub provider_bot_id: String,
    pub recording_id: String,
    pub speaker_id: String,
    pub speaker_name: Option<String>,
    pub words: Vec<SpokenWord>,
}

/// What happened to a batch.
#[derive(Debug)]
pub enum IngestOutcome {
    /// Words stored; no wake word in the recent window. The common case.
    Stored { words: usize },
    /// Words stored and a trigger window was processed.
    Processed {
        words: usize,
        summary: ProcessSummary,
    },
}

pub struct TranscriptIngestor {
    db: Database,
    pipeline: Arc<TriggerPipeline>,
    notifier: Option<Arc<dyn MeetingNotifier>>,
    lookback_seconds: f64,
}

impl TranscriptIngestor {
    pub fn new(
        db: Database,
        pipeline: Arc<TriggerPipeline>,
        notifier: Option<Arc<dyn MeetingNotifier>>,
        lookback_seconds: f64,
    ) -> Self {
        Self {
            db,
            pipeline,
            notifier,
            lookback_seconds,
        }
    }

    /// Store a word batch and, when the recent same-speaker window contains
    /// the session's wake word, hand the full window to the trigger pipeline.
    /// Storage errors propagate so the provider can redeliver; a matching
    /// failure propagates too, but never unwinds already-stored words.
    pub async fn ingest(
        &self,
        batch: TranscriptBatch,
        trace: &TraceContext,
    ) -> Result<IngestOutcome> {
        let session = {
            let conn = self.db.conn();
            SessionRepository::get_by_provider_bot_id(&conn, &batch.provider_bot_id)?
        }
        .with_context(|| {
            format!("No session found for provider bot {}", batch.provider_bot_id)
        })?;

        let stored = {
            let conn = self.db.conn();
            TranscriptRepository::insert_batch(
                &conn,
                &session.id,
                &batch.recording_id,
                &batch.speaker_id,
                batch.speaker_name.as_deref(),
                &batch.words,
            )?
        };

        let Some(first_word) = batch.words.first() else {
            return Ok(IngestOutcome::Stored { words: 0 });
        };

        // Wake-word scan over the trailing window of this speaker's words.
        // A scan failure degrades to "no window": the stored batch is safe
        // and the next batch will scan again.
        let scan_from = (first_word.start_time - self.lookback_seconds).max(0.0);
        let recent = {
            let conn = self.db.conn();
            TranscriptRepository::for_speaker(
                &conn,
                &session.id,
                &batch.recording_id,
                &batch.speaker_id,
                Some(scan_from),
            )
        };
        let recent = match recent {
            Ok(words) => words,
            Err(e) => {
                warn!(
                    trace_id = %trace.trace_id,
                    "Wake-word scan failed, treating batch as plain conversation: {:#}", e
                );
                return Ok(IngestOutcome::Stored { words: stored });
            }
        };
        let wake_word = session.name.to_lowercase();
        let wake_heard = recent.iter().any(|word| word.word.contains(&wake_word));

        if !wake_heard {
            debug!(
                trace_id = %trace.trace_id,
                "No \"{}\" heard in the last {}s for recording {}",
                session.name, self.lookback_seconds, batch.recording_id
            );
            return Ok(IngestOutcome::Stored { words: stored });
        }

        info!(
            trace_id = %trace.trace_id,
            "Wake word \"{}\" detected for recording {}, assembling trigger window",
            session.name, batch.recording_id
        );

        // Best-effort acknowledgement back into the meeting
        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.notify_processing(&batch.provider_bot_id).await {
                warn!(
                    trace_id = %trace.trace_id,
                    "Failed to acknowledge in meeting: {:#}", e
                );
            }
        }

        // The matcher sees everything this speaker said in the recording,
        // not just the scan window
        let window = {
            let conn = self.db.conn();
            TranscriptRepository::for_speaker(
                &conn,
                &session.id,
                &batch.recording_id,
                &batch.speaker_id,
                None,
            )?
        };

        let ctx = WindowContext {
            session_id: session.id.clone(),
            recording_id: batch.recording_id.clone(),
            speaker_id: batch.speaker_id.clone(),
            speaker_name: batch.speaker_name.clone(),
            provider_bot_id: batch.provider_bot_id.clone(),
            wake_word: session.name.clone(),
            user_id: session.user_id.clone(),
        };

        let summary = self.pipeline.process_window(&window, &ctx, trace).await?;

        Ok(IngestOutcome::Processed {
            words: stored,
            summary,
        })
    }
}
