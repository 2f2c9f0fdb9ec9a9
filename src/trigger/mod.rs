//! Trigger match orchestration.
//!
//! Takes a detected trigger window, asks the matcher to resolve it into
//! candidate events, and turns each genuinely new candidate into exactly one
//! persisted trigger event plus one webhook delivery. Overlapping windows
//! re-analyzing the same speech collapse onto one event via the rounded
//! bucket id, so reprocessing never duplicates a delivery.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::db::registrations::{RegistrationRecord, RegistrationRepository};
use crate::db::transcripts::TranscriptWord;
use crate::db::trigger_events::{NewTriggerEvent, TriggerEventRecord, TriggerEventRepository};
use crate::db::Database;
use crate::delivery::{DeliveryHandle, EnqueueArgs};
use crate::matcher::{MatchRequest, MatchedTriggerEvent, TriggerEventTemplate, TriggerMatcher};
use crate::trace::TraceContext;

/// Webhook event type emitted for every new trigger event.
pub const TRIGGER_EVENT_CREATED: &str = "trigger_event.created";

/// Bucket width for collapsing jittered wake-word timestamps.
const BUCKET_SECONDS: f64 = 10.0;

/// Round a wake-word offset up to its 10-second bucket. Repeated analyses of
/// overlapping windows report slightly different offsets for the same spoken
/// command; the bucket id absorbs that jitter.
pub fn trigger_event_id(offset_seconds: f64) -> String {
    let bucket = (offset_seconds.max(0.0) / BUCKET_SECONDS).ceil() * BUCKET_SECONDS;
    format!("{}", bucket as i64)
}

/// Identity of the window being processed, resolved by ingestion.
#[derive(Debug, Clone)]
pub struct WindowContext {
    pub session_id: String,
    pub recording_id: String,
    pub speaker_id: String,
    pub speaker_name: Option<String>,
    pub provider_bot_id: String,
    pub wake_word: String,
    pub user_id: String,
}

/// What one window produced, for logging and callback responses.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ProcessSummary {
    pub matched: usize,
    pub created: usize,
    pub deduplicated: usize,
    pub enqueued: usize,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Matcher invocations before the window is given up on.
    pub matcher_attempts: u32,
    pub matcher_retry_pause: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            matcher_attempts: 3,
            matcher_retry_pause: Duration::from_secs(1),
        }
    }
}

pub struct TriggerPipeline {
    db: Database,
    matcher: Arc<dyn TriggerMatcher>,
    delivery: DeliveryHandle,
    options: PipelineOptions,
}

impl TriggerPipeline {
    pub fn new(
        db: Database,
        matcher: Arc<dyn TriggerMatcher>,
        delivery: DeliveryHandle,
        options: PipelineOptions,
    ) -> Self {
        Self {
            db,
            matcher,
            delivery,
            options,
        }
    }

    /// Process one trigger window end to end. Matcher exhaustion is returned
    /// to the caller (a missed event has direct business impact and must not
    /// be swallowed) but everything stored up to that point stays stored.
    pub async fn process_window(
        &self,
        window: &[TranscriptWord],
        ctx: &WindowContext,
        trace: &TraceContext,
    ) -> Result<ProcessSummary> {
        let registrations = {
            let conn = self.db.conn();
            RegistrationRepository::list_for_session(&conn, &ctx.session_id)?
        };
        if registrations.is_empty() {
            debug!(
                trace_id = %trace.trace_id,
                "Session {} has no registrations, skipping match",
                ctx.session_id
            );
            return Ok(ProcessSummary::default());
        }

        let templates: Vec<TriggerEventTemplate> = registrations
            .iter()
            .map(|reg| self.template_for(reg, ctx))
            .collect();

        let matched = self.invoke_matcher(window, &templates, ctx, trace).await?;

        let mut summary = ProcessSummary {
            matched: matched.len(),
            ..Default::default()
        };

        for event in &matched {
            match self.accept_event(event, &registrations, &templates, ctx, trace) {
                Ok(Acceptance::Created) => {
                    summary.created += 1;
                    summary.enqueued += 1;
                }
                Ok(Acceptance::Duplicate) => summary.deduplicated += 1,
                Ok(Acceptance::Skipped) => {}
                Err(e) => {
                    // One bad candidate must not sink the rest of the window
                    error!(
                        trace_id = %trace.trace_id,
                        "Failed to accept matched event for action {:?}: {:#}",
                        event.action_name, e
                    );
                }
            }
        }

        info!(
            trace_id = %trace.trace_id,
            "Window processed: {} matched, {} created, {} deduplicated",
            summary.matched, summary.created, summary.deduplicated
        );

        Ok(summary)
    }

    fn template_for(
        &self,
        registration: &RegistrationRecord,
        ctx: &WindowContext,
    ) -> TriggerEventTemplate {
        TriggerEventTemplate {
            action_name: registration.action_name.clone(),
            registration_id: registration.id.clone(),
            session_id: ctx.session_id.clone(),
            recording_id: ctx.recording_id.clone(),
            speaker_id: ctx.speaker_id.clone(),
            speaker_name: ctx.speaker_name.clone(),
            provider_bot_id: ctx.provider_bot_id.clone(),
            missing_data: registration.fields.clone(),
        }
    }

    /// Call the matcher with bounded retry. A schema-invalid response counts
    /// as a failed attempt exactly like a transport error.
    async fn invoke_matcher(
        &self,
        window: &[TranscriptWord],
        templates: &[TriggerEventTemplate],
        ctx: &WindowContext,
        trace: &TraceContext,
    ) -> Result<Vec<MatchedTriggerEvent>> {
        let request = MatchRequest {
            wake_word: &ctx.wake_word,
            words: window,
            templates,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.matcher.match_triggers(&request).await {
                Ok(events) => match events.iter().try_for_each(MatchedTriggerEvent::validate) {
                    Ok(()) => Ok(events),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };

            match result {
                Ok(events) => return Ok(events),
                Err(e) if attempt < self.options.matcher_attempts => {
                    warn!(
                        trace_id = %trace.trace_id,
                        "Matcher attempt {}/{} failed: {:#}",
                        attempt, self.options.matcher_attempts, e
                    );
                    tokio::time::sleep(self.options.matcher_retry_pause).await;
                }
                Err(e) => {
                    error!(
                        trace_id = %trace.trace_id,
                        "Matcher failed after {} attempts for session {}",
                        attempt, ctx.session_id
                    );
                    return Err(e).with_context(|| {
                        format!("Trigger matching failed after {attempt} attempts")
                    });
                }
            }
        }
    }

    fn accept_event(
        &self,
        event: &MatchedTriggerEvent,
        registrations: &[RegistrationRecord],
        templates: &[TriggerEventTemplate],
        ctx: &WindowContext,
        trace: &TraceContext,
    ) -> Result<Acceptance> {
        let Some(registration) = registrations
            .iter()
            .find(|reg| reg.id == event.registration_id)
        else {
            warn!(
                trace_id = %trace.trace_id,
                "Matcher referenced unknown registration {} in session {}, dropping candidate",
                event.registration_id, ctx.session_id
            );
            return Ok(Acceptance::Skipped);
        };
        let template = templates
            .iter()
            .find(|tpl| tpl.registration_id == registration.id)
            .context("Template missing for registration")?;

        let bucket = trigger_event_id(event.wake_word_offset);
        let data = merge_event_data(&template.missing_data, &event.missing_data);

        let outcome = {
            let conn = self.db.conn();
            TriggerEventRepository::create_if_absent(
                &conn,
                &NewTriggerEvent {
                    session_id: ctx.session_id.clone(),
                    recording_id: ctx.recording_id.clone(),
                    trigger_event_id: bucket.clone(),
                    action_name: registration.action_name.clone(),
                    data,
                    registration_id: registration.id.clone(),
                    speaker_id: ctx.speaker_id.clone(),
                    speaker_name: ctx.speaker_name.clone(),
                    provider_bot_id: ctx.provider_bot_id.clone(),
                },
            )?
        };

        if !outcome.created {
            debug!(
                trace_id = %trace.trace_id,
                "Trigger event bucket {} already recorded for recording {}, skipping delivery",
                bucket, ctx.recording_id
            );
            return Ok(Acceptance::Duplicate);
        }

        self.delivery.enqueue(
            EnqueueArgs {
                webhook_id: &registration.webhook_id,
                user_id: &ctx.user_id,
                event_type: TRIGGER_EVENT_CREATED,
                payload: delivery_payload(&outcome.event, event),
            },
            &trace.child("delivery"),
        )?;

        Ok(Acceptance::Created)
    }
}

enum Acceptance {
    Created,
    Duplicate,
    Skipped,
}

/// Configured registration values merged with matcher-extracted ones;
/// extracted values win on collision.
fn merge_event_data(
    configured: &BTreeMap<String, String>,
    extracted: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = configured.clone();
    for (key, value) in extracted {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// The `data` object sent to the destination webhook.
fn delivery_payload(
    record: &TriggerEventRecord,
    matched: &MatchedTriggerEvent,
) -> serde_json::Value {
    serde_json::json!({
        "triggerEventId": record.id,
        "actionName": record.action_name,
        "data": record.data,
        "sessionId": record.session_id,
        "recordingId": record.recording_id,
        "speakerId": record.speaker_id,
        "speakerName": record.speaker_name,
        "matchedText": matched.matched_text,
        "confidence": matched.confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sessions::SessionRepository;
    use crate::db::webhook_events::{WebhookEventRepository, WebhookEventStatus};
    use crate::db::webhooks::WebhookRepository;
    use crate::delivery::{DeliveryOptions, DeliveryQueue, TransportResponse, WebhookTransport};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_trigger_event_id_boundaries() {
        assert_eq!(trigger_event_id(0.0), "0");
        assert_eq!(trigger_event_id(1.0), "10");
        assert_eq!(trigger_event_id(4.0), "10");
        assert_eq!(trigger_event_id(9.0), "10");
        assert_eq!(trigger_event_id(10.0), "10");
        assert_eq!(trigger_event_id(11.0), "20");
        assert_eq!(trigger_event_id(23.0), "30");
        assert_eq!(trigger_event_id(30.0), "30");
    }

    #[test]
    fn test_trigger_event_id_clamps_negative() {
        assert_eq!(trigger_event_id(-3.0), "0");
    }

    #[test]
    fn test_merge_extracted_wins() {
        let mut configured = BTreeMap::new();
        configured.insert("channelName".to_string(), "{{command}}".to_string());
        configured.insert("workspace".to_string(), "acme".to_string());

        let mut extracted = BTreeMap::new();
        extracted.insert("channelName".to_string(), "dogs".to_string());

        let merged = merge_event_data(&configured, &extracted);
        assert_eq!(merged.get("channelName").unwrap(), "dogs");
        assert_eq!(merged.get("workspace").unwrap(), "acme");
    }

    // --- pipeline tests with a scripted matcher -------------------------

    struct ScriptedMatcher {
        /// One entry per invocation; `None` simulates a failed call.
        script: Mutex<Vec<Option<Vec<MatchedTriggerEvent>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedMatcher {
        fn new(script: Vec<Option<Vec<MatchedTriggerEvent>>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TriggerMatcher for ScriptedMatcher {
        async fn match_triggers(
            &self,
            _request: &MatchRequest<'_>,
        ) -> Result<Vec<MatchedTriggerEvent>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Ok(Vec::new());
            }
            match script.remove(0) {
                Some(events) => Ok(events),
                None => anyhow::bail!("matcher unavailable"),
            }
        }
    }

    struct NullTransport;

    #[async_trait]
    impl WebhookTransport for NullTransport {
        async fn post(
            &self,
            _url: &str,
            _body: &serde_json::Value,
            _sent_at: &str,
        ) -> Result<TransportResponse> {
            Ok(TransportResponse {
                status: 200,
                body: String::new(),
            })
        }
    }

    struct Fixture {
        db: Database,
        ctx: WindowContext,
        registration_id: String,
        queue: DeliveryQueue,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let (session, registration) = {
            let conn = db.conn();
            let session = SessionRepository::insert(&conn, "joe", "provider-1", "user_1").unwrap();
            let webhook =
                WebhookRepository::insert(&conn, "user_1", "https://example.com/hook").unwrap();
            let mut fields = BTreeMap::new();
            fields.insert("channelName".to_string(), "{{command}}".to_string());
            let registration = RegistrationRepository::insert(
                &conn,
                &session.id,
                "Ping slack channel",
                &webhook.id,
                &fields,
            )
            .unwrap();
            (session, registration)
        };

        let ctx = WindowContext {
            session_id: session.id,
            recording_id: "rec-1".to_string(),
            speaker_id: "100".to_string(),
            speaker_name: Some("Gerry".to_string()),
            provider_bot_id: "provider-1".to_string(),
            wake_word: "joe".to_string(),
            user_id: "user_1".to_string(),
        };

        let queue = DeliveryQueue::new(
            db.clone(),
            Arc::new(NullTransport),
            DeliveryOptions::default(),
        );

        Fixture {
            db,
            ctx,
            registration_id: registration.id,
            queue,
        }
    }

    fn matched_event(fixture: &Fixture, offset: f64, channel: &str) -> MatchedTriggerEvent {
        let mut missing_data = BTreeMap::new();
        missing_data.insert("channelName".to_string(), channel.to_string());
        MatchedTriggerEvent {
            action_name: "Ping slack channel".to_string(),
            registration_id: fixture.registration_id.clone(),
            session_id: fixture.ctx.session_id.clone(),
            recording_id: fixture.ctx.recording_id.clone(),
            speaker_id: fixture.ctx.speaker_id.clone(),
            speaker_name: fixture.ctx.speaker_name.clone(),
            provider_bot_id: fixture.ctx.provider_bot_id.clone(),
            missing_data,
            confidence: 0.95,
            matched_text: format!("ping the channel called {channel}"),
            wake_word_offset: offset,
        }
    }

    fn fast_pipeline(
        fixture: &Fixture,
        matcher: Arc<dyn TriggerMatcher>,
    ) -> TriggerPipeline {
        TriggerPipeline::new(
            fixture.db.clone(),
            matcher,
            fixture.queue.handle(),
            PipelineOptions {
                matcher_attempts: 3,
                matcher_retry_pause: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn test_new_event_is_stored_and_enqueued() {
        let fixture = fixture();
        let matcher =
            ScriptedMatcher::new(vec![Some(vec![matched_event(&fixture, 12.0, "dogs")])]);
        let pipeline = fast_pipeline(&fixture, matcher.clone());

        let summary = pipeline
            .process_window(&[], &fixture.ctx, &TraceContext::new("test"))
            .await
            .unwrap();

        assert_eq!(summary.matched, 1);
        assert_eq!(summary.created, 1);
        assert_eq!(summary.enqueued, 1);

        let conn = fixture.db.conn();
        let stored =
            TriggerEventRepository::get(&conn, &fixture.ctx.session_id, "rec-1", "20")
                .unwrap()
                .unwrap();
        assert_eq!(stored.data.get("channelName").unwrap(), "dogs");

        let pending = WebhookEventRepository::unfinished(&conn).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, WebhookEventStatus::Pending);
        assert_eq!(
            pending[0].request_body.get("actionName").unwrap(),
            "Ping slack channel"
        );
    }

    #[tokio::test]
    async fn test_same_bucket_deduplicates_and_skips_delivery() {
        let fixture = fixture();
        // Overlapping windows report 21s and 24s, both rounding to bucket "30"
        let matcher = ScriptedMatcher::new(vec![
            Some(vec![matched_event(&fixture, 21.0, "dogs")]),
            Some(vec![matched_event(&fixture, 24.0, "dogs")]),
        ]);
        let pipeline = fast_pipeline(&fixture, matcher.clone());
        let trace = TraceContext::new("test");

        let first = pipeline
            .process_window(&[], &fixture.ctx, &trace)
            .await
            .unwrap();
        let second = pipeline
            .process_window(&[], &fixture.ctx, &trace)
            .await
            .unwrap();

        assert_eq!(first.created, 1);
        assert_eq!(second.created, 0);
        assert_eq!(second.deduplicated, 1);

        let conn = fixture.db.conn();
        let pending = WebhookEventRepository::unfinished(&conn).unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_matcher_retries_then_succeeds() {
        let fixture = fixture();
        let matcher = ScriptedMatcher::new(vec![
            None,
            None,
            Some(vec![matched_event(&fixture, 5.0, "dogs")]),
        ]);
        let pipeline = fast_pipeline(&fixture, matcher.clone());

        let summary = pipeline
            .process_window(&[], &fixture.ctx, &TraceContext::new("test"))
            .await
            .unwrap();

        assert_eq!(matcher.calls(), 3);
        assert_eq!(summary.created, 1);
    }

    #[tokio::test]
    async fn test_matcher_exhaustion_surfaces_error() {
        let fixture = fixture();
        let matcher = ScriptedMatcher::new(vec![None, None, None]);
        let pipeline = fast_pipeline(&fixture, matcher.clone());

        let result = pipeline
            .process_window(&[], &fixture.ctx, &TraceContext::new("test"))
            .await;

        assert!(result.is_err());
        assert_eq!(matcher.calls(), 3);
    }

    #[tokio::test]
    async fn test_invalid_candidate_counts_as_failed_attempt() {
        let fixture = fixture();
        let mut invalid = matched_event(&fixture, 5.0, "dogs");
        invalid.confidence = 2.0;
        let matcher = ScriptedMatcher::new(vec![
            Some(vec![invalid]),
            Some(vec![matched_event(&fixture, 5.0, "dogs")]),
        ]);
        let pipeline = fast_pipeline(&fixture, matcher.clone());

        let summary = pipeline
            .process_window(&[], &fixture.ctx, &TraceContext::new("test"))
            .await
            .unwrap();

        assert_eq!(matcher.calls(), 2);
        assert_eq!(summary.created, 1);
    }

    #[tokio::test]
    async fn test_unknown_registration_is_dropped() {
        let fixture = fixture();
        let mut stray = matched_event(&fixture, 5.0, "dogs");
        stray.registration_id = "reg_unknown".to_string();
        let matcher = ScriptedMatcher::new(vec![Some(vec![stray])]);
        let pipeline = fast_pipeline(&fixture, matcher.clone());

        let summary = pipeline
            .process_window(&[], &fixture.ctx, &TraceContext::new("test"))
            .await
            .unwrap();

        assert_eq!(summary.matched, 1);
        assert_eq!(summary.created, 0);

        let conn = fixture.db.conn();
        assert!(WebhookEventRepository::unfinished(&conn).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_registrations_skips_matcher() {
        let db = Database::open_in_memory().unwrap();
        let session = {
            let conn = db.conn();
            SessionRepository::insert(&conn, "joe", "provider-1", "user_1").unwrap()
        };
        let ctx = WindowContext {
            session_id: session.id,
            recording_id: "rec-1".to_string(),
            speaker_id: "100".to_string(),
            speaker_name: None,
            provider_bot_id: "provider-1".to_string(),
            wake_word: "joe".to_string(),
            user_id: "user_1".to_string(),
        };
        let matcher = ScriptedMatcher::new(vec![]);
        let queue = DeliveryQueue::new(
            db.clone(),
            Arc::new(NullTransport),
            DeliveryOptions::default(),
        );
        let pipeline = TriggerPipeline::new(
            db,
            matcher.clone(),
            queue.handle(),
            PipelineOptions::default(),
        );

        let summary = pipeline
            .process_window(&[], &ctx, &TraceContext::new("test"))
            .await
            .unwrap();

        assert_eq!(matcher.calls(), 0);
        assert_eq!(summary.matched, 0);
    }
}
