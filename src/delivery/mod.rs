//! Durable webhook delivery queue.
//!
//! The `webhook_events` table is the source of truth: every enqueue writes a
//! `pending` row before the job enters the in-process channel, and `start()`
//! re-enqueues whatever a previous process left unfinished. A single worker
//! task drains the channel (concurrency 1, one attempt per second) so
//! third-party endpoints are never hammered and per-destination ordering is
//! easy to reason about. Retries use jittered exponential backoff up to the
//! attempt cap; the row's status column tracks the lifecycle throughout.

pub mod transport;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::webhook_events::{
    ResponseUpdate, WebhookEventRecord, WebhookEventRepository, WebhookEventStatus,
};
use crate::db::webhooks::WebhookRepository;
use crate::db::Database;
use crate::trace::TraceContext;

pub use transport::{HttpTransport, TransportResponse, WebhookTransport};

/// Why an attempt did not complete. Fatal failures never retry.
#[derive(Debug, Error)]
enum AttemptFailure {
    #[error("{0}")]
    Fatal(String),
    #[error("{0}")]
    Retryable(String),
}

#[derive(Debug, Clone)]
pub struct DeliveryOptions {
    /// Total attempts per webhook event (1 initial + retries).
    pub max_attempts: u32,
    /// Backoff base; the actual delay is base plus jitter, doubled per retry.
    pub base_delay: Duration,
    /// Minimum spacing between attempt starts.
    pub rate_interval: Duration,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            rate_interval: Duration::from_secs(1),
        }
    }
}

/// A queued attempt. Carries only the row id and the attempt index; the
/// worker re-reads the authoritative row, so replays act on current state.
#[derive(Debug, Clone)]
struct DeliveryJob {
    webhook_event_id: String,
    attempt: u32,
}

/// Clonable enqueue handle, injected into the trigger pipeline.
#[derive(Clone)]
pub struct DeliveryHandle {
    db: Database,
    tx: mpsc::UnboundedSender<DeliveryJob>,
}

#[derive(Debug)]
pub struct EnqueueArgs<'a> {
    pub webhook_id: &'a str,
    pub user_id: &'a str,
    pub event_type: &'a str,
    pub payload: serde_json::Value,
}

impl DeliveryHandle {
    /// Create the audit row in `pending` and hand the job to the worker.
    pub fn enqueue(
        &self,
        args: EnqueueArgs<'_>,
        trace: &TraceContext,
    ) -> Result<WebhookEventRecord> {
        let event = {
            let conn = self.db.conn();
            WebhookEventRepository::insert_pending(
                &conn,
                args.webhook_id,
                args.user_id,
                args.event_type,
                &args.payload,
            )?
        };

        info!(
            trace_id = %trace.trace_id,
            "Webhook event {} enqueued for webhook {}",
            event.id,
            args.webhook_id
        );

        self.tx
            .send(DeliveryJob {
                webhook_event_id: event.id.clone(),
                attempt: 0,
            })
            .map_err(|_| anyhow!("Delivery queue is not running"))?;

        Ok(event)
    }
}

/// The queue itself. Constructed explicitly by the process entrypoint and
/// driven through `start()`/`stop()`. Nothing global, nothing lazy.
pub struct DeliveryQueue {
    handle: DeliveryHandle,
    rx: Option<mpsc::UnboundedReceiver<DeliveryJob>>,
    transport: Arc<dyn WebhookTransport>,
    options: DeliveryOptions,
    shutdown: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl DeliveryQueue {
    pub fn new(
        db: Database,
        transport: Arc<dyn WebhookTransport>,
        options: DeliveryOptions,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            handle: DeliveryHandle { db, tx },
            rx: Some(rx),
            transport,
            options,
            shutdown: CancellationToken::new(),
            worker: None,
        }
    }

    pub fn handle(&self) -> DeliveryHandle {
        self.handle.clone()
    }

    /// Recover unfinished rows from a previous process and spawn the worker.
    pub fn start(&mut self) -> Result<()> {
        let rx = self
            .rx
            .take()
            .context("Delivery queue has already been started")?;

        let unfinished = {
            let conn = self.handle.db.conn();
            WebhookEventRepository::unfinished(&conn)?
        };
        if !unfinished.is_empty() {
            info!(
                "Recovering {} unfinished webhook deliveries",
                unfinished.len()
            );
            for event in &unfinished {
                let _ = self.handle.tx.send(DeliveryJob {
                    webhook_event_id: event.id.clone(),
                    attempt: event.retry_count.max(0) as u32,
                });
            }
        }

        let worker = WorkerContext {
            db: self.handle.db.clone(),
            transport: self.transport.clone(),
            options: self.options.clone(),
            tx: self.handle.tx.clone(),
        };
        self.worker = Some(tokio::spawn(run_worker(rx, worker, self.shutdown.clone())));

        info!("Delivery queue started");
        Ok(())
    }

    /// Stop the worker. In-flight retry timers die with their channel.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!("Delivery worker task failed: {}", e);
            }
        }
        info!("Delivery queue stopped");
    }
}

#[derive(Clone)]
struct WorkerContext {
    db: Database,
    transport: Arc<dyn WebhookTransport>,
    options: DeliveryOptions,
    tx: mpsc::UnboundedSender<DeliveryJob>,
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<DeliveryJob>,
    ctx: WorkerContext,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(ctx.options.rate_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        // Rate limit: at most one attempt start per interval
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }

        if let Err(e) = process_job(&ctx, &job).await {
            error!(
                "Delivery attempt for webhook event {} errored: {:#}",
                job.webhook_event_id, e
            );
        }
    }

    info!("Delivery worker stopped");
}

async fn process_job(ctx: &WorkerContext, job: &DeliveryJob) -> Result<()> {
    let event = {
        let conn = ctx.db.conn();
        WebhookEventRepository::get(&conn, &job.webhook_event_id)?
    };
    let Some(event) = event else {
        warn!(
            "Webhook event {} no longer exists, dropping job",
            job.webhook_event_id
        );
        return Ok(());
    };
    if event.status.is_terminal() {
        debug!(
            "Webhook event {} already {}, skipping",
            event.id,
            event.status.as_str()
        );
        return Ok(());
    }

    info!(
        "Processing webhook event {} (attempt {}/{})",
        event.id,
        job.attempt + 1,
        ctx.options.max_attempts
    );

    {
        let conn = ctx.db.conn();
        WebhookEventRepository::set_status(&conn, &event.id, WebhookEventStatus::Sending)?;
    }

    // Validation gate: these never produce an outbound request
    let destination = match resolve_destination(ctx, &event) {
        Ok(url) => url,
        Err(AttemptFailure::Fatal(reason)) => {
            error!("Webhook event {} failed permanently: {}", event.id, reason);
            let conn = ctx.db.conn();
            WebhookEventRepository::fail(&conn, &event.id, &reason)?;
            return Ok(());
        }
        Err(AttemptFailure::Retryable(reason)) => {
            // Resolution only fails fatally or on store errors, which bubble
            return Err(anyhow!(reason));
        }
    };

    let request_body = serde_json::json!({
        "webhookId": event.webhook_id,
        "webhookEventId": event.id,
        "type": event.event_type,
        "data": event.request_body,
    });
    let request_sent_at = Utc::now().to_rfc3339();
    let retry_count = job.attempt as i64;
    let last_retry_at = (job.attempt > 0).then(|| Utc::now().to_rfc3339());
    let will_retry_after = |failed: bool| failed && job.attempt + 1 < ctx.options.max_attempts;

    match ctx
        .transport
        .post(&destination, &request_body, &request_sent_at)
        .await
    {
        Err(e) => {
            let reason = format!("Failed to send webhook request: {e:#}");
            let retrying = will_retry_after(true);
            let status = if retrying {
                WebhookEventStatus::Retrying
            } else {
                WebhookEventStatus::Failed
            };
            {
                let conn = ctx.db.conn();
                WebhookEventRepository::record_transport_failure(
                    &conn,
                    &event.id,
                    status,
                    &reason,
                    &request_sent_at,
                    retry_count,
                    last_retry_at.as_deref(),
                )?;
            }
            if retrying {
                warn!("Webhook event {}: {}, will retry", event.id, reason);
                schedule_retry(ctx, job);
            } else {
                error!(
                    "Webhook event {} failed permanently after {} attempts: {}",
                    event.id,
                    job.attempt + 1,
                    reason
                );
            }
        }
        Ok(response) => {
            let response_received_at = Utc::now().to_rfc3339();
            let response_body = parse_response_body(&event.id, &response.body);
            let succeeded = (200..300).contains(&response.status);
            let retrying = will_retry_after(!succeeded);
            let status = if succeeded {
                WebhookEventStatus::Completed
            } else if retrying {
                WebhookEventStatus::Retrying
            } else {
                WebhookEventStatus::Failed
            };
            let failure_reason = (!succeeded)
                .then(|| format!("Webhook request failed with status {}", response.status));

            {
                let conn = ctx.db.conn();
                WebhookEventRepository::record_response(
                    &conn,
                    &event.id,
                    &ResponseUpdate {
                        status,
                        response_status: response.status as i64,
                        response_body,
                        failure_reason: failure_reason.clone(),
                        request_sent_at,
                        response_received_at,
                        retry_count,
                        last_retry_at,
                    },
                )?;
            }

            if succeeded {
                info!(
                    "Webhook event {} completed with status {}",
                    event.id, response.status
                );
            } else if retrying {
                warn!(
                    "Webhook event {} got status {}, will retry",
                    event.id, response.status
                );
                schedule_retry(ctx, job);
            } else {
                error!(
                    "Webhook event {} failed permanently after {} attempts with status {}",
                    event.id,
                    job.attempt + 1,
                    response.status
                );
            }
        }
    }

    Ok(())
}

/// Look up the destination and enforce the invariants that never retry:
/// the webhook must exist, belong to the recorded user, and use HTTPS.
fn resolve_destination(
    ctx: &WorkerContext,
    event: &WebhookEventRecord,
) -> std::result::Result<String, AttemptFailure> {
    let webhook = {
        let conn = ctx.db.conn();
        WebhookRepository::get(&conn, &event.webhook_id)
            .map_err(|e| AttemptFailure::Retryable(format!("{e:#}")))?
    };

    let Some(webhook) = webhook else {
        return Err(AttemptFailure::Fatal(format!(
            "Webhook with ID {} not found",
            event.webhook_id
        )));
    };

    if webhook.user_id != event.user_id {
        return Err(AttemptFailure::Fatal(format!(
            "Webhook with ID {} does not belong to user {}",
            event.webhook_id, event.user_id
        )));
    }

    match reqwest::Url::parse(&webhook.url) {
        Ok(url) if url.scheme() == "https" => Ok(webhook.url),
        Ok(_) => Err(AttemptFailure::Fatal(format!(
            "Webhook with ID {} is not using HTTPS",
            event.webhook_id
        ))),
        Err(_) => Err(AttemptFailure::Fatal(format!(
            "Webhook with ID {} has an invalid URL",
            event.webhook_id
        ))),
    }
}

/// Best-effort JSON parse; a non-JSON body is logged and stored as NULL.
fn parse_response_body(event_id: &str, body: &str) -> Option<serde_json::Value> {
    if body.is_empty() {
        return None;
    }
    match serde_json::from_str(body) {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(
                "Webhook event {} response body is not JSON ({} bytes)",
                event_id,
                body.len()
            );
            None
        }
    }
}

fn schedule_retry(ctx: &WorkerContext, job: &DeliveryJob) {
    let next = DeliveryJob {
        webhook_event_id: job.webhook_event_id.clone(),
        attempt: job.attempt + 1,
    };
    let delay = backoff_delay(ctx.options.base_delay, next.attempt);
    let tx = ctx.tx.clone();
    debug!(
        "Scheduling retry {} for webhook event {} in {:?}",
        next.attempt, next.webhook_event_id, delay
    );
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if tx.send(next).is_err() {
            debug!("Delivery queue stopped before a scheduled retry ran");
        }
    });
}

/// Jittered exponential backoff: base plus up-to-base jitter, doubled per
/// retry. `attempt` is the 1-based retry number.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let jitter = if base_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=base_ms)
    };
    let exponent = attempt.saturating_sub(1).min(16);
    Duration::from_millis((base_ms + jitter) << exponent)
}
