//! Webhook event audit rows.
//!
//! One row per delivery lifecycle, created `pending` before the job ever
//! enters the queue so a crash between enqueue and first attempt is still
//! observable. Rows are only mutated by the delivery worker and never
//! deleted; the status/failure columns are the sole failure signal exposed
//! to webhook owners.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Delivery lifecycle: pending → sending → {completed | failed}, where a
/// retryable failure re-enters via retrying → sending until attempts run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEventStatus {
    Pending,
    Sending,
    Retrying,
    Completed,
    Failed,
}

impl WebhookEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "sending" => Ok(Self::Sending),
            "retrying" => Ok(Self::Retrying),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => anyhow::bail!("Invalid webhook event status: {}", s),
        }
    }

    /// True once no further attempts will happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookEventRecord {
    pub id: String,
    pub webhook_id: String,
    pub user_id: String,
    pub event_type: String,
    pub request_body: serde_json::Value,
    pub response_status: Option<i64>,
    pub response_body: Option<serde_json::Value>,
    pub request_sent_at: Option<String>,
    pub response_received_at: Option<String>,
    pub retry_count: i64,
    pub last_retry_at: Option<String>,
    pub failure_reason: Option<String>,
    pub status: WebhookEventStatus,
    pub created_at: String,
}

/// Attempt outcome written back by the worker after a response arrived.
#[derive(Debug)]
pub struct ResponseUpdate {
    pub status: WebhookEventStatus,
    pub response_status: i64,
    pub response_body: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub request_sent_at: String,
    pub response_received_at: String,
    pub retry_count: i64,
    pub last_retry_at: Option<String>,
}

const COLUMNS: &str = "id, webhook_id, user_id, event_type, request_body, response_status, \
                       response_body, request_sent_at, response_received_at, retry_count, \
                       last_retry_at, failure_reason, status, created_at";

pub struct WebhookEventRepository;

impl WebhookEventRepository {
    /// Create the audit row in `pending` status, before the job is queued.
    pub fn insert_pending(
        conn: &Connection,
        webhook_id: &str,
        user_id: &str,
        event_type: &str,
        request_body: &serde_json::Value,
    ) -> Result<WebhookEventRecord> {
        let id = crate::db::new_id("whevt");
        let body_json = serde_json::to_string(request_body)
            .context("Failed to serialize webhook event body")?;
        conn.query_row(
            &format!(
                "INSERT INTO webhook_events (id, webhook_id, user_id, event_type, \
                 request_body, status) VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 RETURNING {COLUMNS}"
            ),
            params![
                id,
                webhook_id,
                user_id,
                event_type,
                body_json,
                WebhookEventStatus::Pending.as_str(),
            ],
            Self::from_row,
        )?
        .context("Failed to insert webhook event")
    }

    pub fn get(conn: &Connection, id: &str) -> Result<Option<WebhookEventRecord>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM webhook_events \
                     WHERE id = ?1 AND deleted_at IS NULL"
                ),
                params![id],
                Self::from_row,
            )
            .optional()
            .context("Failed to query webhook event")?;
        row.transpose()
    }

    pub fn set_status(conn: &Connection, id: &str, status: WebhookEventStatus) -> Result<()> {
        conn.execute(
            "UPDATE webhook_events SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )
        .context("Failed to update webhook event status")?;
        Ok(())
    }

    /// Terminal failure without a response: missing webhook, owner mismatch,
    /// insecure destination. No attempt counters are touched.
    pub fn fail(conn: &Connection, id: &str, failure_reason: &str) -> Result<()> {
        conn.execute(
            "UPDATE webhook_events SET status = ?1, failure_reason = ?2 WHERE id = ?3",
            params![WebhookEventStatus::Failed.as_str(), failure_reason, id],
        )
        .context("Failed to mark webhook event failed")?;
        Ok(())
    }

    /// Transport-level failure: the request never produced a response.
    pub fn record_transport_failure(
        conn: &Connection,
        id: &str,
        status: WebhookEventStatus,
        failure_reason: &str,
        request_sent_at: &str,
        retry_count: i64,
        last_retry_at: Option<&str>,
    ) -> Result<()> {
        conn.execute(
            "UPDATE webhook_events SET status = ?1, failure_reason = ?2, \
             request_sent_at = ?3, retry_count = ?4, last_retry_at = ?5 WHERE id = ?6",
            params![
                status.as_str(),
                failure_reason,
                request_sent_at,
                retry_count,
                last_retry_at,
                id
            ],
        )
        .context("Failed to record webhook transport failure")?;
        Ok(())
    }

    /// Write a full attempt outcome and return the authoritative row state.
    pub fn record_response(
        conn: &Connection,
        id: &str,
        update: &ResponseUpdate,
    ) -> Result<WebhookEventRecord> {
        let response_body = update
            .response_body
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize webhook response body")?;
        conn.query_row(
            &format!(
                "UPDATE webhook_events SET status = ?1, response_status = ?2, \
                 response_body = ?3, failure_reason = ?4, request_sent_at = ?5, \
                 response_received_at = ?6, retry_count = ?7, last_retry_at = ?8 \
                 WHERE id = ?9 RETURNING {COLUMNS}"
            ),
            params![
                update.status.as_str(),
                update.response_status,
                response_body,
                update.failure_reason,
                update.request_sent_at,
                update.response_received_at,
                update.retry_count,
                update.last_retry_at,
                id
            ],
            Self::from_row,
        )?
        .context("Failed to record webhook response")
    }

    /// Rows a previous process left unfinished, oldest first. Used for
    /// crash recovery at queue start.
    pub fn unfinished(conn: &Connection) -> Result<Vec<WebhookEventRecord>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM webhook_events \
                 WHERE status IN ('pending', 'sending', 'retrying') AND deleted_at IS NULL \
                 ORDER BY created_at ASC, id ASC"
            ))
            .context("Failed to prepare unfinished webhook events query")?;

        let rows = stmt
            .query_map([], Self::from_row)
            .context("Failed to query unfinished webhook events")?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row??);
        }
        Ok(events)
    }

    /// Latest rows for the audit surface, newest first.
    pub fn list_recent(conn: &Connection, limit: usize) -> Result<Vec<WebhookEventRecord>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM webhook_events WHERE deleted_at IS NULL \
                 ORDER BY created_at DESC, id DESC LIMIT ?1"
            ))
            .context("Failed to prepare recent webhook events query")?;

        let rows = stmt
            .query_map(params![limit as i64], Self::from_row)
            .context("Failed to query recent webhook events")?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row??);
        }
        Ok(events)
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<WebhookEventRecord>> {
        let request_body_json: String = row.get(4)?;
        let response_body_json: Option<String> = row.get(6)?;
        let status_str: String = row.get(12)?;

        let id: String = row.get(0)?;
        let webhook_id: String = row.get(1)?;
        let user_id: String = row.get(2)?;
        let event_type: String = row.get(3)?;
        let response_status: Option<i64> = row.get(5)?;
        let request_sent_at: Option<String> = row.get(7)?;
        let response_received_at: Option<String> = row.get(8)?;
        let retry_count: i64 = row.get(9)?;
        let last_retry_at: Option<String> = row.get(10)?;
        let failure_reason: Option<String> = row.get(11)?;
        let created_at: String = row.get(13)?;

        Ok(Self::build(BuildArgs {
            id,
            webhook_id,
            user_id,
            event_type,
            request_body_json,
            response_status,
            response_body_json,
            request_sent_at,
            response_received_at,
            retry_count,
            last_retry_at,
            failure_reason,
            status_str,
            created_at,
        }))
    }

    fn build(args: BuildArgs) -> Result<WebhookEventRecord> {
        let request_body: serde_json::Value = serde_json::from_str(&args.request_body_json)
            .context("Failed to parse webhook event request body")?;
        let response_body = args
            .response_body_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse webhook event response body")?;
        let status = WebhookEventStatus::from_str(&args.status_str)?;

        Ok(WebhookEventRecord {
            id: args.id,
            webhook_id: args.webhook_id,
            user_id: args.user_id,
            event_type: args.event_type,
            request_body,
            response_status: args.response_status,
            response_body,
            request_sent_at: args.request_sent_at,
            response_received_at: args.response_received_at,
            retry_count: args.retry_count,
            last_retry_at: args.last_retry_at,
            failure_reason: args.failure_reason,
            status,
            created_at: args.created_at,
        })
    }
}

struct BuildArgs {
    id: String,
    webhook_id: String,
    user_id: String,
    event_type: String,
    request_body_json: String,
    response_status: Option<i64>,
    response_body_json: Option<String>,
    request_sent_at: Option<String>,
    response_received_at: Option<String>,
    retry_count: i64,
    last_retry_at: Option<String>,
    failure_reason: Option<String>,
    status_str: String,
    created_at: String,
}
