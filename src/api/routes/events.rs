//! Webhook delivery audit endpoints.
//!
//! Owners have no synchronous failure signal at enqueue time; the persisted
//! event state exposed here is how a failed delivery gets noticed.

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::error::{ApiError, ApiResult};
use crate::db::webhook_events::WebhookEventRepository;
use crate::db::Database;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

pub fn router(db: Database) -> Router {
    Router::new()
        .route("/events", get(list_events))
        .route("/events/:id", get(get_event))
        .with_state(db)
}

async fn list_events(
    State(db): State<Database>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query.limit.unwrap_or(50).min(500);
    let events = {
        let conn = db.conn();
        WebhookEventRepository::list_recent(&conn, limit)?
    };
    Ok(Json(json!({
        "count": events.len(),
        "events": events,
    })))
}

async fn get_event(
    State(db): State<Database>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let event = {
        let conn = db.conn();
        WebhookEventRepository::get(&conn, &id)?
    };
    match event {
        Some(event) => Ok(Json(json!({ "event": event }))),
        None => Err(ApiError::not_found(format!(
            "Webhook event {} not found",
            id
        ))),
    }
}
