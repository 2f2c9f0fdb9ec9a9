//! HTTP server for hark.
//!
//! Provides endpoints for:
//! - The meeting-bot provider's transcript push callback
//! - Webhook delivery audit (status, failure reasons, retry counts)

pub mod error;
pub mod routes;

use crate::config::Config;
use crate::db::Database;
use crate::ingest::TranscriptIngestor;
use anyhow::Result;
use axum::{response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceBuilder;
use tracing::info;

pub use routes::provider::ProviderState;

pub struct ApiServer {
    port: u16,
    ingestor: Arc<TranscriptIngestor>,
    db: Database,
}

impl ApiServer {
    pub fn new(ingestor: Arc<TranscriptIngestor>, db: Database, config: &Config) -> Self {
        Self {
            port: config.server.port,
            ingestor,
            db,
        }
    }

    pub async fn start(self) -> Result<()> {
        let app = Router::new()
            // Root and version endpoints
            .route("/", get(status))
            .route("/version", get(version))
            // Provider transcript callback
            .merge(routes::provider::router(ProviderState {
                ingestor: self.ingestor,
            }))
            // Delivery audit
            .merge(routes::events::router(self.db))
            .layer(ServiceBuilder::new());

        let listener = tokio::net::TcpListener::bind(&format!("127.0.0.1:{}", self.port)).await?;

        info!("API server listening on http://127.0.0.1:{}", self.port);
        info!("Endpoints:");
        info!("  GET  /                   - Service info");
        info!("  GET  /version            - Version info");
        info!("  POST /callback/provider  - Provider transcript callback");
        info!("  GET  /events             - Recent webhook deliveries");
        info!("  GET  /events/:id         - Single webhook delivery");

        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn status() -> Json<Value> {
    Json(json!({
        "service": "hark",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

async fn version() -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "name": "hark"
    }))
}
