use crate::api::ApiServer;
use crate::config::Config;
use crate::db::Database;
use crate::delivery::{DeliveryOptions, DeliveryQueue, HttpTransport};
use crate::ingest::TranscriptIngestor;
use crate::matcher::{OpenAiMatcher, TriggerMatcher};
use crate::notifier::{MeetingNotifier, ProviderNotifier};
use crate::trigger::{PipelineOptions, TriggerPipeline};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub async fn run_service() -> Result<()> {
    info!("Starting hark service");

    let config = Config::load()?;
    let db = Database::open()?;

    // Delivery queue owns the only worker; everything else enqueues through
    // its handle
    let transport = Arc::new(HttpTransport::new(Duration::from_secs(
        config.delivery.request_timeout_seconds,
    ))?);
    let mut queue = DeliveryQueue::new(
        db.clone(),
        transport,
        DeliveryOptions {
            max_attempts: config.delivery.max_attempts,
            base_delay: Duration::from_millis(config.delivery.base_delay_ms),
            ..DeliveryOptions::default()
        },
    );
    queue.start()?;

    let matcher: Arc<dyn TriggerMatcher> = Arc::new(OpenAiMatcher::new(&config.matcher)?);
    let pipeline = Arc::new(TriggerPipeline::new(
        db.clone(),
        matcher,
        queue.handle(),
        PipelineOptions {
            matcher_attempts: config.matcher.max_attempts,
            matcher_retry_pause: Duration::from_secs(config.matcher.retry_pause_seconds),
        },
    ));

    let notifier = build_notifier(&config);
    let ingestor = Arc::new(TranscriptIngestor::new(
        db.clone(),
        pipeline,
        notifier,
        config.trigger.lookback_seconds,
    ));

    let api_server = ApiServer::new(ingestor, db, &config);
    let server = tokio::spawn(async move {
        if let Err(e) = api_server.start().await {
            error!("API server failed: {}", e);
        }
    });

    info!("hark is ready, waiting for provider callbacks");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    server.abort();
    queue.stop().await;

    Ok(())
}

fn build_notifier(config: &Config) -> Option<Arc<dyn MeetingNotifier>> {
    if !config.provider.ack_messages {
        info!("In-meeting acknowledgements disabled");
        return None;
    }
    match ProviderNotifier::new(&config.provider) {
        Ok(notifier) => Some(Arc::new(notifier)),
        Err(e) => {
            warn!("In-meeting acknowledgements unavailable: {:#}", e);
            None
        }
    }
}
