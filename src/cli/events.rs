use anyhow::{anyhow, Result};

use crate::db::webhook_events::{WebhookEventRepository, WebhookEventStatus};
use crate::db::Database;

use super::args::EventsCliArgs;

pub fn handle_events_command(args: EventsCliArgs) -> Result<()> {
    let db = Database::open()?;
    let conn = db.conn();

    // If an id is provided, show that event in full
    if let Some(id) = &args.id {
        let event = WebhookEventRepository::get(&conn, id)?
            .ok_or_else(|| anyhow!("Webhook event {} not found", id))?;

        println!("ID: {}", event.id);
        println!("Webhook: {}", event.webhook_id);
        println!("Type: {}", event.event_type);
        println!("Status: {}", event.status.as_str());
        println!("Created: {}", event.created_at);
        println!("Retries: {}", event.retry_count);
        if let Some(reason) = &event.failure_reason {
            println!("Failure: {}", reason);
        }
        if let Some(status) = event.response_status {
            println!("Response status: {}", status);
        }
        println!(
            "Request body: {}",
            serde_json::to_string_pretty(&event.request_body)?
        );
        if let Some(body) = &event.response_body {
            println!("Response body: {}", serde_json::to_string_pretty(body)?);
        }
        return Ok(());
    }

    let status_filter = args
        .status
        .as_deref()
        .map(WebhookEventStatus::from_str)
        .transpose()?;

    let events = WebhookEventRepository::list_recent(&conn, args.limit.max(1))?;
    let events: Vec<_> = events
        .into_iter()
        .filter(|event| status_filter.map_or(true, |status| event.status == status))
        .collect();

    if events.is_empty() {
        println!("No webhook deliveries found.");
        return Ok(());
    }

    println!("Found {} webhook deliver(ies):\n", events.len());

    for event in events {
        println!("ID: {}", event.id);
        println!("Date: {}", event.created_at);
        println!(
            "Status: {} (retries: {})",
            event.status.as_str(),
            event.retry_count
        );
        if let Some(reason) = &event.failure_reason {
            println!("Failure: {}", reason);
        }
        println!("---");
    }

    println!("\nTo inspect one delivery in full, use: hark events --id <ID>");

    Ok(())
}
