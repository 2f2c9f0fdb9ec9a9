//! In-meeting acknowledgement messages.
//!
//! When a trigger window is detected the bot posts a short "working on it"
//! chat message back into the meeting through the meeting-bot provider.
//! Strictly best-effort: failures are logged and swallowed, and an advisory
//! per-bot lock keeps overlapping windows from spamming the meeting.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::ProviderConfig;

/// One acknowledgement per bot within this window.
const ACK_LOCK_TTL: Duration = Duration::from_secs(15);

const ACK_PHRASES: &[&str] = &[
    "On it, give me a few seconds",
    "Got it, bear with me while I work on this",
    "Hang tight, I'm taking care of it",
    "Working on it right now",
    "Just a sec",
    "One moment please",
    "I'm on the case, hold on",
    "Please wait while I resolve this",
    "Don't worry, I've got this",
    "I'll get this sorted out right away",
    "Let me look into that for you",
];

#[async_trait]
pub trait MeetingNotifier: Send + Sync {
    /// Tell the meeting the bot heard a command and is working on it.
    async fn notify_processing(&self, provider_bot_id: &str) -> Result<()>;
}

/// Expiring per-key advisory lock. Purely a politeness mechanism, never
/// relied on for correctness.
pub struct AckLimiter {
    ttl: Duration,
    held: Mutex<HashMap<String, Instant>>,
}

impl AckLimiter {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// True if the caller acquired the lock; false while a previous hold is
    /// still within its TTL.
    pub fn try_acquire(&self, key: &str) -> bool {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        held.retain(|_, acquired| now.duration_since(*acquired) < self.ttl);

        if held.contains_key(key) {
            return false;
        }
        held.insert(key.to_string(), now);
        true
    }
}

#[derive(Debug, Serialize)]
struct ChatMessagePayload<'a> {
    message: &'a str,
}

/// Notifier backed by the meeting-bot provider's chat-message API.
pub struct ProviderNotifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    limiter: AckLimiter,
}

impl ProviderNotifier {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .context("Provider API key is not configured")?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build provider HTTP client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key,
            limiter: AckLimiter::new(ACK_LOCK_TTL),
        })
    }

    fn pick_phrase() -> &'static str {
        let index = rand::thread_rng().gen_range(0..ACK_PHRASES.len());
        ACK_PHRASES[index]
    }
}

#[async_trait]
impl MeetingNotifier for ProviderNotifier {
    async fn notify_processing(&self, provider_bot_id: &str) -> Result<()> {
        if !self.limiter.try_acquire(provider_bot_id) {
            debug!(
                "Acknowledgement for bot {} suppressed, lock still held",
                provider_bot_id
            );
            return Ok(());
        }

        let message = Self::pick_phrase();
        let url = format!("{}/bot/{}/send_chat_message", self.endpoint, provider_bot_id);

        let response = self
            .client
            .post(&url)
            .header("Authorization", &self.api_key)
            .json(&ChatMessagePayload { message })
            .send()
            .await
            .context("Failed to send acknowledgement message")?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Acknowledgement message rejected with status {}",
                response.status()
            );
        }

        info!("Acknowledgement sent to bot {}", provider_bot_id);
        Ok(())
    }
}
