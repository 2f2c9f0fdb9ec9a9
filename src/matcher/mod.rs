//! Trigger matching abstraction.
//!
//! Resolving a trigger window of speech into structured events is delegated
//! to an external matcher behind a trait, decoupled from how the window was
//! detected. The production implementation calls a chat-completions API; tests
//! inject fakes.

pub mod openai_api;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::db::transcripts::TranscriptWord;

pub use openai_api::OpenAiMatcher;

/// One action available to a session, built fresh from current configuration
/// for each match attempt. Serialized verbatim into the matcher request.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerEventTemplate {
    pub action_name: String,
    pub registration_id: String,
    pub session_id: String,
    pub recording_id: String,
    pub speaker_id: String,
    pub speaker_name: Option<String>,
    pub provider_bot_id: String,
    /// Fields the action still needs, key → placeholder-or-configured-value.
    pub missing_data: BTreeMap<String, String>,
}

/// A candidate returned by the matcher: template fields echoed back, plus the
/// match itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedTriggerEvent {
    pub action_name: String,
    pub registration_id: String,
    pub session_id: String,
    pub recording_id: String,
    pub speaker_id: String,
    pub speaker_name: Option<String>,
    pub provider_bot_id: String,
    /// Placeholders replaced with values extracted from speech.
    pub missing_data: BTreeMap<String, String>,
    pub confidence: f64,
    /// The exact spoken command, wake word and closing phrase stripped.
    pub matched_text: String,
    /// Offset in seconds of this command's wake word within the session.
    pub wake_word_offset: f64,
}

impl MatchedTriggerEvent {
    /// Semantic checks on top of deserialization. A violation is treated the
    /// same as a transport failure by the orchestrator's retry loop.
    pub fn validate(&self) -> Result<()> {
        if self.action_name.is_empty() {
            bail!("Matched event has an empty action name");
        }
        if self.registration_id.is_empty() {
            bail!("Matched event has an empty registration id");
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            bail!(
                "Matched event confidence {} outside [0, 1]",
                self.confidence
            );
        }
        if self.wake_word_offset < 0.0 || !self.wake_word_offset.is_finite() {
            bail!(
                "Matched event wake word offset {} is not a valid offset",
                self.wake_word_offset
            );
        }
        Ok(())
    }
}

/// A trigger window plus the actions it may resolve to.
#[derive(Debug)]
pub struct MatchRequest<'a> {
    /// The session's wake word; every command starts with it.
    pub wake_word: &'a str,
    /// Same-speaker words for the whole recording, ordered by start offset.
    pub words: &'a [TranscriptWord],
    pub templates: &'a [TriggerEventTemplate],
}

impl MatchRequest<'_> {
    /// The window as plain text, for prompts and logs.
    pub fn transcript_text(&self) -> String {
        let mut text = String::new();
        for word in self.words {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&word.word);
        }
        text
    }
}

#[async_trait]
pub trait TriggerMatcher: Send + Sync {
    /// Resolve spoken commands in the window into matched events. Returning
    /// an empty list is a normal outcome for windows with no command.
    async fn match_triggers(&self, request: &MatchRequest<'_>)
        -> Result<Vec<MatchedTriggerEvent>>;
}
