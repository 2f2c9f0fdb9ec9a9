use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

use super::{MatchRequest, MatchedTriggerEvent, TriggerMatcher};
use crate::config::MatcherConfig;

#[derive(Debug, Serialize)]
struct ChatPayload<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// The JSON object the model is instructed to return.
#[derive(Debug, Deserialize)]
struct MatchedEventsEnvelope {
    #[serde(default)]
    matched_events: Vec<MatchedTriggerEvent>,
}

/// Word view embedded in the prompt, offsets only.
#[derive(Debug, Serialize)]
struct PromptWord<'a> {
    word: &'a str,
    start_time: f64,
    end_time: f64,
}

pub struct OpenAiMatcher {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiMatcher {
    pub fn new(config: &MatcherConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .context("Matcher API key is not configured")?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .context("Failed to build matcher HTTP client")?;

        info!(
            "Initialized matcher against {} with model {}",
            config.endpoint, config.model
        );

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        })
    }

    fn system_prompt(wake_word: &str) -> String {
        format!(
            "You process a meeting transcript and identify spoken action commands \
             against a list of action templates.\n\
             \n\
             Every action command starts with the trigger word \"{wake_word}\" and ends \
             with \"thanks\", \"thank you\" or \"thanks.\" (case-insensitive). The \
             transcript may contain several commands; find every one of them.\n\
             \n\
             For each command, pick the best-matching template by action_name and \
             command content, and replace any {{{{command}}}}-style placeholders in the \
             template's missing_data with values extracted from the command. Extract \
             only the value itself, without surrounding words: for \"ping the slack \
             channel called dogs\", a channelName placeholder becomes \"dogs\".\n\
             \n\
             Return a JSON object of the form\n\
             {{\"matched_events\": [{{ ...all template fields..., \
             \"missing_data\": {{...placeholders replaced...}}, \
             \"confidence\": 0.95, \
             \"matched_text\": \"the command text without the trigger word and ending\", \
             \"wake_word_offset\": 12.4 }}]}}\n\
             \n\
             wake_word_offset is the start_time of the word \"{wake_word}\" that opened \
             that specific command; each command has its own. confidence is between 0 \
             and 1. A command that matches no template may be skipped. Return \
             {{\"matched_events\": []}} when nothing matches."
        )
    }

    fn user_prompt(request: &MatchRequest<'_>) -> Result<String> {
        let words: Vec<PromptWord<'_>> = request
            .words
            .iter()
            .map(|w| PromptWord {
                word: &w.word,
                start_time: w.start_time,
                end_time: w.end_time,
            })
            .collect();
        let words_json =
            serde_json::to_string_pretty(&words).context("Failed to serialize prompt words")?;
        let templates_json = serde_json::to_string_pretty(request.templates)
            .context("Failed to serialize prompt templates")?;

        Ok(format!(
            "Transcript with timestamps:\n{words_json}\n\n\
             Transcript as a string: {transcript}\n\n\
             Available templates:\n{templates_json}\n\n\
             Return the matched templates with placeholders populated from the \
             transcript, including the start_time of \"{wake_word}\" for each command \
             as wake_word_offset.",
            transcript = request.transcript_text(),
            wake_word = request.wake_word,
        ))
    }
}

#[async_trait]
impl TriggerMatcher for OpenAiMatcher {
    async fn match_triggers(
        &self,
        request: &MatchRequest<'_>,
    ) -> Result<Vec<MatchedTriggerEvent>> {
        let system = Self::system_prompt(request.wake_word);
        let user = Self::user_prompt(request)?;

        debug!(
            "Sending {} words and {} templates to the matcher",
            request.words.len(),
            request.templates.len()
        );

        let payload = ChatPayload {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &system,
                },
                ChatMessage {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: 0.1,
            response_format: ResponseFormat {
                format: "json_object",
            },
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .context("Failed to send matcher request")?;

        let status = response.status();
        let response_text = response
            .text()
            .await
            .context("Failed to read matcher response body")?;

        if !status.is_success() {
            error!(
                "Matcher request failed with status {}: {}",
                status, response_text
            );
            anyhow::bail!("Matcher request failed with status {}", status);
        }

        let chat: ChatResponse = serde_json::from_str(&response_text)
            .context("Failed to parse matcher chat response")?;
        let content = chat
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
            .map(str::trim)
            .filter(|content| !content.is_empty())
            .context("Matcher returned no content")?;

        let envelope: MatchedEventsEnvelope = serde_json::from_str(content)
            .with_context(|| format!("Matcher returned malformed JSON: {content}"))?;

        info!(
            "Matcher resolved {} candidate event(s)",
            envelope.matched_events.len()
        );

        Ok(envelope.matched_events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_names_wake_word() {
        let prompt = OpenAiMatcher::system_prompt("joe");
        assert!(prompt.contains("\"joe\""));
        assert!(prompt.contains("matched_events"));
        assert!(prompt.contains("{{command}}"));
    }

    #[test]
    fn test_envelope_parses_empty_object() {
        let envelope: MatchedEventsEnvelope = serde_json::from_str("{}").unwrap();
        assert!(envelope.matched_events.is_empty());
    }

    #[test]
    fn test_envelope_parses_matched_event() {
        let envelope: MatchedEventsEnvelope = serde_json::from_str(
            r#"{
                "matched_events": [{
                    "action_name": "Ping slack channel",
                    "registration_id": "reg_1",
                    "session_id": "session_1",
                    "recording_id": "rec-1",
                    "speaker_id": "100",
                    "speaker_name": "Gerry",
                    "provider_bot_id": "provider-1",
                    "missing_data": {"channelName": "dogs"},
                    "confidence": 0.95,
                    "matched_text": "ping the slack channel called dogs",
                    "wake_word_offset": 12
                }]
            }"#,
        )
        .unwrap();

        assert_eq!(envelope.matched_events.len(), 1);
        let event = &envelope.matched_events[0];
        assert_eq!(event.missing_data.get("channelName").unwrap(), "dogs");
        assert_eq!(event.wake_word_offset, 12.0);
    }

    #[test]
    fn test_envelope_rejects_malformed_event() {
        // confidence as a string must not slip through
        let result: Result<MatchedEventsEnvelope, _> = serde_json::from_str(
            r#"{"matched_events": [{"action_name": "x", "confidence": "high"}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_new_requires_api_key() {
        let config = MatcherConfig::default();
        assert!(OpenAiMatcher::new(&config).is_err());
    }
}
