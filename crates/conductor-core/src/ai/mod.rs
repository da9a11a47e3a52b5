//! AI adapter
//!
//! Summarize / suggest / parse-NL over a small completion interface with a
//! bounded timeout per call. Failures never propagate: every operation has
//! a deterministic fallback and reports into the error escalator instead.

pub mod prompts;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::config::AiConfig;
use crate::errors::{ErrorEscalator, ErrorKind};

/// One AI-suggested next action, rendered as an inline button.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Suggestion {
    pub label: String,
    pub command: String,
}

/// Structured command parsed from free text. `command` is `"unknown"`
/// when parsing failed or confidence was unusable.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParsedCommand {
    pub command: String,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub clarification: Option<String>,
}

impl ParsedCommand {
    pub fn unknown() -> Self {
        Self {
            command: "unknown".to_string(),
            session: None,
            args: serde_json::Value::Null,
            confidence: 0.0,
            clarification: None,
        }
    }
}

/// Minimal completion interface; mocked in tests.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String>;
}

// ============ Anthropic client ============

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

/// Raw-HTTP client for the Anthropic Messages API.
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicClient {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self::with_base_url("https://api.anthropic.com", api_key, model)
    }

    pub fn with_base_url(base_url: &str, api_key: &str, model: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&json!({
                "model": self.model,
                "max_tokens": max_tokens,
                "messages": [{ "role": "user", "content": prompt }],
            }))
            .send()
            .await
            .context("messages request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("messages API returned {status}: {body}"));
        }

        let parsed: MessagesResponse = response.json().await.context("invalid messages response")?;
        parsed
            .content
            .first()
            .map(|block| block.text.clone())
            .ok_or_else(|| anyhow!("empty completion"))
    }
}

// ============ Brain ============

/// The intelligence layer: three operations, all infallible from the
/// caller's point of view.
pub struct Brain {
    client: Arc<dyn ModelClient>,
    config: AiConfig,
    escalator: Arc<ErrorEscalator>,
}

impl Brain {
    pub fn new(client: Arc<dyn ModelClient>, config: AiConfig, escalator: Arc<ErrorEscalator>) -> Self {
        Self {
            client,
            config,
            escalator,
        }
    }

    async fn call(&self, prompt: &str, max_tokens: u32, context: &str) -> Option<String> {
        let deadline = Duration::from_secs(self.config.timeout_seconds);
        match tokio::time::timeout(deadline, self.client.complete(prompt, max_tokens)).await {
            Ok(Ok(text)) => Some(text),
            Ok(Err(e)) => {
                warn!(error = %e, context, "AI call failed");
                self.escalator.record(ErrorKind::TransportUnreachable, context);
                None
            }
            Err(_) => {
                warn!(context, "AI call timed out");
                self.escalator.record(ErrorKind::TransportUnreachable, context);
                None
            }
        }
    }

    /// Summarize terminal output. Falls back to the raw tail when the
    /// model is unavailable.
    pub async fn summarize(&self, terminal_output: &str) -> String {
        let trimmed = tail_chars(terminal_output, 3000);
        let prompt = prompts::summarize_prompt(&trimmed);
        match self.call(&prompt, self.config.summary_max_tokens, "ai summarize").await {
            Some(summary) => summary.trim().to_string(),
            None => self.raw_fallback(terminal_output),
        }
    }

    /// Suggest next actions. Empty on any failure.
    pub async fn suggest(
        &self,
        terminal_output: &str,
        project_alias: &str,
        session_type: &str,
        working_dir: &str,
    ) -> Vec<Suggestion> {
        let trimmed = tail_chars(terminal_output, 2000);
        let prompt = prompts::suggest_prompt(&trimmed, project_alias, session_type, working_dir);
        let Some(text) = self
            .call(&prompt, self.config.suggestion_max_tokens, "ai suggest")
            .await
        else {
            return Vec::new();
        };
        match serde_json::from_str::<Vec<Suggestion>>(strip_fences(&text)) {
            Ok(mut suggestions) => {
                suggestions.truncate(3);
                suggestions
            }
            Err(e) => {
                warn!(error = %e, "Suggestion parse error");
                Vec::new()
            }
        }
    }

    /// Parse free text into a structured command. Unknown on any failure.
    pub async fn parse_nl(
        &self,
        user_message: &str,
        session_list_json: &str,
        last_prompt: &str,
    ) -> ParsedCommand {
        let prompt = prompts::parse_nl_prompt(user_message, session_list_json, last_prompt);
        let Some(text) = self.call(&prompt, self.config.nlp_max_tokens, "ai parse_nl").await else {
            return ParsedCommand::unknown();
        };
        match serde_json::from_str::<ParsedCommand>(strip_fences(&text)) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "NL parse error");
                ParsedCommand::unknown()
            }
        }
    }

    /// Last-N-lines fallback used when the model is down.
    pub fn raw_fallback(&self, terminal_output: &str) -> String {
        let lines: Vec<&str> = terminal_output.trim().lines().collect();
        let start = lines.len().saturating_sub(self.config.fallback_lines);
        format!("📝 Raw output (AI unavailable):\n{}", lines[start..].join("\n"))
    }
}

/// Keep the last `max` characters on a char boundary.
fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    text.chars().skip(count - max).collect()
}

/// Models occasionally wrap JSON in markdown fences despite instructions.
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|inner| inner.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CannedClient {
        reply: Result<String, ()>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl CannedClient {
        fn ok(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                reply: Err(()),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn slow(reply: &str, delay: Duration) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                delay,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelClient for CannedClient {
        async fn complete(&self, _prompt: &str, _max_tokens: u32) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.reply.clone().map_err(|_| anyhow!("model down"))
        }
    }

    fn brain(client: CannedClient) -> Brain {
        let (escalator, _rx) = ErrorEscalator::new();
        Brain::new(Arc::new(client), AiConfig::default(), Arc::new(escalator))
    }

    #[tokio::test]
    async fn test_summarize_happy_path() {
        let brain = brain(CannedClient::ok("  Build passed, 12 tests green.  "));
        let summary = brain.summarize("lots of output").await;
        assert_eq!(summary, "Build passed, 12 tests green.");
    }

    #[tokio::test]
    async fn test_summarize_falls_back_to_raw_tail() {
        let brain = brain(CannedClient::failing());
        let output: String = (0..30).map(|i| format!("line {i}\n")).collect();
        let summary = brain.summarize(&output).await;
        assert!(summary.starts_with("📝 Raw output (AI unavailable):"));
        // default fallback keeps 20 lines
        assert!(summary.contains("line 10"));
        assert!(!summary.contains("line 9\n"));
        assert!(summary.contains("line 29"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_triggers_fallback() {
        let brain = brain(CannedClient::slow("too late", Duration::from_secs(60)));
        let summary = brain.summarize("output").await;
        assert!(summary.starts_with("📝 Raw output"));
    }

    #[tokio::test]
    async fn test_suggest_parses_and_caps_at_three() {
        let reply = r#"[
            {"label": "a", "command": "1"},
            {"label": "b", "command": "2"},
            {"label": "c", "command": "3"},
            {"label": "d", "command": "4"}
        ]"#;
        let brain = brain(CannedClient::ok(reply));
        let suggestions = brain.suggest("out", "App", "claude-code", "/tmp").await;
        assert_eq!(suggestions.len(), 3);
        assert_eq!(suggestions[0].label, "a");
    }

    #[tokio::test]
    async fn test_suggest_handles_fenced_json_and_garbage() {
        let brain1 = brain(CannedClient::ok(
            "```json\n[{\"label\": \"x\", \"command\": \"y\"}]\n```",
        ));
        let suggestions = brain1.suggest("out", "App", "shell", "/tmp").await;
        assert_eq!(suggestions.len(), 1);

        let brain2 = brain(CannedClient::ok("sorry, I can't"));
        assert!(brain2.suggest("out", "App", "shell", "/tmp").await.is_empty());
    }

    #[tokio::test]
    async fn test_parse_nl() {
        let reply = r#"{"command": "kill", "session": "2", "args": {}, "confidence": 0.92}"#;
        let brain = brain(CannedClient::ok(reply));
        let parsed = brain.parse_nl("kill the second one", "[]", "None").await;
        assert_eq!(parsed.command, "kill");
        assert_eq!(parsed.session.as_deref(), Some("2"));
        assert!(parsed.confidence > 0.9);
    }

    #[tokio::test]
    async fn test_parse_nl_unknown_on_failure() {
        let brain = brain(CannedClient::failing());
        let parsed = brain.parse_nl("do the thing", "[]", "None").await;
        assert_eq!(parsed.command, "unknown");
        assert_eq!(parsed.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_failures_reach_escalator() {
        let (escalator, mut rx) = ErrorEscalator::new();
        let brain = Brain::new(
            Arc::new(CannedClient::failing()),
            AiConfig::default(),
            Arc::new(escalator),
        );
        for _ in 0..5 {
            let _ = brain.summarize("x").await;
        }
        assert!(rx.try_recv().unwrap().contains("transport_unreachable"));
    }
}
