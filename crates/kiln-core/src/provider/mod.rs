use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;

use crate::error::{self, KilnError};
use crate::message::{Message, Usage};
use crate::streaming::StreamEvent;
use crate::tool::{Tool, ToolChoice};

pub mod openai;
pub mod openai_compatible;
pub mod retry;
pub mod selector;

const DEFAULT_TIMEOUT_MS: u64 = 60_000;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Stream of decoded protocol frames.
pub type BoxStream = Pin<Box<dyn futures::Stream<Item = error::Result<StreamEvent>> + Send>>;

/// Reasoning effort level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }
}

/// Options for text generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
}

/// Provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: SecretString,
    pub base_url: Option<String>,
    pub headers: Vec<(String, String)>,
    pub timeout_ms: Option<u64>,
    pub organization: Option<String>,
}

impl ProviderConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: SecretString::from(api_key.into()),
            base_url: None,
            headers: Vec::new(),
            timeout_ms: Some(DEFAULT_TIMEOUT_MS),
            organization: None,
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn timeout(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// Limit for a whole non-streaming exchange, and for the silence
    /// between two chunks of a stream.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Result from a non-streaming generation.
#[derive(Debug, Clone)]
pub struct GenerateResult {
    pub message: Message,
    pub usage: Usage,
    pub finish_reason: FinishReason,
    /// Source URLs some OpenAI-compatible vendors attach to answers.
    pub citations: Vec<String>,
}

impl GenerateResult {
    pub fn text(&self) -> String {
        self.message.text_content()
    }

    pub fn reasoning(&self) -> Option<&str> {
        self.message.reasoning()
    }

    pub fn tool_calls(&self) -> Vec<(&str, &str, &str)> {
        self.message.tool_calls()
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Error,
    Other(String),
}

impl FinishReason {
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "stop" => FinishReason::Stop,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            "error" => FinishReason::Error,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

/// Upstream model endpoint.
///
/// `generate` is a single request/response call; `stream` opens a chunked
/// response and yields decoded frames. Neither retries.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn generate(
        &self,
        messages: &[Message],
        tools: &[Tool],
        options: &GenerateOptions,
    ) -> error::Result<GenerateResult>;

    async fn stream(
        &self,
        messages: &[Message],
        tools: &[Tool],
        options: &GenerateOptions,
    ) -> error::Result<BoxStream>;
}

/// Build an HTTP client whose reads time out after `idle` of silence.
///
/// No total timeout is set on the client: streamed responses may run far
/// longer than any single read. Non-streaming calls set one per request.
pub fn build_client(idle: Duration) -> error::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(idle.min(CONNECT_TIMEOUT))
        .read_timeout(idle)
        .build()
        .map_err(|e| KilnError::config(format!("Failed to build HTTP client: {e}")))
}
