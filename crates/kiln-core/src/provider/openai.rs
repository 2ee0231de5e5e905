use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::error::{self, KilnError};
use crate::message::{Content, Message, Role, Usage};
use crate::provider::{
    BoxStream, FinishReason, GenerateOptions, GenerateResult, Provider, ProviderConfig,
};
use crate::streaming::FrameDecoder;
use crate::streaming::decoder::WireUsage;
use crate::tool::Tool;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Chat Completions provider; also serves every vendor speaking the same
/// wire shape through a custom `base_url`.
pub struct OpenAiProvider {
    config: ProviderConfig,
    model: String,
    client: Client,
    label: String,
}

impl OpenAiProvider {
    pub fn new(model: impl Into<String>, config: ProviderConfig) -> error::Result<Self> {
        let client = crate::provider::build_client(config.request_timeout())?;

        Ok(Self {
            config,
            model: model.into(),
            client,
            label: "openai".to_string(),
        })
    }

    /// Override the name reported in logs and errors.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
    }

    /// Newer reasoning models take `max_completion_tokens` instead of `max_tokens`.
    fn uses_max_completion_tokens(&self) -> bool {
        let m = self.model.as_str();
        m.starts_with("o1") || m.starts_with("o3") || m.starts_with("o4") || m.starts_with("gpt-5")
    }

    pub(crate) fn build_request_body(
        &self,
        messages: &[Message],
        tools: &[Tool],
        options: &GenerateOptions,
        stream: bool,
    ) -> serde_json::Value {
        let mut body = json!({
            "model": self.model,
            "messages": convert_messages(messages),
            "stream": stream,
        });
        if stream {
            // Usage then arrives in a trailing chunk after the finish frame.
            body["stream_options"] = json!({"include_usage": true});
        }

        if !tools.is_empty() {
            body["tools"] = json!(tools.iter().map(Tool::to_wire).collect::<Vec<_>>());
            if let Some(ref tc) = options.tool_choice {
                body["tool_choice"] = tc.to_wire();
            }
        }

        if let Some(t) = options.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(tp) = options.top_p {
            body["top_p"] = json!(tp);
        }
        if let Some(mt) = options.max_tokens {
            if self.uses_max_completion_tokens() {
                body["max_completion_tokens"] = json!(mt);
            } else {
                body["max_tokens"] = json!(mt);
            }
        }
        if let Some(ref stops) = options.stop_sequences {
            body["stop"] = json!(stops);
        }
        if let Some(re) = options.reasoning_effort {
            body["reasoning_effort"] = json!(re.as_str());
        }

        body
    }

    /// POST a completion request. `total` bounds the whole exchange; streams
    /// pass `None` and rely on the client's idle read timeout instead.
    async fn post(
        &self,
        body: &serde_json::Value,
        total: Option<Duration>,
    ) -> error::Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url());

        let mut req = self
            .client
            .post(&url)
            .bearer_auth(self.config.api_key.expose_secret())
            .header("Content-Type", "application/json");
        if let Some(total) = total {
            req = req.timeout(total);
        }

        if let Some(ref org) = self.config.organization {
            req = req.header("OpenAI-Organization", org);
        }
        for (k, v) in &self.config.headers {
            req = req.header(k, v);
        }

        let resp = req.json(body).send().await.map_err(|e| KilnError::Transport {
            message: e.to_string(),
            status: e.status().map(|s| s.as_u16()),
            provider: self.label.clone(),
            source: Some(Box::new(e)),
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or(json!({}));
            let msg = body["error"]["message"]
                .as_str()
                .unwrap_or("Unknown error")
                .to_string();
            return Err(KilnError::transport_status(
                &self.label,
                status.as_u16(),
                msg,
            ));
        }

        Ok(resp)
    }
}

fn convert_messages(messages: &[Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|msg| {
            let mut m = json!({"role": msg.role.as_str()});

            match msg.role {
                Role::Tool => {
                    if let Some(Content::ToolResult {
                        tool_call_id,
                        content,
                        ..
                    }) = msg.content.first()
                    {
                        m["tool_call_id"] = json!(tool_call_id);
                        m["content"] = match content {
                            serde_json::Value::String(s) => json!(s),
                            other => json!(other.to_string()),
                        };
                    }
                }
                Role::Assistant => {
                    let tool_calls: Vec<_> = msg
                        .tool_calls()
                        .into_iter()
                        .map(|(id, name, arguments)| {
                            json!({
                                "id": id,
                                "type": "function",
                                "function": {"name": name, "arguments": arguments}
                            })
                        })
                        .collect();

                    let text = msg.text_content();
                    if !text.is_empty() {
                        m["content"] = json!(text);
                    } else if !tool_calls.is_empty() {
                        m["content"] = serde_json::Value::Null;
                    }
                    if !tool_calls.is_empty() {
                        m["tool_calls"] = json!(tool_calls);
                    }
                }
                Role::System | Role::User => {
                    m["content"] = json!(msg.text_content());
                }
            }

            m
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    citations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, alias = "reasoning")]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<CompletionToolCall>,
}

#[derive(Debug, Deserialize)]
struct CompletionToolCall {
    #[serde(default)]
    id: String,
    function: CompletionFunction,
}

#[derive(Debug, Deserialize)]
struct CompletionFunction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: String,
}

fn parse_completion(provider: &str, body: CompletionBody) -> error::Result<GenerateResult> {
    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| KilnError::transport(provider, "No choices in response"))?;

    let msg = choice.message;
    let mut content = Vec::new();

    if let Some(text) = msg.reasoning_content.filter(|t| !t.is_empty()) {
        content.push(Content::Reasoning { text });
    }
    if let Some(text) = msg.content.filter(|t| !t.is_empty()) {
        content.push(Content::Text { text });
    }
    for tc in msg.tool_calls {
        content.push(Content::ToolCall {
            id: tc.id,
            name: tc.function.name,
            arguments: tc.function.arguments,
        });
    }

    Ok(GenerateResult {
        message: Message {
            role: Role::Assistant,
            content,
            name: None,
        },
        usage: body.usage.map(Usage::from).unwrap_or_default(),
        finish_reason: choice
            .finish_reason
            .as_deref()
            .map(FinishReason::from_wire)
            .unwrap_or(FinishReason::Stop),
        citations: body.citations,
    })
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.label
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        messages: &[Message],
        tools: &[Tool],
        options: &GenerateOptions,
    ) -> error::Result<GenerateResult> {
        let body = self.build_request_body(messages, tools, options, false);
        let resp = self.post(&body, Some(self.config.request_timeout())).await?;

        let parsed: CompletionBody = resp.json().await.map_err(|e| KilnError::Transport {
            message: format!("Failed to parse response: {e}"),
            status: None,
            provider: self.label.clone(),
            source: Some(Box::new(e)),
        })?;

        parse_completion(&self.label, parsed)
    }

    async fn stream(
        &self,
        messages: &[Message],
        tools: &[Tool],
        options: &GenerateOptions,
    ) -> error::Result<BoxStream> {
        let body = self.build_request_body(messages, tools, options, true);
        let resp = self.post(&body, None).await?;
        let provider = self.label.clone();
        debug!(provider = %provider, "Stream opened");

        let stream = async_stream::try_stream! {
            let mut byte_stream = resp.bytes_stream();
            let mut decoder = FrameDecoder::new();

            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk.map_err(|e| KilnError::Transport {
                    message: format!("Stream read error: {e}"),
                    status: None,
                    provider: provider.clone(),
                    source: Some(Box::new(e)),
                })?;
                for frame in decoder.push(&chunk) {
                    yield frame;
                }
                if decoder.is_terminated() {
                    break;
                }
            }

            if let Some(frame) = decoder.finish() {
                yield frame;
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolChoice;

    fn provider(model: &str) -> OpenAiProvider {
        OpenAiProvider::new(model, ProviderConfig::new("k")).unwrap()
    }

    #[test]
    fn request_body_shape() {
        let tool = Tool::builder("get_menu_items", "menu").build();
        let options = GenerateOptions {
            temperature: Some(0.2),
            max_tokens: Some(256),
            tool_choice: Some(ToolChoice::Required),
            ..Default::default()
        };
        let body = provider("gpt-4o").build_request_body(
            &[Message::system("sys"), Message::user("hi")],
            &[tool],
            &options,
            true,
        );

        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["tool_choice"], "required");
        assert_eq!(body["tools"][0]["function"]["name"], "get_menu_items");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
    }

    #[test]
    fn reasoning_models_use_max_completion_tokens() {
        let options = GenerateOptions {
            max_tokens: Some(10),
            ..Default::default()
        };
        let body = provider("o3-mini").build_request_body(&[], &[], &options, false);
        assert_eq!(body["max_completion_tokens"], 10);
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn assistant_tool_calls_round_trip_raw_arguments() {
        let msg = Message {
            role: Role::Assistant,
            content: vec![Content::ToolCall {
                id: "c1".into(),
                name: "f".into(),
                arguments: "{\"a\":1}".into(),
            }],
            name: None,
        };
        let wire = convert_messages(&[msg]);
        assert!(wire[0]["content"].is_null());
        assert_eq!(wire[0]["tool_calls"][0]["function"]["arguments"], "{\"a\":1}");
    }
}
