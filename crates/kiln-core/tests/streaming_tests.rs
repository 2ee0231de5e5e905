use async_trait::async_trait;
use futures::StreamExt;
use kiln_core::error::KilnError;
use kiln_core::message::Message;
use kiln_core::provider::openai::OpenAiProvider;
use kiln_core::provider::{FinishReason, GenerateOptions, Provider, ProviderConfig};
use kiln_core::streaming::{
    AccumulatedToolCall, ClientEvent, StreamClient, StreamHandler, StreamRequest, StreamResult,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ─── Helpers ───────────────────────────────────────────────────────

fn sse(records: &[serde_json::Value]) -> String {
    let mut body = String::new();
    for record in records {
        body.push_str(&format!("data: {record}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

async fn mount_stream(server: &MockServer, body: String) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(server)
        .await;
}

fn client(server: &MockServer) -> StreamClient {
    let provider = OpenAiProvider::new(
        "gpt-4o",
        ProviderConfig::new("test-key").base_url(server.uri()),
    )
    .unwrap();
    StreamClient::new(Arc::new(provider))
}

fn request() -> StreamRequest {
    StreamRequest::new(vec![Message::user("What snacks are on the menu?")])
}

#[derive(Default)]
struct Recorder {
    calls: Vec<String>,
    completed: usize,
    errors: usize,
}

#[async_trait]
impl StreamHandler for Recorder {
    async fn on_reasoning_start(&mut self) {
        self.calls.push("reasoning_start".into());
    }
    async fn on_reasoning(&mut self, text: &str) {
        self.calls.push(format!("reasoning:{text}"));
    }
    async fn on_content_start(&mut self) {
        self.calls.push("content_start".into());
    }
    async fn on_content(&mut self, text: &str) {
        self.calls.push(format!("content:{text}"));
    }
    async fn on_tool_call(&mut self, call: &AccumulatedToolCall) {
        self.calls.push(format!("tool:{}", call.arguments));
    }
    async fn on_complete(&mut self, _result: &StreamResult) {
        self.completed += 1;
        self.calls.push("complete".into());
    }
    async fn on_error(&mut self, _error: &KilnError) {
        self.errors += 1;
        self.calls.push("error".into());
    }
}

// ─── Tool-Call Reassembly ──────────────────────────────────────────

#[tokio::test]
async fn menu_tool_call_is_reassembled() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        sse(&[
            json!({"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","type":"function","function":{"name":"get_menu_items","arguments":"{\"cat"}}]}}]}),
            json!({"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"egory\":\"Snacks\"}"}}]}}]}),
            json!({"choices":[{"delta":{},"finish_reason":"tool_calls"}]}),
        ]),
    )
    .await;

    let mut rec = Recorder::default();
    let result = client(&server).consume(&request(), &mut rec).await.unwrap();

    assert_eq!(result.finish_reason, Some(FinishReason::ToolCalls));
    assert_eq!(result.tool_calls.len(), 1);
    let call = &result.tool_calls[&0];
    assert_eq!(
        call,
        &AccumulatedToolCall {
            id: "c1".into(),
            function_name: "get_menu_items".into(),
            arguments: "{\"category\":\"Snacks\"}".into(),
        }
    );
    assert_eq!(call.parse_arguments().unwrap(), json!({"category": "Snacks"}));
    assert_eq!(
        rec.calls,
        vec![
            "tool:{\"cat",
            "tool:{\"category\":\"Snacks\"}",
            "complete"
        ]
    );
}

#[tokio::test]
async fn parallel_tool_calls_keep_their_own_arguments() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        sse(&[
            json!({"choices":[{"delta":{"tool_calls":[
                {"index":0,"id":"a","function":{"name":"weather","arguments":"{\"city\":"}},
                {"index":1,"id":"b","function":{"name":"time","arguments":"{\"tz\":"}}
            ]}}]}),
            json!({"choices":[{"delta":{"tool_calls":[{"index":1,"function":{"arguments":"\"UTC\"}"}}]}}]}),
            json!({"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"Rome\"}"}}]}}]}),
            json!({"choices":[{"delta":{},"finish_reason":"tool_calls"}]}),
        ]),
    )
    .await;

    let result = client(&server)
        .consume(&request(), &mut kiln_core::streaming::client::NoopHandler)
        .await
        .unwrap();

    let calls: Vec<_> = result.ordered_tool_calls().collect();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].parse_arguments().unwrap(), json!({"city": "Rome"}));
    assert_eq!(calls[1].parse_arguments().unwrap(), json!({"tz": "UTC"}));
}

// ─── Channel Ordering ──────────────────────────────────────────────

#[tokio::test]
async fn reasoning_channel_precedes_content_channel() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        sse(&[
            json!({"choices":[{"delta":{"reasoning_content":"Let"}}]}),
            json!({"choices":[{"delta":{"reasoning_content":"me think"}}]}),
            json!({"choices":[{"delta":{"content":"The"}}]}),
            json!({"choices":[{"delta":{"content":" answer"}}]}),
            json!({"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":5,"completion_tokens":4}}),
        ]),
    )
    .await;

    let mut rec = Recorder::default();
    let result = client(&server).consume(&request(), &mut rec).await.unwrap();

    assert_eq!(
        rec.calls,
        vec![
            "reasoning_start",
            "reasoning:Let",
            "reasoning:me think",
            "content_start",
            "content:The",
            "content: answer",
            "complete",
        ]
    );
    assert_eq!(result.reasoning, "Letme think");
    assert_eq!(result.content, "The answer");
    assert_eq!(result.usage.unwrap().total_tokens(), 9);
}

#[tokio::test]
async fn malformed_frame_between_valid_frames_is_skipped() {
    let server = MockServer::start().await;
    let body = "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n\
                data: {\"choices\":[{\"delta\":{\"content\":\n\n\
                data: {\"choices\":[{\"delta\":{\"content\":\" world\"},\"finish_reason\":\"stop\"}]}\n\n\
                data: [DONE]\n\n"
        .to_string();
    mount_stream(&server, body).await;

    let mut rec = Recorder::default();
    let result = client(&server).consume(&request(), &mut rec).await.unwrap();

    assert_eq!(result.content, "Hello world");
    assert_eq!(result.finish_reason, Some(FinishReason::Stop));
    assert_eq!(rec.errors, 0);
    assert_eq!(rec.completed, 1);
}

#[tokio::test]
async fn multibyte_text_survives_the_wire() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        sse(&[
            json!({"choices":[{"delta":{"content":"Caf\u{e9} "}}]}),
            json!({"choices":[{"delta":{"content":"\u{1f600} \u{4e2d}\u{6587}"},"finish_reason":"stop"}]}),
        ]),
    )
    .await;

    let result = client(&server)
        .consume(&request(), &mut kiln_core::streaming::client::NoopHandler)
        .await
        .unwrap();
    assert_eq!(result.content, "Caf\u{e9} \u{1f600} \u{4e2d}\u{6587}");
}

// ─── Usage ─────────────────────────────────────────────────────────

#[tokio::test]
async fn trailing_usage_chunk_is_collected() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        sse(&[
            json!({"choices":[{"delta":{"content":"done"},"finish_reason":"stop"}]}),
            json!({"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":4}}),
        ]),
    )
    .await;

    let mut rec = Recorder::default();
    let result = client(&server).consume(&request(), &mut rec).await.unwrap();

    assert_eq!(result.content, "done");
    assert_eq!(result.usage.map(|u| u.total_tokens()), Some(9));
    assert_eq!(rec.calls, vec!["content_start", "content:done", "complete"]);
    assert_eq!(rec.completed, 1);
}

// ─── Slow Streams ──────────────────────────────────────────────────

/// Serve one streaming response whose frames arrive `gap` apart.
async fn trickle_server(frames: Vec<serde_json::Value>, gap: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        // Drain the request so the client is not reset mid-send.
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let body_start = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..body_start]).to_ascii_lowercase();
        let length: usize = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        while buf.len() < body_start + length {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }

        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        for frame in frames {
            tokio::time::sleep(gap).await;
            let record = format!("data: {frame}\n\n");
            if socket.write_all(record.as_bytes()).await.is_err() {
                return;
            }
        }
        let _ = socket.write_all(b"data: [DONE]\n\n").await;
        let _ = socket.shutdown().await;
    });

    format!("http://{addr}")
}

#[tokio::test]
async fn stream_outlasting_the_request_timeout_completes() {
    let mut frames: Vec<serde_json::Value> = (0..8)
        .map(|i| json!({"choices":[{"delta":{"content":format!("w{i} ")}}]}))
        .collect();
    frames.push(json!({"choices":[{"delta":{},"finish_reason":"stop"}]}));
    // Nine 100 ms gaps against a 400 ms timeout.
    let uri = trickle_server(frames, Duration::from_millis(100)).await;

    let provider =
        OpenAiProvider::new("gpt-4o", ProviderConfig::new("test-key").base_url(uri).timeout(400))
            .unwrap();
    let mut rec = Recorder::default();
    let result = StreamClient::new(Arc::new(provider))
        .consume(&request(), &mut rec)
        .await
        .unwrap();

    assert_eq!(result.content, "w0 w1 w2 w3 w4 w5 w6 w7 ");
    assert_eq!(result.finish_reason, Some(FinishReason::Stop));
    assert_eq!(rec.errors, 0);
    assert_eq!(rec.completed, 1);
}

#[tokio::test]
async fn generate_is_bounded_by_the_request_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(2))
                .set_body_json(json!({"choices": []})),
        )
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(
        "gpt-4o",
        ProviderConfig::new("test-key").base_url(server.uri()).timeout(200),
    )
    .unwrap();
    let started = std::time::Instant::now();
    let err = provider
        .generate(&[Message::user("hi")], &[], &GenerateOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, KilnError::Transport { .. }), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
}

// ─── Failures ──────────────────────────────────────────────────────

#[tokio::test]
async fn http_error_reports_once_and_returns_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&server)
        .await;

    let mut rec = Recorder::default();
    let err = client(&server)
        .consume(&request(), &mut rec)
        .await
        .unwrap_err();

    assert!(matches!(err, KilnError::Transport { .. }));
    assert_eq!(err.status(), Some(500));
    assert!(err.is_retryable());
    assert_eq!(rec.errors, 1);
    assert_eq!(rec.completed, 0);
}

#[tokio::test]
async fn client_error_is_not_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;

    let err = client(&server)
        .consume(&request(), &mut kiln_core::streaming::client::NoopHandler)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(401));
    assert!(!err.is_retryable());
}

// ─── Event Stream ──────────────────────────────────────────────────

#[tokio::test]
async fn event_stream_yields_channels_then_complete() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        sse(&[
            json!({"choices":[{"delta":{"reasoning_content":"hmm"}}]}),
            json!({"choices":[{"delta":{"content":"42"},"finish_reason":"stop"}]}),
        ]),
    )
    .await;

    let events: Vec<ClientEvent> = client(&server).event_stream(request()).collect().await;

    assert_eq!(events.len(), 5);
    assert_eq!(events[0], ClientEvent::ReasoningStart);
    assert_eq!(events[1], ClientEvent::Reasoning("hmm".into()));
    assert_eq!(events[2], ClientEvent::ContentStart);
    assert_eq!(events[3], ClientEvent::Content("42".into()));
    match &events[4] {
        ClientEvent::Complete(result) => assert_eq!(result.content, "42"),
        other => panic!("expected Complete, got {other:?}"),
    }
}

// ─── Request/Response Generation ───────────────────────────────────

#[tokio::test]
async fn generate_returns_text_reasoning_and_citations() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer test-key"))
        .and(body_partial_json(json!({"model": "gpt-4o", "stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "reasoning_content": "Checking the docs",
                    "content": "Use `sorted()`."
                },
                "finish_reason": "stop"
            }],
            "citations": ["https://docs.python.org/3/library/functions.html#sorted"],
            "usage": {"prompt_tokens": 10, "completion_tokens": 8}
        })))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(
        "gpt-4o",
        ProviderConfig::new("test-key").base_url(server.uri()),
    )
    .unwrap();
    let result = provider
        .generate(&[Message::user("sort a list")], &[], &GenerateOptions::default())
        .await
        .unwrap();

    assert_eq!(result.text(), "Use `sorted()`.");
    assert_eq!(result.reasoning(), Some("Checking the docs"));
    assert_eq!(result.citations.len(), 1);
    assert_eq!(result.finish_reason, FinishReason::Stop);
    assert_eq!(result.usage.input_tokens, 10);
}
