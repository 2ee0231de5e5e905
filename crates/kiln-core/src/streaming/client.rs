use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::{AccumulatedToolCall, Delta, StreamEvent, StreamResult, ToolCallAccumulator};
use crate::error::{self, KilnError};
use crate::message::{Message, Usage};
use crate::provider::{FinishReason, GenerateOptions, Provider};
use crate::tool::Tool;

const EVENT_BUFFER: usize = 64;

/// Everything needed to open one stream.
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<Tool>,
    pub options: GenerateOptions,
}

impl StreamRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }
}

/// Receives the channels of one stream, in wire order.
///
/// Every method defaults to a no-op. `on_reasoning_start` and
/// `on_content_start` fire once each, immediately before the first
/// non-empty text of their channel. Exactly one of `on_complete` or
/// `on_error` ends every stream.
#[async_trait]
pub trait StreamHandler: Send {
    async fn on_reasoning_start(&mut self) {}
    async fn on_reasoning(&mut self, _text: &str) {}
    async fn on_content_start(&mut self) {}
    async fn on_content(&mut self, _text: &str) {}
    /// Called after every fragment with the call's current snapshot.
    async fn on_tool_call(&mut self, _call: &AccumulatedToolCall) {}
    async fn on_complete(&mut self, _result: &StreamResult) {}
    async fn on_error(&mut self, _error: &KilnError) {}
}

/// Handler that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

#[async_trait]
impl StreamHandler for NoopHandler {}

/// Stream notifications as discrete values.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ReasoningStart,
    Reasoning(String),
    ContentStart,
    Content(String),
    ToolCall(AccumulatedToolCall),
    Complete(StreamResult),
    Error(String),
}

struct ChannelHandler {
    tx: mpsc::Sender<ClientEvent>,
}

impl ChannelHandler {
    async fn emit(&self, event: ClientEvent) {
        // A closed receiver means the consumer went away; consumption is
        // cancelled separately through `Sender::closed`.
        let _ = self.tx.send(event).await;
    }
}

#[async_trait]
impl StreamHandler for ChannelHandler {
    async fn on_reasoning_start(&mut self) {
        self.emit(ClientEvent::ReasoningStart).await;
    }
    async fn on_reasoning(&mut self, text: &str) {
        self.emit(ClientEvent::Reasoning(text.to_string())).await;
    }
    async fn on_content_start(&mut self) {
        self.emit(ClientEvent::ContentStart).await;
    }
    async fn on_content(&mut self, text: &str) {
        self.emit(ClientEvent::Content(text.to_string())).await;
    }
    async fn on_tool_call(&mut self, call: &AccumulatedToolCall) {
        self.emit(ClientEvent::ToolCall(call.clone())).await;
    }
    async fn on_complete(&mut self, result: &StreamResult) {
        self.emit(ClientEvent::Complete(result.clone())).await;
    }
    async fn on_error(&mut self, error: &KilnError) {
        self.emit(ClientEvent::Error(error.to_string())).await;
    }
}

/// Consumes a provider stream and separates its channels.
///
/// The client holds no per-stream state: every call to [`consume`] gets its
/// own accumulator, so one client can serve concurrent conversations. It
/// never retries; a failed open or read is reported and returned.
///
/// [`consume`]: StreamClient::consume
#[derive(Clone)]
pub struct StreamClient {
    provider: Arc<dyn Provider>,
}

impl StreamClient {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Open a stream and drive it to completion.
    pub async fn consume<H>(
        &self,
        request: &StreamRequest,
        handler: &mut H,
    ) -> error::Result<StreamResult>
    where
        H: StreamHandler + ?Sized,
    {
        self.consume_until(request, handler, futures::future::pending())
            .await
    }

    /// Like [`consume`](Self::consume), but stops when `cancel` resolves.
    ///
    /// Cancellation drops the underlying reader and reports
    /// [`KilnError::Aborted`] through `on_error`.
    pub async fn consume_until<H, C>(
        &self,
        request: &StreamRequest,
        handler: &mut H,
        cancel: C,
    ) -> error::Result<StreamResult>
    where
        H: StreamHandler + ?Sized,
        C: Future<Output = ()> + Send,
    {
        info!(
            provider = self.provider.name(),
            model = self.provider.model(),
            "Opening stream"
        );
        let frames = match self
            .provider
            .stream(&request.messages, &request.tools, &request.options)
            .await
        {
            Ok(frames) => frames,
            Err(e) => {
                warn!(provider = self.provider.name(), error = %e, "Failed to open stream");
                handler.on_error(&e).await;
                return Err(e);
            }
        };
        consume_frames(frames, handler, cancel).await
    }

    /// Consume a stream as a channel of [`ClientEvent`]s.
    ///
    /// The channel is bounded, so a slow reader slows consumption down.
    /// Dropping the returned stream cancels the underlying request.
    pub fn event_stream(&self, request: StreamRequest) -> ReceiverStream<ClientEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let client = self.clone();
        tokio::spawn(async move {
            let watcher = tx.clone();
            let mut handler = ChannelHandler { tx };
            let _ = client
                .consume_until(&request, &mut handler, async move { watcher.closed().await })
                .await;
        });
        ReceiverStream::new(rx)
    }
}

/// Drive an already-open frame stream through `handler`.
///
/// Frames are processed strictly in arrival order. Parse errors yielded by
/// the source are logged and skipped; any other error ends the stream.
pub async fn consume_frames<S, H, C>(
    mut frames: S,
    handler: &mut H,
    cancel: C,
) -> error::Result<StreamResult>
where
    S: Stream<Item = error::Result<StreamEvent>> + Unpin,
    H: StreamHandler + ?Sized,
    C: Future<Output = ()>,
{
    let mut state = StreamState::default();
    tokio::pin!(cancel);

    loop {
        let next = tokio::select! {
            biased;
            _ = &mut cancel => None,
            next = frames.next() => Some(next),
        };
        let Some(next) = next else {
            debug!("Stream cancelled");
            drop(frames);
            let err = KilnError::Aborted;
            handler.on_error(&err).await;
            return Err(err);
        };

        match next {
            Some(Ok(frame)) => {
                if state.apply(frame, handler).await {
                    if state.usage.is_none() {
                        state.usage = trailing_usage(&mut frames, cancel.as_mut()).await;
                    }
                    break;
                }
            }
            Some(Err(KilnError::Parse { message })) => {
                warn!(error = %message, "Skipping unparseable frame");
            }
            Some(Err(e)) => {
                warn!(error = %e, "Stream failed");
                handler.on_error(&e).await;
                return Err(e);
            }
            None => {
                debug!("Stream ended without a finish reason");
                break;
            }
        }
    }

    let result = state.finish();
    debug!(
        reasoning_len = result.reasoning.len(),
        content_len = result.content.len(),
        tool_calls = result.tool_calls.len(),
        "Stream complete"
    );
    handler.on_complete(&result).await;
    Ok(result)
}

/// Read past the finish frame for the usage chunk servers send last.
///
/// Nothing read here reaches the handler. Errors, cancellation and the end
/// of the stream all just stop the search.
async fn trailing_usage<S, C>(frames: &mut S, mut cancel: Pin<&mut C>) -> Option<Usage>
where
    S: Stream<Item = error::Result<StreamEvent>> + Unpin,
    C: Future<Output = ()>,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = &mut cancel => return None,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) if frame.usage.is_some() => return frame.usage,
            Some(Ok(_)) | Some(Err(KilnError::Parse { .. })) => continue,
            Some(Err(e)) => {
                debug!(error = %e, "Stream failed after finish, completing without usage");
                return None;
            }
            None => return None,
        }
    }
}

#[derive(Default)]
struct StreamState {
    reasoning: String,
    content: String,
    reasoning_started: bool,
    content_started: bool,
    tool_calls: ToolCallAccumulator,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
}

impl StreamState {
    /// Apply one frame; returns true once the stream is finished.
    async fn apply<H>(&mut self, frame: StreamEvent, handler: &mut H) -> bool
    where
        H: StreamHandler + ?Sized,
    {
        for delta in frame.deltas {
            match delta {
                Delta::Reasoning { text } => {
                    if text.is_empty() {
                        continue;
                    }
                    if !self.reasoning_started {
                        self.reasoning_started = true;
                        handler.on_reasoning_start().await;
                    }
                    self.reasoning.push_str(&text);
                    handler.on_reasoning(&text).await;
                }
                Delta::Content { text } => {
                    if text.is_empty() {
                        continue;
                    }
                    if !self.content_started {
                        self.content_started = true;
                        handler.on_content_start().await;
                    }
                    self.content.push_str(&text);
                    handler.on_content(&text).await;
                }
                Delta::ToolCall(fragment) => {
                    let snapshot = self.tool_calls.merge(fragment);
                    handler.on_tool_call(snapshot).await;
                }
            }
        }

        if frame.usage.is_some() {
            self.usage = frame.usage;
        }
        if frame.finished {
            self.finish_reason = frame.finish_reason;
        }
        frame.finished
    }

    fn finish(self) -> StreamResult {
        StreamResult {
            reasoning: self.reasoning,
            content: self.content,
            tool_calls: self.tool_calls.finish(),
            finish_reason: self.finish_reason,
            usage: self.usage,
        }
    }
}
