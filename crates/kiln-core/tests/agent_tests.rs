use async_trait::async_trait;
use kiln_core::agent::{CodeAgent, CodeTask, Session};
use kiln_core::code_execution::{
    CodeRuntime, ExecutionDispatcher, ExecutionResult, Language, SandboxConfig,
};
use kiln_core::error::{self, KilnError};
use kiln_core::message::{Content, Message, Role, Usage};
use kiln_core::provider::{
    BoxStream, FinishReason, GenerateOptions, GenerateResult, Provider,
};
use kiln_core::streaming::{Delta, StreamEvent, StreamHandler};
use kiln_core::tool::Tool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ─── Test Doubles ──────────────────────────────────────────────────

/// Replies with a fixed text and records every conversation it receives.
struct ScriptedProvider {
    reply: String,
    reasoning: Option<String>,
    citations: Vec<String>,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            reasoning: None,
            citations: Vec::new(),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn last_conversation(&self) -> Vec<Message> {
        self.seen.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-1"
    }

    async fn generate(
        &self,
        messages: &[Message],
        _tools: &[Tool],
        _options: &GenerateOptions,
    ) -> error::Result<GenerateResult> {
        self.seen.lock().unwrap().push(messages.to_vec());
        let mut content = Vec::new();
        if let Some(text) = &self.reasoning {
            content.push(Content::Reasoning { text: text.clone() });
        }
        content.push(Content::Text {
            text: self.reply.clone(),
        });
        Ok(GenerateResult {
            message: Message {
                role: Role::Assistant,
                content,
                name: None,
            },
            usage: Usage {
                input_tokens: 12,
                output_tokens: 30,
                reasoning_tokens: None,
            },
            finish_reason: FinishReason::Stop,
            citations: self.citations.clone(),
        })
    }

    async fn stream(
        &self,
        messages: &[Message],
        _tools: &[Tool],
        _options: &GenerateOptions,
    ) -> error::Result<BoxStream> {
        self.seen.lock().unwrap().push(messages.to_vec());
        let mut frames: Vec<error::Result<StreamEvent>> = Vec::new();
        if let Some(text) = &self.reasoning {
            frames.push(Ok(StreamEvent::with_deltas(vec![Delta::Reasoning {
                text: text.clone(),
            }])));
        }
        // Split the reply on line boundaries, as a model would trickle it out.
        for line in self.reply.split_inclusive('\n') {
            frames.push(Ok(StreamEvent::with_deltas(vec![Delta::Content {
                text: line.to_string(),
            }])));
        }
        frames.push(Ok(StreamEvent::finish(FinishReason::Stop)));
        Ok(Box::pin(futures::stream::iter(frames)))
    }
}

/// Records the code it is asked to run and echoes it back.
struct RecordingRuntime {
    language: Language,
    ran: Mutex<Vec<String>>,
}

impl RecordingRuntime {
    fn new(language: Language) -> Self {
        Self {
            language,
            ran: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CodeRuntime for RecordingRuntime {
    fn name(&self) -> &str {
        "recording"
    }
    fn language(&self) -> Language {
        self.language
    }
    async fn run(&self, code: &str, _config: &SandboxConfig) -> ExecutionResult {
        self.ran.lock().unwrap().push(code.to_string());
        ExecutionResult::completed(
            self.language,
            "ok\n".to_string(),
            String::new(),
            Some(0),
            Duration::from_millis(1),
        )
    }
    async fn is_available(&self) -> bool {
        true
    }
}

const PYTHON_REPLY: &str = "```python\ndef add(a, b):\n    return a + b\n```\n\nAdds two numbers.";

// ─── Operations ────────────────────────────────────────────────────

#[tokio::test]
async fn generate_extracts_code_and_explanation() {
    let provider = Arc::new(ScriptedProvider::new(PYTHON_REPLY));
    let agent = CodeAgent::builder(provider.clone()).build();

    let out = agent.generate_code("add two numbers").await.unwrap();

    assert_eq!(out.code, "def add(a, b):\n    return a + b");
    assert_eq!(out.language.as_deref(), Some("python"));
    assert_eq!(out.explanation.as_deref(), Some("Adds two numbers."));
    assert_eq!(out.execution_result, None);
    assert_eq!(out.usage.total_tokens(), 42);

    let conversation = provider.last_conversation();
    assert_eq!(conversation[0].role, Role::System);
    assert!(conversation[1].text_content().contains("add two numbers"));
}

#[tokio::test]
async fn reply_without_fence_is_taken_as_code() {
    let provider = Arc::new(ScriptedProvider::new("console.log('hi')\n"));
    let agent = CodeAgent::builder(provider).build();

    let out = agent
        .convert_code("print('hi')", "JavaScript")
        .await
        .unwrap();
    assert_eq!(out.code, "console.log('hi')");
    assert_eq!(out.explanation, None);
}

#[tokio::test]
async fn review_without_fence_is_explanation_only() {
    let provider = Arc::new(ScriptedProvider::new("Division by zero when b is 0."));
    let agent = CodeAgent::builder(provider).build();

    let out = agent.review_code("def f(a, b): return a / b").await.unwrap();
    assert!(out.code.is_empty());
    assert_eq!(out.explanation.as_deref(), Some("Division by zero when b is 0."));
}

#[tokio::test]
async fn every_operation_reaches_the_provider() {
    let provider = Arc::new(ScriptedProvider::new(PYTHON_REPLY));
    let agent = CodeAgent::builder(provider.clone()).build();

    agent.generate_code("p").await.unwrap();
    agent.edit_code("x = 1", "rename x to y").await.unwrap();
    agent.debug_code("x = 1 / 0", Some("ZeroDivisionError")).await.unwrap();
    agent.refactor_code("x = 1", None).await.unwrap();
    agent.convert_code("x = 1", "Rust").await.unwrap();
    agent.generate_tests("def f(): pass", Some("pytest")).await.unwrap();
    agent.review_code("x = 1").await.unwrap();

    assert_eq!(provider.calls(), 7);
    assert!(
        provider.last_conversation()[1]
            .text_content()
            .contains("Review this code")
    );
}

#[tokio::test]
async fn citations_become_sources_and_reasoning_is_kept() {
    let mut scripted = ScriptedProvider::new(PYTHON_REPLY);
    scripted.citations = vec!["https://docs.python.org/3/".into()];
    scripted.reasoning = Some("Simple addition.".into());
    let agent = CodeAgent::builder(Arc::new(scripted)).build();

    let out = agent.generate_code("add").await.unwrap();
    assert_eq!(out.sources, vec!["https://docs.python.org/3/".to_string()]);
    assert_eq!(out.reasoning.as_deref(), Some("Simple addition."));
}

// ─── Execution ─────────────────────────────────────────────────────

#[tokio::test]
async fn execute_without_dispatcher_fails_before_calling_provider() {
    let provider = Arc::new(ScriptedProvider::new(PYTHON_REPLY));
    let agent = CodeAgent::builder(provider.clone()).build();

    let err = agent
        .run(CodeTask::generate("add").execute(true))
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::Config { .. }));
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn generated_code_runs_in_fenced_language() {
    let runtime = Arc::new(RecordingRuntime::new(Language::Python));
    let dispatcher = ExecutionDispatcher::empty(1).with_runtime(runtime.clone());
    let agent = CodeAgent::builder(Arc::new(ScriptedProvider::new(PYTHON_REPLY)))
        .dispatcher(dispatcher)
        .build();

    let out = agent
        .run(CodeTask::generate("add").execute(true))
        .await
        .unwrap();

    let execution = out.execution_result.unwrap();
    assert!(execution.success());
    assert_eq!(execution.stdout, "ok\n");
    assert_eq!(
        runtime.ran.lock().unwrap().as_slice(),
        ["def add(a, b):\n    return a + b".to_string()]
    );
}

#[tokio::test]
async fn untagged_code_falls_back_to_task_language() {
    let runtime = Arc::new(RecordingRuntime::new(Language::Shell));
    let dispatcher = ExecutionDispatcher::empty(1).with_runtime(runtime.clone());
    let agent = CodeAgent::builder(Arc::new(ScriptedProvider::new("```\nls\n```")))
        .dispatcher(dispatcher)
        .build();

    let out = agent
        .run(
            CodeTask::generate("list files")
                .language(Language::Shell)
                .execute(true),
        )
        .await
        .unwrap();
    assert_eq!(out.execution_result.unwrap().language, Language::Shell);
    assert_eq!(runtime.ran.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn non_executable_fence_skips_execution() {
    let runtime = Arc::new(RecordingRuntime::new(Language::Python));
    let dispatcher = ExecutionDispatcher::empty(1).with_runtime(runtime.clone());
    let agent = CodeAgent::builder(Arc::new(ScriptedProvider::new(
        "```rust\nfn main() {}\n```",
    )))
    .dispatcher(dispatcher)
    .build();

    let out = agent
        .run(CodeTask::convert("print(1)", "Rust").execute(true))
        .await
        .unwrap();
    assert_eq!(out.code, "fn main() {}");
    assert_eq!(out.execution_result, None);
    assert!(runtime.ran.lock().unwrap().is_empty());
}

// ─── Sessions ──────────────────────────────────────────────────────

#[tokio::test]
async fn session_accumulates_history() {
    let provider = Arc::new(ScriptedProvider::new(PYTHON_REPLY));
    let session = Arc::new(tokio::sync::Mutex::new(Session::new()));
    let agent = CodeAgent::builder(provider.clone())
        .shared_session(session.clone())
        .build();

    agent.generate_code("add two numbers").await.unwrap();
    agent
        .edit_code("def add(a, b):\n    return a + b", "add type hints")
        .await
        .unwrap();

    // system + first user + first assistant + second user
    let second = provider.last_conversation();
    assert_eq!(second.len(), 4);
    assert_eq!(second[2].role, Role::Assistant);
    assert_eq!(second[2].text_content(), PYTHON_REPLY);

    let session = session.lock().await;
    assert_eq!(session.messages().len(), 4);
}

#[tokio::test]
async fn agents_without_session_are_stateless() {
    let provider = Arc::new(ScriptedProvider::new(PYTHON_REPLY));
    let agent = CodeAgent::builder(provider.clone()).build();

    agent.generate_code("one").await.unwrap();
    agent.generate_code("two").await.unwrap();
    assert_eq!(provider.last_conversation().len(), 2);
}

// ─── Streaming ─────────────────────────────────────────────────────

#[derive(Default)]
struct Collect {
    reasoning: String,
    content: String,
    completed: bool,
}

#[async_trait]
impl StreamHandler for Collect {
    async fn on_reasoning(&mut self, text: &str) {
        self.reasoning.push_str(text);
    }
    async fn on_content(&mut self, text: &str) {
        self.content.push_str(text);
    }
    async fn on_complete(&mut self, _result: &kiln_core::streaming::StreamResult) {
        self.completed = true;
    }
}

#[tokio::test]
async fn streaming_run_forwards_channels_and_extracts_code() {
    let mut scripted = ScriptedProvider::new(PYTHON_REPLY);
    scripted.reasoning = Some("Thinking.".into());
    let agent = CodeAgent::builder(Arc::new(scripted)).build();

    let mut handler = Collect::default();
    let out = agent
        .run_streaming(CodeTask::generate("add"), &mut handler)
        .await
        .unwrap();

    assert!(handler.completed);
    assert_eq!(handler.reasoning, "Thinking.");
    assert_eq!(handler.content, PYTHON_REPLY);
    assert_eq!(out.code, "def add(a, b):\n    return a + b");
    assert_eq!(out.reasoning.as_deref(), Some("Thinking."));
    assert!(out.sources.is_empty());
}
