//! Code generation orchestrator.
//!
//! [`CodeAgent`] turns a [`CodeTask`] into one upstream generation call
//! (request/response or streamed), extracts the code from the reply and,
//! when asked, runs it through an [`ExecutionDispatcher`].

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::code_execution::{
    ExecutionDispatcher, ExecutionRequest, ExecutionResult, Language, LanguageChoice,
    SandboxConfig,
};
use crate::error::{self, KilnError};
use crate::message::{Message, Usage};
use crate::provider::selector::ProviderSelector;
use crate::provider::{GenerateOptions, Provider, ReasoningEffort};
use crate::streaming::{StreamClient, StreamHandler, StreamRequest};

// ─── Tasks ─────────────────────────────────────────────────────────

/// What the agent is asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeOperation {
    Generate { prompt: String },
    Edit { code: String, instructions: String },
    Debug { code: String, error: Option<String> },
    Refactor { code: String, goal: Option<String> },
    /// `target` is a free-form language name; only supported languages can
    /// be executed afterwards.
    Convert { code: String, target: String },
    GenerateTests { code: String, framework: Option<String> },
    Review { code: String },
}

impl CodeOperation {
    pub fn name(&self) -> &'static str {
        match self {
            CodeOperation::Generate { .. } => "generate",
            CodeOperation::Edit { .. } => "edit",
            CodeOperation::Debug { .. } => "debug",
            CodeOperation::Refactor { .. } => "refactor",
            CodeOperation::Convert { .. } => "convert",
            CodeOperation::GenerateTests { .. } => "generate_tests",
            CodeOperation::Review { .. } => "review",
        }
    }

    /// Whether the reply is expected to be mainly code.
    fn expects_code(&self) -> bool {
        !matches!(self, CodeOperation::Review { .. })
    }
}

/// One request to a [`CodeAgent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeTask {
    pub operation: CodeOperation,
    /// Language of the input code, or of the code to write.
    pub language: Option<Language>,
    /// Run the extracted code in the sandbox.
    pub execute: bool,
}

impl CodeTask {
    pub fn new(operation: CodeOperation) -> Self {
        Self {
            operation,
            language: None,
            execute: false,
        }
    }

    pub fn generate(prompt: impl Into<String>) -> Self {
        Self::new(CodeOperation::Generate {
            prompt: prompt.into(),
        })
    }

    pub fn edit(code: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self::new(CodeOperation::Edit {
            code: code.into(),
            instructions: instructions.into(),
        })
    }

    pub fn debug(code: impl Into<String>, error: Option<String>) -> Self {
        Self::new(CodeOperation::Debug {
            code: code.into(),
            error,
        })
    }

    pub fn refactor(code: impl Into<String>, goal: Option<String>) -> Self {
        Self::new(CodeOperation::Refactor {
            code: code.into(),
            goal,
        })
    }

    pub fn convert(code: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(CodeOperation::Convert {
            code: code.into(),
            target: target.into(),
        })
    }

    pub fn tests(code: impl Into<String>, framework: Option<String>) -> Self {
        Self::new(CodeOperation::GenerateTests {
            code: code.into(),
            framework,
        })
    }

    pub fn review(code: impl Into<String>) -> Self {
        Self::new(CodeOperation::Review { code: code.into() })
    }

    pub fn language(mut self, language: Language) -> Self {
        self.language = Some(language);
        self
    }

    pub fn execute(mut self, execute: bool) -> Self {
        self.execute = execute;
        self
    }
}

/// Result of a [`CodeAgent`] operation.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeOutput {
    pub code: String,
    pub explanation: Option<String>,
    /// Fence tag of the extracted block (`python`, `js`, ..).
    pub language: Option<String>,
    pub execution_result: Option<ExecutionResult>,
    pub sources: Vec<String>,
    pub reasoning: Option<String>,
    pub usage: Usage,
}

// ─── Sessions ──────────────────────────────────────────────────────

/// Conversation kept across agent calls, so edits build on earlier turns.
#[derive(Debug, Clone)]
pub struct Session {
    id: Uuid,
    messages: Vec<Message>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            messages: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Prompts ───────────────────────────────────────────────────────

const SYSTEM_PROMPT: &str = "You are an expert software engineer. \
Reply with exactly one fenced code block holding the complete code, tagged with its language, \
followed by a short plain-text explanation. Do not split the code across several blocks.";

const REVIEW_SYSTEM_PROMPT: &str = "You are an expert code reviewer. \
Reply with a concise review: correctness problems first, then security, then style. \
If you propose a corrected version, give it as one fenced code block tagged with its language.";

fn language_hint(language: Option<Language>) -> String {
    language
        .map(|l| format!(" in {l}"))
        .unwrap_or_default()
}

fn fenced(code: &str, language: Option<Language>) -> String {
    let tag = language.map(|l| l.as_str()).unwrap_or_default();
    format!("```{tag}\n{}\n```", code.trim_end())
}

pub(crate) fn build_prompt(task: &CodeTask) -> (&'static str, String) {
    let lang = task.language;
    match &task.operation {
        CodeOperation::Generate { prompt } => (
            SYSTEM_PROMPT,
            format!("Write code{}.\n\nTask:\n{prompt}", language_hint(lang)),
        ),
        CodeOperation::Edit { code, instructions } => (
            SYSTEM_PROMPT,
            format!(
                "Apply the following change and return the full updated code.\n\nChange:\n{instructions}\n\nCode:\n{}",
                fenced(code, lang)
            ),
        ),
        CodeOperation::Debug { code, error } => {
            let error = error
                .as_deref()
                .map(|e| format!("\n\nObserved error:\n{e}"))
                .unwrap_or_default();
            (
                SYSTEM_PROMPT,
                format!(
                    "Find and fix the bug. Return the full corrected code and explain the cause.{error}\n\nCode:\n{}",
                    fenced(code, lang)
                ),
            )
        }
        CodeOperation::Refactor { code, goal } => {
            let goal = goal
                .as_deref()
                .map(|g| format!(" Goal: {g}."))
                .unwrap_or_default();
            (
                SYSTEM_PROMPT,
                format!(
                    "Refactor this code without changing its behavior.{goal}\n\nCode:\n{}",
                    fenced(code, lang)
                ),
            )
        }
        CodeOperation::Convert { code, target } => (
            SYSTEM_PROMPT,
            format!(
                "Convert this code to {target}, keeping its behavior.\n\nCode:\n{}",
                fenced(code, lang)
            ),
        ),
        CodeOperation::GenerateTests { code, framework } => {
            let framework = framework
                .as_deref()
                .map(|f| format!(" using {f}"))
                .unwrap_or_default();
            (
                SYSTEM_PROMPT,
                format!(
                    "Write unit tests{framework} covering normal cases and edge cases.\n\nCode:\n{}",
                    fenced(code, lang)
                ),
            )
        }
        CodeOperation::Review { code } => (
            REVIEW_SYSTEM_PROMPT,
            format!("Review this code.\n\nCode:\n{}", fenced(code, lang)),
        ),
    }
}

// ─── Reply Parsing ─────────────────────────────────────────────────

/// A reply split into its first fenced block and the remaining prose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedCode {
    pub code: Option<String>,
    pub language: Option<String>,
    pub prose: String,
}

/// Split `text` into its first fenced code block and everything else.
///
/// An unterminated block runs to the end of the text.
pub fn extract_code(text: &str) -> ExtractedCode {
    let mut prose: Vec<&str> = Vec::new();
    let mut code: Vec<&str> = Vec::new();
    let mut language = None;
    let mut found = false;
    let mut in_block = false;
    let mut fence = "";

    for line in text.lines() {
        let trimmed = line.trim_start();
        if in_block {
            if trimmed.starts_with(fence) && trimmed[fence.len()..].trim().is_empty() {
                in_block = false;
            } else {
                code.push(line);
            }
            continue;
        }
        if !found && (trimmed.starts_with("```") || trimmed.starts_with("~~~")) {
            fence = if trimmed.starts_with("```") { "```" } else { "~~~" };
            let info = trimmed.trim_start_matches(fence.chars().next().unwrap_or('`')).trim();
            language = info
                .split_whitespace()
                .next()
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            found = true;
            in_block = true;
            continue;
        }
        prose.push(line);
    }

    ExtractedCode {
        code: found.then(|| code.join("\n")),
        language,
        prose: prose.join("\n").trim().to_string(),
    }
}

// ─── Agent ─────────────────────────────────────────────────────────

/// Orchestrates generation and optional sandboxed execution.
pub struct CodeAgent {
    provider: Arc<dyn Provider>,
    dispatcher: Option<ExecutionDispatcher>,
    sandbox: SandboxConfig,
    options: GenerateOptions,
    session: Option<Arc<Mutex<Session>>>,
}

impl CodeAgent {
    pub fn builder(provider: Arc<dyn Provider>) -> CodeAgentBuilder {
        CodeAgentBuilder {
            provider,
            dispatcher: None,
            sandbox: None,
            options: GenerateOptions::default(),
            session: None,
        }
    }

    /// Builder whose provider comes from `selector`. Fails without network
    /// activity when no provider can be built.
    pub fn from_selector(selector: &ProviderSelector) -> error::Result<CodeAgentBuilder> {
        Ok(Self::builder(selector.select()?))
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn session(&self) -> Option<&Arc<Mutex<Session>>> {
        self.session.as_ref()
    }

    pub async fn generate_code(&self, prompt: &str) -> error::Result<CodeOutput> {
        self.run(CodeTask::generate(prompt)).await
    }

    pub async fn edit_code(&self, code: &str, instructions: &str) -> error::Result<CodeOutput> {
        self.run(CodeTask::edit(code, instructions)).await
    }

    pub async fn debug_code(&self, code: &str, error: Option<&str>) -> error::Result<CodeOutput> {
        self.run(CodeTask::debug(code, error.map(str::to_string)))
            .await
    }

    pub async fn refactor_code(&self, code: &str, goal: Option<&str>) -> error::Result<CodeOutput> {
        self.run(CodeTask::refactor(code, goal.map(str::to_string)))
            .await
    }

    pub async fn convert_code(&self, code: &str, target: &str) -> error::Result<CodeOutput> {
        self.run(CodeTask::convert(code, target)).await
    }

    pub async fn generate_tests(
        &self,
        code: &str,
        framework: Option<&str>,
    ) -> error::Result<CodeOutput> {
        self.run(CodeTask::tests(code, framework.map(str::to_string)))
            .await
    }

    pub async fn review_code(&self, code: &str) -> error::Result<CodeOutput> {
        self.run(CodeTask::review(code)).await
    }

    /// Run `task` with a single request/response generation.
    pub async fn run(&self, task: CodeTask) -> error::Result<CodeOutput> {
        self.check_execution(&task)?;
        let mut session = self.lock_session().await;
        let (messages, user) = self.messages_for(&task, session.as_deref());

        info!(
            operation = task.operation.name(),
            provider = self.provider.name(),
            "Running code task"
        );
        let result = self
            .provider
            .generate(&messages, &[], &self.options)
            .await?;

        let text = result.text();
        if let Some(session) = session.as_deref_mut() {
            session.messages.push(user);
            session.messages.push(Message::assistant(text.clone()));
        }
        drop(session);

        let reasoning = result.reasoning().map(str::to_string);
        self.finish(&task, &text, reasoning, result.citations, result.usage)
            .await
    }

    /// Run `task` over a stream, forwarding every channel to `handler`.
    pub async fn run_streaming<H>(&self, task: CodeTask, handler: &mut H) -> error::Result<CodeOutput>
    where
        H: StreamHandler + ?Sized,
    {
        self.check_execution(&task)?;
        let mut session = self.lock_session().await;
        let (messages, user) = self.messages_for(&task, session.as_deref());

        info!(
            operation = task.operation.name(),
            provider = self.provider.name(),
            "Streaming code task"
        );
        let request = StreamRequest::new(messages).options(self.options.clone());
        let result = StreamClient::new(self.provider.clone())
            .consume(&request, handler)
            .await?;

        if let Some(session) = session.as_deref_mut() {
            session.messages.push(user);
            session
                .messages
                .push(Message::assistant(result.content.clone()));
        }
        drop(session);

        let reasoning = (!result.reasoning.is_empty()).then(|| result.reasoning.clone());
        self.finish(
            &task,
            &result.content,
            reasoning,
            Vec::new(),
            result.usage.unwrap_or_default(),
        )
        .await
    }

    fn check_execution(&self, task: &CodeTask) -> error::Result<()> {
        if task.execute && self.dispatcher.is_none() {
            return Err(KilnError::config(
                "Execution requested but the agent has no execution dispatcher",
            ));
        }
        Ok(())
    }

    async fn lock_session(&self) -> Option<tokio::sync::MutexGuard<'_, Session>> {
        match &self.session {
            Some(session) => Some(session.lock().await),
            None => None,
        }
    }

    fn messages_for(&self, task: &CodeTask, session: Option<&Session>) -> (Vec<Message>, Message) {
        let (system, prompt) = build_prompt(task);
        let user = Message::user(prompt);

        let mut messages = vec![Message::system(system)];
        if let Some(session) = session {
            messages.extend(session.messages.iter().cloned());
        }
        messages.push(user.clone());
        (messages, user)
    }

    async fn finish(
        &self,
        task: &CodeTask,
        text: &str,
        reasoning: Option<String>,
        sources: Vec<String>,
        usage: Usage,
    ) -> error::Result<CodeOutput> {
        let extracted = extract_code(text);
        let explanation = (!extracted.prose.is_empty()).then_some(extracted.prose);

        let (code, explanation) = match extracted.code {
            Some(code) => (code, explanation),
            // No fence: take the whole reply as code when code was asked for.
            None if task.operation.expects_code() => (text.trim().to_string(), None),
            None => (String::new(), explanation),
        };

        let execution_result = if task.execute && !code.trim().is_empty() {
            self.execute(task, &code, extracted.language.as_deref()).await
        } else {
            None
        };

        Ok(CodeOutput {
            code,
            explanation,
            language: extracted.language,
            execution_result,
            sources,
            reasoning,
            usage,
        })
    }

    async fn execute(
        &self,
        task: &CodeTask,
        code: &str,
        fence_tag: Option<&str>,
    ) -> Option<ExecutionResult> {
        let dispatcher = self.dispatcher.as_ref()?;

        let language = match (fence_tag, &task.operation) {
            (Some(tag), _) => match tag.parse::<Language>() {
                Ok(language) => LanguageChoice::Specific(language),
                Err(_) => {
                    warn!(language = tag, "Generated code is not in an executable language");
                    return None;
                }
            },
            (None, CodeOperation::Convert { target, .. }) => match target.parse::<Language>() {
                Ok(language) => LanguageChoice::Specific(language),
                Err(_) => {
                    warn!(language = %target, "Conversion target is not executable");
                    return None;
                }
            },
            (None, _) => task
                .language
                .map(LanguageChoice::Specific)
                .unwrap_or(LanguageChoice::Auto),
        };

        debug!(?language, "Executing generated code");
        let request = ExecutionRequest::new(code)
            .language(language)
            .sandbox(self.sandbox.clone());
        Some(dispatcher.execute(request).await)
    }
}

/// Builder for constructing [`CodeAgent`] instances.
pub struct CodeAgentBuilder {
    provider: Arc<dyn Provider>,
    dispatcher: Option<ExecutionDispatcher>,
    sandbox: Option<SandboxConfig>,
    options: GenerateOptions,
    session: Option<Arc<Mutex<Session>>>,
}

impl CodeAgentBuilder {
    pub fn dispatcher(mut self, dispatcher: ExecutionDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Sandbox for executions; defaults to the dispatcher's default sandbox.
    pub fn sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn temperature(mut self, temp: f64) -> Self {
        self.options.temperature = Some(temp);
        self
    }

    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.options.max_tokens = Some(tokens);
        self
    }

    pub fn reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.options.reasoning_effort = Some(effort);
        self
    }

    pub fn session(mut self, session: Session) -> Self {
        self.session = Some(Arc::new(Mutex::new(session)));
        self
    }

    /// Share a session handle with other agents.
    pub fn shared_session(mut self, session: Arc<Mutex<Session>>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn build(self) -> CodeAgent {
        let sandbox = self.sandbox.unwrap_or_else(|| {
            self.dispatcher
                .as_ref()
                .map(|d| d.default_sandbox().clone())
                .unwrap_or_default()
        });
        CodeAgent {
            provider: self.provider,
            dispatcher: self.dispatcher,
            sandbox,
            options: self.options,
            session: self.session,
        }
    }
}
