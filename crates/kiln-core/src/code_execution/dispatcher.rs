use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::runtime::{JavaScriptRuntime, PythonRuntime, ShellRuntime};
use super::sandbox::SandboxValidator;
use super::{
    CodeRuntime, ExecutionConfig, ExecutionRequest, ExecutionResult, Language, LanguageChoice,
    LanguageDetector, SandboxConfig,
};
use crate::error::KilnError;
use crate::tool::Tool;

/// Routes execution requests to one runtime per language.
///
/// `execute` never fails: unknown languages, saturation errors and
/// timeouts all come back as failed [`ExecutionResult`]s. Shell requests
/// pass the dispatcher's [`SandboxValidator`] before any runtime sees
/// them, remote ones included. Concurrent
/// executions are bounded by a semaphore; the wall-clock limit starts
/// once a slot is acquired.
#[derive(Clone)]
pub struct ExecutionDispatcher {
    runtimes: BTreeMap<Language, Arc<dyn CodeRuntime>>,
    detector: LanguageDetector,
    validator: SandboxValidator,
    permits: Arc<Semaphore>,
    defaults: SandboxConfig,
}

impl ExecutionDispatcher {
    /// Create from an [`ExecutionConfig`], instantiating enabled local runtimes.
    pub fn new(config: ExecutionConfig) -> Self {
        let mut runtimes: BTreeMap<Language, Arc<dyn CodeRuntime>> = BTreeMap::new();

        if config.python {
            let interpreter = config.interpreter(Language::Python).unwrap_or("python3");
            runtimes.insert(
                Language::Python,
                Arc::new(PythonRuntime::with_interpreter(interpreter)),
            );
        }
        if config.javascript {
            let interpreter = config.interpreter(Language::JavaScript).unwrap_or("node");
            runtimes.insert(
                Language::JavaScript,
                Arc::new(JavaScriptRuntime::with_interpreter(interpreter)),
            );
        }
        if config.shell {
            let shell = config.interpreter(Language::Shell).unwrap_or("bash");
            runtimes.insert(Language::Shell, Arc::new(ShellRuntime::with_shell(shell)));
        }

        Self {
            runtimes,
            detector: LanguageDetector::new(),
            validator: SandboxValidator::new(),
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            defaults: SandboxConfig::default(),
        }
    }

    /// Dispatcher with no runtimes; add them with [`with_runtime`](Self::with_runtime).
    pub fn empty(max_concurrent: usize) -> Self {
        Self {
            runtimes: BTreeMap::new(),
            detector: LanguageDetector::new(),
            validator: SandboxValidator::new(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            defaults: SandboxConfig::default(),
        }
    }

    /// Register `runtime` for its language, replacing any previous one.
    pub fn with_runtime(mut self, runtime: Arc<dyn CodeRuntime>) -> Self {
        self.runtimes.insert(runtime.language(), runtime);
        self
    }

    /// Denylist applied to every shell request.
    pub fn with_validator(mut self, validator: SandboxValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Sandbox used by [`execute_code`](Self::execute_code) and the tool.
    pub fn with_default_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.defaults = sandbox;
        self
    }

    pub fn default_sandbox(&self) -> &SandboxConfig {
        &self.defaults
    }

    pub fn detect(&self, code: &str) -> Language {
        self.detector.detect(code)
    }

    pub fn languages(&self) -> impl Iterator<Item = Language> + '_ {
        self.runtimes.keys().copied()
    }

    /// Languages whose runtime reports itself available.
    pub async fn available_languages(&self) -> Vec<Language> {
        let checks = self.runtimes.iter().map(|(language, rt)| async move {
            rt.is_available().await.then_some(*language)
        });
        join_all(checks).await.into_iter().flatten().collect()
    }

    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let language = match request.language {
            LanguageChoice::Specific(language) => language,
            LanguageChoice::Auto => {
                let detected = self.detector.detect(&request.code);
                debug!(language = %detected, "Detected language");
                detected
            }
        };

        if language == Language::Shell
            && let Some(rejected) = self.validator.rejection(&request.code)
        {
            return rejected;
        }

        let queued = Instant::now();
        let Some(runtime) = self.runtimes.get(&language) else {
            return ExecutionResult::failure(
                language,
                format!("No runtime registered for {language}"),
                queued.elapsed(),
            );
        };

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return ExecutionResult::failure(
                    language,
                    "Execution dispatcher is shut down",
                    queued.elapsed(),
                );
            }
        };

        let limit = request.sandbox.timeout();
        let started = Instant::now();
        debug!(%language, runtime = runtime.name(), timeout_ms = request.sandbox.timeout_ms, "Executing");

        match tokio::time::timeout(limit, runtime.run(&request.code, &request.sandbox)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%language, timeout_ms = request.sandbox.timeout_ms, "Execution timed out");
                ExecutionResult::timeout(language, limit, started.elapsed())
            }
        }
    }

    /// Run `code` under the default sandbox.
    pub async fn execute_code(&self, code: &str, language: LanguageChoice) -> ExecutionResult {
        self.execute(ExecutionRequest {
            code: code.to_string(),
            language,
            sandbox: self.defaults.clone(),
        })
        .await
    }

    /// An `execute_code` tool a model can call; runs through this dispatcher
    /// with the default sandbox and returns the [`ExecutionResult`] as JSON.
    pub fn tool(&self) -> Tool {
        let languages: Vec<&str> = std::iter::once("auto")
            .chain(self.runtimes.keys().map(Language::as_str))
            .collect();
        let dispatcher = self.clone();

        Tool::builder(
            "execute_code",
            format!(
                "Execute code in a sandbox. Languages: {}. Returns stdout, stderr, exit_code and error.",
                languages[1..].join(", ")
            ),
        )
        .parameters_json(serde_json::json!({
            "type": "object",
            "properties": {
                "language": {
                    "type": "string",
                    "enum": languages,
                    "description": "Language of the code; omit or use \"auto\" to detect"
                },
                "code": {
                    "type": "string",
                    "description": "Source code to execute"
                }
            },
            "required": ["code"]
        }))
        .execute(move |args| {
            let dispatcher = dispatcher.clone();
            async move {
                let code = args
                    .get("code")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| KilnError::tool("execute_code", "Missing 'code' argument"))?;
                let language = match args.get("language").and_then(|v| v.as_str()) {
                    Some(tag) => tag
                        .parse::<LanguageChoice>()
                        .map_err(|e| KilnError::tool("execute_code", e.to_string()))?,
                    None => LanguageChoice::Auto,
                };

                let result = dispatcher.execute_code(code, language).await;
                serde_json::to_value(&result).map_err(|e| {
                    KilnError::tool("execute_code", format!("Serialize error: {e}"))
                })
            }
        })
        .build()
    }
}

impl Default for ExecutionDispatcher {
    fn default() -> Self {
        Self::new(ExecutionConfig::default())
    }
}

impl std::fmt::Debug for ExecutionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionDispatcher")
            .field("languages", &self.runtimes.keys().collect::<Vec<_>>())
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}
