//! Sandboxed code execution.
//!
//! An [`ExecutionDispatcher`] routes an [`ExecutionRequest`] to one
//! [`CodeRuntime`] per [`Language`], detecting the language when asked to,
//! and always answers with a populated [`ExecutionResult`]. Failures of any
//! kind (rejected command, timeout, crash, spawn error) are data, never
//! errors.
//!
//! # Quick Start
//!
//! ```no_run
//! use kiln_core::code_execution::*;
//!
//! # async fn run() {
//! let dispatcher = ExecutionDispatcher::new(ExecutionConfig::default());
//! let result = dispatcher
//!     .execute(ExecutionRequest::new("print(1 + 1)"))
//!     .await;
//! assert_eq!(result.stdout.trim(), "2");
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::KilnError;

pub mod detect;
pub mod dispatcher;
pub mod remote;
pub mod runtime;
pub mod sandbox;

pub use detect::LanguageDetector;
pub use dispatcher::ExecutionDispatcher;
pub use remote::RemoteRuntime;
pub use runtime::{JavaScriptRuntime, PythonRuntime, ShellRuntime};
pub use sandbox::{SandboxValidator, read_only_supported};

/// Error string carried by every timed-out execution.
pub const TIMEOUT_ERROR: &str = "timeout";

// ─── Languages ─────────────────────────────────────────────────────

/// Execution target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    JavaScript,
    Python,
    Shell,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::JavaScript, Language::Python, Language::Shell];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::JavaScript => "javascript",
            Language::Python => "python",
            Language::Shell => "shell",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = KilnError;

    /// Accepts the canonical names plus common fence tags (`js`, `py`, `bash`, ..).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "javascript" | "js" | "node" | "nodejs" | "mjs" | "cjs" => Ok(Language::JavaScript),
            "python" | "py" | "python3" => Ok(Language::Python),
            "shell" | "sh" | "bash" | "zsh" | "console" => Ok(Language::Shell),
            other => Err(KilnError::config(format!("Unsupported language: {other}"))),
        }
    }
}

/// Language requested for an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LanguageChoice {
    /// Let the detector classify the code.
    #[default]
    Auto,
    Specific(Language),
}

impl From<Language> for LanguageChoice {
    fn from(language: Language) -> Self {
        LanguageChoice::Specific(language)
    }
}

impl FromStr for LanguageChoice {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(LanguageChoice::Auto)
        } else {
            s.parse().map(LanguageChoice::Specific)
        }
    }
}

// ─── Sandbox Configuration ─────────────────────────────────────────

/// Limits applied to one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Wall-clock limit from invocation to completion or forced termination.
    pub timeout_ms: u64,
    /// Address-space limit in MiB (0 = unlimited).
    pub max_memory_mb: u64,
    pub working_dir: Option<PathBuf>,
    /// Variables passed to the child. The host environment is not inherited.
    pub env: BTreeMap<String, String>,
    pub allow_network: bool,
    /// Deny filesystem writes. Enforced with Landlock; runs fail on hosts
    /// without it (see [`sandbox::read_only_supported`]).
    pub read_only: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_memory_mb: 0,
            working_dir: None,
            env: BTreeMap::new(),
            allow_network: false,
            read_only: true,
        }
    }
}

impl SandboxConfig {
    /// Strict preset: 10 s, 256 MiB, no network, read-only.
    pub fn strict() -> Self {
        Self {
            timeout_ms: 10_000,
            max_memory_mb: 256,
            ..Default::default()
        }
    }

    /// Permissive preset: network and writes allowed, no memory cap.
    pub fn permissive() -> Self {
        Self {
            allow_network: true,
            read_only: false,
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_network(mut self, allow: bool) -> Self {
        self.allow_network = allow;
        self
    }

    pub fn with_max_memory_mb(mut self, mb: u64) -> Self {
        self.max_memory_mb = mb;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

// ─── Requests and Results ──────────────────────────────────────────

/// One unit of work for the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: LanguageChoice,
    pub sandbox: SandboxConfig,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: LanguageChoice::Auto,
            sandbox: SandboxConfig::default(),
        }
    }

    pub fn language(mut self, language: impl Into<LanguageChoice>) -> Self {
        self.language = language.into();
        self
    }

    pub fn sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }
}

/// Outcome of an execution.
///
/// `exit_code == 0` exactly when the run succeeded, and `error` is set
/// exactly when it did not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub language: Language,
}

impl ExecutionResult {
    /// Result of a process that ran to completion. A process killed by a
    /// signal reports `-1`.
    pub fn completed(
        language: Language,
        stdout: String,
        stderr: String,
        exit_code: Option<i32>,
        duration: Duration,
    ) -> Self {
        let exit_code = exit_code.unwrap_or(-1);
        let error = (exit_code != 0).then(|| summarize_failure(&stderr, exit_code));
        Self {
            stdout,
            stderr,
            exit_code,
            duration_ms: duration.as_millis() as u64,
            error,
            language,
        }
    }

    /// Failure before or outside the program itself (rejection, spawn error,
    /// transport error). Nothing ran, or nothing trustworthy came back.
    pub fn failure(language: Language, error: impl Into<String>, duration: Duration) -> Self {
        let error = error.into();
        Self {
            stdout: String::new(),
            stderr: error.clone(),
            exit_code: 1,
            duration_ms: duration.as_millis() as u64,
            error: Some(error),
            language,
        }
    }

    /// Forced termination at the wall-clock limit. Output captured before
    /// the kill is not recoverable.
    pub fn timeout(language: Language, limit: Duration, elapsed: Duration) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("Execution timed out after {} ms", limit.as_millis()),
            exit_code: 1,
            duration_ms: elapsed.as_millis() as u64,
            error: Some(TIMEOUT_ERROR.to_string()),
            language,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn timed_out(&self) -> bool {
        self.error.as_deref() == Some(TIMEOUT_ERROR)
    }
}

/// Short description of a failed run: the last meaningful stderr line
/// (skipping stack frames), or the exit code.
fn summarize_failure(stderr: &str, exit_code: i32) -> String {
    stderr
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| !l.is_empty() && !l.starts_with("at ") && *l != "^")
        .map(str::to_string)
        .unwrap_or_else(|| {
            if exit_code < 0 {
                "terminated by signal".to_string()
            } else {
                format!("exited with code {exit_code}")
            }
        })
}

// ─── Runtime Trait ─────────────────────────────────────────────────

/// A backend able to run code of one language.
///
/// `run` never fails: every failure mode is encoded into the returned
/// [`ExecutionResult`].
#[async_trait]
pub trait CodeRuntime: Send + Sync {
    /// Runtime name (e.g., "python", "node", "bash", "remote").
    fn name(&self) -> &str;

    fn language(&self) -> Language;

    async fn run(&self, code: &str, config: &SandboxConfig) -> ExecutionResult;

    /// Check if this runtime can be used on this system.
    async fn is_available(&self) -> bool;
}

// ─── Dispatcher Configuration ──────────────────────────────────────

/// Which local runtimes the dispatcher creates, and how many executions
/// may run at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_concurrent: usize,
    pub python: bool,
    pub javascript: bool,
    pub shell: bool,
    /// Interpreter overrides keyed by language name ("python" → "/usr/bin/python3.12").
    pub interpreters: BTreeMap<String, String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            python: true,
            javascript: true,
            shell: true,
            interpreters: BTreeMap::new(),
        }
    }
}

impl ExecutionConfig {
    pub fn builder() -> ExecutionConfigBuilder {
        ExecutionConfigBuilder::default()
    }

    pub(crate) fn interpreter(&self, language: Language) -> Option<&str> {
        self.interpreters.get(language.as_str()).map(String::as_str)
    }
}

/// Builder for [`ExecutionConfig`].
#[derive(Debug, Default)]
pub struct ExecutionConfigBuilder {
    max_concurrent: Option<usize>,
    python: Option<bool>,
    javascript: Option<bool>,
    shell: Option<bool>,
    interpreters: BTreeMap<String, String>,
}

impl ExecutionConfigBuilder {
    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = Some(n);
        self
    }

    pub fn python(mut self, enabled: bool) -> Self {
        self.python = Some(enabled);
        self
    }

    pub fn javascript(mut self, enabled: bool) -> Self {
        self.javascript = Some(enabled);
        self
    }

    pub fn shell(mut self, enabled: bool) -> Self {
        self.shell = Some(enabled);
        self
    }

    pub fn interpreter(mut self, language: Language, path: impl Into<String>) -> Self {
        self.interpreters
            .insert(language.as_str().to_string(), path.into());
        self
    }

    pub fn build(self) -> ExecutionConfig {
        let defaults = ExecutionConfig::default();
        ExecutionConfig {
            max_concurrent: self.max_concurrent.unwrap_or(defaults.max_concurrent).max(1),
            python: self.python.unwrap_or(true),
            javascript: self.javascript.unwrap_or(true),
            shell: self.shell.unwrap_or(true),
            interpreters: self.interpreters,
        }
    }
}
