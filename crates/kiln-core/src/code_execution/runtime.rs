//! Local subprocess runtimes.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::sandbox::{ProcessGroupGuard, SandboxValidator, sandboxed_command};
use super::{CodeRuntime, ExecutionResult, Language, SandboxConfig};

// ─── Python Runtime ────────────────────────────────────────────────

/// Runs Python in an isolated-mode interpreter; the program is read from stdin.
pub struct PythonRuntime {
    interpreter: String,
}

impl PythonRuntime {
    pub fn new() -> Self {
        Self::with_interpreter("python3")
    }

    pub fn with_interpreter(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

impl Default for PythonRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CodeRuntime for PythonRuntime {
    fn name(&self) -> &str {
        "python"
    }

    fn language(&self) -> Language {
        Language::Python
    }

    async fn run(&self, code: &str, config: &SandboxConfig) -> ExecutionResult {
        let args = ["-I".to_string(), "-".to_string()];
        match sandboxed_command(&self.interpreter, &args, config, true) {
            Ok(cmd) => run_subprocess(cmd, Some(code), config.timeout(), Language::Python).await,
            Err(e) => ExecutionResult::failure(Language::Python, e, Duration::ZERO),
        }
    }

    async fn is_available(&self) -> bool {
        check_command(&self.interpreter, &["--version"]).await
    }
}

// ─── JavaScript Runtime ────────────────────────────────────────────

/// Exit code the wrapper uses when the vm-level timeout fires.
const VM_TIMEOUT_EXIT: i32 = 124;

/// Node entry script: reads the program from stdin and evaluates it in a
/// fresh `vm` context that has no `require`, `process` or host globals
/// beyond a console and timers.
const VM_WRAPPER: &str = r#"
const vm = require('node:vm');
const util = require('node:util');
const chunks = [];
process.stdin.on('data', (c) => chunks.push(c));
process.stdin.on('end', async () => {
  const code = Buffer.concat(chunks).toString('utf8');
  const timeout = Number(process.env.KILN_VM_TIMEOUT_MS) || undefined;
  const fmt = (args) =>
    args.map((a) => (typeof a === 'string' ? a : util.inspect(a))).join(' ') + '\n';
  const out = (...a) => { process.stdout.write(fmt(a)); };
  const err = (...a) => { process.stderr.write(fmt(a)); };
  const fail = (e) => {
    process.stderr.write(String((e && e.stack) || e) + '\n');
    process.exitCode = 1;
  };
  process.on('unhandledRejection', fail);
  const context = vm.createContext(
    {
      console: { log: out, info: out, debug: out, warn: err, error: err },
      setTimeout, clearTimeout, setInterval, clearInterval, queueMicrotask,
    },
    { codeGeneration: { strings: false, wasm: false } },
  );
  try {
    const result = vm.runInContext(code, context, { filename: 'main.js', timeout });
    if (result && typeof result.then === 'function') await result;
  } catch (e) {
    if (e && e.code === 'ERR_SCRIPT_EXECUTION_TIMEOUT') {
      process.stderr.write(String(e.message) + '\n');
      process.exit(124);
    }
    fail(e);
  }
});
"#;

/// Runs JavaScript through Node inside a `node:vm` context.
pub struct JavaScriptRuntime {
    interpreter: String,
}

impl JavaScriptRuntime {
    pub fn new() -> Self {
        Self::with_interpreter("node")
    }

    pub fn with_interpreter(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

impl Default for JavaScriptRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CodeRuntime for JavaScriptRuntime {
    fn name(&self) -> &str {
        "node"
    }

    fn language(&self) -> Language {
        Language::JavaScript
    }

    async fn run(&self, code: &str, config: &SandboxConfig) -> ExecutionResult {
        let mut args = vec!["--disallow-code-generation-from-strings".to_string()];
        // V8 reserves far more address space than it uses, so the heap
        // limit replaces `ulimit -v` here.
        if config.max_memory_mb > 0 {
            args.push(format!("--max-old-space-size={}", config.max_memory_mb));
        }
        args.push("-e".to_string());
        args.push(VM_WRAPPER.to_string());

        let mut cmd = match sandboxed_command(&self.interpreter, &args, config, false) {
            Ok(cmd) => cmd,
            Err(e) => return ExecutionResult::failure(Language::JavaScript, e, Duration::ZERO),
        };
        cmd.env("KILN_VM_TIMEOUT_MS", config.timeout_ms.to_string());

        let result =
            run_subprocess(cmd, Some(code), config.timeout(), Language::JavaScript).await;
        if result.exit_code == VM_TIMEOUT_EXIT {
            return ExecutionResult {
                stdout: result.stdout,
                ..ExecutionResult::timeout(
                    Language::JavaScript,
                    config.timeout(),
                    Duration::from_millis(result.duration_ms),
                )
            };
        }
        result
    }

    async fn is_available(&self) -> bool {
        check_command(&self.interpreter, &["--version"]).await
    }
}

// ─── Shell Runtime ─────────────────────────────────────────────────

/// Runs shell scripts after a [`SandboxValidator`] check.
pub struct ShellRuntime {
    shell: String,
    validator: SandboxValidator,
}

impl ShellRuntime {
    pub fn new() -> Self {
        Self::with_shell("bash")
    }

    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            validator: SandboxValidator::new(),
        }
    }

    pub fn with_validator(mut self, validator: SandboxValidator) -> Self {
        self.validator = validator;
        self
    }
}

impl Default for ShellRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CodeRuntime for ShellRuntime {
    fn name(&self) -> &str {
        &self.shell
    }

    fn language(&self) -> Language {
        Language::Shell
    }

    async fn run(&self, code: &str, config: &SandboxConfig) -> ExecutionResult {
        if let Some(rejected) = self.validator.rejection(code) {
            return rejected;
        }

        let args = ["-c".to_string(), code.to_string()];
        match sandboxed_command(&self.shell, &args, config, true) {
            Ok(cmd) => run_subprocess(cmd, None, config.timeout(), Language::Shell).await,
            Err(e) => ExecutionResult::failure(Language::Shell, e, Duration::ZERO),
        }
    }

    async fn is_available(&self) -> bool {
        check_command(&self.shell, &["-c", "exit 0"]).await
    }
}

// ─── Subprocess Execution ──────────────────────────────────────────

/// Spawn `cmd`, feed `stdin`, and wait at most `limit`.
///
/// On timeout, or when this future is dropped, the child's process group is
/// killed.
pub(crate) async fn run_subprocess(
    mut cmd: tokio::process::Command,
    stdin: Option<&str>,
    limit: Duration,
    language: Language,
) -> ExecutionResult {
    let started = Instant::now();
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(%language, error = %e, "Failed to spawn process");
            return ExecutionResult::failure(
                language,
                format!("Failed to spawn process: {e}"),
                started.elapsed(),
            );
        }
    };
    debug!(%language, pid = ?child.id(), "Process spawned");
    let _group = ProcessGroupGuard::new(child.id());

    let input = stdin.map(str::to_owned);
    let pipe = child.stdin.take();
    let run = async move {
        if let (Some(mut pipe), Some(input)) = (pipe, input) {
            // The child may exit without reading; its output still counts.
            if let Err(e) = pipe.write_all(input.as_bytes()).await {
                debug!(error = %e, "Child closed stdin early");
            }
        }
        child.wait_with_output().await
    };

    match tokio::time::timeout(limit, run).await {
        Ok(Ok(output)) => {
            let result = ExecutionResult::completed(
                language,
                String::from_utf8_lossy(&output.stdout).into_owned(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
                output.status.code(),
                started.elapsed(),
            );
            debug!(
                %language,
                exit_code = result.exit_code,
                duration_ms = result.duration_ms,
                "Process finished"
            );
            result
        }
        Ok(Err(e)) => ExecutionResult::failure(
            language,
            format!("Execution error: {e}"),
            started.elapsed(),
        ),
        Err(_) => {
            warn!(%language, timeout_ms = limit.as_millis() as u64, "Execution timed out");
            ExecutionResult::timeout(language, limit, started.elapsed())
        }
    }
}

async fn check_command(program: &str, args: &[&str]) -> bool {
    tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}
