mod config;
mod init;

use async_trait::async_trait;
use clap::Parser;
use kiln_core::agent::{CodeAgent, CodeOutput, CodeTask};
use kiln_core::code_execution::{
    ExecutionRequest, ExecutionResult, Language, LanguageChoice, SandboxValidator,
    read_only_supported,
};
use kiln_core::provider::selector::EnvCredentials;
use kiln_core::streaming::{StreamHandler, StreamResult};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kiln", about = "Kiln: generate, stream and run code in a sandbox")]
struct Cli {
    /// Config file (default: kiln.yaml, kiln.yml, kiln.toml or kiln.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// More log output on stderr (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show version information
    Version,
    /// Write a starter config file into the current directory
    Init {
        /// yaml, toml or json
        #[arg(long, default_value = "yaml")]
        format: String,
        #[arg(long)]
        force: bool,
    },
    /// List execution runtimes and whether their interpreters are installed
    Runtimes,
    /// Print the detected language of a file (or stdin)
    Detect {
        /// Source file; `-` or omitted reads stdin
        file: Option<PathBuf>,
    },
    /// Check a shell command against the sandbox denylist
    Check {
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Execute code in the sandbox
    Exec {
        /// auto, python, javascript or shell
        #[arg(short, long, default_value = "auto")]
        language: String,
        /// Inline code instead of a file
        #[arg(short = 'e', long)]
        code: Option<String>,
        /// Wall-clock limit in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,
        /// Let the program reach the network
        #[arg(long)]
        allow_network: bool,
        /// Allow filesystem writes
        #[arg(long)]
        writable: bool,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
        /// Source file; `-` or omitted reads stdin
        file: Option<PathBuf>,
    },
    /// Ask the model to write, change or review code
    Generate {
        #[arg(short, long, value_enum, default_value_t = Operation::Generate)]
        op: Operation,
        /// Code to operate on (required for every operation except generate)
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Language of the code
        #[arg(short, long)]
        language: Option<String>,
        /// Run the generated code in the sandbox
        #[arg(long)]
        execute: bool,
        /// Stream output as it arrives
        #[arg(long, conflicts_with = "no_stream")]
        stream: bool,
        #[arg(long)]
        no_stream: bool,
        /// Task for generate, instructions for edit, the error for debug,
        /// the goal for refactor, the target for convert, the framework for tests
        #[arg(trailing_var_arg = true)]
        prompt: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Operation {
    Generate,
    Edit,
    Debug,
    Refactor,
    Convert,
    Tests,
    Review,
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let outcome = match cli.command {
        Commands::Version => {
            println!("kiln {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
        Commands::Init { format, force } => init::write_starter_config(&format, force).map(|_| 0),
        Commands::Runtimes => runtimes(cli.config.as_deref()).await,
        Commands::Detect { file } => detect(file.as_deref()),
        Commands::Check { command } => Ok(check(&command.join(" "))),
        Commands::Exec {
            language,
            code,
            timeout_ms,
            allow_network,
            writable,
            json,
            file,
        } => {
            let options = ExecOptions {
                timeout_ms,
                allow_network,
                writable,
                json,
            };
            exec(cli.config.as_deref(), &language, code, file.as_deref(), options).await
        }
        Commands::Generate {
            op,
            file,
            language,
            execute,
            stream,
            no_stream,
            prompt,
        } => {
            let input = GenerateInput {
                op,
                file,
                language,
                execute,
                stream: stream.then_some(true).or(no_stream.then_some(false)),
                prompt: prompt.join(" "),
            };
            generate(cli.config.as_deref(), input).await
        }
    };

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

// ─── Inputs ────────────────────────────────────────────────────────

fn read_source(file: Option<&Path>) -> Result<String, String> {
    match file {
        Some(path) if path != Path::new("-") => {
            std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))
        }
        _ => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| format!("stdin: {e}"))?;
            Ok(buf)
        }
    }
}

fn parse_language(tag: &str) -> Result<Language, String> {
    tag.parse().map_err(|e: kiln_core::KilnError| e.to_string())
}

/// Process exit status for an execution result.
fn exit_status(result: &ExecutionResult) -> i32 {
    match result.exit_code {
        0 => 0,
        code @ 1..=255 => code,
        _ => 1,
    }
}

// ─── Commands ──────────────────────────────────────────────────────

async fn runtimes(config_path: Option<&Path>) -> Result<i32, String> {
    let kiln = config::load(config_path)?;
    let dispatcher = kiln.dispatcher();
    let enabled: Vec<Language> = dispatcher.languages().collect();
    let available = dispatcher.available_languages().await;

    for language in Language::ALL {
        let state = if !enabled.contains(&language) {
            "disabled"
        } else if available.contains(&language) {
            "available"
        } else {
            "not installed"
        };
        println!("  {:<12} {state}", language.as_str());
    }
    let read_only = if read_only_supported() {
        "enforced"
    } else {
        "unavailable (use --writable or read_only: false)"
    };
    println!("  {:<12} {read_only}", "read-only");
    Ok(0)
}

fn detect(file: Option<&Path>) -> Result<i32, String> {
    let code = read_source(file)?;
    println!("{}", kiln_core::code_execution::detect::detect_language(&code));
    Ok(0)
}

fn check(command: &str) -> i32 {
    match SandboxValidator::new().first_violation(command) {
        Some(token) => {
            println!("rejected: contains '{}'", token.trim());
            1
        }
        None => {
            println!("ok");
            0
        }
    }
}

struct ExecOptions {
    timeout_ms: Option<u64>,
    allow_network: bool,
    writable: bool,
    json: bool,
}

async fn exec(
    config_path: Option<&Path>,
    language: &str,
    code: Option<String>,
    file: Option<&Path>,
    options: ExecOptions,
) -> Result<i32, String> {
    let kiln = config::load(config_path)?;
    let language: LanguageChoice = language
        .parse()
        .map_err(|e: kiln_core::KilnError| e.to_string())?;
    let code = match code {
        Some(code) => code,
        None => read_source(file)?,
    };

    let dispatcher = kiln.dispatcher();
    let mut sandbox = dispatcher.default_sandbox().clone();
    if let Some(ms) = options.timeout_ms {
        sandbox.timeout_ms = ms;
    }
    if options.allow_network {
        sandbox.allow_network = true;
    }
    if options.writable {
        sandbox.read_only = false;
    }

    let result = dispatcher
        .execute(ExecutionRequest::new(code).language(language).sandbox(sandbox))
        .await;

    if options.json {
        let out = serde_json::to_string_pretty(&result).map_err(|e| e.to_string())?;
        println!("{out}");
    } else {
        print_execution(&result);
    }
    Ok(exit_status(&result))
}

struct GenerateInput {
    op: Operation,
    file: Option<PathBuf>,
    language: Option<String>,
    execute: bool,
    stream: Option<bool>,
    prompt: String,
}

fn build_task(input: &GenerateInput) -> Result<CodeTask, String> {
    let code = match (input.op, &input.file) {
        (Operation::Generate, _) => String::new(),
        (_, Some(path)) => read_source(Some(path))?,
        (_, None) => return Err("--file is required for this operation".to_string()),
    };
    let text = (!input.prompt.trim().is_empty()).then(|| input.prompt.trim().to_string());

    let task = match input.op {
        Operation::Generate => {
            CodeTask::generate(text.ok_or("A prompt is required for generate")?)
        }
        Operation::Edit => CodeTask::edit(code, text.ok_or("Edit instructions are required")?),
        Operation::Debug => CodeTask::debug(code, text),
        Operation::Refactor => CodeTask::refactor(code, text),
        Operation::Convert => {
            CodeTask::convert(code, text.ok_or("A target language is required for convert")?)
        }
        Operation::Tests => CodeTask::tests(code, text),
        Operation::Review => CodeTask::review(code),
    };

    let task = match &input.language {
        Some(tag) => task.language(parse_language(tag)?),
        None => task,
    };
    Ok(task.execute(input.execute))
}

async fn generate(config_path: Option<&Path>, input: GenerateInput) -> Result<i32, String> {
    let kiln = config::load(config_path)?;
    let task = build_task(&input)?;

    let selector = kiln.selector(Arc::new(EnvCredentials));
    let mut builder = CodeAgent::from_selector(&selector)
        .map_err(|e| e.to_string())?
        .options(kiln.generate_options());
    if input.execute {
        builder = builder.dispatcher(kiln.dispatcher());
    }
    let agent = builder.build();

    let streaming = input.stream.unwrap_or(kiln.generation.stream);
    let output = if streaming {
        let mut handler = TerminalHandler::default();
        agent
            .run_streaming(task, &mut handler)
            .await
            .map_err(|e| e.to_string())?
    } else {
        let output = agent.run(task).await.map_err(|e| e.to_string())?;
        print_output(&output);
        output
    };

    for source in &output.sources {
        eprintln!("source: {source}");
    }
    match output.execution_result {
        Some(ref result) => {
            print_execution(result);
            Ok(exit_status(result))
        }
        None => Ok(0),
    }
}

// ─── Output ────────────────────────────────────────────────────────

fn print_output(output: &CodeOutput) {
    if let Some(ref reasoning) = output.reasoning {
        eprintln!("{reasoning}\n");
    }
    if !output.code.is_empty() {
        println!("{}", output.code);
    }
    if let Some(ref explanation) = output.explanation {
        if !output.code.is_empty() {
            println!();
        }
        println!("{explanation}");
    }
}

fn print_execution(result: &ExecutionResult) {
    eprintln!(
        "--- {} exited with {} in {} ms ---",
        result.language, result.exit_code, result.duration_ms
    );
    print!("{}", result.stdout);
    let _ = io::stdout().flush();
    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr);
    }
    if let Some(ref error) = result.error {
        eprintln!("error: {error}");
    }
}

/// Reasoning goes to stderr, content to stdout, both as it arrives.
#[derive(Default)]
struct TerminalHandler {
    reasoning_open: bool,
}

#[async_trait]
impl StreamHandler for TerminalHandler {
    async fn on_reasoning_start(&mut self) {
        self.reasoning_open = true;
    }

    async fn on_reasoning(&mut self, text: &str) {
        let mut err = io::stderr();
        let _ = write!(err, "{text}");
        let _ = err.flush();
    }

    async fn on_content_start(&mut self) {
        if std::mem::take(&mut self.reasoning_open) {
            eprintln!("\n");
        }
    }

    async fn on_content(&mut self, text: &str) {
        let mut out = io::stdout();
        let _ = write!(out, "{text}");
        let _ = out.flush();
    }

    async fn on_complete(&mut self, result: &StreamResult) {
        if !result.content.ends_with('\n') {
            println!();
        }
    }
}
