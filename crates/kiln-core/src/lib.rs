//! # Kiln Core
//!
//! Streaming tool-call client and sandboxed code execution for
//! code-generating agents.
//!
//! - [`streaming`] decodes a provider's chunked response, separates the
//!   reasoning, content and tool-call channels, and reassembles fragmented
//!   tool calls.
//! - [`code_execution`] validates, classifies and runs generated code in
//!   JavaScript, Python or shell backends under uniform time limits.
//! - [`agent`] composes both into generate / edit / debug / refactor /
//!   convert / test / review operations.

pub mod agent;
pub mod code_execution;
pub mod config;
pub mod error;
pub mod message;
pub mod provider;
pub mod streaming;
pub mod tool;

pub use agent::{CodeAgent, CodeAgentBuilder, CodeOutput, CodeTask, Session};
pub use code_execution::{
    CodeRuntime, ExecutionDispatcher, ExecutionRequest, ExecutionResult, Language,
    LanguageChoice, SandboxConfig, SandboxValidator,
};
pub use config::KilnConfig;
pub use error::KilnError;
pub use message::{Content, Message, Role, Usage};
pub use provider::{GenerateOptions, Provider, ProviderConfig};
pub use streaming::{
    AccumulatedToolCall, ClientEvent, StreamClient, StreamEvent, StreamHandler, StreamResult,
    ToolCallAccumulator,
};
pub use tool::{Tool, ToolChoice};
