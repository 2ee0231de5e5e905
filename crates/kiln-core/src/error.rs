use thiserror::Error;

/// Root error type for all Kiln operations.
///
/// Only [`KilnError::Transport`] and [`KilnError::Config`] escape the public
/// streaming and agent entry points. Failed executions are reported as
/// [`crate::code_execution::ExecutionResult`] values, never as errors.
#[derive(Error, Debug)]
pub enum KilnError {
    #[error("Transport error from '{provider}': {message}")]
    Transport {
        provider: String,
        message: String,
        status: Option<u16>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Schema validation error: {message}")]
    SchemaValidation { message: String },

    #[error("Tool error in '{tool_name}': {message}")]
    Tool { tool_name: String, message: String },

    #[error("Request aborted")]
    Aborted,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl KilnError {
    pub fn transport(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            provider: provider.into(),
            message: message.into(),
            status: None,
            source: None,
        }
    }

    pub fn transport_status(
        provider: impl Into<String>,
        status: u16,
        message: impl Into<String>,
    ) -> Self {
        Self::Transport {
            provider: provider.into(),
            message: message.into(),
            status: Some(status),
            source: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn tool(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool_name: name.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// HTTP status attached to a transport failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } => *status,
            _ => None,
        }
    }

    /// Whether an orchestrator may reasonably retry the failed call.
    ///
    /// Rate limits, server errors and connection/read failures (no status)
    /// are retryable. Client errors and configuration problems are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { status: None, .. } => true,
            Self::Transport {
                status: Some(s), ..
            } => *s == 429 || *s >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, KilnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(KilnError::transport("openai", "connection reset").is_retryable());
        assert!(KilnError::transport_status("openai", 429, "slow down").is_retryable());
        assert!(KilnError::transport_status("openai", 503, "unavailable").is_retryable());
        assert!(!KilnError::transport_status("openai", 401, "bad key").is_retryable());
        assert!(!KilnError::config("missing key").is_retryable());
        assert!(!KilnError::Aborted.is_retryable());
    }

    #[test]
    fn display_includes_provider() {
        let err = KilnError::transport_status("groq", 500, "boom");
        assert_eq!(err.to_string(), "Transport error from 'groq': boom");
        assert_eq!(err.status(), Some(500));
    }
}
