//! Declarative configuration from JSON, YAML or TOML.
//!
//! ```json
//! {
//!   "providers": [
//!     { "kind": "deepseek", "model": "deepseek-chat", "api_key": "${DEEPSEEK_API_KEY}" },
//!     { "kind": "ollama" }
//!   ],
//!   "sandbox": { "timeout_ms": 10000, "allow_network": false },
//!   "execution": { "max_concurrent": 2 },
//!   "generation": { "temperature": 0.2, "stream": true }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::code_execution::{ExecutionConfig, ExecutionDispatcher, SandboxConfig};
use crate::error::{self, KilnError};
use crate::provider::GenerateOptions;
use crate::provider::selector::{CredentialSource, ProviderSelector, ProviderSpec};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    /// Ordered provider-selection policy; the first resolvable entry wins.
    pub providers: Vec<ProviderSpec>,
    pub sandbox: SandboxConfig,
    pub execution: ExecutionConfig,
    pub generation: GenerationConfig,
}

/// Generation options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Use the streaming client instead of request/response calls.
    pub stream: bool,
}

impl KilnConfig {
    /// Parse from YAML string.
    #[cfg(feature = "config-yaml")]
    pub fn from_yaml(yaml: &str) -> error::Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| KilnError::config(format!("Invalid YAML config: {e}")))
    }

    /// Parse from TOML string.
    #[cfg(feature = "config-toml")]
    pub fn from_toml(toml: &str) -> error::Result<Self> {
        toml::from_str(toml).map_err(|e| KilnError::config(format!("Invalid TOML config: {e}")))
    }

    /// Parse from JSON string.
    pub fn from_json(json: &str) -> error::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| KilnError::config(format!("Invalid JSON config: {e}")))
    }

    /// Detect format from file extension and parse.
    pub fn from_file(path: impl AsRef<Path>) -> error::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            KilnError::config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            #[cfg(feature = "config-yaml")]
            Some("yaml" | "yml") => Self::from_yaml(&content),
            #[cfg(not(feature = "config-yaml"))]
            Some("yaml" | "yml") => Err(KilnError::config(
                "YAML config requires the 'config-yaml' feature",
            )),
            #[cfg(feature = "config-toml")]
            Some("toml") => Self::from_toml(&content),
            #[cfg(not(feature = "config-toml"))]
            Some("toml") => Err(KilnError::config(
                "TOML config requires the 'config-toml' feature",
            )),
            _ => Self::from_json(&content),
        }
    }

    /// Selection policy over `providers`, resolving `${VAR}` references
    /// through `credentials`.
    pub fn selector(&self, credentials: Arc<dyn CredentialSource>) -> ProviderSelector {
        ProviderSelector::new(self.providers.clone(), credentials)
    }

    /// Dispatcher for the `execution` section with `sandbox` as its default.
    pub fn dispatcher(&self) -> ExecutionDispatcher {
        ExecutionDispatcher::new(self.execution.clone()).with_default_sandbox(self.sandbox.clone())
    }

    /// Build generation options from config.
    pub fn generate_options(&self) -> GenerateOptions {
        GenerateOptions {
            temperature: self.generation.temperature,
            max_tokens: self.generation.max_tokens,
            ..Default::default()
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> error::Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| KilnError::config(format!("Failed to serialize config: {e}")))
    }
}
