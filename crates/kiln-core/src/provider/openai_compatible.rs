//! Presets for vendors exposing an OpenAI-compatible chat API.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{self, KilnError};
use crate::provider::ProviderConfig;
use crate::provider::openai::OpenAiProvider;

/// Vendor whose endpoint speaks the OpenAI chat wire shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    DeepSeek,
    Groq,
    OpenRouter,
    Ollama,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::OpenAi,
        ProviderKind::DeepSeek,
        ProviderKind::Groq,
        ProviderKind::OpenRouter,
        ProviderKind::Ollama,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Groq => "groq",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::Ollama => "ollama",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::DeepSeek => "https://api.deepseek.com/v1",
            ProviderKind::Groq => "https://api.groq.com/openai/v1",
            ProviderKind::OpenRouter => "https://openrouter.ai/api/v1",
            ProviderKind::Ollama => "http://localhost:11434/v1",
        }
    }

    /// Conventional credential variable, `None` for keyless local servers.
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("OPENAI_API_KEY"),
            ProviderKind::DeepSeek => Some("DEEPSEEK_API_KEY"),
            ProviderKind::Groq => Some("GROQ_API_KEY"),
            ProviderKind::OpenRouter => Some("OPENROUTER_API_KEY"),
            ProviderKind::Ollama => None,
        }
    }

    pub fn requires_api_key(&self) -> bool {
        self.api_key_env().is_some()
    }

    /// Model used when a `ProviderSpec` names none.
    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "gpt-4o-mini",
            ProviderKind::DeepSeek => "deepseek-chat",
            ProviderKind::Groq => "llama-3.3-70b-versatile",
            ProviderKind::OpenRouter => "openai/gpt-4o-mini",
            ProviderKind::Ollama => "llama3.2",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        ProviderKind::ALL
            .into_iter()
            .find(|k| k.as_str() == lower)
            .ok_or_else(|| KilnError::config(format!("Unknown provider kind: {s}")))
    }
}

/// Build an [`OpenAiProvider`] pointed at `kind`'s endpoint unless the
/// config already carries a base URL.
pub fn create_openai_compatible(
    kind: ProviderKind,
    model: impl Into<String>,
    mut config: ProviderConfig,
) -> error::Result<OpenAiProvider> {
    if config.base_url.is_none() {
        config.base_url = Some(kind.default_base_url().to_string());
    }
    Ok(OpenAiProvider::new(model, config)?.with_label(kind.as_str()))
}
