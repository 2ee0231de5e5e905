//! Explicit, ordered provider selection.
//!
//! The selector is handed an ordered list of [`ProviderSpec`]s and a
//! [`CredentialSource`]; it builds the first entry whose credentials resolve.
//! Nothing here reads the process environment unless the caller injects
//! [`EnvCredentials`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{self, KilnError};
use crate::provider::openai_compatible::{ProviderKind, create_openai_compatible};
use crate::provider::retry::{RetryConfig, RetryProvider};
use crate::provider::{Provider, ProviderConfig};

/// Lookup for named secrets.
pub trait CredentialSource: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

/// Reads credentials from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Fixed in-memory credentials.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    values: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl CredentialSource for StaticCredentials {
    fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// Resolve a `${VAR}` reference through `credentials`; other values pass
/// through unchanged. Empty results count as unresolved.
pub fn resolve_value(value: &str, credentials: &dyn CredentialSource) -> Option<String> {
    let resolved = if let Some(stripped) = value.strip_prefix("${")
        && let Some(var_name) = stripped.strip_suffix('}')
    {
        credentials.get(var_name)?
    } else {
        value.to_string()
    };
    (!resolved.is_empty()).then_some(resolved)
}

/// One candidate in the selection policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub kind: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Literal key or `${VAR}` reference. Falls back to the kind's
    /// conventional variable when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl ProviderSpec {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            model: None,
            api_key: None,
            base_url: None,
            timeout_ms: None,
            max_retries: None,
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }
}

/// Ordered provider-selection policy.
#[derive(Clone)]
pub struct ProviderSelector {
    specs: Vec<ProviderSpec>,
    credentials: Arc<dyn CredentialSource>,
}

impl ProviderSelector {
    pub fn new(specs: Vec<ProviderSpec>, credentials: Arc<dyn CredentialSource>) -> Self {
        Self { specs, credentials }
    }

    pub fn specs(&self) -> &[ProviderSpec] {
        &self.specs
    }

    /// Provider configuration for `spec`, or `None` when its key is missing.
    pub fn resolve_config(&self, spec: &ProviderSpec) -> Option<ProviderConfig> {
        let creds = self.credentials.as_ref();
        let key = match (&spec.api_key, spec.kind.api_key_env()) {
            (Some(raw), _) => resolve_value(raw, creds),
            (None, Some(var)) => creds.get(var).filter(|k| !k.is_empty()),
            (None, None) => None,
        };

        let key = match key {
            Some(k) => k,
            None if !spec.kind.requires_api_key() => String::new(),
            None => return None,
        };

        let mut config = ProviderConfig::new(key);
        if let Some(ref url) = spec.base_url {
            config.base_url = resolve_value(url, creds);
        }
        if let Some(ms) = spec.timeout_ms {
            config.timeout_ms = Some(ms);
        }
        Some(config)
    }

    /// Build the first provider whose credentials resolve.
    ///
    /// Fails with a configuration error, before any network traffic, when
    /// the policy is empty or no candidate resolves.
    pub fn select(&self) -> error::Result<Arc<dyn Provider>> {
        if self.specs.is_empty() {
            return Err(KilnError::config("No providers configured"));
        }

        for spec in &self.specs {
            let Some(config) = self.resolve_config(spec) else {
                debug!(provider = %spec.kind, "Skipping provider without credentials");
                continue;
            };
            let model = spec
                .model
                .clone()
                .unwrap_or_else(|| spec.kind.default_model().to_string());
            let provider: Arc<dyn Provider> =
                Arc::new(create_openai_compatible(spec.kind, model, config)?);
            debug!(provider = %spec.kind, model = provider.model(), "Selected provider");

            return Ok(match spec.max_retries {
                Some(n) if n > 0 => Arc::new(RetryProvider::new(
                    provider,
                    RetryConfig {
                        max_retries: n,
                        ..Default::default()
                    },
                )),
                _ => provider,
            });
        }

        let tried: Vec<&str> = self.specs.iter().map(|s| s.kind.as_str()).collect();
        Err(KilnError::config(format!(
            "No credentials found for any configured provider ({})",
            tried.join(", ")
        )))
    }
}

impl std::fmt::Debug for ProviderSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSelector")
            .field("specs", &self.specs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(specs: Vec<ProviderSpec>, creds: StaticCredentials) -> ProviderSelector {
        ProviderSelector::new(specs, Arc::new(creds))
    }

    #[test]
    fn empty_policy_is_config_error() {
        let err = selector(vec![], StaticCredentials::new()).select().err().expect("expected error");
        assert!(matches!(err, KilnError::Config { .. }));
    }

    #[test]
    fn skips_candidates_without_credentials() {
        let s = selector(
            vec![
                ProviderSpec::new(ProviderKind::OpenAi),
                ProviderSpec::new(ProviderKind::DeepSeek).model("deepseek-reasoner"),
            ],
            StaticCredentials::new().with("DEEPSEEK_API_KEY", "sk-ds"),
        );
        let p = s.select().unwrap();
        assert_eq!(p.name(), "deepseek");
        assert_eq!(p.model(), "deepseek-reasoner");
    }

    #[test]
    fn unresolvable_policy_names_candidates() {
        let s = selector(
            vec![
                ProviderSpec::new(ProviderKind::OpenAi),
                ProviderSpec::new(ProviderKind::Groq).api_key("${MISSING}"),
            ],
            StaticCredentials::new(),
        );
        let err = s.select().err().expect("expected error").to_string();
        assert!(err.contains("openai, groq"), "{err}");
    }

    #[test]
    fn keyless_kind_always_resolves() {
        let s = selector(
            vec![ProviderSpec::new(ProviderKind::Ollama)],
            StaticCredentials::new(),
        );
        assert_eq!(s.select().unwrap().name(), "ollama");
    }

    #[test]
    fn explicit_reference_and_base_url() {
        let s = selector(
            vec![],
            StaticCredentials::new()
                .with("MY_KEY", "k")
                .with("HOST", "http://h/v1"),
        );
        let spec = ProviderSpec::new(ProviderKind::OpenAi)
            .api_key("${MY_KEY}")
            .base_url("${HOST}");
        let config = s.resolve_config(&spec).unwrap();
        assert_eq!(config.base_url.as_deref(), Some("http://h/v1"));
    }

    #[test]
    fn literal_values_pass_through() {
        let creds = StaticCredentials::new();
        assert_eq!(resolve_value("abc", &creds).as_deref(), Some("abc"));
        assert_eq!(resolve_value("${NOPE}", &creds), None);
        assert_eq!(resolve_value("", &creds), None);
    }
}
