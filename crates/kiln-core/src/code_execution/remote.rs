//! Execution over HTTP on a worker process.
//!
//! The worker receives `{code, language, config}` and answers
//! `{stdout, stderr, exitCode, duration, error?}`. Transport problems are
//! reported as failed results like any other execution failure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

use super::{CodeRuntime, ExecutionResult, Language, SandboxConfig};
use crate::error::{self, KilnError};

/// Extra time granted to the HTTP call beyond the execution limit.
const TRANSPORT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RemoteRequest<'a> {
    code: &'a str,
    language: Language,
    config: RemoteConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RemoteConfig<'a> {
    timeout_ms: u64,
    max_memory_mb: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    working_dir: Option<String>,
    env: &'a BTreeMap<String, String>,
    allow_network: bool,
    read_only: bool,
}

impl<'a> From<&'a SandboxConfig> for RemoteConfig<'a> {
    fn from(c: &'a SandboxConfig) -> Self {
        Self {
            timeout_ms: c.timeout_ms,
            max_memory_mb: c.max_memory_mb,
            working_dir: c
                .working_dir
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            env: &c.env,
            allow_network: c.allow_network,
            read_only: c.read_only,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteResponse {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    exit_code: i32,
    /// Milliseconds as measured by the worker.
    #[serde(default)]
    duration: u64,
    #[serde(default)]
    error: Option<String>,
}

impl RemoteResponse {
    fn into_result(self, language: Language) -> ExecutionResult {
        let error = self.error.filter(|e| !e.is_empty());
        let exit_code = match (self.exit_code, &error) {
            // A worker that reports an error with a zero exit still failed.
            (0, Some(_)) => 1,
            (code, _) => code,
        };
        let mut result = ExecutionResult::completed(
            language,
            self.stdout,
            self.stderr,
            Some(exit_code),
            Duration::from_millis(self.duration),
        );
        if exit_code != 0 && error.is_some() {
            result.error = error;
        }
        result
    }
}

/// [`CodeRuntime`] that forwards to an HTTP execution worker.
pub struct RemoteRuntime {
    endpoint: Url,
    language: Language,
    client: reqwest::Client,
    name: String,
}

impl RemoteRuntime {
    pub fn new(endpoint: &str, language: Language) -> error::Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| KilnError::config(format!("Invalid execution endpoint '{endpoint}': {e}")))?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| KilnError::config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            name: format!("remote:{}", endpoint.host_str().unwrap_or("local")),
            endpoint,
            language,
            client,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl CodeRuntime for RemoteRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    fn language(&self) -> Language {
        self.language
    }

    async fn run(&self, code: &str, config: &SandboxConfig) -> ExecutionResult {
        let started = Instant::now();
        let body = RemoteRequest {
            code,
            language: self.language,
            config: config.into(),
        };
        debug!(endpoint = %self.endpoint, language = %self.language, "Remote execution");

        let resp = match self
            .client
            .post(self.endpoint.clone())
            .timeout(config.timeout() + TRANSPORT_GRACE)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Remote execution failed");
                return ExecutionResult::failure(
                    self.language,
                    format!("Remote execution failed: {e}"),
                    started.elapsed(),
                );
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return ExecutionResult::failure(
                self.language,
                format!("Remote worker returned HTTP {}: {}", status.as_u16(), text.trim()),
                started.elapsed(),
            );
        }

        match resp.json::<RemoteResponse>().await {
            Ok(parsed) => parsed.into_result(self.language),
            Err(e) => ExecutionResult::failure(
                self.language,
                format!("Invalid response from remote worker: {e}"),
                started.elapsed(),
            ),
        }
    }

    /// Any HTTP answer from the endpoint counts as available.
    async fn is_available(&self) -> bool {
        self.client
            .head(self.endpoint.clone())
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .is_ok()
    }
}
