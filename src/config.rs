//! Provider configuration.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::schema::{Attribute, Diagnostic, Schema};

/// Environment variable consulted when `endpoint` is not configured.
pub const ENV_ENDPOINT: &str = "PROXMOX_ENDPOINT";
/// Environment variable consulted when `api_token` is not configured.
pub const ENV_API_TOKEN: &str = "PROXMOX_API_TOKEN";
/// Environment variable consulted when `insecure` is not configured.
pub const ENV_INSECURE: &str = "PROXMOX_INSECURE";

/// Default cadence for task status polling.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Raw provider configuration as supplied by the user.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of the API, e.g. `https://pve.example.com:8006`.
    pub endpoint: Option<String>,
    /// API token in the form `USER@REALM!TOKENID=SECRET`.
    pub api_token: Option<String>,
    /// Skip TLS certificate verification.
    pub insecure: Option<bool>,
    /// Task status polling interval in milliseconds.
    pub task_poll_interval_ms: Option<u64>,
    /// Upper bound on a single task wait, in seconds. No bound when unset.
    pub task_timeout_secs: Option<u64>,
}

/// Configuration after environment fallback and validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    /// Base URL of the API.
    pub endpoint: String,
    /// API token.
    pub api_token: String,
    /// Skip TLS certificate verification.
    pub insecure: bool,
    /// Task status polling interval.
    pub poll_interval: Duration,
    /// Optional deadline for a single task wait.
    pub task_timeout: Option<Duration>,
}

impl ProviderConfig {
    /// Parse the configuration object handed to `configure`.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
    }

    /// Resolve against the process environment.
    pub fn resolve(self) -> Result<ResolvedConfig, Vec<Diagnostic>> {
        self.resolve_with(|key| std::env::var(key).ok())
    }

    /// Resolve using `env` as the environment lookup.
    pub fn resolve_with<F>(self, env: F) -> Result<ResolvedConfig, Vec<Diagnostic>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = non_empty(self.endpoint).or_else(|| non_empty(env(ENV_ENDPOINT)));
        let api_token = non_empty(self.api_token).or_else(|| non_empty(env(ENV_API_TOKEN)));
        let insecure = self
            .insecure
            .or_else(|| env(ENV_INSECURE).map(|v| matches!(v.trim(), "1" | "true" | "yes")))
            .unwrap_or(false);

        let mut diagnostics = Vec::new();
        if endpoint.is_none() {
            diagnostics.push(
                Diagnostic::error("Missing Proxmox API Endpoint")
                    .with_detail(format!(
                        "Set the endpoint value in the configuration or use the {} \
                         environment variable.",
                        ENV_ENDPOINT
                    ))
                    .with_attribute("endpoint"),
            );
        }
        match api_token.as_deref() {
            None => diagnostics.push(
                Diagnostic::error("Missing Proxmox API Token")
                    .with_detail(format!(
                        "Set the api_token value in the configuration or use the {} \
                         environment variable.",
                        ENV_API_TOKEN
                    ))
                    .with_attribute("api_token"),
            ),
            Some(token) if !is_token_shaped(token) => diagnostics.push(
                Diagnostic::error("Malformed Proxmox API Token")
                    .with_detail("Expected format USER@REALM!TOKENID=SECRET.")
                    .with_attribute("api_token"),
            ),
            Some(_) => {},
        }
        if self.task_poll_interval_ms == Some(0) {
            diagnostics.push(
                Diagnostic::error("Invalid task poll interval")
                    .with_detail("task_poll_interval_ms must be greater than zero.")
                    .with_attribute("task_poll_interval_ms"),
            );
        }

        match (endpoint, api_token) {
            (Some(endpoint), Some(api_token)) if diagnostics.is_empty() => Ok(ResolvedConfig {
                endpoint: endpoint.trim_end_matches('/').to_string(),
                api_token,
                insecure,
                poll_interval: Duration::from_millis(
                    self.task_poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
                ),
                task_timeout: self.task_timeout_secs.map(Duration::from_secs),
            }),
            _ => Err(diagnostics),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn is_token_shaped(token: &str) -> bool {
    match token.split_once('=') {
        Some((id, secret)) => id.contains('@') && id.contains('!') && !secret.is_empty(),
        None => false,
    }
}

/// Schema for the provider configuration block.
pub fn provider_schema() -> Schema {
    Schema::v0()
        .with_description("Proxmox VE provider")
        .with_attribute(
            "endpoint",
            Attribute::optional_string().with_description("The Proxmox API base URL"),
        )
        .with_attribute(
            "api_token",
            Attribute::optional_string()
                .sensitive()
                .with_description("API token, USER@REALM!TOKENID=SECRET"),
        )
        .with_attribute(
            "insecure",
            Attribute::optional_bool().with_description("Skip TLS certificate verification"),
        )
        .with_attribute(
            "task_poll_interval_ms",
            Attribute::optional_int64().with_description("How often to poll task status"),
        )
        .with_attribute(
            "task_timeout_secs",
            Attribute::optional_int64().with_description("Give up on a task after this long"),
        )
}
