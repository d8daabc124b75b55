use serde::Deserialize;

use crate::manifest::ManifestFormat;

/// Configuration of one push invocation.
#[derive(Clone, Debug, Deserialize)]
pub struct PushConfig {
    #[serde(default)]
    pub manifest_format: ManifestFormat,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_connections_per_host")]
    pub max_connections_per_host: usize,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Wall-clock budget for the whole push; exceeding it cancels.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Talk plain HTTP to the target registry. Required for local
    /// registries without TLS.
    #[serde(default)]
    pub allow_insecure_registries: bool,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            manifest_format: Default::default(),
            workers: default_workers(),
            max_connections_per_host: default_max_connections_per_host(),
            retry: Default::default(),
            timeout_secs: None,
            allow_insecure_registries: false,
        }
    }
}

impl PushConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

/// Backoff policy for transient registry failures.
#[derive(Clone, Debug, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(4)
}

fn default_max_connections_per_host() -> usize {
    20
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_max_attempts() -> u32 {
    5
}
