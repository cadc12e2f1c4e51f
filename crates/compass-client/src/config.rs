//! Client configuration.
//!
//! `RegistryConfig` is handed to the client fully populated; where the values
//! come from is up to the embedding application. `from_env` covers the common
//! case of `COMPASS_*` variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use compass_core::{RegistryError, RegistryResult};

/// Lower bound of every periodic interval.
pub const MIN_INTERVAL_MS: u64 = 1_000;
/// Upper bound of every periodic interval.
pub const MAX_INTERVAL_MS: u64 = 600_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Give up with `RegistrationTimeout` after this long. `None` retries forever.
    pub max_wait_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            max_wait_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub ca_file: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub accept_invalid_certs: bool,
}

impl TlsConfig {
    pub fn is_configured(&self) -> bool {
        self.ca_file.is_some() || self.cert_file.is_some() || self.accept_invalid_certs
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry base URLs, e.g. `http://127.0.0.1:30100`.
    pub addresses: Vec<String>,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub pull_interval_ms: u64,
    /// Use long-poll watches instead of periodic pulls.
    pub watch: bool,
    /// How long one watch request may be held by the server.
    pub watch_wait_ms: u64,
    pub max_concurrent_requests: usize,
    pub unregister_timeout_ms: u64,
    /// How long an address stays isolated after repeated failures.
    pub isolation_ms: u64,
    pub retry: RetryPolicy,
    pub tls: TlsConfig,
    pub auth_token: Option<String>,
    /// Identity to request bearer tokens for. When set, the client fetches a
    /// token at start and renews it every `token_lifetime_ms`.
    pub token_identity: Option<String>,
    pub token_lifetime_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            addresses: vec!["http://127.0.0.1:30100".to_string()],
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 3_000,
            request_timeout_ms: 5_000,
            pull_interval_ms: 30_000,
            watch: false,
            watch_wait_ms: 30_000,
            max_concurrent_requests: 8,
            unregister_timeout_ms: 3_000,
            isolation_ms: 60_000,
            retry: RetryPolicy::default(),
            tls: TlsConfig::default(),
            auth_token: None,
            token_identity: None,
            token_lifetime_ms: 28 * 60_000,
        }
    }
}

fn clamp_interval(ms: u64) -> u64 {
    ms.clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS)
}

impl RegistryConfig {
    pub fn with_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    /// Clamp periodic intervals into the supported range.
    pub fn normalized(mut self) -> Self {
        self.heartbeat_interval_ms = clamp_interval(self.heartbeat_interval_ms);
        self.pull_interval_ms = clamp_interval(self.pull_interval_ms);
        self.watch_wait_ms = clamp_interval(self.watch_wait_ms);
        self.max_concurrent_requests = self.max_concurrent_requests.max(1);
        self.token_lifetime_ms = self.token_lifetime_ms.max(MIN_INTERVAL_MS);
        self
    }

    pub fn validate(&self) -> RegistryResult<()> {
        if self.addresses.is_empty() {
            return Err(RegistryError::Config("no registry address configured".into()));
        }
        if let Some(bad) = self
            .addresses
            .iter()
            .find(|a| !(a.starts_with("http://") || a.starts_with("https://")))
        {
            return Err(RegistryError::Config(format!(
                "registry address {bad:?} must start with http:// or https://"
            )));
        }
        if self.retry.initial_backoff_ms == 0 || self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(RegistryError::Config(
                "retry backoff must be positive and max_backoff_ms >= initial_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_millis(self.pull_interval_ms)
    }

    pub fn watch_wait(&self) -> Duration {
        Duration::from_millis(self.watch_wait_ms)
    }

    pub fn unregister_timeout(&self) -> Duration {
        Duration::from_millis(self.unregister_timeout_ms)
    }

    pub fn token_lifetime(&self) -> Duration {
        Duration::from_millis(self.token_lifetime_ms)
    }

    /// Read `COMPASS_*` variables over the defaults and normalize the result.
    pub fn from_env() -> RegistryResult<Self> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("COMPASS_REGISTRY") {
            config.addresses = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(ms) = env_u64("COMPASS_HEARTBEAT_INTERVAL_MS")? {
            config.heartbeat_interval_ms = ms;
        }
        if let Some(ms) = env_u64("COMPASS_PULL_INTERVAL_MS")? {
            config.pull_interval_ms = ms;
        }
        if let Some(ms) = env_u64("COMPASS_REQUEST_TIMEOUT_MS")? {
            config.request_timeout_ms = ms;
        }
        if let Some(ms) = env_u64("COMPASS_MAX_WAIT_MS")? {
            config.retry.max_wait_ms = Some(ms);
        }
        if let Ok(raw) = std::env::var("COMPASS_WATCH") {
            config.watch = matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        config.tls.ca_file = std::env::var("COMPASS_TLS_CA").ok();
        config.tls.cert_file = std::env::var("COMPASS_TLS_CLIENT_CERT").ok();
        config.tls.key_file = std::env::var("COMPASS_TLS_CLIENT_KEY").ok();
        config.auth_token = std::env::var("COMPASS_TOKEN").ok().filter(|t| !t.is_empty());
        config.token_identity = std::env::var("COMPASS_TOKEN_IDENTITY").ok().filter(|t| !t.is_empty());
        if let Some(ms) = env_u64("COMPASS_TOKEN_LIFETIME_MS")? {
            config.token_lifetime_ms = ms;
        }

        let config = config.normalized();
        config.validate()?;
        Ok(config)
    }
}

fn env_u64(name: &str) -> RegistryResult<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| RegistryError::Config(format!("{name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
