//! Pluggable credentials for the HTTP transport.
//!
//! The transport never builds credentials itself: auth headers come from an
//! [`AuthHeaderProvider`] and TLS material from a [`TlsProvider`]. A
//! [`TokenRefresher`] keeps a [`BearerToken`] current.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{info, warn};

use compass_core::{RegistryError, RegistryResult, TransportErrorKind};

use crate::config::TlsConfig;

/// Produces the headers attached to every registry call.
#[async_trait]
pub trait AuthHeaderProvider: Send + Sync {
    async fn headers(&self) -> Result<HashMap<String, String>, TransportErrorKind>;
}

/// `Authorization: Bearer <token>`, replaceable at runtime.
pub struct BearerToken {
    token: RwLock<String>,
}

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(token.into()),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.token.write() = token.into();
    }

    pub fn is_empty(&self) -> bool {
        self.token.read().is_empty()
    }
}

#[async_trait]
impl AuthHeaderProvider for BearerToken {
    async fn headers(&self) -> Result<HashMap<String, String>, TransportErrorKind> {
        let token = self.token.read().clone();
        if token.is_empty() {
            return Err(TransportErrorKind::Auth("bearer token is empty".into()));
        }
        Ok(HashMap::from([(
            "Authorization".to_string(),
            format!("Bearer {token}"),
        )]))
    }
}

/// A fixed header set, e.g. a tenant or project header.
#[derive(Debug, Clone, Default)]
pub struct StaticHeaders(pub HashMap<String, String>);

#[async_trait]
impl AuthHeaderProvider for StaticHeaders {
    async fn headers(&self) -> Result<HashMap<String, String>, TransportErrorKind> {
        Ok(self.0.clone())
    }
}

/// Issues bearer tokens for an identity.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn issue_token(&self, identity: &str) -> RegistryResult<String>;
}

/// Background task renewing a [`BearerToken`] before it expires.
pub struct TokenRefresher {
    source: Arc<dyn TokenSource>,
    token: Arc<BearerToken>,
    identity: String,
    lifetime: Duration,
    retry: Duration,
}

impl TokenRefresher {
    pub fn new(
        source: Arc<dyn TokenSource>,
        token: Arc<BearerToken>,
        identity: impl Into<String>,
        lifetime: Duration,
    ) -> Self {
        Self {
            source,
            token,
            identity: identity.into(),
            lifetime,
            retry: Duration::from_secs(1),
        }
    }

    /// Fetch a token now, then every `lifetime`; failed fetches retry after a
    /// second. Gives up only when the registry rejects the very first request
    /// with 401 or 404, since neither will change by retrying.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            let next = match self.source.issue_token(&self.identity).await {
                Ok(token) => {
                    self.token.set(token);
                    info!(identity = %self.identity, "auth token refreshed");
                    self.lifetime
                }
                Err(e) if self.token.is_empty() && is_rejection(&e) => {
                    warn!(identity = %self.identity, error = %e, "registry refused to issue a token, not retrying");
                    return;
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "auth token refresh failed");
                    self.retry
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(next) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn is_rejection(err: &RegistryError) -> bool {
    matches!(err, RegistryError::Transport(t) if matches!(t.status_code(), Some(401 | 404)))
}

/// Applies TLS settings to the HTTP client being built.
pub trait TlsProvider: Send + Sync {
    fn configure(
        &self,
        builder: reqwest::ClientBuilder,
    ) -> Result<reqwest::ClientBuilder, TransportErrorKind>;
}

/// TLS from PEM files on disk.
#[derive(Debug, Clone)]
pub struct PemTls {
    config: TlsConfig,
}

impl PemTls {
    pub fn new(config: TlsConfig) -> Self {
        Self { config }
    }
}

fn read_file(path: &str) -> Result<Vec<u8>, TransportErrorKind> {
    std::fs::read(path).map_err(|e| TransportErrorKind::Tls(format!("{path}: {e}")))
}

impl TlsProvider for PemTls {
    fn configure(
        &self,
        mut builder: reqwest::ClientBuilder,
    ) -> Result<reqwest::ClientBuilder, TransportErrorKind> {
        if let Some(ca) = &self.config.ca_file {
            let pem = read_file(ca)?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| TransportErrorKind::Tls(format!("{ca}: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        match (&self.config.cert_file, &self.config.key_file) {
            (Some(cert), Some(key)) => {
                let cert_pem = read_file(cert)?;
                let key_pem = read_file(key)?;
                let identity = reqwest::Identity::from_pkcs8_pem(&cert_pem, &key_pem)
                    .map_err(|e| TransportErrorKind::Tls(format!("{cert}: {e}")))?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => {
                return Err(TransportErrorKind::Tls(
                    "client certificate and key must be configured together".into(),
                ));
            }
        }
        if self.config.accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use compass_core::TransportError;

    /// Fails the first call with `first_error`, then issues `t1`, `t2`, ...
    struct ScriptedSource {
        calls: AtomicUsize,
        first_error: Option<u16>,
    }

    impl ScriptedSource {
        fn new(first_error: Option<u16>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                first_error,
            })
        }
    }

    #[async_trait]
    impl TokenSource for ScriptedSource {
        async fn issue_token(&self, identity: &str) -> RegistryResult<String> {
            assert_eq!(identity, "orders");
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match (call, self.first_error) {
                (0, Some(status)) => Err(TransportError::new(
                    "http://registry",
                    TransportErrorKind::Status {
                        status,
                        body: String::new(),
                    },
                )
                .into()),
                _ => Ok(format!("t{}", call + usize::from(self.first_error.is_none()))),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_is_renewed_every_lifetime() {
        let source = ScriptedSource::new(Some(503));
        let token = Arc::new(BearerToken::new(""));
        let (shutdown, rx) = watch::channel(false);
        let refresher = TokenRefresher::new(source.clone(), token.clone(), "orders", Duration::from_secs(60));
        let handle = tokio::spawn(refresher.run(rx));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(token.headers().await.unwrap()["Authorization"], "Bearer t1");

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(token.headers().await.unwrap()["Authorization"], "Bearer t2");

        shutdown.send_replace(true);
        handle.await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_first_token_stops_refreshing() {
        let source = ScriptedSource::new(Some(401));
        let token = Arc::new(BearerToken::new(""));
        let (_shutdown, rx) = watch::channel(false);
        TokenRefresher::new(source.clone(), token.clone(), "orders", Duration::from_secs(60))
            .run(rx)
            .await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(token.is_empty());
    }

    #[tokio::test]
    async fn test_bearer_token_rotates() {
        let provider = BearerToken::new("one");
        assert_eq!(provider.headers().await.unwrap()["Authorization"], "Bearer one");
        provider.set("two");
        assert_eq!(provider.headers().await.unwrap()["Authorization"], "Bearer two");
        provider.set("");
        assert!(matches!(provider.headers().await, Err(TransportErrorKind::Auth(_))));
    }

    #[test]
    fn test_pem_tls_requires_cert_and_key_pair() {
        let tls = PemTls::new(TlsConfig {
            cert_file: Some("/nonexistent/cert.pem".into()),
            ..Default::default()
        });
        assert!(matches!(
            tls.configure(reqwest::Client::builder()),
            Err(TransportErrorKind::Tls(_))
        ));
    }

    #[test]
    fn test_malformed_client_identity_is_tls_error() {
        let dir = std::env::temp_dir().join(format!("compass-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("client.pem");
        let key = dir.join("client.key");
        std::fs::write(&cert, "not a certificate").unwrap();
        std::fs::write(&key, "not a key").unwrap();

        let tls = PemTls::new(TlsConfig {
            cert_file: Some(cert.display().to_string()),
            key_file: Some(key.display().to_string()),
            ..Default::default()
        });
        let err = tls.configure(reqwest::Client::builder()).err().unwrap();
        assert!(matches!(err, TransportErrorKind::Tls(_)));
        assert!(err.to_string().contains("client.pem"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_ca_file_is_tls_error() {
        let tls = PemTls::new(TlsConfig {
            ca_file: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        });
        let err = tls.configure(reqwest::Client::builder()).err().unwrap();
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }
}
