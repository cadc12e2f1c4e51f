//! Error taxonomy shared by the store, the server and the client.

use std::fmt;

use thiserror::Error;

/// What went wrong while talking to a registry address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connection refused, reset, DNS failure.
    Connect(String),
    /// The call deadline expired.
    Timeout,
    /// The server answered with a non-success status.
    Status { status: u16, body: String },
    /// The response body could not be decoded.
    Decode(String),
    /// TLS material could not be loaded or the handshake setup failed.
    Tls(String),
    /// The auth header provider could not produce credentials.
    Auth(String),
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::Connect(reason) => write!(f, "connection failed: {reason}"),
            TransportErrorKind::Timeout => f.write_str("request timed out"),
            TransportErrorKind::Status { status, body } => {
                write!(f, "server returned {status}: {body}")
            }
            TransportErrorKind::Decode(reason) => write!(f, "invalid response body: {reason}"),
            TransportErrorKind::Tls(reason) => write!(f, "tls setup failed: {reason}"),
            TransportErrorKind::Auth(reason) => write!(f, "auth headers unavailable: {reason}"),
        }
    }
}

/// A failed call against one registry address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("registry transport error on {address}: {kind}")]
pub struct TransportError {
    pub address: String,
    pub kind: TransportErrorKind,
}

impl TransportError {
    pub fn new(address: impl Into<String>, kind: TransportErrorKind) -> Self {
        Self {
            address: address.into(),
            kind,
        }
    }

    pub fn timeout(address: impl Into<String>) -> Self {
        Self::new(address, TransportErrorKind::Timeout)
    }

    pub fn connect(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(address, TransportErrorKind::Connect(reason.into()))
    }

    pub fn status(address: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self::new(
            address,
            TransportErrorKind::Status {
                status,
                body: body.into(),
            },
        )
    }

    /// HTTP status carried by the error, if the server answered at all.
    pub fn status_code(&self) -> Option<u16> {
        match &self.kind {
            TransportErrorKind::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn body(&self) -> Option<&str> {
        match &self.kind {
            TransportErrorKind::Status { body, .. } => Some(body),
            _ => None,
        }
    }

    /// The address itself is unreachable; callers should move to the next one.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Connect(_) | TransportErrorKind::Timeout
        )
    }
}

/// Domain errors for compass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid version \"{version}\": {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("invalid version rule \"{rule}\": {reason}")]
    InvalidVersionRule { rule: String, reason: String },

    #[error("cannot resolve dependency {app_id}/{service_name} with rule {rule}")]
    NoCompatibleVersion {
        app_id: String,
        service_name: String,
        rule: String,
    },

    #[error("registry returned unknown revision {revision} for {app_id}/{service_name}")]
    StaleRevision {
        app_id: String,
        service_name: String,
        revision: String,
    },

    #[error("service not found: {service_id}")]
    ServiceNotFound { service_id: String },

    #[error("instance not found: {service_id}/{instance_id}")]
    InstanceNotFound {
        service_id: String,
        instance_id: String,
    },

    #[error("identity not found: {common_name}")]
    IdentityNotFound { common_name: String },

    #[error("{stage} did not succeed within {waited_ms}ms")]
    RegistrationTimeout { stage: String, waited_ms: u64 },

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("registry client is shut down")]
    Shutdown,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RegistryError {
    pub fn service_not_found(service_id: impl Into<String>) -> Self {
        Self::ServiceNotFound {
            service_id: service_id.into(),
        }
    }

    pub fn instance_not_found(service_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self::InstanceNotFound {
            service_id: service_id.into(),
            instance_id: instance_id.into(),
        }
    }

    pub fn no_compatible_version(
        app_id: impl Into<String>,
        service_name: impl Into<String>,
        rule: impl Into<String>,
    ) -> Self {
        Self::NoCompatibleVersion {
            app_id: app_id.into(),
            service_name: service_name.into(),
            rule: rule.into(),
        }
    }

    /// Transient failures worth retrying with backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::StaleRevision { .. })
    }
}

/// Result type for registry operations
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_exposes_status_and_body() {
        let err = TransportError::status("http://sc:30100", 503, "overloaded");
        assert_eq!(err.status_code(), Some(503));
        assert_eq!(err.body(), Some("overloaded"));
        assert!(!err.is_unreachable());
        assert!(err.to_string().contains("http://sc:30100"));

        let timeout = TransportError::timeout("http://sc:30100");
        assert!(timeout.is_unreachable());
        assert_eq!(timeout.status_code(), None);
    }

    #[test]
    fn test_error_retriable() {
        let transport: RegistryError = TransportError::connect("a", "refused").into();
        assert!(transport.is_retriable());
        assert!(!RegistryError::service_not_found("x").is_retriable());
    }

    #[test]
    fn test_no_compatible_version_message() {
        let err = RegistryError::no_compatible_version("app", "svc", "2.0.0+");
        assert_eq!(
            err.to_string(),
            "cannot resolve dependency app/svc with rule 2.0.0+"
        );
    }
}
