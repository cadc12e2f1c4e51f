use std::net::SocketAddr;
use std::time::Duration;

/// Runtime settings of the registry server, read from `COMPASS_*` variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// When unset, `/registry` routes are open.
    pub jwt_secret: Option<String>,
    pub admin_identity: String,
    pub instance_ttl: Duration,
    pub sweep_interval: Duration,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 30100)),
            jwt_secret: None,
            admin_identity: "admin.compass.local".to_string(),
            instance_ttl: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();

        let bind = match std::env::var("COMPASS_BIND") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| format!("COMPASS_BIND={raw:?} is not a socket address: {e}"))?,
            Err(_) => defaults.bind,
        };
        let instance_ttl = match std::env::var("COMPASS_INSTANCE_TTL_SECS") {
            Ok(raw) => Duration::from_secs(
                raw.parse()
                    .map_err(|e| format!("COMPASS_INSTANCE_TTL_SECS={raw:?}: {e}"))?,
            ),
            Err(_) => defaults.instance_ttl,
        };

        Ok(Self {
            bind,
            jwt_secret: std::env::var("COMPASS_JWT_SECRET").ok().filter(|s| !s.is_empty()),
            admin_identity: std::env::var("COMPASS_ADMIN_IDENTITY")
                .unwrap_or(defaults.admin_identity),
            instance_ttl,
            sweep_interval: (instance_ttl / 4).max(Duration::from_secs(1)),
            tls_cert: std::env::var("COMPASS_TLS_CERT").ok(),
            tls_key: std::env::var("COMPASS_TLS_KEY").ok(),
        })
    }
}
