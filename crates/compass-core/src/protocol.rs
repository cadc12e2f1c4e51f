use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Rest,
    Highway,
    Grpc,
    Http,
    Https,
    Custom(String),
}

impl Protocol {
    fn from_scheme(scheme: &str) -> Self {
        match scheme {
            "rest" => Protocol::Rest,
            "highway" => Protocol::Highway,
            "grpc" => Protocol::Grpc,
            "http" => Protocol::Http,
            "https" => Protocol::Https,
            other => Protocol::Custom(other.to_string()),
        }
    }

    pub fn scheme(&self) -> &str {
        match self {
            Protocol::Rest => "rest",
            Protocol::Highway => "highway",
            Protocol::Grpc => "grpc",
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Custom(s) => s,
        }
    }
}

/// A parsed endpoint URI: `scheme://host:port[?sslEnabled=true]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub protocol: Protocol,
    /// `host:port`
    pub address: String,
    pub ssl_enabled: bool,
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| format!("endpoint {s:?} has no scheme"))?;
        if scheme.is_empty() || scheme.contains(char::is_whitespace) {
            return Err(format!("endpoint {s:?} has an invalid scheme"));
        }
        let (address, query) = match rest.split_once('?') {
            Some((address, query)) => (address, Some(query)),
            None => (rest, None),
        };
        if address.is_empty() || address.contains(char::is_whitespace) {
            return Err(format!("endpoint {s:?} has no address"));
        }
        let ssl_enabled = query
            .map(|q| q.split('&').any(|kv| kv == "sslEnabled=true"))
            .unwrap_or(false);

        Ok(Endpoint {
            protocol: Protocol::from_scheme(scheme),
            address: address.to_string(),
            ssl_enabled,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol.scheme(), self.address)?;
        if self.ssl_enabled {
            f.write_str("?sslEnabled=true")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        let endpoint: Endpoint = "highway://10.0.0.1:7070?sslEnabled=true".parse().unwrap();
        assert_eq!(endpoint.protocol, Protocol::Highway);
        assert_eq!(endpoint.address, "10.0.0.1:7070");
        assert!(endpoint.ssl_enabled);
        assert_eq!(endpoint.to_string(), "highway://10.0.0.1:7070?sslEnabled=true");

        let custom: Endpoint = "amqp://broker:5672".parse().unwrap();
        assert_eq!(custom.protocol, Protocol::Custom("amqp".into()));
        assert!("10.0.0.1:80".parse::<Endpoint>().is_err());
    }
}
