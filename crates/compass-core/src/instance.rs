use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::protocol::Endpoint;
use crate::status::InstanceStatus;

/// One running, addressable process of a microservice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDescriptor {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_id: String,
    /// Endpoint URIs such as `rest://10.0.0.4:8080`.
    pub endpoints: Vec<String>,
    pub host_name: String,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    /// Unix millis of the last accepted heartbeat; only tracked for the local instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_timestamp: Option<u64>,
}

impl InstanceDescriptor {
    pub fn new(host_name: impl Into<String>, endpoints: Vec<String>) -> Self {
        Self {
            instance_id: String::new(),
            service_id: String::new(),
            endpoints,
            host_name: host_name.into(),
            status: InstanceStatus::Up,
            properties: HashMap::new(),
            last_heartbeat_timestamp: None,
        }
    }

    pub fn set_status(&mut self, status: InstanceStatus) {
        self.status = status;
    }

    pub fn update_heartbeat(&mut self, timestamp: u64) {
        self.last_heartbeat_timestamp = Some(timestamp);
    }

    pub fn add_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn get_property(&self, key: &str) -> Option<&String> {
        self.properties.get(key)
    }

    /// Endpoints that parse; malformed entries are skipped.
    pub fn parsed_endpoints(&self) -> Vec<Endpoint> {
        self.endpoints
            .iter()
            .filter_map(|e| e.parse().ok())
            .collect()
    }
}
