use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::RegistryResult;
use crate::status::ServiceStatus;
use crate::version::Version;

/// A microservice as registered with the registry.
///
/// `service_id` is empty until the registry assigns one on first registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_id: String,
    pub app_id: String,
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub version: String,
    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default)]
    pub schemas: Vec<String>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl ServiceDescriptor {
    pub fn new(
        app_id: impl Into<String>,
        service_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            service_id: String::new(),
            app_id: app_id.into(),
            service_name: service_name.into(),
            alias: None,
            version: version.into(),
            status: ServiceStatus::Up,
            schemas: Vec::new(),
            properties: HashMap::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn add_schema(&mut self, schema_id: impl Into<String>) {
        self.schemas.push(schema_id.into());
    }

    pub fn add_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn get_property(&self, key: &str) -> Option<&String> {
        self.properties.get(key)
    }

    pub fn is_registered(&self) -> bool {
        !self.service_id.is_empty()
    }

    pub fn parsed_version(&self) -> RegistryResult<Version> {
        Version::parse(&self.version)
    }
}
