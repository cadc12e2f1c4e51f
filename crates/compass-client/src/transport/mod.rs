//! Registry transports.
//!
//! A transport issues exactly one logical call per method and never retries on
//! its own; the registration task and the discovery loop own retry policy.

mod http;
mod local;

use std::time::Duration;

use async_trait::async_trait;

use compass_core::{
    InstanceDescriptor, InstanceStatus, RegistryError, RegistryResult, ServiceDescriptor,
    VersionRule,
};

pub use http::HttpTransport;
pub use local::LocalTransport;

/// One instance query: which service, which versions, which revision we hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindInstancesQuery {
    pub app_id: String,
    pub service_name: String,
    pub rule: VersionRule,
    pub known_revision: Option<String>,
}

impl FindInstancesQuery {
    pub fn new(app_id: impl Into<String>, service_name: impl Into<String>, rule: VersionRule) -> Self {
        Self {
            app_id: app_id.into(),
            service_name: service_name.into(),
            rule,
            known_revision: None,
        }
    }

    pub fn with_revision(mut self, revision: Option<String>) -> Self {
        self.known_revision = revision;
        self
    }
}

/// Answer to a [`FindInstancesQuery`].
///
/// When `changed` is false the caller's revision is still current and
/// `instances` is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindInstancesResult {
    pub revision: String,
    pub instances: Vec<InstanceDescriptor>,
    pub changed: bool,
}

impl FindInstancesResult {
    pub fn unchanged(revision: impl Into<String>) -> Self {
        Self {
            revision: revision.into(),
            instances: Vec::new(),
            changed: false,
        }
    }

    pub fn changed(revision: impl Into<String>, instances: Vec<InstanceDescriptor>) -> Self {
        Self {
            revision: revision.into(),
            instances,
            changed: true,
        }
    }
}

#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Register a service descriptor and return its server-assigned id.
    async fn register_service(&self, service: &ServiceDescriptor) -> RegistryResult<String>;

    async fn get_service(&self, service_id: &str) -> RegistryResult<ServiceDescriptor>;

    async fn register_instance(
        &self,
        service_id: &str,
        instance: &InstanceDescriptor,
    ) -> RegistryResult<String>;

    async fn unregister_instance(&self, service_id: &str, instance_id: &str) -> RegistryResult<()>;

    async fn update_instance_status(
        &self,
        service_id: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> RegistryResult<()>;

    /// `Ok(false)` when the registry no longer knows the instance.
    async fn heartbeat(&self, service_id: &str, instance_id: &str) -> RegistryResult<bool>;

    async fn find_instances(&self, query: &FindInstancesQuery) -> RegistryResult<FindInstancesResult>;

    /// Block up to `wait` until the instance set moves past `query.known_revision`.
    async fn watch(
        &self,
        _query: &FindInstancesQuery,
        _wait: Duration,
    ) -> RegistryResult<FindInstancesResult> {
        Err(RegistryError::Unsupported("watch".into()))
    }

    fn supports_watch(&self) -> bool {
        false
    }
}
