//! Client side of the compass service registry: registers the local instance,
//! keeps it alive with heartbeats, and resolves other services by version rule
//! from a locally cached, continuously refreshed instance view.

pub mod address;
pub mod app_manager;
pub mod backoff;
pub mod cache;
pub mod checker;
pub mod client;
pub mod config;
pub mod diff;
pub mod discovery;
pub mod events;
pub mod registration;
pub mod security;
pub mod transport;
pub mod versions;

#[cfg(test)]
mod test_support;

pub use checker::{CacheCheckResult, CacheCheckSummary, CacheStatus, InstanceCacheChecker};
pub use client::RegistryClient;
pub use config::{RegistryConfig, RetryPolicy, TlsConfig};
pub use events::{EventBus, InstancesChanged, RegistryEvent};
pub use registration::{RegisteredIds, RegistrationState};
pub use transport::{
    FindInstancesQuery, FindInstancesResult, HttpTransport, LocalTransport, RegistryTransport,
};
pub use versions::{MicroserviceVersions, VersionSelector};

pub use compass_core::{
    InstanceDescriptor, InstanceStatus, RegistryError, RegistryResult, ServiceDescriptor, Version,
    VersionRule,
};
