use crate::errors::RegistryResult;
use crate::version_rule::VersionRule;
use crate::{Identity, InstanceDescriptor, InstanceStatus, ServiceDescriptor};

/// Result of an instance query carrying a known revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindOutcome {
    /// The caller's revision is current; the instance set did not change.
    NotModified { revision: String },
    Instances {
        revision: String,
        instances: Vec<InstanceDescriptor>,
    },
}

impl FindOutcome {
    pub fn revision(&self) -> &str {
        match self {
            FindOutcome::NotModified { revision } => revision,
            FindOutcome::Instances { revision, .. } => revision,
        }
    }
}

/// The authoritative instance directory held by a registry server.
pub trait RegistryStore: Send + Sync {
    /// Returns the existing id when (app, name, version) is already registered.
    fn register_service(&self, service: &ServiceDescriptor) -> RegistryResult<String>;
    fn get_service(&self, service_id: &str) -> RegistryResult<ServiceDescriptor>;
    fn get_all_services(&self) -> RegistryResult<Vec<ServiceDescriptor>>;
    fn register_instance(&self, service_id: &str, instance: &InstanceDescriptor) -> RegistryResult<String>;
    fn unregister_instance(&self, service_id: &str, instance_id: &str) -> RegistryResult<()>;
    fn update_instance_status(&self, service_id: &str, instance_id: &str, status: InstanceStatus) -> RegistryResult<()>;
    fn heartbeat(&self, service_id: &str, instance_id: &str) -> RegistryResult<()>;
    fn get_instances(&self, service_id: &str) -> RegistryResult<Vec<InstanceDescriptor>>;
    fn get_all_instances(&self) -> RegistryResult<Vec<InstanceDescriptor>>;
    fn find_instances(
        &self,
        app_id: &str,
        service_name: &str,
        rule: &VersionRule,
        known_revision: Option<&str>,
    ) -> RegistryResult<FindOutcome>;
    fn add_identity(&self, identity: &Identity) -> RegistryResult<()>;
    fn get_identity(&self, common_name: &str) -> RegistryResult<Identity>;
}
