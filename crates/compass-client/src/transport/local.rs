use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use compass_core::{
    FindOutcome, InstanceDescriptor, InstanceStatus, RegistryError, RegistryResult,
    RegistryStore, ServiceDescriptor,
};
use compass_store::MemoryRegistry;

use super::{FindInstancesQuery, FindInstancesResult, RegistryTransport};

/// Talks to an in-process [`MemoryRegistry`] directly.
#[derive(Clone)]
pub struct LocalTransport {
    registry: Arc<MemoryRegistry>,
}

impl LocalTransport {
    pub fn new(registry: Arc<MemoryRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<MemoryRegistry> {
        &self.registry
    }

    fn find(&self, query: &FindInstancesQuery) -> RegistryResult<FindInstancesResult> {
        let outcome = self.registry.find_instances(
            &query.app_id,
            &query.service_name,
            &query.rule,
            query.known_revision.as_deref(),
        )?;
        Ok(match outcome {
            FindOutcome::NotModified { revision } => FindInstancesResult::unchanged(revision),
            FindOutcome::Instances { revision, instances } => {
                FindInstancesResult::changed(revision, instances)
            }
        })
    }
}

#[async_trait]
impl RegistryTransport for LocalTransport {
    async fn register_service(&self, service: &ServiceDescriptor) -> RegistryResult<String> {
        self.registry.register_service(service)
    }

    async fn get_service(&self, service_id: &str) -> RegistryResult<ServiceDescriptor> {
        self.registry.get_service(service_id)
    }

    async fn register_instance(
        &self,
        service_id: &str,
        instance: &InstanceDescriptor,
    ) -> RegistryResult<String> {
        self.registry.register_instance(service_id, instance)
    }

    async fn unregister_instance(&self, service_id: &str, instance_id: &str) -> RegistryResult<()> {
        self.registry.unregister_instance(service_id, instance_id)
    }

    async fn update_instance_status(
        &self,
        service_id: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> RegistryResult<()> {
        self.registry
            .update_instance_status(service_id, instance_id, status)
    }

    async fn heartbeat(&self, service_id: &str, instance_id: &str) -> RegistryResult<bool> {
        match self.registry.heartbeat(service_id, instance_id) {
            Ok(()) => Ok(true),
            Err(RegistryError::InstanceNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn find_instances(&self, query: &FindInstancesQuery) -> RegistryResult<FindInstancesResult> {
        self.find(query)
    }

    async fn watch(
        &self,
        query: &FindInstancesQuery,
        wait: Duration,
    ) -> RegistryResult<FindInstancesResult> {
        let deadline = Instant::now() + wait;
        let mut changes = self.registry.subscribe();
        loop {
            changes.borrow_and_update();
            let result = self.find(query)?;
            if result.changed {
                return Ok(result);
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(RegistryError::Shutdown),
                Err(_) => return Ok(result),
            }
        }
    }

    fn supports_watch(&self) -> bool {
        true
    }
}
