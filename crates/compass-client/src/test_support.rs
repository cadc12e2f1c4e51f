//! Transport doubles shared by unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use compass_core::{
    InstanceDescriptor, InstanceStatus, RegistryError, RegistryResult, ServiceDescriptor,
    TransportError,
};
use compass_store::MemoryRegistry;

use crate::transport::{FindInstancesQuery, FindInstancesResult, LocalTransport, RegistryTransport};

/// Wraps a [`LocalTransport`], counting calls and injecting failures.
pub struct CountingTransport {
    inner: LocalTransport,
    pub find_calls: AtomicUsize,
    pub get_service_calls: AtomicUsize,
    pub heartbeat_calls: AtomicUsize,
    pub heartbeats_in_flight: AtomicUsize,
    pub max_heartbeats_in_flight: AtomicUsize,
    pub register_instance_calls: AtomicUsize,
    pub unregister_calls: AtomicUsize,
    pub find_delay: parking_lot::Mutex<Duration>,
    pub heartbeat_delay: parking_lot::Mutex<Duration>,
    pub fail_finds: AtomicBool,
    pub fail_registrations: AtomicBool,
    pub supports_watch: AtomicBool,
    /// Answer the next find with `StaleRevision`.
    pub stale_once: AtomicBool,
    /// `known_revision` of every find, in call order.
    pub find_revisions: parking_lot::Mutex<Vec<Option<String>>>,
}

impl CountingTransport {
    pub fn new(registry: Arc<MemoryRegistry>) -> Self {
        Self {
            inner: LocalTransport::new(registry),
            find_calls: AtomicUsize::new(0),
            get_service_calls: AtomicUsize::new(0),
            heartbeat_calls: AtomicUsize::new(0),
            heartbeats_in_flight: AtomicUsize::new(0),
            max_heartbeats_in_flight: AtomicUsize::new(0),
            register_instance_calls: AtomicUsize::new(0),
            unregister_calls: AtomicUsize::new(0),
            find_delay: parking_lot::Mutex::new(Duration::ZERO),
            heartbeat_delay: parking_lot::Mutex::new(Duration::ZERO),
            fail_finds: AtomicBool::new(false),
            fail_registrations: AtomicBool::new(false),
            supports_watch: AtomicBool::new(false),
            stale_once: AtomicBool::new(false),
            find_revisions: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<MemoryRegistry> {
        self.inner.registry()
    }

    fn unavailable() -> RegistryError {
        TransportError::connect("mock://registry", "connection refused").into()
    }
}

#[async_trait]
impl RegistryTransport for CountingTransport {
    async fn register_service(&self, service: &ServiceDescriptor) -> RegistryResult<String> {
        if self.fail_registrations.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.register_service(service).await
    }

    async fn get_service(&self, service_id: &str) -> RegistryResult<ServiceDescriptor> {
        self.get_service_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_service(service_id).await
    }

    async fn register_instance(
        &self,
        service_id: &str,
        instance: &InstanceDescriptor,
    ) -> RegistryResult<String> {
        self.register_instance_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_registrations.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.register_instance(service_id, instance).await
    }

    async fn unregister_instance(&self, service_id: &str, instance_id: &str) -> RegistryResult<()> {
        self.unregister_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.unregister_instance(service_id, instance_id).await
    }

    async fn update_instance_status(
        &self,
        service_id: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> RegistryResult<()> {
        self.inner
            .update_instance_status(service_id, instance_id, status)
            .await
    }

    async fn heartbeat(&self, service_id: &str, instance_id: &str) -> RegistryResult<bool> {
        self.heartbeat_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.heartbeats_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_heartbeats_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.heartbeat_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = self.inner.heartbeat(service_id, instance_id).await;
        self.heartbeats_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn find_instances(&self, query: &FindInstancesQuery) -> RegistryResult<FindInstancesResult> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        self.find_revisions.lock().push(query.known_revision.clone());
        let delay = *self.find_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_finds.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        if self.stale_once.swap(false, Ordering::SeqCst) {
            return Err(RegistryError::StaleRevision {
                app_id: query.app_id.clone(),
                service_name: query.service_name.clone(),
                revision: "unknown".to_string(),
            });
        }
        self.inner.find_instances(query).await
    }

    async fn watch(
        &self,
        query: &FindInstancesQuery,
        wait: Duration,
    ) -> RegistryResult<FindInstancesResult> {
        if !self.supports_watch.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.watch(query, wait).await
    }

    fn supports_watch(&self) -> bool {
        true
    }
}

pub fn instance(host: &str) -> InstanceDescriptor {
    InstanceDescriptor::new(host, vec![format!("rest://{host}:8080")])
}

/// Register `app/name@version` with one instance on `host` directly in the store.
pub fn seed(registry: &MemoryRegistry, app: &str, name: &str, version: &str, host: &str) -> (String, String) {
    use compass_core::RegistryStore;
    let service_id = registry
        .register_service(&ServiceDescriptor::new(app, name, version))
        .unwrap();
    let instance_id = registry.register_instance(&service_id, &instance(host)).unwrap();
    (service_id, instance_id)
}
