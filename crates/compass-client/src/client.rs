use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use compass_core::{
    InstanceDescriptor, InstanceStatus, RegistryError, RegistryResult, ServiceDescriptor,
    VersionRule,
};

use crate::app_manager::AppManager;
use crate::cache::InstanceCache;
use crate::checker::{CacheCheckSummary, InstanceCacheChecker};
use crate::config::RegistryConfig;
use crate::discovery::DiscoveryLoop;
use crate::events::{EventBus, InstancesChanged, RegistryEvent};
use crate::registration::{LocalRegistration, RegisteredIds, RegistrationState, RegistrationTask};
use crate::security::TokenRefresher;
use crate::transport::{HttpTransport, RegistryTransport};

/// Entry point of the registry client.
///
/// Construct once, call [`RegistryClient::start`], share by `Arc`, and call
/// [`RegistryClient::shutdown`] before exit so the instance is unregistered.
pub struct RegistryClient {
    config: RegistryConfig,
    transport: Arc<dyn RegistryTransport>,
    events: EventBus,
    apps: Arc<AppManager>,
    local: Option<LocalRegistration>,
    state: Arc<watch::Sender<RegistrationState>>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    token_refresher: Mutex<Option<TokenRefresher>>,
    registration: Mutex<Option<JoinHandle<RegistryResult<()>>>>,
    discovery: Mutex<Option<JoinHandle<()>>>,
    token_refresh: Mutex<Option<JoinHandle<()>>>,
}

impl RegistryClient {
    /// Client over HTTP that registers `service`/`instance` once started.
    pub fn new(
        config: RegistryConfig,
        service: ServiceDescriptor,
        instance: InstanceDescriptor,
    ) -> RegistryResult<Self> {
        Ok(Self::consumer(config)?.with_local_instance(service, instance))
    }

    /// Client over HTTP that only discovers other services.
    pub fn consumer(config: RegistryConfig) -> RegistryResult<Self> {
        let config = config.normalized();
        let transport = Arc::new(HttpTransport::new(&config)?);
        let refresher = match (&config.token_identity, transport.bearer_token()) {
            (Some(identity), Some(token)) => Some(TokenRefresher::new(
                transport.clone(),
                token,
                identity.clone(),
                config.token_lifetime(),
            )),
            _ => None,
        };
        let client = Self::with_transport(config, transport);
        Ok(match refresher {
            Some(refresher) => client.with_token_refresher(refresher),
            None => client,
        })
    }

    pub fn with_transport(config: RegistryConfig, transport: Arc<dyn RegistryTransport>) -> Self {
        let events = EventBus::default();
        let cache = Arc::new(InstanceCache::new(transport.clone(), events.clone()));
        let apps = Arc::new(AppManager::new(transport.clone(), cache));
        let (state, _) = watch::channel(RegistrationState::Init);
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            transport,
            events,
            apps,
            local: None,
            state: Arc::new(state),
            shutdown,
            started: AtomicBool::new(false),
            token_refresher: Mutex::new(None),
            registration: Mutex::new(None),
            discovery: Mutex::new(None),
            token_refresh: Mutex::new(None),
        }
    }

    pub fn with_local_instance(mut self, service: ServiceDescriptor, instance: InstanceDescriptor) -> Self {
        self.local = Some(LocalRegistration::new(service, instance));
        self
    }

    /// Keep the auth token fresh from `start` until shutdown.
    pub fn with_token_refresher(self, refresher: TokenRefresher) -> Self {
        *self.token_refresher.lock() = Some(refresher);
        self
    }

    /// Spawn the registration task (if there is a local instance) and the
    /// discovery loop. Calling it again has no effect.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(refresher) = self.token_refresher.lock().take() {
            *self.token_refresh.lock() = Some(tokio::spawn(refresher.run(self.shutdown.subscribe())));
        }
        if let Some(local) = &self.local {
            let task = RegistrationTask::new(
                self.transport.clone(),
                local.clone(),
                &self.config,
                self.state.clone(),
                self.events.clone(),
                self.shutdown.subscribe(),
            );
            *self.registration.lock() = Some(tokio::spawn(task.run()));
        }
        let discovery = DiscoveryLoop::new(
            self.apps.clone(),
            self.transport.clone(),
            self.events.clone(),
            &self.config,
            self.shutdown.subscribe(),
        );
        *self.discovery.lock() = Some(tokio::spawn(discovery.run()));
        info!(
            addresses = ?self.config.addresses,
            registers = self.local.is_some(),
            "registry client started"
        );
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn app_manager(&self) -> &Arc<AppManager> {
        &self.apps
    }

    /// Instances of `app_id/service_name` satisfying `rule` (or `latest`),
    /// newest version first.
    pub async fn resolve(
        &self,
        app_id: &str,
        service_name: &str,
        rule: &str,
    ) -> RegistryResult<Vec<InstanceDescriptor>> {
        self.apps.resolve(app_id, service_name, rule).await
    }

    pub async fn group_by_compatible_version(
        &self,
        app_id: &str,
        service_name: &str,
    ) -> RegistryResult<BTreeMap<VersionRule, Vec<InstanceDescriptor>>> {
        let versions = self
            .apps
            .get_or_create_microservice_versions(app_id, service_name)
            .await?;
        Ok(versions.group_by_compatible_version())
    }

    /// Call `listener` on every instance change of `app_id/service_name` until shutdown.
    pub fn on_instances_changed<F>(&self, app_id: &str, service_name: &str, listener: F) -> JoinHandle<()>
    where
        F: Fn(&InstancesChanged) + Send + Sync + 'static,
    {
        self.events
            .spawn_instances_listener(app_id, service_name, self.shutdown.subscribe(), listener)
    }

    /// Compare every cached key with a full read from the registry.
    pub async fn check_instance_cache(&self) -> CacheCheckSummary {
        InstanceCacheChecker::new(self.transport.clone(), self.apps.cache().clone())
            .check()
            .await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn registration_state(&self) -> RegistrationState {
        *self.state.borrow()
    }

    pub fn watch_registration_state(&self) -> watch::Receiver<RegistrationState> {
        self.state.subscribe()
    }

    pub fn registered_ids(&self) -> Option<RegisteredIds> {
        self.local.as_ref().and_then(LocalRegistration::ids)
    }

    /// The local instance as last registered, including its heartbeat time.
    pub fn local_instance(&self) -> Option<InstanceDescriptor> {
        self.local.as_ref().map(|local| local.instance.read().clone())
    }

    /// Change the status of the local instance. The new status is also kept
    /// for any later re-registration.
    pub async fn update_instance_status(&self, status: InstanceStatus) -> RegistryResult<()> {
        let local = self
            .local
            .as_ref()
            .ok_or_else(|| RegistryError::Unsupported("client has no local instance".to_string()))?;
        local.instance.write().set_status(status);
        let ids = local
            .ids()
            .ok_or_else(|| RegistryError::Unsupported("instance is not registered yet".to_string()))?;
        self.transport
            .update_instance_status(&ids.service_id, &ids.instance_id, status)
            .await?;
        info!(instance_id = %ids.instance_id, status = %status.as_str(), "instance status updated");
        Ok(())
    }

    /// Stop background work, unregister the local instance and wait for both
    /// tasks. Returns the registration task's error if it gave up earlier.
    pub async fn shutdown(&self) -> RegistryResult<()> {
        self.shutdown.send_replace(true);

        let discovery = self.discovery.lock().take();
        if let Some(handle) = discovery {
            if let Err(e) = handle.await {
                warn!(error = %e, "discovery task panicked");
            }
        }

        let registration = self.registration.lock().take();
        let result = match registration {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "registration task panicked");
                    Err(RegistryError::Shutdown)
                }
            },
            None => Ok(()),
        };

        let token_refresh = self.token_refresh.lock().take();
        if let Some(handle) = token_refresh {
            if let Err(e) = handle.await {
                warn!(error = %e, "token refresh task panicked");
            }
        }
        info!("registry client stopped");
        result
    }
}
