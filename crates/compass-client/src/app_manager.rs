use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Notify, OnceCell};
use tracing::info;

use compass_core::{InstanceDescriptor, RegistryError, RegistryResult, VersionRule};

use crate::cache::{CacheKey, InstanceCache};
use crate::transport::{FindInstancesResult, RegistryTransport};
use crate::versions::{MicroserviceVersions, VersionSelector};

type ServiceKey = (String, String);

/// Routes "service + version rule" lookups to the tracked versions of each
/// microservice, creating the tracking state on first use.
pub struct AppManager {
    transport: Arc<dyn RegistryTransport>,
    cache: Arc<InstanceCache>,
    services: DashMap<ServiceKey, Arc<OnceCell<Arc<MicroserviceVersions>>>>,
    selectors: DashMap<String, VersionSelector>,
    tracked_changed: Notify,
}

impl AppManager {
    pub fn new(transport: Arc<dyn RegistryTransport>, cache: Arc<InstanceCache>) -> Self {
        Self {
            transport,
            cache,
            services: DashMap::new(),
            selectors: DashMap::new(),
            tracked_changed: Notify::new(),
        }
    }

    pub fn cache(&self) -> &Arc<InstanceCache> {
        &self.cache
    }

    fn all_versions_key(app_id: &str, service_name: &str) -> CacheKey {
        CacheKey::new(app_id, service_name, VersionRule::all())
    }

    /// Parse a rule or `latest`, memoized by the literal text.
    pub fn parse_selector(&self, text: &str) -> RegistryResult<VersionSelector> {
        if let Some(selector) = self.selectors.get(text) {
            return Ok(selector.clone());
        }
        let selector = VersionSelector::parse(text)?;
        self.selectors.insert(text.to_string(), selector.clone());
        Ok(selector)
    }

    /// Tracked versions of `app_id/service_name`.
    ///
    /// The first call pulls from the registry and fails if that pull fails;
    /// concurrent first callers wait on the same pull and share the result.
    pub async fn get_or_create_microservice_versions(
        &self,
        app_id: &str,
        service_name: &str,
    ) -> RegistryResult<Arc<MicroserviceVersions>> {
        let cell = Arc::clone(
            &self
                .services
                .entry((app_id.to_string(), service_name.to_string()))
                .or_default(),
        );
        if let Some(versions) = cell.get() {
            return Ok(versions.clone());
        }
        let versions = cell
            .get_or_try_init(|| async {
                let entry = self
                    .cache
                    .get_or_create(&Self::all_versions_key(app_id, service_name))
                    .await?;
                let versions =
                    MicroserviceVersions::new(app_id, service_name, self.transport.clone());
                versions.apply(&entry).await?;
                info!(
                    app_id = %app_id,
                    service_name = %service_name,
                    instances = entry.instances.len(),
                    "tracking microservice"
                );
                Ok::<_, RegistryError>(Arc::new(versions))
            })
            .await?;
        self.tracked_changed.notify_one();
        Ok(versions.clone())
    }

    /// Instances of `app_id/service_name` matching `rule` (`latest` allowed).
    pub async fn resolve(
        &self,
        app_id: &str,
        service_name: &str,
        rule: &str,
    ) -> RegistryResult<Vec<InstanceDescriptor>> {
        let selector = self.parse_selector(rule)?;
        let versions = self
            .get_or_create_microservice_versions(app_id, service_name)
            .await?;
        let instances = versions.select(&selector);
        if instances.is_empty() {
            return Err(RegistryError::no_compatible_version(app_id, service_name, rule));
        }
        Ok(instances)
    }

    pub fn tracked(&self) -> Vec<Arc<MicroserviceVersions>> {
        self.services
            .iter()
            .filter_map(|cell| cell.value().get().cloned())
            .collect()
    }

    /// Resolves when a microservice becomes tracked. A change made while no
    /// one was waiting is kept and wakes the next caller immediately.
    pub async fn tracked_changed(&self) {
        self.tracked_changed.notified().await
    }

    /// Pull `versions` again and rebuild its snapshot.
    pub async fn refresh(&self, versions: &MicroserviceVersions) -> RegistryResult<()> {
        let key = Self::all_versions_key(versions.app_id(), versions.service_name());
        let entry = self.cache.refresh_key(&key).await?;
        versions.apply(&entry).await
    }

    /// Revision the cache holds for `versions`, used as the watch baseline.
    pub fn cached_revision(&self, versions: &MicroserviceVersions) -> Option<String> {
        let key = Self::all_versions_key(versions.app_id(), versions.service_name());
        self.cache.get(&key).map(|entry| entry.revision.clone())
    }

    pub async fn apply_watch_result(
        &self,
        versions: &MicroserviceVersions,
        based_on: Option<&str>,
        result: FindInstancesResult,
    ) -> RegistryResult<()> {
        let key = Self::all_versions_key(versions.app_id(), versions.service_name());
        let entry = self.cache.apply_watch_result(&key, based_on, result);
        versions.apply(&entry).await
    }
}
