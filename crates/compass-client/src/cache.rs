//! Instance cache keyed by (app, service, rule).
//!
//! Entries are immutable and published by swapping an `Arc`, so readers never
//! see a half-updated map. A refresh that finds the revision unchanged hands
//! back the very same `Arc`. Concurrent refreshes of one key share a single
//! registry call.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use compass_core::{InstanceDescriptor, RegistryError, RegistryResult, VersionRule};

use crate::diff::InstanceDiff;
use crate::events::{EventBus, InstancesChanged, RegistryEvent};
use crate::transport::{FindInstancesQuery, FindInstancesResult, RegistryTransport};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub app_id: String,
    pub service_name: String,
    pub rule: VersionRule,
}

impl CacheKey {
    pub fn new(app_id: impl Into<String>, service_name: impl Into<String>, rule: VersionRule) -> Self {
        Self {
            app_id: app_id.into(),
            service_name: service_name.into(),
            rule,
        }
    }

    fn query(&self, revision: Option<String>) -> FindInstancesQuery {
        FindInstancesQuery::new(self.app_id.clone(), self.service_name.clone(), self.rule.clone())
            .with_revision(revision)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.app_id, self.service_name, self.rule)
    }
}

/// One immutable snapshot of the instances matching a key.
#[derive(Debug, PartialEq, Eq)]
pub struct InstanceCacheEntry {
    pub key: CacheKey,
    /// Opaque server-assigned revision of this snapshot.
    pub revision: String,
    pub instances: BTreeMap<String, InstanceDescriptor>,
}

impl InstanceCacheEntry {
    pub fn to_vec(&self) -> Vec<InstanceDescriptor> {
        self.instances.values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

type SharedRefresh = Shared<BoxFuture<'static, RegistryResult<Arc<InstanceCacheEntry>>>>;

#[derive(Default)]
struct CacheSlot {
    current: RwLock<Option<Arc<InstanceCacheEntry>>>,
    in_flight: Mutex<Option<SharedRefresh>>,
}

impl CacheSlot {
    fn revision(&self) -> Option<String> {
        self.current.read().as_ref().map(|e| e.revision.clone())
    }

    /// Install `result` if the slot still holds `based_on`; otherwise keep
    /// whatever a concurrent writer installed.
    fn install(
        &self,
        key: &CacheKey,
        based_on: Option<&str>,
        result: FindInstancesResult,
        events: &EventBus,
    ) -> Arc<InstanceCacheEntry> {
        let mut current = self.current.write();
        let previous = current.clone();

        if previous.as_ref().map(|e| e.revision.as_str()) != based_on {
            if let Some(newer) = previous {
                debug!(key = %key, "discarding result superseded by a concurrent update");
                return newer;
            }
        }
        if !result.changed {
            if let Some(previous) = previous {
                return previous;
            }
        }

        let instances: BTreeMap<String, InstanceDescriptor> = result
            .instances
            .into_iter()
            .map(|i| (i.instance_id.clone(), i))
            .collect();
        if let Some(previous) = &previous {
            if previous.revision == result.revision && previous.instances == instances {
                return previous.clone();
            }
        }

        let empty = BTreeMap::new();
        let old = previous.as_ref().map_or(&empty, |e| &e.instances);
        let diff = InstanceDiff::between(old, &instances);
        if key.rule == VersionRule::all() && !old.is_empty() && instances.is_empty() {
            warn!(key = %key, dropped = old.len(), "registry returned no instances, clearing cache");
        }

        let entry = Arc::new(InstanceCacheEntry {
            key: key.clone(),
            revision: result.revision,
            instances,
        });
        *current = Some(entry.clone());
        drop(current);

        if !diff.is_empty() {
            info!(
                key = %key,
                revision = %entry.revision,
                added = diff.added.len(),
                updated = diff.updated.len(),
                deleted = diff.deleted.len(),
                "instances changed"
            );
            events.publish(RegistryEvent::InstancesChanged(Arc::new(InstancesChanged {
                app_id: key.app_id.clone(),
                service_name: key.service_name.clone(),
                rule: key.rule.clone(),
                revision: entry.revision.clone(),
                diff,
            })));
        }
        entry
    }
}

pub struct InstanceCache {
    transport: Arc<dyn RegistryTransport>,
    events: EventBus,
    slots: DashMap<CacheKey, Arc<CacheSlot>>,
}

impl InstanceCache {
    pub fn new(transport: Arc<dyn RegistryTransport>, events: EventBus) -> Self {
        Self {
            transport,
            events,
            slots: DashMap::new(),
        }
    }

    fn slot(&self, key: &CacheKey) -> Arc<CacheSlot> {
        Arc::clone(&self.slots.entry(key.clone()).or_default())
    }

    /// The cached entry, without touching the registry.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<InstanceCacheEntry>> {
        self.slots
            .get(key)
            .and_then(|slot| slot.current.read().clone())
    }

    /// Cached entry, or a blocking first pull whose failure reaches the caller.
    pub async fn get_or_create(&self, key: &CacheKey) -> RegistryResult<Arc<InstanceCacheEntry>> {
        if let Some(entry) = self.get(key) {
            return Ok(entry);
        }
        self.refresh_key(key).await
    }

    pub async fn refresh(&self, entry: &InstanceCacheEntry) -> RegistryResult<Arc<InstanceCacheEntry>> {
        self.refresh_key(&entry.key).await
    }

    /// Re-query `key` with the cached revision; joins a refresh already in flight.
    pub async fn refresh_key(&self, key: &CacheKey) -> RegistryResult<Arc<InstanceCacheEntry>> {
        let slot = self.slot(key);
        let refresh = {
            let mut in_flight = slot.in_flight.lock();
            match in_flight.as_ref() {
                Some(pending) if pending.peek().is_none() => pending.clone(),
                _ => {
                    let pending = Self::pull(
                        self.transport.clone(),
                        self.events.clone(),
                        slot.clone(),
                        key.clone(),
                    )
                    .boxed()
                    .shared();
                    *in_flight = Some(pending.clone());
                    pending
                }
            }
        };

        let result = refresh.await;

        let mut in_flight = slot.in_flight.lock();
        if in_flight.as_ref().is_some_and(|pending| pending.peek().is_some()) {
            *in_flight = None;
        }
        result
    }

    async fn pull(
        transport: Arc<dyn RegistryTransport>,
        events: EventBus,
        slot: Arc<CacheSlot>,
        key: CacheKey,
    ) -> RegistryResult<Arc<InstanceCacheEntry>> {
        let based_on = slot.revision();
        let query = key.query(based_on.clone());

        let result = match transport.find_instances(&query).await {
            Err(RegistryError::StaleRevision { revision, .. }) => {
                debug!(key = %key, revision = %revision, "unknown revision, forcing full pull");
                transport.find_instances(&key.query(None)).await
            }
            other => other,
        };

        match result {
            Ok(result) => {
                let outcome = if result.changed { "changed" } else { "unchanged" };
                metrics::counter!("compass_pulls_total", "result" => outcome).increment(1);
                Ok(slot.install(&key, based_on.as_deref(), result, &events))
            }
            Err(e) => {
                metrics::counter!("compass_pulls_total", "result" => "error").increment(1);
                Err(e)
            }
        }
    }

    /// Apply a watch answer obtained for `based_on`.
    pub fn apply_watch_result(
        &self,
        key: &CacheKey,
        based_on: Option<&str>,
        result: FindInstancesResult,
    ) -> Arc<InstanceCacheEntry> {
        self.slot(key).install(key, based_on, result, &self.events)
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.slots
            .iter()
            .filter(|slot| slot.value().current.read().is_some())
            .map(|slot| slot.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
