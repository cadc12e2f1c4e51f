use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use compass_core::time::{Clock, SystemClock};
use compass_core::{
    FindOutcome, Identity, InstanceDescriptor, InstanceStatus, RegistryError, RegistryResult,
    RegistryStore, ServiceDescriptor, Version, VersionRule,
};

type ServiceKey = (String, String);

struct InstanceRecord {
    instance: InstanceDescriptor,
    last_seen: u64,
}

#[derive(Default)]
struct Tables {
    services: HashMap<String, ServiceDescriptor>,
    versions: HashMap<String, Version>,
    instances: HashMap<String, InstanceRecord>,
    /// Bumped whenever the instance set of an (app, name) pair changes.
    revisions: HashMap<ServiceKey, u64>,
    identities: HashMap<String, Identity>,
}

impl Tables {
    fn key_of(&self, service_id: &str) -> Option<ServiceKey> {
        self.services
            .get(service_id)
            .map(|s| (s.app_id.clone(), s.service_name.clone()))
    }

    fn bump(&mut self, key: ServiceKey) {
        *self.revisions.entry(key).or_default() += 1;
    }
}

/// In-memory registry directory.
///
/// Revisions have the form `<epoch>.<counter>`, where the epoch is the
/// creation time of the store, so a restarted registry never hands out a
/// revision an old client already holds for a different instance set.
pub struct MemoryRegistry {
    tables: RwLock<Tables>,
    clock: Arc<dyn Clock>,
    epoch: u64,
    changes: watch::Sender<u64>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let epoch = clock.now_millis();
        let (changes, _) = watch::channel(0);
        Self {
            tables: RwLock::new(Tables::default()),
            clock,
            epoch,
            changes,
        }
    }

    /// Receiver that ticks whenever any instance set changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }

    fn revision_of(&self, tables: &Tables, key: &ServiceKey) -> String {
        let counter = tables.revisions.get(key).copied().unwrap_or_default();
        format!("{:x}.{}", self.epoch, counter)
    }

    /// Drop instances whose last heartbeat is older than `ttl_ms`.
    pub fn expire_instances(&self, ttl_ms: u64) -> Vec<InstanceDescriptor> {
        let now = self.clock.now_millis();
        let mut tables = self.tables.write();

        let expired: Vec<String> = tables
            .instances
            .iter()
            .filter(|(_, record)| now.saturating_sub(record.last_seen) > ttl_ms)
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for instance_id in expired {
            if let Some(record) = tables.instances.remove(&instance_id) {
                if let Some(key) = tables.key_of(&record.instance.service_id) {
                    tables.bump(key);
                }
                info!(
                    service_id = %record.instance.service_id,
                    instance_id = %instance_id,
                    "instance expired"
                );
                removed.push(record.instance);
            }
        }
        drop(tables);

        if !removed.is_empty() {
            self.notify();
        }
        removed
    }
}

impl RegistryStore for MemoryRegistry {
    fn register_service(&self, service: &ServiceDescriptor) -> RegistryResult<String> {
        let version = service.parsed_version()?;
        let mut tables = self.tables.write();

        let existing = tables.services.values().find(|s| {
            s.app_id == service.app_id
                && s.service_name == service.service_name
                && s.version == service.version
        });
        if let Some(existing) = existing {
            debug!(service_id = %existing.service_id, "service already registered");
            return Ok(existing.service_id.clone());
        }

        let service_id = if service.service_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            service.service_id.clone()
        };
        let mut stored = service.clone();
        stored.service_id = service_id.clone();

        let key = (stored.app_id.clone(), stored.service_name.clone());
        tables.versions.insert(service_id.clone(), version);
        tables.services.insert(service_id.clone(), stored);
        tables.bump(key);
        drop(tables);

        info!(
            service_id = %service_id,
            app_id = %service.app_id,
            service_name = %service.service_name,
            version = %service.version,
            "service registered"
        );
        self.notify();
        Ok(service_id)
    }

    fn get_service(&self, service_id: &str) -> RegistryResult<ServiceDescriptor> {
        self.tables
            .read()
            .services
            .get(service_id)
            .cloned()
            .ok_or_else(|| RegistryError::service_not_found(service_id))
    }

    fn get_all_services(&self) -> RegistryResult<Vec<ServiceDescriptor>> {
        let mut services: Vec<_> = self.tables.read().services.values().cloned().collect();
        services.sort_by(|a, b| {
            (&a.app_id, &a.service_name, &a.version).cmp(&(&b.app_id, &b.service_name, &b.version))
        });
        Ok(services)
    }

    fn register_instance(&self, service_id: &str, instance: &InstanceDescriptor) -> RegistryResult<String> {
        let now = self.clock.now_millis();
        let mut tables = self.tables.write();
        let key = tables
            .key_of(service_id)
            .ok_or_else(|| RegistryError::service_not_found(service_id))?;

        let instance_id = if instance.instance_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            instance.instance_id.clone()
        };
        let mut stored = instance.clone();
        stored.instance_id = instance_id.clone();
        stored.service_id = service_id.to_string();
        stored.last_heartbeat_timestamp = None;

        let changed = tables
            .instances
            .get(&instance_id)
            .is_none_or(|existing| existing.instance != stored);
        tables.instances.insert(
            instance_id.clone(),
            InstanceRecord {
                instance: stored,
                last_seen: now,
            },
        );
        if changed {
            tables.bump(key);
        }
        drop(tables);

        info!(service_id = %service_id, instance_id = %instance_id, "instance registered");
        if changed {
            self.notify();
        }
        Ok(instance_id)
    }

    fn unregister_instance(&self, service_id: &str, instance_id: &str) -> RegistryResult<()> {
        let mut tables = self.tables.write();
        match tables.instances.get(instance_id) {
            Some(record) if record.instance.service_id == service_id => {}
            _ => return Err(RegistryError::instance_not_found(service_id, instance_id)),
        }
        tables.instances.remove(instance_id);
        if let Some(key) = tables.key_of(service_id) {
            tables.bump(key);
        }
        drop(tables);

        info!(service_id = %service_id, instance_id = %instance_id, "instance unregistered");
        self.notify();
        Ok(())
    }

    fn update_instance_status(&self, service_id: &str, instance_id: &str, status: InstanceStatus) -> RegistryResult<()> {
        let mut tables = self.tables.write();
        let record = tables
            .instances
            .get_mut(instance_id)
            .filter(|r| r.instance.service_id == service_id)
            .ok_or_else(|| RegistryError::instance_not_found(service_id, instance_id))?;
        if record.instance.status == status {
            return Ok(());
        }
        record.instance.status = status;
        if let Some(key) = tables.key_of(service_id) {
            tables.bump(key);
        }
        drop(tables);

        self.notify();
        Ok(())
    }

    fn heartbeat(&self, service_id: &str, instance_id: &str) -> RegistryResult<()> {
        let now = self.clock.now_millis();
        let mut tables = self.tables.write();
        let record = tables
            .instances
            .get_mut(instance_id)
            .filter(|r| r.instance.service_id == service_id)
            .ok_or_else(|| RegistryError::instance_not_found(service_id, instance_id))?;
        record.last_seen = now;
        Ok(())
    }

    fn get_instances(&self, service_id: &str) -> RegistryResult<Vec<InstanceDescriptor>> {
        let tables = self.tables.read();
        if !tables.services.contains_key(service_id) {
            return Err(RegistryError::service_not_found(service_id));
        }
        let mut instances: Vec<_> = tables
            .instances
            .values()
            .filter(|r| r.instance.service_id == service_id)
            .map(|r| r.instance.clone())
            .collect();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(instances)
    }

    fn get_all_instances(&self) -> RegistryResult<Vec<InstanceDescriptor>> {
        let mut instances: Vec<_> = self
            .tables
            .read()
            .instances
            .values()
            .map(|r| r.instance.clone())
            .collect();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(instances)
    }

    fn find_instances(
        &self,
        app_id: &str,
        service_name: &str,
        rule: &VersionRule,
        known_revision: Option<&str>,
    ) -> RegistryResult<FindOutcome> {
        let tables = self.tables.read();
        let key = (app_id.to_string(), service_name.to_string());
        let revision = self.revision_of(&tables, &key);
        if known_revision == Some(revision.as_str()) {
            return Ok(FindOutcome::NotModified { revision });
        }

        let mut instances: Vec<_> = tables
            .instances
            .values()
            .filter(|r| {
                tables.services.get(&r.instance.service_id).is_some_and(|s| {
                    s.app_id == app_id
                        && s.service_name == service_name
                        && tables
                            .versions
                            .get(&s.service_id)
                            .is_some_and(|v| rule.is_satisfied_by(v))
                })
            })
            .map(|r| r.instance.clone())
            .collect();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        Ok(FindOutcome::Instances { revision, instances })
    }

    fn add_identity(&self, identity: &Identity) -> RegistryResult<()> {
        self.tables
            .write()
            .identities
            .insert(identity.common_name.clone(), identity.clone());
        Ok(())
    }

    fn get_identity(&self, common_name: &str) -> RegistryResult<Identity> {
        self.tables
            .read()
            .identities
            .get(common_name)
            .cloned()
            .ok_or_else(|| RegistryError::IdentityNotFound {
                common_name: common_name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compass_core::time::ManualClock;

    fn service(version: &str) -> ServiceDescriptor {
        ServiceDescriptor::new("app", "svc", version)
    }

    fn instance(host: &str) -> InstanceDescriptor {
        InstanceDescriptor::new(host, vec![format!("rest://{host}:8080")])
    }

    fn instances_of(outcome: FindOutcome) -> Vec<InstanceDescriptor> {
        match outcome {
            FindOutcome::Instances { instances, .. } => instances,
            FindOutcome::NotModified { .. } => panic!("expected instances"),
        }
    }

    #[test]
    fn test_register_service_is_idempotent() {
        let store = MemoryRegistry::new();
        let first = store.register_service(&service("1.0.0")).unwrap();
        let second = store.register_service(&service("1.0.0")).unwrap();
        let other = store.register_service(&service("2.0.0")).unwrap();
        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(store.get_service(&first).unwrap().service_id, first);
    }

    #[test]
    fn test_register_service_rejects_bad_version() {
        let store = MemoryRegistry::new();
        let err = store.register_service(&service("one")).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidVersion { .. }));
    }

    #[test]
    fn test_register_instance_requires_service() {
        let store = MemoryRegistry::new();
        let err = store.register_instance("missing", &instance("a")).unwrap_err();
        assert!(matches!(err, RegistryError::ServiceNotFound { .. }));
    }

    #[test]
    fn test_find_filters_by_rule() {
        let store = MemoryRegistry::new();
        let v1 = store.register_service(&service("1.0.0")).unwrap();
        let v2 = store.register_service(&service("2.0.0")).unwrap();
        let i1 = store.register_instance(&v1, &instance("a")).unwrap();
        let i2 = store.register_instance(&v2, &instance("b")).unwrap();

        let rule = VersionRule::parse("2.0.0+").unwrap();
        let found = instances_of(store.find_instances("app", "svc", &rule, None).unwrap());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].instance_id, i2);

        let rule = VersionRule::parse("1.0.0-2.0.0").unwrap();
        let found = instances_of(store.find_instances("app", "svc", &rule, None).unwrap());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].instance_id, i1);
    }

    #[test]
    fn test_revision_short_circuit() {
        let store = MemoryRegistry::new();
        let sid = store.register_service(&service("1.0.0")).unwrap();
        store.register_instance(&sid, &instance("a")).unwrap();

        let all = VersionRule::all();
        let first = store.find_instances("app", "svc", &all, None).unwrap();
        let revision = first.revision().to_string();

        let again = store.find_instances("app", "svc", &all, Some(&revision)).unwrap();
        assert_eq!(again, FindOutcome::NotModified { revision: revision.clone() });

        // heartbeats do not change the instance set
        let iid = instances_of(first)[0].instance_id.clone();
        store.heartbeat(&sid, &iid).unwrap();
        let after_heartbeat = store.find_instances("app", "svc", &all, Some(&revision)).unwrap();
        assert!(matches!(after_heartbeat, FindOutcome::NotModified { .. }));

        store.update_instance_status(&sid, &iid, InstanceStatus::Down).unwrap();
        let changed = store.find_instances("app", "svc", &all, Some(&revision)).unwrap();
        assert_ne!(changed.revision(), revision);
        assert_eq!(instances_of(changed)[0].status, InstanceStatus::Down);
    }

    #[test]
    fn test_unknown_service_yields_empty_list() {
        let store = MemoryRegistry::new();
        let all = VersionRule::all();
        let outcome = store.find_instances("app", "nobody", &all, None).unwrap();
        let revision = outcome.revision().to_string();
        assert!(instances_of(outcome).is_empty());
        let again = store.find_instances("app", "nobody", &all, Some(&revision)).unwrap();
        assert!(matches!(again, FindOutcome::NotModified { .. }));
    }

    #[test]
    fn test_reregistering_same_instance_keeps_revision() {
        let store = MemoryRegistry::new();
        let sid = store.register_service(&service("1.0.0")).unwrap();
        let iid = store.register_instance(&sid, &instance("a")).unwrap();
        let revision = store
            .find_instances("app", "svc", &VersionRule::all(), None)
            .unwrap()
            .revision()
            .to_string();

        let mut again = instance("a");
        again.instance_id = iid.clone();
        assert_eq!(store.register_instance(&sid, &again).unwrap(), iid);
        let outcome = store
            .find_instances("app", "svc", &VersionRule::all(), Some(&revision))
            .unwrap();
        assert!(matches!(outcome, FindOutcome::NotModified { .. }));
    }

    #[test]
    fn test_heartbeat_for_unknown_instance_fails() {
        let store = MemoryRegistry::new();
        let sid = store.register_service(&service("1.0.0")).unwrap();
        let err = store.heartbeat(&sid, "ghost").unwrap_err();
        assert!(matches!(err, RegistryError::InstanceNotFound { .. }));
    }

    #[test]
    fn test_expire_instances() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = MemoryRegistry::with_clock(clock.clone());
        let sid = store.register_service(&service("1.0.0")).unwrap();
        let stale = store.register_instance(&sid, &instance("a")).unwrap();
        clock.advance(20_000);
        let fresh = store.register_instance(&sid, &instance("b")).unwrap();
        clock.advance(15_000);

        let removed = store.expire_instances(30_000);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].instance_id, stale);
        let left = store.get_instances(&sid).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].instance_id, fresh);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let store = MemoryRegistry::new();
        let mut changes = store.subscribe();
        let sid = store.register_service(&service("1.0.0")).unwrap();
        store.register_instance(&sid, &instance("a")).unwrap();
        changes.changed().await.unwrap();
        assert!(*changes.borrow_and_update() >= 1);
    }
}
