//! Versions of one microservice as seen through the instance cache.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use compass_core::{InstanceDescriptor, RegistryError, RegistryResult, Version, VersionRule};

use crate::cache::InstanceCacheEntry;
use crate::transport::RegistryTransport;

/// What a consumer asks for: a rule, or whatever version is newest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionSelector {
    Latest,
    Rule(VersionRule),
}

impl VersionSelector {
    pub const LATEST: &'static str = "latest";

    pub fn parse(text: &str) -> RegistryResult<Self> {
        if text.trim().eq_ignore_ascii_case(Self::LATEST) {
            return Ok(Self::Latest);
        }
        VersionRule::parse(text).map(Self::Rule)
    }
}

impl fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSelector::Latest => f.write_str(Self::LATEST),
            VersionSelector::Rule(rule) => write!(f, "{rule}"),
        }
    }
}

/// Instances of one (app, service) together with the version of each.
#[derive(Debug, Default)]
pub struct VersionsSnapshot {
    pub revision: String,
    /// Sorted by version descending, then instance id.
    pub instances: Vec<(Version, InstanceDescriptor)>,
}

impl VersionsSnapshot {
    fn matching<'a>(
        &'a self,
        rule: &'a VersionRule,
    ) -> impl Iterator<Item = &'a (Version, InstanceDescriptor)> + 'a {
        self.instances
            .iter()
            .filter(move |(version, _)| rule.is_satisfied_by(version))
    }

    pub fn latest_version(&self) -> Option<Version> {
        self.instances.first().map(|(version, _)| *version)
    }
}

/// Tracks every live version of one microservice.
///
/// The snapshot is rebuilt from each new cache entry and swapped in whole.
pub struct MicroserviceVersions {
    app_id: String,
    service_name: String,
    transport: Arc<dyn RegistryTransport>,
    /// serviceId -> version never changes, so lookups are kept for good.
    known_versions: DashMap<String, Version>,
    snapshot: RwLock<Arc<VersionsSnapshot>>,
    applied: Mutex<Option<Arc<InstanceCacheEntry>>>,
}

impl MicroserviceVersions {
    pub fn new(
        app_id: impl Into<String>,
        service_name: impl Into<String>,
        transport: Arc<dyn RegistryTransport>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            service_name: service_name.into(),
            transport,
            known_versions: DashMap::new(),
            snapshot: RwLock::new(Arc::new(VersionsSnapshot::default())),
            applied: Mutex::new(None),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn snapshot(&self) -> Arc<VersionsSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn revision(&self) -> String {
        self.snapshot.read().revision.clone()
    }

    async fn version_of(&self, service_id: &str) -> RegistryResult<Option<Version>> {
        if let Some(version) = self.known_versions.get(service_id) {
            return Ok(Some(*version));
        }
        let service = match self.transport.get_service(service_id).await {
            Ok(service) => service,
            Err(RegistryError::ServiceNotFound { .. }) => {
                warn!(service_id = %service_id, "instance refers to an unknown service, skipping");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match service.parsed_version() {
            Ok(version) => {
                self.known_versions.insert(service_id.to_string(), version);
                Ok(Some(version))
            }
            Err(e) => {
                warn!(service_id = %service_id, error = %e, "service has an unparsable version, skipping");
                Ok(None)
            }
        }
    }

    /// Rebuild the snapshot from a cache entry. Re-applying the same entry is a no-op.
    pub async fn apply(&self, entry: &Arc<InstanceCacheEntry>) -> RegistryResult<()> {
        let mut applied = self.applied.lock().await;
        if applied.as_ref().is_some_and(|prev| Arc::ptr_eq(prev, entry)) {
            return Ok(());
        }

        let mut versions: HashMap<String, Option<Version>> = HashMap::new();
        for instance in entry.instances.values() {
            if !versions.contains_key(&instance.service_id) {
                let version = self.version_of(&instance.service_id).await?;
                versions.insert(instance.service_id.clone(), version);
            }
        }

        let mut instances: Vec<(Version, InstanceDescriptor)> = entry
            .instances
            .values()
            .filter_map(|instance| {
                versions
                    .get(&instance.service_id)
                    .copied()
                    .flatten()
                    .map(|version| (version, instance.clone()))
            })
            .collect();
        instances.sort_by(|(va, ia), (vb, ib)| vb.cmp(va).then_with(|| ia.instance_id.cmp(&ib.instance_id)));

        debug!(
            app_id = %self.app_id,
            service_name = %self.service_name,
            revision = %entry.revision,
            instances = instances.len(),
            "versions snapshot updated"
        );
        *self.snapshot.write() = Arc::new(VersionsSnapshot {
            revision: entry.revision.clone(),
            instances,
        });
        *applied = Some(entry.clone());
        Ok(())
    }

    /// Instances whose version satisfies `rule`, newest version first.
    pub fn instances_satisfying(&self, rule: &VersionRule) -> Vec<InstanceDescriptor> {
        self.snapshot()
            .matching(rule)
            .map(|(_, instance)| instance.clone())
            .collect()
    }

    /// Highest version present. Ties between equal versions registered under
    /// different service ids are not ordered.
    pub fn latest_version(&self) -> Option<Version> {
        self.snapshot().latest_version()
    }

    pub fn select(&self, selector: &VersionSelector) -> Vec<InstanceDescriptor> {
        match selector {
            VersionSelector::Rule(rule) => self.instances_satisfying(rule),
            VersionSelector::Latest => match self.latest_version() {
                Some(latest) => self.instances_satisfying(&VersionRule::exact(latest)),
                None => Vec::new(),
            },
        }
    }

    /// Distinct versions present, ascending.
    pub fn versions(&self) -> Vec<Version> {
        let mut versions: Vec<Version> = self.snapshot().instances.iter().map(|(v, _)| *v).collect();
        versions.sort();
        versions.dedup();
        versions
    }

    pub fn group_by_compatible_version(&self) -> BTreeMap<VersionRule, Vec<InstanceDescriptor>> {
        group_by_compatible_version(&self.snapshot().instances)
    }
}

/// Group instances under `v+` rules, one per distinct version `v`.
///
/// Each group holds every instance at `v` or newer, since newer providers are
/// expected to serve older consumers. Groups iterate in ascending version order.
pub fn group_by_compatible_version(
    instances: &[(Version, InstanceDescriptor)],
) -> BTreeMap<VersionRule, Vec<InstanceDescriptor>> {
    let mut groups = BTreeMap::new();
    for (version, _) in instances {
        let rule = VersionRule::at_least(*version);
        if groups.contains_key(&rule) {
            continue;
        }
        let mut members: Vec<InstanceDescriptor> = instances
            .iter()
            .filter(|(v, _)| rule.is_satisfied_by(v))
            .map(|(_, instance)| instance.clone())
            .collect();
        members.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        groups.insert(rule, members);
    }
    groups
}
