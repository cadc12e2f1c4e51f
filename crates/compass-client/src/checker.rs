//! Diagnosis of the instance cache against the registry.
//!
//! The check is read-only: a differing revision only means a pull is due, a
//! differing instance set under the same revision means the cache went wrong.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use compass_core::time::{Clock, SystemClock};

use crate::cache::{CacheKey, InstanceCache};
use crate::transport::{FindInstancesQuery, RegistryTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheStatus {
    Normal,
    Unknown,
    Abnormal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheCheckResult {
    pub app_id: String,
    pub service_name: String,
    pub rule: String,
    pub status: CacheStatus,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheCheckSummary {
    /// Worst status over all producers.
    pub status: CacheStatus,
    pub timestamp_ms: u64,
    /// Only keys that are not `Normal`.
    pub producers: Vec<CacheCheckResult>,
}

pub struct InstanceCacheChecker {
    transport: Arc<dyn RegistryTransport>,
    cache: Arc<InstanceCache>,
    clock: Arc<dyn Clock>,
}

impl InstanceCacheChecker {
    pub fn new(transport: Arc<dyn RegistryTransport>, cache: Arc<InstanceCache>) -> Self {
        Self {
            transport,
            cache,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn check(&self) -> CacheCheckSummary {
        let keys = self.cache.keys();
        let results = join_all(keys.iter().map(|key| self.check_key(key))).await;

        let mut producers: Vec<CacheCheckResult> = results
            .into_iter()
            .filter(|r| r.status != CacheStatus::Normal)
            .collect();
        producers.sort_by(|a, b| (&a.app_id, &a.service_name, &a.rule).cmp(&(&b.app_id, &b.service_name, &b.rule)));
        let status = producers
            .iter()
            .map(|r| r.status)
            .max()
            .unwrap_or(CacheStatus::Normal);

        if status == CacheStatus::Normal {
            info!(keys = keys.len(), "instance cache matches the registry");
        } else {
            warn!(keys = keys.len(), inconsistent = producers.len(), ?status, "instance cache check found differences");
        }
        CacheCheckSummary {
            status,
            timestamp_ms: self.clock.now_millis(),
            producers,
        }
    }

    async fn check_key(&self, key: &CacheKey) -> CacheCheckResult {
        let (status, detail) = match self.compare(key).await {
            Ok(()) => (CacheStatus::Normal, String::new()),
            Err(outcome) => outcome,
        };
        CacheCheckResult {
            app_id: key.app_id.clone(),
            service_name: key.service_name.clone(),
            rule: key.rule.to_string(),
            status,
            detail,
        }
    }

    async fn compare(&self, key: &CacheKey) -> Result<(), (CacheStatus, String)> {
        let Some(local) = self.cache.get(key) else {
            return Ok(());
        };
        let query = FindInstancesQuery::new(key.app_id.clone(), key.service_name.clone(), key.rule.clone());
        let remote = self.transport.find_instances(&query).await.map_err(|e| {
            (CacheStatus::Unknown, format!("failed to find instances in the registry: {e}"))
        })?;

        if remote.revision != local.revision {
            return Err((
                CacheStatus::Unknown,
                format!(
                    "revision differs and will be synchronized by the next pull, local={} remote={}",
                    local.revision, remote.revision
                ),
            ));
        }
        let remote_ids: BTreeSet<&str> = remote.instances.iter().map(|i| i.instance_id.as_str()).collect();
        let local_ids: BTreeSet<&str> = local.instances.keys().map(String::as_str).collect();
        if remote_ids != local_ids {
            return Err((CacheStatus::Abnormal, "instance cache does not match the registry".into()));
        }
        Ok(())
    }
}
