//! Keeps tracked microservices fresh, by periodic pulls or by long-poll watches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use compass_core::{RegistryError, TransportError, VersionRule};

use crate::app_manager::AppManager;
use crate::backoff::{sleep_or_shutdown, Backoff};
use crate::config::{RegistryConfig, RetryPolicy};
use crate::events::{EventBus, RegistryEvent};
use crate::transport::{FindInstancesQuery, RegistryTransport};
use crate::versions::MicroserviceVersions;

type ServiceKey = (String, String);

fn key_of(versions: &MicroserviceVersions) -> ServiceKey {
    (versions.app_id().to_string(), versions.service_name().to_string())
}

pub struct DiscoveryLoop {
    apps: Arc<AppManager>,
    transport: Arc<dyn RegistryTransport>,
    events: EventBus,
    pull_interval: Duration,
    request_timeout: Duration,
    watch_wait: Duration,
    watch: bool,
    retry: RetryPolicy,
    degraded: Arc<DashSet<ServiceKey>>,
    shutdown: watch::Receiver<bool>,
}

impl DiscoveryLoop {
    pub fn new(
        apps: Arc<AppManager>,
        transport: Arc<dyn RegistryTransport>,
        events: EventBus,
        config: &RegistryConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            apps,
            transport,
            events,
            pull_interval: config.pull_interval(),
            request_timeout: config.request_timeout(),
            watch_wait: config.watch_wait(),
            watch: config.watch,
            retry: RetryPolicy {
                max_wait_ms: None,
                ..config.retry.clone()
            },
            degraded: Arc::new(DashSet::new()),
            shutdown,
        }
    }

    pub async fn run(self) {
        if self.watch && self.transport.supports_watch() {
            info!(wait_ms = self.watch_wait.as_millis() as u64, "discovery started in watch mode");
            self.run_watch().await
        } else {
            if self.watch {
                warn!("transport cannot watch, falling back to polling");
            }
            info!(interval_ms = self.pull_interval.as_millis() as u64, "discovery started in poll mode");
            self.run_poll().await
        }
    }

    async fn run_poll(mut self) {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.pull_interval, self.pull_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.changed() => break,
            }
            let tracked = self.apps.tracked();
            self.poll_all(tracked).await;
        }
        debug!("discovery poll loop stopped");
    }

    async fn poll_all(&self, tracked: Vec<Arc<MicroserviceVersions>>) {
        let polls = tracked.iter().map(|versions| self.poll_one(versions));
        futures::future::join_all(polls).await;
    }

    async fn poll_one(&self, versions: &MicroserviceVersions) {
        match tokio::time::timeout(self.request_timeout, self.apps.refresh(versions)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                app_id = %versions.app_id(),
                service_name = %versions.service_name(),
                error = %e,
                "instance pull failed, keeping cached instances"
            ),
            Err(_) => warn!(
                app_id = %versions.app_id(),
                service_name = %versions.service_name(),
                timeout_ms = self.request_timeout.as_millis() as u64,
                "instance pull timed out, keeping cached instances"
            ),
        }
    }

    /// One watcher per tracked service. Services whose watch is failing are
    /// polled on the regular interval until the watch recovers.
    async fn run_watch(mut self) {
        let mut watchers: HashMap<ServiceKey, JoinHandle<()>> = HashMap::new();
        let mut ticker = tokio::time::interval(self.pull_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let degraded: Vec<_> = self
                        .apps
                        .tracked()
                        .into_iter()
                        .filter(|versions| self.degraded.contains(&key_of(versions)))
                        .collect();
                    self.poll_all(degraded).await;
                }
                _ = self.apps.tracked_changed() => {}
                _ = self.shutdown.changed() => break,
            }

            watchers.retain(|_, handle| !handle.is_finished());
            for versions in self.apps.tracked() {
                let key = key_of(&versions);
                if watchers.contains_key(&key) {
                    continue;
                }
                let watcher = Watcher {
                    apps: self.apps.clone(),
                    transport: self.transport.clone(),
                    events: self.events.clone(),
                    degraded: self.degraded.clone(),
                    wait: self.watch_wait,
                    request_timeout: self.request_timeout,
                    backoff: Backoff::new(self.retry.clone()),
                    max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
                    versions,
                    shutdown: self.shutdown.clone(),
                };
                debug!(app_id = %key.0, service_name = %key.1, "starting watch");
                watchers.insert(key, tokio::spawn(watcher.run()));
            }
        }

        futures::future::join_all(watchers.into_values()).await;
        debug!("discovery watch loop stopped");
    }
}

struct Watcher {
    apps: Arc<AppManager>,
    transport: Arc<dyn RegistryTransport>,
    events: EventBus,
    degraded: Arc<DashSet<ServiceKey>>,
    wait: Duration,
    request_timeout: Duration,
    backoff: Backoff,
    max_backoff: Duration,
    versions: Arc<MicroserviceVersions>,
    shutdown: watch::Receiver<bool>,
}

impl Watcher {
    async fn run(mut self) {
        let key = key_of(&self.versions);
        loop {
            if *self.shutdown.borrow() {
                return;
            }
            let based_on = self.apps.cached_revision(&self.versions);
            let query = FindInstancesQuery::new(&key.0, &key.1, VersionRule::all())
                .with_revision(based_on.clone());

            let call = tokio::time::timeout(
                self.wait + self.request_timeout,
                self.transport.watch(&query, self.wait),
            );
            let outcome = tokio::select! {
                outcome = call => outcome,
                _ = self.shutdown.changed() => return,
            };
            let result = outcome.unwrap_or_else(|_| {
                Err(TransportError::timeout(format!("watch {}/{}", key.0, key.1)).into())
            });

            match result {
                Ok(result) => {
                    self.backoff.reset();
                    if self.degraded.remove(&key).is_some() {
                        info!(app_id = %key.0, service_name = %key.1, "watch recovered");
                        self.events.publish(RegistryEvent::WatchRecovered {
                            app_id: key.0.clone(),
                            service_name: key.1.clone(),
                        });
                    }
                    if let Err(e) = self
                        .apps
                        .apply_watch_result(&self.versions, based_on.as_deref(), result)
                        .await
                    {
                        warn!(app_id = %key.0, service_name = %key.1, error = %e, "failed to apply watch result");
                    }
                }
                Err(RegistryError::StaleRevision { revision, .. }) => {
                    debug!(app_id = %key.0, service_name = %key.1, revision = %revision, "watch revision unknown, pulling");
                    if let Err(e) = self.apps.refresh(&self.versions).await {
                        warn!(app_id = %key.0, service_name = %key.1, error = %e, "instance pull failed");
                    }
                }
                Err(e) => {
                    if self.degraded.insert(key.clone()) {
                        warn!(app_id = %key.0, service_name = %key.1, error = %e, "watch failed, polling until it recovers");
                        self.events.publish(RegistryEvent::WatchDegraded {
                            app_id: key.0.clone(),
                            service_name: key.1.clone(),
                        });
                    }
                    let delay = self.backoff.next_delay().unwrap_or(self.max_backoff);
                    if !sleep_or_shutdown(delay, &mut self.shutdown).await {
                        return;
                    }
                }
            }
        }
    }
}
