//! Registration life cycle of the local instance.
//!
//! ```text
//! Init -> RegisteringService -> RegisteringInstance -> Heartbeating
//!                                      ^                   |
//!                                      +----- Failed <-----+
//! any -> ShuttingDown -> Terminated
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use compass_core::{time, InstanceDescriptor, RegistryError, RegistryResult, ServiceDescriptor};

use crate::backoff::{sleep_or_shutdown, Backoff};
use crate::config::{RegistryConfig, RetryPolicy};
use crate::events::{EventBus, RegistryEvent};
use crate::transport::RegistryTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationState {
    Init,
    RegisteringService,
    RegisteringInstance,
    Heartbeating,
    Failed,
    ShuttingDown,
    Terminated,
}

impl RegistrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationState::Init => "init",
            RegistrationState::RegisteringService => "registering_service",
            RegistrationState::RegisteringInstance => "registering_instance",
            RegistrationState::Heartbeating => "heartbeating",
            RegistrationState::Failed => "failed",
            RegistrationState::ShuttingDown => "shutting_down",
            RegistrationState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ids the registry assigned to the local service and instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredIds {
    pub service_id: String,
    pub instance_id: String,
}

/// State shared between the running task and the client facade.
#[derive(Clone)]
pub struct LocalRegistration {
    pub service: Arc<RwLock<ServiceDescriptor>>,
    pub instance: Arc<RwLock<InstanceDescriptor>>,
    pub ids: Arc<RwLock<Option<RegisteredIds>>>,
}

impl LocalRegistration {
    pub fn new(service: ServiceDescriptor, instance: InstanceDescriptor) -> Self {
        Self {
            service: Arc::new(RwLock::new(service)),
            instance: Arc::new(RwLock::new(instance)),
            ids: Arc::new(RwLock::new(None)),
        }
    }

    pub fn ids(&self) -> Option<RegisteredIds> {
        self.ids.read().clone()
    }
}

enum HeartbeatExit {
    Shutdown,
    Failed,
}

/// Drives one local instance through registration and heartbeats.
pub struct RegistrationTask {
    transport: Arc<dyn RegistryTransport>,
    local: LocalRegistration,
    retry: RetryPolicy,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    unregister_timeout: Duration,
    state: Arc<watch::Sender<RegistrationState>>,
    events: EventBus,
    shutdown: watch::Receiver<bool>,
}

impl RegistrationTask {
    pub fn new(
        transport: Arc<dyn RegistryTransport>,
        local: LocalRegistration,
        config: &RegistryConfig,
        state: Arc<watch::Sender<RegistrationState>>,
        events: EventBus,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport,
            local,
            retry: config.retry.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            unregister_timeout: config.unregister_timeout(),
            state,
            events,
            shutdown,
        }
    }

    fn set_state(&self, to: RegistrationState) {
        let from = self.state.send_replace(to);
        if from != to {
            info!(from = %from, to = %to, "registration state changed");
            self.events
                .publish(RegistryEvent::RegistrationStateChanged { from, to });
        }
    }

    /// Run until shutdown. Returns an error only when the startup retry budget
    /// is spent or a registration is rejected outright.
    pub async fn run(mut self) -> RegistryResult<()> {
        self.set_state(RegistrationState::RegisteringService);
        let service_id = match self.register_service().await {
            Ok(id) => id,
            Err(RegistryError::Shutdown) => {
                self.finish(None).await;
                return Ok(());
            }
            Err(e) => return Err(self.fail_fatally(e)),
        };

        // max_wait only bounds startup; once registered, re-registration retries forever
        let mut policy = self.retry.clone();
        loop {
            self.set_state(RegistrationState::RegisteringInstance);
            let instance_id = match self.register_instance(&service_id, &policy).await {
                Ok(id) => id,
                Err(RegistryError::Shutdown) => {
                    let previous = self.local.ids();
                    self.finish(previous).await;
                    return Ok(());
                }
                Err(e) => return Err(self.fail_fatally(e)),
            };
            let ids = RegisteredIds {
                service_id: service_id.clone(),
                instance_id,
            };
            *self.local.ids.write() = Some(ids.clone());

            self.set_state(RegistrationState::Heartbeating);
            match self.heartbeat_loop(&ids).await {
                HeartbeatExit::Shutdown => {
                    self.finish(Some(ids)).await;
                    return Ok(());
                }
                HeartbeatExit::Failed => {
                    self.set_state(RegistrationState::Failed);
                    policy.max_wait_ms = None;
                }
            }
        }
    }

    fn fail_fatally(&self, err: RegistryError) -> RegistryError {
        error!(error = %err, "registration gave up");
        self.set_state(RegistrationState::Terminated);
        err
    }

    async fn register_service(&mut self) -> RegistryResult<String> {
        let transport = self.transport.clone();
        let service = self.local.service.clone();
        let service_id = retry_stage(
            "register_service",
            &self.retry,
            &mut self.shutdown,
            || {
                let transport = transport.clone();
                let descriptor = service.read().clone();
                async move { transport.register_service(&descriptor).await }
            },
        )
        .await?;

        let mut service = self.local.service.write();
        service.service_id = service_id.clone();
        info!(
            service_id = %service_id,
            app_id = %service.app_id,
            service_name = %service.service_name,
            version = %service.version,
            "service registered"
        );
        Ok(service_id)
    }

    /// Register the instance, re-creating the service under the same id if the
    /// registry lost it.
    async fn register_instance(
        &mut self,
        service_id: &str,
        policy: &RetryPolicy,
    ) -> RegistryResult<String> {
        let transport = self.transport.clone();
        let service = self.local.service.clone();
        let instance = self.local.instance.clone();
        let instance_id = retry_stage(
            "register_instance",
            policy,
            &mut self.shutdown,
            || {
                let transport = transport.clone();
                let service = service.read().clone();
                let instance = instance.read().clone();
                async move {
                    match transport.register_instance(&service.service_id, &instance).await {
                        Err(RegistryError::ServiceNotFound { .. }) => {
                            warn!(service_id = %service.service_id, "registry lost the service, registering it again");
                            transport.register_service(&service).await?;
                            transport.register_instance(&service.service_id, &instance).await
                        }
                        other => other,
                    }
                }
            },
        )
        .await?;

        let mut local = self.local.instance.write();
        local.instance_id = instance_id.clone();
        local.service_id = service_id.to_string();
        info!(service_id = %service_id, instance_id = %instance_id, "instance registered");
        Ok(instance_id)
    }

    /// Heartbeat on a fixed tick. Each beat is awaited before the next tick is
    /// taken and missed ticks are skipped, so at most one is ever in flight.
    async fn heartbeat_loop(&mut self, ids: &RegisteredIds) -> HeartbeatExit {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if *self.shutdown.borrow() {
                return HeartbeatExit::Shutdown;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.changed() => return HeartbeatExit::Shutdown,
            }

            let beat = tokio::time::timeout(
                self.heartbeat_timeout,
                self.transport.heartbeat(&ids.service_id, &ids.instance_id),
            );
            let outcome = tokio::select! {
                outcome = beat => outcome,
                _ = self.shutdown.changed() => return HeartbeatExit::Shutdown,
            };

            let reason = match outcome {
                Ok(Ok(true)) => {
                    metrics::counter!("compass_heartbeats_total", "result" => "accepted").increment(1);
                    self.local.instance.write().update_heartbeat(time::now());
                    debug!(instance_id = %ids.instance_id, "heartbeat accepted");
                    continue;
                }
                Ok(Ok(false)) => "registry does not know the instance".to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "heartbeat timed out after {}ms",
                    self.heartbeat_timeout.as_millis()
                ),
            };

            metrics::counter!("compass_heartbeats_total", "result" => "failed").increment(1);
            warn!(
                service_id = %ids.service_id,
                instance_id = %ids.instance_id,
                reason = %reason,
                "heartbeat failed, re-registering instance"
            );
            self.events.publish(RegistryEvent::HeartbeatFailed {
                service_id: ids.service_id.clone(),
                instance_id: ids.instance_id.clone(),
                reason,
            });
            return HeartbeatExit::Failed;
        }
    }

    async fn finish(&mut self, ids: Option<RegisteredIds>) {
        self.set_state(RegistrationState::ShuttingDown);
        if let Some(ids) = ids {
            let unregister = self
                .transport
                .unregister_instance(&ids.service_id, &ids.instance_id);
            match tokio::time::timeout(self.unregister_timeout, unregister).await {
                Ok(Ok(())) => info!(instance_id = %ids.instance_id, "instance unregistered"),
                Ok(Err(e)) => warn!(instance_id = %ids.instance_id, error = %e, "unregister failed"),
                Err(_) => warn!(instance_id = %ids.instance_id, "unregister timed out"),
            }
            *self.local.ids.write() = None;
        }
        self.set_state(RegistrationState::Terminated);
    }
}

/// Retry `op` with backoff until it succeeds, fails permanently, the retry
/// budget runs out or shutdown is signalled.
async fn retry_stage<T, F, Fut>(
    stage: &'static str,
    policy: &RetryPolicy,
    shutdown: &mut watch::Receiver<bool>,
    mut op: F,
) -> RegistryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RegistryResult<T>>,
{
    let mut backoff = Backoff::new(policy.clone());
    loop {
        if *shutdown.borrow() {
            return Err(RegistryError::Shutdown);
        }
        let err = match op().await {
            Ok(value) => {
                metrics::counter!("compass_registrations_total", "stage" => stage, "result" => "ok")
                    .increment(1);
                return Ok(value);
            }
            Err(e) => e,
        };
        metrics::counter!("compass_registrations_total", "stage" => stage, "result" => "error")
            .increment(1);

        if !err.is_retriable() {
            return Err(err);
        }
        let Some(delay) = backoff.next_delay() else {
            return Err(RegistryError::RegistrationTimeout {
                stage: stage.to_string(),
                waited_ms: backoff.elapsed().as_millis() as u64,
            });
        };
        warn!(
            stage,
            attempt = backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "registry call failed, backing off"
        );
        if !sleep_or_shutdown(delay, shutdown).await {
            return Err(RegistryError::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use compass_core::RegistryStore;
    use compass_store::MemoryRegistry;

    use crate::test_support::{instance, CountingTransport};

    struct Harness {
        transport: Arc<CountingTransport>,
        local: LocalRegistration,
        state: watch::Receiver<RegistrationState>,
        shutdown: watch::Sender<bool>,
        events: tokio::sync::broadcast::Receiver<RegistryEvent>,
        handle: tokio::task::JoinHandle<RegistryResult<()>>,
    }

    fn config(max_wait_ms: Option<u64>) -> RegistryConfig {
        RegistryConfig {
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 500,
            unregister_timeout_ms: 500,
            retry: RetryPolicy {
                initial_backoff_ms: 100,
                max_backoff_ms: 400,
                max_wait_ms,
            },
            ..Default::default()
        }
    }

    fn start(transport: Arc<CountingTransport>, config: RegistryConfig) -> Harness {
        let local = LocalRegistration::new(ServiceDescriptor::new("app", "svc", "1.0.0"), instance("local"));
        let (state_tx, state) = watch::channel(RegistrationState::Init);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let bus = EventBus::default();
        let events = bus.subscribe();
        let task = RegistrationTask::new(
            transport.clone(),
            local.clone(),
            &config,
            Arc::new(state_tx),
            bus,
            shutdown_rx,
        );
        Harness {
            transport,
            local,
            state,
            shutdown,
            events,
            handle: tokio::spawn(task.run()),
        }
    }

    async fn wait_for(state: &mut watch::Receiver<RegistrationState>, wanted: RegistrationState) {
        state.wait_for(|s| *s == wanted).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_registers_then_heartbeats() {
        let transport = Arc::new(CountingTransport::new(Arc::new(MemoryRegistry::new())));
        let mut h = start(transport, config(None));
        wait_for(&mut h.state, RegistrationState::Heartbeating).await;

        let ids = h.local.ids().unwrap();
        assert!(!ids.service_id.is_empty());
        let registered = h.transport.registry().get_instances(&ids.service_id).unwrap();
        assert_eq!(registered.len(), 1);

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert!(h.transport.heartbeat_calls.load(Ordering::SeqCst) >= 3);
        assert!(h.local.instance.read().last_heartbeat_timestamp.is_some());

        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap().unwrap();
        assert_eq!(*h.state.borrow(), RegistrationState::Terminated);
        assert_eq!(h.transport.unregister_calls.load(Ordering::SeqCst), 1);
        assert!(h.transport.registry().get_instances(&ids.service_id).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_instance_is_registered_again() {
        let transport = Arc::new(CountingTransport::new(Arc::new(MemoryRegistry::new())));
        let mut h = start(transport, config(None));
        wait_for(&mut h.state, RegistrationState::Heartbeating).await;
        let ids = h.local.ids().unwrap();

        // the registry forgets the instance, as after a restart
        h.transport
            .registry()
            .unregister_instance(&ids.service_id, &ids.instance_id)
            .unwrap();

        let mut seen = Vec::new();
        let mut heartbeat_failed = false;
        while seen.last() != Some(&RegistrationState::Heartbeating) || !heartbeat_failed {
            match h.events.recv().await.unwrap() {
                RegistryEvent::RegistrationStateChanged { to, .. } if heartbeat_failed => seen.push(to),
                RegistryEvent::HeartbeatFailed { instance_id, .. } => {
                    assert_eq!(instance_id, ids.instance_id);
                    heartbeat_failed = true;
                }
                _ => {}
            }
        }
        assert_eq!(
            seen,
            vec![
                RegistrationState::Failed,
                RegistrationState::RegisteringInstance,
                RegistrationState::Heartbeating,
            ]
        );

        assert_eq!(h.transport.register_instance_calls.load(Ordering::SeqCst), 2);
        let again = h.local.ids().unwrap();
        assert_eq!(again.service_id, ids.service_id);
        assert_eq!(h.transport.registry().get_instances(&ids.service_id).unwrap().len(), 1);

        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_heartbeats_never_overlap() {
        let transport = Arc::new(CountingTransport::new(Arc::new(MemoryRegistry::new())));
        *transport.heartbeat_delay.lock() = Duration::from_millis(450);
        let mut cfg = config(None);
        cfg.heartbeat_interval_ms = 100;
        let mut h = start(transport, cfg);
        wait_for(&mut h.state, RegistrationState::Heartbeating).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(h.transport.heartbeat_calls.load(Ordering::SeqCst) >= 5);
        assert_eq!(h.transport.max_heartbeats_in_flight.load(Ordering::SeqCst), 1);

        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_turns_into_timeout() {
        let transport = Arc::new(CountingTransport::new(Arc::new(MemoryRegistry::new())));
        transport.fail_registrations.store(true, Ordering::SeqCst);
        let h = start(transport, config(Some(1_000)));

        let err = h.handle.await.unwrap().unwrap_err();
        assert!(matches!(err, RegistryError::RegistrationTimeout { ref stage, .. } if stage == "register_service"));
        assert_eq!(*h.state.borrow(), RegistrationState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_pending_backoff() {
        let transport = Arc::new(CountingTransport::new(Arc::new(MemoryRegistry::new())));
        transport.fail_registrations.store(true, Ordering::SeqCst);
        let mut cfg = config(None);
        cfg.retry.initial_backoff_ms = 60_000;
        cfg.retry.max_backoff_ms = 60_000;
        let h = start(transport, cfg);

        tokio::time::sleep(Duration::from_millis(10)).await;
        h.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), h.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(*h.state.borrow(), RegistrationState::Terminated);
        assert_eq!(h.transport.unregister_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_recovers_when_registry_comes_back() {
        let transport = Arc::new(CountingTransport::new(Arc::new(MemoryRegistry::new())));
        transport.fail_registrations.store(true, Ordering::SeqCst);
        let mut h = start(transport, config(None));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*h.state.borrow(), RegistrationState::RegisteringService);
        h.transport.fail_registrations.store(false, Ordering::SeqCst);

        wait_for(&mut h.state, RegistrationState::Heartbeating).await;
        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_after_startup_outlasts_retry_budget() {
        let transport = Arc::new(CountingTransport::new(Arc::new(MemoryRegistry::new())));
        let mut h = start(transport, config(Some(1_000)));
        wait_for(&mut h.state, RegistrationState::Heartbeating).await;
        let ids = h.local.ids().unwrap();

        h.transport.fail_registrations.store(true, Ordering::SeqCst);
        h.transport
            .registry()
            .unregister_instance(&ids.service_id, &ids.instance_id)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*h.state.borrow(), RegistrationState::RegisteringInstance);
        assert!(!h.handle.is_finished());

        h.transport.fail_registrations.store(false, Ordering::SeqCst);
        wait_for(&mut h.state, RegistrationState::Heartbeating).await;
        assert_eq!(h.transport.registry().get_instances(&ids.service_id).unwrap().len(), 1);

        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_reregistration_unregisters_previous_instance() {
        let transport = Arc::new(CountingTransport::new(Arc::new(MemoryRegistry::new())));
        let mut h = start(transport, config(None));
        wait_for(&mut h.state, RegistrationState::Heartbeating).await;
        let ids = h.local.ids().unwrap();

        // heartbeat times out while the registry still holds the instance
        *h.transport.heartbeat_delay.lock() = Duration::from_millis(800);
        h.transport.fail_registrations.store(true, Ordering::SeqCst);
        wait_for(&mut h.state, RegistrationState::RegisteringInstance).await;
        assert_eq!(h.transport.registry().get_instances(&ids.service_id).unwrap().len(), 1);

        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap().unwrap();
        assert_eq!(h.transport.unregister_calls.load(Ordering::SeqCst), 1);
        assert!(h.transport.registry().get_instances(&ids.service_id).unwrap().is_empty());
        assert!(h.local.ids().is_none());
    }
}
