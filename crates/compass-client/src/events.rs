//! Typed registry events over a broadcast channel.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use compass_core::VersionRule;

use crate::diff::InstanceDiff;
use crate::registration::RegistrationState;

const DEFAULT_CAPACITY: usize = 256;

/// The instance set cached for one (app, service, rule) key changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancesChanged {
    pub app_id: String,
    pub service_name: String,
    pub rule: VersionRule,
    pub revision: String,
    pub diff: InstanceDiff,
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    InstancesChanged(Arc<InstancesChanged>),
    RegistrationStateChanged {
        from: RegistrationState,
        to: RegistrationState,
    },
    HeartbeatFailed {
        service_id: String,
        instance_id: String,
        reason: String,
    },
    /// A watch subscription dropped; the key is polled until it recovers.
    WatchDegraded {
        app_id: String,
        service_name: String,
    },
    WatchRecovered {
        app_id: String,
        service_name: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RegistryEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to current subscribers; events with no subscriber are dropped.
    pub fn publish(&self, event: RegistryEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.sender.subscribe()
    }

    /// Run `listener` for every instance change of `app_id/service_name`
    /// until `shutdown` flips or the bus is dropped.
    pub fn spawn_instances_listener<F>(
        &self,
        app_id: impl Into<String>,
        service_name: impl Into<String>,
        mut shutdown: watch::Receiver<bool>,
        listener: F,
    ) -> JoinHandle<()>
    where
        F: Fn(&InstancesChanged) + Send + Sync + 'static,
    {
        let app_id = app_id.into();
        let service_name = service_name.into();
        let mut events = self.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = shutdown.changed() => return,
                };
                match event {
                    Ok(RegistryEvent::InstancesChanged(change))
                        if change.app_id == app_id && change.service_name == service_name =>
                    {
                        listener(&change);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            app_id = %app_id,
                            service_name = %service_name,
                            skipped,
                            "instance listener lagged behind"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }
}
