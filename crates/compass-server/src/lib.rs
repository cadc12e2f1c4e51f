//! HTTP registry server speaking the compass wire protocol.

pub mod auth;
pub mod config;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;

use compass_store::MemoryRegistry;
use compass_wire::{HEALTH_PATH, HEARTBEATS_PATH, INSTANCES_PATH, MICROSERVICES_PATH, TOKEN_PATH};

pub use config::ServerConfig;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<MemoryRegistry>,
    pub jwt_secret: Option<String>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(registry: Arc<MemoryRegistry>) -> Self {
        Self {
            registry,
            jwt_secret: None,
            metrics: None,
        }
    }

    pub fn with_jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.jwt_secret = Some(secret.into());
        self
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(routes::health_check))
        .route("/metrics", get(routes::render_metrics))
        .route(TOKEN_PATH, post(auth::get_token))
        .route(
            MICROSERVICES_PATH,
            post(routes::register_service).get(routes::list_services),
        )
        .route("/registry/microservices/:service_id", get(routes::get_service))
        .route(
            "/registry/microservices/:service_id/instances",
            post(routes::register_instance).get(routes::list_instances),
        )
        .route(
            "/registry/microservices/:service_id/instances/:instance_id",
            delete(routes::unregister_instance),
        )
        .route(
            "/registry/microservices/:service_id/instances/:instance_id/status",
            put(routes::update_status),
        )
        .route(HEARTBEATS_PATH, put(routes::heartbeats))
        .route(INSTANCES_PATH, get(routes::find_instances))
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_middleware))
        .with_state(state)
}

/// Periodically drop instances that stopped heartbeating.
pub fn spawn_expiry_worker(
    registry: Arc<MemoryRegistry>,
    ttl: Duration,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(ttl_secs = ttl.as_secs(), "expiry worker started");
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let expired = registry.expire_instances(ttl.as_millis() as u64);
            if !expired.is_empty() {
                metrics::counter!("compass_instances_expired_total").increment(expired.len() as u64);
            }
        }
    })
}
