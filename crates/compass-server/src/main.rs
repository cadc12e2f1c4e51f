use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use compass_core::{Identity, RegistryStore, Role};
use compass_server::{app, spawn_expiry_worker, AppState, ServerConfig};
use compass_store::MemoryRegistry;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(2);
        }
    };

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder).ok();

    let registry = Arc::new(MemoryRegistry::new());

    let mut state = AppState::new(registry.clone()).with_metrics(handle);
    if let Some(secret) = &config.jwt_secret {
        let admin = Identity {
            common_name: config.admin_identity.clone(),
            organization: Some("Compass".to_string()),
            roles: vec![Role::Admin],
        };
        if let Err(e) = registry.add_identity(&admin) {
            tracing::error!("failed to seed admin identity: {}", e);
        }
        state = state.with_jwt_secret(secret.clone());
    } else {
        tracing::warn!("COMPASS_JWT_SECRET not set, registry routes are unauthenticated");
    }

    spawn_expiry_worker(registry, config.instance_ttl, config.sweep_interval);

    let app = app(state);
    let addr = config.bind;

    match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => {
            let tls = match RustlsConfig::from_pem_file(cert, key).await {
                Ok(tls) => tls,
                Err(e) => {
                    tracing::error!("failed to load tls material: {}", e);
                    std::process::exit(2);
                }
            };
            let server_handle = axum_server::Handle::new();
            let shutdown_handle = server_handle.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
            });

            tracing::info!("listening on https://{}", addr);
            if let Err(e) = axum_server::bind_rustls(addr, tls)
                .handle(server_handle)
                .serve(app.into_make_service())
                .await
            {
                tracing::error!("server error: {}", e);
            }
        }
        _ => {
            tracing::info!("listening on http://{}", addr);
            let server = axum::Server::bind(&addr)
                .serve(app.into_make_service())
                .with_graceful_shutdown(shutdown_signal());

            if let Err(e) = server.await {
                tracing::error!("server error: {}", e);
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("signal received, starting graceful shutdown");
}
