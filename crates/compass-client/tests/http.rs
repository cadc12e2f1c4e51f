use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use compass_client::{
    FindInstancesQuery, HttpTransport, InstanceDescriptor, RegistrationState, RegistryClient,
    RegistryConfig, RegistryError, RegistryEvent, RegistryTransport, ServiceDescriptor,
    VersionRule,
};
use compass_core::{Identity, RegistryStore, Role};
use compass_server::{app, auth::issue_token, AppState};
use compass_store::MemoryRegistry;

async fn spawn_server(state: AppState) -> String {
    serve(app(state)).await
}

async fn serve(router: axum::Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = axum::Server::from_tcp(listener)
        .unwrap()
        .serve(router.into_make_service());
    tokio::spawn(server);
    format!("http://{addr}")
}

fn config(addresses: Vec<String>) -> RegistryConfig {
    RegistryConfig {
        heartbeat_interval_ms: 1_000,
        pull_interval_ms: 1_000,
        watch_wait_ms: 2_000,
        ..Default::default()
    }
    .with_addresses(addresses)
}

fn instance(host: &str) -> InstanceDescriptor {
    InstanceDescriptor::new(host, vec![format!("rest://{host}:8080")])
}

async fn provider(address: &str, version: &str, host: &str) -> RegistryClient {
    let client = RegistryClient::new(
        config(vec![address.to_string()]),
        ServiceDescriptor::new("shop", "orders", version),
        instance(host),
    )
    .unwrap();
    let mut state = client.watch_registration_state();
    client.start();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == RegistrationState::Heartbeating),
    )
    .await
    .unwrap()
    .unwrap();
    client
}

#[tokio::test]
async fn test_registered_provider_is_resolved_by_range() {
    let address = spawn_server(AppState::new(Arc::new(MemoryRegistry::new()))).await;
    let provider = provider(&address, "1.5.0", "orders-1").await;

    let consumer = RegistryClient::consumer(config(vec![address])).unwrap();
    consumer.start();
    let found = consumer.resolve("shop", "orders", "1.0.0-2.0.0").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].host_name, "orders-1");
    assert_eq!(found[0].instance_id, provider.registered_ids().unwrap().instance_id);

    let err = consumer.resolve("shop", "orders", "2.0.0+").await.unwrap_err();
    assert!(matches!(err, RegistryError::NoCompatibleVersion { .. }));

    consumer.shutdown().await.unwrap();
    provider.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_two_versions_side_by_side() {
    let address = spawn_server(AppState::new(Arc::new(MemoryRegistry::new()))).await;
    let old = provider(&address, "1.0.0", "old").await;
    let new = provider(&address, "2.0.0", "new").await;

    let consumer = RegistryClient::consumer(config(vec![address])).unwrap();
    let newer = consumer.resolve("shop", "orders", "2.0.0+").await.unwrap();
    assert_eq!(newer.iter().map(|i| i.host_name.as_str()).collect::<Vec<_>>(), vec!["new"]);
    let older = consumer.resolve("shop", "orders", "1.0.0-2.0.0").await.unwrap();
    assert_eq!(older.iter().map(|i| i.host_name.as_str()).collect::<Vec<_>>(), vec!["old"]);
    let latest = consumer.resolve("shop", "orders", "latest").await.unwrap();
    assert_eq!(latest[0].host_name, "new");

    let groups = consumer.group_by_compatible_version("shop", "orders").await.unwrap();
    let sizes: Vec<(String, usize)> = groups.iter().map(|(r, i)| (r.to_string(), i.len())).collect();
    assert_eq!(sizes, vec![("1.0.0+".to_string(), 2), ("2.0.0+".to_string(), 1)]);

    old.shutdown().await.unwrap();
    new.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_known_revision_is_not_modified() {
    let registry = Arc::new(MemoryRegistry::new());
    let service_id = registry
        .register_service(&ServiceDescriptor::new("shop", "orders", "1.0.0"))
        .unwrap();
    registry.register_instance(&service_id, &instance("a")).unwrap();
    let address = spawn_server(AppState::new(registry.clone())).await;

    let transport = HttpTransport::new(&config(vec![address])).unwrap();
    let query = FindInstancesQuery::new("shop", "orders", VersionRule::all());
    let first = transport.find_instances(&query).await.unwrap();
    assert!(first.changed);
    assert_eq!(first.instances.len(), 1);

    let again = transport
        .find_instances(&query.clone().with_revision(Some(first.revision.clone())))
        .await
        .unwrap();
    assert!(!again.changed);
    assert_eq!(again.revision, first.revision);

    registry.register_instance(&service_id, &instance("b")).unwrap();
    let moved = transport
        .find_instances(&query.with_revision(Some(first.revision.clone())))
        .await
        .unwrap();
    assert!(moved.changed);
    assert_eq!(moved.instances.len(), 2);
    assert_ne!(moved.revision, first.revision);
}

#[tokio::test]
async fn test_not_modified_with_other_revision_is_stale() {
    let router = axum::Router::new().route(
        compass_wire::INSTANCES_PATH,
        axum::routing::get(|| async {
            (
                axum::http::StatusCode::NOT_MODIFIED,
                [(compass_wire::REVISION_HEADER, "9")],
            )
        }),
    );
    let address = serve(router).await;

    let transport = HttpTransport::new(&config(vec![address])).unwrap();
    let query = FindInstancesQuery::new("shop", "orders", VersionRule::all())
        .with_revision(Some("3".to_string()));
    match transport.find_instances(&query).await {
        Err(RegistryError::StaleRevision { revision, .. }) => assert_eq!(revision, "9"),
        other => panic!("expected a stale revision, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_service_answers_empty() {
    let address = spawn_server(AppState::new(Arc::new(MemoryRegistry::new()))).await;
    let transport = HttpTransport::new(&config(vec![address])).unwrap();
    let result = transport
        .find_instances(&FindInstancesQuery::new("shop", "nobody", VersionRule::all()))
        .await
        .unwrap();
    assert!(result.instances.is_empty());

    let err = transport.get_service("missing").await.unwrap_err();
    assert!(matches!(err, RegistryError::ServiceNotFound { .. }));
}

#[tokio::test]
async fn test_watch_delivers_new_provider() {
    let address = spawn_server(AppState::new(Arc::new(MemoryRegistry::new()))).await;
    let first = provider(&address, "1.0.0", "first").await;

    let mut cfg = config(vec![address.clone()]);
    cfg.watch = true;
    let consumer = RegistryClient::consumer(cfg).unwrap();
    consumer.start();
    assert_eq!(consumer.resolve("shop", "orders", "0+").await.unwrap().len(), 1);
    let mut events = consumer.subscribe();

    let second = provider(&address, "1.0.0", "second").await;
    let change = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(RegistryEvent::InstancesChanged(change)) = events.recv().await {
                return change;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(change.diff.added.len(), 1);
    assert_eq!(change.diff.added[0].host_name, "second");
    assert_eq!(consumer.resolve("shop", "orders", "0+").await.unwrap().len(), 2);

    consumer.shutdown().await.unwrap();
    first.shutdown().await.unwrap();
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dead_address_fails_over() {
    let address = spawn_server(AppState::new(Arc::new(MemoryRegistry::new()))).await;
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        format!("http://{}", listener.local_addr().unwrap())
    };
    let provider = provider(&address, "1.0.0", "a").await;

    let transport = HttpTransport::new(&config(vec![dead.clone(), address.clone()])).unwrap();
    let query = FindInstancesQuery::new("shop", "orders", VersionRule::all());
    assert!(transport.find_instances(&query).await.is_err());
    let result = transport.find_instances(&query).await.unwrap();
    assert_eq!(result.instances.len(), 1);
    assert_eq!(transport.addresses().current(), Some(address.as_str()));

    provider.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bearer_token_is_sent() {
    let registry = Arc::new(MemoryRegistry::new());
    let identity = Identity {
        common_name: "svc".into(),
        organization: None,
        roles: vec![Role::Agent],
    };
    registry.add_identity(&identity).unwrap();
    let address =
        spawn_server(AppState::new(registry).with_jwt_secret("integration-secret")).await;

    let anonymous = HttpTransport::new(&config(vec![address.clone()])).unwrap();
    let err = anonymous
        .register_service(&ServiceDescriptor::new("shop", "orders", "1.0.0"))
        .await
        .unwrap_err();
    let RegistryError::Transport(transport_err) = err else {
        panic!("expected a transport error, got {err:?}");
    };
    assert_eq!(transport_err.status_code(), Some(401));

    let mut cfg = config(vec![address]);
    cfg.auth_token = Some(issue_token(&identity, "integration-secret").unwrap());
    let authorized = HttpTransport::new(&cfg).unwrap();
    let service_id = authorized
        .register_service(&ServiceDescriptor::new("shop", "orders", "1.0.0"))
        .await
        .unwrap();
    assert!(!service_id.is_empty());
}

#[tokio::test]
async fn test_operator_listing_and_token_endpoint() {
    let registry = Arc::new(MemoryRegistry::new());
    registry
        .add_identity(&Identity {
            common_name: "ops".into(),
            organization: None,
            roles: vec![Role::Viewer],
        })
        .unwrap();
    let service_id = registry
        .register_service(&ServiceDescriptor::new("shop", "orders", "1.0.0"))
        .unwrap();
    registry.register_instance(&service_id, &instance("a")).unwrap();
    let address = spawn_server(AppState::new(registry).with_jwt_secret("ops-secret")).await;

    let anonymous = HttpTransport::new(&config(vec![address.clone()])).unwrap();
    let token = anonymous.issue_token("ops").await.unwrap();

    let mut cfg = config(vec![address]);
    cfg.auth_token = Some(token);
    let viewer = HttpTransport::new(&cfg).unwrap();
    let services = viewer.list_services().await.unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].service_id, service_id);
    assert_eq!(viewer.list_instances(&service_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_client_fetches_its_own_token() {
    let registry = Arc::new(MemoryRegistry::new());
    registry
        .add_identity(&Identity {
            common_name: "orders".into(),
            organization: None,
            roles: vec![Role::Agent],
        })
        .unwrap();
    let address =
        spawn_server(AppState::new(registry.clone()).with_jwt_secret("refresh-secret")).await;

    let mut cfg = config(vec![address]);
    cfg.token_identity = Some("orders".into());
    let client = RegistryClient::new(
        cfg,
        ServiceDescriptor::new("shop", "orders", "1.0.0"),
        instance("a"),
    )
    .unwrap();
    let mut state = client.watch_registration_state();
    client.start();
    tokio::time::timeout(
        Duration::from_secs(10),
        state.wait_for(|s| *s == RegistrationState::Heartbeating),
    )
    .await
    .unwrap()
    .unwrap();

    let ids = client.registered_ids().unwrap();
    assert_eq!(registry.get_instances(&ids.service_id).unwrap().len(), 1);
    client.shutdown().await.unwrap();
    assert!(registry.get_instances(&ids.service_id).unwrap().is_empty());
}
