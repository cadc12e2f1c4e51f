use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tracing::debug;

use compass_core::{
    InstanceDescriptor, InstanceStatus, RegistryError, RegistryResult, ServiceDescriptor,
    TransportError, TransportErrorKind,
};
use compass_wire::{
    instance_path, instance_status_path, instances_path, microservice_path, AuthRequest,
    AuthResponse, CreateServiceRequest, CreateServiceResponse, FindInstancesParams,
    GetServiceResponse, HeartbeatEntry, HeartbeatsRequest, HeartbeatsResponse, InstancesResponse,
    RegisterInstanceRequest, RegisterInstanceResponse, ServicesResponse, StatusParams,
    HEARTBEATS_PATH, INSTANCES_PATH, MICROSERVICES_PATH, REVISION_HEADER, TOKEN_PATH,
};

use super::{FindInstancesQuery, FindInstancesResult, RegistryTransport};
use crate::address::AddressManager;
use crate::config::RegistryConfig;
use crate::security::{AuthHeaderProvider, BearerToken, PemTls, TlsProvider, TokenSource};

/// Registry transport over HTTP + JSON.
pub struct HttpTransport {
    client: Client,
    addresses: AddressManager,
    auth: Option<Arc<dyn AuthHeaderProvider>>,
    bearer: Option<Arc<BearerToken>>,
    permits: Semaphore,
    request_timeout: Duration,
    heartbeat_timeout: Duration,
}

impl HttpTransport {
    /// Build from configuration, using PEM files for TLS and a bearer token for
    /// auth. The token starts empty when only `token_identity` is configured.
    pub fn new(config: &RegistryConfig) -> RegistryResult<Self> {
        let bearer = (config.auth_token.is_some() || config.token_identity.is_some())
            .then(|| Arc::new(BearerToken::new(config.auth_token.clone().unwrap_or_default())));
        let tls: Option<Box<dyn TlsProvider>> = config
            .tls
            .is_configured()
            .then(|| Box::new(PemTls::new(config.tls.clone())) as Box<dyn TlsProvider>);
        let mut transport = Self::with_providers(
            config,
            bearer.clone().map(|b| b as Arc<dyn AuthHeaderProvider>),
            tls.as_deref(),
        )?;
        transport.bearer = bearer;
        Ok(transport)
    }

    pub fn with_providers(
        config: &RegistryConfig,
        auth: Option<Arc<dyn AuthHeaderProvider>>,
        tls: Option<&dyn TlsProvider>,
    ) -> RegistryResult<Self> {
        config.validate()?;

        let mut builder = Client::builder();
        if let Some(tls) = tls {
            builder = tls
                .configure(builder)
                .map_err(|kind| TransportError::new(config.addresses.join(","), kind))?;
        }
        let client = builder
            .build()
            .map_err(|e| RegistryError::Config(format!("http client: {e}")))?;

        Ok(Self {
            client,
            addresses: AddressManager::new(
                config.addresses.clone(),
                Duration::from_millis(config.isolation_ms),
            ),
            auth,
            bearer: None,
            permits: Semaphore::new(config.max_concurrent_requests.max(1)),
            request_timeout: config.request_timeout(),
            heartbeat_timeout: config.heartbeat_timeout(),
        })
    }

    pub fn addresses(&self) -> &AddressManager {
        &self.addresses
    }

    /// The bearer token built from configuration, for a [`crate::security::TokenRefresher`].
    pub fn bearer_token(&self) -> Option<Arc<BearerToken>> {
        self.bearer.clone()
    }

    pub async fn list_services(&self) -> RegistryResult<Vec<ServiceDescriptor>> {
        let (address, response) = self
            .send(self.request_timeout, |client, base| {
                client.get(format!("{base}{MICROSERVICES_PATH}"))
            })
            .await?;
        let body: ServicesResponse = Self::decode(&address, response).await?;
        Ok(body.services)
    }

    pub async fn list_instances(&self, service_id: &str) -> RegistryResult<Vec<InstanceDescriptor>> {
        let path = instances_path(service_id);
        let (address, response) = self
            .send(self.request_timeout, |client, base| {
                client.get(format!("{base}{path}"))
            })
            .await
            .map_err(|e| not_found_as(e, || RegistryError::service_not_found(service_id)))?;
        let body: InstancesResponse = Self::decode(&address, response).await?;
        Ok(body.instances)
    }

    /// Ask the registry for a bearer token on behalf of `common_name`.
    pub async fn issue_token(&self, common_name: &str) -> RegistryResult<String> {
        let body = AuthRequest {
            common_name: common_name.to_string(),
        };
        let (address, response) = self
            .send_with(self.request_timeout, false, |client, base| {
                client.post(format!("{base}{TOKEN_PATH}")).json(&body)
            })
            .await?;
        let issued: AuthResponse = Self::decode(&address, response).await?;
        Ok(issued.token)
    }

    /// Send one request to the current address.
    ///
    /// Success, 304 and 4xx answers count as a healthy address; connection
    /// failures, timeouts and 5xx answers move on to the next address.
    async fn send<F>(&self, timeout: Duration, build: F) -> RegistryResult<(String, Response)>
    where
        F: FnOnce(&Client, &str) -> RequestBuilder,
    {
        self.send_with(timeout, true, build).await
    }

    /// Like `send`; token requests go out without auth headers.
    async fn send_with<F>(
        &self,
        timeout: Duration,
        authenticate: bool,
        build: F,
    ) -> RegistryResult<(String, Response)>
    where
        F: FnOnce(&Client, &str) -> RequestBuilder,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| RegistryError::Shutdown)?;
        let address = self
            .addresses
            .current()
            .ok_or_else(|| RegistryError::Config("no registry address configured".into()))?
            .to_string();

        let mut request = build(&self.client, &address).timeout(timeout);
        if let Some(auth) = self.auth.as_ref().filter(|_| authenticate) {
            let headers = auth
                .headers()
                .await
                .map_err(|kind| TransportError::new(&address, kind))?;
            for (name, value) in headers {
                request = request.header(name, value);
            }
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.addresses.record_failure(&address);
                let kind = if e.is_timeout() {
                    TransportErrorKind::Timeout
                } else {
                    TransportErrorKind::Connect(e.to_string())
                };
                debug!(address = %address, error = %kind, "registry call failed");
                return Err(TransportError::new(address, kind).into());
            }
        };

        let status = response.status();
        if status.is_server_error() {
            self.addresses.record_failure(&address);
        } else {
            self.addresses.record_success(&address);
        }
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok((address, response));
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::status(address, status.as_u16(), body).into())
    }

    async fn decode<T: DeserializeOwned>(address: &str, response: Response) -> RegistryResult<T> {
        response.json::<T>().await.map_err(|e| {
            TransportError::new(address, TransportErrorKind::Decode(e.to_string())).into()
        })
    }

    async fn find(
        &self,
        query: &FindInstancesQuery,
        wait: Option<Duration>,
    ) -> RegistryResult<FindInstancesResult> {
        let params = FindInstancesParams {
            app_id: query.app_id.clone(),
            service_name: query.service_name.clone(),
            version: query.rule.to_string(),
            rev: query.known_revision.clone(),
            wait: wait.map(|w| w.as_secs().max(1)),
        };
        let timeout = self.request_timeout + wait.unwrap_or_default();
        let (address, response) = self
            .send(timeout, |client, base| {
                client.get(format!("{base}{INSTANCES_PATH}")).query(&params)
            })
            .await?;

        let revision = response
            .headers()
            .get(REVISION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if response.status() == StatusCode::NOT_MODIFIED {
            let revision = revision.or_else(|| query.known_revision.clone()).unwrap_or_default();
            if query.known_revision.as_deref() != Some(revision.as_str()) {
                return Err(RegistryError::StaleRevision {
                    app_id: query.app_id.clone(),
                    service_name: query.service_name.clone(),
                    revision,
                });
            }
            return Ok(FindInstancesResult::unchanged(revision));
        }

        let body: InstancesResponse = Self::decode(&address, response).await?;
        Ok(FindInstancesResult::changed(
            revision.unwrap_or_default(),
            body.instances,
        ))
    }
}

#[async_trait]
impl TokenSource for HttpTransport {
    async fn issue_token(&self, identity: &str) -> RegistryResult<String> {
        HttpTransport::issue_token(self, identity).await
    }
}

fn not_found_as(err: RegistryError, mapped: impl FnOnce() -> RegistryError) -> RegistryError {
    match &err {
        RegistryError::Transport(t) if t.status_code() == Some(404) => mapped(),
        _ => err,
    }
}

#[async_trait]
impl RegistryTransport for HttpTransport {
    async fn register_service(&self, service: &ServiceDescriptor) -> RegistryResult<String> {
        let body = CreateServiceRequest {
            service: service.clone(),
        };
        let (address, response) = self
            .send(self.request_timeout, |client, base| {
                client.post(format!("{base}{MICROSERVICES_PATH}")).json(&body)
            })
            .await?;
        let created: CreateServiceResponse = Self::decode(&address, response).await?;
        Ok(created.service_id)
    }

    async fn get_service(&self, service_id: &str) -> RegistryResult<ServiceDescriptor> {
        let path = microservice_path(service_id);
        let (address, response) = self
            .send(self.request_timeout, |client, base| {
                client.get(format!("{base}{path}"))
            })
            .await
            .map_err(|e| not_found_as(e, || RegistryError::service_not_found(service_id)))?;
        let body: GetServiceResponse = Self::decode(&address, response).await?;
        Ok(body.service)
    }

    async fn register_instance(
        &self,
        service_id: &str,
        instance: &InstanceDescriptor,
    ) -> RegistryResult<String> {
        let path = instances_path(service_id);
        let body = RegisterInstanceRequest {
            instance: instance.clone(),
        };
        let (address, response) = self
            .send(self.request_timeout, |client, base| {
                client.post(format!("{base}{path}")).json(&body)
            })
            .await
            .map_err(|e| not_found_as(e, || RegistryError::service_not_found(service_id)))?;
        let created: RegisterInstanceResponse = Self::decode(&address, response).await?;
        Ok(created.instance_id)
    }

    async fn unregister_instance(&self, service_id: &str, instance_id: &str) -> RegistryResult<()> {
        let path = instance_path(service_id, instance_id);
        self.send(self.request_timeout, |client, base| {
            client.delete(format!("{base}{path}"))
        })
        .await
        .map_err(|e| {
            not_found_as(e, || RegistryError::instance_not_found(service_id, instance_id))
        })?;
        Ok(())
    }

    async fn update_instance_status(
        &self,
        service_id: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> RegistryResult<()> {
        let path = instance_status_path(service_id, instance_id);
        let params = StatusParams {
            value: status.as_str().to_string(),
        };
        self.send(self.request_timeout, |client, base| {
            client.put(format!("{base}{path}")).query(&params)
        })
        .await
        .map_err(|e| {
            not_found_as(e, || RegistryError::instance_not_found(service_id, instance_id))
        })?;
        Ok(())
    }

    async fn heartbeat(&self, service_id: &str, instance_id: &str) -> RegistryResult<bool> {
        let body = HeartbeatsRequest {
            instances: vec![HeartbeatEntry {
                service_id: service_id.to_string(),
                instance_id: instance_id.to_string(),
            }],
        };
        let (address, response) = self
            .send(self.heartbeat_timeout, |client, base| {
                client.put(format!("{base}{HEARTBEATS_PATH}")).json(&body)
            })
            .await?;
        let results: HeartbeatsResponse = Self::decode(&address, response).await?;
        let accepted = results
            .instances
            .iter()
            .find(|r| r.instance_id == instance_id)
            .is_some_and(|r| r.accepted());
        Ok(accepted)
    }

    async fn find_instances(&self, query: &FindInstancesQuery) -> RegistryResult<FindInstancesResult> {
        self.find(query, None).await
    }

    async fn watch(
        &self,
        query: &FindInstancesQuery,
        wait: Duration,
    ) -> RegistryResult<FindInstancesResult> {
        self.find(query, Some(wait)).await
    }

    fn supports_watch(&self) -> bool {
        true
    }
}
