use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tokio::time::Instant;

use compass_core::{FindOutcome, InstanceStatus, RegistryError, RegistryStore, VersionRule};
use compass_wire::{
    CreateServiceRequest, CreateServiceResponse, ErrorBody, FindInstancesParams,
    GetServiceResponse, HeartbeatResult, HeartbeatsRequest, HeartbeatsResponse,
    InstancesResponse, RegisterInstanceRequest, RegisterInstanceResponse, ServicesResponse,
    StatusParams, REVISION_HEADER,
};

use crate::AppState;

/// Upper bound on a long-poll hold.
const MAX_WAIT_SECS: u64 = 60;

pub(crate) fn error_response(err: RegistryError) -> Response {
    let (status, code) = match &err {
        RegistryError::ServiceNotFound { .. } => (StatusCode::NOT_FOUND, "ServiceNotFound"),
        RegistryError::InstanceNotFound { .. } => (StatusCode::NOT_FOUND, "InstanceNotFound"),
        RegistryError::IdentityNotFound { .. } => (StatusCode::UNAUTHORIZED, "IdentityNotFound"),
        RegistryError::InvalidVersion { .. } => (StatusCode::BAD_REQUEST, "InvalidVersion"),
        RegistryError::InvalidVersionRule { .. } => (StatusCode::BAD_REQUEST, "InvalidVersionRule"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
    };
    let body = ErrorBody {
        error_code: code.to_string(),
        message: err.to_string(),
    };
    (status, Json(body)).into_response()
}

pub(crate) async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK").into_response()
}

pub(crate) async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

pub(crate) async fn register_service(
    State(state): State<AppState>,
    Json(payload): Json<CreateServiceRequest>,
) -> impl IntoResponse {
    match state.registry.register_service(&payload.service) {
        Ok(service_id) => {
            metrics::counter!("compass_services_registered_total").increment(1);
            (StatusCode::OK, Json(CreateServiceResponse { service_id })).into_response()
        }
        Err(e) => error_response(e),
    }
}

pub(crate) async fn list_services(State(state): State<AppState>) -> impl IntoResponse {
    match state.registry.get_all_services() {
        Ok(services) => (StatusCode::OK, Json(ServicesResponse { services })).into_response(),
        Err(e) => error_response(e),
    }
}

pub(crate) async fn get_service(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.get_service(&service_id) {
        Ok(service) => (StatusCode::OK, Json(GetServiceResponse { service })).into_response(),
        Err(e) => error_response(e),
    }
}

pub(crate) async fn register_instance(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
    Json(payload): Json<RegisterInstanceRequest>,
) -> impl IntoResponse {
    match state.registry.register_instance(&service_id, &payload.instance) {
        Ok(instance_id) => {
            metrics::counter!("compass_instances_registered_total").increment(1);
            (StatusCode::OK, Json(RegisterInstanceResponse { instance_id })).into_response()
        }
        Err(e) => error_response(e),
    }
}

pub(crate) async fn list_instances(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.get_instances(&service_id) {
        Ok(instances) => (StatusCode::OK, Json(InstancesResponse { instances })).into_response(),
        Err(e) => error_response(e),
    }
}

pub(crate) async fn unregister_instance(
    State(state): State<AppState>,
    Path((service_id, instance_id)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.registry.unregister_instance(&service_id, &instance_id) {
        Ok(()) => (StatusCode::OK, "Unregistered").into_response(),
        Err(e) => error_response(e),
    }
}

pub(crate) async fn update_status(
    State(state): State<AppState>,
    Path((service_id, instance_id)): Path<(String, String)>,
    Query(params): Query<StatusParams>,
) -> impl IntoResponse {
    let status: InstanceStatus = match params.value.parse() {
        Ok(status) => status,
        Err(message) => {
            let body = ErrorBody {
                error_code: "InvalidStatus".to_string(),
                message,
            };
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };
    match state
        .registry
        .update_instance_status(&service_id, &instance_id, status)
    {
        Ok(()) => (StatusCode::OK, "Updated").into_response(),
        Err(e) => error_response(e),
    }
}

pub(crate) async fn heartbeats(
    State(state): State<AppState>,
    Json(payload): Json<HeartbeatsRequest>,
) -> impl IntoResponse {
    let instances: Vec<HeartbeatResult> = payload
        .instances
        .into_iter()
        .map(|entry| {
            let err_message = state
                .registry
                .heartbeat(&entry.service_id, &entry.instance_id)
                .err()
                .map(|e| e.to_string());
            HeartbeatResult {
                service_id: entry.service_id,
                instance_id: entry.instance_id,
                err_message,
            }
        })
        .collect();

    let rejected = instances.iter().filter(|r| !r.accepted()).count() as u64;
    metrics::counter!("compass_heartbeats_total", "result" => "accepted")
        .increment(instances.len() as u64 - rejected);
    if rejected > 0 {
        metrics::counter!("compass_heartbeats_total", "result" => "rejected").increment(rejected);
    }

    (StatusCode::OK, Json(HeartbeatsResponse { instances })).into_response()
}

fn not_modified(revision: String) -> Response {
    (StatusCode::NOT_MODIFIED, [(REVISION_HEADER, revision)]).into_response()
}

/// `GET /registry/instances`, optionally long-polling while `rev` is current.
pub(crate) async fn find_instances(
    State(state): State<AppState>,
    Query(params): Query<FindInstancesParams>,
) -> impl IntoResponse {
    let rule = match VersionRule::parse(&params.version) {
        Ok(rule) => rule,
        Err(e) => return error_response(e),
    };
    let deadline = params
        .wait
        .map(|secs| Instant::now() + Duration::from_secs(secs.min(MAX_WAIT_SECS)));

    let mut changes = state.registry.subscribe();
    loop {
        changes.borrow_and_update();
        let outcome = state.registry.find_instances(
            &params.app_id,
            &params.service_name,
            &rule,
            params.rev.as_deref(),
        );
        match outcome {
            Ok(FindOutcome::Instances { revision, instances }) => {
                return (
                    StatusCode::OK,
                    [(REVISION_HEADER, revision)],
                    Json(InstancesResponse { instances }),
                )
                    .into_response();
            }
            Ok(FindOutcome::NotModified { revision }) => {
                let Some(deadline) = deadline else {
                    return not_modified(revision);
                };
                match tokio::time::timeout_at(deadline, changes.changed()).await {
                    Ok(Ok(())) => continue,
                    _ => return not_modified(revision),
                }
            }
            Err(e) => return error_response(e),
        }
    }
}
