//! HTTP + JSON shapes of the registry protocol.
//!
//! Field names are camelCase on the wire. The server and the HTTP transport
//! both use these types, so a change here changes the protocol.

use serde::{Deserialize, Serialize};

use compass_core::{InstanceDescriptor, ServiceDescriptor};

/// Response header carrying the revision of an instance list.
pub const REVISION_HEADER: &str = "X-Resource-Revision";

pub const MICROSERVICES_PATH: &str = "/registry/microservices";
pub const HEARTBEATS_PATH: &str = "/registry/heartbeats";
pub const INSTANCES_PATH: &str = "/registry/instances";
pub const TOKEN_PATH: &str = "/api/auth/token";
pub const HEALTH_PATH: &str = "/health";

pub fn microservice_path(service_id: &str) -> String {
    format!("{MICROSERVICES_PATH}/{service_id}")
}

pub fn instances_path(service_id: &str) -> String {
    format!("{MICROSERVICES_PATH}/{service_id}/instances")
}

pub fn instance_path(service_id: &str, instance_id: &str) -> String {
    format!("{MICROSERVICES_PATH}/{service_id}/instances/{instance_id}")
}

pub fn instance_status_path(service_id: &str, instance_id: &str) -> String {
    format!("{}/status", instance_path(service_id, instance_id))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateServiceRequest {
    pub service: ServiceDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateServiceResponse {
    pub service_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetServiceResponse {
    pub service: ServiceDescriptor,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesResponse {
    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterInstanceRequest {
    pub instance: InstanceDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterInstanceResponse {
    pub instance_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstancesResponse {
    #[serde(default)]
    pub instances: Vec<InstanceDescriptor>,
}

/// Query string of `GET /registry/instances`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindInstancesParams {
    pub app_id: String,
    pub service_name: String,
    /// Version rule text, e.g. `1.0.0-2.0.0`.
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Long-poll: seconds to hold the request while `rev` is still current.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusParams {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatEntry {
    pub service_id: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatsRequest {
    pub instances: Vec<HeartbeatEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResult {
    pub service_id: String,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_message: Option<String>,
}

impl HeartbeatResult {
    pub fn accepted(&self) -> bool {
        self.err_message.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatsResponse {
    #[serde(default)]
    pub instances: Vec<HeartbeatResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub common_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
}

/// Error body returned with every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error_code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        assert_eq!(
            instance_status_path("s1", "i1"),
            "/registry/microservices/s1/instances/i1/status"
        );
    }

    #[test]
    fn test_heartbeat_result_wire_shape() {
        let rejected: HeartbeatResult = serde_json::from_str(
            r#"{"serviceId":"s","instanceId":"i","errMessage":"instance not found"}"#,
        )
        .unwrap();
        assert!(!rejected.accepted());

        let accepted = HeartbeatResult {
            service_id: "s".into(),
            instance_id: "i".into(),
            err_message: None,
        };
        let json = serde_json::to_string(&accepted).unwrap();
        assert_eq!(json, r#"{"serviceId":"s","instanceId":"i"}"#);
    }
}
