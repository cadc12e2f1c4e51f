use axum::{
    extract::State,
    http::{Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};

use compass_core::{time, Claims, Identity, Permission, RegistryStore};
use compass_wire::{AuthRequest, AuthResponse, HEALTH_PATH, MICROSERVICES_PATH, TOKEN_PATH};

use crate::routes::error_response;
use crate::AppState;

const TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

pub fn issue_token(identity: &Identity, secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: identity.common_name.clone(),
        roles: identity.roles.clone(),
        exp: (time::now() / 1000 + TOKEN_TTL_SECS) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

pub(crate) async fn get_token(
    State(state): State<AppState>,
    Json(payload): Json<AuthRequest>,
) -> impl IntoResponse {
    let Some(secret) = state.jwt_secret.as_deref() else {
        return (StatusCode::NOT_FOUND, "authentication disabled").into_response();
    };
    match state.registry.get_identity(&payload.common_name) {
        Ok(identity) => match issue_token(&identity, secret) {
            Ok(token) => (StatusCode::OK, Json(AuthResponse { token })).into_response(),
            Err(e) => {
                tracing::error!(error = %e, "failed to sign token");
                (StatusCode::INTERNAL_SERVER_ERROR, "token signing failed").into_response()
            }
        },
        Err(e) => error_response(e),
    }
}

/// Permission a request needs, judged by method and path.
fn required_permission(method: &Method, path: &str) -> Permission {
    let instance_path = path.contains("/instances") || path.contains("/heartbeats");
    match (method == Method::GET, instance_path) {
        (true, true) => Permission::InstanceRead,
        (true, false) => Permission::ServiceRead,
        (false, false) if path.starts_with(MICROSERVICES_PATH) => Permission::ServiceWrite,
        (false, _) => Permission::InstanceWrite,
    }
}

pub(crate) async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: Request<B>,
    next: Next<B>,
) -> Result<Response, StatusCode> {
    let Some(secret) = state.jwt_secret.as_deref() else {
        return Ok(next.run(req).await);
    };

    let path = req.uri().path();
    if path == TOKEN_PATH || path == HEALTH_PATH || path == "/metrics" {
        return Ok(next.run(req).await);
    }
    let needed = required_permission(req.method(), path);

    let token = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|_| StatusCode::UNAUTHORIZED)?;

    if !token_data.claims.allows(&needed) {
        tracing::warn!(sub = %token_data.claims.sub, ?needed, "insufficient permissions");
        return Err(StatusCode::FORBIDDEN);
    }

    req.extensions_mut().insert(token_data.claims);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_permission() {
        assert_eq!(
            required_permission(&Method::GET, "/registry/instances"),
            Permission::InstanceRead
        );
        assert_eq!(
            required_permission(&Method::GET, "/registry/microservices/abc"),
            Permission::ServiceRead
        );
        assert_eq!(
            required_permission(&Method::POST, "/registry/microservices"),
            Permission::ServiceWrite
        );
        assert_eq!(
            required_permission(&Method::POST, "/registry/microservices/abc/instances"),
            Permission::InstanceWrite
        );
        assert_eq!(
            required_permission(&Method::PUT, "/registry/heartbeats"),
            Permission::InstanceWrite
        );
    }
}
