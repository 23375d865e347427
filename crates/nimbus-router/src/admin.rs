//! Administrative REST API, served on the base domain.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/sites` | List sites |
//! | GET | `/api/v1/sites/{label}` | One site |
//! | PUT | `/api/v1/sites/{label}/deploy` | Deploy a gzip'd tar bundle |
//! | GET | `/api/v1/sites/{label}/deployments` | Deployment history |
//! | GET | `/api/v1/sites/{label}/secrets` | Secret names |
//! | PUT | `/api/v1/sites/{label}/secrets/{name}` | Set a secret (body is the value) |
//! | DELETE | `/api/v1/sites/{label}/secrets/{name}` | Delete a secret |
//! | GET | `/healthz` | Liveness |
//!
//! Authentication happens upstream. The proxy in front of us puts the
//! caller's identity in `x-nimbus-actor`; every `/api/v1` route requires it.

use std::sync::{Arc, LazyLock};

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use regex::Regex;
use serde::Serialize;
use tracing::{error, info, warn};

use nimbus_core::{Actor, DeploymentRecord, SiteId};
use nimbus_deploy::{Deployer, SiteRegistry};
use nimbus_state::StateStore;

/// Header carrying the authenticated caller.
pub const ACTOR_HEADER: &str = "x-nimbus-actor";

static SECRET_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,127}$").expect("secret name pattern compiles")
});

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub registry: SiteRegistry,
    pub deployer: Arc<Deployer>,
    pub store: StateStore,
    pub max_archive_bytes: u64,
}

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn internal_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "admin request failed");
    error_response("internal error", StatusCode::INTERNAL_SERVER_ERROR)
}

/// Result of a deploy request.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum DeployOutcome {
    Accepted {
        accepted: bool,
        deployment_record: DeploymentRecord,
    },
    Rejected {
        accepted: bool,
        error: String,
        status: u16,
    },
}

impl DeployOutcome {
    fn accepted(deployment_record: DeploymentRecord) -> Self {
        DeployOutcome::Accepted {
            accepted: true,
            deployment_record,
        }
    }

    fn rejected(error: String, status: u16) -> Self {
        DeployOutcome::Rejected {
            accepted: false,
            error,
            status,
        }
    }
}

impl IntoResponse for DeployOutcome {
    fn into_response(self) -> Response {
        let status = match &self {
            DeployOutcome::Accepted { .. } => StatusCode::CREATED,
            DeployOutcome::Rejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        };
        (status, Json(self)).into_response()
    }
}

/// The caller named by the upstream auth proxy.
#[derive(Debug, Clone)]
pub struct AdminActor(pub Actor);

impl<S: Send + Sync> FromRequestParts<S> for AdminActor {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(Actor::new)
            .map(AdminActor)
            .ok_or_else(|| error_response("missing actor", StatusCode::UNAUTHORIZED))
    }
}

/// Build the admin router.
pub fn admin_router(state: AdminState) -> Router {
    let api_routes = Router::new()
        .route("/sites", get(list_sites))
        .route("/sites/{label}", get(get_site))
        .route("/sites/{label}/deploy", put(deploy_site))
        .route("/sites/{label}/deployments", get(list_deployments))
        .route("/sites/{label}/secrets", get(list_secrets))
        .route(
            "/sites/{label}/secrets/{name}",
            put(put_secret).delete(delete_secret),
        )
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(healthz))
}

/// GET /healthz
async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

/// Runs a blocking registry or store call off the async runtime.
async fn blocking<T, E, F>(f: F) -> Result<T, Response>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(internal_error(e)),
        Err(e) => Err(internal_error(e)),
    }
}

fn parse_label(state: &AdminState, label: &str) -> Result<SiteId, Response> {
    state
        .registry
        .policy()
        .check(label)
        .map_err(|e| error_response(&e.to_string(), StatusCode::BAD_REQUEST))
}

/// GET /api/v1/sites
async fn list_sites(State(state): State<AdminState>, _actor: AdminActor) -> Response {
    let registry = state.registry.clone();
    match blocking(move || registry.sites()).await {
        Ok(sites) => ApiResponse::ok(sites).into_response(),
        Err(response) => response,
    }
}

/// GET /api/v1/sites/{label}
async fn get_site(
    State(state): State<AdminState>,
    _actor: AdminActor,
    Path(label): Path<String>,
) -> Response {
    let registry = state.registry.clone();
    match blocking(move || registry.site(&label)).await {
        Ok(Some(site)) => ApiResponse::ok(site).into_response(),
        Ok(None) => error_response("site not found", StatusCode::NOT_FOUND),
        Err(response) => response,
    }
}

/// GET /api/v1/sites/{label}/deployments
async fn list_deployments(
    State(state): State<AdminState>,
    _actor: AdminActor,
    Path(label): Path<String>,
) -> Response {
    let registry = state.registry.clone();
    match blocking(move || registry.deployments(&label)).await {
        Ok(Some(records)) => ApiResponse::ok(records).into_response(),
        Ok(None) => error_response("site not found", StatusCode::NOT_FOUND),
        Err(response) => response,
    }
}

pub(crate) fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// PUT /api/v1/sites/{label}/deploy
async fn deploy_site(
    State(state): State<AdminState>,
    AdminActor(actor): AdminActor,
    Path(label): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let limit = state.max_archive_bytes;
    let too_large = |declared: Option<u64>| {
        warn!(site = %label, ?declared, limit, "deploy body over limit");
        DeployOutcome::rejected(
            format!("archive exceeds {limit} bytes"),
            StatusCode::PAYLOAD_TOO_LARGE.as_u16(),
        )
        .into_response()
    };

    let declared = declared_length(&headers);
    if declared.is_some_and(|size| size > limit) {
        return too_large(declared);
    }
    let body_limit = usize::try_from(limit).unwrap_or(usize::MAX);
    let archive = match axum::body::to_bytes(body, body_limit).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => return too_large(declared),
    };

    info!(site = %label, bytes = archive.len(), actor = %actor, "deploy requested");
    match state.deployer.deploy(&label, archive, actor).await {
        Ok(record) => DeployOutcome::accepted(record).into_response(),
        Err(e) => {
            if e.status() >= 500 {
                error!(site = %label, error = %e, "deploy failed");
            } else {
                warn!(site = %label, error = %e, "deploy rejected");
            }
            DeployOutcome::rejected(e.public_message(), e.status()).into_response()
        }
    }
}

/// GET /api/v1/sites/{label}/secrets
async fn list_secrets(
    State(state): State<AdminState>,
    _actor: AdminActor,
    Path(label): Path<String>,
) -> Response {
    let site = match parse_label(&state, &label) {
        Ok(site) => site,
        Err(response) => return response,
    };
    let store = state.store.clone();
    match blocking(move || store.list_secret_names(&site)).await {
        Ok(names) => ApiResponse::ok(names).into_response(),
        Err(response) => response,
    }
}

fn parse_secret_name(name: &str) -> Result<(), Response> {
    if SECRET_NAME.is_match(name) {
        Ok(())
    } else {
        Err(error_response("invalid secret name", StatusCode::BAD_REQUEST))
    }
}

/// PUT /api/v1/sites/{label}/secrets/{name}
async fn put_secret(
    State(state): State<AdminState>,
    AdminActor(actor): AdminActor,
    Path((label, name)): Path<(String, String)>,
    value: String,
) -> Response {
    let site = match parse_label(&state, &label) {
        Ok(site) => site,
        Err(response) => return response,
    };
    if let Err(response) = parse_secret_name(&name) {
        return response;
    }
    let store = state.store.clone();
    let stored_name = name.clone();
    let stored_site = site.clone();
    match blocking(move || store.put_secret(&stored_site, &stored_name, &value)).await {
        Ok(()) => {
            info!(%site, secret = %name, actor = %actor, "secret set");
            ApiResponse::ok(name).into_response()
        }
        Err(response) => response,
    }
}

/// DELETE /api/v1/sites/{label}/secrets/{name}
async fn delete_secret(
    State(state): State<AdminState>,
    AdminActor(actor): AdminActor,
    Path((label, name)): Path<(String, String)>,
) -> Response {
    let site = match parse_label(&state, &label) {
        Ok(site) => site,
        Err(response) => return response,
    };
    if let Err(response) = parse_secret_name(&name) {
        return response;
    }
    let store = state.store.clone();
    let stored_name = name.clone();
    let stored_site = site.clone();
    match blocking(move || store.delete_secret(&stored_site, &stored_name)).await {
        Ok(true) => {
            info!(%site, secret = %name, actor = %actor, "secret deleted");
            ApiResponse::ok(name).into_response()
        }
        Ok(false) => error_response("secret not found", StatusCode::NOT_FOUND),
        Err(response) => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_names() {
        for ok in ["API_TOKEN", "_x", "a1"] {
            assert!(SECRET_NAME.is_match(ok), "{ok}");
        }
        for bad in ["", "1ABC", "A-B", "A B", "ä"] {
            assert!(!SECRET_NAME.is_match(bad), "{bad}");
        }
    }

    #[test]
    fn deploy_outcome_shapes() {
        let rejected =
            serde_json::to_value(DeployOutcome::rejected("bundle contains no files".into(), 400))
                .unwrap();
        assert_eq!(rejected["accepted"], false);
        assert_eq!(rejected["status"], 400);
        assert_eq!(rejected["error"], "bundle contains no files");

        let response = DeployOutcome::rejected("x".into(), 413).into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
