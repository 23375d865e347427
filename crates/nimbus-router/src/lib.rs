//! nimbus-router: the single HTTP entry point of a Nimbus host.
//!
//! Every request lands in [`dispatch`], which classifies the `Host` header:
//!
//! - the base domain (or an admin alias) goes to the admin API ([`admin`]);
//! - `<label>.<base domain>` is looked up in the site registry and served
//!   from its live release ([`static_files`]) or handed to the sandbox;
//! - anything else is answered here.
//!
//! Exactly one activity event is emitted per request, whichever branch
//! answered it.

pub mod admin;
pub mod error;
pub mod host;
pub mod static_files;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tower::ServiceExt;
use tracing::{debug, error, warn};

use nimbus_core::{ActivityEvent, ActivitySink, NimbusConfig, Outcome};
use nimbus_deploy::{ResolvedSite, SiteRegistry};
use nimbus_sandbox::{Executor, RequestSnapshot, SandboxResponse, ScriptTarget};

pub use admin::{ACTOR_HEADER, AdminState, admin_router};
pub use error::{RouteError, RouteResult};
pub use host::{HostClass, HostMatcher, normalize_host};

/// Router settings taken from `[server]` and `[deploy]`.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub base_domain: String,
    pub admin_aliases: Vec<String>,
    pub max_request_body_bytes: usize,
    pub max_archive_bytes: u64,
}

impl From<&NimbusConfig> for RouterConfig {
    fn from(config: &NimbusConfig) -> Self {
        Self {
            base_domain: config.base_domain(),
            admin_aliases: config.server.admin_aliases.clone(),
            max_request_body_bytes: config.server.max_request_body_bytes,
            max_archive_bytes: config.deploy.max_archive_bytes,
        }
    }
}

/// Shared state for the dispatcher.
#[derive(Clone)]
pub struct AppState {
    pub hosts: Arc<HostMatcher>,
    pub max_request_body_bytes: usize,
    pub registry: SiteRegistry,
    pub executor: Arc<dyn Executor>,
    pub activity: Arc<dyn ActivitySink>,
    /// The admin API, already bound to its own state.
    pub admin: Router,
}

impl AppState {
    pub fn new(
        config: &RouterConfig,
        admin: AdminState,
        executor: Arc<dyn Executor>,
        activity: Arc<dyn ActivitySink>,
    ) -> Self {
        Self {
            hosts: Arc::new(HostMatcher::new(&config.base_domain, &config.admin_aliases)),
            max_request_body_bytes: config.max_request_body_bytes,
            registry: admin.registry.clone(),
            executor,
            activity,
            admin: admin_router(admin),
        }
    }
}

/// Build the complete host router.
pub fn build_router(state: AppState) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}

/// Classify, answer, and record one request.
pub async fn dispatch(State(state): State<AppState>, req: Request) -> Response {
    let raw_host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()));

    let (label, outcome, response) = match state.hosts.classify(raw_host.as_deref()) {
        HostClass::Malformed => {
            debug!(host = ?raw_host, "malformed host");
            let err = RouteError::MalformedHost;
            (None, err.outcome(), err.into_response())
        }
        HostClass::Foreign => {
            debug!(host = ?raw_host, "host outside base domain");
            let err = RouteError::SiteNotFound;
            (None, err.outcome(), err.into_response())
        }
        HostClass::Admin => {
            let response = match state.admin.clone().oneshot(req).await {
                Ok(response) => response,
                Err(never) => match never {},
            };
            (None, Outcome::Admin, response)
        }
        HostClass::Site(label) => {
            let (outcome, response) = serve_site(&state, &label, req).await;
            (Some(label), outcome, response)
        }
    };

    state
        .activity
        .emit(ActivityEvent::hosting(label.as_deref(), outcome));
    response
}

async fn serve_site(state: &AppState, label: &str, req: Request) -> (Outcome, Response) {
    let registry = state.registry.clone();
    let lookup = label.to_string();
    let resolved = match tokio::task::spawn_blocking(move || registry.resolve(&lookup)).await {
        Ok(Ok(Some(resolved))) => resolved,
        Ok(Ok(None)) => {
            let err = RouteError::SiteNotFound;
            return (err.outcome(), err.into_response());
        }
        Ok(Err(e)) => {
            error!(site = label, error = %e, "registry lookup failed");
            let err = RouteError::Internal;
            return (err.outcome(), err.into_response());
        }
        Err(e) => {
            error!(site = label, error = %e, "registry lookup task failed");
            let err = RouteError::Internal;
            return (err.outcome(), err.into_response());
        }
    };

    match resolved.entry_script.clone() {
        Some(entry_script) => serve_dynamic(state, resolved, entry_script, req).await,
        None => (Outcome::Static, serve_static(resolved, req).await),
    }
}

async fn serve_static(resolved: ResolvedSite, req: Request) -> Response {
    let method = req.method().clone();
    if let Err(err) = static_files::check_method(&method) {
        return err.into_response();
    }
    let root = resolved.root;
    let path = req.uri().path().to_string();
    match tokio::task::spawn_blocking(move || static_files::load(&root, &path)).await {
        Ok(Ok(file)) => static_files::file_response(file, &method),
        Ok(Err(err)) => err.into_response(),
        Err(e) => {
            error!(site = %resolved.site.id, error = %e, "static read task failed");
            RouteError::Internal.into_response()
        }
    }
}

async fn serve_dynamic(
    state: &AppState,
    resolved: ResolvedSite,
    entry_script: std::path::PathBuf,
    req: Request,
) -> (Outcome, Response) {
    let site = resolved.site.id;
    let limit = state.max_request_body_bytes;
    let (parts, body) = req.into_parts();

    if admin::declared_length(&parts.headers).is_some_and(|len| len > limit as u64) {
        warn!(%site, limit, "request body over limit");
        let err = RouteError::BodyTooLarge;
        return (err.outcome(), err.into_response());
    }
    let body = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => {
            warn!(%site, limit, "request body over limit");
            let err = RouteError::BodyTooLarge;
            return (err.outcome(), err.into_response());
        }
    };

    let mut snapshot = RequestSnapshot::new(parts.method.as_str(), parts.uri.path())
        .with_query(parts.uri.query().unwrap_or_default())
        .with_body(body);
    for (name, value) in &parts.headers {
        snapshot = snapshot.with_header(name.as_str(), String::from_utf8_lossy(value.as_bytes()));
    }

    let target = ScriptTarget {
        site,
        entry_script,
    };
    let outcome = state.executor.execute(&target, snapshot).await;
    let activity = outcome.activity_outcome();
    let response = outcome.into_response();
    (activity, to_http(response, &parts.method))
}

/// Convert a sandbox response. Headers that are not valid HTTP are dropped.
fn to_http(response: SandboxResponse, method: &Method) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(response.body)
    };
    let mut http = Response::new(body);
    *http.status_mut() = status;
    for (name, value) in response.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                http.headers_mut().append(name, value);
            }
            _ => debug!(header = %name, "dropping invalid response header"),
        }
    }
    http
}
