//! Embedded OCI Distribution v2 registry.
//!
//! Serves manifests and blobs from the [`BlobStore`] and, on a cache miss
//! with pull-through enabled, fetches from the configured upstreams in
//! order, caches, then serves. A miss that every upstream also misses is a
//! plain 404, never a 5xx.
//!
//! Repository names may contain slashes (`library/nginx`), so the wildcard
//! path is parsed by scanning for the keyword segments `/manifests/` and
//! `/blobs/`; everything before the keyword is the repository.
//!
//! Cached content is keyed by the *requested* reference (tag or digest), so
//! later lookups of the same tag hit without consulting upstreams.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::constants::{DISTRIBUTION_API_VERSION, MAX_MANIFEST_SIZE};
use crate::store::BlobStore;

const VERSION_HEADER: &str = "Docker-Distribution-API-Version";
const DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Shared state behind the registry routes.
pub struct RegistryState {
    store: Arc<BlobStore>,
    cfg: RegistryConfig,
    http: reqwest::Client,
}

/// The embedded registry server.
pub struct Registry {
    state: Arc<RegistryState>,
}

impl Registry {
    pub fn new(cfg: RegistryConfig, store: Arc<BlobStore>) -> Self {
        Self {
            state: Arc::new(RegistryState {
                store,
                cfg,
                http: reqwest::Client::new(),
            }),
        }
    }

    /// Builds the axum router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/v2", any(handle_base))
            .route("/v2/", any(handle_base))
            .route("/v2/_catalog", get(handle_catalog))
            .route("/v2/*rest", any(handle_v2))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Binds the configured address and serves until shutdown fires.
    pub async fn serve(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.state.cfg.listen_addr.as_str()).await?;
        info!(addr = %self.state.cfg.listen_addr, "registry listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
    }
}

// =============================================================================
// Path Parsing
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resource {
    Manifests,
    Blobs,
}

/// Splits `<repo>/manifests/<ref>` or `<repo>/blobs/<digest>`, tolerating
/// repositories that contain slashes.
fn parse_v2_path(rest: &str) -> Option<(&str, Resource, &str)> {
    for (keyword, resource) in [("/manifests/", Resource::Manifests), ("/blobs/", Resource::Blobs)]
    {
        if let Some(idx) = rest.rfind(keyword) {
            let repo = &rest[..idx];
            let reference = &rest[idx + keyword.len()..];
            if !repo.is_empty() && !reference.is_empty() && !reference.contains('/') {
                return Some((repo, resource, reference));
            }
        }
    }
    None
}

// =============================================================================
// Handlers
// =============================================================================

async fn handle_base() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(VERSION_HEADER, DISTRIBUTION_API_VERSION)
        .body(Body::empty())
        .unwrap()
}

async fn handle_catalog(State(state): State<Arc<RegistryState>>) -> Response {
    let repos = state.store.list_repositories();
    Json(serde_json::json!({ "repositories": repos })).into_response()
}

async fn handle_v2(
    State(state): State<Arc<RegistryState>>,
    Path(rest): Path<String>,
    req: Request,
) -> Response {
    let method = req.method().clone();
    let headers = req.headers().clone();

    let Some((repo, resource, reference)) = parse_v2_path(&rest) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let repo = repo.to_string();
    let reference = reference.to_string();

    match resource {
        Resource::Manifests if method == Method::GET => {
            get_manifest(&state, &repo, &reference, &headers, false).await
        }
        Resource::Manifests if method == Method::HEAD => {
            get_manifest(&state, &repo, &reference, &headers, true).await
        }
        Resource::Manifests if method == Method::PUT => {
            put_manifest(&state, &repo, &reference, &headers, req).await
        }
        Resource::Blobs if method == Method::GET => {
            get_blob(&state, &repo, &reference, false).await
        }
        Resource::Blobs if method == Method::HEAD => {
            get_blob(&state, &repo, &reference, true).await
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

// ── manifests ──────────────────────────────────────────────────────────

async fn get_manifest(
    state: &RegistryState,
    repo: &str,
    reference: &str,
    headers: &HeaderMap,
    head_only: bool,
) -> Response {
    if let Ok((data, content_type)) = state.store.get_manifest(repo, reference) {
        return manifest_response(&data, &content_type, reference, head_only);
    }

    if state.cfg.pull_through && !head_only {
        if let Some((data, content_type)) =
            pull_through_manifest(state, repo, reference, headers).await
        {
            return manifest_response(&data, &content_type, reference, false);
        }
    }

    StatusCode::NOT_FOUND.into_response()
}

fn manifest_response(
    data: &[u8],
    content_type: &str,
    reference: &str,
    head_only: bool,
) -> Response {
    let body = if head_only {
        Body::empty()
    } else {
        Body::from(data.to_vec())
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, data.len())
        .header(DIGEST_HEADER, reference)
        .body(body)
        .unwrap()
}

async fn put_manifest(
    state: &RegistryState,
    repo: &str,
    reference: &str,
    headers: &HeaderMap,
    req: Request,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let data = match axum::body::to_bytes(req.into_body(), MAX_MANIFEST_SIZE).await {
        Ok(data) => data,
        Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
    };

    if let Err(e) = state
        .store
        .put_manifest(repo, reference, &content_type, &data)
    {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    Response::builder()
        .status(StatusCode::CREATED)
        .header(DIGEST_HEADER, reference)
        .body(Body::empty())
        .unwrap()
}

async fn pull_through_manifest(
    state: &RegistryState,
    repo: &str,
    reference: &str,
    headers: &HeaderMap,
) -> Option<(Vec<u8>, String)> {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("*/*");

    for upstream in &state.cfg.upstreams {
        let url = format!("https://{upstream}/v2/{repo}/manifests/{reference}");
        let resp = match state
            .http
            .get(&url)
            .header(header::ACCEPT, accept)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                debug!(upstream, repo, reference, status = %resp.status(), "upstream miss");
                continue;
            }
            Err(e) => {
                debug!(upstream, repo, reference, error = %e, "upstream unreachable");
                continue;
            }
        };

        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let data = match resp.bytes().await {
            Ok(data) => data,
            Err(e) => {
                warn!(upstream, repo, reference, error = %e, "upstream body read failed");
                continue;
            }
        };

        if let Err(e) = state.store.put_manifest(repo, reference, &content_type, &data) {
            warn!(repo, reference, error = %e, "failed to cache manifest");
            continue;
        }

        debug!(upstream, repo, reference, "pull-through manifest cached");
        return state.store.get_manifest(repo, reference).ok();
    }

    None
}

// ── blobs ──────────────────────────────────────────────────────────────

async fn get_blob(state: &RegistryState, repo: &str, digest: &str, head_only: bool) -> Response {
    if head_only {
        let (exists, size) = state.store.has_blob(digest);
        if exists {
            return Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .header(header::CONTENT_LENGTH, size)
                .header(DIGEST_HEADER, digest)
                .body(Body::empty())
                .unwrap();
        }
        return StatusCode::NOT_FOUND.into_response();
    }

    if let Ok(data) = state.store.get_blob(digest) {
        return blob_response(data, digest);
    }

    if state.cfg.pull_through {
        if let Some(data) = pull_through_blob(state, repo, digest).await {
            return blob_response(data, digest);
        }
    }

    StatusCode::NOT_FOUND.into_response()
}

fn blob_response(data: Vec<u8>, digest: &str) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, data.len())
        .header(DIGEST_HEADER, digest)
        .body(Body::from(data))
        .unwrap()
}

async fn pull_through_blob(state: &RegistryState, repo: &str, digest: &str) -> Option<Vec<u8>> {
    for upstream in &state.cfg.upstreams {
        let url = format!("https://{upstream}/v2/{repo}/blobs/{digest}");
        let resp = match state.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                debug!(upstream, repo, digest, status = %resp.status(), "upstream miss");
                continue;
            }
            Err(e) => {
                debug!(upstream, repo, digest, error = %e, "upstream unreachable");
                continue;
            }
        };

        let data = match resp.bytes().await {
            Ok(data) => data,
            Err(e) => {
                warn!(upstream, repo, digest, error = %e, "upstream body read failed");
                continue;
            }
        };

        if let Err(e) = state.store.put_blob(digest, &data) {
            warn!(digest, error = %e, "failed to cache blob");
            continue;
        }

        debug!(upstream, repo, digest, "pull-through blob cached");
        return state.store.get_blob(digest).ok();
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_v2_path() {
        assert_eq!(
            parse_v2_path("library/nginx/manifests/latest"),
            Some(("library/nginx", Resource::Manifests, "latest"))
        );
        assert_eq!(
            parse_v2_path("myrepo/blobs/sha256:abc"),
            Some(("myrepo", Resource::Blobs, "sha256:abc"))
        );
        assert_eq!(
            parse_v2_path("a/b/c/manifests/sha256:def"),
            Some(("a/b/c", Resource::Manifests, "sha256:def"))
        );
        assert_eq!(parse_v2_path("manifests/latest"), None);
        assert_eq!(parse_v2_path("repo/tags/list"), None);
    }
}
