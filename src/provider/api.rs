//! Management API: pods with live status, switch summaries, IPAM dump.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::pod::{Pod, PodStatus};

use super::Provider;

/// A pod enriched with its live status.
#[derive(Debug, Clone, Serialize)]
pub struct PodView {
    #[serde(flatten)]
    pub pod: Pod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PodStatus>,
}

/// Standard list envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub count: usize,
}

impl<T> ListResponse<T> {
    fn new(items: Vec<T>) -> Self {
        let count = items.len();
        Self { items, count }
    }
}

/// The management API server.
pub struct ApiServer {
    provider: Arc<Provider>,
}

impl ApiServer {
    pub fn new(provider: Arc<Provider>) -> Self {
        Self { provider }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/v1/pods", get(list_pods))
            .route("/api/v1/namespaces/:namespace/pods", get(list_namespaced_pods))
            .route(
                "/api/v1/namespaces/:namespace/pods/:name",
                get(get_pod),
            )
            .route("/api/v1/networks", get(list_networks))
            .route("/api/v1/networks/:name", get(get_network))
            .route("/api/v1/networks/:name/ports", get(get_network_ports))
            .route("/api/v1/allocations", get(get_allocations))
            .route("/api/v1/node", get(get_node))
            .layer(TraceLayer::new_for_http())
            .with_state(self.provider.clone())
    }

    /// Binds the configured address and serves until shutdown fires.
    pub async fn serve(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        let addr = self.provider.config().api.listen_addr.clone();
        let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
        info!(addr = %addr, "management API listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
    }
}

async fn pod_view(provider: &Provider, pod: Pod) -> PodView {
    let status = provider.pod_status(&pod.namespace, &pod.name).await.ok();
    PodView { pod, status }
}

async fn list_pods(State(provider): State<Arc<Provider>>) -> Response {
    let mut views = Vec::new();
    for pod in provider.get_pods() {
        views.push(pod_view(&provider, pod).await);
    }
    Json(ListResponse::new(views)).into_response()
}

async fn list_namespaced_pods(
    State(provider): State<Arc<Provider>>,
    Path(namespace): Path<String>,
) -> Response {
    let mut views = Vec::new();
    for pod in provider.get_pods() {
        if pod.namespace == namespace {
            views.push(pod_view(&provider, pod).await);
        }
    }
    Json(ListResponse::new(views)).into_response()
}

async fn get_pod(
    State(provider): State<Arc<Provider>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    match provider.get_pod(&namespace, &name) {
        Ok(pod) => Json(pod_view(&provider, pod).await).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

async fn list_networks(State(provider): State<Arc<Provider>>) -> Response {
    Json(provider.network().switches()).into_response()
}

async fn get_network(
    State(provider): State<Arc<Provider>>,
    Path(name): Path<String>,
) -> Response {
    match provider.network().switch_detail(&name) {
        Some(detail) => Json(detail).into_response(),
        None => (StatusCode::NOT_FOUND, "network not found").into_response(),
    }
}

async fn get_network_ports(
    State(provider): State<Arc<Provider>>,
    Path(name): Path<String>,
) -> Response {
    match provider.network().switch_ports(&name) {
        Some(ports) => Json(ports).into_response(),
        None => (StatusCode::NOT_FOUND, "network not found").into_response(),
    }
}

async fn get_allocations(State(provider): State<Arc<Provider>>) -> Response {
    Json(provider.network().allocations()).into_response()
}

async fn get_node(State(provider): State<Arc<Provider>>) -> Response {
    Json(provider.node_description()).into_response()
}
