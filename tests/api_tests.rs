//! Tests for the management API endpoints.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use roskube::pod::Pod;
use roskube::provider::api::ApiServer;
use tower::ServiceExt;

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn web_pod() -> Pod {
    Pod::from_yaml(
        r#"
metadata:
  name: web
  namespace: default
spec:
  containers:
    - name: nginx
      image: nginx:1.25
"#,
    )
    .unwrap()
}

#[tokio::test]
async fn test_list_pods_with_live_status() {
    let h = common::harness();
    h.provider.create_pod(&web_pod()).await.unwrap();
    let router = ApiServer::new(h.provider.clone()).router();

    let response = router
        .oneshot(Request::get("/api/v1/pods").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["items"][0]["name"], "web");
    assert_eq!(body["items"][0]["namespace"], "default");
    assert_eq!(body["items"][0]["status"]["phase"], "Running");
}

#[tokio::test]
async fn test_namespaced_pod_endpoints() {
    let h = common::harness();
    h.provider.create_pod(&web_pod()).await.unwrap();
    let router = ApiServer::new(h.provider.clone()).router();

    let listed = router
        .clone()
        .oneshot(
            Request::get("/api/v1/namespaces/default/pods")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(json_body(listed).await["count"], 1);

    let empty = router
        .clone()
        .oneshot(
            Request::get("/api/v1/namespaces/other/pods")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(json_body(empty).await["count"], 0);

    let single = router
        .clone()
        .oneshot(
            Request::get("/api/v1/namespaces/default/pods/web")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(single.status(), StatusCode::OK);
    assert_eq!(json_body(single).await["name"], "web");

    let missing = router
        .oneshot(
            Request::get("/api/v1/namespaces/default/pods/ghost")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_network_endpoints() {
    let h = common::harness();
    h.provider.create_pod(&web_pod()).await.unwrap();
    let router = ApiServer::new(h.provider.clone()).router();

    let networks = router
        .clone()
        .oneshot(Request::get("/api/v1/networks").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = json_body(networks).await;
    assert_eq!(body[0]["name"], "pods");
    assert_eq!(body[0]["bridge"], "containers");
    assert_eq!(body[0]["ports"], 1);

    let detail = router
        .clone()
        .oneshot(
            Request::get("/api/v1/networks/pods")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(json_body(detail).await["cidr"], "172.20.0.0/24");

    let ports = router
        .clone()
        .oneshot(
            Request::get("/api/v1/networks/pods/ports")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = json_body(ports).await;
    assert_eq!(body[0]["name"], "veth-web-0");
    assert_eq!(body[0]["hostname"], "web");

    let missing = router
        .oneshot(
            Request::get("/api/v1/networks/ghost")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_allocations_dump() {
    let h = common::harness();
    h.provider.create_pod(&web_pod()).await.unwrap();
    let router = ApiServer::new(h.provider.clone()).router();

    let response = router
        .oneshot(
            Request::get("/api/v1/allocations")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["veth-web-0"], "172.20.0.2");
}
