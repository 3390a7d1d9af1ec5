//! Tests for the embedded OCI registry, driven through the axum router.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use roskube::config::RegistryConfig;
use roskube::registry::Registry;
use roskube::store::BlobStore;
use tempfile::TempDir;
use tower::ServiceExt;

const MANIFEST_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

fn test_registry() -> (TempDir, Arc<BlobStore>, Router) {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(BlobStore::new(temp.path()).unwrap());
    let cfg = RegistryConfig {
        pull_through: false,
        upstreams: Vec::new(),
        ..Default::default()
    };
    let router = Registry::new(cfg, store.clone()).router();
    (temp, store, router)
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

#[tokio::test]
async fn test_v2_base_returns_version_header() {
    let (_temp, _store, router) = test_registry();

    for uri in ["/v2/", "/v2"] {
        let response = router
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("Docker-Distribution-API-Version")
                .unwrap(),
            "registry/2.0"
        );
    }
}

#[tokio::test]
async fn test_catalog_empty() {
    let (_temp, _store, router) = test_registry();

    let response = router
        .oneshot(Request::get("/v2/_catalog").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body, serde_json::json!({ "repositories": [] }));
}

#[tokio::test]
async fn test_manifest_put_then_get_roundtrip() {
    let (_temp, _store, router) = test_registry();
    let manifest = r#"{"schemaVersion":2,"mediaType":"application/vnd.docker.distribution.manifest.v2+json"}"#;

    let put = router
        .clone()
        .oneshot(
            Request::put("/v2/library/nginx/manifests/latest")
                .header("Content-Type", MANIFEST_TYPE)
                .body(Body::from(manifest))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(put.status(), StatusCode::CREATED);
    assert_eq!(
        put.headers().get("Docker-Content-Digest").unwrap(),
        "latest"
    );

    let get = router
        .clone()
        .oneshot(
            Request::get("/v2/library/nginx/manifests/latest")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(get.status(), StatusCode::OK);
    assert_eq!(get.headers().get("Content-Type").unwrap(), MANIFEST_TYPE);
    assert_eq!(body_bytes(get).await, manifest.as_bytes());

    let catalog = router
        .oneshot(Request::get("/v2/_catalog").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body: serde_json::Value =
        serde_json::from_slice(&body_bytes(catalog).await).unwrap();
    assert_eq!(body, serde_json::json!({ "repositories": ["library/nginx"] }));
}

#[tokio::test]
async fn test_manifest_head_matches_get_headers() {
    let (_temp, store, router) = test_registry();
    store
        .put_manifest("testrepo", "v1", MANIFEST_TYPE, b"test-manifest-data")
        .unwrap();

    let get = router
        .clone()
        .oneshot(
            Request::get("/v2/testrepo/manifests/v1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let head = router
        .oneshot(
            Request::head("/v2/testrepo/manifests/v1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(head.status(), StatusCode::OK);
    for name in ["Content-Type", "Content-Length", "Docker-Content-Digest"] {
        assert_eq!(
            head.headers().get(name),
            get.headers().get(name),
            "header {name} differs between HEAD and GET"
        );
    }
    assert!(body_bytes(head).await.is_empty());
}

#[tokio::test]
async fn test_blob_head_and_get() {
    let (_temp, store, router) = test_registry();
    let data = b"hello world blob data";
    store.put_blob("sha256:abc123", data).unwrap();

    let head = router
        .clone()
        .oneshot(
            Request::head("/v2/myrepo/blobs/sha256:abc123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(head.status(), StatusCode::OK);
    assert_eq!(
        head.headers().get("Content-Length").unwrap(),
        &data.len().to_string()
    );
    assert_eq!(
        head.headers().get("Docker-Content-Digest").unwrap(),
        "sha256:abc123"
    );

    let get = router
        .oneshot(
            Request::get("/v2/myrepo/blobs/sha256:abc123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(get.status(), StatusCode::OK);
    assert_eq!(body_bytes(get).await, data);
}

#[tokio::test]
async fn test_blob_missing_is_404() {
    let (_temp, _store, router) = test_registry();

    let response = router
        .oneshot(
            Request::get("/v2/myrepo/blobs/sha256:nonexistent")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_nested_repo_path() {
    let (_temp, store, router) = test_registry();
    store
        .put_manifest("library/nginx", "latest", "application/json", br#"{"test":true}"#)
        .unwrap();

    let response = router
        .oneshot(
            Request::get("/v2/library/nginx/manifests/latest")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_manifest_delete_not_allowed() {
    let (_temp, _store, router) = test_registry();

    let response = router
        .oneshot(
            Request::delete("/v2/myrepo/manifests/latest")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_unparseable_v2_path_is_404() {
    let (_temp, _store, router) = test_registry();

    let response = router
        .oneshot(
            Request::get("/v2/just-a-repo")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_manifest_digest_reference() {
    let (_temp, _store, router) = test_registry();

    let put = router
        .clone()
        .oneshot(
            Request::put("/v2/myrepo/manifests/sha256:deadbeef")
                .header("Content-Type", MANIFEST_TYPE)
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(put.status(), StatusCode::CREATED);

    let get = router
        .oneshot(
            Request::get("/v2/myrepo/manifests/sha256:deadbeef")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(get.status(), StatusCode::OK);
    assert_eq!(body_bytes(get).await, b"{}");
}
