//! Tests for pod manifest parsing and naming.

use roskube::pod::{Pod, ProbeKind, RestartPolicy};
use roskube::provider::{sanitize_name, veth_name};

const WEB_POD: &str = r#"
apiVersion: v1
kind: Pod
metadata:
  name: web
  namespace: default
  annotations:
    mikrotik.io/boot-priority: "30"
    mikrotik.io/depends-on: "database, cache"
spec:
  restartPolicy: Always
  containers:
    - name: nginx
      image: nginx:1.25
      command: ["nginx", "-g", "daemon off;"]
      env:
        - name: MODE
          value: production
        - name: EMPTY
      volumeMounts:
        - name: html
          mountPath: /usr/share/nginx/html
      livenessProbe:
        httpGet:
          path: /healthz
          port: 8080
        periodSeconds: 10
        timeoutSeconds: 2
        failureThreshold: 3
"#;

#[test]
fn test_parse_full_pod() {
    let pod = Pod::from_yaml(WEB_POD).unwrap();

    assert_eq!(pod.namespace, "default");
    assert_eq!(pod.name, "web");
    assert_eq!(pod.key(), "default/web");
    assert_eq!(pod.restart_policy, RestartPolicy::Always);

    assert_eq!(pod.containers.len(), 1);
    let container = &pod.containers[0];
    assert_eq!(container.name, "nginx");
    assert_eq!(container.image, "nginx:1.25");
    assert_eq!(container.command, vec!["nginx", "-g", "daemon off;"]);
    assert_eq!(container.env.get("MODE"), Some(&"production".to_string()));
    assert_eq!(container.env.get("EMPTY"), Some(&String::new()));
    assert_eq!(container.volume_mounts.len(), 1);
    assert_eq!(container.volume_mounts[0].mount_path, "/usr/share/nginx/html");

    let probe = container.probe.as_ref().unwrap();
    assert_eq!(
        probe.kind,
        ProbeKind::Http {
            path: "/healthz".to_string(),
            port: 8080
        }
    );
    assert_eq!(probe.interval_secs, 10);
    assert_eq!(probe.timeout_secs, 2);
    assert_eq!(probe.failure_threshold, 3);
}

#[test]
fn test_annotations_drive_priority_and_dependencies() {
    let pod = Pod::from_yaml(WEB_POD).unwrap();
    assert_eq!(pod.boot_priority(0), 30);
    assert_eq!(pod.depends_on(), vec!["database", "cache"]);
}

#[test]
fn test_priority_defaults_to_index_times_ten() {
    let pod = Pod::from_yaml(
        r#"
metadata:
  name: plain
spec:
  containers:
    - name: a
      image: a:1
    - name: b
      image: b:1
"#,
    )
    .unwrap();
    assert_eq!(pod.boot_priority(0), 0);
    assert_eq!(pod.boot_priority(1), 10);
    assert!(pod.depends_on().is_empty());
}

#[test]
fn test_defaults() {
    let pod = Pod::from_yaml(
        r#"
metadata:
  name: minimal
spec:
  containers:
    - name: app
      image: alpine:3.18
"#,
    )
    .unwrap();
    assert_eq!(pod.namespace, "default");
    assert_eq!(pod.restart_policy, RestartPolicy::Always);
    assert!(pod.containers[0].probe.is_none());
    assert!(pod.containers[0].command.is_empty());
}

#[test]
fn test_tcp_and_exec_probes() {
    let pod = Pod::from_yaml(
        r#"
metadata:
  name: probes
spec:
  restartPolicy: OnFailure
  containers:
    - name: tcp
      image: redis:7
      livenessProbe:
        tcpSocket:
          port: 6379
    - name: opaque
      image: worker:1
      livenessProbe:
        exec:
          command: ["true"]
"#,
    )
    .unwrap();

    assert_eq!(pod.restart_policy, RestartPolicy::OnFailure);
    assert_eq!(
        pod.containers[0].probe.as_ref().unwrap().kind,
        ProbeKind::Tcp { port: 6379 }
    );
    // Probes with no reachable endpoint degrade to runtime status checks.
    assert_eq!(
        pod.containers[1].probe.as_ref().unwrap().kind,
        ProbeKind::StatusOnly
    );
}

#[test]
fn test_rejects_incomplete_manifests() {
    assert!(Pod::from_yaml("metadata: {}").is_err());
    assert!(Pod::from_yaml("metadata: {name: x}\nspec: {containers: []}").is_err());
    assert!(
        Pod::from_yaml("metadata: {name: x}\nspec: {containers: [{name: a}]}").is_err(),
        "container without image"
    );
}

#[test]
fn test_load_multi_document_manifest() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("pods.yaml");
    std::fs::write(
        &path,
        r#"
metadata:
  name: web
spec:
  containers:
    - name: nginx
      image: nginx:1.25
---
kind: ConfigMap
metadata:
  name: ignored
---
kind: Pod
metadata:
  name: db
  namespace: infra
spec:
  restartPolicy: Never
  containers:
    - name: postgres
      image: postgres:16
"#,
    )
    .unwrap();

    let pods = Pod::load_manifest(&path).unwrap();
    assert_eq!(pods.len(), 2);
    assert_eq!(pods[0].key(), "default/web");
    assert_eq!(pods[1].key(), "infra/db");
    assert_eq!(pods[1].restart_policy, RestartPolicy::Never);
}

#[test]
fn test_pod_clone_is_deep() {
    let pod = Pod::from_yaml(WEB_POD).unwrap();
    let mut copy = pod.clone();
    copy.containers[0].env.insert("MODE".to_string(), "debug".to_string());
    assert_eq!(pod.containers[0].env.get("MODE"), Some(&"production".to_string()));
}

// ── naming ─────────────────────────────────────────────────────────────

#[test]
fn test_sanitize_name_alphabet_and_length() {
    let name = sanitize_name("My_Pod.Name", "Nginx");
    assert!(name.len() <= 32);
    assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    assert_eq!(name, "my-pod-name-nginx");
}

#[test]
fn test_sanitize_name_truncates() {
    let name = sanitize_name(
        "a-very-long-pod-name-that-goes-on",
        "and-a-long-container-too",
    );
    assert_eq!(name.len(), 32);
}

#[test]
fn test_sanitize_name_idempotent_on_safe_input() {
    // Already-safe input maps to itself.
    assert_eq!(sanitize_name("web-app", "main"), "web-app-main");
    assert_eq!(sanitize_name("Web.App", "Main"), "web-app-main");
}

#[test]
fn test_veth_name_truncates_pod_prefix() {
    assert_eq!(veth_name("web", 0), "veth-web-0");
    assert_eq!(veth_name("a-much-longer-name", 2), "veth-a-much-l-2");
}
