//! RouterOS REST transport for the runtime port.
//!
//! Talks to the device's REST API (`/rest/container`, `/rest/interface/veth`,
//! `/rest/interface/bridge/port`, `/rest/file`) with basic auth and JSON
//! bodies. TLS verification is configurable for devices with self-signed
//! certificates.
//!
//! ## Status Mapping
//!
//! | HTTP | Error |
//! |------|-------|
//! | 401 / 403 | `Auth` |
//! | 404 | `NotFound` |
//! | 409, or 400 mentioning "already" | `AlreadyExists` |
//! | other 400 | `Conflict` |
//! | everything else | `Transport` |

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::RouterOsConfig;
use crate::error::{Error, Result};

use super::{ContainerCreateSpec, ContainerRecord, ContainerStatus, RuntimePort, VethRecord};

/// REST client for a RouterOS device.
///
/// Cheap to clone is not needed; wrap in `Arc` and share across tasks. The
/// underlying `reqwest::Client` pools connections and is safe for
/// concurrent calls.
pub struct RouterOsClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

/// Raw container row as returned by `/rest/container`.
#[derive(Debug, Deserialize)]
struct RawContainer {
    #[serde(rename = ".id")]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    interface: String,
}

impl From<RawContainer> for ContainerRecord {
    fn from(raw: RawContainer) -> Self {
        ContainerRecord {
            id: raw.id,
            name: raw.name,
            status: ContainerStatus::parse(&raw.status),
            interface: raw.interface,
        }
    }
}

/// Raw veth row as returned by `/rest/interface/veth`.
#[derive(Debug, Deserialize)]
struct RawVeth {
    #[serde(rename = ".id")]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    gateway: String,
}

/// Raw bridge port row as returned by `/rest/interface/bridge/port`.
/// The lookup filters by interface server-side, so only the id and the
/// bridge assignment are carried.
#[derive(Debug, Deserialize)]
struct RawBridgePort {
    #[serde(rename = ".id")]
    id: String,
    #[serde(default)]
    bridge: String,
}

impl RouterOsClient {
    /// Builds a client from transport configuration.
    pub fn new(cfg: &RouterOsConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!cfg.tls_verify)
            .build()
            .map_err(|e| Error::Transport {
                operation: "client init".to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            http,
            base_url: cfg.endpoint.trim_end_matches('/').to_string(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/rest{}", self.base_url, path)
    }

    /// Issues a request and maps non-2xx statuses to error kinds.
    async fn send(
        &self,
        operation: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let resp = req
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| Error::Transport {
                operation: operation.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        Err(map_status(operation, status, &body))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
    ) -> Result<T> {
        let resp = self.send(operation, self.http.get(self.url(path))).await?;
        resp.json().await.map_err(|e| Error::Transport {
            operation: operation.to_string(),
            reason: format!("decoding response: {e}"),
        })
    }

    /// Finds the `.id` of a veth by name.
    async fn veth_id(&self, name: &str) -> Result<String> {
        let rows: Vec<RawVeth> = self
            .get_json("veth lookup", &format!("/interface/veth?name={name}"))
            .await?;
        rows.into_iter()
            .next()
            .map(|v| v.id)
            .ok_or_else(|| Error::NotFound {
                what: format!("veth {name}"),
            })
    }
}

#[async_trait::async_trait]
impl RuntimePort for RouterOsClient {
    async fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
        let rows: Vec<RawContainer> = self.get_json("container list", "/container").await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_container(&self, name: &str) -> Result<ContainerRecord> {
        let rows: Vec<RawContainer> = self
            .get_json("container get", &format!("/container?name={name}"))
            .await?;
        rows.into_iter()
            .next()
            .map(Into::into)
            .ok_or_else(|| Error::NotFound {
                what: format!("container {name}"),
            })
    }

    async fn create_container(&self, spec: &ContainerCreateSpec) -> Result<()> {
        // Environment variables go into a RouterOS envlist named after the
        // container, referenced from the container row.
        let envlist = format!("{}-env", spec.name);
        for (key, value) in &spec.envs {
            let body = json!({ "name": envlist, "key": key, "value": value });
            match self
                .send("env create", self.http.put(self.url("/container/envs")).json(&body))
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_already_exists() => {
                    debug!(key, envlist, "env entry already present");
                }
                Err(e) => return Err(e),
            }
        }

        let mut body = serde_json::Map::new();
        body.insert("name".into(), json!(spec.name));
        body.insert("file".into(), json!(spec.file));
        body.insert("interface".into(), json!(spec.interface));
        body.insert("root-dir".into(), json!(spec.root_dir));
        if !spec.mounts.is_empty() {
            body.insert("mounts".into(), json!(spec.mounts.join(",")));
        }
        if !spec.envs.is_empty() {
            body.insert("envlist".into(), json!(envlist));
        }
        if !spec.cmd.is_empty() {
            body.insert("cmd".into(), json!(spec.cmd));
        }
        if !spec.hostname.is_empty() {
            body.insert("hostname".into(), json!(spec.hostname));
        }
        if !spec.dns.is_empty() {
            body.insert("dns".into(), json!(spec.dns));
        }
        body.insert("logging".into(), json!(yes_no(spec.logging)));
        body.insert("start-on-boot".into(), json!(yes_no(spec.start_on_boot)));

        self.send(
            "container create",
            self.http.put(self.url("/container")).json(&body),
        )
        .await?;
        Ok(())
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.send(
            "container start",
            self.http
                .post(self.url("/container/start"))
                .json(&json!({ "number": id })),
        )
        .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.send(
            "container stop",
            self.http
                .post(self.url("/container/stop"))
                .json(&json!({ "number": id })),
        )
        .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.send(
            "container remove",
            self.http.delete(self.url(&format!("/container/{id}"))),
        )
        .await?;
        Ok(())
    }

    async fn create_veth(&self, name: &str, address: &str, gateway: &str) -> Result<()> {
        let body = json!({ "name": name, "address": address, "gateway": gateway });
        self.send(
            "veth create",
            self.http.put(self.url("/interface/veth")).json(&body),
        )
        .await?;
        Ok(())
    }

    async fn remove_veth(&self, name: &str) -> Result<()> {
        let id = self.veth_id(name).await?;
        self.send(
            "veth remove",
            self.http.delete(self.url(&format!("/interface/veth/{id}"))),
        )
        .await?;
        Ok(())
    }

    async fn list_veths(&self) -> Result<Vec<VethRecord>> {
        let rows: Vec<RawVeth> = self.get_json("veth list", "/interface/veth").await?;
        Ok(rows
            .into_iter()
            .map(|v| VethRecord {
                name: v.name,
                address: v.address,
                gateway: v.gateway,
            })
            .collect())
    }

    async fn add_bridge_port(&self, bridge: &str, port: &str) -> Result<()> {
        let body = json!({ "bridge": bridge, "interface": port });
        self.send(
            "bridge port add",
            self.http.put(self.url("/interface/bridge/port")).json(&body),
        )
        .await?;
        Ok(())
    }

    async fn remove_bridge_port(&self, bridge: &str, port: &str) -> Result<()> {
        let rows: Vec<RawBridgePort> = self
            .get_json(
                "bridge port lookup",
                &format!("/interface/bridge/port?interface={port}"),
            )
            .await?;
        let row = rows
            .into_iter()
            .find(|r| r.bridge == bridge || bridge.is_empty())
            .ok_or_else(|| Error::NotFound {
                what: format!("bridge port {port}"),
            })?;
        self.send(
            "bridge port remove",
            self.http
                .delete(self.url(&format!("/interface/bridge/port/{}", row.id))),
        )
        .await?;
        Ok(())
    }

    async fn upload_file(&self, path: &str, data: Vec<u8>) -> Result<()> {
        // RouterOS accepts raw uploads at /file/<name>.
        let name = path.trim_start_matches('/');
        self.send(
            "file upload",
            self.http
                .put(self.url(&format!("/file/{name}")))
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(data),
        )
        .await?;
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        let name = path.trim_start_matches('/');
        self.send(
            "file remove",
            self.http.delete(self.url(&format!("/file/{name}"))),
        )
        .await?;
        Ok(())
    }
}

fn yes_no(v: bool) -> &'static str {
    if v {
        "yes"
    } else {
        "no"
    }
}

/// Maps an HTTP error status to an error kind.
fn map_status(operation: &str, status: reqwest::StatusCode, body: &str) -> Error {
    match status.as_u16() {
        401 | 403 => Error::Auth {
            reason: format!("{operation}: HTTP {status}"),
        },
        404 => Error::NotFound {
            what: operation.to_string(),
        },
        409 => Error::AlreadyExists {
            what: operation.to_string(),
        },
        400 if body.contains("already") => Error::AlreadyExists {
            what: operation.to_string(),
        },
        400 => Error::Conflict {
            what: operation.to_string(),
            reason: truncate_body(body),
        },
        _ => Error::Transport {
            operation: operation.to_string(),
            reason: format!("HTTP {status}: {}", truncate_body(body)),
        },
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.chars().count() > MAX {
        let cut: String = body.chars().take(MAX).collect();
        format!("{cut}…")
    } else {
        body.to_string()
    }
}
