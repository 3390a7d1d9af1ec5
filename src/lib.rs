//! # roskube
//!
//! **Pod orchestration for the MikroTik RouterOS container runtime**
//!
//! This crate accepts Kubernetes-style Pod descriptions (from a local
//! manifest file or an external desired-state feed) and reconciles them
//! against the container runtime a RouterOS device exposes over its REST
//! API. Around the pod lifecycle it manages IP allocation on a bridged pod
//! network, converts OCI images into the docker-save tarballs RouterOS
//! loads, serves those images from an embedded OCI registry with
//! pull-through caching, and supervises running containers with health
//! probes, dependency-ordered boot, and restart policies.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            roskube                               │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Pod feed (manifest file / API) ──▶ Provider ──▶ Supervisor      │
//! │                                       │               │          │
//! │        Image Pipeline ◀── ensure ─────┤          watchdog        │
//! │        │        │                     │               │          │
//! │   Registry   docker-save         NetworkMgr           │          │
//! │        │        │                 (IPAM)              │          │
//! │   Blob Store   upload                 │               │          │
//! │                 └────────────┬────────┴───────────────┘          │
//! │                              ▼                                   │
//! │                        RuntimePort                               │
//! │              (RouterOS REST / in-memory fake)                    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`runtime`]: the capability surface over the device runtime:
//!   containers, veth interfaces, bridge ports, files. Production uses the
//!   REST transport; tests swap in an in-memory fake.
//! - [`ipam`]: pool-scoped sequential IPv4 allocation with static pins and
//!   crash-survival seeding.
//! - [`network`]: veth + bridge-port orchestration on top of IPAM.
//! - [`store`] / [`registry`]: content-addressed blob/manifest storage and
//!   the OCI Distribution v2 server with pull-through caching.
//! - [`image`]: OCI reference → docker-save tarball pipeline with a
//!   reference-counted cache and garbage collection.
//! - [`pod`] / [`provider`]: the pod model and the translator that drives
//!   pod specs to runtime state, plus the standalone reconciler and the
//!   management API.
//! - [`supervisor`]: dependency-ordered boot, health probing, and
//!   restart-with-backoff.
//!
//! # Concurrency Model
//!
//! One process, several periodic tasks (reconciler, supervisor watchdog,
//! infrastructure watchdog, image GC) plus the two HTTP servers, all
//! sharing state under per-component locks. Every loop selects on a
//! `tokio::sync::watch` shutdown signal and finishes its current iteration
//! before returning. Only the [`runtime::RuntimePort`] is shared across all
//! tasks; it is safe for concurrent calls.

pub mod config;
pub mod constants;
pub mod error;
pub mod image;
pub mod ipam;
pub mod network;
pub mod pod;
pub mod provider;
pub mod registry;
pub mod runtime;
pub mod store;
pub mod supervisor;

pub use config::Config;
pub use error::{Error, Result};
