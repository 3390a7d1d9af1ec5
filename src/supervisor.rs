//! Container supervision: boot ordering, health probing, restarts.
//!
//! The supervisor keeps a registry of *units* (running containers that
//! asked for supervision), boots them in dependency order with priority as
//! the tie-break, probes their health on a watchdog cadence, and restarts
//! unhealthy ones with a restart budget and cooldown.
//!
//! Unit status walks `running → unhealthy → restarting → running` on
//! recovery, or `restarting → failed` once the restart budget is spent.
//! Policy `Never` pins an unhealthy unit at `stopped`. `OnFailure` behaves
//! like `Always` here because restarts are only ever triggered by observed
//! unhealthiness.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::constants::{
    BOOT_HEALTH_TIMEOUT, BOOT_STAGGER, HEALTH_WAIT_POLL, RESTART_STOP_DELAY,
};
use crate::pod::{ProbeKind, ProbeSpec, RestartPolicy};
use crate::runtime::RuntimePort;

// =============================================================================
// Units
// =============================================================================

/// Lifecycle state of a supervised unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    Running,
    Unhealthy,
    Restarting,
    Stopped,
    Failed,
}

/// A supervised container.
#[derive(Debug, Clone)]
pub struct Unit {
    pub name: String,
    pub container_id: String,
    pub restart_policy: RestartPolicy,
    pub probe: Option<ProbeSpec>,
    /// Names of units that must start first.
    pub depends_on: Vec<String>,
    /// Lower starts first.
    pub priority: i32,

    // Rolling state, managed by the supervisor.
    restart_count: u32,
    last_restart_at: Option<DateTime<Utc>>,
    last_health_at: Option<DateTime<Utc>>,
    unhealthy_since: Option<DateTime<Utc>>,
    healthy: bool,
    status: UnitState,
}

impl Unit {
    pub fn new(name: impl Into<String>, container_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            container_id: container_id.into(),
            restart_policy: RestartPolicy::Always,
            probe: None,
            depends_on: Vec::new(),
            priority: 0,
            restart_count: 0,
            last_restart_at: None,
            last_health_at: None,
            unhealthy_since: None,
            healthy: true,
            status: UnitState::Running,
        }
    }

    pub fn with_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn with_probe(mut self, probe: Option<ProbeSpec>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }
}

/// Exported snapshot of a unit's rolling state.
#[derive(Debug, Clone, Serialize)]
pub struct UnitStatus {
    pub name: String,
    pub status: UnitState,
    pub healthy: bool,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restart_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unhealthy_since: Option<DateTime<Utc>>,
}

// =============================================================================
// Supervisor
// =============================================================================

/// Boot ordering, health probing, and restart handling for containers.
pub struct Supervisor {
    cfg: SupervisorConfig,
    runtime: Arc<dyn RuntimePort>,
    http: reqwest::Client,
    // One lock over the unit map. The watchdog holds the write half across
    // a full sweep; sweeps are short and registration is rare.
    units: RwLock<HashMap<String, Unit>>,
}

impl Supervisor {
    pub fn new(cfg: SupervisorConfig, runtime: Arc<dyn RuntimePort>) -> Self {
        Self {
            cfg,
            runtime,
            http: reqwest::Client::new(),
            units: RwLock::new(HashMap::new()),
        }
    }

    // ── registration ───────────────────────────────────────────────────

    /// Adds a unit, seeding it healthy and running.
    pub async fn register(&self, mut unit: Unit) {
        unit.healthy = true;
        unit.status = UnitState::Running;
        unit.restart_count = 0;
        unit.unhealthy_since = None;

        info!(name = %unit.name, priority = unit.priority, "registered container unit");
        self.units.write().await.insert(unit.name.clone(), unit);
    }

    /// Removes a unit. Unknown names are fine.
    pub async fn unregister(&self, name: &str) {
        self.units.write().await.remove(name);
        info!(name, "unregistered container unit");
    }

    /// Snapshot of every unit's rolling state.
    pub async fn unit_statuses(&self) -> BTreeMap<String, UnitStatus> {
        let units = self.units.read().await;
        units
            .values()
            .map(|u| {
                (
                    u.name.clone(),
                    UnitStatus {
                        name: u.name.clone(),
                        status: u.status,
                        healthy: u.healthy,
                        restart_count: u.restart_count,
                        last_restart_at: u.last_restart_at,
                        last_health_at: u.last_health_at,
                        unhealthy_since: u.unhealthy_since,
                    },
                )
            })
            .collect()
    }

    // ── boot ordering ──────────────────────────────────────────────────

    /// Unit names in boot order: a topological sort over the dependency
    /// DAG with priority as the tie-break.
    ///
    /// Units are pre-sorted by `(priority, name)` and visited depth-first,
    /// dependencies before dependents. Dependencies naming units outside
    /// the set are skipped; a cycle short-circuits at the already-visited
    /// marker and logs a warning.
    pub async fn boot_sequence(&self) -> Vec<String> {
        let units = self.units.read().await;
        topo_sort(&units)
    }

    /// Starts all registered units in boot order. Probed units get up to
    /// 30 s to come up healthy before their dependents start; a short pause
    /// between starts keeps the device responsive.
    pub async fn execute_boot_sequence(&self) {
        let order = self.boot_sequence().await;
        info!(containers = order.len(), "executing boot sequence");

        for (i, name) in order.iter().enumerate() {
            let Some(unit) = self.units.read().await.get(name).cloned() else {
                continue;
            };

            info!(
                order = i + 1,
                name = %unit.name,
                priority = unit.priority,
                depends_on = ?unit.depends_on,
                "booting container"
            );

            if let Err(e) = self.runtime.start_container(&unit.container_id).await {
                error!(name = %unit.name, error = %e, "failed to start container during boot");
                continue;
            }

            if let Some(probe) = &unit.probe {
                if !self.wait_for_healthy(&unit, probe).await {
                    warn!(name = %unit.name, "container not healthy after boot, continuing");
                }
            }

            tokio::time::sleep(BOOT_STAGGER).await;
        }

        info!("boot sequence complete");
    }

    async fn wait_for_healthy(&self, unit: &Unit, probe: &ProbeSpec) -> bool {
        let deadline = tokio::time::Instant::now() + BOOT_HEALTH_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(HEALTH_WAIT_POLL).await;
            if self.probe_once(unit, probe).await {
                return true;
            }
        }
        false
    }

    // ── watchdog ───────────────────────────────────────────────────────

    /// Periodic health sweep driver.
    pub async fn run_watchdog(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = self.cfg.watchdog_interval();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        info!(?interval, "watchdog started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_all().await,
                _ = shutdown.changed() => {
                    info!("watchdog shutting down");
                    return;
                }
            }
        }
    }

    /// One watchdog sweep over every probed unit.
    pub async fn check_all(&self) {
        let mut units = self.units.write().await;

        let names: Vec<String> = units.keys().cloned().collect();
        for name in names {
            let Some(snapshot) = units.get(&name).cloned() else {
                continue;
            };
            let Some(probe) = snapshot.probe.clone() else {
                continue;
            };

            let healthy = self.probe_with_threshold(&snapshot, &probe).await;
            let Some(unit) = units.get_mut(&name) else {
                continue;
            };

            let was_healthy = unit.healthy;
            unit.healthy = healthy;
            unit.last_health_at = Some(Utc::now());

            if was_healthy && !healthy {
                warn!(name = %unit.name, "container became unhealthy");
                unit.status = UnitState::Unhealthy;
                unit.unhealthy_since = Some(Utc::now());
                self.handle_unhealthy(unit).await;
            } else if !was_healthy && healthy {
                info!(name = %unit.name, "container recovered");
                unit.status = UnitState::Running;
                unit.unhealthy_since = None;
            }
        }
    }

    /// Runs the probe up to `failure_threshold` times within this sweep;
    /// only a full streak of failures counts as unhealthy.
    async fn probe_with_threshold(&self, unit: &Unit, probe: &ProbeSpec) -> bool {
        let attempts = probe.failure_threshold.max(1);
        for _ in 0..attempts {
            if self.probe_once(unit, probe).await {
                return true;
            }
        }
        false
    }

    async fn probe_once(&self, unit: &Unit, probe: &ProbeSpec) -> bool {
        match &probe.kind {
            ProbeKind::Http { path, port } => {
                let url = format!("http://localhost:{port}{path}");
                match self.http.get(&url).timeout(probe.timeout()).send().await {
                    Ok(resp) => {
                        let code = resp.status().as_u16();
                        (200..400).contains(&code)
                    }
                    Err(_) => false,
                }
            }
            ProbeKind::Tcp { port } => {
                let addr = ("localhost", *port);
                tokio::time::timeout(probe.timeout(), tokio::net::TcpStream::connect(addr))
                    .await
                    .map(|r| r.is_ok())
                    .unwrap_or(false)
            }
            ProbeKind::StatusOnly => match self.runtime.get_container(&unit.name).await {
                Ok(record) => record.status.is_running(),
                Err(_) => false,
            },
        }
    }

    // ── restart handling ───────────────────────────────────────────────

    /// Asks the supervisor to run the unhealthy handler for one unit now.
    /// Used by the reconciler when a unit has been unhealthy too long.
    pub async fn restart_unit(&self, name: &str) {
        let mut units = self.units.write().await;
        if let Some(unit) = units.get_mut(name) {
            unit.status = UnitState::Unhealthy;
            if unit.unhealthy_since.is_none() {
                unit.unhealthy_since = Some(Utc::now());
            }
            self.handle_unhealthy(unit).await;
        }
    }

    async fn handle_unhealthy(&self, unit: &mut Unit) {
        let max_restarts = self.cfg.max_restarts;
        let cooldown = self.cfg.restart_cooldown();

        match unit.restart_policy {
            RestartPolicy::Always | RestartPolicy::OnFailure => {
                if unit.restart_count >= max_restarts {
                    error!(
                        name = %unit.name,
                        restarts = unit.restart_count,
                        max = max_restarts,
                        "container exceeded max restarts, marking as failed"
                    );
                    unit.status = UnitState::Failed;
                    return;
                }

                if let Some(last) = unit.last_restart_at {
                    let since = Utc::now().signed_duration_since(last);
                    if since < chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::zero()) {
                        debug!(name = %unit.name, "restart cooldown active");
                        return;
                    }
                }

                info!(
                    name = %unit.name,
                    attempt = unit.restart_count + 1,
                    "restarting unhealthy container"
                );
                unit.status = UnitState::Restarting;

                let _ = self.runtime.stop_container(&unit.container_id).await;
                tokio::time::sleep(RESTART_STOP_DELAY).await;

                if let Err(e) = self.runtime.start_container(&unit.container_id).await {
                    error!(name = %unit.name, error = %e, "failed to restart container");
                }

                unit.restart_count += 1;
                unit.last_restart_at = Some(Utc::now());
            }
            RestartPolicy::Never => {
                info!(name = %unit.name, "container unhealthy but restart policy is Never");
                unit.status = UnitState::Stopped;
            }
        }
    }
}

// =============================================================================
// Topological Sort
// =============================================================================

/// Dependency-first DFS over units pre-sorted by `(priority, name)`.
fn topo_sort(units: &HashMap<String, Unit>) -> Vec<String> {
    let mut order: Vec<&Unit> = units.values().collect();
    order.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.name.cmp(&b.name)));

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut result = Vec::with_capacity(order.len());

    fn visit<'a>(
        unit: &'a Unit,
        units: &'a HashMap<String, Unit>,
        marks: &mut HashMap<&'a str, Mark>,
        result: &mut Vec<String>,
    ) {
        match marks.get(unit.name.as_str()) {
            Some(Mark::Done) => return,
            Some(Mark::Visiting) => {
                // Cycles are not expected; break at this point rather than
                // recurse forever.
                warn!(name = %unit.name, "dependency cycle detected in boot sequence");
                return;
            }
            None => {}
        }
        marks.insert(&unit.name, Mark::Visiting);

        for dep in &unit.depends_on {
            if let Some(dep_unit) = units.get(dep) {
                visit(dep_unit, units, marks, result);
            }
        }

        marks.insert(&unit.name, Mark::Done);
        result.push(unit.name.clone());
    }

    for unit in order {
        visit(unit, units, &mut marks, &mut result);
    }

    result
}
