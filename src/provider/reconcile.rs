//! The standalone reconciliation loop.
//!
//! Every tick (default 10 s) the loop:
//!
//! 1. re-reads the local manifest file, if one is configured, and folds
//!    added/changed/removed pods into the tracker (create / replace /
//!    delete);
//! 2. diffs tracked desired state against the device's actual container
//!    set: pods with missing containers are recreated, containers nobody
//!    wants are removed;
//! 3. asks the supervisor to restart units that have been unhealthy for
//!    longer than a watchdog interval.
//!
//! Pods with an in-flight create/update are skipped entirely, so the loop
//! never races a change already in progress. Containers named in the
//! `infra` config section are never treated as orphans; they run on the
//! device but are not pod-managed.

use std::collections::HashSet;

use tracing::{debug, error, info, warn};

use crate::pod::Pod;

use super::Provider;

impl Provider {
    /// Runs the reconciliation loop until shutdown fires.
    pub async fn run_reconciler(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.cfg.reconcile_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        info!(interval = ?self.cfg.reconcile_interval(), "reconciler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        error!(error = %e, "reconciliation error");
                    }
                }
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    return;
                }
            }
        }
    }

    /// One reconciliation pass.
    pub async fn reconcile(&self) -> crate::error::Result<()> {
        if let Some(path) = self.cfg.manifest_path.clone() {
            match Pod::load_manifest(&path) {
                Ok(pods) => self.sync_manifest(pods).await,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to load manifest"),
            }
        }

        self.converge_runtime().await?;
        self.restart_stuck_units().await;
        Ok(())
    }

    /// Folds the manifest file's pods into the tracker.
    async fn sync_manifest(&self, desired: Vec<Pod>) {
        let mut to_create = Vec::new();
        let mut to_update = Vec::new();
        let mut to_delete = Vec::new();

        {
            let tracker = self.tracker.lock().unwrap();
            let desired_keys: HashSet<String> = desired.iter().map(|p| p.key()).collect();

            for pod in desired {
                match tracker.get(&pod.key()) {
                    None => to_create.push(pod),
                    Some(tracked) if tracked.in_flight => {
                        debug!(pod = %pod.key(), "skipping pod with change in flight")
                    }
                    Some(tracked) if tracked.pod != pod => to_update.push(pod),
                    Some(_) => {}
                }
            }

            for (key, tracked) in tracker.iter() {
                if !desired_keys.contains(key) && !tracked.in_flight {
                    to_delete.push(tracked.pod.clone());
                }
            }
        }

        for pod in to_create {
            if let Err(e) = self.create_pod(&pod).await {
                warn!(pod = %pod.key(), error = %e, "manifest create failed");
            }
        }
        for pod in to_update {
            if let Err(e) = self.update_pod(&pod).await {
                warn!(pod = %pod.key(), error = %e, "manifest update failed");
            }
        }
        for pod in to_delete {
            if let Err(e) = self.delete_pod(&pod).await {
                warn!(pod = %pod.key(), error = %e, "manifest delete failed");
            }
        }
    }

    /// Diffs tracked pods against the actual container set.
    async fn converge_runtime(&self) -> crate::error::Result<()> {
        let actual = self.runtime().list_containers().await?;
        let actual_names: HashSet<&str> = actual.iter().map(|c| c.name.as_str()).collect();

        // Desired side: every container name any tracked pod owns. In-flight
        // pods stay out of the recreate pass below, but their names must
        // still count as desired or the orphan reap would delete containers
        // a create in progress just made.
        let (pods, desired_names) = {
            let tracker = self.tracker.lock().unwrap();
            let names: HashSet<String> = tracker
                .values()
                .flat_map(|t| Self::expected_container_names(&t.pod))
                .collect();
            let pods: Vec<Pod> = tracker
                .values()
                .filter(|t| !t.in_flight)
                .map(|t| t.pod.clone())
                .collect();
            (pods, names)
        };

        // Recreate pods with missing containers. Containers are immutable,
        // so partial pods are replaced whole.
        for pod in pods {
            let missing = Self::expected_container_names(&pod)
                .iter()
                .any(|name| !actual_names.contains(name.as_str()));
            if missing {
                warn!(pod = %pod.key(), "drift: pod containers missing, recreating");
                if let Err(e) = self.update_pod(&pod).await {
                    warn!(pod = %pod.key(), error = %e, "drift recreate failed");
                }
            }
        }

        // Remove orphans nobody desires. Infrastructure containers are
        // exempt.
        let infra_names: HashSet<&str> =
            self.cfg.infra.iter().map(|ic| ic.name.as_str()).collect();
        for container in &actual {
            if desired_names.contains(&container.name) || infra_names.contains(container.name.as_str())
            {
                continue;
            }
            warn!(name = %container.name, "removing orphaned container");
            if container.status.is_running() {
                if let Err(e) = self.runtime().stop_container(&container.id).await {
                    warn!(name = %container.name, error = %e, "error stopping orphan");
                }
            }
            if let Err(e) = self.runtime().remove_container(&container.id).await {
                warn!(name = %container.name, error = %e, "error removing orphan");
            }
        }

        Ok(())
    }

    /// Restarts units that have been unhealthy for longer than one
    /// watchdog interval without recovering.
    async fn restart_stuck_units(&self) {
        let threshold = self.cfg.supervisor.watchdog_interval();
        let statuses = self.supervisor().unit_statuses().await;

        for (name, status) in statuses {
            let Some(since) = status.unhealthy_since else {
                continue;
            };
            if status.healthy {
                continue;
            }
            let stuck = chrono::Utc::now().signed_duration_since(since)
                > chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero());
            if stuck {
                debug!(name = %name, "requesting restart of stuck unit");
                self.supervisor().restart_unit(&name).await;
            }
        }
    }
}
