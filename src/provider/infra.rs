//! Infrastructure container watchdog.
//!
//! The registry and other critical containers run on the device outside
//! pod management. This sub-loop polls their health URLs; three consecutive
//! failures trigger a stop-then-start through the runtime port, guarded by
//! a 60 s per-container restart cooldown.

use chrono::Utc;
use tracing::{error, info, warn};

use crate::constants::{
    INFRA_CHECK_INTERVAL, INFRA_HEALTH_THRESHOLD, INFRA_HEALTH_TIMEOUT, INFRA_RESTART_COOLDOWN,
    INFRA_STOP_SETTLE,
};
use crate::error::{Error, Result};

use super::Provider;

impl Provider {
    /// Runs the infrastructure watchdog until shutdown fires.
    pub async fn run_infra_watchdog(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        if self.cfg.infra.is_empty() {
            return;
        }

        let mut ticker = tokio::time::interval(INFRA_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        info!(containers = self.cfg.infra.len(), "infrastructure watchdog started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_infra_health().await,
                _ = shutdown.changed() => {
                    info!("infrastructure watchdog shutting down");
                    return;
                }
            }
        }
    }

    /// One pass over every configured infrastructure container.
    pub async fn check_infra_health(&self) {
        for ic in &self.cfg.infra {
            let healthy = match self
                .http()
                .get(&ic.health_url)
                .timeout(INFRA_HEALTH_TIMEOUT)
                .send()
                .await
            {
                Ok(resp) => resp.status() == reqwest::StatusCode::OK,
                Err(_) => false,
            };

            if healthy {
                let mut state = self.infra.lock().unwrap();
                if state.failures.get(&ic.name).copied().unwrap_or(0) > 0 {
                    info!(container = %ic.name, "infrastructure container recovered");
                }
                state.failures.insert(ic.name.clone(), 0);
                continue;
            }

            let failures = {
                let mut state = self.infra.lock().unwrap();
                let failures = state.failures.entry(ic.name.clone()).or_insert(0);
                *failures += 1;
                *failures
            };
            warn!(
                container = %ic.name,
                failures,
                threshold = INFRA_HEALTH_THRESHOLD,
                "infrastructure container health check failed"
            );

            if failures < INFRA_HEALTH_THRESHOLD {
                continue;
            }

            let in_cooldown = {
                let state = self.infra.lock().unwrap();
                state.last_restart.get(&ic.name).is_some_and(|last| {
                    Utc::now().signed_duration_since(*last)
                        < chrono::Duration::from_std(INFRA_RESTART_COOLDOWN).unwrap_or_else(|_| chrono::Duration::zero())
                })
            };
            if in_cooldown {
                warn!(container = %ic.name, "infrastructure restart skipped (cooldown)");
                continue;
            }

            warn!(
                container = %ic.name,
                consecutive_failures = failures,
                "restarting unresponsive infrastructure container"
            );

            match self.restart_infra_container(&ic.name).await {
                Ok(()) => {
                    let mut state = self.infra.lock().unwrap();
                    state.last_restart.insert(ic.name.clone(), Utc::now());
                    state.failures.insert(ic.name.clone(), 0);
                    info!(container = %ic.name, "infrastructure container restarted");
                }
                Err(e) => {
                    error!(container = %ic.name, error = %e, "failed to restart infrastructure container");
                }
            }
        }
    }

    /// Stops (if running), settles, and starts a container by name.
    async fn restart_infra_container(&self, name: &str) -> Result<()> {
        let record = self.runtime().get_container(name).await.map_err(|e| {
            if e.is_not_found() {
                Error::NotFound {
                    what: format!("infrastructure container {name}"),
                }
            } else {
                e
            }
        })?;

        if record.status.is_running() {
            self.runtime().stop_container(&record.id).await?;
            tokio::time::sleep(INFRA_STOP_SETTLE).await;
        }

        self.runtime().start_container(&record.id).await
    }
}
