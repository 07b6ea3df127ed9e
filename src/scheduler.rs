//! Background health and backup tasks.
//!
//! 中文: 后台健康检查与备份任务。两个任务互不阻塞，
//! 通过 `watch` 通道统一停止。

use crate::backup::BackupManager;
use crate::certificate::CertificateRegistry;
use crate::cluster::ClusterManager;
use crate::config::SchedulerConfig;
use crate::device::DeviceRegistry;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Handles to the running tasks.
#[derive(Debug)]
pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// What the health task touches.
#[derive(Clone, Debug)]
pub struct HealthTargets {
    pub devices: Arc<DeviceRegistry>,
    pub clusters: Arc<ClusterManager>,
    pub certificates: Arc<CertificateRegistry>,
}

impl Scheduler {
    pub fn start(config: &SchedulerConfig, health: HealthTargets, backups: Arc<BackupManager>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(health_loop(config.health_interval(), health, shutdown.subscribe())),
            tokio::spawn(backup_loop(config.backup_interval(), backups, shutdown.subscribe())),
        ];
        tracing::info!(
            health_interval_secs = config.health_interval_secs,
            backup_interval_secs = config.backup_interval_secs,
            "schedulers started"
        );
        Self { shutdown, tasks }
    }

    /// Signals both tasks and waits for them. A tick in progress finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "scheduler task ended abnormally");
            }
        }
        tracing::info!("schedulers stopped");
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn health_loop(period: Duration, targets: HealthTargets, mut shutdown: watch::Receiver<bool>) {
    let mut interval = ticker(period);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => run_health_pass(&targets).await,
        }
    }
}

/// One health pass: probe devices, fold results into clusters, expire idle
/// sessions and lapsed certificates.
pub async fn run_health_pass(targets: &HealthTargets) {
    let outcomes = targets.devices.probe_all().await;
    for outcome in &outcomes {
        if let Err(e) = targets
            .clusters
            .apply_device_status(&outcome.device_id, outcome.status)
        {
            tracing::warn!(device_id = %outcome.device_id, error = %e, "cluster health update failed");
        }
    }

    let now = Utc::now();
    if let Err(e) = targets.devices.expire_sessions(now).await {
        tracing::warn!(error = %e, "session expiry failed");
    }
    match targets.certificates.refresh_certificate_expiry(now) {
        Ok(expired) if !expired.is_empty() => {
            tracing::info!(count = expired.len(), "certificates expired")
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "certificate expiry refresh failed"),
    }
    tracing::debug!(probed = outcomes.len(), "health pass finished");
}

async fn backup_loop(period: Duration, backups: Arc<BackupManager>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = ticker(period);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => run_backup_pass(&backups).await,
        }
    }
}

/// One backup pass: create due backups, then prune expired ones.
pub async fn run_backup_pass(backups: &BackupManager) {
    let now = Utc::now();
    let created = backups.run_due(now).await;
    if let Err(e) = backups.prune_expired(now).await {
        tracing::warn!(error = %e, "backup pruning failed");
    }
    tracing::debug!(created = created.len(), "backup pass finished");
}
