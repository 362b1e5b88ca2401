//! # Periodic Drivers
//!
//! Producers into the task store: zone discovery enqueues a background
//! `discover` task on an interval, and retention cleanup destroys terminal
//! rows past the configured window. Both stop when the engine's shutdown
//! token fires.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info};

use crate::error::EngineResult;
use crate::tasks::scheduler::EngineHandle;
use crate::tasks::store::TaskStore;
use crate::tasks::types::{NewTask, TaskFilter, TaskPriority, TaskStatus};

/// Delay before the first discovery enqueue, so the recovery sweep and the
/// scheduler loop are up first.
const STARTUP_GRACE: Duration = Duration::from_secs(5);

/// Enqueue one `discover` task unless a pending one is already queued.
/// Returns whether an enqueue happened.
pub async fn enqueue_discovery(handle: &EngineHandle) -> EngineResult<bool> {
    let pending = handle
        .store()
        .list(
            &TaskFilter {
                status: Some(TaskStatus::Pending),
                operation: Some("discover".to_string()),
                limit: Some(1),
                ..Default::default()
            },
            1,
        )
        .await?;
    if !pending.is_empty() {
        debug!("discovery already pending, skipping enqueue");
        return Ok(false);
    }

    let task = handle
        .enqueue(
            NewTask::new("discover", "system")
                .with_priority(TaskPriority::Background)
                .with_created_by("scheduler"),
        )
        .await?;
    debug!(task_id = %task.id, "discovery task enqueued");
    Ok(true)
}

/// Destroy terminal tasks older than the retention window. Returns the
/// number of rows deleted.
pub async fn purge_expired_tasks(store: &TaskStore, retention_days: u32) -> EngineResult<u64> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let deleted = store.destroy_terminal_older_than(cutoff).await?;
    if deleted > 0 {
        info!(
            deleted = deleted,
            retention_days = retention_days,
            "expired tasks destroyed"
        );
    }
    Ok(deleted)
}

/// Drive periodic zone discovery until shutdown
pub async fn run_discovery_driver(handle: EngineHandle) {
    let config = handle.config();
    if !config.auto_discovery {
        info!("auto discovery disabled");
        return;
    }
    let interval = Duration::from_secs(config.discovery_interval_seconds.max(1));
    let shutdown = handle.shutdown_token();

    tokio::select! {
        _ = shutdown.cancelled() => return,
        _ = tokio::time::sleep(STARTUP_GRACE) => {}
    }

    info!(interval_secs = interval.as_secs(), "discovery driver started");
    loop {
        if let Err(e) = enqueue_discovery(&handle).await {
            error!(error = %e, "failed to enqueue discovery task");
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!("discovery driver stopped");
}

/// Drive retention cleanup until shutdown
pub async fn run_retention_driver(handle: EngineHandle) {
    let retention_days = handle.config().retention.tasks_days;
    let interval =
        Duration::from_secs(handle.config().retention.check_interval_hours.max(1) * 3600);
    let shutdown = handle.shutdown_token();

    info!(
        retention_days = retention_days,
        interval_secs = interval.as_secs(),
        "retention driver started"
    );
    loop {
        if let Err(e) = purge_expired_tasks(handle.store(), retention_days).await {
            error!(error = %e, "task retention cleanup failed");
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!("retention driver stopped");
}
