//! # Progress Channel
//!
//! Lets a running handler publish percent/info snapshots without blocking.
//! Publishing is fire-and-forget (`try_send`); a per-task writer drains the
//! channel and coalesces to at most one database write per interval. The
//! last pending update is always flushed when the handler finishes, and
//! out-of-order percents older than the last persisted value are dropped.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::store::TaskStore;

/// Channel depth per running task; overflow drops updates, which is fine
/// because newer snapshots supersede older ones.
const PROGRESS_CHANNEL_DEPTH: usize = 32;

/// One progress snapshot from a handler
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub percent: Option<i16>,
    pub info: Option<Value>,
}

/// Handler-side publishing end. Cheap to clone; dropping all clones ends
/// the writer after a final flush.
#[derive(Debug, Clone)]
pub struct ProgressPublisher {
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ProgressPublisher {
    pub fn channel() -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_DEPTH);
        (Self { tx }, rx)
    }

    /// Publish a snapshot. Never blocks and never fails the handler.
    pub fn publish(&self, update: ProgressUpdate) {
        if let Err(e) = self.tx.try_send(update) {
            debug!(error = %e, "dropped progress update");
        }
    }

    pub fn percent(&self, percent: i16) {
        self.publish(ProgressUpdate {
            percent: Some(percent),
            info: None,
        });
    }

    pub fn update(&self, percent: i16, info: Value) {
        self.publish(ProgressUpdate {
            percent: Some(percent),
            info: Some(info),
        });
    }
}

/// Merge an incoming snapshot into the pending one. Percents below
/// `last_persisted` are stale and dropped; info keeps the newest value.
pub(crate) fn coalesce(
    pending: &mut Option<ProgressUpdate>,
    update: ProgressUpdate,
    last_persisted: i16,
) {
    let percent = update.percent.filter(|p| *p >= last_persisted);
    let slot = pending.get_or_insert_with(ProgressUpdate::default);
    if let Some(percent) = percent {
        slot.percent = Some(slot.percent.map_or(percent, |existing| existing.max(percent)));
    }
    if update.info.is_some() {
        slot.info = update.info;
    }
}

/// Drain a task's progress channel, writing at most one row update per
/// `interval`. Runs until every publisher clone is dropped.
pub async fn run_progress_writer(
    store: TaskStore,
    task_id: Uuid,
    mut rx: mpsc::Receiver<ProgressUpdate>,
    interval: Duration,
) {
    let mut pending: Option<ProgressUpdate> = None;
    let mut last_written: Option<Instant> = None;
    let mut last_persisted: i16 = 0;

    loop {
        let flush_due = pending.is_some() && last_written.is_some();
        let flush_in = match last_written {
            Some(at) if flush_due => interval.saturating_sub(at.elapsed()),
            // Branch below is disabled in this case; any finite value works.
            _ => interval,
        };

        tokio::select! {
            update = rx.recv() => {
                match update {
                    Some(update) => {
                        coalesce(&mut pending, update, last_persisted);
                        let due = last_written.is_none_or(|at| at.elapsed() >= interval);
                        if due {
                            flush(&store, task_id, &mut pending, &mut last_written, &mut last_persisted).await;
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::time::sleep(flush_in), if flush_due => {
                flush(&store, task_id, &mut pending, &mut last_written, &mut last_persisted).await;
            }
        }
    }

    // Final snapshot always lands.
    flush(&store, task_id, &mut pending, &mut last_written, &mut last_persisted).await;
}

async fn flush(
    store: &TaskStore,
    task_id: Uuid,
    pending: &mut Option<ProgressUpdate>,
    last_written: &mut Option<Instant>,
    last_persisted: &mut i16,
) {
    let Some(update) = pending.take() else {
        return;
    };

    match store
        .record_progress(task_id, update.percent, update.info.as_ref())
        .await
    {
        Ok(_) => {
            if let Some(percent) = update.percent {
                *last_persisted = (*last_persisted).max(percent);
            }
        }
        Err(e) => {
            // Progress is advisory; losing a write never fails the handler.
            debug!(task_id = %task_id, error = %e, "progress write failed");
        }
    }
    *last_written = Some(Instant::now());
}
