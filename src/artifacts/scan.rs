//! Directory scan handlers (`artifact_scan_all`, `artifact_scan_location`).
//!
//! A scan may run while downloads into the same location are in flight.
//! Before touching the filesystem it snapshots the destination paths of
//! every running `artifact_download_url` task (recomputed with
//! [`resolve_destination`], exactly as the download handler does) and skips
//! those paths entirely: a partial file is never inserted, refreshed, or
//! destroyed.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::tasks::progress::ProgressPublisher;
use crate::tasks::registry::{HandlerContext, HandlerOutcome, TaskHandler};
use crate::tasks::store::TaskStore;

use super::download::DownloadParams;
use super::store::{ArtifactStore, StorageLocation};
use super::resolve_destination;

/// Metadata payload for the scan operations
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScanParams {
    /// Required for `artifact_scan_location`; ignored by `artifact_scan_all`
    #[serde(default)]
    pub storage_location_id: Option<Uuid>,
    /// Destroy artifact rows whose file is gone from disk
    #[serde(default)]
    pub remove_orphaned: bool,
}

/// Per-location scan tally
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanSummary {
    pub added: u64,
    pub refreshed: u64,
    pub removed: u64,
    pub skipped_in_flight: u64,
}

impl ScanSummary {
    fn merge(&mut self, other: ScanSummary) {
        self.added += other.added;
        self.refreshed += other.refreshed;
        self.removed += other.removed;
        self.skipped_in_flight += other.skipped_in_flight;
    }
}

/// Destination paths of every running download, resolved the same way the
/// download handler resolves them.
pub async fn snapshot_in_flight_downloads(
    tasks: &TaskStore,
    artifacts: &ArtifactStore,
) -> EngineResult<HashSet<PathBuf>> {
    let mut in_flight = HashSet::new();
    for task in tasks.running_for_operation("artifact_download_url").await? {
        let params: DownloadParams = match serde_json::from_value(task.metadata.clone()) {
            Ok(params) => params,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "unparseable running download metadata");
                continue;
            }
        };
        let Some(location) = artifacts.get_location(params.storage_location_id).await? else {
            continue;
        };
        match resolve_destination(&location.path, &params.url, params.filename.as_deref()) {
            Ok(dest) => {
                in_flight.insert(dest);
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "running download has unresolvable destination");
            }
        }
    }
    Ok(in_flight)
}

/// Scan one location: add unknown files, refresh known ones, optionally
/// destroy orphaned rows, then recount the location stats.
pub async fn scan_location(
    artifacts: &ArtifactStore,
    config: &EngineConfig,
    location: &StorageLocation,
    in_flight: &HashSet<PathBuf>,
    remove_orphaned: bool,
) -> EngineResult<ScanSummary> {
    let allowed = config.allowed_extensions(&location.location_type);
    let mut summary = ScanSummary::default();

    let mut on_disk: HashMap<PathBuf, u64> = HashMap::new();
    let mut entries = tokio::fs::read_dir(&location.path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let path = entry.path();
        let matches_type = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .is_some_and(|e| allowed.iter().any(|a| a.eq_ignore_ascii_case(&e)));
        if matches_type {
            on_disk.insert(path, metadata.len());
        }
    }

    for (path, size) in &on_disk {
        if in_flight.contains(path) {
            debug!(path = %path.display(), "skipping in-flight download");
            summary.skipped_in_flight += 1;
            continue;
        }
        let path_str = path.to_string_lossy();
        match artifacts.find_by_path(&path_str).await? {
            Some(artifact) => {
                artifacts.refresh_verified(artifact.id, *size as i64).await?;
                summary.refreshed += 1;
            }
            None => {
                let filename = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default();
                artifacts
                    .insert_scanned(location.id, &path_str, filename, *size as i64)
                    .await?;
                summary.added += 1;
            }
        }
    }

    if remove_orphaned {
        for (artifact_id, path_str) in artifacts.paths_for_location(location.id).await? {
            let path = PathBuf::from(&path_str);
            if !on_disk.contains_key(&path) && !in_flight.contains(&path) {
                artifacts.delete(artifact_id).await?;
                summary.removed += 1;
            }
        }
    }

    artifacts.recount_location_stats(location.id).await?;

    info!(
        location = %location.name,
        added = summary.added,
        refreshed = summary.refreshed,
        removed = summary.removed,
        skipped = summary.skipped_in_flight,
        "storage location scanned"
    );
    Ok(summary)
}

/// Handler backing both scan operations. `artifact_scan_location` scans the
/// one location named in the metadata; `artifact_scan_all` walks every
/// enabled location.
pub struct ScanHandler;

#[async_trait]
impl TaskHandler for ScanHandler {
    async fn handle(
        &self,
        ctx: HandlerContext,
        progress: ProgressPublisher,
    ) -> EngineResult<HandlerOutcome> {
        let params: ScanParams = if ctx.task.metadata.is_null() {
            ScanParams::default()
        } else {
            ctx.params()?
        };

        let artifacts = ArtifactStore::new(ctx.system.pool().clone());
        let tasks = TaskStore::new(ctx.system.pool().clone());

        let locations = if ctx.task.operation == "artifact_scan_location" {
            let id = params.storage_location_id.ok_or_else(|| {
                EngineError::Validation(
                    "artifact_scan_location requires storage_location_id".to_string(),
                )
            })?;
            let location = artifacts.get_location(id).await?.ok_or_else(|| {
                EngineError::Precondition(format!("storage location {id} does not exist"))
            })?;
            vec![location]
        } else {
            artifacts.list_enabled_locations().await?
        };

        let in_flight = snapshot_in_flight_downloads(&tasks, &artifacts).await?;

        let mut total = ScanSummary::default();
        let location_count = locations.len();
        for (index, location) in locations.iter().enumerate() {
            if !location.enabled {
                return Err(EngineError::Precondition(format!(
                    "storage location '{}' is disabled",
                    location.name
                )));
            }
            let summary = scan_location(
                &artifacts,
                ctx.system.config(),
                location,
                &in_flight,
                params.remove_orphaned,
            )
            .await?;
            total.merge(summary);
            progress.percent((((index + 1) * 100 / location_count.max(1)) as i16).min(99));
        }

        Ok(HandlerOutcome::with_message(format!(
            "scanned {location_count} location(s): {} added, {} refreshed, {} removed",
            total.added, total.refreshed, total.removed
        ))
        .with_extra(json!({
            "locations": location_count,
            "added": total.added,
            "refreshed": total.refreshed,
            "removed": total.removed,
            "skipped_in_flight": total.skipped_in_flight,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::types::NewTask;
    use sqlx::PgPool;

    async fn location_with_dir(
        artifacts: &ArtifactStore,
        dir: &tempfile::TempDir,
    ) -> StorageLocation {
        artifacts
            .create_location("isos", &dir.path().to_string_lossy(), "iso", true)
            .await
            .unwrap()
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_scan_adds_matching_files_only(pool: PgPool) {
        let artifacts = ArtifactStore::new(pool);
        let config = EngineConfig::default();
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.iso"), b"aaaa").await.unwrap();
        tokio::fs::write(dir.path().join("b.ISO"), b"bbbbbb").await.unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), b"x").await.unwrap();
        let location = location_with_dir(&artifacts, &dir).await;

        let summary = scan_location(&artifacts, &config, &location, &HashSet::new(), false)
            .await
            .unwrap();

        assert_eq!(summary.added, 2);
        assert_eq!(summary.refreshed, 0);
        let a = artifacts
            .find_by_path(&dir.path().join("a.iso").to_string_lossy())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.size, 4);
        assert!(a.checksum.is_none());
        assert!(a.discovered);

        // Stats come from an aggregate recount
        let location = artifacts.get_location(location.id).await.unwrap().unwrap();
        assert_eq!(location.file_count, 2);
        assert_eq!(location.total_size, 10);
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_rescan_refreshes_existing(pool: PgPool) {
        let artifacts = ArtifactStore::new(pool);
        let config = EngineConfig::default();
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.iso"), b"aaaa").await.unwrap();
        let location = location_with_dir(&artifacts, &dir).await;

        scan_location(&artifacts, &config, &location, &HashSet::new(), false)
            .await
            .unwrap();
        let second = scan_location(&artifacts, &config, &location, &HashSet::new(), false)
            .await
            .unwrap();

        assert_eq!(second.added, 0);
        assert_eq!(second.refreshed, 1);
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_remove_orphaned_rows(pool: PgPool) {
        let artifacts = ArtifactStore::new(pool);
        let config = EngineConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let location = location_with_dir(&artifacts, &dir).await;

        let ghost_path = dir.path().join("gone.iso");
        artifacts
            .insert_scanned(location.id, &ghost_path.to_string_lossy(), "gone.iso", 50)
            .await
            .unwrap();

        // Without the flag the row survives
        let kept = scan_location(&artifacts, &config, &location, &HashSet::new(), false)
            .await
            .unwrap();
        assert_eq!(kept.removed, 0);

        let removed = scan_location(&artifacts, &config, &location, &HashSet::new(), true)
            .await
            .unwrap();
        assert_eq!(removed.removed, 1);
        assert!(artifacts
            .find_by_path(&ghost_path.to_string_lossy())
            .await
            .unwrap()
            .is_none());
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_in_flight_path_is_untouchable(pool: PgPool) {
        let artifacts = ArtifactStore::new(pool);
        let config = EngineConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let location = location_with_dir(&artifacts, &dir).await;

        // A partially written download sits on disk
        let partial = dir.path().join("partial.iso");
        tokio::fs::write(&partial, b"half").await.unwrap();
        let in_flight = HashSet::from([partial.clone()]);

        let summary = scan_location(&artifacts, &config, &location, &in_flight, true)
            .await
            .unwrap();

        // Not inserted as a new artifact
        assert_eq!(summary.added, 0);
        assert_eq!(summary.skipped_in_flight, 1);
        assert!(artifacts
            .find_by_path(&partial.to_string_lossy())
            .await
            .unwrap()
            .is_none());
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_in_flight_row_survives_orphan_removal(pool: PgPool) {
        let artifacts = ArtifactStore::new(pool);
        let config = EngineConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let location = location_with_dir(&artifacts, &dir).await;

        // Pre-existing row whose file is being re-downloaded: nothing on
        // disk yet, but the path is in flight, so the row must survive.
        let redownload = dir.path().join("redownload.iso");
        artifacts
            .insert_scanned(
                location.id,
                &redownload.to_string_lossy(),
                "redownload.iso",
                100,
            )
            .await
            .unwrap();
        let in_flight = HashSet::from([redownload.clone()]);

        let summary = scan_location(&artifacts, &config, &location, &in_flight, true)
            .await
            .unwrap();

        assert_eq!(summary.removed, 0);
        assert!(artifacts
            .find_by_path(&redownload.to_string_lossy())
            .await
            .unwrap()
            .is_some());
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_snapshot_resolves_running_downloads(pool: PgPool) {
        let artifacts = ArtifactStore::new(pool.clone());
        let tasks = TaskStore::new(pool);
        let dir = tempfile::tempdir().unwrap();
        let location = location_with_dir(&artifacts, &dir).await;

        tasks
            .create(
                NewTask::new("artifact_download_url", "system").with_metadata(json!({
                    "url": "https://mirror.example.com/media/r151048.iso",
                    "storage_location_id": location.id,
                })),
            )
            .await
            .unwrap();
        // Pending downloads are not in flight yet
        assert!(snapshot_in_flight_downloads(&tasks, &artifacts)
            .await
            .unwrap()
            .is_empty());

        tasks.try_claim_next(&[]).await.unwrap().unwrap();
        let in_flight = snapshot_in_flight_downloads(&tasks, &artifacts)
            .await
            .unwrap();
        assert_eq!(in_flight.len(), 1);
        assert!(in_flight.contains(&dir.path().join("r151048.iso")));
    }

    #[test]
    fn test_scan_params_defaults() {
        let params: ScanParams = serde_json::from_value(json!({})).unwrap();
        assert!(params.storage_location_id.is_none());
        assert!(!params.remove_orphaned);
    }
}
