//! Streaming artifact download handler (`artifact_download_url`).
//!
//! The HTTP body is streamed straight into the destination file inside the
//! storage location; the digest is computed afterwards by re-reading the
//! file, keeping the network phase at full write throughput. The
//! destination is pre-created with privileged `touch`/`chmod 0666` so the
//! service user can stream into a root-owned location without a later
//! chown.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::command::{self, CommandSpec};
use crate::error::{EngineError, EngineResult};
use crate::tasks::progress::ProgressPublisher;
use crate::tasks::registry::{HandlerContext, HandlerOutcome, TaskHandler};

use super::store::ArtifactStore;
use super::{hash_file, resolve_destination, ChecksumAlgorithm};

/// Metadata payload for `artifact_download_url`. The scan handler parses
/// running download tasks with this same struct to recompute their
/// destination paths.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadParams {
    pub url: String,
    pub storage_location_id: Uuid,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub expected_checksum: Option<String>,
    #[serde(default)]
    pub algorithm: ChecksumAlgorithm,
    #[serde(default)]
    pub overwrite: bool,
}

pub struct DownloadHandler;

#[async_trait]
impl TaskHandler for DownloadHandler {
    async fn handle(
        &self,
        ctx: HandlerContext,
        progress: ProgressPublisher,
    ) -> EngineResult<HandlerOutcome> {
        let params: DownloadParams = ctx.params()?;

        let artifacts = ArtifactStore::new(ctx.system.pool().clone());
        let location = artifacts
            .get_location(params.storage_location_id)
            .await?
            .ok_or_else(|| {
                EngineError::Precondition(format!(
                    "storage location {} does not exist",
                    params.storage_location_id
                ))
            })?;
        if !location.enabled {
            return Err(EngineError::Precondition(format!(
                "storage location '{}' is disabled",
                location.name
            )));
        }

        let dest = resolve_destination(&location.path, &params.url, params.filename.as_deref())?;
        let filename = dest
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        if !params.overwrite && tokio::fs::try_exists(&dest).await? {
            return Err(EngineError::Precondition(format!(
                "destination {} already exists (overwrite not set)",
                dest.display()
            )));
        }

        precreate_destination(&ctx, &dest).await?;

        let size = match stream_to_file(&ctx, &params.url, &dest, &progress).await {
            Ok(size) => size,
            Err(e) => {
                remove_partial(&dest).await;
                return Err(e);
            }
        };

        progress.update(
            99,
            json!({"phase": "verifying", "bytes": size, "total": size}),
        );
        let digest = hash_file(&dest, params.algorithm).await?;

        if let Some(expected) = &params.expected_checksum {
            if !expected.eq_ignore_ascii_case(&digest) {
                remove_partial(&dest).await;
                return Err(EngineError::Validation(format!(
                    "checksum verification failed for {filename}: expected {expected}, got {digest}"
                )));
            }
        }

        let artifact = match artifacts
            .record_download(
                location.id,
                &dest.to_string_lossy(),
                &filename,
                size as i64,
                &digest,
                params.algorithm,
                &params.url,
            )
            .await
        {
            Ok(artifact) => artifact,
            Err(e) => {
                // The row is the source of truth; an untracked file must not
                // linger for a later scan to misread.
                remove_partial(&dest).await;
                return Err(e);
            }
        };

        info!(
            artifact_id = %artifact.id,
            filename = %filename,
            size = size,
            location = %location.name,
            "artifact downloaded"
        );

        Ok(HandlerOutcome::with_message(format!(
            "downloaded {filename} ({size} bytes) to {}",
            location.name
        ))
        .with_extra(json!({
            "artifact_id": artifact.id,
            "size": size,
            "checksum": digest,
            "algorithm": params.algorithm.as_str(),
        })))
    }
}

/// Privileged pre-create: `touch` then mode 0666 so the unprivileged
/// service user can open the file for writing.
async fn precreate_destination(ctx: &HandlerContext, dest: &Path) -> EngineResult<()> {
    let dest_str = dest.to_string_lossy().to_string();
    for argv in [
        vec!["pfexec".to_string(), "touch".to_string(), dest_str.clone()],
        vec![
            "pfexec".to_string(),
            "chmod".to_string(),
            "0666".to_string(),
            dest_str.clone(),
        ],
    ] {
        command::run_with_cancel(
            CommandSpec::new(argv).with_timeout(Duration::from_secs(30)),
            &ctx.cancel,
        )
        .await
        .into_result()?;
    }
    Ok(())
}

/// Stream the response body into the destination, publishing byte counts,
/// speed, and ETA on the configured cadence. Returns total bytes written.
async fn stream_to_file(
    ctx: &HandlerContext,
    url: &str,
    dest: &Path,
    progress: &ProgressPublisher,
) -> EngineResult<u64> {
    let interval = Duration::from_secs(
        ctx.system
            .config()
            .download
            .progress_update_seconds
            .max(1),
    );

    let response = ctx.system.http().get(url).send().await?.error_for_status()?;
    let total = response.content_length();

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(dest)
        .await?;

    let mut stream = response.bytes_stream();
    let started = Instant::now();
    let mut last_emit = Instant::now();
    let mut downloaded: u64 = 0;

    while let Some(chunk) = stream.next().await {
        if ctx.cancel.is_cancelled() {
            return Err(EngineError::Timeout(format!(
                "download of {url} cancelled after {downloaded} bytes"
            )));
        }
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;

        if last_emit.elapsed() >= interval {
            last_emit = Instant::now();
            let elapsed = started.elapsed().as_secs_f64().max(0.001);
            let speed = downloaded as f64 / elapsed;
            let percent = total
                .filter(|t| *t > 0)
                .map(|t| ((downloaded.saturating_mul(100) / t) as i16).min(99));
            let eta_seconds = total
                .filter(|t| *t > downloaded && speed > 0.0)
                .map(|t| ((t - downloaded) as f64 / speed) as u64);

            debug!(url = %url, bytes = downloaded, "download progress");
            progress.publish(crate::tasks::progress::ProgressUpdate {
                percent,
                info: Some(json!({
                    "bytes": downloaded,
                    "total": total,
                    "speed_bps": speed as u64,
                    "eta_seconds": eta_seconds,
                })),
            });
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(downloaded)
}

async fn remove_partial(dest: &Path) {
    if let Err(e) = tokio::fs::remove_file(dest).await {
        warn!(path = %dest.display(), error = %e, "failed to remove partial download");
    }
}
