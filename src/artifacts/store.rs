//! Storage location and artifact table access. Download inserts bump the
//! location counters incrementally; scans repair them with an aggregate
//! recount.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::error::EngineResult;

use super::ChecksumAlgorithm;

/// A configured directory artifacts live under
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StorageLocation {
    pub id: Uuid,
    pub name: String,
    pub path: String,
    pub location_type: String,
    pub enabled: bool,
    pub file_count: i64,
    pub total_size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A tracked file inside a storage location
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Artifact {
    pub id: Uuid,
    pub storage_location_id: Uuid,
    pub path: String,
    pub filename: String,
    pub size: i64,
    pub checksum: Option<String>,
    pub checksum_algorithm: Option<String>,
    pub source_url: Option<String>,
    pub discovered: bool,
    pub last_verified: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    pool: PgPool,
}

impl ArtifactStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_location(&self, id: Uuid) -> EngineResult<Option<StorageLocation>> {
        let location =
            sqlx::query_as::<_, StorageLocation>("SELECT * FROM storage_locations WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(location)
    }

    pub async fn list_enabled_locations(&self) -> EngineResult<Vec<StorageLocation>> {
        let locations = sqlx::query_as::<_, StorageLocation>(
            "SELECT * FROM storage_locations WHERE enabled ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(locations)
    }

    pub async fn create_location(
        &self,
        name: &str,
        path: &str,
        location_type: &str,
        enabled: bool,
    ) -> EngineResult<StorageLocation> {
        let location = sqlx::query_as::<_, StorageLocation>(
            "INSERT INTO storage_locations (id, name, path, location_type, enabled) \
             VALUES ($1, $2, $3, $4, $5) RETURNING *",
        )
        .bind(Uuid::now_v7())
        .bind(name)
        .bind(path)
        .bind(location_type)
        .bind(enabled)
        .fetch_one(&self.pool)
        .await?;
        Ok(location)
    }

    /// Record a completed download: the artifact row plus the location's
    /// incremental counters, in one transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_download(
        &self,
        location_id: Uuid,
        path: &str,
        filename: &str,
        size: i64,
        checksum: &str,
        algorithm: ChecksumAlgorithm,
        source_url: &str,
    ) -> EngineResult<Artifact> {
        let mut tx = self.pool.begin().await?;

        let artifact = sqlx::query_as::<_, Artifact>(
            "INSERT INTO artifacts \
             (id, storage_location_id, path, filename, size, checksum, checksum_algorithm, \
              source_url, discovered, last_verified) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, FALSE, now()) \
             RETURNING *",
        )
        .bind(Uuid::now_v7())
        .bind(location_id)
        .bind(path)
        .bind(filename)
        .bind(size)
        .bind(checksum)
        .bind(algorithm.as_str())
        .bind(source_url)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE storage_locations \
             SET file_count = file_count + 1, total_size = total_size + $2, updated_at = now() \
             WHERE id = $1",
        )
        .bind(location_id)
        .bind(size)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(artifact_id = %artifact.id, path = %path, size = size, "artifact recorded");
        Ok(artifact)
    }

    /// Record a file found by a scan; checksum unknown until verified
    pub async fn insert_scanned(
        &self,
        location_id: Uuid,
        path: &str,
        filename: &str,
        size: i64,
    ) -> EngineResult<Artifact> {
        let artifact = sqlx::query_as::<_, Artifact>(
            "INSERT INTO artifacts \
             (id, storage_location_id, path, filename, size, discovered, last_verified) \
             VALUES ($1, $2, $3, $4, $5, TRUE, now()) \
             RETURNING *",
        )
        .bind(Uuid::now_v7())
        .bind(location_id)
        .bind(path)
        .bind(filename)
        .bind(size)
        .fetch_one(&self.pool)
        .await?;
        Ok(artifact)
    }

    pub async fn find_by_path(&self, path: &str) -> EngineResult<Option<Artifact>> {
        let artifact = sqlx::query_as::<_, Artifact>("SELECT * FROM artifacts WHERE path = $1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(artifact)
    }

    pub async fn refresh_verified(&self, artifact_id: Uuid, size: i64) -> EngineResult<()> {
        sqlx::query(
            "UPDATE artifacts SET last_verified = now(), size = $2, updated_at = now() \
             WHERE id = $1",
        )
        .bind(artifact_id)
        .bind(size)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, artifact_id: Uuid) -> EngineResult<()> {
        sqlx::query("DELETE FROM artifacts WHERE id = $1")
            .bind(artifact_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// `(id, path)` of every artifact in a location; drives orphan removal
    pub async fn paths_for_location(
        &self,
        location_id: Uuid,
    ) -> EngineResult<Vec<(Uuid, String)>> {
        let rows: Vec<(Uuid, String)> =
            sqlx::query_as("SELECT id, path FROM artifacts WHERE storage_location_id = $1")
                .bind(location_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    /// Repair a location's stats from the artifact rows themselves
    pub async fn recount_location_stats(&self, location_id: Uuid) -> EngineResult<()> {
        sqlx::query(
            "UPDATE storage_locations SET \
                 file_count = (SELECT count(*) FROM artifacts WHERE storage_location_id = $1), \
                 total_size = (SELECT COALESCE(sum(size), 0) FROM artifacts \
                               WHERE storage_location_id = $1), \
                 updated_at = now() \
             WHERE id = $1",
        )
        .bind(location_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_record_download_updates_counters(pool: PgPool) {
        let store = ArtifactStore::new(pool);
        let location = store
            .create_location("isos", "/data/isos", "iso", true)
            .await
            .unwrap();

        let artifact = store
            .record_download(
                location.id,
                "/data/isos/a.iso",
                "a.iso",
                1024,
                "ab12",
                ChecksumAlgorithm::Sha256,
                "https://example.com/a.iso",
            )
            .await
            .unwrap();

        assert_eq!(artifact.filename, "a.iso");
        assert_eq!(artifact.checksum.as_deref(), Some("ab12"));
        assert!(!artifact.discovered);

        let location = store.get_location(location.id).await.unwrap().unwrap();
        assert_eq!(location.file_count, 1);
        assert_eq!(location.total_size, 1024);
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_duplicate_path_rejected(pool: PgPool) {
        let store = ArtifactStore::new(pool);
        let location = store
            .create_location("isos", "/data/isos", "iso", true)
            .await
            .unwrap();

        store
            .insert_scanned(location.id, "/data/isos/a.iso", "a.iso", 10)
            .await
            .unwrap();
        let err = store
            .insert_scanned(location.id, "/data/isos/a.iso", "a.iso", 10)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::EngineError::Database(_)));
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_scanned_artifact_has_no_checksum(pool: PgPool) {
        let store = ArtifactStore::new(pool);
        let location = store
            .create_location("images", "/data/images", "image", true)
            .await
            .unwrap();

        let artifact = store
            .insert_scanned(location.id, "/data/images/x.raw", "x.raw", 2048)
            .await
            .unwrap();
        assert!(artifact.checksum.is_none());
        assert!(artifact.discovered);
        assert!(artifact.last_verified.is_some());
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_recount_repairs_drifted_stats(pool: PgPool) {
        let store = ArtifactStore::new(pool.clone());
        let location = store
            .create_location("isos", "/data/isos", "iso", true)
            .await
            .unwrap();
        store
            .insert_scanned(location.id, "/data/isos/a.iso", "a.iso", 100)
            .await
            .unwrap();
        store
            .insert_scanned(location.id, "/data/isos/b.iso", "b.iso", 200)
            .await
            .unwrap();

        // Drift the counters, then recount.
        sqlx::query("UPDATE storage_locations SET file_count = 99, total_size = 9999")
            .execute(&pool)
            .await
            .unwrap();
        store.recount_location_stats(location.id).await.unwrap();

        let location = store.get_location(location.id).await.unwrap().unwrap();
        assert_eq!(location.file_count, 2);
        assert_eq!(location.total_size, 300);
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_list_enabled_locations(pool: PgPool) {
        let store = ArtifactStore::new(pool);
        store
            .create_location("on", "/data/on", "iso", true)
            .await
            .unwrap();
        store
            .create_location("off", "/data/off", "iso", false)
            .await
            .unwrap();

        let enabled = store.list_enabled_locations().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "on");
    }
}
