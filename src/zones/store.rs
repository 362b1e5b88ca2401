//! Zone table access. Rows are keyed by zone name; discovery owns the
//! `auto_discovered`/`is_orphaned`/`last_seen` fields.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;

use crate::error::EngineResult;

use super::discovery::ObservedZone;

/// One known zone
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ZoneRecord {
    pub zone_name: String,
    pub brand: String,
    pub state: String,
    pub zonepath: Option<String>,
    pub zone_uuid: Option<String>,
    pub auto_discovered: bool,
    pub is_orphaned: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ZoneStore {
    pool: PgPool,
}

impl ZoneStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, zone_name: &str) -> EngineResult<Option<ZoneRecord>> {
        let record = sqlx::query_as::<_, ZoneRecord>("SELECT * FROM zones WHERE zone_name = $1")
            .bind(zone_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    pub async fn known_names(&self) -> EngineResult<HashSet<String>> {
        let names: Vec<(String,)> = sqlx::query_as("SELECT zone_name FROM zones")
            .fetch_all(&self.pool)
            .await?;
        Ok(names.into_iter().map(|(name,)| name).collect())
    }

    /// Insert a zone seen on the host but unknown to the control plane
    pub async fn insert_discovered(&self, observed: &ObservedZone) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO zones \
             (zone_name, brand, state, zonepath, zone_uuid, auto_discovered, is_orphaned, last_seen) \
             VALUES ($1, $2, $3, $4, $5, TRUE, FALSE, now())",
        )
        .bind(&observed.name)
        .bind(&observed.brand)
        .bind(&observed.state)
        .bind(&observed.zonepath)
        .bind(&observed.uuid)
        .execute(&self.pool)
        .await?;

        debug!(zone = %observed.name, brand = %observed.brand, "auto-discovered zone inserted");
        Ok(())
    }

    /// Refresh a known zone with the host's current view
    pub async fn refresh_observed(&self, observed: &ObservedZone) -> EngineResult<()> {
        sqlx::query(
            "UPDATE zones \
             SET brand = $2, state = $3, zonepath = $4, zone_uuid = $5, \
                 is_orphaned = FALSE, last_seen = now(), updated_at = now() \
             WHERE zone_name = $1",
        )
        .bind(&observed.name)
        .bind(&observed.brand)
        .bind(&observed.state)
        .bind(&observed.zonepath)
        .bind(&observed.uuid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flag a known zone the host no longer reports
    pub async fn mark_orphaned(&self, zone_name: &str) -> EngineResult<()> {
        sqlx::query(
            "UPDATE zones SET is_orphaned = TRUE, updated_at = now() WHERE zone_name = $1",
        )
        .bind(zone_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(name: &str, state: &str) -> ObservedZone {
        ObservedZone {
            name: name.to_string(),
            state: state.to_string(),
            zonepath: Some(format!("/zones/{name}")),
            uuid: Some("9dd9ecb8-0b61-4c1c-b12f-a69d79e4b9a5".to_string()),
            brand: "lipkg".to_string(),
        }
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_insert_and_get(pool: PgPool) {
        let store = ZoneStore::new(pool);
        store
            .insert_discovered(&observed("web01", "running"))
            .await
            .unwrap();

        let record = store.get("web01").await.unwrap().unwrap();
        assert_eq!(record.state, "running");
        assert_eq!(record.brand, "lipkg");
        assert!(record.auto_discovered);
        assert!(!record.is_orphaned);
        assert!(record.last_seen.is_some());
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_refresh_clears_orphan_flag(pool: PgPool) {
        let store = ZoneStore::new(pool);
        store
            .insert_discovered(&observed("web01", "installed"))
            .await
            .unwrap();
        store.mark_orphaned("web01").await.unwrap();
        assert!(store.get("web01").await.unwrap().unwrap().is_orphaned);

        store
            .refresh_observed(&observed("web01", "running"))
            .await
            .unwrap();
        let record = store.get("web01").await.unwrap().unwrap();
        assert!(!record.is_orphaned);
        assert_eq!(record.state, "running");
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_known_names(pool: PgPool) {
        let store = ZoneStore::new(pool);
        store
            .insert_discovered(&observed("web01", "running"))
            .await
            .unwrap();
        store
            .insert_discovered(&observed("db01", "installed"))
            .await
            .unwrap();

        let names = store.known_names().await.unwrap();
        assert_eq!(names.len(), 2);
        assert!(names.contains("web01"));
        assert!(names.contains("db01"));
    }
}
