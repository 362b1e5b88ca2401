//! # System Context
//!
//! Shared handle to the resources every component needs: the database pool,
//! the loaded configuration, and the HTTP client used for artifact
//! downloads. Cloned freely via `Arc`; holds no per-task state.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use crate::config::EngineConfig;
use crate::error::EngineResult;

/// Process-wide shared resources
#[derive(Debug, Clone)]
pub struct SystemContext {
    pool: PgPool,
    config: Arc<EngineConfig>,
    http: reqwest::Client,
}

impl SystemContext {
    pub fn new(pool: PgPool, config: EngineConfig) -> EngineResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.download.timeout_seconds))
            .read_timeout(Duration::from_secs(config.download.timeout_seconds))
            .build()?;

        Ok(Self {
            pool,
            config: Arc::new(config),
            http,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }
}
