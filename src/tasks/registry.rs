//! # Handler Registry
//!
//! Maps operation names to handlers, with the compiled-in category and
//! timeout tables. Categories are an attribute of the operation, not the
//! task: external modules registering an OS-facing handler get the right
//! mutual-exclusion domain and timeout without declaring either.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::context::SystemContext;
use crate::error::{EngineError, EngineResult};

use super::progress::ProgressPublisher;
use super::types::Task;

/// Coarse mutual-exclusion domain for operations that mutate related host
/// state. At most one running task per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationCategory {
    PackageManagement,
    NetworkDatalink,
    NetworkIp,
    SystemConfig,
    UserManagement,
}

impl OperationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationCategory::PackageManagement => "package_management",
            OperationCategory::NetworkDatalink => "network_datalink",
            OperationCategory::NetworkIp => "network_ip",
            OperationCategory::SystemConfig => "system_config",
            OperationCategory::UserManagement => "user_management",
        }
    }
}

impl fmt::Display for OperationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative operation -> category table. Operations absent from this
/// table are safe to run in parallel with anything. The claim-path
/// exclusion enumerates this table directly, so a categorized operation is
/// never claimed while its category is held even if no handler is
/// registered for it yet.
#[rustfmt::skip]
const CATEGORY_TABLE: &[(&str, OperationCategory)] = &[
    ("pkg_install", OperationCategory::PackageManagement),
    ("pkg_uninstall", OperationCategory::PackageManagement),
    ("pkg_update", OperationCategory::PackageManagement),
    ("pkg_refresh", OperationCategory::PackageManagement),
    ("beadm_create", OperationCategory::PackageManagement),
    ("beadm_delete", OperationCategory::PackageManagement),
    ("beadm_activate", OperationCategory::PackageManagement),
    ("beadm_mount", OperationCategory::PackageManagement),
    ("beadm_unmount", OperationCategory::PackageManagement),
    ("repository_add", OperationCategory::PackageManagement),
    ("repository_remove", OperationCategory::PackageManagement),
    ("repository_modify", OperationCategory::PackageManagement),
    ("repository_enable", OperationCategory::PackageManagement),
    ("repository_disable", OperationCategory::PackageManagement),
    ("create_vnic", OperationCategory::NetworkDatalink),
    ("delete_vnic", OperationCategory::NetworkDatalink),
    ("modify_vnic", OperationCategory::NetworkDatalink),
    ("set_vnic_properties", OperationCategory::NetworkDatalink),
    ("create_aggregate", OperationCategory::NetworkDatalink),
    ("delete_aggregate", OperationCategory::NetworkDatalink),
    ("modify_aggregate", OperationCategory::NetworkDatalink),
    ("modify_aggregate_links", OperationCategory::NetworkDatalink),
    ("create_etherstub", OperationCategory::NetworkDatalink),
    ("delete_etherstub", OperationCategory::NetworkDatalink),
    ("modify_etherstub", OperationCategory::NetworkDatalink),
    ("create_vlan", OperationCategory::NetworkDatalink),
    ("delete_vlan", OperationCategory::NetworkDatalink),
    ("modify_vlan", OperationCategory::NetworkDatalink),
    ("create_bridge", OperationCategory::NetworkDatalink),
    ("delete_bridge", OperationCategory::NetworkDatalink),
    ("modify_bridge", OperationCategory::NetworkDatalink),
    ("modify_bridge_links", OperationCategory::NetworkDatalink),
    ("create_ip_address", OperationCategory::NetworkIp),
    ("delete_ip_address", OperationCategory::NetworkIp),
    ("enable_ip_address", OperationCategory::NetworkIp),
    ("disable_ip_address", OperationCategory::NetworkIp),
    ("set_hostname", OperationCategory::SystemConfig),
    ("update_time_sync_config", OperationCategory::SystemConfig),
    ("force_time_sync", OperationCategory::SystemConfig),
    ("set_timezone", OperationCategory::SystemConfig),
    // Mutates the same host state the rest of this set protects, so it
    // shares the lock.
    ("switch_time_sync_system", OperationCategory::SystemConfig),
    ("user_create", OperationCategory::UserManagement),
    ("user_modify", OperationCategory::UserManagement),
    ("user_delete", OperationCategory::UserManagement),
    ("user_set_password", OperationCategory::UserManagement),
    ("user_lock", OperationCategory::UserManagement),
    ("user_unlock", OperationCategory::UserManagement),
    ("group_create", OperationCategory::UserManagement),
    ("group_modify", OperationCategory::UserManagement),
    ("group_delete", OperationCategory::UserManagement),
    ("role_create", OperationCategory::UserManagement),
    ("role_modify", OperationCategory::UserManagement),
    ("role_delete", OperationCategory::UserManagement),
];

/// Category for an operation name
pub fn operation_category(operation: &str) -> Option<OperationCategory> {
    CATEGORY_TABLE
        .iter()
        .find(|(op, _)| *op == operation)
        .map(|(_, category)| *category)
}

/// Wall-clock budget for an operation's handler. Package operations get the
/// documented long windows; everything else defaults to five minutes.
pub fn default_timeout(operation: &str) -> Duration {
    match operation {
        "pkg_install" | "pkg_uninstall" => Duration::from_secs(600),
        "pkg_update" => Duration::from_secs(1800),
        "artifact_download_url" => Duration::from_secs(3600),
        _ => Duration::from_secs(300),
    }
}

/// Everything a handler gets for one execution
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub task: Task,
    /// Fires on handler timeout and engine shutdown
    pub cancel: CancellationToken,
    pub system: SystemContext,
}

impl HandlerContext {
    /// Deserialize the task's metadata into the handler's parameter struct,
    /// failing fast with a validation error.
    pub fn params<T: DeserializeOwned>(&self) -> EngineResult<T> {
        serde_json::from_value(self.task.metadata.clone()).map_err(|e| {
            EngineError::Validation(format!(
                "invalid metadata for {}: {e}",
                self.task.operation
            ))
        })
    }
}

/// Successful handler result. Errors travel through `EngineResult`; the
/// scheduler maps them onto `failed` rows.
#[derive(Debug, Clone, Default)]
pub struct HandlerOutcome {
    pub message: Option<String>,
    /// Structured extras surfaced in `progress_info`; carries
    /// `cleanup_error` warnings when host-side work succeeded but DB
    /// reconciliation did not.
    pub extra: Option<Value>,
}

impl HandlerOutcome {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            extra: None,
        }
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }

    pub fn with_cleanup_error(mut self, cleanup_error: impl Into<String>) -> Self {
        let extra = self.extra.get_or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(map) = extra {
            map.insert(
                "cleanup_error".to_string(),
                Value::String(cleanup_error.into()),
            );
        }
        self
    }
}

/// One operation's implementation. Handlers must not panic across the
/// boundary; the scheduler still catches panics and maps them to `failed`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: HandlerContext,
        progress: ProgressPublisher,
    ) -> EngineResult<HandlerOutcome>;
}

/// A registered operation
#[derive(Clone)]
pub struct RegisteredHandler {
    pub handler: Arc<dyn TaskHandler>,
    pub category: Option<OperationCategory>,
    pub timeout: Duration,
}

/// Operation name -> handler + category + timeout
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, RegisteredHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler with the compiled-in category and timeout for its
    /// operation name. Duplicate registrations are an error.
    pub fn register(
        &mut self,
        operation: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> EngineResult<()> {
        let operation = operation.into();
        if self.handlers.contains_key(&operation) {
            return Err(EngineError::Configuration(format!(
                "duplicate handler registration for '{operation}'"
            )));
        }
        let registered = RegisteredHandler {
            handler,
            category: operation_category(&operation),
            timeout: default_timeout(&operation),
        };
        self.handlers.insert(operation, registered);
        Ok(())
    }

    /// Register with an explicit wall-clock budget instead of the table
    /// default (long-running traces, operator-tuned package windows).
    pub fn register_with_timeout(
        &mut self,
        operation: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        timeout: Duration,
    ) -> EngineResult<()> {
        let operation = operation.into();
        self.register(operation.clone(), handler)?;
        if let Some(registered) = self.handlers.get_mut(&operation) {
            registered.timeout = timeout;
        }
        Ok(())
    }

    pub fn get(&self, operation: &str) -> Option<&RegisteredHandler> {
        self.handlers.get(operation)
    }

    pub fn category_of(&self, operation: &str) -> Option<OperationCategory> {
        operation_category(operation)
    }

    /// Every operation whose category is in `held` (from the compiled
    /// table, registered or not); the scheduler excludes these from the
    /// claim.
    pub fn operations_in_categories(
        &self,
        held: &std::collections::HashSet<OperationCategory>,
    ) -> Vec<String> {
        CATEGORY_TABLE
            .iter()
            .filter(|(_, category)| held.contains(category))
            .map(|(op, _)| (*op).to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("operations", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
