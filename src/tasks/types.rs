//! # Task Data Model
//!
//! The durable task row and its enums. Statuses are stored as TEXT and
//! priorities as SMALLINT; both convert explicitly rather than through a
//! Postgres enum type so the schema stays trivially inspectable.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Task lifecycle state.
///
/// Transitions are strictly `pending -> running -> {completed|failed|cancelled}`,
/// with the single exception of user cancellation which moves `pending`
/// directly to `cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(EngineError::Validation(format!(
                "unknown task status: {other}"
            ))),
        }
    }
}

/// Scheduling priority; higher values win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Background,
    Low,
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    pub fn as_i16(&self) -> i16 {
        match self {
            TaskPriority::Background => 0,
            TaskPriority::Low => 1,
            TaskPriority::Medium => 2,
            TaskPriority::High => 3,
            TaskPriority::Critical => 4,
        }
    }

    pub fn from_i16(value: i16) -> EngineResult<Self> {
        match value {
            0 => Ok(TaskPriority::Background),
            1 => Ok(TaskPriority::Low),
            2 => Ok(TaskPriority::Medium),
            3 => Ok(TaskPriority::High),
            4 => Ok(TaskPriority::Critical),
            other => Err(EngineError::Validation(format!(
                "unknown task priority: {other}"
            ))),
        }
    }
}

/// One scheduled invocation of a handler, as persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: Uuid,
    pub operation: String,
    /// Subject of the operation (zone name, or `"system"`); logging and
    /// filtering only.
    pub target: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    /// Predecessor gate: the task is ineligible until this task is
    /// `completed`. A failed or cancelled predecessor leaves the dependent
    /// `pending` indefinitely.
    pub depends_on: Option<Uuid>,
    /// Opaque payload interpreted by the handler
    pub metadata: Value,
    pub progress_percent: i16,
    pub progress_info: Option<Value>,
    pub error_message: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Raw row shape for sqlx decoding; converted into [`Task`] with enum
/// validation.
#[derive(Debug, sqlx::FromRow)]
pub struct TaskRow {
    pub id: Uuid,
    pub operation: String,
    pub target: String,
    pub priority: i16,
    pub status: String,
    pub depends_on: Option<Uuid>,
    pub metadata: Value,
    pub progress_percent: i16,
    pub progress_info: Option<Value>,
    pub error_message: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for Task {
    type Error = EngineError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: row.id,
            operation: row.operation,
            target: row.target,
            priority: TaskPriority::from_i16(row.priority)?,
            status: row.status.parse()?,
            depends_on: row.depends_on,
            metadata: row.metadata,
            progress_percent: row.progress_percent,
            progress_info: row.progress_info,
            error_message: row.error_message,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

/// Specification for enqueueing a task
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub operation: String,
    pub target: String,
    #[serde(default = "NewTask::default_priority")]
    pub priority: TaskPriority,
    #[serde(default)]
    pub depends_on: Option<Uuid>,
    #[serde(default = "NewTask::default_metadata")]
    pub metadata: Value,
    #[serde(default = "NewTask::default_created_by")]
    pub created_by: String,
}

impl NewTask {
    pub fn new(operation: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            target: target.into(),
            priority: TaskPriority::Medium,
            depends_on: None,
            metadata: Value::Null,
            created_by: "system".to_string(),
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_depends_on(mut self, predecessor: Uuid) -> Self {
        self.depends_on = Some(predecessor);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = created_by.into();
        self
    }

    fn default_priority() -> TaskPriority {
        TaskPriority::Medium
    }

    fn default_metadata() -> Value {
        Value::Null
    }

    fn default_created_by() -> String {
        "api".to_string()
    }
}

/// Filters for task listings; `since` matches `updated_at`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub target: Option<String>,
    pub operation: Option<String>,
    pub operation_ne: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// Per-status row counts for the stats endpoint
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStatusCounts {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Medium);
        assert!(TaskPriority::Medium > TaskPriority::Low);
        assert!(TaskPriority::Low > TaskPriority::Background);
    }

    #[test]
    fn test_priority_i16_round_trip() {
        for value in 0..=4i16 {
            let priority = TaskPriority::from_i16(value).unwrap();
            assert_eq!(priority.as_i16(), value);
        }
        assert!(TaskPriority::from_i16(9).is_err());
        assert!(TaskPriority::from_i16(-1).is_err());
    }

    #[test]
    fn test_priority_serde_names() {
        let json = serde_json::to_string(&TaskPriority::Background).unwrap();
        assert_eq!(json, "\"background\"");
        let parsed: TaskPriority = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(parsed, TaskPriority::Critical);
    }

    #[test]
    fn test_new_task_builder() {
        let spec = NewTask::new("create_vnic", "vnic0")
            .with_priority(TaskPriority::High)
            .with_metadata(serde_json::json!({"link": "e1000g0"}))
            .with_created_by("operator");

        assert_eq!(spec.operation, "create_vnic");
        assert_eq!(spec.target, "vnic0");
        assert_eq!(spec.priority, TaskPriority::High);
        assert_eq!(spec.created_by, "operator");
        assert!(spec.depends_on.is_none());
    }

    #[test]
    fn test_new_task_deserialize_defaults() {
        let spec: NewTask =
            serde_json::from_str(r#"{"operation": "discover", "target": "system"}"#).unwrap();
        assert_eq!(spec.priority, TaskPriority::Medium);
        assert_eq!(spec.created_by, "api");
        assert_eq!(spec.metadata, Value::Null);
    }
}
