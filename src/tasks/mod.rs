//! # Task Queue Core
//!
//! The durable, priority-ordered, conflict-aware scheduler and its
//! supporting pieces: the store, the handler registry, category locks, the
//! progress channel, and the periodic drivers.

pub mod locks;
pub mod periodic;
pub mod progress;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod types;

pub use progress::{ProgressPublisher, ProgressUpdate};
pub use registry::{
    HandlerContext, HandlerOutcome, HandlerRegistry, OperationCategory, TaskHandler,
};
pub use scheduler::{EngineHandle, TaskEngine};
pub use store::{CancelOutcome, TaskStore};
pub use types::{NewTask, Task, TaskFilter, TaskPriority, TaskStatus, TaskStatusCounts};
