//! # zoneforge
//!
//! Host-side execution engine for a Bhyve/OmniOS zone control plane. Work
//! arrives as durable task rows, and a single-process scheduler runs them
//! against the host with bounded parallelism, category mutual exclusion,
//! and single-predecessor dependency gating. Artifact downloads and
//! directory scans coordinate through the same queue so partial files are
//! never misread.

pub mod artifacts;
pub mod command;
pub mod config;
pub mod context;
pub mod database;
pub mod error;
pub mod handlers;
pub mod tasks;
pub mod web;
pub mod zones;

pub use config::EngineConfig;
pub use context::SystemContext;
pub use error::{EngineError, EngineResult};
pub use tasks::{EngineHandle, TaskEngine};
