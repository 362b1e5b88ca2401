//! # Zone Inventory
//!
//! The `zones` table and the discovery reconciliation that keeps it in sync
//! with what the host actually reports.

pub mod discovery;
pub mod store;

pub use discovery::DiscoverHandler;
pub use store::{ZoneRecord, ZoneStore};
