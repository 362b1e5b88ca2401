//! # Built-in Handlers
//!
//! Handlers the engine ships with: zone discovery, artifact download/scan,
//! and the service-manager wrappers. OS-facing modules for zones, network,
//! packaging, and user administration register their handlers on the same
//! registry; the compiled-in operation table gives them their category and
//! timeout.

use std::sync::Arc;

use crate::artifacts::{DownloadHandler, ScanHandler};
use crate::error::EngineResult;
use crate::tasks::registry::HandlerRegistry;
use crate::zones::DiscoverHandler;

pub mod service;

pub use service::{ServiceAction, ServiceHandler};

/// Registry pre-populated with the engine's own handlers
pub fn builtin_registry() -> EngineResult<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();

    registry.register("discover", Arc::new(DiscoverHandler))?;

    for action in ServiceAction::ALL {
        registry.register(action.operation(), Arc::new(ServiceHandler::new(action)))?;
    }

    registry.register("artifact_download_url", Arc::new(DownloadHandler))?;
    registry.register("artifact_scan_all", Arc::new(ScanHandler))?;
    registry.register("artifact_scan_location", Arc::new(ScanHandler))?;

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_contents() {
        let registry = builtin_registry().unwrap();
        for op in [
            "discover",
            "service_enable",
            "service_disable",
            "service_restart",
            "service_refresh",
            "artifact_download_url",
            "artifact_scan_all",
            "artifact_scan_location",
        ] {
            assert!(registry.get(op).is_some(), "missing builtin {op}");
        }
        assert_eq!(registry.len(), 8);
    }

    #[test]
    fn test_builtins_are_uncategorized() {
        let registry = builtin_registry().unwrap();
        for op in ["discover", "service_restart", "artifact_scan_all"] {
            assert!(registry.get(op).unwrap().category.is_none());
        }
    }
}
