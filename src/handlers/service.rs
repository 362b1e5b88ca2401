//! Service-manager wrappers: thin `svcadm` invocations over the command
//! runner. No category; service actions are safe to run in parallel with
//! anything.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::command::{self, CommandSpec};
use crate::error::{EngineError, EngineResult};
use crate::tasks::progress::ProgressPublisher;
use crate::tasks::registry::{HandlerContext, HandlerOutcome, TaskHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Enable,
    Disable,
    Restart,
    Refresh,
}

impl ServiceAction {
    pub const ALL: [ServiceAction; 4] = [
        ServiceAction::Enable,
        ServiceAction::Disable,
        ServiceAction::Restart,
        ServiceAction::Refresh,
    ];

    pub fn operation(&self) -> &'static str {
        match self {
            ServiceAction::Enable => "service_enable",
            ServiceAction::Disable => "service_disable",
            ServiceAction::Restart => "service_restart",
            ServiceAction::Refresh => "service_refresh",
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            ServiceAction::Enable => "enable",
            ServiceAction::Disable => "disable",
            ServiceAction::Restart => "restart",
            ServiceAction::Refresh => "refresh",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServiceParams {
    /// Service FMRI or abbreviated name, e.g. `svc:/network/ssh:default`
    service: String,
}

pub struct ServiceHandler {
    action: ServiceAction,
}

impl ServiceHandler {
    pub fn new(action: ServiceAction) -> Self {
        Self { action }
    }
}

fn validate_fmri(service: &str) -> EngineResult<()> {
    if service.is_empty() {
        return Err(EngineError::Validation("service name must not be empty".into()));
    }
    if service.chars().any(char::is_whitespace) {
        return Err(EngineError::Validation(format!(
            "service name '{service}' must not contain whitespace"
        )));
    }
    Ok(())
}

#[async_trait]
impl TaskHandler for ServiceHandler {
    async fn handle(
        &self,
        ctx: HandlerContext,
        _progress: ProgressPublisher,
    ) -> EngineResult<HandlerOutcome> {
        let params: ServiceParams = ctx.params()?;
        validate_fmri(&params.service)?;

        command::run_with_cancel(
            CommandSpec::new([
                "pfexec",
                "svcadm",
                self.action.verb(),
                params.service.as_str(),
            ])
            .with_timeout(Duration::from_secs(60)),
            &ctx.cancel,
        )
        .await
        .into_result()?;

        info!(service = %params.service, action = self.action.verb(), "service action applied");
        Ok(HandlerOutcome::with_message(format!(
            "{} {}",
            match self.action {
                ServiceAction::Enable => "enabled",
                ServiceAction::Disable => "disabled",
                ServiceAction::Restart => "restarted",
                ServiceAction::Refresh => "refreshed",
            },
            params.service
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_names() {
        assert_eq!(ServiceAction::Enable.operation(), "service_enable");
        assert_eq!(ServiceAction::Refresh.operation(), "service_refresh");
        assert_eq!(ServiceAction::ALL.len(), 4);
    }

    #[test]
    fn test_fmri_validation() {
        assert!(validate_fmri("svc:/network/ssh:default").is_ok());
        assert!(validate_fmri("ssh").is_ok());
        assert!(validate_fmri("").is_err());
        assert!(validate_fmri("svc:/a b").is_err());
    }

    #[test]
    fn test_params_require_service() {
        let params: Result<ServiceParams, _> = serde_json::from_value(serde_json::json!({}));
        assert!(params.is_err());

        let params: ServiceParams =
            serde_json::from_value(serde_json::json!({"service": "svc:/network/ssh"})).unwrap();
        assert_eq!(params.service, "svc:/network/ssh");
    }
}
