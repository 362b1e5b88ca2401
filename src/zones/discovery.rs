//! Zone discovery: reconcile `zoneadm list -pc` output with the zones
//! table. Zones observed on the host but unknown to the control plane are
//! inserted as auto-discovered; known zones the host no longer reports are
//! flagged orphaned; the overlap gets brand/state/last_seen refreshed.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::command::{self, CommandSpec};
use crate::error::EngineResult;
use crate::tasks::progress::ProgressPublisher;
use crate::tasks::registry::{HandlerContext, HandlerOutcome, TaskHandler};

use super::store::ZoneStore;

/// One line of `zoneadm list -pc` machine output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedZone {
    pub name: String,
    pub state: String,
    pub zonepath: Option<String>,
    pub uuid: Option<String>,
    pub brand: String,
}

/// Parse `zoneadm list -pc` machine-parsable output:
/// `zoneid:zonename:state:zonepath:uuid:brand:ip-type`. The global zone is
/// not managed and is skipped.
pub fn parse_zoneadm_list(output: &str) -> Vec<ObservedZone> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 7 {
                return None;
            }
            let name = fields[1];
            if name.is_empty() || name == "global" {
                return None;
            }
            Some(ObservedZone {
                name: name.to_string(),
                state: fields[2].to_string(),
                zonepath: non_empty(fields[3]),
                uuid: non_empty(fields[4]),
                brand: fields[5].to_string(),
            })
        })
        .collect()
}

fn non_empty(field: &str) -> Option<String> {
    if field.is_empty() || field == "-" {
        None
    } else {
        Some(field.to_string())
    }
}

/// Handler for the periodic `discover` operation
pub struct DiscoverHandler;

#[async_trait]
impl TaskHandler for DiscoverHandler {
    async fn handle(
        &self,
        ctx: HandlerContext,
        progress: ProgressPublisher,
    ) -> EngineResult<HandlerOutcome> {
        let listing = command::run_with_cancel(
            CommandSpec::new(["zoneadm", "list", "-pc"]).with_timeout(Duration::from_secs(60)),
            &ctx.cancel,
        )
        .await
        .into_result()?;

        let observed = parse_zoneadm_list(&listing.stdout);
        progress.percent(25);

        let store = ZoneStore::new(ctx.system.pool().clone());
        let known = store.known_names().await?;
        let observed_names: HashSet<&str> = observed.iter().map(|z| z.name.as_str()).collect();

        let mut added = 0u64;
        let mut refreshed = 0u64;
        for zone in &observed {
            if known.contains(&zone.name) {
                store.refresh_observed(zone).await?;
                refreshed += 1;
            } else {
                store.insert_discovered(zone).await?;
                added += 1;
            }
        }
        progress.percent(75);

        let mut orphaned = 0u64;
        for name in known.iter().filter(|n| !observed_names.contains(n.as_str())) {
            store.mark_orphaned(name).await?;
            orphaned += 1;
        }

        info!(
            observed = observed.len(),
            added = added,
            refreshed = refreshed,
            orphaned = orphaned,
            "zone discovery reconciled"
        );

        Ok(HandlerOutcome::with_message(format!(
            "reconciled {} zones ({added} new, {refreshed} refreshed, {orphaned} orphaned)",
            observed.len()
        ))
        .with_extra(json!({
            "observed": observed.len(),
            "added": added,
            "refreshed": refreshed,
            "orphaned": orphaned,
        })))
    }
}
