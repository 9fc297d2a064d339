// =============================================================================
// Snapshot Writer — atomic JSON state document for the dashboards
// =============================================================================
//
// Publishes the live register as a single JSON file every tick. The write
// is atomic (tmp + rename) so a dashboard reading mid-write never sees a
// torn document. The snapshot keeps serving even when the database is
// down; it is the dashboards' primary live feed.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::app_state::AppState;
use crate::types::MachineState;

/// Serialize `data` to `path` atomically (write a `.tmp` sibling, then
/// rename over the target).
pub fn write_snapshot(path: impl AsRef<Path>, data: &BTreeMap<String, MachineState>) -> Result<()> {
    let path = path.as_ref();

    let content = serde_json::to_string_pretty(data)
        .context("failed to serialise machine snapshot to JSON")?;

    let tmp_path = path.with_extension("json.tmp");

    std::fs::write(&tmp_path, &content)
        .with_context(|| format!("failed to write tmp snapshot to {}", tmp_path.display()))?;

    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename tmp snapshot to {}", path.display()))?;

    Ok(())
}

/// Background worker: publish the live register every `interval` seconds,
/// plus one final write on shutdown so the dashboards see the last state.
pub async fn run_writer(
    state: Arc<AppState>,
    path: String,
    interval_secs: u64,
    token: CancellationToken,
) {
    info!(path = %path, interval_secs, "snapshot writer started");
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = token.cancelled() => break,
        }

        let data = state.snapshot_live();
        match write_snapshot(&path, &data) {
            Ok(()) => debug!(machines = data.len(), "snapshot written"),
            Err(e) => error!(error = %e, "failed to write snapshot"),
        }
    }

    // Pending snapshot flush on the way out.
    let data = state.snapshot_live();
    if let Err(e) = write_snapshot(&path, &data) {
        error!(error = %e, "failed to write final snapshot");
    }

    info!("snapshot writer stopped");
}
