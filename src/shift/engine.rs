// =============================================================================
// Shift Engine — periodic utilization rollups and shift finalization
// =============================================================================
//
// Every tick, for every known machine: recompute runtime/idle/other for the
// current and previous shift from the status log, upsert the live rows,
// and — once a shift's end has passed — write the one-shot final row. The
// finalized set lives in process memory; the final table's unique key makes
// a post-restart double write a harmless skipped insert.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Local, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::db::{shift_metrics, status_log, Database};
use crate::types::ShiftMetric;

use super::{calculator, ShiftSchedule};

/// Background worker computing shift metrics on a fixed cadence.
pub async fn run_engine(
    db: Arc<Database>,
    state: Arc<AppState>,
    schedule: ShiftSchedule,
    interval_secs: u64,
    token: CancellationToken,
) {
    info!(interval_secs, "shift engine started");
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));

    // Latest computed metric per (machine, shift name, shift start), kept
    // for finalization once the shift end passes.
    let mut tracked: HashMap<String, ShiftMetric> = HashMap::new();
    // (machine, shift start) pairs already written to the final table.
    let mut finalized: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = token.cancelled() => break,
        }

        let now = Utc::now();
        let current = schedule.current_shift(now, &Local);
        let previous = schedule.previous_shift(now, &Local);
        debug!(
            current = %current.name,
            previous = %previous.name,
            "computing shift metrics"
        );

        let fetch_start = previous.start.min(current.start);
        let fetch_end = current.end.max(now);

        for machine in state.machine_names() {
            let logs =
                match status_log::get_range(&db, &machine, fetch_start, fetch_end).await {
                    Ok(logs) => logs,
                    Err(e) => {
                        warn!(machine = %machine, error = %e, "failed to fetch status logs");
                        continue;
                    }
                };

            for window in [&current, &previous] {
                let (runtime, idle) = calculator::runtime_idle(
                    &state.config.vocabulary,
                    &logs,
                    window.start,
                    window.end,
                    now,
                );
                let other = calculator::other_time(runtime, idle, window.start, window.end, now);

                let metric = ShiftMetric {
                    machine_name: machine.clone(),
                    shift_name: window.name.clone(),
                    runtime_secs: runtime,
                    idle_secs: idle,
                    other_secs: other,
                    shift_start: window.start,
                    shift_end: window.end,
                };

                if let Err(e) = shift_metrics::save_live(&db, &metric).await {
                    warn!(
                        machine = %machine,
                        shift = %window.name,
                        error = %e,
                        "failed to save live shift metrics"
                    );
                }

                let track_key = format!(
                    "{}|{}|{}",
                    machine,
                    window.name,
                    window.start.to_rfc3339()
                );
                tracked.insert(track_key, metric);
            }
        }

        // Finalize every tracked shift whose end has passed.
        for metric in tracked.values() {
            if metric.shift_end > now {
                continue;
            }
            let final_key = format!("{}|{}", metric.machine_name, metric.shift_start.to_rfc3339());
            if finalized.contains(&final_key) {
                continue;
            }

            // The final row accounts the full shift duration.
            let total = (metric.shift_end - metric.shift_start).num_milliseconds() as f64 / 1000.0;
            let other = (total - metric.runtime_secs - metric.idle_secs).max(0.0);
            let final_metric = ShiftMetric {
                other_secs: other,
                ..metric.clone()
            };

            match shift_metrics::save_final(&db, &final_metric).await {
                Ok(inserted) => {
                    if inserted {
                        info!(
                            machine = %final_metric.machine_name,
                            shift = %final_metric.shift_name,
                            start = %final_metric.shift_start,
                            "final shift metrics saved"
                        );
                    } else {
                        debug!(
                            machine = %final_metric.machine_name,
                            start = %final_metric.shift_start,
                            "final shift metrics already present, skipped"
                        );
                    }
                    finalized.insert(final_key);
                }
                Err(e) => {
                    error!(
                        machine = %final_metric.machine_name,
                        shift = %final_metric.shift_name,
                        error = %e,
                        "failed to save final shift metrics"
                    );
                }
            }
        }
    }

    info!("shift engine stopped");
}
