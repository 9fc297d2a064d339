// =============================================================================
// Program Cycle Engine — running-interval reconstruction
// =============================================================================
//
// Scans each machine's recent status log for maximal Running intervals.
// A cycle opens when the status enters the Running vocabulary and closes
// when it leaves; the program name is captured at the opening edge, so a
// program change that never leaves Running does not split the cycle. A
// cycle still open at the end of the window closes at the last log's
// timestamp, and is re-emitted with a later end on the next sweep (the
// table upsert grows it in place).
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::config::StatusVocabulary;
use crate::db::{program_report, status_log, Database};
use crate::types::{ProgramCycle, StatusLogEntry};

/// Program name recorded when a cycle starts without any program loaded.
pub const NO_PROGRAM: &str = "N/A (No Program)";

/// Cycles shorter than this are sensor noise and are suppressed.
const MIN_CYCLE_MILLIS: i64 = 1;

// =============================================================================
// Scanner
// =============================================================================

/// Detect completed running cycles in `logs` (must cover one machine;
/// ordering is re-established here).
pub fn scan_cycles(
    vocab: &StatusVocabulary,
    machine: &str,
    logs: &[StatusLogEntry],
) -> Vec<ProgramCycle> {
    let mut sorted: Vec<&StatusLogEntry> = logs.iter().collect();
    sorted.sort_by_key(|l| l.timestamp);

    let mut cycles = Vec::new();
    let mut open: Option<(DateTime<Utc>, String)> = None;

    for log in &sorted {
        if vocab.is_running(&log.status_text) {
            if open.is_none() {
                let program = log
                    .current_program
                    .as_deref()
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .unwrap_or(NO_PROGRAM)
                    .to_string();
                debug!(
                    machine = %machine,
                    program = %program,
                    at = %log.timestamp,
                    "running cycle opened"
                );
                open = Some((log.timestamp, program));
            }
            // Already running: the cycle continues under the program
            // captured at its start.
        } else if let Some((start, program)) = open.take() {
            push_cycle(&mut cycles, machine, &program, start, log.timestamp);
        }
    }

    // A cycle still open at the end of the window closes at the last log.
    if let Some((start, program)) = open {
        if let Some(last) = sorted.last() {
            push_cycle(&mut cycles, machine, &program, start, last.timestamp);
        }
    }

    cycles
}

fn push_cycle(
    cycles: &mut Vec<ProgramCycle>,
    machine: &str,
    program: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) {
    let millis = (end - start).num_milliseconds();
    if millis < MIN_CYCLE_MILLIS {
        debug!(
            machine = %machine,
            program = %program,
            millis,
            "cycle below noise floor, suppressed"
        );
        return;
    }

    cycles.push(ProgramCycle {
        machine_name: machine.to_string(),
        program_name: program.to_string(),
        start,
        end,
        duration_secs: millis as f64 / 1000.0,
    });
}

// =============================================================================
// Worker
// =============================================================================

/// The sweep window: start of the previous local day through the end of
/// the current local day, as UTC instants.
fn report_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let today = now.with_timezone(&Local).date_naive();
    let midnight = NaiveTime::from_hms_opt(0, 0, 0).expect("midnight is valid");

    let start_naive = (today - Duration::days(1)).and_time(midnight);
    let end_naive = (today + Duration::days(1)).and_time(midnight);

    let start = Local
        .from_local_datetime(&start_naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now - Duration::days(1));
    let end = Local
        .from_local_datetime(&end_naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now);

    (start, end)
}

/// Background worker: every `interval` seconds, rescan the window for
/// every known machine and upsert the detected cycles.
pub async fn run_engine(
    db: Arc<Database>,
    state: Arc<AppState>,
    interval_secs: u64,
    token: CancellationToken,
) {
    info!(interval_secs, "program cycle engine started");
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = token.cancelled() => break,
        }

        let now = Utc::now();
        if let Err(e) = program_report::ensure_month(&db, now).await {
            error!(error = %e, "could not verify program report table, skipping cycle");
            continue;
        }

        let (window_start, window_end) = report_window(now);

        for machine in state.machine_names() {
            let logs =
                match status_log::get_range(&db, &machine, window_start, window_end).await {
                    Ok(logs) => logs,
                    Err(e) => {
                        warn!(machine = %machine, error = %e, "failed to fetch status logs");
                        continue;
                    }
                };

            if logs.is_empty() {
                debug!(machine = %machine, "no status logs in report window");
                continue;
            }

            let cycles = scan_cycles(&state.config.vocabulary, &machine, &logs);
            if cycles.is_empty() {
                debug!(machine = %machine, "no complete program cycles detected");
                continue;
            }

            match program_report::save_cycles(&db, &cycles).await {
                Ok(()) => info!(
                    machine = %machine,
                    cycles = cycles.len(),
                    "program cycles saved"
                ),
                Err(e) => warn!(machine = %machine, error = %e, "failed to save program cycles"),
            }
        }
    }

    info!("program cycle engine stopped");
}
