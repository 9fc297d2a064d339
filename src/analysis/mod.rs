// =============================================================================
// Analysis Engine — on-demand efficiency and session analytics
// =============================================================================
//
// Request-scoped derivations over the cycle table and the raw status log.
// Nothing here runs in a background loop: the dashboard calls these when an
// operator opens the analysis views, and may then persist the results into
// the monthly archive tables.
//
// The computation cores (`efficiency`, `sessions`, `loss`) are pure; this
// module only stitches them onto the stores.
// =============================================================================

pub mod efficiency;
pub mod loss;
pub mod sessions;

use std::collections::HashMap;

use anyhow::Result;
use chrono::{NaiveDate, Utc};

use crate::config::StatusVocabulary;
use crate::db::{program_report, status_log, Database};

pub use efficiency::{EfficiencyBand, ProgramTarget, SubProgramEfficiency};
pub use loss::{breakdown, breakdown_per_piece, LossBreakdownEntry};
pub use sessions::{main_name, GapThreshold, Session};

/// Compute the sub-program efficiency view for one machine over a date
/// range, optionally narrowed to main names containing `main_filter`.
/// Targets and quantities come from the operator (keyed by program name).
pub async fn sub_program_report(
    db: &Database,
    vocab: &StatusVocabulary,
    machine: &str,
    start: NaiveDate,
    end: NaiveDate,
    main_filter: Option<&str>,
    targets: &HashMap<String, ProgramTarget>,
) -> Result<Vec<SubProgramEfficiency>> {
    let cycles = program_report::get_range(db, machine, start, end, None).await?;

    let window_start = start.and_hms_opt(0, 0, 0).expect("midnight is valid").and_utc();
    let window_end = end
        .succ_opt()
        .unwrap_or(end)
        .and_hms_opt(0, 0, 0)
        .expect("midnight is valid")
        .and_utc();
    let logs = status_log::get_range(db, machine, window_start, window_end).await?;

    Ok(efficiency::compute(vocab, &cycles, &logs, main_filter, targets))
}

/// Reconstruct main-program sessions for one machine over a date range.
/// Every main name seen in the cycle table (optionally filtered) gets its
/// own session list derived from the raw status log over that main's
/// overall first-to-last-cycle window.
pub async fn main_program_sessions(
    db: &Database,
    vocab: &StatusVocabulary,
    machine: &str,
    start: NaiveDate,
    end: NaiveDate,
    main_filter: Option<&str>,
    gap_threshold: GapThreshold,
) -> Result<Vec<Session>> {
    let cycles = program_report::get_range(db, machine, start, end, None).await?;

    // Overall window (first cycle start .. last cycle end) per main name.
    let mut windows: HashMap<String, (chrono::DateTime<Utc>, chrono::DateTime<Utc>)> =
        HashMap::new();
    for cycle in &cycles {
        let main = main_name(&cycle.program_name);
        if let Some(filter) = main_filter {
            if !main.to_lowercase().contains(&filter.to_lowercase()) {
                continue;
            }
        }
        let entry = windows.entry(main).or_insert((cycle.start, cycle.end));
        entry.0 = entry.0.min(cycle.start);
        entry.1 = entry.1.max(cycle.end);
    }

    let mut all_sessions = Vec::new();
    let mut mains: Vec<_> = windows.into_iter().collect();
    mains.sort_by(|a, b| a.0.cmp(&b.0));

    for (main, (overall_start, overall_end)) in mains {
        let logs = status_log::get_range(db, machine, overall_start, overall_end).await?;
        let sessions = sessions::segment(
            vocab,
            &main,
            &logs,
            overall_start,
            overall_end,
            gap_threshold,
        );
        all_sessions.extend(sessions);
    }

    Ok(all_sessions)
}
