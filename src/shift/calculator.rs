// =============================================================================
// Runtime / Idle Calculation — windowed over one shift
// =============================================================================
//
// Walks the status log over `[shift_start, shift_end]` and buckets every
// segment between consecutive entries into runtime (status in the Running
// vocabulary) or idle (everything else). The "other" bucket is NOT computed
// here: callers derive it by subtracting from the elapsed window so the
// three never overcount.
//
// Logs rarely start exactly at a shift boundary, so when the earliest
// in-window entry starts late and an earlier log exists, a synthetic entry
// at `shift_start` carries the preceding status across the boundary.
// =============================================================================

use chrono::{DateTime, Utc};

use crate::config::StatusVocabulary;
use crate::types::StatusLogEntry;

/// Compute `(runtime_secs, idle_secs)` for one shift window.
///
/// `logs` may extend beyond the window on both sides; `now` bounds the last
/// open segment while the shift is still running.
pub fn runtime_idle(
    vocab: &StatusVocabulary,
    logs: &[StatusLogEntry],
    shift_start: DateTime<Utc>,
    shift_end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (f64, f64) {
    let mut sorted: Vec<&StatusLogEntry> = logs.iter().collect();
    sorted.sort_by_key(|l| l.timestamp);

    // Split into the last entry preceding the window and the in-window set.
    let mut last_before: Option<&StatusLogEntry> = None;
    let mut relevant: Vec<(DateTime<Utc>, String)> = Vec::new();
    for log in sorted {
        if log.timestamp < shift_start {
            last_before = Some(log);
        } else if log.timestamp < shift_end {
            relevant.push((log.timestamp, log.status_text.clone()));
        } else {
            break;
        }
    }

    // Boundary synthesis: carry the preceding status to the shift start.
    // Statuses outside every vocabulary are carried as Idle.
    if let Some(before) = last_before {
        let status = if vocab.knows(&before.status_text) {
            before.status_text.clone()
        } else {
            "Idle".to_string()
        };
        relevant.insert(0, (shift_start, status));
    }

    if relevant.is_empty() {
        return (0.0, 0.0);
    }

    relevant.sort_by_key(|(ts, _)| *ts);

    // Collapse exact-timestamp duplicates, keeping the most recent entry.
    let mut unique: Vec<(DateTime<Utc>, String)> = Vec::with_capacity(relevant.len());
    for entry in relevant {
        let same_instant = matches!(unique.last(), Some((last_ts, _)) if *last_ts == entry.0);
        if same_instant {
            *unique.last_mut().expect("non-empty") = entry;
        } else {
            unique.push(entry);
        }
    }

    let mut runtime = 0.0;
    let mut idle = 0.0;

    for (i, (ts, status)) in unique.iter().enumerate() {
        let segment_end = match unique.get(i + 1) {
            Some((next_ts, _)) => (*next_ts).min(shift_end),
            None => {
                if shift_end > now {
                    now
                } else {
                    shift_end
                }
            }
        };
        let segment_start = (*ts).max(shift_start);

        let duration = (segment_end - segment_start).num_milliseconds() as f64 / 1000.0;
        if duration <= 0.0 {
            continue;
        }

        if vocab.is_running(status) {
            runtime += duration;
        } else {
            idle += duration;
        }
    }

    (runtime, idle)
}

/// Derive the unaccounted bucket: elapsed window time not already counted
/// as runtime or idle, clamped at zero.
pub fn other_time(
    runtime_secs: f64,
    idle_secs: f64,
    shift_start: DateTime<Utc>,
    shift_end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    let elapsed_end = now.min(shift_end);
    let elapsed = (elapsed_end - shift_start).num_milliseconds() as f64 / 1000.0;
    (elapsed.max(0.0) - runtime_secs - idle_secs).max(0.0)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn vocab() -> StatusVocabulary {
        StatusVocabulary::default()
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 14, h, m, 0).unwrap()
    }

    fn log(h: u32, m: u32, status: &str) -> StatusLogEntry {
        StatusLogEntry {
            timestamp: at(h, m),
            status_text: status.into(),
            spindle_speed: None,
            feed_rate: None,
            current_program: None,
        }
    }

    #[test]
    fn boundary_synthesis_carries_preceding_status() {
        // Shift 08:00-16:00; a Running log at 07:50 means the machine was
        // already cutting at shift start.
        let logs = vec![
            log(7, 50, "Running"),
            log(8, 30, "Idle"),
            log(9, 0, "Running"),
            log(16, 0, "Idle"),
        ];
        let (runtime, idle) = runtime_idle(&vocab(), &logs, at(8, 0), at(16, 0), at(17, 0));

        // 08:00-08:30 running + 09:00-16:00 running = 7h30m; idle 30m.
        assert!((runtime - 27_000.0).abs() < 1e-6);
        assert!((idle - 1_800.0).abs() < 1e-6);

        let other = other_time(runtime, idle, at(8, 0), at(16, 0), at(17, 0));
        assert!(other.abs() < 1e-6);
    }

    #[test]
    fn unknown_preceding_status_is_carried_as_idle() {
        let logs = vec![log(7, 0, "SomethingNew"), log(12, 0, "Running")];
        let (runtime, idle) = runtime_idle(&vocab(), &logs, at(8, 0), at(16, 0), at(16, 30));

        // 08:00-12:00 idle (carried), 12:00-16:00 running.
        assert!((idle - 4.0 * 3600.0).abs() < 1e-6);
        assert!((runtime - 4.0 * 3600.0).abs() < 1e-6);
    }

    #[test]
    fn open_shift_is_bounded_by_now() {
        let logs = vec![log(8, 0, "Running")];
        let (runtime, idle) = runtime_idle(&vocab(), &logs, at(8, 0), at(16, 0), at(10, 0));
        assert!((runtime - 2.0 * 3600.0).abs() < 1e-6);
        assert_eq!(idle, 0.0);
    }

    #[test]
    fn no_logs_means_no_time() {
        let (runtime, idle) = runtime_idle(&vocab(), &[], at(8, 0), at(16, 0), at(12, 0));
        assert_eq!((runtime, idle), (0.0, 0.0));

        // All elapsed time lands in the unaccounted bucket.
        let other = other_time(runtime, idle, at(8, 0), at(16, 0), at(12, 0));
        assert!((other - 4.0 * 3600.0).abs() < 1e-6);
    }

    #[test]
    fn duplicate_timestamps_keep_most_recent() {
        let logs = vec![
            log(8, 0, "Idle"),
            log(8, 0, "Running"),
            log(9, 0, "Idle"),
        ];
        let (runtime, idle) = runtime_idle(&vocab(), &logs, at(8, 0), at(16, 0), at(16, 30));
        assert!((runtime - 3_600.0).abs() < 1e-6);
        assert!((idle - 7.0 * 3600.0).abs() < 1e-6);
    }

    #[test]
    fn accounted_time_never_exceeds_window() {
        let logs = vec![
            log(7, 0, "Running"),
            log(9, 0, "Idle"),
            log(15, 0, "Running"),
            log(17, 0, "Idle"),
        ];
        let now = at(18, 0);
        let (runtime, idle) = runtime_idle(&vocab(), &logs, at(8, 0), at(16, 0), now);
        let window = 8.0 * 3600.0;
        assert!(runtime + idle <= window + 1e-3);
    }
}
