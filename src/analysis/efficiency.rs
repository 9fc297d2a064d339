// =============================================================================
// Sub-Program Efficiency — target vs. actual per program
// =============================================================================
//
// Groups cycles by program name, pairs the totals with operator-supplied
// targets and quantities, and grades the per-piece actuals. Spindle and
// feed actuals come from the raw status log restricted to Running samples,
// summarised as the mode (preferring nonzero observations, since a machine
// parked at 0 RPM between cuts would otherwise dominate).
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use crate::config::StatusVocabulary;
use crate::types::{ProgramCycle, StatusLogEntry};

use super::sessions::main_name;

/// Operator-supplied target figures for one program.
#[derive(Debug, Clone)]
pub struct ProgramTarget {
    pub target_secs: f64,
    pub target_spindle: i32,
    pub target_feed: i32,
    pub quantity: i32,
    pub notes: String,
}

impl Default for ProgramTarget {
    fn default() -> Self {
        Self {
            target_secs: 0.0,
            target_spindle: 0,
            target_feed: 0,
            quantity: 1,
            notes: String::new(),
        }
    }
}

/// Efficiency grading bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EfficiencyBand {
    Good,
    Average,
    Bad,
}

impl EfficiencyBand {
    pub fn from_percent(pct: f64) -> Self {
        if pct >= 85.0 {
            Self::Good
        } else if pct >= 75.0 {
            Self::Average
        } else {
            Self::Bad
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "Good",
            Self::Average => "Average",
            Self::Bad => "Bad",
        }
    }
}

impl std::fmt::Display for EfficiencyBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row of the sub-program efficiency report.
#[derive(Debug, Clone)]
pub struct SubProgramEfficiency {
    pub program_name: String,
    pub total_cycle_secs: f64,
    pub actual_per_piece_secs: f64,
    pub target_secs: f64,
    pub efficiency_pct: f64,
    pub band: EfficiencyBand,
    pub spindle_mode: i32,
    pub feed_rate_mode: i32,
    pub target_spindle: i32,
    pub target_feed: i32,
    pub quantity: i32,
    pub notes: String,
}

/// Compute the efficiency report from cycles plus raw Running logs.
/// `main_filter` narrows to programs whose main name contains the filter
/// (case-insensitive).
pub fn compute(
    vocab: &StatusVocabulary,
    cycles: &[ProgramCycle],
    logs: &[StatusLogEntry],
    main_filter: Option<&str>,
    targets: &HashMap<String, ProgramTarget>,
) -> Vec<SubProgramEfficiency> {
    // Total cycle duration per program, in a BTreeMap for stable ordering.
    let mut totals: BTreeMap<String, f64> = BTreeMap::new();
    for cycle in cycles {
        if let Some(filter) = main_filter {
            let main = main_name(&cycle.program_name);
            if !main.to_lowercase().contains(&filter.to_lowercase()) {
                continue;
            }
        }
        *totals.entry(cycle.program_name.clone()).or_insert(0.0) += cycle.duration_secs;
    }

    // Spindle / feed observations per program, Running samples only.
    let mut spindles: HashMap<String, Vec<i64>> = HashMap::new();
    let mut feeds: HashMap<String, Vec<i64>> = HashMap::new();
    for log in logs {
        if !vocab.is_running(&log.status_text) {
            continue;
        }
        let program = log
            .current_program
            .clone()
            .unwrap_or_else(|| "N/A".to_string());
        if let Some(s) = log.spindle_speed {
            spindles.entry(program.clone()).or_default().push(i64::from(s));
        }
        if let Some(f) = log.feed_rate {
            feeds.entry(program).or_default().push(i64::from(f));
        }
    }

    let default_target = ProgramTarget::default();

    totals
        .into_iter()
        .map(|(program_name, total_cycle_secs)| {
            let target = targets.get(&program_name).unwrap_or(&default_target);

            let quantity = target.quantity.max(0);
            let actual_per_piece_secs = if quantity > 0 {
                total_cycle_secs / f64::from(quantity)
            } else {
                0.0
            };

            let efficiency_pct = if actual_per_piece_secs > 0.0 {
                (target.target_secs / actual_per_piece_secs * 100.0).min(100.0)
            } else {
                0.0
            };
            let efficiency_pct = (efficiency_pct * 100.0).round() / 100.0;

            SubProgramEfficiency {
                spindle_mode: mode_preferring_nonzero(spindles.get(&program_name)) as i32,
                feed_rate_mode: mode_preferring_nonzero(feeds.get(&program_name)) as i32,
                band: EfficiencyBand::from_percent(efficiency_pct),
                program_name,
                total_cycle_secs,
                actual_per_piece_secs,
                target_secs: target.target_secs,
                efficiency_pct,
                target_spindle: target.target_spindle,
                target_feed: target.target_feed,
                quantity: target.quantity,
                notes: target.notes.clone(),
            }
        })
        .collect()
}

/// Mode of a series, preferring nonzero observations; ties resolve to the
/// smallest value so the result is deterministic. An empty or absent
/// series is 0.
fn mode_preferring_nonzero(values: Option<&Vec<i64>>) -> i64 {
    let Some(values) = values else { return 0 };
    if values.is_empty() {
        return 0;
    }

    let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
    for &v in values {
        *counts.entry(v).or_insert(0) += 1;
    }

    let mode_of = |pred: &dyn Fn(i64) -> bool| -> Option<i64> {
        counts
            .iter()
            .filter(|(v, _)| pred(**v))
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(v, _)| *v)
    };

    mode_of(&|v| v > 0).or_else(|| mode_of(&|_| true)).unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn cycle(program: &str, start_secs: i64, duration: f64) -> ProgramCycle {
        let start = Utc.with_ymd_and_hms(2025, 7, 14, 8, 0, 0).unwrap()
            + chrono::Duration::seconds(start_secs);
        ProgramCycle {
            machine_name: "Yasda 1 - 1013".into(),
            program_name: program.into(),
            start,
            end: start + chrono::Duration::seconds(duration as i64),
            duration_secs: duration,
        }
    }

    fn running_log(program: &str, spindle: i32, feed: i32) -> StatusLogEntry {
        StatusLogEntry {
            timestamp: Utc.with_ymd_and_hms(2025, 7, 14, 8, 0, 0).unwrap(),
            status_text: "Running".into(),
            spindle_speed: Some(spindle),
            feed_rate: Some(feed),
            current_program: Some(program.into()),
        }
    }

    #[test]
    fn mode_prefers_nonzero_observations() {
        assert_eq!(mode_preferring_nonzero(Some(&vec![0, 0, 0, 8000, 8000, 12000])), 8000);
        assert_eq!(mode_preferring_nonzero(Some(&vec![0, 0, 0])), 0);
        assert_eq!(mode_preferring_nonzero(Some(&vec![])), 0);
        assert_eq!(mode_preferring_nonzero(None), 0);
        // Tie between nonzero values resolves to the smallest.
        assert_eq!(mode_preferring_nonzero(Some(&vec![5, 5, 9, 9])), 5);
    }

    #[test]
    fn efficiency_is_capped_and_banded() {
        let vocab = StatusVocabulary::default();
        let cycles = vec![cycle("N1-1", 0, 600.0), cycle("N1-1", 700, 600.0)];
        let logs = vec![running_log("N1-1", 9000, 1200)];

        let mut targets = HashMap::new();
        targets.insert(
            "N1-1".to_string(),
            ProgramTarget {
                target_secs: 550.0,
                target_spindle: 9500,
                target_feed: 1250,
                quantity: 2,
                notes: "first article".into(),
            },
        );

        let report = compute(&vocab, &cycles, &logs, None, &targets);
        assert_eq!(report.len(), 1);
        let row = &report[0];

        assert_eq!(row.total_cycle_secs, 1200.0);
        assert_eq!(row.actual_per_piece_secs, 600.0);
        // 550 / 600 = 91.67 %
        assert!((row.efficiency_pct - 91.67).abs() < 0.01);
        assert_eq!(row.band, EfficiencyBand::Good);
        assert_eq!(row.spindle_mode, 9000);
        assert_eq!(row.feed_rate_mode, 1200);

        // Target far above actual caps at 100 %.
        targets.get_mut("N1-1").unwrap().target_secs = 10_000.0;
        let report = compute(&vocab, &cycles, &logs, None, &targets);
        assert_eq!(report[0].efficiency_pct, 100.0);
    }

    #[test]
    fn band_thresholds() {
        assert_eq!(EfficiencyBand::from_percent(85.0), EfficiencyBand::Good);
        assert_eq!(EfficiencyBand::from_percent(84.9), EfficiencyBand::Average);
        assert_eq!(EfficiencyBand::from_percent(75.0), EfficiencyBand::Average);
        assert_eq!(EfficiencyBand::from_percent(74.9), EfficiencyBand::Bad);
    }

    #[test]
    fn missing_target_defaults_to_zero_efficiency() {
        let vocab = StatusVocabulary::default();
        let cycles = vec![cycle("N2-1", 0, 300.0)];
        let report = compute(&vocab, &cycles, &[], None, &HashMap::new());
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].efficiency_pct, 0.0);
        assert_eq!(report[0].band, EfficiencyBand::Bad);
        assert_eq!(report[0].quantity, 1);
    }

    #[test]
    fn main_filter_narrows_programs() {
        let vocab = StatusVocabulary::default();
        let cycles = vec![cycle("N1-1", 0, 100.0), cycle("N2-1", 200, 100.0)];
        let report = compute(&vocab, &cycles, &[], Some("n1"), &HashMap::new());
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].program_name, "N1-1");
    }

    #[test]
    fn non_running_samples_do_not_feed_modes() {
        let vocab = StatusVocabulary::default();
        let cycles = vec![cycle("N1-1", 0, 100.0)];
        let idle = StatusLogEntry {
            status_text: "Idle".into(),
            ..running_log("N1-1", 7000, 900)
        };
        let report = compute(&vocab, &cycles, &[idle], None, &HashMap::new());
        assert_eq!(report[0].spindle_mode, 0);
        assert_eq!(report[0].feed_rate_mode, 0);
    }
}
