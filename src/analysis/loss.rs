// =============================================================================
// Loss-Time Decomposition
// =============================================================================
//
// Aggregates the loss stretches recorded during session segmentation into
// per-category totals (category = the status text observed during the
// loss), plus a per-piece variant scaled by the total quantity produced
// across all sessions.
// =============================================================================

use std::collections::BTreeMap;

use super::sessions::Session;

/// One slice of the loss pie: a status category and its accumulated
/// duration.
#[derive(Debug, Clone, PartialEq)]
pub struct LossBreakdownEntry {
    pub category: String,
    pub duration_secs: f64,
}

/// Total loss per status category across all sessions.
pub fn breakdown(sessions: &[Session]) -> Vec<LossBreakdownEntry> {
    let mut totals: BTreeMap<String, f64> = BTreeMap::new();
    for session in sessions {
        for (category, secs) in &session.loss_segments {
            *totals.entry(category.clone()).or_insert(0.0) += secs;
        }
    }

    totals
        .into_iter()
        .map(|(category, duration_secs)| LossBreakdownEntry {
            category,
            duration_secs,
        })
        .collect()
}

/// Per-piece loss per category: the totals divided by the quantity summed
/// over all sessions. Empty when no pieces were produced.
pub fn breakdown_per_piece(sessions: &[Session]) -> Vec<LossBreakdownEntry> {
    let total_quantity: i64 = sessions.iter().map(|s| i64::from(s.quantity)).sum();
    if total_quantity <= 0 {
        return Vec::new();
    }

    breakdown(sessions)
        .into_iter()
        .map(|entry| LossBreakdownEntry {
            duration_secs: entry.duration_secs / total_quantity as f64,
            ..entry
        })
        .collect()
}
