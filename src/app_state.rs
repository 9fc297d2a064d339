// =============================================================================
// Central Application State — latest-state registers
// =============================================================================
//
// The single source of truth shared by every worker. Two registers live
// here:
//
//   - `live`: the latest normalized MachineState per machine, consumed by
//     the snapshot writer and the derivation engines.
//   - `db_latest`: the latest sample queued for the status log writer,
//     carrying the pre-normalization raw blob.
//
// Each machine's slots are written only by that machine's own polling
// worker (single-writer-per-key); everyone else reads. Consumers never see
// the live maps — all access goes through snapshot-producing methods that
// hand out clones.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::AppConfig;
use crate::types::{MachineState, StatusRecord};

/// Shared state for the whole backend, wrapped in `Arc` at startup.
pub struct AppState {
    pub config: Arc<AppConfig>,

    /// Latest normalized state per machine (last-writer-wins per key).
    live: RwLock<HashMap<String, MachineState>>,

    /// Latest sample queued for the status log writer.
    db_latest: RwLock<HashMap<String, StatusRecord>>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            live: RwLock::new(HashMap::new()),
            db_latest: RwLock::new(HashMap::new()),
        }
    }

    /// Publish one machine's fresh sample into both registers. Called only
    /// by the machine's own polling worker.
    pub fn publish_sample(&self, machine: &str, state: MachineState, record: StatusRecord) {
        self.live.write().insert(machine.to_string(), state);
        self.db_latest.write().insert(machine.to_string(), record);
    }

    /// Ordered snapshot of the live register, ready for serialisation into
    /// the snapshot JSON document.
    pub fn snapshot_live(&self) -> BTreeMap<String, MachineState> {
        self.live
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Snapshot of the "latest for DB write" register.
    pub fn snapshot_db_latest(&self) -> Vec<(String, StatusRecord)> {
        self.db_latest
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Names of every machine that has reported at least one sample. The
    /// derivation engines iterate this set.
    pub fn machine_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.live.read().keys().cloned().collect();
        names.sort();
        names
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_state(status: &str) -> MachineState {
        MachineState {
            status_text: status.into(),
            spindle_speed: None,
            feed_rate: None,
            current_program: None,
            moden: None,
            motion: None,
            state_number: None,
            ovr_spindle: None,
            ovr_feed: None,
            status: None,
            timestamp_processed: 0.0,
            raw_status_key_used: None,
            raw_status_value: None,
        }
    }

    fn sample_record(status: &str) -> StatusRecord {
        StatusRecord {
            timestamp: Utc::now(),
            status_text: status.into(),
            spindle_speed: None,
            feed_rate: None,
            current_program: None,
            raw: serde_json::json!({}),
        }
    }

    #[test]
    fn publish_updates_both_registers() {
        let state = AppState::new(AppConfig::default());
        state.publish_sample("Yasda 1 - 1013", sample_state("Running"), sample_record("Running"));
        state.publish_sample("Yasda 1 - 1013", sample_state("Waiting"), sample_record("Waiting"));

        let live = state.snapshot_live();
        assert_eq!(live.len(), 1);
        assert_eq!(live["Yasda 1 - 1013"].status_text, "Waiting");

        let latest = state.snapshot_db_latest();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].1.status_text, "Waiting");
    }

    #[test]
    fn machine_names_are_sorted() {
        let state = AppState::new(AppConfig::default());
        state.publish_sample("Wele 3 - 1007", sample_state("Idle"), sample_record("Idle"));
        state.publish_sample("HPM600 - 1010", sample_state("Idle"), sample_record("Idle"));
        assert_eq!(
            state.machine_names(),
            vec!["HPM600 - 1010".to_string(), "Wele 3 - 1007".to_string()]
        );
    }
}
