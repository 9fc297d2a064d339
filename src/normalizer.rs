// =============================================================================
// Status Normalizer — vendor status tables & program-id construction
// =============================================================================
//
// Pure transformation from one raw OPC UA reading map to a canonical
// MachineState. No I/O happens here; every quirk of the vendor controllers
// (status words as floats or strings, composite Makino program ids, the
// half-dozen incompatible status tables) is absorbed in this module so that
// everything downstream sees one vocabulary.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::MachineFamily;
use crate::types::{MachineState, RawValue};

/// Status text emitted when a raw status value exists but cannot be coerced
/// to an integer index, or when an index has no table entry.
pub const UNDEFINED_STATUS: &str = "Undefined Status";

/// Status text emitted when no status variable is present at all.
pub const STATUS_NA: &str = "N/A";

// =============================================================================
// Status tables
// =============================================================================

/// Fanuc / Yasda controllers (also Mitsubishi-Wele and the generic
/// fallback): plain integer status word.
fn fanuc_style_status(idx: i64) -> &'static str {
    match idx {
        0 => "Disconnected",
        1 => "Connected but not sending data",
        2 => "Running",
        3 => "Manual mode",
        4 => "Interrupted",
        5 => "Waiting",
        _ => UNDEFINED_STATUS,
    }
}

/// Mitsubishi controllers on the Quaser machines: richer state machine.
fn quaser_status(idx: i64) -> &'static str {
    match idx {
        0 => "NC Reset",
        1 => "Emergency",
        2 => "Ready",
        3 => "Running",
        4 => "With Synchronization",
        5 => "Waiting",
        6 => "Stop",
        7 => "Hold",
        _ => UNDEFINED_STATUS,
    }
}

/// Heidenhain TNC controllers (HSM / HPM / P500): same shape as Fanuc but
/// read from `State_Number`.
fn heidenhain_status(idx: i64) -> &'static str {
    fanuc_style_status(idx)
}

/// Makino controllers report a `(Moden, Motion)` pair. A handful of pairs
/// have exact entries; everything else falls back to the Moden-only row.
fn makino_status(moden: Option<i64>, motion: Option<i64>) -> &'static str {
    match (moden, motion) {
        (Some(10), Some(1)) => return "Running",
        (Some(10), Some(0)) => return "Ready",
        (None, None) => return STATUS_NA,
        _ => {}
    }

    let Some(moden) = moden else {
        return UNDEFINED_STATUS;
    };
    match moden {
        0 => "MDI",
        1 => "Memory",
        2 => "****",
        3 => "Edit",
        4 => "Handle",
        5 => "JOG",
        6 => "Teach in JOG",
        7 => "Teach in Handle",
        8 => "INC·feed",
        9 => "Reference",
        11 => "TEST",
        _ => UNDEFINED_STATUS,
    }
}

// =============================================================================
// Normalization
// =============================================================================

/// Normalize one raw reading map into a canonical [`MachineState`].
///
/// Deterministic and side-effect free: the same inputs always produce the
/// same output (`now` is supplied by the caller so the processing timestamp
/// is part of the inputs).
pub fn normalize(
    machine_name: &str,
    family: MachineFamily,
    raw: &BTreeMap<String, RawValue>,
    now: DateTime<Utc>,
) -> MachineState {
    let (status_text, raw_status_key_used, raw_status_value) =
        derive_status(machine_name, family, raw);

    let current_program = match family {
        MachineFamily::Makino => makino_composite_program(machine_name, raw),
        _ => candidate_program_name(raw),
    };

    MachineState {
        status_text,
        spindle_speed: int_field(machine_name, raw, "Spindle"),
        feed_rate: int_field(machine_name, raw, "FeedRate"),
        current_program,
        moden: raw.get("Moden").cloned(),
        motion: raw.get("Motion").cloned(),
        state_number: raw.get("State_Number").cloned(),
        ovr_spindle: raw.get("OvrSpindle").cloned(),
        ovr_feed: raw.get("OvrFeed").cloned(),
        status: raw.get("Status").cloned(),
        timestamp_processed: now.timestamp_millis() as f64 / 1000.0,
        raw_status_key_used,
        raw_status_value,
    }
}

/// Resolve the status text plus the provenance fields describing which raw
/// variable(s) produced it.
fn derive_status(
    machine_name: &str,
    family: MachineFamily,
    raw: &BTreeMap<String, RawValue>,
) -> (String, Option<String>, Option<String>) {
    match family {
        MachineFamily::Makino => {
            let moden_raw = raw.get("Moden");
            let motion_raw = raw.get("Motion");
            let moden = index_of(machine_name, "Moden", moden_raw);
            let motion = index_of(machine_name, "Motion", motion_raw);

            let text = makino_status(moden, motion).to_string();
            let value = format!(
                "Moden:{}, Motion:{}",
                display_or_none(moden_raw),
                display_or_none(motion_raw)
            );
            (text, Some("Moden_Motion".to_string()), Some(value))
        }

        MachineFamily::FanucYasda | MachineFamily::MitsubishiWele => {
            indexed_status(machine_name, raw, "Status", fanuc_style_status)
        }

        MachineFamily::MitsubishiQuaser => {
            indexed_status(machine_name, raw, "State_Number", quaser_status)
        }

        MachineFamily::Heidenhain => {
            indexed_status(machine_name, raw, "State_Number", heidenhain_status)
        }

        MachineFamily::Generic => {
            if raw.contains_key("Status") {
                indexed_status(machine_name, raw, "Status", fanuc_style_status)
            } else if raw.contains_key("State_Number") {
                indexed_status(machine_name, raw, "State_Number", fanuc_style_status)
            } else {
                warn!(
                    machine = %machine_name,
                    "neither 'Status' nor 'State_Number' present in raw data"
                );
                (STATUS_NA.to_string(), None, None)
            }
        }
    }
}

/// Look up a single-variable status: absent variable means `N/A`, an
/// unconvertible value means `Undefined Status`.
fn indexed_status(
    machine_name: &str,
    raw: &BTreeMap<String, RawValue>,
    key: &str,
    table: fn(i64) -> &'static str,
) -> (String, Option<String>, Option<String>) {
    let value = raw.get(key);
    let text = match value {
        None => STATUS_NA,
        Some(v) => match v.as_index() {
            Some(idx) => table(idx),
            None => {
                warn!(
                    machine = %machine_name,
                    variable = key,
                    value = %v,
                    "could not convert status value to an integer"
                );
                UNDEFINED_STATUS
            }
        },
    };

    (
        text.to_string(),
        Some(key.to_string()),
        value.map(|v| v.to_string()),
    )
}

fn index_of(machine_name: &str, variable: &str, value: Option<&RawValue>) -> Option<i64> {
    let value = value?;
    let idx = value.as_index();
    if idx.is_none() {
        warn!(
            machine = %machine_name,
            variable,
            value = %value,
            "could not convert value to an integer, treating as absent"
        );
    }
    idx
}

fn display_or_none(value: Option<&RawValue>) -> String {
    value.map_or_else(|| "None".to_string(), |v| v.to_string())
}

fn int_field(machine_name: &str, raw: &BTreeMap<String, RawValue>, key: &str) -> Option<i32> {
    let value = raw.get(key)?;
    match value.as_index().and_then(|v| i32::try_from(v).ok()) {
        Some(v) => Some(v),
        None => {
            warn!(
                machine = %machine_name,
                variable = key,
                value = %value,
                "could not convert value to an integer"
            );
            None
        }
    }
}

// =============================================================================
// Program identifiers
// =============================================================================

/// Build the composite program id used on the Makino machines:
/// `N<Program_num>-<Setting_num><sub-process letter><Program_id>`.
///
/// `Program_num` contributes only when nonzero; `Sub_process_num` maps
/// 1..=26 to `A`..=`Z` and 0 to nothing; `Program_id` contributes only when
/// nonzero. A trailing dash left by an absent tail is stripped; an empty
/// composite means no program.
fn makino_composite_program(
    machine_name: &str,
    raw: &BTreeMap<String, RawValue>,
) -> Option<String> {
    let mut composite = String::new();

    if let Some(num) = index_of(machine_name, "Program_num", raw.get("Program_num")) {
        if num != 0 {
            composite.push_str(&format!("N{num}-"));
        }
    }

    if let Some(setting) = index_of(machine_name, "Setting_num", raw.get("Setting_num")) {
        composite.push_str(&setting.to_string());
    }

    if let Some(sub) = index_of(machine_name, "Sub_process_num", raw.get("Sub_process_num")) {
        match sub {
            1..=26 => composite.push((b'A' + (sub as u8) - 1) as char),
            0 => {}
            _ => warn!(
                machine = %machine_name,
                sub_process_num = sub,
                "Sub_process_num out of range 1-26, skipping letter"
            ),
        }
    }

    if let Some(id) = index_of(machine_name, "Program_id", raw.get("Program_id")) {
        if id != 0 {
            composite.push_str(&id.to_string());
        }
    }

    let composite = composite.strip_suffix('-').unwrap_or(&composite);
    if composite.is_empty() {
        None
    } else {
        Some(composite.to_string())
    }
}

/// Non-Makino controllers expose the active program under one of several
/// node names; the first non-empty candidate wins.
fn candidate_program_name(raw: &BTreeMap<String, RawValue>) -> Option<String> {
    const CANDIDATES: [&str; 6] = [
        "Program",
        "Current_Program",
        "ProgramName",
        "PathProgramName",
        "ActiveProgramName",
        "PROGN",
    ];

    CANDIDATES
        .iter()
        .filter_map(|key| raw.get(*key))
        .find_map(RawValue::as_text)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw(entries: &[(&str, RawValue)]) -> BTreeMap<String, RawValue> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 14, 8, 0, 0).unwrap()
    }

    #[test]
    fn makino_composite_with_all_parts() {
        let map = raw(&[
            ("Program_num", RawValue::Int(1234)),
            ("Setting_num", RawValue::Int(5)),
            ("Sub_process_num", RawValue::Int(2)),
            ("Program_id", RawValue::Int(77)),
        ]);
        let state = normalize("Makino V77 - 1000", MachineFamily::Makino, &map, at());
        assert_eq!(state.current_program.as_deref(), Some("N1234-5B77"));
    }

    #[test]
    fn makino_composite_zero_program_num_drops_prefix() {
        let map = raw(&[
            ("Program_num", RawValue::Int(0)),
            ("Setting_num", RawValue::Int(5)),
            ("Sub_process_num", RawValue::Int(2)),
            ("Program_id", RawValue::Int(77)),
        ]);
        let state = normalize("Makino V77 - 1000", MachineFamily::Makino, &map, at());
        assert_eq!(state.current_program.as_deref(), Some("5B77"));
    }

    #[test]
    fn makino_composite_absent_parts_means_no_program() {
        let state = normalize("Makino V77 - 1000", MachineFamily::Makino, &raw(&[]), at());
        assert_eq!(state.current_program, None);
    }

    #[test]
    fn makino_trailing_dash_is_stripped() {
        let map = raw(&[("Program_num", RawValue::Int(42))]);
        let state = normalize("Makino F5(1) - 1008", MachineFamily::Makino, &map, at());
        assert_eq!(state.current_program.as_deref(), Some("N42"));
    }

    #[test]
    fn makino_sub_process_out_of_range_appends_nothing() {
        let map = raw(&[
            ("Setting_num", RawValue::Int(3)),
            ("Sub_process_num", RawValue::Int(30)),
        ]);
        let state = normalize("Makino V33 - 1012", MachineFamily::Makino, &map, at());
        assert_eq!(state.current_program.as_deref(), Some("3"));
    }

    #[test]
    fn makino_status_pair_and_fallback() {
        let running = raw(&[("Moden", RawValue::Int(10)), ("Motion", RawValue::Int(1))]);
        let state = normalize("Makino V77 - 1000", MachineFamily::Makino, &running, at());
        assert_eq!(state.status_text, "Running");
        assert_eq!(state.raw_status_key_used.as_deref(), Some("Moden_Motion"));
        assert_eq!(
            state.raw_status_value.as_deref(),
            Some("Moden:10, Motion:1")
        );

        // Unknown pair falls back to the Moden-only row.
        let edit = raw(&[("Moden", RawValue::Int(3)), ("Motion", RawValue::Int(7))]);
        let state = normalize("Makino V77 - 1000", MachineFamily::Makino, &edit, at());
        assert_eq!(state.status_text, "Edit");

        // Nothing at all is N/A.
        let state = normalize("Makino V77 - 1000", MachineFamily::Makino, &raw(&[]), at());
        assert_eq!(state.status_text, "N/A");
    }

    #[test]
    fn fanuc_status_from_integer_string_and_float() {
        let map = raw(&[("Status", RawValue::Text("2".into()))]);
        let state = normalize("Yasda 1 - 1013", MachineFamily::FanucYasda, &map, at());
        assert_eq!(state.status_text, "Running");

        let map = raw(&[("Status", RawValue::Float(4.0))]);
        let state = normalize("Wele 3 - 1007", MachineFamily::MitsubishiWele, &map, at());
        assert_eq!(state.status_text, "Interrupted");
    }

    #[test]
    fn unconvertible_status_resolves_to_undefined() {
        let map = raw(&[("Status", RawValue::Text("ERR".into()))]);
        let state = normalize("Yasda 1 - 1013", MachineFamily::FanucYasda, &map, at());
        assert_eq!(state.status_text, "Undefined Status");
    }

    #[test]
    fn quaser_uses_state_number_table() {
        let map = raw(&[("State_Number", RawValue::Int(3))]);
        let state = normalize("Quaser 4 - 1005", MachineFamily::MitsubishiQuaser, &map, at());
        assert_eq!(state.status_text, "Running");
        assert_eq!(state.raw_status_key_used.as_deref(), Some("State_Number"));

        let map = raw(&[("State_Number", RawValue::Int(7))]);
        let state = normalize("Quaser 4 - 1005", MachineFamily::MitsubishiQuaser, &map, at());
        assert_eq!(state.status_text, "Hold");
    }

    #[test]
    fn generic_machine_without_status_variables_is_na() {
        let map = raw(&[("Spindle", RawValue::Int(8000))]);
        let state = normalize("OKK - 1015", MachineFamily::Generic, &map, at());
        assert_eq!(state.status_text, "N/A");
        assert_eq!(state.raw_status_key_used, None);
        assert_eq!(state.spindle_speed, Some(8000));
    }

    #[test]
    fn candidate_program_keys_scanned_in_order() {
        let map = raw(&[
            ("ProgramName", RawValue::Text("BACKUP.NC".into())),
            ("Current_Program", RawValue::Text(" N7-2 ".into())),
        ]);
        let state = normalize("HSM800 - 1011", MachineFamily::Heidenhain, &map, at());
        assert_eq!(state.current_program.as_deref(), Some("N7-2"));

        let map = raw(&[("Program", RawValue::Text("  ".into()))]);
        let state = normalize("HSM800 - 1011", MachineFamily::Heidenhain, &map, at());
        assert_eq!(state.current_program, None);
    }

    #[test]
    fn spindle_and_feed_tolerate_floats_and_reject_garbage() {
        let map = raw(&[
            ("Spindle", RawValue::Float(11999.7)),
            ("FeedRate", RawValue::Text("bad".into())),
        ]);
        let state = normalize("Yasda 2 - 1014", MachineFamily::FanucYasda, &map, at());
        assert_eq!(state.spindle_speed, Some(11999));
        assert_eq!(state.feed_rate, None);
    }

    #[test]
    fn normalize_is_deterministic() {
        let map = raw(&[
            ("Status", RawValue::Int(2)),
            ("Spindle", RawValue::Int(9000)),
            ("Program", RawValue::Text("N3-1".into())),
        ]);
        let a = normalize("Yasda 3 - 1001", MachineFamily::FanucYasda, &map, at());
        let b = normalize("Yasda 3 - 1001", MachineFamily::FanucYasda, &map, at());
        assert_eq!(
            serde_json::to_value(&a).unwrap(),
            serde_json::to_value(&b).unwrap()
        );
    }
}
