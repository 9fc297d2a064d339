// =============================================================================
// Shared types used across the shopfloor monitoring backend
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Raw telemetry values
// =============================================================================

/// A raw value read from one OPC UA variable.
///
/// Vendors are sloppy about types: the same controller may expose a status
/// word as an integer, a float or a numeric string depending on firmware.
/// Every consumer therefore goes through [`RawValue::as_index`] rather than
/// matching on the variant directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl RawValue {
    /// Coerce to an integer index the way the status tables expect:
    /// floats truncate, strings are parsed as floats first, anything
    /// unparseable is `None`.
    pub fn as_index(&self) -> Option<i64> {
        match self {
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.is_finite() => Some(*f as i64),
            Self::Float(_) => None,
            Self::Text(s) => s.trim().parse::<f64>().ok().map(|f| f as i64),
        }
    }

    /// String form used for program-name candidates; empty after trimming
    /// means "absent".
    pub fn as_text(&self) -> Option<String> {
        let s = match self {
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Text(s) => s.trim().to_string(),
        };
        if s.is_empty() {
            None
        } else {
            Some(s)
        }
    }
}

impl std::fmt::Display for RawValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

// =============================================================================
// MachineState — the normalizer's output
// =============================================================================

/// Canonical per-sample machine state.
///
/// Serialised field names match the snapshot JSON document consumed by the
/// dashboards; absent fields are omitted entirely rather than written as
/// nulls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineState {
    #[serde(rename = "Status_Text")]
    pub status_text: String,

    #[serde(rename = "Spindle_Speed", skip_serializing_if = "Option::is_none")]
    pub spindle_speed: Option<i32>,

    #[serde(rename = "FeedRate_mm_per_min", skip_serializing_if = "Option::is_none")]
    pub feed_rate: Option<i32>,

    #[serde(rename = "Current_Program", skip_serializing_if = "Option::is_none")]
    pub current_program: Option<String>,

    #[serde(rename = "Moden", skip_serializing_if = "Option::is_none")]
    pub moden: Option<RawValue>,

    #[serde(rename = "Motion", skip_serializing_if = "Option::is_none")]
    pub motion: Option<RawValue>,

    #[serde(rename = "State_Number", skip_serializing_if = "Option::is_none")]
    pub state_number: Option<RawValue>,

    #[serde(rename = "OvrSpindle", skip_serializing_if = "Option::is_none")]
    pub ovr_spindle: Option<RawValue>,

    #[serde(rename = "OvrFeed", skip_serializing_if = "Option::is_none")]
    pub ovr_feed: Option<RawValue>,

    #[serde(rename = "Status", skip_serializing_if = "Option::is_none")]
    pub status: Option<RawValue>,

    /// Seconds since the Unix epoch at normalization time.
    #[serde(rename = "Timestamp_Processed")]
    pub timestamp_processed: f64,

    /// Which raw variable (or variable pair) produced the status text.
    #[serde(rename = "Raw_Status_Key_Used", skip_serializing_if = "Option::is_none")]
    pub raw_status_key_used: Option<String>,

    #[serde(rename = "Raw_Status_Value", skip_serializing_if = "Option::is_none")]
    pub raw_status_value: Option<String>,
}

// =============================================================================
// Persistence-facing records
// =============================================================================

/// Latest sample of one machine, queued for the status log writer.
///
/// The timestamp is captured at poll time with second precision; the raw
/// blob preserves the pre-normalization reading map.
#[derive(Debug, Clone)]
pub struct StatusRecord {
    pub timestamp: DateTime<Utc>,
    pub status_text: String,
    pub spindle_speed: Option<i32>,
    pub feed_rate: Option<i32>,
    pub current_program: Option<String>,
    pub raw: serde_json::Value,
}

/// One row of the monthly status log, as read back for derivation.
#[derive(Debug, Clone)]
pub struct StatusLogEntry {
    pub timestamp: DateTime<Utc>,
    pub status_text: String,
    pub spindle_speed: Option<i32>,
    pub feed_rate: Option<i32>,
    pub current_program: Option<String>,
}

/// Runtime/idle/other seconds for one machine over one shift window.
#[derive(Debug, Clone)]
pub struct ShiftMetric {
    pub machine_name: String,
    pub shift_name: String,
    pub runtime_secs: f64,
    pub idle_secs: f64,
    pub other_secs: f64,
    pub shift_start: DateTime<Utc>,
    pub shift_end: DateTime<Utc>,
}

/// A maximal contiguous Running interval with the program captured at its
/// start.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramCycle {
    pub machine_name: String,
    pub program_name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_secs: f64,
}

// =============================================================================
// Duration formatting
// =============================================================================

/// Format seconds as `HH:MM` (used by shift rows shown on the dashboard).
pub fn format_hhmm(seconds: f64) -> String {
    let total = seconds.max(0.0) as i64;
    format!("{:02}:{:02}", total / 3600, (total % 3600) / 60)
}

/// Format seconds as `HH:MM:SS` (used by session notes and analysis rows).
pub fn format_hhmmss(seconds: f64) -> String {
    let total = seconds.max(0.0) as i64;
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_coercion_tolerates_strings_and_floats() {
        assert_eq!(RawValue::Int(3).as_index(), Some(3));
        assert_eq!(RawValue::Float(2.9).as_index(), Some(2));
        assert_eq!(RawValue::Text("4".into()).as_index(), Some(4));
        assert_eq!(RawValue::Text(" 5.0 ".into()).as_index(), Some(5));
        assert_eq!(RawValue::Text("garbage".into()).as_index(), None);
        assert_eq!(RawValue::Bool(true).as_index(), Some(1));
        assert_eq!(RawValue::Float(f64::NAN).as_index(), None);
    }

    #[test]
    fn text_coercion_trims_and_drops_empty() {
        assert_eq!(RawValue::Text("  N12-3 ".into()).as_text(), Some("N12-3".into()));
        assert_eq!(RawValue::Text("   ".into()).as_text(), None);
        assert_eq!(RawValue::Int(77).as_text(), Some("77".into()));
    }

    #[test]
    fn machine_state_serialises_with_snapshot_field_names() {
        let state = MachineState {
            status_text: "Running".into(),
            spindle_speed: Some(12000),
            feed_rate: None,
            current_program: Some("N1-1".into()),
            moden: None,
            motion: None,
            state_number: Some(RawValue::Int(2)),
            ovr_spindle: None,
            ovr_feed: None,
            status: None,
            timestamp_processed: 1_700_000_000.0,
            raw_status_key_used: Some("State_Number".into()),
            raw_status_value: Some("2".into()),
        };

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["Status_Text"], "Running");
        assert_eq!(json["Spindle_Speed"], 12000);
        assert_eq!(json["Current_Program"], "N1-1");
        // Absent fields must be omitted, not serialised as null.
        assert!(json.get("FeedRate_mm_per_min").is_none());
        assert!(json.get("Moden").is_none());
    }

    #[test]
    fn hhmm_and_hhmmss_formatting() {
        assert_eq!(format_hhmm(0.0), "00:00");
        assert_eq!(format_hhmm(27_000.0), "07:30");
        assert_eq!(format_hhmmss(3_661.0), "01:01:01");
        assert_eq!(format_hhmmss(-5.0), "00:00:00");
    }
}
