// =============================================================================
// Application Configuration — machines file, vocabularies, tunables
// =============================================================================
//
// Everything the backend can be tuned with lives in one JSON file whose path
// is the process's single CLI argument. Every field carries a serde default
// so that older config files keep loading as fields are added.
//
// OPC UA credentials are deliberately NOT part of the file; they come from
// the OPC_UA_USER / OPC_UA_PASSWORD environment variables.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_db_url() -> String {
    "postgres://postgres@localhost:5432/shopfloor".to_string()
}

fn default_db_max_connections() -> u32 {
    300
}

fn default_poll_interval_secs() -> u64 {
    1
}

fn default_snapshot_interval_secs() -> u64 {
    1
}

fn default_status_log_interval_secs() -> u64 {
    10
}

fn default_shift_calc_interval_secs() -> u64 {
    5
}

fn default_program_report_interval_secs() -> u64 {
    10
}

fn default_session_gap_threshold_secs() -> u64 {
    300
}

fn default_retention_hours() -> u64 {
    720
}

fn default_snapshot_path() -> String {
    "machine_data.json".to_string()
}

fn default_shifts() -> Vec<ShiftDef> {
    vec![
        ShiftDef { name: "shift_1".into(), start_hour: 8, end_hour: 16 },
        ShiftDef { name: "shift_2".into(), start_hour: 16, end_hour: 0 },
        ShiftDef { name: "shift_3".into(), start_hour: 0, end_hour: 8 },
    ]
}

fn default_running_statuses() -> Vec<String> {
    ["Running", "Operating", "Processing", "Cycle Start", "Active"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_idle_statuses() -> Vec<String> {
    [
        "Idle",
        "Ready",
        "Standby",
        "Program End",
        "Manual mode",
        "Power On",
        "M-Code Stop",
        "Program Stop",
        "Emergency Stop",
        "Fault",
        "NC Reset",
        "Emergency",
        "With Synchronization",
        "Waiting",
        "Stop",
        "Hold",
        "Disconnected",
        "Connected but not sending data",
        "Interrupted",
        "Faulted",
        "Alarm",
        "Unknown/Offline",
        "Undefined Status",
        "N/A",
        "MDI",
        "Setup",
        "Cooling",
        "Tool Change",
        // Makino Moden-only modes: the machine is powered but not cutting.
        "Memory",
        "****",
        "Edit",
        "Handle",
        "JOG",
        "Teach in JOG",
        "Teach in Handle",
        "INC·feed",
        "Reference",
        "TEST",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_other_statuses() -> Vec<String> {
    ["Error", "Maintenance", "Testing", "Paused", "Suspended", "Warmup", "Dry Run"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_display_order() -> Vec<String> {
    [
        "Makino V77 - 1000",
        "Makino V33 - 1012",
        "Makino F5(1) - 1008",
        "Makino F5(2) - 1009",
        "Yasda 1 - 1013",
        "Yasda 2 - 1014",
        "Yasda 3 - 1001",
        "OKK - 1015",
        "Mitsui Seiki - 1002",
        "HSM800 - 1011",
        "HPM600 - 1010",
        "HPM800 - 1003",
        "P500 - 1004",
        "Wele 3 - 1007",
        "Wele 4 - 1006",
        "Quaser 4 - 1005",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

// =============================================================================
// Machine families
// =============================================================================

/// Controller family of a machine. Selects the status dispatch table and,
/// for Makino, the composite program-id construction.
///
/// This is an explicit config field; machines are never classified by
/// sniffing their display name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineFamily {
    Makino,
    FanucYasda,
    MitsubishiWele,
    MitsubishiQuaser,
    Heidenhain,
    Generic,
}

impl Default for MachineFamily {
    fn default() -> Self {
        Self::Generic
    }
}

impl std::fmt::Display for MachineFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Makino => write!(f, "makino"),
            Self::FanucYasda => write!(f, "fanuc_yasda"),
            Self::MitsubishiWele => write!(f, "mitsubishi_wele"),
            Self::MitsubishiQuaser => write!(f, "mitsubishi_quaser"),
            Self::Heidenhain => write!(f, "heidenhain"),
            Self::Generic => write!(f, "generic"),
        }
    }
}

// =============================================================================
// Config sections
// =============================================================================

/// One machine entry from the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub name: String,

    #[serde(default)]
    pub family: MachineFamily,

    /// `logical variable name -> OPC UA node id` for every variable to poll.
    pub variables: BTreeMap<String, String>,

    /// Per-machine endpoint override; falls back to the global `url`.
    #[serde(default)]
    pub url: Option<String>,
}

/// One shift definition. Hours are local wall time; the interval is
/// half-open `[start_hour, end_hour)` and `end_hour == 0` means midnight of
/// the next day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShiftDef {
    pub name: String,
    pub start_hour: u32,
    pub end_hour: u32,
}

/// The three closed status vocabularies used by every derivation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusVocabulary {
    #[serde(default = "default_running_statuses")]
    pub running: Vec<String>,

    #[serde(default = "default_idle_statuses")]
    pub idle: Vec<String>,

    #[serde(default = "default_other_statuses")]
    pub other: Vec<String>,
}

impl Default for StatusVocabulary {
    fn default() -> Self {
        Self {
            running: default_running_statuses(),
            idle: default_idle_statuses(),
            other: default_other_statuses(),
        }
    }
}

impl StatusVocabulary {
    pub fn is_running(&self, status: &str) -> bool {
        self.running.iter().any(|s| s == status)
    }

    pub fn is_idle(&self, status: &str) -> bool {
        self.idle.iter().any(|s| s == status)
    }

    pub fn is_other(&self, status: &str) -> bool {
        self.other.iter().any(|s| s == status)
    }

    /// Whether the status appears in any of the three vocabularies.
    pub fn knows(&self, status: &str) -> bool {
        self.is_running(status) || self.is_idle(status) || self.is_other(status)
    }

    /// The vocabularies must be pairwise disjoint: the shift calculator
    /// buckets every non-running segment as idle and derives "other" by
    /// subtraction, so an overlapping name would be double-counted.
    fn validate(&self) -> Result<()> {
        for status in &self.running {
            if self.is_idle(status) || self.is_other(status) {
                bail!("status '{status}' appears in more than one vocabulary");
            }
        }
        for status in &self.idle {
            if self.is_other(status) {
                bail!("status '{status}' appears in both idle and other vocabularies");
            }
        }
        Ok(())
    }
}

// =============================================================================
// AppConfig
// =============================================================================

/// Top-level configuration for the monitoring backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global OPC UA endpoint URL; individual machines may override it.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub machines: Vec<MachineConfig>,

    // --- Persistence -------------------------------------------------------
    #[serde(default = "default_db_url")]
    pub db_url: String,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    // --- Worker cadences (seconds) ----------------------------------------
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,

    #[serde(default = "default_status_log_interval_secs")]
    pub status_log_interval_secs: u64,

    #[serde(default = "default_shift_calc_interval_secs")]
    pub shift_calc_interval_secs: u64,

    #[serde(default = "default_program_report_interval_secs")]
    pub program_report_interval_secs: u64,

    // --- Analysis tunables -------------------------------------------------
    /// Gaps shorter than this stay inside a main-program session.
    #[serde(default = "default_session_gap_threshold_secs")]
    pub session_gap_threshold_secs: u64,

    /// Documented retention window for the status log. Enforcement is an
    /// operator concern; nothing in this process deletes rows.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    // --- Snapshot ----------------------------------------------------------
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,

    // --- Vocabularies & shifts --------------------------------------------
    #[serde(default)]
    pub vocabulary: StatusVocabulary,

    #[serde(default = "default_shifts")]
    pub shifts: Vec<ShiftDef>,

    /// Dashboard tile ordering. Presentation-only; carried through for the
    /// consumers of the snapshot file.
    #[serde(default = "default_display_order")]
    pub display_order: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserialises from defaults")
    }
}

impl AppConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            machines = config.machines.len(),
            "configuration loaded"
        );

        Ok(config)
    }

    /// Validate the loaded configuration. Called once at startup; any error
    /// here is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.machines.is_empty() {
            bail!("no machines configured");
        }

        self.vocabulary.validate()?;

        for shift in &self.shifts {
            if shift.start_hour >= 24 || shift.end_hour >= 24 {
                bail!("shift '{}' has an out-of-range hour", shift.name);
            }
            if shift.start_hour == shift.end_hour {
                bail!("shift '{}' has zero length", shift.name);
            }
        }

        for machine in &self.machines {
            if machine.endpoint_url(self.url.as_deref()).is_none() {
                warn!(
                    machine = %machine.name,
                    "machine has no endpoint URL (global or specific) and will be skipped"
                );
            }
            if machine.variables.is_empty() {
                bail!("machine '{}' has no variables configured", machine.name);
            }
        }

        Ok(())
    }

    /// Machines that can actually be polled (have an endpoint URL).
    pub fn pollable_machines(&self) -> impl Iterator<Item = &MachineConfig> {
        self.machines
            .iter()
            .filter(|m| m.endpoint_url(self.url.as_deref()).is_some())
    }
}

impl MachineConfig {
    /// Resolve this machine's endpoint: the per-machine override wins over
    /// the global URL.
    pub fn endpoint_url(&self, global: Option<&str>) -> Option<String> {
        self.url
            .as_deref()
            .or(global)
            .map(str::to_string)
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// OPC UA operator credentials, sourced from the environment only.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        let user = std::env::var("OPC_UA_USER")
            .context("OPC_UA_USER environment variable not set")?;
        let password = std::env::var("OPC_UA_PASSWORD")
            .context("OPC_UA_PASSWORD environment variable not set")?;
        Ok(Self { user, password })
    }
}

impl std::fmt::Debug for Credentials {
    // Never print the password, not even in debug logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let cfg: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.poll_interval_secs, 1);
        assert_eq!(cfg.status_log_interval_secs, 10);
        assert_eq!(cfg.shift_calc_interval_secs, 5);
        assert_eq!(cfg.session_gap_threshold_secs, 300);
        assert_eq!(cfg.db_max_connections, 300);
        assert_eq!(cfg.shifts.len(), 3);
        assert_eq!(cfg.shifts[1].end_hour, 0);
        assert!(cfg.vocabulary.is_running("Running"));
        assert!(cfg.vocabulary.is_idle("N/A"));
        assert!(cfg.vocabulary.is_other("Maintenance"));
    }

    #[test]
    fn default_idle_vocabulary_covers_makino_modes() {
        // Every Moden-only status the Makino dispatch table can emit must
        // classify as a known non-cutting state under the shipped config.
        let vocab = StatusVocabulary::default();
        for status in [
            "Memory",
            "****",
            "Edit",
            "Handle",
            "JOG",
            "Teach in JOG",
            "Teach in Handle",
            "INC·feed",
            "Reference",
            "TEST",
            "MDI",
            "Ready",
        ] {
            assert!(vocab.is_idle(status), "'{status}' missing from idle set");
            assert!(!vocab.is_running(status));
        }
    }

    #[test]
    fn default_vocabularies_are_disjoint() {
        let vocab = StatusVocabulary::default();
        assert!(vocab.validate().is_ok());
    }

    #[test]
    fn overlapping_vocabularies_are_rejected() {
        let vocab = StatusVocabulary {
            running: vec!["Running".into()],
            idle: vec!["Alarm".into()],
            other: vec!["Alarm".into()],
        };
        assert!(vocab.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_machine_list() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn machine_url_override_wins_over_global() {
        let machine: MachineConfig = serde_json::from_str(
            r#"{
                "name": "Yasda 1 - 1013",
                "family": "fanuc_yasda",
                "variables": { "Status": "ns=1;s=/1013/STATUS" },
                "url": "opc.tcp://192.168.0.13:4840/"
            }"#,
        )
        .unwrap();

        assert_eq!(machine.family, MachineFamily::FanucYasda);
        assert_eq!(
            machine.endpoint_url(Some("opc.tcp://192.168.0.2:4840/")),
            Some("opc.tcp://192.168.0.13:4840/".to_string())
        );

        let no_override = MachineConfig {
            url: None,
            ..machine
        };
        assert_eq!(
            no_override.endpoint_url(Some("opc.tcp://192.168.0.2:4840/")),
            Some("opc.tcp://192.168.0.2:4840/".to_string())
        );
        assert_eq!(no_override.endpoint_url(None), None);
    }

    #[test]
    fn zero_length_shift_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.machines.push(MachineConfig {
            name: "Test".into(),
            family: MachineFamily::Generic,
            variables: [("Status".to_string(), "ns=1;s=/1/STATUS".to_string())]
                .into_iter()
                .collect(),
            url: Some("opc.tcp://localhost:4840/".into()),
        });
        cfg.shifts = vec![ShiftDef { name: "broken".into(), start_hour: 8, end_hour: 8 }];
        assert!(cfg.validate().is_err());
    }
}
