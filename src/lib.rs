// =============================================================================
// Shopfloor Watch — CNC machine monitoring backend
// =============================================================================
//
// Polls every machine's OPC UA endpoint, normalizes vendor status words
// into one vocabulary, keeps a monthly-sharded status log in PostgreSQL,
// and derives shift utilization, program cycles and main-program session
// analytics from that log.
//
// The binary wires the workers together; dashboards consume the snapshot
// JSON file, the SQL tables, and the `analysis` module through this
// library crate.
// =============================================================================

pub mod analysis;
pub mod app_state;
pub mod config;
pub mod cycles;
pub mod db;
pub mod normalizer;
pub mod shift;
pub mod snapshot;
pub mod telemetry;
pub mod types;
