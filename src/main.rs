// =============================================================================
// Shopfloor Watch — Main Entry Point
// =============================================================================
//
// Startup: load config + credentials, connect the database pool, create the
// current month's tables, then spawn one polling worker per machine and the
// four periodic workers (snapshot, status log, shift engine, cycle engine).
// Termination signals cancel every worker, flush a final snapshot, close
// the pool and exit 0. Startup failures exit nonzero.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use shopfloor_watch::app_state::AppState;
use shopfloor_watch::config::{AppConfig, Credentials};
use shopfloor_watch::db::{status_log, Database};
use shopfloor_watch::shift::{engine as shift_engine, ShiftSchedule};
use shopfloor_watch::telemetry::TelemetryClient;
use shopfloor_watch::{cycles, snapshot};

/// Bound on the shutdown drain: workers that have not unwound by then are
/// abandoned and the process exits anyway.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Shopfloor Watch — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "shopfloor_config.json".to_string());

    let config = AppConfig::load(&config_path)?;
    config.validate().context("invalid configuration")?;
    let credentials = Credentials::from_env()?;

    info!(
        machines = config.machines.len(),
        poll_interval_secs = config.poll_interval_secs,
        "configuration validated"
    );

    // ── 2. Database pool & schema bootstrap ──────────────────────────────
    let db = Arc::new(
        Database::connect(&config.db_url, config.db_max_connections)
            .await
            .context("database pool initialization failed")?,
    );
    db.init(Utc::now())
        .await
        .context("database schema initialization failed")?;

    // ── 3. Shared state & cancellation ───────────────────────────────────
    let state = Arc::new(AppState::new(config.clone()));
    let token = CancellationToken::new();

    // ── 4. Per-machine telemetry pollers ─────────────────────────────────
    let poll_interval = std::time::Duration::from_secs(config.poll_interval_secs);
    let mut poller_handles = Vec::new();

    for machine in config.pollable_machines() {
        let url = machine
            .endpoint_url(config.url.as_deref())
            .expect("pollable machines always have a URL");

        let client = TelemetryClient::new(
            machine.name.clone(),
            machine.family,
            url,
            credentials.clone(),
            &machine.variables,
            poll_interval,
        );

        let poll_state = state.clone();
        let poll_token = token.clone();
        poller_handles.push(tokio::task::spawn_blocking(move || {
            client.run(poll_state, poll_token);
        }));
    }

    if poller_handles.is_empty() {
        error!("no pollable machines configured (every machine is missing a URL)");
        anyhow::bail!("no pollable machines");
    }
    info!(count = poller_handles.len(), "telemetry pollers launched");

    // ── 5. Periodic workers ──────────────────────────────────────────────
    let mut worker_handles = Vec::new();

    worker_handles.push(tokio::spawn(snapshot::run_writer(
        state.clone(),
        config.snapshot_path.clone(),
        config.snapshot_interval_secs,
        token.clone(),
    )));

    worker_handles.push(tokio::spawn(status_log::run_writer(
        db.clone(),
        state.clone(),
        config.status_log_interval_secs,
        token.clone(),
    )));

    let schedule = ShiftSchedule::new(config.shifts.clone());
    worker_handles.push(tokio::spawn(shift_engine::run_engine(
        db.clone(),
        state.clone(),
        schedule,
        config.shift_calc_interval_secs,
        token.clone(),
    )));

    worker_handles.push(tokio::spawn(cycles::run_engine(
        db.clone(),
        state.clone(),
        config.program_report_interval_secs,
        token.clone(),
    )));

    info!("all subsystems running");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    let signal = shutdown_signal().await;
    warn!(signal, "shutdown signal received, stopping workers");
    token.cancel();

    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    for handle in worker_handles.into_iter().chain(poller_handles) {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if tokio::time::timeout(remaining, handle).await.is_err() {
            warn!("worker did not unwind within the grace period");
        }
    }

    db.close().await;
    info!("Shopfloor Watch shut down complete.");

    // A poller can be stuck mid-connect against an unreachable endpoint on
    // the blocking pool; dropping the runtime would wait on it forever.
    std::process::exit(0);
}

/// Resolve on the first termination signal.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}
