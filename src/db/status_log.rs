// =============================================================================
// Status Log Store — monthly-sharded machine status history
// =============================================================================
//
// Append-mostly time series of machine samples, one table per calendar
// month. Rows are unique per `(machine_name, timestamp_log)`; the writer is
// insert-or-skip so re-running a tick with the same register contents
// produces no new rows.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::Row;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::types::{StatusLogEntry, StatusRecord};

use super::{key_for_month, month_key, months_covering, Database};

pub fn table_name(dt: DateTime<Utc>) -> String {
    format!("machine_status_log_{}", month_key(dt))
}

pub fn table_name_for_month(month: NaiveDate) -> String {
    format!("machine_status_log_{}", key_for_month(month))
}

fn ddl(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{table}" (
            id SERIAL PRIMARY KEY,
            machine_name VARCHAR(255) NOT NULL,
            timestamp_log TIMESTAMP WITH TIME ZONE NOT NULL,
            status_text VARCHAR(255),
            spindle_speed INTEGER,
            feed_rate INTEGER,
            current_program VARCHAR(255),
            raw_log_data JSONB,
            created_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (machine_name, timestamp_log)
        );
        "#
    )
}

pub async fn ensure_month(db: &Database, dt: DateTime<Utc>) -> Result<()> {
    let table = table_name(dt);
    db.ensure_table(&table, &ddl(&table)).await
}

// =============================================================================
// Writer
// =============================================================================

/// Insert one machine's latest sample into `table`. Conflicts on
/// `(machine_name, timestamp_log)` are skipped, preserving the first writer.
async fn insert_sample(
    db: &Database,
    table: &str,
    machine: &str,
    record: &StatusRecord,
) -> Result<bool> {
    let sql = format!(
        r#"
        INSERT INTO "{table}"
            (machine_name, timestamp_log, status_text, spindle_speed, feed_rate,
             current_program, raw_log_data)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (machine_name, timestamp_log) DO NOTHING
        "#
    );

    let result = sqlx::query(&sql)
        .bind(machine)
        .bind(record.timestamp)
        .bind(&record.status_text)
        .bind(record.spindle_speed)
        .bind(record.feed_rate)
        .bind(&record.current_program)
        .bind(&record.raw)
        .execute(db.pool())
        .await
        .with_context(|| format!("failed to save status log for {machine}"))?;

    Ok(result.rows_affected() > 0)
}

/// Background worker: every `interval` seconds, flush the "latest for DB
/// write" register into the current month's table.
pub async fn run_writer(
    db: Arc<Database>,
    state: Arc<AppState>,
    interval_secs: u64,
    token: CancellationToken,
) {
    info!(interval_secs, "status log writer started");
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = token.cancelled() => break,
        }

        let now = Utc::now();
        if let Err(e) = ensure_month(&db, now).await {
            // Schema trouble skips this cycle; next tick retries.
            error!(error = %e, "could not verify status log table, skipping cycle");
            continue;
        }

        let table = table_name(now);
        let latest = state.snapshot_db_latest();

        let _guard = db.write_guard().await;
        for (machine, record) in &latest {
            match insert_sample(&db, &table, machine, record).await {
                Ok(true) => debug!(
                    machine = %machine,
                    at = %record.timestamp,
                    "status log row saved"
                ),
                Ok(false) => debug!(machine = %machine, "status log row already exists, skipped"),
                Err(e) => warn!(machine = %machine, error = %e, "failed to save status log row"),
            }
        }
    }

    info!("status log writer stopped");
}

// =============================================================================
// Reader
// =============================================================================

/// Fetch one machine's status logs over `[start, end)`, unioned across
/// every monthly partition the range touches, ordered by timestamp
/// ascending.
pub async fn get_range(
    db: &Database,
    machine: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<StatusLogEntry>> {
    let mut logs = Vec::new();

    for month in months_covering(start, end) {
        let table = table_name_for_month(month);
        if !db.table_exists(&table).await? {
            debug!(table, "status log partition absent, skipping");
            continue;
        }

        match fetch_from_table(db, &table, machine, start, end, true).await {
            Ok(mut rows) => logs.append(&mut rows),
            Err(e) if e.to_string().contains("current_program") => {
                // Partitions created before the program column was added can
                // still be read; the column comes back absent.
                warn!(
                    table,
                    "partition is missing the current_program column, reading without it"
                );
                let mut rows = fetch_from_table(db, &table, machine, start, end, false)
                    .await
                    .with_context(|| format!("failed to re-read '{table}' without program column"))?;
                logs.append(&mut rows);
            }
            Err(e) => {
                warn!(table, error = %e, "failed to read status log partition");
            }
        }
    }

    debug!(
        machine = %machine,
        count = logs.len(),
        "fetched status logs"
    );
    Ok(logs)
}

async fn fetch_from_table(
    db: &Database,
    table: &str,
    machine: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    with_program: bool,
) -> Result<Vec<StatusLogEntry>> {
    let columns = if with_program {
        "timestamp_log, status_text, spindle_speed, feed_rate, current_program"
    } else {
        "timestamp_log, status_text, spindle_speed, feed_rate"
    };

    let sql = format!(
        r#"
        SELECT {columns} FROM "{table}"
        WHERE machine_name = $1 AND timestamp_log >= $2 AND timestamp_log < $3
        ORDER BY timestamp_log ASC
        "#
    );

    let rows = sqlx::query(&sql)
        .bind(machine)
        .bind(start)
        .bind(end)
        .fetch_all(db.pool())
        .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        entries.push(StatusLogEntry {
            timestamp: row.try_get("timestamp_log")?,
            status_text: row.try_get::<Option<String>, _>("status_text")?.unwrap_or_default(),
            spindle_speed: row.try_get("spindle_speed")?,
            feed_rate: row.try_get("feed_rate")?,
            current_program: if with_program {
                row.try_get("current_program")?
            } else {
                None
            },
        });
    }
    Ok(entries)
}
