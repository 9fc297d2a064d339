// =============================================================================
// Shift Metric Tables — live upserts and one-shot finals
// =============================================================================
//
// Two monthly-sharded families:
//
//   - `shift_metrics_YYYY_MM`: the live row per (machine, shift, start),
//     rewritten on every shift-engine tick while the shift is open.
//   - `final_shift_metrics_YYYY_MM`: written exactly once when a shift's
//     end has passed; conflicts are skipped so the first finalization wins.
//
// A shift's row lives in the month of its *start* time, so a shift spanning
// midnight on the last day of the month stays in one partition.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::Row;
use tracing::debug;

use crate::types::ShiftMetric;

use super::{key_for_month, month_key, months_covering_dates, Database};

pub fn live_table_name(dt: DateTime<Utc>) -> String {
    format!("shift_metrics_{}", month_key(dt))
}

pub fn final_table_name(dt: DateTime<Utc>) -> String {
    format!("final_shift_metrics_{}", month_key(dt))
}

fn live_ddl(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{table}" (
            machine_name VARCHAR(255) NOT NULL,
            shift_name VARCHAR(50) NOT NULL,
            runtime_seconds REAL NOT NULL,
            idletime_seconds REAL NOT NULL,
            other_time_seconds REAL NOT NULL,
            shift_start_time TIMESTAMP WITH TIME ZONE NOT NULL,
            shift_end_time TIMESTAMP WITH TIME ZONE NOT NULL,
            last_updated TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (machine_name, shift_name, shift_start_time)
        );
        "#
    )
}

fn final_ddl(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{table}" (
            id SERIAL PRIMARY KEY,
            machine_name VARCHAR(255) NOT NULL,
            shift_name VARCHAR(50) NOT NULL,
            runtime_seconds REAL NOT NULL,
            idletime_seconds REAL NOT NULL,
            other_time_seconds REAL NOT NULL,
            shift_start_time TIMESTAMP WITH TIME ZONE NOT NULL,
            shift_end_time TIMESTAMP WITH TIME ZONE NOT NULL,
            date_saved TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (machine_name, shift_start_time)
        );
        "#
    )
}

pub async fn ensure_live_month(db: &Database, dt: DateTime<Utc>) -> Result<()> {
    let table = live_table_name(dt);
    db.ensure_table(&table, &live_ddl(&table)).await
}

pub async fn ensure_final_month(db: &Database, dt: DateTime<Utc>) -> Result<()> {
    let table = final_table_name(dt);
    db.ensure_table(&table, &final_ddl(&table)).await
}

fn round2(value: f64) -> f32 {
    ((value * 100.0).round() / 100.0) as f32
}

// =============================================================================
// Writers
// =============================================================================

/// Upsert the live row for one machine/shift, keyed by
/// `(machine, shift, shift_start)`.
pub async fn save_live(db: &Database, metric: &ShiftMetric) -> Result<()> {
    ensure_live_month(db, metric.shift_start).await?;
    let table = live_table_name(metric.shift_start);

    let sql = format!(
        r#"
        INSERT INTO "{table}"
            (machine_name, shift_name, runtime_seconds, idletime_seconds,
             other_time_seconds, shift_start_time, shift_end_time)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (machine_name, shift_name, shift_start_time) DO UPDATE SET
            runtime_seconds = EXCLUDED.runtime_seconds,
            idletime_seconds = EXCLUDED.idletime_seconds,
            other_time_seconds = EXCLUDED.other_time_seconds,
            shift_end_time = EXCLUDED.shift_end_time,
            last_updated = CURRENT_TIMESTAMP
        "#
    );

    let _guard = db.write_guard().await;
    sqlx::query(&sql)
        .bind(&metric.machine_name)
        .bind(&metric.shift_name)
        .bind(round2(metric.runtime_secs))
        .bind(round2(metric.idle_secs))
        .bind(round2(metric.other_secs))
        .bind(metric.shift_start)
        .bind(metric.shift_end)
        .execute(db.pool())
        .await
        .with_context(|| {
            format!(
                "failed to save live shift metrics for {} - {}",
                metric.machine_name, metric.shift_name
            )
        })?;

    Ok(())
}

/// Insert the final row for a completed shift. Returns `false` when the
/// shift was already finalized (conflict skipped).
pub async fn save_final(db: &Database, metric: &ShiftMetric) -> Result<bool> {
    ensure_final_month(db, metric.shift_start).await?;
    let table = final_table_name(metric.shift_start);

    let sql = format!(
        r#"
        INSERT INTO "{table}"
            (machine_name, shift_name, runtime_seconds, idletime_seconds,
             other_time_seconds, shift_start_time, shift_end_time)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (machine_name, shift_start_time) DO NOTHING
        "#
    );

    let _guard = db.write_guard().await;
    let result = sqlx::query(&sql)
        .bind(&metric.machine_name)
        .bind(&metric.shift_name)
        .bind(round2(metric.runtime_secs))
        .bind(round2(metric.idle_secs))
        .bind(round2(metric.other_secs))
        .bind(metric.shift_start)
        .bind(metric.shift_end)
        .execute(db.pool())
        .await
        .with_context(|| {
            format!(
                "failed to save final shift metrics for {} - {}",
                metric.machine_name, metric.shift_name
            )
        })?;

    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Readers (consumed by the dashboards)
// =============================================================================

/// Fetch shift metric rows over a date range, live or final, optionally
/// filtered by machine. Absent monthly partitions are skipped.
pub async fn get_range(
    db: &Database,
    machine: Option<&str>,
    start: NaiveDate,
    end: NaiveDate,
    finalized: bool,
) -> Result<Vec<ShiftMetric>> {
    let mut metrics = Vec::new();

    for month in months_covering_dates(start, end) {
        let table = if finalized {
            format!("final_shift_metrics_{}", key_for_month(month))
        } else {
            format!("shift_metrics_{}", key_for_month(month))
        };

        if !db.table_exists(&table).await? {
            debug!(table, "shift metrics partition absent, skipping");
            continue;
        }

        let mut sql = format!(
            r#"
            SELECT machine_name, shift_name, runtime_seconds, idletime_seconds,
                   other_time_seconds, shift_start_time, shift_end_time
            FROM "{table}"
            WHERE shift_start_time >= $1 AND shift_start_time < $2
            "#
        );
        if machine.is_some() {
            sql.push_str(" AND machine_name = $3");
        }
        sql.push_str(" ORDER BY shift_start_time ASC");

        let start_dt = start
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid")
            .and_utc();
        let end_dt = end
            .succ_opt()
            .unwrap_or(end)
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid")
            .and_utc();

        let mut query = sqlx::query(&sql).bind(start_dt).bind(end_dt);
        if let Some(m) = machine {
            query = query.bind(m);
        }

        let rows = query
            .fetch_all(db.pool())
            .await
            .with_context(|| format!("failed to read shift metrics from '{table}'"))?;

        for row in rows {
            metrics.push(ShiftMetric {
                machine_name: row.try_get("machine_name")?,
                shift_name: row.try_get("shift_name")?,
                runtime_secs: row.try_get::<f32, _>("runtime_seconds")? as f64,
                idle_secs: row.try_get::<f32, _>("idletime_seconds")? as f64,
                other_secs: row.try_get::<f32, _>("other_time_seconds")? as f64,
                shift_start: row.try_get("shift_start_time")?,
                shift_end: row.try_get("shift_end_time")?,
            });
        }
    }

    Ok(metrics)
}
