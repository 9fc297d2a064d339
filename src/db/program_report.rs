// =============================================================================
// Program Cycle Table — monthly-sharded running-cycle rows
// =============================================================================
//
// One row per detected running cycle, keyed by
// `(machine_name, program_name, start_time)`. Because the cycle engine
// rescans a sliding window, an in-progress cycle is re-emitted with a later
// end on every tick; the upsert refreshes `end_time` and
// `duration_seconds` so the open cycle grows across runs.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::Row;
use tracing::debug;

use crate::types::ProgramCycle;

use super::{key_for_month, month_key, months_covering_dates, Database};

pub fn table_name(dt: DateTime<Utc>) -> String {
    format!("program_report_{}", month_key(dt))
}

pub fn table_name_for_month(month: NaiveDate) -> String {
    format!("program_report_{}", key_for_month(month))
}

fn ddl(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{table}" (
            id SERIAL PRIMARY KEY,
            machine_name VARCHAR(255) NOT NULL,
            program_name VARCHAR(255) NOT NULL,
            start_time TIMESTAMP WITH TIME ZONE NOT NULL,
            end_time TIMESTAMP WITH TIME ZONE NOT NULL,
            duration_seconds INTEGER NOT NULL,
            report_date DATE NOT NULL,
            created_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP,
            CONSTRAINT "unique_program_cycle_{table}"
                UNIQUE (machine_name, program_name, start_time)
        );
        CREATE INDEX IF NOT EXISTS "idx_{table}_machine_name" ON "{table}" (machine_name);
        CREATE INDEX IF NOT EXISTS "idx_{table}_report_date" ON "{table}" (report_date);
        CREATE INDEX IF NOT EXISTS "idx_{table}_start_time" ON "{table}" (start_time);
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

/// Upsert a batch of detected cycles, grouped into the monthly table of
/// each cycle's start time. `report_date` is the start's UTC calendar day.
pub async fn save_cycles(db: &Database, cycles: &[ProgramCycle]) -> Result<()> {
    if cycles.is_empty() {
        return Ok(());
    }

    // Verify every touched partition before taking the write lock.
    for cycle in cycles {
        ensure_month(db, cycle.start).await?;
    }

    let _guard = db.write_guard().await;
    for cycle in cycles {
        let table = table_name(cycle.start);
        let sql = format!(
            r#"
            INSERT INTO "{table}"
                (machine_name, program_name, start_time, end_time,
                 duration_seconds, report_date)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (machine_name, program_name, start_time) DO UPDATE SET
                end_time = EXCLUDED.end_time,
                duration_seconds = EXCLUDED.duration_seconds
            "#
        );

        sqlx::query(&sql)
            .bind(&cycle.machine_name)
            .bind(&cycle.program_name)
            .bind(cycle.start)
            .bind(cycle.end)
            .bind(cycle.duration_secs.round() as i32)
            .bind(cycle.start.date_naive())
            .execute(db.pool())
            .await
            .with_context(|| {
                format!(
                    "failed to save program cycle for {} / {}",
                    cycle.machine_name, cycle.program_name
                )
            })?;
    }

    debug!(count = cycles.len(), "program cycles saved");
    Ok(())
}

// =============================================================================
// Reader
// =============================================================================

/// Fetch one machine's cycles whose report date falls in `[start, end]`,
/// unioned across monthly partitions, ordered by start time. An optional
/// case-insensitive substring filter narrows by program name.
pub async fn get_range(
    db: &Database,
    machine: &str,
    start: NaiveDate,
    end: NaiveDate,
    program_filter: Option<&str>,
) -> Result<Vec<ProgramCycle>> {
    let mut cycles = Vec::new();

    for month in months_covering_dates(start, end) {
        let table = table_name_for_month(month);
        if !db.table_exists(&table).await? {
            debug!(table, "program report partition absent, skipping");
            continue;
        }

        let mut sql = format!(
            r#"
            SELECT machine_name, program_name, start_time, end_time, duration_seconds
            FROM "{table}"
            WHERE machine_name = $1 AND report_date >= $2 AND report_date <= $3
            "#
        );
        if program_filter.is_some() {
            sql.push_str(" AND program_name ILIKE $4");
        }
        sql.push_str(" ORDER BY start_time ASC");

        let mut query = sqlx::query(&sql).bind(machine).bind(start).bind(end);
        if let Some(filter) = program_filter {
            query = query.bind(format!("%{filter}%"));
        }

        let rows = query
            .fetch_all(db.pool())
            .await
            .with_context(|| format!("failed to read program cycles from '{table}'"))?;

        for row in rows {
            cycles.push(ProgramCycle {
                machine_name: row.try_get("machine_name")?,
                program_name: row.try_get("program_name")?,
                start: row.try_get("start_time")?,
                end: row.try_get("end_time")?,
                duration_secs: row.try_get::<i32, _>("duration_seconds")? as f64,
            });
        }
    }

    Ok(cycles)
}
