// =============================================================================
// Analysis Archives — persisted efficiency, session and loss reports
// =============================================================================
//
// Four monthly-sharded archive families, all written on operator demand
// from the analysis views:
//
//   - `sub-program_analysis_YYYY_MM`  keyed (machine, report_date, program)
//   - `main_program_analysis_YYYY_MM` keyed (machine, main name, session start)
//   - `loss_breakdown_YYYY_MM`        keyed (machine, report_date, category)
//   - `loss_breakdown_per_piece_YYYY_MM`  same key, per-piece figures
//
// Upserts refresh every non-key column and stamp `archived_at`, so
// re-archiving a report simply replaces the previous figures.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::Row;
use tracing::{debug, info};

use crate::analysis::{LossBreakdownEntry, Session, SubProgramEfficiency};

use super::{key_for_month, month_key, months_covering_dates, Database};

pub fn sub_program_table_name(dt: DateTime<Utc>) -> String {
    format!("sub-program_analysis_{}", month_key(dt))
}

pub fn main_program_table_name(dt: DateTime<Utc>) -> String {
    format!("main_program_analysis_{}", month_key(dt))
}

pub fn loss_table_name(dt: DateTime<Utc>) -> String {
    format!("loss_breakdown_{}", month_key(dt))
}

pub fn loss_per_piece_table_name(dt: DateTime<Utc>) -> String {
    format!("loss_breakdown_per_piece_{}", month_key(dt))
}

fn sub_program_ddl(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{table}" (
            id SERIAL PRIMARY KEY,
            machine_name VARCHAR(255) NOT NULL,
            report_date DATE NOT NULL,
            program_name VARCHAR(255) NOT NULL,
            actual_avg_duration_seconds REAL,
            target_duration_seconds REAL,
            efficiency_percent REAL,
            efficiency_status VARCHAR(50),
            actual_spindle_speed_mode INTEGER,
            actual_feed_rate_mode INTEGER,
            target_spindle_speed INTEGER,
            target_feed_rate INTEGER,
            notes TEXT,
            archived_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (machine_name, report_date, program_name)
        );
        CREATE INDEX IF NOT EXISTS "idx_{table}_machine_date" ON "{table}" (machine_name, report_date);
        CREATE INDEX IF NOT EXISTS "idx_{table}_program_name" ON "{table}" (program_name);
        "#
    )
}

fn main_program_ddl(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{table}" (
            id SERIAL PRIMARY KEY,
            machine_name VARCHAR(255) NOT NULL,
            report_date DATE NOT NULL,
            program_main_name VARCHAR(255) NOT NULL,
            session_start_time TIMESTAMP WITH TIME ZONE NOT NULL,
            session_end_time TIMESTAMP WITH TIME ZONE NOT NULL,
            total_process_time_seconds REAL,
            total_loss_time_seconds REAL,
            cycle_time_seconds REAL,
            quantity INTEGER,
            notes TEXT,
            notes_qty TEXT,
            archived_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (machine_name, program_main_name, session_start_time)
        );
        CREATE INDEX IF NOT EXISTS "idx_{table}_machine_date" ON "{table}" (machine_name, report_date);
        CREATE INDEX IF NOT EXISTS "idx_{table}_program_name" ON "{table}" (program_main_name);
        "#
    )
}

fn loss_ddl(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{table}" (
            id SERIAL PRIMARY KEY,
            machine_name VARCHAR(255) NOT NULL,
            report_date DATE NOT NULL,
            loss_category VARCHAR(255) NOT NULL,
            duration_seconds REAL,
            created_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (machine_name, report_date, loss_category)
        );
        "#
    )
}

pub async fn ensure_month(db: &Database, dt: DateTime<Utc>) -> Result<()> {
    let table = sub_program_table_name(dt);
    db.ensure_table(&table, &sub_program_ddl(&table)).await?;

    let table = main_program_table_name(dt);
    db.ensure_table(&table, &main_program_ddl(&table)).await?;

    let table = loss_table_name(dt);
    db.ensure_table(&table, &loss_ddl(&table)).await?;

    let table = loss_per_piece_table_name(dt);
    db.ensure_table(&table, &loss_ddl(&table)).await?;

    Ok(())
}

// =============================================================================
// Writers
// =============================================================================

/// Archive a sub-program efficiency report into the current month's table.
pub async fn save_sub_program_report(
    db: &Database,
    machine: &str,
    report_date: NaiveDate,
    rows: &[SubProgramEfficiency],
) -> Result<()> {
    if rows.is_empty() {
        debug!(machine, %report_date, "no efficiency rows to archive");
        return Ok(());
    }

    let now = Utc::now();
    let table = sub_program_table_name(now);
    db.ensure_table(&table, &sub_program_ddl(&table)).await?;

    let sql = format!(
        r#"
        INSERT INTO "{table}" (
            machine_name, report_date, program_name, actual_avg_duration_seconds,
            target_duration_seconds, efficiency_percent, efficiency_status,
            actual_spindle_speed_mode, actual_feed_rate_mode,
            target_spindle_speed, target_feed_rate, notes
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (machine_name, report_date, program_name) DO UPDATE SET
            actual_avg_duration_seconds = EXCLUDED.actual_avg_duration_seconds,
            target_duration_seconds = EXCLUDED.target_duration_seconds,
            efficiency_percent = EXCLUDED.efficiency_percent,
            efficiency_status = EXCLUDED.efficiency_status,
            actual_spindle_speed_mode = EXCLUDED.actual_spindle_speed_mode,
            actual_feed_rate_mode = EXCLUDED.actual_feed_rate_mode,
            target_spindle_speed = EXCLUDED.target_spindle_speed,
            target_feed_rate = EXCLUDED.target_feed_rate,
            notes = EXCLUDED.notes,
            archived_at = CURRENT_TIMESTAMP
        "#
    );

    let _guard = db.write_guard().await;
    for row in rows {
        sqlx::query(&sql)
            .bind(machine)
            .bind(report_date)
            .bind(&row.program_name)
            .bind(row.actual_per_piece_secs as f32)
            .bind(row.target_secs as f32)
            .bind(row.efficiency_pct as f32)
            .bind(row.band.as_str())
            .bind(row.spindle_mode)
            .bind(row.feed_rate_mode)
            .bind(row.target_spindle)
            .bind(row.target_feed)
            .bind(&row.notes)
            .execute(db.pool())
            .await
            .with_context(|| {
                format!("failed to archive efficiency row for {}", row.program_name)
            })?;
    }

    info!(
        machine,
        %report_date,
        programs = rows.len(),
        "sub-program efficiency report archived"
    );
    Ok(())
}

/// Archive reconstructed main-program sessions into the current month's
/// table.
pub async fn save_main_program_sessions(
    db: &Database,
    machine: &str,
    report_date: NaiveDate,
    sessions: &[Session],
) -> Result<()> {
    if sessions.is_empty() {
        debug!(machine, %report_date, "no sessions to archive");
        return Ok(());
    }

    let now = Utc::now();
    let table = main_program_table_name(now);
    db.ensure_table(&table, &main_program_ddl(&table)).await?;

    let sql = format!(
        r#"
        INSERT INTO "{table}" (
            machine_name, report_date, program_main_name, session_start_time,
            session_end_time, total_process_time_seconds, total_loss_time_seconds,
            cycle_time_seconds, quantity, notes, notes_qty
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (machine_name, program_main_name, session_start_time) DO UPDATE SET
            session_end_time = EXCLUDED.session_end_time,
            total_process_time_seconds = EXCLUDED.total_process_time_seconds,
            total_loss_time_seconds = EXCLUDED.total_loss_time_seconds,
            cycle_time_seconds = EXCLUDED.cycle_time_seconds,
            quantity = EXCLUDED.quantity,
            notes = EXCLUDED.notes,
            notes_qty = EXCLUDED.notes_qty,
            archived_at = CURRENT_TIMESTAMP
        "#
    );

    let _guard = db.write_guard().await;
    for session in sessions {
        sqlx::query(&sql)
            .bind(machine)
            .bind(report_date)
            .bind(&session.program_main_name)
            .bind(session.start)
            .bind(session.end)
            .bind(session.process_secs as f32)
            .bind(session.loss_secs as f32)
            .bind(session.cycle_time_secs() as f32)
            .bind(session.quantity)
            .bind(&session.notes)
            .bind(&session.notes_qty)
            .execute(db.pool())
            .await
            .with_context(|| {
                format!(
                    "failed to archive session for {} starting {}",
                    session.program_main_name, session.start
                )
            })?;
    }

    info!(
        machine,
        %report_date,
        sessions = sessions.len(),
        "main-program session analysis archived"
    );
    Ok(())
}

/// Archive a loss breakdown (totals or per-piece) into the current month's
/// table.
pub async fn save_loss_breakdown(
    db: &Database,
    machine: &str,
    report_date: NaiveDate,
    entries: &[LossBreakdownEntry],
    per_piece: bool,
) -> Result<()> {
    if entries.is_empty() {
        debug!(machine, %report_date, per_piece, "no loss entries to archive");
        return Ok(());
    }

    let now = Utc::now();
    let table = if per_piece {
        loss_per_piece_table_name(now)
    } else {
        loss_table_name(now)
    };
    db.ensure_table(&table, &loss_ddl(&table)).await?;

    let sql = format!(
        r#"
        INSERT INTO "{table}" (machine_name, report_date, loss_category, duration_seconds)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (machine_name, report_date, loss_category) DO UPDATE SET
            duration_seconds = EXCLUDED.duration_seconds
        "#
    );

    let _guard = db.write_guard().await;
    for entry in entries {
        sqlx::query(&sql)
            .bind(machine)
            .bind(report_date)
            .bind(&entry.category)
            .bind(entry.duration_secs as f32)
            .execute(db.pool())
            .await
            .with_context(|| {
                format!("failed to archive loss entry '{}'", entry.category)
            })?;
    }

    info!(
        machine,
        %report_date,
        per_piece,
        categories = entries.len(),
        "loss breakdown archived"
    );
    Ok(())
}

// =============================================================================
// Readers (consumed by the dashboards)
// =============================================================================

/// One archived efficiency row as stored.
#[derive(Debug, Clone)]
pub struct ArchivedEfficiencyRow {
    pub machine_name: String,
    pub report_date: NaiveDate,
    pub program_name: String,
    pub actual_avg_duration_secs: f64,
    pub target_duration_secs: f64,
    pub efficiency_percent: f64,
    pub efficiency_status: String,
    pub archived_at: DateTime<Utc>,
}

/// Fetch archived efficiency rows over a date range, unioned across
/// monthly partitions.
pub async fn get_sub_program_reports(
    db: &Database,
    machine: Option<&str>,
    start: NaiveDate,
    end: NaiveDate,
    program_filter: Option<&str>,
) -> Result<Vec<ArchivedEfficiencyRow>> {
    let mut results = Vec::new();

    for month in months_covering_dates(start, end) {
        let table = format!("sub-program_analysis_{}", key_for_month(month));
        if !db.table_exists(&table).await? {
            continue;
        }

        let mut sql = format!(
            r#"
            SELECT machine_name, report_date, program_name,
                   actual_avg_duration_seconds, target_duration_seconds,
                   efficiency_percent, efficiency_status, archived_at
            FROM "{table}"
            WHERE report_date >= $1 AND report_date <= $2
            "#
        );
        if machine.is_some() {
            sql.push_str(" AND machine_name = $3");
        }
        if program_filter.is_some() {
            let idx = if machine.is_some() { 4 } else { 3 };
            sql.push_str(&format!(" AND program_name ILIKE ${idx}"));
        }
        sql.push_str(" ORDER BY report_date DESC, machine_name ASC, program_name ASC");

        let mut query = sqlx::query(&sql).bind(start).bind(end);
        if let Some(m) = machine {
            query = query.bind(m);
        }
        if let Some(p) = program_filter {
            query = query.bind(format!("%{p}%"));
        }

        let rows = query
            .fetch_all(db.pool())
            .await
            .with_context(|| format!("failed to read efficiency archive '{table}'"))?;

        for row in rows {
            results.push(ArchivedEfficiencyRow {
                machine_name: row.try_get("machine_name")?,
                report_date: row.try_get("report_date")?,
                program_name: row.try_get("program_name")?,
                actual_avg_duration_secs: row
                    .try_get::<Option<f32>, _>("actual_avg_duration_seconds")?
                    .unwrap_or(0.0) as f64,
                target_duration_secs: row
                    .try_get::<Option<f32>, _>("target_duration_seconds")?
                    .unwrap_or(0.0) as f64,
                efficiency_percent: row
                    .try_get::<Option<f32>, _>("efficiency_percent")?
                    .unwrap_or(0.0) as f64,
                efficiency_status: row
                    .try_get::<Option<String>, _>("efficiency_status")?
                    .unwrap_or_default(),
                archived_at: row.try_get("archived_at")?,
            });
        }
    }

    Ok(results)
}

/// One archived main-program session row as stored.
#[derive(Debug, Clone)]
pub struct ArchivedSessionRow {
    pub machine_name: String,
    pub report_date: NaiveDate,
    pub program_main_name: String,
    pub session_start: DateTime<Utc>,
    pub session_end: DateTime<Utc>,
    pub process_secs: f64,
    pub loss_secs: f64,
    pub cycle_time_secs: f64,
    pub quantity: i32,
    pub notes: String,
    pub notes_qty: String,
}

/// Fetch archived sessions over a date range, unioned across monthly
/// partitions.
pub async fn get_main_program_sessions(
    db: &Database,
    machine: Option<&str>,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<ArchivedSessionRow>> {
    let mut results = Vec::new();

    for month in months_covering_dates(start, end) {
        let table = format!("main_program_analysis_{}", key_for_month(month));
        if !db.table_exists(&table).await? {
            continue;
        }

        let mut sql = format!(
            r#"
            SELECT machine_name, report_date, program_main_name, session_start_time,
                   session_end_time, total_process_time_seconds, total_loss_time_seconds,
                   cycle_time_seconds, quantity, notes, notes_qty
            FROM "{table}"
            WHERE report_date >= $1 AND report_date <= $2
            "#
        );
        if machine.is_some() {
            sql.push_str(" AND machine_name = $3");
        }
        sql.push_str(" ORDER BY session_start_time ASC");

        let mut query = sqlx::query(&sql).bind(start).bind(end);
        if let Some(m) = machine {
            query = query.bind(m);
        }

        let rows = query
            .fetch_all(db.pool())
            .await
            .with_context(|| format!("failed to read session archive '{table}'"))?;

        for row in rows {
            results.push(ArchivedSessionRow {
                machine_name: row.try_get("machine_name")?,
                report_date: row.try_get("report_date")?,
                program_main_name: row.try_get("program_main_name")?,
                session_start: row.try_get("session_start_time")?,
                session_end: row.try_get("session_end_time")?,
                process_secs: row
                    .try_get::<Option<f32>, _>("total_process_time_seconds")?
                    .unwrap_or(0.0) as f64,
                loss_secs: row
                    .try_get::<Option<f32>, _>("total_loss_time_seconds")?
                    .unwrap_or(0.0) as f64,
                cycle_time_secs: row
                    .try_get::<Option<f32>, _>("cycle_time_seconds")?
                    .unwrap_or(0.0) as f64,
                quantity: row.try_get::<Option<i32>, _>("quantity")?.unwrap_or(1),
                notes: row.try_get::<Option<String>, _>("notes")?.unwrap_or_default(),
                notes_qty: row
                    .try_get::<Option<String>, _>("notes_qty")?
                    .unwrap_or_default(),
            });
        }
    }

    Ok(results)
}

/// Fetch archived loss breakdown rows (totals or per-piece) over a date
/// range.
pub async fn get_loss_breakdown(
    db: &Database,
    machine: Option<&str>,
    start: NaiveDate,
    end: NaiveDate,
    per_piece: bool,
) -> Result<Vec<(String, NaiveDate, LossBreakdownEntry)>> {
    let prefix = if per_piece {
        "loss_breakdown_per_piece"
    } else {
        "loss_breakdown"
    };
    let mut results = Vec::new();

    for month in months_covering_dates(start, end) {
        let table = format!("{prefix}_{}", key_for_month(month));
        if !db.table_exists(&table).await? {
            continue;
        }

        let mut sql = format!(
            r#"
            SELECT machine_name, report_date, loss_category, duration_seconds
            FROM "{table}"
            WHERE report_date >= $1 AND report_date <= $2
            "#
        );
        if machine.is_some() {
            sql.push_str(" AND machine_name = $3");
        }
        sql.push_str(" ORDER BY report_date ASC, loss_category ASC");

        let mut query = sqlx::query(&sql).bind(start).bind(end);
        if let Some(m) = machine {
            query = query.bind(m);
        }

        let rows = query
            .fetch_all(db.pool())
            .await
            .with_context(|| format!("failed to read loss archive '{table}'"))?;

        for row in rows {
            results.push((
                row.try_get("machine_name")?,
                row.try_get("report_date")?,
                LossBreakdownEntry {
                    category: row.try_get("loss_category")?,
                    duration_secs: row
                        .try_get::<Option<f32>, _>("duration_seconds")?
                        .unwrap_or(0.0) as f64,
                },
            ));
        }
    }

    Ok(results)
}
