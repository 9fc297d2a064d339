// =============================================================================
// Persistence Layer — pooled PostgreSQL access with a serialized write path
// =============================================================================
//
// All tables are sharded by calendar month (`<prefix>_YYYY_MM`) and created
// lazily. Because table names are computed at runtime, every query is
// dynamic SQL with quoted identifiers; bind parameters are still used for
// all values.
//
// Concurrency rules:
//   - One global async mutex serializes every write transaction. Dynamic
//     table creation and the shared indexes make concurrent writers
//     deadlock-prone, and the write volume here is tiny.
//   - Reads go straight to the pool and bypass the mutex.
//   - Each monthly table is verified (CREATE TABLE IF NOT EXISTS) at most
//     once per process, tracked in the verified-set.
// =============================================================================

pub mod analysis_archive;
pub mod program_report;
pub mod shift_metrics;
pub mod status_log;

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Pooled database handle shared by every worker.
pub struct Database {
    pool: PgPool,
    write_lock: Mutex<()>,
    verified_tables: parking_lot::Mutex<HashSet<String>>,
}

impl Database {
    /// Connect the pool. Failure here is a startup error.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await
            .context("failed to initialize database connection pool")?;

        info!(max_connections, "database connection pool initialized");

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
            verified_tables: parking_lot::Mutex::new(HashSet::new()),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Acquire the global write lock. Held for the duration of one write
    /// transaction; never acquire it twice on the same call path.
    pub async fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    /// Close the pool gracefully (drains checked-in connections).
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -------------------------------------------------------------------------
    // Monthly table management
    // -------------------------------------------------------------------------

    /// Whether `table` exists in the connected database.
    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1)",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to probe for table '{table}'"))?;

        Ok(row.try_get::<bool, _>(0)?)
    }

    /// Run `ddl` (CREATE TABLE IF NOT EXISTS + indexes) for `table` unless
    /// this process has already verified it. Serialized by the write lock.
    pub async fn ensure_table(&self, table: &str, ddl: &str) -> Result<()> {
        if self.verified_tables.lock().contains(table) {
            return Ok(());
        }

        let _guard = self.write_guard().await;
        sqlx::raw_sql(ddl)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to create table '{table}'"))?;

        self.verified_tables.lock().insert(table.to_string());
        debug!(table, "monthly table checked/created");
        Ok(())
    }

    /// Create the current month's tables for every store. Called once at
    /// startup; failure is fatal.
    pub async fn init(&self, now: DateTime<Utc>) -> Result<()> {
        status_log::ensure_month(self, now).await?;
        shift_metrics::ensure_live_month(self, now).await?;
        shift_metrics::ensure_final_month(self, now).await?;
        program_report::ensure_month(self, now).await?;
        analysis_archive::ensure_month(self, now).await?;
        info!("database initialization complete");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Administrative commands
    // -------------------------------------------------------------------------

    /// Rewrite a program name across every program-report table in the date
    /// range, in a single transaction. This is an operator action, not a
    /// hot path.
    pub async fn rename_program(
        &self,
        machine: &str,
        old_name: &str,
        new_name: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<u64> {
        let _guard = self.write_guard().await;

        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        let mut total_rows = 0u64;

        for month in months_covering_dates(start, end) {
            let table = program_report::table_name_for_month(month);

            let exists: bool = sqlx::query(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1)",
            )
            .bind(&table)
            .fetch_one(&mut *tx)
            .await?
            .try_get(0)?;

            if !exists {
                debug!(table, "table absent, skipping rename");
                continue;
            }

            let sql = format!(
                r#"UPDATE "{table}" SET program_name = $1
                   WHERE machine_name = $2 AND program_name = $3"#
            );
            let result = sqlx::query(&sql)
                .bind(new_name)
                .bind(machine)
                .bind(old_name)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("failed to update program name in '{table}'"))?;

            total_rows += result.rows_affected();
        }

        tx.commit().await.context("failed to commit program rename")?;

        info!(
            machine,
            old_name,
            new_name,
            rows = total_rows,
            "program name rewritten across monthly tables"
        );
        Ok(total_rows)
    }
}

// =============================================================================
// Month arithmetic
// =============================================================================

/// The `YYYY_MM` suffix shared by every monthly table.
pub fn month_key(dt: DateTime<Utc>) -> String {
    format!("{:04}_{:02}", dt.year(), dt.month())
}

fn month_key_for_date(date: NaiveDate) -> String {
    format!("{:04}_{:02}", date.year(), date.month())
}

/// First day of the month containing `date`.
fn month_floor(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).expect("first of month is valid")
}

/// First day of the month after `date`'s month.
fn month_after(date: NaiveDate) -> NaiveDate {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1).expect("january is valid")
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1).expect("first of month is valid")
    }
}

/// Every month (as its first day) touched by the closed date range
/// `[start, end]`, in ascending order.
pub fn months_covering_dates(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut months = Vec::new();
    let mut cursor = month_floor(start);
    let last = month_floor(end);
    while cursor <= last {
        months.push(cursor);
        cursor = month_after(cursor);
    }
    months
}

/// Every month touched by the UTC instant range `[start, end]`.
pub fn months_covering(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<NaiveDate> {
    if end < start {
        return Vec::new();
    }
    months_covering_dates(start.date_naive(), end.date_naive())
}

/// Month key for a month returned by [`months_covering`].
pub fn key_for_month(month: NaiveDate) -> String {
    month_key_for_date(month)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn month_key_is_injective_over_a_month() {
        let first = Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap();
        let last = Utc.with_ymd_and_hms(2025, 7, 31, 23, 59, 59).unwrap();
        let next = Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap();

        assert_eq!(month_key(first), "2025_07");
        assert_eq!(month_key(last), "2025_07");
        assert_eq!(month_key(next), "2025_08");
    }

    #[test]
    fn months_covering_spans_year_boundary() {
        let start = Utc.with_ymd_and_hms(2024, 11, 15, 12, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 2, 3, 0, 0, 0).unwrap();

        let months: Vec<String> = months_covering(start, end)
            .into_iter()
            .map(key_for_month)
            .collect();
        assert_eq!(months, vec!["2024_11", "2024_12", "2025_01", "2025_02"]);
    }

    #[test]
    fn months_covering_empty_for_inverted_range() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        assert!(months_covering(start, end).is_empty());
    }

    #[test]
    fn single_month_range() {
        let start = Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 6, 30, 23, 0, 0).unwrap();
        let months = months_covering(start, end);
        assert_eq!(months.len(), 1);
        assert_eq!(key_for_month(months[0]), "2025_06");
    }
}
