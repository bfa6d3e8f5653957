//! SQLite persistence (via sqlx): the actuator's event log table and the
//! daily metrics rollup.  The actuator holds the single read-write pool; the
//! web UI opens the same file read-only.  Migrations are forward-only and
//! versioned in `schema_version`.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;

use crate::event::{EventKind, EventRecord, LogLevel};

pub type Db = Pool<Sqlite>;

const SCHEMA_VERSION: i64 = 1;

const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id   INTEGER PRIMARY KEY,
        ts   TEXT NOT NULL,
        level TEXT NOT NULL,
        kind  TEXT NOT NULL,
        msg   TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts);

    CREATE TABLE IF NOT EXISTS metrics_daily (
        date        TEXT NOT NULL,
        mode_index  INTEGER NOT NULL,
        open_sec    REAL NOT NULL DEFAULT 0,
        volume_l    REAL NOT NULL DEFAULT 0,
        transitions INTEGER NOT NULL DEFAULT 0,
        fault_count INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (date, mode_index)
    );
    "#,
)];

// ---------------------------------------------------------------------------
// Open + migrate
// ---------------------------------------------------------------------------

/// Read-write pool for the actuator (single writer; WAL keeps readers out of
/// the writer's way).
pub async fn open_rw(db_path: &str) -> Result<Db> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))
        .with_context(|| format!("invalid sqlite path: {db_path}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open sqlite db: {db_path}"))
}

/// Read-only pool for the web UI.
pub async fn open_ro(db_path: &str) -> Result<Db> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))
        .with_context(|| format!("invalid sqlite path: {db_path}"))?
        .read_only(true)
        .journal_mode(SqliteJournalMode::Wal);

    SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open sqlite db read-only: {db_path}"))
}

/// In-memory pool for tests.  A single connection, because every sqlite
/// `:memory:` connection is its own database.
pub async fn open_memory() -> Result<Db> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .context("failed to open in-memory sqlite db")
}

/// Apply forward-only migrations up to the current schema version.
pub async fn migrate(pool: &Db) -> Result<()> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
        .execute(pool)
        .await
        .context("failed to create schema_version table")?;

    let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await
        .context("failed to read schema version")?;
    let current = current.unwrap_or(0);

    if current > SCHEMA_VERSION {
        bail!("database schema version {current} is newer than this binary ({SCHEMA_VERSION})");
    }

    for &(version, sql) in MIGRATIONS {
        if version <= current {
            continue;
        }
        sqlx::raw_sql(sql)
            .execute(pool)
            .await
            .with_context(|| format!("migration {version} failed"))?;
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(version)
            .execute(pool)
            .await
            .with_context(|| format!("failed to record migration {version}"))?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Fixed-width UTC timestamp so lexicographic order equals time order.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub async fn insert_event(pool: &Db, record: &EventRecord) -> Result<()> {
    sqlx::query("INSERT INTO events (id, ts, level, kind, msg) VALUES (?, ?, ?, ?, ?)")
        .bind(record.id)
        .bind(format_ts(record.ts))
        .bind(record.level.as_str())
        .bind(record.kind.as_str())
        .bind(&record.message)
        .execute(pool)
        .await
        .context("insert_event failed")?;
    Ok(())
}

pub async fn max_event_id(pool: &Db) -> Result<i64> {
    sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM events")
        .fetch_one(pool)
        .await
        .context("max_event_id failed")
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<EventRecord> {
    let ts_text: String = row.get("ts");
    let level_text: String = row.get("level");
    let kind_text: String = row.get("kind");
    Ok(EventRecord {
        id: row.get("id"),
        ts: DateTime::parse_from_rfc3339(&ts_text)
            .with_context(|| format!("bad timestamp in events table: {ts_text}"))?
            .with_timezone(&Utc),
        level: LogLevel::parse(&level_text)
            .with_context(|| format!("bad level in events table: {level_text}"))?,
        kind: EventKind::parse(&kind_text)
            .with_context(|| format!("bad kind in events table: {kind_text}"))?,
        message: row.get("msg"),
    })
}

/// Paged read, newest first.
pub async fn list_events(pool: &Db, offset: i64, limit: i64) -> Result<Vec<EventRecord>> {
    let rows = sqlx::query("SELECT id, ts, level, kind, msg FROM events ORDER BY id DESC LIMIT ? OFFSET ?")
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .context("list_events failed")?;
    rows.iter().map(row_to_event).collect()
}

/// Delete events older than `retention_days`.
pub async fn prune_events(pool: &Db, retention_days: i64) -> Result<u64> {
    let cutoff = format_ts(Utc::now() - chrono::Duration::days(retention_days));
    let result = sqlx::query("DELETE FROM events WHERE ts < ?")
        .bind(cutoff)
        .execute(pool)
        .await
        .context("prune_events failed")?;
    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// Daily metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, sqlx::FromRow, serde::Serialize)]
pub struct DailyMetricsRow {
    pub date: String,
    pub mode_index: i64,
    pub open_sec: f64,
    pub volume_l: f64,
    pub transitions: i64,
    pub fault_count: i64,
}

#[derive(Debug, Clone, Copy)]
pub enum MetricField {
    OpenSec,
    VolumeL,
    Transitions,
    FaultCount,
}

impl MetricField {
    fn column(self) -> &'static str {
        match self {
            MetricField::OpenSec => "open_sec",
            MetricField::VolumeL => "volume_l",
            MetricField::Transitions => "transitions",
            MetricField::FaultCount => "fault_count",
        }
    }
}

/// Accumulate `delta` into one counter of the `(date, mode)` rollup row.
pub async fn add_metric(
    pool: &Db,
    date: &str,
    mode_index: u16,
    field: MetricField,
    delta: f64,
) -> Result<()> {
    let column = field.column();
    let sql = format!(
        "INSERT INTO metrics_daily (date, mode_index, {column}) VALUES (?, ?, ?) \
         ON CONFLICT(date, mode_index) DO UPDATE SET {column} = {column} + excluded.{column}"
    );
    sqlx::query(&sql)
        .bind(date)
        .bind(i64::from(mode_index))
        .bind(delta)
        .execute(pool)
        .await
        .with_context(|| format!("add_metric({column}) failed"))?;
    Ok(())
}

pub async fn day_rows(pool: &Db, date: &str) -> Result<Vec<DailyMetricsRow>> {
    sqlx::query_as::<_, DailyMetricsRow>(
        "SELECT date, mode_index, open_sec, volume_l, transitions, fault_count \
         FROM metrics_daily WHERE date = ? ORDER BY mode_index",
    )
    .bind(date)
    .fetch_all(pool)
    .await
    .context("day_rows failed")
}

/// Total integrated water volume for one day across all modes.
pub async fn day_volume(pool: &Db, date: &str) -> Result<f64> {
    let volume: Option<f64> =
        sqlx::query_scalar("SELECT SUM(volume_l) FROM metrics_daily WHERE date = ?")
            .bind(date)
            .fetch_one(pool)
            .await
            .context("day_volume failed")?;
    Ok(volume.unwrap_or(0.0))
}

pub async fn prune_metrics(pool: &Db, retention_days: i64) -> Result<u64> {
    let cutoff = (chrono::Local::now() - chrono::Duration::days(retention_days))
        .format("%Y-%m-%d")
        .to_string();
    let result = sqlx::query("DELETE FROM metrics_daily WHERE date < ?")
        .bind(cutoff)
        .execute(pool)
        .await
        .context("prune_metrics failed")?;
    Ok(result.rows_affected())
}

/// Reclaim freed pages without locking the whole database.
pub async fn vacuum(pool: &Db) -> Result<()> {
    sqlx::query("PRAGMA incremental_vacuum(200)")
        .execute(pool)
        .await
        .context("incremental_vacuum failed")?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
