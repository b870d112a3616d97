//! Metrics store: one row per coordinator run plus one row per table sync.
//!
//! Writes here are best-effort; callers log failures and move on.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::debug;

use larksync_core::time::now_ms;

/// One coordinator run.
#[derive(Debug, Clone, Serialize)]
pub struct SessionMetrics {
    pub session_id: String,
    pub start_time: String,
    pub end_time: String,
    pub processing_time_secs: f64,
    pub total_teams: u64,
    pub total_tables: u64,
    pub successful_tables: u64,
    pub failed_tables: u64,
    pub total_processed: u64,
    pub total_created: u64,
    pub total_updated: u64,
    pub total_failed: u64,
    pub success_rate: f64,
}

/// One table sync within a run.
#[derive(Debug, Clone, Serialize)]
pub struct TableMetrics {
    pub table_id: String,
    pub team_name: String,
    pub sync_time: String,
    pub processing_time_secs: f64,
    pub is_cold_start: bool,
    pub total_jira_issues: u64,
    pub filtered_issues: u64,
    pub created_records: u64,
    pub updated_records: u64,
    pub failed_operations: u64,
}

/// Windowed aggregate over sessions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSummary {
    pub days: u32,
    pub total_sessions: u64,
    pub avg_processing_time_secs: f64,
    pub avg_success_rate: f64,
    pub total_processed: u64,
    pub total_created: u64,
    pub total_updated: u64,
    pub total_failed: u64,
}

/// Windowed aggregate for one table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableReport {
    pub table_id: String,
    pub days: u32,
    pub sync_count: u64,
    pub avg_processing_time_secs: f64,
    pub created_records: u64,
    pub updated_records: u64,
    pub failed_operations: u64,
    pub last_sync_time: Option<String>,
}

pub struct MetricsStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl MetricsStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating metrics directory {:?}", parent))?;
            }
        }

        let conn =
            Connection::open(&path).with_context(|| format!("opening metrics store {:?}", path))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sync_session_metrics (
                session_id TEXT PRIMARY KEY,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                processing_time REAL NOT NULL,
                total_teams INTEGER NOT NULL,
                total_tables INTEGER NOT NULL,
                successful_tables INTEGER NOT NULL,
                failed_tables INTEGER NOT NULL,
                total_processed INTEGER NOT NULL,
                total_created INTEGER NOT NULL,
                total_updated INTEGER NOT NULL,
                total_failed INTEGER NOT NULL,
                success_rate REAL NOT NULL,
                created_at INTEGER DEFAULT (strftime('%s', 'now') * 1000)
            );
            CREATE TABLE IF NOT EXISTS table_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                table_id TEXT NOT NULL,
                team_name TEXT NOT NULL,
                sync_time TEXT NOT NULL,
                processing_time REAL NOT NULL,
                is_cold_start INTEGER NOT NULL,
                total_jira_issues INTEGER NOT NULL,
                filtered_issues INTEGER NOT NULL,
                created_records INTEGER NOT NULL,
                updated_records INTEGER NOT NULL,
                failed_operations INTEGER NOT NULL,
                created_at INTEGER DEFAULT (strftime('%s', 'now') * 1000)
            );
            CREATE INDEX IF NOT EXISTS idx_session_metrics_created_at
                ON sync_session_metrics (created_at);
            CREATE INDEX IF NOT EXISTS idx_table_metrics_table_id
                ON table_metrics (table_id);
            CREATE INDEX IF NOT EXISTS idx_table_metrics_created_at
                ON table_metrics (created_at);",
        )
        .context("initializing metrics schema")?;

        debug!(path = %path.display(), "metrics store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_session(&self, metrics: &SessionMetrics) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sync_session_metrics
             (session_id, start_time, end_time, processing_time, total_teams, total_tables,
              successful_tables, failed_tables, total_processed, total_created, total_updated,
              total_failed, success_rate)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                metrics.session_id,
                metrics.start_time,
                metrics.end_time,
                metrics.processing_time_secs,
                metrics.total_teams,
                metrics.total_tables,
                metrics.successful_tables,
                metrics.failed_tables,
                metrics.total_processed,
                metrics.total_created,
                metrics.total_updated,
                metrics.total_failed,
                metrics.success_rate,
            ],
        )
        .context("inserting session metrics")?;
        Ok(())
    }

    pub fn insert_table_metrics(&self, rows: &[TableMetrics]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let txn = conn.transaction().context("opening metrics transaction")?;
        {
            let mut stmt = txn
                .prepare_cached(
                    "INSERT INTO table_metrics
                     (table_id, team_name, sync_time, processing_time, is_cold_start,
                      total_jira_issues, filtered_issues, created_records, updated_records,
                      failed_operations)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )
                .context("preparing table metrics insert")?;
            for row in rows {
                stmt.execute(params![
                    row.table_id,
                    row.team_name,
                    row.sync_time,
                    row.processing_time_secs,
                    row.is_cold_start as i64,
                    row.total_jira_issues,
                    row.filtered_issues,
                    row.created_records,
                    row.updated_records,
                    row.failed_operations,
                ])
                .context("inserting table metrics row")?;
            }
        }
        txn.commit().context("committing table metrics")?;
        Ok(())
    }

    pub fn summary_since(&self, days: u32) -> Result<MetricsSummary> {
        let cutoff = now_ms() - i64::from(days) * 24 * 3600 * 1000;
        let conn = self.conn();
        let summary = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(AVG(processing_time), 0),
                        COALESCE(AVG(success_rate), 0),
                        COALESCE(SUM(total_processed), 0),
                        COALESCE(SUM(total_created), 0),
                        COALESCE(SUM(total_updated), 0),
                        COALESCE(SUM(total_failed), 0)
                 FROM sync_session_metrics WHERE created_at >= ?1",
                params![cutoff],
                |row| {
                    Ok(MetricsSummary {
                        days,
                        total_sessions: row.get(0)?,
                        avg_processing_time_secs: row.get(1)?,
                        avg_success_rate: row.get(2)?,
                        total_processed: row.get(3)?,
                        total_created: row.get(4)?,
                        total_updated: row.get(5)?,
                        total_failed: row.get(6)?,
                    })
                },
            )
            .context("querying metrics summary")?;
        Ok(summary)
    }

    pub fn table_report(&self, table_id: &str, days: u32) -> Result<TableReport> {
        let cutoff = now_ms() - i64::from(days) * 24 * 3600 * 1000;
        let conn = self.conn();
        let report = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(AVG(processing_time), 0),
                        COALESCE(SUM(created_records), 0),
                        COALESCE(SUM(updated_records), 0),
                        COALESCE(SUM(failed_operations), 0),
                        MAX(sync_time)
                 FROM table_metrics WHERE table_id = ?1 AND created_at >= ?2",
                params![table_id, cutoff],
                |row| {
                    Ok(TableReport {
                        table_id: table_id.to_string(),
                        days,
                        sync_count: row.get(0)?,
                        avg_processing_time_secs: row.get(1)?,
                        created_records: row.get(2)?,
                        updated_records: row.get(3)?,
                        failed_operations: row.get(4)?,
                        last_sync_time: row.get(5)?,
                    })
                },
            )
            .context("querying table report")?;
        Ok(report)
    }

    /// Sessions and table rows from the window, as a JSON document.
    pub fn export_json(&self, days: u32) -> Result<serde_json::Value> {
        let cutoff = now_ms() - i64::from(days) * 24 * 3600 * 1000;
        let conn = self.conn();

        let mut sessions = Vec::new();
        {
            let mut stmt = conn
                .prepare(
                    "SELECT session_id, start_time, end_time, processing_time, total_teams,
                            total_tables, successful_tables, failed_tables, total_processed,
                            total_created, total_updated, total_failed, success_rate
                     FROM sync_session_metrics WHERE created_at >= ?1 ORDER BY created_at",
                )
                .context("preparing session export")?;
            let rows = stmt.query_map(params![cutoff], |row| {
                Ok(serde_json::json!({
                    "session_id": row.get::<_, String>(0)?,
                    "start_time": row.get::<_, String>(1)?,
                    "end_time": row.get::<_, String>(2)?,
                    "processing_time_secs": row.get::<_, f64>(3)?,
                    "total_teams": row.get::<_, u64>(4)?,
                    "total_tables": row.get::<_, u64>(5)?,
                    "successful_tables": row.get::<_, u64>(6)?,
                    "failed_tables": row.get::<_, u64>(7)?,
                    "total_processed": row.get::<_, u64>(8)?,
                    "total_created": row.get::<_, u64>(9)?,
                    "total_updated": row.get::<_, u64>(10)?,
                    "total_failed": row.get::<_, u64>(11)?,
                    "success_rate": row.get::<_, f64>(12)?,
                }))
            })?;
            for row in rows {
                sessions.push(row.context("reading session export row")?);
            }
        }

        let mut tables = Vec::new();
        {
            let mut stmt = conn
                .prepare(
                    "SELECT table_id, team_name, sync_time, processing_time, is_cold_start,
                            total_jira_issues, filtered_issues, created_records, updated_records,
                            failed_operations
                     FROM table_metrics WHERE created_at >= ?1 ORDER BY created_at",
                )
                .context("preparing table export")?;
            let rows = stmt.query_map(params![cutoff], |row| {
                Ok(serde_json::json!({
                    "table_id": row.get::<_, String>(0)?,
                    "team_name": row.get::<_, String>(1)?,
                    "sync_time": row.get::<_, String>(2)?,
                    "processing_time_secs": row.get::<_, f64>(3)?,
                    "is_cold_start": row.get::<_, i64>(4)? != 0,
                    "total_jira_issues": row.get::<_, u64>(5)?,
                    "filtered_issues": row.get::<_, u64>(6)?,
                    "created_records": row.get::<_, u64>(7)?,
                    "updated_records": row.get::<_, u64>(8)?,
                    "failed_operations": row.get::<_, u64>(9)?,
                }))
            })?;
            for row in rows {
                tables.push(row.context("reading table export row")?);
            }
        }

        Ok(serde_json::json!({
            "days": days,
            "sessions": sessions,
            "tables": tables,
        }))
    }

    pub fn cleanup_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = now_ms() - i64::from(days) * 24 * 3600 * 1000;
        let conn = self.conn();
        let sessions = conn
            .execute(
                "DELETE FROM sync_session_metrics WHERE created_at < ?1",
                params![cutoff],
            )
            .context("cleaning up session metrics")?;
        let tables = conn
            .execute(
                "DELETE FROM table_metrics WHERE created_at < ?1",
                params![cutoff],
            )
            .context("cleaning up table metrics")?;
        Ok(sessions + tables)
    }

    pub fn vacuum(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch("VACUUM").context("vacuuming database")?;
        Ok(())
    }
}
