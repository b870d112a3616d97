//! Per-table processing log.
//!
//! JIRA is the single source of truth; this log only remembers which issue
//! versions were already written to the target so unchanged issues are
//! filtered out cheaply. One SQLite file per table keeps lock scope narrow
//! and lets a table be reset by deleting its file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use tracing::{debug, info};

use larksync_core::time::{now_ms, parse_jira_timestamp};

/// One row to be written to the log.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub issue_key: String,
    pub jira_updated_time: i64,
    pub processing_result: String,
    pub lark_record_id: Option<String>,
}

/// Aggregate counts over the log.
#[derive(Debug, Clone, Default)]
pub struct LogStats {
    pub total_records: u64,
    pub success_records: u64,
    pub error_records: u64,
    pub last_processed_at: Option<i64>,
}

/// SQLite-backed processing log, one instance per target table.
///
/// All access is serialized through an internal lock; multi-step atomic
/// writes go through [`ProcessingLog::with_transaction`].
pub struct ProcessingLog {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl ProcessingLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating data directory {:?}", parent))?;
            }
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("opening processing log {:?}", path))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS processing_log (
                issue_key TEXT PRIMARY KEY,
                jira_updated_time INTEGER NOT NULL,
                processed_at INTEGER NOT NULL,
                processing_result TEXT DEFAULT 'success',
                lark_record_id TEXT,
                created_at INTEGER DEFAULT (strftime('%s', 'now') * 1000)
            );
            CREATE INDEX IF NOT EXISTS idx_processing_log_updated_time
                ON processing_log (jira_updated_time);
            CREATE INDEX IF NOT EXISTS idx_processing_log_processed_at
                ON processing_log (processed_at);",
        )
        .context("initializing processing_log schema")?;

        debug!(path = %path.display(), "processing log opened");
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

    /// The `jira_updated_time` recorded for an issue, if any.
    pub fn last_processed_time(&self, issue_key: &str) -> Result<Option<i64>> {
        let conn = self.conn();
        let value = conn
            .query_row(
                "SELECT jira_updated_time FROM processing_log WHERE issue_key = ?1",
                params![issue_key],
                |row| row.get(0),
            )
            .optional()
            .context("querying last processed time")?;
        Ok(value)
    }

    /// The stored target record id for an issue. `None` when the issue is
    /// unknown or the stored id is null.
    pub fn lark_record_id(&self, issue_key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        let value: Option<Option<String>> = conn
            .query_row(
                "SELECT lark_record_id FROM processing_log WHERE issue_key = ?1",
                params![issue_key],
                |row| row.get(0),
            )
            .optional()
            .context("querying lark record id")?;
        Ok(value.flatten())
    }

    /// Upsert one row; `processed_at` is stamped now.
    pub fn record(&self, entry: &LogEntry) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "REPLACE INTO processing_log
             (issue_key, jira_updated_time, processed_at, processing_result, lark_record_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.issue_key,
                entry.jira_updated_time,
                now_ms(),
                entry.processing_result,
                entry.lark_record_id,
            ],
        )
        .context("recording processing result")?;
        Ok(())
    }

    /// Upsert a batch of rows inside a single transaction.
    pub fn record_batch(&self, entries: &[LogEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        self.with_transaction(|txn| Self::record_batch_in(txn, entries))
    }

    /// Upsert a batch of rows into an externally managed transaction.
    pub fn record_batch_in(txn: &Transaction<'_>, entries: &[LogEntry]) -> Result<usize> {
        let processed_at = now_ms();
        let mut stmt = txn
            .prepare_cached(
                "REPLACE INTO processing_log
                 (issue_key, jira_updated_time, processed_at, processing_result, lark_record_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .context("preparing batch record statement")?;
        for entry in entries {
            stmt.execute(params![
                entry.issue_key,
                entry.jira_updated_time,
                processed_at,
                entry.processing_result,
                entry.lark_record_id,
            ])
            .with_context(|| format!("recording {}", entry.issue_key))?;
        }
        Ok(entries.len())
    }

    /// Run `f` inside a transaction. Commits when `f` returns `Ok`, rolls
    /// back otherwise; the table is never left half-written.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn();
        let txn = conn.transaction().context("opening transaction")?;
        let out = f(&txn)?;
        txn.commit().context("committing transaction")?;
        Ok(out)
    }

    /// Highest `jira_updated_time` in the log, used as an incremental cursor.
    pub fn max_jira_updated_time(&self) -> Result<Option<i64>> {
        let conn = self.conn();
        let value: Option<i64> = conn
            .query_row(
                "SELECT MAX(jira_updated_time) FROM processing_log",
                [],
                |row| row.get(0),
            )
            .context("querying max jira_updated_time")?;
        Ok(value)
    }

    pub fn stats(&self) -> Result<LogStats> {
        let conn = self.conn();
        let (total, last): (u64, Option<i64>) = conn
            .query_row(
                "SELECT COUNT(*), MAX(processed_at) FROM processing_log",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("querying log stats")?;
        let success: u64 = conn
            .query_row(
                "SELECT COUNT(*) FROM processing_log WHERE processing_result = 'success'",
                [],
                |row| row.get(0),
            )
            .context("querying success count")?;
        Ok(LogStats {
            total_records: total,
            success_records: success,
            error_records: total.saturating_sub(success),
            last_processed_at: last,
        })
    }

    /// Keep an issue iff it is newer than its logged version, unknown, or its
    /// timestamp cannot be read. Unparsable and missing timestamps always
    /// pass through; dropping them silently would lose data.
    pub fn filter_by_timestamp(&self, issues: &[Value]) -> Result<Vec<Value>> {
        if issues.is_empty() {
            return Ok(Vec::new());
        }

        // Single pass over the log beats one point query per issue.
        let logged: HashMap<String, i64> = {
            let conn = self.conn();
            let mut stmt = conn
                .prepare("SELECT issue_key, jira_updated_time FROM processing_log")
                .context("preparing filter query")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .context("reading processing log")?;
            let mut map = HashMap::new();
            for row in rows {
                let (key, ts) = row.context("reading processing log row")?;
                map.insert(key, ts);
            }
            map
        };

        let mut kept = Vec::new();
        for issue in issues {
            let Some(key) = issue.get("key").and_then(|k| k.as_str()) else {
                continue;
            };
            let updated = issue
                .get("fields")
                .and_then(|f| f.get("updated"))
                .and_then(|u| u.as_str())
                .and_then(parse_jira_timestamp);

            let select = match (updated, logged.get(key)) {
                (Some(ts), Some(last)) => ts > *last,
                // No usable timestamp or never seen: process it.
                _ => true,
            };
            if select {
                kept.push(issue.clone());
            } else {
                debug!(issue_key = key, "unchanged, skipped");
            }
        }

        let filter_rate = (issues.len() - kept.len()) as f64 / issues.len() as f64 * 100.0;
        info!(
            total = issues.len(),
            kept = kept.len(),
            filter_rate,
            "timestamp filter done"
        );
        Ok(kept)
    }

    /// Delete every row. Used by full-update mode and cache rebuilds.
    pub fn clear(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM processing_log", [])
            .context("clearing processing log")?;
        Ok(())
    }

    /// Delete rows whose `processed_at` is older than `days` days.
    pub fn cleanup_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = now_ms() - i64::from(days) * 24 * 3600 * 1000;
        let conn = self.conn();
        let deleted = conn
            .execute(
                "DELETE FROM processing_log WHERE processed_at < ?1",
                params![cutoff],
            )
            .context("cleaning up old log rows")?;
        if deleted > 0 {
            info!(deleted, days, "old processing log rows removed");
        }
        Ok(deleted)
    }

    pub fn vacuum(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch("VACUUM").context("vacuuming database")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn open_log() -> (tempfile::TempDir, ProcessingLog) {
        let dir = tempdir().unwrap();
        let log = ProcessingLog::open(dir.path().join("processing_log_tbl.db")).unwrap();
        (dir, log)
    }

    fn entry(key: &str, ts: i64, result: &str, record_id: Option<&str>) -> LogEntry {
        LogEntry {
            issue_key: key.to_string(),
            jira_updated_time: ts,
            processing_result: result.to_string(),
            lark_record_id: record_id.map(String::from),
        }
    }

    fn issue(key: &str, updated: &str) -> Value {
        json!({"key": key, "fields": {"updated": updated}})
    }

    #[test]
    fn test_record_and_read_back() {
        let (_dir, log) = open_log();
        log.record(&entry("TP-1", 100, "success", Some("rec_A"))).unwrap();

        assert_eq!(log.last_processed_time("TP-1").unwrap(), Some(100));
        assert_eq!(log.lark_record_id("TP-1").unwrap().as_deref(), Some("rec_A"));
        assert_eq!(log.last_processed_time("TP-2").unwrap(), None);
        assert_eq!(log.lark_record_id("TP-2").unwrap(), None);
    }

    #[test]
    fn test_record_is_replace() {
        let (_dir, log) = open_log();
        log.record(&entry("TP-1", 100, "success", Some("rec_A"))).unwrap();
        log.record(&entry("TP-1", 200, "success", Some("rec_A"))).unwrap();

        assert_eq!(log.last_processed_time("TP-1").unwrap(), Some(200));
        assert_eq!(log.stats().unwrap().total_records, 1);
    }

    #[test]
    fn test_null_record_id_reads_as_none() {
        let (_dir, log) = open_log();
        log.record(&entry("TP-1", 100, "success", None)).unwrap();
        assert_eq!(log.lark_record_id("TP-1").unwrap(), None);
    }

    #[test]
    fn test_batch_record() {
        let (_dir, log) = open_log();
        let entries = vec![
            entry("TP-1", 100, "cold_start_existing", Some("rec_A")),
            entry("TP-2", 200, "cold_start_existing", Some("rec_B")),
        ];
        assert_eq!(log.record_batch(&entries).unwrap(), 2);
        assert_eq!(log.stats().unwrap().total_records, 2);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let (_dir, log) = open_log();
        let entries = vec![entry("TP-1", 100, "success", Some("rec_A"))];

        let result: Result<()> = log.with_transaction(|txn| {
            ProcessingLog::record_batch_in(txn, &entries)?;
            anyhow::bail!("forced failure")
        });
        assert!(result.is_err());
        assert_eq!(log.stats().unwrap().total_records, 0);
    }

    #[test]
    fn test_transaction_commits_on_ok() {
        let (_dir, log) = open_log();
        let entries = vec![entry("TP-1", 100, "success", Some("rec_A"))];
        log.with_transaction(|txn| ProcessingLog::record_batch_in(txn, &entries))
            .unwrap();
        assert_eq!(log.last_processed_time("TP-1").unwrap(), Some(100));
    }

    #[test]
    fn test_max_jira_updated_time() {
        let (_dir, log) = open_log();
        assert_eq!(log.max_jira_updated_time().unwrap(), None);
        log.record(&entry("TP-1", 100, "success", None)).unwrap();
        log.record(&entry("TP-2", 300, "success", None)).unwrap();
        assert_eq!(log.max_jira_updated_time().unwrap(), Some(300));
    }

    #[test]
    fn test_filter_selects_newer_and_unknown() {
        let (_dir, log) = open_log();
        log.record(&entry("TP-1", 1672531200000, "success", None)).unwrap();

        let issues = vec![
            issue("TP-1", "2023-01-01T00:00:00.000+0000"), // unchanged
            issue("TP-2", "2023-01-02T00:00:00.000+0000"), // unknown
        ];
        let kept = log.filter_by_timestamp(&issues).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0]["key"], "TP-2");
    }

    #[test]
    fn test_filter_selects_strictly_newer() {
        let (_dir, log) = open_log();
        log.record(&entry("TP-1", 1672531200000, "success", None)).unwrap();

        let newer = vec![issue("TP-1", "2023-01-01T00:00:01.000+0000")];
        assert_eq!(log.filter_by_timestamp(&newer).unwrap().len(), 1);
    }

    #[test]
    fn test_filter_fails_open_on_bad_timestamp() {
        let (_dir, log) = open_log();
        log.record(&entry("TP-1", 1672531200000, "success", None)).unwrap();

        let issues = vec![
            issue("TP-1", "not a timestamp"),
            json!({"key": "TP-3", "fields": {}}),
        ];
        let kept = log.filter_by_timestamp(&issues).unwrap();
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_filter_zero_timestamp_always_selected() {
        // Cold-start rows are written with jira_updated_time = 0 so any
        // real timestamp refreshes them.
        let (_dir, log) = open_log();
        log.record(&entry("TP-1", 0, "cold_start_existing", Some("rec_A"))).unwrap();

        let kept = log
            .filter_by_timestamp(&[issue("TP-1", "2023-01-01T00:00:00.000+0000")])
            .unwrap();
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_clear_and_stats() {
        let (_dir, log) = open_log();
        log.record(&entry("TP-1", 100, "success", None)).unwrap();
        log.record(&entry("TP-2", 200, "error: boom", None)).unwrap();

        let stats = log.stats().unwrap();
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.success_records, 1);
        assert_eq!(stats.error_records, 1);
        assert!(stats.last_processed_at.is_some());

        log.clear().unwrap();
        assert_eq!(log.stats().unwrap().total_records, 0);
    }

    #[test]
    fn test_cleanup_keeps_recent_rows() {
        let (_dir, log) = open_log();
        log.record(&entry("TP-1", 100, "success", None)).unwrap();
        // Everything was just written; a 30-day retention removes nothing.
        assert_eq!(log.cleanup_older_than(30).unwrap(), 0);
        assert_eq!(log.stats().unwrap().total_records, 1);
    }

    #[test]
    fn test_vacuum() {
        let (_dir, log) = open_log();
        log.record(&entry("TP-1", 100, "success", None)).unwrap();
        log.vacuum().unwrap();
    }
}
