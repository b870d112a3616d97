//! Per-table sync state: cold-start detection, processing-log lifecycle,
//! timestamp filtering, create/update classification and transactional
//! result recording.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::Transaction;
use serde_json::Value;
use tracing::{info, warn};

use larksync_connectors::LarkClient;
use larksync_core::time::now_ms;
use larksync_core::{SyncOperation, SyncResult};
use larksync_store::{LogEntry, LogStats, ProcessingLog};

/// A table whose log has not been touched for this long is resynced from the
/// live target.
pub const COLD_START_MAX_AGE_DAYS: i64 = 7;

/// Result marker for rows registered from the live target during cold start.
pub const COLD_START_RESULT: &str = "cold_start_existing";

#[derive(Debug, Clone, Default)]
pub struct FilterStats {
    pub total: usize,
    pub kept: usize,
    pub skipped: usize,
    pub filter_rate: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ColdStartSummary {
    pub total_target_rows: usize,
    pub valid_rows: usize,
    pub recorded: usize,
}

/// Owns one [`ProcessingLog`] per table, instantiated lazily and cached.
pub struct StateManager {
    data_dir: PathBuf,
    logs: Mutex<HashMap<String, Arc<ProcessingLog>>>,
}

impl StateManager {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            logs: Mutex::new(HashMap::new()),
        }
    }

    pub fn log_for(&self, table_id: &str) -> Result<Arc<ProcessingLog>> {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(log) = logs.get(table_id) {
            return Ok(log.clone());
        }
        let path = self.data_dir.join(format!("processing_log_{table_id}.db"));
        let log = Arc::new(ProcessingLog::open(&path)?);
        logs.insert(table_id.to_string(), log.clone());
        Ok(log)
    }

    /// Table ids with an instantiated log this process lifetime.
    pub fn known_tables(&self) -> Vec<String> {
        let logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        logs.keys().cloned().collect()
    }

    /// True when the log is empty or stale beyond
    /// [`COLD_START_MAX_AGE_DAYS`]. Errors also answer true: resyncing from
    /// the live target is the safe recovery.
    pub fn is_cold_start(&self, table_id: &str) -> bool {
        let stats = match self.log_for(table_id).and_then(|log| log.stats()) {
            Ok(stats) => stats,
            Err(err) => {
                warn!(table_id, error = %err, "cold-start check failed, assuming cold");
                return true;
            }
        };
        if stats.total_records == 0 {
            info!(table_id, "no processing history, cold start");
            return true;
        }
        if let Some(last) = stats.last_processed_at {
            let age_days = (now_ms() - last) as f64 / (1000.0 * 3600.0 * 24.0);
            if age_days > COLD_START_MAX_AGE_DAYS as f64 {
                info!(table_id, age_days, "stale history, cold start");
                return true;
            }
        }
        false
    }

    /// Pull the ticket key out of a target cell: plain string, hyperlink
    /// object, or a list of either.
    pub fn extract_ticket_key(value: &Value) -> Option<String> {
        fn from_object(obj: &serde_json::Map<String, Value>) -> Option<String> {
            for key in ["text", "url", "link"] {
                if let Some(Value::String(s)) = obj.get(key) {
                    if !s.trim().is_empty() {
                        return Some(s.trim().to_string());
                    }
                }
            }
            None
        }

        let key = match value {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Object(obj) => from_object(obj),
            Value::Array(items) => match items.first() {
                Some(Value::Object(obj)) => from_object(obj),
                Some(Value::String(s)) => Some(s.trim().to_string()),
                Some(other) => Some(other.to_string()),
                None => None,
            },
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        };
        key.filter(|k| !k.is_empty())
    }

    /// Register existing target rows in the log with `jira_updated_time = 0`,
    /// which guarantees the next delta pass refreshes every one of them.
    pub fn prepare_cold_start(
        &self,
        table_id: &str,
        target_rows: &[Value],
        ticket_field: &str,
        clear_cache: bool,
    ) -> Result<ColdStartSummary> {
        let log = self.log_for(table_id)?;
        if clear_cache {
            info!(table_id, "rebuild requested, clearing processing log");
            log.clear()?;
        }

        // Last write wins on duplicate ticket keys, same as a map insert.
        let mut by_key: HashMap<String, String> = HashMap::new();
        for row in target_rows {
            let Some(record_id) = row.get("record_id").and_then(|id| id.as_str()) else {
                continue;
            };
            let ticket = row
                .get("fields")
                .and_then(|fields| fields.get(ticket_field))
                .and_then(Self::extract_ticket_key);
            if let Some(ticket) = ticket {
                by_key.insert(ticket, record_id.to_string());
            }
        }

        let entries: Vec<LogEntry> = by_key
            .iter()
            .map(|(issue_key, record_id)| LogEntry {
                issue_key: issue_key.clone(),
                jira_updated_time: 0,
                processing_result: COLD_START_RESULT.to_string(),
                lark_record_id: Some(record_id.clone()),
            })
            .collect();
        let recorded = log.record_batch(&entries)?;

        info!(
            table_id,
            total = target_rows.len(),
            valid = by_key.len(),
            recorded,
            "cold start prepared"
        );
        Ok(ColdStartSummary {
            total_target_rows: target_rows.len(),
            valid_rows: by_key.len(),
            recorded,
        })
    }

    /// Timestamp filter plus stats.
    pub fn filter_issues(
        &self,
        table_id: &str,
        issues: Vec<Value>,
    ) -> Result<(Vec<Value>, FilterStats)> {
        if issues.is_empty() {
            return Ok((Vec::new(), FilterStats::default()));
        }
        let log = self.log_for(table_id)?;
        let kept = log.filter_by_timestamp(&issues)?;
        let stats = FilterStats {
            total: issues.len(),
            kept: kept.len(),
            skipped: issues.len() - kept.len(),
            filter_rate: (issues.len() - kept.len()) as f64 / issues.len() as f64 * 100.0,
        };
        Ok((kept, stats))
    }

    /// Classify each issue: a stored record id means update, otherwise create.
    pub fn classify(&self, table_id: &str, issues: Vec<Value>) -> Result<Vec<SyncOperation>> {
        if issues.is_empty() {
            return Ok(Vec::new());
        }
        let log = self.log_for(table_id)?;

        let mut operations = Vec::with_capacity(issues.len());
        for issue in issues {
            let Some(key) = issue.get("key").and_then(|k| k.as_str()).map(String::from) else {
                continue;
            };
            match log.lark_record_id(&key)? {
                Some(record_id) => operations.push(SyncOperation::update(key, issue, record_id)),
                None => operations.push(SyncOperation::create(key, issue)),
            }
        }

        let updates = operations
            .iter()
            .filter(|op| op.op_type == larksync_core::OpType::Update)
            .count();
        info!(
            table_id,
            creates = operations.len() - updates,
            updates,
            "operations classified"
        );
        Ok(operations)
    }

    /// Full-update classification: wipe the log, rebuild the record-id index
    /// from the live target, then force an update for every issue found
    /// there. Issues whose keys came from the target but are missing from
    /// the rebuilt index should not exist; they are logged and fall back to
    /// create so no data is dropped.
    pub async fn classify_force_update(
        &self,
        table_id: &str,
        issues: Vec<Value>,
        lark: &LarkClient,
        wiki_token: &str,
        ticket_field: &str,
    ) -> Result<Vec<SyncOperation>> {
        if issues.is_empty() {
            return Ok(Vec::new());
        }
        let log = self.log_for(table_id)?;

        info!(table_id, "full update: clearing local state");
        log.clear()?;

        let target_rows = lark
            .get_all_records(wiki_token, table_id)
            .await
            .context("fetching target rows for full update")?;
        self.prepare_cold_start(table_id, &target_rows, ticket_field, false)?;

        let mut operations = Vec::with_capacity(issues.len());
        let mut missing = Vec::new();
        for issue in issues {
            let Some(key) = issue.get("key").and_then(|k| k.as_str()).map(String::from) else {
                continue;
            };
            match log.lark_record_id(&key)? {
                Some(record_id) => operations.push(SyncOperation::update(key, issue, record_id)),
                None => {
                    warn!(table_id, issue_key = %key, "issue from target missing in rebuilt index");
                    missing.push(key.clone());
                    operations.push(SyncOperation::create(key, issue));
                }
            }
        }
        if !missing.is_empty() {
            warn!(table_id, count = missing.len(), "full update found unindexed issues");
        }
        Ok(operations)
    }

    /// Record only successful results inside the caller's transaction; failed
    /// ones stay unrecorded so the next cycle retries them.
    pub fn record_results_in(txn: &Transaction<'_>, results: &[SyncResult]) -> Result<usize> {
        let entries: Vec<LogEntry> = results
            .iter()
            .filter(|r| r.success)
            .map(|r| LogEntry {
                issue_key: r.issue_key.clone(),
                jira_updated_time: r.jira_updated_time.unwrap_or(0),
                processing_result: "success".to_string(),
                lark_record_id: r.lark_record_id.clone(),
            })
            .collect();
        if entries.is_empty() {
            return Ok(0);
        }
        ProcessingLog::record_batch_in(txn, &entries)
    }

    pub fn stats_for(&self, table_id: &str) -> Result<LogStats> {
        self.log_for(table_id)?.stats()
    }

    /// Retention sweep over one table or every instantiated one.
    pub fn cleanup_old(&self, days: u32, table_id: Option<&str>) -> Result<usize> {
        let tables = match table_id {
            Some(id) => vec![id.to_string()],
            None => self.known_tables(),
        };
        let mut total = 0;
        for table in tables {
            total += self.log_for(&table)?.cleanup_older_than(days)?;
        }
        Ok(total)
    }

    pub fn vacuum_all(&self) -> Result<usize> {
        let mut done = 0;
        for table in self.known_tables() {
            self.log_for(&table)?.vacuum()?;
            done += 1;
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larksync_core::OpType;
    use serde_json::json;
    use tempfile::tempdir;

    fn manager() -> (tempfile::TempDir, StateManager) {
        let dir = tempdir().unwrap();
        let manager = StateManager::new(dir.path());
        (dir, manager)
    }

    fn issue(key: &str, updated: &str) -> Value {
        json!({"key": key, "fields": {"updated": updated}})
    }

    fn target_row(record_id: &str, ticket: Value) -> Value {
        json!({"record_id": record_id, "fields": {"Issue Key": ticket}})
    }

    #[test]
    fn test_empty_log_is_cold_start() {
        let (_dir, manager) = manager();
        assert!(manager.is_cold_start("tbl_1"));
    }

    #[test]
    fn test_recent_activity_is_not_cold() {
        let (_dir, manager) = manager();
        let log = manager.log_for("tbl_1").unwrap();
        log.record(&LogEntry {
            issue_key: "TP-1".into(),
            jira_updated_time: 100,
            processing_result: "success".into(),
            lark_record_id: None,
        })
        .unwrap();
        assert!(!manager.is_cold_start("tbl_1"));
    }

    #[test]
    fn test_prepare_cold_start_registers_rows_at_time_zero() {
        let (_dir, manager) = manager();
        let rows = vec![
            target_row("rec_A", json!("TP-1")),
            target_row("rec_B", json!({"text": "TP-2", "link": "https://x/browse/TP-2"})),
            target_row("rec_C", json!(null)),
            json!({"fields": {"Issue Key": "TP-9"}}),
        ];
        let summary = manager
            .prepare_cold_start("tbl_1", &rows, "Issue Key", false)
            .unwrap();
        assert_eq!(summary.total_target_rows, 4);
        assert_eq!(summary.valid_rows, 2);
        assert_eq!(summary.recorded, 2);

        let log = manager.log_for("tbl_1").unwrap();
        assert_eq!(log.last_processed_time("TP-1").unwrap(), Some(0));
        assert_eq!(log.lark_record_id("TP-2").unwrap().as_deref(), Some("rec_B"));
    }

    #[test]
    fn test_cold_start_rows_always_selected_next_pass() {
        let (_dir, manager) = manager();
        let rows = vec![target_row("rec_A", json!("TP-1"))];
        manager
            .prepare_cold_start("tbl_1", &rows, "Issue Key", false)
            .unwrap();

        let (kept, stats) = manager
            .filter_issues("tbl_1", vec![issue("TP-1", "2023-01-01T00:00:00.000+0000")])
            .unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(stats.skipped, 0);
    }

    #[test]
    fn test_prepare_cold_start_clear_cache() {
        let (_dir, manager) = manager();
        manager
            .prepare_cold_start("tbl_1", &[target_row("rec_A", json!("TP-1"))], "Issue Key", false)
            .unwrap();
        manager
            .prepare_cold_start("tbl_1", &[target_row("rec_B", json!("TP-2"))], "Issue Key", true)
            .unwrap();

        let log = manager.log_for("tbl_1").unwrap();
        assert_eq!(log.last_processed_time("TP-1").unwrap(), None);
        assert_eq!(log.lark_record_id("TP-2").unwrap().as_deref(), Some("rec_B"));
    }

    #[test]
    fn test_classify_split() {
        let (_dir, manager) = manager();
        manager
            .prepare_cold_start("tbl_1", &[target_row("rec_A", json!("TP-1"))], "Issue Key", false)
            .unwrap();

        let ops = manager
            .classify(
                "tbl_1",
                vec![
                    issue("TP-1", "2023-01-01T00:00:00.000+0000"),
                    issue("TP-3", "2023-01-02T00:00:00.000+0000"),
                ],
            )
            .unwrap();
        assert_eq!(ops.len(), 2);
        let update = ops.iter().find(|op| op.issue_key == "TP-1").unwrap();
        assert_eq!(update.op_type, OpType::Update);
        assert_eq!(update.lark_record_id.as_deref(), Some("rec_A"));
        let create = ops.iter().find(|op| op.issue_key == "TP-3").unwrap();
        assert_eq!(create.op_type, OpType::Create);
    }

    #[test]
    fn test_record_results_skips_failures() {
        let (_dir, manager) = manager();
        let log = manager.log_for("tbl_1").unwrap();

        let ok_op = SyncOperation::create("TP-1", issue("TP-1", "2023-01-01T00:00:00.000+0000"));
        let bad_op = SyncOperation::create("TP-2", issue("TP-2", "2023-01-01T00:00:00.000+0000"));
        let results = vec![
            SyncResult::ok(&ok_op, Some("rec_A".into())),
            SyncResult::failed(&bad_op, "rejected"),
        ];

        let recorded = log
            .with_transaction(|txn| StateManager::record_results_in(txn, &results))
            .unwrap();
        assert_eq!(recorded, 1);
        assert!(log.last_processed_time("TP-1").unwrap().is_some());
        assert!(log.last_processed_time("TP-2").unwrap().is_none());
    }

    #[test]
    fn test_second_cycle_with_no_changes_selects_nothing() {
        let (_dir, manager) = manager();
        let log = manager.log_for("tbl_1").unwrap();

        // First cycle: two creates succeed and are recorded.
        let issues = vec![
            issue("TP-1", "2023-01-01T00:00:00.000+0000"),
            issue("TP-2", "2023-01-02T00:00:00.000+0000"),
        ];
        let ops = manager.classify("tbl_1", issues.clone()).unwrap();
        let results: Vec<SyncResult> = ops
            .iter()
            .enumerate()
            .map(|(i, op)| SyncResult::ok(op, Some(format!("rec_{i}"))))
            .collect();
        log.with_transaction(|txn| StateManager::record_results_in(txn, &results))
            .unwrap();

        // Second cycle, nothing changed upstream: the filter drops everything.
        let (kept, stats) = manager.filter_issues("tbl_1", issues).unwrap();
        assert!(kept.is_empty());
        assert_eq!(stats.skipped, 2);

        // An upstream edit re-selects exactly the changed issue.
        let (kept, _) = manager
            .filter_issues("tbl_1", vec![issue("TP-1", "2023-01-01T00:00:01.000+0000")])
            .unwrap();
        assert_eq!(kept.len(), 1);
        let ops = manager.classify("tbl_1", kept).unwrap();
        assert_eq!(ops[0].op_type, OpType::Update);
        assert_eq!(ops[0].lark_record_id.as_deref(), Some("rec_0"));
    }

    #[test]
    fn test_extract_ticket_key_shapes() {
        assert_eq!(
            StateManager::extract_ticket_key(&json!("TP-1")).as_deref(),
            Some("TP-1")
        );
        assert_eq!(
            StateManager::extract_ticket_key(&json!({"text": "TP-2"})).as_deref(),
            Some("TP-2")
        );
        assert_eq!(
            StateManager::extract_ticket_key(&json!({"link": "https://x/browse/TP-3"})).as_deref(),
            Some("https://x/browse/TP-3")
        );
        assert_eq!(
            StateManager::extract_ticket_key(&json!([{"text": "TP-4"}])).as_deref(),
            Some("TP-4")
        );
        assert_eq!(
            StateManager::extract_ticket_key(&json!(["TP-5"])).as_deref(),
            Some("TP-5")
        );
        assert_eq!(StateManager::extract_ticket_key(&json!("")), None);
        assert_eq!(StateManager::extract_ticket_key(&json!(null)), None);
        assert_eq!(StateManager::extract_ticket_key(&json!([])), None);
    }

    #[test]
    fn test_filter_stats() {
        let (_dir, manager) = manager();
        let log = manager.log_for("tbl_1").unwrap();
        log.record(&LogEntry {
            issue_key: "TP-1".into(),
            jira_updated_time: 1672531200000,
            processing_result: "success".into(),
            lark_record_id: None,
        })
        .unwrap();

        let (kept, stats) = manager
            .filter_issues(
                "tbl_1",
                vec![
                    issue("TP-1", "2023-01-01T00:00:00.000+0000"),
                    issue("TP-2", "2023-01-01T00:00:00.000+0000"),
                ],
            )
            .unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.skipped, 1);
        assert!((stats.filter_rate - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cleanup_and_vacuum_over_known_tables() {
        let (_dir, manager) = manager();
        manager.log_for("tbl_1").unwrap();
        manager.log_for("tbl_2").unwrap();
        assert_eq!(manager.cleanup_old(30, None).unwrap(), 0);
        assert_eq!(manager.vacuum_all().unwrap(), 2);
    }
}
