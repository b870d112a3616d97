//! Admin table scan: removes duplicate ticket rows, rows with a blank ticket
//! cell, and rows whose ticket no longer exists in JIRA, then rebuilds the
//! table's processing log from what is left.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use larksync_connectors::{JiraClient, LarkClient};

use crate::state::StateManager;
use crate::workflow::TableSyncSpec;

/// JIRA existence checks run in key batches of this size.
const EXISTENCE_BATCH: usize = 50;
const DELETE_BATCH: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct CleanReport {
    pub team: String,
    pub table: String,
    pub total_records: usize,
    pub blank_records: usize,
    pub duplicate_groups: usize,
    pub duplicate_records: usize,
    pub missing_issue_keys: usize,
    pub missing_records: usize,
    pub check_failed_keys: usize,
    pub records_to_delete: usize,
    pub deleted_records: usize,
    pub dry_run: bool,
}

pub struct TableCleaner {
    jira: Arc<JiraClient>,
    lark: Arc<LarkClient>,
    state: Arc<StateManager>,
}

impl TableCleaner {
    pub fn new(jira: Arc<JiraClient>, lark: Arc<LarkClient>, state: Arc<StateManager>) -> Self {
        Self { jira, lark, state }
    }

    pub async fn scan_and_clean(
        &self,
        spec: &TableSyncSpec,
        dry_run: bool,
    ) -> Result<CleanReport> {
        let mut report = CleanReport {
            team: spec.team.clone(),
            table: spec.table_name.clone(),
            dry_run,
            ..Default::default()
        };

        let records = self
            .lark
            .get_all_records(&spec.wiki_token, &spec.table_id)
            .await
            .context("scanning target table")?;
        report.total_records = records.len();

        let (blank, by_key) = Self::collect(&records, &spec.ticket_field);
        report.blank_records = blank.len();

        let duplicates: HashMap<&String, &Vec<Value>> =
            by_key.iter().filter(|(_, rows)| rows.len() > 1).collect();
        report.duplicate_groups = duplicates.len();
        report.duplicate_records = duplicates.values().map(|rows| rows.len()).sum();

        // Keep the most recently modified row of each duplicate group.
        let mut duplicate_losers: Vec<&Value> = Vec::new();
        for rows in duplicates.values() {
            let keep = rows
                .iter()
                .enumerate()
                .max_by_key(|(_, row)| Self::row_mtime(row))
                .map(|(i, _)| i)
                .unwrap_or(0);
            for (i, row) in rows.iter().enumerate() {
                if i != keep {
                    duplicate_losers.push(row);
                }
            }
        }

        let keys: Vec<String> = by_key.keys().cloned().collect();
        let (existing, failed) = self.existing_issue_keys(&keys).await;
        report.check_failed_keys = failed.len();

        // Keys the check could not verify are never deleted.
        let missing_keys: Vec<&String> = keys
            .iter()
            .filter(|k| !existing.contains(*k) && !failed.contains(*k))
            .collect();
        report.missing_issue_keys = missing_keys.len();
        let mut missing_records: Vec<&Value> = Vec::new();
        for key in &missing_keys {
            if let Some(rows) = by_key.get(*key) {
                missing_records.extend(rows.iter());
            }
        }
        report.missing_records = missing_records.len();

        // Dedup by record id across the three delete categories.
        let mut seen_ids = HashSet::new();
        let mut delete_ids = Vec::new();
        for row in blank
            .iter()
            .copied()
            .chain(duplicate_losers)
            .chain(missing_records)
        {
            if let Some(id) = row.get("record_id").and_then(|id| id.as_str()) {
                if seen_ids.insert(id.to_string()) {
                    delete_ids.push(id.to_string());
                }
            }
        }
        report.records_to_delete = delete_ids.len();

        info!(
            team = %spec.team,
            table = %spec.table_name,
            total = report.total_records,
            blank = report.blank_records,
            duplicate_groups = report.duplicate_groups,
            missing = report.missing_issue_keys,
            to_delete = report.records_to_delete,
            dry_run,
            "table scan done"
        );

        if !dry_run && !delete_ids.is_empty() {
            for chunk in delete_ids.chunks(DELETE_BATCH) {
                self.lark
                    .batch_delete_records(&spec.wiki_token, &spec.table_id, chunk)
                    .await
                    .context("deleting records")?;
            }
            report.deleted_records = delete_ids.len();

            // The table changed under the log; rebuild it from scratch.
            let fresh = self
                .lark
                .get_all_records(&spec.wiki_token, &spec.table_id)
                .await
                .context("rescanning after delete")?;
            self.state
                .prepare_cold_start(&spec.table_id, &fresh, &spec.ticket_field, true)
                .context("rebuilding processing log")?;
        }

        Ok(report)
    }

    /// Split rows into blank-ticket ones and a key → rows index.
    fn collect<'a>(
        records: &'a [Value],
        ticket_field: &str,
    ) -> (Vec<&'a Value>, HashMap<String, Vec<Value>>) {
        let mut blank = Vec::new();
        let mut by_key: HashMap<String, Vec<Value>> = HashMap::new();
        for record in records {
            let ticket = record
                .get("fields")
                .and_then(|fields| fields.get(ticket_field))
                .and_then(StateManager::extract_ticket_key);
            match ticket {
                Some(key) if key.contains('-') => by_key.entry(key).or_default().push(record.clone()),
                _ => blank.push(record),
            }
        }
        (blank, by_key)
    }

    fn row_mtime(row: &Value) -> i64 {
        row.get("last_modified_time")
            .or_else(|| row.get("created_time"))
            .and_then(|t| t.as_i64())
            .unwrap_or(0)
    }

    /// Which of `keys` still exist in JIRA. Returns `(existing, check_failed)`;
    /// a batch that errors puts all its keys into the failed set.
    async fn existing_issue_keys(&self, keys: &[String]) -> (HashSet<String>, HashSet<String>) {
        let mut existing = HashSet::new();
        let mut failed = HashSet::new();
        let fields = vec!["key".to_string()];

        for (index, chunk) in keys.chunks(EXISTENCE_BATCH).enumerate() {
            let quoted: Vec<String> = chunk.iter().map(|k| format!("\"{k}\"")).collect();
            let jql = format!("key IN ({})", quoted.join(", "));
            match self.jira.search_issues(&jql, &fields).await {
                Ok(found) => existing.extend(found.into_keys()),
                Err(err) => {
                    warn!(batch = index + 1, error = %err, "existence check batch failed");
                    failed.extend(chunk.iter().cloned());
                }
            }
        }
        (existing, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, ticket: Value, mtime: i64) -> Value {
        json!({
            "record_id": id,
            "last_modified_time": mtime,
            "fields": {"Issue Key": ticket},
        })
    }

    #[test]
    fn test_collect_splits_blank_and_keyed() {
        let records = vec![
            record("rec_A", json!("TP-1"), 1),
            record("rec_B", json!(""), 2),
            record("rec_C", json!(null), 3),
            record("rec_D", json!("free text"), 4),
            record("rec_E", json!({"text": "TP-2"}), 5),
        ];
        let (blank, by_key) = TableCleaner::collect(&records, "Issue Key");
        assert_eq!(blank.len(), 3);
        assert_eq!(by_key.len(), 2);
        assert!(by_key.contains_key("TP-1"));
        assert!(by_key.contains_key("TP-2"));
    }

    #[test]
    fn test_collect_groups_duplicates() {
        let records = vec![
            record("rec_A", json!("TP-1"), 1),
            record("rec_B", json!("TP-1"), 9),
            record("rec_C", json!("TP-1"), 5),
        ];
        let (_, by_key) = TableCleaner::collect(&records, "Issue Key");
        assert_eq!(by_key["TP-1"].len(), 3);

        // keep-latest picks the highest modification time
        let rows = &by_key["TP-1"];
        let keep = rows
            .iter()
            .max_by_key(|row| TableCleaner::row_mtime(row))
            .unwrap();
        assert_eq!(keep["record_id"], "rec_B");
    }

    #[test]
    fn test_row_mtime_fallback() {
        let with_created = json!({"record_id": "x", "created_time": 7, "fields": {}});
        assert_eq!(TableCleaner::row_mtime(&with_created), 7);
        let with_neither = json!({"record_id": "x", "fields": {}});
        assert_eq!(TableCleaner::row_mtime(&with_neither), 0);
    }
}
