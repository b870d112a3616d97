//! One table's end-to-end sync cycle.
//!
//! Normal mode: fetch the JQL delta, filter against the processing log,
//! classify, write, record. Full-update mode ignores the JQL and instead
//! refreshes every row currently in the target table. Recording is
//! all-or-nothing: any failed write leaves the processing log untouched so
//! the next cycle reprocesses the whole batch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use larksync_connectors::{JiraClient, LarkClient};
use larksync_store::ProcessingLog;

use crate::batch::{BatchProcessor, BatchStats};
use crate::fields::FieldProcessor;
use crate::state::StateManager;

/// How many issue keys a `key IN (…)` refetch packs into one JQL query;
/// bounded to stay clear of URI length limits.
const KEY_FETCH_BATCH: usize = 50;

/// Everything a workflow needs to know about one (team, table) pair.
#[derive(Debug, Clone)]
pub struct TableSyncSpec {
    pub team: String,
    pub table_name: String,
    pub table_id: String,
    pub wiki_token: String,
    pub jql_query: String,
    pub ticket_field: String,
    pub excluded_fields: Vec<String>,
    /// Off for single-issue syncs, where cold-start handling is pointless.
    pub cold_start_detection: bool,
    /// Refresh every row present in the target instead of querying the JQL.
    pub full_update: bool,
}

/// Outcome of one cycle; `success == false` means nothing was recorded.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub table_id: String,
    pub success: bool,
    pub total_jira_issues: usize,
    pub filtered_issues: usize,
    pub created_records: usize,
    pub updated_records: usize,
    pub failed_operations: usize,
    pub processing_time: Duration,
    pub is_cold_start: bool,
    pub error: Option<String>,
    pub batch_stats: Option<BatchStats>,
}

impl SyncOutcome {
    fn empty(table_id: &str, is_cold_start: bool, started: Instant) -> Self {
        Self {
            table_id: table_id.to_string(),
            success: true,
            total_jira_issues: 0,
            filtered_issues: 0,
            created_records: 0,
            updated_records: 0,
            failed_operations: 0,
            processing_time: started.elapsed(),
            is_cold_start,
            error: None,
            batch_stats: None,
        }
    }

    fn failure(table_id: &str, started: Instant, error: String) -> Self {
        Self {
            table_id: table_id.to_string(),
            success: false,
            total_jira_issues: 0,
            filtered_issues: 0,
            created_records: 0,
            updated_records: 0,
            failed_operations: 0,
            processing_time: started.elapsed(),
            is_cold_start: false,
            error: Some(error),
            batch_stats: None,
        }
    }
}

pub struct WorkflowManager {
    jira: Arc<JiraClient>,
    lark: Arc<LarkClient>,
    fields: Arc<FieldProcessor>,
    state: Arc<StateManager>,
    batch: BatchProcessor,
}

impl WorkflowManager {
    pub fn new(
        jira: Arc<JiraClient>,
        lark: Arc<LarkClient>,
        fields: Arc<FieldProcessor>,
        state: Arc<StateManager>,
        batch: BatchProcessor,
    ) -> Self {
        Self {
            jira,
            lark,
            fields,
            state,
            batch,
        }
    }

    /// Run one cycle. Never panics the caller; failures come back embedded
    /// in the outcome.
    pub async fn run(&self, spec: &TableSyncSpec) -> SyncOutcome {
        let started = Instant::now();
        match self.run_inner(spec, started).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(table_id = %spec.table_id, error = %err, "sync workflow failed");
                SyncOutcome::failure(&spec.table_id, started, format!("{err:#}"))
            }
        }
    }

    async fn run_inner(&self, spec: &TableSyncSpec, started: Instant) -> Result<SyncOutcome> {
        info!(team = %spec.team, table = %spec.table_name, table_id = %spec.table_id, "sync cycle starting");

        let is_cold_start =
            spec.cold_start_detection && self.state.is_cold_start(&spec.table_id);

        let issues = if spec.full_update {
            self.full_update_issues(spec).await?
        } else {
            let required = self.fields.required_jira_fields();
            let by_key = self
                .jira
                .search_issues(&spec.jql_query, &required)
                .await
                .context("fetching JIRA issues")?;
            by_key.into_values().collect::<Vec<_>>()
        };
        let total_issues = issues.len();
        if total_issues == 0 {
            info!(table_id = %spec.table_id, "nothing to sync");
            return Ok(SyncOutcome::empty(&spec.table_id, is_cold_start, started));
        }

        if is_cold_start {
            let target_rows = self
                .lark
                .get_all_records(&spec.wiki_token, &spec.table_id)
                .await
                .context("reading target rows for cold start")?;
            self.state
                .prepare_cold_start(&spec.table_id, &target_rows, &spec.ticket_field, false)
                .context("preparing cold start")?;
        }

        // Full-update already holds exactly the issues to refresh.
        let (filtered, filter_stats) = if spec.full_update {
            let count = issues.len();
            (
                issues,
                crate::state::FilterStats {
                    total: count,
                    kept: count,
                    ..Default::default()
                },
            )
        } else {
            self.state
                .filter_issues(&spec.table_id, issues)
                .context("filtering issues")?
        };
        if filtered.is_empty() {
            info!(table_id = %spec.table_id, skipped = filter_stats.skipped, "all issues up to date");
            let mut outcome = SyncOutcome::empty(&spec.table_id, is_cold_start, started);
            outcome.total_jira_issues = total_issues;
            return Ok(outcome);
        }

        let available_fields = match self
            .lark
            .available_field_names(&spec.wiki_token, &spec.table_id)
            .await
        {
            Ok(fields) if !fields.is_empty() => Some(fields),
            Ok(_) => None,
            Err(err) => {
                warn!(table_id = %spec.table_id, error = %err, "field listing failed, using schema as-is");
                None
            }
        };

        let operations = if spec.full_update {
            self.state
                .classify_force_update(
                    &spec.table_id,
                    filtered.clone(),
                    &self.lark,
                    &spec.wiki_token,
                    &spec.ticket_field,
                )
                .await
                .context("classifying operations (full update)")?
        } else {
            self.state
                .classify(&spec.table_id, filtered.clone())
                .context("classifying operations")?
        };
        if operations.is_empty() {
            let mut outcome = SyncOutcome::empty(&spec.table_id, is_cold_start, started);
            outcome.total_jira_issues = total_issues;
            outcome.filtered_issues = filtered.len();
            return Ok(outcome);
        }

        let outcome = self
            .batch
            .process(
                &spec.wiki_token,
                &spec.table_id,
                operations,
                self.fields.mappings(),
                available_fields.as_deref(),
                &spec.excluded_fields,
            )
            .await;

        let failed: Vec<&larksync_core::SyncResult> =
            outcome.results.iter().filter(|r| !r.success).collect();
        if !failed.is_empty() {
            // Nothing is recorded; the whole batch is retried next cycle.
            warn!(
                table_id = %spec.table_id,
                failed = failed.len(),
                "write failures, discarding cycle state"
            );
            return Ok(SyncOutcome {
                table_id: spec.table_id.clone(),
                success: false,
                total_jira_issues: total_issues,
                filtered_issues: filtered.len(),
                created_records: outcome.stats.successful_creates,
                updated_records: outcome.stats.successful_updates,
                failed_operations: outcome.stats.failed_operations,
                processing_time: started.elapsed(),
                is_cold_start,
                error: Some(format!("{} operations failed", failed.len())),
                batch_stats: Some(outcome.stats),
            });
        }

        let log = self.state.log_for(&spec.table_id)?;
        let recorded = log
            .with_transaction(|txn| StateManager::record_results_in(txn, &outcome.results))
            .context("recording sync results")?;
        info!(table_id = %spec.table_id, recorded, "cycle recorded");

        Ok(SyncOutcome {
            table_id: spec.table_id.clone(),
            success: true,
            total_jira_issues: total_issues,
            filtered_issues: filtered.len(),
            created_records: outcome.stats.successful_creates,
            updated_records: outcome.stats.successful_updates,
            failed_operations: 0,
            processing_time: started.elapsed(),
            is_cold_start,
            error: None,
            batch_stats: Some(outcome.stats),
        })
    }

    /// Sync exactly one issue through the same machinery.
    pub async fn run_single_issue(&self, spec: &TableSyncSpec, issue_key: &str) -> SyncOutcome {
        let single = TableSyncSpec {
            jql_query: format!("key = {issue_key}"),
            cold_start_detection: false,
            full_update: false,
            ..spec.clone()
        };
        info!(issue_key, table_id = %single.table_id, "single issue sync");
        self.run(&single).await
    }

    /// Full-update source set: ticket keys are read from the live target and
    /// refetched from JIRA in key batches, so even rows the table's JQL
    /// would exclude get refreshed.
    async fn full_update_issues(&self, spec: &TableSyncSpec) -> Result<Vec<Value>> {
        let target_rows = self
            .lark
            .get_all_records(&spec.wiki_token, &spec.table_id)
            .await
            .context("reading target rows for full update")?;

        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for row in &target_rows {
            let ticket = row
                .get("fields")
                .and_then(|fields| fields.get(&spec.ticket_field))
                .and_then(StateManager::extract_ticket_key);
            if let Some(key) = ticket {
                // Only real issue keys; free-text cells are skipped.
                if key.contains('-') && seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }
        info!(
            table_id = %spec.table_id,
            rows = target_rows.len(),
            keys = keys.len(),
            "full update key extraction"
        );

        let required = self.fields.required_jira_fields();
        Ok(self.fetch_issues_by_keys(&keys, &required).await)
    }

    /// Refetch issues in batches of [`KEY_FETCH_BATCH`]. A failed batch is
    /// logged and skipped rather than sinking the whole pass.
    async fn fetch_issues_by_keys(&self, keys: &[String], fields: &[String]) -> Vec<Value> {
        let mut issues = Vec::new();
        let mut fetched_keys = HashSet::new();
        for (index, chunk) in keys.chunks(KEY_FETCH_BATCH).enumerate() {
            let quoted: Vec<String> = chunk.iter().map(|k| format!("\"{k}\"")).collect();
            let jql = format!("key IN ({})", quoted.join(", "));
            match self.jira.search_issues(&jql, fields).await {
                Ok(batch) => {
                    fetched_keys.extend(batch.keys().cloned());
                    issues.extend(batch.into_values());
                }
                Err(err) => {
                    warn!(batch = index + 1, error = %err, "key batch fetch failed, skipping");
                }
            }
        }

        let missing: Vec<&String> = keys.iter().filter(|k| !fetched_keys.contains(*k)).collect();
        if !missing.is_empty() {
            warn!(
                missing = missing.len(),
                sample = ?missing.iter().take(10).collect::<Vec<_>>(),
                "keys not found in JIRA"
            );
        }
        issues
    }

    /// Direct access for admin paths (cache rebuilds).
    pub fn processing_log(&self, table_id: &str) -> Result<Arc<ProcessingLog>> {
        self.state.log_for(table_id)
    }
}
