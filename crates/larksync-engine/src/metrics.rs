//! Session- and table-level sync metrics.
//!
//! Recording is non-critical: failures are logged and swallowed so a broken
//! metrics file can never take a sync down with it.

use std::sync::Arc;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use tracing::warn;
use uuid::Uuid;

use larksync_store::{
    metrics_store::{MetricsSummary, TableReport},
    MetricsStore, SessionMetrics, TableMetrics,
};

use crate::coordinator::SessionOutcome;
use crate::workflow::SyncOutcome;

#[derive(Clone)]
pub struct MetricsCollector {
    store: Arc<MetricsStore>,
}

impl MetricsCollector {
    pub fn new(store: Arc<MetricsStore>) -> Self {
        Self { store }
    }

    /// Record one coordinator run. Errors are logged, never propagated.
    pub fn record_session(&self, outcome: &SessionOutcome) {
        let success_rate = if outcome.total_tables > 0 {
            outcome.successful_tables as f64 / outcome.total_tables as f64 * 100.0
        } else {
            100.0
        };
        let metrics = SessionMetrics {
            session_id: format!("sync_{}", Uuid::new_v4().simple()),
            start_time: outcome.start_time.to_rfc3339_opts(SecondsFormat::Millis, true),
            end_time: outcome.end_time.to_rfc3339_opts(SecondsFormat::Millis, true),
            processing_time_secs: outcome.processing_time.as_secs_f64(),
            total_teams: outcome.total_teams as u64,
            total_tables: outcome.total_tables as u64,
            successful_tables: outcome.successful_tables as u64,
            failed_tables: outcome.failed_tables as u64,
            total_processed: outcome.total_processed as u64,
            total_created: outcome.total_created as u64,
            total_updated: outcome.total_updated as u64,
            total_failed: outcome.total_failed as u64,
            success_rate,
        };
        if let Err(err) = self.store.insert_session(&metrics) {
            warn!(error = %err, "session metrics write failed");
        }
    }

    /// Record one table sync. Errors are logged, never propagated.
    pub fn record_table(&self, team: &str, outcome: &SyncOutcome) {
        let row = TableMetrics {
            table_id: outcome.table_id.clone(),
            team_name: team.to_string(),
            sync_time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            processing_time_secs: outcome.processing_time.as_secs_f64(),
            is_cold_start: outcome.is_cold_start,
            total_jira_issues: outcome.total_jira_issues as u64,
            filtered_issues: outcome.filtered_issues as u64,
            created_records: outcome.created_records as u64,
            updated_records: outcome.updated_records as u64,
            failed_operations: outcome.failed_operations as u64,
        };
        if let Err(err) = self.store.insert_table_metrics(&[row]) {
            warn!(error = %err, table_id = %outcome.table_id, "table metrics write failed");
        }
    }

    pub fn summary(&self, days: u32) -> Result<MetricsSummary> {
        self.store.summary_since(days)
    }

    pub fn table_report(&self, table_id: &str, days: u32) -> Result<TableReport> {
        self.store.table_report(table_id, days)
    }

    pub fn export_json(&self, days: u32) -> Result<serde_json::Value> {
        self.store.export_json(days)
    }

    pub fn cleanup(&self, days: u32) -> Result<usize> {
        self.store.cleanup_older_than(days)
    }

    pub fn vacuum(&self) -> Result<()> {
        self.store.vacuum()
    }
}
