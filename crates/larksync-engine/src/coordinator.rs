//! Top-level coordination: owns the long-lived singletons, fans out over
//! teams with bounded parallelism and keeps each team's tables sequential so
//! one team's rate-limit budget stays coherent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use larksync_connectors::{JiraClient, LarkClient};
use larksync_schema::{Config, FieldSchema};
use larksync_store::{CacheStats, MetricsStore, UserCache};

use crate::batch::BatchProcessor;
use crate::cleaner::{CleanReport, TableCleaner};
use crate::fields::FieldProcessor;
use crate::metrics::MetricsCollector;
use crate::state::{ColdStartSummary, StateManager};
use crate::users::{LookupStats, UserMapper};
use crate::workflow::{SyncOutcome, TableSyncSpec, WorkflowManager};

/// Concurrent team fan-out bound.
const MAX_CONCURRENT_TEAMS: usize = 3;

/// Result of one coordinator run over all teams.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub success: bool,
    pub total_teams: usize,
    pub total_tables: usize,
    pub successful_tables: usize,
    pub failed_tables: usize,
    pub total_processed: usize,
    pub total_created: usize,
    pub total_updated: usize,
    pub total_failed: usize,
    pub processing_time: Duration,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub team_results: Vec<TeamOutcome>,
}

/// Result of syncing one team's tables.
#[derive(Debug, Clone)]
pub struct TeamOutcome {
    pub team: String,
    pub success: bool,
    pub error: Option<String>,
    pub tables: Vec<(String, SyncOutcome)>,
}

/// Counters from the retention sweep.
#[derive(Debug, Clone, Default)]
pub struct CleanupSummary {
    pub log_rows_removed: usize,
    pub metrics_rows_removed: usize,
    pub stores_vacuumed: usize,
}

pub struct Coordinator {
    config: Config,
    schema: FieldSchema,
    state: Arc<StateManager>,
    metrics: MetricsCollector,
    user_cache: Option<Arc<UserCache>>,
    jira_clients: Mutex<HashMap<String, Arc<JiraClient>>>,
    lark_clients: Mutex<HashMap<String, Arc<LarkClient>>>,
    user_mappers: Mutex<HashMap<String, Arc<UserMapper>>>,
    field_processors: Mutex<HashMap<String, Arc<FieldProcessor>>>,
}

impl Coordinator {
    pub fn new(config: Config) -> Result<Self> {
        let schema = FieldSchema::load(&config.global.schema_file)
            .context("loading field schema")?;
        std::fs::create_dir_all(&config.global.data_directory)
            .context("creating data directory")?;

        let state = Arc::new(StateManager::new(&config.global.data_directory));
        let metrics_store = Arc::new(
            MetricsStore::open(config.global.data_directory.join("sync_metrics.db"))
                .context("opening metrics store")?,
        );
        let user_cache = if config.user_mapping.enabled {
            let path = config
                .user_mapping
                .cache_db
                .clone()
                .ok_or_else(|| anyhow!("user_mapping.cache_db missing"))?;
            Some(Arc::new(UserCache::open(path).context("opening user cache")?))
        } else {
            None
        };

        info!(teams = config.teams.len(), "coordinator ready");
        Ok(Self {
            config,
            schema,
            state,
            metrics: MetricsCollector::new(metrics_store),
            user_cache,
            jira_clients: Mutex::new(HashMap::new()),
            lark_clients: Mutex::new(HashMap::new()),
            user_mappers: Mutex::new(HashMap::new()),
            field_processors: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    /// One JIRA client per `(server_url, username)`.
    fn jira_client(&self) -> Result<Arc<JiraClient>> {
        let key = format!(
            "{}|{}",
            self.config.jira.server_url, self.config.jira.username
        );
        let mut clients = self.jira_clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        let client = Arc::new(JiraClient::new(&self.config.jira)?);
        clients.insert(key, client.clone());
        Ok(client)
    }

    /// One Lark client per `(app_id, app_secret)`.
    fn lark_client(&self) -> Result<Arc<LarkClient>> {
        let key = self.config.lark_base.app_id.clone();
        let mut clients = self.lark_clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        let client = Arc::new(LarkClient::new(&self.config.lark_base)?);
        clients.insert(key, client.clone());
        Ok(client)
    }

    fn user_mapper(&self, team: &str) -> Result<Option<Arc<UserMapper>>> {
        let Some(cache) = &self.user_cache else {
            return Ok(None);
        };
        let mut mappers = self.user_mappers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mapper) = mappers.get(team) {
            return Ok(Some(mapper.clone()));
        }
        let mapper = Arc::new(UserMapper::new(
            cache.clone(),
            self.lark_client()?,
            self.config.user_mapping.domains.clone(),
        ));
        mappers.insert(team.to_string(), mapper.clone());
        Ok(Some(mapper))
    }

    fn field_processor(&self, team: &str) -> Result<Arc<FieldProcessor>> {
        let mut processors = self
            .field_processors
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(processor) = processors.get(team) {
            return Ok(processor.clone());
        }
        let processor = Arc::new(FieldProcessor::new(
            self.schema.clone(),
            &self.config.jira.server_url,
            self.config.issue_link_rules.clone(),
            self.user_mapper(team)?,
        ));
        processors.insert(team.to_string(), processor.clone());
        Ok(processor)
    }

    fn workflow(&self, team: &str) -> Result<WorkflowManager> {
        let jira = self.jira_client()?;
        let lark = self.lark_client()?;
        let fields = self.field_processor(team)?;
        let batch = BatchProcessor::new(lark.clone(), fields.clone(), self.user_mapper(team)?);
        Ok(WorkflowManager::new(
            jira,
            lark,
            fields,
            self.state.clone(),
            batch,
        ))
    }

    fn table_spec(&self, team: &str, table: &str, full_update: bool) -> Result<TableSyncSpec> {
        let team_cfg = self
            .config
            .team(team)
            .ok_or_else(|| anyhow!("unknown or disabled team: {team}"))?;
        let table_cfg = team_cfg
            .enabled_table(table)
            .ok_or_else(|| anyhow!("unknown or disabled table: {team}.{table}"))?;
        Ok(TableSyncSpec {
            team: team.to_string(),
            table_name: table.to_string(),
            table_id: table_cfg.table_id.clone().unwrap_or_default(),
            wiki_token: team_cfg.wiki_token.clone().unwrap_or_default(),
            jql_query: table_cfg.jql_query.clone().unwrap_or_default(),
            ticket_field: table_cfg.ticket_field().to_string(),
            excluded_fields: table_cfg.excluded_fields.clone(),
            cold_start_detection: !full_update,
            full_update,
        })
    }

    /// Sync every enabled team, at most [`MAX_CONCURRENT_TEAMS`] at a time.
    pub async fn sync_all_teams(&self, full_update: bool) -> SessionOutcome {
        let start_time = Utc::now();
        let started = std::time::Instant::now();

        let teams: Vec<String> = self
            .config
            .enabled_teams()
            .map(|(name, _)| name.to_string())
            .collect();
        if teams.is_empty() {
            warn!("no enabled teams");
        }

        let team_results: Vec<TeamOutcome> = stream::iter(teams.iter())
            .map(|team| self.sync_team(team, full_update))
            .buffer_unordered(MAX_CONCURRENT_TEAMS)
            .collect()
            .await;

        let mut outcome = SessionOutcome {
            success: true,
            total_teams: teams.len(),
            total_tables: 0,
            successful_tables: 0,
            failed_tables: 0,
            total_processed: 0,
            total_created: 0,
            total_updated: 0,
            total_failed: 0,
            processing_time: started.elapsed(),
            start_time,
            end_time: Utc::now(),
            team_results,
        };
        for team in &outcome.team_results {
            for (_, table) in &team.tables {
                outcome.total_tables += 1;
                if table.success {
                    outcome.successful_tables += 1;
                } else {
                    outcome.failed_tables += 1;
                }
                outcome.total_created += table.created_records;
                outcome.total_updated += table.updated_records;
                outcome.total_failed += table.failed_operations;
                outcome.total_processed +=
                    table.created_records + table.updated_records + table.failed_operations;
            }
            if !team.success {
                outcome.success = false;
            }
        }
        outcome.success = outcome.success && outcome.failed_tables == 0;
        outcome.end_time = Utc::now();
        outcome.processing_time = started.elapsed();

        info!(
            tables_ok = outcome.successful_tables,
            tables_failed = outcome.failed_tables,
            elapsed = ?outcome.processing_time,
            "session done"
        );
        self.metrics.record_session(&outcome);
        outcome
    }

    /// Sync one team's enabled tables sequentially.
    pub async fn sync_team(&self, team: &str, full_update: bool) -> TeamOutcome {
        let workflow = match self.workflow(team) {
            Ok(workflow) => workflow,
            Err(err) => {
                error!(team, error = %err, "team setup failed");
                return TeamOutcome {
                    team: team.to_string(),
                    success: false,
                    error: Some(format!("{err:#}")),
                    tables: Vec::new(),
                };
            }
        };

        let table_names: Vec<String> = match self.config.team(team) {
            Some(team_cfg) => team_cfg
                .enabled_tables()
                .map(|(name, _)| name.to_string())
                .collect(),
            None => Vec::new(),
        };

        let mut tables = Vec::new();
        let mut success = true;
        for table in table_names {
            match self.table_spec(team, &table, full_update) {
                Ok(spec) => {
                    let outcome = workflow.run(&spec).await;
                    self.metrics.record_table(team, &outcome);
                    success &= outcome.success;
                    tables.push((table, outcome));
                }
                Err(err) => {
                    error!(team, table = %table, error = %err, "bad table spec");
                    success = false;
                }
            }
        }
        TeamOutcome {
            team: team.to_string(),
            success,
            error: None,
            tables,
        }
    }

    pub async fn sync_table(
        &self,
        team: &str,
        table: &str,
        full_update: bool,
    ) -> Result<SyncOutcome> {
        let spec = self.table_spec(team, table, full_update)?;
        let workflow = self.workflow(team)?;
        let outcome = workflow.run(&spec).await;
        self.metrics.record_table(team, &outcome);
        Ok(outcome)
    }

    pub async fn sync_issue(&self, team: &str, table: &str, issue_key: &str) -> Result<SyncOutcome> {
        let spec = self.table_spec(team, table, false)?;
        let workflow = self.workflow(team)?;
        Ok(workflow.run_single_issue(&spec, issue_key).await)
    }

    /// Wipe and rebuild processing logs from live target contents. When the
    /// configured ticket field yields nothing against a non-empty table, the
    /// schema's declared candidates are tried against the live field list.
    pub async fn rebuild_processing_log(
        &self,
        team: Option<&str>,
        table: Option<&str>,
    ) -> Result<Vec<(String, String, ColdStartSummary)>> {
        let lark = self.lark_client()?;
        let mut rebuilt = Vec::new();

        for (team_name, team_cfg) in self.config.enabled_teams() {
            if team.is_some_and(|t| t != team_name) {
                continue;
            }
            let wiki_token = team_cfg.wiki_token.clone().unwrap_or_default();
            for (table_name, table_cfg) in team_cfg.enabled_tables() {
                if table.is_some_and(|t| t != table_name) {
                    continue;
                }
                let table_id = table_cfg.table_id.clone().unwrap_or_default();
                let rows = lark
                    .get_all_records(&wiki_token, &table_id)
                    .await
                    .with_context(|| format!("reading {team_name}.{table_name}"))?;

                let mut summary = self.state.prepare_cold_start(
                    &table_id,
                    &rows,
                    table_cfg.ticket_field(),
                    true,
                )?;

                if summary.recorded == 0 && !rows.is_empty() {
                    warn!(
                        team = team_name,
                        table = table_name,
                        ticket_field = table_cfg.ticket_field(),
                        "no tickets found, trying schema candidates"
                    );
                    let available = lark
                        .available_field_names(&wiki_token, &table_id)
                        .await
                        .unwrap_or_default();
                    if let Some(candidate) = self
                        .schema
                        .ticket_field_candidates()
                        .into_iter()
                        .find(|c| available.contains(c) && c != table_cfg.ticket_field())
                    {
                        info!(candidate, "retrying rebuild with schema ticket field");
                        summary =
                            self.state
                                .prepare_cold_start(&table_id, &rows, &candidate, true)?;
                    }
                }

                rebuilt.push((team_name.to_string(), table_name.to_string(), summary));
            }
        }
        if rebuilt.is_empty() {
            bail!("no enabled table matched the rebuild filter");
        }
        Ok(rebuilt)
    }

    /// Run the table cleaner over every enabled table.
    pub async fn clean_all_tables(&self, dry_run: bool) -> Result<Vec<CleanReport>> {
        let cleaner = TableCleaner::new(self.jira_client()?, self.lark_client()?, self.state.clone());
        let mut reports = Vec::new();
        for (team_name, team_cfg) in self.config.enabled_teams() {
            for (table_name, _) in team_cfg.enabled_tables() {
                let spec = self.table_spec(team_name, table_name, false)?;
                match cleaner.scan_and_clean(&spec, dry_run).await {
                    Ok(report) => reports.push(report),
                    Err(err) => {
                        error!(team = team_name, table = table_name, error = %err, "cleaner failed");
                    }
                }
            }
        }
        Ok(reports)
    }

    /// Retention sweep: processing logs (default 30 d), metrics (90 d), then
    /// vacuum.
    pub fn cleanup_old_data(&self, log_days: u32, metrics_days: u32) -> Result<CleanupSummary> {
        // Make sure every configured table's log participates, not just the
        // ones this process has already touched.
        for (_, team_cfg) in self.config.enabled_teams() {
            for (_, table_cfg) in team_cfg.enabled_tables() {
                if let Some(table_id) = &table_cfg.table_id {
                    let _ = self.state.log_for(table_id);
                }
            }
        }

        let log_rows_removed = self.state.cleanup_old(log_days, None)?;
        let metrics_rows_removed = self.metrics.cleanup(metrics_days)?;
        let stores_vacuumed = self.state.vacuum_all()?;
        self.metrics.vacuum()?;
        if let Some(cache) = &self.user_cache {
            cache.vacuum()?;
        }
        Ok(CleanupSummary {
            log_rows_removed,
            metrics_rows_removed,
            stores_vacuumed: stores_vacuumed + 1,
        })
    }

    /// Drive the out-of-band directory lookups for pending users.
    pub async fn resolve_pending_users(&self, limit: usize) -> Result<LookupStats> {
        let team = self
            .config
            .enabled_teams()
            .next()
            .map(|(name, _)| name.to_string())
            .ok_or_else(|| anyhow!("no enabled teams"))?;
        let mapper = self
            .user_mapper(&team)?
            .ok_or_else(|| anyhow!("user mapping is disabled"))?;
        mapper.resolve_pending(limit).await
    }

    pub fn user_cache_stats(&self) -> Result<Option<CacheStats>> {
        self.user_cache.as_ref().map(|c| c.stats()).transpose()
    }

    /// System summary for the `status` command.
    pub fn system_status(&self) -> Value {
        let mut teams = Vec::new();
        for (team_name, team_cfg) in self.config.enabled_teams() {
            let mut tables = Vec::new();
            for (table_name, table_cfg) in team_cfg.enabled_tables() {
                let table_id = table_cfg.table_id.clone().unwrap_or_default();
                let stats = self.state.stats_for(&table_id).ok();
                tables.push(json!({
                    "table": table_name,
                    "table_id": table_id,
                    "sync_interval": self.config.sync_interval(team_name, table_name),
                    "is_cold_start": self.state.is_cold_start(&table_id),
                    "log_records": stats.as_ref().map(|s| s.total_records),
                    "last_processed_at": stats.as_ref().and_then(|s| s.last_processed_at),
                }));
            }
            teams.push(json!({
                "team": team_name,
                "display_name": team_cfg.display_name,
                "tables": tables,
            }));
        }

        let metrics_summary = self
            .metrics
            .summary(7)
            .map(|s| serde_json::to_value(s).unwrap_or(Value::Null))
            .unwrap_or(Value::Null);

        json!({
            "data_directory": self.config.global.data_directory,
            "schema_file": self.config.global.schema_file,
            "teams": teams,
            "metrics_summary_7d": metrics_summary,
            "user_cache": self
                .user_cache_stats()
                .ok()
                .flatten()
                .map(|s| json!({
                    "total": s.total,
                    "resolved": s.resolved,
                    "pending": s.pending,
                    "empty": s.empty,
                })),
        })
    }
}
