//! The scheduling daemon.
//!
//! Every enabled (team, table) pair keeps its own `next_sync_at`; the loop
//! scans them every ten seconds and launches due tables concurrently, each as
//! its own task. Success reschedules at the table's interval, failure backs
//! off sixty seconds. A pause flag gates dispatch for the nightly cleanup
//! window, and the config file's mtime is polled so edits apply without a
//! restart while preserving per-table schedules.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveTime};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use larksync_core::time::now_ms;
use larksync_engine::Coordinator;
use larksync_schema::Config;

/// Scheduler scan cadence.
const SCAN_EVERY_SECS: u64 = 10;
/// Config mtime poll cadence.
const CONFIG_POLL_EVERY_SECS: u64 = 2;
/// Reschedule delay after a failed cycle.
const FAILURE_BACKOFF_SECS: i64 = 60;
/// Retention applied during the nightly window.
const LOG_RETENTION_DAYS: u32 = 30;
const METRICS_RETENTION_DAYS: u32 = 90;

#[derive(Debug, Clone)]
struct TableSlot {
    team: String,
    table: String,
    interval_secs: u64,
    /// Epoch ms; zero means run immediately.
    next_sync_at: i64,
}

fn build_slots(config: &Config, previous: &HashMap<String, TableSlot>) -> HashMap<String, TableSlot> {
    let mut slots = HashMap::new();
    for (team, table, interval_secs) in config.all_schedules() {
        let key = format!("{team}.{table}");
        // A reload keeps the existing schedule instead of re-running
        // everything at once.
        let next_sync_at = previous.get(&key).map(|s| s.next_sync_at).unwrap_or(0);
        slots.insert(
            key,
            TableSlot {
                team,
                table,
                interval_secs,
                next_sync_at,
            },
        );
    }
    slots
}

fn config_mtime(path: &PathBuf) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn cleanup_due(last_cleanup: NaiveDate, cleanup_at: NaiveTime) -> bool {
    let now = Local::now();
    now.date_naive() > last_cleanup && now.time() >= cleanup_at
}

pub async fn run(config_path: PathBuf, config: Config) -> Result<ExitCode> {
    let mut coordinator = Arc::new(Coordinator::new(config.clone())?);
    let mut config = config;
    let mut slots = build_slots(&config, &HashMap::new());
    let mut last_mtime = config_mtime(&config_path);

    // Daily cleanup window; the first one fires on the next date change.
    let cleanup_at = NaiveTime::MIN;
    let mut last_cleanup = Local::now().date_naive();

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(String, bool)>();
    let mut running: HashSet<String> = HashSet::new();
    let mut paused = false;
    let mut interrupted = false;
    let mut stopping = false;

    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("installing SIGTERM handler")?;

    info!(tables = slots.len(), "daemon started");
    for slot in slots.values() {
        info!(
            team = %slot.team,
            table = %slot.table,
            interval_secs = slot.interval_secs,
            "table scheduled"
        );
    }

    let mut tick: u64 = 0;
    while !stopping {
        // Reap finished syncs and reschedule their tables.
        while let Ok((key, success)) = done_rx.try_recv() {
            running.remove(&key);
            if let Some(slot) = slots.get_mut(&key) {
                slot.next_sync_at = if success {
                    now_ms() + slot.interval_secs as i64 * 1000
                } else {
                    now_ms() + FAILURE_BACKOFF_SECS * 1000
                };
            }
        }

        if tick % CONFIG_POLL_EVERY_SECS == 0 {
            let mtime = config_mtime(&config_path);
            if mtime.is_some() && mtime != last_mtime {
                last_mtime = mtime;
                match Config::load(&config_path) {
                    Ok(new_config) => match Coordinator::new(new_config.clone()) {
                        Ok(new_coordinator) => {
                            info!("config changed, reloading");
                            coordinator = Arc::new(new_coordinator);
                            config = new_config;
                            slots = build_slots(&config, &slots);
                        }
                        Err(err) => error!(error = %err, "reload failed, keeping old config"),
                    },
                    Err(err) => error!(error = %err, "config invalid, keeping old config"),
                }
            }
        }

        if !paused && tick % SCAN_EVERY_SECS == 0 {
            let now = now_ms();
            for (key, slot) in &slots {
                if slot.next_sync_at > now || running.contains(key) {
                    continue;
                }
                running.insert(key.clone());
                let coordinator = coordinator.clone();
                let done_tx = done_tx.clone();
                let key = key.clone();
                let team = slot.team.clone();
                let table = slot.table.clone();
                tokio::spawn(async move {
                    info!(team = %team, table = %table, "table sync starting");
                    let success = match coordinator.sync_table(&team, &table, false).await {
                        Ok(outcome) => {
                            if outcome.success {
                                info!(
                                    team = %team,
                                    table = %table,
                                    created = outcome.created_records,
                                    updated = outcome.updated_records,
                                    "table sync done"
                                );
                            } else {
                                warn!(
                                    team = %team,
                                    table = %table,
                                    error = outcome.error.as_deref().unwrap_or("unknown"),
                                    "table sync failed"
                                );
                            }
                            outcome.success
                        }
                        Err(err) => {
                            error!(team = %team, table = %table, error = %err, "table sync errored");
                            false
                        }
                    };
                    let _ = done_tx.send((key, success));
                });
            }
        }

        if !paused && cleanup_due(last_cleanup, cleanup_at) {
            info!("daily cleanup window: pausing dispatch");
            paused = true;
        }
        if paused && running.is_empty() {
            // All in-flight syncs drained; safe to touch the tables.
            match coordinator.clean_all_tables(false).await {
                Ok(reports) => {
                    for report in reports {
                        info!(
                            team = %report.team,
                            table = %report.table,
                            deleted = report.deleted_records,
                            "table cleaned"
                        );
                    }
                }
                Err(err) => error!(error = %err, "table cleaner failed"),
            }
            match coordinator.cleanup_old_data(LOG_RETENTION_DAYS, METRICS_RETENTION_DAYS) {
                Ok(summary) => info!(
                    log_rows = summary.log_rows_removed,
                    metrics_rows = summary.metrics_rows_removed,
                    "retention sweep done"
                ),
                Err(err) => error!(error = %err, "retention sweep failed"),
            }
            last_cleanup = Local::now().date_naive();
            paused = false;
            info!("daily cleanup done, resuming dispatch");
        }

        // One-second ticks keep shutdown prompt.
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = tokio::signal::ctrl_c() => {
                    interrupted = true;
                    stopping = true;
                }
                _ = sigterm.recv() => {
                    stopping = true;
                }
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = tokio::signal::ctrl_c() => {
                    interrupted = true;
                    stopping = true;
                }
            }
        }
        tick = tick.wrapping_add(1);
    }

    // Let in-flight syncs finish their current work before exiting.
    if !running.is_empty() {
        info!(in_flight = running.len(), "waiting for running syncs");
        while !running.is_empty() {
            match tokio::time::timeout(Duration::from_secs(1), done_rx.recv()).await {
                Ok(Some((key, _))) => {
                    running.remove(&key);
                }
                Ok(None) => break,
                Err(_) => {}
            }
        }
    }

    info!("daemon stopped");
    Ok(if interrupted {
        // Conventional code for SIGINT.
        ExitCode::from(130)
    } else {
        ExitCode::SUCCESS
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let yaml = r#"
global:
  schema_file: schema.yaml
  data_directory: data
  default_sync_interval: 300
jira:
  server_url: https://jira.example.com
  username: bot
  password: secret
lark_base:
  app_id: a
  app_secret: b
user_mapping:
  enabled: false
teams:
  platform:
    wiki_token: w
    tables:
      issues:
        name: issues
        table_id: tbl_1
        jql_query: project = TP
        sync_interval: 60
      bugs:
        name: bugs
        table_id: tbl_2
        jql_query: project = BUG
"#;
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_build_slots_initializes_immediate() {
        let slots = build_slots(&test_config(), &HashMap::new());
        assert_eq!(slots.len(), 2);
        let slot = &slots["platform.issues"];
        assert_eq!(slot.interval_secs, 60);
        assert_eq!(slot.next_sync_at, 0);
        assert_eq!(slots["platform.bugs"].interval_secs, 300);
    }

    #[test]
    fn test_build_slots_preserves_schedule_across_reload() {
        let config = test_config();
        let mut slots = build_slots(&config, &HashMap::new());
        slots.get_mut("platform.issues").unwrap().next_sync_at = 12345;

        let reloaded = build_slots(&config, &slots);
        assert_eq!(reloaded["platform.issues"].next_sync_at, 12345);
        assert_eq!(reloaded["platform.bugs"].next_sync_at, 0);
    }

    #[test]
    fn test_cleanup_due_only_after_date_change() {
        let midnight = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
        let today = Local::now().date_naive();
        assert!(!cleanup_due(today, midnight));

        let yesterday = today.pred_opt().unwrap();
        assert!(cleanup_due(yesterday, midnight));
    }
}
