//! larksync — one-way JIRA → Lark Base synchronization.

mod daemon;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

use larksync_engine::Coordinator;
use larksync_schema::Config;

#[derive(Parser)]
#[command(name = "larksync", about = "One-way JIRA → Lark Base sync")]
struct Cli {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml", env = "LARKSYNC_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a system summary
    Status,

    /// Run a one-shot sync
    Sync {
        /// Restrict to one team
        #[arg(long)]
        team: Option<String>,

        /// Restrict to one table (requires --team)
        #[arg(long, requires = "team")]
        table: Option<String>,

        /// Refresh every row present in the target tables
        #[arg(long)]
        full_update: bool,
    },

    /// Run the scheduling daemon
    Daemon,

    /// Sync a single issue into one table
    Issue {
        team: String,
        table: String,
        issue_key: String,
    },

    /// Processing-log cache management
    Cache {
        /// Wipe and rebuild from the live target table contents
        #[arg(long)]
        rebuild: bool,

        #[arg(long)]
        team: Option<String>,

        #[arg(long, requires = "team")]
        table: Option<String>,
    },

    /// User-mapping cache operations
    Users {
        /// Resolve pending usernames against the directory
        #[arg(long)]
        resolve: bool,

        /// Bound for one resolution pass
        #[arg(long, default_value_t = 50)]
        limit: usize,

        /// Print cache counters
        #[arg(long)]
        stats: bool,
    },
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.global.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config);

    match run(cli, config).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: Config) -> Result<ExitCode> {
    match cli.command {
        Commands::Status => {
            let coordinator = Coordinator::new(config)?;
            let status = coordinator.system_status();
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Sync {
            team,
            table,
            full_update,
        } => {
            let coordinator = Coordinator::new(config)?;
            let ok = match (team, table) {
                (Some(team), Some(table)) => {
                    let outcome = coordinator.sync_table(&team, &table, full_update).await?;
                    print_table_outcome(&team, &table, &outcome);
                    outcome.success
                }
                (Some(team), None) => {
                    let outcome = coordinator.sync_team(&team, full_update).await;
                    for (table, result) in &outcome.tables {
                        print_table_outcome(&team, table, result);
                    }
                    outcome.success
                }
                _ => {
                    let session = coordinator.sync_all_teams(full_update).await;
                    println!(
                        "{}/{} tables ok, created {}, updated {}, failed {} ({:.1?})",
                        session.successful_tables,
                        session.total_tables,
                        session.total_created,
                        session.total_updated,
                        session.total_failed,
                        session.processing_time,
                    );
                    session.success
                }
            };
            Ok(exit_for(ok))
        }

        Commands::Daemon => {
            let code = daemon::run(cli.config, config).await?;
            Ok(code)
        }

        Commands::Issue {
            team,
            table,
            issue_key,
        } => {
            let coordinator = Coordinator::new(config)?;
            let outcome = coordinator.sync_issue(&team, &table, &issue_key).await?;
            print_table_outcome(&team, &table, &outcome);
            Ok(exit_for(outcome.success))
        }

        Commands::Cache {
            rebuild,
            team,
            table,
        } => {
            if !rebuild {
                eprintln!("nothing to do: pass --rebuild");
                return Ok(ExitCode::FAILURE);
            }
            let coordinator = Coordinator::new(config)?;
            let rebuilt = coordinator
                .rebuild_processing_log(team.as_deref(), table.as_deref())
                .await?;
            for (team, table, summary) in rebuilt {
                println!(
                    "{team}.{table}: {} target rows, {} registered",
                    summary.total_target_rows, summary.recorded
                );
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Users {
            resolve,
            limit,
            stats,
        } => {
            let coordinator = Coordinator::new(config)?;
            if resolve {
                let result = coordinator.resolve_pending_users(limit).await?;
                println!(
                    "pending {}, processed {}, resolved {}, failed {}",
                    result.total_pending, result.processed, result.resolved, result.failed
                );
            }
            if stats || !resolve {
                match coordinator.user_cache_stats()? {
                    Some(stats) => println!(
                        "cached users: {} total, {} resolved, {} pending, {} not found",
                        stats.total, stats.resolved, stats.pending, stats.empty
                    ),
                    None => println!("user mapping is disabled"),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_table_outcome(team: &str, table: &str, outcome: &larksync_engine::SyncOutcome) {
    let status = if outcome.success { "ok" } else { "FAILED" };
    println!(
        "{team}.{table}: {status} — {} issues, {} to process, created {}, updated {}, failed {}{}",
        outcome.total_jira_issues,
        outcome.filtered_issues,
        outcome.created_records,
        outcome.updated_records,
        outcome.failed_operations,
        outcome
            .error
            .as_deref()
            .map(|e| format!(" ({e})"))
            .unwrap_or_default(),
    );
}

fn exit_for(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
