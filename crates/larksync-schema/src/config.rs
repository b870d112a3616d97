//! YAML configuration model.
//!
//! Validation happens at load and reports every problem at once; the daemon
//! refuses to start on a bad config.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("config validation failed:\n{}", .0.iter().map(|e| format!("  - {e}")).collect::<Vec<_>>().join("\n"))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub global: GlobalConfig,
    pub jira: JiraConfig,
    pub lark_base: LarkBaseConfig,
    #[serde(default)]
    pub user_mapping: UserMappingConfig,
    #[serde(default)]
    pub teams: IndexMap<String, TeamConfig>,
    #[serde(default)]
    pub issue_link_rules: IndexMap<String, IssueLinkRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    pub schema_file: PathBuf,
    pub data_directory: PathBuf,
    #[serde(default = "default_sync_interval")]
    pub default_sync_interval: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub log_max_size: Option<String>,
    #[serde(default)]
    pub log_backup_count: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JiraConfig {
    #[serde(default)]
    pub server_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LarkBaseConfig {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserMappingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub cache_db: Option<PathBuf>,
    /// Ordered; entries are either `example.com` or `.suffix@example.com`
    /// for the compound-username rule.
    #[serde(default)]
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TeamConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub wiki_token: Option<String>,
    #[serde(default)]
    pub sync_interval: Option<u64>,
    #[serde(default)]
    pub sync_settings: Option<serde_yaml::Value>,
    #[serde(default)]
    pub tables: IndexMap<String, TableConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub table_id: Option<String>,
    #[serde(default)]
    pub jql_query: Option<String>,
    #[serde(default)]
    pub ticket_field: Option<String>,
    #[serde(default)]
    pub sync_interval: Option<u64>,
    #[serde(default)]
    pub excluded_fields: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueLinkRule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Empty means show links to every project.
    #[serde(default)]
    pub display_link_prefixes: Vec<String>,
}

fn default_true() -> bool {
    true
}
fn default_sync_interval() -> u64 {
    300
}
fn default_timeout() -> u64 {
    30
}
fn default_max_results() -> usize {
    1000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load and validate a config file. Fails fast, listing every problem.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        info!(path = %path.display(), teams = config.teams.len(), "config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.jira.server_url.is_empty() {
            errors.push("jira.server_url is required".to_string());
        } else if Url::parse(&self.jira.server_url).is_err() {
            errors.push(format!("jira.server_url is not a valid URL: {}", self.jira.server_url));
        }
        if self.jira.username.is_empty() {
            errors.push("jira.username is required".to_string());
        }
        if self.jira.password.is_empty() {
            errors.push("jira.password is required".to_string());
        }

        if self.lark_base.app_id.is_empty() {
            errors.push("lark_base.app_id is required".to_string());
        }
        if self.lark_base.app_secret.is_empty() {
            errors.push("lark_base.app_secret is required".to_string());
        }

        if self.user_mapping.enabled && self.user_mapping.cache_db.is_none() {
            errors.push("user_mapping.cache_db is required when user mapping is enabled".to_string());
        }

        if self.teams.is_empty() {
            errors.push("at least one team must be configured".to_string());
        }

        for (team_name, team) in &self.teams {
            if !team.enabled {
                continue;
            }
            if team.wiki_token.as_deref().unwrap_or("").is_empty() {
                errors.push(format!("team {team_name} is missing wiki_token"));
            }
            for (table_name, table) in &team.tables {
                if !table.enabled {
                    continue;
                }
                for (field, value) in [
                    ("table_id", &table.table_id),
                    ("jql_query", &table.jql_query),
                    ("name", &table.name),
                ] {
                    if value.as_deref().map(str::trim).unwrap_or("").is_empty() {
                        errors.push(format!("team {team_name} table {table_name} is missing {field}"));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    pub fn enabled_teams(&self) -> impl Iterator<Item = (&str, &TeamConfig)> {
        self.teams
            .iter()
            .filter(|(_, t)| t.enabled)
            .map(|(name, t)| (name.as_str(), t))
    }

    pub fn team(&self, name: &str) -> Option<&TeamConfig> {
        self.teams.get(name).filter(|t| t.enabled)
    }

    /// Sync interval resolution: table > team > global default.
    pub fn sync_interval(&self, team: &str, table: &str) -> u64 {
        if let Some(team_cfg) = self.team(team) {
            if let Some(table_cfg) = team_cfg.enabled_table(table) {
                if let Some(interval) = table_cfg.sync_interval {
                    return interval;
                }
            }
            if let Some(interval) = team_cfg.sync_interval {
                return interval;
            }
        }
        self.global.default_sync_interval
    }

    /// Every enabled (team, table) pair with its effective sync interval.
    pub fn all_schedules(&self) -> Vec<(String, String, u64)> {
        let mut schedules = Vec::new();
        for (team_name, team) in self.enabled_teams() {
            for (table_name, _) in team.enabled_tables() {
                schedules.push((
                    team_name.to_string(),
                    table_name.to_string(),
                    self.sync_interval(team_name, table_name),
                ));
            }
        }
        schedules
    }
}

impl TeamConfig {
    pub fn enabled_tables(&self) -> impl Iterator<Item = (&str, &TableConfig)> {
        self.tables
            .iter()
            .filter(|(_, t)| t.enabled)
            .map(|(name, t)| (name.as_str(), t))
    }

    pub fn enabled_table(&self, name: &str) -> Option<&TableConfig> {
        self.tables.get(name).filter(|t| t.enabled)
    }
}

impl TableConfig {
    pub fn ticket_field(&self) -> &str {
        self.ticket_field.as_deref().unwrap_or("Issue Key")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID: &str = r#"
global:
  schema_file: schema.yaml
  data_directory: data
jira:
  server_url: https://jira.example.com
  username: bot
  password: secret
lark_base:
  app_id: cli_abc
  app_secret: shh
user_mapping:
  enabled: true
  cache_db: data/user_mapping_cache.db
  domains:
    - example.com
teams:
  platform:
    enabled: true
    wiki_token: wiki_tok
    tables:
      issues:
        enabled: true
        name: Platform issues
        table_id: tbl_1
        jql_query: project = TP
"#;

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_valid_config_passes() {
        let config = parse(VALID);
        config.validate().unwrap();
        assert_eq!(config.global.default_sync_interval, 300);
        assert_eq!(config.jira.timeout, 30);
        assert_eq!(config.jira.max_results, 1000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(VALID.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.enabled_teams().count(), 1);
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let yaml = r#"
global:
  schema_file: schema.yaml
  data_directory: data
jira:
  server_url: ""
  username: ""
  password: x
lark_base:
  app_id: ""
  app_secret: y
teams: {}
"#;
        let err = parse(yaml).validate().unwrap_err();
        match err {
            ConfigError::Invalid(errors) => {
                assert!(errors.iter().any(|e| e.contains("server_url")));
                assert!(errors.iter().any(|e| e.contains("username")));
                assert!(errors.iter().any(|e| e.contains("app_id")));
                assert!(errors.iter().any(|e| e.contains("at least one team")));
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_enabled_team_requires_wiki_token() {
        let yaml = VALID.replace("wiki_token: wiki_tok", "wiki_token: \"\"");
        let err = parse(&yaml).validate().unwrap_err();
        assert!(err.to_string().contains("wiki_token"));
    }

    #[test]
    fn test_disabled_team_skips_validation() {
        let yaml = VALID.replace("enabled: true\n    wiki_token", "enabled: false\n    wiki_token");
        // The team is disabled but still the only one; that is accepted.
        parse(&yaml).validate().unwrap();
    }

    #[test]
    fn test_enabled_table_requires_core_fields() {
        let yaml = VALID.replace("table_id: tbl_1", "table_id: \"\"");
        let err = parse(&yaml).validate().unwrap_err();
        assert!(err.to_string().contains("table_id"));
    }

    #[test]
    fn test_sync_interval_resolution() {
        let yaml = r#"
global:
  schema_file: schema.yaml
  data_directory: data
  default_sync_interval: 600
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
  one:
    wiki_token: w
    sync_interval: 120
    tables:
      fast:
        name: fast
        table_id: t1
        jql_query: q
        sync_interval: 30
      inherits_team:
        name: inherits
        table_id: t2
        jql_query: q
  two:
    wiki_token: w
    tables:
      inherits_global:
        name: g
        table_id: t3
        jql_query: q
"#;
        let config = parse(yaml);
        config.validate().unwrap();
        assert_eq!(config.sync_interval("one", "fast"), 30);
        assert_eq!(config.sync_interval("one", "inherits_team"), 120);
        assert_eq!(config.sync_interval("two", "inherits_global"), 600);

        let schedules = config.all_schedules();
        assert_eq!(schedules.len(), 3);
    }

    #[test]
    fn test_ticket_field_default() {
        let config = parse(VALID);
        let team = config.team("platform").unwrap();
        let (_, table) = team.enabled_tables().next().unwrap();
        assert_eq!(table.ticket_field(), "Issue Key");
    }

    #[test]
    fn test_issue_link_rules_parse() {
        let yaml = format!(
            "{VALID}\nissue_link_rules:\n  TP:\n    enabled: true\n    display_link_prefixes: [TP, ICR]\n  default:\n    enabled: true\n"
        );
        let config = parse(&yaml);
        assert_eq!(config.issue_link_rules["TP"].display_link_prefixes, vec!["TP", "ICR"]);
        assert!(config.issue_link_rules["default"].display_link_prefixes.is_empty());
    }
}
