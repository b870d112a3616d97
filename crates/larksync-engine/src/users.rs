//! Cross-system identity resolution.
//!
//! Mapping a JIRA user during a sync cycle is cache-only and never blocks:
//! unknown usernames are marked pending and come back blank until an
//! out-of-band [`UserMapper::resolve_pending`] pass finds them in the Lark
//! directory (or tombstones them as not found).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use larksync_connectors::LarkClient;
use larksync_store::{CacheStats, UserCache, UserMapping};

/// Usernames first seen during the current cycle.
#[derive(Debug, Clone, Default)]
pub struct PendingReport {
    pub found: usize,
    pub usernames: Vec<String>,
}

/// Result of a batch resolution pass.
#[derive(Debug, Clone, Default)]
pub struct LookupStats {
    pub total_pending: usize,
    pub processed: usize,
    pub resolved: usize,
    pub failed: usize,
}

pub struct UserMapper {
    cache: Arc<UserCache>,
    lark: Arc<LarkClient>,
    domains: Vec<String>,
    pending: Mutex<HashSet<String>>,
}

impl UserMapper {
    pub fn new(cache: Arc<UserCache>, lark: Arc<LarkClient>, domains: Vec<String>) -> Self {
        Self {
            cache,
            lark,
            domains,
            pending: Mutex::new(HashSet::new()),
        }
    }

    /// `alice@corp.com` → `alice`; a bare username passes through trimmed.
    pub fn username_from_identifier(identifier: &str) -> Option<String> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return None;
        }
        let username = identifier.split('@').next().unwrap_or(identifier).trim();
        if username.is_empty() {
            None
        } else {
            Some(username.to_string())
        }
    }

    /// Resolve a JIRA user object to the target's person-field shape:
    /// `[{"id": …}]` on a cache hit, `[]` otherwise. Never hits the network.
    pub fn map_user(&self, jira_user: &Value) -> Vec<Value> {
        let Value::Object(user) = jira_user else {
            return Vec::new();
        };

        let identifier = user
            .get("emailAddress")
            .and_then(|e| e.as_str())
            .or_else(|| user.get("name").and_then(|n| n.as_str()));
        let Some(identifier) = identifier else {
            let display_name = user
                .get("displayName")
                .and_then(|d| d.as_str())
                .unwrap_or("unknown");
            warn!(display_name, "JIRA user carries neither emailAddress nor name");
            return Vec::new();
        };
        let Some(username) = Self::username_from_identifier(identifier) else {
            warn!(identifier, "could not derive a username");
            return Vec::new();
        };

        match self.cache.get(&username) {
            Ok(Some(mapping)) if mapping.is_resolved() => {
                let id = mapping.lark_user_id.unwrap_or_default();
                debug!(username, lark_user_id = %id, "user cache hit");
                vec![json!({"id": id})]
            }
            Ok(Some(mapping)) => {
                debug!(
                    username,
                    pending = mapping.is_pending,
                    empty = mapping.is_empty,
                    "user not mapped this cycle"
                );
                Vec::new()
            }
            Ok(None) => {
                self.mark_pending(&username);
                Vec::new()
            }
            Err(err) => {
                warn!(username, error = %err, "user cache read failed");
                Vec::new()
            }
        }
    }

    fn mark_pending(&self, username: &str) {
        if let Err(err) = self.cache.set(username, &UserMapping::pending()) {
            warn!(username, error = %err, "could not mark user pending");
            return;
        }
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(username.to_string());
        debug!(username, "user marked pending");
    }

    /// Candidate emails in domain order. A `.suffix@domain` entry composes
    /// `username.suffix@domain`; everything else is `username@domain`.
    fn candidate_emails(&self, username: &str) -> Vec<String> {
        self.domains
            .iter()
            .map(|domain| {
                if domain.starts_with('.') && domain.contains('@') {
                    format!("{username}{domain}")
                } else {
                    format!("{username}@{domain}")
                }
            })
            .collect()
    }

    /// Drive the actual directory lookup for one username. First hit writes
    /// the resolved row; exhausting every candidate writes a tombstone.
    pub async fn perform_lookup(&self, username: &str) -> Result<Option<UserMapping>> {
        if self.domains.is_empty() {
            warn!("no user-mapping domains configured");
            self.cache.set(username, &UserMapping::empty())?;
            return Ok(None);
        }

        for email in self.candidate_emails(username) {
            debug!(username, email, "trying directory lookup");
            match self.lark.get_user_by_email(&email).await {
                Ok(Some(user)) => {
                    let mapping =
                        UserMapping::resolved(email.as_str(), user.user_id.as_str(), user.name.as_str());
                    self.cache.set(username, &mapping)?;
                    info!(username, email = %email, lark_user_id = %user.user_id, "user resolved");
                    return Ok(Some(mapping));
                }
                Ok(None) => {}
                Err(err) => debug!(username, email, error = %err, "lookup failed"),
            }
        }

        warn!(username, domains = ?self.domains, "user not found in any domain");
        self.cache.set(username, &UserMapping::empty())?;
        Ok(None)
    }

    /// Resolve up to `limit` pending usernames.
    pub async fn resolve_pending(&self, limit: usize) -> Result<LookupStats> {
        let pending = self.cache.pending_usernames()?;
        let mut stats = LookupStats {
            total_pending: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            info!("no pending users to resolve");
            return Ok(stats);
        }

        for username in pending.into_iter().take(limit) {
            stats.processed += 1;
            match self.perform_lookup(&username).await {
                Ok(Some(_)) => stats.resolved += 1,
                Ok(None) => stats.failed += 1,
                Err(err) => {
                    warn!(username, error = %err, "lookup errored");
                    stats.failed += 1;
                }
            }
        }
        info!(
            processed = stats.processed,
            resolved = stats.resolved,
            failed = stats.failed,
            "pending user resolution done"
        );
        Ok(stats)
    }

    /// Usernames first seen this cycle; clears the set for the next cycle.
    pub fn report_pending(&self) -> PendingReport {
        let mut guard = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let mut usernames: Vec<String> = guard.drain().collect();
        usernames.sort();
        if !usernames.is_empty() {
            info!(count = usernames.len(), users = ?usernames, "new pending users this cycle");
        }
        PendingReport {
            found: usernames.len(),
            usernames,
        }
    }

    pub fn cache_stats(&self) -> Result<CacheStats> {
        self.cache.stats()
    }

    pub fn clear_pending(&self) -> Result<usize> {
        self.cache.clear_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larksync_schema::LarkBaseConfig;
    use tempfile::tempdir;

    fn mapper(domains: Vec<String>) -> (tempfile::TempDir, UserMapper) {
        let dir = tempdir().unwrap();
        let cache = Arc::new(UserCache::open(dir.path().join("cache.db")).unwrap());
        let lark = Arc::new(
            LarkClient::new(&LarkBaseConfig {
                app_id: "cli_test".into(),
                app_secret: "secret".into(),
            })
            .unwrap(),
        );
        (dir, UserMapper::new(cache, lark, domains))
    }

    #[test]
    fn test_username_from_identifier() {
        assert_eq!(
            UserMapper::username_from_identifier("alice@corp.com").as_deref(),
            Some("alice")
        );
        assert_eq!(
            UserMapper::username_from_identifier("  bob  ").as_deref(),
            Some("bob")
        );
        assert_eq!(UserMapper::username_from_identifier(""), None);
        assert_eq!(UserMapper::username_from_identifier("@corp.com"), None);
    }

    #[test]
    fn test_candidate_emails_compound_rule() {
        let (_dir, mapper) = mapper(vec![".tcg@gmail.com".into(), "corp.com".into()]);
        assert_eq!(
            mapper.candidate_emails("alice"),
            vec!["alice.tcg@gmail.com", "alice@corp.com"]
        );
    }

    #[test]
    fn test_map_user_prefers_email_over_name() {
        let (_dir, mapper) = mapper(vec!["corp.com".into()]);
        mapper
            .cache
            .set("alice", &UserMapping::resolved("alice@corp.com", "user_42", "Alice"))
            .unwrap();

        let result = mapper.map_user(&json!({
            "emailAddress": "alice@corp.com",
            "name": "ignored",
        }));
        assert_eq!(result, vec![json!({"id": "user_42"})]);
    }

    #[test]
    fn test_map_user_falls_back_to_name() {
        let (_dir, mapper) = mapper(vec!["corp.com".into()]);
        mapper
            .cache
            .set("bob", &UserMapping::resolved("bob@corp.com", "user_7", "Bob"))
            .unwrap();
        let result = mapper.map_user(&json!({"name": "bob"}));
        assert_eq!(result, vec![json!({"id": "user_7"})]);
    }

    #[test]
    fn test_map_user_miss_marks_pending_and_returns_empty() {
        let (_dir, mapper) = mapper(vec!["corp.com".into()]);
        let result = mapper.map_user(&json!({"name": "carol"}));
        assert!(result.is_empty());

        let cached = mapper.cache.get("carol").unwrap().unwrap();
        assert!(cached.is_pending);

        let report = mapper.report_pending();
        assert_eq!(report.found, 1);
        assert_eq!(report.usernames, vec!["carol"]);
        // The set is cleared once reported.
        assert_eq!(mapper.report_pending().found, 0);
    }

    #[test]
    fn test_map_user_sentinels_return_empty_without_re_marking() {
        let (_dir, mapper) = mapper(vec!["corp.com".into()]);
        mapper.cache.set("dave", &UserMapping::empty()).unwrap();

        assert!(mapper.map_user(&json!({"name": "dave"})).is_empty());
        // Tombstoned users do not show up in the cycle report.
        assert_eq!(mapper.report_pending().found, 0);
    }

    #[test]
    fn test_map_user_without_identifiers() {
        let (_dir, mapper) = mapper(vec!["corp.com".into()]);
        assert!(mapper.map_user(&json!({"displayName": "Mystery"})).is_empty());
        assert!(mapper.map_user(&Value::Null).is_empty());
    }

    #[tokio::test]
    async fn test_perform_lookup_without_domains_tombstones() {
        let (_dir, mapper) = mapper(Vec::new());
        let result = mapper.perform_lookup("erin").await.unwrap();
        assert!(result.is_none());
        assert!(mapper.cache.get("erin").unwrap().unwrap().is_empty);
    }
}
