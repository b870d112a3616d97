//! Process-global cache of JIRA username → Lark identity mappings.
//!
//! Three row categories: resolved, `is_empty` (looked up everywhere, not
//! found — a tombstone that stops repeat lookups) and `is_pending` (seen but
//! not yet resolved). A row is never both empty and pending.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

/// One cached mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserMapping {
    pub lark_email: Option<String>,
    pub lark_user_id: Option<String>,
    pub lark_name: Option<String>,
    pub is_empty: bool,
    pub is_pending: bool,
}

impl UserMapping {
    pub fn resolved(
        email: impl Into<String>,
        user_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            lark_email: Some(email.into()),
            lark_user_id: Some(user_id.into()),
            lark_name: Some(name.into()),
            is_empty: false,
            is_pending: false,
        }
    }

    pub fn empty() -> Self {
        Self {
            is_empty: true,
            ..Default::default()
        }
    }

    pub fn pending() -> Self {
        Self {
            is_pending: true,
            ..Default::default()
        }
    }

    pub fn is_resolved(&self) -> bool {
        !self.is_empty && !self.is_pending && self.lark_user_id.is_some()
    }
}

/// Cache counters.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub total: u64,
    pub resolved: u64,
    pub empty: u64,
    pub pending: u64,
}

/// SQLite-backed user mapping cache, shared by every team in the process.
pub struct UserCache {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl UserCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating cache directory {:?}", parent))?;
            }
        }

        let conn =
            Connection::open(&path).with_context(|| format!("opening user cache {:?}", path))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS user_mappings (
                username TEXT PRIMARY KEY,
                lark_email TEXT,
                lark_user_id TEXT,
                lark_name TEXT,
                is_empty INTEGER DEFAULT 0,
                is_pending INTEGER DEFAULT 0,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_user_mappings_lark_email
                ON user_mappings (lark_email);
            CREATE INDEX IF NOT EXISTS idx_user_mappings_status
                ON user_mappings (is_empty, is_pending);",
        )
        .context("initializing user_mappings schema")?;

        debug!(path = %path.display(), "user cache opened");
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

    pub fn get(&self, username: &str) -> Result<Option<UserMapping>> {
        if username.is_empty() {
            return Ok(None);
        }
        let conn = self.conn();
        let mapping = conn
            .query_row(
                "SELECT lark_email, lark_user_id, lark_name, is_empty, is_pending
                 FROM user_mappings WHERE username = ?1",
                params![username],
                |row| {
                    Ok(UserMapping {
                        lark_email: row.get(0)?,
                        lark_user_id: row.get(1)?,
                        lark_name: row.get(2)?,
                        is_empty: row.get::<_, i64>(3)? != 0,
                        is_pending: row.get::<_, i64>(4)? != 0,
                    })
                },
            )
            .optional()
            .context("querying user mapping")?;
        Ok(mapping)
    }

    /// Upsert a mapping. A resolved row must carry email, user id and name;
    /// sentinel rows must be one of empty/pending, never both.
    pub fn set(&self, username: &str, mapping: &UserMapping) -> Result<()> {
        if username.is_empty() {
            bail!("username must not be empty");
        }
        if mapping.is_empty && mapping.is_pending {
            bail!("mapping for {username} cannot be both empty and pending");
        }
        if !mapping.is_empty && !mapping.is_pending {
            let complete = mapping.lark_email.as_deref().is_some_and(|s| !s.is_empty())
                && mapping.lark_user_id.as_deref().is_some_and(|s| !s.is_empty())
                && mapping.lark_name.as_deref().is_some_and(|s| !s.is_empty());
            if !complete {
                bail!("resolved mapping for {username} is missing email, user id or name");
            }
        }

        let conn = self.conn();
        conn.execute(
            "REPLACE INTO user_mappings
             (username, lark_email, lark_user_id, lark_name, is_empty, is_pending, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, CURRENT_TIMESTAMP)",
            params![
                username,
                mapping.lark_email,
                mapping.lark_user_id,
                mapping.lark_name,
                mapping.is_empty as i64,
                mapping.is_pending as i64,
            ],
        )
        .context("writing user mapping")?;
        debug!(username, "user mapping updated");
        Ok(())
    }

    pub fn delete(&self, username: &str) -> Result<bool> {
        let conn = self.conn();
        let deleted = conn
            .execute(
                "DELETE FROM user_mappings WHERE username = ?1",
                params![username],
            )
            .context("deleting user mapping")?;
        Ok(deleted > 0)
    }

    /// Usernames currently marked pending, oldest first.
    pub fn pending_usernames(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT username FROM user_mappings WHERE is_pending = 1 ORDER BY updated_at")
            .context("preparing pending query")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("querying pending users")?;
        let mut usernames = Vec::new();
        for row in rows {
            usernames.push(row.context("reading pending username")?);
        }
        Ok(usernames)
    }

    pub fn clear_pending(&self) -> Result<usize> {
        let conn = self.conn();
        let deleted = conn
            .execute("DELETE FROM user_mappings WHERE is_pending = 1", [])
            .context("clearing pending users")?;
        if deleted > 0 {
            info!(deleted, "pending user rows removed");
        }
        Ok(deleted)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let conn = self.conn();
        let (total, resolved, empty, pending) = conn
            .query_row(
                "SELECT COUNT(*),
                        SUM(CASE WHEN is_empty = 0 AND is_pending = 0 THEN 1 ELSE 0 END),
                        SUM(CASE WHEN is_empty = 1 THEN 1 ELSE 0 END),
                        SUM(CASE WHEN is_pending = 1 THEN 1 ELSE 0 END)
                 FROM user_mappings",
                [],
                |row| {
                    Ok((
                        row.get::<_, u64>(0)?,
                        row.get::<_, Option<u64>>(1)?.unwrap_or(0),
                        row.get::<_, Option<u64>>(2)?.unwrap_or(0),
                        row.get::<_, Option<u64>>(3)?.unwrap_or(0),
                    ))
                },
            )
            .context("querying cache stats")?;
        Ok(CacheStats {
            total,
            resolved,
            empty,
            pending,
        })
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
    use tempfile::tempdir;

    fn open_cache() -> (tempfile::TempDir, UserCache) {
        let dir = tempdir().unwrap();
        let cache = UserCache::open(dir.path().join("user_mapping_cache.db")).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_set_and_get_resolved() {
        let (_dir, cache) = open_cache();
        let mapping = UserMapping::resolved("alice@corp.com", "user_42", "Alice");
        cache.set("alice", &mapping).unwrap();

        let got = cache.get("alice").unwrap().unwrap();
        assert!(got.is_resolved());
        assert_eq!(got.lark_user_id.as_deref(), Some("user_42"));
        assert_eq!(got.lark_email.as_deref(), Some("alice@corp.com"));
    }

    #[test]
    fn test_get_unknown_is_none() {
        let (_dir, cache) = open_cache();
        assert!(cache.get("nobody").unwrap().is_none());
        assert!(cache.get("").unwrap().is_none());
    }

    #[test]
    fn test_sentinel_states() {
        let (_dir, cache) = open_cache();
        cache.set("bob", &UserMapping::pending()).unwrap();
        let got = cache.get("bob").unwrap().unwrap();
        assert!(got.is_pending && !got.is_empty && !got.is_resolved());

        cache.set("bob", &UserMapping::empty()).unwrap();
        let got = cache.get("bob").unwrap().unwrap();
        assert!(got.is_empty && !got.is_pending);
    }

    #[test]
    fn test_resolution_clears_sentinels() {
        let (_dir, cache) = open_cache();
        cache.set("carol", &UserMapping::pending()).unwrap();
        cache
            .set("carol", &UserMapping::resolved("carol@corp.com", "user_7", "Carol"))
            .unwrap();

        let got = cache.get("carol").unwrap().unwrap();
        assert!(!got.is_pending && !got.is_empty && got.is_resolved());
    }

    #[test]
    fn test_rejects_both_sentinels() {
        let (_dir, cache) = open_cache();
        let bad = UserMapping {
            is_empty: true,
            is_pending: true,
            ..Default::default()
        };
        assert!(cache.set("dave", &bad).is_err());
    }

    #[test]
    fn test_rejects_incomplete_resolved_row() {
        let (_dir, cache) = open_cache();
        let bad = UserMapping {
            lark_user_id: Some("user_1".into()),
            ..Default::default()
        };
        assert!(cache.set("erin", &bad).is_err());
    }

    #[test]
    fn test_pending_listing_and_clear() {
        let (_dir, cache) = open_cache();
        cache.set("u1", &UserMapping::pending()).unwrap();
        cache.set("u2", &UserMapping::pending()).unwrap();
        cache.set("u3", &UserMapping::empty()).unwrap();

        let mut pending = cache.pending_usernames().unwrap();
        pending.sort();
        assert_eq!(pending, vec!["u1".to_string(), "u2".to_string()]);

        assert_eq!(cache.clear_pending().unwrap(), 2);
        assert!(cache.pending_usernames().unwrap().is_empty());
        // The tombstone survives the pending sweep.
        assert!(cache.get("u3").unwrap().unwrap().is_empty);
    }

    #[test]
    fn test_stats() {
        let (_dir, cache) = open_cache();
        cache
            .set("a", &UserMapping::resolved("a@x.com", "id_a", "A"))
            .unwrap();
        cache.set("b", &UserMapping::pending()).unwrap();
        cache.set("c", &UserMapping::empty()).unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.empty, 1);
    }

    #[test]
    fn test_delete() {
        let (_dir, cache) = open_cache();
        cache.set("a", &UserMapping::pending()).unwrap();
        assert!(cache.delete("a").unwrap());
        assert!(!cache.delete("a").unwrap());
    }
}
