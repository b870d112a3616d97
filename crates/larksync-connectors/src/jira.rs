//! JIRA REST client focused on data retrieval.
//!
//! `search_issues` is all-or-nothing: it either returns the complete result
//! set of a JQL query or fails with [`ConnectorError::DataIncomplete`], so a
//! workflow never persists state derived from a partial fetch.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tracing::{debug, info, warn};

use larksync_schema::JiraConfig;

use crate::error::ConnectorError;

const RETRY_ATTEMPTS: u32 = 3;
/// JIRA caps a search page at 1000 rows.
const MAX_PAGE_SIZE: usize = 1000;

/// Thin client over the JIRA REST v2 API with HTTP basic auth.
pub struct JiraClient {
    http: reqwest::Client,
    server_url: String,
    username: String,
    password: String,
    max_results: usize,
}

impl JiraClient {
    pub fn new(config: &JiraConfig) -> Result<Self, ConnectorError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()?;
        Ok(Self {
            http,
            server_url: config.server_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            max_results: config.max_results,
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    async fn get_json(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<Value, ConnectorError> {
        let url = format!("{}{}", self.server_url, endpoint);
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .query(params)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ConnectorError::AuthFailed(format!(
                "{} returned {}",
                endpoint, status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    /// GET with bounded retry: exponential backoff starting at 1 s, doubling,
    /// with up to 1 s of jitter, three attempts total.
    async fn get_json_with_retry(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<Value, ConnectorError> {
        let mut last_err = None;
        for attempt in 0..RETRY_ATTEMPTS {
            match self.get_json(endpoint, params).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(endpoint, attempt = attempt + 1, error = %err, "JIRA request failed");
                    last_err = Some(err);
                    if attempt + 1 < RETRY_ATTEMPTS {
                        let jitter = rand::thread_rng().gen_range(0.0..1.0);
                        let delay = Duration::from_secs_f64(f64::from(1 << attempt) + jitter);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ConnectorError::BadResponse("retry loop".into())))
    }

    /// Sanity check; returns the authenticated user's display name.
    pub async fn test_connection(&self) -> Result<String, ConnectorError> {
        let me = self.get_json("/rest/api/2/myself", &[]).await?;
        let name = me
            .get("displayName")
            .and_then(|n| n.as_str())
            .unwrap_or(&self.username)
            .to_string();
        info!(user = %name, "JIRA connection ok");
        Ok(name)
    }

    async fn total_count(&self, jql: &str) -> Result<usize, ConnectorError> {
        let params = [
            ("jql", jql.to_string()),
            ("maxResults", "0".to_string()),
        ];
        let response = self.get_json_with_retry("/rest/api/2/search", &params).await?;
        response
            .get("total")
            .and_then(|t| t.as_u64())
            .map(|t| t as usize)
            .ok_or_else(|| ConnectorError::BadResponse("search response without total".into()))
    }

    fn optimal_page_size(&self, total: usize) -> usize {
        let preferred = if total <= 500 {
            total.max(1)
        } else if total <= 5000 {
            500
        } else {
            MAX_PAGE_SIZE
        };
        preferred.min(self.max_results).min(MAX_PAGE_SIZE).max(1)
    }

    async fn fetch_page(
        &self,
        jql: &str,
        fields_csv: &str,
        start_at: usize,
        page_size: usize,
    ) -> Result<Vec<Value>, ConnectorError> {
        let params = [
            ("jql", jql.to_string()),
            ("fields", fields_csv.to_string()),
            ("startAt", start_at.to_string()),
            ("maxResults", page_size.to_string()),
        ];
        let response = self.get_json_with_retry("/rest/api/2/search", &params).await?;
        let issues = response
            .get("issues")
            .and_then(|i| i.as_array())
            .cloned()
            .ok_or_else(|| ConnectorError::BadResponse("search response without issues".into()))?;
        debug!(start_at, got = issues.len(), "search page fetched");
        Ok(issues)
    }

    /// Fetch the full result set of a JQL query, keyed and deduplicated by
    /// issue key. The total probe and every page carry their own retry
    /// budget; any page that still fails aborts the whole fetch.
    pub async fn search_issues(
        &self,
        jql: &str,
        fields: &[String],
    ) -> Result<HashMap<String, Value>, ConnectorError> {
        let mut fields: Vec<String> = fields.to_vec();
        if !fields.iter().any(|f| f == "key") {
            fields.push("key".to_string());
        }
        let fields_csv = fields.join(",");

        let total = self.total_count(jql).await?;
        if total == 0 {
            debug!(jql, "empty search result");
            return Ok(HashMap::new());
        }

        let page_size = self.optimal_page_size(total);
        info!(jql, total, page_size, "fetching JIRA issues");

        let mut issues: HashMap<String, Value> = HashMap::new();
        let mut failed_offsets = Vec::new();
        let mut start_at = 0;
        while start_at < total {
            match self.fetch_page(jql, &fields_csv, start_at, page_size).await {
                Ok(page) => {
                    for issue in page {
                        if let Some(key) = issue.get("key").and_then(|k| k.as_str()) {
                            issues.insert(key.to_string(), issue);
                        }
                    }
                }
                Err(err) => {
                    warn!(start_at, error = %err, "page failed after retries");
                    failed_offsets.push(start_at);
                }
            }
            start_at += page_size;
        }

        if !failed_offsets.is_empty() || issues.len() > total {
            return Err(ConnectorError::DataIncomplete {
                expected: total,
                actual: issues.len(),
                failed_offsets,
            });
        }
        if issues.len() < total {
            // Pagination can hand back the same issue twice; dedup shrinks it.
            info!(expected = total, unique = issues.len(), "duplicate issues removed");
        }
        Ok(issues)
    }

    /// Fetch one issue, or `None` when JIRA does not know the key.
    pub async fn get_issue(
        &self,
        issue_key: &str,
        fields: &[String],
    ) -> Result<Option<Value>, ConnectorError> {
        let mut fields: Vec<String> = fields.to_vec();
        if !fields.iter().any(|f| f == "key") {
            fields.push("key".to_string());
        }
        let params = [("fields", fields.join(","))];
        match self
            .get_json(&format!("/rest/api/2/issue/{issue_key}"), &params)
            .await
        {
            Ok(issue) => Ok(Some(issue)),
            Err(ConnectorError::Status { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Probe a JQL string for syntactic validity.
    pub async fn validate_jql(&self, jql: &str) -> bool {
        let params = [
            ("jql", jql.to_string()),
            ("maxResults", "1".to_string()),
        ];
        self.get_json("/rest/api/2/search", &params).await.is_ok()
    }

    /// Server version probe.
    pub async fn server_info(&self) -> Result<Value, ConnectorError> {
        self.get_json("/rest/api/2/serverInfo", &[]).await
    }
}
