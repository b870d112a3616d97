//! Lark Base REST client: tenant auth, wiki-token resolution, record CRUD,
//! field listing and the user directory.
//!
//! Every response is a `{code, msg, data}` envelope; a non-zero code is a
//! failure regardless of HTTP status. The tenant token is cached and
//! refreshed 300 s before expiry, serialized behind a lock so concurrent
//! table workflows never race a refresh.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use larksync_schema::LarkBaseConfig;

use crate::error::ConnectorError;

const DEFAULT_BASE_URL: &str = "https://open.larksuite.com/open-apis";
/// Refresh the tenant token this long before the server-side expiry.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;
const RECORD_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// A resolved directory user.
#[derive(Debug, Clone)]
pub struct LarkUser {
    pub user_id: String,
    pub name: String,
    pub email: String,
}

/// Shared client for one `(app_id, app_secret)` pair.
pub struct LarkClient {
    http: reqwest::Client,
    /// Record pagination gets a longer timeout than everything else.
    paging_http: reqwest::Client,
    app_id: String,
    app_secret: String,
    base_url: String,
    token: Mutex<Option<CachedToken>>,
    obj_tokens: Mutex<HashMap<String, String>>,
}

impl LarkClient {
    pub fn new(config: &LarkBaseConfig) -> Result<Self, ConnectorError> {
        Self::with_base_url(config, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(
        config: &LarkBaseConfig,
        base_url: &str,
    ) -> Result<Self, ConnectorError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let paging_http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            paging_http,
            app_id: config.app_id.clone(),
            app_secret: config.app_secret.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: Mutex::new(None),
            obj_tokens: Mutex::new(HashMap::new()),
        })
    }

    async fn tenant_access_token(&self) -> Result<String, ConnectorError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Utc::now() < token.expires_at {
                return Ok(token.token.clone());
            }
        }

        let response = self
            .http
            .post(format!("{}/auth/v3/tenant_access_token/internal", self.base_url))
            .json(&json!({"app_id": self.app_id, "app_secret": self.app_secret}))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::AuthFailed(format!("HTTP {status}: {body}")));
        }
        let body: Value = response.json().await?;
        let code = body.get("code").and_then(|c| c.as_i64()).unwrap_or(-1);
        if code != 0 {
            let msg = body
                .get("msg")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown")
                .to_string();
            return Err(ConnectorError::AuthFailed(format!("code {code}: {msg}")));
        }
        let token = body
            .get("tenant_access_token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ConnectorError::AuthFailed("response without token".into()))?
            .to_string();
        let expire = body.get("expire").and_then(|e| e.as_i64()).unwrap_or(7200);

        debug!("tenant access token refreshed");
        *cached = Some(CachedToken {
            token: token.clone(),
            expires_at: Utc::now()
                + chrono::Duration::seconds((expire - TOKEN_REFRESH_MARGIN_SECS).max(60)),
        });
        Ok(token)
    }

    /// Unwrap the `{code, msg, data}` envelope; non-zero code is an error.
    async fn request(
        &self,
        method: reqwest::Method,
        url: String,
        body: Option<Value>,
        params: &[(&str, String)],
        paging: bool,
    ) -> Result<Value, ConnectorError> {
        let token = self.tenant_access_token().await?;
        let http = if paging { &self.paging_http } else { &self.http };
        let mut request = http.request(method, url).bearer_auth(token).query(params);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let envelope: Value = response.json().await?;
        let code = envelope.get("code").and_then(|c| c.as_i64()).unwrap_or(-1);
        if code != 0 {
            let msg = envelope
                .get("msg")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown")
                .to_string();
            return Err(ConnectorError::Api { code, msg });
        }
        Ok(envelope.get("data").cloned().unwrap_or(Value::Null))
    }

    /// Resolve a wiki token to the underlying bitable obj token, cached.
    pub async fn obj_token(&self, wiki_token: &str) -> Result<String, ConnectorError> {
        {
            let cache = self.obj_tokens.lock().await;
            if let Some(obj) = cache.get(wiki_token) {
                return Ok(obj.clone());
            }
        }
        let data = self
            .request(
                reqwest::Method::GET,
                format!("{}/wiki/v2/spaces/get_node", self.base_url),
                None,
                &[("token", wiki_token.to_string())],
                false,
            )
            .await?;
        let obj = data
            .pointer("/node/obj_token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ConnectorError::BadResponse("get_node without obj_token".into()))?
            .to_string();
        self.obj_tokens
            .lock()
            .await
            .insert(wiki_token.to_string(), obj.clone());
        Ok(obj)
    }

    fn table_url(&self, obj_token: &str, table_id: &str, suffix: &str) -> String {
        format!(
            "{}/bitable/v1/apps/{}/tables/{}{}",
            self.base_url, obj_token, table_id, suffix
        )
    }

    /// Full table scan via paged listing.
    pub async fn get_all_records(
        &self,
        wiki_token: &str,
        table_id: &str,
    ) -> Result<Vec<Value>, ConnectorError> {
        let obj = self.obj_token(wiki_token).await?;
        let url = self.table_url(&obj, table_id, "/records");

        let mut records = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![("page_size", RECORD_PAGE_SIZE.to_string())];
            if let Some(token) = &page_token {
                params.push(("page_token", token.clone()));
            }
            let data = self
                .request(reqwest::Method::GET, url.clone(), None, &params, true)
                .await?;
            if let Some(items) = data.get("items").and_then(|i| i.as_array()) {
                records.extend(items.iter().cloned());
            }
            let has_more = data.get("has_more").and_then(|h| h.as_bool()).unwrap_or(false);
            page_token = data
                .get("page_token")
                .and_then(|t| t.as_str())
                .map(String::from);
            if !has_more || page_token.is_none() {
                break;
            }
        }
        info!(table_id, records = records.len(), "full table scan done");
        Ok(records)
    }

    /// Field descriptors (`field_name`, `ui_type`, `is_primary`, …).
    pub async fn table_fields(
        &self,
        wiki_token: &str,
        table_id: &str,
    ) -> Result<Vec<Value>, ConnectorError> {
        let obj = self.obj_token(wiki_token).await?;
        let data = self
            .request(
                reqwest::Method::GET,
                self.table_url(&obj, table_id, "/fields"),
                None,
                &[],
                false,
            )
            .await?;
        Ok(data
            .get("items")
            .and_then(|i| i.as_array())
            .cloned()
            .unwrap_or_default())
    }

    pub async fn available_field_names(
        &self,
        wiki_token: &str,
        table_id: &str,
    ) -> Result<Vec<String>, ConnectorError> {
        let fields = self.table_fields(wiki_token, table_id).await?;
        Ok(fields
            .iter()
            .filter_map(|f| f.get("field_name").and_then(|n| n.as_str()))
            .map(String::from)
            .collect())
    }

    /// The `ui_type` of one field, if the field exists.
    pub async fn field_ui_type(
        &self,
        wiki_token: &str,
        table_id: &str,
        field_name: &str,
    ) -> Result<Option<String>, ConnectorError> {
        let fields = self.table_fields(wiki_token, table_id).await?;
        Ok(fields.iter().find_map(|f| {
            (f.get("field_name").and_then(|n| n.as_str()) == Some(field_name))
                .then(|| f.get("ui_type").and_then(|t| t.as_str()).map(String::from))
                .flatten()
        }))
    }

    /// Create one row; returns the new record id.
    pub async fn create_record(
        &self,
        wiki_token: &str,
        table_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<String, ConnectorError> {
        let obj = self.obj_token(wiki_token).await?;
        let data = self
            .request(
                reqwest::Method::POST,
                self.table_url(&obj, table_id, "/records"),
                Some(json!({"fields": fields})),
                &[],
                false,
            )
            .await?;
        data.pointer("/record/record_id")
            .and_then(|id| id.as_str())
            .map(String::from)
            .ok_or_else(|| ConnectorError::BadResponse("create response without record_id".into()))
    }

    pub async fn update_record(
        &self,
        wiki_token: &str,
        table_id: &str,
        record_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<(), ConnectorError> {
        let obj = self.obj_token(wiki_token).await?;
        self.request(
            reqwest::Method::PUT,
            self.table_url(&obj, table_id, &format!("/records/{record_id}")),
            Some(json!({"fields": fields})),
            &[],
            false,
        )
        .await?;
        Ok(())
    }

    /// Create many rows in one call; ids come back in input order.
    pub async fn batch_create_records(
        &self,
        wiki_token: &str,
        table_id: &str,
        rows: &[Map<String, Value>],
    ) -> Result<Vec<String>, ConnectorError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let obj = self.obj_token(wiki_token).await?;
        let records: Vec<Value> = rows.iter().map(|fields| json!({"fields": fields})).collect();
        let data = self
            .request(
                reqwest::Method::POST,
                self.table_url(&obj, table_id, "/records/batch_create"),
                Some(json!({"records": records})),
                &[],
                false,
            )
            .await?;
        let ids: Vec<String> = data
            .get("records")
            .and_then(|r| r.as_array())
            .map(|records| {
                records
                    .iter()
                    .filter_map(|r| r.get("record_id").and_then(|id| id.as_str()))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        Ok(ids)
    }

    pub async fn batch_update_records(
        &self,
        wiki_token: &str,
        table_id: &str,
        updates: &[(String, Map<String, Value>)],
    ) -> Result<(), ConnectorError> {
        if updates.is_empty() {
            return Ok(());
        }
        let obj = self.obj_token(wiki_token).await?;
        let records: Vec<Value> = updates
            .iter()
            .map(|(record_id, fields)| json!({"record_id": record_id, "fields": fields}))
            .collect();
        self.request(
            reqwest::Method::POST,
            self.table_url(&obj, table_id, "/records/batch_update"),
            Some(json!({"records": records})),
            &[],
            false,
        )
        .await?;
        Ok(())
    }

    pub async fn batch_delete_records(
        &self,
        wiki_token: &str,
        table_id: &str,
        record_ids: &[String],
    ) -> Result<(), ConnectorError> {
        if record_ids.is_empty() {
            return Ok(());
        }
        let obj = self.obj_token(wiki_token).await?;
        self.request(
            reqwest::Method::POST,
            self.table_url(&obj, table_id, "/records/batch_delete"),
            Some(json!({"records": record_ids})),
            &[],
            false,
        )
        .await?;
        Ok(())
    }

    pub async fn check_record_exists(
        &self,
        wiki_token: &str,
        table_id: &str,
        record_id: &str,
    ) -> Result<bool, ConnectorError> {
        let obj = self.obj_token(wiki_token).await?;
        let result = self
            .request(
                reqwest::Method::GET,
                self.table_url(&obj, table_id, &format!("/records/{record_id}")),
                None,
                &[],
                false,
            )
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(ConnectorError::Status { status: 404, .. }) | Err(ConnectorError::Api { .. }) => {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Directory lookup by email. `None` when the directory has no match.
    pub async fn get_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<LarkUser>, ConnectorError> {
        let data = self
            .request(
                reqwest::Method::POST,
                format!("{}/contact/v3/users/batch_get_id", self.base_url),
                Some(json!({"emails": [email]})),
                &[],
                false,
            )
            .await?;
        let Some(user) = data
            .get("user_list")
            .and_then(|l| l.as_array())
            .and_then(|l| l.first())
        else {
            return Ok(None);
        };
        let Some(user_id) = user.get("user_id").and_then(|id| id.as_str()) else {
            warn!(email, "directory row without user_id");
            return Ok(None);
        };
        let name = user
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or_else(|| email.split('@').next().unwrap_or(email));
        Ok(Some(LarkUser {
            user_id: user_id.to_string(),
            name: name.to_string(),
            email: email.to_string(),
        }))
    }
}
