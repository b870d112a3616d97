//! Sync operation and result types shared across the workspace.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::time::issue_updated_ms;

/// Whether an issue becomes a new target row or updates an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Create,
    Update,
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpType::Create => write!(f, "create"),
            OpType::Update => write!(f, "update"),
        }
    }
}

/// One classified unit of work for a single issue, alive for one workflow
/// invocation only.
#[derive(Debug, Clone)]
pub struct SyncOperation {
    pub issue_key: String,
    pub raw_issue: Value,
    pub op_type: OpType,
    pub lark_record_id: Option<String>,
    pub processed_fields: Option<serde_json::Map<String, Value>>,
    pub jira_updated_time: Option<i64>,
}

impl SyncOperation {
    pub fn create(issue_key: impl Into<String>, raw_issue: Value) -> Self {
        let jira_updated_time = issue_updated_ms(&raw_issue);
        Self {
            issue_key: issue_key.into(),
            raw_issue,
            op_type: OpType::Create,
            lark_record_id: None,
            processed_fields: None,
            jira_updated_time,
        }
    }

    pub fn update(
        issue_key: impl Into<String>,
        raw_issue: Value,
        lark_record_id: impl Into<String>,
    ) -> Self {
        let jira_updated_time = issue_updated_ms(&raw_issue);
        Self {
            issue_key: issue_key.into(),
            raw_issue,
            op_type: OpType::Update,
            lark_record_id: Some(lark_record_id.into()),
            processed_fields: None,
            jira_updated_time,
        }
    }
}

/// Outcome of executing one [`SyncOperation`] against the target table.
#[derive(Debug, Clone)]
pub struct SyncResult {
    pub issue_key: String,
    pub op_type: OpType,
    pub success: bool,
    pub lark_record_id: Option<String>,
    pub error: Option<String>,
    pub jira_updated_time: Option<i64>,
}

impl SyncResult {
    pub fn ok(op: &SyncOperation, lark_record_id: Option<String>) -> Self {
        Self {
            issue_key: op.issue_key.clone(),
            op_type: op.op_type,
            success: true,
            lark_record_id: lark_record_id.or_else(|| op.lark_record_id.clone()),
            error: None,
            jira_updated_time: op.jira_updated_time,
        }
    }

    pub fn failed(op: &SyncOperation, error: impl Into<String>) -> Self {
        Self {
            issue_key: op.issue_key.clone(),
            op_type: op.op_type,
            success: false,
            lark_record_id: op.lark_record_id.clone(),
            error: Some(error.into()),
            jira_updated_time: op.jira_updated_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn issue(key: &str, updated: &str) -> Value {
        json!({"key": key, "fields": {"updated": updated}})
    }

    #[test]
    fn test_create_op_extracts_updated_time() {
        let op = SyncOperation::create("TP-1", issue("TP-1", "2023-01-01T00:00:00.000+0000"));
        assert_eq!(op.op_type, OpType::Create);
        assert_eq!(op.jira_updated_time, Some(1672531200000));
        assert!(op.lark_record_id.is_none());
    }

    #[test]
    fn test_update_op_carries_record_id() {
        let op = SyncOperation::update("TP-1", issue("TP-1", "bogus"), "rec_A");
        assert_eq!(op.op_type, OpType::Update);
        assert_eq!(op.lark_record_id.as_deref(), Some("rec_A"));
        assert_eq!(op.jira_updated_time, None);
    }

    #[test]
    fn test_result_ok_prefers_new_record_id() {
        let op = SyncOperation::create("TP-1", issue("TP-1", "2023-01-01T00:00:00.000+0000"));
        let res = SyncResult::ok(&op, Some("rec_new".into()));
        assert!(res.success);
        assert_eq!(res.lark_record_id.as_deref(), Some("rec_new"));
    }

    #[test]
    fn test_result_ok_falls_back_to_op_record_id() {
        let op = SyncOperation::update("TP-1", issue("TP-1", "x"), "rec_A");
        let res = SyncResult::ok(&op, None);
        assert_eq!(res.lark_record_id.as_deref(), Some("rec_A"));
    }

    #[test]
    fn test_result_failed() {
        let op = SyncOperation::create("TP-1", issue("TP-1", "x"));
        let res = SyncResult::failed(&op, "boom");
        assert!(!res.success);
        assert_eq!(res.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_op_type_display() {
        assert_eq!(OpType::Create.to_string(), "create");
        assert_eq!(OpType::Update.to_string(), "update");
    }
}
