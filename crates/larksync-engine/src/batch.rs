//! Batched execution of classified sync operations against the target table.
//!
//! Creates go through `batch_create` with a one-by-one fallback that isolates
//! poison rows; updates are chunked by row complexity and processed
//! sequentially. The Sprint columns are a legacy quirk: a target table may
//! model them as Number or SingleSelect, so a rejected write is retried once
//! with the alternate form.

use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use larksync_connectors::LarkClient;
use larksync_core::{OpType, SyncOperation, SyncResult};
use larksync_schema::FieldMapping;

use crate::fields::FieldProcessor;
use crate::users::UserMapper;

const MAX_BATCH_SIZE: usize = 500;
const CHUNK_SAMPLE_SIZE: usize = 10;
const SPRINT_FIELD_NAMES: [&str; 4] = ["Sprints", "Sprint", "sprints", "sprint"];

/// Counters for one batch invocation.
#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    pub total_processed: usize,
    pub successful_creates: usize,
    pub successful_updates: usize,
    pub failed_operations: usize,
    pub field_processing_ms: u128,
    pub lark_api_ms: u128,
    pub total_ms: u128,
    pub pending_users: usize,
}

/// Per-operation results plus the counters.
#[derive(Debug)]
pub struct BatchOutcome {
    pub results: Vec<SyncResult>,
    pub stats: BatchStats,
}

pub struct BatchProcessor {
    lark: Arc<LarkClient>,
    fields: Arc<FieldProcessor>,
    user_mapper: Option<Arc<UserMapper>>,
}

impl BatchProcessor {
    pub fn new(
        lark: Arc<LarkClient>,
        fields: Arc<FieldProcessor>,
        user_mapper: Option<Arc<UserMapper>>,
    ) -> Self {
        Self {
            lark,
            fields,
            user_mapper,
        }
    }

    pub async fn process(
        &self,
        wiki_token: &str,
        table_id: &str,
        mut operations: Vec<SyncOperation>,
        mappings: &IndexMap<String, FieldMapping>,
        available_fields: Option<&[String]>,
        excluded_fields: &[String],
    ) -> BatchOutcome {
        let started = Instant::now();
        let mut stats = BatchStats::default();
        if operations.is_empty() {
            return BatchOutcome {
                results: Vec::new(),
                stats,
            };
        }

        // Phase 1: one field-processing pass over the whole batch.
        let field_start = Instant::now();
        let issues: std::collections::HashMap<String, Value> = operations
            .iter()
            .map(|op| (op.issue_key.clone(), op.raw_issue.clone()))
            .collect();
        let mut processed =
            self.fields
                .process_issues_with_mappings(&issues, mappings, available_fields, excluded_fields);
        for op in &mut operations {
            op.processed_fields = processed.remove(&op.issue_key);
        }
        stats.field_processing_ms = field_start.elapsed().as_millis();
        if let Some(mapper) = &self.user_mapper {
            stats.pending_users = mapper.report_pending().found;
        }

        // Sprint columns may be typed either way; ask the table once.
        let sprint_ui_type = self.sprint_ui_type(wiki_token, table_id, &operations).await;

        // Phase 2: split by operation type and execute.
        let (creates, updates): (Vec<SyncOperation>, Vec<SyncOperation>) = operations
            .into_iter()
            .partition(|op| op.op_type == OpType::Create);

        let api_start = Instant::now();
        let mut results = self
            .execute_creates(wiki_token, table_id, creates, sprint_ui_type.as_deref())
            .await;
        results.extend(
            self.execute_updates(wiki_token, table_id, updates, sprint_ui_type.as_deref())
                .await,
        );
        stats.lark_api_ms = api_start.elapsed().as_millis();

        for result in &results {
            if result.success {
                match result.op_type {
                    OpType::Create => stats.successful_creates += 1,
                    OpType::Update => stats.successful_updates += 1,
                }
            } else {
                stats.failed_operations += 1;
            }
        }
        stats.total_processed = results.len();
        stats.total_ms = started.elapsed().as_millis();

        info!(
            table_id,
            created = stats.successful_creates,
            updated = stats.successful_updates,
            failed = stats.failed_operations,
            elapsed_ms = stats.total_ms,
            "batch done"
        );
        BatchOutcome { results, stats }
    }

    async fn sprint_ui_type(
        &self,
        wiki_token: &str,
        table_id: &str,
        operations: &[SyncOperation],
    ) -> Option<String> {
        let field_name = operations
            .iter()
            .filter_map(|op| op.processed_fields.as_ref())
            .find_map(sprint_field_name)?;
        match self.lark.field_ui_type(wiki_token, table_id, &field_name).await {
            Ok(ui_type) => ui_type,
            Err(err) => {
                debug!(field_name, error = %err, "could not query sprint field type");
                None
            }
        }
    }

    async fn execute_creates(
        &self,
        wiki_token: &str,
        table_id: &str,
        operations: Vec<SyncOperation>,
        sprint_ui_type: Option<&str>,
    ) -> Vec<SyncResult> {
        if operations.is_empty() {
            return Vec::new();
        }

        let mut results = Vec::with_capacity(operations.len());
        let mut valid = Vec::new();
        for op in operations {
            if op.processed_fields.is_some() {
                valid.push(op);
            } else {
                results.push(SyncResult::failed(&op, "no processed fields"));
            }
        }
        if valid.is_empty() {
            return results;
        }

        let rows: Vec<Map<String, Value>> = valid
            .iter()
            .map(|op| with_preferred_sprint(op.processed_fields.as_ref().unwrap_or(&Map::new()), sprint_ui_type))
            .collect();

        match self.lark.batch_create_records(wiki_token, table_id, &rows).await {
            Ok(ids) if ids.len() == valid.len() => {
                for (op, id) in valid.iter().zip(ids) {
                    results.push(SyncResult::ok(op, Some(id)));
                }
                info!(table_id, count = valid.len(), "batch create ok");
                results
            }
            Ok(ids) => {
                // Ids did not come back one per row; attribution is unsafe.
                warn!(
                    table_id,
                    expected = valid.len(),
                    got = ids.len(),
                    "batch create id count mismatch, retrying individually"
                );
                self.fallback_individual_creates(wiki_token, table_id, valid, sprint_ui_type, results)
                    .await
            }
            Err(err) => {
                warn!(table_id, error = %err, "batch create failed");
                // The whole batch may have been rejected over the Sprint
                // format alone; flip once before isolating rows.
                if let Some(flipped) = flip_all_sprints(&rows) {
                    if let Ok(ids) = self
                        .lark
                        .batch_create_records(wiki_token, table_id, &flipped)
                        .await
                    {
                        if ids.len() == valid.len() {
                            info!(table_id, "batch create ok after sprint fallback");
                            for (op, id) in valid.iter().zip(ids) {
                                results.push(SyncResult::ok(op, Some(id)));
                            }
                            return results;
                        }
                    }
                }
                self.fallback_individual_creates(wiki_token, table_id, valid, sprint_ui_type, results)
                    .await
            }
        }
    }

    /// Row-at-a-time creates; one poison row no longer sinks its neighbours.
    async fn fallback_individual_creates(
        &self,
        wiki_token: &str,
        table_id: &str,
        operations: Vec<SyncOperation>,
        sprint_ui_type: Option<&str>,
        mut results: Vec<SyncResult>,
    ) -> Vec<SyncResult> {
        for op in operations {
            let fields = op.processed_fields.clone().unwrap_or_default();
            let row = with_preferred_sprint(&fields, sprint_ui_type);
            let outcome = match self.lark.create_record(wiki_token, table_id, &row).await {
                Ok(id) => SyncResult::ok(&op, Some(id)),
                Err(first_err) => match flip_sprints(&row) {
                    Some(flipped) => {
                        match self.lark.create_record(wiki_token, table_id, &flipped).await {
                            Ok(id) => SyncResult::ok(&op, Some(id)),
                            Err(err) => SyncResult::failed(&op, err.to_string()),
                        }
                    }
                    None => SyncResult::failed(&op, first_err.to_string()),
                },
            };
            if !outcome.success {
                warn!(issue_key = %op.issue_key, "create failed");
            }
            results.push(outcome);
        }
        results
    }

    async fn execute_updates(
        &self,
        wiki_token: &str,
        table_id: &str,
        operations: Vec<SyncOperation>,
        sprint_ui_type: Option<&str>,
    ) -> Vec<SyncResult> {
        if operations.is_empty() {
            return Vec::new();
        }

        let mut results = Vec::with_capacity(operations.len());
        let mut valid = Vec::new();
        for op in operations {
            if op.processed_fields.is_some() && op.lark_record_id.is_some() {
                valid.push(op);
            } else {
                results.push(SyncResult::failed(&op, "missing record id or fields"));
            }
        }
        if valid.is_empty() {
            return results;
        }

        let prepared: Vec<(String, Map<String, Value>)> = valid
            .iter()
            .map(|op| {
                (
                    op.lark_record_id.clone().unwrap_or_default(),
                    with_preferred_sprint(op.processed_fields.as_ref().unwrap_or(&Map::new()), sprint_ui_type),
                )
            })
            .collect();

        let row_refs: Vec<&Map<String, Value>> = prepared.iter().map(|(_, f)| f).collect();
        let chunk_size = dynamic_chunk_size(&row_refs);
        info!(
            table_id,
            updates = prepared.len(),
            chunk_size,
            "batch update starting"
        );

        for (chunk, ops) in prepared.chunks(chunk_size).zip(valid.chunks(chunk_size)) {
            let chunk_ok = match self
                .lark
                .batch_update_records(wiki_token, table_id, chunk)
                .await
            {
                Ok(()) => true,
                Err(err) => {
                    warn!(table_id, error = %err, "batch update chunk failed");
                    match flip_all_sprint_updates(chunk) {
                        Some(flipped) => self
                            .lark
                            .batch_update_records(wiki_token, table_id, &flipped)
                            .await
                            .is_ok(),
                        None => false,
                    }
                }
            };

            if chunk_ok {
                for op in ops {
                    results.push(SyncResult::ok(op, None));
                }
                continue;
            }

            // Chunk still rejected: isolate rows individually.
            for (op, (record_id, fields)) in ops.iter().zip(chunk) {
                let outcome = match self
                    .lark
                    .update_record(wiki_token, table_id, record_id, fields)
                    .await
                {
                    Ok(()) => SyncResult::ok(op, None),
                    Err(first_err) => match flip_sprints(fields) {
                        Some(flipped) => match self
                            .lark
                            .update_record(wiki_token, table_id, record_id, &flipped)
                            .await
                        {
                            Ok(()) => SyncResult::ok(op, None),
                            Err(err) => SyncResult::failed(op, err.to_string()),
                        },
                        None => SyncResult::failed(op, first_err.to_string()),
                    },
                };
                if !outcome.success {
                    warn!(issue_key = %op.issue_key, "update failed");
                }
                results.push(outcome);
            }
        }
        results
    }
}

/// Chunk bound from sampled row complexity: heavy rows shrink the chunk so a
/// single request stays well inside the API's payload tolerance.
fn dynamic_chunk_size(rows: &[&Map<String, Value>]) -> usize {
    if rows.is_empty() {
        return MAX_BATCH_SIZE;
    }
    let sample = &rows[..rows.len().min(CHUNK_SAMPLE_SIZE)];
    let total_fields: usize = sample.iter().map(|r| r.len()).sum();
    let total_len: usize = sample
        .iter()
        .map(|r| serde_json::to_string(r).map(|s| s.len()).unwrap_or(0))
        .sum();
    let avg_fields = total_fields as f64 / sample.len() as f64;
    let avg_len = total_len as f64 / sample.len() as f64;

    if avg_fields > 20.0 || avg_len > 2000.0 {
        200
    } else if avg_fields > 10.0 || avg_len > 1000.0 {
        350
    } else {
        MAX_BATCH_SIZE
    }
}

fn sprint_field_name(fields: &Map<String, Value>) -> Option<String> {
    SPRINT_FIELD_NAMES
        .iter()
        .find(|name| fields.contains_key(**name))
        .map(|name| name.to_string())
}

/// Numeric form of a sprint value: `"42"` → `42`, numbers pass through.
fn sprint_number_form(value: &Value) -> Option<Value> {
    match value {
        Value::Number(_) => Some(value.clone()),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            s.parse::<f64>().ok().map(|f| Value::from(f as i64))
        }
        _ => None,
    }
}

/// Select form of a sprint value: `42` → `"42"`, strings pass through.
fn sprint_select_form(value: &Value) -> Option<Value> {
    match value {
        Value::Number(n) => Some(Value::String(n.to_string())),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                None
            } else {
                Some(Value::String(s.to_string()))
            }
        }
        _ => None,
    }
}

/// Rewrite the sprint field into the form the table's declared type prefers;
/// without a declared type the numeric form is tried first.
fn with_preferred_sprint(fields: &Map<String, Value>, ui_type: Option<&str>) -> Map<String, Value> {
    let mut out = fields.clone();
    let Some(name) = sprint_field_name(fields) else {
        return out;
    };
    let Some(value) = fields.get(&name) else {
        return out;
    };
    if value.is_null() {
        return out;
    }

    let preferred = match ui_type {
        Some("Number") => sprint_number_form(value),
        Some("SingleSelect") => sprint_select_form(value),
        _ => sprint_number_form(value).or_else(|| sprint_select_form(value)),
    };
    if let Some(preferred) = preferred {
        out.insert(name, preferred);
    }
    out
}

/// The alternate sprint form (numeric string ↔ integer), or `None` when the
/// row has no convertible sprint value.
fn flip_sprints(fields: &Map<String, Value>) -> Option<Map<String, Value>> {
    let name = sprint_field_name(fields)?;
    let value = fields.get(&name)?;
    let flipped = match value {
        Value::Number(_) => sprint_select_form(value)?,
        Value::String(_) => sprint_number_form(value)?,
        _ => return None,
    };
    let mut out = fields.clone();
    out.insert(name, flipped);
    Some(out)
}

fn flip_all_sprints(rows: &[Map<String, Value>]) -> Option<Vec<Map<String, Value>>> {
    if !rows.iter().any(|row| sprint_field_name(row).is_some()) {
        return None;
    }
    Some(
        rows.iter()
            .map(|row| flip_sprints(row).unwrap_or_else(|| row.clone()))
            .collect(),
    )
}

fn flip_all_sprint_updates(
    updates: &[(String, Map<String, Value>)],
) -> Option<Vec<(String, Map<String, Value>)>> {
    if !updates.iter().any(|(_, row)| sprint_field_name(row).is_some()) {
        return None;
    }
    Some(
        updates
            .iter()
            .map(|(id, row)| (id.clone(), flip_sprints(row).unwrap_or_else(|| row.clone())))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_dynamic_chunk_size_simple_rows() {
        let row = fields(&[("Title", json!("short"))]);
        let rows: Vec<&Map<String, Value>> = vec![&row; 20];
        assert_eq!(dynamic_chunk_size(&rows), 500);
    }

    #[test]
    fn test_dynamic_chunk_size_medium_rows() {
        let row: Map<String, Value> = (0..12)
            .map(|i| (format!("field_{i}"), json!("value")))
            .collect();
        let rows: Vec<&Map<String, Value>> = vec![&row; 5];
        assert_eq!(dynamic_chunk_size(&rows), 350);
    }

    #[test]
    fn test_dynamic_chunk_size_heavy_rows() {
        let row: Map<String, Value> = (0..25)
            .map(|i| (format!("field_{i}"), json!("value")))
            .collect();
        let rows: Vec<&Map<String, Value>> = vec![&row; 5];
        assert_eq!(dynamic_chunk_size(&rows), 200);
    }

    #[test]
    fn test_dynamic_chunk_size_long_content() {
        let row = fields(&[("Description", json!("x".repeat(3000)))]);
        let rows: Vec<&Map<String, Value>> = vec![&row];
        assert_eq!(dynamic_chunk_size(&rows), 200);
    }

    #[test]
    fn test_sprint_field_detection_is_case_sensitive_list() {
        assert_eq!(
            sprint_field_name(&fields(&[("Sprints", json!(5))])),
            Some("Sprints".to_string())
        );
        assert_eq!(
            sprint_field_name(&fields(&[("sprint", json!(5))])),
            Some("sprint".to_string())
        );
        assert_eq!(sprint_field_name(&fields(&[("SPRINT", json!(5))])), None);
    }

    #[test]
    fn test_preferred_sprint_number_type() {
        let row = fields(&[("Sprints", json!("42"))]);
        let prepared = with_preferred_sprint(&row, Some("Number"));
        assert_eq!(prepared["Sprints"], json!(42));
    }

    #[test]
    fn test_preferred_sprint_select_type() {
        let row = fields(&[("Sprints", json!(42))]);
        let prepared = with_preferred_sprint(&row, Some("SingleSelect"));
        assert_eq!(prepared["Sprints"], json!("42"));
    }

    #[test]
    fn test_preferred_sprint_untyped_defaults_to_number() {
        let row = fields(&[("Sprint", json!("7"))]);
        let prepared = with_preferred_sprint(&row, None);
        assert_eq!(prepared["Sprint"], json!(7));
    }

    #[test]
    fn test_preferred_sprint_non_numeric_string_stays_string() {
        let row = fields(&[("Sprint", json!("Sprint 12"))]);
        let prepared = with_preferred_sprint(&row, None);
        assert_eq!(prepared["Sprint"], json!("Sprint 12"));
    }

    #[test]
    fn test_flip_sprints_both_directions() {
        let numeric = fields(&[("Sprints", json!(42)), ("Title", json!("t"))]);
        let flipped = flip_sprints(&numeric).unwrap();
        assert_eq!(flipped["Sprints"], json!("42"));
        assert_eq!(flipped["Title"], json!("t"));

        let stringy = fields(&[("Sprints", json!("42"))]);
        let flipped = flip_sprints(&stringy).unwrap();
        assert_eq!(flipped["Sprints"], json!(42));
    }

    #[test]
    fn test_flip_sprints_without_sprint_field() {
        assert!(flip_sprints(&fields(&[("Title", json!("t"))])).is_none());
    }

    #[test]
    fn test_flip_sprints_non_numeric_string() {
        // "Sprint 12" cannot become a number; nothing to retry with.
        assert!(flip_sprints(&fields(&[("Sprints", json!("Sprint 12"))])).is_none());
    }

    #[test]
    fn test_flip_all_sprints_skips_sprint_free_batches() {
        let rows = vec![fields(&[("Title", json!("a"))])];
        assert!(flip_all_sprints(&rows).is_none());

        let rows = vec![
            fields(&[("Sprints", json!(1))]),
            fields(&[("Title", json!("b"))]),
        ];
        let flipped = flip_all_sprints(&rows).unwrap();
        assert_eq!(flipped[0]["Sprints"], json!("1"));
        assert_eq!(flipped[1]["Title"], json!("b"));
    }
}
