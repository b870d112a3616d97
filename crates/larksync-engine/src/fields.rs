//! Schema-driven transformation of raw JIRA issue JSON into target row maps.
//!
//! Pure over its inputs: no network, no target writes. The only local state
//! touched is the user cache, through [`UserMapper`], and that path never
//! blocks on a directory lookup.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use larksync_schema::{FieldMapping, FieldSchema, IssueLinkRule, ProcessorKind};

use crate::users::UserMapper;

/// Transforms issues according to the `field_mappings` schema.
pub struct FieldProcessor {
    mappings: IndexMap<String, FieldMapping>,
    jira_base_url: String,
    link_rules: IndexMap<String, IssueLinkRule>,
    user_mapper: Option<Arc<UserMapper>>,
}

impl FieldProcessor {
    pub fn new(
        schema: FieldSchema,
        jira_base_url: impl Into<String>,
        link_rules: IndexMap<String, IssueLinkRule>,
        user_mapper: Option<Arc<UserMapper>>,
    ) -> Self {
        let jira_base_url = jira_base_url.into().trim_end_matches('/').to_string();
        Self {
            mappings: schema.field_mappings,
            jira_base_url,
            link_rules,
            user_mapper,
        }
    }

    pub fn mappings(&self) -> &IndexMap<String, FieldMapping> {
        &self.mappings
    }

    /// JIRA fields a search must request for this schema.
    pub fn required_jira_fields(&self) -> Vec<String> {
        let schema = FieldSchema {
            field_mappings: self.mappings.clone(),
        };
        schema.required_jira_fields()
    }

    /// Ticket-column candidates declared for the `key` mapping.
    pub fn ticket_field_candidates(&self) -> Vec<String> {
        self.mappings
            .get("key")
            .map(|m| m.lark_field.candidates())
            .unwrap_or_default()
    }

    /// Transform a batch of issues with this processor's own schema and no
    /// field pruning.
    pub fn process_issues(
        &self,
        issues: &HashMap<String, Value>,
    ) -> HashMap<String, Map<String, Value>> {
        self.process_issues_with_mappings(issues, &self.mappings, None, &[])
    }

    /// Transform a batch of issues. Each mapping entry is resolved to exactly
    /// one target field against `available_fields` (entries that resolve to
    /// nothing are dropped), `excluded_fields` are removed up front, and any
    /// per-field trouble yields null for that field rather than failing the
    /// row.
    pub fn process_issues_with_mappings(
        &self,
        issues: &HashMap<String, Value>,
        mappings: &IndexMap<String, FieldMapping>,
        available_fields: Option<&[String]>,
        excluded_fields: &[String],
    ) -> HashMap<String, Map<String, Value>> {
        let effective = Self::resolve_mappings(mappings, available_fields, excluded_fields);

        let mut out = HashMap::with_capacity(issues.len());
        for (issue_key, issue) in issues {
            out.insert(issue_key.clone(), self.process_issue(issue_key, issue, &effective));
        }
        out
    }

    /// Resolve each mapping entry to `(jira_field, target_field, mapping)`.
    fn resolve_mappings<'a>(
        mappings: &'a IndexMap<String, FieldMapping>,
        available_fields: Option<&[String]>,
        excluded_fields: &[String],
    ) -> Vec<(&'a str, String, &'a FieldMapping)> {
        let mut effective = Vec::new();
        for (jira_field, mapping) in mappings {
            if excluded_fields.iter().any(|e| e == jira_field) {
                debug!(jira_field, "excluded from sync");
                continue;
            }
            match mapping.lark_field.resolve(available_fields) {
                Some(target) => effective.push((jira_field.as_str(), target.to_string(), mapping)),
                None => debug!(jira_field, "no matching target field, dropped"),
            }
        }
        effective
    }

    fn process_issue(
        &self,
        issue_key: &str,
        issue: &Value,
        effective: &[(&str, String, &FieldMapping)],
    ) -> Map<String, Value> {
        let empty = Value::Object(Map::new());
        let issue_fields = issue.get("fields").unwrap_or(&empty);

        let mut row = Map::new();
        for (jira_field, target, mapping) in effective {
            // `key` lives on the issue envelope, not inside fields.
            let raw = if *jira_field == "key" {
                issue.get("key").cloned().unwrap_or(Value::Null)
            } else {
                Self::extract_raw(issue_fields, jira_field)
            };
            let value = self.apply(mapping, raw, issue_key, jira_field);
            row.insert(target.clone(), value);
        }
        row
    }

    /// Dereference a dotted path over JSON objects; null on any missing link.
    fn extract_raw(fields: &Value, path: &str) -> Value {
        let mut current = fields;
        for part in path.split('.') {
            match current.get(part) {
                Some(next) => current = next,
                None => return Value::Null,
            }
        }
        current.clone()
    }

    fn apply(&self, mapping: &FieldMapping, raw: Value, issue_key: &str, jira_field: &str) -> Value {
        if raw.is_null() {
            return Value::Null;
        }
        match mapping.processor {
            ProcessorKind::ExtractSimple => Self::extract_simple(raw),
            ProcessorKind::ExtractNested => Self::extract_nested(raw, mapping),
            ProcessorKind::ExtractUser => self.extract_user(raw, issue_key),
            ProcessorKind::ConvertDatetime => Self::convert_datetime(&raw),
            ProcessorKind::ExtractComponents | ProcessorKind::ExtractVersions => {
                Self::extract_names(raw, mapping.is_multiselect())
            }
            ProcessorKind::ExtractLinks => self.extract_links(&raw, mapping.is_multiselect()),
            ProcessorKind::ExtractLinksFiltered => {
                self.extract_links_filtered(&raw, issue_key, mapping.is_multiselect())
            }
            ProcessorKind::ExtractTicketLink => self.extract_ticket_link(&raw),
            ProcessorKind::Unknown => {
                warn!(jira_field, issue_key, "unknown processor, using extract_simple");
                Self::extract_simple(raw)
            }
        }
    }

    fn extract_simple(value: Value) -> Value {
        match value {
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => value,
            other => match serde_json::to_string(&other) {
                Ok(encoded) => Value::String(encoded),
                Err(_) => Value::Null,
            },
        }
    }

    /// Sub-key of a nested object; null and non-objects become empty strings
    /// so the target column is cleared rather than left stale.
    fn extract_nested(value: Value, mapping: &FieldMapping) -> Value {
        let Some(nested_path) = mapping.nested_path.as_deref() else {
            return Self::extract_simple(value);
        };
        match value {
            Value::Object(obj) => match obj.get(nested_path) {
                Some(Value::Null) | None => Value::String(String::new()),
                Some(inner) => inner.clone(),
            },
            _ => Value::String(String::new()),
        }
    }

    fn extract_user(&self, value: Value, issue_key: &str) -> Value {
        let Some(mapper) = &self.user_mapper else {
            return json!([]);
        };
        let members = mapper.map_user(&value);
        debug!(issue_key, mapped = !members.is_empty(), "user field mapped");
        Value::Array(members)
    }

    fn convert_datetime(value: &Value) -> Value {
        value
            .as_str()
            .and_then(larksync_core::time::parse_jira_timestamp)
            .map(|ms| json!(ms))
            .unwrap_or(Value::Null)
    }

    /// Shared by `extract_components` and `extract_versions`: both read
    /// arrays of `{name, …}` objects.
    fn extract_names(value: Value, multiselect: bool) -> Value {
        let names: Vec<String> = match &value {
            Value::Array(items) => items
                .iter()
                .filter_map(|item| match item {
                    Value::Object(obj) => obj.get("name").and_then(|n| n.as_str()).map(String::from),
                    Value::String(s) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
            Value::String(s) => vec![s.clone()],
            other => vec![other.to_string()],
        };

        if multiselect {
            json!(names)
        } else if names.is_empty() {
            Value::Null
        } else {
            Value::String(names.join(", "))
        }
    }

    fn link_keys(links: &Value) -> Vec<String> {
        let mut keys = Vec::new();
        if let Value::Array(items) = links {
            for link in items {
                for side in ["outwardIssue", "inwardIssue"] {
                    if let Some(key) = link.pointer(&format!("/{side}/key")).and_then(|k| k.as_str())
                    {
                        keys.push(key.to_string());
                    }
                }
            }
        }
        keys
    }

    /// `(relation, linked key)` pairs with the relation description taken
    /// from the matching direction of the link type.
    fn link_relations(links: &Value) -> Vec<(String, String)> {
        let mut relations = Vec::new();
        if let Value::Array(items) = links {
            for link in items {
                for (side, direction) in [("outwardIssue", "outward"), ("inwardIssue", "inward")] {
                    let key = link.pointer(&format!("/{side}/key")).and_then(|k| k.as_str());
                    let relation = link
                        .pointer(&format!("/type/{direction}"))
                        .and_then(|r| r.as_str());
                    if let (Some(key), Some(relation)) = (key, relation) {
                        relations.push((relation.to_string(), key.to_string()));
                    }
                }
            }
        }
        relations
    }

    fn extract_links(&self, links: &Value, multiselect: bool) -> Value {
        if self.jira_base_url.is_empty() {
            return if multiselect { json!([]) } else { Value::Null };
        }
        if multiselect {
            return json!(Self::link_keys(links));
        }
        let formatted: Vec<String> = Self::link_relations(links)
            .into_iter()
            .map(|(relation, key)| {
                format!("{relation}: {}/browse/{key}", self.jira_base_url)
            })
            .collect();
        if formatted.is_empty() {
            Value::Null
        } else {
            Value::String(formatted.join("\n"))
        }
    }

    fn extract_links_filtered(&self, links: &Value, issue_key: &str, multiselect: bool) -> Value {
        let prefix = Self::issue_key_prefix(issue_key);
        let rule = self
            .link_rules
            .get(&prefix)
            .or_else(|| self.link_rules.get("default"));

        let allowed = match rule {
            // Disabled rule or no prefix list: show everything.
            Some(rule) if rule.enabled && !rule.display_link_prefixes.is_empty() => {
                &rule.display_link_prefixes
            }
            _ => return self.extract_links(links, multiselect),
        };

        if multiselect {
            let keys: Vec<String> = Self::link_keys(links)
                .into_iter()
                .filter(|key| allowed.contains(&Self::issue_key_prefix(key)))
                .collect();
            return json!(keys);
        }

        let formatted: Vec<String> = Self::link_relations(links)
            .into_iter()
            .filter(|(_, key)| allowed.contains(&Self::issue_key_prefix(key)))
            .map(|(relation, key)| format!("{relation}: {}/browse/{key}", self.jira_base_url))
            .collect();
        if formatted.is_empty() {
            Value::Null
        } else {
            Value::String(formatted.join("\n"))
        }
    }

    /// `TCG-108387` → `TCG`; empty when the key has no uppercase prefix.
    fn issue_key_prefix(issue_key: &str) -> String {
        let upper = issue_key.trim().to_uppercase();
        let prefix: String = upper.chars().take_while(|c| c.is_ascii_uppercase()).collect();
        match upper.chars().nth(prefix.len()) {
            Some('-') if !prefix.is_empty() => prefix,
            _ => String::new(),
        }
    }

    /// The engine's hyperlink contract: `{text: key, link: <base>/browse/<key>}`.
    fn extract_ticket_link(&self, value: &Value) -> Value {
        let issue_key = match value {
            Value::String(s) => s.trim().to_string(),
            Value::Object(obj) => obj
                .get("key")
                .or_else(|| obj.get("id"))
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(|| value.to_string()),
            Value::Array(items) => match items.first() {
                Some(Value::Object(obj)) => obj
                    .get("key")
                    .or_else(|| obj.get("id"))
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .unwrap_or_else(|| items[0].to_string()),
                Some(Value::String(s)) => s.trim().to_string(),
                Some(other) => other.to_string(),
                None => return Value::Null,
            },
            Value::Number(n) => n.to_string(),
            _ => return Value::Null,
        };
        if issue_key.is_empty() {
            return Value::Null;
        }
        json!({
            "text": issue_key,
            "link": format!("{}/browse/{}", self.jira_base_url, issue_key),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larksync_schema::FieldSchema;

    const SCHEMA: &str = r#"
field_mappings:
  key:
    lark_field: ["Issue Key", "TCG Tickets", "Ticket"]
    processor: extract_ticket_link
  summary:
    lark_field: Title
    processor: extract_simple
  status:
    lark_field: Status
    processor: extract_nested
    nested_path: name
  assignee:
    lark_field: Assignee
    processor: extract_user
  created:
    lark_field: Created
    processor: convert_datetime
  components:
    lark_field: Components
    processor: extract_components
    field_type: multiselect
  fixVersions:
    lark_field: Fix Versions
    processor: extract_versions
  issuelinks:
    lark_field: Links
    processor: extract_links_filtered
    field_type: multiselect
"#;

    fn processor() -> FieldProcessor {
        let schema: FieldSchema = serde_yaml::from_str(SCHEMA).unwrap();
        let rules: IndexMap<String, IssueLinkRule> = serde_yaml::from_str(
            r#"
TP:
  enabled: true
  display_link_prefixes: [TP]
default:
  enabled: true
  display_link_prefixes: []
"#,
        )
        .unwrap();
        FieldProcessor::new(schema, "https://jira.example.com/", rules, None)
    }

    fn sample_issue() -> Value {
        json!({
            "key": "TP-1",
            "fields": {
                "summary": "Fix the flaky login",
                "status": {"name": "In Progress"},
                "assignee": {"name": "alice", "displayName": "Alice"},
                "created": "2023-01-01T00:00:00.000+0000",
                "components": [{"name": "Backend"}, {"name": "API"}],
                "fixVersions": [{"name": "1.2"}, {"name": "1.3"}],
                "issuelinks": [
                    {"type": {"outward": "blocks"}, "outwardIssue": {"key": "TP-2"}},
                    {"type": {"inward": "is blocked by"}, "inwardIssue": {"key": "ICR-9"}}
                ]
            }
        })
    }

    fn process_one(p: &FieldProcessor, issue: Value, available: Option<&[String]>) -> Map<String, Value> {
        let key = issue["key"].as_str().unwrap().to_string();
        let mut issues = HashMap::new();
        issues.insert(key.clone(), issue);
        let mappings = p.mappings().clone();
        p.process_issues_with_mappings(&issues, &mappings, available, &[])
            .remove(&key)
            .unwrap()
    }

    #[test]
    fn test_ticket_link_shape() {
        let p = processor();
        let row = process_one(&p, sample_issue(), None);
        assert_eq!(
            row["Issue Key"],
            json!({"text": "TP-1", "link": "https://jira.example.com/browse/TP-1"})
        );
    }

    #[test]
    fn test_candidate_field_resolution() {
        let p = processor();
        // Target table only exposes the second candidate.
        let available = vec!["TCG Tickets".to_string(), "Title".to_string()];
        let row = process_one(&p, sample_issue(), Some(&available));
        assert!(row.contains_key("TCG Tickets"));
        assert!(!row.contains_key("Issue Key"));
        // Unresolvable mappings are dropped entirely.
        assert!(!row.contains_key("Status"));
    }

    #[test]
    fn test_excluded_fields_are_dropped() {
        let p = processor();
        let mut issues = HashMap::new();
        issues.insert("TP-1".to_string(), sample_issue());
        let mappings = p.mappings().clone();
        let row = p
            .process_issues_with_mappings(&issues, &mappings, None, &["summary".to_string()])
            .remove("TP-1")
            .unwrap();
        assert!(!row.contains_key("Title"));
        assert!(row.contains_key("Status"));
    }

    #[test]
    fn test_extract_nested() {
        let p = processor();
        let row = process_one(&p, sample_issue(), None);
        assert_eq!(row["Status"], json!("In Progress"));

        let mut issue = sample_issue();
        issue["fields"]["status"] = json!("not an object");
        let row = process_one(&p, issue, None);
        assert_eq!(row["Status"], json!(""));
    }

    #[test]
    fn test_convert_datetime() {
        let p = processor();
        let row = process_one(&p, sample_issue(), None);
        assert_eq!(row["Created"], json!(1672531200000i64));

        let mut issue = sample_issue();
        issue["fields"]["created"] = json!("garbage");
        let row = process_one(&p, issue, None);
        assert_eq!(row["Created"], Value::Null);
    }

    #[test]
    fn test_components_multiselect_and_versions_text() {
        let p = processor();
        let row = process_one(&p, sample_issue(), None);
        assert_eq!(row["Components"], json!(["Backend", "API"]));
        assert_eq!(row["Fix Versions"], json!("1.2, 1.3"));
    }

    #[test]
    fn test_empty_components_multiselect() {
        let p = processor();
        let mut issue = sample_issue();
        issue["fields"]["components"] = json!([]);
        let row = process_one(&p, issue, None);
        assert_eq!(row["Components"], json!([]));
    }

    #[test]
    fn test_links_filtered_by_prefix_rule() {
        let p = processor();
        let row = process_one(&p, sample_issue(), None);
        // TP rule only shows TP links; ICR-9 is filtered out.
        assert_eq!(row["Links"], json!(["TP-2"]));
    }

    #[test]
    fn test_links_default_rule_allows_all() {
        let p = processor();
        let mut issue = sample_issue();
        issue["key"] = json!("OPS-7");
        let row = process_one(&p, issue, None);
        assert_eq!(row["Links"], json!(["TP-2", "ICR-9"]));
    }

    #[test]
    fn test_links_text_mode_formats_relations() {
        let schema: FieldSchema = serde_yaml::from_str(
            "field_mappings:\n  issuelinks:\n    lark_field: Links\n    processor: extract_links\n",
        )
        .unwrap();
        let p = FieldProcessor::new(schema, "https://jira.example.com", IndexMap::new(), None);
        let row = process_one(&p, sample_issue(), None);
        assert_eq!(
            row["Links"],
            json!("blocks: https://jira.example.com/browse/TP-2\nis blocked by: https://jira.example.com/browse/ICR-9")
        );
    }

    #[test]
    fn test_user_without_mapper_is_empty_list() {
        let p = processor();
        let row = process_one(&p, sample_issue(), None);
        assert_eq!(row["Assignee"], json!([]));
    }

    #[test]
    fn test_null_input_passes_through_as_null() {
        let p = processor();
        let mut issue = sample_issue();
        issue["fields"]["summary"] = Value::Null;
        let row = process_one(&p, issue, None);
        assert_eq!(row["Title"], Value::Null);
    }

    #[test]
    fn test_simple_encodes_objects_as_json() {
        let p = processor();
        let mut issue = sample_issue();
        issue["fields"]["summary"] = json!({"a": 1});
        let row = process_one(&p, issue, None);
        assert_eq!(row["Title"], json!("{\"a\":1}"));
    }

    #[test]
    fn test_missing_nested_path_link_is_null() {
        assert_eq!(
            FieldProcessor::extract_raw(&json!({"a": {"b": 2}}), "a.c.d"),
            Value::Null
        );
        assert_eq!(
            FieldProcessor::extract_raw(&json!({"a": {"b": 2}}), "a.b"),
            json!(2)
        );
    }

    #[test]
    fn test_issue_key_prefix() {
        assert_eq!(FieldProcessor::issue_key_prefix("TCG-108387"), "TCG");
        assert_eq!(FieldProcessor::issue_key_prefix(" tp-1 "), "TP");
        assert_eq!(FieldProcessor::issue_key_prefix("NODASH"), "");
        assert_eq!(FieldProcessor::issue_key_prefix(""), "");
    }

    #[test]
    fn test_required_jira_fields_includes_essentials() {
        let p = processor();
        let fields = p.required_jira_fields();
        for essential in ["key", "id", "self", "summary", "issuelinks"] {
            assert!(fields.contains(&essential.to_string()), "missing {essential}");
        }
    }
}
