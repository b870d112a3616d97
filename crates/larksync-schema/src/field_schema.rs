//! Field-mapping schema: which JIRA fields land in which target columns and
//! through which processor. The schema file is append-only from the user's
//! point of view; new fields are added by extending `field_mappings`.

use std::path::Path;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// The target column: a single name, or an ordered candidate list where the
/// first name present in the live table wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LarkFieldTarget {
    One(String),
    Candidates(Vec<String>),
}

impl LarkFieldTarget {
    /// Resolve against the live field list per the declared priority order.
    /// Returns `None` when no declared name exists in the table.
    pub fn resolve<'a>(&'a self, available: Option<&[String]>) -> Option<&'a str> {
        match self {
            LarkFieldTarget::One(name) => match available {
                None => Some(name),
                Some(fields) if fields.iter().any(|f| f == name) => Some(name),
                Some(_) => None,
            },
            LarkFieldTarget::Candidates(candidates) => match available {
                None => candidates.first().map(String::as_str),
                Some(fields) => candidates
                    .iter()
                    .find(|c| fields.iter().any(|f| f == *c))
                    .map(String::as_str),
            },
        }
    }

    pub fn candidates(&self) -> Vec<String> {
        match self {
            LarkFieldTarget::One(name) => vec![name.clone()],
            LarkFieldTarget::Candidates(candidates) => candidates.clone(),
        }
    }
}

/// Output shape selector for multi-valued processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Multiselect,
    Text,
    #[serde(other)]
    Other,
}

/// The closed processor set. Unknown names deserialize to [`ProcessorKind::Unknown`]
/// and behave as `extract_simple`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorKind {
    #[default]
    ExtractSimple,
    ExtractNested,
    ExtractUser,
    ConvertDatetime,
    ExtractComponents,
    ExtractVersions,
    ExtractLinks,
    ExtractLinksFiltered,
    ExtractTicketLink,
    #[serde(other)]
    Unknown,
}

/// One entry of `field_mappings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    pub lark_field: LarkFieldTarget,
    #[serde(default)]
    pub processor: ProcessorKind,
    #[serde(default)]
    pub nested_path: Option<String>,
    #[serde(default)]
    pub field_type: Option<FieldType>,
}

impl FieldMapping {
    pub fn is_multiselect(&self) -> bool {
        matches!(self.field_type, Some(FieldType::Multiselect))
    }
}

/// The whole schema file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldSchema {
    #[serde(default)]
    pub field_mappings: IndexMap<String, FieldMapping>,
}

impl FieldSchema {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading schema file {:?}", path))?;
        let schema: FieldSchema = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing schema file {:?}", path))?;
        for (jira_field, mapping) in &schema.field_mappings {
            if mapping.processor == ProcessorKind::Unknown {
                warn!(jira_field, "unknown processor in schema, falling back to extract_simple");
            }
        }
        Ok(schema)
    }

    /// JIRA fields the schema reads, plus the envelope essentials. Drives the
    /// `fields=` parameter of JIRA searches so only needed data is fetched.
    pub fn required_jira_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self
            .field_mappings
            .keys()
            // Nested paths like status.name query the root field.
            .map(|path| path.split('.').next().unwrap_or(path).to_string())
            .collect();
        for essential in ["key", "id", "self"] {
            fields.push(essential.to_string());
        }
        fields.sort();
        fields.dedup();
        fields
    }

    /// Declared target-column candidates for the `key` mapping; used to find
    /// the ticket column when rebuilding state from a live table.
    pub fn ticket_field_candidates(&self) -> Vec<String> {
        self.field_mappings
            .get("key")
            .map(|m| m.lark_field.candidates())
            .unwrap_or_default()
    }
}
