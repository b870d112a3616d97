//! Configuration file and field-mapping schema models.

pub mod config;
pub mod field_schema;

pub use config::{
    Config, ConfigError, GlobalConfig, IssueLinkRule, JiraConfig, LarkBaseConfig, TableConfig,
    TeamConfig, UserMappingConfig,
};
pub use field_schema::{FieldMapping, FieldSchema, FieldType, LarkFieldTarget, ProcessorKind};
