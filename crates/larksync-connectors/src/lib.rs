//! REST clients for the two external systems: JIRA (source) and Lark Base
//! (target). Both are internally thread-safe and meant to be shared behind
//! an `Arc` across concurrent table workflows.

pub mod error;
pub mod jira;
pub mod lark;

pub use error::ConnectorError;
pub use jira::JiraClient;
pub use lark::{LarkClient, LarkUser};
