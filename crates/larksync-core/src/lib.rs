//! Shared types and helpers for the larksync workspace.

pub mod time;
pub mod types;

pub use types::{OpType, SyncOperation, SyncResult};
