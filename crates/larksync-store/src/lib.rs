//! Embedded SQLite stores: per-table processing log, process-global user
//! cache, and the metrics store.

pub mod metrics_store;
pub mod processing_log;
pub mod user_cache;

pub use metrics_store::{MetricsStore, SessionMetrics, TableMetrics};
pub use processing_log::{LogEntry, LogStats, ProcessingLog};
pub use user_cache::{CacheStats, UserCache, UserMapping};
