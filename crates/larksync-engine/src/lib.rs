//! The synchronization engine: schema-driven field transformation, user
//! mapping, batched target writes, per-table state, workflow orchestration
//! and the coordinator that ties them together.

pub mod batch;
pub mod cleaner;
pub mod coordinator;
pub mod fields;
pub mod metrics;
pub mod state;
pub mod users;
pub mod workflow;

pub use batch::{BatchOutcome, BatchProcessor, BatchStats};
pub use cleaner::{CleanReport, TableCleaner};
pub use coordinator::{Coordinator, SessionOutcome, TeamOutcome};
pub use fields::FieldProcessor;
pub use metrics::MetricsCollector;
pub use state::{ColdStartSummary, FilterStats, StateManager, COLD_START_MAX_AGE_DAYS};
pub use users::{LookupStats, PendingReport, UserMapper};
pub use workflow::{SyncOutcome, TableSyncSpec, WorkflowManager};
