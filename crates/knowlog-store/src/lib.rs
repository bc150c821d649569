// ABOUTME: Storage core for knowlog: JSONL line store, event log with subscribers, projections, and indexes.
// ABOUTME: Everything lives under one explicit root directory with a subdirectory per agent.

pub mod audit;
pub mod config;
pub mod dispatch;
pub mod event_log;
pub mod index;
pub mod line_store;
pub mod projection;

pub use audit::{EventStatistics, ValidationError, ValidationReport, ValidationWarning};
pub use config::{ConfigError, StoreConfig};
pub use dispatch::{DispatchReport, EventHandler, HandlerError, HandlerId, HandlerRegistry, handler_fn};
pub use event_log::{Checkpoint, EventCompaction, EventLog, EventLogError, EventQuery};
pub use index::{IndexBuilder, IndexError, IndexKind, Indexes, UnknownIndexKind};
pub use line_store::{
    AgentPaths, CompactionStats, FileMetadata, ImportReport, JsonLines, LineStore, LineStoreError,
    RestoreReport,
};
pub use projection::{ProjectionError, RebuildReport};
