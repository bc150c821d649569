// ABOUTME: Core library for knowlog, containing the event, entity, and snapshot types.
// ABOUTME: This crate defines the shared data model used by the store and its consumers.

pub mod event;
pub mod model;
pub mod snapshot;
pub mod state;

pub use event::{Event, EventMetadata, EventType, UnknownEventType};
pub use model::{Node, Relation};
pub use snapshot::{ExportData, ExportDocument, ExportStatistics, Snapshot, SnapshotData};
pub use state::{Change, GraphState, OrderedEntities};
