// ABOUTME: Typed append-only event history per agent, layered on the line store.
// ABOUTME: Appends update projections and notify subscribers; supports queries, replay, and snapshot-then-trim compaction.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use knowlog_core::{Event, EventMetadata, EventType};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use crate::audit::{self, EventStatistics, ValidationReport};
use crate::dispatch::{EventHandler, HandlerId, HandlerRegistry};
use crate::line_store::{
    AgentPaths, CompactionStats, LineStore, LineStoreError, RestoreReport, read_raw_lines,
    snapshot_id_of, write_atomic,
};
use crate::projection::{self, ProjectionError, RebuildReport};

/// Errors that can occur during event log operations.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("line store error: {0}")]
    LineStore(#[from] LineStoreError),

    #[error("projection error: {0}")]
    Projection(#[from] ProjectionError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Filter for `query_events`. Time bounds are epoch milliseconds and both
/// are inclusive. An empty or absent type list matches every kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventQuery {
    pub agent_id: String,
    pub event_types: Option<Vec<EventType>>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl EventQuery {
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Self::default()
        }
    }

    pub fn with_types(mut self, event_types: impl IntoIterator<Item = EventType>) -> Self {
        self.event_types = Some(event_types.into_iter().collect());
        self
    }

    pub fn since(mut self, start_time: i64) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn until(mut self, end_time: i64) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    fn matches(&self, event: &Event) -> bool {
        if let Some(types) = &self.event_types
            && !types.is_empty()
            && !types.contains(&event.event_type)
        {
            return false;
        }
        if self.start_time.is_some_and(|start| event.timestamp < start) {
            return false;
        }
        if self.end_time.is_some_and(|end| event.timestamp > end) {
            return false;
        }
        true
    }
}

/// Watermark of the log at one moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Timestamp of the last event, or the current time for an empty log.
    pub timestamp: i64,
    pub event_count: usize,
}

/// Outcome of a compaction that actually trimmed the log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventCompaction {
    pub snapshot_id: String,
    pub snapshot_path: PathBuf,
    pub events_superseded: usize,
    /// Lines left in the log, including the new SNAPSHOT_CREATED marker.
    pub events_retained: usize,
    /// nodes.jsonl compacted to one line per live node.
    pub nodes: CompactionStats,
    /// relations.jsonl compacted to one line per live relation.
    pub relations: CompactionStats,
}

/// The event log of every agent under one store root.
///
/// Appends for one agent are serialized: the event line and its projection
/// changes are written under the same agent lock, so projection order always
/// follows log order. Subscribers run after the lock is released.
pub struct EventLog {
    store: Arc<LineStore>,
    handlers: HandlerRegistry,
}

impl EventLog {
    pub fn new(store: Arc<LineStore>) -> Self {
        Self {
            store,
            handlers: HandlerRegistry::new(),
        }
    }

    /// The line store this log writes through.
    pub fn store(&self) -> &Arc<LineStore> {
        &self.store
    }

    /// Build an event, append it durably, fold it into the projections, then
    /// hand it to the subscribers of its kind. Caller metadata is merged over
    /// the defaults (version 1, source "system").
    ///
    /// Subscriber failures never fail the append. A projection failure is
    /// logged and left for `rebuild_projections` to repair.
    pub async fn append_event(
        &self,
        agent_id: &str,
        event_type: EventType,
        payload: Value,
        metadata: Option<EventMetadata>,
    ) -> Result<Event, EventLogError> {
        let paths = self.store.agent_paths(agent_id)?;
        let event = Event::new(agent_id, event_type, payload, EventMetadata::merged(metadata));

        let guard = self.agent_lock(&paths).await;
        self.append_locked(&paths, &event).await?;
        drop(guard);

        self.handlers.dispatch(&event).await;
        Ok(event)
    }

    /// Subscribe a handler to one event kind.
    pub async fn on_event(&self, event_type: EventType, handler: Arc<dyn EventHandler>) -> HandlerId {
        self.handlers.register(event_type, handler).await
    }

    /// Remove a subscription. Returns false if it was not registered for that kind.
    pub async fn off_event(&self, event_type: EventType, id: HandlerId) -> bool {
        self.handlers.unregister(event_type, id).await
    }

    /// Scan the log once, in order, collecting the events that match.
    pub async fn query_events(&self, query: &EventQuery) -> Result<Vec<Event>, EventLogError> {
        let paths = self.store.agent_paths(&query.agent_id)?;
        let mut results = Vec::new();
        if query.limit == Some(0) {
            return Ok(results);
        }

        let mut skipped = 0;
        let mut reader = self.store.read_lines::<Event>(&paths.events).await?;
        while let Some(event) = reader.next().await? {
            if !query.matches(&event) {
                continue;
            }
            if skipped < query.offset {
                skipped += 1;
                continue;
            }
            results.push(event);
            if query.limit.is_some_and(|limit| results.len() >= limit) {
                break;
            }
        }
        Ok(results)
    }

    /// The last event in log order whose payload names `entity_id` through
    /// `nodeId`, `relationId` or `id`.
    pub async fn get_latest_event_for_entity(
        &self,
        agent_id: &str,
        entity_id: &str,
    ) -> Result<Option<Event>, EventLogError> {
        let paths = self.store.agent_paths(agent_id)?;
        let mut latest = None;
        let mut reader = self.store.read_lines::<Event>(&paths.events).await?;
        while let Some(event) = reader.next().await? {
            if event.references(entity_id) {
                latest = Some(event);
            }
        }
        Ok(latest)
    }

    /// Re-deliver the events in `[from, to]` to their subscribers, one event
    /// at a time in log order. Returns the number of events replayed.
    pub async fn replay_events(
        &self,
        agent_id: &str,
        from: i64,
        to: Option<i64>,
    ) -> Result<usize, EventLogError> {
        let mut query = EventQuery::for_agent(agent_id).since(from);
        query.end_time = to;
        let events = self.query_events(&query).await?;

        for event in &events {
            self.handlers.dispatch(event).await;
        }
        info!(agent_id, "replayed {} events", events.len());
        Ok(events.len())
    }

    /// Position of the last event currently in the log.
    pub async fn create_checkpoint(&self, agent_id: &str) -> Result<Checkpoint, EventLogError> {
        let paths = self.store.agent_paths(agent_id)?;
        let mut event_count = 0;
        let mut last_timestamp = None;
        let mut reader = self.store.read_lines::<Event>(&paths.events).await?;
        while let Some(event) = reader.next().await? {
            event_count += 1;
            last_timestamp = Some(event.timestamp);
        }
        Ok(Checkpoint {
            timestamp: last_timestamp.unwrap_or_else(|| Utc::now().timestamp_millis()),
            event_count,
        })
    }

    pub async fn get_event_statistics(&self, agent_id: &str) -> Result<EventStatistics, EventLogError> {
        let paths = self.store.agent_paths(agent_id)?;
        Ok(audit::statistics(&self.store, &paths.events).await?)
    }

    pub async fn validate_event_consistency(
        &self,
        agent_id: &str,
    ) -> Result<ValidationReport, EventLogError> {
        let paths = self.store.agent_paths(agent_id)?;
        Ok(audit::validate(&self.store, &paths.events).await?)
    }

    /// Bound the log to its most recent `keep_recent_events` entries.
    ///
    /// Compaction sequence:
    /// 1. Snapshot the current projections
    /// 2. Append a SNAPSHOT_CREATED marker recording how many events it supersedes
    /// 3. Atomically rewrite the log without the superseded events
    ///
    /// Returns None when the log already fits. If the rewrite fails the
    /// original log is left in place, marker included.
    pub async fn compact_event_log(
        &self,
        agent_id: &str,
        keep_recent_events: usize,
    ) -> Result<Option<EventCompaction>, EventLogError> {
        let paths = self.store.agent_paths(agent_id)?;
        let guard = self.agent_lock(&paths).await;

        let mut total = 0;
        let mut reader = self.store.read_lines::<Event>(&paths.events).await?;
        while reader.next().await?.is_some() {
            total += 1;
        }
        if total <= keep_recent_events {
            debug!(agent_id, "{} events within limit {}, nothing to compact", total, keep_recent_events);
            return Ok(None);
        }
        let superseded = total - keep_recent_events;

        let snapshot_path = self.store.create_snapshot(agent_id).await?;
        let snapshot_id = snapshot_id_of(&snapshot_path);
        let marker = Event::new(
            agent_id,
            EventType::SnapshotCreated,
            json!({
                "snapshotId": snapshot_id,
                "snapshotPath": snapshot_path.to_string_lossy(),
                "eventCount": superseded,
                "keptEvents": keep_recent_events,
            }),
            EventMetadata::default(),
        );
        self.append_locked(&paths, &marker).await?;

        let retained = {
            let _events_guard = self.store.lock(&paths.events).await;
            let mut kept = Vec::new();
            let mut dropped_unreadable = 0;
            let mut valid_seen = 0;
            for line in read_raw_lines(&paths.events).await? {
                if serde_json::from_str::<Event>(&line).is_err() {
                    dropped_unreadable += 1;
                    continue;
                }
                valid_seen += 1;
                if valid_seen > superseded {
                    kept.push(line);
                }
            }
            if dropped_unreadable > 0 {
                warn!(agent_id, "compaction dropped {} unreadable event lines", dropped_unreadable);
            }

            let mut contents = Vec::new();
            for line in &kept {
                contents.extend_from_slice(line.as_bytes());
                contents.push(b'\n');
            }
            write_atomic(&paths.events, &contents).await?;
            kept.len()
        };
        let nodes = self.store.compact(&paths.nodes).await?;
        let relations = self.store.compact(&paths.relations).await?;
        drop(guard);

        info!(
            agent_id,
            "compacted event log: {} events superseded by snapshot {}, {} retained",
            superseded,
            snapshot_id,
            retained
        );
        self.handlers.dispatch(&marker).await;

        Ok(Some(EventCompaction {
            snapshot_id,
            snapshot_path,
            events_superseded: superseded,
            events_retained: retained,
            nodes,
            relations,
        }))
    }

    /// Snapshot the projections and record a SNAPSHOT_CREATED marker that
    /// supersedes nothing.
    pub async fn create_snapshot(&self, agent_id: &str) -> Result<PathBuf, EventLogError> {
        let paths = self.store.agent_paths(agent_id)?;
        let guard = self.agent_lock(&paths).await;

        let snapshot_path = self.store.create_snapshot(agent_id).await?;
        let marker = Event::new(
            agent_id,
            EventType::SnapshotCreated,
            json!({
                "snapshotId": snapshot_id_of(&snapshot_path),
                "snapshotPath": snapshot_path.to_string_lossy(),
                "eventCount": 0,
            }),
            EventMetadata::default(),
        );
        self.append_locked(&paths, &marker).await?;
        drop(guard);

        self.handlers.dispatch(&marker).await;
        Ok(snapshot_path)
    }

    /// Restore the projections from a snapshot and record a
    /// SNAPSHOT_RESTORED marker, so later rebuilds start from it.
    pub async fn restore_from_snapshot(
        &self,
        agent_id: &str,
        timestamp: &str,
    ) -> Result<RestoreReport, EventLogError> {
        let paths = self.store.agent_paths(agent_id)?;
        let guard = self.agent_lock(&paths).await;

        let report = self.store.restore_from_snapshot(agent_id, timestamp).await?;
        let marker = Event::new(
            agent_id,
            EventType::SnapshotRestored,
            json!({
                "snapshotId": report.snapshot_id,
                "snapshotPath": report.snapshot_path.to_string_lossy(),
                "nodeCount": report.node_count,
                "relationCount": report.relation_count,
            }),
            EventMetadata::default(),
        );
        self.append_locked(&paths, &marker).await?;
        drop(guard);

        self.handlers.dispatch(&marker).await;
        Ok(report)
    }

    /// Recompute nodes.jsonl and relations.jsonl from the log.
    pub async fn rebuild_projections(&self, agent_id: &str) -> Result<RebuildReport, EventLogError> {
        let paths = self.store.agent_paths(agent_id)?;
        let _guard = self.agent_lock(&paths).await;
        Ok(projection::rebuild(&self.store, agent_id).await?)
    }

    /// Serializes appends and maintenance for one agent.
    async fn agent_lock(&self, paths: &AgentPaths) -> OwnedMutexGuard<()> {
        self.store.lock(&paths.dir).await
    }

    async fn append_locked(&self, paths: &AgentPaths, event: &Event) -> Result<(), EventLogError> {
        self.store.append_line(&paths.events, event).await?;
        debug!(
            agent_id = %event.agent_id,
            event_id = %event.id,
            event_type = %event.event_type,
            "event appended"
        );

        if let Err(e) = projection::apply_event(&self.store, paths, event).await {
            error!(
                agent_id = %event.agent_id,
                event_id = %event.id,
                "failed to project event, projections need a rebuild: {}",
                e
            );
        }
        Ok(())
    }
}
