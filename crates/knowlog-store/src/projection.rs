// ABOUTME: Keeps nodes.jsonl and relations.jsonl in step with the event log, and rebuilds them from history.
// ABOUTME: Rebuild starts from the newest usable snapshot marker and folds every later event.

use knowlog_core::event::payload_str;
use knowlog_core::model::tombstone;
use std::path::PathBuf;

use knowlog_core::{Change, Event, GraphState};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::line_store::{AgentPaths, LineStore, LineStoreError};

/// Errors that can occur while maintaining projections.
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("line store error: {0}")]
    LineStore(#[from] LineStoreError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(
        "{superseded} events of agent {agent_id} were compacted away and no snapshot covers them; refusing to rebuild"
    )]
    HistoryUnavailable { agent_id: String, superseded: u64 },
}

/// Outcome of rebuilding projections from the event log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildReport {
    /// Snapshot used as the starting state, if any.
    pub base_snapshot: Option<String>,
    pub events_applied: usize,
    pub node_count: usize,
    pub relation_count: usize,
    /// Copies of the projection files taken before they were replaced.
    pub backups: Vec<PathBuf>,
}

/// Fold one appended event into the projection files, appending a line per
/// changed entity (a tombstone for removals). Returns the number of changes.
pub async fn apply_event(
    store: &LineStore,
    paths: &AgentPaths,
    event: &Event,
) -> Result<usize, ProjectionError> {
    if !event.event_type.is_mutating() {
        return Ok(0);
    }

    let mut state = store.load_graph_state(paths).await?;
    let changes = state.apply(event);

    let mut node_lines = Vec::new();
    let mut relation_lines = Vec::new();
    for change in &changes {
        match change {
            Change::NodeUpserted(node) => node_lines.push(serde_json::to_value(node)?),
            Change::NodeRemoved(id) => node_lines.push(tombstone(id)),
            Change::RelationUpserted(relation) => {
                relation_lines.push(serde_json::to_value(relation)?)
            }
            Change::RelationRemoved(id) => relation_lines.push(tombstone(id)),
        }
    }

    store.append_lines(&paths.nodes, &node_lines).await?;
    store.append_lines(&paths.relations, &relation_lines).await?;

    debug!(
        event_id = %event.id,
        event_type = %event.event_type,
        "projected {} changes",
        changes.len()
    );
    Ok(changes.len())
}

/// Recompute the projections of an agent from its event log and atomically
/// replace both projection files, keeping a `.backup-` copy of each.
///
/// Rebuild sequence:
/// 1. Find the newest SNAPSHOT_CREATED / SNAPSHOT_RESTORED marker whose snapshot still exists
/// 2. Start from that snapshot's nodes and relations (or from empty)
/// 3. Fold every event after the marker
/// 4. Write the resulting nodes and relations, one line per entity
///
/// Without a usable snapshot, a log that records compacted events cannot be
/// replayed into the full graph. That case fails with
/// `HistoryUnavailable` and leaves the projection files untouched.
pub async fn rebuild(store: &LineStore, agent_id: &str) -> Result<RebuildReport, ProjectionError> {
    let paths = store.agent_paths(agent_id)?;
    let events: Vec<Event> = store.read_all_lines(&paths.events).await?;

    let mut base: Option<(usize, String, GraphState)> = None;
    for (position, event) in events.iter().enumerate().rev() {
        if !event.event_type.is_snapshot_marker() {
            continue;
        }
        let Some(snapshot_id) = payload_str(&event.payload, "snapshotId") else {
            warn!(event_id = %event.id, "snapshot marker without snapshotId");
            continue;
        };
        match store.load_snapshot(agent_id, &snapshot_id).await {
            Ok((_, snapshot)) => {
                base = Some((position, snapshot_id, GraphState::from_snapshot(&snapshot)));
                break;
            }
            Err(LineStoreError::SnapshotNotFound(_)) => {
                warn!(agent_id, "snapshot {} is gone, looking further back", snapshot_id);
            }
            Err(e) => return Err(e.into()),
        }
    }

    let (start, base_snapshot, mut state) = match base {
        Some((position, snapshot_id, state)) => (position + 1, Some(snapshot_id), state),
        None => {
            let superseded: u64 = events
                .iter()
                .filter(|e| e.event_type.is_snapshot_marker())
                .filter_map(compacted_away)
                .sum();
            if superseded > 0 {
                return Err(ProjectionError::HistoryUnavailable {
                    agent_id: agent_id.to_string(),
                    superseded,
                });
            }
            (0, None, GraphState::new())
        }
    };

    let tail = &events[start.min(events.len())..];
    for event in tail {
        state.apply(event);
    }

    let node_count = state.nodes.len();
    let relation_count = state.relations.len();
    let node_lines = to_lines(state.nodes.iter())?;
    let relation_lines = to_lines(state.relations.iter())?;
    let mut backups = Vec::new();
    for (path, lines) in [(&paths.nodes, &node_lines), (&paths.relations, &relation_lines)] {
        if let Some(backup) = store.replace_lines_with_backup(path, lines).await? {
            backups.push(backup);
        }
    }

    info!(
        agent_id,
        "rebuilt projections from {} events ({} nodes, {} relations)",
        tail.len(),
        node_count,
        relation_count
    );
    Ok(RebuildReport {
        base_snapshot,
        events_applied: tail.len(),
        node_count,
        relation_count,
        backups,
    })
}

/// Number of events a compaction marker says were dropped before it.
fn compacted_away(event: &Event) -> Option<u64> {
    event
        .payload
        .get("eventCount")
        .and_then(Value::as_u64)
        .filter(|count| *count > 0)
}

fn to_lines<'a, T: Serialize + 'a>(
    entities: impl Iterator<Item = &'a T>,
) -> Result<Vec<String>, serde_json::Error> {
    entities.map(serde_json::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use knowlog_core::{EventMetadata, EventType, Node};
    use serde_json::json;
    use tempfile::TempDir;

    fn event(event_type: EventType, payload: Value) -> Event {
        Event::new("agent-1", event_type, payload, EventMetadata::default())
    }

    #[tokio::test]
    async fn apply_event_appends_changed_entities_and_tombstones() {
        let dir = TempDir::new().unwrap();
        let store = LineStore::new(&StoreConfig::new(dir.path()));
        let paths = store.agent_paths("agent-1").unwrap();

        let created = event(EventType::NodeCreated, json!({"id": "1", "name": "Foo", "entityType": "class"}));
        let linked = event(EventType::RelationCreated, json!({"id": "r1", "from": "Foo", "to": "Foo", "relationType": "recurses"}));
        let deleted = event(EventType::NodeDeleted, json!({"nodeId": "1"}));

        assert_eq!(apply_event(&store, &paths, &created).await.unwrap(), 1);
        assert_eq!(apply_event(&store, &paths, &linked).await.unwrap(), 1);
        assert_eq!(apply_event(&store, &paths, &deleted).await.unwrap(), 2);

        let node_lines: Vec<Value> = store.read_all_lines(&paths.nodes).await.unwrap();
        assert_eq!(node_lines.len(), 2);
        assert_eq!(node_lines[1], json!({"id": "1", "deleted": true}));

        let state = store.load_graph_state(&paths).await.unwrap();
        assert!(state.nodes.is_empty());
        assert!(state.relations.is_empty());
    }

    #[tokio::test]
    async fn snapshot_markers_leave_projection_files_alone() {
        let dir = TempDir::new().unwrap();
        let store = LineStore::new(&StoreConfig::new(dir.path()));
        let paths = store.agent_paths("agent-1").unwrap();

        let marker = event(EventType::SnapshotCreated, json!({"snapshotId": "x"}));
        assert_eq!(apply_event(&store, &paths, &marker).await.unwrap(), 0);
        assert!(!tokio::fs::try_exists(&paths.nodes).await.unwrap());
    }

    #[tokio::test]
    async fn rebuild_replays_the_whole_log_without_snapshots() {
        let dir = TempDir::new().unwrap();
        let store = LineStore::new(&StoreConfig::new(dir.path()));
        let paths = store.agent_paths("agent-1").unwrap();

        for e in [
            event(EventType::NodeCreated, json!({"id": "1", "name": "Foo", "entityType": "class"})),
            event(EventType::NodeCreated, json!({"id": "2", "name": "Bar", "entityType": "class"})),
            event(EventType::NodeUpdated, json!({"nodeId": "1", "name": "Foo2"})),
            event(EventType::NodeDeleted, json!({"nodeId": "2"})),
        ] {
            store.append_line(&paths.events, &e).await.unwrap();
        }
        // Stale projection contents that the rebuild must discard.
        store
            .append_line(&paths.nodes, &json!({"id": "zombie", "name": "Z"}))
            .await
            .unwrap();

        let report = rebuild(&store, "agent-1").await.unwrap();
        assert_eq!(report.base_snapshot, None);
        assert_eq!(report.events_applied, 4);
        assert_eq!(report.node_count, 1);

        let nodes: Vec<Node> = store.read_all_lines(&paths.nodes).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "Foo2");

        // The stale file was copied aside; relations.jsonl did not exist.
        assert_eq!(report.backups.len(), 1);
        let backup = tokio::fs::read_to_string(&report.backups[0]).await.unwrap();
        assert!(backup.contains("zombie"));
    }

    #[tokio::test]
    async fn rebuild_refuses_when_compacted_history_has_no_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = LineStore::new(&StoreConfig::new(dir.path()));
        let paths = store.agent_paths("agent-1").unwrap();

        for e in [
            event(EventType::NodeCreated, json!({"id": "4", "name": "Kept", "entityType": "class"})),
            event(EventType::SnapshotCreated, json!({"snapshotId": "pruned", "eventCount": 3})),
        ] {
            store.append_line(&paths.events, &e).await.unwrap();
        }
        for n in 1..=4 {
            store
                .append_line(&paths.nodes, &json!({"id": n.to_string(), "name": "N", "entityType": "class"}))
                .await
                .unwrap();
        }
        let before = tokio::fs::read_to_string(&paths.nodes).await.unwrap();

        let err = rebuild(&store, "agent-1").await.unwrap_err();
        assert!(matches!(
            err,
            ProjectionError::HistoryUnavailable { superseded: 3, .. }
        ));
        assert_eq!(tokio::fs::read_to_string(&paths.nodes).await.unwrap(), before);
        assert!(!tokio::fs::try_exists(&paths.relations).await.unwrap());
    }

    #[tokio::test]
    async fn rebuild_starts_from_the_latest_available_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = LineStore::new(&StoreConfig::new(dir.path()));
        let paths = store.agent_paths("agent-1").unwrap();

        // Projection state at snapshot time, captured by a real snapshot file.
        store
            .append_line(&paths.nodes, &json!({"id": "1", "name": "Snap", "entityType": "class"}))
            .await
            .unwrap();
        let snapshot_path = store.create_snapshot("agent-1").await.unwrap();
        let snapshot_id = crate::line_store::snapshot_id_of(&snapshot_path);

        for e in [
            event(EventType::SnapshotCreated, json!({"snapshotId": "missing-one"})),
            event(EventType::SnapshotCreated, json!({"snapshotId": snapshot_id.clone(), "eventCount": 10})),
            event(EventType::NodeCreated, json!({"id": "2", "name": "After", "entityType": "class"})),
            event(EventType::SnapshotCreated, json!({"snapshotId": "pruned-later"})),
        ] {
            store.append_line(&paths.events, &e).await.unwrap();
        }

        let report = rebuild(&store, "agent-1").await.unwrap();
        assert_eq!(report.base_snapshot.as_deref(), Some(snapshot_id.as_str()));
        assert_eq!(report.events_applied, 2);
        assert_eq!(report.node_count, 2);

        let names: Vec<String> = store
            .read_all_lines::<Node>(&paths.nodes)
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.name)
            .collect();
        assert_eq!(names, ["Snap", "After"]);
    }
}
