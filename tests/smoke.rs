// ABOUTME: End-to-end smoke test for the full knowlog lifecycle.
// ABOUTME: Tests appends, index subscription, compaction, rebuild, restore, and export/import together.

use std::sync::Arc;

use knowlog_core::{EventType, Node, Relation};
use knowlog_store::{EventLog, EventQuery, IndexBuilder, IndexKind, LineStore, StoreConfig};
use serde_json::json;

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<LineStore>,
    log: EventLog,
    indexes: Arc<IndexBuilder>,
}

/// Helper to wire a store, event log and subscribed index builder in a temp dir.
async fn harness() -> Harness {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(LineStore::new(&StoreConfig::new(dir.path())));
    let log = EventLog::new(Arc::clone(&store));
    let indexes = Arc::new(IndexBuilder::new(Arc::clone(&store)));
    indexes.subscribe(&log).await;
    Harness {
        _dir: dir,
        store,
        log,
        indexes,
    }
}

/// Helper to read the materialized nodes and relations of an agent.
async fn current_graph(store: &LineStore, agent: &str) -> (Vec<Node>, Vec<Relation>) {
    let paths = store.agent_paths(agent).unwrap();
    let state = store.load_graph_state(&paths).await.unwrap();
    (state.nodes.into_vec(), state.relations.into_vec())
}

#[tokio::test]
async fn smoke_test_full_lifecycle() {
    let h = harness().await;
    let agent = "researcher";

    // 1. Build a small graph through the event log
    for (kind, payload) in [
        (EventType::NodeCreated, json!({"id": "1", "name": "Alpha", "entityType": "class"})),
        (EventType::NodeCreated, json!({"id": "2", "name": "Beta", "entityType": "function"})),
        (
            EventType::RelationCreated,
            json!({"id": "r1", "from": "Alpha", "to": "Beta", "relationType": "calls"}),
        ),
        (
            EventType::ObservationsAdded,
            json!({"nodeId": "1", "observations": ["entry point"]}),
        ),
        (EventType::NodeUpdated, json!({"nodeId": "2", "name": "Beta2"})),
    ] {
        h.log.append_event(agent, kind, payload, None).await.unwrap();
    }

    let (nodes, relations) = current_graph(&h.store, agent).await;
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0].observations, ["entry point"]);
    assert_eq!(nodes[1].name, "Beta2");
    assert_eq!(relations.len(), 1);

    // 2. Indexes followed every append
    assert_eq!(
        h.indexes.search_by_index(agent, IndexKind::Name, "Beta").await.unwrap(),
        ["2"]
    );
    assert_eq!(
        h.indexes.search_by_index(agent, IndexKind::Type, "class").await.unwrap(),
        ["1"]
    );

    // 3. Query and validate history
    let created = h
        .log
        .query_events(&EventQuery::for_agent(agent).with_types([EventType::NodeCreated]))
        .await
        .unwrap();
    assert_eq!(created.len(), 2);
    assert!(h.log.validate_event_consistency(agent).await.unwrap().is_valid);

    // 4. Compact down to the two most recent events plus a marker
    let compaction = h.log.compact_event_log(agent, 2).await.unwrap().unwrap();
    assert_eq!(compaction.events_superseded, 3);
    let remaining = h.log.query_events(&EventQuery::for_agent(agent)).await.unwrap();
    assert_eq!(remaining.len(), 3);
    assert_eq!(remaining[0].event_type, EventType::ObservationsAdded);
    assert_eq!(remaining[2].event_type, EventType::SnapshotCreated);

    // 5. Projections can be rebuilt from the compacted log
    let rebuilt = h.log.rebuild_projections(agent).await.unwrap();
    assert_eq!(rebuilt.base_snapshot.as_deref(), Some(compaction.snapshot_id.as_str()));
    assert_eq!(current_graph(&h.store, agent).await, (nodes.clone(), relations.clone()));

    // 6. Deleting a node also removes the relations attached to it
    h.log
        .append_event(agent, EventType::NodeDeleted, json!({"nodeId": "1"}), None)
        .await
        .unwrap();
    let (after_delete, relations_after_delete) = current_graph(&h.store, agent).await;
    assert_eq!(after_delete.len(), 1);
    assert!(relations_after_delete.is_empty());
    assert!(
        h.indexes
            .search_by_index(agent, IndexKind::Name, "Alpha")
            .await
            .unwrap()
            .is_empty()
    );

    // 7. Restore the compaction snapshot
    let restore = h
        .log
        .restore_from_snapshot(agent, &compaction.snapshot_id)
        .await
        .unwrap();
    assert_eq!(restore.backups.len(), 2);
    assert_eq!(current_graph(&h.store, agent).await, (nodes.clone(), relations.clone()));
    assert_eq!(
        h.indexes.search_by_index(agent, IndexKind::Name, "Alpha").await.unwrap(),
        ["1"]
    );

    // 8. Export and import into a second agent
    let export_path = h.store.root().join("researcher-export.json");
    let document = h.store.export_to_json(agent, &export_path).await.unwrap();
    let report = h
        .store
        .import_from_json(&export_path, Some("mirror"))
        .await
        .unwrap();
    assert_eq!(report.event_count, document.statistics.event_count);
    assert_eq!(current_graph(&h.store, "mirror").await, (nodes.clone(), relations.clone()));

    // The import is a rebuild base even though its compacted history stayed behind
    let mirror_rebuild = h.log.rebuild_projections("mirror").await.unwrap();
    assert_eq!(mirror_rebuild.base_snapshot, Some(report.snapshot_id));
    assert_eq!(current_graph(&h.store, "mirror").await, (nodes, relations));

    // 9. Checkpoint and statistics agree with the log
    let checkpoint = h.log.create_checkpoint(agent).await.unwrap();
    let stats = h.log.get_event_statistics(agent).await.unwrap();
    assert_eq!(checkpoint.event_count, stats.total_events);
    assert_eq!(stats.last_event, Some(checkpoint.timestamp));
    assert_eq!(h.store.list_agents().await.unwrap(), ["mirror", "researcher"]);
}
