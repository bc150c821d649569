// ABOUTME: Defines GraphState, the current nodes and relations of an agent built from its history.
// ABOUTME: apply() folds one event into the state and reports which entities changed.

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

use crate::event::{Event, EventType, payload_id};
use crate::model::{Node, Relation};
use crate::snapshot::Snapshot;

/// Anything stored in a projection file under an `id` key.
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for Node {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for Relation {
    fn key(&self) -> &str {
        &self.id
    }
}

/// Id-keyed collection that iterates in first-insertion order. Replacing an
/// entry keeps its position; removing and re-inserting moves it to the end.
#[derive(Debug, Clone)]
pub struct OrderedEntities<T> {
    slots: Vec<Option<T>>,
    positions: HashMap<String, usize>,
}

impl<T> Default for OrderedEntities<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            positions: HashMap::new(),
        }
    }
}

impl<T: Keyed> OrderedEntities<T> {
    pub fn upsert(&mut self, entity: T) {
        match self.positions.get(entity.key()) {
            Some(&slot) => self.slots[slot] = Some(entity),
            None => {
                self.positions.insert(entity.key().to_string(), self.slots.len());
                self.slots.push(Some(entity));
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        let slot = self.positions.remove(id)?;
        self.slots[slot].take()
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.positions.get(id).and_then(|&slot| self.slots[slot].as_ref())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().flatten()
    }

    pub fn into_vec(self) -> Vec<T> {
        self.slots.into_iter().flatten().collect()
    }
}

/// One entity-level change produced by folding an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    NodeUpserted(Node),
    NodeRemoved(String),
    RelationUpserted(Relation),
    RelationRemoved(String),
}

/// The current nodes and relations of one agent.
#[derive(Debug, Clone, Default)]
pub struct GraphState {
    pub nodes: OrderedEntities<Node>,
    pub relations: OrderedEntities<Relation>,
}

impl GraphState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from the contents of a snapshot.
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let mut state = Self::new();
        for node in &snapshot.data.nodes {
            state.nodes.upsert(node.clone());
        }
        for relation in &snapshot.data.relations {
            state.relations.upsert(relation.clone());
        }
        state
    }

    /// Fold a single event into the state. Events that reference entities
    /// that do not exist, or that carry an unusable payload, are logged and
    /// leave the state unchanged. Snapshot markers never change state.
    pub fn apply(&mut self, event: &Event) -> Vec<Change> {
        let payload = &event.payload;
        match event.event_type {
            EventType::NodeCreated => match Node::from_payload(payload) {
                Some(node) => vec![self.put_node(node)],
                None => skip(event, "payload is not a node with an id"),
            },
            EventType::NodeUpdated => {
                let Some(id) = payload_id(payload, &["nodeId", "id"]) else {
                    return skip(event, "payload names no node");
                };
                let Some(current) = self.nodes.get(&id) else {
                    return skip(event, "node does not exist");
                };
                match current.merged_with(payload) {
                    Some(node) => vec![self.put_node(node)],
                    None => skip(event, "update does not produce a valid node"),
                }
            }
            EventType::NodeDeleted => {
                let Some(id) = payload_id(payload, &["nodeId", "id"]) else {
                    return skip(event, "payload names no node");
                };
                self.delete_node(&id)
            }
            EventType::RelationCreated => match Relation::from_payload(payload) {
                Some(relation) => vec![self.put_relation(relation)],
                None => skip(event, "payload is not a relation"),
            },
            EventType::RelationDeleted => {
                let id = Relation::from_payload(payload).map(|r| r.id);
                match id {
                    Some(id) if self.relations.remove(&id).is_some() => {
                        vec![Change::RelationRemoved(id)]
                    }
                    Some(_) => skip(event, "relation does not exist"),
                    None => skip(event, "payload names no relation"),
                }
            }
            EventType::ObservationsAdded | EventType::ObservationsRemoved => {
                let adding = event.event_type == EventType::ObservationsAdded;
                self.change_observations(event, adding)
            }
            EventType::BulkImport => self.bulk_import(payload),
            EventType::SnapshotCreated | EventType::SnapshotRestored => Vec::new(),
        }
    }

    fn put_node(&mut self, node: Node) -> Change {
        self.nodes.upsert(node.clone());
        Change::NodeUpserted(node)
    }

    fn put_relation(&mut self, relation: Relation) -> Change {
        self.relations.upsert(relation.clone());
        Change::RelationUpserted(relation)
    }

    /// Remove a node and every relation that points at it.
    fn delete_node(&mut self, id: &str) -> Vec<Change> {
        let Some(node) = self.nodes.remove(id) else {
            warn!(node_id = id, "delete of unknown node ignored");
            return Vec::new();
        };
        let dangling: Vec<String> = self
            .relations
            .iter()
            .filter(|relation| relation.touches(&node))
            .map(|relation| relation.id.clone())
            .collect();

        let mut changes = vec![Change::NodeRemoved(node.id)];
        for relation_id in dangling {
            self.relations.remove(&relation_id);
            changes.push(Change::RelationRemoved(relation_id));
        }
        changes
    }

    fn change_observations(&mut self, event: &Event, adding: bool) -> Vec<Change> {
        let payload = &event.payload;
        let Some(id) = payload_id(payload, &["nodeId", "id"]) else {
            return skip(event, "payload names no node");
        };
        let Some(mut node) = self.nodes.get(&id).cloned() else {
            return skip(event, "node does not exist");
        };
        let observations: Vec<String> = payload
            .get("observations")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();

        if adding {
            for observation in observations {
                if !node.observations.contains(&observation) {
                    node.observations.push(observation);
                }
            }
        } else {
            node.observations.retain(|existing| !observations.contains(existing));
        }
        vec![self.put_node(node)]
    }

    fn bulk_import(&mut self, payload: &Value) -> Vec<Change> {
        let mut changes = Vec::new();
        let items = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        };
        for raw in items("nodes") {
            match Node::from_payload(&raw) {
                Some(node) => changes.push(self.put_node(node)),
                None => warn!("bulk import skipped a node without an id"),
            }
        }
        for raw in items("relations") {
            match Relation::from_payload(&raw) {
                Some(relation) => changes.push(self.put_relation(relation)),
                None => warn!("bulk import skipped an unusable relation"),
            }
        }
        changes
    }
}

fn skip(event: &Event, reason: &str) -> Vec<Change> {
    warn!(
        event_id = %event.id,
        event_type = %event.event_type,
        "event left state unchanged: {}",
        reason
    );
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMetadata;
    use serde_json::json;

    fn event(event_type: EventType, payload: Value) -> Event {
        Event::new("agent-1", event_type, payload, EventMetadata::default())
    }

    fn seeded() -> GraphState {
        let mut state = GraphState::new();
        state.apply(&event(
            EventType::NodeCreated,
            json!({"id": "1", "name": "Parser", "entityType": "struct"}),
        ));
        state.apply(&event(
            EventType::NodeCreated,
            json!({"id": "2", "name": "Lexer", "entityType": "struct"}),
        ));
        state.apply(&event(
            EventType::RelationCreated,
            json!({"from": "Parser", "to": "Lexer", "relationType": "uses"}),
        ));
        state
    }

    #[test]
    fn ordered_entities_keep_first_insertion_position() {
        let mut entities = OrderedEntities::default();
        entities.upsert(Node::new("a", "A", "t"));
        entities.upsert(Node::new("b", "B", "t"));
        entities.upsert(Node::new("a", "A2", "t"));

        let names: Vec<_> = entities.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["A2", "B"]);

        entities.remove("a");
        entities.upsert(Node::new("a", "A3", "t"));
        let names: Vec<_> = entities.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["B", "A3"]);
        assert_eq!(entities.len(), 2);
    }

    #[test]
    fn apply_builds_nodes_and_relations() {
        let state = seeded();
        assert_eq!(state.nodes.len(), 2);
        assert_eq!(state.relations.len(), 1);
        assert!(state.relations.contains("Parser:uses:Lexer"));
    }

    #[test]
    fn update_merges_over_existing_node() {
        let mut state = seeded();
        let changes = state.apply(&event(
            EventType::NodeUpdated,
            json!({"nodeId": "1", "entityType": "enum"}),
        ));

        assert_eq!(changes.len(), 1);
        let node = state.nodes.get("1").unwrap();
        assert_eq!(node.name, "Parser");
        assert_eq!(node.entity_type, "enum");
    }

    #[test]
    fn update_of_missing_node_changes_nothing() {
        let mut state = seeded();
        let changes = state.apply(&event(EventType::NodeUpdated, json!({"nodeId": "404", "name": "x"})));
        assert!(changes.is_empty());
        assert_eq!(state.nodes.len(), 2);
    }

    #[test]
    fn deleting_a_node_drops_its_relations() {
        let mut state = seeded();
        let changes = state.apply(&event(EventType::NodeDeleted, json!({"nodeId": "2"})));

        assert_eq!(
            changes,
            vec![
                Change::NodeRemoved("2".to_string()),
                Change::RelationRemoved("Parser:uses:Lexer".to_string()),
            ]
        );
        assert!(state.relations.is_empty());
    }

    #[test]
    fn relation_delete_by_endpoints() {
        let mut state = seeded();
        let changes = state.apply(&event(
            EventType::RelationDeleted,
            json!({"from": "Parser", "to": "Lexer", "relationType": "uses"}),
        ));
        assert_eq!(changes, vec![Change::RelationRemoved("Parser:uses:Lexer".to_string())]);
    }

    #[test]
    fn observations_are_added_once_and_removed() {
        let mut state = seeded();
        state.apply(&event(
            EventType::ObservationsAdded,
            json!({"nodeId": "1", "observations": ["hot path", "hot path", "recursive"]}),
        ));
        assert_eq!(state.nodes.get("1").unwrap().observations, ["hot path", "recursive"]);

        state.apply(&event(
            EventType::ObservationsRemoved,
            json!({"nodeId": "1", "observations": ["hot path"]}),
        ));
        assert_eq!(state.nodes.get("1").unwrap().observations, ["recursive"]);
    }

    #[test]
    fn bulk_import_upserts_everything() {
        let mut state = GraphState::new();
        let changes = state.apply(&event(
            EventType::BulkImport,
            json!({
                "nodes": [
                    {"id": "1", "name": "A", "entityType": "module"},
                    {"name": "no id"},
                    {"id": "2", "name": "B", "entityType": "module"}
                ],
                "relations": [{"from": "A", "to": "B", "relationType": "imports"}]
            }),
        ));
        assert_eq!(changes.len(), 3);
        assert_eq!(state.nodes.len(), 2);
        assert_eq!(state.relations.len(), 1);
    }

    #[test]
    fn snapshot_markers_do_not_change_state() {
        let mut state = seeded();
        let changes = state.apply(&event(EventType::SnapshotCreated, json!({"snapshotId": "x"})));
        assert!(changes.is_empty());
        assert_eq!(state.nodes.len(), 2);
    }
}
