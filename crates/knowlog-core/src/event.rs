// ABOUTME: Defines the event envelope, the closed set of event kinds, and event metadata.
// ABOUTME: Events are immutable facts appended to an agent's knowledge graph history.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Source recorded on events whose caller did not name one.
pub const DEFAULT_SOURCE: &str = "system";

/// Schema version recorded on events whose caller did not set one.
pub const DEFAULT_VERSION: u32 = 1;

/// The kinds of change that can be recorded against an agent's graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    NodeCreated,
    NodeUpdated,
    NodeDeleted,
    RelationCreated,
    RelationDeleted,
    ObservationsAdded,
    ObservationsRemoved,
    BulkImport,
    SnapshotCreated,
    SnapshotRestored,
}

impl EventType {
    /// Every event kind, in declaration order.
    pub const ALL: [EventType; 10] = [
        EventType::NodeCreated,
        EventType::NodeUpdated,
        EventType::NodeDeleted,
        EventType::RelationCreated,
        EventType::RelationDeleted,
        EventType::ObservationsAdded,
        EventType::ObservationsRemoved,
        EventType::BulkImport,
        EventType::SnapshotCreated,
        EventType::SnapshotRestored,
    ];

    /// The wire name of this kind, e.g. `NODE_CREATED`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::NodeCreated => "NODE_CREATED",
            EventType::NodeUpdated => "NODE_UPDATED",
            EventType::NodeDeleted => "NODE_DELETED",
            EventType::RelationCreated => "RELATION_CREATED",
            EventType::RelationDeleted => "RELATION_DELETED",
            EventType::ObservationsAdded => "OBSERVATIONS_ADDED",
            EventType::ObservationsRemoved => "OBSERVATIONS_REMOVED",
            EventType::BulkImport => "BULK_IMPORT",
            EventType::SnapshotCreated => "SNAPSHOT_CREATED",
            EventType::SnapshotRestored => "SNAPSHOT_RESTORED",
        }
    }

    /// True for kinds that change nodes or relations when folded into state.
    pub fn is_mutating(&self) -> bool {
        !self.is_snapshot_marker()
    }

    /// True for kinds that can change the node set (and so the lookup indexes).
    /// A restore replaces the node projection wholesale.
    pub fn touches_nodes(&self) -> bool {
        matches!(
            self,
            EventType::NodeCreated
                | EventType::NodeUpdated
                | EventType::NodeDeleted
                | EventType::ObservationsAdded
                | EventType::ObservationsRemoved
                | EventType::BulkImport
                | EventType::SnapshotRestored
        )
    }

    /// True for the two kinds that reference a snapshot file.
    pub fn is_snapshot_marker(&self) -> bool {
        matches!(self, EventType::SnapshotCreated | EventType::SnapshotRestored)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    /// Accepts the wire name in any letter case, with `-` or `_` separators.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        EventType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

/// Metadata carried by every event. Unknown keys supplied by callers are kept
/// in `extra` and written back out unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_version() -> u32 {
    DEFAULT_VERSION
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION,
            source: Some(DEFAULT_SOURCE.to_string()),
            correlation_id: None,
            causation_id: None,
            extra: Map::new(),
        }
    }
}

impl EventMetadata {
    /// Merge caller-supplied metadata over the defaults. A caller that leaves
    /// `source` unset still gets the default source.
    pub fn merged(overrides: Option<EventMetadata>) -> Self {
        match overrides {
            None => Self::default(),
            Some(mut metadata) => {
                if metadata.source.is_none() {
                    metadata.source = Some(DEFAULT_SOURCE.to_string());
                }
                metadata
            }
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }
}

/// A single entry of an agent's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub agent_id: String,
    pub event_type: EventType,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl Event {
    /// Build a new event with a fresh id stamped with the current time.
    pub fn new(
        agent_id: impl Into<String>,
        event_type: EventType,
        payload: Value,
        metadata: EventMetadata,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now().timestamp_millis(),
            agent_id: agent_id.into(),
            event_type,
            payload,
            metadata,
        }
    }

    /// True when the payload names `entity_id` through `nodeId`, `relationId` or `id`.
    pub fn references(&self, entity_id: &str) -> bool {
        ["nodeId", "relationId", "id"]
            .iter()
            .any(|key| payload_str(&self.payload, key).as_deref() == Some(entity_id))
    }
}

/// Read a payload field as a string id. Numeric ids are accepted and rendered
/// in decimal so that `{"id": 7}` and `{"id": "7"}` name the same entity.
pub fn payload_str(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The first present field among `keys`, as a string id.
pub fn payload_id(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| payload_str(payload, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_type_uses_screaming_snake_case_on_the_wire() {
        let json = serde_json::to_string(&EventType::ObservationsAdded).unwrap();
        assert_eq!(json, "\"OBSERVATIONS_ADDED\"");

        let parsed: EventType = serde_json::from_str("\"SNAPSHOT_RESTORED\"").unwrap();
        assert_eq!(parsed, EventType::SnapshotRestored);
    }

    #[test]
    fn event_type_parses_loosely_from_cli_input() {
        assert_eq!("node_created".parse::<EventType>().unwrap(), EventType::NodeCreated);
        assert_eq!("bulk-import".parse::<EventType>().unwrap(), EventType::BulkImport);
        assert!("NODE_EXPLODED".parse::<EventType>().is_err());
    }

    #[test]
    fn default_metadata_is_version_one_from_system() {
        let metadata = EventMetadata::merged(None);
        assert_eq!(metadata.version, 1);
        assert_eq!(metadata.source.as_deref(), Some("system"));
    }

    #[test]
    fn caller_metadata_overrides_defaults_but_keeps_default_source() {
        let overrides = EventMetadata {
            version: 3,
            source: None,
            correlation_id: Some("req-9".to_string()),
            causation_id: None,
            extra: Map::new(),
        };
        let metadata = EventMetadata::merged(Some(overrides));
        assert_eq!(metadata.version, 3);
        assert_eq!(metadata.source.as_deref(), Some("system"));
        assert_eq!(metadata.correlation_id.as_deref(), Some("req-9"));
    }

    #[test]
    fn metadata_keeps_unknown_keys() {
        let raw = json!({"version": 2, "source": "parser", "batch": 4});
        let metadata: EventMetadata = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(metadata.extra.get("batch"), Some(&json!(4)));
        assert_eq!(serde_json::to_value(&metadata).unwrap(), raw);
    }

    #[test]
    fn event_serializes_with_camel_case_fields() {
        let event = Event::new(
            "agent-1",
            EventType::NodeCreated,
            json!({"id": "n1"}),
            EventMetadata::default(),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["agentId"], "agent-1");
        assert_eq!(value["eventType"], "NODE_CREATED");
        assert_eq!(value["metadata"]["version"], 1);
        assert!(value["timestamp"].is_i64());
    }

    #[test]
    fn references_matches_node_relation_and_plain_ids() {
        let by_node = Event::new("a", EventType::NodeUpdated, json!({"nodeId": "n1"}), EventMetadata::default());
        let by_relation = Event::new("a", EventType::RelationDeleted, json!({"relationId": "r1"}), EventMetadata::default());
        let by_numeric_id = Event::new("a", EventType::NodeCreated, json!({"id": 42}), EventMetadata::default());

        assert!(by_node.references("n1"));
        assert!(by_relation.references("r1"));
        assert!(by_numeric_id.references("42"));
        assert!(!by_node.references("r1"));
    }
}
