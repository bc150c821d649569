// ABOUTME: Defines the Node and Relation entities stored in an agent's graph projections.
// ABOUTME: Each entity is keyed by `id`; a record with `deleted: true` is a tombstone.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::event::payload_id;

/// An entity in the knowledge graph (a class, a function, a person...).
/// Fields other than the well-known ones are preserved in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub entity_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub observations: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Node {
    pub fn new(id: impl Into<String>, name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            entity_type: entity_type.into(),
            observations: Vec::new(),
            deleted: false,
            extra: Map::new(),
        }
    }

    /// Build a node from an event payload. The id may be given as `id` or
    /// `nodeId`; returns None when neither is present.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let id = payload_id(payload, &["id", "nodeId"])?;
        let mut fields = payload.as_object()?.clone();
        fields.remove("nodeId");
        fields.insert("id".to_string(), Value::String(id));
        serde_json::from_value(Value::Object(fields)).ok()
    }

    /// Overlay the fields of an update payload onto this node. The id never
    /// changes; `nodeId` is an addressing key, not a field.
    pub fn merged_with(&self, update: &Value) -> Option<Self> {
        let mut fields = match serde_json::to_value(self).ok()? {
            Value::Object(map) => map,
            _ => return None,
        };
        for (key, value) in update.as_object()? {
            if key == "id" || key == "nodeId" {
                continue;
            }
            fields.insert(key.clone(), value.clone());
        }
        serde_json::from_value(Value::Object(fields)).ok()
    }
}

/// A directed, typed edge between two nodes. `from` and `to` hold node names
/// or ids, whichever the producer used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub from: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub to: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub relation_type: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Relation {
    pub fn new(from: impl Into<String>, to: impl Into<String>, relation_type: impl Into<String>) -> Self {
        let from = from.into();
        let to = to.into();
        let relation_type = relation_type.into();
        Self {
            id: Self::derive_id(&from, &relation_type, &to),
            from,
            to,
            relation_type,
            deleted: false,
            extra: Map::new(),
        }
    }

    /// Id used for relations whose producer did not supply one.
    pub fn derive_id(from: &str, relation_type: &str, to: &str) -> String {
        format!("{from}:{relation_type}:{to}")
    }

    /// Build a relation from an event payload. The id may be given as `id` or
    /// `relationId`, otherwise it is derived from the endpoints and type.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let mut fields = payload.as_object()?.clone();
        let id = payload_id(payload, &["id", "relationId"]).or_else(|| {
            let from = payload.get("from")?.as_str()?;
            let to = payload.get("to")?.as_str()?;
            let relation_type = payload.get("relationType")?.as_str()?;
            Some(Self::derive_id(from, relation_type, to))
        })?;
        fields.remove("relationId");
        fields.insert("id".to_string(), Value::String(id));
        serde_json::from_value(Value::Object(fields)).ok()
    }

    /// True when either endpoint names the given node (by id or name).
    pub fn touches(&self, node: &Node) -> bool {
        [&node.id, &node.name]
            .iter()
            .any(|key| !key.is_empty() && (self.from == **key || self.to == **key))
    }
}

/// Build the one-line tombstone record for an id.
pub fn tombstone(id: &str) -> Value {
    serde_json::json!({ "id": id, "deleted": true })
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Read an explicit `null` the same as an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}
