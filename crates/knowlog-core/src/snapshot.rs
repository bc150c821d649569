// ABOUTME: Point-in-time snapshot and whole-agent export document formats.
// ABOUTME: Both are pretty-printed JSON files written by the store.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Node, Relation};

/// Format version written into snapshots and exports.
pub const FORMAT_VERSION: u32 = 1;

/// A capture of an agent's current nodes and relations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// RFC 3339 creation time, millisecond precision.
    pub timestamp: String,
    pub agent_id: String,
    pub version: u32,
    pub data: SnapshotData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotData {
    pub nodes: Vec<Node>,
    pub relations: Vec<Relation>,
    pub node_count: usize,
    pub relation_count: usize,
}

impl Snapshot {
    pub fn new(
        agent_id: impl Into<String>,
        taken_at: DateTime<Utc>,
        nodes: Vec<Node>,
        relations: Vec<Relation>,
    ) -> Self {
        Self {
            timestamp: taken_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            agent_id: agent_id.into(),
            version: FORMAT_VERSION,
            data: SnapshotData {
                node_count: nodes.len(),
                relation_count: relations.len(),
                nodes,
                relations,
            },
        }
    }
}

/// A portable dump of everything stored for one agent. Records are kept as
/// raw JSON so an export followed by an import is lossless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub export_date: String,
    pub agent_id: String,
    pub version: u32,
    pub data: ExportData,
    pub statistics: ExportStatistics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportData {
    pub nodes: Vec<Value>,
    pub relations: Vec<Value>,
    pub events: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportStatistics {
    pub node_count: usize,
    pub relation_count: usize,
    pub event_count: usize,
}

impl ExportDocument {
    pub fn new(agent_id: impl Into<String>, data: ExportData) -> Self {
        let statistics = ExportStatistics {
            node_count: data.nodes.len(),
            relation_count: data.relations.len(),
            event_count: data.events.len(),
        };
        Self {
            export_date: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            agent_id: agent_id.into(),
            version: FORMAT_VERSION,
            data,
            statistics,
        }
    }
}
