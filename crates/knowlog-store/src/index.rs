// ABOUTME: Name and type lookup tables derived from an agent's current nodes, persisted as JSON side files.
// ABOUTME: Supports exact-then-substring search and can subscribe itself to node-changing events.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use knowlog_core::{Event, EventType, Node};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::dispatch::{HandlerError, HandlerId, handler_fn};
use crate::event_log::EventLog;
use crate::line_store::{LineStore, LineStoreError};

/// Errors that can occur while building or reading indexes.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("line store error: {0}")]
    LineStore(#[from] LineStoreError),
}

/// Which lookup table to search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Name,
    Type,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IndexKind::Name => "name",
            IndexKind::Type => "type",
        })
    }
}

#[derive(Debug, Error)]
#[error("unknown index kind: {0} (expected name or type)")]
pub struct UnknownIndexKind(pub String);

impl FromStr for IndexKind {
    type Err = UnknownIndexKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "name" => Ok(IndexKind::Name),
            "type" => Ok(IndexKind::Type),
            _ => Err(UnknownIndexKind(s.to_string())),
        }
    }
}

/// Both lookup tables of one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Indexes {
    /// Node name to node id. On a name collision the node whose latest line
    /// comes last in nodes.jsonl wins.
    pub name_index: BTreeMap<String, String>,
    /// Entity type to the ids of its nodes, ordered by each node's latest line.
    pub type_index: BTreeMap<String, Vec<String>>,
}

/// Builds and searches the per-agent index files.
pub struct IndexBuilder {
    store: Arc<LineStore>,
    // Held across read-and-write so concurrent rebuilds never publish stale tables.
    rebuild_lock: Mutex<()>,
}

impl IndexBuilder {
    pub fn new(store: Arc<LineStore>) -> Self {
        Self {
            store,
            rebuild_lock: Mutex::new(()),
        }
    }

    /// Recompute both tables from the current node projection and replace
    /// the index files. Prior contents are discarded entirely.
    ///
    /// Nodes are folded in the order of their latest line in nodes.jsonl, so
    /// a node that was just updated takes a contested name.
    pub async fn build_indexes(&self, agent_id: &str) -> Result<Indexes, IndexError> {
        let paths = self.store.agent_paths(agent_id)?;
        let _guard = self.rebuild_lock.lock().await;

        let mut latest: HashMap<String, (usize, Node)> = HashMap::new();
        let mut reader = self.store.read_lines::<Node>(&paths.nodes).await?;
        let mut position = 0;
        while let Some(node) = reader.next().await? {
            position += 1;
            if node.deleted {
                latest.remove(&node.id);
            } else {
                latest.insert(node.id.clone(), (position, node));
            }
        }
        let mut live: Vec<(usize, Node)> = latest.into_values().collect();
        live.sort_unstable_by_key(|(position, _)| *position);

        let mut indexes = Indexes::default();
        for (_, node) in &live {
            indexes.name_index.insert(node.name.clone(), node.id.clone());
            indexes
                .type_index
                .entry(node.entity_type.clone())
                .or_default()
                .push(node.id.clone());
        }

        self.store.write_json(&paths.name_index(), &indexes.name_index).await?;
        self.store.write_json(&paths.type_index(), &indexes.type_index).await?;

        info!(
            agent_id,
            "rebuilt indexes: {} names, {} types",
            indexes.name_index.len(),
            indexes.type_index.len()
        );
        Ok(indexes)
    }

    /// Bring the indexes up to date after an event. Indexes have no partial
    /// invalidation, so any node-affecting event triggers a full rebuild.
    pub async fn update_index(&self, agent_id: &str, event: &Event) -> Result<(), IndexError> {
        if !event.event_type.touches_nodes() {
            debug!(agent_id, event_type = %event.event_type, "event does not affect indexes");
            return Ok(());
        }
        self.build_indexes(agent_id).await?;
        Ok(())
    }

    /// Same as `build_indexes`.
    pub async fn rebuild_all_indexes(&self, agent_id: &str) -> Result<Indexes, IndexError> {
        self.build_indexes(agent_id).await
    }

    /// Look up ids by exact key, falling back to every key that contains
    /// `query` (case-sensitive). A missing index file yields no results.
    pub async fn search_by_index(
        &self,
        agent_id: &str,
        kind: IndexKind,
        query: &str,
    ) -> Result<Vec<String>, IndexError> {
        let paths = self.store.agent_paths(agent_id)?;
        let ids = match kind {
            IndexKind::Name => {
                let Some(index) = self
                    .store
                    .read_json::<BTreeMap<String, String>>(&paths.name_index())
                    .await?
                else {
                    return Ok(Vec::new());
                };
                match index.get(query) {
                    Some(id) => vec![id.clone()],
                    None => union(
                        index
                            .iter()
                            .filter(|(key, _)| key.contains(query))
                            .map(|(_, id)| id),
                    ),
                }
            }
            IndexKind::Type => {
                let Some(index) = self
                    .store
                    .read_json::<BTreeMap<String, Vec<String>>>(&paths.type_index())
                    .await?
                else {
                    return Ok(Vec::new());
                };
                match index.get(query) {
                    Some(ids) => ids.clone(),
                    None => union(
                        index
                            .iter()
                            .filter(|(key, _)| key.contains(query))
                            .flat_map(|(_, ids)| ids),
                    ),
                }
            }
        };
        Ok(ids)
    }

    /// Register this builder with an event log so every node-affecting
    /// event rebuilds the indexes of its agent.
    pub async fn subscribe(self: &Arc<Self>, log: &EventLog) -> Vec<(EventType, HandlerId)> {
        let mut registrations = Vec::new();
        for event_type in EventType::ALL.into_iter().filter(EventType::touches_nodes) {
            let builder = Arc::clone(self);
            let handler = handler_fn(move |event: Event| {
                let builder = Arc::clone(&builder);
                async move {
                    builder.update_index(&event.agent_id, &event).await?;
                    Ok::<(), HandlerError>(())
                }
            });
            registrations.push((event_type, log.on_event(event_type, handler).await));
        }
        registrations
    }
}

/// First-seen order, without duplicates.
fn union<'a>(ids: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}
