// ABOUTME: Append-only JSON Lines storage for an agent's events, projections, and snapshots.
// ABOUTME: Provides serialized appends, resilient lazy reads, tombstone compaction, restore, and export/import.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::Stream;
use knowlog_core::{
    Event, EventMetadata, EventType, ExportData, ExportDocument, GraphState, Node, Relation, Snapshot,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Split};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;

pub const EVENTS_FILE: &str = "events.jsonl";
pub const NODES_FILE: &str = "nodes.jsonl";
pub const RELATIONS_FILE: &str = "relations.jsonl";
pub const SNAPSHOTS_DIR: &str = "snapshots";
pub const INDEXES_DIR: &str = "indexes";

/// Errors that can occur during line store operations.
#[derive(Debug, Error)]
pub enum LineStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid agent id: {0:?}")]
    InvalidAgentId(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),
}

/// Locations of every file kept for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPaths {
    pub dir: PathBuf,
    pub events: PathBuf,
    pub nodes: PathBuf,
    pub relations: PathBuf,
    pub snapshots: PathBuf,
    pub indexes: PathBuf,
}

impl AgentPaths {
    fn new(root: &Path, agent_id: &str) -> Self {
        let dir = root.join(agent_id);
        Self {
            events: dir.join(EVENTS_FILE),
            nodes: dir.join(NODES_FILE),
            relations: dir.join(RELATIONS_FILE),
            snapshots: dir.join(SNAPSHOTS_DIR),
            indexes: dir.join(INDEXES_DIR),
            dir,
        }
    }

    pub fn name_index(&self) -> PathBuf {
        self.indexes.join("name_index.json")
    }

    pub fn type_index(&self) -> PathBuf {
        self.indexes.join("type_index.json")
    }
}

/// Reject agent ids that would escape the storage root or name no directory.
pub fn validate_agent_id(agent_id: &str) -> Result<(), LineStoreError> {
    let bad = agent_id.is_empty()
        || agent_id == "."
        || agent_id == ".."
        || agent_id.contains(['/', '\\', '\0']);
    if bad {
        return Err(LineStoreError::InvalidAgentId(agent_id.to_string()));
    }
    Ok(())
}

/// Size and shape of a stored file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub path: PathBuf,
    pub exists: bool,
    pub size: u64,
    pub line_count: usize,
    pub modified: Option<DateTime<Utc>>,
}

/// Outcome of compacting an id-keyed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionStats {
    pub lines_read: usize,
    pub lines_written: usize,
}

/// Outcome of restoring projections from a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub snapshot_id: String,
    pub snapshot_path: PathBuf,
    pub backups: Vec<PathBuf>,
    pub node_count: usize,
    pub relation_count: usize,
}

/// Outcome of importing an export document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub agent_id: String,
    pub node_count: usize,
    pub relation_count: usize,
    pub event_count: usize,
    /// Snapshot of the imported projections, recorded in the log as the
    /// base for later rebuilds.
    pub snapshot_id: String,
    pub backups: Vec<PathBuf>,
}

/// A forward-only reader over the records of a JSONL file. Lines that are
/// not valid UTF-8 or do not decode as `T` are logged, counted, and skipped.
/// A missing file reads as empty.
pub struct JsonLines<T> {
    path: PathBuf,
    segments: Option<Split<BufReader<File>>>,
    line_number: usize,
    skipped: usize,
    _record: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> JsonLines<T> {
    async fn open(path: &Path) -> Result<Self, LineStoreError> {
        let segments = match File::open(path).await {
            Ok(file) => Some(BufReader::new(file).split(b'\n')),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            segments,
            line_number: 0,
            skipped: 0,
            _record: PhantomData,
        })
    }

    /// Decode the next record, or None at end of file.
    pub async fn next(&mut self) -> Result<Option<T>, LineStoreError> {
        loop {
            let Some(segments) = self.segments.as_mut() else {
                return Ok(None);
            };
            let segment = match segments.next_segment().await {
                Ok(Some(segment)) => segment,
                Ok(None) => {
                    self.segments = None;
                    return Ok(None);
                }
                Err(e) => {
                    self.segments = None;
                    return Err(e.into());
                }
            };
            self.line_number += 1;

            if segment.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<T>(&segment) {
                Ok(record) => return Ok(Some(record)),
                Err(e) => {
                    self.skipped += 1;
                    warn!(
                        path = %self.path.display(),
                        line = self.line_number,
                        "skipping unreadable line: {}",
                        e
                    );
                }
            }
        }
    }

    /// Number of lines skipped so far because they could not be decoded.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// 1-based line number of the most recently read line.
    pub fn line_number(&self) -> usize {
        self.line_number
    }

    /// Adapt this reader into a `Stream` of records.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, LineStoreError>> {
        futures::stream::unfold(self, |mut reader| async move {
            match reader.next().await {
                Ok(Some(record)) => Some((Ok(record), reader)),
                Ok(None) => None,
                Err(e) => Some((Err(e), reader)),
            }
        })
    }
}

/// File-backed JSON Lines store rooted at one directory, with one
/// subdirectory per agent. Writes to the same path from inside this process
/// are serialized; separate processes are not coordinated.
pub struct LineStore {
    root: PathBuf,
    sync_writes: bool,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl LineStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            root: config.root.clone(),
            sync_writes: config.sync_writes,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the file layout for an agent, validating the id first.
    pub fn agent_paths(&self, agent_id: &str) -> Result<AgentPaths, LineStoreError> {
        validate_agent_id(agent_id)?;
        Ok(AgentPaths::new(&self.root, agent_id))
    }

    /// List the agents that have a storage directory, sorted by id.
    pub async fn list_agents(&self) -> Result<Vec<String>, LineStoreError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut agents = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match validate_agent_id(&name) {
                Ok(()) => agents.push(name),
                Err(_) => warn!("skipping unusable directory in store root: {}", name),
            }
        }
        agents.sort();
        Ok(agents)
    }

    /// Acquire the in-process write lock for a path.
    pub(crate) async fn lock(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(path.to_path_buf()).or_default())
        };
        lock.lock_owned().await
    }

    /// Append one record as a single JSON line. Parent directories are
    /// created as needed.
    pub async fn append_line<T: Serialize + ?Sized>(
        &self,
        path: &Path,
        record: &T,
    ) -> Result<(), LineStoreError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let _guard = self.lock(path).await;
        append_bytes(path, line.as_bytes(), self.sync_writes).await
    }

    /// Append several records with one write.
    pub async fn append_lines<T: Serialize>(
        &self,
        path: &Path,
        records: &[T],
    ) -> Result<(), LineStoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buffer = String::new();
        for record in records {
            buffer.push_str(&serde_json::to_string(record)?);
            buffer.push('\n');
        }
        let _guard = self.lock(path).await;
        append_bytes(path, buffer.as_bytes(), self.sync_writes).await
    }

    /// Open a fresh reader over the records of `path`.
    pub async fn read_lines<T: DeserializeOwned>(
        &self,
        path: &Path,
    ) -> Result<JsonLines<T>, LineStoreError> {
        JsonLines::open(path).await
    }

    /// Read every decodable record of `path` into memory.
    pub async fn read_all_lines<T: DeserializeOwned>(
        &self,
        path: &Path,
    ) -> Result<Vec<T>, LineStoreError> {
        let mut reader = JsonLines::open(path).await?;
        let mut records = Vec::new();
        while let Some(record) = reader.next().await? {
            records.push(record);
        }
        Ok(records)
    }

    /// Atomically replace the contents of `path` with the given lines, first
    /// copying the current file aside as `<name>.backup-<timestamp>`. The original stays in place until the
    /// atomic rename, so a failure leaves both copies.
    pub async fn replace_lines_with_backup(
        &self,
        path: &Path,
        lines: &[String],
    ) -> Result<Option<PathBuf>, LineStoreError> {
        let stamp = file_timestamp(Utc::now());
        let _guard = self.lock(path).await;
        let backup = copy_aside(path, &stamp).await?;
        write_atomic(path, &join_lines(lines)).await?;
        Ok(backup)
    }

    /// Atomically write a value as pretty-printed JSON.
    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        path: &Path,
        value: &T,
    ) -> Result<(), LineStoreError> {
        let json = serde_json::to_vec_pretty(value)?;
        let _guard = self.lock(path).await;
        write_atomic(path, &json).await
    }

    /// Read a whole-file JSON document. A missing file is None.
    pub async fn read_json<T: DeserializeOwned>(
        &self,
        path: &Path,
    ) -> Result<Option<T>, LineStoreError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Compact an id-keyed file: keep only the last line per `id`, at the
    /// position of that last line, dropping ids whose last line is a
    /// `deleted: true` tombstone. Lines without an id are kept where they
    /// are; lines that do not parse are dropped.
    /// The rewrite goes through a temp file and an atomic rename.
    pub async fn compact(&self, path: &Path) -> Result<CompactionStats, LineStoreError> {
        let _guard = self.lock(path).await;
        let lines = read_raw_lines(path).await?;
        let lines_read = lines.len();
        if lines_read == 0 {
            return Ok(CompactionStats {
                lines_read: 0,
                lines_written: 0,
            });
        }

        let mut slots: Vec<Option<String>> = Vec::with_capacity(lines_read);
        let mut positions: HashMap<String, usize> = HashMap::new();

        for line in lines {
            let value: Value = match serde_json::from_str(&line) {
                Ok(value) => value,
                Err(e) => {
                    warn!(path = %path.display(), "compaction dropped unreadable line: {}", e);
                    continue;
                }
            };
            let Some(id) = record_id(&value) else {
                slots.push(Some(line));
                continue;
            };
            let deleted = value.get("deleted").and_then(Value::as_bool).unwrap_or(false);

            match (positions.get(&id).copied(), deleted) {
                (Some(slot), true) => {
                    slots[slot] = None;
                    positions.remove(&id);
                }
                (Some(slot), false) => {
                    slots[slot] = None;
                    positions.insert(id, slots.len());
                    slots.push(Some(line));
                }
                (None, true) => {}
                (None, false) => {
                    positions.insert(id, slots.len());
                    slots.push(Some(line));
                }
            }
        }

        let survivors: Vec<String> = slots.into_iter().flatten().collect();
        write_atomic(path, &join_lines(&survivors)).await?;

        info!(
            path = %path.display(),
            "compacted {} lines down to {}",
            lines_read,
            survivors.len()
        );
        Ok(CompactionStats {
            lines_read,
            lines_written: survivors.len(),
        })
    }

    /// Repair a potentially corrupted JSONL file by keeping only complete,
    /// parseable lines. Uses an atomic temp-file + rename. Returns the count
    /// of lines retained.
    pub async fn repair(&self, path: &Path) -> Result<usize, LineStoreError> {
        let _guard = self.lock(path).await;
        if !fs::try_exists(path).await? {
            return Ok(0);
        }
        let valid: Vec<String> = read_raw_lines(path)
            .await?
            .into_iter()
            .filter(|line| serde_json::from_str::<Value>(line).is_ok())
            .collect();
        write_atomic(path, &join_lines(&valid)).await?;
        Ok(valid.len())
    }

    /// Existence, size, line count and modification time of a file.
    pub async fn get_file_metadata(&self, path: &Path) -> Result<FileMetadata, LineStoreError> {
        let meta = match fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(FileMetadata {
                    path: path.to_path_buf(),
                    exists: false,
                    size: 0,
                    line_count: 0,
                    modified: None,
                });
            }
            Err(e) => return Err(e.into()),
        };

        Ok(FileMetadata {
            path: path.to_path_buf(),
            exists: true,
            size: meta.len(),
            line_count: count_lines(path).await?,
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    /// Materialize the current nodes and relations from the projection
    /// files: latest line per id wins, tombstoned ids are absent.
    pub async fn load_graph_state(&self, paths: &AgentPaths) -> Result<GraphState, LineStoreError> {
        let mut state = GraphState::new();

        let mut nodes = JsonLines::<Node>::open(&paths.nodes).await?;
        while let Some(node) = nodes.next().await? {
            if node.deleted {
                state.nodes.remove(&node.id);
            } else {
                state.nodes.upsert(node);
            }
        }

        let mut relations = JsonLines::<Relation>::open(&paths.relations).await?;
        while let Some(relation) = relations.next().await? {
            if relation.deleted {
                state.relations.remove(&relation.id);
            } else {
                state.relations.upsert(relation);
            }
        }

        Ok(state)
    }

    /// Capture the current projections into `snapshots/<timestamp>.json` and
    /// return the file path. The event log is not touched.
    pub async fn create_snapshot(&self, agent_id: &str) -> Result<PathBuf, LineStoreError> {
        let paths = self.agent_paths(agent_id)?;
        let state = self.load_graph_state(&paths).await?;
        fs::create_dir_all(&paths.snapshots).await?;

        // Bump by a millisecond until the name is free so snapshots taken in
        // quick succession never overwrite each other.
        let mut taken_at = Utc::now();
        let path = loop {
            let candidate = paths
                .snapshots
                .join(format!("{}.json", file_timestamp(taken_at)));
            if !fs::try_exists(&candidate).await? {
                break candidate;
            }
            taken_at += Duration::milliseconds(1);
        };

        let snapshot = Snapshot::new(
            agent_id,
            taken_at,
            state.nodes.into_vec(),
            state.relations.into_vec(),
        );
        self.write_json(&path, &snapshot).await?;

        info!(
            agent_id,
            "snapshot {} written with {} nodes and {} relations",
            path.display(),
            snapshot.data.node_count,
            snapshot.data.relation_count
        );
        Ok(path)
    }

    /// Load a snapshot by its timestamp name (with or without `.json`).
    pub async fn load_snapshot(
        &self,
        agent_id: &str,
        timestamp: &str,
    ) -> Result<(PathBuf, Snapshot), LineStoreError> {
        let paths = self.agent_paths(agent_id)?;
        let file_name = snapshot_file_name(timestamp)?;
        let path = paths.snapshots.join(&file_name);
        match fs::read(&path).await {
            Ok(bytes) => Ok((path, serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(LineStoreError::SnapshotNotFound(file_name))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the projections with the contents of a snapshot. Existing
    /// projection files are renamed to `.backup-<timestamp>` first, never
    /// deleted, so a failure part way leaves them available for recovery.
    pub async fn restore_from_snapshot(
        &self,
        agent_id: &str,
        timestamp: &str,
    ) -> Result<RestoreReport, LineStoreError> {
        let paths = self.agent_paths(agent_id)?;
        let (snapshot_path, snapshot) = self.load_snapshot(agent_id, timestamp).await?;
        let stamp = file_timestamp(Utc::now());

        let _nodes_guard = self.lock(&paths.nodes).await;
        let _relations_guard = self.lock(&paths.relations).await;

        let mut backups = Vec::new();
        for path in [&paths.nodes, &paths.relations] {
            if let Some(backup) = back_up(path, &stamp).await? {
                backups.push(backup);
            }
        }

        let node_lines = serialize_lines(&snapshot.data.nodes)?;
        let relation_lines = serialize_lines(&snapshot.data.relations)?;
        append_bytes(&paths.nodes, node_lines.as_bytes(), self.sync_writes).await?;
        append_bytes(&paths.relations, relation_lines.as_bytes(), self.sync_writes).await?;

        let snapshot_id = snapshot_id_of(&snapshot_path);
        info!(
            agent_id,
            "restored snapshot {} ({} nodes, {} relations, {} backups)",
            snapshot_id,
            snapshot.data.nodes.len(),
            snapshot.data.relations.len(),
            backups.len()
        );
        Ok(RestoreReport {
            snapshot_id,
            snapshot_path,
            backups,
            node_count: snapshot.data.nodes.len(),
            relation_count: snapshot.data.relations.len(),
        })
    }

    /// Snapshot file names for an agent, newest first.
    pub async fn list_snapshots(&self, agent_id: &str) -> Result<Vec<String>, LineStoreError> {
        let paths = self.agent_paths(agent_id)?;
        let mut entries = match fs::read_dir(&paths.snapshots).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".json") {
                names.push(name);
            }
        }
        // Timestamp names sort chronologically as strings.
        names.sort_unstable_by(|a, b| b.cmp(a));
        Ok(names)
    }

    /// Delete all but the newest `keep_count` snapshots, returning the names removed.
    pub async fn prune_snapshots(
        &self,
        agent_id: &str,
        keep_count: usize,
    ) -> Result<Vec<String>, LineStoreError> {
        let paths = self.agent_paths(agent_id)?;
        let mut removed = Vec::new();
        for name in self.list_snapshots(agent_id).await?.into_iter().skip(keep_count) {
            fs::remove_file(paths.snapshots.join(&name)).await?;
            debug!(agent_id, "pruned snapshot {}", name);
            removed.push(name);
        }
        if !removed.is_empty() {
            info!(agent_id, "pruned {} snapshots", removed.len());
        }
        Ok(removed)
    }

    /// Write nodes, relations and events of an agent into one JSON document.
    pub async fn export_to_json(
        &self,
        agent_id: &str,
        output: &Path,
    ) -> Result<ExportDocument, LineStoreError> {
        let paths = self.agent_paths(agent_id)?;
        let data = ExportData {
            nodes: self.read_all_lines::<Value>(&paths.nodes).await?,
            relations: self.read_all_lines::<Value>(&paths.relations).await?,
            events: self.read_all_lines::<Value>(&paths.events).await?,
        };
        let document = ExportDocument::new(agent_id, data);
        self.write_json(output, &document).await?;

        info!(
            agent_id,
            "exported {} nodes, {} relations, {} events to {}",
            document.statistics.node_count,
            document.statistics.relation_count,
            document.statistics.event_count,
            output.display()
        );
        Ok(document)
    }

    /// Load an export document into an agent's directory: the document's own
    /// agent unless `target_agent` names another. Existing files are renamed
    /// to `.backup-<timestamp>` before being replaced.
    ///
    /// Snapshot files are not part of an export, so the imported projections
    /// are snapshotted and a SNAPSHOT_RESTORED marker is appended to the
    /// imported log. Rebuilds then start from that state instead of from
    /// markers whose snapshots stayed behind.
    pub async fn import_from_json(
        &self,
        input: &Path,
        target_agent: Option<&str>,
    ) -> Result<ImportReport, LineStoreError> {
        let bytes = fs::read(input).await?;
        let document: ExportDocument = serde_json::from_slice(&bytes)?;
        let agent_id = target_agent.unwrap_or(&document.agent_id).to_string();
        let paths = self.agent_paths(&agent_id)?;
        let stamp = file_timestamp(Utc::now());

        let _events_guard = self.lock(&paths.events).await;
        let _nodes_guard = self.lock(&paths.nodes).await;
        let _relations_guard = self.lock(&paths.relations).await;

        let files = [
            (&paths.nodes, &document.data.nodes),
            (&paths.relations, &document.data.relations),
            (&paths.events, &document.data.events),
        ];

        let mut backups = Vec::new();
        for (path, _) in &files {
            if let Some(backup) = back_up(path, &stamp).await? {
                backups.push(backup);
            }
        }
        for (path, records) in &files {
            write_atomic(path, serialize_lines(records.as_slice())?.as_bytes()).await?;
        }

        let snapshot_path = self.create_snapshot(&agent_id).await?;
        let snapshot_id = snapshot_id_of(&snapshot_path);
        let marker = Event::new(
            agent_id.as_str(),
            EventType::SnapshotRestored,
            json!({
                "snapshotId": snapshot_id,
                "snapshotPath": snapshot_path.to_string_lossy(),
                "nodeCount": document.statistics.node_count,
                "relationCount": document.statistics.relation_count,
                "importedFrom": input.to_string_lossy(),
            }),
            EventMetadata::default().with_source("import"),
        );
        append_bytes(
            &paths.events,
            serialize_lines(std::slice::from_ref(&marker))?.as_bytes(),
            self.sync_writes,
        )
        .await?;

        info!(
            agent_id = %agent_id,
            "imported {} nodes, {} relations, {} events from {}",
            document.data.nodes.len(),
            document.data.relations.len(),
            document.data.events.len(),
            input.display()
        );
        Ok(ImportReport {
            agent_id,
            node_count: document.data.nodes.len(),
            relation_count: document.data.relations.len(),
            event_count: document.data.events.len(),
            snapshot_id,
            backups,
        })
    }
}

/// Format a time the way snapshot and backup names use it: ISO 8601 with
/// dashes in place of colons, e.g. `2026-03-01T12-30-05.000Z`.
pub fn file_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H-%M-%S%.3fZ").to_string()
}

/// The timestamp name of a snapshot file (its file stem).
pub fn snapshot_id_of(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Path of the staging file used by atomic rewrites of `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    with_suffix(path, ".tmp")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn snapshot_file_name(timestamp: &str) -> Result<String, LineStoreError> {
    if timestamp.is_empty() || timestamp.contains(['/', '\\']) || timestamp.starts_with('.') {
        return Err(LineStoreError::SnapshotNotFound(timestamp.to_string()));
    }
    Ok(if timestamp.ends_with(".json") {
        timestamp.to_string()
    } else {
        format!("{timestamp}.json")
    })
}

/// The compaction key of a record: its `id`, when a string or number.
fn record_id(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn serialize_lines<T: Serialize>(records: &[T]) -> Result<String, serde_json::Error> {
    let mut buffer = String::new();
    for record in records {
        buffer.push_str(&serde_json::to_string(record)?);
        buffer.push('\n');
    }
    Ok(buffer)
}

fn join_lines(lines: &[String]) -> Vec<u8> {
    let mut buffer = Vec::new();
    for line in lines {
        buffer.extend_from_slice(line.as_bytes());
        buffer.push(b'\n');
    }
    buffer
}

/// First free `<name>.backup-<stamp>[-n]` name for `path`.
async fn backup_path(path: &Path, stamp: &str) -> Result<PathBuf, LineStoreError> {
    let mut backup = with_suffix(path, &format!(".backup-{stamp}"));
    let mut attempt = 1;
    while fs::try_exists(&backup).await? {
        backup = with_suffix(path, &format!(".backup-{stamp}-{attempt}"));
        attempt += 1;
    }
    Ok(backup)
}

/// Rename `path` aside as `<name>.backup-<stamp>` if it exists.
async fn back_up(path: &Path, stamp: &str) -> Result<Option<PathBuf>, LineStoreError> {
    if !fs::try_exists(path).await? {
        return Ok(None);
    }
    let backup = backup_path(path, stamp).await?;
    fs::rename(path, &backup).await?;
    debug!("backed up {} to {}", path.display(), backup.display());
    Ok(Some(backup))
}

/// Copy `path` aside as `<name>.backup-<stamp>` if it exists, leaving the original.
async fn copy_aside(path: &Path, stamp: &str) -> Result<Option<PathBuf>, LineStoreError> {
    if !fs::try_exists(path).await? {
        return Ok(None);
    }
    let backup = backup_path(path, stamp).await?;
    fs::copy(path, &backup).await?;
    debug!("copied {} to {}", path.display(), backup.display());
    Ok(Some(backup))
}

/// Append raw bytes, creating the file and its parents. An empty buffer
/// still creates the file.
async fn append_bytes(path: &Path, bytes: &[u8], sync: bool) -> Result<(), LineStoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    if sync {
        file.sync_all().await?;
    }
    Ok(())
}

/// Read the non-blank lines of a file as text. Lines that are not valid
/// UTF-8 are skipped. A missing file has no lines.
pub(crate) async fn read_raw_lines(path: &Path) -> Result<Vec<String>, LineStoreError> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut segments = BufReader::new(file).split(b'\n');
    let mut lines = Vec::new();
    let mut line_number = 0;
    while let Some(segment) = segments.next_segment().await? {
        line_number += 1;
        match String::from_utf8(segment) {
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => lines.push(line),
            Err(_) => warn!(
                path = %path.display(),
                line = line_number,
                "skipping line that is not valid UTF-8"
            ),
        }
    }
    Ok(lines)
}

async fn count_lines(path: &Path) -> Result<usize, LineStoreError> {
    let file = File::open(path).await?;
    let mut segments = BufReader::new(file).split(b'\n');
    let mut count = 0;
    while let Some(segment) = segments.next_segment().await? {
        if !segment.iter().all(u8::is_ascii_whitespace) {
            count += 1;
        }
    }
    Ok(count)
}

/// Replace `path` with `contents` via a temp file, fsync, and rename. If any
/// step fails the original file is untouched.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), LineStoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp_path = temp_path(path);
    if let Err(e) = stage_and_swap(&tmp_path, path, contents).await {
        // Best-effort cleanup; the original is intact either way.
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }

    // Fsync the parent directory so the rename itself is durable.
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent).await
    {
        let _ = dir.sync_all().await;
    }
    Ok(())
}

async fn stage_and_swap(tmp_path: &Path, path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut tmp_file = File::create(tmp_path).await?;
    tmp_file.write_all(contents).await?;
    tmp_file.sync_all().await?;
    drop(tmp_file);
    fs::rename(tmp_path, path).await
}
