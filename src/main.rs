// ABOUTME: Entry point for the knowlog binary.
// ABOUTME: Parses CLI arguments, initializes tracing, runs one store operation and prints the result as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use knowlog_core::{EventMetadata, EventType};
use knowlog_store::{EventLog, EventQuery, IndexBuilder, IndexKind, LineStore, StoreConfig};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Inspect and maintain per-agent knowledge graph storage
#[derive(Parser)]
#[command(name = "knowlog")]
#[command(version)]
struct Cli {
    /// Storage root (overrides KNOWLOG_HOME)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List agents with a storage directory
    Agents,
    /// Append one event
    Append {
        agent: String,
        /// Event kind, e.g. NODE_CREATED
        event_type: EventType,
        /// JSON payload
        payload: String,
        /// Metadata source (default: system)
        #[arg(long)]
        source: Option<String>,
    },
    /// Query the event log
    Events {
        agent: String,
        /// Only these kinds (repeatable)
        #[arg(long = "type")]
        types: Vec<EventType>,
        /// Inclusive lower bound, epoch millis or RFC 3339
        #[arg(long, value_parser = parse_time)]
        since: Option<i64>,
        /// Inclusive upper bound, epoch millis or RFC 3339
        #[arg(long, value_parser = parse_time)]
        until: Option<i64>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Last event that references an entity
    Latest { agent: String, entity_id: String },
    /// Current end of the log
    Checkpoint { agent: String },
    /// Event counts by kind and day
    Stats { agent: String },
    /// Check the log for duplicate ids and malformed events
    Validate { agent: String },
    /// Snapshot, trim the event log to its most recent events, and compact the projections
    Compact {
        agent: String,
        /// Events to keep (default: KNOWLOG_KEEP_RECENT_EVENTS)
        #[arg(long)]
        keep: Option<usize>,
    },
    /// Drop unreadable lines from every file of an agent
    Repair { agent: String },
    /// Snapshot the current projections
    Snapshot { agent: String },
    /// List snapshots, newest first
    Snapshots { agent: String },
    /// Delete old snapshots
    Prune {
        agent: String,
        /// Snapshots to keep (default: KNOWLOG_SNAPSHOT_KEEP)
        #[arg(long)]
        keep: Option<usize>,
    },
    /// Restore projections from a snapshot
    Restore { agent: String, snapshot: String },
    /// Recompute projections from the event log
    Rebuild { agent: String },
    /// Rebuild the name and type indexes
    Reindex { agent: String },
    /// Search an index by exact key, then by substring
    Search {
        agent: String,
        kind: IndexKind,
        query: String,
    },
    /// Write nodes, relations and events to one JSON document
    Export { agent: String, output: PathBuf },
    /// Load an export document, backing up existing files
    Import {
        input: PathBuf,
        /// Target agent (default: the document's agent)
        #[arg(long)]
        agent: Option<String>,
    },
    /// Size and line counts of an agent's files
    Metadata { agent: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("knowlog=info,knowlog_store=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = StoreConfig::from_env()?;
    if let Some(home) = cli.home {
        config.root = home;
    }
    tracing::debug!(root = %config.root.display(), "knowlog starting");

    run(cli.command, &config).await
}

async fn run(command: Commands, config: &StoreConfig) -> Result<()> {
    let store = Arc::new(LineStore::new(config));
    let log = EventLog::new(Arc::clone(&store));
    let indexes = Arc::new(IndexBuilder::new(Arc::clone(&store)));
    indexes.subscribe(&log).await;

    match command {
        Commands::Agents => print_json(&store.list_agents().await?),
        Commands::Append {
            agent,
            event_type,
            payload,
            source,
        } => {
            let payload = serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let metadata = source.map(|s| EventMetadata::default().with_source(s));
            let event = log.append_event(&agent, event_type, payload, metadata).await?;
            print_json(&event)
        }
        Commands::Events {
            agent,
            types,
            since,
            until,
            limit,
            offset,
        } => {
            let query = EventQuery {
                agent_id: agent,
                event_types: (!types.is_empty()).then_some(types),
                start_time: since,
                end_time: until,
                limit,
                offset,
            };
            print_json(&log.query_events(&query).await?)
        }
        Commands::Latest { agent, entity_id } => {
            print_json(&log.get_latest_event_for_entity(&agent, &entity_id).await?)
        }
        Commands::Checkpoint { agent } => print_json(&log.create_checkpoint(&agent).await?),
        Commands::Stats { agent } => print_json(&log.get_event_statistics(&agent).await?),
        Commands::Validate { agent } => print_json(&log.validate_event_consistency(&agent).await?),
        Commands::Compact { agent, keep } => {
            let keep = keep.unwrap_or(config.keep_recent_events);
            print_json(&log.compact_event_log(&agent, keep).await?)
        }
        Commands::Repair { agent } => {
            let paths = store.agent_paths(&agent)?;
            print_json(&json!({
                "events": store.repair(&paths.events).await?,
                "nodes": store.repair(&paths.nodes).await?,
                "relations": store.repair(&paths.relations).await?,
            }))
        }
        Commands::Snapshot { agent } => {
            let path = log.create_snapshot(&agent).await?;
            print_json(&json!({ "snapshotPath": path }))
        }
        Commands::Snapshots { agent } => print_json(&store.list_snapshots(&agent).await?),
        Commands::Prune { agent, keep } => {
            let keep = keep.unwrap_or(config.snapshot_keep);
            print_json(&json!({ "removed": store.prune_snapshots(&agent, keep).await? }))
        }
        Commands::Restore { agent, snapshot } => {
            print_json(&log.restore_from_snapshot(&agent, &snapshot).await?)
        }
        Commands::Rebuild { agent } => {
            let report = log.rebuild_projections(&agent).await?;
            indexes.build_indexes(&agent).await?;
            print_json(&report)
        }
        Commands::Reindex { agent } => print_json(&indexes.rebuild_all_indexes(&agent).await?),
        Commands::Search { agent, kind, query } => {
            print_json(&indexes.search_by_index(&agent, kind, &query).await?)
        }
        Commands::Export { agent, output } => {
            let document = store.export_to_json(&agent, &output).await?;
            print_json(&document.statistics)
        }
        Commands::Import { input, agent } => {
            let report = store.import_from_json(&input, agent.as_deref()).await?;
            indexes.build_indexes(&report.agent_id).await?;
            print_json(&report)
        }
        Commands::Metadata { agent } => {
            let paths = store.agent_paths(&agent)?;
            let mut files = Vec::new();
            for path in [&paths.events, &paths.nodes, &paths.relations] {
                files.push(store.get_file_metadata(path).await?);
            }
            print_json(&files)
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Accept epoch milliseconds or an RFC 3339 timestamp.
fn parse_time(s: &str) -> Result<i64, String> {
    if let Ok(millis) = s.parse::<i64>() {
        return Ok(millis);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.timestamp_millis())
        .map_err(|e| format!("expected epoch millis or RFC 3339, got {s:?}: {e}"))
}
