// ABOUTME: Full-scan statistics and consistency validation over an agent's event log.
// ABOUTME: Validation reports findings as data: errors for broken history, warnings for tolerable oddities.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::DateTime;
use knowlog_core::{Event, EventType};
use serde::Serialize;
use serde_json::Value;

use crate::line_store::{LineStore, LineStoreError};

/// Aggregate counts over an agent's history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStatistics {
    pub total_events: usize,
    pub events_by_type: BTreeMap<EventType, usize>,
    /// Timestamp of the first event in log order.
    pub first_event: Option<i64>,
    /// Timestamp of the last event in log order, matching `create_checkpoint`.
    pub last_event: Option<i64>,
    /// Counts keyed by UTC calendar day, `YYYY-MM-DD`.
    pub events_by_day: BTreeMap<String, usize>,
}

/// A finding that means the log is not a valid history.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ValidationError {
    #[serde(rename_all = "camelCase")]
    DuplicateId {
        id: String,
        line: usize,
        first_line: usize,
    },
    #[serde(rename_all = "camelCase")]
    MissingId { line: usize },
    #[serde(rename_all = "camelCase")]
    MissingEventType { line: usize },
    #[serde(rename_all = "camelCase")]
    UnknownEventType { line: usize, event_type: String },
}

/// A finding worth reporting that does not invalidate the log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ValidationWarning {
    #[serde(rename_all = "camelCase")]
    NonMonotonicTimestamp {
        line: usize,
        timestamp: i64,
        previous: i64,
    },
    #[serde(rename_all = "camelCase")]
    MissingPayload { line: usize },
    #[serde(rename_all = "camelCase")]
    MissingVersion { line: usize },
    #[serde(rename_all = "camelCase")]
    UnreadableLines { count: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

/// Count events by kind and by day, and find the time span of the log.
pub async fn statistics(store: &LineStore, events_path: &Path) -> Result<EventStatistics, LineStoreError> {
    let mut stats = EventStatistics::default();
    let mut reader = store.read_lines::<Event>(events_path).await?;

    while let Some(event) = reader.next().await? {
        stats.total_events += 1;
        *stats.events_by_type.entry(event.event_type).or_default() += 1;

        stats.first_event.get_or_insert(event.timestamp);
        stats.last_event = Some(event.timestamp);

        if let Some(day) = DateTime::from_timestamp_millis(event.timestamp) {
            *stats
                .events_by_day
                .entry(day.format("%Y-%m-%d").to_string())
                .or_default() += 1;
        }
    }
    Ok(stats)
}

/// Check an event log for duplicate ids and malformed entries.
///
/// Errors: duplicate event ids, missing ids, missing or unknown `eventType`.
/// Warnings: timestamps that go backwards, missing `payload`, missing
/// `metadata.version`, and lines that could not be read at all.
pub async fn validate(store: &LineStore, events_path: &Path) -> Result<ValidationReport, LineStoreError> {
    let mut report = ValidationReport::default();
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut previous_timestamp: Option<i64> = None;

    let mut reader = store.read_lines::<Value>(events_path).await?;
    while let Some(raw) = reader.next().await? {
        let line = reader.line_number();

        match raw.get("id").and_then(Value::as_str) {
            Some(id) => match seen.get(id) {
                Some(&first_line) => report.errors.push(ValidationError::DuplicateId {
                    id: id.to_string(),
                    line,
                    first_line,
                }),
                None => {
                    seen.insert(id.to_string(), line);
                }
            },
            None => report.errors.push(ValidationError::MissingId { line }),
        }

        match raw.get("eventType") {
            None | Some(Value::Null) => report.errors.push(ValidationError::MissingEventType { line }),
            Some(kind) => {
                if serde_json::from_value::<EventType>(kind.clone()).is_err() {
                    report.errors.push(ValidationError::UnknownEventType {
                        line,
                        event_type: kind
                            .as_str()
                            .map_or_else(|| kind.to_string(), str::to_string),
                    });
                }
            }
        }

        if let Some(timestamp) = raw.get("timestamp").and_then(Value::as_i64) {
            if let Some(previous) = previous_timestamp
                && timestamp < previous
            {
                report.warnings.push(ValidationWarning::NonMonotonicTimestamp {
                    line,
                    timestamp,
                    previous,
                });
            }
            previous_timestamp = Some(timestamp);
        }

        if matches!(raw.get("payload"), None | Some(Value::Null)) {
            report.warnings.push(ValidationWarning::MissingPayload { line });
        }

        if raw.pointer("/metadata/version").is_none_or(Value::is_null) {
            report.warnings.push(ValidationWarning::MissingVersion { line });
        }
    }

    if reader.skipped() > 0 {
        report.warnings.push(ValidationWarning::UnreadableLines {
            count: reader.skipped(),
        });
    }

    report.is_valid = report.errors.is_empty();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use knowlog_core::EventMetadata;
    use serde_json::json;
    use tempfile::TempDir;

    fn raw_event(id: &str, timestamp: i64, event_type: &str) -> Value {
        json!({
            "id": id,
            "timestamp": timestamp,
            "agentId": "agent-1",
            "eventType": event_type,
            "payload": {"id": "n1"},
            "metadata": {"version": 1, "source": "system"}
        })
    }

    async fn write_log(store: &LineStore, path: &Path, events: &[Value]) {
        for event in events {
            store.append_line(path, event).await.unwrap();
        }
    }

    #[tokio::test]
    async fn clean_log_is_valid() {
        let dir = TempDir::new().unwrap();
        let store = LineStore::new(&StoreConfig::new(dir.path()));
        let path = dir.path().join("events.jsonl");
        for n in 0..3 {
            let event = Event::new("agent-1", EventType::NodeCreated, json!({"id": n}), EventMetadata::default());
            store.append_line(&path, &event).await.unwrap();
        }

        let report = validate(&store, &path).await.unwrap();
        assert!(report.is_valid);
        assert!(report.errors.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn duplicate_ids_are_errors() {
        let dir = TempDir::new().unwrap();
        let store = LineStore::new(&StoreConfig::new(dir.path()));
        let path = dir.path().join("events.jsonl");
        write_log(
            &store,
            &path,
            &[
                raw_event("a", 1, "NODE_CREATED"),
                raw_event("b", 2, "NODE_CREATED"),
                raw_event("a", 3, "NODE_UPDATED"),
            ],
        )
        .await;

        let report = validate(&store, &path).await.unwrap();
        assert!(!report.is_valid);
        assert_eq!(
            report.errors,
            vec![ValidationError::DuplicateId {
                id: "a".to_string(),
                line: 3,
                first_line: 1
            }]
        );
    }

    #[tokio::test]
    async fn backwards_timestamp_is_only_a_warning() {
        let dir = TempDir::new().unwrap();
        let store = LineStore::new(&StoreConfig::new(dir.path()));
        let path = dir.path().join("events.jsonl");
        write_log(
            &store,
            &path,
            &[raw_event("a", 100, "NODE_CREATED"), raw_event("b", 50, "NODE_CREATED")],
        )
        .await;

        let report = validate(&store, &path).await.unwrap();
        assert!(report.is_valid);
        assert_eq!(
            report.warnings,
            vec![ValidationWarning::NonMonotonicTimestamp {
                line: 2,
                timestamp: 50,
                previous: 100
            }]
        );
    }

    #[tokio::test]
    async fn malformed_entries_are_classified() {
        let dir = TempDir::new().unwrap();
        let store = LineStore::new(&StoreConfig::new(dir.path()));
        let path = dir.path().join("events.jsonl");
        write_log(
            &store,
            &path,
            &[
                json!({"id": "a", "timestamp": 1, "payload": {}, "metadata": {"version": 1}}),
                json!({"id": "b", "timestamp": 2, "eventType": "NODE_EXPLODED", "payload": {}, "metadata": {"version": 1}}),
                json!({"id": "c", "timestamp": 3, "eventType": "NODE_CREATED", "metadata": {}}),
            ],
        )
        .await;
        let mut contents = tokio::fs::read_to_string(&path).await.unwrap();
        contents.push_str("{not json\n");
        tokio::fs::write(&path, contents).await.unwrap();

        let report = validate(&store, &path).await.unwrap();
        assert!(!report.is_valid);
        assert_eq!(
            report.errors,
            vec![
                ValidationError::MissingEventType { line: 1 },
                ValidationError::UnknownEventType {
                    line: 2,
                    event_type: "NODE_EXPLODED".to_string()
                },
            ]
        );
        assert_eq!(
            report.warnings,
            vec![
                ValidationWarning::MissingPayload { line: 3 },
                ValidationWarning::MissingVersion { line: 3 },
                ValidationWarning::UnreadableLines { count: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn statistics_count_by_kind_and_day() {
        let dir = TempDir::new().unwrap();
        let store = LineStore::new(&StoreConfig::new(dir.path()));
        let path = dir.path().join("events.jsonl");
        // 2024-01-01T00:00:00Z and one day later.
        let day_one = 1_704_067_200_000;
        let day_two = day_one + 86_400_000;
        write_log(
            &store,
            &path,
            &[
                raw_event("a", day_one + 5, "NODE_CREATED"),
                raw_event("b", day_one + 10, "NODE_CREATED"),
                raw_event("c", day_two, "RELATION_CREATED"),
            ],
        )
        .await;

        let stats = statistics(&store, &path).await.unwrap();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.events_by_type[&EventType::NodeCreated], 2);
        assert_eq!(stats.events_by_type[&EventType::RelationCreated], 1);
        assert_eq!(stats.first_event, Some(day_one + 5));
        assert_eq!(stats.last_event, Some(day_two));
        assert_eq!(stats.events_by_day["2024-01-01"], 2);
        assert_eq!(stats.events_by_day["2024-01-02"], 1);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["eventsByType"]["NODE_CREATED"], 2);
    }

    #[tokio::test]
    async fn statistics_span_follows_log_order() {
        let dir = TempDir::new().unwrap();
        let store = LineStore::new(&StoreConfig::new(dir.path()));
        let path = dir.path().join("events.jsonl");
        write_log(
            &store,
            &path,
            &[
                raw_event("a", 500, "NODE_CREATED"),
                raw_event("b", 900, "NODE_CREATED"),
                raw_event("c", 100, "NODE_UPDATED"),
            ],
        )
        .await;

        let stats = statistics(&store, &path).await.unwrap();
        assert_eq!(stats.first_event, Some(500));
        assert_eq!(stats.last_event, Some(100));
    }

    #[tokio::test]
    async fn statistics_of_missing_log_are_empty() {
        let dir = TempDir::new().unwrap();
        let store = LineStore::new(&StoreConfig::new(dir.path()));

        let stats = statistics(&store, &dir.path().join("none.jsonl")).await.unwrap();
        assert_eq!(stats, EventStatistics::default());
    }
}
