use serde::Deserialize;

use crate::error::DecodeError;
use crate::feed::FeedEvent;
use crate::types::{
    DemoEvent, LogLevel, LogTags, Migration, MigrationProgress, MigrationStatus, NodeMetrics,
    Topology,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Topology,
    MigrationLifecycle,
    MigrationProgress,
    Logs,
    Demo,
    NodeMetrics,
}

impl Topic {
    fn pattern(&self) -> &'static str {
        match self {
            Self::Topology => "nodes",
            Self::MigrationLifecycle => "migrations",
            Self::MigrationProgress => "migration/+",
            Self::Logs => "logs",
            Self::Demo => "demo",
            Self::NodeMetrics => "metrics/+",
        }
    }
}

/// Log message as broadcast by the backend.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerLog {
    #[serde(default)]
    formatted: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    level: LogLevel,
    #[serde(default)]
    node_id: Option<String>,
    #[serde(default)]
    event: Option<String>,
}

/// Maps wire topics to typed [`FeedEvent`]s.
#[derive(Debug, Clone)]
pub struct TopicMap {
    prefix: String,
    topics: Vec<Topic>,
}

impl TopicMap {
    pub fn new(prefix: &str, include_node_metrics: bool) -> Self {
        let mut topics = vec![
            Topic::Topology,
            Topic::MigrationLifecycle,
            Topic::MigrationProgress,
            Topic::Logs,
            Topic::Demo,
        ];
        if include_node_metrics {
            topics.push(Topic::NodeMetrics);
        }
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            topics,
        }
    }

    /// Subscription filters, one per topic.
    pub fn filters(&self) -> Vec<String> {
        self.topics
            .iter()
            .map(|t| {
                if self.prefix.is_empty() {
                    t.pattern().to_string()
                } else {
                    format!("{}/{}", self.prefix, t.pattern())
                }
            })
            .collect()
    }

    /// Resolve a concrete topic to its logical topic and, for per-entity
    /// topics, the addressed id.
    pub fn classify<'a>(&self, topic: &'a str) -> Option<(Topic, Option<&'a str>)> {
        let rest = if self.prefix.is_empty() {
            topic
        } else {
            topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?
        };

        let resolved = match rest {
            "nodes" => (Topic::Topology, None),
            "migrations" => (Topic::MigrationLifecycle, None),
            "logs" => (Topic::Logs, None),
            "demo" => (Topic::Demo, None),
            _ => {
                if let Some(id) = single_level(rest, "migration/") {
                    (Topic::MigrationProgress, Some(id))
                } else if let Some(id) = single_level(rest, "metrics/") {
                    (Topic::NodeMetrics, Some(id))
                } else {
                    return None;
                }
            }
        };

        if self.topics.contains(&resolved.0) {
            Some(resolved)
        } else {
            None
        }
    }

    pub fn decode(&self, topic: &str, payload: &[u8]) -> Result<FeedEvent, DecodeError> {
        let (kind, id) = self
            .classify(topic)
            .ok_or_else(|| DecodeError::UnknownTopic(topic.to_string()))?;
        let malformed = |source: serde_json::Error| DecodeError::Malformed {
            topic: topic.to_string(),
            source,
        };

        let event = match kind {
            Topic::Topology => {
                let topology: Topology = serde_json::from_slice(payload).map_err(malformed)?;
                FeedEvent::Topology(topology.nodes)
            }
            Topic::MigrationLifecycle => {
                let migration: Migration = serde_json::from_slice(payload).map_err(malformed)?;
                if migration.status == MigrationStatus::Pending {
                    FeedEvent::MigrationCreated(migration)
                } else {
                    FeedEvent::MigrationUpdated(migration)
                }
            }
            Topic::MigrationProgress => {
                let body: MigrationProgress =
                    serde_json::from_slice(payload).map_err(malformed)?;
                let migration_id = id
                    .map(str::to_string)
                    .or(body.migration_id)
                    .unwrap_or_default();
                FeedEvent::MigrationProgress {
                    migration_id,
                    progress: body.progress,
                    message: body.message,
                }
            }
            Topic::Logs => {
                let log: ServerLog = serde_json::from_slice(payload).map_err(malformed)?;
                let message = log.formatted.or(log.message).ok_or_else(|| {
                    malformed(<serde_json::Error as serde::de::Error>::missing_field(
                        "message",
                    ))
                })?;
                FeedEvent::Log {
                    message,
                    level: log.level,
                    tags: LogTags {
                        node_id: log.node_id,
                        event: log.event,
                    },
                }
            }
            Topic::Demo => {
                let event: DemoEvent = serde_json::from_slice(payload).map_err(malformed)?;
                FeedEvent::Demo(event)
            }
            Topic::NodeMetrics => {
                let metrics: NodeMetrics = serde_json::from_slice(payload).map_err(malformed)?;
                FeedEvent::NodeMetrics {
                    node_id: id.unwrap_or_default().to_string(),
                    metrics,
                }
            }
        };
        Ok(event)
    }
}

fn single_level<'a>(rest: &'a str, prefix: &str) -> Option<&'a str> {
    rest.strip_prefix(prefix)
        .filter(|id| !id.is_empty() && !id.contains('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DemoEventKind;
    use serde_json::json;

    fn bytes(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_filters_cover_all_topics() {
        let map = TopicMap::new("topic", true);
        assert_eq!(
            map.filters(),
            vec![
                "topic/nodes",
                "topic/migrations",
                "topic/migration/+",
                "topic/logs",
                "topic/demo",
                "topic/metrics/+",
            ]
        );
        assert_eq!(TopicMap::new("", false).filters().len(), 5);
    }

    #[test]
    fn test_classify() {
        let map = TopicMap::new("topic/", true);
        assert_eq!(map.classify("topic/nodes"), Some((Topic::Topology, None)));
        assert_eq!(
            map.classify("topic/migration/m-42"),
            Some((Topic::MigrationProgress, Some("m-42")))
        );
        assert_eq!(
            map.classify("topic/metrics/node-1"),
            Some((Topic::NodeMetrics, Some("node-1")))
        );
        assert_eq!(map.classify("topic/migration/"), None);
        assert_eq!(map.classify("topic/migration/a/b"), None);
        assert_eq!(map.classify("other/nodes"), None);

        let without_metrics = TopicMap::new("topic", false);
        assert_eq!(without_metrics.classify("topic/metrics/node-1"), None);
    }

    #[test]
    fn test_lifecycle_split_on_pending() {
        let map = TopicMap::new("topic", true);
        let mut record = json!({
            "id": "m1", "type": "STRONG", "sourceNodeId": "a", "targetNodeId": "b",
            "codeId": "c1", "status": "PENDING", "progress": 0, "startTime": 1700000000.0
        });

        let created = map.decode("topic/migrations", &bytes(record.clone())).unwrap();
        assert!(matches!(created, FeedEvent::MigrationCreated(m) if m.id == "m1"));

        record["status"] = json!("IN_PROGRESS");
        let updated = map.decode("topic/migrations", &bytes(record)).unwrap();
        assert!(matches!(updated, FeedEvent::MigrationUpdated(m) if m.status == MigrationStatus::InProgress));
    }

    #[test]
    fn test_topology_without_nodes_is_empty() {
        let map = TopicMap::new("topic", true);
        let event = map.decode("topic/nodes", &bytes(json!({ "timestamp": 1700000000000i64 }))).unwrap();
        assert!(matches!(event, FeedEvent::Topology(nodes) if nodes.is_empty()));
    }

    #[test]
    fn test_progress_takes_id_from_topic() {
        let map = TopicMap::new("topic", true);
        let event = map
            .decode(
                "topic/migration/m9",
                &bytes(json!({ "progress": 40, "message": "Capturing execution state" })),
            )
            .unwrap();
        match event {
            FeedEvent::MigrationProgress { migration_id, progress, message } => {
                assert_eq!(migration_id, "m9");
                assert_eq!(progress, 40);
                assert_eq!(message, "Capturing execution state");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_log_prefers_formatted_text() {
        let map = TopicMap::new("topic", true);
        let event = map
            .decode(
                "topic/logs",
                &bytes(json!({
                    "timestamp": "10:42:01.123",
                    "level": "warning",
                    "nodeId": "node-2",
                    "event": "STATE",
                    "message": "retrying",
                    "formatted": "[node-2] [STATE] - retrying"
                })),
            )
            .unwrap();
        match event {
            FeedEvent::Log { message, level, tags } => {
                assert_eq!(message, "[node-2] [STATE] - retrying");
                assert_eq!(level, LogLevel::Warning);
                assert_eq!(tags.node_id.as_deref(), Some("node-2"));
                assert_eq!(tags.event.as_deref(), Some("STATE"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        let bare = map.decode("topic/logs", &bytes(json!({ "message": "hello" }))).unwrap();
        assert!(matches!(bare, FeedEvent::Log { level: LogLevel::Info, .. }));

        let empty = map.decode("topic/logs", &bytes(json!({ "level": "info" })));
        assert!(matches!(empty, Err(DecodeError::Malformed { .. })));
    }

    #[test]
    fn test_demo_kinds() {
        let map = TopicMap::new("topic", true);
        let event = map
            .decode(
                "topic/demo",
                &bytes(json!({ "type": "demo:warning", "message": "node-3 overloaded", "step": 2 })),
            )
            .unwrap();
        match event {
            FeedEvent::Demo(demo) => {
                assert_eq!(demo.kind, DemoEventKind::Warning);
                assert_eq!(demo.payload.get("step"), Some(&json!(2)));
            }
            other => panic!("unexpected event {:?}", other),
        }

        let other = map
            .decode("topic/demo", &bytes(json!({ "type": "demo:step", "message": "m" })))
            .unwrap();
        assert!(matches!(other, FeedEvent::Demo(d) if d.kind == DemoEventKind::Other("demo:step".into())));
    }

    #[test]
    fn test_malformed_payload() {
        let map = TopicMap::new("topic", true);
        assert!(matches!(
            map.decode("topic/nodes", b"{not json"),
            Err(DecodeError::Malformed { .. })
        ));
        assert!(matches!(
            map.decode("topic/unknown", b"{}"),
            Err(DecodeError::UnknownTopic(_))
        ));
    }
}
